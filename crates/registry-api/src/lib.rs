//! Typed Rust client for the agent settings registry.
//!
//! The registry stores one settings document per VM name under
//! `{endpoint}/servers/{name}/settings`. Reads return the document wrapped in
//! an envelope whose `settings` field is itself JSON-encoded.

mod types;

pub use types::*;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("registry request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("cannot {action} settings for `{server}', got HTTP {status}")]
    Api {
        action: &'static str,
        server: String,
        status: StatusCode,
    },

    #[error("invalid registry response for `{server}': {source}")]
    Decode {
        server: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid registry credentials: {0}")]
    Credentials(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the settings registry REST API.
#[derive(Clone)]
pub struct RegistryClient {
    endpoint: String,
    user: String,
    headers: HeaderMap,
    http: reqwest::Client,
}

impl RegistryClient {
    /// Build a client. An endpoint given without a scheme is treated as
    /// plain `http://`. Credentials are encoded once here and sent with
    /// every request.
    pub fn new(
        endpoint: impl Into<String>,
        user: impl Into<String>,
        password: impl AsRef<str>,
    ) -> Result<Self> {
        let mut endpoint: String = endpoint.into();
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            endpoint = format!("http://{endpoint}");
        }
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let user = user.into();

        let token = STANDARD.encode(format!("{user}:{}", password.as_ref()));
        let mut auth = HeaderValue::from_str(&format!("Basic {token}"))
            .map_err(|e| Error::Credentials(e.to_string()))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(AUTHORIZATION, auth);

        Ok(Self {
            endpoint,
            user,
            headers,
            http: reqwest::Client::new(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    fn url(&self, server: &str) -> String {
        format!("{}/servers/{server}/settings", self.endpoint)
    }

    fn check(resp: &reqwest::Response, action: &'static str, server: &str) -> Result<()> {
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(Error::Api {
                action,
                server: server.to_string(),
                status,
            });
        }
        Ok(())
    }

    // ── Settings ─────────────────────────────────────────────────────

    pub async fn read_settings(&self, server: &str) -> Result<AgentSettings> {
        let resp = self
            .http
            .get(self.url(server))
            .headers(self.headers.clone())
            .send()
            .await?;

        Self::check(&resp, "read", server)?;
        let body = resp.bytes().await?;

        let decode = |source| Error::Decode {
            server: server.to_string(),
            source,
        };
        let envelope: SettingsEnvelope = serde_json::from_slice(&body).map_err(decode)?;
        serde_json::from_str(&envelope.settings).map_err(decode)
    }

    pub async fn update_settings(&self, server: &str, settings: &AgentSettings) -> Result<()> {
        let resp = self
            .http
            .put(self.url(server))
            .headers(self.headers.clone())
            .json(settings)
            .send()
            .await?;

        Self::check(&resp, "update", server)
    }

    pub async fn delete_settings(&self, server: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(server))
            .headers(self.headers.clone())
            .send()
            .await?;

        Self::check(&resp, "delete", server)
    }
}
