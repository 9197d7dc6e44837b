//! Self-identification through the link-local instance metadata service.

use std::time::Duration;

use crate::types::ServerId;
use crate::{Error, Result};

pub const DEFAULT_METADATA_ENDPOINT: &str = "http://169.254.169.254";

const INSTANCE_ID_PATH: &str = "/latest/meta-data/instance-id";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct MetadataClient {
    endpoint: String,
    http: reqwest::Client,
}

impl MetadataClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Configuration(format!("metadata client: {e}")))?;

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Id of the instance this process runs on. Any failure here means the
    /// process is not running where it was configured to run.
    pub async fn instance_id(&self) -> Result<ServerId> {
        let url = format!("{}{INSTANCE_ID_PATH}", self.endpoint);
        let query_failed =
            |e: reqwest::Error| Error::Configuration(format!("cannot query {url}: {e}"));

        let resp = self.http.get(&url).send().await.map_err(query_failed)?;
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::Configuration(format!(
                "cannot query {url}, got HTTP {status}"
            )));
        }

        let id = resp.text().await.map_err(query_failed)?;
        let id = id.trim();
        if id.is_empty() {
            return Err(Error::Configuration(format!("{url} returned an empty instance id")));
        }

        Ok(ServerId(id.to_string()))
    }
}
