//! Wait-for-state primitive shared by every asynchronous provider operation.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::{Error, Result};

/// Canonical state tokens reported by the provider.
pub mod state {
    pub const ACTIVE: &str = "active";
    pub const AVAILABLE: &str = "available";
    pub const DELETED: &str = "deleted";
    pub const ERROR: &str = "error";
    pub const FAILED: &str = "failed";
    pub const IN_USE: &str = "in-use";
    pub const KILLED: &str = "killed";
}

/// Governs a single [`wait_resource`] call.
#[derive(Debug, Clone)]
pub struct WaitSpec {
    pub target: String,
    pub failure_states: Vec<String>,
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// Treat a resource that disappeared as having reached `target`.
    pub allow_missing: bool,
}

impl WaitSpec {
    pub fn new(target: &str, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            target: normalize(target),
            failure_states: vec![state::ERROR.into(), state::FAILED.into()],
            poll_interval,
            timeout,
            allow_missing: false,
        }
    }

    pub fn allow_missing(mut self) -> Self {
        self.allow_missing = true;
        self
    }

    pub fn failing_on(mut self, states: &[&str]) -> Self {
        self.failure_states = states.iter().map(|s| normalize(s)).collect();
        self
    }
}

fn normalize(state: &str) -> String {
    state.trim().to_ascii_lowercase()
}

/// Poll `fetch` until the resource reports `spec.target`.
///
/// `fetch` returns the resource's current status, or `None` once the
/// resource is gone. A failure state ends the wait immediately; running past
/// `spec.timeout` ends it with [`Error::Timeout`].
pub async fn wait_resource<F, Fut>(resource: &str, spec: &WaitSpec, mut fetch: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<String>>>,
{
    let started_at = Instant::now();

    loop {
        let elapsed = started_at.elapsed();
        if elapsed > spec.timeout {
            return Err(Error::Timeout {
                resource: resource.to_string(),
                target: spec.target.clone(),
            });
        }

        let state = match fetch().await? {
            Some(status) => normalize(&status),
            None if spec.allow_missing => {
                info!(resource, target = %spec.target, "resource is gone after {elapsed:?}");
                return Ok(());
            }
            None => return Err(Error::NotFound(format!("{resource} not found"))),
        };

        debug!(resource, state = %state, target = %spec.target, ?elapsed, "waiting for resource");

        if spec.failure_states.contains(&state) {
            return Err(Error::TerminalState {
                resource: resource.to_string(),
                state,
                target: spec.target.clone(),
            });
        }

        if state == spec.target {
            info!(resource, "resource is {} after {elapsed:?}", spec.target);
            return Ok(());
        }

        sleep(spec.poll_interval).await;
    }
}
