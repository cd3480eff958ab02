/**
 * ERRORS - Error taxonomy of the OpsDash core
 *
 * ROLE : a single closed error type shared by the cache, the backend client,
 * the stores and the orchestrator. Cloneable so that one coalesced in-flight
 * computation can hand the same failure to every waiter.
 */

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpsError {
    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),
    #[error("upstream command failed: {0}")]
    UpstreamFailed(String),
    #[error("malformed upstream output: {0}")]
    UpstreamMalformed(String),
    #[error("too many write actions, slow down")]
    RateLimited,
    #[error("forbidden")]
    Forbidden,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl OpsError {
    /// True for failures that come from the backend CLI rather than the caller.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            OpsError::UpstreamTimeout(_) | OpsError::UpstreamFailed(_) | OpsError::UpstreamMalformed(_)
        )
    }
}

impl From<std::io::Error> for OpsError {
    fn from(e: std::io::Error) -> Self {
        OpsError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for OpsError {
    fn from(e: serde_json::Error) -> Self {
        OpsError::Storage(format!("serialization: {e}"))
    }
}

pub type OpsResult<T> = Result<T, OpsError>;
