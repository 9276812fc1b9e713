//! Deadline helpers and default durations.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{ProtocolError, Result};

/// Absolute per-connection deadline, measured from accept
pub const CONNECTION_DEADLINE: Duration = Duration::from_secs(300);

/// Quiet period before a dirty index is rebuilt
pub const REBUILD_DELAY: Duration = Duration::from_secs(5);

/// Upper bound for closing a stream after a session ended
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client-side connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `fut` to completion unless `deadline` passes first
pub async fn with_deadline<F, T>(deadline: Instant, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// Relative variant of [`with_deadline`]
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    with_deadline(Instant::now() + duration, fut).await
}
