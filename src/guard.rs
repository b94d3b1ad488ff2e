//! Deadline enforcement for a single protocol transaction.
//!
//! The guard races the transaction against its deadline with `select!`.
//! Whichever side finishes first wins and the other is dropped, so there is
//! no completion signal that could be sent twice or block a second sender.

use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Upper bound for delivering the timeout reply to a client that stopped reading.
const EXPIRE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Stand-in deadline for timeouts too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug, PartialEq, Eq)]
pub enum Guarded<T> {
    Completed(T),
    Expired,
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutGuard {
    deadline: Instant,
}

impl TimeoutGuard {
    /// Starts the clock for one transaction.
    pub fn arm(timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            deadline: now
                .checked_add(timeout)
                .unwrap_or_else(|| now + FAR_FUTURE),
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Runs `work` until it completes or the deadline passes, whichever is first.
    pub async fn watch<F: Future>(&self, work: F) -> Guarded<F::Output> {
        tokio::select! {
            biased;
            output = work => Guarded::Completed(output),
            _ = tokio::time::sleep_until(self.deadline) => Guarded::Expired,
        }
    }

    /// Sends the timeout reply and closes the write side. Best effort: a
    /// client that does not drain its socket is simply dropped.
    pub async fn expire<W: AsyncWrite + Unpin>(writer: &mut W, response: &str) {
        let reply = async {
            writer.write_all(response.as_bytes()).await?;
            writer.shutdown().await
        };
        match tokio::time::timeout(EXPIRE_WRITE_TIMEOUT, reply).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("Failed to send timeout reply: {e}"),
            Err(_) => log::debug!("Timed out sending timeout reply"),
        }
    }
}
