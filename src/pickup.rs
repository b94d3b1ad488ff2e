//! Single-line `get <user>` protocol used by the Postfix pickup path.

use crate::guard::{Guarded, TimeoutGuard};
use crate::rate_limiter::{Admission, Boundary};
use crate::state::Shared;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

pub const LIMIT_RESPONSE: &str = "500 Limit reached\n";

const MAX_LINE_LENGTH: u64 = 1024;
const GET_MARKER: &str = "get ";

pub fn ok_response(count: u64) -> String {
    format!("200 OK ({count})\n")
}

/// Extracts the user from a request line; `None` when nothing is left.
pub fn parse_user(line: &str) -> Option<&str> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);
    let user = line.strip_prefix(GET_MARKER).unwrap_or(line);
    (!user.is_empty()).then_some(user)
}

/// Answers the single request of one pickup connection.
pub async fn handle_connection<S>(
    stream: S,
    peer: Option<IpAddr>,
    shared: Arc<Shared>,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let rules = shared.store.snapshot();
    let guard = TimeoutGuard::arm(rules.settings.policy_timeout);
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader).take(MAX_LINE_LENGTH);

    let mut buf = Vec::new();
    let n = match guard.watch(reader.read_until(b'\n', &mut buf)).await {
        Guarded::Completed(n) => n?,
        Guarded::Expired => {
            log::info!("Pickup client timed out");
            return Ok(());
        }
    };
    if n == 0 {
        return Ok(());
    }

    let line = String::from_utf8_lossy(&buf);
    let response = match parse_user(&line) {
        None => {
            log::info!("Pickup request without user");
            LIMIT_RESPONSE.to_string()
        }
        Some(user) => {
            let identity = match peer {
                Some(host) if rules.settings.pickup_per_host => format!("{user}@{host}"),
                _ => user.to_string(),
            };
            let admission = shared.limiter.admit(
                &identity,
                rules.pickup_defaults(),
                &rules.limits,
                Boundary::OverLimit,
            );
            respond(&identity, &admission)
        }
    };

    if let Guarded::Completed(result) = guard.watch(writer.write_all(response.as_bytes())).await {
        result?;
        writer.shutdown().await?;
    }
    Ok(())
}

fn respond(identity: &str, admission: &Admission) -> String {
    if admission.allowed {
        log::debug!("{identity}: {} of {}", admission.count, admission.limit);
        ok_response(admission.count)
    } else {
        log::info!(
            "Pickup limit reached for {identity}: {} of {} in {}s",
            admission.count,
            admission.limit,
            admission.duration_seconds
        );
        LIMIT_RESPONSE.to_string()
    }
}
