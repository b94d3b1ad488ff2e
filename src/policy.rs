//! Postfix policy delegation: attribute parsing, decision and response.

use crate::greylist::Verdict;
use crate::guard::{Guarded, TimeoutGuard};
use crate::rate_limiter::{Admission, Boundary};
use crate::state::Shared;
use crate::store::RuleSet;
use std::sync::Arc;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

pub const DEFAULT_RESPONSE: &str = "action=DUNNO\n\n";
pub const TIMEOUT_RESPONSE: &str = "action=451 Timeout client\n\n";
pub const GREYLIST_RESPONSE: &str = "action=451 Greylisting activated\n\n";
pub const BLACKLIST_RESPONSE: &str = "action=500 Sender blacklisted\n\n";

/// Longest attribute line accepted. Longer lines are skipped whole.
const MAX_LINE_LENGTH: u64 = 4096;

const REQUEST_ATTR: &str = "request=";
const SENDER_ATTR: &str = "sender=";
const SASL_USERNAME_ATTR: &str = "sasl_username=";
const RECIPIENT_ATTR: &str = "recipient=";
const CLIENT_ADDRESS_ATTR: &str = "client_address=";

/// Attributes of one policy transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyRequest {
    pub saw_request: bool,
    /// Case preserved for logging; folded when used as a rate-limit key.
    pub sasl_username: String,
    pub sender: String,
    pub recipient: String,
    pub client_address: String,
}

impl PolicyRequest {
    /// Applies one `name=value` line. Unknown attributes are ignored.
    pub fn apply(&mut self, line: &str) {
        if line.starts_with(REQUEST_ATTR) {
            self.saw_request = true;
        } else if let Some(value) = line.strip_prefix(SENDER_ATTR) {
            self.sender = value.to_lowercase();
        } else if let Some(value) = line.strip_prefix(SASL_USERNAME_ATTR) {
            self.sasl_username = value.to_string();
        } else if let Some(value) = line.strip_prefix(RECIPIENT_ATTR) {
            self.recipient = value.to_lowercase();
        } else if let Some(value) = line.strip_prefix(CLIENT_ADDRESS_ATTR) {
            self.client_address = value.to_string();
        }
    }

    /// Rate-limit key, or `None` for unauthenticated mail.
    pub fn identity(&self, include_client: bool) -> Option<String> {
        if self.sasl_username.is_empty() {
            return None;
        }
        if include_client && !self.client_address.is_empty() {
            return Some(format!("{}@{}", self.sasl_username, self.client_address));
        }
        Some(self.sasl_username.clone())
    }
}

/// Result of reading attribute lines up to the terminating blank line.
#[derive(Debug, PartialEq, Eq)]
pub enum Transaction {
    Complete(PolicyRequest),
    /// The peer closed mid-transaction, before the blank line.
    Truncated(PolicyRequest),
    /// The peer closed before sending anything.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Dunno,
    Greylisted,
    Blacklisted,
    LimitReached(Admission),
}

impl Decision {
    pub fn response(&self) -> String {
        match self {
            Decision::Dunno => DEFAULT_RESPONSE.to_string(),
            Decision::Greylisted => GREYLIST_RESPONSE.to_string(),
            Decision::Blacklisted => BLACKLIST_RESPONSE.to_string(),
            Decision::LimitReached(admission) => limit_response(admission),
        }
    }
}

pub fn limit_response(admission: &Admission) -> String {
    format!(
        "action=500 Limit reached. You may send {} mails in {} seconds, \
         but you have already sent {}. Please contact support if in doubt.\n\n",
        admission.limit, admission.duration_seconds, admission.count
    )
}

/// Decides one transaction: greylisting for unauthenticated mail, then
/// sender/identity challenge, then the rate limit.
pub fn decide(request: &PolicyRequest, shared: &Shared, rules: &RuleSet) -> Decision {
    if !request.saw_request {
        return Decision::Dunno;
    }

    let identity = match request.identity(rules.settings.identity_includes_client) {
        Some(identity) => identity,
        None => {
            if let Some(greylisting) = &shared.greylisting {
                let verdict = greylisting.engine.check(
                    &request.sender,
                    &request.recipient,
                    &rules.greylist_exceptions,
                );
                if verdict == Verdict::FirstSeen {
                    return Decision::Greylisted;
                }
            }
            return Decision::Dunno;
        }
    };

    if !request.sender.is_empty() && !rules.challenge.challenge(&request.sender) {
        return Decision::Blacklisted;
    }
    if !rules.challenge.challenge(&request.sasl_username) {
        return Decision::Blacklisted;
    }

    let admission = shared.limiter.admit(
        &identity,
        rules.policy_defaults(),
        &rules.limits,
        Boundary::AtLimit,
    );
    if !admission.allowed {
        return Decision::LimitReached(admission);
    }

    log::debug!(
        "{identity}: {} of {} in {}s",
        admission.count,
        admission.limit,
        admission.duration_seconds
    );
    Decision::Dunno
}

pub async fn read_transaction<R>(reader: &mut R) -> std::io::Result<Transaction>
where
    R: AsyncBufRead + Unpin,
{
    let mut request = PolicyRequest::default();
    let mut any_line = false;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let n = (&mut *reader)
            .take(MAX_LINE_LENGTH)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Ok(if any_line {
                Transaction::Truncated(request)
            } else {
                Transaction::Closed
            });
        }
        any_line = true;

        if buf.len() as u64 == MAX_LINE_LENGTH && buf.last() != Some(&b'\n') {
            let skipped = skip_rest_of_line(reader).await?;
            log::debug!(
                "Ignoring attribute line over {MAX_LINE_LENGTH} bytes ({} bytes dropped)",
                buf.len() + skipped
            );
            continue;
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Ok(Transaction::Complete(request));
        }
        request.apply(line);
    }
}

/// Consumes input up to and including the next line feed, or to EOF.
/// Returns the number of bytes dropped.
async fn skip_rest_of_line<R>(reader: &mut R) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut skipped = 0;
    loop {
        let (used, done) = {
            let chunk = reader.fill_buf().await?;
            match chunk.iter().position(|&b| b == b'\n') {
                Some(end) => (end + 1, true),
                None => (chunk.len(), chunk.is_empty()),
            }
        };
        reader.consume(used);
        skipped += used;
        if done {
            return Ok(skipped);
        }
    }
}

/// Serves policy transactions on one connection until the peer closes, a
/// transport error occurs, or a transaction misses its deadline.
pub async fn handle_connection<S>(stream: S, shared: Arc<Shared>) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    loop {
        let rules = shared.store.snapshot();
        let guard = TimeoutGuard::arm(rules.settings.policy_timeout);

        let transaction = match guard.watch(read_transaction(&mut reader)).await {
            Guarded::Completed(transaction) => transaction?,
            Guarded::Expired => {
                log::info!("Policy client timed out");
                TimeoutGuard::expire(&mut writer, TIMEOUT_RESPONSE).await;
                return Ok(());
            }
        };

        let (decision, last) = match transaction {
            Transaction::Closed => return Ok(()),
            Transaction::Truncated(request) => {
                log::debug!("Policy client closed mid-request: {request:?}");
                (Decision::Dunno, true)
            }
            Transaction::Complete(request) => {
                let decision = decide(&request, &shared, &rules);
                log_decision(&request, &decision);
                (decision, false)
            }
        };

        let response = decision.response();
        match guard.watch(writer.write_all(response.as_bytes())).await {
            Guarded::Completed(result) => result?,
            Guarded::Expired => {
                log::info!("Policy client stopped reading, dropping connection");
                return Ok(());
            }
        }

        if last {
            return Ok(());
        }
    }
}

fn log_decision(request: &PolicyRequest, decision: &Decision) {
    match decision {
        Decision::Dunno => log::debug!(
            "DUNNO sasl_username={:?} sender={:?} recipient={:?}",
            request.sasl_username,
            request.sender,
            request.recipient
        ),
        Decision::Greylisted => log::info!(
            "Greylisted sender={:?} recipient={:?}",
            request.sender,
            request.recipient
        ),
        Decision::Blacklisted => log::info!(
            "Blacklisted sasl_username={:?} sender={:?}",
            request.sasl_username,
            request.sender
        ),
        Decision::LimitReached(admission) => log::info!(
            "Limit reached for {:?}: {} of {} in {}s",
            request.sasl_username,
            admission.count,
            admission.limit,
            admission.duration_seconds
        ),
    }
}
