//! First-seen (sender, recipient) deduplication with flat-file persistence.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Joins sender and recipient before hashing. Values come from a
/// line-oriented protocol and can never contain a line feed.
const KEY_SEPARATOR: &str = "\n";

/// Hex SHA-256 of the (sender, recipient) pair.
pub fn greylist_key(sender: &str, recipient: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update(KEY_SEPARATOR.as_bytes());
    hasher.update(recipient.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Recipient is on the exception list.
    Exempt,
    /// Never seen before; the attempt should be deferred.
    FirstSeen,
    Seen,
}

pub struct GreylistEngine {
    seen: Mutex<HashSet<String>>,
}

impl GreylistEngine {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Restores the seen-set from `path`. A missing file starts empty.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let engine = Self::new();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let mut seen = engine.lock();
                seen.extend(
                    content
                        .lines()
                        .map(str::trim)
                        .filter(|key| !key.is_empty())
                        .map(str::to_string),
                );
                log::info!("Loaded {} greylist entries from {}", seen.len(), path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Greylist file {} not found, starting empty", path.display());
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to read greylist file {}", path.display())));
            }
        }
        Ok(engine)
    }

    /// Classifies one delivery attempt, recording first-seen pairs so the
    /// retry passes. Exempt recipients never touch the seen-set.
    pub fn check(&self, sender: &str, recipient: &str, exceptions: &HashSet<String>) -> Verdict {
        if exceptions.contains(&recipient.to_lowercase()) {
            return Verdict::Exempt;
        }

        let key = greylist_key(sender, recipient);
        let mut seen = self.lock();
        if seen.insert(key) {
            log::debug!("First attempt from {sender} to {recipient}");
            return Verdict::FirstSeen;
        }
        Verdict::Seen
    }

    /// `true` only when the pair was seen before; first attempts and exempt
    /// recipients both yield `false`.
    pub fn is_greylisted(
        &self,
        sender: &str,
        recipient: &str,
        exceptions: &HashSet<String>,
    ) -> bool {
        self.check(sender, recipient, exceptions) == Verdict::Seen
    }

    /// Writes every key, one per line, replacing `path` atomically.
    pub fn save(&self, path: &Path) -> anyhow::Result<usize> {
        let keys = self.snapshot();

        let tmp_path = temp_path(path);
        {
            let mut file = std::io::BufWriter::new(std::fs::File::create(&tmp_path)?);
            for key in &keys {
                writeln!(file, "{key}")?;
            }
            file.flush()?;
        }
        std::fs::rename(&tmp_path, path)?;

        Ok(keys.len())
    }

    pub fn snapshot(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().iter().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Sibling of `path` with `.tmp` appended to the full file name.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

impl Default for GreylistEngine {
    fn default() -> Self {
        Self::new()
    }
}
