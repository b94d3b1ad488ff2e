use crate::config::Config;
use crate::greylist::GreylistEngine;
use crate::rate_limiter::RateLimiter;
use crate::store::ConfigStore;
use anyhow::Context;
use std::path::PathBuf;

/// Greylisting seen-set plus the file it is persisted to.
pub struct Greylisting {
    pub engine: GreylistEngine,
    pub state_file: PathBuf,
}

/// Everything a connection handler needs, built once at startup and shared
/// by reference with every handler task.
pub struct Shared {
    pub store: ConfigStore,
    pub limiter: RateLimiter,
    /// `None` unless greylisting was enabled at startup.
    pub greylisting: Option<Greylisting>,
}

impl Shared {
    pub fn new(store: ConfigStore, greylisting: Option<Greylisting>) -> Self {
        Self {
            store,
            limiter: RateLimiter::new(),
            greylisting,
        }
    }

    /// Loads the rule tables and, when enabled, the persisted greylist.
    /// Any failure here is fatal at startup.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store = ConfigStore::load(config).context("Failed to load rule tables")?;

        let greylisting = if config.greylisting.enabled {
            let state_file = config.greylisting.state_file.clone();
            Some(Greylisting {
                engine: GreylistEngine::load(&state_file)?,
                state_file,
            })
        } else {
            None
        };

        Ok(Self::new(store, greylisting))
    }

    /// Writes the greylist to its state file, if greylisting is enabled.
    pub fn persist_greylist(&self) -> anyhow::Result<()> {
        if let Some(greylisting) = &self.greylisting {
            let saved = greylisting
                .engine
                .save(&greylisting.state_file)
                .with_context(|| {
                    format!(
                        "Failed to save greylist to {}",
                        greylisting.state_file.display()
                    )
                })?;
            log::info!(
                "Saved {saved} greylist entries to {}",
                greylisting.state_file.display()
            );
        }
        Ok(())
    }

    /// Human-readable report of limits, in-window counts and greylist entries.
    pub fn dump_lines(&self) -> Vec<String> {
        let rules = self.store.snapshot();
        let mut lines = Vec::new();

        lines.push(format!(
            "User limits ({} overrides, default {} per {}s):",
            rules.limits.len(),
            rules.settings.policy_mail_count,
            rules.settings.duration_seconds
        ));
        let mut limits: Vec<_> = rules.limits.iter().collect();
        limits.sort_by(|a, b| a.0.cmp(b.0));
        for (identity, limit) in limits {
            lines.push(format!(
                "  {identity} limit={} duration={}s",
                limit.limit, limit.duration_seconds
            ));
        }

        let counts = self.limiter.snapshot();
        lines.push(format!("Current sends in window ({} identities):", counts.len()));
        for (identity, count) in counts {
            lines.push(format!("  {identity} {count}"));
        }

        if let Some(greylisting) = &self.greylisting {
            let keys = greylisting.engine.snapshot();
            lines.push(format!("Greylist entries ({}):", keys.len()));
            for key in keys {
                lines.push(format!("  {key}"));
            }
        }

        lines
    }
}
