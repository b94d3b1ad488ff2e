//! Process-wide rule tables, swapped wholesale on reload.

use crate::challenge::SenderChallenge;
use crate::config::Config;
use crate::rate_limiter::UserLimit;
use crate::sources::{self, ListFormat, LoadError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Reloadable scalar settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub duration_seconds: u64,
    pub policy_mail_count: u64,
    pub pickup_mail_count: u64,
    pub policy_timeout: Duration,
    pub identity_includes_client: bool,
    pub pickup_per_host: bool,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Settings {
            duration_seconds: config.duration_seconds,
            policy_mail_count: config.policy.mail_count,
            pickup_mail_count: config.pickup.mail_count,
            policy_timeout: Duration::from_secs(config.policy.timeout_seconds),
            identity_includes_client: config.policy.identity_includes_client,
            pickup_per_host: config.pickup.per_host,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    pub settings: Settings,
    pub challenge: SenderChallenge,
    pub limits: HashMap<String, UserLimit>,
    pub greylist_exceptions: HashSet<String>,
}

impl RuleSet {
    /// Reads every configured source. Absent sources yield empty tables.
    pub fn load(config: &Config) -> Result<Self, LoadError> {
        let settings = Settings::from(config);

        let blacklist = match &config.blacklist {
            Some(source) => sources::load_set(source, ListFormat::Lines)?,
            None => HashSet::new(),
        };
        let whitelist = match &config.whitelist {
            Some(source) => sources::load_set(source, ListFormat::Fields)?,
            None => HashSet::new(),
        };
        let limits = match &config.limits {
            Some(source) => sources::load_limits(source, settings.duration_seconds)?,
            None => HashMap::new(),
        };
        let greylist_exceptions = match &config.greylisting.exceptions {
            Some(source) if config.greylisting.enabled => {
                sources::load_set(source, ListFormat::Lines)?
            }
            _ => HashSet::new(),
        };

        log::debug!(
            "Loaded {} blacklisted, {} whitelisted, {} limits, {} greylist exceptions",
            blacklist.len(),
            whitelist.len(),
            limits.len(),
            greylist_exceptions.len()
        );

        Ok(RuleSet {
            challenge: SenderChallenge {
                blacklist,
                whitelist,
                whitelist_mode: config.whitelist_mode,
            },
            settings,
            limits,
            greylist_exceptions,
        })
    }

    pub fn policy_defaults(&self) -> UserLimit {
        UserLimit {
            limit: self.settings.policy_mail_count,
            duration_seconds: self.settings.duration_seconds,
        }
    }

    pub fn pickup_defaults(&self) -> UserLimit {
        UserLimit {
            limit: self.settings.pickup_mail_count,
            duration_seconds: self.settings.duration_seconds,
        }
    }
}

/// Holder of the current [`RuleSet`]. Readers take an `Arc` snapshot and
/// never observe a partially built table.
pub struct ConfigStore {
    current: RwLock<Arc<RuleSet>>,
}

impl ConfigStore {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(rules)),
        }
    }

    pub fn load(config: &Config) -> Result<Self, LoadError> {
        Ok(Self::new(RuleSet::load(config)?))
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Builds a new rule set from `config` and swaps it in. On error the
    /// previous rule set stays in place.
    pub fn reload(&self, config: &Config) -> Result<(), LoadError> {
        let rules = RuleSet::load(config)?;
        self.replace(rules);
        Ok(())
    }

    pub fn replace(&self, rules: RuleSet) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(rules);
    }
}
