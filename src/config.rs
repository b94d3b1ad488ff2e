use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default sliding-window length in seconds, shared by both protocols.
    pub duration_seconds: u64,
    /// Only senders listed in the whitelist may send.
    pub whitelist_mode: bool,
    pub policy: PolicyConfig,
    pub pickup: PickupConfig,
    pub greylisting: GreylistConfig,
    pub blacklist: Option<RuleSource>,
    pub whitelist: Option<RuleSource>,
    pub limits: Option<RuleSource>,
    pub pid_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub enabled: bool,
    pub listen: String,
    pub mail_count: u64,
    pub timeout_seconds: u64,
    /// Key the rate limit on `sasl_username@client_address` instead of the bare username.
    pub identity_includes_client: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PickupConfig {
    pub enabled: bool,
    pub listen: String,
    pub mail_count: u64,
    /// Key the rate limit on `<user>@<peer host>`.
    pub per_host: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GreylistConfig {
    pub enabled: bool,
    pub state_file: PathBuf,
    pub exceptions: Option<RuleSource>,
}

/// Where a rule table is loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuleSource {
    File { path: PathBuf },
    Sql { database: PathBuf, query: String },
}

impl Default for Config {
    fn default() -> Self {
        Config {
            duration_seconds: 600,
            whitelist_mode: false,
            policy: PolicyConfig::default(),
            pickup: PickupConfig::default(),
            greylisting: GreylistConfig::default(),
            blacklist: None,
            whitelist: None,
            limits: None,
            pid_file: None,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            enabled: true,
            listen: "127.0.0.1:9443".to_string(),
            mail_count: 30,
            timeout_seconds: 30,
            identity_includes_client: false,
        }
    }
}

impl Default for PickupConfig {
    fn default() -> Self {
        PickupConfig {
            enabled: false,
            listen: "127.0.0.1:9444".to_string(),
            mail_count: 2,
            per_host: true,
        }
    }
}

impl Default for GreylistConfig {
    fn default() -> Self {
        GreylistConfig {
            enabled: false,
            state_file: PathBuf::from("greylist.txt"),
            exceptions: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Anchors every relative file path at `base`, so the paths keep their
    /// meaning after daemon mode changes directory to `/`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let anchor = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };

        anchor(&mut self.greylisting.state_file);
        if let Some(pid_file) = &mut self.pid_file {
            anchor(pid_file);
        }
        let sources = [
            &mut self.blacklist,
            &mut self.whitelist,
            &mut self.limits,
            &mut self.greylisting.exceptions,
        ];
        for source in sources.into_iter().flatten() {
            match source {
                RuleSource::File { path } => anchor(path),
                RuleSource::Sql { database, .. } => anchor(database),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let yaml = r#"
duration_seconds: 60
policy:
  mail_count: 5
blacklist:
  type: File
  path: /etc/postfix/blacklist.txt
limits:
  type: Sql
  database: /var/lib/postfix-protect/rules.db
  query: SELECT username, mail_limit, duration FROM limits
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.duration_seconds, 60);
        assert_eq!(config.policy.mail_count, 5);
        assert_eq!(config.policy.timeout_seconds, 30);
        assert_eq!(config.policy.listen, "127.0.0.1:9443");
        assert!(!config.pickup.enabled);
        assert_eq!(config.pickup.mail_count, 2);
        assert!(!config.greylisting.enabled);
        assert_eq!(
            config.blacklist,
            Some(RuleSource::File {
                path: PathBuf::from("/etc/postfix/blacklist.txt")
            })
        );
        assert!(matches!(config.limits, Some(RuleSource::Sql { .. })));
        assert!(config.whitelist.is_none());
    }

    #[test]
    fn test_resolve_paths_anchors_relative_paths_only() {
        let mut config = Config::default();
        config.pid_file = Some(PathBuf::from("/run/postfix-protect.pid"));
        config.blacklist = Some(RuleSource::File {
            path: PathBuf::from("lists/blacklist.txt"),
        });
        config.limits = Some(RuleSource::Sql {
            database: PathBuf::from("rules.db"),
            query: "SELECT username, mail_limit, duration FROM limits".to_string(),
        });
        config.greylisting.exceptions = Some(RuleSource::File {
            path: PathBuf::from("/etc/postfix/nogreylist.txt"),
        });

        config.resolve_paths(Path::new("/srv/protect"));

        assert_eq!(
            config.greylisting.state_file,
            PathBuf::from("/srv/protect/greylist.txt")
        );
        assert_eq!(
            config.pid_file,
            Some(PathBuf::from("/run/postfix-protect.pid"))
        );
        assert_eq!(
            config.blacklist,
            Some(RuleSource::File {
                path: PathBuf::from("/srv/protect/lists/blacklist.txt")
            })
        );
        assert!(matches!(
            &config.limits,
            Some(RuleSource::Sql { database, .. }) if database == Path::new("/srv/protect/rules.db")
        ));
        assert_eq!(
            config.greylisting.exceptions,
            Some(RuleSource::File {
                path: PathBuf::from("/etc/postfix/nogreylist.txt")
            })
        );
        assert!(config.whitelist.is_none());
    }

    #[test]
    fn test_generated_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postfix-protect.yaml");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.greylisting.enabled = true;
        config.whitelist = Some(RuleSource::File {
            path: PathBuf::from("virtusertable"),
        });
        config.to_file(path).unwrap();

        let loaded = Config::from_file(path).unwrap();
        assert!(loaded.greylisting.enabled);
        assert_eq!(loaded.whitelist, config.whitelist);
        assert_eq!(loaded.duration_seconds, 600);
    }
}
