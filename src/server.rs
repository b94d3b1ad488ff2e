use crate::config::Config;
use crate::state::Shared;
use crate::{daemon, pickup, policy};
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

/// Back-off after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Policy,
    Pickup,
}

pub struct Server {
    config: Config,
    /// Re-read on SIGHUP. `None` when running on built-in defaults.
    config_path: Option<PathBuf>,
    /// Directory relative paths in a reloaded configuration are anchored at.
    base_dir: PathBuf,
    shared: Arc<Shared>,
}

impl Server {
    /// `config` is expected to have its paths resolved against `base_dir`
    /// already.
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        base_dir: PathBuf,
    ) -> anyhow::Result<Self> {
        let shared = Arc::new(Shared::from_config(&config)?);
        Ok(Server {
            config,
            config_path,
            base_dir,
            shared,
        })
    }

    pub fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    /// Binds the enabled listeners and serves until SIGTERM or SIGINT.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut listeners = Vec::new();
        if self.config.policy.enabled {
            listeners.push((Protocol::Policy, bind(&self.config.policy.listen).await?));
        }
        if self.config.pickup.enabled {
            listeners.push((Protocol::Pickup, bind(&self.config.pickup.listen).await?));
        }
        if listeners.is_empty() {
            anyhow::bail!("Neither the policy nor the pickup listener is enabled");
        }

        for (protocol, listener) in listeners {
            tokio::spawn(serve(listener, protocol, self.shared.clone()));
        }

        self.handle_signals().await?;
        self.shutdown();
        Ok(())
    }

    async fn handle_signals(&self) -> anyhow::Result<()> {
        let mut hangup = signal(SignalKind::hangup())?;
        let mut dump = signal(SignalKind::user_defined1())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                _ = hangup.recv() => self.reload(),
                _ = dump.recv() => {
                    for line in self.shared.dump_lines() {
                        log::info!("{line}");
                    }
                }
                _ = terminate.recv() => break,
                _ = interrupt.recv() => break,
            }
        }

        log::info!("Received shutdown signal, cleaning up...");
        Ok(())
    }

    /// Re-reads the configuration file and every rule source. On any
    /// failure the running rules are left untouched.
    pub fn reload(&self) {
        let config = match &self.config_path {
            Some(path) => match Config::from_file(&path.to_string_lossy()) {
                Ok(mut config) => {
                    config.resolve_paths(&self.base_dir);
                    config
                }
                Err(e) => {
                    log::error!(
                        "Failed to reload {}: {e}, keeping previous rules",
                        path.display()
                    );
                    return;
                }
            },
            None => self.config.clone(),
        };

        match self.shared.store.reload(&config) {
            Ok(()) => log::info!("Rules reloaded"),
            Err(e) => log::error!("Failed to reload rules: {e}, keeping previous rules"),
        }
    }

    fn shutdown(&self) {
        if let Err(e) = self.shared.persist_greylist() {
            log::error!("{e:#}");
        }
        if let Some(pid_file) = &self.config.pid_file {
            daemon::remove_pid_file(pid_file);
        }
    }
}

async fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on {addr}"))?;
    log::info!("Listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accepts connections forever, one task per connection.
pub async fn serve(listener: TcpListener, protocol: Protocol, shared: Arc<Shared>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("Could not accept client: {e}");
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                continue;
            }
        };

        let shared = shared.clone();
        tokio::spawn(async move {
            let result = match protocol {
                Protocol::Policy => policy::handle_connection(stream, shared).await,
                Protocol::Pickup => {
                    pickup::handle_connection(stream, Some(peer.ip()), shared).await
                }
            };
            if let Err(e) = result {
                log::debug!("{protocol:?} connection from {peer} aborted: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleSource;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start(protocol: Protocol, config: &Config) -> (std::net::SocketAddr, Arc<Shared>) {
        let shared = Arc::new(Shared::from_config(config).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, protocol, shared.clone()));
        (addr, shared)
    }

    async fn exchange(addr: std::net::SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut received = String::new();
        stream.read_to_string(&mut received).await.unwrap();
        received
    }

    #[tokio::test]
    async fn test_policy_over_tcp() {
        let mut config = Config::default();
        config.policy.mail_count = 1;
        let (addr, _) = start(Protocol::Policy, &config).await;

        let request = "request=smtpd_access_policy\nsasl_username=alice\n\n";
        assert_eq!(exchange(addr, request).await, policy::DEFAULT_RESPONSE);
        assert!(exchange(addr, request)
            .await
            .starts_with("action=500 Limit reached."));
    }

    #[tokio::test]
    async fn test_pickup_keys_on_peer_address() {
        let config = Config::default();
        let (addr, shared) = start(Protocol::Pickup, &config).await;

        assert_eq!(exchange(addr, "get alice\n").await, "200 OK (1)\n");
        assert_eq!(
            shared.limiter.snapshot(),
            vec![("alice@127.0.0.1".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_rules() {
        let dir = tempfile::tempdir().unwrap();
        let blacklist = dir.path().join("blacklist.txt");
        std::fs::write(&blacklist, "blocked@example.com\n").unwrap();
        let config_path = dir.path().join("postfix-protect.yaml");

        let mut config = Config::default();
        config.blacklist = Some(RuleSource::File {
            path: blacklist.clone(),
        });
        config.to_file(config_path.to_str().unwrap()).unwrap();
        let server = Server::new(config, Some(config_path.clone()), PathBuf::from("/")).unwrap();

        std::fs::remove_file(&blacklist).unwrap();
        server.reload();
        assert!(!server
            .shared()
            .store
            .snapshot()
            .challenge
            .challenge("blocked@example.com"));

        std::fs::write(&config_path, "policy: [not, a, mapping]\n").unwrap();
        server.reload();
        assert!(!server
            .shared()
            .store
            .snapshot()
            .challenge
            .challenge("blocked@example.com"));

        std::fs::write(&blacklist, "other@example.com\n").unwrap();
        std::fs::write(
            &config_path,
            format!(
                "policy:\n  mail_count: 3\nblacklist:\n  type: File\n  path: {}\n",
                blacklist.display()
            ),
        )
        .unwrap();
        server.reload();
        let rules = server.shared().store.snapshot();
        assert!(rules.challenge.challenge("blocked@example.com"));
        assert!(!rules.challenge.challenge("other@example.com"));
        assert_eq!(rules.settings.policy_mail_count, 3);
    }

    #[tokio::test]
    async fn test_reload_anchors_relative_paths_at_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("postfix-protect.yaml");
        std::fs::write(dir.path().join("blacklist.txt"), "blocked@example.com\n").unwrap();
        std::fs::write(
            &config_path,
            "blacklist:\n  type: File\n  path: blacklist.txt\n",
        )
        .unwrap();

        let mut config = Config::from_file(config_path.to_str().unwrap()).unwrap();
        config.resolve_paths(dir.path());
        let server =
            Server::new(config, Some(config_path.clone()), dir.path().to_path_buf()).unwrap();
        assert!(!server
            .shared()
            .store
            .snapshot()
            .challenge
            .challenge("blocked@example.com"));

        std::fs::write(dir.path().join("blacklist.txt"), "other@example.com\n").unwrap();
        server.reload();
        let rules = server.shared().store.snapshot();
        assert!(rules.challenge.challenge("blocked@example.com"));
        assert!(!rules.challenge.challenge("other@example.com"));
    }

    #[tokio::test]
    async fn test_run_requires_a_listener() {
        let mut config = Config::default();
        config.policy.enabled = false;
        config.pickup.enabled = false;
        let server = Server::new(config, None, PathBuf::from("/")).unwrap();
        assert!(server.run().await.is_err());
    }
}
