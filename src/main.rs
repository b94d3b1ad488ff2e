use clap::{Arg, Command};
use log::LevelFilter;
use postfix_protect::daemon;
use postfix_protect::{Config, RuleSet, Server};
use std::path::{Path, PathBuf};
use std::process;

fn main() {
    let matches = Command::new("postfix-protect")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Rate limiting, blacklisting and greylisting policy daemon for Postfix")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/postfix-protect.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Load the configuration and every rule source, then exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging of every decision")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("Run as a daemon (background process)")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/postfix-protect.yaml");

    let base_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Cannot determine working directory: {e}");
            process::exit(1);
        }
    };

    let (mut config, reload_path) = match load_config(config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };
    config.resolve_paths(&base_dir);
    let reload_path = reload_path.map(|path| base_dir.join(path));

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if matches.get_flag("daemon") {
        if let Err(e) = daemon::daemonize() {
            log::error!("{e}");
            process::exit(1);
        }
    }

    if let Some(pid_file) = &config.pid_file {
        if let Err(e) = daemon::write_pid_file(pid_file) {
            log::warn!("Failed to write PID file: {e}");
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start runtime: {e}");
            process::exit(1);
        }
    };

    log::info!("Starting postfix-protect...");
    let result = runtime.block_on(async {
        let server = Server::new(config, reload_path, base_dir)?;
        server.run().await
    });

    if let Err(e) = result {
        log::error!("{e:#}");
        process::exit(1);
    }
}

/// Returns the configuration and, when it came from a file, the path to
/// re-read on reload.
fn load_config(path: &str) -> anyhow::Result<(Config, Option<PathBuf>)> {
    if Path::new(path).exists() {
        Ok((Config::from_file(path)?, Some(PathBuf::from(path))))
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok((Config::default(), None))
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config) {
    println!("Testing configuration...");
    match RuleSet::load(config) {
        Ok(rules) => {
            println!(
                "Policy listener: {} ({})",
                config.policy.listen,
                enabled(config.policy.enabled)
            );
            println!(
                "Pickup listener: {} ({})",
                config.pickup.listen,
                enabled(config.pickup.enabled)
            );
            println!(
                "Default limits: policy {} / pickup {} mails per {}s",
                rules.settings.policy_mail_count,
                rules.settings.pickup_mail_count,
                rules.settings.duration_seconds
            );
            println!("Blacklisted senders: {}", rules.challenge.blacklist.len());
            println!(
                "Whitelisted senders: {} (whitelist mode {})",
                rules.challenge.whitelist.len(),
                enabled(rules.challenge.whitelist_mode)
            );
            println!("Per-user limits: {}", rules.limits.len());
            println!(
                "Greylisting {} ({} exceptions)",
                enabled(config.greylisting.enabled),
                rules.greylist_exceptions.len()
            );
            println!("Configuration OK");
        }
        Err(e) => {
            println!("Configuration validation failed:");
            println!("Error: {e}");
            process::exit(1);
        }
    }
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}
