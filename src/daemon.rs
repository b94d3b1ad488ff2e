//! Detaching from the terminal and PID file handling.
//!
//! [`daemonize`] forks, so it must run before the tokio runtime is built.

use anyhow::bail;
use std::fs::OpenOptions;
use std::os::unix::io::IntoRawFd;
use std::path::Path;

/// Classic double fork: the caller returns only in the final daemon process.
pub fn daemonize() -> anyhow::Result<()> {
    log::info!("Starting postfix-protect in daemon mode...");

    // First fork
    match unsafe { libc::fork() } {
        -1 => bail!("Failed to fork process"),
        0 => {}
        _ => std::process::exit(0),
    }

    // Become session leader, detaching from the controlling terminal
    if unsafe { libc::setsid() } == -1 {
        bail!("Failed to create new session");
    }

    // The session leader's exit sends SIGHUP, which would otherwise reload us
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }

    // Second fork so we can never reacquire a controlling terminal
    match unsafe { libc::fork() } {
        -1 => bail!("Failed to second fork"),
        0 => {}
        _ => std::process::exit(0),
    }

    if let Err(e) = std::env::set_current_dir("/") {
        log::warn!("Failed to change working directory to /: {e}");
    }

    unsafe {
        libc::umask(0o027);
    }

    match OpenOptions::new().read(true).write(true).open("/dev/null") {
        Ok(dev_null) => {
            let null_fd = dev_null.into_raw_fd();
            unsafe {
                libc::dup2(null_fd, 0);
                libc::dup2(null_fd, 1);
                libc::dup2(null_fd, 2);
                // it may itself have landed on 0..=2 if those were closed
                if null_fd > 2 {
                    libc::close(null_fd);
                }
            }
        }
        Err(e) => {
            log::warn!("Failed to open /dev/null: {e}, closing standard file descriptors");
            unsafe {
                libc::close(0);
                libc::close(1);
                libc::close(2);
            }
        }
    }

    log::info!("Daemon mode initialization complete");
    Ok(())
}

pub fn write_pid_file(path: &Path) -> anyhow::Result<()> {
    let pid = std::process::id();
    std::fs::write(path, format!("{pid}\n"))?;
    log::info!("PID file written: {} ({pid})", path.display());
    Ok(())
}

pub fn remove_pid_file(path: &Path) {
    if !path.exists() {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => log::info!("PID file removed"),
        Err(e) => log::warn!("Failed to remove PID file: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postfix-protect.pid");

        write_pid_file(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        remove_pid_file(&path);
        assert!(!path.exists());
        // removing twice is harmless
        remove_pid_file(&path);
    }
}
