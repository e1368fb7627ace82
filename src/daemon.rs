//! Process setup around the milter: socket permissions, privilege drop and
//! detaching from the terminal.

use anyhow::{bail, Context};
use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::process;

/// Socket files are created readable and writable by the owner only.
pub const SOCKET_UMASK: libc::mode_t = 0o177;

pub fn set_umask(mask: libc::mode_t) -> libc::mode_t {
    unsafe { libc::umask(mask) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Account {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

/// Look up `user` in the password database.
pub fn lookup_user(user: &str) -> anyhow::Result<Account> {
    let name = CString::new(user).with_context(|| format!("Invalid user name {user:?}"))?;
    let pw = unsafe { libc::getpwnam(name.as_ptr()) };
    if pw.is_null() {
        bail!("Unknown user '{user}'");
    }
    let (uid, gid) = unsafe { ((*pw).pw_uid, (*pw).pw_gid) };
    Ok(Account { uid, gid })
}

/// Switch to `user` when running as root, handing it the unix socket first so
/// the socket can still be removed at shutdown.
///
/// Does nothing for an unprivileged process.
pub fn drop_privileges(user: &str, socket: Option<&Path>) -> anyhow::Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        log::debug!("Not running as root, keeping current user");
        return Ok(());
    }

    let account = lookup_user(user)?;

    if let Some(path) = socket {
        std::os::unix::fs::chown(path, Some(account.uid), Some(account.gid))
            .with_context(|| format!("Failed to chown {}", path.display()))?;
    }

    unsafe {
        if libc::setgroups(1, &account.gid) != 0 {
            bail!("setgroups: {}", std::io::Error::last_os_error());
        }
        if libc::setgid(account.gid) != 0 {
            bail!("setgid({}): {}", account.gid, std::io::Error::last_os_error());
        }
        if libc::setuid(account.uid) != 0 {
            bail!("setuid({}): {}", account.uid, std::io::Error::last_os_error());
        }
    }

    log::info!("Running as user {user} ({}:{})", account.uid, account.gid);
    Ok(())
}

/// Detach from the controlling terminal.
///
/// Must run before any thread is started: only the calling thread survives
/// `fork`.
pub fn daemonize() -> anyhow::Result<()> {
    log::info!("Starting spf-milter in daemon mode...");

    fork_and_exit_parent().context("Failed to fork process")?;

    if unsafe { libc::setsid() } == -1 {
        bail!("Failed to create new session: {}", std::io::Error::last_os_error());
    }

    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }

    // Not a session leader, so no controlling terminal can be reacquired
    fork_and_exit_parent().context("Failed to second fork")?;

    if let Err(e) = std::env::set_current_dir("/") {
        log::warn!("Failed to change working directory to /: {e}");
    }

    let dev_null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("Failed to open /dev/null")?;
    let null_fd = dev_null.as_raw_fd();
    unsafe {
        libc::dup2(null_fd, libc::STDIN_FILENO);
        libc::dup2(null_fd, libc::STDOUT_FILENO);
        libc::dup2(null_fd, libc::STDERR_FILENO);
    }

    log::info!("Daemon mode initialization complete");
    Ok(())
}

fn fork_and_exit_parent() -> anyhow::Result<()> {
    match unsafe { libc::fork() } {
        -1 => Err(std::io::Error::last_os_error().into()),
        0 => Ok(()),
        _ => process::exit(0),
    }
}
