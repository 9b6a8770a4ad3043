//! Process-group lifecycle for spawned commands.
//!
//! On POSIX every execution runs as the leader of a fresh process group so
//! one signal reaches the command and all of its descendants. On Windows
//! there are no group semantics; termination is a best-effort kill of the
//! root process only.

use std::io;
use std::time::Duration;

/// How long a group gets to exit after SIGTERM before SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(3);
const STOP_POLL: Duration = Duration::from_millis(100);

/// Arrange for the child to become the leader of a new process group.
pub fn set_process_group(cmd: &mut tokio::process::Command) {
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(not(unix))]
    let _ = cmd;
}

/// Liveness probe: signal 0 to the PID.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: nix::sys::signal::Signal) -> io::Result<()> {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;
    killpg(Pid::from_raw(pid as i32), sig).map_err(io::Error::from)
}

/// Terminate the process group led by `pid`: SIGTERM, wait up to three
/// seconds for liveness to drop, then SIGKILL the group.
///
/// A group that is already gone counts as stopped. Errors are only returned
/// when the initial signal could not be delivered to a live group.
#[cfg(unix)]
pub async fn graceful_stop(pid: u32) -> io::Result<()> {
    use nix::sys::signal::Signal;

    if !process_alive(pid) {
        return Ok(());
    }
    if let Err(err) = signal_group(pid, Signal::SIGTERM) {
        if err.raw_os_error() == Some(nix::libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    let deadline = tokio::time::Instant::now() + STOP_GRACE;
    while tokio::time::Instant::now() < deadline {
        if !process_alive(pid) {
            return Ok(());
        }
        tokio::time::sleep(STOP_POLL).await;
    }
    let _ = signal_group(pid, Signal::SIGKILL);
    Ok(())
}

/// Best-effort termination of the root process; descendants may survive.
#[cfg(not(unix))]
pub async fn graceful_stop(pid: u32) -> io::Result<()> {
    let _ = tokio::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output()
        .await?;
    Ok(())
}
