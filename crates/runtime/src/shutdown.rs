//! Graceful termination of tool-server processes: SIGTERM, grace period, SIGKILL.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tokio::time::timeout;

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// How a process ended up stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited before we signalled it.
    AlreadyExited,
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Had to be killed.
    Forced,
}

/// Stop `child`, escalating to a kill once `grace` has elapsed.
///
/// The child is always reaped before this returns `Ok`.
pub async fn terminate(child: &mut Child, grace: Duration) -> io::Result<(Termination, ExitStatus)> {
    if let Some(status) = child.try_wait()? {
        return Ok((Termination::AlreadyExited, status));
    }

    if send_term(child)? {
        if let Ok(status) = timeout(grace, child.wait()).await {
            return Ok((Termination::Graceful, status?));
        }
    }

    child.kill().await?;
    let status = child.wait().await?;
    Ok((Termination::Forced, status))
}

/// Returns `false` when no graceful signal could be delivered.
#[cfg(unix)]
fn send_term(child: &Child) -> io::Result<bool> {
    let Some(pid) = child.id() else {
        return Ok(false);
    };

    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => Ok(true),
        // Exited between try_wait and the signal; wait() reaps it.
        Err(nix::errno::Errno::ESRCH) => Ok(true),
        Err(e) => Err(io::Error::other(e)),
    }
}

#[cfg(not(unix))]
fn send_term(_child: &Child) -> io::Result<bool> {
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;
    use tokio::time::sleep;

    #[tokio::test]
    #[cfg(unix)]
    async fn sigterm_stops_sleep() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let (how, _) = terminate(&mut child, Duration::from_secs(5)).await.unwrap();
        assert_eq!(how, Termination::Graceful);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn ignored_sigterm_escalates_to_kill() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; exec sleep 30")
            .spawn()
            .unwrap();
        sleep(Duration::from_millis(200)).await;

        let (how, _) = terminate(&mut child, Duration::from_millis(300)).await.unwrap();
        assert_eq!(how, Termination::Forced);
    }

    #[tokio::test]
    async fn already_exited_process() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();

        let (how, status) = terminate(&mut child, Duration::from_secs(1)).await.unwrap();
        assert_eq!(how, Termination::AlreadyExited);
        assert!(status.success());
    }
}
