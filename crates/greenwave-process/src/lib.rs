//! Child process helpers shared by the detection pool and the optimizer
//! invoker.

use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, warn};

/// Time a child gets to exit after SIGTERM before it is killed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Ask the child to exit, then kill it if it is still running after `grace`.
///
/// Always reaps the child.
pub async fn terminate(child: &mut Child, grace: Duration) {
    request_exit(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(status = %status, "Child exited after termination request"),
        Ok(Err(e)) => warn!(error = %e, "Failed to wait for child"),
        Err(_) => {
            warn!(grace_secs = grace.as_secs_f64(), "Child ignored termination - killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill child");
            }
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid = pid, error = %e, "Failed to send SIGTERM");
        }
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    let _ = child.start_kill();
}
