//! Registry of live proxy-core process groups
//!
//! Every supervisor registers its process group on start and removes it on
//! stop. The binary's interrupt handler uses [`ProcessRegistry::kill_all`] to
//! take down whatever is still running.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    groups: Arc<Mutex<BTreeSet<i32>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pgid: i32) {
        self.groups.lock().insert(pgid);
    }

    pub fn unregister(&self, pgid: i32) {
        self.groups.lock().remove(&pgid);
    }

    pub fn live(&self) -> Vec<i32> {
        self.groups.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.groups.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.lock().is_empty()
    }

    /// SIGKILL every registered group; returns how many were signalled
    pub fn kill_all(&self) -> usize {
        let groups: Vec<i32> = std::mem::take(&mut *self.groups.lock()).into_iter().collect();
        for &pgid in &groups {
            if let Err(e) = kill_group(pgid) {
                warn!("failed to kill process group {}: {}", pgid, e);
            }
        }
        groups.len()
    }
}

#[cfg(unix)]
pub(crate) fn signal_group(pgid: i32, signal: nix::sys::signal::Signal) -> nix::Result<()> {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    match nix::sys::signal::killpg(Pid::from_raw(pgid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
pub(crate) fn kill_group(pgid: i32) -> nix::Result<()> {
    signal_group(pgid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(not(unix))]
pub(crate) fn kill_group(_pgid: i32) -> std::io::Result<()> {
    Ok(())
}
