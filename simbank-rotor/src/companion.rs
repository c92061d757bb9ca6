//! Companion application lifecycle.
//!
//! The engine shares the serial ports with an external SMS client. That
//! client must be stopped before any rotation work (it holds the port
//! handles) and brought back once the hardware settles. The engine never
//! looks past process presence; everything else about the companion is its
//! own business.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::{ProcessExt, System, SystemExt};
use tokio::time;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Companion: Send + Sync {
    async fn is_running(&self) -> bool;

    /// Stop the companion and confirm process exit within a bounded wait.
    /// Idempotent: already-stopped reports success.
    async fn stop(&self) -> bool;

    /// Start the companion. Idempotent: already-running is a no-op.
    async fn start(&self) -> bool;
}

/// Companion for dry runs and hosts without the client installed.
pub struct NullCompanion;

#[async_trait]
impl Companion for NullCompanion {
    async fn is_running(&self) -> bool {
        false
    }

    async fn stop(&self) -> bool {
        true
    }

    async fn start(&self) -> bool {
        true
    }
}

/// Companion controlled through OS process presence.
pub struct ProcessCompanion {
    process_name: String,
    /// Command line used to launch the companion, when the engine owns that.
    launch: Option<Vec<String>>,
    exit_wait: Duration,
    system: Mutex<System>,
}

impl ProcessCompanion {
    pub fn new(process_name: impl Into<String>, launch: Option<Vec<String>>) -> Self {
        Self {
            process_name: process_name.into(),
            launch,
            exit_wait: Duration::from_secs(5),
            system: Mutex::new(System::new()),
        }
    }

    fn running_pids(&self) -> Vec<sysinfo::Pid> {
        let mut system = self.system.lock();
        system.refresh_processes();
        system
            .processes_by_name(&self.process_name)
            .map(|p| p.pid())
            .collect()
    }

    fn kill_all(&self) -> usize {
        let mut system = self.system.lock();
        system.refresh_processes();
        system
            .processes_by_name(&self.process_name)
            .filter(|p| p.kill())
            .count()
    }
}

#[async_trait]
impl Companion for ProcessCompanion {
    async fn is_running(&self) -> bool {
        !self.running_pids().is_empty()
    }

    async fn stop(&self) -> bool {
        if self.running_pids().is_empty() {
            debug!(process = %self.process_name, "companion not running");
            return true;
        }
        info!(process = %self.process_name, "stopping companion");
        self.kill_all();

        let deadline = self.exit_wait.as_secs().max(1);
        for _ in 0..deadline {
            time::sleep(Duration::from_secs(1)).await;
            if self.running_pids().is_empty() {
                // Give the OS a moment to release the serial handles.
                time::sleep(Duration::from_secs(1)).await;
                return true;
            }
        }

        warn!(process = %self.process_name, "companion still alive, killing again");
        self.kill_all();
        time::sleep(Duration::from_secs(2)).await;
        self.running_pids().is_empty()
    }

    async fn start(&self) -> bool {
        if !self.running_pids().is_empty() {
            debug!(process = %self.process_name, "companion already running");
            return true;
        }
        let Some(launch) = &self.launch else {
            warn!(process = %self.process_name, "no launch command configured");
            return false;
        };
        info!(process = %self.process_name, "starting companion");
        let mut command = std::process::Command::new(&launch[0]);
        command.args(&launch[1..]);
        if let Err(e) = command.spawn() {
            warn!(process = %self.process_name, "companion launch failed: {e}");
            return false;
        }

        for _ in 0..10 {
            time::sleep(Duration::from_secs(1)).await;
            if !self.running_pids().is_empty() {
                return true;
            }
        }
        warn!(process = %self.process_name, "companion did not appear after launch");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_companion_is_always_agreeable() {
        let companion = NullCompanion;
        assert!(!companion.is_running().await);
        assert!(companion.stop().await);
        assert!(companion.start().await);
    }

    #[tokio::test]
    async fn stopping_an_absent_process_succeeds_immediately() {
        let companion = ProcessCompanion::new("definitely-not-a-real-process-name", None);
        assert!(!companion.is_running().await);
        assert!(companion.stop().await);
    }

    #[tokio::test]
    async fn start_without_a_launch_command_fails() {
        let companion = ProcessCompanion::new("definitely-not-a-real-process-name", None);
        assert!(!companion.start().await);
    }
}
