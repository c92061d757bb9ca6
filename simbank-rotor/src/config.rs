//! Engine configuration.
//!
//! Everything a rotation run can tune lives here: slot geometry, timing,
//! retry budgets and the pool table. Defaults match the values proven on the
//! reference installation (4 banks x 8 ports x 32 slots).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// First selectable slot on a bank controller.
pub const SLOT_MIN: u8 = 1;
/// Last selectable slot on a bank controller.
pub const SLOT_MAX: u8 = 32;
/// Logical ports exposed by one bank controller.
pub const PORTS_PER_BANK: u8 = 8;

/// Fixed waits between hardware operations.
///
/// Mechanical slot switches and SIM detection are slow; these values trade
/// cycle time for reliability and were tuned upward on real hardware.
#[derive(Debug, Clone)]
pub struct Timing {
    /// Wait after sending switch commands before sampling identities.
    pub settle: Duration,
    /// Additional settle after a switch retransmission.
    pub retry_settle_extra: Duration,
    /// Final wait at the end of a step for network registration to finish.
    pub final_stabilize: Duration,
    /// Default read wait after writing a command to an endpoint.
    pub command_wait: Duration,
    /// Gap between consecutive switch commands on the same controller.
    pub inter_command_gap: Duration,
    /// Delay before touching the SIM filesystem (phonebook, messages).
    pub sim_access_delay: Duration,
    /// Pause between steps in bulk mode.
    pub bulk_step_pause: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(10),
            retry_settle_extra: Duration::from_secs(3),
            final_stabilize: Duration::from_secs(15),
            command_wait: Duration::from_secs(1),
            inter_command_gap: Duration::from_millis(500),
            sim_access_delay: Duration::from_millis(1500),
            bulk_step_pause: Duration::from_secs(5),
        }
    }
}

/// Attempt budgets and poll intervals for every bounded loop.
#[derive(Debug, Clone)]
pub struct Budgets {
    /// Card-presence poll attempts after a modem reboot.
    pub card_ready_attempts: u32,
    pub card_ready_interval: Duration,
    /// Network-registration poll attempts.
    pub registration_attempts: u32,
    pub registration_interval: Duration,
    /// Transport-level retries for a single command.
    pub command_retries: u32,
    /// Full trigger-wait-scan cycles before giving up on a card.
    pub activation_attempts: u32,
    pub activation_retry_wait: Duration,
    /// Wait for the carrier's reply after the activation trigger.
    pub activation_settle: Duration,
    /// Trigger retransmissions when the network reports no service.
    pub no_service_retries: u32,
    pub no_service_wait: Duration,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            card_ready_attempts: 15,
            card_ready_interval: Duration::from_millis(1500),
            registration_attempts: 15,
            registration_interval: Duration::from_secs(2),
            command_retries: 3,
            activation_attempts: 5,
            activation_retry_wait: Duration::from_secs(15),
            activation_settle: Duration::from_secs(20),
            no_service_retries: 3,
            no_service_wait: Duration::from_secs(5),
        }
    }
}

/// One physical bank controller and the logical ports it owns.
///
/// `offset` staggers which physical card each pool exposes for a given
/// rotation step so that concurrently active pools never expose the same
/// card batch. The default table uses offsets 0, 8, 16, 24.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pool {
    pub name: String,
    /// Transport of the controller endpoint (e.g. `COM38`, `/dev/ttyUSB3`).
    pub controller: String,
    /// Logical ports on this controller, 1-8.
    pub logical_ports: Vec<u8>,
    /// Slot offset added (mod 32) to the rotation step.
    pub offset: u8,
}

impl Pool {
    pub fn new(name: impl Into<String>, controller: impl Into<String>, offset: u8) -> Self {
        Self {
            name: name.into(),
            controller: controller.into(),
            logical_ports: (1..=PORTS_PER_BANK).collect(),
            offset,
        }
    }
}

/// Default bank table for a four-pool installation.
pub fn default_pools() -> Vec<Pool> {
    vec![
        Pool::new("pool1", "/dev/ttyUSB0", 0),
        Pool::new("pool2", "/dev/ttyUSB1", 8),
        Pool::new("pool3", "/dev/ttyUSB2", 16),
        Pool::new("pool4", "/dev/ttyUSB3", 24),
    ]
}

/// Load the pool table from a JSON file, validating port and offset ranges.
pub fn load_pools(path: &Path) -> Result<Vec<Pool>> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Persistence {
        path: path.to_path_buf(),
        source,
    })?;
    let pools: Vec<Pool> = serde_json::from_str(&raw)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    for pool in &pools {
        if pool.offset >= SLOT_MAX {
            return Err(Error::Config(format!(
                "{}: offset {} out of range",
                pool.name, pool.offset
            )));
        }
        if let Some(port) = pool
            .logical_ports
            .iter()
            .find(|p| **p < 1 || **p > PORTS_PER_BANK)
        {
            return Err(Error::Config(format!(
                "{}: logical port {port} out of range",
                pool.name
            )));
        }
    }
    Ok(pools)
}

/// Save the pool table so a detected configuration survives restarts.
pub fn save_pools(path: &Path, pools: &[Pool]) -> Result<()> {
    let raw = serde_json::to_string_pretty(pools).map_err(|e| Error::Persistence {
        path: path.to_path_buf(),
        source: std::io::Error::other(e),
    })?;
    std::fs::write(path, raw).map_err(|source| Error::Persistence {
        path: path.to_path_buf(),
        source,
    })
}

/// Top-level engine settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub baud: u32,
    /// Simulate hardware: every command short-circuits to an OK response.
    pub dry_run: bool,
    /// Minimum ready/total ratio before a step is flagged for the operator.
    pub alert_ratio: f64,
    /// Consecutive failures before an endpoint is marked unstable.
    pub unstable_threshold: u32,
    /// How long an unstable endpoint stays out of the working set.
    pub blacklist_cooldown: Duration,
    /// Transports excluded permanently (known-bad wiring).
    pub permanent_blacklist: Vec<String>,
    /// Card-identity prefix of the managed carrier.
    pub carrier_prefix: String,
    /// USSD code that triggers activation of a managed card.
    pub activation_code: String,
    pub timing: Timing,
    pub budgets: Budgets,
    pub paths: FilePaths,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            baud: 115_200,
            dry_run: false,
            alert_ratio: 0.70,
            unstable_threshold: 3,
            blacklist_cooldown: Duration::from_secs(3600),
            permanent_blacklist: Vec::new(),
            carrier_prefix: "895603".to_string(),
            activation_code: "*103#".to_string(),
            timing: Timing::default(),
            budgets: Budgets::default(),
            paths: FilePaths::default(),
        }
    }
}

/// Durable files owned by the engine.
#[derive(Debug, Clone)]
pub struct FilePaths {
    pub state: PathBuf,
    pub metrics: PathBuf,
    pub identity_history: PathBuf,
    pub numbers: PathBuf,
    pub pools: PathBuf,
    pub port_mapping: PathBuf,
    pub lock: PathBuf,
}

impl Default for FilePaths {
    fn default() -> Self {
        Self {
            state: "rotor_state.json".into(),
            metrics: "rotor_metrics.json".into(),
            identity_history: "identity_history.json".into(),
            numbers: "numbers.txt".into(),
            pools: "pools.json".into(),
            port_mapping: "ports.txt".into(),
            lock: "rotor.lock".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pools_cover_the_full_slot_space() {
        let pools = default_pools();
        assert_eq!(pools.len(), 4);
        let offsets: Vec<u8> = pools.iter().map(|p| p.offset).collect();
        assert_eq!(offsets, vec![0, 8, 16, 24]);
        for pool in &pools {
            assert_eq!(pool.logical_ports.len(), PORTS_PER_BANK as usize);
        }
    }

    #[test]
    fn pool_table_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pools.json");
        let pools = default_pools();
        save_pools(&path, &pools).unwrap();
        assert_eq!(load_pools(&path).unwrap(), pools);
    }

    #[test]
    fn out_of_range_offset_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pools.json");
        let mut pools = default_pools();
        pools[0].offset = 40;
        save_pools(&path, &pools).unwrap();
        assert!(matches!(load_pools(&path), Err(Error::Config(_))));
    }
}
