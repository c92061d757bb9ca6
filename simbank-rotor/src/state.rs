//! Durable engine state: rotation position, metrics, identity history and
//! the advisory instance lock.
//!
//! All files are small JSON documents written whole after every step. A
//! failed write is reported to the caller, logged there and otherwise
//! ignored: losing a metrics update is cheaper than halting a 32-slot
//! rotation mid-cycle.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use crate::config::{SLOT_MAX, SLOT_MIN};
use crate::error::{Error, Result};

/// Rotations kept in the identity history before eviction.
pub const HISTORY_RETENTION: usize = 100;

fn now_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let raw = serde_json::to_string_pretty(value).map_err(|e| Error::Persistence {
        path: path.to_path_buf(),
        source: std::io::Error::other(e),
    })?;
    std::fs::write(path, raw).map_err(|source| Error::Persistence {
        path: path.to_path_buf(),
        source,
    })
}

/// Where the rotation cycle stands: advances monotonically through the
/// 32-step cycle, surviving process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationState {
    pub current_step: u8,
    pub iteration: u64,
}

impl Default for RotationState {
    fn default() -> Self {
        Self {
            current_step: SLOT_MIN,
            iteration: 1,
        }
    }
}

impl RotationState {
    /// Load persisted state, degrading to step 1 / iteration 1 when the file
    /// is missing or unreadable.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Self>(&raw) {
                Ok(state) if (SLOT_MIN..=SLOT_MAX).contains(&state.current_step) => state,
                Ok(state) => {
                    warn!(step = state.current_step, "persisted step out of range, restarting cycle");
                    Self::default()
                }
                Err(e) => {
                    warn!(path = %path.display(), "unreadable state file ({e}), restarting cycle");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    /// Move to the next step. Returns `true` when the cycle wrapped past the
    /// last slot and the iteration counter advanced.
    pub fn advance(&mut self) -> bool {
        if self.current_step >= SLOT_MAX {
            self.current_step = SLOT_MIN;
            self.iteration += 1;
            info!(iteration = self.iteration, "cycle complete, wrapping to slot 1");
            true
        } else {
            self.current_step += 1;
            false
        }
    }
}

/// Snapshot of the most recent rotation inside the metrics file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastRotation {
    pub step: u8,
    pub iteration: u64,
    pub timestamp: String,
    pub ready: u64,
    pub modems: u64,
    pub unique_identities: u64,
}

/// Cumulative per-step counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub total_rotations: u64,
    pub total_ready: u64,
    pub total_modems: u64,
    pub total_unique_identities: u64,
    pub total_commands_ok: u64,
    pub total_commands_error: u64,
    pub last: Option<LastRotation>,
}

impl Metrics {
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        step: u8,
        iteration: u64,
        ready: u64,
        modems: u64,
        unique_identities: u64,
        commands_ok: u64,
        commands_error: u64,
    ) {
        self.total_rotations += 1;
        self.total_ready += ready;
        self.total_modems += modems;
        self.total_unique_identities += unique_identities;
        self.total_commands_ok += commands_ok;
        self.total_commands_error += commands_error;
        self.last = Some(LastRotation {
            step,
            iteration,
            timestamp: now_timestamp(),
            ready,
            modems,
            unique_identities,
        });
    }
}

/// One rotation's observed identities, port by port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: u8,
    pub iteration: u64,
    pub timestamp: String,
    /// Port -> card identity observed after the switch.
    pub identities: BTreeMap<String, String>,
    pub unique: usize,
}

impl HistoryEntry {
    pub fn new(step: u8, iteration: u64, identities: BTreeMap<String, String>) -> Self {
        let unique = identities
            .values()
            .collect::<std::collections::HashSet<_>>()
            .len();
        Self {
            step,
            iteration,
            timestamp: now_timestamp(),
            identities,
            unique,
        }
    }
}

/// Bounded record of which card each port exposed per rotation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityHistory {
    entries: Vec<HistoryEntry>,
}

impl IdentityHistory {
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    /// Append an entry, evicting the oldest past the retention ceiling.
    pub fn record(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
        if self.entries.len() > HISTORY_RETENTION {
            let excess = self.entries.len() - HISTORY_RETENTION;
            self.entries.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }
}

/// Advisory PID-tagged lock preventing two engine instances from driving
/// the same hardware. Removable by hand if a crash leaves it behind.
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(path: &Path) -> Result<Self> {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                use std::io::Write;
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::AlreadyRunning(path.to_path_buf()))
            }
            Err(source) => Err(Error::Persistence {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "could not remove lock file: {e}");
        }
    }
}
