//! Endpoint registry: transport discovery, logical port mapping and health.
//!
//! The registry owns the one piece of shared mutable state in the engine,
//! the per-port health map. Components query and update it through a handle
//! (`Arc<EndpointRegistry>`); the internal lock is held only for the
//! read-modify-write, never across I/O.
//!
//! Health model: consecutive failures accumulate per transport; at the
//! configured threshold the endpoint is blacklisted for a cooldown window.
//! Expiry is evaluated lazily on read, so a rehabilitated port rejoins the
//! working set without any background timer or explicit reset.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Enumerate the serial transports currently present on the host.
pub fn available_transports() -> Vec<String> {
    match tokio_serial::available_ports() {
        Ok(ports) => {
            let mut names: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
            names.sort();
            names
        }
        Err(e) => {
            warn!("could not enumerate serial ports: {e}");
            Vec::new()
        }
    }
}

#[derive(Debug)]
struct PortHealth {
    consecutive_failures: u32,
    blacklisted_until: Option<Instant>,
}

pub struct EndpointRegistry {
    health: Mutex<HashMap<String, PortHealth>>,
    /// Transport suffix number -> logical port, from the mapping file.
    mapping: Mutex<HashMap<u32, u8>>,
    permanent_blacklist: HashSet<String>,
    unstable_threshold: u32,
    cooldown: Duration,
}

impl EndpointRegistry {
    pub fn new(unstable_threshold: u32, cooldown: Duration, permanent: &[String]) -> Self {
        Self {
            health: Mutex::new(HashMap::new()),
            mapping: Mutex::new(HashMap::new()),
            permanent_blacklist: permanent.iter().cloned().collect(),
            unstable_threshold,
            cooldown,
        }
    }

    /// Record a failed exchange with `port`.
    ///
    /// Returns `true` exactly when this failure crossed the instability
    /// threshold, so the caller can raise a one-shot alert.
    pub fn record_failure(&self, port: &str) -> bool {
        let mut health = self.health.lock();
        let entry = health.entry(port.to_string()).or_insert(PortHealth {
            consecutive_failures: 0,
            blacklisted_until: None,
        });
        entry.consecutive_failures += 1;
        if entry.consecutive_failures == self.unstable_threshold {
            entry.blacklisted_until = Some(Instant::now() + self.cooldown);
            warn!(
                port,
                failures = entry.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "endpoint marked unstable"
            );
            true
        } else {
            false
        }
    }

    /// Record a successful exchange: clears the failure record entirely.
    pub fn record_success(&self, port: &str) {
        self.health.lock().remove(port);
    }

    /// Whether `port` may be used this cycle.
    ///
    /// Expired time-based blacklist entries are deleted here rather than by
    /// a background task.
    pub fn is_usable(&self, port: &str) -> bool {
        if self.permanent_blacklist.contains(port) {
            return false;
        }
        let mut health = self.health.lock();
        let Some(entry) = health.get(port) else {
            return true;
        };
        match entry.blacklisted_until {
            Some(until) if Instant::now() >= until => {
                health.remove(port);
                info!(port, "endpoint rehabilitated after cooldown");
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    /// Reload the logical port mapping file.
    ///
    /// Format: one `logical-suffix` pair per line (`07-12` maps logical port
    /// 07 to the transport whose name ends in 12). A missing file degrades to
    /// an empty mapping: every non-controller transport is treated as a
    /// modem.
    pub fn load_mapping(&self, path: &Path) -> usize {
        let mut parsed = HashMap::new();
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                for line in raw.lines() {
                    let Some((logical, suffix)) = line.trim().split_once('-') else {
                        continue;
                    };
                    if let (Ok(logical), Ok(suffix)) = (logical.parse::<u8>(), suffix.parse::<u32>())
                    {
                        parsed.insert(suffix, logical);
                    }
                }
                debug!(path = %path.display(), entries = parsed.len(), "port mapping loaded");
            }
            Err(e) => {
                debug!(path = %path.display(), "no port mapping ({e}), using direct mapping");
            }
        }
        let count = parsed.len();
        *self.mapping.lock() = parsed;
        count
    }

    /// Logical port for a transport, if the mapping knows its suffix.
    pub fn logical_port(&self, transport: &str) -> Option<u8> {
        let suffix = transport_suffix(transport)?;
        self.mapping.lock().get(&suffix).copied()
    }

    pub fn has_mapping(&self) -> bool {
        !self.mapping.lock().is_empty()
    }

    /// Compute the modem working set for this cycle.
    ///
    /// Restricted to mapped transports when a mapping is loaded, otherwise
    /// every transport except the bank controllers; permanently and
    /// temporarily blacklisted endpoints are subtracted in either case.
    pub fn active_endpoints(
        &self,
        available: &[String],
        controllers: &HashSet<String>,
    ) -> Vec<String> {
        let mapped = self.has_mapping();
        available
            .iter()
            .filter(|port| {
                if mapped {
                    self.logical_port(port).is_some()
                } else {
                    !controllers.contains(*port)
                }
            })
            .filter(|port| self.is_usable(port))
            .cloned()
            .collect()
    }
}

/// Trailing digit run of a transport name (`/dev/ttyUSB12` -> 12, `COM7` -> 7).
fn transport_suffix(transport: &str) -> Option<u32> {
    let digits: String = transport
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::time;

    fn registry() -> EndpointRegistry {
        EndpointRegistry::new(3, Duration::from_secs(3600), &[])
    }

    #[tokio::test(start_paused = true)]
    async fn three_consecutive_failures_blacklist_the_port() {
        let reg = registry();
        assert!(!reg.record_failure("COM5"));
        assert!(!reg.record_failure("COM5"));
        assert!(reg.is_usable("COM5"));
        // Third failure crosses the threshold and raises the one-shot alert.
        assert!(reg.record_failure("COM5"));
        assert!(!reg.is_usable("COM5"));
        // Further failures do not re-alert.
        assert!(!reg.record_failure("COM5"));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_rehabilitates_without_explicit_reset() {
        let reg = registry();
        for _ in 0..3 {
            reg.record_failure("COM5");
        }
        assert!(!reg.is_usable("COM5"));

        time::advance(Duration::from_secs(3601)).await;
        assert!(reg.is_usable("COM5"));
        // The record was dropped: the failure count starts over.
        assert!(!reg.record_failure("COM5"));
    }

    #[tokio::test(start_paused = true)]
    async fn success_clears_the_failure_streak() {
        let reg = registry();
        reg.record_failure("COM5");
        reg.record_failure("COM5");
        reg.record_success("COM5");
        assert!(!reg.record_failure("COM5"));
        assert!(reg.is_usable("COM5"));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_blacklist_is_never_usable() {
        let reg = EndpointRegistry::new(3, Duration::from_secs(3600), &["COM9".to_string()]);
        assert!(!reg.is_usable("COM9"));
        time::advance(Duration::from_secs(100_000)).await;
        assert!(!reg.is_usable("COM9"));
    }

    #[test]
    fn mapping_file_is_parsed_and_matched_by_suffix() {
        let reg = registry();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "07-12").unwrap();
        writeln!(file, "01-3").unwrap();
        writeln!(file, "garbage line").unwrap();
        assert_eq!(reg.load_mapping(file.path()), 2);
        assert_eq!(reg.logical_port("/dev/ttyUSB12"), Some(7));
        assert_eq!(reg.logical_port("COM3"), Some(1));
        assert_eq!(reg.logical_port("COM99"), None);
    }

    #[test]
    fn missing_mapping_degrades_to_all_non_controllers() {
        let reg = registry();
        assert_eq!(reg.load_mapping(Path::new("does-not-exist.txt")), 0);

        let available = vec!["COM1".to_string(), "COM2".to_string(), "COM3".to_string()];
        let controllers: HashSet<String> = ["COM3".to_string()].into();
        let active = reg.active_endpoints(&available, &controllers);
        assert_eq!(active, vec!["COM1".to_string(), "COM2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn active_endpoints_subtracts_unstable_ports() {
        let reg = registry();
        for _ in 0..3 {
            reg.record_failure("COM2");
        }
        let available = vec!["COM1".to_string(), "COM2".to_string()];
        let active = reg.active_endpoints(&available, &HashSet::new());
        assert_eq!(active, vec!["COM1".to_string()]);
    }

    #[test]
    fn mapped_transports_only_when_mapping_present() {
        let reg = registry();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "01-1").unwrap();
        reg.load_mapping(file.path());

        let available = vec!["COM1".to_string(), "COM2".to_string()];
        let active = reg.active_endpoints(&available, &HashSet::new());
        assert_eq!(active, vec!["COM1".to_string()]);
    }
}
