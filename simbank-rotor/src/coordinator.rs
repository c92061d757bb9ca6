//! Rotation coordinator: one pass through the step pipeline per slot.
//!
//! ```text
//! Idle ─► Switching (pools in parallel, join)
//!      ─► Verifying (modems in parallel, join)
//!      ─► Activating (ready modems in parallel, join)
//!      ─► Persisting ─► Idle (next step)
//! ```
//!
//! Failure policy: nothing a single pool, modem or durable write does can
//! abort the cycle. Failures degrade the step's ready ratio; a ratio below
//! the alert threshold flags the report for the operator but the state still
//! advances, since retrying an entire 32-slot bank costs more than one thin
//! rotation.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activation::{ActivationOrchestrator, ActivationRecord};
use crate::bank::{BankController, RetryPolicy, SwitchOutcome};
use crate::channel::CommandChannel;
use crate::companion::Companion;
use crate::config::{Pool, Settings};
use crate::modem::{ModemReport, ModemVerifier};
use crate::registry::{self, EndpointRegistry};
use crate::state::{HistoryEntry, IdentityHistory, Metrics, RotationState};
use crate::store::NumberStore;
use crate::tasks::{self, ScopedTimer, sleep_cancellable};

/// How the coordinator walks the slot cycle.
#[derive(Debug, Clone)]
pub enum RotationMode {
    /// Rotate one step, sleep `interval`, repeat indefinitely.
    Continuous { interval: Duration },
    /// Run every remaining step of the cycle back-to-back, restarting the
    /// companion application only once at the end.
    Bulk,
}

/// Aggregate outcome of one rotation step.
#[derive(Debug)]
pub struct StepReport {
    pub step: u8,
    pub iteration: u64,
    pub switches: Vec<SwitchOutcome>,
    pub modems_total: usize,
    pub modems_ready: usize,
    pub unique_identities: usize,
    pub activations_ok: usize,
    pub activations_failed: usize,
    /// Ready ratio fell below the alert threshold.
    pub flagged: bool,
}

impl StepReport {
    pub fn ready_ratio(&self) -> f64 {
        if self.modems_total == 0 {
            1.0
        } else {
            self.modems_ready as f64 / self.modems_total as f64
        }
    }
}

pub struct RotationCoordinator {
    banks: Vec<Arc<BankController>>,
    registry: Arc<EndpointRegistry>,
    verifier: Arc<ModemVerifier>,
    activator: Arc<ActivationOrchestrator>,
    companion: Arc<dyn Companion>,
    settings: Settings,
}

impl RotationCoordinator {
    pub fn new(
        pools: Vec<Pool>,
        channel: Arc<dyn CommandChannel>,
        registry: Arc<EndpointRegistry>,
        store: Arc<dyn NumberStore>,
        companion: Arc<dyn Companion>,
        settings: Settings,
    ) -> Self {
        let banks = pools
            .into_iter()
            .map(|pool| {
                Arc::new(BankController::new(
                    pool,
                    channel.clone(),
                    settings.timing.clone(),
                    RetryPolicy::default(),
                ))
            })
            .collect();
        let verifier = Arc::new(ModemVerifier::new(
            channel.clone(),
            settings.budgets.clone(),
            settings.timing.clone(),
        ));
        let activator = Arc::new(ActivationOrchestrator::new(
            channel,
            store,
            settings.carrier_prefix.clone(),
            settings.activation_code.clone(),
            settings.budgets.clone(),
            settings.timing.clone(),
        ));
        Self {
            banks,
            registry,
            verifier,
            activator,
            companion,
            settings,
        }
    }

    /// Drive the rotation loop until cancelled (continuous) or the cycle
    /// completes (bulk). The rotation state is persisted after every step
    /// and once more on the way out, so an interrupt never loses position.
    pub async fn run(
        &self,
        mode: RotationMode,
        state: &mut RotationState,
        cancel: &CancellationToken,
    ) {
        match mode {
            RotationMode::Continuous { interval } => {
                while !cancel.is_cancelled() {
                    let available = registry::available_transports();
                    let report = self
                        .run_step(state.current_step, state.iteration, &available, cancel, true)
                        .await;
                    self.log_report(&report);

                    state.advance();
                    self.persist_state(state);
                    if cancel.is_cancelled() {
                        break;
                    }
                    info!(
                        next_step = state.current_step,
                        sleep_secs = interval.as_secs(),
                        "waiting for next rotation"
                    );
                    if !sleep_cancellable(interval, cancel).await {
                        break;
                    }
                }
            }
            RotationMode::Bulk => {
                info!(
                    start_step = state.current_step,
                    "bulk mode: processing the remaining cycle without interruptions"
                );
                self.companion.stop().await;
                while !cancel.is_cancelled() {
                    let available = registry::available_transports();
                    let report = self
                        .run_step(state.current_step, state.iteration, &available, cancel, false)
                        .await;
                    self.log_report(&report);

                    let wrapped = state.advance();
                    self.persist_state(state);
                    if wrapped || cancel.is_cancelled() {
                        break;
                    }
                    if !sleep_cancellable(self.settings.timing.bulk_step_pause, cancel).await {
                        break;
                    }
                }
                self.companion.start().await;
            }
        }
        self.persist_state(state);
        info!(
            step = state.current_step,
            iteration = state.iteration,
            "rotation loop stopped, state persisted"
        );
    }

    /// Execute one full step: switch, verify, activate, persist.
    ///
    /// `available` is this cycle's transport snapshot; `manage_companion`
    /// cycles the external client around the serial work (continuous mode
    /// does, bulk mode handles it once around the whole run).
    pub async fn run_step(
        &self,
        step: u8,
        iteration: u64,
        available: &[String],
        cancel: &CancellationToken,
        manage_companion: bool,
    ) -> StepReport {
        let _step_timer = ScopedTimer::new(format!("step {step:02}"));
        info!(step, iteration, "rotation step started");

        if manage_companion {
            self.companion.stop().await;
        }

        // The mapping can change between steps when the operator re-seats
        // hardware; reload it rather than trusting the last snapshot.
        self.registry.load_mapping(&self.settings.paths.port_mapping);

        let controllers: HashSet<String> = self
            .banks
            .iter()
            .map(|bank| bank.pool().controller.clone())
            .collect();
        let modems = self.registry.active_endpoints(available, &controllers);
        info!(
            pools = self.banks.len(),
            modems = modems.len(),
            "working set assembled"
        );
        if modems.is_empty() {
            warn!("no modems in working set; switching slots blind");
        }

        // Stage 1: all pools switch concurrently.
        let switches = {
            let _timer = ScopedTimer::new("switching");
            let futures: Vec<_> = self
                .banks
                .iter()
                .map(|bank| {
                    let bank = bank.clone();
                    let sample = modems.clone();
                    async move { bank.switch(step, &sample).await }
                })
                .collect();
            tasks::join_all("switch", futures).await
        };

        // Stage 2: every modem verifies concurrently.
        let reports = {
            let _timer = ScopedTimer::new("verifying");
            let futures: Vec<_> = modems
                .iter()
                .map(|port| {
                    let verifier = self.verifier.clone();
                    let port = port.clone();
                    let cancel = cancel.clone();
                    async move { verifier.verify(&port, &cancel).await }
                })
                .collect();
            tasks::join_all("verify", futures).await
        };

        let mut identities = BTreeMap::new();
        for report in &reports {
            if report.is_ready() {
                self.registry.record_success(&report.port);
            } else if self.registry.record_failure(&report.port) {
                warn!(port = %report.port, "modem excluded from future cycles until cooldown");
            }
            if let Some(identity) = &report.identity {
                identities.insert(report.port.clone(), identity.as_str().to_string());
            }
        }
        let ready: Vec<&ModemReport> = reports.iter().filter(|r| r.is_ready()).collect();

        // Stage 3: ready modems activate concurrently. Skipped when shutting
        // down; the next run re-verifies actual hardware state anyway.
        let activations: Vec<ActivationRecord> = if cancel.is_cancelled() {
            Vec::new()
        } else {
            let _timer = ScopedTimer::new("activating");
            let futures: Vec<_> = ready
                .iter()
                .filter_map(|report| {
                    let identity = report.identity.clone()?;
                    let activator = self.activator.clone();
                    let port = report.port.clone();
                    let cancel = cancel.clone();
                    Some(async move { activator.activate(&port, &identity, &cancel).await })
                })
                .collect();
            tasks::join_all("activate", futures).await
        };

        let managed: Vec<&ActivationRecord> = activations
            .iter()
            .filter(|record| record.identity.has_prefix(&self.settings.carrier_prefix))
            .collect();
        let activations_ok = managed
            .iter()
            .filter(|r| r.activated && r.number.is_some())
            .count();
        let activations_failed = managed.iter().filter(|r| !r.activated).count();

        // Stage 4: persist. Durable-write failures are logged, never fatal.
        let report = {
            let _timer = ScopedTimer::new("persisting");
            let unique_identities = identities
                .values()
                .collect::<std::collections::HashSet<_>>()
                .len();
            let commands_ok: u64 = switches.iter().map(|s| s.commands_ok as u64).sum();
            let commands_error: u64 = switches.iter().map(|s| s.commands_error as u64).sum();

            let mut metrics = Metrics::load(&self.settings.paths.metrics);
            metrics.record(
                step,
                iteration,
                ready.len() as u64,
                modems.len() as u64,
                unique_identities as u64,
                commands_ok,
                commands_error,
            );
            if let Err(e) = metrics.save(&self.settings.paths.metrics) {
                warn!("metrics write failed: {e}");
            }

            if !identities.is_empty() {
                let mut history = IdentityHistory::load(&self.settings.paths.identity_history);
                history.record(HistoryEntry::new(step, iteration, identities));
                if let Err(e) = history.save(&self.settings.paths.identity_history) {
                    warn!("identity history write failed: {e}");
                }
            }

            let modems_total = modems.len();
            let modems_ready = ready.len();
            let flagged = modems_total > 0
                && (modems_ready as f64 / modems_total as f64) < self.settings.alert_ratio;

            StepReport {
                step,
                iteration,
                switches,
                modems_total,
                modems_ready,
                unique_identities,
                activations_ok,
                activations_failed,
                flagged,
            }
        };

        // Let late registrations land before anything reopens the ports.
        if !cancel.is_cancelled() {
            sleep_cancellable(self.settings.timing.final_stabilize, cancel).await;
        }
        if manage_companion {
            self.companion.start().await;
        }
        report
    }

    fn persist_state(&self, state: &RotationState) {
        if let Err(e) = state.save(&self.settings.paths.state) {
            warn!("rotation state write failed: {e}");
        } else {
            debug!(
                step = state.current_step,
                iteration = state.iteration,
                "rotation state persisted"
            );
        }
    }

    fn log_report(&self, report: &StepReport) {
        if report.flagged {
            warn!(
                step = report.step,
                ready = report.modems_ready,
                total = report.modems_total,
                ratio = format!("{:.0}%", report.ready_ratio() * 100.0),
                threshold = format!("{:.0}%", self.settings.alert_ratio * 100.0),
                "step completed below the alert threshold"
            );
        } else {
            info!(
                step = report.step,
                iteration = report.iteration,
                ready = report.modems_ready,
                total = report.modems_total,
                unique = report.unique_identities,
                activated = report.activations_ok,
                activation_failures = report.activations_failed,
                "rotation step complete"
            );
        }
        for switch in &report.switches {
            debug!(
                pool = %switch.pool,
                slot = switch.slot,
                ok = switch.commands_ok,
                errors = switch.commands_error,
                verified = switch.changed,
                retried = switch.retried,
                "pool outcome"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::companion::NullCompanion;
    use crate::testing::{MemoryStore, ScriptedChannel};

    fn settings_in(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.paths.state = dir.join("state.json");
        settings.paths.metrics = dir.join("metrics.json");
        settings.paths.identity_history = dir.join("history.json");
        settings.paths.port_mapping = dir.join("ports.txt");
        settings
    }

    fn coordinator(
        channel: Arc<ScriptedChannel>,
        settings: Settings,
    ) -> RotationCoordinator {
        let registry = Arc::new(EndpointRegistry::new(
            settings.unstable_threshold,
            settings.blacklist_cooldown,
            &settings.permanent_blacklist,
        ));
        RotationCoordinator::new(
            vec![Pool::new("pool1", "bank0", 0)],
            channel,
            registry,
            Arc::new(MemoryStore::new()),
            Arc::new(NullCompanion),
            settings,
        )
    }

    fn script_healthy_modem(channel: &ScriptedChannel, port: &str, old: &str, new: &str) {
        channel.script("*", "AT+CPIN?", "+CPIN: READY");
        // Pre-switch sample sees the old card, every later read the new one.
        channel.script_seq(port, "AT+QCCID", &[old, new]);
        channel.script("*", "AT+CREG?", "+CREG: 0,1");
        channel.script("*", "AT+CSQ", "+CSQ: 22,99");
        // Cards already carry a number: activation short-circuits.
        channel.script(
            port,
            "AT+CPBR=1",
            "+CPBR: 1,\"+56911112222\",129,\"myphone\"",
        );
    }

    #[tokio::test(start_paused = true)]
    async fn a_full_step_switches_verifies_and_activates() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        let channel = Arc::new(ScriptedChannel::new());
        script_healthy_modem(
            &channel,
            "modem1",
            "8956039999999999991",
            "8956030000000000001",
        );
        script_healthy_modem(
            &channel,
            "modem2",
            "8956039999999999992",
            "8956030000000000002",
        );

        let coordinator = coordinator(channel.clone(), settings.clone());
        let cancel = CancellationToken::new();
        let available = vec![
            "bank0".to_string(),
            "modem1".to_string(),
            "modem2".to_string(),
        ];
        let report = coordinator
            .run_step(5, 1, &available, &cancel, false)
            .await;

        assert_eq!(report.step, 5);
        assert_eq!(report.modems_total, 2);
        assert_eq!(report.modems_ready, 2);
        assert_eq!(report.unique_identities, 2);
        assert_eq!(report.activations_ok, 2);
        assert_eq!(report.activations_failed, 0);
        assert!(!report.flagged);
        assert_eq!(report.switches.len(), 1);
        assert_eq!(report.switches[0].slot, 5);
        // The controller endpoint never joins the modem working set.
        assert_eq!(channel.count_sent("SWIT"), 8);

        let metrics = Metrics::load(&settings.paths.metrics);
        assert_eq!(metrics.total_rotations, 1);
        assert_eq!(metrics.total_ready, 2);
        let history = IdentityHistory::load(&settings.paths.identity_history);
        assert_eq!(history.len(), 1);
        assert_eq!(history.latest().unwrap().unique, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_modems_flag_the_step_but_commit_it() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        let channel = Arc::new(ScriptedChannel::new());
        // Modems answer the ping but the card never appears.
        channel.script("*", "AT+CPIN?", "");

        let coordinator = coordinator(channel.clone(), settings.clone());
        let cancel = CancellationToken::new();
        let available = vec!["bank0".to_string(), "modem1".to_string()];
        let report = coordinator
            .run_step(1, 1, &available, &cancel, false)
            .await;

        assert_eq!(report.modems_ready, 0);
        assert!(report.flagged);
        // The step still persisted its metrics.
        assert_eq!(Metrics::load(&settings.paths.metrics).total_rotations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_mode_persists_state_after_each_step() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        let channel = Arc::new(ScriptedChannel::new());

        let coordinator = coordinator(channel.clone(), settings.clone());
        let cancel = CancellationToken::new();
        let mut state = RotationState {
            current_step: 32,
            iteration: 1,
        };

        // Cancel during the post-step sleep: exactly one step runs.
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(120)).await;
            cancel_clone.cancel();
        });
        coordinator
            .run(
                RotationMode::Continuous {
                    interval: Duration::from_secs(1800),
                },
                &mut state,
                &cancel,
            )
            .await;

        // Step 32 wrapped the cycle.
        assert_eq!(state.current_step, 1);
        assert_eq!(state.iteration, 2);
        let persisted = RotationState::load(&settings.paths.state);
        assert_eq!(persisted, state);
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_mode_runs_to_the_end_of_the_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        let channel = Arc::new(ScriptedChannel::new());

        let coordinator = coordinator(channel.clone(), settings.clone());
        let cancel = CancellationToken::new();
        let mut state = RotationState {
            current_step: 30,
            iteration: 2,
        };

        coordinator
            .run(RotationMode::Bulk, &mut state, &cancel)
            .await;

        // Steps 30, 31, 32 processed, then the wrap ended the run.
        assert_eq!(state.current_step, 1);
        assert_eq!(state.iteration, 3);
        assert_eq!(Metrics::load(&settings.paths.metrics).total_rotations, 3);
    }
}
