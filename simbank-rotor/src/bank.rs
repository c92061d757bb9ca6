//! Bank controller: drives one physical switch unit.
//!
//! Each controller owns up to eight logical ports and a fixed slot offset.
//! Switching a rotation step means sending one `SWIT<port>-<slot>` line per
//! logical port, waiting out the mechanical settle, and confirming through a
//! small identity sample that the exposed cards actually changed. The sample
//! covers at most three modems; full-fleet verification happens later in the
//! modem verifier, this stage only decides whether the switch commands need
//! one retransmission.
//!
//! Known precision gap: the sample is drawn from the global modem working
//! set because the physical port-to-pool wiring is not tracked anywhere, so
//! a fully failed pool can escape detection when the sampled modems happen
//! to sit on a sibling pool's wiring.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time;
use tracing::{debug, info, warn};

use crate::channel::{self, CommandChannel};
use crate::config::{Pool, SLOT_MAX, Timing};
use crate::modem::{self, CardIdentity};

/// Modems sampled for identity-change verification per switch.
const VERIFY_SAMPLE: usize = 3;

/// Consecutive failed switches before the controller itself gets reset.
const RESET_STREAK: u32 = 3;

/// Soft reset accepted by the bank controller firmware.
const CONTROLLER_RESET: &str = "AT+CFUN=1,1";

/// The physical slot a pool exposes for a given rotation step.
pub fn real_slot(step: u8, offset: u8) -> u8 {
    (((u16::from(step) - 1 + u16::from(offset)) % u16::from(SLOT_MAX)) + 1) as u8
}

/// Retry policy for a failed switch verification: exactly one
/// retransmission of all switch commands plus an extended settle.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub extra_settle: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            extra_settle: Duration::from_secs(3),
        }
    }
}

/// Aggregate result of switching one pool to one step.
#[derive(Debug, Clone)]
pub struct SwitchOutcome {
    pub pool: String,
    pub slot: u8,
    pub commands_ok: usize,
    pub commands_error: usize,
    /// Sampled modems whose identity was readable before the switch.
    pub sample_size: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub retried: bool,
}

impl SwitchOutcome {
    /// Every command was rejected: the controller itself is in trouble.
    pub fn is_failure(&self) -> bool {
        self.commands_ok == 0 && self.commands_error > 0
    }
}

/// One physical switch unit and its retry state.
pub struct BankController {
    pool: Pool,
    channel: Arc<dyn CommandChannel>,
    timing: Timing,
    retry: RetryPolicy,
    failure_streak: AtomicU32,
}

impl BankController {
    pub fn new(
        pool: Pool,
        channel: Arc<dyn CommandChannel>,
        timing: Timing,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            channel,
            timing,
            retry,
            failure_streak: AtomicU32::new(0),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Switch every logical port of this pool to the slot for `step`,
    /// verify via identity sampling, retransmit once if the sample shows
    /// no change.
    ///
    /// `sample_from` is the registry's active modem snapshot; up to three
    /// endpoints are drawn from it. Pool-scoped: never blocks or consults
    /// sibling pools.
    pub async fn switch(&self, step: u8, sample_from: &[String]) -> SwitchOutcome {
        let slot = real_slot(step, self.pool.offset);
        info!(
            pool = %self.pool.name,
            controller = %self.pool.controller,
            step,
            slot,
            offset = self.pool.offset,
            "switching"
        );

        let mut before = HashMap::new();
        for port in sample_from.iter().take(VERIFY_SAMPLE) {
            if let Some(identity) = modem::read_identity(self.channel.as_ref(), port).await {
                before.insert(port.clone(), identity);
            }
        }

        let (commands_ok, commands_error) = self.transmit(slot).await;
        time::sleep(self.timing.settle).await;

        let (mut changed, mut unchanged) = self.check_sample(&before).await;
        let mut retried = false;
        if !unchanged.is_empty() {
            for _ in 0..self.retry.max_retries {
                warn!(
                    pool = %self.pool.name,
                    unchanged = unchanged.len(),
                    sampled = before.len(),
                    "identity sample unchanged, retransmitting switch commands"
                );
                retried = true;
                self.transmit(slot).await;
                time::sleep(self.timing.settle + self.retry.extra_settle).await;
                (changed, unchanged) = self.check_sample(&before).await;
                if unchanged.is_empty() {
                    break;
                }
            }
            if unchanged.is_empty() {
                info!(pool = %self.pool.name, "retransmission verified");
            } else {
                warn!(
                    pool = %self.pool.name,
                    controller = %self.pool.controller,
                    unchanged = unchanged.len(),
                    "identities still unchanged after retry, possible hardware fault"
                );
            }
        }

        let outcome = SwitchOutcome {
            pool: self.pool.name.clone(),
            slot,
            commands_ok,
            commands_error,
            sample_size: before.len(),
            changed,
            unchanged: unchanged.len(),
            retried,
        };

        if outcome.is_failure() {
            self.record_switch_failure().await;
        } else {
            self.failure_streak.store(0, Ordering::SeqCst);
        }
        outcome
    }

    /// Send one switch command per logical port. An OK token or silence both
    /// count as success: some controller firmwares acknowledge silently.
    async fn transmit(&self, slot: u8) -> (usize, usize) {
        let mut ok = 0;
        let mut errors = 0;
        for port in &self.pool.logical_ports {
            let command = format!("SWIT{port:02}-{slot:04}");
            match self
                .channel
                .send(&self.pool.controller, &command, self.timing.command_wait)
                .await
            {
                Ok(response) if channel::is_error(&response) => {
                    debug!(pool = %self.pool.name, command, response = %response, "switch rejected");
                    errors += 1;
                }
                Ok(_) => ok += 1,
                Err(e) => {
                    warn!(pool = %self.pool.name, command, "switch transport fault: {e}");
                    errors += 1;
                }
            }
            time::sleep(self.timing.inter_command_gap).await;
        }
        (ok, errors)
    }

    /// Re-read the sampled identities and split them into changed/unchanged.
    /// Unreadable modems are not counted either way: mid-switch a card can
    /// legitimately be absent for a while.
    async fn check_sample(
        &self,
        before: &HashMap<String, CardIdentity>,
    ) -> (usize, Vec<String>) {
        let mut changed = 0;
        let mut unchanged = Vec::new();
        for (port, previous) in before {
            if let Some(current) = modem::read_identity(self.channel.as_ref(), port).await {
                if current == *previous {
                    debug!(port, identity = %current, "identity unchanged");
                    unchanged.push(port.clone());
                } else {
                    changed += 1;
                }
            }
        }
        (changed, unchanged)
    }

    async fn record_switch_failure(&self) {
        let streak = self.failure_streak.fetch_add(1, Ordering::SeqCst) + 1;
        if streak < RESET_STREAK {
            return;
        }
        warn!(
            pool = %self.pool.name,
            streak,
            "consecutive switch failures, resetting controller"
        );
        if let Err(e) = channel::send_resilient(
            self.channel.as_ref(),
            &self.pool.controller,
            CONTROLLER_RESET,
            self.timing.command_wait,
            2,
        )
        .await
        {
            warn!(pool = %self.pool.name, "controller reset failed: {e}");
        }
        time::sleep(Duration::from_secs(3)).await;
        self.failure_streak.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedChannel;
    use test_case::test_case;

    fn controller(pool: Pool, channel: Arc<ScriptedChannel>) -> BankController {
        BankController::new(pool, channel, Timing::default(), RetryPolicy::default())
    }

    #[test_case(1, 0, 1)]
    #[test_case(5, 0, 5)]
    #[test_case(5, 8, 13)]
    #[test_case(5, 16, 21)]
    #[test_case(5, 24, 29)]
    #[test_case(32, 0, 32)]
    #[test_case(32, 24, 24)]
    #[test_case(25, 8, 1)]
    fn real_slot_formula(step: u8, offset: u8, expected: u8) {
        assert_eq!(real_slot(step, offset), expected);
    }

    #[test]
    fn real_slot_stays_in_range_for_every_step_and_offset() {
        for step in 1..=SLOT_MAX {
            for offset in 0..SLOT_MAX {
                let slot = real_slot(step, offset);
                assert!((1..=SLOT_MAX).contains(&slot), "step {step} offset {offset}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silence_counts_as_success() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.script("bank0", "SWIT", "");

        let pool = Pool::new("pool1", "bank0", 0);
        let outcome = controller(pool, channel.clone()).switch(5, &[]).await;

        assert_eq!(outcome.slot, 5);
        assert_eq!(outcome.commands_ok, 8);
        assert_eq!(outcome.commands_error, 0);
        assert!(!outcome.retried);
        assert_eq!(channel.count_sent("SWIT"), 8);
        // Commands carry the zero-padded wire format.
        assert!(channel.sent().iter().any(|(_, c)| c == "SWIT01-0005"));
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_sample_triggers_exactly_one_retransmission() {
        let channel = Arc::new(ScriptedChannel::new());
        // Pre-switch read, first post-switch check (unchanged), second check
        // (changed). The bank then reports success without a second retry.
        channel.script_seq(
            "modem1",
            "AT+QCCID",
            &[
                "8956030000000000001",
                "8956030000000000001",
                "8956030000000000002",
            ],
        );

        let pool = Pool::new("pool1", "bank0", 0);
        let outcome = controller(pool, channel.clone())
            .switch(7, &["modem1".to_string()])
            .await;

        assert!(outcome.retried);
        assert_eq!(outcome.sample_size, 1);
        assert_eq!(outcome.changed, 1);
        assert_eq!(outcome.unchanged, 0);
        // 8 ports, transmitted twice.
        assert_eq!(channel.count_sent("SWIT"), 16);
        assert_eq!(channel.count_sent("AT+QCCID"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn changed_sample_does_not_retry() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.script_seq(
            "modem1",
            "AT+QCCID",
            &["8956030000000000001", "8956030000000000002"],
        );

        let pool = Pool::new("pool1", "bank0", 8);
        let outcome = controller(pool, channel.clone())
            .switch(5, &["modem1".to_string()])
            .await;

        assert_eq!(outcome.slot, 13);
        assert!(!outcome.retried);
        assert_eq!(outcome.changed, 1);
        assert_eq!(channel.count_sent("SWIT"), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn sample_is_capped_at_three_modems() {
        let channel = Arc::new(ScriptedChannel::new());
        for n in 1..=5 {
            channel.script(
                &format!("modem{n}"),
                "AT+QCCID",
                &format!("895603000000000000{n}"),
            );
        }

        let pool = Pool::new("pool1", "bank0", 0);
        let modems: Vec<String> = (1..=5).map(|n| format!("modem{n}")).collect();
        let outcome = controller(pool, channel.clone()).switch(1, &modems).await;

        assert_eq!(outcome.sample_size, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_switches_reset_the_controller_after_a_streak() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.script("bank0", "SWIT", "ERROR");

        let pool = Pool::new("pool1", "bank0", 0);
        let bank = controller(pool, channel.clone());
        for step in 1..=3 {
            let outcome = bank.switch(step, &[]).await;
            assert!(outcome.is_failure());
        }

        assert_eq!(channel.count_sent(CONTROLLER_RESET), 1);
    }
}
