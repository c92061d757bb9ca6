//! Card activation for the managed carrier.
//!
//! A freshly exposed card has no phone number until the carrier assigns one.
//! The sequence per modem: short-circuit if the card already carries a
//! stored number (rotations re-expose the same cards every cycle), purge
//! stale inbound messages, fire the activation trigger, wait for the
//! carrier's reply and scan every message storage for a number. The
//! discovered number is persisted three ways: the local record, the external
//! upsert, and the card's own phonebook so the card re-identifies itself
//! offline.
//!
//! Network registration is a precondition handled by the modem verifier;
//! only modems it reported ready are handed to this stage.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::CommandChannel;
use crate::config::{Budgets, Timing};
use crate::modem::CardIdentity;
use crate::store::NumberStore;
use crate::tasks::sleep_cancellable;

const AT_TEXT_MODE: &str = "AT+CMGF=1";
const AT_SELECT_PHONEBOOK: &str = "AT+CPBS=\"SM\"";
const AT_READ_CONTACT: &str = "AT+CPBR=1";
const AT_PURGE_MESSAGES: &str = "AT+CMGD=1,4";
const AT_LIST_MESSAGES: &str = "AT+CMGL=\"ALL\"";

/// Message storage areas scanned for the carrier's reply.
const MESSAGE_STORES: [&str; 2] = ["SM", "ME"];

/// Contact slot used as on-card key-value storage for the own number.
const CONTACT_NAME: &str = "myphone";

/// Explicit no-service error from the network.
const NO_SERVICE: &str = "+CME ERROR: 30";

static STORED_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\+CPBR:\s*1,"(\+?\d{9,13})""#).expect("phonebook regex"));

/// Ordered patterns for the assigned number inside the carrier's reply.
/// First match wins.
static NUMBER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"Tu numero es (\d+)",
        r"\+?569\s?(\d{4}\s?\d{4})",
        r"\b(\d{9})\b",
        r"(?i)tu\s*n[uú]mero\s*es\s*([\d\s]+)",
        r"https://fif\.clarovtrcloud\.com/aod/form\?t=(\d+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("number pattern"))
    .collect()
});

/// Outcome of one activation pass over one modem.
#[derive(Debug, Clone)]
pub struct ActivationRecord {
    pub port: String,
    pub identity: CardIdentity,
    pub number: Option<String>,
    /// Activation trigger transmissions sent, including no-service retries.
    pub attempts: u32,
    pub activated: bool,
}

enum Trigger {
    Sent,
    NoService,
    Cancelled,
}

/// Drives the activation protocol against one modem at a time.
pub struct ActivationOrchestrator {
    channel: Arc<dyn CommandChannel>,
    store: Arc<dyn NumberStore>,
    carrier_prefix: String,
    activation_code: String,
    budgets: Budgets,
    timing: Timing,
}

impl ActivationOrchestrator {
    pub fn new(
        channel: Arc<dyn CommandChannel>,
        store: Arc<dyn NumberStore>,
        carrier_prefix: impl Into<String>,
        activation_code: impl Into<String>,
        budgets: Budgets,
        timing: Timing,
    ) -> Self {
        Self {
            channel,
            store,
            carrier_prefix: carrier_prefix.into(),
            activation_code: activation_code.into(),
            budgets,
            timing,
        }
    }

    /// Activate the card in `port` if it belongs to the managed carrier and
    /// has no number yet.
    pub async fn activate(
        &self,
        port: &str,
        identity: &CardIdentity,
        cancel: &CancellationToken,
    ) -> ActivationRecord {
        let mut record = ActivationRecord {
            port: port.to_string(),
            identity: identity.clone(),
            number: None,
            attempts: 0,
            activated: false,
        };

        if !identity.has_prefix(&self.carrier_prefix) {
            debug!(port, identity = %identity, "unmanaged carrier, nothing to activate");
            record.activated = true;
            return record;
        }

        // Idempotence gate: a card that already knows its number must never
        // re-trigger activation, no matter how many rotations re-expose it.
        if let Some(number) = self.read_stored_number(port).await {
            info!(port, identity = %identity, number, "card already activated");
            self.persist(port, identity, &number, false).await;
            record.number = Some(number);
            record.activated = true;
            return record;
        }
        match self.store.lookup(identity).await {
            Ok(Some(number)) => {
                info!(port, identity = %identity, number, "number on record, rewriting card");
                self.persist(port, identity, &number, true).await;
                record.number = Some(number);
                record.activated = true;
                return record;
            }
            Ok(None) => {}
            Err(e) => warn!(port, "number store lookup failed: {e}"),
        }

        // Replies from the previous card must not be mistaken for ours.
        self.purge_messages(port).await;

        for cycle in 1..=self.budgets.activation_attempts {
            debug!(
                port,
                cycle,
                budget = self.budgets.activation_attempts,
                "activation attempt"
            );
            match self.send_trigger(port, &mut record.attempts, cancel).await {
                Trigger::Sent => {}
                Trigger::NoService => {
                    warn!(port, cycle, "no network service, deferring attempt");
                    if !sleep_cancellable(self.budgets.activation_retry_wait, cancel).await {
                        break;
                    }
                    continue;
                }
                Trigger::Cancelled => break,
            }

            if !sleep_cancellable(self.budgets.activation_settle, cancel).await {
                break;
            }

            if let Some(number) = self.scan_messages(port).await {
                info!(port, identity = %identity, number, attempts = record.attempts, "activated");
                self.persist(port, identity, &number, true).await;
                record.number = Some(number);
                record.activated = true;
                return record;
            }

            if cycle < self.budgets.activation_attempts
                && !sleep_cancellable(self.budgets.activation_retry_wait, cancel).await
            {
                break;
            }
        }

        warn!(
            port,
            identity = %identity,
            attempts = record.attempts,
            "no number obtained"
        );
        record
    }

    /// Read the number previously written into the card's phonebook.
    async fn read_stored_number(&self, port: &str) -> Option<String> {
        // The SIM filesystem needs a moment after exposure before phonebook
        // access stops failing with busy errors.
        time::sleep(self.timing.sim_access_delay).await;
        self.channel
            .send(port, AT_SELECT_PHONEBOOK, self.timing.inter_command_gap)
            .await
            .ok()?;
        let response = self
            .channel
            .send(port, AT_READ_CONTACT, self.timing.command_wait)
            .await
            .ok()?;
        let number = STORED_NUMBER_RE.captures(&response)?.get(1)?.as_str();
        Some(number.trim_start_matches('+').to_string())
    }

    async fn purge_messages(&self, port: &str) {
        for store in MESSAGE_STORES {
            let select = format!("AT+CPMS=\"{store}\"");
            let _ = self
                .channel
                .send(port, &select, self.timing.inter_command_gap)
                .await;
            match self
                .channel
                .send(port, AT_PURGE_MESSAGES, self.timing.command_wait)
                .await
            {
                Ok(_) => debug!(port, store, "stale messages purged"),
                Err(e) => debug!(port, store, "purge failed: {e}"),
            }
        }
    }

    /// Send the activation trigger, retrying on explicit no-service errors.
    /// Every transmission counts toward `attempts`.
    async fn send_trigger(
        &self,
        port: &str,
        attempts: &mut u32,
        cancel: &CancellationToken,
    ) -> Trigger {
        let command = format!("AT+CUSD=1,\"{}\",15", self.activation_code);
        for retry in 1..=self.budgets.no_service_retries {
            *attempts += 1;
            let response = match self
                .channel
                .send(port, &command, self.timing.command_wait)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(port, "trigger transport fault: {e}");
                    String::new()
                }
            };
            if !response.contains(NO_SERVICE) {
                debug!(port, attempt = *attempts, "activation trigger sent");
                return Trigger::Sent;
            }
            debug!(
                port,
                retry,
                budget = self.budgets.no_service_retries,
                "no service, backing off"
            );
            if retry < self.budgets.no_service_retries
                && !sleep_cancellable(self.budgets.no_service_wait, cancel).await
            {
                return Trigger::Cancelled;
            }
        }
        Trigger::NoService
    }

    /// Scan every message storage for the carrier's reply.
    async fn scan_messages(&self, port: &str) -> Option<String> {
        let _ = self
            .channel
            .send(port, AT_TEXT_MODE, self.timing.inter_command_gap)
            .await;
        for store in MESSAGE_STORES {
            let select = format!("AT+CPMS=\"{store}\"");
            let _ = self
                .channel
                .send(port, &select, self.timing.inter_command_gap)
                .await;
            let Ok(listing) = self
                .channel
                .send(port, AT_LIST_MESSAGES, self.timing.command_wait * 2)
                .await
            else {
                continue;
            };
            if let Some(number) = extract_number(&listing) {
                debug!(port, store, number, "number found in inbox");
                return Some(number);
            }
        }
        None
    }

    /// Persist the number everywhere it belongs. Store failures are logged
    /// and swallowed; the phonebook write is what makes future rotations
    /// short-circuit.
    async fn persist(&self, port: &str, identity: &CardIdentity, number: &str, write_card: bool) {
        if let Err(e) = self.store.save(identity, number).await {
            warn!(port, identity = %identity, "number store save failed: {e}");
        }
        if write_card {
            let _ = self
                .channel
                .send(port, AT_SELECT_PHONEBOOK, self.timing.inter_command_gap)
                .await;
            let write = format!("AT+CPBW=1,\"{number}\",129,\"{CONTACT_NAME}\"");
            match self.channel.send(port, &write, self.timing.command_wait).await {
                Ok(_) => debug!(port, number, "number written to card"),
                Err(e) => warn!(port, "phonebook write failed: {e}"),
            }
        }
    }
}

/// Extract and normalize an assigned number from reply text.
///
/// Numbers are normalized to the carrier's `569` + 8-digit form regardless
/// of how the reply spells them.
pub fn extract_number(text: &str) -> Option<String> {
    for pattern in NUMBER_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(text) {
            let digits: String = captures
                .get(1)?
                .as_str()
                .chars()
                .filter(|c| c.is_ascii_digit())
                .collect();
            if digits.len() >= 8 {
                let suffix = &digits[digits.len() - 8..];
                return Some(format!("569{suffix}"));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryStore, ScriptedChannel};
    use test_case::test_case;

    fn orchestrator(
        channel: Arc<ScriptedChannel>,
        store: Arc<MemoryStore>,
    ) -> ActivationOrchestrator {
        ActivationOrchestrator::new(
            channel,
            store,
            "895603",
            "*103#",
            Budgets::default(),
            Timing::default(),
        )
    }

    fn managed_identity() -> CardIdentity {
        CardIdentity::for_tests("8956030000000000001")
    }

    #[test_case("Tu numero es 987654321", "56987654321")]
    #[test_case("mensaje: +569 1234 5678 fin", "56912345678")]
    #[test_case("bienvenido 912345678", "56912345678")]
    #[test_case("https://fif.clarovtrcloud.com/aod/form?t=56911223344", "56911223344")]
    fn reply_patterns_extract_numbers(text: &str, expected: &str) {
        assert_eq!(extract_number(text).as_deref(), Some(expected));
    }

    #[test]
    fn unrelated_text_yields_no_number() {
        assert_eq!(extract_number("OK"), None);
        assert_eq!(extract_number(""), None);
    }

    #[tokio::test(start_paused = true)]
    async fn unmanaged_carrier_is_skipped_without_touching_the_modem() {
        let channel = Arc::new(ScriptedChannel::new());
        let store = Arc::new(MemoryStore::new());
        let identity = CardIdentity::for_tests("8944110000000000001");

        let cancel = CancellationToken::new();
        let record = orchestrator(channel.clone(), store)
            .activate("COM4", &identity, &cancel)
            .await;

        assert!(record.activated);
        assert_eq!(record.attempts, 0);
        assert!(channel.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stored_number_short_circuits_without_retriggering() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.script(
            "COM4",
            AT_READ_CONTACT,
            "+CPBR: 1,\"+56912345678\",129,\"myphone\"",
        );
        let store = Arc::new(MemoryStore::new());

        let cancel = CancellationToken::new();
        let record = orchestrator(channel.clone(), store.clone())
            .activate("COM4", &managed_identity(), &cancel)
            .await;

        assert!(record.activated);
        assert_eq!(record.number.as_deref(), Some("56912345678"));
        assert_eq!(record.attempts, 0);
        assert_eq!(channel.count_sent("AT+CUSD"), 0);
        // The local record is brought in sync with the card.
        assert_eq!(
            store.entries(),
            vec![(
                "8956030000000000001".to_string(),
                "56912345678".to_string()
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn number_on_record_is_rewritten_to_the_card() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.script("COM4", AT_READ_CONTACT, "OK");
        let store = Arc::new(MemoryStore::new());
        store
            .save(&managed_identity(), "56999887766")
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let record = orchestrator(channel.clone(), store)
            .activate("COM4", &managed_identity(), &cancel)
            .await;

        assert!(record.activated);
        assert_eq!(record.attempts, 0);
        assert_eq!(channel.count_sent("AT+CUSD"), 0);
        assert_eq!(channel.count_sent("AT+CPBW"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_service_twice_then_success_counts_three_attempts() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.script("COM4", AT_READ_CONTACT, "OK");
        channel.script_seq(
            "COM4",
            "AT+CUSD",
            &["+CME ERROR: 30", "+CME ERROR: 30", "OK"],
        );
        channel.script("COM4", AT_LIST_MESSAGES, "+CMGL: 1\r\nTu numero es 987654321");
        let store = Arc::new(MemoryStore::new());

        let cancel = CancellationToken::new();
        let record = orchestrator(channel.clone(), store.clone())
            .activate("COM4", &managed_identity(), &cancel)
            .await;

        assert_eq!(record.attempts, 3);
        assert!(record.activated);
        assert_eq!(record.number.as_deref(), Some("56987654321"));
        assert_eq!(store.entries().len(), 1);
        assert_eq!(channel.count_sent("AT+CPBW"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_record_failure() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.script("COM4", AT_READ_CONTACT, "OK");
        channel.script("COM4", AT_LIST_MESSAGES, "+CMGL: (empty)");
        let store = Arc::new(MemoryStore::new());

        let cancel = CancellationToken::new();
        let record = orchestrator(channel.clone(), store)
            .activate("COM4", &managed_identity(), &cancel)
            .await;

        assert!(!record.activated);
        assert_eq!(record.number, None);
        assert_eq!(
            record.attempts,
            Budgets::default().activation_attempts
        );
        // Stale messages were purged before the first trigger.
        assert_eq!(channel.count_sent(AT_PURGE_MESSAGES), 2);
    }
}
