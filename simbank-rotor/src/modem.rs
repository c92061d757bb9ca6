//! Modem lifecycle verification over the AT surface.
//!
//! After a slot switch every modem walks a small state machine before it may
//! feed the activation stage:
//!
//! ```text
//! Unverified ──AT ping ok──► Responsive ──reboot sent──► Rebooting
//!     Rebooting ──card ready poll──► CardReady ──registration poll──► Ready
//! ```
//!
//! Any poll loop that exhausts its attempt budget lands in `TimedOut`; a
//! registration denial short-circuits there immediately. Port-level
//! blacklisting across steps is the endpoint registry's concern, not ours.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{self, CommandChannel};
use crate::config::{Budgets, Timing};

const AT_PING: &str = "AT";
const AT_REBOOT: &str = "AT+CFUN=1,1";
const AT_CARD_STATE: &str = "AT+CPIN?";
const AT_IDENTITY: &str = "AT+QCCID";
const AT_REGISTRATION: &str = "AT+CREG?";
const AT_SIGNAL: &str = "AT+CSQ";

/// Short read wait for identity sampling around slot switches.
const IDENTITY_WAIT: Duration = Duration::from_millis(800);
const CARD_STATE_WAIT: Duration = Duration::from_millis(800);

static IDENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{19,20}").expect("identity regex"));
static REGISTRATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+CREG:\s*\d+,(\d+)").expect("registration regex"));
static SIGNAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+CSQ:\s*(\d+),").expect("signal regex"));

/// Hardware identity of the inserted card (ICCID-equivalent).
///
/// Opaque to the engine except for the carrier-prefix check; its only real
/// job is change detection across slot switches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CardIdentity(String);

impl CardIdentity {
    /// Extract an identity from a raw query response, if one is present.
    pub fn from_response(response: &str) -> Option<Self> {
        IDENTITY_RE
            .find(response)
            .map(|m| Self(m.as_str().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this card belongs to the carrier with the given prefix.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl std::fmt::Display for CardIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
impl CardIdentity {
    pub fn for_tests(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// Network registration status as reported by the 2-field query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RegistrationStatus {
    /// Registered on the home network.
    Home,
    /// Registered while roaming.
    Roaming,
    /// Still searching for a network: keep polling.
    Searching,
    /// Registration denied by the network: do not retry.
    Denied,
    NotRegistered,
    Unknown,
}

impl RegistrationStatus {
    pub fn from_response(response: &str) -> Option<Self> {
        let code = REGISTRATION_RE.captures(response)?.get(1)?.as_str();
        Some(match code {
            "0" => Self::NotRegistered,
            "1" => Self::Home,
            "2" => Self::Searching,
            "3" => Self::Denied,
            "5" => Self::Roaming,
            _ => Self::Unknown,
        })
    }

    pub fn is_registered(self) -> bool {
        matches!(self, Self::Home | Self::Roaming)
    }
}

/// Lifecycle phase of a modem within one rotation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
pub enum ModemPhase {
    Unverified,
    Responsive,
    Rebooting,
    CardReady,
    Ready,
    TimedOut,
}

/// Outcome of verifying one modem.
#[derive(Debug, Clone)]
pub struct ModemReport {
    pub port: String,
    /// Terminal state: `Ready` or `TimedOut`.
    pub phase: ModemPhase,
    /// Furthest lifecycle phase attained before the terminal state.
    pub reached: ModemPhase,
    pub identity: Option<CardIdentity>,
    pub registration: Option<RegistrationStatus>,
    /// Signal quality (0-31, 99 = unknown), diagnostic only.
    pub rssi: Option<u8>,
}

impl ModemReport {
    pub fn is_ready(&self) -> bool {
        self.phase == ModemPhase::Ready
    }

    fn timed_out(port: &str, reached: ModemPhase) -> Self {
        Self {
            port: port.to_string(),
            phase: ModemPhase::TimedOut,
            reached,
            identity: None,
            registration: None,
            rssi: None,
        }
    }
}

/// Read the card identity of a modem with a short wait.
///
/// Used both by the verifier and by the bank controllers' switch-verification
/// sampling, where speed matters more than certainty.
pub async fn read_identity(channel: &dyn CommandChannel, port: &str) -> Option<CardIdentity> {
    match channel.send(port, AT_IDENTITY, IDENTITY_WAIT).await {
        Ok(response) => CardIdentity::from_response(&response),
        Err(_) => None,
    }
}

/// Drives the per-modem verification state machine.
pub struct ModemVerifier {
    channel: Arc<dyn CommandChannel>,
    budgets: Budgets,
    timing: Timing,
}

impl ModemVerifier {
    pub fn new(channel: Arc<dyn CommandChannel>, budgets: Budgets, timing: Timing) -> Self {
        Self {
            channel,
            budgets,
            timing,
        }
    }

    /// Verify one modem: confirm it answers, reboot it, wait for the card
    /// and for network registration, and report its identity.
    pub async fn verify(&self, port: &str, cancel: &CancellationToken) -> ModemReport {
        // Responsiveness gate. A modem that cannot even echo OK is not worth
        // the reboot-and-poll budget.
        let ping = channel::send_resilient(
            self.channel.as_ref(),
            port,
            AT_PING,
            self.timing.command_wait,
            self.budgets.command_retries,
        )
        .await;
        match ping {
            Ok(response) if channel::is_ok(&response) => {}
            _ => {
                debug!(port, "modem not responsive");
                return ModemReport::timed_out(port, ModemPhase::Unverified);
            }
        }

        // Soft reboot so the modem re-reads whatever card the switch exposed.
        let reboot = self
            .channel
            .send(port, AT_REBOOT, self.timing.command_wait)
            .await
            .and_then(|response| channel::ensure_ok(port, response));
        if let Err(e) = reboot {
            warn!(port, "reboot failed: {e}");
            return ModemReport::timed_out(port, ModemPhase::Responsive);
        }

        if !self.wait_card_ready(port, cancel).await {
            return ModemReport::timed_out(port, ModemPhase::Rebooting);
        }

        let Some(identity) = read_identity(self.channel.as_ref(), port).await else {
            debug!(port, "card ready but identity unreadable");
            return ModemReport::timed_out(port, ModemPhase::Rebooting);
        };

        let registration = self.wait_registration(port, cancel).await;
        if !registration.map(RegistrationStatus::is_registered).unwrap_or(false) {
            let mut report = ModemReport::timed_out(port, ModemPhase::CardReady);
            report.identity = Some(identity);
            report.registration = registration;
            return report;
        }

        let rssi = self.read_signal(port).await;
        info!(port, identity = %identity, ?registration, ?rssi, "modem ready");
        ModemReport {
            port: port.to_string(),
            phase: ModemPhase::Ready,
            reached: ModemPhase::Ready,
            identity: Some(identity),
            registration,
            rssi,
        }
    }

    /// Poll the card-presence query until the SIM reports ready.
    async fn wait_card_ready(&self, port: &str, cancel: &CancellationToken) -> bool {
        for attempt in 1..=self.budgets.card_ready_attempts {
            match self.channel.send(port, AT_CARD_STATE, CARD_STATE_WAIT).await {
                Ok(response) if response.contains("+CPIN: READY") => {
                    debug!(port, attempt, "card ready");
                    return true;
                }
                Ok(response) if response.contains("+CPIN:") => {
                    debug!(port, attempt, response = %response, "card present, not ready");
                }
                Ok(_) => {
                    if attempt % 3 == 1 {
                        debug!(
                            port,
                            attempt,
                            budget = self.budgets.card_ready_attempts,
                            "waiting for card"
                        );
                    }
                }
                Err(e) => {
                    debug!(port, attempt, "card state query failed: {e}");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = time::sleep(self.budgets.card_ready_interval) => {}
            }
        }
        warn!(
            port,
            attempts = self.budgets.card_ready_attempts,
            "card never became ready"
        );
        false
    }

    /// Poll network registration.
    ///
    /// Home and roaming both count as registered; searching keeps polling
    /// with sparse logging; a denial fails immediately without consuming the
    /// remaining budget.
    async fn wait_registration(
        &self,
        port: &str,
        cancel: &CancellationToken,
    ) -> Option<RegistrationStatus> {
        let mut last = None;
        for attempt in 1..=self.budgets.registration_attempts {
            let response = match self
                .channel
                .send(port, AT_REGISTRATION, self.timing.command_wait)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    debug!(port, attempt, "registration query failed: {e}");
                    String::new()
                }
            };
            if let Some(status) = RegistrationStatus::from_response(&response) {
                last = Some(status);
                match status {
                    RegistrationStatus::Home | RegistrationStatus::Roaming => {
                        debug!(port, attempt, %status, "registered");
                        return Some(status);
                    }
                    RegistrationStatus::Denied => {
                        warn!(port, attempt, "registration denied by the network");
                        return Some(status);
                    }
                    RegistrationStatus::Searching => {
                        if attempt % 3 == 1 {
                            debug!(
                                port,
                                attempt,
                                budget = self.budgets.registration_attempts,
                                "searching for network"
                            );
                        }
                    }
                    _ => {
                        if attempt % 3 == 1 {
                            debug!(port, attempt, %status, "not registered");
                        }
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return last,
                _ = time::sleep(self.budgets.registration_interval) => {}
            }
        }
        warn!(
            port,
            attempts = self.budgets.registration_attempts,
            "registration never completed"
        );
        last
    }

    async fn read_signal(&self, port: &str) -> Option<u8> {
        let response = self
            .channel
            .send(port, AT_SIGNAL, self.timing.command_wait)
            .await
            .ok()?;
        let rssi: u8 = SIGNAL_RE.captures(&response)?.get(1)?.as_str().parse().ok()?;
        if rssi != 99 && rssi < 10 {
            debug!(port, rssi, "weak signal");
        }
        Some(rssi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedChannel;
    use test_case::test_case;

    fn verifier(channel: Arc<ScriptedChannel>) -> ModemVerifier {
        ModemVerifier::new(channel, Budgets::default(), Timing::default())
    }

    #[test]
    fn identity_is_extracted_from_noisy_responses() {
        let id = CardIdentity::from_response("AT+QCCID\r\n+QCCID: 8956031234567890123\r\nOK");
        assert_eq!(id.unwrap().as_str(), "8956031234567890123");
        assert!(CardIdentity::from_response("ERROR").is_none());
    }

    #[test_case("+CREG: 0,1", RegistrationStatus::Home)]
    #[test_case("+CREG: 0,5", RegistrationStatus::Roaming)]
    #[test_case("+CREG: 0,2", RegistrationStatus::Searching)]
    #[test_case("+CREG: 0,3", RegistrationStatus::Denied)]
    #[test_case("+CREG: 2,0", RegistrationStatus::NotRegistered)]
    fn registration_codes_parse(response: &str, expected: RegistrationStatus) {
        assert_eq!(RegistrationStatus::from_response(response), Some(expected));
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_reaches_ready() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.script("*", AT_CARD_STATE, "+CPIN: READY\r\nOK");
        channel.script("*", AT_IDENTITY, "+QCCID: 8956031111111111111\r\nOK");
        channel.script_seq("*", AT_REGISTRATION, &["+CREG: 0,2", "+CREG: 0,1"]);
        channel.script("*", AT_SIGNAL, "+CSQ: 21,99\r\nOK");

        let cancel = CancellationToken::new();
        let report = verifier(channel.clone()).verify("COM4", &cancel).await;

        assert!(report.is_ready());
        assert_eq!(report.identity.unwrap().as_str(), "8956031111111111111");
        assert_eq!(report.registration, Some(RegistrationStatus::Home));
        assert_eq!(report.rssi, Some(21));
        // Searching once, registered on the second poll.
        assert_eq!(channel.count_sent(AT_REGISTRATION), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn denial_fails_without_consuming_the_poll_budget() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.script("*", AT_CARD_STATE, "+CPIN: READY");
        channel.script("*", AT_IDENTITY, "8956032222222222222");
        channel.script("*", AT_REGISTRATION, "+CREG: 0,3");

        let cancel = CancellationToken::new();
        let report = verifier(channel.clone()).verify("COM4", &cancel).await;

        assert_eq!(report.phase, ModemPhase::TimedOut);
        assert_eq!(report.reached, ModemPhase::CardReady);
        assert_eq!(report.registration, Some(RegistrationStatus::Denied));
        assert_eq!(channel.count_sent(AT_REGISTRATION), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn card_that_never_appears_exhausts_the_budget() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.script("*", AT_CARD_STATE, "");

        let cancel = CancellationToken::new();
        let report = verifier(channel.clone()).verify("COM4", &cancel).await;

        assert_eq!(report.phase, ModemPhase::TimedOut);
        assert_eq!(report.reached, ModemPhase::Rebooting);
        assert_eq!(
            channel.count_sent(AT_CARD_STATE) as u32,
            Budgets::default().card_ready_attempts
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_modem_fails_fast() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.script("*", "AT", "");

        let cancel = CancellationToken::new();
        let report = verifier(channel.clone()).verify("COM4", &cancel).await;

        assert_eq!(report.phase, ModemPhase::TimedOut);
        assert_eq!(report.reached, ModemPhase::Unverified);
        assert_eq!(channel.count_sent(AT_CARD_STATE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_card_poll() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.script("*", AT_CARD_STATE, "");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = verifier(channel.clone()).verify("COM4", &cancel).await;

        assert_eq!(report.phase, ModemPhase::TimedOut);
        assert_eq!(channel.count_sent(AT_CARD_STATE), 1);
    }
}
