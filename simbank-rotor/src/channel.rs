//! Command channel: one-shot request/response over a serial endpoint.
//!
//! The SIM bank controllers and the modems behind them speak a line-oriented
//! command protocol with no event notification, so every exchange is
//! write-then-wait-then-read. Each call opens the transport, clears stale
//! bytes, writes the command with a CRLF terminator, sleeps the caller's
//! wait, drains whatever arrived and closes the transport again. There is no
//! connection pooling: the hardware tolerates a single open handle at a time
//! and sibling components (or the companion application) may need the same
//! endpoint moments later.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Grace period for draining a response once the wait has elapsed.
const READ_GRACE: Duration = Duration::from_millis(200);

/// Backoff unit for transport-level retries (linear: 1x, 2x, 3x ...).
const RETRY_BACKOFF: Duration = Duration::from_millis(1500);

/// Request/response transport to one serial endpoint.
///
/// Implementations must be safe to call concurrently for *different* ports;
/// callers serialize access to any single port themselves.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Send `command` to `port` and return the raw response text, trimmed.
    ///
    /// An empty string means the endpoint stayed silent, which some bank
    /// controllers do on success; distinguishing silence from failure is the
    /// caller's business.
    async fn send(&self, port: &str, command: &str, wait: Duration) -> Result<String>;
}

/// Production channel backed by `tokio-serial`.
pub struct SerialChannel {
    baud: u32,
}

impl SerialChannel {
    pub fn new(baud: u32) -> Self {
        Self { baud }
    }
}

#[async_trait]
impl CommandChannel for SerialChannel {
    async fn send(&self, port: &str, command: &str, wait: Duration) -> Result<String> {
        let mut stream = tokio_serial::new(port, self.baud)
            .timeout(Duration::from_secs(3))
            .open_native_async()
            .map_err(|e| Error::transport(port, e))?;

        // Discard anything a previous exchange left behind.
        if let Err(e) = stream.clear(ClearBuffer::All) {
            trace!(port, "could not clear buffers: {e}");
        }

        stream
            .write_all(command.as_bytes())
            .await
            .map_err(|e| Error::transport(port, e))?;
        stream
            .write_all(b"\r\n")
            .await
            .map_err(|e| Error::transport(port, e))?;
        stream.flush().await.map_err(|e| Error::transport(port, e))?;

        time::sleep(wait).await;

        let mut response = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match time::timeout(READ_GRACE, stream.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
                Ok(Err(e)) => return Err(Error::transport(port, e)),
                // Drained: nothing more arrived within the grace period.
                Err(_) => break,
            }
        }

        let text = String::from_utf8_lossy(&response).trim().to_string();
        if text.is_empty() {
            trace!(port, command, "no response");
        } else if is_error(&text) {
            debug!(port, command, response = %text, "error response");
        } else {
            trace!(port, command, response = %text, "response");
        }
        Ok(text)
    }
}

/// Channel for dry runs: never touches hardware, always answers `OK`.
pub struct DryRunChannel;

#[async_trait]
impl CommandChannel for DryRunChannel {
    async fn send(&self, port: &str, command: &str, _wait: Duration) -> Result<String> {
        debug!(port, command, "dry run");
        Ok("OK".to_string())
    }
}

/// Whether the response carries the hardware's success token.
pub fn is_ok(response: &str) -> bool {
    response.contains("OK")
}

/// Whether the response carries an explicit error token.
pub fn is_error(response: &str) -> bool {
    response.contains("ERROR")
}

/// Promote an explicit error token to a protocol error.
///
/// For commands whose rejection must fail the owning state machine instead
/// of being inspected as text.
pub fn ensure_ok(port: &str, response: String) -> Result<String> {
    if is_error(&response) {
        Err(Error::Protocol {
            port: port.to_string(),
            response,
        })
    } else {
        Ok(response)
    }
}

/// Send a command with bounded transport-level retries and linear back-off.
///
/// Only transport faults are retried; a protocol error token is a definitive
/// answer from the hardware and goes straight back to the caller.
pub async fn send_resilient(
    channel: &dyn CommandChannel,
    port: &str,
    command: &str,
    wait: Duration,
    attempts: u32,
) -> Result<String> {
    let mut last_err = None;
    for attempt in 1..=attempts.max(1) {
        match channel.send(port, command, wait).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let backoff = RETRY_BACKOFF * attempt;
                warn!(
                    port,
                    command,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "transport fault, retrying: {e}"
                );
                time::sleep(backoff).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::transport(port, "retries exhausted")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FlakyChannel, ScriptedChannel};

    #[tokio::test]
    async fn dry_run_always_answers_ok() {
        let channel = DryRunChannel;
        let response = channel
            .send("/dev/null", "AT", Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(response, "OK");
    }

    #[test]
    fn token_helpers_classify_responses() {
        assert!(is_ok("AT\r\nOK"));
        assert!(!is_ok(""));
        assert!(is_error("+CME ERROR: 14"));
        assert!(!is_error("OK"));
    }

    #[test]
    fn ensure_ok_promotes_error_tokens() {
        assert!(matches!(
            ensure_ok("p1", "ERROR".to_string()),
            Err(Error::Protocol { .. })
        ));
        assert_eq!(ensure_ok("p1", "OK".to_string()).unwrap(), "OK");
        // Silence is not an error token.
        assert_eq!(ensure_ok("p1", String::new()).unwrap(), "");
    }

    #[tokio::test(start_paused = true)]
    async fn resilient_send_retries_transport_faults() {
        let channel = FlakyChannel::failing_times(2);
        let response = send_resilient(&channel, "p1", "AT", Duration::ZERO, 3)
            .await
            .unwrap();
        assert_eq!(response, "OK");
        assert_eq!(channel.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn resilient_send_gives_up_after_budget() {
        let channel = FlakyChannel::failing_times(5);
        let err = send_resilient(&channel, "p1", "AT", Duration::ZERO, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert_eq!(channel.calls(), 3);
    }

    #[tokio::test]
    async fn resilient_send_does_not_retry_protocol_errors() {
        let channel = ScriptedChannel::new();
        channel.script("p1", "AT", "ERROR");
        let response = send_resilient(&channel, "p1", "AT", Duration::ZERO, 3)
            .await
            .unwrap();
        // The error token is an answer, not a fault: handed back unmodified.
        assert_eq!(response, "ERROR");
        assert_eq!(channel.sent().len(), 1);
    }
}
