//! Shared test doubles.
//!
//! The engine talks to hardware exclusively through the [`CommandChannel`]
//! trait, so protocol-level behavior is tested against scripted in-memory
//! channels instead of serial ports.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::channel::CommandChannel;
use crate::error::{Error, Result};
use crate::modem::CardIdentity;
use crate::store::NumberStore;

struct Script {
    port: String,
    prefix: String,
    responses: VecDeque<String>,
}

/// A channel that answers from scripted (port, command-prefix) rules and
/// records every command it was asked to send.
///
/// The last response of a sequence is sticky: once a rule is down to one
/// response it keeps answering with it. Unscripted commands answer `OK`.
/// A port of `"*"` matches any port.
#[derive(Default)]
pub struct ScriptedChannel {
    scripts: Mutex<Vec<Script>>,
    sent: Mutex<Vec<(String, String)>>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a single (sticky) response for commands starting with `prefix`.
    pub fn script(&self, port: &str, prefix: &str, response: &str) {
        self.script_seq(port, prefix, &[response]);
    }

    /// Script a sequence of responses; the final one is sticky.
    pub fn script_seq(&self, port: &str, prefix: &str, responses: &[&str]) {
        self.scripts.lock().push(Script {
            port: port.to_string(),
            prefix: prefix.to_string(),
            responses: responses.iter().map(|r| r.to_string()).collect(),
        });
    }

    /// Every (port, command) pair sent through the channel, in order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    /// How many sent commands start with `prefix`.
    pub fn count_sent(&self, prefix: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|(_, cmd)| cmd.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl CommandChannel for ScriptedChannel {
    async fn send(&self, port: &str, command: &str, _wait: Duration) -> Result<String> {
        self.sent
            .lock()
            .push((port.to_string(), command.to_string()));

        let mut scripts = self.scripts.lock();
        for script in scripts.iter_mut() {
            if (script.port == "*" || script.port == port) && command.starts_with(&script.prefix) {
                let response = if script.responses.len() > 1 {
                    script.responses.pop_front().unwrap()
                } else {
                    script.responses.front().cloned().unwrap_or_default()
                };
                return Ok(response);
            }
        }
        Ok("OK".to_string())
    }
}

/// A channel that fails with a transport error a fixed number of times, then
/// answers `OK`. Counts every call.
pub struct FlakyChannel {
    fail_first: u32,
    calls: AtomicU32,
}

impl FlakyChannel {
    pub fn failing_times(fail_first: u32) -> Self {
        Self {
            fail_first,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandChannel for FlakyChannel {
    async fn send(&self, port: &str, _command: &str, _wait: Duration) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            Err(Error::transport(port, "simulated open failure"))
        } else {
            Ok("OK".to_string())
        }
    }
}

/// In-memory number store for activation tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<(String, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(String, String)> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl NumberStore for MemoryStore {
    async fn save(&self, identity: &CardIdentity, number: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|(id, _)| id == identity.as_str()) {
            entry.1 = number.to_string();
        } else {
            entries.push((identity.as_str().to_string(), number.to_string()));
        }
        Ok(())
    }

    async fn lookup(&self, identity: &CardIdentity) -> Result<Option<String>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .find(|(id, _)| id == identity.as_str())
            .map(|(_, n)| n.clone()))
    }
}
