//! Error taxonomy for the rotation engine.
//!
//! Four failure classes flow through the engine: transport faults (the serial
//! endpoint could not be opened, written or read), protocol faults (the
//! hardware answered with an explicit error token), verification failures
//! (an expected state change never happened within its attempt budget) and
//! persistence faults (a durable write failed). None of them is allowed to
//! abort a rotation cycle; callers degrade the step's success ratio instead.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The serial endpoint could not be opened, written or read.
    #[error("transport failure on {port}: {reason}")]
    Transport { port: String, reason: String },

    /// The hardware answered with an explicit error token.
    #[error("{port} answered with an error: {response}")]
    Protocol { port: String, response: String },

    /// An expected state change did not occur within the attempt budget.
    #[error("verification failed: {0}")]
    Verification(String),

    /// A durable write failed. Logged by callers, never fatal.
    #[error("persistence failed for {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Another engine instance holds the advisory lock.
    #[error("another rotor instance is already running (lock file {0})")]
    AlreadyRunning(PathBuf),
}

impl Error {
    pub fn transport(port: impl Into<String>, reason: impl ToString) -> Self {
        Error::Transport {
            port: port.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same operation can plausibly help.
    ///
    /// Transport faults are transient (flaky USB hubs, a sibling process that
    /// held the handle a moment too long); protocol errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }
}
