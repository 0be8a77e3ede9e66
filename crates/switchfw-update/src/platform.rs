//! Collaborators the engine consumes from its host
//!
//! The engine never restarts the system, prints to a terminal or probes the
//! boot path itself; it calls out through these traits.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::FirmwareResult;

/// Line-oriented progress output to the requesting user
pub trait Feedback: Send + Sync {
    /// Emit one line
    fn line(&self, text: &str);
}

/// Feedback that collects lines in memory
#[derive(Debug, Default)]
pub struct LineBuffer {
    lines: Mutex<Vec<String>>,
}

impl LineBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines emitted so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl Feedback for LineBuffer {
    fn line(&self, text: &str) {
        self.lines.lock().push(text.to_string());
    }
}

/// Feedback routed to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFeedback;

impl Feedback for LogFeedback {
    fn line(&self, text: &str) {
        info!("{}", text);
    }
}

/// How the system should restart after an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartMode {
    /// Full power cycle
    #[default]
    Cold,
    /// Restart without resetting the switch core
    Cool,
    /// Software restart only
    Warm,
}

impl std::fmt::Display for RestartMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RestartMode::Cold => "cold",
            RestartMode::Cool => "cool",
            RestartMode::Warm => "warm",
        };
        write!(f, "{}", name)
    }
}

/// Restart primitive of the host
pub trait RestartRequester: Send + Sync {
    /// Ask the host to restart
    fn request_restart(&self, mode: RestartMode) -> FirmwareResult<()>;
}

/// Restart requester that only records requests
#[derive(Debug, Default)]
pub struct RestartLog {
    requests: Mutex<Vec<RestartMode>>,
}

impl RestartLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<RestartMode> {
        self.requests.lock().clone()
    }
}

impl RestartRequester for RestartLog {
    fn request_restart(&self, mode: RestartMode) -> FirmwareResult<()> {
        info!("Restart requested ({})", mode);
        self.requests.lock().push(mode);
        Ok(())
    }
}

/// Tells which image partition the system booted from
pub trait ActiveImage: Send + Sync {
    /// Name of the partition holding the running image, if known
    fn active_partition(&self) -> Option<String>;
}

/// Active image fixed at construction
#[derive(Debug, Clone, Default)]
pub struct FixedActiveImage {
    partition: Option<String>,
}

impl FixedActiveImage {
    /// Report `partition` as active
    pub fn new(partition: impl Into<String>) -> Self {
        Self {
            partition: Some(partition.into()),
        }
    }

    /// Report no active partition
    pub fn unknown() -> Self {
        Self::default()
    }
}

impl ActiveImage for FixedActiveImage {
    fn active_partition(&self) -> Option<String> {
        self.partition.clone()
    }
}
