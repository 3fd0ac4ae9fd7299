//! Flashing workflows

mod link;
pub mod orchestrator;
pub mod step;
pub mod workflow;

use std::time::Duration;

pub use orchestrator::Orchestrator;
pub use step::{FlashStep, Progress, StepError, StepId, StepStatus};
pub use workflow::{RunState, WorkflowKind, WorkflowRun};

/// Whether a full flash write erases the target region first.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErasePolicy {
    EraseBeforeWrite,
    /// Leave the erase step skipped, for devices whose link erases implicitly
    Skip,
}

/// Tunables of the orchestrator.
#[derive(Debug, Clone)]
pub struct FlashConfig {
    /// Upper bound for every single transport call
    pub io_timeout: Duration,
    /// Upper bound for a firmware download
    pub fetch_timeout: Duration,
    /// Bytes per transfer and verification chunk
    pub chunk_size: usize,
    pub erase_policy: ErasePolicy,
    /// Read the written image back and compare it after a full flash write
    pub verify_after_write: bool,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(60),
            chunk_size: 16 * 1024,
            erase_policy: ErasePolicy::EraseBeforeWrite,
            verify_after_write: true,
        }
    }
}

impl FlashConfig {
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_erase_policy(mut self, erase_policy: ErasePolicy) -> Self {
        self.erase_policy = erase_policy;
        self
    }

    pub fn with_verify_after_write(mut self, verify_after_write: bool) -> Self {
        self.verify_after_write = verify_after_write;
        self
    }
}
