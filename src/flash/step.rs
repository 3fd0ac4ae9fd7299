use std::fmt;

use log::warn;

use crate::error::{Error, ErrorKind};

/// Identifies a step of a workflow.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StepId {
    ReadFlash,
    Connect,
    Erase,
    Write,
    Verify,
    Fetch,
    Classify,
    Handshake,
    Transfer,
    Apply,
}

impl StepId {
    pub fn label(self) -> &'static str {
        match self {
            StepId::ReadFlash => "Read full flash",
            StepId::Connect => "Connect to device",
            StepId::Erase => "Erase flash",
            StepId::Write => "Write flash",
            StepId::Verify => "Verify flash",
            StepId::Fetch => "Download firmware",
            StepId::Classify => "Check firmware",
            StepId::Handshake => "Start OTA session",
            StepId::Transfer => "Transfer firmware",
            StepId::Apply => "Apply firmware",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Steps only move forward: pending steps start or get skipped, running steps end.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        match (self, next) {
            (StepStatus::Pending, StepStatus::Running) => true,
            (StepStatus::Pending, StepStatus::Skipped) => true,
            (StepStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Progress {
    Indeterminate,
    /// Completed fraction between 0.0 and 1.0
    Fraction(f32),
}

impl Progress {
    pub fn fraction(self) -> Option<f32> {
        match self {
            Progress::Indeterminate => None,
            Progress::Fraction(fraction) => Some(fraction),
        }
    }
}

/// The error a step failed with.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for StepError {
    fn from(err: &Error) -> StepError {
        StepError {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// One independently reported unit of a workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct FlashStep {
    pub id: StepId,
    pub label: &'static str,
    pub status: StepStatus,
    pub progress: Progress,
    pub error: Option<StepError>,
}

impl FlashStep {
    pub fn new(id: StepId) -> FlashStep {
        FlashStep {
            id,
            label: id.label(),
            status: StepStatus::Pending,
            progress: Progress::Indeterminate,
            error: None,
        }
    }

    /// Moves the step to `next`, refusing backward transitions.
    fn transition(&mut self, next: StepStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(
                "Ignoring transition of step {:?} from {:?} to {:?}",
                self.id, self.status, next
            );
            return false;
        }

        self.status = next;
        true
    }

    pub(crate) fn start(&mut self) {
        self.transition(StepStatus::Running);
    }

    /// Records progress. Only running steps advance, and never backwards.
    pub(crate) fn set_progress(&mut self, fraction: f32) {
        if self.status != StepStatus::Running {
            return;
        }

        let fraction = fraction.clamp(0.0, 1.0);

        match self.progress {
            Progress::Fraction(current) if current > fraction => {}
            _ => self.progress = Progress::Fraction(fraction),
        }
    }

    pub(crate) fn succeed(&mut self) {
        if self.transition(StepStatus::Succeeded) {
            self.progress = Progress::Fraction(1.0);
        }
    }

    pub(crate) fn fail(&mut self, error: StepError) {
        if self.transition(StepStatus::Failed) {
            self.error = Some(error);
        }
    }

    pub(crate) fn skip(&mut self) {
        self.transition(StepStatus::Skipped);
    }
}
