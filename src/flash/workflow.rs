use std::fmt;

use super::step::{FlashStep, StepError, StepId, StepStatus};
use crate::error::Error;

/// The workflows the orchestrator can run.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum WorkflowKind {
    SaveFullFlash,
    WriteFullFlash,
    OtaFlash,
}

impl WorkflowKind {
    /// The fixed step sequence of the workflow.
    pub fn plan(self) -> &'static [StepId] {
        match self {
            WorkflowKind::SaveFullFlash => &[StepId::ReadFlash],
            WorkflowKind::WriteFullFlash => {
                &[StepId::Connect, StepId::Erase, StepId::Write, StepId::Verify]
            }
            WorkflowKind::OtaFlash => &[
                StepId::Fetch,
                StepId::Classify,
                StepId::Handshake,
                StepId::Transfer,
                StepId::Apply,
            ],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            WorkflowKind::SaveFullFlash => "Save full flash",
            WorkflowKind::WriteFullFlash => "Write full flash",
            WorkflowKind::OtaFlash => "OTA fast flash",
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }
}

/// A single execution of a workflow: its ordered steps and overall state.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRun {
    /// `None` until the first workflow starts
    pub kind: Option<WorkflowKind>,
    pub state: RunState,
    pub steps: Vec<FlashStep>,
    /// The error that ended the run, if any
    pub error: Option<StepError>,
}

impl Default for WorkflowRun {
    fn default() -> Self {
        Self {
            kind: None,
            state: RunState::Idle,
            steps: Vec::new(),
            error: None,
        }
    }
}

impl WorkflowRun {
    /// Creates a running workflow with all of its steps pending.
    pub fn new(kind: WorkflowKind) -> WorkflowRun {
        WorkflowRun {
            kind: Some(kind),
            state: RunState::Running,
            steps: kind.plan().iter().copied().map(FlashStep::new).collect(),
            error: None,
        }
    }

    pub fn step(&self, id: StepId) -> Option<&FlashStep> {
        self.steps.iter().find(|step| step.id == id)
    }

    /// The step currently in progress.
    pub fn running_step(&self) -> Option<&FlashStep> {
        self.steps
            .iter()
            .find(|step| step.status == StepStatus::Running)
    }

    fn step_mut(&mut self, id: StepId) -> Option<&mut FlashStep> {
        self.steps.iter_mut().find(|step| step.id == id)
    }

    pub(crate) fn start_step(&mut self, id: StepId) {
        if let Some(step) = self.step_mut(id) {
            step.start();
        }
    }

    pub(crate) fn set_progress(&mut self, id: StepId, fraction: f32) {
        if let Some(step) = self.step_mut(id) {
            step.set_progress(fraction);
        }
    }

    pub(crate) fn succeed_step(&mut self, id: StepId) {
        if let Some(step) = self.step_mut(id) {
            step.succeed();
        }
    }

    pub(crate) fn fail_step(&mut self, id: StepId, err: &Error) {
        if let Some(step) = self.step_mut(id) {
            step.fail(StepError::from(err));
        }
    }

    pub(crate) fn skip_step(&mut self, id: StepId) {
        if let Some(step) = self.step_mut(id) {
            step.skip();
        }
    }

    pub(crate) fn complete(&mut self) {
        self.state = RunState::Completed;
    }

    /// Ends the run with `err`. Steps that never started stay pending.
    pub(crate) fn fail(&mut self, err: &Error) {
        self.state = RunState::Failed;
        self.error = Some(StepError::from(err));
    }

    /// Ends the run on user request.
    ///
    /// The step in progress is skipped if the device confirmed a clean abort and fails otherwise;
    /// steps that never started are skipped.
    pub(crate) fn cancel(&mut self, clean_abort: bool) {
        let cancelled = StepError::from(&Error::CancelledByUser);

        for step in self.steps.iter_mut() {
            match step.status {
                StepStatus::Running if clean_abort => step.skip(),
                StepStatus::Running => step.fail(cancelled.clone()),
                StepStatus::Pending => step.skip(),
                _ => {}
            }
        }

        self.state = RunState::Cancelled;
        self.error = Some(cancelled);
    }
}
