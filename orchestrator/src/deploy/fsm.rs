//! Finite state machine for the deployment pipeline

use conveyor_models::TaskStatus;

use crate::errors::ConveyorError;

/// Pipeline event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// A run claimed the task
    Start,

    /// Build finished with result SUCCESS
    BuildSucceeded,

    /// Registry lists the task's image tag
    ImageVerified,

    /// Every manifest was dispatched
    Deployed,

    /// Any stage failure
    Fail(String),
}

/// Task pipeline FSM
///
/// Transitions only ever move forward through
/// PENDING, BUILDING, PUSHING, DEPLOYING and end in SUCCESS or FAILED.
#[derive(Debug, Clone)]
pub struct TaskFsm {
    state: TaskStatus,
    error: Option<String>,
}

impl TaskFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self::from_status(TaskStatus::Pending)
    }

    /// Resume from a persisted status
    pub fn from_status(state: TaskStatus) -> Self {
        Self { state, error: None }
    }

    /// Get current state
    pub fn state(&self) -> TaskStatus {
        self.state
    }

    /// Failure message if the run failed
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: TaskEvent) -> Result<TaskStatus, ConveyorError> {
        let new_state = match (self.state, &event) {
            (TaskStatus::Pending, TaskEvent::Start) => TaskStatus::Building,
            (TaskStatus::Building, TaskEvent::BuildSucceeded) => TaskStatus::Pushing,
            (TaskStatus::Pushing, TaskEvent::ImageVerified) => TaskStatus::Deploying,
            (TaskStatus::Deploying, TaskEvent::Deployed) => TaskStatus::Success,

            // A task that never started cannot fail a stage
            (
                TaskStatus::Building | TaskStatus::Pushing | TaskStatus::Deploying,
                TaskEvent::Fail(err),
            ) => {
                self.error = Some(err.clone());
                TaskStatus::Failed
            }

            (state, event) => {
                return Err(ConveyorError::InvalidTransition(format!(
                    "{} -> {:?}",
                    state, event
                )));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for TaskFsm {
    fn default() -> Self {
        Self::new()
    }
}
