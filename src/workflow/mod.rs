//! The discovery workflow: records, the step machine and its controller.

pub mod controller;
pub mod model;
pub mod state;

pub use controller::{Transition, WorkflowController};
pub use state::{SessionStatus, Stage, StepFailure, WorkflowSession, WorkflowStep};
