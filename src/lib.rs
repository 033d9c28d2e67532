//! Research Discovery: client for a paper-driven research idea pipeline.
//!
//! A session walks a fixed sequence: build a researcher profile, upload a
//! paper, run a quick read that proposes ideas, pick three, then run a deep
//! research job that returns a ranked shortlist.

pub mod aggregator;
pub mod api;
pub mod config;
pub mod error;
pub mod poller;
pub mod selection;
pub mod workflow;

pub use aggregator::ResultAggregator;
pub use api::{HttpResearchApi, ResearchApi};
pub use config::{DiscoveryConfig, PollConfig};
pub use error::{Error, Result};
pub use poller::{JobPoller, PollEvent};
pub use selection::{REQUIRED_SELECTION, Selection, SelectionGuard};
pub use workflow::{Transition, WorkflowController, WorkflowSession, WorkflowStep};
