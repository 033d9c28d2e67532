//! Workflow state machine and session snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::selection::Selection;

use super::model::{AnalysisJob, FinalResult, Idea, QuickReadResult, UploadedPaper, UserProfile};

/// The steps of a discovery session.
///
/// Progresses linearly: Idle → ProfileReady → PaperUploaded →
/// QuickReadReady → IdeasSelected → DeepResearchRunning → FinalReady.
/// The only backward edges are revising a confirmed selection and
/// abandoning a running deep research.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Idle,
    ProfileReady,
    PaperUploaded,
    QuickReadReady,
    IdeasSelected,
    DeepResearchRunning,
    FinalReady,
}

impl WorkflowStep {
    /// Check if a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: WorkflowStep) -> bool {
        use WorkflowStep::*;
        matches!(
            (self, target),
            (Idle, ProfileReady)
                | (ProfileReady, PaperUploaded)
                | (PaperUploaded, QuickReadReady)
                | (QuickReadReady, IdeasSelected)
                | (IdeasSelected, DeepResearchRunning)
                | (DeepResearchRunning, FinalReady)
                | (IdeasSelected, QuickReadReady)
                | (DeepResearchRunning, IdeasSelected)
        )
    }

    /// Whether the workflow is done.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::FinalReady)
    }

    /// Get the next step in the linear progression, if any.
    pub fn next(&self) -> Option<WorkflowStep> {
        use WorkflowStep::*;
        match self {
            Idle => Some(ProfileReady),
            ProfileReady => Some(PaperUploaded),
            PaperUploaded => Some(QuickReadReady),
            QuickReadReady => Some(IdeasSelected),
            IdeasSelected => Some(DeepResearchRunning),
            DeepResearchRunning => Some(FinalReady),
            FinalReady => None,
        }
    }
}

impl Default for WorkflowStep {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::ProfileReady => "profile_ready",
            Self::PaperUploaded => "paper_uploaded",
            Self::QuickReadReady => "quick_read_ready",
            Self::IdeasSelected => "ideas_selected",
            Self::DeepResearchRunning => "deep_research_running",
            Self::FinalReady => "final_ready",
        };
        write!(f, "{s}")
    }
}

/// A unit of user-visible work. Failures are attributed to a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Profile,
    Upload,
    QuickRead,
    DeepResearch,
}

impl Stage {
    /// Step a session must be in to run this stage.
    pub fn prerequisite(&self) -> WorkflowStep {
        match self {
            Self::Profile => WorkflowStep::Idle,
            Self::Upload => WorkflowStep::ProfileReady,
            Self::QuickRead => WorkflowStep::PaperUploaded,
            Self::DeepResearch => WorkflowStep::IdeasSelected,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Profile => "profile",
            Self::Upload => "upload",
            Self::QuickRead => "quick_read",
            Self::DeepResearch => "deep_research",
        };
        write!(f, "{s}")
    }
}

/// Why the last attempt at a stage failed.
#[derive(Debug, Clone, Serialize)]
pub struct StepFailure {
    pub stage: Stage,
    pub message: String,
    #[serde(skip)]
    pub error: Error,
    pub at: DateTime<Utc>,
}

impl StepFailure {
    pub fn new(stage: Stage, error: Error) -> Self {
        Self {
            stage,
            message: error.to_string(),
            error,
            at: Utc::now(),
        }
    }
}

/// What a presentation layer should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active(WorkflowStep),
    /// The last attempt at `stage` failed; the session is still at
    /// `last_good` and the stage can be retried.
    Failed { stage: Stage, last_good: WorkflowStep },
}

/// Immutable view of one session's progress.
///
/// The controller never edits a published snapshot; each change produces
/// a new one with `revision` bumped.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSession {
    pub session_id: Uuid,
    pub revision: u64,
    pub step: WorkflowStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<UserProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paper: Option<UploadedPaper>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quick_read: Option<QuickReadResult>,
    pub selection: Selection,
    /// The job owned by the current step, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<AnalysisJob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_result: Option<FinalResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StepFailure>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSession {
    /// A fresh session at `Idle`.
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            revision: 0,
            step: WorkflowStep::Idle,
            profile: None,
            paper: None,
            quick_read: None,
            selection: Selection::new(),
            job: None,
            final_result: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        match &self.last_error {
            Some(failure) => SessionStatus::Failed {
                stage: failure.stage,
                last_good: self.step,
            },
            None => SessionStatus::Active(self.step),
        }
    }

    /// Quick-read ideas with selection flags filled in from this snapshot.
    pub fn ideas(&self) -> Vec<Idea> {
        self.quick_read
            .as_ref()
            .map(|qr| {
                qr.ideas
                    .iter()
                    .map(|idea| Idea {
                        selected: self.selection.contains(&idea.index),
                        ..idea.clone()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The selected ideas, in index order.
    pub fn selected_ideas(&self) -> Vec<Idea> {
        self.ideas().into_iter().filter(|i| i.selected).collect()
    }

    /// Derive the successor snapshot. Clears `last_error`.
    pub(crate) fn succeed(&self, f: impl FnOnce(&mut WorkflowSession)) -> Self {
        let mut next = self.clone();
        next.last_error = None;
        f(&mut next);
        next.revision = self.revision + 1;
        next.updated_at = Utc::now();
        next
    }

    /// Derive a snapshot recording a failed stage, otherwise unchanged.
    pub(crate) fn fail(&self, failure: StepFailure) -> Self {
        let mut next = self.clone();
        next.last_error = Some(failure);
        next.revision = self.revision + 1;
        next.updated_at = Utc::now();
        next
    }
}

impl Default for WorkflowSession {
    fn default() -> Self {
        Self::new()
    }
}
