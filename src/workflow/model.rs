//! Records produced and consumed by the discovery workflow.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Largest paper the analysis server accepts.
pub const MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

/// How a profile was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationMethod {
    Manual,
    Scholar,
}

impl std::fmt::Display for CreationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Scholar => write!(f, "scholar"),
        }
    }
}

/// Self-reported research experience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperienceLevel {
    Beginner,
    Intermediate,
    Advanced,
}

impl std::fmt::Display for ExperienceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Beginner => write!(f, "beginner"),
            Self::Intermediate => write!(f, "intermediate"),
            Self::Advanced => write!(f, "advanced"),
        }
    }
}

impl std::str::FromStr for ExperienceLevel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "beginner" => Ok(Self::Beginner),
            "intermediate" => Ok(Self::Intermediate),
            "advanced" => Ok(Self::Advanced),
            other => Err(ValidationError::InvalidValue {
                field: "experience_level".to_string(),
                reason: format!("unknown level {other:?}"),
            }),
        }
    }
}

/// Payload for creating a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileRequest {
    Manual {
        description: String,
        experience_level: ExperienceLevel,
    },
    Scholar {
        scholar_url: String,
    },
}

impl ProfileRequest {
    pub fn manual(description: impl Into<String>, experience_level: ExperienceLevel) -> Self {
        Self::Manual {
            description: description.into(),
            experience_level,
        }
    }

    pub fn scholar(scholar_url: impl Into<String>) -> Self {
        Self::Scholar {
            scholar_url: scholar_url.into(),
        }
    }

    pub fn method(&self) -> CreationMethod {
        match self {
            Self::Manual { .. } => CreationMethod::Manual,
            Self::Scholar { .. } => CreationMethod::Scholar,
        }
    }

    /// Reject payloads the server would refuse, without a round trip.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Manual { description, .. } => {
                if description.trim().is_empty() {
                    return Err(ValidationError::EmptyField {
                        field: "description".to_string(),
                    });
                }
            }
            Self::Scholar { scholar_url } => {
                let url = scholar_url.trim();
                if url.is_empty() {
                    return Err(ValidationError::EmptyField {
                        field: "scholar_url".to_string(),
                    });
                }
                if !scholar_url_pattern().is_match(url) {
                    return Err(ValidationError::InvalidValue {
                        field: "scholar_url".to_string(),
                        reason: "expected a Google Scholar profile URL".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn scholar_url_pattern() -> &'static regex::Regex {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"^https?://scholar\.google\.[a-z.]+/citations\?(?:.*&)?user=[\w-]+")
            .expect("scholar URL pattern is valid")
    })
}

/// Researcher profile returned by the server. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub method: CreationMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scholar_url: Option<String>,
    pub experience_level: ExperienceLevel,
    pub research_areas: BTreeSet<String>,
    pub research_style: String,
}

/// A paper file ready to upload.
#[derive(Clone, PartialEq, Eq)]
pub struct PaperUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for PaperUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperUpload")
            .field("file_name", &self.file_name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl PaperUpload {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
        }
    }

    /// Read a paper from disk.
    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("paper.pdf")
            .to_string();
        let bytes = tokio::fs::read(path).await?;
        Ok(Self { file_name, bytes })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.file_name.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "file_name".to_string(),
            });
        }
        let is_pdf = Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
        if !is_pdf {
            return Err(ValidationError::UnsupportedFileType {
                file_name: self.file_name.clone(),
            });
        }
        if self.bytes.is_empty() {
            return Err(ValidationError::EmptyFile);
        }
        let size = self.bytes.len() as u64;
        if size > MAX_UPLOAD_BYTES {
            return Err(ValidationError::FileTooLarge {
                size,
                max: MAX_UPLOAD_BYTES,
            });
        }
        Ok(())
    }
}

/// A paper accepted by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedPaper {
    /// Analysis job the server opened for this paper.
    pub job_id: String,
    pub user_id: String,
    pub file_name: String,
    pub detected_topics: Vec<String>,
    pub manual_topics: Vec<String>,
}

impl UploadedPaper {
    /// Detected topics first, then manual ones; duplicates and blanks removed.
    pub fn merged_topics(&self) -> Vec<String> {
        merge_topics(&self.detected_topics, &self.manual_topics)
    }

    /// Copy of this paper with `manual_topics` replaced.
    pub fn with_manual_topics(&self, topics: Vec<String>) -> Self {
        Self {
            manual_topics: topics
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            ..self.clone()
        }
    }
}

/// Order-preserving union. Topics compare case-insensitively after trimming;
/// the first spelling wins.
pub fn merge_topics(detected: &[String], manual: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    detected
        .iter()
        .chain(manual.iter())
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_lowercase()))
        .map(str::to_string)
        .collect()
}

/// Which analysis a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    QuickRead,
    DeepResearch,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QuickRead => write!(f, "quick_read"),
            Self::DeepResearch => write!(f, "deep_research"),
        }
    }
}

/// Remote job status. Never leaves a terminal value once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position in `queued → running → {completed | failed}`.
    pub fn order(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Parse the server's status string. `ideas_ready` is a paper whose
    /// quick read is done and whose deep research has not started yet.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" | "pending" | "uploaded" | "ideas_ready" => Some(Self::Queued),
            "running" | "parsing" | "reading" | "searching" => Some(Self::Running),
            "completed" | "complete" => Some(Self::Completed),
            "failed" | "error" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// What a job was asked to analyse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobInput {
    Topics(Vec<String>),
    Ideas(Vec<usize>),
}

/// One analysis job as the session last saw it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisJob {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub input: JobInput,
    /// Server-reported progress, 0-100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// Raw payload, present once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl AnalysisJob {
    pub fn submitted(id: impl Into<String>, kind: JobKind, input: JobInput) -> Self {
        Self {
            id: id.into(),
            kind,
            status: JobStatus::Queued,
            input,
            progress: None,
            result: None,
            error: None,
            submitted_at: Utc::now(),
        }
    }

    /// Copy with a newer status applied. Terminal jobs and status
    /// regressions are left as they are.
    pub fn observe(&self, update: &JobStatusUpdate) -> Self {
        if self.status.is_terminal() || update.status.order() < self.status.order() {
            return self.clone();
        }
        Self {
            status: update.status,
            progress: update.progress.or(self.progress),
            result: update.result.clone(),
            error: update.error.clone(),
            ..self.clone()
        }
    }
}

/// One `getJobStatus` response.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusUpdate {
    pub status: JobStatus,
    pub progress: Option<u8>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl JobStatusUpdate {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            progress: None,
            result: None,
            error: None,
        }
    }
}

/// A generated idea. `selected` is only ever set on copies handed out by a
/// session snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Idea {
    pub index: usize,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub selected: bool,
}

/// Outcome of the quick read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickReadResult {
    pub job_id: String,
    pub topics: Vec<String>,
    pub summary: String,
    pub concepts: Vec<String>,
    pub ideas: Vec<Idea>,
}

impl QuickReadResult {
    pub fn indices(&self) -> BTreeSet<usize> {
        self.ideas.iter().map(|i| i.index).collect()
    }
}

/// Scores copied verbatim from the deep research payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scores {
    pub novelty: Decimal,
    pub doability: Decimal,
    pub composite: Decimal,
}

/// Supporting literature for a ranked idea.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_count: Option<u64>,
}

/// One of the three finalists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalRanking {
    /// 1 is best.
    pub rank: u8,
    pub title: String,
    pub description: String,
    /// Quick-read index of the idea this ranking refers to, when it could be
    /// matched by title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idea_index: Option<usize>,
    pub scores: Scores,
    pub rationale: String,
    pub references: Vec<Reference>,
}

/// Ranked deep research result, ordered by rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalResult {
    pub job_id: String,
    pub rankings: Vec<FinalRanking>,
}

impl FinalResult {
    pub fn best(&self) -> Option<&FinalRanking> {
        self.rankings.first()
    }

    /// Render the ranking as markdown for display.
    pub fn to_markdown(&self) -> String {
        let mut parts = vec!["# Research Directions".to_string()];

        for ranking in &self.rankings {
            parts.push(String::new());
            parts.push(format!("## {}. {}", ranking.rank, ranking.title));
            if !ranking.description.is_empty() {
                parts.push(ranking.description.clone());
            }
            parts.push(format!(
                "- **Scores:** novelty {}, doability {}, composite {}",
                ranking.scores.novelty, ranking.scores.doability, ranking.scores.composite
            ));
            if !ranking.rationale.is_empty() {
                parts.push(format!("- **Why:** {}", ranking.rationale));
            }
            if !ranking.references.is_empty() {
                parts.push("- **References:**".to_string());
                for reference in &ranking.references {
                    let year = reference
                        .year
                        .map(|y| format!(" ({y})"))
                        .unwrap_or_default();
                    let cites = reference
                        .citation_count
                        .map(|c| format!(", {c} citations"))
                        .unwrap_or_default();
                    parts.push(format!("  - {}{year}{cites}", reference.title));
                }
            }
        }

        parts.join("\n")
    }
}
