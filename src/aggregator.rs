//! ResultAggregator: turns raw API payloads into typed workflow records.
//!
//! Parsing fails closed: a missing or unusable required field yields
//! `MalformedResponse` naming the stage and field, never a partially filled
//! record. Keys are accepted in the contract's camelCase and in the
//! server's snake_case spelling.

use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;

use crate::error::MalformedResponse;
use crate::selection::REQUIRED_SELECTION;
use crate::workflow::model::{
    ExperienceLevel, FinalRanking, FinalResult, Idea, JobStatus, JobStatusUpdate, PaperUpload,
    ProfileRequest, QuickReadResult, Reference, Scores, UploadedPaper, UserProfile,
};
use crate::workflow::state::Stage;

/// Score bounds accepted from the server.
const SCORE_MIN: Decimal = Decimal::ZERO;
const SCORE_MAX: Decimal = Decimal::ONE_HUNDRED;

/// Allowed number of references per ranked idea.
const MIN_REFERENCES: usize = 3;
pub(crate) const MAX_REFERENCES: usize = 5;

type Parsed<T> = Result<T, MalformedResponse>;

/// Find the first present, non-null key.
fn lookup<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .find(|v| !v.is_null())
}

fn required_str(stage: Stage, value: &Value, keys: &[&str]) -> Parsed<String> {
    lookup(value, keys)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| MalformedResponse::new(stage, keys[0]))
}

fn text_or_empty(stage: Stage, value: &Value, keys: &[&str]) -> Parsed<String> {
    match lookup(value, keys) {
        None => Ok(String::new()),
        Some(v) => v
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| MalformedResponse::new(stage, keys[0])),
    }
}

fn string_list(stage: Stage, value: &Value, keys: &[&str]) -> Parsed<Vec<String>> {
    string_items(stage, lookup(value, keys), keys[0])
}

/// Trimmed, non-blank strings of a JSON array.
fn string_items(stage: Stage, items: Option<&Value>, field: &str) -> Parsed<Vec<String>> {
    let items = items
        .and_then(|v| v.as_array())
        .ok_or_else(|| MalformedResponse::new(stage, field))?;
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_str()
                .map(|s| s.trim().to_string())
                .ok_or_else(|| MalformedResponse::new(stage, format!("{field}[{i}]")))
        })
        .filter(|r| r.as_ref().map_or(true, |s| !s.is_empty()))
        .collect()
}

fn decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

/// Shapes API payloads for the workflow controller.
pub struct ResultAggregator;

impl ResultAggregator {
    /// Parse a `createProfile` response.
    ///
    /// The experience level falls back to the one submitted with a manual
    /// request when the server does not echo a recognised value.
    pub fn profile(request: &ProfileRequest, payload: &Value) -> Parsed<UserProfile> {
        let stage = Stage::Profile;
        let user_id = required_str(stage, payload, &["userId", "user_id"])?;

        // Derived fields may sit at the top level or inside a `profile` object.
        let nested = payload.get("profile").filter(|p| p.is_object());
        let derived = |keys: &[&str]| {
            lookup(payload, keys).or_else(|| nested.and_then(|p| lookup(p, keys)))
        };

        let echoed_level = derived(&["experienceLevel", "experience_level"])
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<ExperienceLevel>().ok());
        let experience_level = match (echoed_level, request) {
            (Some(level), _) => level,
            (None, ProfileRequest::Manual { experience_level, .. }) => *experience_level,
            (None, ProfileRequest::Scholar { .. }) => {
                return Err(MalformedResponse::new(stage, "experienceLevel"));
            }
        };

        let research_areas: BTreeSet<String> = string_items(
            stage,
            derived(&["researchAreas", "research_areas"]),
            "researchAreas",
        )?
        .into_iter()
        .collect();

        let research_style = derived(&["researchStyle", "research_style"])
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| MalformedResponse::new(stage, "researchStyle"))?;

        let (description, scholar_url) = match request {
            ProfileRequest::Manual { description, .. } => (Some(description.trim().to_string()), None),
            ProfileRequest::Scholar { scholar_url } => (None, Some(scholar_url.trim().to_string())),
        };

        Ok(UserProfile {
            user_id,
            method: request.method(),
            description,
            scholar_url,
            experience_level,
            research_areas,
            research_style,
        })
    }

    /// Parse an `uploadPaper` response.
    pub fn upload(upload: &PaperUpload, user_id: &str, payload: &Value) -> Parsed<UploadedPaper> {
        let stage = Stage::Upload;
        let job_id = required_str(stage, payload, &["jobId", "job_id"])?;
        let detected_topics = string_list(stage, payload, &["detectedTopics", "detected_topics"])?;
        Ok(UploadedPaper {
            job_id,
            user_id: user_id.to_string(),
            file_name: upload.file_name.clone(),
            detected_topics,
            manual_topics: Vec::new(),
        })
    }

    /// Parse a `submitQuickRead` response. Idea index is array position.
    pub fn quick_read(job_id: &str, topics: &[String], payload: &Value) -> Parsed<QuickReadResult> {
        let stage = Stage::QuickRead;
        let summary = text_or_empty(stage, payload, &["summary"])?;
        let concepts = match lookup(payload, &["concepts"]) {
            None => Vec::new(),
            Some(_) => string_list(stage, payload, &["concepts"])?,
        };

        let raw_ideas = lookup(payload, &["ideas"])
            .and_then(|v| v.as_array())
            .ok_or_else(|| MalformedResponse::new(stage, "ideas"))?;
        if raw_ideas.len() < REQUIRED_SELECTION {
            return Err(MalformedResponse::new(stage, "ideas"));
        }

        let ideas = raw_ideas
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                let field = |name: &str| format!("ideas[{index}].{name}");
                let title = required_str(stage, raw, &["title"])
                    .map_err(|_| MalformedResponse::new(stage, field("title")))?;
                let description = text_or_empty(stage, raw, &["description"])
                    .map_err(|_| MalformedResponse::new(stage, field("description")))?;
                Ok(Idea {
                    index,
                    title,
                    description,
                    selected: false,
                })
            })
            .collect::<Parsed<Vec<_>>>()?;

        Ok(QuickReadResult {
            job_id: job_id.to_string(),
            topics: topics.to_vec(),
            summary,
            concepts,
            ideas,
        })
    }

    /// Parse a `submitDeepResearch` response into the new job's id.
    pub fn deep_research_job(payload: &Value) -> Parsed<String> {
        if let Some(id) = payload.as_str().map(str::trim).filter(|s| !s.is_empty()) {
            return Ok(id.to_string());
        }
        required_str(Stage::DeepResearch, payload, &["jobId", "job_id"])
    }

    /// Parse a `getJobStatus` response. `result` is kept only for
    /// completed jobs.
    pub fn job_status(stage: Stage, payload: &Value) -> Parsed<JobStatusUpdate> {
        let status = lookup(payload, &["status"])
            .and_then(|v| v.as_str())
            .and_then(JobStatus::parse)
            .ok_or_else(|| MalformedResponse::new(stage, "status"))?;

        let progress = lookup(payload, &["progress"])
            .and_then(|v| v.as_f64())
            .map(|p| p.clamp(0.0, 100.0).round() as u8);
        let error = lookup(payload, &["error", "error_message"])
            .and_then(|v| v.as_str())
            .map(String::from);
        let result = match status {
            JobStatus::Completed => lookup(payload, &["result"]).cloned(),
            _ => None,
        };

        Ok(JobStatusUpdate {
            status,
            progress,
            result,
            error,
        })
    }

    /// Parse the completed deep research payload into exactly three
    /// rankings ordered by rank. `selected` resolves each ranking back to a
    /// quick-read idea by title.
    pub fn final_result(job_id: &str, payload: &Value, selected: &[Idea]) -> Parsed<FinalResult> {
        let stage = Stage::DeepResearch;
        let raw = lookup(payload, &["topIdeas", "top_ideas"])
            .and_then(|v| v.as_array())
            .ok_or_else(|| MalformedResponse::new(stage, "topIdeas"))?;
        if raw.len() != REQUIRED_SELECTION {
            return Err(MalformedResponse::new(stage, "topIdeas"));
        }

        let mut rankings = raw
            .iter()
            .enumerate()
            .map(|(i, entry)| Self::ranking(i, entry, selected))
            .collect::<Parsed<Vec<_>>>()?;

        let ranks: HashSet<u8> = rankings.iter().map(|r| r.rank).collect();
        let expected: HashSet<u8> = (1..=REQUIRED_SELECTION as u8).collect();
        if ranks != expected {
            return Err(MalformedResponse::new(stage, "topIdeas[].rank"));
        }
        rankings.sort_by_key(|r| r.rank);

        Ok(FinalResult {
            job_id: job_id.to_string(),
            rankings,
        })
    }

    fn ranking(i: usize, entry: &Value, selected: &[Idea]) -> Parsed<FinalRanking> {
        let stage = Stage::DeepResearch;
        let field = |name: &str| MalformedResponse::new(stage, format!("topIdeas[{i}].{name}"));

        let rank = lookup(entry, &["rank"])
            .and_then(|v| v.as_u64())
            .filter(|r| (1..=REQUIRED_SELECTION as u64).contains(r))
            .ok_or_else(|| field("rank"))? as u8;

        // Some servers nest the idea text under `idea`.
        let idea = entry.get("idea").filter(|v| v.is_object()).unwrap_or(entry);
        let title = required_str(stage, idea, &["title"]).map_err(|_| field("title"))?;
        let description = text_or_empty(stage, idea, &["description"]).map_err(|_| field("description"))?;
        let rationale = text_or_empty(stage, entry, &["rationale"])
            .or_else(|_| text_or_empty(stage, idea, &["rationale"]))
            .map_err(|_| field("rationale"))?;

        let scores_obj = entry.get("scores").filter(|v| v.is_object());
        let score = |name: &str, keys: &[&str]| -> Parsed<Decimal> {
            let flat = format!("{name}_score");
            let camel = format!("{name}Score");
            scores_obj
                .and_then(|s| lookup(s, keys))
                .or_else(|| lookup(entry, &[flat.as_str(), camel.as_str()]))
                .and_then(decimal)
                .filter(|d| *d >= SCORE_MIN && *d <= SCORE_MAX)
                .ok_or_else(|| field(&format!("scores.{name}")))
        };
        let scores = Scores {
            novelty: score("novelty", &["novelty"])?,
            doability: score("doability", &["doability"])?,
            composite: score("composite", &["composite"])?,
        };

        let raw_refs = lookup(entry, &["references", "papers"])
            .and_then(|v| v.as_array())
            .ok_or_else(|| field("references"))?;
        if !(MIN_REFERENCES..=MAX_REFERENCES).contains(&raw_refs.len()) {
            return Err(field("references"));
        }
        let references = raw_refs
            .iter()
            .enumerate()
            .map(|(j, r)| {
                let title = required_str(stage, r, &["title"])
                    .map_err(|_| field(&format!("references[{j}].title")))?;
                let year = lookup(r, &["year"])
                    .and_then(|v| v.as_i64())
                    .and_then(|y| i32::try_from(y).ok());
                let citation_count = lookup(r, &["citationCount", "citation_count", "citations"])
                    .and_then(|v| v.as_u64());
                Ok(Reference {
                    title,
                    year,
                    citation_count,
                })
            })
            .collect::<Parsed<Vec<_>>>()?;

        let idea_index = selected
            .iter()
            .find(|idea| idea.title.trim().eq_ignore_ascii_case(&title))
            .map(|idea| idea.index);

        Ok(FinalRanking {
            rank,
            title,
            description,
            idea_index,
            scores,
            rationale,
            references,
        })
    }
}
