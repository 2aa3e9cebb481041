//! Maps raw GitHub webhook payloads onto a single [`EventSummary`] shape.
//!
//! Payloads are handled as untyped [`serde_json::Value`] trees rather than
//! typed structs: GitHub sends many optional or partial shapes and a missing
//! field must never reject the whole delivery. Lookups go through [`lookup`],
//! which reads missing keys as absent and reports a present intermediate that
//! is not an object (`null` included) as an [`ExtractError`].

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

const BRANCH_PREFIX: &str = "refs/heads/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    Merge,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::PullRequest => "pull_request",
            Self::Merge => "merge",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "push" => Some(Self::Push),
            "pull_request" => Some(Self::PullRequest),
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }
}

/// The projection of an event that the read API exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSummary {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub author: Option<String>,
    pub from_branch: Option<String>,
    pub to_branch: String,
    pub timestamp: Option<String>,
}

/// A recognized event together with the payload it was extracted from.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub summary: EventSummary,
    pub raw: Value,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("payload root is not an object")]
    RootNotObject,
    #[error("expected an object at `{0}`")]
    NotAnObject(String),
}

/// Walks `path` through nested objects.
///
/// Returns `Ok(None)` when any key along the way is missing, or when the leaf
/// itself is `null`.
pub fn lookup<'a>(
    root: &'a Map<String, Value>,
    path: &[&str],
) -> Result<Option<&'a Value>, ExtractError> {
    let Some((leaf, parents)) = path.split_last() else {
        return Ok(None);
    };

    let mut node = root;
    for (depth, key) in parents.iter().enumerate() {
        match node.get(*key) {
            None => return Ok(None),
            Some(Value::Object(map)) => node = map,
            Some(_) => return Err(ExtractError::NotAnObject(path[..=depth].join("."))),
        }
    }

    Ok(node.get(*leaf).filter(|value| !value.is_null()))
}

fn string_at(root: &Map<String, Value>, path: &[&str]) -> Result<Option<String>, ExtractError> {
    Ok(lookup(root, path)?
        .and_then(Value::as_str)
        .map(str::to_owned))
}

/// Push events always record, so a malformed sub-tree only nulls its field.
fn lenient_string_at(root: &Map<String, Value>, path: &[&str]) -> Option<String> {
    string_at(root, path).unwrap_or_else(|err| {
        debug!("push field {} degraded to null: {err}", path.join("."));
        None
    })
}

enum Outcome {
    Record(EventSummary),
    Filtered(String),
    Unrecognized,
}

fn extract(event_type: &str, payload: &Value) -> Result<Outcome, ExtractError> {
    let root = || payload.as_object().ok_or(ExtractError::RootNotObject);

    match event_type {
        "push" => Ok(Outcome::Record(extract_push(root()?))),
        "pull_request" => extract_pull_request(root()?),
        _ => Ok(Outcome::Unrecognized),
    }
}

fn extract_push(root: &Map<String, Value>) -> EventSummary {
    let git_ref = lenient_string_at(root, &["ref"]).unwrap_or_default();
    let to_branch = git_ref
        .strip_prefix(BRANCH_PREFIX)
        .unwrap_or(&git_ref)
        .to_owned();

    EventSummary {
        kind: EventKind::Push,
        author: lenient_string_at(root, &["pusher", "name"]),
        from_branch: None,
        to_branch,
        timestamp: lenient_string_at(root, &["head_commit", "timestamp"]),
    }
}

fn extract_pull_request(root: &Map<String, Value>) -> Result<Outcome, ExtractError> {
    let merged = matches!(
        lookup(root, &["pull_request", "merged"])?,
        Some(Value::Bool(true))
    );
    let action = string_at(root, &["action"])?;

    let (kind, timestamp_key) = if merged {
        (EventKind::Merge, "merged_at")
    } else if matches!(action.as_deref(), Some("opened" | "reopened")) {
        (EventKind::PullRequest, "created_at")
    } else {
        return Ok(Outcome::Filtered(format!(
            "unmerged pull request with action {}",
            action.as_deref().unwrap_or("<none>")
        )));
    };

    Ok(Outcome::Record(EventSummary {
        kind,
        author: string_at(root, &["sender", "login"])?,
        from_branch: string_at(root, &["pull_request", "head", "ref"])?,
        // The column is non-null for every kind; a missing base ref reads as "".
        to_branch: string_at(root, &["pull_request", "base", "ref"])?.unwrap_or_default(),
        timestamp: string_at(root, &["pull_request", timestamp_key])?,
    }))
}

/// Normalizes one delivery.
///
/// `None` covers unrecognized event types, filtered pull request actions and
/// payloads whose structure could not be read; each case is logged separately.
pub fn normalize(event_type: &str, payload: Value) -> Option<NormalizedEvent> {
    match extract(event_type, &payload) {
        Ok(Outcome::Record(summary)) => Some(NormalizedEvent {
            summary,
            raw: payload,
        }),
        Ok(Outcome::Filtered(reason)) => {
            debug!("Ignoring {} event: {}", event_type, reason);
            None
        }
        Ok(Outcome::Unrecognized) => {
            info!("Unhandled event type: {}", event_type);
            None
        }
        Err(err) => {
            warn!("Failed to extract {} event: {}", event_type, err);
            None
        }
    }
}
