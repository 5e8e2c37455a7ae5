//! JSON payloads exchanged with the external session service.
//!
//! The service itself (HTTP transport, persistence, authentication) lives
//! outside this workspace; these types pin down the shapes both sides agree on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ts_rs::TS;

// === Profile / progress ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    pub logged_in: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default)]
    pub progress: Vec<FamilyProgress>,
}

impl ProfileResponse {
    pub fn logged_out() -> Self {
        Self {
            logged_in: false,
            first_name: None,
            last_name: None,
            progress: Vec::new(),
        }
    }

    pub fn display_name(&self) -> Option<String> {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => Some(format!("{} {}", first, last)),
            (Some(first), None) => Some(first.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
pub struct FamilyProgress {
    pub name: String,
    pub completed: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
pub struct ProgressUpdate {
    pub progress: u32,
}

// === Lobby ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
#[serde(rename_all = "lowercase")]
pub enum LobbyStatus {
    Ready,
    Started,
    Ended,
}

/// A lobby question as handed out by the service. The service sends whole
/// constellation records; only the name and position matter here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
pub struct LobbyQuestion {
    pub name: String,
    pub ra: f64,
    pub dec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
pub struct CreateLobbyResponse {
    pub id: String,
    pub questions: Vec<LobbyQuestion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
pub struct JoinLobbyResponse {
    pub questions: Vec<LobbyQuestion>,
}

/// Scores are -1 until the participant has finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
pub struct LobbyStatusResponse {
    pub status: LobbyStatus,
    #[serde(default)]
    pub scores: BTreeMap<String, i64>,
}

impl LobbyStatusResponse {
    /// Participants that have submitted their answers
    pub fn finished_count(&self) -> usize {
        self.scores.values().filter(|s| **s >= 0).count()
    }
}

/// One submitted lobby answer: the equatorial point the participant looked at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
pub struct AnswerWire {
    pub ra: f64,
    pub dec: f64,
}

// === Leaderboard ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
pub struct LeaderboardEntry {
    pub name: String,
    pub score: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
pub struct ScoreSubmission {
    pub score: u32,
}

// === Catalog data ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
pub struct StarWire {
    pub hid: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub ra: f64,
    pub dec: f64,
    pub mag: f64,
    #[serde(default)]
    pub clr: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
pub struct EdgeWire {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
pub struct ConstellationWire {
    pub name: String,
    #[serde(default)]
    pub short: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub meaning: String,
    pub ra: f64,
    pub dec: f64,
    #[serde(default)]
    pub edges: Vec<EdgeWire>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
pub struct GroupWire {
    pub level: u32,
    pub constellations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
#[serde(rename_all = "camelCase")]
pub struct FamilyWire {
    pub name: String,
    #[serde(default)]
    pub info: String,
    pub num_constellations: u32,
    pub groups: Vec<GroupWire>,
}

/// Everything the sky view and the quizzes need, served as one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
pub struct CatalogWire {
    #[serde(default)]
    pub stars: Vec<StarWire>,
    pub constellations: Vec<ConstellationWire>,
    pub families: Vec<FamilyWire>,
}
