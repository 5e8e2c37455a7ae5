use std::f64::consts::PI;

/// Quiz configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, ts_rs::TS)]
#[ts(export, export_to = "../../web/src/generated/")]
#[serde(rename_all = "camelCase")]
pub struct QuizConfig {
    /// A quiz passes when the fraction correct is strictly greater than this.
    pub pass_threshold: f64,
    /// Single countdown shared by every question of a challenge (seconds)
    pub challenge_time_limit_secs: u64,
    /// Probability that a constellation of an earlier group joins a test
    pub prior_group_inclusion: f64,
    pub prompt: String,
}

impl Default for QuizConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 0.70,
            challenge_time_limit_secs: 60,
            prior_group_inclusion: 0.5,
            prompt: "What is the name of this constellation?".to_string(),
        }
    }
}

impl QuizConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.pass_threshold.is_finite() || !(0.0..=1.0).contains(&self.pass_threshold) {
            return Err("pass_threshold must be within [0, 1]".to_string());
        }
        if self.challenge_time_limit_secs == 0 {
            return Err("challenge_time_limit_secs must be > 0".to_string());
        }
        if !self.prior_group_inclusion.is_finite()
            || !(0.0..=1.0).contains(&self.prior_group_inclusion)
        {
            return Err("prior_group_inclusion must be within [0, 1]".to_string());
        }
        Ok(())
    }
}

/// Multiplayer lobby timing, as seen by one participant
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, ts_rs::TS)]
#[ts(export, export_to = "../../web/src/generated/")]
#[serde(rename_all = "camelCase")]
pub struct LobbyConfig {
    /// Delay between lobby status polls (ms)
    pub poll_interval_ms: u64,
    /// No-early-answer delay between dispatch and the answer window (ms)
    pub answer_grace_ms: u64,
    /// Finish submissions attempted before the failure is surfaced
    pub max_finish_attempts: u32,
    /// Angular radius within which a gaze counts as on target (radians)
    pub acceptance_radius: f64,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 4000,
            answer_grace_ms: 2000,
            max_finish_attempts: 3,
            acceptance_radius: 0.25, // ~14 degrees
        }
    }
}

impl LobbyConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be > 0".to_string());
        }
        if self.max_finish_attempts == 0 {
            return Err("max_finish_attempts must be >= 1".to_string());
        }
        if !self.acceptance_radius.is_finite()
            || self.acceptance_radius <= 0.0
            || self.acceptance_radius > PI
        {
            return Err("acceptance_radius must be within (0, PI]".to_string());
        }
        Ok(())
    }
}

/// Rules the session service applies to lobbies and the leaderboard
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, ts_rs::TS)]
#[ts(export, export_to = "../../web/src/generated/")]
#[serde(rename_all = "camelCase")]
pub struct LobbyRules {
    pub questions_per_lobby: usize,
    pub max_players: usize,
    /// Points per radian of (PI - angular error)
    pub score_multiplier: f64,
    /// Highest challenge score accepted by the leaderboard
    pub max_challenge_score: u32,
    pub leaderboard_size: usize,
}

impl Default for LobbyRules {
    fn default() -> Self {
        Self {
            questions_per_lobby: 6,
            max_players: 4,
            score_multiplier: 100.0,
            max_challenge_score: 88,
            leaderboard_size: 10,
        }
    }
}

impl LobbyRules {
    pub fn validate(&self) -> Result<(), String> {
        if self.questions_per_lobby == 0 {
            return Err("questions_per_lobby must be > 0".to_string());
        }
        if self.max_players == 0 {
            return Err("max_players must be > 0".to_string());
        }
        if !self.score_multiplier.is_finite() || self.score_multiplier <= 0.0 {
            return Err("score_multiplier must be finite and > 0".to_string());
        }
        Ok(())
    }
}
