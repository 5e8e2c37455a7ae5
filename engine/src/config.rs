use crate::bot::BotConfig;
use firmament_shared::config::{LobbyConfig, LobbyRules, QuizConfig};

/// Per-session configuration
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub quiz: QuizConfig,
    pub lobby: LobbyConfig,
    /// Fixed seed for shuffles and test sampling; entropy when unset
    pub rng_seed: Option<u64>,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.quiz.validate()?;
        self.lobby.validate()?;
        Ok(())
    }
}

/// Headless lobby simulation
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub bots: BotConfig,
    /// Observer shared by all participants (degrees)
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub rng_seed: u64,
    pub lobby: LobbyConfig,
    pub rules: LobbyRules,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            bots: BotConfig::default(),
            latitude_deg: 51.48, // Greenwich
            longitude_deg: 0.0,
            rng_seed: 42,
            lobby: LobbyConfig {
                poll_interval_ms: 1000,
                ..LobbyConfig::default()
            },
            rules: LobbyRules::default(),
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(-90.0..=90.0).contains(&self.latitude_deg) {
            return Err("latitude_deg must be within [-90, 90]".to_string());
        }
        if !self.longitude_deg.is_finite() {
            return Err("longitude_deg must be finite".to_string());
        }
        if self.bots.count + 1 > self.rules.max_players {
            return Err(format!(
                "{} bots plus the host exceed max_players ({})",
                self.bots.count, self.rules.max_players
            ));
        }
        self.lobby.validate()?;
        self.rules.validate()
    }

    pub fn session_config(&self, seed_offset: u64) -> SessionConfig {
        SessionConfig {
            lobby: self.lobby,
            rng_seed: Some(self.rng_seed.wrapping_add(seed_offset)),
            ..SessionConfig::default()
        }
    }
}
