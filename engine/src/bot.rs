//! Bot participants that play multiplayer lobbies.
//!
//! A bot drives its own session through a `SessionHandle`, exactly like a
//! human client would:
//! - Join the lobby and wait for it to start
//! - When an answer window opens, wait a personality-dependent reaction time
//! - Aim at the question's constellation with some error and submit the gaze

use crate::astro::{self, EquatorialPosition};
use crate::error::{FirmamentError, Result};
use crate::place_time::PlaceTime;
use crate::session_loop::{SessionEvent, SessionHandle};
use crate::view::Gaze;
use firmament_shared::protocol::LobbyStatusResponse;
use rand::Rng;
use std::f64::consts::FRAC_PI_2;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

/// Bot personality affects reaction time and aim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotPersonality {
    /// Answers quickly (0.3-0.8s after the window opens), aims well
    Eager,
    /// Takes its time (1.5-4.0s), aims well
    Relaxed,
    /// Unpredictable timing (0.2-6.0s) and sloppy aim
    Chaotic,
}

impl BotPersonality {
    /// Reaction delay range (min, max) in seconds
    fn delay_range(&self) -> (f64, f64) {
        match self {
            BotPersonality::Eager => (0.3, 0.8),
            BotPersonality::Relaxed => (1.5, 4.0),
            BotPersonality::Chaotic => (0.2, 6.0),
        }
    }

    /// Largest aiming error per axis (radians)
    fn aim_error(&self) -> f64 {
        match self {
            BotPersonality::Eager => 0.05,
            BotPersonality::Relaxed => 0.03,
            BotPersonality::Chaotic => 0.4,
        }
    }

    fn random_delay(&self, rng: &mut impl Rng) -> Duration {
        let (min, max) = self.delay_range();
        Duration::from_secs_f64(min + rng.gen::<f64>() * (max - min))
    }

    /// Select a random personality
    pub fn random(rng: &mut impl Rng) -> Self {
        match rng.gen_range(0..3) {
            0 => BotPersonality::Eager,
            1 => BotPersonality::Relaxed,
            _ => BotPersonality::Chaotic,
        }
    }
}

/// Configuration for bots
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Number of bots joining the host's lobby
    pub count: usize,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self { count: 3 }
    }
}

#[derive(Debug, Clone)]
pub struct BotPlayer {
    pub name: String,
    pub personality: BotPersonality,
}

impl BotPlayer {
    pub fn new(name: impl Into<String>, personality: BotPersonality) -> Self {
        Self {
            name: name.into(),
            personality,
        }
    }

    pub fn reaction_delay(&self, rng: &mut impl Rng) -> Duration {
        self.personality.random_delay(rng)
    }

    /// Gaze pointing roughly at `target`.
    pub fn aim(&self, target: &EquatorialPosition, pt: &PlaceTime, rng: &mut impl Rng) -> Gaze {
        let exact = astro::to_horizontal(target, pt);
        let err = self.personality.aim_error();
        // Keep the angular yaw error bounded near the zenith.
        let yaw_scale = exact.altitude.cos().max(0.1);
        Gaze::new(
            exact.azimuth + rng.gen_range(-err..=err) / yaw_scale,
            (exact.altitude + rng.gen_range(-err..=err)).clamp(-FRAC_PI_2, FRAC_PI_2),
        )
    }

    /// Join `lobby_id` and play it to the end. Returns the final scores.
    pub async fn join_and_play(
        &self,
        handle: &SessionHandle,
        lobby_id: &str,
        rng: &mut (impl Rng + Send),
    ) -> Result<LobbyStatusResponse> {
        let events = handle.subscribe();
        handle.join_lobby(lobby_id).await?;
        self.play(handle, events, rng).await
    }

    /// Answer every question of the session's lobby until it ends.
    ///
    /// `events` must be subscribed before the lobby is created or joined.
    pub async fn play(
        &self,
        handle: &SessionHandle,
        mut events: broadcast::Receiver<SessionEvent>,
        rng: &mut (impl Rng + Send),
    ) -> Result<LobbyStatusResponse> {
        let mut target: Option<EquatorialPosition> = None;

        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Bot {} missed {} events", self.name, skipped);
                    continue;
                }
                Err(RecvError::Closed) => return Err(FirmamentError::SessionStopped),
            };
            match event {
                SessionEvent::LobbyQuestion { name, position, .. } => {
                    tracing::debug!("Bot {} looking for {}", self.name, name);
                    target = Some(position);
                }
                SessionEvent::AnswerWindowOpened { index } => {
                    let Some(position) = target.take() else {
                        continue;
                    };
                    tokio::time::sleep(self.reaction_delay(rng)).await;
                    let pt = handle.snapshot().await?.place_time;
                    let gaze = self.aim(&position, &pt, rng);
                    match handle.submit_gaze(gaze).await {
                        Ok(receipt) => tracing::debug!(
                            "Bot {} answered question {} off by {:.3} rad",
                            self.name,
                            index,
                            receipt.separation
                        ),
                        Err(e) => tracing::warn!("Bot {} answer rejected: {}", self.name, e),
                    }
                }
                SessionEvent::LobbyEnded(status) => return Ok(status),
                SessionEvent::LobbyFailed(e) => return Err(e),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn test_rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(42)
    }

    fn place_time() -> PlaceTime {
        let instant = Utc.with_ymd_and_hms(2024, 1, 5, 22, 0, 0).unwrap();
        PlaceTime::from_degrees(51.48, 0.0, instant).unwrap()
    }

    #[test]
    fn delays_stay_in_personality_range() {
        let mut rng = test_rng();
        for personality in [
            BotPersonality::Eager,
            BotPersonality::Relaxed,
            BotPersonality::Chaotic,
        ] {
            let bot = BotPlayer::new("bot", personality);
            let (min, max) = personality.delay_range();
            for _ in 0..100 {
                let delay = bot.reaction_delay(&mut rng).as_secs_f64();
                assert!(delay >= min && delay <= max + 1e-9);
            }
        }
    }

    #[test]
    fn careful_bots_aim_close() {
        let mut rng = test_rng();
        let pt = place_time();
        let target = EquatorialPosition::from_hours_degrees(5.58, 5.95); // Orion
        let bot = BotPlayer::new("bot", BotPersonality::Relaxed);
        for _ in 0..50 {
            let gaze = bot.aim(&target, &pt, &mut rng);
            let seen = crate::view::direction_to_equatorial(gaze.yaw, gaze.pitch, &pt).unwrap();
            assert!(seen.separation(&target) < 0.1);
        }
    }

    #[test]
    fn chaotic_bots_miss_more() {
        let mut rng = test_rng();
        let pt = place_time();
        let target = EquatorialPosition::from_hours_degrees(5.58, 5.95);
        let mean_error = |personality| {
            let bot = BotPlayer::new("bot", personality);
            let mut rng = ChaCha8Rng::seed_from_u64(7);
            (0..200)
                .map(|_| {
                    let gaze = bot.aim(&target, &pt, &mut rng);
                    crate::view::direction_to_equatorial(gaze.yaw, gaze.pitch, &pt)
                        .unwrap()
                        .separation(&target)
                })
                .sum::<f64>()
                / 200.0
        };
        assert!(mean_error(BotPersonality::Chaotic) > mean_error(BotPersonality::Eager));
        // personalities are all reachable
        let picks: Vec<_> = (0..30).map(|_| BotPersonality::random(&mut rng)).collect();
        assert!(picks.contains(&BotPersonality::Eager));
        assert!(picks.contains(&BotPersonality::Chaotic));
    }
}
