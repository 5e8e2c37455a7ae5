//! The explicit session context.
//!
//! A `Session` owns the observer's place/time, the catalog and at most one
//! quiz and one lobby. Each quiz and lobby carries a generation number;
//! anything scheduled for an older generation is stale and must be dropped.

use crate::astro::EquatorialPosition;
use crate::catalog::{Catalog, CelestialObject, ObjectKind};
use crate::config::SessionConfig;
use crate::error::{FirmamentError, Result};
use crate::lobby::{Dispatch, Lobby, LobbyPhase, LobbyRole};
use crate::place_time::{PlaceTime, PlaceTimeState};
use crate::quiz::{self, Quiz, QuizPhase, QuizResult};
use crate::view::{self, Gaze};
use chrono::{DateTime, Utc};
use firmament_shared::protocol::ProfileResponse;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuizKind {
    Test { family: String, group: usize },
    Challenge,
}

/// Delivered by the quiz result callback.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedQuiz {
    pub generation: u64,
    pub kind: QuizKind,
    pub result: QuizResult,
}

/// What the presentation layer shows for the current quiz question.
#[derive(Debug, Clone, PartialEq)]
pub struct QuizQuestionView {
    pub index: usize,
    pub total: usize,
    pub prompt: String,
    /// Where to point the view; the name itself is the answer.
    pub position: Option<EquatorialPosition>,
}

/// Outcome of submitting a gaze as a lobby answer.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerReceipt {
    pub question: String,
    pub position: EquatorialPosition,
    /// Angle between the gaze and the question's target (radians)
    pub separation: f64,
    pub on_target: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuizSnapshot {
    pub generation: u64,
    pub kind: QuizKind,
    pub phase: QuizPhase,
    pub cursor: usize,
    pub total: usize,
    pub time_remaining: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LobbySnapshot {
    pub generation: u64,
    pub lobby_id: Option<String>,
    pub role: LobbyRole,
    pub phase: LobbyPhase,
    pub dispatched: usize,
    pub answered: usize,
    pub window_open: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub place_time: PlaceTime,
    pub clock_multiplier: f64,
    pub logged_in: bool,
    pub quiz: Option<QuizSnapshot>,
    pub lobby: Option<LobbySnapshot>,
}

struct ActiveQuiz {
    generation: u64,
    kind: QuizKind,
    quiz: Quiz,
}

pub struct Session {
    config: SessionConfig,
    place_time: PlaceTimeState,
    catalog: Arc<Catalog>,
    rng: ChaCha8Rng,
    next_generation: u64,
    quiz: Option<ActiveQuiz>,
    lobby: Option<Lobby>,
    profile: ProfileResponse,
    finished_tx: mpsc::UnboundedSender<FinishedQuiz>,
    finished_rx: mpsc::UnboundedReceiver<FinishedQuiz>,
}

impl Session {
    pub fn new(config: SessionConfig, catalog: Arc<Catalog>, place_time: PlaceTime) -> Result<Self> {
        config.validate().map_err(FirmamentError::InvalidConfig)?;
        let rng = match config.rng_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            place_time: PlaceTimeState::new(place_time),
            catalog,
            rng,
            next_generation: 1,
            quiz: None,
            lobby: None,
            profile: ProfileResponse::logged_out(),
            finished_tx,
            finished_rx,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn place_time(&self) -> &PlaceTimeState {
        &self.place_time
    }

    pub fn place_time_mut(&mut self) -> &mut PlaceTimeState {
        &mut self.place_time
    }

    pub fn profile(&self) -> &ProfileResponse {
        &self.profile
    }

    pub fn set_profile(&mut self, profile: ProfileResponse) {
        self.profile = profile;
    }

    /// Completed count recorded in the profile for a family.
    pub fn recorded_progress(&self, family: &str) -> u32 {
        self.profile
            .progress
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(family))
            .map(|p| p.completed)
            .unwrap_or(0)
    }

    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    // === Quiz ===

    /// Test on one group of a family. Replaces any active quiz.
    pub fn start_test(&mut self, family: &str, group: usize) -> Result<u64> {
        let family = self.catalog.family(family)?;
        let questions = quiz::test_questions(
            family,
            group,
            self.config.quiz.prior_group_inclusion,
            &self.config.quiz.prompt,
            &mut self.rng,
        )?;
        let kind = QuizKind::Test {
            family: family.name.clone(),
            group,
        };
        let quiz = Quiz::new(questions, self.config.quiz.pass_threshold, &mut self.rng);
        Ok(self.install_quiz(kind, quiz))
    }

    /// Every constellation against one shared countdown. Replaces any active quiz.
    pub fn start_challenge(&mut self, now: Instant) -> Result<u64> {
        let questions = quiz::challenge_questions(&self.catalog, &self.config.quiz.prompt);
        let limit = Duration::from_secs(self.config.quiz.challenge_time_limit_secs);
        let quiz = Quiz::new(questions, self.config.quiz.pass_threshold, &mut self.rng)
            .with_time_limit(limit, now);
        Ok(self.install_quiz(QuizKind::Challenge, quiz))
    }

    fn install_quiz(&mut self, kind: QuizKind, quiz: Quiz) -> u64 {
        let generation = self.bump_generation();
        let tx = self.finished_tx.clone();
        let callback_kind = kind.clone();
        let quiz = quiz.on_result(Box::new(move |result| {
            let _ = tx.send(FinishedQuiz {
                generation,
                kind: callback_kind,
                result: *result,
            });
        }));
        if let Some(previous) = self.quiz.replace(ActiveQuiz {
            generation,
            kind: kind.clone(),
            quiz,
        }) {
            if !previous.quiz.is_finished() {
                tracing::info!("Quiz {} abandoned", previous.generation);
            }
        }
        tracing::info!("Quiz {} started: {:?}", generation, kind);
        generation
    }

    fn active_quiz_mut(&mut self) -> Result<&mut Quiz> {
        self.quiz
            .as_mut()
            .map(|active| &mut active.quiz)
            .ok_or(FirmamentError::NoActiveQuiz)
    }

    pub fn current_quiz_question(&self) -> Option<QuizQuestionView> {
        let active = self.quiz.as_ref()?;
        let question = active.quiz.current_question()?;
        Some(QuizQuestionView {
            index: active.quiz.cursor(),
            total: active.quiz.len(),
            prompt: question.prompt.clone(),
            position: self
                .catalog
                .constellation(&question.correct_answer)
                .map(|c| c.position),
        })
    }

    pub fn answer_quiz(&mut self, text: &str) -> Result<bool> {
        self.active_quiz_mut()?.submit_answer(text)
    }

    pub fn advance_quiz(&mut self) -> Result<Option<QuizResult>> {
        self.active_quiz_mut()?.advance()
    }

    /// Countdown of the active quiz, if it has one and is still running.
    pub fn quiz_deadline(&self) -> Option<(u64, Instant)> {
        let active = self.quiz.as_ref()?;
        if active.quiz.is_finished() {
            return None;
        }
        active.quiz.deadline().map(|at| (active.generation, at))
    }

    /// Countdown expiry. A timer from an older generation is a no-op.
    pub fn fire_quiz_timer(&mut self, generation: u64, now: Instant) -> Option<QuizResult> {
        match self.quiz.as_mut() {
            Some(active) if active.generation == generation && !active.quiz.is_finished() => {
                active.quiz.expire(now).ok().flatten()
            }
            _ => {
                tracing::debug!("Dropping stale quiz timer for generation {}", generation);
                None
            }
        }
    }

    /// Results delivered by quiz callbacks since the last call.
    pub fn take_finished_quizzes(&mut self) -> Vec<FinishedQuiz> {
        let mut finished = Vec::new();
        while let Ok(done) = self.finished_rx.try_recv() {
            finished.push(done);
        }
        finished
    }

    // === Lobby ===

    /// Host a new lobby. Replaces any lobby this session was in.
    pub fn begin_create_lobby(&mut self) -> u64 {
        let generation = self.bump_generation();
        self.replace_lobby(Lobby::creating(generation, self.config.lobby));
        generation
    }

    /// Join an existing lobby. Replaces any lobby this session was in.
    pub fn begin_join_lobby(&mut self, lobby_id: String) -> u64 {
        let generation = self.bump_generation();
        self.replace_lobby(Lobby::joining(generation, lobby_id, self.config.lobby));
        generation
    }

    fn replace_lobby(&mut self, lobby: Lobby) {
        if let Some(previous) = self.lobby.replace(lobby) {
            if previous.phase() != LobbyPhase::Ended {
                tracing::info!("Left lobby {:?}", previous.lobby_id());
            }
        }
    }

    pub fn lobby(&self) -> Option<&Lobby> {
        self.lobby.as_ref()
    }

    /// The lobby, but only if it is still the one of `generation`.
    pub fn lobby_mut_if(&mut self, generation: u64) -> Option<&mut Lobby> {
        self.lobby
            .as_mut()
            .filter(|lobby| lobby.generation() == generation)
    }

    /// Drop the lobby of `generation`, if it is still the active one.
    pub fn drop_lobby(&mut self, generation: u64) {
        if self.lobby_mut_if(generation).is_some() {
            self.lobby = None;
        }
    }

    pub fn leave_lobby(&mut self) -> bool {
        match self.lobby.take() {
            Some(lobby) => {
                tracing::info!("Left lobby {:?}", lobby.lobby_id());
                true
            }
            None => false,
        }
    }

    pub fn lobby_window_deadline(&self) -> Option<(u64, Instant)> {
        let lobby = self.lobby.as_ref()?;
        lobby.window_opens_at().map(|at| (lobby.generation(), at))
    }

    pub fn lobby_request_deadline(&self) -> Option<(u64, Instant)> {
        let lobby = self.lobby.as_ref()?;
        lobby.next_request_at().map(|at| (lobby.generation(), at))
    }

    /// Submit where the viewer is looking as the answer to the current lobby question.
    pub fn submit_gaze(&mut self, gaze: Gaze, now: Instant) -> Result<(AnswerReceipt, Dispatch)> {
        let rotation = self.place_time.rotation();
        let position = view::gaze_to_equatorial(gaze, &rotation)?;
        let radius = self.config.lobby.acceptance_radius;

        let lobby = self.lobby.as_mut().ok_or(FirmamentError::NoActiveLobby)?;
        let question = lobby
            .current_question()
            .cloned()
            .ok_or(FirmamentError::AnswerWindowClosed)?;
        let target = CelestialObject {
            id: question.name.clone(),
            kind: ObjectKind::Constellation,
            position: EquatorialPosition::new(question.ra, question.dec),
            magnitude: None,
            family: None,
        };

        let dispatch = lobby.submit_direction(position, now)?;
        let receipt = AnswerReceipt {
            separation: position.separation(&target.position),
            on_target: view::nearest_object(&position, [&target], radius).is_some(),
            question: question.name,
            position,
        };
        Ok((receipt, dispatch))
    }

    /// Catalog object nearest the gaze, within the acceptance radius.
    pub fn object_under_gaze(&mut self, gaze: Gaze) -> Result<Option<CelestialObject>> {
        let rotation = self.place_time.rotation();
        let radius = self.config.lobby.acceptance_radius;
        let found = view::object_under_gaze(gaze, &rotation, self.catalog.objects(), radius)?;
        Ok(found.cloned())
    }

    // === Place/time ===

    pub fn set_instant(&mut self, instant: DateTime<Utc>) {
        self.place_time.set_instant(instant);
    }

    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        SessionSnapshot {
            place_time: self.place_time.get(),
            clock_multiplier: self.place_time.clock().multiplier(),
            logged_in: self.profile.logged_in,
            quiz: self.quiz.as_ref().map(|active| QuizSnapshot {
                generation: active.generation,
                kind: active.kind.clone(),
                phase: active.quiz.phase(),
                cursor: active.quiz.cursor(),
                total: active.quiz.len(),
                time_remaining: active.quiz.time_remaining(now),
            }),
            lobby: self.lobby.as_ref().map(|lobby| LobbySnapshot {
                generation: lobby.generation(),
                lobby_id: lobby.lobby_id().map(str::to_string),
                role: lobby.role(),
                phase: lobby.phase(),
                dispatched: lobby.dispatched(),
                answered: lobby.answers().len(),
                window_open: lobby.is_window_open(),
            }),
        }
    }
}
