//! One participant's projection of a multiplayer lobby.
//!
//! `Lobby` is a plain state machine. It never performs I/O or sleeps: it
//! tells the session loop which request is due and when, and is fed the
//! completions back. At most one request is outstanding at a time, so a new
//! poll is only scheduled once the previous one has completed.
//!
//! ```text
//! Creating/Joining -> Ready -> Started -> QuestionDispatched <-> AwaitingAnswer
//!                                                      \-> AnsweredAll -> Ended
//! ```

use crate::astro::EquatorialPosition;
use crate::error::{FirmamentError, Result};
use firmament_shared::config::LobbyConfig;
use firmament_shared::protocol::{AnswerWire, LobbyQuestion, LobbyStatus, LobbyStatusResponse};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyRole {
    Host,
    Guest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyPhase {
    Creating,
    Joining,
    Ready,
    Started,
    QuestionDispatched,
    AwaitingAnswer,
    AnsweredAll,
    Ended,
}

/// Service request the lobby wants issued next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyRequest {
    Status,
    Finish,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Question {
        index: usize,
        question: LobbyQuestion,
        window_opens_at: Instant,
    },
    /// No questions left; the answer log is about to be submitted.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusOutcome {
    /// Still waiting for the host to start.
    Waiting(LobbyStatusResponse),
    /// The lobby has started; dispatch the first question.
    Started,
    /// Intermediate results after finishing.
    Partial(LobbyStatusResponse),
    /// Everyone finished; local state has been cleaned up.
    Ended(LobbyStatusResponse),
    /// The poll failed and was rescheduled.
    Retrying,
    /// No status request was outstanding.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    Accepted,
    Retrying { attempts: u32 },
    Ignored,
}

pub struct Lobby {
    generation: u64,
    lobby_id: Option<String>,
    role: LobbyRole,
    phase: LobbyPhase,
    queue: VecDeque<LobbyQuestion>,
    current: Option<LobbyQuestion>,
    dispatched: usize,
    answers: Vec<EquatorialPosition>,
    window_opens_at: Option<Instant>,
    next_request: Option<(Instant, LobbyRequest)>,
    in_flight: Option<LobbyRequest>,
    finish_failures: u32,
    last_status: Option<LobbyStatusResponse>,
    config: LobbyConfig,
}

impl Lobby {
    fn new(generation: u64, role: LobbyRole, phase: LobbyPhase, config: LobbyConfig) -> Self {
        Self {
            generation,
            lobby_id: None,
            role,
            phase,
            queue: VecDeque::new(),
            current: None,
            dispatched: 0,
            answers: Vec::new(),
            window_opens_at: None,
            next_request: None,
            in_flight: None,
            finish_failures: 0,
            last_status: None,
            config,
        }
    }

    /// Host side, waiting for the create request to complete.
    pub fn creating(generation: u64, config: LobbyConfig) -> Self {
        Self::new(generation, LobbyRole::Host, LobbyPhase::Creating, config)
    }

    /// Guest side, waiting for the join request to complete.
    pub fn joining(generation: u64, lobby_id: String, config: LobbyConfig) -> Self {
        let mut lobby = Self::new(generation, LobbyRole::Guest, LobbyPhase::Joining, config);
        lobby.lobby_id = Some(lobby_id);
        lobby
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn lobby_id(&self) -> Option<&str> {
        self.lobby_id.as_deref()
    }

    pub fn role(&self) -> LobbyRole {
        self.role
    }

    pub fn phase(&self) -> LobbyPhase {
        self.phase
    }

    pub fn current_question(&self) -> Option<&LobbyQuestion> {
        self.current.as_ref()
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    pub fn answers(&self) -> &[EquatorialPosition] {
        &self.answers
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    pub fn last_status(&self) -> Option<&LobbyStatusResponse> {
        self.last_status.as_ref()
    }

    pub fn is_window_open(&self) -> bool {
        self.phase == LobbyPhase::AwaitingAnswer
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    fn schedule(&mut self, at: Instant, request: LobbyRequest) {
        self.next_request = Some((at, request));
    }

    /// Take over the service's answer to create/join: id and question list.
    /// Polling starts right away.
    pub fn adopt(
        &mut self,
        lobby_id: String,
        questions: Vec<LobbyQuestion>,
        now: Instant,
    ) -> Result<()> {
        if !matches!(self.phase, LobbyPhase::Creating | LobbyPhase::Joining) {
            return Err(FirmamentError::InvalidTransition(format!(
                "cannot adopt lobby in phase {:?}",
                self.phase
            )));
        }
        tracing::info!(
            "{:?} in lobby {} with {} questions",
            self.role,
            lobby_id,
            questions.len()
        );
        self.lobby_id = Some(lobby_id);
        self.queue = questions.into();
        self.answers.clear();
        self.dispatched = 0;
        self.phase = LobbyPhase::Ready;
        self.schedule(now, LobbyRequest::Status);
        Ok(())
    }

    /// When the next request wants to go out. `None` while one is in flight.
    pub fn next_request_at(&self) -> Option<Instant> {
        if self.in_flight.is_some() {
            return None;
        }
        self.next_request.map(|(at, _)| at)
    }

    /// Mark the scheduled request as sent if it is due.
    pub fn take_due_request(&mut self, now: Instant) -> Option<LobbyRequest> {
        if self.in_flight.is_some() {
            return None;
        }
        match self.next_request {
            Some((at, request)) if at <= now => {
                self.next_request = None;
                self.in_flight = Some(request);
                Some(request)
            }
            _ => None,
        }
    }

    pub fn on_status(
        &mut self,
        result: Result<LobbyStatusResponse>,
        now: Instant,
    ) -> Result<StatusOutcome> {
        if self.in_flight != Some(LobbyRequest::Status) {
            return Ok(StatusOutcome::Ignored);
        }
        self.in_flight = None;

        let status = match result {
            Ok(status) => status,
            Err(e @ FirmamentError::LobbyNotFound(_)) => {
                tracing::warn!("Lobby {:?} is gone: {}", self.lobby_id, e);
                self.cleanup();
                return Err(e);
            }
            Err(e) => {
                tracing::debug!("Status poll failed, retrying: {}", e);
                self.schedule(now + self.poll_interval(), LobbyRequest::Status);
                return Ok(StatusOutcome::Retrying);
            }
        };
        self.last_status = Some(status.clone());

        match (self.phase, status.status) {
            (LobbyPhase::Ready, LobbyStatus::Started) => {
                tracing::info!("Lobby {:?} started", self.lobby_id);
                self.phase = LobbyPhase::Started;
                Ok(StatusOutcome::Started)
            }
            (LobbyPhase::Ready | LobbyPhase::AnsweredAll, LobbyStatus::Ended) => {
                tracing::info!("Lobby {:?} ended", self.lobby_id);
                self.cleanup();
                Ok(StatusOutcome::Ended(status))
            }
            (LobbyPhase::Ready, _) => {
                self.schedule(now + self.poll_interval(), LobbyRequest::Status);
                Ok(StatusOutcome::Waiting(status))
            }
            (LobbyPhase::AnsweredAll, _) => {
                self.schedule(now + self.poll_interval(), LobbyRequest::Status);
                Ok(StatusOutcome::Partial(status))
            }
            _ => Ok(StatusOutcome::Ignored),
        }
    }

    /// Check that this participant may start the lobby; returns its id.
    /// The transition itself is observed through polling.
    pub fn request_start(&self) -> Result<String> {
        if self.role != LobbyRole::Host {
            return Err(FirmamentError::NotHost);
        }
        match (&self.phase, &self.lobby_id) {
            (LobbyPhase::Ready, Some(id)) => Ok(id.clone()),
            _ => Err(FirmamentError::InvalidTransition(format!(
                "cannot start lobby in phase {:?}",
                self.phase
            ))),
        }
    }

    /// Dispatch the first question after the lobby started.
    pub fn begin(&mut self, now: Instant) -> Result<Dispatch> {
        if self.phase != LobbyPhase::Started {
            return Err(FirmamentError::InvalidTransition(format!(
                "cannot begin questions in phase {:?}",
                self.phase
            )));
        }
        Ok(self.dispatch_next(now))
    }

    fn dispatch_next(&mut self, now: Instant) -> Dispatch {
        match self.queue.pop_front() {
            Some(question) => {
                let index = self.dispatched;
                let window_opens_at = now + Duration::from_millis(self.config.answer_grace_ms);
                self.dispatched += 1;
                self.current = Some(question.clone());
                self.window_opens_at = Some(window_opens_at);
                self.phase = LobbyPhase::QuestionDispatched;
                tracing::debug!("Dispatched lobby question {}: {}", index, question.name);
                Dispatch::Question {
                    index,
                    question,
                    window_opens_at,
                }
            }
            None => {
                tracing::info!("All {} lobby questions answered", self.answers.len());
                self.current = None;
                self.window_opens_at = None;
                self.phase = LobbyPhase::AnsweredAll;
                self.schedule(now, LobbyRequest::Finish);
                Dispatch::Exhausted
            }
        }
    }

    /// When the answer window for the dispatched question opens.
    pub fn window_opens_at(&self) -> Option<Instant> {
        match self.phase {
            LobbyPhase::QuestionDispatched => self.window_opens_at,
            _ => None,
        }
    }

    /// Open the answer window once the grace delay has passed.
    pub fn open_window(&mut self, now: Instant) -> bool {
        match self.window_opens_at() {
            Some(at) if now >= at => {
                self.phase = LobbyPhase::AwaitingAnswer;
                true
            }
            _ => false,
        }
    }

    /// Record the answer to the current question and dispatch the next one.
    pub fn submit_direction(
        &mut self,
        position: EquatorialPosition,
        now: Instant,
    ) -> Result<Dispatch> {
        self.open_window(now);
        if self.phase != LobbyPhase::AwaitingAnswer {
            return Err(FirmamentError::AnswerWindowClosed);
        }
        self.answers.push(position);
        self.window_opens_at = None;
        Ok(self.dispatch_next(now))
    }

    /// Lobby id and answer log for the finish request.
    pub fn finish_payload(&self) -> Option<(String, Vec<AnswerWire>)> {
        let id = self.lobby_id.clone()?;
        let answers = self
            .answers
            .iter()
            .map(|p| AnswerWire {
                ra: p.right_ascension,
                dec: p.declination,
            })
            .collect();
        Some((id, answers))
    }

    pub fn on_finish(&mut self, result: Result<()>, now: Instant) -> Result<FinishOutcome> {
        if self.in_flight != Some(LobbyRequest::Finish) {
            return Ok(FinishOutcome::Ignored);
        }
        self.in_flight = None;

        match result {
            Ok(()) => {
                tracing::info!("Lobby {:?} answers submitted", self.lobby_id);
                self.schedule(now, LobbyRequest::Status);
                Ok(FinishOutcome::Accepted)
            }
            Err(e @ FirmamentError::LobbyNotFound(_)) => {
                self.cleanup();
                Err(e)
            }
            Err(e) => {
                self.finish_failures += 1;
                if self.finish_failures >= self.config.max_finish_attempts {
                    tracing::error!(
                        "Giving up on lobby {:?} after {} finish attempts: {}",
                        self.lobby_id,
                        self.finish_failures,
                        e
                    );
                    self.cleanup();
                    return Err(FirmamentError::FinishFailed {
                        attempts: self.finish_failures,
                    });
                }
                tracing::warn!("Finish failed ({}), retrying", e);
                self.schedule(now + self.poll_interval(), LobbyRequest::Finish);
                Ok(FinishOutcome::Retrying {
                    attempts: self.finish_failures,
                })
            }
        }
    }

    /// Disable the answer window and drop all pending work.
    pub fn cleanup(&mut self) {
        self.phase = LobbyPhase::Ended;
        self.queue.clear();
        self.current = None;
        self.answers.clear();
        self.window_opens_at = None;
        self.next_request = None;
        self.in_flight = None;
    }
}
