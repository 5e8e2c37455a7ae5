use crate::astro::EquatorialPosition;
use crate::catalog::{Catalog, CelestialObject};
use crate::config::SessionConfig;
use crate::error::{FirmamentError, Result};
use crate::lobby::{Dispatch, FinishOutcome, LobbyRequest, LobbyRole, StatusOutcome};
use crate::place_time::{ClockControl, PlaceTime};
use crate::quiz::{self, QuizResult};
use crate::service::SessionService;
use crate::session::{AnswerReceipt, FinishedQuiz, QuizKind, Session, SessionSnapshot};
use crate::view::Gaze;
use chrono::{DateTime, Utc};
use firmament_shared::protocol::{
    CreateLobbyResponse, JoinLobbyResponse, LeaderboardEntry, LobbyQuestion,
    LobbyStatusResponse, ProfileResponse,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

/// Commands from the presentation layer to the session loop
pub enum SessionCommand {
    SetLatitude {
        latitude: f64,
        response: oneshot::Sender<Result<()>>,
    },
    SetLongitude {
        longitude: f64,
        response: oneshot::Sender<Result<()>>,
    },
    SetInstant {
        instant: DateTime<Utc>,
    },
    /// Advance the simulated clock by real elapsed time.
    TickClock {
        elapsed: Duration,
    },
    ControlClock(ClockControl),
    RefreshProfile,
    StartTest {
        family: String,
        group: usize,
        response: oneshot::Sender<Result<()>>,
    },
    StartChallenge {
        response: oneshot::Sender<Result<()>>,
    },
    AnswerQuiz {
        answer: String,
        response: oneshot::Sender<Result<bool>>,
    },
    NextQuestion {
        response: oneshot::Sender<Result<()>>,
    },
    CreateLobby,
    JoinLobby {
        lobby_id: String,
    },
    StartLobby {
        response: oneshot::Sender<Result<()>>,
    },
    SubmitGaze {
        gaze: Gaze,
        response: oneshot::Sender<Result<AnswerReceipt>>,
    },
    LookAt {
        gaze: Gaze,
        response: oneshot::Sender<Result<Option<CelestialObject>>>,
    },
    LeaveLobby,
    Snapshot {
        response: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown,
}

/// Broadcasts from the session loop to the presentation layer
#[derive(Debug, Clone)]
pub enum SessionEvent {
    FrameChanged(PlaceTime),
    ProfileLoaded(ProfileResponse),
    QuizQuestion {
        index: usize,
        total: usize,
        prompt: String,
        position: Option<EquatorialPosition>,
    },
    QuizAnswered {
        correct: bool,
    },
    QuizFinished {
        kind: QuizKind,
        result: QuizResult,
    },
    ProgressRecorded {
        family: String,
        progress: u32,
    },
    Leaderboard(Vec<LeaderboardEntry>),
    LobbyReady {
        lobby_id: String,
        role: LobbyRole,
        questions: usize,
    },
    LobbyWaiting(LobbyStatusResponse),
    LobbyStarted {
        lobby_id: String,
    },
    LobbyQuestion {
        index: usize,
        name: String,
        position: EquatorialPosition,
    },
    AnswerWindowOpened {
        index: usize,
    },
    AnswerAccepted(AnswerReceipt),
    LobbyAnsweredAll {
        answers: usize,
    },
    /// Intermediate scores while others are still answering
    LobbyResults(LobbyStatusResponse),
    /// Final scores; local lobby state has been cleaned up
    LobbyEnded(LobbyStatusResponse),
    LobbyFailed(FirmamentError),
    RequestFailed {
        operation: &'static str,
        error: FirmamentError,
    },
}

/// Service responses returning to the loop, tagged with the generation they
/// were issued for.
enum Completion {
    Profile(Result<ProfileResponse>),
    ProgressPosted {
        family: String,
        progress: u32,
        result: Result<()>,
    },
    ScoreSubmitted(Result<()>),
    Leaderboard(Result<Vec<LeaderboardEntry>>),
    LobbyCreated {
        generation: u64,
        result: Result<CreateLobbyResponse>,
    },
    LobbyJoined {
        generation: u64,
        lobby_id: String,
        result: Result<JoinLobbyResponse>,
    },
    LobbyStatus {
        generation: u64,
        result: Result<LobbyStatusResponse>,
    },
    LobbyStartRequested {
        generation: u64,
        result: Result<()>,
    },
    LobbyFinished {
        generation: u64,
        result: Result<()>,
    },
}

struct Driver<S> {
    session: Session,
    service: S,
    events: broadcast::Sender<SessionEvent>,
    completions: mpsc::UnboundedSender<Completion>,
}

/// Sleep until the timer fires and yield its generation; never resolves without one.
async fn wait_for(timer: Option<(u64, Instant)>) -> u64 {
    match timer {
        Some((generation, at)) => {
            tokio::time::sleep_until(at).await;
            generation
        }
        None => std::future::pending().await,
    }
}

/// Run the session loop. Owns the session.
pub async fn run_session_loop<S: SessionService>(
    session: Session,
    service: S,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
) {
    let (completions, mut done_rx) = mpsc::unbounded_channel();
    let mut driver = Driver {
        session,
        service,
        events,
        completions,
    };

    loop {
        let quiz_timer = driver.session.quiz_deadline();
        let window_timer = driver.session.lobby_window_deadline();
        let request_timer = driver.session.lobby_request_deadline();

        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::Shutdown) | None => break,
                Some(cmd) => driver.handle_command(cmd),
            },

            Some(done) = done_rx.recv() => driver.handle_completion(done),

            generation = wait_for(quiz_timer) => driver.quiz_timer_fired(generation),

            generation = wait_for(window_timer) => driver.window_timer_fired(generation),

            generation = wait_for(request_timer) => driver.request_timer_fired(generation),
        }

        driver.process_finished_quizzes();
    }

    tracing::info!("Session loop ended");
}

impl<S: SessionService> Driver<S> {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn spawn<F>(&self, request: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let tx = self.completions.clone();
        tokio::spawn(async move {
            let _ = tx.send(request.await);
        });
    }

    fn handle_command(&mut self, cmd: SessionCommand) {
        let now = Instant::now();
        match cmd {
            SessionCommand::SetLatitude { latitude, response } => {
                let result = self.session.place_time_mut().set_latitude(latitude);
                if result.is_ok() {
                    self.frame_changed();
                }
                let _ = response.send(result);
            }
            SessionCommand::SetLongitude {
                longitude,
                response,
            } => {
                let result = self.session.place_time_mut().set_longitude(longitude);
                if result.is_ok() {
                    self.frame_changed();
                }
                let _ = response.send(result);
            }
            SessionCommand::SetInstant { instant } => {
                self.session.set_instant(instant);
                self.frame_changed();
            }
            SessionCommand::TickClock { elapsed } => {
                if self.session.place_time_mut().tick(elapsed) {
                    self.frame_changed();
                }
            }
            SessionCommand::ControlClock(control) => {
                self.session.place_time_mut().control_clock(control);
            }
            SessionCommand::RefreshProfile => self.refresh_profile(),
            SessionCommand::StartTest {
                family,
                group,
                response,
            } => {
                let result = self.session.start_test(&family, group).map(|_| ());
                if result.is_ok() {
                    self.emit_quiz_question();
                }
                let _ = response.send(result);
            }
            SessionCommand::StartChallenge { response } => {
                let result = self.session.start_challenge(now).map(|_| ());
                if result.is_ok() {
                    self.emit_quiz_question();
                }
                let _ = response.send(result);
            }
            SessionCommand::AnswerQuiz { answer, response } => {
                let result = self.session.answer_quiz(&answer);
                if let Ok(correct) = result {
                    self.emit(SessionEvent::QuizAnswered { correct });
                }
                let _ = response.send(result);
            }
            SessionCommand::NextQuestion { response } => {
                let result = self.session.advance_quiz();
                if let Ok(None) = result {
                    self.emit_quiz_question();
                }
                let _ = response.send(result.map(|_| ()));
            }
            SessionCommand::CreateLobby => {
                let generation = self.session.begin_create_lobby();
                let service = self.service.clone();
                self.spawn(async move {
                    Completion::LobbyCreated {
                        generation,
                        result: service.create_lobby().await,
                    }
                });
            }
            SessionCommand::JoinLobby { lobby_id } => {
                let generation = self.session.begin_join_lobby(lobby_id.clone());
                let service = self.service.clone();
                self.spawn(async move {
                    let result = service.join_lobby(lobby_id.clone()).await;
                    Completion::LobbyJoined {
                        generation,
                        lobby_id,
                        result,
                    }
                });
            }
            SessionCommand::StartLobby { response } => {
                let checked = match self.session.lobby() {
                    Some(lobby) => lobby
                        .request_start()
                        .map(|id| (lobby.generation(), id)),
                    None => Err(FirmamentError::NoActiveLobby),
                };
                let result = checked.map(|(generation, lobby_id)| {
                    let service = self.service.clone();
                    self.spawn(async move {
                        Completion::LobbyStartRequested {
                            generation,
                            result: service.start_lobby(lobby_id).await,
                        }
                    });
                });
                let _ = response.send(result);
            }
            SessionCommand::SubmitGaze { gaze, response } => {
                match self.session.submit_gaze(gaze, now) {
                    Ok((receipt, dispatch)) => {
                        self.emit(SessionEvent::AnswerAccepted(receipt.clone()));
                        self.handle_dispatch(dispatch);
                        let _ = response.send(Ok(receipt));
                    }
                    Err(e) => {
                        let _ = response.send(Err(e));
                    }
                }
            }
            SessionCommand::LookAt { gaze, response } => {
                let _ = response.send(self.session.object_under_gaze(gaze));
            }
            SessionCommand::LeaveLobby => {
                self.session.leave_lobby();
            }
            SessionCommand::Snapshot { response } => {
                let _ = response.send(self.session.snapshot(now));
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn frame_changed(&self) {
        self.emit(SessionEvent::FrameChanged(self.session.place_time().get()));
    }

    fn emit_quiz_question(&self) {
        if let Some(view) = self.session.current_quiz_question() {
            self.emit(SessionEvent::QuizQuestion {
                index: view.index,
                total: view.total,
                prompt: view.prompt,
                position: view.position,
            });
        }
    }

    fn refresh_profile(&self) {
        let service = self.service.clone();
        self.spawn(async move { Completion::Profile(service.fetch_profile().await) });
    }

    fn fetch_leaderboard(&self) {
        let service = self.service.clone();
        self.spawn(async move { Completion::Leaderboard(service.fetch_leaderboard().await) });
    }

    /// Follow-ups for quizzes whose result callback has run.
    fn process_finished_quizzes(&mut self) {
        for FinishedQuiz {
            generation,
            kind,
            result,
        } in self.session.take_finished_quizzes()
        {
            tracing::info!(
                "Quiz {} finished: {}/{} correct, pass={}",
                generation,
                result.correct,
                result.total,
                result.pass
            );
            self.emit(SessionEvent::QuizFinished {
                kind: kind.clone(),
                result,
            });
            match kind {
                QuizKind::Test { family, group } => self.record_progress(family, group, &result),
                QuizKind::Challenge => self.submit_challenge_score(&result),
            }
        }
    }

    fn record_progress(&self, family: String, group: usize, result: &QuizResult) {
        if !self.session.profile().logged_in {
            tracing::debug!("Not logged in, progress for {} not recorded", family);
            return;
        }
        let completed = self.session.recorded_progress(&family);
        let progress = self
            .session
            .catalog()
            .family(&family)
            .and_then(|f| quiz::progress_after(f, group, result, completed));
        match progress {
            Ok(Some(progress)) => {
                let service = self.service.clone();
                self.spawn(async move {
                    let result = service.post_progress(family.clone(), progress).await;
                    Completion::ProgressPosted {
                        family,
                        progress,
                        result,
                    }
                });
            }
            Ok(None) => {}
            Err(error) => self.emit(SessionEvent::RequestFailed {
                operation: "post_progress",
                error,
            }),
        }
    }

    /// Post the challenge score, then show the leaderboard. A zero score is
    /// never submitted.
    fn submit_challenge_score(&self, result: &QuizResult) {
        if result.correct == 0 {
            self.fetch_leaderboard();
            return;
        }
        let score = result.correct as u32;
        let service = self.service.clone();
        self.spawn(async move { Completion::ScoreSubmitted(service.submit_score(score).await) });
    }

    fn handle_dispatch(&self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Question {
                index, question, ..
            } => {
                self.emit(SessionEvent::LobbyQuestion {
                    index,
                    position: EquatorialPosition::new(question.ra, question.dec),
                    name: question.name,
                });
            }
            Dispatch::Exhausted => {
                let answers = self
                    .session
                    .lobby()
                    .map(|lobby| lobby.answers().len())
                    .unwrap_or(0);
                self.emit(SessionEvent::LobbyAnsweredAll { answers });
            }
        }
    }

    fn handle_completion(&mut self, done: Completion) {
        let now = Instant::now();
        match done {
            Completion::Profile(Ok(profile)) => {
                self.session.set_profile(profile.clone());
                self.emit(SessionEvent::ProfileLoaded(profile));
            }
            Completion::Profile(Err(error)) => self.emit(SessionEvent::RequestFailed {
                operation: "fetch_profile",
                error,
            }),
            Completion::ProgressPosted {
                family,
                progress,
                result,
            } => match result {
                Ok(()) => {
                    tracing::info!("Progress for {} now {}", family, progress);
                    self.emit(SessionEvent::ProgressRecorded { family, progress });
                    self.refresh_profile();
                }
                Err(error) => self.emit(SessionEvent::RequestFailed {
                    operation: "post_progress",
                    error,
                }),
            },
            Completion::ScoreSubmitted(result) => {
                if let Err(error) = result {
                    self.emit(SessionEvent::RequestFailed {
                        operation: "submit_score",
                        error,
                    });
                }
                self.fetch_leaderboard();
            }
            Completion::Leaderboard(Ok(entries)) => {
                self.emit(SessionEvent::Leaderboard(entries));
            }
            Completion::Leaderboard(Err(error)) => self.emit(SessionEvent::RequestFailed {
                operation: "fetch_leaderboard",
                error,
            }),
            Completion::LobbyCreated { generation, result } => {
                let adopted = result.map(|created| (created.id, created.questions));
                self.lobby_adopted(generation, LobbyRole::Host, adopted, now);
            }
            Completion::LobbyJoined {
                generation,
                lobby_id,
                result,
            } => {
                let adopted = result.map(|joined| (lobby_id, joined.questions));
                self.lobby_adopted(generation, LobbyRole::Guest, adopted, now);
            }
            Completion::LobbyStatus { generation, result } => {
                let Some(lobby) = self.session.lobby_mut_if(generation) else {
                    tracing::debug!("Dropping stale status for lobby generation {}", generation);
                    return;
                };
                match lobby.on_status(result, now) {
                    Ok(StatusOutcome::Waiting(status)) => {
                        self.emit(SessionEvent::LobbyWaiting(status));
                    }
                    Ok(StatusOutcome::Started) => {
                        let lobby_id = lobby.lobby_id().unwrap_or_default().to_string();
                        let dispatch = lobby.begin(now);
                        self.emit(SessionEvent::LobbyStarted { lobby_id });
                        match dispatch {
                            Ok(dispatch) => self.handle_dispatch(dispatch),
                            Err(e) => self.emit(SessionEvent::LobbyFailed(e)),
                        }
                    }
                    Ok(StatusOutcome::Partial(status)) => {
                        self.emit(SessionEvent::LobbyResults(status));
                    }
                    Ok(StatusOutcome::Ended(status)) => {
                        self.emit(SessionEvent::LobbyEnded(status));
                    }
                    Ok(StatusOutcome::Retrying) => {
                        tracing::debug!("Lobby status poll will be retried");
                    }
                    Ok(StatusOutcome::Ignored) => {}
                    Err(e) => self.emit(SessionEvent::LobbyFailed(e)),
                }
            }
            Completion::LobbyStartRequested { generation, result } => {
                if self.session.lobby_mut_if(generation).is_none() {
                    tracing::debug!("Dropping stale start for lobby generation {}", generation);
                    return;
                }
                if let Err(error) = result {
                    self.emit(SessionEvent::RequestFailed {
                        operation: "start_lobby",
                        error,
                    });
                }
            }
            Completion::LobbyFinished { generation, result } => {
                let Some(lobby) = self.session.lobby_mut_if(generation) else {
                    tracing::debug!("Dropping stale finish for lobby generation {}", generation);
                    return;
                };
                match lobby.on_finish(result, now) {
                    Ok(FinishOutcome::Retrying { attempts }) => {
                        tracing::debug!("Finish attempt {} failed, retrying", attempts);
                    }
                    Ok(FinishOutcome::Accepted | FinishOutcome::Ignored) => {}
                    Err(e) => self.emit(SessionEvent::LobbyFailed(e)),
                }
            }
        }
    }

    fn lobby_adopted(
        &mut self,
        generation: u64,
        role: LobbyRole,
        adopted: Result<(String, Vec<LobbyQuestion>)>,
        now: Instant,
    ) {
        let Some(lobby) = self.session.lobby_mut_if(generation) else {
            tracing::debug!("Dropping stale reply for lobby generation {}", generation);
            return;
        };
        let entered = adopted.and_then(|(lobby_id, questions)| {
            let count = questions.len();
            lobby.adopt(lobby_id.clone(), questions, now)?;
            Ok((lobby_id, count))
        });
        match entered {
            Ok((lobby_id, questions)) => self.emit(SessionEvent::LobbyReady {
                lobby_id,
                role,
                questions,
            }),
            Err(e) => {
                tracing::warn!("Could not enter lobby: {}", e);
                self.session.drop_lobby(generation);
                self.emit(SessionEvent::LobbyFailed(e));
            }
        }
    }

    fn quiz_timer_fired(&mut self, generation: u64) {
        if self.session.fire_quiz_timer(generation, Instant::now()).is_some() {
            tracing::info!("Quiz {} ran out of time", generation);
        }
    }

    fn window_timer_fired(&mut self, generation: u64) {
        let Some(lobby) = self.session.lobby_mut_if(generation) else {
            tracing::debug!("Dropping stale window timer for lobby generation {}", generation);
            return;
        };
        if lobby.open_window(Instant::now()) {
            let index = lobby.dispatched().saturating_sub(1);
            tracing::debug!("Answer window open for question {}", index);
            self.emit(SessionEvent::AnswerWindowOpened { index });
        }
    }

    fn request_timer_fired(&mut self, generation: u64) {
        let Some(lobby) = self.session.lobby_mut_if(generation) else {
            tracing::debug!("Dropping stale request timer for lobby generation {}", generation);
            return;
        };
        let Some(request) = lobby.take_due_request(Instant::now()) else {
            return;
        };
        let service = self.service.clone();
        match request {
            LobbyRequest::Status => {
                let lobby_id = lobby.lobby_id().unwrap_or_default().to_string();
                self.spawn(async move {
                    Completion::LobbyStatus {
                        generation,
                        result: service.lobby_status(lobby_id).await,
                    }
                });
            }
            LobbyRequest::Finish => {
                let Some((lobby_id, answers)) = lobby.finish_payload() else {
                    return;
                };
                tracing::info!("Submitting {} answers to lobby {}", answers.len(), lobby_id);
                self.spawn(async move {
                    Completion::LobbyFinished {
                        generation,
                        result: service.finish_lobby(lobby_id, answers).await,
                    }
                });
            }
        }
    }
}

/// Cloneable front end to a running session loop.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn send(&self, cmd: SessionCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| FirmamentError::SessionStopped)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand) -> Result<T> {
        let (response, rx) = oneshot::channel();
        self.send(make(response)).await?;
        rx.await.map_err(|_| FirmamentError::SessionStopped)
    }

    pub async fn set_latitude(&self, latitude: f64) -> Result<()> {
        self.request(|response| SessionCommand::SetLatitude { latitude, response })
            .await?
    }

    pub async fn set_longitude(&self, longitude: f64) -> Result<()> {
        self.request(|response| SessionCommand::SetLongitude {
            longitude,
            response,
        })
        .await?
    }

    pub async fn set_instant(&self, instant: DateTime<Utc>) -> Result<()> {
        self.send(SessionCommand::SetInstant { instant }).await
    }

    pub async fn refresh_profile(&self) -> Result<()> {
        self.send(SessionCommand::RefreshProfile).await
    }

    pub async fn start_test(&self, family: &str, group: usize) -> Result<()> {
        let family = family.to_string();
        self.request(|response| SessionCommand::StartTest {
            family,
            group,
            response,
        })
        .await?
    }

    pub async fn start_challenge(&self) -> Result<()> {
        self.request(|response| SessionCommand::StartChallenge { response })
            .await?
    }

    pub async fn answer_quiz(&self, answer: &str) -> Result<bool> {
        let answer = answer.to_string();
        self.request(|response| SessionCommand::AnswerQuiz { answer, response })
            .await?
    }

    pub async fn next_question(&self) -> Result<()> {
        self.request(|response| SessionCommand::NextQuestion { response })
            .await?
    }

    pub async fn create_lobby(&self) -> Result<()> {
        self.send(SessionCommand::CreateLobby).await
    }

    pub async fn join_lobby(&self, lobby_id: &str) -> Result<()> {
        self.send(SessionCommand::JoinLobby {
            lobby_id: lobby_id.to_string(),
        })
        .await
    }

    pub async fn start_lobby(&self) -> Result<()> {
        self.request(|response| SessionCommand::StartLobby { response })
            .await?
    }

    pub async fn submit_gaze(&self, gaze: Gaze) -> Result<AnswerReceipt> {
        self.request(|response| SessionCommand::SubmitGaze { gaze, response })
            .await?
    }

    pub async fn look_at(&self, gaze: Gaze) -> Result<Option<CelestialObject>> {
        self.request(|response| SessionCommand::LookAt { gaze, response })
            .await?
    }

    pub async fn leave_lobby(&self) -> Result<()> {
        self.send(SessionCommand::LeaveLobby).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(|response| SessionCommand::Snapshot { response })
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(SessionCommand::Shutdown).await
    }
}

/// Validate the configuration and spawn a session loop for it.
pub fn spawn_session<S: SessionService>(
    config: SessionConfig,
    catalog: Arc<Catalog>,
    place_time: PlaceTime,
    service: S,
) -> Result<(SessionHandle, JoinHandle<()>)> {
    let session = Session::new(config, catalog, place_time)?;
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let events = event_tx.clone();
    let task = tokio::spawn(async move {
        run_session_loop(session, service, cmd_rx, events).await;
    });

    Ok((
        SessionHandle {
            commands: cmd_tx,
            events: event_tx,
        },
        task,
    ))
}
