//! Integration tests for the session loop.
//!
//! These tests spawn real session loops against the in-memory service and
//! drive them through their handles, with tokio time paused so that poll
//! intervals, answer windows and countdowns elapse instantly.

use chrono::{TimeZone, Utc};
use firmament_engine::astro::{self, EquatorialPosition};
use firmament_engine::bot::{BotPersonality, BotPlayer};
use firmament_engine::catalog::Catalog;
use firmament_engine::config::SessionConfig;
use firmament_engine::error::FirmamentError;
use firmament_engine::lobby::{LobbyPhase, LobbyRole};
use firmament_engine::place_time::PlaceTime;
use firmament_engine::quiz::QuizPhase;
use firmament_engine::service::InMemoryService;
use firmament_engine::session::QuizKind;
use firmament_engine::session_loop::{spawn_session, SessionEvent, SessionHandle};
use firmament_engine::view::Gaze;
use firmament_shared::config::LobbyRules;
use firmament_shared::protocol::LobbyStatus;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::Instant;

const WAIT_LIMIT: Duration = Duration::from_secs(600);

fn catalog() -> Arc<Catalog> {
    Arc::new(Catalog::builtin().unwrap())
}

fn place_time() -> PlaceTime {
    let instant = Utc.with_ymd_and_hms(2024, 1, 5, 22, 0, 0).unwrap();
    PlaceTime::from_degrees(51.48, 0.0, instant).unwrap()
}

fn session_config(seed: u64) -> SessionConfig {
    SessionConfig {
        rng_seed: Some(seed),
        ..SessionConfig::default()
    }
}

fn rules(questions_per_lobby: usize) -> LobbyRules {
    LobbyRules {
        questions_per_lobby,
        ..LobbyRules::default()
    }
}

fn spawn(catalog: &Arc<Catalog>, service: &InMemoryService, user: &str, seed: u64) -> SessionHandle {
    let (handle, _task) = spawn_session(
        session_config(seed),
        catalog.clone(),
        place_time(),
        service.client(user),
    )
    .unwrap();
    handle
}

/// Wait for the first event `pick` accepts.
async fn wait_for<T>(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut pick: impl FnMut(SessionEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("session stopped"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn lobby_ready(events: &mut broadcast::Receiver<SessionEvent>) -> (String, LobbyRole, usize) {
    wait_for(events, |e| match e {
        SessionEvent::LobbyReady {
            lobby_id,
            role,
            questions,
        } => Some((lobby_id, role, questions)),
        SessionEvent::LobbyFailed(e) => panic!("lobby failed: {}", e),
        _ => None,
    })
    .await
}

async fn lobby_question(events: &mut broadcast::Receiver<SessionEvent>) -> (usize, EquatorialPosition) {
    wait_for(events, |e| match e {
        SessionEvent::LobbyQuestion {
            index, position, ..
        } => Some((index, position)),
        SessionEvent::LobbyFailed(e) => panic!("lobby failed: {}", e),
        _ => None,
    })
    .await
}

async fn window_opened(events: &mut broadcast::Receiver<SessionEvent>) -> usize {
    wait_for(events, |e| match e {
        SessionEvent::AnswerWindowOpened { index } => Some(index),
        _ => None,
    })
    .await
}

/// Gaze 0.01 rad below (or above) the target along its azimuth.
fn aim_near(position: &EquatorialPosition) -> Gaze {
    let h = astro::to_horizontal(position, &place_time());
    let pitch = if h.altitude > 0.0 {
        h.altitude - 0.01
    } else {
        h.altitude + 0.01
    };
    Gaze::new(h.azimuth, pitch)
}

/// Constellation shown at `position` in a quiz question.
fn name_at(catalog: &Catalog, position: EquatorialPosition) -> String {
    catalog
        .constellations()
        .iter()
        .find(|c| c.position == position)
        .map(|c| c.id.clone())
        .unwrap()
}

/// Answer dispatched questions `from..count` near their targets.
async fn answer_all_from(
    handle: &SessionHandle,
    events: &mut broadcast::Receiver<SessionEvent>,
    from: usize,
    count: usize,
) {
    for expected in from..count {
        let (index, position) = lobby_question(events).await;
        assert_eq!(index, expected);
        assert_eq!(window_opened(events).await, expected);
        let receipt = handle.submit_gaze(aim_near(&position)).await.unwrap();
        assert!(receipt.on_target);
        assert!((receipt.separation - 0.01).abs() < 1e-6);
    }
}

async fn answer_all(
    handle: &SessionHandle,
    events: &mut broadcast::Receiver<SessionEvent>,
    count: usize,
) {
    answer_all_from(handle, events, 0, count).await;
}

async fn host_ready(
    catalog: &Arc<Catalog>,
    service: &InMemoryService,
) -> (SessionHandle, broadcast::Receiver<SessionEvent>, String) {
    let host = spawn(catalog, service, "alice", 1);
    let mut events = host.subscribe();
    host.create_lobby().await.unwrap();
    let (lobby_id, role, questions) = lobby_ready(&mut events).await;
    assert_eq!(role, LobbyRole::Host);
    assert_eq!(questions, service.lobby_questions(&lobby_id).unwrap().len());
    (host, events, lobby_id)
}

#[tokio::test(start_paused = true)]
async fn test_single_player_lobby_end_to_end() {
    let catalog = catalog();
    let service = InMemoryService::new(&catalog, rules(2), 7);
    let (host, mut events, lobby_id) = host_ready(&catalog, &service).await;

    host.start_lobby().await.unwrap();
    wait_for(&mut events, |e| match e {
        SessionEvent::LobbyStarted { lobby_id: id } => Some(id),
        _ => None,
    })
    .await;

    // Answers inside the grace delay are refused
    let (index, position) = lobby_question(&mut events).await;
    assert_eq!(index, 0);
    let early = host.submit_gaze(aim_near(&position)).await;
    assert_eq!(early, Err(FirmamentError::AnswerWindowClosed));

    let opened_at = Instant::now();
    assert_eq!(window_opened(&mut events).await, 0);
    assert!(opened_at.elapsed() >= Duration::from_millis(1900));
    let receipt = host.submit_gaze(aim_near(&position)).await.unwrap();
    assert!(receipt.on_target);

    answer_all_from(&host, &mut events, 1, 2).await;

    let answered = wait_for(&mut events, |e| match e {
        SessionEvent::LobbyAnsweredAll { answers } => Some(answers),
        _ => None,
    })
    .await;
    assert_eq!(answered, 2);

    let status = wait_for(&mut events, |e| match e {
        SessionEvent::LobbyEnded(status) => Some(status),
        _ => None,
    })
    .await;
    assert_eq!(status.status, LobbyStatus::Ended);
    // ceil((PI - 0.01) * 100) per answer
    assert_eq!(status.scores["alice"], 628);

    let snapshot = host.snapshot().await.unwrap();
    let lobby = snapshot.lobby.unwrap();
    assert_eq!(lobby.lobby_id.as_deref(), Some(lobby_id.as_str()));
    assert_eq!(lobby.phase, LobbyPhase::Ended);
    assert!(!lobby.window_open);
    assert_eq!(
        host.submit_gaze(Gaze::new(0.0, 0.5)).await,
        Err(FirmamentError::AnswerWindowClosed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_guest_discovers_start_by_polling() {
    let catalog = catalog();
    let service = InMemoryService::new(&catalog, rules(3), 7);
    let (host, mut host_events, lobby_id) = host_ready(&catalog, &service).await;

    let guest = spawn(&catalog, &service, "bob", 2);
    let mut guest_events = guest.subscribe();
    guest.join_lobby(&lobby_id).await.unwrap();
    let (joined, role, questions) = lobby_ready(&mut guest_events).await;
    assert_eq!(joined, lobby_id);
    assert_eq!(role, LobbyRole::Guest);
    assert_eq!(questions, 3);

    // Waiting room shows both participants
    let waiting = wait_for(&mut host_events, |e| match e {
        SessionEvent::LobbyWaiting(status) if status.scores.len() == 2 => Some(status),
        _ => None,
    })
    .await;
    assert_eq!(waiting.status, LobbyStatus::Ready);

    assert_eq!(guest.start_lobby().await, Err(FirmamentError::NotHost));
    host.start_lobby().await.unwrap();

    wait_for(&mut guest_events, |e| match e {
        SessionEvent::LobbyStarted { lobby_id } => Some(lobby_id),
        _ => None,
    })
    .await;
    answer_all(&guest, &mut guest_events, 3).await;
    answer_all(&host, &mut host_events, 3).await;

    for events in [&mut host_events, &mut guest_events] {
        let status = wait_for(events, |e| match e {
            SessionEvent::LobbyEnded(status) => Some(status),
            _ => None,
        })
        .await;
        assert_eq!(status.scores.len(), 2);
        assert!(status.scores.values().all(|s| *s > 0));
    }
}

#[tokio::test(start_paused = true)]
async fn test_bots_play_a_lobby() {
    let catalog = catalog();
    let service = InMemoryService::new(&catalog, rules(4), 11);
    let (host, host_events, lobby_id) = host_ready(&catalog, &service).await;

    let mut guests = Vec::new();
    for (i, personality) in [BotPersonality::Relaxed, BotPersonality::Chaotic]
        .into_iter()
        .enumerate()
    {
        let bot = BotPlayer::new(format!("bot-{}", i), personality);
        let handle = spawn(&catalog, &service, &bot.name, 10 + i as u64);
        let lobby_id = lobby_id.clone();
        guests.push(tokio::spawn(async move {
            let mut rng = ChaCha8Rng::seed_from_u64(i as u64);
            bot.join_and_play(&handle, &lobby_id, &mut rng).await
        }));
    }

    while service.lobby(&lobby_id).unwrap().scores.len() < 3 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    host.start_lobby().await.unwrap();

    let host_bot = BotPlayer::new("alice", BotPersonality::Eager);
    let mut rng = ChaCha8Rng::seed_from_u64(99);
    let final_status = host_bot.play(&host, host_events, &mut rng).await.unwrap();
    assert_eq!(final_status.status, LobbyStatus::Ended);
    assert_eq!(final_status.scores.len(), 3);

    for guest in guests {
        let status = guest.await.unwrap().unwrap();
        assert_eq!(status.scores.len(), 3);
        assert!(status.scores.values().all(|s| *s > 0));
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_poll_failures_are_retried() {
    let catalog = catalog();
    let service = InMemoryService::new(&catalog, rules(1), 7);
    let (host, mut events, _lobby_id) = host_ready(&catalog, &service).await;

    service.fail_next_status(3);
    host.start_lobby().await.unwrap();

    let started = Instant::now();
    wait_for(&mut events, |e| match e {
        SessionEvent::LobbyStarted { lobby_id } => Some(lobby_id),
        SessionEvent::LobbyFailed(e) => panic!("transient failure surfaced: {}", e),
        _ => None,
    })
    .await;
    // Three failed polls, each followed by a full poll interval
    assert!(started.elapsed() >= Duration::from_millis(3 * 4000));
}

#[tokio::test(start_paused = true)]
async fn test_vanished_lobby_fails() {
    let catalog = catalog();
    let service = InMemoryService::new(&catalog, rules(2), 7);
    let (host, mut events, lobby_id) = host_ready(&catalog, &service).await;

    assert!(service.remove_lobby(&lobby_id));

    let error = wait_for(&mut events, |e| match e {
        SessionEvent::LobbyFailed(e) => Some(e),
        _ => None,
    })
    .await;
    assert_eq!(error, FirmamentError::LobbyNotFound(lobby_id));

    let lobby = host.snapshot().await.unwrap().lobby.unwrap();
    assert_eq!(lobby.phase, LobbyPhase::Ended);
    assert!(!lobby.window_open);
}

#[tokio::test(start_paused = true)]
async fn test_joining_unknown_lobby_fails() {
    let catalog = catalog();
    let service = InMemoryService::new(&catalog, rules(2), 7);
    let guest = spawn(&catalog, &service, "bob", 2);
    let mut events = guest.subscribe();

    guest.join_lobby("nosuchid").await.unwrap();
    let error = wait_for(&mut events, |e| match e {
        SessionEvent::LobbyFailed(e) => Some(e),
        _ => None,
    })
    .await;
    assert_eq!(error, FirmamentError::LobbyNotFound("nosuchid".into()));
    assert!(guest.snapshot().await.unwrap().lobby.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_finish_is_retried() {
    let catalog = catalog();
    let service = InMemoryService::new(&catalog, rules(1), 7);
    let (host, mut events, _lobby_id) = host_ready(&catalog, &service).await;

    service.fail_next_finish(2);
    host.start_lobby().await.unwrap();
    answer_all(&host, &mut events, 1).await;

    let status = wait_for(&mut events, |e| match e {
        SessionEvent::LobbyEnded(status) => Some(status),
        SessionEvent::LobbyFailed(e) => panic!("finish gave up: {}", e),
        _ => None,
    })
    .await;
    assert!(status.scores["alice"] > 0);
}

#[tokio::test(start_paused = true)]
async fn test_finish_gives_up_after_max_attempts() {
    let catalog = catalog();
    let service = InMemoryService::new(&catalog, rules(1), 7);
    let (host, mut events, lobby_id) = host_ready(&catalog, &service).await;

    service.fail_next_finish(3);
    host.start_lobby().await.unwrap();
    answer_all(&host, &mut events, 1).await;

    let error = wait_for(&mut events, |e| match e {
        SessionEvent::LobbyFailed(e) => Some(e),
        SessionEvent::LobbyEnded(_) => panic!("lobby should not end"),
        _ => None,
    })
    .await;
    assert_eq!(error, FirmamentError::FinishFailed { attempts: 3 });
    assert_eq!(service.lobby(&lobby_id).unwrap().scores["alice"], -1);
}

#[tokio::test(start_paused = true)]
async fn test_leaving_lobby_silences_it() {
    let catalog = catalog();
    let service = InMemoryService::new(&catalog, rules(2), 7);
    let (host, mut events, _lobby_id) = host_ready(&catalog, &service).await;

    wait_for(&mut events, |e| match e {
        SessionEvent::LobbyWaiting(status) => Some(status),
        _ => None,
    })
    .await;
    host.leave_lobby().await.unwrap();
    assert!(host.snapshot().await.unwrap().lobby.is_none());
    assert_eq!(
        host.start_lobby().await,
        Err(FirmamentError::NoActiveLobby)
    );

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn test_challenge_times_out_and_shows_leaderboard() {
    let catalog = catalog();
    let service = InMemoryService::new(&catalog, rules(2), 7);
    let player = spawn(&catalog, &service, "carol", 3);
    let mut events = player.subscribe();

    let started = Instant::now();
    player.start_challenge().await.unwrap();
    let position = wait_for(&mut events, |e| match e {
        SessionEvent::QuizQuestion {
            index: 0,
            total,
            position,
            ..
        } => {
            assert_eq!(total, catalog.constellations().len());
            position
        }
        _ => None,
    })
    .await;
    assert!(player.answer_quiz(&name_at(&catalog, position)).await.unwrap());

    let (kind, result) = wait_for(&mut events, |e| match e {
        SessionEvent::QuizFinished { kind, result } => Some((kind, result)),
        _ => None,
    })
    .await;
    assert_eq!(kind, QuizKind::Challenge);
    assert_eq!(result.correct, 1);
    assert!(!result.pass);
    assert!(started.elapsed() >= Duration::from_secs(60));

    let leaderboard = wait_for(&mut events, |e| match e {
        SessionEvent::Leaderboard(entries) => Some(entries),
        _ => None,
    })
    .await;
    assert_eq!(leaderboard.len(), 1);
    assert_eq!(leaderboard[0].name, "carol");
    assert_eq!(leaderboard[0].score, 1);

    // Finished quizzes refuse further answers
    assert_eq!(
        player.answer_quiz("Orion").await,
        Err(FirmamentError::AlreadyFinished)
    );
}

#[tokio::test(start_paused = true)]
async fn test_new_challenge_invalidates_old_timer() {
    let catalog = catalog();
    let service = InMemoryService::new(&catalog, rules(2), 7);
    let player = spawn(&catalog, &service, "carol", 3);
    let mut events = player.subscribe();

    player.start_challenge().await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    let restarted = Instant::now();
    player.start_challenge().await.unwrap();

    // Past the first countdown, the second one is still running
    tokio::time::sleep(Duration::from_secs(40)).await;
    let quiz = player.snapshot().await.unwrap().quiz.unwrap();
    assert_eq!(quiz.phase, QuizPhase::Created);
    assert!(quiz.time_remaining.unwrap() <= Duration::from_secs(20));

    wait_for(&mut events, |e| match e {
        SessionEvent::QuizFinished { .. } => Some(()),
        _ => None,
    })
    .await;
    assert!(restarted.elapsed() >= Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_passed_test_records_progress() {
    let catalog = catalog();
    let service = InMemoryService::new(&catalog, rules(2), 7);
    let player = spawn(&catalog, &service, "dana", 4);
    let mut events = player.subscribe();

    player.refresh_profile().await.unwrap();
    let profile = wait_for(&mut events, |e| match e {
        SessionEvent::ProfileLoaded(profile) => Some(profile),
        _ => None,
    })
    .await;
    assert!(profile.logged_in);

    player.start_test("Orion", 0).await.unwrap();
    loop {
        let (index, total, position) = wait_for(&mut events, |e| match e {
            SessionEvent::QuizQuestion {
                index,
                total,
                position,
                ..
            } => Some((index, total, position)),
            _ => None,
        })
        .await;
        assert_eq!(total, 2);
        let name = name_at(&catalog, position.unwrap());
        assert!(player.answer_quiz(&name).await.unwrap());
        player.next_question().await.unwrap();
        if index + 1 == total {
            break;
        }
    }

    let (kind, result) = wait_for(&mut events, |e| match e {
        SessionEvent::QuizFinished { kind, result } => Some((kind, result)),
        _ => None,
    })
    .await;
    assert_eq!(
        kind,
        QuizKind::Test {
            family: "Orion".into(),
            group: 0
        }
    );
    assert!(result.pass);

    let (family, progress) = wait_for(&mut events, |e| match e {
        SessionEvent::ProgressRecorded { family, progress } => Some((family, progress)),
        _ => None,
    })
    .await;
    assert_eq!(family, "Orion");
    assert_eq!(progress, 2);
    assert_eq!(service.progress("dana", "Orion"), 2);

    // Profile is reloaded after recording
    let profile = wait_for(&mut events, |e| match e {
        SessionEvent::ProfileLoaded(profile) => Some(profile),
        _ => None,
    })
    .await;
    let orion = profile.progress.iter().find(|p| p.name == "Orion").unwrap();
    assert_eq!(orion.completed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_anonymous_progress_is_not_recorded() {
    let catalog = catalog();
    let service = InMemoryService::new(&catalog, rules(2), 7);
    let (player, _task) = spawn_session(
        session_config(5),
        catalog.clone(),
        place_time(),
        service.anonymous(),
    )
    .unwrap();
    let mut events = player.subscribe();

    player.start_test("Orion", 0).await.unwrap();
    for _ in 0..2 {
        let position = wait_for(&mut events, |e| match e {
            SessionEvent::QuizQuestion { position, .. } => position,
            _ => None,
        })
        .await;
        player.answer_quiz(&name_at(&catalog, position)).await.unwrap();
        player.next_question().await.unwrap();
    }
    let result = wait_for(&mut events, |e| match e {
        SessionEvent::QuizFinished { result, .. } => Some(result),
        _ => None,
    })
    .await;
    assert!(result.pass);

    tokio::time::sleep(Duration::from_secs(5)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SessionEvent::ProgressRecorded { .. }));
    }
}

#[tokio::test(start_paused = true)]
async fn test_frame_changes_and_look_at() {
    let catalog = catalog();
    let service = InMemoryService::new(&catalog, rules(2), 7);
    let player = spawn(&catalog, &service, "erin", 6);
    let mut events = player.subscribe();

    assert_eq!(
        player.set_latitude(2.0).await,
        Err(FirmamentError::InvalidLatitude(2.0))
    );
    player.set_longitude(0.0).await.unwrap();
    let frame = wait_for(&mut events, |e| match e {
        SessionEvent::FrameChanged(pt) => Some(pt),
        _ => None,
    })
    .await;
    assert_eq!(frame, place_time());

    let orion = catalog.constellation("Orion").unwrap().position;
    let gaze = Gaze::from(astro::to_horizontal(&orion, &place_time()));
    let seen = player.look_at(gaze).await.unwrap().unwrap();
    assert_eq!(seen.id, "Orion");
}
