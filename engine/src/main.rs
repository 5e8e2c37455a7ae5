use chrono::Utc;
use firmament_engine::bot::{BotPersonality, BotPlayer};
use firmament_engine::catalog::Catalog;
use firmament_engine::config::SimConfig;
use firmament_engine::error::{FirmamentError, Result};
use firmament_engine::place_time::PlaceTime;
use firmament_engine::service::InMemoryService;
use firmament_engine::session_loop::{spawn_session, SessionEvent};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SimConfig::default();

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        eprintln!("Invalid simulation configuration: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        tracing::error!("Simulation failed: {}", e);
        std::process::exit(1);
    }
}

/// Host a lobby, let the bots join, and play it to the end.
async fn run(config: SimConfig) -> Result<()> {
    let catalog = Arc::new(Catalog::builtin()?);
    let service = InMemoryService::new(&catalog, config.rules, config.rng_seed);
    let place_time = PlaceTime::from_degrees(config.latitude_deg, config.longitude_deg, Utc::now())?;
    let mut rng = ChaCha8Rng::seed_from_u64(config.rng_seed);

    let (host, host_task) = spawn_session(
        config.session_config(0),
        catalog.clone(),
        place_time,
        service.client("host"),
    )?;
    let mut host_events = host.subscribe();
    host.create_lobby().await?;
    let lobby_id = wait_for_lobby(&mut host_events).await?;
    tracing::info!("Lobby {} open, inviting {} bots", lobby_id, config.bots.count);

    let mut bots = Vec::with_capacity(config.bots.count);
    for i in 0..config.bots.count {
        let bot = BotPlayer::new(format!("bot-{}", i + 1), BotPersonality::random(&mut rng));
        let (handle, task) = spawn_session(
            config.session_config(i as u64 + 1),
            catalog.clone(),
            place_time,
            service.client(&bot.name),
        )?;
        let lobby_id = lobby_id.clone();
        let mut bot_rng = ChaCha8Rng::seed_from_u64(rng.gen());
        tracing::info!("Spawned {} ({:?})", bot.name, bot.personality);
        bots.push(tokio::spawn(async move {
            let result = bot.join_and_play(&handle, &lobby_id, &mut bot_rng).await;
            let _ = handle.shutdown().await;
            let _ = task.await;
            (bot.name, result)
        }));
    }

    let expected = config.bots.count + 1;
    tokio::time::timeout(JOIN_TIMEOUT, async {
        loop {
            match service.lobby(&lobby_id) {
                Some(status) if status.scores.len() >= expected => return Ok(()),
                Some(_) => tokio::time::sleep(Duration::from_millis(100)).await,
                None => return Err(FirmamentError::LobbyNotFound(lobby_id.clone())),
            }
        }
    })
    .await
    .map_err(|_| FirmamentError::TransientNetworkFailure("bots did not join in time".into()))??;

    host.start_lobby().await?;
    let host_player = BotPlayer::new("host", BotPersonality::Eager);
    let status = host_player.play(&host, host_events, &mut rng).await?;

    for bot in bots {
        match bot.await {
            Ok((name, Ok(_))) => tracing::debug!("{} done", name),
            Ok((name, Err(e))) => tracing::warn!("{} failed: {}", name, e),
            Err(e) => tracing::warn!("Bot task panicked: {}", e),
        }
    }

    let mut ranking: Vec<_> = status.scores.into_iter().collect();
    ranking.sort_by(|a, b| b.1.cmp(&a.1));
    for (place, (name, score)) in ranking.iter().enumerate() {
        tracing::info!("#{} {} {}", place + 1, name, score);
    }

    host.shutdown().await?;
    let _ = host_task.await;
    Ok(())
}

/// Wait until the lobby we created is ready and return its id.
async fn wait_for_lobby(events: &mut broadcast::Receiver<SessionEvent>) -> Result<String> {
    loop {
        match events.recv().await {
            Ok(SessionEvent::LobbyReady { lobby_id, .. }) => return Ok(lobby_id),
            Ok(SessionEvent::LobbyFailed(e)) => return Err(e),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return Err(FirmamentError::SessionStopped),
        }
    }
}
