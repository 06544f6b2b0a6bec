//! Okey Room Server
//!
//! Wires the store, engine, timer and session layer together from the
//! environment, then plays one demo round end to end and checks the reveal.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use okey_server::{
    VERSION,
    config::AppConfig,
    core::clock::SystemClock,
    engine::{TurnEngine, TurnTimer},
    game::state::{ConnectionId, GamePhase, PlayerId},
    network::{
        auth::AuthenticatedPlayer,
        backplane::{Backplane, LocalBackplane, RedisBackplane},
        protocol::{ClientMessage, ServerMessage, TurnAction, TurnCommand},
        session::SessionManager,
        transport::LocalTransport,
    },
    proof::verify::verify_room,
    store::{MemoryBackend, RedisBackend, RoomBackend, StateStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env();
    info!("Okey Room Server v{}", VERSION);
    info!(
        "Hand size {}, turn timeout {:?}, discard pickup {}",
        config.rules.hand_size, config.rules.turn_timeout, config.rules.allow_discard_pickup
    );
    info!("Token validation configured: {}", config.auth.is_configured());

    let (backend, backplane): (Arc<dyn RoomBackend>, Arc<dyn Backplane>) = match &config.store.redis_url {
        Some(url) => (
            Arc::new(RedisBackend::connect(url).await.context("connecting state store")?),
            Arc::new(RedisBackplane::connect(url).await.context("connecting backplane")?),
        ),
        None => {
            warn!("OKEY_REDIS_URL not set, running single-instance in memory");
            (Arc::new(MemoryBackend::new()), Arc::new(LocalBackplane::default()))
        }
    };

    let store = Arc::new(StateStore::new(backend, config.store.clone()));
    let engine = TurnEngine::new(store, config.rules.clone(), Arc::new(SystemClock));
    let transport = Arc::new(LocalTransport::new());
    let sessions = Arc::new(SessionManager::new(
        engine.clone(),
        backplane.clone(),
        transport.clone(),
        config.auth.clone(),
    ));

    let (shutdown_tx, _) = broadcast::channel(1);
    let fanout = sessions.start_fanout(shutdown_tx.subscribe()).await?;
    let timer = TurnTimer::new(engine.clone(), backplane, config.timer.poll_interval);
    let timer_handle = tokio::spawn(timer.run(shutdown_tx.subscribe()));

    let result = demo_round(&sessions, &transport).await;

    let _ = shutdown_tx.send(());
    fanout.await.context("fan-out task")?;
    timer_handle.await.context("timer task")?;
    result
}

/// Seat four players, play until the draw pile runs out, verify the reveal.
async fn demo_round(sessions: &SessionManager, transport: &LocalTransport) -> anyhow::Result<()> {
    info!("=== Starting Demo Round ===");
    let engine = sessions.engine();
    let room = engine.create_room("demo table", 100).await?;
    info!("Room {} created", room.id);

    let mut seats = Vec::new();
    for name in ["ayse", "burak", "cem", "deniz"] {
        let identity = AuthenticatedPlayer {
            player_id: PlayerId::from_subject(&format!("demo:{}", name)),
            name: name.to_string(),
        };
        let connection = ConnectionId::random();
        let mut outbound = transport.register(connection).await;
        let player = identity.player_id;
        tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                if let ServerMessage::Reveal(reveal) = &message {
                    info!("{} received reveal for commitment {}", player, reveal.commitment_hash);
                } else {
                    debug!("{} <- {:?}", player, message);
                }
            }
        });

        let seed = format!("{}-seed", name);
        for message in [ClientMessage::Join { room_id: room.id }, ClientMessage::ClientSeed { seed }] {
            if let Some(ServerMessage::Error(e)) = sessions.handle_message(connection, &identity, message).await {
                anyhow::bail!("{} could not join: {}", name, e.message);
            }
        }
        seats.push((identity, connection));
    }

    let started = engine.start_game(room.id).await?;
    sessions.publish(&started).await;
    if let Some(commitment) = started.state.fairness.commitment {
        info!("Commitment published: {}", commitment.to_hex());
    }

    let mut turns = 0u32;
    loop {
        let state = engine.get_room(room.id).await?;
        if state.phase != GamePhase::Playing {
            break;
        }
        let Some(turn) = state.turn.as_ref() else { break };
        let Some((_, connection)) = seats.iter().find(|(id, _)| id.player_id == turn.player) else {
            anyhow::bail!("turn belongs to an unknown player");
        };

        let draw = TurnCommand { action: TurnAction::Draw, player_id: turn.player, tile_id: None };
        let drawn = sessions.handle_command(*connection, draw).await?;
        if drawn.state.phase != GamePhase::Playing {
            break;
        }

        let hand = &drawn.state.require_player(&turn.player)?.hand;
        let last = drawn.state.turn.as_ref().and_then(|t| t.last_drawn);
        let tile = engine.rules()
            .select_auto_discard(hand, last, drawn.state.tiles.indicator)
            .context("empty hand")?;
        let discard = TurnCommand { action: TurnAction::Discard, player_id: turn.player, tile_id: Some(tile) };
        sessions.handle_command(*connection, discard).await?;
        turns += 1;
    }

    let finished = engine.get_room(room.id).await?;
    info!("=== Round Over after {} turns: {:?} ===", turns, finished.outcome);
    info!("Final State Hash: {}", hex::encode(finished.compute_hash()));

    match verify_room(&finished) {
        Some(report) if report.is_valid() => info!("FAIRNESS VERIFIED: commitment and deal match"),
        Some(report) => warn!("FAIRNESS CHECK FAILED: {:?}", report.verdict),
        None => warn!("Round has not been revealed"),
    }
    Ok(())
}
