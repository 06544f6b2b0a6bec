//! Session Management
//!
//! Binds authenticated connections to players and rooms, turns inbound
//! messages into engine operations and fans persisted changes out to the
//! connections this instance holds.
//!
//! ## Flow
//!
//! ```text
//!  client ──► handle_message ──► TurnEngine ──► StateStore (CAS)
//!                                    │
//!                                    ▼
//!                               Backplane.publish(RoomUpdate)
//!                                    │
//!            every instance ◄────────┘
//!                 │
//!                 ▼
//!  deliver: RoomView per local connection in the room
//! ```
//!
//! Bindings live in the store, so a player can reconnect through any
//! instance. The in-process map only tracks which connections this instance
//! is responsible for pushing to.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::engine::{EngineOutcome, TurnEngine};
use crate::error::GameError;
use crate::game::state::{ConnectionId, GamePhase, PlayerId, RoomId};
use crate::game::turn::TimeoutOutcome;
use crate::network::auth::{authenticate, AuthConfig, AuthenticatedPlayer};
use crate::network::backplane::{Backplane, RoomUpdate};
use crate::network::protocol::{
    ClientMessage, ErrorCode, RoomSummary, RoomView, ServerMessage, TurnAction, TurnCommand,
};
use crate::network::transport::Transport;
use crate::store::ConnectionBinding;

/// Connections held by this instance, by room then player.
type LocalConnections = BTreeMap<RoomId, BTreeMap<PlayerId, ConnectionId>>;

/// Connection-to-room routing and fan-out for one instance.
pub struct SessionManager {
    engine: TurnEngine,
    backplane: Arc<dyn Backplane>,
    transport: Arc<dyn Transport>,
    auth: AuthConfig,
    identities: RwLock<HashMap<ConnectionId, AuthenticatedPlayer>>,
    local: RwLock<LocalConnections>,
}

impl SessionManager {
    /// Create a session manager.
    pub fn new(
        engine: TurnEngine,
        backplane: Arc<dyn Backplane>,
        transport: Arc<dyn Transport>,
        auth: AuthConfig,
    ) -> Self {
        if !auth.is_configured() {
            warn!("No token key configured, every Auth message will be rejected");
        }
        Self {
            engine,
            backplane,
            transport,
            auth,
            identities: RwLock::new(HashMap::new()),
            local: RwLock::new(BTreeMap::new()),
        }
    }

    /// Engine used for room operations.
    pub fn engine(&self) -> &TurnEngine {
        &self.engine
    }

    // =========================================================================
    // BINDINGS
    // =========================================================================

    /// Record that `player` in `room` is reachable on `connection`.
    ///
    /// Overwrites any earlier binding for the player.
    pub async fn bind(
        &self,
        player: PlayerId,
        room: RoomId,
        connection: ConnectionId,
    ) -> Result<ConnectionBinding, GameError> {
        let binding = ConnectionBinding {
            player_id: player,
            room_id: room,
            connection_id: connection,
            bound_at: self.engine.now(),
        };
        self.engine.store().put_binding(binding.clone()).await?;

        let mut local = self.local.write().await;
        for players in local.values_mut() {
            players.remove(&player);
        }
        local.retain(|_, players| !players.is_empty());
        local.entry(room).or_default().insert(player, connection);
        Ok(binding)
    }

    /// Player and room behind a connection.
    pub async fn resolve(&self, connection: ConnectionId) -> Result<(PlayerId, RoomId), GameError> {
        self.engine.store()
            .binding_for_connection(connection)
            .await?
            .map(|b| (b.player_id, b.room_id))
            .ok_or_else(|| GameError::connection_not_found(connection))
    }

    async fn forget_local(&self, room: RoomId, player: PlayerId) {
        let mut local = self.local.write().await;
        if let Some(players) = local.get_mut(&room) {
            players.remove(&player);
            if players.is_empty() {
                local.remove(&room);
            }
        }
    }

    // =========================================================================
    // CONNECTION LIFECYCLE
    // =========================================================================

    /// A player's connection dropped.
    ///
    /// The player stays seated with hand and turn untouched; only the
    /// connection key is removed.
    #[instrument(skip(self))]
    pub async fn on_disconnect(&self, player: PlayerId) -> Result<EngineOutcome, GameError> {
        let binding = self.engine.store()
            .binding_for_player(player)
            .await?
            .ok_or_else(|| GameError::player_not_found(player))?;

        let outcome = self.engine.mark_disconnected(binding.room_id, player).await?;
        self.engine.store().remove_binding(binding.connection_id).await?;
        self.forget_local(binding.room_id, player).await;
        self.publish(&outcome).await;
        info!("Player {} disconnected from room {}", player, binding.room_id);
        Ok(outcome)
    }

    /// A socket closed. Ignored when the connection was already superseded
    /// by a reconnect.
    pub async fn on_connection_closed(&self, connection: ConnectionId) -> Result<(), GameError> {
        self.identities.write().await.remove(&connection);
        match self.resolve(connection).await {
            Ok((player, _)) => self.on_disconnect(player).await.map(|_| ()),
            Err(GameError::NotFound { .. }) => {
                debug!("Connection {} closed after being superseded", connection);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// A player came back on a new connection.
    ///
    /// An overdue turn is auto-played first so the snapshot the player gets
    /// is current. The snapshot is pushed to the new connection as `Resync`.
    #[instrument(skip(self))]
    pub async fn on_reconnect(&self, player: PlayerId, connection: ConnectionId) -> Result<RoomView, GameError> {
        let binding = self.engine.store()
            .binding_for_player(player)
            .await?
            .ok_or_else(|| GameError::player_not_found(player))?;
        let room = binding.room_id;

        let state = self.engine.get_room(room).await?;
        if let (GamePhase::Playing, Some(turn)) = (state.phase, state.turn.as_ref()) {
            if turn.is_expired(self.engine.now()) {
                let (result, outcome) = self.engine.on_turn_timeout(room, turn.number).await?;
                if let (TimeoutOutcome::AutoPlayed { .. }, Some(outcome)) = (result, outcome) {
                    self.publish(&outcome).await;
                }
            }
        }

        let outcome = self.engine.mark_connected(room, player).await?;
        self.bind(player, room, connection).await?;

        let view = RoomView::for_player(&outcome.state, Some(player));
        if let Err(e) = self.transport.send(connection, ServerMessage::Resync(view.clone())).await {
            warn!("Resync for {} not delivered: {}", player, e);
        }
        self.publish(&outcome).await;
        info!("Player {} reconnected to room {} (v{})", player, room, view.version);
        Ok(view)
    }

    // =========================================================================
    // HANDSHAKE
    // =========================================================================

    /// Entry point for a raw text frame from a connection.
    pub async fn receive_text(&self, connection: ConnectionId, text: &str) -> Option<ServerMessage> {
        match ClientMessage::from_json(text) {
            Ok(message) => self.receive(connection, message).await,
            Err(e) => Some(ServerMessage::error(ErrorCode::InvalidMessage, e.to_string())),
        }
    }

    /// Entry point for a decoded message from a connection.
    ///
    /// The first message must be `Auth`; anything else before it is refused
    /// with `NotAuthenticated`.
    pub async fn receive(&self, connection: ConnectionId, message: ClientMessage) -> Option<ServerMessage> {
        if let ClientMessage::Auth { token } = message {
            return self.authenticate_connection(connection, &token).await;
        }
        let identity = self.identities.read().await.get(&connection).cloned();
        match identity {
            Some(identity) => self.handle_message(connection, &identity, message).await,
            None => Some(ServerMessage::error(ErrorCode::NotAuthenticated, "send auth first")),
        }
    }

    /// Validate a token and attach the identity to the connection.
    ///
    /// `Authenticated` is pushed before anything else. A player still seated
    /// in a room is then reconnected and gets a `Resync`.
    async fn authenticate_connection(&self, connection: ConnectionId, token: &str) -> Option<ServerMessage> {
        if self.identities.read().await.contains_key(&connection) {
            return Some(ServerMessage::error(ErrorCode::IllegalAction, "already authenticated"));
        }
        let identity = match authenticate(token, &self.auth) {
            Ok(identity) => identity,
            Err(e) => {
                debug!("Connection {} failed authentication: {}", connection, e);
                return Some(ServerMessage::error(ErrorCode::from(&e), e.to_string()));
            }
        };
        let player = identity.player_id;
        self.identities.write().await.insert(connection, identity.clone());
        info!("Connection {} authenticated as {}", connection, player);

        let hello = ServerMessage::Authenticated { player_id: player, name: identity.name };
        if let Err(e) = self.transport.send(connection, hello).await {
            warn!("Authenticated reply for {} not delivered: {}", player, e);
        }

        match self.engine.store().binding_for_player(player).await {
            Ok(Some(_)) => {
                if let Err(e) = self.on_reconnect(player, connection).await {
                    debug!("Player {} has no room to resume: {}", player, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Binding lookup for {} failed: {}", player, e),
        }
        None
    }

    // =========================================================================
    // REQUESTS
    // =========================================================================

    /// Seat a player and bind their connection.
    #[instrument(skip(self, name))]
    pub async fn join(
        &self,
        player: PlayerId,
        room: RoomId,
        name: &str,
        connection: ConnectionId,
    ) -> Result<EngineOutcome, GameError> {
        let outcome = self.engine.join(room, player, name).await?;
        self.bind(player, room, connection).await?;
        self.publish(&outcome).await;
        Ok(outcome)
    }

    /// Run a turn command from `connection`.
    pub async fn handle_command(
        &self,
        connection: ConnectionId,
        command: TurnCommand,
    ) -> Result<EngineOutcome, GameError> {
        let (player, room) = self.resolve(connection).await?;
        if command.player_id != player {
            return Err(GameError::IllegalAction(format!(
                "connection is bound to {}, not {}",
                player, command.player_id
            )));
        }

        let outcome = match command.action {
            TurnAction::Draw => self.engine.draw(room, player).await?,
            TurnAction::PickupDiscard => self.engine.pickup_discard(room, player).await?,
            TurnAction::Discard => {
                let tile = command.tile_id
                    .ok_or_else(|| GameError::Validation("discard needs a tile_id".into()))?;
                self.engine.discard(room, player, tile).await?
            }
        };
        self.publish(&outcome).await;
        Ok(outcome)
    }

    /// Handle one client message and return the direct reply, if any.
    ///
    /// Room changes reach the sender through fan-out like everyone else.
    pub async fn handle_message(
        &self,
        connection: ConnectionId,
        identity: &AuthenticatedPlayer,
        message: ClientMessage,
    ) -> Option<ServerMessage> {
        match self.dispatch(connection, identity, message).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Request from {} failed: {}", identity.player_id, e);
                Some(ServerMessage::from_game_error(&e))
            }
        }
    }

    async fn dispatch(
        &self,
        connection: ConnectionId,
        identity: &AuthenticatedPlayer,
        message: ClientMessage,
    ) -> Result<Option<ServerMessage>, GameError> {
        let player = identity.player_id;
        match message {
            ClientMessage::Auth { .. } => Err(GameError::IllegalAction("already authenticated".into())),
            ClientMessage::ListRooms => {
                let rooms = self.engine.list_rooms().await?
                    .iter()
                    .map(RoomSummary::from)
                    .collect();
                Ok(Some(ServerMessage::Rooms { rooms }))
            }
            ClientMessage::CreateRoom { name, stake } => {
                let room = self.engine.create_room(&name, stake).await?;
                self.join(player, room.id, &identity.name, connection).await?;
                Ok(None)
            }
            ClientMessage::Join { room_id } => {
                self.join(player, room_id, &identity.name, connection).await?;
                Ok(None)
            }
            ClientMessage::Leave => {
                let (_, room) = self.resolve(connection).await?;
                let outcome = self.engine.leave(room, player).await?;
                self.publish(&outcome).await;
                self.engine.store().remove_binding(connection).await?;
                self.forget_local(room, player).await;
                Ok(Some(ServerMessage::State(RoomView::for_player(&outcome.state, None))))
            }
            ClientMessage::ClientSeed { seed } => {
                let (_, room) = self.resolve(connection).await?;
                let outcome = self.engine.submit_client_seed(room, player, &seed).await?;
                self.publish(&outcome).await;
                Ok(None)
            }
            ClientMessage::StartGame => {
                let (_, room) = self.resolve(connection).await?;
                let outcome = self.engine.start_game(room).await?;
                self.publish(&outcome).await;
                Ok(None)
            }
            ClientMessage::Turn { command } => {
                self.handle_command(connection, command).await?;
                Ok(None)
            }
            ClientMessage::SyncRequest => {
                let (_, room) = self.resolve(connection).await?;
                let state = self.engine.get_room(room).await?;
                Ok(Some(ServerMessage::Resync(RoomView::for_player(&state, Some(player)))))
            }
            ClientMessage::Ping { timestamp } => Ok(Some(ServerMessage::Pong {
                timestamp,
                server_time: self.engine.now().timestamp_millis().max(0) as u64,
            })),
        }
    }

    // =========================================================================
    // FAN-OUT
    // =========================================================================

    /// Announce a persisted change to every instance. Failures are logged
    /// only; the store already holds the change.
    pub async fn publish(&self, outcome: &EngineOutcome) {
        if outcome.is_noop() {
            return;
        }
        let update = RoomUpdate::new(outcome.state.clone(), outcome.events.clone());
        if let Err(e) = self.backplane.publish(&update).await {
            warn!("Room {} update not published: {}", outcome.state.id, e);
        }
    }

    /// Push an update to this instance's connections in the room.
    pub async fn deliver(&self, update: &RoomUpdate) {
        let recipients: Vec<(PlayerId, ConnectionId)> = {
            let local = self.local.read().await;
            match local.get(&update.state.id) {
                Some(players) => players.iter().map(|(p, c)| (*p, *c)).collect(),
                None => return,
            }
        };

        for (player, connection) in recipients {
            for message in ServerMessage::for_update(&update.state, &update.events, player) {
                if let Err(e) = self.transport.send(connection, message).await {
                    debug!("Skipping {} for room {}: {}", player, update.state.id, e);
                    break;
                }
            }
        }

        if update.state.phase.is_terminal() {
            self.local.write().await.remove(&update.state.id);
        }
    }

    /// Subscribe to the backplane and deliver updates until shutdown.
    ///
    /// The subscription is in place when this returns.
    pub async fn start_fanout(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>, GameError> {
        let mut updates = self.backplane
            .subscribe()
            .await
            .map_err(|e| GameError::StoreUnavailable(e.to_string()))?;
        let sessions = Arc::clone(self);

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = updates.next() => {
                        match update {
                            Some(update) => sessions.deliver(&update).await,
                            None => {
                                warn!("Backplane subscription ended");
                                break;
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Fan-out stopped");
                        break;
                    }
                }
            }
        }))
    }

    /// Rooms with at least one connection on this instance.
    pub async fn local_rooms(&self) -> Vec<RoomId> {
        self.local.read().await.keys().copied().collect()
    }
}
