//! Session State Store
//!
//! Canonical `RoomState` for every room, shared by all server instances.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      STATE STORE                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  StateStore      - typed API, CAS retry loop, deadlines     │
//! │  RoomBackend     - versioned record primitives              │
//! │  ├── memory.rs   - in-process backend (tests, one node)     │
//! │  └── redis.rs    - shared Redis backend                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rooms are only ever written through a compare-and-swap on the record
//! version. Losing a race reloads and re-applies the mutation; nothing is
//! silently overwritten.

pub mod memory;
pub mod redis;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Serialize, Deserialize};
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::GameError;
use crate::game::state::{ConnectionId, PlayerId, RoomId, RoomState};

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// Room ids fetched per index page.
const SCAN_PAGE: usize = 64;

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Backend unreachable or too slow.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Record version moved under a compare-and-swap.
    #[error("version conflict on room {0}")]
    Conflict(RoomId),

    /// A room with this id already exists.
    #[error("room {0} already exists")]
    AlreadyExists(RoomId),

    /// Stored record could not be encoded or decoded.
    #[error("record codec error: {0}")]
    Codec(String),
}

/// Outcome of a compare-and-swap write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Written.
    Swapped,
    /// Version did not match; nothing written.
    VersionMismatch,
    /// No record under this id.
    Missing,
}

/// A room record as stored: version plus encoded state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    /// Version used for compare-and-swap
    pub version: u64,
    /// JSON-encoded `RoomState`
    pub record: String,
}

/// Player ↔ room ↔ connection mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionBinding {
    /// Bound player
    pub player_id: PlayerId,
    /// Room the player sits in
    pub room_id: RoomId,
    /// Current connection
    pub connection_id: ConnectionId,
    /// When this connection was bound
    pub bound_at: DateTime<Utc>,
}

/// Storage primitives a backend must provide.
///
/// Every method is a single round trip; retries and deadlines live in
/// [`StateStore`].
#[async_trait]
pub trait RoomBackend: Send + Sync {
    /// Load a room record.
    async fn load(&self, id: RoomId) -> Result<Option<VersionedRecord>, StoreError>;

    /// Insert a new record at `version` and add it to the active index.
    async fn insert(
        &self,
        id: RoomId,
        version: u64,
        record: String,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Replace the record if its version is still `expected`.
    async fn compare_and_swap(
        &self,
        id: RoomId,
        expected: u64,
        next: u64,
        record: String,
        ttl: Duration,
    ) -> Result<CasOutcome, StoreError>;

    /// One page of the active-room index. A returned cursor of 0 ends the scan.
    async fn scan_active(&self, cursor: u64, count: usize) -> Result<(u64, Vec<RoomId>), StoreError>;

    /// Set the record's expiry and drop it from the active index.
    async fn expire(&self, id: RoomId, ttl: Duration) -> Result<(), StoreError>;

    /// Write both binding keys (by connection and by player).
    async fn put_binding(&self, binding: &ConnectionBinding, ttl: Duration) -> Result<(), StoreError>;

    /// Binding keyed by connection.
    async fn binding_for_connection(
        &self,
        connection: ConnectionId,
    ) -> Result<Option<ConnectionBinding>, StoreError>;

    /// Binding keyed by player.
    async fn binding_for_player(&self, player: PlayerId) -> Result<Option<ConnectionBinding>, StoreError>;

    /// Delete the connection key only; the player key stays.
    async fn remove_connection(&self, connection: ConnectionId) -> Result<(), StoreError>;
}

/// Typed, deadline-bounded access to room state.
pub struct StateStore {
    backend: Arc<dyn RoomBackend>,
    config: StoreConfig,
}

impl StateStore {
    /// Wrap a backend.
    pub fn new(backend: Arc<dyn RoomBackend>, config: StoreConfig) -> Self {
        Self { backend, config }
    }

    /// Store settings.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.config.operation_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "store call exceeded {:?}",
                self.config.operation_timeout
            ))),
        }
    }

    fn ttl_for(&self, state: &RoomState) -> Duration {
        if state.phase.is_terminal() {
            self.config.finished_room_ttl
        } else {
            self.config.active_room_ttl
        }
    }

    /// Read a room. `Ok(None)` means the room does not exist.
    pub async fn get(&self, id: RoomId) -> Result<Option<RoomState>, StoreError> {
        match self.bounded(self.backend.load(id)).await? {
            Some(stored) => decode(&stored).map(Some),
            None => Ok(None),
        }
    }

    /// Persist a new room at version 1.
    pub async fn create(&self, mut state: RoomState) -> Result<RoomState, StoreError> {
        state.version = 1;
        let record = encode(&state)?;
        let ttl = self.ttl_for(&state);
        self.bounded(self.backend.insert(state.id, state.version, record, ttl)).await?;
        debug!("Created room {}", state.id);
        Ok(state)
    }

    /// Atomic read-modify-write.
    ///
    /// The mutator runs on a freshly loaded copy and may run more than once
    /// if another writer gets in first. A mutator error aborts without
    /// writing. Rooms that land in a terminal phase are dropped from the
    /// active index and given the retention TTL.
    pub async fn update<T, F>(&self, id: RoomId, mut mutator: F) -> Result<(RoomState, T), GameError>
    where
        F: FnMut(&mut RoomState) -> Result<T, GameError> + Send,
        T: Send,
    {
        let (state, value) = self.update_with(id, |s| mutator(s).map(Some)).await?;
        let value = value.ok_or_else(|| GameError::Internal("mutator result lost".into()))?;
        Ok((state, value))
    }

    /// Like [`StateStore::update`], but a mutator returning `Ok(None)` leaves
    /// the record untouched and the loaded state is returned as is.
    pub async fn update_with<T, F>(
        &self,
        id: RoomId,
        mut mutator: F,
    ) -> Result<(RoomState, Option<T>), GameError>
    where
        F: FnMut(&mut RoomState) -> Result<Option<T>, GameError> + Send,
        T: Send,
    {
        let attempts = self.config.max_update_retries.max(1);
        for attempt in 1..=attempts {
            let stored = self.bounded(self.backend.load(id)).await?
                .ok_or_else(|| GameError::room_not_found(id))?;
            let loaded = decode(&stored)?;
            let mut state = loaded.clone();

            let Some(value) = mutator(&mut state)? else {
                return Ok((loaded, None));
            };

            let next = stored.version + 1;
            state.version = next;
            let record = encode(&state)?;
            let ttl = self.ttl_for(&state);
            match self.bounded(self.backend.compare_and_swap(id, stored.version, next, record, ttl)).await? {
                CasOutcome::Swapped => {
                    if state.phase.is_terminal() && !loaded.phase.is_terminal() {
                        // The write is committed; a missed expiry is retried by the turn sweep
                        if let Err(e) = self.bounded(self.backend.expire(id, self.config.finished_room_ttl)).await {
                            warn!("Room {} finished but not retired from the active index: {}", id, e);
                        }
                    }
                    return Ok((state, Some(value)));
                }
                CasOutcome::VersionMismatch => {
                    debug!("Room {} CAS lost at v{} (attempt {}/{})", id, stored.version, attempt, attempts);
                    tokio::task::yield_now().await;
                }
                CasOutcome::Missing => return Err(GameError::room_not_found(id)),
            }
        }
        warn!("Room {} update gave up after {} conflicts", id, attempts);
        Err(GameError::ConcurrencyConflict { room_id: id, attempts })
    }

    /// Ids of rooms that have not finished, fetched lazily page by page.
    ///
    /// An id may be yielded twice if the index changes during the scan.
    pub fn list_active_room_ids(&self) -> BoxStream<'_, Result<RoomId, StoreError>> {
        struct Page {
            cursor: u64,
            buffer: VecDeque<RoomId>,
            done: bool,
        }

        let start = Page { cursor: 0, buffer: VecDeque::new(), done: false };
        stream::unfold(Some(start), move |page| async move {
            let mut page = page?;
            loop {
                if let Some(id) = page.buffer.pop_front() {
                    return Some((Ok(id), Some(page)));
                }
                if page.done {
                    return None;
                }
                match self.bounded(self.backend.scan_active(page.cursor, SCAN_PAGE)).await {
                    Ok((next, ids)) => {
                        page.buffer.extend(ids);
                        page.cursor = next;
                        page.done = next == 0;
                    }
                    Err(e) => return Some((Err(e), None)),
                }
            }
        })
        .boxed()
    }

    /// Give a room a TTL and remove it from the active index.
    pub async fn expire(&self, id: RoomId, ttl: Duration) -> Result<(), StoreError> {
        self.bounded(self.backend.expire(id, ttl)).await
    }

    /// Record a binding, superseding the player's previous connection.
    pub async fn put_binding(&self, binding: ConnectionBinding) -> Result<(), StoreError> {
        if let Some(old) = self.binding_for_player(binding.player_id).await? {
            if old.connection_id != binding.connection_id {
                self.bounded(self.backend.remove_connection(old.connection_id)).await?;
            }
        }
        self.bounded(self.backend.put_binding(&binding, self.config.binding_ttl)).await
    }

    /// Look up the binding for a connection.
    pub async fn binding_for_connection(
        &self,
        connection: ConnectionId,
    ) -> Result<Option<ConnectionBinding>, StoreError> {
        self.bounded(self.backend.binding_for_connection(connection)).await
    }

    /// Look up the binding for a player.
    pub async fn binding_for_player(&self, player: PlayerId) -> Result<Option<ConnectionBinding>, StoreError> {
        self.bounded(self.backend.binding_for_player(player)).await
    }

    /// Drop the connection key; the player → room mapping is kept.
    pub async fn remove_binding(&self, connection: ConnectionId) -> Result<(), StoreError> {
        self.bounded(self.backend.remove_connection(connection)).await
    }
}

fn encode(state: &RoomState) -> Result<String, StoreError> {
    serde_json::to_string(state).map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode(stored: &VersionedRecord) -> Result<RoomState, StoreError> {
    let mut state: RoomState =
        serde_json::from_str(&stored.record).map_err(|e| StoreError::Codec(e.to_string()))?;
    state.version = stored.version;
    Ok(state)
}
