//! Redis backend.
//!
//! Key layout:
//!
//! | Key                        | Type   | Contents                          |
//! |----------------------------|--------|-----------------------------------|
//! | `okey:room:{id}`           | hash   | `v` version, `s` JSON `RoomState` |
//! | `okey:rooms:active`        | set    | ids of rooms not yet finished     |
//! | `okey:conn:{connection}`   | string | JSON `ConnectionBinding`          |
//! | `okey:player:{player}`     | string | JSON `ConnectionBinding`          |
//!
//! Every key carries a `PEXPIRE`. Compare-and-swap runs as a Lua script so
//! the version check and the write are one atomic step on the server.
//! Ids of rooms that expire without finishing are pruned from the index
//! while it is scanned.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use crate::game::state::{ConnectionId, PlayerId, RoomId};
use crate::store::{CasOutcome, ConnectionBinding, RoomBackend, StoreError, VersionedRecord};

const ACTIVE_ROOMS_KEY: &str = "okey:rooms:active";

/// Returns -1 when the room is missing, 0 on version mismatch, 1 on write.
const CAS_SCRIPT: &str = r"
local v = redis.call('HGET', KEYS[1], 'v')
if not v then return -1 end
if v ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'v', ARGV[2], 's', ARGV[3])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return 1
";

/// Returns 0 if the room already exists, 1 once created and indexed.
const INSERT_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], 'v', ARGV[1], 's', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
redis.call('SADD', KEYS[2], ARGV[4])
return 1
";

fn room_key(id: RoomId) -> String {
    format!("okey:room:{}", id)
}

fn connection_key(id: ConnectionId) -> String {
    format!("okey:conn:{}", id)
}

fn player_key(id: PlayerId) -> String {
    format!("okey:player:{}", id)
}

fn ttl_ms(ttl: Duration) -> u64 {
    ttl.as_millis().clamp(1, u64::MAX as u128) as u64
}

fn unavailable(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Split indexed ids into those whose record still exists and those that
/// expired.
fn split_expired(ids: Vec<RoomId>, present: &[bool]) -> (Vec<RoomId>, Vec<RoomId>) {
    let mut live = Vec::with_capacity(ids.len());
    let mut stale = Vec::new();
    for (i, id) in ids.into_iter().enumerate() {
        if present.get(i).copied().unwrap_or(true) {
            live.push(id);
        } else {
            stale.push(id);
        }
    }
    (live, stale)
}

fn decode_binding(raw: Option<String>) -> Result<Option<ConnectionBinding>, StoreError> {
    raw.map(|s| serde_json::from_str(&s).map_err(|e| StoreError::Codec(e.to_string())))
        .transpose()
}

/// Shared Redis room store.
#[derive(Clone)]
pub struct RedisBackend {
    connection: MultiplexedConnection,
    cas: Script,
    insert: Script,
}

impl RedisBackend {
    /// Connect to `url` (e.g. `redis://localhost:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let connection = client.get_multiplexed_async_connection().await.map_err(unavailable)?;
        info!("Connected to Redis state store");
        Ok(Self {
            connection,
            cas: Script::new(CAS_SCRIPT),
            insert: Script::new(INSERT_SCRIPT),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

#[async_trait]
impl RoomBackend for RedisBackend {
    async fn load(&self, id: RoomId) -> Result<Option<VersionedRecord>, StoreError> {
        let (version, record): (Option<u64>, Option<String>) = redis::cmd("HMGET")
            .arg(room_key(id))
            .arg("v")
            .arg("s")
            .query_async(&mut self.conn())
            .await
            .map_err(unavailable)?;
        match (version, record) {
            (Some(version), Some(record)) => Ok(Some(VersionedRecord { version, record })),
            _ => Ok(None),
        }
    }

    async fn insert(
        &self,
        id: RoomId,
        version: u64,
        record: String,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let created: i64 = self.insert
            .key(room_key(id))
            .key(ACTIVE_ROOMS_KEY)
            .arg(version)
            .arg(record)
            .arg(ttl_ms(ttl))
            .arg(id.to_string())
            .invoke_async(&mut self.conn())
            .await
            .map_err(unavailable)?;
        if created == 0 {
            return Err(StoreError::AlreadyExists(id));
        }
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        id: RoomId,
        expected: u64,
        next: u64,
        record: String,
        ttl: Duration,
    ) -> Result<CasOutcome, StoreError> {
        let result: i64 = self.cas
            .key(room_key(id))
            .arg(expected.to_string())
            .arg(next)
            .arg(record)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut self.conn())
            .await
            .map_err(unavailable)?;
        Ok(match result {
            1 => CasOutcome::Swapped,
            0 => CasOutcome::VersionMismatch,
            _ => CasOutcome::Missing,
        })
    }

    async fn scan_active(&self, cursor: u64, count: usize) -> Result<(u64, Vec<RoomId>), StoreError> {
        let (next, raw): (u64, Vec<String>) = redis::cmd("SSCAN")
            .arg(ACTIVE_ROOMS_KEY)
            .arg(cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn())
            .await
            .map_err(unavailable)?;
        let ids = raw.iter()
            .map(|s| RoomId::from_uuid_str(s)
                .ok_or_else(|| StoreError::Codec(format!("bad room id in index: {}", s))))
            .collect::<Result<Vec<_>, _>>()?;
        if ids.is_empty() {
            return Ok((next, ids));
        }

        // Rooms that expired without finishing leave their id behind
        let mut exists = redis::pipe();
        for id in &ids {
            exists.exists(room_key(*id));
        }
        let present: Vec<bool> = exists.query_async(&mut self.conn()).await.map_err(unavailable)?;
        let (live, stale) = split_expired(ids, &present);
        if !stale.is_empty() {
            debug!("Pruning {} expired rooms from the active index", stale.len());
            let members: Vec<String> = stale.iter().map(RoomId::to_string).collect();
            self.conn()
                .srem::<_, _, ()>(ACTIVE_ROOMS_KEY, members)
                .await
                .map_err(unavailable)?;
        }
        Ok((next, live))
    }

    async fn expire(&self, id: RoomId, ttl: Duration) -> Result<(), StoreError> {
        redis::pipe()
            .atomic()
            .cmd("PEXPIRE").arg(room_key(id)).arg(ttl_ms(ttl))
            .ignore()
            .srem(ACTIVE_ROOMS_KEY, id.to_string())
            .ignore()
            .query_async::<_, ()>(&mut self.conn())
            .await
            .map_err(unavailable)
    }

    async fn put_binding(&self, binding: &ConnectionBinding, ttl: Duration) -> Result<(), StoreError> {
        let json = serde_json::to_string(binding).map_err(|e| StoreError::Codec(e.to_string()))?;
        let ms = ttl_ms(ttl);
        redis::pipe()
            .atomic()
            .cmd("SET").arg(connection_key(binding.connection_id)).arg(&json).arg("PX").arg(ms)
            .ignore()
            .cmd("SET").arg(player_key(binding.player_id)).arg(&json).arg("PX").arg(ms)
            .ignore()
            .query_async::<_, ()>(&mut self.conn())
            .await
            .map_err(unavailable)
    }

    async fn binding_for_connection(
        &self,
        connection: ConnectionId,
    ) -> Result<Option<ConnectionBinding>, StoreError> {
        let raw: Option<String> = self.conn()
            .get(connection_key(connection))
            .await
            .map_err(unavailable)?;
        decode_binding(raw)
    }

    async fn binding_for_player(&self, player: PlayerId) -> Result<Option<ConnectionBinding>, StoreError> {
        let raw: Option<String> = self.conn()
            .get(player_key(player))
            .await
            .map_err(unavailable)?;
        decode_binding(raw)
    }

    async fn remove_connection(&self, connection: ConnectionId) -> Result<(), StoreError> {
        self.conn()
            .del::<_, ()>(connection_key(connection))
            .await
            .map_err(unavailable)
    }
}
