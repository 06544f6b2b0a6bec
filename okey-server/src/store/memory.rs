//! In-process backend.
//!
//! Same semantics as the Redis backend, including versioned
//! compare-and-swap and key expiry, behind one mutex. Suitable for tests
//! and single-instance runs.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::game::state::{ConnectionId, PlayerId, RoomId};
use crate::store::{CasOutcome, ConnectionBinding, RoomBackend, StoreError, VersionedRecord};

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self { value, expires_at: Instant::now() + ttl }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<RoomId, Expiring<VersionedRecord>>,
    active: BTreeSet<RoomId>,
    by_connection: HashMap<ConnectionId, Expiring<ConnectionBinding>>,
    by_player: HashMap<PlayerId, Expiring<ConnectionBinding>>,
}

impl Inner {
    /// Drop the room if it has expired, then return it.
    fn live_room(&mut self, id: RoomId) -> Option<&mut Expiring<VersionedRecord>> {
        let now = Instant::now();
        if self.rooms.get(&id).is_some_and(|e| !e.is_live(now)) {
            self.rooms.remove(&id);
            self.active.remove(&id);
        }
        self.rooms.get_mut(&id)
    }
}

/// Mutex-guarded in-memory room store.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn live<K: std::hash::Hash + Eq, T: Clone>(map: &mut HashMap<K, Expiring<T>>, key: &K) -> Option<T> {
    let now = Instant::now();
    if map.get(key).is_some_and(|e| !e.is_live(now)) {
        map.remove(key);
    }
    map.get(key).map(|e| e.value.clone())
}

#[async_trait]
impl RoomBackend for MemoryBackend {
    async fn load(&self, id: RoomId) -> Result<Option<VersionedRecord>, StoreError> {
        Ok(self.lock().live_room(id).map(|e| e.value.clone()))
    }

    async fn insert(
        &self,
        id: RoomId,
        version: u64,
        record: String,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.live_room(id).is_some() {
            return Err(StoreError::AlreadyExists(id));
        }
        inner.rooms.insert(id, Expiring::new(VersionedRecord { version, record }, ttl));
        inner.active.insert(id);
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
        let mut inner = self.lock();
        let Some(entry) = inner.live_room(id) else {
            return Ok(CasOutcome::Missing);
        };
        if entry.value.version != expected {
            return Ok(CasOutcome::VersionMismatch);
        }
        *entry = Expiring::new(VersionedRecord { version: next, record }, ttl);
        Ok(CasOutcome::Swapped)
    }

    async fn scan_active(&self, cursor: u64, count: usize) -> Result<(u64, Vec<RoomId>), StoreError> {
        let mut inner = self.lock();
        let now = Instant::now();
        let expired: Vec<RoomId> = inner.active.iter()
            .filter(|id| inner.rooms.get(*id).map_or(true, |e| !e.is_live(now)))
            .copied()
            .collect();
        for id in expired {
            inner.active.remove(&id);
            inner.rooms.remove(&id);
        }

        let start = cursor as usize;
        let page: Vec<RoomId> = inner.active.iter().skip(start).take(count).copied().collect();
        let end = start + page.len();
        let next = if end >= inner.active.len() { 0 } else { end as u64 };
        Ok((next, page))
    }

    async fn expire(&self, id: RoomId, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.active.remove(&id);
        if let Some(entry) = inner.live_room(id) {
            entry.expires_at = Instant::now() + ttl;
        }
        Ok(())
    }

    async fn put_binding(&self, binding: &ConnectionBinding, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.by_connection.insert(binding.connection_id, Expiring::new(binding.clone(), ttl));
        inner.by_player.insert(binding.player_id, Expiring::new(binding.clone(), ttl));
        Ok(())
    }

    async fn binding_for_connection(
        &self,
        connection: ConnectionId,
    ) -> Result<Option<ConnectionBinding>, StoreError> {
        Ok(live(&mut self.lock().by_connection, &connection))
    }

    async fn binding_for_player(&self, player: PlayerId) -> Result<Option<ConnectionBinding>, StoreError> {
        Ok(live(&mut self.lock().by_player, &player))
    }

    async fn remove_connection(&self, connection: ConnectionId) -> Result<(), StoreError> {
        self.lock().by_connection.remove(&connection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_cas_checks_version() {
        let backend = MemoryBackend::new();
        let id = RoomId::random();
        backend.insert(id, 1, "a".into(), Duration::from_secs(60)).await.unwrap();

        assert_eq!(
            backend.compare_and_swap(id, 2, 3, "x".into(), Duration::from_secs(60)).await.unwrap(),
            CasOutcome::VersionMismatch
        );
        assert_eq!(
            backend.compare_and_swap(id, 1, 2, "b".into(), Duration::from_secs(60)).await.unwrap(),
            CasOutcome::Swapped
        );
        assert_eq!(
            backend.load(id).await.unwrap(),
            Some(VersionedRecord { version: 2, record: "b".into() })
        );
        assert_eq!(
            backend.compare_and_swap(RoomId::random(), 1, 2, "c".into(), Duration::from_secs(60)).await.unwrap(),
            CasOutcome::Missing
        );
    }

    #[tokio::test]
    async fn test_records_expire() {
        let backend = MemoryBackend::new();
        let id = RoomId::random();
        backend.insert(id, 1, "a".into(), Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(backend.load(id).await.unwrap(), None);
        assert_eq!(backend.scan_active(0, 10).await.unwrap(), (0, Vec::new()));

        // Expired ids can be reused
        backend.insert(id, 1, "b".into(), Duration::from_secs(60)).await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_cursor() {
        let backend = MemoryBackend::new();
        for _ in 0..5 {
            backend.insert(RoomId::random(), 1, "r".into(), Duration::from_secs(60)).await.unwrap();
        }
        let (cursor, first) = backend.scan_active(0, 3).await.unwrap();
        assert_eq!((cursor, first.len()), (3, 3));
        let (cursor, rest) = backend.scan_active(cursor, 3).await.unwrap();
        assert_eq!((cursor, rest.len()), (0, 2));
    }

    #[tokio::test]
    async fn test_binding_expiry() {
        let backend = MemoryBackend::new();
        let binding = ConnectionBinding {
            player_id: PlayerId::random(),
            room_id: RoomId::random(),
            connection_id: ConnectionId::random(),
            bound_at: Utc::now(),
        };
        backend.put_binding(&binding, Duration::from_millis(10)).await.unwrap();
        assert!(backend.binding_for_player(binding.player_id).await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(backend.binding_for_connection(binding.connection_id).await.unwrap().is_none());
        assert!(backend.binding_for_player(binding.player_id).await.unwrap().is_none());
    }
}
