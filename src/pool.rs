//! Sharing of HTTP/2 connections between requests to the same destination.

use crate::h2::Connection;
use crate::types::{Destination, H2ErrorCode, PoolConfig, ProtocolError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Produces ready connections: transport established and HTTP/2 handshake done.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, destination: &Destination) -> Result<Connection, ProtocolError>;
}

struct PooledConnection {
    connection: Connection,
    /// Acquisitions not yet released.
    in_use: usize,
    idle_since: Option<Instant>,
}

impl PooledConnection {
    fn has_room(&self) -> bool {
        self.in_use < self.connection.max_concurrent_streams()
    }
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<Destination, Vec<PooledConnection>>,
    /// One dial at a time per destination, so concurrent acquires share the
    /// connection the first of them opens.
    dialing: HashMap<Destination, Arc<AsyncMutex<()>>>,
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a connection to `destination` with room for one more stream,
    /// reusing a pooled one when possible and dialing otherwise. Every
    /// successful acquire must be paired with [`ConnectionPool::release`].
    pub async fn acquire(&self, destination: &Destination) -> Result<Connection, ProtocolError> {
        if let Some(connection) = self.try_reuse(destination) {
            return Ok(connection);
        }

        let dial_lock = self
            .lock()
            .dialing
            .entry(destination.clone())
            .or_default()
            .clone();
        let result = self.dial(destination, &dial_lock).await;
        self.forget_dial_lock(destination, dial_lock);
        result
    }

    async fn dial(
        &self,
        destination: &Destination,
        dial_lock: &AsyncMutex<()>,
    ) -> Result<Connection, ProtocolError> {
        let _dialing = dial_lock.lock().await;

        if let Some(connection) = self.try_reuse(destination) {
            return Ok(connection);
        }

        if let Some(max) = self.config.max_connections_per_destination {
            let open = self.lock().entries.get(destination).map_or(0, Vec::len);
            if open >= max {
                return Err(ProtocolError::PoolExhausted {
                    destination: destination.to_string(),
                    reason: format!("all {} connections are saturated", open),
                });
            }
        }

        debug!(%destination, "Dialing new connection");
        let connection = self
            .connector
            .connect(destination)
            .await
            .map_err(|err| ProtocolError::PoolExhausted {
                destination: destination.to_string(),
                reason: err.to_string(),
            })?;

        self.lock()
            .entries
            .entry(destination.clone())
            .or_default()
            .push(PooledConnection {
                connection: connection.clone(),
                in_use: 1,
                idle_since: None,
            });
        Ok(connection)
    }

    /// Drops the dial lock of `destination` once no other acquire holds it.
    fn forget_dial_lock(&self, destination: &Destination, dial_lock: Arc<AsyncMutex<()>>) {
        let mut state = self.lock();
        let Some(current) = state.dialing.get(destination) else {
            return;
        };
        // One reference in the map, one here.
        if Arc::ptr_eq(current, &dial_lock) && Arc::strong_count(&dial_lock) == 2 {
            state.dialing.remove(destination);
        }
    }

    fn try_reuse(&self, destination: &Destination) -> Option<Connection> {
        let mut state = self.lock();
        let entries = state.entries.get_mut(destination)?;
        entries.retain(|entry| {
            let usable = entry.connection.is_usable();
            if !usable {
                trace!(%destination, connection = entry.connection.id(), "Dropping unusable connection");
            }
            usable
        });

        let entry = entries.iter_mut().find(|entry| entry.has_room())?;
        entry.in_use += 1;
        entry.idle_since = None;
        trace!(%destination, connection = entry.connection.id(), in_use = entry.in_use, "Reusing connection");
        Some(entry.connection.clone())
    }

    /// Hands back one acquisition of `connection`. Connections that can no
    /// longer carry streams leave the pool; idle ones beyond
    /// `max_idle_connections` are closed, least recently used first.
    pub async fn release(&self, connection: &Connection) {
        let evicted = {
            let mut state = self.lock();
            let now = Instant::now();
            let mut evicted = Vec::new();

            for entries in state.entries.values_mut() {
                let Some(index) = entries
                    .iter()
                    .position(|entry| entry.connection.id() == connection.id())
                else {
                    continue;
                };
                let entry = &mut entries[index];
                entry.in_use = entry.in_use.saturating_sub(1);
                if !entry.connection.is_usable() {
                    if entry.in_use == 0 {
                        evicted.push(entries.remove(index).connection);
                    }
                } else if entry.in_use == 0 {
                    entry.idle_since = Some(now);
                }
                break;
            }

            evicted.extend(Self::trim_idle(&mut state, self.config.max_idle_connections));
            state.entries.retain(|_, entries| !entries.is_empty());
            evicted
        };

        close_all(evicted).await;
    }

    fn trim_idle(state: &mut PoolState, max_idle: usize) -> Vec<Connection> {
        let mut idle: Vec<(Instant, u64)> = state
            .entries
            .values()
            .flatten()
            .filter_map(|entry| entry.idle_since.map(|since| (since, entry.connection.id())))
            .collect();
        if idle.len() <= max_idle {
            return Vec::new();
        }
        idle.sort();
        let excess: Vec<u64> = idle[..idle.len() - max_idle].iter().map(|(_, id)| *id).collect();
        Self::remove_where(state, |entry| excess.contains(&entry.connection.id()))
    }

    fn remove_where<F>(state: &mut PoolState, predicate: F) -> Vec<Connection>
    where
        F: Fn(&PooledConnection) -> bool,
    {
        let mut removed = Vec::new();
        for entries in state.entries.values_mut() {
            let mut index = 0;
            while index < entries.len() {
                if predicate(&entries[index]) {
                    removed.push(entries.remove(index).connection);
                } else {
                    index += 1;
                }
            }
        }
        state.entries.retain(|_, entries| !entries.is_empty());
        removed
    }

    /// Closes connections idle for longer than `keep_alive` as of `now`, and
    /// any that are idle and no longer usable, then trims the idle set down
    /// to `max_idle_connections`. Returns how many connections left the pool.
    pub async fn evict_idle(&self, now: Instant) -> usize {
        let keep_alive = self.config.keep_alive;
        let evicted = {
            let mut state = self.lock();
            let mut evicted = Self::remove_where(&mut state, |entry| match entry.idle_since {
                Some(since) => {
                    now.saturating_duration_since(since) >= keep_alive
                        || !entry.connection.is_usable()
                }
                None => false,
            });
            evicted.extend(Self::trim_idle(&mut state, self.config.max_idle_connections));
            evicted
        };
        let count = evicted.len();
        if count > 0 {
            debug!(count, "Evicting idle connections");
        }
        close_all(evicted).await;
        count
    }

    /// Closes every idle connection. Connections still carrying streams stay
    /// pooled until released.
    pub async fn evict_all(&self) {
        let evicted = {
            let mut state = self.lock();
            Self::remove_where(&mut state, |entry| entry.in_use == 0)
        };
        debug!(count = evicted.len(), "Closing idle pooled connections");
        close_all(evicted).await;
    }

    /// Runs [`ConnectionPool::evict_idle`] every `interval` until the pool is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.evict_idle(Instant::now()).await;
            }
        })
    }

    pub fn connection_count(&self) -> usize {
        self.lock().entries.values().map(Vec::len).sum()
    }

    pub fn idle_connection_count(&self) -> usize {
        self.lock()
            .entries
            .values()
            .flatten()
            .filter(|entry| entry.idle_since.is_some())
            .count()
    }
}

async fn close_all(connections: Vec<Connection>) {
    for connection in connections {
        connection.close(H2ErrorCode::NoError).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self, destination: &Destination) -> Result<Connection, ProtocolError> {
            Err(ProtocolError::ConnectionFailed(format!(
                "{} refused the connection",
                destination
            )))
        }
    }

    #[tokio::test]
    async fn connect_failure_surfaces_as_pool_exhausted() {
        let pool = ConnectionPool::new(Arc::new(Unreachable), PoolConfig::default());
        let destination = Destination::cleartext("localhost", 1);

        let err = pool.acquire(&destination).await.unwrap_err();
        match err {
            ProtocolError::PoolExhausted { destination, reason } => {
                assert_eq!(destination, "http://localhost:1");
                assert!(reason.contains("refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(pool.connection_count(), 0);
        assert!(pool.lock().dialing.is_empty());
    }

    #[tokio::test]
    async fn dial_locks_are_dropped_after_each_dial() {
        let pool = Arc::new(ConnectionPool::new(
            Arc::new(Unreachable),
            PoolConfig::default(),
        ));
        let destinations: Vec<Destination> = (1..=3)
            .map(|port| Destination::cleartext("localhost", port))
            .collect();

        let mut tasks = Vec::new();
        for destination in destinations.iter().cycle().take(12).cloned() {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                pool.acquire(&destination).await.is_err()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert!(pool.lock().dialing.is_empty());
    }

    #[tokio::test]
    async fn empty_pool_evicts_nothing() {
        let pool = ConnectionPool::new(Arc::new(Unreachable), PoolConfig::default());
        assert_eq!(pool.evict_idle(Instant::now()).await, 0);
        pool.evict_all().await;
        assert_eq!(pool.idle_connection_count(), 0);
    }
}
