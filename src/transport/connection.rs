//! Connection bookkeeping shared by the streaming transports.

use std::{
    collections::HashMap,
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::{
    sync::{watch, RwLock},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("connection limit of {limit} reached")]
    AtCapacity { limit: usize },
}

/// A live client connection plus the handle used to write to it.
#[derive(Debug, Clone)]
pub struct Connection<S> {
    pub connection_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_ping: DateTime<Utc>,
    active: bool,
    sequence: u64,
    sink: S,
}

impl<S> Connection<S> {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    // once cleared, never set again
    fn deactivate(&mut self) {
        self.active = false;
    }

    fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        (now - self.last_ping)
            .to_std()
            .map(|age| age > timeout)
            .unwrap_or(false)
    }
}

/// Connection table owned by a single transport.
pub struct ConnectionTable<S> {
    connections: RwLock<HashMap<String, Connection<S>>>,
    max_connections: usize,
    sequence: AtomicU64,
}

impl<S: Clone> ConnectionTable<S> {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_connections,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Admits a connection under `connection_id`, replacing any entry with the same id.
    ///
    /// Returns the insertion sequence, used by [`Self::remove_instance`] so that a
    /// replaced connection cannot evict its successor.
    pub async fn try_insert(&self, connection_id: String, sink: S) -> Result<u64, AdmissionError> {
        let mut connections = self.connections.write().await;

        let active = connections
            .iter()
            .filter(|(id, connection)| connection.active && **id != connection_id)
            .count();
        if active >= self.max_connections {
            return Err(AdmissionError::AtCapacity {
                limit: self.max_connections,
            });
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Utc::now();
        let previous = connections.insert(
            connection_id.clone(),
            Connection {
                connection_id: connection_id.clone(),
                connected_at: now,
                last_ping: now,
                active: true,
                sequence,
                sink,
            },
        );

        if previous.is_some() {
            debug!(connection_id = %connection_id, "replaced existing connection");
        }
        Ok(sequence)
    }

    /// Removes `connection_id` only if it is still the instance inserted with `sequence`.
    pub async fn remove_instance(&self, connection_id: &str, sequence: u64) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(connection_id) {
            Some(connection) if connection.sequence == sequence => {
                connections.remove(connection_id);
                true
            }
            _ => false,
        }
    }

    pub async fn contains(&self, connection_id: &str) -> bool {
        self.connections.read().await.contains_key(connection_id)
    }

    pub async fn get(&self, connection_id: &str) -> Option<Connection<S>> {
        self.connections.read().await.get(connection_id).cloned()
    }

    pub async fn active_sink(&self, connection_id: &str) -> Option<S> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .filter(|connection| connection.active)
            .map(|connection| connection.sink.clone())
    }

    /// The active connection opened last.
    pub async fn most_recent_active(&self) -> Option<(String, S)> {
        self.connections
            .read()
            .await
            .values()
            .filter(|connection| connection.active)
            .max_by_key(|connection| connection.sequence)
            .map(|connection| (connection.connection_id.clone(), connection.sink.clone()))
    }

    pub async fn active_sinks(&self) -> Vec<(String, S)> {
        self.connections
            .read()
            .await
            .values()
            .filter(|connection| connection.active)
            .map(|connection| (connection.connection_id.clone(), connection.sink.clone()))
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|connection| connection.active)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn mark_inactive(&self, connection_id: &str) -> bool {
        match self.connections.write().await.get_mut(connection_id) {
            Some(connection) => {
                connection.deactivate();
                true
            }
            None => false,
        }
    }

    /// Records a successful liveness probe.
    pub async fn touch(&self, connection_id: &str) {
        if let Some(connection) = self.connections.write().await.get_mut(connection_id) {
            if connection.active {
                connection.last_ping = Utc::now();
            }
        }
    }

    /// Removes inactive connections and those not pinged within `timeout`.
    pub async fn evict_stale(&self, timeout: Duration) -> Vec<Connection<S>> {
        let now = Utc::now();
        let mut connections = self.connections.write().await;

        let stale = connections
            .iter()
            .filter(|(_, connection)| !connection.active || connection.is_stale(now, timeout))
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();

        stale
            .into_iter()
            .filter_map(|id| connections.remove(&id))
            .map(|mut connection| {
                debug!(
                    connection_id = %connection.connection_id,
                    connected_secs = (now - connection.connected_at).num_seconds(),
                    "evicting connection"
                );
                connection.deactivate();
                connection
            })
            .collect()
    }

    /// Empties the table, returning every connection marked closed.
    pub async fn close_all(&self) -> Vec<Connection<S>> {
        self.connections
            .write()
            .await
            .drain()
            .map(|(_, mut connection)| {
                connection.deactivate();
                connection
            })
            .collect()
    }
}

/// Handle to a periodic liveness task.
pub struct PingTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PingTask {
    /// Signals the task to stop and waits for it to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.handle.await {
            if !err.is_cancelled() {
                warn!(error = %err, "ping task ended abnormally");
            }
        }
    }
}

/// Runs `tick` every `period`, starting one period from now.
pub fn spawn_ping_task<F, Fut>(period: Duration, mut tick: F) -> PingTask
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (stop, mut stop_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });

    PingTask { stop, handle }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test]
    async fn admission_counts_only_active_connections() {
        let table = ConnectionTable::new(1);

        table
            .try_insert("a".to_string(), ())
            .await
            .expect("first connection should be admitted");
        assert_eq!(
            table.try_insert("b".to_string(), ()).await,
            Err(AdmissionError::AtCapacity { limit: 1 })
        );

        assert!(table.mark_inactive("a").await);
        table
            .try_insert("b".to_string(), ())
            .await
            .expect("inactive connections should not count");
        assert_eq!(table.active_count().await, 1);
        assert_eq!(table.len().await, 2);
    }

    #[tokio::test]
    async fn reusing_an_id_replaces_the_entry() {
        let table = ConnectionTable::new(1);

        let first = table.try_insert("s".to_string(), 1).await.expect("admit");
        let second = table.try_insert("s".to_string(), 2).await.expect("replace");

        assert_eq!(table.len().await, 1);
        assert_eq!(table.active_sink("s").await, Some(2));
        assert!(!table.remove_instance("s", first).await);
        assert!(table.remove_instance("s", second).await);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn most_recent_active_prefers_latest_insert() {
        let table = ConnectionTable::new(10);
        table.try_insert("old".to_string(), "old").await.expect("admit");
        table.try_insert("new".to_string(), "new").await.expect("admit");

        assert_eq!(
            table.most_recent_active().await,
            Some(("new".to_string(), "new"))
        );

        table.mark_inactive("new").await;
        assert_eq!(
            table.most_recent_active().await,
            Some(("old".to_string(), "old"))
        );
    }

    #[tokio::test]
    async fn inactive_connections_stay_inactive() {
        let table = ConnectionTable::new(10);
        table.try_insert("a".to_string(), ()).await.expect("admit");

        table.mark_inactive("a").await;
        table.touch("a").await;

        let connection = table.get("a").await.expect("entry should remain until evicted");
        assert!(!connection.is_active());
        assert_eq!(table.active_sink("a").await, None);
    }

    #[tokio::test]
    async fn touch_refreshes_last_ping_only() {
        let table = ConnectionTable::new(10);
        table.try_insert("a".to_string(), ()).await.expect("admit");
        let opened = table.get("a").await.expect("entry");

        tokio::time::sleep(Duration::from_millis(10)).await;
        table.touch("a").await;

        let touched = table.get("a").await.expect("entry");
        assert_eq!(touched.connected_at, opened.connected_at);
        assert!(touched.last_ping > opened.last_ping);
    }

    #[tokio::test]
    async fn evict_stale_removes_silent_and_inactive_connections() {
        let table = ConnectionTable::new(10);
        table.try_insert("silent".to_string(), ()).await.expect("admit");
        table.try_insert("closed".to_string(), ()).await.expect("admit");
        table.mark_inactive("closed").await;

        assert_eq!(table.evict_stale(Duration::from_secs(60)).await.len(), 1);
        assert!(table.contains("silent").await);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let evicted = table.evict_stale(Duration::from_millis(5)).await;
        assert_eq!(evicted.len(), 1);
        assert!(!evicted[0].is_active());
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn close_all_drains_the_table() {
        let table = ConnectionTable::new(10);
        table.try_insert("a".to_string(), ()).await.expect("admit");
        table.try_insert("b".to_string(), ()).await.expect("admit");

        let closed = table.close_all().await;
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|connection| !connection.is_active()));
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn ping_task_ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let task = spawn_ping_task(Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        task.shutdown().await;
        let observed = ticks.load(Ordering::SeqCst);
        assert!(observed >= 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), observed);
    }
}
