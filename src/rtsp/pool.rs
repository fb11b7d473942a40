//! Pool of upstream RTSP connections, one per source URL
//!
//! Every viewer of the same source shares one [`SourceConnection`]. The
//! connection runs a single reader task that fans samples out over a
//! broadcast channel, so sharing never splits the frame sequence between
//! viewers.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use super::source::{source_key, MediaSample, MediaSource, SourceDialer};
use crate::discovery::CameraCredentials;
use crate::error::AppError;
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Samples buffered per subscriber before it starts lagging
const SAMPLE_BUFFER: usize = 64;

/// How long `close` waits for the reader task to tear the session down
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// A shared upstream media connection
pub struct SourceConnection {
    url: String,
    credentials: CameraCredentials,
    healthy: AtomicBool,
    last_access: Mutex<Instant>,
    created_at: Instant,
    samples: broadcast::Sender<MediaSample>,
    cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SourceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConnection")
            .field("url", &self.url)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

impl SourceConnection {
    /// Wrap a playing source and start its reader task
    fn start(
        url: String,
        credentials: CameraCredentials,
        source: Box<dyn MediaSource>,
        throttler: Arc<LogThrottler>,
    ) -> Arc<Self> {
        let (samples, _) = broadcast::channel(SAMPLE_BUFFER);
        let now = Instant::now();
        let conn = Arc::new(Self {
            url,
            credentials,
            healthy: AtomicBool::new(true),
            last_access: Mutex::new(now),
            created_at: now,
            samples,
            cancel: CancellationToken::new(),
            reader: Mutex::new(None),
        });

        let handle = tokio::spawn(read_loop(conn.clone(), source, throttler));
        *conn.reader.lock() = Some(handle);
        conn
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn credentials(&self) -> &CameraCredentials {
        &self.credentials
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }

    /// Refresh `last_access`
    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn subscriber_count(&self) -> usize {
        self.samples.receiver_count()
    }

    /// Receive samples from now on
    pub fn subscribe(&self) -> crate::error::Result<broadcast::Receiver<MediaSample>> {
        if !self.is_healthy() {
            return Err(AppError::rtsp(self.url.as_str(), "connection is not healthy"));
        }
        Ok(self.samples.subscribe())
    }

    /// Resolves once the connection has failed or been closed
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Stop the reader and tear down the upstream session. Idempotent.
    pub async fn close(&self) {
        self.mark_unhealthy();
        self.cancel.cancel();
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            if timeout(CLOSE_TIMEOUT, handle).await.is_err() {
                warn!("Timed out closing RTSP session {}", self.url);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, by: Duration) {
        let mut last = self.last_access.lock();
        if let Some(earlier) = last.checked_sub(by) {
            *last = earlier;
        }
    }
}

async fn read_loop(
    conn: Arc<SourceConnection>,
    mut source: Box<dyn MediaSource>,
    throttler: Arc<LogThrottler>,
) {
    loop {
        tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => break,
            result = source.read_sample() => match result {
                Ok(sample) => {
                    // No subscribers is fine, the sample is just dropped
                    let _ = conn.samples.send(sample);
                }
                Err(e) => {
                    conn.mark_unhealthy();
                    warn_throttled!(throttler, &conn.url, "Source read failed, marking unhealthy: {}", e);
                    break;
                }
            }
        }
    }
    source.close().await;
    conn.cancel.cancel();
    debug!("Reader stopped for {}", conn.url);
}

/// Acquisition failure
///
/// When an unhealthy entry existed and its replacement could not be
/// dialed, the stale entry is handed back so the caller can decide what
/// to do with it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct AcquireError {
    pub stale: Option<Arc<SourceConnection>>,
    #[source]
    pub error: AppError,
}

impl From<AcquireError> for AppError {
    fn from(e: AcquireError) -> Self {
        e.error
    }
}

/// Pool status entry
#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub url: String,
    pub healthy: bool,
    pub idle_secs: u64,
    pub age_secs: u64,
    pub subscribers: usize,
}

/// Pool of upstream connections keyed by URL (userinfo stripped)
pub struct ConnectionPool {
    dialer: Arc<dyn SourceDialer>,
    dial_timeout: Duration,
    connections: Mutex<HashMap<String, Arc<SourceConnection>>>,
    /// Serializes dials per URL; never held together with `connections`.
    /// Entries only live while a dial for the URL is in flight.
    dial_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Set by `close_all`; checked under the `connections` lock
    closing: AtomicBool,
    throttler: Arc<LogThrottler>,
}

impl ConnectionPool {
    pub fn new(dialer: Arc<dyn SourceDialer>, dial_timeout: Duration) -> Self {
        Self {
            dialer,
            dial_timeout,
            connections: Mutex::new(HashMap::new()),
            dial_locks: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
            throttler: Arc::new(LogThrottler::with_secs(30)),
        }
    }

    /// Get the shared connection for `url`, dialing if needed
    ///
    /// A healthy entry is returned as is. An unhealthy one is replaced by a
    /// fresh dial; if that dial fails the stale entry comes back inside the
    /// error. The dial itself runs outside the map lock.
    pub async fn acquire(
        &self,
        url: &str,
        creds: &CameraCredentials,
    ) -> std::result::Result<Arc<SourceConnection>, AcquireError> {
        let key = source_key(url);
        if let Some(conn) = self.healthy_entry(&key) {
            return Ok(conn);
        }

        let dial_lock = self.dial_lock(&key);
        let acquired = {
            let _dialing = dial_lock.lock().await;
            self.dial_and_insert(url, &key, creds).await
        };
        drop(dial_lock);
        self.prune_dial_lock(&key);
        acquired
    }

    /// Slow path of `acquire`, run under the per-URL dial lock
    async fn dial_and_insert(
        &self,
        url: &str,
        key: &str,
        creds: &CameraCredentials,
    ) -> std::result::Result<Arc<SourceConnection>, AcquireError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(AcquireError {
                stale: None,
                error: AppError::rtsp(key, "connection pool is shut down"),
            });
        }

        // Another caller may have dialed while we waited
        let stale = {
            let connections = self.connections.lock();
            match connections.get(key) {
                Some(conn) if conn.is_healthy() => {
                    conn.touch();
                    return Ok(conn.clone());
                }
                other => other.cloned(),
            }
        };

        let dialed = match timeout(self.dial_timeout, self.dialer.dial(url, creds)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::rtsp(
                key,
                format!("dial timed out after {:?}", self.dial_timeout),
            )),
        };

        let source = match dialed {
            Ok(source) => source,
            Err(error) => {
                warn_throttled!(self.throttler, key, "Failed to open {}: {}", key, error);
                return Err(AcquireError { stale, error });
            }
        };

        let conn = SourceConnection::start(
            key.to_string(),
            creds.clone(),
            source,
            self.throttler.clone(),
        );
        let inserted = {
            let mut connections = self.connections.lock();
            if self.closing.load(Ordering::Acquire) {
                None
            } else {
                Some(connections.insert(key.to_string(), conn.clone()))
            }
        };

        match inserted {
            None => {
                debug!("Pool shut down while dialing {}, closing new connection", key);
                conn.close().await;
                Err(AcquireError {
                    stale: None,
                    error: AppError::rtsp(key, "connection pool is shut down"),
                })
            }
            Some(Some(old)) => {
                info!("Replaced unhealthy RTSP connection {}", key);
                old.close().await;
                self.throttler.clear(key);
                Ok(conn)
            }
            Some(None) => {
                info!("Opened RTSP connection {}", key);
                self.throttler.clear(key);
                Ok(conn)
            }
        }
    }

    fn healthy_entry(&self, key: &str) -> Option<Arc<SourceConnection>> {
        let connections = self.connections.lock();
        let conn = connections.get(key).filter(|c| c.is_healthy())?;
        conn.touch();
        Some(conn.clone())
    }

    fn dial_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.dial_locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the dial lock for `key` once nobody is dialing or waiting
    fn prune_dial_lock(&self, key: &str) {
        let mut locks = self.dial_locks.lock();
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    pub fn get(&self, url: &str) -> Option<Arc<SourceConnection>> {
        self.connections.lock().get(&source_key(url)).cloned()
    }

    /// Flag the entry so the next `acquire` redials
    pub fn mark_unhealthy(&self, url: &str) {
        if let Some(conn) = self.get(url) {
            conn.mark_unhealthy();
        }
    }

    /// Remove and close the connection for `url`
    pub async fn release(&self, url: &str) -> bool {
        let key = source_key(url);
        let removed = self.connections.lock().remove(&key);
        self.prune_dial_lock(&key);
        match removed {
            Some(conn) => {
                conn.close().await;
                info!("Released RTSP connection {}", key);
                true
            }
            None => false,
        }
    }

    /// Close every connection; used at shutdown
    pub async fn close_all(&self) {
        let drained: Vec<Arc<SourceConnection>> = {
            let mut connections = self.connections.lock();
            self.closing.store(true, Ordering::Release);
            connections.drain().map(|(_, c)| c).collect()
        };

        let count = drained.len();
        for conn in drained {
            conn.close().await;
        }
        if count > 0 {
            info!("Closed {} RTSP connection(s)", count);
        }
    }

    /// Evict connections idle for longer than `max_idle`; returns how many
    pub async fn sweep_idle(&self, max_idle: Duration) -> usize {
        let evicted: Vec<Arc<SourceConnection>> = {
            let mut connections = self.connections.lock();
            let keys: Vec<String> = connections
                .iter()
                .filter(|(_, c)| c.idle_for() > max_idle)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| connections.remove(k)).collect()
        };

        for conn in &evicted {
            self.prune_dial_lock(conn.url());
        }
        for conn in &evicted {
            debug!("Evicting idle RTSP connection {} (idle {:?})", conn.url(), conn.idle_for());
            conn.close().await;
        }
        evicted.len()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    pub fn list(&self) -> Vec<SourceInfo> {
        let mut list: Vec<SourceInfo> = self
            .connections
            .lock()
            .values()
            .map(|c| SourceInfo {
                url: c.url().to_string(),
                healthy: c.is_healthy(),
                idle_secs: c.idle_for().as_secs(),
                age_secs: c.age().as_secs(),
                subscribers: c.subscriber_count(),
            })
            .collect();
        list.sort_by(|a, b| a.url.cmp(&b.url));
        list
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeDialer;
    use super::*;

    const URL: &str = "rtsp://10.0.0.5:554/Streaming/Channels/101";

    fn pool(dialer: &Arc<FakeDialer>) -> ConnectionPool {
        ConnectionPool::new(dialer.clone(), Duration::from_secs(2))
    }

    fn creds() -> CameraCredentials {
        CameraCredentials::new("admin", "pw")
    }

    #[tokio::test]
    async fn test_acquire_reuses_healthy_connection() {
        let dialer = Arc::new(FakeDialer::default());
        let pool = pool(&dialer);

        let a = pool.acquire(URL, &creds()).await.unwrap();
        let b = pool.acquire(URL, &creds()).await.unwrap();
        let c = pool
            .acquire("rtsp://admin:pw@10.0.0.5:554/Streaming/Channels/101", &creds())
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_dials_once() {
        let dialer = Arc::new(FakeDialer::default());
        *dialer.delay.lock() = Duration::from_millis(50);
        let pool = Arc::new(pool(&dialer));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                pool.acquire(URL, &creds()).await.unwrap()
            }));
        }
        let conns: Vec<Arc<SourceConnection>> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        assert!(conns.iter().all(|c| Arc::ptr_eq(c, &conns[0])));
    }

    #[tokio::test]
    async fn test_distinct_urls_get_distinct_connections() {
        let dialer = Arc::new(FakeDialer::default());
        let pool = pool(&dialer);

        let a = pool.acquire(URL, &creds()).await.unwrap();
        let b = pool
            .acquire("rtsp://10.0.0.5:554/Streaming/Channels/102", &creds())
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_read_error_marks_unhealthy_and_acquire_replaces() {
        let dialer = Arc::new(FakeDialer::default());
        *dialer.fail_after.lock() = Some(2);
        let pool = pool(&dialer);

        let first = pool.acquire(URL, &creds()).await.unwrap();
        timeout(Duration::from_secs(1), first.closed()).await.unwrap();
        assert!(!first.is_healthy());
        assert!(first.subscribe().is_err());

        *dialer.fail_after.lock() = None;
        let second = pool.acquire(URL, &creds()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_healthy());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_redial_returns_stale_entry() {
        let dialer = Arc::new(FakeDialer::default());
        let pool = pool(&dialer);

        let first = pool.acquire(URL, &creds()).await.unwrap();
        pool.mark_unhealthy(URL);
        dialer.refuse.store(true, Ordering::SeqCst);

        let err = pool.acquire(URL, &creds()).await.unwrap_err();
        let stale = err.stale.expect("stale entry returned");
        assert!(Arc::ptr_eq(&stale, &first));
        assert!(matches!(err.error, AppError::Rtsp { .. }));

        // No entry at all: plain error
        let err = pool
            .acquire("rtsp://10.0.0.9/Streaming/Channels/1", &creds())
            .await
            .unwrap_err();
        assert!(err.stale.is_none());
    }

    #[tokio::test]
    async fn test_subscribers_share_one_sample_stream() {
        let dialer = Arc::new(FakeDialer::default());
        let pool = pool(&dialer);

        let conn = pool.acquire(URL, &creds()).await.unwrap();
        let mut rx1 = conn.subscribe().unwrap();
        let mut rx2 = conn.subscribe().unwrap();

        let a = timeout(Duration::from_secs(1), rx1.recv()).await.unwrap().unwrap();
        let b = timeout(Duration::from_secs(1), rx2.recv()).await.unwrap().unwrap();
        assert_eq!(a.data, b.data);
        assert_eq!(conn.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_sweep_idle_only_after_max_age() {
        let dialer = Arc::new(FakeDialer::default());
        let pool = pool(&dialer);

        let conn = pool.acquire(URL, &creds()).await.unwrap();
        assert_eq!(pool.sweep_idle(Duration::from_secs(60)).await, 0);
        assert_eq!(pool.len(), 1);

        conn.backdate(Duration::from_secs(61));
        assert_eq!(pool.sweep_idle(Duration::from_secs(60)).await, 1);
        assert!(pool.is_empty());
        assert!(!conn.is_healthy());
        assert_eq!(dialer.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dial_locks_do_not_accumulate() {
        let dialer = Arc::new(FakeDialer::default());
        let pool = pool(&dialer);

        for i in 0..20 {
            let url = format!("rtsp://10.0.0.5/Streaming/tracks/101?starttime={}", i);
            pool.acquire(&url, &creds()).await.unwrap();
        }
        assert_eq!(pool.len(), 20);
        assert!(pool.dial_locks.lock().is_empty());

        // failed dials leave nothing behind either
        dialer.refuse.store(true, Ordering::SeqCst);
        assert!(pool.acquire("rtsp://10.0.0.9/ch1", &creds()).await.is_err());
        assert!(pool.dial_locks.lock().is_empty());

        for conn in pool.list() {
            pool.get(&conn.url).unwrap().backdate(Duration::from_secs(61));
        }
        assert_eq!(pool.sweep_idle(Duration::from_secs(60)).await, 20);
        assert!(pool.dial_locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_close_all_during_dial_leaves_nothing_open() {
        let dialer = Arc::new(FakeDialer::default());
        *dialer.delay.lock() = Duration::from_millis(100);
        let pool = Arc::new(pool(&dialer));

        let dialing = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(URL, &creds()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close_all().await;

        let err = dialing.await.unwrap().unwrap_err();
        assert!(err.stale.is_none());
        assert!(pool.is_empty());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        assert_eq!(dialer.closed.load(Ordering::SeqCst), 1);

        // later acquires are refused without dialing
        assert!(pool.acquire(URL, &creds()).await.is_err());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_and_close_all() {
        let dialer = Arc::new(FakeDialer::default());
        let pool = pool(&dialer);

        pool.acquire(URL, &creds()).await.unwrap();
        pool.acquire("rtsp://10.0.0.6/Streaming/Channels/1", &creds())
            .await
            .unwrap();
        pool.acquire("rtsp://10.0.0.7/Streaming/Channels/1", &creds())
            .await
            .unwrap();

        assert!(pool.release(URL).await);
        assert!(!pool.release(URL).await);
        assert_eq!(pool.len(), 2);

        pool.close_all().await;
        assert!(pool.is_empty());
        assert_eq!(dialer.closed.load(Ordering::SeqCst), 3);
    }
}
