//! Background eviction of idle RTSP connections and dead relay sessions

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::rtsp::ConnectionPool;
use crate::webrtc::RelaySessionManager;

#[derive(Debug, Clone, Copy)]
pub struct JanitorSettings {
    pub interval: Duration,
    pub max_idle: Duration,
    pub max_inactivity: Duration,
}

impl From<&RelayConfig> for JanitorSettings {
    fn from(relay: &RelayConfig) -> Self {
        Self {
            interval: Duration::from_secs(relay.cleanup_interval_secs.max(1)),
            max_idle: Duration::from_secs(relay.max_idle_secs),
            max_inactivity: Duration::from_secs(relay.max_inactivity_secs),
        }
    }
}

/// Spawn the pool sweep and the session sweep as two independent loops
pub fn spawn(
    pool: Arc<ConnectionPool>,
    sessions: Arc<RelaySessionManager>,
    settings: JanitorSettings,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    info!(
        "Janitor every {:?} (idle connections > {:?}, inactive sessions > {:?})",
        settings.interval, settings.max_idle, settings.max_inactivity
    );

    let pool_loop = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            run_every(settings.interval, cancel, || {
                let pool = pool.clone();
                async move {
                    let evicted = pool.sweep_idle(settings.max_idle).await;
                    if evicted > 0 {
                        info!("Evicted {} idle RTSP connections", evicted);
                    }
                }
            })
            .await;
        })
    };

    let session_loop = tokio::spawn(async move {
        run_every(settings.interval, cancel, || {
            let sessions = sessions.clone();
            async move {
                let evicted = sessions.sweep(settings.max_inactivity).await;
                if evicted > 0 {
                    info!("Evicted {} relay sessions", evicted);
                }
            }
        })
        .await;
    });

    vec![pool_loop, session_loop]
}

async fn run_every<F, Fut>(period: Duration, cancel: CancellationToken, mut sweep: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Janitor loop stopped");
                break;
            }
            _ = ticker.tick() => sweep().await,
        }
    }
}
