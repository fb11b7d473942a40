use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::probe::Probe;
use super::subnet::{Subnet, MIN_SCAN_PREFIX};
use super::{CameraRecord, CameraSettings};
use crate::config::DiscoveryConfig;
use crate::error::{AppError, Result};
use crate::utils::net::outbound_ipv4;

/// Parameters of one scan
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// CIDR to scan; `None` or empty derives the local /24
    pub subnet: Option<String>,
    pub port: u16,
    /// Per-host probe deadline
    pub timeout: Duration,
}

impl From<&DiscoveryConfig> for ScanOptions {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            subnet: Some(config.subnet.clone()).filter(|s| !s.trim().is_empty()),
            port: config.port,
            timeout: Duration::from_millis(config.probe_timeout_ms),
        }
    }
}

/// Scans subnets for RTSP hosts and keeps the live ones in a cache
///
/// Records are never removed, only overwritten by later scans of the same IP.
pub struct DiscoveryEngine {
    probe: Arc<dyn Probe>,
    settings: Arc<dyn CameraSettings>,
    defaults: ScanOptions,
    max_concurrent: usize,
    cache: RwLock<HashMap<String, CameraRecord>>,
}

impl DiscoveryEngine {
    pub fn new(
        probe: Arc<dyn Probe>,
        settings: Arc<dyn CameraSettings>,
        defaults: ScanOptions,
        max_concurrent: usize,
    ) -> Self {
        Self {
            probe,
            settings,
            defaults,
            max_concurrent: max_concurrent.max(1),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Scan options taken from configuration
    pub fn default_options(&self) -> ScanOptions {
        self.defaults.clone()
    }

    /// Scan, logging instead of returning errors
    ///
    /// An unparseable subnet or a failed local address lookup yields no results.
    pub async fn scan(&self, options: &ScanOptions) -> Vec<CameraRecord> {
        match self.try_scan(options).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Camera scan aborted: {}", e);
                Vec::new()
            }
        }
    }

    /// Scan and upsert every host that answers on `options.port`
    ///
    /// Results are returned sorted by address.
    pub async fn try_scan(&self, options: &ScanOptions) -> Result<Vec<CameraRecord>> {
        let subnet = resolve_subnet(options.subnet.as_deref())?;
        info!(
            "Scanning {} ({} hosts) on port {}",
            subnet,
            subnet.host_count(),
            options.port
        );

        let creds = self.settings.credentials();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let (tx, mut rx) = mpsc::channel::<CameraRecord>(64);

        for ip in subnet.hosts() {
            // Acquire before spawning so at most `max_concurrent` probes exist at once
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::Internal(format!("Probe semaphore closed: {}", e)))?;
            let probe = self.probe.clone();
            let tx = tx.clone();
            let creds = creds.clone();
            let port = options.port;
            let limit = options.timeout;

            tokio::spawn(async move {
                let addr = SocketAddr::new(IpAddr::V4(ip), port);
                let reachable = matches!(timeout(limit, probe.probe(addr, limit)).await, Ok(true));
                drop(permit);
                if reachable {
                    debug!("Camera answered at {}", addr);
                    let _ = tx.send(CameraRecord::online(ip.to_string(), port, &creds)).await;
                }
            });
        }
        // The channel closes once every probe task has dropped its sender
        drop(tx);

        let mut found = Vec::new();
        while let Some(record) = rx.recv().await {
            found.push(record);
        }

        self.upsert(&found);
        sort_by_ip(&mut found);
        info!("Scan of {} found {} camera(s)", subnet, found.len());
        Ok(found)
    }

    pub(crate) fn upsert(&self, records: &[CameraRecord]) {
        if records.is_empty() {
            return;
        }
        let mut cache = self.cache.write();
        for record in records {
            match cache.get_mut(&record.ip) {
                Some(existing) => {
                    let last_seen = existing.last_seen.max(record.last_seen);
                    *existing = record.clone();
                    existing.last_seen = last_seen;
                }
                None => {
                    cache.insert(record.ip.clone(), record.clone());
                }
            }
        }
    }

    /// Snapshot of the cache, sorted by address
    pub fn cached(&self) -> Vec<CameraRecord> {
        let mut records: Vec<CameraRecord> = self.cache.read().values().cloned().collect();
        sort_by_ip(&mut records);
        records
    }

    pub fn get(&self, ip: &str) -> Option<CameraRecord> {
        self.cache.read().get(ip).cloned()
    }

    pub fn settings(&self) -> &Arc<dyn CameraSettings> {
        &self.settings
    }

    /// Periodic rescans until `cancel` fires
    ///
    /// Returns `None` when auto-discovery is disabled. The setting is read
    /// once here; toggling it later needs a restart.
    pub fn start_background(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.settings.auto_discovery_enabled() {
            info!("Automatic camera discovery disabled");
            return None;
        }

        let minutes = self.settings.scan_interval_minutes().max(1);
        let period = Duration::from_secs(u64::from(minutes) * 60);
        info!("Automatic camera discovery every {} min", minutes);

        let engine = self.clone();
        Some(tokio::spawn(async move {
            let options = engine.default_options();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = engine.scan(&options) => {}
                }
            }
            debug!("Camera discovery loop stopped");
        }))
    }
}

fn resolve_subnet(subnet: Option<&str>) -> Result<Subnet> {
    let subnet = match subnet.map(str::trim).filter(|s| !s.is_empty()) {
        Some(cidr) => Subnet::parse(cidr)?,
        None => {
            let local = outbound_ipv4()
                .map_err(|e| AppError::Discovery(format!("Cannot determine local address: {}", e)))?;
            Subnet::slash24(local)
        }
    };

    if subnet.prefix() < MIN_SCAN_PREFIX {
        return Err(AppError::Discovery(format!(
            "Subnet {} too large, prefix must be /{} or longer",
            subnet, MIN_SCAN_PREFIX
        )));
    }
    Ok(subnet)
}

fn sort_by_ip(records: &mut [CameraRecord]) {
    records.sort_by_key(|r| r.ip.parse::<Ipv4Addr>().map(u32::from).unwrap_or(u32::MAX));
}
