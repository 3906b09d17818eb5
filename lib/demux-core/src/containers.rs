//! Container metadata and resource usage.
//!
//! [`CachedContainerProvider`] periodically snapshots every running container through a [`ContainerInspector`] and
//! serves lookups from the latest snapshot.
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use futures::future::join_all;
use snafu::Snafu;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{error::GenericError, hash::FastHashMap};

/// A container provider error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ContainerError {
    /// The container is not part of the current snapshot.
    #[snafu(display("Container '{}' not found.", id))]
    NotFound {
        /// Container identifier.
        id: String,
    },

    /// Running containers could not be listed.
    #[snafu(display("Failed to list containers: {}", error))]
    ListContainers {
        /// Underlying error.
        error: GenericError,
    },
}

/// CPU and memory limits of a container.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerLimits {
    /// CPU limit, in percent of a single core. Zero when unlimited.
    pub cpu_limit: f64,

    /// Memory limit, in bytes. Zero when unlimited.
    pub memory_limit: u64,
}

/// Static details of a container.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerDetails {
    /// Start time, as a Unix timestamp in seconds.
    pub started_at: Option<i64>,

    /// Process identifier of the container's main process.
    pub pid: u32,

    /// Resource limits.
    pub limits: ContainerLimits,
}

/// CPU usage of a container, in jiffies.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerCpuStats {
    /// Time spent in user mode.
    pub user: f64,

    /// Time spent in kernel mode.
    pub system: f64,

    /// Total time spent.
    pub usage_total: f64,
}

/// Memory usage of a container, in bytes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerMemStats {
    /// Resident set size.
    pub rss: u64,

    /// Private working set. Only reported on Windows.
    pub private_working_set: u64,

    /// Committed memory. Only reported on Windows.
    pub commit_bytes: u64,

    /// Peak committed memory. Only reported on Windows.
    pub commit_peak_bytes: u64,
}

/// Storage I/O of a container, in bytes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerIoStats {
    /// Bytes read.
    pub read_bytes: u64,

    /// Bytes written.
    pub write_bytes: u64,
}

/// Resource usage of a container.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerMetrics {
    /// CPU usage.
    pub cpu: ContainerCpuStats,

    /// Memory usage.
    pub memory: ContainerMemStats,

    /// Storage I/O.
    pub io: ContainerIoStats,
}

/// Raw traffic counters of a network interface.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InterfaceStats {
    /// Bytes received.
    pub bytes_received: u64,

    /// Bytes sent.
    pub bytes_sent: u64,

    /// Packets received.
    pub packets_received: u64,

    /// Packets sent.
    pub packets_sent: u64,
}

/// Traffic counters of a network interface, attributed to a network.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InterfaceNetStats {
    /// Network name, or the interface name when the interface is not mapped to a network.
    pub network_name: String,

    /// Bytes received.
    pub bytes_received: u64,

    /// Bytes sent.
    pub bytes_sent: u64,

    /// Packets received.
    pub packets_received: u64,

    /// Packets sent.
    pub packets_sent: u64,
}

/// Point-in-time statistics of a container.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerStats {
    /// Resource usage.
    pub metrics: ContainerMetrics,

    /// Traffic counters per interface name.
    pub networks: BTreeMap<String, InterfaceStats>,
}

/// Source of raw container information, such as a container runtime API.
#[async_trait]
pub trait ContainerInspector: Send + Sync {
    /// Lists the identifiers of running containers.
    async fn list_containers(&self) -> Result<Vec<String>, GenericError>;

    /// Gets the static details of a container.
    async fn inspect(&self, id: &str) -> Result<ContainerDetails, GenericError>;

    /// Gets the current statistics of a container.
    async fn stats(&self, id: &str) -> Result<ContainerStats, GenericError>;
}

/// Lookup of container metadata and resource usage.
#[async_trait]
pub trait ContainerProvider: Send + Sync {
    /// Refreshes the container snapshot. Every other lookup is served from the latest snapshot.
    ///
    /// # Errors
    ///
    /// If running containers cannot be listed, an error is returned and the previous snapshot is kept.
    async fn prefetch(&self) -> Result<(), ContainerError>;

    /// Returns `true` if the container is part of the snapshot.
    fn container_exists(&self, id: &str) -> bool;

    /// Start time of a container, as a Unix timestamp in seconds. Zero if unknown.
    ///
    /// # Errors
    ///
    /// If the container is not part of the snapshot, `ContainerError::NotFound` is returned.
    fn container_start_time(&self, id: &str) -> Result<i64, ContainerError>;

    /// Resource usage of a container, if its statistics could be collected.
    ///
    /// # Errors
    ///
    /// If the container is not part of the snapshot, `ContainerError::NotFound` is returned.
    fn container_metrics(&self, id: &str) -> Result<Option<ContainerMetrics>, ContainerError>;

    /// Resource limits of a container, if it could be inspected.
    ///
    /// # Errors
    ///
    /// If the container is not part of the snapshot, `ContainerError::NotFound` is returned.
    fn container_limits(&self, id: &str) -> Result<Option<ContainerLimits>, ContainerError>;

    /// Traffic counters of every interface of a container.
    ///
    /// Interfaces found in `networks` are reported under the mapped network name, others under their own name.
    ///
    /// # Errors
    ///
    /// If the container is not part of the snapshot, `ContainerError::NotFound` is returned.
    fn network_metrics(
        &self, id: &str, networks: &FastHashMap<String, String>,
    ) -> Result<Vec<InterfaceNetStats>, ContainerError>;

    /// Identifier of the container the current process runs in, refreshing the snapshot first if it is not known yet.
    async fn agent_container_id(&self) -> Option<String>;
}

#[derive(Clone, Debug, Default)]
struct ContainerBundle {
    started_at: i64,
    limits: Option<ContainerLimits>,
    metrics: Option<ContainerMetrics>,
    networks: BTreeMap<String, InterfaceStats>,
}

#[derive(Default)]
struct Snapshot {
    containers: FastHashMap<String, ContainerBundle>,
    agent_container_id: Option<String>,
}

/// A [`ContainerProvider`] caching the output of a [`ContainerInspector`].
///
/// Refreshes are serialized, and readers only wait on a refresh while the new snapshot is swapped in.
pub struct CachedContainerProvider<I> {
    inspector: Arc<I>,
    agent_pids: [u32; 2],
    refresh: Mutex<()>,
    snapshot: RwLock<Snapshot>,
}

impl<I> CachedContainerProvider<I>
where
    I: ContainerInspector + 'static,
{
    /// Creates a new `CachedContainerProvider` with an empty snapshot.
    ///
    /// The container whose main process is the current process, or its parent, is recorded as the agent container.
    pub fn new(inspector: I) -> Self {
        let pid = std::process::id();
        Self::with_agent_pids(inspector, [pid, parent_pid().unwrap_or(pid)])
    }

    fn with_agent_pids(inspector: I, agent_pids: [u32; 2]) -> Self {
        Self {
            inspector: Arc::new(inspector),
            agent_pids,
            refresh: Mutex::new(()),
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    fn lookup<T, F>(&self, id: &str, f: F) -> Result<T, ContainerError>
    where
        F: FnOnce(&ContainerBundle) -> T,
    {
        let snapshot = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        snapshot
            .containers
            .get(id)
            .map(f)
            .ok_or_else(|| ContainerError::NotFound { id: id.to_string() })
    }

    async fn fetch_chunk(inspector: Arc<I>, ids: Vec<String>, agent_pids: [u32; 2]) -> FetchedChunk {
        let mut chunk = FetchedChunk::default();

        for id in ids {
            let mut bundle = ContainerBundle::default();

            match inspector.inspect(&id).await {
                Ok(details) => {
                    bundle.started_at = details.started_at.unwrap_or_default();
                    bundle.limits = Some(details.limits);
                    if agent_pids.contains(&details.pid) {
                        chunk.agent_container_id = Some(id.clone());
                    }
                }
                Err(e) => info!(container_id = %id, error = %e, "Failed to inspect container."),
            }

            match inspector.stats(&id).await {
                Ok(stats) => {
                    bundle.metrics = Some(stats.metrics);
                    bundle.networks = stats.networks;
                }
                Err(e) => info!(container_id = %id, error = %e, "Failed to get container stats."),
            }

            chunk.containers.push((id, bundle));
        }

        chunk
    }
}

#[derive(Default)]
struct FetchedChunk {
    containers: Vec<(String, ContainerBundle)>,
    agent_container_id: Option<String>,
}

#[async_trait]
impl<I> ContainerProvider for CachedContainerProvider<I>
where
    I: ContainerInspector + 'static,
{
    async fn prefetch(&self) -> Result<(), ContainerError> {
        let _refresh = self.refresh.lock().await;

        let ids = self
            .inspector
            .list_containers()
            .await
            .map_err(|error| ContainerError::ListContainers { error })?;
        debug!(containers = ids.len(), "Listed running containers.");

        let chunk_size = match ids.len() / 8 {
            0 | 1 => ids.len().max(1),
            chunk_size => chunk_size,
        };
        debug!(chunk_size, "Fetching container details in chunks.");

        let chunks = ids.chunks(chunk_size).map(|chunk| {
            Self::fetch_chunk(Arc::clone(&self.inspector), chunk.to_vec(), self.agent_pids)
        });

        let mut containers = FastHashMap::default();
        let mut agent_container_id = None;
        for chunk in join_all(chunks).await {
            containers.extend(chunk.containers);
            agent_container_id = agent_container_id.or(chunk.agent_container_id);
        }

        let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        snapshot.containers = containers;
        if agent_container_id.is_some() {
            snapshot.agent_container_id = agent_container_id;
        }

        Ok(())
    }

    fn container_exists(&self, id: &str) -> bool {
        self.lookup(id, |_| ()).is_ok()
    }

    fn container_start_time(&self, id: &str) -> Result<i64, ContainerError> {
        self.lookup(id, |bundle| bundle.started_at)
    }

    fn container_metrics(&self, id: &str) -> Result<Option<ContainerMetrics>, ContainerError> {
        self.lookup(id, |bundle| bundle.metrics.clone())
    }

    fn container_limits(&self, id: &str) -> Result<Option<ContainerLimits>, ContainerError> {
        self.lookup(id, |bundle| bundle.limits.clone())
    }

    fn network_metrics(
        &self, id: &str, networks: &FastHashMap<String, String>,
    ) -> Result<Vec<InterfaceNetStats>, ContainerError> {
        self.lookup(id, |bundle| {
            bundle
                .networks
                .iter()
                .map(|(interface, stats)| InterfaceNetStats {
                    network_name: networks.get(interface).unwrap_or(interface).clone(),
                    bytes_received: stats.bytes_received,
                    bytes_sent: stats.bytes_sent,
                    packets_received: stats.packets_received,
                    packets_sent: stats.packets_sent,
                })
                .collect()
        })
    }

    async fn agent_container_id(&self) -> Option<String> {
        let known = self
            .snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .agent_container_id
            .clone();
        if known.is_some() {
            return known;
        }

        info!("Agent container ID is unknown. Refreshing containers.");
        if let Err(e) = self.prefetch().await {
            info!(error = %e, "Failed to refresh containers.");
        }

        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .agent_container_id
            .clone()
    }
}

#[cfg(target_os = "linux")]
fn parent_pid() -> Option<u32> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("PPid:"))
        .and_then(|ppid| ppid.trim().parse().ok())
}

#[cfg(not(target_os = "linux"))]
fn parent_pid() -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

    use super::*;
    use crate::generic_error;

    #[derive(Default)]
    struct FakeInspector {
        containers: Vec<(String, u32)>,
        broken: Vec<String>,
        list_fails: bool,
        list_calls: AtomicUsize,
    }

    impl FakeInspector {
        fn with_containers(count: usize) -> Self {
            Self {
                containers: (0..count).map(|i| (format!("c{}", i), 1_000 + i as u32)).collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ContainerInspector for FakeInspector {
        async fn list_containers(&self) -> Result<Vec<String>, GenericError> {
            self.list_calls.fetch_add(1, SeqCst);
            if self.list_fails {
                return Err(generic_error!("runtime unavailable"));
            }
            Ok(self.containers.iter().map(|(id, _)| id.clone()).collect())
        }

        async fn inspect(&self, id: &str) -> Result<ContainerDetails, GenericError> {
            if self.broken.iter().any(|broken| broken == id) {
                return Err(generic_error!("no such container"));
            }
            let pid = self
                .containers
                .iter()
                .find(|(container_id, _)| container_id == id)
                .map(|(_, pid)| *pid)
                .unwrap_or_default();
            Ok(ContainerDetails {
                started_at: Some(1_700_000_000),
                pid,
                limits: ContainerLimits {
                    cpu_limit: 200.0,
                    memory_limit: 512 * 1024 * 1024,
                },
            })
        }

        async fn stats(&self, id: &str) -> Result<ContainerStats, GenericError> {
            if self.broken.iter().any(|broken| broken == id) {
                return Err(generic_error!("no such container"));
            }
            let mut networks = BTreeMap::new();
            networks.insert(
                "eth0".to_string(),
                InterfaceStats {
                    bytes_received: 10,
                    bytes_sent: 20,
                    packets_received: 1,
                    packets_sent: 2,
                },
            );
            networks.insert("eth1".to_string(), InterfaceStats::default());
            Ok(ContainerStats {
                metrics: ContainerMetrics {
                    cpu: ContainerCpuStats {
                        user: 1.0,
                        system: 2.0,
                        usage_total: 3.0,
                    },
                    ..Default::default()
                },
                networks,
            })
        }
    }

    #[tokio::test]
    async fn prefetch_populates_snapshot() {
        let provider = CachedContainerProvider::with_agent_pids(FakeInspector::with_containers(20), [1, 1]);
        assert!(!provider.container_exists("c0"));

        provider.prefetch().await.unwrap();

        for i in 0..20 {
            assert!(provider.container_exists(&format!("c{}", i)));
        }
        assert_eq!(provider.container_start_time("c3").unwrap(), 1_700_000_000);
        assert_eq!(provider.container_limits("c3").unwrap().unwrap().cpu_limit, 200.0);
        assert_eq!(provider.container_metrics("c3").unwrap().unwrap().cpu.usage_total, 3.0);
    }

    #[tokio::test]
    async fn unknown_containers_are_not_found() {
        let provider = CachedContainerProvider::with_agent_pids(FakeInspector::with_containers(2), [1, 1]);
        provider.prefetch().await.unwrap();

        assert!(matches!(
            provider.container_start_time("missing"),
            Err(ContainerError::NotFound { id }) if id == "missing"
        ));
        assert!(provider.container_metrics("missing").is_err());
        assert!(provider.container_limits("missing").is_err());
        assert!(provider.network_metrics("missing", &FastHashMap::default()).is_err());
    }

    #[tokio::test]
    async fn failing_containers_are_kept_without_details() {
        let mut inspector = FakeInspector::with_containers(3);
        inspector.broken.push("c1".to_string());
        let provider = CachedContainerProvider::with_agent_pids(inspector, [1, 1]);
        provider.prefetch().await.unwrap();

        assert!(provider.container_exists("c1"));
        assert_eq!(provider.container_start_time("c1").unwrap(), 0);
        assert_eq!(provider.container_metrics("c1").unwrap(), None);
        assert_eq!(provider.container_limits("c1").unwrap(), None);
        assert!(provider.container_metrics("c2").unwrap().is_some());
    }

    #[tokio::test]
    async fn list_failure_keeps_previous_snapshot() {
        let provider = CachedContainerProvider::with_agent_pids(FakeInspector::with_containers(2), [1, 1]);
        provider.prefetch().await.unwrap();

        let failing = CachedContainerProvider {
            inspector: Arc::new(FakeInspector {
                list_fails: true,
                ..Default::default()
            }),
            agent_pids: [1, 1],
            refresh: Mutex::new(()),
            snapshot: RwLock::new(std::mem::take(&mut *provider.snapshot.write().unwrap())),
        };

        assert!(matches!(
            failing.prefetch().await,
            Err(ContainerError::ListContainers { .. })
        ));
        assert!(failing.container_exists("c0"));
    }

    #[tokio::test]
    async fn network_metrics_use_network_names() {
        let provider = CachedContainerProvider::with_agent_pids(FakeInspector::with_containers(1), [1, 1]);
        provider.prefetch().await.unwrap();

        let mut networks = FastHashMap::default();
        networks.insert("eth0".to_string(), "bridge".to_string());

        let stats = provider.network_metrics("c0", &networks).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].network_name, "bridge");
        assert_eq!(stats[0].bytes_sent, 20);
        assert_eq!(stats[1].network_name, "eth1");
    }

    #[tokio::test]
    async fn agent_container_is_detected_by_pid() {
        let provider = CachedContainerProvider::with_agent_pids(FakeInspector::with_containers(4), [42, 1_002]);

        assert_eq!(provider.agent_container_id().await.as_deref(), Some("c2"));
        assert_eq!(provider.inspector.list_calls.load(SeqCst), 1);

        // Known from now on, without refreshing.
        assert_eq!(provider.agent_container_id().await.as_deref(), Some("c2"));
        assert_eq!(provider.inspector.list_calls.load(SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_listing_is_fine() {
        let provider = CachedContainerProvider::with_agent_pids(FakeInspector::default(), [1, 1]);
        provider.prefetch().await.unwrap();
        assert_eq!(provider.agent_container_id().await, None);
    }
}
