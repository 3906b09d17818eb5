//! Per-producer senders.
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc, Mutex,
    },
};

use arc_swap::ArcSwap;
use tracing::trace;

use crate::{
    metrics::{CheckPayload, Event, MetricSample, MetricType, ServiceCheck},
    router::SampleRouter,
    time::get_unix_timestamp,
};

mod registry;
pub use self::registry::{SenderError, SenderRegistry};

/// Identity of a producer, unique within the process.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CheckId(String);

impl CheckId {
    /// Creates a new `CheckId`.
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CheckId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for CheckId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Default)]
struct Pending {
    samples: Vec<MetricSample>,
    payloads: Vec<CheckPayload>,
}

struct Inner {
    id: CheckId,
    default_hostname: ArcSwap<String>,
    pending: Mutex<Pending>,
    last_commit: AtomicU64,
    router: SampleRouter,
}

/// Handle through which a producer submits telemetry.
///
/// Submitted metrics, events, and service checks are buffered until [`commit`][Self::commit] is called, at which point
/// metrics are routed to the aggregation shards and events and service checks to the check payload buffer. Anything
/// submitted without a hostname is attributed to the sender's default hostname, if one is set.
///
/// Cloning is cheap, and clones share the same buffer.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<Inner>,
}

impl Sender {
    pub(crate) fn new(id: CheckId, default_hostname: &str, router: SampleRouter) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                default_hostname: ArcSwap::from_pointee(default_hostname.to_string()),
                pending: Mutex::new(Pending::default()),
                last_commit: AtomicU64::new(get_unix_timestamp()),
                router,
            }),
        }
    }

    /// Identity of the producer owning this sender.
    pub fn id(&self) -> &CheckId {
        &self.inner.id
    }

    /// Current default hostname.
    pub fn default_hostname(&self) -> String {
        self.inner.default_hostname.load().as_ref().clone()
    }

    pub(crate) fn set_default_hostname(&self, hostname: &str) {
        self.inner.default_hostname.store(Arc::new(hostname.to_string()));
    }

    /// Unix timestamp of the last commit, or of creation if never committed.
    pub fn last_commit(&self) -> u64 {
        self.inner.last_commit.load(Relaxed)
    }

    /// Returns `true` if both handles refer to the same sender.
    pub fn ptr_eq(&self, other: &Sender) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn with_pending<F>(&self, f: F)
    where
        F: FnOnce(&mut Pending),
    {
        let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut pending);
    }

    /// Submits a sample.
    pub fn submit(&self, sample: MetricSample) {
        self.with_pending(|pending| pending.samples.push(sample));
    }

    fn submit_value(&self, name: &str, value: f64, metric_type: MetricType, tags: &[&str]) {
        self.submit(MetricSample::new(name, value, metric_type).with_tags(tags.iter().copied()));
    }

    /// Submits a gauge.
    pub fn gauge(&self, name: &str, value: f64, tags: &[&str]) {
        self.submit_value(name, value, MetricType::Gauge, tags);
    }

    /// Submits a count.
    pub fn count(&self, name: &str, value: f64, tags: &[&str]) {
        self.submit_value(name, value, MetricType::Counter, tags);
    }

    /// Submits a monotonic count.
    pub fn monotonic_count(&self, name: &str, value: f64, tags: &[&str]) {
        self.submit_value(name, value, MetricType::MonotonicCount, tags);
    }

    /// Submits a rate.
    pub fn rate(&self, name: &str, value: f64, tags: &[&str]) {
        self.submit_value(name, value, MetricType::Rate, tags);
    }

    /// Submits a histogram value.
    pub fn histogram(&self, name: &str, value: f64, tags: &[&str]) {
        self.submit_value(name, value, MetricType::Histogram, tags);
    }

    /// Submits a distribution value.
    pub fn distribution(&self, name: &str, value: f64, tags: &[&str]) {
        self.submit_value(name, value, MetricType::Distribution, tags);
    }

    /// Submits an event.
    pub fn event(&self, event: Event) {
        self.with_pending(|pending| pending.payloads.push(CheckPayload::Event(event)));
    }

    /// Submits a service check.
    pub fn service_check(&self, service_check: ServiceCheck) {
        self.with_pending(|pending| pending.payloads.push(CheckPayload::ServiceCheck(service_check)));
    }

    /// Hands everything submitted since the previous commit to the demultiplexer.
    ///
    /// Waits for capacity if the destination shards are busy.
    pub async fn commit(&self) {
        let Pending { mut samples, mut payloads } = {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };

        let hostname = self.inner.default_hostname.load_full();
        if !hostname.is_empty() {
            for sample in samples.iter_mut().filter(|sample| sample.host.is_none()) {
                sample.host = Some(hostname.as_ref().clone());
            }
            for payload in &mut payloads {
                let host = match payload {
                    CheckPayload::Event(event) => &mut event.host,
                    CheckPayload::ServiceCheck(service_check) => &mut service_check.host,
                };
                if host.is_none() {
                    *host = Some(hostname.as_ref().clone());
                }
            }
        }

        trace!(
            sender = %self.inner.id,
            samples = samples.len(),
            payloads = payloads.len(),
            "Committing sender."
        );

        self.inner.router.route_by_context(samples).await;
        self.inner.router.send_check_payloads(payloads).await;
        self.inner.last_commit.store(get_unix_timestamp(), Relaxed);
    }
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender").field("id", &self.inner.id).finish_non_exhaustive()
    }
}
