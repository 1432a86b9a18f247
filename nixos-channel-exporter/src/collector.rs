//! Pull-based collectors: the channel collection engine, build info and
//! process statistics.
//!
//! Every scrape calls [`Collector::collect`], which for [`ChannelCollector`]
//! fans out one revision request per registered channel, isolates per-channel
//! failures, and folds them into a failure counter and an invalid-metric
//! marker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use nixos_channels::{FetchError, FetchResult, Registry, RevisionFetcher, UpstreamConfig};
use parking_lot::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::{
    BUILD_INFO, CHANNEL_CURRENT, CHANNEL_REQUEST_FAILURES, CHANNEL_REVISION, CHANNEL_UPDATE_TIME,
    MetricDesc, Observation, PROCESS_RESIDENT_MEMORY, PROCESS_START_TIME, PROCESS_VIRTUAL_MEMORY,
};

/// Describe/collect contract consumed by the [`Gatherer`](crate::gather::Gatherer).
pub trait Collector: Send + Sync {
    /// Every descriptor this collector may emit.
    fn describe(&self) -> Vec<&'static MetricDesc>;

    /// Run one scrape and return its observations.
    fn collect(&self) -> BoxFuture<'_, Vec<Observation>>;
}

/// Scrape behaviour of the [`ChannelCollector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorSettings {
    /// Deadline shared by all channel requests of one scrape.
    pub scrape_timeout: Duration,
    /// Cancel outstanding requests when the first one fails.
    pub fail_fast: bool,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            scrape_timeout: Duration::from_secs(10),
            fail_fast: false,
        }
    }
}

impl From<&UpstreamConfig> for CollectorSettings {
    fn from(config: &UpstreamConfig) -> Self {
        Self {
            scrape_timeout: config.scrape_timeout(),
            fail_fast: config.fail_fast,
        }
    }
}

/// A channel whose revision could not be collected.
#[derive(Debug)]
pub struct ChannelFailure {
    /// Name of the failed channel.
    pub channel: String,
    /// Why the request failed.
    pub error: FetchError,
}

/// Result of one scrape of the channel collector.
#[derive(Debug, Default)]
pub struct CollectionOutcome {
    /// Emitted observations, ending with the failure counter.
    pub observations: Vec<Observation>,
    /// Channels that failed in this scrape, sorted by name.
    pub failures: Vec<ChannelFailure>,
}

/// Collects NixOS channel revisions from the channel status server.
pub struct ChannelCollector {
    registry: Arc<Registry>,
    fetcher: RevisionFetcher,
    settings: CollectorSettings,
    // Cumulative since process start.
    failures: Arc<AtomicU64>,
}

impl ChannelCollector {
    /// Create a collector for the channels in `registry`.
    pub fn new(registry: Registry, fetcher: RevisionFetcher, settings: CollectorSettings) -> Self {
        Self {
            registry: Arc::new(registry),
            fetcher,
            settings,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The channels scraped by this collector.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Deadline and failure mode of each scrape.
    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    /// Number of failed channel requests since the collector was created.
    pub fn failures_total(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Run one full scrape across every channel.
    pub async fn scrape(&self) -> CollectionOutcome {
        let started = Instant::now();
        let deadline = scrape_deadline(tokio::time::Instant::now(), self.settings.scrape_timeout);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        for (name, channel) in self.registry.iter() {
            let name = name.to_string();
            let current = channel.current;
            let fetcher = self.fetcher.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            let failures = Arc::clone(&self.failures);
            let fail_fast = self.settings.fail_fast;
            let scrape_timeout = self.settings.scrape_timeout;

            tasks.spawn(async move {
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(FetchError::Cancelled),
                    fetched = tokio::time::timeout_at(deadline, fetcher.fetch(&name)) => {
                        fetched.unwrap_or_else(|_| Err(FetchError::Timeout(scrape_timeout)))
                    }
                };

                match result {
                    Ok(fetched) => {
                        emit_channel(&tx, fetched, current);
                        Ok(())
                    }
                    Err(error) => {
                        failures.fetch_add(1, Ordering::Relaxed);
                        if fail_fast {
                            cancel.cancel();
                        }
                        debug!(channel = %name, error = %error, "Channel request failed");
                        Err(ChannelFailure {
                            channel: name,
                            error,
                        })
                    }
                }
            });
        }
        drop(tx);

        let mut failed = Vec::new();
        let mut panicked = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => failed.push(failure),
                Err(join_err) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    panicked += 1;
                    warn!(error = ?join_err, "Channel task did not complete");
                }
            }
        }

        let mut observations = Vec::with_capacity(self.registry.len() * 3 + 2);
        while let Some(observation) = rx.recv().await {
            observations.push(observation);
        }

        failed.sort_by(|a, b| a.channel.cmp(&b.channel));
        let failed_count = failed.len() + panicked;
        if failed_count > 0 {
            let message = failure_summary(&failed, failed_count, self.registry.len());
            warn!(
                failed = failed_count,
                channels = self.registry.len(),
                error = %message,
                "Channel scrape completed with failures"
            );
            observations.push(Observation::invalid(&CHANNEL_REVISION, message));
        }

        observations.push(Observation::sample(
            &CHANNEL_REQUEST_FAILURES,
            Vec::new(),
            self.failures_total() as f64,
        ));

        debug!(
            channels = self.registry.len(),
            failed = failed_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Channel scrape finished"
        );

        CollectionOutcome {
            observations,
            failures: failed,
        }
    }
}

impl Collector for ChannelCollector {
    fn describe(&self) -> Vec<&'static MetricDesc> {
        vec![
            &CHANNEL_REVISION,
            &CHANNEL_UPDATE_TIME,
            &CHANNEL_CURRENT,
            &CHANNEL_REQUEST_FAILURES,
        ]
    }

    fn collect(&self) -> BoxFuture<'_, Vec<Observation>> {
        Box::pin(async move { self.scrape().await.observations })
    }
}

/// Deadline shared by the channel requests of one scrape.
///
/// Timeouts too large to represent saturate to a deadline decades away.
fn scrape_deadline(now: tokio::time::Instant, timeout: Duration) -> tokio::time::Instant {
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Send the observations for one successfully fetched channel.
fn emit_channel(tx: &mpsc::UnboundedSender<Observation>, fetched: FetchResult, current: bool) {
    let FetchResult {
        channel,
        revision,
        last_modified,
    } = fetched;

    // The receiver outlives every task of the scrape.
    let _ = tx.send(Observation::sample(
        &CHANNEL_REVISION,
        vec![channel.clone(), revision],
        1.0,
    ));

    if let Some(modified) = last_modified {
        let _ = tx.send(Observation::sample(
            &CHANNEL_UPDATE_TIME,
            vec![channel.clone()],
            modified.timestamp() as f64,
        ));
    }

    let _ = tx.send(Observation::sample(
        &CHANNEL_CURRENT,
        vec![channel],
        if current { 1.0 } else { 0.0 },
    ));
}

fn failure_summary(failed: &[ChannelFailure], failed_count: usize, total: usize) -> String {
    let details: Vec<String> = failed
        .iter()
        .map(|f| format!("channel {:?}: {}", f.channel, f.error))
        .collect();

    format!(
        "failed to fetch {} of {} channels: {}",
        failed_count,
        total,
        details.join("; ")
    )
}

/// Exposes the exporter version as a constant info-style gauge.
#[derive(Debug, Clone)]
pub struct BuildInfoCollector {
    version: String,
}

impl BuildInfoCollector {
    /// Create a build info collector reporting `version`.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl Default for BuildInfoCollector {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_VERSION"))
    }
}

impl Collector for BuildInfoCollector {
    fn describe(&self) -> Vec<&'static MetricDesc> {
        vec![&BUILD_INFO]
    }

    fn collect(&self) -> BoxFuture<'_, Vec<Observation>> {
        let observation = Observation::sample(&BUILD_INFO, vec![self.version.clone()], 1.0);
        Box::pin(futures::future::ready(vec![observation]))
    }
}

/// Exposes memory and start time of the exporter process.
pub struct ProcessCollector {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessCollector {
    /// Create a collector for the current process.
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = %e, "Process metrics unavailable on this platform");
                None
            }
        };

        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }

    fn observations(&self) -> Vec<Observation> {
        let Some(pid) = self.pid else {
            return Vec::new();
        };

        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        let Some(process) = system.process(pid) else {
            debug!(%pid, "Own process not found");
            return Vec::new();
        };

        vec![
            Observation::sample(&PROCESS_RESIDENT_MEMORY, Vec::new(), process.memory() as f64),
            Observation::sample(
                &PROCESS_VIRTUAL_MEMORY,
                Vec::new(),
                process.virtual_memory() as f64,
            ),
            Observation::sample(&PROCESS_START_TIME, Vec::new(), process.start_time() as f64),
        ]
    }
}

impl Default for ProcessCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for ProcessCollector {
    fn describe(&self) -> Vec<&'static MetricDesc> {
        vec![
            &PROCESS_RESIDENT_MEMORY,
            &PROCESS_VIRTUAL_MEMORY,
            &PROCESS_START_TIME,
        ]
    }

    fn collect(&self) -> BoxFuture<'_, Vec<Observation>> {
        Box::pin(futures::future::ready(self.observations()))
    }
}
