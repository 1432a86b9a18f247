//! Registration of collectors and assembly of a full scrape.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::debug;

use crate::collector::Collector;
use crate::metrics::{self, Exposition, MetricDesc, Observation};

/// Errors raised while registering collectors.
#[derive(Debug, Error)]
pub enum GatherError {
    #[error("metric {0:?} is already described by another collector")]
    DuplicateDescriptor(&'static str),
}

/// Holds every registered collector and runs them together on each scrape.
///
/// Registration rejects collectors whose descriptors clash with ones already
/// registered. During a scrape, observations for metrics their collector did
/// not describe are turned into invalid markers.
#[derive(Default)]
pub struct Gatherer {
    collectors: Vec<Registered>,
    names: HashSet<&'static str>,
}

struct Registered {
    collector: Arc<dyn Collector>,
    described: HashSet<&'static str>,
}

impl Gatherer {
    /// Create an empty gatherer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collector.
    pub fn register(&mut self, collector: Arc<dyn Collector>) -> Result<(), GatherError> {
        let described: HashSet<&'static str> =
            collector.describe().iter().map(|desc| desc.name).collect();

        if let Some(name) = described.iter().find(|name| self.names.contains(*name)) {
            return Err(GatherError::DuplicateDescriptor(*name));
        }

        self.names.extend(described.iter().copied());
        self.collectors.push(Registered {
            collector,
            described,
        });
        Ok(())
    }

    /// Descriptors of every registered collector, sorted by name.
    pub fn descriptors(&self) -> Vec<&'static MetricDesc> {
        let mut descs: Vec<&'static MetricDesc> = self
            .collectors
            .iter()
            .flat_map(|registered| registered.collector.describe())
            .collect();
        descs.sort_by_key(|desc| desc.name);
        descs
    }

    /// Number of registered collectors.
    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    /// Whether no collectors are registered.
    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Collect from every registered collector concurrently.
    pub async fn collect(&self) -> Vec<Observation> {
        let results = join_all(self.collectors.iter().map(|registered| async move {
            let observations = registered.collector.collect().await;
            checked(registered, observations)
        }))
        .await;

        results.into_iter().flatten().collect()
    }

    /// Collect and render a complete scrape.
    pub async fn gather(&self) -> Exposition {
        let observations = self.collect().await;
        let exposition = metrics::render(&observations);

        debug!(
            observations = observations.len(),
            errors = exposition.errors.len(),
            "Gathered metrics"
        );

        exposition
    }
}

fn checked(registered: &Registered, observations: Vec<Observation>) -> Vec<Observation> {
    observations
        .into_iter()
        .map(|observation| {
            let desc = observation.desc();
            if registered.described.contains(desc.name) {
                observation
            } else {
                Observation::invalid(desc, "collected metric was not described by its collector")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::BuildInfoCollector;
    use crate::metrics::{BUILD_INFO, CHANNEL_CURRENT};
    use futures::future::BoxFuture;

    /// Describes build info but emits a channel metric.
    struct Misbehaving;

    impl Collector for Misbehaving {
        fn describe(&self) -> Vec<&'static MetricDesc> {
            vec![&BUILD_INFO]
        }

        fn collect(&self) -> BoxFuture<'_, Vec<Observation>> {
            Box::pin(async {
                vec![Observation::sample(
                    &CHANNEL_CURRENT,
                    vec!["nixos-unstable".to_string()],
                    1.0,
                )]
            })
        }
    }

    #[test]
    fn test_register_duplicate_rejected() {
        let mut gatherer = Gatherer::new();
        gatherer
            .register(Arc::new(BuildInfoCollector::new("0.1.0")))
            .unwrap();

        let err = gatherer
            .register(Arc::new(BuildInfoCollector::new("0.2.0")))
            .unwrap_err();

        assert!(matches!(
            err,
            GatherError::DuplicateDescriptor("nixos_channel_exporter_build_info")
        ));
        assert_eq!(gatherer.len(), 1);
    }

    #[tokio::test]
    async fn test_gather_build_info() {
        let mut gatherer = Gatherer::new();
        gatherer
            .register(Arc::new(BuildInfoCollector::new("0.3.0")))
            .unwrap();

        let exposition = gatherer.gather().await;

        assert!(!exposition.has_errors());
        assert!(
            exposition
                .body
                .contains("nixos_channel_exporter_build_info{version=\"0.3.0\"} 1\n")
        );
    }

    #[tokio::test]
    async fn test_undescribed_metric_is_invalid() {
        let mut gatherer = Gatherer::new();
        gatherer.register(Arc::new(Misbehaving)).unwrap();

        let exposition = gatherer.gather().await;

        assert!(exposition.body.is_empty());
        assert_eq!(exposition.errors.len(), 1);
        assert!(exposition.errors[0].contains("channel_current"));
        assert!(exposition.errors[0].contains("not described"));
    }

    #[test]
    fn test_descriptors_sorted() {
        let mut gatherer = Gatherer::new();
        gatherer.register(Arc::new(BuildInfoCollector::default())).unwrap();

        let names: Vec<_> = gatherer.descriptors().iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["nixos_channel_exporter_build_info"]);
    }
}
