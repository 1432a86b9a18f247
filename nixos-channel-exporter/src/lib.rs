//! Prometheus exporter for NixOS channel status.
//!
//! On every scrape the exporter asks the channel status server for the
//! current git revision of each channel listed in `channels.json` and
//! publishes the answers as metrics.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  nixos.org      │<────│ ChannelCollector│<────│   HTTP Server   │
//! │  git-revision   │     │  (fan-out/in)   │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Metrics
//!
//! - `channel_revision{channel,revision}` - always 1, labelled with the revision
//! - `channel_update_time{channel}` - Unix time of the last update, when known
//! - `channel_current{channel}` - 1 if the channel is expected to be current
//! - `channel_request_failures_total` - failed revision requests since start
//! - `nixos_channel_exporter_build_info{version}` - exporter version
//! - `process_*` - memory and start time of the exporter process
//!
//! # Usage
//!
//! ```bash
//! nixos-channel-exporter --channels channels.json --listen 0.0.0.0:9402
//! ```
//!
//! See [`config::ExporterConfig`] for the optional JSON5 configuration file.

pub mod collector;
pub mod config;
pub mod gather;
pub mod http;
pub mod metrics;

pub use collector::{
    BuildInfoCollector, ChannelCollector, CollectionOutcome, Collector, CollectorSettings,
    ProcessCollector,
};
pub use config::{ErrorHandling, ExporterConfig};
pub use gather::{GatherError, Gatherer};
pub use http::HttpServer;
pub use metrics::{Exposition, MetricDesc, Observation};
