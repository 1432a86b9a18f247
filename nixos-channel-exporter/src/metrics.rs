//! Metric descriptors, observations, and Prometheus text exposition.

use std::collections::BTreeMap;
use std::fmt::{self, Write};

/// Prometheus metric type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    /// Get the TYPE comment string for Prometheus exposition format.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

/// Static description of a metric: name, help text, type and label names.
#[derive(Debug, PartialEq, Eq)]
pub struct MetricDesc {
    /// Metric name as exposed.
    pub name: &'static str,
    /// Text of the HELP line.
    pub help: &'static str,
    /// Text of the TYPE line.
    pub kind: MetricKind,
    /// Label names, in exposition order.
    pub labels: &'static [&'static str],
}

impl fmt::Display for MetricDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Desc{{name: {:?}, kind: {}, labels: {:?}}}",
            self.name,
            self.kind.as_str(),
            self.labels
        )
    }
}

/// Revision of each channel, carried in the `revision` label.
pub static CHANNEL_REVISION: MetricDesc = MetricDesc {
    name: "channel_revision",
    help: "Synthetic information metric with labels for the current revision of a channel.",
    kind: MetricKind::Gauge,
    labels: &["channel", "revision"],
};

/// Last update of each channel, when the server reports it.
pub static CHANNEL_UPDATE_TIME: MetricDesc = MetricDesc {
    name: "channel_update_time",
    help: "The UNIX timestamp of when a channel was last updated.",
    kind: MetricKind::Gauge,
    labels: &["channel"],
};

/// Whether each channel is expected to be current.
pub static CHANNEL_CURRENT: MetricDesc = MetricDesc {
    name: "channel_current",
    help: "Reports whether or not a channel is expected to be current.",
    kind: MetricKind::Gauge,
    labels: &["channel"],
};

/// Cumulative failed revision requests.
pub static CHANNEL_REQUEST_FAILURES: MetricDesc = MetricDesc {
    name: "channel_request_failures_total",
    help: "Number of channel status requests which have failed.",
    kind: MetricKind::Counter,
    labels: &[],
};

/// Exporter version.
pub static BUILD_INFO: MetricDesc = MetricDesc {
    name: "nixos_channel_exporter_build_info",
    help: "A metric with a constant '1' value labeled by the exporter version.",
    kind: MetricKind::Gauge,
    labels: &["version"],
};

/// Resident memory of the exporter process.
pub static PROCESS_RESIDENT_MEMORY: MetricDesc = MetricDesc {
    name: "process_resident_memory_bytes",
    help: "Resident memory size in bytes.",
    kind: MetricKind::Gauge,
    labels: &[],
};

/// Virtual memory of the exporter process.
pub static PROCESS_VIRTUAL_MEMORY: MetricDesc = MetricDesc {
    name: "process_virtual_memory_bytes",
    help: "Virtual memory size in bytes.",
    kind: MetricKind::Gauge,
    labels: &[],
};

/// Start time of the exporter process.
pub static PROCESS_START_TIME: MetricDesc = MetricDesc {
    name: "process_start_time_seconds",
    help: "Start time of the process since unix epoch in seconds.",
    kind: MetricKind::Gauge,
    labels: &[],
};

/// A single data point for a described metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// The metric this sample belongs to.
    pub desc: &'static MetricDesc,
    /// Label values, in the order of `desc.labels`.
    pub label_values: Vec<String>,
    /// Sample value.
    pub value: f64,
}

/// One item emitted by a collector during a scrape.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// A valid data point.
    Sample(Sample),
    /// Marks that collecting `desc` failed; carries the reason.
    Invalid {
        desc: &'static MetricDesc,
        error: String,
    },
}

impl Observation {
    /// Build a sample observation.
    pub fn sample(desc: &'static MetricDesc, label_values: Vec<String>, value: f64) -> Self {
        debug_assert_eq!(
            desc.labels.len(),
            label_values.len(),
            "label cardinality mismatch for {}",
            desc.name
        );

        Observation::Sample(Sample {
            desc,
            label_values,
            value,
        })
    }

    /// Build an invalid-metric marker.
    pub fn invalid(desc: &'static MetricDesc, error: impl fmt::Display) -> Self {
        Observation::Invalid {
            desc,
            error: error.to_string(),
        }
    }

    /// The metric this observation is about.
    pub fn desc(&self) -> &'static MetricDesc {
        match self {
            Observation::Sample(sample) => sample.desc,
            Observation::Invalid { desc, .. } => desc,
        }
    }

    /// The sample, unless this is an invalid marker.
    pub fn as_sample(&self) -> Option<&Sample> {
        match self {
            Observation::Sample(sample) => Some(sample),
            Observation::Invalid { .. } => None,
        }
    }

    /// Whether this marks a failed collection.
    pub fn is_invalid(&self) -> bool {
        matches!(self, Observation::Invalid { .. })
    }
}

/// Rendered scrape: text exposition plus any collection errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exposition {
    /// Valid samples in Prometheus text format 0.0.4.
    pub body: String,
    /// One `error collecting metric ...` line per invalid marker.
    pub errors: Vec<String>,
}

impl Exposition {
    /// Whether any metric failed to collect.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Render observations in Prometheus exposition format.
///
/// Families are sorted by name and samples by label values so output is
/// stable regardless of the order in which collectors produced them.
pub fn render(observations: &[Observation]) -> Exposition {
    let mut families: BTreeMap<&str, (&MetricDesc, Vec<&Sample>)> = BTreeMap::new();
    let mut errors = Vec::new();

    for observation in observations {
        match observation {
            Observation::Sample(sample) => {
                families
                    .entry(sample.desc.name)
                    .or_insert_with(|| (sample.desc, Vec::new()))
                    .1
                    .push(sample);
            }
            Observation::Invalid { desc, error } => {
                errors.push(format!("error collecting metric {}: {}", desc, error));
            }
        }
    }

    let mut body = String::with_capacity(families.len() * 128);
    for (name, (desc, mut samples)) in families {
        samples.sort_by(|a, b| a.label_values.cmp(&b.label_values));

        writeln!(body, "# HELP {} {}", name, escape_help(desc.help)).ok();
        writeln!(body, "# TYPE {} {}", name, desc.kind.as_str()).ok();

        for sample in samples {
            writeln!(
                body,
                "{}{} {}",
                name,
                format_labels(desc.labels, &sample.label_values),
                format_value(sample.value)
            )
            .ok();
        }
    }

    Exposition { body, errors }
}

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Escape HELP text; quotes are allowed there.
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

/// Format label pairs for Prometheus exposition format.
fn format_labels(names: &[&str], values: &[String]) -> String {
    if names.is_empty() {
        return String::new();
    }

    let parts: Vec<String> = names
        .iter()
        .zip(values)
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();

    format!("{{{}}}", parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revision(channel: &str, rev: &str) -> Observation {
        Observation::sample(
            &CHANNEL_REVISION,
            vec![channel.to_string(), rev.to_string()],
            1.0,
        )
    }

    #[test]
    fn test_render_revision_sample() {
        let exposition = render(&[revision("nixos-unstable", "abc123")]);

        assert!(
            exposition
                .body
                .contains("# TYPE channel_revision gauge\n")
        );
        assert!(exposition.body.contains(
            "channel_revision{channel=\"nixos-unstable\",revision=\"abc123\"} 1\n"
        ));
        assert!(!exposition.has_errors());
    }

    #[test]
    fn test_render_groups_and_sorts() {
        let observations = vec![
            Observation::sample(&CHANNEL_CURRENT, vec!["b".to_string()], 0.0),
            revision("b", "2"),
            Observation::sample(&CHANNEL_CURRENT, vec!["a".to_string()], 1.0),
            revision("a", "1"),
        ];

        let body = render(&observations).body;
        let lines: Vec<&str> = body.lines().filter(|l| !l.starts_with('#')).collect();

        assert_eq!(
            lines,
            vec![
                "channel_current{channel=\"a\"} 1",
                "channel_current{channel=\"b\"} 0",
                "channel_revision{channel=\"a\",revision=\"1\"} 1",
                "channel_revision{channel=\"b\",revision=\"2\"} 1",
            ]
        );
        assert_eq!(body.matches("# TYPE channel_current gauge").count(), 1);
    }

    #[test]
    fn test_render_unlabelled_counter() {
        let body = render(&[Observation::sample(&CHANNEL_REQUEST_FAILURES, vec![], 3.0)]).body;

        assert!(body.contains("# TYPE channel_request_failures_total counter\n"));
        assert!(body.contains("\nchannel_request_failures_total 3\n"));
    }

    #[test]
    fn test_render_invalid_marker() {
        let observations = vec![
            revision("a", "1"),
            Observation::invalid(&CHANNEL_REVISION, "failed to fetch channel \"b\""),
        ];

        let exposition = render(&observations);

        assert!(exposition.has_errors());
        assert_eq!(exposition.errors.len(), 1);
        assert!(exposition.errors[0].starts_with("error collecting metric Desc{name: \"channel_revision\""));
        assert!(exposition.errors[0].ends_with("failed to fetch channel \"b\""));
        // Valid samples are still rendered.
        assert!(exposition.body.contains("revision=\"1\""));
    }

    #[test]
    fn test_observation_accessors() {
        let sample = revision("a", "1");
        let invalid = Observation::invalid(&CHANNEL_REVISION, "boom");

        assert!(sample.as_sample().is_some());
        assert!(!sample.is_invalid());
        assert!(invalid.is_invalid());
        assert_eq!(invalid.desc().name, "channel_revision");
    }

    #[test]
    fn test_escape_label_value() {
        assert_eq!(escape_label_value("simple"), "simple");
        assert_eq!(escape_label_value("with\"quote"), "with\\\"quote");
        assert_eq!(escape_label_value("with\\backslash"), "with\\\\backslash");
        assert_eq!(escape_label_value("with\nnewline"), "with\\nnewline");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(1.0), "1");
        assert_eq!(format_value(1_700_000_000.0), "1700000000");
        assert_eq!(format_value(0.5), "0.5");
        assert_eq!(format_value(f64::NAN), "NaN");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
        assert_eq!(format_value(f64::NEG_INFINITY), "-Inf");
    }
}
