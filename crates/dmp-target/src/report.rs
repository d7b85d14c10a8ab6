//! Statistics reports
//!
//! Two renderings of a [`StatsSnapshot`]:
//!
//! - the plain text report published at the well-known stats path
//!   (`Display` / [`StatsSnapshot::render`])
//! - Prometheus text format ([`PrometheusExporter`])
//!
//! # Prometheus Metrics
//!
//! - `dmp_read_requests_total` - Read requests seen
//! - `dmp_read_bytes_total` - Bytes requested by reads
//! - `dmp_write_requests_total` - Write requests seen
//! - `dmp_write_bytes_total` - Bytes carried by writes
//! - `dmp_requests_total` - All accounted requests
//! - `dmp_bytes_total` - Bytes across all accounted requests
//! - `dmp_avg_request_size_bytes` - Average request size per class

use std::fmt::{self, Write};

use crate::stats::StatsSnapshot;

impl StatsSnapshot {
    /// Render the text report
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let classes = [
            ("read", self.read_reqs, self.avg_read_size()),
            ("write", self.write_reqs, self.avg_write_size()),
            ("total", self.total_reqs, self.avg_total_size()),
        ];
        for (class, reqs, avg_size) in classes {
            writeln!(f, "{class}:")?;
            writeln!(f, "\treqs: {reqs}")?;
            writeln!(f, "\tavg size: {avg_size}")?;
        }
        Ok(())
    }
}

/// Prometheus text format exporter
#[derive(Debug)]
pub struct PrometheusExporter {
    /// Metrics prefix (e.g., "dmp")
    prefix: String,
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new("dmp")
    }
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter with the given prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Export a snapshot in Prometheus text format
    pub fn export(&self, snapshot: &StatsSnapshot) -> String {
        let mut output = String::with_capacity(2 * 1024);

        let counters = [
            ("read_requests_total", "Read requests seen", snapshot.read_reqs),
            ("read_bytes_total", "Bytes requested by reads", snapshot.read_bytes),
            ("write_requests_total", "Write requests seen", snapshot.write_reqs),
            ("write_bytes_total", "Bytes carried by writes", snapshot.write_bytes),
            ("requests_total", "All accounted requests", snapshot.total_reqs),
            ("bytes_total", "Bytes across all accounted requests", snapshot.total_bytes),
        ];
        for (name, help, value) in counters {
            self.write_help(&mut output, name, help);
            self.write_type(&mut output, name, "counter");
            self.write_metric(&mut output, name, value);
        }

        let name = "avg_request_size_bytes";
        self.write_help(&mut output, name, "Average request size per class");
        self.write_type(&mut output, name, "gauge");
        for (class, value) in [
            ("read", snapshot.avg_read_size()),
            ("write", snapshot.avg_write_size()),
            ("total", snapshot.avg_total_size()),
        ] {
            self.write_metric_with_labels(&mut output, name, value, &[("class", class)]);
        }

        output
    }

    fn write_help(&self, output: &mut String, name: &str, help: &str) {
        let _ = writeln!(output, "# HELP {}_{} {}", self.prefix, name, help);
    }

    fn write_type(&self, output: &mut String, name: &str, metric_type: &str) {
        let _ = writeln!(output, "# TYPE {}_{} {}", self.prefix, name, metric_type);
    }

    fn write_metric(&self, output: &mut String, name: &str, value: u64) {
        let _ = writeln!(output, "{}_{} {}", self.prefix, name, value);
    }

    fn write_metric_with_labels(
        &self,
        output: &mut String,
        name: &str,
        value: u64,
        labels: &[(&str, &str)],
    ) {
        let labels_str: Vec<String> = labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
            .collect();
        let _ = writeln!(
            output,
            "{}_{}{{{}}} {}",
            self.prefix,
            name,
            labels_str.join(","),
            value
        );
    }
}

/// Escape special characters in Prometheus label values
fn escape_label_value(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
