//! Results file and throughput tracking.
//!
//! The results file is a JSON document of the form
//! `{"results": {"metrics": [...], "parameters": {...}}}`. Every write
//! reads the current file, merges the new data under its key (lists are
//! extended, objects are updated) and writes it back.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Metric {
    #[serde(rename = "MetricName")]
    pub name: String,
    #[serde(rename = "MeasuredValue")]
    pub value: f64,
    pub units: String,
    /// Unix time in milliseconds.
    pub timestamp: u64,
    pub additional_data: Value,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64, units: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            units: units.into(),
            timestamp: unix_ms(),
            additional_data: Value::Null,
        }
    }

    pub fn with_additional_data(mut self, data: Value) -> Self {
        self.additional_data = data;
        self
    }
}

pub struct MetricsFile {
    path: PathBuf,
}

impl MetricsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store_metrics(&self, metrics: &[Metric]) -> Result<()> {
        self.update("metrics", serde_json::to_value(metrics)?)
    }

    pub fn store_parameters(&self, parameters: Map<String, Value>) -> Result<()> {
        self.update("parameters", Value::Object(parameters))
    }

    pub fn read(&self) -> Result<Value> {
        if !self.path.exists() {
            return Ok(Value::Object(Map::new()));
        }
        let blob = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read results file {}", self.path.display()))?;
        if blob.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        serde_json::from_str(&blob)
            .with_context(|| format!("results file {} is not valid JSON", self.path.display()))
    }

    fn update(&self, key: &str, data: Value) -> Result<()> {
        let mut document = match self.read()? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        debug!(path = %self.path.display(), key, "updating results file");

        // Data lives under the first top-level entry when the file has one.
        let section = match document.keys().next().cloned() {
            Some(first) => document.entry(first),
            None => document.entry("results"),
        }
        .or_insert_with(|| Value::Object(Map::new()));
        if !section.is_object() {
            *section = Value::Object(Map::new());
        }
        if let Value::Object(results) = section {
            merge(results.entry(key.to_string()).or_insert(Value::Null), data);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&Value::Object(document))?)
            .with_context(|| format!("failed to write results file {}", self.path.display()))
    }
}

fn merge(current: &mut Value, data: Value) {
    match (current, data) {
        (Value::Array(existing), Value::Array(new)) => existing.extend(new),
        (Value::Object(existing), Value::Object(new)) => existing.extend(new),
        (slot, data) => *slot = data,
    }
}

pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Throughput over a moving window of the most recent steps.
#[derive(Debug)]
pub struct Throughput {
    units_per_step: f64,
    window_size: usize,
    window: VecDeque<Duration>,
    window_time: Duration,
    last: Instant,
}

impl Throughput {
    pub fn new(units_per_step: usize, window_size: usize) -> Self {
        Self {
            units_per_step: units_per_step as f64,
            window_size: window_size.max(1),
            window: VecDeque::new(),
            window_time: Duration::ZERO,
            last: Instant::now(),
        }
    }

    /// Closes the step that started at the previous call and returns units
    /// per second over the window.
    pub fn step(&mut self) -> f64 {
        let now = Instant::now();
        self.record(now - self.last);
        self.last = now;
        self.current()
    }

    pub fn record(&mut self, step_time: Duration) {
        self.window.push_back(step_time);
        self.window_time += step_time;
        if self.window.len() > self.window_size {
            if let Some(oldest) = self.window.pop_front() {
                self.window_time -= oldest;
            }
        }
    }

    pub fn current(&self) -> f64 {
        let secs = self.window_time.as_secs_f64();
        if secs > 0.0 {
            self.window.len() as f64 * self.units_per_step / secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use serde_json::json;

    #[test]
    fn metrics_and_parameters_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let file = MetricsFile::new(dir.path().join("results.json"));

        file.store_metrics(&[Metric::new("latency", 12.5, "ms")]).unwrap();
        file.store_metrics(&[Metric::new("throughput", 300.0, "tokens/s")
            .with_additional_data(json!({"bucket": 64}))])
            .unwrap();
        let mut params = Map::new();
        params.insert("tp_degree".into(), json!(4));
        file.store_parameters(params).unwrap();

        let doc = file.read().unwrap();
        let metrics = doc["results"]["metrics"].as_array().unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0]["MetricName"], "latency");
        assert_eq!(metrics[1]["AdditionalData"]["bucket"], 64);
        assert_eq!(doc["results"]["parameters"]["tp_degree"], 4);
    }

    #[test]
    fn existing_named_section_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        fs::write(&path, r#"{"sampling": {"metrics": [{"MetricName": "old"}]}}"#).unwrap();

        MetricsFile::new(&path)
            .store_metrics(&[Metric::new("new", 1.0, "count")])
            .unwrap();
        let doc = MetricsFile::new(&path).read().unwrap();
        assert_eq!(doc["sampling"]["metrics"].as_array().unwrap().len(), 2);
        assert!(doc.get("results").is_none());
    }

    #[test]
    fn throughput_uses_a_moving_window() {
        let mut throughput = Throughput::new(2, 2);
        throughput.record(Duration::from_millis(1000));
        assert_abs_diff_eq!(throughput.current(), 2.0, epsilon = 1e-9);
        throughput.record(Duration::from_millis(500));
        throughput.record(Duration::from_millis(500));
        // the 1s step left the window
        assert_abs_diff_eq!(throughput.current(), 4.0, epsilon = 1e-9);
    }
}
