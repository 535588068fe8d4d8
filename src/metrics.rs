//! # Training Metrics and Logging
//!
//! Tensorboard logging of the loss, the learning rate and every tracked
//! feature metric, plus running means for evaluation passes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use deep_denoiser::metrics::MetricsLogger;
//!
//! let mut logger = MetricsLogger::new("./models/run/training")?;
//! logger.log_scalar("loss", 0.25, 100)?;
//! logger.log_metrics(&metrics, 100)?;
//! logger.flush()?;
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tensorboard_rs::summary_writer::SummaryWriter;

use crate::training_feature::MetricValue;
use crate::DenoiserResult;

/// Metrics logger with Tensorboard support
pub struct MetricsLogger {
    writer: Option<SummaryWriter>,
    log_dir: PathBuf,
    enabled: bool,
}

impl MetricsLogger {
    /// Create a new metrics logger
    ///
    /// Creates a timestamped subdirectory for this run.
    pub fn new(log_dir: impl AsRef<Path>) -> DenoiserResult<Self> {
        let log_dir = log_dir.as_ref();

        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let run_dir = log_dir.join(format!("run_{}", timestamp));
        fs::create_dir_all(&run_dir)?;

        let writer = SummaryWriter::new(&run_dir);

        log::info!("Tensorboard logs: {:?}", run_dir);
        log::info!("View with: tensorboard --logdir {:?}", log_dir);

        Ok(Self {
            writer: Some(writer),
            log_dir: run_dir,
            enabled: true,
        })
    }

    /// Create a disabled logger
    pub fn disabled() -> Self {
        Self {
            writer: None,
            log_dir: PathBuf::new(),
            enabled: false,
        }
    }

    pub fn log_scalar(&mut self, tag: &str, value: f64, step: usize) -> DenoiserResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(ref mut writer) = self.writer {
            writer.add_scalar(tag, value as f32, step);
        }
        Ok(())
    }

    pub fn log_scalars(&mut self, values: &[(&str, f64)], step: usize) -> DenoiserResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(ref mut writer) = self.writer {
            for (tag, value) in values {
                writer.add_scalar(tag, *value as f32, step);
            }
        }
        Ok(())
    }

    /// Log a histogram of values
    ///
    /// tensorboard-rs 0.5 has no histogram summaries, the mean is logged as
    /// `<tag>_mean` instead.
    pub fn log_histogram(&mut self, tag: &str, values: &[f64], step: usize) -> DenoiserResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if !values.is_empty() {
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            self.log_scalar(&format!("{}_mean", tag), mean, step)?;
        }
        Ok(())
    }

    /// Log tracked feature metrics
    pub fn log_metrics(&mut self, metrics: &[(String, MetricValue)], step: usize) -> DenoiserResult<()> {
        if !self.enabled {
            return Ok(());
        }
        for (tag, value) in metrics {
            match value {
                MetricValue::Scalar(value) => self.log_scalar(tag, *value, step)?,
                MetricValue::Histogram(values) => self.log_histogram(tag, values, step)?,
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> DenoiserResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(ref mut writer) = self.writer {
            writer.flush();
        }
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Drop for MetricsLogger {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.flush();
        }
    }
}

/// Running means over an evaluation pass
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    sums: BTreeMap<String, f64>,
    counts: BTreeMap<String, usize>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: &str, value: f64) {
        *self.sums.entry(name.to_string()).or_insert(0.0) += value;
        *self.counts.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Record scalars as they are, histograms by their mean
    pub fn record_metrics(&mut self, metrics: &[(String, MetricValue)]) {
        for (name, value) in metrics {
            match value {
                MetricValue::Scalar(value) => self.record(name, *value),
                MetricValue::Histogram(values) if !values.is_empty() => {
                    let mean = values.iter().sum::<f64>() / values.len() as f64;
                    self.record(&format!("{}_mean", name), mean);
                }
                MetricValue::Histogram(_) => {}
            }
        }
    }

    pub fn mean(&self, name: &str) -> Option<f64> {
        let count = *self.counts.get(name)?;
        if count == 0 {
            return None;
        }
        self.sums.get(name).map(|sum| sum / count as f64)
    }

    /// Every running mean, sorted by name
    pub fn means(&self) -> Vec<(String, f64)> {
        self.sums
            .keys()
            .filter_map(|name| self.mean(name).map(|mean| (name.clone(), mean)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn clear(&mut self) {
        self.sums.clear();
        self.counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_means() {
        let mut collector = MetricsCollector::new();
        collector.record("loss", 1.0);
        collector.record("loss", 3.0);
        collector.record_metrics(&[
            ("diffuse_color/mean".to_string(), MetricValue::Scalar(0.5)),
            ("diffuse_color/difference".to_string(), MetricValue::Histogram(vec![1.0, 2.0, 3.0])),
        ]);

        assert_eq!(collector.mean("loss"), Some(2.0));
        assert_eq!(collector.mean("diffuse_color/difference_mean"), Some(2.0));
        assert_eq!(collector.means().len(), 3);
        assert_eq!(collector.mean("missing"), None);

        collector.clear();
        assert!(collector.is_empty());
    }

    #[test]
    fn test_metrics_logger_disabled() {
        let mut logger = MetricsLogger::disabled();
        assert!(!logger.is_enabled());

        logger.log_scalar("test", 1.0, 0).unwrap();
        logger
            .log_metrics(&[("test/histogram".to_string(), MetricValue::Histogram(vec![1.0]))], 0)
            .unwrap();
        logger.flush().unwrap();
    }

    #[test]
    fn test_metrics_logger_creates_run_directory() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut logger = MetricsLogger::new(temp_dir.path()).unwrap();
        logger.log_scalars(&[("loss", 0.5), ("learning_rate", 1e-3)], 1).unwrap();
        logger.flush().unwrap();
        assert!(logger.log_dir().starts_with(temp_dir.path()));
        assert!(logger.log_dir().exists());
    }
}
