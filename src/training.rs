//! Training Loop and Optimization for the Denoiser
//!
//! Provides training infrastructure for [`DenoiserModel`]:
//! - Cosine decay learning rate with warm restarts
//! - AdamW without weight decay, created after the first forward pass
//! - Training epochs alternating with evaluation passes
//! - Tensorboard logging of the loss and every tracked metric

use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::config::DenoiserConfig;
use crate::dataset::{DataLoader, DenoiserDataset, LoaderOptions};
use crate::error::DenoiserError;
use crate::metrics::{MetricsCollector, MetricsLogger};
use crate::model::{Batch, DenoiserModel, Mode, ModelOutput};
use crate::training_feature::MetricValue;
use crate::DenoiserResult;

// ═══════════════════════════════════════════════════════════════════════════
// TRAINING CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════

/// Schedule and loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Peak learning rate
    pub learning_rate: f64,
    /// Length of the first cosine period in steps
    pub first_decay_steps: usize,
    /// Growth of every following period
    pub t_mul: f64,
    /// Peak decay after every restart
    pub m_mul: f64,
    /// Floor of the schedule as a fraction of the peak
    pub alpha: f64,
    /// Total number of training epochs
    pub train_epochs: usize,
    /// Training epochs between evaluations
    pub validation_interval: usize,
    /// Log frequency (steps)
    pub log_every: usize,
    /// Seed of the data pipeline
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            first_decay_steps: 1000,
            t_mul: 1.3,
            m_mul: 0.8,
            alpha: 0.01,
            train_epochs: 10_000,
            validation_interval: 1,
            log_every: 100,
            seed: 0,
        }
    }
}

impl TrainingConfig {
    /// Defaults with the learning rate of `config`
    pub fn from_denoiser_config(config: &DenoiserConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            ..Default::default()
        }
    }

    /// A few epochs, for smoke tests
    pub fn quick() -> Self {
        Self {
            train_epochs: 2,
            validation_interval: 1,
            log_every: 1,
            ..Default::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LEARNING RATE SCHEDULER
// ═══════════════════════════════════════════════════════════════════════════

/// Cosine decay with warm restarts.
///
/// ```text
/// f = step / first
/// i = ⌊ln(1 − f(1 − t)) / ln t⌋        (i = ⌊f⌋ when t = 1)
/// f = (f − (1 − tⁱ)/(1 − t)) / tⁱ
/// lr = base · ((1 − α) · ½ · mⁱ · (1 + cos πf) + α)
/// ```
#[derive(Debug, Clone)]
pub struct CosineDecayRestarts {
    base_lr: f64,
    first_decay_steps: usize,
    t_mul: f64,
    m_mul: f64,
    alpha: f64,
    current_step: usize,
}

impl CosineDecayRestarts {
    pub fn new(config: &TrainingConfig) -> Self {
        Self {
            base_lr: config.learning_rate,
            first_decay_steps: config.first_decay_steps.max(1),
            t_mul: config.t_mul,
            m_mul: config.m_mul,
            alpha: config.alpha,
            current_step: 0,
        }
    }

    /// Learning rate at `step`
    pub fn lr_at(&self, step: usize) -> f64 {
        let mut fraction = step as f64 / self.first_decay_steps as f64;
        let restart = if (self.t_mul - 1.0).abs() < f64::EPSILON {
            let restart = fraction.floor();
            fraction -= restart;
            restart
        } else {
            let restart = ((1.0 - fraction * (1.0 - self.t_mul)).ln() / self.t_mul.ln()).floor();
            let completed = (1.0 - self.t_mul.powf(restart)) / (1.0 - self.t_mul);
            fraction = (fraction - completed) / self.t_mul.powf(restart);
            restart
        };
        let cosine = 0.5 * self.m_mul.powf(restart) * (1.0 + (std::f64::consts::PI * fraction).cos());
        self.base_lr * ((1.0 - self.alpha) * cosine + self.alpha)
    }

    pub fn get_lr(&self) -> f64 {
        self.lr_at(self.current_step)
    }

    pub fn step(&mut self) {
        self.current_step += 1;
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn reset(&mut self) {
        self.current_step = 0;
    }

    /// Continue the schedule from `step`
    pub fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// EVALUATION SUMMARY
// ═══════════════════════════════════════════════════════════════════════════

/// Means over one evaluation pass
#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    pub loss: f64,
    pub metrics: Vec<(String, f64)>,
    pub batches: usize,
}

// ═══════════════════════════════════════════════════════════════════════════
// TRAINER
// ═══════════════════════════════════════════════════════════════════════════

pub struct Trainer {
    model: DenoiserModel,
    /// Created once the first forward pass materialized every variable
    optimizer: Option<AdamW>,
    optimizer_variables: usize,
    scheduler: CosineDecayRestarts,
    config: TrainingConfig,
    training_logger: MetricsLogger,
    validation_logger: MetricsLogger,
    global_step: usize,
}

impl Trainer {
    pub fn new(model: DenoiserModel, config: TrainingConfig) -> Self {
        let scheduler = CosineDecayRestarts::new(&config);
        Self {
            model,
            optimizer: None,
            optimizer_variables: 0,
            scheduler,
            config,
            training_logger: MetricsLogger::disabled(),
            validation_logger: MetricsLogger::disabled(),
            global_step: 0,
        }
    }

    /// Tensorboard logs under `<model_directory>/{training,validation}`
    pub fn with_loggers(mut self, denoiser_config: &DenoiserConfig) -> DenoiserResult<Self> {
        let directory = &denoiser_config.model_directory;
        self.training_logger = MetricsLogger::new(directory.join("training"))?;
        self.validation_logger = MetricsLogger::new(directory.join("validation"))?;
        Ok(self)
    }

    /// Continue a run that already took `step` steps
    pub fn resume_from(mut self, step: usize) -> Self {
        self.global_step = step;
        self.scheduler.set_step(step);
        self
    }

    fn optimizer(&mut self) -> DenoiserResult<&mut AdamW> {
        let variables = self.model.varmap().all_vars();
        if self.optimizer.is_none() || variables.len() != self.optimizer_variables {
            if self.optimizer.is_some() {
                log::warn!(
                    "Variable count changed from {} to {}, resetting optimizer state",
                    self.optimizer_variables,
                    variables.len()
                );
            }
            self.optimizer_variables = variables.len();
            let params = ParamsAdamW {
                lr: self.scheduler.get_lr(),
                weight_decay: 0.0,
                ..Default::default()
            };
            self.optimizer = Some(AdamW::new(variables, params)?);
        }
        self.optimizer
            .as_mut()
            .ok_or_else(|| DenoiserError::configuration("optimizer unavailable"))
    }

    fn loss_output(output: ModelOutput) -> DenoiserResult<(Tensor, Vec<(String, MetricValue)>)> {
        match output {
            ModelOutput::Loss { loss, metrics } => Ok((loss, metrics)),
            ModelOutput::Predictions(_) => Err(DenoiserError::configuration("expected a loss from the model")),
        }
    }

    /// Whether `step` writes to the training log
    fn is_logging_step(&self, step: usize) -> bool {
        self.training_logger.is_enabled() && self.config.log_every > 0 && step % self.config.log_every == 0
    }

    /// Single training step
    ///
    /// Tracked metrics are only computed on logging steps.
    pub fn train_step(&mut self, batch: &Batch) -> DenoiserResult<f64> {
        let start = Instant::now();
        let step = self.global_step + 1;

        let (loss, _) = Self::loss_output(self.model.run(batch, Mode::Train)?)?;
        let loss_value = loss.to_scalar::<f32>()? as f64;
        if !loss_value.is_finite() {
            log::warn!("Non-finite loss {} at step {}", loss_value, step);
        }
        let metrics = if self.is_logging_step(step) {
            self.model.metrics(batch)?
        } else {
            Vec::new()
        };

        let grads = loss.backward()?;
        let lr = self.scheduler.get_lr();
        let optimizer = self.optimizer()?;
        optimizer.set_learning_rate(lr);
        optimizer.step(&grads)?;

        self.scheduler.step();
        self.global_step = step;

        if self.is_logging_step(step) {
            let batch_size = batch.values().next().map(|t| t.dim(0)).transpose()?.unwrap_or(0);
            self.training_logger.log_scalars(
                &[("loss", loss_value), ("learning_rate", lr), ("batch_size", batch_size as f64)],
                step,
            )?;
            self.training_logger.log_metrics(&metrics, step)?;
            log::debug!(
                "Step {}: loss={:.6}, lr={:.2e}, {:.1}ms",
                step,
                loss_value,
                lr,
                start.elapsed().as_secs_f64() * 1000.0
            );
        }
        Ok(loss_value)
    }

    /// Train over every batch of `data`; mean loss, `None` for no batches
    pub fn train_epoch<I>(&mut self, data: I) -> DenoiserResult<Option<f64>>
    where
        I: Iterator<Item = DenoiserResult<Batch>>,
    {
        let mut total_loss = 0.0;
        let mut n_batches = 0;
        for batch in data {
            total_loss += self.train_step(&batch?)?;
            n_batches += 1;
        }
        if n_batches > 0 {
            Ok(Some(total_loss / n_batches as f64))
        } else {
            Ok(None)
        }
    }

    /// Loss and metric means over `data`, no parameter updates
    pub fn evaluate<I>(&mut self, data: I) -> DenoiserResult<EvaluationSummary>
    where
        I: Iterator<Item = DenoiserResult<Batch>>,
    {
        let mut collector = MetricsCollector::new();
        let mut batches = 0;
        for batch in data {
            let (loss, metrics) = Self::loss_output(self.model.run(&batch?, Mode::Evaluate)?)?;
            collector.record("loss", loss.to_scalar::<f32>()? as f64);
            collector.record_metrics(&metrics);
            batches += 1;
        }
        let loss = collector.mean("loss").unwrap_or(0.0);
        let metrics = collector.means();
        for (name, value) in &metrics {
            self.validation_logger.log_scalar(name, *value, self.global_step)?;
        }
        self.validation_logger.flush()?;
        Ok(EvaluationSummary { loss, metrics, batches })
    }

    /// Alternate `validation_interval` training epochs with one evaluation
    /// until `train_epochs` are consumed
    pub fn fit(
        &mut self,
        denoiser_config: &DenoiserConfig,
        training: &DenoiserDataset,
        validation: &DenoiserDataset,
    ) -> DenoiserResult<Vec<EvaluationSummary>> {
        let passes = self.model.passes();
        let device = self.model.device().clone();
        let mut summaries = Vec::new();
        let mut remaining = self.config.train_epochs;
        let mut epoch = 0u64;

        while remaining > 0 {
            let epochs = self.config.validation_interval.max(1).min(remaining);
            for _ in 0..epochs {
                let options = LoaderOptions::training(denoiser_config, self.config.seed.wrapping_add(epoch));
                let loader = DataLoader::new(training.clone(), passes.clone(), options, device.clone());
                let start = Instant::now();
                let loss = self.train_epoch(loader)?;
                epoch += 1;
                log::info!(
                    "Epoch {}: mean loss {:.6} ({} steps, {:.1}s)",
                    epoch,
                    loss.unwrap_or(f64::NAN),
                    self.global_step,
                    start.elapsed().as_secs_f64()
                );
            }
            self.training_logger.flush()?;

            let options = LoaderOptions::evaluation(denoiser_config, self.config.seed);
            let loader = DataLoader::new(validation.clone(), passes.clone(), options, device.clone());
            let summary = self.evaluate(loader)?;
            log::info!("Validation after epoch {}: loss {:.6}", epoch, summary.loss);
            summaries.push(summary);

            remaining -= epochs;
        }
        Ok(summaries)
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn scheduler(&self) -> &CosineDecayRestarts {
        &self.scheduler
    }

    pub fn model(&self) -> &DenoiserModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut DenoiserModel {
        &mut self.model
    }

    pub fn into_model(self) -> DenoiserModel {
        self.model
    }
}
