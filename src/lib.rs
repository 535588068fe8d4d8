//! # Deep Denoiser
//!
//! Kernel-predicting, multiscale denoiser for the light-transport passes of
//! a physically based renderer.
//!
//! ## Features
//! - Per-pass standardization (signed log1p) and local variance side channels
//! - Tiramisu and U-Net multiscale backbones
//! - Per-pixel kernel prediction composed coarse-to-fine
//! - Mean, gradient and MS-SSIM losses, masked or not, on base, combined
//!   material and combined image features
//! - Augmented, shuffled batches produced on a background thread
//! - Tensorboard logging and safetensors checkpoints
//!
//! ## Architecture
//!
//! ```text
//! noisy passes → standardize (+variance) → backbone ─┬─ scale 0 ─┐
//!                                                    ├─ scale 1 ─┤ kernel prediction
//!                                                    └─ scale n ─┘        │
//!                                     invert standardization ← compose scales
//!                                                    │
//!                                    predictions → loss / metrics
//! ```

// Render passes and configuration
pub mod config;
pub mod error;
pub mod naming;
pub mod render_passes;

// Per-pass preprocessing
pub mod feature_flags;
pub mod loss_difference;
pub mod prediction_feature;
pub mod standardization;
pub mod variance;

// Network
pub mod backbone;
pub mod kernel_prediction;
pub mod model;
pub mod multiscale;

// Losses and metrics
pub mod ssim;
pub mod training_feature;

// Data pipeline
pub mod augmentation;
pub mod dataset;

// Training infrastructure
pub mod checkpoint;
pub mod metrics;
pub mod training;


pub use checkpoint::{checkpoint_exists, load_checkpoint, load_weights, save_checkpoint, CheckpointMetadata};
pub use config::{Architecture, DenoiserConfig, FeatureConfig, LossWeights, NeuralNetworkConfig, Statistics};
pub use dataset::{stack_examples, DataLoader, DenoiserDataset, Example, LoaderOptions, Split};
pub use error::DenoiserError;
pub use loss_difference::LossDifference;
pub use metrics::{MetricsCollector, MetricsLogger};
pub use model::{Batch, DenoiserModel, Mode, ModelOutput};
pub use render_passes::{compose_image, RenderPass};
pub use training::{CosineDecayRestarts, EvaluationSummary, Trainer, TrainingConfig};
pub use training_feature::{MetricValue, TrainingFeatureSet};

/// Result type for denoiser operations
pub type DenoiserResult<T> = Result<T, DenoiserError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        // Configuration
        DenoiserConfig,
        FeatureConfig,
        LossDifference,
        RenderPass,

        // Model
        Batch,
        DenoiserModel,
        Mode,
        ModelOutput,

        // Data
        DataLoader,
        DenoiserDataset,
        LoaderOptions,

        // Training types
        CosineDecayRestarts,
        Trainer,
        TrainingConfig,

        // Result type
        DenoiserError,
        DenoiserResult,
    };
}
