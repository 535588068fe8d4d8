//! # Dataset Loading
//!
//! Examples are `.safetensors` files holding `"<pass>/source/<i>"` tensors
//! `[C, H, W]` for every noisy realization and `"<pass>/target"` for target
//! passes. A split lives in `<base>/<split>/` next to `<base>/<split>.json`
//! with its [`DatasetStatistics`].
//!
//! ## Pipeline
//!
//! ```text
//! load ─▶ select source index tuple ─▶ augment (rayon) ─▶ shuffle buffer ─▶ stack ─▶ prefetch
//! ```
//!
//! ```rust,ignore
//! let dataset = DenoiserDataset::from_split(&config, Split::Training)?;
//! let loader = DataLoader::new(dataset, passes, LoaderOptions::training(&config, seed), device);
//! for batch in loader {
//!     let batch = batch?;
//! }
//! ```

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver};
use std::thread::JoinHandle;

use crate::augmentation::{augment, AugmentationChoice};
use crate::config::{DataAugmentationConfig, DatasetStatistics, DenoiserConfig};
use crate::error::DenoiserError;
use crate::model::Batch;
use crate::naming;
use crate::render_passes::RenderPass;
use crate::DenoiserResult;

/// Named tensors of one example, `[C, H, W]`
pub type Example = BTreeMap<String, Tensor>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Training,
    Validation,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Training => "training",
            Split::Validation => "validation",
        }
    }
}

/// Source indices to feed per sample.
///
/// With one source per target every realization is used once per complete
/// set; the remainder is drawn at random. Larger tuples hold unique indices.
pub fn source_index_tuples<R: Rng + ?Sized>(
    rng: &mut R,
    number_of_sources_per_example: usize,
    number_of_source_index_tuples: usize,
    number_of_sources_per_target: usize,
) -> DenoiserResult<Vec<Vec<usize>>> {
    if number_of_sources_per_example < number_of_sources_per_target {
        return Err(DenoiserError::configuration(format!(
            "source index tuples need {} unique indices but examples only have {} sources",
            number_of_sources_per_target, number_of_sources_per_example
        )));
    }
    if number_of_sources_per_target == 0 {
        return Err(DenoiserError::configuration("number_of_sources_per_target must be positive"));
    }

    let mut tuples = Vec::with_capacity(number_of_source_index_tuples);
    if number_of_sources_per_target == 1 {
        let complete_sets = number_of_source_index_tuples / number_of_sources_per_example;
        let remaining = number_of_source_index_tuples % number_of_sources_per_example;
        for _ in 0..complete_sets {
            tuples.extend((0..number_of_sources_per_example).map(|index| vec![index]));
        }
        for _ in 0..remaining {
            tuples.push(vec![rng.gen_range(0..number_of_sources_per_example)]);
        }
    } else {
        let indices: Vec<usize> = (0..number_of_sources_per_example).collect();
        for _ in 0..number_of_source_index_tuples {
            tuples.push(
                indices
                    .choose_multiple(rng, number_of_sources_per_target)
                    .copied()
                    .collect(),
            );
        }
    }
    Ok(tuples)
}

/// Renumber the sources of `tuple` to `0..tuple.len()`, keeping targets
pub fn select_sources(example: &Example, tuple: &[usize], passes: &[RenderPass]) -> DenoiserResult<Example> {
    let mut selected = Example::new();
    for &pass in passes {
        for (position, &index) in tuple.iter().enumerate() {
            let name = naming::source_feature_name(pass, index);
            let source = example
                .get(&name)
                .ok_or_else(|| DenoiserError::configuration(format!("example has no tensor '{}'", name)))?;
            selected.insert(naming::source_feature_name(pass, position), source.clone());
        }
        let target = naming::target_feature_name(pass);
        if let Some(tensor) = example.get(&target) {
            selected.insert(target, tensor.clone());
        }
    }
    Ok(selected)
}

#[derive(Debug, Clone)]
enum ExampleSource {
    Files(Vec<PathBuf>),
    Memory(Vec<Example>),
}

/// The examples of one split
#[derive(Debug, Clone)]
pub struct DenoiserDataset {
    source: ExampleSource,
    number_of_sources_per_example: usize,
    tiles_height_width: Option<usize>,
}

impl DenoiserDataset {
    /// Every `*.safetensors` file of `directory`, sorted
    pub fn from_directory(directory: impl AsRef<Path>, number_of_sources_per_example: usize) -> DenoiserResult<Self> {
        let directory = directory.as_ref();
        let mut files = Vec::new();
        for entry in fs::read_dir(directory)
            .map_err(|e| DenoiserError::Io(format!("Failed to read {}: {}", directory.display(), e)))?
        {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("safetensors") {
                files.push(path);
            }
        }
        files.sort();
        log::info!("Found {} examples in {}", files.len(), directory.display());
        Ok(Self {
            source: ExampleSource::Files(files),
            number_of_sources_per_example,
            tiles_height_width: None,
        })
    }

    /// `<base>/<split>/` with statistics from `<base>/<split>.json`
    pub fn from_split(config: &DenoiserConfig, split: Split) -> DenoiserResult<Self> {
        let base = &config.base_dataset_directory;
        let statistics = DatasetStatistics::from_file(base.join(format!("{}.json", split.as_str())))?;
        let mut dataset = Self::from_directory(base.join(split.as_str()), statistics.number_of_sources_per_example)?;
        dataset.tiles_height_width = Some(statistics.tiles_height_width);
        Ok(dataset)
    }

    pub fn from_examples(examples: Vec<Example>, number_of_sources_per_example: usize) -> Self {
        Self {
            source: ExampleSource::Memory(examples),
            number_of_sources_per_example,
            tiles_height_width: None,
        }
    }

    /// Random examples for every configured pass: sources are noisy copies of
    /// the target
    pub fn synthetic(
        config: &DenoiserConfig,
        number_of_examples: usize,
        tiles_height_width: usize,
        number_of_sources_per_example: usize,
        seed: u64,
    ) -> DenoiserResult<Self> {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(seed);
        let passes = config.feature_passes()?;
        let mut examples = Vec::with_capacity(number_of_examples);
        for _ in 0..number_of_examples {
            let mut example = Example::new();
            for (&pass, feature) in passes.iter().filter(|(_, f)| f.is_source) {
                let channels = feature.number_of_channels.unwrap_or_else(|| pass.number_of_channels());
                let shape = (channels, tiles_height_width, tiles_height_width);
                let values: Vec<f32> = (0..channels * tiles_height_width * tiles_height_width)
                    .map(|_| rng.gen_range(0.0..1.0))
                    .collect();
                let target = Tensor::from_vec(values, shape, &device)?;
                for index in 0..number_of_sources_per_example {
                    let noise: Vec<f32> = (0..target.elem_count()).map(|_| rng.gen_range(-0.1..0.1)).collect();
                    let source = (&target + Tensor::from_vec(noise, shape, &device)?)?;
                    example.insert(naming::source_feature_name(pass, index), source);
                }
                example.insert(naming::target_feature_name(pass), target);
            }
            examples.push(example);
        }
        Ok(Self {
            source: ExampleSource::Memory(examples),
            number_of_sources_per_example,
            tiles_height_width: Some(tiles_height_width),
        })
    }

    pub fn len(&self) -> usize {
        match &self.source {
            ExampleSource::Files(files) => files.len(),
            ExampleSource::Memory(examples) => examples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn number_of_sources_per_example(&self) -> usize {
        self.number_of_sources_per_example
    }

    pub fn tiles_height_width(&self) -> Option<usize> {
        self.tiles_height_width
    }

    /// Example `index` on the CPU
    pub fn get(&self, index: usize) -> DenoiserResult<Example> {
        match &self.source {
            ExampleSource::Files(files) => {
                let path = files
                    .get(index)
                    .ok_or_else(|| DenoiserError::Io(format!("no example with index {}", index)))?;
                load_example(path)
            }
            ExampleSource::Memory(examples) => examples
                .get(index)
                .cloned()
                .ok_or_else(|| DenoiserError::Io(format!("no example with index {}", index))),
        }
    }
}

pub fn load_example(path: impl AsRef<Path>) -> DenoiserResult<Example> {
    let tensors = candle_core::safetensors::load(path.as_ref(), &Device::Cpu)?;
    Ok(tensors.into_iter().collect())
}

pub fn save_example(example: &Example, path: impl AsRef<Path>) -> DenoiserResult<()> {
    let tensors: std::collections::HashMap<String, Tensor> =
        example.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    candle_core::safetensors::save(&tensors, path.as_ref())?;
    Ok(())
}

/// `[C, H, W]` examples to one `[B, C, H, W]` batch
pub fn stack_examples(examples: &[Example], device: &Device) -> DenoiserResult<Batch> {
    let first = examples
        .first()
        .ok_or_else(|| DenoiserError::configuration("cannot stack an empty batch"))?;
    let mut batch = Batch::new();
    for key in first.keys() {
        let tensors = examples
            .iter()
            .map(|example| {
                example
                    .get(key)
                    .ok_or_else(|| DenoiserError::configuration(format!("example is missing '{}'", key)))
            })
            .collect::<DenoiserResult<Vec<_>>>()?;
        batch.insert(key.clone(), Tensor::stack(&tensors, 0)?.to_device(device)?);
    }
    Ok(batch)
}

// ═══════════════════════════════════════════════════════════════════════════
// DATA LOADER
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub number_of_sources_per_target: usize,
    pub number_of_source_index_tuples: usize,
    /// `None` disables augmentation
    pub augmentation: Option<DataAugmentationConfig>,
    pub shuffle: bool,
    pub seed: u64,
}

impl LoaderOptions {
    pub fn training(config: &DenoiserConfig, seed: u64) -> Self {
        Self {
            batch_size: config.batch_size,
            number_of_sources_per_target: config.number_of_sources_per_target,
            number_of_source_index_tuples: config.number_of_source_index_tuples,
            augmentation: Some(config.data_augmentation),
            shuffle: true,
            seed,
        }
    }

    pub fn evaluation(config: &DenoiserConfig, seed: u64) -> Self {
        Self {
            augmentation: None,
            shuffle: false,
            ..Self::training(config, seed)
        }
    }

    pub fn shuffle_buffer_size(&self) -> usize {
        20 * self.batch_size
    }
}

/// One epoch of batches produced on a background thread.
///
/// At most one finished batch waits in the channel while the next is built.
pub struct DataLoader {
    receiver: Receiver<DenoiserResult<Batch>>,
    producer: Option<JoinHandle<()>>,
}

impl DataLoader {
    pub fn new(dataset: DenoiserDataset, passes: Vec<RenderPass>, options: LoaderOptions, device: Device) -> Self {
        let (sender, receiver) = sync_channel(1);
        let producer = std::thread::spawn(move || {
            let mut producer = BatchProducer::new(dataset, passes, options, device);
            producer.run(|batch| sender.send(batch).is_ok());
        });
        Self {
            receiver,
            producer: Some(producer),
        }
    }
}

impl Iterator for DataLoader {
    type Item = DenoiserResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

impl Drop for DataLoader {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            // A closed channel stops a producer blocked on send.
            let (_, closed) = sync_channel(0);
            drop(std::mem::replace(&mut self.receiver, closed));
            if producer.join().is_err() {
                log::warn!("Data loader thread panicked");
            }
        }
    }
}

struct BatchProducer {
    dataset: DenoiserDataset,
    passes: Vec<RenderPass>,
    options: LoaderOptions,
    device: Device,
    rng: StdRng,
    buffer: Vec<Example>,
}

impl BatchProducer {
    fn new(dataset: DenoiserDataset, passes: Vec<RenderPass>, options: LoaderOptions, device: Device) -> Self {
        let rng = StdRng::seed_from_u64(options.seed);
        Self {
            dataset,
            passes,
            options,
            device,
            rng,
            buffer: Vec::new(),
        }
    }

    /// Emit batches until the epoch ends or `emit` returns false
    fn run(&mut self, mut emit: impl FnMut(DenoiserResult<Batch>) -> bool) {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.options.shuffle {
            order.shuffle(&mut self.rng);
        }
        let batch_size = self.options.batch_size.max(1);
        for chunk in order.chunks(batch_size) {
            match self.prepare(chunk) {
                Ok(samples) => self.buffer.extend(samples),
                Err(error) => {
                    emit(Err(error));
                    return;
                }
            }
            while self.buffer.len() >= self.options.shuffle_buffer_size().max(batch_size) {
                if !emit(self.take_batch(batch_size)) {
                    return;
                }
            }
        }
        while !self.buffer.is_empty() {
            if !emit(self.take_batch(batch_size)) {
                return;
            }
        }
    }

    /// Load, select and augment the samples of `indices` in parallel
    fn prepare(&mut self, indices: &[usize]) -> DenoiserResult<Vec<Example>> {
        let mut jobs = Vec::with_capacity(indices.len());
        for &index in indices {
            let tuples = source_index_tuples(
                &mut self.rng,
                self.dataset.number_of_sources_per_example(),
                self.options.number_of_source_index_tuples,
                self.options.number_of_sources_per_target,
            )?;
            for tuple in tuples {
                let choice = match &self.options.augmentation {
                    Some(config) => AugmentationChoice::random(&mut self.rng, config),
                    None => AugmentationChoice::identity(),
                };
                jobs.push((index, tuple, choice));
            }
        }
        let dataset = &self.dataset;
        let passes = &self.passes;
        jobs.into_par_iter()
            .map(|(index, tuple, choice)| {
                let example = dataset.get(index)?;
                let selected = select_sources(&example, &tuple, passes)?;
                augment(&selected, &choice)
            })
            .collect()
    }

    fn take_batch(&mut self, batch_size: usize) -> DenoiserResult<Batch> {
        let count = batch_size.min(self.buffer.len());
        let mut examples = Vec::with_capacity(count);
        for _ in 0..count {
            let position = if self.options.shuffle {
                self.rng.gen_range(0..self.buffer.len())
            } else {
                0
            };
            examples.push(self.buffer.remove(position));
        }
        stack_examples(&examples, &self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DenoiserConfig {
        DenoiserConfig::from_json_str(
            r#"{
                "model_directory": "models/test",
                "base_dataset_directory": "data",
                "batch_size": 3,
                "features": {
                    "diffuse_color": { "is_target": true },
                    "depth": {}
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_source_index_tuples_cover_every_source() {
        let mut rng = StdRng::seed_from_u64(1);
        let tuples = source_index_tuples(&mut rng, 4, 9, 1).unwrap();
        assert_eq!(tuples.len(), 9);
        for index in 0..4 {
            assert!(tuples.iter().filter(|t| t[0] == index).count() >= 2);
        }
    }

    #[test]
    fn test_source_index_tuples_are_unique() {
        let mut rng = StdRng::seed_from_u64(2);
        for tuple in source_index_tuples(&mut rng, 5, 10, 3).unwrap() {
            let mut sorted = tuple.clone();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted.len(), 3);
        }
    }

    #[test]
    fn test_too_few_sources_is_an_error() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            source_index_tuples(&mut rng, 1, 4, 2),
            Err(DenoiserError::Configuration(_))
        ));
    }

    #[test]
    fn test_select_sources_renumbers() {
        let dataset = DenoiserDataset::synthetic(&config(), 1, 4, 3, 0).unwrap();
        let example = dataset.get(0).unwrap();
        let selected = select_sources(&example, &[2], &[RenderPass::DiffuseColor, RenderPass::Depth]).unwrap();
        let renumbered = &selected[&naming::source_feature_name(RenderPass::DiffuseColor, 0)];
        let original = &example[&naming::source_feature_name(RenderPass::DiffuseColor, 2)];
        let difference: f32 = (renumbered - original).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(difference, 0.0);
        assert!(!selected.contains_key(&naming::source_feature_name(RenderPass::Depth, 1)));
        assert!(selected.contains_key(&naming::target_feature_name(RenderPass::DiffuseColor)));
    }

    #[test]
    fn test_loader_batches_every_sample() {
        let config = config();
        let dataset = DenoiserDataset::synthetic(&config, 7, 4, 2, 0).unwrap();
        let loader = DataLoader::new(
            dataset,
            vec![RenderPass::DiffuseColor, RenderPass::Depth],
            LoaderOptions::training(&config, 5),
            Device::Cpu,
        );
        let batches: Vec<Batch> = loader.map(|b| b.unwrap()).collect();
        let sizes: Vec<usize> = batches
            .iter()
            .map(|b| b[&naming::target_feature_name(RenderPass::DiffuseColor)].dim(0).unwrap())
            .collect();
        assert_eq!(sizes.iter().sum::<usize>(), 7);
        assert!(sizes.iter().all(|&s| s <= 3));
        assert_eq!(&batches[0][&naming::source_feature_name(RenderPass::Depth, 0)].dims()[1..], &[1, 4, 4]);
    }

    #[test]
    fn test_safetensors_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = DenoiserDataset::synthetic(&config(), 2, 4, 1, 0).unwrap();
        for index in 0..2 {
            save_example(&dataset.get(index).unwrap(), dir.path().join(format!("{}.safetensors", index))).unwrap();
        }
        let loaded = DenoiserDataset::from_directory(dir.path(), 1).unwrap();
        assert_eq!(loaded.len(), 2);
        let example = loaded.get(1).unwrap();
        assert_eq!(example.len(), 4);
    }
}
