//! Optimization loops, either on the pixels of an image or on the parameters of
//! a transformer network.
use crate::error::{NstError, Result};
use crate::loss::{ContentCriterion, Criterion};
use crate::pyramid::{ImagePyramid, Resizable};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tch::nn::{self, OptimizerConfig};
use tch::Tensor;

fn should_log(log_freq: Option<usize>, step: usize) -> bool {
    matches!(log_freq, Some(freq) if freq > 0 && step % freq == 0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageOptimConfig {
    pub num_steps: usize,
    pub lr: f64,
    pub log_freq: Option<usize>,
    /// Clamps the pixel values to [0, 1] after each step.
    pub clamp: bool,
}

impl Default for ImageOptimConfig {
    fn default() -> Self {
        ImageOptimConfig { num_steps: 500, lr: 1e-2, log_freq: Some(50), clamp: true }
    }
}

/// Optimizes the pixels of `input_image` to minimize `criterion`.
///
/// `stop` is called once per step with the step index, starting at 1, and the
/// loss. Returning true ends the optimization early.
pub fn image_optimization<C, O, S>(
    input_image: &Tensor,
    criterion: &C,
    optimizer: O,
    config: &ImageOptimConfig,
    mut stop: S,
) -> Result<Tensor>
where
    C: Criterion + ?Sized,
    O: OptimizerConfig,
    S: FnMut(usize, f64) -> bool,
{
    let vs = nn::VarStore::new(input_image.device());
    let image = vs.root().var_copy("image", &input_image.detach());
    let mut opt = optimizer.build(&vs, config.lr)?;
    for step in 1..=config.num_steps {
        let losses = criterion.losses(&image).map_err(|err| err.context(format!("step {step}")))?;
        let loss = losses.total()?;
        opt.backward_step(&loss);
        if config.clamp {
            tch::no_grad(|| {
                let mut image = image.shallow_clone();
                let _ = image.clamp_(0., 1.);
            });
        }
        let value = f64::try_from(&loss)?;
        if should_log(config.log_freq, step) {
            tracing::info!(step, loss = value, "{losses}");
        }
        if stop(step, value) {
            tracing::info!(step, "stopping the optimization");
            break;
        }
    }
    Ok(image.detach())
}

/// Runs `image_optimization` on each level of `pyramid`, with the number of
/// steps of the level. The criterion is resized before each level and `stop`
/// is called with the step index within the level.
pub fn pyramid_image_optimization<C, O, S>(
    input_image: &Tensor,
    criterion: &mut C,
    pyramid: &ImagePyramid,
    optimizer: O,
    config: &ImageOptimConfig,
    mut stop: S,
) -> Result<Tensor>
where
    C: Criterion + Resizable + ?Sized,
    O: OptimizerConfig + Clone,
    S: FnMut(usize, f64) -> bool,
{
    pyramid.run(input_image, criterion, |_, level, criterion, image| {
        let config = ImageOptimConfig { num_steps: level.num_steps, ..config.clone() };
        image_optimization(&image, &*criterion, optimizer.clone(), &config, &mut stop)
    })
}

/// Trains `transformer` for one epoch over `loader`. Each batch becomes the
/// content target and the input of the transformer. Returns the mean loss.
pub fn model_optimization<I, M, C>(
    loader: I,
    transformer: &M,
    criterion: &mut C,
    optimizer: &mut nn::Optimizer,
    log_freq: Option<usize>,
) -> Result<f64>
where
    I: IntoIterator<Item = Tensor>,
    M: nn::ModuleT + ?Sized,
    C: ContentCriterion + ?Sized,
{
    let mut sum_loss = 0.;
    let mut num_batches = 0;
    for (batch_idx, batch) in loader.into_iter().enumerate() {
        let context = |err: NstError| err.context(format!("batch {batch_idx}"));
        criterion.set_content_image(&batch).map_err(context)?;
        let output = transformer.forward_t(&batch, true);
        let loss = criterion.forward(&output).map_err(context)?;
        optimizer.backward_step(&loss);
        let loss = f64::try_from(&loss)?;
        if should_log(log_freq, batch_idx + 1) {
            tracing::info!(batch = batch_idx + 1, loss, "model optimization");
        }
        sum_loss += loss;
        num_batches += 1;
    }
    if num_batches == 0 {
        return Err(NstError::InvalidConfig("the data loader did not yield any batch".into()));
    }
    Ok(sum_loss / num_batches as f64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOptimConfig {
    pub epochs: usize,
    pub lr: f64,
    /// The learning rate is multiplied by this factor after each epoch.
    pub lr_decay: Option<f64>,
    pub log_freq: Option<usize>,
    /// Where to save the transformer variables after each epoch.
    pub checkpoint: Option<PathBuf>,
}

impl Default for ModelOptimConfig {
    fn default() -> Self {
        ModelOptimConfig {
            epochs: 2,
            lr: 1e-3,
            lr_decay: None,
            log_freq: Some(50),
            checkpoint: None,
        }
    }
}

/// Trains `transformer`, whose variables are in `vs`, for `config.epochs`
/// epochs. `loader` is called at the start of each epoch. Returns the mean loss
/// of each epoch.
pub fn train<L, I, M, C, O>(
    mut loader: L,
    transformer: &M,
    vs: &nn::VarStore,
    criterion: &mut C,
    optimizer: O,
    config: &ModelOptimConfig,
) -> Result<Vec<f64>>
where
    L: FnMut() -> I,
    I: IntoIterator<Item = Tensor>,
    M: nn::ModuleT + ?Sized,
    C: ContentCriterion + ?Sized,
    O: OptimizerConfig,
{
    let mut opt = optimizer.build(vs, config.lr)?;
    let mut epoch_losses = Vec::with_capacity(config.epochs);
    for epoch in 0..config.epochs {
        let lr = config.lr * config.lr_decay.unwrap_or(1.).powi(epoch as i32);
        opt.set_lr(lr);
        let loss = model_optimization(loader(), transformer, criterion, &mut opt, config.log_freq)
            .map_err(|err| err.context(format!("epoch {epoch}")))?;
        tracing::info!(epoch, loss, lr, "epoch done");
        if let Some(checkpoint) = &config.checkpoint {
            vs.save(checkpoint)?;
        }
        epoch_losses.push(loss);
    }
    Ok(epoch_losses)
}
