//! VGG multi-layer encoders.
//!
//! Layers are named after the block and the position within the block:
//! `conv1_1`, `bn1_1`, `relu1_1`, ..., `pool1`, `conv2_1`, ... Variable paths
//! follow the torchvision `features` numbering so that the pre-trained weights
//! for the vgg-13/16/19 models can be used, e.g.
//! <https://github.com/LaurentMazare/tch-rs/releases/download/mw/vgg16.ot>
use super::MultiLayerEncoder;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tch::{nn, Device, Tensor};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VggArch {
    Vgg11,
    Vgg13,
    Vgg16,
    Vgg19,
}

impl VggArch {
    pub fn name(&self) -> &'static str {
        match self {
            VggArch::Vgg11 => "vgg11",
            VggArch::Vgg13 => "vgg13",
            VggArch::Vgg16 => "vgg16",
            VggArch::Vgg19 => "vgg19",
        }
    }

    // Each list element contains multiple convolutions with some specified number
    // of features followed by a single pooling layer.
    fn blocks(&self) -> Vec<Vec<i64>> {
        match self {
            VggArch::Vgg11 => {
                vec![vec![64], vec![128], vec![256, 256], vec![512, 512], vec![512, 512]]
            }
            VggArch::Vgg13 => vec![
                vec![64, 64],
                vec![128, 128],
                vec![256, 256],
                vec![512, 512],
                vec![512, 512],
            ],
            VggArch::Vgg16 => vec![
                vec![64, 64],
                vec![128, 128],
                vec![256, 256, 256],
                vec![512, 512, 512],
                vec![512, 512, 512],
            ],
            VggArch::Vgg19 => vec![
                vec![64, 64],
                vec![128, 128],
                vec![256, 256, 256, 256],
                vec![512, 512, 512, 512],
                vec![512, 512, 512, 512],
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Pooling {
    #[default]
    Max,
    Avg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VggConfig {
    pub batch_norm: bool,
    pub pooling: Pooling,
    /// Prepends a `preprocessing` layer normalizing [0, 1] images with the
    /// ImageNet statistics.
    pub preprocessing: bool,
}

impl Default for VggConfig {
    fn default() -> Self {
        VggConfig { batch_norm: false, pooling: Pooling::Max, preprocessing: true }
    }
}

fn conv2d(p: nn::Path, c_in: i64, c_out: i64) -> nn::Conv2D {
    let conv2d_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
    nn::conv2d(p, c_in, c_out, 3, conv2d_cfg)
}

fn imagenet_normalize(xs: &Tensor, mean: &Tensor, std: &Tensor) -> Tensor {
    let device = xs.device();
    (xs - mean.to_device(device)) / std.to_device(device)
}

pub fn vgg(p: &nn::Path, arch: VggArch, cfg: VggConfig) -> MultiLayerEncoder {
    let f = p / "features";
    let mut enc = MultiLayerEncoder::new();
    if cfg.preprocessing {
        let mean = Tensor::from_slice(&IMAGENET_MEAN).view([1, 3, 1, 1]);
        let std = Tensor::from_slice(&IMAGENET_STD).view([1, 3, 1, 1]);
        enc = enc.add_fn("preprocessing", move |xs| imagenet_normalize(xs, &mean, &std));
    }
    // Index of the next layer in the torchvision `features` sequence.
    let mut l = 0;
    let mut c_in = 3;
    for (block, channels) in arch.blocks().into_iter().enumerate() {
        let block = block + 1;
        for (i, &c_out) in channels.iter().enumerate() {
            let i = i + 1;
            enc = enc.add(&format!("conv{block}_{i}"), conv2d(&f / l.to_string(), c_in, c_out));
            l += 1;
            if cfg.batch_norm {
                let bn = nn::batch_norm2d(&f / l.to_string(), c_out, Default::default());
                enc = enc.add(&format!("bn{block}_{i}"), bn);
                l += 1;
            }
            enc = enc.add_fn(&format!("relu{block}_{i}"), |xs| xs.relu());
            l += 1;
            c_in = c_out;
        }
        enc = match cfg.pooling {
            Pooling::Max => enc.add_fn(&format!("pool{block}"), |xs| xs.max_pool2d_default(2)),
            Pooling::Avg => enc.add_fn(&format!("pool{block}"), |xs| {
                xs.avg_pool2d([2, 2], [2, 2], [0, 0], false, true, None::<i64>)
            }),
        };
        l += 1;
    }
    enc
}

/// Where pre-trained weights are looked up and on which device models live.
#[derive(Debug, Clone)]
pub struct ModelContext {
    pub weights_dir: PathBuf,
    pub device: Device,
}

impl ModelContext {
    pub fn new<T: Into<PathBuf>>(weights_dir: T, device: Device) -> ModelContext {
        ModelContext { weights_dir: weights_dir.into(), device }
    }

    pub fn weights_path(&self, arch: VggArch) -> PathBuf {
        self.weights_dir.join(format!("{}.ot", arch.name()))
    }

    /// Builds a VGG encoder and loads its pre-trained weights from
    /// `<weights_dir>/<arch>.ot`. The returned variable store is frozen.
    pub fn load_vgg(
        &self,
        arch: VggArch,
        cfg: VggConfig,
    ) -> Result<(nn::VarStore, MultiLayerEncoder)> {
        let mut vs = nn::VarStore::new(self.device);
        let enc = vgg(&vs.root(), arch, cfg);
        let path = self.weights_path(arch);
        tracing::info!(arch = arch.name(), path = %path.display(), "loading pre-trained weights");
        vs.load(&path)
            .map_err(|err| crate::NstError::from(err).context(format!("loading {}", arch.name())))?;
        vs.freeze();
        Ok((vs, enc))
    }
}
