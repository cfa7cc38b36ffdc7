//! Comparisons between an input encoding and a target encoding.
use crate::error::{NstError, Result};
use serde::{Deserialize, Serialize};
use tch::{Kind, Reduction, Tensor};

/// Maps encodings to representations and scores an input representation
/// against a target one.
pub trait Comparison: std::fmt::Debug {
    fn repr(&self, encoding: &Tensor) -> Result<Tensor>;

    fn target_repr(&self, encoding: &Tensor) -> Result<Tensor> {
        self.repr(encoding)
    }

    /// The raw, unweighted, score.
    fn score(&self, input_repr: &Tensor, target_repr: &Tensor) -> Result<Tensor>;
}

// A target with a batch size of one is compared against every input sample.
fn broadcast_batch(input: &Tensor, target: &Tensor) -> Result<Tensor> {
    let (input_size, target_size) = (input.size(), target.size());
    if input_size == target_size {
        return Ok(target.shallow_clone());
    }
    let broadcastable = input_size.len() == target_size.len()
        && target_size.first() == Some(&1)
        && input_size[1..] == target_size[1..];
    if broadcastable {
        Ok(target.f_expand(input_size.as_slice(), false)?)
    } else {
        Err(NstError::Shape(format!(
            "input representation {input_size:?} does not match target {target_size:?}"
        )))
    }
}

fn mse(input: &Tensor, target: &Tensor) -> Result<Tensor> {
    let target = broadcast_batch(input, target)?;
    Ok(input.f_mse_loss(&target, Reduction::Mean)?)
}

/// Compares encodings directly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureReconstruction;

impl Comparison for FeatureReconstruction {
    fn repr(&self, encoding: &Tensor) -> Result<Tensor> {
        Ok(encoding.shallow_clone())
    }

    fn score(&self, input_repr: &Tensor, target_repr: &Tensor) -> Result<Tensor> {
        mse(input_repr, target_repr)
    }
}

/// Compares the channel correlations of encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gram {
    /// Divides the Gram matrix by the number of spatial positions.
    pub normalize: bool,
    /// Additionally divides the Gram matrix by the number of channels. This
    /// double normalization matches the weights used by some reference
    /// implementations and is disabled by default.
    pub channel_normalize: bool,
}

impl Default for Gram {
    fn default() -> Self {
        Gram { normalize: true, channel_normalize: false }
    }
}

impl Gram {
    pub fn gram_matrix(&self, m: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = m.size4()?;
        let m = m.f_view([b, c, h * w])?;
        let mut g = m.f_bmm(&m.f_transpose(1, 2)?)?;
        if self.normalize {
            g = g / (h * w);
        }
        if self.channel_normalize {
            g = g / c;
        }
        Ok(g)
    }
}

impl Comparison for Gram {
    fn repr(&self, encoding: &Tensor) -> Result<Tensor> {
        self.gram_matrix(encoding)
    }

    fn score(&self, input_repr: &Tensor, target_repr: &Tensor) -> Result<Tensor> {
        mse(input_repr, target_repr)
    }
}

/// Markov random field comparison: every input patch is matched to the most
/// similar target patch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mrf {
    pub patch_size: i64,
    pub stride: i64,
}

impl Default for Mrf {
    fn default() -> Self {
        Mrf { patch_size: 3, stride: 1 }
    }
}

impl Mrf {
    /// Extracts patches, returning a `[batch, num_patches, patch_numel]` tensor.
    pub fn extract_patches(&self, m: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = m.size4()?;
        let k = self.patch_size;
        if h < k || w < k {
            return Err(NstError::Shape(format!(
                "encoding of size {h}x{w} is smaller than the patch size {k}"
            )));
        }
        let patches = m.f_unfold(2, k, self.stride)?.f_unfold(3, k, self.stride)?;
        let patches = patches.f_permute([0, 2, 3, 1, 4, 5])?;
        Ok(patches.f_reshape([b, -1, c * k * k])?)
    }
}

fn normalize_rows(xs: &Tensor) -> Tensor {
    let norm = xs.square().sum_dim_intlist(-1i64, true, Kind::Float).sqrt();
    xs / (norm + 1e-8)
}

impl Comparison for Mrf {
    fn repr(&self, encoding: &Tensor) -> Result<Tensor> {
        self.extract_patches(encoding)
    }

    fn score(&self, input_repr: &Tensor, target_repr: &Tensor) -> Result<Tensor> {
        let (b, n, d) = input_repr.size3()?;
        let (target_b, _, target_d) = target_repr.size3()?;
        if d != target_d || (target_b != b && target_b != 1) {
            return Err(NstError::Shape(format!(
                "input patches {:?} do not match target patches {:?}",
                input_repr.size(),
                target_repr.size()
            )));
        }
        let target = if target_b == b {
            target_repr.shallow_clone()
        } else {
            target_repr.f_expand([b, -1, d], false)?
        };
        let similarity = tch::no_grad(|| {
            normalize_rows(input_repr).bmm(&normalize_rows(&target).transpose(1, 2))
        });
        let indexes =
            similarity.f_argmax(2i64, false)?.f_unsqueeze(-1)?.f_expand([b, n, d], false)?;
        let matched = target.f_gather(1, &indexes, false)?;
        mse(input_repr, &matched)
    }
}
