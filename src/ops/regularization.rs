//! Operators on the input image alone.
use super::Operator;
use crate::error::{NstError, Result};
use tch::{Kind, Tensor};

/// Total variation regularizer, penalizing differences between neighbouring
/// pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TotalVariation {
    pub exponent: f64,
    pub score_weight: f64,
}

impl Default for TotalVariation {
    fn default() -> Self {
        TotalVariation { exponent: 2., score_weight: 1. }
    }
}

impl TotalVariation {
    pub fn new(score_weight: f64) -> TotalVariation {
        TotalVariation { score_weight, ..Default::default() }
    }
}

impl Operator for TotalVariation {
    fn score(&self, input_image: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = input_image.size4()?;
        if h < 2 || w < 2 {
            return Err(NstError::Shape(format!("image of size {h}x{w} is too small")));
        }
        let dh = input_image.narrow(2, 1, h - 1) - input_image.narrow(2, 0, h - 1);
        let dw = input_image.narrow(3, 1, w - 1) - input_image.narrow(3, 0, w - 1);
        let dh = dh.abs().pow_tensor_scalar(self.exponent).sum(Kind::Float);
        let dw = dw.abs().pow_tensor_scalar(self.exponent).sum(Kind::Float);
        Ok((dh + dw) / input_image.numel() as f64 * self.score_weight)
    }
}
