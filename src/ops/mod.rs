//! Loss operators.
//!
//! Leaf operators compare the encoding of an input image against a target
//! representation, containers combine other operators with per-child weights.
//! Both implement `Operator` so that they can be nested freely, e.g. a regional
//! container whose children are multi-layer containers.
pub mod comparison;
pub mod container;
pub mod encoding;
pub mod regularization;

pub use comparison::{Comparison, FeatureReconstruction, Gram, Mrf};
pub use container::{Aggregation, OperatorContainer};
pub use encoding::EncodingOperator;
pub use regularization::TotalVariation;

use crate::enc::MultiLayerEncoder;
use crate::error::Result;
use crate::loss::LossDict;
use std::rc::Rc;
use tch::Tensor;

pub trait Operator: std::fmt::Debug {
    /// The weighted score of `input_image`.
    fn score(&self, input_image: &Tensor) -> Result<Tensor>;

    /// Adds the score of this operator to `losses` under `prefix`. Containers
    /// report each child separately.
    fn collect_losses(
        &self,
        input_image: &Tensor,
        prefix: &str,
        losses: &mut LossDict,
    ) -> Result<()> {
        losses.insert(prefix, self.score(input_image)?);
        Ok(())
    }

    /// Whether the operator can be scored.
    fn is_ready(&self) -> bool {
        true
    }

    fn set_target_image(&mut self, _image: &Tensor) -> Result<()> {
        Ok(())
    }

    /// Sets the guide applied to the target encodings. With `recompute` false,
    /// the target representation is only rebuilt by the next call to
    /// `set_target_image`.
    fn set_target_guide(&mut self, _guide: &Tensor, _recompute: bool) -> Result<()> {
        Ok(())
    }

    fn set_input_guide(&mut self, _guide: &Tensor) -> Result<()> {
        Ok(())
    }

    /// The encoders this operator reads from.
    fn encoders(&self) -> Vec<Rc<MultiLayerEncoder>> {
        vec![]
    }
}

impl<O: Operator + ?Sized> Operator for Box<O> {
    fn score(&self, input_image: &Tensor) -> Result<Tensor> {
        (**self).score(input_image)
    }

    fn collect_losses(
        &self,
        input_image: &Tensor,
        prefix: &str,
        losses: &mut LossDict,
    ) -> Result<()> {
        (**self).collect_losses(input_image, prefix, losses)
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn set_target_image(&mut self, image: &Tensor) -> Result<()> {
        (**self).set_target_image(image)
    }

    fn set_target_guide(&mut self, guide: &Tensor, recompute: bool) -> Result<()> {
        (**self).set_target_guide(guide, recompute)
    }

    fn set_input_guide(&mut self, guide: &Tensor) -> Result<()> {
        (**self).set_input_guide(guide)
    }

    fn encoders(&self) -> Vec<Rc<MultiLayerEncoder>> {
        (**self).encoders()
    }
}

/// Clears the encoding caches of all the encoders used by `ops`.
pub(crate) fn clear_storages(ops: &[&dyn Operator]) {
    let mut encoders: Vec<Rc<MultiLayerEncoder>> = vec![];
    for enc in ops.iter().flat_map(|op| op.encoders()) {
        if !encoders.iter().any(|e| Rc::ptr_eq(e, &enc)) {
            encoders.push(enc)
        }
    }
    for enc in encoders {
        enc.clear_storage()
    }
}
