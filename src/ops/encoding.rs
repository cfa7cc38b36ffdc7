//! Operators comparing the encodings of a single encoder layer.
use super::{Comparison, Operator};
use crate::enc::MultiLayerEncoder;
use crate::error::{NstError, Result};
use crate::image::{as_guide, image_size, resize_guide};
use std::rc::Rc;
use tch::Tensor;

/// A leaf operator scoring the encoding of an input image on one layer
/// against the representation of a target image.
///
/// Both encodings can be restricted to a region with a guide. Guides are
/// given at image resolution and are resized to the encoding resolution.
#[derive(Debug)]
pub struct EncodingOperator {
    encoder: Rc<MultiLayerEncoder>,
    layer: String,
    comparison: Box<dyn Comparison>,
    score_weight: f64,
    target_image: Option<Tensor>,
    target_guide: Option<Tensor>,
    input_guide: Option<Tensor>,
    target_repr: Option<Tensor>,
    stale: bool,
}

fn check_guide(guide: &Tensor, image: &Tensor, what: &str) -> Result<()> {
    let (guide_size, image_size) = (image_size(guide)?, image_size(image)?);
    if guide_size != image_size {
        return Err(NstError::Shape(format!(
            "{what} guide of size {guide_size:?} does not match image of size {image_size:?}"
        )));
    }
    Ok(())
}

fn apply_guide(encoding: &Tensor, guide: &Tensor) -> Result<Tensor> {
    let guide = resize_guide(guide, image_size(encoding)?)?;
    Ok(encoding * guide.to_device(encoding.device()))
}

impl EncodingOperator {
    pub fn new<C: Comparison + 'static>(
        encoder: Rc<MultiLayerEncoder>,
        layer: &str,
        comparison: C,
        score_weight: f64,
    ) -> Result<EncodingOperator> {
        encoder.register_layer(layer)?;
        Ok(EncodingOperator {
            encoder,
            layer: layer.to_string(),
            comparison: Box::new(comparison),
            score_weight,
            target_image: None,
            target_guide: None,
            input_guide: None,
            target_repr: None,
            stale: false,
        })
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn score_weight(&self) -> f64 {
        self.score_weight
    }

    pub fn set_score_weight(&mut self, score_weight: f64) {
        self.score_weight = score_weight
    }

    pub fn target_repr(&self) -> Option<&Tensor> {
        self.target_repr.as_ref()
    }

    pub fn target_guide(&self) -> Option<&Tensor> {
        self.target_guide.as_ref()
    }

    pub fn input_guide(&self) -> Option<&Tensor> {
        self.input_guide.as_ref()
    }

    /// Whether the target guide changed since the representation was computed.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    fn encode(&self, image: &Tensor) -> Result<Tensor> {
        let mut encodings = self.encoder.encode(image, &[&self.layer])?;
        Ok(encodings.remove(0))
    }

    // Leaves the operator untouched, the caller stores the result on success.
    fn compute_target_repr(&self, image: &Tensor, guide: Option<&Tensor>) -> Result<Tensor> {
        if let Some(guide) = guide {
            check_guide(guide, image, "target")?;
        }
        let repr = tch::no_grad(|| -> Result<Tensor> {
            let mut encoding = self.encode(image)?;
            if let Some(guide) = guide {
                encoding = apply_guide(&encoding, guide)?;
            }
            self.comparison.target_repr(&encoding)
        });
        // Target encodings are not kept in the cache of the shared encoder.
        self.encoder.release(image);
        repr
    }

    fn score_inner(&self, input_image: &Tensor) -> Result<Tensor> {
        let target_repr = match (&self.target_repr, self.stale) {
            (Some(repr), false) => repr,
            (Some(_), true) => {
                return Err(NstError::NotConfigured(
                    "the target guide changed, set the target image again".to_string(),
                ))
            }
            (None, _) => return Err(NstError::NotConfigured("no target image".to_string())),
        };
        let mut encoding = match &self.input_guide {
            Some(guide) => {
                check_guide(guide, input_image, "input")?;
                apply_guide(&self.encode(input_image)?, guide)?
            }
            None => self.encode(input_image)?,
        };
        encoding = self.comparison.repr(&encoding)?;
        Ok(self.comparison.score(&encoding, target_repr)? * self.score_weight)
    }

    fn context(&self, err: NstError) -> NstError {
        err.context(format!("operator on layer {}", self.layer))
    }
}

impl Operator for EncodingOperator {
    fn score(&self, input_image: &Tensor) -> Result<Tensor> {
        self.score_inner(input_image).map_err(|err| self.context(err))
    }

    fn is_ready(&self) -> bool {
        self.target_repr.is_some() && !self.stale
    }

    fn set_target_image(&mut self, image: &Tensor) -> Result<()> {
        let image = image.detach();
        let repr = self
            .compute_target_repr(&image, self.target_guide.as_ref())
            .map_err(|err| self.context(err))?;
        self.target_image = Some(image);
        self.target_repr = Some(repr);
        self.stale = false;
        Ok(())
    }

    fn set_target_guide(&mut self, guide: &Tensor, recompute: bool) -> Result<()> {
        let guide = as_guide(guide).map_err(|err| self.context(err))?;
        match &self.target_image {
            Some(image) if recompute => {
                let repr = self
                    .compute_target_repr(image, Some(&guide))
                    .map_err(|err| self.context(err))?;
                self.target_repr = Some(repr);
                self.stale = false;
            }
            Some(_) => self.stale = true,
            None => {}
        }
        self.target_guide = Some(guide);
        Ok(())
    }

    fn set_input_guide(&mut self, guide: &Tensor) -> Result<()> {
        self.input_guide = Some(as_guide(guide).map_err(|err| self.context(err))?);
        Ok(())
    }

    fn encoders(&self) -> Vec<Rc<MultiLayerEncoder>> {
        vec![self.encoder.clone()]
    }
}
