use super::LossDict;
use crate::error::{NstError, Result};
use crate::image::{as_guide, image_size};
use crate::ops::{clear_storages, Operator, OperatorContainer};
use crate::pyramid::{PyramidLevel, Resizable};
use tch::Tensor;

/// A scalar objective on images.
pub trait Criterion {
    fn losses(&self, input_image: &Tensor) -> Result<LossDict>;

    /// The value to optimize, i.e. the sum of all the losses.
    fn forward(&self, input_image: &Tensor) -> Result<Tensor> {
        self.losses(input_image)?.total()
    }
}

/// A criterion whose content target can be replaced, e.g. for every batch when
/// training a transformer network.
pub trait ContentCriterion: Criterion {
    fn set_content_image(&mut self, image: &Tensor) -> Result<()>;
}

/// Which targets of a perceptual loss have been set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossState {
    Uninitialized,
    ContentTargetSet,
    StyleTargetSet,
    Ready,
}

impl LossState {
    fn new(content: bool, style: bool) -> LossState {
        match (content, style) {
            (false, false) => LossState::Uninitialized,
            (true, false) => LossState::ContentTargetSet,
            (false, true) => LossState::StyleTargetSet,
            (true, true) => LossState::Ready,
        }
    }

    fn check_ready(self) -> Result<()> {
        let missing = match self {
            LossState::Ready => return Ok(()),
            LossState::Uninitialized => "content and style target images are not set",
            LossState::ContentTargetSet => "style target image is not set",
            LossState::StyleTargetSet => "content target image is not set",
        };
        Err(NstError::NotConfigured(missing.to_string()))
    }
}

fn collect_all(input_image: &Tensor, ops: &[(&str, &dyn Operator)]) -> Result<LossDict> {
    let mut losses = LossDict::new();
    let res = ops.iter().try_for_each(|(name, op)| {
        op.collect_losses(input_image, name, &mut losses).map_err(|err| err.context(*name))
    });
    // The input image is usually modified in place between two evaluations.
    clear_storages(&ops.iter().map(|(_, op)| *op).collect::<Vec<_>>());
    res.map(|()| losses)
}

/// Content loss plus style loss, and an optional regularization term.
#[derive(Debug)]
pub struct PerceptualLoss {
    content_loss: Box<dyn Operator>,
    style_loss: Box<dyn Operator>,
    regularization: Option<Box<dyn Operator>>,
    content_image: Option<Tensor>,
    style_image: Option<Tensor>,
}

impl PerceptualLoss {
    pub fn new<C, S>(content_loss: C, style_loss: S) -> PerceptualLoss
    where
        C: Operator + 'static,
        S: Operator + 'static,
    {
        PerceptualLoss {
            content_loss: Box::new(content_loss),
            style_loss: Box::new(style_loss),
            regularization: None,
            content_image: None,
            style_image: None,
        }
    }

    pub fn with_regularization<R: Operator + 'static>(mut self, regularization: R) -> Self {
        self.regularization = Some(Box::new(regularization));
        self
    }

    pub fn content_loss(&self) -> &dyn Operator {
        self.content_loss.as_ref()
    }

    pub fn style_loss(&self) -> &dyn Operator {
        self.style_loss.as_ref()
    }

    pub fn content_image(&self) -> Option<&Tensor> {
        self.content_image.as_ref()
    }

    pub fn style_image(&self) -> Option<&Tensor> {
        self.style_image.as_ref()
    }

    pub fn state(&self) -> LossState {
        LossState::new(
            self.content_image.is_some() && self.content_loss.is_ready(),
            self.style_image.is_some() && self.style_loss.is_ready(),
        )
    }

    fn ops(&self) -> Vec<(&str, &dyn Operator)> {
        let mut ops: Vec<(&str, &dyn Operator)> = vec![
            ("content_loss", self.content_loss.as_ref()),
            ("style_loss", self.style_loss.as_ref()),
        ];
        if let Some(r) = &self.regularization {
            ops.push(("regularization", r.as_ref()));
        }
        ops
    }

    fn set_content_target(&mut self, image: &Tensor) -> Result<()> {
        let res =
            self.content_loss.set_target_image(image).map_err(|err| err.context("content_loss"));
        clear_storages(&[self.content_loss.as_ref()]);
        res
    }

    fn set_style_target(&mut self, image: &Tensor) -> Result<()> {
        let res = self.style_loss.set_target_image(image).map_err(|err| err.context("style_loss"));
        clear_storages(&[self.style_loss.as_ref()]);
        res
    }

    pub fn set_style_image(&mut self, image: &Tensor) -> Result<()> {
        self.set_style_target(image)?;
        self.style_image = Some(image.detach());
        Ok(())
    }
}

impl Criterion for PerceptualLoss {
    fn losses(&self, input_image: &Tensor) -> Result<LossDict> {
        self.state().check_ready()?;
        collect_all(input_image, &self.ops())
    }
}

impl ContentCriterion for PerceptualLoss {
    fn set_content_image(&mut self, image: &Tensor) -> Result<()> {
        self.set_content_target(image)?;
        self.content_image = Some(image.detach());
        Ok(())
    }
}

impl Resizable for PerceptualLoss {
    fn resize_to(&mut self, level: &PyramidLevel) -> Result<()> {
        if let Some(image) = &self.content_image {
            let image = level.resize_image(image)?;
            self.set_content_target(&image)?;
        }
        if let Some(image) = &self.style_image {
            let image = level.resize_image(image)?;
            self.set_style_target(&image)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct RegionTargets {
    name: String,
    style_image: Option<Tensor>,
    style_guide: Option<Tensor>,
    content_guide: Option<Tensor>,
}

/// A perceptual loss whose style term is split into regions, each region
/// having its own style image and guides.
#[derive(Debug)]
pub struct GuidedPerceptualLoss {
    content_loss: Box<dyn Operator>,
    style_loss: OperatorContainer,
    regularization: Option<Box<dyn Operator>>,
    content_image: Option<Tensor>,
    regions: Vec<RegionTargets>,
}

impl GuidedPerceptualLoss {
    /// `style_loss` has one child per region, see `OperatorContainer::multi_region`.
    pub fn new<C: Operator + 'static>(
        content_loss: C,
        style_loss: OperatorContainer,
    ) -> Result<Self> {
        if style_loss.is_empty() {
            return Err(NstError::InvalidConfig("guided style loss without regions".into()));
        }
        let regions = style_loss
            .names()
            .into_iter()
            .map(|name| RegionTargets {
                name: name.to_string(),
                style_image: None,
                style_guide: None,
                content_guide: None,
            })
            .collect();
        Ok(GuidedPerceptualLoss {
            content_loss: Box::new(content_loss),
            style_loss,
            regularization: None,
            content_image: None,
            regions,
        })
    }

    pub fn with_regularization<R: Operator + 'static>(mut self, regularization: R) -> Self {
        self.regularization = Some(Box::new(regularization));
        self
    }

    pub fn content_loss(&self) -> &dyn Operator {
        self.content_loss.as_ref()
    }

    pub fn style_loss(&self) -> &OperatorContainer {
        &self.style_loss
    }

    pub fn regions(&self) -> Vec<&str> {
        self.regions.iter().map(|r| r.name.as_str()).collect()
    }

    /// Regions whose operators still wait for a style image after a guide
    /// change are not ready.
    pub fn state(&self) -> LossState {
        let style = self.regions.iter().all(|r| r.style_image.is_some())
            && self.style_loss.is_ready();
        LossState::new(self.content_image.is_some() && self.content_loss.is_ready(), style)
    }

    fn region_mut(&mut self, region: &str) -> Result<&mut RegionTargets> {
        self.regions
            .iter_mut()
            .find(|r| r.name == region)
            .ok_or_else(|| NstError::UnknownRegion(region.to_string()))
    }

    fn region_context(region: &str) -> impl Fn(NstError) -> NstError + '_ {
        move |err| err.context(format!("region {region}")).context("style_loss")
    }

    fn set_style_target_guide(
        &mut self,
        region: &str,
        guide: &Tensor,
        recompute: bool,
    ) -> Result<()> {
        let res = self.style_loss.set_regional_target_guide(region, guide, recompute);
        clear_storages(&[&self.style_loss as &dyn Operator]);
        res.map_err(Self::region_context(region))
    }

    fn set_style_target_image(&mut self, region: &str, image: &Tensor) -> Result<()> {
        let res = self.style_loss.set_regional_target_image(region, image);
        clear_storages(&[&self.style_loss as &dyn Operator]);
        res.map_err(Self::region_context(region))
    }

    /// Associates a guide with the style image of `region`. With `recompute`
    /// false, the guide only takes effect with the next style image.
    pub fn set_style_guide(&mut self, region: &str, guide: &Tensor, recompute: bool) -> Result<()> {
        let guide = as_guide(guide)?;
        self.region_mut(region)?;
        self.set_style_target_guide(region, &guide, recompute)?;
        self.region_mut(region)?.style_guide = Some(guide);
        Ok(())
    }

    /// Sets the style image of `region`. A guide must be given here or have
    /// been set before with `set_style_guide`.
    pub fn set_style_image(
        &mut self,
        region: &str,
        image: &Tensor,
        guide: Option<&Tensor>,
    ) -> Result<()> {
        match guide {
            Some(guide) => {
                let (guide_size, style_size) = (image_size(guide)?, image_size(image)?);
                if guide_size != style_size {
                    let err = NstError::Shape(format!(
                        "guide of size {guide_size:?} does not match style image {style_size:?}"
                    ));
                    return Err(Self::region_context(region)(err));
                }
                self.set_style_guide(region, guide, false)?
            }
            None => {
                if self.region_mut(region)?.style_guide.is_none() {
                    return Err(NstError::MissingGuide(region.to_string()));
                }
            }
        }
        self.set_style_target_image(region, image)?;
        self.region_mut(region)?.style_image = Some(image.detach());
        Ok(())
    }

    /// Restricts the style loss of `region` to the given part of the input
    /// image.
    pub fn set_content_guide(&mut self, region: &str, guide: &Tensor) -> Result<()> {
        let guide = as_guide(guide)?;
        self.region_mut(region)?;
        self.style_loss
            .set_regional_input_guide(region, &guide)
            .map_err(Self::region_context(region))?;
        self.region_mut(region)?.content_guide = Some(guide);
        Ok(())
    }

    fn set_content_target(&mut self, image: &Tensor) -> Result<()> {
        let res =
            self.content_loss.set_target_image(image).map_err(|err| err.context("content_loss"));
        clear_storages(&[self.content_loss.as_ref()]);
        res
    }

    fn ops(&self) -> Vec<(&str, &dyn Operator)> {
        let mut ops: Vec<(&str, &dyn Operator)> = vec![
            ("content_loss", self.content_loss.as_ref()),
            ("style_loss", &self.style_loss as &dyn Operator),
        ];
        if let Some(r) = &self.regularization {
            ops.push(("regularization", r.as_ref()));
        }
        ops
    }
}

impl Criterion for GuidedPerceptualLoss {
    fn losses(&self, input_image: &Tensor) -> Result<LossDict> {
        self.state().check_ready()?;
        collect_all(input_image, &self.ops())
    }
}

impl ContentCriterion for GuidedPerceptualLoss {
    fn set_content_image(&mut self, image: &Tensor) -> Result<()> {
        self.set_content_target(image)?;
        self.content_image = Some(image.detach());
        Ok(())
    }
}

impl Resizable for GuidedPerceptualLoss {
    fn resize_to(&mut self, level: &PyramidLevel) -> Result<()> {
        if let Some(image) = &self.content_image {
            let image = level.resize_image(image)?;
            self.set_content_target(&image)?;
        }
        let targets: Vec<_> = self
            .regions
            .iter()
            .map(|r| {
                let copy = |t: &Option<Tensor>| t.as_ref().map(|t| t.shallow_clone());
                (r.name.clone(), copy(&r.style_guide), copy(&r.style_image), copy(&r.content_guide))
            })
            .collect();
        for (region, style_guide, style_image, content_guide) in targets {
            // The guide goes first, the stored target image has the previous size.
            if let Some(guide) = style_guide {
                self.set_style_target_guide(&region, &level.resize_guide(&guide)?, false)?;
            }
            if let Some(image) = style_image {
                self.set_style_target_image(&region, &level.resize_image(&image)?)?;
            }
            if let Some(guide) = content_guide {
                self.style_loss
                    .set_regional_input_guide(&region, &level.resize_guide(&guide)?)
                    .map_err(Self::region_context(&region))?;
            }
        }
        Ok(())
    }
}
