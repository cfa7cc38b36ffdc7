//! Weighted combinations of operators, across encoder layers or image regions.
use super::Operator;
use crate::enc::MultiLayerEncoder;
use crate::error::{NstError, Result};
use crate::loss::LossDict;
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use tch::Tensor;

/// How the weighted child scores are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// `sum(w_i * s_i) / sum(w_i)`
    #[default]
    Mean,
    /// `sum(w_i * s_i)`
    Sum,
}

/// An ordered collection of named child operators with per-child weights.
#[derive(Debug)]
pub struct OperatorContainer {
    children: Vec<(String, Box<dyn Operator>, f64)>,
    aggregation: Aggregation,
    score_weight: f64,
}

impl Default for OperatorContainer {
    fn default() -> Self {
        Self::new(Aggregation::Mean)
    }
}

impl OperatorContainer {
    pub fn new(aggregation: Aggregation) -> OperatorContainer {
        OperatorContainer { children: vec![], aggregation, score_weight: 1. }
    }

    /// Builds one child per layer, all of them sharing `encoder`.
    pub fn multi_layer<F>(
        encoder: &Rc<MultiLayerEncoder>,
        layers: &[&str],
        mut f: F,
    ) -> Result<Self>
    where
        F: FnMut(&str, Rc<MultiLayerEncoder>) -> Result<Box<dyn Operator>>,
    {
        let mut container = Self::default();
        for &layer in layers {
            encoder.index(layer)?;
            container.push(layer, f(layer, encoder.clone())?, 1.);
        }
        Ok(container)
    }

    /// Builds one child per region.
    pub fn multi_region<F>(regions: &[&str], mut f: F) -> Result<Self>
    where
        F: FnMut(&str) -> Result<Box<dyn Operator>>,
    {
        let mut container = Self::default();
        for &region in regions {
            container.push(region, f(region)?, 1.);
        }
        Ok(container)
    }

    /// Appends a child operator after all the current ones.
    pub fn add<O: Operator + 'static>(mut self, name: &str, op: O, weight: f64) -> Self {
        self.push(name, Box::new(op), weight);
        self
    }

    pub fn push(&mut self, name: &str, op: Box<dyn Operator>, weight: f64) {
        self.children.push((name.to_string(), op, weight))
    }

    pub fn with_score_weight(mut self, score_weight: f64) -> Self {
        self.score_weight = score_weight;
        self
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn score_weight(&self) -> f64 {
        self.score_weight
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.children.iter().map(|(name, _, _)| name.as_str()).collect()
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.children
            .iter()
            .position(|(n, _, _)| n == name)
            .ok_or_else(|| NstError::UnknownRegion(name.to_string()))
    }

    pub fn child(&self, name: &str) -> Result<&dyn Operator> {
        let idx = self.position(name)?;
        Ok(self.children[idx].1.as_ref())
    }

    pub fn child_mut(&mut self, name: &str) -> Result<&mut dyn Operator> {
        let idx = self.position(name)?;
        Ok(self.children[idx].1.as_mut())
    }

    pub fn set_child_weight(&mut self, name: &str, weight: f64) -> Result<()> {
        let idx = self.position(name)?;
        self.children[idx].2 = weight;
        Ok(())
    }

    pub fn set_regional_target_image(&mut self, region: &str, image: &Tensor) -> Result<()> {
        self.child_mut(region)?.set_target_image(image).map_err(|err| err.context(region))
    }

    pub fn set_regional_target_guide(
        &mut self,
        region: &str,
        guide: &Tensor,
        recompute: bool,
    ) -> Result<()> {
        self.child_mut(region)?
            .set_target_guide(guide, recompute)
            .map_err(|err| err.context(region))
    }

    pub fn set_regional_input_guide(&mut self, region: &str, guide: &Tensor) -> Result<()> {
        self.child_mut(region)?.set_input_guide(guide).map_err(|err| err.context(region))
    }

    // The factor each child score is multiplied with.
    fn coefficients(&self) -> Result<Vec<f64>> {
        if self.children.is_empty() {
            return Err(NstError::InvalidConfig("operator container without children".into()));
        }
        let weights = self.children.iter().map(|(_, _, w)| *w);
        match self.aggregation {
            Aggregation::Sum => Ok(weights.map(|w| w * self.score_weight).collect()),
            Aggregation::Mean => {
                let total: f64 = weights.clone().sum();
                if total == 0. {
                    return Err(NstError::InvalidConfig("child weights sum to zero".into()));
                }
                Ok(weights.map(|w| w / total * self.score_weight).collect())
            }
        }
    }
}

impl Operator for OperatorContainer {
    fn score(&self, input_image: &Tensor) -> Result<Tensor> {
        let mut score: Option<Tensor> = None;
        for ((name, op, _), coef) in self.children.iter().zip(self.coefficients()?) {
            let s = op.score(input_image).map_err(|err| err.context(name.as_str()))? * coef;
            score = Some(match score {
                Some(score) => score + s,
                None => s,
            });
        }
        // coefficients() rejects empty containers.
        score.ok_or_else(|| NstError::InvalidConfig("operator container without children".into()))
    }

    fn collect_losses(
        &self,
        input_image: &Tensor,
        prefix: &str,
        losses: &mut LossDict,
    ) -> Result<()> {
        for ((name, op, _), coef) in self.children.iter().zip(self.coefficients()?) {
            let mut child_losses = LossDict::new();
            op.collect_losses(input_image, &format!("{prefix}.{name}"), &mut child_losses)
                .map_err(|err| err.context(name.as_str()))?;
            for (child_name, loss) in child_losses.iter() {
                losses.insert(child_name, loss * coef);
            }
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        !self.children.is_empty() && self.children.iter().all(|(_, op, _)| op.is_ready())
    }

    fn set_target_image(&mut self, image: &Tensor) -> Result<()> {
        for (name, op, _) in self.children.iter_mut() {
            op.set_target_image(image).map_err(|err| err.context(name.as_str()))?;
        }
        Ok(())
    }

    fn set_target_guide(&mut self, guide: &Tensor, recompute: bool) -> Result<()> {
        for (name, op, _) in self.children.iter_mut() {
            op.set_target_guide(guide, recompute).map_err(|err| err.context(name.as_str()))?;
        }
        Ok(())
    }

    fn set_input_guide(&mut self, guide: &Tensor) -> Result<()> {
        for (name, op, _) in self.children.iter_mut() {
            op.set_input_guide(guide).map_err(|err| err.context(name.as_str()))?;
        }
        Ok(())
    }

    fn encoders(&self) -> Vec<Rc<MultiLayerEncoder>> {
        self.children.iter().flat_map(|(_, op, _)| op.encoders()).collect()
    }
}
