//! Perceptual criteria and the loss dictionary they report.
mod perceptual;

pub use perceptual::{
    ContentCriterion, Criterion, GuidedPerceptualLoss, LossState, PerceptualLoss,
};

use crate::error::{NstError, Result};
use tch::Tensor;

/// Named scalar losses, in insertion order. The value optimized is the sum of
/// all the entries.
#[derive(Debug, Default)]
pub struct LossDict {
    losses: Vec<(String, Tensor)>,
}

impl LossDict {
    pub fn new() -> LossDict {
        LossDict { losses: vec![] }
    }

    pub fn insert<S: Into<String>>(&mut self, name: S, loss: Tensor) {
        self.losses.push((name.into(), loss))
    }

    pub fn len(&self) -> usize {
        self.losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.losses.iter().find(|(n, _)| n == name).map(|(_, loss)| loss)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.losses.iter().map(|(n, loss)| (n.as_str(), loss))
    }

    /// Sums all the entries.
    pub fn total(&self) -> Result<Tensor> {
        let mut losses = self.losses.iter().map(|(_, loss)| loss);
        let first = losses
            .next()
            .ok_or_else(|| NstError::NotConfigured("empty loss dictionary".to_string()))?;
        Ok(losses.fold(first.shallow_clone(), |acc, loss| acc + loss))
    }

    /// Detached values of all the entries.
    pub fn values(&self) -> Result<Vec<(String, f64)>> {
        self.losses
            .iter()
            .map(|(n, loss)| -> Result<(String, f64)> { Ok((n.clone(), f64::try_from(loss)?)) })
            .collect()
    }
}

impl std::fmt::Display for LossDict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (idx, (name, loss)) in self.losses.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            match f64::try_from(loss) {
                Ok(v) => write!(f, "{name}: {v:.3e}")?,
                Err(_) => write!(f, "{name}: {:?}", loss.size())?,
            }
        }
        Ok(())
    }
}
