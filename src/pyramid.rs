//! Coarse-to-fine image pyramids.
//!
//! The optimization runs successively on larger versions of the image. Before
//! each level the working image and all its resize-dependent collaborators,
//! typically the criterion with its target images and guides, are resized.
use crate::error::{NstError, Result};
use crate::image::{edge_to_image_size, image_size, resize_guide, resize_image, Edge};
use serde::{Deserialize, Serialize};
use tch::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyramidLevel {
    pub edge_size: i64,
    pub num_steps: usize,
    #[serde(default)]
    pub edge: Edge,
}

impl PyramidLevel {
    pub fn new(edge_size: i64, num_steps: usize, edge: Edge) -> PyramidLevel {
        PyramidLevel { edge_size, num_steps, edge }
    }

    /// The size at this level of an image of size `(h, w)`.
    pub fn image_size(&self, size: (i64, i64)) -> (i64, i64) {
        edge_to_image_size(self.edge_size, size, self.edge)
    }

    pub fn resize_image(&self, image: &Tensor) -> Result<Tensor> {
        resize_image(image, self.image_size(image_size(image)?))
    }

    pub fn resize_guide(&self, guide: &Tensor) -> Result<Tensor> {
        resize_guide(guide, self.image_size(image_size(guide)?))
    }
}

/// Something that has to be adapted to the resolution of a pyramid level.
pub trait Resizable {
    fn resize_to(&mut self, level: &PyramidLevel) -> Result<()>;
}

impl Resizable for () {
    fn resize_to(&mut self, _level: &PyramidLevel) -> Result<()> {
        Ok(())
    }
}

impl<R: Resizable + ?Sized> Resizable for &mut R {
    fn resize_to(&mut self, level: &PyramidLevel) -> Result<()> {
        (**self).resize_to(level)
    }
}

impl<A: Resizable, B: Resizable> Resizable for (A, B) {
    fn resize_to(&mut self, level: &PyramidLevel) -> Result<()> {
        self.0.resize_to(level)?;
        self.1.resize_to(level)
    }
}

fn per_level<T: Copy>(values: &[T], num_levels: usize, what: &str) -> Result<Vec<T>> {
    match values {
        [value] => Ok(vec![*value; num_levels]),
        values if values.len() == num_levels => Ok(values.to_vec()),
        values => Err(NstError::InvalidConfig(format!(
            "expected one or {num_levels} values for {what}, got {}",
            values.len()
        ))),
    }
}

/// An ordered sequence of levels with strictly ascending edge sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<PyramidLevel>", into = "Vec<PyramidLevel>")]
pub struct ImagePyramid {
    levels: Vec<PyramidLevel>,
}

impl TryFrom<Vec<PyramidLevel>> for ImagePyramid {
    type Error = NstError;

    fn try_from(levels: Vec<PyramidLevel>) -> Result<Self> {
        Self::from_levels(levels)
    }
}

impl From<ImagePyramid> for Vec<PyramidLevel> {
    fn from(pyramid: ImagePyramid) -> Self {
        pyramid.levels
    }
}

impl ImagePyramid {
    pub fn from_levels(levels: Vec<PyramidLevel>) -> Result<ImagePyramid> {
        if levels.is_empty() {
            return Err(NstError::InvalidConfig("a pyramid needs at least one level".into()));
        }
        if let Some(level) = levels.iter().find(|l| l.edge_size <= 0) {
            return Err(NstError::InvalidConfig(format!("invalid edge size {}", level.edge_size)));
        }
        if levels.windows(2).any(|w| w[0].edge_size >= w[1].edge_size) {
            let sizes: Vec<_> = levels.iter().map(|l| l.edge_size).collect();
            return Err(NstError::InvalidConfig(format!(
                "edge sizes have to be strictly ascending, got {sizes:?}"
            )));
        }
        Ok(ImagePyramid { levels })
    }

    /// `num_steps` and `edges` hold either a single value used for all the
    /// levels or one value per level.
    pub fn new(edge_sizes: &[i64], num_steps: &[usize], edges: &[Edge]) -> Result<ImagePyramid> {
        let n = edge_sizes.len();
        let num_steps = per_level(num_steps, n, "the number of steps")?;
        let edges = per_level(edges, n, "the edges")?;
        let levels = edge_sizes
            .iter()
            .zip(num_steps)
            .zip(edges)
            .map(|((&edge_size, num_steps), edge)| PyramidLevel { edge_size, num_steps, edge })
            .collect();
        Self::from_levels(levels)
    }

    /// A pyramid where each level doubles the edge size of the previous one,
    /// ending at `max_edge_size`. Without an explicit number of levels, the
    /// pyramid has as many levels as fit above `min_edge_size`.
    pub fn octave(
        max_edge_size: i64,
        num_steps: &[usize],
        num_levels: Option<usize>,
        min_edge_size: i64,
        edge: Edge,
    ) -> Result<ImagePyramid> {
        if min_edge_size <= 0 || max_edge_size < min_edge_size {
            return Err(NstError::InvalidConfig(format!(
                "invalid edge size range {min_edge_size}..{max_edge_size}"
            )));
        }
        let num_levels = num_levels.unwrap_or_else(|| {
            (max_edge_size as f64 / min_edge_size as f64).log2().floor() as usize + 1
        });
        let edge_sizes: Vec<i64> = (0..num_levels)
            .map(|l| {
                let factor = 2f64.powi((num_levels - 1 - l) as i32);
                (max_edge_size as f64 / factor).round() as i64
            })
            .collect();
        Self::new(&edge_sizes, num_steps, &[edge])
    }

    pub fn levels(&self) -> &[PyramidLevel] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn total_steps(&self) -> usize {
        self.levels.iter().map(|l| l.num_steps).sum()
    }

    /// Runs `f` on each level in ascending order. Before calling `f`, the
    /// working image and `target` are resized to the level. `f` receives the
    /// level index, the level, the target and the resized image, and returns
    /// the image handed over to the next level.
    pub fn run<R, F>(&self, image: &Tensor, target: &mut R, mut f: F) -> Result<Tensor>
    where
        R: Resizable + ?Sized,
        F: FnMut(usize, &PyramidLevel, &mut R, Tensor) -> Result<Tensor>,
    {
        let original_size = image_size(image)?;
        let mut image = image.shallow_clone();
        for (idx, level) in self.levels.iter().enumerate() {
            let (h, w) = level.image_size(original_size);
            tracing::info!(
                level = idx,
                edge_size = level.edge_size,
                height = h,
                width = w,
                num_steps = level.num_steps,
                "pyramid level"
            );
            let context = |err: NstError| err.context(format!("pyramid level {idx}"));
            image = resize_image(&image, (h, w)).map_err(context)?;
            target.resize_to(level).map_err(context)?;
            image = f(idx, level, target, image).map_err(context)?;
        }
        Ok(image)
    }
}
