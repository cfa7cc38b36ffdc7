//! Image and guide helpers.
//!
//! Images are float tensors of shape `[N, 3, H, W]` with values between 0 and 1,
//! guides are float masks of shape `[1, 1, H, W]`.
use crate::error::{NstError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tch::{Device, Kind, Tensor};

/// The image edge an edge size refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    #[default]
    Short,
    Long,
}

/// Returns the spatial size `(height, width)` of an image, guide or encoding.
pub fn image_size(t: &Tensor) -> Result<(i64, i64)> {
    let size = t.size();
    match size.as_slice() {
        [.., h, w] if size.len() >= 2 => Ok((*h, *w)),
        _ => Err(NstError::Shape(format!("expected at least two dimensions, got {size:?}"))),
    }
}

/// Computes the size of an image with `edge_size` pixels on the selected edge,
/// preserving the aspect ratio.
pub fn edge_to_image_size(edge_size: i64, (h, w): (i64, i64), edge: Edge) -> (i64, i64) {
    let scaled =
        |num: i64, den: i64| ((edge_size * num) as f64 / den as f64).round().max(1.) as i64;
    let height_is_short = h <= w;
    match (edge, height_is_short) {
        (Edge::Short, true) | (Edge::Long, false) => (edge_size, scaled(w, h)),
        (Edge::Short, false) | (Edge::Long, true) => (scaled(h, w), edge_size),
    }
}

fn as_batch(t: &Tensor) -> Result<(Tensor, bool)> {
    match t.dim() {
        3 => Ok((t.unsqueeze(0), true)),
        4 => Ok((t.shallow_clone(), false)),
        d => Err(NstError::Shape(format!("expected a 3d or 4d image, got {d} dimensions"))),
    }
}

/// Resizes an image to `(height, width)` with bilinear interpolation.
pub fn resize_image(image: &Tensor, (h, w): (i64, i64)) -> Result<Tensor> {
    if image_size(image)? == (h, w) {
        return Ok(image.shallow_clone());
    }
    let (xs, squeeze) = as_batch(image)?;
    let xs = xs.f_upsample_bilinear2d([h, w], false, None::<f64>, None::<f64>)?;
    Ok(if squeeze { xs.squeeze_dim(0) } else { xs })
}

/// Resizes a guide to `(height, width)`, nearest neighbour interpolation keeps
/// the mask binary.
pub fn resize_guide(guide: &Tensor, (h, w): (i64, i64)) -> Result<Tensor> {
    let guide = as_guide(guide)?;
    if image_size(&guide)? == (h, w) {
        return Ok(guide);
    }
    Ok(guide.f_upsample_nearest2d([h, w], None::<f64>, None::<f64>)?)
}

/// Converts a `[H, W]`, `[1, H, W]` or `[1, 1, H, W]` mask into a float
/// `[1, 1, H, W]` guide.
pub fn as_guide(guide: &Tensor) -> Result<Tensor> {
    let (h, w) = image_size(guide)?;
    let size = guide.size();
    if size.iter().rev().skip(2).any(|&d| d != 1) || size.len() > 4 {
        return Err(NstError::Shape(format!("a guide has a single channel, got {size:?}")));
    }
    Ok(guide.f_view([1, 1, h, w])?.f_to_kind(Kind::Float)?)
}

/// Loads an image file as a `[1, 3, H, W]` float tensor with values in [0, 1].
pub fn load_image<T: AsRef<Path>>(path: T, device: Device) -> Result<Tensor> {
    let image = tch::vision::image::load(path)?;
    Ok((image.to_kind(Kind::Float) / 255.).unsqueeze(0).to_device(device))
}

/// Saves the first image of a batch, values are clamped to [0, 1].
pub fn save_image<T: AsRef<Path>>(image: &Tensor, path: T) -> Result<()> {
    let (xs, _) = as_batch(image)?;
    let xs = (xs.get(0).clamp(0., 1.) * 255.).round().to_kind(Kind::Uint8).to_device(Device::Cpu);
    tch::vision::image::save(&xs, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_sizes() {
        assert_eq!(edge_to_image_size(100, (200, 400), Edge::Short), (100, 200));
        assert_eq!(edge_to_image_size(100, (200, 400), Edge::Long), (50, 100));
        assert_eq!(edge_to_image_size(100, (400, 200), Edge::Short), (200, 100));
        assert_eq!(edge_to_image_size(100, (400, 200), Edge::Long), (100, 50));
        assert_eq!(edge_to_image_size(64, (32, 32), Edge::Long), (64, 64));
    }
}
