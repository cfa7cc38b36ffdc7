//! Neural style transfer building blocks on top of tch.
//!
//! Perceptual losses are built from operators comparing the encodings of a
//! multi-layer encoder, optionally restricted to regions with guides. The
//! resulting criterion can be minimized directly on the pixels of an image,
//! possibly over an image pyramid, or used to train a transformer network.
mod error;
pub use error::{NstError, Result};

pub mod enc;
pub use enc::MultiLayerEncoder;

pub mod image;
pub use image::Edge;

pub mod loss;
pub use loss::{Criterion, GuidedPerceptualLoss, LossDict, PerceptualLoss};

pub mod ops;
pub use ops::Operator;

pub mod optim;
pub mod pyramid;
pub use pyramid::{ImagePyramid, PyramidLevel};

pub mod transformer;
