// Transfers the style of an image onto another one, coarse to fine.
// The pre-trained weights for the VGG19 model can be downloaded from:
//   https://github.com/LaurentMazare/tch-rs/releases/download/mw/vgg19.ot
// and are looked up as `vgg19.ot` in the weights directory.
use anyhow::{bail, Result};
use std::rc::Rc;
use tch::{nn, Device};
use tch_nst::enc::{ModelContext, VggArch, VggConfig};
use tch_nst::image::{load_image, save_image};
use tch_nst::loss::ContentCriterion;
use tch_nst::ops::{
    EncodingOperator, FeatureReconstruction, Gram, OperatorContainer, TotalVariation,
};
use tch_nst::optim::{pyramid_image_optimization, ImageOptimConfig};
use tch_nst::{Edge, ImagePyramid, PerceptualLoss};

const CONTENT_LAYER: &str = "relu4_2";
const STYLE_LAYERS: [&str; 5] = ["relu1_1", "relu2_1", "relu3_1", "relu4_1", "relu5_1"];
const STYLE_WEIGHT: f64 = 1e3;
const TV_WEIGHT: f64 = 1e-2;
const EDGE_SIZE: i64 = 512;
const STEPS_PER_LEVEL: usize = 500;

pub fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let device = Device::cuda_if_available();
    let args: Vec<_> = std::env::args().collect();
    let (style_path, content_path, weights_dir) = match args.as_slice() {
        [_, s, c, w] => (s.to_owned(), c.to_owned(), w.to_owned()),
        _ => bail!("usage: main style.jpg content.jpg weights_dir"),
    };

    let ctx = ModelContext::new(weights_dir, device);
    let (_vs, enc) = ctx.load_vgg(VggArch::Vgg19, VggConfig::default())?;
    let enc = Rc::new(enc);

    let content_loss =
        EncodingOperator::new(enc.clone(), CONTENT_LAYER, FeatureReconstruction, 1.)?;
    let style_loss = OperatorContainer::multi_layer(&enc, &STYLE_LAYERS, |layer, enc| {
        Ok(Box::new(EncodingOperator::new(enc, layer, Gram::default(), 1.)?))
    })?
    .with_score_weight(STYLE_WEIGHT);
    let mut criterion = PerceptualLoss::new(content_loss, style_loss)
        .with_regularization(TotalVariation::new(TV_WEIGHT));

    let content_img = load_image(&content_path, device)?;
    let style_img = load_image(&style_path, device)?;
    criterion.set_content_image(&content_img)?;
    criterion.set_style_image(&style_img)?;

    let pyramid = ImagePyramid::octave(EDGE_SIZE, &[STEPS_PER_LEVEL], Some(2), 64, Edge::Short)?;
    let config = ImageOptimConfig { log_freq: Some(100), ..Default::default() };
    let output = pyramid_image_optimization(
        &content_img,
        &mut criterion,
        &pyramid,
        nn::Adam::default(),
        &config,
        |_, _| false,
    )?;
    save_image(&output, "out.jpg")?;
    Ok(())
}
