use std::rc::Rc;
use tch::{kind, nn, Device, Tensor};
use tch_nst::loss::LossDict;
use tch_nst::ops::{
    Aggregation, EncodingOperator, FeatureReconstruction, Gram, Mrf, OperatorContainer,
    TotalVariation,
};
use tch_nst::{MultiLayerEncoder, NstError, Operator};

mod test_utils;
use test_utils::*;

fn identity_encoder() -> Rc<MultiLayerEncoder> {
    Rc::new(
        MultiLayerEncoder::new()
            .add_fn("identity", |xs| xs.shallow_clone())
            .add_fn("pool", |xs| xs.avg_pool2d_default(2)),
    )
}

fn constant_image(h: i64, w: i64, value: f64) -> Tensor {
    Tensor::full([1, 3, h, w], value, kind::FLOAT_CPU)
}

#[test]
fn feature_reconstruction() {
    tch::manual_seed(42);
    let vs = nn::VarStore::new(Device::Cpu);
    let enc = Rc::new(small_encoder(&vs));
    let mut op = EncodingOperator::new(enc.clone(), "relu2", FeatureReconstruction, 2.).unwrap();
    let image = rand_image(8, 8);
    match op.score(&image) {
        Err(err) => assert!(matches!(err.root(), NstError::NotConfigured(_)), "{err}"),
        Ok(_) => panic!("scoring without a target should fail"),
    }
    assert!(!op.is_ready());
    op.set_target_image(&image).unwrap();
    assert!(op.is_ready());
    assert!(f64_from(&op.score(&image).unwrap()) < 1e-12);

    let other = rand_image(8, 8);
    let score = f64_from(&op.score(&other).unwrap());
    assert!(score > 0.);
    op.set_score_weight(4.);
    let scaled = f64_from(&op.score(&other).unwrap());
    assert!((scaled - 2. * score).abs() < 1e-6 * score.max(1.));
    assert_eq!(enc.registered_layers(), ["relu2"]);
}

#[test]
fn unknown_layer_operator() {
    let enc = identity_encoder();
    let err = EncodingOperator::new(enc, "conv1_1", Gram::default(), 1.).unwrap_err();
    assert!(matches!(err, NstError::UnknownLayer { .. }));
}

#[test]
fn gram_channel_normalization() {
    let enc = identity_encoder();
    let target = constant_image(4, 4, 0.5);
    let input = constant_image(4, 4, 1.);
    let mut scores = vec![];
    for channel_normalize in [false, true] {
        let gram = Gram { normalize: true, channel_normalize };
        let mut op = EncodingOperator::new(enc.clone(), "identity", gram, 1.).unwrap();
        op.set_target_image(&target).unwrap();
        scores.push(f64_from(&op.score(&input).unwrap()));
    }
    // Gram entries are 1 and 0.25, divided by 3 channels in the second case.
    assert!((scores[0] - 0.5625).abs() < 1e-6);
    assert!((scores[1] - 0.5625 / 9.).abs() < 1e-6);
}

#[test]
fn mrf() {
    tch::manual_seed(42);
    let enc = identity_encoder();
    let mut op = EncodingOperator::new(enc, "identity", Mrf::default(), 1.).unwrap();
    let image = rand_image(6, 6);
    op.set_target_image(&image).unwrap();
    assert!(f64_from(&op.score(&image).unwrap()) < 1e-10);
    assert!(f64_from(&op.score(&rand_image(6, 6)).unwrap()) > 0.);
    // Patches can be matched across images of different sizes.
    assert!(op.score(&rand_image(5, 7)).is_ok());

    // A single target is matched against every sample of a batch.
    let batch = Tensor::cat(&[image.shallow_clone(), rand_image(6, 6)], 0);
    let scores = op.score(&batch).unwrap();
    assert_eq!(scores.size(), Vec::<i64>::new());
    let mut single =
        EncodingOperator::new(identity_encoder(), "identity", Mrf::default(), 1.).unwrap();
    single.set_target_image(&image).unwrap();
    let second = f64_from(&single.score(&batch.narrow(0, 1, 1)).unwrap());
    // The first sample matches exactly, the batch score averages both.
    assert!((f64_from(&scores) - second / 2.).abs() < 1e-6);
}

#[test]
fn regional_weighted_mean() {
    tch::manual_seed(42);
    let vs = nn::VarStore::new(Device::Cpu);
    let enc = Rc::new(small_encoder(&vs));
    let guide = Tensor::rand([1, 1, 8, 8], kind::FLOAT_CPU).ge(0.5).to_kind(tch::Kind::Float);
    let guides = [guide.shallow_clone(), 1. - &guide];
    let mut container = OperatorContainer::multi_region(&["a", "b"], |_| {
        let op = OperatorContainer::multi_layer(&enc, &["relu1", "relu3"], |layer, enc| {
            Ok(Box::new(EncodingOperator::new(enc, layer, Gram::default(), 1.)?))
        })?;
        Ok(Box::new(op))
    })
    .unwrap();
    container.set_child_weight("b", 3.).unwrap();
    for (region, guide) in ["a", "b"].iter().zip(guides.iter()) {
        container.set_regional_target_guide(region, guide, false).unwrap();
        container.set_regional_target_image(region, &rand_image(8, 8)).unwrap();
        container.set_regional_input_guide(region, guide).unwrap();
    }
    assert!(container.is_ready());

    let input = rand_image(8, 8);
    let score = f64_from(&container.score(&input).unwrap());
    let a = f64_from(&container.child("a").unwrap().score(&input).unwrap());
    let b = f64_from(&container.child("b").unwrap().score(&input).unwrap());
    assert!(((a + 3. * b) / 4. - score).abs() < 1e-6 * score.max(1.));

    let mut losses = LossDict::new();
    container.collect_losses(&input, "style", &mut losses).unwrap();
    let names: Vec<_> = losses.iter().map(|(name, _)| name.to_string()).collect();
    assert_eq!(names, ["style.a.relu1", "style.a.relu3", "style.b.relu1", "style.b.relu3"]);
    assert!((f64_from(&losses.total().unwrap()) - score).abs() < 1e-6 * score.max(1.));

    let container = container.with_aggregation(Aggregation::Sum).with_score_weight(2.);
    let summed = f64_from(&container.score(&input).unwrap());
    assert!((2. * (a + 3. * b) - summed).abs() < 1e-6 * summed.max(1.));
    assert!(matches!(container.child("c"), Err(NstError::UnknownRegion(_))));
}

#[test]
fn empty_container() {
    let container = OperatorContainer::new(Aggregation::Mean);
    assert!(!container.is_ready());
    assert!(matches!(container.score(&rand_image(4, 4)), Err(NstError::InvalidConfig(_))));
}

#[test]
fn guide_resize_invariance() {
    let enc = identity_encoder();
    let mut scores = vec![];
    for (size, split) in [(16, 4), (32, 8)] {
        let guide = left_guide(size, size, split);
        for layer in ["identity", "pool"] {
            let mut op =
                EncodingOperator::new(enc.clone(), layer, FeatureReconstruction, 1.).unwrap();
            op.set_target_guide(&guide, false).unwrap();
            op.set_target_image(&constant_image(size, size, 0.7)).unwrap();
            op.set_input_guide(&guide).unwrap();
            scores.push(f64_from(&op.score(&constant_image(size, size, 0.2)).unwrap()));

            let mut op = EncodingOperator::new(enc.clone(), layer, Gram::default(), 1.).unwrap();
            op.set_target_guide(&guide, false).unwrap();
            op.set_target_image(&constant_image(size, size, 0.7)).unwrap();
            op.set_input_guide(&guide).unwrap();
            scores.push(f64_from(&op.score(&constant_image(size, size, 0.2)).unwrap()));
        }
    }
    // A quarter of the image differs by 0.5.
    assert!((scores[0] - 0.0625).abs() < 1e-6);
    for (s16, s32) in scores[..4].iter().zip(scores[4..].iter()) {
        assert!((s16 - s32).abs() < 1e-6, "{scores:?}");
    }
}

#[test]
fn deferred_guide_recomputation() {
    let enc = identity_encoder();
    let mut op = EncodingOperator::new(enc, "pool", Gram::default(), 1.).unwrap();
    op.set_target_image(&rand_image(16, 16)).unwrap();
    assert!(op.is_ready());

    // The stored target image is 16x16, the guide 8x8.
    let guide = left_guide(8, 8, 4);
    op.set_target_guide(&guide, false).unwrap();
    assert!(op.is_stale());
    assert!(!op.is_ready());
    match op.score(&rand_image(8, 8)) {
        Err(err) => assert!(matches!(err.root(), NstError::NotConfigured(_)), "{err}"),
        Ok(_) => panic!("scoring with a stale target should fail"),
    }
    op.set_target_image(&rand_image(8, 8)).unwrap();
    assert!(!op.is_stale());
    assert!(op.score(&rand_image(8, 8)).is_ok());

    // Recomputing right away surfaces the mismatch.
    let err = op.set_target_guide(&left_guide(4, 4, 2), true).unwrap_err();
    assert!(matches!(err.root(), NstError::Shape(_)), "{err}");
    // and keeps the previous guide and representation.
    assert!(op.is_ready());
    assert_eq!(op.target_guide().unwrap().size(), [1, 1, 8, 8]);
    assert!(op.score(&rand_image(8, 8)).is_ok());

    // A rejected target image does not discard the current one either.
    assert!(op.set_target_image(&rand_image(16, 16)).is_err());
    assert!(op.is_ready());
    assert!(op.score(&rand_image(8, 8)).is_ok());
}

#[test]
fn target_encodings_are_not_cached() {
    tch::manual_seed(42);
    let vs = nn::VarStore::new(Device::Cpu);
    let enc = Rc::new(small_encoder(&vs));
    let mut op = EncodingOperator::new(enc.clone(), "relu3", FeatureReconstruction, 1.).unwrap();
    let image = rand_image(8, 8).set_requires_grad(true);
    op.set_target_image(&image).unwrap();
    assert_eq!(enc.num_cached_images(), 0);

    // Scoring the target itself still tracks the gradient of the image.
    let score = op.score(&(&image + 0.1)).unwrap();
    assert!(score.requires_grad());
    let score = op.score(&image).unwrap();
    assert!(score.requires_grad());
    let perturbed = op.score(&(&image * 0.5)).unwrap();
    perturbed.backward();
    assert!(image.grad().defined());
}

#[test]
fn input_guide_mismatch() {
    let enc = identity_encoder();
    let mut op = EncodingOperator::new(enc, "identity", FeatureReconstruction, 1.).unwrap();
    op.set_target_image(&rand_image(8, 8)).unwrap();
    op.set_input_guide(&left_guide(4, 4, 2)).unwrap();
    let err = op.score(&rand_image(8, 8)).unwrap_err();
    assert!(matches!(err.root(), NstError::Shape(_)));
    assert!(err.to_string().contains("identity"), "{err}");
    assert!(op.set_input_guide(&Tensor::ones([2, 4, 4], kind::FLOAT_CPU)).is_err());
}

#[test]
fn total_variation() {
    let tv = TotalVariation::default();
    assert_eq!(f64_from(&tv.score(&constant_image(4, 4, 0.3)).unwrap()), 0.);
    let stripes = Tensor::zeros([1, 3, 4, 4], kind::FLOAT_CPU);
    let _ = stripes.narrow(3, 1, 1).fill_(1.);
    // 2 transitions per row, 4 rows, 3 channels, over 48 pixels.
    let score = f64_from(&tv.score(&stripes).unwrap());
    assert!((score - 0.5).abs() < 1e-6);
    assert!(TotalVariation::new(1.).score(&constant_image(1, 4, 0.)).is_err());
}
