#![allow(dead_code)]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tch::{kind, nn, Tensor};
use tch_nst::MultiLayerEncoder;

pub fn from<'a, T>(t: &'a Tensor) -> T
where
    <T as TryFrom<&'a tch::Tensor>>::Error: std::fmt::Debug,
    T: TryFrom<&'a Tensor>,
{
    T::try_from(t).unwrap()
}

pub fn f64_from(t: &Tensor) -> f64 {
    from::<f64>(t)
}

pub struct TmpFile(std::path::PathBuf);

impl TmpFile {
    pub fn create(base: &str) -> TmpFile {
        let filename = std::env::temp_dir().join(format!(
            "tch-nst-{}-{}-{:?}",
            base,
            std::process::id(),
            std::thread::current().id(),
        ));
        TmpFile(filename)
    }

    pub fn exists(&self) -> bool {
        self.0.exists()
    }
}

impl std::convert::AsRef<std::path::Path> for TmpFile {
    fn as_ref(&self) -> &std::path::Path {
        self.0.as_path()
    }
}

impl Drop for TmpFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn conv(p: nn::Path, c_in: i64, c_out: i64) -> nn::Conv2D {
    nn::conv2d(p, c_in, c_out, 3, nn::ConvConfig { padding: 1, ..Default::default() })
}

/// A small randomly initialized encoder:
/// conv1, relu1, conv2, relu2, pool1, conv3, relu3.
pub fn small_encoder(vs: &nn::VarStore) -> MultiLayerEncoder {
    let p = vs.root();
    MultiLayerEncoder::new()
        .add("conv1", conv(&p / "conv1", 3, 4))
        .add_fn("relu1", |xs| xs.relu())
        .add("conv2", conv(&p / "conv2", 4, 8))
        .add_fn("relu2", |xs| xs.relu())
        .add_fn("pool1", |xs| xs.avg_pool2d_default(2))
        .add("conv3", conv(&p / "conv3", 8, 8))
        .add_fn("relu3", |xs| xs.relu())
}

/// An encoder whose layers count how many times they are applied.
pub fn counting_encoder(num_layers: usize) -> (MultiLayerEncoder, Vec<Arc<AtomicUsize>>) {
    let mut enc = MultiLayerEncoder::new();
    let mut counters = vec![];
    for i in 0..num_layers {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        enc = enc.add_fn(&format!("layer{i}"), move |xs| {
            c.fetch_add(1, Ordering::SeqCst);
            xs * 2.
        });
        counters.push(counter)
    }
    (enc, counters)
}

pub fn count(counter: &Arc<AtomicUsize>) -> usize {
    counter.load(Ordering::SeqCst)
}

pub fn rand_image(h: i64, w: i64) -> Tensor {
    Tensor::rand([1, 3, h, w], kind::FLOAT_CPU)
}

/// A `[1, 1, h, w]` guide covering the columns before `split`.
pub fn left_guide(h: i64, w: i64, split: i64) -> Tensor {
    let guide = Tensor::zeros([1, 1, h, w], kind::FLOAT_CPU);
    let _ = guide.narrow(3, 0, split).fill_(1.);
    guide
}
