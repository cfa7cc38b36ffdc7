//! A feed-forward stylization network, following Johnson et al. "Perceptual
//! Losses for Real-Time Style Transfer and Super-Resolution".
//!
//! The encoder downsamples twice, five residual blocks follow and the decoder
//! upsamples back to the input resolution. Outputs are in [0, 1].
use tch::{nn, nn::ModuleT, Kind, Tensor};

/// Instance normalization with a learned per-channel scale and shift.
#[derive(Debug)]
pub struct InstanceNorm {
    ws: Tensor,
    bs: Tensor,
    eps: f64,
}

pub fn instance_norm(p: nn::Path, channels: i64) -> InstanceNorm {
    InstanceNorm { ws: p.ones("weight", &[channels]), bs: p.zeros("bias", &[channels]), eps: 1e-5 }
}

impl nn::Module for InstanceNorm {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let mean = xs.mean_dim(&[2i64, 3][..], true, Kind::Float);
        let xs = xs - mean;
        let var = xs.square().mean_dim(&[2i64, 3][..], true, Kind::Float);
        let xs = xs / (var + self.eps).sqrt();
        xs * self.ws.view([1, -1, 1, 1]) + self.bs.view([1, -1, 1, 1])
    }
}

// Reflection padding followed by a convolution, the output keeps the input
// resolution for stride 1.
fn conv(p: &nn::Path, c_in: i64, c_out: i64, ksize: i64, stride: i64) -> nn::SequentialT {
    let pad = ksize / 2;
    let cfg = nn::ConvConfig { stride, padding: 0, ..Default::default() };
    nn::seq_t()
        .add_fn(move |xs| xs.reflection_pad2d([pad, pad, pad, pad]))
        .add(nn::conv2d(p / "conv", c_in, c_out, ksize, cfg))
}

fn conv_norm_relu(p: nn::Path, c_in: i64, c_out: i64, ksize: i64, stride: i64) -> nn::SequentialT {
    conv(&p, c_in, c_out, ksize, stride)
        .add(instance_norm(&p / "norm", c_out))
        .add_fn(|xs| xs.relu())
}

fn upsample_conv(p: nn::Path, c_in: i64, c_out: i64, ksize: i64) -> nn::SequentialT {
    nn::seq_t()
        .add_fn(|xs| {
            let size = xs.size();
            let (h, w) = (size[size.len() - 2], size[size.len() - 1]);
            xs.upsample_nearest2d([2 * h, 2 * w], None::<f64>, None::<f64>)
        })
        .add(conv_norm_relu(p, c_in, c_out, ksize, 1))
}

#[derive(Debug)]
struct ResidualBlock {
    block: nn::SequentialT,
}

fn residual_block(p: nn::Path, channels: i64) -> ResidualBlock {
    let block = conv_norm_relu(&p / "0", channels, channels, 3, 1)
        .add(conv(&(&p / "1"), channels, channels, 3, 1))
        .add(instance_norm(&p / "norm", channels));
    ResidualBlock { block }
}

impl ModuleT for ResidualBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs + xs.apply_t(&self.block, train)
    }
}

pub const NUM_RESIDUAL_BLOCKS: usize = 5;

/// Builds the transformer network.
pub fn transformer(p: &nn::Path) -> nn::SequentialT {
    let e = p / "encoder";
    let r = p / "residual";
    let d = p / "decoder";
    let mut seq = nn::seq_t()
        .add(conv_norm_relu(&e / "0", 3, 32, 9, 1))
        .add(conv_norm_relu(&e / "1", 32, 64, 3, 2))
        .add(conv_norm_relu(&e / "2", 64, 128, 3, 2));
    for i in 0..NUM_RESIDUAL_BLOCKS {
        seq = seq.add(residual_block(&r / i, 128));
    }
    seq.add(upsample_conv(&d / "0", 128, 64, 3))
        .add(upsample_conv(&d / "1", 64, 32, 3))
        .add(conv(&(&d / "2"), 32, 3, 9, 1))
        .add_fn(|xs| xs.sigmoid())
}
