use candle_core::{DType, Device, Tensor, D};
use candle_nn::{loss, Optimizer, VarBuilder, VarMap};
use tracing::info;
use tracing_subscriber::EnvFilter;

use candle_dgt::models::{DualGraphParams, DualGraphTransformer};
use candle_dgt::nn::{GraphBatch, SkeletonModule};
use candle_dgt::sparse::{Adjacency, BatchIndex, EdgeList};

const JOINTS: usize = 5;
const CHANNELS: usize = 3;
const CLASSES: usize = 3;

// 0 is the torso, 1..=4 hang off it
fn skeleton(device: &Device) -> anyhow::Result<Adjacency> {
    let bones = [(0u32, 1u32), (0, 2), (0, 3), (0, 4)];
    let pairs = bones
        .iter()
        .flat_map(|&(a, b)| [(a, b), (b, a)])
        .collect::<Vec<_>>();
    let edges = EdgeList::from_pairs(&pairs, device)?.add_self_loops(JOINTS)?;
    Ok(Adjacency::Shared(edges))
}

// clips of the same class share a constant offset on top of gaussian noise
fn clips(lengths: &[usize], labels: &[u32], device: &Device) -> anyhow::Result<Tensor> {
    let mut frames = Vec::with_capacity(lengths.len());
    for (&len, &label) in lengths.iter().zip(labels) {
        let noise = Tensor::randn(0f32, 1., (len, JOINTS, CHANNELS), device)?;
        frames.push((noise + 2.0 * label as f64)?);
    }
    Ok(Tensor::cat(&frames, 0)?)
}

// cargo run --example synthetic
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();
    let device = Device::Cpu;

    // build a random dataset
    let lengths = [4usize, 6, 5, 3, 7, 4, 5, 6, 4];
    let labels = (0..lengths.len())
        .map(|i| (i % CLASSES) as u32)
        .collect::<Vec<_>>();
    let graph = GraphBatch {
        adjacency: skeleton(&device)?,
        batch: BatchIndex::from_lengths(&lengths, &device)?,
    };
    let xs = clips(&lengths, &labels, &device)?;
    let ys = Tensor::new(labels.as_slice(), &device)?;

    // create a dual graph transformer
    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = DualGraphTransformer::with_params(
        &[CHANNELS, 16, 16],
        DualGraphParams {
            num_heads: 4,
            num_joints: JOINTS,
            num_classes: CLASSES,
            dropout_rate: 0.1,
            ..Default::default()
        },
        vs.pp("dgt"),
    )?;

    // training loop
    let mut optimizer = candle_nn::AdamW::new(
        varmap.all_vars(),
        candle_nn::ParamsAdamW {
            lr: 1e-3,
            ..Default::default()
        },
    )?;
    for epoch in 0..50 {
        let logits = model.forward_t(&xs, &graph, true)?;
        let loss = loss::cross_entropy(&logits, &ys)?;
        optimizer.backward_step(&loss)?;

        if epoch % 5 == 0 {
            let accuracy = model
                .forward(&xs, &graph)?
                .argmax(D::Minus1)?
                .eq(&ys)?
                .to_dtype(DType::F32)?
                .mean_all()?
                .to_scalar::<f32>()?;
            info!(
                "Epoch: {epoch:3} Train loss: {:8.5} Train accuracy {:5.2}%",
                loss.to_scalar::<f32>()?,
                100.0 * accuracy,
            );
        }
    }
    Ok(())
}
