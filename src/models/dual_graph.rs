use candle_core::Tensor;
use candle_nn::{Activation, Dropout, Linear, Module, VarBuilder};
use tracing::debug;

use crate::nn::utils::linear;
use crate::nn::{
    AttentionKind, EncoderLayer, EncoderParams, GraphBatch, PositionalEncoding, SkeletonModule,
};
use crate::sparse::Stabilization;
use crate::{Error, Result};

pub struct DualGraphParams {
    pub num_heads: usize,
    pub num_joints: usize,
    pub num_classes: usize,
    pub dropout_rate: f32,
    pub beta: bool,
    pub max_position_embeddings: usize,
    /// Add a sinusoidal code of the joint id to the input features.
    pub joint_encoding: bool,
    pub stabilization: Stabilization,
    pub activation_fn: Activation,
}
impl Default for DualGraphParams {
    fn default() -> Self {
        Self {
            num_heads: 8,
            num_joints: 25,
            num_classes: 60,
            dropout_rate: 0.5,
            beta: true,
            max_position_embeddings: 128,
            joint_encoding: true,
            stabilization: Stabilization::default(),
            activation_fn: Activation::Relu,
        }
    }
}

/// Alternating spatial (sparse, over the skeleton) and temporal (dense, over
/// the frames of a clip) encoder layers, pooled per clip and classified.
///
/// Input `(frames, joints, channels)` with frames of all clips stacked;
/// output `(clips, num_classes)` logits.
pub struct DualGraphTransformer {
    joint_encoding: Option<PositionalEncoding>,
    spatial_layers: Vec<EncoderLayer>,
    temporal_layers: Vec<EncoderLayer>,
    dropout: Dropout,
    activation_fn: Activation,
    final_layer: Linear,
    num_joints: usize,
}
impl DualGraphTransformer {
    pub fn new(layer_sizes: &[usize], vs: VarBuilder) -> Result<Self> {
        Self::with_params(layer_sizes, DualGraphParams::default(), vs)
    }
    pub fn with_params(
        layer_sizes: &[usize],
        params: DualGraphParams,
        vs: VarBuilder,
    ) -> Result<Self> {
        if layer_sizes.len() < 2 {
            return Err(Error::UnsupportedConfiguration(
                "need at least an input and one layer size".to_string(),
            ));
        }
        let encoder = EncoderParams {
            heads: params.num_heads,
            beta: params.beta,
            dropout: params.dropout_rate,
            max_position_embeddings: params.max_position_embeddings,
            stabilization: params.stabilization,
            ..Default::default()
        };
        let mut spatial_layers = Vec::new();
        let mut temporal_layers = Vec::new();
        for i in 1..layer_sizes.len() {
            let (in_dim, out_dim) = (layer_sizes[i - 1], layer_sizes[i]);
            spatial_layers.push(EncoderLayer::new(
                in_dim,
                out_dim,
                AttentionKind::Spatial,
                encoder,
                vs.pp(format!("spatial_{}", i)),
            )?);
            temporal_layers.push(EncoderLayer::new(
                out_dim,
                out_dim,
                AttentionKind::Temporal,
                encoder,
                vs.pp(format!("temporal_{}", i)),
            )?);
        }
        let joint_encoding = if params.joint_encoding {
            Some(PositionalEncoding::new(layer_sizes[0], params.num_joints, vs.device())?)
        } else {
            None
        };
        let out_dim = layer_sizes[layer_sizes.len() - 1];
        debug!(
            layers = spatial_layers.len(),
            joints = params.num_joints,
            classes = params.num_classes,
            "dual graph transformer"
        );
        Ok(Self {
            joint_encoding,
            spatial_layers,
            temporal_layers,
            dropout: Dropout::new(params.dropout_rate),
            activation_fn: params.activation_fn,
            final_layer: linear(
                out_dim * params.num_joints,
                params.num_classes,
                vs.pp("final_layer"),
            )?,
            num_joints: params.num_joints,
        })
    }
}
impl SkeletonModule for DualGraphTransformer {
    fn forward_t(&self, xs: &Tensor, graph: &GraphBatch, train: bool) -> Result<Tensor> {
        let (_, joints, _) = xs.dims3()?;
        if joints != self.num_joints {
            return Err(Error::shape("DualGraphTransformer", self.num_joints, joints));
        }
        let mut h = match &self.joint_encoding {
            Some(encoding) => encoding.forward(xs)?,
            None => xs.clone(),
        };
        for (spatial, temporal) in self.spatial_layers.iter().zip(&self.temporal_layers) {
            h = spatial.forward_t(&h, graph, train)?.relu()?;
            let t = self.dropout.forward(&temporal.forward_t(&h, graph, train)?, train)?;
            h = (t + h)?.relu()?;
        }
        let pooled = graph.batch.segment_mean(&h)?.flatten_from(1)?;
        Ok(self
            .activation_fn
            .forward(&pooled)?
            .apply(&self.final_layer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::{Adjacency, BatchIndex, EdgeList};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn chain(joints: u32) -> Result<Adjacency> {
        let pairs = (1..joints)
            .flat_map(|j| [(j - 1, j), (j, j - 1)])
            .collect::<Vec<_>>();
        let edges = EdgeList::from_pairs(&pairs, &Device::Cpu)?;
        Ok(Adjacency::Shared(edges.add_self_loops(joints as usize)?))
    }

    fn small_params() -> DualGraphParams {
        DualGraphParams {
            num_heads: 2,
            num_joints: 4,
            num_classes: 3,
            dropout_rate: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn logits_per_clip() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = DualGraphTransformer::with_params(&[3, 8, 8], small_params(), vs)?;
        let graph = GraphBatch {
            adjacency: chain(4)?,
            batch: BatchIndex::from_lengths(&[3, 5], &Device::Cpu)?,
        };
        let xs = Tensor::randn(0f32, 1., (8, 4, 3), &Device::Cpu)?;
        assert_eq!(model.forward(&xs, &graph)?.dims(), &[2, 3]);
        Ok(())
    }

    #[test]
    fn gradients_reach_every_parameter() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = DualGraphTransformer::with_params(&[3, 4], small_params(), vs)?;
        let graph = GraphBatch {
            adjacency: chain(4)?,
            batch: BatchIndex::from_lengths(&[2, 2], &Device::Cpu)?,
        };
        let xs = Tensor::randn(0f32, 1., (4, 4, 3), &Device::Cpu)?;
        let labels = Tensor::new(&[0u32, 2], &Device::Cpu)?;
        let logits = model.forward(&xs, &graph)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &labels)?;
        let grads = loss.backward()?;
        for var in varmap.all_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
        Ok(())
    }

    #[test]
    fn rejects_wrong_joint_count() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = DualGraphTransformer::with_params(&[3, 4], small_params(), vs)?;
        let graph = GraphBatch {
            adjacency: chain(5)?,
            batch: BatchIndex::from_lengths(&[2], &Device::Cpu)?,
        };
        let xs = Tensor::zeros((2, 5, 3), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            model.forward(&xs, &graph),
            Err(Error::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn needs_at_least_one_layer() {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(matches!(
            DualGraphTransformer::with_params(&[3], small_params(), vs),
            Err(Error::UnsupportedConfiguration(_))
        ));
    }
}
