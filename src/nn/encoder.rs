use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder};
use tracing::debug;

use super::layers::{AddNorm, FeedForward};
use super::traits::{GraphBatch, SkeletonModule};
use super::utils::{linear, merge_heads, split_heads};
use super::{
    FullAttention, FullAttentionParams, MultiAdjacency, SparseAttention, SparseAttentionParams,
};
use crate::sparse::Stabilization;
use crate::{Error, Result};

/// Which axis an [`EncoderLayer`] attends over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionKind {
    /// Joints of the same frame, along the skeleton edges.
    Spatial,
    /// Frames of the same clip, one joint at a time.
    Temporal,
}

#[derive(Debug, Clone, Copy)]
pub struct EncoderParams {
    pub heads: usize,
    /// Gate the attention residual with a learned sigmoid.
    pub beta: bool,
    pub dropout: f32,
    pub max_position_embeddings: usize,
    pub softmax_temp: Option<f64>,
    pub stabilization: Stabilization,
    pub multi_adjacency: MultiAdjacency,
}
impl Default for EncoderParams {
    fn default() -> Self {
        Self {
            heads: 8,
            beta: true,
            dropout: 0.1,
            max_position_embeddings: 128,
            softmax_temp: None,
            stabilization: Stabilization::default(),
            multi_adjacency: MultiAdjacency::default(),
        }
    }
}

enum Attention {
    Sparse(SparseAttention),
    Full(FullAttention),
}

/// Transformer encoder block over `(frames, joints, channels)` features.
pub struct EncoderLayer {
    lin_q: Linear,
    lin_k: Linear,
    lin_v: Linear,
    residual: Option<Linear>,
    attention: Attention,
    add_norm_att: AddNorm,
    add_norm_ffn: AddNorm,
    ffn: FeedForward,
    heads: usize,
}
impl EncoderLayer {
    pub fn new(
        in_channels: usize,
        mdl_channels: usize,
        kind: AttentionKind,
        params: EncoderParams,
        vs: VarBuilder,
    ) -> Result<Self> {
        if params.heads == 0 || mdl_channels % params.heads != 0 {
            return Err(Error::UnsupportedConfiguration(format!(
                "{mdl_channels} channels cannot be split into {} heads",
                params.heads
            )));
        }
        let head_dim = mdl_channels / params.heads;
        let attention = match kind {
            AttentionKind::Spatial => Attention::Sparse(SparseAttention::with_params(
                SparseAttentionParams {
                    softmax_temp: params.softmax_temp,
                    attention_dropout: params.dropout,
                    stabilization: params.stabilization,
                    multi_adjacency: params.multi_adjacency,
                },
            )),
            AttentionKind::Temporal => Attention::Full(FullAttention::new(
                head_dim,
                FullAttentionParams {
                    softmax_temp: params.softmax_temp,
                    attention_dropout: params.dropout,
                    max_position_embeddings: params.max_position_embeddings,
                },
                vs.pp("attention"),
            )?),
        };
        let residual = if in_channels != mdl_channels {
            Some(linear(in_channels, mdl_channels, vs.pp("residual"))?)
        } else {
            None
        };
        debug!(in_channels, mdl_channels, heads = params.heads, ?kind, "encoder layer");
        Ok(Self {
            lin_q: linear(in_channels, mdl_channels, vs.pp("lin_q"))?,
            lin_k: linear(in_channels, mdl_channels, vs.pp("lin_k"))?,
            lin_v: linear(in_channels, mdl_channels, vs.pp("lin_v"))?,
            residual,
            attention,
            add_norm_att: AddNorm::new(
                mdl_channels,
                params.beta,
                params.dropout,
                vs.pp("add_norm_att"),
            )?,
            add_norm_ffn: AddNorm::new(mdl_channels, false, params.dropout, vs.pp("add_norm_ffn"))?,
            ffn: FeedForward::new(mdl_channels, mdl_channels, params.dropout, vs.pp("ffn"))?,
            heads: params.heads,
        })
    }
}
impl SkeletonModule for EncoderLayer {
    fn forward_t(&self, xs: &Tensor, graph: &GraphBatch, train: bool) -> Result<Tensor> {
        let (frames, _, _) = xs.dims3()?;
        if frames != graph.batch.len() {
            return Err(Error::shape("EncoderLayer", graph.batch.len(), frames));
        }
        let query = split_heads(&xs.apply(&self.lin_q)?, self.heads)?;
        let key = split_heads(&xs.apply(&self.lin_k)?, self.heads)?;
        let value = split_heads(&xs.apply(&self.lin_v)?, self.heads)?;

        let t = match &self.attention {
            // (frames, joints, heads, c): every frame is a graph over joints
            Attention::Sparse(attention) => {
                attention.forward_t(&query, &key, &value, &graph.adjacency, train)?
            }
            // (joints, frames, heads, c): every joint is a sequence over frames
            Attention::Full(attention) => {
                let mask = graph.batch.mask();
                let mask = if mask.all_ones() {
                    None
                } else {
                    Some(mask.additive_matrix(xs.dtype())?)
                };
                let [query, key, value] = [query, key, value]
                    .map(|t| t.permute((1, 0, 2, 3)).and_then(|t| t.contiguous()));
                attention
                    .forward_t(&query?, &key?, &value?, mask.as_ref(), train)?
                    .permute((1, 0, 2, 3))?
            }
        };
        let t = merge_heads(&t.contiguous()?)?;

        let x = match &self.residual {
            Some(residual) => residual.forward(xs)?,
            None => xs.clone(),
        };
        let x = self.add_norm_att.forward_t(&x, &t, train)?;
        let y = self.ffn.forward_t(&x, train)?;
        self.add_norm_ffn.forward_t(&x, &y, train)
    }
}
