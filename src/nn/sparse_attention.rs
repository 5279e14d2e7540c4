use candle_core::{Tensor, D};
use candle_nn::Dropout;
use tracing::trace;

use crate::sparse::{segment_softmax, spmm, Adjacency, EdgeList, Stabilization};
use crate::{Error, Result};

/// How [`SparseAttention`] treats an [`Adjacency::PerHead`] input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MultiAdjacency {
    /// Head `h` attends over adjacency `h`.
    #[default]
    PerHead,
    /// Learned scalar mixing of several adjacencies into one softmax.
    /// Its semantics were never pinned down, so selecting it is an error.
    LearnedMixing,
}

#[derive(Debug, Clone, Copy)]
pub struct SparseAttentionParams {
    /// Score scale, `1 / sqrt(head_dim)` when `None`.
    pub softmax_temp: Option<f64>,
    pub attention_dropout: f32,
    pub stabilization: Stabilization,
    pub multi_adjacency: MultiAdjacency,
}
impl Default for SparseAttentionParams {
    fn default() -> Self {
        Self {
            softmax_temp: None,
            attention_dropout: 0.1,
            stabilization: Stabilization::default(),
            multi_adjacency: MultiAdjacency::default(),
        }
    }
}

/// Scaled dot-product attention evaluated only along the edges of an
/// adjacency. Parameter free.
///
/// Edge `(r, c)` scores `query[r] . key[c]`; scores are normalised per
/// query row `r` and the values of the columns are aggregated into `r`.
pub struct SparseAttention {
    softmax_temp: Option<f64>,
    dropout: Dropout,
    stabilization: Stabilization,
    multi_adjacency: MultiAdjacency,
}
impl SparseAttention {
    pub fn new(attention_dropout: f32) -> Self {
        Self::with_params(SparseAttentionParams {
            attention_dropout,
            ..Default::default()
        })
    }
    pub fn with_params(params: SparseAttentionParams) -> Self {
        Self {
            softmax_temp: params.softmax_temp,
            dropout: Dropout::new(params.attention_dropout),
            stabilization: params.stabilization,
            multi_adjacency: params.multi_adjacency,
        }
    }

    /// `queries` `(N, L, H, E)`, `keys` `(N, S, H, E)`, `values`
    /// `(N, S, H, Dv)`; returns `(N, L, H, Dv)`.
    pub fn forward_t(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        values: &Tensor,
        adjacency: &Adjacency,
        train: bool,
    ) -> Result<Tensor> {
        let (n, l, h, e) = queries.dims4()?;
        let (_, s, _, dv) = values.dims4()?;
        if keys.dims() != [n, s, h, e] || values.dims()[..3] != [n, s, h] {
            return Err(Error::shape(
                "SparseAttention",
                format!("keys {:?} and values (.., {dv})", [n, s, h, e]),
                format!("{:?} and {:?}", keys.dims(), values.dims()),
            ));
        }
        let softmax_temp = self.softmax_temp.unwrap_or(1. / (e as f64).sqrt());

        // (N, H, L, E)
        let q = queries.permute((0, 2, 1, 3))?.contiguous()?;
        let k = keys.permute((0, 2, 1, 3))?.contiguous()?;
        let v = values.permute((0, 2, 1, 3))?.contiguous()?;

        let out = match (adjacency, self.multi_adjacency) {
            (Adjacency::Shared(edges), _) => {
                self.attend(&q, &k, &v, edges, l, s, softmax_temp, train)?
            }
            (Adjacency::PerHead(_), MultiAdjacency::PerHead) => {
                // heads become disjoint node ranges of one graph
                let edges = adjacency.offset_concat(h, l, s)?;
                let q = q.reshape((n, 1, h * l, e))?;
                let k = k.reshape((n, 1, h * s, e))?;
                let v = v.reshape((n, 1, h * s, dv))?;
                self.attend(&q, &k, &v, &edges, h * l, h * s, softmax_temp, train)?
                    .reshape((n, h, l, dv))?
            }
            (Adjacency::PerHead(_), MultiAdjacency::LearnedMixing) => {
                return Err(Error::UnsupportedConfiguration(
                    "learned mixing of several adjacency matrices is not implemented".to_string(),
                ))
            }
        };
        Ok(out.permute((0, 2, 1, 3))?.contiguous()?)
    }

    #[allow(clippy::too_many_arguments)]
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        edges: &EdgeList,
        l: usize,
        s: usize,
        softmax_temp: f64,
        train: bool,
    ) -> Result<Tensor> {
        edges.check_bounds("SparseAttention", l, s)?;
        trace!(edges = edges.len(), l, s, "sparse attention");
        let qk = (q.index_select(edges.rows().tensor(), 2)?
            * k.index_select(edges.cols().tensor(), 2)?)?
        .sum(D::Minus1)?;
        let alpha = segment_softmax(
            &(qk * softmax_temp)?,
            Some(edges.rows()),
            Some(l),
            D::Minus1,
            self.stabilization,
        )?;
        let alpha = self.dropout.forward(&alpha, train)?;
        spmm(edges, &alpha, l, s, v)
    }
}
