use candle_core::{Device, Tensor, D};
use candle_nn::{embedding, ops, Dropout, Embedding, Module, VarBuilder};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct FullAttentionParams {
    /// Score scale, `1 / sqrt(head_dim)` when `None`.
    pub softmax_temp: Option<f64>,
    pub attention_dropout: f32,
    /// Relative distances are clipped to `[-max, max]`.
    pub max_position_embeddings: usize,
}
impl Default for FullAttentionParams {
    fn default() -> Self {
        Self {
            softmax_temp: None,
            attention_dropout: 0.1,
            max_position_embeddings: 128,
        }
    }
}

/// Dense scaled dot-product attention with learned relative-position scores
/// on both the query and the key side.
pub struct FullAttention {
    softmax_temp: Option<f64>,
    dropout: Dropout,
    max_position_embeddings: usize,
    distance_embedding: Embedding,
}
impl FullAttention {
    pub fn new(head_dim: usize, params: FullAttentionParams, vs: VarBuilder) -> Result<Self> {
        let max = params.max_position_embeddings;
        Ok(Self {
            softmax_temp: params.softmax_temp,
            dropout: Dropout::new(params.attention_dropout),
            max_position_embeddings: max,
            distance_embedding: embedding(2 * max + 1, head_dim, vs.pp("distance_embedding"))?,
        })
    }

    /// `(L, S, E)` embeddings of the clipped distances `l - s`.
    fn relative_positions(&self, l: usize, s: usize, device: &Device) -> Result<Tensor> {
        let max = self.max_position_embeddings as i64;
        let ids = (0..l as i64)
            .flat_map(|i| (0..s as i64).map(move |j| ((i - j).clamp(-max, max) + max) as u32))
            .collect::<Vec<_>>();
        let ids = Tensor::from_vec(ids, (l, s), device)?;
        Ok(self.distance_embedding.forward(&ids)?)
    }

    /// `queries` `(N, L, H, E)`, `keys` `(N, S, H, E)`, `values` `(N, S, H, Dv)`,
    /// optional additive `mask` broadcastable to `(N, H, L, S)`; returns
    /// `(N, L, H, Dv)`.
    pub fn forward_t(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        values: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (n, l, h, e) = queries.dims4()?;
        let (_, s, _, dv) = values.dims4()?;
        if keys.dims() != [n, s, h, e] || values.dims()[..3] != [n, s, h] {
            return Err(Error::shape(
                "FullAttention",
                format!("keys {:?} and values (.., {dv})", [n, s, h, e]),
                format!("{:?} and {:?}", keys.dims(), values.dims()),
            ));
        }
        let softmax_temp = self.softmax_temp.unwrap_or(1. / (e as f64).sqrt());
        let device = self.distance_embedding.embeddings().device();

        // (N, H, L, S)
        let q = queries.permute((0, 2, 1, 3))?.contiguous()?;
        let k = keys.permute((0, 2, 1, 3))?.contiguous()?;
        let qk = q.matmul(&k.t()?.contiguous()?)?;

        let positions = self.relative_positions(l, s, device)?;
        let query_scores = queries
            .permute((1, 0, 2, 3))?
            .contiguous()?
            .reshape((l, n * h, e))?
            .matmul(&positions.transpose(1, 2)?.contiguous()?)?
            .reshape((l, n, h, s))?
            .permute((1, 2, 0, 3))?;
        let key_scores = keys
            .permute((1, 0, 2, 3))?
            .contiguous()?
            .reshape((s, n * h, e))?
            .matmul(&positions.permute((1, 2, 0))?.contiguous()?)?
            .reshape((s, n, h, l))?
            .permute((1, 2, 3, 0))?;
        let mut qk = ((qk + query_scores)? + key_scores)?;
        if let Some(mask) = mask {
            qk = qk.broadcast_add(mask)?;
        }

        let attention = ops::softmax(&(qk * softmax_temp)?, D::Minus1)?;
        let attention = self.dropout.forward(&attention, train)?;
        let v = values.permute((0, 2, 1, 3))?.contiguous()?;
        Ok(attention
            .matmul(&v)?
            .permute((0, 2, 1, 3))?
            .contiguous()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::BatchIndex;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn attention(head_dim: usize, varmap: &VarMap) -> Result<FullAttention> {
        let vs = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        FullAttention::new(
            head_dim,
            FullAttentionParams {
                attention_dropout: 0.0,
                max_position_embeddings: 2,
                ..Default::default()
            },
            vs.pp("attn"),
        )
    }

    #[test]
    fn output_shape() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let attn = attention(4, &varmap)?;
        let q = Tensor::randn(0f32, 1., (3, 5, 2, 4), &Device::Cpu)?;
        let v = Tensor::randn(0f32, 1., (3, 5, 2, 6), &Device::Cpu)?;
        let out = attn.forward_t(&q, &q, &v, None, false)?;
        assert_eq!(out.dims(), &[3, 5, 2, 6]);
        Ok(())
    }

    #[test]
    fn mask_keeps_clips_apart() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let attn = attention(2, &varmap)?;
        let batch = BatchIndex::from_lengths(&[2, 1], &Device::Cpu)?;
        let mask = batch.mask().additive_matrix(DType::F32)?;
        let q = Tensor::randn(0f32, 1., (1, 3, 1, 2), &Device::Cpu)?;
        // frames of clip 0 carry value 1, the single frame of clip 1 carries 7
        let v = Tensor::new(&[1f32, 1., 7.], &Device::Cpu)?.reshape((1, 3, 1, 1))?;
        let out = attn.forward_t(&q, &q, &v, Some(&mask), false)?;
        let out = out.flatten_all()?.to_vec1::<f32>()?;
        for (o, e) in out.iter().zip([1f32, 1., 7.]) {
            assert!((o - e).abs() < 1e-5, "{out:?}");
        }
        Ok(())
    }

    #[test]
    fn rejects_mismatched_keys() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let attn = attention(4, &varmap)?;
        let q = Tensor::zeros((1, 2, 2, 4), DType::F32, &Device::Cpu)?;
        let k = Tensor::zeros((1, 2, 1, 4), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            attn.forward_t(&q, &k, &q, None, false),
            Err(Error::ShapeMismatch { .. })
        ));
        Ok(())
    }
}
