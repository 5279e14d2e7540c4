use candle_core::{Device, Tensor, D};
use candle_nn::{Activation, Dropout, Init, Linear, VarBuilder};

use super::utils::{linear, linear_no_bias};
use crate::{Error, Result};

/// Residual connection followed by layer norm.
///
/// With `beta`, the residual and the update are blended by a learned gate
/// `sigmoid(W [y, x, y - x])` instead of being summed.
pub struct AddNorm {
    dropout: Dropout,
    ln_weight: Tensor,
    ln_bias: Tensor,
    lin_beta: Option<Linear>,
}
impl AddNorm {
    pub fn new(normalized_shape: usize, beta: bool, dropout: f32, vs: VarBuilder) -> Result<Self> {
        let lin_beta = if beta {
            Some(linear_no_bias(3 * normalized_shape, 1, vs.pp("lin_beta"))?)
        } else {
            None
        };
        Ok(Self {
            dropout: Dropout::new(dropout),
            ln_weight: vs.pp("ln").get_with_hints(normalized_shape, "weight", Init::Const(1.0))?,
            ln_bias: vs.pp("ln").get_with_hints(normalized_shape, "bias", Init::Const(0.0))?,
            lin_beta,
        })
    }
    pub fn forward_t(&self, x: &Tensor, y: &Tensor, train: bool) -> Result<Tensor> {
        let dropped = self.dropout.forward(y, train)?;
        let mixed = match &self.lin_beta {
            Some(lin_beta) => {
                let gate = Tensor::cat(&[y, x, &(y - x)?], D::Minus1)?.apply(lin_beta)?;
                let gate = (gate.neg()?.exp()? + 1.0)?.recip()?;
                (x.broadcast_mul(&gate)? + dropped.broadcast_mul(&gate.affine(-1., 1.)?)?)?
            }
            None => (dropped + x)?,
        };
        layer_norm(&mixed, &self.ln_weight, &self.ln_bias, 1e-5)
    }
}

// Composed from primitive ops so gradients reach the affine parameters.
fn layer_norm(xs: &Tensor, weight: &Tensor, bias: &Tensor, eps: f64) -> Result<Tensor> {
    let centered = xs.broadcast_sub(&xs.mean_keepdim(D::Minus1)?)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    Ok(centered
        .broadcast_div(&(var + eps)?.sqrt()?)?
        .broadcast_mul(weight)?
        .broadcast_add(bias)?)
}

/// Position-wise `Linear -> GELU -> Dropout -> Linear -> Dropout`.
pub struct FeedForward {
    fc1: Linear,
    activation_fn: Activation,
    fc2: Linear,
    dropout: Dropout,
}
impl FeedForward {
    pub fn new(
        in_channels: usize,
        hidden_channels: usize,
        dropout: f32,
        vs: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            fc1: linear(in_channels, hidden_channels, vs.pp("fc1"))?,
            activation_fn: Activation::Gelu,
            fc2: linear(hidden_channels, in_channels, vs.pp("fc2"))?,
            dropout: Dropout::new(dropout),
        })
    }
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = xs.apply(&self.fc1)?.apply(&self.activation_fn)?;
        let xs = self.dropout.forward(&xs, train)?.apply(&self.fc2)?;
        Ok(self.dropout.forward(&xs, train)?)
    }
}

/// Sinusoidal position table added along the sequence axis (`-2`).
pub struct PositionalEncoding {
    table: Tensor,
}
impl PositionalEncoding {
    pub fn new(model_dim: usize, max_len: usize, device: &Device) -> Result<Self> {
        let table = (0..max_len)
            .flat_map(|pos| {
                (0..model_dim).map(move |i| {
                    let rate = 1e4f64.powf((i - i % 2) as f64 / model_dim as f64);
                    let phase = pos as f64 / rate;
                    (if i % 2 == 0 { phase.sin() } else { phase.cos() }) as f32
                })
            })
            .collect::<Vec<_>>();
        Ok(Self {
            table: Tensor::from_vec(table, (max_len, model_dim), device)?,
        })
    }
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (max_len, model_dim) = self.table.dims2()?;
        let len = xs.dim(D::Minus2)?;
        if len > max_len || xs.dim(D::Minus1)? != model_dim {
            return Err(Error::shape(
                "PositionalEncoding",
                format!("(.., <= {max_len}, {model_dim})"),
                format!("{:?}", xs.dims()),
            ));
        }
        let table = self.table.narrow(0, 0, len)?.to_dtype(xs.dtype())?;
        Ok(xs.broadcast_add(&table)?)
    }
}
