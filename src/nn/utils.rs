use candle_core::{Result, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

//
// Projections initialised like torch.nn.Linear: weight and bias drawn from
// Uniform(-1/sqrt(fan_in), 1/sqrt(fan_in)).
//
pub(crate) fn linear(in_dim: usize, out_dim: usize, vs: VarBuilder) -> Result<Linear> {
    let bound = 1.0 / (in_dim as f64).sqrt();
    let init = Init::Uniform { lo: -bound, up: bound };
    let ws = vs.get_with_hints((out_dim, in_dim), "weight", init)?;
    let bs = vs.get_with_hints(out_dim, "bias", init)?;
    Ok(Linear::new(ws, Some(bs)))
}
pub(crate) fn linear_no_bias(in_dim: usize, out_dim: usize, vs: VarBuilder) -> Result<Linear> {
    let bound = 1.0 / (in_dim as f64).sqrt();
    let init = Init::Uniform { lo: -bound, up: bound };
    let ws = vs.get_with_hints((out_dim, in_dim), "weight", init)?;
    Ok(Linear::new(ws, None))
}

/// `(..., L, heads * c)` -> `(..., L, heads, c)`
pub fn split_heads(xs: &Tensor, heads: usize) -> Result<Tensor> {
    let mut dims = xs.dims().to_vec();
    let channels = dims.pop().unwrap_or(0);
    dims.extend([heads, channels / heads]);
    xs.reshape(dims)
}

/// `(..., L, heads, c)` -> `(..., L, heads * c)`
pub fn merge_heads(xs: &Tensor) -> Result<Tensor> {
    xs.flatten_from(xs.rank().saturating_sub(2))
}
