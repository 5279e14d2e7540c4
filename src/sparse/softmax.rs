use candle_core::shape::Dim;
use candle_core::{DType, Tensor};

use super::NodeIndex;
use crate::{Error, Result};

const EPS: f64 = 1e-16;

/// How scores are shifted before exponentiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Stabilization {
    /// Subtract the largest score of the whole tensor. Cheap, but a group
    /// whose scores all sit far below the global maximum can underflow.
    GlobalMax,
    /// Subtract each group's own maximum. The maxima are computed on the
    /// host, so every call copies the scores off the device and back, which
    /// synchronizes CUDA and Metal streams.
    #[default]
    GroupMax,
}

/// Softmax evaluated independently within the groups that `index` assigns
/// along axis `dim` of `src`.
///
/// Positions sharing an index value sum to one. Groups are bucketed into
/// `num_nodes` slots (inferred from `index` when `None`). A grouping index is
/// mandatory: sorted CSR pointers are not supported.
pub fn segment_softmax<D: Dim>(
    src: &Tensor,
    index: Option<&NodeIndex>,
    num_nodes: Option<usize>,
    dim: D,
    stabilization: Stabilization,
) -> Result<Tensor> {
    let index = index.ok_or_else(|| {
        Error::UnsupportedConfiguration(
            "segment softmax needs a grouping index, CSR pointers are not implemented".to_string(),
        )
    })?;
    let dim = dim.to_index(src.shape(), "segment_softmax")?;
    let num_edges = src.dim(dim)?;
    if index.len() != num_edges {
        return Err(Error::shape("segment_softmax", num_edges, index.len()));
    }
    if src.elem_count() == 0 {
        return Ok(src.clone());
    }
    let num_nodes = index.num_nodes(num_nodes);
    index.check_bounds("segment_softmax", num_nodes)?;

    let shifted = match stabilization {
        Stabilization::GlobalMax => {
            let max = src
                .flatten_all()?
                .max(0)?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
            src.affine(1.0, -max)?
        }
        Stabilization::GroupMax => {
            let max = group_max(src, index, num_nodes, dim)?;
            (src - max.index_select(index.tensor(), dim)?)?
        }
    };
    let out = shifted.exp()?.contiguous()?;

    let mut sum_dims = out.dims().to_vec();
    sum_dims[dim] = num_nodes;
    let out_sum = Tensor::zeros(sum_dims, out.dtype(), index.device())?
        .index_add(index.tensor(), &out, dim)?
        .index_select(index.tensor(), dim)?;
    Ok(out.div(&(out_sum + EPS)?)?)
}

/// Per-group maxima with the node axis at `dim`. Computed on the host, so no
/// gradient flows through it; softmax is invariant to the shift anyway.
fn group_max(src: &Tensor, index: &NodeIndex, num_nodes: usize, dim: usize) -> Result<Tensor> {
    let last = src.rank() - 1;
    let moved = src.transpose(dim, last)?.contiguous()?;
    let mut dims = moved.dims().to_vec();
    let num_edges = dims[last];
    let rest = moved.elem_count() / num_edges;
    let scores = moved
        .reshape((rest, num_edges))?
        .to_dtype(DType::F64)?
        .to_vec2::<f64>()?;

    let mut max = vec![f64::NEG_INFINITY; rest * num_nodes];
    for (r, row) in scores.iter().enumerate() {
        let bucket = &mut max[r * num_nodes..(r + 1) * num_nodes];
        for (&node, &score) in index.as_slice().iter().zip(row) {
            let slot = &mut bucket[node as usize];
            *slot = slot.max(score);
        }
    }
    // all -inf (or unvisited) groups would turn into -inf - -inf = NaN
    for slot in max.iter_mut().filter(|m| !m.is_finite()) {
        *slot = 0.0;
    }
    dims[last] = num_nodes;
    Ok(Tensor::from_vec(max, dims, index.device())?
        .to_dtype(src.dtype())?
        .transpose(dim, last)?
        .contiguous()?)
}
