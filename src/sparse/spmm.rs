use candle_core::{Tensor, D};
use tracing::trace;

use super::EdgeList;
use crate::utils::broadcast_dims;
use crate::{Error, Result};

/// Sparse (COO) times dense product.
///
/// Row `r` of the `(..., m, C)` output is the sum over edges with
/// `rows[e] == r` of `values[..., e] * dense[..., cols[e], :]`. Leading
/// (batch / head) dimensions of `values` and `dense` broadcast against each
/// other; the reduction runs over the node axis only. Rows receiving no edge
/// are zero. A 1-D `dense` is treated as a single column.
pub fn spmm(
    edges: &EdgeList,
    values: &Tensor,
    m: usize,
    n: usize,
    dense: &Tensor,
) -> Result<Tensor> {
    let dense = match dense.rank() {
        0 => return Err(Error::shape("spmm", "a dense matrix", "a scalar")),
        1 => dense.unsqueeze(D::Minus1)?,
        _ => dense.contiguous()?,
    };
    let node_axis = dense.rank() - 2;
    if dense.dim(node_axis)? != n {
        return Err(Error::shape("spmm", format!("{n} dense rows"), dense.dim(node_axis)?));
    }
    let num_edges = values.dim(D::Minus1)?;
    if num_edges != edges.len() {
        return Err(Error::shape("spmm", format!("{} edge values", edges.len()), num_edges));
    }
    edges.check_bounds("spmm", m, n)?;

    let channels = dense.dim(D::Minus1)?;
    let mut out_dims = broadcast_dims(
        "spmm",
        &dense.dims()[..node_axis],
        &values.dims()[..values.rank() - 1],
    )?;
    trace!(num_edges, m, n, channels, leading = ?out_dims, "spmm");
    out_dims.extend([m, channels]);
    let out = Tensor::zeros(out_dims, dense.dtype(), edges.device())?;
    if edges.is_empty() {
        return Ok(out);
    }

    let messages = dense
        .index_select(edges.cols().tensor(), node_axis)?
        .broadcast_mul(&values.unsqueeze(D::Minus1)?)?
        .contiguous()?;
    Ok(out.index_add(edges.rows().tensor(), &messages, D::Minus2)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn weighted_rows_and_empty_rows() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        // 3x3 sparse matrix with entries (0,1)=2, (0,2)=1, (2,0)=-1
        let edges = EdgeList::from_pairs(&[(0, 1), (0, 2), (2, 0)], &dev)?;
        let values = Tensor::new(&[2f32, 1., -1.], &dev)?;
        let dense = Tensor::new(&[[1f32, 10.], [2., 20.], [3., 30.]], &dev)?;
        let out = spmm(&edges, &values, 3, 3, &dense)?;
        assert_eq!(
            out.to_vec2::<f32>()?,
            vec![vec![7., 70.], vec![0., 0.], vec![-1., -10.]]
        );
        Ok(())
    }

    #[test]
    fn broadcasts_over_leading_dims() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let edges = EdgeList::from_pairs(&[(1, 0), (0, 1)], &dev)?;
        // values per batch element, dense shared
        let values = Tensor::new(&[[1f32, 1.], [2., 3.]], &dev)?;
        let dense = Tensor::new(&[[1f32], [5.]], &dev)?;
        let out = spmm(&edges, &values, 2, 2, &dense)?;
        assert_eq!(out.dims(), &[2, 2, 1]);
        assert_eq!(
            out.to_vec3::<f32>()?,
            vec![vec![vec![5.], vec![1.]], vec![vec![15.], vec![2.]]]
        );
        Ok(())
    }

    #[test]
    fn vector_operand_gets_a_column() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let edges = EdgeList::from_pairs(&[(0, 0), (1, 0)], &dev)?;
        let values = Tensor::new(&[1f32, 4.], &dev)?;
        let out = spmm(&edges, &values, 2, 1, &Tensor::new(&[3f32], &dev)?)?;
        assert_eq!(out.to_vec2::<f32>()?, vec![vec![3.], vec![12.]]);
        Ok(())
    }

    #[test]
    fn empty_edges_give_zeros() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let edges = EdgeList::new(vec![], vec![], &dev)?;
        let values = Tensor::zeros(0, DType::F32, &dev)?;
        let dense = Tensor::ones((3, 4), DType::F32, &dev)?;
        let out = spmm(&edges, &values, 5, 3, &dense)?;
        assert_eq!(out.dims(), &[5, 4]);
        assert_eq!(out.sum_all()?.to_scalar::<f32>()?, 0.);
        Ok(())
    }

    #[test]
    fn checks_shapes_and_bounds() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let edges = EdgeList::from_pairs(&[(0, 3)], &dev)?;
        let values = Tensor::new(&[1f32], &dev)?;
        let dense = Tensor::ones((3, 2), DType::F32, &dev)?;
        assert!(matches!(
            spmm(&edges, &values, 2, 4, &dense),
            Err(Error::ShapeMismatch { .. })
        ));
        assert!(matches!(
            spmm(&edges, &values, 2, 3, &dense),
            Err(Error::IndexOutOfRange { index: 3, bound: 3, .. })
        ));
        Ok(())
    }
}
