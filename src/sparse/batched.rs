use candle_core::{IndexOp, Tensor, D};
use tracing::debug;

use super::{spmm, Adjacency};
use crate::{Error, Result};

/// Multi-head sparse product.
///
/// `weights` is `(..., num_edges, heads)` and `xs` is `(..., num_nodes, C)`.
/// `xs` is repeated once per head, each head's adjacency is moved into its
/// own `[h*m, (h+1)*m) x [h*n, (h+1)*n)` block and a single [`spmm`] does the
/// aggregation. The result is `(..., heads * m, C)`, head-major; reshaping it
/// into `(..., heads, m, C)` is left to the caller.
///
/// A declared `n` must equal the feature row count. When `n` is `None` it is
/// the larger of the column extent and the feature row count.
pub fn batched_spmm(
    weights: &Tensor,
    adjacency: &Adjacency,
    xs: &Tensor,
    m: Option<usize>,
    n: Option<usize>,
) -> Result<Tensor> {
    if weights.rank() < 2 || xs.rank() < 2 {
        return Err(Error::shape(
            "batched_spmm",
            "(..., num_edges, heads) weights and (..., num_nodes, C) features",
            format!("{:?} and {:?}", weights.dims(), xs.dims()),
        ));
    }
    let (num_edges, heads) = (weights.dim(D::Minus2)?, weights.dim(D::Minus1)?);
    let num_nodes = xs.dim(D::Minus2)?;
    if let Adjacency::PerHead(lists) = adjacency {
        if lists.len() != heads {
            return Err(Error::HeadCountMismatch {
                heads,
                adjacencies: lists.len(),
            });
        }
    }
    if let Some(edges) = adjacency.lists().iter().find(|l| l.len() != num_edges) {
        return Err(Error::shape("batched_spmm", num_edges, edges.len()));
    }
    let declared_n = n;
    let (m, n) = adjacency.extents(m, n);
    let n = match declared_n {
        Some(n) if n != num_nodes => {
            return Err(Error::shape("batched_spmm", format!("{n} feature rows"), num_nodes))
        }
        Some(n) => n,
        None => n.max(num_nodes),
    };
    debug!(heads, num_edges, m, n, "batched_spmm");

    let xs = Tensor::cat(&vec![xs; heads], D::Minus2)?;
    let weights = weights.transpose(D::Minus2, D::Minus1)?.contiguous()?;
    let weights = weights.flatten_from(weights.rank() - 2)?;
    let edges = adjacency.offset_concat(heads, m, n)?;
    spmm(&edges, &weights, heads * m, heads * n, &xs)
}

/// Reverses edge direction for one shared or several per-head adjacencies.
///
/// `values` is `(num_edges,)` or `(num_edges, heads)`; it is permuted along
/// the edge axis to follow the reordered edges. Per-head lists are transposed
/// one by one and their value columns restacked.
pub fn batched_transpose(
    adjacency: &Adjacency,
    values: &Tensor,
    m: Option<usize>,
    n: Option<usize>,
) -> Result<(Adjacency, Tensor)> {
    let (m, n) = adjacency.extents(m, n);
    match adjacency {
        Adjacency::Shared(edges) => {
            let (edges, values) = edges.transpose(values, m, n)?;
            Ok((Adjacency::Shared(edges), values))
        }
        Adjacency::PerHead(lists) => {
            let heads = match values.dims() {
                [_, heads] => *heads,
                dims => {
                    return Err(Error::shape(
                        "batched_transpose",
                        "(num_edges, heads)",
                        format!("{dims:?}"),
                    ))
                }
            };
            if heads != lists.len() {
                return Err(Error::HeadCountMismatch {
                    heads,
                    adjacencies: lists.len(),
                });
            }
            let mut transposed = Vec::with_capacity(heads);
            let mut columns = Vec::with_capacity(heads);
            for (h, edges) in lists.iter().enumerate() {
                let (edges, column) = edges.transpose(&values.i((.., h))?, m, n)?;
                transposed.push(edges);
                columns.push(column);
            }
            let values = if columns.is_empty() {
                values.clone()
            } else {
                Tensor::stack(&columns, 1)?
            };
            Ok((Adjacency::PerHead(transposed), values))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::EdgeList;
    use candle_core::{DType, Device};

    #[test]
    fn head_count_must_match_lists() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let a = EdgeList::from_pairs(&[(0, 1)], &dev)?;
        let adjacency = Adjacency::PerHead(vec![a.clone(), a.clone(), a]);
        let weights = Tensor::ones((1, 2), DType::F32, &dev)?;
        let xs = Tensor::ones((2, 4), DType::F32, &dev)?;
        assert!(matches!(
            batched_spmm(&weights, &adjacency, &xs, None, None),
            Err(Error::HeadCountMismatch { heads: 2, adjacencies: 3 })
        ));
        assert!(matches!(
            batched_transpose(&adjacency, &weights, None, None),
            Err(Error::HeadCountMismatch { heads: 2, adjacencies: 3 })
        ));
        Ok(())
    }

    #[test]
    fn per_head_adjacencies_stay_in_their_block() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let adjacency = Adjacency::PerHead(vec![
            EdgeList::from_pairs(&[(0, 1), (1, 1)], &dev)?,
            EdgeList::from_pairs(&[(1, 0), (0, 0)], &dev)?,
        ]);
        let weights = Tensor::new(&[[1f32, 10.], [2., 20.]], &dev)?;
        let xs = Tensor::new(&[[1f32], [3.]], &dev)?;
        let out = batched_spmm(&weights, &adjacency, &xs, None, None)?;
        // head 0: row0 = 1*3, row1 = 2*3; head 1: row1 = 10*1, row0 = 20*1
        assert_eq!(
            out.flatten_all()?.to_vec1::<f32>()?,
            vec![3., 6., 20., 10.]
        );
        Ok(())
    }

    #[test]
    fn declared_columns_must_match_features() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let adjacency = Adjacency::PerHead(vec![
            EdgeList::from_pairs(&[(0, 1)], &dev)?,
            EdgeList::from_pairs(&[(1, 0)], &dev)?,
        ]);
        let weights = Tensor::ones((1, 2), DType::F32, &dev)?;
        let xs = Tensor::ones((3, 2), DType::F32, &dev)?;
        assert!(matches!(
            batched_spmm(&weights, &adjacency, &xs, Some(2), Some(2)),
            Err(Error::ShapeMismatch { .. })
        ));
        // undeclared columns widen to the feature rows
        let out = batched_spmm(&weights, &adjacency, &xs, Some(2), None)?;
        assert_eq!(out.dims(), &[4, 2]);
        assert_eq!(
            batched_spmm(&weights, &adjacency, &xs, Some(2), Some(3))?.dims(),
            &[4, 2]
        );
        Ok(())
    }

    #[test]
    fn leading_batch_dims() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let edges = EdgeList::from_pairs(&[(0, 1), (1, 0), (1, 1)], &dev)?;
        // (batch=2, edges=3, heads=2) and (batch=2, nodes=2, C=1)
        let weights = Tensor::arange(1f32, 13., &dev)?.reshape((2, 3, 2))?;
        let xs = Tensor::new(&[[[1f32], [2.]], [[3.], [4.]]], &dev)?;
        let out = batched_spmm(&weights, &Adjacency::Shared(edges.clone()), &xs, None, None)?;
        assert_eq!(out.dims(), &[2, 4, 1]);
        for b in 0..2 {
            let heads = out.i(b)?.reshape((2, 2, 1))?;
            for h in 0..2 {
                let values = weights.i((b, .., h))?.contiguous()?;
                let single = spmm(&edges, &values, 2, 2, &xs.i(b)?)?;
                assert_eq!(
                    heads.i(h)?.to_vec2::<f32>()?,
                    single.to_vec2::<f32>()?
                );
            }
        }
        Ok(())
    }

    #[test]
    fn per_head_transpose_restacks_values() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let adjacency = Adjacency::PerHead(vec![
            EdgeList::from_pairs(&[(0, 1), (1, 0)], &dev)?,
            EdgeList::from_pairs(&[(1, 1), (0, 0)], &dev)?,
        ]);
        let values = Tensor::new(&[[1f32, 3.], [2., 4.]], &dev)?;
        let (transposed, values) = batched_transpose(&adjacency, &values, None, None)?;
        let lists = transposed.lists();
        assert_eq!(lists[0].pairs().collect::<Vec<_>>(), vec![(0, 1), (1, 0)]);
        assert_eq!(lists[1].pairs().collect::<Vec<_>>(), vec![(0, 0), (1, 1)]);
        assert_eq!(values.to_vec2::<f32>()?, vec![vec![2., 4.], vec![1., 3.]]);
        Ok(())
    }
}
