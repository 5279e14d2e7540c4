use std::collections::BTreeSet;

use candle_core::{DType, Device, IndexOp, Tensor};
use itertools::Itertools;

use crate::utils::maybe_num_nodes;
use crate::{Error, Result};

/// A `u32` index kept both on the host (for validation and offsetting) and
/// on the execution device (for gathers and scatters).
#[derive(Debug, Clone)]
pub struct NodeIndex {
    host: Vec<u32>,
    tensor: Tensor,
}
impl NodeIndex {
    pub fn new(host: Vec<u32>, device: &Device) -> Result<Self> {
        let tensor = Tensor::from_slice(&host, host.len(), device)?;
        Ok(Self { host, tensor })
    }
    pub fn from_tensor(index: &Tensor) -> Result<Self> {
        let tensor = index.flatten_all()?.to_dtype(DType::U32)?;
        Ok(Self {
            host: tensor.to_vec1()?,
            tensor,
        })
    }
    pub fn len(&self) -> usize {
        self.host.len()
    }
    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }
    pub fn as_slice(&self) -> &[u32] {
        &self.host
    }
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }
    pub fn device(&self) -> &Device {
        self.tensor.device()
    }
    pub fn num_nodes(&self, declared: Option<usize>) -> usize {
        maybe_num_nodes(&self.host, declared)
    }
    /// Fails on the first entry that is not below `bound`.
    pub fn check_bounds(&self, op: &'static str, bound: usize) -> Result<()> {
        match self.host.iter().find(|&&i| i as usize >= bound) {
            Some(&index) => Err(Error::IndexOutOfRange {
                op,
                index: index as usize,
                bound,
            }),
            None => Ok(()),
        }
    }
    fn shifted(&self, by: usize) -> Result<Vec<u32>> {
        self.host
            .iter()
            .map(|&i| {
                u32::try_from(i as usize + by).map_err(|_| {
                    Error::UnsupportedConfiguration(format!(
                        "node id {} does not fit a u32 index",
                        i as usize + by
                    ))
                })
            })
            .collect()
    }
}

/// COO adjacency: edge `e` runs between `rows[e]` and `cols[e]`.
///
/// The row side is the node an edge feeds into (the query / output row of a
/// sparse product), the column side is the node it reads from.
#[derive(Debug, Clone)]
pub struct EdgeList {
    rows: NodeIndex,
    cols: NodeIndex,
}
impl EdgeList {
    pub fn new(rows: Vec<u32>, cols: Vec<u32>, device: &Device) -> Result<Self> {
        if rows.len() != cols.len() {
            return Err(Error::shape(
                "EdgeList::new",
                format!("{} column indices", rows.len()),
                cols.len(),
            ));
        }
        Ok(Self {
            rows: NodeIndex::new(rows, device)?,
            cols: NodeIndex::new(cols, device)?,
        })
    }
    pub fn from_pairs(pairs: &[(u32, u32)], device: &Device) -> Result<Self> {
        let (rows, cols) = pairs.iter().copied().unzip();
        Self::new(rows, cols, device)
    }
    /// Reads a `(2, num_edges)` edge index, the layout the graph datasets ship.
    pub fn from_tensor(edge_index: &Tensor) -> Result<Self> {
        let (two, _) = edge_index.dims2()?;
        if two != 2 {
            return Err(Error::shape(
                "EdgeList::from_tensor",
                "(2, num_edges)",
                format!("{:?}", edge_index.dims()),
            ));
        }
        Ok(Self {
            rows: NodeIndex::from_tensor(&edge_index.i((0, ..))?)?,
            cols: NodeIndex::from_tensor(&edge_index.i((1, ..))?)?,
        })
    }
    pub fn len(&self) -> usize {
        self.rows.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
    pub fn rows(&self) -> &NodeIndex {
        &self.rows
    }
    pub fn cols(&self) -> &NodeIndex {
        &self.cols
    }
    pub fn device(&self) -> &Device {
        self.rows.device()
    }
    pub fn pairs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.rows
            .as_slice()
            .iter()
            .copied()
            .zip(self.cols.as_slice().iter().copied())
    }
    pub fn check_bounds(&self, op: &'static str, m: usize, n: usize) -> Result<()> {
        self.rows.check_bounds(op, m)?;
        self.cols.check_bounds(op, n)
    }

    /// Appends one `(i, i)` edge for every node, keeping existing loops.
    pub fn add_self_loops(&self, num_nodes: usize) -> Result<Self> {
        let loops = (0..num_nodes as u32).map(|i| (i, i));
        let pairs = self.pairs().chain(loops).collect_vec();
        Self::from_pairs(&pairs, self.device())
    }
    pub fn remove_self_loops(&self) -> Result<Self> {
        let pairs = self.pairs().filter(|(r, c)| r != c).collect_vec();
        Self::from_pairs(&pairs, self.device())
    }

    /// Pairs joined by a walk of exactly `p` steps, deduplicated and sorted.
    pub fn power(&self, p: usize, num_nodes: usize) -> Result<Self> {
        if p == 0 {
            return Err(Error::UnsupportedConfiguration(
                "adjacency power must be at least 1".to_string(),
            ));
        }
        self.check_bounds("EdgeList::power", num_nodes, num_nodes)?;
        let mut neighbors = vec![BTreeSet::new(); num_nodes];
        for (r, c) in self.pairs() {
            neighbors[r as usize].insert(c);
        }
        let mut reach = neighbors.clone();
        for _ in 1..p {
            reach = reach
                .iter()
                .map(|targets| {
                    targets
                        .iter()
                        .flat_map(|&t| neighbors[t as usize].iter().copied())
                        .collect()
                })
                .collect();
        }
        let pairs = reach
            .iter()
            .enumerate()
            .flat_map(|(r, targets)| targets.iter().map(move |&c| (r as u32, c)))
            .collect_vec();
        Self::from_pairs(&pairs, self.device())
    }

    /// Swaps rows and columns and sorts edges by the new `(row, col)`.
    ///
    /// Duplicate edges are kept, so the multiset of `(row, col, value)`
    /// triples survives a double transpose. `values` is permuted along its
    /// first (edge) axis.
    pub fn transpose(&self, values: &Tensor, m: usize, n: usize) -> Result<(Self, Tensor)> {
        self.check_bounds("EdgeList::transpose", m, n)?;
        let num_edges = values.dim(0)?;
        if num_edges != self.len() {
            return Err(Error::shape("EdgeList::transpose", self.len(), num_edges));
        }
        let (rows, cols) = (self.rows.as_slice(), self.cols.as_slice());
        let order = (0..self.len())
            .sorted_by_key(|&e| (cols[e], rows[e]))
            .collect_vec();
        let transposed = Self::new(
            order.iter().map(|&e| cols[e]).collect(),
            order.iter().map(|&e| rows[e]).collect(),
            self.device(),
        )?;
        if order.is_empty() {
            return Ok((transposed, values.clone()));
        }
        let order = order.into_iter().map(|e| e as u32).collect_vec();
        let order = Tensor::from_vec(order, num_edges, self.device())?;
        let values = values.contiguous()?.index_select(&order, 0)?;
        Ok((transposed, values))
    }
}

/// The adjacency handed to a sparse op: one edge list shared by every head,
/// or one edge list per head.
#[derive(Debug, Clone)]
pub enum Adjacency {
    Shared(EdgeList),
    PerHead(Vec<EdgeList>),
}
impl Adjacency {
    pub fn lists(&self) -> &[EdgeList] {
        match self {
            Adjacency::Shared(edges) => std::slice::from_ref(edges),
            Adjacency::PerHead(lists) => lists,
        }
    }
    pub fn device(&self) -> Result<&Device> {
        self.lists()
            .first()
            .map(EdgeList::device)
            .ok_or_else(|| Error::UnsupportedConfiguration("empty per-head adjacency".to_string()))
    }

    /// Row and column extents covering every list.
    pub fn extents(&self, m: Option<usize>, n: Option<usize>) -> (usize, usize) {
        let lists = self.lists();
        (
            lists.iter().map(|l| l.rows().num_nodes(m)).max().unwrap_or(0),
            lists.iter().map(|l| l.cols().num_nodes(n)).max().unwrap_or(0),
        )
    }

    /// Places head `h` at rows `[h*m, (h+1)*m)` and columns `[h*n, (h+1)*n)`
    /// and concatenates all heads into a single edge list.
    pub fn offset_concat(&self, heads: usize, m: usize, n: usize) -> Result<EdgeList> {
        let device = self.device()?;
        let lists: Vec<&EdgeList> = match self {
            Adjacency::Shared(edges) => vec![edges; heads],
            Adjacency::PerHead(lists) => {
                if lists.len() != heads {
                    return Err(Error::HeadCountMismatch {
                        heads,
                        adjacencies: lists.len(),
                    });
                }
                lists.iter().collect()
            }
        };
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        for (h, edges) in lists.into_iter().enumerate() {
            edges.check_bounds("Adjacency::offset_concat", m, n)?;
            rows.extend(edges.rows.shifted(h * m)?);
            cols.extend(edges.cols.shifted(h * n)?);
        }
        EdgeList::new(rows, cols, device)
    }
}
