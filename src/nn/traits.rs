use candle_core::Tensor;

use crate::sparse::{Adjacency, BatchIndex};
use crate::Result;

/// Per-call graph context: the skeleton adjacency over joints and the clip
/// each frame belongs to.
#[derive(Debug, Clone)]
pub struct GraphBatch {
    pub adjacency: Adjacency,
    pub batch: BatchIndex,
}

/// A layer over `(frames, joints, channels)` skeleton features.
pub trait SkeletonModule {
    fn forward_t(&self, xs: &Tensor, graph: &GraphBatch, train: bool) -> Result<Tensor>;

    fn forward(&self, xs: &Tensor, graph: &GraphBatch) -> Result<Tensor> {
        self.forward_t(xs, graph, false)
    }
}
