mod edge_list;
pub use edge_list::{Adjacency, EdgeList, NodeIndex};
mod softmax;
pub use softmax::{segment_softmax, Stabilization};
mod spmm;
pub use spmm::spmm;
mod batched;
pub use batched::{batched_spmm, batched_transpose};
mod batch;
pub use batch::{BatchIndex, BatchedMask};
