mod dual_graph;
pub use dual_graph::{DualGraphParams, DualGraphTransformer};
