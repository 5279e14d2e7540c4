//! Dual graph transformer for skeleton-based action recognition.
//!
//! [`sparse`] holds the edge-indexed primitives (segment softmax, sparse
//! times dense products, multi-head batching); [`nn`] builds sparse and dense
//! attention layers on top of them; [`models`] stacks those layers into a
//! clip classifier.

mod error;
pub use error::{Error, Result};

pub mod models;
pub mod nn;
pub mod sparse;
pub mod utils;
