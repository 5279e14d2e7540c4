mod traits;
pub use traits::*;
pub mod utils;

mod sparse_attention;
pub use sparse_attention::{MultiAdjacency, SparseAttention, SparseAttentionParams};
mod full_attention;
pub use full_attention::{FullAttention, FullAttentionParams};
mod layers;
pub use layers::{AddNorm, FeedForward, PositionalEncoding};
mod encoder;
pub use encoder::{AttentionKind, EncoderLayer, EncoderParams};
