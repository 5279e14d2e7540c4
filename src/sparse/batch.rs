use candle_core::{DType, Device, Tensor};

use super::NodeIndex;
use crate::{Error, Result};

/// Which clip every frame (or node) of a flattened batch belongs to.
///
/// Clips are laid out contiguously, so ids never decrease. Each run of equal
/// ids is one clip and is renumbered to its ordinal, so storage follows the
/// number of frames and never the magnitude of the ids. `offsets` holds the
/// start of every clip plus a final end marker.
#[derive(Debug, Clone)]
pub struct BatchIndex {
    index: NodeIndex,
    offsets: Vec<usize>,
}
impl BatchIndex {
    pub fn new(batch: Vec<u32>, device: &Device) -> Result<Self> {
        if let Some(w) = batch.windows(2).find(|w| w[0] > w[1]) {
            return Err(Error::InvalidBatchIndex(format!(
                "ids must be non-decreasing, found {} before {}",
                w[0], w[1]
            )));
        }
        let mut offsets = vec![0];
        let mut ordinals = Vec::with_capacity(batch.len());
        for (i, &b) in batch.iter().enumerate() {
            if i > 0 && batch[i - 1] != b {
                offsets.push(i);
            }
            ordinals.push(offsets.len() as u32 - 1);
        }
        if !batch.is_empty() {
            offsets.push(batch.len());
        }
        Ok(Self {
            index: NodeIndex::new(ordinals, device)?,
            offsets,
        })
    }
    /// Clip ids for clips of the given frame counts. Clips without frames
    /// keep their slot.
    pub fn from_lengths(lengths: &[usize], device: &Device) -> Result<Self> {
        let batch = lengths
            .iter()
            .enumerate()
            .flat_map(|(clip, &len)| std::iter::repeat(clip as u32).take(len))
            .collect();
        let offsets = std::iter::once(0)
            .chain(lengths.iter().scan(0, |end, &len| {
                *end += len;
                Some(*end)
            }))
            .collect();
        Ok(Self {
            index: NodeIndex::new(batch, device)?,
            offsets,
        })
    }
    pub fn from_tensor(batch: &Tensor) -> Result<Self> {
        let index = NodeIndex::from_tensor(batch)?;
        Self::new(index.as_slice().to_vec(), batch.device())
    }
    pub fn len(&self) -> usize {
        self.index.len()
    }
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
    pub fn num_segments(&self) -> usize {
        self.offsets.len() - 1
    }
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }
    pub fn lengths(&self) -> Vec<usize> {
        self.offsets.windows(2).map(|w| w[1] - w[0]).collect()
    }
    pub fn index(&self) -> &NodeIndex {
        &self.index
    }
    pub fn mask(&self) -> BatchedMask<'_> {
        BatchedMask { batch: self }
    }

    /// Averages `xs` (first axis aligned with the batch index) per clip.
    /// Clips without frames come out as zeros.
    pub fn segment_mean(&self, xs: &Tensor) -> Result<Tensor> {
        let frames = xs.dim(0)?;
        if frames != self.len() {
            return Err(Error::shape("segment_mean", self.len(), frames));
        }
        let mut dims = xs.dims().to_vec();
        dims[0] = self.num_segments();
        let sums = Tensor::zeros(dims.as_slice(), xs.dtype(), self.index.device())?.index_add(
            self.index.tensor(),
            &xs.contiguous()?,
            0,
        )?;
        let counts = self
            .lengths()
            .into_iter()
            .map(|len| len.max(1) as f32)
            .collect::<Vec<_>>();
        let mut count_dims = vec![1; dims.len()];
        count_dims[0] = self.num_segments();
        let counts =
            Tensor::from_vec(counts, count_dims, self.index.device())?.to_dtype(xs.dtype())?;
        Ok(sums.broadcast_div(&counts)?)
    }
}

/// Block-diagonal compatibility between positions of a flattened batch,
/// materialized only when asked for.
#[derive(Debug, Clone, Copy)]
pub struct BatchedMask<'a> {
    batch: &'a BatchIndex,
}
impl BatchedMask<'_> {
    /// `(N, N)` u8 matrix, 1 where both positions belong to the same clip.
    pub fn bool_matrix(&self) -> Result<Tensor> {
        let ids = self.batch.index.tensor();
        Ok(ids.unsqueeze(1)?.broadcast_eq(&ids.unsqueeze(0)?)?)
    }
    /// `(N, N)` matrix of 0 where attention is allowed and `-inf` elsewhere.
    pub fn additive_matrix(&self, dtype: DType) -> Result<Tensor> {
        let allowed = self.bool_matrix()?;
        let device = self.batch.index.device();
        let dims = allowed.dims();
        let zeros = Tensor::zeros(dims, dtype, device)?;
        let blocked = Tensor::full(f32::NEG_INFINITY, dims, device)?.to_dtype(dtype)?;
        Ok(allowed.where_cond(&zeros, &blocked)?)
    }
    pub fn all_ones(&self) -> bool {
        self.batch.num_segments() <= 1
    }
}
