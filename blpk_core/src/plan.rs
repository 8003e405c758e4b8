use log::debug;

use crate::error::{Error, Result};
use crate::format::{MAX_BUFFER_SIZE, MAX_CHUNKS};

/// How a byte stream of known length is cut into chunks.
///
/// Every chunk holds `chunk_size` raw bytes except the last one, which holds
/// `last_chunk_size`. The file layout depends on these numbers, so they are
/// computed exactly the same way on every write and append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub nchunks: u64,
    pub chunk_size: u64,
    pub last_chunk_size: u64,
}

impl ChunkPlan {
    /// Plan `total_size` bytes split into chunks of at most `desired_chunk_size`.
    ///
    /// An empty stream is a single empty chunk. A desired size larger than the
    /// stream is clamped, giving one chunk holding everything.
    pub fn new(total_size: u64, desired_chunk_size: u64) -> Result<Self> {
        if total_size == 0 {
            return Ok(Self {
                nchunks: 1,
                chunk_size: 0,
                last_chunk_size: 0,
            });
        }
        if desired_chunk_size == 0 || desired_chunk_size > MAX_BUFFER_SIZE {
            return Err(Error::ChunkSizeOutOfRange {
                chunk_size: desired_chunk_size,
                max: MAX_BUFFER_SIZE,
            });
        }

        let chunk_size = desired_chunk_size.min(total_size);
        let plan = if chunk_size == total_size {
            Self {
                nchunks: 1,
                chunk_size,
                last_chunk_size: chunk_size,
            }
        } else {
            let (quotient, remainder) = (total_size / chunk_size, total_size % chunk_size);
            if remainder == 0 {
                Self {
                    nchunks: quotient,
                    chunk_size,
                    last_chunk_size: chunk_size,
                }
            } else {
                Self {
                    nchunks: quotient + 1,
                    chunk_size,
                    last_chunk_size: remainder,
                }
            }
        };

        if plan.nchunks > MAX_CHUNKS {
            return Err(Error::TooManyChunks {
                nchunks: plan.nchunks,
                max: MAX_CHUNKS,
            });
        }
        debug!(
            "planned {} bytes as {} chunk(s) of {} bytes, last chunk {} bytes",
            total_size, plan.nchunks, plan.chunk_size, plan.last_chunk_size
        );
        Ok(plan)
    }

    /// Raw size of chunk `index`.
    #[inline]
    pub fn chunk_len(&self, index: u64) -> u64 {
        if index + 1 == self.nchunks {
            self.last_chunk_size
        } else {
            self.chunk_size
        }
    }

    /// Per-chunk raw sizes in index order.
    pub fn chunk_lens(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.nchunks).map(move |i| self.chunk_len(i))
    }

    /// Total raw bytes covered by the plan.
    pub fn total_size(&self) -> u64 {
        (self.nchunks - 1) * self.chunk_size + self.last_chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nine_bytes_in_chunks_of_four() {
        let plan = ChunkPlan::new(9, 4).unwrap();
        assert_eq!(
            plan,
            ChunkPlan {
                nchunks: 3,
                chunk_size: 4,
                last_chunk_size: 1
            }
        );
        assert_eq!(plan.chunk_lens().collect::<Vec<_>>(), vec![4, 4, 1]);
    }

    #[test]
    fn empty_input_is_one_empty_chunk() {
        let plan = ChunkPlan::new(0, 4).unwrap();
        assert_eq!((plan.nchunks, plan.chunk_size, plan.last_chunk_size), (1, 0, 0));
        // the desired size is not even looked at
        assert!(ChunkPlan::new(0, 0).is_ok());
    }

    #[test]
    fn exact_multiple_has_full_last_chunk() {
        let plan = ChunkPlan::new(12, 4).unwrap();
        assert_eq!((plan.nchunks, plan.chunk_size, plan.last_chunk_size), (3, 4, 4));
    }

    #[test]
    fn oversized_chunk_is_clamped() {
        let plan = ChunkPlan::new(10, 1 << 20).unwrap();
        assert_eq!((plan.nchunks, plan.chunk_size, plan.last_chunk_size), (1, 10, 10));
    }

    #[test]
    fn rejects_invalid_chunk_sizes() {
        assert!(matches!(
            ChunkPlan::new(10, 0),
            Err(Error::ChunkSizeOutOfRange { .. })
        ));
        assert!(matches!(
            ChunkPlan::new(u64::MAX, MAX_BUFFER_SIZE + 1),
            Err(Error::ChunkSizeOutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_too_many_chunks() {
        assert!(matches!(
            ChunkPlan::new(u64::MAX, 1),
            Err(Error::TooManyChunks { .. })
        ));
    }

    #[test]
    fn sizes_always_sum_to_total() {
        for total in 0..200u64 {
            for desired in 1..40u64 {
                let plan = ChunkPlan::new(total, desired).unwrap();
                assert_eq!(plan.chunk_lens().sum::<u64>(), total, "{total}/{desired}");
                assert_eq!(plan.total_size(), total);
                assert!(plan.last_chunk_size <= plan.chunk_size);
                assert!(plan.nchunks >= 1);
            }
        }
    }
}
