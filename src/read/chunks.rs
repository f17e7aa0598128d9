//! Chunk coordinates and the chunking strategy for the parallel read.

/// Byte coordinates of one chunk. `true_start` is known only for chunk 0 and
/// for chunks re-read after the ordered section corrected their start;
/// `true_end` is known for the last chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkCoordinates {
    pub start: usize,
    pub end: usize,
    pub true_start: bool,
    pub true_end: bool,
}

/// The chunking plan: how many chunks of what size, over how many threads.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlan {
    pub chunk_size: usize,
    pub chunk_count: usize,
    pub nthreads: usize,
}

/// Determine the chunking strategy for an input of `input_size` bytes with
/// an estimated mean line length, honoring a row cap.
pub fn determine_chunking(
    mut input_size: usize,
    mean_line_len: f64,
    nthreads: usize,
    max_nrows: usize,
) -> ChunkPlan {
    let line_len = mean_line_len.max(1.0);
    let mut nthreads = nthreads.max(1);
    let mut extra_chunks = 0usize;

    // When only a prefix is needed, shrink the working size with a margin.
    let maxrows_size = max_nrows as f64 * line_len;
    let mut input_size_reduced = false;
    if max_nrows < 1_000_000 && maxrows_size < input_size as f64 {
        input_size = (maxrows_size * 1.5) as usize + 1;
        input_size_reduced = true;
    }

    let mut chunk_size = ((1000.0 * line_len) as usize)
        .clamp(1 << 16, 1 << 20)
        .max((10.0 * line_len) as usize);
    let mut chunk_count = (input_size / chunk_size).max(1);
    if chunk_count > nthreads {
        chunk_count = nthreads * (1 + (chunk_count - 1) / nthreads);
        chunk_size = input_size / chunk_count;
    } else {
        nthreads = chunk_count;
        chunk_size = input_size / chunk_count;
        if input_size_reduced {
            // With a single chunk the whole remaining input would be parsed
            // eagerly; keep a couple of spare chunks past the estimate.
            extra_chunks = 2;
        }
    }
    ChunkPlan {
        chunk_size,
        chunk_count: chunk_count + extra_chunks,
        nthreads,
    }
}

impl ChunkPlan {
    /// Provisional coordinates of chunk `i` over `[sof, eof)`, given where
    /// the previous chunk actually ended.
    pub fn chunk_coordinates(
        &self,
        i: usize,
        sof: usize,
        eof: usize,
        end_of_last_chunk: usize,
    ) -> ChunkCoordinates {
        debug_assert!(i < self.chunk_count);
        let is_first = i == 0;
        let is_last = i == self.chunk_count - 1;
        let (start, true_start) = if self.nthreads == 1 || is_first {
            (end_of_last_chunk, true)
        } else {
            ((sof + i * self.chunk_size).min(eof), false)
        };
        let provisional_end = start.saturating_add(self.chunk_size);
        let (end, true_end) = if is_last || provisional_end >= eof {
            (eof, true)
        } else {
            (provisional_end, false)
        };
        ChunkCoordinates {
            start,
            end,
            true_start,
            true_end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_input_single_chunk() {
        let plan = determine_chunking(1000, 20.0, 8, usize::MAX);
        assert_eq!(plan.chunk_count, 1);
        assert_eq!(plan.nthreads, 1);
    }

    #[test]
    fn test_chunk_count_is_thread_multiple() {
        // 100MB with 30-byte lines
        let plan = determine_chunking(100 << 20, 30.0, 8, usize::MAX);
        assert!(plan.chunk_count > 8);
        assert_eq!(plan.chunk_count % 8, 0);
        assert!(plan.chunk_size >= 1 << 16);
    }

    #[test]
    fn test_chunk_size_clamped() {
        let plan = determine_chunking(1 << 30, 100_000.0, 4, usize::MAX);
        assert!(plan.chunk_size <= (1 << 20) + (1 << 16));
    }

    #[test]
    fn test_max_nrows_shrinks_input() {
        let full = determine_chunking(100 << 20, 30.0, 8, usize::MAX);
        let capped = determine_chunking(100 << 20, 30.0, 8, 100);
        assert!(capped.chunk_count < full.chunk_count);
    }

    #[test]
    fn test_coordinates_cover_input() {
        let plan = determine_chunking(10 << 20, 50.0, 4, usize::MAX);
        let sof = 100;
        let eof = sof + (10 << 20);
        let first = plan.chunk_coordinates(0, sof, eof, sof);
        assert!(first.true_start);
        assert_eq!(first.start, sof);
        let last = plan.chunk_coordinates(plan.chunk_count - 1, sof, eof, sof);
        assert!(last.true_end);
        assert_eq!(last.end, eof);
    }
}
