//! Sharded, sparse, concurrent counter grids (component A, spec §3/§4.1/§4.2).
//!
//! A reference's counter array is stored as an array of lazily-allocated
//! blocks of `2^BLOCK_SHIFT` positions. Blocks are grouped into stripes of
//! `2^MUTEX_SHIFT` blocks sharing one mutex; a block transitions
//! absent -> present exactly once, under the mutex covering it.

use crate::error::{CoreError, CoreResult};
use crate::source::{Base, ReferenceTable};
use std::sync::Mutex;

/// log2(positions per counter block). Source default: 4096 positions/block.
pub const BLOCK_SHIFT: u32 = 12;
/// log2(blocks per mutex stripe). Source default: one mutex per 2 blocks.
pub const MUTEX_SHIFT: u32 = 1;

fn block_count_for(len: u32, block_size: u32) -> usize {
    if len == 0 {
        0
    } else {
        ((len as u64 - 1) / block_size as u64 + 1) as usize
    }
}

/// One reference's lazily-allocated, lock-striped block array.
///
/// Generic over the cell type so the same striping discipline backs both
/// the scalar (`u32`) coverage grid and the five-channel (`Tally`)
/// mutation grid.
pub struct RefGrid<T> {
    len: u32,
    block_size: u32,
    blocks_per_stripe: usize,
    block_count: usize,
    stripes: Vec<Mutex<Vec<Option<Box<[T]>>>>>,
}

impl<T: Default + Copy> RefGrid<T> {
    pub fn new(len: u32, block_shift: u32, mutex_shift: u32) -> Self {
        let block_size = 1u32 << block_shift;
        let block_count = block_count_for(len, block_size);
        let blocks_per_stripe = 1usize << mutex_shift;
        let stripe_count = block_count
            .saturating_sub(1)
            .checked_div(blocks_per_stripe)
            .map(|q| q + 1)
            .unwrap_or(0)
            .max(if block_count > 0 { 1 } else { 0 });
        let mut stripes = Vec::with_capacity(stripe_count);
        let mut remaining = block_count;
        for _ in 0..stripe_count {
            let this_stripe = remaining.min(blocks_per_stripe);
            remaining -= this_stripe;
            stripes.push(Mutex::new(vec![None; this_stripe]));
        }
        RefGrid {
            len,
            block_size,
            blocks_per_stripe,
            block_count,
            stripes,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    fn block_len(&self, block_index: usize) -> usize {
        let block_start = block_index as u32 * self.block_size;
        let block_end = block_start.saturating_add(self.block_size).min(self.len);
        (block_end - block_start) as usize
    }

    fn stripe_and_local(&self, block_index: usize) -> (usize, usize) {
        (
            block_index / self.blocks_per_stripe,
            block_index % self.blocks_per_stripe,
        )
    }

    /// Locks the stripe covering `block_index`, lazily allocating the block
    /// on first touch, and hands a mutable slice of its cells to `f`.
    pub fn with_block_mut<R>(
        &self,
        block_index: usize,
        f: impl FnOnce(&mut [T]) -> R,
    ) -> CoreResult<R> {
        let (stripe_idx, local_idx) = self.stripe_and_local(block_index);
        let mut stripe = self.stripes[stripe_idx]
            .lock()
            .map_err(|_| CoreError::Fatal("counter grid mutex poisoned".to_string()))?;
        if stripe[local_idx].is_none() {
            let len = self.block_len(block_index);
            stripe[local_idx] = Some(vec![T::default(); len].into_boxed_slice());
        }
        let block = stripe[local_idx]
            .as_mut()
            .expect("block was just allocated");
        Ok(f(block))
    }

    /// Locks the stripe covering `block_index` and hands a read-only view
    /// (`None` if the block was never touched) to `f`. Used during
    /// emission, which is read-only by the time it runs but still goes
    /// through the stripe lock since no separate read path is worth the
    /// complexity at this scale.
    pub fn with_block<R>(
        &self,
        block_index: usize,
        f: impl FnOnce(Option<&[T]>) -> R,
    ) -> CoreResult<R> {
        let (stripe_idx, local_idx) = self.stripe_and_local(block_index);
        let stripe = self.stripes[stripe_idx]
            .lock()
            .map_err(|_| CoreError::Fatal("counter grid mutex poisoned".to_string()))?;
        Ok(f(stripe[local_idx].as_deref()))
    }
}

/// Scalar depth counter grid ("coverage"), spec §4.1.
pub struct ScalarGrid {
    refs: Vec<RefGrid<u32>>,
}

impl ScalarGrid {
    /// Allocates the block-pointer arrays; no base-position storage yet.
    pub fn open(table: &ReferenceTable) -> Self {
        let refs = table
            .lengths
            .iter()
            .map(|&len| RefGrid::new(len, BLOCK_SHIFT, MUTEX_SHIFT))
            .collect();
        ScalarGrid { refs }
    }

    /// Marks the grid ready for concurrent ingest. Stripe mutexes are
    /// always present (Rust gives no cheaper way to retrofit locking onto
    /// existing storage), so this call exists to preserve the interface's
    /// ordering contract rather than to do allocation work: callers must
    /// still invoke it before handing the grid to multiple ingest threads.
    pub fn enable_mt(&mut self) {}

    pub fn n_targets(&self) -> usize {
        self.refs.len()
    }

    pub fn grid(&self, t: usize) -> &RefGrid<u32> {
        &self.refs[t]
    }

    /// Increments every cell in `[start, end)` of reference `t` by one.
    /// `start` is 0-based inclusive, `end` is 0-based exclusive.
    pub fn update(&self, t: usize, start: u32, end: u32) -> CoreResult<()> {
        if start >= end {
            return Ok(());
        }
        let grid = &self.refs[t];
        let block_size = grid.block_size();
        let last_block_index = ((end - 1) / block_size) as usize;
        let mut block_index = (start / block_size) as usize;
        let mut pos = start;
        while block_index <= last_block_index {
            let block_start = block_index as u32 * block_size;
            let local_start = (pos - block_start) as usize;
            let range_end = end.min(block_start + block_size);
            let local_end = (range_end - block_start) as usize;
            grid.with_block_mut(block_index, |cells| {
                for cell in &mut cells[local_start..local_end] {
                    *cell += 1;
                }
            })?;
            pos = range_end;
            block_index += 1;
        }
        Ok(())
    }
}

/// A per-position tally of the five base channels, spec §3 "cov2_val_t".
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Tally {
    pub a: f64,
    pub c: f64,
    pub g: f64,
    pub t: f64,
    pub n: f64,
}

impl Tally {
    pub fn sum(&self) -> f64 {
        self.a + self.c + self.g + self.t + self.n
    }

    pub fn channel(&self, base: Base) -> f64 {
        match base {
            Base::A => self.a,
            Base::C => self.c,
            Base::G => self.g,
            Base::T => self.t,
            Base::N => self.n,
        }
    }

    /// The modal (most-covered) channel's count, used when no reference
    /// base is available (spec §4.6: "treat the modal base as reference").
    pub fn max_channel(&self) -> f64 {
        [self.a, self.c, self.g, self.t, self.n]
            .into_iter()
            .fold(0.0_f64, f64::max)
    }

    fn increment(&mut self, base: Base) {
        match base {
            Base::A => self.a += 1.0,
            Base::C => self.c += 1.0,
            Base::G => self.g += 1.0,
            Base::T => self.t += 1.0,
            Base::N => self.n += 1.0,
        }
    }
}

/// Five-channel base-tally counter grid ("mutation"), spec §4.2.
///
/// Internally `2*N` `RefGrid<Tally>` rows: `+` strand at index `t`, `-`
/// strand at index `t + n_targets`, matching `coverage2_update`'s
/// `target_index = target + (strand == '-' ? n_targets : 0)`.
pub struct FiveChannelGrid {
    refs: Vec<RefGrid<Tally>>,
    n_targets: usize,
}

impl FiveChannelGrid {
    pub fn open(table: &ReferenceTable) -> Self {
        let n_targets = table.lengths.len();
        let mut refs = Vec::with_capacity(n_targets * 2);
        for _ in 0..2 {
            for &len in &table.lengths {
                refs.push(RefGrid::new(len, BLOCK_SHIFT, MUTEX_SHIFT));
            }
        }
        FiveChannelGrid { refs, n_targets }
    }

    pub fn n_targets(&self) -> usize {
        self.n_targets
    }

    /// Effective row index for (reference, strand): `+` strand is `t`,
    /// `-` strand is `t + n_targets`. Unstranded (`.`) updates are treated
    /// as `+` since the grid has no third row; callers that need
    /// unstranded accumulation should route both strands through one
    /// caller-chosen row instead.
    pub fn row_index(&self, t: usize, strand: char) -> usize {
        if strand == '-' {
            t + self.n_targets
        } else {
            t
        }
    }

    pub fn grid(&self, row_index: usize) -> &RefGrid<Tally> {
        &self.refs[row_index]
    }

    /// Increments the base-channel tally for every position in
    /// `[start, end)`, decoding one read base per position starting at
    /// `read_offset` in `seq`.
    pub fn update(
        &self,
        t: usize,
        start: u32,
        end: u32,
        strand: char,
        seq: &crate::source::PackedSeq<'_>,
        read_offset: usize,
    ) -> CoreResult<()> {
        if start >= end {
            return Ok(());
        }
        let row = self.row_index(t, strand);
        let grid = &self.refs[row];
        let block_size = grid.block_size();
        let last_block_index = ((end - 1) / block_size) as usize;
        let mut block_index = (start / block_size) as usize;
        let mut pos = start;
        let mut read_pos = read_offset;
        while block_index <= last_block_index {
            let block_start = block_index as u32 * block_size;
            let local_start = (pos - block_start) as usize;
            let range_end = end.min(block_start + block_size);
            let local_end = (range_end - block_start) as usize;
            let n = local_end - local_start;
            grid.with_block_mut(block_index, |cells| {
                for k in 0..n {
                    let base = seq.base_at(read_pos + k);
                    cells[local_start + k].increment(base);
                }
            })?;
            pos = range_end;
            read_pos += n;
            block_index += 1;
        }
        Ok(())
    }
}
