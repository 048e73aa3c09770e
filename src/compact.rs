//! Run compaction (component C, spec §4.4): reconstructs maximal
//! constant-value intervals spanning a window of blocks.

use crate::error::CoreResult;
use crate::grid::RefGrid;

/// A maximal `[start, end)` range of constant value within (or spanning
/// into) a compaction window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Run<T> {
    pub start: u32,
    pub end: u32,
    pub value: T,
}

/// Scans the half-open block range `[bs, be)` of one reference and returns
/// the ordered list of maximal constant-value runs covering
/// `[bs*B, min(be*B, L_t))`.
///
/// The first and last returned runs may be "open" — continuing into
/// neighboring windows outside `[bs, be)` — and it is the caller's
/// responsibility to stitch them against carry-over state from adjacent
/// windows (spec §4.4 edge cases, §4.5). This function only ever looks at
/// blocks inside `[bs, be)`; it does not guess at what lies outside.
pub fn compact_window<T>(grid: &RefGrid<T>, bs: usize, be: usize) -> CoreResult<Vec<Run<T>>>
where
    T: Copy + PartialEq + Default,
{
    let block_size = grid.block_size();
    let len = grid.len();
    let window_start = (bs as u32).saturating_mul(block_size).min(len);
    let window_end = (be as u32).saturating_mul(block_size).min(len);

    let mut runs = Vec::new();
    if window_start >= window_end {
        return Ok(runs);
    }

    let mut run_start = window_start;
    let mut run_value = T::default();
    let mut first_block = true;
    let mut block_index = bs;
    let mut pos = window_start;

    while pos < window_end {
        let block_start = block_index as u32 * block_size;
        let block_end = (block_start + block_size).min(len);
        let local_start = (pos - block_start) as usize;

        grid.with_block(block_index, |opt_cells| match opt_cells {
            None => {
                if first_block {
                    run_value = T::default();
                    first_block = false;
                }
                if run_value != T::default() {
                    runs.push(Run {
                        start: run_start,
                        end: pos,
                        value: run_value,
                    });
                    run_start = pos;
                    run_value = T::default();
                }
            }
            Some(cells) => {
                if first_block {
                    run_value = cells[local_start];
                    first_block = false;
                }
                for (i, &cell) in cells.iter().enumerate().skip(local_start) {
                    if cell != run_value {
                        let boundary = block_start + i as u32;
                        runs.push(Run {
                            start: run_start,
                            end: boundary,
                            value: run_value,
                        });
                        run_start = boundary;
                        run_value = cell;
                    }
                }
            }
        })?;

        pos = block_end;
        block_index += 1;
    }

    runs.push(Run {
        start: run_start,
        end: window_end,
        value: run_value,
    });
    Ok(runs)
}
