//! Worker pool / bounded queue / writer thread (component D, spec §4.5).
//!
//! Two independent pipelines share this module's shape but differ in their
//! ordering contract:
//!
//! - *Ingest*: dispatcher reads records off a `RecordSource` in batches of
//!   up to [`INGEST_BATCH_SIZE`], hands each batch to a worker pool. Grid
//!   updates commute, so completion order doesn't matter — workers drain a
//!   shared job queue directly.
//! - *Emission*: dispatcher enumerates `(reference, window)` jobs in a
//!   fixed order and tags each with a sequence number; a single writer
//!   thread reassembles worker results in that order before handing runs to
//!   the `IntervalSink`, and stitches each window's open boundary runs
//!   against the previous window's trailing run.
//!
//! `n_threads == 0` selects a single-threaded path for either pipeline,
//! matching the CLI's `--threads 0` escape hatch (spec §6.4).

use crate::compact::{compact_window, Run};
use crate::error::{CoreError, CoreResult};
use crate::grid::{RefGrid, ScalarGrid};
use crate::source::{AlignedRecord, IntervalSink, ReferenceTable};
use crossbeam_channel::bounded;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Records per ingest job, matching the source's job buffer capacity.
pub const INGEST_BATCH_SIZE: usize = 10_000;

/// Target bytes per emission window before it is cut, spec §4.5's "roughly
/// 128Ki positions' worth of blocks". `K = ceil(target / block_size) + 1`:
/// the `+1` guarantees a window always contains at least one present block
/// once the loop below finds one, so no window is emitted empty by
/// construction (see [`windows_for_block_count`]).
const EMISSION_TARGET_BYTES: usize = 1 << 17;

fn emission_window_present_block_target(block_size: u32) -> usize {
    (EMISSION_TARGET_BYTES / block_size as usize) + 1
}

/// A bounded multi-producer multi-consumer pool of reusable buffers (spec
/// §4.5 "object recycling"). `take` blocks until a buffer is available;
/// `put` returns one. Never grows past its initial size.
pub struct ObjectPool<T> {
    tx: crossbeam_channel::Sender<T>,
    rx: crossbeam_channel::Receiver<T>,
}

impl<T> ObjectPool<T> {
    pub fn new(initial: Vec<T>) -> Self {
        let (tx, rx) = bounded(initial.len().max(1));
        for item in initial {
            tx.send(item).expect("pool channel sized to initial length");
        }
        ObjectPool { tx, rx }
    }

    pub fn take(&self) -> T {
        self.rx.recv().expect("pool sender outlives every receiver")
    }

    pub fn put(&self, item: T) {
        let _ = self.tx.send(item);
    }
}

/// Runs every record in `source` through `process`, fanning out across
/// `n_threads` workers (or running inline if `n_threads == 0`). The first
/// error from either the source or `process` stops the dispatcher from
/// reading further input; workers finish the batches already queued, then
/// the pool drains. Mirrors `samvt_coverage`'s `mt_queue` ingest loop.
pub fn run_ingest<F>(
    source: &mut dyn crate::source::RecordSource,
    n_threads: usize,
    process: F,
) -> CoreResult<()>
where
    F: Fn(&AlignedRecord) -> CoreResult<()> + Sync,
{
    if n_threads == 0 {
        loop {
            match source.next_record() {
                Ok(Some(record)) => process(&record)?,
                Ok(None) => return Ok(()),
                Err(e) => return Err(CoreError::SourceRead(e)),
            }
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let error_slot: Mutex<Option<CoreError>> = Mutex::new(None);
    let pool: ObjectPool<Vec<AlignedRecord>> = ObjectPool::new(
        (0..n_threads * 5)
            .map(|_| Vec::with_capacity(INGEST_BATCH_SIZE))
            .collect(),
    );
    let (job_tx, job_rx) = bounded::<Vec<AlignedRecord>>(8 * n_threads);

    let source_result = thread::scope(|scope| {
        for _ in 0..n_threads {
            let job_rx = job_rx.clone();
            let process = &process;
            let shutdown = Arc::clone(&shutdown);
            let error_slot = &error_slot;
            let pool = &pool;
            scope.spawn(move || {
                while let Ok(mut batch) = job_rx.recv() {
                    if !shutdown.load(Ordering::SeqCst) {
                        for record in &batch {
                            if let Err(e) = process(record) {
                                shutdown.store(true, Ordering::SeqCst);
                                let mut slot = error_slot.lock().unwrap();
                                if slot.is_none() {
                                    *slot = Some(e);
                                }
                            }
                        }
                    }
                    batch.clear();
                    pool.put(batch);
                }
            });
        }

        let mut source_result = Ok(());
        'dispatch: loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let mut batch = pool.take();
            loop {
                if batch.len() >= INGEST_BATCH_SIZE {
                    break;
                }
                match source.next_record() {
                    Ok(Some(record)) => batch.push(record),
                    Ok(None) => {
                        if !batch.is_empty() {
                            let _ = job_tx.send(batch);
                        }
                        break 'dispatch;
                    }
                    Err(e) => {
                        source_result = Err(CoreError::SourceRead(e));
                        if !batch.is_empty() {
                            let _ = job_tx.send(batch);
                        }
                        break 'dispatch;
                    }
                }
            }
            if job_tx.send(batch).is_err() {
                break;
            }
        }
        drop(job_tx);
        source_result
    });

    if let Some(e) = error_slot.into_inner().unwrap() {
        log::warn!("ingest pipeline shutting down after a worker error");
        return Err(e);
    }
    source_result
}

/// Enumerates the `(block_start, block_end)` windows of one reference's
/// grid, cutting a window once it has accumulated
/// [`emission_window_present_block_target`] present blocks (or the
/// reference ends). An all-absent reference yields exactly one window
/// spanning every block — the natural consequence of the loop never
/// finding a present block to cut on, not a special case.
pub(crate) fn windows_for_block_count<T>(rg: &RefGrid<T>) -> CoreResult<Vec<(usize, usize)>>
where
    T: Default + Copy,
{
    let block_count = rg.block_count();
    let target = emission_window_present_block_target(rg.block_size());
    let mut windows = Vec::new();
    let mut block_index = 0usize;
    while block_index < block_count {
        let window_start = block_index;
        let mut present_seen = 0usize;
        while block_index < block_count {
            let present = rg.with_block(block_index, |b| b.is_some())?;
            block_index += 1;
            if present {
                present_seen += 1;
                if present_seen >= target {
                    break;
                }
            }
        }
        windows.push((window_start, block_index));
    }
    Ok(windows)
}

/// Per-reference stitching state carried across emission windows: the
/// trailing run of one window may continue into the next, so it is held
/// back until either it proves open-ended-but-disjoint or the reference's
/// last window confirms it actually ends.
struct ReferenceEmitState {
    pending: Option<Run<u32>>,
    started: bool,
}

impl ReferenceEmitState {
    fn new() -> Self {
        ReferenceEmitState {
            pending: None,
            started: false,
        }
    }

    fn ingest_window<S: IntervalSink>(
        &mut self,
        ref_name: &str,
        mut runs: Vec<Run<u32>>,
        is_last_window: bool,
        sink: &mut S,
    ) -> Result<(), io::Error> {
        if runs.is_empty() {
            return Ok(());
        }
        if let Some(pending) = self.pending.take() {
            if pending.value == runs[0].value && pending.end == runs[0].start {
                runs[0].start = pending.start;
            } else {
                runs.insert(0, pending);
            }
        }
        if !is_last_window {
            self.pending = runs.pop();
        }
        if runs.is_empty() {
            return Ok(());
        }
        let starts: Vec<u32> = runs.iter().map(|r| r.start).collect();
        let ends: Vec<u32> = runs.iter().map(|r| r.end).collect();
        let values: Vec<f32> = runs.iter().map(|r| r.value as f32).collect();
        if !self.started {
            sink.add_intervals(ref_name, &starts, &ends, &values)?;
            self.started = true;
        } else {
            sink.append_intervals(&starts, &ends, &values)?;
        }
        Ok(())
    }
}

/// Drives the full coverage grid through the writer, chromosome by
/// chromosome. Matches `output_bw`: a chrom list is written first, then
/// intervals reference by reference in target order.
pub fn run_emission<S: IntervalSink>(
    grid: &ScalarGrid,
    table: &ReferenceTable,
    sink: &mut S,
    n_threads: usize,
) -> CoreResult<()> {
    sink.add_chrom_list(&table.names, &table.lengths)
        .map_err(CoreError::SinkWrite)?;
    log::debug!(
        "emitting {} references with {} threads",
        table.n_targets(),
        n_threads
    );
    if n_threads == 0 {
        for t in 0..grid.n_targets() {
            emit_reference_single_threaded(grid, table, t, sink)?;
        }
    } else {
        emit_all_references_multi_threaded(grid, table, sink, n_threads)?;
    }
    sink.close().map_err(CoreError::SinkWrite)
}

fn emit_reference_single_threaded<S: IntervalSink>(
    grid: &ScalarGrid,
    table: &ReferenceTable,
    t: usize,
    sink: &mut S,
) -> CoreResult<()> {
    let rg = grid.grid(t);
    let windows = windows_for_block_count(rg)?;
    let n = windows.len();
    let mut state = ReferenceEmitState::new();
    for (i, (bs, be)) in windows.into_iter().enumerate() {
        let runs = compact_window(rg, bs, be)?;
        state
            .ingest_window(&table.names[t], runs, i + 1 == n, sink)
            .map_err(CoreError::SinkWrite)?;
    }
    Ok(())
}

struct EmissionJob {
    seq: u64,
    ref_index: usize,
    bs: usize,
    be: usize,
    is_last: bool,
}

struct EmissionResult {
    seq: u64,
    ref_index: usize,
    runs: Vec<Run<u32>>,
    is_last: bool,
}

/// Multi-threaded emission: a pool of workers run [`compact_window`] on
/// windows dispatched in reference/window order; a single writer thread
/// reassembles worker results by sequence number before handing runs to
/// the sink, so the sink only ever sees strictly increasing positions
/// despite out-of-order worker completion (spec §4.5 "Shared resources").
fn emit_all_references_multi_threaded<S: IntervalSink>(
    grid: &ScalarGrid,
    table: &ReferenceTable,
    sink: &mut S,
    n_threads: usize,
) -> CoreResult<()> {
    let (job_tx, job_rx) = bounded::<EmissionJob>(2 * n_threads);
    let (res_tx, res_rx) = bounded::<CoreResult<EmissionResult>>(2 * n_threads);
    let shutdown = Arc::new(AtomicBool::new(false));

    thread::scope(|scope| -> CoreResult<()> {
        for _ in 0..n_threads {
            let job_rx = job_rx.clone();
            let res_tx = res_tx.clone();
            let shutdown = Arc::clone(&shutdown);
            scope.spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    let rg = grid.grid(job.ref_index);
                    let sent = match compact_window(rg, job.bs, job.be) {
                        Ok(runs) => res_tx.send(Ok(EmissionResult {
                            seq: job.seq,
                            ref_index: job.ref_index,
                            runs,
                            is_last: job.is_last,
                        })),
                        Err(e) => {
                            shutdown.store(true, Ordering::SeqCst);
                            res_tx.send(Err(e))
                        }
                    };
                    if sent.is_err() {
                        break;
                    }
                }
            });
        }
        drop(res_tx);

        let writer_shutdown = Arc::clone(&shutdown);
        let writer_table = table;
        let writer = scope.spawn(move || -> CoreResult<()> {
            let mut stash: HashMap<u64, EmissionResult> = HashMap::new();
            let mut next_seq = 0u64;
            let mut state = ReferenceEmitState::new();
            let mut current_ref: Option<usize> = None;
            while let Ok(item) = res_rx.recv() {
                let result = match item {
                    Ok(r) => r,
                    Err(e) => {
                        writer_shutdown.store(true, Ordering::SeqCst);
                        return Err(e);
                    }
                };
                stash.insert(result.seq, result);
                while let Some(r) = stash.remove(&next_seq) {
                    if current_ref != Some(r.ref_index) {
                        state = ReferenceEmitState::new();
                        current_ref = Some(r.ref_index);
                    }
                    state
                        .ingest_window(&writer_table.names[r.ref_index], r.runs, r.is_last, sink)
                        .map_err(CoreError::SinkWrite)?;
                    next_seq += 1;
                }
            }
            Ok(())
        });

        let mut seq = 0u64;
        'dispatch: for t in 0..table.n_targets() {
            let rg = grid.grid(t);
            let windows = windows_for_block_count(rg)?;
            let n = windows.len();
            for (i, (bs, be)) in windows.into_iter().enumerate() {
                if shutdown.load(Ordering::SeqCst) {
                    break 'dispatch;
                }
                let job = EmissionJob {
                    seq,
                    ref_index: t,
                    bs,
                    be,
                    is_last: i + 1 == n,
                };
                if job_tx.send(job).is_err() {
                    break 'dispatch;
                }
                seq += 1;
            }
        }
        drop(job_tx);

        writer.join().expect("emission writer thread panicked")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::BLOCK_SHIFT;
    use crate::source::VecIntervalSink;
    use std::io;

    struct VecRecordSource {
        records: Vec<AlignedRecord>,
        idx: usize,
        fail_after: Option<usize>,
    }

    impl crate::source::RecordSource for VecRecordSource {
        fn next_record(&mut self) -> io::Result<Option<AlignedRecord>> {
            if let Some(k) = self.fail_after {
                if self.idx == k {
                    return Err(io::Error::new(io::ErrorKind::Other, "boom"));
                }
            }
            if self.idx >= self.records.len() {
                return Ok(None);
            }
            let r = self.records[self.idx].clone();
            self.idx += 1;
            Ok(Some(r))
        }
    }

    fn record(tid: i32, pos: i64, len: u32) -> AlignedRecord {
        AlignedRecord {
            tid,
            pos,
            flags: 0,
            cigar: vec![(crate::cigar::CigarOp::Match, len)],
            seq: vec![],
        }
    }

    fn table(lens: &[u32]) -> ReferenceTable {
        ReferenceTable {
            names: lens.iter().enumerate().map(|(i, _)| format!("r{i}")).collect(),
            lengths: lens.to_vec(),
        }
    }

    #[test]
    fn ingest_single_threaded_matches_multi_threaded() {
        let t = table(&[100]);
        let records: Vec<AlignedRecord> = (0..20).map(|i| record(0, i * 3, 5)).collect();

        let single = ScalarGrid::open(&t);
        let mut src = VecRecordSource {
            records: records.clone(),
            idx: 0,
            fail_after: None,
        };
        run_ingest(&mut src, 0, |r| single.update(r.tid as usize, r.pos as u32, r.pos as u32 + 5)).unwrap();

        let multi = ScalarGrid::open(&t);
        let mut src = VecRecordSource {
            records,
            idx: 0,
            fail_after: None,
        };
        run_ingest(&mut src, 4, |r| multi.update(r.tid as usize, r.pos as u32, r.pos as u32 + 5)).unwrap();

        for block_index in 0..single.grid(0).block_count().max(1) {
            let a = single.grid(0).with_block(block_index, |c| c.map(|s| s.to_vec()));
            let b = multi.grid(0).with_block(block_index, |c| c.map(|s| s.to_vec()));
            assert_eq!(a.ok(), b.ok());
        }
    }

    #[test]
    fn ingest_propagates_source_read_error() {
        let t = table(&[10]);
        let grid = ScalarGrid::open(&t);
        let mut src = VecRecordSource {
            records: vec![record(0, 0, 1), record(0, 1, 1)],
            idx: 0,
            fail_after: Some(1),
        };
        let err = run_ingest(&mut src, 0, |r| grid.update(r.tid as usize, r.pos as u32, r.pos as u32 + 1));
        assert!(err.is_err());
    }

    #[test]
    fn all_absent_reference_emits_one_zero_run() {
        let block = 1u32 << BLOCK_SHIFT;
        let t = table(&[block * 50]);
        let grid = ScalarGrid::open(&t);
        let mut sink = VecIntervalSink::default();
        run_emission(&grid, &t, &mut sink, 0).unwrap();
        assert_eq!(sink.intervals, vec![("r0".to_string(), 0, block * 50, 0.0)]);
    }

    #[test]
    fn emission_single_threaded_stitches_across_windows() {
        let block = 1u32 << BLOCK_SHIFT;
        // Enough blocks that windows_for_block_count cuts more than once,
        // with a touched block straddling the cut so stitching is exercised.
        let target = emission_window_present_block_target(block);
        let t = table(&[block * (target as u32 + 3)]);
        let grid = ScalarGrid::open(&t);
        // Touch a run that crosses the window boundary at block `target`.
        let boundary = target as u32 * block;
        grid.update(0, boundary - 5, boundary + 5).unwrap();

        let mut sink = VecIntervalSink::default();
        run_emission(&grid, &t, &mut sink, 0).unwrap();

        let total: u32 = sink.intervals.iter().map(|(_, s, e, _)| e - s).sum();
        assert_eq!(total, t.lengths[0]);
        // exactly one run carries the touched value, spanning the boundary.
        let touched: Vec<_> = sink.intervals.iter().filter(|(_, _, _, v)| *v > 0.0).collect();
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].1, boundary - 5);
        assert_eq!(touched[0].2, boundary + 5);
    }

    #[test]
    fn emission_multi_threaded_matches_single_threaded() {
        let block = 1u32 << BLOCK_SHIFT;
        let target = emission_window_present_block_target(block);
        let t = table(&[block * (target as u32 + 3), block * 2]);
        let grid = ScalarGrid::open(&t);
        grid.update(0, 10, 20).unwrap();
        grid.update(0, target as u32 * block - 2, target as u32 * block + 2).unwrap();
        grid.update(1, 0, block + 1).unwrap();

        let mut single_sink = VecIntervalSink::default();
        run_emission(&grid, &t, &mut single_sink, 0).unwrap();

        let mut multi_sink = VecIntervalSink::default();
        run_emission(&grid, &t, &mut multi_sink, 4).unwrap();

        assert_eq!(single_sink.intervals, multi_sink.intervals);
    }
}
