//! Mutation caller (component E, spec §4.6): per-position base-tally
//! filtering against a reference base (or modal-base fallback), plus a BED
//! mask mode that bypasses the filter entirely.

use crate::cigar::LibraryType;
use crate::error::{CoreError, CoreResult};
use crate::grid::{FiveChannelGrid, Tally};
use crate::pipeline::windows_for_block_count;
use crate::source::{Base, BedEntry, ReferenceSource, ReferenceTable};
use std::collections::HashMap;
use std::io::{self, Write};

/// `count_threshold`/`prop_threshold`, spec §4.6.
#[derive(Debug, Clone, Copy)]
pub struct MutationParams {
    pub count_threshold: f64,
    pub prop_threshold: f64,
}

/// One filtered row, spec §4.6's tab-separated output:
/// `ref_name  1-based_pos  strand  ref_base_or_?  A  C  G  T  N`.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRow {
    pub ref_name: String,
    pub pos: u32,
    pub strand: char,
    pub ref_base: char,
    pub tally: Tally,
}

impl MutationRow {
    pub fn write_tsv<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(
            w,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.ref_name,
            self.pos,
            self.strand,
            self.ref_base,
            self.tally.a,
            self.tally.c,
            self.tally.g,
            self.tally.t,
            self.tally.n,
        )
    }
}

/// Applies the `count_threshold`/`prop_threshold` filter to one position's
/// tally. Returns the reference-base character to report (`'?'` if none
/// was available) when the row should be emitted, `None` otherwise.
///
/// A present non-ACGT reference byte (e.g. `N` at an assembly gap) still
/// resolves to a channel: `Base::from_char` maps it to the N channel, per
/// spec §4.2's "else→4". The modal fallback is used only when no reference
/// base was available at all.
fn evaluate_position(tally: &Tally, ref_byte: Option<u8>, params: &MutationParams) -> Option<char> {
    let count_sum = tally.sum();
    if count_sum < params.count_threshold {
        return None;
    }
    let ref_count = match ref_byte {
        Some(byte) => tally.channel(Base::from_char(byte)),
        None => tally.max_channel(),
    };
    let proportion = 1.0 - ref_count / count_sum;
    if proportion >= params.prop_threshold {
        Some(ref_byte.map(|b| b as char).unwrap_or('?'))
    } else {
        None
    }
}

/// Scans one (reference, physical strand) row across its present blocks,
/// reporting `report_label` as the row's strand column — distinct from
/// `physical_strand` only for an unstranded library, where every record
/// lands in the `'+'` row but is reported as `'.'`.
pub fn scan_reference_strand(
    grid: &FiveChannelGrid,
    table: &ReferenceTable,
    t: usize,
    physical_strand: char,
    report_label: char,
    mut reference: Option<&mut dyn ReferenceSource>,
    params: &MutationParams,
    n_threads: usize,
) -> CoreResult<Vec<MutationRow>> {
    let row = grid.row_index(t, physical_strand);
    let rg = grid.grid(row);
    let len = rg.len();
    if len == 0 {
        return Ok(Vec::new());
    }
    let block_size = rg.block_size();
    let windows = windows_for_block_count(rg)?;
    let ref_name = table.names[t].clone();

    // BAM SEQ is always stored in forward-reference orientation, regardless
    // of which strand row is being scanned, so the reference is always
    // extracted forward — never reverse-complemented for the '-' row.
    let mut window_refs: Vec<Option<Vec<u8>>> = Vec::with_capacity(windows.len());
    for &(bs, be) in &windows {
        let start = bs as u32 * block_size;
        let end = (be as u32 * block_size).min(len);
        let bytes = match reference.as_deref_mut() {
            Some(r) => Some(
                r.extract(&ref_name, start, end, '+')
                    .map_err(CoreError::SourceRead)?,
            ),
            None => None,
        };
        window_refs.push(bytes);
    }

    let compute_window = |i: usize| -> CoreResult<Vec<MutationRow>> {
        let (bs, be) = windows[i];
        let window_start = bs as u32 * block_size;
        let ref_bytes = window_refs[i].as_ref();
        let mut rows = Vec::new();
        for block_index in bs..be {
            let block_start = block_index as u32 * block_size;
            rg.with_block(block_index, |opt| {
                let cells = match opt {
                    Some(c) => c,
                    None => return,
                };
                for (local, tally) in cells.iter().enumerate() {
                    let pos = block_start + local as u32;
                    let ref_byte = ref_bytes.map(|b| b[(pos - window_start) as usize]);
                    if let Some(ref_base) = evaluate_position(tally, ref_byte, params) {
                        rows.push(MutationRow {
                            ref_name: ref_name.clone(),
                            pos: pos + 1,
                            strand: report_label,
                            ref_base,
                            tally: *tally,
                        });
                    }
                }
            })?;
        }
        Ok(rows)
    };

    let per_window: Vec<Vec<MutationRow>> = if n_threads > 0 {
        use rayon::prelude::*;
        (0..windows.len())
            .into_par_iter()
            .map(compute_window)
            .collect::<CoreResult<Vec<_>>>()?
    } else {
        (0..windows.len()).map(compute_window).collect::<CoreResult<Vec<_>>>()?
    };
    Ok(per_window.into_iter().flatten().collect())
}

fn call_mutation_bed_mode<W: Write>(
    grid: &FiveChannelGrid,
    table: &ReferenceTable,
    entries: &[BedEntry],
    writer: &mut W,
) -> CoreResult<()> {
    let name_to_index: HashMap<&str, usize> = table
        .names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();
    for entry in entries {
        let t = match name_to_index.get(entry.reference.as_str()) {
            Some(&t) => t,
            None => {
                log::warn!("BED entry references unknown chromosome {}", entry.reference);
                continue;
            }
        };
        let physical_strand = if entry.strand == '-' { '-' } else { '+' };
        let rg = grid.grid(grid.row_index(t, physical_strand));
        let block_size = rg.block_size();
        for pos in entry.start..entry.end {
            let block_index = (pos / block_size) as usize;
            let local = (pos % block_size) as usize;
            let tally = rg.with_block(block_index, |opt| opt.map(|c| c[local]).unwrap_or_default())?;
            let row = MutationRow {
                ref_name: entry.reference.clone(),
                pos: pos + 1,
                strand: entry.strand,
                ref_base: '?',
                tally,
            };
            row.write_tsv(writer).map_err(CoreError::SinkWrite)?;
        }
    }
    Ok(())
}

/// Drives the full mutation report: BED mask mode when `bed_entries` is
/// given (bypasses the threshold filter entirely), otherwise the
/// threshold-filtered scan over every reference and (for stranded
/// libraries) both strand rows.
pub fn call_mutation<W: Write>(
    grid: &FiveChannelGrid,
    table: &ReferenceTable,
    library_type: LibraryType,
    mut reference: Option<&mut dyn ReferenceSource>,
    bed_entries: Option<&[BedEntry]>,
    params: &MutationParams,
    n_threads: usize,
    writer: &mut W,
) -> CoreResult<()> {
    if let Some(entries) = bed_entries {
        return call_mutation_bed_mode(grid, table, entries, writer);
    }
    let strand_rows: &[(char, char)] = if library_type == LibraryType::Unstranded {
        &[('+', '.')]
    } else {
        &[('+', '+'), ('-', '-')]
    };
    for t in 0..table.n_targets() {
        for &(physical, label) in strand_rows {
            let rows = scan_reference_strand(
                grid,
                table,
                t,
                physical,
                label,
                reference.as_deref_mut(),
                params,
                n_threads,
            )?;
            for row in rows {
                row.write_tsv(writer).map_err(CoreError::SinkWrite)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::PackedSeq;

    fn table(lens: &[u32]) -> ReferenceTable {
        ReferenceTable {
            names: lens.iter().enumerate().map(|(i, _)| format!("r{i}")).collect(),
            lengths: lens.to_vec(),
        }
    }

    struct FixedRef(Vec<u8>);
    impl ReferenceSource for FixedRef {
        fn extract(&mut self, _name: &str, start: u32, end: u32, _strand: char) -> io::Result<Vec<u8>> {
            Ok(self.0[start as usize..end as usize].to_vec())
        }
    }

    /// Records the strand argument it was called with, so callers can
    /// assert on which orientation was requested.
    struct StrandRecordingRef {
        bases: Vec<u8>,
        seen_strands: Vec<char>,
    }
    impl ReferenceSource for StrandRecordingRef {
        fn extract(&mut self, _name: &str, start: u32, end: u32, strand: char) -> io::Result<Vec<u8>> {
            self.seen_strands.push(strand);
            Ok(self.bases[start as usize..end as usize].to_vec())
        }
    }

    #[test]
    fn evaluate_position_rejects_below_count_threshold() {
        let params = MutationParams {
            count_threshold: 10.0,
            prop_threshold: 0.1,
        };
        let tally = Tally { a: 3.0, c: 1.0, g: 0.0, t: 0.0, n: 0.0 };
        assert_eq!(evaluate_position(&tally, Some(b'A'), &params), None);
    }

    #[test]
    fn evaluate_position_emits_on_high_mismatch_proportion() {
        let params = MutationParams {
            count_threshold: 5.0,
            prop_threshold: 0.2,
        };
        // ref is A, but only 2/10 reads are A -> proportion mismatch = 0.8.
        let tally = Tally { a: 2.0, c: 8.0, g: 0.0, t: 0.0, n: 0.0 };
        assert_eq!(evaluate_position(&tally, Some(b'A'), &params), Some('A'));
    }

    #[test]
    fn evaluate_position_suppresses_on_low_mismatch_proportion() {
        let params = MutationParams {
            count_threshold: 5.0,
            prop_threshold: 0.2,
        };
        let tally = Tally { a: 9.0, c: 1.0, g: 0.0, t: 0.0, n: 0.0 };
        assert_eq!(evaluate_position(&tally, Some(b'A'), &params), None);
    }

    #[test]
    fn evaluate_position_falls_back_to_modal_channel_without_reference() {
        let params = MutationParams {
            count_threshold: 5.0,
            prop_threshold: 0.2,
        };
        // No reference base: modal channel (G, 7) stands in as ref_count,
        // so mismatch proportion is 3/10 = 0.3 >= 0.2 -> emitted as '?'.
        let tally = Tally { a: 1.0, c: 2.0, g: 7.0, t: 0.0, n: 0.0 };
        assert_eq!(evaluate_position(&tally, None, &params), Some('?'));
    }

    #[test]
    fn evaluate_position_resolves_present_n_reference_byte_to_n_channel() {
        let params = MutationParams {
            count_threshold: 5.0,
            prop_threshold: 0.2,
        };
        // ref is 'N' (an assembly gap): ref_count must come from the N
        // channel (0 here), not the modal channel (G, 7) the old fallback
        // would have picked. Mismatch proportion is 10/10 = 1.0 >= 0.2.
        let tally = Tally { a: 1.0, c: 2.0, g: 7.0, t: 0.0, n: 0.0 };
        assert_eq!(evaluate_position(&tally, Some(b'N'), &params), Some('N'));
    }

    #[test]
    fn scan_reference_strand_always_extracts_forward_reference() {
        let t = table(&[10]);
        let grid = FiveChannelGrid::open(&t);
        let raw = [0x11u8];
        let seq = PackedSeq { data: &raw };
        for _ in 0..10 {
            grid.update(0, 0, 1, '-', &seq, 0).unwrap();
        }
        let params = MutationParams {
            count_threshold: 5.0,
            prop_threshold: 0.1,
        };
        let mut reference = StrandRecordingRef {
            bases: b"AAAAAAAAAA".to_vec(),
            seen_strands: Vec::new(),
        };
        scan_reference_strand(&grid, &t, 0, '-', '-', Some(&mut reference), &params, 0).unwrap();
        assert!(reference.seen_strands.iter().all(|&s| s == '+'));
    }

    #[test]
    fn scan_reference_strand_reports_reference_base_and_position() {
        let t = table(&[10]);
        let grid = FiveChannelGrid::open(&t);
        let raw = [0x21u8]; // 'C' (nibble 2) then 'A' (nibble 1)
        let seq = PackedSeq { data: &raw };
        // 8 reads of C, 2 of A at position 0 -> mismatch vs ref A is high.
        for _ in 0..8 {
            grid.update(0, 0, 1, '+', &seq, 0).unwrap();
        }
        for _ in 0..2 {
            grid.update(0, 0, 1, '+', &seq, 1).unwrap();
        }
        let params = MutationParams {
            count_threshold: 5.0,
            prop_threshold: 0.5,
        };
        let mut reference = FixedRef(b"AAAAAAAAAA".to_vec());
        let rows = scan_reference_strand(&grid, &t, 0, '+', '+', Some(&mut reference), &params, 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pos, 1);
        assert_eq!(rows[0].ref_base, 'A');
        assert_eq!(rows[0].tally.c, 8.0);
        assert_eq!(rows[0].tally.a, 2.0);
    }

    #[test]
    fn bed_mode_emits_every_position_with_question_mark_base() {
        let t = table(&[10]);
        let grid = FiveChannelGrid::open(&t);
        let raw = [0x11u8];
        let seq = PackedSeq { data: &raw };
        grid.update(0, 0, 2, '+', &seq, 0).unwrap();
        let entries = vec![BedEntry {
            reference: "r0".to_string(),
            start: 0,
            end: 3,
            strand: '+',
        }];
        let mut out = Vec::new();
        call_mutation_bed_mode(&grid, &t, &entries, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in &lines {
            let fields: Vec<&str> = line.split('\t').collect();
            assert_eq!(fields[3], "?");
        }
    }

    #[test]
    fn unstranded_library_scans_only_plus_row_reporting_dot() {
        let t = table(&[5]);
        let grid = FiveChannelGrid::open(&t);
        let raw = [0x11u8];
        let seq = PackedSeq { data: &raw };
        for _ in 0..10 {
            grid.update(0, 0, 1, '+', &seq, 0).unwrap();
        }
        let params = MutationParams {
            count_threshold: 5.0,
            prop_threshold: 0.1,
        };
        let mut out = Vec::new();
        call_mutation(
            &grid,
            &t,
            LibraryType::Unstranded,
            None,
            None,
            &params,
            0,
            &mut out,
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.lines().next().unwrap().contains('.'));
    }
}
