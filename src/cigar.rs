//! CIGAR walking and strand-selection policy (component B, spec §4.3).

use crate::error::CoreResult;
use crate::grid::{FiveChannelGrid, ScalarGrid};
use crate::source::{AlignedRecord, PackedSeq};

/// One CIGAR operation. `=`/`X` (sequence match/mismatch) consume exactly
/// as `M` does for the purposes of this walker (bam_cigar_type treats them
/// identically), so they fold into `Match`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CigarOp {
    Match,
    Insertion,
    Deletion,
    Skip,
    SoftClip,
    HardClip,
    Pad,
}

impl CigarOp {
    /// `(consumes_reference, consumes_read)`, the htslib `bam_cigar_type`
    /// classification referenced by spec §4.3.
    pub fn consumes(self) -> (bool, bool) {
        match self {
            CigarOp::Match => (true, true),
            CigarOp::Insertion | CigarOp::SoftClip => (false, true),
            CigarOp::Deletion | CigarOp::Skip => (true, false),
            CigarOp::HardClip | CigarOp::Pad => (false, false),
        }
    }
}

/// BAM flag bits consulted by the strand policies below.
pub mod flags {
    pub const PAIRED: u16 = 0x1;
    pub const REVERSE: u16 = 0x10;
    pub const READ1: u16 = 0x40;
    pub const READ2: u16 = 0x80;
}

/// Library type, spec §4.3 strand-selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryType {
    Unstranded,
    FrFirstStrand,
    FrSecondStrand,
}

/// Requested strand for coverage, spec §6.4 `--strand`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedStrand {
    All,
    Forward,
    Reverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Select {
    All,
    FirstForward,
    FirstReverse,
}

/// Resolves `(library_type, requested_strand)` into the record-skip policy
/// used by coverage ingest, matching `samvt_coverage`'s `select` derivation.
fn resolve_select(library_type: LibraryType, strand: RequestedStrand) -> Select {
    use LibraryType::*;
    use RequestedStrand::*;
    match (library_type, strand) {
        (FrFirstStrand, Forward) | (FrSecondStrand, Reverse) => Select::FirstReverse,
        (FrFirstStrand, Reverse) | (FrSecondStrand, Forward) => Select::FirstForward,
        _ => Select::All,
    }
}

/// Strand-selection policy for coverage ingest (spec §4.3).
#[derive(Debug, Clone, Copy)]
pub struct StrandPolicy {
    select: Select,
}

impl StrandPolicy {
    pub fn new(library_type: LibraryType, strand: RequestedStrand) -> Self {
        StrandPolicy {
            select: resolve_select(library_type, strand),
        }
    }

    /// True if this record should be skipped entirely for coverage
    /// purposes, mirroring `extract_coverage`'s `SELECT_*` checks.
    pub fn skip(&self, flag: u16) -> bool {
        if self.select == Select::All {
            return false;
        }
        let paired = flag & flags::PAIRED != 0;
        let reverse = flag & flags::REVERSE != 0;
        let read1 = flag & flags::READ1 != 0;
        let read2 = flag & flags::READ2 != 0;
        if paired {
            match self.select {
                Select::FirstReverse => (read1 && !reverse) || (read2 && reverse),
                Select::FirstForward => (read1 && reverse) || (read2 && !reverse),
                Select::All => false,
            }
        } else {
            match self.select {
                Select::FirstReverse => !reverse,
                Select::FirstForward => reverse,
                Select::All => false,
            }
        }
    }
}

/// Derives the `'+'`/`'-'`/`'.'` strand label for mutation, spec §4.3
/// "Strand-derivation", mirroring `samvt_mutation.c`'s `get_strand`.
pub fn derive_strand(flag: u16, library_type: LibraryType) -> char {
    let paired = flag & flags::PAIRED != 0;
    let reverse = flag & flags::REVERSE != 0;
    let read1 = flag & flags::READ1 != 0;
    let read2 = flag & flags::READ2 != 0;
    match library_type {
        LibraryType::Unstranded => '.',
        LibraryType::FrFirstStrand => {
            if paired {
                if (read1 && reverse) || (read2 && !reverse) {
                    '+'
                } else {
                    '-'
                }
            } else if reverse {
                '+'
            } else {
                '-'
            }
        }
        LibraryType::FrSecondStrand => {
            if paired {
                if (read1 && !reverse) || (read2 && reverse) {
                    '+'
                } else {
                    '-'
                }
            } else if reverse {
                '-'
            } else {
                '+'
            }
        }
    }
}

/// Walks one record's CIGAR, issuing a scalar-grid increment for each
/// consumes-both segment that survives the strand policy. Mirrors
/// `extract_coverage`.
pub fn walk_for_coverage(
    record: &AlignedRecord,
    grid: &ScalarGrid,
    policy: &StrandPolicy,
) -> CoreResult<()> {
    if policy.skip(record.flags) {
        return Ok(());
    }
    let mut pos = record.pos;
    for &(op, len) in &record.cigar {
        let (consumes_ref, consumes_read) = op.consumes();
        match (consumes_ref, consumes_read) {
            (true, true) => {
                grid.update(record.tid as usize, pos as u32, (pos + len as i64) as u32)?;
                pos += len as i64;
            }
            (true, false) => pos += len as i64,
            _ => {}
        }
    }
    Ok(())
}

/// Walks one record's CIGAR, issuing a five-channel grid increment for each
/// consumes-both segment. Mirrors `extract_mutation`.
pub fn walk_for_mutation(
    record: &AlignedRecord,
    grid: &FiveChannelGrid,
    library_type: LibraryType,
) -> CoreResult<()> {
    let strand = derive_strand(record.flags, library_type);
    let mut pos = record.pos;
    let mut read_pos: usize = 0;
    let seq = PackedSeq {
        data: &record.seq,
    };
    for &(op, len) in &record.cigar {
        let (consumes_ref, consumes_read) = op.consumes();
        match (consumes_ref, consumes_read) {
            (true, true) => {
                grid.update(
                    record.tid as usize,
                    pos as u32,
                    (pos + len as i64) as u32,
                    if strand == '-' { '-' } else { '+' },
                    &seq,
                    read_pos,
                )?;
                pos += len as i64;
                read_pos += len as usize;
            }
            (true, false) => pos += len as i64,
            (false, true) => read_pos += len as usize,
            (false, false) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strand_policy_select_first_reverse_skips_read1_forward() {
        let policy = StrandPolicy::new(LibraryType::FrFirstStrand, RequestedStrand::Forward);
        let flag = flags::PAIRED | flags::READ1;
        assert!(policy.skip(flag));
        let flag = flags::PAIRED | flags::READ1 | flags::REVERSE;
        assert!(!policy.skip(flag));
    }

    #[test]
    fn strand_policy_all_never_skips() {
        let policy = StrandPolicy::new(LibraryType::FrFirstStrand, RequestedStrand::All);
        assert!(!policy.skip(flags::PAIRED | flags::READ1 | flags::REVERSE));
    }

    #[test]
    fn single_end_select_policy_uses_reverse_flag_only() {
        let policy = StrandPolicy::new(LibraryType::FrFirstStrand, RequestedStrand::Reverse);
        assert!(policy.skip(0));
        assert!(!policy.skip(flags::REVERSE));
    }

    #[test]
    fn derive_strand_single_end_first_strand() {
        assert_eq!(derive_strand(0, LibraryType::FrFirstStrand), '-');
        assert_eq!(derive_strand(flags::REVERSE, LibraryType::FrFirstStrand), '+');
        assert_eq!(derive_strand(0, LibraryType::Unstranded), '.');
    }

    #[test]
    fn derive_strand_paired_second_strand() {
        let read1 = flags::PAIRED | flags::READ1;
        assert_eq!(derive_strand(read1, LibraryType::FrSecondStrand), '+');
        let read2 = flags::PAIRED | flags::READ2;
        assert_eq!(derive_strand(read2, LibraryType::FrSecondStrand), '-');
    }

    #[test]
    fn consumes_table_matches_sam_spec() {
        assert_eq!(CigarOp::Match.consumes(), (true, true));
        assert_eq!(CigarOp::Insertion.consumes(), (false, true));
        assert_eq!(CigarOp::Deletion.consumes(), (true, false));
        assert_eq!(CigarOp::Skip.consumes(), (true, false));
        assert_eq!(CigarOp::SoftClip.consumes(), (false, true));
        assert_eq!(CigarOp::HardClip.consumes(), (false, false));
        assert_eq!(CigarOp::Pad.consumes(), (false, false));
    }
}
