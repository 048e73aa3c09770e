//! Concrete collaborator implementations over `noodles`: a `RecordSource`
//! reading BAM, a `ReferenceSource` reading an indexed FASTA. These bridge
//! the container formats' own representations (typed CIGAR ops, decoded
//! ASCII bases) into the core's plain, container-agnostic shapes
//! (`(CigarOp, u32)` pairs, nibble-packed read bases) — the packing itself
//! is this adapter's concern, not the core's, per the trait docs in
//! `source.rs`.

use crate::cigar::{self, CigarOp};
use crate::source::{AlignedRecord, ReferenceSource, ReferenceTable, RecordSource};
use anyhow::{Context, Result};
use noodles::bam;
use noodles::bgzf;
use noodles::core::{Position, Region};
use noodles::fasta;
use noodles::sam;
use noodles::sam::alignment::record::cigar::op::Kind;
use noodles::sam::alignment::record::{Cigar as _, Sequence as _};
use std::io::{self, Read};

fn ascii_to_nibble(base: u8) -> u8 {
    match base.to_ascii_uppercase() {
        b'A' => 1,
        b'C' => 2,
        b'G' => 4,
        b'T' => 8,
        _ => 15,
    }
}

/// Packs a stream of ASCII read bases two-per-byte, high nibble first,
/// mirroring the on-disk BAM layout our `PackedSeq` decoder expects.
fn pack_bases(bases: impl Iterator<Item = u8>) -> Vec<u8> {
    let mut packed = Vec::new();
    let mut high: Option<u8> = None;
    for base in bases {
        let nibble = ascii_to_nibble(base);
        match high.take() {
            Some(h) => packed.push((h << 4) | nibble),
            None => high = Some(nibble),
        }
    }
    if let Some(h) = high {
        packed.push(h << 4);
    }
    packed
}

fn cigar_kind_to_op(kind: Kind) -> CigarOp {
    match kind {
        Kind::Match | Kind::SequenceMatch | Kind::SequenceMismatch => CigarOp::Match,
        Kind::Insertion => CigarOp::Insertion,
        Kind::Deletion => CigarOp::Deletion,
        Kind::Skip => CigarOp::Skip,
        Kind::SoftClip => CigarOp::SoftClip,
        Kind::HardClip => CigarOp::HardClip,
        Kind::Pad => CigarOp::Pad,
    }
}

/// Reads alignment records from a BAM stream, decoding just the fields the
/// core needs: `tid`/`pos`/`flags`/CIGAR/packed read bases.
pub struct BamRecordSource<R> {
    reader: bam::io::Reader<bgzf::io::Reader<R>>,
    header: sam::Header,
}

impl<R: Read> BamRecordSource<R> {
    pub fn new(inner: R) -> Result<Self> {
        let mut reader = bam::io::Reader::new(bgzf::io::Reader::new(inner));
        let header = reader.read_header().context("failed to read BAM header")?;
        Ok(BamRecordSource { reader, header })
    }

    /// Builds the reference table this source's records are indexed
    /// against (spec §3 "Reference table"), read once up front.
    pub fn reference_table(&self) -> ReferenceTable {
        let mut names = Vec::new();
        let mut lengths = Vec::new();
        for (name, seq) in self.header.reference_sequences() {
            names.push(name.to_string());
            lengths.push(seq.length().get() as u32);
        }
        ReferenceTable { names, lengths }
    }
}

impl<R: Read> RecordSource for BamRecordSource<R> {
    fn next_record(&mut self) -> io::Result<Option<AlignedRecord>> {
        let mut record = bam::Record::default();
        let n = self.reader.read_record(&self.header, &mut record)?;
        if n == 0 {
            return Ok(None);
        }

        let tid = record
            .reference_sequence_id(&self.header)
            .transpose()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            .map(|id| id as i32)
            .unwrap_or(-1);

        let pos = record
            .alignment_start()
            .transpose()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            .map(|p| (p.get() - 1) as i64)
            .unwrap_or(-1);

        let f = record.flags();
        let mut flags: u16 = 0;
        if f.is_segmented() {
            flags |= cigar::flags::PAIRED;
        }
        if f.is_reverse_complemented() {
            flags |= cigar::flags::REVERSE;
        }
        if f.is_first_segment() {
            flags |= cigar::flags::READ1;
        }
        if f.is_second_segment() {
            flags |= cigar::flags::READ2;
        }

        let mut cigar_ops = Vec::new();
        for op in record.cigar().iter() {
            let op = op.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            cigar_ops.push((cigar_kind_to_op(op.kind()), op.len() as u32));
        }

        let mut bases = Vec::new();
        for base in record.sequence().iter() {
            bases.push(base.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?);
        }

        Ok(Some(AlignedRecord {
            tid,
            pos,
            flags,
            cigar: cigar_ops,
            seq: pack_bases(bases.into_iter()),
        }))
    }
}

fn reverse_complement(bases: &[u8]) -> Vec<u8> {
    bases
        .iter()
        .rev()
        .map(|&b| match b {
            b'A' => b'T',
            b'T' => b'A',
            b'C' => b'G',
            b'G' => b'C',
            other => other,
        })
        .collect()
}

/// Reads reference sequence ranges out of an indexed (`.fai`) FASTA file,
/// spec §6.2. Grounded on the teacher's own `fasta::Record::sequence()`
/// `.as_ref() -> &[u8]` usage in `main.rs`, plus `noodles::fasta`'s
/// indexed-reader/region query support for the offset arithmetic spec §6.2
/// calls out explicitly.
pub struct FastaReferenceSource {
    reader: fasta::io::IndexedReader<std::fs::File>,
}

impl FastaReferenceSource {
    pub fn open(path: &str) -> Result<Self> {
        let reader = fasta::io::indexed_reader::Builder::default()
            .build_from_path(path)
            .with_context(|| format!("failed to open indexed reference {path}"))?;
        Ok(FastaReferenceSource { reader })
    }
}

impl ReferenceSource for FastaReferenceSource {
    fn extract(&mut self, ref_name: &str, start: u32, end: u32, strand: char) -> io::Result<Vec<u8>> {
        if end <= start {
            return Ok(Vec::new());
        }
        let lower = Position::new(start as usize + 1)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid start position"))?;
        let upper = Position::new(end as usize)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid end position"))?;
        let region = Region::new(ref_name.as_bytes().to_vec(), lower..=upper);
        let record = self
            .reader
            .query(&region)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let bases = record.sequence().as_ref().to_ascii_uppercase();
        Ok(if strand == '-' {
            reverse_complement(&bases)
        } else {
            bases
        })
    }
}
