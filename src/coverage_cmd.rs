//! `coverage` subcommand driver: wires the BAM record source, the strand
//! policy, the scalar counter grid, and the ingest/emission pipelines
//! together (spec §6.4a).

use crate::adapters::BamRecordSource;
use crate::cigar::{walk_for_coverage, StrandPolicy};
use crate::cli::CoverageArgs;
use crate::grid::ScalarGrid;
use crate::pipeline::{run_emission, run_ingest};
use crate::source::TsvIntervalSink;
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{self, BufWriter};

pub fn run(args: CoverageArgs) -> Result<()> {
    if args.bin_size != 1 {
        bail!("--bin-size {} is not supported; only 1 is implemented", args.bin_size);
    }

    let mut source = open_bam_source(&args.bam)?;
    let table = source.reference_table();
    log::info!("opened {} with {} references", args.bam, table.n_targets());
    let grid = ScalarGrid::open(&table);
    let policy = StrandPolicy::new(args.library_type.into(), args.strand.into());

    log::debug!("ingesting with {} threads", args.threads);
    run_ingest(&mut source, args.threads, |record| {
        walk_for_coverage(record, &grid, &policy)
    })
    .context("coverage ingest failed")?;
    log::info!("ingest complete, emitting coverage track to {}", args.bw);

    if args.bw == "-" {
        let mut sink = TsvIntervalSink::new(BufWriter::new(io::stdout()));
        run_emission(&grid, &table, &mut sink, args.threads).context("coverage emission failed")?;
    } else {
        let file = File::create(&args.bw).with_context(|| format!("failed to create {}", args.bw))?;
        let mut sink = TsvIntervalSink::new(BufWriter::new(file));
        run_emission(&grid, &table, &mut sink, args.threads).context("coverage emission failed")?;
    }
    log::info!("coverage emission complete");

    Ok(())
}

fn open_bam_source(path: &str) -> Result<BamRecordSource<Box<dyn io::Read>>> {
    let reader: Box<dyn io::Read> = if path == "-" {
        Box::new(io::stdin())
    } else {
        Box::new(File::open(path).with_context(|| format!("failed to open {path}"))?)
    };
    BamRecordSource::new(reader).context("failed to read BAM header")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_unit_bin_size() {
        let args = CoverageArgs {
            bam: "-".to_string(),
            bw: "-".to_string(),
            library_type: crate::cli::LibraryTypeArg::Unstranded,
            strand: crate::cli::StrandArg::All,
            bin_size: 4,
            threads: 1,
        };
        let err = run(args).unwrap_err();
        assert!(err.to_string().contains("bin-size"));
    }
}
