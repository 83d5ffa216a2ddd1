//! The demultiplex pipeline: pulls records from one (single-end) or two lock-stepped
//! (paired-end) FASTQ streams, feeds them through the shared queue to the
//! [`OutputRouter`] workers for classification and writing, and finalizes metrics once
//! the router has drained.
//!
//! Per-record problems degrade to the invalid sentinel and the run continues; an
//! unreadable input, desynchronized mate streams or an unwritable output aborts the
//! whole run with a single report.

use crate::barcode_matching::SampleMatcher;
use crate::classifier::ReadClassifier;
use crate::metrics::{DemuxCounters, write_demux_metrics};
use crate::output_router::{FastqWriter, OutputRouter, OutputTarget};
use crate::read_set::ReadUnit;
use crate::samples::SampleGroup;
use anyhow::{Context, Result, anyhow, bail, ensure};
use fgoxide::io::Io;
use log::info;
use proglog::{CountFormatterKind, ProgLogBuilder};
use seq_io::fastq::Reader as FastqReader;
use seq_io::fastq::Record;
use std::io::BufRead;
use std::path::PathBuf;

/// The buffer size to use for readers and writers
const BUFFER_SIZE: usize = 1024 * 1024;
/// The name of the metrics file written into the output directory.
pub const METRICS_FILE_NAME: &str = "demux_metrics.tsv";

/// The demultiplexing run configuration, wired up by the command layer.
pub struct DemuxPipeline {
    /// the validated sample group for this run
    pub samples: SampleGroup,
    /// the directory receiving per-sample and sentinel FASTQs plus the metrics file
    pub output_dir: PathBuf,
    /// file name prefix for reads matching no sample (or too many)
    pub unmatched_prefix: String,
    /// file name prefix for reads failing structural validation
    pub invalid_prefix: String,
    /// number of router worker threads
    pub demux_threads: usize,
    /// capacity of the shared read queue
    pub queue_capacity: usize,
}

impl DemuxPipeline {
    /// Runs the pipeline over one (single-end) or two (paired-end) opened FASTQ
    /// streams and returns the merged outcome counters.
    ///
    /// # Errors
    /// Fails on unreadable input, desynchronized mate streams, or any output write
    /// failure.  The router is always drained and the output streams flushed before
    /// the error is reported.
    ///
    /// # Panics
    /// Panics if not given exactly one or two readers.
    pub fn run(&self, mut fq_readers: Vec<Box<dyn BufRead + Send>>) -> Result<DemuxCounters> {
        assert!(
            fq_readers.len() == 1 || fq_readers.len() == 2,
            "Demultiplexing takes one FASTQ stream, or two for paired-end runs"
        );
        let paired = fq_readers.len() == 2;

        let classifier = ReadClassifier::new(SampleMatcher::new(&self.samples, true));
        let targets = self.open_targets(paired)?;
        let router = OutputRouter::new(targets, &classifier, self.demux_threads, self.queue_capacity);

        let progress = ProgLogBuilder::new()
            .name("gbsmux")
            .noun("records")
            .verb("routed")
            .unit(1_000_000)
            .count_formatter(CountFormatterKind::Comma)
            .level(log::Level::Info)
            .build();

        let fed = if paired {
            let reader2 = fq_readers.pop().expect("two readers are present");
            let reader1 = fq_readers.pop().expect("two readers are present");
            Self::feed_paired(reader1, reader2, &router, &progress)
        } else {
            let reader = fq_readers.pop().expect("one reader is present");
            Self::feed_single(reader, &router, &progress)
        };
        if fed.is_err() {
            // Abort the pool, but still honor the drain barrier so the outputs are
            // flushed before the failure is reported.
            router.request_stop();
        }
        // A worker write failure is the root cause when it also broke the feeder's
        // queue, so report the drain error first.
        let counters = match (fed, router.finish()) {
            (_, Err(e)) => return Err(e),
            (Err(e), Ok(_)) => return Err(e),
            (Ok(()), Ok(counters)) => counters,
        };

        write_demux_metrics(&self.output_dir.join(METRICS_FILE_NAME), &self.samples, &counters)?;
        Self::log_summary(&counters);
        Ok(counters)
    }

    /// Opens the per-sample and sentinel output targets, in sample-ordinal order
    /// followed by the unmatched and invalid sentinels as the router requires.
    fn open_targets(&self, paired: bool) -> Result<Vec<OutputTarget>> {
        let io = Io::new(5, BUFFER_SIZE);
        let mut names: Vec<String> =
            self.samples.samples.iter().map(|s| s.name.clone()).collect();
        names.push(self.unmatched_prefix.clone());
        names.push(self.invalid_prefix.clone());

        names
            .into_iter()
            .map(|name| {
                let target = if paired {
                    let r1 = self.open_writer(&io, &format!("{name}.R1.fq.gz"))?;
                    let r2 = self.open_writer(&io, &format!("{name}.R2.fq.gz"))?;
                    OutputTarget::new(name, r1, Some(r2))
                } else {
                    let r1 = self.open_writer(&io, &format!("{name}.fq.gz"))?;
                    OutputTarget::new(name, r1, None)
                };
                Ok(target)
            })
            .collect()
    }

    fn open_writer(&self, io: &Io, file_name: &str) -> Result<FastqWriter> {
        let path = self.output_dir.join(file_name);
        io.new_writer(&path).with_context(|| format!("Failed to open output file {path:?}"))
    }

    fn feed_single(
        reader: Box<dyn BufRead + Send>,
        router: &OutputRouter,
        progress: &proglog::ProgLog,
    ) -> Result<()> {
        let mut fq_reader = FastqReader::with_capacity(reader, BUFFER_SIZE);
        while let Some(rec) = fq_reader.next() {
            let rec = rec.map_err(|e| anyhow!("Failed reading FASTQ input: {e}"))?;
            router.route(ReadUnit { r1: rec.to_owned_record(), r2: None })?;
            progress.record();
        }
        Ok(())
    }

    fn feed_paired(
        reader1: Box<dyn BufRead + Send>,
        reader2: Box<dyn BufRead + Send>,
        router: &OutputRouter,
        progress: &proglog::ProgLog,
    ) -> Result<()> {
        let mut fq1 = FastqReader::with_capacity(reader1, BUFFER_SIZE);
        let mut fq2 = FastqReader::with_capacity(reader2, BUFFER_SIZE);
        loop {
            match (fq1.next(), fq2.next()) {
                (None, None) => break,
                (Some(r1), Some(r2)) => {
                    let r1 = r1.map_err(|e| anyhow!("Failed reading mate-1 input: {e}"))?;
                    let r2 = r2.map_err(|e| anyhow!("Failed reading mate-2 input: {e}"))?;
                    let unit =
                        ReadUnit { r1: r1.to_owned_record(), r2: Some(r2.to_owned_record()) };
                    ensure!(
                        unit.mates_agree(),
                        "FASTQ inputs desynchronized: mate headers '{}' and '{}' do not agree",
                        String::from_utf8_lossy(&unit.r1.head),
                        String::from_utf8_lossy(&unit.r2.as_ref().expect("mate present").head),
                    );
                    router.route(unit)?;
                    progress.record();
                }
                (Some(_), None) => {
                    bail!("FASTQ inputs desynchronized: the mate-2 input ran out of records early")
                }
                (None, Some(_)) => {
                    bail!("FASTQ inputs desynchronized: the mate-1 input ran out of records early")
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn log_summary(counters: &DemuxCounters) {
        let total = counters.total();
        let pct = |count: u64| -> f64 {
            if total == 0 { 0.0 } else { count as f64 * 100.0 / total as f64 }
        };
        info!("Demultiplexing summary:");
        info!("  Total records: {total}");
        info!("  Matched: {} ({:.2}%)", counters.matched(), pct(counters.matched()));
        info!("  No barcode: {} ({:.2}%)", counters.no_barcode, pct(counters.no_barcode));
        info!("  Ambiguous: {} ({:.2}%)", counters.ambiguous, pct(counters.ambiguous));
        info!("  Invalid: {} ({:.2}%)", counters.invalid, pct(counters.invalid));
    }
}
