use crate::commands::command::Command;
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use fgoxide::io::Io;
use gbsmux_lib::enzymes::EnzymeGroup;
use gbsmux_lib::metrics::DemuxCounters;
use gbsmux_lib::output_router::DEFAULT_QUEUE_CAPACITY;
use gbsmux_lib::pipeline::DemuxPipeline;
use gbsmux_lib::samples::{DEFAULT_MAX_MISMATCHES, SampleGroup};
use log::info;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

/// Performs sample demultiplexing on FASTQs carrying inline barcodes.
///
/// Each read is expected to begin with a sample barcode immediately followed by the
/// remnant of the sample's restriction-enzyme cut site.  The barcode is compared
/// against every sample in the metadata TSV under that sample's mismatch budget;
/// samples whose barcodes are codewords of the built-in single-error-correcting code
/// additionally have single substitutions repaired.  The cut site must match exactly.
///
/// Reads matching exactly one sample are written to that sample's FASTQ with the
/// barcode and cut site stripped.  Reads matching no sample, or more than one, go to
/// the ``unmatched_prefix`` file; structurally broken reads go to the
/// ``invalid_prefix`` file, untrimmed, with a reason tag on the header.  Paired-end
/// runs take two FASTQs consumed in lockstep and write mate-1/mate-2 files per
/// target; only mate 1 carries (and is stripped of) the inline barcode.
///
/// Metadata about the samples should be given as a headered TSV file with columns
/// 1. sample - the name of the sample.
/// 2. barcode - the expected barcode sequence for that sample.
/// 3. enzyme - the name of the enzyme used for that sample.
/// 4. mismatches - optional per-sample mismatch budget.
///
/// Rows naming an enzyme absent from the enzyme table are skipped, so a shared
/// facility-wide sheet may carry samples from other runs.  The enzyme table is a
/// headered TSV with columns `name` and `cut_sites` (comma-separated).
///
/// Output files within one target are not guaranteed to preserve the input record
/// order when more than one thread is used.
///
/// ## Example Command Line
///
/// ```
/// gbsmux demux \
///     --inputs r1.fq.gz r2.fq.gz \
///     --sample-metadata samples.tsv \
///     --enzymes enzymes.tsv \
///     --output output_folder
/// ```
#[derive(Parser, Debug)]
pub(crate) struct Demux {
    /// One or two input FASTQ files: mate 1, plus mate 2 for paired-end runs.
    #[clap(long, short = 'i', required = true, num_args = 1..=2)]
    inputs: Vec<PathBuf>,

    /// A file containing the metadata about the samples.
    #[clap(long, short = 's', required = true)]
    sample_metadata: PathBuf,

    /// A file containing the enzymes and their cut sites.
    #[clap(long, short = 'e', required = true)]
    enzymes: PathBuf,

    /// The output directory into which to write per-sample FASTQs.
    #[clap(long, short = 'o', required = true)]
    output: PathBuf,

    /// Output prefix for FASTQ file(s) for reads that cannot be matched to a sample.
    #[clap(long, short = 'u', default_value = "unmatched")]
    unmatched_prefix: String,

    /// Output prefix for FASTQ file(s) for reads that fail structural validation.
    #[clap(long, default_value = "invalid")]
    invalid_prefix: String,

    /// Mismatch budget applied to samples whose table row does not carry one.
    #[clap(long, short = 'm', default_value_t = DEFAULT_MAX_MISMATCHES)]
    default_mismatches: usize,

    /// The number of demultiplexing threads to use; defaults to the available cores.
    #[clap(long, short = 't')]
    threads: Option<usize>,

    /// Optional append-only run log recording parameters, timestamps and failures.
    #[clap(long)]
    run_log: Option<PathBuf>,
}

impl Demux {
    /// Checks that inputs to demux are valid and returns open file handles for the inputs.
    /// Checks:
    ///     - That the output directory exists (creating it if needed) and is not read-only
    ///     - That the input files exist
    ///     - That the input files have read permissions.
    ///     - That the thread count, when given, is not zero.
    fn validate_inputs(&self) -> Result<Vec<Box<dyn BufRead + Send>>> {
        let mut constraint_errors = vec![];

        if !self.output.exists() {
            info!("Output directory {:#?} didn't exist, creating it.", self.output);
            fs::create_dir_all(&self.output)?;
        }

        if self.output.metadata()?.permissions().readonly() {
            constraint_errors
                .push(format!("Ouput directory {:#?} cannot be read-only", self.output));
        }

        for input in &self.inputs {
            if !input.exists() {
                constraint_errors.push(format!("Provided input file {:#?} doesn't exist", input));
            }
        }
        // Attempt to open the files for reading.
        let io = Io::default();
        let fq_readers_result = self
            .inputs
            .iter()
            .map(|p| io.new_reader(p))
            .collect::<Result<Vec<_>, fgoxide::FgError>>();
        if let Err(e) = &fq_readers_result {
            constraint_errors.push(format!("Error opening input files for reading: {}", e));
        }

        if self.threads == Some(0) {
            constraint_errors.push("Threads provided 0 was too low! Must be 1 or more.".to_owned());
        }

        if constraint_errors.is_empty() {
            Ok(fq_readers_result?)
        } else {
            let mut details = "Inputs failed validation!\n".to_owned();
            for error_reason in constraint_errors {
                details.push_str(&format!("    - {}\n", error_reason));
            }
            Err(anyhow!("The following errors with the input(s) were detected:\n{}", details))
        }
    }

    /// Loads the tables, builds the pipeline and runs it.
    fn demux(&self) -> Result<DemuxCounters> {
        let fq_readers = self.validate_inputs()?;
        let enzymes = EnzymeGroup::from_file(&self.enzymes)?;
        let samples =
            SampleGroup::from_file(&self.sample_metadata, &enzymes, self.default_mismatches)?;
        info!("Loaded {} samples and {} enzymes.", samples.samples.len(), enzymes.enzymes.len());

        let threads = match self.threads {
            Some(threads) => threads,
            None => thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
        };

        let pipeline = DemuxPipeline {
            samples,
            output_dir: self.output.clone(),
            unmatched_prefix: self.unmatched_prefix.clone(),
            invalid_prefix: self.invalid_prefix.clone(),
            demux_threads: threads,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        };
        pipeline.run(fq_readers)
    }

    /// Appends one line to the run log, when one was requested.
    fn append_run_log(&self, line: &str) -> Result<()> {
        let Some(path) = &self.run_log else {
            return Ok(());
        };
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("Failed to open run log {path:?}"))?;
        writeln!(file, "{line}").with_context(|| format!("Failed to write run log {path:?}"))?;
        Ok(())
    }

    fn epoch_seconds() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
    }
}

impl Command for Demux {
    /// Executes the demux command, bracketing the run with run-log entries.
    fn execute(&self) -> Result<()> {
        self.append_run_log(&format!(
            "demux started at epoch {}; inputs: {:?}; sample_metadata: {:?}; enzymes: {:?}; output: {:?}",
            Self::epoch_seconds(),
            self.inputs,
            self.sample_metadata,
            self.enzymes,
            self.output,
        ))?;
        match self.demux() {
            Ok(counters) => {
                self.append_run_log(&format!(
                    "demux finished at epoch {}; total: {}; matched: {}; unmatched: {}; ambiguous: {}; invalid: {}",
                    Self::epoch_seconds(),
                    counters.total(),
                    counters.matched(),
                    counters.no_barcode,
                    counters.ambiguous,
                    counters.invalid,
                ))?;
                Ok(())
            }
            Err(e) => {
                self.append_run_log(&format!(
                    "demux failed at epoch {}: {e:#}",
                    Self::epoch_seconds()
                ))?;
                Err(e)
            }
        }
    }
}
