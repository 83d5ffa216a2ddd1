//! The concurrent read-to-file router.
//!
//! A fixed pool of worker threads drains one shared bounded queue of read units.
//! Each worker classifies the unit, renders it to FASTQ bytes, takes the exclusive
//! lock of the destination target and appends.  Per-target locks keep records whole
//! under parallel writers; records written by one worker keep their relative order
//! within a target, but no ordering is guaranteed across workers — output files do
//! not preserve input order.
//!
//! The drain barrier: [`OutputRouter::finish`] disconnects the queue, joins every
//! worker and only then flushes and closes the output streams, so no stream is ever
//! closed while a writer holds, or is waiting on, its lock.

use crate::classifier::{MatchOutcome, ReadClassifier};
use crate::metrics::DemuxCounters;
use crate::read_set::{ReadUnit, SerializedUnit};
use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// Type alias to prevent clippy complaining about type complexity
pub type FastqWriter = BufWriter<Box<dyn Write + Send>>;

/// Capacity of the shared queue feeding the worker pool.
pub const DEFAULT_QUEUE_CAPACITY: usize = 8 * 1024;

/// The writable stream(s) of one output target.  Paired-end targets own both mate
/// streams so that a single lock acquisition appends a whole unit and the mate files
/// stay record-aligned.
pub struct TargetWriters {
    /// the mate-1 (or only) stream
    pub r1: FastqWriter,
    /// the mate-2 stream, when running paired-end
    pub r2: Option<FastqWriter>,
}

impl TargetWriters {
    fn append(&mut self, unit: &SerializedUnit) -> std::io::Result<()> {
        self.r1.write_all(&unit.r1)?;
        if let (Some(writer), Some(bytes)) = (self.r2.as_mut(), unit.r2.as_ref()) {
            writer.write_all(bytes)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.r1.flush()?;
        if let Some(writer) = self.r2.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// One destination for classified records: a sample's output or a sentinel.  The
/// mutual-exclusion lock makes the target single-writer-at-a-time.
pub struct OutputTarget {
    name: String,
    writers: Mutex<TargetWriters>,
}

impl OutputTarget {
    /// Creates a target around opened output stream(s).
    #[must_use]
    pub fn new(name: String, r1: FastqWriter, r2: Option<FastqWriter>) -> Self {
        Self { name, writers: Mutex::new(TargetWriters { r1, r2 }) }
    }

    /// The target's display name, used in error reports.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The pool of writer workers behind the demultiplex pipeline.
///
/// Targets must be ordered sample 0..n, then the unmatched sentinel, then the
/// invalid sentinel; workers route [`MatchOutcome::Matched`] records by sample
/// ordinal and everything else to the sentinels.
pub struct OutputRouter {
    tx: Option<Sender<ReadUnit>>,
    handles: Vec<JoinHandle<Result<DemuxCounters>>>,
    targets: Arc<Vec<OutputTarget>>,
    stop: Arc<AtomicBool>,
}

impl OutputRouter {
    /// Spawns `workers` threads draining a bounded queue of `queue_capacity` units.
    /// Each worker owns a clone of the classifier (and with it its match cache).
    ///
    /// # Panics
    /// Panics if `workers` is zero or fewer than three targets are provided (at
    /// least one sample plus the two sentinels).
    #[must_use]
    pub fn new(
        targets: Vec<OutputTarget>,
        classifier: &ReadClassifier,
        workers: usize,
        queue_capacity: usize,
    ) -> Self {
        assert!(workers > 0, "Must have at least one router worker");
        assert!(
            targets.len() >= 3,
            "Must provide the sample targets plus the unmatched and invalid sentinels"
        );
        let targets = Arc::new(targets);
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = bounded::<ReadUnit>(queue_capacity);

        let handles = (0..workers)
            .map(|_| {
                let rx: Receiver<ReadUnit> = rx.clone();
                let targets = Arc::clone(&targets);
                let stop = Arc::clone(&stop);
                let mut classifier = classifier.clone();
                thread::spawn(move || {
                    let result = Self::worker_loop(&rx, &targets, &mut classifier, &stop);
                    if result.is_err() {
                        // A dead writer aborts the run: stop the pool so the feeding
                        // thread sees a disconnected queue instead of blocking.
                        stop.store(true, Ordering::Relaxed);
                    }
                    result
                })
            })
            .collect();

        Self { tx: Some(tx), handles, targets, stop }
    }

    /// Enqueues one unit for classification and writing, blocking while the queue
    /// is full.
    ///
    /// # Errors
    /// Fails if the pool has stopped (a worker failed or a stop was requested).
    pub fn route(&self, unit: ReadUnit) -> Result<()> {
        let tx = self.tx.as_ref().expect("route called after finish");
        tx.send(unit).map_err(|_| anyhow!("Output router stopped while records remained"))
    }

    /// Requests a cooperative stop: each worker finishes the record in hand, then
    /// exits without taking new work.  Queued-but-unprocessed records are dropped.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// The drain barrier.  Disconnects the queue, waits for every worker to exit,
    /// and only then flushes and closes every output stream, exactly once.
    ///
    /// # Errors
    /// Returns the first worker write error, or the flush error, if any.
    pub fn finish(mut self) -> Result<DemuxCounters> {
        drop(self.tx.take());

        let mut counters: Option<DemuxCounters> = None;
        let mut first_error: Option<anyhow::Error> = None;
        for handle in self.handles.drain(..) {
            match handle.join() {
                Ok(Ok(worker_counters)) => match counters.as_mut() {
                    Some(all) => all.merge(&worker_counters),
                    None => counters = Some(worker_counters),
                },
                Ok(Err(e)) => first_error = first_error.or(Some(e)),
                Err(_) => {
                    first_error = first_error.or_else(|| Some(anyhow!("A router worker panicked")));
                }
            }
        }

        // All workers have exited: no lock is held or waited on, so the streams can
        // be finalized.
        let targets = Arc::try_unwrap(self.targets)
            .map_err(|_| anyhow!("Output targets still shared after the drain barrier"))?;
        for target in targets {
            let mut writers = target.writers.into_inner();
            writers.flush().with_context(|| format!("Failed to flush output {}", target.name))?;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(counters.unwrap_or_default()),
        }
    }

    fn worker_loop(
        rx: &Receiver<ReadUnit>,
        targets: &Arc<Vec<OutputTarget>>,
        classifier: &mut ReadClassifier,
        stop: &AtomicBool,
    ) -> Result<DemuxCounters> {
        let unmatched_index = targets.len() - 2;
        let invalid_index = targets.len() - 1;
        let mut counters = DemuxCounters::new(unmatched_index);

        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let Ok(unit) = rx.recv() else {
                break;
            };
            let outcome = classifier.classify(&unit);
            let (target_index, rendered) = match &outcome {
                MatchOutcome::Matched { sample, trim } => (*sample, unit.serialize_trimmed(*trim)),
                MatchOutcome::NoBarcode | MatchOutcome::Ambiguous { .. } => {
                    let reason = outcome.reason_code().expect("sentinel outcomes carry a reason");
                    (unmatched_index, unit.serialize_tagged(reason))
                }
                MatchOutcome::Invalid { reason } => {
                    (invalid_index, unit.serialize_tagged(reason.code()))
                }
            };
            counters.record(&outcome);

            let target = &targets[target_index];
            target
                .writers
                .lock()
                .append(&rendered)
                .with_context(|| format!("Failed writing to output {}", target.name))?;
        }
        Ok(counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barcode_matching::SampleMatcher;
    use crate::enzymes::Enzyme;
    use crate::samples::{Sample, SampleGroup};
    use fgoxide::io::Io;
    use seq_io::fastq::OwnedRecord;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn classifier() -> ReadClassifier {
        let enzyme = Enzyme::new("ApeKI".to_owned(), vec!["CAGC".to_owned()]);
        let samples = vec![
            Sample::new(0, "sample_1".to_owned(), "GATTACA".to_owned(), enzyme.clone(), 0),
            Sample::new(1, "sample_2".to_owned(), "CATGGAT".to_owned(), enzyme, 0),
        ];
        ReadClassifier::new(SampleMatcher::new(&SampleGroup::from_samples(&samples), false))
    }

    fn file_target(dir: &Path, name: &str, paired: bool) -> (OutputTarget, PathBuf, Option<PathBuf>) {
        let io = Io::default();
        if paired {
            let p1 = dir.join(format!("{name}.R1.fq"));
            let p2 = dir.join(format!("{name}.R2.fq"));
            let target = OutputTarget::new(
                name.to_owned(),
                io.new_writer(&p1).unwrap(),
                Some(io.new_writer(&p2).unwrap()),
            );
            (target, p1, Some(p2))
        } else {
            let p1 = dir.join(format!("{name}.fq"));
            let target = OutputTarget::new(name.to_owned(), io.new_writer(&p1).unwrap(), None);
            (target, p1, None)
        }
    }

    fn unit(head: &str, seq: &str) -> ReadUnit {
        ReadUnit {
            r1: OwnedRecord {
                head: head.as_bytes().to_vec(),
                seq: seq.as_bytes().to_vec(),
                qual: vec![b'I'; seq.len()],
            },
            r2: None,
        }
    }

    /// Reads a FASTQ file back as a multiset of records (header line -> count is not
    /// enough; whole 4-line records are the unit of comparison).
    fn record_multiset(path: &Path) -> HashMap<Vec<String>, usize> {
        let lines = Io::default().read_lines(&path).unwrap();
        assert_eq!(lines.len() % 4, 0, "FASTQ files hold whole records");
        let mut counts = HashMap::new();
        for record in lines.chunks(4) {
            *counts.entry(record.to_vec()).or_insert(0) += 1;
        }
        counts
    }

    fn run_router(dir: &Path, label: &str, workers: usize, units: Vec<ReadUnit>) -> DemuxCounters {
        let (t0, _, _) = file_target(dir, &format!("{label}_sample_1"), false);
        let (t1, _, _) = file_target(dir, &format!("{label}_sample_2"), false);
        let (tu, _, _) = file_target(dir, &format!("{label}_unmatched"), false);
        let (ti, _, _) = file_target(dir, &format!("{label}_invalid"), false);
        let router =
            OutputRouter::new(vec![t0, t1, tu, ti], &classifier(), workers, DEFAULT_QUEUE_CAPACITY);
        for unit in units {
            router.route(unit).unwrap();
        }
        router.finish().unwrap()
    }

    // ############################################################################################
    // Test routing and rendering
    // ############################################################################################
    #[test]
    fn test_routes_each_outcome_to_its_target() {
        let tempdir = TempDir::new().unwrap();
        let dir = tempdir.path();
        let units = vec![
            unit("q1", "GATTACACAGCTTTT"), // matched sample_1, trimmed
            unit("q2", "CATGGATCAGCAAAA"), // matched sample_2, trimmed
            unit("q3", "TTTTTTTTTTTTTTT"), // no barcode
            unit("q4", "GATTACA"),         // too short -> invalid, untrimmed
        ];
        let counters = run_router(dir, "t", 2, units);
        assert_eq!(counters.per_sample, vec![1, 1]);
        assert_eq!(counters.no_barcode, 1);
        assert_eq!(counters.invalid, 1);

        let sample1 = record_multiset(&dir.join("t_sample_1.fq"));
        assert_eq!(sample1.len(), 1);
        assert!(sample1.contains_key(&vec![
            "@q1".to_owned(),
            "TTTT".to_owned(),
            "+".to_owned(),
            "IIII".to_owned()
        ]));

        let unmatched = record_multiset(&dir.join("t_unmatched.fq"));
        assert!(unmatched.contains_key(&vec![
            "@q3 gx:reason=no_barcode".to_owned(),
            "TTTTTTTTTTTTTTT".to_owned(),
            "+".to_owned(),
            "IIIIIIIIIIIIIII".to_owned()
        ]));

        let invalid = record_multiset(&dir.join("t_invalid.fq"));
        assert!(invalid.contains_key(&vec![
            "@q4 gx:reason=read_too_short".to_owned(),
            "GATTACA".to_owned(),
            "+".to_owned(),
            "IIIIIII".to_owned()
        ]));
    }

    #[test]
    fn test_paired_targets_keep_mate_files_record_aligned() {
        let tempdir = TempDir::new().unwrap();
        let dir = tempdir.path();
        let (t0, p1, p2) = file_target(dir, "sample_1", true);
        let (t1, _, _) = file_target(dir, "sample_2", true);
        let (tu, _, _) = file_target(dir, "unmatched", true);
        let (ti, _, _) = file_target(dir, "invalid", true);
        let router =
            OutputRouter::new(vec![t0, t1, tu, ti], &classifier(), 1, DEFAULT_QUEUE_CAPACITY);

        let mut paired = unit("q1/1", "GATTACACAGCTTTT");
        paired.r2 = Some(OwnedRecord {
            head: b"q1/2".to_vec(),
            seq: b"ACGTACGT".to_vec(),
            qual: vec![b'J'; 8],
        });
        router.route(paired).unwrap();
        let counters = router.finish().unwrap();
        assert_eq!(counters.matched(), 1);

        let r1_lines = Io::default().read_lines(&p1).unwrap();
        let r2_lines = Io::default().read_lines(&p2.unwrap()).unwrap();
        // mate 1 trimmed, mate 2 whole
        assert_eq!(r1_lines, vec!["@q1/1", "TTTT", "+", "IIII"]);
        assert_eq!(r2_lines, vec!["@q1/2", "ACGTACGT", "+", "JJJJJJJJ"]);
    }

    // ############################################################################################
    // Test ordering and determinism
    // ############################################################################################
    #[test]
    fn test_single_worker_preserves_enqueue_order() {
        let tempdir = TempDir::new().unwrap();
        let dir = tempdir.path();
        let units: Vec<ReadUnit> =
            (0..50).map(|i| unit(&format!("q{i}"), "GATTACACAGCTTTT")).collect();
        let _counters = run_router(dir, "o", 1, units);

        let lines = Io::default().read_lines(&dir.join("o_sample_1.fq")).unwrap();
        let heads: Vec<String> = lines.iter().step_by(4).cloned().collect();
        let expected: Vec<String> = (0..50).map(|i| format!("@q{i}")).collect();
        assert_eq!(heads, expected);
    }

    #[test]
    fn test_worker_count_does_not_change_the_output_multiset() {
        // Global order across workers is explicitly NOT guaranteed; the multiset of
        // records per file must still be identical run to run.
        let tempdir = TempDir::new().unwrap();
        let dir = tempdir.path();
        let units = |n: usize| -> Vec<ReadUnit> {
            (0..n)
                .map(|i| {
                    let seq = if i % 3 == 0 { "GATTACACAGCTTTT" } else { "CATGGATCAGCAAAA" };
                    unit(&format!("q{i}"), seq)
                })
                .collect()
        };
        let a = run_router(dir, "a", 1, units(200));
        let b = run_router(dir, "b", 4, units(200));
        assert_eq!(a, b);
        assert_eq!(
            record_multiset(&dir.join("a_sample_1.fq")),
            record_multiset(&dir.join("b_sample_1.fq"))
        );
        assert_eq!(
            record_multiset(&dir.join("a_sample_2.fq")),
            record_multiset(&dir.join("b_sample_2.fq"))
        );
    }

    // ############################################################################################
    // Test cooperative stop and the drain barrier
    // ############################################################################################
    #[test]
    fn test_stop_before_work_drops_queued_records_but_still_drains() {
        let tempdir = TempDir::new().unwrap();
        let dir = tempdir.path();
        let (t0, p0, _) = file_target(dir, "sample_1", false);
        let (t1, _, _) = file_target(dir, "sample_2", false);
        let (tu, _, _) = file_target(dir, "unmatched", false);
        let (ti, _, _) = file_target(dir, "invalid", false);
        let router =
            OutputRouter::new(vec![t0, t1, tu, ti], &classifier(), 2, DEFAULT_QUEUE_CAPACITY);

        router.request_stop();
        // Workers may exit before these sends land; both outcomes are fine as long
        // as finish still drains and flushes.
        for i in 0..10 {
            let _ = router.route(unit(&format!("q{i}"), "GATTACACAGCTTTT"));
        }
        let counters = router.finish().unwrap();
        let written: u64 = counters.total();
        assert!(written <= 10);

        let lines = Io::default().read_lines(&p0).unwrap();
        assert_eq!(lines.len() % 4, 0, "a flushed file holds only whole records");
    }
}
