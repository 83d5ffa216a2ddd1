use crate::classifier::MatchOutcome;
use crate::samples::SampleGroup;
use anyhow::Result;
use fgoxide::io::DelimFile;
use serde::Serialize;
use std::path::Path;

/// Tallies of classification outcomes.  Each router worker owns one and they are merged
/// after the drain barrier, so no locking is needed while counting.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DemuxCounters {
    /// written records per sample, indexed by sample ordinal
    pub per_sample: Vec<u64>,
    /// records with no surviving sample
    pub no_barcode: u64,
    /// records with more than one surviving sample
    pub ambiguous: u64,
    /// records that failed structural validation
    pub invalid: u64,
}

impl DemuxCounters {
    /// Creates zeroed counters for the given number of samples.
    #[must_use]
    pub fn new(num_samples: usize) -> Self {
        Self { per_sample: vec![0; num_samples], ..Self::default() }
    }

    /// Records one classified unit.
    pub fn record(&mut self, outcome: &MatchOutcome) {
        match outcome {
            MatchOutcome::Matched { sample, .. } => self.per_sample[*sample] += 1,
            MatchOutcome::NoBarcode => self.no_barcode += 1,
            MatchOutcome::Ambiguous { .. } => self.ambiguous += 1,
            MatchOutcome::Invalid { .. } => self.invalid += 1,
        }
    }

    /// Adds another set of counters into this one.
    ///
    /// # Panics
    /// Panics if the two counters do not cover the same number of samples.
    pub fn merge(&mut self, other: &DemuxCounters) {
        assert_eq!(
            self.per_sample.len(),
            other.per_sample.len(),
            "Cannot merge counters over different sample sets"
        );
        for (mine, theirs) in self.per_sample.iter_mut().zip(other.per_sample.iter()) {
            *mine += theirs;
        }
        self.no_barcode += other.no_barcode;
        self.ambiguous += other.ambiguous;
        self.invalid += other.invalid;
    }

    /// Total records matched to any sample.
    #[must_use]
    pub fn matched(&self) -> u64 {
        self.per_sample.iter().sum()
    }

    /// Total records classified.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.matched() + self.no_barcode + self.ambiguous + self.invalid
    }
}

/// One row of the demultiplexing metrics file.
#[derive(Debug, Clone, Serialize)]
pub struct DemuxMetric {
    /// the sample name, or a sentinel name for unrouted records
    pub sample: String,
    /// the sample barcode, or "-" for sentinel rows
    pub barcode: String,
    /// number of records written for this row
    pub records: u64,
    /// fraction of all classified records this row accounts for
    pub frac_of_total: f64,
}

impl DemuxMetric {
    fn new(sample: &str, barcode: &str, records: u64, total: u64) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let frac_of_total = if total == 0 { 0.0 } else { records as f64 / total as f64 };
        Self { sample: sample.to_owned(), barcode: barcode.to_owned(), records, frac_of_total }
    }
}

/// Builds the metric rows for a finished run: one row per sample in ordinal order,
/// then sentinel rows for unmatched, ambiguous and invalid records.
#[must_use]
pub fn demux_metrics(samples: &SampleGroup, counters: &DemuxCounters) -> Vec<DemuxMetric> {
    let total = counters.total();
    let mut rows: Vec<DemuxMetric> = samples
        .samples
        .iter()
        .zip(counters.per_sample.iter())
        .map(|(sample, &records)| DemuxMetric::new(&sample.name, &sample.barcode, records, total))
        .collect();
    rows.push(DemuxMetric::new("unmatched", "-", counters.no_barcode, total));
    rows.push(DemuxMetric::new("ambiguous", "-", counters.ambiguous, total));
    rows.push(DemuxMetric::new("invalid", "-", counters.invalid, total));
    rows
}

/// Writes the metrics file for a finished run.
///
/// # Errors
/// Fails if the file cannot be written.
pub fn write_demux_metrics<P: AsRef<Path>>(
    path: &P,
    samples: &SampleGroup,
    counters: &DemuxCounters,
) -> Result<()> {
    let writer = DelimFile::default();
    writer.write_tsv(path, demux_metrics(samples, counters))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::InvalidReason;
    use crate::enzymes::Enzyme;
    use crate::samples::Sample;
    use fgoxide::io::Io;
    use tempfile::TempDir;

    fn sample_group() -> SampleGroup {
        let enzyme = Enzyme::new("ApeKI".to_owned(), vec!["CAGC".to_owned()]);
        SampleGroup::from_samples(&[
            Sample::new(0, "sample_1".to_owned(), "GATTACA".to_owned(), enzyme.clone(), 1),
            Sample::new(1, "sample_2".to_owned(), "CATGGAT".to_owned(), enzyme, 1),
        ])
    }

    #[test]
    fn test_record_and_totals() {
        let mut counters = DemuxCounters::new(2);
        counters.record(&MatchOutcome::Matched { sample: 0, trim: 11 });
        counters.record(&MatchOutcome::Matched { sample: 1, trim: 11 });
        counters.record(&MatchOutcome::Matched { sample: 1, trim: 11 });
        counters.record(&MatchOutcome::NoBarcode);
        counters.record(&MatchOutcome::Ambiguous { candidates: vec![0, 1] });
        counters.record(&MatchOutcome::Invalid { reason: InvalidReason::ReadTooShort });

        assert_eq!(counters.per_sample, vec![1, 2]);
        assert_eq!(counters.matched(), 3);
        assert_eq!(counters.total(), 6);
    }

    #[test]
    fn test_merge_sums_fieldwise() {
        let mut left = DemuxCounters::new(2);
        left.record(&MatchOutcome::Matched { sample: 0, trim: 11 });
        left.record(&MatchOutcome::NoBarcode);
        let mut right = DemuxCounters::new(2);
        right.record(&MatchOutcome::Matched { sample: 0, trim: 11 });
        right.record(&MatchOutcome::Invalid { reason: InvalidReason::ReadTooShort });

        left.merge(&right);
        assert_eq!(left.per_sample, vec![2, 0]);
        assert_eq!(left.no_barcode, 1);
        assert_eq!(left.invalid, 1);
        assert_eq!(left.total(), 4);
    }

    #[test]
    #[should_panic(expected = "Cannot merge counters over different sample sets")]
    fn test_merge_rejects_mismatched_sample_counts() {
        let mut left = DemuxCounters::new(2);
        let right = DemuxCounters::new(3);
        left.merge(&right);
    }

    #[test]
    fn test_demux_metric_rows_cover_samples_and_sentinels() {
        let mut counters = DemuxCounters::new(2);
        counters.record(&MatchOutcome::Matched { sample: 0, trim: 11 });
        counters.record(&MatchOutcome::NoBarcode);

        let rows = demux_metrics(&sample_group(), &counters);
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].sample, "sample_1");
        assert_eq!(rows[0].barcode, "GATTACA");
        assert_eq!(rows[0].records, 1);
        assert!((rows[0].frac_of_total - 0.5).abs() < f64::EPSILON);
        assert_eq!(rows[2].sample, "unmatched");
        assert_eq!(rows[2].records, 1);
        assert_eq!(rows[3].sample, "ambiguous");
        assert_eq!(rows[4].sample, "invalid");
    }

    #[test]
    fn test_write_demux_metrics_round_trips_through_disk() {
        let tempdir = TempDir::new().unwrap();
        let path = tempdir.path().join("demux_metrics.tsv");
        let counters = DemuxCounters::new(2);
        write_demux_metrics(&path, &sample_group(), &counters).unwrap();

        let lines = Io::default().read_lines(&path).unwrap();
        assert_eq!(lines[0], "sample\tbarcode\trecords\tfrac_of_total");
        assert_eq!(lines.len(), 6);
    }
}
