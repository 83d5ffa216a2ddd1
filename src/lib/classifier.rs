use crate::barcode_matching::SampleMatcher;
use crate::read_set::ReadUnit;
use std::fmt::Display;

/// The reason a record failed structural validation.
#[derive(Eq, Hash, PartialEq, Debug, Clone, Copy)]
pub enum InvalidReason {
    /// The read does not extend past the barcode plus the shortest cut site.
    ReadTooShort,
    /// The sequence and quality strings are of different lengths.
    SeqQualLengthMismatch,
}

impl InvalidReason {
    /// A short machine-readable code, used to tag records in the invalid output.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            InvalidReason::ReadTooShort => "read_too_short",
            InvalidReason::SeqQualLengthMismatch => "seq_qual_length_mismatch",
        }
    }
}

impl Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// The classification of one read unit.  Exactly one variant applies per unit; a unit is
/// never partially matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Exactly one sample survived barcode and cut-site matching; `trim` is the length of
    /// the barcode-plus-cut-site prefix to strip from mate 1.
    Matched {
        /// ordinal of the matched sample
        sample: usize,
        /// number of leading bases to strip from mate 1
        trim: usize,
    },
    /// No sample survived matching.
    NoBarcode,
    /// More than one sample survived matching; the read is never silently assigned.
    Ambiguous {
        /// ordinals of every surviving sample
        candidates: Vec<usize>,
    },
    /// The unit failed structural validation and never reached matching.
    Invalid {
        /// why validation failed
        reason: InvalidReason,
    },
}

impl MatchOutcome {
    /// The code used to tag records routed to a sentinel output, or `None` for matched
    /// records, which are written untagged.
    #[must_use]
    pub fn reason_code(&self) -> Option<&'static str> {
        match self {
            MatchOutcome::Matched { .. } => None,
            MatchOutcome::NoBarcode => Some("no_barcode"),
            MatchOutcome::Ambiguous { .. } => Some("ambiguous"),
            MatchOutcome::Invalid { reason } => Some(reason.code()),
        }
    }
}

/// Validates the structure of a read unit and, when it is well-formed, delegates sample
/// assignment to the [`SampleMatcher`].
#[derive(Clone, Debug)]
pub struct ReadClassifier {
    /// the matcher performing barcode and cut-site assignment
    matcher: SampleMatcher,
    /// a matched read must extend strictly past this many leading bases
    min_prefix_length: usize,
}

impl ReadClassifier {
    /// Builds a classifier around a matcher.  The structural minimum length is the
    /// barcode plus the shortest registered cut site; the matcher itself enforces the
    /// per-site length when deciding a match.
    #[must_use]
    pub fn new(matcher: SampleMatcher) -> Self {
        let min_prefix_length = matcher.barcode_length() + matcher.min_cut_site_length();
        Self { matcher, min_prefix_length }
    }

    /// Classifies one read unit.  Structural problems short-circuit to
    /// [`MatchOutcome::Invalid`]; everything else is decided by the matcher on the
    /// leading bases of mate 1.
    pub fn classify(&mut self, unit: &ReadUnit) -> MatchOutcome {
        if unit.r1.seq.len() != unit.r1.qual.len() {
            return MatchOutcome::Invalid { reason: InvalidReason::SeqQualLengthMismatch };
        }
        if let Some(r2) = &unit.r2 {
            if r2.seq.len() != r2.qual.len() {
                return MatchOutcome::Invalid { reason: InvalidReason::SeqQualLengthMismatch };
            }
        }
        if unit.r1.seq.len() <= self.min_prefix_length {
            return MatchOutcome::Invalid { reason: InvalidReason::ReadTooShort };
        }
        self.matcher.assign(&unit.r1.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enzymes::Enzyme;
    use crate::samples::{Sample, SampleGroup};
    use seq_io::fastq::OwnedRecord;

    fn classifier() -> ReadClassifier {
        let enzyme = Enzyme::new("ApeKI".to_owned(), vec!["CAGC".to_owned()]);
        let samples = vec![
            Sample::new(0, "sample_1".to_owned(), "GATTACA".to_owned(), enzyme.clone(), 1),
            Sample::new(1, "sample_2".to_owned(), "CATGGAT".to_owned(), enzyme, 1),
        ];
        ReadClassifier::new(SampleMatcher::new(&SampleGroup::from_samples(&samples), false))
    }

    fn record(head: &str, seq: &str, qual: &str) -> OwnedRecord {
        OwnedRecord {
            head: head.as_bytes().to_vec(),
            seq: seq.as_bytes().to_vec(),
            qual: qual.as_bytes().to_vec(),
        }
    }

    fn unit(seq: &str) -> ReadUnit {
        ReadUnit { r1: record("q1", seq, &"I".repeat(seq.len())), r2: None }
    }

    #[test]
    fn test_well_formed_match_flows_through_to_the_matcher() {
        let outcome = classifier().classify(&unit("GATTACACAGCTTTT"));
        assert_eq!(outcome, MatchOutcome::Matched { sample: 0, trim: 11 });
        assert_eq!(outcome.reason_code(), None);
    }

    #[test]
    fn test_no_barcode_flows_through_to_the_matcher() {
        let outcome = classifier().classify(&unit("TTTTTTTTTTTTTTT"));
        assert_eq!(outcome, MatchOutcome::NoBarcode);
        assert_eq!(outcome.reason_code(), Some("no_barcode"));
    }

    #[test]
    fn test_read_as_long_as_the_prefix_is_too_short() {
        // barcode (7) + cut site (4) = 11 bases: no body remains
        let outcome = classifier().classify(&unit("GATTACACAGC"));
        assert_eq!(outcome, MatchOutcome::Invalid { reason: InvalidReason::ReadTooShort });
        assert_eq!(outcome.reason_code(), Some("read_too_short"));
    }

    #[test]
    fn test_seq_qual_length_mismatch_is_invalid() {
        let unit = ReadUnit { r1: record("q1", "GATTACACAGCTTTT", "III"), r2: None };
        let outcome = classifier().classify(&unit);
        assert_eq!(outcome, MatchOutcome::Invalid { reason: InvalidReason::SeqQualLengthMismatch });
    }

    #[test]
    fn test_mate_seq_qual_length_mismatch_is_invalid() {
        let unit = ReadUnit {
            r1: record("q1/1", "GATTACACAGCTTTT", "IIIIIIIIIIIIIII"),
            r2: Some(record("q1/2", "ACGT", "II")),
        };
        let outcome = classifier().classify(&unit);
        assert_eq!(outcome, MatchOutcome::Invalid { reason: InvalidReason::SeqQualLengthMismatch });
    }

    #[test]
    fn test_structural_checks_run_before_matching() {
        // the prefix would match sample_1, but the length check fires first
        let unit = ReadUnit { r1: record("q1", "GATTACACAGC", "IIIIIIIIIII"), r2: None };
        let outcome = classifier().classify(&unit);
        assert_eq!(outcome, MatchOutcome::Invalid { reason: InvalidReason::ReadTooShort });
    }
}
