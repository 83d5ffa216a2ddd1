use crate::byte_is_nocall;
use crate::classifier::MatchOutcome;
use crate::correcting_code;
use crate::samples::SampleGroup;
use ahash::HashMap as AHashMap;
use ahash::HashMapExt;

const STARTING_CACHE_SIZE: usize = 1_000_000;

/// Matching data for one sample, precomputed from the sample table.
#[derive(Clone, Debug)]
struct SampleSpec {
    /// the expected barcode bases
    barcode: Vec<u8>,
    /// the maximum number of barcode mismatches tolerated for this sample
    max_mismatches: usize,
    /// true when the barcode is a valid codeword of the correcting code, in which case
    /// repair is used to refine inexact matches
    self_correcting: bool,
    /// the sample's enzyme cut sites, in registered order
    cut_sites: Vec<Vec<u8>>,
}

impl SampleSpec {
    /// Returns the trim length for the first registered cut site found immediately after
    /// the barcode.  The site must match exactly and the read must extend strictly past
    /// it, so a matched record always keeps a non-empty body.
    fn matching_cut_site(&self, prefix: &[u8], offset: usize, read_length: usize) -> Option<usize> {
        self.cut_sites.iter().find_map(|site| {
            let end = offset + site.len();
            if read_length > end && prefix.get(offset..end) == Some(site.as_slice()) {
                Some(end)
            } else {
                None
            }
        })
    }
}

/// The struct responsible for assigning reads to samples: it matches the leading bases
/// of a read against every sample's barcode under that sample's mismatch budget, refines
/// inexact matches through the correcting code where the sample supports it, and then
/// requires an exact enzyme cut site immediately after the barcode.
///
/// Absence of a match is a normal outcome value, never an error; more than one surviving
/// sample is reported as [`MatchOutcome::Ambiguous`] rather than picked arbitrarily.
#[derive(Clone, Debug)]
pub struct SampleMatcher {
    /// per-sample matching data, indexed by sample ordinal
    specs: Vec<SampleSpec>,
    /// the barcode length shared by all samples
    barcode_length: usize,
    /// the shortest cut site registered across all samples
    min_cut_site_length: usize,
    /// the longest cut site registered across all samples
    max_cut_site_length: usize,
    /// the largest per-sample mismatch budget, used to short-circuit no-call-heavy reads
    max_budget: usize,
    /// If true will attempt to use the cache when matching.
    use_cache: bool,
    /// Caching struct for storing results of previous matches
    cache: AHashMap<Vec<u8>, MatchOutcome>,
}

impl SampleMatcher {
    /// Instantiates a new [`SampleMatcher`] over a validated sample group.
    #[must_use]
    pub fn new(samples: &SampleGroup, use_cache: bool) -> Self {
        let barcode_length = samples.barcode_length();
        let specs: Vec<SampleSpec> = samples
            .samples
            .iter()
            .map(|sample| {
                let barcode = sample.barcode.as_bytes().to_vec();
                SampleSpec {
                    self_correcting: correcting_code::is_valid(&barcode),
                    barcode,
                    max_mismatches: sample.max_mismatches,
                    cut_sites: sample.enzyme.cut_sites.clone(),
                }
            })
            .collect();
        let min_cut_site_length = specs
            .iter()
            .flat_map(|s| s.cut_sites.iter().map(Vec::len))
            .min()
            .expect("Sample groups are never empty");
        let max_cut_site_length = specs
            .iter()
            .flat_map(|s| s.cut_sites.iter().map(Vec::len))
            .max()
            .expect("Sample groups are never empty");
        let max_budget =
            specs.iter().map(|s| s.max_mismatches).max().expect("Sample groups are never empty");
        Self {
            specs,
            barcode_length,
            min_cut_site_length,
            max_cut_site_length,
            max_budget,
            use_cache,
            cache: AHashMap::with_capacity(STARTING_CACHE_SIZE),
        }
    }

    /// The barcode length shared by all samples.
    #[must_use]
    pub fn barcode_length(&self) -> usize {
        self.barcode_length
    }

    /// The shortest cut site registered across all samples.
    #[must_use]
    pub fn min_cut_site_length(&self) -> usize {
        self.min_cut_site_length
    }

    /// Counts the number of bases that differ between two byte slices.
    fn count_mismatches(observed_bases: &[u8], expected_bases: &[u8]) -> usize {
        assert_eq!(
            observed_bases.len(),
            expected_bases.len(),
            "observed_bases: {}, expected_bases: {}",
            observed_bases.len(),
            expected_bases.len()
        );
        observed_bases.iter().zip(expected_bases.iter()).filter(|(o, e)| o != e).count()
    }

    /// Assigns the read to the samples matching the provided ``read_bases``.
    #[must_use]
    fn assign_internal(&self, read_bases: &[u8]) -> MatchOutcome {
        let window_end = read_bases.len().min(self.barcode_length + self.max_cut_site_length);
        let prefix = read_bases[..window_end].to_ascii_uppercase();
        let observed_barcode = &prefix[..self.barcode_length];

        // No-calls mismatch every barcode, so too many of them can never match.
        let num_no_calls = observed_barcode.iter().filter(|&&b| byte_is_nocall(b)).count();
        if num_no_calls > self.max_budget {
            return MatchOutcome::NoBarcode;
        }

        let mut matched: Vec<(usize, usize)> = Vec::new();
        for (index, spec) in self.specs.iter().enumerate() {
            let mismatches = Self::count_mismatches(observed_barcode, &spec.barcode);
            if mismatches > spec.max_mismatches {
                continue;
            }
            // Repair is a refinement of an already within-budget match; where the
            // sample's barcode is a codeword, the code is authoritative.
            if mismatches > 0 && spec.self_correcting {
                match correcting_code::correct(observed_barcode) {
                    Ok(repaired) if repaired == spec.barcode => {}
                    _ => continue,
                }
            }
            if let Some(trim) = spec.matching_cut_site(&prefix, self.barcode_length, read_bases.len())
            {
                matched.push((index, trim));
            }
        }

        match matched.as_slice() {
            [] => MatchOutcome::NoBarcode,
            [(sample, trim)] => MatchOutcome::Matched { sample: *sample, trim: *trim },
            _ => MatchOutcome::Ambiguous {
                candidates: matched.into_iter().map(|(index, _)| index).collect(),
            },
        }
    }

    /// Assigns the samples that match the provided ``read_bases``, using internal caching
    /// if configured to do so.  Reads long enough to cover the barcode plus the longest
    /// cut site are keyed by that prefix window; shorter reads bypass the cache since
    /// their outcome also depends on their length.
    pub fn assign(&mut self, read_bases: &[u8]) -> MatchOutcome {
        // do not try matching if there are not enough bases
        if read_bases.len() <= self.barcode_length {
            return MatchOutcome::NoBarcode;
        }
        let window = self.barcode_length + self.max_cut_site_length;
        if !self.use_cache || read_bases.len() <= window {
            return self.assign_internal(read_bases);
        }
        if let Some(cached_match) = self.cache.get(&read_bases[..window]) {
            return cached_match.clone();
        }
        let outcome = self.assign_internal(read_bases);
        self.cache.insert(read_bases[..window].to_vec(), outcome.clone());
        outcome
    }
}
