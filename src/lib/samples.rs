use crate::enzymes::{Enzyme, EnzymeGroup};
use crate::is_valid_base;
use anyhow::Result;
use bstr::BString;
use fgoxide::io::DelimFile;
use itertools::Itertools;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_option_number_from_string;
use std::fmt::{self, Display};
use std::path::Path;

/// The mismatch budget applied to samples whose table row does not carry one.
pub const DEFAULT_MAX_MISMATCHES: usize = 1;

/// Struct for describing a single sample and metadata associated with that sample.
#[derive(Clone, Debug)]
pub struct Sample {
    /// name of the sample
    pub name: String,
    /// DNA barcode associated with the sample
    pub barcode: String,
    /// the enzyme whose cut-site remnant follows the barcode on reads from this sample
    pub enzyme: Enzyme,
    /// the maximum number of barcode mismatches tolerated for this sample
    pub max_mismatches: usize,
    /// index of the sample in the [`SampleGroup`] object, used for syncing indices across
    /// different structs
    ordinal: usize,
}

impl Display for Sample {
    /// Implements a nice format display for the [`Sample`] struct.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sample({:04}) - {{ name: {}\tbarcode: {}\tenzyme: {}\tmax_mismatches: {} }}",
            self.ordinal, self.name, self.barcode, self.enzyme.name, self.max_mismatches
        )
    }
}

impl Sample {
    /// Validates inputs to generate a [`Self`] struct and instantiates the struct if they are
    /// valid.
    /// # Panics
    ///   - Panics if sample name is empty string.
    ///   - Panics if barcode is empty string.
    ///   - Panics if barcode has bases other than A, C, G, or T.
    ///   - Panics if the mismatch budget is not smaller than the barcode length.
    #[must_use]
    pub fn new(
        ordinal: usize,
        name: String,
        barcode: String,
        enzyme: Enzyme,
        max_mismatches: usize,
    ) -> Self {
        assert!(!name.is_empty(), "Sample name cannot be empty");
        assert!(!barcode.is_empty(), "Sample barcode cannot be empty");
        assert!(
            barcode.as_bytes().iter().all(|&b| is_valid_base(b)),
            "All sample barcode bases must be one of A, C, G, or T"
        );
        assert!(
            max_mismatches < barcode.len(),
            "Sample mismatch budget must be smaller than the barcode length"
        );
        Self { name, barcode, enzyme, max_mismatches, ordinal }
    }

    /// The index of this sample within its [`SampleGroup`].
    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// The header line expected at the top of a sample metadata file.
    #[must_use]
    pub fn deserialize_header_line() -> String {
        "sample\tbarcode\tenzyme\tmismatches".to_owned()
    }
}

/// One row of the sample table on disk.  The `mismatches` column is optional.
#[derive(Deserialize, Debug)]
struct SampleRow {
    /// name of the sample
    sample: String,
    /// DNA barcode assigned to the sample
    barcode: String,
    /// name of the enzyme used for the sample
    enzyme: String,
    /// optional per-sample mismatch budget
    #[serde(default, deserialize_with = "deserialize_option_number_from_string")]
    mismatches: Option<usize>,
}

/// Struct for storing information about multiple samples and for defining functions associated
/// with groups of [`Sample`]s, rather than individual structs.
#[derive(Clone, Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct SampleGroup {
    /// A group of samples
    pub samples: Vec<Sample>,
}

impl Display for SampleGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SampleGroup {{")?;
        for sample in &self.samples {
            writeln!(f, "    {}", sample)?;
        }
        writeln!(f, "}}")
    }
}

impl SampleGroup {
    /// Validates a group of [`Sample`]s and instantiates a [`Self`] struct if they are
    /// valid. Will clone the [`Sample`] structs and renumber the `ordinal` field on those
    /// clones to match the order in which they are stored in this [`Self`].
    /// # Panics
    ///   - Will panic if no samples are provided.
    ///   - Will panic if two samples share a name or a barcode.
    ///   - Will panic if the barcodes are not all of one length.
    #[must_use]
    pub fn from_samples(samples: &[Sample]) -> Self {
        // Validate that we have at least one name
        assert!(!samples.is_empty(), "Must provide one or more sample");

        // Validate that all the sample names are unique
        assert!(
            samples.iter().map(|s| &s.name).all_unique(),
            "Each sample name must be unique, duplicate identified"
        );

        // Convert barcodes to BString
        let bstr_barcodes: Vec<BString> =
            samples.iter().map(|b| BString::from(b.barcode.as_bytes())).collect();

        // Validate that the barcodes are all unique
        assert!(
            bstr_barcodes.iter().all_unique(),
            "Each sample barcode must be unique, duplicate identified",
        );

        let first_barcode_length = bstr_barcodes[0].len();
        assert!(
            bstr_barcodes.iter().all(|b| b.len() == first_barcode_length),
            "All barcodes must have the same length",
        );

        Self {
            samples: samples
                .iter()
                .enumerate()
                .map(|(ordinal, sample)| {
                    Sample::new(
                        ordinal,
                        sample.name.clone(),
                        sample.barcode.clone(),
                        sample.enzyme.clone(),
                        sample.max_mismatches,
                    )
                })
                .collect(),
        }
    }

    /// Attempts to load a [`Self`] object from a tab-separated file with a header and the
    /// columns `sample`, `barcode` and `enzyme`, plus an optional `mismatches` column that
    /// falls back to `default_mismatches` when absent or empty.
    ///
    /// Rows naming an enzyme that is not present in `enzymes` are skipped, so a shared
    /// facility-wide sample sheet may carry samples from other runs.
    /// # Errors
    ///   - Will error if the file cannot be read or does not match the expected format.
    /// # Panics
    ///   - Will panic if the retained rows fail [`SampleGroup::from_samples`] validation,
    ///     including the case where every row was skipped.
    pub fn from_file<P: AsRef<Path>>(
        path: &P,
        enzymes: &EnzymeGroup,
        default_mismatches: usize,
    ) -> Result<SampleGroup, fgoxide::FgError> {
        let reader = DelimFile::default();
        let rows: Vec<SampleRow> = reader.read(path, b'\t', false)?;
        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(enzyme) = enzymes.lookup(&row.enzyme) else {
                log::debug!(
                    "Skipping sample {} with unknown enzyme {}",
                    row.sample,
                    row.enzyme
                );
                continue;
            };
            samples.push(Sample::new(
                samples.len(),
                row.sample,
                row.barcode,
                enzyme.clone(),
                row.mismatches.unwrap_or(default_mismatches),
            ));
        }
        Ok(Self::from_samples(&samples))
    }

    /// Returns the barcode length shared by every sample in the group.
    #[must_use]
    pub fn barcode_length(&self) -> usize {
        self.samples[0].barcode.len()
    }
}
