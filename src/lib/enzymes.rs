use crate::is_valid_base;
use anyhow::Result;
use fgoxide::io::DelimFile;
use itertools::Itertools;
use serde::Deserialize;
use std::fmt::{self, Display};
use std::path::Path;

/// A restriction enzyme and the cut-site remnant(s) it leaves at the start of a
/// read body.  Immutable after construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Enzyme {
    /// name of the enzyme
    pub name: String,
    /// the recognized cut-site sequences, in registered order
    pub cut_sites: Vec<Vec<u8>>,
}

impl Display for Enzyme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sites =
            self.cut_sites.iter().map(|s| String::from_utf8_lossy(s).into_owned()).join(",");
        write!(f, "Enzyme {{ name: {}\tcut_sites: {} }}", self.name, sites)
    }
}

impl Enzyme {
    /// Validates inputs to generate a [`Self`] struct and instantiates the struct if they are
    /// valid.
    /// # Panics
    ///   - Panics if the enzyme name is the empty string.
    ///   - Panics if no cut site is provided, or any cut site is the empty string.
    ///   - Panics if a cut site has bases other than A, C, G, or T.
    #[must_use]
    pub fn new(name: String, cut_sites: Vec<String>) -> Self {
        assert!(!name.is_empty(), "Enzyme name cannot be empty");
        assert!(!cut_sites.is_empty(), "Enzyme must have at least one cut site");
        assert!(
            cut_sites.iter().all(|site| !site.is_empty()),
            "Enzyme cut site cannot be empty"
        );
        assert!(
            cut_sites.iter().all(|site| site.as_bytes().iter().all(|&b| is_valid_base(b))),
            "All cut site bases must be one of A, C, G, or T"
        );
        Self { name, cut_sites: cut_sites.into_iter().map(String::into_bytes).collect() }
    }

    /// The length of the shortest registered cut site.
    #[must_use]
    pub fn min_cut_site_length(&self) -> usize {
        self.cut_sites.iter().map(Vec::len).min().expect("Enzyme must have at least one cut site")
    }

    /// The length of the longest registered cut site.
    #[must_use]
    pub fn max_cut_site_length(&self) -> usize {
        self.cut_sites.iter().map(Vec::len).max().expect("Enzyme must have at least one cut site")
    }
}

/// One row of the enzyme table on disk.
#[derive(Deserialize, Debug)]
struct EnzymeRow {
    /// name of the enzyme
    name: String,
    /// comma-separated list of cut-site sequences
    cut_sites: String,
}

/// The set of enzymes known to a run, loaded once and read-only thereafter.
#[derive(Clone, Debug)]
pub struct EnzymeGroup {
    /// the enzymes, in file order
    pub enzymes: Vec<Enzyme>,
}

impl Display for EnzymeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "EnzymeGroup {{")?;
        for enzyme in &self.enzymes {
            writeln!(f, "    {}", enzyme)?;
        }
        writeln!(f, "}}")
    }
}

impl EnzymeGroup {
    /// Validates a set of [`Enzyme`]s and instantiates a [`Self`] if they are valid.
    /// # Panics
    ///   - Panics if no enzymes are provided.
    ///   - Panics if two enzymes share a name (ignoring case).
    #[must_use]
    pub fn from_enzymes(enzymes: &[Enzyme]) -> Self {
        assert!(!enzymes.is_empty(), "Must provide one or more enzyme");
        assert!(
            enzymes.iter().map(|e| e.name.to_ascii_lowercase()).all_unique(),
            "Each enzyme name must be unique, duplicate identified"
        );
        Self { enzymes: enzymes.to_vec() }
    }

    /// Attempts to load a [`Self`] from a tab-separated file with a header and the
    /// columns `name` and `cut_sites`, the latter a comma-separated site list.
    /// # Errors
    ///   - Will error if the file cannot be read or does not match the expected format.
    /// # Panics
    ///   - Panics if the loaded rows fail [`EnzymeGroup::from_enzymes`] validation.
    pub fn from_file<P: AsRef<Path>>(path: &P) -> Result<Self, fgoxide::FgError> {
        let reader = DelimFile::default();
        let rows: Vec<EnzymeRow> = reader.read(path, b'\t', false)?;
        let enzymes: Vec<Enzyme> = rows
            .into_iter()
            .map(|row| {
                Enzyme::new(row.name, row.cut_sites.split(',').map(str::to_owned).collect())
            })
            .collect();
        Ok(Self::from_enzymes(&enzymes))
    }

    /// Looks an enzyme up by name, ignoring case.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&Enzyme> {
        self.enzymes.iter().find(|e| e.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fgoxide::io::Io;
    use tempfile::TempDir;

    // ############################################################################################
    // Test [`EnzymeGroup::from_file`] - Expected to pass
    // ############################################################################################
    #[test]
    fn test_reading_from_tsv_file() {
        let lines = vec!["name\tcut_sites", "ApeKI\tCAGC,CTGC", "EcoT22I\tTGCAT"];
        let tempdir = TempDir::new().unwrap();
        let f1 = tempdir.path().join("enzymes.tsv");

        let io = Io::default();
        io.write_lines(&f1, &lines).unwrap();
        let enzymes = EnzymeGroup::from_file(&f1).unwrap();

        assert_eq!(enzymes.enzymes.len(), 2);
        assert_eq!(enzymes.enzymes[0].name, "ApeKI");
        assert_eq!(enzymes.enzymes[0].cut_sites, vec![b"CAGC".to_vec(), b"CTGC".to_vec()]);
        assert_eq!(enzymes.enzymes[1].cut_sites, vec![b"TGCAT".to_vec()]);
    }

    // ############################################################################################
    // Test [`Enzyme::new`] and site length accessors
    // ############################################################################################
    #[test]
    fn test_new_enzyme_success() {
        let enzyme = Enzyme::new("ApeKI".to_owned(), vec!["CAGC".to_owned(), "CTGC".to_owned()]);
        assert_eq!(format!("{}", enzyme), "Enzyme { name: ApeKI\tcut_sites: CAGC,CTGC }");
        assert_eq!(enzyme.min_cut_site_length(), 4);
        assert_eq!(enzyme.max_cut_site_length(), 4);
    }

    #[test]
    fn test_cut_site_length_bounds_with_uneven_sites() {
        let enzyme = Enzyme::new("NsiI".to_owned(), vec!["TGCAT".to_owned(), "CCG".to_owned()]);
        assert_eq!(enzyme.min_cut_site_length(), 3);
        assert_eq!(enzyme.max_cut_site_length(), 5);
    }

    #[test]
    #[should_panic(expected = "Enzyme name cannot be empty")]
    fn test_new_enzyme_fail_empty_name() {
        let _enzyme = Enzyme::new(String::new(), vec!["CAGC".to_owned()]);
    }

    #[test]
    #[should_panic(expected = "Enzyme must have at least one cut site")]
    fn test_new_enzyme_fail_no_cut_sites() {
        let _enzyme = Enzyme::new("ApeKI".to_owned(), vec![]);
    }

    #[test]
    #[should_panic(expected = "Enzyme cut site cannot be empty")]
    fn test_new_enzyme_fail_empty_cut_site() {
        let _enzyme = Enzyme::new("ApeKI".to_owned(), vec!["CAGC".to_owned(), String::new()]);
    }

    #[test]
    #[should_panic(expected = "All cut site bases must be one of A, C, G, or T")]
    fn test_new_enzyme_fail_non_acgt_site() {
        let _enzyme = Enzyme::new("ApeKI".to_owned(), vec!["CWGC".to_owned()]);
    }

    // ############################################################################################
    // Test [`EnzymeGroup::from_enzymes`] and lookup
    // ############################################################################################
    #[test]
    #[should_panic(expected = "Must provide one or more enzyme")]
    fn test_from_enzymes_fail_no_enzymes() {
        let _group = EnzymeGroup::from_enzymes(&[]);
    }

    #[test]
    #[should_panic(expected = "Each enzyme name must be unique, duplicate identified")]
    fn test_from_enzymes_fail_duplicate_names_ignoring_case() {
        let enzymes = vec![
            Enzyme::new("ApeKI".to_owned(), vec!["CAGC".to_owned()]),
            Enzyme::new("apeki".to_owned(), vec!["CTGC".to_owned()]),
        ];
        let _group = EnzymeGroup::from_enzymes(&enzymes);
    }

    #[test]
    fn test_lookup_ignores_case_and_misses_cleanly() {
        let group = EnzymeGroup::from_enzymes(&[Enzyme::new(
            "ApeKI".to_owned(),
            vec!["CAGC".to_owned()],
        )]);
        assert_eq!(group.lookup("apeki").map(|e| e.name.as_str()), Some("ApeKI"));
        assert!(group.lookup("EcoT22I").is_none());
    }
}
