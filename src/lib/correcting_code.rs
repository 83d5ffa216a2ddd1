//! A single-error-correcting code for fixed-length sample barcodes.
//!
//! Barcodes of the supported length ([`CORRECTABLE_BARCODE_LENGTH`]) reserve the
//! 1-based positions 1, 2, 4 and 8 as parity bases; every other position is a
//! data base.  Each base carries a two-bit value (A=0, C=1, G=2, T=3) and each
//! parity base stores the sum, modulo 4, of the data bases it covers.  The
//! coverage sets are the classic Hamming sets: parity `k` covers the data
//! positions whose 1-based index has bit `k` set.
//!
//! When exactly one base of a codeword is substituted, the set of parity checks
//! that fail reads out, as a 4-bit index, the 1-based position of the erroneous
//! base, and the discrepancy of the failing checks gives the modulo-4 delta
//! needed to undo the substitution.  This guarantees exact repair for exactly
//! one substitution; see [`correct`] for the limits of that guarantee.

use thiserror::Error;

/// The fixed barcode length supported by the correcting code.
pub const CORRECTABLE_BARCODE_LENGTH: usize = 15;

/// The four parity checks: the 0-based position of the parity base paired with
/// the 0-based data positions it covers.
const PARITY_CHECKS: [(usize, &[usize]); 4] = [
    (0, &[2, 4, 6, 8, 10, 12, 14]),
    (1, &[2, 5, 6, 9, 10, 13, 14]),
    (3, &[4, 5, 6, 11, 12, 13, 14]),
    (7, &[8, 9, 10, 11, 12, 13, 14]),
];

/// Errors produced when a byte string cannot be interpreted as a codeword.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodeError {
    /// The barcode is not of the supported length.
    #[error("Unsupported barcode length {length} (the correcting code requires {expected})")]
    UnsupportedLength {
        /// The offending barcode length
        length: usize,
        /// The single supported length
        expected: usize,
    },

    /// The barcode contains a byte outside of A, C, G and T.
    #[error("Invalid base '{base}' at position {position}")]
    InvalidBase {
        /// The offending byte
        base: char,
        /// 1-based position of the offending byte
        position: usize,
    },
}

/// Maps a base byte to its two-bit value.  Returns `None` for any byte outside
/// of the uppercase A, C, G, T alphabet.
#[must_use]
pub fn base_to_code(base: u8) -> Option<u8> {
    match base {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' => Some(3),
        _ => None,
    }
}

/// Maps a two-bit value back to its base byte.
///
/// # Panics
/// Panics if `code` is not in `0..=3`.
#[must_use]
pub fn code_to_base(code: u8) -> u8 {
    assert!(code <= 3, "Base codes are two-bit values");
    [b'A', b'C', b'G', b'T'][code as usize]
}

/// Returns true if barcodes of the given length can be checked and repaired.
#[must_use]
pub fn supports_length(length: usize) -> bool {
    length == CORRECTABLE_BARCODE_LENGTH
}

/// Converts a barcode to its two-bit values, validating length and alphabet.
fn encode(barcode: &[u8]) -> Result<Vec<u8>, CodeError> {
    if !supports_length(barcode.len()) {
        return Err(CodeError::UnsupportedLength {
            length: barcode.len(),
            expected: CORRECTABLE_BARCODE_LENGTH,
        });
    }
    barcode
        .iter()
        .enumerate()
        .map(|(i, &b)| {
            base_to_code(b).ok_or(CodeError::InvalidBase { base: b as char, position: i + 1 })
        })
        .collect()
}

/// Recomputes the expected value of the parity check at `check`.
fn expected_parity(codes: &[u8], check: usize) -> u8 {
    let (_, covered) = PARITY_CHECKS[check];
    covered.iter().map(|&d| codes[d]).sum::<u8>() % 4
}

/// The per-check discrepancies, `(expected - observed) mod 4`, in check order.
fn syndrome(codes: &[u8]) -> [u8; 4] {
    let mut deltas = [0u8; 4];
    for (check, &(parity_pos, _)) in PARITY_CHECKS.iter().enumerate() {
        let expected = expected_parity(codes, check);
        deltas[check] = (expected + 4 - codes[parity_pos]) % 4;
    }
    deltas
}

/// Returns true if every recomputed parity equals the observed parity base.
/// Barcodes of an unsupported length or alphabet are never valid codewords.
#[must_use]
pub fn is_valid(barcode: &[u8]) -> bool {
    match encode(barcode) {
        Ok(codes) => syndrome(&codes).iter().all(|&d| d == 0),
        Err(_) => false,
    }
}

/// Repairs at most one substituted base, returning the repaired barcode.
///
/// A valid codeword is returned unchanged.  For a codeword with exactly one
/// substituted base the original codeword is recovered.  If two or more bases
/// were corrupted, the result is some codeword-shaped repair that is *not*
/// guaranteed to be the original; this is inherent to single-error-correcting
/// codes and callers must not assume safety beyond one substitution.
///
/// # Errors
/// Fails if the barcode is of an unsupported length or contains a byte outside
/// of A, C, G and T (no-calls cannot be repaired).
pub fn correct(barcode: &[u8]) -> Result<Vec<u8>, CodeError> {
    let codes = encode(barcode)?;
    let deltas = syndrome(&codes);
    if deltas.iter().all(|&d| d == 0) {
        return Ok(barcode.to_vec());
    }

    // The failing checks sum to the 1-based position of the bad base; the
    // discrepancy of the dominant (highest-order) failing check is the delta.
    let mut position = 0;
    let mut dominant = 0;
    for (check, &delta) in deltas.iter().enumerate() {
        if delta != 0 {
            position += PARITY_CHECKS[check].0 + 1;
            dominant = delta;
        }
    }
    let index = position - 1;

    let repaired_code = match PARITY_CHECKS.iter().position(|&(p, _)| p == index) {
        // The parity base itself was hit: restore it from the data bases.
        Some(check) => expected_parity(&codes, check),
        // A data base was hit: undo the observed delta.
        None => (codes[index] + 4 - dominant) % 4,
    };

    let mut repaired = barcode.to_vec();
    repaired[index] = code_to_base(repaired_code);
    Ok(repaired)
}
