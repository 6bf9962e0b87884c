//! Identity-key helpers for user creation plausibility checks.

use once_cell::sync::Lazy;
use regex::Regex;

/// Official DNI/NIE control-letter table, indexed by number mod 23.
const DNI_LETTERS: &[u8; 23] = b"TRWAGMYFPDXBNJZSQVHLCKE";

/// Checksum-valid Spanish DNI (8 digits + letter) or NIE (X/Y/Z + 7 digits +
/// letter). Expects a normalized (uppercase alphanumeric) identifier.
pub fn is_valid_dni_nie(id: &str) -> bool {
    let bytes = id.as_bytes();
    if bytes.len() != 9 {
        return false;
    }
    let control = bytes[8];
    if !control.is_ascii_uppercase() {
        return false;
    }

    let digits: &[u8] = match bytes[0] {
        b'X' | b'Y' | b'Z' => &bytes[1..8],
        _ => &bytes[0..8],
    };
    if !digits.iter().all(|b| b.is_ascii_digit()) {
        return false;
    }

    let mut number: u64 = match bytes[0] {
        b'X' => 0,
        b'Y' => 1,
        b'Z' => 2,
        _ => 0,
    };
    for b in digits {
        number = number * 10 + u64::from(b - b'0');
    }

    DNI_LETTERS[(number % 23) as usize] == control
}

/// NSS of plausible length: digits only, 8 to 12 of them after normalization.
pub fn is_plausible_nss(id: &str) -> bool {
    (8..=12).contains(&id.len()) && id.bytes().all(|b| b.is_ascii_digit())
}

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("invalid email regex"));

/// Syntactic email check only; deliverability is not this crate's concern.
pub fn is_plausible_email(raw: &str) -> bool {
    EMAIL_RE.is_match(raw.trim())
}

/// At least one alphabetic character somewhere in the string.
pub fn has_letters(raw: &str) -> bool {
    raw.chars().any(|c| c.is_alphabetic())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_checksum_valid_dni() {
        assert!(is_valid_dni_nie("12345678Z"));
        assert!(is_valid_dni_nie("00000010X"));
    }

    #[test]
    fn rejects_wrong_control_letter() {
        assert!(!is_valid_dni_nie("12345678A"));
        assert!(!is_valid_dni_nie("12345678"));
        assert!(!is_valid_dni_nie("1234567Z8"));
    }

    #[test]
    fn accepts_checksum_valid_nie() {
        // X1234567L: 01234567 % 23 = 19 -> 'L'.
        assert!(is_valid_dni_nie("X1234567L"));
        assert!(!is_valid_dni_nie("X1234567T"));
    }

    #[test]
    fn nss_length_window() {
        assert!(is_plausible_nss("281234567890"));
        assert!(is_plausible_nss("12345678"));
        assert!(!is_plausible_nss("1234567"));
        assert!(!is_plausible_nss("1234567890123"));
        assert!(!is_plausible_nss("12345678AB"));
    }

    #[test]
    fn email_shapes() {
        assert!(is_plausible_email("ana.garcia@example.com"));
        assert!(!is_plausible_email("ana.garcia@example"));
        assert!(!is_plausible_email("not an email"));
    }
}
