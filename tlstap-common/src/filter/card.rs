//! Payment card number detection.

use crate::{MAX_CARD_LEN, MAX_SCAN_BYTES, MIN_CARD_LEN};

/// Luhn checksum over ASCII digits. Any non-digit fails the check.
pub fn luhn_check(digits: &[u8]) -> bool {
    if digits.is_empty() {
        return false;
    }
    let mut sum = 0u32;
    let mut double = false;
    let mut i = digits.len();
    while i > 0 {
        i -= 1;
        let c = digits[i];
        if !c.is_ascii_digit() {
            return false;
        }
        let mut d = (c - b'0') as u32;
        if double {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
        double = !double;
    }
    sum % 10 == 0
}

/// True when `data` holds a maximal run of 13 to 19 ASCII digits that passes
/// the Luhn check. Runs longer than 19 digits never match, not even on a
/// sub-run.
pub fn detect_card_number(data: &[u8]) -> bool {
    let end = data.len().min(MAX_SCAN_BYTES);
    let mut run = [0u8; MAX_CARD_LEN];
    let mut run_len = 0usize;
    let mut i = 0usize;
    while i < end {
        let c = data[i];
        if c.is_ascii_digit() {
            if run_len < MAX_CARD_LEN {
                run[run_len] = c;
            }
            run_len += 1;
        } else {
            if is_candidate(&run, run_len) {
                return true;
            }
            run_len = 0;
        }
        i += 1;
    }
    is_candidate(&run, run_len)
}

#[inline(always)]
fn is_candidate(run: &[u8; MAX_CARD_LEN], run_len: usize) -> bool {
    (MIN_CARD_LEN..=MAX_CARD_LEN).contains(&run_len) && luhn_check(&run[..run_len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luhn_known_values() {
        assert!(luhn_check(b"4532015112830366"));
        assert!(luhn_check(b"4111111111111111"));
        assert!(luhn_check(b"79927398713"));
        assert!(!luhn_check(b"4532015112830367"));
        assert!(!luhn_check(b"4532a15112830366"));
        assert!(!luhn_check(b""));
    }

    #[test]
    fn test_detects_embedded_card() {
        assert!(detect_card_number(b"number=4532015112830366&exp=12"));
        assert!(detect_card_number(b"5555555555554444"));
        assert!(detect_card_number(b"pan: 4111111111111111"));
    }

    #[test]
    fn test_rejects_bad_checksum() {
        assert!(!detect_card_number(b"number=4532015112830367"));
    }

    #[test]
    fn test_rejects_short_runs() {
        // Luhn-valid but only 11 digits
        assert!(!detect_card_number(b"id=79927398713;"));
        assert!(!detect_card_number(b"1234567890"));
    }

    #[test]
    fn test_rejects_runs_longer_than_nineteen() {
        // Valid 16-digit card followed by more digits in the same run
        assert!(!detect_card_number(b"45320151128303660000"));
        assert!(!detect_card_number(b"x4111111111111111111111111y"));
    }

    #[test]
    fn test_separators_split_runs() {
        assert!(!detect_card_number(b"4532-0151-1283-0366"));
        assert!(detect_card_number(b"99999999999999999999999 4532015112830366"));
    }
}
