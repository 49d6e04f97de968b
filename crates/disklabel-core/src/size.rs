//! Size formatting and parsing

use crate::error::{Error, Result};

const LETTERS: &[u8] = b"BKMGTPE";

/// Binary exponent (multiple of 10) of the largest unit not exceeding `n`
fn get_exp(n: u64) -> u32 {
    let mut shift = 10;
    while shift <= 60 {
        if n < (1u64 << shift) {
            break;
        }
        shift += 10;
    }
    shift - 10
}

/// Format size in human-readable form with a one-letter suffix
///
/// One decimal digit is kept when it is not zero: `512B`, `1K`, `48.8M`.
pub fn size_to_human_string(bytes: u64) -> String {
    let exp = get_exp(bytes);
    let letter = LETTERS[(exp / 10) as usize] as char;
    if exp == 0 {
        return format!("{}{}", bytes, letter);
    }

    let mut dec = bytes >> exp;
    let mut frac = bytes & ((1u64 << exp) - 1);
    if frac != 0 {
        frac = ((frac >> (exp - 10)) + 50) / 100;
        if frac == 10 {
            dec += 1;
            frac = 0;
        }
    }
    if frac != 0 {
        format!("{}.{}{}", dec, frac, letter)
    } else {
        format!("{}{}", dec, letter)
    }
}

/// Parse a size with an optional unit suffix
///
/// Accepts `K`, `M`, `G`, `T`, `P`, `E` (powers of 1024), the same with
/// `iB` appended, or with `B` appended for powers of 1000. A single decimal
/// fraction is allowed. Returns the value and whether a suffix was present;
/// without a suffix the value is returned as written.
pub fn parse_size(text: &str) -> Result<(u64, bool)> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(text.len());
    let (number, suffix) = text.split_at(split);
    if number.is_empty() {
        return Err(Error::invalid_argument(format!("'{}' is not a number", text)));
    }

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    let int: u64 = int_part
        .parse()
        .map_err(|_| Error::invalid_argument(format!("'{}' is not a number", text)))?;

    let suffix = suffix.trim();
    if suffix.is_empty() {
        if !frac_part.is_empty() {
            return Err(Error::invalid_argument(format!(
                "'{}': fractions need a unit suffix",
                text
            )));
        }
        return Ok((int, false));
    }

    let mut chars = suffix.chars();
    let unit = chars.next().map(|c| c.to_ascii_uppercase()).unwrap_or('B');
    let rest: String = chars.collect();
    let base: u64 = match rest.as_str() {
        "" | "iB" | "IB" | "ib" => 1024,
        "B" | "b" => 1000,
        _ => {
            return Err(Error::invalid_argument(format!(
                "'{}': unknown unit suffix",
                text
            )))
        }
    };
    let power = match LETTERS.iter().position(|&l| l as char == unit) {
        Some(p) if p > 0 => p as u32,
        _ => {
            return Err(Error::invalid_argument(format!(
                "'{}': unknown unit suffix",
                text
            )))
        }
    };

    let mult = base
        .checked_pow(power)
        .ok_or_else(|| Error::out_of_range(format!("'{}' is too large", text)))?;
    let mut bytes = int
        .checked_mul(mult)
        .ok_or_else(|| Error::out_of_range(format!("'{}' is too large", text)))?;

    if !frac_part.is_empty() {
        let digits = frac_part.len().min(9) as u32;
        let frac: u64 = frac_part[..digits as usize]
            .parse()
            .map_err(|_| Error::invalid_argument(format!("'{}' is not a number", text)))?;
        bytes += frac.saturating_mul(mult) / 10u64.pow(digits);
    }
    Ok((bytes, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_to_human_string() {
        assert_eq!(size_to_human_string(512), "512B");
        assert_eq!(size_to_human_string(1024), "1K");
        assert_eq!(size_to_human_string(1024 * 1024), "1M");
        assert_eq!(size_to_human_string(1536 * 1024), "1.5M");
        assert_eq!(size_to_human_string(100_000 * 512), "48.8M");
        assert_eq!(size_to_human_string(512 * 1024 * 1024), "512M");
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("2048").unwrap(), (2048, false));
        assert_eq!(parse_size("1M").unwrap(), (1024 * 1024, true));
        assert_eq!(parse_size("1MiB").unwrap(), (1024 * 1024, true));
        assert_eq!(parse_size("1MB").unwrap(), (1_000_000, true));
        assert_eq!(parse_size("1.5K").unwrap(), (1536, true));
        assert_eq!(parse_size("10g").unwrap(), (10 * 1024 * 1024 * 1024, true));
        assert!(parse_size("abc").is_err());
        assert!(parse_size("5X").is_err());
        assert!(parse_size("1.5").is_err());
    }
}
