//! Sanity limits for values read from disk or supplied by callers
//!
//! On-disk headers are untrusted: entry counts and sizes are checked before
//! they drive allocations or offset arithmetic.

use crate::error::{Error, Result};

/// Largest logical sector size accepted
pub const MAX_SECTOR_SIZE: u64 = 65536;

/// Smallest logical sector size accepted
pub const MIN_SECTOR_SIZE: u64 = 512;

/// Largest buffer allocated for an on-disk structure (e.g. a GPT entry array)
pub const MAX_ALLOCATION_SIZE: usize = 16 * 1024 * 1024;

/// Validate that an on-disk structure size is within allocation limits
pub fn validate_allocation_size(size: u64, limit: usize, what: &str) -> Result<usize> {
    if size > limit as u64 {
        return Err(Error::invalid_label(format!(
            "{} size {} exceeds limit {}",
            what, size, limit
        )));
    }
    u64_to_usize(size, what)
}

/// Multiply with overflow checking
pub fn checked_multiply_u64(a: u64, b: u64, what: &str) -> Result<u64> {
    a.checked_mul(b)
        .ok_or_else(|| Error::out_of_range(format!("{}: multiplication overflow", what)))
}

/// Convert to usize, failing on 32-bit truncation
pub fn u64_to_usize(value: u64, what: &str) -> Result<usize> {
    value.try_into().map_err(|_| {
        Error::out_of_range(format!("{}: value {} exceeds platform usize limit", what, value))
    })
}

/// Validate a logical or physical sector size
pub fn validate_sector_size(sector_size: u64) -> Result<()> {
    if !(MIN_SECTOR_SIZE..=MAX_SECTOR_SIZE).contains(&sector_size) {
        return Err(Error::invalid_argument(format!(
            "invalid sector size {} (must be {}-{})",
            sector_size, MIN_SECTOR_SIZE, MAX_SECTOR_SIZE
        )));
    }
    if !sector_size.is_power_of_two() {
        return Err(Error::invalid_argument(format!(
            "sector size {} is not a power of 2",
            sector_size
        )));
    }
    Ok(())
}

/// Validate a partition number against the label maximum
pub fn validate_partno(partno: usize, max: usize) -> Result<()> {
    if partno >= max {
        return Err(Error::out_of_range(format!(
            "partition number {} out of range (1-{})",
            partno + 1,
            max
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_allocation_size() {
        assert_eq!(validate_allocation_size(16384, MAX_ALLOCATION_SIZE, "entries").unwrap(), 16384);
        assert!(validate_allocation_size(
            MAX_ALLOCATION_SIZE as u64 + 1,
            MAX_ALLOCATION_SIZE,
            "entries"
        )
        .is_err());
    }

    #[test]
    fn test_checked_multiply_u64() {
        assert_eq!(checked_multiply_u64(1000, 512, "offset").unwrap(), 512_000);
        assert!(checked_multiply_u64(u64::MAX, 2, "offset").is_err());
    }

    #[test]
    fn test_validate_sector_size() {
        assert!(validate_sector_size(512).is_ok());
        assert!(validate_sector_size(4096).is_ok());
        assert!(validate_sector_size(0).is_err());
        assert!(validate_sector_size(1000).is_err());
        assert!(validate_sector_size(131072).is_err());
    }

    #[test]
    fn test_validate_partno() {
        assert!(validate_partno(3, 4).is_ok());
        assert!(matches!(validate_partno(4, 4), Err(Error::OutOfRange(_))));
    }
}
