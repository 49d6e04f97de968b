//! Partition boundary alignment
//!
//! An LBA is aligned when its byte offset sits on the alignment granularity
//! (the largest of grain, physical sector size and minimum I/O size), shifted
//! by the device alignment offset.

use crate::error::{Error, Result};
use crate::geometry::{Topology, DEFAULT_GRAIN};
use serde::Serialize;

/// Direction for [`Topology::align_lba`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlignDirection {
    Up,
    Down,
    Nearest,
}

impl Topology {
    /// Alignment granularity in bytes
    fn granularity(&self) -> u64 {
        self.grain
            .max(self.phy_sector_size)
            .max(self.min_io_size)
            .max(self.sector_size)
    }

    /// Granularity and the first aligned LBA, both in sectors
    fn aligned_origin(&self) -> (u64, u64) {
        let gran = self.granularity();
        let origin = (gran - self.alignment_offset % gran) % gran;
        ((gran / self.sector_size).max(1), origin / self.sector_size)
    }

    /// Smallest aligned LBA at or above `lba`
    fn aligned_up(&self, lba: u64) -> u64 {
        let (g, o) = self.aligned_origin();
        if lba <= o {
            return o;
        }
        o + (lba - o).div_ceil(g) * g
    }

    /// Largest aligned LBA at or below `lba`
    fn aligned_down(&self, lba: u64) -> Option<u64> {
        let (g, o) = self.aligned_origin();
        if lba < o {
            return None;
        }
        Some(o + ((lba - o) / g) * g)
    }

    /// Byte offset of `lba` modulo `gran` equals the aligned phase
    ///
    /// Computed in 128 bits; LBAs read from a damaged label can be huge.
    fn on_boundary(&self, lba: u64, gran: u64) -> bool {
        let offset = (lba as u128 * self.sector_size as u128) % gran as u128;
        offset == ((gran - self.alignment_offset % gran) % gran) as u128
    }

    /// True if `lba` sits on the alignment granularity
    pub fn lba_is_aligned(&self, lba: u64) -> bool {
        self.on_boundary(lba, self.granularity())
    }

    /// True if `lba` sits on a physical sector (or minimum I/O) boundary
    pub fn lba_is_phy_aligned(&self, lba: u64) -> bool {
        let gran = self.phy_sector_size.max(self.min_io_size).max(self.sector_size);
        self.on_boundary(lba, gran)
    }

    /// Align `lba` to the grain
    ///
    /// Up and nearest never fall below the first usable LBA. Down never
    /// exceeds `lba`; with no aligned sector between the first usable LBA
    /// and `lba` it returns `lba` unchanged. Clamping into a range is
    /// [`Topology::align_lba_in_range`].
    pub fn align_lba(&self, lba: u64, direction: AlignDirection) -> u64 {
        let res = match direction {
            AlignDirection::Up => self.aligned_up(lba.max(self.first_lba)),
            AlignDirection::Down => match self.aligned_down(lba) {
                Some(down) if down >= self.first_lba => down,
                _ => lba,
            },
            AlignDirection::Nearest => {
                let up = self.aligned_up(lba);
                let nearest = match self.aligned_down(lba) {
                    Some(down) if lba - down < up - lba => down,
                    _ => up,
                };
                if nearest < self.first_lba {
                    self.aligned_up(self.first_lba)
                } else {
                    nearest
                }
            }
        };
        if res != lba {
            tracing::trace!(lba, res, ?direction, "aligned");
        }
        res
    }

    /// Align `lba` to the nearest grain boundary inside `[start, stop]`
    ///
    /// The range itself is shrunk to aligned boundaries first; an empty
    /// aligned range is an error.
    pub fn align_lba_in_range(&self, lba: u64, start: u64, stop: u64) -> Result<u64> {
        let lo = self.align_lba(start, AlignDirection::Up);
        let hi = self
            .aligned_down(stop)
            .ok_or_else(|| Error::out_of_range(format!("no aligned sector below {}", stop)))?;
        if lo > hi {
            return Err(Error::out_of_range(format!(
                "no aligned sector in range {}-{}",
                start, stop
            )));
        }
        Ok(self.align_lba(lba, AlignDirection::Nearest).clamp(lo, hi))
    }

    /// Recompute grain and first usable LBA from the probed topology
    ///
    /// The grain is the larger of 1 MiB and the optimal I/O size; devices no
    /// bigger than four grains fall back to the physical sector size.
    pub fn reset_alignment(&mut self) {
        let mut grain = DEFAULT_GRAIN.max(self.io_size);
        let phy = self.phy_sector_size.max(self.sector_size);
        if grain % phy != 0 {
            grain = grain.div_ceil(phy) * phy;
        }
        if self.total_sectors != 0 && self.size_bytes() <= grain * 4 {
            grain = phy;
        }
        self.grain = grain;
        self.reset_first_lba();
        tracing::debug!(grain = self.grain, first_lba = self.first_lba, "alignment reset");
    }

    /// Override the grain (in bytes) and recompute the first usable LBA
    pub fn set_grain(&mut self, grain: u64) -> Result<()> {
        if grain < self.sector_size || grain % self.sector_size != 0 {
            return Err(Error::invalid_argument(format!(
                "grain {} is not a multiple of the sector size {}",
                grain, self.sector_size
            )));
        }
        self.grain = grain;
        self.reset_first_lba();
        Ok(())
    }

    fn reset_first_lba(&mut self) {
        let (g, o) = self.aligned_origin();
        let grain_sectors = self.grain_sectors();
        self.first_lba = if o != 0 { o } else { grain_sectors.max(g) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk() -> Topology {
        Topology::for_image(1_048_576 * 512, 512)
    }

    #[test]
    fn test_align_directions() {
        let topo = disk();
        assert_eq!(topo.grain_sectors(), 2048);
        assert_eq!(topo.align_lba(0, AlignDirection::Up), 2048);
        assert_eq!(topo.align_lba(2048, AlignDirection::Up), 2048);
        assert_eq!(topo.align_lba(2049, AlignDirection::Up), 4096);
        assert_eq!(topo.align_lba(4095, AlignDirection::Down), 2048);
        assert_eq!(topo.align_lba(3071, AlignDirection::Nearest), 2048);
        assert_eq!(topo.align_lba(3072, AlignDirection::Nearest), 4096);
        assert_eq!(topo.align_lba(100, AlignDirection::Down), 100);
        assert!(topo.align_lba(2047, AlignDirection::Down) <= 2047);
    }

    #[test]
    fn test_huge_lba_alignment_check() {
        let mut topo = disk();
        topo.phy_sector_size = 4096;
        assert!(!topo.lba_is_aligned(u64::MAX));
        assert!(!topo.lba_is_phy_aligned(u64::MAX));
        let big = (u64::MAX / 2048) * 2048;
        assert!(topo.lba_is_aligned(big));
        assert!(topo.lba_is_phy_aligned(big));
    }

    #[test]
    fn test_align_properties() {
        for grain in [4096u64, 65536, 1024 * 1024, 4 * 1024 * 1024] {
            let mut topo = disk();
            topo.set_grain(grain).unwrap();
            let g = grain / 512;
            let first = topo.align_lba(topo.first_lba, AlignDirection::Up);
            for x in (first..first + 3 * g + 7).step_by(3) {
                let up = topo.align_lba(x, AlignDirection::Up);
                let down = topo.align_lba(x, AlignDirection::Down);
                let near = topo.align_lba(x, AlignDirection::Nearest);
                assert!(up >= x);
                assert!(down <= x);
                assert_eq!(up % g, 0);
                assert_eq!(down % g, 0);
                assert!(topo.lba_is_aligned(up));
                if up - x < x - down {
                    assert_eq!(near, up);
                } else if x - down < up - x {
                    assert_eq!(near, down);
                } else {
                    assert_eq!(near, up);
                }
            }
        }
    }

    #[test]
    fn test_align_in_range() {
        let topo = disk();
        assert_eq!(topo.align_lba_in_range(5000, 2048, 3000).unwrap(), 2048);
        assert_eq!(topo.align_lba_in_range(9000, 2048, 100_000).unwrap(), 8192);
        assert_eq!(topo.align_lba_in_range(0, 4000, 100_000).unwrap(), 4096);
        assert!(topo.align_lba_in_range(3000, 2049, 4000).is_err());
    }

    #[test]
    fn test_phy_alignment() {
        let mut topo = disk();
        topo.phy_sector_size = 4096;
        assert!(topo.lba_is_phy_aligned(8));
        assert!(!topo.lba_is_phy_aligned(7));
    }

    #[test]
    fn test_alignment_offset() {
        let mut topo = disk();
        topo.phy_sector_size = 4096;
        topo.alignment_offset = 3584;
        topo.reset_alignment();
        assert_eq!(topo.first_lba, 2041);
        assert!(topo.lba_is_aligned(2041));
        assert!(topo.lba_is_aligned(2041 + 2048));
        assert!(topo.lba_is_phy_aligned(1));
        assert!(!topo.lba_is_phy_aligned(7));
        assert_eq!(topo.align_lba(3000, AlignDirection::Up), 4089);
    }

    #[test]
    fn test_small_device_grain() {
        let topo = Topology::for_image(2 * 1024 * 1024, 512);
        assert_eq!(topo.grain, 512);
        assert_eq!(topo.first_lba, 1);
    }

    #[test]
    fn test_optimal_io_grain() {
        let mut topo = disk();
        topo.io_size = 4 * 1024 * 1024;
        topo.reset_alignment();
        assert_eq!(topo.grain, 4 * 1024 * 1024);
        assert_eq!(topo.first_lba, 8192);
    }
}
