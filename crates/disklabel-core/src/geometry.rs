//! Device geometry and I/O topology

use serde::Serialize;
use std::fmt;

/// Default logical sector size in bytes
pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// Default alignment granularity (1 MiB)
pub const DEFAULT_GRAIN: u64 = 1024 * 1024;

/// Default number of heads for synthesized CHS geometry
pub const DEFAULT_HEADS: u32 = 255;

/// Default number of sectors per track for synthesized CHS geometry
pub const DEFAULT_SECTORS: u64 = 63;

/// CHS (Cylinder-Head-Sector) geometry
///
/// Legacy labels (DOS in compatible mode, BSD, SGI, SUN) address partitions
/// in terms of cylinders; modern labels only need it for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Geometry {
    pub cylinders: u64,
    pub heads: u32,
    pub sectors: u64,
}

impl Geometry {
    pub fn new(cylinders: u64, heads: u32, sectors: u64) -> Self {
        Self {
            cylinders,
            heads,
            sectors,
        }
    }

    /// True when all three values are set
    pub fn is_complete(&self) -> bool {
        self.cylinders != 0 && self.heads != 0 && self.sectors != 0
    }

    /// Number of sectors in one cylinder
    pub fn sectors_per_cylinder(&self) -> u64 {
        self.heads as u64 * self.sectors
    }

    /// Geometry synthesized from the device size when the device reports none
    pub fn synthesize(total_sectors: u64) -> Self {
        let mut geom = Self::new(0, DEFAULT_HEADS, DEFAULT_SECTORS);
        geom.recount_cylinders(total_sectors);
        geom
    }

    /// Recompute the cylinder count from heads/sectors and the device size
    pub fn recount_cylinders(&mut self, total_sectors: u64) {
        let spc = self.sectors_per_cylinder();
        if spc != 0 {
            self.cylinders = total_sectors / spc;
        }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} heads, {} sectors/track, {} cylinders",
            self.heads, self.sectors, self.cylinders
        )
    }
}

/// I/O topology of a device plus the alignment state derived from it
///
/// All sizes are in bytes except `first_lba` and `total_sectors`, which are
/// in logical sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Topology {
    /// Logical sector size
    pub sector_size: u64,
    /// Physical sector size
    pub phy_sector_size: u64,
    /// Minimum I/O size
    pub min_io_size: u64,
    /// Optimal I/O size (0 if not reported)
    pub optimal_io_size: u64,
    /// Preferred I/O size (optimal if reported, otherwise minimum)
    pub io_size: u64,
    /// Offset of the first aligned byte from the start of the device
    pub alignment_offset: u64,
    /// Number of logical sectors on the device
    pub total_sectors: u64,
    /// CHS geometry
    pub geom: Geometry,
    /// Alignment granularity for partition boundaries
    pub grain: u64,
    /// Lowest sector a partition may start at
    pub first_lba: u64,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            sector_size: DEFAULT_SECTOR_SIZE,
            phy_sector_size: DEFAULT_SECTOR_SIZE,
            min_io_size: DEFAULT_SECTOR_SIZE,
            optimal_io_size: 0,
            io_size: DEFAULT_SECTOR_SIZE,
            alignment_offset: 0,
            total_sectors: 0,
            geom: Geometry::default(),
            grain: DEFAULT_GRAIN,
            first_lba: DEFAULT_GRAIN / DEFAULT_SECTOR_SIZE,
        }
    }
}

impl Topology {
    /// Topology of a plain image file of `size` bytes
    pub fn for_image(size: u64, sector_size: u64) -> Self {
        let total_sectors = size / sector_size;
        let mut topo = Self {
            sector_size,
            phy_sector_size: sector_size,
            min_io_size: sector_size,
            io_size: sector_size,
            total_sectors,
            geom: Geometry::synthesize(total_sectors),
            ..Self::default()
        };
        topo.reset_alignment();
        topo
    }

    /// Device size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.total_sectors * self.sector_size
    }

    /// Number of logical sectors per grain
    pub fn grain_sectors(&self) -> u64 {
        (self.grain / self.sector_size).max(1)
    }
}

/// Geometry and sector sizes explicitly requested by the user
///
/// Zero means "not overridden". These always win over probed values and
/// over script headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserProperties {
    pub geom: Geometry,
    pub sector_size: u64,
    pub phy_sector_size: u64,
}

impl UserProperties {
    /// True if any override is set
    pub fn is_set(&self) -> bool {
        self.geom.cylinders != 0
            || self.geom.heads != 0
            || self.geom.sectors != 0
            || self.sector_size != 0
            || self.phy_sector_size != 0
    }

    /// Apply the overrides on top of `topo`
    ///
    /// Changing the logical sector size rescales the sector count; a partial
    /// geometry override recomputes the cylinders from the rest.
    pub fn apply(&self, topo: &mut Topology) {
        if self.sector_size != 0 && self.sector_size != topo.sector_size {
            let bytes = topo.size_bytes();
            topo.sector_size = self.sector_size;
            topo.total_sectors = bytes / self.sector_size;
            if topo.phy_sector_size < self.sector_size {
                topo.phy_sector_size = self.sector_size;
            }
            if topo.min_io_size < self.sector_size {
                topo.min_io_size = self.sector_size;
            }
        }
        if self.phy_sector_size != 0 {
            topo.phy_sector_size = self.phy_sector_size;
        }
        if self.geom.heads != 0 {
            topo.geom.heads = self.geom.heads;
        }
        if self.geom.sectors != 0 {
            topo.geom.sectors = self.geom.sectors;
        }
        if self.geom.cylinders != 0 {
            topo.geom.cylinders = self.geom.cylinders;
        } else if self.geom.heads != 0 || self.geom.sectors != 0 || self.sector_size != 0 {
            topo.geom.recount_cylinders(topo.total_sectors);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesized_geometry() {
        let geom = Geometry::synthesize(16065 * 10);
        assert_eq!(geom.heads, 255);
        assert_eq!(geom.sectors, 63);
        assert_eq!(geom.cylinders, 10);
        assert!(geom.is_complete());
    }

    #[test]
    fn test_image_topology() {
        let topo = Topology::for_image(512 * 1024 * 1024, 512);
        assert_eq!(topo.total_sectors, 1_048_576);
        assert_eq!(topo.grain, DEFAULT_GRAIN);
        assert_eq!(topo.first_lba, 2048);
    }

    #[test]
    fn test_user_properties_apply() {
        let mut topo = Topology::for_image(64 * 1024 * 1024, 512);
        let user = UserProperties {
            geom: Geometry::new(0, 16, 32),
            ..Default::default()
        };
        assert!(user.is_set());
        user.apply(&mut topo);
        assert_eq!(topo.geom.heads, 16);
        assert_eq!(topo.geom.sectors, 32);
        assert_eq!(topo.geom.cylinders, 131072 / (16 * 32));
    }

    #[test]
    fn test_user_sector_size_rescales() {
        let mut topo = Topology::for_image(64 * 1024 * 1024, 512);
        let user = UserProperties {
            sector_size: 4096,
            ..Default::default()
        };
        user.apply(&mut topo);
        assert_eq!(topo.sector_size, 4096);
        assert_eq!(topo.total_sectors, 16384);
        assert_eq!(topo.phy_sector_size, 4096);
    }
}
