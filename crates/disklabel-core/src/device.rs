//! Device topology probing and kernel notifications

use crate::geometry::{Geometry, Topology, DEFAULT_SECTOR_SIZE};
use crate::traits::DeviceIo;
use std::fs::File;
use std::io;

#[cfg(target_os = "linux")]
mod ioctl {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    pub const BLKRRPART: u64 = 0x125F;
    pub const BLKSSZGET: u64 = 0x1268;
    pub const BLKIOMIN: u64 = 0x1278;
    pub const BLKIOOPT: u64 = 0x1279;
    pub const BLKALIGNOFF: u64 = 0x127A;
    pub const BLKPBSZGET: u64 = 0x127B;
    pub const BLKGETSIZE64: u64 = 0x8008_1272;
    pub const HDIO_GETGEO: u64 = 0x0301;

    #[repr(C)]
    #[derive(Default)]
    pub struct HdGeometry {
        pub heads: u8,
        pub sectors: u8,
        pub cylinders: u16,
        pub start: libc::c_ulong,
    }

    /// Issue an ioctl that fills `*arg`
    pub fn get<T>(file: &File, request: u64, arg: &mut T) -> io::Result<()> {
        // SAFETY: `arg` is a valid, exclusively borrowed out-parameter whose
        // layout matches what the kernel writes for `request`.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg as *mut T) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Issue an ioctl that takes no argument
    pub fn call(file: &File, request: u64) -> io::Result<()> {
        // SAFETY: the request takes no argument.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), request as _) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// True if `file` refers to a block device
pub fn is_block_device(file: &File) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        file.metadata()
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        false
    }
}

/// Ask the kernel to re-read the partition table
///
/// Only meaningful for whole-disk block devices; a no-op for image files.
pub fn reread_partition_table(file: &File) -> io::Result<()> {
    if !is_block_device(file) {
        return Ok(());
    }
    #[cfg(target_os = "linux")]
    {
        ioctl::call(file, ioctl::BLKRRPART)?;
        tracing::debug!("partition table re-read requested");
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn probe_block_device(file: &File, topo: &mut Topology) -> io::Result<()> {
    let mut ssz: libc::c_int = 0;
    if ioctl::get(file, ioctl::BLKSSZGET, &mut ssz).is_ok() && ssz > 0 {
        topo.sector_size = ssz as u64;
    }

    let mut value: libc::c_uint = 0;
    if ioctl::get(file, ioctl::BLKPBSZGET, &mut value).is_ok() && value > 0 {
        topo.phy_sector_size = value as u64;
    }
    value = 0;
    if ioctl::get(file, ioctl::BLKIOMIN, &mut value).is_ok() && value > 0 {
        topo.min_io_size = value as u64;
    }
    value = 0;
    if ioctl::get(file, ioctl::BLKIOOPT, &mut value).is_ok() {
        topo.optimal_io_size = value as u64;
    }
    let mut alignoff: libc::c_int = 0;
    if ioctl::get(file, ioctl::BLKALIGNOFF, &mut alignoff).is_ok() && alignoff > 0 {
        topo.alignment_offset = alignoff as u64;
    }

    let mut bytes: u64 = 0;
    ioctl::get(file, ioctl::BLKGETSIZE64, &mut bytes)?;
    topo.total_sectors = bytes / topo.sector_size;

    let mut geo = ioctl::HdGeometry::default();
    if ioctl::get(file, ioctl::HDIO_GETGEO, &mut geo).is_ok() && geo.heads != 0 && geo.sectors != 0 {
        topo.geom.heads = geo.heads as u32;
        topo.geom.sectors = geo.sectors as u64;
        topo.geom.recount_cylinders(topo.total_sectors);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn probe_block_device(_file: &File, _topo: &mut Topology) -> io::Result<()> {
    Ok(())
}

/// Probe sector sizes, I/O hints, size and CHS geometry of a device
///
/// Block devices are asked through the kernel; anything else is treated as a
/// disk image with 512-byte sectors. The alignment state is reset from the
/// probed values.
pub fn probe_topology(dev: &mut dyn DeviceIo) -> io::Result<Topology> {
    let size = dev.size()?;
    let mut topo = Topology {
        total_sectors: size / DEFAULT_SECTOR_SIZE,
        ..Topology::default()
    };

    if let Some(file) = dev.as_file() {
        if is_block_device(file) {
            probe_block_device(file, &mut topo)?;
        }
    }

    topo.io_size = if topo.optimal_io_size != 0 {
        topo.optimal_io_size
    } else {
        topo.min_io_size
    };
    if !topo.geom.is_complete() {
        topo.geom = Geometry::synthesize(topo.total_sectors);
    }
    topo.reset_alignment();

    tracing::debug!(
        sector_size = topo.sector_size,
        phy_sector_size = topo.phy_sector_size,
        min_io = topo.min_io_size,
        optimal_io = topo.optimal_io_size,
        alignment_offset = topo.alignment_offset,
        total_sectors = topo.total_sectors,
        "probed topology"
    );
    Ok(topo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_probe_memory_image() {
        let mut dev = Cursor::new(vec![0u8; 8 * 1024 * 1024]);
        let topo = probe_topology(&mut dev).unwrap();
        assert_eq!(topo.sector_size, 512);
        assert_eq!(topo.total_sectors, 16384);
        assert_eq!(topo.geom.heads, 255);
        assert_eq!(topo.geom.sectors, 63);
        assert_eq!(topo.first_lba, 2048);
    }

    #[test]
    fn test_probe_image_file() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(512 * 1024 * 1024).unwrap();
        let mut file = file;
        let topo = probe_topology(&mut file).unwrap();
        assert_eq!(topo.total_sectors, 1_048_576);
        assert!(!is_block_device(&file));
        reread_partition_table(&file).unwrap();
    }
}
