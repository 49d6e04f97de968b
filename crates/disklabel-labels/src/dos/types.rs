//! MBR partition types, entries and CHS addressing

use disklabel_core::{Geometry, PartTypeDef};
use std::fmt;

/// Partition types known for MBR labels
pub const DOS_PARTTYPES: &[PartTypeDef] = &[
    PartTypeDef::code(0x00, "Empty"),
    PartTypeDef::code(0x01, "FAT12"),
    PartTypeDef::code(0x02, "XENIX root"),
    PartTypeDef::code(0x03, "XENIX usr"),
    PartTypeDef::code(0x04, "FAT16 <32M"),
    PartTypeDef::code(0x05, "Extended"),
    PartTypeDef::code(0x06, "FAT16"),
    PartTypeDef::code(0x07, "HPFS/NTFS/exFAT"),
    PartTypeDef::code(0x08, "AIX"),
    PartTypeDef::code(0x09, "AIX bootable"),
    PartTypeDef::code(0x0a, "OS/2 Boot Manager"),
    PartTypeDef::code(0x0b, "W95 FAT32"),
    PartTypeDef::code(0x0c, "W95 FAT32 (LBA)"),
    PartTypeDef::code(0x0e, "W95 FAT16 (LBA)"),
    PartTypeDef::code(0x0f, "W95 Ext'd (LBA)"),
    PartTypeDef::code(0x10, "OPUS"),
    PartTypeDef::code(0x11, "Hidden FAT12"),
    PartTypeDef::code(0x12, "Compaq diagnostics"),
    PartTypeDef::code(0x14, "Hidden FAT16 <32M"),
    PartTypeDef::code(0x16, "Hidden FAT16"),
    PartTypeDef::code(0x17, "Hidden HPFS/NTFS"),
    PartTypeDef::code(0x18, "AST SmartSleep"),
    PartTypeDef::code(0x1b, "Hidden W95 FAT32"),
    PartTypeDef::code(0x1c, "Hidden W95 FAT32 (LBA)"),
    PartTypeDef::code(0x1e, "Hidden W95 FAT16 (LBA)"),
    PartTypeDef::code(0x24, "NEC DOS"),
    PartTypeDef::code(0x27, "Hidden NTFS WinRE"),
    PartTypeDef::code(0x39, "Plan 9"),
    PartTypeDef::code(0x3c, "PartitionMagic recovery"),
    PartTypeDef::code(0x40, "Venix 80286"),
    PartTypeDef::code(0x41, "PPC PReP Boot"),
    PartTypeDef::code(0x42, "SFS"),
    PartTypeDef::code(0x4d, "QNX4.x"),
    PartTypeDef::code(0x4e, "QNX4.x 2nd part"),
    PartTypeDef::code(0x4f, "QNX4.x 3rd part"),
    PartTypeDef::code(0x50, "OnTrack DM"),
    PartTypeDef::code(0x51, "OnTrack DM6 Aux1"),
    PartTypeDef::code(0x52, "CP/M"),
    PartTypeDef::code(0x53, "OnTrack DM6 Aux3"),
    PartTypeDef::code(0x54, "OnTrackDM6"),
    PartTypeDef::code(0x55, "EZ-Drive"),
    PartTypeDef::code(0x56, "Golden Bow"),
    PartTypeDef::code(0x5c, "Priam Edisk"),
    PartTypeDef::code(0x61, "SpeedStor"),
    PartTypeDef::code(0x63, "GNU HURD or SysV"),
    PartTypeDef::code(0x64, "Novell Netware 286"),
    PartTypeDef::code(0x65, "Novell Netware 386"),
    PartTypeDef::code(0x70, "DiskSecure Multi-Boot"),
    PartTypeDef::code(0x75, "PC/IX"),
    PartTypeDef::code(0x80, "Old Minix"),
    PartTypeDef::code(0x81, "Minix / old Linux"),
    PartTypeDef::code(0x82, "Linux swap / Solaris"),
    PartTypeDef::code(0x83, "Linux"),
    PartTypeDef::code(0x84, "OS/2 hidden or Intel hibernation"),
    PartTypeDef::code(0x85, "Linux extended"),
    PartTypeDef::code(0x86, "NTFS volume set"),
    PartTypeDef::code(0x87, "NTFS volume set"),
    PartTypeDef::code(0x88, "Linux plaintext"),
    PartTypeDef::code(0x8e, "Linux LVM"),
    PartTypeDef::code(0x93, "Amoeba"),
    PartTypeDef::code(0x94, "Amoeba BBT"),
    PartTypeDef::code(0x9f, "BSD/OS"),
    PartTypeDef::code(0xa0, "IBM Thinkpad hibernation"),
    PartTypeDef::code(0xa5, "FreeBSD"),
    PartTypeDef::code(0xa6, "OpenBSD"),
    PartTypeDef::code(0xa7, "NeXTSTEP"),
    PartTypeDef::code(0xa8, "Darwin UFS"),
    PartTypeDef::code(0xa9, "NetBSD"),
    PartTypeDef::code(0xab, "Darwin boot"),
    PartTypeDef::code(0xaf, "HFS / HFS+"),
    PartTypeDef::code(0xb7, "BSDI fs"),
    PartTypeDef::code(0xb8, "BSDI swap"),
    PartTypeDef::code(0xbb, "Boot Wizard hidden"),
    PartTypeDef::code(0xbc, "Acronis FAT32 LBA"),
    PartTypeDef::code(0xbe, "Solaris boot"),
    PartTypeDef::code(0xbf, "Solaris"),
    PartTypeDef::code(0xc1, "DRDOS/sec (FAT-12)"),
    PartTypeDef::code(0xc4, "DRDOS/sec (FAT-16 < 32M)"),
    PartTypeDef::code(0xc6, "DRDOS/sec (FAT-16)"),
    PartTypeDef::code(0xc7, "Syrinx"),
    PartTypeDef::code(0xda, "Non-FS data"),
    PartTypeDef::code(0xdb, "CP/M / CTOS / ..."),
    PartTypeDef::code(0xde, "Dell Utility"),
    PartTypeDef::code(0xdf, "BootIt"),
    PartTypeDef::code(0xe1, "DOS access"),
    PartTypeDef::code(0xe3, "DOS R/O"),
    PartTypeDef::code(0xe4, "SpeedStor"),
    PartTypeDef::code(0xea, "Linux extended boot"),
    PartTypeDef::code(0xeb, "BeOS fs"),
    PartTypeDef::code(0xee, "GPT"),
    PartTypeDef::code(0xef, "EFI (FAT-12/16/32)"),
    PartTypeDef::code(0xf0, "Linux/PA-RISC boot"),
    PartTypeDef::code(0xf1, "SpeedStor"),
    PartTypeDef::code(0xf4, "SpeedStor"),
    PartTypeDef::code(0xf2, "DOS secondary"),
    PartTypeDef::code(0xf8, "EBBR protective"),
    PartTypeDef::code(0xfb, "VMware VMFS"),
    PartTypeDef::code(0xfc, "VMware VMKCORE"),
    PartTypeDef::code(0xfd, "Linux raid autodetect"),
    PartTypeDef::code(0xfe, "LANstep"),
    PartTypeDef::code(0xff, "BBT"),
];

pub const TYPE_EMPTY: u8 = 0x00;
pub const TYPE_EXTENDED: u8 = 0x05;
pub const TYPE_LINUX: u8 = 0x83;
pub const TYPE_GPT_PROTECTIVE: u8 = 0xee;

/// Container types holding an EBR chain
pub fn is_extended(code: u32) -> bool {
    matches!(code, 0x05 | 0x0f | 0x85)
}

/// CHS (Cylinder-Head-Sector) address
///
/// Traditional disk addressing using physical geometry.
/// Maximum values: 1023 cylinders, 255 heads, 63 sectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CHSAddress {
    pub cylinder: u16,
    pub head: u8,
    pub sector: u8,
}

impl CHSAddress {
    /// Parse CHS address from 3 bytes
    ///
    /// Format:
    /// - Byte 0: Head (0-255)
    /// - Byte 1: Sector (bits 0-5) + Cylinder high (bits 6-7)
    /// - Byte 2: Cylinder low (bits 0-7)
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let head = bytes[0];
        let sector = bytes[1] & 0x3F;
        let cyl_high = ((bytes[1] & 0xC0) as u16) << 2;
        let cyl_low = bytes[2] as u16;

        Self {
            cylinder: cyl_high | cyl_low,
            head,
            sector,
        }
    }

    /// Convert CHS to bytes
    pub fn to_bytes(&self) -> [u8; 3] {
        let cyl_high = ((self.cylinder >> 8) & 0x03) as u8;
        let cyl_low = (self.cylinder & 0xFF) as u8;

        [self.head, (self.sector & 0x3F) | (cyl_high << 6), cyl_low]
    }

    /// Address of `lba` under `geom`
    ///
    /// Sectors beyond cylinder 1023 get the conventional 1023/heads-1/sectors
    /// marker.
    pub fn from_lba(lba: u64, geom: &Geometry) -> Self {
        let spc = geom.sectors_per_cylinder();
        if spc == 0 || geom.sectors == 0 {
            return Self::default();
        }
        let lba = lba.min(1024 * spc - 1);
        let cylinder = lba / spc;
        let rest = lba % spc;
        Self {
            cylinder: cylinder as u16,
            head: (rest / geom.sectors) as u8,
            sector: (rest % geom.sectors + 1) as u8,
        }
    }

    /// Convert CHS to LBA (approximate, requires disk geometry)
    pub fn to_lba(&self, heads_per_cylinder: u16, sectors_per_track: u16) -> u32 {
        let c = self.cylinder as u32;
        let h = self.head as u32;
        let s = self.sector.saturating_sub(1) as u32;

        (c * heads_per_cylinder as u32 + h) * sectors_per_track as u32 + s
    }
}

impl fmt::Display for CHSAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cylinder, self.head, self.sector)
    }
}

/// One 16-byte partition table entry
///
/// `start` is kept as stored: relative to the sector holding the table for
/// data entries, relative to the extended partition for EBR links.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DosEntry {
    pub boot_ind: u8,
    pub chs_start: CHSAddress,
    pub sys_ind: u8,
    pub chs_end: CHSAddress,
    pub start: u32,
    pub size: u32,
}

impl DosEntry {
    pub const SIZE: usize = 16;

    pub fn from_bytes(entry: &[u8]) -> Self {
        Self {
            boot_ind: entry[0],
            chs_start: CHSAddress::from_bytes(&entry[1..4]),
            sys_ind: entry[4],
            chs_end: CHSAddress::from_bytes(&entry[5..8]),
            start: u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]),
            size: u32::from_le_bytes([entry[12], entry[13], entry[14], entry[15]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.boot_ind;
        out[1..4].copy_from_slice(&self.chs_start.to_bytes());
        out[4] = self.sys_ind;
        out[5..8].copy_from_slice(&self.chs_end.to_bytes());
        out[8..12].copy_from_slice(&self.start.to_le_bytes());
        out[12..16].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    /// Entry for absolute sectors `first..=last`, stored relative to `base`
    pub fn new(boot: bool, sys: u8, base: u64, first: u64, last: u64, geom: &Geometry) -> Self {
        Self {
            boot_ind: if boot { 0x80 } else { 0 },
            chs_start: CHSAddress::from_lba(first, geom),
            sys_ind: sys,
            chs_end: CHSAddress::from_lba(last, geom),
            start: (first - base) as u32,
            size: (last - first + 1) as u32,
        }
    }

    pub fn is_used(&self) -> bool {
        self.size != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disklabel_core::parttype;

    #[test]
    fn test_catalog() {
        assert_eq!(parttype::from_code(DOS_PARTTYPES, 0x83).name, "Linux");
        assert_eq!(parttype::from_code(DOS_PARTTYPES, 0x82).name, "Linux swap / Solaris");
        assert_eq!(parttype::from_code(DOS_PARTTYPES, 0xee).name, "GPT");
        assert!(is_extended(0x05) && is_extended(0x0f) && is_extended(0x85));
        assert!(!is_extended(0x83));
    }

    #[test]
    fn test_chs_from_bytes() {
        let chs = CHSAddress::from_bytes(&[0x01, 0x01, 0x00]);
        assert_eq!(chs.cylinder, 0);
        assert_eq!(chs.head, 1);
        assert_eq!(chs.sector, 1);
    }

    #[test]
    fn test_chs_to_bytes() {
        let chs = CHSAddress {
            cylinder: 100,
            head: 5,
            sector: 10,
        };
        assert_eq!(CHSAddress::from_bytes(&chs.to_bytes()), chs);
    }

    #[test]
    fn test_chs_from_lba() {
        let geom = Geometry::new(1305, 255, 63);
        let chs = CHSAddress::from_lba(2048, &geom);
        assert_eq!((chs.cylinder, chs.head, chs.sector), (0, 32, 33));
        assert_eq!(chs.to_lba(255, 63), 2048);

        let far = CHSAddress::from_lba(100_000_000, &geom);
        assert_eq!((far.cylinder, far.head, far.sector), (1023, 254, 63));
    }

    #[test]
    fn test_entry_layout() {
        let geom = Geometry::new(1305, 255, 63);
        let e = DosEntry::new(true, TYPE_LINUX, 0, 2048, 4095, &geom);
        let raw = e.to_bytes();
        assert_eq!(raw[0], 0x80);
        assert_eq!(raw[4], 0x83);
        assert_eq!(&raw[8..12], &2048u32.to_le_bytes());
        assert_eq!(DosEntry::from_bytes(&raw), e);
        assert!(!DosEntry::default().is_used());
    }
}
