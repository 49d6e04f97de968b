//! GPT partition types and structures

use disklabel_core::{Error, PartTypeDef, Result};
use uuid::Uuid;

/// Known partition type GUIDs, in menu order
pub const GPT_PARTTYPES: &[PartTypeDef] = &[
    // generic
    PartTypeDef::string("C12A7328-F81F-11D2-BA4B-00A0C93EC93B", "EFI System"),
    PartTypeDef::string("024DEE41-33E7-11D3-9D69-0008C781F39F", "MBR partition scheme"),
    PartTypeDef::string("D3BFE2DE-3DAF-11DF-BA40-E3A556D89593", "Intel Fast Flash"),
    PartTypeDef::string("21686148-6449-6E6F-744E-656564454649", "BIOS boot"),
    PartTypeDef::string("F4019732-066E-4E12-8273-346C5641494F", "Sony boot partition"),
    PartTypeDef::string("BFBFAFE7-A34F-448A-9A5B-6213EB736C22", "Lenovo boot partition"),
    PartTypeDef::string("9E1A2D38-C612-4316-AA26-8B49521E5A8B", "PowerPC PReP boot"),
    PartTypeDef::string("7412F7D5-A156-4B13-81DC-867174929325", "ONIE boot"),
    PartTypeDef::string("D4E6E2CD-4469-46F3-B5CB-1BFF57AFC149", "ONIE config"),
    // windows
    PartTypeDef::string("E3C9E316-0B5C-4DB8-817D-F92DF00215AE", "Microsoft reserved"),
    PartTypeDef::string("EBD0A0A2-B9E5-4433-87C0-68B6B72699C7", "Microsoft basic data"),
    PartTypeDef::string("5808C8AA-7E8F-42E0-85D2-E1E90434CFB3", "Microsoft LDM metadata"),
    PartTypeDef::string("AF9B60A0-1431-4F62-BC68-3311714A69AD", "Microsoft LDM data"),
    PartTypeDef::string("DE94BBA4-06D1-4D40-A16A-BFD50179D6AC", "Windows recovery environment"),
    PartTypeDef::string("37AFFC90-EF7D-4E96-91C3-2D7AE055B174", "IBM General Parallel Fs"),
    PartTypeDef::string("E75CAF8F-F680-4CEE-AFA3-B001E56EFC2D", "Microsoft Storage Spaces"),
    // HP-UX
    PartTypeDef::string("75894C1E-3AEB-11D3-B7C1-7B03A0000000", "HP-UX data"),
    PartTypeDef::string("E2A1E728-32E3-11D6-A682-7B03A0000000", "HP-UX service"),
    // linux
    PartTypeDef::string("0657FD6D-A4AB-43C4-84E5-0933C84B4F4F", "Linux swap"),
    PartTypeDef::string("0FC63DAF-8483-4772-8E79-3D69D8477DE4", "Linux filesystem"),
    PartTypeDef::string("3B8F8425-20E0-4F3B-907F-1A25A76F98E8", "Linux server data"),
    PartTypeDef::string("44479540-F297-41B2-9AF7-D131D5F0458A", "Linux root (x86)"),
    PartTypeDef::string("4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709", "Linux root (x86-64)"),
    PartTypeDef::string("B921B045-1DF0-41C3-AF44-4C6F280D3FAE", "Linux root (ARM-64)"),
    PartTypeDef::string("8484680C-9521-48C6-9C11-B0720656F69E", "Linux /usr (x86-64)"),
    PartTypeDef::string("8DA63339-0007-60C0-C436-083AC8230908", "Linux reserved"),
    PartTypeDef::string("933AC7E1-2EB4-4F13-B844-0E14E2AEF915", "Linux home"),
    PartTypeDef::string("A19D880F-05FC-4D3B-A006-743F0F84911E", "Linux RAID"),
    PartTypeDef::string("BC13C2FF-59E6-4262-A352-B275FD6F7172", "Linux extended boot"),
    PartTypeDef::string("E6D6D379-F507-44C2-A23C-238F2A3DF928", "Linux LVM"),
    // FreeBSD
    PartTypeDef::string("516E7CB4-6ECF-11D6-8FF8-00022D09712B", "FreeBSD data"),
    PartTypeDef::string("83BD6B9D-7F41-11DC-BE0B-001560B84F0F", "FreeBSD boot"),
    PartTypeDef::string("516E7CB5-6ECF-11D6-8FF8-00022D09712B", "FreeBSD swap"),
    PartTypeDef::string("516E7CB6-6ECF-11D6-8FF8-00022D09712B", "FreeBSD UFS"),
    PartTypeDef::string("516E7CBA-6ECF-11D6-8FF8-00022D09712B", "FreeBSD ZFS"),
    PartTypeDef::string("516E7CB8-6ECF-11D6-8FF8-00022D09712B", "FreeBSD Vinum"),
    // Apple
    PartTypeDef::string("48465300-0000-11AA-AA11-00306543ECAC", "Apple HFS/HFS+"),
    PartTypeDef::string("7C3457EF-0000-11AA-AA11-00306543ECAC", "Apple APFS"),
    PartTypeDef::string("55465300-0000-11AA-AA11-00306543ECAC", "Apple UFS"),
    PartTypeDef::string("52414944-0000-11AA-AA11-00306543ECAC", "Apple RAID"),
    PartTypeDef::string("52414944-5F4F-11AA-AA11-00306543ECAC", "Apple RAID offline"),
    PartTypeDef::string("426F6F74-0000-11AA-AA11-00306543ECAC", "Apple boot"),
    PartTypeDef::string("4C616265-6C00-11AA-AA11-00306543ECAC", "Apple label"),
    PartTypeDef::string("5265636F-7665-11AA-AA11-00306543ECAC", "Apple TV recovery"),
    PartTypeDef::string("53746F72-6167-11AA-AA11-00306543ECAC", "Apple Core storage"),
    // Solaris
    PartTypeDef::string("6A82CB45-1DD2-11B2-99A6-080020736631", "Solaris boot"),
    PartTypeDef::string("6A85CF4D-1DD2-11B2-99A6-080020736631", "Solaris root"),
    PartTypeDef::string("6A898CC3-1DD2-11B2-99A6-080020736631", "Solaris /usr & Apple ZFS"),
    PartTypeDef::string("6A87C46F-1DD2-11B2-99A6-080020736631", "Solaris swap"),
    PartTypeDef::string("6A8B642B-1DD2-11B2-99A6-080020736631", "Solaris backup"),
    PartTypeDef::string("6A8EF2E9-1DD2-11B2-99A6-080020736631", "Solaris /var"),
    PartTypeDef::string("6A90BA39-1DD2-11B2-99A6-080020736631", "Solaris /home"),
    // NetBSD
    PartTypeDef::string("49F48D32-B10E-11DC-B99B-0019D1879648", "NetBSD swap"),
    PartTypeDef::string("49F48D5A-B10E-11DC-B99B-0019D1879648", "NetBSD FFS"),
    PartTypeDef::string("49F48D82-B10E-11DC-B99B-0019D1879648", "NetBSD LFS"),
    PartTypeDef::string("2DB519C4-B10F-11DC-B99B-0019D1879648", "NetBSD concatenated"),
    PartTypeDef::string("2DB519EC-B10F-11DC-B99B-0019D1879648", "NetBSD encrypted"),
    PartTypeDef::string("49F48DAA-B10E-11DC-B99B-0019D1879648", "NetBSD RAID"),
    // ChromeOS
    PartTypeDef::string("FE3A2A5D-4F32-41A7-B725-ACCC3285A309", "ChromeOS kernel"),
    PartTypeDef::string("3CB8E202-3B7E-47DD-8A3C-7FF2A13CFCEC", "ChromeOS root fs"),
    PartTypeDef::string("2E0A753D-9E48-43B0-8337-B15192CB1B5E", "ChromeOS reserved"),
    // others
    PartTypeDef::string("824CC7A0-36A8-11E3-890A-952519AD3F61", "OpenBSD data"),
    PartTypeDef::string("AA31E02A-400F-11DB-9590-000C2911D1B8", "VMware VMFS"),
    PartTypeDef::string("9D275380-40AD-11DB-BF97-000C2911D1B8", "VMware Reserved"),
];

/// Type of a new partition unless told otherwise
pub const LINUX_FILESYSTEM: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";

/// Platform required partition
pub const ATTR_REQUIRED: u32 = 0;
/// EFI firmware should ignore the content
pub const ATTR_NOBLOCK: u32 = 1;
/// Legacy BIOS bootable
pub const ATTR_LEGACYBOOT: u32 = 2;
/// Lowest bit reserved for the partition type
pub const ATTR_GUID_FIRST: u32 = 48;

const ATTR_NAMES: [(u32, &str); 3] = [
    (ATTR_REQUIRED, "RequiredPartition"),
    (ATTR_NOBLOCK, "NoBlockIOProtocol"),
    (ATTR_LEGACYBOOT, "LegacyBIOSBootable"),
];

/// Render attribute bits as `RequiredPartition LegacyBIOSBootable GUID:48,52`
///
/// Bits without a name outside the type specific range are dropped.
pub fn attrs_to_string(attrs: u64) -> String {
    let mut words: Vec<String> = ATTR_NAMES
        .iter()
        .filter(|(bit, _)| attrs & (1u64 << bit) != 0)
        .map(|(_, name)| name.to_string())
        .collect();
    let guid_bits: Vec<String> = (ATTR_GUID_FIRST..64)
        .filter(|bit| attrs & (1u64 << bit) != 0)
        .map(|bit| bit.to_string())
        .collect();
    if !guid_bits.is_empty() {
        words.push(format!("GUID:{}", guid_bits.join(",")));
    }
    words.join(" ")
}

/// Parse the textual attribute form; bit numbers 48-63 may also be given bare
pub fn attrs_from_string(text: &str) -> Result<u64> {
    let mut attrs = 0u64;
    for word in text.split_whitespace() {
        if let Some(&(bit, _)) = ATTR_NAMES.iter().find(|(_, n)| n.eq_ignore_ascii_case(word)) {
            attrs |= 1u64 << bit;
            continue;
        }
        let list = word
            .strip_prefix("GUID:")
            .or_else(|| word.strip_prefix("guid:"))
            .unwrap_or(word);
        for item in list.split(',').filter(|s| !s.is_empty()) {
            let bit: u32 = item
                .parse()
                .map_err(|_| Error::invalid_argument(format!("unsupported GPT attribute '{}'", word)))?;
            if !(ATTR_GUID_FIRST..64).contains(&bit) {
                return Err(Error::out_of_range(format!(
                    "GPT attribute bit {} is not in range 48-63",
                    bit
                )));
            }
            attrs |= 1u64 << bit;
        }
    }
    Ok(attrs)
}

fn le_u32(bytes: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[off..off + 4]);
    u32::from_le_bytes(b)
}

fn le_u64(bytes: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[off..off + 8]);
    u64::from_le_bytes(b)
}

fn guid_at(bytes: &[u8], off: usize) -> Uuid {
    let mut b = [0u8; 16];
    b.copy_from_slice(&bytes[off..off + 16]);
    Uuid::from_bytes_le(b)
}

/// GPT partition entry
///
/// Each partition entry is 128 bytes and describes one partition on the disk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GptPartitionEntry {
    /// Partition type GUID
    pub partition_type_guid: Uuid,
    /// Unique partition GUID
    pub unique_partition_guid: Uuid,
    /// First LBA (inclusive)
    pub first_lba: u64,
    /// Last LBA (inclusive)
    pub last_lba: u64,
    /// Attribute flags
    pub attributes: u64,
    /// Partition name (UTF-16LE, 72 bytes = 36 characters)
    pub name: String,
}

impl GptPartitionEntry {
    /// Size of a partition entry in bytes
    pub const ENTRY_SIZE: usize = 128;

    /// Longest name in UTF-16 code units
    pub const NAME_UNITS: usize = 36;

    /// Parse a partition entry from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::ENTRY_SIZE {
            return Err(Error::invalid_label("short GPT partition entry"));
        }
        Ok(Self {
            partition_type_guid: guid_at(bytes, 0),
            unique_partition_guid: guid_at(bytes, 16),
            first_lba: le_u64(bytes, 32),
            last_lba: le_u64(bytes, 40),
            attributes: le_u64(bytes, 48),
            name: Self::parse_name(&bytes[56..128]),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::ENTRY_SIZE] {
        let mut out = [0u8; Self::ENTRY_SIZE];
        if self.is_unused() {
            return out;
        }
        out[0..16].copy_from_slice(&self.partition_type_guid.to_bytes_le());
        out[16..32].copy_from_slice(&self.unique_partition_guid.to_bytes_le());
        out[32..40].copy_from_slice(&self.first_lba.to_le_bytes());
        out[40..48].copy_from_slice(&self.last_lba.to_le_bytes());
        out[48..56].copy_from_slice(&self.attributes.to_le_bytes());
        for (i, unit) in self.name.encode_utf16().take(Self::NAME_UNITS).enumerate() {
            let off = 56 + i * 2;
            out[off..off + 2].copy_from_slice(&unit.to_le_bytes());
        }
        out
    }

    /// Check if this entry is unused
    pub fn is_unused(&self) -> bool {
        self.partition_type_guid.is_nil()
    }

    /// Get the size of this partition in LBA sectors
    pub fn size_lba(&self) -> u64 {
        if self.last_lba >= self.first_lba {
            self.last_lba - self.first_lba + 1
        } else {
            0
        }
    }

    /// Type GUID as it appears in the type catalog
    pub fn type_string(&self) -> String {
        self.partition_type_guid.hyphenated().to_string().to_uppercase()
    }

    /// Parse UTF-16LE partition name from bytes
    fn parse_name(bytes: &[u8]) -> String {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        String::from_utf16_lossy(&units)
    }

    /// Check that `name` fits into an entry
    pub fn check_name(name: &str) -> Result<()> {
        let units = name.encode_utf16().count();
        if units > Self::NAME_UNITS {
            return Err(Error::invalid_argument(format!(
                "partition name is {} UTF-16 units long, the limit is {}",
                units,
                Self::NAME_UNITS
            )));
        }
        Ok(())
    }
}

/// GPT header
///
/// The GPT header contains metadata about the partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    /// GPT revision (usually 0x00010000)
    pub revision: u32,
    /// Header size in bytes (usually 92)
    pub header_size: u32,
    /// CRC32 checksum of header
    pub header_crc32: u32,
    /// Current LBA (location of this header)
    pub current_lba: u64,
    /// Backup LBA (location of the other header)
    pub backup_lba: u64,
    /// First usable LBA for partitions
    pub first_usable_lba: u64,
    /// Last usable LBA for partitions
    pub last_usable_lba: u64,
    /// Disk GUID
    pub disk_guid: Uuid,
    /// Starting LBA of partition entries
    pub partition_entries_lba: u64,
    /// Number of partition entries
    pub num_partition_entries: u32,
    /// Size of each partition entry
    pub partition_entry_size: u32,
    /// CRC32 of partition entries array
    pub partition_entries_crc32: u32,
}

impl GptHeader {
    /// GPT header signature
    pub const SIGNATURE: &'static [u8; 8] = b"EFI PART";

    /// Typical GPT header size
    pub const HEADER_SIZE: usize = 92;

    pub const REVISION: u32 = 0x0001_0000;

    /// Parse GPT header from bytes; `None` without the signature
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::HEADER_SIZE || &bytes[0..8] != Self::SIGNATURE {
            return None;
        }
        Some(Self {
            revision: le_u32(bytes, 8),
            header_size: le_u32(bytes, 12),
            header_crc32: le_u32(bytes, 16),
            current_lba: le_u64(bytes, 24),
            backup_lba: le_u64(bytes, 32),
            first_usable_lba: le_u64(bytes, 40),
            last_usable_lba: le_u64(bytes, 48),
            disk_guid: guid_at(bytes, 56),
            partition_entries_lba: le_u64(bytes, 72),
            num_partition_entries: le_u32(bytes, 80),
            partition_entry_size: le_u32(bytes, 84),
            partition_entries_crc32: le_u32(bytes, 88),
        })
    }

    /// Serialize into a `len` byte sector, computing the header CRC
    pub fn to_bytes(&self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len.max(Self::HEADER_SIZE)];
        out[0..8].copy_from_slice(Self::SIGNATURE);
        out[8..12].copy_from_slice(&self.revision.to_le_bytes());
        out[12..16].copy_from_slice(&(Self::HEADER_SIZE as u32).to_le_bytes());
        out[24..32].copy_from_slice(&self.current_lba.to_le_bytes());
        out[32..40].copy_from_slice(&self.backup_lba.to_le_bytes());
        out[40..48].copy_from_slice(&self.first_usable_lba.to_le_bytes());
        out[48..56].copy_from_slice(&self.last_usable_lba.to_le_bytes());
        out[56..72].copy_from_slice(&self.disk_guid.to_bytes_le());
        out[72..80].copy_from_slice(&self.partition_entries_lba.to_le_bytes());
        out[80..84].copy_from_slice(&self.num_partition_entries.to_le_bytes());
        out[84..88].copy_from_slice(&self.partition_entry_size.to_le_bytes());
        out[88..92].copy_from_slice(&self.partition_entries_crc32.to_le_bytes());
        let crc = crc32fast::hash(&out[..Self::HEADER_SIZE]);
        out[16..20].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Verify the header CRC32 checksum over `header_size` bytes
    pub fn verify_header_crc32(&self, header_bytes: &[u8]) -> bool {
        let size = self.header_size as usize;
        if size < Self::HEADER_SIZE || header_bytes.len() < size {
            return false;
        }
        let mut header_for_crc = header_bytes[..size].to_vec();
        header_for_crc[16..20].fill(0);
        crc32fast::hash(&header_for_crc) == self.header_crc32
    }

    /// Verify the partition entries array CRC32 checksum
    pub fn verify_partition_entries_crc32(&self, partition_entries_bytes: &[u8]) -> bool {
        let expected_size = self.entries_bytes();
        if partition_entries_bytes.len() < expected_size {
            return false;
        }
        crc32fast::hash(&partition_entries_bytes[..expected_size]) == self.partition_entries_crc32
    }

    /// Size of the entry array in bytes
    pub fn entries_bytes(&self) -> usize {
        self.num_partition_entries as usize * self.partition_entry_size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_order() {
        assert_eq!(GPT_PARTTYPES[0].name, "EFI System");
        assert_eq!(GPT_PARTTYPES[18].name, "Linux swap");
        assert_eq!(GPT_PARTTYPES[19].typestr, Some(LINUX_FILESYSTEM));
    }

    #[test]
    fn test_partition_entry_is_unused() {
        let mut entry_bytes = vec![0u8; GptPartitionEntry::ENTRY_SIZE];
        let entry = GptPartitionEntry::from_bytes(&entry_bytes).unwrap();
        assert!(entry.is_unused());

        entry_bytes[0] = 0x01;
        let entry = GptPartitionEntry::from_bytes(&entry_bytes).unwrap();
        assert!(!entry.is_unused());

        assert!(GptPartitionEntry::from_bytes(&entry_bytes[..64]).is_err());
    }

    #[test]
    fn test_partition_entry_layout() {
        let ty = Uuid::parse_str(LINUX_FILESYSTEM).unwrap();
        let entry = GptPartitionEntry {
            partition_type_guid: ty,
            unique_partition_guid: Uuid::new_v4(),
            first_lba: 100,
            last_lba: 199,
            attributes: 1 << ATTR_LEGACYBOOT,
            name: "boot".to_string(),
        };
        let bytes = entry.to_bytes();
        // mixed endian: first field little endian
        assert_eq!(&bytes[0..4], &[0xaf, 0x3d, 0xc6, 0x0f]);
        assert_eq!(&bytes[56..58], &[b'b', 0]);

        let back = GptPartitionEntry::from_bytes(&bytes).unwrap();
        assert_eq!(back.size_lba(), 100);
        assert_eq!(back.type_string(), LINUX_FILESYSTEM);
        assert_eq!(back, entry);
    }

    #[test]
    fn test_name_limit() {
        assert!(GptPartitionEntry::check_name(&"x".repeat(36)).is_ok());
        assert!(GptPartitionEntry::check_name(&"x".repeat(37)).is_err());
    }

    #[test]
    fn test_gpt_header_signature_and_crc() {
        let header_bytes = vec![0u8; GptHeader::HEADER_SIZE];
        assert!(GptHeader::from_bytes(&header_bytes).is_none());

        let header = GptHeader {
            revision: GptHeader::REVISION,
            header_size: GptHeader::HEADER_SIZE as u32,
            header_crc32: 0,
            current_lba: 1,
            backup_lba: 999,
            first_usable_lba: 34,
            last_usable_lba: 966,
            disk_guid: Uuid::new_v4(),
            partition_entries_lba: 2,
            num_partition_entries: 128,
            partition_entry_size: 128,
            partition_entries_crc32: crc32fast::hash(&[0u8; 128 * 128]),
        };
        let mut bytes = header.to_bytes(512);
        let parsed = GptHeader::from_bytes(&bytes).unwrap();
        assert!(parsed.verify_header_crc32(&bytes));
        assert!(parsed.verify_partition_entries_crc32(&[0u8; 128 * 128]));
        assert_eq!(parsed.disk_guid, header.disk_guid);

        bytes[40] ^= 1;
        assert!(!parsed.verify_header_crc32(&bytes));
    }

    #[test]
    fn test_attrs_text() {
        let attrs = (1 << ATTR_REQUIRED) | (1 << ATTR_LEGACYBOOT) | (1 << 48) | (1 << 52);
        let text = attrs_to_string(attrs);
        assert_eq!(text, "RequiredPartition LegacyBIOSBootable GUID:48,52");
        assert_eq!(attrs_from_string(&text).unwrap(), attrs);
        assert_eq!(attrs_from_string("").unwrap(), 0);
        assert!(attrs_from_string("GUID:12").is_err());
        assert!(attrs_from_string("Bogus").is_err());
    }
}
