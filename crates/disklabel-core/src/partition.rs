//! Label independent partition description

use crate::field::{FieldFormat, FieldId};
use crate::parttype::PartType;
use crate::size::size_to_human_string;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::cmp::Ordering;
use std::fmt;

/// One partition (or free-space region) of a label
///
/// Offsets are in sectors. Either the size or the end is stored; setting one
/// clears the other so they never disagree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    pub partno: Option<usize>,
    /// Container partition this one is nested in
    pub parent_partno: Option<usize>,
    pub start: Option<u64>,
    size: Option<u64>,
    end: Option<u64>,
    pub parttype: Option<PartType>,
    pub name: Option<String>,
    pub uuid: Option<String>,
    pub attrs: Option<String>,
    /// CHS address of the first sector, as displayed
    pub start_addr: Option<String>,
    /// CHS address of the last sector, as displayed
    pub end_addr: Option<String>,
    pub fsize: u64,
    pub bsize: u64,
    pub cpg: u64,
    pub boot: bool,
    pub used: bool,
    pub container: bool,
    pub freespace: bool,
    pub start_follow_default: bool,
    pub end_follow_default: bool,
    pub partno_follow_default: bool,
}

impl Partition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every field
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn set_start(&mut self, start: u64) {
        self.start = Some(start);
    }

    pub fn start(&self) -> Option<u64> {
        self.start
    }

    /// Set the size in sectors; clears an explicit end
    pub fn set_size(&mut self, size: u64) {
        self.size = Some(size);
        self.end = None;
    }

    /// Set the last sector; clears an explicit size
    pub fn set_end(&mut self, end: u64) {
        self.end = Some(end);
        self.size = None;
    }

    /// Size in sectors, derived from start and end if only those are known
    pub fn size(&self) -> Option<u64> {
        match (self.size, self.start, self.end) {
            (Some(size), _, _) => Some(size),
            (None, Some(start), Some(end)) if end >= start => Some(end - start + 1),
            _ => None,
        }
    }

    /// Last sector, derived from start and size if only those are known
    pub fn end(&self) -> Option<u64> {
        match (self.end, self.start, self.size) {
            (Some(end), _, _) => Some(end),
            (None, Some(start), Some(size)) if size > 0 => Some(start + size - 1),
            _ => None,
        }
    }

    /// True if the end was given explicitly rather than as a size
    pub fn has_explicit_end(&self) -> bool {
        self.end.is_some()
    }

    /// True if the size was given explicitly rather than as an end
    pub fn has_explicit_size(&self) -> bool {
        self.size.is_some()
    }

    pub fn set_partno(&mut self, partno: usize) {
        self.partno = Some(partno);
        self.partno_follow_default = false;
    }

    pub fn unset_partno(&mut self) {
        self.partno = None;
    }

    pub fn set_type(&mut self, parttype: PartType) {
        self.parttype = Some(parttype);
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn set_uuid(&mut self, uuid: impl Into<String>) {
        self.uuid = Some(uuid.into());
    }

    pub fn set_attrs(&mut self, attrs: impl Into<String>) {
        self.attrs = Some(attrs.into());
    }

    pub fn start_follow_default(&mut self, enable: bool) {
        self.start_follow_default = enable;
    }

    pub fn end_follow_default(&mut self, enable: bool) {
        self.end_follow_default = enable;
    }

    pub fn partno_follow_default(&mut self, enable: bool) {
        self.partno_follow_default = enable;
    }

    /// True if the start should be recomputed when committed
    pub fn start_is_default(&self) -> bool {
        self.start_follow_default || self.start.is_none()
    }

    /// True if the end should be recomputed when committed
    pub fn end_is_default(&self) -> bool {
        self.end_follow_default || (self.size.is_none() && self.end.is_none())
    }

    pub fn is_nested(&self) -> bool {
        self.parent_partno.is_some()
    }

    pub fn is_container(&self) -> bool {
        self.container
    }

    pub fn is_used(&self) -> bool {
        self.used
    }

    pub fn is_bootable(&self) -> bool {
        self.boot
    }

    pub fn is_freespace(&self) -> bool {
        self.freespace
    }

    /// True if both partitions share at least one sector
    pub fn overlaps(&self, other: &Partition) -> bool {
        match (self.start, self.end(), other.start, other.end()) {
            (Some(a0), Some(a1), Some(b0), Some(b1)) => a0 <= b1 && b0 <= a1,
            _ => false,
        }
    }

    /// Render one column as text, `None` if the partition has no value for it
    pub fn to_field_string(&self, id: FieldId, fmt: &FieldFormat) -> Option<String> {
        let partno = self.partno.unwrap_or(0);
        match id {
            FieldId::Device => Some(if self.freespace {
                "Free space".to_string()
            } else if fmt.inchars_partno {
                char::from(b'a' + (partno % 26) as u8).to_string()
            } else {
                partname(&fmt.dev_path, partno + 1)
            }),
            FieldId::Boot => Some(if self.boot { "*" } else { " " }.to_string()),
            FieldId::Start => self.start.map(|s| fmt.cround(s).to_string()),
            FieldId::End => self.end().map(|e| fmt.cround(e).to_string()),
            FieldId::Sectors => self.size().map(|s| s.to_string()),
            FieldId::Cylinders => self.size().map(|s| fmt.cround(s).to_string()),
            FieldId::Size => self.size().map(|s| {
                let bytes = s * fmt.sector_size;
                if fmt.details {
                    bytes.to_string()
                } else {
                    size_to_human_string(bytes)
                }
            }),
            FieldId::Type => self.parttype.as_ref().map(|t| t.name.clone()),
            FieldId::TypeId => self.parttype.as_ref().map(PartType::id_string),
            FieldId::Bsize => Some(self.bsize.to_string()),
            FieldId::Fsize => Some(self.fsize.to_string()),
            FieldId::Cpg => Some(self.cpg.to_string()),
            FieldId::Uuid => self.uuid.clone(),
            FieldId::Name => self.name.clone(),
            FieldId::Attr => self.attrs.clone(),
            FieldId::Saddr => self.start_addr.clone(),
            FieldId::Eaddr => self.end_addr.clone(),
        }
    }
}

impl Serialize for Partition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("Partition", 14)?;
        st.serialize_field("partno", &self.partno)?;
        st.serialize_field("parent_partno", &self.parent_partno)?;
        st.serialize_field("start", &self.start)?;
        st.serialize_field("size", &self.size())?;
        st.serialize_field("end", &self.end())?;
        st.serialize_field("type", &self.parttype)?;
        st.serialize_field("name", &self.name)?;
        st.serialize_field("uuid", &self.uuid)?;
        st.serialize_field("attrs", &self.attrs)?;
        st.serialize_field("boot", &self.boot)?;
        st.serialize_field("used", &self.used)?;
        st.serialize_field("container", &self.container)?;
        st.serialize_field("nested", &self.is_nested())?;
        st.serialize_field("freespace", &self.freespace)?;
        st.end()
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.partno {
            Some(n) => write!(f, "#{}", n + 1)?,
            None => write!(f, "#-")?,
        }
        write!(
            f,
            " [{}-{}]",
            self.start.map_or("?".to_string(), |s| s.to_string()),
            self.end().map_or("?".to_string(), |e| e.to_string())
        )?;
        if let Some(ref t) = self.parttype {
            write!(f, " {}", t)?;
        }
        Ok(())
    }
}

/// Order by start offset; partitions without a start sort first
pub fn cmp_start(a: &Partition, b: &Partition) -> Ordering {
    a.start.cmp(&b.start)
}

/// Order by partition number
pub fn cmp_partno(a: &Partition, b: &Partition) -> Ordering {
    a.partno.cmp(&b.partno)
}

/// Partition device name for the 1-based partition number `partno`
///
/// `sda` -> `sda1`, `nvme0n1` -> `nvme0n1p1`, `/dev/disk/by-id/X` ->
/// `/dev/disk/by-id/X-part1`.
pub fn partname(dev: &str, partno: usize) -> String {
    if dev.is_empty() {
        return partno.to_string();
    }
    let mut base = dev;
    let mut sep = if dev.ends_with(|c: char| c.is_ascii_digit()) {
        "p"
    } else {
        ""
    };
    if let Some(stripped) = dev.strip_suffix("disc") {
        base = stripped;
        sep = "part";
    }
    if dev.starts_with("/dev/disk/by-id") || dev.starts_with("/dev/disk/by-path") {
        sep = "-part";
    }
    format!("{}{}{}", base, sep, partno)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_end_exclusive() {
        let mut pa = Partition::new();
        pa.set_start(2048);
        pa.set_size(100_000);
        assert_eq!(pa.end(), Some(2048 + 100_000 - 1));

        pa.set_end(4095);
        assert_eq!(pa.size(), Some(2048));
        assert!(!pa.has_explicit_size());
        assert!(pa.has_explicit_end());
    }

    #[test]
    fn test_defaults() {
        let mut pa = Partition::new();
        assert!(pa.start_is_default());
        assert!(pa.end_is_default());
        pa.set_start(34);
        pa.set_size(10);
        assert!(!pa.start_is_default());
        assert!(!pa.end_is_default());
        pa.start_follow_default(true);
        assert!(pa.start_is_default());
    }

    #[test]
    fn test_partname() {
        assert_eq!(partname("/dev/sda", 1), "/dev/sda1");
        assert_eq!(partname("/dev/nvme0n1", 2), "/dev/nvme0n1p2");
        assert_eq!(partname("/dev/disk/by-id/ata-X", 3), "/dev/disk/by-id/ata-X-part3");
        assert_eq!(partname("/dev/ide/host0/disc", 1), "/dev/ide/host0/part1");
        assert_eq!(partname("", 4), "4");
    }

    #[test]
    fn test_to_field_string() {
        let mut pa = Partition::new();
        pa.set_partno(0);
        pa.set_start(2048);
        pa.set_size(100_000);
        pa.boot = true;
        pa.used = true;

        let fmt = FieldFormat {
            dev_path: "/dev/sdb".to_string(),
            units_per_sector: 1,
            sector_size: 512,
            ..Default::default()
        };
        assert_eq!(pa.to_field_string(FieldId::Device, &fmt).unwrap(), "/dev/sdb1");
        assert_eq!(pa.to_field_string(FieldId::End, &fmt).unwrap(), "102047");
        assert_eq!(pa.to_field_string(FieldId::Size, &fmt).unwrap(), "48.8M");
        assert_eq!(pa.to_field_string(FieldId::Boot, &fmt).unwrap(), "*");
        assert!(pa.to_field_string(FieldId::Uuid, &fmt).is_none());

        let details = FieldFormat {
            details: true,
            inchars_partno: true,
            ..fmt
        };
        assert_eq!(pa.to_field_string(FieldId::Size, &details).unwrap(), "51200000");
        assert_eq!(pa.to_field_string(FieldId::Device, &details).unwrap(), "a");
    }

    #[test]
    fn test_overlaps() {
        let mut a = Partition::new();
        a.set_start(100);
        a.set_size(100);
        let mut b = Partition::new();
        b.set_start(199);
        b.set_size(10);
        assert!(a.overlaps(&b));
        b.set_start(200);
        assert!(!a.overlaps(&b));
        assert_eq!(cmp_start(&a, &b), Ordering::Less);
    }
}
