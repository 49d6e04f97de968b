//! GPT (GUID Partition Table) partition table implementation

pub mod types;

use crate::context::{Context, Disk};
use crate::dos::types::TYPE_GPT_PROTECTIVE;
use crate::dos::{BOOT_SIGNATURE, BOOT_SIGNATURE_OFFSET, MBR_SIZE, PARTITION_TABLE_OFFSET};
use crate::label::{Label, LabelKind, LabelOps, LabelState};
use crate::planner::{self, Grid};
use disklabel_core::{
    free_runs, limits, parttype, size_to_human_string, Error, Field, FieldId, PartType, Partition,
    Result,
};
use types::{
    attrs_from_string, attrs_to_string, GptHeader, GptPartitionEntry, ATTR_GUID_FIRST,
    ATTR_LEGACYBOOT, ATTR_NOBLOCK, ATTR_REQUIRED, GPT_PARTTYPES, LINUX_FILESYSTEM,
};
use uuid::Uuid;

/// Default number of entries in the partition array
pub const DEFAULT_ENTRIES: u32 = 128;

/// Flags understood by [`LabelOps::toggle_part_flag`]
pub const GPT_FLAG_REQUIRED: u64 = 1;
pub const GPT_FLAG_NOBLOCK: u64 = 2;
pub const GPT_FLAG_LEGACYBOOT: u64 = 3;
/// Asks which of the type specific bits 48-63 to toggle
pub const GPT_FLAG_GUIDSPECIFIC: u64 = 4;

static GPT_FIELDS: &[Field] = &[
    Field::text(FieldId::Device, "Device", 10.0),
    Field::number(FieldId::Start, "Start", 12.0),
    Field::number(FieldId::End, "End", 12.0),
    Field::number(FieldId::Sectors, "Sectors", 12.0),
    Field::number(FieldId::Size, "Size", 6.0).eyecandy(),
    Field::text(FieldId::Type, "Type", 0.1).eyecandy(),
    Field::text(FieldId::TypeId, "Type-UUID", 36.0).detail(),
    Field::text(FieldId::Uuid, "UUID", 36.0).detail(),
    Field::text(FieldId::Name, "Name", 0.2).detail(),
    Field::text(FieldId::Attr, "Attrs", 0.0).detail(),
];

fn upper(uuid: &Uuid) -> String {
    uuid.hyphenated().to_string().to_uppercase()
}

fn parse_guid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text.trim())
        .map_err(|_| Error::invalid_argument(format!("'{}' is not a valid GUID", text.trim())))
}

/// Sectors needed for `nents` entries
fn entry_sectors(nents: u32, sector_size: u64) -> u64 {
    (nents as u64 * GptPartitionEntry::ENTRY_SIZE as u64).div_ceil(sector_size.max(1))
}

/// Protective MBR covering the whole disk
fn protective_mbr(total: u64, sector_size: u64) -> Vec<u8> {
    let mut mbr = vec![0u8; (sector_size as usize).max(MBR_SIZE)];
    let e = PARTITION_TABLE_OFFSET;
    mbr[e + 1..e + 4].copy_from_slice(&[0x00, 0x02, 0x00]);
    mbr[e + 4] = TYPE_GPT_PROTECTIVE;
    mbr[e + 5..e + 8].copy_from_slice(&[0xff, 0xff, 0xff]);
    mbr[e + 8..e + 12].copy_from_slice(&1u32.to_le_bytes());
    let size = total.saturating_sub(1).min(u32::MAX as u64) as u32;
    mbr[e + 12..e + 16].copy_from_slice(&size.to_le_bytes());
    mbr[BOOT_SIGNATURE_OFFSET..BOOT_SIGNATURE_OFFSET + 2]
        .copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());
    mbr
}

/// `Some(hybrid)` when `buf` is an MBR with a GPT protective entry
fn pmbr_kind(buf: &[u8]) -> Option<bool> {
    if buf.len() < MBR_SIZE
        || u16::from_le_bytes([buf[BOOT_SIGNATURE_OFFSET], buf[BOOT_SIGNATURE_OFFSET + 1]])
            != BOOT_SIGNATURE
    {
        return None;
    }
    let types: Vec<u8> = (0..4)
        .map(|i| buf[PARTITION_TABLE_OFFSET + i * 16 + 4])
        .collect();
    if !types.contains(&TYPE_GPT_PROTECTIVE) {
        return None;
    }
    Some(types.iter().any(|&t| t != 0 && t != TYPE_GPT_PROTECTIVE))
}

/// GUID partition table
///
/// ```text
/// LBA 0:     Protective MBR
/// LBA 1:     Primary GPT header
/// LBA 2..:   Partition entry array (128 entries by default)
/// ...        Usable disk space
/// Last-N..:  Backup partition entry array
/// Last:      Backup GPT header
/// ```
///
/// Only the values that survive a rewrite are kept; header locations and
/// checksums are recomputed on write.
#[derive(Debug, Clone)]
pub struct GptLabel {
    state: LabelState,
    pmbr: Vec<u8>,
    disk_guid: Uuid,
    first_usable: u64,
    last_usable: u64,
    entries: Vec<GptPartitionEntry>,
}

impl Default for GptLabel {
    fn default() -> Self {
        Self::new()
    }
}

impl GptLabel {
    pub fn new() -> Self {
        Self {
            state: LabelState::default(),
            pmbr: Vec::new(),
            disk_guid: Uuid::nil(),
            first_usable: 0,
            last_usable: 0,
            entries: Vec::new(),
        }
    }

    /// Get the disk GUID
    pub fn disk_guid(&self) -> Uuid {
        self.disk_guid
    }

    pub fn first_usable_lba(&self) -> u64 {
        self.first_usable
    }

    pub fn last_usable_lba(&self) -> u64 {
        self.last_usable
    }

    pub fn nentries(&self) -> u32 {
        self.entries.len() as u32
    }

    /// The MBR holds real partitions next to the protective one
    pub fn is_hybrid(&self) -> bool {
        pmbr_kind(&self.pmbr) == Some(true)
    }

    fn refresh_counts(&mut self) {
        self.state.nparts_max = self.entries.len();
        self.state.nparts_cur = self.entries.iter().filter(|e| !e.is_unused()).count();
    }

    fn used_ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.entries
            .iter()
            .filter(|e| !e.is_unused())
            .map(|e| (e.first_lba, e.last_lba))
    }

    fn entry(&self, n: usize) -> Result<&GptPartitionEntry> {
        self.entries
            .get(n)
            .filter(|e| !e.is_unused())
            .ok_or_else(|| Error::not_found(format!("partition {} is not used", n + 1)))
    }

    fn entry_mut(&mut self, n: usize) -> Result<&mut GptPartitionEntry> {
        self.entries
            .get_mut(n)
            .filter(|e| !e.is_unused())
            .ok_or_else(|| Error::not_found(format!("partition {} is not used", n + 1)))
    }

    fn type_guid(t: &PartType) -> Result<Uuid> {
        let typestr = t.typestr().ok_or_else(|| {
            Error::unknown_type(format!("type '{}' is not valid for a GPT label", t.id_string()))
        })?;
        let guid = parse_guid(typestr)?;
        if guid.is_nil() {
            return Err(Error::unknown_type("the nil GUID marks an unused entry"));
        }
        Ok(guid)
    }

    /// Read and check one header and its entry array
    fn read_header(disk: &Disk, lba: u64) -> Result<(GptHeader, Vec<GptPartitionEntry>)> {
        let ss = disk.sector_size();
        let buf = disk.read_sectors(lba, 1)?;
        let h = GptHeader::from_bytes(&buf)
            .ok_or_else(|| Error::invalid_label(format!("no GPT signature at LBA {}", lba)))?;
        if h.header_size as u64 > ss {
            return Err(Error::invalid_label(format!("header size {} too big", h.header_size)));
        }
        if !h.verify_header_crc32(&buf) {
            return Err(Error::ChecksumVerification(format!(
                "GPT header at LBA {}",
                lba
            )));
        }
        if h.current_lba != lba {
            return Err(Error::invalid_label(format!(
                "header at LBA {} claims to be at {}",
                lba, h.current_lba
            )));
        }
        if h.partition_entry_size as usize != GptPartitionEntry::ENTRY_SIZE {
            return Err(Error::invalid_label(format!(
                "unsupported entry size {}",
                h.partition_entry_size
            )));
        }
        if h.first_usable_lba > h.last_usable_lba || h.last_usable_lba >= disk.total_sectors() {
            return Err(Error::invalid_label("usable range outside the device"));
        }

        let bytes = limits::validate_allocation_size(
            h.entries_bytes() as u64,
            limits::MAX_ALLOCATION_SIZE,
            "GPT entry array",
        )?;
        let raw = disk.read_sectors(h.partition_entries_lba, (bytes as u64).div_ceil(ss))?;
        if !h.verify_partition_entries_crc32(&raw) {
            return Err(Error::ChecksumVerification(format!(
                "GPT entry array of header at LBA {}",
                lba
            )));
        }
        let entries = raw[..bytes]
            .chunks_exact(GptPartitionEntry::ENTRY_SIZE)
            .map(GptPartitionEntry::from_bytes)
            .collect::<Result<Vec<_>>>()?;
        Ok((h, entries))
    }

    fn header(&self, current: u64, backup: u64, entries_lba: u64, crc: u32) -> GptHeader {
        GptHeader {
            revision: GptHeader::REVISION,
            header_size: GptHeader::HEADER_SIZE as u32,
            header_crc32: 0,
            current_lba: current,
            backup_lba: backup,
            first_usable_lba: self.first_usable,
            last_usable_lba: self.last_usable,
            disk_guid: self.disk_guid,
            partition_entries_lba: entries_lba,
            num_partition_entries: self.nentries(),
            partition_entry_size: GptPartitionEntry::ENTRY_SIZE as u32,
            partition_entries_crc32: crc,
        }
    }

    /// Usable range for `nents` entries on `disk`
    fn default_range(disk: &Disk, nents: u32) -> Result<(u64, u64)> {
        let esects = entry_sectors(nents, disk.sector_size());
        let first = 2 + esects;
        let last = disk
            .total_sectors()
            .checked_sub(2 + esects)
            .filter(|&last| last >= first)
            .ok_or_else(|| Error::no_space("device is too small for a GPT label"))?;
        Ok((first, last))
    }

    fn header_number(disk: &Disk, name: &str) -> Result<Option<u64>> {
        disk.script_header(name)
            .map(|v| {
                v.trim().parse::<u64>().map_err(|_| {
                    Error::invalid_argument(format!("header '{}': '{}' is not a number", name, v))
                })
            })
            .transpose()
    }

    pub fn set_name(&mut self, disk: &Disk, n: usize, name: Option<&str>) -> Result<()> {
        let old = self.entry(n)?.name.clone();
        let new = match name {
            Some(name) => name.to_string(),
            None => disk.ask_string("New name", Some(&old))?,
        };
        GptPartitionEntry::check_name(&new)?;
        self.entry_mut(n)?.name = new.clone();
        self.state.changed = true;
        disk.info(format!(
            "Partition name changed from '{}' to '{}'.",
            old, new
        ));
        Ok(())
    }

    pub fn set_uuid(&mut self, disk: &Disk, n: usize, uuid: Option<&str>) -> Result<()> {
        let old = self.entry(n)?.unique_partition_guid;
        let text = match uuid {
            Some(text) => text.to_string(),
            None => disk.ask_string("New UUID (in 8-4-4-4-12 format)", Some(&upper(&old)))?,
        };
        let new = parse_guid(&text)?;
        self.entry_mut(n)?.unique_partition_guid = new;
        self.state.changed = true;
        disk.info(format!(
            "Partition UUID changed from {} to {}.",
            upper(&old),
            upper(&new)
        ));
        Ok(())
    }

    pub fn partition_attrs(&self, n: usize) -> Result<u64> {
        Ok(self.entry(n)?.attributes)
    }

    pub fn set_partition_attrs(&mut self, n: usize, attrs: u64) -> Result<()> {
        self.entry_mut(n)?.attributes = attrs;
        self.state.changed = true;
        Ok(())
    }

    /// Resize the entry array; used entries must stay in it
    pub fn set_nentries(&mut self, disk: &Disk, nents: u32) -> Result<()> {
        let highest = self.entries.iter().rposition(|e| !e.is_unused());
        if nents == 0 || highest.is_some_and(|h| h >= nents as usize) {
            return Err(Error::out_of_range(format!(
                "the partition table must have at least {} entries",
                highest.map_or(1, |h| h + 1)
            )));
        }
        let (first, last) = Self::default_range(disk, nents)?;
        if let Some((s, e)) = self.used_ranges().find(|&(s, e)| s < first || e > last) {
            return Err(Error::out_of_range(format!(
                "partition {}-{} is outside of the new usable range {}-{}",
                s, e, first, last
            )));
        }
        let old = self.nentries();
        self.entries.resize(nents as usize, GptPartitionEntry::default());
        self.first_usable = first;
        self.last_usable = last;
        self.refresh_counts();
        self.state.changed = true;
        disk.info(format!(
            "Partition table length changed from {} to {}.",
            old, nents
        ));
        Ok(())
    }
}

impl LabelOps for GptLabel {
    fn kind(&self) -> LabelKind {
        LabelKind::Gpt
    }

    fn state(&self) -> &LabelState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut LabelState {
        &mut self.state
    }

    fn fields(&self) -> &'static [Field] {
        GPT_FIELDS
    }

    fn probe(&mut self, disk: &mut Disk) -> Result<bool> {
        if pmbr_kind(disk.firstsector()).is_none() {
            return Ok(false);
        }
        let last = disk.total_sectors().saturating_sub(1);
        let primary = Self::read_header(disk, 1);
        let backup_lba = primary.as_ref().map_or(last, |(h, _)| h.backup_lba);
        let backup = Self::read_header(disk, backup_lba);

        let (header, entries, changed) = match (primary, backup) {
            (Ok((h, e)), Ok(_)) => (h, e, false),
            (Ok((h, e)), Err(err)) => {
                tracing::debug!(error = %err, "backup GPT header unusable");
                disk.warnx(
                    "The backup GPT table is corrupt, but the primary appears OK, so that will be used.",
                );
                (h, e, true)
            }
            (Err(err), Ok((h, e))) => {
                tracing::debug!(error = %err, "primary GPT header unusable");
                disk.warnx(
                    "The primary GPT table is corrupt, but the backup appears OK, so that will be used.",
                );
                (h, e, true)
            }
            (Err(perr), Err(berr)) => {
                tracing::debug!(primary = %perr, backup = %berr, "no usable GPT header");
                return Ok(false);
            }
        };

        self.deinit();
        self.pmbr = disk.firstsector().to_vec();
        self.disk_guid = header.disk_guid;
        self.first_usable = header.first_usable_lba;
        self.last_usable = header.last_usable_lba;
        self.entries = entries;
        self.refresh_counts();
        self.state.changed = changed;
        if self.is_hybrid() {
            tracing::debug!("hybrid MBR detected");
        }
        tracing::debug!(
            guid = %self.disk_guid,
            entries = self.entries.len(),
            used = self.state.nparts_cur,
            "found GPT label"
        );
        Ok(true)
    }

    fn create(&mut self, disk: &mut Disk) -> Result<()> {
        self.deinit();
        let nents = match Self::header_number(disk, "table-length")? {
            Some(n) => u32::try_from(n)
                .ok()
                .filter(|&n| n > 0)
                .ok_or_else(|| Error::out_of_range(format!("table-length {} is not usable", n)))?,
            None => DEFAULT_ENTRIES,
        };
        let (mut first, mut last) = Self::default_range(disk, nents)?;
        if let Some(f) = Self::header_number(disk, "first-lba")? {
            if f < first || f > last {
                return Err(Error::out_of_range(format!("first-lba {} is out of range", f)));
            }
            first = f;
        }
        if let Some(l) = Self::header_number(disk, "last-lba")? {
            if l < first || l > last {
                return Err(Error::out_of_range(format!("last-lba {} is out of range", l)));
            }
            last = l;
        }

        self.disk_guid = match disk.script_header("label-id") {
            Some(id) => parse_guid(id)?,
            None => Uuid::new_v4(),
        };
        self.first_usable = first;
        self.last_usable = last;
        self.entries = vec![GptPartitionEntry::default(); nents as usize];
        self.refresh_counts();
        disk.info(format!(
            "Created a new GPT disklabel (GUID: {}).",
            upper(&self.disk_guid)
        ));
        Ok(())
    }

    fn verify(&self, disk: &Disk) -> Result<usize> {
        let mut nerrors = 0;
        let used: Vec<(usize, &GptPartitionEntry)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_unused())
            .collect();

        if self.last_usable >= disk.total_sectors() {
            disk.warnx("The last usable GPT sector is beyond the end of the device.");
            nerrors += 1;
        }
        for (k, &(i, e)) in used.iter().enumerate() {
            if e.first_lba > e.last_lba {
                disk.warnx(format!("Partition {}: start is after end.", i + 1));
                nerrors += 1;
            }
            if e.first_lba < self.first_usable {
                disk.warnx(format!(
                    "Partition {} starts before the first usable sector {}.",
                    i + 1,
                    self.first_usable
                ));
                nerrors += 1;
            }
            if e.last_lba > self.last_usable {
                disk.warnx(format!("Partition {} is too big for the disk.", i + 1));
                nerrors += 1;
            }
            for &(j, o) in &used[k + 1..] {
                if e.first_lba <= o.last_lba && o.first_lba <= e.last_lba {
                    disk.warnx(format!("Partition {} overlaps with partition {}.", i + 1, j + 1));
                    nerrors += 1;
                }
            }
            if !disk.topology().lba_is_phy_aligned(e.first_lba) {
                disk.warnx(format!(
                    "Partition {}: does not start on physical sector boundary.",
                    i + 1
                ));
            }
        }

        if nerrors == 0 {
            disk.info("No errors detected.");
            disk.info("Header version: 1.0");
            disk.info(format!(
                "Using {} out of {} partitions.",
                used.len(),
                self.entries.len()
            ));
        } else {
            disk.warnx(format!("{} errors detected.", nerrors));
        }
        let free = free_runs(self.first_usable, self.last_usable, self.used_ranges());
        let nfree: u64 = free.iter().map(|&(s, e)| e - s + 1).sum();
        disk.info(format!(
            "A total of {} free sectors is available in {} segment{}.",
            nfree,
            free.len(),
            if free.len() == 1 { "" } else { "s" }
        ));
        Ok(nerrors)
    }

    fn write(&mut self, disk: &mut Disk) -> Result<()> {
        let ss = disk.sector_size();
        let total = disk.total_sectors();
        let esects = entry_sectors(self.nentries(), ss);
        let backup_lba = total.saturating_sub(1);
        let backup_entries = backup_lba.saturating_sub(esects);
        if self.first_usable < 2 + esects || self.last_usable >= backup_entries {
            return Err(Error::invalid_label(format!(
                "usable range {}-{} does not fit the device",
                self.first_usable, self.last_usable
            )));
        }

        let array_len = limits::u64_to_usize(esects * ss, "GPT entry array")?;
        let mut array = Vec::with_capacity(array_len);
        for e in &self.entries {
            array.extend_from_slice(&e.to_bytes());
        }
        let crc = crc32fast::hash(&array);
        array.resize(array_len, 0);

        let ss_len = limits::u64_to_usize(ss, "sector size")?;
        let primary = self.header(1, backup_lba, 2, crc);
        let backup = self.header(backup_lba, 1, backup_entries, crc);
        let mbr = if self.is_hybrid() {
            self.pmbr.clone()
        } else {
            protective_mbr(total, ss)
        };

        tracing::debug!(backup_lba, crc, hybrid = self.is_hybrid(), "writing GPT");
        disk.write_at(0, &mbr)?;
        disk.write_sectors(1, &primary.to_bytes(ss_len))?;
        disk.write_sectors(2, &array)?;
        disk.write_sectors(backup_entries, &array)?;
        disk.write_sectors(backup_lba, &backup.to_bytes(ss_len))?;

        disk.set_firstsector(mbr.clone());
        self.pmbr = mbr;
        Ok(())
    }

    fn list(&self, disk: &Disk) -> Result<()> {
        if !disk.is_details() {
            return Ok(());
        }
        let esects = entry_sectors(self.nentries(), disk.sector_size());
        disk.info(format!("First usable LBA: {}", self.first_usable));
        disk.info(format!("Last usable LBA: {}", self.last_usable));
        disk.info(format!(
            "Alternative LBA: {}",
            disk.total_sectors().saturating_sub(1)
        ));
        disk.info("Partition entries starting LBA: 2");
        disk.info(format!("Allocated partition entries: {}", self.nentries()));
        disk.info(format!("Partition entries ending LBA: {}", 1 + esects));
        Ok(())
    }

    fn locate(&self, disk: &Disk, n: usize) -> Result<(&'static str, u64, usize)> {
        if self.state.nparts_max == 0 {
            return Err(Error::invalid_operation("GPT label is not initialized"));
        }
        let ss = disk.sector_size();
        let esects = entry_sectors(self.nentries(), ss);
        let array = self.entries.len() * GptPartitionEntry::ENTRY_SIZE;
        let last = disk.total_sectors().saturating_sub(1);
        match n {
            0 => Ok(("PMBR", 0, MBR_SIZE)),
            1 => Ok(("GPT Header", ss, ss as usize)),
            2 => Ok(("GPT Entries", 2 * ss, array)),
            3 => Ok(("GPT Backup Entries", (last - esects) * ss, array)),
            4 => Ok(("GPT Backup Header", last * ss, ss as usize)),
            _ => Err(Error::not_found(format!("GPT label area {}", n))),
        }
    }

    fn deinit(&mut self) {
        let disabled = self.state.disabled;
        *self = Self::new();
        self.state.disabled = disabled;
    }

    fn reset_alignment(&self, disk: &mut Disk) {
        let first = if self.state.nparts_max > 0 {
            self.first_usable
        } else {
            2 + entry_sectors(DEFAULT_ENTRIES, disk.sector_size())
        };
        let topo = disk.topology_mut();
        if self.state.nparts_max > 0 || topo.first_lba < first {
            topo.first_lba = first;
        }
    }

    fn get_id(&self) -> Option<String> {
        (self.state.nparts_max > 0).then(|| upper(&self.disk_guid))
    }

    fn set_id(&mut self, disk: &Disk) -> Result<()> {
        let old = upper(&self.disk_guid);
        let answer = disk.ask_string("Enter new disk UUID (in 8-4-4-4-12 format)", Some(&old))?;
        let guid = parse_guid(&answer)?;
        self.disk_guid = guid;
        self.state.changed = true;
        disk.info(format!(
            "Disk identifier changed from {} to {}.",
            old,
            upper(&guid)
        ));
        Ok(())
    }

    fn get_part(&self, _disk: &Disk, n: usize) -> Result<Partition> {
        let e = self
            .entries
            .get(n)
            .ok_or_else(|| Error::out_of_range(format!("partition {} does not exist", n + 1)))?;
        let mut pa = Partition::new();
        pa.partno = Some(n);
        if e.is_unused() {
            return Ok(pa);
        }
        pa.used = true;
        pa.set_start(e.first_lba);
        pa.set_size(e.size_lba());
        pa.parttype = Some(parttype::from_string(GPT_PARTTYPES, &e.type_string()));
        pa.uuid = Some(upper(&e.unique_partition_guid));
        if !e.name.is_empty() {
            pa.name = Some(e.name.clone());
        }
        if e.attributes != 0 {
            pa.attrs = Some(attrs_to_string(e.attributes));
        }
        pa.boot = e.attributes & (1 << ATTR_LEGACYBOOT) != 0;
        Ok(pa)
    }

    fn part_is_used(&self, n: usize) -> bool {
        self.entries.get(n).is_some_and(|e| !e.is_unused())
    }

    fn add_part(&mut self, disk: &mut Disk, pa: Option<&Partition>) -> Result<usize> {
        if self.state.nparts_max == 0 {
            return Err(Error::invalid_operation("GPT label is not initialized"));
        }
        let n = self.next_partno(disk, pa)?;
        if self.part_is_used(n) {
            return Err(Error::duplicate(format!("partition {} is already defined", n + 1)));
        }

        let type_guid = match pa.and_then(|p| p.parttype.as_ref()) {
            Some(t) => Self::type_guid(t)?,
            None => parse_guid(LINUX_FILESYSTEM)?,
        };
        let name = pa.and_then(|p| p.name.clone()).unwrap_or_default();
        GptPartitionEntry::check_name(&name)?;
        let unique = match pa.and_then(|p| p.uuid.as_deref()) {
            Some(text) => parse_guid(text)?,
            None => Uuid::new_v4(),
        };
        let mut attributes = match pa.and_then(|p| p.attrs.as_deref()) {
            Some(text) => attrs_from_string(text)?,
            None => 0,
        };
        if pa.is_some_and(|p| p.boot) {
            attributes |= 1 << ATTR_LEGACYBOOT;
        }

        let runs = free_runs(self.first_usable, self.last_usable, self.used_ranges());
        let (start, end) = planner::place(disk, &runs, pa, Grid::Grain)?;

        self.entries[n] = GptPartitionEntry {
            partition_type_guid: type_guid,
            unique_partition_guid: unique,
            first_lba: start,
            last_lba: end,
            attributes,
            name,
        };
        self.refresh_counts();
        self.state.changed = true;

        let t = parttype::from_string(GPT_PARTTYPES, &upper(&type_guid));
        disk.info(format!(
            "Created a new partition {} of type '{}' and of size {}.",
            n + 1,
            t.name,
            size_to_human_string((end - start + 1) * disk.sector_size())
        ));
        Ok(n)
    }

    fn del_part(&mut self, disk: &mut Disk, n: usize) -> Result<()> {
        *self.entry_mut(n)? = GptPartitionEntry::default();
        self.refresh_counts();
        self.state.changed = true;
        disk.info(format!("Partition {} has been deleted.", n + 1));
        Ok(())
    }

    fn set_part_type(&mut self, disk: &Disk, n: usize, t: &PartType) -> Result<()> {
        let guid = Self::type_guid(t)?;
        let entry = self.entry_mut(n)?;
        let old = parttype::from_string(GPT_PARTTYPES, &entry.type_string());
        entry.partition_type_guid = guid;
        self.state.changed = true;
        disk.info(format!(
            "Changed type of partition '{}' to '{}'.",
            old.name, t.name
        ));
        Ok(())
    }

    fn toggle_part_flag(&mut self, disk: &Disk, n: usize, flag: u64) -> Result<()> {
        let (bit, name) = match flag {
            GPT_FLAG_REQUIRED => (ATTR_REQUIRED, "RequiredPartition".to_string()),
            GPT_FLAG_NOBLOCK => (ATTR_NOBLOCK, "NoBlockIOProtocol".to_string()),
            GPT_FLAG_LEGACYBOOT => (ATTR_LEGACYBOOT, "LegacyBIOSBootable".to_string()),
            GPT_FLAG_GUIDSPECIFIC => {
                self.entry(n)?;
                let bit = disk.ask_number(
                    "Enter GUID specific bit",
                    ATTR_GUID_FIRST as u64,
                    ATTR_GUID_FIRST as u64,
                    63,
                )? as u32;
                (bit, format!("GUID specific bit {}", bit))
            }
            _ => return Err(Error::invalid_argument(format!("unknown GPT flag 0x{:x}", flag))),
        };
        let entry = self.entry_mut(n)?;
        entry.attributes ^= 1u64 << bit;
        let on = entry.attributes & (1u64 << bit) != 0;
        self.state.changed = true;
        disk.info(format!(
            "The {} flag on partition {} is {} now.",
            name,
            n + 1,
            if on { "enabled" } else { "disabled" }
        ));
        Ok(())
    }

    fn reorder(&mut self, _disk: &Disk) -> Result<bool> {
        let before = self.entries.clone();
        self.entries
            .sort_by_key(|e| (e.is_unused(), if e.is_unused() { 0 } else { e.first_lba }));
        Ok(self.entries != before)
    }

    fn usable_range(&self, _disk: &Disk) -> (u64, u64) {
        (self.first_usable, self.last_usable)
    }
}

impl Context {
    fn gpt_mut(&mut self) -> Result<(&mut Disk, &mut GptLabel)> {
        self.check_writable()?;
        match self.active_parts()? {
            (disk, Label::Gpt(gpt)) => Ok((disk, gpt)),
            _ => Err(Error::invalid_operation("not a GPT label")),
        }
    }

    fn gpt(&self) -> Result<&GptLabel> {
        self.label()
            .and_then(Label::as_gpt)
            .ok_or_else(|| Error::invalid_operation("not a GPT label"))
    }

    /// True when the active GPT label sits behind a hybrid MBR
    pub fn gpt_is_hybrid(&self) -> bool {
        self.gpt().is_ok_and(GptLabel::is_hybrid)
    }

    /// Rename partition `n`; `None` asks for the name
    pub fn gpt_partition_set_name(&mut self, n: usize, name: Option<&str>) -> Result<()> {
        let (disk, gpt) = self.gpt_mut()?;
        gpt.set_name(disk, n, name)
    }

    /// Change the unique GUID of partition `n`; `None` asks for it
    pub fn gpt_partition_set_uuid(&mut self, n: usize, uuid: Option<&str>) -> Result<()> {
        let (disk, gpt) = self.gpt_mut()?;
        gpt.set_uuid(disk, n, uuid)
    }

    pub fn gpt_get_partition_attrs(&self, n: usize) -> Result<u64> {
        self.gpt()?.partition_attrs(n)
    }

    pub fn gpt_set_partition_attrs(&mut self, n: usize, attrs: u64) -> Result<()> {
        let (_, gpt) = self.gpt_mut()?;
        gpt.set_partition_attrs(n, attrs)
    }

    /// Change the number of entries of the partition array
    pub fn gpt_set_npartitions(&mut self, nents: u32) -> Result<()> {
        let (disk, gpt) = self.gpt_mut()?;
        gpt.set_nentries(disk, nents)?;
        self.reset_alignment();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disklabel_core::DefaultAnswers;
    use std::fs::OpenOptions;
    use std::io::{Cursor, Seek, SeekFrom, Write};
    use tempfile::NamedTempFile;

    const MIB: u64 = 1024 * 1024;

    fn image(size: u64) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(size).unwrap();
        file
    }

    fn open(path: &std::path::Path, readonly: bool) -> Context {
        let mut cxt = Context::new();
        cxt.set_ask_handler(DefaultAnswers);
        cxt.assign_device(path, readonly).unwrap();
        cxt
    }

    fn template(size: u64) -> Partition {
        let mut pa = Partition::new();
        pa.start_follow_default(true);
        pa.partno_follow_default(true);
        pa.set_size(size);
        pa
    }

    #[test]
    fn test_create_add_write_reprobe() {
        let img = image(64 * MIB);
        let mut cxt = open(img.path(), false);
        cxt.create_disklabel(Some("gpt")).unwrap();
        assert_eq!(cxt.first_lba(), 34);

        let mut pa = template(20480);
        pa.set_name("root");
        assert_eq!(cxt.add_partition(Some(&pa)).unwrap(), 0);
        cxt.write_disklabel().unwrap();
        let id = cxt.get_disklabel_id().unwrap();
        assert_eq!(cxt.disk().firstsector()[0x1BE + 4], 0xEE);
        cxt.deassign_device(false).unwrap();

        let cxt = open(img.path(), true);
        assert!(cxt.is_label(LabelKind::Gpt));
        assert_eq!(cxt.get_disklabel_id().unwrap(), id);
        let pa = cxt.get_partition(0).unwrap();
        assert_eq!(pa.start, Some(2048));
        assert_eq!(pa.end(), Some(22527));
        assert_eq!(pa.name.as_deref(), Some("root"));
        assert_eq!(pa.parttype.unwrap().name, "Linux filesystem");
        assert!(!cxt.label().unwrap().is_changed());
    }

    #[test]
    fn test_backup_header_fallback() {
        let img = image(16 * MIB);
        let mut cxt = open(img.path(), false);
        cxt.create_disklabel(Some("gpt")).unwrap();
        cxt.add_partition(Some(&template(4096))).unwrap();
        cxt.write_disklabel().unwrap();
        cxt.deassign_device(true).unwrap();

        let mut f = OpenOptions::new().write(true).open(img.path()).unwrap();
        f.seek(SeekFrom::Start(512 + 40)).unwrap();
        f.write_all(&[0xff; 8]).unwrap();
        drop(f);

        let cxt = open(img.path(), true);
        assert!(cxt.is_label(LabelKind::Gpt));
        assert!(cxt.label().unwrap().is_changed());
        assert_eq!(cxt.get_partition(0).unwrap().size(), Some(4096));
    }

    #[test]
    fn test_no_pmbr_means_no_gpt() {
        let mut cxt = Context::new();
        cxt.assign_device_handle(Box::new(Cursor::new(vec![0u8; MIB as usize])), "img", true)
            .unwrap();
        assert!(!cxt.has_label());
    }

    #[test]
    fn test_device_too_small() {
        let mut cxt = Context::new();
        cxt.assign_device_handle(Box::new(Cursor::new(vec![0u8; 40 * 512])), "img", false)
            .unwrap();
        assert!(matches!(
            cxt.create_disklabel(Some("gpt")),
            Err(Error::NoSpace(_))
        ));
    }

    #[test]
    fn test_flags_and_attrs() {
        let img = image(16 * MIB);
        let mut cxt = open(img.path(), false);
        cxt.create_disklabel(Some("gpt")).unwrap();
        cxt.add_partition(Some(&template(2048))).unwrap();

        cxt.toggle_partition_flag(0, GPT_FLAG_LEGACYBOOT).unwrap();
        cxt.toggle_partition_flag(0, GPT_FLAG_GUIDSPECIFIC).unwrap();
        let pa = cxt.get_partition(0).unwrap();
        assert_eq!(pa.attrs.as_deref(), Some("LegacyBIOSBootable GUID:48"));
        assert!(pa.boot);

        cxt.toggle_partition_flag(0, GPT_FLAG_LEGACYBOOT).unwrap();
        assert_eq!(cxt.gpt_get_partition_attrs(0).unwrap(), 1 << 48);
        assert!(cxt.toggle_partition_flag(0, 9).is_err());
        assert!(cxt.toggle_partition_flag(1, GPT_FLAG_REQUIRED).is_err());
    }

    #[test]
    fn test_name_uuid_and_types() {
        let img = image(16 * MIB);
        let mut cxt = open(img.path(), false);
        cxt.create_disklabel(Some("gpt")).unwrap();
        cxt.add_partition(Some(&template(2048))).unwrap();

        cxt.gpt_partition_set_name(0, Some("data")).unwrap();
        assert!(cxt.gpt_partition_set_name(0, Some(&"n".repeat(40))).is_err());
        let uuid = "01234567-89AB-CDEF-0123-456789ABCDEF";
        cxt.gpt_partition_set_uuid(0, Some(uuid)).unwrap();
        let pa = cxt.get_partition(0).unwrap();
        assert_eq!(pa.name.as_deref(), Some("data"));
        assert_eq!(pa.uuid.as_deref(), Some(uuid));

        let dos_type = parttype::from_code(crate::dos::types::DOS_PARTTYPES, 0x83);
        assert!(cxt.set_partition_type(0, &dos_type).is_err());
        let swap = parttype::parse(GPT_PARTTYPES, "0657fd6d-a4ab-43c4-84e5-0933c84b4f4f").unwrap();
        cxt.set_partition_type(0, &swap).unwrap();
        assert_eq!(cxt.get_partition(0).unwrap().parttype.unwrap().name, "Linux swap");
    }

    #[test]
    fn test_locate_and_npartitions() {
        let img = image(16 * MIB);
        let mut cxt = open(img.path(), false);
        cxt.create_disklabel(Some("gpt")).unwrap();
        assert_eq!(cxt.locate_disklabel(1).unwrap(), ("GPT Header", 512, 512));
        assert_eq!(cxt.locate_disklabel(2).unwrap(), ("GPT Entries", 1024, 128 * 128));
        assert_eq!(
            cxt.locate_disklabel(4).unwrap().1,
            (cxt.total_sectors() - 1) * 512
        );
        assert!(cxt.locate_disklabel(5).is_err());

        let mut pa = template(2048);
        pa.set_partno(9);
        cxt.add_partition(Some(&pa)).unwrap();
        assert!(cxt.gpt_set_npartitions(4).is_err());
        cxt.gpt_set_npartitions(16).unwrap();
        assert_eq!(cxt.get_npartitions(), 16);
        assert_eq!(cxt.first_lba(), 6);
    }

    #[test]
    fn test_reorder_entries() {
        let img = image(16 * MIB);
        let mut cxt = open(img.path(), false);
        cxt.create_disklabel(Some("gpt")).unwrap();
        let mut late = template(2048);
        late.start_follow_default(false);
        late.set_start(8192);
        cxt.add_partition(Some(&late)).unwrap();
        cxt.add_partition(Some(&template(2048))).unwrap();

        assert!(cxt.get_partitions().unwrap().wrong_order());
        assert!(cxt.reorder_partitions().unwrap());
        assert_eq!(cxt.get_partition(0).unwrap().start, Some(2048));
        assert!(!cxt.get_partitions().unwrap().wrong_order());
    }
}
