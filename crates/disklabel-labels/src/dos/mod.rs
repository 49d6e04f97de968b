//! MBR (Master Boot Record) partition table implementation

pub mod types;

use crate::context::{Context, Disk};
use crate::label::{LabelKind, LabelOps, LabelState};
use crate::planner::{self, Grid};
use disklabel_core::{
    free_runs, parttype, size_to_human_string, Ask, Error, Field, FieldId, MenuAsk, NumberAsk,
    PartType, Partition, Result,
};
use std::collections::BTreeSet;
use types::{is_extended, DosEntry, DOS_PARTTYPES, TYPE_EMPTY, TYPE_EXTENDED, TYPE_LINUX};

/// The boot signature that must be present at offset 0x1FE
pub const BOOT_SIGNATURE: u16 = 0xAA55;

/// Size of the MBR in bytes (always 512)
pub const MBR_SIZE: usize = 512;

/// Offset of the first partition entry
pub const PARTITION_TABLE_OFFSET: usize = 0x1BE;

/// Offset of the disk signature
pub const DISK_SIGNATURE_OFFSET: usize = 0x1B8;

/// Offset of the boot signature
pub const BOOT_SIGNATURE_OFFSET: usize = 0x1FE;

/// Number of partition entries in MBR
pub const NUM_PRIMARIES: usize = 4;

/// Upper bound for primary plus logical partitions
pub const MAX_PARTITIONS: usize = 60;

/// Flag toggled by [`LabelOps::toggle_part_flag`]: the boot indicator
pub const DOS_FLAG_ACTIVE: u64 = 1;

static DOS_FIELDS: &[Field] = &[
    Field::text(FieldId::Device, "Device", 10.0),
    Field::text(FieldId::Boot, "Boot", 1.0),
    Field::number(FieldId::Start, "Start", 5.0),
    Field::number(FieldId::End, "End", 5.0),
    Field::number(FieldId::Sectors, "Sectors", 5.0),
    Field::number(FieldId::Cylinders, "Cylinders", 5.0),
    Field::number(FieldId::Size, "Size", 5.0).eyecandy(),
    Field::number(FieldId::TypeId, "Id", 2.0),
    Field::text(FieldId::Type, "Type", 0.1),
    Field::number(FieldId::Saddr, "Start-C/H/S", 1.0).detail(),
    Field::number(FieldId::Eaddr, "End-C/H/S", 1.0).detail(),
    Field::number(FieldId::Attr, "Attrs", 2.0).detail(),
];

fn has_boot_signature(buf: &[u8]) -> bool {
    buf.len() >= MBR_SIZE
        && u16::from_le_bytes([buf[BOOT_SIGNATURE_OFFSET], buf[BOOT_SIGNATURE_OFFSET + 1]])
            == BOOT_SIGNATURE
}

fn entry_at(buf: &[u8], i: usize) -> DosEntry {
    let off = PARTITION_TABLE_OFFSET + i * DosEntry::SIZE;
    DosEntry::from_bytes(&buf[off..off + DosEntry::SIZE])
}

fn put_entry(buf: &mut [u8], i: usize, entry: &DosEntry) {
    let off = PARTITION_TABLE_OFFSET + i * DosEntry::SIZE;
    buf[off..off + DosEntry::SIZE].copy_from_slice(&entry.to_bytes());
}

fn put_signature(buf: &mut [u8]) {
    buf[BOOT_SIGNATURE_OFFSET..BOOT_SIGNATURE_OFFSET + 2]
        .copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());
}

/// Parse a disk identifier, with or without `0x`
fn parse_disk_id(text: &str) -> Result<u32> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u32::from_str_radix(digits, 16)
        .map_err(|_| Error::invalid_argument(format!("'{}' is not a valid disk identifier", text)))
}

/// Logical partition: its EBR sector and the data entry stored there
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Logical {
    ebr: u64,
    entry: DosEntry,
}

impl Logical {
    fn start(&self) -> u64 {
        self.ebr + self.entry.start as u64
    }

    fn end(&self) -> u64 {
        self.start() + (self.entry.size as u64).max(1) - 1
    }
}

/// MBR partition table
///
/// Four primary slots; one of them may be an extended partition holding a
/// chain of EBRs, each describing one logical partition. Logical partitions
/// are numbered from 5 (index 4) in chain order.
#[derive(Debug, Clone)]
pub struct DosLabel {
    state: LabelState,
    mbr: Vec<u8>,
    primaries: [DosEntry; NUM_PRIMARIES],
    logicals: Vec<Logical>,
    ext: Option<usize>,
    disk_signature: u32,
}

impl Default for DosLabel {
    fn default() -> Self {
        Self::new()
    }
}

impl DosLabel {
    pub fn new() -> Self {
        Self {
            state: LabelState::default(),
            mbr: Vec::new(),
            primaries: [DosEntry::default(); NUM_PRIMARIES],
            logicals: Vec::new(),
            ext: None,
            disk_signature: 0,
        }
    }

    /// Get the disk signature
    pub fn disk_signature(&self) -> u32 {
        self.disk_signature
    }

    /// Index of the extended partition
    pub fn extended_index(&self) -> Option<usize> {
        self.ext
    }

    pub fn nlogicals(&self) -> usize {
        self.logicals.len()
    }

    /// Check if this MBR contains a GPT protective partition
    pub fn is_gpt_protective(&self) -> bool {
        self.primaries
            .iter()
            .any(|p| p.is_used() && p.sys_ind == types::TYPE_GPT_PROTECTIVE)
    }

    fn refresh_counts(&mut self) {
        self.state.nparts_max = NUM_PRIMARIES + self.logicals.len();
        self.state.nparts_cur =
            self.primaries.iter().filter(|p| p.is_used()).count() + self.logicals.len();
    }

    fn ext_range(&self) -> Option<(u64, u64)> {
        let p = &self.primaries[self.ext?];
        let start = p.start as u64;
        Some((start, start + (p.size as u64).max(1) - 1))
    }

    fn primary_range(&self, i: usize) -> Option<(u64, u64)> {
        let p = &self.primaries[i];
        p.is_used().then(|| {
            let start = p.start as u64;
            (start, start + p.size as u64 - 1)
        })
    }

    fn grid(&self, disk: &Disk) -> Grid {
        if disk.dos_compatible() {
            let geom = disk.geometry();
            Grid::Cylinder {
                spc: geom.sectors_per_cylinder(),
                track: geom.sectors,
            }
        } else {
            Grid::Grain
        }
    }

    /// Sectors between an EBR and its data
    fn ebr_gap(&self, disk: &Disk) -> u64 {
        if disk.dos_compatible() {
            disk.geometry().sectors.max(1)
        } else {
            disk.topology().grain_sectors()
        }
    }

    fn first_free_primary(&self) -> Option<usize> {
        (0..NUM_PRIMARIES).find(|&i| !self.primaries[i].is_used())
    }

    fn primary_runs(&self, disk: &Disk) -> Vec<(u64, u64)> {
        let (lo, hi) = self.usable_range(disk);
        free_runs(lo, hi, (0..NUM_PRIMARIES).filter_map(|i| self.primary_range(i)))
    }

    fn logical_runs(&self) -> Vec<(u64, u64)> {
        let Some((lo, hi)) = self.ext_range() else {
            return Vec::new();
        };
        free_runs(lo, hi, self.logicals.iter().map(|l| (l.ebr, l.end())))
    }

    fn can_add_logical(&self) -> bool {
        self.ext.is_some()
            && NUM_PRIMARIES + self.logicals.len() < MAX_PARTITIONS
            && self.logical_runs().iter().any(|&(s, e)| e > s)
    }

    /// The first EBR of the chain always sits at the start of the extended partition
    fn normalize_chain(&mut self) {
        let Some((ext_start, _)) = self.ext_range() else {
            return;
        };
        if let Some(first) = self.logicals.first_mut() {
            if first.ebr != ext_start {
                let start = first.start();
                first.ebr = ext_start;
                first.entry.start = (start - ext_start) as u32;
            }
        }
    }

    /// Type code for a new partition
    fn type_code(&self, pa: Option<&Partition>) -> Result<u8> {
        match pa.and_then(|p| p.parttype.as_ref()) {
            None => Ok(TYPE_LINUX),
            Some(t) => Self::checked_code(t),
        }
    }

    fn checked_code(t: &PartType) -> Result<u8> {
        if t.typestr().is_some() || t.code > 0xff {
            return Err(Error::unknown_type(format!(
                "type '{}' is not valid for a DOS label",
                t.id_string()
            )));
        }
        if t.code == TYPE_EMPTY as u32 {
            return Err(Error::unknown_type("type 0 means empty entry"));
        }
        Ok(t.code as u8)
    }

    /// Ask for one of the unused primary slots
    fn ask_primary(&self, disk: &Disk) -> Result<usize> {
        let free: Vec<usize> = (0..NUM_PRIMARIES)
            .filter(|&i| !self.primaries[i].is_used())
            .collect();
        let (Some(&first), Some(&last)) = (free.first(), free.last()) else {
            return Err(Error::no_space("all primary partitions are in use"));
        };
        let text = free
            .iter()
            .map(|i| (i + 1).to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut ask = Ask::Number(
            NumberAsk::new("Partition number")
                .with_range(first as u64 + 1, last as u64 + 1)
                .with_default(first as u64 + 1)
                .with_range_text(text),
        );
        disk.ask(&mut ask)?;
        let n = ask.number().map_or(first, |n| n.result as usize - 1);
        if !free.contains(&n) {
            disk.warnx(format!("Partition {} is already defined.", n + 1));
            return Err(Error::duplicate(format!("partition {} is already defined", n + 1)));
        }
        Ok(n)
    }

    /// Slot for a new partition and whether it must become the extended one
    fn choose_slot(&self, disk: &Disk, pa: Option<&Partition>) -> Result<(usize, bool)> {
        let next_logical = NUM_PRIMARIES + self.logicals.len();

        if let Some(pa) = pa {
            if let (Some(n), false) = (pa.partno, pa.partno_follow_default) {
                if n < NUM_PRIMARIES {
                    if self.primaries[n].is_used() {
                        return Err(Error::duplicate(format!(
                            "partition {} is already defined",
                            n + 1
                        )));
                    }
                    return Ok((n, false));
                }
                if self.ext.is_none() {
                    return Err(Error::invalid_argument(
                        "logical partitions need an extended partition",
                    ));
                }
                if n != next_logical {
                    return Err(Error::out_of_range(format!(
                        "next logical partition is {}, not {}",
                        next_logical + 1,
                        n + 1
                    )));
                }
                return Ok((n, false));
            }

            if !pa.start_is_default() {
                let start = pa.start.unwrap_or_default();
                if let Some((s, e)) = self.ext_range() {
                    if s < start && start <= e {
                        return Ok((next_logical, false));
                    }
                }
            }
            if let Some(n) = self.first_free_primary() {
                if !self.primary_runs(disk).is_empty() {
                    return Ok((n, false));
                }
            }
            if self.can_add_logical() {
                return Ok((next_logical, false));
            }
            return Err(Error::no_space("no free partition slot available"));
        }

        let used = self.primaries.iter().filter(|p| p.is_used()).count();
        let free = NUM_PRIMARIES - used;
        match self.ext {
            None => {
                if free == 0 {
                    disk.warnx(
                        "If you want to create more than four partitions, you must replace a \
                         primary partition with an extended partition first.",
                    );
                    return Err(Error::no_space("all primary partitions are in use"));
                }
                let menu = MenuAsk::new("Partition type", if free == 1 { 'e' } else { 'p' })
                    .add_item(
                        'p',
                        "primary",
                        format!("{} primary, 0 extended, {} free", used, free),
                    )
                    .add_item('e', "extended", "container for logical partitions");
                let choice = disk.ask_menu(menu)?;
                Ok((self.ask_primary(disk)?, choice == 'e'))
            }
            Some(_) => {
                if free == 0 {
                    disk.info(format!(
                        "All primary partitions are in use. Adding logical partition {}",
                        next_logical + 1
                    ));
                    return Ok((next_logical, false));
                }
                let menu = MenuAsk::new("Partition type", 'p')
                    .add_item(
                        'p',
                        "primary",
                        format!("{} primary, 1 extended, {} free", used - 1, free),
                    )
                    .add_item('l', "logical", "numbered from 5");
                match disk.ask_menu(menu)? {
                    'l' => Ok((next_logical, false)),
                    _ => Ok((self.ask_primary(disk)?, false)),
                }
            }
        }
    }

    fn add_primary(
        &mut self,
        disk: &Disk,
        n: usize,
        pa: Option<&Partition>,
        make_extended: bool,
    ) -> Result<usize> {
        let sys = if make_extended {
            TYPE_EXTENDED
        } else {
            self.type_code(pa)?
        };
        if is_extended(sys as u32) && self.ext.is_some() {
            return Err(Error::invalid_argument("extended partition already exists"));
        }

        let runs = self.primary_runs(disk);
        let (start, end) = planner::place(disk, &runs, pa, self.grid(disk))?;
        let boot = pa.is_some_and(|p| p.boot);
        self.primaries[n] = DosEntry::new(boot, sys, 0, start, end, &disk.geometry());
        if is_extended(sys as u32) {
            self.ext = Some(n);
            self.logicals.clear();
        }
        self.announce(disk, n, sys, end - start + 1);
        Ok(n)
    }

    fn add_logical(&mut self, disk: &Disk, pa: Option<&Partition>) -> Result<usize> {
        if self.ext.is_none() {
            return Err(Error::invalid_argument(
                "logical partitions need an extended partition",
            ));
        }
        if NUM_PRIMARIES + self.logicals.len() >= MAX_PARTITIONS {
            return Err(Error::no_space("the maximum number of partitions has been created"));
        }
        let sys = self.type_code(pa)?;
        if is_extended(sys as u32) {
            return Err(Error::invalid_argument("a logical partition cannot be extended"));
        }

        let skip = if disk.dos_compatible() {
            disk.geometry().sectors.max(1)
        } else {
            1
        };
        let runs = self.logical_runs();
        let data_runs: Vec<(u64, u64)> = runs
            .iter()
            .filter_map(|&(s, e)| (s + skip <= e).then_some((s + skip, e)))
            .collect();
        let (start, end) = planner::place(disk, &data_runs, pa, self.grid(disk))?;

        let run_start = runs
            .iter()
            .find(|&&(s, e)| s + skip <= start && start <= e)
            .map_or(start - 1, |&(s, _)| s);
        let ebr = run_start.max(start.saturating_sub(self.ebr_gap(disk)));
        let boot = pa.is_some_and(|p| p.boot);
        self.logicals.push(Logical {
            ebr,
            entry: DosEntry::new(boot, sys, ebr, start, end, &disk.geometry()),
        });
        self.normalize_chain();

        let n = NUM_PRIMARIES + self.logicals.len() - 1;
        self.announce(disk, n, sys, end - start + 1);
        Ok(n)
    }

    fn announce(&self, disk: &Disk, n: usize, sys: u8, sectors: u64) {
        let t = parttype::from_code(DOS_PARTTYPES, sys as u32);
        disk.info(format!(
            "Created a new partition {} of type '{}' and of size {}.",
            n + 1,
            t.name,
            size_to_human_string(sectors * disk.sector_size())
        ));
    }

    fn entry_mut(&mut self, n: usize) -> Result<&mut DosEntry> {
        if n < NUM_PRIMARIES {
            let p = &mut self.primaries[n];
            if p.is_used() {
                return Ok(p);
            }
        } else if let Some(l) = self.logicals.get_mut(n - NUM_PRIMARIES) {
            return Ok(&mut l.entry);
        }
        Err(Error::not_found(format!("partition {} is not used", n + 1)))
    }

    /// Move the first data sector of partition `n`, keeping its end
    pub fn move_begin(&mut self, disk: &Disk, n: usize) -> Result<()> {
        if n < NUM_PRIMARIES && self.ext == Some(n) {
            disk.warnx(format!("Partition {}: is an extended partition.", n + 1));
            return Err(Error::invalid_argument("cannot move the start of an extended partition"));
        }
        let pa = self.get_part(disk, n)?;
        let (Some(start), Some(end)) = (pa.start, pa.end()) else {
            return Err(Error::not_found(format!("partition {} is not used", n + 1)));
        };
        let low = if n < NUM_PRIMARIES {
            let (lo, _) = self.usable_range(disk);
            (0..NUM_PRIMARIES)
                .filter(|&i| i != n)
                .filter_map(|i| self.primary_range(i))
                .filter(|&(_, e)| e < start)
                .map(|(_, e)| e + 1)
                .max()
                .unwrap_or(lo)
                .min(start)
        } else {
            self.logicals[n - NUM_PRIMARIES].ebr + 1
        };

        let new = disk.ask_number("New beginning of data", low, start, end)?;
        if new == start {
            return Ok(());
        }
        let geom = disk.geometry();
        if n < NUM_PRIMARIES {
            let boot = self.primaries[n].boot_ind == 0x80;
            let sys = self.primaries[n].sys_ind;
            self.primaries[n] = DosEntry::new(boot, sys, 0, new, end, &geom);
        } else {
            let l = &mut self.logicals[n - NUM_PRIMARIES];
            let boot = l.entry.boot_ind == 0x80;
            l.entry = DosEntry::new(boot, l.entry.sys_ind, l.ebr, new, end, &geom);
        }
        self.state.changed = true;
        Ok(())
    }

    fn read_chain(&mut self, disk: &Disk, ext: usize) {
        let Some((ext_start, ext_end)) = self.ext_range() else {
            return;
        };
        // Links may point backwards; only a revisited EBR ends the chain
        let mut seen = BTreeSet::new();
        let mut next = ext_start;
        while NUM_PRIMARIES + self.logicals.len() < MAX_PARTITIONS && seen.insert(next) {
            let buf = match disk.read_sectors(next, 1) {
                Ok(buf) => buf,
                Err(err) => {
                    tracing::debug!(error = %err, sector = next, "EBR read failed");
                    disk.warnx(format!(
                        "Failed to read extended partition table (offset={}).",
                        next
                    ));
                    break;
                }
            };
            if !has_boot_signature(&buf) {
                if next != ext_start || buf.iter().any(|&b| b != 0) {
                    disk.warnx(format!(
                        "Invalid EBR signature at sector {} (extended partition {}).",
                        next,
                        ext + 1
                    ));
                }
                break;
            }

            let data = entry_at(&buf, 0);
            let link = entry_at(&buf, 1);
            if data.is_used() && data.sys_ind != TYPE_EMPTY {
                self.logicals.push(Logical { ebr: next, entry: data });
            }
            if !link.is_used() || !is_extended(link.sys_ind as u32) {
                break;
            }
            let following = ext_start + link.start as u64;
            if following > ext_end || seen.contains(&following) {
                disk.warnx("Extended partition chain is corrupted, omitting the rest.");
                break;
            }
            next = following;
        }
        tracing::debug!(count = self.logicals.len(), "read logical partitions");
    }

    fn write_chain(&self, disk: &Disk) -> Result<()> {
        let Some((ext_start, _)) = self.ext_range() else {
            return Ok(());
        };
        let ss = disk.sector_size() as usize;
        let geom = disk.geometry();

        if self.logicals.is_empty() {
            let mut buf = vec![0u8; ss.max(MBR_SIZE)];
            put_signature(&mut buf);
            return disk.write_sectors(ext_start, &buf);
        }
        for (k, l) in self.logicals.iter().enumerate() {
            let mut buf = vec![0u8; ss.max(MBR_SIZE)];
            put_entry(&mut buf, 0, &l.entry);
            if let Some(nx) = self.logicals.get(k + 1) {
                let link = DosEntry::new(false, TYPE_EXTENDED, ext_start, nx.ebr, nx.end(), &geom);
                put_entry(&mut buf, 1, &link);
            }
            put_signature(&mut buf);
            tracing::trace!(ebr = l.ebr, partno = k + NUM_PRIMARIES + 1, "writing EBR");
            disk.write_sectors(l.ebr, &buf)?;
        }
        Ok(())
    }
}

impl LabelOps for DosLabel {
    fn kind(&self) -> LabelKind {
        LabelKind::Dos
    }

    fn state(&self) -> &LabelState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut LabelState {
        &mut self.state
    }

    fn fields(&self) -> &'static [Field] {
        DOS_FIELDS
    }

    fn probe(&mut self, disk: &mut Disk) -> Result<bool> {
        if !has_boot_signature(disk.firstsector()) {
            return Ok(false);
        }
        self.deinit();
        let fs = disk.firstsector().to_vec();
        self.disk_signature = u32::from_le_bytes([
            fs[DISK_SIGNATURE_OFFSET],
            fs[DISK_SIGNATURE_OFFSET + 1],
            fs[DISK_SIGNATURE_OFFSET + 2],
            fs[DISK_SIGNATURE_OFFSET + 3],
        ]);
        for i in 0..NUM_PRIMARIES {
            let p = entry_at(&fs, i);
            if p.boot_ind != 0 && p.boot_ind != 0x80 {
                disk.warnx(format!(
                    "Partition {}: invalid flag 0x{:02x} will be corrected by write.",
                    i + 1,
                    p.boot_ind
                ));
            }
            if p.is_used() && is_extended(p.sys_ind as u32) {
                if self.ext.is_none() {
                    self.ext = Some(i);
                } else {
                    disk.warnx(format!("Ignoring extra extended partition {}", i + 1));
                }
            }
            self.primaries[i] = p;
        }
        self.mbr = fs;
        if let Some(e) = self.ext {
            self.read_chain(disk, e);
        }
        self.refresh_counts();
        tracing::debug!(
            id = %format!("0x{:08x}", self.disk_signature),
            partitions = self.state.nparts_cur,
            "found DOS label"
        );
        Ok(true)
    }

    fn create(&mut self, disk: &mut Disk) -> Result<()> {
        self.deinit();
        self.mbr = vec![0u8; (disk.sector_size() as usize).max(MBR_SIZE)];

        let id = match disk.script_header("label-id") {
            Some(text) => parse_disk_id(text)?,
            None => {
                let uuid = uuid::Uuid::new_v4();
                let b = uuid.as_bytes();
                u32::from_le_bytes([b[0], b[1], b[2], b[3]])
            }
        };
        self.disk_signature = id;
        self.refresh_counts();
        disk.info(format!(
            "Created a new DOS disklabel with disk identifier 0x{:08x}.",
            id
        ));
        Ok(())
    }

    fn verify(&self, disk: &Disk) -> Result<usize> {
        let total = disk.total_sectors();
        let mut nerrors = 0;
        let mut ranges: Vec<(usize, u64, u64)> = Vec::new();

        for i in 0..NUM_PRIMARIES {
            let Some((s, e)) = self.primary_range(i) else {
                continue;
            };
            if s == 0 {
                disk.warnx(format!("Partition {}: contains sector 0", i + 1));
                nerrors += 1;
            }
            if e >= total {
                disk.warnx(format!("Partition {}: is ending beyond the disk.", i + 1));
                nerrors += 1;
            }
            if !disk.topology().lba_is_phy_aligned(s) {
                disk.warnx(format!(
                    "Partition {}: does not start on physical sector boundary.",
                    i + 1
                ));
            }
            for &(j, os, oe) in &ranges {
                if s <= oe && os <= e {
                    disk.warnx(format!("Partition {}: overlaps partition {}.", i + 1, j + 1));
                    nerrors += 1;
                }
            }
            ranges.push((i, s, e));
        }

        if let Some((xs, xe)) = self.ext_range() {
            let mut seen: Vec<(usize, u64, u64)> = Vec::new();
            for (k, l) in self.logicals.iter().enumerate() {
                let n = NUM_PRIMARIES + k;
                let (s, e) = (l.start(), l.end());
                if l.ebr < xs || e > xe {
                    disk.warnx(format!(
                        "Logical partition {}: not entirely in partition {}.",
                        n + 1,
                        self.ext.map_or(0, |x| x + 1)
                    ));
                    nerrors += 1;
                }
                for &(j, os, oe) in &seen {
                    if l.ebr <= oe && os <= e {
                        disk.warnx(format!("Partition {}: overlaps partition {}.", n + 1, j + 1));
                        nerrors += 1;
                    }
                }
                seen.push((n, l.ebr, e));
                if !disk.topology().lba_is_phy_aligned(s) {
                    disk.warnx(format!(
                        "Partition {}: does not start on physical sector boundary.",
                        n + 1
                    ));
                }
            }
        }

        let used: u64 = (0..NUM_PRIMARIES)
            .filter(|&i| Some(i) != self.ext)
            .filter_map(|i| self.primary_range(i))
            .map(|(s, e)| e - s + 1)
            .chain(self.logicals.iter().map(|l| l.end() - l.ebr + 1))
            .sum();
        let (lo, _) = self.usable_range(disk);
        let remaining = total.saturating_sub(lo).saturating_sub(used);
        disk.info(format!(
            "Remaining {} unallocated {}-byte sectors.",
            remaining,
            disk.sector_size()
        ));
        Ok(nerrors)
    }

    fn write(&mut self, disk: &mut Disk) -> Result<()> {
        let mut mbr = self.mbr.clone();
        let len = (disk.sector_size() as usize).max(MBR_SIZE);
        if mbr.len() < len {
            mbr.resize(len, 0);
        }
        mbr[DISK_SIGNATURE_OFFSET..DISK_SIGNATURE_OFFSET + 4]
            .copy_from_slice(&self.disk_signature.to_le_bytes());
        for (i, p) in self.primaries.iter().enumerate() {
            let mut p = *p;
            if p.boot_ind != 0 && p.boot_ind != 0x80 {
                p.boot_ind = 0;
            }
            put_entry(&mut mbr, i, &p);
        }
        put_signature(&mut mbr);

        disk.write_at(0, &mbr)?;
        self.write_chain(disk)?;
        disk.set_firstsector(mbr.clone());
        self.mbr = mbr;
        Ok(())
    }

    fn list(&self, disk: &Disk) -> Result<()> {
        if !disk.is_details() {
            return Ok(());
        }
        for (k, l) in self.logicals.iter().enumerate() {
            disk.info(format!(
                "Logical partition {}: EBR at sector {}",
                NUM_PRIMARIES + k + 1,
                l.ebr
            ));
        }
        Ok(())
    }

    fn locate(&self, disk: &Disk, n: usize) -> Result<(&'static str, u64, usize)> {
        match n {
            0 => Ok(("MBR", 0, MBR_SIZE)),
            _ => self
                .logicals
                .get(n - 1)
                .map(|l| ("EBR", l.ebr * disk.sector_size(), MBR_SIZE))
                .ok_or_else(|| Error::not_found(format!("DOS label area {}", n))),
        }
    }

    fn deinit(&mut self) {
        let disabled = self.state.disabled;
        *self = Self::new();
        self.state.disabled = disabled;
    }

    fn reset_alignment(&self, disk: &mut Disk) {
        if !disk.dos_compatible() {
            return;
        }
        let sectors = disk.geometry().sectors;
        let topo = disk.topology_mut();
        if sectors != 0 {
            topo.first_lba = sectors;
        }
        topo.grain = topo.sector_size;
    }

    fn get_id(&self) -> Option<String> {
        (self.state.nparts_max > 0).then(|| format!("0x{:08x}", self.disk_signature))
    }

    fn set_id(&mut self, disk: &Disk) -> Result<()> {
        let old = self.disk_signature;
        let answer =
            disk.ask_string("Enter the new disk identifier", Some(&format!("0x{:08x}", old)))?;
        let id = parse_disk_id(&answer)?;
        self.disk_signature = id;
        self.state.changed = true;
        disk.info(format!(
            "Disk identifier changed from 0x{:08x} to 0x{:08x}.",
            old, id
        ));
        Ok(())
    }

    fn get_part(&self, _disk: &Disk, n: usize) -> Result<Partition> {
        let mut pa = Partition::new();
        pa.partno = Some(n);
        let entry = if n < NUM_PRIMARIES {
            let p = self.primaries[n];
            if !p.is_used() {
                return Ok(pa);
            }
            pa.set_start(p.start as u64);
            pa.set_size(p.size as u64);
            pa.container = is_extended(p.sys_ind as u32);
            p
        } else {
            let l = self
                .logicals
                .get(n - NUM_PRIMARIES)
                .ok_or_else(|| Error::out_of_range(format!("partition {} does not exist", n + 1)))?;
            pa.set_start(l.start());
            pa.set_size(l.entry.size as u64);
            pa.parent_partno = self.ext;
            l.entry
        };
        pa.used = true;
        pa.boot = entry.boot_ind == 0x80;
        pa.parttype = Some(parttype::from_code(DOS_PARTTYPES, entry.sys_ind as u32));
        pa.start_addr = Some(entry.chs_start.to_string());
        pa.end_addr = Some(entry.chs_end.to_string());
        if entry.boot_ind != 0 {
            pa.attrs = Some(format!("{:02x}", entry.boot_ind));
        }
        Ok(pa)
    }

    fn part_is_used(&self, n: usize) -> bool {
        if n < NUM_PRIMARIES {
            self.primaries[n].is_used()
        } else {
            n - NUM_PRIMARIES < self.logicals.len()
        }
    }

    fn add_part(&mut self, disk: &mut Disk, pa: Option<&Partition>) -> Result<usize> {
        if self.state.nparts_max == 0 {
            return Err(Error::invalid_operation("DOS label is not initialized"));
        }
        let (n, make_extended) = self.choose_slot(disk, pa)?;
        let n = if n < NUM_PRIMARIES {
            self.add_primary(disk, n, pa, make_extended)?
        } else {
            self.add_logical(disk, pa)?
        };
        self.refresh_counts();
        self.state.changed = true;
        Ok(n)
    }

    fn del_part(&mut self, disk: &mut Disk, n: usize) -> Result<()> {
        if n < NUM_PRIMARIES {
            if self.ext == Some(n) {
                self.logicals.clear();
                self.ext = None;
            }
            self.primaries[n] = DosEntry::default();
        } else if n - NUM_PRIMARIES < self.logicals.len() {
            self.logicals.remove(n - NUM_PRIMARIES);
            self.normalize_chain();
        } else {
            return Err(Error::not_found(format!("partition {} is not used", n + 1)));
        }
        self.refresh_counts();
        self.state.changed = true;
        disk.info(format!("Partition {} has been deleted.", n + 1));
        Ok(())
    }

    fn set_part_type(&mut self, disk: &Disk, n: usize, t: &PartType) -> Result<()> {
        let code = Self::checked_code(t)?;
        let entry = self.entry_mut(n)?;
        if is_extended(code as u32) != is_extended(entry.sys_ind as u32) {
            disk.warnx(
                "You cannot change a partition into an extended one or vice versa. \
                 Delete it first.",
            );
            return Err(Error::invalid_argument(
                "cannot change a partition into an extended one or vice versa",
            ));
        }
        let old = entry.sys_ind;
        entry.sys_ind = code;
        self.state.changed = true;
        disk.info(format!(
            "Changed type of partition '{}' to '{}'.",
            parttype::from_code(DOS_PARTTYPES, old as u32).name,
            t.name
        ));
        Ok(())
    }

    fn toggle_part_flag(&mut self, disk: &Disk, n: usize, flag: u64) -> Result<()> {
        if flag != DOS_FLAG_ACTIVE {
            return Err(Error::invalid_argument(format!("unknown DOS flag 0x{:x}", flag)));
        }
        let is_ext = n < NUM_PRIMARIES && self.ext == Some(n);
        let entry = self.entry_mut(n)?;
        if is_ext && entry.boot_ind == 0 {
            disk.warnx(format!("Partition {}: is an extended partition.", n + 1));
        }
        entry.boot_ind = if entry.boot_ind == 0x80 { 0 } else { 0x80 };
        let on = entry.boot_ind == 0x80;
        self.state.changed = true;
        disk.info(format!(
            "The bootable flag on partition {} is {} now.",
            n + 1,
            if on { "enabled" } else { "disabled" }
        ));
        Ok(())
    }

    fn reorder(&mut self, _disk: &Disk) -> Result<bool> {
        let before_primaries = self.primaries;
        let before_logicals = self.logicals.clone();

        let mut primaries = self.primaries;
        primaries.sort_by_key(|p| (!p.is_used(), p.start));
        let ext = primaries
            .iter()
            .position(|p| p.is_used() && is_extended(p.sys_ind as u32));
        self.primaries = primaries;
        self.ext = ext;
        self.logicals.sort_by_key(|l| l.start());
        self.normalize_chain();

        Ok(self.primaries != before_primaries || self.logicals != before_logicals)
    }

    fn usable_range(&self, disk: &Disk) -> (u64, u64) {
        let last = disk.total_sectors().saturating_sub(1).min(u32::MAX as u64);
        (disk.topology().first_lba, last)
    }

    fn next_partno(&self, disk: &Disk, pa: Option<&Partition>) -> Result<usize> {
        self.choose_slot(disk, pa).map(|(n, _)| n)
    }

    fn occupied_range(&self, _disk: &Disk, n: usize) -> Result<(u64, u64)> {
        if n < NUM_PRIMARIES {
            self.primary_range(n)
        } else {
            self.logicals.get(n - NUM_PRIMARIES).map(|l| (l.ebr, l.end()))
        }
        .ok_or_else(|| Error::not_found(format!("partition {} is not used", n + 1)))
    }
}

impl Context {
    /// Place MBR partitions on cylinder boundaries
    pub fn dos_enable_compatible(&mut self, enable: bool) {
        self.disk_mut().set_dos_compatible(enable);
        if self.is_label(LabelKind::Dos) {
            self.reset_alignment();
        }
    }

    pub fn dos_is_compatible(&self) -> bool {
        self.disk().dos_compatible()
    }

    /// Move the beginning of data of partition `n`; asks for the new start
    pub fn dos_move_begin(&mut self, n: usize) -> Result<()> {
        self.check_writable()?;
        let (disk, lb) = self.active_parts()?;
        match lb {
            crate::label::Label::Dos(dos) => dos.move_begin(disk, n),
            _ => Err(Error::invalid_operation("not a DOS label")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disklabel_core::{DefaultAnswers, DeviceIo};
    use std::io::Cursor;

    const MIB: u64 = 1024 * 1024;

    fn context(size: u64) -> Context {
        let mut cxt = Context::new();
        cxt.set_ask_handler(DefaultAnswers);
        let dev: Box<dyn DeviceIo> = Box::new(Cursor::new(vec![0u8; size as usize]));
        cxt.assign_device_handle(dev, "/dev/sdx", false).unwrap();
        cxt.create_disklabel(Some("dos")).unwrap();
        cxt
    }

    fn template(size: u64, code: u32) -> Partition {
        let mut pa = Partition::new();
        pa.start_follow_default(true);
        pa.partno_follow_default(true);
        pa.set_size(size);
        pa.set_type(parttype::from_code(DOS_PARTTYPES, code));
        pa
    }

    /// Create a minimal valid MBR with one partition
    fn create_test_mbr() -> Vec<u8> {
        let mut mbr = vec![0u8; 4 * MIB as usize];
        mbr[0x1B8..0x1BC].copy_from_slice(&[0x12, 0x34, 0x56, 0x78]);

        // FAT32 LBA, 2048 sectors starting at LBA 2048
        let e = 0x1BE;
        mbr[e] = 0x80;
        mbr[e + 4] = 0x0C;
        mbr[e + 8..e + 12].copy_from_slice(&2048u32.to_le_bytes());
        mbr[e + 12..e + 16].copy_from_slice(&2048u32.to_le_bytes());
        mbr[0x1FE] = 0x55;
        mbr[0x1FF] = 0xAA;
        mbr
    }

    #[test]
    fn test_probe_existing_mbr() {
        let mut cxt = Context::new();
        cxt.assign_device_handle(Box::new(Cursor::new(create_test_mbr())), "img", true)
            .unwrap();
        assert!(cxt.is_label(LabelKind::Dos));
        assert_eq!(cxt.get_disklabel_id().unwrap().as_deref(), Some("0x78563412"));

        let pa = cxt.get_partition(0).unwrap();
        assert!(pa.boot);
        assert_eq!(pa.start, Some(2048));
        assert_eq!(pa.size(), Some(2048));
        assert_eq!(pa.parttype.unwrap().name, "W95 FAT32 (LBA)");
        assert!(!cxt.is_partition_used(1));
    }

    #[test]
    fn test_probe_invalid_boot_signature() {
        let mut mbr = create_test_mbr();
        mbr[0x1FE] = 0x00;
        let mut cxt = Context::new();
        cxt.assign_device_handle(Box::new(Cursor::new(mbr)), "img", true)
            .unwrap();
        assert!(!cxt.has_label());
    }

    #[test]
    fn test_primary_defaults_are_aligned() {
        let mut cxt = context(64 * MIB);
        let n = cxt.add_partition(Some(&template(20480, 0x83))).unwrap();
        assert_eq!(n, 0);
        let pa = cxt.get_partition(0).unwrap();
        assert_eq!(pa.start, Some(2048));
        assert_eq!(pa.end(), Some(2048 + 20480 - 1));

        let n = cxt.add_partition(Some(&template(20480, 0x82))).unwrap();
        assert_eq!(n, 1);
        assert_eq!(cxt.get_partition(1).unwrap().start, Some(22528));
    }

    #[test]
    fn test_extended_and_logicals() {
        let mut cxt = context(64 * MIB);
        cxt.add_partition(Some(&template(20480, 0x83))).unwrap();
        let mut ext = Partition::new();
        ext.start_follow_default(true);
        ext.end_follow_default(true);
        ext.partno_follow_default(true);
        ext.set_type(parttype::from_code(DOS_PARTTYPES, 0x05));
        assert_eq!(cxt.add_partition(Some(&ext)).unwrap(), 1);

        // both primaries left are free, but the start is inside the extended area
        let mut l1 = template(10240, 0x83);
        l1.start_follow_default(false);
        l1.set_start(24576 + 2048);
        assert_eq!(cxt.add_partition(Some(&l1)).unwrap(), 4);

        let tb = cxt.get_partitions().unwrap();
        let logical = tb.get_by_partno(4).unwrap();
        assert_eq!(logical.parent_partno, Some(1));
        assert!(tb.get_by_partno(1).unwrap().is_container());

        cxt.write_disklabel().unwrap();
        let (name, offset, _) = cxt.locate_disklabel(1).unwrap();
        assert_eq!(name, "EBR");
        assert_eq!(offset, 22528 * 512);

        assert!(cxt
            .set_partition_type(1, &parttype::from_code(DOS_PARTTYPES, 0x83))
            .is_err());

        cxt.delete_partition(1).unwrap();
        assert_eq!(cxt.get_npartitions(), 4);
        assert!(!cxt.is_partition_used(4));
    }

    #[test]
    fn test_logical_requires_order() {
        let mut cxt = context(64 * MIB);
        let mut pa = template(2048, 0x83);
        pa.set_partno(5);
        assert!(cxt.add_partition(Some(&pa)).is_err());
    }

    #[test]
    fn test_toggle_boot_flag() {
        let mut cxt = context(16 * MIB);
        cxt.add_partition(Some(&template(2048, 0x83))).unwrap();
        cxt.toggle_partition_flag(0, DOS_FLAG_ACTIVE).unwrap();
        assert!(cxt.get_partition(0).unwrap().boot);
        cxt.toggle_partition_flag(0, DOS_FLAG_ACTIVE).unwrap();
        assert!(!cxt.get_partition(0).unwrap().boot);
        assert!(cxt.toggle_partition_flag(0, 2).is_err());
    }

    #[test]
    fn test_reorder() {
        let mut cxt = context(64 * MIB);
        let mut late = template(2048, 0x83);
        late.start_follow_default(false);
        late.set_start(40960);
        cxt.add_partition(Some(&late)).unwrap();
        cxt.add_partition(Some(&template(2048, 0x83))).unwrap();
        assert!(cxt.get_partitions().unwrap().wrong_order());

        assert!(cxt.reorder_partitions().unwrap());
        assert!(!cxt.get_partitions().unwrap().wrong_order());
        assert_eq!(cxt.get_partition(0).unwrap().start, Some(2048));
        assert!(!cxt.reorder_partitions().unwrap());
    }

    #[test]
    fn test_compat_mode_uses_cylinders() {
        let mut cxt = context(64 * MIB);
        cxt.dos_enable_compatible(true);
        assert_eq!(cxt.first_lba(), 63);
        let n = cxt.add_partition(Some(&template(20000, 0x83))).unwrap();
        assert_eq!(cxt.get_partition(n).unwrap().start, Some(63));
    }

    #[test]
    fn test_write_and_reprobe() {
        let mut cxt = context(64 * MIB);
        cxt.add_partition(Some(&template(20480, 0x83))).unwrap();
        let id = cxt.get_disklabel_id().unwrap();
        cxt.write_disklabel().unwrap();

        let fs = cxt.disk().firstsector().to_vec();
        assert_eq!(&fs[510..512], &[0x55, 0xAA]);
        assert_eq!(fs[0x1BE + 4], 0x83);

        let mut again = Context::new();
        again
            .assign_device_handle(Box::new(Cursor::new(fs_image(&fs, 64 * MIB))), "img", true)
            .unwrap();
        assert_eq!(again.get_disklabel_id().unwrap(), id);
        assert_eq!(again.get_partition(0).unwrap().start, Some(2048));
    }

    #[test]
    fn test_logical_in_earlier_gap_survives_reprobe() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(256 * MIB).unwrap();
        let mut cxt = Context::new();
        cxt.set_ask_handler(DefaultAnswers);
        cxt.assign_device(file.path(), false).unwrap();
        cxt.create_disklabel(Some("dos")).unwrap();

        assert_eq!(cxt.add_partition(Some(&template(200_000, 0x05))).unwrap(), 0);
        let mut l5 = template(20480, 0x83);
        l5.set_partno(4);
        let mut l6 = template(20480, 0x83);
        l6.set_partno(5);
        l6.start_follow_default(false);
        l6.set_start(100_000);
        let mut l7 = template(20480, 0x82);
        l7.set_partno(6);
        for pa in [&l5, &l6, &l7] {
            cxt.add_partition(Some(pa)).unwrap();
        }

        let before = cxt.get_partitions().unwrap();
        assert_eq!(before.len(), 4);
        let l6_start = before.get_by_partno(5).unwrap().start.unwrap();
        let l7_start = before.get_by_partno(6).unwrap().start.unwrap();
        assert!(l7_start < l6_start);

        cxt.write_disklabel().unwrap();
        cxt.deassign_device(false).unwrap();

        let mut again = Context::new();
        again.set_ask_handler(DefaultAnswers);
        again.assign_device(file.path(), true).unwrap();
        let after = again.get_partitions().unwrap();
        assert_eq!(after.len(), 4);
        for n in 4..7 {
            let (a, b) = (before.get_by_partno(n).unwrap(), after.get_by_partno(n).unwrap());
            assert_eq!((a.start, a.size()), (b.start, b.size()));
            assert_eq!(a.parttype, b.parttype);
        }
    }

    fn fs_image(first: &[u8], size: u64) -> Vec<u8> {
        let mut img = vec![0u8; size as usize];
        img[..first.len()].copy_from_slice(first);
        img
    }

    #[test]
    fn test_parse_disk_id() {
        assert_eq!(parse_disk_id("0xdeadbeef").unwrap(), 0xdead_beef);
        assert_eq!(parse_disk_id("1234").unwrap(), 0x1234);
        assert!(parse_disk_id("xyz").is_err());
    }
}
