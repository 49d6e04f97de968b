//! SGI volume header
//!
//! A big-endian 512-byte header in the first sector with a volume directory
//! and 16 partitions. IRIX expects partition 9 to hold the volume header
//! and partition 11 to cover the entire disk.

use crate::context::{Context, Disk};
use crate::label::{Label, LabelKind, LabelOps, LabelState};
use crate::planner::{self, Grid};
use disklabel_core::{
    free_runs, parttype, Error, Field, FieldId, PartType, PartTypeDef, Partition, Result,
};

pub const SGI_LABEL_MAGIC: u32 = 0x0BE5_A941;
pub const SGI_INFO_MAGIC: u32 = 0x0007_2959;
pub const SGI_MAXPARTITIONS: usize = 16;
pub const SGI_MAXVOLUMES: usize = 15;
pub const SGI_LABEL_SIZE: usize = 512;

/// Slot of the volume header partition
pub const SGI_VOLHDR_SLOT: usize = 8;
/// Slot of the entire disk partition
pub const SGI_ENTIRE_SLOT: usize = 10;
/// Default volume header size, as IRIX fx uses
const VOLHDR_SECTORS: u32 = 4096;

pub const SGI_TYPE_VOLHDR: u32 = 0x00;
pub const SGI_TYPE_SWAP: u32 = 0x03;
pub const SGI_TYPE_ENTIRE_DISK: u32 = 0x06;
pub const SGI_TYPE_XFS: u32 = 0x0a;
const LINUX_SWAP: u32 = 0x82;

pub const SGI_FLAG_BOOT: u64 = 1;
pub const SGI_FLAG_SWAP: u64 = 2;

const BOOTFILE_OFFSET: usize = 8;
const BOOTFILE_SIZE: usize = 16;
const DEVPARAM_OFFSET: usize = 24;
const VOLUME_OFFSET: usize = 72;
const VOLUME_SIZE: usize = 16;
const PARTITION_OFFSET: usize = 312;
const PARTITION_SIZE: usize = 12;
const CSUM_OFFSET: usize = 504;

pub const SGI_PARTTYPES: &[PartTypeDef] = &[
    PartTypeDef::code(0x00, "SGI volhdr"),
    PartTypeDef::code(0x01, "SGI trkrepl"),
    PartTypeDef::code(0x02, "SGI secrepl"),
    PartTypeDef::code(0x03, "SGI raw"),
    PartTypeDef::code(0x04, "SGI bsd"),
    PartTypeDef::code(0x05, "SGI sysv"),
    PartTypeDef::code(0x06, "SGI volume"),
    PartTypeDef::code(0x07, "SGI efs"),
    PartTypeDef::code(0x08, "SGI lvol"),
    PartTypeDef::code(0x09, "SGI rlvol"),
    PartTypeDef::code(0x0a, "SGI xfs"),
    PartTypeDef::code(0x0b, "SGI xfslog"),
    PartTypeDef::code(0x0c, "SGI xlv"),
    PartTypeDef::code(0x0d, "SGI xvm"),
    PartTypeDef::code(0x82, "Linux swap"),
    PartTypeDef::code(0x83, "Linux native"),
    PartTypeDef::code(0x8e, "Linux LVM"),
    PartTypeDef::code(0xfd, "Linux RAID"),
];

static SGI_FIELDS: &[Field] = &[
    Field::text(FieldId::Device, "Device", 10.0),
    Field::number(FieldId::Start, "Start", 8.0),
    Field::number(FieldId::End, "End", 8.0),
    Field::number(FieldId::Sectors, "Sectors", 8.0),
    Field::number(FieldId::Cylinders, "Cylinders", 8.0),
    Field::number(FieldId::Size, "Size", 5.0),
    Field::number(FieldId::TypeId, "Id", 2.0),
    Field::text(FieldId::Type, "Type", 0.1).eyecandy(),
    Field::text(FieldId::Attr, "Attrs", 0.0),
];

fn be_u16(b: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([b[off], b[off + 1]])
}

fn be_u32(b: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn put_u16(b: &mut [u8], off: usize, v: u16) {
    b[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

fn put_u32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

/// Sum of all big-endian 32-bit words; zero for a valid label
fn word_sum(buf: &[u8]) -> u32 {
    buf.chunks_exact(4)
        .fold(0u32, |acc, w| acc.wrapping_add(u32::from_be_bytes([w[0], w[1], w[2], w[3]])))
}

fn cstr(b: &[u8]) -> String {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).into_owned()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SgiPartition {
    num_blocks: u32,
    first_block: u32,
    ptype: u32,
}

impl SgiPartition {
    fn is_used(&self) -> bool {
        self.num_blocks != 0
    }

    fn end(&self) -> u64 {
        self.first_block as u64 + self.num_blocks as u64 - 1
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct VolumeEntry {
    name: String,
    block_num: u32,
    num_bytes: u32,
}

/// SGI disklabel
#[derive(Debug, Clone)]
pub struct SgiLabel {
    state: LabelState,
    raw: Vec<u8>,
    root_part: u16,
    swap_part: u16,
    bootfile: String,
    volumes: Vec<VolumeEntry>,
    parts: [SgiPartition; SGI_MAXPARTITIONS],
    /// Information block written behind the header, if created
    info: Option<Vec<u8>>,
}

impl Default for SgiLabel {
    fn default() -> Self {
        Self::new()
    }
}

impl SgiLabel {
    pub fn new() -> Self {
        Self {
            state: LabelState::default(),
            raw: vec![0u8; SGI_LABEL_SIZE],
            root_part: 0,
            swap_part: 0,
            bootfile: String::new(),
            volumes: vec![VolumeEntry::default(); SGI_MAXVOLUMES],
            parts: [SgiPartition::default(); SGI_MAXPARTITIONS],
            info: None,
        }
    }

    pub fn bootfile(&self) -> &str {
        &self.bootfile
    }

    /// Partition IRIX boots from
    pub fn boot_partition(&self) -> usize {
        self.root_part as usize
    }

    pub fn swap_partition(&self) -> usize {
        self.swap_part as usize
    }

    pub fn has_info(&self) -> bool {
        self.info.is_some()
    }

    fn refresh_counts(&mut self) {
        self.state.nparts_max = SGI_MAXPARTITIONS;
        self.state.nparts_cur = self.parts.iter().filter(|p| p.is_used()).count();
    }

    /// Sectors covered by the CHS geometry
    fn lastblock(disk: &Disk) -> u64 {
        let g = disk.geometry();
        match g.sectors_per_cylinder() * g.cylinders {
            0 => disk.total_sectors(),
            n => n,
        }
    }

    fn entire(&self) -> Option<usize> {
        self.parts
            .iter()
            .position(|p| p.is_used() && p.ptype == SGI_TYPE_ENTIRE_DISK)
    }

    fn set_part(&mut self, n: usize, start: u64, size: u64, ptype: u32) -> Result<()> {
        let first_block = u32::try_from(start)
            .map_err(|_| Error::out_of_range("partition start does not fit an SGI label"))?;
        let num_blocks = u32::try_from(size)
            .map_err(|_| Error::out_of_range("partition size does not fit an SGI label"))?;
        self.parts[n] = SgiPartition {
            num_blocks,
            first_block,
            ptype,
        };
        self.refresh_counts();
        self.state.changed = true;
        Ok(())
    }

    /// Fill the first free slot from 11 on with the entire disk partition
    fn set_entire(&mut self, disk: &Disk) -> Result<()> {
        match (SGI_ENTIRE_SLOT..SGI_MAXPARTITIONS).find(|&n| !self.parts[n].is_used()) {
            Some(n) => self.set_part(n, 0, Self::lastblock(disk), SGI_TYPE_ENTIRE_DISK),
            None => Ok(()),
        }
    }

    /// Fill the first free slot from 9 on with the volume header
    fn set_volhdr(&mut self, disk: &Disk) -> Result<()> {
        let Some(n) = (SGI_VOLHDR_SLOT..SGI_MAXPARTITIONS).find(|&n| !self.parts[n].is_used())
        else {
            return Ok(());
        };
        if (VOLHDR_SECTORS as u64) < Self::lastblock(disk) {
            self.set_part(n, 0, VOLHDR_SECTORS as u64, SGI_TYPE_VOLHDR)?;
        }
        Ok(())
    }

    /// Used extents other than the entire disk partition, sorted by start
    fn data_ranges(&self) -> Vec<(usize, u64, u64)> {
        let mut out: Vec<(usize, u64, u64)> = self
            .parts
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_used() && p.ptype != SGI_TYPE_ENTIRE_DISK)
            .map(|(i, p)| (i, p.first_block as u64, p.end()))
            .collect();
        out.sort_by_key(|&(_, s, _)| s);
        out
    }

    fn free(&self, disk: &Disk) -> Vec<(u64, u64)> {
        let used = self.data_ranges().into_iter().map(|(_, s, e)| (s, e));
        free_runs(0, Self::lastblock(disk).saturating_sub(1), used)
    }

    fn has_overlap(&self) -> bool {
        self.data_ranges()
            .windows(2)
            .any(|w| w[1].1 <= w[0].2)
    }

    fn parse(&mut self, buf: &[u8]) {
        self.raw = buf[..SGI_LABEL_SIZE].to_vec();
        self.root_part = be_u16(buf, 4);
        self.swap_part = be_u16(buf, 6);
        self.bootfile = cstr(&buf[BOOTFILE_OFFSET..BOOTFILE_OFFSET + BOOTFILE_SIZE]);
        for (i, v) in self.volumes.iter_mut().enumerate() {
            let off = VOLUME_OFFSET + i * VOLUME_SIZE;
            *v = VolumeEntry {
                name: cstr(&buf[off..off + 8]),
                block_num: be_u32(buf, off + 8),
                num_bytes: be_u32(buf, off + 12),
            };
        }
        for (i, p) in self.parts.iter_mut().enumerate() {
            let off = PARTITION_OFFSET + i * PARTITION_SIZE;
            *p = SgiPartition {
                num_blocks: be_u32(buf, off),
                first_block: be_u32(buf, off + 4),
                ptype: be_u32(buf, off + 8),
            };
        }
    }

    fn render(&self) -> Vec<u8> {
        let mut b = self.raw.clone();
        b.resize(SGI_LABEL_SIZE, 0);
        put_u32(&mut b, 0, SGI_LABEL_MAGIC);
        put_u16(&mut b, 4, self.root_part);
        put_u16(&mut b, 6, self.swap_part);
        let boot = &mut b[BOOTFILE_OFFSET..BOOTFILE_OFFSET + BOOTFILE_SIZE];
        boot.fill(0);
        let name = self.bootfile.as_bytes();
        let len = name.len().min(BOOTFILE_SIZE);
        boot[..len].copy_from_slice(&name[..len]);
        for (i, v) in self.volumes.iter().enumerate() {
            let off = VOLUME_OFFSET + i * VOLUME_SIZE;
            b[off..off + 8].fill(0);
            let name = v.name.as_bytes();
            let len = name.len().min(8);
            b[off..off + len].copy_from_slice(&name[..len]);
            put_u32(&mut b, off + 8, v.block_num);
            put_u32(&mut b, off + 12, v.num_bytes);
        }
        for (i, p) in self.parts.iter().enumerate() {
            let off = PARTITION_OFFSET + i * PARTITION_SIZE;
            put_u32(&mut b, off, p.num_blocks);
            put_u32(&mut b, off + 4, p.first_block);
            put_u32(&mut b, off + 8, p.ptype);
        }
        put_u32(&mut b, CSUM_OFFSET, 0);
        let csum = 0u32.wrapping_sub(word_sum(&b));
        put_u32(&mut b, CSUM_OFFSET, csum);
        b
    }

    /// Validate a boot file name against the header limits
    fn check_bootfile(disk: &Disk, name: &str) -> Result<()> {
        if name.len() < 3 || !name.starts_with('/') {
            disk.warnx(
                "Invalid bootfile!  The bootfile must be an absolute non-zero pathname, \
                 e.g. \"/unix\" or \"/unix.save\".",
            );
            return Err(Error::invalid_argument(format!("invalid bootfile '{}'", name)));
        }
        if name.len() > BOOTFILE_SIZE {
            disk.warnx(format!(
                "Name of bootfile is too long: {} byte maximum.",
                BOOTFILE_SIZE
            ));
            return Err(Error::invalid_argument(format!("bootfile '{}' is too long", name)));
        }
        Ok(())
    }

    /// Set the boot file name; `None` asks for it
    pub fn set_bootfile(&mut self, disk: &Disk, name: Option<&str>) -> Result<()> {
        let name = match name {
            Some(name) => name.to_string(),
            None => {
                disk.info(format!(
                    "The current boot file is: {}",
                    if self.bootfile.is_empty() { "(none)" } else { &self.bootfile }
                ));
                disk.ask_string("Enter of the new boot file", Some(&self.bootfile))?
            }
        };
        Self::check_bootfile(disk, &name)?;
        if name == self.bootfile {
            return Ok(());
        }
        self.bootfile = name;
        self.state.changed = true;
        disk.info(format!(
            "Bootfile is changed to \"{}\".",
            self.bootfile
        ));
        Ok(())
    }

    /// Add the "sgilabel" information block to the volume directory
    pub fn create_info(&mut self, disk: &Disk) -> Result<()> {
        let mut info = vec![0u8; SGI_LABEL_SIZE];
        put_u32(&mut info, 0, SGI_INFO_MAGIC);
        put_u32(&mut info, 16, u32::MAX);
        put_u16(&mut info, 20, u16::MAX);
        put_u16(&mut info, 22, 1);
        let scsi = b"IBM OEM 0662S12         3 30";
        info[94..94 + scsi.len()].copy_from_slice(scsi);
        info[144] = b'0';
        put_u16(&mut info, 281, 18 * 256 + 16);
        let installer = b"Sfx version 5.3, Oct 18, 1994";
        info[283..283 + installer.len()].copy_from_slice(installer);

        self.volumes[0] = VolumeEntry {
            name: "sgilabel".to_string(),
            block_num: 2,
            num_bytes: SGI_LABEL_SIZE as u32,
        };
        self.info = Some(info);
        self.state.changed = true;
        disk.info("SGI info created on second sector.");
        Ok(())
    }

    fn checked_type(t: &PartType) -> Result<u32> {
        if t.typestr().is_some() {
            return Err(Error::unknown_type(format!(
                "type '{}' is not valid for an SGI label",
                t.id_string()
            )));
        }
        Ok(t.code)
    }

    fn part_mut(&mut self, n: usize) -> Result<&mut SgiPartition> {
        self.parts
            .get_mut(n)
            .filter(|p| p.is_used())
            .ok_or_else(|| Error::not_found(format!("partition {} is not used", n + 1)))
    }
}

impl LabelOps for SgiLabel {
    fn kind(&self) -> LabelKind {
        LabelKind::Sgi
    }

    fn state(&self) -> &LabelState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut LabelState {
        &mut self.state
    }

    fn fields(&self) -> &'static [Field] {
        SGI_FIELDS
    }

    fn require_geometry(&self) -> bool {
        true
    }

    fn probe(&mut self, disk: &mut Disk) -> Result<bool> {
        let buf = disk.firstsector();
        if buf.len() < SGI_LABEL_SIZE || be_u32(buf, 0) != SGI_LABEL_MAGIC {
            return Ok(false);
        }
        let csum_ok = word_sum(&buf[..SGI_LABEL_SIZE]) == 0;

        let mut lb = Self::new();
        lb.parse(buf);
        lb.state.disabled = self.state.disabled;
        let v = &lb.volumes[0];
        if v.name == "sgilabel" && v.block_num != 0 {
            match disk.read_sectors(v.block_num as u64, 1) {
                Ok(mut info) if be_u32(&info, 0) == SGI_INFO_MAGIC => {
                    info.truncate(SGI_LABEL_SIZE);
                    lb.info = Some(info);
                }
                Ok(_) => {}
                Err(err) => tracing::debug!(error = %err, "cannot read SGI info block"),
            }
        }
        lb.refresh_counts();
        *self = lb;
        if !csum_ok {
            disk.warnx("Detected an SGI disklabel with wrong checksum.");
        }
        tracing::debug!(partitions = self.state.nparts_cur, "found SGI label");
        Ok(true)
    }

    fn create(&mut self, disk: &mut Disk) -> Result<()> {
        self.deinit();
        let g = disk.geometry();
        let mut raw = vec![0u8; SGI_LABEL_SIZE];
        let dp = DEVPARAM_OFFSET;
        put_u16(&mut raw, dp + 4, g.cylinders.min(u16::MAX as u64) as u16);
        put_u16(&mut raw, dp + 8, g.heads.min(u16::MAX as u32) as u16);
        put_u16(&mut raw, dp + 12, g.sectors.min(u16::MAX as u64) as u16);
        put_u16(&mut raw, dp + 14, disk.sector_size().min(u16::MAX as u64) as u16);
        put_u16(&mut raw, dp + 16, 1);
        put_u16(&mut raw, dp + 22, 1);
        self.raw = raw;
        self.bootfile = "/unix".to_string();
        self.refresh_counts();
        self.set_entire(disk)?;
        self.set_volhdr(disk)?;
        disk.info("Created a new SGI disklabel.");
        Ok(())
    }

    fn verify(&self, disk: &Disk) -> Result<usize> {
        let lastblock = Self::lastblock(disk);
        let mut nerrors = 0;

        match self.entire() {
            None => {
                disk.warnx("The entire disk partition should be the 11th entry.");
                nerrors += 1;
            }
            Some(n) => {
                if n != SGI_ENTIRE_SLOT {
                    disk.warnx("The entire disk partition should be the 11th entry.");
                }
                let p = self.parts[n];
                if p.first_block != 0 {
                    disk.warnx("The entire disk partition should start at block 0.");
                    nerrors += 1;
                }
                if (p.num_blocks as u64) < lastblock {
                    disk.warnx(format!(
                        "The entire disk partition is only {} diskblock large, but the \
                         disk is {} diskblocks long.",
                        p.num_blocks, lastblock
                    ));
                }
            }
        }
        if !self.parts[SGI_VOLHDR_SLOT].is_used()
            || self.parts[SGI_VOLHDR_SLOT].ptype != SGI_TYPE_VOLHDR
        {
            disk.warnx("Partition 9 should be of type 'SGI volhdr'.");
        }

        let ranges = self.data_ranges();
        for w in ranges.windows(2) {
            let ((_, _, prev_end), (n, start, _)) = (w[0], w[1]);
            if start <= prev_end {
                disk.warnx(format!(
                    "Partition {} overlaps sectors {}-{}.",
                    n + 1,
                    start,
                    prev_end
                ));
                nerrors += 1;
            }
        }
        for &(n, _, end) in &ranges {
            if end >= lastblock {
                disk.warnx(format!("Partition {} is ending beyond the disk.", n + 1));
                nerrors += 1;
            }
        }

        if !self.part_is_used(self.boot_partition()) {
            disk.warnx("The boot partition does not exist.");
        }
        match self.parts.get(self.swap_partition()) {
            Some(p) if !p.is_used() => disk.warnx("The swap partition does not exist."),
            Some(p) if p.ptype != SGI_TYPE_SWAP && p.ptype != LINUX_SWAP => {
                disk.warnx("The swap partition has no swap type.")
            }
            _ => {}
        }
        if self.bootfile != "/unix" {
            disk.info("You have chosen an unusual bootfile name.");
        }

        if nerrors == 0 {
            let free: u64 = self.free(disk).iter().map(|&(s, e)| e - s + 1).sum();
            disk.info(format!("Remaining {} unallocated sectors.", free));
        }
        Ok(nerrors)
    }

    fn write(&mut self, disk: &mut Disk) -> Result<()> {
        let buf = self.render();
        disk.write_sectors(0, &buf)?;
        let v = &self.volumes[0];
        if let (Some(info), true) = (&self.info, v.name == "sgilabel") {
            disk.write_at(v.block_num as u64 * SGI_LABEL_SIZE as u64, info)?;
        }
        self.raw = buf.clone();
        disk.set_firstsector(buf);
        Ok(())
    }

    fn list(&self, disk: &Disk) -> Result<()> {
        let raw = &self.raw;
        let dp = DEVPARAM_OFFSET;
        if disk.is_details() {
            disk.info(format!(
                "Label geometry: {} heads, {} sectors\n                {} cylinders, {} physical cylinders\n                {} extra sects/cyl, interleave {}:1",
                be_u16(raw, dp + 8),
                be_u16(raw, dp + 12),
                be_u16(raw, dp + 4).saturating_sub(raw[dp + 3] as u16),
                be_u16(raw, dp + 4),
                raw[dp + 3],
                be_u16(raw, dp + 16),
            ));
        }
        disk.info(format!("Bootfile: {}", self.bootfile));
        if disk.is_details() {
            for (i, v) in self.volumes.iter().enumerate().filter(|(_, v)| v.num_bytes != 0) {
                disk.info(format!(
                    "{:2}: {:<10} sector{:5} size{:8}",
                    i, v.name, v.block_num, v.num_bytes
                ));
            }
        }
        Ok(())
    }

    fn locate(&self, _disk: &Disk, n: usize) -> Result<(&'static str, u64, usize)> {
        match n {
            0 => Ok(("SGI label", 0, SGI_LABEL_SIZE)),
            1 if self.info.is_some() => Ok((
                "SGI info",
                self.volumes[0].block_num as u64 * SGI_LABEL_SIZE as u64,
                SGI_LABEL_SIZE,
            )),
            _ => Err(Error::not_found(format!("SGI label area {}", n))),
        }
    }

    fn deinit(&mut self) {
        let disabled = self.state.disabled;
        *self = Self::new();
        self.state.disabled = disabled;
    }

    fn get_id(&self) -> Option<String> {
        None
    }

    fn set_id(&mut self, _disk: &Disk) -> Result<()> {
        Err(Error::unsupported("sgi: disk identifier"))
    }

    fn get_part(&self, _disk: &Disk, n: usize) -> Result<Partition> {
        let p = self
            .parts
            .get(n)
            .ok_or_else(|| Error::out_of_range(format!("partition {} does not exist", n + 1)))?;
        let mut pa = Partition::new();
        pa.partno = Some(n);
        if !p.is_used() {
            return Ok(pa);
        }
        pa.used = true;
        pa.set_start(p.first_block as u64);
        pa.set_size(p.num_blocks as u64);
        pa.parttype = Some(parttype::from_code(SGI_PARTTYPES, p.ptype));
        pa.boot = self.boot_partition() == n;
        let swap = self.swap_partition() == n;
        pa.attrs = Some(format!(
            "{}{}",
            if swap { 's' } else { ' ' },
            if pa.boot { 'b' } else { ' ' }
        ));
        Ok(pa)
    }

    fn part_is_used(&self, n: usize) -> bool {
        self.parts.get(n).is_some_and(SgiPartition::is_used)
    }

    fn add_part(&mut self, disk: &mut Disk, pa: Option<&Partition>) -> Result<usize> {
        let n = self.next_partno(disk, pa)?;
        if self.part_is_used(n) {
            disk.warnx(format!(
                "Partition {} is already defined.  Delete it before re-adding it.",
                n + 1
            ));
            return Err(Error::duplicate(format!("partition {} is already defined", n + 1)));
        }
        let ptype = match n {
            SGI_ENTIRE_SLOT => SGI_TYPE_ENTIRE_DISK,
            SGI_VOLHDR_SLOT => SGI_TYPE_VOLHDR,
            _ => match pa.and_then(|p| p.parttype.as_ref()) {
                Some(t) => Self::checked_type(t)?,
                None => SGI_TYPE_XFS,
            },
        };

        if self.entire().is_none() && ptype != SGI_TYPE_ENTIRE_DISK {
            disk.info("Attempting to generate entire disk entry automatically.");
            self.set_entire(disk)?;
            self.set_volhdr(disk)?;
        }
        if self.has_overlap() {
            disk.warnx("You got a partition overlap on the disk. Fix it first!");
            return Err(Error::invalid_label("partitions overlap"));
        }

        let (start, end) = if ptype == SGI_TYPE_ENTIRE_DISK {
            let last = Self::lastblock(disk).saturating_sub(1);
            planner::place(disk, &[(0, last)], pa, Grid::Exact)?
        } else {
            let free = self.free(disk);
            if free.is_empty() {
                disk.warnx("The entire disk is already covered with partitions.");
                return Err(Error::no_space("the entire disk is already covered"));
            }
            planner::place(disk, &free, pa, Grid::Exact)?
        };
        if ptype == SGI_TYPE_ENTIRE_DISK && (start != 0 || end + 1 != Self::lastblock(disk)) {
            disk.info(
                "It is highly recommended that eleventh partition covers the entire disk \
                 and is of type 'SGI volume'.",
            );
        }
        self.set_part(n, start, end - start + 1, ptype)?;
        Ok(n)
    }

    fn del_part(&mut self, _disk: &mut Disk, n: usize) -> Result<()> {
        *self.part_mut(n)? = SgiPartition::default();
        self.refresh_counts();
        self.state.changed = true;
        Ok(())
    }

    fn set_part_type(&mut self, disk: &Disk, n: usize, t: &PartType) -> Result<()> {
        let code = Self::checked_type(t)?;
        let cur = *self.part_mut(n)?;
        if (n == SGI_ENTIRE_SLOT && code != SGI_TYPE_ENTIRE_DISK)
            || (n == SGI_VOLHDR_SLOT && code != SGI_TYPE_VOLHDR)
        {
            disk.info(
                "Consider leaving partition 9 as volume header (0), and partition 11 as \
                 entire volume (6), as IRIX expects it.",
            );
        }
        if code != SGI_TYPE_ENTIRE_DISK && code != SGI_TYPE_VOLHDR && cur.first_block == 0 {
            let sure = disk.ask_yesno(
                "It is highly recommended that the partition at offset 0 is of type \
                 \"SGI volhdr\", the IRIX system will rely on it to retrieve from its \
                 directory standalone tools like sash and fx. Only the \"SGI volume\" \
                 entire disk section may violate this. Are you sure about tagging this \
                 partition differently?",
            )?;
            if !sure {
                return Err(Error::aborted("partition type left unchanged"));
            }
        }
        self.part_mut(n)?.ptype = code;
        self.state.changed = true;
        Ok(())
    }

    fn toggle_part_flag(&mut self, _disk: &Disk, n: usize, flag: u64) -> Result<()> {
        if !self.part_is_used(n) {
            return Err(Error::not_found(format!("partition {} is not used", n + 1)));
        }
        let slot = match flag {
            SGI_FLAG_BOOT => &mut self.root_part,
            SGI_FLAG_SWAP => &mut self.swap_part,
            _ => return Err(Error::invalid_argument(format!("unknown SGI flag {}", flag))),
        };
        *slot = if *slot as usize == n { 0 } else { n as u16 };
        self.state.changed = true;
        Ok(())
    }

    fn usable_range(&self, disk: &Disk) -> (u64, u64) {
        (0, Self::lastblock(disk).saturating_sub(1))
    }
}

impl Context {
    fn sgi_mut(&mut self) -> Result<(&mut Disk, &mut SgiLabel)> {
        self.check_writable()?;
        match self.active_parts()? {
            (disk, Label::Sgi(sgi)) => Ok((disk, sgi)),
            _ => Err(Error::invalid_operation("not an SGI label")),
        }
    }

    /// Set the IRIX boot file; `None` asks for it
    pub fn sgi_set_bootfile(&mut self, name: Option<&str>) -> Result<()> {
        let (disk, sgi) = self.sgi_mut()?;
        sgi.set_bootfile(disk, name)
    }

    /// Add the information block IRIX tools expect in the volume header
    pub fn sgi_create_info(&mut self) -> Result<()> {
        let (disk, sgi) = self.sgi_mut()?;
        sgi.create_info(disk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disklabel_core::{DefaultAnswers, DeviceIo};
    use std::io::Cursor;

    const MIB: usize = 1024 * 1024;

    fn sgi_context() -> Context {
        let mut cxt = Context::new();
        cxt.set_ask_handler(DefaultAnswers);
        let dev: Box<dyn DeviceIo> = Box::new(Cursor::new(vec![0u8; 64 * MIB]));
        cxt.assign_device_handle(dev, "disk.img", false).unwrap();
        cxt.create_disklabel(Some("sgi")).unwrap();
        cxt
    }

    #[test]
    fn test_create_defaults() {
        let cxt = sgi_context();
        let last = cxt.geom_cylinders() * cxt.geom_heads() as u64 * cxt.geom_sectors();

        let volhdr = cxt.get_partition(SGI_VOLHDR_SLOT).unwrap();
        assert_eq!(volhdr.start, Some(0));
        assert_eq!(volhdr.size(), Some(4096));
        assert_eq!(volhdr.parttype.unwrap().name, "SGI volhdr");

        let entire = cxt.get_partition(SGI_ENTIRE_SLOT).unwrap();
        assert_eq!(entire.size(), Some(last));
        assert_eq!(entire.parttype.unwrap().code, SGI_TYPE_ENTIRE_DISK);
        assert_eq!(cxt.verify_disklabel().unwrap(), 0);
    }

    #[test]
    fn test_add_after_volume_header() {
        let mut cxt = sgi_context();
        let mut pa = Partition::new();
        pa.start_follow_default(true);
        pa.partno_follow_default(true);
        pa.set_size(8192);
        let n = cxt.add_partition(Some(&pa)).unwrap();
        assert_eq!(n, 0);
        let p = cxt.get_partition(0).unwrap();
        assert_eq!(p.start, Some(4096));
        assert_eq!(p.parttype.unwrap().name, "SGI xfs");

        // offset 0 retyping needs confirmation
        let swap = parttype::from_code(SGI_PARTTYPES, SGI_TYPE_SWAP);
        assert!(cxt.set_partition_type(SGI_VOLHDR_SLOT, &swap).is_err());
        cxt.set_partition_type(0, &swap).unwrap();

        // slot numbers default to the first partition
        assert_eq!(cxt.get_partition(0).unwrap().attrs.as_deref(), Some("sb"));
        let n = cxt.add_partition(Some(&pa)).unwrap();
        assert_eq!(n, 1);
        assert_eq!(cxt.get_partition(1).unwrap().start, Some(12288));
        cxt.toggle_partition_flag(1, SGI_FLAG_SWAP).unwrap();
        assert_eq!(cxt.get_partition(1).unwrap().attrs.as_deref(), Some("s "));
        assert_eq!(cxt.get_partition(0).unwrap().attrs.as_deref(), Some(" b"));
    }

    #[test]
    fn test_write_and_reprobe() {
        let mut cxt = sgi_context();
        cxt.sgi_set_bootfile(Some("/unix.save")).unwrap();
        assert!(cxt.sgi_set_bootfile(Some("unix")).is_err());
        assert!(cxt.sgi_set_bootfile(Some("/a/very/long/boot/file")).is_err());
        cxt.sgi_create_info().unwrap();
        cxt.write_disklabel().unwrap();
        assert_eq!(word_sum(cxt.disk().firstsector()), 0);
        assert_eq!(cxt.locate_disklabel(1).unwrap().1, 1024);

        let mut img = vec![0u8; SGI_LABEL_SIZE];
        cxt.disk().read_at(0, &mut img).unwrap();
        let mut back = SgiLabel::new();
        back.parse(&img);
        assert_eq!(back.bootfile(), "/unix.save");
        assert_eq!(back.volumes[0].name, "sgilabel");
        assert_eq!(back.parts[SGI_VOLHDR_SLOT].num_blocks, VOLHDR_SECTORS);
    }

    #[test]
    fn test_wrong_checksum_still_probes() {
        let mut cxt = sgi_context();
        cxt.write_disklabel().unwrap();
        let mut img = vec![0u8; 64 * MIB];
        cxt.disk().read_at(0, &mut img[..SGI_LABEL_SIZE]).unwrap();
        img[CSUM_OFFSET] ^= 0xff;

        let mut again = Context::new();
        again.set_ask_handler(DefaultAnswers);
        again
            .assign_device_handle(Box::new(Cursor::new(img)), "disk.img", true)
            .unwrap();
        assert!(again.is_label(LabelKind::Sgi));
        assert!(again.is_partition_used(SGI_ENTIRE_SLOT));
    }
}
