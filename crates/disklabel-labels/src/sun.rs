//! Sun disklabel
//!
//! A big-endian 512-byte label in the first sector with 8 partitions, each
//! starting on a cylinder boundary. Partition 3 conventionally covers the
//! whole disk.

use crate::context::{Context, Disk};
use crate::label::{Label, LabelKind, LabelOps, LabelState};
use crate::planner::{self, Grid};
use disklabel_core::{
    free_runs, parttype, Error, Field, FieldId, PartType, PartTypeDef, Partition, Result,
};

pub const SUN_LABEL_MAGIC: u16 = 0xDABE;
pub const SUN_VTOC_SANITY: u32 = 0x600D_DEEE;
pub const SUN_VTOC_VERSION: u32 = 1;
pub const SUN_MAXPARTITIONS: usize = 8;
pub const SUN_LABEL_SIZE: usize = 512;
/// Slot of the whole disk partition
pub const SUN_WHOLEDISK_SLOT: usize = 2;

pub const SUN_TAG_UNASSIGNED: u32 = 0x00;
pub const SUN_TAG_SWAP: u32 = 0x03;
pub const SUN_TAG_WHOLEDISK: u32 = 0x05;
pub const SUN_TAG_LINUX_SWAP: u32 = 0x82;
pub const SUN_TAG_LINUX_NATIVE: u32 = 0x83;

pub const SUN_FLAG_UNMNT: u64 = 0x01;
pub const SUN_FLAG_RONLY: u64 = 0x10;

const LABEL_ID_SIZE: usize = 128;
const VTOC_VERSION: usize = 128;
const VTOC_VOLUME_ID: usize = 132;
const VTOC_NPARTS: usize = 140;
const VTOC_INFOS: usize = 142;
const VTOC_SANITY: usize = 188;
const RPM: usize = 420;
const PCYL: usize = 422;
const APC: usize = 424;
const INTRLV: usize = 430;
const NCYL: usize = 432;
const ACYL: usize = 434;
const NHEAD: usize = 436;
const NSECT: usize = 438;
const PARTITIONS: usize = 444;
const MAGIC: usize = 508;
const CSUM: usize = 510;

pub const SUN_PARTTYPES: &[PartTypeDef] = &[
    PartTypeDef::code(0x00, "Unassigned"),
    PartTypeDef::code(0x01, "Boot"),
    PartTypeDef::code(0x02, "SunOS root"),
    PartTypeDef::code(0x03, "SunOS swap"),
    PartTypeDef::code(0x04, "SunOS usr"),
    PartTypeDef::code(0x05, "Whole disk"),
    PartTypeDef::code(0x06, "SunOS stand"),
    PartTypeDef::code(0x07, "SunOS var"),
    PartTypeDef::code(0x08, "SunOS home"),
    PartTypeDef::code(0x09, "SunOS alt sectors"),
    PartTypeDef::code(0x0a, "SunOS cachefs"),
    PartTypeDef::code(0x0b, "SunOS reserved"),
    PartTypeDef::code(0x82, "Linux swap"),
    PartTypeDef::code(0x83, "Linux native"),
    PartTypeDef::code(0x8e, "Linux LVM"),
    PartTypeDef::code(0xfd, "Linux raid autodetect"),
];

static SUN_FIELDS: &[Field] = &[
    Field::text(FieldId::Device, "Device", 10.0),
    Field::number(FieldId::Start, "Start", 6.0),
    Field::number(FieldId::End, "End", 6.0),
    Field::number(FieldId::Sectors, "Sectors", 6.0),
    Field::number(FieldId::Cylinders, "Cylinders", 6.0),
    Field::number(FieldId::Size, "Size", 6.0),
    Field::number(FieldId::TypeId, "Id", 2.0),
    Field::text(FieldId::Type, "Type", 0.1).eyecandy(),
    Field::text(FieldId::Attr, "Flags", 0.0),
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

fn xor16(buf: &[u8]) -> u16 {
    buf.chunks_exact(2)
        .fold(0, |acc, w| acc ^ u16::from_be_bytes([w[0], w[1]]))
}

fn to_u16(v: u64) -> u16 {
    v.min(u16::MAX as u64) as u16
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SunPartition {
    start_cylinder: u32,
    num_sectors: u32,
    tag: u16,
    flags: u16,
}

impl SunPartition {
    fn is_used(&self) -> bool {
        self.num_sectors != 0
    }
}

/// Drive parameters recorded in the label
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SunDrive {
    pub rpm: u16,
    pub pcyl: u16,
    /// Extra sectors per cylinder
    pub apc: u16,
    pub intrlv: u16,
    pub ncyl: u16,
    /// Alternate cylinders
    pub acyl: u16,
    pub nhead: u16,
    pub nsect: u16,
}

/// Sun disklabel
#[derive(Debug, Clone)]
pub struct SunLabel {
    state: LabelState,
    raw: Vec<u8>,
    drive: SunDrive,
    parts: [SunPartition; SUN_MAXPARTITIONS],
}

impl Default for SunLabel {
    fn default() -> Self {
        Self::new()
    }
}

impl SunLabel {
    pub fn new() -> Self {
        Self {
            state: LabelState::default(),
            raw: vec![0u8; SUN_LABEL_SIZE],
            drive: SunDrive::default(),
            parts: [SunPartition::default(); SUN_MAXPARTITIONS],
        }
    }

    pub fn drive(&self) -> &SunDrive {
        &self.drive
    }

    /// Informative text at the start of the label
    pub fn label_id(&self) -> String {
        let b = &self.raw[..LABEL_ID_SIZE];
        let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
        String::from_utf8_lossy(&b[..end]).into_owned()
    }

    fn refresh_counts(&mut self) {
        self.state.nparts_max = SUN_MAXPARTITIONS;
        self.state.nparts_cur = self.parts.iter().filter(|p| p.is_used()).count();
    }

    fn spc(disk: &Disk) -> u64 {
        disk.geometry().sectors_per_cylinder().max(1)
    }

    fn disk_sectors(disk: &Disk) -> u64 {
        let g = disk.geometry();
        match g.sectors_per_cylinder() * g.cylinders {
            0 => disk.total_sectors(),
            n => n,
        }
    }

    fn range(&self, disk: &Disk, n: usize) -> Option<(u64, u64)> {
        let p = self.parts.get(n).filter(|p| p.is_used())?;
        let start = p.start_cylinder as u64 * Self::spc(disk);
        Some((start, start + p.num_sectors as u64 - 1))
    }

    /// Extents other than whole-disk entries, sorted by start
    fn data_ranges(&self, disk: &Disk) -> Vec<(usize, u64, u64)> {
        let mut out: Vec<(usize, u64, u64)> = (0..SUN_MAXPARTITIONS)
            .filter(|&i| {
                let tag = self.parts[i].tag as u32;
                tag != SUN_TAG_UNASSIGNED && tag != SUN_TAG_WHOLEDISK
            })
            .filter_map(|i| self.range(disk, i).map(|(s, e)| (i, s, e)))
            .collect();
        out.sort_by_key(|&(_, s, _)| s);
        out
    }

    fn set_part(&mut self, disk: &Disk, n: usize, start: u64, stop: u64, tag: u32) -> Result<()> {
        let start_cylinder = u32::try_from(start / Self::spc(disk))
            .map_err(|_| Error::out_of_range("start cylinder does not fit a Sun label"))?;
        let num_sectors = u32::try_from(stop - start)
            .map_err(|_| Error::out_of_range("partition size does not fit a Sun label"))?;
        self.parts[n] = SunPartition {
            start_cylinder,
            num_sectors,
            tag: tag as u16,
            flags: 0,
        };
        self.refresh_counts();
        self.state.changed = true;
        Ok(())
    }

    fn part_mut(&mut self, n: usize) -> Result<&mut SunPartition> {
        self.parts
            .get_mut(n)
            .filter(|p| p.is_used())
            .ok_or_else(|| Error::not_found(format!("partition {} is not used", n + 1)))
    }

    fn checked_tag(t: &PartType) -> Result<u32> {
        if t.typestr().is_some() || t.code > u16::MAX as u32 {
            return Err(Error::unknown_type(format!(
                "type '{}' is not valid for a Sun label",
                t.id_string()
            )));
        }
        Ok(t.code)
    }

    fn parse(&mut self, buf: &[u8]) {
        self.raw = buf[..SUN_LABEL_SIZE].to_vec();
        self.drive = SunDrive {
            rpm: be_u16(buf, RPM),
            pcyl: be_u16(buf, PCYL),
            apc: be_u16(buf, APC),
            intrlv: be_u16(buf, INTRLV),
            ncyl: be_u16(buf, NCYL),
            acyl: be_u16(buf, ACYL),
            nhead: be_u16(buf, NHEAD),
            nsect: be_u16(buf, NSECT),
        };
        for (i, p) in self.parts.iter_mut().enumerate() {
            let off = PARTITIONS + i * 8;
            let info = VTOC_INFOS + i * 4;
            *p = SunPartition {
                start_cylinder: be_u32(buf, off),
                num_sectors: be_u32(buf, off + 4),
                tag: be_u16(buf, info),
                flags: be_u16(buf, info + 2),
            };
        }
    }

    fn render(&self) -> Vec<u8> {
        let mut b = self.raw.clone();
        b.resize(SUN_LABEL_SIZE, 0);
        let d = self.drive;
        put_u32(&mut b, VTOC_VERSION, SUN_VTOC_VERSION);
        put_u16(&mut b, VTOC_NPARTS, SUN_MAXPARTITIONS as u16);
        put_u32(&mut b, VTOC_SANITY, SUN_VTOC_SANITY);
        put_u16(&mut b, RPM, d.rpm);
        put_u16(&mut b, PCYL, d.pcyl);
        put_u16(&mut b, APC, d.apc);
        put_u16(&mut b, INTRLV, d.intrlv);
        put_u16(&mut b, NCYL, d.ncyl);
        put_u16(&mut b, ACYL, d.acyl);
        put_u16(&mut b, NHEAD, d.nhead);
        put_u16(&mut b, NSECT, d.nsect);
        for (i, p) in self.parts.iter().enumerate() {
            let off = PARTITIONS + i * 8;
            let info = VTOC_INFOS + i * 4;
            put_u32(&mut b, off, p.start_cylinder);
            put_u32(&mut b, off + 4, p.num_sectors);
            put_u16(&mut b, info, p.tag);
            put_u16(&mut b, info + 2, p.flags);
        }
        put_u16(&mut b, MAGIC, SUN_LABEL_MAGIC);
        put_u16(&mut b, CSUM, 0);
        let csum = xor16(&b[..CSUM]);
        put_u16(&mut b, CSUM, csum);
        b
    }

    fn set_drive_param(&mut self, disk: &Disk, param: DriveParam, low: u64, high: u64) -> Result<()> {
        let slot = match param {
            DriveParam::AltCylinders => &mut self.drive.acyl,
            DriveParam::ExtraSectors => &mut self.drive.apc,
            DriveParam::Interleave => &mut self.drive.intrlv,
            DriveParam::Rpm => &mut self.drive.rpm,
            DriveParam::PhysCylinders => &mut self.drive.pcyl,
        };
        let dflt = (*slot as u64).clamp(low, high);
        *slot = to_u16(disk.ask_number(param.query(), low, dflt, high)?);
        self.state.changed = true;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum DriveParam {
    AltCylinders,
    ExtraSectors,
    Interleave,
    Rpm,
    PhysCylinders,
}

impl DriveParam {
    fn query(self) -> &'static str {
        match self {
            DriveParam::AltCylinders => "Number of alternate cylinders",
            DriveParam::ExtraSectors => "Extra sectors per cylinder",
            DriveParam::Interleave => "Interleave factor",
            DriveParam::Rpm => "Rotation speed (rpm)",
            DriveParam::PhysCylinders => "Number of physical cylinders",
        }
    }
}

impl LabelOps for SunLabel {
    fn kind(&self) -> LabelKind {
        LabelKind::Sun
    }

    fn state(&self) -> &LabelState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut LabelState {
        &mut self.state
    }

    fn fields(&self) -> &'static [Field] {
        SUN_FIELDS
    }

    fn require_geometry(&self) -> bool {
        true
    }

    fn probe(&mut self, disk: &mut Disk) -> Result<bool> {
        let buf = disk.firstsector();
        if buf.len() < SUN_LABEL_SIZE || be_u16(buf, MAGIC) != SUN_LABEL_MAGIC {
            return Ok(false);
        }
        let csum_ok = xor16(&buf[..SUN_LABEL_SIZE]) == 0;
        let vtoc_ok = be_u32(buf, VTOC_VERSION) == SUN_VTOC_VERSION
            && be_u32(buf, VTOC_SANITY) == SUN_VTOC_SANITY
            && be_u16(buf, VTOC_NPARTS) as usize == SUN_MAXPARTITIONS;

        let mut lb = Self::new();
        lb.parse(buf);
        lb.state.disabled = self.state.disabled;
        lb.refresh_counts();
        *self = lb;

        if !csum_ok {
            disk.warnx(
                "Detected sun disklabel with wrong checksum. Probably you'll have to set \
                 all the values, e.g. heads, sectors, cylinders and partitions or force \
                 a fresh label (s command in main menu)",
            );
        }
        if !vtoc_ok {
            disk.warnx("Detected sun disklabel with wrong vtoc, fixing it.");
            self.state.changed = true;
        }

        let d = self.drive;
        if d.nhead != 0 && d.nsect != 0 && d.ncyl != 0 {
            let geom = &mut disk.topology_mut().geom;
            geom.heads = d.nhead as u32;
            geom.sectors = d.nsect as u64;
            geom.cylinders = d.ncyl as u64;
        }
        tracing::debug!(
            heads = d.nhead,
            sectors = d.nsect,
            cylinders = d.ncyl,
            "found Sun label"
        );
        Ok(true)
    }

    fn create(&mut self, disk: &mut Disk) -> Result<()> {
        self.deinit();
        let g = disk.geometry();
        self.drive = SunDrive {
            rpm: 5400,
            pcyl: to_u16(g.cylinders),
            apc: 0,
            intrlv: 1,
            ncyl: to_u16(g.cylinders),
            acyl: 0,
            nhead: g.heads.min(u16::MAX as u32) as u16,
            nsect: to_u16(g.sectors),
        };
        let id = format!(
            "Linux cyl {} alt {} hd {} sec {}",
            g.cylinders, self.drive.acyl, g.heads, g.sectors
        );
        let len = id.len().min(LABEL_ID_SIZE - 1);
        self.raw[..len].copy_from_slice(&id.as_bytes()[..len]);
        self.refresh_counts();

        // default layout: data, 50M of swap behind it, the whole disk
        if disk.script().is_none() {
            let spc = g.sectors_per_cylinder().max(1);
            let ndiv = if g.cylinders * spc >= 150 * 2048 {
                g.cylinders.saturating_sub(50 * 2048 / spc)
            } else {
                g.cylinders * 2 / 3
            };
            let whole = g.cylinders * spc;
            self.set_part(disk, 0, 0, ndiv * spc, SUN_TAG_LINUX_NATIVE)?;
            self.set_part(disk, 1, ndiv * spc, whole, SUN_TAG_LINUX_SWAP)?;
            self.parts[1].flags |= SUN_FLAG_UNMNT as u16;
            self.set_part(disk, SUN_WHOLEDISK_SLOT, 0, whole, SUN_TAG_WHOLEDISK)?;
        }
        disk.info("Created a new Sun disklabel.");
        Ok(())
    }

    fn verify(&self, disk: &Disk) -> Result<usize> {
        let spc = Self::spc(disk);
        let total = Self::disk_sectors(disk);
        let mut nerrors = 0;

        for (i, p) in self.parts.iter().enumerate().filter(|(_, p)| p.is_used()) {
            if p.num_sectors as u64 % spc != 0 {
                disk.warnx(format!(
                    "Partition {} doesn't end on cylinder boundary.",
                    i + 1
                ));
            }
        }

        let ranges = self.data_ranges(disk);
        if ranges.is_empty() {
            disk.warnx("No partitions defined.");
            return Ok(0);
        }
        for (k, &(i, s, e)) in ranges.iter().enumerate() {
            for &(j, s2, e2) in &ranges[k + 1..] {
                if s2 <= e && s <= e2 {
                    disk.warnx(format!(
                        "Partition {} overlaps with partition {} in sectors {}-{}.",
                        i + 1,
                        j + 1,
                        s.max(s2),
                        e.min(e2)
                    ));
                    nerrors += 1;
                }
            }
            if e >= total {
                disk.warnx(format!("Partition {} is ending beyond the disk.", i + 1));
                nerrors += 1;
            }
        }

        let used = ranges.iter().map(|&(_, s, e)| (s, e));
        for (s, e) in free_runs(0, total.saturating_sub(1), used) {
            disk.warnx(format!("Unused gap - sectors {}-{}", s, e));
        }
        Ok(nerrors)
    }

    fn write(&mut self, disk: &mut Disk) -> Result<()> {
        let buf = self.render();
        disk.write_sectors(0, &buf)?;
        self.raw = buf.clone();
        disk.set_firstsector(buf);
        Ok(())
    }

    fn list(&self, disk: &Disk) -> Result<()> {
        let d = &self.drive;
        if disk.is_details() {
            disk.info(format!(
                "Label geometry: {} rpm, {} alternate and {} physical cylinders,\n                {} extra sects/cyl, interleave {}:1",
                d.rpm, d.acyl, d.pcyl, d.apc, d.intrlv
            ));
            disk.info(format!("Label ID: {}", self.label_id()));
            let vol = &self.raw[VTOC_VOLUME_ID..VTOC_VOLUME_ID + 8];
            if vol.iter().any(|&c| c != 0) {
                disk.info(format!(
                    "Volume ID: {}",
                    String::from_utf8_lossy(vol).trim_end_matches('\0')
                ));
            }
        }
        Ok(())
    }

    fn locate(&self, _disk: &Disk, n: usize) -> Result<(&'static str, u64, usize)> {
        match n {
            0 => Ok(("Sun label", 0, SUN_LABEL_SIZE)),
            _ => Err(Error::not_found(format!("Sun label area {}", n))),
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
        Err(Error::unsupported("sun: disk identifier"))
    }

    fn get_part(&self, disk: &Disk, n: usize) -> Result<Partition> {
        let p = self
            .parts
            .get(n)
            .ok_or_else(|| Error::out_of_range(format!("partition {} does not exist", n + 1)))?;
        let mut pa = Partition::new();
        pa.partno = Some(n);
        let Some((start, _)) = self.range(disk, n) else {
            return Ok(pa);
        };
        pa.used = true;
        pa.set_start(start);
        pa.set_size(p.num_sectors as u64);
        pa.parttype = Some(parttype::from_code(SUN_PARTTYPES, p.tag as u32));
        let flags = p.flags as u64;
        pa.attrs = Some(format!(
            "{}{}",
            if flags & SUN_FLAG_UNMNT != 0 { 'u' } else { ' ' },
            if flags & SUN_FLAG_RONLY != 0 { 'r' } else { ' ' }
        ));
        Ok(pa)
    }

    fn part_is_used(&self, n: usize) -> bool {
        self.parts.get(n).is_some_and(SunPartition::is_used)
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
        let spc = Self::spc(disk);
        let total = Self::disk_sectors(disk);
        let whole = n == SUN_WHOLEDISK_SLOT && pa.and_then(|p| p.parttype.as_ref()).is_none();
        let tag = match pa.and_then(|p| p.parttype.as_ref()) {
            Some(t) => Self::checked_tag(t)?,
            None if whole => SUN_TAG_WHOLEDISK,
            None => SUN_TAG_LINUX_NATIVE,
        };

        let free = if tag == SUN_TAG_WHOLEDISK {
            vec![(0, total.saturating_sub(1))]
        } else {
            let used = self.data_ranges(disk).into_iter().map(|(_, s, e)| (s, e));
            free_runs(0, total.saturating_sub(1), used)
        };
        if free.is_empty() {
            disk.warnx("You may change all the disk params from the x menu.");
            return Err(Error::no_space("no free sectors available"));
        }
        let (mut start, end) =
            planner::place(disk, &free, pa, Grid::Cylinder { spc, track: 0 })?;
        if start % spc != 0 {
            let aligned = start.div_ceil(spc) * spc;
            disk.info(format!(
                "Aligning the first sector from {} to {} to be on cylinder boundary.",
                start, aligned
            ));
            start = aligned;
        }
        if start > end {
            return Err(Error::out_of_range("partition does not fit behind its cylinder"));
        }
        if tag == SUN_TAG_WHOLEDISK && (start != 0 || end + 1 != total) {
            disk.info(
                "It is highly recommended that the third partition covers the whole disk \
                 and is of type `Whole disk'",
            );
        }
        self.set_part(disk, n, start, end + 1, tag)?;
        if tag == SUN_TAG_LINUX_SWAP || tag == SUN_TAG_SWAP {
            self.parts[n].flags |= SUN_FLAG_UNMNT as u16;
        }
        Ok(n)
    }

    fn del_part(&mut self, disk: &mut Disk, n: usize) -> Result<()> {
        let p = *self.part_mut(n)?;
        let total = Self::disk_sectors(disk);
        if n == SUN_WHOLEDISK_SLOT
            && p.tag as u32 == SUN_TAG_WHOLEDISK
            && p.start_cylinder == 0
            && p.num_sectors as u64 == total
        {
            disk.info(format!(
                "If you want to maintain SunOS/Solaris compatibility, consider leaving \
                 this partition as Whole disk (5), starting at 0, with {} sectors",
                p.num_sectors
            ));
        }
        self.parts[n] = SunPartition::default();
        self.refresh_counts();
        self.state.changed = true;
        Ok(())
    }

    fn set_part_type(&mut self, disk: &Disk, n: usize, t: &PartType) -> Result<()> {
        let tag = Self::checked_tag(t)?;
        let cur = *self.part_mut(n)?;
        if tag == SUN_TAG_LINUX_SWAP && cur.start_cylinder == 0 {
            let sure = disk.ask_yesno(
                "It is highly recommended that the partition at offset 0 is UFS, EXT2FS \
                 filesystem or SunOS swap. Putting Linux swap there may destroy your \
                 partition table and bootblock. Are you sure you want to tag the \
                 partition as Linux swap?",
            )?;
            if !sure {
                return Err(Error::aborted("partition type left unchanged"));
            }
        }
        let p = self.part_mut(n)?;
        p.tag = tag as u16;
        if tag == SUN_TAG_SWAP || tag == SUN_TAG_LINUX_SWAP {
            p.flags |= SUN_FLAG_UNMNT as u16;
        } else {
            p.flags &= !(SUN_FLAG_UNMNT as u16);
        }
        self.state.changed = true;
        Ok(())
    }

    fn toggle_part_flag(&mut self, _disk: &Disk, n: usize, flag: u64) -> Result<()> {
        if flag != SUN_FLAG_UNMNT && flag != SUN_FLAG_RONLY {
            return Err(Error::invalid_argument(format!("unknown Sun flag {:#x}", flag)));
        }
        self.part_mut(n)?.flags ^= flag as u16;
        self.state.changed = true;
        Ok(())
    }

    fn usable_range(&self, disk: &Disk) -> (u64, u64) {
        (0, Self::disk_sectors(disk).saturating_sub(1))
    }
}

impl Context {
    fn sun_mut(&mut self) -> Result<(&mut Disk, &mut SunLabel)> {
        self.check_writable()?;
        match self.active_parts()? {
            (disk, Label::Sun(sun)) => Ok((disk, sun)),
            _ => Err(Error::invalid_operation("not a Sun label")),
        }
    }

    /// Ask for the number of alternate cylinders
    pub fn sun_set_alt_cyl(&mut self) -> Result<()> {
        let (disk, sun) = self.sun_mut()?;
        sun.set_drive_param(disk, DriveParam::AltCylinders, 0, u16::MAX as u64)
    }

    /// Ask for the number of extra sectors per cylinder
    pub fn sun_set_xcyl(&mut self) -> Result<()> {
        let (disk, sun) = self.sun_mut()?;
        let high = disk.geometry().sectors;
        sun.set_drive_param(disk, DriveParam::ExtraSectors, 0, high)
    }

    pub fn sun_set_ilfact(&mut self) -> Result<()> {
        let (disk, sun) = self.sun_mut()?;
        sun.set_drive_param(disk, DriveParam::Interleave, 1, 32)
    }

    pub fn sun_set_rspeed(&mut self) -> Result<()> {
        let (disk, sun) = self.sun_mut()?;
        sun.set_drive_param(disk, DriveParam::Rpm, 1, u16::MAX as u64)
    }

    pub fn sun_set_pcylcount(&mut self) -> Result<()> {
        let (disk, sun) = self.sun_mut()?;
        sun.set_drive_param(disk, DriveParam::PhysCylinders, 0, u16::MAX as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextConfig;
    use disklabel_core::{Ask, DefaultAnswers, DeviceIo};
    use std::io::Cursor;

    const MIB: usize = 1024 * 1024;

    // 16 heads, 32 sectors: 512 sectors per cylinder
    fn sun_context() -> Context {
        let mut cxt = Context::with_config(ContextConfig::default().geometry(0, 16, 32));
        cxt.set_ask_handler(DefaultAnswers);
        let dev: Box<dyn DeviceIo> = Box::new(Cursor::new(vec![0u8; 64 * MIB]));
        cxt.assign_device_handle(dev, "disk.img", false).unwrap();
        cxt.create_disklabel(Some("sun")).unwrap();
        cxt
    }

    #[test]
    fn test_default_layout() {
        let cxt = sun_context();
        assert_eq!(cxt.geom_cylinders(), 256);

        // 256 * 512 sectors is below 150M, so data takes two thirds
        let root = cxt.get_partition(0).unwrap();
        assert_eq!(root.start, Some(0));
        assert_eq!(root.size(), Some(170 * 512));
        let swap = cxt.get_partition(1).unwrap();
        assert_eq!(swap.start, Some(170 * 512));
        assert_eq!(swap.attrs.as_deref(), Some("u "));
        let whole = cxt.get_partition(2).unwrap();
        assert_eq!(whole.size(), Some(256 * 512));
        assert_eq!(whole.parttype.unwrap().name, "Whole disk");
        assert_eq!(cxt.verify_disklabel().unwrap(), 0);
    }

    #[test]
    fn test_add_on_cylinder_boundary() {
        let mut cxt = sun_context();
        cxt.delete_partition(1).unwrap();

        let mut pa = Partition::new();
        pa.set_start(170 * 512 + 3);
        pa.set_size(1024);
        pa.set_partno(3);
        let n = cxt.add_partition(Some(&pa)).unwrap();
        assert_eq!(n, 3);
        let p = cxt.get_partition(3).unwrap();
        assert_eq!(p.start, Some(171 * 512));
        assert_eq!(p.parttype.unwrap().name, "Linux native");

        // the whole disk entry does not count as used space
        assert_eq!(cxt.verify_disklabel().unwrap(), 0);

        cxt.toggle_partition_flag(3, SUN_FLAG_RONLY).unwrap();
        assert_eq!(cxt.get_partition(3).unwrap().attrs.as_deref(), Some(" r"));
        assert!(cxt.toggle_partition_flag(3, 0x4).is_err());
    }

    #[test]
    fn test_linux_swap_at_offset_zero() {
        let mut cxt = sun_context();
        let swap = parttype::from_code(SUN_PARTTYPES, SUN_TAG_LINUX_SWAP);
        assert!(cxt.set_partition_type(0, &swap).is_err());
        cxt.set_partition_type(1, &parttype::from_code(SUN_PARTTYPES, 0x83)).unwrap();
        assert_eq!(cxt.get_partition(1).unwrap().attrs.as_deref(), Some("  "));
    }

    #[test]
    fn test_drive_parameters_and_reprobe() {
        let mut cxt = sun_context();
        cxt.set_ask_handler(|ask: &mut Ask| {
            if let Some(n) = ask.number_mut() {
                n.result = if n.query.starts_with("Rotation") { 7200 } else { 2 };
            }
            Ok(())
        });
        cxt.sun_set_rspeed().unwrap();
        cxt.sun_set_alt_cyl().unwrap();
        cxt.sun_set_ilfact().unwrap();
        cxt.write_disklabel().unwrap();

        let mut img = vec![0u8; 64 * MIB];
        cxt.disk().read_at(0, &mut img[..SUN_LABEL_SIZE]).unwrap();
        assert_eq!(xor16(&img[..SUN_LABEL_SIZE]), 0);

        let mut again = Context::new();
        again.set_ask_handler(DefaultAnswers);
        again
            .assign_device_handle(Box::new(Cursor::new(img)), "disk.img", true)
            .unwrap();
        assert!(again.is_label(LabelKind::Sun));
        // label geometry replaces the synthesized one
        assert_eq!(again.geom_heads(), 16);
        assert_eq!(again.geom_sectors(), 32);
        let sun = match again.label() {
            Some(Label::Sun(sun)) => sun,
            _ => panic!("not a Sun label"),
        };
        assert_eq!(sun.drive().rpm, 7200);
        assert_eq!(sun.drive().acyl, 2);
        assert_eq!(sun.drive().intrlv, 2);
        assert!(sun.label_id().starts_with("Linux cyl 256"));
    }
}
