//! BSD disklabel
//!
//! The label lives in the second sector of an 8 KiB bootstrap area, either at
//! the start of the disk or at the start of a DOS partition of a BSD type
//! (then used through a nested context). Slices are addressed by letter and
//! may overlap; slice `c` conventionally covers the whole area.

use crate::context::{Context, Disk};
use crate::label::{Label, LabelKind, LabelOps, LabelState};
use crate::planner::{self, Grid};
use disklabel_core::{
    parttype, Error, Field, FieldId, PartType, PartTypeDef, Partition, Result,
};

pub const BSD_DISKMAGIC: u32 = 0x8256_4557;
pub const BSD_MAXPARTITIONS: usize = 16;
/// Bootstrap area holding the label
pub const BSD_BBSIZE: usize = 8192;
pub const BSD_SBSIZE: u32 = 8192;
/// Offset of the label inside the bootstrap area
pub const BSD_LABEL_OFFSET: usize = 512;

const HEADER_SIZE: usize = 148;
const SLICE_SIZE: usize = 16;

/// DOS partition types that hold a BSD label
pub const DOS_BSD_TYPES: [u32; 3] = [0xa5, 0xa6, 0xa9];

pub const BSD_FS_UNUSED: u8 = 0;
pub const BSD_FS_MSDOS: u8 = 8;
pub const BSD_FS_OTHER: u8 = 10;
pub const BSD_FS_HPFS: u8 = 11;

pub const BSD_FSTYPES: &[PartTypeDef] = &[
    PartTypeDef::code(0, "unused"),
    PartTypeDef::code(1, "swap"),
    PartTypeDef::code(2, "Version 6"),
    PartTypeDef::code(3, "Version 7"),
    PartTypeDef::code(4, "System V"),
    PartTypeDef::code(5, "4.1BSD"),
    PartTypeDef::code(6, "Eighth Edition"),
    PartTypeDef::code(7, "4.2BSD"),
    PartTypeDef::code(8, "MS-DOS"),
    PartTypeDef::code(9, "4.4LFS"),
    PartTypeDef::code(10, "unknown"),
    PartTypeDef::code(11, "HPFS"),
    PartTypeDef::code(12, "ISO-9660"),
    PartTypeDef::code(13, "boot"),
    PartTypeDef::code(14, "ADOS"),
    PartTypeDef::code(15, "HFS"),
    PartTypeDef::code(16, "AdvFS"),
];

static BSD_FIELDS: &[Field] = &[
    Field::text(FieldId::Device, "Slice", 1.0),
    Field::number(FieldId::Start, "Start", 5.0),
    Field::number(FieldId::End, "End", 5.0),
    Field::number(FieldId::Sectors, "Sectors", 5.0),
    Field::number(FieldId::Cylinders, "Cylinders", 5.0),
    Field::number(FieldId::Size, "Size", 5.0),
    Field::text(FieldId::Type, "Type", 8.0),
    Field::number(FieldId::Fsize, "Fsize", 5.0),
    Field::number(FieldId::Bsize, "Bsize", 5.0),
    Field::number(FieldId::Cpg, "Cpg", 5.0),
];

/// BSD file system type for data copied from a DOS partition
fn fstype_for_dos(code: u32) -> u8 {
    match code {
        0x01 | 0x04 | 0x06 | 0xe1 | 0xe3 | 0xf2 => BSD_FS_MSDOS,
        0x07 => BSD_FS_HPFS,
        _ => BSD_FS_OTHER,
    }
}

fn le_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn le_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn put_u16(b: &mut [u8], off: usize, v: u16) {
    b[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// XOR of all 16-bit words
fn xor16(buf: &[u8]) -> u16 {
    buf.chunks_exact(2)
        .fold(0, |acc, w| acc ^ u16::from_le_bytes([w[0], w[1]]))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Slice {
    size: u32,
    offset: u32,
    fsize: u32,
    fstype: u8,
    frag: u8,
    cpg: u16,
}

impl Slice {
    fn from_bytes(b: &[u8]) -> Self {
        Self {
            size: le_u32(b, 0),
            offset: le_u32(b, 4),
            fsize: le_u32(b, 8),
            fstype: b[12],
            frag: b[13],
            cpg: le_u16(b, 14),
        }
    }

    fn to_bytes(self) -> [u8; SLICE_SIZE] {
        let mut b = [0u8; SLICE_SIZE];
        put_u32(&mut b, 0, self.size);
        put_u32(&mut b, 4, self.offset);
        put_u32(&mut b, 8, self.fsize);
        b[12] = self.fstype;
        b[13] = self.frag;
        put_u16(&mut b, 14, self.cpg);
        b
    }

    fn is_used(&self) -> bool {
        self.size != 0
    }
}

/// DOS partition a nested label lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Parent {
    partno: usize,
    start: u64,
    size: u64,
}

/// Drive parameters kept in the label header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BsdDrive {
    pub dtype: u16,
    pub secsize: u32,
    pub nsectors: u32,
    pub ntracks: u32,
    pub ncylinders: u32,
    pub secpercyl: u32,
    pub secperunit: u32,
    pub rpm: u16,
    pub interleave: u16,
    pub trackskew: u16,
    pub cylskew: u16,
    pub headswitch: u32,
    pub trkseek: u32,
    pub flags: u32,
}

/// BSD disklabel
#[derive(Debug, Clone)]
pub struct BsdLabel {
    state: LabelState,
    bootstrap: Vec<u8>,
    drive: BsdDrive,
    npartitions: usize,
    slices: [Slice; BSD_MAXPARTITIONS],
    parent: Option<Parent>,
}

impl Default for BsdLabel {
    fn default() -> Self {
        Self::new()
    }
}

impl BsdLabel {
    pub fn new() -> Self {
        Self {
            state: LabelState::default(),
            bootstrap: Vec::new(),
            drive: BsdDrive::default(),
            npartitions: 0,
            slices: [Slice::default(); BSD_MAXPARTITIONS],
            parent: None,
        }
    }

    pub fn drive(&self) -> &BsdDrive {
        &self.drive
    }

    /// Number of slices recorded in the label
    pub fn npartitions(&self) -> usize {
        self.npartitions
    }

    fn refresh_counts(&mut self) {
        self.state.nparts_max = BSD_MAXPARTITIONS;
        self.state.nparts_cur = self.slices.iter().filter(|s| s.is_used()).count();
    }

    /// First BSD-type partition of the parent context
    fn find_parent(disk: &Disk) -> Result<Option<Parent>> {
        if !disk.is_nested() {
            return Ok(None);
        }
        let tb = disk.parent_partitions()?;
        let found = tb.iter().find(|pa| {
            pa.parttype
                .as_ref()
                .is_some_and(|t| t.typestr().is_none() && DOS_BSD_TYPES.contains(&t.code))
        });
        match found {
            Some(pa) => Ok(Some(Parent {
                partno: pa.partno.unwrap_or_default(),
                start: pa.start.unwrap_or_default(),
                size: pa.size().unwrap_or_default(),
            })),
            None => Err(Error::not_found(format!(
                "there is no *BSD partition on {}",
                disk.dev_path()
            ))),
        }
    }

    fn base_sector(&self) -> u64 {
        self.parent.map_or(0, |p| p.start)
    }

    /// Sectors slices may use
    fn area(&self, disk: &Disk) -> (u64, u64) {
        match self.parent {
            Some(p) => (p.start, p.start + p.size.max(1) - 1),
            None => (0, disk.total_sectors().saturating_sub(1)),
        }
    }

    fn label_size(&self) -> usize {
        HEADER_SIZE + SLICE_SIZE * self.npartitions.max(1)
    }

    fn parse(&mut self, buf: &[u8]) -> Result<()> {
        let l = &buf[BSD_LABEL_OFFSET..];
        if le_u32(l, 0) != BSD_DISKMAGIC || le_u32(l, 132) != BSD_DISKMAGIC {
            return Err(Error::invalid_label("no BSD disklabel magic"));
        }
        let npart = le_u16(l, 138) as usize;
        let n = npart.min(BSD_MAXPARTITIONS);
        let size = HEADER_SIZE + SLICE_SIZE * npart.clamp(1, BSD_MAXPARTITIONS);
        if xor16(&l[..size]) != 0 {
            return Err(Error::ChecksumVerification("BSD disklabel".to_string()));
        }
        self.drive = BsdDrive {
            dtype: le_u16(l, 4),
            secsize: le_u32(l, 40),
            nsectors: le_u32(l, 44),
            ntracks: le_u32(l, 48),
            ncylinders: le_u32(l, 52),
            secpercyl: le_u32(l, 56),
            secperunit: le_u32(l, 60),
            rpm: le_u16(l, 72),
            interleave: le_u16(l, 74),
            trackskew: le_u16(l, 76),
            cylskew: le_u16(l, 78),
            headswitch: le_u32(l, 80),
            trkseek: le_u32(l, 84),
            flags: le_u32(l, 88),
        };
        self.npartitions = n;
        for i in 0..n {
            let off = HEADER_SIZE + i * SLICE_SIZE;
            self.slices[i] = Slice::from_bytes(&l[off..off + SLICE_SIZE]);
        }
        if npart > BSD_MAXPARTITIONS {
            tracing::warn!(npart, "BSD label claims too many partitions");
        }
        Ok(())
    }

    /// Serialize the label into the bootstrap buffer
    fn render(&mut self) {
        if self.bootstrap.len() < BSD_BBSIZE {
            self.bootstrap.resize(BSD_BBSIZE, 0);
        }
        let size = self.label_size();
        let d = self.drive;
        let npart = self.npartitions;
        let slices = self.slices;
        let l = &mut self.bootstrap[BSD_LABEL_OFFSET..BSD_LABEL_OFFSET + size];
        put_u32(l, 0, BSD_DISKMAGIC);
        put_u16(l, 4, d.dtype);
        put_u32(l, 40, d.secsize);
        put_u32(l, 44, d.nsectors);
        put_u32(l, 48, d.ntracks);
        put_u32(l, 52, d.ncylinders);
        put_u32(l, 56, d.secpercyl);
        put_u32(l, 60, d.secperunit);
        put_u16(l, 72, d.rpm);
        put_u16(l, 74, d.interleave);
        put_u16(l, 76, d.trackskew);
        put_u16(l, 78, d.cylskew);
        put_u32(l, 80, d.headswitch);
        put_u32(l, 84, d.trkseek);
        put_u32(l, 88, d.flags);
        put_u32(l, 132, BSD_DISKMAGIC);
        put_u16(l, 136, 0);
        put_u16(l, 138, npart as u16);
        put_u32(l, 140, BSD_BBSIZE as u32);
        put_u32(l, 144, BSD_SBSIZE);
        for (i, s) in slices.iter().take(npart.max(1)).enumerate() {
            let off = HEADER_SIZE + i * SLICE_SIZE;
            l[off..off + SLICE_SIZE].copy_from_slice(&s.to_bytes());
        }
        let sum = xor16(l);
        put_u16(l, 136, sum);
    }

    fn slice_mut(&mut self, n: usize) -> Result<&mut Slice> {
        self.slices
            .get_mut(n)
            .filter(|s| s.is_used())
            .ok_or_else(|| Error::not_found(format!("slice {} is not used", letter(n))))
    }

    fn grow_to(&mut self, n: usize) {
        if n >= self.npartitions {
            self.npartitions = n + 1;
        }
    }

    /// Copy partition `src` of the parent into slice `n` (asked if `None`)
    pub fn link(&mut self, disk: &Disk, src: &Partition, n: Option<usize>) -> Result<usize> {
        let (Some(start), Some(size)) = (src.start, src.size()) else {
            return Err(Error::not_found("source partition is not used"));
        };
        let n = match n {
            Some(n) if n < BSD_MAXPARTITIONS => n,
            Some(n) => {
                return Err(Error::out_of_range(format!(
                    "slice {} does not exist",
                    n + 1
                )))
            }
            None => planner::ask_partnum(&*self, disk, true)?,
        };
        let start = u32::try_from(start)
            .map_err(|_| Error::out_of_range("partition start does not fit a BSD label"))?;
        let size = u32::try_from(size)
            .map_err(|_| Error::out_of_range("partition size does not fit a BSD label"))?;
        let code = src.parttype.as_ref().map_or(0, |t| t.code);
        self.slices[n] = Slice {
            size,
            offset: start,
            fsize: 0,
            fstype: fstype_for_dos(code),
            frag: 0,
            cpg: 0,
        };
        self.grow_to(n);
        self.refresh_counts();
        self.state.changed = true;
        disk.info(format!(
            "BSD partition '{}' linked to Linux partition {}.",
            letter(n),
            src.partno.map_or(0, |p| p + 1)
        ));
        Ok(n)
    }

    /// Ask for the drive parameters users may tune
    pub fn edit_drive(&mut self, disk: &Disk) -> Result<()> {
        let d = &mut self.drive;
        d.rpm = disk.ask_number("rpm", 1, d.rpm.max(1) as u64, u16::MAX as u64)? as u16;
        d.interleave = disk.ask_number(
            "interleave",
            1,
            d.interleave.max(1) as u64,
            u16::MAX as u64,
        )? as u16;
        d.trackskew = disk.ask_number("trackskew", 0, d.trackskew as u64, u16::MAX as u64)? as u16;
        d.cylskew = disk.ask_number("cylinderskew", 0, d.cylskew as u64, u16::MAX as u64)? as u16;
        d.headswitch =
            disk.ask_number("headswitch", 0, d.headswitch as u64, u32::MAX as u64)? as u32;
        d.trkseek = disk.ask_number(
            "track-to-track seek",
            0,
            d.trkseek as u64,
            u32::MAX as u64,
        )? as u32;
        d.secperunit = d.secpercyl.saturating_mul(d.ncylinders);
        self.state.changed = true;
        Ok(())
    }
}

fn letter(n: usize) -> char {
    char::from(b'a' + (n % 26) as u8)
}

impl LabelOps for BsdLabel {
    fn kind(&self) -> LabelKind {
        LabelKind::Bsd
    }

    fn state(&self) -> &LabelState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut LabelState {
        &mut self.state
    }

    fn fields(&self) -> &'static [Field] {
        BSD_FIELDS
    }

    fn require_geometry(&self) -> bool {
        true
    }

    fn inchars_partno(&self) -> bool {
        true
    }

    fn probe(&mut self, disk: &mut Disk) -> Result<bool> {
        let parent = match Self::find_parent(disk) {
            Ok(parent) => parent,
            Err(err) => {
                tracing::debug!(error = %err, "no BSD partition in parent");
                return Ok(false);
            }
        };
        let base = parent.map_or(0, |p| p.start);
        let buf = disk.read_sectors(base, (BSD_BBSIZE as u64).div_ceil(disk.sector_size()))?;
        if buf.len() < BSD_BBSIZE {
            return Ok(false);
        }

        let mut lb = Self::new();
        if let Err(err) = lb.parse(&buf) {
            tracing::debug!(error = %err, base, "no BSD label");
            return Ok(false);
        }
        lb.bootstrap = buf;
        lb.bootstrap.truncate(BSD_BBSIZE);
        lb.parent = parent;
        lb.state.disabled = self.state.disabled;
        lb.refresh_counts();
        *self = lb;
        tracing::debug!(base, slices = self.npartitions, "found BSD label");
        Ok(true)
    }

    fn create(&mut self, disk: &mut Disk) -> Result<()> {
        let parent = match Self::find_parent(disk) {
            Ok(parent) => parent,
            Err(err) => {
                disk.warnx(format!("There is no *BSD partition on {}.", disk.dev_path()));
                return Err(err);
            }
        };
        self.deinit();
        self.parent = parent;
        self.bootstrap = vec![0u8; BSD_BBSIZE];

        let geom = disk.geometry();
        let secpercyl = (geom.sectors * geom.heads as u64).max(1);
        let secperunit = secpercyl * geom.cylinders;
        self.drive = BsdDrive {
            dtype: if disk.dev_path().starts_with("/dev/sd") { 4 } else { 1 },
            secsize: disk.sector_size() as u32,
            nsectors: geom.sectors as u32,
            ntracks: geom.heads,
            ncylinders: geom.cylinders as u32,
            secpercyl: secpercyl as u32,
            secperunit: secperunit.min(u32::MAX as u64) as u32,
            rpm: 3600,
            interleave: 1,
            ..BsdDrive::default()
        };

        match parent {
            Some(p) => {
                self.npartitions = 4;
                self.slices[2] = Slice {
                    offset: p.start as u32,
                    size: p.size as u32,
                    ..Slice::default()
                };
                self.slices[3] = Slice {
                    size: self.drive.secperunit,
                    ..Slice::default()
                };
            }
            None => {
                self.npartitions = 3;
                self.slices[2] = Slice {
                    size: self.drive.secperunit,
                    ..Slice::default()
                };
            }
        }
        self.refresh_counts();
        disk.info("Created a new BSD disklabel.");
        Ok(())
    }

    fn verify(&self, disk: &Disk) -> Result<usize> {
        let last = disk.total_sectors().saturating_sub(1);
        let mut nerrors = 0;
        for (i, s) in self.slices.iter().enumerate().filter(|(_, s)| s.is_used()) {
            if s.offset as u64 + s.size as u64 - 1 > last {
                disk.warnx(format!("Slice {}: is ending beyond the disk.", letter(i)));
                nerrors += 1;
            }
        }
        Ok(nerrors)
    }

    fn write(&mut self, disk: &mut Disk) -> Result<()> {
        self.render();
        let base = self.base_sector();
        disk.write_sectors(base, &self.bootstrap)?;
        match self.parent {
            Some(p) => disk.info(format!(
                "Disklabel written to {}. (Partition {})",
                disk.dev_path(),
                p.partno + 1
            )),
            None => disk.info(format!("Disklabel written to {}.", disk.dev_path())),
        }
        Ok(())
    }

    fn list(&self, disk: &Disk) -> Result<()> {
        let d = &self.drive;
        disk.info(format!(
            "type: {}",
            match d.dtype {
                4 => "SCSI",
                1 => "ST506",
                _ => "unknown",
            }
        ));
        if disk.is_details() {
            disk.info(format!("bytes/sector: {}", d.secsize));
            disk.info(format!("sectors/track: {}", d.nsectors));
            disk.info(format!("tracks/cylinder: {}", d.ntracks));
            disk.info(format!("sectors/cylinder: {}", d.secpercyl));
            disk.info(format!("cylinders: {}", d.ncylinders));
            disk.info(format!("rpm: {}", d.rpm));
            disk.info(format!("interleave: {}", d.interleave));
            disk.info(format!("trackskew: {}", d.trackskew));
            disk.info(format!("cylinderskew: {}", d.cylskew));
            disk.info(format!("headswitch: {}\t\t# milliseconds", d.headswitch));
            disk.info(format!("track-to-track seek: {}\t# milliseconds", d.trkseek));
        }
        disk.info(format!("partitions: {}", self.npartitions));
        Ok(())
    }

    fn locate(&self, disk: &Disk, n: usize) -> Result<(&'static str, u64, usize)> {
        match n {
            0 => Ok((
                "BSD disklabel",
                self.base_sector() * disk.sector_size() + BSD_LABEL_OFFSET as u64,
                self.label_size(),
            )),
            _ => Err(Error::not_found(format!("BSD label area {}", n))),
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
        Err(Error::unsupported("bsd: disk identifier"))
    }

    fn get_part(&self, _disk: &Disk, n: usize) -> Result<Partition> {
        let s = self
            .slices
            .get(n)
            .ok_or_else(|| Error::out_of_range(format!("slice {} does not exist", n + 1)))?;
        let mut pa = Partition::new();
        pa.partno = Some(n);
        if !s.is_used() {
            return Ok(pa);
        }
        pa.used = true;
        pa.set_start(s.offset as u64);
        pa.set_size(s.size as u64);
        pa.parttype = Some(parttype::from_code(BSD_FSTYPES, s.fstype as u32));
        pa.parent_partno = self.parent.map(|p| p.partno);
        pa.fsize = s.fsize as u64;
        pa.bsize = s.fsize as u64 * s.frag as u64;
        pa.cpg = s.cpg as u64;
        Ok(pa)
    }

    fn part_is_used(&self, n: usize) -> bool {
        self.slices.get(n).is_some_and(Slice::is_used)
    }

    fn add_part(&mut self, disk: &mut Disk, pa: Option<&Partition>) -> Result<usize> {
        if self.state.nparts_max == 0 {
            return Err(Error::invalid_operation("BSD label is not initialized"));
        }
        let n = self.next_partno(disk, pa)?;
        if self.part_is_used(n) {
            return Err(Error::duplicate(format!("slice {} is already defined", letter(n))));
        }
        let fstype = match pa.and_then(|p| p.parttype.as_ref()) {
            Some(t) if t.typestr().is_none() && t.code <= 0xff => t.code as u8,
            Some(t) => {
                return Err(Error::unknown_type(format!(
                    "type '{}' is not valid for a BSD label",
                    t.id_string()
                )))
            }
            None => BSD_FS_UNUSED,
        };

        // slices may overlap, the whole area is always a candidate
        let area = [self.area(disk)];
        let (start, end) = planner::place(disk, &area, pa, Grid::Exact)?;
        let offset = u32::try_from(start)
            .map_err(|_| Error::out_of_range("slice start does not fit a BSD label"))?;
        let size = u32::try_from(end - start + 1)
            .map_err(|_| Error::out_of_range("slice size does not fit a BSD label"))?;

        self.slices[n] = Slice {
            size,
            offset,
            fstype,
            fsize: pa.map_or(0, |p| p.fsize) as u32,
            cpg: pa.map_or(0, |p| p.cpg) as u16,
            frag: 0,
        };
        self.grow_to(n);
        self.refresh_counts();
        self.state.changed = true;
        Ok(n)
    }

    fn del_part(&mut self, _disk: &mut Disk, n: usize) -> Result<()> {
        *self.slice_mut(n)? = Slice::default();
        if self.npartitions == n + 1 {
            while self.npartitions > 0 && !self.slices[self.npartitions - 1].is_used() {
                self.npartitions -= 1;
            }
        }
        self.refresh_counts();
        self.state.changed = true;
        Ok(())
    }

    fn set_part_type(&mut self, disk: &Disk, n: usize, t: &PartType) -> Result<()> {
        if t.typestr().is_some() || t.code > 0xff {
            return Err(Error::unknown_type(format!(
                "type '{}' is not valid for a BSD label",
                t.id_string()
            )));
        }
        let slice = self.slice_mut(n)?;
        let old = parttype::from_code(BSD_FSTYPES, slice.fstype as u32);
        slice.fstype = t.code as u8;
        self.state.changed = true;
        disk.info(format!(
            "Changed type of partition '{}' to '{}'.",
            old.name, t.name
        ));
        Ok(())
    }

    fn usable_range(&self, disk: &Disk) -> (u64, u64) {
        self.area(disk)
    }
}

impl Context {
    fn bsd_mut(&mut self) -> Result<(&mut Disk, &mut BsdLabel)> {
        self.check_writable()?;
        match self.active_parts()? {
            (disk, Label::Bsd(bsd)) => Ok((disk, bsd)),
            _ => Err(Error::invalid_operation("not a BSD label")),
        }
    }

    /// Copy a partition of the parent DOS label into the nested BSD label
    ///
    /// Numbers left out are asked for. Returns the slice used.
    pub fn bsd_link_partition(
        &mut self,
        parent_partno: Option<usize>,
        slice: Option<usize>,
    ) -> Result<usize> {
        let parent = self
            .get_parent()
            .ok_or_else(|| Error::invalid_operation("BSD label is not nested"))?;
        let src = {
            let p = parent
                .try_borrow()
                .map_err(|_| Error::invalid_operation("parent context is busy"))?;
            let n = match parent_partno {
                Some(n) => n,
                None => p.ask_partnum(false)?,
            };
            let pa = p.get_partition(n)?;
            if !pa.used {
                return Err(Error::not_found(format!("partition {} is not used", n + 1)));
            }
            pa
        };
        let (disk, bsd) = self.bsd_mut()?;
        bsd.link(disk, &src, slice)
    }

    /// Ask for new drive parameters of the BSD label
    pub fn bsd_edit_disklabel(&mut self) -> Result<()> {
        let (disk, bsd) = self.bsd_mut()?;
        bsd.edit_drive(disk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disklabel_core::{DefaultAnswers, DeviceIo};
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    const MIB: u64 = 1024 * 1024;

    fn bsd_template(start: u64, size: u64, partno: usize) -> Partition {
        let mut pa = Partition::new();
        pa.set_start(start);
        pa.set_size(size);
        pa.set_partno(partno);
        pa.set_type(parttype::from_code(BSD_FSTYPES, 7));
        pa
    }

    #[test]
    fn test_checksum() {
        let mut lb = BsdLabel::new();
        lb.npartitions = 3;
        lb.slices[2].size = 1000;
        lb.render();
        let l = &lb.bootstrap[BSD_LABEL_OFFSET..BSD_LABEL_OFFSET + lb.label_size()];
        assert_eq!(xor16(l), 0);

        let mut back = BsdLabel::new();
        back.parse(&lb.bootstrap).unwrap();
        assert_eq!(back.npartitions, 3);
        assert_eq!(back.slices[2].size, 1000);

        let mut broken = lb.bootstrap.clone();
        broken[BSD_LABEL_OFFSET + HEADER_SIZE] ^= 0x10;
        assert!(matches!(
            BsdLabel::new().parse(&broken),
            Err(Error::ChecksumVerification(_))
        ));
    }

    #[test]
    fn test_whole_disk_label() {
        let mut cxt = Context::new();
        cxt.set_ask_handler(DefaultAnswers);
        let dev: Box<dyn DeviceIo> = Box::new(Cursor::new(vec![0u8; 8 * MIB as usize]));
        cxt.assign_device_handle(dev, "disk.img", false).unwrap();
        cxt.create_disklabel(Some("bsd")).unwrap();

        // slice c spans the disk
        let c = cxt.get_partition(2).unwrap();
        assert_eq!(c.start, Some(0));
        assert_eq!(cxt.partition_to_string(&c, FieldId::Device).as_deref(), Some("c"));

        let n = cxt.add_partition(Some(&bsd_template(16, 4096, 0))).unwrap();
        assert_eq!(n, 0);
        let a = cxt.get_partition(0).unwrap();
        assert_eq!(a.parttype.unwrap().name, "4.2BSD");

        cxt.write_disklabel().unwrap();
        assert_eq!(cxt.locate_disklabel(0).unwrap().1, 512);

        cxt.delete_partition(2).unwrap();
        assert!(cxt.is_partition_used(0));
        assert!(cxt.set_partition_type(0, &parttype::from_code(BSD_FSTYPES, 1)).is_ok());
    }

    #[test]
    fn test_nested_in_dos() {
        let parent = Rc::new(RefCell::new(Context::new()));
        {
            let mut p = parent.borrow_mut();
            p.set_ask_handler(DefaultAnswers);
            let dev: Box<dyn DeviceIo> = Box::new(Cursor::new(vec![0u8; 16 * MIB as usize]));
            p.assign_device_handle(dev, "/dev/sdz", false).unwrap();
            p.create_disklabel(Some("dos")).unwrap();
            let mut pa = Partition::new();
            pa.start_follow_default(true);
            pa.partno_follow_default(true);
            pa.set_size(8192);
            pa.set_type(parttype::from_code(crate::dos::types::DOS_PARTTYPES, 0xa5));
            p.add_partition(Some(&pa)).unwrap();
            p.add_partition(Some(&{
                let mut fat = pa.clone();
                fat.set_type(parttype::from_code(crate::dos::types::DOS_PARTTYPES, 0x06));
                fat
            }))
            .unwrap();
        }

        let mut nested = Context::new_nested(&parent, "bsd").unwrap();
        assert!(!nested.has_label());
        nested.create_disklabel(Some("bsd")).unwrap();
        let c = nested.get_partition(2).unwrap();
        assert_eq!(c.start, Some(2048));
        assert_eq!(c.size(), Some(8192));
        assert_eq!(c.parent_partno, Some(0));

        let n = nested.bsd_link_partition(Some(1), Some(4)).unwrap();
        assert_eq!(n, 4);
        let e = nested.get_partition(4).unwrap();
        assert_eq!(e.parttype.unwrap().name, "MS-DOS");
        assert_eq!(e.start, Some(10240));

        nested.write_disklabel().unwrap();
        assert_eq!(
            nested.locate_disklabel(0).unwrap().1,
            2048 * 512 + BSD_LABEL_OFFSET as u64
        );

        let again = Context::new_nested(&parent, "bsd").unwrap();
        assert!(again.is_label(LabelKind::Bsd));
        assert_eq!(again.get_partition(4).unwrap().size(), Some(8192));
    }
}
