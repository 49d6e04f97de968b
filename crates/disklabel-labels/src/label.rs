//! Label driver contract
//!
//! Every on-disk format implements [`LabelOps`]. The set of formats is
//! closed, so drivers are held in the [`Label`] enum and dispatched with a
//! `match` instead of trait objects.

use crate::bsd::BsdLabel;
use crate::context::Disk;
use crate::dos::DosLabel;
use crate::gpt::GptLabel;
use crate::sgi::SgiLabel;
use crate::sun::SunLabel;
use disklabel_core::{parttype, Error, Field, FieldId, PartType, PartTypeDef, Partition, Result};
use std::fmt;

/// On-disk label format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelKind {
    Dos,
    Gpt,
    Bsd,
    Sgi,
    Sun,
}

impl LabelKind {
    /// Probe order
    pub const ALL: [LabelKind; 5] = [
        LabelKind::Gpt,
        LabelKind::Dos,
        LabelKind::Bsd,
        LabelKind::Sgi,
        LabelKind::Sun,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LabelKind::Dos => "dos",
            LabelKind::Gpt => "gpt",
            LabelKind::Bsd => "bsd",
            LabelKind::Sgi => "sgi",
            LabelKind::Sun => "sun",
        }
    }

    /// Look a format up by name; `mbr` is accepted for `dos`
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        if name.eq_ignore_ascii_case("mbr") {
            return Some(LabelKind::Dos);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.name().eq_ignore_ascii_case(name))
    }

    /// Partition type catalog of the format
    pub fn parttypes(&self) -> &'static [PartTypeDef] {
        match self {
            LabelKind::Dos => crate::dos::types::DOS_PARTTYPES,
            LabelKind::Gpt => crate::gpt::types::GPT_PARTTYPES,
            LabelKind::Bsd => crate::bsd::BSD_FSTYPES,
            LabelKind::Sgi => crate::sgi::SGI_PARTTYPES,
            LabelKind::Sun => crate::sun::SUN_PARTTYPES,
        }
    }
}

impl fmt::Display for LabelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bookkeeping shared by all drivers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelState {
    /// In-memory table differs from the device
    pub changed: bool,
    /// Driver is registered but must not be used
    pub disabled: bool,
    /// Number of partition slots
    pub nparts_max: usize,
    /// Number of used slots
    pub nparts_cur: usize,
}

/// Capabilities of a label driver
///
/// Drivers never own the device; every operation that needs I/O or a dialog
/// receives the [`Disk`] half of the context.
pub trait LabelOps {
    fn kind(&self) -> LabelKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    fn state(&self) -> &LabelState;
    fn state_mut(&mut self) -> &mut LabelState;

    fn parttypes(&self) -> &'static [PartTypeDef] {
        self.kind().parttypes()
    }

    /// Columns the driver can fill, in display order
    fn fields(&self) -> &'static [Field];

    /// Format is unusable without CHS geometry
    fn require_geometry(&self) -> bool {
        false
    }

    /// Partitions are addressed by letter
    fn inchars_partno(&self) -> bool {
        false
    }

    /// Recognize an existing label and load it; `Ok(false)` if not ours
    fn probe(&mut self, disk: &mut Disk) -> Result<bool>;

    /// Start an empty in-memory table
    fn create(&mut self, disk: &mut Disk) -> Result<()>;

    /// Check the in-memory table; returns the number of problems reported
    fn verify(&self, disk: &Disk) -> Result<usize>;

    /// Persist the in-memory table
    fn write(&mut self, disk: &mut Disk) -> Result<()>;

    /// Emit label specific information lines
    fn list(&self, disk: &Disk) -> Result<()>;

    /// Name, byte offset and size of the `n`-th on-disk structure
    fn locate(&self, disk: &Disk, n: usize) -> Result<(&'static str, u64, usize)>;

    /// Drop the in-memory table
    fn deinit(&mut self);

    /// Adjust alignment settings for the format
    fn reset_alignment(&self, _disk: &mut Disk) {}

    fn get_id(&self) -> Option<String>;
    fn set_id(&mut self, disk: &Disk) -> Result<()>;

    fn get_part(&self, disk: &Disk, n: usize) -> Result<Partition>;
    fn part_is_used(&self, n: usize) -> bool;

    /// Add a partition; `None` asks for everything
    fn add_part(&mut self, disk: &mut Disk, pa: Option<&Partition>) -> Result<usize>;
    fn del_part(&mut self, disk: &mut Disk, n: usize) -> Result<()>;
    fn set_part_type(&mut self, disk: &Disk, n: usize, t: &PartType) -> Result<()>;

    fn toggle_part_flag(&mut self, _disk: &Disk, _n: usize, _flag: u64) -> Result<()> {
        Err(Error::unsupported(format!(
            "{}: partition flags",
            self.name()
        )))
    }

    /// Sort entries by start; returns whether anything moved
    fn reorder(&mut self, _disk: &Disk) -> Result<bool> {
        Err(Error::unsupported(format!("{}: reorder", self.name())))
    }

    /// First and last sector partitions may occupy
    fn usable_range(&self, disk: &Disk) -> (u64, u64);

    /// Number the next added partition would get
    fn next_partno(&self, disk: &Disk, pa: Option<&Partition>) -> Result<usize> {
        crate::planner::next_partno(self, disk, pa)
    }

    /// Sectors partition `n` keeps others out of, including metadata in
    /// front of it
    fn occupied_range(&self, disk: &Disk, n: usize) -> Result<(u64, u64)> {
        let pa = self.get_part(disk, n)?;
        match (pa.start, pa.end()) {
            (Some(start), Some(end)) => Ok((start, end)),
            _ => Err(Error::invalid_label(format!("partition {} has no extent", n + 1))),
        }
    }

    /// Catalog type for `code`, synthesized if missing
    fn parttype_from_code(&self, code: u32) -> PartType {
        parttype::from_code(self.parttypes(), code)
    }

    /// Catalog type for the string identifier, synthesized if missing
    fn parttype_from_string(&self, s: &str) -> PartType {
        parttype::from_string(self.parttypes(), s)
    }

    fn parse_parttype(&self, text: &str) -> Result<PartType> {
        parttype::parse(self.parttypes(), text)
    }

    /// Ids of the columns shown for the given modes
    fn get_field_ids(&self, details: bool, use_cylinders: bool) -> Vec<FieldId> {
        self.fields()
            .iter()
            .filter(|f| f.is_visible(details, use_cylinders))
            .map(|f| f.id)
            .collect()
    }

    fn get_field(&self, id: FieldId) -> Option<&'static Field> {
        self.fields().iter().find(|f| f.id == id)
    }
}

/// One registered label driver
#[derive(Debug, Clone)]
pub enum Label {
    Dos(DosLabel),
    Gpt(GptLabel),
    Bsd(BsdLabel),
    Sgi(SgiLabel),
    Sun(SunLabel),
}

macro_rules! dispatch {
    ($self:expr, $lb:ident => $body:expr) => {
        match $self {
            Label::Dos($lb) => $body,
            Label::Gpt($lb) => $body,
            Label::Bsd($lb) => $body,
            Label::Sgi($lb) => $body,
            Label::Sun($lb) => $body,
        }
    };
}

impl Label {
    pub fn new(kind: LabelKind) -> Self {
        match kind {
            LabelKind::Dos => Label::Dos(DosLabel::new()),
            LabelKind::Gpt => Label::Gpt(GptLabel::new()),
            LabelKind::Bsd => Label::Bsd(BsdLabel::new()),
            LabelKind::Sgi => Label::Sgi(SgiLabel::new()),
            LabelKind::Sun => Label::Sun(SunLabel::new()),
        }
    }

    pub fn is_changed(&self) -> bool {
        self.state().changed
    }

    pub fn set_changed(&mut self, changed: bool) {
        self.state_mut().changed = changed;
    }

    pub fn is_disabled(&self) -> bool {
        self.state().disabled
    }

    pub fn nparts_max(&self) -> usize {
        self.state().nparts_max
    }

    pub fn as_dos(&self) -> Option<&DosLabel> {
        match self {
            Label::Dos(lb) => Some(lb),
            _ => None,
        }
    }

    pub fn as_gpt(&self) -> Option<&GptLabel> {
        match self {
            Label::Gpt(lb) => Some(lb),
            _ => None,
        }
    }
}

impl LabelOps for Label {
    fn kind(&self) -> LabelKind {
        dispatch!(self, lb => lb.kind())
    }

    fn state(&self) -> &LabelState {
        dispatch!(self, lb => lb.state())
    }

    fn state_mut(&mut self) -> &mut LabelState {
        dispatch!(self, lb => lb.state_mut())
    }

    fn fields(&self) -> &'static [Field] {
        dispatch!(self, lb => lb.fields())
    }

    fn require_geometry(&self) -> bool {
        dispatch!(self, lb => lb.require_geometry())
    }

    fn inchars_partno(&self) -> bool {
        dispatch!(self, lb => lb.inchars_partno())
    }

    fn probe(&mut self, disk: &mut Disk) -> Result<bool> {
        dispatch!(self, lb => lb.probe(disk))
    }

    fn create(&mut self, disk: &mut Disk) -> Result<()> {
        dispatch!(self, lb => lb.create(disk))
    }

    fn verify(&self, disk: &Disk) -> Result<usize> {
        dispatch!(self, lb => lb.verify(disk))
    }

    fn write(&mut self, disk: &mut Disk) -> Result<()> {
        dispatch!(self, lb => lb.write(disk))
    }

    fn list(&self, disk: &Disk) -> Result<()> {
        dispatch!(self, lb => lb.list(disk))
    }

    fn locate(&self, disk: &Disk, n: usize) -> Result<(&'static str, u64, usize)> {
        dispatch!(self, lb => lb.locate(disk, n))
    }

    fn deinit(&mut self) {
        dispatch!(self, lb => lb.deinit())
    }

    fn reset_alignment(&self, disk: &mut Disk) {
        dispatch!(self, lb => lb.reset_alignment(disk))
    }

    fn get_id(&self) -> Option<String> {
        dispatch!(self, lb => lb.get_id())
    }

    fn set_id(&mut self, disk: &Disk) -> Result<()> {
        dispatch!(self, lb => lb.set_id(disk))
    }

    fn get_part(&self, disk: &Disk, n: usize) -> Result<Partition> {
        dispatch!(self, lb => lb.get_part(disk, n))
    }

    fn part_is_used(&self, n: usize) -> bool {
        dispatch!(self, lb => lb.part_is_used(n))
    }

    fn add_part(&mut self, disk: &mut Disk, pa: Option<&Partition>) -> Result<usize> {
        dispatch!(self, lb => lb.add_part(disk, pa))
    }

    fn del_part(&mut self, disk: &mut Disk, n: usize) -> Result<()> {
        dispatch!(self, lb => lb.del_part(disk, n))
    }

    fn set_part_type(&mut self, disk: &Disk, n: usize, t: &PartType) -> Result<()> {
        dispatch!(self, lb => lb.set_part_type(disk, n, t))
    }

    fn toggle_part_flag(&mut self, disk: &Disk, n: usize, flag: u64) -> Result<()> {
        dispatch!(self, lb => lb.toggle_part_flag(disk, n, flag))
    }

    fn reorder(&mut self, disk: &Disk) -> Result<bool> {
        dispatch!(self, lb => lb.reorder(disk))
    }

    fn usable_range(&self, disk: &Disk) -> (u64, u64) {
        dispatch!(self, lb => lb.usable_range(disk))
    }

    fn next_partno(&self, disk: &Disk, pa: Option<&Partition>) -> Result<usize> {
        dispatch!(self, lb => lb.next_partno(disk, pa))
    }

    fn occupied_range(&self, disk: &Disk, n: usize) -> Result<(u64, u64)> {
        dispatch!(self, lb => lb.occupied_range(disk, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_kind_names() {
        assert_eq!(LabelKind::from_name("GPT"), Some(LabelKind::Gpt));
        assert_eq!(LabelKind::from_name("mbr"), Some(LabelKind::Dos));
        assert_eq!(LabelKind::from_name("aix"), None);
        assert_eq!(LabelKind::ALL[0], LabelKind::Gpt);
        assert_eq!(LabelKind::Sun.to_string(), "sun");
    }

    #[test]
    fn test_label_dispatch() {
        for kind in LabelKind::ALL {
            let lb = Label::new(kind);
            assert_eq!(lb.kind(), kind);
            assert!(!lb.is_changed());
            assert!(!lb.fields().is_empty());
        }
        assert!(Label::new(LabelKind::Sun).require_geometry());
        assert!(Label::new(LabelKind::Bsd).inchars_partno());
        assert!(!Label::new(LabelKind::Gpt).require_geometry());
    }

    #[test]
    fn test_parttype_lookup_through_label() {
        let dos = Label::new(LabelKind::Dos);
        let t = dos.parttype_from_code(0x83);
        assert_eq!(t.name, "Linux");
        assert!(!t.is_unknown());

        let unknown = dos.parttype_from_code(0x3d);
        assert!(unknown.is_unknown());
        assert_eq!(unknown.code, 0x3d);
        assert!(!parttype::is_cataloged(dos.parttypes(), &unknown));

        let gpt = Label::new(LabelKind::Gpt);
        let t = gpt.parttype_from_string("0fc63daf-8483-4772-8e79-3d69d8477de4");
        assert_eq!(t.name, "Linux filesystem");
        assert!(!t.is_unknown());
    }

    #[test]
    fn test_field_ids() {
        let dos = Label::new(LabelKind::Dos);
        let ids = dos.get_field_ids(false, false);
        assert_eq!(ids.first(), Some(&FieldId::Device));
        assert!(ids.contains(&FieldId::Sectors));
        assert!(!ids.contains(&FieldId::Cylinders));
        assert!(!ids.contains(&FieldId::Saddr));

        let ids = dos.get_field_ids(true, true);
        assert!(ids.contains(&FieldId::Cylinders));
        assert!(ids.contains(&FieldId::Saddr));
        assert!(!ids.contains(&FieldId::Size));
        assert_eq!(dos.get_field(FieldId::TypeId).map(|f| f.name), Some("Id"));
    }
}
