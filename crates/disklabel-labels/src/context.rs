//! Device sessions
//!
//! A [`Context`] binds one device to the registered label drivers. It is
//! split into the [`Disk`] (device handle, topology, dialog handler, display
//! settings) and the drivers themselves, so a driver can be borrowed mutably
//! while it reads, writes and asks questions through the disk.

use crate::label::{Label, LabelKind, LabelOps};
use crate::planner;
use crate::script::Script;
use disklabel_core::{
    device, do_ask, limits, AlignDirection, Ask, AskHandler, DeviceIo, Error, Field, FieldFormat,
    FieldId, Geometry, MenuAsk, NumberAsk, PartType, Partition, Result, StringAsk, Table,
    Topology, UserProperties, YesNoAsk,
};
use std::cell::RefCell;
use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;
use std::rc::{Rc, Weak};

/// Device handle shared between a context and its nested contexts
pub type SharedDevice = Rc<RefCell<Box<dyn DeviceIo>>>;

/// Dialog handler shared between a context and its nested contexts
pub type SharedAskHandler = Rc<RefCell<dyn AskHandler>>;

/// Where a context is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Unassigned,
    AssignedNoLabel,
    AssignedWithLabel,
    Nested,
}

/// Settings applied when a context is created
#[derive(Debug, Clone, Default)]
pub struct ContextConfig {
    /// Show exact values and the detail columns
    pub details: bool,
    /// Never modify the device, not even in memory
    pub listonly: bool,
    /// Display offsets in cylinders
    pub cylinder_units: bool,
    /// DOS-compatible (cylinder aligned) MBR layout
    pub dos_compatible: bool,
    /// User geometry; zero fields are not overridden
    pub geometry: Geometry,
    /// User logical sector size (0 = probe)
    pub sector_size: u64,
    /// User physical sector size (0 = probe)
    pub phy_sector_size: u64,
}

impl ContextConfig {
    pub fn details(mut self, enable: bool) -> Self {
        self.details = enable;
        self
    }

    pub fn listonly(mut self, enable: bool) -> Self {
        self.listonly = enable;
        self
    }

    pub fn cylinder_units(mut self, enable: bool) -> Self {
        self.cylinder_units = enable;
        self
    }

    pub fn dos_compatible(mut self, enable: bool) -> Self {
        self.dos_compatible = enable;
        self
    }

    pub fn geometry(mut self, cylinders: u64, heads: u32, sectors: u64) -> Self {
        self.geometry = Geometry::new(cylinders, heads, sectors);
        self
    }

    pub fn sector_size(mut self, phy: u64, log: u64) -> Self {
        self.phy_sector_size = phy;
        self.sector_size = log;
        self
    }
}

/// The device half of a context
pub struct Disk {
    dev: Option<SharedDevice>,
    dev_path: String,
    readonly: bool,
    listonly: bool,
    details: bool,
    display_in_cyl_units: bool,
    dos_compat: bool,
    topo: Topology,
    probed: Topology,
    user: UserProperties,
    firstsector: Vec<u8>,
    handler: Option<SharedAskHandler>,
    script: Option<Script>,
    parent: Option<Weak<RefCell<Context>>>,
}

impl fmt::Debug for Disk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disk")
            .field("dev_path", &self.dev_path)
            .field("assigned", &self.dev.is_some())
            .field("readonly", &self.readonly)
            .field("listonly", &self.listonly)
            .field("topology", &self.topo)
            .field("nested", &self.parent.is_some())
            .finish()
    }
}

impl Disk {
    fn new() -> Self {
        Self {
            dev: None,
            dev_path: String::new(),
            readonly: false,
            listonly: false,
            details: false,
            display_in_cyl_units: false,
            dos_compat: false,
            topo: Topology::default(),
            probed: Topology::default(),
            user: UserProperties::default(),
            firstsector: Vec::new(),
            handler: None,
            script: None,
            parent: None,
        }
    }

    pub fn has_device(&self) -> bool {
        self.dev.is_some()
    }

    pub fn dev_path(&self) -> &str {
        &self.dev_path
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn is_listonly(&self) -> bool {
        self.listonly
    }

    pub fn is_details(&self) -> bool {
        self.details
    }

    pub fn is_nested(&self) -> bool {
        self.parent.is_some()
    }

    pub fn dos_compatible(&self) -> bool {
        self.dos_compat
    }

    pub(crate) fn set_dos_compatible(&mut self, enable: bool) {
        self.dos_compat = enable;
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    pub(crate) fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topo
    }

    pub fn sector_size(&self) -> u64 {
        self.topo.sector_size
    }

    pub fn total_sectors(&self) -> u64 {
        self.topo.total_sectors
    }

    pub fn geometry(&self) -> Geometry {
        self.topo.geom
    }

    /// User overrides, which win over anything a label says
    pub fn user_properties(&self) -> &UserProperties {
        &self.user
    }

    /// Cached copy of the first sector
    pub fn firstsector(&self) -> &[u8] {
        &self.firstsector
    }

    pub(crate) fn set_firstsector(&mut self, buf: Vec<u8>) {
        self.firstsector = buf;
    }

    pub fn script(&self) -> Option<&Script> {
        self.script.as_ref()
    }

    /// Value of a header of the attached script
    pub fn script_header(&self, name: &str) -> Option<&str> {
        self.script.as_ref().and_then(|s| s.get_header(name))
    }

    pub fn use_cylinders(&self) -> bool {
        self.display_in_cyl_units
    }

    /// Sectors per display unit
    pub fn units_per_sector(&self) -> u64 {
        if self.display_in_cyl_units {
            self.topo.geom.sectors_per_cylinder().max(1)
        } else {
            1
        }
    }

    /// Heads, sectors or cylinders unknown for a label that needs them
    pub fn missing_geometry(&self, required: bool) -> bool {
        let g = &self.topo.geom;
        let missing = required && (g.heads == 0 || g.sectors == 0 || g.cylinders == 0);
        if missing && !self.listonly {
            self.warnx("Incomplete geometry setting.");
        }
        missing
    }

    fn device(&self) -> Result<std::cell::RefMut<'_, Box<dyn DeviceIo>>> {
        let dev = self.dev.as_ref().ok_or(Error::NoDevice)?;
        dev.try_borrow_mut()
            .map_err(|_| Error::invalid_operation("device handle already in use"))
    }

    /// Read `buf.len()` bytes at byte offset `offset`
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        tracing::trace!(offset, len = buf.len(), "read");
        self.device()?.read_at(offset, buf)?;
        Ok(())
    }

    /// Write `buf` at byte offset `offset`
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.readonly {
            return Err(Error::read_only(format!("{} opened read-only", self.dev_path)));
        }
        tracing::trace!(offset, len = buf.len(), "write");
        self.device()?.write_at(offset, buf)?;
        Ok(())
    }

    /// Read `count` logical sectors starting at `lba`
    pub fn read_sectors(&self, lba: u64, count: u64) -> Result<Vec<u8>> {
        let ss = self.topo.sector_size;
        let bytes = limits::checked_multiply_u64(count, ss, "read size")?;
        let len = limits::validate_allocation_size(bytes, limits::MAX_ALLOCATION_SIZE, "read")?;
        let offset = limits::checked_multiply_u64(lba, ss, "read offset")?;
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Write whole sectors starting at `lba`
    pub fn write_sectors(&self, lba: u64, buf: &[u8]) -> Result<()> {
        let offset = limits::checked_multiply_u64(lba, self.topo.sector_size, "write offset")?;
        self.write_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        self.device()?.sync_all()?;
        Ok(())
    }

    /// Send a request to the dialog handler
    pub fn ask(&self, ask: &mut Ask) -> Result<()> {
        match &self.handler {
            Some(handler) => {
                let mut handler = handler
                    .try_borrow_mut()
                    .map_err(|_| Error::invalid_operation("dialog handler re-entered"))?;
                do_ask(Some(&mut *handler), ask)
            }
            None => do_ask(None, ask),
        }
    }

    /// Ask for a number in `low..=high`
    pub fn ask_number(&self, query: &str, low: u64, default: u64, high: u64) -> Result<u64> {
        let mut ask = Ask::Number(
            NumberAsk::new(query)
                .with_range(low, high)
                .with_default(default),
        );
        self.ask(&mut ask)?;
        Ok(ask.number().map_or(default, |n| n.result))
    }

    /// Ask for a number that may be given relative to `base`
    ///
    /// Returns the result and whether the answer was relative.
    pub fn ask_offset(
        &self,
        query: &str,
        low: u64,
        default: u64,
        high: u64,
        base: u64,
        unit: u64,
    ) -> Result<(u64, bool)> {
        let mut ask = Ask::Offset(
            NumberAsk::new(query)
                .with_range(low, high)
                .with_default(default)
                .with_base(base)
                .with_unit(unit),
        );
        self.ask(&mut ask)?;
        Ok(ask.number().map_or((default, false), |n| (n.result, n.relative)))
    }

    pub fn ask_string(&self, query: &str, default: Option<&str>) -> Result<String> {
        let mut ask = Ask::String(StringAsk {
            query: query.to_string(),
            default: default.map(str::to_string),
            result: None,
        });
        self.ask(&mut ask)?;
        match ask {
            Ask::String(StringAsk {
                result: Some(result),
                ..
            }) => Ok(result),
            _ => Err(Error::aborted(format!("no answer to '{}'", query))),
        }
    }

    pub fn ask_yesno(&self, query: &str) -> Result<bool> {
        let mut ask = Ask::YesNo(YesNoAsk {
            query: query.to_string(),
            result: false,
        });
        self.ask(&mut ask)?;
        Ok(matches!(ask, Ask::YesNo(YesNoAsk { result: true, .. })))
    }

    pub fn ask_menu(&self, menu: MenuAsk) -> Result<char> {
        let default = menu.default;
        let mut ask = Ask::Menu(menu);
        self.ask(&mut ask)?;
        match ask {
            Ask::Menu(m) => Ok(m.result.unwrap_or(default)),
            _ => Ok(default),
        }
    }

    fn message(&self, mut ask: Ask) {
        if let Err(err) = self.ask(&mut ask) {
            tracing::debug!(error = %err, "dialog handler rejected message");
        }
    }

    pub fn info(&self, msg: impl Into<String>) {
        self.message(Ask::Info(msg.into()));
    }

    /// Warning caused by an OS error
    pub fn warn(&self, msg: impl Into<String>, errno: Option<i32>) {
        self.message(Ask::Warn {
            message: msg.into(),
            errno,
        });
    }

    pub fn warnx(&self, msg: impl Into<String>) {
        self.message(Ask::WarnX(msg.into()));
    }

    /// Partitions of the parent context of a nested context
    pub fn parent_partitions(&self) -> Result<Table> {
        let parent = self
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::not_found("parent context"))?;
        let parent = parent
            .try_borrow()
            .map_err(|_| Error::invalid_operation("parent context is busy"))?;
        parent.get_partitions()
    }

    /// Rendering settings for partition fields
    pub fn field_format(&self, inchars_partno: bool) -> FieldFormat {
        FieldFormat {
            dev_path: self.dev_path.clone(),
            inchars_partno,
            use_cylinders: self.display_in_cyl_units,
            units_per_sector: self.units_per_sector(),
            sector_size: self.topo.sector_size,
            details: self.details,
        }
    }
}

/// A session bound to one device
#[derive(Debug)]
pub struct Context {
    disk: Disk,
    labels: Vec<Label>,
    active: Option<usize>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Context with every label driver registered
    pub fn new() -> Self {
        Self::with_config(ContextConfig::default())
    }

    pub fn with_config(cfg: ContextConfig) -> Self {
        let mut disk = Disk::new();
        disk.details = cfg.details;
        disk.listonly = cfg.listonly;
        disk.display_in_cyl_units = cfg.cylinder_units;
        disk.dos_compat = cfg.dos_compatible;
        let mut cxt = Self {
            disk,
            labels: LabelKind::ALL.iter().map(|&k| Label::new(k)).collect(),
            active: None,
        };
        let g = cfg.geometry;
        cxt.save_user_geometry(g.cylinders, g.heads, g.sectors);
        cxt.save_user_sector_size(cfg.phy_sector_size, cfg.sector_size);
        cxt
    }

    /// Context for a label nested in a partition of `parent`
    ///
    /// Only `bsd` (inside a DOS partition) and `dos` (the protective or
    /// hybrid MBR of a GPT disk) can be nested. The new context shares the
    /// parent's device and dialog handler and probes only that label.
    pub fn new_nested(parent: &Rc<RefCell<Context>>, name: &str) -> Result<Self> {
        let kind = match LabelKind::from_name(name) {
            Some(k @ (LabelKind::Bsd | LabelKind::Dos)) => k,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "'{}' cannot be nested",
                    name
                )))
            }
        };

        let disk = {
            let p = parent
                .try_borrow()
                .map_err(|_| Error::invalid_operation("parent context is busy"))?;
            let pd = &p.disk;
            Disk {
                dev: pd.dev.clone(),
                dev_path: pd.dev_path.clone(),
                readonly: pd.readonly,
                listonly: pd.listonly,
                details: pd.details,
                display_in_cyl_units: pd.display_in_cyl_units,
                dos_compat: pd.dos_compat,
                topo: pd.topo,
                probed: pd.probed,
                user: pd.user,
                firstsector: pd.firstsector.clone(),
                handler: pd.handler.clone(),
                script: None,
                parent: Some(Rc::downgrade(parent)),
            }
        };

        let mut cxt = Self {
            disk,
            labels: vec![Label::new(kind)],
            active: None,
        };
        tracing::debug!(label = kind.name(), "probing nested label");
        match cxt.labels[0].probe(&mut cxt.disk) {
            Ok(true) => {
                cxt.active = Some(0);
                cxt.reset_alignment();
            }
            Ok(false) => cxt.labels[0].deinit(),
            Err(err) => {
                tracing::debug!(error = %err, label = kind.name(), "nested probe failed");
                cxt.labels[0].deinit();
            }
        }
        Ok(cxt)
    }

    pub fn state(&self) -> ContextState {
        if self.disk.parent.is_some() {
            ContextState::Nested
        } else if self.disk.dev.is_none() {
            ContextState::Unassigned
        } else if self.active.is_some() {
            ContextState::AssignedWithLabel
        } else {
            ContextState::AssignedNoLabel
        }
    }

    pub fn disk(&self) -> &Disk {
        &self.disk
    }

    pub(crate) fn disk_mut(&mut self) -> &mut Disk {
        &mut self.disk
    }

    /// Parent of a nested context
    pub fn get_parent(&self) -> Option<Rc<RefCell<Context>>> {
        self.disk.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Register the dialog handler
    pub fn set_ask_handler<H: AskHandler + 'static>(&mut self, handler: H) {
        self.disk.handler = Some(Rc::new(RefCell::new(handler)));
    }

    pub fn set_shared_ask_handler(&mut self, handler: Option<SharedAskHandler>) {
        self.disk.handler = handler;
    }

    pub fn ask_handler(&self) -> Option<SharedAskHandler> {
        self.disk.handler.clone()
    }

    // device

    /// Open `path` and read its partition table
    pub fn assign_device(&mut self, path: impl AsRef<Path>, readonly: bool) -> Result<()> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .open(path)?;
        self.assign_device_handle(Box::new(file), &path.to_string_lossy(), readonly)
    }

    /// Adopt an already open device
    pub fn assign_device_handle(
        &mut self,
        dev: Box<dyn DeviceIo>,
        name: &str,
        readonly: bool,
    ) -> Result<()> {
        tracing::debug!(device = name, readonly, "assigning device");
        self.reset_context();

        if let Err(err) = self.init_device(dev, name, readonly) {
            tracing::debug!(device = name, error = %err, "assign failed");
            self.reset_context();
            return Err(err);
        }
        Ok(())
    }

    fn init_device(&mut self, mut dev: Box<dyn DeviceIo>, name: &str, readonly: bool) -> Result<()> {
        let topo = device::probe_topology(dev.as_mut())?;
        self.disk.dev = Some(Rc::new(RefCell::new(dev)));
        self.disk.dev_path = name.to_string();
        self.disk.readonly = readonly;
        self.disk.probed = topo;
        self.disk.topo = topo;

        let ss = limits::u64_to_usize(topo.sector_size, "sector size")?;
        let mut first = vec![0u8; ss];
        self.disk.read_at(0, &mut first)?;
        self.disk.firstsector = first;

        self.probe_labels();
        self.apply_user_device_properties();
        tracing::debug!(
            device = name,
            label = self.label().map(|l| l.name()),
            sectors = self.disk.topo.total_sectors,
            "device assigned"
        );
        Ok(())
    }

    fn probe_labels(&mut self) {
        self.active = None;
        for (i, lb) in self.labels.iter_mut().enumerate() {
            if lb.is_disabled() {
                continue;
            }
            match lb.probe(&mut self.disk) {
                Ok(true) => {
                    tracing::debug!(label = lb.name(), "label found");
                    self.active = Some(i);
                    return;
                }
                Ok(false) => lb.deinit(),
                Err(err) => {
                    tracing::debug!(label = lb.name(), error = %err, "probe failed");
                    lb.deinit();
                }
            }
        }
        tracing::debug!("no label found");
    }

    fn reset_context(&mut self) {
        tracing::trace!("resetting context");
        for lb in &mut self.labels {
            lb.deinit();
        }
        self.active = None;
        self.disk.dev = None;
        self.disk.dev_path.clear();
        self.disk.readonly = false;
        self.disk.firstsector.clear();
        self.disk.topo = Topology::default();
        self.disk.probed = Topology::default();
    }

    /// Release the device, syncing it first unless read-only or `nosync`
    pub fn deassign_device(&mut self, nosync: bool) -> Result<()> {
        if self.disk.dev.is_none() {
            return Ok(());
        }
        tracing::debug!(device = %self.disk.dev_path, nosync, "deassigning device");
        if !self.disk.readonly && !nosync {
            self.disk.sync()?;
            self.disk.info("Syncing disks.");
        }
        self.reset_context();
        Ok(())
    }

    /// Ask the kernel to re-read the partition table
    pub fn reread_partition_table(&self) -> Result<()> {
        tracing::debug!(device = %self.disk.dev_path, "re-reading partition table");
        self.disk.device()?.reread_partition_table()?;
        Ok(())
    }

    pub fn is_readonly(&self) -> bool {
        self.disk.readonly
    }

    pub fn enable_listonly(&mut self, enable: bool) {
        self.disk.listonly = enable;
    }

    pub fn is_listonly(&self) -> bool {
        self.disk.listonly
    }

    pub fn enable_details(&mut self, enable: bool) {
        self.disk.details = enable;
    }

    pub fn is_details(&self) -> bool {
        self.disk.details
    }

    pub fn devname(&self) -> &str {
        &self.disk.dev_path
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.disk.listonly {
            return Err(Error::read_only("context is in list-only mode"));
        }
        if self.disk.readonly {
            return Err(Error::read_only(format!(
                "{} opened read-only",
                self.disk.dev_path
            )));
        }
        Ok(())
    }

    // topology

    pub fn topology(&self) -> &Topology {
        &self.disk.topo
    }

    pub fn sector_size(&self) -> u64 {
        self.disk.topo.sector_size
    }

    pub fn phy_sector_size(&self) -> u64 {
        self.disk.topo.phy_sector_size
    }

    pub fn min_io_size(&self) -> u64 {
        self.disk.topo.min_io_size
    }

    pub fn optimal_io_size(&self) -> u64 {
        self.disk.topo.optimal_io_size
    }

    pub fn alignment_offset(&self) -> u64 {
        self.disk.topo.alignment_offset
    }

    pub fn grain_size(&self) -> u64 {
        self.disk.topo.grain
    }

    pub fn first_lba(&self) -> u64 {
        self.disk.topo.first_lba
    }

    pub fn total_sectors(&self) -> u64 {
        self.disk.topo.total_sectors
    }

    pub fn geom_cylinders(&self) -> u64 {
        self.disk.topo.geom.cylinders
    }

    pub fn geom_heads(&self) -> u32 {
        self.disk.topo.geom.heads
    }

    pub fn geom_sectors(&self) -> u64 {
        self.disk.topo.geom.sectors
    }

    /// Remember a user geometry; zero leaves a value alone
    ///
    /// More than 256 heads or 63 sectors per track are ignored.
    pub fn save_user_geometry(&mut self, cylinders: u64, heads: u32, sectors: u64) {
        let user = &mut self.disk.user;
        if cylinders != 0 {
            user.geom.cylinders = cylinders;
        }
        if heads != 0 {
            user.geom.heads = if heads > 256 { 0 } else { heads };
        }
        if sectors != 0 {
            user.geom.sectors = if sectors >= 64 { 0 } else { sectors };
        }
        tracing::debug!(geometry = %user.geom, "user geometry saved");
    }

    /// Remember user sector sizes; zero leaves a value alone
    pub fn save_user_sector_size(&mut self, phy: u64, log: u64) {
        let user = &mut self.disk.user;
        if phy != 0 {
            user.phy_sector_size = phy;
        }
        if log != 0 {
            user.sector_size = log;
            if user.phy_sector_size < log {
                user.phy_sector_size = log;
            }
        }
    }

    /// True if any user geometry or sector size override is set
    pub fn has_user_device_properties(&self) -> bool {
        self.disk.user.is_set()
    }

    /// Apply the user overrides to the current topology
    pub fn apply_user_device_properties(&mut self) {
        let user = self.disk.user;
        if user.is_set() {
            tracing::debug!("applying user device properties");
            user.apply(&mut self.disk.topo);
        }
        self.reset_alignment();
    }

    /// Return to probed values plus user overrides
    pub fn reset_device_properties(&mut self) {
        self.disk.topo = self.disk.probed;
        self.apply_user_device_properties();
    }

    /// Set the geometry now, without remembering it as a user override
    pub fn override_geometry(&mut self, cylinders: u64, heads: u32, sectors: u64) -> Result<()> {
        if heads > 256 || sectors >= 64 {
            return Err(Error::out_of_range(format!(
                "geometry {} heads, {} sectors not supported",
                heads, sectors
            )));
        }
        let total = self.disk.topo.total_sectors;
        let geom = &mut self.disk.topo.geom;
        if heads != 0 {
            geom.heads = heads;
        }
        if sectors != 0 {
            geom.sectors = sectors;
        }
        if cylinders != 0 {
            geom.cylinders = cylinders;
        } else {
            geom.recount_cylinders(total);
        }
        self.reset_alignment();
        Ok(())
    }

    /// Recompute grain and first usable sector, then let the label adjust them
    pub fn reset_alignment(&mut self) {
        self.disk.topo.reset_alignment();
        if let Some(i) = self.active {
            self.labels[i].reset_alignment(&mut self.disk);
        }
        tracing::trace!(
            grain = self.disk.topo.grain,
            first_lba = self.disk.topo.first_lba,
            "alignment reset"
        );
    }

    /// Set the grain in bytes
    pub fn set_grain(&mut self, grain: u64) -> Result<()> {
        self.disk.topo.set_grain(grain)
    }

    pub fn align_lba(&self, lba: u64, direction: AlignDirection) -> u64 {
        self.disk.topo.align_lba(lba, direction)
    }

    pub fn align_lba_in_range(&self, lba: u64, start: u64, stop: u64) -> Result<u64> {
        self.disk.topo.align_lba_in_range(lba, start, stop)
    }

    pub fn lba_is_phy_aligned(&self, lba: u64) -> bool {
        self.disk.topo.lba_is_phy_aligned(lba)
    }

    // units

    /// Select display units: `sectors` or `cylinders`
    pub fn set_unit(&mut self, unit: &str) -> Result<()> {
        self.disk.display_in_cyl_units = match unit.trim().to_ascii_lowercase().as_str() {
            "cylinder" | "cylinders" => true,
            "sector" | "sectors" => false,
            other => return Err(Error::invalid_argument(format!("unknown unit '{}'", other))),
        };
        Ok(())
    }

    pub fn get_unit(&self, plural: bool) -> &'static str {
        match (self.disk.display_in_cyl_units, plural) {
            (true, false) => "cylinder",
            (true, true) => "cylinders",
            (false, false) => "sector",
            (false, true) => "sectors",
        }
    }

    pub fn use_cylinders(&self) -> bool {
        self.disk.use_cylinders()
    }

    pub fn units_per_sector(&self) -> u64 {
        self.disk.units_per_sector()
    }

    // labels

    /// Registered drivers in probe order
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn nlabels(&self) -> usize {
        self.labels.len()
    }

    pub fn get_label(&self, name: &str) -> Option<&Label> {
        let kind = LabelKind::from_name(name)?;
        self.labels.iter().find(|l| l.kind() == kind)
    }

    fn label_index(&self, name: &str) -> Result<usize> {
        let kind = LabelKind::from_name(name)
            .ok_or_else(|| Error::not_found(format!("'{}' label driver", name)))?;
        self.labels
            .iter()
            .position(|l| l.kind() == kind)
            .ok_or_else(|| Error::not_found(format!("'{}' label driver", name)))
    }

    /// Active label
    pub fn label(&self) -> Option<&Label> {
        self.active.map(|i| &self.labels[i])
    }

    pub fn has_label(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_label(&self, kind: LabelKind) -> bool {
        self.label().is_some_and(|l| l.kind() == kind)
    }

    pub fn set_label_disabled(&mut self, name: &str, disabled: bool) -> Result<()> {
        let i = self.label_index(name)?;
        self.labels[i].state_mut().disabled = disabled;
        Ok(())
    }

    /// Device half and active driver, borrowed together
    pub(crate) fn active_parts(&mut self) -> Result<(&mut Disk, &mut Label)> {
        let i = self.active.ok_or(Error::NoLabel)?;
        Ok((&mut self.disk, &mut self.labels[i]))
    }

    fn active_label(&self) -> Result<&Label> {
        self.label().ok_or(Error::NoLabel)
    }

    /// Make another registered driver the active one
    ///
    /// The in-memory table of the previous label is discarded. The new label
    /// is not created; use [`Context::create_disklabel`] for that.
    pub fn switch_label(&mut self, name: &str) -> Result<()> {
        let i = self.label_index(name)?;
        if self.labels[i].is_disabled() {
            return Err(Error::invalid_operation(format!(
                "'{}' label is disabled",
                name
            )));
        }
        if let Some(prev) = self.active {
            if prev != i {
                self.labels[prev].deinit();
            }
        }
        tracing::debug!(label = self.labels[i].name(), "switching label");
        self.active = Some(i);
        self.reset_alignment();
        Ok(())
    }

    /// Create an empty in-memory label, `dos` when no name is given
    pub fn create_disklabel(&mut self, name: Option<&str>) -> Result<()> {
        self.check_writable()?;
        if self.disk.dev.is_none() {
            return Err(Error::NoDevice);
        }
        let name = name.unwrap_or("dos");
        let i = self.label_index(name)?;
        if self.labels[i].is_disabled() {
            return Err(Error::invalid_operation(format!(
                "'{}' label is disabled",
                name
            )));
        }
        // A failed create leaves the previous label and alignment in place
        let prev = self.active;
        let saved = prev.map(|p| self.labels[p].clone());
        let saved_topo = self.disk.topo;

        if let Some(p) = prev {
            self.labels[p].deinit();
        }
        tracing::info!(label = self.labels[i].name(), "creating disklabel");
        self.active = Some(i);
        self.reset_alignment();
        let created = {
            let (disk, lb) = self.active_parts()?;
            lb.create(disk).map(|()| lb.set_changed(true))
        };
        if let Err(err) = created {
            tracing::debug!(error = %err, "label creation failed, restoring previous state");
            self.labels[i].deinit();
            if let (Some(p), Some(lb)) = (prev, saved) {
                self.labels[p] = lb;
            }
            self.active = prev;
            self.disk.topo = saved_topo;
            return Err(err);
        }
        self.reset_alignment();
        Ok(())
    }

    /// Write the in-memory label if it changed
    pub fn write_disklabel(&mut self) -> Result<()> {
        self.check_writable()?;
        let (disk, lb) = self.active_parts()?;
        if !lb.is_changed() {
            tracing::debug!("label unchanged, nothing to write");
            return Ok(());
        }
        tracing::info!(label = lb.name(), device = %disk.dev_path, "writing disklabel");
        lb.write(disk)?;
        lb.set_changed(false);
        Ok(())
    }

    /// Check the label; returns the number of problems found
    pub fn verify_disklabel(&self) -> Result<usize> {
        let lb = self.active_label()?;
        lb.verify(&self.disk)
    }

    /// Emit label specific details as info messages
    pub fn list_disklabel(&self) -> Result<()> {
        let lb = self.active_label()?;
        lb.list(&self.disk)
    }

    /// Name, byte offset and size of the `n`-th on-disk label structure
    pub fn locate_disklabel(&self, n: usize) -> Result<(&'static str, u64, usize)> {
        let lb = self.active_label()?;
        lb.locate(&self.disk, n)
    }

    pub fn get_disklabel_id(&self) -> Result<Option<String>> {
        Ok(self.active_label()?.get_id())
    }

    /// Ask for and set a new disk identifier
    pub fn set_disklabel_id(&mut self) -> Result<()> {
        self.check_writable()?;
        let (disk, lb) = self.active_parts()?;
        lb.set_id(disk)?;
        lb.set_changed(true);
        Ok(())
    }

    // partitions

    /// Number of partition slots of the active label
    pub fn get_npartitions(&self) -> usize {
        self.label().map_or(0, |l| l.nparts_max())
    }

    pub fn is_partition_used(&self, n: usize) -> bool {
        self.label()
            .is_some_and(|l| n < l.nparts_max() && l.part_is_used(n))
    }

    pub fn get_partition(&self, n: usize) -> Result<Partition> {
        let lb = self.active_label()?;
        if n >= lb.nparts_max() {
            return Err(Error::out_of_range(format!("partition {} does not exist", n + 1)));
        }
        let mut pa = lb.get_part(&self.disk, n)?;
        if pa.partno.is_none() {
            pa.partno = Some(n);
        }
        Ok(pa)
    }

    /// Table of every used partition
    pub fn get_partitions(&self) -> Result<Table> {
        let lb = self.active_label()?;
        let mut tb = Table::new();
        for n in 0..lb.nparts_max() {
            if !lb.part_is_used(n) {
                continue;
            }
            let mut pa = lb.get_part(&self.disk, n)?;
            pa.partno = Some(n);
            pa.used = true;
            tb.add_partition(pa)?;
        }
        Ok(tb)
    }

    /// Table of the unused regions, including those inside containers
    pub fn get_freespaces(&self) -> Result<Table> {
        let lb = self.active_label()?;
        let parts = self.get_partitions()?;
        let mut occupied = Table::new();
        for pa in &parts {
            let Some(n) = pa.partno else { continue };
            let (start, end) = lb.occupied_range(&self.disk, n)?;
            let mut o = Partition::new();
            o.set_start(start);
            o.set_end(end);
            o.used = true;
            o.parent_partno = pa.parent_partno;
            occupied.add_partition(o)?;
        }

        let topo = &self.disk.topo;
        let mut free = Table::new();
        let mut push = |runs: Vec<(u64, u64)>, parent: Option<usize>| -> Result<()> {
            for (s, e) in runs {
                let Ok(start) = topo.align_lba_in_range(s, s, e) else {
                    continue;
                };
                if start > e {
                    continue;
                }
                let mut pa = Partition::new();
                pa.set_start(start);
                pa.set_end(e);
                pa.freespace = true;
                pa.parent_partno = parent;
                free.add_partition(pa)?;
            }
            Ok(())
        };

        let (lo, hi) = lb.usable_range(&self.disk);
        push(occupied.free_ranges(lo, hi, |p| !p.is_nested()), None)?;

        for c in parts.iter().filter(|p| p.is_container()) {
            let (Some(s), Some(e)) = (c.start, c.end()) else {
                continue;
            };
            let runs = occupied.free_ranges(s, e, |p| p.parent_partno == c.partno);
            push(runs, c.partno)?;
        }
        free.sort_by_start();
        Ok(free)
    }

    /// Add a partition described by `pa`, or ask for everything if `None`
    ///
    /// Returns the partition number used.
    pub fn add_partition(&mut self, pa: Option<&Partition>) -> Result<usize> {
        self.check_writable()?;
        let (disk, lb) = self.active_parts()?;
        if disk.missing_geometry(lb.require_geometry()) {
            return Err(Error::invalid_operation("incomplete geometry setting"));
        }
        match pa {
            Some(pa) => tracing::debug!(
                start = ?pa.start,
                size = ?pa.size(),
                end = ?pa.end(),
                start_default = pa.start_follow_default,
                end_default = pa.end_follow_default,
                partno_default = pa.partno_follow_default,
                "adding partition"
            ),
            None => tracing::debug!("adding partition (interactive)"),
        }
        let n = lb.add_part(disk, pa)?;
        lb.set_changed(true);
        tracing::debug!(partno = n, "partition added");
        Ok(n)
    }

    pub fn delete_partition(&mut self, n: usize) -> Result<()> {
        self.check_writable()?;
        let (disk, lb) = self.active_parts()?;
        if n >= lb.nparts_max() || !lb.part_is_used(n) {
            return Err(Error::not_found(format!("partition {} is not used", n + 1)));
        }
        tracing::debug!(partno = n, "deleting partition");
        lb.del_part(disk, n)?;
        lb.set_changed(true);
        Ok(())
    }

    /// Delete every used partition
    pub fn delete_all_partitions(&mut self) -> Result<()> {
        let max = self.get_npartitions();
        for n in (0..max).rev() {
            if self.is_partition_used(n) {
                self.delete_partition(n)?;
            }
        }
        Ok(())
    }

    pub fn set_partition_type(&mut self, n: usize, t: &PartType) -> Result<()> {
        self.check_writable()?;
        let (disk, lb) = self.active_parts()?;
        if n >= lb.nparts_max() || !lb.part_is_used(n) {
            return Err(Error::not_found(format!("partition {} is not used", n + 1)));
        }
        tracing::debug!(partno = n, parttype = %t, "changing partition type");
        lb.set_part_type(disk, n, t)?;
        lb.set_changed(true);
        Ok(())
    }

    /// Toggle a label specific flag of partition `n`
    pub fn toggle_partition_flag(&mut self, n: usize, flag: u64) -> Result<()> {
        self.check_writable()?;
        let (disk, lb) = self.active_parts()?;
        if n >= lb.nparts_max() {
            return Err(Error::out_of_range(format!("partition {} does not exist", n + 1)));
        }
        lb.toggle_part_flag(disk, n, flag)?;
        lb.set_changed(true);
        Ok(())
    }

    /// Sort the entries by start offset; returns whether anything moved
    pub fn reorder_partitions(&mut self) -> Result<bool> {
        self.check_writable()?;
        let (disk, lb) = self.active_parts()?;
        let moved = lb.reorder(disk)?;
        if moved {
            lb.set_changed(true);
            disk.info("Partitions order fixed.");
        } else {
            disk.info("Nothing to do. Ordering is correct already.");
        }
        Ok(moved)
    }

    /// Partition number `pa` would get; nothing is reserved
    pub fn partition_next_partno(&self, pa: Option<&Partition>) -> Result<usize> {
        let lb = self.active_label()?;
        lb.next_partno(&self.disk, pa)
    }

    /// Ask for a partition number, unused ones if `wantnew`
    pub fn ask_partnum(&self, wantnew: bool) -> Result<usize> {
        let lb = self.active_label()?;
        planner::ask_partnum(lb, &self.disk, wantnew)
    }

    /// Add every partition of `tb`, in order
    ///
    /// Partitions added before a failing one stay added.
    pub fn apply_table(&mut self, tb: &Table) -> Result<()> {
        for pa in tb.iter().filter(|p| !p.is_freespace()) {
            self.add_partition(Some(pa))?;
        }
        Ok(())
    }

    // reporting

    /// Columns to display for the active label
    pub fn get_field_ids(&self) -> Result<Vec<FieldId>> {
        let lb = self.active_label()?;
        Ok(lb.get_field_ids(self.disk.details, self.disk.display_in_cyl_units))
    }

    pub fn get_field(&self, id: FieldId) -> Option<&'static Field> {
        self.label().and_then(|l| l.get_field(id))
    }

    /// Render one column of `pa`
    pub fn partition_to_string(&self, pa: &Partition, id: FieldId) -> Option<String> {
        let inchars = self.label().is_some_and(|l| l.inchars_partno());
        pa.to_field_string(id, &self.disk.field_format(inchars))
    }

    // script

    /// Attach a script whose headers label drivers consult; returns the old one
    pub fn set_script(&mut self, script: Option<Script>) -> Option<Script> {
        std::mem::replace(&mut self.disk.script, script)
    }

    pub fn get_script(&self) -> Option<&Script> {
        self.disk.script.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disklabel_core::DefaultAnswers;
    use std::io::Cursor;

    const MIB: u64 = 1024 * 1024;

    fn image(size: u64) -> Box<dyn DeviceIo> {
        Box::new(Cursor::new(vec![0u8; size as usize]))
    }

    #[test]
    fn test_states() {
        let mut cxt = Context::new();
        assert_eq!(cxt.state(), ContextState::Unassigned);
        assert_eq!(cxt.nlabels(), 5);
        assert_eq!(cxt.labels()[0].kind(), LabelKind::Gpt);

        cxt.assign_device_handle(image(8 * MIB), "mem", false).unwrap();
        assert_eq!(cxt.state(), ContextState::AssignedNoLabel);
        assert!(!cxt.has_label());

        cxt.create_disklabel(None).unwrap();
        assert_eq!(cxt.state(), ContextState::AssignedWithLabel);
        assert!(cxt.is_label(LabelKind::Dos));

        cxt.deassign_device(true).unwrap();
        assert_eq!(cxt.state(), ContextState::Unassigned);
    }

    #[test]
    fn test_assign_too_small_device() {
        let mut cxt = Context::new();
        assert!(cxt.assign_device_handle(image(100), "tiny", true).is_err());
        assert_eq!(cxt.state(), ContextState::Unassigned);
    }

    #[test]
    fn test_readonly_rejects_mutations() {
        let mut cxt = Context::new();
        cxt.assign_device_handle(image(8 * MIB), "mem", true).unwrap();
        assert!(matches!(cxt.create_disklabel(Some("gpt")), Err(Error::ReadOnly(_))));

        let mut cxt = Context::with_config(ContextConfig::default().listonly(true));
        cxt.assign_device_handle(image(8 * MIB), "mem", false).unwrap();
        assert!(matches!(cxt.write_disklabel(), Err(Error::ReadOnly(_))));
        assert!(matches!(cxt.add_partition(None), Err(Error::ReadOnly(_))));
    }

    #[test]
    fn test_write_unchanged_is_noop() {
        let mut cxt = Context::new();
        cxt.assign_device_handle(image(8 * MIB), "mem", false).unwrap();
        assert!(matches!(cxt.write_disklabel(), Err(Error::NoLabel)));
        cxt.create_disklabel(Some("dos")).unwrap();
        cxt.write_disklabel().unwrap();
        cxt.write_disklabel().unwrap();
    }

    #[test]
    fn test_units() {
        let mut cxt = Context::new();
        cxt.assign_device_handle(image(64 * MIB), "mem", false).unwrap();
        assert_eq!(cxt.get_unit(true), "sectors");
        assert_eq!(cxt.units_per_sector(), 1);

        cxt.set_unit("cylinders").unwrap();
        assert!(cxt.use_cylinders());
        assert_eq!(cxt.get_unit(false), "cylinder");
        assert_eq!(cxt.units_per_sector(), 255 * 63);
        assert!(cxt.set_unit("furlongs").is_err());
    }

    #[test]
    fn test_user_geometry_wins() {
        let cfg = ContextConfig::default().geometry(0, 16, 32);
        let mut cxt = Context::with_config(cfg);
        assert!(cxt.has_user_device_properties());
        cxt.assign_device_handle(image(64 * MIB), "mem", false).unwrap();
        assert_eq!(cxt.geom_heads(), 16);
        assert_eq!(cxt.geom_sectors(), 32);
        assert_eq!(cxt.geom_cylinders(), 64 * MIB / 512 / (16 * 32));

        cxt.override_geometry(0, 4, 16).unwrap();
        assert_eq!(cxt.geom_heads(), 4);
        cxt.reset_device_properties();
        assert_eq!(cxt.geom_heads(), 16);
    }

    #[test]
    fn test_override_geometry_limits() {
        let mut cxt = Context::new();
        cxt.set_ask_handler(DefaultAnswers);
        cxt.assign_device_handle(image(64 * MIB), "mem", false).unwrap();
        assert!(!cxt.disk().missing_geometry(true));
        assert!(cxt.override_geometry(0, 300, 63).is_err());
        assert!(cxt.override_geometry(0, 255, 64).is_err());
        cxt.override_geometry(0, 64, 32).unwrap();
        assert_eq!(cxt.geom_cylinders(), 64 * MIB / 512 / (64 * 32));
    }

    #[test]
    fn test_messages_reach_handler() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut cxt = Context::new();
        cxt.set_ask_handler(move |ask: &mut Ask| {
            sink.borrow_mut().push(ask.to_string());
            ask.answer_default()
        });
        cxt.assign_device_handle(image(8 * MIB), "mem", false).unwrap();
        cxt.deassign_device(false).unwrap();
        assert!(seen.borrow().iter().any(|m| m == "Syncing disks."));
    }

    #[test]
    fn test_failed_create_keeps_previous_label() {
        let mut cxt = Context::new();
        cxt.set_ask_handler(DefaultAnswers);
        cxt.assign_device_handle(image(64 * MIB), "mem", false).unwrap();
        cxt.create_disklabel(Some("dos")).unwrap();
        let mut pa = Partition::new();
        pa.start_follow_default(true);
        pa.partno_follow_default(true);
        pa.set_size(8192);
        cxt.add_partition(Some(&pa)).unwrap();
        let id = cxt.get_disklabel_id().unwrap();
        let grain = cxt.grain_size();

        let mut script = Script::new();
        script.set_header("label-id", Some("not-a-guid"));
        cxt.set_script(Some(script));
        assert!(cxt.create_disklabel(Some("gpt")).is_err());

        assert!(cxt.is_label(LabelKind::Dos));
        assert!(!cxt.get_label("gpt").unwrap().state().changed);
        assert_eq!(cxt.get_disklabel_id().unwrap(), id);
        assert_eq!(cxt.grain_size(), grain);
        let tb = cxt.get_partitions().unwrap();
        assert_eq!(tb.len(), 1);
        assert_eq!(tb.get_by_partno(0).unwrap().size(), Some(8192));
        assert!(cxt.label().unwrap().is_changed());
    }

    #[test]
    fn test_label_disabled() {
        let mut cxt = Context::new();
        cxt.assign_device_handle(image(8 * MIB), "mem", false).unwrap();
        cxt.set_label_disabled("sgi", true).unwrap();
        assert!(cxt.create_disklabel(Some("sgi")).is_err());
        assert!(cxt.switch_label("sgi").is_err());
        assert!(cxt.switch_label("aix").is_err());
    }
}
