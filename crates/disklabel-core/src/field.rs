//! Displayable partition fields
//!
//! Labels describe which columns they want shown and in what order; a front
//! end renders them without knowing anything about the on-disk format.

use serde::Serialize;
use std::fmt;

/// Column identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FieldId {
    // generic
    Device,
    Start,
    End,
    Sectors,
    Cylinders,
    Size,
    Type,
    TypeId,

    // label specific
    Attr,
    Boot,
    Bsize,
    Cpg,
    Eaddr,
    Fsize,
    Name,
    Saddr,
    Uuid,
}

impl FieldId {
    /// True for columns every label can fill
    pub fn is_generic(&self) -> bool {
        matches!(
            self,
            FieldId::Device
                | FieldId::Start
                | FieldId::End
                | FieldId::Sectors
                | FieldId::Cylinders
                | FieldId::Size
                | FieldId::Type
                | FieldId::TypeId
        )
    }
}

/// Column description
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Field {
    pub id: FieldId,
    pub name: &'static str,
    /// Column width; values below 1 are a fraction of the terminal width
    pub width: f64,
    /// Right-aligned numeric column
    pub number: bool,
    /// Only shown in details mode
    pub detail: bool,
    /// Hidden in details mode (human-readable duplicates of raw columns)
    pub eyecandy: bool,
}

impl Field {
    pub const fn text(id: FieldId, name: &'static str, width: f64) -> Self {
        Self {
            id,
            name,
            width,
            number: false,
            detail: false,
            eyecandy: false,
        }
    }

    pub const fn number(id: FieldId, name: &'static str, width: f64) -> Self {
        Self {
            id,
            name,
            width,
            number: true,
            detail: false,
            eyecandy: false,
        }
    }

    /// Mark as shown in details mode only
    pub const fn detail(mut self) -> Self {
        self.detail = true;
        self
    }

    /// Mark as hidden in details mode
    pub const fn eyecandy(mut self) -> Self {
        self.eyecandy = true;
        self
    }

    /// Whether the column is part of the listing for the given modes
    pub fn is_visible(&self, details: bool, use_cylinders: bool) -> bool {
        if details && self.eyecandy || !details && self.detail {
            return false;
        }
        match self.id {
            FieldId::Sectors => !use_cylinders,
            FieldId::Cylinders => use_cylinders,
            _ => true,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Context-dependent settings for rendering partition fields as text
#[derive(Debug, Clone, Default)]
pub struct FieldFormat {
    /// Device path partition names are derived from
    pub dev_path: String,
    /// Label addresses partitions by letter (`a`, `b`, ...)
    pub inchars_partno: bool,
    /// Display offsets in cylinders
    pub use_cylinders: bool,
    /// Sectors per display unit
    pub units_per_sector: u64,
    pub sector_size: u64,
    /// Show exact byte sizes instead of human-readable ones
    pub details: bool,
}

impl FieldFormat {
    /// Round a sector value to the display unit
    pub fn cround(&self, n: u64) -> u64 {
        if self.use_cylinders && self.units_per_sector != 0 {
            n / self.units_per_sector + 1
        } else {
            n
        }
    }
}
