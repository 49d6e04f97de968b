//! Partition types and per-label type catalogs
//!
//! Labels with numeric type codes (DOS, SUN, SGI, BSD) identify types by
//! `code`; GUID based labels (GPT) by `typestr`. Both kinds share one type.

use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt;

/// Static catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartTypeDef {
    pub code: u32,
    pub typestr: Option<&'static str>,
    pub name: &'static str,
}

impl PartTypeDef {
    /// Entry for a label with numeric type codes
    pub const fn code(code: u32, name: &'static str) -> Self {
        Self {
            code,
            typestr: None,
            name,
        }
    }

    /// Entry for a label with string type identifiers
    pub const fn string(typestr: &'static str, name: &'static str) -> Self {
        Self {
            code: 0,
            typestr: Some(typestr),
            name,
        }
    }
}

/// A partition type, either from a label catalog or synthesized
#[derive(Debug, Clone, Serialize)]
pub struct PartType {
    pub code: u32,
    pub typestr: Option<String>,
    pub name: String,
    /// Not present in the label catalog
    pub unknown: bool,
}

impl PartType {
    /// Create a type not listed in any catalog
    pub fn new_unknown(code: u32, typestr: Option<&str>) -> Self {
        tracing::trace!(code, ?typestr, "synthesized unknown partition type");
        Self {
            code,
            typestr: typestr.map(str::to_string),
            name: "unknown".to_string(),
            unknown: true,
        }
    }

    /// True if the type was synthesized rather than found in a catalog
    pub fn is_unknown(&self) -> bool {
        self.unknown
    }

    /// String identifier, if the type has a non-empty one
    pub fn typestr(&self) -> Option<&str> {
        self.typestr.as_deref().filter(|s| !s.is_empty())
    }

    /// Identifier as shown to users: the type string, or the hex code
    pub fn id_string(&self) -> String {
        match self.typestr() {
            Some(s) => s.to_string(),
            None => format!("{:x}", self.code),
        }
    }
}

impl From<&PartTypeDef> for PartType {
    fn from(def: &PartTypeDef) -> Self {
        Self {
            code: def.code,
            typestr: def.typestr.map(str::to_string),
            name: def.name.to_string(),
            unknown: false,
        }
    }
}

/// Types are equal when code and (case-insensitive) type string agree;
/// names and the unknown marker do not take part.
impl PartialEq for PartType {
    fn eq(&self, other: &Self) -> bool {
        if self.code != other.code {
            return false;
        }
        match (self.typestr(), other.typestr()) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Eq for PartType {}

impl fmt::Display for PartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// True if the catalog identifies types by numeric code
pub fn has_code_types(catalog: &[PartTypeDef]) -> bool {
    catalog.first().map_or(true, |t| t.typestr.is_none())
}

/// Catalog entry with the given code
pub fn find_by_code(catalog: &[PartTypeDef], code: u32) -> Option<&PartTypeDef> {
    catalog.iter().find(|t| t.code == code)
}

/// Catalog entry with the given type string (case-insensitive)
pub fn find_by_string<'a>(catalog: &'a [PartTypeDef], s: &str) -> Option<&'a PartTypeDef> {
    catalog
        .iter()
        .find(|t| t.typestr.is_some_and(|ts| ts.eq_ignore_ascii_case(s)))
}

/// Type for `code`, synthesizing an unknown one when it is not cataloged
pub fn from_code(catalog: &[PartTypeDef], code: u32) -> PartType {
    find_by_code(catalog, code)
        .map(PartType::from)
        .unwrap_or_else(|| PartType::new_unknown(code, None))
}

/// Type for the string identifier, synthesizing an unknown one on a miss
pub fn from_string(catalog: &[PartTypeDef], s: &str) -> PartType {
    find_by_string(catalog, s)
        .map(PartType::from)
        .unwrap_or_else(|| PartType::new_unknown(0, Some(s)))
}

/// True if `t` is one of the catalog entries
pub fn is_cataloged(catalog: &[PartTypeDef], t: &PartType) -> bool {
    !t.unknown && catalog.iter().any(|def| PartType::from(def) == *t)
}

/// Parse user input into a type
///
/// Code based catalogs take a hex code. String based catalogs take the type
/// string or a 1-based position in the catalog. Well-formed identifiers not
/// in the catalog produce unknown types.
pub fn parse(catalog: &[PartTypeDef], text: &str) -> Result<PartType> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::unknown_type("empty partition type"));
    }
    tracing::trace!(text, "parsing partition type");

    if has_code_types(catalog) {
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        let code = u32::from_str_radix(digits, 16)
            .map_err(|_| Error::unknown_type(format!("'{}' is not a hex type code", text)))?;
        return Ok(from_code(catalog, code));
    }

    if let Some(def) = find_by_string(catalog, text) {
        return Ok(def.into());
    }
    if let Ok(n) = text.parse::<usize>() {
        if n > 0 && n <= catalog.len() {
            return Ok((&catalog[n - 1]).into());
        }
        return Err(Error::unknown_type(format!("type number {} out of range", n)));
    }
    Ok(PartType::new_unknown(0, Some(text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODES: &[PartTypeDef] = &[
        PartTypeDef::code(0x00, "Empty"),
        PartTypeDef::code(0x83, "Linux"),
        PartTypeDef::code(0x82, "Linux swap / Solaris"),
    ];

    const GUIDS: &[PartTypeDef] = &[
        PartTypeDef::string("C12A7328-F81F-11D2-BA4B-00A0C93EC93B", "EFI System"),
        PartTypeDef::string("0FC63DAF-8483-4772-8E79-3D69D8477DE4", "Linux filesystem"),
    ];

    #[test]
    fn test_from_code() {
        let t = from_code(CODES, 0x83);
        assert_eq!(t.name, "Linux");
        assert!(is_cataloged(CODES, &t));

        let u = from_code(CODES, 0x42);
        assert!(u.is_unknown());
        assert_eq!(u.code, 0x42);
        assert_eq!(u.name, "unknown");
        assert!(!is_cataloged(CODES, &u));
        assert_eq!(u, PartType::new_unknown(0x42, None));
    }

    #[test]
    fn test_from_string_case_insensitive() {
        let t = from_string(GUIDS, "0fc63daf-8483-4772-8e79-3d69d8477de4");
        assert_eq!(t.name, "Linux filesystem");
        assert!(!t.is_unknown());
        assert_eq!(t, from_string(GUIDS, "0FC63DAF-8483-4772-8E79-3D69D8477DE4"));
    }

    #[test]
    fn test_parse() {
        assert_eq!(parse(CODES, "83").unwrap().name, "Linux");
        assert_eq!(parse(CODES, "0x82").unwrap().code, 0x82);
        assert!(parse(CODES, "fd").unwrap().is_unknown());
        assert!(parse(CODES, "linux").is_err());

        assert_eq!(parse(GUIDS, "1").unwrap().name, "EFI System");
        assert!(parse(GUIDS, "7").is_err());
        let u = parse(GUIDS, "11111111-2222-3333-4444-555555555555").unwrap();
        assert!(u.is_unknown());
        assert_eq!(u.id_string(), "11111111-2222-3333-4444-555555555555");
    }

    #[test]
    fn test_has_code_types() {
        assert!(has_code_types(CODES));
        assert!(!has_code_types(GUIDS));
    }
}
