//! Partition table scripts
//!
//! A script is a block of `name: value` headers followed by one line per
//! partition. It is what `disklabel dump` prints and `disklabel apply` reads:
//!
//! ```text
//! label: dos
//! label-id: 0x3c1f8b5a
//! device: /dev/sdb
//! unit: sectors
//!
//! /dev/sdb1 : start=        2048, size=      204800, type=83, bootable
//! /dev/sdb2 : start=      206848, size=     1843200, type=5
//! ```
//!
//! Partition lines either name their fields (`start=`, `size=`, `type=`,
//! `uuid=`, `name=`, `attrs=`, `bootable`) or list them in the compact order
//! `start, size, type, bootable` where an empty field keeps the default.
//! Numbers without a suffix are sectors; with a suffix they are bytes.

use crate::context::Context;
use crate::label::{LabelKind, LabelOps};
use disklabel_core::{parse_size, partname, parttype, Error, PartType, Partition, Result, Table};
use std::fmt;
use std::io::{BufRead, Read, Write};

/// Longest line [`Script::read_file`] accepts
pub const SCRIPT_BUFSIZ: usize = 4096;

const HEADERS: &[&str] = &[
    "label",
    "label-id",
    "device",
    "unit",
    "grain",
    "first-lba",
    "last-lba",
    "table-length",
    "sector-size",
    "heads",
    "sectors",
    "cylinders",
];

const DOS_SHORTCUTS: &[(&str, &str)] = &[("L", "83"), ("S", "82"), ("E", "05"), ("X", "85")];

const GPT_SHORTCUTS: &[(&str, &str)] = &[
    ("L", "0FC63DAF-8483-4772-8E79-3D69D8477DE4"),
    ("S", "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F"),
    ("H", "933AC7E1-2EB4-4F13-B844-0E14E2AEF915"),
];

/// Headers plus a table of partition templates
#[derive(Debug, Clone)]
pub struct Script {
    headers: Vec<(String, String)>,
    table: Table,
    nlines: usize,
    sector_size: u64,
    /// Format used for type lookups when there is no `label` header
    label: Option<LabelKind>,
}

impl Default for Script {
    fn default() -> Self {
        Self::new()
    }
}

impl Script {
    pub fn new() -> Self {
        Self {
            headers: Vec::new(),
            table: Table::new(),
            nlines: 0,
            sector_size: 512,
            label: None,
        }
    }

    /// Empty script that falls back to the label and sector size of `cxt`
    pub fn for_context(cxt: &Context) -> Self {
        let mut script = Self::new();
        script.label = cxt.label().map(|lb| lb.kind());
        if cxt.sector_size() != 0 {
            script.sector_size = cxt.sector_size();
        }
        script
    }

    /// Describe the label and partitions of `cxt`
    pub fn read_context(cxt: &Context) -> Result<Self> {
        let lb = cxt.label().ok_or(Error::NoLabel)?;
        let mut script = Self::for_context(cxt);
        script.table = cxt.get_partitions()?;

        script.set_header("label", Some(lb.name()));
        if let Some(id) = cxt.get_disklabel_id()? {
            script.set_header("label-id", Some(&id));
        }
        if !cxt.devname().is_empty() {
            script.set_header("device", Some(cxt.devname()));
        }
        script.set_header("unit", Some("sectors"));
        if let Some(gpt) = lb.as_gpt() {
            script.set_header("first-lba", Some(&gpt.first_usable_lba().to_string()));
            script.set_header("last-lba", Some(&gpt.last_usable_lba().to_string()));
            script.set_header("table-length", Some(&gpt.nentries().to_string()));
        }
        if script.sector_size != 512 {
            script.set_header("sector-size", Some(&script.sector_size.to_string()));
        }
        tracing::debug!(
            label = lb.name(),
            partitions = script.table.len(),
            "script read from context"
        );
        Ok(script)
    }

    /// Header value; names are case-insensitive
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set or replace a header, or remove it with `None`
    pub fn set_header(&mut self, name: &str, value: Option<&str>) {
        let pos = self.headers.iter().position(|(n, _)| n.eq_ignore_ascii_case(name));
        match (pos, value) {
            (Some(i), Some(v)) => self.headers[i].1 = v.to_string(),
            (None, Some(v)) => self.headers.push((name.to_ascii_lowercase(), v.to_string())),
            (Some(i), None) => {
                self.headers.remove(i);
            }
            (None, None) => {}
        }
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut Table {
        &mut self.table
    }

    /// Lines read so far, blank lines and comments included
    pub fn nlines(&self) -> usize {
        self.nlines
    }

    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }

    /// Format of the script: the `label` header, else the fallback
    pub fn label_kind(&self) -> Option<LabelKind> {
        self.get_header("label")
            .and_then(LabelKind::from_name)
            .or(self.label)
    }

    /// Emit the script text
    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        write!(out, "{}", self)?;
        Ok(())
    }

    pub fn read_buffer(&mut self, text: &str) -> Result<()> {
        self.read_file(&mut text.as_bytes())
    }

    /// Parse lines until the end of `reader`
    pub fn read_file<R: BufRead>(&mut self, reader: &mut R) -> Result<()> {
        while self.read_line(reader, SCRIPT_BUFSIZ)? {}
        tracing::debug!(
            lines = self.nlines,
            partitions = self.table.len(),
            "script parsed"
        );
        Ok(())
    }

    /// Read and parse one line; `false` at the end of input
    ///
    /// Lines longer than `bufsize` bytes are rejected.
    pub fn read_line<R: BufRead>(&mut self, reader: &mut R, bufsize: usize) -> Result<bool> {
        let mut buf = String::new();
        let n = reader.take(bufsize as u64 + 1).read_line(&mut buf)?;
        if n == 0 {
            return Ok(false);
        }
        self.nlines += 1;
        if buf.len() > bufsize {
            return Err(Error::script(
                self.nlines,
                format!("line longer than {} bytes", bufsize),
            ));
        }

        let line = buf.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(true);
        }
        if self.table.is_empty() && is_header_line(line) {
            self.parse_header(line)?;
        } else if line.contains('=') || device_prefix(line).is_some() {
            self.parse_named(line)?;
        } else {
            self.parse_compact(line)?;
        }
        Ok(true)
    }

    fn error(&self, msg: impl Into<String>) -> Error {
        Error::script(self.nlines, msg)
    }

    fn parse_header(&mut self, line: &str) -> Result<()> {
        let (name, value) = line
            .split_once(':')
            .map(|(n, v)| (n.trim().to_ascii_lowercase(), v.trim()))
            .ok_or_else(|| self.error("header without a value"))?;
        if !HEADERS.contains(&name.as_str()) {
            return Err(self.error(format!("unknown header '{}'", name)));
        }
        match name.as_str() {
            "label" if LabelKind::from_name(value).is_none() => {
                return Err(self.error(format!("unsupported label '{}'", value)));
            }
            "unit" if !value.eq_ignore_ascii_case("sectors") => {
                return Err(self.error(format!("unsupported unit '{}'", value)));
            }
            "sector-size" => {
                let ss = self.header_number(&name, value)?;
                if ss < 512 || !ss.is_power_of_two() {
                    return Err(self.error(format!("unsupported sector size {}", ss)));
                }
                self.sector_size = ss;
            }
            "grain" => {
                parse_size(value).map_err(|e| self.error(e.to_string()))?;
            }
            "first-lba" | "last-lba" | "table-length" | "heads" | "sectors" | "cylinders" => {
                self.header_number(&name, value)?;
            }
            _ => {}
        }
        tracing::trace!(name = %name, value, "script header");
        self.set_header(&name, Some(value));
        Ok(())
    }

    fn header_number(&self, name: &str, value: &str) -> Result<u64> {
        value
            .parse::<u64>()
            .map_err(|_| self.error(format!("header '{}': '{}' is not a number", name, value)))
    }

    fn template(&self) -> Partition {
        let mut pa = Partition::new();
        pa.start_follow_default(true);
        pa.end_follow_default(true);
        pa.partno_follow_default(true);
        pa
    }

    /// `/dev/sdb5` -> partition 5; a name without digits keeps the default
    fn partno_from_device(&self, pa: &mut Partition, dev: &str) -> Result<()> {
        let stem = dev.trim_end_matches(|c: char| c.is_ascii_digit());
        if stem.len() == dev.len() {
            return Ok(());
        }
        let n: usize = dev[stem.len()..]
            .parse()
            .map_err(|_| self.error(format!("'{}': bad partition number", dev)))?;
        if n == 0 {
            return Err(self.error(format!("'{}': partition numbers start at 1", dev)));
        }
        pa.set_partno(n - 1);
        Ok(())
    }

    /// Sectors for `text`; values with a unit suffix are bytes
    fn sectors(&self, text: &str) -> Result<u64> {
        let (n, has_suffix) = parse_size(text).map_err(|e| self.error(e.to_string()))?;
        Ok(if has_suffix { n / self.sector_size } else { n })
    }

    fn parse_type(&self, text: &str, shortcuts: bool) -> Result<PartType> {
        let kind = self
            .label_kind()
            .ok_or_else(|| self.error("partition type given before a label header"))?;
        let mut text = text;
        if shortcuts {
            let table = match kind {
                LabelKind::Dos => DOS_SHORTCUTS,
                LabelKind::Gpt => GPT_SHORTCUTS,
                _ => &[],
            };
            if let Some(&(_, full)) = table.iter().find(|(short, _)| *short == text) {
                text = full;
            }
        }
        let t = parttype::parse(kind.parttypes(), text).map_err(|e| self.error(e.to_string()))?;
        if t.is_unknown() {
            return Err(self.error(format!("unsupported partition type '{}'", text)));
        }
        Ok(t)
    }

    /// `dev : start=N, size=N, type=T, uuid=U, name="S", attrs="S", bootable`
    fn parse_named(&mut self, line: &str) -> Result<()> {
        let mut pa = self.template();
        let mut rest = line;
        if let Some((dev, tail)) = device_prefix(line) {
            self.partno_from_device(&mut pa, dev)?;
            rest = tail;
        }

        for token in tokens(rest).map_err(|m| self.error(m))? {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k.trim().to_ascii_lowercase(), Some(v.trim())),
                None => (token.trim().to_ascii_lowercase(), None),
            };
            match (key.as_str(), value) {
                ("start", Some(v)) => {
                    pa.set_start(self.sectors(v)?);
                    pa.start_follow_default(false);
                }
                ("size", Some(v)) => {
                    pa.set_size(self.sectors(v)?);
                    pa.end_follow_default(false);
                }
                ("end", Some(v)) => {
                    pa.set_end(self.sectors(v)?);
                    pa.end_follow_default(false);
                }
                ("type" | "id", Some(v)) => pa.set_type(self.parse_type(v, false)?),
                ("uuid", Some(v)) => pa.set_uuid(v),
                ("name", Some(v)) => pa.set_name(v),
                ("attrs", Some(v)) => pa.set_attrs(v),
                ("bootable", None) => pa.boot = true,
                _ => return Err(self.error(format!("unknown field '{}'", token))),
            }
        }
        self.push(pa)
    }

    /// `start, size, type, bootable` with empty or `-` fields left default
    fn parse_compact(&mut self, line: &str) -> Result<()> {
        let fields: Vec<&str> = if line.contains([',', ';']) {
            line.split([',', ';']).map(str::trim).collect()
        } else {
            line.split_whitespace().collect()
        };
        if fields.len() > 4 {
            return Err(self.error("too many fields"));
        }

        let mut pa = self.template();
        for (i, &field) in fields.iter().enumerate() {
            let default = field.is_empty() || field == "-";
            match i {
                0 if !default => {
                    pa.set_start(self.sectors(field)?);
                    pa.start_follow_default(false);
                }
                1 if !default && field != "+" => {
                    pa.set_size(self.sectors(field)?);
                    pa.end_follow_default(false);
                }
                2 if !default => pa.set_type(self.parse_type(field, true)?),
                3 => {
                    pa.boot = match field {
                        "*" => true,
                        "" | "-" => false,
                        other => {
                            return Err(self.error(format!("'{}': expected '*' or '-'", other)))
                        }
                    }
                }
                _ => {}
            }
        }
        self.push(pa)
    }

    fn push(&mut self, pa: Partition) -> Result<()> {
        if let Some(n) = pa.partno.filter(|_| !pa.partno_follow_default) {
            let taken = self
                .table
                .iter()
                .any(|p| !p.partno_follow_default && p.partno == Some(n));
            if taken {
                return Err(self.error(format!("partition {} is defined twice", n + 1)));
            }
        }
        tracing::debug!(line = self.nlines, partition = %pa, "script partition");
        self.table
            .add_partition(pa)
            .map_err(|e| Error::script(self.nlines, e.to_string()))
    }
}

/// `name: value`; partition device names always end in a digit
fn is_header_line(line: &str) -> bool {
    match line.split_once(':') {
        Some((name, value)) => {
            let name = name.trim();
            !name.is_empty()
                && !name.ends_with(|c: char| c.is_ascii_digit())
                && !value.trim().is_empty()
                && !line.contains('=')
        }
        None => false,
    }
}

/// The `<dev> :` part of a named partition line and the rest of the line
fn device_prefix(line: &str) -> Option<(&str, &str)> {
    let (dev, tail) = line.split_once(':')?;
    let dev = dev.trim();
    let named = !dev.is_empty() && !dev.contains(['=', '"', ',', ';']);
    named.then_some((dev, tail))
}

/// Split `a=1, b="x, y" c` into tokens without the quotes
///
/// Blanks right after `=` belong to the value, so the padded numbers of
/// written scripts read back.
fn tokens(text: &str) -> std::result::Result<Vec<String>, String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    for c in text.chars() {
        match c {
            '"' => quoted = !quoted,
            ' ' | '\t' if !quoted && cur.ends_with('=') => {}
            ',' | ';' | ' ' | '\t' if !quoted => {
                if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
            }
            _ => cur.push(c),
        }
    }
    if quoted {
        return Err("unterminated quote".to_string());
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    Ok(out)
}

fn write_partition(f: &mut fmt::Formatter<'_>, pa: &Partition, dev: &str) -> fmt::Result {
    let mut fields = Vec::new();
    if let Some(start) = pa.start.filter(|_| !pa.start_is_default()) {
        fields.push(format!("start={:>12}", start));
    }
    if let Some(size) = pa.size().filter(|_| !pa.end_is_default()) {
        fields.push(format!("size={:>12}", size));
    }
    if let Some(t) = &pa.parttype {
        fields.push(format!("type={}", t.id_string()));
    }
    if let Some(uuid) = &pa.uuid {
        fields.push(format!("uuid={}", uuid));
    }
    if let Some(name) = pa.name.as_deref().filter(|n| !n.is_empty()) {
        fields.push(format!("name=\"{}\"", name));
    }
    if let Some(attrs) = pa.attrs.as_deref().filter(|a| !a.is_empty()) {
        fields.push(format!("attrs=\"{}\"", attrs));
    }
    if pa.boot {
        fields.push("bootable".to_string());
    }

    match pa.partno {
        Some(n) if !pa.partno_follow_default => {
            let line = format!("{} : {}", partname(dev, n + 1), fields.join(", "));
            writeln!(f, "{}", line.trim_end())
        }
        // Nothing but defaults: the compact form keeps the line non-empty
        _ if !fields.iter().any(|fl| fl.contains('=')) => {
            writeln!(f, "{}", if pa.boot { ",,,*" } else { "," })
        }
        _ => writeln!(f, "{}", fields.join(", ")),
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.headers {
            writeln!(f, "{}: {}", name, value)?;
        }
        if self.table.is_empty() {
            return Ok(());
        }
        if !self.headers.is_empty() {
            writeln!(f)?;
        }
        let dev = self.get_header("device").unwrap_or("");
        for pa in &self.table {
            write_partition(f, pa, dev)?;
        }
        Ok(())
    }
}

impl Context {
    /// Apply the geometry and label headers of `script`
    ///
    /// Geometry headers replace probed values but not user overrides. The
    /// label named by the script (or its fallback format) is created, and the
    /// script stays attached so the driver can read `label-id` and friends.
    pub fn apply_script_headers(&mut self, script: &Script) -> Result<()> {
        let kind = script
            .label_kind()
            .ok_or_else(|| Error::invalid_argument("script does not name a label"))?;
        tracing::debug!(label = %kind, "applying script headers");

        self.set_script(Some(script.clone()));
        self.apply_script_geometry(script)?;
        if let Some(unit) = script.get_header("unit") {
            self.set_unit(unit)?;
        }
        self.create_disklabel(Some(kind.name()))?;
        // creating the label resets the alignment
        if let Some(grain) = script.get_header("grain") {
            let (bytes, _) = parse_size(grain)?;
            self.set_grain(bytes)?;
        }
        Ok(())
    }

    fn apply_script_geometry(&mut self, script: &Script) -> Result<()> {
        let number = |name: &str| -> Result<Option<u64>> {
            script
                .get_header(name)
                .map(|v| {
                    v.trim().parse::<u64>().map_err(|_| {
                        Error::invalid_argument(format!("header '{}': '{}' is not a number", name, v))
                    })
                })
                .transpose()
        };
        let sector_size = number("sector-size")?;
        let heads = number("heads")?;
        let sectors = number("sectors")?;
        let cylinders = number("cylinders")?;
        if sector_size.is_none() && heads.is_none() && sectors.is_none() && cylinders.is_none() {
            return Ok(());
        }

        if let Some(ss) = sector_size.filter(|&ss| ss < 512 || !ss.is_power_of_two()) {
            return Err(Error::out_of_range(format!("sector size {} not supported", ss)));
        }
        let heads = match heads.map(u32::try_from) {
            Some(Ok(h)) if h <= 256 => Some(h),
            Some(_) => return Err(Error::out_of_range("more than 256 heads not supported")),
            None => None,
        };
        if sectors.is_some_and(|s| s >= 64) {
            return Err(Error::out_of_range("more than 63 sectors per track not supported"));
        }

        let topo = self.disk_mut().topology_mut();
        if let Some(ss) = sector_size.filter(|&ss| ss != topo.sector_size) {
            let bytes = topo.size_bytes();
            topo.sector_size = ss;
            topo.total_sectors = bytes / ss;
            topo.phy_sector_size = topo.phy_sector_size.max(ss);
            topo.min_io_size = topo.min_io_size.max(ss);
        }
        if let Some(h) = heads {
            topo.geom.heads = h;
        }
        if let Some(s) = sectors {
            topo.geom.sectors = s;
        }
        match cylinders {
            Some(c) => topo.geom.cylinders = c,
            None => topo.geom.recount_cylinders(topo.total_sectors),
        }
        tracing::debug!(geometry = %topo.geom, sector_size = topo.sector_size, "script geometry");

        self.apply_user_device_properties();
        Ok(())
    }

    /// Create the label of `script` and every partition in it, in order
    ///
    /// Partitions created before a failing one are kept. The previously
    /// attached script is restored either way.
    pub fn apply_script(&mut self, script: &Script) -> Result<()> {
        tracing::debug!(partitions = script.table().len(), "applying script");
        let old = self.set_script(None);
        let result = match self.apply_script_headers(script) {
            Ok(()) => self.apply_table(script.table()),
            Err(err) => Err(err),
        };
        self.set_script(old);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextConfig;
    use disklabel_core::DefaultAnswers;
    use std::io::Cursor;

    const MIB: u64 = 1024 * 1024;

    fn context(size: u64) -> Context {
        let mut cxt = Context::new();
        cxt.set_ask_handler(DefaultAnswers);
        cxt.assign_device_handle(Box::new(Cursor::new(vec![0u8; size as usize])), "/dev/sdz", false)
            .unwrap();
        cxt
    }

    fn parse(text: &str) -> Result<Script> {
        let mut script = Script::new();
        script.read_buffer(text)?;
        Ok(script)
    }

    fn script_line(err: Error) -> usize {
        match err {
            Error::Script { line, .. } => line,
            other => panic!("expected a script error, got {:?}", other),
        }
    }

    #[test]
    fn test_headers() {
        let mut script = parse("Label: gpt\nunit: sectors\nfirst-lba: 34\n").unwrap();
        assert_eq!(script.get_header("label"), Some("gpt"));
        assert_eq!(script.get_header("FIRST-LBA"), Some("34"));
        assert_eq!(script.label_kind(), Some(LabelKind::Gpt));
        assert!(script.table().is_empty());

        script.set_header("unit", None);
        script.set_header("label-id", Some("0x1"));
        let names: Vec<&str> = script.headers().map(|(n, _)| n).collect();
        assert_eq!(names, ["label", "first-lba", "label-id"]);
    }

    #[test]
    fn test_named_fields() {
        let text = "label: gpt\ndevice: /dev/sdz\n\n\
                    /dev/sdz3 : start=2048, size=1MiB, type=0FC63DAF-8483-4772-8E79-3D69D8477DE4, \
                    name=\"data, mostly\", attrs=\"RequiredPartition\", bootable\n\
                    size=4096, type=21686148-6449-6E6F-744E-656564454649\n";
        let script = parse(text).unwrap();
        assert_eq!(script.table().len(), 2);

        let first = script.table().get(0).unwrap();
        assert_eq!(first.partno, Some(2));
        assert_eq!(first.start, Some(2048));
        assert_eq!(first.size(), Some(2048));
        assert_eq!(first.name.as_deref(), Some("data, mostly"));
        assert_eq!(first.attrs.as_deref(), Some("RequiredPartition"));
        assert!(first.boot);
        assert_eq!(first.parttype.as_ref().unwrap().name, "Linux filesystem");

        let second = script.table().get(1).unwrap();
        assert!(second.partno_follow_default);
        assert!(second.start_is_default());
        assert_eq!(second.size(), Some(4096));
    }

    #[test]
    fn test_compact_form() {
        let text = "label: dos\nunit: sectors\n\n2048,2048,L,*\n,1MiB,S\n;;E\n4096 8192 c\n";
        let script = parse(text).unwrap();
        let parts: Vec<&Partition> = script.table().iter().collect();
        assert_eq!(parts.len(), 4);

        assert_eq!(parts[0].start, Some(2048));
        assert_eq!(parts[0].size(), Some(2048));
        assert_eq!(parts[0].parttype.as_ref().unwrap().code, 0x83);
        assert!(parts[0].boot);

        assert!(parts[1].start_is_default());
        assert_eq!(parts[1].size(), Some(2048));
        assert_eq!(parts[1].parttype.as_ref().unwrap().code, 0x82);

        assert!(parts[2].end_is_default());
        assert_eq!(parts[2].parttype.as_ref().unwrap().code, 0x05);

        // lower case letters are hex codes, not shortcuts
        assert_eq!(parts[3].parttype.as_ref().unwrap().code, 0x0c);
    }

    #[test]
    fn test_default_lines_round_trip() {
        let script = parse("label: dos\n\n;\n,\n,,,*\nsdz4 :\n").unwrap();
        assert_eq!(script.table().len(), 4);

        let text = script.to_string();
        assert!(!text.contains("\n\n\n"));
        let reread = parse(&text).unwrap();
        assert_eq!(reread.table().len(), 4);
        for (a, b) in script.table().iter().zip(reread.table().iter()) {
            assert!(b.start_is_default());
            assert!(b.end_is_default());
            assert_eq!(a.boot, b.boot);
            assert_eq!(a.partno_follow_default, b.partno_follow_default);
        }
        assert!(reread.table().get(2).unwrap().boot);
        assert_eq!(reread.table().get(3).unwrap().partno, Some(3));
        assert_eq!(reread.to_string(), text);
    }

    #[test]
    fn test_gpt_shortcut() {
        let script = parse("label: gpt\n\n,,H\n").unwrap();
        let t = script.table().get(0).unwrap().parttype.clone().unwrap();
        assert_eq!(t.typestr(), Some("933AC7E1-2EB4-4F13-B844-0E14E2AEF915"));
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let err = parse("label: dos\n\n# comment\n,,L\nstart=1, color=red\n").unwrap_err();
        assert_eq!(script_line(err), 5);

        let err = parse("label: dos\n,,L\nunit: sectors\n").unwrap_err();
        assert_eq!(script_line(err), 3);

        assert_eq!(script_line(parse("colour: blue\n").unwrap_err()), 1);
        assert_eq!(script_line(parse("label: amiga\n").unwrap_err()), 1);
        assert_eq!(script_line(parse("\n,,83\n").unwrap_err()), 2);
        assert_eq!(script_line(parse("label: dos\n,,99\n").unwrap_err()), 2);
        assert_eq!(script_line(parse("label: dos\n1 : size=10\n1 : size=20\n").unwrap_err()), 3);
        assert_eq!(script_line(parse("label: gpt\nname=\"open\n").unwrap_err()), 2);
    }

    #[test]
    fn test_line_length_limit() {
        let mut script = Script::new();
        let mut input = "label: dos\n".as_bytes();
        let err = script.read_line(&mut input, 4).unwrap_err();
        assert_eq!(script_line(err), 1);

        let mut script = Script::new();
        let mut input = "label: dos\n".as_bytes();
        assert!(script.read_line(&mut input, 64).unwrap());
        assert!(!script.read_line(&mut input, 64).unwrap());
        assert_eq!(script.nlines(), 1);
    }

    #[test]
    fn test_empty_table_round_trip() {
        let text = "label: gpt\nunit: sectors\n";
        let script = parse(text).unwrap();
        assert_eq!(script.to_string(), text);

        let mut out = Vec::new();
        script.write(&mut out).unwrap();
        assert_eq!(out, text.as_bytes());
    }

    #[test]
    fn test_dos_extended_round_trip() {
        let text = "label: dos\n\
                    label-id: 0x12345678\n\
                    device: /dev/sdz\n\
                    unit: sectors\n\
                    \n\
                    /dev/sdz1 : start=2048, size=20480, type=83, bootable\n\
                    /dev/sdz2 : start=22528, size=40960, type=5\n\
                    /dev/sdz5 : start=24576, size=8192, type=82\n\
                    /dev/sdz6 : start=34816, size=8192, type=83\n";
        let script = parse(text).unwrap();
        assert_eq!(script.table().len(), 4);

        let mut cxt = context(64 * MIB);
        cxt.apply_script(&script).unwrap();
        assert!(cxt.get_script().is_none());

        let dumped = Script::read_context(&cxt).unwrap();
        assert_eq!(dumped.get_header("label-id"), Some("0x12345678"));
        assert_eq!(dumped.get_header("device"), Some("/dev/sdz"));

        let again = parse(&dumped.to_string()).unwrap();
        assert_eq!(again.table().len(), 4);
        for (a, b) in script.table().iter().zip(again.table().iter()) {
            assert_eq!(a.partno, b.partno);
            assert_eq!(a.start, b.start);
            assert_eq!(a.size(), b.size());
            assert_eq!(a.parttype, b.parttype);
            assert_eq!(a.boot, b.boot);
        }
    }

    #[test]
    fn test_gpt_round_trip() {
        let mut cxt = context(8 * MIB);
        cxt.create_disklabel(Some("gpt")).unwrap();
        let mut pa = Partition::new();
        pa.start_follow_default(true);
        pa.end_follow_default(true);
        pa.partno_follow_default(true);
        pa.set_name("root");
        cxt.add_partition(Some(&pa)).unwrap();

        let dumped = Script::read_context(&cxt).unwrap();
        let text = dumped.to_string();
        assert!(text.starts_with("label: gpt\n"));
        assert!(text.contains("name=\"root\""));

        let parsed = parse(&text).unwrap();
        let h1: Vec<(&str, &str)> = dumped.headers().collect();
        let h2: Vec<(&str, &str)> = parsed.headers().collect();
        assert_eq!(h1, h2);

        let mut copy = context(8 * MIB);
        copy.apply_script(&parsed).unwrap();
        assert_eq!(copy.get_disklabel_id().unwrap(), cxt.get_disklabel_id().unwrap());
        let a = cxt.get_partition(0).unwrap();
        let b = copy.get_partition(0).unwrap();
        assert_eq!((a.start, a.size()), (b.start, b.size()));
        assert_eq!(a.parttype, b.parttype);
        assert_eq!(a.name, b.name);
        assert_eq!(a.uuid, b.uuid);
    }

    #[test]
    fn test_partial_apply_keeps_earlier_partitions() {
        let script = parse("label: dos\n\nstart=2048, size=2048, type=83\nstart=2048, size=2048, type=83\n")
            .unwrap();
        let mut cxt = context(16 * MIB);
        let mut previous = Script::new();
        previous.set_header("label", Some("dos"));
        cxt.set_script(Some(previous));

        assert!(cxt.apply_script(&script).is_err());
        assert_eq!(cxt.get_partitions().unwrap().len(), 1);
        assert_eq!(cxt.get_script().and_then(|s| s.get_header("label")), Some("dos"));
        assert!(cxt.get_script().unwrap().table().is_empty());
    }

    #[test]
    fn test_script_geometry_and_user_overrides() {
        let script = parse("label: dos\nheads: 64\nsectors: 32\n").unwrap();

        let mut plain = context(64 * MIB);
        plain.apply_script_headers(&script).unwrap();
        assert_eq!(plain.geom_heads(), 64);
        assert_eq!(plain.geom_sectors(), 32);
        assert_eq!(plain.geom_cylinders(), 64);
        assert!(plain.is_label(LabelKind::Dos));
        assert!(plain.get_script().is_some());

        let mut cxt = Context::with_config(ContextConfig::default().geometry(0, 16, 0));
        cxt.set_ask_handler(DefaultAnswers);
        cxt.assign_device_handle(Box::new(Cursor::new(vec![0u8; (64 * MIB) as usize])), "img", false)
            .unwrap();
        cxt.apply_script_headers(&script).unwrap();
        assert_eq!(cxt.geom_heads(), 16);
        assert_eq!(cxt.geom_sectors(), 32);
    }

    #[test]
    fn test_script_grain_and_bad_geometry() {
        let script = parse("label: gpt\ngrain: 4MiB\n").unwrap();
        let mut cxt = context(64 * MIB);
        cxt.apply_script_headers(&script).unwrap();
        assert_eq!(cxt.grain_size(), 4 * MIB);

        let script = parse("label: dos\nsectors: 99\n").unwrap();
        let mut cxt = context(64 * MIB);
        assert!(cxt.apply_script_headers(&script).is_err());
        assert!(!cxt.has_label());
    }
}
