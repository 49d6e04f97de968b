//! Disklabel CLI - partition table front end
//!
//! Lists, dumps, applies and creates partition tables on block devices and
//! disk images.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use disklabel_core::{size_to_human_string, Ask, FieldId, Table};
use disklabel_labels::{Context, ContextConfig, LabelOps, Script};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "disklabel")]
#[command(about = "Display or manipulate disk partition tables", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level or filter directives (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "warn", global = true)]
    log_level: String,

    /// Display units: sectors or cylinders
    #[arg(long, short = 'u', default_value = "sectors", global = true)]
    units: String,

    /// Show exact sizes and the detail columns
    #[arg(long, short = 'x', global = true)]
    details: bool,

    /// DOS-compatible (cylinder aligned) MBR layout
    #[arg(long, global = true)]
    compat: bool,

    /// Override the number of cylinders
    #[arg(long, short = 'C', global = true)]
    cylinders: Option<u64>,

    /// Override the number of heads
    #[arg(long, short = 'H', global = true)]
    heads: Option<u32>,

    /// Override the number of sectors per track
    #[arg(long, short = 'S', global = true)]
    sectors: Option<u64>,

    /// Override the logical sector size
    #[arg(long, short = 'b', global = true)]
    sector_size: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// List the partition tables of the given devices
    List {
        #[arg(required = true)]
        devices: Vec<PathBuf>,

        /// Print the partitions as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the partition table in script form
    Dump { device: PathBuf },

    /// Create a partition table from a script (file or stdin)
    Apply {
        device: PathBuf,

        script: Option<PathBuf>,

        /// Do not ask the kernel to re-read the partition table
        #[arg(long)]
        no_reread: bool,
    },

    /// Write an empty partition table
    Create {
        device: PathBuf,

        /// Label type: dos, gpt, bsd, sgi or sun
        label: String,
    },
}

impl Cli {
    fn config(&self, listonly: bool) -> ContextConfig {
        ContextConfig::default()
            .details(self.details)
            .listonly(listonly)
            .cylinder_units(self.units.eq_ignore_ascii_case("cylinders"))
            .dos_compatible(self.compat)
            .geometry(
                self.cylinders.unwrap_or(0),
                self.heads.unwrap_or(0),
                self.sectors.unwrap_or(0),
            )
            .sector_size(0, self.sector_size.unwrap_or(0))
    }

    fn open(&self, device: &Path, readonly: bool) -> Result<Context> {
        let mut cxt = Context::with_config(self.config(readonly));
        cxt.set_unit(&self.units)?;
        cxt.set_ask_handler(terminal_dialog);
        cxt.assign_device(device, readonly)
            .with_context(|| format!("cannot open {}", device.display()))?;
        Ok(cxt)
    }
}

/// Print messages, take the default answer for every question
fn terminal_dialog(ask: &mut Ask) -> disklabel_core::Result<()> {
    match ask {
        Ask::Info(msg) => println!("{}", msg),
        Ask::Warn { .. } | Ask::WarnX(_) => eprintln!("{}", ask),
        _ => {
            tracing::debug!(query = ask.query(), "answering with the default");
            ask.answer_default()?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.as_str())
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    run(&cli)
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::List { devices, json } => {
            for (i, dev) in devices.iter().enumerate() {
                if i > 0 && !json {
                    println!();
                }
                list(cli, dev, *json)?;
            }
        }
        Command::Dump { device } => dump(cli, device)?,
        Command::Apply {
            device,
            script,
            no_reread,
        } => apply(cli, device, script.as_deref(), *no_reread)?,
        Command::Create { device, label } => create(cli, device, label)?,
    }
    Ok(())
}

#[derive(Serialize)]
struct Listing<'a> {
    device: &'a str,
    sectors: u64,
    sector_size: u64,
    label: Option<&'static str>,
    id: Option<String>,
    partitions: Table,
}

impl<'a> Listing<'a> {
    fn new(cxt: &'a Context) -> Result<Self> {
        Ok(Self {
            device: cxt.devname(),
            sectors: cxt.total_sectors(),
            sector_size: cxt.sector_size(),
            label: cxt.label().map(|lb| lb.name()),
            id: if cxt.has_label() { cxt.get_disklabel_id()? } else { None },
            partitions: if cxt.has_label() { cxt.get_partitions()? } else { Table::new() },
        })
    }
}

fn list(cli: &Cli, device: &Path, json: bool) -> Result<()> {
    let cxt = cli.open(device, true)?;

    if json {
        let listing = Listing::new(&cxt)?;
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    print_disk_summary(&cxt);
    if !cxt.has_label() {
        return Ok(());
    }
    println!("Disklabel type: {}", cxt.label().map_or("", |lb| lb.name()));
    if let Some(id) = cxt.get_disklabel_id()? {
        println!("Disk identifier: {}", id);
    }
    cxt.list_disklabel()?;

    let table = cxt.get_partitions()?;
    if table.is_empty() {
        return Ok(());
    }
    println!();
    print_table(&cxt, &table)?;

    for pa in &table {
        let (Some(n), Some(start)) = (pa.partno, pa.start) else {
            continue;
        };
        if !cxt.lba_is_phy_aligned(start) {
            eprintln!("Partition {} does not start on physical sector boundary.", n + 1);
        }
    }
    if table.wrong_order() {
        eprintln!("Partition table entries are not in disk order.");
    }
    Ok(())
}

fn print_disk_summary(cxt: &Context) {
    let bytes = cxt.total_sectors() * cxt.sector_size();
    println!(
        "Disk {}: {}, {} bytes, {} sectors",
        cxt.devname(),
        size_to_human_string(bytes),
        bytes,
        cxt.total_sectors()
    );
    if cxt.is_details() {
        println!(
            "Geometry: {} heads, {} sectors/track, {} cylinders",
            cxt.geom_heads(),
            cxt.geom_sectors(),
            cxt.geom_cylinders()
        );
    }
    println!(
        "Units: {} of {} * {} = {} bytes",
        cxt.get_unit(true),
        cxt.units_per_sector(),
        cxt.sector_size(),
        cxt.units_per_sector() * cxt.sector_size()
    );
    println!(
        "Sector size (logical/physical): {} bytes / {} bytes",
        cxt.sector_size(),
        cxt.phy_sector_size()
    );
    println!(
        "I/O size (minimum/optimal): {} bytes / {} bytes",
        cxt.min_io_size(),
        cxt.optimal_io_size()
    );
    if cxt.alignment_offset() != 0 {
        println!("Alignment offset: {} bytes", cxt.alignment_offset());
    }
}

fn print_table(cxt: &Context, table: &Table) -> Result<()> {
    let ids: Vec<FieldId> = cxt.get_field_ids()?;
    let fields: Vec<_> = ids.iter().filter_map(|&id| cxt.get_field(id)).collect();

    let rows: Vec<Vec<String>> = table
        .iter()
        .map(|pa| {
            fields
                .iter()
                .map(|f| cxt.partition_to_string(pa, f.id).unwrap_or_default())
                .collect()
        })
        .collect();
    let widths: Vec<usize> = fields
        .iter()
        .enumerate()
        .map(|(i, f)| rows.iter().map(|r| r[i].len()).fold(f.name.len(), usize::max))
        .collect();

    let render = |cells: Vec<String>| -> String {
        let line: Vec<String> = cells
            .into_iter()
            .zip(fields.iter().zip(&widths))
            .map(|(cell, (f, &w))| {
                if f.number {
                    format!("{:>w$}", cell, w = w)
                } else {
                    format!("{:<w$}", cell, w = w)
                }
            })
            .collect();
        line.join(" ").trim_end().to_string()
    };

    println!("{}", render(fields.iter().map(|f| f.name.to_string()).collect()));
    for row in rows {
        println!("{}", render(row));
    }
    Ok(())
}

fn dump(cli: &Cli, device: &Path) -> Result<()> {
    let cxt = cli.open(device, true)?;
    if !cxt.has_label() {
        anyhow::bail!("{}: does not contain a recognized partition table", device.display());
    }
    let script = Script::read_context(&cxt)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    script.write(&mut out)?;
    out.flush()?;
    Ok(())
}

/// Script from `source`, or from stdin without one
fn read_script(cxt: &Context, source: Option<&Path>) -> Result<Script> {
    let mut script = Script::for_context(cxt);
    match source {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("cannot open script {}", path.display()))?;
            script
                .read_file(&mut BufReader::new(file))
                .with_context(|| format!("cannot parse {}", path.display()))?;
        }
        None => {
            let stdin = io::stdin();
            script
                .read_file(&mut stdin.lock())
                .context("cannot parse script from stdin")?;
        }
    }
    tracing::info!(partitions = script.table().len(), "script read");
    Ok(script)
}

fn apply(cli: &Cli, device: &Path, source: Option<&Path>, no_reread: bool) -> Result<()> {
    let mut cxt = cli.open(device, false)?;
    let script = read_script(&cxt, source)?;

    cxt.apply_script(&script)
        .with_context(|| format!("failed to apply script to {}", device.display()))?;
    let nerrors = cxt.verify_disklabel()?;
    if nerrors > 0 {
        tracing::warn!(nerrors, "label verification reported problems");
    }
    println!();
    println!("New situation:");
    list_applied(&cxt)?;

    cxt.write_disklabel()?;
    println!("The partition table has been altered.");
    if !no_reread {
        if let Err(err) = cxt.reread_partition_table() {
            eprintln!("Re-reading the partition table failed: {}", err);
        }
    }
    cxt.deassign_device(false)?;
    Ok(())
}

fn list_applied(cxt: &Context) -> Result<()> {
    print_disk_summary(cxt);
    let table = cxt.get_partitions()?;
    if !table.is_empty() {
        println!();
        print_table(cxt, &table)?;
    }
    Ok(())
}

fn create(cli: &Cli, device: &Path, label: &str) -> Result<()> {
    let mut cxt = cli.open(device, false)?;
    cxt.create_disklabel(Some(label))
        .with_context(|| format!("cannot create a {} label", label))?;
    cxt.write_disklabel()?;
    cxt.deassign_device(false)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn image(sectors: u64) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(sectors * 512).unwrap();
        file
    }

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("disklabel").chain(args.iter().copied())).unwrap()
    }

    fn path(file: &NamedTempFile) -> &str {
        file.path().to_str().unwrap()
    }

    #[test]
    fn test_apply_script_file() {
        let img = image(131_072);
        let mut script = NamedTempFile::new().unwrap();
        script
            .write_all(b"label: gpt\n\n,16MiB,L\n,,S\n")
            .unwrap();

        let args = cli(&["apply", path(&img), path(&script), "--no-reread"]);
        run(&args).unwrap();

        let cxt = args.open(img.path(), true).unwrap();
        assert!(cxt.has_label());
        assert_eq!(cxt.label().map(|lb| lb.name()), Some("gpt"));
        let table = cxt.get_partitions().unwrap();
        assert_eq!(table.len(), 2);
        let first = table.get_by_partno(0).unwrap();
        assert_eq!(first.start, Some(2048));
        assert_eq!(first.size(), Some(32_768));
    }

    #[test]
    fn test_apply_rejects_bad_script() {
        let img = image(131_072);
        let mut script = NamedTempFile::new().unwrap();
        script.write_all(b"label: dos\n\n,,zz\n").unwrap();
        let args = cli(&["apply", path(&img), path(&script), "--no-reread"]);
        assert!(run(&args).is_err());
    }

    #[test]
    fn test_json_listing() {
        let img = image(131_072);
        run(&cli(&["create", path(&img), "dos"])).unwrap();

        let args = cli(&["list", "--json", path(&img)]);
        let cxt = args.open(img.path(), true).unwrap();
        let value = serde_json::to_value(Listing::new(&cxt).unwrap()).unwrap();
        assert_eq!(value["label"], "dos");
        assert_eq!(value["sectors"], 131_072);
        assert_eq!(value["sector_size"], 512);
        assert!(value["id"].as_str().unwrap().starts_with("0x"));
        assert_eq!(value["partitions"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_json_listing_partitions() {
        let img = image(131_072);
        let mut script = NamedTempFile::new().unwrap();
        script.write_all(b"label: dos\n\n,8MiB,L,*\n").unwrap();
        run(&cli(&["apply", path(&img), path(&script), "--no-reread"])).unwrap();

        let args = cli(&["list", "--json", path(&img)]);
        let cxt = args.open(img.path(), true).unwrap();
        let value = serde_json::to_value(Listing::new(&cxt).unwrap()).unwrap();
        let parts = value["partitions"].as_array().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0]["partno"], 0);
        assert_eq!(parts[0]["start"], 2048);
        assert_eq!(parts[0]["size"], 16_384);
        assert_eq!(parts[0]["boot"], true);
        assert_eq!(parts[0]["type"]["code"], 0x83);
    }
}
