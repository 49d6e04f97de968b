//! End-to-end scenarios against disk images

use disklabel_core::{cmp_start, parttype, DefaultAnswers, Error, Partition, Table};
use disklabel_labels::{Context, LabelKind, LabelOps, Script};
use std::io::Cursor;
use tempfile::NamedTempFile;

const SECTOR: u64 = 512;

fn image(sectors: u64) -> NamedTempFile {
    let file = NamedTempFile::new().unwrap();
    file.as_file().set_len(sectors * SECTOR).unwrap();
    file
}

fn open(file: &NamedTempFile, readonly: bool) -> Context {
    let mut cxt = Context::new();
    cxt.set_ask_handler(DefaultAnswers);
    cxt.assign_device(file.path(), readonly).unwrap();
    cxt
}

fn in_memory(sectors: u64) -> Context {
    let mut cxt = Context::new();
    cxt.set_ask_handler(DefaultAnswers);
    let dev = Cursor::new(vec![0u8; (sectors * SECTOR) as usize]);
    cxt.assign_device_handle(Box::new(dev), "/dev/sdz", false).unwrap();
    cxt
}

fn template() -> Partition {
    let mut pa = Partition::new();
    pa.start_follow_default(true);
    pa.partno_follow_default(true);
    pa
}

#[test]
fn gpt_first_partition_lands_on_the_first_grain() {
    let file = image(1_048_576);
    let mut cxt = open(&file, false);
    assert_eq!(cxt.grain_size(), 1024 * 1024);

    cxt.create_disklabel(Some("gpt")).unwrap();
    let mut pa = template();
    pa.set_size(100_000);
    assert_eq!(cxt.add_partition(Some(&pa)).unwrap(), 0);

    let got = cxt.get_partition(0).unwrap();
    assert_eq!(got.start, Some(2048));
    assert_eq!(got.end(), Some(2048 + 100_000 - 1));

    cxt.write_disklabel().unwrap();
    cxt.deassign_device(false).unwrap();

    let cxt = open(&file, true);
    assert!(cxt.is_label(LabelKind::Gpt));
    assert_eq!(cxt.get_partition(0).unwrap().end(), Some(102_047));
}

#[test]
fn next_partno_does_not_reserve_the_slot() {
    let mut cxt = in_memory(131_072);
    cxt.create_disklabel(Some("gpt")).unwrap();
    let mut pa = template();
    pa.set_size(2048);

    assert_eq!(cxt.partition_next_partno(Some(&pa)).unwrap(), 0);
    assert_eq!(cxt.partition_next_partno(Some(&pa)).unwrap(), 0);
    cxt.add_partition(Some(&pa)).unwrap();
    assert_eq!(cxt.partition_next_partno(Some(&pa)).unwrap(), 1);
}

#[test]
fn switching_label_discards_the_old_table() {
    let mut cxt = in_memory(131_072);
    cxt.create_disklabel(Some("dos")).unwrap();
    let mut pa = template();
    pa.set_size(4096);
    cxt.add_partition(Some(&pa)).unwrap();
    assert_eq!(cxt.get_label("dos").unwrap().state().nparts_cur, 1);

    cxt.switch_label("gpt").unwrap();
    assert!(cxt.is_label(LabelKind::Gpt));
    assert!(!cxt.is_label(LabelKind::Dos));
    let dos = cxt.get_label("dos").unwrap();
    assert_eq!(dos.state().nparts_cur, 0);
    assert!(!dos.state().changed);
}

#[test]
fn script_dump_and_apply_reproduce_the_table() {
    let file = image(262_144);
    let mut cxt = open(&file, false);
    let mut script = Script::new();
    script
        .read_buffer(
            "label: dos\n\
             unit: sectors\n\
             \n\
             ,64MiB,L,*\n\
             ,,E\n\
             ,16MiB,S\n\
             ,,L\n",
        )
        .unwrap();
    cxt.apply_script(&script).unwrap();
    cxt.write_disklabel().unwrap();

    let dumped = Script::read_context(&cxt).unwrap();
    assert_eq!(dumped.table().len(), 4);
    let text = dumped.to_string();

    let copy_file = image(262_144);
    let mut copy = open(&copy_file, false);
    let mut reread = Script::new();
    reread.read_buffer(&text).unwrap();
    copy.apply_script(&reread).unwrap();

    let a = cxt.get_partitions().unwrap();
    let b = copy.get_partitions().unwrap();
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b.iter()) {
        assert_eq!(x.partno, y.partno);
        assert_eq!((x.start, x.size()), (y.start, y.size()));
        assert_eq!(x.parttype, y.parttype);
        assert_eq!(x.boot, y.boot);
    }
    assert!(b.get_by_partno(1).unwrap().is_container());
    assert_eq!(b.get_by_partno(4).unwrap().parent_partno, Some(1));
}

#[test]
fn read_only_contexts_refuse_changes() {
    let file = image(131_072);
    let mut cxt = open(&file, true);
    assert!(matches!(cxt.create_disklabel(Some("gpt")), Err(Error::ReadOnly(_))));

    let mut listing = open(&file, false);
    listing.enable_listonly(true);
    assert!(matches!(listing.create_disklabel(Some("dos")), Err(Error::ReadOnly(_))));
}

#[test]
fn table_order_and_free_space() {
    let mut cxt = in_memory(131_072);
    cxt.create_disklabel(Some("dos")).unwrap();
    for start in [40_960u64, 2048] {
        let mut pa = template();
        pa.start_follow_default(false);
        pa.set_start(start);
        pa.set_size(8192);
        cxt.add_partition(Some(&pa)).unwrap();
    }

    let mut tb: Table = cxt.get_partitions().unwrap();
    assert!(tb.wrong_order());
    tb.sort_partitions(cmp_start);
    assert!(!tb.wrong_order());

    let free = cxt.get_freespaces().unwrap();
    let starts: Vec<Option<u64>> = free.iter().map(|p| p.start).collect();
    assert_eq!(starts, [Some(10_240), Some(49_152)]);
}

#[test]
fn unknown_codes_are_synthesized() {
    let catalog = LabelKind::Dos.parttypes();
    let t = parttype::from_code(catalog, 0x99);
    assert_eq!(t.code, 0x99);
    assert!(t.is_unknown());
    assert!(!parttype::is_cataloged(catalog, &t));

    let gpt = LabelKind::Gpt.parttypes();
    let home = parttype::from_string(gpt, "933ac7e1-2eb4-4f13-b844-0e14e2aef915");
    assert!(parttype::is_cataloged(gpt, &home));
}

#[test]
fn default_only_script_lines_survive_dump_and_apply() {
    let mut script = Script::new();
    script.read_buffer("label: dos\n\n,16MiB,L\n;\n").unwrap();
    let text = script.to_string();
    let mut reread = Script::new();
    reread.read_buffer(&text).unwrap();
    assert_eq!(reread.table().len(), 2);

    let first = image(131_072);
    let mut a = open(&first, false);
    a.apply_script(&script).unwrap();
    let second = image(131_072);
    let mut b = open(&second, false);
    b.apply_script(&reread).unwrap();

    let (ta, tb) = (a.get_partitions().unwrap(), b.get_partitions().unwrap());
    assert_eq!(tb.len(), 2);
    for (x, y) in ta.iter().zip(tb.iter()) {
        assert_eq!((x.partno, x.start, x.size()), (y.partno, y.start, y.size()));
    }
    assert_eq!(tb.get_by_partno(1).unwrap().end(), Some(131_071));
}

#[test]
fn logical_created_in_an_earlier_gap_is_read_back() {
    let file = image(524_288);
    let mut cxt = open(&file, false);
    cxt.create_disklabel(Some("dos")).unwrap();
    let dos = LabelKind::Dos.parttypes();

    let mut ext = template();
    ext.set_size(200_000);
    ext.set_type(parttype::from_code(dos, 0x05));
    cxt.add_partition(Some(&ext)).unwrap();

    for (partno, start) in [(4, None), (5, Some(100_000u64)), (6, None)] {
        let mut pa = template();
        pa.set_partno(partno);
        pa.set_size(16_384);
        pa.set_type(parttype::from_code(dos, 0x83));
        if let Some(start) = start {
            pa.start_follow_default(false);
            pa.set_start(start);
        }
        cxt.add_partition(Some(&pa)).unwrap();
    }
    let before = cxt.get_partitions().unwrap();
    assert_eq!(before.len(), 4);
    assert!(before.get_by_partno(6).unwrap().start < before.get_by_partno(5).unwrap().start);

    cxt.write_disklabel().unwrap();
    cxt.deassign_device(false).unwrap();

    let again = open(&file, true);
    let after = again.get_partitions().unwrap();
    assert_eq!(after.len(), 4);
    for n in 4..7 {
        let (x, y) = (before.get_by_partno(n).unwrap(), after.get_by_partno(n).unwrap());
        assert_eq!((x.start, x.size()), (y.start, y.size()));
        assert_eq!(y.parent_partno, Some(0));
    }
}

#[test]
fn failed_create_leaves_the_old_label_active() {
    let mut cxt = in_memory(131_072);
    cxt.create_disklabel(Some("dos")).unwrap();
    let mut pa = template();
    pa.set_size(4096);
    cxt.add_partition(Some(&pa)).unwrap();

    let mut script = Script::new();
    script.set_header("label-id", Some("zzzz"));
    cxt.set_script(Some(script));
    assert!(cxt.create_disklabel(Some("gpt")).is_err());

    assert!(cxt.is_label(LabelKind::Dos));
    assert_eq!(cxt.get_partitions().unwrap().len(), 1);
    assert_eq!(cxt.get_partition(0).unwrap().size(), Some(4096));
}
