//! End-to-end archive member location and load (§8 scenario 2; §4.4).
mod common;

use rtl_core::io::StdFs;
use rtl_core::reloc::NativeBackend;
use rtl_core::rtl::{new_rtl, RtlConfig};

#[test]
fn locates_and_loads_a_member_via_the_extended_name_table() {
    let member = "this_is_a_long_member_name_over_fifteen_chars.o";
    let elf_bytes = common::build_fixture_elf();
    let archive_bytes = common::build_archive(&[(member, &elf_bytes)]);

    let (_tmp, archive_path) = common::write_temp_file(&archive_bytes);

    let mut rtl = new_rtl(RtlConfig::new(), Box::new(StdFs), Box::new(NativeBackend));
    let name = format!("{archive_path}:{member}");
    let handle = rtl.load_object(&name).expect("archive member should load");

    assert!(rtl.sym(handle, "w_writeln").is_some());
    assert!(rtl.sym(handle, "zero").is_some());
}

#[test]
fn missing_member_in_an_existing_archive_is_not_found() {
    let elf_bytes = common::build_fixture_elf();
    let archive_bytes = common::build_archive(&[("present.o", &elf_bytes)]);
    let (_tmp, archive_path) = common::write_temp_file(&archive_bytes);

    let mut rtl = new_rtl(RtlConfig::new(), Box::new(StdFs), Box::new(NativeBackend));
    let name = format!("{archive_path}:absent.o");
    let err = rtl.load_object(&name).unwrap_err();
    assert_eq!(err.kind(), rtl_core::ErrorKind::NotFound);
}
