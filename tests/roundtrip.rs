#![allow(unused_crate_dependencies)]
//! Exercises the full assemble -> link -> load -> run pipeline across crate boundaries.

use basm_cpu::prelude::*;
use basm_link::prelude as link;
use basm_memory::prelude::*;
use basm_object::prelude::*;

#[test]
fn assembles_links_and_runs_a_cross_module_branch() {
    let main_src = b".text\n.global entry\nentry:\nb helper\nhalt\n";
    let helper_src = b".text\n.global helper\nhelper:\nhalt\n";

    let main_object = basm_asm::assembler::assemble(main_src).expect("main module should assemble cleanly");
    let helper_object = basm_asm::assembler::assemble(helper_src).expect("helper module should assemble cleanly");

    let linked = link::link(vec![main_object, helper_object], vec![], link::DEFAULT_ENTRY)
        .expect("linking two mutually consistent modules should succeed");

    let text = linked.section(SectionKind::Text).unwrap().data.clone();
    assert_eq!(text.len(), 12, "entry's branch+halt plus helper's halt");

    let mut bus = SystemBus::new(4);
    for (i, byte) in text.iter().enumerate() {
        bus.write_byte(link::DEFAULT_ENTRY + i as u32, *byte, true).unwrap();
    }

    let mut cpu = Cpu::default();
    cpu.regs.pc = link::DEFAULT_ENTRY;

    let exception = cpu.run(&mut bus, 16);
    assert_eq!(exception, Exception::Halt);
    // The branch landed on helper's halt (offset 8); halting leaves pc one word past it.
    assert_eq!(cpu.regs.pc, link::DEFAULT_ENTRY + 12);
}

#[test]
fn linking_an_unresolved_extern_is_reported() {
    let src = b".text\nb missing\nhalt\n";
    let object = basm_asm::assembler::assemble(src).expect("a branch to an as-yet-undefined label still assembles");

    let err = link::link(vec![object], vec![], link::DEFAULT_ENTRY).unwrap_err();
    assert!(matches!(err, link::Error::Unresolved { .. }));
}

#[test]
fn makelib_bundle_round_trips_through_static_library_bytes() {
    let helper_src = b".text\n.global helper\nhelper:\nhalt\n";
    let object = basm_asm::assembler::assemble(helper_src).unwrap();

    let library = StaticLibrary { members: vec![object] };
    let bytes = library.to_bytes();
    let restored = StaticLibrary::from_bytes(&bytes).expect("a library this toolchain wrote should parse back");

    assert_eq!(restored.members.len(), 1);
    assert_eq!(
        restored.members[0].section(SectionKind::Text).unwrap().data,
        library.members[0].section(SectionKind::Text).unwrap().data
    );
}
