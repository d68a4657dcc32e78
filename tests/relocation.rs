//! Relocation, placement and symbol strength tests.

mod common;

use common::{
    call_target, linker, linker_with, test_config, Event, FakeHost, ObjectBuilder, RecordingInvoker, SimulatedMemory,
    Trace, SIM_BASE,
};
use object::write::StandardSection;
use rtld::arch::x86_64::X86_64;
use rtld::config::LinkerConfig;
use rtld::memory::MemoryAccess;
use rtld::symbol::{Strength, SymbolKind};
use rtld::{FatalError, Identity, LinkError, Linker};

const RET: [u8; 1] = [0xc3];
const FAR: u64 = 0x7f00_0000_0000;

fn read_u64(linker: &Linker<X86_64>, address: u64) -> u64 {
    let bytes = linker.read_bytes(address, 8).unwrap();
    u64::from_le_bytes(bytes.try_into().unwrap())
}

/// Target of the rel32 field at `field`, relative to the end of the instruction.
fn rel32_target(linker: &Linker<X86_64>, field: u64, insn_end: u64) -> u64 {
    let bytes = linker.read_bytes(field, 4).unwrap();
    let disp = i32::from_le_bytes(bytes.try_into().unwrap());
    (insn_end as i64 + disp as i64) as u64
}

#[test]
fn far_code_is_reached_through_a_shared_island() {
    let trace = Trace::default();
    let host = FakeHost::new(trace.clone()).global("far_fn", FAR);
    let linker = linker_with(&trace, host);

    let mut obj = ObjectBuilder::new();
    obj.caller("first", "far_fn");
    obj.caller("second", "far_fn");
    let id = linker.load(Identity::file("far.o"), &obj.build()).unwrap();
    linker.resolve(id).unwrap();

    let first = call_target(&linker, linker.lookup_symbol("first").unwrap());
    let second = call_target(&linker, linker.lookup_symbol("second").unwrap());
    assert_ne!(first, FAR);
    assert_eq!(first, second, "one island per target");

    // The island's cell sits just before its entry point.
    assert_eq!(read_u64(&linker, first - 8), FAR);
    assert_eq!(linker.read_bytes(first, 2).unwrap(), vec![0xff, 0x25]);
    let info = linker.resolve_symbol_addr(first).unwrap();
    assert_eq!(info.module, id);
}

#[test]
fn far_data_reference_is_fatal() {
    let trace = Trace::default();
    let host = FakeHost::new(trace.clone()).global("far_var", FAR);
    let linker = linker_with(&trace, host);

    let mut obj = ObjectBuilder::new();
    obj.reader("peek", "far_var");
    let id = linker.load(Identity::file("peek.o"), &obj.build()).unwrap();

    match linker.resolve(id) {
        Err(LinkError::Fatal(FatalError::RelocationOverflow { module, target, .. })) => {
            assert_eq!(module, "peek.o");
            assert_eq!(target, FAR);
        }
        other => panic!("expected a relocation overflow, got {other:?}"),
    }
    assert_eq!(linker.module_status(id), None);
    assert_eq!(trace.live_regions(), 0);
}

#[test]
fn got_loads_go_through_a_pointer_cell() {
    let trace = Trace::default();
    let host = FakeHost::new(trace.clone()).global("far_var", FAR);
    let linker = linker_with(&trace, host);

    let mut obj = ObjectBuilder::new();
    obj.data("near_var", &[1, 2, 3, 4]);
    obj.got_load("load_far", "far_var");
    obj.got_load("load_near", "near_var");
    let id = linker.load(Identity::file("got.o"), &obj.build()).unwrap();
    linker.resolve(id).unwrap();

    for (function, expected) in [("load_far", FAR), ("load_near", linker.lookup_symbol("near_var").unwrap())] {
        let start = linker.lookup_symbol(function).unwrap();
        let cell = rel32_target(&linker, start + 3, start + 7);
        assert_eq!(read_u64(&linker, cell), expected, "{function}");
    }
}

#[test]
fn tls_general_dynamic_points_at_a_host_pair() {
    let trace = Trace::default();
    let host = FakeHost::new(trace.clone()).thread_local("host_slot", 2, 0x18);
    let linker = linker_with(&trace, host);

    let mut obj = ObjectBuilder::new();
    obj.tls_address("addr_of_slot", "host_slot");
    let id = linker.load(Identity::file("tls.o"), &obj.build()).unwrap();
    linker.resolve(id).unwrap();

    let start = linker.lookup_symbol("addr_of_slot").unwrap();
    let pair = rel32_target(&linker, start + 4, start + 8);
    assert_eq!(read_u64(&linker, pair), 2, "tls module id");
    assert_eq!(read_u64(&linker, pair + 8), 0x18, "offset in the host block");
}

#[test]
fn self_loaded_tls_reference_is_recoverable() {
    let trace = Trace::default();
    let linker = linker(&trace);

    let mut obj = ObjectBuilder::new();
    obj.tls("slot_a", &[0; 8]);
    obj.tls("slot_b", &[0; 8]);
    obj.tls_address("addr_of_b", "slot_b");
    let id = linker.load(Identity::file("tls.o"), &obj.build()).unwrap();

    let err = linker.resolve(id).unwrap_err();
    assert!(!err.is_fatal());
    assert!(
        matches!(err, LinkError::UnsupportedTls { ref symbol, .. } if symbol == "slot_b"),
        "got {err}"
    );
    assert_eq!(linker.module_status(id), None);
    assert_eq!(trace.live_regions(), 0);
}

#[test]
fn unknown_host_tls_reference_is_unresolved() {
    let trace = Trace::default();
    let linker = linker(&trace);

    let mut obj = ObjectBuilder::new();
    obj.tls_address("addr_of_nowhere", "nowhere");
    let id = linker.load(Identity::file("tls.o"), &obj.build()).unwrap();

    let err = linker.resolve(id).unwrap_err();
    assert!(matches!(err, LinkError::Unresolved { .. }), "got {err}");
}

#[test]
fn unused_island_pool_is_sealed_off() {
    let trace = Trace::default();
    let linker = linker(&trace);

    let mut obj = ObjectBuilder::new();
    obj.function("local", &RET);
    obj.caller("near_call", "local");
    let id = linker.load(Identity::file("near.o"), &obj.build()).unwrap();
    linker.resolve(id).unwrap();

    let sealed = trace
        .events()
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                Event::Protect {
                    access: MemoryAccess::NoAccess,
                    ..
                }
            )
        })
        .count();
    assert_eq!(sealed, 1, "only the island pool loses all access");
    let site = linker.lookup_symbol("near_call").unwrap();
    assert_eq!(call_target(&linker, site), linker.lookup_symbol("local").unwrap());
}

#[test]
fn unsupported_relocation_abandons_the_module() {
    let trace = Trace::default();
    let linker = linker(&trace);

    let mut obj = ObjectBuilder::new();
    obj.function("target", &RET);
    let data = obj.section(StandardSection::Data);
    obj.data("table", &[0; 8]);
    let symbol = obj.symbol("target");
    obj.elf_relocation(data, 0, symbol, 0, object::elf::R_X86_64_GOTOFF64);
    let id = linker.load(Identity::file("odd.o"), &obj.build()).unwrap();

    let err = linker.resolve(id).unwrap_err();
    assert!(!err.is_fatal());
    assert!(
        matches!(err, LinkError::UnsupportedRelocation { raw, .. } if raw == object::elf::R_X86_64_GOTOFF64),
        "got {err}"
    );
    assert_eq!(linker.module_status(id), None);
}

#[test]
fn code_is_patched_before_it_becomes_executable() {
    let trace = Trace::default();
    let host = FakeHost::new(trace.clone()).global("far_fn", FAR);
    let linker = linker_with(&trace, host);

    let mut obj = ObjectBuilder::new();
    obj.function("local", &RET);
    obj.caller("near_call", "local");
    obj.caller("far_call", "far_fn");
    let id = linker.load(Identity::file("prot.o"), &obj.build()).unwrap();
    assert!(
        !trace.events().iter().any(|e| matches!(e, Event::Protect { .. })),
        "nothing is sealed before resolution"
    );
    linker.resolve(id).unwrap();

    let site = linker.lookup_symbol("near_call").unwrap();
    let island = call_target(&linker, linker.lookup_symbol("far_call").unwrap());
    let executable: Vec<(u64, Vec<u8>)> = trace
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Protect {
                base,
                access: MemoryAccess::ReadExecute,
                bytes,
            } => Some((base, bytes)),
            _ => None,
        })
        .collect();

    // The snapshot taken when the text went read-execute already holds the patch.
    let (base, bytes) = executable
        .iter()
        .find(|(base, bytes)| (*base..*base + bytes.len() as u64).contains(&site))
        .expect("text was made executable");
    let at = (site - base) as usize;
    let live = linker.read_bytes(site, 5).unwrap();
    assert_eq!(&bytes[at..at + 5], &live[..]);
    assert_ne!(&bytes[at + 1..at + 5], &[0, 0, 0, 0]);

    // Same for the island pool.
    let (base, bytes) = executable
        .iter()
        .find(|(base, bytes)| (*base..*base + bytes.len() as u64).contains(&island))
        .expect("islands were made executable");
    let cell = (island - 8 - base) as usize;
    assert_eq!(&bytes[cell..cell + 8], &FAR.to_le_bytes());

    // No segment went back to writable afterwards.
    assert!(!trace.events().iter().any(|e| matches!(
        e,
        Event::Protect {
            access: MemoryAccess::ReadWrite,
            ..
        }
    )));
}

fn placement_linker(trace: &Trace, config: LinkerConfig, memory: SimulatedMemory) -> Linker<X86_64> {
    Linker::builder(X86_64)
        .config(config)
        .provider(memory)
        .host_loader(FakeHost::new(trace.clone()))
        .invoker(RecordingInvoker(trace.clone()))
        .build()
}

#[test]
fn near_placement_starts_at_the_anchor() {
    let trace = Trace::default();
    let config = LinkerConfig {
        load_base: Some(0x5000_0000),
        near_placement: Some(0x1000_0000),
        ..test_config()
    };
    let linker = placement_linker(&trace, config, SimulatedMemory::new(SIM_BASE, trace.clone()));

    let mut obj = ObjectBuilder::new();
    obj.function("calc", &RET);
    linker.load(Identity::file("a.o"), &obj.build()).unwrap();

    let events = trace.events();
    assert!(matches!(events.first(), Some(Event::Reserve { base: 0x5000_0000, .. })));
    let calc = linker.lookup_symbol("calc").unwrap();
    assert!(calc.abs_diff(0x5000_0000) <= 0x1000_0000);
}

#[test]
fn unreachable_placement_is_fatal() {
    let trace = Trace::default();
    let config = LinkerConfig {
        load_base: Some(0x7000_0000_0000),
        near_placement: Some(0x100_0000),
        ..test_config()
    };
    let memory = SimulatedMemory::new(SIM_BASE, trace.clone()).ignoring_hints();
    let linker = placement_linker(&trace, config, memory);

    let mut obj = ObjectBuilder::new();
    obj.function("calc", &RET);
    let err = linker.load(Identity::file("a.o"), &obj.build()).unwrap_err();
    assert!(
        matches!(err, LinkError::Fatal(FatalError::Placement { anchor: 0x7000_0000_0000, .. })),
        "got {err}"
    );
    // Every out-of-reach region was handed back.
    assert!(trace.events().iter().any(|e| matches!(e, Event::Reserve { .. })));
    assert_eq!(trace.live_regions(), 0);
    assert!(linker.modules().is_empty());
}

#[test]
fn stronger_definition_wins() {
    let trace = Trace::default();
    let linker = linker(&trace);

    let mut weak = ObjectBuilder::new();
    weak.weak_function("hook", &RET);
    linker.load(Identity::file("weak.o"), &weak.build()).unwrap();

    let mut normal = ObjectBuilder::new();
    normal.function("padding", &[0x90; 32]);
    normal.function("hook", &RET);
    linker.load(Identity::file("normal.o"), &normal.build()).unwrap();

    let mut user = ObjectBuilder::new();
    user.caller("use_hook", "hook");
    linker.load(Identity::file("user.o"), &user.build()).unwrap();
    linker.resolve_all().unwrap();

    let hook = linker.lookup_symbol("hook").unwrap();
    assert_eq!(linker.resolve_symbol_addr(hook).unwrap().name, "normal.o");
    assert_eq!(call_target(&linker, linker.lookup_symbol("use_hook").unwrap()), hook);
}

#[test]
fn duplicate_normal_definition_is_recoverable() {
    let trace = Trace::default();
    let linker = linker(&trace);

    let mut a = ObjectBuilder::new();
    a.function("dup", &RET);
    linker.load(Identity::file("a.o"), &a.build()).unwrap();
    let kept = linker.lookup_symbol("dup").unwrap();

    let mut b = ObjectBuilder::new();
    b.function("other", &RET);
    b.function("dup", &RET);
    let err = linker.load(Identity::file("b.o"), &b.build()).unwrap_err();
    match &err {
        LinkError::DuplicateDefinition {
            symbol,
            existing_owner,
            new_owner,
        } => {
            assert_eq!(symbol, "dup");
            assert_eq!(existing_owner, "a.o");
            assert_eq!(new_owner, "b.o");
        }
        other => panic!("expected a duplicate definition, got {other}"),
    }
    assert!(!err.is_fatal());
    assert!(!linker.is_already_loaded(&Identity::file("b.o")));
    assert_eq!(linker.lookup_symbol("dup"), Some(kept));
    assert_eq!(linker.lookup_symbol("other"), None, "abandoned load left no bindings");
}

#[test]
fn abandoned_load_restores_the_binding_it_replaced() {
    let trace = Trace::default();
    let linker = linker(&trace);

    let mut a = ObjectBuilder::new();
    a.weak_function("hook", &RET);
    a.function("shared", &RET);
    let a = linker.load(Identity::file("a.o"), &a.build()).unwrap();
    linker.resolve(a).unwrap();
    let weak_hook = linker.lookup_symbol("hook").unwrap();

    // c.o wins `hook`, then fails on `shared`.
    let mut c = ObjectBuilder::new();
    c.function("hook", &RET);
    c.function("shared", &RET);
    let err = linker.load(Identity::file("c.o"), &c.build()).unwrap_err();
    assert!(matches!(err, LinkError::DuplicateDefinition { ref symbol, .. } if symbol == "shared"), "got {err}");

    assert_eq!(linker.lookup_symbol("hook"), Some(weak_hook));
    assert_eq!(linker.module_status(a), Some(rtld::module::ModuleStatus::Resolved));
    assert_eq!(linker.resolve_symbol_addr(weak_hook).unwrap().name, "a.o");
}

#[test]
fn strong_definitions_override_and_conflict() {
    let trace = Trace::default();
    let linker = linker(&trace);

    linker
        .define_host_symbol("calc", 0x1234, SymbolKind::Code, Strength::Normal)
        .unwrap();
    let mut a = ObjectBuilder::new();
    a.function("calc", &RET);
    linker.load(Identity::file("a.o"), &a.build()).unwrap();
    let strong = linker.lookup_symbol("calc").unwrap();
    assert_ne!(strong, 0x1234, "strong module definition replaced the host's");

    // The same strong value again is accepted.
    linker
        .define_host_symbol("calc", strong, SymbolKind::Code, Strength::Strong)
        .unwrap();

    let mut b = ObjectBuilder::new();
    b.function("pad", &[0x90; 16]);
    b.function("calc", &RET);
    let err = linker.load(Identity::file("b.o"), &b.build()).unwrap_err();
    assert!(
        matches!(err, LinkError::Fatal(FatalError::DuplicateStrong { ref symbol, existing, .. })
            if symbol == "calc" && existing == strong),
        "got {err}"
    );
    assert_eq!(linker.lookup_symbol("calc"), Some(strong));
}
