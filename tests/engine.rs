//! End-to-end compile/instantiate scenarios against generator substitutes.

mod common;

use byteorder::{ByteOrder, LittleEndian};
use common::{encoded_body, framed_body, framed_generator, identity_generator};
use craneback::module::mock::{MockModuleBuilder, MockModuleInstance};
use craneback::module::ModuleInstanceHandle;
use craneback::vmcontext::ABSENT;
use craneback::{Engine, Error, InstanceId, ModuleId, TargetKind, ValType};

fn new_engine(generator: &[u8]) -> std::sync::Arc<Engine> {
    let _ = env_logger::builder().is_test(true).try_init();
    Engine::new(generator, TargetKind::host()).expect("engine construction succeeds")
}

#[test]
fn round_trip_offsets() {
    let engine = new_engine(&identity_generator());
    let module = MockModuleBuilder::new(ModuleId(1))
        .with_type(&[], &[])
        .with_code(0, &[], &[0x01, 0x02, 0x03])
        .with_code(0, &[ValType::I64], &[0xAA, 0xBB])
        .build();
    engine.compile_module(&module).expect("compile succeeds");

    let compiled = engine.compiled_module(ModuleId(1)).expect("published");
    let first = encoded_body(&[], &[0x01, 0x02, 0x03]);
    let second = encoded_body(&[ValType::I64], &[0xAA, 0xBB]);

    assert_eq!(compiled.executable_offsets(), &[0, first.len()]);
    let mut expected = first.clone();
    expected.extend_from_slice(&second);
    assert_eq!(compiled.executable_bytes(), &expected[..]);
}

#[test]
fn layout_without_memory_is_empty() {
    // (func (param i32) (result i32)) and no memory: the whole VM context
    // is the (empty) imported-function array.
    let engine = new_engine(&identity_generator());
    let module = MockModuleBuilder::new(ModuleId(2))
        .with_type(&[ValType::I32], &[ValType::I32])
        .with_code(0, &[], &[0x0B])
        .build();
    engine.compile_module(&module).expect("compile succeeds");

    let layout = engine
        .compiled_module(ModuleId(2))
        .unwrap()
        .vm_context_layout();
    assert_eq!(layout.imported_functions_begin, 0);
    assert_eq!(layout.total_size, 0);
    assert_eq!(layout.local_memory_begin, ABSENT);
    assert_eq!(layout.imported_memory_begin, ABSENT);
}

#[test]
fn vm_context_records_local_memory() {
    let engine = new_engine(&identity_generator());
    let module = MockModuleBuilder::new(ModuleId(3))
        .with_type(&[], &[ValType::I32])
        .with_local_memory(1, 4)
        .with_code(0, &[], &[0x0B])
        .build();
    engine.compile_module(&module).expect("compile succeeds");

    let layout = engine
        .compiled_module(ModuleId(3))
        .unwrap()
        .vm_context_layout();
    assert_eq!(layout.local_memory_begin, 0);
    assert_eq!(layout.total_size, 16);

    let mut contents = vec![0u8; 64];
    contents[0] = 0x42;
    let instance = MockModuleInstance::new(InstanceId(30), "mem").with_memory(contents);
    let memory_base = instance.memory_instance_buffer().as_ptr() as u64;
    let memory_len = instance.memory_instance_buffer().len() as u64;

    let module_engine = engine
        .new_module_engine("mem", &module, &instance)
        .expect("instantiation succeeds");

    let opaque = module_engine.vm_context().opaque_bytes();
    assert_eq!(opaque.len(), 16);
    assert_eq!(LittleEndian::read_u64(&opaque[0..8]), memory_base);
    assert_eq!(LittleEndian::read_u64(&opaque[8..16]), memory_len);

    // pinning: the address generated code sees never changes
    let ptr = module_engine.vm_context().opaque_ptr();
    assert_eq!(ptr as *const u8, opaque.as_ptr());
    assert_eq!(module_engine.vm_context().opaque_ptr(), ptr);
}

#[test]
fn import_slots_hold_foreign_entry_and_context() {
    let engine = new_engine(&identity_generator());

    // module A: one local memory (so its VM context is non-empty) and one
    // local function
    let module_a = MockModuleBuilder::new(ModuleId(40))
        .with_type(&[ValType::I32], &[ValType::I32])
        .with_local_memory(1, 1)
        .with_code(0, &[], &[0xC3])
        .build();
    engine.compile_module(&module_a).expect("compile A");
    let instance_a = MockModuleInstance::new(InstanceId(41), "a").with_memory(vec![0u8; 16]);
    let engine_a = engine
        .new_module_engine("a", &module_a, &instance_a)
        .expect("instantiate A");

    // module B imports A's function
    let module_b = MockModuleBuilder::new(ModuleId(42))
        .with_type(&[ValType::I32], &[ValType::I32])
        .with_imported_func(0)
        .with_code(0, &[], &[0x0B])
        .build();
    engine.compile_module(&module_b).expect("compile B");
    let instance_b = MockModuleInstance::new(InstanceId(43), "b")
        .with_imported_func(InstanceId(41), 0);
    let engine_b = engine
        .new_module_engine("b", &module_b, &instance_b)
        .expect("instantiate B");

    let compiled_a = engine.compiled_module(ModuleId(40)).unwrap();
    let a_entry = compiled_a.executable_bytes().as_ptr() as u64;
    let a_vmctx = engine_a.vm_context().opaque_ptr() as u64;

    let layout_b = engine.compiled_module(ModuleId(42)).unwrap().vm_context_layout();
    assert_eq!(layout_b.total_size, 16);
    let opaque_b = engine_b.vm_context().opaque_bytes();
    let begin = layout_b.imported_functions_begin as usize;
    assert_eq!(LittleEndian::read_u64(&opaque_b[begin..begin + 8]), a_entry);
    assert_eq!(
        LittleEndian::read_u64(&opaque_b[begin + 8..begin + 16]),
        a_vmctx
    );
}

#[test]
fn instantiating_an_uncompiled_module_fails() {
    let engine = new_engine(&identity_generator());
    let module = MockModuleBuilder::new(ModuleId(5))
        .with_type(&[], &[])
        .with_code(0, &[], &[0x0B])
        .build();
    let instance = MockModuleInstance::new(InstanceId(50), "orphan");

    let err = engine
        .new_module_engine("orphan", &module, &instance)
        .unwrap_err();
    match err {
        Error::NotCompiled(name) => assert_eq!(name, "orphan"),
        other => panic!("unexpected error: {}", other),
    }

    // and nothing was registered: a later import against it still fails
    let importer = MockModuleBuilder::new(ModuleId(51))
        .with_type(&[], &[])
        .with_imported_func(0)
        .build();
    engine.compile_module(&importer).expect("compile importer");
    let importer_instance = MockModuleInstance::new(InstanceId(52), "importer")
        .with_imported_func(InstanceId(50), 0);
    let err = engine
        .new_module_engine("importer", &importer, &importer_instance)
        .unwrap_err();
    assert!(matches!(err, Error::ImportResolution(_)));
}

#[test]
fn registry_count_and_delete() {
    let engine = new_engine(&identity_generator());
    assert_eq!(engine.compiled_module_count(), 0);

    let module = MockModuleBuilder::new(ModuleId(6))
        .with_type(&[], &[])
        .with_code(0, &[], &[0x0B])
        .build();
    engine.compile_module(&module).expect("compile succeeds");
    assert_eq!(engine.compiled_module_count(), 1);

    engine.delete_compiled_module(&module);
    assert_eq!(engine.compiled_module_count(), 0);
    assert!(engine.compiled_module(ModuleId(6)).is_none());
}

#[test]
fn zero_function_module_compiles_to_an_empty_executable() {
    let engine = new_engine(&identity_generator());
    let module = MockModuleBuilder::new(ModuleId(7)).build();
    engine.compile_module(&module).expect("compile succeeds");

    let compiled = engine.compiled_module(ModuleId(7)).expect("published");
    assert!(compiled.executable_bytes().is_empty());
    assert!(compiled.executable_offsets().is_empty());
}

#[test]
fn imports_only_module_has_no_code_but_a_layout() {
    let engine = new_engine(&identity_generator());
    let module = MockModuleBuilder::new(ModuleId(8))
        .with_type(&[ValType::I32], &[])
        .with_imported_func(0)
        .with_imported_func(0)
        .build();
    engine.compile_module(&module).expect("compile succeeds");

    let compiled = engine.compiled_module(ModuleId(8)).expect("published");
    assert!(compiled.executable_bytes().is_empty());
    let layout = compiled.vm_context_layout();
    assert_eq!(layout.imported_functions_begin, 0);
    assert_eq!(layout.total_size, 32);
}

#[test]
fn large_offset_tables_stay_in_function_order() {
    let engine = new_engine(&identity_generator());
    let mut builder = MockModuleBuilder::new(ModuleId(9)).with_type(&[], &[]);
    for i in 0..300u32 {
        builder = builder.with_code(0, &[], &[i as u8]);
    }
    let module = builder.build();
    engine.compile_module(&module).expect("compile succeeds");

    let compiled = engine.compiled_module(ModuleId(9)).expect("published");
    assert_eq!(compiled.executable_offsets().len(), 300);
    // each encoded body is [0x00 preamble, byte]
    for (i, offset) in compiled.executable_offsets().iter().enumerate() {
        assert_eq!(*offset, i * 2);
        assert_eq!(compiled.executable_bytes()[offset + 1], i as u8);
    }
}

#[test]
fn host_modules_are_rejected() {
    let engine = new_engine(&identity_generator());
    let module = MockModuleBuilder::new(ModuleId(10))
        .with_host_module(true)
        .build();
    let err = engine.compile_module(&module).unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
}

#[test]
fn generator_trap_surfaces_and_rolls_back() {
    let engine = new_engine(&common::trapping_generator());
    let module = MockModuleBuilder::new(ModuleId(11))
        .with_type(&[], &[])
        .with_code(0, &[], &[0x0B])
        .build();
    let err = engine.compile_module(&module).unwrap_err();
    match err {
        Error::Generator(msg) => assert!(msg.contains("compile_function")),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(engine.compiled_module_count(), 0);
    assert!(engine.compiled_module(ModuleId(11)).is_none());
}

#[test]
fn compile_done_must_run_exactly_once() {
    let engine = new_engine(&common::double_done_generator());
    let module = MockModuleBuilder::new(ModuleId(12))
        .with_type(&[], &[])
        .with_code(0, &[], &[0x0B])
        .build();
    let err = engine.compile_module(&module).unwrap_err();
    match err {
        Error::Generator(msg) => assert!(msg.contains("2 times")),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(engine.compiled_module_count(), 0);
}

#[test]
fn relocations_resolve_against_the_final_layout() {
    // three functions: f0 calls f2, f2 calls f1; the framed generator feeds
    // the embedded relocation records through compile_done. The bodies are
    // shaped for the host's call encoding: x86-64 `call rel32; ret` with the
    // slot one byte in, aarch64 a `bl` placeholder word followed by `ret`.
    #[cfg(target_arch = "x86_64")]
    let (call_body, slot_offset): (&[u8], u32) = (&[0xE8, 0, 0, 0, 0, 0xC3], 1);
    #[cfg(target_arch = "aarch64")]
    let (call_body, slot_offset): (&[u8], u32) = (&[0, 0, 0, 0, 0xC0, 0x03, 0x5F, 0xD6], 0);

    let engine = new_engine(&framed_generator());

    let leaf = vec![0u8; call_body.len()];
    let body0 = framed_body(&[(2, slot_offset)], call_body);
    let body1 = framed_body(&[], &leaf);
    let body2 = framed_body(&[(1, slot_offset)], call_body);
    let module = MockModuleBuilder::new(ModuleId(13))
        .with_type(&[], &[ValType::I32])
        .with_code(0, &[], &body0)
        .with_code(0, &[], &body1)
        .with_code(0, &[], &body2)
        .build();
    engine.compile_module(&module).expect("compile succeeds");

    let compiled = engine.compiled_module(ModuleId(13)).expect("published");
    let code = compiled.executable_bytes();
    let offsets = compiled.executable_offsets();
    assert_eq!(offsets, &[0, call_body.len(), 2 * call_body.len()]);
    let base = code.as_ptr() as u64;

    for (caller, callee) in [(0usize, 2usize), (2, 1)] {
        let slot = offsets[caller] + slot_offset as usize;
        let site = base + slot as u64;
        let target = base + offsets[callee] as u64;
        #[cfg(target_arch = "x86_64")]
        {
            let disp = LittleEndian::read_i32(&code[slot..slot + 4]);
            assert_eq!(site.wrapping_add(4).wrapping_add(disp as u64), target);
        }
        #[cfg(target_arch = "aarch64")]
        {
            let insn = LittleEndian::read_u32(&code[slot..slot + 4]);
            assert_eq!(insn & 0xFC00_0000, 0x9400_0000);
            let disp = ((((insn & 0x03FF_FFFF) << 6) as i32) >> 6) as i64 * 4;
            assert_eq!(site.wrapping_add(disp as u64), target);
        }
    }
}

#[test]
fn imported_callee_relocations_fail_the_compile() {
    let engine = new_engine(&framed_generator());
    let body = framed_body(&[(0, 1)], &[0xE8, 0, 0, 0, 0, 0xC3]);
    let module = MockModuleBuilder::new(ModuleId(14))
        .with_type(&[], &[])
        .with_imported_func(0)
        .with_code(0, &[], &body)
        .build();
    let err = engine.compile_module(&module).unwrap_err();
    assert!(err.to_string().contains("generator bug"));
    assert_eq!(engine.compiled_module_count(), 0);
}

#[test]
fn remove_instance_clears_the_registry_entry() {
    let engine = new_engine(&identity_generator());
    let module = MockModuleBuilder::new(ModuleId(15))
        .with_type(&[], &[])
        .with_code(0, &[], &[0x0B])
        .build();
    engine.compile_module(&module).expect("compile succeeds");

    let instance = MockModuleInstance::new(InstanceId(150), "gone");
    engine
        .new_module_engine("gone", &module, &instance)
        .expect("instantiation succeeds");
    engine.remove_instance(InstanceId(150));

    // importing from the removed instance now fails resolution
    let importer = MockModuleBuilder::new(ModuleId(16))
        .with_type(&[], &[])
        .with_imported_func(0)
        .build();
    engine.compile_module(&importer).expect("compile importer");
    let importer_instance = MockModuleInstance::new(InstanceId(151), "importer")
        .with_imported_func(InstanceId(150), 0);
    let err = engine
        .new_module_engine("importer", &importer, &importer_instance)
        .unwrap_err();
    assert!(matches!(err, Error::ImportResolution(_)));
}
