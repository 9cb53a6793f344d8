//! Generator substitutes built with `wasm-encoder`, plus body-encoding
//! helpers.
#![allow(dead_code)] // each test binary uses its own subset
//!
//! The real code generator is an opaque Cranelift backend; these stand-ins
//! implement the same export/import contract (`_allocate`, `_deallocate`,
//! `initialize_target`, `compile_function`, and the `wazero.compile_done`
//! sink) so the whole compile pipeline can be driven in tests:
//!
//! - [`identity_generator`] echoes each uploaded body back verbatim as its
//!   "machine code", which makes layout and round-trip properties checkable
//!   byte for byte.
//! - [`framed_generator`] treats each body as
//!   `[reloc_count: u32][relocs: count * 8 bytes][machine code]` (after the
//!   one-byte empty-locals preamble) and reports the embedded relocations
//!   through `compile_done`, so tests control both the emitted code and its
//!   relocation stream.

use wasm_encoder::{
    CodeSection, ConstExpr, EntityType, ExportKind, ExportSection, Function, FunctionSection,
    GlobalSection, GlobalType, ImportSection, Instruction, MemArg, MemorySection, MemoryType,
    Module, TypeSection, ValType,
};

/// The engine encodes a body as the standard code-section preamble followed
/// by the body bytes; with no locals the preamble is a single zero byte.
pub fn encoded_body(local_types: &[craneback::ValType], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    leb128::write::unsigned(&mut out, local_types.len() as u64).unwrap();
    for lt in local_types {
        out.push(1);
        out.push(lt.wasm_byte());
    }
    out.extend_from_slice(body);
    out
}

/// A test body for the framed generator: embedded relocation records
/// followed by the machine code proper.
pub fn framed_body(relocs: &[(u32, u32)], machine_code: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(relocs.len() as u32).to_le_bytes());
    for (func_index, offset) in relocs {
        out.extend_from_slice(&func_index.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
    }
    out.extend_from_slice(machine_code);
    out
}

/// A generator whose `compile_function(offset, size)` reports the uploaded
/// bytes unchanged: `compile_done(offset, size, 0, 0)`.
pub fn identity_generator() -> Vec<u8> {
    generator_module(|compile| {
        compile.instruction(&Instruction::LocalGet(0));
        compile.instruction(&Instruction::LocalGet(1));
        compile.instruction(&Instruction::I32Const(0));
        compile.instruction(&Instruction::I32Const(0));
        compile.instruction(&Instruction::Call(0));
        compile.instruction(&Instruction::End);
    })
}

/// A generator that invokes `compile_done` twice per function, violating the
/// exactly-once contract.
pub fn double_done_generator() -> Vec<u8> {
    generator_module(|compile| {
        for _ in 0..2 {
            compile.instruction(&Instruction::LocalGet(0));
            compile.instruction(&Instruction::LocalGet(1));
            compile.instruction(&Instruction::I32Const(0));
            compile.instruction(&Instruction::I32Const(0));
            compile.instruction(&Instruction::Call(0));
        }
        compile.instruction(&Instruction::End);
    })
}

/// A generator whose `compile_function` traps.
pub fn trapping_generator() -> Vec<u8> {
    generator_module(|compile| {
        compile.instruction(&Instruction::Unreachable);
        compile.instruction(&Instruction::End);
    })
}

/// A generator that decodes the [`framed_body`] framing. Assumes bodies with
/// no locals, so the preamble is exactly one byte:
///
/// ```text
/// memory[offset]      = 0x00 (empty locals preamble)
/// memory[offset + 1]  = reloc_count (u32)
/// memory[offset + 5]  = reloc records, 8 bytes each
/// memory[offset + 5 + 8 * count] = machine code
/// ```
pub fn framed_generator() -> Vec<u8> {
    generator_module_with_locals(vec![(1, ValType::I32)], |compile| {
        let unaligned = MemArg {
            offset: 0,
            align: 0,
            memory_index: 0,
        };
        // local 2 := reloc count
        compile.instruction(&Instruction::LocalGet(0));
        compile.instruction(&Instruction::I32Const(1));
        compile.instruction(&Instruction::I32Add);
        compile.instruction(&Instruction::I32Load(unaligned));
        compile.instruction(&Instruction::LocalSet(2));
        // code_ptr = offset + 5 + count * 8
        compile.instruction(&Instruction::LocalGet(0));
        compile.instruction(&Instruction::I32Const(5));
        compile.instruction(&Instruction::I32Add);
        compile.instruction(&Instruction::LocalGet(2));
        compile.instruction(&Instruction::I32Const(3));
        compile.instruction(&Instruction::I32Shl);
        compile.instruction(&Instruction::I32Add);
        // code_size = size - 5 - count * 8
        compile.instruction(&Instruction::LocalGet(1));
        compile.instruction(&Instruction::I32Const(5));
        compile.instruction(&Instruction::I32Sub);
        compile.instruction(&Instruction::LocalGet(2));
        compile.instruction(&Instruction::I32Const(3));
        compile.instruction(&Instruction::I32Shl);
        compile.instruction(&Instruction::I32Sub);
        // relocs_ptr = offset + 5
        compile.instruction(&Instruction::LocalGet(0));
        compile.instruction(&Instruction::I32Const(5));
        compile.instruction(&Instruction::I32Add);
        // reloc_count
        compile.instruction(&Instruction::LocalGet(2));
        compile.instruction(&Instruction::Call(0));
        compile.instruction(&Instruction::End);
    })
}

fn generator_module(build_compile: impl FnOnce(&mut Function)) -> Vec<u8> {
    generator_module_with_locals(Vec::new(), build_compile)
}

fn generator_module_with_locals(
    compile_locals: Vec<(u32, ValType)>,
    build_compile: impl FnOnce(&mut Function),
) -> Vec<u8> {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types.ty().function(vec![ValType::I32; 4], vec![]); // 0: compile_done
    types.ty().function(vec![ValType::I32], vec![ValType::I32]); // 1: _allocate
    types.ty().function(vec![ValType::I32], vec![]); // 2: _deallocate / initialize_target
    types.ty().function(vec![ValType::I32; 2], vec![]); // 3: compile_function
    module.section(&types);

    let mut imports = ImportSection::new();
    imports.import("wazero", "compile_done", EntityType::Function(0));
    module.section(&imports);

    let mut functions = FunctionSection::new();
    functions.function(1); // _allocate
    functions.function(2); // _deallocate
    functions.function(2); // initialize_target
    functions.function(3); // compile_function
    module.section(&functions);

    let mut memories = MemorySection::new();
    memories.memory(MemoryType {
        minimum: 4,
        maximum: Some(16),
        memory64: false,
        shared: false,
        page_size_log2: None,
    });
    module.section(&memories);

    // bump-allocator watermark; uploads start past the reloc scratch area
    let mut globals = GlobalSection::new();
    globals.global(
        GlobalType {
            val_type: ValType::I32,
            mutable: true,
            shared: false,
        },
        &ConstExpr::i32_const(1024),
    );
    module.section(&globals);

    let mut exports = ExportSection::new();
    exports.export("memory", ExportKind::Memory, 0);
    exports.export("_allocate", ExportKind::Func, 1);
    exports.export("_deallocate", ExportKind::Func, 2);
    exports.export("initialize_target", ExportKind::Func, 3);
    exports.export("compile_function", ExportKind::Func, 4);
    module.section(&exports);

    let mut code = CodeSection::new();

    // _allocate: bump; returns the previous watermark
    let mut allocate = Function::new(Vec::new());
    allocate.instruction(&Instruction::GlobalGet(0));
    allocate.instruction(&Instruction::GlobalGet(0));
    allocate.instruction(&Instruction::LocalGet(0));
    allocate.instruction(&Instruction::I32Add);
    allocate.instruction(&Instruction::GlobalSet(0));
    allocate.instruction(&Instruction::End);
    code.function(&allocate);

    // _deallocate: no-op
    let mut deallocate = Function::new(Vec::new());
    deallocate.instruction(&Instruction::End);
    code.function(&deallocate);

    // initialize_target: no-op
    let mut initialize_target = Function::new(Vec::new());
    initialize_target.instruction(&Instruction::End);
    code.function(&initialize_target);

    let mut compile = Function::new(compile_locals);
    build_compile(&mut compile);
    code.function(&compile);

    module.section(&code);
    module.finish()
}
