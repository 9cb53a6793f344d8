//! The "wazero" host module the generator imports: module-shape queries,
//! VM-context offsets, and the `compile_done` sink.
//!
//! Every function reads the per-compilation state captured in the
//! `FunctionEnv`; being invoked outside a compile pass means the engine's
//! internal state is corrupt, so those paths panic rather than guess.

use crate::generator::{HostState, PendingBody, RelocationEntry, RELOCATION_ENTRY_SIZE};
use crate::module::MEMORY_INSTANCE_BUFFER_OFFSET;
use wasmer::{FunctionEnvMut, MemoryView};

fn read_bytes(view: &MemoryView, what: &str, ptr: u32, len: u32) -> Vec<u8> {
    let mut buf = vec![0u8; len as usize];
    view.read(ptr as u64, &mut buf).unwrap_or_else(|_| {
        panic!(
            "BUG: invalid memory position for {}: (ptr={:#x},size={:#x})",
            what, ptr, len
        )
    });
    buf
}

/// Sink for one compiled body: copies the machine code and relocation
/// records out of generator memory into the pending list.
pub(crate) fn compile_done(
    mut env: FunctionEnvMut<HostState>,
    code_ptr: u32,
    code_size: u32,
    relocs_ptr: u32,
    reloc_count: u32,
) {
    let (state, store) = env.data_and_store_mut();
    let memory = state
        .memory
        .clone()
        .expect("BUG: generator memory not initialized");
    let view = memory.view(&store);

    // The generator's linear memory is reused across functions; the bytes
    // must be copied out before returning.
    let machine_code = read_bytes(&view, "compiled body", code_ptr, code_size);

    let mut relocs = Vec::with_capacity(reloc_count as usize);
    if reloc_count > 0 {
        let raw = read_bytes(&view, "relocs", relocs_ptr, reloc_count * RELOCATION_ENTRY_SIZE);
        for record in raw.chunks_exact(RELOCATION_ENTRY_SIZE as usize) {
            relocs.push(RelocationEntry {
                func_index: u32::from_le_bytes(record[..4].try_into().unwrap()),
                offset: u32::from_le_bytes(record[4..].try_into().unwrap()),
            });
        }
    }

    state.pending.push(PendingBody {
        machine_code,
        relocs,
    });
}

pub(crate) fn func_index(env: FunctionEnvMut<HostState>) -> u32 {
    env.data().task().func_index
}

pub(crate) fn current_func_type_index(env: FunctionEnvMut<HostState>) -> u32 {
    let task = env.data().task();
    task.shape.func_type_index(task.func_index)
}

pub(crate) fn func_type_index(env: FunctionEnvMut<HostState>, func_idx: u32) -> u32 {
    env.data().task().shape.func_type_index(func_idx)
}

pub(crate) fn type_counts(env: FunctionEnvMut<HostState>) -> u32 {
    env.data().task().shape.type_count()
}

pub(crate) fn type_lens(
    mut env: FunctionEnvMut<HostState>,
    type_idx: u32,
    param_len_ptr: u32,
    result_len_ptr: u32,
) {
    let (state, store) = env.data_and_store_mut();
    let (params, results) = state.task().shape.type_at(type_idx);
    let (param_len, result_len) = (params.len() as u32, results.len() as u32);
    let memory = state
        .memory
        .clone()
        .expect("BUG: generator memory not initialized");
    let view = memory.view(&store);
    view.write(param_len_ptr as u64, &param_len.to_le_bytes())
        .expect("BUG: invalid memory position for type_lens params");
    view.write(result_len_ptr as u64, &result_len.to_le_bytes())
        .expect("BUG: invalid memory position for type_lens results");
}

pub(crate) fn type_param_at(env: FunctionEnvMut<HostState>, type_idx: u32, at: u32) -> u32 {
    let task = env.data().task();
    let (params, _) = task.shape.type_at(type_idx);
    params[at as usize].generator_encoding()
}

pub(crate) fn type_result_at(env: FunctionEnvMut<HostState>, type_idx: u32, at: u32) -> u32 {
    let task = env.data().task();
    let (_, results) = task.shape.type_at(type_idx);
    results[at as usize].generator_encoding()
}

pub(crate) fn is_locally_defined_function(env: FunctionEnvMut<HostState>, func_idx: u32) -> u32 {
    (func_idx >= env.data().task().shape.import_func_count()) as u32
}

pub(crate) fn memory_min_max(
    mut env: FunctionEnvMut<HostState>,
    min_ptr: u32,
    max_ptr: u32,
) -> u32 {
    let (state, store) = env.data_and_store_mut();
    let (min, max) = match state.task().shape.memory_min_max() {
        Some(bounds) => bounds,
        None => return 0,
    };
    let memory = state
        .memory
        .clone()
        .expect("BUG: generator memory not initialized");
    let view = memory.view(&store);
    view.write(min_ptr as u64, &min.to_le_bytes())
        .expect("BUG: invalid memory position for memory_min_max min");
    view.write(max_ptr as u64, &max.to_le_bytes())
        .expect("BUG: invalid memory position for memory_min_max max");
    1
}

pub(crate) fn is_memory_imported(env: FunctionEnvMut<HostState>) -> u32 {
    env.data().task().shape.memory_imported() as u32
}

pub(crate) fn memory_instance_base_offset() -> u32 {
    MEMORY_INSTANCE_BUFFER_OFFSET
}

pub(crate) fn vm_context_local_memory_offset(env: FunctionEnvMut<HostState>) -> u32 {
    env.data().task().vm_offsets.local_memory_begin as u32
}

pub(crate) fn vm_context_imported_memory_offset(env: FunctionEnvMut<HostState>) -> u32 {
    env.data().task().vm_offsets.imported_memory_begin as u32
}

pub(crate) fn vm_context_imported_function_offset(
    env: FunctionEnvMut<HostState>,
    index: u32,
) -> u32 {
    env.data().task().vm_offsets.imported_function_offset(index)
}
