//! The generator host: a nested Wasm runtime that sandboxes the Cranelift
//! code generator.
//!
//! The generator is an opaque Wasm module. It exports `_allocate`,
//! `_deallocate`, `compile_function` and `initialize_target`, and imports a
//! minimal WASI shim plus the query surface in [`queries`]. Per-compilation
//! state (the module shape, the current function index, the VM-context
//! layout) lives in the `wasmer::FunctionEnv` host state that all import
//! closures capture, so a query can only ever observe the compilation that
//! set it.

pub(crate) mod queries;

use crate::error::Error;
use crate::module::{ModuleHandle, ValType};
use crate::vmcontext::VmContextLayout;
use log::debug;
use std::sync::Arc;
use wasmer::{
    imports, Function, FunctionEnv, FunctionEnvMut, Instance, Memory, Module, RuntimeError, Store,
    Value,
};

/// Size of one relocation record in generator memory, fixed with the
/// generator: `{ u32 callee_func_index; u32 offset_in_body }`, tightly
/// packed.
pub(crate) const RELOCATION_ENTRY_SIZE: u32 = 8;

/// The target triple selector passed to the generator's
/// `initialize_target`. The encoding is stable with the generator's target
/// table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    DarwinAarch64,
    LinuxAarch64,
    DarwinX86_64,
    LinuxX86_64,
}

impl TargetKind {
    pub fn encoding(self) -> u32 {
        match self {
            TargetKind::DarwinAarch64 => 0,
            TargetKind::LinuxAarch64 => 1,
            TargetKind::DarwinX86_64 => 2,
            TargetKind::LinuxX86_64 => 3,
        }
    }

    /// The kind matching the machine the engine runs on.
    pub fn host() -> TargetKind {
        match (std::env::consts::OS, std::env::consts::ARCH) {
            ("macos", "aarch64") => TargetKind::DarwinAarch64,
            ("linux", "aarch64") => TargetKind::LinuxAarch64,
            ("macos", "x86_64") => TargetKind::DarwinX86_64,
            ("linux", "x86_64") => TargetKind::LinuxX86_64,
            (os, arch) => panic!("BUG: unsupported runtime target {}/{}", os, arch),
        }
    }
}

/// The generator's view of a module: an owned snapshot of the shape queries,
/// captured once per compile pass so host imports never borrow the caller's
/// handle.
#[derive(Debug)]
pub(crate) struct ModuleShape {
    types: Vec<(Vec<ValType>, Vec<ValType>)>,
    func_type_indices: Vec<u32>,
    import_func_count: u32,
    memory_min_max: Option<(u32, u32)>,
    memory_imported: bool,
}

impl ModuleShape {
    pub fn capture(m: &dyn ModuleHandle) -> ModuleShape {
        let types = (0..m.type_count())
            .map(|i| {
                let (params, results) = m.type_at(i);
                (params.to_vec(), results.to_vec())
            })
            .collect();
        let func_count = m.import_func_count() + m.code_count();
        let func_type_indices = (0..func_count).map(|i| m.func_type_index(i)).collect();
        ModuleShape {
            types,
            func_type_indices,
            import_func_count: m.import_func_count(),
            memory_min_max: m.memory_min_max(),
            memory_imported: m.imported_memories_count() > 0,
        }
    }

    pub fn type_count(&self) -> u32 {
        self.types.len() as u32
    }

    pub fn type_at(&self, type_idx: u32) -> (&[ValType], &[ValType]) {
        let (params, results) = &self.types[type_idx as usize];
        (params, results)
    }

    pub fn func_type_index(&self, func_idx: u32) -> u32 {
        self.func_type_indices[func_idx as usize]
    }

    pub fn import_func_count(&self) -> u32 {
        self.import_func_count
    }

    pub fn memory_min_max(&self) -> Option<(u32, u32)> {
        self.memory_min_max
    }

    pub fn memory_imported(&self) -> bool {
        self.memory_imported
    }
}

/// State bound to one function's trip through the generator.
#[derive(Debug)]
pub(crate) struct CompileTask {
    pub shape: Arc<ModuleShape>,
    pub func_index: u32,
    pub vm_offsets: VmContextLayout,
}

/// A function body as it comes back from the generator, before layout.
#[derive(Debug)]
pub(crate) struct PendingBody {
    pub machine_code: Vec<u8>,
    pub relocs: Vec<RelocationEntry>,
}

/// Must stay bit-aligned with the generator's relocation record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RelocationEntry {
    pub func_index: u32,
    pub offset: u32,
}

/// Host state shared by every generator import.
#[derive(Default, Debug)]
pub(crate) struct HostState {
    pub memory: Option<Memory>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub task: Option<CompileTask>,
    pub pending: Vec<PendingBody>,
}

impl HostState {
    fn task(&self) -> &CompileTask {
        self.task
            .as_ref()
            .expect("BUG: generator import invoked without a compilation context")
    }
}

#[derive(Debug)]
pub(crate) struct GeneratorHost {
    store: Store,
    env: FunctionEnv<HostState>,
    _instance: Instance,
    allocate: Function,
    deallocate: Function,
    compile_function: Function,
}

impl GeneratorHost {
    /// Instantiate the generator module and select its target.
    pub fn new(generator_wasm: &[u8], target: TargetKind) -> Result<GeneratorHost, Error> {
        let mut store = Store::default();
        let module = Module::new(&store, generator_wasm)
            .map_err(|e| Error::Generator(format!("failed to load generator module: {}", e)))?;
        let env = FunctionEnv::new(&mut store, HostState::default());

        let imports = imports! {
            // The generator is built against WASI; only fd_write does real
            // work (diagnostics), the rest are inert stubs.
            "wasi_snapshot_preview1" => {
                "fd_write" => Function::new_typed_with_env(&mut store, &env, wasi_fd_write),
                "clock_time_get" => Function::new_typed(&mut store, |_: u32, _: u64, _: u32| -> u32 { 0 }),
                "random_get" => Function::new_typed(&mut store, |_: u32, _: u32| -> u32 { 0 }),
                "environ_get" => Function::new_typed(&mut store, |_: u32, _: u32| -> u32 { 0 }),
                "environ_sizes_get" => Function::new_typed(&mut store, |_: u32, _: u32| -> u32 { 0 }),
                "proc_exit" => Function::new_typed(&mut store, |code: u32| -> () {
                    panic!("BUG: generator called proc_exit({})", code)
                }),
            },
            "wazero" => {
                "compile_done" => Function::new_typed_with_env(&mut store, &env, queries::compile_done),
                "func_index" => Function::new_typed_with_env(&mut store, &env, queries::func_index),
                "current_func_type_index" => Function::new_typed_with_env(&mut store, &env, queries::current_func_type_index),
                "func_type_index" => Function::new_typed_with_env(&mut store, &env, queries::func_type_index),
                "type_counts" => Function::new_typed_with_env(&mut store, &env, queries::type_counts),
                "type_lens" => Function::new_typed_with_env(&mut store, &env, queries::type_lens),
                "type_param_at" => Function::new_typed_with_env(&mut store, &env, queries::type_param_at),
                "type_result_at" => Function::new_typed_with_env(&mut store, &env, queries::type_result_at),
                "is_locally_defined_function" => Function::new_typed_with_env(&mut store, &env, queries::is_locally_defined_function),
                "memory_min_max" => Function::new_typed_with_env(&mut store, &env, queries::memory_min_max),
                "is_memory_imported" => Function::new_typed_with_env(&mut store, &env, queries::is_memory_imported),
                "memory_instance_base_offset" => Function::new_typed(&mut store, queries::memory_instance_base_offset),
                "vm_context_local_memory_offset" => Function::new_typed_with_env(&mut store, &env, queries::vm_context_local_memory_offset),
                "vm_context_imported_memory_offset" => Function::new_typed_with_env(&mut store, &env, queries::vm_context_imported_memory_offset),
                "vm_context_imported_function_offset" => Function::new_typed_with_env(&mut store, &env, queries::vm_context_imported_function_offset),
            },
        };

        let instance = Instance::new(&mut store, &module, &imports)
            .map_err(|e| Error::Generator(format!("failed to instantiate generator: {}", e)))?;

        let memory = instance
            .exports
            .get_memory("memory")
            .map_err(|e| Error::Generator(format!("generator exports no memory: {}", e)))?
            .clone();
        env.as_mut(&mut store).memory = Some(memory);

        let get_func = |name: &str| -> Result<Function, Error> {
            Ok(instance
                .exports
                .get_function(name)
                .map_err(|e| Error::Generator(format!("generator export {}: {}", name, e)))?
                .clone())
        };
        let allocate = get_func("_allocate")?;
        let deallocate = get_func("_deallocate")?;
        let compile_function = get_func("compile_function")?;
        let initialize_target = get_func("initialize_target")?;

        let mut host = GeneratorHost {
            store,
            env,
            _instance: instance,
            allocate,
            deallocate,
            compile_function,
        };

        let kind = target.encoding();
        if let Err(e) = initialize_target.call(&mut host.store, &[Value::I32(kind as i32)]) {
            return Err(host.runtime_error("initialize_target", e));
        }
        debug!("generator initialized for target kind {}", kind);
        Ok(host)
    }

    /// Compile one function body.
    ///
    /// Encodes the local declarations the way a Wasm code-section body
    /// carries them (so the generator reuses its body decoder), pushes the
    /// bytes into generator memory, and invokes `compile_function`. The
    /// generator calls `compile_done` exactly once before returning; anything
    /// else is reported as a generator error.
    pub fn compile_function(
        &mut self,
        task: CompileTask,
        local_types: &[ValType],
        body: &[u8],
    ) -> Result<(), Error> {
        let func_index = task.func_index;

        let mut encoded = Vec::with_capacity(body.len() + local_types.len() * 2 + 4);
        leb128::write::unsigned(&mut encoded, local_types.len() as u64)
            .expect("writes to a Vec cannot fail");
        for lt in local_types {
            // one run of count 1 per local
            encoded.push(1);
            encoded.push(lt.wasm_byte());
        }
        encoded.extend_from_slice(body);

        let body_size = encoded.len() as u32;
        let offset = match self
            .allocate
            .call(&mut self.store, &[Value::I32(body_size as i32)])
        {
            Ok(ret) => match ret.first() {
                Some(Value::I32(v)) => *v as u32,
                _ => {
                    return Err(Error::Generator(
                        "_allocate returned an unexpected value".to_owned(),
                    ))
                }
            },
            Err(e) => return Err(self.runtime_error("_allocate", e)),
        };

        {
            let state = self.env.as_mut(&mut self.store);
            let memory = state
                .memory
                .clone()
                .expect("BUG: generator memory not initialized");
            memory
                .view(&self.store)
                .write(offset as u64, &encoded)
                .map_err(|e| Error::Generator(format!("failed to write function body: {}", e)))?;
        }

        let pending_before = {
            let state = self.env.as_mut(&mut self.store);
            state.task = Some(task);
            state.pending.len()
        };

        let result = self.compile_function.call(
            &mut self.store,
            &[Value::I32(offset as i32), Value::I32(body_size as i32)],
        );

        let state = self.env.as_mut(&mut self.store);
        state.task = None;
        let produced = state.pending.len() - pending_before;

        if let Err(e) = result {
            return Err(self.runtime_error(&format!("compile_function({})", func_index), e));
        }
        if produced != 1 {
            return Err(Error::Generator(format!(
                "compile_done was invoked {} times for function {}",
                produced, func_index
            )));
        }

        if let Err(e) = self
            .deallocate
            .call(&mut self.store, &[Value::I32(offset as i32)])
        {
            return Err(self.runtime_error("_deallocate", e));
        }
        Ok(())
    }

    /// Take the bodies accumulated over a compile pass, in function-index
    /// order.
    pub fn take_pending(&mut self) -> Vec<PendingBody> {
        std::mem::take(&mut self.env.as_mut(&mut self.store).pending)
    }

    /// Drop any partial output of a failed compile pass.
    pub fn abort_pending(&mut self) {
        let state = self.env.as_mut(&mut self.store);
        state.task = None;
        state.pending.clear();
    }

    /// Captured stdout/stderr of the generator, for diagnostics.
    pub fn diagnostics(&self) -> (String, String) {
        let state = self.env.as_ref(&self.store);
        (
            String::from_utf8_lossy(&state.stdout).into_owned(),
            String::from_utf8_lossy(&state.stderr).into_owned(),
        )
    }

    fn runtime_error(&self, what: &str, e: RuntimeError) -> Error {
        let (_, stderr) = self.diagnostics();
        if stderr.is_empty() {
            Error::Generator(format!("{} failed: {}", what, e))
        } else {
            Error::Generator(format!("{} failed: {}\n{}", what, e, stderr))
        }
    }
}

const ERRNO_BADF: u32 = 8;
const ERRNO_FAULT: u32 = 21;

/// `fd_write`, routing fds 1 and 2 into the capture buffers. All other
/// descriptors are bad.
fn wasi_fd_write(
    mut env: FunctionEnvMut<HostState>,
    fd: u32,
    iovs: u32,
    iovs_count: u32,
    result_nwritten: u32,
) -> u32 {
    if fd != 1 && fd != 2 {
        return ERRNO_BADF;
    }
    let (state, store) = env.data_and_store_mut();
    let memory = match &state.memory {
        Some(m) => m.clone(),
        None => return ERRNO_BADF,
    };
    let view = memory.view(&store);

    let iovs_stop = iovs_count.wrapping_shl(3);
    let mut iovs_buf = vec![0u8; iovs_stop as usize];
    if view.read(iovs as u64, &mut iovs_buf).is_err() {
        return ERRNO_FAULT;
    }

    let mut nwritten = 0u32;
    let mut scratch = Vec::new();
    for entry in iovs_buf.chunks_exact(8) {
        let offset = u32::from_le_bytes(entry[..4].try_into().unwrap());
        let len = u32::from_le_bytes(entry[4..].try_into().unwrap());
        scratch.resize(len as usize, 0);
        if view.read(offset as u64, &mut scratch).is_err() {
            return ERRNO_FAULT;
        }
        let sink = if fd == 1 {
            &mut state.stdout
        } else {
            &mut state.stderr
        };
        sink.extend_from_slice(&scratch);
        nwritten += len;
    }

    if view
        .write(result_nwritten as u64, &nwritten.to_le_bytes())
        .is_err()
    {
        return ERRNO_FAULT;
    }
    0
}
