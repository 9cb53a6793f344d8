//! The engine: compile driver, compiled-module registry, and VM-context
//! registry.
//!
//! Compilation walks a module's local function bodies through the sandboxed
//! generator, stitches the emitted bodies into one layout, resolves
//! direct-call relocations in place on the mapped region, seals it
//! executable, and publishes the result under the module's id. Instantiation
//! materializes a VM context against the published module and registers it
//! under the instance's identity so later instances can import from it.

use crate::arch::{self, SignatureKey};
use crate::craneback_format_err;
use crate::error::Error;
use crate::generator::{CompileTask, GeneratorHost, ModuleShape, PendingBody, TargetKind};
use crate::mmap::CodeSegment;
use crate::module::{InstanceId, ModuleHandle, ModuleId, ModuleInstanceHandle};
use crate::trampoline::ModuleEngine;
use crate::vmcontext::{ImportedFunction, VmContext, VmContextLayout};
use log::debug;
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::{Arc, Mutex};

/// An immutable, executable rendition of one module.
///
/// Shared between the engine registry and every VM context instantiated from
/// it; the executable region is unmapped exactly once, when the last holder
/// goes away.
#[derive(Debug)]
pub struct CompiledModule {
    executable: CodeSegment,
    executable_offsets: Vec<usize>,
    vm_offsets: VmContextLayout,
}

impl CompiledModule {
    /// Entry address of the `defined_idx`-th locally defined function.
    pub(crate) fn function_entry(&self, defined_idx: u32) -> *const u8 {
        let offset = self.executable_offsets[defined_idx as usize];
        unsafe { self.executable.base().add(offset) }
    }

    pub(crate) fn vm_offsets(&self) -> VmContextLayout {
        self.vm_offsets
    }

    /// Shape of the VM contexts instantiated from this module.
    pub fn vm_context_layout(&self) -> VmContextLayout {
        self.vm_offsets
    }

    /// The executable bytes; safe to read from any thread once published.
    pub fn executable_bytes(&self) -> &[u8] {
        self.executable.as_slice()
    }

    /// Byte offset of each locally defined function inside the executable.
    pub fn executable_offsets(&self) -> &[usize] {
        &self.executable_offsets
    }
}

#[derive(Debug)]
pub struct Engine {
    // The generator instance is a single-threaded Wasm module; every compile
    // pass owns it exclusively.
    generator: Mutex<GeneratorHost>,
    modules: Mutex<HashMap<ModuleId, Arc<CompiledModule>>>,
    vmctxs: Mutex<HashMap<InstanceId, Arc<VmContext>>>,
    thunks: Mutex<HashMap<SignatureKey, Arc<CodeSegment>>>,
    param_stubs: Mutex<HashMap<SignatureKey, Arc<CodeSegment>>>,
}

impl Engine {
    /// Create an engine around a generator binary, targeting `target`.
    pub fn new(generator_wasm: &[u8], target: TargetKind) -> Result<Arc<Engine>, Error> {
        let generator = GeneratorHost::new(generator_wasm, target)?;
        Ok(Arc::new(Engine {
            generator: Mutex::new(generator),
            modules: Mutex::new(HashMap::new()),
            vmctxs: Mutex::new(HashMap::new()),
            thunks: Mutex::new(HashMap::new()),
            param_stubs: Mutex::new(HashMap::new()),
        }))
    }

    /// Tear down the engine's registries and code caches.
    ///
    /// Cached stub and thunk segments are unmapped as their last references
    /// drop; live call engines keep theirs mapped until they are gone.
    pub fn close(&self) {
        self.vmctxs.lock().unwrap().clear();
        self.modules.lock().unwrap().clear();
        self.thunks.lock().unwrap().clear();
        self.param_stubs.lock().unwrap().clear();
    }

    /// Compile every locally defined function of `module` and publish the
    /// result under its module id.
    pub fn compile_module(&self, module: &dyn ModuleHandle) -> Result<(), Error> {
        if module.host_module() {
            return Err(Error::Unsupported(
                "host modules cannot be compiled".to_owned(),
            ));
        }

        let id = module.module_id();
        let imported = module.import_func_count();
        let vm_offsets = VmContextLayout::compute(
            module.local_memories_count(),
            module.imported_memories_count(),
            imported,
        );
        let shape = Arc::new(ModuleShape::capture(module));

        let mut generator = self.generator.lock().unwrap();
        for i in 0..module.code_count() {
            let (local_types, body) = module.code_at(i);
            let task = CompileTask {
                shape: shape.clone(),
                func_index: imported + i,
                vm_offsets,
            };
            if let Err(e) = generator.compile_function(task, local_types, body) {
                // Leave no partial state behind for this module id.
                generator.abort_pending();
                return Err(e);
            }
        }
        let bodies = generator.take_pending();
        drop(generator);

        let mut executable_offsets = Vec::with_capacity(bodies.len());
        let mut total_size = 0usize;
        for body in &bodies {
            // TODO: take alignment into account once the generator emits
            // alignment-sensitive constant pools.
            executable_offsets.push(total_size);
            total_size += body.machine_code.len();
        }
        debug!(
            "module {:?}: {} bodies, {} bytes of code",
            id,
            bodies.len(),
            total_size
        );

        let mut source: Box<dyn Read + '_> = Box::new(io::empty());
        for body in &bodies {
            source = Box::new(source.chain(&body.machine_code[..]));
        }
        let mut executable = CodeSegment::map(source, total_size)?;

        // The mapping's base address is final, so direct-call relocations can
        // be resolved in place before the region is sealed.
        apply_relocations(imported, &executable_offsets, &bodies, &mut executable)?;
        executable.make_executable()?;

        let compiled = Arc::new(CompiledModule {
            executable,
            executable_offsets,
            vm_offsets,
        });
        self.modules.lock().unwrap().insert(id, compiled);
        Ok(())
    }

    pub fn compiled_module_count(&self) -> u32 {
        self.modules.lock().unwrap().len() as u32
    }

    /// The published compilation of a module, if any.
    pub fn compiled_module(&self, id: ModuleId) -> Option<Arc<CompiledModule>> {
        self.modules.lock().unwrap().get(&id).cloned()
    }

    pub fn delete_compiled_module(&self, module: &dyn ModuleHandle) {
        self.modules.lock().unwrap().remove(&module.module_id());
    }

    /// Create the per-instance engine state: resolve imported functions
    /// against the VM-context registry, materialize the opaque context, and
    /// register it under the instance's identity.
    pub fn new_module_engine(
        self: &Arc<Self>,
        name: &str,
        module: &dyn ModuleHandle,
        instance: &dyn ModuleInstanceHandle,
    ) -> Result<ModuleEngine, Error> {
        let compiled = self
            .modules
            .lock()
            .unwrap()
            .get(&module.module_id())
            .cloned()
            .ok_or_else(|| Error::NotCompiled(name.to_owned()))?;

        let (imported_instances, imported_indices) = instance.imported_functions();
        let mut imported = Vec::with_capacity(imported_instances.len());
        {
            let vmctxs = self.vmctxs.lock().unwrap();
            for (from, idx) in imported_instances.iter().zip(&imported_indices) {
                let foreign = vmctxs.get(from).ok_or_else(|| {
                    Error::ImportResolution(format!(
                        "no VM context registered for instance {:?} imported by {}",
                        from, name
                    ))
                })?;
                let (executable, vmctx) = foreign.resolve_function_entry(*idx);
                imported.push(ImportedFunction { executable, vmctx });
            }
        }

        let vmctx = Arc::new(VmContext::build(
            compiled,
            instance.instance_id(),
            instance.name().to_owned(),
            instance.memory_instance_buffer(),
            instance.imported_memory_instance_ptr(),
            imported,
        ));
        self.vmctxs
            .lock()
            .unwrap()
            .insert(instance.instance_id(), vmctx.clone());
        Ok(ModuleEngine::new(self.clone(), vmctx))
    }

    /// Drop the VM context registered for an instance. Called by the host
    /// runtime on instance teardown; instances importing from it keep their
    /// resolved slots alive independently.
    pub fn remove_instance(&self, instance_id: InstanceId) {
        self.vmctxs.lock().unwrap().remove(&instance_id);
    }

    /// Number of distinct signatures with a cached parameter-setup stub.
    pub fn param_stub_cache_size(&self) -> usize {
        self.param_stubs.lock().unwrap().len()
    }

    pub(crate) fn entry_thunk(&self, key: &SignatureKey) -> Result<Arc<CodeSegment>, Error> {
        cached_segment(&self.thunks, key, || {
            arch::native::emit_entry_thunk(&key.params, &key.results)
        })
    }

    pub(crate) fn param_stub(&self, key: &SignatureKey) -> Result<Arc<CodeSegment>, Error> {
        cached_segment(&self.param_stubs, key, || {
            arch::native::emit_param_stub(&key.params)
        })
    }
}

fn cached_segment(
    cache: &Mutex<HashMap<SignatureKey, Arc<CodeSegment>>>,
    key: &SignatureKey,
    emit: impl FnOnce() -> Vec<u8>,
) -> Result<Arc<CodeSegment>, Error> {
    let mut cache = cache.lock().unwrap();
    if let Some(segment) = cache.get(key) {
        return Ok(segment.clone());
    }
    let mut segment = CodeSegment::from_bytes(&emit())?;
    segment.make_executable()?;
    let segment = Arc::new(segment);
    cache.insert(key.clone(), segment.clone());
    Ok(segment)
}

/// Resolve every direct-call relocation against the final layout.
///
/// Imported callees never appear here: generated code reaches them through
/// the VM context at runtime, so a relocation against one is a generator bug.
fn apply_relocations(
    import_func_count: u32,
    offsets: &[usize],
    bodies: &[PendingBody],
    executable: &mut CodeSegment,
) -> Result<(), Error> {
    let base = executable.base() as u64;
    let code = executable.as_mut_slice();
    for (i, body) in bodies.iter().enumerate() {
        for reloc in &body.relocs {
            let defined = reloc.func_index.checked_sub(import_func_count).ok_or_else(|| {
                craneback_format_err!(
                    "relocation against imported function {} (generator bug)",
                    reloc.func_index
                )
            })?;
            let target = *offsets.get(defined as usize).ok_or_else(|| {
                craneback_format_err!("relocation against unknown function {}", reloc.func_index)
            })?;
            let slot = reloc.offset as usize;
            if slot + 4 > body.machine_code.len() {
                return Err(craneback_format_err!(
                    "relocation site {:#x} outside body {}",
                    reloc.offset,
                    i
                ));
            }
            let slot = offsets[i] + slot;
            arch::native::patch_call(
                code,
                slot,
                base + slot as u64,
                base + target as u64,
                reloc.func_index,
            )?;
        }
    }
    Ok(())
}
