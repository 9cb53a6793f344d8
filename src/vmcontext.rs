//! Per-instance VM contexts.
//!
//! Generated code receives a single opaque pointer at runtime and reaches
//! everything instance-specific through it: the local linear memory, the
//! imported memory instance, and the entry points of imported functions.
//! The layout of that opaque buffer is computed per module at compile time
//! ([`VmContextLayout`]) and queried by the code generator through the host
//! imports; the buffer itself is materialized per instance ([`VmContext`]).
//!
//! This follows how wasmtime defines its own `VMContext`; see
//! <https://github.com/bytecodealliance/wasmtime/blob/v4.0.0/crates/runtime/src/vmcontext.rs>.

use crate::engine::CompiledModule;
use crate::module::InstanceId;
use byteorder::{ByteOrder, LittleEndian};
use std::sync::Arc;

/// Absent-section sentinel in a [`VmContextLayout`].
pub const ABSENT: i32 = -1;

const LOCAL_MEMORY_RECORD_SIZE: u32 = 16;
const IMPORTED_MEMORY_RECORD_SIZE: u32 = 8;
const IMPORTED_FUNCTION_RECORD_SIZE: u32 = 16;

/// Offsets into the opaque per-instance buffer, fixed per module.
///
/// The `*_begin` fields are either a non-negative byte offset or [`ABSENT`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmContextLayout {
    pub total_size: u32,
    pub local_memory_begin: i32,
    pub imported_memory_begin: i32,
    pub imported_functions_begin: i32,
}

impl VmContextLayout {
    /// Compute the layout for a module shape. Pure: identical inputs yield
    /// identical layouts, and generated code depends on that.
    pub fn compute(
        local_memories: u32,
        imported_memories: u32,
        import_func_count: u32,
    ) -> VmContextLayout {
        let mut offset = 0u32;

        let local_memory_begin = if local_memories > 0 {
            // buffer base pointer + buffer length
            offset += LOCAL_MEMORY_RECORD_SIZE;
            0
        } else {
            ABSENT
        };

        let imported_memory_begin = if imported_memories > 0 {
            // pointer to the foreign memory instance
            let begin = offset as i32;
            offset += IMPORTED_MEMORY_RECORD_SIZE;
            begin
        } else {
            ABSENT
        };

        let imported_functions_begin = offset as i32;
        offset += import_func_count * IMPORTED_FUNCTION_RECORD_SIZE;

        let layout = VmContextLayout {
            total_size: offset,
            local_memory_begin,
            imported_memory_begin,
            imported_functions_begin,
        };
        debug_assert_eq!(
            layout.imported_functions_begin as u32
                + import_func_count * IMPORTED_FUNCTION_RECORD_SIZE,
            layout.total_size
        );
        layout
    }

    /// Offset of the `i`-th imported-function record.
    pub fn imported_function_offset(&self, i: u32) -> u32 {
        self.imported_functions_begin as u32 + i * IMPORTED_FUNCTION_RECORD_SIZE
    }
}

/// An imported-function slot: the callee's entry in its owning module's
/// executable, plus the VM context of the instance that defines it.
///
/// The `Arc` is a back-reference in spirit — the importing instance never
/// mutates the foreign context — but holding it keeps the foreign executable
/// and buffer alive for as long as this slot can be called through.
#[derive(Debug)]
pub(crate) struct ImportedFunction {
    pub executable: *const u8,
    pub vmctx: Arc<VmContext>,
}

/// One per module instance. Owns the opaque buffer generated code reads.
///
/// # Movement
///
/// The buffer address is captured at construction and written into other
/// instances' import slots; the allocation must therefore never move. The
/// buffer is boxed once and only ever accessed in place — any refactor that
/// changes the allocation strategy has to preserve that pinning.
#[derive(Debug)]
pub struct VmContext {
    opaque: Box<[u8]>,
    opaque_ptr: *mut u8,
    parent: Arc<CompiledModule>,
    imported_functions: Vec<ImportedFunction>,
    instance_id: InstanceId,
    instance_name: String,
}

// The opaque buffer is written only during construction; afterwards it is
// read concurrently by generated code and never mutated.
unsafe impl Send for VmContext {}
unsafe impl Sync for VmContext {}

impl VmContext {
    /// Materialize the opaque buffer for one instance.
    ///
    /// `local_memory` is the pinned span of the instance's local linear
    /// memory, `imported_memory_ptr` the opaque foreign memory-instance
    /// pointer; either is ignored when the layout has no slot for it.
    pub(crate) fn build(
        parent: Arc<CompiledModule>,
        instance_id: InstanceId,
        instance_name: String,
        local_memory: &[u8],
        imported_memory_ptr: u64,
        imported_functions: Vec<ImportedFunction>,
    ) -> VmContext {
        let layout = parent.vm_offsets();
        let mut opaque = vec![0u8; layout.total_size as usize].into_boxed_slice();

        if layout.local_memory_begin >= 0 {
            let at = layout.local_memory_begin as usize;
            LittleEndian::write_u64(&mut opaque[at..], local_memory.as_ptr() as u64);
            LittleEndian::write_u64(&mut opaque[at + 8..], local_memory.len() as u64);
        }

        if layout.imported_memory_begin >= 0 {
            let at = layout.imported_memory_begin as usize;
            LittleEndian::write_u64(&mut opaque[at..], imported_memory_ptr);
        }

        let mut at = layout.imported_functions_begin as usize;
        for imported in &imported_functions {
            LittleEndian::write_u64(&mut opaque[at..], imported.executable as u64);
            LittleEndian::write_u64(&mut opaque[at + 8..], imported.vmctx.opaque_ptr() as u64);
            at += IMPORTED_FUNCTION_RECORD_SIZE as usize;
        }

        let opaque_ptr = if opaque.is_empty() {
            std::ptr::null_mut()
        } else {
            opaque.as_mut_ptr()
        };

        VmContext {
            opaque,
            opaque_ptr,
            parent,
            imported_functions,
            instance_id,
            instance_name,
        }
    }

    /// The address generated code receives; pinned for the context's life.
    pub fn opaque_ptr(&self) -> *mut u8 {
        self.opaque_ptr
    }

    pub fn opaque_bytes(&self) -> &[u8] {
        &self.opaque
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub(crate) fn import_func_count(&self) -> u32 {
        self.imported_functions.len() as u32
    }

    /// Resolve a function index inside this instance's module to its native
    /// entry and the VM context that entry expects.
    ///
    /// Local indices resolve into this module's executable. Imported indices
    /// follow the import slot, which was itself resolved recursively at
    /// instantiation, so re-exported imports land on the defining instance.
    pub(crate) fn resolve_function_entry(
        self: &Arc<Self>,
        func_index: u32,
    ) -> (*const u8, Arc<VmContext>) {
        let imported = self.import_func_count();
        if func_index >= imported {
            let entry = self.parent.function_entry(func_index - imported);
            (entry, self.clone())
        } else {
            let slot = &self.imported_functions[func_index as usize];
            (slot.executable, slot.vmctx.clone())
        }
    }
}
