//! Per-instance module engines and per-exported-function call engines.
//!
//! A call engine owns everything one exported function needs to be entered
//! from host code: the resolved entry pointer, a pinned stack with a 16-byte
//! aligned top, the signature's entry thunk and parameter-setup stub, and a
//! results buffer. The thunk has a fixed C-level signature; parameters are
//! handed over as a packed `u64` array and results come back packed in the
//! results buffer.

use crate::arch::{self, SignatureKey};
use crate::engine::Engine;
use crate::error::Error;
use crate::mmap::CodeSegment;
use crate::module::{FunctionInstanceHandle, ValType};
use crate::vmcontext::VmContext;
use byteorder::{ByteOrder, LittleEndian};
use std::mem;
use std::ptr;
use std::sync::Arc;

/// Fixed signature of every entry thunk:
/// `(vmctx, entry, stack_top, results_ptr, setup_stub, params_ptr)`.
type EntryThunkFn =
    unsafe extern "C" fn(*mut u8, *const u8, u64, *mut u8, *const u8, *const u64);

/// Stack handed to generated code, reused across calls on one call engine.
const STACK_SIZE: usize = 1 << 12;

/// The per-instance face of the engine.
#[derive(Debug)]
pub struct ModuleEngine {
    engine: Arc<Engine>,
    vmctx: Arc<VmContext>,
}

impl ModuleEngine {
    pub(crate) fn new(engine: Arc<Engine>, vmctx: Arc<VmContext>) -> ModuleEngine {
        ModuleEngine { engine, vmctx }
    }

    pub fn name(&self) -> &str {
        self.vmctx.instance_name()
    }

    pub fn vm_context(&self) -> &VmContext {
        &self.vmctx
    }

    /// Build a call engine for one exported function.
    pub fn new_call_engine(&self, f: &dyn FunctionInstanceHandle) -> Result<CallEngine, Error> {
        if f.module_instance_id() != self.vmctx.instance_id() {
            return Err(Error::Unsupported(format!(
                "call engines for functions of another instance are not supported \
                 (function belongs to {:?}, engine to {:?})",
                f.module_instance_id(),
                self.vmctx.instance_id()
            )));
        }

        let (params, results) = f.function_type();
        arch::validate_signature(params, results)?;
        let key = SignatureKey::new(params, results);

        let (entry, vmctx) = self.vmctx.resolve_function_entry(f.index());
        let thunk = self.engine.entry_thunk(&key)?;
        let setup_stub = if params.is_empty() {
            None
        } else {
            Some(self.engine.param_stub(&key)?)
        };

        let stack = vec![0u8; STACK_SIZE].into_boxed_slice();
        let aligned_stack_top = aligned_stack_top(&stack);

        let results_buf = vec![0u8; results.len() * 8].into_boxed_slice();

        Ok(CallEngine {
            thunk,
            setup_stub,
            entry,
            stack,
            aligned_stack_top,
            results_buf,
            param_count: params.len(),
            result_types: results.to_vec(),
            vmctx,
        })
    }

    pub fn lookup_function(
        &self,
        _table_index: u32,
        _type_id: u32,
        _table_offset: u32,
    ) -> Result<u32, Error> {
        Err(Error::Unsupported("lookup_function".to_owned()))
    }

    pub fn get_function_references(&self, _indices: &[u32]) -> Result<Vec<u64>, Error> {
        Err(Error::Unsupported("get_function_references".to_owned()))
    }

    pub fn function_instance_reference(&self, _func_index: u32) -> Result<u64, Error> {
        Err(Error::Unsupported("function_instance_reference".to_owned()))
    }
}

/// Call state for one exported function.
///
/// Not thread-safe: the stack and results buffer are private scratch.
/// Reentrant calls on the same engine are undefined.
#[derive(Debug)]
pub struct CallEngine {
    thunk: Arc<CodeSegment>,
    setup_stub: Option<Arc<CodeSegment>>,
    entry: *const u8,
    // Pinned; the aligned top below points into this allocation.
    #[allow(dead_code)]
    stack: Box<[u8]>,
    aligned_stack_top: u64,
    results_buf: Box<[u8]>,
    param_count: usize,
    result_types: Vec<ValType>,
    vmctx: Arc<VmContext>,
}

// The raw pointers target the pinned executable and VM-context allocations
// the engine keeps alive through the Arcs above.
unsafe impl Send for CallEngine {}

impl CallEngine {
    /// Invoke the function with packed parameters; returns packed results.
    ///
    /// Each parameter occupies one `u64` slot regardless of type (floats by
    /// bit pattern); results come back the same way, with 32-bit values
    /// zero-extended.
    pub fn call(&mut self, params: &[u64]) -> Result<Vec<u64>, Error> {
        if params.len() != self.param_count {
            return Err(Error::InvalidArgument("parameter count mismatch"));
        }

        debug_assert_eq!(self.aligned_stack_top % 16, 0);

        let results_ptr = if self.results_buf.is_empty() {
            ptr::null_mut()
        } else {
            self.results_buf.as_mut_ptr()
        };
        let (setup_stub, params_ptr) = if params.is_empty() {
            (ptr::null(), ptr::null())
        } else {
            let stub = self
                .setup_stub
                .as_ref()
                .expect("BUG: call engine with parameters but no setup stub");
            (stub.base(), params.as_ptr())
        };

        let thunk = unsafe { mem::transmute::<*const u8, EntryThunkFn>(self.thunk.base()) };
        unsafe {
            thunk(
                self.vmctx.opaque_ptr(),
                self.entry,
                self.aligned_stack_top,
                results_ptr,
                setup_stub,
                params_ptr,
            )
        };

        Ok(self.decode_results())
    }

    fn decode_results(&self) -> Vec<u64> {
        let mut decoded = Vec::with_capacity(self.result_types.len());
        let mut offset = 0usize;
        for ty in &self.result_types {
            match ty {
                ValType::I32 | ValType::F32 => {
                    decoded.push(LittleEndian::read_u32(&self.results_buf[offset..]) as u64);
                    offset += 4;
                }
                ValType::I64 | ValType::F64 => {
                    decoded.push(LittleEndian::read_u64(&self.results_buf[offset..]));
                    offset += 8;
                }
                other => panic!("BUG: {:?} is not a supported result type", other),
            }
        }
        decoded
    }
}

/// 16-byte aligned top of a stack buffer; the stack grows down from here.
fn aligned_stack_top(stack: &[u8]) -> u64 {
    let top = stack.as_ptr() as u64 + stack.len() as u64;
    top - (top & 15)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_top_is_16_byte_aligned() {
        for pad in 0..16 {
            let stack = vec![0u8; STACK_SIZE + pad].into_boxed_slice();
            let top = aligned_stack_top(&stack);
            assert_eq!(top % 16, 0);
            let base = stack.as_ptr() as u64;
            assert!(top > base && top <= base + stack.len() as u64);
        }
    }
}
