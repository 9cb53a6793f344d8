//! Target-specific machine-code emission and call-site patching.
//!
//! Both architecture modules are compiled on every host so their emitters can
//! be unit-tested anywhere; only `native` is ever executed.

pub mod aarch64;
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub(crate) use self::x86_64 as native;

#[cfg(target_arch = "aarch64")]
pub(crate) use self::aarch64 as native;

use crate::error::Error;
use crate::module::ValType;

/// Cache key for entry thunks and parameter-setup stubs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SignatureKey {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl SignatureKey {
    pub fn new(params: &[ValType], results: &[ValType]) -> Self {
        SignatureKey {
            params: params.to_vec(),
            results: results.to_vec(),
        }
    }
}

/// Check a signature against the register-return contract fixed with the
/// code generator: at most two results, carried in integer and
/// floating-point return registers.
///
/// Reference-typed and v128 results indicate internal state corruption (the
/// generator must never produce them under this contract) and abort.
pub fn validate_signature(params: &[ValType], results: &[ValType]) -> Result<(), Error> {
    // keeps every setup-stub displacement inside its encodable range
    if params.len() > 128 {
        return Err(Error::Unsupported(format!(
            "{} parameters exceed the setup-stub limit",
            params.len()
        )));
    }
    for p in params {
        if *p == ValType::V128 {
            return Err(Error::Unsupported(
                "v128 parameters are not supported".to_owned(),
            ));
        }
    }
    if results.len() > 2 {
        return Err(Error::Unsupported(format!(
            "{} results exceed the register-return contract",
            results.len()
        )));
    }
    for r in results {
        match r {
            ValType::I32 | ValType::I64 | ValType::F32 | ValType::F64 => (),
            ValType::V128 => panic!("BUG: v128 results are not supported"),
            other => panic!("BUG: {:?} is not a supported result type", other),
        }
    }
    Ok(())
}

/// Number of parameters that overflow the register file and spill to the
/// stack, given the target's integer and float argument register counts.
pub(crate) fn spill_slot_count(params: &[ValType], int_regs: usize, float_regs: usize) -> usize {
    let mut ints = 0usize;
    let mut floats = 0usize;
    for p in params {
        if p.is_float() {
            floats += 1;
        } else {
            ints += 1;
        }
    }
    ints.saturating_sub(int_regs) + floats.saturating_sub(float_regs)
}

/// Spill area size for the entry thunk: one 8-byte slot per spilled
/// parameter, rounded up to keep the stack 16-byte aligned at the call.
pub(crate) fn spill_area_size(params: &[ValType], int_regs: usize, float_regs: usize) -> usize {
    let bytes = spill_slot_count(params, int_regs, float_regs) * 8;
    (bytes + 15) & !15
}
