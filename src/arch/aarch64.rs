//! AArch64 (AAPCS64) emitters for entry thunks and parameter-setup stubs,
//! plus `BL` call-site patching.
//!
//! The VM context rides in `x0` untouched; wasm parameters fill `x1..x7` and
//! `v0..v7`, with overflow spilled to the stack. Instruction words are built
//! from their bit-field formulas and appended little-endian.

use crate::arch::{spill_area_size, spill_slot_count};
use crate::error::Error;
use crate::module::ValType;
use byteorder::{ByteOrder, LittleEndian};

/// Integer argument registers available to wasm parameters (`x0` carries the
/// VM context).
const INT_PARAM_REGS: usize = 7;
const FLOAT_PARAM_REGS: usize = 8;

const SP: u32 = 31;
const SCRATCH_BASE: u32 = 9; // params array base, set by the thunk
const SCRATCH_SPILL: u32 = 10;

fn push(code: &mut Vec<u8>, insn: u32) {
    let mut word = [0u8; 4];
    LittleEndian::write_u32(&mut word, insn);
    code.extend_from_slice(&word);
}

/// `ORR Xd, XZR, Xm` — register move.
fn mov_reg(d: u32, m: u32) -> u32 {
    0xAA00_0000 | (m << 16) | (31 << 5) | d
}

/// `ADD Xd, Xn, #0` — the move form that can read or write SP.
fn mov_sp(d: u32, n: u32) -> u32 {
    0x9100_0000 | (n << 5) | d
}

/// `LDR` (unsigned scaled offset) from `[x9 + disp]` into an integer or
/// vector register.
fn load_param(t: u32, disp: u32, ty: ValType) -> u32 {
    match ty {
        ValType::I32 => 0xB940_0000 | ((disp / 4) << 10) | (SCRATCH_BASE << 5) | t,
        ValType::F32 => 0xBD40_0000 | ((disp / 4) << 10) | (SCRATCH_BASE << 5) | t,
        ValType::F64 => 0xFD40_0000 | ((disp / 8) << 10) | (SCRATCH_BASE << 5) | t,
        // i64 and reference types are 64-bit integer loads
        _ => 0xF940_0000 | ((disp / 8) << 10) | (SCRATCH_BASE << 5) | t,
    }
}

/// `STUR` (unscaled) of a result register to `[x19 + disp]`; unscaled because
/// packed result offsets are not always size-aligned.
fn store_result(t: u32, disp: u32, ty: ValType) -> u32 {
    let imm9 = (disp & 0x1FF) << 12;
    match ty {
        ValType::I32 => 0xB800_0000 | imm9 | (19 << 5) | t,
        ValType::I64 => 0xF800_0000 | imm9 | (19 << 5) | t,
        ValType::F32 => 0xBC00_0000 | imm9 | (19 << 5) | t,
        ValType::F64 => 0xFC00_0000 | imm9 | (19 << 5) | t,
        other => panic!("BUG: {:?} is not a supported result type", other),
    }
}

/// Emit the entry thunk for one signature.
///
/// C signature: `(vmctx: x0, entry: x1, stack_top: x2, results: x3,
/// setup_stub: x4, params: x5)`.
pub fn emit_entry_thunk(params: &[ValType], results: &[ValType]) -> Vec<u8> {
    let mut code = Vec::with_capacity(64);

    push(&mut code, 0xA9BE_7BFD); // stp x29, x30, [sp, #-32]!
    push(&mut code, mov_sp(29, SP)); // mov x29, sp
    push(&mut code, 0xA901_53F3); // stp x19, x20, [sp, #16]
    push(&mut code, mov_reg(19, 3)); // results
    push(&mut code, mov_reg(20, 1)); // entry
    push(&mut code, mov_sp(SP, 2)); // switch to the pinned stack

    let spill = spill_area_size(params, INT_PARAM_REGS, FLOAT_PARAM_REGS) as u32;
    if spill > 0 {
        // sub sp, sp, #spill
        push(&mut code, 0xD100_0000 | (spill << 10) | (SP << 5) | SP);
    }

    if !params.is_empty() {
        push(&mut code, mov_reg(SCRATCH_BASE, 5)); // params base
        push(&mut code, 0xD63F_0000 | (4 << 5)); // blr x4 (setup stub)
    }

    push(&mut code, 0xD63F_0000 | (20 << 5)); // blr x20 (entry; vmctx in x0)

    let mut int_results = 0u32;
    let mut float_results = 0u32;
    let mut offset = 0u32;
    for ty in results {
        if ty.is_float() {
            push(&mut code, store_result(float_results, offset, *ty));
            float_results += 1;
        } else {
            push(&mut code, store_result(int_results, offset, *ty));
            int_results += 1;
        }
        offset += ty.result_width() as u32;
    }

    push(&mut code, mov_sp(SP, 29)); // back to the host stack
    push(&mut code, 0xA941_53F3); // ldp x19, x20, [sp, #16]
    push(&mut code, 0xA8C2_7BFD); // ldp x29, x30, [sp], #32
    push(&mut code, 0xD65F_03C0); // ret

    code
}

/// Emit the parameter-setup stub for one signature.
///
/// Entered via `blr` with the packed parameter array in `x9`; the stack
/// pointer is the one the entry will be called with, so spilled slots go
/// straight to `[sp + 8j]`.
pub fn emit_param_stub(params: &[ValType]) -> Vec<u8> {
    let mut code = Vec::with_capacity(params.len() * 4 + 4);
    let mut int_args = 0u32;
    let mut float_args = 0u32;
    let mut spills = 0u32;

    for (j, ty) in params.iter().enumerate() {
        let disp = (j * 8) as u32;
        if ty.is_float() {
            if (float_args as usize) < FLOAT_PARAM_REGS {
                push(&mut code, load_param(float_args, disp, *ty));
                float_args += 1;
                continue;
            }
        } else if (int_args as usize) < INT_PARAM_REGS {
            push(&mut code, load_param(1 + int_args, disp, *ty));
            int_args += 1;
            continue;
        }
        // ldr x10, [x9, #disp]; str x10, [sp, #8*spills]
        push(&mut code, load_param(SCRATCH_SPILL, disp, ValType::I64));
        push(
            &mut code,
            0xF900_0000 | (spills << 10) | (SP << 5) | SCRATCH_SPILL,
        );
        spills += 1;
    }

    push(&mut code, 0xD65F_03C0); // ret
    code
}

/// Patch a `BL` call site: the 4-byte slot becomes a `BL` with the imm26
/// word displacement to the callee.
pub fn patch_call(
    code: &mut [u8],
    slot_offset: usize,
    site_addr: u64,
    target_addr: u64,
    callee: u32,
) -> Result<(), Error> {
    let disp = (target_addr as i64).wrapping_sub(site_addr as i64);
    assert_eq!(disp & 3, 0, "BUG: misaligned BL target");
    if !(-(1 << 27)..(1 << 27)).contains(&disp) {
        return Err(Error::RelocationOutOfRange(callee, site_addr));
    }
    let insn = 0x9400_0000 | (((disp >> 2) as u32) & 0x03FF_FFFF);
    LittleEndian::write_u32(&mut code[slot_offset..slot_offset + 4], insn);
    Ok(())
}

/// Number of parameters this target spills for a signature.
pub fn spilled_params(params: &[ValType]) -> usize {
    spill_slot_count(params, INT_PARAM_REGS, FLOAT_PARAM_REGS)
}
