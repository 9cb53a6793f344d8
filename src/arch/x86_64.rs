//! x86-64 System V emitters for entry thunks and parameter-setup stubs, plus
//! direct-call relocation patching.
//!
//! Generated functions use the C calling convention with the VM context as
//! their first argument, so the thunk leaves `rdi` untouched, parks the
//! callee-saved state it needs, switches onto the call engine's pinned stack,
//! and lets the setup stub fill `rsi, rdx, rcx, r8, r9`, `xmm0..xmm7` and the
//! spill slots from the packed parameter array.

use crate::arch::{spill_area_size, spill_slot_count};
use crate::error::Error;
use crate::module::ValType;
use byteorder::{ByteOrder, LittleEndian};

/// Integer argument registers available to wasm parameters, in ABI order.
/// `rdi` is reserved for the VM context.
const INT_PARAM_REGS: &[u8] = &[RSI, RDX, RCX, R8, R9];
const FLOAT_PARAM_REGS: usize = 8;

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RSP: u8 = 4;
const RSI: u8 = 6;
const R8: u8 = 8;
const R9: u8 = 9;
const R10: u8 = 10;

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Emit a ModRM byte plus displacement for a `[base + disp]` operand.
/// `base` must not be rsp or r12 (no SIB handling) nor rbp/r13 at disp 0.
fn emit_mem(code: &mut Vec<u8>, reg: u8, base: u8, disp: i32) {
    if disp == 0 {
        code.push(modrm(0b00, reg, base));
    } else if (-128..=127).contains(&disp) {
        code.push(modrm(0b01, reg, base));
        code.push(disp as u8);
    } else {
        code.push(modrm(0b10, reg, base));
        code.extend_from_slice(&disp.to_le_bytes());
    }
}

/// `mov reg, [r10 + disp]`, 32- or 64-bit.
fn emit_load_int(code: &mut Vec<u8>, dst: u8, disp: i32, wide: bool) {
    let mut rex = 0x40 | 0x01; // REX.B: base is r10
    if wide {
        rex |= 0x08;
    }
    if dst >= 8 {
        rex |= 0x04;
    }
    code.push(rex);
    code.push(0x8B);
    emit_mem(code, dst, R10, disp);
}

/// `movss`/`movsd xmm, [r10 + disp]`.
fn emit_load_float(code: &mut Vec<u8>, dst_xmm: u8, disp: i32, wide: bool) {
    code.push(if wide { 0xF2 } else { 0xF3 });
    code.push(0x41); // REX.B: base is r10
    code.push(0x0F);
    code.push(0x10);
    emit_mem(code, dst_xmm, R10, disp);
}

/// `mov [rsp + disp], rax` (SIB form for the rsp base).
fn emit_spill_store(code: &mut Vec<u8>, disp: i32) {
    code.push(0x48);
    code.push(0x89);
    if (-128..=127).contains(&disp) {
        code.push(modrm(0b01, RAX, RSP));
        code.push(0x24); // SIB: base rsp, no index
        code.push(disp as u8);
    } else {
        code.push(modrm(0b10, RAX, RSP));
        code.push(0x24);
        code.extend_from_slice(&disp.to_le_bytes());
    }
}

/// Store a result register into the results buffer at `[rbx + disp]`.
fn emit_store_result(code: &mut Vec<u8>, ty: ValType, int_idx: u8, float_idx: u8, disp: i32) {
    match ty {
        ValType::I32 => {
            code.push(0x89);
            emit_mem(code, [RAX, RDX][int_idx as usize], RBX, disp);
        }
        ValType::I64 => {
            code.push(0x48);
            code.push(0x89);
            emit_mem(code, [RAX, RDX][int_idx as usize], RBX, disp);
        }
        ValType::F32 | ValType::F64 => {
            code.push(if ty == ValType::F64 { 0xF2 } else { 0xF3 });
            code.push(0x0F);
            code.push(0x11);
            emit_mem(code, float_idx, RBX, disp);
        }
        other => panic!("BUG: {:?} is not a supported result type", other),
    }
}

/// Emit the entry thunk for one signature.
///
/// C signature: `(vmctx: rdi, entry: rsi, stack_top: rdx, results: rcx,
/// setup_stub: r8, params: r9)`. The stub and params pointers are only used
/// when the signature has parameters; the results pointer only when it has
/// results.
pub fn emit_entry_thunk(params: &[ValType], results: &[ValType]) -> Vec<u8> {
    let mut code = Vec::with_capacity(64);

    code.push(0x55); // push rbp
    code.extend_from_slice(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
    code.push(0x53); // push rbx
    code.extend_from_slice(&[0x41, 0x54]); // push r12

    code.extend_from_slice(&[0x48, 0x89, 0xCB]); // mov rbx, rcx (results)
    code.extend_from_slice(&[0x49, 0x89, 0xF4]); // mov r12, rsi (entry)
    code.extend_from_slice(&[0x48, 0x89, 0xD4]); // mov rsp, rdx (pinned stack)

    let spill = spill_area_size(params, INT_PARAM_REGS.len(), FLOAT_PARAM_REGS);
    if spill > 0 {
        code.extend_from_slice(&[0x48, 0x81, 0xEC]); // sub rsp, imm32
        code.extend_from_slice(&(spill as u32).to_le_bytes());
    }

    if !params.is_empty() {
        code.extend_from_slice(&[0x4D, 0x89, 0xCA]); // mov r10, r9 (params base)
        code.extend_from_slice(&[0x41, 0xFF, 0xD0]); // call r8 (setup stub)
    }

    code.extend_from_slice(&[0x41, 0xFF, 0xD4]); // call r12 (entry; vmctx in rdi)

    let mut int_results = 0u8;
    let mut float_results = 0u8;
    let mut offset = 0i32;
    for ty in results {
        if ty.is_float() {
            emit_store_result(&mut code, *ty, 0, float_results, offset);
            float_results += 1;
        } else {
            emit_store_result(&mut code, *ty, int_results, 0, offset);
            int_results += 1;
        }
        offset += ty.result_width() as i32;
    }

    code.extend_from_slice(&[0x48, 0x8D, 0x65, 0xF0]); // lea rsp, [rbp-16]
    code.extend_from_slice(&[0x41, 0x5C]); // pop r12
    code.push(0x5B); // pop rbx
    code.push(0x5D); // pop rbp
    code.push(0xC3); // ret

    code
}

/// Emit the parameter-setup stub for one signature.
///
/// Called by the thunk with the packed parameter array in `r10`; moves each
/// 8-byte slot into the ABI location the generated entry expects. Spilled
/// slots land at `[rsp + 8 + 8j]` — past the stub's own return address, at
/// the offsets the entry will see once the thunk issues its call.
pub fn emit_param_stub(params: &[ValType]) -> Vec<u8> {
    let mut code = Vec::with_capacity(params.len() * 8);
    let mut int_args = 0usize;
    let mut float_args = 0usize;
    let mut spills = 0i32;

    for (j, ty) in params.iter().enumerate() {
        let disp = (j * 8) as i32;
        if ty.is_float() {
            if float_args < FLOAT_PARAM_REGS {
                emit_load_float(&mut code, float_args as u8, disp, *ty == ValType::F64);
                float_args += 1;
                continue;
            }
        } else if int_args < INT_PARAM_REGS.len() {
            let wide = *ty != ValType::I32;
            emit_load_int(&mut code, INT_PARAM_REGS[int_args], disp, wide);
            int_args += 1;
            continue;
        }
        // Spilled either way; the slot itself is always 8 bytes.
        emit_load_int(&mut code, RAX, disp, true);
        emit_spill_store(&mut code, 8 + 8 * spills);
        spills += 1;
    }

    code.push(0xC3); // ret
    code
}

/// Patch the rel32 slot of a direct near call.
///
/// The slot holds the displacement from the end of the 4-byte field to the
/// callee's entry.
pub fn patch_call(
    code: &mut [u8],
    slot_offset: usize,
    site_addr: u64,
    target_addr: u64,
    callee: u32,
) -> Result<(), Error> {
    let disp = (target_addr as i64).wrapping_sub(site_addr as i64 + 4);
    let disp = i32::try_from(disp).map_err(|_| Error::RelocationOutOfRange(callee, site_addr))?;
    LittleEndian::write_i32(&mut code[slot_offset..slot_offset + 4], disp);
    Ok(())
}

/// Number of parameters this target spills for a signature.
pub fn spilled_params(params: &[ValType]) -> usize {
    spill_slot_count(params, INT_PARAM_REGS.len(), FLOAT_PARAM_REGS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ValType::*;

    #[test]
    fn thunk_prologue_and_epilogue() {
        let code = emit_entry_thunk(&[], &[]);
        assert_eq!(&code[..4], &[0x55, 0x48, 0x89, 0xE5]);
        assert_eq!(code.last(), Some(&0xC3));
        // no params: the stub must never be called
        assert!(!code.windows(3).any(|w| w == [0x41, 0xFF, 0xD0]));
    }

    #[test]
    fn thunk_with_params_calls_the_stub() {
        let code = emit_entry_thunk(&[I32], &[I32]);
        assert!(code.windows(3).any(|w| w == [0x41, 0xFF, 0xD0]));
        // i32 result store: mov [rbx], eax
        assert!(code.windows(2).any(|w| w == [0x89, 0x03]));
    }

    #[test]
    fn thunk_packs_mixed_results() {
        // (i32, i64): eax at +0, rdx at +4
        let code = emit_entry_thunk(&[], &[I32, I64]);
        assert!(code.windows(2).any(|w| w == [0x89, 0x03]));
        assert!(code
            .windows(4)
            .any(|w| w == [0x48, 0x89, 0x53, 0x04]));
    }

    #[test]
    fn stub_loads_register_params() {
        // (i32, f64): mov esi, [r10]; movsd xmm0, [r10+8]
        let code = emit_param_stub(&[I32, F64]);
        assert_eq!(&code[..3], &[0x41, 0x8B, 0x32]);
        assert_eq!(&code[3..9], &[0xF2, 0x41, 0x0F, 0x10, 0x42, 0x08]);
        assert_eq!(code.last(), Some(&0xC3));
    }

    #[test]
    fn stub_spills_past_the_register_file() {
        // six integer params: the sixth goes to [rsp + 8]
        let params = [I64; 6];
        assert_eq!(spilled_params(&params), 1);
        let code = emit_param_stub(&params);
        // mov rax, [r10+40]; mov [rsp+8], rax
        let tail = &code[code.len() - 10..];
        assert_eq!(tail, &[0x49, 0x8B, 0x42, 0x28, 0x48, 0x89, 0x44, 0x24, 0x08, 0xC3]);
    }

    #[test]
    fn patch_call_writes_rel32() {
        let mut code = vec![0xE8, 0, 0, 0, 0]; // call rel32
        patch_call(&mut code, 1, 0x1001, 0x2000, 7).expect("in range");
        let disp = LittleEndian::read_i32(&code[1..5]);
        assert_eq!(disp, 0x2000 - (0x1001 + 4));
    }

    #[test]
    fn patch_call_rejects_far_targets() {
        let mut code = vec![0u8; 4];
        let err = patch_call(&mut code, 0, 0, 0x1_0000_0000, 3).unwrap_err();
        assert!(matches!(err, Error::RelocationOutOfRange(3, _)));
    }
}
