//! Single-pass translator from decoded instructions to native code.
//!
//! Three phases:
//! 1. Label classification — every JUMP/JUMPEQ/CREATETHREAD target is
//!    a jump label, every CALL target a call label; an offset cannot
//!    be both because call targets receive a function prologue.
//! 2. Lowering — fixed program prologue, then per instruction: record
//!    the translation-map entry, emit the function prologue for call
//!    labels, lower per the opcode table, and close with one NOP.
//!    Forward references are emitted as placeholders and queued.
//! 3. Finalization — fixed epilogue, then drain the fixup list and
//!    patch every placeholder branch and thread-entry immediate.
//!
//! Register plan of the generated code:
//!   x0..x3   host-call arguments / incoming arguments
//!   x2..x4   operand temporaries
//!   x5       store-address temporary
//!   x9, x10  function pointer and entry-jump scratch
//!   x19      guest memory base (preserved)
//!   x20      guest register-array base (preserved)

use std::collections::HashMap;
use std::io;

use thiserror::Error;

use evm2_backend::aarch64::{self, Cond, PatchKind};
use evm2_backend::ExecImage;
use evm2_core::{Instruction, Op, Operand};

use crate::host::HostInterface;

/// Guest memory base lives in x19 across the whole run.
const MEM_BASE: u8 = 19;
/// Guest register-array base lives in x20.
const REG_BASE: u8 = 20;
/// Stack pointer register slot.
const SP: u8 = 31;

const T0: u8 = 2;
const T1: u8 = 3;
const T2: u8 = 4;
/// Address temporary for operand stores (never holds a value operand).
const ADDR_TMP: u8 = 5;
/// Host function pointer scratch.
const FN_PTR: u8 = 9;
/// Entry-jump scratch.
const ENTRY_TMP: u8 = 10;

/// Native index of the first word after the program prologue. Entry
/// offsets passed to the translated function are relative to it, and
/// the thread-entry immediates patched into CREATETHREAD trampolines
/// use the same base.
pub const ENTRY_BASE: usize = 11;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("{op} at bit {bit_offset}: operand pattern mismatch")]
    OperandMismatch { op: Op, bit_offset: u32 },
    #[error("bit offset {0} is used as both a jump and a call target")]
    LabelCollision(u32),
    #[error("branch or thread-entry target bit {0} has no translated instruction")]
    MissingTarget(u32),
    #[error("branch at native index {index} to {target}: offset exceeds encoding range")]
    BranchOutOfRange { index: usize, target: usize },
    #[error("thread entry at bit {target} resolves to native index {index}, beyond the 16-bit immediate slot")]
    EntryOutOfRange { target: u32, index: usize },
    #[error("fixup at native index {index} hit unpatchable word {word:#010x}")]
    BadPatchSite { index: usize, word: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LabelKind {
    Jump,
    Call,
}

struct Fixup {
    /// Native index of the placeholder word.
    index: usize,
    /// Source bit offset the placeholder refers to.
    target: u32,
}

/// Pure result of translation: the word stream and the translation
/// map. Sealing into executable memory is a separate, final step so
/// no partial executable ever escapes an error path.
pub struct TranslatedCode {
    code: Vec<u32>,
    map: HashMap<u32, usize>,
}

impl TranslatedCode {
    pub fn words(&self) -> &[u32] {
        &self.code
    }

    /// Native instruction index of the instruction starting at the
    /// given source bit offset.
    pub fn native_index(&self, bit_offset: u32) -> Option<usize> {
        self.map.get(&bit_offset).copied()
    }

    /// Seal into an executable image.
    pub fn finalize(&self) -> io::Result<ExecImage> {
        ExecImage::new(&self.code)
    }
}

/// Translate a decoded program against a host interface.
pub fn translate(
    insns: &[Instruction],
    host: &HostInterface,
) -> Result<TranslatedCode, TranslateError> {
    Translator::new(host).run(insns)
}

struct Translator<'a> {
    host: &'a HostInterface,
    code: Vec<u32>,
    map: HashMap<u32, usize>,
    fixups: Vec<Fixup>,
    labels: HashMap<u32, LabelKind>,
}

impl<'a> Translator<'a> {
    fn new(host: &'a HostInterface) -> Self {
        Self {
            host,
            code: Vec::new(),
            map: HashMap::new(),
            fixups: Vec::new(),
            labels: HashMap::new(),
        }
    }

    fn run(mut self, insns: &[Instruction]) -> Result<TranslatedCode, TranslateError> {
        self.classify_labels(insns)?;

        self.emit_prologue();
        for insn in insns {
            self.map.insert(insn.bit_offset, self.code.len());
            if self.labels.get(&insn.bit_offset) == Some(&LabelKind::Call) {
                self.emit_func_prologue();
            }
            self.lower(insn)?;
            self.emit(aarch64::nop());
        }
        self.emit_epilogue();

        self.apply_fixups()?;

        Ok(TranslatedCode {
            code: self.code,
            map: self.map,
        })
    }

    // -- Phase A ------------------------------------------------

    fn classify_labels(&mut self, insns: &[Instruction]) -> Result<(), TranslateError> {
        for insn in insns {
            let kind = match insn.op {
                Op::Jump | Op::JumpEq | Op::CreateThread => LabelKind::Jump,
                Op::Call => LabelKind::Call,
                _ => continue,
            };
            let Some(&Operand::Addr(target)) = insn.operands.first() else {
                return Err(self.mismatch(insn));
            };
            match self.labels.insert(target, kind) {
                Some(prev) if prev != kind => {
                    return Err(TranslateError::LabelCollision(target))
                }
                _ => {}
            }
        }
        Ok(())
    }

    // -- Emission helpers ---------------------------------------

    fn emit(&mut self, word: u32) -> usize {
        self.code.push(word);
        self.code.len() - 1
    }

    /// Minimal movz/movk sequence for a 64-bit immediate.
    fn emit_load_imm64(&mut self, reg: u8, value: u64) {
        let parts: [u16; 4] = [
            value as u16,
            (value >> 16) as u16,
            (value >> 32) as u16,
            (value >> 48) as u16,
        ];
        let Some(first) = parts.iter().position(|p| *p != 0) else {
            self.emit(aarch64::movz(reg, 0, 0));
            return;
        };
        self.emit(aarch64::movz(reg, parts[first], first as u32 * 16));
        for (i, part) in parts.iter().enumerate().skip(first + 1) {
            if *part != 0 {
                self.emit(aarch64::movk(reg, *part, i as u32 * 16));
            }
        }
    }

    /// Fixed-length (four word) form, independent of the value.
    fn emit_load_imm64_fixed(&mut self, reg: u8, value: u64) {
        self.emit(aarch64::movz(reg, value as u16, 0));
        self.emit(aarch64::movk(reg, (value >> 16) as u16, 16));
        self.emit(aarch64::movk(reg, (value >> 32) as u16, 32));
        self.emit(aarch64::movk(reg, (value >> 48) as u16, 48));
    }

    /// Load an operand's value into native register `dst`.
    fn emit_load_operand(&mut self, dst: u8, operand: &Operand) {
        match *operand {
            Operand::Reg(r) => {
                self.emit(aarch64::ldr_imm(dst, REG_BASE, r as u32));
            }
            Operand::Mem { reg, size } => {
                self.emit(aarch64::ldr_imm(dst, REG_BASE, reg as u32));
                self.emit(aarch64::ldst_reg(size, true, dst, MEM_BASE, dst));
            }
            Operand::Const(v) => self.emit_load_imm64(dst, v as u64),
            Operand::Addr(a) => self.emit_load_imm64(dst, a as u64),
        }
    }

    /// Store native register `src` into an operand location.
    fn emit_store_operand(
        &mut self,
        src: u8,
        operand: &Operand,
        insn: &Instruction,
    ) -> Result<(), TranslateError> {
        match *operand {
            Operand::Reg(r) => {
                self.emit(aarch64::str_imm(src, REG_BASE, r as u32));
                Ok(())
            }
            Operand::Mem { reg, size } => {
                self.emit(aarch64::ldr_imm(ADDR_TMP, REG_BASE, reg as u32));
                self.emit(aarch64::ldst_reg(size, false, src, MEM_BASE, ADDR_TMP));
                Ok(())
            }
            _ => Err(self.mismatch(insn)),
        }
    }

    /// Program prologue: 32-byte frame, preserve the memory and
    /// register-array bases, computed jump to `entry_base + 4*entry`.
    fn emit_prologue(&mut self) {
        self.emit(aarch64::sub_imm(SP, SP, 16));
        self.emit(aarch64::stp(29, 30, SP, 0));
        self.emit(aarch64::add_imm(29, SP, 0));
        self.emit(aarch64::sub_imm(SP, SP, 16));
        self.emit(aarch64::stp(MEM_BASE, REG_BASE, SP, 0));
        self.emit(aarch64::mov_reg(MEM_BASE, 0));
        self.emit(aarch64::mov_reg(REG_BASE, 1));
        let adr_index = self.emit(aarch64::adr(
            FN_PTR,
            ((ENTRY_BASE - 7) * 4) as i32,
        ));
        debug_assert_eq!(adr_index, 7);
        self.emit(aarch64::lsl_imm(ENTRY_TMP, 2, 2));
        self.emit(aarch64::add_reg(FN_PTR, FN_PTR, ENTRY_TMP));
        self.emit(aarch64::br(FN_PTR));
        debug_assert_eq!(self.code.len(), ENTRY_BASE);
    }

    /// Program epilogue: reverse of the prologue saves.
    fn emit_epilogue(&mut self) {
        self.emit(aarch64::ldp(MEM_BASE, REG_BASE, SP, 0));
        self.emit(aarch64::add_imm(SP, SP, 16));
        self.emit(aarch64::ldp(29, 30, SP, 0));
        self.emit(aarch64::add_imm(SP, SP, 16));
        self.emit(aarch64::ret());
    }

    /// Frame setup at call-label heads.
    fn emit_func_prologue(&mut self) {
        self.emit(aarch64::sub_imm(SP, SP, 16));
        self.emit(aarch64::stp(29, 30, SP, 0));
        self.emit(aarch64::add_imm(29, SP, 0));
    }

    /// Frame teardown emitted by RET before the return itself.
    fn emit_func_epilogue(&mut self) {
        self.emit(aarch64::ldp(29, 30, SP, 0));
        self.emit(aarch64::add_imm(SP, SP, 16));
    }

    /// Host-call bridge: materialize the function pointer, marshal up
    /// to four operands into x0..x3 in source order, call, optionally
    /// store the return value. An `Addr` argument becomes a MOVZ
    /// placeholder resolved by the fixup pass to a thread entry.
    fn emit_host_call(
        &mut self,
        fn_ptr: u64,
        args: &[&Operand],
        ret: Option<&Operand>,
        insn: &Instruction,
    ) -> Result<(), TranslateError> {
        debug_assert!(args.len() <= 4);
        self.emit_load_imm64_fixed(FN_PTR, fn_ptr);
        for (i, operand) in args.iter().enumerate() {
            let dst = i as u8;
            if let Operand::Addr(target) = **operand {
                let index = self.emit(aarch64::movz(dst, 0, 0));
                self.fixups.push(Fixup { index, target });
            } else {
                self.emit_load_operand(dst, operand);
            }
        }
        self.emit(aarch64::blr(FN_PTR));
        if let Some(out) = ret {
            self.emit_store_operand(0, out, insn)?;
        }
        Ok(())
    }

    fn mismatch(&self, insn: &Instruction) -> TranslateError {
        TranslateError::OperandMismatch {
            op: insn.op,
            bit_offset: insn.bit_offset,
        }
    }

    /// A data operand is a register or memory reference.
    fn data<'b>(
        &self,
        insn: &Instruction,
        operand: &'b Operand,
    ) -> Result<&'b Operand, TranslateError> {
        match operand {
            Operand::Reg(_) | Operand::Mem { .. } => Ok(operand),
            _ => Err(self.mismatch(insn)),
        }
    }

    // -- Phase B ------------------------------------------------

    fn lower(&mut self, insn: &Instruction) -> Result<(), TranslateError> {
        let host = self.host;
        match insn.op {
            Op::LoadConst => {
                let [Operand::Const(v), dst] = insn.operands.as_slice() else {
                    return Err(self.mismatch(insn));
                };
                let dst = *self.data(insn, dst)?;
                self.emit_load_imm64(T0, *v as u64);
                self.emit_store_operand(T0, &dst, insn)?;
            }
            Op::Mov => {
                let [src, dst] = insn.operands.as_slice() else {
                    return Err(self.mismatch(insn));
                };
                let (src, dst) = (*self.data(insn, src)?, *self.data(insn, dst)?);
                self.emit_load_operand(T0, &src);
                self.emit_store_operand(T0, &dst, insn)?;
            }
            Op::Add | Op::Sub | Op::Mul | Op::Div => {
                let (a, b, dst) = self.three_data(insn)?;
                self.emit_load_operand(T0, &a);
                self.emit_load_operand(T1, &b);
                let word = match insn.op {
                    Op::Add => aarch64::add_reg(T0, T0, T1),
                    Op::Sub => aarch64::sub_reg(T0, T0, T1),
                    Op::Mul => aarch64::mul(T0, T0, T1),
                    _ => aarch64::sdiv(T0, T0, T1),
                };
                self.emit(word);
                self.emit_store_operand(T0, &dst, insn)?;
            }
            Op::Mod => {
                // Unsigned division followed by multiply-subtract:
                // T0 = T0 - (T0 / T1) * T1.
                let (a, b, dst) = self.three_data(insn)?;
                self.emit_load_operand(T0, &a);
                self.emit_load_operand(T1, &b);
                self.emit(aarch64::udiv(T2, T0, T1));
                self.emit(aarch64::msub(T0, T2, T1, T0));
                self.emit_store_operand(T0, &dst, insn)?;
            }
            Op::Compare => {
                // Subtract, then signum of the difference.
                let (a, b, dst) = self.three_data(insn)?;
                self.emit_load_operand(T0, &a);
                self.emit_load_operand(T1, &b);
                self.emit(aarch64::sub_reg(T0, T0, T1));
                self.emit(aarch64::cmp(T0, aarch64::ZR));
                self.emit(aarch64::cset(T1, Cond::Gt));
                self.emit(aarch64::cmp(T0, aarch64::ZR));
                self.emit(aarch64::cset(T2, Cond::Lt));
                self.emit(aarch64::sub_reg(T0, T1, T2));
                self.emit_store_operand(T0, &dst, insn)?;
            }
            Op::Jump => {
                let [Operand::Addr(target)] = insn.operands.as_slice() else {
                    return Err(self.mismatch(insn));
                };
                let target = *target;
                let index = self.emit(aarch64::b(0));
                self.fixups.push(Fixup { index, target });
            }
            Op::JumpEq => {
                let [Operand::Addr(target), a, b] = insn.operands.as_slice() else {
                    return Err(self.mismatch(insn));
                };
                let target = *target;
                let (a, b) = (*self.data(insn, a)?, *self.data(insn, b)?);
                self.emit_load_operand(T0, &a);
                self.emit_load_operand(T1, &b);
                self.emit(aarch64::cmp(T0, T1));
                let index = self.emit(aarch64::b_cond(Cond::Eq, 0));
                self.fixups.push(Fixup { index, target });
            }
            Op::Call => {
                let [Operand::Addr(target)] = insn.operands.as_slice() else {
                    return Err(self.mismatch(insn));
                };
                let target = *target;
                let index = self.emit(aarch64::bl(0));
                self.fixups.push(Fixup { index, target });
            }
            Op::Ret => {
                if !insn.operands.is_empty() {
                    return Err(self.mismatch(insn));
                }
                self.emit_func_epilogue();
                self.emit(aarch64::ret());
            }
            Op::Hlt => {
                if !insn.operands.is_empty() {
                    return Err(self.mismatch(insn));
                }
                self.emit_host_call(host.terminate as usize as u64, &[], None, insn)?;
            }
            Op::ConsoleRead => {
                let [out] = insn.operands.as_slice() else {
                    return Err(self.mismatch(insn));
                };
                let out = *self.data(insn, out)?;
                self.emit_host_call(
                    host.read_value as usize as u64,
                    &[],
                    Some(&out),
                    insn,
                )?;
            }
            Op::ConsoleWrite | Op::JoinThread | Op::Sleep | Op::Lock | Op::Unlock => {
                let [arg] = insn.operands.as_slice() else {
                    return Err(self.mismatch(insn));
                };
                let arg = *self.data(insn, arg)?;
                let fn_ptr = match insn.op {
                    Op::ConsoleWrite => host.print_value as usize as u64,
                    Op::JoinThread => host.thread_join as usize as u64,
                    Op::Sleep => host.thread_sleep as usize as u64,
                    Op::Lock => host.thread_lock as usize as u64,
                    _ => host.thread_unlock as usize as u64,
                };
                self.emit_host_call(fn_ptr, &[&arg], None, insn)?;
            }
            Op::CreateThread => {
                let [entry @ Operand::Addr(_), out] = insn.operands.as_slice() else {
                    return Err(self.mismatch(insn));
                };
                let (entry, out) = (*entry, *self.data(insn, out)?);
                self.emit_host_call(
                    host.thread_create as usize as u64,
                    &[&entry],
                    Some(&out),
                    insn,
                )?;
            }
            Op::Read => {
                let [ofs, len, addr, out] = insn.operands.as_slice() else {
                    return Err(self.mismatch(insn));
                };
                let (ofs, len, addr, out) = (
                    *self.data(insn, ofs)?,
                    *self.data(insn, len)?,
                    *self.data(insn, addr)?,
                    *self.data(insn, out)?,
                );
                self.emit_host_call(
                    host.file_read as usize as u64,
                    &[&ofs, &len, &addr],
                    Some(&out),
                    insn,
                )?;
            }
            Op::Write => {
                let [ofs, len, addr] = insn.operands.as_slice() else {
                    return Err(self.mismatch(insn));
                };
                let (ofs, len, addr) = (
                    *self.data(insn, ofs)?,
                    *self.data(insn, len)?,
                    *self.data(insn, addr)?,
                );
                self.emit_host_call(
                    host.file_write as usize as u64,
                    &[&ofs, &len, &addr],
                    None,
                    insn,
                )?;
            }
        }
        Ok(())
    }

    fn three_data(
        &self,
        insn: &Instruction,
    ) -> Result<(Operand, Operand, Operand), TranslateError> {
        let [a, b, c] = insn.operands.as_slice() else {
            return Err(self.mismatch(insn));
        };
        Ok((
            *self.data(insn, a)?,
            *self.data(insn, b)?,
            *self.data(insn, c)?,
        ))
    }

    // -- Phase C ------------------------------------------------

    fn apply_fixups(&mut self) -> Result<(), TranslateError> {
        let fixups = std::mem::take(&mut self.fixups);
        for fixup in &fixups {
            let Some(&target_index) = self.map.get(&fixup.target) else {
                return Err(TranslateError::MissingTarget(fixup.target));
            };
            let word = self.code[fixup.index];
            let Some(kind) = PatchKind::of(word) else {
                return Err(TranslateError::BadPatchSite {
                    index: fixup.index,
                    word,
                });
            };
            let patched = match kind {
                PatchKind::CondBranch | PatchKind::Branch | PatchKind::BranchLink => {
                    let delta = target_index as i64 - fixup.index as i64;
                    let (lo, hi) = kind.branch_range().expect("branch kind has a range");
                    if delta < lo || delta > hi {
                        return Err(TranslateError::BranchOutOfRange {
                            index: fixup.index,
                            target: target_index,
                        });
                    }
                    if kind == PatchKind::CondBranch {
                        aarch64::patch_b_cond(word, delta as i32)
                    } else {
                        aarch64::patch_b(word, delta as i32)
                    }
                }
                PatchKind::WideMove => {
                    let entry = target_index as i64 - ENTRY_BASE as i64;
                    if !(0..=0xFFFF).contains(&entry) {
                        return Err(TranslateError::EntryOutOfRange {
                            target: fixup.target,
                            index: target_index,
                        });
                    }
                    aarch64::patch_movz_imm16(word, entry as u16)
                }
            };
            self.code[fixup.index] = patched;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evm2_frontend::{assemble, AsmInsn, AsmOperand};

    // Host stubs: the translator only embeds the addresses.
    extern "C" fn stub_print(_: u64) {}
    extern "C" fn stub_read() -> u64 {
        0
    }
    extern "C" fn stub_terminate() {}
    extern "C" fn stub_create(_: u64) -> u64 {
        0
    }
    extern "C" fn stub_u64(_: u64) {}
    extern "C" fn stub_file_read(_: u64, _: u64, _: u64) -> u64 {
        0
    }
    extern "C" fn stub_file_write(_: u64, _: u64, _: u64) {}

    fn host() -> HostInterface {
        HostInterface {
            print_value: stub_print,
            read_value: stub_read,
            terminate: stub_terminate,
            thread_create: stub_create,
            thread_join: stub_u64,
            thread_sleep: stub_u64,
            thread_lock: stub_u64,
            thread_unlock: stub_u64,
            file_read: stub_file_read,
            file_write: stub_file_write,
        }
    }

    fn reg(r: u8) -> AsmOperand {
        AsmOperand::Reg(r)
    }

    fn fabricated(op: Op, operands: Vec<Operand>, bit_offset: u32) -> Instruction {
        Instruction {
            op,
            bit_offset,
            operands,
        }
    }

    #[test]
    fn test_prologue_layout() {
        let h = host();
        let code = translate(&[], &h).unwrap();
        // Prologue, epilogue, nothing else.
        assert_eq!(code.words().len(), ENTRY_BASE + 5);
        assert_eq!(code.words()[0], aarch64::sub_imm(SP, SP, 16));
        assert_eq!(code.words()[ENTRY_BASE - 1], aarch64::br(FN_PTR));
        assert_eq!(*code.words().last().unwrap(), aarch64::ret());
    }

    #[test]
    fn test_first_instruction_lands_on_entry_base() {
        let h = host();
        let prog = assemble(&[AsmInsn::new(Op::Hlt, vec![])]);
        let code = translate(&prog, &h).unwrap();
        assert_eq!(code.native_index(0), Some(ENTRY_BASE));
    }

    #[test]
    fn test_nop_after_every_instruction() {
        let h = host();
        let prog = assemble(&[
            AsmInsn::new(Op::LoadConst, vec![AsmOperand::Const(5), reg(0)]),
            AsmInsn::new(Op::Add, vec![reg(0), reg(0), reg(1)]),
            AsmInsn::new(Op::Hlt, vec![]),
        ]);
        let code = translate(&prog, &h).unwrap();
        let nops = code
            .words()
            .iter()
            .filter(|w| **w == aarch64::nop())
            .count();
        assert_eq!(nops, 3);
    }

    #[test]
    fn test_backward_jump_is_patched() {
        let h = host();
        let prog = assemble(&[
            AsmInsn::new(Op::LoadConst, vec![AsmOperand::Const(1), reg(0)]),
            AsmInsn::new(Op::Jump, vec![AsmOperand::Label(0)]),
        ]);
        let code = translate(&prog, &h).unwrap();
        let target = code.native_index(prog[0].bit_offset).unwrap();
        // The jump placeholder is the word right before the final NOP
        // of the second instruction.
        let jump_index = code.words().len() - 5 - 2; // epilogue + nop + branch
        let delta = target as i64 - jump_index as i64;
        assert_eq!(code.words()[jump_index], aarch64::b(delta as i32));
    }

    #[test]
    fn test_forward_jumpeq_is_patched() {
        let h = host();
        let prog = assemble(&[
            AsmInsn::new(Op::JumpEq, vec![AsmOperand::Label(2), reg(0), reg(1)]),
            AsmInsn::new(Op::LoadConst, vec![AsmOperand::Const(9), reg(2)]),
            AsmInsn::new(Op::Hlt, vec![]),
        ]);
        let code = translate(&prog, &h).unwrap();
        let target = code.native_index(prog[2].bit_offset).unwrap();
        let words = code.words();
        let index = words
            .iter()
            .position(|w| PatchKind::of(*w) == Some(PatchKind::CondBranch))
            .unwrap();
        let delta = (target - index) as i32;
        assert_eq!(words[index], aarch64::b_cond(Cond::Eq, delta));
    }

    #[test]
    fn test_call_target_gets_function_prologue() {
        let h = host();
        let prog = assemble(&[
            AsmInsn::new(Op::Call, vec![AsmOperand::Label(2)]),
            AsmInsn::new(Op::Hlt, vec![]),
            AsmInsn::new(Op::Ret, vec![]),
        ]);
        let code = translate(&prog, &h).unwrap();
        let target = code.native_index(prog[2].bit_offset).unwrap();
        // Call labels start with the frame setup.
        assert_eq!(code.words()[target], aarch64::sub_imm(SP, SP, 16));
        assert_eq!(code.words()[target + 1], aarch64::stp(29, 30, SP, 0));
    }

    #[test]
    fn test_create_thread_entry_immediate() {
        let h = host();
        let prog = assemble(&[
            AsmInsn::new(Op::CreateThread, vec![AsmOperand::Label(2), reg(0)]),
            AsmInsn::new(Op::Hlt, vec![]),
            AsmInsn::new(Op::Hlt, vec![]),
        ]);
        let code = translate(&prog, &h).unwrap();
        let target = code.native_index(prog[2].bit_offset).unwrap();
        let entry = (target - ENTRY_BASE) as u16;
        // The patched placeholder is a movz x0 with the resolved
        // entry offset.
        assert!(code
            .words()
            .contains(&aarch64::movz(0, entry, 0)));
    }

    #[test]
    fn test_label_collision_rejected() {
        let h = host();
        // Same offset as both a jump and a call target.
        let insns = vec![
            fabricated(Op::Jump, vec![Operand::Addr(100)], 0),
            fabricated(Op::Call, vec![Operand::Addr(100)], 37),
            fabricated(Op::Ret, vec![], 100),
        ];
        assert!(matches!(
            translate(&insns, &h),
            Err(TranslateError::LabelCollision(100))
        ));
    }

    #[test]
    fn test_missing_target_rejected() {
        let h = host();
        let insns = vec![fabricated(Op::Jump, vec![Operand::Addr(999)], 0)];
        assert!(matches!(
            translate(&insns, &h),
            Err(TranslateError::MissingTarget(999))
        ));
    }

    #[test]
    fn test_operand_mismatch_rejected() {
        let h = host();
        // ADD with a constant data operand.
        let insns = vec![fabricated(
            Op::Add,
            vec![Operand::Const(1), Operand::Reg(0), Operand::Reg(1)],
            0,
        )];
        assert!(matches!(
            translate(&insns, &h),
            Err(TranslateError::OperandMismatch { op: Op::Add, .. })
        ));
        // JUMP without an address operand.
        let insns = vec![fabricated(Op::Jump, vec![Operand::Reg(0)], 0)];
        assert!(matches!(
            translate(&insns, &h),
            Err(TranslateError::OperandMismatch { op: Op::Jump, .. })
        ));
    }

    #[test]
    fn test_translation_is_deterministic() {
        let h = host();
        let prog = assemble(&[
            AsmInsn::new(Op::LoadConst, vec![AsmOperand::Const(3), reg(1)]),
            AsmInsn::new(Op::Compare, vec![reg(0), reg(1), reg(2)]),
            AsmInsn::new(Op::JumpEq, vec![AsmOperand::Label(0), reg(2), reg(3)]),
            AsmInsn::new(
                Op::Mov,
                vec![reg(2), AsmOperand::Mem { reg: 4, size: 2 }],
            ),
            AsmInsn::new(Op::Hlt, vec![]),
        ]);
        let a = translate(&prog, &h).unwrap();
        let b = translate(&prog, &h).unwrap();
        assert_eq!(a.words(), b.words());
    }

    #[test]
    fn test_entry_immediate_overflow_diagnosed() {
        let h = host();
        // Enough padding instructions to push the thread entry past
        // the 16-bit immediate slot. Each RET lowers to 3 words plus
        // the NOP.
        let mut insns = vec![fabricated(
            Op::CreateThread,
            vec![Operand::Addr(u32::MAX), Operand::Reg(0)],
            0,
        )];
        for i in 1..=17_000u32 {
            insns.push(fabricated(Op::Ret, vec![], i));
        }
        insns.push(fabricated(Op::Hlt, vec![], u32::MAX));
        assert!(matches!(
            translate(&insns, &h),
            Err(TranslateError::EntryOutOfRange { .. })
        ));
    }

    #[test]
    fn test_cond_branch_range_diagnosed() {
        let h = host();
        // A conditional branch across ~300k words exceeds the 19-bit
        // instruction-relative range. HLT lowers to 6 words.
        let mut insns = vec![fabricated(
            Op::JumpEq,
            vec![Operand::Addr(u32::MAX), Operand::Reg(0), Operand::Reg(1)],
            0,
        )];
        for i in 1..=50_000u32 {
            insns.push(fabricated(Op::Hlt, vec![], i));
        }
        insns.push(fabricated(Op::Ret, vec![], u32::MAX));
        assert!(matches!(
            translate(&insns, &h),
            Err(TranslateError::BranchOutOfRange { .. })
        ));
    }
}
