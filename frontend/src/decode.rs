//! Instruction decoder — turns the packed code section into a flat
//! instruction list.
//!
//! Decoding stops cleanly at end of stream: once no opcode prefix
//! matches (or an operand field runs out of bits) the remaining bits
//! are treated as padding and the instructions decoded so far are
//! returned.

use std::sync::Once;

use evm2_core::isa::{check_prefix_free, MAX_PREFIX_BITS, OPCODE_TABLE};
use evm2_core::{Instruction, Op, Operand};

use crate::bits::BitReader;

static PREFIX_CHECK: Once = Once::new();

/// Decode a complete code section.
pub fn decode(code: &[u8]) -> Vec<Instruction> {
    PREFIX_CHECK.call_once(|| {
        if let Err((a, b)) = check_prefix_free() {
            panic!("opcode table is not prefix-free: {a} vs {b}");
        }
    });

    let mut r = BitReader::new(code);
    let mut out = Vec::new();

    while !r.eof() {
        let bit_offset = r.pos() as u32;
        let Some(op) = read_opcode(&mut r) else {
            break;
        };
        let Some(operands) = read_operands(&mut r, op) else {
            break;
        };
        out.push(Instruction {
            op,
            bit_offset,
            operands,
        });
    }

    out
}

/// Match the growing prefix string against the opcode table.
fn read_opcode(r: &mut BitReader) -> Option<Op> {
    let mut bits = String::with_capacity(MAX_PREFIX_BITS);
    for _ in 0..MAX_PREFIX_BITS {
        let b = r.read_bit()?;
        bits.push(if b != 0 { '1' } else { '0' });
        if let Some((_, op)) = OPCODE_TABLE.iter().find(|(p, _)| *p == bits) {
            return Some(*op);
        }
    }
    None
}

/// Read a data operand: a kind bit, then for registers a 4-bit index,
/// for memory a 2-bit size code followed by a 4-bit index. All fields
/// little-endian at the bit level.
fn read_data_operand(r: &mut BitReader) -> Option<Operand> {
    if r.read_bit()? == 0 {
        let reg = r.read_bits_le(4)? as u8;
        Some(Operand::Reg(reg))
    } else {
        let size = match r.read_bits_le(2)? {
            0 => 1,
            1 => 2,
            2 => 4,
            _ => 8,
        };
        let reg = r.read_bits_le(4)? as u8;
        Some(Operand::Mem { reg, size })
    }
}

fn read_const_operand(r: &mut BitReader) -> Option<Operand> {
    Some(Operand::Const(r.read_bits_le(64)? as i64))
}

fn read_addr_operand(r: &mut BitReader) -> Option<Operand> {
    Some(Operand::Addr(r.read_bits_le(32)? as u32))
}

/// Read the operand vector for `op` per its fixed schema.
fn read_operands(r: &mut BitReader, op: Op) -> Option<Vec<Operand>> {
    let mut args = Vec::new();
    match op {
        Op::Mov => {
            args.push(read_data_operand(r)?);
            args.push(read_data_operand(r)?);
        }
        Op::LoadConst => {
            args.push(read_const_operand(r)?);
            args.push(read_data_operand(r)?);
        }
        Op::Add | Op::Sub | Op::Div | Op::Mod | Op::Mul | Op::Compare => {
            for _ in 0..3 {
                args.push(read_data_operand(r)?);
            }
        }
        Op::Jump | Op::Call => {
            args.push(read_addr_operand(r)?);
        }
        Op::JumpEq => {
            args.push(read_addr_operand(r)?);
            args.push(read_data_operand(r)?);
            args.push(read_data_operand(r)?);
        }
        Op::Read => {
            for _ in 0..4 {
                args.push(read_data_operand(r)?);
            }
        }
        Op::Write => {
            for _ in 0..3 {
                args.push(read_data_operand(r)?);
            }
        }
        Op::CreateThread => {
            args.push(read_addr_operand(r)?);
            args.push(read_data_operand(r)?);
        }
        Op::ConsoleRead
        | Op::ConsoleWrite
        | Op::JoinThread
        | Op::Sleep
        | Op::Lock
        | Op::Unlock => {
            args.push(read_data_operand(r)?);
        }
        Op::Hlt | Op::Ret => {}
    }
    Some(args)
}
