use crate::chunk::{Chunk, OpCode};
use crate::value::{as_object, format_value};

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {} ==", name);

    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset);
    }
}

/// Print one instruction and return the offset of the next one. The offsets
/// double as a dry-run decoder: starting at zero and following the returned
/// offsets lands exactly on the end of a well-formed chunk.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    print!("{:04} ", offset);
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.line_at(offset));
    }

    let instruction = chunk.code[offset];
    match OpCode::from_byte(instruction) {
        Some(op_code) => match op_code {
            OpCode::Constant
            | OpCode::Class
            | OpCode::Method
            | OpCode::DefineGlobal
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::GetProperty
            | OpCode::SetProperty
            | OpCode::GetSuper => constant_instruction(op_code, chunk, offset),
            OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::Call => byte_instruction(op_code, chunk, offset),
            OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(op_code, 1, chunk, offset),
            OpCode::Loop => jump_instruction(op_code, -1, chunk, offset),
            OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(op_code, chunk, offset),
            OpCode::Closure => closure_instruction(chunk, offset),
            _ => simple_instruction(op_code, offset),
        },
        None => {
            println!("Unknown opcode {}", instruction);
            offset + 1
        }
    }
}

fn simple_instruction(op_code: OpCode, offset: usize) -> usize {
    println!("OP_{}", op_code);
    offset + 1
}

fn constant_instruction(op_code: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1] as usize;
    println!(
        "{:<16} {:>4} '{}'",
        format!("OP_{}", op_code),
        constant,
        format_value(chunk.get_constant(constant))
    );
    offset + 2
}

fn byte_instruction(op_code: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    println!("{:<16} {:>4}", format!("OP_{}", op_code), slot);
    offset + 2
}

fn jump_instruction(op_code: OpCode, sign: i64, chunk: &Chunk, offset: usize) -> usize {
    let jump = ((chunk.code[offset + 1] as u16) << 8) | chunk.code[offset + 2] as u16;
    let target = offset as i64 + 3 + sign * jump as i64;
    println!(
        "{:<16} {:>4} -> {}",
        format!("OP_{}", op_code),
        offset,
        target
    );
    offset + 3
}

fn invoke_instruction(op_code: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1] as usize;
    let argument_count = chunk.code[offset + 2];
    println!(
        "{:<16} ({} args) {:>4} '{}'",
        format!("OP_{}", op_code),
        argument_count,
        constant,
        format_value(chunk.get_constant(constant))
    );
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize) -> usize {
    let mut offset = offset + 1;
    let constant = chunk.code[offset] as usize;
    offset += 1;
    println!(
        "{:<16} {:>4} '{}'",
        "OP_CLOSURE",
        constant,
        format_value(chunk.get_constant(constant))
    );

    // The operand stream continues with one (is_local, index) pair per
    // declared upvalue of the wrapped function.
    let function = unsafe { (*as_object(chunk.get_constant(constant))).as_function() };
    for _ in 0..function.upvalue_count {
        let is_local = chunk.code[offset];
        let index = chunk.code[offset + 1];
        println!(
            "{:04}    |                     {} {}",
            offset,
            if is_local == 1 { "local" } else { "upvalue" },
            index
        );
        offset += 2;
    }
    offset
}
