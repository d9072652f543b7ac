//! Bytecode chunks
//!
//! A chunk is the compiled body of one function: a flat opcode buffer, its
//! constant pool, and a line table with one entry per code byte so any
//! instruction can be traced back to source. Multi-byte operands are
//! big-endian 16-bit values; `CONSTANT` keeps a one-byte fast path for the
//! first 256 constants.

use crate::heap::Heap;
use crate::object::Operator;
use crate::value::Value;

/// Hard limit on constants per chunk; indices are 16 bits on the wire.
pub const MAX_CONSTANTS: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Constant,
    ConstantLong,
    Nil,
    True,
    False,
    Negate,
    Not,
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    FloorDivide,
    Power,
    DotDot,
    SubscriptGet,
    SubscriptSet,
    Pop,
    GetLocal,
    SetLocal,
    GetGlobal,
    SetGlobal,
    GetUpvalue,
    SetUpvalue,
    CloseUpvalue,
    Jump,
    JumpIfFalse,
    Loop,
    CreateList,
    AppendList,
    Closure,
    Call0,
    Call1,
    Call2,
    Call3,
    Call4,
    Call5,
    Call6,
    Call7,
    Call8,
    Call9,
    Call10,
    Call11,
    Call12,
    Call13,
    Call14,
    Call15,
    Call16,
    Return,
    Class,
    Inherit,
    DefineField,
    DefineMethod,
    DefineStatic,
    DefineConstructor,
    GetField,
    SetField,
    Invoke,
    Is,
}

impl OpCode {
    pub fn from_byte(byte: u8) -> OpCode {
        debug_assert!(byte <= OpCode::Is as u8, "invalid opcode {byte}");
        // The enum is a closed, dense u8 range; the compiler is the only
        // producer of code bytes.
        unsafe { std::mem::transmute::<u8, OpCode>(byte) }
    }

    /// The CALL opcode carrying `arity` in its name.
    pub fn call(arity: u8) -> OpCode {
        debug_assert!(arity <= 16);
        OpCode::from_byte(OpCode::Call0 as u8 + arity)
    }

    pub fn call_arity(self) -> Option<u8> {
        let byte = self as u8;
        if (OpCode::Call0 as u8..=OpCode::Call16 as u8).contains(&byte) {
            Some(byte - OpCode::Call0 as u8)
        } else {
            None
        }
    }

    /// The operator slot this opcode dispatches through, if any.
    pub fn operator(self) -> Option<Operator> {
        match self {
            OpCode::Add => Some(Operator::Add),
            OpCode::Subtract => Some(Operator::Subtract),
            OpCode::Multiply => Some(Operator::Multiply),
            OpCode::Divide => Some(Operator::Divide),
            OpCode::FloorDivide => Some(Operator::FloorDivide),
            OpCode::Power => Some(Operator::Power),
            OpCode::DotDot => Some(Operator::DotDot),
            OpCode::SubscriptGet => Some(Operator::SubscriptGet),
            OpCode::SubscriptSet => Some(Operator::SubscriptSet),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Constant => "OP_CONSTANT",
            OpCode::ConstantLong => "OP_CONSTANT_LONG",
            OpCode::Nil => "OP_NIL",
            OpCode::True => "OP_TRUE",
            OpCode::False => "OP_FALSE",
            OpCode::Negate => "OP_NEGATE",
            OpCode::Not => "OP_NOT",
            OpCode::Equal => "OP_EQUAL",
            OpCode::Greater => "OP_GREATER",
            OpCode::Less => "OP_LESS",
            OpCode::Add => "OP_ADD",
            OpCode::Subtract => "OP_SUBTRACT",
            OpCode::Multiply => "OP_MULTIPLY",
            OpCode::Divide => "OP_DIVIDE",
            OpCode::FloorDivide => "OP_FLOOR_DIVIDE",
            OpCode::Power => "OP_POWER",
            OpCode::DotDot => "OP_DOTDOT",
            OpCode::SubscriptGet => "OP_SUBSCRIPT_GET",
            OpCode::SubscriptSet => "OP_SUBSCRIPT_SET",
            OpCode::Pop => "OP_POP",
            OpCode::GetLocal => "OP_GET_LOCAL",
            OpCode::SetLocal => "OP_SET_LOCAL",
            OpCode::GetGlobal => "OP_GET_GLOBAL",
            OpCode::SetGlobal => "OP_SET_GLOBAL",
            OpCode::GetUpvalue => "OP_GET_UPVALUE",
            OpCode::SetUpvalue => "OP_SET_UPVALUE",
            OpCode::CloseUpvalue => "OP_CLOSE_UPVALUE",
            OpCode::Jump => "OP_JUMP",
            OpCode::JumpIfFalse => "OP_JUMP_IF_FALSE",
            OpCode::Loop => "OP_LOOP",
            OpCode::CreateList => "OP_CREATE_LIST",
            OpCode::AppendList => "OP_APPEND_LIST",
            OpCode::Closure => "OP_CLOSURE",
            OpCode::Call0 => "OP_CALL_0",
            OpCode::Call1 => "OP_CALL_1",
            OpCode::Call2 => "OP_CALL_2",
            OpCode::Call3 => "OP_CALL_3",
            OpCode::Call4 => "OP_CALL_4",
            OpCode::Call5 => "OP_CALL_5",
            OpCode::Call6 => "OP_CALL_6",
            OpCode::Call7 => "OP_CALL_7",
            OpCode::Call8 => "OP_CALL_8",
            OpCode::Call9 => "OP_CALL_9",
            OpCode::Call10 => "OP_CALL_10",
            OpCode::Call11 => "OP_CALL_11",
            OpCode::Call12 => "OP_CALL_12",
            OpCode::Call13 => "OP_CALL_13",
            OpCode::Call14 => "OP_CALL_14",
            OpCode::Call15 => "OP_CALL_15",
            OpCode::Call16 => "OP_CALL_16",
            OpCode::Return => "OP_RETURN",
            OpCode::Class => "OP_CLASS",
            OpCode::Inherit => "OP_INHERIT",
            OpCode::DefineField => "OP_DEFINE_FIELD",
            OpCode::DefineMethod => "OP_DEFINE_METHOD",
            OpCode::DefineStatic => "OP_DEFINE_STATIC",
            OpCode::DefineConstructor => "OP_DEFINE_CONSTRUCTOR",
            OpCode::GetField => "OP_GET_FIELD",
            OpCode::SetField => "OP_SET_FIELD",
            OpCode::Invoke => "OP_INVOKE",
            OpCode::Is => "OP_IS",
        }
    }
}

#[derive(Debug, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    /// Source line per code byte; always the same length as `code`.
    pub lines: Vec<u32>,
    pub constants: Vec<Value>,
}

impl Chunk {
    pub fn new() -> Chunk {
        Chunk::default()
    }

    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write(op as u8, line);
    }

    pub fn write_short(&mut self, value: u16, line: u32) {
        self.write((value >> 8) as u8, line);
        self.write((value & 0xff) as u8, line);
    }

    /// Append a constant and return its pool index. The compiler reports
    /// an error when the pool outgrows the 16-bit operand.
    pub fn add_constant(&mut self, value: Value) -> Option<u16> {
        if self.constants.len() >= MAX_CONSTANTS {
            return None;
        }
        self.constants.push(value);
        Some((self.constants.len() - 1) as u16)
    }

    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(0)
    }

    pub(crate) fn byte_size(&self) -> usize {
        self.code.capacity()
            + self.lines.capacity() * std::mem::size_of::<u32>()
            + self.constants.capacity() * std::mem::size_of::<Value>()
    }

    fn read_short(&self, offset: usize) -> u16 {
        (self.code[offset] as u16) << 8 | self.code[offset + 1] as u16
    }

    pub fn disassemble(&self, heap: &Heap, name: &str) -> String {
        let mut out = format!("== {name} ==\n");
        let mut offset = 0;
        while offset < self.code.len() {
            offset = self.disassemble_instruction(heap, offset, &mut out);
        }
        out
    }

    /// Render one instruction into `out`, returning the next offset.
    pub fn disassemble_instruction(&self, heap: &Heap, offset: usize, out: &mut String) -> usize {
        use std::fmt::Write;

        let _ = write!(out, "{offset:06} ");
        let op = OpCode::from_byte(self.code[offset]);
        match op {
            OpCode::Constant => {
                let constant = self.code[offset + 1] as u16;
                let value = self.constants[constant as usize];
                let _ = writeln!(out, "{:<16} {:4} '{}'", op.name(), constant, heap.format_value(value));
                offset + 2
            }
            OpCode::ConstantLong
            | OpCode::Class
            | OpCode::DefineField
            | OpCode::DefineMethod
            | OpCode::DefineStatic
            | OpCode::DefineConstructor
            | OpCode::GetField
            | OpCode::SetField => {
                let constant = self.read_short(offset + 1);
                let value = self.constants[constant as usize];
                let _ = writeln!(out, "{:<16} {:4} '{}'", op.name(), constant, heap.format_value(value));
                offset + 3
            }
            OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue => {
                let slot = self.read_short(offset + 1);
                let _ = writeln!(out, "{:<16} {slot:4}", op.name());
                offset + 3
            }
            OpCode::Jump | OpCode::JumpIfFalse => {
                let jump = self.read_short(offset + 1) as usize;
                let _ = writeln!(out, "{:<16} {:4} -> {}", op.name(), offset, offset + 3 + jump);
                offset + 3
            }
            OpCode::Loop => {
                let jump = self.read_short(offset + 1) as usize;
                let _ = writeln!(out, "{:<16} {:4} -> {}", op.name(), offset, offset + 3 - jump);
                offset + 3
            }
            OpCode::Closure => {
                let constant = self.read_short(offset + 1);
                let value = self.constants[constant as usize];
                let _ = writeln!(out, "{:<16} {:4} '{}'", op.name(), constant, heap.format_value(value));
                let mut offset = offset + 3;
                let upvalue_count = heap.function(value.as_object()).upvalue_count;
                for _ in 0..upvalue_count {
                    let is_local = self.code[offset];
                    let index = self.code[offset + 1];
                    let _ = writeln!(
                        out,
                        "{:06}      |                  {} {}",
                        offset,
                        if is_local == 1 { "local" } else { "upvalue" },
                        index
                    );
                    offset += 2;
                }
                offset
            }
            OpCode::Invoke => {
                let constant = self.read_short(offset + 1);
                let arg_count = self.code[offset + 3];
                let value = self.constants[constant as usize];
                let _ = writeln!(
                    out,
                    "{:<16} ({arg_count} args) {:4} '{}'",
                    op.name(),
                    constant,
                    heap.format_value(value)
                );
                offset + 4
            }
            OpCode::Is => {
                let tag = self.code[offset + 1];
                let constant = self.read_short(offset + 2);
                let value = self.constants[constant as usize];
                let _ = writeln!(out, "{:<16} {tag:4} '{}'", op.name(), heap.format_value(value));
                offset + 4
            }
            _ => {
                let _ = writeln!(out, "{}", op.name());
                offset + 1
            }
        }
    }
}
