//! Bytecode instruction set, instruction words and disassembly.
//!
//! Every instruction is one fixed-width word: the low 8 bits hold the opcode
//! tag and bits 8..40 hold a signed 32-bit operand (jump or call target, pushed
//! constant, parameter index, or swap depth, depending on the opcode).

use crate::Error;
use crate::ast::Integer;
use std::collections::BTreeMap;
use std::fmt;

/// Bytecode operations of the stack VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Add = 0,
    Sub = 1,
    GreaterOrEqual = 2,
    GreaterThan = 3,
    LessOrEqual = 4,
    LessThan = 5,
    /// Push fp and the return address, then jump to the operand
    Call = 6,
    /// Pop the result, unwind the frame, leave the result in the saved-fp cell
    Return = 7,
    Jump = 8,
    /// Pop a value; jump to the operand if it is zero
    JumpIfZero = 9,
    Push = 10,
    Pop = 11,
    /// Exchange the top of stack with the cell `operand` positions below it
    Swap = 12,
    /// Push `stack[fp - operand - 2]`
    LoadParam = 13,
    /// Write the top of stack without popping it
    Print = 14,
    Halt = 15,
}

impl Opcode {
    const ALL: [Opcode; 16] = [
        Opcode::Add,
        Opcode::Sub,
        Opcode::GreaterOrEqual,
        Opcode::GreaterThan,
        Opcode::LessOrEqual,
        Opcode::LessThan,
        Opcode::Call,
        Opcode::Return,
        Opcode::Jump,
        Opcode::JumpIfZero,
        Opcode::Push,
        Opcode::Pop,
        Opcode::Swap,
        Opcode::LoadParam,
        Opcode::Print,
        Opcode::Halt,
    ];

    /// Whether the operand field carries meaning for this opcode
    pub fn has_operand(self) -> bool {
        matches!(
            self,
            Opcode::Call
                | Opcode::Jump
                | Opcode::JumpIfZero
                | Opcode::Push
                | Opcode::Swap
                | Opcode::LoadParam
        )
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::GreaterOrEqual => "gte",
            Opcode::GreaterThan => "gt",
            Opcode::LessOrEqual => "lte",
            Opcode::LessThan => "lt",
            Opcode::Call => "call",
            Opcode::Return => "ret",
            Opcode::Jump => "jump",
            Opcode::JumpIfZero => "jump-zero",
            Opcode::Push => "push",
            Opcode::Pop => "pop",
            Opcode::Swap => "swap",
            Opcode::LoadParam => "param",
            Opcode::Print => "print",
            Opcode::Halt => "halt",
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, u8> {
        Opcode::ALL.get(usize::from(tag)).copied().ok_or(tag)
    }
}

/// One encoded instruction word
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Instruction(u64);

impl Instruction {
    const OPCODE_MASK: u64 = 0xFF;
    const OPERAND_SHIFT: u32 = 8;

    pub fn new(opcode: Opcode, operand: Integer) -> Self {
        // Reinterpret as u32 so negative operands do not smear into the upper bits
        Instruction((u64::from(operand as u32) << Self::OPERAND_SHIFT) | opcode as u64)
    }

    /// Instruction whose operand is unused (encoded as zero)
    pub fn bare(opcode: Opcode) -> Self {
        Self::new(opcode, 0)
    }

    /// Rebuild an instruction from a raw word, e.g. one loaded from storage
    pub fn from_word(word: u64) -> Self {
        Instruction(word)
    }

    pub fn word(self) -> u64 {
        self.0
    }

    /// Decode the opcode tag; unknown tags are returned as-is
    pub fn opcode(self) -> Result<Opcode, u8> {
        Opcode::try_from((self.0 & Self::OPCODE_MASK) as u8)
    }

    pub fn operand(self) -> Integer {
        (self.0 >> Self::OPERAND_SHIFT) as u32 as Integer
    }

    /// Same opcode with a new operand (used for backpatching)
    pub fn with_operand(self, operand: Integer) -> Self {
        Instruction(
            (u64::from(operand as u32) << Self::OPERAND_SHIFT) | (self.0 & Self::OPCODE_MASK),
        )
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instruction({self})")
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode() {
            Ok(op) if op.has_operand() => write!(f, "{} {}", op.mnemonic(), self.operand()),
            Ok(op) => write!(f, "{}", op.mnemonic()),
            Err(tag) => write!(f, "Unknown instruction: {tag}, arg: {}", self.operand()),
        }
    }
}

/// A function laid out in the instruction stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionInfo {
    /// Index of the function's first instruction
    pub address: Integer,
    /// Number of declared parameters
    pub arity: usize,
}

/// Output of the compiler: instructions plus the resolved function table
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub code: Vec<Instruction>,
    /// Entry address and arity of every top-level function
    pub functions: BTreeMap<String, FunctionInfo>,
    /// Entry address of `main`
    pub entry: Integer,
}

impl Program {
    /// Entry address of a named function
    pub fn address_of(&self, name: &str) -> Result<Integer, Error> {
        self.functions
            .get(name)
            .map(|info| info.address)
            .ok_or_else(|| Error::UnknownFunction(name.to_owned()))
    }

    /// Name of the function starting at `address`, if any
    pub fn label_at(&self, address: usize) -> Option<&str> {
        self.functions
            .iter()
            .find(|(_, info)| usize::try_from(info.address).ok() == Some(address))
            .map(|(name, _)| name.as_str())
    }
}

/// Render the program one instruction per line: index, label, mnemonic
pub fn disassemble(program: &Program) -> String {
    let mut lines = String::new();
    for (i, instruction) in program.code.iter().enumerate() {
        let label = program.label_at(i).unwrap_or("");
        lines.push_str(&format!("{i}\t\t{label}\t\t{instruction}\n"));
    }
    lines
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    #[test]
    fn test_instruction_layout() {
        let cases = vec![
            (Instruction::new(Opcode::Push, 42), Opcode::Push, 42, (42u64 << 8) | 10),
            (Instruction::bare(Opcode::Add), Opcode::Add, 0, 0),
            (Instruction::bare(Opcode::Halt), Opcode::Halt, 0, 15),
            (
                Instruction::new(Opcode::Jump, -1),
                Opcode::Jump,
                -1,
                (0xFFFF_FFFFu64 << 8) | 8,
            ),
            (
                Instruction::new(Opcode::Call, i32::MIN),
                Opcode::Call,
                i32::MIN,
                (0x8000_0000u64 << 8) | 6,
            ),
        ];
        for (instruction, opcode, operand, word) in cases {
            assert_eq!(instruction.opcode().unwrap(), opcode);
            assert_eq!(instruction.operand(), operand);
            assert_eq!(instruction.word(), word, "{instruction}");
        }
    }

    #[test]
    fn test_backpatch_keeps_opcode() {
        let placeholder = Instruction::new(Opcode::JumpIfZero, 0);
        let patched = placeholder.with_operand(17);
        assert_eq!(patched.opcode().unwrap(), Opcode::JumpIfZero);
        assert_eq!(patched.operand(), 17);

        let repatched = Instruction::new(Opcode::Swap, -3).with_operand(2);
        assert_eq!(repatched, Instruction::new(Opcode::Swap, 2));
    }

    #[test]
    fn test_unknown_opcode_tag() {
        let bogus = Instruction::from_word(0xFF);
        assert_eq!(bogus.opcode(), Err(0xFF));
        assert_eq!(format!("{bogus}"), "Unknown instruction: 255, arg: 0");
        assert_eq!(Opcode::try_from(16), Err(16));
        assert_eq!(Opcode::try_from(13), Ok(Opcode::LoadParam));
    }

    #[test]
    fn test_disassemble_with_labels() {
        let mut functions = BTreeMap::new();
        functions.insert("main".to_owned(), FunctionInfo { address: 0, arity: 0 });
        let program = Program {
            code: vec![
                Instruction::new(Opcode::Push, 7),
                Instruction::bare(Opcode::Print),
                Instruction::new(Opcode::JumpIfZero, 5),
                Instruction::new(Opcode::LoadParam, 1),
                Instruction::bare(Opcode::Return),
            ],
            functions,
            entry: 0,
        };

        let text = disassemble(&program);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "0\t\tmain\t\tpush 7",
                "1\t\t\t\tprint",
                "2\t\t\t\tjump-zero 5",
                "3\t\t\t\tparam 1",
                "4\t\t\t\tret",
            ]
        );
        assert_eq!(program.address_of("main").unwrap(), 0);
        assert_eq!(
            program.address_of("missing"),
            Err(Error::UnknownFunction("missing".into()))
        );
    }
}
