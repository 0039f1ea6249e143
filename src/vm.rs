//! Stack virtual machine executing compiled [`Program`]s.
//!
//! All state lives in one fixed-capacity array of 32-bit cells plus three
//! indices: `ip` into the code, `sp` (top of stack) and `fp` into the stack.
//! A call frame is nothing but cells on that stack:
//!
//! ```text
//!   ... | arg 0 | ... | arg n-1 | caller fp | return ip | locals ...
//!                                             ^ fp
//! ```
//!
//! Parameter `i` is read from `fp - i - 2`, counting back from the last pushed
//! argument. With two or more parameters, parameter 0 therefore binds to the
//! rightmost argument.

use crate::Error;
use crate::ast::Integer;
use crate::bytecode::{Instruction, Opcode, Program};
use crate::forms::BinaryOp;
use std::io::Write;

/// Default number of stack cells
pub const DEFAULT_STACK_CAPACITY: usize = 10240;

/// VM configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of 32-bit cells in the operand-and-frame stack
    pub stack_capacity: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            stack_capacity: DEFAULT_STACK_CAPACITY,
        }
    }
}

/// Operand-and-frame stack with the frame pointer
///
/// Call, return, swap and parameter access are pure index transformations on
/// this structure; every access is bounds-checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Stack {
    cells: Vec<Integer>,
    capacity: usize,
    fp: usize,
}

impl Stack {
    pub(crate) fn new(capacity: usize) -> Self {
        Stack {
            cells: Vec::with_capacity(capacity),
            capacity,
            fp: 0,
        }
    }

    /// Number of live cells (`sp + 1`)
    pub(crate) fn depth(&self) -> usize {
        self.cells.len()
    }

    pub(crate) fn fp(&self) -> usize {
        self.fp
    }

    pub(crate) fn push(&mut self, value: Integer) -> Result<(), Error> {
        if self.cells.len() >= self.capacity {
            return Err(Error::StackOverflow {
                capacity: self.capacity,
            });
        }
        self.cells.push(value);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Result<Integer, Error> {
        self.cells
            .pop()
            .ok_or_else(|| Error::VmFault("stack underflow".to_owned()))
    }

    pub(crate) fn top(&self) -> Result<Integer, Error> {
        self.cells
            .last()
            .copied()
            .ok_or_else(|| Error::VmFault("read from empty stack".to_owned()))
    }

    fn cell(&self, index: usize) -> Result<Integer, Error> {
        self.cells
            .get(index)
            .copied()
            .ok_or_else(|| Error::VmFault(format!("stack access out of range: {index}")))
    }

    /// Save `fp` and the return address, then point `fp` at the return-address cell
    pub(crate) fn call(&mut self, return_ip: Integer) -> Result<(), Error> {
        let saved_fp = Integer::try_from(self.fp)
            .map_err(|_| Error::VmFault(format!("frame pointer out of range: {}", self.fp)))?;
        self.push(saved_fp)?;
        self.push(return_ip)?;
        self.fp = self.cells.len() - 1;
        Ok(())
    }

    /// Pop the result, unwind the frame and leave the result where the saved
    /// `fp` was. Returns the saved return address.
    pub(crate) fn ret(&mut self) -> Result<Integer, Error> {
        let result = self.pop()?;
        let frame = self.fp;
        let Some(saved_fp_cell) = frame.checked_sub(1) else {
            return Err(Error::VmFault("return without a call frame".to_owned()));
        };
        let return_ip = self.cell(frame)?;
        let saved_fp = self.cell(saved_fp_cell)?;
        self.fp = usize::try_from(saved_fp)
            .map_err(|_| Error::VmFault(format!("saved frame pointer out of range: {saved_fp}")))?;
        self.cells.truncate(frame);
        if let Some(slot) = self.cells.last_mut() {
            *slot = result;
        }
        Ok(return_ip)
    }

    /// Exchange the top cell with the one `n` positions below it
    pub(crate) fn swap(&mut self, n: Integer) -> Result<(), Error> {
        let top = self
            .cells
            .len()
            .checked_sub(1)
            .ok_or_else(|| Error::VmFault("swap on empty stack".to_owned()))?;
        let other = usize::try_from(n)
            .ok()
            .and_then(|n| top.checked_sub(n))
            .ok_or_else(|| Error::VmFault(format!("swap depth {n} out of range")))?;
        self.cells.swap(top, other);
        Ok(())
    }

    /// Push a copy of `stack[fp - index - 2]`
    pub(crate) fn load_param(&mut self, index: Integer) -> Result<(), Error> {
        let slot = usize::try_from(index)
            .ok()
            .and_then(|index| self.fp.checked_sub(index)?.checked_sub(2))
            .ok_or_else(|| Error::VmFault(format!("parameter {index} out of range")))?;
        let value = self.cell(slot)?;
        self.push(value)
    }
}

/// The virtual machine: a configuration plus a fresh state for every run
#[derive(Debug, Clone, Default)]
pub struct Vm {
    config: VmConfig,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        Vm { config }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Run a program from its `main` entry address
    pub fn run(&self, program: &Program, out: &mut dyn Write) -> Result<Integer, Error> {
        self.run_from(program, program.entry, out)
    }

    /// Run a program from an arbitrary entry address
    ///
    /// A fake outer frame is set up first, whose return address is the
    /// instruction count: returning from the entry function lands on an
    /// implicit `halt` just past the end of the code.
    pub fn run_from(
        &self,
        program: &Program,
        entry: Integer,
        out: &mut dyn Write,
    ) -> Result<Integer, Error> {
        let code = &program.code;
        let halt_address = Integer::try_from(code.len())
            .map_err(|_| Error::VmFault("program exceeds the addressable size".to_owned()))?;

        let mut stack = Stack::new(self.config.stack_capacity);
        stack.push(0)?;
        stack.push(halt_address)?;
        stack.fp = 1;

        let mut ip = entry;
        loop {
            let index = usize::try_from(ip)
                .ok()
                .filter(|index| *index <= code.len())
                .ok_or_else(|| Error::VmFault(format!("instruction pointer out of range: {ip}")))?;
            let instruction = code
                .get(index)
                .copied()
                .unwrap_or(Instruction::bare(Opcode::Halt));
            let opcode = instruction
                .opcode()
                .map_err(|_| Error::VmFault(format!("{instruction} at {ip}")))?;
            let operand = instruction.operand();

            log::trace!(
                "ip={ip} {instruction} fp={} sp={}",
                stack.fp(),
                stack.depth() as isize - 1
            );

            let mut next = ip + 1;
            match opcode {
                Opcode::Add
                | Opcode::Sub
                | Opcode::GreaterOrEqual
                | Opcode::GreaterThan
                | Opcode::LessOrEqual
                | Opcode::LessThan => {
                    let right = stack.pop()?;
                    let left = stack.pop()?;
                    let op = BinaryOp::from_opcode(opcode)
                        .ok_or_else(|| Error::VmFault(format!("{instruction} is not an operator")))?;
                    stack.push(op.apply(left, right))?;
                }
                Opcode::Call => {
                    stack.call(next)?;
                    next = operand;
                }
                Opcode::Return => {
                    next = stack.ret()?;
                }
                Opcode::Jump => next = operand,
                Opcode::JumpIfZero => {
                    if stack.pop()? == 0 {
                        next = operand;
                    }
                }
                Opcode::Push => stack.push(operand)?,
                Opcode::Pop => {
                    stack.pop()?;
                }
                Opcode::Swap => stack.swap(operand)?,
                Opcode::LoadParam => stack.load_param(operand)?,
                Opcode::Print => {
                    let value = stack.top()?;
                    writeln!(out, "{value}").map_err(|e| Error::Output(e.to_string()))?;
                }
                Opcode::Halt => return stack.top(),
            }
            ip = next;
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::reader::parse_program;
    use std::collections::BTreeMap;

    fn run_source(source: &str) -> (Result<Integer, Error>, String) {
        let program = compile(&parse_program(source).unwrap()).unwrap();
        let mut out = Vec::new();
        let result = Vm::default().run(&program, &mut out);
        (result, String::from_utf8(out).unwrap())
    }

    /// Hand-assembled program with no function table
    fn raw_program(code: Vec<Instruction>) -> Program {
        Program {
            code,
            functions: BTreeMap::new(),
            entry: 0,
        }
    }

    #[test]
    fn test_programs_data_driven() {
        let test_cases = vec![
            ("(def main () 42)", 42),
            ("(def main () (+ 40 2))", 42),
            ("(def main () (- 3 10))", -7),
            ("(def main () (+ 2147483647 1))", i32::MIN),
            ("(def main () (>= 1 1))", 1),
            ("(def main () (< 2 1))", 0),
            ("(def main () (begin 1 2 3))", 3),
            ("(def main () (if 0 1 2))", 2),
            ("(def main () (if 5 1 2))", 1),
            ("(def sum (n) (if (<= n 0) 0 (+ n (sum (- n 1))))) (def main () (sum 5))", 15),
            (
                "(def fib (n) (if (< n 2) n (+ (fib (- n 1)) (fib (- n 2))))) (def main () (fib 15))",
                610,
            ),
            ("(def main () (twice 21)) (def twice (x) (+ x x))", 42),
            // result of a call nested in an operand keeps the stack balanced
            ("(def id (x) x) (def main () (+ (id 1) (+ (id 2) (id 3))))", 6),
            // parameter 0 binds to the last pushed argument
            ("(def sub2 (a b) (- a b)) (def main () (sub2 10 3))", -7),
            ("(def first (a b c) a) (def main () (first 1 2 3))", 3),
            ("(def last (a b c) c) (def main () (last 1 2 3))", 1),
        ];

        for (source, expected) in test_cases {
            assert_eq!(run_source(source).0, Ok(expected), "{source}");
        }
    }

    #[test]
    fn test_print_is_non_consuming() {
        let (result, output) = run_source("(def main () (begin (print 7) (+ 1 1)))");
        assert_eq!(result, Ok(2));
        assert_eq!(output, "7\n");

        let (result, output) = run_source("(def main () (+ 1 (print (+ 2 3))))");
        assert_eq!(result, Ok(6));
        assert_eq!(output, "5\n");

        let (result, output) = run_source("(def main () (if 0 (print 1) (print 2)))");
        assert_eq!(result, Ok(2));
        assert_eq!(output, "2\n");
    }

    #[test]
    fn test_stack_overflow_is_detected() {
        let (result, _) = run_source("(def loop (n) (loop n)) (def main () (loop 1))");
        assert_eq!(
            result,
            Err(Error::StackOverflow {
                capacity: DEFAULT_STACK_CAPACITY
            })
        );

        let program = compile(&parse_program("(def main () (+ 1 2))").unwrap()).unwrap();
        let tiny = Vm::new(VmConfig { stack_capacity: 3 });
        assert_eq!(
            tiny.run(&program, &mut Vec::new()),
            Err(Error::StackOverflow { capacity: 3 })
        );
        let enough = Vm::new(VmConfig { stack_capacity: 4 });
        assert_eq!(enough.run(&program, &mut Vec::new()), Ok(3));
    }

    #[test]
    fn test_run_from_other_entry() {
        let program = compile(&parse_program("(def seven () 7) (def main () 1)").unwrap()).unwrap();
        let entry = program.address_of("seven").unwrap();
        assert_eq!(Vm::default().run_from(&program, entry, &mut Vec::new()), Ok(7));
    }

    #[test]
    fn test_explicit_halt_returns_top() {
        let program = raw_program(vec![
            Instruction::new(Opcode::Push, 5),
            Instruction::bare(Opcode::Halt),
            Instruction::new(Opcode::Push, 6),
        ]);
        assert_eq!(Vm::default().run(&program, &mut Vec::new()), Ok(5));
    }

    #[test]
    fn test_vm_faults() {
        let test_cases = vec![
            (vec![Instruction::from_word(0x42)], "Unknown instruction: 66"),
            (vec![Instruction::new(Opcode::Jump, 9)], "instruction pointer out of range: 9"),
            (vec![Instruction::new(Opcode::Jump, -1)], "instruction pointer out of range: -1"),
            (
                vec![Instruction::new(Opcode::LoadParam, 5)],
                "parameter 5 out of range",
            ),
            (vec![Instruction::new(Opcode::Swap, 7)], "swap depth 7 out of range"),
            (
                vec![
                    Instruction::bare(Opcode::Pop),
                    Instruction::bare(Opcode::Pop),
                    Instruction::bare(Opcode::Add),
                ],
                "stack underflow",
            ),
        ];

        for (code, text) in test_cases {
            match Vm::default().run(&raw_program(code.clone()), &mut Vec::new()) {
                Err(Error::VmFault(msg)) => assert!(msg.contains(text), "{code:?}: {msg}"),
                other => panic!("{code:?}: expected VmFault, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_call_and_return_frame_arithmetic() {
        let mut stack = Stack::new(16);
        // outer frame as set up by the entry simulation
        stack.push(0).unwrap();
        stack.push(100).unwrap();
        stack.fp = 1;

        // caller pushes two arguments, then calls
        stack.push(10).unwrap();
        stack.push(3).unwrap();
        stack.call(42).unwrap();
        assert_eq!(stack.fp(), 5);
        assert_eq!(stack.cells, vec![0, 100, 10, 3, 1, 42]);

        // parameter 0 is the last pushed argument
        stack.load_param(0).unwrap();
        stack.load_param(1).unwrap();
        assert_eq!(stack.cells[6..], [3, 10]);
        stack.pop().unwrap();
        stack.pop().unwrap();

        stack.push(-7).unwrap();
        assert_eq!(stack.ret().unwrap(), 42);
        assert_eq!(stack.fp(), 1);
        assert_eq!(stack.cells, vec![0, 100, 10, 3, -7]);

        // caller-side cleanup: swap 2, pop, pop
        stack.swap(2).unwrap();
        assert_eq!(stack.cells, vec![0, 100, -7, 3, 10]);
        stack.pop().unwrap();
        stack.pop().unwrap();
        assert_eq!(stack.cells, vec![0, 100, -7]);
        assert_eq!(stack.depth(), 3);
    }

    #[test]
    fn test_return_from_entry_frame() {
        let mut stack = Stack::new(4);
        stack.push(0).unwrap();
        stack.push(9).unwrap();
        stack.fp = 1;
        stack.push(55).unwrap();

        assert_eq!(stack.ret().unwrap(), 9);
        assert_eq!(stack.fp(), 0);
        assert_eq!(stack.cells, vec![55]);
        assert_eq!(stack.top().unwrap(), 55);
    }
}
