//! Lowering from the syntax tree to bytecode.
//!
//! Every compiled expression leaves exactly one value on the stack. Function
//! bodies are laid out one after another and end in `ret`, so control only
//! enters a function through `call` (or the VM's entry simulation for `main`).
//!
//! Calls use the convention shared with [`crate::vm`]:
//!
//! ```text
//! <arg 0> ... <arg n-1>   ; caller pushes arguments left to right
//! call <address>          ; pushes fp and the return address
//! swap n                  ; move the result below the arguments
//! pop                     ; n times, discarding the arguments
//! ```

use crate::ast::{Integer, Node};
use crate::bytecode::{FunctionInfo, Instruction, Opcode, Program};
use crate::forms::{Definition, FormKind, find_form};
use crate::{ENTRY_FUNCTION, Error, count_arguments};
use std::collections::{BTreeMap, HashMap};

/// What an identifier means at a given point of compilation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Symbol {
    /// Top-level function with its declared parameter count
    Function { arity: usize },
    /// Parameter of the enclosing function, by declaration position
    Param(Integer),
}

/// Identifier resolution for one scope
///
/// The global table holds every top-level function. Entering a function body
/// snapshots it and overwrites each parameter name with its positional index.
#[derive(Debug, Clone, Default)]
struct SymbolTable {
    symbols: HashMap<String, Symbol>,
}

impl SymbolTable {
    fn get(&self, name: &str) -> Option<Symbol> {
        self.symbols.get(name).copied()
    }

    fn child_scope(&self, params: &[String]) -> Result<SymbolTable, Error> {
        let mut scope = self.clone();
        for (index, param) in params.iter().enumerate() {
            let index = Integer::try_from(index).map_err(|_| {
                Error::MalformedForm(format!("too many parameters: '{param}' at {index}"))
            })?;
            scope.symbols.insert(param.clone(), Symbol::Param(index));
        }
        Ok(scope)
    }
}

/// Compile a whole program (the list returned by the reader) with `main` as entry
pub fn compile(program: &Node) -> Result<Program, Error> {
    compile_with_entry(program, ENTRY_FUNCTION)
}

/// Compile a whole program whose entry point is the zero-parameter function `entry`
pub fn compile_with_entry(program: &Node, entry: &str) -> Result<Program, Error> {
    let forms = program.as_list().ok_or_else(|| {
        Error::MalformedForm(format!("program must be a list of forms, got {program}"))
    })?;

    let globals = declare_functions(forms, entry)?;
    let mut compiler = Compiler::default();
    for form in forms {
        compiler.compile_top_level(form, &globals)?;
    }
    compiler.finish(entry)
}

/// Register every top-level definition before any body is compiled, so calls
/// may refer to functions defined further down
fn declare_functions(forms: &[Node], entry: &str) -> Result<SymbolTable, Error> {
    let mut globals = SymbolTable::default();
    for form in forms {
        let Some([_, operands @ ..]) = form.as_list().filter(|_| form.is_definition()) else {
            continue;
        };
        let definition = Definition::parse(operands)?;
        if globals.symbols.contains_key(definition.name) {
            return Err(Error::MalformedForm(format!(
                "duplicate definition of '{}'",
                definition.name
            )));
        }
        if definition.name == entry && !definition.params.is_empty() {
            return Err(Error::MalformedForm(format!(
                "'{entry}' must take no parameters, got {}",
                definition.params.len()
            )));
        }
        globals.symbols.insert(
            definition.name.to_owned(),
            Symbol::Function {
                arity: definition.params.len(),
            },
        );
    }
    Ok(globals)
}

#[derive(Debug, Default)]
struct Compiler {
    code: Vec<Instruction>,
    functions: BTreeMap<String, FunctionInfo>,
    /// `call` instructions whose target was not laid out yet
    fixups: Vec<(usize, String)>,
}

impl Compiler {
    fn address(&self) -> Result<Integer, Error> {
        Integer::try_from(self.code.len())
            .map_err(|_| Error::MalformedForm("program exceeds the addressable size".to_owned()))
    }

    fn emit(&mut self, opcode: Opcode, operand: Integer) -> usize {
        self.code.push(Instruction::new(opcode, operand));
        self.code.len() - 1
    }

    fn emit_bare(&mut self, opcode: Opcode) -> usize {
        self.emit(opcode, 0)
    }

    fn patch(&mut self, position: usize, target: Integer) {
        if let Some(instruction) = self.code.get_mut(position) {
            *instruction = instruction.with_operand(target);
        }
    }

    fn compile_top_level(&mut self, form: &Node, globals: &SymbolTable) -> Result<(), Error> {
        match form.as_list() {
            Some([_, operands @ ..]) if form.is_definition() => {
                self.compile_definition(operands, globals)
            }
            _ => {
                // Only reachable through `call`, which never targets these
                log::warn!("top-level form is not a definition and will never run: {form}");
                self.compile_expr(form, globals)
            }
        }
    }

    fn compile_definition(&mut self, operands: &[Node], globals: &SymbolTable) -> Result<(), Error> {
        let definition = Definition::parse(operands)?;
        let address = self.address()?;
        self.functions.insert(
            definition.name.to_owned(),
            FunctionInfo {
                address,
                arity: definition.params.len(),
            },
        );
        log::debug!(
            "function '{}' ({} params) at {address}",
            definition.name,
            definition.params.len()
        );

        let scope = globals.child_scope(&definition.params)?;
        self.compile_sequence(definition.body, &scope)?;
        self.emit_bare(Opcode::Return);
        Ok(())
    }

    /// Compile expressions in order, discarding every value but the last
    fn compile_sequence(&mut self, nodes: &[Node], scope: &SymbolTable) -> Result<(), Error> {
        if nodes.is_empty() {
            return Err(Error::MalformedForm("cannot compile an empty sequence".to_owned()));
        }
        for (i, node) in nodes.iter().enumerate() {
            self.compile_expr(node, scope)?;
            if i + 1 < nodes.len() {
                self.emit_bare(Opcode::Pop);
            }
        }
        Ok(())
    }

    fn compile_expr(&mut self, node: &Node, scope: &SymbolTable) -> Result<(), Error> {
        match node {
            Node::Integer(n) => {
                self.emit(Opcode::Push, *n);
                Ok(())
            }
            Node::Identifier(name) => match scope.get(name) {
                Some(Symbol::Param(index)) => {
                    self.emit(Opcode::LoadParam, index);
                    Ok(())
                }
                Some(Symbol::Function { .. }) => Err(Error::MalformedForm(format!(
                    "function '{name}' cannot be used as a value"
                ))),
                None => Err(Error::UnknownIdentifier(name.clone())),
            },
            Node::List(elements) => self.compile_list(elements, scope),
        }
    }

    fn compile_list(&mut self, elements: &[Node], scope: &SymbolTable) -> Result<(), Error> {
        let [head, operands @ ..] = elements else {
            return Err(Error::MalformedForm("cannot compile empty list".to_owned()));
        };

        let Some(form) = head.as_identifier().and_then(find_form) else {
            return self.compile_call(head, operands, scope);
        };
        form.validate_arity(operands.len())?;

        match (form.kind, operands) {
            (FormKind::Begin, _) => self.compile_sequence(operands, scope),
            (FormKind::Binary(op), [left, right]) => {
                self.compile_expr(left, scope)?;
                self.compile_expr(right, scope)?;
                self.emit_bare(op.opcode());
                Ok(())
            }
            (FormKind::If, [condition, then_branch, else_branch]) => {
                self.compile_expr(condition, scope)?;
                let to_else = self.emit(Opcode::JumpIfZero, 0);
                self.compile_expr(then_branch, scope)?;
                let to_end = self.emit(Opcode::Jump, 0);
                let else_start = self.address()?;
                self.patch(to_else, else_start);
                self.compile_expr(else_branch, scope)?;
                let end = self.address()?;
                self.patch(to_end, end);
                Ok(())
            }
            (FormKind::Def, [name, ..]) => Err(Error::MalformedForm(format!(
                "nested definition of '{name}' is only allowed at top level"
            ))),
            (FormKind::Print, [operand]) => {
                self.compile_expr(operand, scope)?;
                self.emit_bare(Opcode::Print);
                Ok(())
            }
            _ => Err(Error::arity(form.name, &form.arity, operands.len())),
        }
    }

    fn compile_call(
        &mut self,
        head: &Node,
        args: &[Node],
        scope: &SymbolTable,
    ) -> Result<(), Error> {
        let Some(name) = head.as_identifier() else {
            return Err(Error::MalformedForm(format!(
                "call target must be a function name, got {head}"
            )));
        };
        match scope.get(name) {
            Some(Symbol::Function { arity }) if arity == args.len() => {}
            Some(Symbol::Function { arity }) => {
                return Err(Error::MalformedForm(format!(
                    "function '{name}' expects {}, got {}",
                    count_arguments(arity),
                    args.len()
                )));
            }
            Some(Symbol::Param(_)) => {
                return Err(Error::MalformedForm(format!(
                    "cannot call parameter '{name}'"
                )));
            }
            None => return Err(Error::UnknownFunction(name.to_owned())),
        }

        for arg in args {
            self.compile_expr(arg, scope)?;
        }

        let call = self.emit(Opcode::Call, 0);
        match self.functions.get(name) {
            Some(info) => self.patch(call, info.address),
            None => self.fixups.push((call, name.to_owned())),
        }

        let count = Integer::try_from(args.len())
            .map_err(|_| Error::MalformedForm(format!("too many arguments to '{name}'")))?;
        self.emit(Opcode::Swap, count);
        for _ in args {
            self.emit_bare(Opcode::Pop);
        }
        Ok(())
    }

    /// Resolve forward calls and locate the entry function
    fn finish(mut self, entry: &str) -> Result<Program, Error> {
        for (position, name) in std::mem::take(&mut self.fixups) {
            let info = self
                .functions
                .get(&name)
                .ok_or_else(|| Error::UnknownFunction(name.clone()))?;
            let address = info.address;
            self.patch(position, address);
        }

        let entry = self
            .functions
            .get(entry)
            .map(|info| info.address)
            .ok_or_else(|| Error::UnknownFunction(entry.to_owned()))?;
        log::debug!(
            "compiled {} instructions, {} functions, entry at {entry}",
            self.code.len(),
            self.functions.len()
        );

        Ok(Program {
            code: self.code,
            functions: self.functions,
            entry,
        })
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::bytecode::disassemble;
    use crate::reader::parse_program;

    fn compile_source(source: &str) -> Result<Program, Error> {
        compile(&parse_program(source).unwrap())
    }

    /// Mnemonic listing of the compiled code, one instruction per entry
    fn listing(source: &str) -> Vec<String> {
        compile_source(source)
            .unwrap()
            .code
            .iter()
            .map(|instruction| instruction.to_string())
            .collect()
    }

    #[test]
    fn test_instruction_sequences() {
        let test_cases: Vec<(&str, Vec<&str>)> = vec![
            ("(def main () 42)", vec!["push 42", "ret"]),
            (
                "(def main () (- 3 10))",
                vec!["push 3", "push 10", "sub", "ret"],
            ),
            (
                "(def main () (begin 1 2 3))",
                vec!["push 1", "pop", "push 2", "pop", "push 3", "ret"],
            ),
            // multi-form bodies discard every value but the last
            (
                "(def main () (print 1) 2)",
                vec!["push 1", "print", "pop", "push 2", "ret"],
            ),
            (
                "(def main () (if 0 1 2))",
                vec!["push 0", "jump-zero 4", "push 1", "jump 5", "push 2", "ret"],
            ),
            (
                "(def id (x) x) (def main () (id 7))",
                vec![
                    "param 0", "ret", // id
                    "push 7", "call 0", "swap 1", "pop", "ret", // main
                ],
            ),
            (
                "(def sub2 (a b) (- a b)) (def main () (sub2 10 3))",
                vec![
                    "param 0", "param 1", "sub", "ret", // sub2
                    "push 10", "push 3", "call 0", "swap 2", "pop", "pop", "ret", // main
                ],
            ),
            // zero-argument calls keep the swap, with nothing to pop
            (
                "(def one () 1) (def main () (one))",
                vec!["push 1", "ret", "call 0", "swap 0", "ret"],
            ),
        ];

        for (source, expected) in test_cases {
            assert_eq!(listing(source), expected, "{source}");
        }
    }

    #[test]
    fn test_recursive_function_layout() {
        let program =
            compile_source("(def sum (n) (if (<= n 0) 0 (+ n (sum (- n 1))))) (def main () (sum 5))")
                .unwrap();

        let expected = vec![
            "param 0",
            "push 0",
            "lte",
            "jump-zero 6",
            "push 0",
            "jump 14",
            "param 0",
            "param 0",
            "push 1",
            "sub",
            "call 0",
            "swap 1",
            "pop",
            "add",
            "ret",
            "push 5",
            "call 0",
            "swap 1",
            "pop",
            "ret",
        ];
        let actual: Vec<String> = program.code.iter().map(|i| i.to_string()).collect();
        assert_eq!(actual, expected);

        assert_eq!(program.entry, 15);
        assert_eq!(program.functions["sum"], FunctionInfo { address: 0, arity: 1 });
        assert_eq!(program.functions["main"], FunctionInfo { address: 15, arity: 0 });
    }

    #[test]
    fn test_forward_calls_are_backpatched() {
        let program = compile_source("(def main () (twice 4)) (def twice (x) (+ x x))").unwrap();
        // main occupies 0..=4, twice starts right after it
        assert_eq!(program.address_of("twice").unwrap(), 5);
        assert_eq!(program.code[1], Instruction::new(Opcode::Call, 5));
        assert_eq!(program.entry, 0);
    }

    #[test]
    fn test_parameters_shadow_functions() {
        // `f` inside `g` is the parameter, not the function
        let program = compile_source("(def f () 1) (def g (f) f) (def main () (g 2))").unwrap();
        assert_eq!(program.code[2], Instruction::new(Opcode::LoadParam, 0));
    }

    #[test]
    fn test_top_level_expression_is_dead_code() {
        let program = compile_source("(print 9) (def main () 1)").unwrap();
        assert_eq!(program.entry, 2);
        assert!(disassemble(&program).starts_with("0\t\t\t\tpush 9\n1\t\t\t\tprint\n2\t\tmain"));
    }

    #[test]
    fn test_custom_entry_function() {
        let program = parse_program("(def one () 1) (def start () (one))").unwrap();
        let compiled = compile_with_entry(&program, "start").unwrap();
        assert_eq!(compiled.entry, 2);
        assert_eq!(compile(&program), Err(Error::UnknownFunction("main".into())));

        let program = parse_program("(def start (x) x)").unwrap();
        assert_eq!(
            compile_with_entry(&program, "start"),
            Err(Error::MalformedForm("'start' must take no parameters, got 1".into()))
        );
    }

    #[test]
    fn test_compile_errors() {
        let test_cases = vec![
            ("(def main () x)", Error::UnknownIdentifier("x".into())),
            ("(def main () (foo))", Error::UnknownFunction("foo".into())),
            ("(def other () 1)", Error::UnknownFunction("main".into())),
            (
                "(def main () ())",
                Error::MalformedForm("cannot compile empty list".into()),
            ),
            (
                "(def main () (if 1 2))",
                Error::MalformedForm("'if' expects 3 arguments, got 2".into()),
            ),
            (
                "(def main () (+ 1 2 3))",
                Error::MalformedForm("'+' expects 2 arguments, got 3".into()),
            ),
            (
                "(def main () (begin))",
                Error::MalformedForm("'begin' expects at least 1 argument, got 0".into()),
            ),
            (
                "(def f (x) x) (def main () (f))",
                Error::MalformedForm("function 'f' expects 1 argument, got 0".into()),
            ),
            (
                "(def f (x) (x 1)) (def main () (f 1))",
                Error::MalformedForm("cannot call parameter 'x'".into()),
            ),
            (
                "(def f (x) x) (def main () (+ f 1))",
                Error::MalformedForm("function 'f' cannot be used as a value".into()),
            ),
            (
                "(def main () ((f) 1))",
                Error::MalformedForm("call target must be a function name, got (f)".into()),
            ),
            (
                "(def main () (def g () 1))",
                Error::MalformedForm("nested definition of 'g' is only allowed at top level".into()),
            ),
            (
                "(def f () 1) (def f () 2) (def main () 1)",
                Error::MalformedForm("duplicate definition of 'f'".into()),
            ),
            (
                "(def main (x) x)",
                Error::MalformedForm("'main' must take no parameters, got 1".into()),
            ),
            (
                "(def print (x) x) (def main () 1)",
                Error::MalformedForm("cannot redefine built-in form 'print'".into()),
            ),
        ];

        for (source, expected) in test_cases {
            assert_eq!(compile_source(source), Err(expected), "{source}");
        }
    }
}
