//! TwinLisp - one small S-expression language, two execution engines
//!
//! This crate reads a tiny Lisp dialect and runs it either with a tree-walking
//! interpreter or by compiling it to a compact fixed-width bytecode executed by a
//! stack-based virtual machine. Both engines consume the same [`ast::Node`] tree.
//!
//! ```text
//! (def sum (n) (if (<= n 0) 0 (+ n (sum (- n 1)))))
//! (def main () (sum 5))          ; => 15 in both engines
//! ```
//!
//! ## Language
//!
//! - Integers are 32-bit with wraparound arithmetic, written without a sign
//! - `begin`, `+`, `-`, `>`, `>=`, `<`, `<=`, `if`, `def` and `print` are built in
//! - Functions see free identifiers from the *caller's* environment (dynamic scope)
//! - A zero-parameter `main` function is the program entry point
//!
//! ## Engine differences
//!
//! The bytecode calling convention addresses parameters back-to-front from the
//! frame pointer (`fp - i - 2`). For functions of two or more parameters the
//! first declared parameter therefore reads the *last* pushed argument, so
//! `(sub2 10 3)` with `(def sub2 (a b) (- a b))` yields `7` in the tree
//! interpreter and `-7` in the VM. This is the compatibility baseline of the
//! VM and is kept as-is.
//!
//! ## Modules
//!
//! - `ast`: syntax tree shared by every engine
//! - `reader`: S-expression reader from source text
//! - `forms`: registry of built-in forms and their arity
//! - `evaluator`: tree-walking interpreter with dynamic scope
//! - `bytecode`: instruction encoding and disassembly
//! - `compiler`: lowering from the tree to bytecode
//! - `vm`: fetch-execute loop over a fixed-capacity integer stack

use std::fmt;
use std::io::Write;
use std::str::FromStr;

/// Maximum list nesting accepted by the reader
pub const MAX_PARSE_DEPTH: usize = 64;

/// Maximum nesting of user-function calls in the tree interpreter.
///
/// A bytecode call frame takes at least two stack cells, so this is never
/// shallower than what the VM reaches with its default stack. The native stack
/// grows on demand; this bound only stops runaway recursion.
pub const MAX_EVAL_DEPTH: usize = vm::DEFAULT_STACK_CAPACITY / 2;

/// Name of the function every program must define
pub const ENTRY_FUNCTION: &str = "main";

/// Categorizes the different kinds of parsing errors.
#[derive(Debug, PartialEq, Clone)]
pub enum ParseErrorKind {
    /// Invalid or unexpected syntax (bad tokens, malformed expressions)
    InvalidSyntax,
    /// Input ended before the expression was complete (unclosed parens)
    Incomplete,
    /// Expression nesting exceeded the maximum parse depth
    TooDeeplyNested,
    /// Extra input found after a complete expression
    TrailingContent,
    /// Implementation-imposed limit exceeded (integer literal out of range)
    ImplementationLimit,
}

/// A structured error providing detailed information about a parsing failure.
#[derive(Debug, PartialEq, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Context snippet from the input showing where the error occurred (max 100 chars)
    pub context: Option<String>,
    /// Textual form of the last top-level form that parsed successfully
    pub after: Option<String>,
}

impl ParseError {
    pub fn new(
        kind: ParseErrorKind,
        message: impl Into<String>,
        context: Option<String>,
        after: Option<String>,
    ) -> Self {
        ParseError {
            kind,
            message: message.into(),
            context,
            after,
        }
    }

    pub fn from_message(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message, None, None)
    }

    /// Create a ParseError with context extracted from input at a given offset
    pub fn with_context(
        kind: ParseErrorKind,
        message: impl Into<String>,
        input: &str,
        error_offset: usize,
    ) -> Self {
        const MAX_CONTEXT: usize = 100;

        // Offsets are bytes; the window is measured in chars
        let error_char = input
            .get(..error_offset)
            .map_or_else(|| input.chars().count(), |prefix| prefix.chars().count());
        let context_start = error_char.saturating_sub(20);
        let context_str: String = input
            .chars()
            .skip(context_start)
            .take(MAX_CONTEXT)
            .collect();

        let mut display_context = String::new();
        if context_start > 0 {
            display_context.push_str("[...]");
        }
        display_context.push_str(&context_str);
        if context_start + context_str.chars().count() < input.chars().count() {
            display_context.push_str("[...]");
        }

        let display_context = display_context.replace('\n', "\\n").replace('\r', "");

        Self::new(kind, message, Some(display_context), None)
    }

    /// Attach the last successfully parsed form
    pub fn after_form(mut self, form: impl Into<String>) -> Self {
        self.after = Some(form.into());
        self
    }
}

/// Error types for every stage: reading, evaluating, compiling and executing
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    ParseError(ParseError),
    /// Identifier not bound in the environment or symbol table
    UnknownIdentifier(String),
    /// Call to a name the compiler has no entry address for
    UnknownFunction(String),
    /// The VM tried to push past the end of its stack
    StackOverflow { capacity: usize },
    /// Empty list, wrong arity, or a form used where it is not allowed
    MalformedForm(String),
    /// Operand of the wrong kind in the tree interpreter
    TypeError(String),
    /// Tree interpreter nested more than `MAX_EVAL_DEPTH` calls
    RecursionLimit(usize),
    /// Invalid bytecode: unknown opcode, out-of-range jump or stack access
    VmFault(String),
    /// Writing `print` output failed
    Output(String),
}

impl Error {
    pub(crate) fn arity(form: &str, expected: &forms::Arity, got: usize) -> Self {
        Error::MalformedForm(format!("'{form}' expects {expected}, got {got}"))
    }
}

/// "1 argument", "2 arguments", ...
pub(crate) fn count_arguments(n: usize) -> String {
    if n == 1 {
        "1 argument".to_owned()
    } else {
        format!("{n} arguments")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ParseError(e) => {
                write!(f, "ParseError: {}", e.message)?;
                if let Some(after) = &e.after {
                    write!(f, "\nError after: {after}")?;
                }
                if let Some(context) = &e.context {
                    write!(f, "\nContext: {context}")?;
                }
                Ok(())
            }
            Error::UnknownIdentifier(name) => write!(f, "Unknown identifier: {name}"),
            Error::UnknownFunction(name) => write!(f, "Unknown function: {name}"),
            Error::StackOverflow { capacity } => {
                write!(f, "Stack overflow (capacity: {capacity} cells)")
            }
            Error::MalformedForm(msg) => write!(f, "Malformed form: {msg}"),
            Error::TypeError(msg) => write!(f, "Type error: {msg}"),
            Error::RecursionLimit(max) => {
                write!(f, "Call depth limit exceeded (max: {max})")
            }
            Error::VmFault(msg) => write!(f, "VM fault: {msg}"),
            Error::Output(msg) => write!(f, "Output error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

/// Execution strategy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Engine {
    /// Evaluate the syntax tree directly
    #[default]
    Tree,
    /// Compile to bytecode, then run on the VM
    Bytecode,
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ast" | "tree" => Ok(Engine::Tree),
            "vm" | "bytecode" => Ok(Engine::Bytecode),
            other => Err(format!("Unknown mode: {other} (expected 'ast' or 'vm')")),
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Engine::Tree => write!(f, "ast"),
            Engine::Bytecode => write!(f, "vm"),
        }
    }
}

/// Parse and run a program, sending `print` output to stdout
pub fn run(source: &str, engine: Engine) -> Result<i32, Error> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run_with_output(source, engine, &mut out)
}

/// Parse and run a program with the given engine; returns the result of `main`
pub fn run_with_output(source: &str, engine: Engine, out: &mut dyn Write) -> Result<i32, Error> {
    let program = reader::parse_program(source)?;
    match engine {
        Engine::Tree => {
            let mut env = evaluator::Environment::new();
            evaluator::run_program_with_output(&program, &mut env, out)?.as_integer()
        }
        Engine::Bytecode => {
            let compiled = compiler::compile(&program)?;
            vm::Vm::default().run(&compiled, out)
        }
    }
}

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod evaluator;
pub mod forms;
pub mod reader;
pub mod vm;
