//! Built-in forms registry shared by the tree interpreter and the compiler.
//!
//! Every form the language knows is listed once here with its arity, so both
//! engines agree on which heads are keywords and how many operands each takes:
//!
//! ```text
//! (begin e1 e2 ... en)      ; sequence, value of en
//! (+ a b) (- a b)           ; 32-bit wraparound arithmetic
//! (> a b) (>= a b) (< a b) (<= a b)   ; 1 if the relation holds, else 0
//! (if c then else)          ; exactly one branch is evaluated
//! (def name (params...) body...)
//! (print e)                 ; writes e, leaves it as the value
//! ```
//!
//! A list whose head is not in this registry is a function call.

use crate::{Error, count_arguments};
use crate::ast::{Integer, Node};
use crate::bytecode::Opcode;
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

/// Number of operands a form accepts (not counting the head)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub(crate) fn accepts(&self, count: usize) -> bool {
        match *self {
            Arity::Exact(n) => count == n,
            Arity::AtLeast(n) => count >= n,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{}", count_arguments(*n)),
            Arity::AtLeast(n) => write!(f, "at least {}", count_arguments(*n)),
        }
    }
}

/// Binary integer operators: pop right, pop left, push result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
}

impl BinaryOp {
    /// Apply the operator; comparisons produce 1 or 0
    pub fn apply(self, left: Integer, right: Integer) -> Integer {
        match self {
            BinaryOp::Add => left.wrapping_add(right),
            BinaryOp::Sub => left.wrapping_sub(right),
            BinaryOp::GreaterThan => Integer::from(left > right),
            BinaryOp::GreaterOrEqual => Integer::from(left >= right),
            BinaryOp::LessThan => Integer::from(left < right),
            BinaryOp::LessOrEqual => Integer::from(left <= right),
        }
    }

    /// Operator implemented by a VM instruction, if any
    pub fn from_opcode(opcode: Opcode) -> Option<BinaryOp> {
        match opcode {
            Opcode::Add => Some(BinaryOp::Add),
            Opcode::Sub => Some(BinaryOp::Sub),
            Opcode::GreaterThan => Some(BinaryOp::GreaterThan),
            Opcode::GreaterOrEqual => Some(BinaryOp::GreaterOrEqual),
            Opcode::LessThan => Some(BinaryOp::LessThan),
            Opcode::LessOrEqual => Some(BinaryOp::LessOrEqual),
            _ => None,
        }
    }

    /// The single VM instruction implementing this operator
    pub fn opcode(self) -> Opcode {
        match self {
            BinaryOp::Add => Opcode::Add,
            BinaryOp::Sub => Opcode::Sub,
            BinaryOp::GreaterThan => Opcode::GreaterThan,
            BinaryOp::GreaterOrEqual => Opcode::GreaterOrEqual,
            BinaryOp::LessThan => Opcode::LessThan,
            BinaryOp::LessOrEqual => Opcode::LessOrEqual,
        }
    }
}

/// What a built-in form does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormKind {
    Begin,
    Binary(BinaryOp),
    If,
    Def,
    Print,
}

/// Definition of a built-in form
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltinForm {
    /// Identifier that introduces the form
    pub name: &'static str,
    pub kind: FormKind,
    /// Expected number of operands
    pub arity: Arity,
}

impl BuiltinForm {
    /// Check the operand count, naming the form in the error
    pub(crate) fn validate_arity(&self, operand_count: usize) -> Result<(), Error> {
        if self.arity.accepts(operand_count) {
            Ok(())
        } else {
            Err(Error::arity(self.name, &self.arity, operand_count))
        }
    }
}

static BUILTIN_FORMS: LazyLock<Vec<BuiltinForm>> = LazyLock::new(|| {
    let binary = |name, op| BuiltinForm {
        name,
        kind: FormKind::Binary(op),
        arity: Arity::Exact(2),
    };

    vec![
        BuiltinForm {
            name: "begin",
            kind: FormKind::Begin,
            // An empty sequence has no value
            arity: Arity::AtLeast(1),
        },
        binary("+", BinaryOp::Add),
        binary("-", BinaryOp::Sub),
        binary(">", BinaryOp::GreaterThan),
        binary(">=", BinaryOp::GreaterOrEqual),
        binary("<", BinaryOp::LessThan),
        binary("<=", BinaryOp::LessOrEqual),
        BuiltinForm {
            name: "if",
            kind: FormKind::If,
            arity: Arity::Exact(3),
        },
        BuiltinForm {
            name: "def",
            kind: FormKind::Def,
            // name, parameter list, and a non-empty body
            arity: Arity::AtLeast(3),
        },
        BuiltinForm {
            name: "print",
            kind: FormKind::Print,
            arity: Arity::Exact(1),
        },
    ]
});

static BUILTIN_BY_NAME: LazyLock<HashMap<&'static str, &'static BuiltinForm>> =
    LazyLock::new(|| {
        let forms: &'static [BuiltinForm] = BUILTIN_FORMS.as_slice();
        forms.iter().map(|form| (form.name, form)).collect()
    });

/// All built-in forms, in registry order
pub fn builtin_forms() -> &'static [BuiltinForm] {
    BUILTIN_FORMS.as_slice()
}

/// Find a built-in form by the identifier at the head of a list
pub fn find_form(name: &str) -> Option<&'static BuiltinForm> {
    BUILTIN_BY_NAME.get(name).copied()
}

/// Operands of a `(def name (params...) body...)` form, validated
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Definition<'a> {
    pub name: &'a str,
    pub params: Vec<String>,
    pub body: &'a [Node],
}

impl<'a> Definition<'a> {
    /// Validate the operands of a `def` form (everything after the `def` head)
    pub(crate) fn parse(operands: &'a [Node]) -> Result<Self, Error> {
        let [name, params, body @ ..] = operands else {
            return Err(Error::arity("def", &Arity::AtLeast(3), operands.len()));
        };
        if body.is_empty() {
            return Err(Error::arity("def", &Arity::AtLeast(3), operands.len()));
        }

        let name = name.as_identifier().ok_or_else(|| {
            Error::MalformedForm(format!("function name must be an identifier, got {name}"))
        })?;
        if find_form(name).is_some() {
            return Err(Error::MalformedForm(format!(
                "cannot redefine built-in form '{name}'"
            )));
        }

        Ok(Definition {
            name,
            params: parameter_names(name, params)?,
            body,
        })
    }
}

fn parameter_names(function: &str, params: &Node) -> Result<Vec<String>, Error> {
    let Some(elements) = params.as_list() else {
        return Err(Error::MalformedForm(format!(
            "parameters of '{function}' must be a list, got {params}"
        )));
    };

    let mut names: Vec<String> = Vec::with_capacity(elements.len());
    for param in elements {
        match param.as_identifier() {
            Some(name) if names.iter().any(|seen| seen == name) => {
                return Err(Error::MalformedForm(format!(
                    "duplicate parameter '{name}' in '{function}'"
                )));
            }
            Some(name) => names.push(name.to_owned()),
            None => {
                return Err(Error::MalformedForm(format!(
                    "parameters of '{function}' must be identifiers, got {param}"
                )));
            }
        }
    }
    Ok(names)
}
