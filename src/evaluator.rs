use crate::ast::{Integer, Node};
use crate::forms::{BinaryOp, BuiltinForm, Definition, FormKind, find_form};
use crate::{ENTRY_FUNCTION, Error, MAX_EVAL_DEPTH, count_arguments};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::rc::Rc;

/// Runtime value of the tree-walking interpreter
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(Integer),
    /// Quoted identifier; never the result of evaluating a program
    Identifier(String),
    /// User-defined function. Captures no environment: free identifiers in the
    /// body resolve against the caller's environment at call time.
    Function {
        params: Rc<[String]>,
        body: Rc<[Node]>,
    },
    List(Vec<Value>),
}

impl Value {
    /// The integer payload, or a type error naming the value
    pub fn as_integer(&self) -> Result<Integer, Error> {
        match self {
            Value::Integer(n) => Ok(*n),
            other => Err(Error::TypeError(format!("expected integer, got {other}"))),
        }
    }
}

/// Quote a syntax tree as data
impl From<&Node> for Value {
    fn from(node: &Node) -> Self {
        match node {
            Node::Integer(n) => Value::Integer(*n),
            Node::Identifier(name) => Value::Identifier(name.clone()),
            Node::List(elements) => Value::List(elements.iter().map(Value::from).collect()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "{n}"),
            Value::Identifier(name) => write!(f, "{name}"),
            Value::Function { .. } => write!(f, "#<function>"),
            Value::List(elements) => {
                write!(f, "(")?;
                for (i, elem) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{elem}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Environment for identifier bindings
///
/// There is no parent chain: a call copies the caller's environment and
/// overlays the parameters, which gives dynamic scope.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Environment {
    bindings: HashMap<String, Value>,
}

impl Environment {
    pub fn new() -> Self {
        Environment {
            bindings: HashMap::new(),
        }
    }

    pub fn define(&mut self, name: String, value: Value) {
        self.bindings.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// All bindings as (name, value) pairs sorted by name
    pub fn get_all_bindings(&self) -> Vec<(String, Value)> {
        let mut result: Vec<_> = self
            .bindings
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }
}

/// Evaluate an expression, writing `print` output to stdout
pub fn evaluate(node: &Node, env: &mut Environment) -> Result<Value, Error> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    evaluate_with_output(node, env, &mut out)
}

/// Evaluate an expression, writing `print` output to `out`
pub fn evaluate_with_output(
    node: &Node,
    env: &mut Environment,
    out: &mut dyn Write,
) -> Result<Value, Error> {
    Evaluator { out }.eval(node, env, 0)
}

/// Evaluate every top-level form of a program, then call `main`
pub fn run_program(program: &Node, env: &mut Environment) -> Result<Value, Error> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run_program_with_output(program, env, &mut out)
}

/// Evaluate every top-level form of a program, then call `main`, writing
/// `print` output to `out`
pub fn run_program_with_output(
    program: &Node,
    env: &mut Environment,
    out: &mut dyn Write,
) -> Result<Value, Error> {
    let forms = program.as_list().ok_or_else(|| {
        Error::MalformedForm(format!("program must be a list of forms, got {program}"))
    })?;

    let mut evaluator = Evaluator { out };
    for form in forms {
        evaluator.eval(form, env, 0)?;
    }

    let entry_call = Node::List(vec![Node::Identifier(ENTRY_FUNCTION.to_owned())]);
    evaluator.eval(&entry_call, env, 0)
}

/// Remaining native stack below which evaluation moves to a fresh segment
const STACK_RED_ZONE: usize = 128 * 1024;
/// Size of each additional native stack segment
const STACK_GROW_SIZE: usize = 4 * 1024 * 1024;

struct Evaluator<'a> {
    out: &'a mut dyn Write,
}

impl Evaluator<'_> {
    /// Evaluate an expression at the given user-function call depth, growing
    /// the native stack when it runs low
    fn eval(&mut self, node: &Node, env: &mut Environment, depth: usize) -> Result<Value, Error> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
            self.eval_inner(node, env, depth)
        })
    }

    fn eval_inner(
        &mut self,
        node: &Node,
        env: &mut Environment,
        depth: usize,
    ) -> Result<Value, Error> {
        match node {
            Node::Integer(n) => Ok(Value::Integer(*n)),
            Node::Identifier(name) => env
                .get(name)
                .cloned()
                .ok_or_else(|| Error::UnknownIdentifier(name.clone())),
            Node::List(elements) => self.eval_list(elements, env, depth),
        }
    }

    /// Evaluate a node that must produce an integer
    fn eval_integer(
        &mut self,
        node: &Node,
        env: &mut Environment,
        depth: usize,
        context: &str,
    ) -> Result<Integer, Error> {
        match self.eval(node, env, depth)? {
            Value::Integer(n) => Ok(n),
            other => Err(Error::TypeError(format!(
                "'{context}' expects an integer, got {other} from {node}"
            ))),
        }
    }

    /// Evaluate nodes in order in the same environment; the last value wins
    fn eval_sequence(
        &mut self,
        nodes: &[Node],
        env: &mut Environment,
        depth: usize,
    ) -> Result<Value, Error> {
        let mut result = None;
        for node in nodes {
            result = Some(self.eval(node, env, depth)?);
        }
        result.ok_or_else(|| Error::MalformedForm("cannot evaluate an empty sequence".to_owned()))
    }

    fn eval_list(
        &mut self,
        elements: &[Node],
        env: &mut Environment,
        depth: usize,
    ) -> Result<Value, Error> {
        let [head, operands @ ..] = elements else {
            return Err(Error::MalformedForm("cannot evaluate empty list".to_owned()));
        };

        let Some(form) = head.as_identifier().and_then(find_form) else {
            return self.apply(head, operands, env, depth);
        };
        form.validate_arity(operands.len())?;

        match form.kind {
            FormKind::Begin => self.eval_sequence(operands, env, depth),
            FormKind::Binary(op) => self.eval_binary(form, op, operands, env, depth),
            FormKind::If => {
                let [condition, then_branch, else_branch] = operands else {
                    return Err(Error::arity(form.name, &form.arity, operands.len()));
                };
                if self.eval_integer(condition, env, depth, form.name)? != 0 {
                    self.eval(then_branch, env, depth)
                } else {
                    self.eval(else_branch, env, depth)
                }
            }
            FormKind::Def => {
                let definition = Definition::parse(operands)?;
                let function = Value::Function {
                    params: definition.params.into(),
                    body: definition.body.into(),
                };
                env.define(definition.name.to_owned(), function.clone());
                Ok(function)
            }
            FormKind::Print => {
                let [operand] = operands else {
                    return Err(Error::arity(form.name, &form.arity, operands.len()));
                };
                let value = self.eval(operand, env, depth)?;
                writeln!(self.out, "{value}").map_err(|e| Error::Output(e.to_string()))?;
                Ok(value)
            }
        }
    }

    fn eval_binary(
        &mut self,
        form: &BuiltinForm,
        op: BinaryOp,
        operands: &[Node],
        env: &mut Environment,
        depth: usize,
    ) -> Result<Value, Error> {
        let [left, right] = operands else {
            return Err(Error::arity(form.name, &form.arity, operands.len()));
        };
        let left = self.eval_integer(left, env, depth, form.name)?;
        let right = self.eval_integer(right, env, depth, form.name)?;
        Ok(Value::Integer(op.apply(left, right)))
    }

    /// Call a user function: arguments are evaluated in the caller's
    /// environment, the body runs in a copy of it with parameters overlaid
    fn apply(
        &mut self,
        head: &Node,
        operands: &[Node],
        env: &mut Environment,
        depth: usize,
    ) -> Result<Value, Error> {
        let (params, body) = match self.eval(head, env, depth)? {
            Value::Function { params, body } => (params, body),
            other => {
                return Err(Error::TypeError(format!(
                    "cannot call non-function {head}: {other}"
                )));
            }
        };
        if params.len() != operands.len() {
            return Err(Error::MalformedForm(format!(
                "function '{head}' expects {}, got {}",
                count_arguments(params.len()),
                operands.len()
            )));
        }
        if depth >= MAX_EVAL_DEPTH {
            return Err(Error::RecursionLimit(MAX_EVAL_DEPTH));
        }

        let mut frame = env.clone();
        for (param, operand) in params.iter().zip(operands) {
            let value = self.eval(operand, env, depth)?;
            frame.define(param.clone(), value);
        }

        log::trace!("call {head} depth={depth}");
        self.eval_sequence(&body, &mut frame, depth + 1)
    }
}
