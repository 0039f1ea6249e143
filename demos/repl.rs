use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::panic;
use std::process;
use twinlisp::ast::Node;
use twinlisp::bytecode::disassemble;
use twinlisp::evaluator::{self, Environment, Value};
use twinlisp::vm::Vm;
use twinlisp::{Engine, Error, compiler, reader};

/// Name of the function synthesized around each expression in VM mode
const ENTRY: &str = "repl";

fn main() {
    let result = panic::catch_unwind(|| {
        run_repl();
    });

    if let Err(panic_info) = result {
        eprintln!("The REPL encountered an unexpected error and must exit.");

        if let Some(msg) = panic_info.downcast_ref::<&str>() {
            eprintln!("Error: {msg}");
        } else if let Some(msg) = panic_info.downcast_ref::<String>() {
            eprintln!("Error: {msg}");
        } else {
            eprintln!("Error: Unknown panic occurred");
        }

        process::exit(1);
    }
}

/// Definitions entered so far, shared by both engines
struct Session {
    engine: Engine,
    env: Environment,
    definitions: Vec<(String, Node)>,
}

impl Session {
    fn new() -> Self {
        Session {
            engine: Engine::Tree,
            env: Environment::new(),
            definitions: Vec::new(),
        }
    }

    /// Evaluate a `def` in the tree environment and remember it for the compiler
    fn define(&mut self, form: Node) -> Result<String, Error> {
        let name = match form.as_list() {
            Some([_, Node::Identifier(name), ..]) => name.clone(),
            _ => return Err(Error::MalformedForm(format!("bad definition: {form}"))),
        };
        evaluator::evaluate_with_output(&form, &mut self.env, &mut std::io::stdout())?;

        self.definitions.retain(|(existing, _)| *existing != name);
        self.definitions.push((name.clone(), form));
        Ok(name)
    }

    /// Session definitions plus `(def repl () body)`
    fn program_with_entry(&self, body: Node) -> Node {
        let mut forms: Vec<Node> = self.definitions.iter().map(|(_, def)| def.clone()).collect();
        forms.push(Node::List(vec![
            Node::from("def"),
            Node::from(ENTRY),
            Node::List(vec![]),
            body,
        ]));
        Node::List(forms)
    }

    fn evaluate(&mut self, expr: &Node) -> Result<Value, Error> {
        let mut out = std::io::stdout();
        match self.engine {
            Engine::Tree => evaluator::evaluate_with_output(expr, &mut self.env, &mut out),
            Engine::Bytecode => {
                let program = self.program_with_entry(expr.clone());
                let compiled = compiler::compile_with_entry(&program, ENTRY)?;
                Vm::default().run(&compiled, &mut out).map(Value::Integer)
            }
        }
    }

    fn print_disassembly(&self) {
        let program = self.program_with_entry(Node::Integer(0));
        match compiler::compile_with_entry(&program, ENTRY) {
            Ok(compiled) => print!("{}", disassemble(&compiled)),
            Err(e) => println!("Error: {e}"),
        }
    }
}

fn run_repl() {
    println!("TwinLisp - tree interpreter and bytecode VM");
    println!("Define functions like: (def inc (n) (+ n 1))");
    println!("Then evaluate expressions like: (inc 41)");
    println!("Type :help for more commands, or Ctrl+C to exit.");
    println!();

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("Could not initialize REPL: {e}");
            return;
        }
    };
    let mut session = Session::new();

    loop {
        match rl.readline(&format!("twinlisp[{}]> ", session.engine)) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                // Add the line to history
                let _ = rl.add_history_entry(line);

                match line {
                    ":help" => {
                        print_help();
                        continue;
                    }
                    ":env" => {
                        print_environment(&session.env);
                        continue;
                    }
                    ":ast" => {
                        session.engine = Engine::Tree;
                        println!("Evaluating with the tree interpreter");
                        continue;
                    }
                    ":vm" => {
                        session.engine = Engine::Bytecode;
                        println!("Compiling to bytecode and running on the VM");
                        continue;
                    }
                    ":dis" => {
                        session.print_disassembly();
                        continue;
                    }
                    ":quit" | ":exit" => {
                        println!("Goodbye!");
                        break;
                    }
                    _ => {}
                }

                let form = match reader::parse_form(line) {
                    Ok(form) => form,
                    Err(e) => {
                        println!("Error: {e}");
                        continue;
                    }
                };

                if form.is_definition() {
                    match session.define(form) {
                        Ok(name) => println!("{name} defined"),
                        Err(e) => println!("Error: {e}"),
                    }
                    continue;
                }

                match session.evaluate(&form) {
                    Ok(value) => println!("{value}"),
                    Err(e) => println!("Error: {e}"),
                }
            }

            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
}

fn print_help() {
    println!("TwinLisp REPL commands:");
    println!("  :help  - Show this help message");
    println!("  :env   - Show the functions defined so far");
    println!("  :ast   - Evaluate with the tree-walking interpreter (default)");
    println!("  :vm    - Compile each expression and run it on the bytecode VM");
    println!("  :dis   - Disassemble the session's definitions");
    println!("  :quit  - Exit the interpreter");
    println!("  :exit  - Exit the interpreter");
    println!("  Ctrl+C - Exit the interpreter");
    println!();
    println!("Language:");
    println!("  Integers: 42 (negative values via subtraction: (- 0 5))");
    println!("  Arithmetic: (+ a b), (- a b)");
    println!("  Comparison: (> a b), (>= a b), (< a b), (<= a b)  => 1 or 0");
    println!("  Conditionals: (if cond then else)");
    println!("  Sequencing: (begin e1 e2 ...)");
    println!("  Output: (print e)");
    println!("  Functions: (def name (params ...) body ...)");
    println!();
    println!("In VM mode, functions with two or more parameters bind their");
    println!("parameters back to front: (def sub (a b) (- a b)) (sub 10 3) => -7");
    println!();
}

fn print_environment(env: &Environment) {
    let bindings = env.get_all_bindings();

    if bindings.is_empty() {
        println!("Environment is empty.");
        return;
    }

    println!("Environment bindings ({} total):", bindings.len());
    for (name, value) in bindings {
        match value {
            Value::Function { params, .. } => println!("  {name} ({})", params.join(" ")),
            other => println!("  {name} = {other}"),
        }
    }
}
