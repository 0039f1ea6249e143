use std::path::PathBuf;
use std::process;
use std::time::Instant;

use twinlisp::bytecode::disassemble;
use twinlisp::evaluator::{self, Environment};
use twinlisp::vm::{DEFAULT_STACK_CAPACITY, Vm, VmConfig};
use twinlisp::{Engine, Error, compiler, reader};

struct Options {
    engine: Engine,
    stack_capacity: usize,
    disassemble: bool,
    filename: PathBuf,
}

fn print_usage() {
    println!("Usage: twinlisp [options] <input file>");
    println!("Options:");
    println!("  -h, --help: Print this help message");
    println!("  --mode <ast|vm>: Execution engine (default: ast)");
    println!("  --stack-size <cells>: VM stack capacity (default: {DEFAULT_STACK_CAPACITY})");
    println!("  --disassemble: Print the compiled bytecode before running (vm mode)");
}

fn parse_options() -> Result<Options, String> {
    let mut args = pico_args::Arguments::from_env();

    if args.contains(["-h", "--help"]) {
        print_usage();
        process::exit(0);
    }

    let engine = args
        .opt_value_from_str::<_, Engine>("--mode")
        .map_err(|e| e.to_string())?
        .unwrap_or_default();
    let stack_capacity = args
        .opt_value_from_str::<_, usize>("--stack-size")
        .map_err(|e| e.to_string())?
        .unwrap_or(DEFAULT_STACK_CAPACITY);
    let disassemble = args.contains("--disassemble");

    let filename: PathBuf = args
        .free_from_str()
        .map_err(|_| "missing input file".to_owned())?;

    let rest = args.finish();
    if !rest.is_empty() {
        return Err(format!("unexpected arguments: {rest:?}"));
    }

    Ok(Options {
        engine,
        stack_capacity,
        disassemble,
        filename,
    })
}

/// Report a failed stage and exit
fn fail(stage: &str, error: &Error) -> ! {
    eprintln!("{stage} error: {error}");
    process::exit(1);
}

fn main() {
    env_logger::init();

    let options = match parse_options() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {e}");
            print_usage();
            process::exit(2);
        }
    };

    let source = match std::fs::read_to_string(&options.filename) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Error: cannot read {}: {e}", options.filename.display());
            process::exit(1);
        }
    };

    let program = reader::parse_program(&source).unwrap_or_else(|e| fail("parse", &e));
    log::debug!("running {} with the {} engine", options.filename.display(), options.engine);

    let stdout = std::io::stdout();
    let (result, elapsed) = match options.engine {
        Engine::Tree => {
            let mut env = Environment::new();
            let start = Instant::now();
            let value = evaluator::run_program_with_output(&program, &mut env, &mut stdout.lock())
                .and_then(|value| value.as_integer());
            (value, start.elapsed())
        }
        Engine::Bytecode => {
            let compiled = compiler::compile(&program).unwrap_or_else(|e| fail("compile", &e));
            if options.disassemble {
                print!("{}", disassemble(&compiled));
            }
            let vm = Vm::new(VmConfig {
                stack_capacity: options.stack_capacity,
            });
            let start = Instant::now();
            let value = vm.run(&compiled, &mut stdout.lock());
            (value, start.elapsed())
        }
    };

    match result {
        Ok(value) => println!("Result: {value}, Time: {elapsed:?}"),
        Err(e) => fail("run", &e),
    }
}
