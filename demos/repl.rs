use evavm::Error;
use evavm::value::Value;
use evavm::vm::Vm;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::panic;
use std::process;

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

fn run_repl() {
    println!("Eva bytecode VM");
    println!("Enter expressions like: (+ 1 2)");
    println!("Type :help for more commands, or Ctrl+C to exit.");
    println!();

    let mut rl = DefaultEditor::new().expect("Could not initialize REPL");
    let mut vm = Vm::new();

    loop {
        match rl.readline("eva> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                match line {
                    ":help" => {
                        print_help();
                        continue;
                    }
                    ":dis" => {
                        match vm.disassemble() {
                            Ok(listing) => println!("{listing}"),
                            Err(e) => println!("Error: {e}"),
                        }
                        continue;
                    }
                    ":mem" => {
                        println!("Objects allocated: {}", vm.heap().object_count());
                        println!("Bytes allocated:   {}", vm.heap().bytes_allocated());
                        continue;
                    }
                    ":gc" => {
                        let freed = vm.collect_garbage();
                        println!("Freed {freed} objects.");
                        continue;
                    }
                    ":quit" | ":exit" => {
                        println!("Goodbye!");
                        break;
                    }
                    _ => {}
                }

                match vm.exec(line) {
                    Ok(result) => print_result(&vm, result),
                    Err(e @ Error::ParseError(_)) => {
                        // A parse failure never started the VM; keep it
                        println!("Error: {e}");
                    }
                    Err(e) => {
                        // A failed execution leaves the VM unusable;
                        // definitions from this session are gone
                        println!("Error: {e}");
                        println!("(VM state reset)");
                        vm = Vm::new();
                    }
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

fn print_result(vm: &Vm, result: Value) {
    println!("{}", vm.display_value(result));
}

fn print_help() {
    println!("Eva REPL commands:");
    println!("  :help  - Show this help message");
    println!("  :dis   - Disassemble the last compiled program");
    println!("  :mem   - Show heap statistics");
    println!("  :gc    - Run a garbage collection cycle");
    println!("  :quit  - Exit the interpreter");
    println!("  :exit  - Exit the interpreter");
    println!("  Ctrl+C - Exit the interpreter");
    println!();
    println!("The language:");
    println!("  Numbers: 42, -5, 3.14       Booleans: true, false");
    println!("  Strings: \"hello\"");
    println!("  Arithmetic: + - * /         Comparison: < > == >= <= !=");
    println!("  Variables: (var x 10), (set x 20)");
    println!("  Blocks: (begin e1 e2 ...)   Control: (if t c a), (while t body)");
    println!("  Functions: (def f (x) body), (lambda (x) body)");
    println!("  Classes: (class Name null (def constructor (self) self) ...)");
    println!("           (new Name args), (prop obj name)");
    println!();
    println!("Globals persist between lines: try (var x 10) then (+ x VERSION).");
}
