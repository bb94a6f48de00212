use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::process::exit;

use mocha::std_mod::time::ClockTime;
use mocha::vm::{InterpretResult, VM};

fn repl(vm: &mut VM) {
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush().expect("failed to flush stdout");

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                println!();
                return;
            }
            Ok(_) => {
                vm.interpret(&line);
            }
            Err(_) => {
                println!();
                return;
            }
        }
    }
}

fn run_file(vm: &mut VM, path: &str) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(_) => {
            eprintln!("Could not open file '{}'.", path);
            exit(74);
        }
    };

    match vm.interpret(&source) {
        InterpretResult::InterpretCompileError => exit(65),
        InterpretResult::InterpretRuntimeError => exit(70),
        InterpretResult::InterpretOk => {}
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();

    let mut vm = VM::new();
    vm.define_native("clock", 0, ClockTime::new());

    match args.len() {
        1 => repl(&mut vm),
        2 => run_file(&mut vm, &args[1]),
        _ => {
            eprintln!("Usage: mocha [script]");
            exit(64);
        }
    }
}
