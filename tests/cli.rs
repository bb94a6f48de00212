//! End-to-end tests for the `mocha` binary: exit codes, stdout, and the
//! stderr diagnostics a script author actually sees.

use std::io::Write;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::NamedTempFile;

fn mocha_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mocha"))
}

fn script_file(source: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp script");
    file.write_all(source.as_bytes()).expect("failed to write script");
    file
}

#[test]
fn test_print_pipeline() {
    let script = script_file("print 1 + 2 * 3;");
    Command::new(mocha_bin())
        .arg(script.path())
        .assert()
        .success()
        .stdout("7\n");
}

#[test]
fn test_string_concatenation() {
    let script = script_file("var a = \"foo\"; var b = \"bar\"; print a + b;");
    Command::new(mocha_bin())
        .arg(script.path())
        .assert()
        .success()
        .stdout("foobar\n");
}

#[test]
fn test_closure_counter() {
    let script = script_file(
        "fun counter() { var i = 0; fun inc() { i = i + 1; return i; } return inc; }
         var c = counter();
         print c(); print c(); print c();",
    );
    Command::new(mocha_bin())
        .arg(script.path())
        .assert()
        .success()
        .stdout("1\n2\n3\n");
}

#[test]
fn test_class_dispatch() {
    let script = script_file(
        "class Greeter { greet(who) { print \"hi \" + who; } } Greeter().greet(\"world\");",
    );
    Command::new(mocha_bin())
        .arg(script.path())
        .assert()
        .success()
        .stdout("hi world\n");
}

#[test]
fn test_super_dispatch() {
    let script = script_file(
        "class A { m() { print \"A\"; } }
         class B < A { m() { super.m(); print \"B\"; } }
         B().m();",
    );
    Command::new(mocha_bin())
        .arg(script.path())
        .assert()
        .success()
        .stdout("A\nB\n");
}

#[test]
fn test_for_loop() {
    let script = script_file("for (var i = 0; i < 3; i = i + 1) print i;");
    Command::new(mocha_bin())
        .arg(script.path())
        .assert()
        .success()
        .stdout("0\n1\n2\n");
}

#[test]
fn test_runtime_error_exit_code_and_trace() {
    let script = script_file("print a;");
    Command::new(mocha_bin())
        .arg(script.path())
        .assert()
        .code(70)
        .stderr(predicate::str::contains("Undefined variable 'a'."))
        .stderr(predicate::str::contains("in script"));
}

#[test]
fn test_runtime_error_trace_names_functions() {
    let script = script_file(
        "fun inner() { return missing; }
         fun outer() { return inner(); }
         outer();",
    );
    Command::new(mocha_bin())
        .arg(script.path())
        .assert()
        .code(70)
        .stderr(predicate::str::contains("in inner()"))
        .stderr(predicate::str::contains("in outer()"))
        .stderr(predicate::str::contains("in script"));
}

#[test]
fn test_compile_error_exit_code() {
    let script = script_file("class X < X {}");
    Command::new(mocha_bin())
        .arg(script.path())
        .assert()
        .code(65)
        .stderr(predicate::str::contains("cannot inherit from itself"));
}

#[test]
fn test_usage_error_exit_code() {
    let first = script_file("print 1;");
    let second = script_file("print 2;");
    Command::new(mocha_bin())
        .arg(first.path())
        .arg(second.path())
        .assert()
        .code(64)
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_missing_file_exit_code() {
    Command::new(mocha_bin())
        .arg("definitely-not-a-real-file.lox")
        .assert()
        .code(74)
        .stderr(predicate::str::contains("Could not open file"));
}

#[test]
fn test_clock_native_is_registered() {
    let script = script_file("print clock() > 0;");
    Command::new(mocha_bin())
        .arg(script.path())
        .assert()
        .success()
        .stdout("true\n");
}

#[test]
fn test_repl_evaluates_lines() {
    Command::new(mocha_bin())
        .write_stdin("print 40 + 2;\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("42"));
}
