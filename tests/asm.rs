use std::io::Write;

use snapbox::cmd::Command;
use tempfile::NamedTempFile;

const GBASM_PATH: &str = env!("CARGO_BIN_EXE_gbasm");

fn asm_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Unable to create temp asm file");
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn macro_args_fold_into_prints() {
    let src = asm_file("macro m\nprintln \\1 + \\2\nendm\nm 1, 2\n");
    Command::new(GBASM_PATH)
        .arg(src.path())
        .assert()
        .success()
        .stdout_eq("$3\n");
}

#[test]
fn stdin_is_a_valid_input() {
    Command::new(GBASM_PATH)
        .arg("-")
        .stdin("println 2 ** 10\n")
        .assert()
        .success()
        .stdout_eq("$400\n");
}

#[test]
fn skipped_conditional_branches() {
    let src = asm_file("if 0\nprintln \"a\"\nelif 1\nprintln \"b\"\nelse\nprintln \"c\"\nendc\n");
    Command::new(GBASM_PATH)
        .arg(src.path())
        .assert()
        .success()
        .stdout_eq("b\n");
}

#[test]
fn rept_gets_fresh_unique_ids() {
    let src = asm_file("rept 2\nprintln \"\\@\"\nendr\n");
    Command::new(GBASM_PATH)
        .arg(src.path())
        .assert()
        .success()
        .stdout_eq("_u1\n_u2\n");
}

#[test]
fn command_line_defines_interpolate() {
    let src = asm_file("println \"{GREETING}, {COUNT} times\"\n");
    Command::new(GBASM_PATH)
        .arg(src.path())
        .arg("-D")
        .arg("GREETING=hello")
        .arg("-D")
        .arg("COUNT=3")
        .assert()
        .success()
        .stdout_eq("hello, 3 times\n");
}

#[test]
fn custom_binary_digits() {
    let src = asm_file("println %.#.#\n");
    Command::new(GBASM_PATH)
        .arg(src.path())
        .args(["-b", ".#"])
        .assert()
        .success()
        .stdout_eq("$5\n");
}

#[test]
fn errors_fail_the_assembly() {
    let src = asm_file("fail \"boom\"\n");
    Command::new(GBASM_PATH)
        .arg(src.path())
        .assert()
        .code(65);
}

#[test]
fn unterminated_macro_definition() {
    let src = asm_file("macro foo\nprintln \"never\"\n");
    Command::new(GBASM_PATH)
        .arg(src.path())
        .assert()
        .code(65)
        .stdout_eq("");
}

#[test]
fn missing_include_with_mg_exits_cleanly() {
    let depfile = NamedTempFile::new().unwrap();
    let src = asm_file("include \"not-there.inc\"\nprintln \"unreached\"\n");
    Command::new(GBASM_PATH)
        .arg(src.path())
        .arg("-M")
        .arg(depfile.path())
        .args(["--MG", "--MT", "out.o"])
        .assert()
        .success()
        .stdout_eq("");

    let deps = std::fs::read_to_string(depfile.path()).unwrap();
    assert!(deps.contains("out.o: not-there.inc"), "{deps}");
}

#[test]
fn state_file_dump() {
    let statefile = NamedTempFile::new().unwrap();
    let src = asm_file("def K equ 5\ndef S equs \"hi\"\ndef V = 2\n");
    Command::new(GBASM_PATH)
        .arg(src.path())
        .arg("-s")
        .arg(format!("all:{}", statefile.path().display()))
        .assert()
        .success();

    let state = std::fs::read_to_string(statefile.path()).unwrap();
    assert!(state.contains("def K equ 5"), "{state}");
    assert!(state.contains("def V = 2"), "{state}");
    assert!(state.contains("def S equs \"hi\""), "{state}");
}

#[test]
fn include_files_are_read() {
    let mut include = NamedTempFile::new().unwrap();
    include.write_all(b"def FROM_INCLUDE equ 41\n").unwrap();
    let src = asm_file(&format!(
        "include \"{}\"\nprintln FROM_INCLUDE + 1\n",
        include.path().display()
    ));
    Command::new(GBASM_PATH)
        .arg(src.path())
        .assert()
        .success()
        .stdout_eq("$2A\n");
}
