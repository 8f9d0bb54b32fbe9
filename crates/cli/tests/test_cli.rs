//! Process-level CLI tests: stdout and exit codes of the real binary.

use std::process::Command;

fn crux() -> Command {
    Command::new(env!("CARGO_BIN_EXE_crux"))
}

#[test]
fn test_runs_a_script_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let script = dir.path().join("ok.crx");
    std::fs::write(&script, "print(1 + 2 * 3);\n").expect("write script");

    let output = crux().arg(&script).output().expect("binary runs");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "7\n");
}

#[test]
fn test_missing_file_exits_2() {
    let output = crux()
        .arg("/definitely/not/here.crx")
        .output()
        .expect("binary runs");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_compile_error_exits_65() {
    let dir = tempfile::tempdir().expect("temp dir");
    let script = dir.path().join("bad.crx");
    std::fs::write(&script, "let x = ;\n").expect("write script");

    let output = crux().arg(&script).output().expect("binary runs");
    assert_eq!(output.status.code(), Some(65));
    assert!(!output.stderr.is_empty(), "diagnostics go to stderr");
}

#[test]
fn test_runtime_error_exits_70() {
    let dir = tempfile::tempdir().expect("temp dir");
    let script = dir.path().join("boom.crx");
    std::fs::write(&script, "print(1 / 0);\n").expect("write script");

    let output = crux().arg(&script).output().expect("binary runs");
    assert_eq!(output.status.code(), Some(70));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("MATH"), "stderr was: {stderr}");
}

#[test]
fn test_extra_arguments_exit_64() {
    let output = crux()
        .args(["one.crx", "two.crx"])
        .output()
        .expect("binary runs");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn test_module_import_end_to_end() {
    let dir = tempfile::tempdir().expect("temp dir");
    std::fs::write(
        dir.path().join("m.crx"),
        "pub fn add(a, b) { return a + b; }\n",
    )
    .expect("write module");
    let main = dir.path().join("main.crx");
    std::fs::write(&main, "use {add} from \"m\"; print(add(2, 3));\n").expect("write main");

    let output = crux().arg(&main).output().expect("binary runs");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "5\n");
}

#[test]
fn test_determinism_same_source_same_output() {
    let dir = tempfile::tempdir().expect("temp dir");
    let script = dir.path().join("det.crx");
    std::fs::write(
        &script,
        "let t = {\"a\": 1, \"b\": 2};\n\
         print(length(t));\n\
         for (let i = 0; i < 100; i = i + 1) { let junk = [i]; }\n\
         print(\"done\");\n",
    )
    .expect("write script");

    let first = crux().arg(&script).output().expect("binary runs");
    let second = crux().arg(&script).output().expect("binary runs");
    assert_eq!(first.status.code(), Some(0));
    assert_eq!(first.stdout, second.stdout);
    assert_eq!(first.status.code(), second.status.code());
}
