//! Module loader tests: imports, caching, cycle detection, and native
//! modules. Source files live in temp directories.

use std::cell::RefCell;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;

use crux_core::Vm;

#[derive(Clone, Default)]
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run_file(path: &Path) -> (Result<(), ()>, String) {
    let source = std::fs::read_to_string(path).expect("script exists");
    let buffer = SharedBuffer::default();
    let mut vm = Vm::with_output(vec![], Box::new(buffer.clone()));
    let result = vm.interpret(&source, Some(path)).map_err(|_| ());
    let output = String::from_utf8(buffer.0.borrow().clone()).expect("output is UTF-8");
    (result, output)
}

#[test]
fn test_import_names_from_module() {
    let dir = tempfile::tempdir().expect("temp dir");
    std::fs::write(
        dir.path().join("m.crx"),
        "pub fn add(a, b) { return a + b; }\n",
    )
    .expect("write module");
    let main = dir.path().join("main.crx");
    std::fs::write(&main, "use {add} from \"m\"; print(add(2, 3));\n").expect("write main");

    let (result, output) = run_file(&main);
    assert!(result.is_ok());
    assert_eq!(output, "5\n");
}

#[test]
fn test_import_whole_module_as_name() {
    let dir = tempfile::tempdir().expect("temp dir");
    std::fs::write(
        dir.path().join("m.crx"),
        "pub fn add(a, b) { return a + b; }\npub let answer = 42;\n",
    )
    .expect("write module");
    let main = dir.path().join("main.crx");
    std::fs::write(
        &main,
        "use \"m\" as m; print(m.add(4, 4)); print(m.answer);\n",
    )
    .expect("write main");

    let (result, output) = run_file(&main);
    assert!(result.is_ok());
    assert_eq!(output, "8\n42\n");
}

#[test]
fn test_module_top_level_runs_once() {
    let dir = tempfile::tempdir().expect("temp dir");
    std::fs::write(
        dir.path().join("m.crx"),
        "print(\"loaded\");\npub let x = 1;\n",
    )
    .expect("write module");
    let main = dir.path().join("main.crx");
    std::fs::write(
        &main,
        "use {x} from \"m\";\nuse {x} from \"m\";\nprint(x);\n",
    )
    .expect("write main");

    let (result, output) = run_file(&main);
    assert!(result.is_ok());
    // Duplicate imports reuse the cached record; the module body printed
    // exactly once.
    assert_eq!(output, "loaded\n1\n");
}

#[test]
fn test_private_names_are_not_importable() {
    let dir = tempfile::tempdir().expect("temp dir");
    std::fs::write(
        dir.path().join("m.crx"),
        "let secret = 1;\npub let open = 2;\n",
    )
    .expect("write module");
    let main = dir.path().join("main.crx");
    std::fs::write(&main, "use {secret} from \"m\";\n").expect("write main");

    let (result, _) = run_file(&main);
    assert!(result.is_err(), "private names must not be importable");
}

#[test]
fn test_circular_import_is_detected() {
    let dir = tempfile::tempdir().expect("temp dir");
    std::fs::write(dir.path().join("a.crx"), "use {b} from \"b\";\npub let a = 1;\n")
        .expect("write a");
    std::fs::write(dir.path().join("b.crx"), "use {a} from \"a\";\npub let b = 2;\n")
        .expect("write b");
    let main = dir.path().join("main.crx");
    std::fs::write(&main, "use {a} from \"a\";\n").expect("write main");

    let (result, _) = run_file(&main);
    assert!(result.is_err(), "the cycle must be reported, not looped");
}

#[test]
fn test_missing_module_is_an_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let main = dir.path().join("main.crx");
    std::fs::write(&main, "use {x} from \"does_not_exist\";\n").expect("write main");

    let (result, _) = run_file(&main);
    assert!(result.is_err());
}

#[test]
fn test_transitive_imports() {
    let dir = tempfile::tempdir().expect("temp dir");
    std::fs::write(dir.path().join("inner.crx"), "pub fn one() { return 1; }\n")
        .expect("write inner");
    std::fs::write(
        dir.path().join("outer.crx"),
        "use {one} from \"inner\";\npub fn two() { return one() + 1; }\n",
    )
    .expect("write outer");
    let main = dir.path().join("main.crx");
    std::fs::write(&main, "use {two} from \"outer\"; print(two());\n").expect("write main");

    let (result, output) = run_file(&main);
    assert!(result.is_ok());
    assert_eq!(output, "2\n");
}

#[test]
fn test_native_module_import() {
    let dir = tempfile::tempdir().expect("temp dir");
    let main = dir.path().join("main.crx");
    std::fs::write(
        &main,
        "use {pow} from \"math\";\n\
         match pow(2, 3) { Ok(v) => print(v); Err(e) => print(\"bad\"); }\n\
         use \"math\" as math;\n\
         print(math.pi());\n",
    )
    .expect("write main");

    let (result, output) = run_file(&main);
    assert!(result.is_ok());
    assert_eq!(output, format!("8\n{}\n", std::f64::consts::PI));
}

#[test]
fn test_module_error_propagates_to_importer() {
    let dir = tempfile::tempdir().expect("temp dir");
    std::fs::write(dir.path().join("m.crx"), "print(boom);\n").expect("write module");
    let main = dir.path().join("main.crx");
    std::fs::write(&main, "use {x} from \"m\";\n").expect("write main");

    let (result, _) = run_file(&main);
    assert!(result.is_err(), "a failing module body fails the import");
}

#[test]
fn test_io_module_file_round_trip() {
    let dir = tempfile::tempdir().expect("temp dir");
    let file_path = dir.path().join("out.txt").to_string_lossy().into_owned();
    let main = dir.path().join("main.crx");
    let source = format!(
        "use {{open}} from 'io';\n\
         match open('{p}', 'w') {{\n\
           Ok(f) => {{ f.write('hello'); f.writeln(' world'); f.close(); }}\n\
           Err(e) => print('bad open');\n\
         }}\n\
         match open('{p}', 'r') {{\n\
           Ok(f) => {{ print(f.read_all().unwrap_or('bad').trim()); f.close(); }}\n\
           Err(e) => print('bad open');\n\
         }}\n\
         match open('{p}', 'r') {{\n\
           Ok(f) => {{\n\
             print(f.read_line().unwrap_or(nil));\n\
             print(f.read_line().unwrap_or(nil));\n\
             f.close();\n\
           }}\n\
           Err(e) => print('bad open');\n\
         }}\n",
        p = file_path
    );
    std::fs::write(&main, source).expect("write main");

    let (result, output) = run_file(&main);
    assert!(result.is_ok());
    // read_all sees the full contents; read_line stops at the newline and
    // then reports end of file as nil.
    assert_eq!(output, "hello world\nhello world\nnil\n");
    let written = std::fs::read_to_string(dir.path().join("out.txt")).expect("file written");
    assert_eq!(written, "hello world\n", "writeln must append the newline");
}

#[test]
fn test_io_module_rejects_unknown_mode() {
    let dir = tempfile::tempdir().expect("temp dir");
    let file_path = dir.path().join("out.txt").to_string_lossy().into_owned();
    let main = dir.path().join("main.crx");
    let source = format!(
        "use {{open}} from 'io';\n\
         match open('{p}', 'x') {{\n\
           Ok(f) => print('opened');\n\
           Err(e) => print(e.message());\n\
         }}\n",
        p = file_path
    );
    std::fs::write(&main, source).expect("write main");

    let (result, output) = run_file(&main);
    assert!(result.is_ok());
    assert_eq!(output, "Argument <mode> must be 'r', 'w', or 'a'.\n");
}

#[test]
fn test_fs_module_path_round_trip() {
    let dir = tempfile::tempdir().expect("temp dir");
    let sub = dir.path().join("sub").to_string_lossy().into_owned();
    let file_path = dir.path().join("sub/f.txt").to_string_lossy().into_owned();
    let main = dir.path().join("main.crx");
    let source = format!(
        "use {{path_exists, is_dir, is_file, make_dir, remove_file, list_dir}} from 'fs';\n\
         use {{open}} from 'io';\n\
         print(path_exists('{sub}').unwrap_or(nil));\n\
         make_dir('{sub}');\n\
         print(is_dir('{sub}').unwrap_or(nil));\n\
         match open('{file}', 'w') {{ Ok(f) => f.close(); Err(e) => print('bad open'); }}\n\
         print(is_file('{file}').unwrap_or(nil));\n\
         print(length(list_dir('{sub}').unwrap_or([])));\n\
         remove_file('{file}');\n\
         print(path_exists('{file}').unwrap_or(nil));\n",
        sub = sub,
        file = file_path
    );
    std::fs::write(&main, source).expect("write main");

    let (result, output) = run_file(&main);
    assert!(result.is_ok());
    assert_eq!(output, "false\ntrue\ntrue\n1\nfalse\n");
    assert!(dir.path().join("sub").is_dir(), "directory was created on disk");
    assert!(!dir.path().join("sub/f.txt").exists(), "file was removed on disk");
}

#[test]
fn test_sys_and_time_modules() {
    let dir = tempfile::tempdir().expect("temp dir");
    let main = dir.path().join("main.crx");
    std::fs::write(
        &main,
        "use {platform, arch, args, get_env} from 'sys';\n\
         print(typeof platform());\n\
         print(typeof arch());\n\
         print(args().is_ok());\n\
         print(get_env('CRUX_TEST_UNSET_VARIABLE_9Z').is_err());\n\
         use {now_seconds, now_millis, sleep_millis} from 'time';\n\
         print(typeof now_seconds());\n\
         print(now_millis() > 0);\n\
         sleep_millis(1);\n\
         print('done');\n",
    )
    .expect("write main");

    let (result, output) = run_file(&main);
    assert!(result.is_ok());
    assert_eq!(
        output,
        "string\nstring\ntrue\ntrue\nfloat\ntrue\ndone\n"
    );
}
