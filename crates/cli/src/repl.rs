//! Interactive REPL. One line in, one interpretation out; errors are
//! reported and the prompt returns. Globals persist across lines because
//! every line runs in the same module record.

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use crux_core::Vm;

pub fn run(vm: &mut Vm) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("Could not start the line editor: {}.", e);
            return;
        }
    };
    println!("crux {} — ctrl-d to exit", env!("CARGO_PKG_VERSION"));
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                // Errors were already reported; the prompt just returns.
                let _ = vm.interpret(&line, None);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Could not read input: {}.", e);
                break;
            }
        }
    }
}
