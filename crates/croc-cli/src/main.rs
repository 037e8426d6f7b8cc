use std::{env, fs, process::ExitCode};

use croc::Vm;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let Some(file_path) = args.get(1) else {
        eprintln!("usage: croc <script.croc>");
        return ExitCode::FAILURE;
    };

    let source = match fs::read_to_string(file_path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: cannot read '{file_path}': {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut vm = Vm::new();
    match vm.run_source(file_path, &source) {
        Ok(_) => ExitCode::SUCCESS,
        Err(exc) => {
            eprintln!("{}", exc.traceback_string());
            ExitCode::FAILURE
        }
    }
}
