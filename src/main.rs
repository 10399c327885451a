use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;

use demov::driver::{self, Options, USAGE};

fn main() -> ExitCode {
    env_logger::init();

    let opts = match Options::try_parse() {
        Ok(opts) => opts,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("{}", e.kind());
            eprintln!("{}", USAGE);
            return ExitCode::from(1);
        }
    };

    let failed = driver::run(&opts);
    if failed > 0 {
        log::warn!("{} of {} inputs failed", failed, opts.inputs.len());
    }
    ExitCode::SUCCESS
}
