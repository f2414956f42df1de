extern crate eidsign;

use std::io;
use std::process::exit;

use clap::Parser;
use clap::error::ErrorKind;
use eidsign::cli::Options;
use eidsign::config::Config;

fn error(error: impl std::fmt::Display) -> ! {
    eprintln!("{}", error);
    exit(1);
}

fn main() {
    let options = match Options::try_parse() {
        Ok(options) => options,
        Err(e) => {
            let _ = e.print();
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit(0),
                _ => exit(1),
            }
        }
    };

    let mut config = match Config::read_or_default(options.general.config.as_deref()) {
        Ok(config) => config,
        Err(e) => error(e),
    };
    if let Err(e) = config.override_log_level(options.general.log_level) {
        error(e)
    }
    if let Err(e) = config.init_logging() {
        error(e)
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if let Err(e) = options.command.run(&config, &mut out) {
        error(e)
    }
}
