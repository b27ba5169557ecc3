mod commands;
mod terminal;

use std::ffi::OsString;
use std::process;

use commands::Error;
use terminal as term;

pub const NAME: &str = "bark";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = r#"
Usage

    bark <command> [<option>...]

Commands

    verify     Verify a reference, a commit, or the whole repository
    hook       Gate a reference transaction (called from the git hook)
    install    Choose a bootstrap and install the repository hook
    help       Print help
    version    Print version

Run `bark <command> --help` for command-specific options.
"#;

fn main() {
    if let Some(level) = bark::logger::env_level() {
        bark::logger::init(level).ok();
    }
    match run() {
        Ok(()) => process::exit(0),
        Err(err) => {
            // Violations are rendered where they occur; everything else is
            // reported here.
            if !matches!(err, Error::Denied) {
                term::error(format!("{NAME}: {err}"));
            }
            process::exit(err.exit_code());
        }
    }
}

fn run() -> Result<(), Error> {
    let mut args = std::env::args_os().skip(1);
    let command = args.next().unwrap_or_else(|| OsString::from("help"));
    let rest = args.collect::<Vec<_>>();

    match command.to_string_lossy().as_ref() {
        "verify" => commands::verify::run(commands::verify::Options::from_args(rest)?),
        "hook" => commands::hook::run(commands::hook::Options::from_args(rest)?),
        "install" => commands::install::run(commands::install::Options::from_args(rest)?),
        "version" | "--version" => {
            println!("{NAME} {VERSION}");
            Ok(())
        }
        "help" | "--help" | "-h" => {
            println!("{USAGE}");
            Ok(())
        }
        other => Err(anyhow::anyhow!("unknown command `{other}`; see `{NAME} help`").into()),
    }
}
