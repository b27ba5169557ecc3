use std::ffi::OsString;
use std::io::BufRead as _;

use anyhow::{anyhow, Context as _};

use bark::verify;
use bark::{Project, RefUpdate};

use crate::terminal as term;

pub const HELP: &str = r#"
Usage

    bark hook [<state>]

    Reads reference updates from standard input, one `<old> <new> <refname>`
    line per reference, and verifies each update. Intended to be called from
    the repository's `reference-transaction` hook; anything but the
    "prepared" state is ignored. A non-zero exit cancels the transaction.
"#;

#[derive(Debug, Default)]
pub struct Options {
    pub state: Option<String>,
}

impl Options {
    pub fn from_args(args: Vec<OsString>) -> Result<Self, super::Error> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_args(args);
        let mut options = Options::default();

        while let Some(arg) = parser.next()? {
            match arg {
                Value(val) if options.state.is_none() => {
                    options.state = Some(val.to_string_lossy().into_owned());
                }
                Long("help") | Short('h') => {
                    println!("{HELP}");
                    std::process::exit(0);
                }
                arg => return Err(anyhow!(arg.unexpected()).into()),
            }
        }
        Ok(options)
    }
}

pub fn run(options: Options) -> Result<(), super::Error> {
    if let Some(state) = &options.state {
        if state != "prepared" {
            return Ok(());
        }
    }

    let mut updates = Vec::new();
    for line in std::io::stdin().lock().lines() {
        let line = line.map_err(anyhow::Error::from)?;
        if line.trim().is_empty() {
            continue;
        }
        let update = line
            .parse::<RefUpdate>()
            .with_context(|| format!("invalid hook input: '{line}'"))?;
        updates.push(update);
    }

    let cwd = std::env::current_dir().map_err(anyhow::Error::from)?;
    let mut project = Project::open(&cwd).context("could not open repository")?;

    for update in &updates {
        log::info!(target: "hook", "Verifying {update}");
        match verify::verify_ref_update(&mut project, update) {
            Ok(()) => {}
            Err(e) => {
                term::error(format!("rejecting update of '{}'", update.name));
                return super::verify::finish(project, Err(e));
            }
        }
    }
    project.update().map_err(anyhow::Error::from)?;
    Ok(())
}
