use std::ffi::OsString;

use anyhow::{anyhow, Context as _};

use bark::verify;
use bark::Project;

use crate::terminal as term;

pub const HELP: &str = r#"
Usage

    bark verify [<target>] [--bootstrap <commit>] [<option>...]
    bark verify --all

    Verifies a reference or a single commit. With no target, the checked-out
    branch is verified. A target naming a reference is verified against the
    policy branch; to verify an arbitrary commit, pass a trusted bootstrap
    explicitly.

Options

    --all                  Verify all references protected by the policy
    --bootstrap <commit>   Verify the target against this bootstrap, bypassing the policy
    --help                 Print help
"#;

#[derive(Debug, Default)]
pub struct Options {
    pub target: Option<String>,
    pub bootstrap: Option<String>,
    pub all: bool,
}

impl Options {
    pub fn from_args(args: Vec<OsString>) -> Result<Self, super::Error> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_args(args);
        let mut options = Options::default();

        while let Some(arg) = parser.next()? {
            match arg {
                Value(val) if options.target.is_none() => {
                    options.target = Some(val.to_string_lossy().into_owned());
                }
                Long("bootstrap") => {
                    let val = parser.value()?;
                    options.bootstrap = Some(val.to_string_lossy().into_owned());
                }
                Long("all") => options.all = true,
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
    let cwd = std::env::current_dir().map_err(anyhow::Error::from)?;
    let mut project = Project::open(&cwd).context("could not open repository")?;

    if options.all {
        let report = match verify::verify_all(&mut project) {
            Ok(report) => report,
            Err(e) => return finish(project, Err(e)),
        };
        if report.is_valid() {
            project.update().map_err(anyhow::Error::from)?;
            term::success("All references are valid");
            return Ok(());
        }
        eprint!("{report}");
        project.update().map_err(anyhow::Error::from)?;
        return Err(super::Error::Denied);
    }

    let target = options.target.as_deref().unwrap_or("HEAD");
    let (head, refname) = {
        let (commit, refname) = project
            .repo()
            .resolve(target)
            .with_context(|| format!("could not resolve '{target}'"))?;
        (commit.id(), refname)
    };

    let result = match (&options.bootstrap, refname) {
        (Some(bootstrap), _) => {
            let bootstrap = {
                let (commit, _) = project
                    .repo()
                    .resolve(bootstrap)
                    .with_context(|| format!("could not resolve '{bootstrap}'"))?;
                commit.id()
            };
            verify::verify_commit(&mut project, head, bootstrap)
        }
        (None, Some(refname)) => verify::verify_ref(&mut project, &refname, head),
        (None, None) => {
            return Err(anyhow!(
                "'{target}' does not name a reference; pass --bootstrap to verify a commit"
            )
            .into())
        }
    };

    if result.is_ok() {
        term::success(format!("{target} is valid"));
    }
    finish(project, result)
}

/// Flush project state and translate a verification outcome into an exit
/// status. Cancelled runs keep their pending writes discarded.
pub(super) fn finish(project: Project, result: Result<(), verify::Error>) -> Result<(), super::Error> {
    match result {
        Ok(()) => {
            project.update().map_err(anyhow::Error::from)?;
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            term::error("verification was cancelled");
            drop(project);
            Err(super::Error::Denied)
        }
        Err(e) => match e.violation().cloned() {
            Some(violation) => {
                term::error(violation);
                project.update().map_err(anyhow::Error::from)?;
                Err(super::Error::Denied)
            }
            None => {
                project.update().map_err(anyhow::Error::from)?;
                Err(anyhow::Error::new(e).into())
            }
        },
    }
}
