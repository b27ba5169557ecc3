use std::ffi::OsString;
use std::fs;

use anyhow::{anyhow, Context as _};

use bark::git::{Oid, Repository};
use bark::policy::BARK_RULES_REF;
use bark::Project;

use crate::terminal as term;

/// The hook script: transactions are verified once prepared, before any
/// reference moves.
const HOOK: &str = "\
#!/bin/sh
# Installed by bark; verifies reference updates before they take effect.
[ \"$1\" = \"prepared\" ] || exit 0
exec bark hook prepared
";

const HOOK_NAME: &str = "reference-transaction";

pub const HELP: &str = r#"
Usage

    bark install [--bootstrap <commit>]

    Chooses the bootstrap commit to trust for the policy branch and installs
    the repository hook gating reference updates. Without --bootstrap, the
    root commit of `refs/heads/bark_rules` is trusted.

Options

    --bootstrap <commit>   The policy-branch commit to trust
    --help                 Print help
"#;

#[derive(Debug, Default)]
pub struct Options {
    pub bootstrap: Option<String>,
}

impl Options {
    pub fn from_args(args: Vec<OsString>) -> Result<Self, super::Error> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_args(args);
        let mut options = Options::default();

        while let Some(arg) = parser.next()? {
            match arg {
                Long("bootstrap") => {
                    let val = parser.value()?;
                    options.bootstrap = Some(val.to_string_lossy().into_owned());
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
    let cwd = std::env::current_dir().map_err(anyhow::Error::from)?;
    let mut project = Project::open(&cwd).context("could not open repository")?;

    let bootstrap = match &options.bootstrap {
        Some(name) => {
            let (commit, _) = project
                .repo()
                .resolve(name)
                .with_context(|| format!("could not resolve '{name}'"))?;
            commit.id()
        }
        None => root_of(project.repo(), BARK_RULES_REF)
            .context("could not determine the policy branch root; does `refs/heads/bark_rules` exist?")?,
    };
    project.set_bootstrap(bootstrap);

    let hooks = project.repo().git_dir().join("hooks");
    fs::create_dir_all(&hooks).map_err(anyhow::Error::from)?;
    let path = hooks.join(HOOK_NAME);

    match fs::read_to_string(&path) {
        Ok(existing) if !existing.contains("bark") => {
            return Err(anyhow!(
                "refusing to overwrite existing `{HOOK_NAME}` hook at '{}'",
                path.display()
            )
            .into());
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(anyhow::Error::from(e).into()),
    }
    fs::write(&path, HOOK).map_err(anyhow::Error::from)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .map_err(anyhow::Error::from)?;
    }

    project.update().map_err(anyhow::Error::from)?;
    term::success(format!("Trusting bootstrap {bootstrap}"));
    term::success(format!("Hook installed at '{}'", path.display()));

    Ok(())
}

/// Follow first parents down to the root of the given reference.
fn root_of(repo: &Repository, name: &str) -> anyhow::Result<Oid> {
    let (mut commit, _) = repo.resolve(name)?;
    loop {
        match commit.parents()?.into_iter().next() {
            Some(parent) => commit = parent,
            None => return Ok(commit.id()),
        }
    }
}
