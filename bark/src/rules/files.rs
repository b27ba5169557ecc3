//! File-modification rules.
use regex::Regex;
use serde_yaml::Value;

use super::str_arg;
use crate::git::Commit;
use crate::rule::{CommitRule, Context, Error, ParseError, Violation};

/// Rejects commits touching files matching a pattern, relative to the
/// validator commit. Used to lock down paths like the key directory.
struct FileNotModified<'r> {
    validator: Commit<'r>,
    pattern: Regex,
    source: String,
}

impl CommitRule for FileNotModified<'_> {
    fn validate(&self, commit: &Commit<'_>, _ctx: &Context<'_>) -> Result<(), Error> {
        let modified = commit.files_modified(&self.validator)?;

        if modified.iter().any(|path| self.pattern.is_match(path)) {
            return Err(Violation::new(format!(
                "Commit modified locked file(s) matching '{}'",
                self.source
            ))
            .into());
        }
        Ok(())
    }
}

pub(crate) fn file_not_modified<'r>(
    validator: Commit<'r>,
    args: &Value,
) -> Result<Box<dyn CommitRule + 'r>, Error> {
    let source = str_arg(args, "file_not_modified", "pattern")?;
    let pattern = Regex::new(&format!("^(?:{source})")).map_err(|e| {
        Error::Parse(ParseError::Args {
            rule: "file_not_modified".to_owned(),
            reason: e.to_string(),
        })
    })?;

    Ok(Box::new(FileNotModified {
        validator,
        pattern,
        source,
    }))
}
