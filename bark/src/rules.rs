//! The built-in rule set.
//!
//! These rules are always registered; the policy branch's requirements
//! manifest refers to them as the `bark_core` module.
pub mod files;
pub mod keys;
pub mod parents;
pub mod reference;
pub mod signatures;

use serde_yaml::Value;

use crate::git::Commit;
use crate::rule::{
    CommitRule, Context, Error, ParseError, RefRule, Registry, Violation,
};

/// Module name of the built-in rules.
pub const MODULE: &str = "bark_core";

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Registry::empty();

        registry.builtin_commit_rule("require_signature", signatures::require_signature);
        registry.builtin_commit_rule("require_approval", signatures::require_approval);
        registry.builtin_commit_rule("invalid_parents", parents::invalid_parents);
        registry.builtin_commit_rule(
            "require_number_of_parents",
            parents::require_number_of_parents,
        );
        registry.builtin_commit_rule("file_not_modified", files::file_not_modified);
        registry.builtin_commit_rule("always_pass", always_pass_commit);
        registry.builtin_commit_rule("always_fail", always_fail_commit);

        registry.builtin_ref_rule("fast-forward-only", reference::fast_forward);
        registry.builtin_ref_rule("always_pass", always_pass_ref);
        registry.builtin_ref_rule("always_fail", always_fail_ref);

        registry.register_module(MODULE);
        registry
    }
}

/// Look up a required argument in a rule's argument mapping.
pub(crate) fn arg<'v>(args: &'v Value, rule: &str, key: &str) -> Result<&'v Value, Error> {
    args.as_mapping()
        .and_then(|m| m.get(&Value::String(key.to_owned())))
        .ok_or_else(|| {
            ParseError::Args {
                rule: rule.to_owned(),
                reason: format!("missing '{key}'"),
            }
            .into()
        })
}

pub(crate) fn str_arg(args: &Value, rule: &str, key: &str) -> Result<String, Error> {
    arg(args, rule, key)?
        .as_str()
        .map(ToOwned::to_owned)
        .ok_or_else(|| {
            ParseError::Args {
                rule: rule.to_owned(),
                reason: format!("'{key}' must be a string"),
            }
            .into()
        })
}

pub(crate) fn usize_arg(args: &Value, rule: &str, key: &str) -> Result<usize, Error> {
    arg(args, rule, key)?
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| {
            ParseError::Args {
                rule: rule.to_owned(),
                reason: format!("'{key}' must be a non-negative integer"),
            }
            .into()
        })
}

/// Look up an optional boolean argument, falling back to a default.
pub(crate) fn bool_arg_or(
    args: &Value,
    rule: &str,
    key: &str,
    default: bool,
) -> Result<bool, Error> {
    let Some(value) = args
        .as_mapping()
        .and_then(|m| m.get(&Value::String(key.to_owned())))
    else {
        return Ok(default);
    };
    value.as_bool().ok_or_else(|| {
        ParseError::Args {
            rule: rule.to_owned(),
            reason: format!("'{key}' must be a boolean"),
        }
        .into()
    })
}

/// Test fixture: accepts every commit and every ref update.
struct AlwaysPass;

impl CommitRule for AlwaysPass {
    fn validate(&self, _commit: &Commit<'_>, _ctx: &Context<'_>) -> Result<(), Error> {
        Ok(())
    }
}

impl RefRule for AlwaysPass {
    fn validate(
        &self,
        _commit: &Commit<'_>,
        _refname: &str,
        _ctx: &Context<'_>,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Test fixture: rejects every commit and every ref update.
struct AlwaysFail;

impl AlwaysFail {
    const MESSAGE: &'static str = "Always fail";
}

impl CommitRule for AlwaysFail {
    fn validate(&self, _commit: &Commit<'_>, _ctx: &Context<'_>) -> Result<(), Error> {
        Err(Violation::new(Self::MESSAGE).into())
    }
}

impl RefRule for AlwaysFail {
    fn validate(
        &self,
        _commit: &Commit<'_>,
        _refname: &str,
        _ctx: &Context<'_>,
    ) -> Result<(), Error> {
        Err(Violation::new(Self::MESSAGE).into())
    }
}

fn always_pass_commit<'r>(
    _validator: Commit<'r>,
    _args: &Value,
) -> Result<Box<dyn CommitRule + 'r>, Error> {
    Ok(Box::new(AlwaysPass))
}

fn always_fail_commit<'r>(
    _validator: Commit<'r>,
    _args: &Value,
) -> Result<Box<dyn CommitRule + 'r>, Error> {
    Ok(Box::new(AlwaysFail))
}

fn always_pass_ref<'r>(
    _validator: Commit<'r>,
    _args: &Value,
) -> Result<Box<dyn RefRule + 'r>, Error> {
    Ok(Box::new(AlwaysPass))
}

fn always_fail_ref<'r>(
    _validator: Commit<'r>,
    _args: &Value,
) -> Result<Box<dyn RefRule + 'r>, Error> {
    Ok(Box::new(AlwaysFail))
}
