//! Parent-structure rules.
use serde_yaml::Value;

use super::{bool_arg_or, usize_arg};
use crate::git::Commit;
use crate::rule::{CommitRule, Context, Error, Violation};

/// The commit must have at least `threshold` parents.
struct RequireNumberOfParents {
    threshold: usize,
}

impl CommitRule for RequireNumberOfParents {
    fn validate(&self, commit: &Commit<'_>, _ctx: &Context<'_>) -> Result<(), Error> {
        let parents = commit.parents()?;
        if parents.len() < self.threshold {
            return Err(Violation::new(format!(
                "Commit has {} parent(s) but expected {}",
                parents.len(),
                self.threshold
            ))
            .into());
        }
        Ok(())
    }
}

pub(crate) fn require_number_of_parents<'r>(
    _validator: Commit<'r>,
    args: &Value,
) -> Result<Box<dyn CommitRule + 'r>, Error> {
    let threshold = usize_arg(args, "require_number_of_parents", "threshold")?;

    Ok(Box::new(RequireNumberOfParents { threshold }))
}

/// Constrains merges that bring in commits the cache knows to be invalid.
struct InvalidParents {
    allow: bool,
    require_explicit_inclusion: bool,
}

impl CommitRule for InvalidParents {
    fn validate(&self, commit: &Commit<'_>, ctx: &Context<'_>) -> Result<(), Error> {
        let parents = commit.parents()?;

        if !self.allow {
            // Only the non-primary parents count: the first parent is the
            // history being extended, not included.
            for parent in parents.iter().skip(1) {
                if let Some(entry) = ctx.cache.get(parent.id())? {
                    if !entry.valid {
                        return Err(Violation::new("Commit has invalid parents").into());
                    }
                }
            }
            return Ok(());
        }
        if !self.require_explicit_inclusion {
            return Ok(());
        }

        let mut invalid = Vec::new();
        for parent in &parents {
            if let Some(entry) = ctx.cache.get(parent.id())? {
                if !entry.valid {
                    invalid.push(parent.id());
                }
            }
        }
        if invalid.is_empty() {
            return Ok(());
        }
        let message = commit.message()?;
        for id in invalid {
            if !message.contains(&id.to_string()) {
                return Err(Violation::new("Commit has invalid parents").into());
            }
        }
        Ok(())
    }
}

pub(crate) fn invalid_parents<'r>(
    _validator: Commit<'r>,
    args: &Value,
) -> Result<Box<dyn CommitRule + 'r>, Error> {
    let allow = bool_arg_or(args, "invalid_parents", "allow", true)?;
    let require_explicit_inclusion =
        bool_arg_or(args, "invalid_parents", "require_explicit_inclusion", false)?;

    Ok(Box::new(InvalidParents {
        allow,
        require_explicit_inclusion,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, Entry};
    use crate::git::Repository;
    use crate::rule::{load_commit_rule, Registry, RuleData};
    use crate::test::fixtures;

    fn rule<'r>(registry: &Registry, yaml: &str, validator: Commit<'r>) -> Box<dyn CommitRule + 'r> {
        let data = RuleData::parse(&serde_yaml::from_str(yaml).unwrap()).unwrap();
        load_commit_rule(registry, &data, validator).unwrap()
    }

    #[test]
    fn test_require_number_of_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let (raw, _) = fixtures::repository(tmp.path());
        let repo = Repository::open(raw.workdir().unwrap()).unwrap();
        let registry = Registry::default();
        let cache = Cache::memory().unwrap();

        let a = fixtures::commit(&raw, &[], &[("a", b"a")], "A", None);
        let b = fixtures::commit(&raw, &[a], &[("b", b"b")], "B", None);
        let merge = fixtures::commit(&raw, &[a, b], &[("m", b"m")], "M", None);

        let validator = repo.commit(a).unwrap();
        let rule = rule(
            &registry,
            "require_number_of_parents:\n  threshold: 2",
            validator,
        );
        let ctx = Context {
            repo: &repo,
            cache: &cache,
        };

        rule.validate(&repo.commit(merge).unwrap(), &ctx).unwrap();

        let err = rule.validate(&repo.commit(b).unwrap(), &ctx).unwrap_err();
        assert!(matches!(
            err,
            Error::Violation(v) if v.message == "Commit has 1 parent(s) but expected 2"
        ));
    }

    #[test]
    fn test_invalid_parents_disallowed() {
        let tmp = tempfile::tempdir().unwrap();
        let (raw, _) = fixtures::repository(tmp.path());
        let repo = Repository::open(raw.workdir().unwrap()).unwrap();
        let registry = Registry::default();
        let mut cache = Cache::memory().unwrap();

        let a = fixtures::commit(&raw, &[], &[("a", b"a")], "A", None);
        let bad = fixtures::commit(&raw, &[a], &[("bad", b"bad")], "Bad", None);
        let merge = fixtures::commit(&raw, &[a, bad], &[("m", b"m")], "Merge", None);

        cache.set(a, Entry::valid());
        cache.set(bad, Entry::invalid(Violation::new("rejected")));

        let validator = repo.commit(a).unwrap();
        let rule = rule(&registry, "invalid_parents:\n  allow: false", validator);
        let ctx = Context {
            repo: &repo,
            cache: &cache,
        };

        let err = rule
            .validate(&repo.commit(merge).unwrap(), &ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Violation(v) if v.message == "Commit has invalid parents"
        ));
    }

    #[test]
    fn test_invalid_parents_explicit_inclusion() {
        let tmp = tempfile::tempdir().unwrap();
        let (raw, _) = fixtures::repository(tmp.path());
        let repo = Repository::open(raw.workdir().unwrap()).unwrap();
        let registry = Registry::default();
        let mut cache = Cache::memory().unwrap();

        let a = fixtures::commit(&raw, &[], &[("a", b"a")], "A", None);
        let bad = fixtures::commit(&raw, &[a], &[("bad", b"bad")], "Bad", None);
        let with_hash = fixtures::commit(
            &raw,
            &[a, bad],
            &[("m", b"m")],
            &format!("Merge, explicitly including {bad}"),
            None,
        );
        let without_hash = fixtures::commit(&raw, &[a, bad], &[("m", b"m")], "Merge", None);

        cache.set(a, Entry::valid());
        cache.set(bad, Entry::invalid(Violation::new("rejected")));

        let validator = repo.commit(a).unwrap();
        let rule = rule(
            &registry,
            "invalid_parents:\n  allow: true\n  require_explicit_inclusion: true",
            validator,
        );
        let ctx = Context {
            repo: &repo,
            cache: &cache,
        };

        rule.validate(&repo.commit(with_hash).unwrap(), &ctx)
            .unwrap();

        let err = rule
            .validate(&repo.commit(without_hash).unwrap(), &ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Violation(v) if v.message == "Commit has invalid parents"
        ));
    }

    #[test]
    fn test_invalid_parents_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let (raw, _) = fixtures::repository(tmp.path());
        let repo = Repository::open(raw.workdir().unwrap()).unwrap();
        let registry = Registry::default();
        let mut cache = Cache::memory().unwrap();

        let a = fixtures::commit(&raw, &[], &[("a", b"a")], "A", None);
        let bad = fixtures::commit(&raw, &[a], &[("bad", b"bad")], "Bad", None);
        let merge = fixtures::commit(&raw, &[a, bad], &[("m", b"m")], "Merge", None);

        cache.set(bad, Entry::invalid(Violation::new("rejected")));

        // By default invalid parents are allowed.
        let validator = repo.commit(a).unwrap();
        let rule = rule(&registry, "invalid_parents", validator);
        let ctx = Context {
            repo: &repo,
            cache: &cache,
        };
        rule.validate(&repo.commit(merge).unwrap(), &ctx).unwrap();
    }
}
