//! Reference-scoped rules.
use serde_yaml::Value;

use crate::git::Commit;
use crate::rule::{Error, RefRule, Violation};

/// Only fast-forward updates are allowed: the existing tip of the ref must
/// be an ancestor of the proposed head. Creating a new ref always passes.
struct FastForward;

impl RefRule for FastForward {
    fn validate(
        &self,
        commit: &Commit<'_>,
        refname: &str,
        ctx: &crate::rule::Context<'_>,
    ) -> Result<(), Error> {
        match ctx.repo.resolve(refname) {
            Ok((old, _)) => {
                if ctx.repo.is_ancestor(old.id(), commit.id())? {
                    Ok(())
                } else {
                    Err(Violation::new(format!(
                        "Commit is not a descendant of {}",
                        old.id()
                    ))
                    .into())
                }
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub(crate) fn fast_forward<'r>(
    _validator: Commit<'r>,
    _args: &Value,
) -> Result<Box<dyn RefRule + 'r>, Error> {
    Ok(Box::new(FastForward))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::git::Repository;
    use crate::rule::{load_ref_rule, Context, Registry, RuleData};
    use crate::test::fixtures;

    #[test]
    fn test_fast_forward() {
        let tmp = tempfile::tempdir().unwrap();
        let (raw, _) = fixtures::repository(tmp.path());
        let repo = Repository::open(raw.workdir().unwrap()).unwrap();
        let registry = Registry::default();
        let cache = Cache::memory().unwrap();

        let base = fixtures::commit(&raw, &[], &[("a", b"a")], "Base", None);
        let descendant = fixtures::commit(&raw, &[base], &[("b", b"b")], "Next", None);
        let unrelated = fixtures::commit(&raw, &[], &[("c", b"c")], "Rewrite", None);

        raw.reference("refs/heads/main", base, true, "test").unwrap();

        let data = RuleData::parse(&serde_yaml::from_str("fast-forward-only").unwrap()).unwrap();
        let validator = repo.commit(base).unwrap();
        let rule = load_ref_rule(&registry, &data, validator).unwrap();
        let ctx = Context {
            repo: &repo,
            cache: &cache,
        };

        rule.validate(
            &repo.commit(descendant).unwrap(),
            "refs/heads/main",
            &ctx,
        )
        .unwrap();

        let err = rule
            .validate(&repo.commit(unrelated).unwrap(), "refs/heads/main", &ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Violation(v) if v.message == format!("Commit is not a descendant of {base}")
        ));

        // Creating a ref that doesn't exist yet always passes.
        rule.validate(
            &repo.commit(unrelated).unwrap(),
            "refs/heads/new-branch",
            &ctx,
        )
        .unwrap();
    }
}
