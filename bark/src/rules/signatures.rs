//! Signature and approval rules.
use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::Value;

use super::keys::PublicKey;
use super::str_arg;
use crate::git::Commit;
use crate::policy::PUBKEYS_PATH;
use crate::rule::{CommitRule, Context, Error, Violation};

/// Matches an armored signature block embedded in a commit message.
#[allow(clippy::expect_used)]
static SIGNATURE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)-----BEGIN (?:PGP|SSH) SIGNATURE-----.*?-----END (?:PGP|SSH) SIGNATURE-----")
        .expect("the signature block pattern is valid")
});

/// Load the authorized keys matching a glob under the validator's
/// `.bark/.pubkeys` directory. An unparseable key is a violation, not a
/// crash: it means the key directory itself is broken.
fn authorized_keys(validator: &Commit<'_>, pattern: &str) -> Result<Vec<PublicKey>, Error> {
    let glob = format!("{PUBKEYS_PATH}/{pattern}");
    let paths = validator.list_files(&[glob.as_str()])?;
    let mut keys = Vec::with_capacity(paths.len());

    for path in paths {
        let blob = validator.read_file(&path)?;
        match PublicKey::parse(&blob) {
            Ok(key) => keys.push(key),
            Err(e) => {
                return Err(Violation::new(format!(
                    "Could not parse public key '{path}': {e}"
                ))
                .into())
            }
        }
    }
    Ok(keys)
}

/// The commit object must carry a detached signature verifying under one of
/// the authorized keys.
struct RequireSignature<'r> {
    validator: Commit<'r>,
    authorized_keys: String,
}

impl CommitRule for RequireSignature<'_> {
    fn validate(&self, commit: &Commit<'_>, _ctx: &Context<'_>) -> Result<(), Error> {
        let Some((signature, subject)) = commit.signature()? else {
            return Err(Violation::new("Commit was not signed").into());
        };
        let keys = authorized_keys(&self.validator, &self.authorized_keys)?;
        if keys.is_empty() {
            return Err(Violation::new("No public keys registered").into());
        }
        if keys.iter().any(|key| key.verify(&signature, &subject)) {
            Ok(())
        } else {
            Err(Violation::new("Commit was signed by untrusted key").into())
        }
    }
}

pub(crate) fn require_signature<'r>(
    validator: Commit<'r>,
    args: &Value,
) -> Result<Box<dyn CommitRule + 'r>, Error> {
    let authorized_keys = str_arg(args, "require_signature", "authorized_keys")?;

    Ok(Box::new(RequireSignature {
        validator,
        authorized_keys,
    }))
}

/// A merge must carry a threshold of approvals: detached signatures over
/// the incoming parent's commit object, embedded in the merge message.
/// Approvals are counted per signing key fingerprint.
struct RequireApproval<'r> {
    validator: Commit<'r>,
    authorized_keys: String,
    threshold: usize,
}

impl CommitRule for RequireApproval<'_> {
    fn validate(&self, commit: &Commit<'_>, _ctx: &Context<'_>) -> Result<(), Error> {
        let parents = commit.parents()?;
        let Some(incoming) = parents.last().filter(|_| parents.len() > 1) else {
            return Err(Violation::new("Commit does not originate from a pull request").into());
        };
        let subject = incoming.raw_object()?;
        let message = commit.message()?;
        let keys = authorized_keys(&self.validator, &self.authorized_keys)?;

        let mut approvers = BTreeSet::new();
        for block in SIGNATURE_BLOCK.find_iter(&message) {
            for key in &keys {
                let fingerprint = key.fingerprint();
                if approvers.contains(&fingerprint) {
                    continue;
                }
                if key.verify(block.as_str().as_bytes(), &subject) {
                    approvers.insert(fingerprint);
                }
            }
        }

        if approvers.len() < self.threshold {
            return Err(Violation::new(format!(
                "Commit {} has {} valid approval(s) but expected {}",
                commit.id(),
                approvers.len(),
                self.threshold
            ))
            .into());
        }
        Ok(())
    }
}

pub(crate) fn require_approval<'r>(
    validator: Commit<'r>,
    args: &Value,
) -> Result<Box<dyn CommitRule + 'r>, Error> {
    let authorized_keys = str_arg(args, "require_approval", "authorized_keys")?;
    let threshold = super::usize_arg(args, "require_approval", "threshold")?;

    Ok(Box::new(RequireApproval {
        validator,
        authorized_keys,
        threshold,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::git::Repository;
    use crate::rule::Registry;
    use crate::test::fixtures;

    fn load<'r>(
        registry: &Registry,
        id: &str,
        args: &str,
        validator: Commit<'r>,
    ) -> Box<dyn CommitRule + 'r> {
        let data = crate::rule::RuleData::parse(&serde_yaml::from_str(args).unwrap()).unwrap();
        assert!(matches!(&data, crate::rule::RuleData::Leaf { id: i, .. } if i == id));
        crate::rule::load_commit_rule(registry, &data, validator).unwrap()
    }

    #[test]
    fn test_require_signature() {
        let tmp = tempfile::tempdir().unwrap();
        let (raw, _) = fixtures::repository(tmp.path());
        let repo = Repository::open(raw.workdir().unwrap()).unwrap();
        let registry = Registry::default();
        let cache = Cache::memory().unwrap();

        let alice = fixtures::signer();
        let eve = fixtures::signer();

        let bootstrap = fixtures::commit(
            &raw,
            &[],
            &[(
                ".bark/.pubkeys/alice.pub",
                fixtures::public_key(&alice).as_bytes(),
            )],
            "Root",
            None,
        );
        let signed = fixtures::commit(&raw, &[bootstrap], &[("f", b"f")], "Signed", Some(&alice));
        let forged = fixtures::commit(&raw, &[bootstrap], &[("g", b"g")], "Forged", Some(&eve));
        let unsigned = fixtures::commit(&raw, &[bootstrap], &[("h", b"h")], "Unsigned", None);

        let validator = repo.commit(bootstrap).unwrap();
        let rule = load(
            &registry,
            "require_signature",
            "require_signature:\n  authorized_keys: '*.pub'",
            validator,
        );
        let ctx = Context {
            repo: &repo,
            cache: &cache,
        };

        rule.validate(&repo.commit(signed).unwrap(), &ctx).unwrap();

        let err = rule
            .validate(&repo.commit(forged).unwrap(), &ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Violation(v) if v.message == "Commit was signed by untrusted key"
        ));

        let err = rule
            .validate(&repo.commit(unsigned).unwrap(), &ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Violation(v) if v.message == "Commit was not signed"
        ));
    }

    #[test]
    fn test_require_signature_no_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let (raw, _) = fixtures::repository(tmp.path());
        let repo = Repository::open(raw.workdir().unwrap()).unwrap();
        let registry = Registry::default();
        let cache = Cache::memory().unwrap();

        let alice = fixtures::signer();
        let bootstrap = fixtures::commit(&raw, &[], &[("f", b"f")], "Root", None);
        let signed = fixtures::commit(&raw, &[bootstrap], &[("g", b"g")], "Signed", Some(&alice));

        let rule = load(
            &registry,
            "require_signature",
            "require_signature:\n  authorized_keys: '*.pub'",
            repo.commit(bootstrap).unwrap(),
        );
        let ctx = Context {
            repo: &repo,
            cache: &cache,
        };
        let err = rule
            .validate(&repo.commit(signed).unwrap(), &ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Violation(v) if v.message == "No public keys registered"
        ));
    }

    #[test]
    fn test_require_approval_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let (raw, _) = fixtures::repository(tmp.path());
        let repo = Repository::open(raw.workdir().unwrap()).unwrap();
        let registry = Registry::default();
        let cache = Cache::memory().unwrap();

        let alice = fixtures::signer();
        let bob = fixtures::signer();

        let bootstrap = fixtures::commit(
            &raw,
            &[],
            &[
                (
                    ".bark/.pubkeys/alice.pub",
                    fixtures::public_key(&alice).as_bytes(),
                ),
                (
                    ".bark/.pubkeys/bob.pub",
                    fixtures::public_key(&bob).as_bytes(),
                ),
            ],
            "Root",
            None,
        );
        let feature = fixtures::commit(&raw, &[bootstrap], &[("f", b"f")], "Feature", None);

        // Approvals sign the raw object of the incoming (last) parent.
        let subject = repo.commit(feature).unwrap().raw_object().unwrap();
        let approvals = |sigs: &[String]| {
            format!("Merge feature\n\n{}", sigs.join("\n"))
        };

        let both = fixtures::commit(
            &raw,
            &[bootstrap, feature],
            &[("f", b"f")],
            &approvals(&[
                fixtures::sign(&alice, &subject),
                fixtures::sign(&bob, &subject),
            ]),
            None,
        );
        let single = fixtures::commit(
            &raw,
            &[bootstrap, feature],
            &[("f", b"f")],
            &approvals(&[fixtures::sign(&alice, &subject)]),
            None,
        );
        let duplicate = fixtures::commit(
            &raw,
            &[bootstrap, feature],
            &[("f", b"f")],
            &approvals(&[
                fixtures::sign(&alice, &subject),
                fixtures::sign(&alice, &subject),
            ]),
            None,
        );

        let rule = load(
            &registry,
            "require_approval",
            "require_approval:\n  authorized_keys: '*.pub'\n  threshold: 2",
            repo.commit(bootstrap).unwrap(),
        );
        let ctx = Context {
            repo: &repo,
            cache: &cache,
        };

        rule.validate(&repo.commit(both).unwrap(), &ctx).unwrap();

        let err = rule
            .validate(&repo.commit(single).unwrap(), &ctx)
            .unwrap_err();
        assert!(matches!(
            &err,
            Error::Violation(v) if v.message.contains("has 1 valid approval(s) but expected 2")
        ));

        // Two approvals by the same key count once.
        let err = rule
            .validate(&repo.commit(duplicate).unwrap(), &ctx)
            .unwrap_err();
        assert!(matches!(
            &err,
            Error::Violation(v) if v.message.contains("has 1 valid approval(s) but expected 2")
        ));
    }

    #[test]
    fn test_require_approval_refuses_non_merges() {
        let tmp = tempfile::tempdir().unwrap();
        let (raw, _) = fixtures::repository(tmp.path());
        let repo = Repository::open(raw.workdir().unwrap()).unwrap();
        let registry = Registry::default();
        let cache = Cache::memory().unwrap();

        let bootstrap = fixtures::commit(&raw, &[], &[("f", b"f")], "Root", None);
        let child = fixtures::commit(&raw, &[bootstrap], &[("g", b"g")], "Child", None);

        let rule = load(
            &registry,
            "require_approval",
            "require_approval:\n  authorized_keys: '*.pub'\n  threshold: 1",
            repo.commit(bootstrap).unwrap(),
        );
        let ctx = Context {
            repo: &repo,
            cache: &cache,
        };
        let err = rule
            .validate(&repo.commit(child).unwrap(), &ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Violation(v) if v.message == "Commit does not originate from a pull request"
        ));
    }
}
