//! Top-level verification entry points.
//!
//! Every verification first validates the policy branch under the persisted
//! bootstrap, then resolves which rules protect the ref in question. Ref
//! rules are evaluated after commit rules, because they reason about the
//! relationship between the head and prior state, and trusting the head
//! first yields clearer errors.
use std::fmt;

use thiserror::Error;

use crate::cache;
use crate::cache::Entry;
use crate::engine;
use crate::engine::{verify_ref_rules, Walk};
use crate::git;
use crate::git::{Oid, RefUpdate};
use crate::policy;
use crate::policy::{BarkRules, RefRuleData, BARK_RULES_REF, REQUIREMENTS_PATH};
use crate::project;
use crate::project::Project;
use crate::rule;
use crate::rule::Violation;

#[derive(Debug, Error)]
pub enum Error {
    /// The caller asked to verify a ref no policy entry protects.
    #[error("no rules defined for '{0}'")]
    NoRulesDefined(String),
    /// No bootstrap has been chosen for this repository.
    #[error("bark is not in use here: no bootstrap has been configured")]
    Uninitialized,
    /// One or more rules rejected the verification target.
    #[error(transparent)]
    Violation(Violation),
    #[error(transparent)]
    Engine(#[from] engine::Error),
    #[error(transparent)]
    Policy(#[from] policy::Error),
    #[error(transparent)]
    Project(#[from] project::Error),
    #[error(transparent)]
    Git(#[from] git::Error),
    #[error(transparent)]
    Cache(#[from] cache::Error),
}

impl Error {
    /// The rule violation carried by this error, if it is one. Everything
    /// else is a configuration or repository failure.
    pub fn violation(&self) -> Option<&Violation> {
        match self {
            Self::Violation(v) => Some(v),
            Self::Engine(e) => e.violation(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Engine(engine::Error::Cancelled))
    }
}

fn wrapped(violation: Violation, head: Oid, refname: Option<&str>) -> Error {
    let message = match refname {
        Some(refname) => format!("Validation errors for commit '{head}' on ref '{refname}'"),
        None => format!("Validation errors for commit '{head}'"),
    };
    Error::Violation(Violation::with(message, vec![violation]))
}

fn wrap_engine(e: engine::Error, head: Oid, refname: Option<&str>) -> Error {
    match e {
        engine::Error::Rule(rule::Error::Violation(v)) => wrapped(v, head, refname),
        e => Error::Engine(e),
    }
}

/// Verify a single commit against a caller-chosen bootstrap, bypassing the
/// policy branch. Used by local developer tooling.
pub fn verify_commit(project: &mut Project, head: Oid, bootstrap: Oid) -> Result<(), Error> {
    let (repo, cache, registry, cancel) = project.walk_parts(bootstrap)?;
    let commit = repo.commit(head)?;

    Walk::new(repo, cache, registry)
        .cancelled_by(cancel)
        .verify(commit, bootstrap, |_| Ok(()))
        .map_err(|e| wrap_engine(e, head, None))
}

/// Validate the policy branch under the persisted bootstrap and parse the
/// policy document at its head. Newly-validated policy commits have their
/// module requirements checked against the registry.
fn verify_admin(
    project: &mut Project,
    head_override: Option<Oid>,
) -> Result<(BarkRules, Oid), Error> {
    let bootstrap = project.bootstrap().ok_or(Error::Uninitialized)?;
    let head = match head_override {
        Some(head) => head,
        None => project.repo().resolve(BARK_RULES_REF)?.0.id(),
    };

    let (repo, cache, registry, cancel) = project.walk_parts(bootstrap)?;
    let commit = repo.commit(head)?;

    Walk::new(repo, cache, registry)
        .strict(true)
        .cancelled_by(cancel)
        .verify(commit, bootstrap, |c| {
            // Rule sets are self-bootstrapping: a policy commit declares the
            // modules its rules need, and they must be present before any
            // descendant is judged.
            match c.read_file(REQUIREMENTS_PATH) {
                Ok(manifest) => {
                    policy::check_requirements(registry, &manifest).map_err(engine::Error::from)
                }
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(engine::Error::from(e)),
            }
        })
        .map_err(|e| wrap_engine(e, head, Some(BARK_RULES_REF)))?;

    let rules = BarkRules::load(&repo.commit(head)?)?;

    // The policy branch is guarded by its own ref rules.
    let entry = rules.bark_rules_entry(bootstrap);
    let validator = repo.commit(head)?;
    match verify_ref_rules(
        repo,
        cache,
        registry,
        &entry.rules,
        validator,
        validator,
        BARK_RULES_REF,
    ) {
        Ok(()) => Ok((rules, head)),
        Err(engine::Error::Rule(rule::Error::Violation(v))) => {
            cache.set(head, Entry::invalid(v.clone()));
            Err(wrapped(v, head, Some(BARK_RULES_REF)))
        }
        Err(e) => Err(e.into()),
    }
}

/// Verify one policy entry for a ref: the commit-rule walk under the
/// entry's bootstrap, then the entry's ref rules.
fn verify_ref_entry(
    project: &mut Project,
    entry: &RefRuleData,
    admin_head: Oid,
    refname: &str,
    head: Oid,
) -> Result<(), Error> {
    let (repo, cache, registry, cancel) = project.walk_parts(entry.bootstrap)?;
    let commit = repo.commit(head)?;

    Walk::new(repo, cache, registry)
        .cancelled_by(cancel)
        .verify(commit, entry.bootstrap, |_| Ok(()))
        .map_err(|e| wrap_engine(e, head, Some(refname)))?;

    let validator = repo.commit(admin_head)?;
    match verify_ref_rules(repo, cache, registry, &entry.rules, validator, commit, refname) {
        Ok(()) => Ok(()),
        Err(engine::Error::Rule(rule::Error::Violation(v))) => {
            cache.set(head, Entry::invalid(v.clone()));
            Err(wrapped(v, head, Some(refname)))
        }
        Err(e) => Err(e.into()),
    }
}

/// Verify a reference: the policy branch first, then every matching policy
/// entry. A ref no entry protects is an error, since the caller named it
/// explicitly.
pub fn verify_ref(project: &mut Project, refname: &str, head: Oid) -> Result<(), Error> {
    let (rules, admin_head) = verify_admin(project, None)?;
    if refname == BARK_RULES_REF {
        return Ok(());
    }

    let entries = rules
        .ref_rules(refname)
        .into_iter()
        .cloned()
        .collect::<Vec<_>>();
    if entries.is_empty() {
        return Err(Error::NoRulesDefined(refname.to_owned()));
    }
    for entry in &entries {
        verify_ref_entry(project, entry, admin_head, refname, head)?;
    }
    Ok(())
}

/// Gate a reference update, as invoked from the repository hook. Deletions
/// and no-ops are accepted without rules; so are refs no policy entry
/// protects, since the hook funnels every ref of the repository through
/// here.
pub fn verify_ref_update(project: &mut Project, update: &RefUpdate) -> Result<(), Error> {
    if update.is_noop() || update.is_delete() {
        return Ok(());
    }
    log::debug!(target: "verify", "Verifying reference update {update}");

    if update.name == BARK_RULES_REF {
        // The proposed head is validated in place of the current tip. Its
        // ref rules (e.g. fast-forward) still see the existing tip, which
        // the hook has not yet moved.
        verify_admin(project, Some(update.new))?;
        return Ok(());
    }

    let (rules, admin_head) = verify_admin(project, None)?;
    let entries = rules
        .ref_rules(&update.name)
        .into_iter()
        .cloned()
        .collect::<Vec<_>>();

    for entry in &entries {
        verify_ref_entry(project, entry, admin_head, &update.name, update.new)?;
    }
    Ok(())
}

/// Verify every protected reference of the repository, collecting per-ref
/// violations into a report. Configuration failures abort immediately.
pub fn verify_all(project: &mut Project) -> Result<Report, Error> {
    let (rules, admin_head) = verify_admin(project, None)?;
    let refs = project
        .repo()
        .references()?
        .into_iter()
        .map(|(name, commit)| (name, commit.id()))
        .collect::<Vec<_>>();

    let mut report = Report::default();
    for (name, head) in refs {
        if name == BARK_RULES_REF {
            continue;
        }
        let entries = rules
            .ref_rules(&name)
            .into_iter()
            .cloned()
            .collect::<Vec<_>>();
        for entry in &entries {
            match verify_ref_entry(project, entry, admin_head, &name, head) {
                Ok(()) => {}
                Err(e) => match e.violation().cloned() {
                    Some(v) => {
                        report.push(name.clone(), head, v);
                        break;
                    }
                    None => return Err(e),
                },
            }
        }
    }
    Ok(report)
}

/// Per-reference verification outcomes.
#[derive(Debug, Default)]
pub struct Report {
    entries: Vec<RefReport>,
}

/// A violated reference.
#[derive(Debug)]
pub struct RefReport {
    pub refname: String,
    pub head: Oid,
    pub violation: Violation,
}

impl Report {
    pub fn is_valid(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, refname: String, head: Oid, violation: Violation) {
        self.entries.push(RefReport {
            refname,
            head,
            violation,
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &RefReport> {
        self.entries.iter()
    }

    /// Collapse the report into a single aggregate violation.
    pub fn into_result(self) -> Result<(), Violation> {
        if self.entries.is_empty() {
            return Ok(());
        }
        Err(Violation::with(
            "Not all references are valid:",
            self.entries.into_iter().map(|e| e.violation).collect(),
        ))
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{}", entry.violation)?;
        }
        Ok(())
    }
}
