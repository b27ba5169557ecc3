//! The commit-rule engine.
//!
//! Validity of a commit is decided by the rules of its *validator commits*:
//! the nearest ancestors that are already trusted. Rules travel with
//! history, so the walk proceeds from a trusted bootstrap commit forward,
//! deciding each commit only once all of its parents are decided. Decisions
//! are memoised in the [`Cache`].
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::cache;
use crate::cache::{Cache, Entry};
use crate::git;
use crate::git::{Commit, Oid, Repository};
use crate::policy;
use crate::rule;
use crate::rule::{Context, Registry, RuleData, Violation};

#[derive(Debug, Error)]
pub enum Error {
    /// The bootstrap commit does not reach the head being verified.
    #[error("bootstrap '{bootstrap}' is not an ancestor of '{head}'")]
    BootstrapNotAncestor { bootstrap: Oid, head: Oid },
    /// The verification run was cancelled cooperatively.
    #[error("verification was cancelled")]
    Cancelled,
    #[error(transparent)]
    Git(#[from] git::Error),
    #[error(transparent)]
    Cache(#[from] cache::Error),
    #[error(transparent)]
    Rule(#[from] rule::Error),
    #[error(transparent)]
    Policy(#[from] policy::Error),
}

impl Error {
    /// The rule violation carried by this error, if it is one.
    pub fn violation(&self) -> Option<&Violation> {
        match self {
            Self::Rule(rule::Error::Violation(v)) => Some(v),
            _ => None,
        }
    }
}

fn violation(v: Violation) -> Error {
    Error::Rule(rule::Error::Violation(v))
}

/// Cooperative cancellation signal, checked between commits on the walk
/// stack. Cloning yields a handle to the same signal.
#[derive(Debug, Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the verification run.
    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A single verification walk from a bootstrap to a head.
pub struct Walk<'a, 'r> {
    repo: &'r Repository,
    cache: &'a mut Cache,
    registry: &'a Registry,
    cancel: Cancel,
    strict: bool,
}

impl<'a, 'r> Walk<'a, 'r> {
    pub fn new(repo: &'r Repository, cache: &'a mut Cache, registry: &'a Registry) -> Self {
        Self {
            repo,
            cache,
            registry,
            cancel: Cancel::default(),
            strict: false,
        }
    }

    /// In strict mode, a commit without a rules file is a violation. Used
    /// on the policy branch, where rules must never silently disappear.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn cancelled_by(mut self, cancel: Cancel) -> Self {
        self.cancel = cancel;
        self
    }

    /// Verify every commit between `bootstrap` and `head`. The `on_valid`
    /// hook is invoked for each commit found valid, including the bootstrap.
    pub fn verify<F>(&mut self, head: Commit<'r>, bootstrap: Oid, mut on_valid: F) -> Result<(), Error>
    where
        F: FnMut(&Commit<'r>) -> Result<(), Error>,
    {
        if !self.repo.is_ancestor(bootstrap, head.id())? {
            return Err(Error::BootstrapNotAncestor {
                bootstrap,
                head: head.id(),
            });
        }
        // A previous rejection is not final: rule updates along the walk may
        // accept the head now.
        if let Some(entry) = self.cache.get(head.id())? {
            if !entry.valid {
                self.cache.remove(head.id());
            }
        }

        let mut last: Option<Violation> = None;
        let mut stack = vec![head];

        while let Some(commit) = stack.pop() {
            if self.cancel.is_set() {
                self.cache.discard();
                return Err(Error::Cancelled);
            }
            if self.cache.has(commit.id())? {
                continue;
            }
            if commit.id() == bootstrap {
                self.cache.set(commit.id(), Entry::valid());
                on_valid(&commit)?;
                continue;
            }
            let parents = commit.parents()?;
            let mut pending = Vec::new();
            for parent in &parents {
                if !self.cache.has(parent.id())? {
                    pending.push(*parent);
                }
            }
            if !pending.is_empty() {
                // Decide all parents before coming back to this commit.
                stack.push(commit);
                stack.extend(pending);
                continue;
            }
            match self.validate(&commit) {
                Ok(()) => {
                    log::debug!(target: "engine", "Commit {} is valid", commit.id());
                    self.cache.set(commit.id(), Entry::valid());
                    on_valid(&commit)?;
                }
                Err(Error::Rule(rule::Error::Violation(v))) => {
                    log::debug!(target: "engine", "Commit {} is invalid: {}", commit.id(), v.message);
                    self.cache.set(commit.id(), Entry::invalid(v.clone()));
                    last = Some(v);
                }
                Err(e) => return Err(e),
            }
        }

        match self.cache.get(head.id())? {
            Some(entry) if entry.valid => Ok(()),
            entry => {
                let v = entry
                    .and_then(|e| e.violation)
                    .or(last)
                    .unwrap_or_else(|| {
                        Violation::new(format!("Commit {} failed validation", head.id()))
                    });
                Err(violation(v))
            }
        }
    }

    /// Validate a single commit, all of whose parents are decided.
    fn validate(&self, commit: &Commit<'r>) -> Result<(), Error> {
        let validators = self.nearest_valid(commit)?;
        if validators.is_empty() {
            return Err(violation(Violation::new(format!(
                "No valid ancestors for commit {}",
                commit.id()
            ))));
        }

        let mut rules = Vec::with_capacity(validators.len());
        for id in &validators {
            let validator = self.repo.commit(*id)?;
            let data = self.rules_of(&validator)?;
            rules.push(rule::load_commit_rule(self.registry, &data, validator)?);
        }
        // With several validators, every one of them must accept.
        let rule = rule::all_of(rules);
        let ctx = Context {
            repo: self.repo,
            cache: &*self.cache,
        };
        rule.validate(commit, &ctx).map_err(Error::from)?;

        // The commit must itself carry parseable rules, so that it cannot
        // silently disable validation of its descendants.
        match self.rules_of(commit) {
            Ok(_) => Ok(()),
            Err(Error::Rule(rule::Error::Violation(v))) => Err(violation(v)),
            Err(Error::Policy(policy::Error::Git(e))) => Err(Error::Git(e)),
            Err(Error::Policy(e)) => Err(violation(Violation::new(format!(
                "invalid commit rules: {e}"
            )))),
            Err(e) => Err(e),
        }
    }

    /// The nearest cached-valid ancestors on every incoming edge, looking
    /// past invalid parents but never trusting their rules.
    fn nearest_valid(&self, commit: &Commit<'r>) -> Result<BTreeSet<Oid>, Error> {
        let mut valid = BTreeSet::new();
        let mut visited = BTreeSet::new();
        let mut stack = commit.parents()?;

        while let Some(parent) = stack.pop() {
            if !visited.insert(parent.id()) {
                continue;
            }
            match self.cache.get(parent.id())? {
                Some(entry) if entry.valid => {
                    valid.insert(parent.id());
                }
                _ => stack.extend(parent.parents()?),
            }
        }
        Ok(valid)
    }

    /// A commit's own rules. Missing rules are an empty rule set, except in
    /// strict mode.
    fn rules_of(&self, commit: &Commit<'r>) -> Result<RuleData, Error> {
        match policy::commit_rules(commit)? {
            Some(rules) => Ok(rules),
            None if self.strict => Err(violation(Violation::new(format!(
                "Commit {} does not carry commit rules",
                commit.id()
            )))),
            None => Ok(RuleData::None),
        }
    }
}

/// Evaluate a set of ref rules against a `(head, ref)` pair. The validator
/// is the tip of the policy branch the rules were loaded from.
pub fn verify_ref_rules(
    repo: &Repository,
    cache: &Cache,
    registry: &Registry,
    data: &RuleData,
    validator: Commit<'_>,
    head: Commit<'_>,
    refname: &str,
) -> Result<(), Error> {
    let rule = rule::load_ref_rule(registry, data, validator)?;
    let ctx = Context { repo, cache };

    rule.validate(&head, refname, &ctx).map_err(Error::from)
}
