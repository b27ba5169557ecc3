//! Rule data model and runtime.
//!
//! Declarative rule definitions are parsed into a [`RuleData`] tree of
//! leaves and `all` / `any` / `none` combinators. A [`Registry`] maps leaf
//! ids to constructors; loading a tree yields live [`CommitRule`] /
//! [`RefRule`] instances bound to a *validator* commit, whose tree supplies
//! the rule's inputs (key directories, patterns, thresholds).
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::cache::Cache;
use crate::git;
use crate::git::{Commit, Repository};

/// Reserved combinator ids.
pub const ALL: &str = "all";
pub const ANY: &str = "any";
pub const NONE: &str = "none";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot parse rule data")]
    Invalid,
    #[error("composite rule must contain at least 2 child rules")]
    Composite,
    #[error("invalid arguments for rule '{rule}': {reason}")]
    Args { rule: String, reason: String },
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown rule id '{0}'")]
    UnknownRule(String),
    #[error("rule id '{0}' is reserved")]
    ReservedId(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Violation(#[from] Violation),
    #[error(transparent)]
    Git(#[from] git::Error),
    #[error(transparent)]
    Cache(#[from] crate::cache::Error),
}

/// A tree of human-readable rule failure reasons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Violation>,
}

impl Violation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            children: Vec::new(),
        }
    }

    pub fn with(message: impl Into<String>, children: Vec<Violation>) -> Self {
        Self {
            message: message.into(),
            children,
        }
    }

    fn write(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        if depth == 0 {
            write!(f, "{}", self.message)?;
        } else {
            write!(f, "\n{}- {}", "  ".repeat(depth), self.message)?;
        }
        for child in &self.children {
            child.write(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write(f, 0)
    }
}

impl std::error::Error for Violation {}

/// A parsed rule definition: a leaf rule with arguments, or a combinator
/// over child rules. Composites always have at least two children.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleData {
    Leaf { id: String, args: Value },
    All(Vec<RuleData>),
    Any(Vec<RuleData>),
    None,
}

impl Default for RuleData {
    fn default() -> Self {
        RuleData::None
    }
}

impl RuleData {
    /// Parse a single rule definition. Accepted forms:
    ///
    /// * `rule_id` — a bare string, no arguments;
    /// * `{rule_id: args}` — a single-key mapping, scalar or structured
    ///   arguments;
    /// * `{rule_id: ~, key: v, ...}` — compact form, the sibling keys become
    ///   the arguments.
    pub fn parse(value: &Value) -> Result<Self, ParseError> {
        let (id, args) = match value {
            Value::String(s) => (s.clone(), Value::Null),
            Value::Mapping(m) => {
                let mut entries = m.iter();
                let (key, val) = entries.next().ok_or(ParseError::Invalid)?;
                let id = key.as_str().ok_or(ParseError::Invalid)?.to_owned();

                if m.len() > 1 {
                    if !val.is_null() {
                        return Err(ParseError::Invalid);
                    }
                    let mut siblings = Mapping::new();
                    for (k, v) in entries {
                        siblings.insert(k.clone(), v.clone());
                    }
                    (id, Value::Mapping(siblings))
                } else {
                    (id, val.clone())
                }
            }
            _ => return Err(ParseError::Invalid),
        };

        match id.as_str() {
            ALL => Self::composite(&args).map(RuleData::All),
            ANY => Self::composite(&args).map(RuleData::Any),
            NONE => match args {
                Value::Null => Ok(RuleData::None),
                _ => Err(ParseError::Invalid),
            },
            _ => Ok(RuleData::Leaf { id, args }),
        }
    }

    /// Parse a list of rule definitions, canonicalised: an empty list is the
    /// `none` rule, a single entry is that rule, two or more entries are
    /// combined with `all`.
    pub fn parse_list(values: &[Value]) -> Result<Self, ParseError> {
        match values {
            [] => Ok(RuleData::None),
            [value] => Self::parse(value),
            _ => values
                .iter()
                .map(Self::parse)
                .collect::<Result<Vec<_>, _>>()
                .map(RuleData::All),
        }
    }

    fn composite(args: &Value) -> Result<Vec<RuleData>, ParseError> {
        let children = args.as_sequence().ok_or(ParseError::Invalid)?;
        if children.len() < 2 {
            return Err(ParseError::Composite);
        }
        children.iter().map(Self::parse).collect()
    }

    /// The inverse of [`RuleData::parse`].
    pub fn emit(&self) -> Value {
        fn keyed(id: &str, args: Value) -> Value {
            let mut m = Mapping::new();
            m.insert(Value::String(id.to_owned()), args);
            Value::Mapping(m)
        }
        match self {
            Self::Leaf { id, args } if args.is_null() => Value::String(id.clone()),
            Self::Leaf { id, args } => keyed(id, args.clone()),
            Self::All(children) => keyed(
                ALL,
                Value::Sequence(children.iter().map(Self::emit).collect()),
            ),
            Self::Any(children) => keyed(
                ANY,
                Value::Sequence(children.iter().map(Self::emit).collect()),
            ),
            Self::None => keyed(NONE, Value::Null),
        }
    }
}

/// Context passed to rules at validation time. Rules may read the cache but
/// never write to it.
pub struct Context<'a> {
    pub repo: &'a Repository,
    pub cache: &'a Cache,
}

/// A live rule judging commits.
pub trait CommitRule {
    fn validate(&self, commit: &Commit<'_>, ctx: &Context<'_>) -> Result<(), Error>;
}

/// A live rule judging reference updates.
pub trait RefRule {
    fn validate(&self, commit: &Commit<'_>, refname: &str, ctx: &Context<'_>)
        -> Result<(), Error>;
}

/// Constructor for a leaf commit rule, bound to a validator commit.
pub type CommitRuleFactory =
    for<'r> fn(Commit<'r>, &Value) -> Result<Box<dyn CommitRule + 'r>, Error>;
/// Constructor for a leaf ref rule, bound to a validator commit.
pub type RefRuleFactory = for<'r> fn(Commit<'r>, &Value) -> Result<Box<dyn RefRule + 'r>, Error>;

/// Process-wide table of rule constructors, keyed by rule id. Built-in rules
/// are always present; third-party rule modules are compiled in and register
/// themselves at startup. The policy branch's requirements manifest selects
/// among registered modules, it never introduces new code.
pub struct Registry {
    commit: BTreeMap<String, CommitRuleFactory>,
    reference: BTreeMap<String, RefRuleFactory>,
    modules: BTreeSet<String>,
}

impl Registry {
    /// A registry with no rules at all. Use [`Registry::default`] for one
    /// with the built-in rule set.
    pub fn empty() -> Self {
        Self {
            commit: BTreeMap::new(),
            reference: BTreeMap::new(),
            modules: BTreeSet::new(),
        }
    }

    pub fn register_commit_rule(
        &mut self,
        id: impl Into<String>,
        factory: CommitRuleFactory,
    ) -> Result<(), Error> {
        let id = id.into();
        if matches!(id.as_str(), ALL | ANY | NONE) {
            return Err(Error::ReservedId(id));
        }
        self.commit.insert(id, factory);
        Ok(())
    }

    pub fn register_ref_rule(
        &mut self,
        id: impl Into<String>,
        factory: RefRuleFactory,
    ) -> Result<(), Error> {
        let id = id.into();
        if matches!(id.as_str(), ALL | ANY | NONE) {
            return Err(Error::ReservedId(id));
        }
        self.reference.insert(id, factory);
        Ok(())
    }

    /// Declare a rule module as present. Modules are what the policy
    /// branch's requirements manifest refers to.
    pub fn register_module(&mut self, name: impl Into<String>) {
        self.modules.insert(name.into());
    }

    pub fn commit_rule(&self, id: &str) -> Result<CommitRuleFactory, Error> {
        self.commit
            .get(id)
            .copied()
            .ok_or_else(|| Error::UnknownRule(id.to_owned()))
    }

    pub fn ref_rule(&self, id: &str) -> Result<RefRuleFactory, Error> {
        self.reference
            .get(id)
            .copied()
            .ok_or_else(|| Error::UnknownRule(id.to_owned()))
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.modules.contains(name)
    }

    /// Register a built-in rule, bypassing the reserved-id check.
    pub(crate) fn builtin_commit_rule(&mut self, id: &str, factory: CommitRuleFactory) {
        self.commit.insert(id.to_owned(), factory);
    }

    /// Register a built-in ref rule, bypassing the reserved-id check.
    pub(crate) fn builtin_ref_rule(&mut self, id: &str, factory: RefRuleFactory) {
        self.reference.insert(id.to_owned(), factory);
    }
}

/// Load a commit rule tree, binding leaves to the given validator commit.
pub fn load_commit_rule<'r>(
    registry: &Registry,
    data: &RuleData,
    validator: Commit<'r>,
) -> Result<Box<dyn CommitRule + 'r>, Error> {
    match data {
        RuleData::None => Ok(Box::new(NoneRule)),
        RuleData::All(children) => {
            let children = children
                .iter()
                .map(|c| load_commit_rule(registry, c, validator))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Box::new(AllRule { children }))
        }
        RuleData::Any(children) => {
            let children = children
                .iter()
                .map(|c| load_commit_rule(registry, c, validator))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Box::new(AnyRule { children }))
        }
        RuleData::Leaf { id, args } => registry.commit_rule(id)?(validator, args),
    }
}

/// Load a ref rule tree, binding leaves to the given validator commit.
pub fn load_ref_rule<'r>(
    registry: &Registry,
    data: &RuleData,
    validator: Commit<'r>,
) -> Result<Box<dyn RefRule + 'r>, Error> {
    match data {
        RuleData::None => Ok(Box::new(NoneRule)),
        RuleData::All(children) => {
            let children = children
                .iter()
                .map(|c| load_ref_rule(registry, c, validator))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Box::new(AllRefRule { children }))
        }
        RuleData::Any(children) => {
            let children = children
                .iter()
                .map(|c| load_ref_rule(registry, c, validator))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Box::new(AnyRefRule { children }))
        }
        RuleData::Leaf { id, args } => registry.ref_rule(id)?(validator, args),
    }
}

/// Combine already-loaded rules so that all of them must accept. A single
/// rule is returned as-is.
pub fn all_of<'r>(mut rules: Vec<Box<dyn CommitRule + 'r>>) -> Box<dyn CommitRule + 'r> {
    if rules.len() == 1 {
        rules.remove(0)
    } else {
        Box::new(AllRule { children: rules })
    }
}

const ALL_FAILED: &str = "All of the following conditions must be met:";
const ANY_FAILED: &str = "One of the following conditions must be met:";

/// Evaluate every child, never short-circuiting, and collect violations.
fn validate_children<T, F>(children: &[T], mut validate: F) -> Result<Vec<Violation>, Error>
where
    F: FnMut(&T) -> Result<(), Error>,
{
    let mut violations = Vec::new();
    for child in children {
        match validate(child) {
            Ok(()) => {}
            Err(Error::Violation(v)) => violations.push(v),
            Err(e) => return Err(e),
        }
    }
    Ok(violations)
}

struct AllRule<'r> {
    children: Vec<Box<dyn CommitRule + 'r>>,
}

impl CommitRule for AllRule<'_> {
    fn validate(&self, commit: &Commit<'_>, ctx: &Context<'_>) -> Result<(), Error> {
        let mut violations = validate_children(&self.children, |c| c.validate(commit, ctx))?;
        match violations.len() {
            0 => Ok(()),
            1 => Err(violations.remove(0).into()),
            _ => Err(Violation::with(ALL_FAILED, violations).into()),
        }
    }
}

struct AnyRule<'r> {
    children: Vec<Box<dyn CommitRule + 'r>>,
}

impl CommitRule for AnyRule<'_> {
    fn validate(&self, commit: &Commit<'_>, ctx: &Context<'_>) -> Result<(), Error> {
        let violations = validate_children(&self.children, |c| c.validate(commit, ctx))?;
        if violations.len() < self.children.len() {
            Ok(())
        } else {
            Err(Violation::with(ANY_FAILED, violations).into())
        }
    }
}

struct AllRefRule<'r> {
    children: Vec<Box<dyn RefRule + 'r>>,
}

impl RefRule for AllRefRule<'_> {
    fn validate(
        &self,
        commit: &Commit<'_>,
        refname: &str,
        ctx: &Context<'_>,
    ) -> Result<(), Error> {
        let mut violations =
            validate_children(&self.children, |c| c.validate(commit, refname, ctx))?;
        match violations.len() {
            0 => Ok(()),
            1 => Err(violations.remove(0).into()),
            _ => Err(Violation::with(ALL_FAILED, violations).into()),
        }
    }
}

struct AnyRefRule<'r> {
    children: Vec<Box<dyn RefRule + 'r>>,
}

impl RefRule for AnyRefRule<'_> {
    fn validate(
        &self,
        commit: &Commit<'_>,
        refname: &str,
        ctx: &Context<'_>,
    ) -> Result<(), Error> {
        let violations = validate_children(&self.children, |c| c.validate(commit, refname, ctx))?;
        if violations.len() < self.children.len() {
            Ok(())
        } else {
            Err(Violation::with(ANY_FAILED, violations).into())
        }
    }
}

/// The `none` rule always succeeds, for commits and refs alike.
struct NoneRule;

impl CommitRule for NoneRule {
    fn validate(&self, _commit: &Commit<'_>, _ctx: &Context<'_>) -> Result<(), Error> {
        Ok(())
    }
}

impl RefRule for NoneRule {
    fn validate(
        &self,
        _commit: &Commit<'_>,
        _refname: &str,
        _ctx: &Context<'_>,
    ) -> Result<(), Error> {
        Ok(())
    }
}
