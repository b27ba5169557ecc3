//! The self-hosted policy branch.
//!
//! Policies live on the reserved `refs/heads/bark_rules` branch, as a YAML
//! document mapping reference patterns to bootstrap commits and rule sets.
//! The branch is verified by the same commit-rule machinery as any other
//! ref, under the bootstrap the local user has chosen to trust.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;

use crate::git;
use crate::git::{Commit, Oid};
use crate::rule;
use crate::rule::{Registry, RuleData};

/// The reference carrying the policy document.
pub const BARK_RULES_REF: &str = "refs/heads/bark_rules";
/// Directory holding bark's in-tree configuration.
pub const BARK_CONFIG: &str = ".bark";
/// The policy document, relative to the repository root.
pub const BARK_RULES_PATH: &str = ".bark/bark_rules.yaml";
/// The rule module manifest, relative to the repository root.
pub const REQUIREMENTS_PATH: &str = ".bark/requirements.txt";
/// Per-commit rules, relative to the repository root.
pub const COMMIT_RULES_PATH: &str = ".bark/commit_rules.yaml";
/// Directory of authorized public keys, relative to the repository root.
pub const PUBKEYS_PATH: &str = ".bark/.pubkeys";

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid policy document: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Rule(#[from] rule::ParseError),
    #[error("invalid bootstrap hash '{0}'")]
    InvalidBootstrap(String),
    #[error("invalid ref pattern '{pattern}': {err}")]
    Pattern {
        pattern: String,
        #[source]
        err: regex::Error,
    },
    #[error("rule module '{0}' is required but not installed")]
    MissingModule(String),
    #[error(transparent)]
    Git(#[from] git::Error),
}

/// A reference pattern, matched against the start of a ref name.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn new(source: &str) -> Result<Self, Error> {
        let regex = Regex::new(&format!("^(?:{source})")).map_err(|err| Error::Pattern {
            pattern: source.to_owned(),
            err,
        })?;
        Ok(Self {
            source: source.to_owned(),
            regex,
        })
    }

    pub fn matches(&self, refname: &str) -> bool {
        self.regex.is_match(refname)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Rules for references matching a pattern, evaluated under a bootstrap.
#[derive(Debug, Clone)]
pub struct RefRuleData {
    /// The trusted commit the commit-rule walk starts from.
    pub bootstrap: Oid,
    /// Which references this entry protects.
    pub pattern: Pattern,
    /// The ref rules guarding updates of matching references.
    pub rules: RuleData,
}

#[derive(Debug, Deserialize)]
struct RawBarkRules {
    #[serde(default)]
    bark_rules: Vec<Value>,
    #[serde(default)]
    project: Vec<RawBootstrapEntry>,
}

#[derive(Debug, Deserialize)]
struct RawBootstrapEntry {
    bootstrap: String,
    #[serde(default)]
    refs: Vec<RawRefRules>,
}

#[derive(Debug, Deserialize)]
struct RawRefRules {
    pattern: String,
    #[serde(default)]
    rules: Vec<Value>,
}

/// The parsed policy document.
#[derive(Debug, Clone, Default)]
pub struct BarkRules {
    /// Ref rules guarding the policy branch itself.
    bark_rules: RuleData,
    /// Bootstrap entries protecting project references.
    entries: Vec<RefRuleData>,
}

/// The fixed pattern binding the policy branch's own rules.
#[allow(clippy::expect_used)]
static BARK_RULES_PATTERN: Lazy<Pattern> = Lazy::new(|| {
    Pattern::new("refs/heads/bark_rules$").expect("the policy branch pattern is valid")
});

impl BarkRules {
    /// Parse and eagerly validate a policy document.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let raw: RawBarkRules = serde_yaml::from_slice(bytes)?;
        let bark_rules = RuleData::parse_list(&raw.bark_rules)?;
        let mut entries = Vec::new();

        for entry in raw.project {
            let bootstrap = parse_oid(&entry.bootstrap)?;
            for refs in entry.refs {
                entries.push(RefRuleData {
                    bootstrap,
                    pattern: Pattern::new(&refs.pattern)?,
                    rules: RuleData::parse_list(&refs.rules)?,
                });
            }
        }
        Ok(Self {
            bark_rules,
            entries,
        })
    }

    /// Load the policy document carried by the given commit. A commit
    /// without a policy document yields an empty policy.
    pub fn load(commit: &Commit) -> Result<Self, Error> {
        match commit.read_file(BARK_RULES_PATH) {
            Ok(blob) => Self::parse(&blob),
            Err(e) if e.is_not_found() => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// The entry guarding the policy branch itself. Always bound to the
    /// fixed pattern `refs/heads/bark_rules`.
    pub fn bark_rules_entry(&self, bootstrap: Oid) -> RefRuleData {
        RefRuleData {
            bootstrap,
            pattern: BARK_RULES_PATTERN.clone(),
            rules: self.bark_rules.clone(),
        }
    }

    /// All entries whose pattern matches the given reference.
    pub fn ref_rules(&self, refname: &str) -> Vec<&RefRuleData> {
        self.entries
            .iter()
            .filter(|e| e.pattern.matches(refname))
            .collect()
    }

    /// Whether any entry protects the given reference.
    pub fn is_protected(&self, refname: &str) -> bool {
        self.entries.iter().any(|e| e.pattern.matches(refname))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommitRulesDoc {
    rules: Option<Vec<Value>>,
}

/// Read and parse a commit's own rules file. Returns `None` when the commit
/// carries no rules file; the caller decides whether that is acceptable.
pub fn commit_rules(commit: &Commit) -> Result<Option<RuleData>, Error> {
    let blob = match commit.read_file(COMMIT_RULES_PATH) {
        Ok(blob) => blob,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let doc: CommitRulesDoc = serde_yaml::from_slice(&blob)?;
    let rules = doc.rules.unwrap_or_default();

    Ok(Some(RuleData::parse_list(&rules)?))
}

/// Parse a requirements manifest into module names. Lines are trimmed,
/// comments skipped, version specifiers stripped.
pub fn parse_requirements(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            line.split(['=', '<', '>', '~', '!', '@', ' '])
                .next()
                .map(|name| name.trim().to_owned())
        })
        .filter(|name| !name.is_empty())
        .collect()
}

/// Check that every module named in a requirements manifest is registered.
pub fn check_requirements(registry: &Registry, bytes: &[u8]) -> Result<(), Error> {
    for name in parse_requirements(bytes) {
        if !registry.has_module(&name) {
            return Err(Error::MissingModule(name));
        }
    }
    Ok(())
}

fn parse_oid(s: &str) -> Result<Oid, Error> {
    use std::str::FromStr as _;

    if s.len() != 40 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidBootstrap(s.to_owned()));
    }
    Oid::from_str(s).map_err(|_| Error::InvalidBootstrap(s.to_owned()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const DOC: &str = r#"
bark_rules:
  - fast-forward-only
project:
  - bootstrap: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa
    refs:
      - pattern: refs/heads/main
        rules:
          - fast-forward-only
      - pattern: refs/heads/releases/.*
        rules: []
  - bootstrap: bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb
    refs:
      - pattern: refs/heads/main
"#;

    #[test]
    fn test_parse_document() {
        let rules = BarkRules::parse(DOC.as_bytes()).unwrap();

        assert_eq!(rules.ref_rules("refs/heads/main").len(), 2);
        assert_eq!(rules.ref_rules("refs/heads/releases/v1").len(), 1);
        assert_eq!(rules.ref_rules("refs/heads/feature").len(), 0);
        assert!(rules.is_protected("refs/heads/main"));
        assert!(!rules.is_protected("refs/heads/feature"));
    }

    #[test]
    fn test_pattern_is_anchored() {
        let rules = BarkRules::parse(DOC.as_bytes()).unwrap();
        assert!(rules.ref_rules("refs/remotes/origin/refs/heads/main").is_empty());
    }

    #[test]
    fn test_bark_rules_entry() {
        let rules = BarkRules::parse(DOC.as_bytes()).unwrap();
        let bootstrap = parse_oid("cccccccccccccccccccccccccccccccccccccccc").unwrap();
        let entry = rules.bark_rules_entry(bootstrap);

        assert_eq!(entry.bootstrap, bootstrap);
        assert!(entry.pattern.matches(BARK_RULES_REF));
        assert_eq!(
            entry.rules,
            RuleData::Leaf {
                id: "fast-forward-only".to_owned(),
                args: Value::Null
            }
        );
    }

    #[test]
    fn test_invalid_bootstrap() {
        let doc = "project:\n  - bootstrap: nonsense\n    refs: []\n";
        assert!(matches!(
            BarkRules::parse(doc.as_bytes()),
            Err(Error::InvalidBootstrap(_))
        ));
    }

    #[test]
    fn test_empty_document() {
        let rules = BarkRules::parse(b"{}").unwrap();
        assert_eq!(rules.bark_rules, RuleData::None);
        assert!(rules.ref_rules("refs/heads/main").is_empty());
    }

    #[test]
    fn test_parse_requirements() {
        let manifest = b"\
# core rules
bark_core
acme_rules == 1.2
\n
 widget>=2\n";
        assert_eq!(
            parse_requirements(manifest),
            vec!["bark_core", "acme_rules", "widget"]
        );
    }

    #[test]
    fn test_check_requirements() {
        let mut registry = Registry::empty();
        registry.register_module("bark_core");

        assert!(check_requirements(&registry, b"bark_core\n").is_ok());
        assert!(matches!(
            check_requirements(&registry, b"bark_core\nacme_rules\n"),
            Err(Error::MissingModule(name)) if name == "acme_rules"
        ));
    }
}
