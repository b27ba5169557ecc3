//! Read-only access to Git repositories.
//!
//! Everything the rule machinery knows about Git goes through this module:
//! commit lookup, reference listing, ancestry tests, tree globbing and
//! diffs. The object database is never written to.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

pub use git2 as raw;

/// A Git object id.
pub type Oid = git2::Oid;

#[derive(Debug, Error)]
pub enum Error {
    /// An object named by the caller does not exist.
    #[error("object not found: {0}")]
    NotFound(String),
    /// A file path does not exist in a commit's tree.
    #[error("'{path}' does not exist in commit {commit}")]
    FileNotFound { commit: Oid, path: String },
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
}

impl Error {
    /// Whether this error signifies a missing object or file.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::FileNotFound { .. } => true,
            Self::Git(e) => e.code() == git2::ErrorCode::NotFound,
        }
    }
}

fn is_not_found(e: &git2::Error) -> bool {
    e.code() == git2::ErrorCode::NotFound
}

/// Read-only handle to a Git repository.
pub struct Repository {
    backend: git2::Repository,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Repository({:?})", self.backend.path())
    }
}

impl Repository {
    /// Open the repository at the given root path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let backend = git2::Repository::open_ext(
            path.as_ref(),
            git2::RepositoryOpenFlags::NO_SEARCH,
            &[] as &[&std::ffi::OsStr],
        )?;
        Ok(Self { backend })
    }

    /// The `.git` directory of this repository.
    pub fn git_dir(&self) -> PathBuf {
        self.backend.path().to_path_buf()
    }

    /// Access the backing `git2` repository.
    pub fn raw(&self) -> &git2::Repository {
        &self.backend
    }

    /// Get a handle to the commit with the given id.
    pub fn commit(&self, id: Oid) -> Result<Commit<'_>, Error> {
        self.backend.find_commit(id).map_err(|e| {
            if is_not_found(&e) {
                Error::NotFound(id.to_string())
            } else {
                e.into()
            }
        })?;

        Ok(Commit { repo: self, id })
    }

    /// Resolve a name to a commit. Accepts a ref name, a short name, a hash
    /// prefix, or `"HEAD"`. Returns the full ref name when the input named
    /// a reference.
    pub fn resolve(&self, name: &str) -> Result<(Commit<'_>, Option<String>), Error> {
        let (object, reference) = self.backend.revparse_ext(name).map_err(|e| {
            if is_not_found(&e) {
                Error::NotFound(name.to_owned())
            } else {
                Error::from(e)
            }
        })?;
        let commit = object
            .peel_to_commit()
            .map_err(|_| Error::NotFound(name.to_owned()))?;

        Ok((
            Commit {
                repo: self,
                id: commit.id(),
            },
            reference.and_then(|r| r.name().map(|n| n.to_owned())),
        ))
    }

    /// All local references and the commits they point to. References that
    /// don't peel to a commit are skipped.
    pub fn references(&self) -> Result<BTreeMap<String, Commit<'_>>, Error> {
        let mut refs = BTreeMap::new();

        for reference in self.backend.references()? {
            let reference = reference?;
            let Some(name) = reference.name().map(|n| n.to_owned()) else {
                continue;
            };
            let Some(target) = reference.resolve()?.target() else {
                continue;
            };
            if let Ok(commit) = self.commit(target) {
                refs.insert(name, commit);
            }
        }
        Ok(refs)
    }

    /// Check whether `a` is an ancestor of `b`. A commit is considered its
    /// own ancestor, matching `git merge-base --is-ancestor`.
    pub fn is_ancestor(&self, a: Oid, b: Oid) -> Result<bool, Error> {
        if a == b {
            return Ok(true);
        }
        Ok(self.backend.graph_descendant_of(b, a)?)
    }
}

/// Handle to a commit in a [`Repository`]. Cheap to copy; equality is by
/// object id.
#[derive(Clone, Copy)]
pub struct Commit<'r> {
    repo: &'r Repository,
    id: Oid,
}

impl PartialEq for Commit<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Commit<'_> {}

impl PartialOrd for Commit<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Commit<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Debug for Commit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commit({})", self.id)
    }
}

impl fmt::Display for Commit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl<'r> Commit<'r> {
    /// The commit's object id.
    pub fn id(&self) -> Oid {
        self.id
    }

    fn object(&self) -> Result<git2::Commit<'r>, Error> {
        Ok(self.repo.backend.find_commit(self.id)?)
    }

    /// The commit's parents, in order. The order is meaningful: the second
    /// parent of a merge is the "incoming" side.
    pub fn parents(&self) -> Result<Vec<Commit<'r>>, Error> {
        let object = self.object()?;

        Ok(object
            .parent_ids()
            .map(|id| Commit {
                repo: self.repo,
                id,
            })
            .collect())
    }

    /// The author's name and email.
    pub fn author(&self) -> Result<(String, String), Error> {
        let object = self.object()?;
        let author = object.author();

        Ok((
            String::from_utf8_lossy(author.name_bytes()).into_owned(),
            String::from_utf8_lossy(author.email_bytes()).into_owned(),
        ))
    }

    /// The commit message.
    pub fn message(&self) -> Result<String, Error> {
        let object = self.object()?;

        Ok(String::from_utf8_lossy(object.message_bytes()).into_owned())
    }

    /// The id of the tree this commit points to.
    pub fn tree_hash(&self) -> Result<Oid, Error> {
        Ok(self.object()?.tree_id())
    }

    /// The raw commit object, as stored in the object database. This is the
    /// payload that detached approval signatures are computed over.
    pub fn raw_object(&self) -> Result<Vec<u8>, Error> {
        let odb = self.repo.backend.odb()?;
        let object = odb.read(self.id)?;

        Ok(object.data().to_vec())
    }

    /// The commit's detached signature and the signed payload, or `None` if
    /// the commit is unsigned.
    pub fn signature(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error> {
        match self.repo.backend.extract_signature(&self.id, None) {
            Ok((sig, subject)) => Ok(Some((sig.to_vec(), subject.to_vec()))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the contents of a file in the commit's tree.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, Error> {
        let tree = self.object()?.tree()?;
        let entry = tree.get_path(Path::new(path)).map_err(|e| {
            if is_not_found(&e) {
                Error::FileNotFound {
                    commit: self.id,
                    path: path.to_owned(),
                }
            } else {
                Error::from(e)
            }
        })?;
        let object = entry.to_object(&self.repo.backend)?;
        let blob = object.peel_to_blob().map_err(|_| Error::FileNotFound {
            commit: self.id,
            path: path.to_owned(),
        })?;

        Ok(blob.content().to_vec())
    }

    /// List files in the commit's tree matching any of the given glob
    /// patterns. Patterns are `/`-separated and support `*` within a
    /// segment as well as `**` for any number of segments.
    pub fn list_files(&self, patterns: &[&str]) -> Result<BTreeSet<String>, Error> {
        let tree = self.object()?.tree()?;
        let patterns = patterns
            .iter()
            .map(|p| p.split('/').collect::<Vec<_>>())
            .collect::<Vec<_>>();
        let mut matches = BTreeSet::new();

        glob_tree(&self.repo.backend, &tree, &patterns, "", &mut matches)?;

        Ok(matches)
    }

    /// The set of file paths that differ between this commit's tree and the
    /// other commit's tree. Both old and new paths of a rename are included.
    pub fn files_modified(&self, other: &Commit) -> Result<BTreeSet<String>, Error> {
        let ours = self.object()?.tree()?;
        let theirs = other.object()?.tree()?;
        let diff =
            self.repo
                .backend
                .diff_tree_to_tree(Some(&theirs), Some(&ours), None)?;
        let mut paths = BTreeSet::new();

        for delta in diff.deltas() {
            for file in [delta.old_file(), delta.new_file()] {
                if let Some(path) = file.path() {
                    paths.insert(path.to_string_lossy().into_owned());
                }
            }
        }
        Ok(paths)
    }
}

/// Match a single path segment against a pattern segment, where `*` matches
/// any (possibly empty) run of characters.
fn segment_matches(pattern: &str, name: &str) -> bool {
    fn go(p: &[u8], n: &[u8]) -> bool {
        match p.split_first() {
            None => n.is_empty(),
            Some((b'*', rest)) => go(rest, n) || (!n.is_empty() && go(p, &n[1..])),
            Some((c, rest)) => n.split_first().is_some_and(|(d, nr)| c == d && go(rest, nr)),
        }
    }
    go(pattern.as_bytes(), name.as_bytes())
}

fn glob_tree(
    repo: &git2::Repository,
    tree: &git2::Tree,
    patterns: &[Vec<&str>],
    prefix: &str,
    matches: &mut BTreeSet<String>,
) -> Result<(), Error> {
    for entry in tree.iter() {
        let Some(name) = entry.name() else {
            continue;
        };
        let mut matching: Vec<&[&str]> = Vec::new();

        for pattern in patterns {
            let Some(first) = pattern.first() else {
                continue;
            };
            if segment_matches(first, name) {
                if *first == "**" {
                    // `**` may span several segments; keep it in play.
                    matching.push(pattern.as_slice());
                }
                matching.push(&pattern[1..]);
            }
        }

        if entry.kind() == Some(git2::ObjectType::Tree) {
            let matching = matching
                .into_iter()
                .filter(|p| !p.is_empty())
                .map(|p| p.to_vec())
                .collect::<Vec<_>>();

            if !matching.is_empty() {
                let subtree = repo.find_tree(entry.id())?;
                glob_tree(repo, &subtree, &matching, &format!("{prefix}{name}/"), matches)?;
            }
        } else if matching.iter().any(|p| p.is_empty()) {
            matches.insert(format!("{prefix}{name}"));
        } else {
            // A trailing `**` also matches the file itself.
            for mut m in matching {
                while m.first() == Some(&"**") {
                    m = &m[1..];
                }
                if m.len() == 1 && segment_matches(m[0], name) {
                    matches.insert(format!("{prefix}{name}"));
                    break;
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum RefUpdateError {
    #[error("invalid reference update line '{0}'")]
    InvalidLine(String),
    #[error("invalid object id: {0}")]
    InvalidOid(#[from] git2::Error),
}

/// A pending update of a single reference, as received from the repository
/// hook: `<old> <new> <refname>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub old: Oid,
    pub new: Oid,
    pub name: String,
}

impl RefUpdate {
    /// The ref is being deleted.
    pub fn is_delete(&self) -> bool {
        self.new.is_zero()
    }

    /// The ref is being created.
    pub fn is_create(&self) -> bool {
        self.old.is_zero()
    }

    /// Old and new targets are the same.
    pub fn is_noop(&self) -> bool {
        self.old == self.new
    }
}

impl fmt::Display for RefUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.name, self.old, self.new)
    }
}

impl FromStr for RefUpdate {
    type Err = RefUpdateError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut fields = line.split_whitespace();
        let (Some(old), Some(new), Some(name), None) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(RefUpdateError::InvalidLine(line.to_owned()));
        };

        Ok(Self {
            old: Oid::from_str(old)?,
            new: Oid::from_str(new)?,
            name: name.to_owned(),
        })
    }
}
