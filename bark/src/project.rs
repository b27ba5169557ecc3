//! Per-repository state.
//!
//! Everything bark persists lives under `<repo>/.git/bark/`: the bootstrap
//! commit the local user has chosen to trust, one validation cache per
//! bootstrap, and an `env/` tree reserved for rule module state. A project
//! is constructed at command entry and [`Project::update`] is called once
//! at exit to flush caches and the persisted bootstrap.
use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{fs, io};

use thiserror::Error;

use crate::cache;
use crate::cache::Cache;
use crate::engine::Cancel;
use crate::git;
use crate::git::{Oid, Repository};
use crate::rule::Registry;

/// Directory under `.git` holding bark's state.
pub const BARK_DIR: &str = "bark";
/// File persisting the trusted bootstrap commit.
const BOOTSTRAP_FILE: &str = "bootstrap";
/// Directory holding the per-bootstrap validation caches.
const CACHE_DIR: &str = "cache";
/// Directory reserved for installed rule module state.
const ENV_DIR: &str = "env";

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid persisted bootstrap '{0}'")]
    InvalidBootstrap(String),
    #[error(transparent)]
    Git(#[from] git::Error),
    #[error(transparent)]
    Cache(#[from] cache::Error),
}

/// A repository together with bark's persisted state for it.
pub struct Project {
    repo: Repository,
    registry: Registry,
    bark_dir: PathBuf,
    caches: HashMap<Oid, Cache>,
    bootstrap: Option<Oid>,
    cancel: Cancel,
}

impl Project {
    /// Open the repository at the given path, creating bark's state
    /// directories if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let repo = Repository::open(path)?;
        let bark_dir = repo.git_dir().join(BARK_DIR);

        fs::create_dir_all(bark_dir.join(CACHE_DIR))?;
        fs::create_dir_all(bark_dir.join(ENV_DIR))?;

        let bootstrap = match fs::read_to_string(bark_dir.join(BOOTSTRAP_FILE)) {
            Ok(content) => {
                let content = content.trim();
                let oid = Oid::from_str(content)
                    .map_err(|_| Error::InvalidBootstrap(content.to_owned()))?;
                Some(oid)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            repo,
            registry: Registry::default(),
            bark_dir,
            caches: HashMap::new(),
            bootstrap,
            cancel: Cancel::new(),
        })
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Mutable access, for registering third-party rules at startup.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// The persisted bootstrap for the policy branch, if any.
    pub fn bootstrap(&self) -> Option<Oid> {
        self.bootstrap
    }

    /// Choose the bootstrap to trust. Persisted by [`Project::update`].
    pub fn set_bootstrap(&mut self, bootstrap: Oid) {
        self.bootstrap = Some(bootstrap);
    }

    /// A handle to this project's cancellation signal.
    pub fn cancel(&self) -> Cancel {
        self.cancel.clone()
    }

    /// Borrow everything a verification walk needs: the repository, the
    /// cache scoped to the given bootstrap, the rule registry and the
    /// cancellation signal.
    pub fn walk_parts(
        &mut self,
        bootstrap: Oid,
    ) -> Result<(&Repository, &mut Cache, &Registry, Cancel), Error> {
        let cache = match self.caches.entry(bootstrap) {
            MapEntry::Occupied(e) => e.into_mut(),
            MapEntry::Vacant(v) => {
                v.insert(Cache::open(self.bark_dir.join(CACHE_DIR), bootstrap)?)
            }
        };
        Ok((&self.repo, cache, &self.registry, self.cancel.clone()))
    }

    /// Bootstraps with an existing cache on disk.
    pub fn cached_bootstraps(&self) -> Result<Vec<Oid>, Error> {
        Ok(Cache::list(self.bark_dir.join(CACHE_DIR))?)
    }

    /// Drop all pending cache writes.
    pub fn discard(&mut self) {
        for cache in self.caches.values_mut() {
            cache.discard();
        }
    }

    /// Flush caches and persist the bootstrap choice. Called once at
    /// command exit.
    pub fn update(mut self) -> Result<(), Error> {
        for (_, cache) in self.caches.drain() {
            cache.close()?;
        }
        if let Some(bootstrap) = self.bootstrap {
            fs::write(self.bark_dir.join(BOOTSTRAP_FILE), format!("{bootstrap}\n"))?;
        }
        Ok(())
    }
}
