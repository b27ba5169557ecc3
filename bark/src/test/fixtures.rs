//! Repository fixtures for tests.
#![allow(clippy::unwrap_used)]
use std::collections::BTreeMap;
use std::path::Path;

use crate::git::Oid;

/// Create a repository at the given path with a couple of commits on
/// `master`.
pub fn repository<P: AsRef<Path>>(path: P) -> (git2::Repository, Oid) {
    let repo = git2::Repository::init(path).unwrap();
    {
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "anonymous").unwrap();
        config.set_str("user.email", "anonymous@example.com").unwrap();
    }
    let root = commit(&repo, &[], &[("README.md", b"# fixture")], "Initial commit", None);
    let head = commit(
        &repo,
        &[root],
        &[("README.md", b"# fixture\n")],
        "Second commit",
        None,
    );
    repo.reference("refs/heads/master", head, true, "fixture").unwrap();
    repo.set_head("refs/heads/master").unwrap();

    (repo, head)
}

/// Create a commit with exactly the given files in its tree. No reference
/// is updated. When a signer is given, the commit object is signed with it.
pub fn commit(
    repo: &git2::Repository,
    parents: &[Oid],
    files: &[(&str, &[u8])],
    message: &str,
    signer: Option<&ssh_key::PrivateKey>,
) -> Oid {
    let tree = repo.find_tree(write_tree(repo, files)).unwrap();
    let author = git2::Signature::now("anonymous", "anonymous@example.com").unwrap();
    let parents = parents
        .iter()
        .map(|p| repo.find_commit(*p).unwrap())
        .collect::<Vec<_>>();
    let parents = parents.iter().collect::<Vec<_>>();

    match signer {
        None => repo
            .commit(None, &author, &author, message, &tree, &parents)
            .unwrap(),
        Some(key) => {
            let buf = repo
                .commit_create_buffer(&author, &author, message, &tree, &parents)
                .unwrap();
            let content = std::str::from_utf8(&buf).unwrap();
            let signature = sign(key, &buf);

            repo.commit_signed(content, &signature, None).unwrap()
        }
    }
}

/// Point a reference at a commit.
pub fn set_ref(repo: &git2::Repository, name: &str, target: Oid) {
    repo.reference(name, target, true, "fixture").unwrap();
}

/// Build a tree containing exactly the given files, creating intermediate
/// directories as needed.
fn write_tree(repo: &git2::Repository, files: &[(&str, &[u8])]) -> Oid {
    let entries = files
        .iter()
        .map(|(path, data)| (path.split('/').collect::<Vec<_>>(), *data))
        .collect();

    build_tree(repo, entries)
}

fn build_tree(repo: &git2::Repository, entries: Vec<(Vec<&str>, &[u8])>) -> Oid {
    let mut builder = repo.treebuilder(None).unwrap();
    let mut subdirs: BTreeMap<&str, Vec<(Vec<&str>, &[u8])>> = BTreeMap::new();

    for (path, data) in entries {
        match path.as_slice() {
            [name] => {
                let blob = repo.blob(data).unwrap();
                builder.insert(*name, blob, 0o100_644).unwrap();
            }
            [dir, rest @ ..] => {
                subdirs.entry(*dir).or_default().push((rest.to_vec(), data));
            }
            [] => unreachable!("empty path"),
        }
    }
    for (dir, entries) in subdirs {
        let tree = build_tree(repo, entries);
        builder.insert(dir, tree, 0o040_000).unwrap();
    }
    builder.write().unwrap()
}

/// Generate a fresh Ed25519 signing key.
pub fn signer() -> ssh_key::PrivateKey {
    ssh_key::PrivateKey::random(&mut ssh_key::rand_core::OsRng, ssh_key::Algorithm::Ed25519)
        .unwrap()
}

/// The signer's public key in OpenSSH format, as stored in `.bark/.pubkeys`.
pub fn public_key(key: &ssh_key::PrivateKey) -> String {
    key.public_key().to_openssh().unwrap()
}

/// Produce an armored detached signature over the subject, in the namespace
/// `git` uses for object signing.
pub fn sign(key: &ssh_key::PrivateKey, subject: &[u8]) -> String {
    ssh_key::SshSig::sign(key, "git", ssh_key::HashAlg::Sha512, subject)
        .unwrap()
        .to_pem(ssh_key::LineEnding::LF)
        .unwrap()
}
