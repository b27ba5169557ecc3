//! Public keys used by the signature rules.
//!
//! Keys live in the validator commit's tree, under `.bark/.pubkeys`. The
//! key type is detected from the blob header: OpenSSH keys are verified
//! in-process, PGP keys by deferring to the `gpg` tool with a throwaway
//! keyring.
use std::fs;
use std::process::{Command, Stdio};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("could not parse public key")]
    Invalid,
    #[error("ssh key error: {0}")]
    Ssh(#[from] ssh_key::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("`{0}` could not be run: {1}")]
    Tool(&'static str, std::io::Error),
    #[error("`{0}` exited with an error")]
    ToolFailed(&'static str),
}

/// Namespace used by `git` when signing objects with SSH keys.
const SSH_NAMESPACE: &str = "git";

/// An authorized public key, PGP or SSH.
#[derive(Debug, Clone)]
pub enum PublicKey {
    Ssh(Box<ssh_key::PublicKey>),
    Pgp(PgpKey),
}

impl PublicKey {
    /// Parse a key blob, detecting the key type from its header.
    pub fn parse(blob: &[u8]) -> Result<Self, KeyError> {
        let text = std::str::from_utf8(blob).map_err(|_| KeyError::Invalid)?;
        let trimmed = text.trim_start();

        if trimmed.starts_with("ssh-")
            || trimmed.starts_with("ecdsa-")
            || trimmed.starts_with("sk-")
        {
            Ok(Self::Ssh(Box::new(ssh_key::PublicKey::from_openssh(text)?)))
        } else if trimmed.contains("BEGIN PGP PUBLIC KEY BLOCK") {
            PgpKey::parse(blob).map(Self::Pgp)
        } else {
            Err(KeyError::Invalid)
        }
    }

    /// A stable identifier for the signing key. Two signatures by the same
    /// key always yield the same fingerprint.
    pub fn fingerprint(&self) -> String {
        match self {
            Self::Ssh(key) => key.fingerprint(ssh_key::HashAlg::Sha256).to_string(),
            Self::Pgp(key) => key.fingerprint.clone(),
        }
    }

    /// Verify a detached signature over the given subject.
    pub fn verify(&self, signature: &[u8], subject: &[u8]) -> bool {
        match self {
            Self::Ssh(key) => {
                let Ok(sig) = ssh_key::SshSig::from_pem(signature) else {
                    return false;
                };
                key.verify(SSH_NAMESPACE, subject, &sig).is_ok()
            }
            Self::Pgp(key) => key.verify(signature, subject),
        }
    }
}

/// A PGP key, held as the raw armored blob. Verification shells out to
/// `gpg`; only the fingerprint is extracted up front.
#[derive(Debug, Clone)]
pub struct PgpKey {
    blob: Vec<u8>,
    fingerprint: String,
}

impl PgpKey {
    fn parse(blob: &[u8]) -> Result<Self, KeyError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("key.asc");
        fs::write(&path, blob)?;

        let output = Command::new("gpg")
            .args(["--batch", "--with-colons", "--show-keys"])
            .arg(&path)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| KeyError::Tool("gpg", e))?;
        if !output.status.success() {
            return Err(KeyError::ToolFailed("gpg"));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let fingerprint = stdout
            .lines()
            .filter(|line| line.starts_with("fpr:"))
            .find_map(|line| line.split(':').nth(9))
            .filter(|f| !f.is_empty())
            .map(ToOwned::to_owned)
            .ok_or(KeyError::Invalid)?;

        Ok(Self {
            blob: blob.to_vec(),
            fingerprint,
        })
    }

    fn verify(&self, signature: &[u8], subject: &[u8]) -> bool {
        self.verify_inner(signature, subject).unwrap_or(false)
    }

    fn verify_inner(&self, signature: &[u8], subject: &[u8]) -> Result<bool, KeyError> {
        let dir = tempfile::tempdir()?;
        let home = dir.path();
        let keyring = home.join("keyring.gpg");
        let key = home.join("key.asc");
        let sig = home.join("sig.asc");
        let payload = home.join("subject");

        fs::write(&key, &self.blob)?;
        fs::write(&sig, signature)?;
        fs::write(&payload, subject)?;

        let imported = Command::new("gpg")
            .arg("--homedir")
            .arg(home)
            .arg("--no-default-keyring")
            .arg("--keyring")
            .arg(&keyring)
            .args(["--batch", "--quiet", "--import"])
            .arg(&key)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| KeyError::Tool("gpg", e))?;
        if !imported.success() {
            return Err(KeyError::ToolFailed("gpg"));
        }

        let status = Command::new("gpg")
            .arg("--homedir")
            .arg(home)
            .arg("--no-default-keyring")
            .arg("--keyring")
            .arg(&keyring)
            .args(["--batch", "--quiet", "--verify"])
            .arg(&sig)
            .arg(&payload)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| KeyError::Tool("gpg", e))?;

        Ok(status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::fixtures;

    #[test]
    fn test_parse_ssh_key() {
        let signer = fixtures::signer();
        let key = PublicKey::parse(fixtures::public_key(&signer).as_bytes()).unwrap();

        assert!(matches!(key, PublicKey::Ssh(_)));
        assert!(key.fingerprint().starts_with("SHA256:"));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            PublicKey::parse(b"not a key"),
            Err(KeyError::Invalid)
        ));
        assert!(matches!(PublicKey::parse(&[0xff, 0xfe]), Err(KeyError::Invalid)));
    }

    #[test]
    fn test_ssh_sign_verify() {
        let signer = fixtures::signer();
        let other = fixtures::signer();
        let key = PublicKey::parse(fixtures::public_key(&signer).as_bytes()).unwrap();

        let subject = b"tree deadbeef\n\nSigned payload";
        let signature = fixtures::sign(&signer, subject);

        assert!(key.verify(signature.as_bytes(), subject));
        assert!(!key.verify(signature.as_bytes(), b"tampered payload"));

        let signature = fixtures::sign(&other, subject);
        assert!(!key.verify(signature.as_bytes(), subject), "wrong key");
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let signer = fixtures::signer();
        let a = PublicKey::parse(fixtures::public_key(&signer).as_bytes()).unwrap();
        let b = PublicKey::parse(fixtures::public_key(&signer).as_bytes()).unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
