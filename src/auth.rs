use std::path::Path;

use log::{debug, trace};
use ssh_key::{HashAlg, PrivateKey};
use thiserror::Error;

use crate::{
    model::artifact::{Credentials, SecretRef},
    reader::ReadError,
    secret::{SecretError, SecretProvider},
};

pub const SSH_USER: &str = "git";

#[derive(Error, Debug)]
pub enum SshKeyError {
    #[error("failed to read ssh key file: {0}")]
    IO(#[from] std::io::Error),
    #[error("failed to parse ssh key: {0}")]
    Parse(#[from] ssh_key::Error),
    #[error("failed to parse PEM ssh key: {0}")]
    Pem(#[from] pem_rfc7468::Error),
    #[error("PEM ssh key {0} does not hold a DER encoded key")]
    NotDer(String),
    #[error("ssh key is encrypted and no passphrase is available")]
    Encrypted,
}

// PKCS#1, SEC1, DSA and PKCS#8 labels libgit2 accepts next to the OpenSSH format
const PEM_KEY_LABELS: &[&str] = &[
    "RSA PRIVATE KEY",
    "EC PRIVATE KEY",
    "DSA PRIVATE KEY",
    "PRIVATE KEY",
];
const PEM_ENCRYPTED_LABEL: &str = "ENCRYPTED PRIVATE KEY";
const PEM_ENCRYPTED_HEADER: &str = "Proc-Type: 4,ENCRYPTED";

/// A private key that parsed as one of the formats libgit2 can authenticate with.
#[derive(Clone)]
pub enum SshKeyFormat {
    OpenSsh(PrivateKey),
    Pem { label: String },
}

/// Credentials ready to hand to the transport.
#[derive(Clone)]
pub enum ResolvedAuth {
    None,
    Basic {
        username: String,
        password: String,
    },
    SshKey {
        username: String,
        key: SshKeyFormat,
        // Key file contents, as libgit2 expects them in memory.
        private_key: String,
    },
}

impl std::fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedAuth::None => f.write_str("None"),
            ResolvedAuth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            ResolvedAuth::SshKey {
                username,
                key: SshKeyFormat::OpenSsh(key),
                ..
            } => f
                .debug_struct("SshKey")
                .field("username", username)
                .field("fingerprint", &key.fingerprint(HashAlg::Sha256).to_string())
                .finish_non_exhaustive(),
            ResolvedAuth::SshKey {
                username,
                key: SshKeyFormat::Pem { label },
                ..
            } => f
                .debug_struct("SshKey")
                .field("username", username)
                .field("format", label)
                .finish_non_exhaustive(),
        }
    }
}

/// Turns the configured credential strategy into concrete credentials,
/// fetching secrets or reading the key file as needed.
pub fn resolve_auth<S: SecretProvider>(
    secrets: &S,
    namespace: &str,
    credentials: &Credentials,
) -> Result<ResolvedAuth, ReadError> {
    match credentials {
        Credentials::BasicAuth { username, password } => {
            let username = lookup_secret(secrets, namespace, username)?;
            let password = lookup_secret(secrets, namespace, password)?;
            trace!("Resolved basic auth for user {}", username);
            Ok(ResolvedAuth::Basic { username, password })
        }
        Credentials::SshKey { path } => {
            ssh_key_auth(path).map_err(|source| ReadError::SshKeyInvalid {
                path: path.clone(),
                source,
            })
        }
        Credentials::None => Ok(ResolvedAuth::None),
    }
}

fn lookup_secret<S: SecretProvider>(
    secrets: &S,
    namespace: &str,
    secret: &SecretRef,
) -> Result<String, ReadError> {
    secrets
        .get_secret(namespace, &secret.name, &secret.key)
        .and_then(|value| String::from_utf8(value).map_err(SecretError::from))
        .map_err(|source| ReadError::SecretLookupFailed {
            secret: secret.clone(),
            source,
        })
}

fn ssh_key_auth(path: &Path) -> Result<ResolvedAuth, SshKeyError> {
    let private_key = std::fs::read_to_string(path)?;
    let key = parse_ssh_key(private_key.trim())?;
    match &key {
        SshKeyFormat::OpenSsh(key) => debug!(
            "Loaded {} ssh key {} from {}",
            key.algorithm(),
            key.fingerprint(HashAlg::Sha256),
            path.display()
        ),
        SshKeyFormat::Pem { label } => {
            debug!("Loaded PEM {} from {}", label, path.display())
        }
    }
    Ok(ResolvedAuth::SshKey {
        username: SSH_USER.to_owned(),
        key,
        private_key,
    })
}

fn parse_ssh_key(text: &str) -> Result<SshKeyFormat, SshKeyError> {
    match pem_rfc7468::decode_label(text.as_bytes()) {
        Ok(label) if label == PEM_ENCRYPTED_LABEL => Err(SshKeyError::Encrypted),
        Ok(label) if PEM_KEY_LABELS.contains(&label) => {
            if text.contains(PEM_ENCRYPTED_HEADER) {
                return Err(SshKeyError::Encrypted);
            }
            let (label, der) = pem_rfc7468::decode_vec(text.as_bytes())?;
            // All of these encodings are a DER SEQUENCE at the top level
            if der.first() != Some(&0x30) {
                return Err(SshKeyError::NotDer(label.to_owned()));
            }
            Ok(SshKeyFormat::Pem {
                label: label.to_owned(),
            })
        }
        _ => {
            let key = PrivateKey::from_openssh(text)?;
            if key.is_encrypted() {
                return Err(SshKeyError::Encrypted);
            }
            Ok(SshKeyFormat::OpenSsh(key))
        }
    }
}

#[cfg(test)]
pub(crate) fn write_test_ssh_key(dir: &Path) -> std::path::PathBuf {
    use ssh_key::{
        private::{Ed25519Keypair, KeypairData},
        LineEnding,
    };

    let keypair = Ed25519Keypair::from_seed(&[7u8; 32]);
    let key = PrivateKey::new(KeypairData::Ed25519(keypair), "test@example.com").unwrap();
    let path = dir.join("id_ed25519");
    std::fs::write(&path, key.to_openssh(LineEnding::LF).unwrap().as_bytes()).unwrap();
    path
}
