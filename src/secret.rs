use std::path::PathBuf;

use log::trace;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("Secret {name} has no key {key} in namespace {namespace}")]
    NotFound {
        namespace: String,
        name: String,
        key: String,
    },
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Secret value is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
    #[error("{0}")]
    Other(String),
}

/// Source of stored secret values, addressed by namespace, secret name and key.
#[cfg_attr(test, automock)]
pub trait SecretProvider {
    fn get_secret(&self, namespace: &str, name: &str, key: &str) -> Result<Vec<u8>, SecretError>;
}

impl<P: SecretProvider + ?Sized> SecretProvider for &P {
    fn get_secret(&self, namespace: &str, name: &str, key: &str) -> Result<Vec<u8>, SecretError> {
        (**self).get_secret(namespace, name, key)
    }
}

/// Reads secrets laid out as `<root>/<namespace>/<name>/<key>`, the shape of
/// mounted secret volumes.
pub struct DirectorySecretProvider {
    root: PathBuf,
}

impl DirectorySecretProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SecretProvider for DirectorySecretProvider {
    fn get_secret(&self, namespace: &str, name: &str, key: &str) -> Result<Vec<u8>, SecretError> {
        let path = self.root.join(namespace).join(name).join(key);
        trace!("Reading secret from {}", path.display());
        match std::fs::read(&path) {
            Ok(value) => Ok(value),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(SecretError::NotFound {
                    namespace: namespace.to_owned(),
                    name: name.to_owned(),
                    key: key.to_owned(),
                })
            }
            Err(error) => Err(error.into()),
        }
    }
}
