use std::{
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::debug;
use serde::Deserialize;

use crate::model::ParseError;

pub const DEFAULT_NAMESPACE: &str = "default";

/// A single file inside a git repository, together with everything needed
/// to keep a local clone of that repository current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub url: String,
    pub clone_directory: PathBuf,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub file_path: PathBuf,
    pub namespace: String,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    #[default]
    None,
    BasicAuth {
        username: SecretRef,
        password: SecretRef,
    },
    SshKey {
        path: PathBuf,
    },
}

/// One key of a stored secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct SecretRef {
    pub name: String,
    pub key: String,
}

impl SecretRef {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> SecretRef {
        SecretRef {
            name: name.into(),
            key: key.into(),
        }
    }
}

impl Display for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.key)
    }
}

impl FromStr for SecretRef {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once(':') {
            Some((name, key)) if !name.is_empty() && !key.is_empty() => {
                Ok(SecretRef::new(name, key))
            }
            _ => Err(ParseError::InvalidSecretRef(value.to_owned())),
        }
    }
}

/// Artifact description as it appears in orchestrator manifests.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RawArtifactSpec {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub clone_directory: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
    #[serde(default)]
    pub file_path: String,
    pub namespace: Option<String>,
    pub creds: Option<RawCredentials>,
    pub ssh_key_path: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct RawCredentials {
    pub username: SecretRef,
    pub password: SecretRef,
}

impl TryFrom<RawArtifactSpec> for ArtifactSpec {
    type Error = ParseError;

    fn try_from(raw: RawArtifactSpec) -> Result<Self, Self::Error> {
        let RawArtifactSpec {
            url,
            clone_directory,
            branch,
            tag,
            file_path,
            namespace,
            creds,
            ssh_key_path,
        } = raw;

        let url = required("url", url)?;
        let clone_directory = required("cloneDirectory", clone_directory)?;
        let file_path = required("filePath", file_path)?;

        let credentials = match (creds, non_empty(ssh_key_path)) {
            (Some(RawCredentials { username, password }), ssh_key_path) => {
                if ssh_key_path.is_some() {
                    debug!("Both creds and sshKeyPath are set for {}, using creds", url);
                }
                Credentials::BasicAuth { username, password }
            }
            (None, Some(path)) => Credentials::SshKey { path: path.into() },
            (None, None) => Credentials::None,
        };

        Ok(ArtifactSpec {
            url,
            clone_directory: clone_directory.into(),
            branch: non_empty(branch),
            tag: non_empty(tag),
            file_path: file_path.into(),
            namespace: non_empty(namespace).unwrap_or_else(|| DEFAULT_NAMESPACE.to_owned()),
            credentials,
        })
    }
}

impl ArtifactSpec {
    pub fn from_file(path: &Path) -> Result<ArtifactSpec, ParseError> {
        debug!(
            "Attempting to read artifact description from {}",
            path.display()
        );
        let contents = std::fs::read_to_string(path)?;
        ArtifactSpec::from_toml_str(&contents)
    }

    pub fn from_toml_str(data: &str) -> Result<ArtifactSpec, ParseError> {
        let raw: RawArtifactSpec = toml::from_str(data)?;
        ArtifactSpec::try_from(raw)
    }
}

fn required(key: &str, value: String) -> Result<String, ParseError> {
    if value.trim().is_empty() {
        Err(ParseError::MissingKey(key.to_owned()))
    } else {
        Ok(value)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
