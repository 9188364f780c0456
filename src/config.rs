use std::{collections::HashMap, path::PathBuf};

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::git::DEFAULT_SUBMODULE_RECURSION_DEPTH;

pub const DEFAULT_SECRETS_DIR: &str = "/var/run/secrets/git-artifact";

pub struct GitArtifactConfig {
    pub secrets_dir: PathBuf,
    pub submodule_depth: usize,
}

impl GitArtifactConfig {
    pub fn load() -> anyhow::Result<Self> {
        let raw_config = RawConfig::load(None)?;

        Ok(Self {
            secrets_dir: raw_config
                .secrets
                .dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SECRETS_DIR)),
            submodule_depth: raw_config
                .submodules
                .depth
                .unwrap_or(DEFAULT_SUBMODULE_RECURSION_DEPTH),
        })
    }
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct RawConfig {
    #[serde(default)]
    secrets: SecretsConfig,
    #[serde(default)]
    submodules: SubmodulesConfig,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct SecretsConfig {
    dir: Option<PathBuf>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct SubmodulesConfig {
    depth: Option<usize>,
}

impl RawConfig {
    fn load(env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(
                Environment::with_prefix("GIT_ARTIFACT")
                    .separator("_")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()
    }
}
