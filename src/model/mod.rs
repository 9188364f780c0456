use thiserror::Error;

pub mod artifact;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error reading artifact toml: {0}")]
    IO(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Missing TOML key `{0}` while parsing")]
    MissingKey(String),
    #[error("Secret reference `{0}` must have the form name:key")]
    InvalidSecretRef(String),
}
