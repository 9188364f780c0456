pub mod auth;
pub mod cli;
pub mod config;
pub mod git;
pub mod model;
pub mod reader;
pub mod secret;

pub use model::artifact::{ArtifactSpec, Credentials, SecretRef};
pub use reader::{GitArtifactReader, ReadError};
pub use secret::{DirectorySecretProvider, SecretProvider};
