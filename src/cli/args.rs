use std::path::PathBuf;

use clap::{Args, Parser};

use crate::model::artifact::SecretRef;

/// Fetches a single file from a git repository, cloning or pulling a local copy first.
#[derive(Debug, Parser)]
#[clap(version)]
pub struct CliArgs {
    #[clap(subcommand)]
    pub cmd: Command,
    /// Root of the mounted secrets, laid out as <namespace>/<name>/<key>
    #[clap(long, env = "GIT_ARTIFACT_SECRETS_DIR")]
    pub secrets_dir: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub enum Command {
    /// Reads a file from the repository described by the flags
    Read {
        #[clap(flatten)]
        artifact: ArtifactArgs,
        /// Write the file here instead of stdout
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
    /// Reads a file from the repository described by a TOML artifact file
    ReadSpec {
        path: PathBuf,
        /// Write the file here instead of stdout
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
pub struct ArtifactArgs {
    #[clap(long)]
    pub url: String,
    #[clap(long)]
    pub clone_directory: PathBuf,
    #[clap(long)]
    pub branch: Option<String>,
    #[clap(long)]
    pub tag: Option<String>,
    #[clap(long)]
    pub file_path: PathBuf,
    #[clap(long, default_value = "default")]
    pub namespace: String,
    /// Secret holding the username, as name:key
    #[clap(long, requires = "password_secret")]
    pub username_secret: Option<SecretRef>,
    /// Secret holding the password, as name:key
    #[clap(long, requires = "username_secret")]
    pub password_secret: Option<SecretRef>,
    #[clap(long)]
    pub ssh_key_path: Option<PathBuf>,
}
