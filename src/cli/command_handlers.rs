use std::{
    io::Write,
    path::{Path, PathBuf},
};

use log::info;

use crate::{
    cli::args::ArtifactArgs,
    config::GitArtifactConfig,
    model::artifact::{ArtifactSpec, Credentials},
    reader::GitArtifactReader,
    secret::DirectorySecretProvider,
};

/// Handler to read command
pub fn do_read(
    spec: &ArtifactSpec,
    secrets_dir: Option<PathBuf>,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let config = GitArtifactConfig::load()?;
    let secrets = DirectorySecretProvider::new(secrets_dir.unwrap_or(config.secrets_dir));
    let reader = GitArtifactReader::new(secrets).submodule_depth(config.submodule_depth);

    let content = reader.read(spec)?;

    match output {
        Some(path) => {
            std::fs::write(path, &content)?;
            info!("Wrote {} bytes to {}", content.len(), path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&content)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

impl From<ArtifactArgs> for ArtifactSpec {
    fn from(args: ArtifactArgs) -> Self {
        let credentials = match (args.username_secret, args.password_secret, args.ssh_key_path) {
            (Some(username), Some(password), _) => Credentials::BasicAuth { username, password },
            (_, _, Some(path)) => Credentials::SshKey { path },
            _ => Credentials::None,
        };
        ArtifactSpec {
            url: args.url,
            clone_directory: args.clone_directory,
            branch: args.branch.filter(|b| !b.is_empty()),
            tag: args.tag.filter(|t| !t.is_empty()),
            file_path: args.file_path,
            namespace: args.namespace,
            credentials,
        }
    }
}
