use clap::Parser;

use git_artifact::{
    cli::{
        args::{CliArgs, Command},
        command_handlers::do_read,
    },
    ArtifactSpec,
};

fn run() -> anyhow::Result<()> {
    let cli_args: CliArgs = CliArgs::parse();

    match cli_args.cmd {
        Command::Read { artifact, output } => {
            let spec = ArtifactSpec::from(artifact);
            do_read(&spec, cli_args.secrets_dir, output.as_deref())
        }
        Command::ReadSpec { path, output } => {
            let spec = ArtifactSpec::from_file(&path)?;
            do_read(&spec, cli_args.secrets_dir, output.as_deref())
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}
