use clap::Parser;
use qvm::error::exit_code;
use qvm::profile::HostInfo;
use qvm::types::Arch;
use qvm::{cli, commands, paths};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // clap exits with status 2 on usage errors
    let cli = cli::Cli::parse();

    // Must be set before any path is resolved
    paths::init_base_dir(cli.data_dir.as_deref());

    let level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    // Only use colors when logging to a TTY
    let use_color = atty::is(atty::Stream::Stderr);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(true)
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .init();

    let host = HostInfo::detect();
    let default_arch = host.arch.unwrap_or(Arch::X86_64);
    let cwd = std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from("."));

    let result = match cli.into_request(default_arch, &cwd) {
        Ok(request) => commands::cmd_run(request, host).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Error: {:#}", e);
            std::process::exit(exit_code(&e));
        }
    }
}
