//! CLI for the `corral` micro-VM manager.

#![allow(clippy::print_stdout, clippy::print_stderr, clippy::missing_docs_in_private_items)]

mod commands;
mod credentials;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use corral::HomeDir;

#[derive(Parser)]
#[command(name = "corral", version, about = "Manages Cloud Hypervisor micro-VMs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a VM.
    Create(commands::create::CreateArgs),

    /// Clone a VM.
    Clone(commands::clone::CloneArgs),

    /// Delete one or more VMs.
    Delete(commands::delete::DeleteArgs),

    /// List VMs.
    #[command(visible_alias = "ls")]
    List(commands::list::ListArgs),

    /// Modify a VM's configuration.
    Set(commands::set::SetArgs),

    /// Run a VM.
    Run(commands::run::RunArgs),

    /// Stop a running VM.
    Stop(commands::stop::StopArgs),

    /// Print a VM's IP address.
    Ip(commands::ip::IpArgs),

    /// Pull a VM from an OCI-compatible registry.
    Pull(commands::pull::PullArgs),

    /// Push a VM to an OCI-compatible registry.
    Push(commands::push::PushArgs),

    /// Log in to a registry.
    Login(commands::login::LoginArgs),

    /// Log out of a registry.
    Logout(commands::logout::LogoutArgs),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("corral: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Completion { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "corral", &mut std::io::stdout());
        return Ok(());
    }

    let home = HomeDir::resolve()?;
    home.ensure_layout()?;
    if let Err(error) = corral::storage::temporary::gc(&home) {
        tracing::warn!(%error, "scratch-directory garbage collection failed");
    }

    match cli.command {
        Command::Create(args) => commands::create::run(&home, args),
        Command::Clone(args) => commands::clone::run(&home, args).await,
        Command::Delete(args) => commands::delete::run(&home, args),
        Command::List(args) => commands::list::run(&home, args),
        Command::Set(args) => commands::set::run(&home, args),
        Command::Run(args) => commands::run::run(&home, args).await,
        Command::Stop(args) => commands::stop::run(&home, args),
        Command::Ip(args) => commands::ip::run(&home, args).await,
        Command::Pull(args) => commands::pull::run(&home, args).await,
        Command::Push(args) => commands::push::run(&home, args),
        Command::Login(args) => commands::login::run(args),
        Command::Logout(args) => commands::logout::run(args),
        Command::Completion { .. } => unreachable!("handled above"),
    }
}

/// Formats bytes into a human-readable size string.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TiB")
}
