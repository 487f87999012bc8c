//! `corral login` — store registry credentials for later `push`/`pull`.

use std::io::Write;

use anyhow::{Context, Result};

/// Arguments for `corral login`.
#[derive(clap::Args)]
pub struct LoginArgs {
    /// Registry host, e.g. `registry.example.com` or `localhost:5000`.
    registry: String,

    /// Username to authenticate as.
    #[arg(short = 'u', long)]
    username: String,

    /// Read the password from stdin instead of prompting interactively.
    #[arg(long)]
    password_stdin: bool,
}

pub fn run(args: LoginArgs) -> Result<()> {
    let password = if args.password_stdin {
        let mut buf = String::new();
        std::io::stdin().read_line(&mut buf).context("failed to read password from stdin")?;
        buf.trim_end_matches(['\n', '\r']).to_owned()
    } else {
        eprint!("Password: ");
        std::io::stderr().flush().ok();
        let mut buf = String::new();
        std::io::stdin().read_line(&mut buf).context("failed to read password")?;
        buf.trim_end_matches(['\n', '\r']).to_owned()
    };

    crate::credentials::store(&args.registry, &args.username, &password)?;
    println!("Login succeeded for {}", args.registry);
    Ok(())
}
