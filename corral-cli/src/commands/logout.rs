//! `corral logout` — forget stored registry credentials.

use anyhow::Result;

/// Arguments for `corral logout`.
#[derive(clap::Args)]
pub struct LogoutArgs {
    /// Registry host to forget credentials for.
    registry: String,
}

pub fn run(args: LogoutArgs) -> Result<()> {
    crate::credentials::remove(&args.registry)?;
    println!("Removed login credentials for {}", args.registry);
    Ok(())
}
