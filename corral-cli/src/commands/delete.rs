//! `corral delete` — remove one or more VMs.

use anyhow::Result;
use corral::lock::LockKind;
use corral::{HomeDir, Name};

/// Arguments for `corral delete`.
#[derive(clap::Args)]
pub struct DeleteArgs {
    /// Names (local or registry references) of the VMs to delete.
    #[arg(required = true, num_args = 1..)]
    names: Vec<String>,
}

pub fn run(home: &HomeDir, args: DeleteArgs) -> Result<()> {
    let mut names = Vec::with_capacity(args.names.len());
    for raw in &args.names {
        names.push(corral::name::parse(raw)?);
    }

    for name in &names {
        if let Err(error) = delete_one(home, name) {
            tracing::error!(%name, %error, "failed to delete VM");
        } else {
            println!("{name}");
        }
    }

    Ok(())
}

/// Deletes a single VM under its exclusive lock, acquired while the global
/// lock is briefly held and released again before the (potentially slow)
/// `rm -rf` runs.
fn delete_one(home: &HomeDir, name: &Name) -> corral::Result<()> {
    let (dir, lock) = corral::lock::with_global_lock(home, || -> corral::Result<_> {
        let dir = match name {
            Name::Local(local) => corral::storage::local::open(home, local)?,
            Name::Remote(remote) => corral::storage::remote::open(home, remote)?,
        };
        let lock = dir.file_lock()?;
        lock.try_lock(LockKind::Exclusive)?;
        Ok((dir, lock))
    })?;

    let result = match name {
        Name::Local(local) => corral::storage::local::delete(home, local),
        Name::Remote(remote) => corral::storage::remote::delete(home, remote),
    };
    drop(dir);
    drop(lock);
    result
}
