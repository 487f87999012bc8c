//! `corral push` — upload a local VM to an OCI-compatible registry.

use anyhow::{Context, Result};
use corral::lock::LockKind;
use corral::{HomeDir, LocalName, Name};

/// Arguments for `corral push`.
#[derive(clap::Args)]
pub struct PushArgs {
    /// Local VM to push.
    local: String,

    /// Destination registry reference. Must carry a tag.
    remote: String,

    /// Also store the pushed content in the local OCI cache, as if it had
    /// just been pulled.
    #[arg(long)]
    populate_cache: bool,

    /// Connect to the registry via insecure HTTP.
    #[arg(long)]
    insecure: bool,
}

pub fn run(home: &HomeDir, args: PushArgs) -> Result<()> {
    let local_name = LocalName::parse(&args.local)?;
    let remote_name = match corral::name::parse(&args.remote)? {
        Name::Remote(name) => name,
        Name::Local(name) => anyhow::bail!("{name} is not a registry reference"),
    };
    let tag = remote_name.tag.clone().context("push destination must carry a tag")?;

    let (vm, lock) = corral::lock::with_global_lock(home, || -> corral::Result<_> {
        let vm = corral::storage::local::open(home, &local_name)?;
        let lock = vm.file_lock()?;
        lock.try_lock(LockKind::Shared)?;
        Ok((vm, lock))
    })?;

    let credentials = crate::credentials::load(&remote_name.registry)?;
    let client =
        corral_oci::RegistryClient::new(&remote_name.registry, &remote_name.namespace, args.insecure, credentials);
    let digest = corral_oci::push(&client, &vm, &tag).with_context(|| format!("failed to push {}", args.local))?;

    if args.populate_cache {
        let scratch = corral::storage::temporary::create_from(home, vm.path())?;
        corral::storage::remote::move_in(home, &remote_name, &digest, scratch)?;
    }

    drop(lock);
    println!("{digest}");
    Ok(())
}
