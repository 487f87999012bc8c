//! `corral pull` — fetch a VM from an OCI-compatible registry into the
//! local content-addressed cache.

use anyhow::{Context, Result};
use corral::{HomeDir, Name};

/// Arguments for `corral pull`.
#[derive(clap::Args)]
pub struct PullArgs {
    /// Registry reference to pull, e.g. `registry.example.com/ns/name:tag`.
    reference: String,

    /// How many disk-layer fetches may run concurrently.
    #[arg(long, default_value_t = 4)]
    concurrency: u8,

    /// Connect to the registry via insecure HTTP.
    #[arg(long)]
    insecure: bool,
}

pub async fn run(home: &HomeDir, args: PullArgs) -> Result<()> {
    let name = match corral::name::parse(&args.reference)? {
        Name::Remote(name) => name,
        Name::Local(name) => anyhow::bail!("{name} is not a registry reference"),
    };

    let credentials = crate::credentials::load(&name.registry)?;
    let client = corral_oci::RegistryClient::new(&name.registry, &name.namespace, args.insecure, credentials);

    let vm = corral_oci::pull(&client, home, &name, args.concurrency as usize)
        .await
        .with_context(|| format!("failed to pull {name}"))?;
    println!("{}", vm.path().display());
    Ok(())
}
