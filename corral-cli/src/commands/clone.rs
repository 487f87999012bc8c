//! `corral clone` — copy an existing VM (local or remote) under a new
//! local name.

use anyhow::Result;
use corral::lock::LockKind;
use corral::vmconfig::MacAddress;
use corral::{HomeDir, LocalName, Name};

/// Arguments for `corral clone`.
#[derive(clap::Args)]
pub struct CloneArgs {
    /// Source VM: a local name or a registry reference.
    source: String,

    /// Destination local name.
    destination: String,

    /// Network concurrency to use if the source must first be pulled.
    #[arg(long, default_value_t = 4)]
    concurrency: u8,

    /// Connect to the OCI registry via insecure HTTP.
    #[arg(long)]
    insecure: bool,
}

pub async fn run(home: &HomeDir, args: CloneArgs) -> Result<()> {
    let source = corral::name::parse(&args.source)?;
    let destination = LocalName::parse(&args.destination)?;

    if let Name::Remote(remote_name) = &source {
        if corral::storage::remote::open(home, remote_name).is_err() {
            let credentials = crate::credentials::load(&remote_name.registry)?;
            let client =
                corral_oci::RegistryClient::new(&remote_name.registry, &remote_name.namespace, args.insecure, credentials);
            corral_oci::pull(&client, home, remote_name, args.concurrency as usize).await?;
        }
    }

    let (source_dir, source_lock) = corral::lock::with_global_lock(home, || -> corral::Result<_> {
        let dir = match &source {
            Name::Local(name) => corral::storage::local::open(home, name)?,
            Name::Remote(name) => corral::storage::remote::open(home, name)?,
        };
        let lock = dir.file_lock()?;
        lock.try_lock(LockKind::Shared)?;
        Ok((dir, lock))
    })?;

    let scratch = corral::storage::temporary::create_from(home, source_dir.path())?;
    drop(source_lock);

    let mut config = scratch.config()?;
    config.mac_address = MacAddress::random();
    scratch.set_config(&config)?;

    let published =
        corral::lock::with_global_lock(home, || corral::storage::local::publish(home, &destination, scratch))?;
    println!("{}", published.path().display());
    Ok(())
}
