//! `corral ip` — print a VM's IP address via the host ARP/neighbor table.

use std::time::Duration;

use anyhow::Result;
use corral::{Error, HomeDir, LocalName};

/// Arguments for `corral ip`.
#[derive(clap::Args)]
pub struct IpArgs {
    /// Name of the VM to query.
    name: String,

    /// Seconds to poll before giving up (the VM's DHCP lease may not have
    /// landed yet right after `run` starts).
    #[arg(long, default_value_t = 0)]
    wait: u64,
}

pub async fn run(home: &HomeDir, args: IpArgs) -> Result<()> {
    let name = LocalName::parse(&args.name)?;
    let vm = corral::lock::with_global_lock(home, || corral::storage::local::open(home, &name))?;
    let config = vm.config()?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.wait);
    loop {
        if let Some(addr) = corral::net::ip_for_mac(config.mac_address.0).await? {
            println!("{addr}");
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::NotFound(format!("no IP address found for VM {name}")).into());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
