//! `corral set` — modify a published VM's configuration.

use anyhow::Result;
use corral::lock::LockKind;
use corral::{HomeDir, LocalName};

/// Arguments for `corral set`.
#[derive(clap::Args)]
pub struct SetArgs {
    /// Name of the VM to modify.
    name: String,

    /// New virtual CPU count.
    #[arg(long)]
    cpu: Option<u8>,

    /// New memory size in MiB.
    #[arg(long)]
    memory: Option<u32>,

    /// Grow the VM's (single) disk to this size in GiB. Shrinking is
    /// rejected.
    #[arg(long)]
    disk_size: Option<u64>,
}

pub fn run(home: &HomeDir, args: SetArgs) -> Result<()> {
    let name = LocalName::parse(&args.name)?;

    corral::lock::with_global_lock(home, || -> corral::Result<()> {
        let vm = corral::storage::local::open(home, &name)?;
        let lock = vm.file_lock()?;
        lock.try_lock(LockKind::Exclusive)?;

        let mut config = vm.config()?;
        if let Some(cpu) = args.cpu {
            config.cpu_count = cpu;
        }
        if let Some(memory) = args.memory {
            config.memory_size = u64::from(memory) * 1024 * 1024;
        }
        vm.set_config(&config)?;

        if let Some(gib) = args.disk_size {
            let disk = config
                .disks
                .first()
                .ok_or_else(|| corral::Error::Parse("VM has no disks to resize".into()))?;
            let target = gib * 1024 * 1024 * 1024;

            let disk_path = vm.disk_path(&disk.name);
            let current = std::fs::metadata(&disk_path)?.len();
            if target < current {
                return Err(corral::Error::Parse(format!(
                    "cannot shrink disk {:?} from {current} to {target} bytes",
                    disk.name
                )));
            }
            std::fs::OpenOptions::new().write(true).open(&disk_path)?.set_len(target)?;
        }

        Ok(())
    })?;

    Ok(())
}
