//! `corral create` — allocate a new VM.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use corral::vmconfig::Disk;
use corral::{HomeDir, LocalName};

/// Arguments for `corral create`.
#[derive(clap::Args)]
pub struct CreateArgs {
    /// Name to publish the new VM under.
    name: String,

    /// Path to a kernel file to copy into the VM's directory.
    #[arg(long)]
    kernel: Option<String>,

    /// Path to an initramfs file to copy into the VM's directory.
    #[arg(long)]
    initramfs: Option<String>,

    /// Kernel command-line parameters.
    #[arg(long, default_value = "")]
    cmdline: String,

    /// Path to a disk file to copy in (repeatable).
    #[arg(long = "disk")]
    disks: Vec<String>,

    /// Number of virtual CPUs.
    #[arg(long, default_value_t = 2)]
    cpu: u8,

    /// Memory in MiB.
    #[arg(long, default_value_t = 4096)]
    memory: u32,
}

pub fn run(home: &HomeDir, args: CreateArgs) -> Result<()> {
    let name = LocalName::parse(&args.name)?;
    if corral::storage::local::path(home, &name).exists() {
        anyhow::bail!("VM {name} already exists");
    }

    let Some(kernel) = args.kernel else {
        anyhow::bail!("please specify a kernel using --kernel, otherwise the VM will not be bootable");
    };

    let scratch = corral::storage::temporary::create(home, args.cpu, u64::from(args.memory) * 1024 * 1024)?;

    copy_file(Path::new(&kernel), &scratch.kernel_path()).context("failed to copy kernel into the VM's directory")?;

    if let Some(initramfs) = &args.initramfs {
        copy_file(Path::new(initramfs), &scratch.initramfs_path())
            .context("failed to copy initramfs into the VM's directory")?;
    }

    let mut config = scratch.config()?;
    config.cmdline = args.cmdline;
    config.cpu_count = args.cpu;
    config.memory_size = u64::from(args.memory) * 1024 * 1024;

    for disk in &args.disks {
        let disk_path = Path::new(disk);
        let disk_name =
            disk_path.file_name().ok_or_else(|| anyhow::anyhow!("{disk:?} has no file name"))?.to_string_lossy();
        copy_file(disk_path, &scratch.disk_path(&disk_name))
            .with_context(|| format!("failed to copy disk {disk_name:?} into the VM's directory"))?;
        config.disks.push(Disk { name: disk_name.into_owned() });
    }

    scratch.set_config(&config)?;

    let published = corral::lock::with_global_lock(home, || corral::storage::local::publish(home, &name, scratch))?;
    println!("{}", published.path().display());
    Ok(())
}

/// Copies `src` to `dst`, preferring a `FICLONE` reflink and falling back
/// to a sparse-preserving block copy.
fn copy_file(src: &Path, dst: &Path) -> corral::Result<()> {
    let src_file = File::open(src)?;
    let src_len = src_file.metadata()?.len();

    let dst_file = std::fs::OpenOptions::new().write(true).create(true).truncate(true).open(dst)?;
    dst_file.set_len(src_len)?;

    if corral::sparseio::clone_file(&dst_file, &src_file).is_err() {
        corral::sparseio::sparse_copy(&dst_file, &src_file)?;
    }
    Ok(())
}
