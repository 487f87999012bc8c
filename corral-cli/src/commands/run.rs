//! `corral run` — launch a VM's hypervisor process.
//!
//! The only command that holds three locks at once: the global lock
//! (briefly, twice — once to open the VM, once to stand up networking),
//! an exclusive [`FileLock`] on the VM for the whole execution, and a
//! [`PidLock`] on `config.json` released only when the hypervisor exits.

use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use corral::binarycache::BinaryCache;
use corral::lock::{FileLock, LockKind};
use corral::net::Backend;
use corral::vmconfig::{host_arch, VmConfig};
use corral::{HomeDir, LocalName, VmDirectory};
use tokio::process::Command;

/// Arguments for `corral run`.
#[derive(clap::Args)]
pub struct RunArgs {
    /// Name of the VM to run.
    name: String,

    /// Assign the TAP interface a host-routable address instead of
    /// running the software gateway stack.
    #[arg(long)]
    net_host: bool,

    /// Enslave the TAP interface to an existing bridge instead of
    /// running the software gateway stack.
    #[arg(long, conflicts_with = "net_host")]
    net_bridge: Option<String>,

    /// Extra `--device` arguments passed straight through to the
    /// hypervisor (e.g. PCI passthrough), repeatable.
    #[arg(long = "device")]
    devices: Vec<String>,
}

const DEFAULT_HYPERVISOR: &str = "cloud-hypervisor";
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(home: &HomeDir, args: RunArgs) -> Result<()> {
    let name = LocalName::parse(&args.name)?;

    // Steps 1-2: global-lock critical section, released as soon as the
    // exclusive per-VM lock and config are in hand.
    let (vm, vm_lock, config) = corral::lock::with_global_lock(home, || -> corral::Result<_> {
        let vm = corral::storage::local::open(home, &name)?;
        let lock = vm.lock_for_run()?;
        let config = vm.config()?;
        Ok((vm, lock, config))
    })?;

    // Step 3: PIDLock on config.json, exclusive, non-blocking.
    let pid_lock = vm.pid_lock()?;
    pid_lock.try_lock()?;

    let result = run_locked(home, &vm, &config, &args).await;

    let _ = pid_lock.unlock();
    drop(vm_lock);
    result
}

async fn run_locked(home: &HomeDir, vm: &VmDirectory, config: &VmConfig, args: &RunArgs) -> Result<()> {
    // Step 4: arch check.
    if config.arch != host_arch() {
        anyhow::bail!("VM architecture {} does not match host architecture {}", config.arch, host_arch());
    }

    let bridged = args.net_bridge.is_some();
    let backend = if let Some(bridge_name) = &args.net_bridge {
        Backend::Bridged { bridge_name: bridge_name.clone() }
    } else if args.net_host {
        Backend::HostOnly
    } else {
        Backend::Software
    };

    // Step 5: under the global lock, stand up the network backend. The
    // interface snapshot is taken before the lock so it reflects the host
    // as it was just before this VM's TAP appears.
    let claimed = corral::net::claimed_host_addresses().await?;
    let network = {
        let global_lock = FileLock::open(home.path())?;
        global_lock.lock(LockKind::Exclusive, &|| false)?;
        let setup = corral::net::setup(backend, config.mac_address.0, &claimed).await;
        let _ = global_lock.unlock();
        setup?
    };

    let hypervisor = resolve_hypervisor(home);

    // Step 6: assemble hypervisor arguments.
    let mut command = Command::new(&hypervisor);
    command.arg("--kernel").arg(vm.kernel_path());
    if vm.initramfs_path().exists() {
        command.arg("--initramfs").arg(vm.initramfs_path());
    }
    command.arg("--cmdline").arg(&config.cmdline);
    for disk in &config.disks {
        command.arg("--disk").arg(format!("path={}", vm.disk_path(&disk.name).display()));
    }
    command.arg("--cpus").arg(format!("boot={}", config.cpu_count));
    command.arg("--memory").arg(format!("size={}", config.memory_size));

    let mut net_arg = format!("fd=3,mac={}", config.mac_address);
    if bridged {
        net_arg.push_str(",offload_tso=off,offload_ustso=off");
    }
    command.arg("--net").arg(net_arg);

    for device in &args.devices {
        command.arg("--device").arg(device);
    }
    if !args.devices.is_empty() && config.arch == "amd64" {
        command.arg("--platform").arg("iommu_address_width=39");
    }

    // Step 7: launch with the TAP file dup'd onto FD 3, stdio inherited.
    let tap_file = network.tap_fd()?;
    command.stdin(Stdio::inherit()).stdout(Stdio::inherit()).stderr(Stdio::inherit());
    // SAFETY: only `dup2`/a fd close run between fork and exec, both
    // async-signal-safe; nothing else touches process state in the child.
    unsafe {
        command.pre_exec(move || {
            let src = tap_file.as_raw_fd();
            if libc::dup2(src, 3) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if src != 3 {
                libc::close(src);
            }
            Ok(())
        });
    }

    let mut child = command.spawn().context("failed to launch hypervisor")?;
    let pid = child.id();
    tracing::info!(?pid, tap = network.tap_name(), path = %hypervisor.display(), "hypervisor launched");

    // `child` stays borrowed by `wait` for the rest of this function: any
    // further control over the process goes through signals sent to `pid`,
    // not through `child`'s own kill methods.
    let mut wait = Box::pin(child.wait());
    tokio::select! {
        result = &mut wait => {
            network.close().await;
            let status = result.context("failed to wait for hypervisor")?;
            if status.success() {
                Ok(())
            } else {
                Err(anyhow::anyhow!("hypervisor exited with {status}"))
            }
        }
        () = wait_for_cancel() => {
            send_signal(pid, nix::sys::signal::Signal::SIGTERM);
            if tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, &mut wait).await.is_err() {
                send_signal(pid, nix::sys::signal::Signal::SIGKILL);
                let _ = wait.await;
            }
            network.close().await;
            Ok(())
        }
    }
}

fn send_signal(pid: Option<u32>, signal: nix::sys::signal::Signal) {
    if let Some(pid) = pid {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal);
    }
}

/// `CORRAL_HYPERVISOR` overrides the binary entirely (path or bare name
/// resolved on `$PATH`); otherwise prefer a cached copy, falling back to a
/// bare name for the system to resolve.
fn resolve_hypervisor(home: &HomeDir) -> std::path::PathBuf {
    if let Ok(path) = std::env::var("CORRAL_HYPERVISOR") {
        return std::path::PathBuf::from(path);
    }
    BinaryCache::new(home).resolve(DEFAULT_HYPERVISOR).unwrap_or_else(|| std::path::PathBuf::from(DEFAULT_HYPERVISOR))
}

async fn wait_for_cancel() {
    let _ = tokio::signal::ctrl_c().await;
}
