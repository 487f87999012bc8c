//! `corral stop` — signal a running VM's hypervisor to terminate.

use std::time::{Duration, Instant};

use anyhow::Result;
use corral::lock::PidLock;
use corral::{HomeDir, LocalName};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// Arguments for `corral stop`.
#[derive(clap::Args)]
pub struct StopArgs {
    /// Name of the VM to stop.
    name: String,

    /// Seconds to wait for a graceful shutdown before `SIGKILL`.
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

pub fn run(home: &HomeDir, args: StopArgs) -> Result<()> {
    let name = LocalName::parse(&args.name)?;
    let vm = corral::lock::with_global_lock(home, || corral::storage::local::open(home, &name))?;

    let pid = PidLock::pid(vm.config_path())?;
    if pid == 0 {
        anyhow::bail!("VM {name} is not running");
    }
    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT);

    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    loop {
        let current = PidLock::pid(vm.config_path())?;
        if current == 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            let _ = signal::kill(Pid::from_raw(current as i32), Signal::SIGKILL);
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
