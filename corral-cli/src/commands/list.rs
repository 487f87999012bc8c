//! `corral list` — enumerate local and/or cached remote VMs.

use anyhow::Result;
use corral::vmdirectory::State;
use corral::HomeDir;

/// Arguments for `corral list`.
#[derive(clap::Args)]
pub struct ListArgs {
    /// Only display VMs from the given source (`local` or `oci`).
    #[arg(long)]
    source: Option<String>,

    /// Only print VM names.
    #[arg(short = 'q', long)]
    quiet: bool,
}

struct Row {
    source: &'static str,
    name: String,
    size: u64,
    state: State,
}

pub fn run(home: &HomeDir, args: ListArgs) -> Result<()> {
    let (want_local, want_oci) = match args.source.as_deref() {
        None => (true, true),
        Some("local") => (true, false),
        Some("oci") => (false, true),
        Some(other) => anyhow::bail!("cannot display VMs from an unsupported source {other:?}"),
    };

    let mut rows = Vec::new();

    corral::lock::with_global_lock(home, || -> corral::Result<()> {
        if want_local {
            for name in corral::storage::local::list(home)? {
                let vm = corral::storage::local::open(home, &corral::LocalName::parse(&name)?)?;
                rows.push(Row { source: "local", name, size: vm.size()?, state: vm.state()? });
            }
        }
        if want_oci {
            for (name, vm) in corral::storage::remote::list(home)? {
                rows.push(Row { source: "oci", name, size: vm.size()?, state: vm.state()? });
            }
        }
        Ok(())
    })?;

    if args.quiet {
        for row in &rows {
            println!("{}", row.name);
        }
        return Ok(());
    }

    println!("{:<8} {:<50} {:>12}  {}", "SOURCE", "NAME", "SIZE", "STATE");
    for row in &rows {
        let state = match row.state {
            State::Running => "running",
            State::Stopped => "stopped",
        };
        println!("{:<8} {:<50} {:>12}  {state}", row.source, row.name, crate::human_size(row.size));
    }
    Ok(())
}
