//! Published local VM directories under `<HOME>/vms/<name>`.

use std::path::PathBuf;

use crate::name::LocalName;
use crate::storage::temporary::Scratch;
use crate::{Error, HomeDir, Result, VmDirectory};

/// The path a local VM named `name` would live at, whether or not it
/// currently exists.
#[must_use]
pub fn path(home: &HomeDir, name: &LocalName) -> PathBuf {
    home.vms_dir().join(name.as_str())
}

/// Opens an existing published local VM by name.
pub fn open(home: &HomeDir, name: &LocalName) -> Result<VmDirectory> {
    let path = path(home, name);
    if !path.is_dir() {
        return Err(Error::NotFound(format!("VM {name} does not exist")));
    }
    Ok(VmDirectory::open(path))
}

/// Publishes a scratch directory as `name`, failing if the destination
/// already exists rather than silently replacing it.
///
/// Takes `scratch` by value and holds its exclusive lock for the
/// duration of the rename, so `storage::temporary::gc` can never observe
/// (and race-delete) the directory mid-publish.
pub fn publish(home: &HomeDir, name: &LocalName, scratch: Scratch) -> Result<VmDirectory> {
    let dest = path(home, name);
    if dest.exists() {
        return Err(Error::AlreadyExists(format!("VM {name} already exists")));
    }
    std::fs::rename(scratch.path(), &dest)?;
    Ok(VmDirectory::open(dest))
}

/// Removes a published local VM directory entirely. Callers must hold an
/// exclusive [`crate::lock::FileLock`] on it first.
pub fn delete(home: &HomeDir, name: &LocalName) -> Result<()> {
    let dest = path(home, name);
    if !dest.exists() {
        return Err(Error::NotFound(format!("VM {name} does not exist")));
    }
    std::fs::remove_dir_all(dest)?;
    Ok(())
}

/// Lists every published local VM name, sorted for stable CLI output.
pub fn list(home: &HomeDir) -> Result<Vec<String>> {
    let vms_dir = home.vms_dir();
    let entries = match std::fs::read_dir(&vms_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io(e)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::LocalName;

    #[test]
    fn publish_then_open_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = HomeDir::at(dir.path());
        home.ensure_layout().expect("layout");

        let name = LocalName::parse("vm1").expect("parse");
        let scratch = crate::storage::temporary::create(&home, 1, 512).expect("create");
        publish(&home, &name, scratch).expect("publish");

        let vm = open(&home, &name).expect("open");
        assert_eq!(vm.config().expect("config").cpu_count, 1);
        assert_eq!(list(&home).expect("list"), vec!["vm1".to_owned()]);
    }

    #[test]
    fn publish_fails_on_existing_destination() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = HomeDir::at(dir.path());
        home.ensure_layout().expect("layout");

        let name = LocalName::parse("vm1").expect("parse");
        let first = crate::storage::temporary::create(&home, 1, 512).expect("create");
        publish(&home, &name, first).expect("publish");

        let second = crate::storage::temporary::create(&home, 1, 512).expect("create");
        assert!(matches!(publish(&home, &name, second), Err(Error::AlreadyExists(_))));
    }
}
