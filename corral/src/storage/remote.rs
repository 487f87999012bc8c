//! Content-addressed OCI cache: `<HOME>/cache/OCIs/<registry>/<ns...>/`
//! holding `sha256:<hex>` digest directories and `<tag>` symlinks that
//! point at a sibling digest directory.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::name::RemoteName;
use crate::storage::temporary::Scratch;
use crate::{Error, HomeDir, Result, VmDirectory};

/// `<HOME>/cache/OCIs/<registry>/<ns...>` — the parent of every digest
/// directory and tag symlink for one repository.
fn namespace_dir(home: &HomeDir, name: &RemoteName) -> PathBuf {
    let mut path = home.ocis_dir().join(&name.registry);
    for segment in name.namespace.split('/') {
        path = path.join(segment);
    }
    path
}

fn digest_dir(home: &HomeDir, name: &RemoteName, digest: &str) -> PathBuf {
    namespace_dir(home, name).join(digest)
}

/// The tag symlink path for `name`, if it carries a tag.
fn tag_path(home: &HomeDir, name: &RemoteName) -> Option<PathBuf> {
    name.tag.as_deref().map(|tag| namespace_dir(home, name).join(tag))
}

/// Opens a cached remote VM, preferring a digest path when `name` is
/// digest-qualified and otherwise following its tag symlink.
pub fn open(home: &HomeDir, name: &RemoteName) -> Result<VmDirectory> {
    let path = if let Some(digest) = &name.digest {
        digest_dir(home, name, digest)
    } else {
        tag_path(home, name).ok_or_else(|| Error::Parse(format!("{name} has neither tag nor digest")))?
    };
    if !path.exists() {
        return Err(Error::NotFound(format!("{name} is not cached locally")));
    }
    Ok(VmDirectory::open(path))
}

/// `true` iff the fully-qualified digest name is already cached — the
/// OCI pull fast path that skips re-fetching blobs entirely.
#[must_use]
pub fn digest_is_cached(home: &HomeDir, name: &RemoteName, digest: &str) -> bool {
    digest_dir(home, name, digest).is_dir()
}

/// Moves a scratch directory into its final digest-addressed slot and,
/// if `name` carries a tag, points `<tag>` at it. Fails if the digest
/// directory already exists.
///
/// Takes `scratch` by value and holds its exclusive lock for the
/// duration of the rename, so `storage::temporary::gc` can never observe
/// (and race-delete) the directory mid-pull.
pub fn move_in(home: &HomeDir, name: &RemoteName, digest: &str, scratch: Scratch) -> Result<VmDirectory> {
    let ns_dir = namespace_dir(home, name);
    fs::create_dir_all(&ns_dir)?;

    let dest = ns_dir.join(digest);
    if dest.exists() {
        return Err(Error::AlreadyExists(format!("{digest} is already cached")));
    }
    fs::rename(scratch.path(), &dest)?;

    if let Some(tag) = tag_path(home, name) {
        replace_symlink(&tag, Path::new(digest))?;
    }

    Ok(VmDirectory::open(dest))
}

/// Points `tagged`'s tag at `digested`'s digest directory, replacing any
/// existing symlink at that path.
pub fn link(home: &HomeDir, digested: &RemoteName, tagged: &RemoteName) -> Result<()> {
    let digest = digested
        .digest
        .as_deref()
        .ok_or_else(|| Error::Parse("link source must be digest-qualified".into()))?;
    let tag_path =
        tag_path(home, tagged).ok_or_else(|| Error::Parse("link destination must be tag-qualified".into()))?;
    replace_symlink(&tag_path, Path::new(digest))
}

fn replace_symlink(link_path: &Path, target: &Path) -> Result<()> {
    match fs::symlink_metadata(link_path) {
        Ok(_) => fs::remove_file(link_path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::Io(e)),
    }
    std::os::unix::fs::symlink(target, link_path)?;
    Ok(())
}

/// Deletes a cached remote name — a tag reference unlinks only the
/// symlink, a digest reference removes the digest directory itself —
/// then runs [`gc`] to reclaim anything newly unreferenced.
pub fn delete(home: &HomeDir, name: &RemoteName) -> Result<()> {
    if let Some(digest) = &name.digest {
        let dir = digest_dir(home, name, digest);
        if !dir.exists() {
            return Err(Error::NotFound(format!("{name} is not cached")));
        }
        fs::remove_dir_all(&dir)?;
    } else {
        let tag = tag_path(home, name).ok_or_else(|| Error::Parse(format!("{name} has no tag")))?;
        match fs::remove_file(&tag) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("{name} is not cached")));
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
    gc(home)
}

/// Lists every tagged remote VM in the cache, as `(display name,
/// directory)` pairs, sorted by display name for stable CLI output.
pub fn list(home: &HomeDir) -> Result<Vec<(String, VmDirectory)>> {
    let root = home.ocis_dir();
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut digest_dirs = Vec::new();
    let mut symlinks = Vec::new();
    collect(&root, &mut digest_dirs, &mut symlinks)?;

    let mut out = Vec::new();
    for link in symlinks {
        let Some(parent) = link.parent() else { continue };
        let Ok(target) = fs::read_link(&link) else { continue };
        let resolved = parent.join(&target);
        if !resolved.is_dir() {
            continue;
        }

        let Some(registry_relative) = parent.strip_prefix(&root).ok() else { continue };
        let tag = link.file_name().map_or_else(String::new, |n| n.to_string_lossy().into_owned());
        let display = format!("{}:{tag}", registry_relative.display());
        out.push((display, VmDirectory::open(resolved)));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Walks the entire cache tree, removing every tag symlink whose target
/// is missing and every digest directory with zero incoming symlinks,
/// unless it carries the `.explicitly-pulled` sentinel.
pub fn gc(home: &HomeDir) -> Result<()> {
    let root = home.ocis_dir();
    if !root.is_dir() {
        return Ok(());
    }

    let mut digest_dirs = Vec::new();
    let mut symlinks = Vec::new();
    collect(&root, &mut digest_dirs, &mut symlinks)?;

    let mut referenced: HashSet<PathBuf> = HashSet::new();
    for link in &symlinks {
        let Some(parent) = link.parent() else { continue };
        match fs::read_link(link) {
            Ok(target) => {
                let resolved = parent.join(&target);
                if resolved.is_dir() {
                    referenced.insert(resolved);
                } else {
                    let _ = fs::remove_file(link);
                }
            }
            Err(_) => {
                let _ = fs::remove_file(link);
            }
        }
    }

    for dir in &digest_dirs {
        if referenced.contains(dir) {
            continue;
        }
        if dir.join(".explicitly-pulled").exists() {
            continue;
        }
        fs::remove_dir_all(dir)?;
    }

    Ok(())
}

/// Recursively collects every `sha256:<hex>`-named directory and every
/// symlink under `dir`.
fn collect(dir: &Path, digest_dirs: &mut Vec<PathBuf>, symlinks: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            symlinks.push(path);
        } else if file_type.is_dir() {
            if entry.file_name().to_string_lossy().starts_with("sha256:") {
                digest_dirs.push(path);
            } else {
                collect(&path, digest_dirs, symlinks)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::{self, Name};
    use crate::vmconfig::VmConfig;

    fn remote(s: &str) -> RemoteName {
        match name::parse(s).expect("parse") {
            Name::Remote(r) => r,
            Name::Local(_) => panic!("expected remote name"),
        }
    }

    fn scratch(home: &HomeDir) -> Scratch {
        crate::storage::temporary::create(home, 1, 512).expect("create scratch")
    }

    #[test]
    fn move_in_creates_digest_dir_and_tag_symlink() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = HomeDir::at(dir.path());
        home.ensure_layout().expect("layout");

        let name = remote("example.com/ns/vm:v1");
        let digest = format!("sha256:{}", "a".repeat(64));
        move_in(&home, &name, &digest, scratch(&home)).expect("move_in");

        let vm = open(&home, &name).expect("open by tag");
        assert_eq!(vm.config().expect("config"), VmConfig::new(1, 512));

        let digest_name = name.with_resolved_digest(&digest);
        let by_digest = open(&home, &digest_name).expect("open by digest");
        assert_eq!(by_digest.path(), vm.path());
    }

    #[test]
    fn gc_keeps_digest_dir_referenced_by_a_tag() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = HomeDir::at(dir.path());
        home.ensure_layout().expect("layout");

        let name = remote("example.com/ns/vm:v1");
        let digest = format!("sha256:{}", "b".repeat(64));
        move_in(&home, &name, &digest, scratch(&home)).expect("move_in");

        gc(&home).expect("gc");
        assert!(open(&home, &name).is_ok());
    }

    #[test]
    fn gc_removes_unreferenced_digest_dir_after_tag_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = HomeDir::at(dir.path());
        home.ensure_layout().expect("layout");

        let name = remote("example.com/ns/vm:v1");
        let digest = format!("sha256:{}", "c".repeat(64));
        move_in(&home, &name, &digest, scratch(&home)).expect("move_in");

        delete(&home, &name).expect("delete tag");
        let digest_name = name.with_resolved_digest(&digest);
        assert!(open(&home, &digest_name).is_err());
    }

    #[test]
    fn gc_preserves_explicitly_pulled_digest_with_no_tags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = HomeDir::at(dir.path());
        home.ensure_layout().expect("layout");

        let name = remote(&format!("example.com/ns/vm@sha256:{}", "d".repeat(64)));
        let digest = name.digest.clone().expect("digest");
        let vm = move_in(&home, &name, &digest, scratch(&home)).expect("move_in");
        vm.set_explicitly_pulled(true).expect("mark pinned");

        gc(&home).expect("gc");
        assert!(open(&home, &name).is_ok());
    }

    #[test]
    fn shared_tags_keep_digest_dir_until_both_are_deleted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let home = HomeDir::at(dir.path());
        home.ensure_layout().expect("layout");

        let digest = format!("sha256:{}", "e".repeat(64));
        let v1 = remote("example.com/ns/vm:v1");
        let v2 = remote("example.com/ns/vm:v2");

        move_in(&home, &v1, &digest, scratch(&home)).expect("move_in v1");
        link(&home, &v1.with_resolved_digest(&digest), &v2).expect("link v2");

        delete(&home, &v1).expect("delete v1");
        let digest_name = v1.with_resolved_digest(&digest);
        assert!(open(&home, &digest_name).is_ok(), "digest dir survives while v2 references it");

        delete(&home, &v2).expect("delete v2");
        assert!(open(&home, &digest_name).is_err(), "digest dir is gone once unreferenced");
    }
}
