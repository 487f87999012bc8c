//! File-backed registry credential storage for `corral login`/`logout`,
//! consulted by `push`/`pull`/`clone` before talking to a registry.
//!
//! Mirrors the shape of a Docker/Podman `config.json` auth file: one JSON
//! document with an `auths` map keyed by registry host, each entry
//! carrying a base64 `user:pass` blob. Reading and writing this file is
//! the external collaborator contract the core's OCI pipeline never
//! touches directly — only the CLI does.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use corral::HomeDir;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
struct AuthFile {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AuthEntry {
    auth: String,
}

/// Resolves the credential file path: `CORRAL_REGISTRY_AUTH_FILE` if set,
/// else `<HOME>/auth.json`.
fn auth_path(home: &HomeDir) -> PathBuf {
    std::env::var("CORRAL_REGISTRY_AUTH_FILE").map(PathBuf::from).unwrap_or_else(|_| home.path().join("auth.json"))
}

fn read(home: &HomeDir) -> Result<AuthFile> {
    let path = auth_path(home);
    match std::fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes).context("failed to parse registry credential file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AuthFile::default()),
        Err(e) => Err(e).context("failed to read registry credential file"),
    }
}

fn write(home: &HomeDir, file: &AuthFile) -> Result<()> {
    let path = auth_path(home);
    let bytes = serde_json::to_vec_pretty(file)?;
    std::fs::write(&path, &bytes).context("failed to write registry credential file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .context("failed to restrict registry credential file permissions")?;
    }
    Ok(())
}

/// Looks up `(user, pass)` for `registry`, if a credential file exists and
/// carries an entry for it.
pub fn load(registry: &str) -> Result<Option<(String, String)>> {
    let home = HomeDir::resolve()?;
    let file = read(&home)?;
    let Some(entry) = file.auths.get(registry) else { return Ok(None) };

    let decoded = base64_decode(&entry.auth).context("stored credential is not valid base64")?;
    let text = String::from_utf8(decoded).context("stored credential is not valid UTF-8")?;
    let (user, pass) = text.split_once(':').context("stored credential is not in user:pass form")?;
    Ok(Some((user.to_owned(), pass.to_owned())))
}

/// Persists `(user, pass)` for `registry`, overwriting any existing entry.
pub fn store(registry: &str, user: &str, pass: &str) -> Result<()> {
    let home = HomeDir::resolve()?;
    let mut file = read(&home)?;
    let blob = format!("{user}:{pass}");
    file.auths.insert(registry.to_owned(), AuthEntry { auth: base64_encode(blob.as_bytes()) });
    write(&home, &file)
}

/// Removes any stored credentials for `registry`. A no-op if none exist.
pub fn remove(registry: &str) -> Result<()> {
    let home = HomeDir::resolve()?;
    let mut file = read(&home)?;
    file.auths.remove(registry);
    write(&home, &file)
}

const BASE64_ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn base64_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b = [chunk[0], *chunk.get(1).unwrap_or(&0), *chunk.get(2).unwrap_or(&0)];
        let n = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);
        out.push(BASE64_ALPHABET[(n >> 18 & 0x3F) as usize] as char);
        out.push(BASE64_ALPHABET[(n >> 12 & 0x3F) as usize] as char);
        out.push(if chunk.len() > 1 { BASE64_ALPHABET[(n >> 6 & 0x3F) as usize] as char } else { '=' });
        out.push(if chunk.len() > 2 { BASE64_ALPHABET[(n & 0x3F) as usize] as char } else { '=' });
    }
    out
}

fn base64_decode(s: &str) -> Result<Vec<u8>> {
    fn value(c: u8) -> Option<u32> {
        BASE64_ALPHABET.iter().position(|&b| b == c).map(|p| p as u32)
    }

    let s = s.trim_end_matches('=');
    let mut out = Vec::with_capacity(s.len() * 3 / 4);
    let chars: Vec<u8> = s.bytes().collect();

    for chunk in chars.chunks(4) {
        let mut n = 0u32;
        for (i, &c) in chunk.iter().enumerate() {
            let v = value(c).ok_or_else(|| anyhow::anyhow!("invalid base64 character {:?}", c as char))?;
            n |= v << (18 - 6 * i);
        }
        let bytes = [(n >> 16) as u8, (n >> 8) as u8, n as u8];
        out.extend_from_slice(&bytes[..chunk.len() - 1]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_load_remove_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        // SAFETY: test runs single-threaded within this process for this var.
        unsafe { std::env::set_var("CORRAL_HOME", dir.path()) };

        store("example.com", "alice", "hunter2").expect("store");
        let (user, pass) = load("example.com").expect("load").expect("present");
        assert_eq!(user, "alice");
        assert_eq!(pass, "hunter2");

        remove("example.com").expect("remove");
        assert!(load("example.com").expect("load after remove").is_none());

        unsafe { std::env::remove_var("CORRAL_HOME") };
    }

    #[test]
    fn base64_round_trips() {
        let data = b"admin:hunter2";
        let encoded = base64_encode(data);
        assert_eq!(encoded, "YWRtaW46aHVudGVyMg==");
        assert_eq!(base64_decode(&encoded).expect("decode"), data);
    }
}
