//! A minimal OCI Distribution v2 HTTP client: manifest GET/PUT, blob
//! GET/HEAD/POST-then-PUT upload, and generic `WWW-Authenticate`
//! challenge-based bearer token auth (no registry-specific realms
//! hardcoded, unlike a Docker-Hub/GHCR-only client).

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use ureq::Agent;

use crate::manifest::{Descriptor, ImageManifest};
use crate::{Error, Result};

/// Talks to one repository (`registry/namespace`) on one registry host.
///
/// Built on an [`Agent`] configured to treat non-2xx responses as
/// ordinary values rather than errors, since reading a `401`'s
/// `WWW-Authenticate` header (to discover where to exchange a token) and
/// a `404`'s absence (for [`RegistryClient::blob_exists`]) are both part
/// of normal control flow here, not exceptional cases.
///
/// Cheaply [`Clone`]: the underlying [`Agent`] and cached token are
/// shared, so cloning a client to move into a concurrent fetch task
/// reuses the same connection pool and bearer token.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    agent: Agent,
    base_url: String,
    repository: String,
    credentials: Option<(String, String)>,
    token: Arc<Mutex<Option<String>>>,
}

impl RegistryClient {
    /// Builds a client for `registry/repository`, talking plain HTTP when
    /// `insecure` is set (for local test registries like `localhost:5000`)
    /// and HTTPS otherwise. `credentials`, if given, are used as HTTP
    /// Basic auth when exchanging a token with the registry's auth
    /// server.
    #[must_use]
    pub fn new(registry: &str, repository: &str, insecure: bool, credentials: Option<(String, String)>) -> Self {
        let scheme = if insecure { "http" } else { "https" };
        let config = Agent::config_builder().http_status_as_error(false).build();
        Self {
            agent: Agent::new_with_config(config),
            base_url: format!("{scheme}://{registry}/v2"),
            repository: repository.to_owned(),
            credentials,
            token: Arc::new(Mutex::new(None)),
        }
    }

    fn manifest_url(&self, reference: &str) -> String {
        format!("{}/{}/manifests/{reference}", self.base_url, self.repository)
    }

    fn blob_url(&self, digest: &str) -> String {
        format!("{}/{}/blobs/{digest}", self.base_url, self.repository)
    }

    /// Fetches and parses the manifest for `reference` (a tag or digest),
    /// returning it alongside its content digest (recomputed locally from
    /// the raw response bytes, since registries are not required to echo
    /// `Docker-Content-Digest`).
    pub fn get_manifest(&self, reference: &str) -> Result<(ImageManifest, String)> {
        let url = self.manifest_url(reference);
        let bytes = self.get_body(&url, Some(crate::MEDIA_TYPE_IMAGE_MANIFEST))?;
        let digest = crate::manifest::digest_of(&bytes);
        let manifest = ImageManifest::from_bytes(&bytes)?;
        Ok((manifest, digest))
    }

    /// Opens a streaming reader over a blob's body, for the disk-pull hot
    /// path — never buffers the whole blob in memory.
    pub fn blob_reader(&self, digest: &str) -> Result<Box<dyn Read + Send>> {
        let url = self.blob_url(digest);
        let token = self.token_for(&url)?;

        let mut req = self.agent.get(&url);
        if let Some(token) = &token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        let resp = req.call().map_err(|e| Error::Request { url: url.clone(), message: e.to_string() })?;
        if !resp.status().is_success() {
            return Err(Error::Status { status: resp.status().as_u16(), url });
        }
        Ok(Box::new(resp.into_body().into_reader()))
    }

    /// `HEAD`s a blob, reporting whether the registry already has it
    /// (used by `push` to skip re-uploading content it's seen before).
    pub fn blob_exists(&self, digest: &str) -> Result<bool> {
        let url = self.blob_url(digest);
        let token = self.token_for(&url)?;

        let mut req = self.agent.head(&url);
        if let Some(token) = &token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        let resp = req.call().map_err(|e| Error::Request { url, message: e.to_string() })?;
        Ok(resp.status().is_success())
    }

    /// Uploads `data` as a blob with the given pre-computed `digest`,
    /// monolithic (single `POST` to start the upload session immediately
    /// followed by a single `PUT` with the content), skipping the upload
    /// entirely if the registry reports it already has the blob.
    pub fn push_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        if self.blob_exists(digest)? {
            return Ok(());
        }

        let initiate_url = format!("{}/{}/blobs/uploads/", self.base_url, self.repository);
        let token = self.token_for(&initiate_url)?;

        let mut req = self.agent.post(&initiate_url);
        if let Some(token) = &token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        let resp = req.call().map_err(|e| Error::Request { url: initiate_url.clone(), message: e.to_string() })?;
        if resp.status().as_u16() != 202 {
            return Err(Error::Status { status: resp.status().as_u16(), url: initiate_url });
        }

        let location = resp
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Manifest("upload initiation response carried no Location header".into()))?
            .to_owned();

        let upload_url = complete_upload_url(&location, digest);
        let mut req = self.agent.put(&upload_url).header("Content-Type", "application/octet-stream");
        if let Some(token) = &token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        let resp = req.send(data).map_err(|e| Error::Request { url: upload_url.clone(), message: e.to_string() })?;
        if !resp.status().is_success() {
            return Err(Error::Status { status: resp.status().as_u16(), url: upload_url });
        }
        Ok(())
    }

    /// Uploads an already-built manifest under `reference` (a tag, since
    /// only tagged manifests are useful entry points for `pull`).
    pub fn push_manifest(&self, reference: &str, manifest: &ImageManifest) -> Result<()> {
        let url = self.manifest_url(reference);
        let body = manifest.to_bytes()?;
        let token = self.token_for(&url)?;

        let mut req = self.agent.put(&url).header("Content-Type", crate::MEDIA_TYPE_IMAGE_MANIFEST);
        if let Some(token) = &token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        let resp = req.send(&body).map_err(|e| Error::Request { url: url.clone(), message: e.to_string() })?;
        if !resp.status().is_success() {
            return Err(Error::Status { status: resp.status().as_u16(), url });
        }
        Ok(())
    }

    fn get_body(&self, url: &str, accept: Option<&str>) -> Result<Vec<u8>> {
        let token = self.token_for(url)?;

        let mut req = self.agent.get(url);
        if let Some(accept) = accept {
            req = req.header("Accept", accept);
        }
        if let Some(token) = &token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }

        let resp = req.call().map_err(|e| Error::Request { url: url.to_owned(), message: e.to_string() })?;
        if !resp.status().is_success() {
            return Err(Error::Status { status: resp.status().as_u16(), url: url.to_owned() });
        }

        let mut body = Vec::new();
        resp.into_body().into_reader().read_to_end(&mut body).map_err(Error::Io)?;
        Ok(body)
    }

    /// Returns a cached bearer token for this repository, probing with an
    /// anonymous request first and exchanging a token only if the
    /// registry challenges with `401` + `WWW-Authenticate: Bearer ...`.
    /// Registries that never challenge (e.g. local test registries)
    /// leave every subsequent request unauthenticated.
    fn token_for(&self, url: &str) -> Result<Option<String>> {
        if let Some(token) = self.token.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone() {
            return Ok(Some(token));
        }

        let resp =
            self.agent.get(url).call().map_err(|e| Error::Request { url: url.to_owned(), message: e.to_string() })?;
        if resp.status().as_u16() != 401 {
            return Ok(None);
        }

        let Some(header) = resp.headers().get("WWW-Authenticate").and_then(|v| v.to_str().ok()) else {
            return Ok(None);
        };
        let Some(challenge) = parse_www_authenticate(header) else {
            return Ok(None);
        };

        let token = self.exchange_token(&challenge)?;
        *self.token.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token.clone());
        Ok(Some(token))
    }

    fn exchange_token(&self, challenge: &BearerChallenge) -> Result<String> {
        let mut url = format!("{}?service={}", challenge.realm, urlencode(&challenge.service));
        if let Some(scope) = &challenge.scope {
            url.push_str(&format!("&scope={}", urlencode(scope)));
        }

        let mut req = self.agent.get(&url);
        if let Some((user, pass)) = &self.credentials {
            let creds = format!("{user}:{pass}");
            req = req.header("Authorization", &format!("Basic {}", base64_encode(creds.as_bytes())));
        }

        let resp = req.call().map_err(|e| Error::Request { url: url.clone(), message: e.to_string() })?;
        if !resp.status().is_success() {
            return Err(Error::Status { status: resp.status().as_u16(), url });
        }

        let mut body = Vec::new();
        resp.into_body().into_reader().read_to_end(&mut body).map_err(Error::Io)?;
        let parsed: TokenResponse = serde_json::from_slice(&body)?;
        parsed
            .token
            .or(parsed.access_token)
            .ok_or_else(|| Error::Manifest("token response carried neither 'token' nor 'access_token'".into()))
    }
}

/// A parsed `Bearer realm="...",service="...",scope="..."` challenge.
struct BearerChallenge {
    realm: String,
    service: String,
    scope: Option<String>,
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

fn parse_www_authenticate(header: &str) -> Option<BearerChallenge> {
    let rest = header.strip_prefix("Bearer ")?;
    let mut parts: HashMap<&str, String> = HashMap::new();
    for field in split_challenge_fields(rest) {
        if let Some((key, value)) = field.split_once('=') {
            parts.insert(key.trim(), value.trim().trim_matches('"').to_owned());
        }
    }
    Some(BearerChallenge {
        realm: parts.remove("realm")?,
        service: parts.remove("service").unwrap_or_default(),
        scope: parts.remove("scope"),
    })
}

/// Splits `realm="a,b",service="c",scope="d"` on commas that are not
/// inside a quoted value.
fn split_challenge_fields(s: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    fields.push(s[start..].trim());
    fields
}

fn complete_upload_url(location: &str, digest: &str) -> String {
    let separator = if location.contains('?') { '&' } else { '?' };
    format!("{location}{separator}digest={digest}")
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_bearer_challenge() {
        let header = r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:ns/repo:pull""#;
        let challenge = parse_www_authenticate(header).expect("parse");
        assert_eq!(challenge.realm, "https://auth.example.com/token");
        assert_eq!(challenge.service, "registry.example.com");
        assert_eq!(challenge.scope.as_deref(), Some("repository:ns/repo:pull"));
    }

    #[test]
    fn complete_upload_url_appends_digest_query_param() {
        assert_eq!(
            complete_upload_url("https://r/v2/x/blobs/uploads/abc", "sha256:d"),
            "https://r/v2/x/blobs/uploads/abc?digest=sha256:d"
        );
        assert_eq!(
            complete_upload_url("https://r/v2/x/blobs/uploads/abc?_state=y", "sha256:d"),
            "https://r/v2/x/blobs/uploads/abc?_state=y&digest=sha256:d"
        );
    }

    #[test]
    fn base64_matches_known_vector() {
        assert_eq!(base64_encode(b"admin:hunter2"), "YWRtaW46aHVudGVyMg==");
    }
}
