//! Parsing of user-supplied VM identifiers into local or remote names.
//!
//! Mirrors the shape of an OCI reference parser (registry/namespace[:tag]
//! or `@sha256:<hex>`) but is hand-rolled rather than built atop a generic
//! container-reference crate, because the accepted grammar and error
//! taxonomy here are specific to this tool.

use crate::{Error, Result};

/// A disk/VM identifier, either a bare local name or a fully qualified
/// remote (registry) reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Name {
    /// A simple, locally published VM name.
    Local(LocalName),
    /// A registry-qualified reference.
    Remote(RemoteName),
}

/// A validated simple name: `[A-Za-z0-9_-]([A-Za-z0-9_.-]*[A-Za-z0-9_-])?`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalName(String);

/// A parsed `registry/namespace[:tag][@digest]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteName {
    /// Registry host, with optional `:port`.
    pub registry: String,
    /// Slash-separated namespace/repository path.
    pub namespace: String,
    /// Tag, e.g. `"latest"`. Mutually exclusive with `digest`.
    pub tag: Option<String>,
    /// `sha256:<64 lowercase hex>`. Mutually exclusive with `tag`.
    pub digest: Option<String>,
}

/// Parses `s` as a [`Name`]: attempts remote parsing first, falling back to
/// a local (simple) name when no registry component is present.
pub fn parse(s: &str) -> Result<Name> {
    match RemoteName::parse(s) {
        Ok(remote) => Ok(Name::Remote(remote)),
        Err(ParseOutcome::NotCanonical) => LocalName::parse(s).map(Name::Local),
        Err(ParseOutcome::Invalid(e)) => Err(e),
    }
}

enum ParseOutcome {
    /// No registry component was present — try local parsing instead.
    NotCanonical,
    /// A registry component was present but the reference is malformed.
    Invalid(Error),
}

impl LocalName {
    /// Validates `s` against the simple-name grammar and wraps it.
    pub fn parse(s: &str) -> Result<Self> {
        validate_simple_name(s)?;
        Ok(Self(s.to_owned()))
    }

    /// The validated name string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(name) => name.fmt(f),
            Self::Remote(name) => name.fmt(f),
        }
    }
}

impl std::fmt::Display for LocalName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validates the simple-name grammar used for local VM names and disk
/// names: `[A-Za-z0-9_-]([A-Za-z0-9_.-]*[A-Za-z0-9_-])?`.
pub(crate) fn validate_simple_name(s: &str) -> Result<()> {
    if s.is_empty() {
        return Err(Error::Parse("name is empty".into()));
    }

    let chars: Vec<char> = s.chars().collect();
    let last = chars.len() - 1;

    for (idx, &ch) in chars.iter().enumerate() {
        let is_base = ch.is_ascii_alphanumeric() || ch == '-' || ch == '_';
        let is_interior_dot = ch == '.' && idx != 0 && idx != last;

        if !is_base && !is_interior_dot {
            return Err(Error::Parse(format!(
                "{s:?} contains restricted characters; only [A-Za-z0-9_-] \
                 and interior '.' are allowed"
            )));
        }
    }

    Ok(())
}

impl RemoteName {
    fn parse(s: &str) -> std::result::Result<Self, ParseOutcome> {
        if !s.is_ascii() || s.chars().any(|c| c.is_control()) {
            return Err(ParseOutcome::Invalid(Error::Parse(format!(
                "{s:?} contains non-ASCII or non-printable characters"
            ))));
        }

        // Split off an optional @digest suffix first -- it may contain ':'
        // which would otherwise confuse tag splitting.
        let (before_digest, digest) = match s.split_once('@') {
            Some((before, digest_str)) => (before, Some(parse_digest(digest_str)?)),
            None => (s, None),
        };

        let Some((registry, rest)) = split_registry(before_digest) else {
            return Err(ParseOutcome::NotCanonical);
        };

        let (path, tag) = match rest.rsplit_once(':') {
            // A ':' after the last '/' is a tag; one before it is a port
            // that belongs to an (already consumed) registry, so only
            // split when no '/' follows the ':'.
            Some((path, tag)) if !tag.contains('/') => (path, Some(tag.to_owned())),
            _ => (rest, None),
        };

        if tag.is_some() && digest.is_some() {
            return Err(ParseOutcome::Invalid(Error::Parse(
                "a reference cannot have both a tag and a digest".into(),
            )));
        }

        validate_path(registry, path).map_err(ParseOutcome::Invalid)?;

        let (tag, digest) = match (tag, digest) {
            (None, None) => (Some("latest".to_owned()), None),
            other => other,
        };

        Ok(Self {
            registry: registry.to_owned(),
            namespace: path.to_owned(),
            tag,
            digest,
        })
    }

    /// Renders the canonical string form, e.g. `registry/ns/repo:tag`.
    #[must_use]
    pub fn display_string(&self) -> String {
        let mut out = format!("{}/{}", self.registry, self.namespace);
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest);
        }
        out
    }

    /// Returns a copy with the tag stripped and `digest` set, as used to
    /// build the *fully-qualified* cache-path name after resolving a
    /// manifest (§4.7 step 2).
    #[must_use]
    pub fn with_resolved_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            namespace: self.namespace.clone(),
            tag: None,
            digest: Some(digest.to_owned()),
        }
    }

    /// The on-disk cache path component for the digest, e.g. `sha256:abcd..`.
    #[must_use]
    pub fn digest_dirname(&self) -> Option<&str> {
        self.digest.as_deref()
    }
}

impl std::fmt::Display for RemoteName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_string())
    }
}

/// Splits off a leading registry host. A segment is recognized as a
/// registry when it contains `.` or `:`, or is literally `localhost`;
/// otherwise there is no registry component and the reference is not
/// canonical (the caller should retry as a local name).
fn split_registry(s: &str) -> Option<(&str, &str)> {
    let (first, rest) = s.split_once('/')?;
    let is_registry = first.contains('.') || first.contains(':') || first == "localhost";
    is_registry.then_some((first, rest))
}

fn validate_path(registry: &str, path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::Parse(format!("{registry}: empty repository path")));
    }

    for segment in path.split('/') {
        if segment.is_empty() || segment == ".." || segment.starts_with('.') || segment.ends_with('.') {
            return Err(Error::Parse(format!(
                "{path:?} contains an invalid or path-traversal path segment"
            )));
        }
        if segment.contains(':') {
            return Err(Error::Parse(format!(
                "{path:?} contains a colon inside a path segment"
            )));
        }
    }

    Ok(())
}

fn parse_digest(s: &str) -> std::result::Result<String, ParseOutcome> {
    let Some(hex) = s.strip_prefix("sha256:") else {
        return Err(ParseOutcome::Invalid(Error::Parse(format!(
            "{s:?} uses an unsupported digest algorithm; only sha256 is accepted"
        ))));
    };

    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ParseOutcome::Invalid(Error::Parse(format!(
            "{s:?} is not a valid sha256 digest"
        ))));
    }

    Ok(s.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_local_name() {
        match parse("my-vm_1").expect("parse") {
            Name::Local(local) => assert_eq!(local.as_str(), "my-vm_1"),
            Name::Remote(_) => panic!("expected a local name"),
        }
    }

    #[test]
    fn rejects_empty_local_name() {
        assert!(parse("").is_err());
    }

    #[test]
    fn rejects_leading_interior_only_dot_rule() {
        // A leading dot is not allowed even though it's the same
        // character accepted in the interior.
        assert!(LocalName::parse(".leading").is_err());
        assert!(LocalName::parse("trailing.").is_err());
        assert!(LocalName::parse("mid.dle").is_ok());
    }

    #[test]
    fn parses_registry_namespace_tag() {
        let Name::Remote(r) = parse("localhost:5000/group/vm:v1").expect("parse") else {
            panic!("expected remote")
        };
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.namespace, "group/vm");
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert!(r.digest.is_none());
    }

    #[test]
    fn bare_reference_defaults_to_latest() {
        let Name::Remote(r) = parse("registry.example.com/ns/vm").expect("parse") else {
            panic!("expected remote")
        };
        assert_eq!(r.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn parses_digest_reference() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let s = format!("example.com/ns/vm@{digest}");
        let Name::Remote(r) = parse(&s).expect("parse") else {
            panic!("expected remote")
        };
        assert_eq!(r.digest.as_deref(), Some(digest.as_str()));
        assert!(r.tag.is_none());
    }

    #[test]
    fn rejects_path_traversal() {
        assert!(RemoteName::parse("example.com/../etc").is_err());
    }

    #[test]
    fn rejects_non_sha256_digest() {
        let s = format!("example.com/ns/vm@sha512:{}", "a".repeat(128));
        assert!(RemoteName::parse(s.as_str()).is_err());
    }

    #[test]
    fn display_roundtrips_canonical_form() {
        let s = "example.com/ns/vm:v2";
        let Name::Remote(r) = parse(s).expect("parse") else {
            panic!("expected remote")
        };
        assert_eq!(r.display_string(), s);
    }
}
