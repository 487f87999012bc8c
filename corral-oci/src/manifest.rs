//! OCI image manifest and descriptor shapes, restricted to the fields
//! this crate actually reads or writes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A content descriptor: media type, digest, size, and optional
/// annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    /// The blob's media type.
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// `sha256:<hex>` of the blob's raw (on-the-wire) bytes.
    pub digest: String,
    /// Size of the blob in bytes.
    pub size: u64,
    /// Free-form key/value metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl Descriptor {
    /// Builds a descriptor over `data`, with no annotations.
    #[must_use]
    pub fn of(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest_of(data),
            size: data.len() as u64,
            annotations: HashMap::new(),
        }
    }

    /// As [`Descriptor::of`], with `annotations` attached.
    #[must_use]
    pub fn of_with_annotations(media_type: impl Into<String>, data: &[u8], annotations: HashMap<String, String>) -> Self {
        let mut descriptor = Self::of(media_type, data);
        descriptor.annotations = annotations;
        descriptor
    }

    /// Looks up a single annotation by key.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// An OCI schema-version-2 image manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Always 2.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// [`crate::MEDIA_TYPE_IMAGE_MANIFEST`].
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// Descriptor of the image config blob.
    pub config: Descriptor,
    /// Layer descriptors, in push order.
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Builds a fresh manifest with no layers.
    #[must_use]
    pub fn new(config: Descriptor) -> Self {
        Self {
            schema_version: 2,
            media_type: crate::MEDIA_TYPE_IMAGE_MANIFEST.to_owned(),
            config,
            layers: Vec::new(),
        }
    }

    /// Appends a layer descriptor.
    pub fn push_layer(&mut self, layer: Descriptor) {
        self.layers.push(layer);
    }

    /// Serializes to canonical JSON bytes.
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a manifest document.
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// The minimal OCI image configuration blob this crate pushes: just
/// enough for a registry or other client to identify the image's
/// platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Target CPU architecture (`"amd64"`/`"arm64"`).
    pub architecture: String,
    /// Always `"linux"`.
    pub os: String,
}

/// The Tart config blob shape (`application/vnd.cirruslabs.tart.config.v1`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TartConfig {
    /// Schema version; must equal 1.
    pub version: u32,
    /// Guest OS, e.g. `"linux"`.
    pub os: String,
    /// Target architecture.
    pub arch: String,
    #[serde(rename = "cpuCount")]
    /// Number of virtual CPUs.
    pub cpu_count: u8,
    #[serde(rename = "memorySize")]
    /// Guest memory size in bytes.
    pub memory_size: u64,
    #[serde(rename = "macAddress")]
    /// The guest NIC's hardware address, colon-hex.
    pub mac_address: String,
}

/// `sha256:<hex>` of `data`.
#[must_use]
pub fn digest_of(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips_through_json() {
        let config = Descriptor::of(crate::MEDIA_TYPE_IMAGE_CONFIG, b"{}");
        let mut manifest = ImageManifest::new(config);
        manifest.push_layer(Descriptor::of(crate::MEDIA_TYPE_VETU_KERNEL, b"kernel bytes"));

        let bytes = manifest.to_bytes().expect("serialize");
        let parsed = ImageManifest::from_bytes(&bytes).expect("parse");
        assert_eq!(parsed.layers.len(), 1);
        assert_eq!(parsed.layers[0].media_type, crate::MEDIA_TYPE_VETU_KERNEL);
    }

    #[test]
    fn digest_is_stable_for_identical_content() {
        assert_eq!(digest_of(b"hello"), digest_of(b"hello"));
        assert_ne!(digest_of(b"hello"), digest_of(b"world"));
    }
}
