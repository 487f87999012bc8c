//! OCI push/pull pipeline for `corral` VM images.
//!
//! Talks to any OCI Distribution v2-compatible registry: pushes a
//! [`corral::VmDirectory`] as a manifest plus config/kernel/initramfs/disk
//! layers, and pulls either a native (`vnd.cirruslabs.vetu.*`) or
//! Tart-compatible (`vnd.cirruslabs.tart.*`) image back into one. Disk
//! layers are the only large transfer; everything else is whole-blob.

mod manifest;
mod pull;
mod push;
mod registry;

pub use manifest::{Descriptor, ImageManifest};
pub use pull::pull;
pub use push::push;
pub use registry::RegistryClient;

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from the OCI push/pull pipeline.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A storage/locking/networking operation in the core crate failed.
    #[error(transparent)]
    Core(#[from] corral::Error),

    /// An HTTP request to the registry could not be sent at all.
    #[error("request to {url} failed: {message}")]
    Request {
        /// The URL that was being requested.
        url: String,
        /// The underlying transport error.
        message: String,
    },

    /// The registry responded with an unexpected status code.
    #[error("registry returned HTTP {status} for {url}")]
    Status {
        /// The HTTP status code.
        status: u16,
        /// The URL that produced it.
        url: String,
    },

    /// A manifest or config blob was malformed or referenced an
    /// unsupported combination of layer media types.
    #[error("malformed manifest: {0}")]
    Manifest(String),

    /// Propagated JSON (de)serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Propagated I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The OCI image config media type (unused fields beyond `architecture`
/// and `os` are omitted; the registry doesn't interpret this blob).
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
/// The OCI image manifest media type.
pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Native config layer media type.
pub const MEDIA_TYPE_VETU_CONFIG: &str = "application/vnd.cirruslabs.vetu.config.v1";
/// Native kernel layer media type.
pub const MEDIA_TYPE_VETU_KERNEL: &str = "application/vnd.cirruslabs.vetu.kernel.v1";
/// Native initramfs layer media type.
pub const MEDIA_TYPE_VETU_INITRAMFS: &str = "application/vnd.cirruslabs.vetu.initramfs.v1";
/// Native disk layer media type.
pub const MEDIA_TYPE_VETU_DISK: &str = "application/vnd.cirruslabs.vetu.disk.v1";
/// Tart-compatible config layer media type.
pub const MEDIA_TYPE_TART_CONFIG: &str = "application/vnd.cirruslabs.tart.config.v1";
/// Tart-compatible disk layer media type.
pub const MEDIA_TYPE_TART_DISK: &str = "application/vnd.cirruslabs.tart.disk.v2";

/// Disk-name annotation on a native disk layer.
pub const ANNOTATION_VETU_NAME: &str = "org.cirruslabs.vetu.name";
/// Uncompressed-size annotation on a native disk layer.
pub const ANNOTATION_VETU_UNCOMPRESSED_SIZE: &str = "org.cirruslabs.vetu.uncompressed-size";
/// Uncompressed-digest annotation on a native disk layer.
pub const ANNOTATION_VETU_UNCOMPRESSED_DIGEST: &str = "org.cirruslabs.vetu.uncompressed-digest";
/// Uncompressed-size annotation on a Tart disk layer.
pub const ANNOTATION_TART_UNCOMPRESSED_SIZE: &str = "org.cirruslabs.tart.uncompressed-size";
/// Uncompressed-content-digest annotation on a Tart disk layer.
pub const ANNOTATION_TART_UNCOMPRESSED_DIGEST: &str = "org.cirruslabs.tart.uncompressed-content-digest";

/// Target size, in compressed bytes, of each disk layer pushed by
/// [`push`].
pub const TARGET_DISK_LAYER_SIZE: usize = 500 * 1024 * 1024;

/// The fixed disk name a Tart image's single disk is translated to.
pub const TART_DISK_NAME: &str = "disk.img";
