//! Pulls a manifest and its layers into a local [`corral::VmDirectory`],
//! from either this crate's own (`vnd.cirruslabs.vetu.*`) layer scheme or
//! a Tart-compatible (`vnd.cirruslabs.tart.*`) one.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use corral::storage::{remote, temporary};
use corral::vmconfig::{Disk, MacAddress, VmConfig};
use corral::{HomeDir, RemoteName, VmDirectory};
use tokio::sync::Semaphore;

use crate::manifest::{Descriptor, ImageManifest, TartConfig};
use crate::registry::RegistryClient;
use crate::{Error, Result};

/// How many disk-layer fetches may be in flight at once, absent an
/// explicit `--concurrency`.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Resolves `name` against `client`, using the local remote cache when the
/// resolved digest is already present and otherwise fetching every layer
/// into a scratch directory before publishing it. `concurrency` bounds how
/// many disk-layer fetches run at once.
pub async fn pull(client: &RegistryClient, home: &HomeDir, name: &RemoteName, concurrency: usize) -> Result<VmDirectory> {
    let reference = name
        .tag
        .as_deref()
        .or(name.digest.as_deref())
        .ok_or_else(|| Error::Manifest(format!("{name} has neither tag nor digest")))?;

    let (manifest, digest) = client.get_manifest(reference)?;

    if remote::digest_is_cached(home, name, &digest) {
        if name.tag.is_some() {
            remote::link(home, &name.with_resolved_digest(&digest), name).map_err(Error::Core)?;
        }
        return remote::open(home, name).map_err(Error::Core);
    }

    let scratch = temporary::create(home, 1, 0).map_err(Error::Core)?;
    let client = Arc::new(client.clone());
    let concurrency = concurrency.max(1);

    if manifest.layers.iter().any(|l| l.media_type == crate::MEDIA_TYPE_TART_CONFIG) {
        pull_tart(&client, &scratch, &manifest, concurrency).await?;
    } else {
        pull_native(&client, &scratch, &manifest, concurrency).await?;
    }

    let published = remote::move_in(home, name, &digest, scratch).map_err(Error::Core)?;
    if name.digest.is_some() {
        published.set_explicitly_pulled(true).map_err(Error::Core)?;
    }
    Ok(published)
}

async fn pull_native(
    client: &Arc<RegistryClient>,
    scratch: &VmDirectory,
    manifest: &ImageManifest,
    concurrency: usize,
) -> Result<()> {
    let config_layer = find_layer(manifest, crate::MEDIA_TYPE_VETU_CONFIG)
        .ok_or_else(|| Error::Manifest("manifest carries no vetu config layer".into()))?;
    let config_bytes = fetch_whole(client, &config_layer.digest)?;
    let vm_config = VmConfig::from_json(&config_bytes).map_err(Error::Core)?;
    scratch.set_config(&vm_config).map_err(Error::Core)?;

    let kernel_layer = find_layer(manifest, crate::MEDIA_TYPE_VETU_KERNEL)
        .ok_or_else(|| Error::Manifest("manifest carries no vetu kernel layer".into()))?;
    let kernel_bytes = fetch_whole(client, &kernel_layer.digest)?;
    std::fs::write(scratch.kernel_path(), kernel_bytes)?;

    if let Some(initramfs_layer) = find_layer(manifest, crate::MEDIA_TYPE_VETU_INITRAMFS) {
        let initramfs_bytes = fetch_whole(client, &initramfs_layer.digest)?;
        std::fs::write(scratch.initramfs_path(), initramfs_bytes)?;
    }

    let groups = group_by_annotation(manifest, crate::MEDIA_TYPE_VETU_DISK, crate::ANNOTATION_VETU_NAME);
    for (name, _layers) in &groups {
        if !vm_config.disks.iter().any(|d| &d.name == name) {
            return Err(Error::Manifest(format!("disk with name {name:?} is not found in the VM's config")));
        }
    }

    pull_disks(client, scratch, groups, crate::ANNOTATION_VETU_UNCOMPRESSED_SIZE, lz4_frame_decompress, concurrency).await
}

async fn pull_tart(
    client: &Arc<RegistryClient>,
    scratch: &VmDirectory,
    manifest: &ImageManifest,
    concurrency: usize,
) -> Result<()> {
    let config_layer = find_layer(manifest, crate::MEDIA_TYPE_TART_CONFIG)
        .ok_or_else(|| Error::Manifest("manifest carries no tart config layer".into()))?;
    let config_bytes = fetch_whole(client, &config_layer.digest)?;
    let tart_config: TartConfig = serde_json::from_slice(&config_bytes)?;

    let mac_json = format!("\"{}\"", tart_config.mac_address);
    let mac_address: MacAddress = serde_json::from_str(&mac_json)?;

    let vm_config = VmConfig {
        version: corral::vmconfig::CURRENT_VERSION,
        arch: tart_config.arch,
        cmdline: String::new(),
        disks: vec![Disk { name: crate::TART_DISK_NAME.to_owned() }],
        cpu_count: tart_config.cpu_count,
        memory_size: tart_config.memory_size,
        mac_address,
    };
    scratch.set_config(&vm_config).map_err(Error::Core)?;

    let disk_layers: Vec<Descriptor> =
        manifest.layers.iter().filter(|l| l.media_type == crate::MEDIA_TYPE_TART_DISK).cloned().collect();
    let groups = vec![(crate::TART_DISK_NAME.to_owned(), disk_layers)];
    pull_disks(client, scratch, groups, crate::ANNOTATION_TART_UNCOMPRESSED_SIZE, applestream_decompress, concurrency).await
}

fn find_layer<'a>(manifest: &'a ImageManifest, media_type: &str) -> Option<&'a Descriptor> {
    manifest.layers.iter().find(|l| l.media_type == media_type)
}

/// Groups `manifest`'s layers of `media_type`, in manifest order, by the
/// value of their `name_key` annotation.
fn group_by_annotation(manifest: &ImageManifest, media_type: &str, name_key: &str) -> Vec<(String, Vec<Descriptor>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: std::collections::HashMap<String, Vec<Descriptor>> = std::collections::HashMap::new();

    for layer in manifest.layers.iter().filter(|l| l.media_type == media_type) {
        let Some(name) = layer.annotation(name_key) else { continue };
        if !groups.contains_key(name) {
            order.push(name.to_owned());
        }
        groups.entry(name.to_owned()).or_default().push(layer.clone());
    }

    order.into_iter().filter_map(|name| groups.remove(&name).map(|layers| (name.clone(), layers))).collect()
}

fn fetch_whole(client: &RegistryClient, digest: &str) -> Result<Vec<u8>> {
    let mut reader = client.blob_reader(digest)?;
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}

type Decompress = fn(Box<dyn Read + Send>) -> Result<Vec<u8>>;

fn lz4_frame_decompress(reader: Box<dyn Read + Send>) -> Result<Vec<u8>> {
    let mut decoder = lz4_flex::frame::FrameDecoder::new(reader);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn applestream_decompress(reader: Box<dyn Read + Send>) -> Result<Vec<u8>> {
    corral::applestream::decode(reader).map_err(Error::Core)
}

/// Fetches every layer in every `(disk_name, layers)` group concurrently
/// (bounded by [`DEFAULT_CONCURRENCY`]), reassembling each disk file from
/// its layers' cumulative uncompressed offsets. The first failure stops
/// any not-yet-started fetch from proceeding; fetches already in flight
/// still complete.
async fn pull_disks(
    client: &Arc<RegistryClient>,
    scratch: &VmDirectory,
    groups: Vec<(String, Vec<Descriptor>)>,
    size_annotation: &'static str,
    decompress: Decompress,
    concurrency: usize,
) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let cancelled = Arc::new(AtomicBool::new(false));
    let mut tasks = Vec::new();

    for (disk_name, layers) in groups {
        let mut sizes = Vec::with_capacity(layers.len());
        let mut total = 0u64;
        for layer in &layers {
            let size = layer_uncompressed_size(layer, size_annotation)?;
            sizes.push(size);
            total += size;
        }

        let disk_path = Arc::new(scratch.disk_path(&disk_name));
        {
            let file = std::fs::OpenOptions::new().write(true).create(true).truncate(true).open(disk_path.as_path())?;
            file.set_len(total)?;
        }

        let mut offset = 0u64;
        for (layer, size) in layers.into_iter().zip(sizes) {
            let client = Arc::clone(client);
            let disk_path = Arc::clone(&disk_path);
            let semaphore = Arc::clone(&semaphore);
            let cancelled = Arc::clone(&cancelled);
            let digest = layer.digest.clone();
            let this_offset = offset;

            tasks.push(tokio::spawn(async move {
                let permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Manifest("disk-fetch semaphore closed unexpectedly".into()))?;
                if cancelled.load(Ordering::Acquire) {
                    drop(permit);
                    return Ok(());
                }

                let result = tokio::task::spawn_blocking(move || -> Result<()> {
                    let reader = client.blob_reader(&digest)?;
                    let decoded = decompress(reader)?;
                    // Each task opens its own file description (rather than
                    // sharing one via `try_clone`, which would share the
                    // underlying offset across concurrent writers) so
                    // concurrent positioned writes to disjoint regions of
                    // the same disk file can't race on a shared cursor.
                    let file = std::fs::OpenOptions::new().write(true).open(disk_path.as_path())?;
                    corral::sparseio::sparse_copy_at(&file, this_offset, decoded.as_slice()).map_err(Error::Core)?;
                    Ok(())
                })
                .await
                .map_err(|_| Error::Manifest("disk-fetch task panicked".into()))?;

                drop(permit);
                if result.is_err() {
                    cancelled.store(true, Ordering::Release);
                }
                result
            }));

            offset += size;
        }
    }

    let mut first_error = None;
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(_) => {
                first_error.get_or_insert(Error::Manifest("disk-fetch task panicked".into()));
            }
        }
    }

    first_error.map_or(Ok(()), Err)
}

fn layer_uncompressed_size(layer: &Descriptor, annotation_key: &str) -> Result<u64> {
    layer
        .annotation(annotation_key)
        .ok_or_else(|| Error::Manifest(format!("disk layer {} carries no {annotation_key} annotation", layer.digest)))?
        .parse()
        .map_err(|_| Error::Manifest(format!("disk layer {} has a malformed {annotation_key} annotation", layer.digest)))
}
