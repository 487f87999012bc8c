//! Pushes a [`corral::VmDirectory`] to a registry as config + kernel +
//! optional initramfs + one chunked, compressed layer per disk.

use std::collections::HashMap;
use std::io::{Read, Write};

use corral::chunker::Chunker;
use corral::VmDirectory;

use crate::manifest::{Descriptor, ImageConfig, ImageManifest};
use crate::registry::RegistryClient;
use crate::{Error, Result};

/// Pushes `vm` to `client` under `tag`, returning the pushed manifest's
/// digest.
///
/// Layers are pushed in a fixed order: config, kernel, initramfs (if
/// present), then disks in `config.disks` order. Two pushes of identical
/// content always produce byte-identical manifests.
pub fn push(client: &RegistryClient, vm: &VmDirectory, tag: &str) -> Result<String> {
    let config = vm.config().map_err(Error::Core)?;

    let image_config = ImageConfig { architecture: config.arch.clone(), os: "linux".to_owned() };
    let image_config_bytes = serde_json::to_vec(&image_config)?;
    let config_descriptor = Descriptor::of(crate::MEDIA_TYPE_IMAGE_CONFIG, &image_config_bytes);
    client.push_blob(&config_descriptor.digest, &image_config_bytes)?;

    let mut manifest = ImageManifest::new(config_descriptor);

    let vm_config_bytes = std::fs::read(vm.config_path())?;
    let vetu_config_descriptor = Descriptor::of(crate::MEDIA_TYPE_VETU_CONFIG, &vm_config_bytes);
    client.push_blob(&vetu_config_descriptor.digest, &vm_config_bytes)?;
    manifest.push_layer(vetu_config_descriptor);

    let kernel_bytes = std::fs::read(vm.kernel_path())?;
    let kernel_descriptor = Descriptor::of(crate::MEDIA_TYPE_VETU_KERNEL, &kernel_bytes);
    client.push_blob(&kernel_descriptor.digest, &kernel_bytes)?;
    manifest.push_layer(kernel_descriptor);

    if vm.initramfs_path().exists() {
        let initramfs_bytes = std::fs::read(vm.initramfs_path())?;
        let initramfs_descriptor = Descriptor::of(crate::MEDIA_TYPE_VETU_INITRAMFS, &initramfs_bytes);
        client.push_blob(&initramfs_descriptor.digest, &initramfs_bytes)?;
        manifest.push_layer(initramfs_descriptor);
    }

    for disk in &config.disks {
        push_disk(client, vm, &disk.name, &mut manifest)?;
    }

    client.push_manifest(tag, &manifest)?;
    Ok(crate::manifest::digest_of(&manifest.to_bytes()?))
}

/// Streams one disk through an LZ4-frame [`Chunker`], pushing each
/// emitted chunk as its own blob and appending its descriptor to
/// `manifest`.
///
/// The chunker runs on a producer thread so its bounded channel provides
/// backpressure: the disk is read only as fast as chunks are drained and
/// pushed on this thread.
fn push_disk(client: &RegistryClient, vm: &VmDirectory, disk_name: &str, manifest: &mut ImageManifest) -> Result<()> {
    let disk_path = vm.disk_path(disk_name);

    let make_compressor: corral::chunker::CompressorFactory =
        Box::new(|sink| Box::new(lz4_flex::frame::FrameEncoder::new(sink)));
    let (mut chunker, receiver) = Chunker::new(crate::TARGET_DISK_LAYER_SIZE, make_compressor);

    let owned_path = disk_path.clone();
    let producer = std::thread::spawn(move || -> Result<()> {
        let mut file = std::fs::File::open(&owned_path)?;
        let mut buf = vec![0u8; 1024 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            chunker.write_all(&buf[..n])?;
        }
        chunker.close().map_err(Error::Core)?;
        Ok(())
    });

    let mut part = 0u32;
    for chunk in receiver {
        let mut annotations = HashMap::new();
        annotations.insert(crate::ANNOTATION_VETU_NAME.to_owned(), disk_name.to_owned());
        annotations.insert(crate::ANNOTATION_VETU_UNCOMPRESSED_SIZE.to_owned(), chunk.uncompressed_size.to_string());
        annotations.insert(crate::ANNOTATION_VETU_UNCOMPRESSED_DIGEST.to_owned(), chunk.uncompressed_digest.clone());

        let descriptor = Descriptor::of_with_annotations(crate::MEDIA_TYPE_VETU_DISK, &chunk.data, annotations);
        client.push_blob(&descriptor.digest, &chunk.data)?;
        manifest.push_layer(descriptor);
        part += 1;
    }
    tracing::debug!(disk = disk_name, parts = part, "pushed disk layers");

    producer.join().map_err(|_| Error::Manifest(format!("disk producer thread for {disk_name:?} panicked")))??;
    Ok(())
}
