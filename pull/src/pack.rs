//! Legacy image tarball assembly.
//!
//! Lays out the downloaded config and layers in the directory format the
//! `docker load` legacy loader expects, then bundles it into one tar:
//!
//! ```text
//! <output>.tar
//! ├── repositories                  repo → tag → top layer id
//! ├── manifest.json                 config path, repo tags, layer paths
//! ├── <config-digest-hex>.json      image config blob
//! └── <chain-id>/                   one directory per layer, in order
//!     ├── VERSION
//!     ├── json                      layer metadata (id, parent, created)
//!     └── layer.tar                 layer bytes exactly as fetched
//! ```
//!
//! Layer directory names are chain IDs: a digest over the layer's own
//! digest and its parent's chain ID, so identical content pulls to
//! identical IDs across runs.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;
use tempfile::TempDir;
use wharf_core::error::{PullError, Result};

use crate::blob::FetchedBlob;
use crate::digest::Digest;
use crate::manifest::ImageManifest;
use crate::reference::ImageReference;

/// Fixed timestamp for layer metadata, keeping repeated packs of the
/// same content byte-identical.
const LAYER_CREATED: &str = "1970-01-01T00:00:00Z";

/// Compute a layer's chain ID from its digest and its parent's chain ID.
///
/// The first layer's chain ID is the digest of its own digest string;
/// every later layer hashes `<parent chain id>\n<layer digest>`. The
/// chain makes a layer's on-disk identity depend on everything below it.
pub fn chain_id(parent: Option<&Digest>, layer_digest: &Digest) -> Digest {
    match parent {
        None => Digest::sha256_of(layer_digest.to_string().as_bytes()),
        Some(parent) => {
            Digest::sha256_of(format!("{}\n{}", parent, layer_digest).as_bytes())
        }
    }
}

/// One packed layer: content digest, computed chain ID, parent link.
#[derive(Debug, Clone)]
pub struct LayerEntry {
    pub digest: Digest,
    pub chain_id: Digest,
    pub parent: Option<Digest>,
}

/// The result of a successful pack.
#[derive(Debug)]
pub struct PackedImage {
    /// Path of the finished tarball
    pub path: PathBuf,
    /// Layers in manifest order, bottom to top
    pub layers: Vec<LayerEntry>,
    /// Rendered `manifest.json` content
    pub manifest_json: String,
    /// Rendered `repositories` content
    pub repositories_json: String,
}

impl PackedImage {
    /// The top-most layer, which the `repositories` file points at.
    pub fn top_layer(&self) -> Option<&LayerEntry> {
        self.layers.last()
    }
}

/// Assembles fetched blobs into a loadable image tarball.
pub struct ImagePacker<'a> {
    reference: &'a ImageReference,
}

impl<'a> ImagePacker<'a> {
    pub fn new(reference: &'a ImageReference) -> Self {
        Self { reference }
    }

    /// Pack `config` and `layers` (in manifest order) into a tar at
    /// `output_path`.
    ///
    /// Staging happens in a temp directory and the tar is written to a
    /// temp file promoted only on success, so a failure never leaves a
    /// partial tarball at `output_path`.
    pub fn pack(
        &self,
        manifest: &ImageManifest,
        config: &[u8],
        layers: &[FetchedBlob],
        output_path: &Path,
    ) -> Result<PackedImage> {
        if layers.len() != manifest.layers.len() {
            return Err(PullError::PackFailed(format!(
                "have {} layer blobs for {} manifest layers",
                layers.len(),
                manifest.layers.len()
            )));
        }
        for (blob, descriptor) in layers.iter().zip(&manifest.layers) {
            if descriptor.digest()? != *blob.digest() {
                return Err(PullError::PackFailed(format!(
                    "layer blob {} out of manifest order (expected {})",
                    blob.digest(),
                    descriptor.digest
                )));
            }
        }

        let staging = TempDir::new()
            .map_err(|e| PullError::PackFailed(format!("create staging directory: {}", e)))?;

        // Config blob at the top level, named by its digest.
        let config_digest = manifest.config.digest()?;
        let config_name = format!("{}.json", config_digest.hex());
        write_file(staging.path(), &config_name, config)?;

        // One directory per layer, named by chain ID.
        let mut entries: Vec<LayerEntry> = Vec::with_capacity(layers.len());
        for blob in layers {
            let parent = entries.last().map(|e| e.chain_id.clone());
            let id = chain_id(parent.as_ref(), blob.digest());

            let layer_dir = staging.path().join(id.hex());
            fs::create_dir(&layer_dir)
                .map_err(|e| PullError::PackFailed(format!("create layer directory: {}", e)))?;

            write_file(&layer_dir, "VERSION", b"1.0")?;
            write_file(&layer_dir, "json", layer_metadata(&id, parent.as_ref()).as_bytes())?;
            fs::copy(blob.path(), layer_dir.join("layer.tar")).map_err(|e| {
                PullError::PackFailed(format!("write layer {}: {}", blob.digest(), e))
            })?;

            entries.push(LayerEntry {
                digest: blob.digest().clone(),
                chain_id: id,
                parent,
            });
        }

        let manifest_json = self.render_manifest(&config_name, &entries);
        write_file(staging.path(), "manifest.json", manifest_json.as_bytes())?;

        let repositories_json = self.render_repositories(&entries);
        write_file(staging.path(), "repositories", repositories_json.as_bytes())?;

        let path = self.bundle(staging.path(), &config_name, &entries, output_path)?;

        tracing::info!(
            reference = %self.reference,
            layers = entries.len(),
            path = %path.display(),
            "Packed image tarball"
        );

        Ok(PackedImage {
            path,
            layers: entries,
            manifest_json,
            repositories_json,
        })
    }

    /// `manifest.json`: one entry, layer paths in manifest order.
    fn render_manifest(&self, config_name: &str, entries: &[LayerEntry]) -> String {
        let layer_paths: Vec<String> = entries
            .iter()
            .map(|e| format!("{}/layer.tar", e.chain_id.hex()))
            .collect();

        json!([{
            "Config": config_name,
            "RepoTags": [self.reference.repo_tag()],
            "Layers": layer_paths,
        }])
        .to_string()
    }

    /// `repositories`: repository → tag → top layer chain ID.
    fn render_repositories(&self, entries: &[LayerEntry]) -> String {
        let top = entries
            .last()
            .map(|e| e.chain_id.hex().to_string())
            .unwrap_or_default();

        let mut tags = serde_json::Map::new();
        tags.insert(self.reference.output_tag(), json!(top));

        let mut repos = serde_json::Map::new();
        repos.insert(
            self.reference.repository.clone(),
            serde_json::Value::Object(tags),
        );

        serde_json::Value::Object(repos).to_string()
    }

    /// Bundle the staging tree into a tar at `output_path`, entries in a
    /// fixed order.
    fn bundle(
        &self,
        staging: &Path,
        config_name: &str,
        entries: &[LayerEntry],
        output_path: &Path,
    ) -> Result<PathBuf> {
        let parent = match output_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)
            .map_err(|e| PullError::PackFailed(format!("create output directory: {}", e)))?;

        let tar_file = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| PullError::PackFailed(format!("create output temp file: {}", e)))?;

        let mut builder = tar::Builder::new(tar_file);

        let mut append = |name: &str| -> Result<()> {
            builder
                .append_path_with_name(staging.join(name), name)
                .map_err(|e| PullError::PackFailed(format!("tar entry {}: {}", name, e)))
        };

        append("repositories")?;
        append("manifest.json")?;
        append(config_name)?;
        for entry in entries {
            let dir = entry.chain_id.hex();
            append(&format!("{}/VERSION", dir))?;
            append(&format!("{}/json", dir))?;
            append(&format!("{}/layer.tar", dir))?;
        }

        let tar_file = builder
            .into_inner()
            .map_err(|e| PullError::PackFailed(format!("finish tar: {}", e)))?;

        tar_file
            .persist(output_path)
            .map_err(|e| PullError::PackFailed(format!("move tarball into place: {}", e)))?;

        Ok(output_path.to_path_buf())
    }
}

/// Per-layer `json` metadata in the legacy loader's shape.
fn layer_metadata(id: &Digest, parent: Option<&Digest>) -> String {
    let mut meta = json!({
        "id": id.hex(),
        "created": LAYER_CREATED,
        "container_config": {
            "Hostname": "",
            "Domainname": "",
            "User": "",
            "AttachStdin": false,
            "AttachStdout": false,
            "AttachStderr": false,
            "Tty": false,
            "OpenStdin": false,
            "StdinOnce": false,
            "Env": null,
            "Cmd": null,
            "Image": "",
            "Volumes": null,
            "WorkingDir": "",
            "Entrypoint": null,
            "OnBuild": null,
            "Labels": null,
        },
    });
    if let Some(parent) = parent {
        meta["parent"] = json!(parent.hex());
    }
    meta.to_string()
}

fn write_file(dir: &Path, name: &str, content: &[u8]) -> Result<()> {
    fs::write(dir.join(name), content)
        .map_err(|e| PullError::PackFailed(format!("write {}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Descriptor;
    use std::io::{Read, Write};
    use tempfile::NamedTempFile;

    fn blob_from(bytes: &[u8]) -> FetchedBlob {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        FetchedBlob::from_parts(Digest::sha256_of(bytes), file).unwrap()
    }

    /// A gzipped tar with one file, the way real layers arrive.
    fn gzipped_layer(name: &str, content: &[u8]) -> Vec<u8> {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, content).unwrap();

        builder.into_inner().unwrap().finish().unwrap()
    }

    fn manifest_for(config: &[u8], layers: &[&FetchedBlob]) -> ImageManifest {
        ImageManifest {
            schema_version: 2,
            media_type: Some(crate::manifest::DOCKER_MANIFEST_V2.to_string()),
            config: Descriptor {
                media_type: "application/vnd.docker.container.image.v1+json".to_string(),
                digest: Digest::sha256_of(config).to_string(),
                size: Some(config.len() as u64),
            },
            layers: layers
                .iter()
                .map(|blob| Descriptor {
                    media_type: "application/vnd.docker.image.rootfs.diff.tar.gzip".to_string(),
                    digest: blob.digest().to_string(),
                    size: Some(blob.size()),
                })
                .collect(),
        }
    }

    fn reference() -> ImageReference {
        ImageReference::parse("registry.example.com/lib/app:1.0").unwrap()
    }

    #[test]
    fn test_chain_id_first_layer_is_hash_of_digest() {
        let l1 = Digest::sha256_of(b"layer-1");
        let c1 = chain_id(None, &l1);
        assert_eq!(c1, Digest::sha256_of(l1.to_string().as_bytes()));
    }

    #[test]
    fn test_chain_id_links_through_parent() {
        let l1 = Digest::sha256_of(b"layer-1");
        let l2 = Digest::sha256_of(b"layer-2");
        let l3 = Digest::sha256_of(b"layer-3");

        let c1 = chain_id(None, &l1);
        let c2 = chain_id(Some(&c1), &l2);
        let c3 = chain_id(Some(&c2), &l3);

        assert_eq!(
            c2,
            Digest::sha256_of(format!("{}\n{}", c1, l2).as_bytes())
        );
        assert_eq!(
            c3,
            Digest::sha256_of(format!("{}\n{}", c2, l3).as_bytes())
        );
        assert_ne!(c1, c2);
        assert_ne!(c2, c3);
    }

    #[test]
    fn test_chain_id_depends_on_parent() {
        let layer = Digest::sha256_of(b"layer");
        let parent_a = Digest::sha256_of(b"parent-a");
        let parent_b = Digest::sha256_of(b"parent-b");
        assert_ne!(
            chain_id(Some(&parent_a), &layer),
            chain_id(Some(&parent_b), &layer)
        );
    }

    #[test]
    fn test_pack_layout_and_ordering() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("app.tar");

        let config = br#"{"architecture":"amd64","os":"linux"}"#;
        let layer1 = blob_from(&gzipped_layer("bin/app", b"binary"));
        let layer2 = blob_from(&gzipped_layer("etc/app.conf", b"config"));
        let manifest = manifest_for(config, &[&layer1, &layer2]);

        let reference = reference();
        let packed = ImagePacker::new(&reference)
            .pack(&manifest, config, &[layer1, layer2], &output)
            .unwrap();

        assert_eq!(packed.path, output);
        assert_eq!(packed.layers.len(), 2);
        assert_eq!(packed.layers[0].parent, None);
        assert_eq!(
            packed.layers[1].parent.as_ref(),
            Some(&packed.layers[0].chain_id)
        );

        // Walk the tar and collect entry names in order.
        let mut archive = tar::Archive::new(std::fs::File::open(&output).unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();

        assert_eq!(names[0], "repositories");
        assert_eq!(names[1], "manifest.json");
        assert!(names[2].ends_with(".json"));
        assert!(names.contains(&format!("{}/layer.tar", packed.layers[0].chain_id.hex())));
        assert!(names.contains(&format!("{}/layer.tar", packed.layers[1].chain_id.hex())));
    }

    #[test]
    fn test_pack_manifest_lists_layers_in_order() {
        let dir = TempDir::new().unwrap();
        let config = b"{}";
        let layer1 = blob_from(b"first layer bytes");
        let layer2 = blob_from(b"second layer bytes");
        let manifest = manifest_for(config, &[&layer1, &layer2]);

        let reference = reference();
        let packed = ImagePacker::new(&reference)
            .pack(&manifest, config, &[layer1, layer2], &dir.path().join("out.tar"))
            .unwrap();

        let rendered: serde_json::Value = serde_json::from_str(&packed.manifest_json).unwrap();
        let layers = rendered[0]["Layers"].as_array().unwrap();
        assert_eq!(
            layers[0],
            json!(format!("{}/layer.tar", packed.layers[0].chain_id.hex()))
        );
        assert_eq!(
            layers[1],
            json!(format!("{}/layer.tar", packed.layers[1].chain_id.hex()))
        );
        assert_eq!(rendered[0]["RepoTags"][0], "lib/app:1.0");
    }

    #[test]
    fn test_pack_repositories_maps_top_layer() {
        let dir = TempDir::new().unwrap();
        let config = b"{}";
        let layer1 = blob_from(b"first layer bytes");
        let layer2 = blob_from(b"second layer bytes");
        let manifest = manifest_for(config, &[&layer1, &layer2]);

        let reference = reference();
        let packed = ImagePacker::new(&reference)
            .pack(&manifest, config, &[layer1, layer2], &dir.path().join("out.tar"))
            .unwrap();

        let repos: serde_json::Value = serde_json::from_str(&packed.repositories_json).unwrap();
        assert_eq!(
            repos["lib/app"]["1.0"],
            json!(packed.top_layer().unwrap().chain_id.hex())
        );
    }

    #[test]
    fn test_pack_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let config = br#"{"os":"linux"}"#;
        let layer_bytes = gzipped_layer("app", b"same content");
        let reference = reference();

        let mut outputs = Vec::new();
        for name in ["a.tar", "b.tar"] {
            let layer = blob_from(&layer_bytes);
            let manifest = manifest_for(config, &[&layer]);
            let packed = ImagePacker::new(&reference)
                .pack(&manifest, config, &[layer], &dir.path().join(name))
                .unwrap();
            outputs.push(packed);
        }

        assert_eq!(outputs[0].manifest_json, outputs[1].manifest_json);
        assert_eq!(outputs[0].repositories_json, outputs[1].repositories_json);
        assert_eq!(outputs[0].layers[0].chain_id, outputs[1].layers[0].chain_id);
    }

    #[test]
    fn test_pack_rejects_layer_count_mismatch() {
        let dir = TempDir::new().unwrap();
        let config = b"{}";
        let layer1 = blob_from(b"first");
        let layer2 = blob_from(b"second");
        let manifest = manifest_for(config, &[&layer1, &layer2]);

        let reference = reference();
        let err = ImagePacker::new(&reference)
            .pack(&manifest, config, &[layer1], &dir.path().join("out.tar"))
            .unwrap_err();
        assert!(matches!(err, PullError::PackFailed(_)));
    }

    #[test]
    fn test_pack_rejects_out_of_order_layers() {
        let dir = TempDir::new().unwrap();
        let config = b"{}";
        let layer1 = blob_from(b"first");
        let layer2 = blob_from(b"second");
        let manifest = manifest_for(config, &[&layer1, &layer2]);

        let reference = reference();
        let err = ImagePacker::new(&reference)
            .pack(&manifest, config, &[layer2, layer1], &dir.path().join("out.tar"))
            .unwrap_err();
        assert!(matches!(err, PullError::PackFailed(_)));
    }

    #[test]
    fn test_pack_layer_content_preserved_verbatim() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.tar");
        let config = b"{}";
        let layer_bytes = gzipped_layer("app", b"payload");
        let layer = blob_from(&layer_bytes);
        let manifest = manifest_for(config, &[&layer]);

        let reference = reference();
        let packed = ImagePacker::new(&reference)
            .pack(&manifest, config, &[layer], &output)
            .unwrap();

        let layer_path = format!("{}/layer.tar", packed.layers[0].chain_id.hex());
        let mut archive = tar::Archive::new(std::fs::File::open(&output).unwrap());
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().display().to_string() == layer_path {
                let mut content = Vec::new();
                entry.read_to_end(&mut content).unwrap();
                assert_eq!(content, layer_bytes, "layer bytes must not be recompressed");
                return;
            }
        }
        panic!("layer entry missing from tar");
    }
}
