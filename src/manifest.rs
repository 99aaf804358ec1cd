//! Ref resolution, manifest/index fetch, and policy evaluation: the thin
//! external-facing collaborator that turns an OCI reference into a
//! [`Facade`](crate::facade::Facade).
//!
//! Archive creation, manifest push, and credential acquisition live outside
//! this crate; `RegistryClient` is the seam a caller plugs a real registry
//! client into. Caching here follows the same shape as the rest of the
//! crate: a `DashMap` keyed by the cache's natural key, with concurrent
//! misses for the same key collapsed through [`crate::singleflight`]
//! instead of a dedicated async cache crate.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use oci_spec::distribution::Reference;
use oci_spec::image::ImageManifest;
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};
use crate::facade::{Facade, FacadeConfig};
use crate::index::Index;
use crate::prefetch::Sink;
use crate::singleflight::Group;
use crate::source::http::{self, HttpSourceConfig};

pub const ARTIFACT_TYPE: &str = "application/vnd.meigma.blob.v1";
pub const INDEX_MEDIA_TYPE: &str = "application/vnd.meigma.blob.index.v1+flatbuffers";
pub const DATA_MEDIA_TYPE: &str = "application/vnd.meigma.blob.data.v1";

#[derive(Clone, Debug)]
pub struct BlobDescriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// Capability seam for a registry client: reference resolution, content
/// fetch, and direct-blob URLs for constructing an HTTP byte source.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn resolve_ref(&self, reference: &Reference) -> Result<String>;
    async fn fetch_manifest(&self, reference: &Reference, digest: &str) -> Result<Bytes>;
    async fn fetch_blob(&self, reference: &Reference, digest: &str) -> Result<Bytes>;
    fn blob_url(&self, reference: &Reference, digest: &str) -> String;
    fn auth_headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

pub struct PolicyContext<'a> {
    pub reference: &'a Reference,
    pub digest: &'a str,
    pub manifest: &'a ImageManifest,
}

pub type PolicyFn = Arc<dyn Fn(&PolicyContext<'_>) -> Result<()> + Send + Sync>;

fn sha256_digest_matches(bytes: &[u8], digest: &str) -> bool {
    let Some(hex_part) = digest.strip_prefix("sha256:") else {
        return false;
    };
    let actual = hex::encode(Sha256::digest(bytes));
    actual == hex_part
}

/// Resolves references to manifests and indexes, applying ref/manifest/index
/// caches and a pluggable policy chain. One instance is typically shared
/// across many pulls against the same registry.
pub struct Resolver {
    client: Arc<dyn RegistryClient>,
    policies: Vec<PolicyFn>,
    ref_cache: DashMap<String, String>,
    manifest_cache: DashMap<String, Arc<ImageManifest>>,
    index_cache: DashMap<String, Arc<[u8]>>,
    ref_inflight: Group<String, String>,
    manifest_inflight: Group<String, Arc<ImageManifest>>,
    index_inflight: Group<String, Arc<[u8]>>,
}

impl Resolver {
    pub fn new(client: Arc<dyn RegistryClient>, policies: Vec<PolicyFn>) -> Self {
        Self {
            client,
            policies,
            ref_cache: DashMap::new(),
            manifest_cache: DashMap::new(),
            index_cache: DashMap::new(),
            ref_inflight: Group::new(),
            manifest_inflight: Group::new(),
            index_inflight: Group::new(),
        }
    }

    async fn resolve_digest(&self, reference: &Reference) -> Result<String> {
        if let Some(digest) = reference.digest() {
            return Ok(digest.to_string());
        }

        let key = reference.to_string();
        if let Some(digest) = self.ref_cache.get(&key) {
            tracing::debug!(reference = %key, "ref cache hit");
            return Ok(digest.clone());
        }

        let client = self.client.clone();
        let reference = reference.clone();
        let digest = self
            .ref_inflight
            .work(key.clone(), move || async move { client.resolve_ref(&reference).await })
            .await?;

        self.ref_cache.insert(key, digest.clone());
        Ok(digest)
    }

    async fn fetch_manifest(&self, reference: &Reference, digest: &str) -> Result<Arc<ImageManifest>> {
        if let Some(manifest) = self.manifest_cache.get(digest) {
            tracing::debug!(%digest, "manifest cache hit");
            return Ok(manifest.clone());
        }

        let client = self.client.clone();
        let reference_owned = reference.clone();
        let digest_owned = digest.to_string();
        let manifest = self
            .manifest_inflight
            .work(digest.to_string(), move || async move {
                let raw = client.fetch_manifest(&reference_owned, &digest_owned).await?;
                let manifest = ImageManifest::from_reader(&raw[..])
                    .map_err(|e| Error::Protocol(format!("invalid manifest: {e}")))?;
                Ok(Arc::new(manifest))
            })
            .await;

        let manifest = match manifest {
            Ok(m) => m,
            Err(e) => return Err(e),
        };

        if let Err(e) = self.apply_policies(reference, digest, &manifest) {
            self.manifest_cache.remove(digest);
            return Err(e);
        }

        self.manifest_cache.insert(digest.to_string(), manifest.clone());
        Ok(manifest)
    }

    fn apply_policies(&self, reference: &Reference, digest: &str, manifest: &ImageManifest) -> Result<()> {
        let ctx = PolicyContext {
            reference,
            digest,
            manifest,
        };
        for policy in &self.policies {
            policy(&ctx)?;
        }
        Ok(())
    }

    async fn fetch_index(&self, reference: &Reference, descriptor: &BlobDescriptor) -> Result<Arc<[u8]>> {
        if let Some(cached) = self.index_cache.get(&descriptor.digest) {
            if cached.len() as u64 == descriptor.size && sha256_digest_matches(&cached, &descriptor.digest) {
                tracing::debug!(digest = %descriptor.digest, "index cache hit");
                return Ok(cached.clone());
            }
            tracing::warn!(digest = %descriptor.digest, "index cache entry corrupt, evicting");
            self.index_cache.remove(&descriptor.digest);
        }

        let client = self.client.clone();
        let reference_owned = reference.clone();
        let descriptor_owned = descriptor.clone();
        let bytes = self
            .index_inflight
            .work(descriptor.digest.clone(), move || async move {
                let raw = client.fetch_blob(&reference_owned, &descriptor_owned.digest).await?;
                if raw.len() as u64 != descriptor_owned.size {
                    return Err(Error::Protocol(format!(
                        "index blob size mismatch: expected {}, got {}",
                        descriptor_owned.size,
                        raw.len()
                    )));
                }
                if !sha256_digest_matches(&raw, &descriptor_owned.digest) {
                    return Err(Error::HashMismatch {
                        path: "<index>".into(),
                        expected: descriptor_owned.digest.clone(),
                        actual: format!("sha256:{}", hex::encode(Sha256::digest(&raw))),
                    });
                }
                let arc: Arc<[u8]> = Arc::from(raw.to_vec());
                Ok(arc)
            })
            .await?;

        self.index_cache.insert(descriptor.digest.clone(), bytes.clone());
        Ok(bytes)
    }

    fn extract_descriptors(manifest: &ImageManifest) -> Result<(BlobDescriptor, BlobDescriptor)> {
        let mut index_desc = None;
        let mut data_desc = None;

        for layer in manifest.layers() {
            let media_type = layer.media_type().to_string();
            let desc = BlobDescriptor {
                media_type: media_type.clone(),
                digest: layer.digest().to_string(),
                size: layer.size() as u64,
            };
            if media_type == INDEX_MEDIA_TYPE {
                index_desc = Some(desc);
            } else if media_type == DATA_MEDIA_TYPE {
                data_desc = Some(desc);
            }
        }

        match (index_desc, data_desc) {
            (Some(index), Some(data)) => Ok((index, data)),
            _ => Err(Error::Protocol(
                "manifest missing required index and/or data layer".into(),
            )),
        }
    }

    /// Resolve a reference all the way to validated index bytes and a
    /// descriptor for the data blob.
    pub async fn resolve(&self, reference_str: &str) -> Result<(Arc<[u8]>, BlobDescriptor)> {
        let reference = Reference::from_str(reference_str)
            .map_err(|e| Error::PathInvalid(format!("invalid reference {reference_str}: {e}")))?;

        let digest = self.resolve_digest(&reference).await?;
        let manifest = self.fetch_manifest(&reference, &digest).await?;

        if let Some(artifact_type) = manifest.artifact_type()
            && artifact_type.to_string() != ARTIFACT_TYPE
        {
            return Err(Error::Protocol(format!(
                "unexpected artifact type {artifact_type}"
            )));
        }

        let (index_desc, data_desc) = Self::extract_descriptors(&manifest)?;
        let index_bytes = self.fetch_index(&reference, &index_desc).await?;

        Ok((index_bytes, data_desc))
    }

    /// Resolve `reference_str` and build a ready-to-use facade: fetches and
    /// validates the index, then opens an HTTP byte source over the
    /// registry's direct-blob URL for the data layer.
    pub async fn open_facade(
        &self,
        reference_str: &str,
        http_config: HttpSourceConfig,
        facade_config: FacadeConfig,
        cache: Sink,
    ) -> Result<Arc<Facade>> {
        let (index_bytes, data_desc) = self.resolve(reference_str).await?;
        let index = Index::parse(index_bytes)?;

        let reference = Reference::from_str(reference_str)
            .map_err(|e| Error::PathInvalid(format!("invalid reference {reference_str}: {e}")))?;
        let data_url = self.client.blob_url(&reference, &data_desc.digest);
        let source = http::connect(data_url, http_config).await?;

        Ok(Facade::new(index, source, cache, facade_config))
    }
}

/// A policy that always accepts; useful as a default when no policy chain
/// is configured.
pub fn allow_all() -> PolicyFn {
    Arc::new(|_ctx: &PolicyContext<'_>| Ok(()))
}
