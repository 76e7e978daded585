// SPDX-License-Identifier: Apache-2.0
//! Derived-artifact cache (component G): content-addressed, single-flight
//! generation of derived products, keyed by a fingerprint over the request
//! that produced them rather than by the products themselves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{info, instrument};

use crate::codec::{self, encode_fingerprint_array, sha256_hex, CanonicalEncode, CanonicalMap, CanonicalValue};
use crate::ident::ProductInstanceId;
use crate::kv::{KvStore, StorageFault};
use crate::stream::StreamIdentity;

/// Identifies the generator that produced a derived artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratorIdentity {
    /// Stable generator name.
    pub id: String,
    /// Generator version string.
    pub version: String,
}

/// Whether a manifest's payload bytes live next to it or are addressed
/// separately. `InputFingerprint`/`ContentHash` never depend on this choice
/// (`spec.md` §4.G, "Storage-mode independence").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageMode {
    /// The payload is embedded in the manifest record.
    Inline,
    /// The payload is stored at the stream's derived-payload key.
    External,
}

/// Describes where and how a manifest's payload bytes are held.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageDescriptor {
    /// Inline vs. external payload placement.
    pub mode: StorageMode,
    /// Lowercase-hex `SHA256(payload)`, verified on every read.
    pub content_hash: String,
    /// Payload length in bytes.
    pub content_length: u64,
    /// The payload itself, present iff `mode == Inline`.
    pub inline: Option<Vec<u8>>,
}

/// The persisted record describing one cached derived artifact
/// (`spec.md` §4.G).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    /// The kind of derived product this manifest describes.
    pub product_type: String,
    /// Lowercase-hex fingerprint keying this cache entry.
    pub input_fingerprint: String,
    /// The truth stream this artifact was derived from.
    pub source_stream: String,
    /// The truth sequence this artifact was derived at.
    pub boundary_sequence: u64,
    /// The generator that produced this artifact.
    pub generator: GeneratorIdentity,
    /// Lowercase-hex hash of the generator's input parameters.
    pub params_hash: String,
    /// Where and how the payload is stored.
    pub storage: StorageDescriptor,
    /// Hash of the topology stream at generation time, used by
    /// [`DerivedArtifactCache::invalidate_on_topology_change`].
    pub topology_stream_hash: String,
}

impl CanonicalEncode for Manifest {
    #[allow(clippy::expect_used)] // field names below are distinct string literals, never collide
    fn to_canonical(&self) -> CanonicalValue {
        let mut map = CanonicalMap::new();
        let insert = |m: &mut CanonicalMap, k: &str, v: CanonicalValue| {
            m.insert(k, v).expect("manifest fields are distinct");
        };
        insert(&mut map, "product_type", CanonicalValue::Str(self.product_type.clone()));
        insert(
            &mut map,
            "input_fingerprint",
            CanonicalValue::Str(self.input_fingerprint.clone()),
        );
        insert(&mut map, "source_stream", CanonicalValue::Str(self.source_stream.clone()));
        insert(&mut map, "boundary_sequence", CanonicalValue::UInt(self.boundary_sequence));
        insert(&mut map, "generator_id", CanonicalValue::Str(self.generator.id.clone()));
        insert(
            &mut map,
            "generator_version",
            CanonicalValue::Str(self.generator.version.clone()),
        );
        insert(&mut map, "params_hash", CanonicalValue::Str(self.params_hash.clone()));
        insert(
            &mut map,
            "storage_mode",
            CanonicalValue::Str(
                match self.storage.mode {
                    StorageMode::Inline => "Inline",
                    StorageMode::External => "External",
                }
                .to_string(),
            ),
        );
        insert(
            &mut map,
            "content_hash",
            CanonicalValue::Str(self.storage.content_hash.clone()),
        );
        insert(
            &mut map,
            "content_length",
            CanonicalValue::UInt(self.storage.content_length),
        );
        insert(
            &mut map,
            "inline",
            self.storage
                .inline
                .as_ref()
                .map_or(CanonicalValue::Nil, |b| CanonicalValue::Bytes(b.clone())),
        );
        insert(
            &mut map,
            "topology_stream_hash",
            CanonicalValue::Str(self.topology_stream_hash.clone()),
        );
        CanonicalValue::Map(map)
    }
}

fn decode_manifest(canonical: &CanonicalValue) -> Option<Manifest> {
    let map = canonical.as_map()?;
    let s = |k: &str| map.get(k).and_then(CanonicalValue::as_str).map(str::to_string);
    let u = |k: &str| map.get(k).and_then(CanonicalValue::as_uint);
    let mode = match map.get("storage_mode").and_then(CanonicalValue::as_str)? {
        "Inline" => StorageMode::Inline,
        "External" => StorageMode::External,
        _ => return None,
    };
    let inline = match map.get("inline") {
        Some(CanonicalValue::Bytes(b)) => Some(b.clone()),
        _ => None,
    };
    Some(Manifest {
        product_type: s("product_type")?,
        input_fingerprint: s("input_fingerprint")?,
        source_stream: s("source_stream")?,
        boundary_sequence: u("boundary_sequence")?,
        generator: GeneratorIdentity {
            id: s("generator_id")?,
            version: s("generator_version")?,
        },
        params_hash: s("params_hash")?,
        storage: StorageDescriptor {
            mode,
            content_hash: s("content_hash")?,
            content_length: u("content_length")?,
            inline,
        },
        topology_stream_hash: s("topology_stream_hash")?,
    })
}

/// A fully-specified cache lookup/generation request.
pub struct CacheKey<'a> {
    /// The truth stream this artifact is derived from.
    pub stream: &'a StreamIdentity,
    /// The kind of derived product requested.
    pub product_type: &'a str,
    /// The truth sequence the artifact is derived at.
    pub last_sequence: u64,
    /// The generator's stable name.
    pub generator_id: &'a str,
    /// The generator's version string.
    pub generator_version: &'a str,
    /// Generator parameters, folded into `ParamsHash` via the canonical codec.
    pub params: CanonicalValue,
    /// The current topology stream hash, recorded for later invalidation.
    pub topology_stream_hash: &'a str,
}

impl CacheKey<'_> {
    fn fingerprint(&self) -> Result<String, CacheError> {
        let params_hash = sha256_hex(
            &codec::encode_canonical(&self.params).map_err(|e| CacheError::Encode(e.to_string()))?,
        );
        let fields = [
            CanonicalValue::Str(self.stream.stream_key()),
            CanonicalValue::Str(self.product_type.to_string()),
            CanonicalValue::UInt(self.last_sequence),
            CanonicalValue::Str(self.generator_id.to_string()),
            CanonicalValue::Str(self.generator_version.to_string()),
            CanonicalValue::Str(params_hash),
        ];
        let bytes = encode_fingerprint_array(fields).map_err(|e| CacheError::Encode(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

/// Context handed to a generator on a cache miss.
pub struct ArtifactGenerationContext<'a> {
    /// The truth stream being derived from.
    pub stream: &'a StreamIdentity,
    /// The truth sequence to derive at.
    pub last_sequence: u64,
    /// This request's fingerprint, for the generator's own logging.
    pub input_fingerprint: &'a str,
}

/// Errors a generator may raise while producing a derived artifact.
#[derive(Debug, thiserror::Error)]
#[error("artifact generation failed: {0}")]
pub struct GenerationFailure(pub String);

/// Implemented by a product-specific derived-artifact generator.
pub trait ArtifactGenerator {
    /// The in-memory type this generator produces.
    type Output;

    /// Computes `Output` for `ctx`, on a cache miss.
    ///
    /// # Errors
    ///
    /// Returns [`GenerationFailure`] if generation fails.
    fn generate(&self, ctx: &ArtifactGenerationContext<'_>) -> Result<Self::Output, GenerationFailure>;

    /// Serializes `output` to the bytes stored as its payload.
    fn serialize(&self, output: &Self::Output) -> Vec<u8>;

    /// Deserializes payload bytes previously written by [`Self::serialize`].
    ///
    /// # Errors
    ///
    /// Returns [`GenerationFailure`] if `bytes` cannot be deserialized.
    fn deserialize(&self, bytes: &[u8]) -> Result<Self::Output, GenerationFailure>;
}

/// Metadata tying a derived product to its source truth, generator, and
/// policy. Every cache hit returns one; producing a derived product without
/// provenance is a contract violation (`spec.md` §4.G).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivedProductProvenance {
    /// Unique identifier for this computed instance.
    pub product_instance_id: ProductInstanceId,
    /// The kind of derived product.
    pub product_type: String,
    /// Hashes of the truth this product was derived from.
    pub source_truth_hashes: Vec<String>,
    /// Hash of the reconstruction policy applied, if any.
    pub policy_hash: Option<String>,
    /// The generator's stable name.
    pub generator_id: String,
    /// The generator's version string.
    pub generator_version: String,
    /// Unix epoch milliseconds when this instance was computed.
    pub computed_at_unix_ms: u64,
    /// Wall-clock milliseconds the generation took; `0` on a cache hit.
    pub computation_time_ms: u64,
}

impl DerivedProductProvenance {
    /// The fixed disclaimer every derived product's provenance carries.
    pub const DISCLAIMER: &'static str = "derived, not truth";
}

/// Why a set of cache entries was invalidated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvalidationReason {
    /// The topology stream's content hash changed.
    TopologyChanged,
    /// A kinematics model was updated.
    KinematicsChanged,
    /// A single product instance was explicitly invalidated.
    Explicit,
    /// The entire cache was cleared.
    Cleared,
}

/// Delivered to subscribers whenever cache entries are invalidated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidationEvent {
    /// Why the invalidation happened.
    pub reason: InvalidationReason,
    /// The new topology stream hash, if `reason == TopologyChanged`.
    pub topology_stream_hash: Option<String>,
    /// The affected kinematics model id, if `reason == KinematicsChanged`.
    pub kinematics_model_id: Option<String>,
}

/// A subscriber callback for [`InvalidationEvent`]s.
pub type InvalidationSubscriber = Box<dyn Fn(&InvalidationEvent) + Send + Sync>;

/// Errors raised by [`DerivedArtifactCache`] operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Canonical encoding of the request or manifest failed.
    #[error("cache key encoding failed: {0}")]
    Encode(String),
    /// A stored manifest's `ContentHash` did not match its payload.
    #[error("content hash mismatch for fingerprint {0}")]
    ContentHashMismatch(String),
    /// A stored manifest or payload could not be decoded.
    #[error("malformed cache entry: {0}")]
    Malformed(String),
    /// The generator failed to produce or deserialize an artifact.
    #[error(transparent)]
    Generation(#[from] GenerationFailure),
    /// The underlying key-value substrate failed.
    #[error(transparent)]
    StorageFault(#[from] StorageFault),
}

/// The derived-artifact cache (component G): single-flight generation,
/// content-addressed storage, and hash/model-driven invalidation.
pub struct DerivedArtifactCache {
    kv: Arc<dyn KvStore>,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    subscribers: Mutex<Vec<InvalidationSubscriber>>,
}

impl DerivedArtifactCache {
    /// Builds a cache over `kv`.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            in_flight: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a callback invoked synchronously on every invalidation.
    pub fn subscribe(&self, subscriber: InvalidationSubscriber) {
        self.subscribers.lock().push(subscriber);
    }

    fn notify(&self, event: &InvalidationEvent) {
        for subscriber in self.subscribers.lock().iter() {
            subscriber(event);
        }
    }

    fn fingerprint_lock(&self, fingerprint: &str) -> Arc<Mutex<()>> {
        self.in_flight
            .lock()
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Returns the generator's output for `key`, from cache if present, or by
    /// invoking `generator` under a per-fingerprint single-flight lock on a
    /// miss (`spec.md` §5: at most one generator runs per fingerprint at a
    /// time; concurrent waiters observe its result or its error once it
    /// completes).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if encoding the key fails, the stored content
    /// hash does not match the payload, or generation/storage fails.
    #[instrument(skip(self, generator), fields(product_type = %key.product_type))]
    pub fn get_or_compute<G: ArtifactGenerator>(
        &self,
        key: CacheKey<'_>,
        generator: &G,
    ) -> Result<(G::Output, DerivedProductProvenance), CacheError> {
        let fingerprint = key.fingerprint()?;
        let manifest_key = key.stream.derived_manifest_key(key.product_type, &fingerprint);
        let payload_key = key.stream.derived_payload_key(key.product_type, &fingerprint);

        if let Some((output, manifest)) = self.try_read(&manifest_key, &payload_key, generator)? {
            return Ok((
                output,
                provenance_for(&manifest, 0),
            ));
        }

        let lock = self.fingerprint_lock(&fingerprint);
        let _guard = lock.lock();

        // Re-check under the per-fingerprint lock: another caller may have
        // populated the entry while we were waiting.
        if let Some((output, manifest)) = self.try_read(&manifest_key, &payload_key, generator)? {
            return Ok((output, provenance_for(&manifest, 0)));
        }

        let started = Instant::now();
        let ctx = ArtifactGenerationContext {
            stream: key.stream,
            last_sequence: key.last_sequence,
            input_fingerprint: &fingerprint,
        };
        let output = generator.generate(&ctx)?;
        let payload = generator.serialize(&output);
        let content_hash = sha256_hex(&payload);
        let params_hash = sha256_hex(
            &codec::encode_canonical(&key.params).map_err(|e| CacheError::Encode(e.to_string()))?,
        );

        let manifest = Manifest {
            product_type: key.product_type.to_string(),
            input_fingerprint: fingerprint.clone(),
            source_stream: key.stream.stream_key(),
            boundary_sequence: key.last_sequence,
            generator: GeneratorIdentity {
                id: key.generator_id.to_string(),
                version: key.generator_version.to_string(),
            },
            params_hash,
            storage: StorageDescriptor {
                mode: StorageMode::External,
                content_hash,
                content_length: u64::try_from(payload.len()).unwrap_or(u64::MAX),
                inline: None,
            },
            topology_stream_hash: key.topology_stream_hash.to_string(),
        };

        let manifest_bytes = codec::encode_canonical(&manifest.to_canonical())
            .map_err(|e| CacheError::Encode(e.to_string()))?;
        let mut batch = crate::kv::WriteBatch::new();
        batch.put(payload_key, payload);
        batch.put(manifest_key, manifest_bytes);
        self.kv.write_batch(batch)?;

        info!(fingerprint = %fingerprint, "derived artifact cache miss computed");
        let computation_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok((output, provenance_for(&manifest, computation_time_ms)))
    }

    fn try_read<G: ArtifactGenerator>(
        &self,
        manifest_key: &[u8],
        payload_key: &[u8],
        generator: &G,
    ) -> Result<Option<(G::Output, Manifest)>, CacheError> {
        let Some(manifest_bytes) = self.kv.get(manifest_key)? else {
            return Ok(None);
        };
        let canonical = codec::decode_canonical(&manifest_bytes)
            .map_err(|e| CacheError::Malformed(e.to_string()))?;
        let manifest =
            decode_manifest(&canonical).ok_or_else(|| CacheError::Malformed("manifest shape".into()))?;

        let payload = match (&manifest.storage.mode, &manifest.storage.inline) {
            (StorageMode::Inline, Some(bytes)) => bytes.clone(),
            (StorageMode::Inline, None) => {
                return Err(CacheError::Malformed("inline manifest missing payload".into()))
            }
            (StorageMode::External, _) => self
                .kv
                .get(payload_key)?
                .ok_or_else(|| CacheError::Malformed("external payload missing".into()))?,
        };
        let actual_hash = sha256_hex(&payload);
        if actual_hash != manifest.storage.content_hash {
            return Err(CacheError::ContentHashMismatch(manifest.input_fingerprint.clone()));
        }
        let output = generator.deserialize(&payload)?;
        Ok(Some((output, manifest)))
    }

    /// Removes every manifest under `stream` whose recorded topology stream
    /// hash does not equal `topology_stream_hash` (the current truth hash),
    /// notifying subscribers once.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if scanning or deleting fails.
    pub fn invalidate_on_topology_change(
        &self,
        stream: &StreamIdentity,
        topology_stream_hash: &str,
    ) -> Result<(), CacheError> {
        self.retain_manifests(stream, |m| m.topology_stream_hash == topology_stream_hash)?;
        self.notify(&InvalidationEvent {
            reason: InvalidationReason::TopologyChanged,
            topology_stream_hash: Some(topology_stream_hash.to_string()),
            kinematics_model_id: None,
        });
        Ok(())
    }

    /// Removes every manifest under `stream` whose generator id equals
    /// `model_id`, notifying subscribers once.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if scanning or deleting fails.
    pub fn invalidate_on_kinematics_change(
        &self,
        stream: &StreamIdentity,
        model_id: &str,
    ) -> Result<(), CacheError> {
        self.retain_manifests(stream, |m| m.generator.id != model_id)?;
        self.notify(&InvalidationEvent {
            reason: InvalidationReason::KinematicsChanged,
            topology_stream_hash: None,
            kinematics_model_id: Some(model_id.to_string()),
        });
        Ok(())
    }

    /// Removes the single manifest for `(stream, product_type, fingerprint)`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the delete fails.
    pub fn invalidate(
        &self,
        stream: &StreamIdentity,
        product_type: &str,
        fingerprint: &str,
    ) -> Result<(), CacheError> {
        let manifest_key = stream.derived_manifest_key(product_type, fingerprint);
        let payload_key = stream.derived_payload_key(product_type, fingerprint);
        self.kv.delete(&manifest_key)?;
        self.kv.delete(&payload_key)?;
        self.notify(&InvalidationEvent {
            reason: InvalidationReason::Explicit,
            topology_stream_hash: None,
            kinematics_model_id: None,
        });
        Ok(())
    }

    /// Removes every cache entry under `stream`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if scanning or deleting fails.
    pub fn clear(&self, stream: &StreamIdentity) -> Result<(), CacheError> {
        self.retain_manifests(stream, |_| false)?;
        self.notify(&InvalidationEvent {
            reason: InvalidationReason::Cleared,
            topology_stream_hash: None,
            kinematics_model_id: None,
        });
        Ok(())
    }

    /// Deletes every manifest (and its payload, if external) under `stream`
    /// for which `keep` returns `false`.
    fn retain_manifests(
        &self,
        stream: &StreamIdentity,
        keep: impl Fn(&Manifest) -> bool,
    ) -> Result<(), CacheError> {
        let prefix = stream.derived_prefix();
        let mut to_delete = Vec::new();
        for (key, value) in self.kv.iter_from(&prefix)? {
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            if !key.ends_with(b":Manifest") {
                continue;
            }
            let Ok(canonical) = codec::decode_canonical(&value) else {
                continue;
            };
            let Some(manifest) = decode_manifest(&canonical) else {
                continue;
            };
            if !keep(&manifest) {
                let payload_key = stream.derived_payload_key(&manifest.product_type, &manifest.input_fingerprint);
                to_delete.push((key, payload_key));
            }
        }
        for (manifest_key, payload_key) in to_delete {
            self.kv.delete(&manifest_key)?;
            self.kv.delete(&payload_key)?;
        }
        Ok(())
    }

    /// Lazily enumerates every stored key under `prefix`, for admin/eviction
    /// tooling (`spec.md` §4.G).
    ///
    /// # Errors
    ///
    /// Returns [`StorageFault`] if the backend failed to scan.
    pub fn enumerate_keys(
        &self,
        prefix: &[u8],
    ) -> Result<Box<dyn Iterator<Item = Vec<u8>> + '_>, StorageFault> {
        let owned_prefix = prefix.to_vec();
        let iter = self
            .kv
            .iter_from(prefix)?
            .take_while(move |(k, _)| k.starts_with(&owned_prefix))
            .map(|(k, _)| k);
        Ok(Box::new(iter))
    }
}

fn provenance_for(manifest: &Manifest, computation_time_ms: u64) -> DerivedProductProvenance {
    let computed_at_unix_ms = u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0),
    )
    .unwrap_or(u64::MAX);
    DerivedProductProvenance {
        product_instance_id: ProductInstanceId::from_rng(&mut crate::ident::seed_rng(&[
            manifest.input_fingerprint.as_bytes(),
            manifest.source_stream.as_bytes(),
        ])),
        product_type: manifest.product_type.clone(),
        source_truth_hashes: vec![manifest.topology_stream_hash.clone()],
        policy_hash: None,
        generator_id: manifest.generator.id.clone(),
        generator_version: manifest.generator.version.clone(),
        computed_at_unix_ms,
        computation_time_ms,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_stream() -> StreamIdentity {
        StreamIdentity::new("V1", "main", 0, "geo.plates", "0").unwrap()
    }

    struct CountingGenerator {
        calls: AtomicU32,
    }

    impl ArtifactGenerator for CountingGenerator {
        type Output = String;

        fn generate(&self, ctx: &ArtifactGenerationContext<'_>) -> Result<Self::Output, GenerationFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("computed-at-{}", ctx.last_sequence))
        }

        fn serialize(&self, output: &Self::Output) -> Vec<u8> {
            output.as_bytes().to_vec()
        }

        fn deserialize(&self, bytes: &[u8]) -> Result<Self::Output, GenerationFailure> {
            String::from_utf8(bytes.to_vec()).map_err(|e| GenerationFailure(e.to_string()))
        }
    }

    fn key<'a>(stream: &'a StreamIdentity) -> CacheKey<'a> {
        CacheKey {
            stream,
            product_type: "TopologySnapshot",
            last_sequence: 7,
            generator_id: "snapshotter",
            generator_version: "1.0.0",
            params: CanonicalValue::Map(CanonicalMap::new()),
            topology_stream_hash: "deadbeef",
        }
    }

    // ── 1. miss computes, writes manifest + payload ──────────────────────

    #[test]
    fn miss_computes_and_persists() {
        let cache = DerivedArtifactCache::new(Arc::new(MemoryKv::new()));
        let stream = test_stream();
        let generator = CountingGenerator { calls: AtomicU32::new(0) };
        let (output, provenance) = cache.get_or_compute(key(&stream), &generator).unwrap();
        assert_eq!(output, "computed-at-7");
        assert_eq!(provenance.generator_id, "snapshotter");
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    // ── 2. hit does not re-invoke the generator ───────────────────────────

    #[test]
    fn hit_reuses_cached_payload() {
        let cache = DerivedArtifactCache::new(Arc::new(MemoryKv::new()));
        let stream = test_stream();
        let generator = CountingGenerator { calls: AtomicU32::new(0) };
        cache.get_or_compute(key(&stream), &generator).unwrap();
        let (output, _) = cache.get_or_compute(key(&stream), &generator).unwrap();
        assert_eq!(output, "computed-at-7");
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    // ── 3. distinct params yield distinct fingerprints (distinct entries) ─

    #[test]
    fn distinct_params_do_not_collide() {
        let cache = DerivedArtifactCache::new(Arc::new(MemoryKv::new()));
        let stream = test_stream();
        let generator = CountingGenerator { calls: AtomicU32::new(0) };
        let mut k1 = key(&stream);
        let mut p1 = CanonicalMap::new();
        p1.insert("resolution", CanonicalValue::UInt(1)).unwrap();
        k1.params = CanonicalValue::Map(p1);
        let mut k2 = key(&stream);
        let mut p2 = CanonicalMap::new();
        p2.insert("resolution", CanonicalValue::UInt(2)).unwrap();
        k2.params = CanonicalValue::Map(p2);
        cache.get_or_compute(k1, &generator).unwrap();
        cache.get_or_compute(k2, &generator).unwrap();
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    // ── 4. invalidate_on_topology_change removes stale manifests ─────────

    #[test]
    fn invalidate_on_topology_change_removes_entry() {
        let cache = DerivedArtifactCache::new(Arc::new(MemoryKv::new()));
        let stream = test_stream();
        let generator = CountingGenerator { calls: AtomicU32::new(0) };
        cache.get_or_compute(key(&stream), &generator).unwrap();
        cache.invalidate_on_topology_change(&stream, "freshhash").unwrap();
        cache.get_or_compute(key(&stream), &generator).unwrap();
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    // ── 5. clear removes every entry under the stream ─────────────────────

    #[test]
    fn clear_removes_all_entries() {
        let cache = DerivedArtifactCache::new(Arc::new(MemoryKv::new()));
        let stream = test_stream();
        let generator = CountingGenerator { calls: AtomicU32::new(0) };
        cache.get_or_compute(key(&stream), &generator).unwrap();
        cache.clear(&stream).unwrap();
        let keys: Vec<_> = cache.enumerate_keys(&stream.derived_prefix()).unwrap().collect();
        assert!(keys.is_empty());
    }

    // ── 6. content-hash tamper detection on read ──────────────────────────

    #[test]
    fn tampered_payload_is_rejected() {
        let kv = Arc::new(MemoryKv::new());
        let cache = DerivedArtifactCache::new(kv.clone());
        let stream = test_stream();
        let generator = CountingGenerator { calls: AtomicU32::new(0) };
        cache.get_or_compute(key(&stream), &generator).unwrap();

        let fingerprint = key(&stream).fingerprint().unwrap();
        let payload_key = stream.derived_payload_key("TopologySnapshot", &fingerprint);
        kv.put(&payload_key, b"tampered").unwrap();

        let err = cache.get_or_compute(key(&stream), &generator).unwrap_err();
        assert!(matches!(err, CacheError::ContentHashMismatch(_)));
    }

    // ── 7. subscribers observe invalidation events ────────────────────────

    #[test]
    fn subscribers_observe_invalidation() {
        let cache = DerivedArtifactCache::new(Arc::new(MemoryKv::new()));
        let stream = test_stream();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        cache.subscribe(Box::new(move |event| {
            seen_clone.lock().push(event.reason.clone());
        }));
        cache.clear(&stream).unwrap();
        assert_eq!(seen.lock().as_slice(), &[InvalidationReason::Cleared]);
    }
}
