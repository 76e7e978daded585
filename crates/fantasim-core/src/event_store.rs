// SPDX-License-Identifier: Apache-2.0
//! Truth event store (component D): append-only, hash-chained event records
//! per [`StreamIdentity`], plus the topology-domain event vocabulary and the
//! small geometric value types its envelopes carry.

use std::sync::Arc;

use tracing::instrument;

use crate::codec::{self, CanonicalEncode, CanonicalMap, CanonicalValue};
use crate::ident::{BoundaryId, EventId, JunctionId, PlateId, Sha256Hash, GENESIS_PREVIOUS_HASH};
use crate::kv::{KvStore, StorageFault, WriteBatch};
use crate::stream::StreamIdentity;

/// A point on the reference sphere: a unit normal direction plus radius.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurfacePoint {
    /// Unit-length direction `(x, y, z)`.
    pub normal: [f64; 3],
    /// Radius from the sphere's center.
    pub radius: f64,
}

impl CanonicalEncode for SurfacePoint {
    fn to_canonical(&self) -> CanonicalValue {
        CanonicalValue::Array(vec![
            CanonicalValue::Float(self.normal[0]),
            CanonicalValue::Float(self.normal[1]),
            CanonicalValue::Float(self.normal[2]),
            CanonicalValue::Float(self.radius),
        ])
    }
}

/// The kind of a boundary between two plates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundaryType {
    /// Plates separate; new material is created along the boundary.
    Divergent,
    /// Plates converge; material is consumed or uplifted along the boundary.
    Convergent,
    /// Plates slide past each other with no net creation or consumption.
    Transform,
}

impl BoundaryType {
    /// The stable string discriminator used in canonical encoding.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Divergent => "Divergent",
            Self::Convergent => "Convergent",
            Self::Transform => "Transform",
        }
    }
}

impl CanonicalEncode for BoundaryType {
    fn to_canonical(&self) -> CanonicalValue {
        CanonicalValue::Str(self.as_str().to_string())
    }
}

/// Opaque boundary geometry, carried as a canonically-encodable payload.
///
/// The core does not interpret geometry beyond carrying it through events and
/// the materialized state; domain solvers are an external collaborator
/// (`spec.md` §1).
#[derive(Clone, Debug, PartialEq)]
pub struct BoundaryGeometry {
    /// Ordered polyline of surface points describing the boundary trace.
    pub polyline: Vec<SurfacePoint>,
}

impl CanonicalEncode for BoundaryGeometry {
    fn to_canonical(&self) -> CanonicalValue {
        CanonicalValue::Array(self.polyline.iter().map(CanonicalEncode::to_canonical).collect())
    }
}

/// The topology-domain event vocabulary (`spec.md` §3, 9 variants).
#[derive(Clone, Debug, PartialEq)]
pub enum TopologyEventKind {
    /// A new plate entity begins existing.
    PlateCreated {
        /// The plate's identifier.
        plate: PlateId,
    },
    /// A plate is retired; the object is preserved, not deleted.
    PlateRetired {
        /// The plate being retired.
        plate: PlateId,
        /// Human-readable retirement reason.
        reason: String,
    },
    /// A new boundary entity begins existing between two distinct plates.
    BoundaryCreated {
        /// The boundary's identifier.
        boundary: BoundaryId,
        /// One endpoint plate.
        plate_a: PlateId,
        /// The other endpoint plate.
        plate_b: PlateId,
        /// The boundary's kind.
        kind: BoundaryType,
        /// The boundary's initial geometry.
        geometry: BoundaryGeometry,
    },
    /// A boundary's kind changes.
    BoundaryTypeChanged {
        /// The boundary being updated.
        boundary: BoundaryId,
        /// The kind recorded as prior, for invariant checking.
        old_type: Option<BoundaryType>,
        /// The new kind.
        new_type: BoundaryType,
    },
    /// A boundary's geometry is replaced.
    BoundaryGeometryUpdated {
        /// The boundary being updated.
        boundary: BoundaryId,
        /// The replacement geometry.
        geometry: BoundaryGeometry,
    },
    /// A boundary is retired; the object is preserved, not deleted.
    BoundaryRetired {
        /// The boundary being retired.
        boundary: BoundaryId,
        /// Human-readable retirement reason.
        reason: String,
    },
    /// A new junction entity begins existing, incident to the given boundaries.
    JunctionCreated {
        /// The junction's identifier.
        junction: JunctionId,
        /// The boundaries incident to this junction, in insertion order.
        boundaries: Vec<BoundaryId>,
        /// The junction's location.
        location: SurfacePoint,
    },
    /// A junction's incident boundaries and/or location are replaced.
    JunctionUpdated {
        /// The junction being updated.
        junction: JunctionId,
        /// Replacement incident-boundary list, if changed.
        boundaries: Option<Vec<BoundaryId>>,
        /// Replacement location, if changed.
        location: Option<SurfacePoint>,
    },
    /// A junction is retired; the object is preserved, not deleted.
    JunctionRetired {
        /// The junction being retired.
        junction: JunctionId,
        /// Human-readable retirement reason.
        reason: String,
    },
}

impl TopologyEventKind {
    /// The stable string discriminator stored as `EventType`.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PlateCreated { .. } => "PlateCreated",
            Self::PlateRetired { .. } => "PlateRetired",
            Self::BoundaryCreated { .. } => "BoundaryCreated",
            Self::BoundaryTypeChanged { .. } => "BoundaryTypeChanged",
            Self::BoundaryGeometryUpdated { .. } => "BoundaryGeometryUpdated",
            Self::BoundaryRetired { .. } => "BoundaryRetired",
            Self::JunctionCreated { .. } => "JunctionCreated",
            Self::JunctionUpdated { .. } => "JunctionUpdated",
            Self::JunctionRetired { .. } => "JunctionRetired",
        }
    }
}

impl CanonicalEncode for TopologyEventKind {
    #[allow(clippy::expect_used)] // field names below are distinct string literals, never collide
    fn to_canonical(&self) -> CanonicalValue {
        let mut map = CanonicalMap::new();
        let insert = |map: &mut CanonicalMap, k: &str, v: CanonicalValue| {
            map.insert(k, v).expect("event-kind fields are distinct");
        };
        match self {
            Self::PlateCreated { plate } => {
                insert(&mut map, "plate", CanonicalValue::Str(plate.to_uuid_string()));
            }
            Self::PlateRetired { plate, reason } => {
                insert(&mut map, "plate", CanonicalValue::Str(plate.to_uuid_string()));
                insert(&mut map, "reason", CanonicalValue::Str(reason.clone()));
            }
            Self::BoundaryCreated {
                boundary,
                plate_a,
                plate_b,
                kind,
                geometry,
            } => {
                insert(
                    &mut map,
                    "boundary",
                    CanonicalValue::Str(boundary.to_uuid_string()),
                );
                insert(
                    &mut map,
                    "plate_a",
                    CanonicalValue::Str(plate_a.to_uuid_string()),
                );
                insert(
                    &mut map,
                    "plate_b",
                    CanonicalValue::Str(plate_b.to_uuid_string()),
                );
                insert(&mut map, "kind", kind.to_canonical());
                insert(&mut map, "geometry", geometry.to_canonical());
            }
            Self::BoundaryTypeChanged {
                boundary,
                old_type,
                new_type,
            } => {
                insert(
                    &mut map,
                    "boundary",
                    CanonicalValue::Str(boundary.to_uuid_string()),
                );
                insert(
                    &mut map,
                    "old_type",
                    old_type.map_or(CanonicalValue::Nil, |t| t.to_canonical()),
                );
                insert(&mut map, "new_type", new_type.to_canonical());
            }
            Self::BoundaryGeometryUpdated { boundary, geometry } => {
                insert(
                    &mut map,
                    "boundary",
                    CanonicalValue::Str(boundary.to_uuid_string()),
                );
                insert(&mut map, "geometry", geometry.to_canonical());
            }
            Self::BoundaryRetired { boundary, reason } => {
                insert(
                    &mut map,
                    "boundary",
                    CanonicalValue::Str(boundary.to_uuid_string()),
                );
                insert(&mut map, "reason", CanonicalValue::Str(reason.clone()));
            }
            Self::JunctionCreated {
                junction,
                boundaries,
                location,
            } => {
                insert(
                    &mut map,
                    "junction",
                    CanonicalValue::Str(junction.to_uuid_string()),
                );
                insert(
                    &mut map,
                    "boundaries",
                    CanonicalValue::Array(
                        boundaries
                            .iter()
                            .map(|b| CanonicalValue::Str(b.to_uuid_string()))
                            .collect(),
                    ),
                );
                insert(&mut map, "location", location.to_canonical());
            }
            Self::JunctionUpdated {
                junction,
                boundaries,
                location,
            } => {
                insert(
                    &mut map,
                    "junction",
                    CanonicalValue::Str(junction.to_uuid_string()),
                );
                insert(
                    &mut map,
                    "boundaries",
                    boundaries.as_ref().map_or(CanonicalValue::Nil, |bs| {
                        CanonicalValue::Array(
                            bs.iter()
                                .map(|b| CanonicalValue::Str(b.to_uuid_string()))
                                .collect(),
                        )
                    }),
                );
                insert(
                    &mut map,
                    "location",
                    location.map_or(CanonicalValue::Nil, |l| l.to_canonical()),
                );
            }
            Self::JunctionRetired { junction, reason } => {
                insert(
                    &mut map,
                    "junction",
                    CanonicalValue::Str(junction.to_uuid_string()),
                );
                insert(&mut map, "reason", CanonicalValue::Str(reason.clone()));
            }
        }
        CanonicalValue::Map(map)
    }
}

/// The fixed header fields every event carries, plus its payload.
#[derive(Clone, Debug, PartialEq)]
pub struct EventEnvelope<T> {
    /// Deterministic event identifier.
    pub event_id: EventId,
    /// The stable string discriminator for `payload`'s variant.
    pub event_type: &'static str,
    /// Canonical simulated tick at which this event occurred.
    pub tick: i64,
    /// Position within the stream; unique and monotone.
    pub sequence: u64,
    /// SHA-256 of the record at `sequence - 1`; all-zero at genesis.
    pub previous_hash: Sha256Hash,
    /// SHA-256 of this envelope with `hash` zeroed.
    pub hash: Sha256Hash,
    /// The event-specific payload.
    pub payload: T,
}

impl<T: CanonicalEncode> EventEnvelope<T> {
    #[allow(clippy::expect_used)] // field names below are distinct string literals, never collide
    fn to_canonical_with_hash(&self, hash: Sha256Hash) -> CanonicalValue {
        let mut map = CanonicalMap::new();
        map.insert(
            "event_id",
            CanonicalValue::Str(self.event_id.to_uuid_string()),
        )
        .expect("distinct keys");
        map.insert("event_type", CanonicalValue::Str(self.event_type.to_string()))
            .expect("distinct keys");
        map.insert("tick", CanonicalValue::Int(self.tick))
            .expect("distinct keys");
        map.insert("sequence", CanonicalValue::UInt(self.sequence))
            .expect("distinct keys");
        map.insert(
            "previous_hash",
            CanonicalValue::Bytes(self.previous_hash.to_vec()),
        )
        .expect("distinct keys");
        map.insert("hash", CanonicalValue::Bytes(hash.to_vec()))
            .expect("distinct keys");
        map.insert("payload", self.payload.to_canonical())
            .expect("distinct keys");
        CanonicalValue::Map(map)
    }

    /// Computes `SHA256(canonical_encode(self with hash zeroed))`.
    ///
    /// # Panics
    ///
    /// Never, in practice: `to_canonical_with_hash` never produces colliding
    /// map keys, and `sha256_hex` always returns exactly 64 hex characters.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn compute_hash(&self) -> Sha256Hash {
        let canonical = self.to_canonical_with_hash([0u8; 32]);
        let bytes = codec::encode_canonical(&canonical).expect("envelope fields never collide");
        let digest = codec::sha256_hex(&bytes);
        let mut out = [0u8; 32];
        hex::decode_to_slice(digest, &mut out).expect("sha256_hex always returns 64 hex chars");
        out
    }
}

impl<T: CanonicalEncode> CanonicalEncode for EventEnvelope<T> {
    fn to_canonical(&self) -> CanonicalValue {
        self.to_canonical_with_hash(self.hash)
    }
}

/// A not-yet-sequenced event, as submitted by a caller to [`append`](EventStore::append).
#[derive(Clone, Debug, PartialEq)]
pub struct EventDraft {
    /// Deterministic event identifier, drawn by the caller's seeded RNG.
    pub event_id: EventId,
    /// The tick at which this event occurred.
    pub tick: i64,
    /// The event-specific payload.
    pub kind: TopologyEventKind,
}

/// How the store enforces tick monotonicity on append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickPolicy {
    /// A new event with `Tick < previous.Tick` fails the whole batch.
    Reject,
    /// A new event with `Tick < previous.Tick` is accepted, but the stream's
    /// `TickMonotoneFromGenesis` capability flag is cleared permanently.
    Downgrade,
}

/// Options controlling a single [`EventStore::append`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendOptions {
    /// The tick-monotonicity enforcement mode for this append.
    pub tick_policy: TickPolicy,
}

impl Default for AppendOptions {
    fn default() -> Self {
        Self {
            tick_policy: TickPolicy::Reject,
        }
    }
}

/// The outcome of a successful [`EventStore::append`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendResult {
    /// Sequence assigned to the first event in the batch.
    pub first_seq: u64,
    /// Sequence assigned to the last event in the batch.
    pub last_seq: u64,
}

/// Errors raised by [`EventStore::append`].
#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// A draft's `Tick` was less than the stream's previous `Tick` under
    /// [`TickPolicy::Reject`].
    #[error("tick {candidate} precedes previous tick {previous} under reject policy")]
    TickMonotonicity {
        /// The offending draft's tick.
        candidate: i64,
        /// The stream's previously recorded tick.
        previous: i64,
    },
    /// The stream's `LastSequence` changed between read and commit.
    #[error("sequence race: expected last_sequence {expected:?}, observed {observed:?}")]
    SequenceRace {
        /// The sequence this append assumed.
        expected: Option<u64>,
        /// The sequence actually observed at commit time.
        observed: Option<u64>,
    },
    /// The append batch was empty.
    #[error("append batch must not be empty")]
    EmptyBatch,
    /// The underlying key-value substrate failed.
    #[error(transparent)]
    StorageFault(#[from] StorageFault),
}

/// Errors raised by [`EventStore::read`].
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// A record's recomputed hash did not match its stored hash, or its
    /// `PreviousHash` did not match the prior record's `Hash`.
    #[error("hash chain broken at sequence {sequence}")]
    HashChainBroken {
        /// The sequence at which the mismatch was detected.
        sequence: u64,
    },
    /// A stored record could not be decoded as a canonical event envelope.
    #[error("malformed event record at sequence {sequence}: {reason}")]
    Malformed {
        /// The sequence of the offending record.
        sequence: u64,
        /// Human-readable decode failure reason.
        reason: String,
    },
    /// The underlying key-value substrate failed.
    #[error(transparent)]
    StorageFault(#[from] StorageFault),
}

/// The 9-byte capabilities record stored at `S:<…>:Meta:Caps`
/// (`spec.md` §4.C, §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamCapabilities {
    /// Whether every event appended since genesis has had non-decreasing tick.
    pub tick_monotone_from_genesis: bool,
    /// Whether the stream was created (or later promoted) to reject
    /// tick-monotonicity violations outright.
    pub tick_policy_reject_from_genesis: bool,
}

impl StreamCapabilities {
    const CURRENT_VERSION: u8 = 0x01;
    const BIT_TICK_MONOTONE: u64 = 1 << 0;
    const BIT_TICK_POLICY_REJECT: u64 = 1 << 1;

    /// The capabilities of a stream that has never been written to.
    #[must_use]
    pub fn none() -> Self {
        Self {
            tick_monotone_from_genesis: true,
            tick_policy_reject_from_genesis: false,
        }
    }

    fn to_bytes(self) -> [u8; 9] {
        let mut flags = 0u64;
        if self.tick_monotone_from_genesis {
            flags |= Self::BIT_TICK_MONOTONE;
        }
        if self.tick_policy_reject_from_genesis {
            flags |= Self::BIT_TICK_POLICY_REJECT;
        }
        let mut out = [0u8; 9];
        out[0] = Self::CURRENT_VERSION;
        out[1..9].copy_from_slice(&flags.to_le_bytes());
        out
    }

    /// Decodes the 9-byte capabilities record. Unknown versions decode as
    /// "no capabilities" rather than failing (`spec.md` §4.C, §9).
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.len() != 9 || bytes[0] != Self::CURRENT_VERSION {
            return Self {
                tick_monotone_from_genesis: false,
                tick_policy_reject_from_genesis: false,
            };
        }
        let mut flag_bytes = [0u8; 8];
        flag_bytes.copy_from_slice(&bytes[1..9]);
        let flags = u64::from_le_bytes(flag_bytes);
        Self {
            tick_monotone_from_genesis: flags & Self::BIT_TICK_MONOTONE != 0,
            tick_policy_reject_from_genesis: flags & Self::BIT_TICK_POLICY_REJECT != 0,
        }
    }
}

struct StreamHead {
    last_sequence: Option<u64>,
    last_hash: Sha256Hash,
    last_tick: Option<i64>,
}

/// The truth event store (component D): appends and reads hash-chained
/// [`TopologyEventKind`] records for a [`StreamIdentity`], backed by a
/// [`KvStore`].
pub struct EventStore {
    kv: Arc<dyn KvStore>,
}

impl EventStore {
    /// Builds a store over `kv`.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn scan_head(&self, stream: &StreamIdentity) -> Result<StreamHead, ReadError> {
        let prefix = stream.event_key_prefix();
        let mut last_sequence = None;
        let mut last_hash = GENESIS_PREVIOUS_HASH;
        let mut last_tick = None;
        for (key, value) in self.kv.iter_from(&prefix)? {
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            let canonical = codec::decode_canonical(&value)
                .map_err(|e| ReadError::Malformed {
                    sequence: last_sequence.map_or(0, |s: u64| s + 1),
                    reason: e.to_string(),
                })?;
            let map = canonical.as_map().ok_or_else(|| ReadError::Malformed {
                sequence: last_sequence.map_or(0, |s: u64| s + 1),
                reason: "event record was not a map".into(),
            })?;
            let sequence = field_uint(map, "sequence")?;
            let tick = field_int(map, "tick")?;
            let hash = field_hash(map, "hash")?;
            last_sequence = Some(sequence);
            last_hash = hash;
            last_tick = Some(tick);
        }
        Ok(StreamHead {
            last_sequence,
            last_hash,
            last_tick,
        })
    }

    /// Reads the stream's current capabilities.
    ///
    /// # Errors
    ///
    /// Returns [`StorageFault`] if the backend failed to read.
    pub fn capabilities(&self, stream: &StreamIdentity) -> Result<StreamCapabilities, StorageFault> {
        match self.kv.get(&stream.capabilities_key())? {
            Some(bytes) => Ok(StreamCapabilities::from_bytes(&bytes)),
            None => Ok(StreamCapabilities::none()),
        }
    }

    /// Returns the stream's highest assigned sequence, if any event has been
    /// appended.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError`] if a stored record cannot be decoded while
    /// scanning for the head.
    pub fn last_sequence(&self, stream: &StreamIdentity) -> Result<Option<u64>, ReadError> {
        Ok(self.scan_head(stream)?.last_sequence)
    }

    /// Appends `drafts` to `stream` under `options`, assigning sequence
    /// numbers and chaining each record's hash to the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError::EmptyBatch`] if `drafts` is empty,
    /// [`AppendError::TickMonotonicity`] if a draft's tick regresses under
    /// [`TickPolicy::Reject`], or [`AppendError::StorageFault`] if the
    /// backend failed to commit.
    #[instrument(skip(self, drafts), fields(stream = %stream.stream_key(), count = drafts.len()))]
    pub fn append(
        &self,
        stream: &StreamIdentity,
        drafts: Vec<EventDraft>,
        options: &AppendOptions,
    ) -> Result<AppendResult, AppendError> {
        if drafts.is_empty() {
            return Err(AppendError::EmptyBatch);
        }
        let head = self
            .scan_head(stream)
            .map_err(|e| AppendError::StorageFault(StorageFault::Backend(e.to_string())))?;
        let mut capabilities = match self.kv.get(&stream.capabilities_key())? {
            Some(bytes) => StreamCapabilities::from_bytes(&bytes),
            None => StreamCapabilities::none(),
        };

        let mut batch = WriteBatch::new();
        let mut previous_hash = head.last_hash;
        let mut previous_tick = head.last_tick;
        let first_seq = head.last_sequence.map_or(0, |s| s + 1);
        let mut sequence = first_seq;

        capabilities.tick_policy_reject_from_genesis = matches!(options.tick_policy, TickPolicy::Reject);

        for draft in drafts {
            if let Some(prev_tick) = previous_tick {
                if draft.tick < prev_tick {
                    if capabilities.tick_policy_reject_from_genesis {
                        return Err(AppendError::TickMonotonicity {
                            candidate: draft.tick,
                            previous: prev_tick,
                        });
                    }
                    capabilities.tick_monotone_from_genesis = false;
                }
            }

            let envelope = EventEnvelope {
                event_id: draft.event_id,
                event_type: draft.kind.event_type(),
                tick: draft.tick,
                sequence,
                previous_hash,
                hash: [0u8; 32],
                payload: draft.kind,
            };
            let hash = envelope.compute_hash();
            let canonical = envelope.to_canonical_with_hash(hash);
            let bytes = codec::encode_canonical(&canonical)
                .map_err(|e| AppendError::StorageFault(StorageFault::Backend(e.to_string())))?;
            batch.put(stream.event_key(sequence), bytes);

            previous_hash = hash;
            previous_tick = Some(draft.tick);
            sequence += 1;
        }

        let last_seq = sequence - 1;
        batch.put(stream.capabilities_key(), capabilities.to_bytes().to_vec());
        self.kv.write_batch(batch)?;

        Ok(AppendResult { first_seq, last_seq })
    }

    /// Reads events from `stream` starting at `from_sequence`, verifying the
    /// hash chain as it goes.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::HashChainBroken`] the moment a record's
    /// recomputed hash does not match its stored hash, or its `PreviousHash`
    /// does not match the prior record's `Hash`.
    #[instrument(skip(self), fields(stream = %stream.stream_key(), from_sequence))]
    pub fn read(
        &self,
        stream: &StreamIdentity,
        from_sequence: u64,
    ) -> Result<Vec<EventEnvelope<TopologyEventKind>>, ReadError> {
        let prefix = stream.event_key_prefix();
        let seek = stream.event_key(from_sequence);
        let mut out = Vec::new();
        let mut expected_previous: Option<Sha256Hash> = None;

        for (key, value) in self.kv.iter_from(&seek)? {
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            let envelope = decode_envelope(&value)?;
            if let Some(expected) = expected_previous {
                if envelope.previous_hash != expected {
                    return Err(ReadError::HashChainBroken {
                        sequence: envelope.sequence,
                    });
                }
            }
            let recomputed = envelope.compute_hash();
            if recomputed != envelope.hash {
                return Err(ReadError::HashChainBroken {
                    sequence: envelope.sequence,
                });
            }
            expected_previous = Some(envelope.hash);
            out.push(envelope);
        }
        Ok(out)
    }
}

fn decode_envelope(bytes: &[u8]) -> Result<EventEnvelope<TopologyEventKind>, ReadError> {
    let canonical = codec::decode_canonical(bytes).map_err(|e| ReadError::Malformed {
        sequence: 0,
        reason: e.to_string(),
    })?;
    let map = canonical.as_map().ok_or_else(|| ReadError::Malformed {
        sequence: 0,
        reason: "event record was not a map".into(),
    })?;
    let sequence = field_uint(map, "sequence")?;
    let malformed = |reason: &str| ReadError::Malformed {
        sequence,
        reason: reason.to_string(),
    };
    let event_id_str = map
        .get("event_id")
        .and_then(CanonicalValue::as_str)
        .ok_or_else(|| malformed("missing event_id"))?;
    let event_type = map
        .get("event_type")
        .and_then(CanonicalValue::as_str)
        .ok_or_else(|| malformed("missing event_type"))?;
    let tick = field_int(map, "tick")?;
    let previous_hash = field_hash(map, "previous_hash")?;
    let hash = field_hash(map, "hash")?;
    let payload_value = map
        .get("payload")
        .ok_or_else(|| malformed("missing payload"))?;
    let payload = decode_topology_event(event_type, payload_value)
        .map_err(|reason| malformed(&reason))?;
    let event_id_bits = parse_uuid_hex(event_id_str).ok_or_else(|| malformed("bad event_id"))?;

    Ok(EventEnvelope {
        event_id: EventId(event_id_bits),
        event_type: static_event_type(event_type),
        tick,
        sequence,
        previous_hash,
        hash,
        payload,
    })
}

fn static_event_type(s: &str) -> &'static str {
    match s {
        "PlateCreated" => "PlateCreated",
        "PlateRetired" => "PlateRetired",
        "BoundaryCreated" => "BoundaryCreated",
        "BoundaryTypeChanged" => "BoundaryTypeChanged",
        "BoundaryGeometryUpdated" => "BoundaryGeometryUpdated",
        "BoundaryRetired" => "BoundaryRetired",
        "JunctionCreated" => "JunctionCreated",
        "JunctionUpdated" => "JunctionUpdated",
        "JunctionRetired" => "JunctionRetired",
        _ => "Unknown",
    }
}

fn field_uint(map: &CanonicalMap, key: &str) -> Result<u64, ReadError> {
    map.get(key)
        .and_then(CanonicalValue::as_uint)
        .ok_or_else(|| ReadError::Malformed {
            sequence: 0,
            reason: format!("missing or non-uint field {key}"),
        })
}

fn field_int(map: &CanonicalMap, key: &str) -> Result<i64, ReadError> {
    map.get(key)
        .and_then(CanonicalValue::as_int)
        .ok_or_else(|| ReadError::Malformed {
            sequence: 0,
            reason: format!("missing or non-int field {key}"),
        })
}

fn field_hash(map: &CanonicalMap, key: &str) -> Result<Sha256Hash, ReadError> {
    let bytes = map
        .get(key)
        .and_then(CanonicalValue::as_bytes)
        .ok_or_else(|| ReadError::Malformed {
            sequence: 0,
            reason: format!("missing or non-bytes field {key}"),
        })?;
    Sha256Hash::try_from(bytes).map_err(|_| ReadError::Malformed {
        sequence: 0,
        reason: format!("field {key} was not 32 bytes"),
    })
}

fn parse_uuid_hex(s: &str) -> Option<u128> {
    let hex: String = s.chars().filter(|c| *c != '-').collect();
    if hex.len() != 32 {
        return None;
    }
    u128::from_str_radix(&hex, 16).ok()
}

fn decode_id(value: Option<&CanonicalValue>) -> Result<u128, String> {
    let s = value
        .and_then(CanonicalValue::as_str)
        .ok_or_else(|| "missing id field".to_string())?;
    parse_uuid_hex(s).ok_or_else(|| "malformed id field".to_string())
}

fn decode_surface_point(value: &CanonicalValue) -> Result<SurfacePoint, String> {
    let items = value
        .as_array()
        .ok_or_else(|| "location was not an array".to_string())?;
    if items.len() != 4 {
        return Err("location array must have 4 elements".to_string());
    }
    let f = |i: usize| -> Result<f64, String> {
        match &items[i] {
            CanonicalValue::Float(v) => Ok(*v),
            _ => Err("location element was not a float".to_string()),
        }
    };
    Ok(SurfacePoint {
        normal: [f(0)?, f(1)?, f(2)?],
        radius: f(3)?,
    })
}

fn decode_boundary_geometry(value: &CanonicalValue) -> Result<BoundaryGeometry, String> {
    let items = value
        .as_array()
        .ok_or_else(|| "geometry was not an array".to_string())?;
    let polyline = items
        .iter()
        .map(decode_surface_point)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(BoundaryGeometry { polyline })
}

fn decode_boundary_type(value: &CanonicalValue) -> Result<BoundaryType, String> {
    match value.as_str() {
        Some("Divergent") => Ok(BoundaryType::Divergent),
        Some("Convergent") => Ok(BoundaryType::Convergent),
        Some("Transform") => Ok(BoundaryType::Transform),
        _ => Err("unknown boundary kind".to_string()),
    }
}

fn decode_topology_event(
    event_type: &str,
    payload: &CanonicalValue,
) -> Result<TopologyEventKind, String> {
    let map = payload
        .as_map()
        .ok_or_else(|| "payload was not a map".to_string())?;
    match event_type {
        "PlateCreated" => Ok(TopologyEventKind::PlateCreated {
            plate: PlateId(decode_id(map.get("plate"))?),
        }),
        "PlateRetired" => Ok(TopologyEventKind::PlateRetired {
            plate: PlateId(decode_id(map.get("plate"))?),
            reason: map
                .get("reason")
                .and_then(CanonicalValue::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        "BoundaryCreated" => Ok(TopologyEventKind::BoundaryCreated {
            boundary: BoundaryId(decode_id(map.get("boundary"))?),
            plate_a: PlateId(decode_id(map.get("plate_a"))?),
            plate_b: PlateId(decode_id(map.get("plate_b"))?),
            kind: decode_boundary_type(map.get("kind").ok_or("missing kind")?)?,
            geometry: decode_boundary_geometry(map.get("geometry").ok_or("missing geometry")?)?,
        }),
        "BoundaryTypeChanged" => Ok(TopologyEventKind::BoundaryTypeChanged {
            boundary: BoundaryId(decode_id(map.get("boundary"))?),
            old_type: match map.get("old_type") {
                Some(CanonicalValue::Nil) | None => None,
                Some(v) => Some(decode_boundary_type(v)?),
            },
            new_type: decode_boundary_type(map.get("new_type").ok_or("missing new_type")?)?,
        }),
        "BoundaryGeometryUpdated" => Ok(TopologyEventKind::BoundaryGeometryUpdated {
            boundary: BoundaryId(decode_id(map.get("boundary"))?),
            geometry: decode_boundary_geometry(map.get("geometry").ok_or("missing geometry")?)?,
        }),
        "BoundaryRetired" => Ok(TopologyEventKind::BoundaryRetired {
            boundary: BoundaryId(decode_id(map.get("boundary"))?),
            reason: map
                .get("reason")
                .and_then(CanonicalValue::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        "JunctionCreated" => {
            let boundaries = map
                .get("boundaries")
                .and_then(CanonicalValue::as_array)
                .ok_or("missing boundaries")?
                .iter()
                .map(|v| decode_id(Some(v)).map(BoundaryId))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(TopologyEventKind::JunctionCreated {
                junction: JunctionId(decode_id(map.get("junction"))?),
                boundaries,
                location: decode_surface_point(map.get("location").ok_or("missing location")?)?,
            })
        }
        "JunctionUpdated" => {
            let boundaries = match map.get("boundaries") {
                Some(CanonicalValue::Nil) | None => None,
                Some(CanonicalValue::Array(items)) => Some(
                    items
                        .iter()
                        .map(|v| decode_id(Some(v)).map(BoundaryId))
                        .collect::<Result<Vec<_>, _>>()?,
                ),
                _ => return Err("boundaries field malformed".to_string()),
            };
            let location = match map.get("location") {
                Some(CanonicalValue::Nil) | None => None,
                Some(v) => Some(decode_surface_point(v)?),
            };
            Ok(TopologyEventKind::JunctionUpdated {
                junction: JunctionId(decode_id(map.get("junction"))?),
                boundaries,
                location,
            })
        }
        "JunctionRetired" => Ok(TopologyEventKind::JunctionRetired {
            junction: JunctionId(decode_id(map.get("junction"))?),
            reason: map
                .get("reason")
                .and_then(CanonicalValue::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        other => Err(format!("unknown event type {other}")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::ident::seed_rng;
    use crate::kv::MemoryKv;

    fn test_stream() -> StreamIdentity {
        StreamIdentity::new("V1", "main", 0, "geo.plates", "0").unwrap()
    }

    fn store() -> EventStore {
        EventStore::new(Arc::new(MemoryKv::new()))
    }

    // ── 1. genesis: first append gets sequence 0 and all-zero previous hash ─

    #[test]
    fn genesis_append_assigns_sequence_zero() {
        let store = store();
        let stream = test_stream();
        let mut rng = seed_rng(&[b"42"]);
        let draft = EventDraft {
            event_id: EventId::from_rng(&mut rng),
            tick: 0,
            kind: TopologyEventKind::PlateCreated {
                plate: PlateId::from_rng(&mut rng),
            },
        };
        let result = store
            .append(&stream, vec![draft], &AppendOptions::default())
            .unwrap();
        assert_eq!(result.first_seq, 0);
        assert_eq!(result.last_seq, 0);
        let events = store.read(&stream, 0).unwrap();
        assert_eq!(events[0].previous_hash, GENESIS_PREVIOUS_HASH);
    }

    // ── 2. sequential appends chain hashes ──────────────────────────────

    #[test]
    fn sequential_appends_chain_hashes() {
        let store = store();
        let stream = test_stream();
        let mut rng = seed_rng(&[b"42"]);
        for tick in 0..3 {
            let draft = EventDraft {
                event_id: EventId::from_rng(&mut rng),
                tick,
                kind: TopologyEventKind::PlateCreated {
                    plate: PlateId::from_rng(&mut rng),
                },
            };
            store
                .append(&stream, vec![draft], &AppendOptions::default())
                .unwrap();
        }
        let events = store.read(&stream, 0).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].previous_hash, events[0].hash);
        assert_eq!(events[2].previous_hash, events[1].hash);
        assert_eq!(store.last_sequence(&stream).unwrap(), Some(2));
    }

    // ── 3. tamper detection: flipping a byte breaks the chain ───────────

    #[test]
    fn tampering_breaks_hash_chain() {
        let kv = Arc::new(MemoryKv::new());
        let store = EventStore::new(kv.clone());
        let stream = test_stream();
        let mut rng = seed_rng(&[b"42"]);
        let draft = EventDraft {
            event_id: EventId::from_rng(&mut rng),
            tick: 0,
            kind: TopologyEventKind::PlateCreated {
                plate: PlateId::from_rng(&mut rng),
            },
        };
        store
            .append(&stream, vec![draft], &AppendOptions::default())
            .unwrap();

        let key = stream.event_key(0);
        let mut value = kv.get(&key).unwrap().unwrap();
        let last = value.len() - 1;
        value[last] ^= 0xFF;
        kv.put(&key, &value).unwrap();

        let err = store.read(&stream, 0).unwrap_err();
        assert!(matches!(err, ReadError::HashChainBroken { .. }));
    }

    // ── 4. reject policy fails a tick regression ────────────────────────

    #[test]
    fn reject_policy_fails_tick_regression() {
        let store = store();
        let stream = test_stream();
        let mut rng = seed_rng(&[b"42"]);
        let first = EventDraft {
            event_id: EventId::from_rng(&mut rng),
            tick: 5,
            kind: TopologyEventKind::PlateCreated {
                plate: PlateId::from_rng(&mut rng),
            },
        };
        store
            .append(&stream, vec![first], &AppendOptions::default())
            .unwrap();
        let second = EventDraft {
            event_id: EventId::from_rng(&mut rng),
            tick: 4,
            kind: TopologyEventKind::PlateCreated {
                plate: PlateId::from_rng(&mut rng),
            },
        };
        let err = store
            .append(
                &stream,
                vec![second],
                &AppendOptions {
                    tick_policy: TickPolicy::Reject,
                },
            )
            .unwrap_err();
        assert!(matches!(err, AppendError::TickMonotonicity { .. }));
    }

    // ── 5. downgrade policy accepts regression and clears the flag ──────

    #[test]
    fn downgrade_policy_clears_monotone_flag() {
        let store = store();
        let stream = test_stream();
        let mut rng = seed_rng(&[b"42"]);
        let first = EventDraft {
            event_id: EventId::from_rng(&mut rng),
            tick: 5,
            kind: TopologyEventKind::PlateCreated {
                plate: PlateId::from_rng(&mut rng),
            },
        };
        store
            .append(
                &stream,
                vec![first],
                &AppendOptions {
                    tick_policy: TickPolicy::Downgrade,
                },
            )
            .unwrap();
        let second = EventDraft {
            event_id: EventId::from_rng(&mut rng),
            tick: 4,
            kind: TopologyEventKind::PlateCreated {
                plate: PlateId::from_rng(&mut rng),
            },
        };
        store
            .append(
                &stream,
                vec![second],
                &AppendOptions {
                    tick_policy: TickPolicy::Downgrade,
                },
            )
            .unwrap();
        let caps = store.capabilities(&stream).unwrap();
        assert!(!caps.tick_monotone_from_genesis);
    }

    // ── 6. empty batch is rejected ───────────────────────────────────────

    #[test]
    fn empty_batch_is_rejected() {
        let store = store();
        let stream = test_stream();
        let err = store
            .append(&stream, vec![], &AppendOptions::default())
            .unwrap_err();
        assert!(matches!(err, AppendError::EmptyBatch));
    }

    // ── 7. capabilities decode as "none" for an unknown version byte ────

    #[test]
    fn unknown_capabilities_version_decodes_as_none() {
        let mut bytes = [0u8; 9];
        bytes[0] = 0x02;
        let caps = StreamCapabilities::from_bytes(&bytes);
        assert!(!caps.tick_monotone_from_genesis);
        assert!(!caps.tick_policy_reject_from_genesis);
    }

    // ── 8. boundary/junction event payloads round-trip through the store ─

    #[test]
    fn boundary_and_junction_events_round_trip() {
        let store = store();
        let stream = test_stream();
        let mut rng = seed_rng(&[b"42"]);
        let plate_a = PlateId::from_rng(&mut rng);
        let plate_b = PlateId::from_rng(&mut rng);
        let boundary = BoundaryId::from_rng(&mut rng);
        let junction = JunctionId::from_rng(&mut rng);
        let geometry = BoundaryGeometry {
            polyline: vec![SurfacePoint {
                normal: [0.0, 0.0, 1.0],
                radius: 6371.0,
            }],
        };
        let drafts = vec![
            EventDraft {
                event_id: EventId::from_rng(&mut rng),
                tick: 0,
                kind: TopologyEventKind::PlateCreated { plate: plate_a },
            },
            EventDraft {
                event_id: EventId::from_rng(&mut rng),
                tick: 0,
                kind: TopologyEventKind::PlateCreated { plate: plate_b },
            },
            EventDraft {
                event_id: EventId::from_rng(&mut rng),
                tick: 0,
                kind: TopologyEventKind::BoundaryCreated {
                    boundary,
                    plate_a,
                    plate_b,
                    kind: BoundaryType::Convergent,
                    geometry: geometry.clone(),
                },
            },
            EventDraft {
                event_id: EventId::from_rng(&mut rng),
                tick: 0,
                kind: TopologyEventKind::JunctionCreated {
                    junction,
                    boundaries: vec![boundary],
                    location: SurfacePoint {
                        normal: [1.0, 0.0, 0.0],
                        radius: 6371.0,
                    },
                },
            },
        ];
        store
            .append(&stream, drafts, &AppendOptions::default())
            .unwrap();
        let events = store.read(&stream, 0).unwrap();
        assert_eq!(events.len(), 4);
        match &events[2].payload {
            TopologyEventKind::BoundaryCreated { kind, .. } => {
                assert_eq!(*kind, BoundaryType::Convergent);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        match &events[3].payload {
            TopologyEventKind::JunctionCreated { boundaries, .. } => {
                assert_eq!(boundaries, &vec![boundary]);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
