// SPDX-License-Identifier: Apache-2.0
//! Topology materializer (component E): folds a stream's events into a
//! read-only indexed state view, accelerated by opportunistic snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{instrument, warn};

use crate::codec::{self, CanonicalEncode, CanonicalMap, CanonicalValue};
use crate::event_store::{
    BoundaryGeometry, BoundaryType, EventStore, ReadError, SurfacePoint, TopologyEventKind,
};
use crate::ident::{BoundaryId, JunctionId, PlateId};
use crate::kv::{KvStore, StorageFault};
use crate::stream::StreamIdentity;

/// A tectonic plate's materialized state.
#[derive(Clone, Debug, PartialEq)]
pub struct Plate {
    /// Whether the plate has been retired.
    pub is_retired: bool,
    /// Retirement reason, if retired.
    pub retirement_reason: Option<String>,
}

/// A boundary's materialized state.
#[derive(Clone, Debug, PartialEq)]
pub struct Boundary {
    /// One endpoint plate.
    pub plate_a: PlateId,
    /// The other endpoint plate.
    pub plate_b: PlateId,
    /// The boundary's current kind.
    pub kind: BoundaryType,
    /// The boundary's current geometry.
    pub geometry: BoundaryGeometry,
    /// Whether the boundary has been retired.
    pub is_retired: bool,
    /// Retirement reason, if retired.
    pub retirement_reason: Option<String>,
}

/// A junction's materialized state.
#[derive(Clone, Debug, PartialEq)]
pub struct Junction {
    /// Incident boundaries, ordered CCW by tangent-plane angle from local
    /// north, `BoundaryId` as secondary key.
    pub boundary_ids: Vec<BoundaryId>,
    /// The junction's location.
    pub location: SurfacePoint,
    /// Whether the junction has been retired.
    pub is_retired: bool,
    /// Retirement reason, if retired.
    pub retirement_reason: Option<String>,
}

/// A recorded invariant violation. Recording does not halt replay
/// (`spec.md` §4.E).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvariantViolation {
    /// The name of the violated invariant.
    pub invariant: &'static str,
    /// A human-readable description of the violation.
    pub message: String,
    /// The sequence of the event that produced the violation.
    pub sequence: u64,
}

/// A read-only, indexed view of a stream's topology at some sequence.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TopologyState {
    /// All plates ever created, by id.
    pub plates: BTreeMap<PlateId, Plate>,
    /// All boundaries ever created, by id.
    pub boundaries: BTreeMap<BoundaryId, Boundary>,
    /// All junctions ever created, by id.
    pub junctions: BTreeMap<JunctionId, Junction>,
    /// Plate -> incident boundary ids.
    pub plate_boundaries: BTreeMap<PlateId, BTreeSet<BoundaryId>>,
    /// Plate -> adjacent plate ids (via a shared boundary).
    pub plate_adjacency: BTreeMap<PlateId, BTreeSet<PlateId>>,
    /// Boundary -> incident junction ids.
    pub boundary_junctions: BTreeMap<BoundaryId, BTreeSet<JunctionId>>,
    /// Highest sequence folded so far; `-1` if no events have been applied.
    pub last_event_sequence: i64,
    /// Invariant violations observed while folding, in fold order.
    pub violations: Vec<InvariantViolation>,
}

impl TopologyState {
    fn rebuild_indices(&mut self) {
        self.plate_boundaries.clear();
        self.plate_adjacency.clear();
        self.boundary_junctions.clear();
        for (boundary_id, boundary) in &self.boundaries {
            self.plate_boundaries
                .entry(boundary.plate_a)
                .or_default()
                .insert(*boundary_id);
            self.plate_boundaries
                .entry(boundary.plate_b)
                .or_default()
                .insert(*boundary_id);
            self.plate_adjacency
                .entry(boundary.plate_a)
                .or_default()
                .insert(boundary.plate_b);
            self.plate_adjacency
                .entry(boundary.plate_b)
                .or_default()
                .insert(boundary.plate_a);
        }
        for (junction_id, junction) in &self.junctions {
            for boundary_id in &junction.boundary_ids {
                self.boundary_junctions
                    .entry(*boundary_id)
                    .or_default()
                    .insert(*junction_id);
            }
        }
    }

    fn record_violation(&mut self, invariant: &'static str, message: impl Into<String>, sequence: u64) {
        warn!(invariant, sequence, "topology invariant violation");
        self.violations.push(InvariantViolation {
            invariant,
            message: message.into(),
            sequence,
        });
    }

    fn apply(&mut self, sequence: u64, event: &TopologyEventKind) {
        match event {
            TopologyEventKind::PlateCreated { plate } => {
                self.plates.insert(
                    *plate,
                    Plate {
                        is_retired: false,
                        retirement_reason: None,
                    },
                );
            }
            TopologyEventKind::PlateRetired { plate, reason } => {
                if let Some(p) = self.plates.get_mut(plate) {
                    p.is_retired = true;
                    p.retirement_reason = Some(reason.clone());
                } else {
                    self.record_violation(
                        "plate-exists",
                        format!("PlateRetired references unknown plate {plate}"),
                        sequence,
                    );
                }
            }
            TopologyEventKind::BoundaryCreated {
                boundary,
                plate_a,
                plate_b,
                kind,
                geometry,
            } => {
                if plate_a == plate_b {
                    self.record_violation(
                        "distinct-endpoints",
                        format!("BoundaryCreated {boundary} references a single plate twice"),
                        sequence,
                    );
                }
                for (label, plate) in [("PlateA", plate_a), ("PlateB", plate_b)] {
                    match self.plates.get(plate) {
                        None => self.record_violation(
                            "endpoint-exists",
                            format!("BoundaryCreated {boundary} {label} {plate} does not exist"),
                            sequence,
                        ),
                        Some(p) if p.is_retired => self.record_violation(
                            "endpoint-not-retired",
                            format!("BoundaryCreated {boundary} {label} {plate} is retired"),
                            sequence,
                        ),
                        Some(_) => {}
                    }
                }
                self.boundaries.insert(
                    *boundary,
                    Boundary {
                        plate_a: *plate_a,
                        plate_b: *plate_b,
                        kind: *kind,
                        geometry: geometry.clone(),
                        is_retired: false,
                        retirement_reason: None,
                    },
                );
            }
            TopologyEventKind::BoundaryTypeChanged {
                boundary,
                old_type,
                new_type,
            } => {
                if let Some(b) = self.boundaries.get_mut(boundary) {
                    if let Some(expected) = old_type {
                        if *expected != b.kind {
                            self.record_violation(
                                "old-type-matches",
                                format!(
                                    "BoundaryTypeChanged {boundary} expected old type {}, found {}",
                                    expected.as_str(),
                                    b.kind.as_str()
                                ),
                                sequence,
                            );
                        }
                    }
                    b.kind = *new_type;
                } else {
                    self.record_violation(
                        "boundary-exists",
                        format!("BoundaryTypeChanged references unknown boundary {boundary}"),
                        sequence,
                    );
                }
            }
            TopologyEventKind::BoundaryGeometryUpdated { boundary, geometry } => {
                if let Some(b) = self.boundaries.get_mut(boundary) {
                    b.geometry = geometry.clone();
                } else {
                    self.record_violation(
                        "boundary-exists",
                        format!("BoundaryGeometryUpdated references unknown boundary {boundary}"),
                        sequence,
                    );
                }
            }
            TopologyEventKind::BoundaryRetired { boundary, reason } => {
                if let Some(b) = self.boundaries.get_mut(boundary) {
                    b.is_retired = true;
                    b.retirement_reason = Some(reason.clone());
                } else {
                    self.record_violation(
                        "boundary-exists",
                        format!("BoundaryRetired references unknown boundary {boundary}"),
                        sequence,
                    );
                }
            }
            TopologyEventKind::JunctionCreated {
                junction,
                boundaries,
                location,
            } => {
                for boundary_id in boundaries {
                    match self.boundaries.get(boundary_id) {
                        None => self.record_violation(
                            "incident-boundary-exists",
                            format!("JunctionCreated {junction} references unknown boundary {boundary_id}"),
                            sequence,
                        ),
                        Some(b) if b.is_retired => self.record_violation(
                            "incident-boundary-not-retired",
                            format!("JunctionCreated {junction} boundary {boundary_id} is retired"),
                            sequence,
                        ),
                        Some(_) => {}
                    }
                }
                self.junctions.insert(
                    *junction,
                    Junction {
                        boundary_ids: order_boundaries_ccw(boundaries, location, &self.boundaries),
                        location: *location,
                        is_retired: false,
                        retirement_reason: None,
                    },
                );
            }
            TopologyEventKind::JunctionUpdated {
                junction,
                boundaries,
                location,
            } => {
                if let Some(j) = self.junctions.get_mut(junction) {
                    if let Some(new_location) = location {
                        j.location = *new_location;
                    }
                    if let Some(new_boundaries) = boundaries {
                        j.boundary_ids = order_boundaries_ccw(new_boundaries, &j.location, &self.boundaries);
                    }
                } else {
                    self.record_violation(
                        "junction-exists",
                        format!("JunctionUpdated references unknown junction {junction}"),
                        sequence,
                    );
                }
            }
            TopologyEventKind::JunctionRetired { junction, reason } => {
                if let Some(j) = self.junctions.get_mut(junction) {
                    j.is_retired = true;
                    j.retirement_reason = Some(reason.clone());
                } else {
                    self.record_violation(
                        "junction-exists",
                        format!("JunctionRetired references unknown junction {junction}"),
                        sequence,
                    );
                }
            }
        }
        self.rebuild_indices();
        self.last_event_sequence = i64::try_from(sequence).unwrap_or(i64::MAX);
    }
}

/// Orders incident boundary ids CCW by tangent-plane angle from local north
/// around `location`, with `BoundaryId` as the secondary sort key
/// (`spec.md` §3).
///
/// A boundary's bearing is the tangent-plane bearing from `location` to the
/// point of its polyline farthest from `location` — a proxy for the
/// direction the boundary extends away from this junction. A boundary
/// missing from `known` (already flagged as an invariant violation by the
/// caller) or with an empty polyline sorts at bearing `0.0`.
fn order_boundaries_ccw(
    boundaries: &[BoundaryId],
    location: &SurfacePoint,
    known: &BTreeMap<BoundaryId, Boundary>,
) -> Vec<BoundaryId> {
    let mut ordered = boundaries.to_vec();
    ordered.sort_by(|a, b| {
        let angle_a = known.get(a).map_or(0.0, |boundary| boundary_bearing(location, boundary));
        let angle_b = known.get(b).map_or(0.0, |boundary| boundary_bearing(location, boundary));
        angle_a.total_cmp(&angle_b).then_with(|| a.0.cmp(&b.0))
    });
    ordered
}

/// The tangent-plane bearing from `location` to the point of `boundary`'s
/// polyline farthest from it, in radians, CCW from local north (see
/// [`tangent_bearing`]). `0.0` if the polyline is empty.
fn boundary_bearing(location: &SurfacePoint, boundary: &Boundary) -> f64 {
    boundary
        .geometry
        .polyline
        .iter()
        .max_by(|a, b| {
            squared_distance(a.normal, location.normal).total_cmp(&squared_distance(b.normal, location.normal))
        })
        .map_or(0.0, |farthest| tangent_bearing(location.normal, farthest.normal))
}

/// The tangent-plane bearing from `location` to `target` (both unit outward
/// normals), in radians, measured counterclockwise from local north around
/// `location`'s own normal (right-hand rule: positive angles rotate from
/// north towards `cross(location, north)`). `0.0` if `target` has no
/// tangent-plane component at `location` (i.e. lies along `location`'s
/// normal).
fn tangent_bearing(location: [f64; 3], target: [f64; 3]) -> f64 {
    let (north, east) = tangent_basis(location);
    let tangent = normalize3(sub3(target, scale3(location, dot3(target, location))));
    if tangent == [0.0, 0.0, 0.0] {
        return 0.0;
    }
    dot3(tangent, east).atan2(dot3(tangent, north))
}

/// The local tangent-plane basis `(north, east)` at a point `at` on the
/// unit sphere: `north` is the global north pole projected onto the
/// tangent plane, falling back to a fixed reference axis at the poles
/// themselves (where no such projection exists); `east` completes a
/// right-handed basis with `at`.
fn tangent_basis(at: [f64; 3]) -> ([f64; 3], [f64; 3]) {
    const NORTH_POLE: [f64; 3] = [0.0, 0.0, 1.0];
    const REFERENCE_AXIS: [f64; 3] = [1.0, 0.0, 0.0];
    let mut north = normalize3(sub3(NORTH_POLE, scale3(at, dot3(NORTH_POLE, at))));
    if north == [0.0, 0.0, 0.0] {
        north = normalize3(sub3(REFERENCE_AXIS, scale3(at, dot3(REFERENCE_AXIS, at))));
    }
    let east = normalize3(cross3(at, north));
    (north, east)
}

fn squared_distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    let d = sub3(a, b);
    dot3(d, d)
}

fn normalize3(v: [f64; 3]) -> [f64; 3] {
    let len = dot3(v, v).sqrt();
    if len < f64::EPSILON {
        [0.0, 0.0, 0.0]
    } else {
        [v[0] / len, v[1] / len, v[2] / len]
    }
}

fn sub3(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn scale3(v: [f64; 3], s: f64) -> [f64; 3] {
    [v[0] * s, v[1] * s, v[2] * s]
}

fn dot3(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross3(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// Selects how [`TopologyMaterializer::materialize_at_tick`] treats a target
/// tick earlier than the stream's first event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickMaterializationMode {
    /// Silently returns empty state (`LastEventSequence = -1`).
    Auto,
    /// Identical behavior to `Auto` in this implementation; reserved for a
    /// future strict mode that surfaces a validation error instead.
    Strict,
}

/// Errors raised while materializing state.
#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    /// Reading or verifying the underlying event stream failed.
    #[error(transparent)]
    Read(#[from] ReadError),
    /// The underlying key-value substrate failed.
    #[error(transparent)]
    StorageFault(#[from] StorageFault),
}

/// How many newly-folded events trigger an opportunistic snapshot.
const SNAPSHOT_CADENCE: u64 = 64;

/// Folds a stream's events into [`TopologyState`], using snapshots opportunistically.
pub struct TopologyMaterializer {
    kv: Arc<dyn KvStore>,
    events: EventStore,
}

impl TopologyMaterializer {
    /// Builds a materializer over `kv`, sharing it with an internal
    /// [`EventStore`].
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        let events = EventStore::new(kv.clone());
        Self { kv, events }
    }

    fn nearest_snapshot(
        &self,
        stream: &StreamIdentity,
        target_seq: u64,
    ) -> Result<Option<(u64, TopologyState)>, MaterializeError> {
        let prefix = stream.snapshot_key_prefix();
        let mut best: Option<(u64, TopologyState)> = None;
        for (key, value) in self.kv.iter_from(&prefix)? {
            if !key.starts_with(prefix.as_slice()) {
                break;
            }
            let Some(seq) = parse_snapshot_sequence(&prefix, &key) else {
                continue;
            };
            if seq > target_seq {
                break;
            }
            let canonical = codec::decode_canonical(&value).map_err(|e| {
                MaterializeError::StorageFault(StorageFault::Backend(e.to_string()))
            })?;
            let state = decode_state(&canonical).map_err(|e| {
                MaterializeError::StorageFault(StorageFault::Backend(e))
            })?;
            best = Some((seq, state));
        }
        Ok(best)
    }

    /// Materializes state at the given target sequence (inclusive): the
    /// nearest snapshot at or before `target_seq`, folded forward through
    /// the remaining events.
    ///
    /// # Errors
    ///
    /// Returns [`MaterializeError`] if reading or verifying the stream fails.
    #[instrument(skip(self), fields(stream = %stream.stream_key(), target_seq))]
    pub fn materialize_at_sequence(
        &self,
        stream: &StreamIdentity,
        target_seq: u64,
    ) -> Result<TopologyState, MaterializeError> {
        let (mut state, from_seq) = match self.nearest_snapshot(stream, target_seq)? {
            Some((seq, state)) => (state, seq + 1),
            None => (TopologyState::default(), 0),
        };
        let events = self.events.read(stream, from_seq)?;
        for envelope in events {
            if envelope.sequence > target_seq {
                break;
            }
            state.apply(envelope.sequence, &envelope.payload);
        }
        self.snapshot_if_needed(stream, &state)?;
        Ok(state)
    }

    /// Materializes state at the given target tick: events are folded while
    /// their `Tick <= target_tick`, stopping at the first event whose tick
    /// exceeds it. A `target_tick` before the stream's first event yields
    /// empty state with `LastEventSequence = -1`, under both
    /// [`TickMaterializationMode`] variants.
    ///
    /// # Errors
    ///
    /// Returns [`MaterializeError`] if reading or verifying the stream fails.
    #[instrument(skip(self), fields(stream = %stream.stream_key(), target_tick))]
    pub fn materialize_at_tick(
        &self,
        stream: &StreamIdentity,
        target_tick: i64,
        _mode: TickMaterializationMode,
    ) -> Result<TopologyState, MaterializeError> {
        let mut state = TopologyState::default();
        let events = self.events.read(stream, 0)?;
        for envelope in events {
            if envelope.tick > target_tick {
                break;
            }
            state.apply(envelope.sequence, &envelope.payload);
        }
        Ok(state)
    }

    /// Opportunistically persists a snapshot of `state` if enough events
    /// have accumulated since the last one. Snapshotting is purely an
    /// optimization: correctness holds identically without it
    /// (`spec.md` §4.E).
    ///
    /// # Errors
    ///
    /// Returns [`MaterializeError`] if the backend write fails.
    pub fn snapshot_if_needed(
        &self,
        stream: &StreamIdentity,
        state: &TopologyState,
    ) -> Result<(), MaterializeError> {
        if state.last_event_sequence < 0 {
            return Ok(());
        }
        #[allow(clippy::cast_sign_loss)]
        let sequence = state.last_event_sequence as u64;
        if sequence % SNAPSHOT_CADENCE != SNAPSHOT_CADENCE - 1 {
            return Ok(());
        }
        let canonical = encode_state(sequence, state);
        let bytes = codec::encode_canonical(&canonical)
            .map_err(|e| MaterializeError::StorageFault(StorageFault::Backend(e.to_string())))?;
        self.kv.put(&stream.snapshot_key(sequence), &bytes)?;
        Ok(())
    }
}

fn parse_snapshot_sequence(prefix: &[u8], key: &[u8]) -> Option<u64> {
    let suffix = key.strip_prefix(prefix)?;
    let bytes: [u8; 8] = suffix.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[allow(clippy::expect_used)] // field names below are distinct string literals, never collide
fn encode_state(sequence: u64, state: &TopologyState) -> CanonicalValue {
    let mut envelope = CanonicalMap::new();
    envelope
        .insert("sequence", CanonicalValue::UInt(sequence))
        .expect("distinct keys");
    envelope
        .insert("state", state.to_canonical())
        .expect("distinct keys");
    CanonicalValue::Map(envelope)
}

fn opt_str(reason: &Option<String>) -> CanonicalValue {
    reason
        .as_ref()
        .map_or(CanonicalValue::Nil, |r| CanonicalValue::Str(r.clone()))
}

fn decode_opt_str(value: Option<&CanonicalValue>) -> Option<String> {
    match value {
        Some(CanonicalValue::Str(s)) => Some(s.clone()),
        _ => None,
    }
}

fn decode_id_str(value: Option<&CanonicalValue>, field: &str) -> Result<u128, String> {
    let s = value
        .and_then(CanonicalValue::as_str)
        .ok_or_else(|| format!("snapshot entity missing {field}"))?;
    let hex: String = s.chars().filter(|c| *c != '-').collect();
    if hex.len() != 32 {
        return Err(format!("snapshot entity {field} was not a uuid"));
    }
    u128::from_str_radix(&hex, 16).map_err(|_| format!("snapshot entity {field} was not hex"))
}

impl CanonicalEncode for TopologyState {
    #[allow(clippy::expect_used)] // field names below are distinct string literals, never collide
    fn to_canonical(&self) -> CanonicalValue {
        let mut map = CanonicalMap::new();
        map.insert(
            "plates",
            CanonicalValue::Array(
                self.plates
                    .iter()
                    .map(|(id, p)| {
                        let mut m = CanonicalMap::new();
                        m.insert("id", CanonicalValue::Str(id.to_uuid_string()))
                            .expect("distinct keys");
                        m.insert("is_retired", CanonicalValue::Bool(p.is_retired))
                            .expect("distinct keys");
                        m.insert("retirement_reason", opt_str(&p.retirement_reason))
                            .expect("distinct keys");
                        CanonicalValue::Map(m)
                    })
                    .collect(),
            ),
        )
        .expect("distinct keys");
        map.insert(
            "boundaries",
            CanonicalValue::Array(
                self.boundaries
                    .iter()
                    .map(|(id, b)| {
                        let mut m = CanonicalMap::new();
                        m.insert("id", CanonicalValue::Str(id.to_uuid_string()))
                            .expect("distinct keys");
                        m.insert("plate_a", CanonicalValue::Str(b.plate_a.to_uuid_string()))
                            .expect("distinct keys");
                        m.insert("plate_b", CanonicalValue::Str(b.plate_b.to_uuid_string()))
                            .expect("distinct keys");
                        m.insert("kind", b.kind.to_canonical()).expect("distinct keys");
                        m.insert("geometry", b.geometry.to_canonical())
                            .expect("distinct keys");
                        m.insert("is_retired", CanonicalValue::Bool(b.is_retired))
                            .expect("distinct keys");
                        m.insert("retirement_reason", opt_str(&b.retirement_reason))
                            .expect("distinct keys");
                        CanonicalValue::Map(m)
                    })
                    .collect(),
            ),
        )
        .expect("distinct keys");
        map.insert(
            "junctions",
            CanonicalValue::Array(
                self.junctions
                    .iter()
                    .map(|(id, j)| {
                        let mut m = CanonicalMap::new();
                        m.insert("id", CanonicalValue::Str(id.to_uuid_string()))
                            .expect("distinct keys");
                        m.insert(
                            "boundary_ids",
                            CanonicalValue::Array(
                                j.boundary_ids
                                    .iter()
                                    .map(|b| CanonicalValue::Str(b.to_uuid_string()))
                                    .collect(),
                            ),
                        )
                        .expect("distinct keys");
                        m.insert("location", j.location.to_canonical())
                            .expect("distinct keys");
                        m.insert("is_retired", CanonicalValue::Bool(j.is_retired))
                            .expect("distinct keys");
                        m.insert("retirement_reason", opt_str(&j.retirement_reason))
                            .expect("distinct keys");
                        CanonicalValue::Map(m)
                    })
                    .collect(),
            ),
        )
        .expect("distinct keys");
        map.insert(
            "last_event_sequence",
            CanonicalValue::Int(self.last_event_sequence),
        )
        .expect("distinct keys");
        CanonicalValue::Map(map)
    }
}

fn decode_boundary_type(value: Option<&CanonicalValue>) -> Result<BoundaryType, String> {
    match value.and_then(CanonicalValue::as_str) {
        Some("Divergent") => Ok(BoundaryType::Divergent),
        Some("Convergent") => Ok(BoundaryType::Convergent),
        Some("Transform") => Ok(BoundaryType::Transform),
        _ => Err("snapshot boundary had unknown kind".to_string()),
    }
}

fn decode_surface_point(value: &CanonicalValue) -> Result<SurfacePoint, String> {
    let items = value
        .as_array()
        .ok_or_else(|| "snapshot location was not an array".to_string())?;
    if items.len() != 4 {
        return Err("snapshot location array must have 4 elements".to_string());
    }
    let f = |i: usize| -> Result<f64, String> {
        match &items[i] {
            CanonicalValue::Float(v) => Ok(*v),
            _ => Err("snapshot location element was not a float".to_string()),
        }
    };
    Ok(SurfacePoint {
        normal: [f(0)?, f(1)?, f(2)?],
        radius: f(3)?,
    })
}

fn decode_geometry(value: Option<&CanonicalValue>) -> Result<BoundaryGeometry, String> {
    let items = value
        .and_then(CanonicalValue::as_array)
        .ok_or_else(|| "snapshot boundary missing geometry".to_string())?;
    let polyline = items
        .iter()
        .map(decode_surface_point)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(BoundaryGeometry { polyline })
}

/// Decodes a [`TopologyState`] snapshot, reconstructing every entity the
/// fold rules in [`TopologyState::apply`] would have produced. Any decode
/// failure is surfaced to the caller rather than silently degrading to a
/// partial state: `spec.md` §4.E requires snapshots and full replay to
/// produce equivalent state, never a "best effort" fallback.
fn decode_state(canonical: &CanonicalValue) -> Result<TopologyState, String> {
    let map = canonical
        .as_map()
        .ok_or_else(|| "snapshot state was not a map".to_string())?;
    let mut state = TopologyState::default();

    let plates = map
        .get("plates")
        .and_then(CanonicalValue::as_array)
        .ok_or_else(|| "snapshot missing plates".to_string())?;
    for entry in plates {
        let m = entry
            .as_map()
            .ok_or_else(|| "snapshot plate entry was not a map".to_string())?;
        let id = PlateId(decode_id_str(m.get("id"), "plate id")?);
        state.plates.insert(
            id,
            Plate {
                is_retired: m.get("is_retired").and_then(CanonicalValue::as_bool).unwrap_or(false),
                retirement_reason: decode_opt_str(m.get("retirement_reason")),
            },
        );
    }

    let boundaries = map
        .get("boundaries")
        .and_then(CanonicalValue::as_array)
        .ok_or_else(|| "snapshot missing boundaries".to_string())?;
    for entry in boundaries {
        let m = entry
            .as_map()
            .ok_or_else(|| "snapshot boundary entry was not a map".to_string())?;
        let id = BoundaryId(decode_id_str(m.get("id"), "boundary id")?);
        state.boundaries.insert(
            id,
            Boundary {
                plate_a: PlateId(decode_id_str(m.get("plate_a"), "boundary plate_a")?),
                plate_b: PlateId(decode_id_str(m.get("plate_b"), "boundary plate_b")?),
                kind: decode_boundary_type(m.get("kind"))?,
                geometry: decode_geometry(m.get("geometry"))?,
                is_retired: m.get("is_retired").and_then(CanonicalValue::as_bool).unwrap_or(false),
                retirement_reason: decode_opt_str(m.get("retirement_reason")),
            },
        );
    }

    let junctions = map
        .get("junctions")
        .and_then(CanonicalValue::as_array)
        .ok_or_else(|| "snapshot missing junctions".to_string())?;
    for entry in junctions {
        let m = entry
            .as_map()
            .ok_or_else(|| "snapshot junction entry was not a map".to_string())?;
        let id = JunctionId(decode_id_str(m.get("id"), "junction id")?);
        let boundary_ids = m
            .get("boundary_ids")
            .and_then(CanonicalValue::as_array)
            .ok_or_else(|| "snapshot junction missing boundary_ids".to_string())?
            .iter()
            .map(|v| decode_id_str(Some(v), "junction boundary id").map(BoundaryId))
            .collect::<Result<Vec<_>, _>>()?;
        let location = decode_surface_point(
            m.get("location")
                .ok_or_else(|| "snapshot junction missing location".to_string())?,
        )?;
        state.junctions.insert(
            id,
            Junction {
                boundary_ids,
                location,
                is_retired: m.get("is_retired").and_then(CanonicalValue::as_bool).unwrap_or(false),
                retirement_reason: decode_opt_str(m.get("retirement_reason")),
            },
        );
    }

    state.last_event_sequence = map
        .get("last_event_sequence")
        .and_then(CanonicalValue::as_int)
        .ok_or_else(|| "snapshot missing last_event_sequence".to_string())?;
    state.rebuild_indices();
    Ok(state)
}
