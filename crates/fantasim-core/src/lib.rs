// SPDX-License-Identifier: Apache-2.0
//! `fantasim-core`: a deterministic, event-sourced simulation substrate for
//! plate-tectonic worlds.
//!
//! The crate is organized around nine components, each a module:
//!
//! - [`codec`] — canonical MessagePack encoding, fingerprinting, hashing.
//! - [`kv`] — the ordered byte-keyed key-value substrate abstraction.
//! - [`stream`] — stream identity and persisted key construction.
//! - [`event_store`] — the append-only, hash-chained truth event log.
//! - [`materializer`] — folding events into queryable topology state.
//! - [`scheduler`] — the discrete-event scheduler and DES runtime.
//! - [`cache`] — the content-addressed derived-artifact cache.
//! - [`policy`] — reconstruction policy hashing and provenance chains.
//! - [`ident`] — deterministic identity primitives and seeded RNG.
//!
//! Solvers, kinematics models, and query engines are external collaborators:
//! this crate owns truth, scheduling, caching, and identity, not domain
//! physics.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::suboptimal_flops,
    clippy::redundant_pub_crate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::use_self,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::similar_names,
    clippy::too_many_lines
)]

pub mod cache;
pub mod codec;
pub mod event_store;
pub mod ident;
pub mod kv;
pub mod materializer;
pub mod policy;
pub mod scheduler;
pub mod stream;

pub use cache::{
    ArtifactGenerationContext, ArtifactGenerator, CacheError, CacheKey, DerivedArtifactCache,
    DerivedProductProvenance, GenerationFailure, GeneratorIdentity, InvalidationEvent,
    InvalidationReason, Manifest, StorageDescriptor, StorageMode,
};
pub use codec::{
    decode_canonical, empty_params_hash, encode_canonical, encode_fingerprint_array, sha256_hex,
    total_order_cmp, CanonicalEncode, CanonicalMap, CanonicalValue, DecodeError, EncodeError,
    QuantizedEulerPoleRotation,
};
pub use event_store::{
    AppendError, AppendOptions, AppendResult, BoundaryGeometry, BoundaryType, EventDraft,
    EventEnvelope, EventStore, ReadError, StreamCapabilities, SurfacePoint, TickPolicy,
    TopologyEventKind,
};
pub use ident::{
    seed_rng, BoundaryId, EventId, JunctionId, MotionSegmentId, PlateId, ProductInstanceId,
    Sha256Hash,
};
pub use kv::{KvStore, MemoryKv, StorageFault, WriteBatch, WriteOp};
pub use materializer::{
    Boundary, InvariantViolation, Junction, MaterializeError, Plate, TickMaterializationMode,
    TopologyMaterializer, TopologyState,
};
pub use policy::{
    BoundarySamplingPolicy, IntegrationPolicy, KinematicsModelVersion, PolicyError, PolicyHash,
    ProvenanceChain, QueryKind, ReconstructionPolicy, Strictness,
};
pub use scheduler::{
    CancellationToken, DesContext, DesRunOptions, DesRuntime, DispatchError, Driver, DriverOutput,
    Kind, RunCounts, Scheduler, ScheduledWorkItem, Sphere, Trigger, WorkItemPayload,
};
pub use stream::{StreamIdentity, ValidationError};

#[cfg(feature = "sled-backend")]
pub use kv::SledKv;
