// SPDX-License-Identifier: Apache-2.0
//! Reconstruction policy and provenance chains (component H).
//!
//! A [`ReconstructionPolicy`] pins every choice a query-time reconstruction
//! makes that truth itself does not determine — which kinematics model,
//! which frame, how strict to be about partition gaps. It hashes to a
//! [`PolicyHash`] via the canonical codec so two queries against the same
//! truth with the same policy are provably asking the same question.

use crate::codec::{self, sha256_hex, CanonicalEncode, CanonicalMap, CanonicalValue};
use crate::ident::{BoundaryId, JunctionId, PlateId};

/// How strictly a reconstruction should treat partition gaps and missing
/// kinematics coverage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strictness {
    /// Any gap or ambiguity is a hard error.
    Strict,
    /// Gaps are tolerated and filled with the nearest available segment.
    Lenient,
    /// Gaps are tolerated and silently skipped.
    Permissive,
}

impl Strictness {
    fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "Strict",
            Self::Lenient => "Lenient",
            Self::Permissive => "Permissive",
        }
    }
}

/// The kind of query a [`ReconstructionPolicy`] is being validated against,
/// used only to decide which optional fields §4.H requires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryKind {
    /// Reconstruct plate/boundary geometry at a reference frame.
    Reconstruct,
    /// Query instantaneous velocity at a point.
    QueryVelocity,
    /// Analyze boundary kinematics (convergence, divergence, transform rate).
    BoundaryAnalytics,
    /// Trace a point's motion path through time.
    MotionPath,
    /// Trace a flowline through a velocity field.
    Flowline,
}

/// Sampling parameters for boundary-analytics queries.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundarySamplingPolicy {
    /// Number of sample points along each boundary segment.
    pub samples_per_segment: u32,
    /// Minimum segment length, in the frame's native units, below which
    /// sampling is skipped.
    pub min_segment_length: f64,
}

impl CanonicalEncode for BoundarySamplingPolicy {
    #[allow(clippy::expect_used)] // field names below are distinct string literals, never collide
    fn to_canonical(&self) -> CanonicalValue {
        let mut map = CanonicalMap::new();
        map.insert("samples_per_segment", CanonicalValue::UInt(u64::from(self.samples_per_segment)))
            .expect("distinct keys");
        map.insert("min_segment_length", CanonicalValue::Float(self.min_segment_length))
            .expect("distinct keys");
        CanonicalValue::Map(map)
    }
}

/// Step-size and method choices for path/flowline integration.
#[derive(Clone, Debug, PartialEq)]
pub struct IntegrationPolicy {
    /// Integrator step size, in ticks.
    pub step_ticks: u32,
    /// Maximum number of steps before truncating the path.
    pub max_steps: u32,
}

impl CanonicalEncode for IntegrationPolicy {
    #[allow(clippy::expect_used)] // field names below are distinct string literals, never collide
    fn to_canonical(&self) -> CanonicalValue {
        let mut map = CanonicalMap::new();
        map.insert("step_ticks", CanonicalValue::UInt(u64::from(self.step_ticks)))
            .expect("distinct keys");
        map.insert("max_steps", CanonicalValue::UInt(u64::from(self.max_steps)))
            .expect("distinct keys");
        CanonicalValue::Map(map)
    }
}

/// Pins every query-time choice a reconstruction makes that truth itself
/// does not determine (`spec.md` §4.H).
#[derive(Clone, Debug, PartialEq)]
pub struct ReconstructionPolicy {
    /// The reference frame plate/feature reconstructions are expressed in.
    pub frame: String,
    /// The kinematics model id to apply.
    pub kinematics_model: String,
    /// Allowed gap, in ticks, between adjacent rotation segments before the
    /// policy's `strictness` governs how the gap is treated.
    pub partition_tolerance: u32,
    /// Required for [`QueryKind::BoundaryAnalytics`].
    pub boundary_sampling: Option<BoundarySamplingPolicy>,
    /// Required for [`QueryKind::MotionPath`] and [`QueryKind::Flowline`].
    pub integration_policy: Option<IntegrationPolicy>,
    /// How strictly to treat partition gaps and missing coverage.
    pub strictness: Strictness,
}

/// A computed hash identifying a [`ReconstructionPolicy`] value, used to
/// prove two queries shared identical reconstruction assumptions.
pub type PolicyHash = String;

/// Errors raised validating or hashing a [`ReconstructionPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// `Frame` is required for `Reconstruct`/`QueryVelocity` but was empty.
    #[error("query {0:?} requires a non-empty frame")]
    MissingFrame(QueryKind),
    /// `KinematicsModel` is always required but was empty.
    #[error("kinematics_model must not be empty")]
    MissingKinematicsModel,
    /// `BoundarySampling` is required for `BoundaryAnalytics` but absent.
    #[error("query {0:?} requires boundary_sampling")]
    MissingBoundarySampling(QueryKind),
    /// `IntegrationPolicy` is required for `MotionPath`/`Flowline` but absent.
    #[error("query {0:?} requires integration_policy")]
    MissingIntegrationPolicy(QueryKind),
    /// Canonical encoding of the policy failed.
    #[error("policy encoding failed: {0}")]
    Encode(String),
}

impl ReconstructionPolicy {
    /// Validates that every field §4.H requires for `query` is present.
    ///
    /// `KinematicsModel` and `PartitionTolerance` are always required;
    /// `Frame` is required for `Reconstruct`/`QueryVelocity`;
    /// `BoundarySampling` is required for `BoundaryAnalytics`;
    /// `IntegrationPolicy` is required for `MotionPath`/`Flowline`.
    /// `PartitionTolerance` has no empty state (it is a plain `u32`), so it
    /// is always satisfied once present in the struct.
    ///
    /// # Errors
    ///
    /// Returns the first missing required field found, in the order above.
    pub fn validate_for(&self, query: QueryKind) -> Result<(), PolicyError> {
        if self.kinematics_model.is_empty() {
            return Err(PolicyError::MissingKinematicsModel);
        }
        match query {
            QueryKind::Reconstruct | QueryKind::QueryVelocity => {
                if self.frame.is_empty() {
                    return Err(PolicyError::MissingFrame(query));
                }
            }
            QueryKind::BoundaryAnalytics => {
                if self.boundary_sampling.is_none() {
                    return Err(PolicyError::MissingBoundarySampling(query));
                }
            }
            QueryKind::MotionPath | QueryKind::Flowline => {
                if self.integration_policy.is_none() {
                    return Err(PolicyError::MissingIntegrationPolicy(query));
                }
            }
        }
        Ok(())
    }

    /// Computes this policy's [`PolicyHash`] via the canonical codec.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Encode`] if canonical encoding fails (only
    /// possible if `frame`/`kinematics_model` somehow produced a duplicate
    /// map key, which the field layout here prevents).
    pub fn compute_hash(&self) -> Result<PolicyHash, PolicyError> {
        let bytes = codec::encode_canonical(&self.to_canonical()).map_err(|e| PolicyError::Encode(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

impl CanonicalEncode for ReconstructionPolicy {
    #[allow(clippy::expect_used)] // field names below are distinct string literals, never collide
    fn to_canonical(&self) -> CanonicalValue {
        let mut map = CanonicalMap::new();
        let insert = |m: &mut CanonicalMap, k: &str, v: CanonicalValue| {
            m.insert(k, v).expect("policy fields are distinct");
        };
        insert(&mut map, "frame", CanonicalValue::Str(self.frame.clone()));
        insert(&mut map, "kinematics_model", CanonicalValue::Str(self.kinematics_model.clone()));
        insert(
            &mut map,
            "partition_tolerance",
            CanonicalValue::UInt(u64::from(self.partition_tolerance)),
        );
        insert(
            &mut map,
            "boundary_sampling",
            self.boundary_sampling
                .as_ref()
                .map_or(CanonicalValue::Nil, CanonicalEncode::to_canonical),
        );
        insert(
            &mut map,
            "integration_policy",
            self.integration_policy
                .as_ref()
                .map_or(CanonicalValue::Nil, CanonicalEncode::to_canonical),
        );
        insert(&mut map, "strictness", CanonicalValue::Str(self.strictness.as_str().to_string()));
        CanonicalValue::Map(map)
    }
}

/// Which kinematics model version produced a reconstruction, carried inside
/// a [`ProvenanceChain`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KinematicsModelVersion {
    /// The kinematics model id.
    pub model_id: String,
    /// The model's version string.
    pub version: String,
}

/// The full audit trail for one derived query result (`spec.md` §4.H):
/// which truth entities it drew on, which kinematics model and rotation
/// segments it applied, and at what tick the query and its reference
/// topology were taken.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvenanceChain {
    /// Plate ids the reconstruction drew on.
    pub source_plate_ids: Vec<PlateId>,
    /// Boundary ids the reconstruction drew on.
    pub source_boundary_ids: Vec<BoundaryId>,
    /// Junction ids the reconstruction drew on.
    pub source_junction_ids: Vec<JunctionId>,
    /// The kinematics model and version applied.
    pub kinematics_model: KinematicsModelVersion,
    /// The rotation segments consulted, as opaque reference strings.
    pub rotation_segment_refs: Vec<String>,
    /// Hash of the topology stream state the reconstruction read.
    pub topology_stream_hash: String,
    /// The tick of the topology state used as the reconstruction's reference.
    pub topology_reference_tick: i64,
    /// The tick the query itself was issued at.
    pub query_tick: i64,
    /// The version of the query contract that produced this chain.
    pub query_contract_version: u32,
    /// The identity of the solver implementation that answered the query.
    pub solver_implementation: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn base_policy() -> ReconstructionPolicy {
        ReconstructionPolicy {
            frame: String::new(),
            kinematics_model: "euler-poles-v1".to_string(),
            partition_tolerance: 4,
            boundary_sampling: None,
            integration_policy: None,
            strictness: Strictness::Strict,
        }
    }

    // ── 1. empty kinematics_model is always rejected ──────────────────────

    #[test]
    fn missing_kinematics_model_is_rejected_for_every_query() {
        let mut policy = base_policy();
        policy.kinematics_model = String::new();
        assert_eq!(
            policy.validate_for(QueryKind::Reconstruct).unwrap_err(),
            PolicyError::MissingKinematicsModel
        );
    }

    // ── 2. Reconstruct/QueryVelocity require Frame ────────────────────────

    #[test]
    fn reconstruct_requires_frame() {
        let policy = base_policy();
        assert_eq!(
            policy.validate_for(QueryKind::Reconstruct).unwrap_err(),
            PolicyError::MissingFrame(QueryKind::Reconstruct)
        );
    }

    #[test]
    fn reconstruct_succeeds_with_frame() {
        let mut policy = base_policy();
        policy.frame = "ITRF2014".to_string();
        assert!(policy.validate_for(QueryKind::Reconstruct).is_ok());
    }

    // ── 3. BoundaryAnalytics requires BoundarySampling ────────────────────

    #[test]
    fn boundary_analytics_requires_sampling() {
        let policy = base_policy();
        assert_eq!(
            policy.validate_for(QueryKind::BoundaryAnalytics).unwrap_err(),
            PolicyError::MissingBoundarySampling(QueryKind::BoundaryAnalytics)
        );
    }

    #[test]
    fn boundary_analytics_succeeds_with_sampling() {
        let mut policy = base_policy();
        policy.boundary_sampling = Some(BoundarySamplingPolicy {
            samples_per_segment: 8,
            min_segment_length: 0.5,
        });
        assert!(policy.validate_for(QueryKind::BoundaryAnalytics).is_ok());
    }

    // ── 4. MotionPath/Flowline require IntegrationPolicy ──────────────────

    #[test]
    fn motion_path_requires_integration_policy() {
        let policy = base_policy();
        assert_eq!(
            policy.validate_for(QueryKind::MotionPath).unwrap_err(),
            PolicyError::MissingIntegrationPolicy(QueryKind::MotionPath)
        );
    }

    #[test]
    fn flowline_succeeds_with_integration_policy() {
        let mut policy = base_policy();
        policy.integration_policy = Some(IntegrationPolicy { step_ticks: 1, max_steps: 100 });
        assert!(policy.validate_for(QueryKind::Flowline).is_ok());
    }

    // ── 5. hash is a pure function of policy content ──────────────────────

    #[test]
    fn compute_hash_is_deterministic() {
        let policy = base_policy();
        assert_eq!(policy.compute_hash().unwrap(), policy.compute_hash().unwrap());
    }

    #[test]
    fn distinct_strictness_changes_hash() {
        let mut lenient = base_policy();
        lenient.strictness = Strictness::Lenient;
        let strict = base_policy();
        assert_ne!(lenient.compute_hash().unwrap(), strict.compute_hash().unwrap());
    }

    // ── 6. QueryVelocity shares the Frame requirement with Reconstruct ────

    #[test]
    fn query_velocity_requires_frame() {
        let policy = base_policy();
        assert_eq!(
            policy.validate_for(QueryKind::QueryVelocity).unwrap_err(),
            PolicyError::MissingFrame(QueryKind::QueryVelocity)
        );
    }
}
