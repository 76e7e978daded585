// SPDX-License-Identifier: Apache-2.0
//! Stream identity and key construction (component C).
//!
//! A [`StreamIdentity`] is the 5-tuple `(VariantId, BranchId, LLevel,
//! Domain, Model)` that names an authoritative event log. Validation happens
//! once, at construction, via [`StreamIdentity::new`] — every other
//! subsystem treats an already-constructed `StreamIdentity` as valid.

/// Errors raised while constructing or parsing a [`StreamIdentity`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// `VariantId`, `BranchId`, or `Model` was empty.
    #[error("{field} must not be empty")]
    EmptyField {
        /// Name of the offending field.
        field: &'static str,
    },
    /// `Domain` did not match `[A-Za-z0-9._]` with no leading/trailing/
    /// consecutive dots.
    #[error("invalid domain token: {0:?}")]
    InvalidDomain(String),
    /// A URN string did not match `urn:fantasim:<V>:<B>:L<n>:<Domain>:<M>`.
    #[error("malformed stream urn: {0:?}")]
    MalformedUrn(String),
}

/// The 5-tuple identity of a truth event stream.
///
/// Streams partition all truth: events from distinct identities never
/// interact. Two `StreamIdentity` values are equal iff every field is equal;
/// `Model` is always stored normalized to the `M<n>` prefix form.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamIdentity {
    variant: String,
    branch: String,
    l_level: u32,
    domain: String,
    model: String,
}

impl StreamIdentity {
    /// Constructs a validated stream identity.
    ///
    /// `model` is normalized to the `M<n>` prefix form (`"0"` -> `"M0"`,
    /// `"m1"` -> `"M1"`); a model already prefixed with `M`/`m` keeps its
    /// digits.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyField`] if `variant`, `branch`, or
    /// `model` is empty, or [`ValidationError::InvalidDomain`] if `domain`
    /// does not match the dot-notation grammar.
    pub fn new(
        variant: impl Into<String>,
        branch: impl Into<String>,
        l_level: u32,
        domain: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let variant = variant.into();
        let branch = branch.into();
        let domain = domain.into();
        let model_raw = model.into();

        if variant.is_empty() {
            return Err(ValidationError::EmptyField { field: "VariantId" });
        }
        if branch.is_empty() {
            return Err(ValidationError::EmptyField { field: "BranchId" });
        }
        if model_raw.is_empty() {
            return Err(ValidationError::EmptyField { field: "Model" });
        }
        validate_domain(&domain)?;
        let model = normalize_model(&model_raw);

        Ok(Self {
            variant,
            branch,
            l_level,
            domain,
            model,
        })
    }

    /// Parses a canonical URN of the form
    /// `urn:fantasim:<V>:<B>:L<n>:<Domain>:<M>`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MalformedUrn`] if the string does not
    /// match that shape, or any error [`Self::new`] can return.
    pub fn parse_urn(urn: &str) -> Result<Self, ValidationError> {
        let rest = urn
            .strip_prefix("urn:fantasim:")
            .ok_or_else(|| ValidationError::MalformedUrn(urn.to_string()))?;
        let parts: Vec<&str> = rest.split(':').collect();
        let [variant, branch, l_level_token, domain, model] = parts.as_slice() else {
            return Err(ValidationError::MalformedUrn(urn.to_string()));
        };
        let l_level_str = l_level_token
            .strip_prefix('L')
            .ok_or_else(|| ValidationError::MalformedUrn(urn.to_string()))?;
        let l_level: u32 = l_level_str
            .parse()
            .map_err(|_| ValidationError::MalformedUrn(urn.to_string()))?;
        Self::new(*variant, *branch, l_level, *domain, *model)
    }

    /// Renders the canonical URN: `urn:fantasim:<V>:<B>:L<n>:<Domain>:<M>`.
    #[must_use]
    pub fn to_urn(&self) -> String {
        format!(
            "urn:fantasim:{}:{}:L{}:{}:{}",
            self.variant, self.branch, self.l_level, self.domain, self.model
        )
    }

    /// Renders the stream key: the URN with its `urn:fantasim:` prefix
    /// dropped, e.g. `V1:main:L0:geo.plates:M0`.
    #[must_use]
    pub fn stream_key(&self) -> String {
        format!(
            "{}:{}:L{}:{}:{}",
            self.variant, self.branch, self.l_level, self.domain, self.model
        )
    }

    /// The variant component.
    #[must_use]
    pub fn variant(&self) -> &str {
        &self.variant
    }

    /// The branch component.
    #[must_use]
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// The l-level component.
    #[must_use]
    pub fn l_level(&self) -> u32 {
        self.l_level
    }

    /// The domain component.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The normalized model component (always `M<n>` form).
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    // ── persisted key construction (spec.md §4.C / §6) ──────────────────

    fn base_key(&self) -> String {
        format!("S:{}", self.stream_key())
    }

    /// Builds the event-record key for `sequence`:
    /// `S:<…>:E:` + 8-byte big-endian sequence.
    #[must_use]
    pub fn event_key(&self, sequence: u64) -> Vec<u8> {
        let mut key = format!("{}:E:", self.base_key()).into_bytes();
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    /// Builds the prefix shared by every event-record key in this stream,
    /// used as the seek key for a forward scan from `from_sequence`.
    #[must_use]
    pub fn event_key_prefix(&self) -> Vec<u8> {
        format!("{}:E:", self.base_key()).into_bytes()
    }

    /// Builds the snapshot key for `sequence`: `S:<…>:Snap:` + 8-byte
    /// big-endian sequence, so that byte-wise key order equals numeric
    /// sequence order (the same reasoning as [`Self::event_key`]).
    #[must_use]
    pub fn snapshot_key(&self, sequence: u64) -> Vec<u8> {
        let mut key = format!("{}:Snap:", self.base_key()).into_bytes();
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    /// Builds the prefix shared by every snapshot key in this stream.
    #[must_use]
    pub fn snapshot_key_prefix(&self) -> Vec<u8> {
        format!("{}:Snap:", self.base_key()).into_bytes()
    }

    /// Builds the capabilities key: `S:<…>:Meta:Caps`.
    #[must_use]
    pub fn capabilities_key(&self) -> Vec<u8> {
        format!("{}:Meta:Caps", self.base_key()).into_bytes()
    }

    /// Builds the prefix shared by every derived-artifact key in this
    /// stream, regardless of product type: `S:<…>:Derived:`.
    #[must_use]
    pub fn derived_prefix(&self) -> Vec<u8> {
        format!("{}:Derived:", self.base_key()).into_bytes()
    }

    /// Builds the derived-manifest key for `(product_type, fingerprint_hex)`.
    #[must_use]
    pub fn derived_manifest_key(&self, product_type: &str, fingerprint_hex: &str) -> Vec<u8> {
        format!(
            "{}:Derived:{product_type}:{fingerprint_hex}:Manifest",
            self.base_key()
        )
        .into_bytes()
    }

    /// Builds the derived-payload key for `(product_type, fingerprint_hex)`.
    #[must_use]
    pub fn derived_payload_key(&self, product_type: &str, fingerprint_hex: &str) -> Vec<u8> {
        format!(
            "{}:Derived:{product_type}:{fingerprint_hex}:Payload",
            self.base_key()
        )
        .into_bytes()
    }
}

fn validate_domain(domain: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::InvalidDomain(domain.to_string());
    if domain.is_empty() {
        return Err(invalid());
    }
    if domain.starts_with('.') || domain.ends_with('.') || domain.contains("..") {
        return Err(invalid());
    }
    if !domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
    {
        return Err(invalid());
    }
    Ok(())
}

fn normalize_model(raw: &str) -> String {
    let digits = raw.strip_prefix(['M', 'm']).unwrap_or(raw);
    format!("M{digits}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // ── 1. model normalization ────────────────────────────────────────

    #[test]
    fn model_normalizes_bare_digit() {
        let s = StreamIdentity::new("V1", "main", 0, "geo.plates", "0").unwrap();
        assert_eq!(s.model(), "M0");
    }

    #[test]
    fn model_normalizes_lowercase_prefix() {
        let s = StreamIdentity::new("V1", "main", 0, "geo.plates", "m1").unwrap();
        assert_eq!(s.model(), "M1");
    }

    // ── 2. urn round-trip ────────────────────────────────────────────

    #[test]
    fn urn_round_trips() {
        let s = StreamIdentity::new("V1", "main", 0, "geo.plates", "0").unwrap();
        let urn = s.to_urn();
        assert_eq!(urn, "urn:fantasim:V1:main:L0:geo.plates:M0");
        let parsed = StreamIdentity::parse_urn(&urn).unwrap();
        assert_eq!(parsed, s);
    }

    // ── 3. stream key drops the urn prefix ───────────────────────────

    #[test]
    fn stream_key_drops_urn_prefix() {
        let s = StreamIdentity::new("V1", "main", 0, "geo.plates", "0").unwrap();
        assert_eq!(s.stream_key(), "V1:main:L0:geo.plates:M0");
    }

    // ── 4. domain grammar rejects leading/trailing/consecutive dots ──

    #[test]
    fn domain_rejects_leading_dot() {
        assert!(StreamIdentity::new("V1", "main", 0, ".plates", "0").is_err());
    }

    #[test]
    fn domain_rejects_trailing_dot() {
        assert!(StreamIdentity::new("V1", "main", 0, "plates.", "0").is_err());
    }

    #[test]
    fn domain_rejects_consecutive_dots() {
        assert!(StreamIdentity::new("V1", "main", 0, "geo..plates", "0").is_err());
    }

    #[test]
    fn domain_rejects_invalid_chars() {
        assert!(StreamIdentity::new("V1", "main", 0, "geo/plates", "0").is_err());
    }

    // ── 5. empty fields are rejected ─────────────────────────────────

    #[test]
    fn empty_variant_is_rejected() {
        assert!(StreamIdentity::new("", "main", 0, "geo.plates", "0").is_err());
    }

    // ── 6. event key is big-endian sequence for lexicographic = numeric ──

    #[test]
    fn event_keys_sort_lexicographically_in_sequence_order() {
        let s = StreamIdentity::new("V1", "main", 0, "geo.plates", "0").unwrap();
        let k0 = s.event_key(0);
        let k1 = s.event_key(1);
        let k256 = s.event_key(256);
        assert!(k0 < k1);
        assert!(k1 < k256);
    }

    // ── 7. key layout matches spec.md §6 ─────────────────────────────

    #[test]
    fn derived_keys_match_layout() {
        let s = StreamIdentity::new("V1", "main", 0, "geo.plates", "0").unwrap();
        let manifest = s.derived_manifest_key("TopologySnapshot", "ab12");
        assert_eq!(
            String::from_utf8(manifest).unwrap(),
            "S:V1:main:L0:geo.plates:M0:Derived:TopologySnapshot:ab12:Manifest"
        );
    }
}
