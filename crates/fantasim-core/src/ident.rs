// SPDX-License-Identifier: Apache-2.0
//! Identity primitives (component I): deterministic UUIDv7-style ids drawn
//! from a seeded RNG, and the shared seed-derivation helper used both here
//! and by the DES runtime's per-tick RNG (component F).

use rand_core::RngCore;
use rand_pcg::Pcg32;

/// Canonical 256-bit hash used for hash-chaining event records and snapshots.
pub type Sha256Hash = [u8; 32];

/// All-zero hash, used as `PreviousHash` for the genesis record of a stream.
pub const GENESIS_PREVIOUS_HASH: Sha256Hash = [0u8; 32];

/// Advances a `SplitMix64` generator in place and returns its next output.
///
/// `SplitMix64` is a simple, fast, well-mixed generator used here purely as
/// a deterministic seed-folding step, not as the runtime's bulk RNG — the
/// runtime RNG itself is [`Pcg32`].
fn splitmix64_next(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Derives a fresh, deterministic [`Pcg32`] from arbitrary seed material.
///
/// The material is folded word-by-word through `SplitMix64` into a single
/// 64-bit state, which is then used to draw the two 64-bit values `Pcg32`
/// needs (seed, stream). Two calls with identical `material` always produce
/// generators with identical future output — this is the pure function
/// `spec.md` §4.F requires for `(ScenarioSeed, StreamIdentity, Tick)` derivation.
#[must_use]
pub fn seed_rng(material: &[&[u8]]) -> Pcg32 {
    let mut state: u64 = 0;
    for part in material {
        for chunk in part.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            state ^= u64::from_le_bytes(word);
            state = splitmix64_next(&mut state);
        }
        // Domain-separate between parts so `(["ab"], ["c"])` and `(["a"],
        // ["bc"])` never fold to the same state.
        state = splitmix64_next(&mut state.wrapping_add(0x01));
    }
    let seed = splitmix64_next(&mut state);
    let stream = splitmix64_next(&mut state);
    Pcg32::new(seed, stream)
}

fn uuid7_bits_from_rng(rng: &mut impl RngCore) -> u128 {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    bytes[6] = (bytes[6] & 0x0F) | 0x70; // version nibble = 7
    bytes[8] = (bytes[8] & 0x3F) | 0x80; // variant bits = 10
    u128::from_be_bytes(bytes)
}

fn format_uuid(bits: u128) -> String {
    let b = bits.to_be_bytes();
    format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&b[0..4]),
        hex::encode(&b[4..6]),
        hex::encode(&b[6..8]),
        hex::encode(&b[8..10]),
        hex::encode(&b[10..16]),
    )
}

macro_rules! define_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[repr(transparent)]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
        pub struct $name(pub u128);

        impl $name {
            /// Draws a deterministic id from `rng`, overwriting the UUIDv7
            /// version/variant bits.
            #[must_use]
            pub fn from_rng(rng: &mut impl RngCore) -> Self {
                Self(uuid7_bits_from_rng(rng))
            }

            /// Non-deterministic constructor for host bootstrap only.
            ///
            /// Prefer [`Self::from_rng`] with a seeded generator everywhere
            /// determinism matters; this exists solely so a host process can
            /// mint an id before any scenario seed is available.
            #[must_use]
            #[deprecated(note = "non-deterministic; use from_rng with a seeded generator")]
            pub fn new_random() -> Self {
                let mut rng = rand::thread_rng();
                Self(uuid7_bits_from_rng(&mut rng))
            }

            /// Renders the canonical 8-4-4-4-12 lowercase hex string form.
            #[must_use]
            pub fn to_uuid_string(&self) -> String {
                format_uuid(self.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.to_uuid_string())
            }
        }
    };
}

define_id!(PlateId, "Identifier for a tectonic plate entity.");
define_id!(BoundaryId, "Identifier for a boundary entity between two plates.");
define_id!(JunctionId, "Identifier for a junction where boundaries meet.");
define_id!(EventId, "Identifier for a single appended event envelope.");
define_id!(
    MotionSegmentId,
    "Identifier for a rotation-segment reference in a provenance chain."
);
define_id!(
    ProductInstanceId,
    "Identifier for one computed instance of a derived artifact."
);
