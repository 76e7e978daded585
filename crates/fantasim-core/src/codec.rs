// SPDX-License-Identifier: Apache-2.0
//! Canonical encoding and fingerprinting (component A).
//!
//! Every value that must hash or compare identically across processes and
//! storage backends is first converted into a [`CanonicalValue`], then
//! encoded to MessagePack bytes by [`encode_canonical`]. Map keys are sorted
//! byte-wise ascending and duplicate keys are rejected at encode time;
//! fingerprint inputs are encoded as a fixed-arity array, never a map, via
//! [`encode_fingerprint_array`].
//!
//! Doubles never appear in a fingerprint input. Where a floating-point value
//! must be compared deterministically (e.g. sorting derived-product output),
//! use [`total_order_cmp`] rather than `f64::partial_cmp`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Errors produced while encoding a [`CanonicalValue`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// A map literal contained the same key twice.
    #[error("duplicate canonical map key: {0}")]
    DuplicateKey(String),
    /// A fingerprint input contained a non-finite double (NaN or infinity).
    #[error("non-finite double in fingerprint input")]
    NonFiniteInFingerprint,
    /// The underlying MessagePack writer failed (out-of-memory style fault).
    #[error("messagepack write failed: {0}")]
    Write(String),
}

/// Errors produced while decoding canonical MessagePack bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The encoded value used a schema/version this decoder does not recognize.
    #[error("unknown encoding version: {0}")]
    UnknownVersion(u32),
    /// The bytes were not valid canonical MessagePack for the expected shape.
    #[error("malformed canonical encoding: {0}")]
    Malformed(String),
}

/// An ordered map of UTF-8 string keys to [`CanonicalValue`]s.
///
/// Keys are kept in byte-wise ascending order by construction (`BTreeMap`
/// over `String`, whose `Ord` is byte-wise for UTF-8). [`insert`](Self::insert)
/// rejects a second insertion of the same key rather than silently
/// overwriting it, matching the encode-time duplicate-key rejection in
/// `spec.md` §4.A.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CanonicalMap(BTreeMap<String, CanonicalValue>);

impl CanonicalMap {
    /// Creates an empty canonical map.
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Inserts `key` -> `value`, failing if `key` is already present.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::DuplicateKey`] if `key` was already inserted.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: CanonicalValue,
    ) -> Result<(), EncodeError> {
        let key = key.into();
        if self.0.contains_key(&key) {
            return Err(EncodeError::DuplicateKey(key));
        }
        self.0.insert(key, value);
        Ok(())
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Looks up `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&CanonicalValue> {
        self.0.get(key)
    }
}

/// A value in the canonical data model: the common shape every encodable
/// entity is converted into before hashing or serializing.
#[derive(Clone, Debug, PartialEq)]
pub enum CanonicalValue {
    /// Absence of a value.
    Nil,
    /// Boolean.
    Bool(bool),
    /// Signed integer, encoded with MessagePack's shortest-form integer encoding.
    Int(i64),
    /// Unsigned integer, encoded with MessagePack's shortest-form integer encoding.
    UInt(u64),
    /// A finite or non-finite IEEE-754 double. Rejected by
    /// [`encode_fingerprint_array`] when non-finite; see `spec.md` §4.A.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Opaque bytes.
    Bytes(Vec<u8>),
    /// Order-preserving array.
    Array(Vec<CanonicalValue>),
    /// Sorted, duplicate-free map.
    Map(CanonicalMap),
}

/// Implemented by entities that have a canonical representation suitable for
/// hashing and cross-process comparison.
pub trait CanonicalEncode {
    /// Converts `self` into the shared [`CanonicalValue`] model.
    fn to_canonical(&self) -> CanonicalValue;
}

impl CanonicalValue {
    /// Borrows the inner map, if this is [`CanonicalValue::Map`].
    #[must_use]
    pub fn as_map(&self) -> Option<&CanonicalMap> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Borrows the inner array, if this is [`CanonicalValue::Array`].
    #[must_use]
    pub fn as_array(&self) -> Option<&[CanonicalValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Borrows the inner string, if this is [`CanonicalValue::Str`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Copies the inner value as a `u64`, if this is [`CanonicalValue::UInt`].
    #[must_use]
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::UInt(u) => Some(*u),
            _ => None,
        }
    }

    /// Copies the inner value as an `i64`, if this is [`CanonicalValue::Int`]
    /// or [`CanonicalValue::UInt`].
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    /// Borrows the inner bytes, if this is [`CanonicalValue::Bytes`].
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Copies the inner value as a `bool`, if this is [`CanonicalValue::Bool`].
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Encodes `value` as canonical MessagePack bytes.
///
/// # Errors
///
/// Returns [`EncodeError::DuplicateKey`] if a nested map was built outside
/// [`CanonicalMap::insert`]'s protection (not possible via the public API,
/// but checked defensively during encode) or [`EncodeError::Write`] if the
/// underlying writer fails.
pub fn encode_canonical(value: &CanonicalValue) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::new();
    write_value(&mut buf, value)?;
    Ok(buf)
}

/// Encodes the six-element fingerprint envelope described in `spec.md` §4.A:
/// `[source_stream, boundary_kind, last_sequence, generator_id,
/// generator_version, params_hash]`, as a fixed-arity MessagePack array
/// (never a map).
///
/// # Errors
///
/// Returns [`EncodeError::NonFiniteInFingerprint`] if any leaf value is a
/// non-finite [`CanonicalValue::Float`].
pub fn encode_fingerprint_array(fields: [CanonicalValue; 6]) -> Result<Vec<u8>, EncodeError> {
    for field in &fields {
        reject_non_finite(field)?;
    }
    let mut buf = Vec::new();
    write_array_body(&mut buf, &fields)?;
    Ok(buf)
}

/// Computes the lowercase-hex SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}

/// The canonical empty-params hash: `SHA256(0x80)`.
///
/// `0x80` is the single-byte MessagePack encoding of an empty map, i.e. the
/// canonical encoding of `CanonicalValue::Map(CanonicalMap::new())`.
#[must_use]
pub fn empty_params_hash() -> String {
    sha256_hex(&[0x80])
}

fn reject_non_finite(value: &CanonicalValue) -> Result<(), EncodeError> {
    match value {
        CanonicalValue::Float(f) if !f.is_finite() => Err(EncodeError::NonFiniteInFingerprint),
        CanonicalValue::Array(items) => items.iter().try_for_each(reject_non_finite),
        CanonicalValue::Map(map) => map.0.values().try_for_each(reject_non_finite),
        _ => Ok(()),
    }
}

// MessagePack primitives are written by hand rather than via a `Serialize`
// derive or a higher-level encoder call: `spec.md` §4.A pins shortest-form
// integer encoding and map-key ordering exactly, and getting either wrong
// changes every downstream hash. Writing the handful of markers this crate
// needs directly keeps that contract in one reviewable place, the way
// `warp-core` hand-writes its own canonical digest framing rather than
// delegating to a derive macro.
fn write_value(out: &mut Vec<u8>, value: &CanonicalValue) -> Result<(), EncodeError> {
    match value {
        CanonicalValue::Nil => {
            out.push(0xc0);
            Ok(())
        }
        CanonicalValue::Bool(b) => {
            out.push(if *b { 0xc3 } else { 0xc2 });
            Ok(())
        }
        CanonicalValue::Int(i) => {
            write_int(out, *i);
            Ok(())
        }
        CanonicalValue::UInt(u) => {
            write_uint(out, *u);
            Ok(())
        }
        CanonicalValue::Float(f) => {
            out.push(0xcb);
            out.extend_from_slice(&f.to_bits().to_be_bytes());
            Ok(())
        }
        CanonicalValue::Str(s) => {
            write_str(out, s);
            Ok(())
        }
        CanonicalValue::Bytes(b) => {
            write_bin(out, b);
            Ok(())
        }
        CanonicalValue::Array(items) => write_array_body(out, items),
        CanonicalValue::Map(map) => write_map_body(out, map),
    }
}

fn write_array_body(out: &mut Vec<u8>, items: &[CanonicalValue]) -> Result<(), EncodeError> {
    write_array_len(out, items.len());
    for item in items {
        write_value(out, item)?;
    }
    Ok(())
}

fn write_map_body(out: &mut Vec<u8>, map: &CanonicalMap) -> Result<(), EncodeError> {
    write_map_len(out, map.0.len());
    // BTreeMap iterates in ascending key order already, which is byte-wise
    // ascending for UTF-8 `String` keys.
    for (key, value) in &map.0 {
        write_str(out, key);
        write_value(out, value)?;
    }
    Ok(())
}

/// Shortest-form signed integer encoding.
fn write_int(out: &mut Vec<u8>, value: i64) {
    if (0..=127).contains(&value) {
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        out.push(value as u8);
    } else if (-32..0).contains(&value) {
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        out.push((value as i8) as u8);
    } else if let Ok(v) = i8::try_from(value) {
        out.push(0xd0);
        out.push(v as u8);
    } else if let Ok(v) = i16::try_from(value) {
        out.push(0xd1);
        out.extend_from_slice(&v.to_be_bytes());
    } else if let Ok(v) = i32::try_from(value) {
        out.push(0xd2);
        out.extend_from_slice(&v.to_be_bytes());
    } else {
        out.push(0xd3);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

/// Shortest-form unsigned integer encoding.
fn write_uint(out: &mut Vec<u8>, value: u64) {
    if value <= 127 {
        #[allow(clippy::cast_possible_truncation)]
        out.push(value as u8);
    } else if let Ok(v) = u8::try_from(value) {
        out.push(0xcc);
        out.push(v);
    } else if let Ok(v) = u16::try_from(value) {
        out.push(0xcd);
        out.extend_from_slice(&v.to_be_bytes());
    } else if let Ok(v) = u32::try_from(value) {
        out.push(0xce);
        out.extend_from_slice(&v.to_be_bytes());
    } else {
        out.push(0xcf);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len();
    if len <= 31 {
        #[allow(clippy::cast_possible_truncation)]
        out.push(0xa0 | (len as u8));
    } else if let Ok(len8) = u8::try_from(len) {
        out.push(0xd9);
        out.push(len8);
    } else if let Ok(len16) = u16::try_from(len) {
        out.push(0xda);
        out.extend_from_slice(&len16.to_be_bytes());
    } else {
        out.push(0xdb);
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
    out.extend_from_slice(bytes);
}

fn write_bin(out: &mut Vec<u8>, bytes: &[u8]) {
    let len = bytes.len();
    if let Ok(len8) = u8::try_from(len) {
        out.push(0xc4);
        out.push(len8);
    } else if let Ok(len16) = u16::try_from(len) {
        out.push(0xc5);
        out.extend_from_slice(&len16.to_be_bytes());
    } else {
        out.push(0xc6);
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
    out.extend_from_slice(bytes);
}

fn write_array_len(out: &mut Vec<u8>, len: usize) {
    if len <= 15 {
        #[allow(clippy::cast_possible_truncation)]
        out.push(0x90 | (len as u8));
    } else if let Ok(len16) = u16::try_from(len) {
        out.push(0xdc);
        out.extend_from_slice(&len16.to_be_bytes());
    } else {
        out.push(0xdd);
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
}

fn write_map_len(out: &mut Vec<u8>, len: usize) {
    if len <= 15 {
        #[allow(clippy::cast_possible_truncation)]
        out.push(0x80 | (len as u8));
    } else if let Ok(len16) = u16::try_from(len) {
        out.push(0xde);
        out.extend_from_slice(&len16.to_be_bytes());
    } else {
        out.push(0xdf);
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
}

/// Decodes canonical MessagePack bytes produced by [`encode_canonical`] back
/// into a [`CanonicalValue`].
///
/// # Errors
///
/// Returns [`DecodeError::Malformed`] if `bytes` does not hold a single
/// well-formed MessagePack value, or if trailing bytes remain after it, or
/// [`DecodeError::DuplicateKey`]-shaped malformed error if a decoded map
/// repeats a key.
pub fn decode_canonical(bytes: &[u8]) -> Result<CanonicalValue, DecodeError> {
    let mut cursor = Cursor { buf: bytes, pos: 0 };
    let value = read_value(&mut cursor)?;
    if cursor.pos != cursor.buf.len() {
        return Err(DecodeError::Malformed("trailing bytes after value".into()));
    }
    Ok(value)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| DecodeError::Malformed("unexpected end of input".into()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }
}

#[allow(
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn read_value(c: &mut Cursor<'_>) -> Result<CanonicalValue, DecodeError> {
    let tag = c.byte()?;
    match tag {
        0xc0 => Ok(CanonicalValue::Nil),
        0xc2 => Ok(CanonicalValue::Bool(false)),
        0xc3 => Ok(CanonicalValue::Bool(true)),
        0x00..=0x7f => Ok(CanonicalValue::UInt(u64::from(tag))),
        0xe0..=0xff => Ok(CanonicalValue::Int(i64::from(tag as i8))),
        0xcc => Ok(CanonicalValue::UInt(u64::from(c.byte()?))),
        0xcd => Ok(CanonicalValue::UInt(u64::from(be_u16(c.take(2)?)))),
        0xce => Ok(CanonicalValue::UInt(u64::from(be_u32(c.take(4)?)))),
        0xcf => Ok(CanonicalValue::UInt(be_u64(c.take(8)?))),
        0xd0 => Ok(CanonicalValue::Int(i64::from(c.byte()? as i8))),
        0xd1 => Ok(CanonicalValue::Int(i64::from(be_u16(c.take(2)?) as i16))),
        0xd2 => Ok(CanonicalValue::Int(i64::from(be_u32(c.take(4)?) as i32))),
        0xd3 => Ok(CanonicalValue::Int(be_u64(c.take(8)?) as i64)),
        0xcb => Ok(CanonicalValue::Float(f64::from_bits(be_u64(c.take(8)?)))),
        0xa0..=0xbf => read_str(c, usize::from(tag & 0x1f)),
        0xd9 => {
            let len = usize::from(c.byte()?);
            read_str(c, len)
        }
        0xda => {
            let len = usize::from(be_u16(c.take(2)?));
            read_str(c, len)
        }
        0xdb => {
            let len = be_u32(c.take(4)?) as usize;
            read_str(c, len)
        }
        0xc4 => {
            let len = usize::from(c.byte()?);
            Ok(CanonicalValue::Bytes(c.take(len)?.to_vec()))
        }
        0xc5 => {
            let len = usize::from(be_u16(c.take(2)?));
            Ok(CanonicalValue::Bytes(c.take(len)?.to_vec()))
        }
        0xc6 => {
            let len = be_u32(c.take(4)?) as usize;
            Ok(CanonicalValue::Bytes(c.take(len)?.to_vec()))
        }
        0x90..=0x9f => read_array(c, usize::from(tag & 0x0f)),
        0xdc => {
            let len = usize::from(be_u16(c.take(2)?));
            read_array(c, len)
        }
        0xdd => {
            let len = be_u32(c.take(4)?) as usize;
            read_array(c, len)
        }
        0x80..=0x8f => read_map(c, usize::from(tag & 0x0f)),
        0xde => {
            let len = usize::from(be_u16(c.take(2)?));
            read_map(c, len)
        }
        0xdf => {
            let len = be_u32(c.take(4)?) as usize;
            read_map(c, len)
        }
        other => Err(DecodeError::Malformed(format!("unknown tag byte 0x{other:02x}"))),
    }
}

fn read_str(c: &mut Cursor<'_>, len: usize) -> Result<CanonicalValue, DecodeError> {
    let bytes = c.take(len)?;
    let s = std::str::from_utf8(bytes)
        .map_err(|_| DecodeError::Malformed("string is not valid utf-8".into()))?;
    Ok(CanonicalValue::Str(s.to_string()))
}

fn read_array(c: &mut Cursor<'_>, len: usize) -> Result<CanonicalValue, DecodeError> {
    let mut items = Vec::with_capacity(len);
    for _ in 0..len {
        items.push(read_value(c)?);
    }
    Ok(CanonicalValue::Array(items))
}

fn read_map(c: &mut Cursor<'_>, len: usize) -> Result<CanonicalValue, DecodeError> {
    let mut map = CanonicalMap::new();
    for _ in 0..len {
        let key = match read_value(c)? {
            CanonicalValue::Str(s) => s,
            _ => return Err(DecodeError::Malformed("map key was not a string".into())),
        };
        let value = read_value(c)?;
        map.insert(key, value)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    }
    Ok(CanonicalValue::Map(map))
}

fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Compares two doubles using the deterministic total order required for
/// reproducible sorts (`spec.md` §4.A, §8 invariant 11):
/// - `NaN` sorts after every other number, NaN payload bits break ties among NaNs.
/// - `-0.0 < +0.0`.
/// - otherwise, normal numeric order.
#[must_use]
pub fn total_order_cmp(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => a.to_bits().cmp(&b.to_bits()),
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            if a == 0.0 && b == 0.0 {
                // -0.0 < +0.0: the "more negative" sign sorts first.
                b.is_sign_negative().cmp(&a.is_sign_negative())
            } else {
                match a.partial_cmp(&b) {
                    Some(ordering) => ordering,
                    None => Ordering::Equal,
                }
            }
        }
    }
}

/// A microdegree-quantized Euler pole rotation, the canonical wire form for
/// any rotation angle that would otherwise require a double in a fingerprint
/// input (`spec.md` §4.A, §9).
///
/// - `azimuth_udeg` is wrapped to `(-180°, 180°]`, stored as microdegrees.
/// - `elevation_udeg` is clamped to `[-90°, 90°]`, stored as microdegrees.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuantizedEulerPoleRotation {
    /// Azimuth in microdegrees, wrapped to `(-180_000_000, 180_000_000]`.
    pub azimuth_udeg: i32,
    /// Elevation in microdegrees, clamped to `[-90_000_000, 90_000_000]`.
    pub elevation_udeg: i32,
}

const MICRODEGREES_PER_DEGREE: f64 = 1_000_000.0;
const FULL_TURN_UDEG: i64 = 360_000_000;
const HALF_TURN_UDEG: i64 = 180_000_000;
const QUARTER_TURN_UDEG: i32 = 90_000_000;

impl QuantizedEulerPoleRotation {
    /// Builds a quantized rotation from floating-point degrees, wrapping
    /// azimuth to `(-180, 180]` and clamping elevation to `[-90, 90]`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_lossless
    )]
    pub fn from_degrees(azimuth_deg: f64, elevation_deg: f64) -> Self {
        let az_udeg = (azimuth_deg * MICRODEGREES_PER_DEGREE).round() as i64;
        let wrapped = wrap_half_open(az_udeg, HALF_TURN_UDEG, FULL_TURN_UDEG);
        let el_udeg = (elevation_deg * MICRODEGREES_PER_DEGREE).round() as i64;
        let clamped = el_udeg.clamp(-i64::from(QUARTER_TURN_UDEG), i64::from(QUARTER_TURN_UDEG));
        Self {
            azimuth_udeg: wrapped as i32,
            elevation_udeg: clamped as i32,
        }
    }
}

/// Wraps `value` into `(-half, half]` for a period of `full`.
fn wrap_half_open(value: i64, half: i64, full: i64) -> i64 {
    let mut v = value % full;
    if v <= -half {
        v += full;
    } else if v > half {
        v -= full;
    }
    v
}

impl CanonicalEncode for QuantizedEulerPoleRotation {
    fn to_canonical(&self) -> CanonicalValue {
        CanonicalValue::Array(vec![
            CanonicalValue::Int(i64::from(self.azimuth_udeg)),
            CanonicalValue::Int(i64::from(self.elevation_udeg)),
        ])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // ── 1. empty map is a single 0x80 byte ──────────────────────────────

    #[test]
    fn empty_map_encodes_to_0x80() {
        let bytes = encode_canonical(&CanonicalValue::Map(CanonicalMap::new())).unwrap();
        assert_eq!(bytes, vec![0x80]);
    }

    // ── 2. empty-params hash golden vector ──────────────────────────────

    #[test]
    fn empty_params_hash_matches_golden_vector() {
        assert_eq!(
            empty_params_hash(),
            "76be8b528d0075f7aae98d6fa57a6d3c83ae480a8469e668d7b0af968995ac71"
        );
    }

    // ── 3. golden fingerprint vector ─────────────────────────────────────

    #[test]
    fn golden_fingerprint_matches_spec_vector() {
        let fields = [
            CanonicalValue::Str("S:V1:Bmain:L0:Plates:M0:Events".to_string()),
            CanonicalValue::Str("sequence".to_string()),
            CanonicalValue::UInt(0),
            CanonicalValue::Str("TestGen".to_string()),
            CanonicalValue::Str("1.0.0".to_string()),
            CanonicalValue::Str(empty_params_hash()),
        ];
        let bytes = encode_fingerprint_array(fields).unwrap();
        let fingerprint = sha256_hex(&bytes);
        assert_eq!(
            fingerprint,
            "b22cabf7cd82e2f6a172c1bf11e9e56510a0a084a130fbfbf0a06e05a0d0157e"
        );
    }

    // ── 4. field order sensitivity ───────────────────────────────────────

    #[test]
    fn swapping_generator_fields_changes_fingerprint() {
        let base = [
            CanonicalValue::Str("S:V1:Bmain:L0:Plates:M0:Events".to_string()),
            CanonicalValue::Str("sequence".to_string()),
            CanonicalValue::UInt(0),
            CanonicalValue::Str("TestGen".to_string()),
            CanonicalValue::Str("1.0.0".to_string()),
            CanonicalValue::Str(empty_params_hash()),
        ];
        let swapped = [
            base[0].clone(),
            base[1].clone(),
            base[2].clone(),
            base[4].clone(),
            base[3].clone(),
            base[5].clone(),
        ];
        let base_fp = sha256_hex(&encode_fingerprint_array(base).unwrap());
        let swapped_fp = sha256_hex(&encode_fingerprint_array(swapped).unwrap());
        assert_ne!(base_fp, swapped_fp);
    }

    // ── 5. duplicate keys are rejected ──────────────────────────────────

    #[test]
    fn duplicate_map_key_is_rejected() {
        let mut map = CanonicalMap::new();
        map.insert("a", CanonicalValue::Int(1)).unwrap();
        let err = map.insert("a", CanonicalValue::Int(2)).unwrap_err();
        assert_eq!(err, EncodeError::DuplicateKey("a".to_string()));
    }

    // ── 6. map keys sorted byte-wise ascending regardless of insert order ─

    #[test]
    fn map_keys_sorted_regardless_of_insertion_order() {
        let mut map = CanonicalMap::new();
        map.insert("zebra", CanonicalValue::Nil).unwrap();
        map.insert("alpha", CanonicalValue::Nil).unwrap();
        map.insert("mango", CanonicalValue::Nil).unwrap();
        let bytes = encode_canonical(&CanonicalValue::Map(map)).unwrap();
        let alpha_pos = find_subslice(&bytes, b"alpha").unwrap();
        let mango_pos = find_subslice(&bytes, b"mango").unwrap();
        let zebra_pos = find_subslice(&bytes, b"zebra").unwrap();
        assert!(alpha_pos < mango_pos);
        assert!(mango_pos < zebra_pos);
    }

    fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }

    // ── 7. non-finite doubles rejected only in fingerprint arrays ────────

    #[test]
    fn non_finite_float_rejected_in_fingerprint() {
        let fields = [
            CanonicalValue::Str("s".to_string()),
            CanonicalValue::Str("k".to_string()),
            CanonicalValue::UInt(0),
            CanonicalValue::Str("g".to_string()),
            CanonicalValue::Str("v".to_string()),
            CanonicalValue::Float(f64::NAN),
        ];
        let err = encode_fingerprint_array(fields).unwrap_err();
        assert_eq!(err, EncodeError::NonFiniteInFingerprint);
    }

    // ── 8. total order: NaN sorts after all numbers ──────────────────────

    #[test]
    fn total_order_nan_sorts_last() {
        assert_eq!(total_order_cmp(1.0, f64::NAN), Ordering::Less);
        assert_eq!(total_order_cmp(f64::NAN, 1.0), Ordering::Greater);
        assert_eq!(total_order_cmp(f64::INFINITY, f64::NAN), Ordering::Less);
    }

    // ── 9. total order: negative zero sorts before positive zero ─────────

    #[test]
    fn total_order_negative_zero_before_positive_zero() {
        assert_eq!(total_order_cmp(-0.0, 0.0), Ordering::Less);
        assert_eq!(total_order_cmp(0.0, -0.0), Ordering::Greater);
    }

    // ── 10. quantized rotation wraps azimuth and clamps elevation ────────

    #[test]
    fn quantized_rotation_wraps_and_clamps() {
        let r = QuantizedEulerPoleRotation::from_degrees(190.0, 95.0);
        assert_eq!(r.azimuth_udeg, -170_000_000);
        assert_eq!(r.elevation_udeg, 90_000_000);
    }

    // ── 11. round-trip: encode then decode-by-reencode is byte-identical ─

    #[test]
    fn reencoding_canonical_value_is_byte_identical() {
        let mut map = CanonicalMap::new();
        map.insert("b", CanonicalValue::Int(-5)).unwrap();
        map.insert("a", CanonicalValue::Array(vec![CanonicalValue::Bool(true)]))
            .unwrap();
        let value = CanonicalValue::Map(map);
        let first = encode_canonical(&value).unwrap();
        let second = encode_canonical(&value).unwrap();
        assert_eq!(first, second);
    }

    // ── 12. decode recovers an encoded map and round-trips to the same bytes ─

    #[test]
    fn decode_round_trips_through_reencode() {
        let mut map = CanonicalMap::new();
        map.insert("name", CanonicalValue::Str("plate".into()))
            .unwrap();
        map.insert("count", CanonicalValue::UInt(7)).unwrap();
        map.insert(
            "tags",
            CanonicalValue::Array(vec![CanonicalValue::Int(-1), CanonicalValue::Bool(false)]),
        )
        .unwrap();
        let value = CanonicalValue::Map(map);
        let encoded = encode_canonical(&value).unwrap();
        let decoded = decode_canonical(&encoded).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(encode_canonical(&decoded).unwrap(), encoded);
    }

    // ── 13. decode rejects trailing bytes ─────────────────────────────────

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = encode_canonical(&CanonicalValue::UInt(1)).unwrap();
        bytes.push(0xff);
        assert!(decode_canonical(&bytes).is_err());
    }
}
