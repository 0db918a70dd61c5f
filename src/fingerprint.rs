//! Serializer / Fingerprinter
//!
//! Deterministic cache-key material for arbitrary call parameters.
//!
//! - [`Fingerprinter::serialize`] - canonical, key-order-independent JSON text
//! - [`Fingerprinter::generate_fingerprint`] - cheap structural summary that
//!   samples large collections instead of walking them
//! - [`Fingerprinter::generate_hash`] - FNV-1a over the fingerprint
//!
//! The `*_tracked` variants memoize per [`ObjectId`]. Entries live until
//! [`Fingerprinter::invalidate`] is called, which the engine does when the
//! owning call context goes back to its pool.
//!
//! Nothing here fails: values that cannot be represented degrade to a
//! type-tagged placeholder string.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

/// Placeholder emitted when nesting exceeds the configured depth
pub const DEPTH_PLACEHOLDER: &str = "\"[Circular]\"";

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a hash
#[inline]
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Stable identity of a tracked object (assigned by its owner at creation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectId(pub u64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obj-{}", self.0)
    }
}

/// Fingerprinter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Collections up to this many elements are summarized in full
    pub sample_threshold: usize,
    /// Number of leading elements sampled from large collections
    pub sample_head: usize,
    /// Nesting depth after which values become a placeholder
    pub max_depth: usize,
    /// Strings longer than this are summarized by length and hash
    pub max_string_len: usize,
    /// Maximum number of memoized objects
    pub memo_capacity: usize,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            sample_threshold: 16,
            sample_head: 3,
            max_depth: 32,
            max_string_len: 64,
            memo_capacity: 10_000,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Memo {
    serialized: Option<String>,
    fingerprint: Option<String>,
    hash: Option<u32>,
}

/// Fingerprinter statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct FingerprintStats {
    /// Number of full computations performed
    pub computations: u64,
    /// Number of answers served from the memo
    pub memo_hits: u64,
    /// Objects currently memoized
    pub memo_entries: usize,
}

/// Canonical serializer and structural fingerprinter
#[derive(Debug)]
pub struct Fingerprinter {
    config: FingerprintConfig,
    memo: Mutex<HashMap<ObjectId, Memo>>,
    computations: AtomicU64,
    memo_hits: AtomicU64,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(FingerprintConfig::default())
    }
}

impl Fingerprinter {
    /// Create a fingerprinter with the given configuration
    pub fn new(config: FingerprintConfig) -> Self {
        Self {
            config,
            memo: Mutex::new(HashMap::new()),
            computations: AtomicU64::new(0),
            memo_hits: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Untracked operations
    // =========================================================================

    /// Canonical JSON text with object keys sorted
    pub fn serialize(&self, value: &Value) -> String {
        self.computations.fetch_add(1, Ordering::Relaxed);
        let mut out = String::new();
        self.write_canonical(value, 0, &mut out);
        out
    }

    /// Serialize any `Serialize` value; unrepresentable inputs become a placeholder
    pub fn serialize_any<T: Serialize + ?Sized>(&self, value: &T) -> String {
        match serde_json::to_value(value) {
            Ok(v) => self.serialize(&v),
            Err(_) => unserializable::<T>(),
        }
    }

    /// Structural fingerprint (lossy for large collections)
    pub fn generate_fingerprint(&self, value: &Value) -> String {
        self.computations.fetch_add(1, Ordering::Relaxed);
        let mut out = String::new();
        self.write_fingerprint(value, 0, &mut out);
        out
    }

    /// Fingerprint of any `Serialize` value
    pub fn fingerprint_any<T: Serialize + ?Sized>(&self, value: &T) -> String {
        match serde_json::to_value(value) {
            Ok(v) => self.generate_fingerprint(&v),
            Err(_) => unserializable::<T>(),
        }
    }

    /// FNV-1a hash of the fingerprint (not collision-free)
    pub fn generate_hash(&self, value: &Value) -> u32 {
        fnv1a(self.generate_fingerprint(value).as_bytes())
    }

    // =========================================================================
    // Identity-memoized operations
    // =========================================================================

    /// Memoized [`Self::serialize`] for the object identified by `id`
    pub fn serialize_tracked(&self, id: ObjectId, value: &Value) -> String {
        if let Some(s) = self.memo.lock().get(&id).and_then(|m| m.serialized.clone()) {
            self.memo_hits.fetch_add(1, Ordering::Relaxed);
            return s;
        }
        let s = self.serialize(value);
        self.remember(id, |m| m.serialized = Some(s.clone()));
        s
    }

    /// Memoized [`Self::generate_fingerprint`] for the object identified by `id`
    pub fn fingerprint_tracked(&self, id: ObjectId, value: &Value) -> String {
        if let Some(s) = self.memo.lock().get(&id).and_then(|m| m.fingerprint.clone()) {
            self.memo_hits.fetch_add(1, Ordering::Relaxed);
            return s;
        }
        let s = self.generate_fingerprint(value);
        self.remember(id, |m| m.fingerprint = Some(s.clone()));
        s
    }

    /// Memoized [`Self::generate_hash`] for the object identified by `id`
    pub fn hash_tracked(&self, id: ObjectId, value: &Value) -> u32 {
        if let Some(h) = self.memo.lock().get(&id).and_then(|m| m.hash) {
            self.memo_hits.fetch_add(1, Ordering::Relaxed);
            return h;
        }
        let h = fnv1a(self.fingerprint_tracked(id, value).as_bytes());
        self.remember(id, |m| m.hash = Some(h));
        h
    }

    /// Drop every memoized result for `id`
    pub fn invalidate(&self, id: ObjectId) -> bool {
        self.memo.lock().remove(&id).is_some()
    }

    /// Drop the whole memo
    pub fn clear(&self) {
        self.memo.lock().clear();
    }

    /// Current statistics
    pub fn stats(&self) -> FingerprintStats {
        FingerprintStats {
            computations: self.computations.load(Ordering::Relaxed),
            memo_hits: self.memo_hits.load(Ordering::Relaxed),
            memo_entries: self.memo.lock().len(),
        }
    }

    fn remember(&self, id: ObjectId, update: impl FnOnce(&mut Memo)) {
        let mut memo = self.memo.lock();
        if !memo.contains_key(&id) && memo.len() >= self.config.memo_capacity {
            trace!(object = %id, "fingerprint memo full, result not memoized");
            return;
        }
        update(memo.entry(id).or_default());
    }

    // =========================================================================
    // Writers
    // =========================================================================

    fn write_canonical(&self, value: &Value, depth: usize, out: &mut String) {
        if depth > self.config.max_depth {
            out.push_str(DEPTH_PLACEHOLDER);
            return;
        }
        match value {
            Value::Null => out.push_str("null"),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Number(n) => out.push_str(&n.to_string()),
            Value::String(s) => push_quoted(s, out),
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    self.write_canonical(item, depth + 1, out);
                }
                out.push(']');
            }
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.into_iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    push_quoted(key, out);
                    out.push(':');
                    self.write_canonical(&map[key], depth + 1, out);
                }
                out.push('}');
            }
        }
    }

    fn write_fingerprint(&self, value: &Value, depth: usize, out: &mut String) {
        if depth > self.config.max_depth {
            out.push_str(DEPTH_PLACEHOLDER);
            return;
        }
        match value {
            Value::Null => out.push_str("null"),
            Value::Bool(b) => {
                let _ = write!(out, "b:{}", b);
            }
            Value::Number(n) => {
                let _ = write!(out, "n:{}", n);
            }
            Value::String(s) => {
                if s.len() <= self.config.max_string_len {
                    out.push_str("s:");
                    push_quoted(s, out);
                } else {
                    let _ = write!(out, "s{}#{:08x}", s.len(), fnv1a(s.as_bytes()));
                }
            }
            Value::Array(items) => {
                if items.len() <= self.config.sample_threshold {
                    out.push_str("a[");
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            out.push(',');
                        }
                        self.write_fingerprint(item, depth + 1, out);
                    }
                } else {
                    let _ = write!(out, "a{}[", items.len());
                    for (n, idx) in self.sample_positions(items.len()).into_iter().enumerate() {
                        if n > 0 {
                            out.push(',');
                        }
                        let _ = write!(out, "{}=", idx);
                        self.write_fingerprint(&items[idx], depth + 1, out);
                    }
                }
                out.push(']');
            }
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                if keys.len() <= self.config.sample_threshold {
                    out.push_str("o{");
                    for (i, key) in keys.iter().enumerate() {
                        if i > 0 {
                            out.push(',');
                        }
                        push_quoted(key, out);
                        out.push(':');
                        self.write_fingerprint(&map[*key], depth + 1, out);
                    }
                } else {
                    let mut key_set = String::new();
                    for key in &keys {
                        key_set.push_str(key);
                        key_set.push('\u{1f}');
                    }
                    let _ = write!(out, "o{}#{:08x}{{", keys.len(), fnv1a(key_set.as_bytes()));
                    for (n, idx) in self.sample_positions(keys.len()).into_iter().enumerate() {
                        if n > 0 {
                            out.push(',');
                        }
                        let key = keys[idx];
                        push_quoted(key, out);
                        out.push(':');
                        self.write_fingerprint(&map[key], depth + 1, out);
                    }
                }
                out.push('}');
            }
        }
    }

    /// First few, middle and last positions of a large collection
    fn sample_positions(&self, len: usize) -> Vec<usize> {
        let mut positions: Vec<usize> = (0..self.config.sample_head.min(len)).collect();
        for idx in [len / 2, len.saturating_sub(1)] {
            if !positions.contains(&idx) {
                positions.push(idx);
            }
        }
        positions
    }
}

fn push_quoted(s: &str, out: &mut String) {
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => out.push_str(&unserializable::<str>()),
    }
}

fn unserializable<T: ?Sized>() -> String {
    format!("\"[Unserializable:{}]\"", std::any::type_name::<T>())
}

// =============================================================================
// Tests
// =============================================================================
