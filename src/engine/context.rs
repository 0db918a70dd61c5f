//! Pooled per-call context.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::fingerprint::ObjectId;
use crate::pool::Poolable;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Scratch state for one in-progress call.
///
/// The object id is stable for the context's whole life, across pool
/// round-trips, and keys the fingerprint memo. The memo entry must be
/// invalidated whenever the context goes back to the pool.
#[derive(Debug)]
pub struct CallContext {
    id: ObjectId,
    engine_id: u64,
    pub(crate) method: String,
    pub(crate) params: Value,
}

impl CallContext {
    pub fn new(engine_id: u64) -> Self {
        Self {
            id: ObjectId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            engine_id,
            method: String::new(),
            params: Value::Null,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn engine_id(&self) -> u64 {
        self.engine_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub(crate) fn bind(&mut self, method: &str, params: Value) {
        self.method.clear();
        self.method.push_str(method);
        self.params = params;
    }
}

impl Poolable for CallContext {
    fn reset(&mut self) {
        self.method.clear();
        self.params = Value::Null;
    }

    fn validate(&self) -> bool {
        self.method.is_empty() && self.params.is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reset_keeps_identity_and_owner() {
        let mut ctx = CallContext::new(9);
        let id = ctx.id();
        ctx.bind("getUser", json!({"id": 1}));
        assert!(!ctx.validate());

        ctx.reset();
        assert!(ctx.validate());
        assert_eq!(ctx.id(), id);
        assert_eq!(ctx.engine_id(), 9);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(CallContext::new(1).id(), CallContext::new(1).id());
    }
}
