//! Snapshot construction: applying a transaction's buffered operations on
//! top of the baseline.

use serde_json::{Map, Value};

#[derive(Debug, Clone)]
pub enum TxOp {
    Write(Value),
    Update(Value),
    Delete,
}

/// Fold `ops` onto `base` in order: `write` replaces wholesale, `update`
/// shallow-merges top-level keys, `delete` clears to an empty object.
#[must_use]
pub fn apply_ops(base: &Value, ops: &[TxOp]) -> Value {
    let mut current = base.clone();
    for op in ops {
        match op {
            TxOp::Write(data) => current = data.clone(),
            TxOp::Update(patch) => merge_top_level(&mut current, patch),
            TxOp::Delete => current = Value::Object(Map::new()),
        }
    }
    current
}

fn merge_top_level(target: &mut Value, patch: &Value) {
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let (Value::Object(t), Value::Object(p)) = (target, patch) else { return };
    for (k, v) in p {
        t.insert(k.clone(), v.clone());
    }
}
