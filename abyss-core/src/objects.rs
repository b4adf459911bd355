//! Shared object sets: add-or-replace / remove by id, an order-independent content hash, and the
//! JSON payload codec used by append/delete batches.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Object identifier, unique within a world.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Result<Self, PayloadError> {
        let id = id.into();
        if id.is_empty() {
            return Err(PayloadError::EmptyId);
        }
        Ok(ObjectId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One shared object. `content` is the canonical JSON text (sorted keys, no whitespace) of every
/// field except `id`, so equal objects always hash equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedObject {
    pub id: ObjectId,
    pub content: String,
}

impl SharedObject {
    /// Build from an id and a JSON object of fields. An `id` key inside `fields` is ignored.
    pub fn from_fields(id: ObjectId, mut fields: Map<String, Value>) -> Self {
        fields.remove("id");
        let content = Value::Object(fields);
        Self {
            id,
            content: canonical_json(&content),
        }
    }

    /// Fields other than `id`.
    pub fn fields(&self) -> Map<String, Value> {
        match serde_json::from_str::<Value>(&self.content) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// The object as a JSON record including its `id`.
    pub fn to_json(&self) -> Value {
        let mut record = Map::new();
        record.insert("id".to_string(), Value::String(self.id.0.clone()));
        for (k, v) in self.fields() {
            record.insert(k, v);
        }
        Value::Object(record)
    }
}

/// SHA-256 digest over a world's object set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ContentHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

impl FromStr for ContentHash {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| PayloadError::Json(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PayloadError::Json("expected 32 byte hash".into()))?;
        Ok(ContentHash(arr))
    }
}

/// The object set of one world, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ObjectSet {
    entries: BTreeMap<ObjectId, String>,
}

impl ObjectSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_objects(objects: &[SharedObject]) -> Self {
        let mut set = Self::new();
        set.append(objects);
        set
    }

    /// Add or replace each object, in batch order (a repeated id in one batch: the last wins).
    pub fn append(&mut self, objects: &[SharedObject]) {
        for obj in objects {
            self.entries.insert(obj.id.clone(), obj.content.clone());
        }
    }

    /// Remove each id; absent ids are ignored.
    pub fn delete(&mut self, ids: &[ObjectId]) {
        for id in ids {
            self.entries.remove(id);
        }
    }

    pub fn get(&self, id: &ObjectId) -> Option<SharedObject> {
        self.entries.get(id).map(|content| SharedObject {
            id: id.clone(),
            content: content.clone(),
        })
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All objects, ordered by id.
    pub fn snapshot(&self) -> Vec<SharedObject> {
        self.entries
            .iter()
            .map(|(id, content)| SharedObject {
                id: id.clone(),
                content: content.clone(),
            })
            .collect()
    }

    /// Digest over (id, content) pairs in id order. Depends only on the final set, never on the
    /// order in which batches were applied.
    pub fn hash(&self) -> ContentHash {
        let mut hasher = Sha256::new();
        hasher.update(b"abyss-objects-v1");
        hasher.update((self.entries.len() as u64).to_le_bytes());
        for (id, content) in &self.entries {
            hasher.update((id.0.len() as u64).to_le_bytes());
            hasher.update(id.0.as_bytes());
            hasher.update((content.len() as u64).to_le_bytes());
            hasher.update(content.as_bytes());
        }
        ContentHash(hasher.finalize().into())
    }

    /// Whether this set hashes to `expected`.
    pub fn verify(&self, expected: &ContentHash) -> bool {
        self.hash() == *expected
    }
}

/// Parse an append batch: a JSON array of records, each with a non-empty string `id`.
/// `[{"id":"msg1","body":"hi"}]`
pub fn parse_append_payload(json: &str) -> Result<Vec<SharedObject>, PayloadError> {
    let records: Vec<Value> =
        serde_json::from_str(json).map_err(|e| PayloadError::Json(e.to_string()))?;
    records
        .into_iter()
        .enumerate()
        .map(|(i, record)| {
            let Value::Object(mut fields) = record else {
                return Err(PayloadError::NotAnObject(i));
            };
            let id = match fields.remove("id") {
                Some(Value::String(s)) => ObjectId::new(s)?,
                _ => return Err(PayloadError::MissingId(i)),
            };
            Ok(SharedObject::from_fields(id, fields))
        })
        .collect()
}

/// Parse a delete batch: a JSON array of id strings. `["msg1","msg2"]`
pub fn parse_delete_payload(json: &str) -> Result<Vec<ObjectId>, PayloadError> {
    let ids: Vec<String> =
        serde_json::from_str(json).map_err(|e| PayloadError::Json(e.to_string()))?;
    ids.into_iter().map(ObjectId::new).collect()
}

/// Inverse of [`parse_append_payload`].
pub fn render_objects(objects: &[SharedObject]) -> String {
    let records: Vec<Value> = objects.iter().map(SharedObject::to_json).collect();
    canonical_json(&Value::Array(records))
}

/// Inverse of [`parse_delete_payload`].
pub fn render_ids(ids: &[ObjectId]) -> String {
    let list: Vec<Value> = ids.iter().map(|id| Value::String(id.0.clone())).collect();
    canonical_json(&Value::Array(list))
}

/// Compact JSON with object keys sorted at every level.
fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&sorted(value)).unwrap_or_default()
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let ordered: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, sorted(v))).collect();
            let mut out = Map::new();
            for (k, v) in ordered {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("invalid json: {0}")]
    Json(String),
    #[error("record {0} is not an object")]
    NotAnObject(usize),
    #[error("record {0} has no string id")]
    MissingId(usize),
    #[error("empty object id")]
    EmptyId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn obj(id: &str, body: &str) -> SharedObject {
        parse_append_payload(&format!(r#"[{{"id":"{id}","body":"{body}"}}]"#))
            .unwrap()
            .remove(0)
    }

    enum Op {
        Append(SharedObject),
        Delete(ObjectId),
    }

    fn apply(set: &mut ObjectSet, op: &Op) {
        match op {
            Op::Append(o) => set.append(std::slice::from_ref(o)),
            Op::Delete(id) => set.delete(std::slice::from_ref(id)),
        }
    }

    #[test]
    fn hash_is_order_independent_across_ids() {
        // One winning operation per id; any arrival order must converge.
        let ops = vec![
            Op::Append(obj("a", "1")),
            Op::Append(obj("b", "2")),
            Op::Append(obj("c", "3")),
            Op::Delete(ObjectId::new("d").unwrap()),
            Op::Append(obj("e", "5")),
        ];
        let mut reference = ObjectSet::new();
        for op in &ops {
            apply(&mut reference, op);
        }
        let mut rng = rand::thread_rng();
        let mut order: Vec<usize> = (0..ops.len()).collect();
        for _ in 0..50 {
            order.shuffle(&mut rng);
            let mut set = ObjectSet::new();
            for &i in &order {
                apply(&mut set, &ops[i]);
            }
            assert_eq!(set.hash(), reference.hash());
        }
    }

    #[test]
    fn replace_and_delete_change_hash() {
        let mut set = ObjectSet::new();
        let empty = set.hash();
        set.append(&[obj("msg1", "hi")]);
        let one = set.hash();
        assert_ne!(one, empty);
        set.append(&[obj("msg1", "bye")]);
        assert_ne!(set.hash(), one);
        assert_eq!(set.len(), 1);
        set.delete(&[ObjectId::new("msg1").unwrap(), ObjectId::new("absent").unwrap()]);
        assert_eq!(set.hash(), empty);
        assert!(set.verify(&empty));
    }

    #[test]
    fn field_order_does_not_matter() {
        let a = parse_append_payload(r#"[{"id":"x","b":1,"a":{"z":1,"y":2}}]"#).unwrap();
        let b = parse_append_payload(r#"[{"a":{"y":2,"z":1},"id":"x","b":1}]"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(ObjectSet::from_objects(&a).hash(), ObjectSet::from_objects(&b).hash());
    }

    #[test]
    fn payload_roundtrip_keeps_fields() {
        let input = r#"[{"id":"msg1","body":"hi","n":3},{"id":"m2","addr":"https://x/y"}]"#;
        let objects = parse_append_payload(input).unwrap();
        let again = parse_append_payload(&render_objects(&objects)).unwrap();
        assert_eq!(objects, again);
        assert_eq!(objects[0].fields()["body"], "hi");

        let ids = parse_delete_payload(r#"["msg1","m2"]"#).unwrap();
        assert_eq!(parse_delete_payload(&render_ids(&ids)).unwrap(), ids);
    }

    #[test]
    fn malformed_payloads() {
        assert!(matches!(parse_append_payload("{"), Err(PayloadError::Json(_))));
        assert!(matches!(
            parse_append_payload(r#"[1]"#),
            Err(PayloadError::NotAnObject(0))
        ));
        assert!(matches!(
            parse_append_payload(r#"[{"body":"no id"}]"#),
            Err(PayloadError::MissingId(0))
        ));
        assert!(matches!(
            parse_append_payload(r#"[{"id":""}]"#),
            Err(PayloadError::EmptyId)
        ));
        assert!(matches!(
            parse_delete_payload(r#"[1,2]"#),
            Err(PayloadError::Json(_))
        ));
    }

    #[test]
    fn content_hash_hex_roundtrip() {
        let h = ObjectSet::from_objects(&[obj("a", "b")]).hash();
        assert_eq!(h.to_hex().parse::<ContentHash>().unwrap(), h);
    }
}
