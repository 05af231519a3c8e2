//! Flight row codec.
//!
//! A flight payload is a sequence of newline-terminated rows:
//!
//! ```text
//! <hex id>:<json>\n        model row
//! <hex id>:I<json>\n       client module reference
//! <hex id>:E<json>\n       error
//! ```
//!
//! Row 0 is the root. Models reference other rows with `{"$R": n}` and
//! module rows with `{"$L": n}`.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FlightError, SerializedError};

/// Id of a row within one payload.
pub type RowId = u32;

/// Id of the root row.
pub const ROOT_ROW: RowId = 0;

const MODEL_REF: &str = "$R";
const MODULE_REF: &str = "$L";

/// Reference to a client-boundary module, resolved to a loadable asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleReference {
    /// Asset the browser loads.
    pub id: String,
    /// Additional chunks to preload.
    #[serde(default)]
    pub chunks: Vec<String>,
    /// Export name within the module.
    pub name: String,
}

/// Payload of a single row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowPayload {
    Model(Value),
    Module(ModuleReference),
    Error(SerializedError),
}

/// A decoded row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: RowId,
    pub payload: RowPayload,
}

impl Row {
    /// Model row.
    pub fn model(id: RowId, value: Value) -> Self {
        Self {
            id,
            payload: RowPayload::Model(value),
        }
    }

    /// Module reference row.
    pub fn module(id: RowId, module: ModuleReference) -> Self {
        Self {
            id,
            payload: RowPayload::Module(module),
        }
    }

    /// Error row.
    pub fn error(id: RowId, error: SerializedError) -> Self {
        Self {
            id,
            payload: RowPayload::Error(error),
        }
    }
}

/// Value referencing a model row.
pub fn model_ref(id: RowId) -> Value {
    serde_json::json!({ MODEL_REF: id })
}

/// Value referencing a module row.
pub fn module_ref(id: RowId) -> Value {
    serde_json::json!({ MODULE_REF: id })
}

/// Encode one row, including its trailing newline.
pub fn encode_row(row: &Row) -> Result<Vec<u8>, FlightError> {
    let body = match &row.payload {
        RowPayload::Model(value) => serde_json::to_string(value),
        RowPayload::Module(module) => serde_json::to_string(module).map(|s| format!("I{}", s)),
        RowPayload::Error(error) => serde_json::to_string(error).map(|s| format!("E{}", s)),
    }
    .map_err(|e| FlightError::Protocol(format!("failed to encode row {}: {}", row.id, e)))?;

    Ok(format!("{:x}:{}\n", row.id, body).into_bytes())
}

/// Incremental decoder: bytes in, completed rows out.
#[derive(Debug, Default)]
pub struct FlightDecoder {
    buffer: Vec<u8>,
    rows_decoded: usize,
}

impl FlightDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every row they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Row>, FlightError> {
        self.buffer.extend_from_slice(bytes);

        let mut rows = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let line = &self.buffer[start..start + pos];
            if !line.is_empty() {
                rows.push(parse_row(line)?);
            }
            start += pos + 1;
        }
        self.buffer.drain(..start);
        self.rows_decoded += rows.len();

        Ok(rows)
    }

    /// Number of rows decoded so far.
    pub fn rows_decoded(&self) -> usize {
        self.rows_decoded
    }

    /// Finish decoding. Fails if a partial row is still buffered.
    pub fn finish(self) -> Result<(), FlightError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(FlightError::Decode(format!(
                "payload ended inside a row ({} trailing bytes)",
                self.buffer.len()
            )))
        }
    }
}

fn parse_row(line: &[u8]) -> Result<Row, FlightError> {
    let text = std::str::from_utf8(line)
        .map_err(|e| FlightError::Decode(format!("row is not valid UTF-8: {}", e)))?;
    let (id, body) = text
        .split_once(':')
        .ok_or_else(|| FlightError::Decode(format!("row without id: {}", text)))?;
    let id = RowId::from_str_radix(id, 16)
        .map_err(|_| FlightError::Decode(format!("invalid row id '{}'", id)))?;

    let payload = if let Some(json) = body.strip_prefix('I') {
        RowPayload::Module(parse_json(id, json)?)
    } else if let Some(json) = body.strip_prefix('E') {
        RowPayload::Error(parse_json(id, json)?)
    } else {
        RowPayload::Model(parse_json(id, body)?)
    };

    Ok(Row { id, payload })
}

fn parse_json<T: serde::de::DeserializeOwned>(id: RowId, json: &str) -> Result<T, FlightError> {
    serde_json::from_str(json).map_err(|e| FlightError::Decode(format!("row {:x}: {}", id, e)))
}

/// Rows of one payload, as decoded so far.
#[derive(Debug, Clone, PartialEq)]
pub struct FlightTree {
    rows: BTreeMap<RowId, RowPayload>,
    root: RowId,
}

impl Default for FlightTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FlightTree {
    /// Empty tree rooted at row 0.
    pub fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            root: ROOT_ROW,
        }
    }

    /// Decode a complete payload.
    pub fn from_payload(bytes: &[u8]) -> Result<Self, FlightError> {
        let mut decoder = FlightDecoder::new();
        let mut tree = Self::new();
        tree.extend(decoder.push(bytes)?);
        decoder.finish()?;
        Ok(tree)
    }

    /// Insert a decoded row. A later row with the same id replaces it.
    pub fn insert(&mut self, row: Row) {
        self.rows.insert(row.id, row.payload);
    }

    /// Insert several rows.
    pub fn extend(&mut self, rows: impl IntoIterator<Item = Row>) {
        for row in rows {
            self.insert(row);
        }
    }

    /// Get a row payload.
    pub fn get(&self, id: RowId) -> Option<&RowPayload> {
        self.rows.get(&id)
    }

    /// Id of the root row.
    pub fn root_id(&self) -> RowId {
        self.root
    }

    /// Whether the root row has arrived.
    pub fn has_root(&self) -> bool {
        self.rows.contains_key(&self.root)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no row has arrived yet.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First error row, if any.
    pub fn error(&self) -> Option<&SerializedError> {
        self.rows.values().find_map(|payload| match payload {
            RowPayload::Error(err) => Some(err),
            _ => None,
        })
    }

    /// Same rows viewed from a different root.
    pub fn rebased(&self, root: RowId) -> Self {
        Self {
            rows: self.rows.clone(),
            root,
        }
    }

    /// Materialize the root, substituting every reference.
    ///
    /// Module references become `{"module": .., "chunks": .., "export": ..}`.
    pub fn resolve_root(&self) -> Result<Value, FlightError> {
        let mut visiting = HashSet::new();
        self.resolve_row(self.root, &mut visiting)
    }

    fn resolve_row(&self, id: RowId, visiting: &mut HashSet<RowId>) -> Result<Value, FlightError> {
        if !visiting.insert(id) {
            return Err(FlightError::Decode(format!("row {:x} references itself", id)));
        }

        let value = match self.rows.get(&id) {
            Some(RowPayload::Model(value)) => self.resolve_value(value, visiting)?,
            Some(RowPayload::Module(module)) => module_value(module),
            Some(RowPayload::Error(err)) => return Err(FlightError::from_serialized(err.clone())),
            None => return Err(FlightError::Decode(format!("missing row {:x}", id))),
        };

        visiting.remove(&id);
        Ok(value)
    }

    fn resolve_value(&self, value: &Value, visiting: &mut HashSet<RowId>) -> Result<Value, FlightError> {
        match value {
            Value::Object(map) => {
                if let Some(id) = reference(map, MODEL_REF).or_else(|| reference(map, MODULE_REF)) {
                    return self.resolve_row(id, visiting);
                }
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_value(v, visiting)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve_value(v, visiting))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }
}

fn reference(map: &Map<String, Value>, tag: &str) -> Option<RowId> {
    if map.len() != 1 {
        return None;
    }
    map.get(tag)
        .and_then(Value::as_u64)
        .and_then(|id| RowId::try_from(id).ok())
}

fn module_value(module: &ModuleReference) -> Value {
    serde_json::json!({
        "module": module.id,
        "chunks": module.chunks,
        "export": module.name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn payload(rows: &[Row]) -> Vec<u8> {
        rows.iter().flat_map(|r| encode_row(r).unwrap()).collect()
    }

    #[test]
    fn test_encode_row_format() {
        let row = Row::model(26, json!({ "a": 1 }));
        assert_eq!(encode_row(&row).unwrap(), b"1a:{\"a\":1}\n".to_vec());

        let module = Row::module(
            1,
            ModuleReference {
                id: "assets/Counter-abc.js".into(),
                chunks: vec![],
                name: "default".into(),
            },
        );
        assert!(encode_row(&module).unwrap().starts_with(b"1:I{"));
    }

    #[test]
    fn test_decoder_handles_rows_split_across_pushes() {
        let bytes = payload(&[Row::model(1, json!("child")), Row::model(0, json!({ "c": model_ref(1) }))]);
        let (a, b) = bytes.split_at(5);

        let mut decoder = FlightDecoder::new();
        let first = decoder.push(a).unwrap();
        assert!(first.is_empty());

        let rest = decoder.push(b).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(decoder.rows_decoded(), 2);
        decoder.finish().unwrap();
    }

    #[test]
    fn test_decoder_rejects_truncated_payload() {
        let mut decoder = FlightDecoder::new();
        decoder.push(b"0:{\"half\"").unwrap();
        assert!(matches!(decoder.finish(), Err(FlightError::Decode(_))));
    }

    #[test]
    fn test_decoder_rejects_bad_id() {
        let mut decoder = FlightDecoder::new();
        assert!(decoder.push(b"zz:1\n").is_err());
        let mut decoder = FlightDecoder::new();
        assert!(decoder.push(b"no-colon\n").is_err());
    }

    #[test]
    fn test_resolve_root_substitutes_references() {
        let bytes = payload(&[
            Row::module(
                2,
                ModuleReference {
                    id: "assets/Counter.js".into(),
                    chunks: vec!["assets/vendor.js".into()],
                    name: "Counter".into(),
                },
            ),
            Row::model(1, json!({ "count": 3 })),
            Row::model(0, json!({ "tag": "div", "children": [model_ref(1), module_ref(2)] })),
        ]);

        let tree = FlightTree::from_payload(&bytes).unwrap();
        let root = tree.resolve_root().unwrap();

        assert_eq!(root["children"][0], json!({ "count": 3 }));
        assert_eq!(root["children"][1]["module"], "assets/Counter.js");
        assert_eq!(root["children"][1]["export"], "Counter");
    }

    #[test]
    fn test_resolve_detects_cycles() {
        let mut tree = FlightTree::new();
        tree.insert(Row::model(0, model_ref(1)));
        tree.insert(Row::model(1, model_ref(0)));
        assert!(matches!(tree.resolve_root(), Err(FlightError::Decode(_))));
    }

    #[test]
    fn test_error_row_fails_resolution() {
        let mut tree = FlightTree::new();
        tree.insert(Row::error(0, SerializedError::new(ErrorKind::Render, "boom")));

        let err = tree.resolve_root().unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(tree.error().map(|e| e.message.as_str()), Some("boom"));
    }

    #[test]
    fn test_rebased_tree() {
        let mut tree = FlightTree::new();
        tree.insert(Row::model(0, json!({ "result": 1, "render": model_ref(4) })));
        tree.insert(Row::model(4, json!("fresh")));

        let render = tree.rebased(4);
        assert_eq!(render.root_id(), 4);
        assert_eq!(render.resolve_root().unwrap(), json!("fresh"));
    }

    #[test]
    fn test_objects_with_extra_keys_are_not_references() {
        let mut tree = FlightTree::new();
        tree.insert(Row::model(0, json!({ "$R": 9, "other": true })));
        assert_eq!(tree.resolve_root().unwrap(), json!({ "$R": 9, "other": true }));
    }
}
