//! Collaboratively edited rich-text bodies.
//!
//! Each body is a yrs text root named `body:<namespace>`. Several bodies
//! can share one doc (and one sync transport) without colliding as long
//! as their namespaces differ. Formatting is stored as yrs attributes;
//! a boolean `true` attribute is a mark such as `bold`.
//!
//! Offsets are UTF-8 byte offsets. Offsets inside a multibyte char are
//! snapped to its boundaries: inserts land before the char, ranges grow
//! to cover it whole. Carets shared with peers are encoded as yrs sticky
//! indexes so they stay put while others edit ahead of them.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map as JsonMap, Value};
use yrs::types::text::{Diff, YChange};
use yrs::types::Attrs;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Assoc, Doc, GetString, IndexedSequence, Out, ReadTxn, StickyIndex, Text, Transact,
    WriteTxn,
};

/// Namespace used when the caller does not pick one.
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Clone)]
pub struct RichText {
    doc: Doc,
    namespace: String,
    root: Arc<str>,
}

impl RichText {
    /// Bind to the body stored under `namespace` in `doc`.
    pub fn new(doc: Doc, namespace: &str) -> Self {
        let namespace = if namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            namespace
        };
        Self {
            doc,
            namespace: namespace.to_string(),
            root: Arc::from(format!("body:{namespace}")),
        }
    }

    /// A body on a fresh private doc, not shared with anyone.
    pub fn local(namespace: &str) -> Self {
        Self::new(Doc::new(), namespace)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn insert(&self, index: u32, chunk: &str) -> Vec<u8> {
        self.insert_with_marks(index, chunk, &[])
    }

    /// Insert `chunk` at `index` (clamped to the end) carrying `marks`.
    pub fn insert_with_marks(&self, index: u32, chunk: &str, marks: &[&str]) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(self.root.clone());
        let index = floor_boundary(&text.get_string(&txn), index);
        if marks.is_empty() {
            text.insert(&mut txn, index, chunk);
        } else {
            text.insert_with_attributes(&mut txn, index, chunk, mark_attrs(marks, true));
        }
        txn.encode_update_v1()
    }

    /// Delete `len` bytes from `index`. Out-of-range spans are clamped.
    pub fn delete(&self, index: u32, len: u32) -> Option<Vec<u8>> {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(self.root.clone());
        let (start, len) = span(&text.get_string(&txn), index, len)?;
        text.remove_range(&mut txn, start, len);
        Some(txn.encode_update_v1())
    }

    /// Turn `marks` on or off over a span.
    pub fn format(&self, index: u32, len: u32, marks: &[&str], enabled: bool) -> Option<Vec<u8>> {
        if marks.is_empty() {
            return None;
        }
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(self.root.clone());
        let (start, len) = span(&text.get_string(&txn), index, len)?;
        text.format(&mut txn, start, len, mark_attrs(marks, enabled));
        Some(txn.encode_update_v1())
    }

    /// Seed an empty body. Does nothing once any content exists.
    pub fn set_initial_content(&self, content: &str) -> Option<Vec<u8>> {
        if content.is_empty() {
            return None;
        }
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(self.root.clone());
        if text.len(&txn) > 0 {
            return None;
        }
        text.insert(&mut txn, 0, content);
        Some(txn.encode_update_v1())
    }

    /// Encode `index` as a position that follows the char after it
    /// through concurrent edits. At the end of the text it sticks to
    /// the end.
    pub fn sticky_index(&self, index: u32) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(self.root.clone());
        let index = floor_boundary(&text.get_string(&txn), index);
        text.sticky_index(&txn, index, Assoc::After)
            .unwrap_or_else(|| StickyIndex::from_type(&txn, &text, Assoc::After))
            .encode_v1()
    }

    /// Current byte offset of a position from [`Self::sticky_index`].
    /// `None` until this replica has the text it refers to.
    pub fn resolve_sticky_index(&self, encoded: &[u8]) -> Option<u32> {
        let sticky = StickyIndex::decode_v1(encoded).ok()?;
        let txn = self.doc.transact();
        sticky.get_offset(&txn).map(|offset| offset.index)
    }

    /// Plain text content.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        txn.get_text(self.root.clone())
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        txn.get_text(self.root.clone()).map_or(0, |text| text.len(&txn))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Structured content tree: a `doc` of `paragraph`s of `text` runs.
    ///
    /// ```text
    /// {"type":"doc","content":[
    ///   {"type":"paragraph","content":[{"type":"text","text":"Hi","marks":[{"type":"bold"}]}]}
    /// ]}
    /// ```
    pub fn to_content_tree(&self) -> Value {
        let txn = self.doc.transact();
        let diffs: Vec<Diff<YChange>> = match txn.get_text(self.root.clone()) {
            Some(text) => text.diff(&txn, YChange::identity),
            None => Vec::new(),
        };

        let mut paragraphs: Vec<Vec<Value>> = vec![Vec::new()];
        for diff in diffs {
            let Out::Any(Any::String(chunk)) = diff.insert else {
                continue;
            };
            let marks = diff.attributes.as_deref().map(marks_json).unwrap_or_default();
            for (i, line) in chunk.split('\n').enumerate() {
                if i > 0 {
                    paragraphs.push(Vec::new());
                }
                if line.is_empty() {
                    continue;
                }
                let mut run = JsonMap::new();
                run.insert("type".into(), json!("text"));
                run.insert("text".into(), json!(line));
                if !marks.is_empty() {
                    run.insert("marks".into(), Value::Array(marks.clone()));
                }
                if let Some(current) = paragraphs.last_mut() {
                    current.push(Value::Object(run));
                }
            }
        }

        let content: Vec<Value> = paragraphs
            .into_iter()
            .map(|runs| {
                if runs.is_empty() {
                    json!({"type": "paragraph"})
                } else {
                    json!({"type": "paragraph", "content": runs})
                }
            })
            .collect();
        json!({"type": "doc", "content": content})
    }
}

/// Largest char boundary at or before `index`, clamped to the text.
fn floor_boundary(text: &str, index: u32) -> u32 {
    let mut index = (index as usize).min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index as u32
}

fn ceil_boundary(text: &str, index: u32) -> u32 {
    let mut index = (index as usize).min(text.len());
    while !text.is_char_boundary(index) {
        index += 1;
    }
    index as u32
}

/// Clamp `[index, index + len)` to the text and widen it to whole
/// chars. `None` when nothing is left.
fn span(text: &str, index: u32, len: u32) -> Option<(u32, u32)> {
    if len == 0 || index as usize >= text.len() {
        return None;
    }
    let start = floor_boundary(text, index);
    let end = ceil_boundary(text, index.saturating_add(len));
    (end > start).then(|| (start, end - start))
}

fn mark_attrs(marks: &[&str], enabled: bool) -> Attrs {
    let value = if enabled { Any::Bool(true) } else { Any::Null };
    marks
        .iter()
        .map(|mark| (Arc::from(*mark), value.clone()))
        .collect::<HashMap<Arc<str>, Any>>()
}

fn marks_json(attrs: &Attrs) -> Vec<Value> {
    let mut keys: Vec<&Arc<str>> = attrs.keys().collect();
    keys.sort();
    keys.into_iter()
        .filter_map(|key| match &attrs[key] {
            Any::Null | Any::Undefined | Any::Bool(false) => None,
            Any::Bool(true) => Some(json!({"type": key.to_string()})),
            other => Some(json!({"type": key.to_string(), "attrs": {"value": any_to_json(other)}})),
        })
        .collect()
}

fn any_to_json(value: &Any) -> Value {
    match value {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => json!(b),
        Any::Number(n) => json!(n),
        Any::BigInt(n) => json!(n),
        Any::String(s) => json!(s.to_string()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), any_to_json(v)))
                .collect(),
        ),
        Any::Buffer(_) => Value::Null,
    }
}
