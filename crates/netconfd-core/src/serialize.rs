// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Outbound value-tree serializer (component I, ambient).
//!
//! A symmetric writer to match the reader in `xml.rs`, so the
//! multiplexer has something real to send back and so
//! round-trip tests are possible. Pairs the `quick-xml::Writer` with
//! the `quick-xml::Reader` that backs `xml.rs` -- the obvious
//! idiomatic choice once that crate is already in the dependency
//! graph, rather than hand-formatting XML strings the way `mux.rs`'s
//! `render_rpc_error` does for the one case (a bare protocol error)
//! that has no value tree to walk.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event as QxEvent};
use quick_xml::writer::Writer as QxWriter;

use crate::value::{Arena, BaseType, NodeId, XmlValue};

#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("xml write failure: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("encoding failure: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Serializes the subtree rooted at `id` to a self-contained XML
/// document fragment (no `<?xml?>` declaration -- NETCONF messages
/// never carry one).
pub fn serialize_subtree(arena: &Arena, id: NodeId) -> Result<Vec<u8>, SerializeError> {
    let mut writer = QxWriter::new(Vec::new());
    write_node(arena, id, &mut writer)?;
    Ok(writer.into_inner())
}

fn write_node(arena: &Arena, id: NodeId, writer: &mut QxWriter<Vec<u8>>) -> Result<(), SerializeError> {
    let node = arena.get(id);
    if node.flags.deleted_marker {
        return Ok(());
    }

    let mut start = BytesStart::new(node.name.clone());
    if let Some(nsid) = &node.nsid {
        start.push_attribute(("xmlns", nsid.as_str()));
    }
    // Metadata attributes are re-emitted unprefixed; re-deriving a
    // prefix for `meta.nsid` would need the same prefix-allocation
    // machinery a YANG-aware serializer carries, which is out of scope
    // here the same way YANG compilation itself is.
    for meta in &node.metadata {
        start.push_attribute((meta.name.as_str(), meta.value.as_str()));
    }

    // anyxml/anydata content whose first inner event was a start tag
    // was captured as an opaque container subtree (parser.rs's
    // `parse_any_content`); serialize it back out the same way a
    // typed container would be.
    let is_opaque_any_container = node.base_type == BaseType::Any && matches!(node.value, XmlValue::Container);

    match node.base_type {
        BaseType::Container | BaseType::Choice | BaseType::Case => {
            let live_children: Vec<NodeId> = arena.children(id).collect();
            if live_children.is_empty() {
                writer.write_event(QxEvent::Empty(start))?;
            } else {
                writer.write_event(QxEvent::Start(start))?;
                for child in live_children {
                    write_node(arena, child, writer)?;
                }
                writer.write_event(QxEvent::End(BytesEnd::new(node.name.clone())))?;
            }
        }
        BaseType::Any if is_opaque_any_container => {
            let live_children: Vec<NodeId> = arena.children(id).collect();
            if live_children.is_empty() {
                writer.write_event(QxEvent::Empty(start))?;
            } else {
                writer.write_event(QxEvent::Start(start))?;
                for child in live_children {
                    write_node(arena, child, writer)?;
                }
                writer.write_event(QxEvent::End(BytesEnd::new(node.name.clone())))?;
            }
        }
        BaseType::List => {
            // Each list instance is itself a container-shaped node; the
            // arena models "the list" only implicitly via repeated
            // sibling nodes sharing a name, so there is nothing extra
            // to wrap here.
            let live_children: Vec<NodeId> = arena.children(id).collect();
            writer.write_event(QxEvent::Start(start))?;
            for child in live_children {
                write_node(arena, child, writer)?;
            }
            writer.write_event(QxEvent::End(BytesEnd::new(node.name.clone())))?;
        }
        _ => {
            let text = scalar_text(&node.value);
            if text.is_empty() {
                writer.write_event(QxEvent::Empty(start))?;
            } else {
                writer.write_event(QxEvent::Start(start))?;
                writer.write_event(QxEvent::Text(BytesText::new(&text)))?;
                writer.write_event(QxEvent::End(BytesEnd::new(node.name.clone())))?;
            }
        }
    }
    Ok(())
}

fn scalar_text(value: &XmlValue) -> String {
    match value {
        XmlValue::Empty => String::new(),
        XmlValue::Boolean(b) => b.to_string(),
        XmlValue::Int8(v) => v.to_string(),
        XmlValue::Int16(v) => v.to_string(),
        XmlValue::Int32(v) => v.to_string(),
        XmlValue::Int64(v) => v.to_string(),
        XmlValue::Uint8(v) => v.to_string(),
        XmlValue::Uint16(v) => v.to_string(),
        XmlValue::Uint32(v) => v.to_string(),
        XmlValue::Uint64(v) => v.to_string(),
        XmlValue::Decimal64 { digits, fraction_digits } => format_decimal64(*digits, *fraction_digits),
        XmlValue::Float64(v) => v.to_string(),
        XmlValue::Str(s) => s.clone(),
        XmlValue::Binary(bytes) => base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes),
        XmlValue::Enumeration(s) => s.clone(),
        XmlValue::Bits(bits) => bits.join(" "),
        XmlValue::LeafListOfStrings(items) => items.first().cloned().unwrap_or_default(),
        XmlValue::Container => String::new(),
        XmlValue::Identityref { nsid, name } => match nsid {
            Some(prefix) => format!("{prefix}:{name}"),
            None => name.clone(),
        },
        XmlValue::Leafref(s) => s.clone(),
        XmlValue::InstanceIdentifier(s) => s.clone(),
        XmlValue::Union(inner) => scalar_text(inner),
        XmlValue::Any(s) => s.clone(),
        XmlValue::Virtual(_) => String::new(),
    }
}

fn format_decimal64(digits: i64, fraction_digits: u8) -> String {
    if fraction_digits == 0 {
        return digits.to_string();
    }
    let scale = 10i64.pow(fraction_digits as u32);
    let sign = if digits < 0 { "-" } else { "" };
    let abs = digits.unsigned_abs();
    let int_part = abs / scale as u64;
    let frac_part = abs % scale as u64;
    format!("{sign}{int_part}.{frac_part:0width$}", width = fraction_digits as usize)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::value::ValueNode;

    #[test]
    fn serializes_flat_container_with_scalar_children() {
        let mut arena = Arena::new();
        let root = arena.alloc(ValueNode::new("users", None, BaseType::Container, XmlValue::Container));
        let name = arena.alloc(ValueNode::new("name", None, BaseType::String, XmlValue::Str("bob".into())));
        arena.append_child(root, name);

        let xml = serialize_subtree(&arena, root).unwrap();
        let text = String::from_utf8(xml).unwrap();
        assert_eq!(text, "<users><name>bob</name></users>");
    }

    #[test]
    fn empty_container_self_closes() {
        let mut arena = Arena::new();
        let root = arena.alloc(ValueNode::new("users", None, BaseType::Container, XmlValue::Container));
        let xml = serialize_subtree(&arena, root).unwrap();
        assert_eq!(String::from_utf8(xml).unwrap(), "<users/>");
    }

    #[test]
    fn deleted_marker_nodes_are_skipped() {
        let mut arena = Arena::new();
        let root = arena.alloc(ValueNode::new("users", None, BaseType::Container, XmlValue::Container));
        let name = arena.alloc(ValueNode::new("name", None, BaseType::String, XmlValue::Str("bob".into())));
        arena.append_child(root, name);
        arena.mark_deleted(name);

        let xml = serialize_subtree(&arena, root).unwrap();
        assert_eq!(String::from_utf8(xml).unwrap(), "<users/>");
    }

    #[test]
    fn anyxml_opaque_container_serializes_nested_elements() {
        let mut arena = Arena::new();
        let root = arena.alloc(ValueNode::new("data", None, BaseType::Any, XmlValue::Container));
        let child = arena.alloc(ValueNode::new("child", None, BaseType::Any, XmlValue::Any("hi".into())));
        arena.append_child(root, child);

        let xml = serialize_subtree(&arena, root).unwrap();
        assert_eq!(String::from_utf8(xml).unwrap(), "<data><child>hi</child></data>");
    }

    #[test]
    fn decimal64_formats_with_fixed_fraction_width() {
        assert_eq!(format_decimal64(314, 2), "3.14");
        assert_eq!(format_decimal64(-5, 2), "-0.05");
        assert_eq!(format_decimal64(7, 0), "7");
    }

    #[test]
    fn binary_leaf_base64_encodes() {
        let text = scalar_text(&XmlValue::Binary(vec![0x68, 0x69]));
        assert_eq!(text, "aGk=");
    }
}
