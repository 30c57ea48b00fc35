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

//! Schema-directed recursive-descent parser (component F).
//!
//! Walks a `schema::ObjTemplate` tree in lockstep with an `xml::XmlReader`
//! event stream, dispatching on the template's `BaseType` the way
//! `daemon/shell.rs` dispatches on a fixed small set of request
//! variants -- one match arm per case, each producing either a value
//! or a recorded error without aborting the surrounding walk.
//! A malformed subtree never aborts the whole parse:
//! the offending node is given an error `ParseStatus` and its siblings
//! still get their chance.

use std::str::FromStr;
use std::sync::Arc;

use base64::Engine;
use netconfd_protocol::{ErrorTag, ErrorType, RpcError};

use crate::errors::{ErrorQueue, ParseStatus};
use crate::schema::{DataClass as SchemaDataClass, ObjTemplate, Schema};
use crate::value::{Arena, BaseType, EditOperation, EditVars, InsertPosition, Metadata, NodeId, ValueNode, XmlValue};
use crate::xml::{Attribute, QName, XmlError, XmlEvent, XmlReader};
use crate::xpath::{self, Dialect};

const NC_NS: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";

#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub lax_namespaces: bool,
    pub enforce_xml_order: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions { lax_namespaces: false, enforce_xml_order: false }
    }
}

pub struct ParseOutcome {
    pub root: NodeId,
    pub errors: ErrorQueue,
}

pub struct Parser<'a, 'x> {
    reader: &'a mut XmlReader<'x>,
    arena: &'a mut Arena,
    errors: ErrorQueue,
    opts: ParseOptions,
    path: Vec<String>,
    /// The compiled schema, when one is available. Leafref,
    /// instance-identifier, and identityref validation all need to
    /// resolve against the full schema tree (root lookups, identity
    /// hierarchy), not just the subtree rooted at the element being
    /// parsed, so a bare `parse_document` call (no `Schema` in scope)
    /// skips those checks rather than failing them outright.
    schema: Option<&'a Schema>,
}

/// Parses `xml` against `template` (the expected root element's
/// schema node), returning the constructed subtree and every error
/// recorded while walking it.
pub fn parse_document(
    xml: &[u8],
    template: &Arc<ObjTemplate>,
    arena: &mut Arena,
    opts: ParseOptions,
) -> Result<ParseOutcome, XmlError> {
    let mut reader = XmlReader::new(xml);
    let mut parser =
        Parser { reader: &mut reader, arena, errors: ErrorQueue::new(), opts, path: Vec::new(), schema: None };
    let root = match parser.reader.next()? {
        XmlEvent::StartElement { name, attrs, empty } => parser.parse_element(template, &name, &attrs, empty)?,
        other => {
            return Err(XmlError::Malformed(format!("expected start element, found {other:?}")));
        }
    };
    Ok(ParseOutcome { root, errors: parser.errors })
}

/// Looks up a top-level element by name in `schema` and parses it;
/// records `unknown-element` and returns `None` if no matching root
/// exists ("unrecognized top-level element").
pub fn parse_against_schema(
    xml: &[u8],
    schema: &Schema,
    arena: &mut Arena,
    opts: ParseOptions,
) -> Result<Option<ParseOutcome>, XmlError> {
    let mut reader = XmlReader::new(xml);
    let (name, attrs, empty) = match reader.next()? {
        XmlEvent::StartElement { name, attrs, empty } => (name, attrs, empty),
        other => return Err(XmlError::Malformed(format!("expected start element, found {other:?}"))),
    };
    let Some(template) = schema.find_root(name.module.as_deref(), &name.local).cloned() else {
        let mut errors = ErrorQueue::new();
        errors.record(RpcError::new(ErrorType::Application, ErrorTag::UnknownElement).with_path(name.local.clone()));
        return Ok(None);
    };
    let mut parser = Parser {
        reader: &mut reader,
        arena,
        errors: ErrorQueue::new(),
        opts,
        path: Vec::new(),
        schema: Some(schema),
    };
    let root = parser.parse_element(&template, &name, &attrs, empty)?;
    Ok(Some(ParseOutcome { root, errors: parser.errors }))
}

impl<'a, 'x> Parser<'a, 'x> {
    fn current_path(&self) -> String {
        format!("/{}", self.path.join("/"))
    }

    fn record_error(&mut self, tag: ErrorTag, message: impl Into<String>) {
        let error = RpcError::new(ErrorType::Application, tag).with_path(self.current_path()).with_message(message);
        self.errors.record(error);
    }

    /// Records an `invalid-value` error carrying the rejected lexical
    /// value as `error-info`, so a client can report exactly what
    /// value was refused.
    fn record_invalid_value(&mut self, value: &str) {
        let error = RpcError::new(ErrorType::Application, ErrorTag::InvalidValue)
            .with_path(self.current_path())
            .with_message(format!("'{value}' is not a valid value for this node"))
            .with_info(format!("bad-value={value}"));
        self.errors.record(error);
    }

    /// Parses one element already opened by the caller (`name`/`attrs`
    /// describe its start tag) according to `template`, returning the
    /// node id allocated for it.
    fn parse_element(
        &mut self,
        template: &Arc<ObjTemplate>,
        name: &QName,
        attrs: &[Attribute],
        empty: bool,
    ) -> Result<NodeId, XmlError> {
        self.path.push(name.local.clone());
        let (metadata, edit_vars, metadata_status) = self.parse_metadata(template, attrs);

        let mut any_children: Vec<NodeId> = Vec::new();
        let (value, value_status, extra_status) = match template.base_type {
            BaseType::Container | BaseType::List | BaseType::Choice | BaseType::Case => {
                (XmlValue::Container, ParseStatus::Ok, ParseStatus::Ok)
            }
            BaseType::Any => {
                let (value, children) = self.parse_any_content(empty)?;
                any_children = children;
                (value, ParseStatus::Ok, ParseStatus::Ok)
            }
            _ => self.parse_scalar(template, empty)?,
        };

        let mut node = ValueNode::new(name.local.clone(), name.module.clone(), template.base_type, value);
        node.metadata = metadata;
        node.edit_vars = edit_vars;
        node.data_class = match template.data_class {
            SchemaDataClass::Config => SchemaDataClass::Config,
            SchemaDataClass::State => SchemaDataClass::State,
        };
        let node_id = self.arena.alloc(node);

        let mut instance_status = ParseStatus::Ok;
        match template.base_type {
            BaseType::Container | BaseType::Choice | BaseType::Case => {
                self.parse_children(template, node_id)?;
            }
            BaseType::List => {
                self.parse_children(template, node_id)?;
                let missing = self.arena.build_index_chain(node_id, &template.keys);
                if !missing.is_empty() {
                    instance_status = ParseStatus::InstanceCountError;
                    let path = self.current_path();
                    self.errors.record(
                        RpcError::new(ErrorType::Application, ErrorTag::MissingElement)
                            .with_path(path)
                            .with_message(format!("missing key leaf(s): {}", missing.join(", "))),
                    );
                }
            }
            BaseType::Any => {
                for child in any_children {
                    self.arena.append_child(node_id, child);
                }
            }
            _ => {}
        }

        let status = ParseStatus::combine(
            combine2(value_status, extra_status),
            metadata_status,
            instance_status,
        );
        self.arena.get_mut(node_id).parse_status = status;
        self.path.pop();
        Ok(node_id)
    }

    /// Consumes child events until the matching end tag, dispatching
    /// each recognized child to `parse_element` and recording
    /// `unknown-element` for anything the schema doesn't expect.
    fn parse_children(&mut self, template: &Arc<ObjTemplate>, parent: NodeId) -> Result<(), XmlError> {
        loop {
            match self.reader.next()? {
                XmlEvent::EndElement { .. } => return Ok(()),
                XmlEvent::Text(_) => continue,
                XmlEvent::Eof => return Err(XmlError::UnexpectedEof),
                XmlEvent::StartElement { name, attrs, empty } => {
                    match template.find_child(name.module.as_deref(), &name.local).cloned() {
                        Some(child_template) => {
                            let child_id = self.parse_element(&child_template, &name, &attrs, empty)?;
                            self.arena.append_child(parent, child_id);
                        }
                        None => {
                            self.path.push(name.local.clone());
                            self.record_error(ErrorTag::UnknownElement, "element not defined by schema");
                            self.path.pop();
                            self.skip_subtree(empty)?;
                        }
                    }
                }
            }
        }
    }

    fn skip_subtree(&mut self, already_empty: bool) -> Result<(), XmlError> {
        if already_empty {
            return Ok(());
        }
        let mut depth = 1;
        loop {
            match self.reader.next()? {
                XmlEvent::StartElement { empty, .. } => {
                    if !empty {
                        depth += 1;
                    }
                }
                XmlEvent::EndElement { .. } => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                XmlEvent::Eof => return Err(XmlError::UnexpectedEof),
                XmlEvent::Text(_) => {}
            }
        }
    }

    /// Parses `nc:operation`/`nc:insert`/`nc:key`/`nc:value` and any
    /// other attribute carried on the element into `Metadata`, and
    /// builds the node's `EditVars` from the NETCONF-namespaced ones.
    fn parse_metadata(&mut self, template: &Arc<ObjTemplate>, attrs: &[Attribute]) -> (Vec<Metadata>, Option<EditVars>, ParseStatus) {
        let mut metadata = Vec::new();
        let mut edit_vars = EditVars::default();
        let mut saw_edit_attr = false;
        let mut status = ParseStatus::Ok;
        let mut seen_edit_attrs: std::collections::HashSet<&str> = std::collections::HashSet::new();

        for attr in attrs {
            let is_nc = attr.name.module.as_deref() == Some(NC_NS);
            let is_edit_attr = is_nc && matches!(attr.name.local.as_str(), "operation" | "insert" | "key" | "value");
            if is_edit_attr && !seen_edit_attrs.insert(attr.name.local.as_str()) {
                status = ParseStatus::MetadataError;
                self.record_error(ErrorTag::BadAttribute, format!("nc:{} specified more than once", attr.name.local));
                continue;
            }

            if is_nc && attr.name.local == "operation" {
                saw_edit_attr = true;
                match attr.value.as_str() {
                    "merge" => edit_vars.operation = Some(EditOperation::Merge),
                    "replace" => edit_vars.operation = Some(EditOperation::Replace),
                    "create" => edit_vars.operation = Some(EditOperation::Create),
                    "delete" => edit_vars.operation = Some(EditOperation::Delete),
                    "remove" => edit_vars.operation = Some(EditOperation::Remove),
                    other => {
                        status = ParseStatus::MetadataError;
                        self.record_error(ErrorTag::BadAttribute, format!("invalid nc:operation value '{other}'"));
                    }
                }
                if edit_vars.operation.is_some() && !template_allows_operation(template) {
                    status = ParseStatus::MetadataError;
                    self.record_error(ErrorTag::BadAttribute, "nc:operation not permitted on this node");
                }
            } else if is_nc && attr.name.local == "insert" {
                saw_edit_attr = true;
                edit_vars.insert = match attr.value.as_str() {
                    "first" => Some(InsertPosition::First),
                    "last" => Some(InsertPosition::Last),
                    "before" => Some(InsertPosition::Before),
                    "after" => Some(InsertPosition::After),
                    other => {
                        status = ParseStatus::MetadataError;
                        self.record_error(ErrorTag::BadAttribute, format!("invalid nc:insert value '{other}'"));
                        None
                    }
                };
            } else if is_nc && attr.name.local == "key" {
                saw_edit_attr = true;
                edit_vars.key = Some(attr.value.clone());
            } else if is_nc && attr.name.local == "value" {
                saw_edit_attr = true;
                edit_vars.value = Some(attr.value.clone());
            } else {
                metadata.push(Metadata { name: attr.name.local.clone(), nsid: attr.name.module.clone(), value: attr.value.clone() });
            }
        }

        if saw_edit_attr {
            self.check_edit_attr_instance_counts(template, &edit_vars, &mut status);
        }

        let vars = if saw_edit_attr { Some(edit_vars) } else { None };
        (metadata, vars, status)
    }

    /// Enforces which of `nc:insert`/`nc:key`/`nc:value` are legal
    /// together on `template`: `insert` only applies to list or
    /// leaf-list nodes, `key` only to lists, `value` only to
    /// leaf-lists, and a `before`/`after` insert position requires the
    /// matching positional attribute to also be present.
    fn check_edit_attr_instance_counts(&mut self, template: &Arc<ObjTemplate>, edit_vars: &EditVars, status: &mut ParseStatus) {
        let is_list = template.base_type == BaseType::List;
        let is_leaf_list = template.base_type == BaseType::LeafListOfStrings;

        if let Some(insert) = edit_vars.insert {
            if !is_list && !is_leaf_list {
                *status = ParseStatus::MetadataError;
                self.record_error(ErrorTag::BadAttribute, "nc:insert only valid on list or leaf-list nodes");
            }
            if matches!(insert, InsertPosition::Before | InsertPosition::After) {
                if is_list && edit_vars.key.is_none() {
                    *status = ParseStatus::MetadataError;
                    self.record_error(ErrorTag::MissingAttribute, "nc:insert before/after on a list requires nc:key");
                }
                if is_leaf_list && edit_vars.value.is_none() {
                    *status = ParseStatus::MetadataError;
                    self.record_error(ErrorTag::MissingAttribute, "nc:insert before/after on a leaf-list requires nc:value");
                }
            }
        }

        if edit_vars.key.is_some() && !is_list {
            *status = ParseStatus::MetadataError;
            self.record_error(ErrorTag::BadAttribute, "nc:key only valid on list nodes");
        }
        if edit_vars.value.is_some() && !is_leaf_list {
            *status = ParseStatus::MetadataError;
            self.record_error(ErrorTag::BadAttribute, "nc:value only valid on leaf-list nodes");
        }
    }

    /// Parses a scalar leaf's text content according to its base
    /// type. Returns `(value, value_status, extra_status)`, where
    /// `extra_status` carries anything beyond a plain value error
    /// (currently unused, reserved for union/leafref two-phase
    /// validation wiring from component G). `template.base_type ==
    /// BaseType::Any` is handled by the caller before this is reached,
    /// since anyxml content may not be plain text.
    fn parse_scalar(&mut self, template: &Arc<ObjTemplate>, empty: bool) -> Result<(XmlValue, ParseStatus, ParseStatus), XmlError> {
        let text = if empty { String::new() } else { self.read_text_only()? };

        let (value, ok) = match template.base_type {
            BaseType::Empty => (XmlValue::Empty, text.trim().is_empty()),
            BaseType::Boolean => match text.as_str() {
                "true" => (XmlValue::Boolean(true), true),
                "false" => (XmlValue::Boolean(false), true),
                _ => (XmlValue::Boolean(false), false),
            },
            BaseType::Int8 => {
                let (v, ok) = parse_num(&text, XmlValue::Int8);
                (v.clone(), ok && in_range(template, &v))
            }
            BaseType::Int16 => {
                let (v, ok) = parse_num(&text, XmlValue::Int16);
                (v.clone(), ok && in_range(template, &v))
            }
            BaseType::Int32 => {
                let (v, ok) = parse_num(&text, XmlValue::Int32);
                (v.clone(), ok && in_range(template, &v))
            }
            BaseType::Int64 => {
                let (v, ok) = parse_num(&text, XmlValue::Int64);
                (v.clone(), ok && in_range(template, &v))
            }
            BaseType::Uint8 => {
                let (v, ok) = parse_num(&text, XmlValue::Uint8);
                (v.clone(), ok && in_range(template, &v))
            }
            BaseType::Uint16 => {
                let (v, ok) = parse_num(&text, XmlValue::Uint16);
                (v.clone(), ok && in_range(template, &v))
            }
            BaseType::Uint32 => {
                let (v, ok) = parse_num(&text, XmlValue::Uint32);
                (v.clone(), ok && in_range(template, &v))
            }
            BaseType::Uint64 => {
                let (v, ok) = parse_num(&text, XmlValue::Uint64);
                (v.clone(), ok && in_range(template, &v))
            }
            BaseType::Float64 => {
                let (v, ok) = parse_num(&text, XmlValue::Float64);
                (v.clone(), ok && in_range(template, &v))
            }
            BaseType::Decimal64 => {
                let fd = template.fraction_digits.unwrap_or(0);
                match parse_decimal64(&text, fd) {
                    Some(v) => {
                        let ok = in_range(template, &v);
                        (v, ok)
                    }
                    None => (XmlValue::Decimal64 { digits: 0, fraction_digits: fd }, false),
                }
            }
            BaseType::String => {
                let len_ok = match template.length {
                    Some((min, max)) => {
                        let len = text.chars().count();
                        len >= min && len <= max
                    }
                    None => true,
                };
                let pattern_ok = match &template.pattern {
                    Some(pattern) => regex::Regex::new(pattern).map(|re| re.is_match(&text)).unwrap_or(false),
                    None => true,
                };
                (XmlValue::Str(text.clone()), len_ok && pattern_ok)
            }
            BaseType::Binary => match base64::engine::general_purpose::STANDARD.decode(text.trim()) {
                Ok(bytes) => {
                    let len_ok = match template.length {
                        Some((min, max)) => bytes.len() >= min && bytes.len() <= max,
                        None => true,
                    };
                    (XmlValue::Binary(bytes), len_ok)
                }
                Err(_) => (XmlValue::Binary(Vec::new()), false),
            },
            BaseType::Enumeration => {
                if template.enum_values.iter().any(|v| v == &text) {
                    (XmlValue::Enumeration(text.clone()), true)
                } else {
                    (XmlValue::Enumeration(text.clone()), false)
                }
            }
            BaseType::Bits => {
                let tokens: Vec<String> = text.split_whitespace().map(str::to_string).collect();
                let all_known = tokens.iter().all(|t| template.bit_names.iter().any(|b| b == t));
                (XmlValue::Bits(tokens), all_known)
            }
            BaseType::LeafListOfStrings => (XmlValue::LeafListOfStrings(vec![text.clone()]), true),
            BaseType::Identityref => {
                let (module, name) = split_identity_ref(&text);
                let ok = match template.identity_base.as_deref() {
                    Some(base) => self.schema.map(|s| s.identity_derives_from(&name, base)).unwrap_or(false),
                    None => true,
                };
                (XmlValue::Identityref { nsid: module, name }, ok)
            }
            BaseType::Leafref => return Ok(self.parse_xpath_leaf(template, &text, Dialect::LeafrefPath, XmlValue::Leafref)),
            BaseType::InstanceIdentifier => {
                return Ok(self.parse_xpath_leaf(template, &text, Dialect::InstanceIdentifier, XmlValue::InstanceIdentifier))
            }
            BaseType::Union => return Ok(self.parse_union(template, &text)),
            BaseType::Any => unreachable!("anyxml handled by caller before parse_scalar"),
            BaseType::Extern | BaseType::Intern => (XmlValue::Str(text.clone()), true),
            BaseType::Container | BaseType::List | BaseType::Choice | BaseType::Case => {
                unreachable!("structural types handled by caller")
            }
        };

        if ok {
            Ok((value, ParseStatus::Ok, ParseStatus::Ok))
        } else {
            self.record_invalid_value(&text);
            Ok((value, ParseStatus::ValueError, ParseStatus::Ok))
        }
    }

    /// Tries each union member in declared order, accepting the first
    /// one whose lexical form is valid ("union
    /// resolution").
    fn parse_union(&mut self, template: &Arc<ObjTemplate>, text: &str) -> (XmlValue, ParseStatus, ParseStatus) {
        for member in &template.union_members {
            if scalar_lexically_valid(member, text) {
                return (XmlValue::Union(Box::new(scalar_from_text(member, text))), ParseStatus::Ok, ParseStatus::Ok);
            }
        }
        self.record_invalid_value(text);
        (XmlValue::Union(Box::new(XmlValue::Str(text.to_string()))), ParseStatus::ValueError, ParseStatus::Ok)
    }

    /// Parses a leafref or instance-identifier leaf's text as a
    /// restricted-XPath expression and resolves it against the schema
    /// (component G). With no `Schema` in scope (a bare
    /// `parse_document` call), the expression is accepted unchecked.
    fn parse_xpath_leaf(
        &mut self,
        template: &Arc<ObjTemplate>,
        text: &str,
        dialect: Dialect,
        wrap: impl Fn(String) -> XmlValue,
    ) -> (XmlValue, ParseStatus, ParseStatus) {
        let Some(schema) = self.schema else {
            return (wrap(text.to_string()), ParseStatus::Ok, ParseStatus::Ok);
        };
        match xpath::parse_path(text, dialect) {
            Ok(path) => {
                let outcome = xpath::validate_path(&path, dialect, schema, template, self.opts.lax_namespaces);
                if outcome.errors.is_empty() {
                    (wrap(text.to_string()), ParseStatus::Ok, ParseStatus::Ok)
                } else {
                    for error in outcome.errors {
                        self.errors.record(error);
                    }
                    (wrap(text.to_string()), ParseStatus::ValueError, ParseStatus::Ok)
                }
            }
            Err(e) => {
                let error = RpcError::new(ErrorType::Application, ErrorTag::InvalidValue)
                    .with_path(self.current_path())
                    .with_message(format!("malformed xpath expression: {e}"))
                    .with_info(format!("bad-value={text}"));
                self.errors.record(error);
                (wrap(text.to_string()), ParseStatus::ValueError, ParseStatus::Ok)
            }
        }
    }

    /// A scalar leaf's element contains exactly one text run (or is
    /// empty); mixed content / nested elements are a malformed
    /// message at the XML layer, not a value error, since no base
    /// type's list permits element children.
    fn read_text_only(&mut self) -> Result<String, XmlError> {
        let mut text = String::new();
        loop {
            match self.reader.next()? {
                XmlEvent::Text(t) => text.push_str(&t),
                XmlEvent::EndElement { .. } => return Ok(text),
                XmlEvent::StartElement { .. } => {
                    return Err(XmlError::Malformed("unexpected element inside scalar leaf".into()));
                }
                XmlEvent::Eof => return Err(XmlError::UnexpectedEof),
            }
        }
    }

    /// Parses an `anyxml`/`anydata` leaf's content: plain text is
    /// captured as opaque text, but content whose first inner event is
    /// a start tag is instead recursed into as an opaque container
    /// subtree (the returned `NodeId`s are the top-level children),
    /// since anyxml content carries no declared schema of its own.
    fn parse_any_content(&mut self, empty: bool) -> Result<(XmlValue, Vec<NodeId>), XmlError> {
        if empty {
            return Ok((XmlValue::Any(String::new()), Vec::new()));
        }
        match self.reader.next()? {
            XmlEvent::EndElement { .. } => Ok((XmlValue::Any(String::new()), Vec::new())),
            XmlEvent::Text(t) => {
                let mut text = t;
                loop {
                    match self.reader.next()? {
                        XmlEvent::Text(more) => text.push_str(&more),
                        XmlEvent::EndElement { .. } => return Ok((XmlValue::Any(text), Vec::new())),
                        XmlEvent::StartElement { .. } => {
                            return Err(XmlError::Malformed("mixed content inside anyxml leaf".into()));
                        }
                        XmlEvent::Eof => return Err(XmlError::UnexpectedEof),
                    }
                }
            }
            XmlEvent::StartElement { name, attrs, empty: child_empty } => {
                let mut children = vec![self.parse_opaque_element(&name, &attrs, child_empty)?];
                loop {
                    match self.reader.next()? {
                        XmlEvent::EndElement { .. } => return Ok((XmlValue::Container, children)),
                        XmlEvent::Text(_) => continue,
                        XmlEvent::Eof => return Err(XmlError::UnexpectedEof),
                        XmlEvent::StartElement { name, attrs, empty } => {
                            children.push(self.parse_opaque_element(&name, &attrs, empty)?);
                        }
                    }
                }
            }
            XmlEvent::Eof => Err(XmlError::UnexpectedEof),
        }
    }

    /// Builds one opaque node (and its descendants) for content nested
    /// inside an `anyxml`/`anydata` leaf, where no schema governs the
    /// child's shape; every node in the captured subtree carries
    /// `BaseType::Any`.
    fn parse_opaque_element(&mut self, name: &QName, attrs: &[Attribute], empty: bool) -> Result<NodeId, XmlError> {
        let metadata = attrs
            .iter()
            .map(|a| Metadata { name: a.name.local.clone(), nsid: a.name.module.clone(), value: a.value.clone() })
            .collect();
        let (value, children) = self.parse_any_content(empty)?;
        let mut node = ValueNode::new(name.local.clone(), name.module.clone(), BaseType::Any, value);
        node.metadata = metadata;
        let node_id = self.arena.alloc(node);
        for child in children {
            self.arena.append_child(node_id, child);
        }
        Ok(node_id)
    }
}

fn numeric_as_f64(value: &XmlValue) -> Option<f64> {
    match value {
        XmlValue::Int8(v) => Some(*v as f64),
        XmlValue::Int16(v) => Some(*v as f64),
        XmlValue::Int32(v) => Some(*v as f64),
        XmlValue::Int64(v) => Some(*v as f64),
        XmlValue::Uint8(v) => Some(*v as f64),
        XmlValue::Uint16(v) => Some(*v as f64),
        XmlValue::Uint32(v) => Some(*v as f64),
        XmlValue::Uint64(v) => Some(*v as f64),
        XmlValue::Float64(v) => Some(*v),
        XmlValue::Decimal64 { digits, fraction_digits } => Some(*digits as f64 / 10f64.powi(*fraction_digits as i32)),
        _ => None,
    }
}

/// Checks `value` against `template`'s active range restriction, if
/// any. Values the range restriction doesn't apply to (non-numeric
/// types) are always considered in range.
fn in_range(template: &ObjTemplate, value: &XmlValue) -> bool {
    match template.range {
        Some((min, max)) => numeric_as_f64(value).map(|v| v >= min && v <= max).unwrap_or(true),
        None => true,
    }
}

fn combine2(a: ParseStatus, b: ParseStatus) -> ParseStatus {
    if a != ParseStatus::Ok {
        a
    } else {
        b
    }
}

fn template_allows_operation(template: &Arc<ObjTemplate>) -> bool {
    !matches!(template.base_type, BaseType::Choice)
}

fn parse_num<T: FromStr, F: Fn(T) -> XmlValue>(text: &str, wrap: F) -> (XmlValue, bool) {
    match text.trim().parse::<T>() {
        Ok(v) => (wrap(v), true),
        Err(_) => (wrap_default::<T, F>(wrap), false),
    }
}

fn wrap_default<T: FromStr, F: Fn(T) -> XmlValue>(wrap: F) -> XmlValue {
    // only reachable on the error path, where the numeric value itself
    // is discarded in favor of the recorded error; zero is as good a
    // placeholder as any concrete T we don't otherwise have.
    match "0".parse::<T>() {
        Ok(v) => wrap(v),
        Err(_) => XmlValue::Str(String::new()),
    }
}

fn parse_decimal64(text: &str, fraction_digits: u8) -> Option<XmlValue> {
    let text = text.trim();
    let (sign, rest) = match text.strip_prefix('-') {
        Some(r) => (-1i64, r),
        None => (1i64, text),
    };
    let (int_part, frac_part) = match rest.split_once('.') {
        Some((i, f)) => (i, f),
        None => (rest, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if frac_part.len() > fraction_digits as usize || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let int_val: i64 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
    let scale = 10i64.checked_pow(fraction_digits as u32)?;
    let mut frac_val: i64 = if frac_part.is_empty() { 0 } else { frac_part.parse().ok()? };
    for _ in 0..(fraction_digits as usize).saturating_sub(frac_part.len()) {
        frac_val = frac_val.checked_mul(10)?;
    }
    let digits = sign * (int_val.checked_mul(scale)?.checked_add(frac_val)?);
    Some(XmlValue::Decimal64 { digits, fraction_digits })
}

fn split_identity_ref(text: &str) -> (Option<String>, String) {
    match text.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, text.to_string()),
    }
}

fn scalar_lexically_valid(member: &Arc<ObjTemplate>, text: &str) -> bool {
    match member.base_type {
        BaseType::Int8 => text.trim().parse::<i8>().is_ok(),
        BaseType::Int16 => text.trim().parse::<i16>().is_ok(),
        BaseType::Int32 => text.trim().parse::<i32>().is_ok(),
        BaseType::Int64 => text.trim().parse::<i64>().is_ok(),
        BaseType::Uint8 => text.trim().parse::<u8>().is_ok(),
        BaseType::Uint16 => text.trim().parse::<u16>().is_ok(),
        BaseType::Uint32 => text.trim().parse::<u32>().is_ok(),
        BaseType::Uint64 => text.trim().parse::<u64>().is_ok(),
        BaseType::Boolean => matches!(text, "true" | "false"),
        BaseType::Enumeration => member.enum_values.iter().any(|v| v == text),
        BaseType::String => true,
        _ => true,
    }
}

fn scalar_from_text(member: &Arc<ObjTemplate>, text: &str) -> XmlValue {
    match member.base_type {
        BaseType::Int8 => XmlValue::Int8(text.trim().parse().unwrap_or_default()),
        BaseType::Int16 => XmlValue::Int16(text.trim().parse().unwrap_or_default()),
        BaseType::Int32 => XmlValue::Int32(text.trim().parse().unwrap_or_default()),
        BaseType::Int64 => XmlValue::Int64(text.trim().parse().unwrap_or_default()),
        BaseType::Uint8 => XmlValue::Uint8(text.trim().parse().unwrap_or_default()),
        BaseType::Uint16 => XmlValue::Uint16(text.trim().parse().unwrap_or_default()),
        BaseType::Uint32 => XmlValue::Uint32(text.trim().parse().unwrap_or_default()),
        BaseType::Uint64 => XmlValue::Uint64(text.trim().parse().unwrap_or_default()),
        BaseType::Boolean => XmlValue::Boolean(text == "true"),
        BaseType::Enumeration => XmlValue::Enumeration(text.to_string()),
        _ => XmlValue::Str(text.to_string()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::fixture::users_schema;

    #[test]
    fn parses_well_formed_list_entry() {
        let schema = users_schema();
        let xml = br#"<users><user><name>bob</name><role>admin</role></user></users>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(!outcome.errors.has_errors());
        let user = arena.find_child(outcome.root, None, "user").unwrap();
        assert_eq!(arena.get(user).index_chain.len(), 1);
    }

    #[test]
    fn records_invalid_enum_value_without_aborting_siblings() {
        let schema = users_schema();
        let xml = br#"<users><user><name>bob</name><role>superuser</role></user></users>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(outcome.errors.has_errors());
        assert_eq!(outcome.errors.errors()[0].error_tag, ErrorTag::InvalidValue);
        let user = arena.find_child(outcome.root, None, "user").unwrap();
        // the name leaf still parsed fine even though role failed
        assert!(arena.find_child(user, None, "name").is_some());
    }

    #[test]
    fn unknown_top_level_element_reports_unknown_element() {
        let schema = users_schema();
        let xml = br#"<bogus/>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn missing_key_leaf_is_instance_count_error() {
        let schema = users_schema();
        let xml = br#"<users><user><role>admin</role></user></users>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(outcome.errors.has_errors());
        let user = arena.find_child(outcome.root, None, "user").unwrap();
        assert_eq!(arena.get(user).parse_status, ParseStatus::InstanceCountError);
    }

    #[test]
    fn decimal64_round_trips_two_fraction_digits() {
        let value = parse_decimal64("3.14", 2).unwrap();
        assert!(matches!(value, XmlValue::Decimal64 { digits: 314, fraction_digits: 2 }));
    }

    #[test]
    fn decimal64_rejects_excess_fraction_digits() {
        assert!(parse_decimal64("3.14159", 2).is_none());
    }

    #[test]
    fn empty_leaf_rejects_non_whitespace_content() {
        let root = ObjTemplate::container("thing", vec![ObjTemplate::leaf("flag", BaseType::Empty)]);
        let schema = Schema::new(vec![root]);
        let xml = br#"<thing><flag>garbage</flag></thing>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(outcome.errors.has_errors());
        assert_eq!(outcome.errors.errors()[0].error_tag, ErrorTag::InvalidValue);
    }

    #[test]
    fn empty_leaf_accepts_whitespace_only_content() {
        let root = ObjTemplate::container("thing", vec![ObjTemplate::leaf("flag", BaseType::Empty)]);
        let schema = Schema::new(vec![root]);
        let xml = br#"<thing><flag>  </flag></thing>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(!outcome.errors.has_errors());
    }

    #[test]
    fn bits_rejects_unknown_token() {
        let root = ObjTemplate::container("thing", vec![ObjTemplate::bits("flags", &["a", "b"])]);
        let schema = Schema::new(vec![root]);
        let xml = br#"<thing><flags>a z</flags></thing>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(outcome.errors.has_errors());
    }

    #[test]
    fn bits_accepts_declared_tokens() {
        let root = ObjTemplate::container("thing", vec![ObjTemplate::bits("flags", &["a", "b"])]);
        let schema = Schema::new(vec![root]);
        let xml = br#"<thing><flags>b a</flags></thing>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(!outcome.errors.has_errors());
    }

    #[test]
    fn identityref_rejects_unregistered_identity() {
        let root = ObjTemplate::container("thing", vec![ObjTemplate::identityref("kind", "base-kind")]);
        let schema = Schema::new(vec![root]).with_identities(&[("base-kind", None)]);
        let xml = br#"<thing><kind>ex:nonsense</kind></thing>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(outcome.errors.has_errors());
        assert_eq!(outcome.errors.errors()[0].error_tag, ErrorTag::InvalidValue);
    }

    #[test]
    fn identityref_accepts_derived_identity() {
        let root = ObjTemplate::container("thing", vec![ObjTemplate::identityref("kind", "base-kind")]);
        let schema = Schema::new(vec![root])
            .with_identities(&[("base-kind", None), ("derived-kind", Some("base-kind"))]);
        let xml = br#"<thing><kind>ex:derived-kind</kind></thing>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(!outcome.errors.has_errors());
    }

    #[test]
    fn identityref_without_schema_cannot_verify_declared_base() {
        let template = ObjTemplate::identityref("kind", "base-kind");
        let mut arena = Arena::new();
        let outcome = parse_document(br#"<kind>ex:whatever</kind>"#, &template, &mut arena, ParseOptions::default()).unwrap();
        assert!(outcome.errors.has_errors());
    }

    #[test]
    fn numeric_range_restriction_rejects_out_of_range_value() {
        let root = ObjTemplate::container(
            "thing",
            vec![ObjTemplate::with_range(ObjTemplate::leaf("count", BaseType::Int32), 0.0, 10.0)],
        );
        let schema = Schema::new(vec![root]);
        let xml = br#"<thing><count>99</count></thing>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(outcome.errors.has_errors());
    }

    #[test]
    fn numeric_range_restriction_accepts_in_range_value() {
        let root = ObjTemplate::container(
            "thing",
            vec![ObjTemplate::with_range(ObjTemplate::leaf("count", BaseType::Int32), 0.0, 10.0)],
        );
        let schema = Schema::new(vec![root]);
        let xml = br#"<thing><count>5</count></thing>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(!outcome.errors.has_errors());
    }

    #[test]
    fn string_length_restriction_rejects_too_long_value() {
        let root = ObjTemplate::container(
            "thing",
            vec![ObjTemplate::with_length(ObjTemplate::leaf("label", BaseType::String), 1, 3)],
        );
        let schema = Schema::new(vec![root]);
        let xml = br#"<thing><label>toolong</label></thing>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(outcome.errors.has_errors());
    }

    #[test]
    fn string_pattern_restriction_rejects_non_matching_value() {
        let root = ObjTemplate::container(
            "thing",
            vec![ObjTemplate::with_pattern(ObjTemplate::leaf("code", BaseType::String), "^[0-9]+$")],
        );
        let schema = Schema::new(vec![root]);
        let xml = br#"<thing><code>abc</code></thing>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(outcome.errors.has_errors());
    }

    #[test]
    fn binary_length_restriction_rejects_too_short_value() {
        let root = ObjTemplate::container(
            "thing",
            vec![ObjTemplate::with_length(ObjTemplate::leaf("blob", BaseType::Binary), 4, 8)],
        );
        let schema = Schema::new(vec![root]);
        // decodes to 2 bytes, below the 4-byte minimum
        let xml = br#"<thing><blob>aGk=</blob></thing>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(outcome.errors.has_errors());
    }

    #[test]
    fn leafref_resolves_against_schema() {
        let user_list = ObjTemplate::list("user", &["name"], vec![ObjTemplate::leaf("name", BaseType::String)]);
        let root = ObjTemplate::container(
            "users",
            vec![user_list, ObjTemplate::leaf("default-user", BaseType::Leafref)],
        );
        let schema = Schema::new(vec![root]);
        let xml = br#"<users><user><name>bob</name></user><default-user>/users/user/name</default-user></users>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(!outcome.errors.has_errors());
    }

    #[test]
    fn leafref_records_error_for_unresolvable_target() {
        let root = ObjTemplate::container("users", vec![ObjTemplate::leaf("default-user", BaseType::Leafref)]);
        let schema = Schema::new(vec![root]);
        let xml = br#"<users><default-user>/users/bogus/name</default-user></users>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(outcome.errors.has_errors());
    }

    #[test]
    fn leafref_without_schema_is_accepted_unchecked() {
        let template = ObjTemplate::leaf("default-user", BaseType::Leafref);
        let mut arena = Arena::new();
        let outcome =
            parse_document(br#"<default-user>/anything/goes</default-user>"#, &template, &mut arena, ParseOptions::default())
                .unwrap();
        assert!(!outcome.errors.has_errors());
    }

    #[test]
    fn instance_identifier_requires_key_predicate() {
        let user_list = ObjTemplate::list("user", &["name"], vec![ObjTemplate::leaf("name", BaseType::String)]);
        let root = ObjTemplate::container(
            "users",
            vec![user_list, ObjTemplate::leaf("current-user", BaseType::InstanceIdentifier)],
        );
        let schema = Schema::new(vec![root]);
        let xml = br#"<users><current-user>/users/user</current-user></users>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(outcome.errors.has_errors());
    }

    #[test]
    fn anyxml_captures_nested_element_as_container() {
        let root = ObjTemplate::container("data", vec![ObjTemplate::leaf("blob", BaseType::Any)]);
        let schema = Schema::new(vec![root]);
        let xml = br#"<data><blob><child>hi</child></blob></data>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(!outcome.errors.has_errors());
        let blob = arena.find_child(outcome.root, None, "blob").unwrap();
        assert!(matches!(arena.get(blob).value, XmlValue::Container));
        let child = arena.find_child(blob, None, "child").unwrap();
        assert!(matches!(&arena.get(child).value, XmlValue::Any(text) if text == "hi"));
    }

    #[test]
    fn anyxml_plain_text_still_captured_as_opaque_text() {
        let root = ObjTemplate::container("data", vec![ObjTemplate::leaf("blob", BaseType::Any)]);
        let schema = Schema::new(vec![root]);
        let xml = br#"<data><blob>just text</blob></data>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert!(!outcome.errors.has_errors());
        let blob = arena.find_child(outcome.root, None, "blob").unwrap();
        assert!(matches!(&arena.get(blob).value, XmlValue::Any(text) if text == "just text"));
    }

    #[test]
    fn duplicate_nc_key_attribute_is_metadata_error() {
        let list = ObjTemplate::list("user", &["name"], vec![ObjTemplate::leaf("name", BaseType::String)]);
        let xml = br#"<user/>"#;
        let mut reader = XmlReader::new(xml);
        reader.next().unwrap();
        let mut arena = Arena::new();
        let mut parser =
            Parser { reader: &mut reader, arena: &mut arena, errors: ErrorQueue::new(), opts: ParseOptions::default(), path: Vec::new(), schema: None };
        let attrs = vec![
            Attribute { name: QName { module: Some(NC_NS.to_string()), local: "key".to_string() }, value: "[name='a']".to_string() },
            Attribute { name: QName { module: Some(NC_NS.to_string()), local: "key".to_string() }, value: "[name='b']".to_string() },
        ];
        let (_, _, status) = parser.parse_metadata(&list, &attrs);
        assert_eq!(status, ParseStatus::MetadataError);
    }

    #[test]
    fn nc_insert_before_without_key_is_missing_attribute() {
        let list = ObjTemplate::list("user", &["name"], vec![ObjTemplate::leaf("name", BaseType::String)]);
        let xml = br#"<user/>"#;
        let mut reader = XmlReader::new(xml);
        reader.next().unwrap();
        let mut arena = Arena::new();
        let mut parser =
            Parser { reader: &mut reader, arena: &mut arena, errors: ErrorQueue::new(), opts: ParseOptions::default(), path: Vec::new(), schema: None };
        let attrs =
            vec![Attribute { name: QName { module: Some(NC_NS.to_string()), local: "insert".to_string() }, value: "before".to_string() }];
        let (_, _, status) = parser.parse_metadata(&list, &attrs);
        assert_eq!(status, ParseStatus::MetadataError);
        assert!(parser.errors.errors().iter().any(|e| e.error_tag == ErrorTag::MissingAttribute));
    }

    #[test]
    fn nc_key_on_non_list_node_is_bad_attribute() {
        let leaf_template = ObjTemplate::leaf("name", BaseType::String);
        let xml = br#"<name/>"#;
        let mut reader = XmlReader::new(xml);
        reader.next().unwrap();
        let mut arena = Arena::new();
        let mut parser =
            Parser { reader: &mut reader, arena: &mut arena, errors: ErrorQueue::new(), opts: ParseOptions::default(), path: Vec::new(), schema: None };
        let attrs =
            vec![Attribute { name: QName { module: Some(NC_NS.to_string()), local: "key".to_string() }, value: "[name='a']".to_string() }];
        let (_, _, status) = parser.parse_metadata(&leaf_template, &attrs);
        assert_eq!(status, ParseStatus::MetadataError);
    }

    #[test]
    fn invalid_value_records_bad_value_error_info() {
        let schema = users_schema();
        let xml = br#"<users><user><name>bob</name><role>blue</role></user></users>"#;
        let mut arena = Arena::new();
        let outcome = parse_against_schema(xml, &schema, &mut arena, ParseOptions::default()).unwrap().unwrap();
        assert_eq!(outcome.errors.errors()[0].error_info.as_deref(), Some("bad-value=blue"));
    }
}
