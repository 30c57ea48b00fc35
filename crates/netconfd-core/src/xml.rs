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

//! XML event reader (component D).
//!
//! `quick-xml` supplies the pull-parser, wrapped here as a
//! streaming-event reader that additionally carries a namespace scope
//! stack the schema-directed parser (component F) needs to resolve
//! element and attribute QNames as it walks down.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event as QxEvent};
use quick_xml::reader::Reader;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("malformed xml: {0}")]
    Malformed(String),
    #[error("unexpected end of document")]
    UnexpectedEof,
}

impl From<quick_xml::Error> for XmlError {
    fn from(e: quick_xml::Error) -> Self {
        XmlError::Malformed(e.to_string())
    }
}

/// A namespace-resolved element or attribute name: `None` module means
/// unprefixed/default-namespace-inherited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QName {
    pub module: Option<String>,
    pub local: String,
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: QName,
    pub value: String,
}

/// A simplified event stream tailored to what the schema-directed
/// parser needs: open tags carry their fully resolved name and
/// attributes, text is pre-decoded, and namespace declarations are
/// already folded into element/attribute names rather than surfaced
/// as their own event.
#[derive(Debug, Clone)]
pub enum XmlEvent {
    StartElement { name: QName, attrs: Vec<Attribute>, empty: bool },
    EndElement { name: QName },
    Text(String),
    Eof,
}

struct NsScope {
    /// prefix -> namespace URI; `""` is the default namespace.
    bindings: HashMap<String, String>,
}

/// Wraps a `quick_xml::Reader` over an in-memory buffer (NETCONF
/// messages are fully framed before parsing begins; there is no
/// streaming-over-the-wire XML decode) and maintains the namespace
/// scope stack across nested elements.
pub struct XmlReader<'a> {
    reader: Reader<&'a [u8]>,
    scopes: Vec<NsScope>,
    peeked: Option<XmlEvent>,
}

impl<'a> XmlReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        let mut reader = Reader::from_reader(buf);
        reader.config_mut().trim_text(true);
        XmlReader { reader, scopes: vec![NsScope { bindings: HashMap::new() }], peeked: None }
    }

    pub fn peek(&mut self) -> Result<&XmlEvent, XmlError> {
        if self.peeked.is_none() {
            self.peeked = Some(self.next_uncached()?);
        }
        Ok(self.peeked.as_ref().unwrap())
    }

    pub fn next(&mut self) -> Result<XmlEvent, XmlError> {
        if let Some(ev) = self.peeked.take() {
            return Ok(ev);
        }
        self.next_uncached()
    }

    fn next_uncached(&mut self) -> Result<XmlEvent, XmlError> {
        let mut buf = Vec::new();
        loop {
            match self.reader.read_event_into(&mut buf)? {
                QxEvent::Start(start) => {
                    self.push_scope(&start)?;
                    let name = self.resolve_element_name(&start)?;
                    let attrs = self.resolve_attrs(&start)?;
                    return Ok(XmlEvent::StartElement { name, attrs, empty: false });
                }
                QxEvent::Empty(start) => {
                    self.push_scope(&start)?;
                    let name = self.resolve_element_name(&start)?;
                    let attrs = self.resolve_attrs(&start)?;
                    self.scopes.pop();
                    return Ok(XmlEvent::StartElement { name, attrs, empty: true });
                }
                QxEvent::End(end) => {
                    let local = String::from_utf8_lossy(end.local_name().as_ref()).into_owned();
                    let module = self.resolve_prefix(qualified_prefix(end.name().as_ref()));
                    self.scopes.pop();
                    return Ok(XmlEvent::EndElement { name: QName { module, local } });
                }
                QxEvent::Text(text) => {
                    let decoded = text.unescape()?.into_owned();
                    if decoded.trim().is_empty() {
                        buf.clear();
                        continue;
                    }
                    return Ok(XmlEvent::Text(decoded));
                }
                QxEvent::CData(cdata) => {
                    let decoded = String::from_utf8_lossy(cdata.as_ref()).into_owned();
                    return Ok(XmlEvent::Text(decoded));
                }
                QxEvent::Comment(_) | QxEvent::PI(_) | QxEvent::Decl(_) | QxEvent::DocType(_) => {
                    buf.clear();
                    continue;
                }
                QxEvent::Eof => return Ok(XmlEvent::Eof),
            }
        }
    }

    fn push_scope(&mut self, start: &BytesStart) -> Result<(), XmlError> {
        let mut bindings = HashMap::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| XmlError::Malformed(e.to_string()))?;
            let key = attr.key.as_ref();
            if key == b"xmlns" {
                let value = attr.unescape_value()?.into_owned();
                bindings.insert(String::new(), value);
            } else if let Some(prefix) = key.strip_prefix(b"xmlns:") {
                let prefix = String::from_utf8_lossy(prefix).into_owned();
                let value = attr.unescape_value()?.into_owned();
                bindings.insert(prefix, value);
            }
        }
        self.scopes.push(NsScope { bindings });
        Ok(())
    }

    fn resolve_prefix(&self, prefix: &str) -> Option<String> {
        for scope in self.scopes.iter().rev() {
            if let Some(uri) = scope.bindings.get(prefix) {
                return Some(uri.clone());
            }
        }
        None
    }

    fn resolve_element_name(&self, start: &BytesStart) -> Result<QName, XmlError> {
        let raw = start.name();
        let local = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let module = self.resolve_prefix(qualified_prefix(raw.as_ref()));
        Ok(QName { module, local })
    }

    fn resolve_attrs(&self, start: &BytesStart) -> Result<Vec<Attribute>, XmlError> {
        let mut out = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| XmlError::Malformed(e.to_string()))?;
            let key = attr.key.as_ref();
            if key == b"xmlns" || key.starts_with(b"xmlns:") {
                continue;
            }
            let local = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            // unprefixed attributes carry no namespace per XML Namespaces
            // §5.2, unlike unprefixed elements which inherit the default.
            let module = match qualified_prefix(key) {
                "" => None,
                prefix => self.resolve_prefix(prefix),
            };
            let value = attr.unescape_value()?.into_owned();
            out.push(Attribute { name: QName { module, local }, value });
        }
        Ok(out)
    }
}

fn qualified_prefix(raw: &[u8]) -> &str {
    match raw.iter().position(|&b| b == b':') {
        Some(idx) => std::str::from_utf8(&raw[..idx]).unwrap_or(""),
        None => "",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolves_default_namespace_on_unprefixed_elements() {
        let xml = br#"<top xmlns="urn:example"><child>hi</child></top>"#;
        let mut r = XmlReader::new(xml);
        let ev = r.next().unwrap();
        match ev {
            XmlEvent::StartElement { name, .. } => {
                assert_eq!(name.local, "top");
                assert_eq!(name.module.as_deref(), Some("urn:example"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        let ev = r.next().unwrap();
        match ev {
            XmlEvent::StartElement { name, .. } => assert_eq!(name.module.as_deref(), Some("urn:example")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn resolves_prefixed_elements_and_attributes() {
        let xml = br#"<nc:rpc xmlns:nc="urn:ietf:params:xml:ns:netconf:base:1.0" nc:message-id="1"/>"#;
        let mut r = XmlReader::new(xml);
        let ev = r.next().unwrap();
        match ev {
            XmlEvent::StartElement { name, attrs, empty } => {
                assert!(empty);
                assert_eq!(name.local, "rpc");
                assert_eq!(name.module.as_deref(), Some("urn:ietf:params:xml:ns:netconf:base:1.0"));
                assert_eq!(attrs.len(), 1);
                assert_eq!(attrs[0].name.local, "message-id");
                assert_eq!(attrs[0].value, "1");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unprefixed_attribute_has_no_namespace() {
        let xml = br#"<top xmlns="urn:example" count="3"/>"#;
        let mut r = XmlReader::new(xml);
        let ev = r.next().unwrap();
        match ev {
            XmlEvent::StartElement { attrs, .. } => {
                assert_eq!(attrs[0].name.module, None);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn peek_does_not_consume() {
        let xml = br#"<a/>"#;
        let mut r = XmlReader::new(xml);
        let peeked_name = match r.peek().unwrap() {
            XmlEvent::StartElement { name, .. } => name.local.clone(),
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(peeked_name, "a");
        let next_name = match r.next().unwrap() {
            XmlEvent::StartElement { name, .. } => name.local,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(next_name, peeked_name);
        assert!(matches!(r.next().unwrap(), XmlEvent::Eof));
    }

    #[test]
    fn text_content_is_decoded() {
        let xml = br#"<a>a &amp; b</a>"#;
        let mut r = XmlReader::new(xml);
        let _ = r.next().unwrap();
        match r.next().unwrap() {
            XmlEvent::Text(t) => assert_eq!(t, "a & b"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
