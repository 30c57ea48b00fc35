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

//! Restricted-XPath sub-evaluator (component G).
//!
//! Grounded on `examples/original_source/netconf/src/ncx/xpath_yang.c`:
//! the same three closed dialects (leafref path, instance-identifier,
//! schema-instance-identifier), the same two-phase split (syntax-only,
//! then schema-resolved), and the same `MAX_KEYS` predicate cap
//! (`xpath_yang.c` line ~957, mirrored here as
//! `consts::MAX_TRACKED_PREDICATE_KEYS`). No XPath crate is pulled in:
//! the grammar is a small closed subset, not general XPath 1.0, so a
//! hand-rolled tokenizer plus recursive-descent walk (the same shape
//! `xpath_yang.c` uses) is the right amount of machinery.

use std::fmt;

use netconfd_protocol::{ErrorTag, ErrorType, RpcError};

use crate::consts::MAX_TRACKED_PREDICATE_KEYS;
use crate::schema::{ObjTemplate, Schema};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    LeafrefPath,
    InstanceIdentifier,
    SchemaInstanceIdentifier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredicateValue {
    /// `[key = current()/rel-path]` — leafref-only.
    CurrentRelative(Vec<Step>),
    /// `[key = 'literal']` — instance-identifier / schema-instance.
    Literal(String),
    /// `[. = 'literal']` — leaf-list indexing.
    SelfLiteral(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub key: String,
    pub value: PredicateValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub prefix: Option<String>,
    pub name: String,
    pub predicates: Vec<Predicate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub absolute: bool,
    /// Number of leading `../` ascents (leafref-only).
    pub ascent: u32,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Slash,
    DotDot,
    Dot,
    Ident(String),
    Colon,
    LBracket,
    RBracket,
    Eq,
    Quoted(String),
    CurrentCall,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum XPathError {
    #[error("unexpected character '{0}' in xpath expression")]
    UnexpectedChar(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unexpected token, expected {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Splits a restricted-XPath expression into tokens. Shared across all
/// three dialects (tokenize using the shared XPath
/// tokenizer").
pub fn tokenize(input: &str) -> Result<Vec<Token>, XPathError> {
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    let mut out = Vec::new();
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '/' => {
                out.push(Token::Slash);
                i += 1;
            }
            '[' => {
                out.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                out.push(Token::RBracket);
                i += 1;
            }
            '=' => {
                out.push(Token::Eq);
                i += 1;
            }
            ':' => {
                out.push(Token::Colon);
                i += 1;
            }
            '.' => {
                if chars.get(i + 1) == Some(&'.') {
                    out.push(Token::DotDot);
                    i += 2;
                } else {
                    out.push(Token::Dot);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(XPathError::UnterminatedString);
                }
                let literal: String = chars[start..i].iter().collect();
                i += 1;
                out.push(Token::Quoted(literal));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-' || chars[i] == '.') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                if ident == "current" && chars.get(i) == Some(&'(') {
                    i += 1;
                    if chars.get(i) == Some(&')') {
                        i += 1;
                    }
                    out.push(Token::CurrentCall);
                } else {
                    out.push(Token::Ident(ident));
                }
            }
            other => return Err(XPathError::UnexpectedChar(other)),
        }
    }
    Ok(out)
}

struct TokenStream {
    tokens: Vec<Token>,
    pos: usize,
}

impl TokenStream {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: &Token) -> Result<(), XPathError> {
        match self.next() {
            Some(t) if &t == want => Ok(()),
            Some(t) => Err(XPathError::UnexpectedToken(format!("{want} (found {t})"))),
            None => Err(XPathError::UnexpectedEof),
        }
    }
}

/// Phase one: `path-arg → absolute-path | relative-path`, syntax only
/// (syntax-only phase). No schema lookup
/// happens here, so this can run while the schema tree is still being
/// compiled (or, in this crate's scope, simply before a `Schema` is
/// available).
pub fn parse_path(input: &str, dialect: Dialect) -> Result<Path, XPathError> {
    let tokens = tokenize(input)?;
    let mut ts = TokenStream { tokens, pos: 0 };

    if input == "/" {
        return Ok(Path { absolute: true, ascent: 0, steps: Vec::new() });
    }

    let absolute = matches!(ts.peek(), Some(Token::Slash));
    if absolute {
        ts.next();
    }

    let mut ascent = 0;
    if dialect == Dialect::LeafrefPath {
        while matches!(ts.peek(), Some(Token::DotDot)) {
            ts.next();
            ascent += 1;
            if matches!(ts.peek(), Some(Token::Slash)) {
                ts.next();
            }
        }
    }

    let mut steps = Vec::new();
    loop {
        if ts.peek().is_none() {
            break;
        }
        steps.push(parse_step(&mut ts, dialect)?);
        if matches!(ts.peek(), Some(Token::Slash)) {
            ts.next();
        } else {
            break;
        }
    }

    Ok(Path { absolute, ascent, steps })
}

fn parse_step(ts: &mut TokenStream, dialect: Dialect) -> Result<Step, XPathError> {
    let first = match ts.next() {
        Some(Token::Ident(s)) => s,
        Some(t) => return Err(XPathError::UnexpectedToken(format!("node-identifier (found {t})"))),
        None => return Err(XPathError::UnexpectedEof),
    };
    let (prefix, name) = if matches!(ts.peek(), Some(Token::Colon)) {
        ts.next();
        match ts.next() {
            Some(Token::Ident(local)) => (Some(first), local),
            Some(t) => return Err(XPathError::UnexpectedToken(format!("local-name (found {t})"))),
            None => return Err(XPathError::UnexpectedEof),
        }
    } else {
        (None, first)
    };

    let mut predicates = Vec::new();
    while matches!(ts.peek(), Some(Token::LBracket)) {
        predicates.push(parse_predicate(ts, dialect)?);
    }
    Ok(Step { prefix, name, predicates })
}

fn parse_predicate(ts: &mut TokenStream, dialect: Dialect) -> Result<Predicate, XPathError> {
    ts.expect(&Token::LBracket)?;

    if matches!(ts.peek(), Some(Token::Dot)) {
        ts.next();
        ts.expect(&Token::Eq)?;
        let literal = match ts.next() {
            Some(Token::Quoted(s)) => s,
            Some(t) => return Err(XPathError::UnexpectedToken(format!("quoted literal (found {t})"))),
            None => return Err(XPathError::UnexpectedEof),
        };
        ts.expect(&Token::RBracket)?;
        return Ok(Predicate { key: ".".to_string(), value: PredicateValue::SelfLiteral(literal) });
    }

    let key = match ts.next() {
        Some(Token::Ident(s)) => s,
        Some(t) => return Err(XPathError::UnexpectedToken(format!("node-identifier (found {t})"))),
        None => return Err(XPathError::UnexpectedEof),
    };
    ts.expect(&Token::Eq)?;

    let value = match ts.peek() {
        Some(Token::CurrentCall) if dialect == Dialect::LeafrefPath => {
            ts.next();
            ts.expect(&Token::Slash)?;
            let mut rel_steps = Vec::new();
            loop {
                rel_steps.push(parse_step(ts, dialect)?);
                if matches!(ts.peek(), Some(Token::Slash)) {
                    ts.next();
                } else {
                    break;
                }
            }
            PredicateValue::CurrentRelative(rel_steps)
        }
        Some(Token::Quoted(_)) => {
            let Token::Quoted(s) = ts.next().unwrap() else { unreachable!() };
            PredicateValue::Literal(s)
        }
        Some(t) => return Err(XPathError::UnexpectedToken(format!("current() or quoted literal (found {t})"))),
        None => return Err(XPathError::UnexpectedEof),
    };

    ts.expect(&Token::RBracket)?;
    Ok(Predicate { key, value })
}

/// Result of phase-two validation: the resolved target template (for
/// leafref/instance-identifier that successfully resolve) plus any
/// errors recorded along the way. Per the "65-key" boundary case,
/// validation still succeeds with a warning rather than failing.
pub struct ValidationOutcome {
    pub target: Option<Arc<ObjTemplate>>,
    pub errors: Vec<RpcError>,
    pub warnings: Vec<RpcError>,
}

/// Phase two: resolves every node-identifier in `path` against
/// `schema`, starting from `context` (the schema node the expression
/// is declared on). Config-vs-state compatibility and key-predicate
/// rules are enforced here (schema-resolved phase
/// two; "Target rules"; "Predicate checks").
pub fn validate_path(
    path: &Path,
    dialect: Dialect,
    schema: &Schema,
    context: &Arc<ObjTemplate>,
    lax_namespaces: bool,
) -> ValidationOutcome {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut total_keys_seen: usize = 0;

    let mut cursor = if path.absolute {
        match schema.find_root(context.nsid.as_deref(), path.steps.first().map(|s| s.name.as_str()).unwrap_or("")) {
            Some(root) => Some(root.clone()),
            None => None,
        }
    } else {
        Some(context.clone())
    };

    if path.steps.is_empty() {
        // bare "/" — instance-identifier document root, no error
        // (an instance-identifier that is exactly / returns
        // the document root").
        return ValidationOutcome { target: cursor, errors, warnings };
    }

    // A step's `prefix`, when present, is taken as already resolved to
    // a namespace identifier by the caller (from XML scope for
    // PDU-context expressions; YANG import resolution for
    // schema-declared leafref paths is out of scope alongside the YANG
    // compiler itself). `lax_namespaces` only affects callers that
    // feed this evaluator an unresolved prefix as `None` rather than
    // treating it as a hard error before we ever see the path.
    let _ = lax_namespaces;

    let start_index = if path.absolute { 1 } else { 0 };
    for (idx, step) in path.steps.iter().enumerate() {
        if idx == 0 && path.absolute {
            if cursor.is_none() {
                errors.push(
                    RpcError::new(ErrorType::Application, ErrorTag::UnknownElement)
                        .with_message(format!("no root element named '{}'", step.name)),
                );
                return ValidationOutcome { target: None, errors, warnings };
            }
            continue;
        }
        if idx < start_index {
            continue;
        }

        let Some(parent) = cursor.clone() else { break };

        let module = step.prefix.as_deref();
        match parent.find_child(module, &step.name) {
            Some(child) => {
                if dialect != Dialect::LeafrefPath
                    && matches!(child.base_type, crate::value::BaseType::List)
                {
                    let distinct: std::collections::HashSet<&str> =
                        step.predicates.iter().map(|p| p.key.as_str()).collect();
                    total_keys_seen += distinct.len();
                    check_predicate_keys(child, step, dialect, total_keys_seen, &mut errors, &mut warnings);
                }
                cursor = Some(child.clone());
            }
            None => {
                errors.push(
                    RpcError::new(ErrorType::Application, ErrorTag::UnknownElement)
                        .with_path(step.name.clone())
                        .with_message("node-identifier does not resolve against the schema"),
                );
                cursor = None;
            }
        }
    }

    if dialect == Dialect::LeafrefPath {
        if let Some(target) = &cursor {
            if !matches!(
                target.base_type,
                crate::value::BaseType::String
                    | crate::value::BaseType::Int8
                    | crate::value::BaseType::Int16
                    | crate::value::BaseType::Int32
                    | crate::value::BaseType::Int64
                    | crate::value::BaseType::Uint8
                    | crate::value::BaseType::Uint16
                    | crate::value::BaseType::Uint32
                    | crate::value::BaseType::Uint64
                    | crate::value::BaseType::Enumeration
                    | crate::value::BaseType::LeafListOfStrings
                    | crate::value::BaseType::Identityref
            ) {
                errors.push(
                    RpcError::new(ErrorType::Application, ErrorTag::BadElement)
                        .with_message("leafref target must be a leaf or leaf-list"),
                );
            }
            if Arc::ptr_eq(target, context) {
                errors.push(
                    RpcError::new(ErrorType::Application, ErrorTag::BadElement)
                        .with_message("leafref cannot point at itself"),
                );
            }
        }
    }

    if matches!(dialect, Dialect::InstanceIdentifier) {
        if context.data_class == crate::schema::DataClass::Config {
            if let Some(target) = &cursor {
                if target.data_class != crate::schema::DataClass::Config {
                    errors.push(
                        RpcError::new(ErrorType::Application, ErrorTag::BadElement)
                            .with_message("instance-identifier in a config leaf must target config"),
                    );
                }
            }
        }
    }

    ValidationOutcome { target: cursor, errors, warnings }
}

/// Counts distinct predicate keys on `step` against the list's
/// declared keys, enforcing predicate-checking rules:
/// duplicates are `bad-attribute`-like errors, strict
/// instance-identifiers require every key present, and the running
/// total across the whole path is capped at
/// `MAX_TRACKED_PREDICATE_KEYS` with a warning (not an error) beyond
/// that (the 64/65-key boundary case).
fn check_predicate_keys(
    list_template: &Arc<ObjTemplate>,
    step: &Step,
    dialect: Dialect,
    total_keys_seen: usize,
    errors: &mut Vec<RpcError>,
    warnings: &mut Vec<RpcError>,
) {
    let mut seen = std::collections::HashSet::new();
    for predicate in &step.predicates {
        if predicate.key == "." {
            continue;
        }
        if !seen.insert(predicate.key.clone()) {
            errors.push(
                RpcError::new(ErrorType::Application, ErrorTag::BadAttribute)
                    .with_path(step.name.clone())
                    .with_message(format!("duplicate predicate key '{}'", predicate.key)),
            );
        }
    }

    if total_keys_seen > MAX_TRACKED_PREDICATE_KEYS {
        warnings.push(
            RpcError::new(ErrorType::Application, ErrorTag::OperationFailed)
                .with_path(step.name.clone())
                .with_message(format!(
                    "predicate key count exceeds tracked maximum ({MAX_TRACKED_PREDICATE_KEYS}); remaining keys unchecked"
                )),
        );
        return;
    }

    if dialect == Dialect::InstanceIdentifier {
        for key in &list_template.keys {
            if !seen.contains(key) {
                errors.push(
                    RpcError::new(ErrorType::Application, ErrorTag::MissingAttribute)
                        .with_path(step.name.clone())
                        .with_message(format!("instance-identifier predicate missing key '{key}'")),
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::ObjTemplate;
    use crate::value::BaseType;

    #[test]
    fn tokenizes_leafref_with_current_predicate() {
        let tokens = tokenize("../../if:interfaces/if:interface[if:name=current()/../name]").unwrap();
        assert!(tokens.iter().any(|t| matches!(t, Token::CurrentCall)));
    }

    #[test]
    fn parses_absolute_instance_identifier_with_literal_predicate() {
        let path = parse_path("/users/user[name='bob']", Dialect::InstanceIdentifier).unwrap();
        assert!(path.absolute);
        assert_eq!(path.steps.len(), 2);
        assert_eq!(path.steps[1].predicates[0].key, "name");
        assert_eq!(path.steps[1].predicates[0].value, PredicateValue::Literal("bob".to_string()));
    }

    #[test]
    fn bare_slash_is_document_root() {
        let path = parse_path("/", Dialect::InstanceIdentifier).unwrap();
        assert!(path.steps.is_empty());
        assert!(path.absolute);
    }

    #[test]
    fn leading_ascent_counted_for_leafref() {
        let path = parse_path("../../name", Dialect::LeafrefPath).unwrap();
        assert_eq!(path.ascent, 2);
        assert_eq!(path.steps.len(), 1);
    }

    #[test]
    fn unterminated_string_is_rejected() {
        assert!(tokenize("[name='bob]").is_err());
    }

    #[test]
    fn duplicate_predicate_key_is_bad_attribute() {
        let list = ObjTemplate::list("user", &["name"], vec![ObjTemplate::leaf("name", BaseType::String)]);
        let step = Step {
            prefix: None,
            name: "user".to_string(),
            predicates: vec![
                Predicate { key: "name".to_string(), value: PredicateValue::Literal("a".to_string()) },
                Predicate { key: "name".to_string(), value: PredicateValue::Literal("b".to_string()) },
            ],
        };
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        check_predicate_keys(&list, &step, Dialect::InstanceIdentifier, 2, &mut errors, &mut warnings);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_tag, ErrorTag::BadAttribute);
    }

    #[test]
    fn sixty_fifth_key_warns_instead_of_erroring() {
        let list = ObjTemplate::list("user", &["name"], vec![ObjTemplate::leaf("name", BaseType::String)]);
        let step = Step { prefix: None, name: "user".to_string(), predicates: vec![] };
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        check_predicate_keys(&list, &step, Dialect::InstanceIdentifier, MAX_TRACKED_PREDICATE_KEYS + 1, &mut errors, &mut warnings);
        assert!(errors.is_empty());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn missing_key_in_instance_identifier_predicate_is_error() {
        let schema_root = ObjTemplate::container(
            "users",
            vec![ObjTemplate::list("user", &["name"], vec![ObjTemplate::leaf("name", BaseType::String)])],
        );
        let schema = Schema::new(vec![schema_root.clone()]);
        let path = parse_path("/users/user", Dialect::InstanceIdentifier).unwrap();
        let outcome = validate_path(&path, Dialect::InstanceIdentifier, &schema, &schema_root, false);
        assert!(outcome.errors.iter().any(|e| e.error_tag == ErrorTag::MissingAttribute));
    }
}
