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

//! Schema types the parser (component F) walks against.
//!
//! Compiling YANG modules into this shape is explicitly out of scope;
//! this module defines just the in-memory template shape a compiled
//! schema would produce, plus a small builder used by tests and by
//! whatever loads a pre-compiled schema at startup. Structured as a
//! tree of named, child-bearing nodes with cheap lookup, generalized
//! from a prefix trie over shell input to a name-indexed
//! tree over QNames.

use std::collections::HashMap;
use std::sync::Arc;

use crate::value::BaseType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataClass {
    #[default]
    Config,
    State,
}

/// One node in the compiled schema tree: a leaf, leaf-list, container,
/// list, choice, case, or anyxml/anydata template. `children` is
/// populated for the structural types; the scalar-only fields are
/// populated only for the base types that need them.
pub struct ObjTemplate {
    pub name: String,
    pub nsid: Option<String>,
    pub base_type: BaseType,
    pub children: Vec<Arc<ObjTemplate>>,
    /// Declared key leaf names, in schema order, for `List` nodes.
    pub keys: Vec<String>,
    /// Valid enum literal set, for `Enumeration` nodes.
    pub enum_values: Vec<String>,
    /// Member type templates, for `Union` nodes.
    pub union_members: Vec<Arc<ObjTemplate>>,
    /// The identity base name, for `Identityref` nodes.
    pub identity_base: Option<String>,
    /// Declared bit names, in schema order, for `Bits` nodes.
    pub bit_names: Vec<String>,
    /// Active range restriction (inclusive min, max), for numeric
    /// nodes.
    pub range: Option<(f64, f64)>,
    /// Active length restriction (inclusive min, max): character count
    /// for `String`, decoded byte count for `Binary`.
    pub length: Option<(usize, usize)>,
    /// Active pattern restriction, for `String` nodes.
    pub pattern: Option<String>,
    /// `fraction-digits`, for `Decimal64` nodes.
    pub fraction_digits: Option<u8>,
    pub data_class: DataClass,
    pub mandatory: bool,
    pub default: Option<String>,
    /// `true` for `List`/`LeafListOfStrings` nodes, which may repeat.
    pub max_unbounded: bool,
}

impl ObjTemplate {
    fn base(name: impl Into<String>, base_type: BaseType) -> Self {
        ObjTemplate {
            name: name.into(),
            nsid: None,
            base_type,
            children: Vec::new(),
            keys: Vec::new(),
            enum_values: Vec::new(),
            union_members: Vec::new(),
            identity_base: None,
            bit_names: Vec::new(),
            range: None,
            length: None,
            pattern: None,
            fraction_digits: None,
            data_class: DataClass::Config,
            mandatory: false,
            default: None,
            max_unbounded: false,
        }
    }

    pub fn leaf(name: impl Into<String>, base_type: BaseType) -> Arc<Self> {
        Arc::new(ObjTemplate::base(name, base_type))
    }

    pub fn enumeration(name: impl Into<String>, values: &[&str]) -> Arc<Self> {
        let mut t = ObjTemplate::base(name, BaseType::Enumeration);
        t.enum_values = values.iter().map(|s| s.to_string()).collect();
        Arc::new(t)
    }

    pub fn decimal64(name: impl Into<String>, fraction_digits: u8) -> Arc<Self> {
        let mut t = ObjTemplate::base(name, BaseType::Decimal64);
        t.fraction_digits = Some(fraction_digits);
        Arc::new(t)
    }

    pub fn identityref(name: impl Into<String>, base: impl Into<String>) -> Arc<Self> {
        let mut t = ObjTemplate::base(name, BaseType::Identityref);
        t.identity_base = Some(base.into());
        Arc::new(t)
    }

    pub fn bits(name: impl Into<String>, bit_names: &[&str]) -> Arc<Self> {
        let mut t = ObjTemplate::base(name, BaseType::Bits);
        t.bit_names = bit_names.iter().map(|s| s.to_string()).collect();
        Arc::new(t)
    }

    pub fn with_range(mut self_arc: Arc<Self>, min: f64, max: f64) -> Arc<Self> {
        Arc::make_mut(&mut self_arc).range = Some((min, max));
        self_arc
    }

    pub fn with_length(mut self_arc: Arc<Self>, min: usize, max: usize) -> Arc<Self> {
        Arc::make_mut(&mut self_arc).length = Some((min, max));
        self_arc
    }

    pub fn with_pattern(mut self_arc: Arc<Self>, pattern: impl Into<String>) -> Arc<Self> {
        Arc::make_mut(&mut self_arc).pattern = Some(pattern.into());
        self_arc
    }

    pub fn leaf_list(name: impl Into<String>) -> Arc<Self> {
        let mut t = ObjTemplate::base(name, BaseType::LeafListOfStrings);
        t.max_unbounded = true;
        Arc::new(t)
    }

    pub fn union(name: impl Into<String>, members: Vec<Arc<ObjTemplate>>) -> Arc<Self> {
        let mut t = ObjTemplate::base(name, BaseType::Union);
        t.union_members = members;
        Arc::new(t)
    }

    pub fn container(name: impl Into<String>, children: Vec<Arc<ObjTemplate>>) -> Arc<Self> {
        let mut t = ObjTemplate::base(name, BaseType::Container);
        t.children = children;
        Arc::new(t)
    }

    pub fn list(name: impl Into<String>, keys: &[&str], children: Vec<Arc<ObjTemplate>>) -> Arc<Self> {
        let mut t = ObjTemplate::base(name, BaseType::List);
        t.keys = keys.iter().map(|s| s.to_string()).collect();
        t.children = children;
        t.max_unbounded = true;
        Arc::new(t)
    }

    pub fn choice(name: impl Into<String>, cases: Vec<Arc<ObjTemplate>>) -> Arc<Self> {
        let mut t = ObjTemplate::base(name, BaseType::Choice);
        t.children = cases;
        Arc::new(t)
    }

    pub fn case(name: impl Into<String>, children: Vec<Arc<ObjTemplate>>) -> Arc<Self> {
        let mut t = ObjTemplate::base(name, BaseType::Case);
        t.children = children;
        Arc::new(t)
    }

    pub fn with_nsid(mut self_arc: Arc<Self>, nsid: impl Into<String>) -> Arc<Self> {
        Arc::make_mut(&mut self_arc).nsid = Some(nsid.into());
        self_arc
    }

    pub fn with_mandatory(mut self_arc: Arc<Self>, mandatory: bool) -> Arc<Self> {
        Arc::make_mut(&mut self_arc).mandatory = mandatory;
        self_arc
    }

    pub fn with_default(mut self_arc: Arc<Self>, default: impl Into<String>) -> Arc<Self> {
        Arc::make_mut(&mut self_arc).default = Some(default.into());
        self_arc
    }

    pub fn with_state(mut self_arc: Arc<Self>) -> Arc<Self> {
        Arc::make_mut(&mut self_arc).data_class = DataClass::State;
        self_arc
    }

    pub fn find_child(&self, module: Option<&str>, name: &str) -> Option<&Arc<ObjTemplate>> {
        self.children.iter().find(|c| c.name == name && c.nsid.as_deref() == module)
    }
}

impl Clone for ObjTemplate {
    fn clone(&self) -> Self {
        ObjTemplate {
            name: self.name.clone(),
            nsid: self.nsid.clone(),
            base_type: self.base_type,
            children: self.children.clone(),
            keys: self.keys.clone(),
            enum_values: self.enum_values.clone(),
            union_members: self.union_members.clone(),
            identity_base: self.identity_base.clone(),
            bit_names: self.bit_names.clone(),
            range: self.range,
            length: self.length,
            pattern: self.pattern.clone(),
            fraction_digits: self.fraction_digits,
            data_class: self.data_class,
            mandatory: self.mandatory,
            default: self.default.clone(),
            max_unbounded: self.max_unbounded,
        }
    }
}

/// The compiled schema's top-level entry points, keyed by qname for
/// constant-time root lookups during message dispatch.
pub struct Schema {
    roots: HashMap<(Option<String>, String), Arc<ObjTemplate>>,
    /// Declared identities, by local name, mapping each to its direct
    /// base identity (`None` for a root identity with no base).
    /// Prefix/module resolution for identity names is left to the
    /// caller, the same way leafref path steps carry an already
    /// resolved `prefix` by the time `xpath::validate_path` sees them.
    identities: HashMap<String, Option<String>>,
}

impl Schema {
    pub fn new(roots: Vec<Arc<ObjTemplate>>) -> Self {
        let mut map = HashMap::new();
        for root in roots {
            map.insert((root.nsid.clone(), root.name.clone()), root);
        }
        Schema { roots: map, identities: HashMap::new() }
    }

    pub fn find_root(&self, module: Option<&str>, name: &str) -> Option<&Arc<ObjTemplate>> {
        self.roots.get(&(module.map(str::to_string), name.to_string()))
    }

    /// Registers the declared identity hierarchy: `(name, base)` pairs,
    /// where `base` is `None` for an identity with no declared base.
    pub fn with_identities(mut self, identities: &[(&str, Option<&str>)]) -> Self {
        self.identities =
            identities.iter().map(|(name, base)| (name.to_string(), base.map(str::to_string))).collect();
        self
    }

    /// True if `name` is `base` itself, or derives from it through one
    /// or more `base` links (ancestor-or-self check). Returns `false`
    /// for an unregistered identity name or a cycle.
    pub fn identity_derives_from(&self, name: &str, base: &str) -> bool {
        if name == base {
            return true;
        }
        let mut current = name.to_string();
        let mut seen = std::collections::HashSet::new();
        while seen.insert(current.clone()) {
            match self.identities.get(&current) {
                Some(Some(parent)) => {
                    if parent == base {
                        return true;
                    }
                    current = parent.clone();
                }
                _ => return false,
            }
        }
        false
    }
}

#[cfg(test)]
pub mod fixture {
    use super::*;

    /// A minimal schema used across module tests: a single top-level
    /// `users` list keyed by `name`, with a `role` enum leaf and a
    /// `tags` leaf-list.
    pub fn users_schema() -> Schema {
        let user = ObjTemplate::list(
            "user",
            &["name"],
            vec![
                ObjTemplate::leaf("name", BaseType::String),
                ObjTemplate::enumeration("role", &["admin", "viewer"]),
                ObjTemplate::leaf_list("tags"),
            ],
        );
        let users = ObjTemplate::container("users", vec![user]);
        Schema::new(vec![users])
    }
}
