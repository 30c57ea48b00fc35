// Copyright 2023 Google LLC
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

//! Value tree & metadata (component E).
//!
//! To tolerate cyclic graphs and parent back-pointers, the parent
//! link is modeled as a non-owning index into an arena rather than
//! `Rc`/`Weak`, generalizing the index-based node references
//! `daemon/trie.rs` uses for its prefix trie. Dynamic dispatch on base
//! type is a tagged variant (`XmlValue`) rather than a C-style tagged
//! union.

use std::sync::Arc;
use std::time::{Duration, Instant};

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseType {
    Empty,
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Decimal64,
    Float64,
    String,
    Binary,
    Enumeration,
    Bits,
    LeafListOfStrings,
    Container,
    List,
    Choice,
    Case,
    Any,
    Leafref,
    InstanceIdentifier,
    Identityref,
    Union,
    Extern,
    Intern,
}

/// The value union. Exactly one variant is active, matching the
/// node's `BaseType`.
#[derive(Clone)]
pub enum XmlValue {
    Empty,
    Boolean(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    /// Unscaled digits plus the schema's `fraction-digits`; the
    /// lexical value is `digits / 10^fraction_digits`.
    Decimal64 { digits: i64, fraction_digits: u8 },
    Float64(f64),
    Str(String),
    Binary(Vec<u8>),
    Enumeration(String),
    Bits(Vec<String>),
    LeafListOfStrings(Vec<String>),
    /// Containers/lists/choices/cases carry no inline scalar; their
    /// content lives entirely in the node's child sequence.
    Container,
    Identityref { nsid: Option<String>, name: String },
    Leafref(String),
    InstanceIdentifier(String),
    Union(Box<XmlValue>),
    /// Opaque passthrough content for `anyxml`-style nodes whose
    /// first inner event was a bare string.
    Any(String),
    Virtual(Virtual),
}

/// A value produced lazily via a registered provider, with a
/// per-session time-bounded cache (virtual nodes
/// "virtual values / cached callbacks").
#[derive(Clone)]
pub struct Virtual {
    pub fetch: Arc<dyn Fn() -> XmlValue + Send + Sync>,
    pub cache: Option<(Instant, Box<XmlValue>)>,
}

impl Virtual {
    pub fn new(fetch: Arc<dyn Fn() -> XmlValue + Send + Sync>) -> Self {
        Virtual { fetch, cache: None }
    }

    /// Returns the cached value if fresh, else invokes the provider
    /// and caches its result (virtual-value fetch with
    /// cache").
    pub fn get(&mut self, max_age: Duration) -> XmlValue {
        if let Some((fetched_at, value)) = &self.cache {
            if fetched_at.elapsed() <= max_age {
                return (**value).clone();
            }
        }
        let fresh = (self.fetch)();
        self.cache = Some((Instant::now(), Box::new(fresh.clone())));
        fresh
    }

    pub fn invalidate(&mut self) {
        self.cache = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOperation {
    None,
    Merge,
    Replace,
    Create,
    Delete,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    First,
    Last,
    Before,
    After,
}

#[derive(Debug, Clone, Default)]
pub struct EditVars {
    pub operation: Option<EditOperation>,
    pub insert: Option<InsertPosition>,
    pub key: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Metadata {
    pub name: String,
    pub nsid: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    pub dirty: bool,
    pub subtree_dirty: bool,
    pub deleted_marker: bool,
    pub set_by_default: bool,
    pub has_withdef_default: bool,
    pub is_metaval: bool,
    pub duplicates_ok_cached: Option<bool>,
}

pub use crate::schema::DataClass;

pub struct ValueNode {
    pub name: String,
    pub nsid: Option<String>,
    pub base_type: BaseType,
    pub value: XmlValue,
    pub children: Vec<NodeId>,
    pub metadata: Vec<Metadata>,
    /// Present only on list-instance nodes: one entry per declared
    /// key, in schema order, each pointing at a key-leaf child.
    pub index_chain: Vec<NodeId>,
    pub edit_vars: Option<EditVars>,
    pub flags: Flags,
    pub data_class: DataClass,
    pub parse_status: crate::errors::ParseStatus,
    pub parent: Option<NodeId>,
}

impl ValueNode {
    pub fn new(name: impl Into<String>, nsid: Option<String>, base_type: BaseType, value: XmlValue) -> Self {
        ValueNode {
            name: name.into(),
            nsid,
            base_type,
            value,
            children: Vec::new(),
            metadata: Vec::new(),
            index_chain: Vec::new(),
            edit_vars: None,
            flags: Flags::default(),
            data_class: DataClass::default(),
            parse_status: crate::errors::ParseStatus::Ok,
            parent: None,
        }
    }

    pub fn qname_matches(&self, module: Option<&str>, name: &str) -> bool {
        self.name == name && self.nsid.as_deref() == module
    }
}

/// Owns every value node reached from a session's messages. Nodes are
/// never moved once allocated; removal tombstones the slot so sibling
/// indices stay stable: deleted-marker nodes are
/// skipped ... retained until the enclosing edit operation completes".
#[derive(Default)]
pub struct Arena {
    slots: Vec<Option<ValueNode>>,
}

impl Arena {
    pub fn new() -> Self {
        Arena::default()
    }

    pub fn alloc(&mut self, node: ValueNode) -> NodeId {
        self.slots.push(Some(node));
        self.slots.len() - 1
    }

    pub fn get(&self, id: NodeId) -> &ValueNode {
        self.slots[id].as_ref().expect("use of freed node id")
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut ValueNode {
        self.slots[id].as_mut().expect("use of freed node id")
    }

    pub fn try_get(&self, id: NodeId) -> Option<&ValueNode> {
        self.slots.get(id).and_then(|s| s.as_ref())
    }

    /// Appends `child` to `parent`'s child sequence in arrival order
    /// and wires up the back-pointer.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.get_mut(child).parent = Some(parent);
        self.get_mut(parent).children.push(child);
    }

    /// Inserts `child` at a specific position, used when the schema
    /// demands declared-order placement at the root/containers
    /// (append a child preserving schema-declared
    /// order").
    pub fn insert_child_at(&mut self, parent: NodeId, pos: usize, child: NodeId) {
        self.get_mut(child).parent = Some(parent);
        let children = &mut self.get_mut(parent).children;
        let pos = pos.min(children.len());
        children.insert(pos, child);
    }

    /// Iterates live (non-deleted-marker) children of `parent`.
    pub fn children<'a>(&'a self, parent: NodeId) -> impl Iterator<Item = NodeId> + 'a {
        self.get(parent)
            .children
            .iter()
            .copied()
            .filter(move |&id| !self.get(id).flags.deleted_marker)
    }

    pub fn find_child(&self, parent: NodeId, module: Option<&str>, name: &str) -> Option<NodeId> {
        self.children(parent).find(|&id| self.get(id).qname_matches(module, name))
    }

    /// Marks `id` deleted; it is skipped by `children()` but stays in
    /// the arena until `free` is called once the enclosing edit
    /// operation completes.
    pub fn mark_deleted(&mut self, id: NodeId) {
        self.get_mut(id).flags.deleted_marker = true;
    }

    /// Recursively frees `id` and every descendant, releasing
    /// children, metadata, index chain, and edit-vars.
    pub fn free(&mut self, id: NodeId) {
        let children: Vec<NodeId> = self.get(id).children.clone();
        for child in children {
            self.free(child);
        }
        self.slots[id] = None;
    }

    /// Removes `child` from `parent`'s child sequence and frees its
    /// subtree.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) {
        self.get_mut(parent).children.retain(|&c| c != child);
        self.free(child);
    }

    /// Replaces `old_child` with `new_child` at its current position
    /// in `parent`'s child sequence, preserving sibling order and
    /// rewiring `new_child`'s back-pointer. `old_child`'s subtree is
    /// freed. A no-op if `old_child` is not currently a child of
    /// `parent`.
    pub fn replace_child(&mut self, parent: NodeId, old_child: NodeId, new_child: NodeId) {
        let Some(pos) = self.get(parent).children.iter().position(|&c| c == old_child) else {
            return;
        };
        self.get_mut(new_child).parent = Some(parent);
        self.get_mut(parent).children[pos] = new_child;
        self.free(old_child);
    }

    /// Merges `src` into `dest`, which are assumed to represent the
    /// same schema node (the caller has already matched them, e.g. by
    /// qname or list key). Containers, lists, choices, and cases merge
    /// child-by-child, matching existing children by qname and
    /// grafting any `src` child with no `dest` counterpart; `Bits` and
    /// `LeafListOfStrings` merge as a deduplicated union preserving
    /// `dest`'s existing order; every other (scalar) type takes `src`'s
    /// value wholesale. Matching same-named list instances to the
    /// correct sibling by key is left to the caller.
    pub fn merge(&mut self, dest: NodeId, src: NodeId) {
        match self.get(src).base_type {
            BaseType::Container | BaseType::Choice | BaseType::Case | BaseType::List => {
                let src_children: Vec<NodeId> = self.get(src).children.clone();
                for src_child in src_children {
                    if self.get(src_child).flags.deleted_marker {
                        continue;
                    }
                    let name = self.get(src_child).name.clone();
                    let nsid = self.get(src_child).nsid.clone();
                    match self.find_child(dest, nsid.as_deref(), &name) {
                        Some(existing) => self.merge(existing, src_child),
                        None => {
                            let cloned = self.clone_subtree(src_child, true);
                            self.append_child(dest, cloned);
                        }
                    }
                }
            }
            BaseType::Bits => {
                let merged = merge_string_list(
                    list_value(&self.get(dest).value),
                    list_value(&self.get(src).value),
                );
                self.get_mut(dest).value = XmlValue::Bits(merged);
            }
            BaseType::LeafListOfStrings => {
                let merged = merge_string_list(
                    list_value(&self.get(dest).value),
                    list_value(&self.get(src).value),
                );
                self.get_mut(dest).value = XmlValue::LeafListOfStrings(merged);
            }
            _ => {
                self.get_mut(dest).value = self.get(src).value.clone();
            }
        }
    }

    /// Marks `id` dirty and propagates `subtree_dirty` to every
    /// ancestor.
    pub fn mark_dirty(&mut self, id: NodeId) {
        self.get_mut(id).flags.dirty = true;
        let mut cur = self.get(id).parent;
        while let Some(p) = cur {
            self.get_mut(p).flags.subtree_dirty = true;
            cur = self.get(p).parent;
        }
    }

    /// Builds the index chain for a list-instance node: one entry per
    /// declared key, in order, each referencing the matching key-leaf
    /// child. Returns the names of any keys that could not be found
    /// (index chain generation).
    pub fn build_index_chain(&mut self, list_instance: NodeId, keys: &[String]) -> Vec<String> {
        let mut missing = Vec::new();
        let mut chain = Vec::new();
        for key in keys {
            match self.find_child(list_instance, None, key) {
                Some(child) => chain.push(child),
                None => missing.push(key.clone()),
            }
        }
        self.get_mut(list_instance).index_chain = chain;
        missing
    }

    /// `val_compare`: simple types by value, lists by index-chain
    /// equality, containers by pairwise schema-order child walk.
    pub fn compare(&self, a: NodeId, b: NodeId) -> bool {
        let na = self.get(a);
        let nb = self.get(b);
        if na.base_type != nb.base_type || na.name != nb.name || na.nsid != nb.nsid {
            return false;
        }
        match na.base_type {
            BaseType::Container | BaseType::Choice | BaseType::Case => self.compare_children_pairwise(a, b),
            BaseType::List => self.compare_index_chains(a, b),
            _ => self.compare_scalar(&na.value, &nb.value),
        }
    }

    fn compare_children_pairwise(&self, a: NodeId, b: NodeId) -> bool {
        let ca: Vec<NodeId> = self.children(a).collect();
        let cb: Vec<NodeId> = self.children(b).collect();
        ca.len() == cb.len() && ca.iter().zip(cb.iter()).all(|(&x, &y)| self.compare(x, y))
    }

    fn compare_index_chains(&self, a: NodeId, b: NodeId) -> bool {
        let ia = &self.get(a).index_chain;
        let ib = &self.get(b).index_chain;
        ia.len() == ib.len() && ia.iter().zip(ib.iter()).all(|(&x, &y)| self.compare(x, y))
    }

    fn compare_scalar(&self, a: &XmlValue, b: &XmlValue) -> bool {
        use XmlValue::*;
        match (a, b) {
            (Empty, Empty) => true,
            (Boolean(x), Boolean(y)) => x == y,
            (Int8(x), Int8(y)) => x == y,
            (Int16(x), Int16(y)) => x == y,
            (Int32(x), Int32(y)) => x == y,
            (Int64(x), Int64(y)) => x == y,
            (Uint8(x), Uint8(y)) => x == y,
            (Uint16(x), Uint16(y)) => x == y,
            (Uint32(x), Uint32(y)) => x == y,
            (Uint64(x), Uint64(y)) => x == y,
            (Decimal64 { digits: dx, fraction_digits: fx }, Decimal64 { digits: dy, fraction_digits: fy }) => {
                dx == dy && fx == fy
            }
            (Float64(x), Float64(y)) => x == y,
            (Str(x), Str(y)) => x == y,
            (Binary(x), Binary(y)) => x == y,
            (Enumeration(x), Enumeration(y)) => x == y,
            (Bits(x), Bits(y)) => x == y,
            (LeafListOfStrings(x), LeafListOfStrings(y)) => x == y,
            (Container, Container) => true,
            (Identityref { nsid: nx, name: namex }, Identityref { nsid: ny, name: namey }) => {
                nx == ny && namex == namey
            }
            (Leafref(x), Leafref(y)) => x == y,
            (InstanceIdentifier(x), InstanceIdentifier(y)) => x == y,
            (Union(x), Union(y)) => self.compare_scalar(x, y),
            (Any(x), Any(y)) => x == y,
            (Virtual(_), Virtual(_)) => false,
            _ => false,
        }
    }

    /// Deep-clones a subtree rooted at `id` into a fresh set of arena
    /// slots, returning the new root's id. Edit-vars are copied only
    /// when `copy_edit_vars` is set (clone with optional
    /// edit-var copy").
    pub fn clone_subtree(&mut self, id: NodeId, copy_edit_vars: bool) -> NodeId {
        let src = self.get(id);
        let mut cloned = ValueNode::new(src.name.clone(), src.nsid.clone(), src.base_type, src.value.clone());
        cloned.metadata = src.metadata.clone();
        cloned.flags = src.flags;
        cloned.data_class = src.data_class;
        cloned.parse_status = src.parse_status;
        if copy_edit_vars {
            cloned.edit_vars = src.edit_vars.clone();
        }
        let children: Vec<NodeId> = src.children.clone();
        let new_id = self.alloc(cloned);
        for child in children {
            let new_child = self.clone_subtree(child, copy_edit_vars);
            self.append_child(new_id, new_child);
        }
        // rebuild the index chain against the freshly cloned children
        // by position, since the old chain's ids are no longer valid.
        let old_chain_positions: Vec<usize> = {
            let src_children = &self.get(id).children;
            self.get(id)
                .index_chain
                .iter()
                .filter_map(|&old_key_id| src_children.iter().position(|&c| c == old_key_id))
                .collect()
        };
        let new_children = self.get(new_id).children.clone();
        self.get_mut(new_id).index_chain =
            old_chain_positions.into_iter().filter_map(|pos| new_children.get(pos).copied()).collect();
        new_id
    }
}

fn list_value(value: &XmlValue) -> &[String] {
    match value {
        XmlValue::Bits(v) | XmlValue::LeafListOfStrings(v) => v,
        _ => &[],
    }
}

/// Unions `src` into `dest`, preserving `dest`'s order and appending
/// any `src` entry not already present.
fn merge_string_list(dest: &[String], src: &[String]) -> Vec<String> {
    let mut merged = dest.to_vec();
    for item in src {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    merged
}

#[cfg(test)]
mod test {
    use super::*;

    fn leaf(arena: &mut Arena, name: &str, v: i32) -> NodeId {
        arena.alloc(ValueNode::new(name, None, BaseType::Int32, XmlValue::Int32(v)))
    }

    #[test]
    fn append_and_find_child() {
        let mut arena = Arena::new();
        let root = arena.alloc(ValueNode::new("root", None, BaseType::Container, XmlValue::Container));
        let child = leaf(&mut arena, "age", 7);
        arena.append_child(root, child);
        assert_eq!(arena.find_child(root, None, "age"), Some(child));
        assert_eq!(arena.get(child).parent, Some(root));
    }

    #[test]
    fn deleted_marker_skipped_by_iterator() {
        let mut arena = Arena::new();
        let root = arena.alloc(ValueNode::new("root", None, BaseType::Container, XmlValue::Container));
        let child = leaf(&mut arena, "age", 7);
        arena.append_child(root, child);
        arena.mark_deleted(child);
        assert_eq!(arena.children(root).count(), 0);
        // still present until freed
        assert!(arena.try_get(child).is_some());
    }

    #[test]
    fn index_chain_reports_missing_keys() {
        let mut arena = Arena::new();
        let list_instance =
            arena.alloc(ValueNode::new("user", None, BaseType::List, XmlValue::Container));
        let name_leaf = arena.alloc(ValueNode::new("name", None, BaseType::String, XmlValue::Str("bob".into())));
        arena.append_child(list_instance, name_leaf);

        let missing = arena.build_index_chain(list_instance, &["name".to_string(), "age".to_string()]);
        assert_eq!(missing, vec!["age".to_string()]);
        assert_eq!(arena.get(list_instance).index_chain.len(), 1);
    }

    #[test]
    fn val_compare_clone_is_equal() {
        let mut arena = Arena::new();
        let root = arena.alloc(ValueNode::new("root", None, BaseType::Container, XmlValue::Container));
        let child = leaf(&mut arena, "age", 7);
        arena.append_child(root, child);

        let clone = arena.clone_subtree(root, false);
        assert!(arena.compare(root, clone));
    }

    #[test]
    fn list_equality_is_index_chain_only() {
        let mut arena = Arena::new();
        let a = arena.alloc(ValueNode::new("user", None, BaseType::List, XmlValue::Container));
        let a_name = arena.alloc(ValueNode::new("name", None, BaseType::String, XmlValue::Str("bob".into())));
        arena.append_child(a, a_name);
        arena.build_index_chain(a, &["name".to_string()]);

        let b = arena.alloc(ValueNode::new("user", None, BaseType::List, XmlValue::Container));
        let b_name = arena.alloc(ValueNode::new("name", None, BaseType::String, XmlValue::Str("bob".into())));
        arena.append_child(b, b_name);
        // extra unrelated child that the index chain never references
        let b_extra = arena.alloc(ValueNode::new("note", None, BaseType::String, XmlValue::Str("x".into())));
        arena.append_child(b, b_extra);
        arena.build_index_chain(b, &["name".to_string()]);

        assert!(arena.compare(a, b));
    }

    #[test]
    fn virtual_value_caches_until_stale() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let mut v = Virtual::new(Arc::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            XmlValue::Int32(42)
        }));

        let _ = v.get(Duration::from_secs(60));
        let _ = v.get(Duration::from_secs(60));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        v.invalidate();
        let _ = v.get(Duration::from_secs(60));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn replace_child_preserves_position_and_back_pointer() {
        let mut arena = Arena::new();
        let root = arena.alloc(ValueNode::new("root", None, BaseType::Container, XmlValue::Container));
        let first = leaf(&mut arena, "age", 1);
        let second = leaf(&mut arena, "score", 2);
        let third = leaf(&mut arena, "count", 3);
        arena.append_child(root, first);
        arena.append_child(root, second);
        arena.append_child(root, third);

        let replacement = leaf(&mut arena, "score", 99);
        arena.replace_child(root, second, replacement);

        let children: Vec<NodeId> = arena.children(root).collect();
        assert_eq!(children, vec![first, replacement, third]);
        assert_eq!(arena.get(replacement).parent, Some(root));
        assert!(arena.try_get(second).is_none());
    }

    #[test]
    fn merge_unions_bits_without_duplicates() {
        let mut arena = Arena::new();
        let dest = arena.alloc(ValueNode::new(
            "flags",
            None,
            BaseType::Bits,
            XmlValue::Bits(vec!["a".to_string(), "b".to_string()]),
        ));
        let src = arena.alloc(ValueNode::new(
            "flags",
            None,
            BaseType::Bits,
            XmlValue::Bits(vec!["b".to_string(), "c".to_string()]),
        ));

        arena.merge(dest, src);
        let XmlValue::Bits(merged) = &arena.get(dest).value else { panic!("expected bits") };
        assert_eq!(merged, &vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn merge_recurses_into_containers_grafting_new_children() {
        let mut arena = Arena::new();
        let dest = arena.alloc(ValueNode::new("user", None, BaseType::Container, XmlValue::Container));
        let dest_name = leaf(&mut arena, "name", 1);
        arena.append_child(dest, dest_name);

        let src = arena.alloc(ValueNode::new("user", None, BaseType::Container, XmlValue::Container));
        let src_name = leaf(&mut arena, "name", 2);
        let src_age = leaf(&mut arena, "age", 30);
        arena.append_child(src, src_name);
        arena.append_child(src, src_age);

        arena.merge(dest, src);

        assert!(matches!(arena.get(dest_name).value, XmlValue::Int32(2)));
        let age = arena.find_child(dest, None, "age").unwrap();
        assert!(matches!(arena.get(age).value, XmlValue::Int32(30)));
    }

    #[test]
    fn dirty_propagates_to_ancestors() {
        let mut arena = Arena::new();
        let root = arena.alloc(ValueNode::new("root", None, BaseType::Container, XmlValue::Container));
        let mid = arena.alloc(ValueNode::new("mid", None, BaseType::Container, XmlValue::Container));
        let leaf_id = leaf(&mut arena, "age", 7);
        arena.append_child(root, mid);
        arena.append_child(mid, leaf_id);

        arena.mark_dirty(leaf_id);
        assert!(arena.get(leaf_id).flags.dirty);
        assert!(arena.get(mid).flags.subtree_dirty);
        assert!(arena.get(root).flags.subtree_dirty);
    }
}
