//! The atom graph: every named declaration (namespace, class, function,
//! variable, type alias, unit) becomes an atom, arranged in a tree by
//! lexical nesting. Atoms own their instantiation cache.

use std::collections::HashMap;
use std::rc::Rc;

use ir::Sequence;

use crate::config;
use crate::report::Origin;
use crate::signature::Signature;
use crate::types::Classdef;

/// Atom ids are dense indices into the [`AtomMap`]. 0 is never a valid
/// atom; a zero operand lane always means "no atom".
pub type AtomId = u32;

pub type InstanceId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomKind {
    Namespace,
    Class,
    Funcdef,
    Vardef,
    Typealias,
    Unit,
}

/// Behavior flags orthogonal to the atom kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct Category {
    pub ctor: bool,
    pub dtor: bool,
    pub clone: bool,
    pub operator: bool,
    pub functor: bool,
    /// Hidden member synthesized for a captured variable candidate.
    pub captured: bool,
    /// Eligible for "did you mean" suggestions.
    pub suggestible: bool,
}

/// One declared parameter of a funcdef.
#[derive(Debug, Clone, Default)]
pub struct ParamDecl {
    pub name: String,
    pub lvid: u32,
    /// Declared type name; empty means unconstrained.
    pub typename: String,
}

/// Where the atom's raw opcodes live: a shared input sequence plus the
/// offset of the atom's `blueprint` instruction.
#[derive(Debug, Clone)]
pub struct AtomBody {
    pub sequence: Rc<Sequence>,
    pub offset: u32,
}

/// Destructor and clone entry points of a class, filled in once the class
/// is instantiated.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassInfo {
    pub dtor: Option<(AtomId, InstanceId)>,
    pub clone: Option<(AtomId, InstanceId)>,
    /// Synthesized zeroing constructor, used when no user `^new` exists.
    pub default_ctor: Option<(AtomId, InstanceId)>,
    pub next_field_index: u32,
}

/// One finalized instantiation.
#[derive(Debug, Clone)]
pub struct InstanceEntry {
    /// Resolved executable sequence. `None` only while the instantiation
    /// is in flight (the entry is reserved before the body is walked);
    /// class and generic-remap entries are finalized with an empty
    /// placeholder sequence, as they carry no executable body of their
    /// own.
    pub sequence: Option<Rc<Sequence>>,
    pub rettype: Classdef,
    /// Mangled, human-readable symbol for listings and diagnostics.
    pub symbol: String,
    /// For a generic atom: the concrete clone serving this signature.
    pub remap_atom: AtomId,
}

/// Cache query outcome. The three states are load-bearing: `Found` may
/// point at a reserved, still-building entry (recursion), `Invalid`
/// records a permanent failure so the body is never re-walked. A hit on
/// `Invalid` still gets a fresh one-line error naming the symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceLookup {
    Found(InstanceId),
    Invalid,
    Unknown,
}

/// Per-atom instantiation cache, keyed by signature.
///
/// Entries are write-once: `create` reserves an id, `update` finalizes it
/// exactly once, `invalidate` tombstones the signature. A live entry is
/// never overwritten.
#[derive(Debug, Clone, Default)]
pub struct Instances {
    keys: HashMap<Signature, Option<InstanceId>>,
    entries: Vec<InstanceEntry>,
}

impl Instances {
    pub fn find(&self, signature: &Signature) -> InstanceLookup {
        match self.keys.get(signature) {
            Some(Some(id)) => InstanceLookup::Found(*id),
            Some(None) => InstanceLookup::Invalid,
            None => InstanceLookup::Unknown,
        }
    }

    /// Reserve the next instance id for `signature`.
    pub fn create(&mut self, signature: Signature) -> InstanceId {
        debug_assert_eq!(self.find(&signature), InstanceLookup::Unknown);
        let id = self.entries.len() as InstanceId;
        self.entries.push(InstanceEntry {
            sequence: None,
            rettype: Classdef::void(),
            symbol: String::new(),
            remap_atom: 0,
        });
        self.keys.insert(signature, Some(id));
        id
    }

    /// Bind a generic signature to its concrete clone.
    pub fn set_remap(&mut self, id: InstanceId, atom: AtomId) {
        self.entries[id as usize].remap_atom = atom;
    }

    /// Finalize a reserved entry.
    pub fn update(&mut self, id: InstanceId, sequence: Rc<Sequence>, rettype: Classdef, symbol: String) {
        let entry = &mut self.entries[id as usize];
        debug_assert!(entry.sequence.is_none(), "instance {id} finalized twice");
        entry.sequence = Some(sequence);
        entry.rettype = rettype;
        entry.symbol = symbol;
    }

    /// Record a permanent failure for `signature`. Later lookups return
    /// `Invalid` without re-running the builder.
    pub fn invalidate(&mut self, signature: &Signature) {
        self.keys.insert(signature.clone(), None);
    }

    pub fn get(&self, id: InstanceId) -> Option<&InstanceEntry> {
        self.entries.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstanceId, &InstanceEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(id, e)| (id as InstanceId, e))
    }
}

#[derive(Debug, Clone)]
pub struct Atom {
    pub atomid: AtomId,
    pub kind: AtomKind,
    pub name: String,
    pub parent: AtomId,
    pub children: Vec<AtomId>,
    pub category: Category,
    pub visibility: u32,
    pub origin: Origin,
    pub parameters: Vec<ParamDecl>,
    pub tmplparams: Vec<ParamDecl>,
    /// Declared return type name; empty means inferred.
    pub return_typename: String,
    pub body: Option<AtomBody>,
    pub instances: Instances,
    pub classinfo: ClassInfo,
    /// For a class boxing a builtin: the boxed kind.
    pub builtin_mapping: Option<ir::CType>,
    /// For a funcdef that lowers to a builtin intrinsic: its name.
    pub builtin_alias: Option<String>,
    /// For a vardef member: index of its slot within the object.
    pub field_index: u32,
    /// Member field types, resolved when the class is instantiated.
    /// Indexed by field index.
    pub field_types: Vec<Classdef>,
    /// Template parameter bindings of a remapped generic clone, consulted
    /// by type-name resolution before the atom tree.
    pub tmpl_bindings: Vec<(String, Classdef)>,
}

impl Atom {
    fn new(atomid: AtomId, kind: AtomKind, name: String, parent: AtomId) -> Self {
        Self {
            atomid,
            kind,
            name,
            parent,
            children: Vec::new(),
            category: Category {
                suggestible: true,
                ..Category::default()
            },
            visibility: 0,
            origin: Origin::default(),
            parameters: Vec::new(),
            tmplparams: Vec::new(),
            return_typename: String::new(),
            body: None,
            instances: Instances::default(),
            classinfo: ClassInfo::default(),
            builtin_mapping: None,
            builtin_alias: None,
            field_index: 0,
            field_types: Vec::new(),
            tmpl_bindings: Vec::new(),
        }
    }

    pub fn is_class(&self) -> bool {
        self.kind == AtomKind::Class
    }

    pub fn is_funcdef(&self) -> bool {
        self.kind == AtomKind::Funcdef
    }

    pub fn is_member_var(&self) -> bool {
        self.kind == AtomKind::Vardef
    }

    /// Whether the class declares any template parameters (and therefore
    /// must be cloned before instantiation).
    pub fn is_generic(&self) -> bool {
        !self.tmplparams.is_empty()
    }
}

/// Arena of all atoms, indexed by atom id. Slot 0 is reserved.
#[derive(Debug, Clone)]
pub struct AtomMap {
    atoms: Vec<Option<Atom>>,
    pub root: AtomId,
}

impl Default for AtomMap {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomMap {
    pub fn new() -> Self {
        let mut map = Self {
            atoms: vec![None],
            root: 0,
        };
        map.root = map.create(AtomKind::Namespace, "", 0);
        map
    }

    pub fn create(&mut self, kind: AtomKind, name: &str, parent: AtomId) -> AtomId {
        let atomid = self.atoms.len() as AtomId;
        self.atoms.push(Some(Atom::new(atomid, kind, name.to_owned(), parent)));
        if parent != 0 {
            if let Some(p) = self.get_mut(parent) {
                p.children.push(atomid);
            }
        }
        atomid
    }

    pub fn get(&self, atomid: AtomId) -> Option<&Atom> {
        self.atoms.get(atomid as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, atomid: AtomId) -> Option<&mut Atom> {
        self.atoms.get_mut(atomid as usize)?.as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Atom> {
        self.atoms.iter().filter_map(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.atoms.iter().filter(|a| a.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Direct children of `parent` named `name` (overload sets are the
    /// reason this returns more than one).
    pub fn find_children(&self, parent: AtomId, name: &str) -> Vec<AtomId> {
        let Some(parent) = self.get(parent) else {
            return Vec::new();
        };
        parent
            .children
            .iter()
            .copied()
            .filter(|&c| self.get(c).is_some_and(|a| a.name == name))
            .collect()
    }

    /// Resolve `name` starting at `scope` and walking outward through the
    /// parents. The nearest scope with at least one match wins.
    pub fn lookup(&self, scope: AtomId, name: &str) -> Vec<AtomId> {
        let mut current = scope;
        while current != 0 {
            let found = self.find_children(current, name);
            if !found.is_empty() {
                return found;
            }
            current = self.get(current).map_or(0, |a| a.parent);
        }
        Vec::new()
    }

    /// Names of all declarations visible from `scope`, for suggestions.
    pub fn visible_names(&self, scope: AtomId) -> Vec<&str> {
        let mut names = Vec::new();
        let mut current = scope;
        while current != 0 {
            if let Some(atom) = self.get(current) {
                for &child in &atom.children {
                    if let Some(c) = self.get(child) {
                        if c.category.suggestible {
                            names.push(c.name.as_str());
                        }
                    }
                }
                current = atom.parent;
            } else {
                break;
            }
        }
        names
    }

    /// Dotted path from the root, for symbols and diagnostics.
    pub fn full_name(&self, atomid: AtomId) -> String {
        let mut parts = Vec::new();
        let mut current = atomid;
        while current != 0 && current != self.root {
            match self.get(current) {
                Some(atom) => {
                    parts.push(atom.name.clone());
                    current = atom.parent;
                }
                None => break,
            }
        }
        parts.reverse();
        parts.join(".")
    }

    /// Builtin kind boxed by a class atom, if any. This is the hook the
    /// type comparison uses for implicit box/unbox conversions.
    pub fn boxed_kind(&self, atomid: AtomId) -> Option<ir::CType> {
        self.get(atomid)?.builtin_mapping
    }

    /// Object size in bytes of one instance of a class: one 64-bit slot
    /// per field plus the refcount header.
    pub fn class_size(&self, atomid: AtomId) -> u64 {
        let fields = self
            .get(atomid)
            .map_or(0, |a| a.classinfo.next_field_index as u64);
        config::EXTRA_OBJECT_SIZE + fields * 8
    }

    /// Resolved sequence of one instantiation.
    pub fn sequence(&self, atomid: AtomId, instanceid: InstanceId) -> Option<Rc<Sequence>> {
        self.get(atomid)?
            .instances
            .get(instanceid)?
            .sequence
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir::CType;

    #[test]
    fn atom_zero_is_invalid() {
        let map = AtomMap::new();
        assert!(map.get(0).is_none());
        assert!(map.get(map.root).is_some());
    }

    #[test]
    fn lookup_walks_outward() {
        let mut map = AtomMap::new();
        let ns = map.create(AtomKind::Namespace, "app", map.root);
        let f = map.create(AtomKind::Funcdef, "run", ns);
        let g = map.create(AtomKind::Funcdef, "helper", map.root);
        assert_eq!(map.lookup(f, "helper"), vec![g]);
        assert_eq!(map.lookup(f, "run"), vec![f]);
        assert!(map.lookup(f, "missing").is_empty());
    }

    #[test]
    fn overloads_resolve_to_the_whole_set() {
        let mut map = AtomMap::new();
        let a = map.create(AtomKind::Funcdef, "f", map.root);
        let b = map.create(AtomKind::Funcdef, "f", map.root);
        assert_eq!(map.lookup(map.root, "f"), vec![a, b]);
    }

    #[test]
    fn instance_cache_is_tri_state() {
        let mut instances = Instances::default();
        let sig = Signature::from_classdefs(&[Classdef::builtin(CType::I32)], &[]);
        assert_eq!(instances.find(&sig), InstanceLookup::Unknown);

        let id = instances.create(sig.clone());
        assert_eq!(instances.find(&sig), InstanceLookup::Found(id));
        // reserved but not finalized yet
        assert!(instances.get(id).unwrap().sequence.is_none());

        instances.update(id, Rc::new(Sequence::new()), Classdef::void(), "f".into());
        assert!(instances.get(id).unwrap().sequence.is_some());

        let bad = Signature::from_classdefs(&[Classdef::builtin(CType::F64)], &[]);
        instances.invalidate(&bad);
        assert_eq!(instances.find(&bad), InstanceLookup::Invalid);
        // the good entry is untouched
        assert_eq!(instances.find(&sig), InstanceLookup::Found(id));
    }

    #[test]
    fn class_size_includes_header() {
        let mut map = AtomMap::new();
        let class = map.create(AtomKind::Class, "Point", map.root);
        map.get_mut(class).unwrap().classinfo.next_field_index = 2;
        assert_eq!(map.class_size(class), 8 + 16);
    }
}
