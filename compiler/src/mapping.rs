//! First pass over a raw sequence: register every `blueprint` as an atom,
//! collect declared parameters and member variables, and leave the atom id
//! patched into each blueprint so the instantiation pass can find its way
//! back.
//!
//! The pass is linear and cheap; it never looks at body semantics. It is
//! also re-run on cloned subtrees when a generic class is re-mapped for a
//! fresh set of template parameters.

use std::rc::Rc;

use ir::{BlueprintKind, Instr, Pragma, Sequence};

use crate::atoms::{AtomId, AtomKind, AtomMap};
use crate::config;
use crate::report::{CResult, Failed, Level, Origin, Report};

struct Frame {
    atomid: AtomId,
    kind: BlueprintKind,
    /// Scope/End nesting inside the frame's own body.
    scope_depth: u32,
    /// Funcdef only: signature region ends at the bodystart pragma.
    in_body: bool,
}

pub struct MappingOptions {
    /// Atom under which top-level declarations are attached.
    pub parent: AtomId,
    /// First offset to map (used when re-mapping a cloned subtree).
    pub offset: u32,
}

impl Default for MappingOptions {
    fn default() -> Self {
        Self {
            parent: 0,
            offset: 0,
        }
    }
}

/// Map every declaration of `seq` into `atoms`, then freeze the sequence
/// and hand out the shared handle that the created atoms' bodies point to.
pub fn map_sequence(
    atoms: &mut AtomMap,
    report: &mut Report,
    mut seq: Sequence,
    options: MappingOptions,
) -> CResult<Rc<Sequence>> {
    let parent = if options.parent == 0 {
        atoms.root
    } else {
        options.parent
    };
    let mut stack: Vec<Frame> = Vec::new();
    let mut origin = Origin::default();
    // blueprint offset -> atomid, patched in before freezing
    let mut patches: Vec<(u32, Instr)> = Vec::new();

    let mut offset = options.offset;
    while offset < seq.len() {
        let instr = match seq.read(offset) {
            Ok(instr) => instr,
            Err(err) => {
                report.ice(format!("malformed sequence: {err}"));
                return Err(Failed);
            }
        };
        match instr {
            Instr::Debugfile { filename } => {
                origin.filename = seq.text(filename).to_owned();
            }
            Instr::Debugpos { line, offset: col } => {
                origin.line = line;
                origin.offset = col;
            }
            Instr::Scope => {
                if let Some(frame) = stack.last_mut() {
                    frame.scope_depth += 1;
                }
            }
            Instr::End => match stack.last_mut() {
                Some(frame) if frame.scope_depth > 0 => frame.scope_depth -= 1,
                Some(frame) => {
                    finish_atom(atoms, frame.atomid);
                    stack.pop();
                }
                None => {
                    report.ice(format!("unbalanced end at offset {offset}"));
                    return Err(Failed);
                }
            },
            Instr::Blueprint { kind, name, lvid } => {
                let text = seq.text(name).to_owned();
                match kind {
                    BlueprintKind::Param | BlueprintKind::TmplParam => {
                        map_param(atoms, report, &stack, kind, &text, lvid)?;
                    }
                    _ => {
                        let owner = stack.last().map_or(parent, |f| f.atomid);
                        let atomid = map_declaration(atoms, report, kind, &text, owner, &origin)?;
                        patches.push((
                            offset,
                            Instr::Blueprint {
                                kind,
                                name,
                                lvid: if kind == BlueprintKind::Vardef {
                                    lvid
                                } else {
                                    atomid
                                },
                            },
                        ));
                        stack.push(Frame {
                            atomid,
                            kind,
                            scope_depth: 0,
                            in_body: false,
                        });
                    }
                }
            }
            Instr::Pragma(pragma) => {
                map_pragma(atoms, &mut stack, pragma);
            }
            Instr::Identify {
                lvid,
                self_lvid: 0,
                name,
            } => {
                // in a signature or member region this declares a type name
                let typename = seq.text(name).to_owned();
                if let Some(frame) = stack.last() {
                    if !frame.in_body {
                        declare_typename(atoms, frame, lvid, &typename);
                    }
                }
            }
            _ => {}
        }
        offset += 1;
    }

    if let Some(frame) = stack.last() {
        let name = atoms.get(frame.atomid).map_or_else(String::new, |a| a.name.clone());
        report
            .ice(format!("declaration '{name}' never closed"))
            .origin(origin);
        return Err(Failed);
    }

    for (at, instr) in patches {
        seq.patch(at, instr);
    }
    let shared = Rc::new(seq);
    attach_bodies(atoms, &shared, options.offset);
    Ok(shared)
}

fn map_declaration(
    atoms: &mut AtomMap,
    report: &mut Report,
    kind: BlueprintKind,
    name: &str,
    parent: AtomId,
    origin: &Origin,
) -> CResult<AtomId> {
    let atomid = match kind {
        BlueprintKind::Namespace => {
            // namespaces are open: reuse an existing one with the same name
            let existing = atoms
                .find_children(parent, name)
                .into_iter()
                .find(|&id| atoms.get(id).is_some_and(|a| a.kind == AtomKind::Namespace));
            match existing {
                Some(id) => id,
                None => atoms.create(AtomKind::Namespace, name, parent),
            }
        }
        BlueprintKind::Class => atoms.create(AtomKind::Class, name, parent),
        BlueprintKind::Funcdef => {
            let id = atoms.create(AtomKind::Funcdef, name, parent);
            let atom = atoms.get_mut(id).ok_or(Failed)?;
            match name {
                config::NAME_DISPOSE => atom.category.dtor = true,
                config::NAME_CLONE => atom.category.clone = true,
                config::NAME_NEW | config::NAME_DEFAULT_NEW => atom.category.ctor = true,
                _ => {}
            }
            if name.starts_with('^') {
                atom.category.operator = true;
                atom.category.suggestible = false;
            }
            id
        }
        BlueprintKind::Vardef => {
            let id = atoms.create(AtomKind::Vardef, name, parent);
            // members get a slot in declaration order
            let is_member = atoms.get(parent).is_some_and(|a| a.is_class());
            if is_member {
                let index = {
                    let class = atoms.get_mut(parent).ok_or(Failed)?;
                    let index = class.classinfo.next_field_index;
                    class.classinfo.next_field_index += 1;
                    index
                };
                atoms.get_mut(id).ok_or(Failed)?.field_index = index;
            }
            id
        }
        BlueprintKind::Typealias => atoms.create(AtomKind::Typealias, name, parent),
        BlueprintKind::Unit => atoms.create(AtomKind::Unit, name, parent),
        BlueprintKind::Param | BlueprintKind::TmplParam => {
            report.ice("parameter blueprint outside a signature");
            return Err(Failed);
        }
    };
    if let Some(atom) = atoms.get_mut(atomid) {
        if atom.origin.filename.is_empty() {
            atom.origin = origin.clone();
        }
    }
    Ok(atomid)
}

fn map_param(
    atoms: &mut AtomMap,
    report: &mut Report,
    stack: &[Frame],
    kind: BlueprintKind,
    name: &str,
    lvid: u32,
) -> CResult<()> {
    let Some(frame) = stack.last() else {
        report.ice("parameter outside a declaration");
        return Err(Failed);
    };
    let owner = atoms.get_mut(frame.atomid).ok_or(Failed)?;
    let decl = crate::atoms::ParamDecl {
        name: name.to_owned(),
        lvid,
        typename: String::new(),
    };
    let list = if kind == BlueprintKind::Param {
        &mut owner.parameters
    } else {
        &mut owner.tmplparams
    };
    // slot 1 is the return value; a "parameter" there declares the
    // return type instead
    if kind == BlueprintKind::Param && lvid == config::LVID_RET {
        return Ok(());
    }
    if list.len() >= config::MAX_PARAMS {
        let name = owner.name.clone();
        report.error(format!(
            "too many parameters for '{name}' (limit {})",
            config::MAX_PARAMS
        ));
        return Err(Failed);
    }
    list.push(decl);
    Ok(())
}

fn map_pragma(atoms: &mut AtomMap, stack: &mut [Frame], pragma: Pragma) {
    let Some(frame) = stack.last_mut() else {
        return;
    };
    match pragma {
        Pragma::BodyStart => frame.in_body = true,
        Pragma::Visibility { level } => {
            if let Some(atom) = atoms.get_mut(frame.atomid) {
                atom.visibility = level;
            }
        }
        Pragma::Suggest { enabled } => {
            if let Some(atom) = atoms.get_mut(frame.atomid) {
                atom.category.suggestible = enabled;
            }
        }
        Pragma::Synthetic { .. } => {
            if let Some(atom) = atoms.get_mut(frame.atomid) {
                if atom.is_member_var() {
                    atom.category.captured = true;
                }
            }
        }
        Pragma::BuiltinAlias { .. } => {
            // resolved in map_builtin_alias, which needs the string table
        }
        _ => {}
    }
}

fn declare_typename(atoms: &mut AtomMap, frame: &Frame, lvid: u32, typename: &str) {
    let Some(atom) = atoms.get_mut(frame.atomid) else {
        return;
    };
    match frame.kind {
        BlueprintKind::Funcdef => {
            if lvid == config::LVID_RET {
                atom.return_typename = typename.to_owned();
                return;
            }
            for param in atom.parameters.iter_mut().chain(atom.tmplparams.iter_mut()) {
                if param.lvid == lvid {
                    param.typename = typename.to_owned();
                    return;
                }
            }
        }
        BlueprintKind::Vardef => {
            atom.return_typename = typename.to_owned();
        }
        _ => {}
    }
}

/// Second sweep: point every mapped atom at its blueprint offset in the
/// frozen sequence, and resolve builtin-alias pragmas now that the atom
/// ids are in place.
fn attach_bodies(atoms: &mut AtomMap, seq: &Rc<Sequence>, from: u32) {
    let mut stack: Vec<AtomId> = Vec::new();
    let mut depth = 0u32;
    for (offset, instr) in seq.iter_from(from) {
        match instr {
            Instr::Blueprint { kind, lvid, .. } => match kind {
                BlueprintKind::Param | BlueprintKind::TmplParam => {}
                // vardefs open a region too; keep the stack balanced
                BlueprintKind::Vardef => stack.push(0),
                _ => {
                    if let Some(atom) = atoms.get_mut(lvid) {
                        if atom.body.is_none() {
                            atom.body = Some(crate::atoms::AtomBody {
                                sequence: Rc::clone(seq),
                                offset,
                            });
                        }
                    }
                    stack.push(lvid);
                }
            },
            Instr::Scope => depth += 1,
            Instr::End => {
                if depth > 0 {
                    depth -= 1;
                } else {
                    stack.pop();
                }
            }
            Instr::Pragma(Pragma::BuiltinAlias { name }) => {
                if let Some(&atomid) = stack.last() {
                    let alias = seq.text(name).to_owned();
                    if let Some(atom) = atoms.get_mut(atomid) {
                        match atom.kind {
                            AtomKind::Class => {
                                atom.builtin_mapping = ir::CType::from_builtin_name(&alias);
                            }
                            AtomKind::Funcdef => atom.builtin_alias = Some(alias),
                            _ => {}
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

fn finish_atom(atoms: &mut AtomMap, atomid: AtomId) {
    let Some(atom) = atoms.get(atomid) else {
        return;
    };
    if atom.is_class() {
        // a class exposing a call operator is a functor (closure shell)
        let functor = atom
            .children
            .iter()
            .any(|&c| atoms.get(c).is_some_and(|a| a.is_funcdef() && a.name == "^()"));
        if let Some(atom) = atoms.get_mut(atomid) {
            atom.category.functor = functor;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::AtomKind;

    fn blueprint(seq: &mut Sequence, kind: BlueprintKind, name: &str, size: u32) {
        let name = seq.intern(name);
        seq.emit(Instr::Blueprint {
            kind,
            name,
            lvid: 0,
        });
        seq.emit(Instr::Pragma(Pragma::BlueprintSize { size }));
    }

    #[test]
    fn maps_nested_declarations() {
        let mut seq = Sequence::new();
        blueprint(&mut seq, BlueprintKind::Namespace, "app", 7);
        blueprint(&mut seq, BlueprintKind::Class, "Point", 4);
        blueprint(&mut seq, BlueprintKind::Funcdef, "length", 2);
        seq.emit(Instr::End); // length
        seq.emit(Instr::End); // Point
        seq.emit(Instr::End); // app

        let mut atoms = AtomMap::new();
        let mut report = Report::new();
        let shared =
            map_sequence(&mut atoms, &mut report, seq, MappingOptions::default()).expect("map");
        assert!(!report.has_errors());

        let app = atoms.lookup(atoms.root, "app");
        assert_eq!(app.len(), 1);
        let point = atoms.find_children(app[0], "Point");
        assert_eq!(point.len(), 1);
        let length = atoms.find_children(point[0], "length");
        assert_eq!(length.len(), 1);
        let atom = atoms.get(length[0]).unwrap();
        assert_eq!(atom.kind, AtomKind::Funcdef);
        let body = atom.body.as_ref().expect("body");
        assert!(Rc::ptr_eq(&body.sequence, &shared));
        assert_eq!(body.offset, 4);
    }

    #[test]
    fn namespaces_are_open() {
        let mut seq = Sequence::new();
        blueprint(&mut seq, BlueprintKind::Namespace, "app", 3);
        seq.emit(Instr::End);
        blueprint(&mut seq, BlueprintKind::Namespace, "app", 3);
        seq.emit(Instr::End);

        let mut atoms = AtomMap::new();
        let mut report = Report::new();
        map_sequence(&mut atoms, &mut report, seq, MappingOptions::default()).expect("map");
        assert_eq!(atoms.lookup(atoms.root, "app").len(), 1);
    }

    #[test]
    fn members_get_field_slots_in_order() {
        let mut seq = Sequence::new();
        blueprint(&mut seq, BlueprintKind::Class, "Pair", 8);
        blueprint(&mut seq, BlueprintKind::Vardef, "first", 2);
        seq.emit(Instr::End);
        blueprint(&mut seq, BlueprintKind::Vardef, "second", 2);
        seq.emit(Instr::End);
        seq.emit(Instr::End);

        let mut atoms = AtomMap::new();
        let mut report = Report::new();
        map_sequence(&mut atoms, &mut report, seq, MappingOptions::default()).expect("map");
        let pair = atoms.lookup(atoms.root, "Pair")[0];
        let first = atoms.find_children(pair, "first")[0];
        let second = atoms.find_children(pair, "second")[0];
        assert_eq!(atoms.get(first).unwrap().field_index, 0);
        assert_eq!(atoms.get(second).unwrap().field_index, 1);
        assert_eq!(atoms.get(pair).unwrap().classinfo.next_field_index, 2);
    }

    #[test]
    fn params_and_return_type_are_declared() {
        let mut seq = Sequence::new();
        blueprint(&mut seq, BlueprintKind::Funcdef, "mul", 9);
        let pname = seq.intern("x");
        seq.emit(Instr::Blueprint {
            kind: BlueprintKind::Param,
            name: pname,
            lvid: 2,
        });
        let tname = seq.intern("__i32");
        seq.emit(Instr::Identify {
            lvid: 2,
            self_lvid: 0,
            name: tname,
        });
        seq.emit(Instr::Identify {
            lvid: 1,
            self_lvid: 0,
            name: tname,
        });
        seq.emit(Instr::Pragma(Pragma::BodyStart));
        seq.emit(Instr::End);

        let mut atoms = AtomMap::new();
        let mut report = Report::new();
        map_sequence(&mut atoms, &mut report, seq, MappingOptions::default()).expect("map");
        let mul = atoms.lookup(atoms.root, "mul")[0];
        let atom = atoms.get(mul).unwrap();
        assert_eq!(atom.parameters.len(), 1);
        assert_eq!(atom.parameters[0].name, "x");
        assert_eq!(atom.parameters[0].typename, "__i32");
        assert_eq!(atom.return_typename, "__i32");
    }

    #[test]
    fn unbalanced_end_is_an_ice() {
        let mut seq = Sequence::new();
        seq.emit(Instr::End);
        let mut atoms = AtomMap::new();
        let mut report = Report::new();
        assert!(map_sequence(&mut atoms, &mut report, seq, MappingOptions::default()).is_err());
        assert!(report.has_errors());
    }
}
