mod ctype;
mod instr;
mod op;
mod sequence;
mod strings;

pub use ctype::{CType, Register};
pub use instr::{DecodeError, Instr, Instruction, Pragma};
pub use op::{BlueprintKind, Op, PragmaKind, QualifierKind};
pub use sequence::Sequence;
pub use strings::StringRefs;

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(instr: Instr) -> Instr {
        Instr::decode(&instr.encode(), 0).expect("decode")
    }

    #[test]
    fn instruction_is_four_words() {
        assert_eq!(core::mem::size_of::<Instruction>(), 16);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let samples = [
            Instr::Nop,
            Instr::StoreConstant {
                lvid: 3,
                value: u64::MAX - 1,
            },
            Instr::StoreText { lvid: 2, text: 7 },
            Instr::Store { lvid: 1, source: 9 },
            Instr::Add {
                lvid: 1,
                lhs: 2,
                rhs: 3,
            },
            Instr::Fdiv {
                lvid: 4,
                lhs: 5,
                rhs: 6,
            },
            Instr::Igte {
                lvid: 7,
                lhs: 8,
                rhs: 9,
            },
            Instr::Label { id: 42 },
            Instr::Jz { lvid: 3, label: 42 },
            Instr::Ret { lvid: 1 },
            Instr::Load {
                lvid: 2,
                ptr: 3,
                ctype: CType::U16,
            },
            Instr::StoreMem {
                ptr: 2,
                lvid: 3,
                ctype: CType::F64,
            },
            Instr::Allocate { lvid: 5, atomid: 12 },
            Instr::Unref {
                lvid: 5,
                atomid: 12,
                instanceid: 0,
            },
            Instr::Fieldset {
                lvid: 6,
                self_lvid: 2,
                index: 1,
            },
            Instr::Call {
                lvid: 4,
                func: 17,
                instanceid: 2,
            },
            Instr::Call {
                lvid: 4,
                func: 9,
                instanceid: u32::MAX,
            },
            Instr::Identify {
                lvid: 3,
                self_lvid: 0,
                name: 11,
            },
            Instr::Assign {
                lhs: 2,
                rhs: 3,
                dispose_lhs: true,
            },
            Instr::Follow {
                lvid: 4,
                follower: 5,
                symlink: false,
            },
            Instr::Blueprint {
                kind: BlueprintKind::Class,
                name: 3,
                lvid: 0,
            },
            Instr::Qualifiers {
                lvid: 2,
                qualifier: QualifierKind::Const,
                on: true,
            },
            Instr::Pragma(Pragma::BlueprintSize { size: 10 }),
            Instr::Pragma(Pragma::ShortCircuit { label: 3 }),
            Instr::Pragma(Pragma::Synthetic { lvid: 8 }),
            Instr::Scope,
            Instr::End,
        ];
        for sample in samples {
            assert_eq!(roundtrip(sample), sample, "roundtrip {sample:?}");
        }
    }

    #[test]
    fn storeconstant_keeps_all_64_bits() {
        for value in [0u64, 1, 0x8000_0000, u64::MAX, (i64::MIN as u64), 0xDEAD_BEEF_CAFE_BABE] {
            let got = roundtrip(Instr::StoreConstant { lvid: 1, value });
            assert_eq!(got, Instr::StoreConstant { lvid: 1, value });
        }
    }

    #[test]
    fn invalid_opcode_is_rejected() {
        let bad = Instruction {
            opcode: 0xFFFF,
            a: 0,
            b: 0,
            c: 0,
        };
        assert!(matches!(
            Instr::decode(&bad, 5),
            Err(DecodeError::InvalidOpcode { word: 0xFFFF, offset: 5 })
        ));
    }

    #[test]
    fn intern_deduplicates() {
        let mut seq = Sequence::new();
        let a = seq.intern("counter");
        let b = seq.intern("counter");
        let c = seq.intern("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(seq.text(a), "counter");
        assert_eq!(seq.text(0), "");
    }

    #[test]
    fn forward_label_scan() {
        let mut seq = Sequence::new();
        seq.emit(Instr::Label { id: 1 });
        let jz = seq.emit(Instr::Jz { lvid: 2, label: 2 });
        seq.emit(Instr::Nop);
        let target = seq.emit(Instr::Label { id: 2 });
        assert_eq!(seq.jump_to_label_forward(jz, 2), Some(target));
        assert_eq!(seq.jump_to_label_forward(jz, 9), None);
    }

    #[test]
    fn backward_label_scan() {
        let mut seq = Sequence::new();
        let top = seq.emit(Instr::Label { id: 1 });
        seq.emit(Instr::Nop);
        let jmp = seq.emit(Instr::Jmp { label: 1 });
        assert_eq!(seq.jump_to_label_backward(jmp, 1), Some(top));
        assert_eq!(seq.jump_to_label_backward(jmp, 3), None);
    }

    #[test]
    fn forward_scan_skips_nested_blueprints() {
        let mut seq = Sequence::new();
        let from = seq.emit(Instr::Label { id: 1 });
        seq.emit(Instr::Blueprint {
            kind: BlueprintKind::Funcdef,
            name: 0,
            lvid: 0,
        });
        seq.emit(Instr::Pragma(Pragma::BlueprintSize { size: 4 }));
        // a nested body may reuse label ids of its siblings
        seq.emit(Instr::Label { id: 5 });
        seq.emit(Instr::End);
        let outer = seq.emit(Instr::Label { id: 5 });
        assert_eq!(seq.jump_to_label_forward(from, 5), Some(outer));
    }

    #[test]
    fn skip_blueprint_jumps_to_next_sibling() {
        let mut seq = Sequence::new();
        let bp = seq.emit(Instr::Blueprint {
            kind: BlueprintKind::Class,
            name: 0,
            lvid: 0,
        });
        seq.emit(Instr::Pragma(Pragma::BlueprintSize { size: 3 }));
        seq.emit(Instr::End);
        let sibling = seq.emit(Instr::Nop);
        assert_eq!(seq.skip_blueprint(bp), Ok(sibling));
    }

    #[test]
    fn missing_blueprintsize_is_an_error() {
        let mut seq = Sequence::new();
        let bp = seq.emit(Instr::Blueprint {
            kind: BlueprintKind::Class,
            name: 0,
            lvid: 0,
        });
        seq.emit(Instr::Nop);
        assert!(matches!(
            seq.skip_blueprint(bp),
            Err(DecodeError::MissingBlueprintSize { .. })
        ));
    }

    #[test]
    fn lvid_rewrite_respects_threshold_and_nesting() {
        let mut seq = Sequence::new();
        seq.emit(Instr::Store { lvid: 5, source: 2 });
        seq.emit(Instr::Blueprint {
            kind: BlueprintKind::Funcdef,
            name: 0,
            lvid: 0,
        });
        seq.emit(Instr::Pragma(Pragma::BlueprintSize { size: 3 }));
        seq.emit(Instr::Store { lvid: 9, source: 9 });
        seq.emit(Instr::Store { lvid: 4, source: 3 });
        seq.emit(Instr::End);
        seq.emit(Instr::Store { lvid: 8, source: 8 });

        seq.increase_all_lvid(10, 2, 0);

        // above the threshold: bumped
        assert_eq!(seq.read(0), Ok(Instr::Store { lvid: 15, source: 2 }));
        // nested blueprint body: untouched
        assert_eq!(seq.read(3), Ok(Instr::Store { lvid: 9, source: 9 }));
        assert_eq!(seq.read(4), Ok(Instr::Store { lvid: 14, source: 13 }));
        // after the enclosing body's end: untouched
        assert_eq!(seq.read(6), Ok(Instr::Store { lvid: 8, source: 8 }));
    }

    #[test]
    fn unresolved_call_operand_is_a_register() {
        let mut unresolved = Instr::Call {
            lvid: 1,
            func: 7,
            instanceid: u32::MAX,
        };
        let mut seen = Vec::new();
        unresolved.for_each_lvid(|r| seen.push(*r));
        assert_eq!(seen, vec![1, 7]);

        let mut resolved = Instr::Call {
            lvid: 1,
            func: 7,
            instanceid: 0,
        };
        seen.clear();
        resolved.for_each_lvid(|r| seen.push(*r));
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn executable_check_rejects_compiler_opcodes() {
        let mut seq = Sequence::new();
        seq.emit(Instr::Stacksize { count: 4 });
        seq.emit(Instr::StoreConstant { lvid: 2, value: 1 });
        seq.emit(Instr::Ret { lvid: 2 });
        assert!(seq.is_executable());

        seq.emit(Instr::Identify {
            lvid: 3,
            self_lvid: 0,
            name: 1,
        });
        assert!(!seq.is_executable());
    }

    #[test]
    fn display_formats() {
        assert_eq!(
            Instr::StoreConstant { lvid: 3, value: 42 }.to_string(),
            "storeconstant r3, 42"
        );
        assert_eq!(
            Instr::Add {
                lvid: 1,
                lhs: 2,
                rhs: 3
            }
            .to_string(),
            "add r1, r2, r3"
        );
        assert_eq!(
            Instr::Call {
                lvid: 2,
                func: 5,
                instanceid: 1
            }
            .to_string(),
            "call r2, atom:5#1"
        );
        assert_eq!(
            Instr::Load {
                lvid: 1,
                ptr: 2,
                ctype: CType::U64
            }
            .to_string(),
            "load.__u64 r1, [r2]"
        );
    }
}
