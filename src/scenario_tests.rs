//! End-to-end runs of the engine over small hand-assembled images.

use iced_x86::Register;
use rstest::rstest;

use crate::cfg::{Edge, EdgeKind, UnresolvedReason};
use crate::driver::{process_file, Options};
use crate::engine::Demov;
use crate::image::{Image, Relocations};
use crate::parser::{GoblinParser, Loader};
use crate::resub::{ResubOptions, ResubReport};
use crate::semantic::{decode_range, AluOp, CallTarget, Confidence, OpKind, Relation};
use crate::testutil::{self, Fixture, CODE, DATA};
use crate::{Address, MemRef, Operand};

const X: Address = DATA;
const Y: Address = DATA + 4;
const R: Address = DATA + 8;
const FLAG: Address = DATA + 0xc;
const SEL: Address = DATA + 0x40;
const CTBL: Address = DATA + 0x60;
const ADD_T: Address = DATA + 0x100;
const ROWS: Address = DATA + 0x200;
const SCRATCH: Address = DATA + 0x400;

fn engine(image: Image, relocations: Relocations, entry: Address) -> Demov {
    let mut de = Demov::init().unwrap();
    de.bind_segments(image).unwrap();
    de.bind_relocations(relocations).unwrap();
    de.bind_entry_point(entry).unwrap();
    de.parse_entry().unwrap();
    de.scan().unwrap();
    de.analyse().unwrap();
    de
}

fn resub_all(de: &mut Demov, opts: &ResubOptions) -> ResubReport {
    let mut total = ResubReport::default();
    for (start, end) in de.blocks() {
        total += de.resub(start, end - start, opts).unwrap();
    }
    total
}

fn mnemonics(de: &Demov, start: Address, end: Address) -> Vec<String> {
    let image = de.image().unwrap();
    decode_range(image, de.decoder(), start, end)
        .into_iter()
        .map(|i| i.mnemonic)
        .collect()
}

fn abs(addr: Address, size: u8) -> Operand {
    Operand::Mem(MemRef::absolute(addr, size))
}

/// `R = X + Y` through a two-level add table, then a dispatch on an
/// unknown flag through a two-entry table.
fn add_then_dispatch() -> (Fixture, Address, Address, Address) {
    let t1 = CODE + 0x100;
    let t2 = CODE + 0x200;
    let mut fx = Fixture::new();
    fx.table2(ADD_T, ROWS, 4, |a, b| a + b);
    fx.data_u32(SEL, t1 as u32);
    fx.data_u32(SEL + 4, t2 as u32);
    let len = fx.code(
        CODE,
        &[
            testutil::load(Register::EAX, X),
            testutil::load(Register::EDX, Y),
            testutil::lookup(Register::EAX, ADD_T, Register::EAX),
            testutil::row_lookup(Register::EAX, Register::EAX, Register::EDX),
            testutil::store(R, Register::EAX),
            testutil::load(Register::EAX, FLAG),
            testutil::lookup(Register::EAX, SEL, Register::EAX),
            testutil::jmp_reg(Register::EAX),
        ],
    );
    fx.code(t1, &[testutil::ret()]);
    fx.code(t2, &[testutil::ret()]);
    (fx, CODE + len as Address, t1, t2)
}

#[test]
fn test_direct_jump_makes_two_blocks() {
    let target = CODE + 0x40;
    let mut fx = Fixture::new();
    fx.code(CODE, &[testutil::mov_imm(Register::EAX, 1), testutil::jmp(target)]);
    fx.code(target, &[testutil::ret()]);

    let de = engine(fx.image(), Relocations::new(), CODE);
    let blocks = de.blocks();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[1], (target, target + 1));
    assert_eq!(de.cfg().successors(CODE), vec![Edge::resolved(EdgeKind::Branch, target)]);
    assert!(de.cfg().successors(target).is_empty());
}

#[test]
fn test_arithmetic_and_table_dispatch() {
    let (fx, end, t1, t2) = add_then_dispatch();
    let de = engine(fx.image(), Relocations::new(), CODE);

    let ops = &de.analysis()[&CODE].ops;
    assert_eq!(ops.len(), 2);
    assert_eq!(
        ops[0].kind,
        OpKind::Arithmetic {
            op: AluOp::Add,
            result: crate::Reg::Eax,
            dst: abs(R, 4),
            lhs: abs(X, 4),
            rhs: abs(Y, 4),
            table: ADD_T,
        }
    );
    assert_eq!(ops[0].confidence, Confidence::Exact);
    assert!(matches!(
        ops[1].kind,
        OpKind::ConditionalBranch { table: SEL, true_target, false_target, .. }
            if true_target == t2 && false_target == t1
    ));
    assert_eq!(ops[1].confidence, Confidence::Heuristic);
    assert_eq!(ops[1].end, end);

    let succs = de.cfg().successors(CODE);
    assert!(succs.contains(&Edge::resolved(EdgeKind::ResolvedIndirect, t1)));
    assert!(succs.contains(&Edge::resolved(EdgeKind::ResolvedIndirect, t2)));
    // both targets were scanned after being recovered
    assert_eq!(de.blocks().len(), 3);
    assert_eq!(de.symbols().get(SEL), Some(format!("jpt_{:x}", SEL).as_str()));
    assert_eq!(de.symbols().get(ADD_T), Some("alu_add"));
}

#[test]
fn test_resub_rewrites_and_is_idempotent() {
    let (fx, end, _, _) = add_then_dispatch();
    let mut de = engine(fx.image(), Relocations::new(), CODE);
    let original_len = de.image().unwrap().as_bytes().len();

    let report = resub_all(&mut de, &ResubOptions::default());
    assert_eq!(report.applied, 2);
    assert_eq!(report.skipped, 0);
    let mut expected = vec!["mov", "add", "mov"];
    expected.extend(["nop"; 10]);
    expected.extend(["mov", "jmp", "nop", "nop"]);
    assert_eq!(mnemonics(&de, CODE, end), expected);
    assert_eq!(de.image().unwrap().as_bytes().len(), original_len);

    let patched = de.image().unwrap().as_bytes().to_vec();
    let again = resub_all(&mut de, &ResubOptions::default());
    assert_eq!(again.applied, 0);
    assert_eq!(de.image().unwrap().as_bytes(), patched.as_slice());
    assert_eq!(de.stats().patches_applied, 2);
}

#[test]
fn test_oversized_rewrite_keeps_original_bytes() {
    // too far for a short jump: kept loads plus `jmp rel32` outgrow the chain
    let far = CODE + 0x800;
    let mut fx = Fixture::new();
    fx.code(
        CODE,
        &[
            testutil::mov_imm(Register::EAX, far as u32),
            testutil::mov_imm(Register::ECX, 1),
            testutil::jmp_reg(Register::EAX),
        ],
    );
    fx.code(far, &[testutil::ret()]);

    let mut de = engine(fx.image(), Relocations::new(), CODE);
    assert!(matches!(
        &de.analysis()[&CODE].ops[0].kind,
        OpKind::IndirectBranch { targets, .. } if targets == &vec![far]
    ));
    let before = de.image().unwrap().as_bytes().to_vec();

    let report = resub_all(&mut de, &ResubOptions::default());
    assert_eq!(
        report,
        ResubReport {
            bytes_patched: 0,
            applied: 0,
            skipped: 1,
        }
    );
    assert_eq!(de.image().unwrap().as_bytes(), before.as_slice());
    assert_eq!(de.stats().patches_skipped, 1);
}

#[test]
fn test_alias_compare_feeds_exact_branch() {
    let t2 = CODE + 0x200;
    let mut fx = Fixture::new();
    let len = fx.code(
        CODE,
        &[
            testutil::load(Register::EAX, X),
            testutil::load(Register::EDX, Y),
            testutil::store_byte_via(Register::EAX, SCRATCH, 0),
            testutil::store_byte_via(Register::EDX, SCRATCH, 1),
            testutil::load_byte_via(Register::AL, Register::EAX, SCRATCH),
            testutil::store8(FLAG, Register::AL),
            testutil::movzx8(Register::EAX, FLAG),
            testutil::lookup(Register::EAX, SEL, Register::EAX),
            testutil::jmp_reg(Register::EAX),
        ],
    );
    let fallthrough = CODE + len as Address;
    fx.code(fallthrough, &[testutil::ret()]);
    fx.code(t2, &[testutil::ret()]);
    fx.data_u32(SEL, fallthrough as u32);
    fx.data_u32(SEL + 4, t2 as u32);

    let mut de = engine(fx.image(), Relocations::new(), CODE);
    let ops = &de.analysis()[&CODE].ops;
    assert_eq!(ops.len(), 2);
    assert_eq!(
        ops[0].kind,
        OpKind::Compare {
            relation: Relation::Eq,
            result: crate::Reg::Al,
            dst: abs(FLAG, 1),
            lhs: abs(X, 4),
            rhs: abs(Y, 4),
            table: None,
        }
    );
    assert_eq!(
        ops[1].kind,
        OpKind::ConditionalBranch {
            table: SEL,
            index: crate::Reg::Eax,
            true_target: t2,
            false_target: fallthrough,
        }
    );
    assert_eq!(ops[1].confidence, Confidence::Exact);

    let report = resub_all(&mut de, &ResubOptions::default());
    assert_eq!(report.applied, 2);
    let code: Vec<String> = mnemonics(&de, CODE, fallthrough)
        .into_iter()
        .filter(|m| m != "nop")
        .collect();
    assert_eq!(code, vec!["mov", "cmp", "sete", "mov", "movzx", "test", "jne"]);
}

#[test]
fn test_call_outside_image_stays_unresolved() {
    let mut fx = Fixture::new();
    fx.data_u32(CTBL, 0xdead_0000);
    fx.code(
        CODE,
        &[
            testutil::mov_imm(Register::ECX, 0),
            testutil::lookup(Register::EAX, CTBL, Register::ECX),
            testutil::call_reg(Register::EAX),
            testutil::ret(),
        ],
    );
    let mut de = engine(fx.image(), Relocations::new(), CODE);
    let before = de.image().unwrap().as_bytes().to_vec();

    let call = de.analysis()[&CODE]
        .ops
        .iter()
        .find(|op| matches!(op.kind, OpKind::Call { .. }))
        .cloned()
        .unwrap();
    assert_eq!(
        call.kind,
        OpKind::Call {
            target: CallTarget::Unresolved(Some(0xdead_0000)),
            table: Some(CTBL),
        }
    );
    assert_eq!(call.confidence, Confidence::None);

    let unresolved: Vec<Edge> = de
        .cfg()
        .successors(CODE)
        .into_iter()
        .filter(|e| e.kind == EdgeKind::Call)
        .collect();
    assert_eq!(
        unresolved,
        vec![Edge::unresolved(EdgeKind::Call, Some(0xdead_0000), UnresolvedReason::OutOfBounds)]
    );
    let stats = de.stats();
    assert!(stats.unresolved_edges >= 1);
    assert_eq!(stats.ops.get("CALL"), Some(&1));
    assert_eq!(stats.unknown_ops, 1);
    assert_eq!(stats.recognised_ops, 0);

    let report = resub_all(
        &mut de,
        &ResubOptions {
            patch_calls: true,
        },
    );
    assert_eq!(report.applied, 0);
    assert_eq!(de.image().unwrap().as_bytes(), before.as_slice());
}

#[rstest]
#[case::without_flag(false, 0)]
#[case::with_flag(true, 1)]
fn test_call_patching(#[case] patch_calls: bool, #[case] applied: usize) {
    let func = CODE + 0x80;
    let mut fx = Fixture::new();
    fx.code(
        CODE,
        &[
            testutil::mov_imm(Register::EAX, func as u32),
            testutil::call_reg(Register::EAX),
            testutil::ret(),
        ],
    );
    fx.code(func, &[testutil::ret()]);

    let mut de = engine(fx.image(), Relocations::new(), CODE);
    assert!(de.cfg().successors(CODE).contains(&Edge::resolved(EdgeKind::Call, func)));
    assert!(de.cfg().is_block_start(func));
    assert_eq!(de.symbols().get(func), Some(format!("sub_{:x}", func).as_str()));

    let report = resub_all(&mut de, &ResubOptions { patch_calls });
    assert_eq!(report.applied, applied);
    if patch_calls {
        assert_eq!(mnemonics(&de, CODE, CODE + 5), vec!["call"]);
    }
}

#[test]
fn test_import_call_is_named() {
    let slot = DATA + 0x80;
    let mut fx = Fixture::new();
    fx.code(
        CODE,
        &[
            testutil::load(Register::EAX, slot),
            testutil::call_reg(Register::EAX),
            testutil::ret(),
        ],
    );
    let mut relocations = Relocations::new();
    relocations.insert(slot, "printf".to_string());

    let de = engine(fx.image(), relocations, CODE);
    let call = &de.analysis()[&CODE].ops[0];
    assert_eq!(
        call.kind,
        OpKind::Call {
            target: CallTarget::Import {
                slot,
                name: "printf".into()
            },
            table: None,
        }
    );
    assert_eq!(de.symbols().get(slot), Some("printf"));
    assert!(de.dump_calls().contains(&format!("\"0x{:08x}\"", slot)));
}

#[test]
fn test_unknown_chain_bytes_unchanged() {
    let mut fx = Fixture::new();
    fx.code(
        CODE,
        &[
            testutil::load(Register::EAX, X),
            testutil::load_via(Register::EDX, Register::EAX),
            testutil::store(R, Register::EDX),
            testutil::ret(),
        ],
    );
    let mut de = engine(fx.image(), Relocations::new(), CODE);
    assert!(de.analysis()[&CODE].ops.iter().all(|op| op.kind == OpKind::Unknown));
    assert_eq!(de.stats().unknown_ops, 1);

    let before = de.image().unwrap().as_bytes().to_vec();
    let report = resub_all(&mut de, &ResubOptions::default());
    assert_eq!(report, ResubReport::default());
    assert_eq!(de.image().unwrap().as_bytes(), before.as_slice());
}

#[test]
fn test_symbols_strictly_increasing() {
    let (fx, _, _, _) = add_then_dispatch();
    let de = engine(fx.image(), Relocations::new(), CODE);
    let addrs: Vec<Address> = de
        .dump_syms()
        .lines()
        .map(|l| Address::from_str_radix(&l[2..10], 16).unwrap())
        .collect();
    assert!(addrs.len() >= 3);
    assert!(addrs.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_analyse_is_idempotent() {
    let (fx, _, _, _) = add_then_dispatch();
    let mut de = engine(fx.image(), Relocations::new(), CODE);
    let flow = de.dump_flow();
    let syms = de.dump_syms();
    let stats = de.stats();

    de.analyse().unwrap();
    assert_eq!(de.dump_flow(), flow);
    assert_eq!(de.dump_syms(), syms);
    assert_eq!(de.stats(), stats);
}

#[test]
fn test_pipeline_is_deterministic() {
    let (fx, _, _, _) = add_then_dispatch();
    let elf = fx.elf();

    let run = || {
        let loaded = GoblinParser::new().load(elf.clone()).unwrap();
        let mut de = Demov::init().unwrap();
        de.bind_segments(loaded.image).unwrap();
        de.bind_relocations(loaded.relocations).unwrap();
        de.bind_entry_point(loaded.entry).unwrap();
        de.parse_entry().unwrap();
        de.scan().unwrap();
        de.analyse().unwrap();
        let flow = de.dump_flow();
        resub_all(&mut de, &ResubOptions::default());
        let syms = de.dump_syms();
        (flow, syms, de.into_image().unwrap().into_bytes())
    };

    let (flow1, syms1, bytes1) = run();
    let (flow2, syms2, bytes2) = run();
    assert_eq!(flow1, flow2);
    assert_eq!(syms1, syms2);
    assert_eq!(bytes1, bytes2);
    assert_ne!(bytes1, elf);
    assert_eq!(bytes1.len(), elf.len());
}

#[test]
fn test_driver_writes_outputs() {
    let (fx, _, _, _) = add_then_dispatch();
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    std::fs::write(&input, fx.elf()).unwrap();

    let opts = Options {
        inputs: vec![input.clone()],
        output: Some(dir.path().join("patched")),
        graph: Some(dir.path().join("cfg.dot")),
        idc: Some(dir.path().join("symbols.idc")),
        json: Some(dir.path().join("report.json")),
        ..Options::default()
    };
    process_file(&input, &opts).unwrap();

    let patched = std::fs::read(dir.path().join("patched")).unwrap();
    assert_eq!(patched.len(), fx.elf().len());
    let dot = std::fs::read_to_string(dir.path().join("cfg.dot")).unwrap();
    assert!(dot.starts_with("digraph flow {"));
    assert!(dot.contains("digraph calls {"));
    let idc = std::fs::read_to_string(dir.path().join("symbols.idc")).unwrap();
    assert!(idc.starts_with("#include <idc.idc>\n\nstatic main() {\n"));
    assert!(idc.contains(&format!("MakeName(0x{:x}, \"start\");", CODE)));
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("report.json")).unwrap()).unwrap();
    assert_eq!(json["stats"]["blocks"], 3);
    assert_eq!(json["blocks"][0]["edges"][0]["kind"], "resolved-indirect");
}
