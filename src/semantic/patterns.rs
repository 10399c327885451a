//! The pattern grammar: an ordered table of chain matchers.
//!
//! Each matcher looks at the interpreted steps of one chain and either
//! claims it, returning the operation and a confidence, or passes. The first
//! matcher to claim a chain decides its classification; chains nobody
//! claims are `Unknown`.

use std::collections::BTreeSet;

use super::chain::{def_before, origin, Step, TableBase, TableRead};
use super::state::AbstractValue;
use super::tables::{self, TableOp};
use super::{AnalysisParams, CallTarget, Confidence, OpKind, Relation};
use crate::image::{Image, Relocations};
use crate::{Address, Operand, Reg};

/// Everything a matcher may look at.
pub struct MatchContext<'a> {
    pub steps: &'a [Step],
    pub image: &'a Image,
    pub relocations: &'a Relocations,
    pub params: &'a AnalysisParams,
}

pub type Matcher = fn(&MatchContext<'_>) -> Option<(OpKind, Confidence)>;

pub struct Pattern {
    pub name: &'static str,
    pub matcher: Matcher,
}

/// Matchers in priority order.
pub static GRAMMAR: &[Pattern] = &[
    Pattern { name: "dispatch", matcher: dispatch },
    Pattern { name: "call", matcher: call },
    Pattern { name: "table_alu", matcher: table_alu },
    Pattern { name: "alias_equality", matcher: alias_equality },
    Pattern { name: "plain_move", matcher: plain_move },
];

/// Run the grammar over a chain.
pub fn classify(ctx: &MatchContext<'_>) -> (OpKind, Confidence) {
    for pattern in GRAMMAR {
        if let Some(found) = (pattern.matcher)(ctx) {
            log::trace!("Matched {}", pattern.name);
            return found;
        }
    }
    (OpKind::Unknown, Confidence::None)
}

/// The chain's closing transfer and where its target comes from: the table
/// read feeding it (if any) and the abstract target value.
pub(crate) struct TransferSource {
    pub call: bool,
    pub via: Operand,
    pub read: Option<TableRead>,
    pub value: AbstractValue,
    /// Step that loaded the target register
    pub def: Option<usize>,
}

pub(crate) fn transfer_source(steps: &[Step]) -> Option<TransferSource> {
    let n = steps.len();
    let Some(Step::Transfer { call, via, read, value }) = steps.last() else {
        return None;
    };
    let mut source = TransferSource {
        call: *call,
        via: *via,
        read: *read,
        value: *value,
        def: None,
    };
    if let Operand::Reg(r) = via {
        if let Some(i) = def_before(steps, *r, n - 1) {
            source.def = Some(i);
            if let Step::Lookup { read, .. } = &steps[i] {
                source.read = Some(*read);
            }
        }
    }
    Some(source)
}

fn dispatch(ctx: &MatchContext<'_>) -> Option<(OpKind, Confidence)> {
    let src = transfer_source(ctx.steps).filter(|s| !s.call)?;

    let Some(read) = src.read else {
        let target = src.value.concrete()? as Address;
        return Some((
            OpKind::IndirectBranch {
                table: None,
                index: None,
                targets: vec![target],
            },
            Confidence::Exact,
        ));
    };

    let TableBase::Fixed(table) = read.table else {
        return None;
    };
    if read.width != 4 {
        return None;
    }

    match read.index_value {
        AbstractValue::Concrete(_) => {
            let target = src.value.concrete()? as Address;
            Some((
                OpKind::IndirectBranch {
                    table: Some(table),
                    index: Some(read.index),
                    targets: vec![target],
                },
                Confidence::Exact,
            ))
        }
        v if v.is_bool() => {
            let false_target = ctx.image.read_u32(table)? as Address;
            let true_target = ctx.image.read_u32(table + read.scale as Address)? as Address;
            Some((
                OpKind::ConditionalBranch {
                    table,
                    index: read.index,
                    true_target,
                    false_target,
                },
                Confidence::Exact,
            ))
        }
        _ => {
            if read.scale != 4 {
                return None;
            }
            let targets = tables::dispatch_entries(ctx.image, table, ctx.params.max_table_entries);
            let kind = match targets.len() {
                0 => return None,
                2 => OpKind::ConditionalBranch {
                    table,
                    index: read.index,
                    true_target: targets[1],
                    false_target: targets[0],
                },
                _ => OpKind::IndirectBranch {
                    table: Some(table),
                    index: Some(read.index),
                    targets,
                },
            };
            Some((kind, Confidence::Heuristic))
        }
    }
}

fn call(ctx: &MatchContext<'_>) -> Option<(OpKind, Confidence)> {
    let src = transfer_source(ctx.steps).filter(|s| s.call)?;

    let table = src.read.and_then(|r| match r.table {
        TableBase::Fixed(t) => Some(t),
        TableBase::Row(_) => None,
    });
    let slot = match (src.via, src.read) {
        (Operand::Mem(m), None) => m.absolute_address(),
        (_, Some(read)) => match (table, read.index_value) {
            (Some(t), AbstractValue::Concrete(i)) => Some(t + i as Address * read.scale as Address),
            _ => None,
        },
        // mov r, [slot]; call r
        (Operand::Reg(_), None) => match src.def.map(|i| &ctx.steps[i]) {
            Some(Step::Move { src: Operand::Mem(m), .. }) => m.absolute_address(),
            _ => None,
        },
        _ => None,
    };

    if let Some((slot, name)) = slot.and_then(|s| ctx.relocations.get(&s).map(|n| (s, n))) {
        let target = CallTarget::Import {
            slot,
            name: name.clone(),
        };
        return Some((OpKind::Call { target, table }, Confidence::Exact));
    }

    let (target, confidence) = match src.value.concrete().map(|t| t as Address) {
        Some(t) if ctx.image.is_executable(t) => (CallTarget::Code(t), Confidence::Exact),
        raw => (CallTarget::Unresolved(raw), Confidence::None),
    };
    Some((OpKind::Call { target, table }, confidence))
}

/// Where the result of a computation ends up: a trailing absolute store of
/// the result register, or the register itself when the chain ends at the
/// computing step.
fn result_destination(steps: &[Step], at: usize, result: Reg, used: &mut BTreeSet<usize>) -> Option<Operand> {
    let last = steps.len() - 1;
    if at == last {
        return Some(Operand::Reg(result));
    }
    match &steps[last] {
        Step::Move {
            dst: dst @ Operand::Mem(_),
            src: Operand::Reg(r),
            ..
        } if at + 1 == last && *r == result => {
            used.insert(last);
            Some(*dst)
        }
        _ => None,
    }
}

fn table_alu(ctx: &MatchContext<'_>) -> Option<(OpKind, Confidence)> {
    let steps = ctx.steps;
    let k = steps
        .iter()
        .rposition(|s| matches!(s, Step::Lookup { read: TableRead { table: TableBase::Row(_), .. }, .. }))?;
    let Step::Lookup { dst: result, read: second, .. } = &steps[k] else {
        return None;
    };
    let TableBase::Row(table) = second.table else {
        return None;
    };

    let j = def_before(steps, second.base?, k)?;
    let Step::Lookup { read: first, .. } = &steps[j] else {
        return None;
    };
    if first.table != TableBase::Fixed(table) {
        return None;
    }

    let mut used = BTreeSet::from([j, k]);
    let lhs = origin(steps, first.index, j, &mut used)?;
    let rhs = origin(steps, second.index, k, &mut used)?;
    let dst = result_destination(steps, k, *result, &mut used)?;
    if used.len() != steps.len() {
        return None;
    }

    let op = tables::identify(ctx.image, table, first.scale, second.scale, second.width, ctx.params.probe_width)?;
    let kind = match op {
        TableOp::Alu(op) => OpKind::Arithmetic {
            op,
            result: *result,
            dst,
            lhs,
            rhs,
            table,
        },
        TableOp::Cmp(relation) => OpKind::Compare {
            relation,
            result: *result,
            dst,
            lhs,
            rhs,
            table: Some(table),
        },
    };
    Some((kind, Confidence::Exact))
}

fn alias_equality(ctx: &MatchContext<'_>) -> Option<(OpKind, Confidence)> {
    let steps = ctx.steps;
    let k = steps.iter().rposition(|s| matches!(s, Step::IndirectLoad { .. }))?;
    let Step::IndirectLoad { dst: result, base: a, disp } = steps[k] else {
        return None;
    };
    if result.width() != 1 {
        return None;
    }

    let is_store = |s: &Step, value: u32| match *s {
        Step::IndirectStore {
            base,
            disp: d,
            size: 1,
            src: Operand::Imm(v),
        } if d == disp && v == value => Some(base),
        _ => None,
    };
    let s2 = steps[..k].iter().rposition(|s| is_store(s, 1).is_some())?;
    let b = is_store(&steps[s2], 1)?;
    let s1 = steps[..s2].iter().rposition(|s| is_store(s, 0) == Some(a))?;
    if a.full() == b.full() || def_before(steps, a, k) != def_before(steps, a, s1) {
        return None;
    }

    let mut used = BTreeSet::from([s1, s2, k]);
    let lhs = origin(steps, a, s1, &mut used)?;
    let rhs = origin(steps, b, s2, &mut used)?;
    let dst = result_destination(steps, k, result, &mut used)?;
    if used.len() != steps.len() {
        return None;
    }

    Some((
        OpKind::Compare {
            relation: Relation::Eq,
            result,
            dst,
            lhs,
            rhs,
            table: None,
        },
        Confidence::Exact,
    ))
}

fn plain_move(ctx: &MatchContext<'_>) -> Option<(OpKind, Confidence)> {
    ctx.steps
        .iter()
        .all(|s| matches!(s, Step::Move { .. }))
        .then_some((OpKind::PlainMove, Confidence::Exact))
}
