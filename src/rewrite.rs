//! The rewrite framework: op-code-keyed local transformation rules, grouped into actions and
//! applied to fixed point.
//!
//! A rule declares the opcodes it watches and an `apply` that edits the IR through the function
//! container's mutation API only, so every invariant (phi at block head, branch at block tail,
//! unique definition) is preserved by construction. Within a pass every alive op is visited; when
//! a rule reports a change the op is revisited before the sweep moves on. A group that fails to
//! reach a fixed point within the configured pass cap abandons the function.

use crate::config::CONFIG;
use crate::error::LowLevelError;
use crate::funcdata::Funcdata;
use crate::log::*;
use crate::op::{OpFlags, OpId};
use crate::opcode::OpCode;
use crate::varnode::VarFlags;

/// A pattern-matched local transformation.
pub trait Rule {
    fn name(&self) -> &'static str;
    /// Opcodes whose ops this rule wants to see.
    fn op_list(&self) -> &'static [OpCode];
    /// Attempt the rewrite rooted at `op`. Returns whether anything changed.
    fn apply(&mut self, op: OpId, fd: &mut Funcdata) -> Result<bool, LowLevelError>;
}

/// An ordered collection of rules applied together.
pub struct Action {
    pub name: &'static str,
    rules: Vec<Box<dyn Rule>>,
}

impl Action {
    pub fn new(name: &'static str, rules: Vec<Box<dyn Rule>>) -> Self {
        Self { name, rules }
    }
}

/// A named, ordered collection of actions applied to fixed point as a unit.
pub struct ActionGroup {
    pub name: &'static str,
    actions: Vec<Action>,
}

/// The registry of action groups.
pub struct ActionDatabase {
    groups: Vec<ActionGroup>,
}

impl Default for ActionDatabase {
    fn default() -> Self {
        Self::universal()
    }
}

impl ActionDatabase {
    /// The standard registry: the "default" group used by the main pipeline, and the lighter
    /// "jumptable" group used on partial clones during jump-table recovery.
    pub fn universal() -> Self {
        let default_group = ActionGroup {
            name: "default",
            actions: vec![Action::new(
                "cleanup",
                vec![
                    Box::new(RuleFoldConstants),
                    Box::new(RuleIdentity),
                    Box::new(RuleDoubleCopy),
                    Box::new(RuleTrivialPhi),
                    Box::new(RuleConcatZero),
                    Box::new(RuleLessEqual),
                    Box::new(RuleCollapseCoeff),
                    Box::new(RuleDistributeMult),
                    Box::new(RuleBoolNegateFlip),
                    Box::new(RuleLaneDivide),
                    Box::new(RuleReadOnlyFold),
                    Box::new(RuleJumpAssist),
                ],
            )],
        };
        let jumptable_group = ActionGroup {
            name: "jumptable",
            actions: vec![Action::new(
                "jumptable-cleanup",
                vec![
                    Box::new(RuleFoldConstants),
                    Box::new(RuleIdentity),
                    Box::new(RuleDoubleCopy),
                    Box::new(RuleTrivialPhi),
                    Box::new(RuleConcatZero),
                    Box::new(RuleLessEqual),
                    Box::new(RuleCollapseCoeff),
                ],
            )],
        };
        Self {
            groups: vec![default_group, jumptable_group],
        }
    }

    /// Apply a named group to fixed point. Returns the total number of rule firings.
    pub fn apply_group(&mut self, fd: &mut Funcdata, name: &str) -> Result<usize, LowLevelError> {
        let group = self
            .groups
            .iter_mut()
            .find(|g| g.name == name)
            .unwrap_or_else(|| panic!("unknown action group {:?}", name));
        let mut total = 0usize;
        for pass in 0..CONFIG.max_action_passes {
            let mut changed = 0usize;
            let snapshot: Vec<OpId> = fd.ops().alive_iter().collect();
            for op in snapshot {
                // A rule earlier in the sweep may have unlinked or destroyed this op
                if !fd.ops().is_live(op) || fd.ops().get(op).is_dead() {
                    continue;
                }
                let mut requeue = true;
                let mut visits = 0usize;
                while requeue {
                    requeue = false;
                    visits += 1;
                    if visits > CONFIG.max_rule_applications {
                        return Err(LowLevelError::ActionCapExceeded {
                            group: name.to_string(),
                            passes: pass,
                        });
                    }
                    for action in group.actions.iter_mut() {
                        for rule in action.rules.iter_mut() {
                            if !fd.ops().is_live(op) || fd.ops().get(op).is_dead() {
                                requeue = false;
                                break;
                            }
                            let opcode = fd.ops().get(op).opcode;
                            if !rule.op_list().contains(&opcode) {
                                continue;
                            }
                            if rule.apply(op, fd)? {
                                let seq = fd.ops().get(op).seq;
                                trace!("Rule fired"; "rule" => rule.name(), "op" => ?seq);
                                changed += 1;
                                total += 1;
                                requeue = true;
                            }
                        }
                        if !fd.ops().is_live(op) || fd.ops().get(op).is_dead() {
                            break;
                        }
                    }
                }
            }
            if changed == 0 {
                debug!("Action group reached fixed point"; "group" => name, "passes" => pass + 1, "firings" => total);
                return Ok(total);
            }
        }
        Err(LowLevelError::ActionCapExceeded {
            group: name.to_string(),
            passes: CONFIG.max_action_passes,
        })
    }
}

// ---------------------------------------------------------------------------
// Concrete rules
// ---------------------------------------------------------------------------

/// Evaluate ops whose inputs are all constant, replacing the op with a COPY of the result.
pub struct RuleFoldConstants;

impl Rule for RuleFoldConstants {
    fn name(&self) -> &'static str {
        "foldconstants"
    }

    fn op_list(&self) -> &'static [OpCode] {
        use OpCode::*;
        &[
            IntEqual, IntNotEqual, IntSLess, IntSLessEqual, IntLess, IntLessEqual, IntAdd,
            IntSub, IntCarry, IntSCarry, IntSBorrow, IntXor, IntAnd, IntOr, IntLeftShift,
            IntURightShift, IntSRightShift, IntMult, IntUDiv, IntSDiv, IntURem, IntSRem,
            BoolXor, BoolAnd, BoolOr, BoolNegate, IntZext, IntSext, IntTwosComp, IntOnesComp,
            Popcount, Copy,
        ]
    }

    fn apply(&mut self, op: OpId, fd: &mut Funcdata) -> Result<bool, LowLevelError> {
        let (opcode, out, nin) = {
            let o = fd.ops().get(op);
            (o.opcode, o.output(), o.num_inputs())
        };
        let Some(out) = out else { return Ok(false) };
        if opcode == OpCode::Copy {
            return Ok(false); // copies of constants are already minimal
        }
        if fd.ops().get(op).flags.contains(OpFlags::NOCOLLAPSE) {
            return Ok(false);
        }
        let out_size = fd.vars().get(out).size;
        let value = match nin {
            1 => {
                let a = fd.ops().get(op).input(0);
                let Some(a) = a else { return Ok(false) };
                let av = fd.vars().get(a);
                let Some(v) = av.constant_value() else {
                    return Ok(false);
                };
                opcode.evaluate_unary(out_size, av.size, v)
            }
            2 => {
                let (a, b) = {
                    let o = fd.ops().get(op);
                    (o.input(0), o.input(1))
                };
                let (Some(a), Some(b)) = (a, b) else {
                    return Ok(false);
                };
                let (Some(va), Some(vb)) = (
                    fd.vars().get(a).constant_value(),
                    fd.vars().get(b).constant_value(),
                ) else {
                    return Ok(false);
                };
                let size = fd.vars().get(a).size;
                opcode.evaluate_binary(size, va, vb)
            }
            _ => None,
        };
        let Some(value) = value else { return Ok(false) };
        fd.total_replace_constant(op, value);
        Ok(true)
    }
}

/// Algebraic identities: `x + 0`, `x * 1`, `x | 0`, `x ^ 0`, `x << 0`, `x & ~0` collapse to a
/// COPY of `x`; `x * 0` and `x & 0` collapse to the constant zero.
pub struct RuleIdentity;

impl Rule for RuleIdentity {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn op_list(&self) -> &'static [OpCode] {
        use OpCode::*;
        &[
            IntAdd, IntSub, IntMult, IntOr, IntXor, IntAnd, IntLeftShift, IntURightShift,
            IntSRightShift,
        ]
    }

    fn apply(&mut self, op: OpId, fd: &mut Funcdata) -> Result<bool, LowLevelError> {
        let (opcode, a, b, out) = {
            let o = fd.ops().get(op);
            (o.opcode, o.input(0), o.input(1), o.output())
        };
        let (Some(a), Some(b), Some(out)) = (a, b, out) else {
            return Ok(false);
        };
        // Normalize: the constant operand of a commutative form sits on the right
        let (x, c, cval) = if let Some(v) = fd.vars().get(b).constant_value() {
            (a, b, v)
        } else if opcode.is_commutative() {
            match fd.vars().get(a).constant_value() {
                Some(v) => (b, a, v),
                None => return Ok(false),
            }
        } else {
            return Ok(false);
        };
        let _ = c;
        let size = fd.vars().get(out).size;
        let full = OpCode::calc_mask(size);
        use OpCode::*;
        enum Outcome {
            PassThrough,
            Zero,
        }
        let outcome = match (opcode, cval) {
            (IntAdd | IntSub | IntOr | IntXor, 0) => Outcome::PassThrough,
            (IntLeftShift | IntURightShift | IntSRightShift, 0) => Outcome::PassThrough,
            (IntMult, 1) => Outcome::PassThrough,
            (IntAnd, v) if v == full => Outcome::PassThrough,
            (IntMult | IntAnd, 0) => Outcome::Zero,
            _ => return Ok(false),
        };
        // Subtraction and shifts are not commutative: the constant must be on the right
        if matches!(opcode, IntSub | IntLeftShift | IntURightShift | IntSRightShift)
            && fd.ops().get(op).input(1).map(|vn| fd.vars().get(vn).is_constant()) != Some(true)
        {
            return Ok(false);
        }
        match outcome {
            Outcome::PassThrough => {
                fd.op_remove_input(op, 1);
                fd.op_set_input(op, Some(x), 0);
                fd.op_set_opcode(op, Copy);
            }
            Outcome::Zero => {
                fd.total_replace_constant(op, 0);
            }
        }
        Ok(true)
    }
}

/// A COPY whose input is itself the output of a COPY of the same size reads through to the
/// original cell.
pub struct RuleDoubleCopy;

impl Rule for RuleDoubleCopy {
    fn name(&self) -> &'static str {
        "doublecopy"
    }

    fn op_list(&self) -> &'static [OpCode] {
        &[OpCode::Copy]
    }

    fn apply(&mut self, op: OpId, fd: &mut Funcdata) -> Result<bool, LowLevelError> {
        let a = match fd.ops().get(op).input(0) {
            Some(a) => a,
            None => return Ok(false),
        };
        let Some(def) = fd.vars().get(a).def() else {
            return Ok(false);
        };
        if fd.ops().get(def).opcode != OpCode::Copy {
            return Ok(false);
        }
        let Some(orig) = fd.ops().get(def).input(0) else {
            return Ok(false);
        };
        if fd.vars().get(orig).size != fd.vars().get(a).size {
            return Ok(false);
        }
        // Copies of volatile or address-forced storage must stay materialized
        if fd.vars().get(orig).flags.intersects(VarFlags::VOLATILE) {
            return Ok(false);
        }
        if orig == a {
            return Ok(false);
        }
        fd.op_set_input(op, Some(orig), 0);
        Ok(true)
    }
}

/// A phi with one input, or whose inputs are all the same cell, is a COPY.
pub struct RuleTrivialPhi;

impl Rule for RuleTrivialPhi {
    fn name(&self) -> &'static str {
        "trivialphi"
    }

    fn op_list(&self) -> &'static [OpCode] {
        &[OpCode::Phi]
    }

    fn apply(&mut self, op: OpId, fd: &mut Funcdata) -> Result<bool, LowLevelError> {
        let inputs: Vec<_> = {
            let o = fd.ops().get(op);
            (0..o.num_inputs()).filter_map(|i| o.input(i)).collect()
        };
        if inputs.is_empty() || fd.ops().get(op).num_inputs() != inputs.len() {
            return Ok(false); // unfilled slots: heritage is not done with it
        }
        let first = inputs[0];
        let out = fd.ops().get(op).output();
        if inputs.iter().any(|&i| i != first) || Some(first) == out {
            return Ok(false);
        }
        while fd.ops().get(op).num_inputs() > 1 {
            let last = fd.ops().get(op).num_inputs() - 1;
            fd.op_remove_input(op, last);
        }
        fd.op_set_opcode(op, OpCode::Copy);
        Ok(true)
    }
}

/// `piece(V, 0)` becomes `zext(V) << k` where `k` is the bit-width of the zero operand.
pub struct RuleConcatZero;

impl Rule for RuleConcatZero {
    fn name(&self) -> &'static str {
        "concatzero"
    }

    fn op_list(&self) -> &'static [OpCode] {
        &[OpCode::Piece]
    }

    fn apply(&mut self, op: OpId, fd: &mut Funcdata) -> Result<bool, LowLevelError> {
        let (hi, lo, out) = {
            let o = fd.ops().get(op);
            (o.input(0), o.input(1), o.output())
        };
        let (Some(hi), Some(lo), Some(out)) = (hi, lo, out) else {
            return Ok(false);
        };
        if fd.vars().get(lo).constant_value() != Some(0) {
            return Ok(false);
        }
        let out_size = fd.vars().get(out).size;
        let shift_bits = fd.vars().get(lo).size * 8;
        let addr = fd.ops().get(op).seq.addr;

        // u = zext(hi), placed immediately before the original op
        let zext = fd.new_op(OpCode::IntZext, addr, 1);
        let u = fd.new_unique_out(zext, out_size);
        fd.op_set_input(zext, Some(hi), 0);
        fd.op_insert_before(zext, op);

        // original op becomes u << shift_bits
        fd.op_set_input(op, Some(u), 0);
        let k = fd.new_constant(shift_bits as u64, 4);
        fd.op_set_input(op, Some(k), 1);
        fd.op_set_opcode(op, OpCode::IntLeftShift);
        let _ = u;
        Ok(true)
    }
}

/// `x <= c` becomes `x < c + 1` (and `c <= x` becomes `c - 1 < x`), skipped when the increment
/// would wrap past the extreme value for the comparison's signedness.
pub struct RuleLessEqual;

impl Rule for RuleLessEqual {
    fn name(&self) -> &'static str {
        "lessequal"
    }

    fn op_list(&self) -> &'static [OpCode] {
        &[OpCode::IntLessEqual, OpCode::IntSLessEqual]
    }

    fn apply(&mut self, op: OpId, fd: &mut Funcdata) -> Result<bool, LowLevelError> {
        let (opcode, a, b) = {
            let o = fd.ops().get(op);
            (o.opcode, o.input(0), o.input(1))
        };
        let (Some(a), Some(b)) = (a, b) else {
            return Ok(false);
        };
        let signed = opcode == OpCode::IntSLessEqual;
        let strict = if signed {
            OpCode::IntSLess
        } else {
            OpCode::IntLess
        };
        let size = fd.vars().get(a).size.max(fd.vars().get(b).size);
        let mask = OpCode::calc_mask(size);
        let smax = mask >> 1;

        if let Some(c) = fd.vars().get(b).constant_value() {
            // x <= c  =>  x < c+1, unless c is already the maximum
            let at_extreme = if signed { c == smax } else { c == mask };
            if at_extreme {
                return Ok(false);
            }
            let k = fd.new_constant((c + 1) & mask, fd.vars().get(b).size);
            fd.op_set_input(op, Some(k), 1);
            fd.op_set_opcode(op, strict);
            return Ok(true);
        }
        if let Some(c) = fd.vars().get(a).constant_value() {
            // c <= x  =>  c-1 < x, unless c is already the minimum
            let at_extreme = if signed { c == smax + 1 } else { c == 0 };
            if at_extreme {
                return Ok(false);
            }
            let k = fd.new_constant(c.wrapping_sub(1) & mask, fd.vars().get(a).size);
            fd.op_set_input(op, Some(k), 0);
            fd.op_set_opcode(op, strict);
            return Ok(true);
        }
        Ok(false)
    }
}

/// `(c * x) * k` with two constant coefficients collapses to `(c*k) * x`.
pub struct RuleCollapseCoeff;

impl Rule for RuleCollapseCoeff {
    fn name(&self) -> &'static str {
        "collapsecoeff"
    }

    fn op_list(&self) -> &'static [OpCode] {
        &[OpCode::IntMult]
    }

    fn apply(&mut self, op: OpId, fd: &mut Funcdata) -> Result<bool, LowLevelError> {
        let (a, b, out) = {
            let o = fd.ops().get(op);
            (o.input(0), o.input(1), o.output())
        };
        let (Some(a), Some(b), Some(out)) = (a, b, out) else {
            return Ok(false);
        };
        // Normalize constant to slot 1
        let (inner_vn, k) = if let Some(k) = fd.vars().get(b).constant_value() {
            (a, k)
        } else if let Some(k) = fd.vars().get(a).constant_value() {
            (b, k)
        } else {
            return Ok(false);
        };
        let Some(inner) = fd.vars().get(inner_vn).def() else {
            return Ok(false);
        };
        if fd.ops().get(inner).opcode != OpCode::IntMult {
            return Ok(false);
        }
        let (ia, ib) = {
            let o = fd.ops().get(inner);
            (o.input(0), o.input(1))
        };
        let (Some(ia), Some(ib)) = (ia, ib) else {
            return Ok(false);
        };
        let (x, c) = if let Some(c) = fd.vars().get(ib).constant_value() {
            (ia, c)
        } else if let Some(c) = fd.vars().get(ia).constant_value() {
            (ib, c)
        } else {
            return Ok(false);
        };
        let size = fd.vars().get(out).size;
        let coeff = c.wrapping_mul(k) & OpCode::calc_mask(size);
        let kc = fd.new_constant(coeff, size);
        fd.op_set_input(op, Some(x), 0);
        fd.op_set_input(op, Some(kc), 1);
        Ok(true)
    }
}

/// Distribute a constant multiplier across an addition whose terms are free or constant:
/// `(a + b) * k` becomes `a*k + b*k`. Applied only when the sum has no other reader.
pub struct RuleDistributeMult;

impl Rule for RuleDistributeMult {
    fn name(&self) -> &'static str {
        "distributemult"
    }

    fn op_list(&self) -> &'static [OpCode] {
        &[OpCode::IntMult]
    }

    fn apply(&mut self, op: OpId, fd: &mut Funcdata) -> Result<bool, LowLevelError> {
        let (a, b, out) = {
            let o = fd.ops().get(op);
            (o.input(0), o.input(1), o.output())
        };
        let (Some(a), Some(b), Some(out)) = (a, b, out) else {
            return Ok(false);
        };
        let (sum_vn, k) = if let Some(k) = fd.vars().get(b).constant_value() {
            (a, k)
        } else if let Some(k) = fd.vars().get(a).constant_value() {
            (b, k)
        } else {
            return Ok(false);
        };
        let Some(add) = fd.vars().get(sum_vn).def() else {
            return Ok(false);
        };
        if fd.ops().get(add).opcode != OpCode::IntAdd {
            return Ok(false);
        }
        if fd.vars().get(sum_vn).lone_use() != Some(op) {
            return Ok(false);
        }
        let (ta, tb) = {
            let o = fd.ops().get(add);
            (o.input(0), o.input(1))
        };
        let (Some(ta), Some(tb)) = (ta, tb) else {
            return Ok(false);
        };
        let term_ok = |fd: &Funcdata, vn: crate::varnode::VarnodeId| {
            let v = fd.vars().get(vn);
            v.is_constant() || v.is_free() || v.is_input() || v.is_written()
        };
        if !term_ok(fd, ta) || !term_ok(fd, tb) {
            return Ok(false);
        }
        let size = fd.vars().get(out).size;
        let addr = fd.ops().get(op).seq.addr;

        let mut make_scaled = |fd: &mut Funcdata, term| {
            let m = fd.new_op(OpCode::IntMult, addr, 2);
            let mo = fd.new_unique_out(m, size);
            fd.op_set_input(m, Some(term), 0);
            let kc = fd.new_constant(k, size);
            fd.op_set_input(m, Some(kc), 1);
            fd.op_insert_before(m, op);
            mo
        };
        let sa = make_scaled(fd, ta);
        let sb = make_scaled(fd, tb);
        fd.op_set_input(op, Some(sa), 0);
        fd.op_set_input(op, Some(sb), 1);
        fd.op_set_opcode(op, OpCode::IntAdd);
        Ok(true)
    }
}

/// A conditional branch testing the output of BOOL_NEGATE drops the negation and flips the
/// branch's printed sense instead.
pub struct RuleBoolNegateFlip;

impl Rule for RuleBoolNegateFlip {
    fn name(&self) -> &'static str {
        "boolnegateflip"
    }

    fn op_list(&self) -> &'static [OpCode] {
        &[OpCode::CBranch]
    }

    fn apply(&mut self, op: OpId, fd: &mut Funcdata) -> Result<bool, LowLevelError> {
        let cond = match fd.ops().get(op).input(1) {
            Some(c) => c,
            None => return Ok(false),
        };
        let Some(neg) = fd.vars().get(cond).def() else {
            return Ok(false);
        };
        if fd.ops().get(neg).opcode != OpCode::BoolNegate {
            return Ok(false);
        }
        if fd.vars().get(cond).lone_use() != Some(op) {
            return Ok(false);
        }
        let Some(orig) = fd.ops().get(neg).input(0) else {
            return Ok(false);
        };
        fd.op_set_input(op, Some(orig), 1);
        let flags = &mut fd.ops_mut().get_mut(op).flags;
        flags.toggle(OpFlags::BOOLEAN_FLIP);
        Ok(true)
    }
}

/// Split a lane extraction through a laned register: a SUBPIECE pulling exactly one admissible
/// lane out of a PIECE-assembled wide cell reads the matching half directly. The laned-register
/// registry decides whether the width is splittable at that storage.
pub struct RuleLaneDivide;

impl Rule for RuleLaneDivide {
    fn name(&self) -> &'static str {
        "lanedivide"
    }

    fn op_list(&self) -> &'static [OpCode] {
        &[OpCode::SubPiece]
    }

    fn apply(&mut self, op: OpId, fd: &mut Funcdata) -> Result<bool, LowLevelError> {
        let (w, trunc, out) = {
            let o = fd.ops().get(op);
            (o.input(0), o.input(1), o.output())
        };
        let (Some(w), Some(trunc), Some(out)) = (w, trunc, out) else {
            return Ok(false);
        };
        let Some(c) = fd.vars().get(trunc).constant_value() else {
            return Ok(false);
        };
        let (w_addr, w_size) = {
            let v = fd.vars().get(w);
            (v.addr, v.size)
        };
        let lane_width = fd.vars().get(out).size;
        let admissible = fd
            .arch()
            .lanes
            .get_lane_description(w_addr, w_size)
            .map_or(false, |d| d.allows(lane_width));
        if !admissible {
            return Ok(false);
        }
        let Some(def) = fd.vars().get(w).def() else {
            return Ok(false);
        };
        if fd.ops().get(def).opcode != OpCode::Piece {
            return Ok(false);
        }
        let (hi, lo) = {
            let d = fd.ops().get(def);
            (d.input(0), d.input(1))
        };
        let (Some(hi), Some(lo)) = (hi, lo) else {
            return Ok(false);
        };
        let lo_size = fd.vars().get(lo).size;
        let half = if c == 0 && lane_width == lo_size {
            lo
        } else if c == lo_size as u64 && lane_width == fd.vars().get(hi).size {
            hi
        } else {
            return Ok(false);
        };
        fd.op_remove_input(op, 1);
        fd.op_set_input(op, Some(half), 0);
        fd.op_set_opcode(op, OpCode::Copy);
        Ok(true)
    }
}

/// Recognize compiler jump-assist instruction forms around an indirect branch by matching the
/// architecture's byte patterns against the branch's instruction window, and mark the op for
/// special propagation so table recovery knows a helper form is present.
pub struct RuleJumpAssist;

impl Rule for RuleJumpAssist {
    fn name(&self) -> &'static str {
        "jumpassist"
    }

    fn op_list(&self) -> &'static [OpCode] {
        &[OpCode::BranchInd]
    }

    fn apply(&mut self, op: OpId, fd: &mut Funcdata) -> Result<bool, LowLevelError> {
        if fd.ops().get(op).flags.contains(OpFlags::SPECIAL_PROP) {
            return Ok(false);
        }
        if fd.arch().jump_assist.is_empty() {
            return Ok(false);
        }
        let addr = fd.ops().get(op).seq.addr;
        let mut window = [0u8; 16];
        if fd.arch().loader.load_fill(&mut window, addr).is_err() {
            return Ok(false);
        }
        let hit = fd
            .arch()
            .jump_assist
            .iter()
            .any(|p| p.is_match(&window));
        if !hit {
            return Ok(false);
        }
        debug!("Jump-assist form recognized"; "addr" => ?addr);
        fd.ops_mut().get_mut(op).flags |= OpFlags::SPECIAL_PROP;
        Ok(true)
    }
}

/// Fold a LOAD through a constant pointer into read-only memory down to the constant it reads.
/// When the loader has no bytes for the address, the read-only attribute is cleared and the fold
/// abandoned.
pub struct RuleReadOnlyFold;

impl Rule for RuleReadOnlyFold {
    fn name(&self) -> &'static str {
        "readonlyfold"
    }

    fn op_list(&self) -> &'static [OpCode] {
        &[OpCode::Load]
    }

    fn apply(&mut self, op: OpId, fd: &mut Funcdata) -> Result<bool, LowLevelError> {
        let (space_const, ptr, out) = {
            let o = fd.ops().get(op);
            (o.input(0), o.input(1), o.output())
        };
        let (Some(space_const), Some(ptr), Some(out)) = (space_const, ptr, out) else {
            return Ok(false);
        };
        let Some(space_idx) = fd.vars().get(space_const).constant_value() else {
            return Ok(false);
        };
        let Some(offset) = fd.vars().get(ptr).constant_value() else {
            return Ok(false);
        };
        let space = crate::address::SpaceId(space_idx as usize);
        let target = crate::address::Address::new(space, offset);
        let size = fd.vars().get(out).size;
        if !fd.arch().is_readonly(target, size) {
            return Ok(false);
        }
        if !fd.heritage_allows_fold(target, size) {
            return Ok(false);
        }
        let mut buf = vec![0u8; size as usize];
        match fd.arch().loader.load_fill(&mut buf, target) {
            Ok(()) => {
                let mut value = 0u64;
                for (i, &byte) in buf.iter().enumerate().take(8) {
                    value |= (byte as u64) << (8 * i);
                }
                fd.total_replace_constant(op, value);
                Ok(true)
            }
            Err(e) => {
                warn!("Read-only fold abandoned"; "addr" => ?target, "err" => %e);
                fd.arch().clear_readonly(target, size);
                fd.warning(format!("read-only data not available: {}", e), Some(target));
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn universal_database_has_both_groups() {
        let db = ActionDatabase::universal();
        let names: Vec<&str> = db.groups.iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["default", "jumptable"]);
    }
}
