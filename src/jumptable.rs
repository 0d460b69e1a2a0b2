//! Jump-table recovery: turning an indirect branch into an enumerated set of destinations.
//!
//! Recovery never simplifies the real function. A value-typed snapshot of the arenas (the partial
//! clone) is simplified with the dedicated "jumptable" action group, and the destination
//! extraction walks the simplified pointer expression in the clone. A table recovered without a
//! bounding comparison is left at stage 1 and reconsulted on the next outer pass; stage 2 carries
//! the final targets.

use crate::address::Address;
use crate::config::CONFIG;
use crate::address::Endian;
use crate::funcdata::Funcdata;
use crate::log::*;
use crate::op::OpId;
use crate::opcode::OpCode;
use crate::rewrite::ActionDatabase;
use crate::varnode::{VarFlags, VarnodeId};
use thiserror::Error;

/// The recovered destinations of one indirect branch.
#[derive(Clone, Debug)]
pub struct JumpTable {
    /// The indirect branch this table belongs to.
    pub op: OpId,
    /// Externally supplied destinations, taking precedence over extraction.
    pub override_targets: Option<Vec<Address>>,
    pub targets: Vec<Address>,
    /// Index into `targets` of the default destination, when one was resolved. Successors an
    /// override leaves unmapped become goto-out edges instead.
    pub default_index: Option<usize>,
    /// 0 = untried, 1 = partial (reconsulted next pass), 2 = complete.
    pub stage: u8,
    /// Table memory consulted during extraction, for alias guarding.
    pub loadpoints: Vec<(Address, u32)>,
}

impl JumpTable {
    pub fn new(op: OpId) -> Self {
        Self {
            op,
            override_targets: None,
            targets: Vec::new(),
            default_index: None,
            stage: 0,
            loadpoints: Vec::new(),
        }
    }
}

/// Why recovery did not produce a table. The numeric codes match the driver contract: 0 is
/// success, then in order below.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JumpTableError {
    /// Code 1: the pointer expression did not resolve to a table.
    #[error("jump table recovery failed")]
    Fail,
    /// Code 2: the branch target simplified to a single constant; this is a thunk, not a switch.
    #[error("indirect branch is likely a thunk")]
    Thunk,
    /// Code 3: the branch is unreachable in the simplified clone; treat it as dead code.
    #[error("indirect branch unreachable after simplification")]
    Unreachable,
}

impl JumpTableError {
    pub fn code(&self) -> u8 {
        match self {
            JumpTableError::Fail => 1,
            JumpTableError::Thunk => 2,
            JumpTableError::Unreachable => 3,
        }
    }
}

/// Follow COPY/CAST chains back to the originating cell.
fn strip_copies(fd: &Funcdata, mut vn: VarnodeId) -> VarnodeId {
    loop {
        let Some(def) = fd.vars().get(vn).def() else {
            return vn;
        };
        let d = fd.ops().get(def);
        if matches!(d.opcode, OpCode::Copy | OpCode::Cast) {
            if let Some(src) = d.input(0) {
                vn = src;
                continue;
            }
        }
        return vn;
    }
}

/// The early-fail check: scan backward from the branch through the ops of its block. A call,
/// store, or user-op that can clobber the storage feeding the branch makes the pointer expression
/// untrustworthy, and no partial function is built.
fn early_fail_check(fd: &Funcdata, branch: OpId) -> Result<(), JumpTableError> {
    let target = fd.ops().get(branch).input(0).ok_or(JumpTableError::Fail)?;
    let (t_addr, t_size, t_tied) = {
        let v = fd.vars().get(target);
        (v.addr, v.size, v.flags.contains(VarFlags::ADDRTIED))
    };
    let Some(block) = fd.ops().get(branch).parent() else {
        return Err(JumpTableError::Fail);
    };
    let order = fd.ops().get(branch).order();
    let ops = fd.blocks().get(block).ops();
    let lo = order.saturating_sub(CONFIG.jumptable_backtrack_ops);
    for &op in ops[lo..order].iter().rev() {
        let o = fd.ops().get(op);
        match o.opcode {
            OpCode::Call | OpCode::CallInd | OpCode::UserOp => {
                if let Some(out) = o.output() {
                    let v = fd.vars().get(out);
                    if v.addr.overlaps(v.size, &t_addr, t_size) {
                        debug!("Jump table early fail"; "clobber" => ?o.seq);
                        return Err(JumpTableError::Fail);
                    }
                }
            }
            OpCode::Store => {
                // A store can alias anything address-tied
                if t_tied {
                    debug!("Jump table early fail on store"; "branch" => ?fd.ops().get(branch).seq);
                    return Err(JumpTableError::Fail);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// The shape of the simplified pointer expression: a table base, an element size, and the index
/// cell being scaled.
struct TableExpr {
    base: u64,
    elem_size: u32,
    index: VarnodeId,
}

/// Match `load(space, base + index * elem)` (in any of its simplified spellings) rooted at the
/// branch's pointer input.
fn match_table_expr(fd: &Funcdata, branch: OpId) -> Result<TableExpr, JumpTableError> {
    let ptr0 = fd.ops().get(branch).input(0).ok_or(JumpTableError::Fail)?;
    let ptr = strip_copies(fd, ptr0);
    if fd.vars().get(ptr).is_constant() {
        return Err(JumpTableError::Thunk);
    }
    let def = fd.vars().get(ptr).def().ok_or(JumpTableError::Fail)?;
    let d = fd.ops().get(def);
    if d.opcode != OpCode::Load {
        return Err(JumpTableError::Fail);
    }
    let addr_expr = strip_copies(fd, d.input(1).ok_or(JumpTableError::Fail)?);

    // PTRADD carries the decomposition directly
    if let Some(padef) = fd.vars().get(addr_expr).def() {
        let pd = fd.ops().get(padef);
        if pd.opcode == OpCode::PtrAdd {
            let (b, i, e) = (pd.input(0), pd.input(1), pd.input(2));
            if let (Some(b), Some(i), Some(e)) = (b, i, e) {
                if let (Some(base), Some(elem)) = (
                    fd.vars().get(strip_copies(fd, b)).constant_value(),
                    fd.vars().get(e).constant_value(),
                ) {
                    return Ok(TableExpr {
                        base,
                        elem_size: elem as u32,
                        index: strip_copies(fd, i),
                    });
                }
            }
        }
        if pd.opcode == OpCode::IntAdd {
            let (a, b) = (pd.input(0), pd.input(1));
            let (Some(a), Some(b)) = (a, b) else {
                return Err(JumpTableError::Fail);
            };
            let (base_vn, scaled) = if fd.vars().get(a).is_constant() {
                (a, b)
            } else if fd.vars().get(b).is_constant() {
                (b, a)
            } else {
                return Err(JumpTableError::Fail);
            };
            let base = fd.vars().get(base_vn).constant_value().unwrap();
            let scaled = strip_copies(fd, scaled);
            let Some(sdef) = fd.vars().get(scaled).def() else {
                // Unscaled index: a table of single bytes
                return Ok(TableExpr {
                    base,
                    elem_size: 1,
                    index: scaled,
                });
            };
            let sd = fd.ops().get(sdef);
            match sd.opcode {
                OpCode::IntMult => {
                    let (x, y) = (sd.input(0), sd.input(1));
                    let (Some(x), Some(y)) = (x, y) else {
                        return Err(JumpTableError::Fail);
                    };
                    let (idx, elem) = if let Some(c) = fd.vars().get(y).constant_value() {
                        (x, c)
                    } else if let Some(c) = fd.vars().get(x).constant_value() {
                        (y, c)
                    } else {
                        return Err(JumpTableError::Fail);
                    };
                    Ok(TableExpr {
                        base,
                        elem_size: elem as u32,
                        index: strip_copies(fd, idx),
                    })
                }
                OpCode::IntLeftShift => {
                    let (x, y) = (sd.input(0), sd.input(1));
                    let (Some(x), Some(y)) = (x, y) else {
                        return Err(JumpTableError::Fail);
                    };
                    let shift = fd.vars().get(y).constant_value().ok_or(JumpTableError::Fail)?;
                    Ok(TableExpr {
                        base,
                        elem_size: 1u32 << shift.min(31),
                        index: strip_copies(fd, x),
                    })
                }
                _ => Ok(TableExpr {
                    base,
                    elem_size: 1,
                    index: scaled,
                }),
            }
        } else {
            Err(JumpTableError::Fail)
        }
    } else {
        Err(JumpTableError::Fail)
    }
}

/// Search the clone for a comparison bounding the index cell: `index < n` (or `index <= n`,
/// which the jumptable action group normalizes away). Also honors a resolved guard narrowed
/// during rewriting.
fn find_bound(fd: &Funcdata, index: VarnodeId) -> Option<u64> {
    let candidates = [OpCode::IntLess, OpCode::IntLessEqual];
    for opcode in candidates {
        for op in fd.ops().opcode_iter(opcode) {
            if fd.ops().get(op).is_dead() {
                continue;
            }
            let (a, b) = {
                let o = fd.ops().get(op);
                (o.input(0), o.input(1))
            };
            let (Some(a), Some(b)) = (a, b) else { continue };
            if strip_copies(fd, a) != index {
                continue;
            }
            if let Some(n) = fd.vars().get(b).constant_value() {
                let bound = if opcode == OpCode::IntLessEqual {
                    n + 1
                } else {
                    n
                };
                // The comparison must actually gate a branch
                let feeds_branch = fd
                    .ops()
                    .get(op)
                    .output()
                    .map(|out| {
                        fd.vars()
                            .get(out)
                            .uses()
                            .iter()
                            .any(|&u| fd.ops().get(u).opcode == OpCode::CBranch)
                    })
                    .unwrap_or(false);
                if feeds_branch {
                    return Some(bound);
                }
            }
        }
    }
    None
}

/// Recover the jump table for an indirect branch. On success the returned table is stage 1
/// (partial; reconsult next pass) or stage 2 (complete, with targets enumerated).
pub fn recover_jump_table(
    fd: &mut Funcdata,
    actions: &mut ActionDatabase,
    branch: OpId,
) -> Result<JumpTable, JumpTableError> {
    assert!(
        !fd.recovery_mode,
        "recovery must not recurse into a partial clone"
    );
    let branch_seq = fd.ops().get(branch).seq;
    debug!("Recovering jump table"; "func" => &fd.name, "branch" => ?branch_seq);

    // 1. Early-fail check, before any clone is built
    early_fail_check(fd, branch)?;

    // 2. An override short-circuits extraction entirely
    if let Some(overridden) = fd
        .jump_table_for(branch)
        .and_then(|t| t.override_targets.clone())
    {
        let mut table = JumpTable::new(branch);
        table.override_targets = Some(overridden.clone());
        table.targets = overridden;
        table.default_index = None;
        table.stage = 2;
        return Ok(table);
    }

    // 3. Partial clone plus targeted simplification
    let mut clone = fd.clone_partial();
    let reachable = clone.blocks().reverse_postorder();
    if let Some(block) = clone.ops().get(branch).parent() {
        if !reachable.contains(&block) {
            return Err(JumpTableError::Unreachable);
        }
    }
    clone.heritage_pass();
    if actions.apply_group(&mut clone, "jumptable").is_err() {
        return Err(JumpTableError::Fail);
    }

    // 4. Address extraction on the simplified branch
    let expr = match_table_expr(&clone, branch)?;
    let Some(bound) = find_bound(&clone, expr.index) else {
        let mut table = JumpTable::new(branch);
        table.stage = 1;
        debug!("Jump table bound not yet visible; staging"; "branch" => ?branch_seq);
        return Ok(table);
    };
    if bound == 0 || bound > CONFIG.jumptable_max_entries as u64 {
        return Err(JumpTableError::Fail);
    }

    let code_space = branch_seq.addr.space;
    let data_space = fd
        .arch()
        .spaces
        .first_of_kind(crate::address::SpaceKind::Ram)
        .unwrap_or(code_space);
    let mut table = JumpTable::new(branch);
    for i in 0..bound {
        let entry_addr = Address::new(data_space, expr.base + i * expr.elem_size as u64);
        let mut buf = vec![0u8; expr.elem_size as usize];
        if fd.arch().loader.load_fill(&mut buf, entry_addr).is_err() {
            debug!("Jump table entry unavailable"; "addr" => ?entry_addr);
            return Err(JumpTableError::Fail);
        }
        let mut value = 0u64;
        match fd.arch().endian {
            Endian::Little => {
                for (j, &byte) in buf.iter().enumerate().take(8) {
                    value |= (byte as u64) << (8 * j);
                }
            }
            Endian::Big => {
                for &byte in buf.iter().take(8) {
                    value = (value << 8) | byte as u64;
                }
            }
        }
        table.loadpoints.push((entry_addr, expr.elem_size));
        let dest = Address::new(code_space, value);
        if !table.targets.contains(&dest) {
            table.targets.push(dest);
        }
    }
    table.stage = 2;
    debug!(
        "Jump table recovered";
        "branch" => ?branch_seq, "entries" => bound, "distinct" => table.targets.len()
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_follow_the_contract() {
        assert_eq!(JumpTableError::Fail.code(), 1);
        assert_eq!(JumpTableError::Thunk.code(), 2);
        assert_eq!(JumpTableError::Unreachable.code(), 3);
    }
}
