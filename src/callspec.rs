//! Per-call records: effects on storage, the parameter trials prototype recovery walks, and the
//! current best prototype those trials converge on.

use crate::address::Address;
use crate::op::OpId;
use crate::typeprop::TypeId;
use bitflags::bitflags;

/// One parameter (or return) slot of a prototype: its storage and, once propagation has run, its
/// data-type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtoParam {
    pub addr: Address,
    pub size: u32,
    pub datatype: Option<TypeId>,
}

/// A function signature as recovery currently understands it: a calling-convention tag, the
/// parameter list, and the return storage. Starts as [`Prototype::unknown`] and is refined as
/// trials settle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prototype {
    /// Calling-convention tag; `"unknown"` until something better is established.
    pub model: String,
    pub params: Vec<ProtoParam>,
    pub output: Option<ProtoParam>,
}

impl Prototype {
    pub fn unknown() -> Self {
        Self {
            model: "unknown".into(),
            params: Vec::new(),
            output: None,
        }
    }

    /// Whether nothing has been established beyond the defaults.
    pub fn is_unknown(&self) -> bool {
        self.model == "unknown" && self.params.is_empty() && self.output.is_none()
    }
}

impl Default for Prototype {
    fn default() -> Self {
        Self::unknown()
    }
}

/// How a call affects one storage range.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EffectType {
    /// The callee leaves the storage untouched
    Unaffected,
    /// The callee clobbers the storage
    Killed,
    /// The storage carries the return value
    ReturnStorage,
    /// Nothing is known
    Unknown,
}

/// One storage range paired with the call's effect on it.
#[derive(Clone, Debug)]
pub struct EffectRecord {
    pub addr: Address,
    pub size: u32,
    pub effect: EffectType,
}

/// Status of one parameter trial.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TrialStatus {
    /// Not yet examined
    Unchecked,
    /// Examined, undecided
    Checked,
    /// Confirmed as a parameter
    Active,
    /// Ruled out
    Inactive,
}

bitflags! {
    /// Evidence gathered by data-flow walks around a trial.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct TrialFlags: u32 {
        /// An ancestor walk found a realistic producer for the storage
        const ANCESTOR_REALISTIC = 1 << 0;
        /// The producer writes the storage directly, not through a copy chain
        const ANCESTOR_SOLID = 1 << 1;
        /// A descendant walk saw the value consumed past the call
        const DESCENDANT_USED = 1 << 2;
        /// The storage is clobbered by the call itself
        const KILLED_BY_CALL = 1 << 3;
    }
}

/// A candidate parameter location for one call.
#[derive(Clone, Debug)]
pub struct ParamTrial {
    pub addr: Address,
    pub size: u32,
    pub status: TrialStatus,
    pub flags: TrialFlags,
    /// Slot the trial would occupy in the prototype, once active.
    pub slot: usize,
}

/// Everything the analysis tracks about one call site.
#[derive(Clone, Debug)]
pub struct FuncCallSpecs {
    /// The call op this record belongs to.
    pub op: OpId,
    /// The callee entry, when the call target is known.
    pub entry: Option<Address>,
    pub name: Option<String>,
    pub effects: Vec<EffectRecord>,
    pub trials: Vec<ParamTrial>,
    /// The current best prototype for the callee.
    pub prototype: Prototype,
    /// Whether the prototype came from user input and must not be revised.
    pub prototype_locked: bool,
}

impl FuncCallSpecs {
    pub fn new(op: OpId) -> Self {
        Self {
            op,
            entry: None,
            name: None,
            effects: Vec::new(),
            trials: Vec::new(),
            prototype: Prototype::unknown(),
            prototype_locked: false,
        }
    }

    /// The call's effect on the given storage. Unknown storage defaults to `Killed` for calls
    /// with no effect list (the conservative reading) and `Unknown` otherwise.
    pub fn effect_of(&self, addr: Address, size: u32) -> EffectType {
        for e in &self.effects {
            if e.addr.contains(e.size, &addr, size).is_some() {
                return e.effect;
            }
        }
        if self.effects.is_empty() {
            EffectType::Killed
        } else {
            EffectType::Unknown
        }
    }

    pub fn add_trial(&mut self, addr: Address, size: u32) -> &mut ParamTrial {
        let slot = self.trials.len();
        self.trials.push(ParamTrial {
            addr,
            size,
            status: TrialStatus::Unchecked,
            flags: TrialFlags::default(),
            slot,
        });
        self.trials.last_mut().unwrap()
    }

    /// Promote checked trials with solid ancestor evidence to active, demote the rest, renumber
    /// the active slots densely, and refresh the prototype's parameter list from the survivors.
    /// A locked prototype is left as the user supplied it.
    pub fn finalize_trials(&mut self) {
        for t in &mut self.trials {
            if t.status == TrialStatus::Checked {
                t.status = if t.flags.contains(TrialFlags::ANCESTOR_REALISTIC)
                    && !t.flags.contains(TrialFlags::KILLED_BY_CALL)
                {
                    TrialStatus::Active
                } else {
                    TrialStatus::Inactive
                };
            }
        }
        let mut slot = 0usize;
        for t in &mut self.trials {
            if t.status == TrialStatus::Active {
                t.slot = slot;
                slot += 1;
            }
        }
        if !self.prototype_locked {
            self.prototype.params = self
                .trials
                .iter()
                .filter(|t| t.status == TrialStatus::Active)
                .map(|t| ProtoParam {
                    addr: t.addr,
                    size: t.size,
                    datatype: None,
                })
                .collect();
            if let Some(ret) = self
                .effects
                .iter()
                .find(|e| e.effect == EffectType::ReturnStorage)
            {
                self.prototype.output = Some(ProtoParam {
                    addr: ret.addr,
                    size: ret.size,
                    datatype: None,
                });
            }
        }
    }

    pub fn active_trials(&self) -> impl Iterator<Item = &ParamTrial> {
        self.trials
            .iter()
            .filter(|t| t.status == TrialStatus::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{SpaceKind, SpaceManager};
    use crate::op::OpId;

    #[test]
    fn trial_promotion_settles_the_prototype() {
        let mut mgr = SpaceManager::new();
        let reg = mgr.add_space("register", SpaceKind::Register, 8, 0);
        let mut spec = FuncCallSpecs::new(OpId(0));
        assert!(spec.prototype.is_unknown());
        spec.effects.push(EffectRecord {
            addr: Address::new(reg, 0x0),
            size: 8,
            effect: EffectType::ReturnStorage,
        });
        let t = spec.add_trial(Address::new(reg, 0x38), 8);
        t.status = TrialStatus::Checked;
        t.flags |= TrialFlags::ANCESTOR_REALISTIC;
        let t2 = spec.add_trial(Address::new(reg, 0x30), 8);
        t2.status = TrialStatus::Checked;
        spec.finalize_trials();
        assert_eq!(spec.active_trials().count(), 1);
        assert_eq!(spec.trials[0].status, TrialStatus::Active);
        assert_eq!(spec.trials[1].status, TrialStatus::Inactive);

        assert_eq!(spec.prototype.params.len(), 1);
        assert_eq!(spec.prototype.params[0].addr, Address::new(reg, 0x38));
        let ret = spec.prototype.output.as_ref().unwrap();
        assert_eq!(ret.addr, Address::new(reg, 0x0));
        assert!(!spec.prototype.is_unknown());
    }

    #[test]
    fn locked_prototype_is_not_revised() {
        let mut mgr = SpaceManager::new();
        let reg = mgr.add_space("register", SpaceKind::Register, 8, 0);
        let mut spec = FuncCallSpecs::new(OpId(0));
        spec.prototype = Prototype {
            model: "stdcall".into(),
            params: vec![ProtoParam {
                addr: Address::new(reg, 0x10),
                size: 4,
                datatype: None,
            }],
            output: None,
        };
        spec.prototype_locked = true;
        let t = spec.add_trial(Address::new(reg, 0x38), 8);
        t.status = TrialStatus::Checked;
        t.flags |= TrialFlags::ANCESTOR_REALISTIC;
        spec.finalize_trials();
        assert_eq!(spec.prototype.params.len(), 1);
        assert_eq!(spec.prototype.params[0].addr, Address::new(reg, 0x10));
        assert_eq!(spec.prototype.model, "stdcall");
    }
}
