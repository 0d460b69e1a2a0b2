//! The fixed register of operation forms, and the per-opcode knowledge the rest of the engine
//! dispatches on.
//!
//! Every behavior that varies by opcode — arity, branching, commutativity, boolean output,
//! constant evaluation — lives here as a method on [`OpCode`], so the rewrite rules, the type
//! propagator, and the block builder all consult a single table.

/// An operation form over value cells.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum OpCode {
    /// Copy a sequence of contiguous bytes from `input0` to `output`
    Copy,
    /// Load from the address in `input1`, within the space referenced by constant `input0`
    Load,
    /// Store `input2` at the address in `input1`, within the space referenced by constant `input0`
    Store,
    /// Unconditional branch to `input0`
    Branch,
    /// Conditional branch to `input0` taken iff `input1` is non-zero
    CBranch,
    /// Branch to the indirect offset `input0`
    BranchInd,
    /// Call to `input0`; may carry parameter cells in later slots
    Call,
    /// Indirect call through `input0`
    CallInd,
    /// Architecture-specific operation named by constant `input0`
    UserOp,
    /// Return through the indirect offset `input0`
    Return,

    /// Check if `input0 == input1`
    IntEqual,
    /// Check if `input0 != input1`
    IntNotEqual,
    /// Signed integer comparison `input0 s< input1`
    IntSLess,
    /// Signed integer comparison `input0 s<= input1`
    IntSLessEqual,
    /// Unsigned integer comparison `input0 u< input1`
    IntLess,
    /// Unsigned integer comparison `input0 u<= input1`
    IntLessEqual,
    /// Zero-extend `input0`
    IntZext,
    /// Sign-extend `input0`
    IntSext,
    /// Wrapping sum of `input0` and `input1`
    IntAdd,
    /// Wrapping subtraction `input0 - input1`
    IntSub,
    /// Check for unsigned addition carry for `input0 + input1`
    IntCarry,
    /// Check for signed addition carry for `input0 + input1`
    IntSCarry,
    /// Check for signed subtraction borrow for `input0 - input1`
    IntSBorrow,
    /// Two's complement of `input0`
    IntTwosComp,
    /// One's complement of `input0` (bitwise NOT)
    IntOnesComp,
    /// Bitwise XOR of `input0` and `input1`
    IntXor,
    /// Bitwise AND of `input0` and `input1`
    IntAnd,
    /// Bitwise OR of `input0` and `input1`
    IntOr,
    /// Left shift `input0 << input1`
    IntLeftShift,
    /// Unsigned (logical) right shift `input0 u>> input1`
    IntURightShift,
    /// Signed (arithmetic) right shift `input0 s>> input1`
    IntSRightShift,
    /// Wrapping multiplication of `input0` and `input1`
    IntMult,
    /// Unsigned integer division `input0 u/ input1`
    IntUDiv,
    /// Signed integer division `input0 s/ input1`
    IntSDiv,
    /// Unsigned integer remainder `input0 u% input1`
    IntURem,
    /// Signed integer remainder `input0 s% input1`
    IntSRem,

    /// Boolean negation; size 1, interpreted only as true or false
    BoolNegate,
    /// Boolean XOR
    BoolXor,
    /// Boolean AND
    BoolAnd,
    /// Boolean OR
    BoolOr,

    /// Floating comparison `input0 == input1`
    FloatEqual,
    /// Floating comparison `input0 != input1`
    FloatNotEqual,
    /// Floating comparison `input0 < input1`
    FloatLess,
    /// Floating comparison `input0 <= input1`
    FloatLessEqual,
    /// Floating comparison `is_nan(input0)`
    FloatIsNan,
    /// Floating sum `input0 + input1`
    FloatAdd,
    /// Floating division `input0 / input1`
    FloatDiv,
    /// Floating multiplication `input0 * input1`
    FloatMult,
    /// Floating subtraction `input0 - input1`
    FloatSub,
    /// Floating negation `-input0`
    FloatNeg,
    /// Floating absolute value `|input0|`
    FloatAbs,
    /// Floating square root `sqrt(input0)`
    FloatSqrt,
    /// Floating `input0` to signed integer via truncation towards zero
    Float2IntTrunc,
    /// Signed integer `input0` to floating point
    Int2Float,
    /// Convert a float to a float of a different size
    Float2Float,
    /// Round `input0` towards the nearest integer, staying a float
    FloatRound,
    /// Round `input0` towards positive infinity
    FloatCeil,
    /// Round `input0` towards negative infinity
    FloatFloor,

    /// Merge-operation at a block head combining one value per in-edge
    Phi,
    /// Annotation that the operation referenced by `input1` (an iop cell) may modify the storage
    /// of `input0`; `output` is the possibly-modified image
    Indirect,
    /// Concatenate `input0` (most significant) and `input1`; output size is the sum of input sizes
    Piece,
    /// Truncate `input0`, dropping `input1` least-significant bytes
    SubPiece,
    /// Change the data-type interpretation of `input0` without changing bits
    Cast,
    /// `input0 + input1 * input2`, where `input0` points into an array of `input2`-byte elements
    PtrAdd,
    /// `input0 + input1`, where `input1` is a byte offset to a subcomponent of `input0`'s referent
    PtrSub,
    /// Count the number of 1-bits in `input0`
    Popcount,
}

impl OpCode {
    /// Whether the form may produce an output cell. Calls produce one only when a return value is
    /// attached (the cell carries the call-output flag).
    pub fn has_output(self) -> bool {
        use OpCode::*;
        !matches!(self, Branch | CBranch | BranchInd | Return | Store)
    }

    /// A branch form: last op of its block, drives out-edges.
    pub fn is_branch(self) -> bool {
        use OpCode::*;
        matches!(self, Branch | CBranch | BranchInd)
    }

    /// A call form.
    pub fn is_call(self) -> bool {
        use OpCode::*;
        matches!(self, Call | CallInd)
    }

    /// Whether control cannot fall through to the next op.
    pub fn is_flow_break(self) -> bool {
        use OpCode::*;
        matches!(self, Branch | BranchInd | Return)
    }

    /// A marker form: pinned to a structural position rather than free data-flow (phi ops at
    /// block heads, indirect-effect ops immediately before their effectful op).
    pub fn is_marker(self) -> bool {
        use OpCode::*;
        matches!(self, Phi | Indirect)
    }

    /// Whether the two inputs may be swapped without changing the result.
    pub fn is_commutative(self) -> bool {
        use OpCode::*;
        matches!(
            self,
            IntEqual
                | IntNotEqual
                | IntAdd
                | IntXor
                | IntAnd
                | IntOr
                | IntMult
                | BoolXor
                | BoolAnd
                | BoolOr
                | FloatEqual
                | FloatNotEqual
                | FloatAdd
                | FloatMult
                | IntCarry
                | IntSCarry
        )
    }

    /// Whether the output is a size-1 boolean.
    pub fn is_boolean_output(self) -> bool {
        use OpCode::*;
        matches!(
            self,
            IntEqual
                | IntNotEqual
                | IntSLess
                | IntSLessEqual
                | IntLess
                | IntLessEqual
                | IntCarry
                | IntSCarry
                | IntSBorrow
                | BoolNegate
                | BoolXor
                | BoolAnd
                | BoolOr
                | FloatEqual
                | FloatNotEqual
                | FloatLess
                | FloatLessEqual
                | FloatIsNan
        )
    }

    /// The comparison computing the logical negation of this one, with a flag telling whether the
    /// operand order must also be swapped.
    pub fn negated_compare(self) -> Option<(OpCode, bool)> {
        use OpCode::*;
        Some(match self {
            IntEqual => (IntNotEqual, false),
            IntNotEqual => (IntEqual, false),
            IntSLess => (IntSLessEqual, true),
            IntSLessEqual => (IntSLess, true),
            IntLess => (IntLessEqual, true),
            IntLessEqual => (IntLess, true),
            FloatEqual => (FloatNotEqual, false),
            FloatNotEqual => (FloatEqual, false),
            _ => return None,
        })
    }

    /// The mask of significant bits for a cell of `size` bytes.
    pub fn calc_mask(size: u32) -> u64 {
        if size >= 8 {
            u64::MAX
        } else {
            (1u64 << (size * 8)) - 1
        }
    }

    /// Evaluate a unary form over a constant, producing the output constant, or `None` when the
    /// form is not unary-evaluable. Inputs and outputs are masked to their byte sizes.
    pub fn evaluate_unary(self, out_size: u32, in_size: u32, v: u64) -> Option<u64> {
        use OpCode::*;
        let inmask = Self::calc_mask(in_size);
        let outmask = Self::calc_mask(out_size);
        let v = v & inmask;
        let res = match self {
            Copy | Cast => v,
            IntZext => v,
            IntSext => {
                let signbit = 1u64 << (in_size * 8 - 1);
                if v & signbit != 0 {
                    v | (outmask & !inmask)
                } else {
                    v
                }
            }
            IntTwosComp => v.wrapping_neg(),
            IntOnesComp => !v,
            BoolNegate => (v == 0) as u64,
            Popcount => v.count_ones() as u64,
            _ => return None,
        };
        Some(res & outmask)
    }

    /// Evaluate a binary form over constants. `size` is the size of the inputs in bytes.
    pub fn evaluate_binary(self, size: u32, a: u64, b: u64) -> Option<u64> {
        use OpCode::*;
        let mask = Self::calc_mask(size);
        let (a, b) = (a & mask, b & mask);
        let signbit = 1u64 << (size * 8 - 1).min(63);
        let sext = |v: u64| -> i64 {
            if size >= 8 {
                v as i64
            } else if v & signbit != 0 {
                (v | !mask) as i64
            } else {
                v as i64
            }
        };
        let res = match self {
            IntEqual => (a == b) as u64,
            IntNotEqual => (a != b) as u64,
            IntSLess => (sext(a) < sext(b)) as u64,
            IntSLessEqual => (sext(a) <= sext(b)) as u64,
            IntLess => (a < b) as u64,
            IntLessEqual => (a <= b) as u64,
            IntAdd => a.wrapping_add(b),
            IntSub => a.wrapping_sub(b),
            IntCarry => ((a.wrapping_add(b) & mask) < a) as u64,
            IntSCarry => {
                let r = sext(a).wrapping_add(sext(b));
                (r != sext((r as u64) & mask)) as u64
            }
            IntSBorrow => {
                let r = sext(a).wrapping_sub(sext(b));
                (r != sext((r as u64) & mask)) as u64
            }
            IntXor => a ^ b,
            IntAnd => a & b,
            IntOr => a | b,
            IntLeftShift => {
                if b >= (size as u64) * 8 {
                    0
                } else {
                    a.wrapping_shl(b as u32)
                }
            }
            IntURightShift => {
                if b >= (size as u64) * 8 {
                    0
                } else {
                    a.wrapping_shr(b as u32)
                }
            }
            IntSRightShift => {
                if b >= (size as u64) * 8 {
                    if sext(a) < 0 {
                        mask
                    } else {
                        0
                    }
                } else {
                    ((sext(a) >> b) as u64) & mask
                }
            }
            IntMult => a.wrapping_mul(b),
            IntUDiv => {
                if b == 0 {
                    return None;
                }
                a / b
            }
            IntSDiv => {
                if b == 0 {
                    return None;
                }
                sext(a).wrapping_div(sext(b)) as u64
            }
            IntURem => {
                if b == 0 {
                    return None;
                }
                a % b
            }
            IntSRem => {
                if b == 0 {
                    return None;
                }
                sext(a).wrapping_rem(sext(b)) as u64
            }
            BoolXor => ((a != 0) ^ (b != 0)) as u64,
            BoolAnd => ((a != 0) && (b != 0)) as u64,
            BoolOr => ((a != 0) || (b != 0)) as u64,
            _ => return None,
        };
        Some(res & mask)
    }

    /// The printable mnemonic, also used by the stream codec.
    pub fn name(self) -> &'static str {
        use OpCode::*;
        match self {
            Copy => "COPY",
            Load => "LOAD",
            Store => "STORE",
            Branch => "BRANCH",
            CBranch => "CBRANCH",
            BranchInd => "BRANCHIND",
            Call => "CALL",
            CallInd => "CALLIND",
            UserOp => "CALLOTHER",
            Return => "RETURN",
            IntEqual => "INT_EQUAL",
            IntNotEqual => "INT_NOTEQUAL",
            IntSLess => "INT_SLESS",
            IntSLessEqual => "INT_SLESSEQUAL",
            IntLess => "INT_LESS",
            IntLessEqual => "INT_LESSEQUAL",
            IntZext => "INT_ZEXT",
            IntSext => "INT_SEXT",
            IntAdd => "INT_ADD",
            IntSub => "INT_SUB",
            IntCarry => "INT_CARRY",
            IntSCarry => "INT_SCARRY",
            IntSBorrow => "INT_SBORROW",
            IntTwosComp => "INT_2COMP",
            IntOnesComp => "INT_NEGATE",
            IntXor => "INT_XOR",
            IntAnd => "INT_AND",
            IntOr => "INT_OR",
            IntLeftShift => "INT_LEFT",
            IntURightShift => "INT_RIGHT",
            IntSRightShift => "INT_SRIGHT",
            IntMult => "INT_MULT",
            IntUDiv => "INT_DIV",
            IntSDiv => "INT_SDIV",
            IntURem => "INT_REM",
            IntSRem => "INT_SREM",
            BoolNegate => "BOOL_NEGATE",
            BoolXor => "BOOL_XOR",
            BoolAnd => "BOOL_AND",
            BoolOr => "BOOL_OR",
            FloatEqual => "FLOAT_EQUAL",
            FloatNotEqual => "FLOAT_NOTEQUAL",
            FloatLess => "FLOAT_LESS",
            FloatLessEqual => "FLOAT_LESSEQUAL",
            FloatIsNan => "FLOAT_NAN",
            FloatAdd => "FLOAT_ADD",
            FloatDiv => "FLOAT_DIV",
            FloatMult => "FLOAT_MULT",
            FloatSub => "FLOAT_SUB",
            FloatNeg => "FLOAT_NEG",
            FloatAbs => "FLOAT_ABS",
            FloatSqrt => "FLOAT_SQRT",
            Float2IntTrunc => "FLOAT_TRUNC",
            Int2Float => "FLOAT_INT2FLOAT",
            Float2Float => "FLOAT_FLOAT2FLOAT",
            FloatRound => "FLOAT_ROUND",
            FloatCeil => "FLOAT_CEIL",
            FloatFloor => "FLOAT_FLOOR",
            Phi => "MULTIEQUAL",
            Indirect => "INDIRECT",
            Piece => "PIECE",
            SubPiece => "SUBPIECE",
            Cast => "CAST",
            PtrAdd => "PTRADD",
            PtrSub => "PTRSUB",
            Popcount => "POPCOUNT",
        }
    }

    /// Look an opcode up by its mnemonic. Used by the stream codec.
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_OPCODES.iter().copied().find(|op| op.name() == name)
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// All opcodes, in a fixed order usable for tables keyed by opcode.
pub const ALL_OPCODES: &[OpCode] = {
    use OpCode::*;
    &[
        Copy, Load, Store, Branch, CBranch, BranchInd, Call, CallInd, UserOp, Return, IntEqual,
        IntNotEqual, IntSLess, IntSLessEqual, IntLess, IntLessEqual, IntZext, IntSext, IntAdd,
        IntSub, IntCarry, IntSCarry, IntSBorrow, IntTwosComp, IntOnesComp, IntXor, IntAnd, IntOr,
        IntLeftShift, IntURightShift, IntSRightShift, IntMult, IntUDiv, IntSDiv, IntURem, IntSRem,
        BoolNegate, BoolXor, BoolAnd, BoolOr, FloatEqual, FloatNotEqual, FloatLess, FloatLessEqual,
        FloatIsNan, FloatAdd, FloatDiv, FloatMult, FloatSub, FloatNeg, FloatAbs, FloatSqrt,
        Float2IntTrunc, Int2Float, Float2Float, FloatRound, FloatCeil, FloatFloor, Phi, Indirect,
        Piece, SubPiece, Cast, PtrAdd, PtrSub, Popcount,
    ]
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks() {
        assert_eq!(OpCode::calc_mask(1), 0xff);
        assert_eq!(OpCode::calc_mask(4), 0xffff_ffff);
        assert_eq!(OpCode::calc_mask(8), u64::MAX);
    }

    #[test]
    fn constant_evaluation_wraps() {
        assert_eq!(
            OpCode::IntAdd.evaluate_binary(1, 0xff, 1),
            Some(0)
        );
        assert_eq!(
            OpCode::IntSLess.evaluate_binary(1, 0x80, 0),
            Some(1) // -128 < 0
        );
        assert_eq!(OpCode::IntUDiv.evaluate_binary(4, 10, 0), None);
        assert_eq!(
            OpCode::IntSext.evaluate_unary(4, 1, 0x80),
            Some(0xffff_ff80)
        );
        assert_eq!(OpCode::IntZext.evaluate_unary(4, 1, 0x80), Some(0x80));
    }

    #[test]
    fn names_round_trip() {
        for &op in ALL_OPCODES {
            assert_eq!(OpCode::from_name(op.name()), Some(op));
        }
    }
}
