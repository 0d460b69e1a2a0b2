//! Classified failures attached to code positions.
//!
//! Broken invariants panic; everything callers can recover from travels as one of the explicit
//! error kinds below.

use crate::address::Address;
use thiserror::Error;

/// Fatal breakage of an engine invariant. Analysis of the current function is abandoned; the
/// driver records the function as un-analyzed and continues with the next.
#[derive(Debug, Error)]
pub enum LowLevelError {
    #[error("cannot split a block along edge {edge} of {block_index}: branch has fan-out {fanout}")]
    BadNodeSplit {
        block_index: usize,
        edge: usize,
        fanout: usize,
    },

    #[error("overlapping function inputs of different geometry at {addr:?} (sizes {a} and {b})")]
    OverlappingInputs { addr: Address, a: u32, b: u32 },

    #[error("operation at {addr:?} destroyed while its output still has {descendants} readers")]
    LiveDescendants { addr: Address, descendants: usize },

    #[error("action group {group:?} exceeded {passes} passes without reaching a fixed point")]
    ActionCapExceeded { group: String, passes: usize },

    #[error("{0}")]
    Other(String),
}

/// A localized recovery failure. The containing construct is left in a degraded form.
#[derive(Debug, Error)]
pub enum RecoverError {
    #[error("jump table recovery failed at {addr:?}")]
    JumpTableFail { addr: Address },

    #[error("indirect branch at {addr:?} appears to be a thunk")]
    JumpTableThunk { addr: Address },

    #[error("indirect branch at {addr:?} is unreachable in the simplified clone")]
    JumpTableUnreachable { addr: Address },

    #[error("unreachable flow detected at {addr:?}")]
    UnreachableFlow { addr: Address },
}

/// The loader could not provide bytes for an address. The caller clears the cell's read-only
/// attribute and abandons the fold.
#[derive(Debug, Error)]
#[error("no bytes available at {addr:?} (requested {size})")]
pub struct DataUnavailable {
    pub addr: Address,
    pub size: u32,
}

/// Failure while decoding persisted state. Decoding aborts and the partial state is discarded.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("expected element <{expected}>, found <{found}>")]
    UnexpectedElement { expected: String, found: String },

    #[error("missing attribute {name:?} on <{element}>")]
    MissingAttribute { name: String, element: String },

    #[error("bad value {value:?} for attribute {name:?}")]
    BadAttribute { name: String, value: String },

    #[error("unexpected end of stream while reading <{element}>")]
    Truncated { element: String },
}

/// A non-fatal observation surfaced to the reader of the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub text: String,
    /// Placement near a specific address; `None` places the warning at the function header.
    pub addr: Option<Address>,
}
