use thiserror::Error;

pub type Result<T> = std::result::Result<T, VmError>;

/// Every failure the runtime can raise. All of them are fatal to the
/// current execution; the CLI prints the message and exits nonzero.
#[derive(Debug, Error)]
pub enum VmError {
    // ── Bundle access ──────────────────────────────────────────────
    #[error(transparent)]
    Bundle(#[from] bundle::BundleError),

    #[error(transparent)]
    Heap(#[from] heap::HeapError),

    // ── Plant time ─────────────────────────────────────────────────
    #[error("binding '{name}' is not valid JSON: {source}")]
    MalformedBinding {
        name: String,
        source: serde_json::Error,
    },

    #[error("unknown instruction type: {0}")]
    UnknownInstruction(String),

    #[error("{opcode} requires a '{field}' field")]
    MissingOperand {
        opcode: &'static str,
        field: &'static str,
    },

    #[error("push.bool value must be 'true' or 'false', got '{0}'")]
    InvalidBoolLiteral(String),

    #[error("undefined global: {0}")]
    UnknownGlobal(String),

    #[error("unknown sys-function: {0}")]
    UnknownSysFunction(String),

    #[error("duplicate label: {0}")]
    DuplicateLabel(String),

    #[error("unresolved label references: {0}")]
    UnresolvedLabels(String),

    #[error("function header out of range: nlocals={nlocals}, nparams={nparams}")]
    BadFunctionHeader { nlocals: i64, nparams: i64 },

    // ── Load time ──────────────────────────────────────────────────
    #[error("entry point not found: {0}")]
    EntryPointNotFound(String),

    #[error("bundle declares no entry points")]
    NoEntryPoints,

    #[error("bundle declares multiple entry points, select one with --entry-point: {0}")]
    MultipleEntryPoints(String),

    // ── Run time ───────────────────────────────────────────────────
    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("operand stack overflow")]
    StackOverflow,

    #[error("operand stack index out of bounds")]
    StackIndexOutOfBounds,

    #[error("return stack underflow")]
    ReturnStackUnderflow,

    #[error("return stack overflow")]
    ReturnStackOverflow,

    #[error("frame local offset {0} out of bounds")]
    BadLocalOffset(i64),

    #[error("function expected {expected} arguments, but got {got}")]
    ArityMismatch { expected: u16, got: i64 },

    #[error("attempt to call a non-function object")]
    NotAFunction,

    #[error("cell is not a pointer")]
    NotAPointer,

    #[error("{context}: expected {expected}")]
    TypeMismatch {
        context: &'static str,
        expected: &'static str,
    },

    #[error("check.bool failed: expected stack size {expected}, got {got}")]
    CheckBoolDepth { expected: i64, got: i64 },

    #[error("check.bool failed: top of stack is not a boolean")]
    CheckBoolValue,

    #[error("{name}: expected {expected} arguments, got {got}")]
    SysArity {
        name: &'static str,
        expected: u64,
        got: u64,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("recursive evaluation of a lazy binding detected")]
    RecursiveLazyEvaluation,

    #[error("done expects exactly 1 value above the snapshot, found {0}")]
    DoneArity(i64),

    #[error("corrupt instruction stream: invalid opcode word 0x{0:x}")]
    InvalidOpcode(u64),
}
