/// Threaded-code opcodes.
///
/// In a compiled stream every opcode occupies one cell (its discriminant
/// stored raw), followed by a fixed number of inline operand cells. The
/// lazy variants are never spelled in source; the planter selects them from
/// the two-column table in [`Opcode::from_spelling`] when the referenced
/// global is declared lazy, and the interpreter rewrites them back to the
/// strict variant in place once the global has been realised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Opcode {
    /// Complete a lazy binding: store the single value above the snapshot
    /// into the global and clear its flags.
    /// Operands: `offset:raw`, `ident:raw`
    Done = 0,

    /// Push a tagged integer literal.
    /// Operands: `value:int`
    PushInt,

    /// Push a string object allocated at plant time.
    /// Operands: `value:ptr`
    PushString,

    /// Push `TRUE` or `FALSE`.
    /// Operands: `value:special`
    PushBool,

    /// Pop the top of the operand stack into a frame local.
    /// Operands: `offset:raw`
    PopLocal,

    /// Push a frame local.
    /// Operands: `offset:raw`
    PushLocal,

    /// Push a global's current value.
    /// Operands: `ident:raw`
    PushGlobal,

    /// Lazy variant of [`PushGlobal`](Opcode::PushGlobal): evaluates the
    /// thunk on first touch, self-rewrites to the strict variant after.
    /// Operands: `ident:raw`
    PushGlobalLazy,

    /// Build the entry-point frame and jump into a function. Only emitted
    /// by the driver stream, never by the planter.
    /// Operands: `func:raw`
    Launch,

    /// Call a global function; the argument count is the stack growth since
    /// the snapshot local.
    /// Operands: `offset:raw`, `ident:raw`
    CallGlobalCounted,

    /// Lazy variant of [`CallGlobalCounted`](Opcode::CallGlobalCounted).
    /// Operands: `offset:raw`, `ident:raw`
    CallGlobalCountedLazy,

    /// Invoke a sys-function resolved at plant time.
    /// Operands: `offset:raw`, `sysfn:raw`
    SyscallCounted,

    /// Snapshot the operand-stack length into a frame local.
    /// Operands: `offset:raw`
    StackLength,

    /// Assert exactly one boolean was pushed since the snapshot.
    /// Operands: `offset:raw`
    CheckBool,

    /// Unconditional relative jump.
    /// Operands: `rel:raw`
    Goto,

    /// Pop the condition; jump iff it is `FALSE`.
    /// Operands: `rel:raw`
    IfNot,

    /// Tear down the current frame and resume at the saved return address.
    Return,

    /// Return control to the interpreter's caller.
    Halt,

    /// Planter-only marker; records a jump target and emits no code.
    Label,
}

impl Opcode {
    pub const COUNT: usize = Opcode::Label as usize + 1;

    /// The raw cell content this opcode occupies in a compiled stream.
    #[inline(always)]
    pub const fn word(self) -> u64 {
        self as u64
    }

    /// Number of inline operand cells following the opcode word.
    pub const fn operand_count(self) -> usize {
        match self {
            Opcode::Return | Opcode::Halt | Opcode::Label => 0,
            Opcode::PushInt
            | Opcode::PushString
            | Opcode::PushBool
            | Opcode::PopLocal
            | Opcode::PushLocal
            | Opcode::PushGlobal
            | Opcode::PushGlobalLazy
            | Opcode::Launch
            | Opcode::StackLength
            | Opcode::CheckBool
            | Opcode::Goto
            | Opcode::IfNot => 1,
            Opcode::Done
            | Opcode::CallGlobalCounted
            | Opcode::CallGlobalCountedLazy
            | Opcode::SyscallCounted => 2,
        }
    }

    /// Map a binding-JSON `type` string to its `(strict, lazy)` opcode pair.
    ///
    /// Dotted spellings are canonical; CamelCase is accepted. Opcodes with
    /// no lazy behaviour repeat the strict column.
    pub fn from_spelling(kind: &str) -> Option<(Opcode, Opcode)> {
        use Opcode::*;
        let pair = match kind {
            "push.int" | "PushInt" => (PushInt, PushInt),
            "push.string" | "PushString" => (PushString, PushString),
            "push.bool" | "PushBool" => (PushBool, PushBool),
            "pop.local" | "PopLocal" => (PopLocal, PopLocal),
            "push.local" | "PushLocal" => (PushLocal, PushLocal),
            "push.global" | "PushGlobal" => (PushGlobal, PushGlobalLazy),
            "call.global.counted" | "CallGlobalCounted" => {
                (CallGlobalCounted, CallGlobalCountedLazy)
            }
            "syscall.counted" | "SyscallCounted" => {
                (SyscallCounted, SyscallCounted)
            }
            "stack.length" | "StackLength" => (StackLength, StackLength),
            "check.bool" | "CheckBool" => (CheckBool, CheckBool),
            "done" | "Done" => (Done, Done),
            "label" | "Label" => (Label, Label),
            "goto" | "Goto" => (Goto, Goto),
            "if.not" | "IfNot" => (IfNot, IfNot),
            "return" | "Return" => (Return, Return),
            "halt" | "Halt" => (Halt, Halt),
            _ => return None,
        };
        Some(pair)
    }
}

impl TryFrom<u64> for Opcode {
    type Error = u64;

    fn try_from(word: u64) -> Result<Self, u64> {
        if word < Self::COUNT as u64 {
            // SAFETY: Opcode is repr(u64) with contiguous variants from 0.
            Ok(unsafe { core::mem::transmute::<u64, Opcode>(word) })
        } else {
            Err(word)
        }
    }
}
