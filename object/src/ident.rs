use crate::Cell;

/// A global binding record.
///
/// The global table hands out `*mut Ident` handles that compiled code embeds
/// as raw operand cells, so an `Ident` must never move or be dropped while
/// any compiled code can reach it. The table guarantees this by boxing each
/// record and never removing entries.
///
/// `lazy` transitions `true → false` at most once, when the binding's thunk
/// completes with `DONE` or when a lazy call site rewrites itself to the
/// strict variant. `in_progress` guards against re-entrant evaluation of the
/// same binding.
#[derive(Debug)]
#[repr(C)]
pub struct Ident {
    pub cell: Cell,
    pub lazy: bool,
    pub in_progress: bool,
}

impl Ident {
    pub fn new(cell: Cell, lazy: bool) -> Self {
        Self {
            cell,
            lazy,
            in_progress: false,
        }
    }

    /// The pre-declaration state: `UNDEF`, strict.
    pub fn undefined() -> Self {
        Self::new(Cell::UNDEF, false)
    }
}
