use std::collections::HashMap;

use heap::{Heap, HeapSettings};
use object::{Cell, Ident};
use tracing::trace;

use crate::error::{Result, VmError};
use crate::planter::PlantedFunction;
use crate::stack::{CellStack, DEFAULT_STACK_CAPACITY};

/// Startup configuration. All capacities are fixed; exceeding any of them
/// is fatal.
#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub heap: HeapSettings,
    pub operand_stack_cells: usize,
    pub return_stack_cells: usize,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            heap: HeapSettings::default(),
            operand_stack_cells: DEFAULT_STACK_CAPACITY,
            return_stack_cells: DEFAULT_STACK_CAPACITY,
        }
    }
}

/// The virtual machine state: dual stacks, the global table, and the heap.
///
/// The global table maps names to boxed [`Ident`]s. Entries are never
/// removed and boxes are never replaced, only updated through them, so the
/// `*mut Ident` handles the planter embeds into compiled code stay valid for
/// the machine's lifetime.
pub struct Machine {
    operand_stack: CellStack,
    return_stack: CellStack,
    globals: HashMap<String, Box<Ident>>,
    heap: Heap,
}

impl Machine {
    pub fn new(settings: MachineSettings) -> Result<Self> {
        Ok(Self {
            operand_stack: CellStack::with_capacity(settings.operand_stack_cells),
            return_stack: CellStack::with_capacity(settings.return_stack_cells),
            globals: HashMap::new(),
            heap: Heap::new(settings.heap)?,
        })
    }

    // ── Operand stack ──────────────────────────────────────────────

    pub fn push(&mut self, value: Cell) -> Result<()> {
        self.operand_stack.push(value).ok_or(VmError::StackOverflow)
    }

    pub fn pop(&mut self) -> Result<Cell> {
        self.operand_stack.pop().ok_or(VmError::StackUnderflow)
    }

    pub fn peek(&self) -> Result<Cell> {
        self.operand_stack.peek().ok_or(VmError::StackUnderflow)
    }

    pub fn peek_mut(&mut self) -> Result<&mut Cell> {
        self.operand_stack.peek_mut().ok_or(VmError::StackUnderflow)
    }

    /// Absolute index from the bottom of the operand stack.
    pub fn peek_at(&self, index: usize) -> Result<Cell> {
        self.operand_stack
            .get(index)
            .ok_or(VmError::StackIndexOutOfBounds)
    }

    pub fn pop_multiple(&mut self, count: u64) -> Result<()> {
        self.operand_stack
            .pop_multiple(count as usize)
            .ok_or(VmError::StackUnderflow)
    }

    pub fn stack_size(&self) -> usize {
        self.operand_stack.len()
    }

    // ── Return stack ───────────────────────────────────────────────

    pub fn push_return(&mut self, value: Cell) -> Result<()> {
        self.return_stack
            .push(value)
            .ok_or(VmError::ReturnStackOverflow)
    }

    pub fn pop_return(&mut self) -> Result<Cell> {
        self.return_stack
            .pop()
            .ok_or(VmError::ReturnStackUnderflow)
    }

    /// Drop the `nlocals` frame slots below the already-popped function
    /// object and return address.
    pub fn pop_return_frame(&mut self, nlocals: usize) -> Result<()> {
        self.return_stack
            .pop_multiple(nlocals)
            .ok_or(VmError::ReturnStackUnderflow)
    }

    pub fn return_stack_size(&self) -> usize {
        self.return_stack.len()
    }

    /// Read a frame slot. Offset 1 is the return address, 2 the function
    /// object, ≥3 a local; the planter folds the `+2` into the offsets it
    /// emits.
    pub fn local(&self, offset: i64) -> Result<Cell> {
        let len = self.return_stack.len() as i64;
        if offset < 1 || offset > len {
            return Err(VmError::BadLocalOffset(offset));
        }
        self.return_stack
            .get((len - offset) as usize)
            .ok_or(VmError::BadLocalOffset(offset))
    }

    pub fn set_local(&mut self, offset: i64, value: Cell) -> Result<()> {
        let len = self.return_stack.len() as i64;
        if offset < 1 || offset > len {
            return Err(VmError::BadLocalOffset(offset));
        }
        self.return_stack
            .set((len - offset) as usize, value)
            .ok_or(VmError::BadLocalOffset(offset))
    }

    // ── Globals ────────────────────────────────────────────────────

    /// Create a global, or update an existing one in place (the `Ident`
    /// box, and therefore its address, is reused).
    pub fn define_global(&mut self, name: &str, cell: Cell, lazy: bool) {
        trace!(name, lazy, "define global");
        match self.globals.get_mut(name) {
            Some(ident) => {
                ident.cell = cell;
                ident.lazy = lazy;
            }
            None => {
                self.globals
                    .insert(name.to_string(), Box::new(Ident::new(cell, lazy)));
            }
        }
    }

    pub fn ident(&self, name: &str) -> Option<&Ident> {
        self.globals.get(name).map(|b| &**b)
    }

    /// The stable handle compiled code embeds as a raw operand cell. Derived
    /// from a mutable borrow: lazy promotion writes through it.
    pub fn ident_address(&mut self, name: &str) -> Option<*mut Ident> {
        self.globals.get_mut(name).map(|b| &mut **b as *mut Ident)
    }

    // ── Heap ───────────────────────────────────────────────────────

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Allocate a string object and return it as a tagged pointer.
    pub fn allocate_string(&mut self, value: &str) -> Result<Cell> {
        let identity = self.heap.allocate_string(value)?;
        Ok(Cell::from_ptr(identity))
    }

    /// Read a tagged string pointer back as `&str`.
    pub fn string_value(&self, cell: Cell) -> Result<&str> {
        if !cell.is_ptr() {
            return Err(VmError::NotAPointer);
        }
        // SAFETY: the cell is a tagged pointer produced by allocate_string;
        // heap objects never move.
        Ok(unsafe { self.heap.string_data(cell.as_ptr()) })
    }

    /// Move a planted function into the heap and return its identity.
    pub fn allocate_function(&mut self, planted: &PlantedFunction) -> Result<*mut Cell> {
        Ok(self.heap.allocate_function(
            &planted.code,
            planted.nlocals,
            planted.nparams,
        )?)
    }

    /// Detag a pointer cell into a heap object identity.
    pub fn object_identity(&self, cell: Cell) -> Result<*mut Cell> {
        if !cell.is_ptr() {
            return Err(VmError::NotAPointer);
        }
        Ok(cell.as_ptr())
    }

    /// Render a cell for program output and traces.
    pub fn format_cell(&self, cell: Cell) -> String {
        if cell.is_int() {
            cell.to_i64().to_string()
        } else if cell.is_float() {
            cell.to_f64().to_string()
        } else if cell.is_bool() {
            cell.as_bool().to_string()
        } else if cell.is_nil() {
            "nil".to_string()
        } else if cell.is_undef() {
            "undef".to_string()
        } else if cell.is_ptr() {
            let identity: *mut Cell = cell.as_ptr();
            // SAFETY: tagged pointers on the operand stack always address a
            // heap object identity cell.
            unsafe {
                if (*identity).raw_ptr::<Cell>() == self.heap.string_datakey() {
                    self.heap.string_data(identity).to_string()
                } else if self.heap.is_function_object(identity) {
                    format!("<function@{:x}>", identity as usize)
                } else {
                    format!("<object@{:x}>", identity as usize)
                }
            }
        } else {
            format!("{cell:?}")
        }
    }
}
