//! Linear object heap.
//!
//! Every heap object is addressed by its *identity pointer*: the cell that
//! holds a pointer to the object's datakey. Metadata lives at negative
//! offsets from the identity, payload at positive offsets. Three root
//! datakeys are allocated at startup; all other objects point at one of
//! them.

use object::Cell;
use thiserror::Error;

use crate::Pool;

/// Object flavours, stored in slot 0 of a datakey.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Flavour {
    Datakey = 0,
    Record = 1,
    Vector = 2,
    Binarray = 3,
    Function = 4,
}

/// 1 MiB of 8-byte cells.
const DEFAULT_POOL_CELLS: usize = 1024 * 1024 / 8;

/// Cells occupied by one datakey: `[Flavour][·][·][·][datakey]`.
const DATAKEY_CELLS: usize = 5;

#[derive(Debug, Error)]
pub enum HeapError {
    #[error("heap exhausted: requested {requested} cells of {capacity}")]
    Exhausted { requested: usize, capacity: usize },
}

/// Configuration for the heap. Capacity is fixed at startup; there is no
/// reclamation.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    pub pool_cells: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            pool_cells: DEFAULT_POOL_CELLS,
        }
    }
}

pub struct Heap {
    pool: Pool,
    datakey_datakey: *mut Cell,
    string_datakey: *mut Cell,
    function_datakey: *mut Cell,
}

impl Heap {
    pub fn new(settings: HeapSettings) -> Result<Self, HeapError> {
        let mut pool = Pool::new(settings.pool_cells);

        // DatakeyDatakey: [Flavour=Datakey][·][·][·][datakey→self]
        let datakey_datakey = pool.allocate(DATAKEY_CELLS)?;
        unsafe {
            // SAFETY: allocate returned DATAKEY_CELLS valid cells.
            *datakey_datakey = Cell::from_raw(Flavour::Datakey as u64);
            *datakey_datakey.add(4) = Cell::from_raw_ptr(datakey_datakey);
        }

        // StringDatakey: a binarray datakey with bit-width 8 for UTF-8.
        let string_datakey = pool.allocate(DATAKEY_CELLS)?;
        unsafe {
            // SAFETY: as above.
            *string_datakey = Cell::from_raw(Flavour::Datakey as u64);
            *string_datakey.add(1) = Cell::from_raw(8);
            *string_datakey.add(4) = Cell::from_raw_ptr(datakey_datakey);
        }

        // FunctionDatakey.
        let function_datakey = pool.allocate(DATAKEY_CELLS)?;
        unsafe {
            // SAFETY: as above.
            *function_datakey = Cell::from_raw(Flavour::Datakey as u64);
            *function_datakey.add(4) = Cell::from_raw_ptr(datakey_datakey);
        }

        Ok(Self {
            pool,
            datakey_datakey,
            string_datakey,
            function_datakey,
        })
    }

    pub fn datakey_datakey(&self) -> *mut Cell {
        self.datakey_datakey
    }

    pub fn string_datakey(&self) -> *mut Cell {
        self.string_datakey
    }

    pub fn function_datakey(&self) -> *mut Cell {
        self.function_datakey
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    // ── Strings ────────────────────────────────────────────────────

    /// Allocate a string object and return its identity pointer.
    ///
    /// Layout: `[-1: length][0: datakey][+1…: bytes + NUL]`, where `length`
    /// counts bytes **including** the trailing NUL.
    pub fn allocate_string(&mut self, value: &str) -> Result<*mut Cell, HeapError> {
        let char_count = value.len() + 1;
        let data_cells = char_count.div_ceil(std::mem::size_of::<Cell>());
        let base = self.pool.allocate(2 + data_cells)?;

        unsafe {
            // SAFETY: base has 2 + data_cells valid cells; the byte copy
            // stays within the data_cells region.
            *base = Cell::from_raw(char_count as u64);
            let identity = base.add(1);
            *identity = Cell::from_raw_ptr(self.string_datakey);

            let data = identity.add(1) as *mut u8;
            std::ptr::copy_nonoverlapping(value.as_ptr(), data, value.len());
            *data.add(value.len()) = 0;
            Ok(identity)
        }
    }

    /// Read the payload of a string object back as `&str` (without the NUL).
    ///
    /// # Safety
    ///
    /// `identity` must be the identity pointer of a string object allocated
    /// by this heap.
    pub unsafe fn string_data(&self, identity: *const Cell) -> &str {
        let char_count = (*identity.sub(1)).raw() as usize;
        let data = identity.add(1) as *const u8;
        let bytes = std::slice::from_raw_parts(data, char_count - 1);
        // SAFETY: the payload was copied from a &str by allocate_string.
        std::str::from_utf8_unchecked(bytes)
    }

    // ── Functions ──────────────────────────────────────────────────

    /// Allocate a function object and copy `code` into it.
    ///
    /// Layout: `[-2: N][-1: L][0: datakey][+1: packed][+2…: code]` with `N`
    /// and `L` as tagged ints (`L` is reserved and always 0) and `packed` =
    /// `{nparams:16, nextras:16, nlocals:16, 0:16}` from low to high bits.
    pub fn allocate_function(
        &mut self,
        code: &[Cell],
        nlocals: u16,
        nparams: u16,
    ) -> Result<*mut Cell, HeapError> {
        debug_assert!(nparams <= nlocals);
        let base = self.pool.allocate(4 + code.len())?;

        unsafe {
            // SAFETY: base has 4 + code.len() valid cells.
            *base = Cell::from_i64(code.len() as i64);
            *base.add(1) = Cell::from_i64(0);
            let identity = base.add(2);
            *identity = Cell::from_raw_ptr(self.function_datakey);

            let nextras = nlocals - nparams;
            let packed = nparams as u64
                | (nextras as u64) << 16
                | (nlocals as u64) << 32;
            *identity.add(1) = Cell::from_raw(packed);

            std::ptr::copy_nonoverlapping(code.as_ptr(), identity.add(2), code.len());
            Ok(identity)
        }
    }

    /// True iff `identity` addresses a function object.
    ///
    /// # Safety
    ///
    /// `identity` must point at the identity cell of some object in this
    /// heap.
    pub unsafe fn is_function_object(&self, identity: *const Cell) -> bool {
        (*identity).raw() == self.function_datakey as u64
    }

    /// First code word of a function object.
    ///
    /// # Safety
    ///
    /// `identity` must be the identity pointer of a function object.
    pub unsafe fn function_code(&self, identity: *mut Cell) -> *mut Cell {
        identity.add(2)
    }

    /// Number of code words, from the tagged-int header at offset −2.
    ///
    /// # Safety
    ///
    /// `identity` must be the identity pointer of a function object.
    pub unsafe fn function_code_len(&self, identity: *const Cell) -> usize {
        (*identity.sub(2)).to_i64() as usize
    }

    /// # Safety
    ///
    /// `identity` must be the identity pointer of a function object.
    pub unsafe fn function_nlocals(&self, identity: *const Cell) -> u16 {
        ((*identity.add(1)).raw() >> 32) as u16
    }

    /// # Safety
    ///
    /// `identity` must be the identity pointer of a function object.
    pub unsafe fn function_nparams(&self, identity: *const Cell) -> u16 {
        (*identity.add(1)).raw() as u16
    }

    /// # Safety
    ///
    /// `identity` must be the identity pointer of a function object.
    pub unsafe fn function_nextras(&self, identity: *const Cell) -> u16 {
        ((*identity.add(1)).raw() >> 16) as u16
    }
}
