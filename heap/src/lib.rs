mod heap;
mod pool;

pub use heap::{Flavour, Heap, HeapError, HeapSettings};
pub use pool::Pool;
