mod cell;
mod ident;

pub use cell::Cell;
pub use ident::Ident;
