mod op;
mod source;

pub use op::Opcode;
pub use source::{FunctionSource, SourceInstruction};
