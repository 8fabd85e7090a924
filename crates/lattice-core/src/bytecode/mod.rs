//! bytecode — format `Chunk`, pool de constantes, opcodes `Op`, désassembleur.

pub mod chunk;
pub mod disasm;
pub mod ops;

pub use chunk::{
    Chunk, ChunkFlags, ChunkLoadError, ConstPool, ConstValue, LineTable, ParamSpec, UpvalDesc,
    CHUNK_MAGIC, CHUNK_VERSION, fnv1a64,
};
pub use ops::{Argc, ConstIx, LocalIx, Op, OperandKind, SelectArm, UpvalIx, VarLoc};
