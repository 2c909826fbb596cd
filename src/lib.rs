mod asm;
mod cache;
mod cpu;
pub mod isa;
mod loader;
mod mem;
mod regs;
mod trace;
mod utils;

pub use asm::{assemble, Object, SymbolMap};
pub use cache::{Cache, CacheStats};
pub use cpu::{CondCode, Cpu, Stat};
pub use loader::load_image;
pub use mem::{Memory, MEM_SIZE};
pub use regs::RegisterFile;
pub use trace::{Record, TraceWriter};
pub use utils::{logging_setup, mem_diff, parse_literal};
