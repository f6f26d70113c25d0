pub mod memory;
pub mod traits;

pub use memory::MemoryChangeLog;
pub use traits::SourceProvider;
