mod file;
mod memory;

pub use file::FileBackingStore;
pub use memory::MemoryBackingStore;
