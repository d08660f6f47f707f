mod file;
mod memory;
mod tables;

pub use file::FileRepository;
pub use memory::InMemoryRepository;
