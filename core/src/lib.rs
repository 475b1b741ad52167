pub mod tensor;
pub mod init;
pub mod tape;
pub mod traced;
pub mod memory_store;
pub mod linear_memory;
pub mod model;
pub mod neural_memory;
pub mod gradient;

pub use linear_memory::LinearMemory;
pub use memory_store::{MemoryError, MemoryStore, MemoryVariant};
pub use model::{NeuralMemoryConfig, ProjectionParams};
pub use neural_memory::NeuralMemoryUnit;
