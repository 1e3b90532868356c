//! I/O utilities
//!
//! Currently a single concern: the bidirectional byte pipe used to bridge an
//! accepted client connection with its outbound counterpart.

mod copy;

pub use copy::{pipe, pipe_with_buffer, PipeSummary, DEFAULT_BUFFER_SIZE};
