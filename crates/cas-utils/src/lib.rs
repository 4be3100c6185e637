pub mod date;
pub mod error;
pub mod lockfile;
pub mod progress;
pub mod tempfile;

// Re-export core types at crate root for convenience
pub use bstr::{BStr, BString, ByteSlice, ByteVec};
pub use error::{LockError, UtilError};

pub type Result<T> = std::result::Result<T, UtilError>;