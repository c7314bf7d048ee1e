mod error;
mod hash;
mod traits;

pub mod filesystem;

pub use error::StorageError;
pub use hash::{ContentHash, ContentHasher};
pub use traits::{BlobInfo, BlobStore, BoxReader};
