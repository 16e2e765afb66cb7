mod blob;
mod error;
mod session;

pub use blob::{Blob, BlobStore, PayloadHandle};
pub use error::{FailureKind, TransferError};
pub use session::{start_download_from, Session, SessionBuilder, TransferOptions, DEFAULT_CONNECT_TIMEOUT};

#[cfg(feature = "render_progress")]
pub use session::Progress;
