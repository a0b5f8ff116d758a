//! Streaming archive uploader for Amazon Glacier.
//!
//! Bytes of unknown total length go in through an [`archive::ArchiveWriter`];
//! fixed-size parts come out over the wire as they fill, each carrying its
//! SHA-256 tree-hash root, and closing the writer completes the archive with
//! the whole-archive root and total size.

pub mod archive;
pub mod buf;
pub mod hash;
pub mod transport;
pub mod upload;

pub use archive::{ArchiveReceipt, ArchiveWriter};
pub use upload::{MultipartSession, RetryPolicy, UploadError};
