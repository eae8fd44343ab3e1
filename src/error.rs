use thiserror::Error;

/// Every failure the filesystem core can surface.
///
/// `Integrity` and `DoubleFree` poison the mount: once observed, every
/// further operation on the same mount fails with the same kind. All
/// other kinds leave the on-disk structures consistent.
#[derive(Debug, Error)]
pub enum FsError {
    /// Superblock or encrypted header is malformed.
    #[error("bad on-disk format: {0}")]
    Format(String),

    /// The image was written by an unsupported format version.
    #[error("unsupported format version {0}")]
    Version(u16),

    /// The password does not match this image.
    #[error("wrong password")]
    Auth,

    /// Authentication tag mismatch: the image is corrupt or tampered.
    #[error("integrity check failed")]
    Integrity,

    /// Block or inode bitmap is exhausted.
    #[error("no space left ({0})")]
    NoSpace(&'static str),

    /// A logical block index exceeds the addressable ceiling.
    #[error("file exceeds the maximum addressable size")]
    FileTooLarge,

    #[error("no such entry")]
    NotFound,

    #[error("entry already exists")]
    Exists,

    #[error("target is a directory")]
    IsDir,

    #[error("target is not a directory")]
    NotDir,

    #[error("directory is not empty")]
    NotEmpty,

    /// Moving a directory into itself or one of its descendants.
    #[error("rename would create a directory loop")]
    Loop,

    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Operation not permitted by the handle's open mode (or the
    /// handle/mount is already closed).
    #[error("operation not permitted in this mode")]
    BadMode,

    #[error("offset {0} is not addressable")]
    BadOffset(i64),

    #[error("buffer holds {found} bytes, block size is {expected}")]
    BadSize { expected: usize, found: usize },

    #[error("block {block} is beyond device end {limit}")]
    OutOfRange { block: u64, limit: u64 },

    #[error("device I/O failed")]
    Io(#[from] std::io::Error),

    /// An allocator bit was cleared twice; the image is corrupt.
    #[error("double free of index {0}")]
    DoubleFree(u32),

    /// Another process holds the advisory lock on the backing file.
    #[error("device is already mounted")]
    AlreadyMounted,
}

pub type Result<T> = std::result::Result<T, FsError>;
