use crate::deps::thiserror;

/// Every fallible surface the engine exposes to its callers funnels through
/// this enum. `startwrite`/`endwrite` never return it: I/O failures on the
/// data path are absorbed into the kick path (see `storage::attr`) and
/// surfaced later through `Bitmap::is_stale`.
#[derive(thiserror::Error, Debug)]
pub enum BitmapError {
    #[error("page allocation failed")]
    OutOfMemory,

    #[error("an io error occurred: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("invalid bitmap image: {reason}")]
    InvalidImage { reason: String },

    #[error("write would overlap data or external metadata")]
    AlignmentViolation,

    #[error("counter overflow")]
    Overflow,

    #[error("operation refused: {reason}")]
    Busy { reason: String },

    #[error("cluster lock error: {0}")]
    ClusterLock(String),

    #[error("parsing {typename} from {value:?}, reason: {reason:}")]
    Parse {
        value: String,
        typename: &'static str,
        reason: String,
    },

    #[error("page index {index} out of range (0..{pages})")]
    NoSuchPage { index: usize, pages: usize },
}

pub type Result<T> = std::result::Result<T, BitmapError>;
