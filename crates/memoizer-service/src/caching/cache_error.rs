use thiserror::Error;

/// Errors raised by the cache itself, as opposed to errors produced by a
/// [`Factory`](super::Factory).
///
/// Factory errors are never wrapped in this type; they are handed to the caller as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheError {
    /// A batch lookup was requested without any keys.
    #[error("at least one key is required")]
    NoKeys,
}
