use super::range::Range;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CoverageError {
    /// The argument range escapes the covering's domain.
    #[error("range {range:?} outside domain {domain:?}")]
    OutOfDomain { range: Range, domain: Range },
}
