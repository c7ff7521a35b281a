//! Errors for tree CRF construction and scoring.
//!
//! Every variant is a contract violation detected before any recursion runs.
//! Once a distribution is built, its properties cannot fail.

/// Errors for tree CRF operators.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Score tensor rank does not agree with the label flag.
    #[error("scores must have rank {expected}, got rank {got}")]
    InvalidRank {
        /// Rank implied by the label flag (3 unlabeled, 4 labeled).
        expected: usize,
        /// Rank of the provided tensor.
        got: usize,
    },
    /// The two position axes of a chart differ.
    #[error("chart must be square over positions, got {rows}x{cols}")]
    NonSquareChart {
        /// Length of the start-position axis.
        rows: usize,
        /// Length of the end-position axis.
        cols: usize,
    },
    /// An auxiliary tensor does not match the score tensor.
    #[error("{what} has shape {got:?}, expected {expected:?}")]
    ShapeMismatch {
        /// Which argument is malformed.
        what: &'static str,
        /// Shape required by the scores.
        expected: Vec<usize>,
        /// Shape actually provided.
        got: Vec<usize>,
    },
    /// A sentence length does not fit the chart.
    #[error("sentence {batch} has length {len}, which does not fit a chart of {seq_len} positions")]
    LengthOutOfBounds {
        /// Batch index of the offending sentence.
        batch: usize,
        /// Its declared length.
        len: usize,
        /// Position dimension of the chart.
        seq_len: usize,
    },
    /// A tree refers to a span that is empty, reversed, or past the chart.
    #[error("span ({start}, {end}) of sentence {batch} is not a valid span of a {seq_len}-position chart")]
    InvalidSpan {
        /// Batch index.
        batch: usize,
        /// Span start.
        start: usize,
        /// Span end.
        end: usize,
        /// Position dimension of the chart.
        seq_len: usize,
    },
    /// `k` for k-best inference must be at least 1.
    #[error("k must be at least 1, got {0}")]
    InvalidK(usize),
    /// A gold chart refers to a label the scores do not have.
    #[error("label {label} at span ({start}, {end}) of sentence {batch} is out of range for {n_labels} labels")]
    LabelOutOfRange {
        /// Batch index.
        batch: usize,
        /// Span start.
        start: usize,
        /// Span end.
        end: usize,
        /// Offending label id.
        label: i64,
        /// Size of the label axis.
        n_labels: usize,
    },
    /// Labeled scores with an empty label axis.
    #[error("labeled scores need at least one label")]
    NoLabels,
    /// Two distributions cannot be compared.
    #[error("distributions disagree on {0}")]
    Incompatible(&'static str),
}

/// Convenience result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
