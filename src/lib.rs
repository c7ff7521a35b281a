//! Semiring inference over binary constituency trees.
//!
//! Given per-span (optionally per-label) potentials for every substring of a
//! batch of sentences, a [`ConstituencyCrf`] answers, under the induced
//! exponential-family distribution over binary trees:
//! the log partition, the best tree and its score, the k best trees and
//! their scores, span/label marginals, entropy, cross-entropy and KL.
//!
//! All of these come from one inside recursion run under different
//! [`Semiring`]s, plus an explicit outside pass (marginals) or a backtrack
//! (argmax / top-k) over the retained chart.
//!
//! Public invariants (must not change):
//! - Numeric code is deterministic (no RNG in core ops).
//! - Log-space reductions are max-shifted log-sum-exp.
//! - Shapes, lengths and `k` are validated before any recursion runs;
//!   properties of a built distribution are infallible.
//! - Padding beyond a sentence's length never affects its results.

pub mod chart;
pub mod constituency;
pub mod dist;
pub mod error;
pub mod head;
pub mod semiring;

pub use constituency::{chart_mask, charts_from_trees, ConstituencyCrf, Constituent, Tree};
pub use dist::StructuredDistribution;
pub use error::{Error, Result};
pub use semiring::{KMaxSemiring, LogSemiring, MaxSemiring, Semiring};
