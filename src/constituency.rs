//! Constituency tree CRF (Zhang et al. 2020; Stern et al. 2017 framing).
//!
//! A binary tree over a sentence of length `L` is a set of `2L - 1` nested
//! spans `(i, j)`, `0 <= i < j <= L`, containing the root `(0, L)` and every
//! width-1 span. Its score is the sum of its span potentials. With labels,
//! every span also picks one label and contributes that label's potential.
//!
//! The inside recursion, for any semiring \((\oplus, \otimes)\):
//! \[
//! \beta_{i,i+1} = \bigoplus_\ell s_{i,i+1,\ell}, \qquad
//! \beta_{i,j} = \Big(\bigoplus_{i<k<j} \beta_{i,k} \otimes \beta_{k,j}\Big) \otimes \bigoplus_\ell s_{i,j,\ell}.
//! \]
//! The root \(\beta_{0,L}\) is the log partition (Log), the best score (Max)
//! or the k best scores (K-Max).
//!
//! Structures are read back without a differentiation engine:
//! - marginals come from an explicit log-space outside pass,
//!   \(\mu_{i,j} = \exp(\beta_{i,j} + \alpha_{i,j} - \log Z)\);
//! - argmax and top-k backtrack through the retained Max / K-Max charts.

use std::cell::OnceCell;
use std::fmt;

use ndarray::{Array1, Array3, Array4, ArrayD, Axis, Ix3, Ix4};

use crate::chart::Chart;
use crate::dist::StructuredDistribution;
use crate::error::{Error, Result};
use crate::semiring::{log_add_exp, KMaxSemiring, LogSemiring, MaxSemiring, Semiring};

/// One span of a decoded tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Constituent {
    /// First position covered.
    pub start: usize,
    /// One past the last position covered.
    pub end: usize,
    /// Chosen label, `None` for unlabeled distributions.
    pub label: Option<usize>,
}

/// Spans of one tree, sorted by `(start, end, label)`.
pub type Tree = Vec<Constituent>;

/// Label-reduced potentials and the finished inside chart of one run.
#[derive(Debug, Clone)]
struct Inside<E> {
    potentials: Chart<E>,
    chart: Chart<E>,
}

/// Distribution over binary constituency trees of a batch of sentences.
///
/// Immutable once built; each property runs at most one recursion per
/// semiring and caches the result.
#[derive(Debug, Clone)]
pub struct ConstituencyCrf {
    scores: Array4<f64>,
    lens: Array1<usize>,
    mask: Array3<bool>,
    label: bool,
    log_inside: OnceCell<Inside<f64>>,
    max_inside: OnceCell<Inside<f64>>,
    log_partition: OnceCell<Array1<f64>>,
    max: OnceCell<Array1<f64>>,
    marginals: OnceCell<Array4<f64>>,
    argmax: OnceCell<Vec<Tree>>,
}

impl ConstituencyCrf {
    /// Unlabeled CRF from span scores `[batch, n, n]`.
    ///
    /// `lens` defaults to `n - 1` for every sentence.
    pub fn new(scores: Array3<f64>, lens: Option<Array1<usize>>) -> Result<Self> {
        Self::build(scores.insert_axis(Axis(3)), lens, false)
    }

    /// Labeled CRF from span-label scores `[batch, n, n, n_labels]`.
    ///
    /// The label axis is reduced with the semiring before the structural
    /// recursion, so trees and label choices are scored jointly.
    pub fn labeled(scores: Array4<f64>, lens: Option<Array1<usize>>) -> Result<Self> {
        if scores.len_of(Axis(3)) == 0 {
            return Err(Error::NoLabels);
        }
        Self::build(scores, lens, true)
    }

    /// Rank-checked constructor: rank 4 when `label`, rank 3 otherwise.
    pub fn from_dyn(scores: ArrayD<f64>, lens: Option<Array1<usize>>, label: bool) -> Result<Self> {
        let expected = if label { 4 } else { 3 };
        let got = scores.ndim();
        let rank = |_: ndarray::ShapeError| Error::InvalidRank { expected, got };
        if label {
            Self::labeled(scores.into_dimensionality::<Ix4>().map_err(rank)?, lens)
        } else {
            Self::new(scores.into_dimensionality::<Ix3>().map_err(rank)?, lens)
        }
    }

    fn build(scores: Array4<f64>, lens: Option<Array1<usize>>, label: bool) -> Result<Self> {
        let (batch, rows, cols, n_labels) = scores.dim();
        if rows != cols {
            return Err(Error::NonSquareChart { rows, cols });
        }
        let n = rows;
        let lens = match lens {
            Some(lens) if lens.len() != batch => {
                return Err(Error::ShapeMismatch {
                    what: "lens",
                    expected: vec![batch],
                    got: vec![lens.len()],
                })
            }
            Some(lens) => lens,
            None => Array1::from_elem(batch, n.saturating_sub(1)),
        };
        if let Some((b, &len)) = lens.iter().enumerate().find(|&(_, &len)| len >= n) {
            return Err(Error::LengthOutOfBounds {
                batch: b,
                len,
                seq_len: n,
            });
        }
        let mask = chart_mask(&lens, n);
        log::debug!(
            "constituency crf: batch={} seq_len={} labels={} labeled={}",
            batch,
            n,
            n_labels,
            label
        );
        Ok(Self {
            scores,
            lens,
            mask,
            label,
            log_inside: OnceCell::new(),
            max_inside: OnceCell::new(),
            log_partition: OnceCell::new(),
            max: OnceCell::new(),
            marginals: OnceCell::new(),
            argmax: OnceCell::new(),
        })
    }

    /// Whether the label axis is reduced inside the recursion.
    pub fn is_labeled(&self) -> bool {
        self.label
    }

    /// Number of sentences.
    pub fn batch_size(&self) -> usize {
        self.scores.len_of(Axis(0))
    }

    /// Positions per chart axis (`max length + 1`).
    pub fn seq_len(&self) -> usize {
        self.scores.len_of(Axis(1))
    }

    /// Size of the label axis (1 when unlabeled).
    pub fn n_labels(&self) -> usize {
        self.scores.len_of(Axis(3))
    }

    /// Span marginals `[batch, n, n]`, label axis summed out.
    ///
    /// These are the scores used for minimum-Bayes-risk decoding.
    pub fn span_marginals(&self) -> Array3<f64> {
        self.marginals().sum_axis(Axis(3))
    }

    fn inside<S: Semiring>(&self, semiring: &S) -> Inside<S::Elem> {
        let (batch, n, _, n_labels) = self.scores.dim();
        let mut potentials = Chart::filled(n, batch, semiring.zero());
        for b in 0..batch {
            for i in 0..n {
                for j in i + 1..n {
                    *potentials.get_mut(i, j, b) = if self.label {
                        let converted: Vec<S::Elem> = (0..n_labels)
                            .map(|l| semiring.convert(self.scores[[b, i, j, l]]))
                            .collect();
                        semiring.sum(&converted)
                    } else {
                        semiring.convert(self.scores[[b, i, j, 0]])
                    };
                }
            }
        }

        let mut chart = Chart::filled(n, batch, semiring.zero());
        chart
            .diagonal_mut(1)
            .assign(potentials.diagonal(1).iter().cloned());
        for w in 2..n {
            let fresh = {
                let (left, right) = (chart.left_stripe(w), chart.right_stripe(w));
                let base = potentials.diagonal(w);
                let mut fresh = Vec::with_capacity(base.len() * batch);
                for i in 0..base.len() {
                    for b in 0..batch {
                        let splits = semiring.dot(left.row(i, b).zip(right.row(i, b)));
                        fresh.push(semiring.times(&splits, base.get(i, b)));
                    }
                }
                fresh
            };
            chart.diagonal_mut(w).assign(fresh);
        }
        log::trace!("inside pass: {} widths, {} sentences", n.saturating_sub(1), batch);
        Inside { potentials, chart }
    }

    fn roots<E: Clone>(&self, chart: &Chart<E>, one: E) -> Vec<E> {
        self.lens
            .iter()
            .enumerate()
            .map(|(b, &len)| {
                if len == 0 {
                    one.clone()
                } else {
                    chart.get(0, len, b).clone()
                }
            })
            .collect()
    }

    fn log_inside(&self) -> &Inside<f64> {
        self.log_inside.get_or_init(|| self.inside(&LogSemiring))
    }

    fn max_inside(&self) -> &Inside<f64> {
        self.max_inside.get_or_init(|| self.inside(&MaxSemiring))
    }

    /// Log-space outside pass; returns part marginals.
    fn outside(&self, inside: &Inside<f64>) -> Array4<f64> {
        let (batch, n, _, n_labels) = self.scores.dim();
        let (beta, base) = (&inside.chart, &inside.potentials);

        let mut alpha = Chart::filled(n, batch, f64::NEG_INFINITY);
        for (b, &len) in self.lens.iter().enumerate() {
            if len > 0 {
                *alpha.get_mut(0, len, b) = 0.0;
            }
        }
        // Every parent is wider than its children, so widths descend.
        for w in (2..n).rev() {
            let (left, right) = (beta.left_stripe(w), beta.right_stripe(w));
            for i in 0..n - w {
                let j = i + w;
                for (b, &len) in self.lens.iter().enumerate() {
                    let parent = *alpha.get(i, j, b);
                    if j > len || parent == f64::NEG_INFINITY {
                        continue;
                    }
                    let parent = parent + base.get(i, j, b);
                    for (split, (l, r)) in left.row(i, b).zip(right.row(i, b)).enumerate() {
                        let k = i + split + 1;
                        let a = alpha.get_mut(i, k, b);
                        *a = log_add_exp(*a, parent + r);
                        let a = alpha.get_mut(k, j, b);
                        *a = log_add_exp(*a, parent + l);
                    }
                }
            }
        }

        let mut marginals = Array4::<f64>::zeros(self.scores.raw_dim());
        for (b, &len) in self.lens.iter().enumerate() {
            if len == 0 {
                continue;
            }
            let log_z = *beta.get(0, len, b);
            if !log_z.is_finite() {
                continue;
            }
            for i in 0..len {
                for j in i + 1..=len {
                    let span = (beta.get(i, j, b) + alpha.get(i, j, b) - log_z).exp();
                    if span == 0.0 {
                        continue;
                    }
                    if self.label {
                        let reduced = *base.get(i, j, b);
                        for l in 0..n_labels {
                            let p = (self.scores[[b, i, j, l]] - reduced).exp();
                            marginals[[b, i, j, l]] = span * p;
                        }
                    } else {
                        marginals[[b, i, j, 0]] = span;
                    }
                }
            }
        }
        log::trace!("outside pass: {} sentences", batch);
        marginals
    }

    fn best_label(&self, b: usize, i: usize, j: usize) -> Option<usize> {
        if !self.label {
            return None;
        }
        let mut best = 0;
        for l in 1..self.n_labels() {
            if self.scores[[b, i, j, l]] > self.scores[[b, i, j, best]] {
                best = l;
            }
        }
        Some(best)
    }

    /// Follow the first maximizing split of every span down from the root.
    fn best_tree(&self, chart: &Chart<f64>, b: usize) -> Tree {
        let len = self.lens[b];
        let mut tree = Vec::new();
        if len == 0 {
            return tree;
        }
        let mut stack = vec![(0, len)];
        while let Some((i, j)) = stack.pop() {
            tree.push(Constituent {
                start: i,
                end: j,
                label: self.best_label(b, i, j),
            });
            if j - i < 2 {
                continue;
            }
            let mut best = (i + 1, f64::NEG_INFINITY);
            for k in i + 1..j {
                let v = chart.get(i, k, b) + chart.get(k, j, b);
                if v > best.1 {
                    best = (k, v);
                }
            }
            stack.push((best.0, j));
            stack.push((i, best.0));
        }
        tree.sort_unstable();
        tree
    }

    /// At most `k` labels of a span, best first.
    fn ranked_labels(&self, b: usize, i: usize, j: usize, k: usize) -> Vec<(Option<usize>, f64)> {
        if !self.label {
            return vec![(None, self.scores[[b, i, j, 0]])];
        }
        let mut labels: Vec<(Option<usize>, f64)> = (0..self.n_labels())
            .map(|l| (Some(l), self.scores[[b, i, j, l]]))
            .collect();
        labels.sort_by(|x, y| y.1.total_cmp(&x.1));
        labels.truncate(k);
        labels
    }

    /// Expand the `rank`-th best derivation of the root from a K-Max chart.
    ///
    /// At each span every `(split, left rank, right rank, label rank)`
    /// combination is ranked; the stable sort keeps distinct ranks mapped
    /// to distinct derivations.
    fn kth_tree(&self, chart: &Chart<Vec<f64>>, b: usize, rank: usize, k: usize) -> Tree {
        let mut tree = Vec::new();
        let mut stack = vec![(0, self.lens[b], rank)];
        while let Some((i, j, r)) = stack.pop() {
            let labels = self.ranked_labels(b, i, j, k);
            if j - i == 1 {
                if let Some(&(label, _)) = labels.get(r) {
                    tree.push(Constituent { start: i, end: j, label });
                }
                continue;
            }
            let mut candidates = Vec::new();
            for split in i + 1..j {
                for (a, x) in chart.get(i, split, b).iter().enumerate() {
                    for (c, y) in chart.get(split, j, b).iter().enumerate() {
                        let v = x + y;
                        if v == f64::NEG_INFINITY {
                            continue;
                        }
                        for (q, &(_, t)) in labels.iter().enumerate() {
                            candidates.push((v + t, split, a, c, q));
                        }
                    }
                }
            }
            candidates.sort_by(|x, y| y.0.total_cmp(&x.0));
            let Some(&(_, split, a, c, q)) = candidates.get(r) else {
                continue;
            };
            tree.push(Constituent {
                start: i,
                end: j,
                label: labels[q].0,
            });
            stack.push((split, j, c));
            stack.push((i, split, a));
        }
        tree.sort_unstable();
        tree
    }
}

impl StructuredDistribution for ConstituencyCrf {
    type Structure = Tree;

    fn potentials(&self) -> &Array4<f64> {
        &self.scores
    }

    fn lens(&self) -> &Array1<usize> {
        &self.lens
    }

    fn mask(&self) -> &Array3<bool> {
        &self.mask
    }

    fn forward<S: Semiring>(&self, semiring: &S) -> Vec<S::Output> {
        let inside = self.inside(semiring);
        self.roots(&inside.chart, semiring.one())
            .iter()
            .map(|root| semiring.unconvert(root))
            .collect()
    }

    fn log_partition(&self) -> &Array1<f64> {
        self.log_partition.get_or_init(|| {
            let roots = self.roots(&self.log_inside().chart, LogSemiring.one());
            roots.iter().map(|root| LogSemiring.unconvert(root)).collect()
        })
    }

    fn marginals(&self) -> &Array4<f64> {
        self.marginals
            .get_or_init(|| self.outside(self.log_inside()))
    }

    fn max(&self) -> &Array1<f64> {
        self.max.get_or_init(|| {
            let roots = self.roots(&self.max_inside().chart, MaxSemiring.one());
            roots.iter().map(|root| MaxSemiring.unconvert(root)).collect()
        })
    }

    fn argmax(&self) -> &[Tree] {
        self.argmax.get_or_init(|| {
            let chart = &self.max_inside().chart;
            (0..self.batch_size()).map(|b| self.best_tree(chart, b)).collect()
        })
    }

    fn topk(&self, k: usize) -> Result<Vec<Vec<Tree>>> {
        let semiring = KMaxSemiring::new(k)?;
        let chart = self.inside(&semiring).chart;
        let trees = self
            .lens
            .iter()
            .enumerate()
            .map(|(b, &len)| {
                (0..k)
                    .map(|r| {
                        if len == 0 || chart.get(0, len, b)[r] == f64::NEG_INFINITY {
                            Vec::new()
                        } else {
                            self.kth_tree(&chart, b, r, k)
                        }
                    })
                    .collect()
            })
            .collect();
        Ok(trees)
    }

    fn score(&self, value: &Array3<i64>) -> Result<Array1<f64>> {
        let (batch, n, n_labels) = (self.batch_size(), self.seq_len(), self.n_labels());
        if value.dim() != (batch, n, n) {
            return Err(Error::ShapeMismatch {
                what: "value",
                expected: vec![batch, n, n],
                got: value.shape().to_vec(),
            });
        }
        let mask = self.mask();
        let mut parts: Vec<Vec<f64>> = vec![Vec::new(); batch];
        for ((b, i, j), &v) in value.indexed_iter() {
            if v < 0 || !mask[[b, i, j]] {
                continue;
            }
            let l = if self.is_labeled() {
                usize::try_from(v)
                    .ok()
                    .filter(|&l| l < n_labels)
                    .ok_or(Error::LabelOutOfRange {
                        batch: b,
                        start: i,
                        end: j,
                        label: v,
                        n_labels,
                    })?
            } else {
                0
            };
            parts[b].push(self.scores[[b, i, j, l]]);
        }
        Ok(parts.iter().map(|p| LogSemiring.prod(p)).collect())
    }
}

impl fmt::Display for ConstituencyCrf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConstituencyCrf(label={})", self.is_labeled())
    }
}

/// Validity mask `[batch, seq_len, seq_len]`: span `(i, j)` of sentence `b`
/// is valid iff `i < j <= lens[b]`.
pub fn chart_mask(lens: &Array1<usize>, seq_len: usize) -> Array3<bool> {
    Array3::from_shape_fn((lens.len(), seq_len, seq_len), |(b, i, j)| {
        i < j && j <= lens[b]
    })
}

/// Encode trees as gold charts `[batch, seq_len, seq_len]`, `-1` off-tree.
///
/// Unlabeled constituents are encoded with label `0`.
pub fn charts_from_trees(trees: &[Tree], seq_len: usize) -> Result<Array3<i64>> {
    let mut charts = Array3::from_elem((trees.len(), seq_len, seq_len), -1);
    for (b, tree) in trees.iter().enumerate() {
        for c in tree {
            if c.start >= c.end || c.end >= seq_len {
                return Err(Error::InvalidSpan {
                    batch: b,
                    start: c.start,
                    end: c.end,
                    seq_len,
                });
            }
            charts[[b, c.start, c.end]] = c.label.map_or(0, |l| l as i64);
        }
    }
    Ok(charts)
}
