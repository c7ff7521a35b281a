//! Semirings that parameterize the chart recursion.
//!
//! One inside recursion computes many quantities depending on the algebra it
//! runs under:
//!
//! | Semiring | zero | one | plus | times | root value |
//! |---|---|---|---|---|---|
//! | [`LogSemiring`] | \(-\infty\) | 0 | log-sum-exp | + | log partition |
//! | [`MaxSemiring`] | \(-\infty\) | 0 | max | + | best tree score |
//! | [`KMaxSemiring`] | \([-\infty]^k\) | \([0,-\infty,\dots]\) | top-k merge | top-k of pairwise + | k best scores |
//!
//! Entropy and KL do not need their own algebra: they are expectations under
//! the Log marginals (see [`crate::dist`]).

use std::fmt;

use crate::error::{Error, Result};

/// A commutative semiring over chart cells.
///
/// Laws the recursion relies on:
/// - `(E, plus, zero)` is a commutative monoid
/// - `(E, times, one)` is a monoid
/// - `times` distributes over `plus`
/// - `zero` annihilates under `times`
pub trait Semiring {
    /// Value stored in one chart cell.
    type Elem: Clone + fmt::Debug;

    /// What a root cell reads out as.
    type Output;

    /// Identity of `plus`; the weight of "no derivation".
    fn zero(&self) -> Self::Elem;

    /// Identity of `times`; the weight of the empty derivation.
    fn one(&self) -> Self::Elem;

    /// Lift a raw score into the semiring.
    fn convert(&self, score: f64) -> Self::Elem;

    /// Read a cell back out as scores.
    fn unconvert(&self, elem: &Self::Elem) -> Self::Output;

    /// Combine alternative derivations.
    fn plus(&self, a: &Self::Elem, b: &Self::Elem) -> Self::Elem;

    /// Combine sub-derivations sequentially.
    fn times(&self, a: &Self::Elem, b: &Self::Elem) -> Self::Elem;

    /// `plus`-reduction of a batch of values.
    fn sum<'a, I>(&self, values: I) -> Self::Elem
    where
        I: IntoIterator<Item = &'a Self::Elem>,
        Self::Elem: 'a,
    {
        values
            .into_iter()
            .fold(self.zero(), |acc, v| self.plus(&acc, v))
    }

    /// `times`-reduction of a batch of values.
    fn prod<'a, I>(&self, values: I) -> Self::Elem
    where
        I: IntoIterator<Item = &'a Self::Elem>,
        Self::Elem: 'a,
    {
        values
            .into_iter()
            .fold(self.one(), |acc, v| self.times(&acc, v))
    }

    /// Sum over aligned pairs of their products, i.e. one split-point reduction.
    fn dot<'a, I>(&self, pairs: I) -> Self::Elem
    where
        I: IntoIterator<Item = (&'a Self::Elem, &'a Self::Elem)>,
        Self::Elem: 'a,
    {
        pairs
            .into_iter()
            .fold(self.zero(), |acc, (a, b)| self.plus(&acc, &self.times(a, b)))
    }
}

/// Numerically stable \(\log \sum_i e^{x_i}\). Empty or all-\(-\infty\) input gives \(-\infty\).
pub fn log_sum_exp(xs: &[f64]) -> f64 {
    let mut m = f64::NEG_INFINITY;
    for &x in xs {
        if x > m {
            m = x;
        }
    }
    if !m.is_finite() {
        return m;
    }
    let mut s = 0.0;
    for &x in xs {
        s += (x - m).exp();
    }
    m + s.ln()
}

/// Numerically stable \(\log(e^a + e^b)\).
pub fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let m = a.max(b);
    m + (-(a - b).abs()).exp().ln_1p()
}

/// Log-space probabilities: `plus` is log-sum-exp, `times` is addition.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LogSemiring;

impl Semiring for LogSemiring {
    type Elem = f64;
    type Output = f64;

    fn zero(&self) -> f64 {
        f64::NEG_INFINITY
    }

    fn one(&self) -> f64 {
        0.0
    }

    fn convert(&self, score: f64) -> f64 {
        score
    }

    fn unconvert(&self, elem: &f64) -> f64 {
        *elem
    }

    fn plus(&self, a: &f64, b: &f64) -> f64 {
        log_add_exp(*a, *b)
    }

    fn times(&self, a: &f64, b: &f64) -> f64 {
        a + b
    }

    fn sum<'a, I>(&self, values: I) -> f64
    where
        I: IntoIterator<Item = &'a f64>,
    {
        let xs: Vec<f64> = values.into_iter().copied().collect();
        log_sum_exp(&xs)
    }

    fn dot<'a, I>(&self, pairs: I) -> f64
    where
        I: IntoIterator<Item = (&'a f64, &'a f64)>,
    {
        let xs: Vec<f64> = pairs.into_iter().map(|(a, b)| a + b).collect();
        log_sum_exp(&xs)
    }
}

/// Viterbi (max-plus) semiring.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MaxSemiring;

impl Semiring for MaxSemiring {
    type Elem = f64;
    type Output = f64;

    fn zero(&self) -> f64 {
        f64::NEG_INFINITY
    }

    fn one(&self) -> f64 {
        0.0
    }

    fn convert(&self, score: f64) -> f64 {
        score
    }

    fn unconvert(&self, elem: &f64) -> f64 {
        *elem
    }

    fn plus(&self, a: &f64, b: &f64) -> f64 {
        a.max(*b)
    }

    fn times(&self, a: &f64, b: &f64) -> f64 {
        a + b
    }
}

/// K-best max-plus semiring.
///
/// Elements are length-`k` vectors sorted in non-increasing order, padded
/// with \(-\infty\) when fewer than `k` derivations exist.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KMaxSemiring {
    k: usize,
}

impl KMaxSemiring {
    /// Create a k-best semiring. `k` must be at least 1.
    pub fn new(k: usize) -> Result<Self> {
        if k == 0 {
            return Err(Error::InvalidK(k));
        }
        Ok(Self { k })
    }

    /// Number of values tracked per cell.
    pub fn k(&self) -> usize {
        self.k
    }

    fn top_k(&self, mut xs: Vec<f64>) -> Vec<f64> {
        xs.sort_by(|a, b| b.total_cmp(a));
        xs.resize(self.k, f64::NEG_INFINITY);
        xs
    }
}

impl Semiring for KMaxSemiring {
    type Elem = Vec<f64>;
    type Output = Vec<f64>;

    fn zero(&self) -> Vec<f64> {
        vec![f64::NEG_INFINITY; self.k]
    }

    fn one(&self) -> Vec<f64> {
        self.convert(0.0)
    }

    fn convert(&self, score: f64) -> Vec<f64> {
        let mut v = self.zero();
        v[0] = score;
        v
    }

    fn unconvert(&self, elem: &Vec<f64>) -> Vec<f64> {
        elem.clone()
    }

    fn plus(&self, a: &Vec<f64>, b: &Vec<f64>) -> Vec<f64> {
        self.top_k(a.iter().chain(b.iter()).copied().collect())
    }

    fn times(&self, a: &Vec<f64>, b: &Vec<f64>) -> Vec<f64> {
        let mut xs = Vec::with_capacity(a.len() * b.len());
        for &x in a {
            for &y in b {
                xs.push(x + y);
            }
        }
        self.top_k(xs)
    }

    fn sum<'a, I>(&self, values: I) -> Vec<f64>
    where
        I: IntoIterator<Item = &'a Vec<f64>>,
    {
        self.top_k(values.into_iter().flatten().copied().collect())
    }

    fn dot<'a, I>(&self, pairs: I) -> Vec<f64>
    where
        I: IntoIterator<Item = (&'a Vec<f64>, &'a Vec<f64>)>,
    {
        let mut xs = Vec::new();
        for (a, b) in pairs {
            xs.extend(self.times(a, b));
        }
        self.top_k(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn log_sum_exp_survives_large_inputs() {
        let v = log_sum_exp(&[1000.0, 1000.0]);
        assert!((v - (1000.0 + 2f64.ln())).abs() < 1e-9, "v={}", v);
        assert_eq!(log_sum_exp(&[]), f64::NEG_INFINITY);
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY; 3]), f64::NEG_INFINITY);
    }

    #[test]
    fn log_identities() {
        let s = LogSemiring;
        assert_eq!(s.plus(&s.zero(), &1.5), 1.5);
        assert_eq!(s.times(&s.one(), &1.5), 1.5);
        assert_eq!(s.times(&s.zero(), &1.5), f64::NEG_INFINITY);
        assert_eq!(s.sum(std::iter::empty()), f64::NEG_INFINITY);
    }

    #[test]
    fn kmax_times_keeps_best_cross_products() {
        let s = KMaxSemiring::new(2).unwrap();
        let v = s.times(&vec![3.0, 1.0], &vec![2.0, 0.0]);
        assert_eq!(v, vec![5.0, 3.0]);
        let v = s.plus(&vec![3.0, f64::NEG_INFINITY], &vec![4.0, 2.0]);
        assert_eq!(v, vec![4.0, 3.0]);
        assert_eq!(s.times(&s.one(), &vec![4.0, 2.0]), vec![4.0, 2.0]);
    }

    #[test]
    fn kmax_pads_missing_derivations() {
        let s = KMaxSemiring::new(3).unwrap();
        let v = s.sum([s.convert(1.0), s.convert(2.0)].iter());
        assert_eq!(v, vec![2.0, 1.0, f64::NEG_INFINITY]);
    }

    #[test]
    fn prod_folds_times_from_one() {
        let s = LogSemiring;
        assert_eq!(s.prod([1.0, 2.5, -0.5].iter()), 3.0);
        assert_eq!(s.prod(std::iter::empty()), s.one());
        let k = KMaxSemiring::new(2).unwrap();
        let v = k.prod([vec![3.0, 1.0], vec![2.0, 0.0]].iter());
        assert_eq!(k.unconvert(&v), vec![5.0, 3.0]);
        assert_eq!(MaxSemiring.unconvert(&MaxSemiring.prod([1.0, 2.0].iter())), 3.0);
    }

    #[test]
    fn kmax_rejects_zero_k() {
        assert_eq!(KMaxSemiring::new(0), Err(Error::InvalidK(0)));
    }

    proptest! {
        #[test]
        fn log_times_distributes_over_plus(
            a in -20.0f64..20.0,
            b in -20.0f64..20.0,
            c in -20.0f64..20.0
        ) {
            let s = LogSemiring;
            let lhs = s.times(&a, &s.plus(&b, &c));
            let rhs = s.plus(&s.times(&a, &b), &s.times(&a, &c));
            prop_assert!((lhs - rhs).abs() < 1e-9, "lhs={} rhs={}", lhs, rhs);
        }

        #[test]
        fn log_dot_matches_pairwise_fold(
            xs in prop::collection::vec((-30.0f64..30.0, -30.0f64..30.0), 1..12)
        ) {
            let s = LogSemiring;
            let fast = s.dot(xs.iter().map(|(a, b)| (a, b)));
            let slow = xs
                .iter()
                .fold(s.zero(), |acc, (a, b)| s.plus(&acc, &s.times(a, b)));
            prop_assert!((fast - slow).abs() < 1e-9, "fast={} slow={}", fast, slow);
        }

        #[test]
        fn kmax_head_agrees_with_max(
            xs in prop::collection::vec((-5.0f64..5.0, -5.0f64..5.0), 1..8)
        ) {
            let k = KMaxSemiring::new(3).unwrap();
            let lifted: Vec<(Vec<f64>, Vec<f64>)> =
                xs.iter().map(|&(a, b)| (k.convert(a), k.convert(b))).collect();
            let top = k.dot(lifted.iter().map(|(a, b)| (a, b)));
            let best = MaxSemiring.dot(xs.iter().map(|(a, b)| (a, b)));
            prop_assert_eq!(top[0], best);
            prop_assert!(top.windows(2).all(|w| w[0] >= w[1]));
        }
    }
}
