//! Exponential-family distributions over discrete structures.
//!
//! A structure \(y\) made of parts \(p \in y\) with potentials \(s_p\) has
//! probability
//! \[
//! P(y) = \frac{\exp\sum_{p \in y} s_p}{Z}, \qquad \log Z = \text{forward}(\text{Log}).
//! \]
//!
//! Implementors supply the recursion (`forward`) and its reverse pass
//! (`marginals`, `argmax`, `topk`); everything else here is derived from
//! those. In particular
//! \[
//! \frac{\partial \log Z}{\partial s_p} = \mathbb{P}(p \in y) = \mu_p,
//! \]
//! which turns entropy and cross-entropy into inner products with the
//! marginals:
//! \[
//! H(P) = \log Z_P - \langle \mu_P, s_P \rangle, \qquad
//! H(P, Q) = \log Z_Q - \langle \mu_P, s_Q \rangle.
//! \]

use ndarray::{Array1, Array2, Array3, Array4, Axis};

use crate::error::{Error, Result};
use crate::semiring::{KMaxSemiring, Semiring};

/// A distribution over structures scored by per-part potentials.
///
/// Potentials are laid out `[batch, n, n, n_labels]`; unlabeled
/// distributions use a unit label axis.
pub trait StructuredDistribution {
    /// Decoded structure for one sentence.
    type Structure;

    /// Raw potentials, `[batch, n, n, n_labels]`.
    fn potentials(&self) -> &Array4<f64>;

    /// Sentence lengths, `[batch]`.
    fn lens(&self) -> &Array1<usize>;

    /// Valid parts, `[batch, n, n]`.
    fn mask(&self) -> &Array3<bool>;

    /// Run the recursion under `semiring`; one unconverted root value per
    /// sentence.
    fn forward<S: Semiring>(&self, semiring: &S) -> Vec<S::Output>;

    /// \(\log Z\) per sentence.
    fn log_partition(&self) -> &Array1<f64>;

    /// \(\partial \log Z / \partial s\): part marginals, zero outside the mask.
    fn marginals(&self) -> &Array4<f64>;

    /// Best structure score per sentence.
    fn max(&self) -> &Array1<f64>;

    /// Best structure per sentence.
    fn argmax(&self) -> &[Self::Structure];

    /// `k` best structures per sentence, `[batch][k]`.
    fn topk(&self, k: usize) -> Result<Vec<Vec<Self::Structure>>>;

    /// Unnormalized score of the parts flagged in `value` (`-1` = absent).
    fn score(&self, value: &Array3<i64>) -> Result<Array1<f64>>;

    /// `k` best structure scores, `[k, batch]`, non-increasing along `k`.
    fn kmax(&self, k: usize) -> Result<Array2<f64>> {
        let semiring = KMaxSemiring::new(k)?;
        let roots = self.forward(&semiring);
        Ok(Array2::from_shape_fn((k, roots.len()), |(r, b)| roots[b][r]))
    }

    /// `score(value) - log_partition`.
    fn log_prob(&self, value: &Array3<i64>) -> Result<Array1<f64>> {
        Ok(self.score(value)? - self.log_partition())
    }

    /// Gibbs entropy per sentence.
    fn entropy(&self) -> Array1<f64> {
        self.log_partition() - &expected_potential(self, self.potentials())
    }

    /// \(H(P, Q) = -\mathbb{E}_P[\log Q]\) with `self` as \(P\).
    fn cross_entropy(&self, other: &Self) -> Result<Array1<f64>> {
        ensure_compatible(self, other)?;
        Ok(other.log_partition() - &expected_potential(self, other.potentials()))
    }

    /// \(\mathrm{KL}(P \| Q)\) with `self` as \(P\).
    fn kl(&self, other: &Self) -> Result<Array1<f64>> {
        Ok(self.cross_entropy(other)? - &self.entropy())
    }
}

fn ensure_compatible<D>(a: &D, b: &D) -> Result<()>
where
    D: StructuredDistribution + ?Sized,
{
    if a.potentials().shape() != b.potentials().shape() {
        return Err(Error::Incompatible("potential shape"));
    }
    if a.lens() != b.lens() {
        return Err(Error::Incompatible("sentence lengths"));
    }
    Ok(())
}

/// \(\langle \mu, s \rangle\) per sentence. Parts with zero marginal are
/// skipped so padding potentials never enter the sum.
fn expected_potential<D>(dist: &D, potentials: &Array4<f64>) -> Array1<f64>
where
    D: StructuredDistribution + ?Sized,
{
    let marginals = dist.marginals();
    Array1::from_shape_fn(marginals.len_of(Axis(0)), |b| {
        let mut acc = 0.0;
        for ((i, j, l), &p) in marginals.index_axis(Axis(0), b).indexed_iter() {
            if p > 0.0 {
                acc += p * potentials[[b, i, j, l]];
            }
        }
        acc
    })
}
