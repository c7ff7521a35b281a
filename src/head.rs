//! Span/label head: training loss and decoding on top of [`ConstituencyCrf`].
//!
//! A scorer emits two tensors per batch:
//! - `s_span` `[batch, n, n]`: potential of each span being a constituent;
//! - `s_label` `[batch, n, n, n_labels]`: potential of each label on a span.
//!
//! Structure and labels are decoupled. The tree distribution is built from
//! `s_span` alone, labels are a per-span classification restricted to gold
//! constituents during training and picked greedily when decoding.
//!
//! With `mbr = true`, [`loss`] also returns span marginals; passing those as
//! `s_span` to [`decode`] gives minimum-Bayes-risk trees.

use ndarray::{s, Array1, Array3, Array4, Axis};

use crate::constituency::{ConstituencyCrf, Constituent, Tree};
use crate::dist::StructuredDistribution;
use crate::error::{Error, Result};
use crate::semiring::log_sum_exp;

/// Output of [`loss`].
#[derive(Debug, Clone, PartialEq)]
pub struct Loss {
    /// `span + label`.
    pub total: f64,
    /// Tree negative log-likelihood per token.
    pub span: f64,
    /// Mean label cross-entropy over gold constituents.
    pub label: f64,
    /// Span marginals when `mbr`, otherwise a copy of `s_span`.
    pub span_probs: Array3<f64>,
}

/// Sentence lengths from a chart mask: valid cells in row 0.
pub fn lens_from_mask(mask: &Array3<bool>) -> Array1<usize> {
    mask.index_axis(Axis(1), 0)
        .map_axis(Axis(1), |row| row.iter().filter(|&&m| m).count())
}

fn check_shapes(s_span: &Array3<f64>, s_label: &Array4<f64>, mask: &Array3<bool>) -> Result<()> {
    let (batch, rows, cols) = s_span.dim();
    if rows != cols {
        return Err(Error::NonSquareChart { rows, cols });
    }
    let (lb, li, lj, n_labels) = s_label.dim();
    if (lb, li, lj) != (batch, rows, cols) {
        return Err(Error::ShapeMismatch {
            what: "s_label",
            expected: vec![batch, rows, cols, n_labels],
            got: s_label.shape().to_vec(),
        });
    }
    if n_labels == 0 {
        return Err(Error::NoLabels);
    }
    if mask.shape() != s_span.shape() {
        return Err(Error::ShapeMismatch {
            what: "mask",
            expected: s_span.shape().to_vec(),
            got: mask.shape().to_vec(),
        });
    }
    Ok(())
}

/// Span CRF loss plus label cross-entropy.
///
/// `charts` holds the gold label of every gold constituent and `-1`
/// elsewhere.
pub fn loss(
    s_span: &Array3<f64>,
    s_label: &Array4<f64>,
    charts: &Array3<i64>,
    mask: &Array3<bool>,
    mbr: bool,
) -> Result<Loss> {
    check_shapes(s_span, s_label, mask)?;
    let lens = lens_from_mask(mask);
    let tokens: usize = lens.sum();
    let dist = ConstituencyCrf::new(s_span.clone(), Some(lens))?;
    let log_prob = dist.log_prob(charts)?;
    let span = if tokens == 0 {
        0.0
    } else {
        -log_prob.sum() / tokens as f64
    };

    let n_labels = s_label.len_of(Axis(3));
    let (mut nll, mut count) = (0.0, 0usize);
    for ((b, i, j), &gold) in charts.indexed_iter() {
        if gold < 0 || !mask[[b, i, j]] {
            continue;
        }
        let gold = usize::try_from(gold)
            .ok()
            .filter(|&l| l < n_labels)
            .ok_or(Error::LabelOutOfRange {
                batch: b,
                start: i,
                end: j,
                label: gold,
                n_labels,
            })?;
        let logits = s_label.slice(s![b, i, j, ..]);
        nll += log_sum_exp(&logits.to_vec()) - logits[gold];
        count += 1;
    }
    let label = if count == 0 { 0.0 } else { nll / count as f64 };

    let span_probs = if mbr {
        dist.span_marginals()
    } else {
        s_span.clone()
    };
    log::debug!(
        "loss: span={:.4} label={:.4} ({} tokens, {} gold constituents)",
        span,
        label,
        tokens,
        count
    );
    Ok(Loss {
        total: span + label,
        span,
        label,
        span_probs,
    })
}

/// Best tree per sentence with the best label on each of its spans.
pub fn decode(
    s_span: &Array3<f64>,
    s_label: &Array4<f64>,
    mask: &Array3<bool>,
) -> Result<Vec<Tree>> {
    check_shapes(s_span, s_label, mask)?;
    let dist = ConstituencyCrf::new(s_span.clone(), Some(lens_from_mask(mask)))?;
    let trees = dist
        .argmax()
        .iter()
        .enumerate()
        .map(|(b, tree)| {
            tree.iter()
                .map(|c| Constituent {
                    label: Some(best_label(s_label, b, c.start, c.end)),
                    ..*c
                })
                .collect()
        })
        .collect();
    Ok(trees)
}

fn best_label(s_label: &Array4<f64>, b: usize, i: usize, j: usize) -> usize {
    let logits = s_label.slice(s![b, i, j, ..]);
    let mut best = 0;
    for (l, &x) in logits.iter().enumerate() {
        if x > logits[best] {
            best = l;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constituency::chart_mask;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn gold_charts() -> Array3<i64> {
        let mut charts = Array3::from_elem((2, 5, 5), -1);
        for &(i, j, l) in &[(0, 1, 0), (0, 3, 1), (1, 2, 2), (1, 3, 0), (2, 3, 1)] {
            charts[[0, i, j]] = l;
        }
        let second = [(0, 1, 1), (0, 2, 0), (0, 4, 2), (1, 2, 1), (2, 3, 0), (2, 4, 2), (3, 4, 1)];
        for &(i, j, l) in &second {
            charts[[1, i, j]] = l;
        }
        charts
    }

    fn scores(seed: u64) -> (Array3<f64>, Array4<f64>, Array3<bool>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let s_span = Array3::from_shape_fn((2, 5, 5), |_| rng.gen_range(-1.0..1.0));
        let s_label = Array4::from_shape_fn((2, 5, 5, 3), |_| rng.gen_range(-1.0..1.0));
        (s_span, s_label, chart_mask(&Array1::from(vec![3, 4]), 5))
    }

    #[test]
    fn lens_are_read_from_the_first_row() {
        let mask = chart_mask(&Array1::from(vec![0, 3, 4]), 5);
        assert_eq!(lens_from_mask(&mask).to_vec(), vec![0, 3, 4]);
    }

    #[test]
    fn loss_is_positive_and_returns_marginals_for_mbr() {
        let (s_span, s_label, mask) = scores(11);
        let out = loss(&s_span, &s_label, &gold_charts(), &mask, true).unwrap();
        assert!(out.span > 0.0, "span={}", out.span);
        assert!(out.label > 0.0, "label={}", out.label);
        assert!((out.total - out.span - out.label).abs() < 1e-12);
        assert_eq!(out.span_probs.shape(), &[2, 5, 5]);
        assert!(out.span_probs.iter().all(|&p| (-1e-12..=1.0 + 1e-9).contains(&p)));
        assert!((out.span_probs[[1, 0, 4]] - 1.0).abs() < 1e-9);

        let raw = loss(&s_span, &s_label, &gold_charts(), &mask, false).unwrap();
        assert_eq!(raw.span_probs, s_span);
        assert_eq!(raw.total, out.total);
    }

    #[test]
    fn loss_matches_log_prob_per_token() {
        let (s_span, s_label, mask) = scores(12);
        let charts = gold_charts();
        let out = loss(&s_span, &s_label, &charts, &mask, false).unwrap();
        let dist = ConstituencyCrf::new(s_span, Some(Array1::from(vec![3, 4]))).unwrap();
        let expected = -dist.log_prob(&charts).unwrap().sum() / 7.0;
        assert!((out.span - expected).abs() < 1e-12);
    }

    #[test]
    fn decode_labels_every_span_of_the_argmax_tree() {
        let (s_span, s_label, mask) = scores(13);
        let trees = decode(&s_span, &s_label, &mask).unwrap();
        let spans = ConstituencyCrf::new(s_span.clone(), Some(Array1::from(vec![3, 4]))).unwrap();
        assert_eq!(trees.len(), 2);
        for (b, (tree, plain)) in trees.iter().zip(spans.argmax()).enumerate() {
            assert_eq!(tree.len(), plain.len());
            for (c, p) in tree.iter().zip(plain) {
                assert_eq!((c.start, c.end), (p.start, p.end));
                let l = c.label.unwrap();
                let logits = s_label.slice(s![b, c.start, c.end, ..]);
                assert!(logits.iter().all(|&x| x <= logits[l]));
            }
        }

        // MBR: decode over marginals instead of raw span scores.
        let probs = loss(&s_span, &s_label, &gold_charts(), &mask, true).unwrap().span_probs;
        let mbr = decode(&probs, &s_label, &mask).unwrap();
        assert_eq!(mbr[0].len(), 5);
        assert_eq!(mbr[1].len(), 7);
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        let (s_span, s_label, _) = scores(14);
        let bad_mask = Array3::from_elem((2, 4, 4), true);
        assert!(matches!(
            decode(&s_span, &s_label, &bad_mask),
            Err(Error::ShapeMismatch { what: "mask", .. })
        ));
        let mask = chart_mask(&Array1::from(vec![3, 4]), 5);
        let mut charts = gold_charts();
        charts[[0, 0, 3]] = 9;
        assert!(matches!(
            loss(&s_span, &s_label, &charts, &mask, false),
            Err(Error::LabelOutOfRange { label: 9, .. })
        ));
        let narrow = Array4::zeros((2, 5, 5, 0));
        assert_eq!(decode(&s_span, &narrow, &mask), Err(Error::NoLabels));
    }
}
