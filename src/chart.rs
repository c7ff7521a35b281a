//! Chart storage and zero-copy stripe views.
//!
//! A [`Chart`] stores one value per `(i, j, batch)` cell in a flat buffer,
//! batch innermost. The inside recursion only ever needs three access
//! patterns, all of which are strided walks over that buffer:
//!
//! - [`Chart::diagonal`]: every span of width `w`, `(i, i + w)`.
//! - [`Chart::left_stripe`]: for each span `(i, i + w)`, its left children
//!   `(i, i + k)` for `k = 1..w`.
//! - [`Chart::right_stripe`]: the matching right children `(i + k, i + w)`.
//!
//! Row `i`, column `k - 1` of the two stripes are the two halves of the same
//! split, so a single `dot` over a row reduces every split point of a span.
//! None of the views touch cells with `i >= j`.

/// Dense `n x n x batch` chart of semiring values.
#[derive(Debug, Clone, PartialEq)]
pub struct Chart<E> {
    data: Vec<E>,
    n: usize,
    batch: usize,
}

impl<E: Clone> Chart<E> {
    /// Chart with every cell set to `value`.
    pub fn filled(n: usize, batch: usize, value: E) -> Self {
        Self {
            data: vec![value; n * n * batch],
            n,
            batch,
        }
    }
}

impl<E> Chart<E> {
    /// Number of positions (fenceposts) per axis.
    pub fn seq_len(&self) -> usize {
        self.n
    }

    /// Number of sentences.
    pub fn batch_size(&self) -> usize {
        self.batch
    }

    fn offset(&self, i: usize, j: usize, b: usize) -> usize {
        debug_assert!(i < self.n && j < self.n && b < self.batch);
        (i * self.n + j) * self.batch + b
    }

    /// Value of span `(i, j)` in sentence `b`.
    pub fn get(&self, i: usize, j: usize, b: usize) -> &E {
        &self.data[self.offset(i, j, b)]
    }

    /// Mutable value of span `(i, j)` in sentence `b`.
    pub fn get_mut(&mut self, i: usize, j: usize, b: usize) -> &mut E {
        let at = self.offset(i, j, b);
        &mut self.data[at]
    }

    fn spans(&self, w: usize) -> usize {
        self.n.saturating_sub(w)
    }

    /// All spans of width `w`, indexed by start position.
    pub fn diagonal(&self, w: usize) -> Diagonal<'_, E> {
        Diagonal {
            data: &self.data,
            origin: w * self.batch,
            step: (self.n + 1) * self.batch,
            len: self.spans(w),
            batch: self.batch,
        }
    }

    /// Writable view of all spans of width `w`.
    pub fn diagonal_mut(&mut self, w: usize) -> DiagonalMut<'_, E> {
        let (origin, step, len, batch) = (
            w * self.batch,
            (self.n + 1) * self.batch,
            self.spans(w),
            self.batch,
        );
        DiagonalMut {
            data: &mut self.data,
            origin,
            step,
            len,
            batch,
        }
    }

    /// Left children `(i, i + k)` of every width-`w` span, `k = 1..w`.
    pub fn left_stripe(&self, w: usize) -> Stripe<'_, E> {
        Stripe {
            data: &self.data,
            origin: self.batch,
            outer_step: (self.n + 1) * self.batch,
            inner_step: self.batch,
            outer_len: self.spans(w),
            inner_len: w.saturating_sub(1),
        }
    }

    /// Right children `(i + k, i + w)` of every width-`w` span, `k = 1..w`.
    pub fn right_stripe(&self, w: usize) -> Stripe<'_, E> {
        Stripe {
            data: &self.data,
            origin: (self.n + w) * self.batch,
            outer_step: (self.n + 1) * self.batch,
            inner_step: self.n * self.batch,
            outer_len: self.spans(w),
            inner_len: w.saturating_sub(1),
        }
    }
}

/// Read-only view of one width of the chart.
#[derive(Debug, Clone, Copy)]
pub struct Diagonal<'a, E> {
    data: &'a [E],
    origin: usize,
    step: usize,
    len: usize,
    batch: usize,
}

impl<'a, E> Diagonal<'a, E> {
    /// Number of spans of this width.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no span of this width fits in the chart.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Span starting at `i` in sentence `b`.
    pub fn get(&self, i: usize, b: usize) -> &'a E {
        debug_assert!(i < self.len && b < self.batch);
        &self.data[self.origin + i * self.step + b]
    }

    /// Cells in `(start, batch)` row-major order.
    pub fn iter(&self) -> impl Iterator<Item = &'a E> + 'a {
        let (data, origin, step, batch) = (self.data, self.origin, self.step, self.batch);
        (0..self.len).flat_map(move |i| (0..batch).map(move |b| &data[origin + i * step + b]))
    }
}

/// Writable view of one width of the chart.
#[derive(Debug)]
pub struct DiagonalMut<'a, E> {
    data: &'a mut [E],
    origin: usize,
    step: usize,
    len: usize,
    batch: usize,
}

impl<E> DiagonalMut<'_, E> {
    /// Number of spans of this width.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no span of this width fits in the chart.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Overwrite the span starting at `i` in sentence `b`.
    pub fn set(&mut self, i: usize, b: usize, value: E) {
        debug_assert!(i < self.len && b < self.batch);
        self.data[self.origin + i * self.step + b] = value;
    }

    /// Overwrite the whole width from values in `(start, batch)` row-major order.
    pub fn assign<I: IntoIterator<Item = E>>(&mut self, values: I) {
        let mut values = values.into_iter();
        for i in 0..self.len {
            for b in 0..self.batch {
                match values.next() {
                    Some(v) => self.set(i, b, v),
                    None => return,
                }
            }
        }
    }
}

/// Read-only `[spans, splits]` view over split-point children.
#[derive(Debug, Clone, Copy)]
pub struct Stripe<'a, E> {
    data: &'a [E],
    origin: usize,
    outer_step: usize,
    inner_step: usize,
    outer_len: usize,
    inner_len: usize,
}

impl<'a, E> Stripe<'a, E> {
    /// Number of spans covered.
    pub fn spans(&self) -> usize {
        self.outer_len
    }

    /// Number of split points per span.
    pub fn splits(&self) -> usize {
        self.inner_len
    }

    /// Child cell for split point `i + split + 1` of the span starting at `i`, sentence `b`.
    pub fn get(&self, i: usize, split: usize, b: usize) -> &'a E {
        debug_assert!(i < self.outer_len && split < self.inner_len);
        &self.data[self.origin + i * self.outer_step + split * self.inner_step + b]
    }

    /// All split-point children of the span starting at `i`, sentence `b`.
    pub fn row(&self, i: usize, b: usize) -> impl Iterator<Item = &'a E> + 'a {
        debug_assert!(i < self.outer_len);
        let (data, step) = (self.data, self.inner_step);
        let start = self.origin + i * self.outer_step + b;
        (0..self.inner_len).map(move |k| &data[start + k * step])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Chart whose cells hold their own coordinates.
    fn coordinates(n: usize, batch: usize) -> Chart<(usize, usize, usize)> {
        let mut c = Chart::filled(n, batch, (0, 0, 0));
        for i in 0..n {
            for j in 0..n {
                for b in 0..batch {
                    *c.get_mut(i, j, b) = (i, j, b);
                }
            }
        }
        c
    }

    #[test]
    fn diagonal_walks_spans_of_one_width() {
        let c = coordinates(5, 2);
        let d = c.diagonal(2);
        assert_eq!(d.len(), 3);
        for i in 0..3 {
            for b in 0..2 {
                assert_eq!(*d.get(i, b), (i, i + 2, b));
            }
        }
        let cells: Vec<_> = d.iter().copied().collect();
        assert_eq!(cells[0], (0, 2, 0));
        assert_eq!(cells[1], (0, 2, 1));
        assert_eq!(cells[5], (2, 4, 1));
        assert!(c.diagonal(5).is_empty());
    }

    #[test]
    fn stripes_pair_children_of_each_split() {
        let n = 6;
        let c = coordinates(n, 3);
        for w in 2..n {
            let (left, right) = (c.left_stripe(w), c.right_stripe(w));
            assert_eq!(left.spans(), n - w);
            assert_eq!(right.splits(), w - 1);
            for i in 0..n - w {
                for b in 0..3 {
                    let pairs: Vec<_> = left.row(i, b).zip(right.row(i, b)).collect();
                    for (s, (l, r)) in pairs.into_iter().enumerate() {
                        let k = i + s + 1;
                        assert_eq!(*l, (i, k, b));
                        assert_eq!(*r, (k, i + w, b));
                        assert_eq!(left.get(i, s, b), l);
                    }
                }
            }
        }
    }

    #[test]
    fn writes_through_diagonal_are_visible_at_span_coordinates() {
        let mut c = Chart::filled(4, 2, 0.0f64);
        c.diagonal_mut(1).assign((0..6).map(|x| x as f64));
        assert_eq!(*c.get(0, 1, 0), 0.0);
        assert_eq!(*c.get(0, 1, 1), 1.0);
        assert_eq!(*c.get(2, 3, 1), 5.0);
        c.diagonal_mut(3).set(0, 1, 7.0);
        assert_eq!(*c.get(0, 3, 1), 7.0);
        // Lower triangle untouched.
        for i in 0..4 {
            for j in 0..=i {
                assert_eq!(*c.get(i, j, 0), 0.0);
                assert_eq!(*c.get(i, j, 1), 0.0);
            }
        }
    }
}
