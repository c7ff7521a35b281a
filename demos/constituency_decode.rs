//! End-to-end example: decode labeled trees from span/label scores.
//!
//! A toy "scorer" prefers short spans on the left and a couple of labels;
//! the example prints the Viterbi tree, the MBR tree (decoded from span
//! marginals), the three best derivations and a few distribution statistics.

use ndarray::{Array1, Array3, Array4};
use treecrf::head::{decode, loss};
use treecrf::{chart_mask, charts_from_trees, ConstituencyCrf, StructuredDistribution};

const LABELS: [&str; 3] = ["NP", "VP", "S"];

fn main() {
    let words = ["the", "firms", "were", "ready"];
    let n = words.len() + 1;
    let lens = Array1::from(vec![words.len()]);

    // Deterministic pseudo-scores in place of a neural scorer.
    let s_span = Array3::from_shape_fn((1, n, n), |(_, i, j)| {
        let width = j as f64 - i as f64;
        ((i * 7 + j * 3) % 5) as f64 * 0.3 - 0.2 * width
    });
    let s_label = Array4::from_shape_fn((1, n, n, LABELS.len()), |(_, i, j, l)| {
        ((i + 2 * j + 3 * l) % 4) as f64 * 0.5
    });
    let mask = chart_mask(&lens, n);

    let viterbi = decode(&s_span, &s_label, &mask).unwrap();
    println!("viterbi tree:");
    print_tree(&viterbi[0], &words);

    let gold = charts_from_trees(&viterbi, n).unwrap();
    let out = loss(&s_span, &s_label, &gold, &mask, true).unwrap();
    println!(
        "loss against own viterbi tree = {:.4} (span {:.4}, label {:.4})",
        out.total, out.span, out.label
    );
    let mbr = decode(&out.span_probs, &s_label, &mask).unwrap();
    println!("mbr tree:");
    print_tree(&mbr[0], &words);

    let crf = ConstituencyCrf::labeled(s_label, Some(lens)).unwrap();
    println!(
        "log Z = {:.4}, max = {:.4}, entropy = {:.4}",
        crf.log_partition()[0],
        crf.max()[0],
        crf.entropy()[0]
    );
    let kmax = crf.kmax(3).unwrap();
    for (r, tree) in crf.topk(3).unwrap()[0].iter().enumerate() {
        println!("rank {} (score {:.4}):", r, kmax[[r, 0]]);
        print_tree(tree, &words);
    }
}

fn print_tree(tree: &treecrf::Tree, words: &[&str]) {
    for c in tree {
        let label = c.label.map_or("-", |l| LABELS[l]);
        println!("  {:>2} ({}, {}) {}", label, c.start, c.end, words[c.start..c.end].join(" "));
    }
}
