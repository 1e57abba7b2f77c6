//! Agglomerative clustering of embedding vectors.
//!
//! Grouping builds the full pairwise distance matrix, so time and memory are
//! O(n²) in the number of vectors. That is fine for hundreds to a few
//! thousand files; larger corpora should pass an explicit subset.

use std::collections::BTreeMap;

use kodama::{Method, linkage};
use rayon::prelude::*;

/// Cosine similarity of two vectors. Zero-length or zero-norm inputs score
/// `0.0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Condensed cosine-distance matrix (`1 - similarity`), upper triangle in
/// row-major order, as expected by [`kodama::linkage`].
pub fn condensed_distances(vectors: &[Vec<f32>]) -> Vec<f32> {
    let n = vectors.len();
    (0..n)
        .into_par_iter()
        .flat_map_iter(|i| {
            (i + 1..n).map(move |j| {
                let d = 1.0 - cosine_similarity(&vectors[i], &vectors[j]);
                if d.is_nan() { 1.0 } else { d.max(0.0) }
            })
        })
        .collect()
}

/// Average-linkage clustering that keeps merging while the linkage
/// distance is below `1 - threshold`.
///
/// Returns one label per input vector. Labels are dense and numbered in
/// order of first appearance.
pub fn agglomerate(vectors: &[Vec<f32>], threshold: f32) -> Vec<usize> {
    let n = vectors.len();
    if n < 2 {
        return vec![0; n];
    }

    let cutoff = 1.0 - threshold;
    let mut condensed = condensed_distances(vectors);
    let dendrogram = linkage(&mut condensed, n, Method::Average);

    // Cluster ids 0..n are the leaves; step i creates cluster n + i.
    let mut parent: Vec<Option<usize>> = vec![None; 2 * n - 1];
    for (i, step) in dendrogram.steps().iter().enumerate() {
        // Average linkage is monotone, so every later step is at least as far.
        if step.dissimilarity >= cutoff {
            break;
        }
        parent[step.cluster1] = Some(n + i);
        parent[step.cluster2] = Some(n + i);
    }

    let mut dense: BTreeMap<usize, usize> = BTreeMap::new();
    (0..n)
        .map(|leaf| {
            let mut root = leaf;
            while let Some(p) = parent[root] {
                root = p;
            }
            let next = dense.len();
            *dense.entry(root).or_insert(next)
        })
        .collect()
}

/// Collect `paths` into groups by `labels`, dropping groups smaller than
/// `min_group_size`. Members are sorted, and groups are sorted by their
/// first member.
pub fn groups_from_labels(
    paths: &[String],
    labels: &[usize],
    min_group_size: usize,
) -> Vec<Vec<String>> {
    let mut by_label: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for (path, label) in paths.iter().zip(labels) {
        by_label.entry(*label).or_default().push(path.clone());
    }

    let mut groups: Vec<Vec<String>> = by_label
        .into_values()
        .filter(|g| g.len() >= min_group_size.max(1))
        .map(|mut g| {
            g.sort();
            g
        })
        .collect();
    groups.sort();
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_and_orthogonal() {
        let same = cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]);
        assert!((same - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn condensed_matrix_has_upper_triangle_length() {
        let vectors = vec![
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![1.0, 1.0],
            vec![1.0, 0.0],
        ];
        let d = condensed_distances(&vectors);
        assert_eq!(d.len(), 6);
        // (0, 1) orthogonal, (0, 3) identical.
        assert!((d[0] - 1.0).abs() < 1e-6);
        assert!(d[2].abs() < 1e-6);
    }

    #[test]
    fn close_vectors_share_a_label() {
        let vectors = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.0, 0.0, 1.0],
            vec![0.95, 0.05, 0.0],
            vec![0.9, 0.1, 0.0],
        ];
        let labels = agglomerate(&vectors, 0.8);
        assert_eq!(labels[0], labels[2]);
        assert_eq!(labels[0], labels[3]);
        assert_ne!(labels[0], labels[1]);
    }

    #[test]
    fn strict_threshold_keeps_singletons() {
        let vectors = vec![vec![1.0, 0.0], vec![0.7, 0.7]];
        assert_eq!(agglomerate(&vectors, 0.99), vec![0, 1]);
    }

    #[test]
    fn trivial_inputs() {
        assert!(agglomerate(&[], 0.5).is_empty());
        assert_eq!(agglomerate(&[vec![1.0]], 0.5), vec![0]);
    }

    #[test]
    fn groups_are_filtered_and_sorted() {
        let paths: Vec<String> =
            ["/d", "/b", "/c", "/a"].map(String::from).into();
        let groups = groups_from_labels(&paths, &[0, 1, 2, 0], 2);
        assert_eq!(groups, vec![vec!["/a".to_string(), "/d".to_string()]]);
    }
}
