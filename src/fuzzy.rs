//! String similarity ratios for fuzzy filename matching.
//!
//! All ratios are in `0.0..=1.0`, where `1.0` means identical. They are
//! computed over `char`s, so multi-byte filenames are compared per code
//! point rather than per byte.

/// Levenshtein edit distance between two strings.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] =
                (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Normalized similarity `1 - distance / max_len`.
pub fn ratio(a: &str, b: &str) -> f32 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f32 / max_len as f32
}

/// Ratio after splitting both sides into lower-cased alphanumeric tokens,
/// sorting them and re-joining with single spaces.
///
/// Insensitive to word order and separators: `"report_final"` and
/// `"final report"` score `1.0`.
pub fn token_sort_ratio(a: &str, b: &str) -> f32 {
    ratio(&sorted_tokens(a), &sorted_tokens(b))
}

fn sorted_tokens(s: &str) -> String {
    let mut tokens: Vec<String> = s
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Best score of `query` against a filename.
///
/// Takes the maximum of the plain ratio against the whole filename, the
/// plain ratio against the filename without its extension, and the
/// token-sort ratio. Comparison is case-insensitive.
pub fn best_ratio(query: &str, filename: &str) -> f32 {
    let query = query.trim().to_lowercase();
    let name = filename.to_lowercase();
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name.as_str(),
    };

    ratio(&query, &name)
        .max(ratio(&query, stem))
        .max(token_sort_ratio(&query, &name))
}
