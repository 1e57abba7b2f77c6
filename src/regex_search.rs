//! Bounded regex search over file content.
//!
//! A request goes through validate, compile, scan and aggregate. Patterns
//! are screened with a cheap complexity estimate before compilation, files
//! are read in line-aligned chunks rather than whole, and each chunk is
//! matched on the blocking pool under a wall-clock timeout. A chunk that
//! times out counts as "no match" for that chunk.
//!
//! Results are a set: their order is unspecified.

use std::{collections::HashSet, path::Path, sync::Arc, time::Duration};

use regex::{Regex, RegexBuilder};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cache::{CacheManager, paths_digest},
    config::RegexConfig,
    error::{Error, ErrorKind, Result},
};

/// Compiled program size limit handed to the regex crate.
const COMPILED_SIZE_LIMIT: usize = 1 << 20;

/// Extensions that are never decoded as text.
const BINARY_EXTENSIONS: &[&str] = &[
    "7z", "a", "avi", "bin", "bmp", "class", "dll", "dmg", "doc", "docx",
    "exe", "flac", "gif", "gz", "ico", "iso", "jar", "jpeg", "jpg", "mkv",
    "mov", "mp3", "mp4", "o", "ogg", "otf", "pdf", "png", "ppt", "pptx",
    "pyc", "rar", "so", "sqlite", "tar", "tif", "tiff", "ttf", "wasm", "wav",
    "webm", "webp", "woff", "woff2", "xls", "xlsx", "xz", "zip",
];

#[derive(Debug, Clone, Default)]
pub struct RegexRequest {
    pub pattern: String,
    pub case_sensitive: bool,
    pub whole_word: bool,
    /// Files to scan. The coordinator fills this with every indexed path
    /// when the caller leaves it empty.
    pub paths: Vec<String>,
    pub cancel: Option<CancellationToken>,
    /// Set when `paths` is the whole indexed corpus rather than a set the
    /// caller chose.
    pub(crate) whole_corpus: bool,
}

impl RegexRequest {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            ..Self::default()
        }
    }

    pub fn case_sensitive(mut self, yes: bool) -> Self {
        self.case_sensitive = yes;
        self
    }

    pub fn whole_word(mut self, yes: bool) -> Self {
        self.whole_word = yes;
        self
    }

    pub fn paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Cache key for this request.
    ///
    /// A caller-chosen file set is keyed by its digest. A whole-corpus scan
    /// shares one key per pattern and flags; writes through the coordinator
    /// invalidate every `regex:` key.
    pub fn cache_key(&self) -> String {
        let scope = if self.whole_corpus {
            "all".to_string()
        } else {
            paths_digest(&self.paths)
        };
        format!(
            "regex:{}:{}:{}:{scope}",
            self.pattern, self.case_sensitive, self.whole_word
        )
    }
}

/// Estimated backtracking risk of `pattern`.
///
/// Counts are taken over raw characters, escaped or not, so the estimate is
/// conservative for patterns full of escaped metacharacters.
///
/// ```
/// use docseek::regex_search::complexity;
///
/// assert_eq!(complexity("cat"), 6);
/// assert!(complexity("((((((((a+)+)+)+)+)+)+)+)+") > 300);
/// ```
pub fn complexity(pattern: &str) -> usize {
    let count = |c: char| pattern.chars().filter(|&p| p == c).count();
    pattern.chars().count() * 2
        + 10 * count('*')
        + 8 * count('+')
        + 10 * count('{')
        + 5 * count('?')
        + 15 * count('|')
        + 5 * count('[')
        + 8 * count('(')
        + 20 * max_group_depth(pattern)
}

fn max_group_depth(pattern: &str) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    for c in pattern.chars() {
        match c {
            '(' => {
                depth += 1;
                max = max.max(depth);
            }
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

/// Whether `pattern` can be answered from filenames alone: it is anchored
/// at the end and names a literal dot, like `\.rs$`.
pub fn is_filename_pattern(pattern: &str) -> bool {
    pattern.ends_with('$') && pattern.contains(r"\.")
}

/// Validate and compile `pattern`.
pub fn build_regex(
    pattern: &str,
    case_sensitive: bool,
    whole_word: bool,
    max_complexity: usize,
) -> Result<Regex> {
    if pattern.is_empty() {
        return Err(Error::invalid_pattern(pattern, "empty pattern"));
    }
    let score = complexity(pattern);
    if score > max_complexity {
        return Err(Error::invalid_pattern(
            pattern,
            format!("complexity {score} exceeds limit {max_complexity}"),
        ));
    }

    let bounded = pattern.starts_with(r"\b") && pattern.ends_with(r"\b");
    let source = if whole_word && !bounded {
        format!(r"\b(?:{pattern})\b")
    } else {
        pattern.to_string()
    };

    RegexBuilder::new(&source)
        .case_insensitive(!case_sensitive)
        .size_limit(COMPILED_SIZE_LIMIT)
        .build()
        .map_err(|e| Error::invalid_pattern(pattern, e.to_string()))
}

fn is_binary(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .is_some_and(|e| BINARY_EXTENSIONS.contains(&e.as_str()))
}

/// Scans files for a regex with bounded concurrency and per-chunk timeouts.
pub struct RegexProvider {
    config: RegexConfig,
    cache: Arc<CacheManager>,
}

impl RegexProvider {
    pub fn new(config: RegexConfig, cache: Arc<CacheManager>) -> Self {
        Self { config, cache }
    }

    /// Paths of files in `request.paths` that contain a match.
    ///
    /// Stops adding paths once `max_results` are collected; members of the
    /// batch already in flight still finish. Unreadable files are skipped.
    pub async fn search(&self, request: &RegexRequest) -> Result<Vec<String>> {
        let key = request.cache_key();
        if let Some(cached) = self.cache.lookup::<Vec<String>>(&key) {
            debug!(pattern = %request.pattern, "regex cache hit");
            return Ok(cached);
        }

        let regex = Arc::new(build_regex(
            &request.pattern,
            request.case_sensitive,
            request.whole_word,
            self.config.max_complexity,
        )?);
        let filename_only = is_filename_pattern(&request.pattern);
        let cancel = request.cancel.clone().unwrap_or_default();

        let mut matches: HashSet<String> = HashSet::new();
        for batch in request.paths.chunks(self.config.batch_size.max(1)) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if matches.len() >= self.config.max_results {
                break;
            }

            let mut set = JoinSet::new();
            for path in batch {
                let path = path.clone();
                let regex = Arc::clone(&regex);
                let config = self.config.clone();
                let cancel = cancel.clone();
                set.spawn(async move {
                    let matched = scan_file(
                        Path::new(&path),
                        &regex,
                        filename_only,
                        &config,
                        &cancel,
                    )
                    .await;
                    (path, matched)
                });
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((path, Ok(true))) => {
                        if matches.len() < self.config.max_results {
                            matches.insert(path);
                        }
                    }
                    Ok((_, Ok(false))) => {}
                    Ok((_, Err(e))) if e.kind() == ErrorKind::Cancelled => {
                        return Err(Error::Cancelled);
                    }
                    Ok((path, Err(e))) => {
                        debug!(path, error = %e, "skipping unreadable file");
                    }
                    Err(e) => warn!(error = %e, "regex scan task failed"),
                }
            }
        }

        let results: Vec<String> = matches.into_iter().collect();
        self.cache.remember(&key, &results);
        debug!(
            pattern = %request.pattern,
            matches = results.len(),
            "regex search complete"
        );
        Ok(results)
    }
}

/// Whether the file at `path` contains a match for `regex`.
async fn scan_file(
    path: &Path,
    regex: &Arc<Regex>,
    filename_only: bool,
    config: &RegexConfig,
    cancel: &CancellationToken,
) -> Result<bool> {
    if filename_only {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Ok(regex.is_match(&name));
    }
    if is_binary(path) {
        return Ok(false);
    }

    let chunk_bytes = config.chunk_bytes.max(1);
    // A single line may run past the chunk size, up to this hard cap.
    let cap = chunk_bytes.saturating_mul(4);
    let mut reader = BufReader::new(File::open(path).await?);
    let mut buf: Vec<u8> = Vec::with_capacity(chunk_bytes);

    loop {
        let room = (cap - buf.len()) as u64;
        let n = (&mut reader).take(room).read_until(b'\n', &mut buf).await?;
        let at_eof = n == 0;

        if buf.len() >= chunk_bytes || (at_eof && !buf.is_empty()) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let chunk =
                std::mem::replace(&mut buf, Vec::with_capacity(chunk_bytes));
            match match_chunk(regex, chunk, config.chunk_timeout()).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) if e.kind() == ErrorKind::Timeout => {
                    debug!(
                        path = %path.display(),
                        error = %e,
                        "treating timed out chunk as no match"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if at_eof {
            return Ok(false);
        }
    }
}

/// Match one chunk on the blocking pool. A chunk still running after
/// `timeout` is abandoned with [`Error::Timeout`].
async fn match_chunk(
    regex: &Arc<Regex>,
    chunk: Vec<u8>,
    timeout: Duration,
) -> Result<bool> {
    let regex = Arc::clone(regex);
    let task = tokio::task::spawn_blocking(move || {
        regex.is_match(&String::from_utf8_lossy(&chunk))
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(joined) => Ok(joined?),
        Err(_) => Err(Error::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn provider(config: RegexConfig) -> RegexProvider {
        let cache = CacheManager::memory_only(100, Duration::from_secs(3600));
        RegexProvider::new(config, Arc::new(cache))
    }

    fn write(dir: &Path, name: &str, content: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn complexity_formula() {
        // len 4 * 2 + one '+' + one '(' + depth 1
        assert_eq!(complexity("(a)+"), 8 + 8 + 8 + 20);
        assert_eq!(max_group_depth("((a)(b))"), 2);
    }

    #[test]
    fn nested_quantifiers_are_rejected_quickly() {
        let start = Instant::now();
        let err = build_regex("((((((((a+)+)+)+)+)+)+)+)+", false, false, 300)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPattern);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn malformed_pattern_is_invalid() {
        let err = build_regex("(unclosed", false, false, 300).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPattern);
    }

    #[test]
    fn whole_word_wraps_unbounded_patterns() {
        let re = build_regex("cat", false, true, 300).unwrap();
        assert!(re.is_match("the cat sat"));
        assert!(!re.is_match("concatenate"));

        let already = build_regex(r"\bcat\b", false, true, 300).unwrap();
        assert_eq!(already.as_str(), r"\bcat\b");
    }

    #[test]
    fn filename_pattern_detection() {
        assert!(is_filename_pattern(r"\.rs$"));
        assert!(!is_filename_pattern(r"main$"));
        assert!(!is_filename_pattern(r"\.rs"));
    }

    #[tokio::test]
    async fn whole_word_and_case_sensitivity() {
        let tmp = tempfile::tempdir().unwrap();
        let sat = write(tmp.path(), "sat.txt", "the cat sat");
        let concat = write(tmp.path(), "concat.txt", "concatenate");
        let lower = write(tmp.path(), "lower.txt", "abc");
        let p = provider(RegexConfig::default());

        let found = p
            .search(
                &RegexRequest::new("cat")
                    .whole_word(true)
                    .paths([&sat, &concat]),
            )
            .await
            .unwrap();
        assert_eq!(found, vec![sat]);

        let found = p
            .search(
                &RegexRequest::new("ABC").case_sensitive(true).paths([&lower]),
            )
            .await
            .unwrap();
        assert!(found.is_empty());

        let found = p
            .search(&RegexRequest::new("ABC").paths([&lower]))
            .await
            .unwrap();
        assert_eq!(found, vec![lower]);
    }

    #[tokio::test]
    async fn match_in_later_chunk_is_found() {
        let tmp = tempfile::tempdir().unwrap();
        let mut content = "filler line\n".repeat(50);
        content.push_str("needle here\n");
        let path = write(tmp.path(), "long.txt", &content);

        let p = provider(RegexConfig {
            chunk_bytes: 32,
            ..RegexConfig::default()
        });
        let found = p
            .search(&RegexRequest::new("needle").paths([&path]))
            .await
            .unwrap();
        assert_eq!(found, vec![path]);
    }

    #[tokio::test]
    async fn timed_out_chunk_counts_as_no_match() {
        let tmp = tempfile::tempdir().unwrap();
        // No literal for a prefilter to jump to: the whole chunk is scanned.
        let mut content = "filler line\n".repeat(400_000);
        content.push_str("needle1234\n");
        let path = write(tmp.path(), "huge.txt", &content);

        let p = provider(RegexConfig {
            chunk_timeout_ms: 0,
            chunk_bytes: 1 << 23,
            ..RegexConfig::default()
        });
        let found = p
            .search(&RegexRequest::new(r"[a-z]+\d{4}").paths([&path]))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn filename_pattern_does_not_read_files() {
        // Neither file exists, so a content scan would fail.
        let p = provider(RegexConfig::default());
        let found = p
            .search(
                &RegexRequest::new(r"\.md$")
                    .paths(["/nowhere/notes.md", "/nowhere/main.rs"]),
            )
            .await
            .unwrap();
        assert_eq!(found, vec!["/nowhere/notes.md".to_string()]);
    }

    #[tokio::test]
    async fn binary_files_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let png = write(tmp.path(), "image.png", "cat");
        let found = provider(RegexConfig::default())
            .search(&RegexRequest::new("cat").paths([&png]))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn results_are_capped() {
        let tmp = tempfile::tempdir().unwrap();
        let paths: Vec<String> = (0..5)
            .map(|i| write(tmp.path(), &format!("{i}.txt"), "match me"))
            .collect();

        let p = provider(RegexConfig {
            max_results: 2,
            ..RegexConfig::default()
        });
        let found = p
            .search(&RegexRequest::new("match").paths(&paths))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn missing_files_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let real = write(tmp.path(), "real.txt", "hello");
        let found = provider(RegexConfig::default())
            .search(
                &RegexRequest::new("hello")
                    .paths(["/does/not/exist.txt", real.as_str()]),
            )
            .await
            .unwrap();
        assert_eq!(found, vec![real]);
    }

    #[tokio::test]
    async fn results_are_cached_by_pattern() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "a.txt", "hello");
        let p = provider(RegexConfig::default());
        let request = RegexRequest::new("hello").paths([&path]);

        assert_eq!(p.search(&request).await.unwrap().len(), 1);
        std::fs::write(&path, "goodbye").unwrap();
        // Stale until the key is invalidated.
        assert_eq!(p.search(&request).await.unwrap().len(), 1);

        p.cache.invalidate_pattern("regex:").unwrap();
        assert!(p.search(&request).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cached_result_is_scoped_to_requested_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let a = write(tmp.path(), "a.txt", "hello");
        let b = write(tmp.path(), "b.txt", "goodbye");
        let p = provider(RegexConfig::default());

        let found = p
            .search(&RegexRequest::new("hello").paths([&a]))
            .await
            .unwrap();
        assert_eq!(found, vec![a.clone()]);

        let found = p
            .search(&RegexRequest::new("hello").paths([&b]))
            .await
            .unwrap();
        assert!(found.is_empty());

        // Same set in another order reuses the entry.
        let both = RegexRequest::new("hello").paths([&a, &b]);
        let reordered = RegexRequest::new("hello").paths([&b, &a]);
        assert_eq!(both.cache_key(), reordered.cache_key());
        assert_ne!(
            both.cache_key(),
            RegexRequest::new("hello").paths([&a]).cache_key()
        );
    }

    #[tokio::test]
    async fn cancelled_request_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "a.txt", "hello");
        let token = CancellationToken::new();
        token.cancel();

        let err = provider(RegexConfig::default())
            .search(&RegexRequest::new("hello").paths([&path]).cancel(token))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
