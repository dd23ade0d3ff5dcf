//! Boundary-aware text segmentation.
//!
//! Text is scanned left to right. At every offset a fixed set of boundary
//! patterns (heading, list item, fenced code block, table row, paragraph,
//! sentence) is tried and the longest valid match is taken. The resulting
//! pieces are then packed back together into as few chunks as possible
//! without exceeding the length bound.
//!
//! Lengths are counted in Unicode scalar values, not bytes.
//!
//! Guarantees:
//! - concatenating the output yields the input exactly
//! - every chunk is at most `max_length` long, except a fenced code block
//!   longer than the bound, which is kept whole
//! - the same input and bound always give the same output

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

/// Default maximum chunk length.
pub const DEFAULT_MAX_LENGTH: usize = 300;

const MAX_HEADING_CONTENT: usize = 200;
const MAX_LIST_ITEM: usize = 200;
const MAX_TABLE_ROW: usize = 200;
const MAX_CODE_BLOCK: usize = 1500;

/// Compiled automaton budget; bounds above this fall back to the linear splitter.
const PATTERN_SIZE_LIMIT: usize = 64 * (1 << 20);

const SENTENCE_TERMINATORS: &[char] = &['。', '！', '？', '.', '!', '?'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundaryKind {
    Heading,
    ListItem,
    CodeBlock,
    TableRow,
    Paragraph,
    Sentence,
}

impl BoundaryKind {
    fn requires_line_start(self) -> bool {
        !matches!(self, BoundaryKind::Sentence)
    }

    /// Only a fenced code block may exceed the bound.
    fn may_exceed_bound(self) -> bool {
        matches!(self, BoundaryKind::CodeBlock)
    }
}

struct BoundaryPattern {
    kind: BoundaryKind,
    regex: Regex,
}

type PatternSet = Option<Arc<Vec<BoundaryPattern>>>;

/// Compiled patterns per length bound, shared by every segmenter.
static PATTERN_CACHE: Lazy<Mutex<HashMap<usize, PatternSet>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn patterns_for(max_length: usize) -> PatternSet {
    let mut cache = PATTERN_CACHE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    cache
        .entry(max_length)
        .or_insert_with(|| match compile_patterns(max_length) {
            Ok(patterns) => Some(Arc::new(patterns)),
            Err(e) => {
                warn!(max_length, error = %e, "Boundary patterns unavailable, using linear splitter");
                None
            }
        })
        .clone()
}

/// Splits text into bounded chunks. Build once, reuse for every document.
pub struct Segmenter {
    max_length: usize,
    /// `None` when the patterns could not be compiled for this bound.
    patterns: PatternSet,
}

impl Segmenter {
    pub fn new(max_length: usize) -> Self {
        let max_length = max_length.max(1);
        Self {
            max_length,
            patterns: patterns_for(max_length),
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Split `text` into ordered chunks.
    pub fn segment(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }

        let pieces = match &self.patterns {
            Some(patterns) => {
                let pieces = scan(text, patterns, self.max_length);
                if pieces.is_empty() {
                    linear_split(text, self.max_length)
                } else {
                    pieces
                }
            }
            None => linear_split(text, self.max_length),
        };

        let chunks = merge_pieces(pieces, self.max_length);
        debug!(
            chunks = chunks.len(),
            max_length = self.max_length,
            "Segmented text"
        );
        chunks
    }
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LENGTH)
    }
}

/// One-shot convenience over [`Segmenter`]. Patterns are cached per bound.
pub fn segment(text: &str, max_length: usize) -> Vec<String> {
    Segmenter::new(max_length).segment(text)
}

fn compile_patterns(max: usize) -> Result<Vec<BoundaryPattern>, regex::Error> {
    let heading = max.min(MAX_HEADING_CONTENT);
    let list = max.min(MAX_LIST_ITEM);
    let table = max.min(MAX_TABLE_ROW);
    let code = max.saturating_mul(2).min(MAX_CODE_BLOCK);

    let sources = [
        (
            BoundaryKind::Heading,
            format!(r"\A#{{1,7}} [^\r\n]{{1,{heading}}}(?:\r?\n)?"),
        ),
        (
            BoundaryKind::ListItem,
            format!(r"\A[ \t]{{0,3}}(?:[-*+•]|\d{{1,3}}\.) [^\r\n]{{1,{list}}}(?:\r?\n)?"),
        ),
        (
            BoundaryKind::CodeBlock,
            format!(r"\A```[\s\S]{{0,{code}}}?```(?:\r?\n)?"),
        ),
        (
            BoundaryKind::TableRow,
            format!(r"\A\|[^\r\n]{{0,{table}}}\|(?:\r?\n)?"),
        ),
        (
            BoundaryKind::Paragraph,
            format!(r"\A[^\r\n]{{1,{max}}}(?:\r?\n\r?\n|\z)"),
        ),
        (BoundaryKind::Sentence, format!(r"\A[^\r\n]{{1,{max}}}")),
    ];

    sources
        .into_iter()
        .map(|(kind, source)| {
            RegexBuilder::new(&source)
                .size_limit(PATTERN_SIZE_LIMIT)
                .build()
                .map(|regex| BoundaryPattern { kind, regex })
        })
        .collect()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn at_line_start(text: &str, offset: usize) -> bool {
    offset == 0 || text[..offset].ends_with('\n')
}

fn scan(text: &str, patterns: &[BoundaryPattern], max: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut offset = 0;

    while offset < text.len() {
        let rest = &text[offset..];
        let line_start = at_line_start(text, offset);

        let mut best: Option<(BoundaryKind, usize)> = None;
        for pattern in patterns {
            if pattern.kind.requires_line_start() && !line_start {
                continue;
            }
            let Some(m) = pattern.regex.find(rest) else {
                continue;
            };
            let matched = m.as_str();
            if matched.is_empty() {
                continue;
            }
            if !pattern.kind.may_exceed_bound() && char_len(matched) > max {
                continue;
            }
            // strictly longer wins, so ties keep the earlier pattern
            if best.map_or(true, |(_, len)| matched.len() > len) {
                best = Some((pattern.kind, matched.len()));
            }
        }

        let consumed = match best {
            Some((BoundaryKind::Sentence, len)) => prefer_sentence_cut(rest, len, max),
            Some((_, len)) => len,
            None => line_break_run(rest, max),
        };

        pieces.push(rest[..consumed].to_string());
        offset += consumed;
    }

    pieces
}

/// A sentence match that hit the bound mid-line is pulled back to the last
/// sentence terminator, or failing that the last whitespace.
fn prefer_sentence_cut(rest: &str, len: usize, max: usize) -> usize {
    let matched = &rest[..len];
    let line_continues = rest[len..]
        .chars()
        .next()
        .is_some_and(|c| c != '\n' && c != '\r');
    if !line_continues || char_len(matched) < max {
        return len;
    }

    let after = |(idx, c): (usize, char)| idx + c.len_utf8();
    if let Some(cut) = matched
        .char_indices()
        .filter(|(_, c)| SENTENCE_TERMINATORS.contains(c))
        .last()
        .map(after)
    {
        return cut;
    }
    matched
        .char_indices()
        .filter(|(_, c)| c.is_whitespace())
        .last()
        .map(after)
        .filter(|cut| *cut > 0)
        .unwrap_or(len)
}

/// Consume line breaks no pattern covers, at most `max` of them. Always
/// advances by at least one character.
fn line_break_run(rest: &str, max: usize) -> usize {
    let mut consumed = 0;
    for (count, c) in rest.chars().enumerate() {
        if count >= max || (c != '\n' && c != '\r') {
            break;
        }
        consumed += c.len_utf8();
    }
    if consumed == 0 {
        rest.chars().next().map_or(rest.len(), char::len_utf8)
    } else {
        consumed
    }
}

/// Paragraph → sentence → fixed-width split with no pattern matching at all.
pub(crate) fn linear_split(text: &str, max: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    for paragraph in text.split_inclusive("\n\n") {
        if char_len(paragraph) <= max {
            pieces.push(paragraph.to_string());
            continue;
        }
        for sentence in split_sentences(paragraph) {
            if char_len(sentence) <= max {
                pieces.push(sentence.to_string());
            } else {
                pieces.extend(fixed_width(sentence, max));
            }
        }
    }
    pieces
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut in_terminator = false;
    for (idx, c) in text.char_indices() {
        let is_terminator = SENTENCE_TERMINATORS.contains(&c);
        if in_terminator && !is_terminator {
            sentences.push(&text[start..idx]);
            start = idx;
        }
        in_terminator = is_terminator;
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

fn fixed_width(text: &str, max: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(max).map(|c| c.iter().collect()).collect()
}

fn merge_pieces(pieces: Vec<String>, max: usize) -> Vec<String> {
    match min_partition(&pieces, max) {
        Some(groups) => groups,
        None => merge_greedy(pieces, max),
    }
}

/// Fewest contiguous groups with each group's length within `max`.
///
/// Returns `None` when a single piece already exceeds the bound.
fn min_partition(pieces: &[String], max: usize) -> Option<Vec<String>> {
    let lengths: Vec<usize> = pieces.iter().map(|p| char_len(p)).collect();
    if lengths.iter().any(|&len| len > max) {
        return None;
    }

    let n = pieces.len();
    let mut prev = vec![0usize; n + 1];
    let mut left = 0;
    let mut total = 0;
    for right in 1..=n {
        total += lengths[right - 1];
        while total > max && left < right - 1 {
            total -= lengths[left];
            left += 1;
        }
        prev[right] = left;
    }

    let mut groups = Vec::new();
    let mut idx = n;
    while idx > 0 {
        let start = prev[idx];
        groups.push(pieces[start..idx].concat());
        idx = start;
    }
    groups.reverse();
    Some(groups)
}

fn merge_greedy(pieces: Vec<String>, max: usize) -> Vec<String> {
    let mut merged = Vec::new();
    let mut iter = pieces.into_iter();
    let Some(mut current) = iter.next() else {
        return merged;
    };
    let mut current_len = char_len(&current);

    for next in iter {
        let next_len = char_len(&next);
        if current_len + next_len <= max {
            current.push_str(&next);
            current_len += next_len;
        } else {
            merged.push(std::mem::replace(&mut current, next));
            current_len = next_len;
        }
    }
    merged.push(current);
    merged
}
