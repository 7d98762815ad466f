//! Splitting file content into line-ranged chunks.
//!
//! Output is deterministic for a given input and configuration. Every chunk
//! is exactly the lines of its range joined with `\n`, so a file can be put
//! back together from its chunks with [`assemble`].

use std::borrow::Cow;
use std::path::Path;

use super::filetype::FiletypeRegistry;
use crate::error::ChunkError;
use crate::{Error, Result};

/// Bytes inspected for NUL when detecting binary content.
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// How a filetype is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Boundaries at top-level definitions.
    Code,
    /// Paragraphs packed up to the target size; headings start new chunks.
    Prose,
    /// Fixed overlapping windows.
    Window,
    /// No chunks.
    Skip,
}

/// One chunk of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk index within file.
    pub index: usize,
    /// Starting line (1-based).
    pub start_line: usize,
    /// Ending line (1-based, inclusive).
    pub end_line: usize,
    /// Chunk content.
    pub content: String,
}

/// Chunking configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Target chunk size in lines.
    pub target_lines: usize,
    /// Trailing windows shorter than this merge into the previous one.
    pub min_lines: usize,
    /// Maximum chunk size in lines.
    pub max_lines: usize,
    /// Overlap between windows in lines.
    pub overlap_lines: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_lines: 50,
            min_lines: 10,
            max_lines: 100,
            overlap_lines: 5,
        }
    }
}

impl ChunkerConfig {
    /// Check the sizes are consistent.
    ///
    /// # Errors
    ///
    /// Returns an error unless `min <= target <= max` and
    /// `overlap < target`.
    pub fn validate(&self) -> Result<()> {
        if self.target_lines == 0 || self.max_lines == 0 {
            return Err(Error::config("chunk sizes must be greater than zero"));
        }
        if self.min_lines > self.target_lines || self.target_lines > self.max_lines {
            return Err(Error::config(format!(
                "chunk sizes must satisfy min <= target <= max (got {} / {} / {})",
                self.min_lines, self.target_lines, self.max_lines
            )));
        }
        if self.overlap_lines >= self.target_lines {
            return Err(Error::config("chunk overlap must be smaller than the target size"));
        }
        Ok(())
    }
}

/// True if the first 8 KiB contain a NUL byte.
#[must_use]
pub fn is_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0)
}

/// Rebuild file content from `(start_line, content)` pairs in index order.
///
/// Lines not covered by any chunk come back blank; overlapping lines are
/// taken from the first chunk covering them. The result uses `\n` line
/// endings and ends at the last non-blank line, so it is not byte-identical
/// to a file with `\r\n` endings or trailing blank lines.
#[must_use]
pub fn assemble<'a>(parts: impl IntoIterator<Item = (usize, &'a str)>) -> String {
    let mut lines: Vec<&str> = Vec::new();

    for (start_line, content) in parts {
        let first = start_line.saturating_sub(1);
        for (offset, line) in content.split('\n').enumerate() {
            let position = first + offset;
            if position < lines.len() {
                continue;
            }
            lines.resize(position, "");
            lines.push(line);
        }
    }

    lines.join("\n")
}

/// Content chunker.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
    registry: FiletypeRegistry,
}

impl Chunker {
    /// Create a new chunker with config.
    #[must_use]
    pub const fn new(config: ChunkerConfig, registry: FiletypeRegistry) -> Self {
        Self { config, registry }
    }

    /// Create a chunker with default config.
    #[must_use]
    pub fn default_chunker() -> Self {
        Self::new(ChunkerConfig::default(), FiletypeRegistry::default())
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Strategy used for `filetype`.
    #[must_use]
    pub fn strategy_for(&self, filetype: &str) -> Strategy {
        self.registry.strategy_for(filetype)
    }

    /// Decode raw file bytes. Invalid UTF-8 is replaced, binary content is
    /// rejected.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::Binary`] when a NUL byte appears early on.
    pub fn decode<'a>(path: &Path, bytes: &'a [u8]) -> std::result::Result<Cow<'a, str>, ChunkError> {
        if is_binary(bytes) {
            return Err(ChunkError::Binary(path.display().to_string()));
        }
        Ok(String::from_utf8_lossy(bytes))
    }

    /// Chunk `content` using the strategy registered for `filetype`.
    #[must_use]
    pub fn chunk(&self, path: &Path, content: &str, filetype: &str) -> Vec<Chunk> {
        let strategy = self.strategy_for(filetype);
        let chunks = self.chunk_with(content, strategy);
        tracing::trace!(
            path = %path.display(),
            filetype,
            ?strategy,
            chunks = chunks.len(),
            "Chunked file"
        );
        chunks
    }

    /// Chunk `content` with an explicit strategy.
    ///
    /// Lines split on `\n` or `\r\n` and chunk content joins them with
    /// `\n`. Blank lines at the edges of a chunk are dropped, along with the
    /// file's final newline.
    #[must_use]
    pub fn chunk_with(&self, content: &str, strategy: Strategy) -> Vec<Chunk> {
        let lines: Vec<&str> = content.lines().collect();
        if lines.is_empty() {
            return Vec::new();
        }

        let ranges = match strategy {
            Strategy::Skip => Vec::new(),
            Strategy::Window => self.window_ranges(&lines),
            Strategy::Prose => self.prose_ranges(&lines),
            Strategy::Code => self
                .code_ranges(&lines)
                .unwrap_or_else(|| self.window_ranges(&lines)),
        };

        let mut chunks = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            let text = lines[start..end].join("\n");
            if text.trim().is_empty() {
                continue;
            }
            chunks.push(Chunk {
                index: chunks.len(),
                start_line: start + 1,
                end_line: end,
                content: text,
            });
        }
        chunks
    }

    /// Half-open line ranges split at top-level definitions, or `None` when
    /// the file has none.
    fn code_ranges(&self, lines: &[&str]) -> Option<Vec<(usize, usize)>> {
        let mut starts: Vec<usize> = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            if !is_definition(line) {
                continue;
            }
            let mut start = i;
            while start > 0 && is_attached(lines[start - 1]) {
                start -= 1;
            }
            let floor = starts.last().map_or(0, |prev| prev + 1);
            starts.push(start.max(floor));
        }

        if starts.is_empty() {
            return None;
        }
        if starts[0] > 0 {
            starts.insert(0, 0);
        }

        let mut ranges = Vec::new();
        for (n, &start) in starts.iter().enumerate() {
            let end = starts.get(n + 1).copied().unwrap_or(lines.len());
            let Some((start, end)) = trim_blank(lines, start, end) else {
                continue;
            };
            self.push_split(&mut ranges, start, end);
        }
        Some(ranges)
    }

    fn prose_ranges(&self, lines: &[&str]) -> Vec<(usize, usize)> {
        let mut ranges = Vec::new();
        let mut current: Option<(usize, usize)> = None;

        for block in prose_blocks(lines) {
            if block.end - block.start > self.config.max_lines {
                if let Some(range) = current.take() {
                    ranges.push(range);
                }
                self.push_split(&mut ranges, block.start, block.end);
                continue;
            }

            current = match current {
                Some((start, _)) if !block.heading && block.end - start <= self.config.target_lines => {
                    Some((start, block.end))
                }
                Some(range) => {
                    ranges.push(range);
                    Some((block.start, block.end))
                }
                None => Some((block.start, block.end)),
            };
        }

        ranges.extend(current);
        ranges
    }

    fn window_ranges(&self, lines: &[&str]) -> Vec<(usize, usize)> {
        if lines.len() <= self.config.max_lines {
            return vec![(0, lines.len())];
        }

        let mut ranges: Vec<(usize, usize)> = Vec::new();
        let mut start = 0;

        loop {
            let end = self.find_window_end(lines, start);
            ranges.push((start, end));
            if end >= lines.len() {
                break;
            }
            start = end.saturating_sub(self.config.overlap_lines).max(start + 1);
        }

        // Fold a short tail into the window before it when that still fits.
        if ranges.len() >= 2 {
            let (tail_start, tail_end) = ranges[ranges.len() - 1];
            let (prev_start, _) = ranges[ranges.len() - 2];
            if tail_end - tail_start < self.config.min_lines
                && tail_end - prev_start <= self.config.max_lines
            {
                ranges.pop();
                if let Some(prev) = ranges.last_mut() {
                    prev.1 = tail_end;
                }
            }
        }

        ranges
    }

    /// Exclusive end for a window starting at `start`: the latest break
    /// point between the target and maximum sizes, else the target.
    fn find_window_end(&self, lines: &[&str], start: usize) -> usize {
        let ideal_end = (start + self.config.target_lines).min(lines.len());
        let max_end = (start + self.config.max_lines).min(lines.len());

        (ideal_end..=max_end)
            .rev()
            .find(|&i| is_break_point(lines, i))
            .unwrap_or(ideal_end)
    }

    fn push_split(&self, ranges: &mut Vec<(usize, usize)>, start: usize, end: usize) {
        let mut piece = start;
        while piece < end {
            let piece_end = (piece + self.config.max_lines).min(end);
            ranges.push((piece, piece_end));
            piece = piece_end;
        }
    }
}

const DEFINITION_STARTS: &[&str] = &[
    "fn ",
    "pub fn ",
    "pub(crate) fn ",
    "async fn ",
    "pub async fn ",
    "const fn ",
    "pub const fn ",
    "unsafe fn ",
    "impl ",
    "impl<",
    "struct ",
    "pub struct ",
    "pub(crate) struct ",
    "enum ",
    "pub enum ",
    "trait ",
    "pub trait ",
    "mod ",
    "pub mod ",
    "macro_rules!",
    "def ",
    "async def ",
    "class ",
    "function ",
    "async function ",
    "export ",
    "func ",
    "interface ",
    "public ",
    "private ",
    "protected ",
];

/// Column-0 line that opens a definition.
fn is_definition(line: &str) -> bool {
    DEFINITION_STARTS.iter().any(|s| line.starts_with(s))
}

/// Column-0 comment, attribute or decorator that belongs to the next
/// definition.
fn is_attached(line: &str) -> bool {
    if line.trim().is_empty() {
        return false;
    }
    ["#", "//", "/*", "@", "--", ";"]
        .iter()
        .any(|p| line.starts_with(p))
        || (line.starts_with(' ') && line.trim_start().starts_with('*'))
}

fn is_break_point(lines: &[&str], pos: usize) -> bool {
    pos >= lines.len() || lines[pos].trim().is_empty() || is_definition(lines[pos])
}

fn trim_blank(lines: &[&str], mut start: usize, mut end: usize) -> Option<(usize, usize)> {
    while start < end && lines[start].trim().is_empty() {
        start += 1;
    }
    while end > start && lines[end - 1].trim().is_empty() {
        end -= 1;
    }
    (start < end).then_some((start, end))
}

#[derive(Debug)]
struct Block {
    start: usize,
    end: usize,
    heading: bool,
}

fn is_atx_heading(line: &str) -> bool {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|&c| c == '#').count();
    (1..=6).contains(&hashes)
        && trimmed[hashes..]
            .chars()
            .next()
            .map_or(true, char::is_whitespace)
}

fn is_setext_underline(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.len() >= 2
        && (trimmed.chars().all(|c| c == '=') || trimmed.chars().all(|c| c == '-'))
}

fn starts_setext(lines: &[&str], i: usize) -> bool {
    i + 1 < lines.len()
        && !lines[i].trim().is_empty()
        && !is_setext_underline(lines[i])
        && is_setext_underline(lines[i + 1])
}

fn heading_at(lines: &[&str], i: usize) -> bool {
    is_atx_heading(lines[i]) || starts_setext(lines, i)
}

/// Runs of non-blank lines; a heading always opens a new block.
fn prose_blocks(lines: &[&str]) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if lines[i].trim().is_empty() {
            i += 1;
            continue;
        }

        let start = i;
        let heading = heading_at(lines, start);
        i += if starts_setext(lines, start) { 2 } else { 1 };
        while i < lines.len() && !lines[i].trim().is_empty() && !heading_at(lines, i) {
            i += 1;
        }

        blocks.push(Block {
            start,
            end: i,
            heading,
        });
    }

    blocks
}
