// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jason Ish

//! Incremental reflow of streamed text into fixed-width display lines.
//!
//! Fragments arrive with arbitrary boundaries. The engine buffers them and
//! flushes on sentence ends or once the buffer is long enough, appending to
//! the last line while it fits and starting a new line otherwise. Lines keep
//! track of whether they ended on a hard break so the original text can be
//! rebuilt exactly.

use unicode_width::UnicodeWidthStr;

use crate::error::{Error, Result};

/// Buffer length that forces a flush even without a sentence terminator.
pub(crate) const DEFAULT_FLUSH_THRESHOLD: usize = 30;

/// Columns reserved for the output box borders and scrollbar.
pub(crate) const DEFAULT_BORDER_ALLOWANCE: u16 = 4;

const SENTENCE_TERMINATORS: [char; 3] = ['.', '!', '?'];

/// A display update, indexed relative to the first line of the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LineUpdate {
    Push(String),
    Replace { line: usize, text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Line {
    pub text: String,
    /// The line was closed by a `\n` in the source text.
    pub hard_break: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ReflowEngine {
    width: usize,
    flush_threshold: usize,
    pending: String,
    lines: Vec<Line>,
}

impl ReflowEngine {
    pub(crate) fn new(width: usize, flush_threshold: usize) -> Result<Self> {
        if width == 0 {
            return Err(Error::Config("reflow width must be positive".to_string()));
        }
        if flush_threshold == 0 {
            return Err(Error::Config(
                "reflow flush threshold must be positive".to_string(),
            ));
        }
        Ok(Self {
            width,
            flush_threshold,
            pending: String::new(),
            lines: Vec::new(),
        })
    }

    /// Build an engine for a viewport `columns` wide, reserving
    /// `border_allowance` columns.
    pub(crate) fn for_viewport(
        columns: u16,
        border_allowance: u16,
        flush_threshold: usize,
    ) -> Result<Self> {
        let width = columns.saturating_sub(border_allowance) as usize;
        if width == 0 {
            return Err(Error::Config(format!(
                "viewport of {columns} columns leaves no room after {border_allowance} border columns"
            )));
        }
        Self::new(width, flush_threshold)
    }

    #[cfg(test)]
    pub(crate) fn width(&self) -> usize {
        self.width
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> &str {
        &self.pending
    }

    #[cfg(test)]
    pub(crate) fn lines(&self) -> &[Line] {
        &self.lines
    }

    #[cfg(test)]
    pub(crate) fn committed_line_count(&self) -> usize {
        self.lines.len()
    }

    /// Rebuild the text seen so far from committed lines and the buffer.
    #[cfg(test)]
    pub(crate) fn reconstruct(&self) -> String {
        let mut text = String::new();
        for line in &self.lines {
            text.push_str(&line.text);
            if line.hard_break {
                text.push('\n');
            }
        }
        text.push_str(&self.pending);
        text
    }

    /// Feed one fragment and return the resulting display updates.
    pub(crate) fn push(&mut self, fragment: &str) -> Vec<LineUpdate> {
        let mut updates = Vec::new();
        if fragment.is_empty() {
            return updates;
        }

        if !fragment.contains('\n') {
            self.pending.push_str(fragment);
            if self.should_flush() {
                let buffer = std::mem::take(&mut self.pending);
                self.flush(buffer, &mut updates);
            }
            return updates;
        }

        let mut segments = fragment.split('\n');
        let head = segments.next().unwrap_or_default();
        let tail: Vec<&str> = segments.collect();
        let (trailing, interior) = tail.split_last().map_or(("", &[][..]), |(t, i)| (*t, i));

        self.pending.push_str(head);
        let buffer = std::mem::take(&mut self.pending);
        self.commit_hard_line(buffer, &mut updates);

        for segment in interior {
            self.commit_hard_line((*segment).to_string(), &mut updates);
        }

        self.pending.push_str(trailing);
        updates
    }

    /// Flush whatever is still buffered. Called once the stream is done.
    pub(crate) fn finish(&mut self) -> Vec<LineUpdate> {
        let mut updates = Vec::new();
        if !self.pending.is_empty() {
            let buffer = std::mem::take(&mut self.pending);
            self.push_wrapped(&buffer, &mut updates);
        }
        updates
    }

    fn should_flush(&self) -> bool {
        self.pending
            .trim_end()
            .ends_with(SENTENCE_TERMINATORS)
            || self.pending.chars().count() >= self.flush_threshold
    }

    fn open_line(&self) -> Option<usize> {
        match self.lines.last() {
            Some(line) if !line.hard_break => Some(self.lines.len() - 1),
            _ => None,
        }
    }

    /// Append `buffer` to the open line if it fits, otherwise start new lines.
    fn flush(&mut self, buffer: String, updates: &mut Vec<LineUpdate>) {
        if buffer.is_empty() {
            return;
        }
        if let Some(idx) = self.open_line() {
            let line = &mut self.lines[idx];
            if line.text.width() + buffer.width() <= self.width {
                line.text.push_str(&buffer);
                updates.push(LineUpdate::Replace {
                    line: idx,
                    text: line.text.clone(),
                });
                return;
            }
        }
        self.push_wrapped(&buffer, updates);
    }

    /// Commit `buffer` and close the current line with a hard break. With no
    /// open line this produces a line of its own, possibly empty.
    fn commit_hard_line(&mut self, buffer: String, updates: &mut Vec<LineUpdate>) {
        if self.open_line().is_none() && buffer.is_empty() {
            self.lines.push(Line {
                text: String::new(),
                hard_break: true,
            });
            updates.push(LineUpdate::Push(String::new()));
            return;
        }
        self.flush(buffer, updates);
        if let Some(line) = self.lines.last_mut() {
            line.hard_break = true;
        }
    }

    /// Start new lines for `text`, wrapping at whitespace when it is wider
    /// than the budget. Words wider than the budget keep a line to themselves.
    fn push_wrapped(&mut self, text: &str, updates: &mut Vec<LineUpdate>) {
        for piece in wrap_words(text, self.width) {
            updates.push(LineUpdate::Push(piece.clone()));
            self.lines.push(Line {
                text: piece,
                hard_break: false,
            });
        }
    }
}

/// Greedy word wrap that keeps every character, whitespace included.
fn wrap_words(text: &str, width: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();

    for word in text.split_inclusive(char::is_whitespace) {
        if !current.is_empty() && current.width() + word.width() > width {
            pieces.push(std::mem::take(&mut current));
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "The quick brown fox jumps over the lazy dog. It was not amused!\n\
        Second paragraph follows here, with commas, numbers like 3.14, and a \
        verylongunbreakabletokenthatexceedsthewidth too.\n\nDone? Yes.";

    fn feed(engine: &mut ReflowEngine, fragments: &[&str]) {
        for fragment in fragments {
            engine.push(fragment);
        }
    }

    fn chunk(text: &str, size: usize) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        chars
            .chunks(size)
            .map(|c| c.iter().collect::<String>())
            .collect()
    }

    #[test]
    fn test_rejects_zero_width() {
        assert!(matches!(ReflowEngine::new(0, 30), Err(Error::Config(_))));
        assert!(matches!(
            ReflowEngine::for_viewport(4, 4, 30),
            Err(Error::Config(_))
        ));
        assert!(matches!(ReflowEngine::new(10, 0), Err(Error::Config(_))));
    }

    #[test]
    fn test_viewport_width_subtracts_border() {
        let engine = ReflowEngine::for_viewport(80, 4, 30).unwrap();
        assert_eq!(engine.width(), 76);
    }

    #[test]
    fn test_empty_fragment_is_noop() {
        let mut engine = ReflowEngine::new(20, 30).unwrap();
        assert!(engine.push("").is_empty());
        assert_eq!(engine.committed_line_count(), 0);
        assert_eq!(engine.pending(), "");
    }

    #[test]
    fn test_buffers_until_sentence_end() {
        let mut engine = ReflowEngine::new(10, 30).unwrap();
        assert!(engine.push("Hello ").is_empty());
        assert!(engine.push("world, ").is_empty());
        let updates = engine.push("this is fine.");
        assert!(!updates.is_empty());
        assert_eq!(engine.pending(), "");
        assert_eq!(engine.reconstruct(), "Hello world, this is fine.");
        for line in engine.lines() {
            assert!(line.text.width() <= 10, "line too wide: {:?}", line.text);
        }
    }

    #[test]
    fn test_flushes_at_threshold() {
        let mut engine = ReflowEngine::new(80, 5).unwrap();
        assert!(engine.push("abcd").is_empty());
        let updates = engine.push("e");
        assert_eq!(updates, vec![LineUpdate::Push("abcde".to_string())]);
    }

    #[test]
    fn test_appends_to_open_line_when_it_fits() {
        let mut engine = ReflowEngine::new(40, 30).unwrap();
        assert_eq!(
            engine.push("One."),
            vec![LineUpdate::Push("One.".to_string())]
        );
        assert_eq!(
            engine.push(" Two."),
            vec![LineUpdate::Replace {
                line: 0,
                text: "One. Two.".to_string()
            }]
        );
    }

    #[test]
    fn test_starts_new_line_when_append_overflows() {
        let mut engine = ReflowEngine::new(12, 30).unwrap();
        engine.push("Short one.");
        let updates = engine.push(" Another.");
        assert_eq!(updates, vec![LineUpdate::Push(" Another.".to_string())]);
        assert_eq!(engine.committed_line_count(), 2);
    }

    #[test]
    fn test_newline_fragment_splits_lines() {
        let mut engine = ReflowEngine::new(40, 30).unwrap();
        let updates = engine.push("first\nsecond\nthi");
        assert_eq!(
            updates,
            vec![
                LineUpdate::Push("first".to_string()),
                LineUpdate::Push("second".to_string()),
            ]
        );
        assert_eq!(engine.pending(), "thi");
        engine.push("rd.");
        let texts: Vec<&str> = engine.lines().iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third."]);
    }

    #[test]
    fn test_newline_merges_buffer_into_open_line() {
        let mut engine = ReflowEngine::new(40, 30).unwrap();
        engine.push("Line one.");
        engine.push(" more");
        let updates = engine.push(" text\n");
        assert_eq!(
            updates,
            vec![LineUpdate::Replace {
                line: 0,
                text: "Line one. more text".to_string()
            }]
        );
        assert!(engine.lines()[0].hard_break);
    }

    #[test]
    fn test_bare_newline_produces_empty_line() {
        let mut engine = ReflowEngine::new(40, 30).unwrap();
        let updates = engine.push("\n");
        assert_eq!(updates, vec![LineUpdate::Push(String::new())]);

        engine.push("para.");
        engine.push("\n");
        let updates = engine.push("\n");
        assert_eq!(updates, vec![LineUpdate::Push(String::new())]);
        assert_eq!(engine.reconstruct(), "\npara.\n\n");
    }

    #[test]
    fn test_finish_flushes_remaining_buffer() {
        let mut engine = ReflowEngine::new(40, 30).unwrap();
        engine.push("no terminator");
        assert_eq!(engine.committed_line_count(), 0);
        let updates = engine.finish();
        assert_eq!(updates, vec![LineUpdate::Push("no terminator".to_string())]);
        assert_eq!(engine.pending(), "");
        assert!(engine.finish().is_empty());
    }

    #[test]
    fn test_long_word_is_not_truncated() {
        let mut engine = ReflowEngine::new(8, 30).unwrap();
        engine.push("supercalifragilistic.");
        assert_eq!(engine.lines()[0].text, "supercalifragilistic.");
    }

    #[test]
    fn test_lossless_for_every_chunk_size() {
        for size in 1..=24 {
            let mut engine = ReflowEngine::new(16, DEFAULT_FLUSH_THRESHOLD).unwrap();
            for fragment in chunk(SAMPLE, size) {
                engine.push(&fragment);
            }
            engine.finish();
            assert_eq!(engine.reconstruct(), SAMPLE, "chunk size {size}");
        }
    }

    #[test]
    fn test_width_respected_except_unbreakable_words() {
        for size in 1..=24 {
            let mut engine = ReflowEngine::new(16, DEFAULT_FLUSH_THRESHOLD).unwrap();
            for fragment in chunk(SAMPLE, size) {
                engine.push(&fragment);
            }
            engine.finish();
            for line in engine.lines() {
                let unbreakable = !line.text.trim_end().contains(char::is_whitespace);
                assert!(
                    line.text.width() <= 16 || unbreakable,
                    "chunk size {size}: {:?}",
                    line.text
                );
            }
        }
    }

    #[test]
    fn test_replay_is_deterministic() {
        let fragments = chunk(SAMPLE, 7);
        let fragments: Vec<&str> = fragments.iter().map(String::as_str).collect();

        let mut first = ReflowEngine::new(20, 30).unwrap();
        feed(&mut first, &fragments);
        first.finish();

        let mut second = ReflowEngine::new(20, 30).unwrap();
        feed(&mut second, &fragments);
        second.finish();

        assert_eq!(first.lines(), second.lines());
    }

    #[test]
    fn test_updates_replay_into_same_lines() {
        let mut engine = ReflowEngine::new(18, 30).unwrap();
        let mut view: Vec<String> = Vec::new();
        let mut apply = |updates: Vec<LineUpdate>| {
            for update in updates {
                match update {
                    LineUpdate::Push(text) => view.push(text),
                    LineUpdate::Replace { line, text } => view[line] = text,
                }
            }
        };
        for fragment in chunk(SAMPLE, 5) {
            apply(engine.push(&fragment));
        }
        apply(engine.finish());

        let expected: Vec<String> = engine.lines().iter().map(|l| l.text.clone()).collect();
        assert_eq!(view, expected);
    }

    #[test]
    fn test_wide_characters_count_as_two_columns() {
        // Four chars each would fit in eight columns; seven plus four does not.
        let mut engine = ReflowEngine::new(8, 30).unwrap();
        engine.push("日本語.");
        engine.push(" ok.");
        let texts: Vec<&str> = engine.lines().iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["日本語.", " ok."]);
    }
}
