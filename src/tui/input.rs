// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jason Ish

use unicode_width::UnicodeWidthStr;

/// Snap a byte offset back to the nearest UTF-8 character boundary.
pub(crate) fn snap_to_char_boundary(text: &str, pos: usize) -> usize {
    let mut pos = pos.min(text.len());
    while pos > 0 && !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

/// Display column of a byte offset.
pub(crate) fn cursor_column(text: &str, cursor: usize) -> usize {
    text[..snap_to_char_boundary(text, cursor)].width()
}

/// Single line editing, implemented by App.
pub(crate) trait InputEditor {
    fn input(&self) -> &str;
    fn input_mut(&mut self) -> &mut String;
    fn cursor(&self) -> usize;
    fn set_cursor(&mut self, pos: usize);

    fn insert_str_at_cursor(&mut self, s: &str) {
        // The input is a single line.
        let s: String = s
            .chars()
            .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
            .filter(|c| !c.is_control())
            .collect();
        let cursor = snap_to_char_boundary(self.input(), self.cursor());
        self.input_mut().insert_str(cursor, &s);
        self.set_cursor(cursor + s.len());
    }

    fn insert_char(&mut self, ch: char) {
        let mut buf = [0u8; 4];
        self.insert_str_at_cursor(ch.encode_utf8(&mut buf));
    }

    fn backspace(&mut self) {
        let cursor = self.cursor();
        let input = self.input_mut();
        if let Some((idx, _)) = input[..cursor].char_indices().last() {
            input.drain(idx..cursor);
            self.set_cursor(idx);
        }
    }

    fn delete_forward(&mut self) {
        let cursor = self.cursor();
        let input = self.input_mut();
        if let Some(ch) = input[cursor..].chars().next() {
            input.drain(cursor..cursor + ch.len_utf8());
        }
    }

    fn delete_word_backward(&mut self) {
        let cursor = self.cursor();
        let text = &self.input()[..cursor];
        let trimmed = text.trim_end();
        let start = trimmed
            .char_indices()
            .rev()
            .find(|(_, ch)| ch.is_whitespace())
            .map(|(idx, ch)| idx + ch.len_utf8())
            .unwrap_or(0);
        self.input_mut().drain(start..cursor);
        self.set_cursor(start);
    }

    fn delete_to_start(&mut self) {
        let cursor = self.cursor();
        self.input_mut().drain(..cursor);
        self.set_cursor(0);
    }

    fn move_left(&mut self) {
        let cursor = self.cursor();
        if let Some((idx, _)) = self.input()[..cursor].char_indices().last() {
            self.set_cursor(idx);
        }
    }

    fn move_right(&mut self) {
        let cursor = self.cursor();
        if let Some(ch) = self.input()[cursor..].chars().next() {
            self.set_cursor(cursor + ch.len_utf8());
        }
    }

    fn move_to_start(&mut self) {
        self.set_cursor(0);
    }

    fn move_to_end(&mut self) {
        self.set_cursor(self.input().len());
    }

    fn clear_input(&mut self) {
        self.input_mut().clear();
        self.set_cursor(0);
    }
}
