// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jason Ish

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::conversation::ConversationView;

use super::input::InputEditor;

/// What the event loop should do after a key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyAction {
    None,
    Submit,
    Quit,
}

pub(crate) struct App {
    pub(crate) lines: Vec<String>,
    pub(crate) status: String,
    /// Lines scrolled up from the bottom of the output.
    pub(crate) scroll_lines: usize,
    /// Output rows visible on the last draw, used for paging.
    pub(crate) last_viewport_height: u16,
    pub(crate) input: String,
    pub(crate) cursor: usize,
    pub(crate) busy: bool,
    pub(crate) spinner_frame: usize,
    width: u16,
}

impl App {
    pub(crate) fn new(width: u16) -> Self {
        Self {
            lines: Vec::new(),
            status: String::new(),
            scroll_lines: 0,
            last_viewport_height: 0,
            input: String::new(),
            cursor: 0,
            busy: false,
            spinner_frame: 0,
            width,
        }
    }

    pub(crate) fn set_width(&mut self, width: u16) {
        self.width = width;
    }

    pub(crate) fn max_scroll(&self) -> usize {
        self.lines
            .len()
            .saturating_sub(self.last_viewport_height as usize)
    }

    pub(crate) fn scroll_up_by(&mut self, amount: usize) {
        self.scroll_lines = (self.scroll_lines + amount).min(self.max_scroll());
    }

    pub(crate) fn scroll_down_by(&mut self, amount: usize) {
        self.scroll_lines = self.scroll_lines.saturating_sub(amount);
    }

    fn page(&self) -> usize {
        (self.last_viewport_height as usize).saturating_sub(1).max(1)
    }

    pub(crate) fn handle_key(&mut self, key: KeyEvent) -> KeyAction {
        match (key.code, key.modifiers) {
            (KeyCode::Esc, _) | (KeyCode::Char('c'), KeyModifiers::CONTROL) => KeyAction::Quit,
            (KeyCode::Enter, _) => KeyAction::Submit,
            (KeyCode::Backspace, _) => {
                self.backspace();
                KeyAction::None
            }
            (KeyCode::Delete, _) | (KeyCode::Char('d'), KeyModifiers::CONTROL) => {
                self.delete_forward();
                KeyAction::None
            }
            (KeyCode::Left, _) | (KeyCode::Char('b'), KeyModifiers::CONTROL) => {
                self.move_left();
                KeyAction::None
            }
            (KeyCode::Right, _) | (KeyCode::Char('f'), KeyModifiers::CONTROL) => {
                self.move_right();
                KeyAction::None
            }
            (KeyCode::Home, _) | (KeyCode::Char('a'), KeyModifiers::CONTROL) => {
                self.move_to_start();
                KeyAction::None
            }
            (KeyCode::End, _) | (KeyCode::Char('e'), KeyModifiers::CONTROL) => {
                self.move_to_end();
                KeyAction::None
            }
            (KeyCode::Char('u'), KeyModifiers::CONTROL) => {
                self.delete_to_start();
                KeyAction::None
            }
            (KeyCode::Char('w'), KeyModifiers::CONTROL) => {
                self.delete_word_backward();
                KeyAction::None
            }
            (KeyCode::Up, _) => {
                self.scroll_up_by(1);
                KeyAction::None
            }
            (KeyCode::Down, _) => {
                self.scroll_down_by(1);
                KeyAction::None
            }
            (KeyCode::PageUp, _) => {
                self.scroll_up_by(self.page());
                KeyAction::None
            }
            (KeyCode::PageDown, _) => {
                self.scroll_down_by(self.page());
                KeyAction::None
            }
            (KeyCode::Char(ch), modifiers)
                if !modifiers.intersects(KeyModifiers::CONTROL | KeyModifiers::ALT) =>
            {
                self.insert_char(ch);
                KeyAction::None
            }
            _ => KeyAction::None,
        }
    }
}

impl InputEditor for App {
    fn input(&self) -> &str {
        &self.input
    }

    fn input_mut(&mut self) -> &mut String {
        &mut self.input
    }

    fn cursor(&self) -> usize {
        self.cursor
    }

    fn set_cursor(&mut self, pos: usize) {
        self.cursor = pos;
    }
}

impl ConversationView for App {
    fn push_line(&mut self, text: String) {
        self.lines.push(text);
    }

    fn replace_line(&mut self, index: usize, text: String) {
        match self.lines.get_mut(index) {
            Some(line) => *line = text,
            None => self.lines.push(text),
        }
    }

    fn line_count(&self) -> usize {
        self.lines.len()
    }

    fn scroll_to_bottom(&mut self) {
        self.scroll_lines = 0;
    }

    fn set_status(&mut self, text: String) {
        self.status = text;
    }

    fn width(&self) -> u16 {
        self.width
    }
}
