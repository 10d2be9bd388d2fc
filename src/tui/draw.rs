// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jason Ish

use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Paragraph, Scrollbar, ScrollbarOrientation, ScrollbarState},
};

use super::app::App;
use super::input::cursor_column;

pub(crate) const SPINNER_FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

const INPUT_HEIGHT: u16 = 3;

pub(crate) fn draw(frame: &mut Frame, app: &mut App) {
    let [output_area, status_area, input_area] = Layout::vertical([
        Constraint::Min(3),
        Constraint::Length(1),
        Constraint::Length(INPUT_HEIGHT),
    ])
    .areas(frame.area());

    draw_output(frame, output_area, app);
    draw_status(frame, status_area, app);
    draw_input(frame, input_area, app);
}

fn draw_output(frame: &mut Frame, area: Rect, app: &mut App) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Ask AI ");
    let inner = block.inner(area);
    app.last_viewport_height = inner.height;

    let max_scroll = app.max_scroll();
    app.scroll_lines = app.scroll_lines.min(max_scroll);
    let top = max_scroll - app.scroll_lines;
    let bottom = (top + inner.height as usize).min(app.lines.len());

    let lines: Vec<Line> = app.lines[top..bottom]
        .iter()
        .map(|l| Line::raw(l.as_str()))
        .collect();
    frame.render_widget(Paragraph::new(lines).block(block), area);

    if max_scroll > 0 {
        let scrollbar = Scrollbar::new(ScrollbarOrientation::VerticalRight)
            .begin_symbol(Some("▴"))
            .end_symbol(Some("▾"))
            .track_symbol(Some(" "))
            .thumb_symbol("│");
        // scroll_lines counts up from the bottom, the scrollbar counts down from the top.
        let mut state = ScrollbarState::new(max_scroll)
            .position(top)
            .viewport_content_length(inner.height as usize);
        frame.render_stateful_widget(scrollbar, area, &mut state);
    }
}

fn draw_status(frame: &mut Frame, area: Rect, app: &App) {
    let mut spans = Vec::new();
    if app.busy {
        spans.push(Span::styled(
            SPINNER_FRAMES[app.spinner_frame % SPINNER_FRAMES.len()],
            Style::default().fg(Color::Cyan),
        ));
        spans.push(Span::raw(" "));
    }
    spans.push(Span::styled(
        app.status.as_str(),
        Style::default().fg(Color::DarkGray),
    ));
    if app.scroll_lines > 0 {
        spans.push(Span::styled(
            format!(" | {} lines above bottom", app.scroll_lines),
            Style::default().fg(Color::DarkGray),
        ));
    }
    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn draw_input(frame: &mut Frame, area: Rect, app: &App) {
    let block = Block::default().borders(Borders::ALL).title(" Message ");
    let inner = block.inner(area);

    // Keep the cursor visible by scrolling long input horizontally.
    let column = cursor_column(&app.input, app.cursor);
    let visible = (inner.width as usize).max(1);
    let offset = (column + 1).saturating_sub(visible);

    let paragraph = Paragraph::new(app.input.as_str())
        .block(block)
        .scroll((0, u16::try_from(offset).unwrap_or(u16::MAX)));
    frame.render_widget(paragraph, area);

    if inner.width > 0 && inner.height > 0 {
        let x = inner.x + u16::try_from(column - offset).unwrap_or(0);
        frame.set_cursor_position((x.min(inner.right().saturating_sub(1)), inner.y));
    }
}
