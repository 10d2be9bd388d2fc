// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jason Ish

//! Full screen terminal interface: an output pane, a status line and an
//! input box.

mod app;
mod draw;
mod input;

use std::io;
use std::time::Duration;

use crossterm::{
    cursor::Show as ShowCursor,
    event::{DisableBracketedPaste, EnableBracketedPaste, Event, EventStream, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use futures::StreamExt;
use ratatui::prelude::*;
use tokio::time::interval;

use crate::conversation::{ConversationView, Orchestrator, State, Submission};
use crate::error::Result;
use crate::provider::ClientFactory;
use crate::store::{ConversationId, ConversationStore};

use app::{App, KeyAction};
use draw::draw;
use input::InputEditor;

const TICK: Duration = Duration::from_millis(80);

/// Run the interface until the user quits.
pub(crate) async fn run<S, F>(
    orchestrator: Orchestrator<S, F>,
    resume: Option<ConversationId>,
) -> Result<()>
where
    S: ConversationStore,
    F: ClientFactory,
{
    setup_terminal()?;

    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let _ = restore_terminal();
        original_hook(panic_info);
    }));

    let result = run_app(orchestrator, resume).await;

    if let Err(e) = restore_terminal() {
        tracing::warn!("Failed to restore terminal: {e}");
    }
    result
}

fn setup_terminal() -> io::Result<()> {
    enable_raw_mode()?;
    execute!(io::stdout(), EnterAlternateScreen, EnableBracketedPaste)?;
    Ok(())
}

fn restore_terminal() -> io::Result<()> {
    disable_raw_mode()?;
    execute!(
        io::stdout(),
        ShowCursor,
        DisableBracketedPaste,
        LeaveAlternateScreen
    )?;
    Ok(())
}

async fn run_app<S, F>(
    mut orchestrator: Orchestrator<S, F>,
    resume: Option<ConversationId>,
) -> Result<()>
where
    S: ConversationStore,
    F: ClientFactory,
{
    let mut terminal = Terminal::new(CrosstermBackend::new(io::stdout()))?;
    let mut app = App::new(crossterm::terminal::size()?.0);

    orchestrator.start(&mut app);
    if let Some(id) = resume
        && let Err(e) = orchestrator.resume(id, &mut app)
    {
        tracing::warn!("Could not resume conversation {id}: {e}");
        app.push_line(format!("Error: {}", e.tui_message()));
    }

    let mut event_stream = EventStream::new();
    let mut tick_interval = interval(TICK);
    let mut needs_redraw = true;

    loop {
        app.busy = orchestrator.state() == State::Streaming;

        if needs_redraw {
            terminal.draw(|frame| draw(frame, &mut app))?;
            needs_redraw = false;
        }

        tokio::select! {
            update = orchestrator.next_update(), if orchestrator.has_pending_work() => {
                orchestrator.handle_update(update, &mut app);
                needs_redraw = true;
            }
            _ = tick_interval.tick() => {
                if app.busy {
                    app.spinner_frame = app.spinner_frame.wrapping_add(1);
                    needs_redraw = true;
                }
            }
            maybe_event = event_stream.next() => {
                let Some(event) = maybe_event else {
                    break;
                };
                match event? {
                    Event::Key(key) => {
                        if !matches!(key.kind, KeyEventKind::Press | KeyEventKind::Repeat) {
                            continue;
                        }
                        match app.handle_key(key) {
                            KeyAction::Quit => break,
                            KeyAction::Submit => {
                                let input = app.input.clone();
                                if orchestrator.submit(&input, &mut app) != Submission::Refused {
                                    app.clear_input();
                                }
                            }
                            KeyAction::None => {}
                        }
                        needs_redraw = true;
                    }
                    Event::Paste(paste) => {
                        app.insert_str_at_cursor(&paste);
                        needs_redraw = true;
                    }
                    Event::Resize(cols, _) => {
                        app.set_width(cols);
                        needs_redraw = true;
                    }
                    _ => {}
                }
            }
        }
    }

    if orchestrator.is_streaming() {
        tracing::info!("Quitting with a response still streaming");
    }
    tracing::info!(
        conversation_id = ?orchestrator.conversation_id(),
        model = orchestrator.model_name(),
        "Exiting"
    );
    Ok(())
}
