mod clipboard;
mod help;
mod state;

use crate::cli::{build_config, build_registry, load_blob, parse_input, read_program, Cli};
use crate::export::CsvExporter;
use crate::inputs::BindingUpdate;
use crate::model::{Phase, SessionEvent, TraceFormat};
use crate::orchestrator::{
    self, derived_summary, select_row, tab_titles, timing_summary, PredicateTab,
    SessionController, TracingCoordinator, UiCommand, UiUpdate,
};
use crate::worker::ProcessWorkerFactory;
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Tabs, Wrap},
    Terminal,
};
use state::{step_index, InputMode, Pane, UiState, ROW_PAGE};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{io, time::Duration, time::Instant};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let registry = build_registry(&args)?;

    let session = SessionController::new(Arc::new(ProcessWorkerFactory::new(&cfg)));
    let exporter = Arc::new(CsvExporter::new(&cfg.export_dir, cfg.export_page_size));

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let (update_tx, update_rx) = mpsc::unbounded_channel::<UiUpdate>();

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_session = session.clone();
    let program_path = cfg.program_path.clone();
    let run_on_launch = args.run_on_launch;
    let ui_handle = std::thread::spawn(move || {
        let mut state = UiState {
            registry,
            ..Default::default()
        };
        if run_on_launch {
            request_run(&program_path, &mut state, &cmd_tx);
        }
        run_threaded(ui_session, program_path, state, update_rx, cmd_tx)
    });

    let res = orchestrator::run_dispatcher(session, exporter, cmd_rx, update_tx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Read the program from disk and submit it with the current inputs.
fn request_run(program_path: &Path, state: &mut UiState, cmd_tx: &UnboundedSender<UiCommand>) {
    match read_program(program_path) {
        Ok(program) => {
            state.info = "Running…".into();
            state.clear_rows();
            let _ = cmd_tx.send(UiCommand::Run {
                program,
                bindings: state.registry.snapshot(),
            });
        }
        Err(e) => state.info = format!("{e:#}"),
    }
}

fn request_trace(
    tracing: &TracingCoordinator,
    state: &mut UiState,
    cmd_tx: &UnboundedSender<UiCommand>,
    format: TraceFormat,
) {
    if let Err(rejected) = tracing.check() {
        state.info = format!("Cannot trace now: {rejected}");
        return;
    }
    let fact = tracing.pending_fact();
    if fact.trim().is_empty() {
        state.info = "Enter a fact first (e)".into();
        return;
    }
    state.info = format!("Tracing {fact}…");
    state.pane = Pane::Trace;
    state.trace_scroll = 0;
    let _ = cmd_tx.send(UiCommand::Trace { fact, format });
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(
    session: SessionController,
    program_path: PathBuf,
    mut state: UiState,
    mut update_rx: UnboundedReceiver<UiUpdate>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let tracing = session.tracing();
    let mut events = session.subscribe();

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        while let Ok(update) = update_rx.try_recv() {
            state.apply_update(update);
        }
        loop {
            match events.try_recv() {
                Ok(SessionEvent::Notice(msg)) => state.info = msg,
                Ok(SessionEvent::PhaseChanged { phase: Phase::Failed }) => {
                    state.info = "Run failed".into();
                }
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }

        state.refresh_session(session.snapshot());
        state.trace = tracing.result();
        state.pending_fact = tracing.pending_fact();
        state.trace_available = tracing.check().is_ok();

        if let Some((predicate, offset)) = state.wanted_rows() {
            state.mark_rows_requested(&predicate, offset);
            let _ = cmd_tx.send(UiCommand::LoadRows {
                predicate,
                offset,
                limit: ROW_PAGE,
            });
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                if state.mode != InputMode::Normal {
                    handle_edit_key(k.code, &tracing, &mut state);
                    continue;
                }
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                    (_, KeyCode::Char('r')) => request_run(&program_path, &mut state, &cmd_tx),
                    (_, KeyCode::Char('s')) => {
                        let _ = cmd_tx.send(UiCommand::Stop);
                    }
                    (_, KeyCode::Tab) => state.pane = state.pane.cycle(true),
                    (_, KeyCode::BackTab) => state.pane = state.pane.cycle(false),
                    (_, KeyCode::Char('?')) => state.pane = Pane::Help,
                    (_, KeyCode::Char('e')) => {
                        state.edit_buffer = tracing.pending_fact();
                        state.mode = InputMode::EditFact;
                    }
                    (_, KeyCode::Char('a')) => {
                        request_trace(&tracing, &mut state, &cmd_tx, TraceFormat::Ascii)
                    }
                    (_, KeyCode::Char('g')) => {
                        request_trace(&tracing, &mut state, &cmd_tx, TraceFormat::GraphStructured)
                    }
                    (_, KeyCode::Char('y')) => {
                        if state.trace.payload.is_empty() {
                            state.info = "Nothing to copy yet".into();
                        } else {
                            state.info = match clipboard::copy_to_clipboard(&state.trace.payload) {
                                Ok(()) => "✓ Copied trace to clipboard".into(),
                                Err(e) => format!("Clipboard copy failed: {e:#}"),
                            };
                        }
                    }
                    (_, code) => match state.pane {
                        Pane::Results => handle_results_key(code, &tracing, &mut state, &cmd_tx),
                        Pane::Inputs => handle_inputs_key(code, &mut state),
                        Pane::Trace => match code {
                            KeyCode::Up | KeyCode::Char('k') => {
                                state.trace_scroll = state.trace_scroll.saturating_sub(1)
                            }
                            KeyCode::Down | KeyCode::Char('j') => {
                                state.trace_scroll = state.trace_scroll.saturating_add(1)
                            }
                            _ => {}
                        },
                        Pane::Help => {}
                    },
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn handle_results_key(
    code: KeyCode,
    tracing: &TracingCoordinator,
    state: &mut UiState,
    cmd_tx: &UnboundedSender<UiCommand>,
) {
    match code {
        KeyCode::Left | KeyCode::Char('h') => state.select_predicate(-1),
        KeyCode::Right | KeyCode::Char('l') => state.select_predicate(1),
        KeyCode::Up | KeyCode::Char('k') => {
            state.row_selected = step_index(state.row_selected, -1, state.rows.len());
        }
        KeyCode::Down | KeyCode::Char('j') => {
            state.row_selected = step_index(state.row_selected, 1, state.rows.len());
        }
        KeyCode::Enter => {
            let Some(predicate) = state.rows_predicate.clone() else {
                return;
            };
            if let Some(row) = state.selected_row() {
                select_row(tracing, &predicate, row);
                state.info = format!("Fact set to {}", tracing.pending_fact());
            }
        }
        KeyCode::Char('d') => match state.current_predicate() {
            Some(predicate) => {
                state.info = format!("Downloading {predicate}…");
                let _ = cmd_tx.send(UiCommand::Download { predicate });
            }
            None => state.info = "No output predicate to download".into(),
        },
        _ => {}
    }
}

fn handle_inputs_key(code: KeyCode, state: &mut UiState) {
    let len = state.registry.len();
    match code {
        KeyCode::Up | KeyCode::Char('k') => {
            state.input_selected = step_index(state.input_selected, -1, len);
        }
        KeyCode::Down | KeyCode::Char('j') => {
            state.input_selected = step_index(state.input_selected, 1, len);
        }
        KeyCode::Char('i') => {
            state.edit_buffer.clear();
            state.mode = InputMode::AddBinding;
        }
        KeyCode::Char('f') if len > 0 => {
            state.edit_buffer.clear();
            state.mode = InputMode::AttachFile;
        }
        KeyCode::Char('u') if len > 0 => {
            state.registry.replace_at(
                state.input_selected,
                BindingUpdate {
                    file: Some(None),
                    ..Default::default()
                },
            );
            state.info = "File detached (applies to the next run)".into();
        }
        KeyCode::Char('x') if len > 0 => {
            state.registry.remove_at(state.input_selected);
            state.input_selected = step_index(state.input_selected, 0, state.registry.len());
            state.info = "Input removed (applies to the next run)".into();
        }
        _ => {}
    }
}

fn handle_edit_key(code: KeyCode, tracing: &TracingCoordinator, state: &mut UiState) {
    match code {
        KeyCode::Esc => {
            state.mode = InputMode::Normal;
            state.edit_buffer.clear();
        }
        KeyCode::Backspace => {
            state.edit_buffer.pop();
        }
        KeyCode::Char(c) => state.edit_buffer.push(c),
        KeyCode::Enter => {
            let text = std::mem::take(&mut state.edit_buffer);
            match state.mode {
                InputMode::EditFact => tracing.set_pending_fact(text.trim()),
                InputMode::AddBinding => match parse_input(&text) {
                    Ok(binding) => {
                        state.registry.add(binding);
                        state.input_selected = state.registry.len() - 1;
                        state.info = "Input added (applies to the next run)".into();
                    }
                    Err(e) => state.info = format!("{e:#}"),
                },
                InputMode::AttachFile => match load_blob(Path::new(text.trim())) {
                    Ok(blob) => {
                        state.registry.replace_at(
                            state.input_selected,
                            BindingUpdate {
                                file: Some(Some(blob)),
                                ..Default::default()
                            },
                        );
                        state.info = "File attached (applies to the next run)".into();
                    }
                    Err(e) => state.info = format!("{e:#}"),
                },
                InputMode::Normal => {}
            }
            state.mode = InputMode::Normal;
        }
        _ => {}
    }
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(3),
                Constraint::Length(4),
                Constraint::Min(0),
                Constraint::Length(3),
            ]
            .as_ref(),
        )
        .split(area);

    let tabs = Tabs::new(Pane::ALL.iter().map(|p| Line::from(p.title())).collect::<Vec<_>>())
        .select(state.pane.index())
        .block(Block::default().borders(Borders::ALL).title("reasoner-panel"))
        .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    draw_status(chunks[1], f, state);

    match state.pane {
        Pane::Results => draw_results(chunks[2], f, state, &tab_titles(&state.session)),
        Pane::Inputs => draw_inputs(chunks[2], f, state),
        Pane::Trace => draw_trace(chunks[2], f, state),
        Pane::Help => help::draw_help(chunks[2], f),
    }

    draw_footer(chunks[3], f, state);
}

fn phase_color(phase: Phase) -> Color {
    match phase {
        Phase::Idle => Color::Gray,
        Phase::Running => Color::Yellow,
        Phase::Ready => Color::Green,
        Phase::Failed => Color::Red,
    }
}

fn draw_status(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let s = &state.session;
    let mut first = vec![
        Span::raw("Status: "),
        Span::styled(s.phase.label(), Style::default().fg(phase_color(s.phase))),
    ];
    if s.worker_busy {
        first.push(Span::styled("  (worker busy)", Style::default().fg(Color::Yellow)));
    }
    if let Some(derived) = derived_summary(s) {
        first.push(Span::raw(format!("  {derived}")));
    }
    let second = match (s.last_error.as_deref(), timing_summary(s)) {
        (Some(err), _) => Line::from(Span::styled(
            format!("Error: {err}"),
            Style::default().fg(Color::Red),
        )),
        (None, Some(timings)) => Line::from(format!("Timings: {timings}")),
        (None, None) => Line::from(""),
    };
    let p = Paragraph::new(vec![Line::from(first), second])
        .block(Block::default().borders(Borders::ALL).title("Session"))
        .wrap(Wrap { trim: true });
    f.render_widget(p, area);
}

fn draw_results(area: Rect, f: &mut ratatui::Frame, state: &UiState, tabs: &[PredicateTab]) {
    if tabs.is_empty() {
        let msg = match state.session.phase {
            Phase::Running => "Waiting for the run to finish…",
            Phase::Failed => "The run failed; see the error above.",
            _ => "No output predicates. Press r to run.",
        };
        let p = Paragraph::new(msg).block(Block::default().borders(Borders::ALL).title("Results"));
        f.render_widget(p, area);
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let predicate_tabs = Tabs::new(
        tabs.iter()
            .map(|t| Line::from(t.label.clone()))
            .collect::<Vec<_>>(),
    )
    .select(state.predicate_selected)
    .block(Block::default().borders(Borders::ALL).title("Output predicates"))
    .highlight_style(Style::default().fg(Color::Cyan));
    f.render_widget(predicate_tabs, chunks[0]);

    let items: Vec<ListItem> = state
        .rows
        .iter()
        .map(|row| ListItem::new(row.join(", ")))
        .collect();
    let title = if state.session.phase != Phase::Ready {
        "Rows (available once the run is ready)".to_string()
    } else if state.rows_requested {
        format!("Rows ({} loaded, loading…)", state.rows.len())
    } else {
        format!("Rows ({} loaded)", state.rows.len())
    };
    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(title))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .highlight_symbol("> ");
    let mut list_state = ListState::default();
    if !state.rows.is_empty() {
        list_state.select(Some(state.row_selected));
    }
    f.render_stateful_widget(list, chunks[1], &mut list_state);
}

fn draw_inputs(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let items: Vec<ListItem> = state
        .registry
        .bindings()
        .iter()
        .map(|b| {
            let file = match &b.file {
                Some(blob) => Span::raw(format!("{} ({} bytes)", blob.name, blob.size())),
                None => Span::styled("no file", Style::default().fg(Color::DarkGray)),
            };
            ListItem::new(Line::from(vec![
                Span::styled(b.resource.clone(), Style::default().fg(Color::Cyan)),
                Span::raw(" ← "),
                file,
            ]))
        })
        .collect();
    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Inputs (used by the next run)"),
        )
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .highlight_symbol("> ");
    let mut list_state = ListState::default();
    if !state.registry.is_empty() {
        list_state.select(Some(state.input_selected));
    }
    f.render_stateful_widget(list, area, &mut list_state);
}

fn draw_trace(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let fact_style = if state.trace_available {
        Style::default()
    } else {
        Style::default().fg(Color::DarkGray)
    };
    let fact = Paragraph::new(Span::styled(state.pending_fact.clone(), fact_style))
        .block(Block::default().borders(Borders::ALL).title("Fact"));
    f.render_widget(fact, chunks[0]);

    let (title, body) = match state.trace.format {
        TraceFormat::None if state.trace.payload.is_empty() => {
            ("Trace", "No trace yet.".to_string())
        }
        TraceFormat::None => ("Trace failed", state.trace.payload.clone()),
        TraceFormat::Ascii => ("Trace (text)", state.trace.payload.clone()),
        TraceFormat::GraphStructured => (
            "Trace (graph)",
            serde_json::from_str::<serde_json::Value>(&state.trace.payload)
                .and_then(|v| serde_json::to_string_pretty(&v))
                .unwrap_or_else(|_| state.trace.payload.clone()),
        ),
    };
    let p = Paragraph::new(body)
        .block(Block::default().borders(Borders::ALL).title(title))
        .scroll((state.trace_scroll, 0));
    f.render_widget(p, chunks[1]);
}

fn draw_footer(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let line = if state.mode != InputMode::Normal {
        Line::from(vec![
            Span::styled(
                format!("{}: ", state.mode.prompt()),
                Style::default().fg(Color::Magenta),
            ),
            Span::raw(state.edit_buffer.clone()),
            Span::raw("▏"),
        ])
    } else if !state.info.is_empty() {
        Line::from(state.info.clone())
    } else {
        let trace_keys = if state.trace_available {
            Style::default()
        } else {
            Style::default().fg(Color::DarkGray)
        };
        Line::from(vec![
            Span::raw("r run  s stop  tab panes  "),
            Span::styled("e fact  a/g trace  ", trace_keys),
            Span::raw("? help  q quit"),
        ])
    };
    let p = Paragraph::new(line).block(Block::default().borders(Borders::ALL));
    f.render_widget(p, area);
}
