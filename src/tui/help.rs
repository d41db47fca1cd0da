use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn key_line(key: &'static str, pad: usize, what: &'static str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(key, Style::default().fg(Color::Magenta)),
        Span::raw(" ".repeat(pad)),
        Span::raw(what),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let p = Paragraph::new(vec![
        Line::from("Keybinds:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("q", Style::default().fg(Color::Magenta)),
            Span::raw(" / "),
            Span::styled("Ctrl-C", Style::default().fg(Color::Magenta)),
            Span::raw("  Quit"),
        ]),
        key_line("r", 11, "Run (restarts the worker)"),
        key_line("s", 11, "Stop the worker"),
        key_line("tab", 9, "Switch panes"),
        key_line("?", 11, "Show this help"),
        Line::from(""),
        Line::from("Results pane:"),
        key_line("←/→", 9, "Switch predicate"),
        key_line("↑/↓", 9, "Select row"),
        key_line("enter", 7, "Use row as fact to trace"),
        key_line("d", 11, "Download all rows as CSV"),
        Line::from(""),
        Line::from("Inputs pane:"),
        key_line("i", 11, "Add input (RESOURCE=PATH)"),
        key_line("f", 11, "Attach file to selected input"),
        key_line("x", 11, "Remove selected input"),
        Line::from(""),
        Line::from("Tracing (worker idle and program loaded):"),
        key_line("e", 11, "Edit fact"),
        key_line("a", 11, "Trace as text tree"),
        key_line("g", 11, "Trace as graph document"),
        key_line("y", 11, "Copy trace to clipboard"),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
