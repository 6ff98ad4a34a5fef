use crate::{
    app::{App, DialogChoice, DialogKind, InputMode, LogLevel},
    manifest::ManifestRecord,
};
use anyhow::Result;
use crossterm::{
    event::{
        self, DisableBracketedPaste, EnableBracketedPaste, Event, KeyCode, KeyEvent, KeyEventKind,
        KeyModifiers,
    },
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    prelude::*,
    text::{Line, Span},
    widgets::{
        Block, BorderType, Borders, Cell, Clear, Padding, Paragraph, Row, Table, TableState, Wrap,
    },
};
use std::{io, time::Duration};

const SIDE_PANEL_WIDTH: u16 = 48;
const LOG_PANEL_HEIGHT: u16 = 10;
const DIALOG_WIDTH: u16 = 60;

#[derive(Clone)]
struct Theme {
    accent: Color,
    accent_soft: Color,
    border: Color,
    text: Color,
    muted: Color,
    success: Color,
    warning: Color,
    error: Color,
    header_bg: Color,
    log_bg: Color,
    surface: Color,
}

impl Theme {
    fn new() -> Self {
        Self {
            accent: Color::Rgb(102, 192, 244),
            accent_soft: Color::Rgb(66, 124, 160),
            border: Color::Rgb(42, 71, 94),
            text: Color::Rgb(199, 213, 224),
            muted: Color::Rgb(125, 140, 154),
            success: Color::Rgb(164, 208, 7),
            warning: Color::Rgb(240, 170, 60),
            error: Color::Rgb(205, 70, 70),
            header_bg: Color::Rgb(23, 26, 33),
            log_bg: Color::Rgb(18, 22, 28),
            surface: Color::Rgb(27, 40, 56),
        }
    }

    fn block(&self, title: &'static str) -> Block<'static> {
        Block::default()
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(Style::default().fg(self.border))
            .title(Span::styled(
                title,
                Style::default()
                    .fg(self.accent)
                    .add_modifier(Modifier::BOLD),
            ))
    }

    fn panel(&self, title: &'static str) -> Block<'static> {
        self.block(title).padding(Padding {
            left: 1,
            right: 1,
            top: 1,
            bottom: 0,
        })
    }
}

pub fn run(app: &mut App) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableBracketedPaste)?;
    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_loop(&mut terminal, app);
    app.shutdown();

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), DisableBracketedPaste, LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn run_loop(terminal: &mut Terminal<impl Backend>, app: &mut App) -> Result<()> {
    loop {
        app.poll_patches();
        app.clamp_selection();
        terminal.draw(|frame| draw(frame, app))?;

        if app.should_quit {
            break;
        }

        if event::poll(Duration::from_millis(200))? {
            match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => handle_key(app, key),
                Event::Paste(text) => handle_paste(app, &text),
                _ => {}
            }
        }
    }

    Ok(())
}

fn handle_key(app: &mut App, key: KeyEvent) {
    if app.dialog.is_some() {
        handle_dialog_mode(app, key);
        return;
    }

    let mode = std::mem::replace(&mut app.input_mode, InputMode::Normal);
    match mode {
        InputMode::Normal => handle_normal_mode(app, key),
        InputMode::Editing { prompt, buffer } => handle_input_mode(app, key, prompt, buffer),
    }
}

fn handle_dialog_mode(app: &mut App, key: KeyEvent) {
    match key.code {
        KeyCode::Left
        | KeyCode::Right
        | KeyCode::Tab
        | KeyCode::Char('h')
        | KeyCode::Char('l') => app.dialog_toggle_choice(),
        KeyCode::Char('y') | KeyCode::Char('Y') => app.dialog_set_choice(DialogChoice::Yes),
        KeyCode::Char('n') | KeyCode::Char('N') => app.dialog_set_choice(DialogChoice::No),
        KeyCode::Enter | KeyCode::Char(' ') => app.dialog_confirm(),
        KeyCode::Esc => {
            app.dialog_set_choice(DialogChoice::No);
            app.dialog_confirm();
        }
        _ => {}
    }
}

fn handle_normal_mode(app: &mut App, key: KeyEvent) {
    match (key.code, key.modifiers) {
        (KeyCode::Char('q'), _) | (KeyCode::Char('Q'), _) => app.should_quit = true,
        (KeyCode::Char('c'), KeyModifiers::CONTROL) => app.should_quit = true,
        (KeyCode::Up, _) | (KeyCode::Char('k'), _) => app.select_prev(),
        (KeyCode::Down, _) | (KeyCode::Char('j'), _) => app.select_next(),
        (KeyCode::Enter, _) | (KeyCode::Char('p'), _) | (KeyCode::Char('P'), _) => {
            app.request_patch()
        }
        (KeyCode::Char('r'), _) | (KeyCode::Char('R'), _) => app.request_revert(),
        (KeyCode::Char('c'), _) | (KeyCode::Char('C'), _) => app.cancel_patch(),
        (KeyCode::Char('o'), _) | (KeyCode::Char('O'), _) => app.enter_directory_input(),
        (KeyCode::Tab, _) => app.cycle_library(),
        (KeyCode::F(5), _) => app.rescan(),
        (KeyCode::PageUp, _) => app.scroll_log_up(3),
        (KeyCode::PageDown, _) => app.scroll_log_down(3),
        _ => {}
    }
}

fn handle_input_mode(app: &mut App, key: KeyEvent, prompt: String, mut buffer: String) {
    match key.code {
        KeyCode::Esc => {
            app.status = "Directory unchanged".to_string();
            return;
        }
        KeyCode::Enter => {
            app.submit_directory(&buffer);
            return;
        }
        KeyCode::Char(c) => {
            if !key.modifiers.contains(KeyModifiers::CONTROL)
                && !key.modifiers.contains(KeyModifiers::ALT)
            {
                buffer.push(c);
            }
        }
        KeyCode::Backspace => {
            buffer.pop();
        }
        _ => {}
    }
    app.input_mode = InputMode::Editing { prompt, buffer };
}

fn handle_paste(app: &mut App, text: &str) {
    let pasted = text.trim().trim_matches(|c| c == '\'' || c == '"');
    if let InputMode::Editing { buffer, .. } = &mut app.input_mode {
        buffer.push_str(pasted);
        return;
    }
    if !pasted.is_empty() && app.dialog.is_none() {
        app.submit_directory(pasted);
    }
}

fn draw(frame: &mut Frame<'_>, app: &App) {
    let area = frame.size();
    let theme = Theme::new();
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(LOG_PANEL_HEIGHT),
            Constraint::Length(1),
        ])
        .split(area);

    let patched = app.records.iter().filter(|record| record.read_only).count();
    let directory = app
        .directory
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "<no directory>".to_string());
    let header = Paragraph::new(vec![
        Line::from(vec![
            Span::styled(
                "SGUB",
                Style::default()
                    .fg(theme.accent)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::raw("  "),
            Span::styled(directory, Style::default().fg(theme.text)),
        ]),
        Line::from(vec![
            Span::styled("Manifests: ", Style::default().fg(theme.muted)),
            Span::styled(app.records.len().to_string(), Style::default().fg(theme.text)),
            Span::raw("   "),
            Span::styled("Patched: ", Style::default().fg(theme.muted)),
            Span::styled(
                patched.to_string(),
                Style::default()
                    .fg(theme.success)
                    .add_modifier(Modifier::BOLD),
            ),
        ]),
    ])
    .style(Style::default().bg(theme.header_bg))
    .alignment(Alignment::Center);
    frame.render_widget(header, chunks[0]);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(30), Constraint::Length(SIDE_PANEL_WIDTH)])
        .split(chunks[1]);

    let rows: Vec<Row> = app
        .records
        .iter()
        .map(|record| {
            let busy = app
                .patch_active
                .as_ref()
                .is_some_and(|active| active.path == record.path);
            row_for_record(record, busy, &theme)
        })
        .collect();
    let table = Table::new(
        rows,
        [
            Constraint::Min(20),
            Constraint::Length(10),
            Constraint::Length(12),
            Constraint::Length(8),
        ],
    )
    .header(
        Row::new(vec!["Name", "App ID", "Build", "State"])
            .style(Style::default().fg(theme.muted).add_modifier(Modifier::BOLD)),
    )
    .block(theme.block("Manifests"))
    .highlight_style(
        Style::default()
            .fg(Color::Black)
            .bg(theme.accent)
            .add_modifier(Modifier::BOLD),
    );
    let mut state = TableState::default();
    if !app.records.is_empty() {
        state.select(Some(app.selected));
    }
    frame.render_stateful_widget(table, body[0], &mut state);

    let details = Paragraph::new(build_details(app, &theme))
        .block(theme.panel("Details"))
        .wrap(Wrap { trim: false });
    frame.render_widget(details, body[1]);

    let log_height = LOG_PANEL_HEIGHT.saturating_sub(2) as usize;
    let logs = Paragraph::new(build_log_lines(app, &theme, log_height))
        .block(theme.block("Log"))
        .style(Style::default().bg(theme.log_bg));
    frame.render_widget(logs, chunks[2]);

    let status = Paragraph::new(status_bar_line(app, chunks[3].width))
        .style(Style::default().fg(theme.text).bg(theme.header_bg));
    frame.render_widget(status, chunks[3]);

    draw_dialog(frame, app, &theme);
}

fn row_for_record(record: &ManifestRecord, busy: bool, theme: &Theme) -> Row<'static> {
    let (state, color) = if busy {
        ("working", theme.accent)
    } else if record.read_only {
        ("patched", theme.success)
    } else if record.has_backup {
        ("backup", theme.warning)
    } else {
        ("-", theme.muted)
    };
    Row::new(vec![
        Cell::from(record.name().to_string()),
        Cell::from(record.app_id().unwrap_or_default()),
        Cell::from(record.build_id().unwrap_or("?").to_string()),
        Cell::from(Span::styled(state, Style::default().fg(color))),
    ])
    .style(Style::default().fg(theme.text))
}

fn build_details(app: &App, theme: &Theme) -> Vec<Line<'static>> {
    let Some(record) = app.selected_record() else {
        return vec![Line::from(Span::styled(
            "Press o to choose a steamapps folder.",
            Style::default().fg(theme.muted),
        ))];
    };

    let mut lines = vec![
        Line::from(Span::styled(
            record.name().to_string(),
            Style::default()
                .fg(theme.accent)
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
    ];
    let mut push_kv = |key: &str, value: String| {
        lines.push(Line::from(vec![
            Span::styled(format!("{key}: "), Style::default().fg(theme.muted)),
            Span::styled(value, Style::default().fg(theme.text)),
        ]));
    };
    push_kv("File", crate::app::display_path(&record.path));
    push_kv("App ID", record.app_id().unwrap_or_default());
    push_kv("Build", record.build_id().unwrap_or("?").to_string());
    push_kv("StateFlags", record.state_flags().unwrap_or("?").to_string());
    push_kv("Backup", yes_no(record.has_backup).to_string());
    push_kv("Read-only", yes_no(record.read_only).to_string());
    push_kv("Hash", record.fingerprint.chars().take(16).collect());

    let depots = record.installed_depots();
    lines.push(Line::from(""));
    lines.push(Line::from(Span::styled(
        format!("Depots ({})", depots.len()),
        Style::default().fg(theme.muted).add_modifier(Modifier::BOLD),
    )));
    for depot in depots {
        lines.push(Line::from(vec![
            Span::styled(format!("{} ", depot.id), Style::default().fg(theme.accent_soft)),
            Span::styled(
                format!(
                    "{} / {}",
                    depot.manifest.unwrap_or_else(|| "?".to_string()),
                    depot.size.unwrap_or_else(|| "?".to_string())
                ),
                Style::default().fg(theme.text),
            ),
        ]));
    }

    if let Some(active) = &app.patch_active {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            format!("Processing {} ({})", active.name, active.stage.label()),
            Style::default().fg(theme.warning),
        )));
    }
    lines
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn build_log_lines(app: &App, theme: &Theme, height: usize) -> Vec<Line<'static>> {
    if height == 0 {
        return Vec::new();
    }

    if app.logs.is_empty() {
        return vec![Line::from(Span::styled(
            "No recent events.",
            Style::default().fg(theme.muted),
        ))];
    }

    let total = app.logs.len();
    let max_scroll = total.saturating_sub(height);
    let scroll = app.log_scroll.min(max_scroll);
    let start = total.saturating_sub(height + scroll);
    let end = (start + height).min(total);

    app.logs[start..end]
        .iter()
        .map(|entry| {
            let (label, color) = match entry.level {
                LogLevel::Info => ("[i]", theme.accent),
                LogLevel::Warn => ("[!]", theme.warning),
                LogLevel::Error => ("[x]", theme.error),
            };
            Line::from(vec![
                Span::styled(entry.at.clone(), Style::default().fg(theme.muted)),
                Span::raw(" "),
                Span::styled(label, Style::default().fg(color).add_modifier(Modifier::BOLD)),
                Span::raw(" "),
                Span::styled(entry.message.clone(), Style::default().fg(theme.text)),
            ])
        })
        .collect()
}

fn status_bar_line(app: &App, width: u16) -> String {
    let width = width as usize;
    let (left, right) = match &app.input_mode {
        InputMode::Normal => {
            let status = match &app.patch_active {
                Some(active) => format!("Processing... ({})", active.stage.label()),
                None => app.status.clone(),
            };
            (
                format!("Status: {status}"),
                "Enter patch | r revert | c cancel | o folder | Tab library | q quit".to_string(),
            )
        }
        InputMode::Editing { prompt, buffer } => (
            format!("{prompt}: {buffer}"),
            "Enter confirm | Esc cancel".to_string(),
        ),
    };

    if width == 0 {
        return String::new();
    }

    let left_len = left.chars().count();
    let right_len = right.chars().count();
    if left_len + right_len + 1 > width {
        let available = width.saturating_sub(left_len + 1);
        let trimmed_right: String = right.chars().take(available).collect();
        return format!("{left} {trimmed_right}");
    }

    let spaces = width - left_len - right_len;
    format!("{left}{}{}", " ".repeat(spaces), right)
}

/// Confirmation prompt pinned to the upper third of the screen. Revert
/// prompts are framed in the warning colour.
fn draw_dialog(frame: &mut Frame<'_>, app: &App, theme: &Theme) {
    let Some(dialog) = &app.dialog else {
        return;
    };

    let area = frame.size();
    let frame_color = match dialog.kind {
        DialogKind::Patch { .. } => theme.accent,
        DialogKind::Revert { .. } => theme.warning,
    };

    let mut lines: Vec<Line> = dialog
        .message
        .lines()
        .map(|line| Line::from(line.to_string()).style(Style::default().fg(theme.text)))
        .collect();
    lines.push(Line::from(""));
    let yes = dialog.choice == DialogChoice::Yes;
    lines.push(Line::from(vec![
        dialog_button('y', &dialog.yes_label, yes, frame_color, theme),
        Span::raw("  "),
        dialog_button('n', &dialog.no_label, !yes, theme.muted, theme),
    ]));

    let width = DIALOG_WIDTH.min(area.width.saturating_sub(4)).max(20);
    let height = (lines.len() as u16 + 2).min(area.height);
    let dialog_area = Rect::new(
        area.x + area.width.saturating_sub(width) / 2,
        area.y + area.height / 4,
        width,
        height,
    )
    .intersection(area);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Double)
        .border_style(Style::default().fg(frame_color))
        .title(Span::styled(
            format!(" {} ", dialog.title),
            Style::default().fg(frame_color).add_modifier(Modifier::BOLD),
        ))
        .padding(Padding::horizontal(1))
        .style(Style::default().bg(theme.surface));

    frame.render_widget(Clear, dialog_area);
    frame.render_widget(
        Paragraph::new(lines).block(block).wrap(Wrap { trim: true }),
        dialog_area,
    );
}

fn dialog_button(
    key: char,
    label: &str,
    selected: bool,
    color: Color,
    theme: &Theme,
) -> Span<'static> {
    let style = if selected {
        Style::default()
            .fg(theme.surface)
            .bg(color)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(color)
    };
    Span::styled(format!("[{key}] {label}"), style)
}
