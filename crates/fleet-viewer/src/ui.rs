use crate::app::{App, InputMode};
use fleet_core::log_feed::LogLevel;
use fleet_core::render::DisplayRecord;
use fleet_core::MemberState;
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, TableState, Wrap},
};

#[derive(Clone, Copy)]
struct FleetTheme {
    border: Color,
    title: Color,
    text: Color,
    muted: Color,
    accent: Color,
    ok: Color,
    warn: Color,
    critical: Color,
    info: Color,
}

fn fleet_theme() -> FleetTheme {
    FleetTheme {
        border: Color::Rgb(71, 85, 105),
        title: Color::Rgb(191, 219, 254),
        text: Color::Rgb(226, 232, 240),
        muted: Color::Rgb(148, 163, 184),
        accent: Color::Rgb(56, 189, 248),
        ok: Color::Rgb(34, 197, 94),
        warn: Color::Rgb(245, 158, 11),
        critical: Color::Rgb(239, 68, 68),
        info: Color::Rgb(59, 130, 246),
    }
}

pub fn render_ui(frame: &mut ratatui::Frame, app: &App) {
    let size = frame.size();
    let theme = fleet_theme();
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(5),
            Constraint::Length(12),
        ])
        .split(size);
    frame.render_widget(render_header(app, theme), layout[0]);
    render_fleet_table(frame, app, theme, layout[1]);
    frame.render_widget(render_log(app, theme, layout[2].height), layout[2]);
    if app.help_open {
        render_help_overlay(frame, theme);
    }
}

fn render_header(app: &App, theme: FleetTheme) -> Paragraph<'static> {
    let (link, link_color) = if app.connected {
        ("hub: online", theme.ok)
    } else {
        ("hub: offline", theme.critical)
    };
    let running = app
        .rows()
        .filter(|row| row.state == MemberState::Running)
        .count();
    let mut spans = vec![
        Span::styled(link, Style::default().fg(link_color).add_modifier(Modifier::BOLD)),
        Span::styled(
            format!("  members {}  running {}", app.row_count(), running),
            Style::default().fg(theme.text),
        ),
    ];
    match &app.input {
        InputMode::NewName(buffer) => spans.push(Span::styled(
            format!("  new member: {buffer}_"),
            Style::default().fg(theme.accent),
        )),
        InputMode::ConfirmDelete(name) => spans.push(Span::styled(
            format!("  delete {name}? (y/N)"),
            Style::default().fg(theme.critical).add_modifier(Modifier::BOLD),
        )),
        InputMode::Normal => {
            if let Some(note) = &app.status_note {
                spans.push(Span::styled(format!("  {note}"), Style::default().fg(theme.muted)));
            }
        }
    }
    Paragraph::new(Line::from(spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(theme.border))
            .title(Span::styled(" Fleet ", Style::default().fg(theme.title))),
    )
}

fn render_fleet_table(frame: &mut ratatui::Frame, app: &App, theme: FleetTheme, area: Rect) {
    let header = Row::new(["NAME", "STATE", "MEMORY", "DISK", "ACTIONS"])
        .style(Style::default().fg(theme.muted).add_modifier(Modifier::BOLD));
    let rows = app
        .rows()
        .map(|record| fleet_row(record, app.pulse_on, theme))
        .collect::<Vec<_>>();
    let widths = [
        Constraint::Min(16),
        Constraint::Length(10),
        Constraint::Length(10),
        Constraint::Length(10),
        Constraint::Length(24),
    ];
    let table = Table::new(rows, widths)
        .header(header)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.border))
                .title(Span::styled(" Members ", Style::default().fg(theme.title))),
        )
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED));
    let mut state = TableState::default();
    if app.row_count() > 0 {
        state.select(Some(app.selected));
    }
    frame.render_stateful_widget(table, area, &mut state);
}

fn fleet_row(record: &DisplayRecord, pulse_on: bool, theme: FleetTheme) -> Row<'static> {
    let mut badge = Style::default().fg(state_color(record.state, theme));
    if record.busy {
        badge = badge.add_modifier(if pulse_on {
            Modifier::BOLD
        } else {
            Modifier::DIM
        });
    }
    Row::new(vec![
        Cell::from(record.name.clone()).style(Style::default().fg(theme.text)),
        Cell::from(record.state.as_str()).style(badge),
        Cell::from(record.memory.clone()),
        Cell::from(record.disk.clone()),
        Cell::from(controls_hint(record)).style(Style::default().fg(theme.muted)),
    ])
}

/// Keys that currently do something for this row.
pub fn controls_hint(record: &DisplayRecord) -> String {
    let mut hints = Vec::new();
    if record.controls.start {
        hints.push("s start");
        hints.push("D daemon");
    }
    if record.controls.stop {
        hints.push("t stop");
    }
    if record.controls.delete {
        hints.push("d delete");
    }
    if hints.is_empty() {
        return "...".to_string();
    }
    hints.join("  ")
}

fn state_color(state: MemberState, theme: FleetTheme) -> Color {
    match state {
        MemberState::Running => theme.ok,
        MemberState::Stopped => theme.muted,
        MemberState::Starting | MemberState::Creating => theme.info,
        MemberState::Stopping => theme.warn,
        MemberState::Deleting => theme.critical,
    }
}

fn level_color(level: LogLevel, theme: FleetTheme) -> Color {
    match level {
        LogLevel::Error => theme.critical,
        LogLevel::Info => theme.text,
        LogLevel::Debug => theme.muted,
    }
}

fn render_log(app: &App, theme: FleetTheme, height: u16) -> Paragraph<'static> {
    let visible = height.saturating_sub(2) as usize;
    let skip = app.log.len().saturating_sub(visible);
    let lines = app
        .log
        .entries()
        .skip(skip)
        .map(|entry| {
            Line::from(vec![
                Span::styled(
                    format!("{} ", entry.timestamp()),
                    Style::default().fg(theme.muted),
                ),
                Span::styled(
                    entry.text.clone(),
                    Style::default().fg(level_color(entry.level, theme)),
                ),
            ])
        })
        .collect::<Vec<_>>();
    Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(theme.border))
            .title(Span::styled(" Control plane ", Style::default().fg(theme.title))),
    )
}

fn render_help_overlay(frame: &mut ratatui::Frame, theme: FleetTheme) {
    let area = centered_rect(60, 60, frame.size());
    let lines = [
        "j/k, arrows   move selection",
        "n             new member",
        "s / D         start / start as daemon",
        "t             stop",
        "d             delete (asks y/N)",
        "p / u         persist / unpersist",
        "c             show shell command",
        "?             toggle help",
        "q             quit",
    ]
    .into_iter()
    .map(|text| Line::from(Span::styled(text, Style::default().fg(theme.text))))
    .collect::<Vec<_>>();
    frame.render_widget(Clear, area);
    frame.render_widget(
        Paragraph::new(lines).wrap(Wrap { trim: false }).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.accent))
                .title(" Keys "),
        ),
        area,
    );
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical[1])[1]
}
