use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind};
use fleet_core::log_feed::LogFeed;
use fleet_core::protocol::{validate_member_name, ClientCommand, CommandKind, ServerEvent};
use fleet_core::reconcile::Reconciler;
use fleet_core::render::{apply_patches, DisplayRecord, RowPatch};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum HubEvent {
    Connected,
    Disconnected,
    Server(ServerEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    NewName(String),
    ConfirmDelete(String),
}

pub struct App {
    command_tx: mpsc::Sender<ClientCommand>,
    reconciler: Reconciler,
    view: BTreeMap<String, DisplayRecord>,
    pub log: LogFeed,
    pub connected: bool,
    pub selected: usize,
    pub input: InputMode,
    pub status_note: Option<String>,
    pub help_open: bool,
    pub pulse_on: bool,
}

impl App {
    pub fn new(command_tx: mpsc::Sender<ClientCommand>, grace_period: Duration) -> Self {
        Self {
            command_tx,
            reconciler: Reconciler::new(grace_period),
            view: BTreeMap::new(),
            log: LogFeed::default(),
            connected: false,
            selected: 0,
            input: InputMode::Normal,
            status_note: None,
            help_open: false,
            pulse_on: false,
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = &DisplayRecord> {
        self.view.values()
    }

    pub fn row_count(&self) -> usize {
        self.view.len()
    }

    pub fn selected_record(&self) -> Option<&DisplayRecord> {
        self.view.values().nth(self.selected)
    }

    pub fn apply_hub_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Connected => {
                self.connected = true;
                self.status_note = Some("connected".to_string());
            }
            HubEvent::Disconnected => {
                self.connected = false;
                self.status_note = Some("hub unreachable; reconnecting".to_string());
            }
            HubEvent::Server(ServerEvent::PsLog(line)) => {
                self.log.push(line);
            }
            HubEvent::Server(event) => {
                let patches = self.reconciler.apply_event(&event);
                self.apply(&patches);
            }
        }
    }

    pub fn toggle_pulse(&mut self) {
        self.pulse_on = !self.pulse_on;
    }

    fn apply(&mut self, patches: &[RowPatch]) {
        if patches.is_empty() {
            return;
        }
        debug!(event = "rows_patched", count = patches.len());
        apply_patches(&mut self.view, patches);
        self.clamp_selection();
    }

    fn clamp_selection(&mut self) {
        if self.view.is_empty() {
            self.selected = 0;
        } else if self.selected >= self.view.len() {
            self.selected = self.view.len() - 1;
        }
    }

    fn move_selection(&mut self, delta: isize) {
        if self.view.is_empty() {
            return;
        }
        let max = self.view.len() as isize - 1;
        self.selected = (self.selected as isize + delta).clamp(0, max) as usize;
    }

    /// Queues the frame for the hub, then enters the transition locally.
    /// Nothing changes while disconnected or when the frame cannot be queued.
    pub fn issue(&mut self, kind: CommandKind, raw_name: &str) -> bool {
        let name = match validate_member_name(raw_name) {
            Ok(name) => name.to_string(),
            Err(err) => {
                self.status_note = Some(err.to_string());
                return false;
            }
        };
        if !self.connected {
            warn!(event = "command_dropped", command = %kind, name = %name, reason = "disconnected");
            self.status_note = Some(format!("not connected; {kind} {name} not sent"));
            return false;
        }
        if let Err(err) = self
            .command_tx
            .try_send(ClientCommand::new(kind, name.as_str()))
        {
            warn!(event = "command_dropped", command = %kind, name = %name, error = %err);
            self.status_note = Some(format!("{kind} {name} not sent"));
            return false;
        }
        info!(event = "command_sent", command = %kind, name = %name);
        self.status_note = Some(format!("{kind} {name}"));
        // the frame is queued; only now does the row go optimistic
        let (_, patches) = self.reconciler.issue(kind, &name);
        self.apply(&patches);
        if let Some(idx) = self.view.keys().position(|key| key == &name) {
            self.selected = idx;
        }
        true
    }

    fn issue_on_selected(&mut self, kind: CommandKind) {
        let Some(record) = self.selected_record() else {
            return;
        };
        let allowed = match kind {
            CommandKind::Start | CommandKind::Daemon => record.controls.start,
            CommandKind::Terminate => record.controls.stop,
            CommandKind::Delete => record.controls.delete,
            CommandKind::Persist | CommandKind::Unpersist => !record.busy,
            CommandKind::Create => false,
        };
        let name = record.name.clone();
        if !allowed {
            self.status_note = Some(format!("{kind} not available for {name}"));
            return;
        }
        self.issue(kind, &name);
    }
}

pub fn handle_input(event: Event, app: &mut App) -> bool {
    match event {
        Event::Key(key) if key.kind == KeyEventKind::Press => handle_key(key, app),
        _ => false,
    }
}

/// Returns true when the viewer should exit.
pub fn handle_key(key: KeyEvent, app: &mut App) -> bool {
    match std::mem::replace(&mut app.input, InputMode::Normal) {
        InputMode::NewName(mut buffer) => {
            match key.code {
                KeyCode::Enter => {
                    app.issue(CommandKind::Create, &buffer);
                }
                KeyCode::Esc => app.status_note = None,
                KeyCode::Backspace => {
                    buffer.pop();
                    app.input = InputMode::NewName(buffer);
                }
                KeyCode::Char(ch) => {
                    buffer.push(ch);
                    app.input = InputMode::NewName(buffer);
                }
                _ => app.input = InputMode::NewName(buffer),
            }
            return false;
        }
        InputMode::ConfirmDelete(name) => {
            if matches!(key.code, KeyCode::Char('y') | KeyCode::Char('Y')) {
                app.issue(CommandKind::Delete, &name);
            } else {
                app.status_note = Some(format!("delete {name} cancelled"));
            }
            return false;
        }
        InputMode::Normal => {}
    }

    if matches!(key.code, KeyCode::Char('?') | KeyCode::F(1)) {
        app.help_open = !app.help_open;
        return false;
    }
    if key.code == KeyCode::Esc && app.help_open {
        app.help_open = false;
        return false;
    }
    if app.help_open {
        return false;
    }

    match key.code {
        KeyCode::Char('q') => true,
        KeyCode::Down | KeyCode::Char('j') => {
            app.move_selection(1);
            false
        }
        KeyCode::Up | KeyCode::Char('k') => {
            app.move_selection(-1);
            false
        }
        KeyCode::Char('g') => {
            app.selected = 0;
            false
        }
        KeyCode::Char('n') => {
            app.input = InputMode::NewName(String::new());
            false
        }
        KeyCode::Char('s') => {
            app.issue_on_selected(CommandKind::Start);
            false
        }
        KeyCode::Char('D') => {
            app.issue_on_selected(CommandKind::Daemon);
            false
        }
        KeyCode::Char('t') => {
            app.issue_on_selected(CommandKind::Terminate);
            false
        }
        KeyCode::Char('p') => {
            app.issue_on_selected(CommandKind::Persist);
            false
        }
        KeyCode::Char('u') => {
            app.issue_on_selected(CommandKind::Unpersist);
            false
        }
        KeyCode::Char('d') => {
            let selected = app
                .selected_record()
                .map(|record| (record.name.clone(), record.controls.delete));
            match selected {
                Some((name, true)) => app.input = InputMode::ConfirmDelete(name),
                Some((name, false)) => {
                    app.status_note = Some(format!("delete not available for {name}"));
                }
                None => {}
            }
            false
        }
        KeyCode::Char('c') => {
            let selected = app.selected_record().map(|record| record.name.clone());
            if let Some(name) = selected {
                app.status_note = Some(format!("shell: wsl -d {name}"));
            }
            false
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyModifiers;
    use fleet_core::{FleetMember, MemberState};

    fn press(app: &mut App, code: KeyCode) -> bool {
        handle_key(KeyEvent::new(code, KeyModifiers::NONE), app)
    }

    fn type_text(app: &mut App, text: &str) {
        for ch in text.chars() {
            press(app, KeyCode::Char(ch));
        }
    }

    fn connected_app() -> (App, mpsc::Receiver<ClientCommand>) {
        let (tx, rx) = mpsc::channel(16);
        let mut app = App::new(tx, Duration::from_secs(120));
        app.apply_hub_event(HubEvent::Connected);
        (app, rx)
    }

    fn list(app: &mut App, members: &[(&str, MemberState)]) {
        let members = members
            .iter()
            .map(|(name, state)| FleetMember::new(*name, *state))
            .collect();
        app.apply_hub_event(HubEvent::Server(ServerEvent::List(members)));
    }

    #[test]
    fn start_marks_row_busy_and_sends_command() {
        let (mut app, mut rx) = connected_app();
        list(&mut app, &[("a", MemberState::Stopped)]);

        assert!(!press(&mut app, KeyCode::Char('s')));
        assert_eq!(
            rx.try_recv().expect("command"),
            ClientCommand::new(CommandKind::Start, "a")
        );
        let record = app.selected_record().expect("row");
        assert_eq!(record.state, MemberState::Starting);
        assert!(record.busy);

        // stale snapshot keeps the optimistic state
        list(&mut app, &[("a", MemberState::Stopped)]);
        assert_eq!(
            app.selected_record().map(|r| r.state),
            Some(MemberState::Starting)
        );
    }

    #[test]
    fn unavailable_controls_send_nothing() {
        let (mut app, mut rx) = connected_app();
        list(&mut app, &[("a", MemberState::Running)]);
        press(&mut app, KeyCode::Char('s'));
        assert!(rx.try_recv().is_err());

        press(&mut app, KeyCode::Char('t'));
        assert_eq!(
            rx.try_recv().expect("command"),
            ClientCommand::new(CommandKind::Terminate, "a")
        );
        // busy now; a second terminate is refused
        press(&mut app, KeyCode::Char('t'));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn new_name_prompt_creates_placeholder() {
        let (mut app, mut rx) = connected_app();
        press(&mut app, KeyCode::Char('n'));
        type_text(&mut app, "lab-x");
        press(&mut app, KeyCode::Backspace);
        type_text(&mut app, "1");
        assert_eq!(app.input, InputMode::NewName("lab-1".to_string()));
        press(&mut app, KeyCode::Enter);

        assert_eq!(app.input, InputMode::Normal);
        assert_eq!(
            rx.try_recv().expect("command"),
            ClientCommand::new(CommandKind::Create, "lab-1")
        );
        let record = app.selected_record().expect("placeholder");
        assert_eq!(record.name, "lab-1");
        assert_eq!(record.state, MemberState::Creating);
    }

    #[test]
    fn invalid_names_are_refused_locally() {
        let (mut app, mut rx) = connected_app();
        press(&mut app, KeyCode::Char('n'));
        type_text(&mut app, "-x");
        press(&mut app, KeyCode::Enter);
        assert!(rx.try_recv().is_err());
        assert_eq!(app.row_count(), 0);
        assert!(app.status_note.is_some());
    }

    #[test]
    fn delete_requires_confirmation() {
        let (mut app, mut rx) = connected_app();
        list(&mut app, &[("a", MemberState::Stopped)]);

        press(&mut app, KeyCode::Char('d'));
        press(&mut app, KeyCode::Char('n'));
        assert!(rx.try_recv().is_err());
        assert_eq!(app.input, InputMode::Normal);

        press(&mut app, KeyCode::Char('d'));
        press(&mut app, KeyCode::Char('y'));
        assert_eq!(
            rx.try_recv().expect("command"),
            ClientCommand::new(CommandKind::Delete, "a")
        );

        list(&mut app, &[]);
        assert_eq!(app.row_count(), 0);
    }

    #[test]
    fn commands_are_not_sent_while_disconnected() {
        let (mut app, mut rx) = connected_app();
        list(&mut app, &[("a", MemberState::Stopped)]);
        app.apply_hub_event(HubEvent::Disconnected);

        press(&mut app, KeyCode::Char('s'));
        assert!(rx.try_recv().is_err());
        assert_eq!(
            app.selected_record().map(|r| r.state),
            Some(MemberState::Stopped)
        );
    }

    #[test]
    fn full_command_queue_leaves_rows_untouched() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut app = App::new(tx, Duration::from_secs(120));
        app.apply_hub_event(HubEvent::Connected);
        list(
            &mut app,
            &[("a", MemberState::Stopped), ("b", MemberState::Stopped)],
        );

        press(&mut app, KeyCode::Char('s'));
        assert_eq!(
            app.selected_record().map(|r| r.state),
            Some(MemberState::Starting)
        );

        // queue is full now
        press(&mut app, KeyCode::Char('j'));
        press(&mut app, KeyCode::Char('d'));
        press(&mut app, KeyCode::Char('y'));
        let record = app.selected_record().expect("row b");
        assert_eq!(record.name, "b");
        assert_eq!(record.state, MemberState::Stopped);
        assert!(!record.busy);
        assert!(record.controls.delete);
        assert_eq!(app.status_note.as_deref(), Some("delete b not sent"));

        assert_eq!(
            rx.try_recv().expect("first command"),
            ClientCommand::new(CommandKind::Start, "a")
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn ps_log_lands_in_the_feed() {
        let (mut app, _rx) = connected_app();
        app.apply_hub_event(HubEvent::Server(ServerEvent::PsLog(
            "[ERROR] new a FAILED (exit 1)".to_string(),
        )));
        assert_eq!(app.log.len(), 1);
    }

    #[test]
    fn selection_stays_in_bounds() {
        let (mut app, _rx) = connected_app();
        list(
            &mut app,
            &[("a", MemberState::Stopped), ("b", MemberState::Running)],
        );
        press(&mut app, KeyCode::Char('j'));
        press(&mut app, KeyCode::Char('j'));
        assert_eq!(app.selected, 1);
        list(&mut app, &[("a", MemberState::Stopped)]);
        assert_eq!(app.selected, 0);
        press(&mut app, KeyCode::Char('k'));
        assert_eq!(app.selected, 0);
        assert!(press(&mut app, KeyCode::Char('q')));
    }
}
