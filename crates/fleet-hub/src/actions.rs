use crate::control_plane::ControlPlane;
use crate::hub::HubState;
use crate::monitor;
use fleet_core::lines::OutputLine;
use fleet_core::protocol::{ClientCommand, CommandKind, ServerEvent};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const LINE_BUFFER: usize = 64;

/// Control-plane verbs a viewer command runs, in order.
pub fn chain_for(kind: CommandKind) -> &'static [&'static str] {
    match kind {
        CommandKind::Create => &["new", "daemon"],
        CommandKind::Start => &["start"],
        CommandKind::Daemon => &["daemon"],
        CommandKind::Terminate => &["stop", "unpersist"],
        CommandKind::Delete => &["delete"],
        CommandKind::Persist => &["persist"],
        CommandKind::Unpersist => &["unpersist"],
    }
}

/// Names under manual control. Each mark carries the generation of the
/// chain that set it, so a stale cooldown never clears a newer mark.
pub struct ActionTracker {
    next_generation: AtomicU64,
    active: Mutex<HashMap<String, u64>>,
}

impl ActionTracker {
    pub fn new() -> Self {
        Self {
            next_generation: AtomicU64::new(0),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub async fn mark_active(&self, name: &str) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.active
            .lock()
            .await
            .insert(name.to_string(), generation);
        generation
    }

    pub async fn clear_if_current(&self, name: &str, generation: u64) -> bool {
        let mut active = self.active.lock().await;
        if active.get(name) == Some(&generation) {
            active.remove(name);
            return true;
        }
        false
    }

    pub async fn is_active(&self, name: &str) -> bool {
        self.active.lock().await.contains_key(name)
    }

    pub async fn active_names(&self) -> HashSet<String> {
        self.active.lock().await.keys().cloned().collect()
    }
}

impl Default for ActionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Completed,
    Failed,
    Aborted,
}

/// Marks the name active, then runs the chain and the forced refresh in the
/// background.
pub async fn dispatch<P: ControlPlane>(state: Arc<HubState<P>>, command: ClientCommand) {
    info!(event = "command_received", command = %command.kind, name = %command.name);
    let generation = state.tracker.mark_active(&command.name).await;

    let refresh_state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(refresh_state.config.refresh_delay).await;
        monitor::refresh(&refresh_state).await;
    });

    tokio::spawn(run_chain(state, command, generation));
}

async fn run_chain<P: ControlPlane>(state: Arc<HubState<P>>, command: ClientCommand, generation: u64) {
    for step in chain_for(command.kind) {
        match run_step(&state, step, &command.name).await {
            StepOutcome::Completed | StepOutcome::Failed => {}
            StepOutcome::Aborted => break,
        }
    }
    info!(event = "command_finished", command = %command.kind, name = %command.name);

    if command.kind == CommandKind::Create {
        monitor::refresh(&state).await;
    }

    tokio::time::sleep(state.config.cooldown).await;
    if state.tracker.clear_if_current(&command.name, generation).await {
        debug!(event = "cooldown_cleared", name = %command.name);
    }
}

/// One process. Output is published while the step runs and fully drained
/// before the outcome is reported.
async fn run_step<P: ControlPlane>(state: &Arc<HubState<P>>, step: &str, name: &str) -> StepOutcome {
    let (tx, mut rx) = mpsc::channel::<OutputLine>(LINE_BUFFER);
    let forward_state = state.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            forward_state
                .broadcaster
                .publish(&ServerEvent::PsLog(line.into_text()))
                .await;
        }
    });

    debug!(event = "step_start", step = step, name = name);
    let args = [name.to_string()];
    let result = state.plane.stream(step, &args, tx).await;
    let _ = forwarder.await;

    let (outcome, message) = match result {
        Ok(Some(0)) => {
            debug!(event = "step_ok", step = step, name = name);
            return StepOutcome::Completed;
        }
        Ok(code) => {
            let code = code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_string());
            warn!(event = "step_failed", step = step, name = name, exit = %code);
            (
                StepOutcome::Failed,
                format!("[ERROR] {step} {name} FAILED (exit {code})"),
            )
        }
        Err(err) => {
            warn!(event = "step_error", step = step, name = name, error = %err);
            (StepOutcome::Aborted, format!("[ERROR] {step} {name}: {err}"))
        }
    };
    state
        .broadcaster
        .publish(&ServerEvent::PsLog(message))
        .await;
    outcome
}
