use crate::control_plane::{fetch_snapshot, fetch_stats, ControlPlane};
use crate::hub::HubState;
use fleet_core::protocol::ServerEvent;
use fleet_core::{FleetMember, MemberState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Polls the control plane every `poll_interval` until `shutdown` flips.
pub async fn run<P: ControlPlane>(state: Arc<HubState<P>>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(state.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_states = HashMap::new();
    info!(
        event = "monitor_start",
        poll_interval_ms = state.config.poll_interval.as_millis() as u64
    );
    loop {
        tokio::select! {
            _ = ticker.tick() => poll_cycle(&state, &mut last_states).await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!(event = "monitor_stop");
}

/// One cycle: publish the snapshot, then stats for each running member. An
/// unparsable snapshot ends the cycle with nothing published.
pub async fn poll_cycle<P: ControlPlane>(
    state: &HubState<P>,
    last_states: &mut HashMap<String, MemberState>,
) {
    let Some(members) = refresh(state).await else {
        return;
    };
    log_state_changes(state, last_states, &members).await;

    for member in members
        .iter()
        .filter(|member| member.state == MemberState::Running)
    {
        match fetch_stats(&state.plane, &member.name).await {
            Ok(stats) => {
                state.broadcaster.publish(&ServerEvent::Stats(stats)).await;
            }
            Err(err) => {
                debug!(event = "stats_skipped", name = %member.name, error = %err);
            }
        }
    }
}

/// Fetches and publishes one snapshot.
pub async fn refresh<P: ControlPlane>(state: &HubState<P>) -> Option<Vec<FleetMember>> {
    match fetch_snapshot(&state.plane).await {
        Ok(members) => {
            state
                .broadcaster
                .publish(&ServerEvent::List(members.clone()))
                .await;
            Some(members)
        }
        Err(err) => {
            debug!(event = "snapshot_skipped", error = %err);
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StateChange {
    Seen { name: String, state: MemberState },
    Changed { name: String, from: MemberState, to: MemberState },
    Gone { name: String },
}

/// Names under manual control change state on purpose; only the rest is
/// worth a log line. `last_states` tracks every listed member either way.
/// Returns what was logged.
async fn log_state_changes<P: ControlPlane>(
    state: &HubState<P>,
    last_states: &mut HashMap<String, MemberState>,
    members: &[FleetMember],
) -> Vec<StateChange> {
    let active = state.tracker.active_names().await;
    let mut changes = Vec::new();
    for member in members {
        let previous = last_states.insert(member.name.clone(), member.state);
        if previous == Some(member.state) || active.contains(&member.name) {
            continue;
        }
        changes.push(match previous {
            Some(from) => StateChange::Changed {
                name: member.name.clone(),
                from,
                to: member.state,
            },
            None => StateChange::Seen {
                name: member.name.clone(),
                state: member.state,
            },
        });
    }
    last_states.retain(|name, _| {
        let present = members.iter().any(|member| &member.name == name);
        if !present && !active.contains(name) {
            changes.push(StateChange::Gone { name: name.clone() });
        }
        present
    });

    for change in &changes {
        match change {
            StateChange::Seen { name, state } => {
                info!(event = "member_seen", name = %name, state = %state)
            }
            StateChange::Changed { name, from, to } => info!(
                event = "member_state_changed",
                name = %name,
                from = %from,
                to = %to
            ),
            StateChange::Gone { name } => info!(event = "member_gone", name = %name),
        }
    }
    changes
}
