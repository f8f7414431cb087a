use crate::protocol::{ClientCommand, CommandKind, ServerEvent};
use crate::render::{diff_records, render, DisplayRecord, RowPatch};
use crate::{FleetMember, MemberState, MemberStats};
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(120);

pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Test clock; clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionTarget {
    Creating,
    Starting,
    Stopping,
    Deleting,
}

impl TransitionTarget {
    pub fn for_command(kind: CommandKind) -> Option<Self> {
        match kind {
            CommandKind::Create => Some(TransitionTarget::Creating),
            CommandKind::Start | CommandKind::Daemon => Some(TransitionTarget::Starting),
            CommandKind::Terminate => Some(TransitionTarget::Stopping),
            CommandKind::Delete => Some(TransitionTarget::Deleting),
            CommandKind::Persist | CommandKind::Unpersist => None,
        }
    }

    pub fn as_state(&self) -> MemberState {
        match self {
            TransitionTarget::Creating => MemberState::Creating,
            TransitionTarget::Starting => MemberState::Starting,
            TransitionTarget::Stopping => MemberState::Stopping,
            TransitionTarget::Deleting => MemberState::Deleting,
        }
    }

    /// Where the operation ends up once the control plane converges. A
    /// create chain finishes by starting the member. Deletion has no settled
    /// state; its only success signal is disappearance.
    pub fn settled_state(&self) -> Option<MemberState> {
        match self {
            TransitionTarget::Creating | TransitionTarget::Starting => Some(MemberState::Running),
            TransitionTarget::Stopping => Some(MemberState::Stopped),
            TransitionTarget::Deleting => None,
        }
    }

    pub fn arrived(&self, reported: MemberState) -> bool {
        reported == self.as_state() || self.settled_state() == Some(reported)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub name: String,
    pub target: TransitionTarget,
    pub created_at: Instant,
}

/// Merges authoritative snapshots with one viewer's optimistic transitions.
/// Every operation returns the row patches that bring the last rendered view
/// up to date, so callers never touch rows directly.
pub struct Reconciler<C: Clock = SystemClock> {
    clock: C,
    grace_period: Duration,
    members: BTreeMap<String, FleetMember>,
    transitions: HashMap<String, Transition>,
    rendered: BTreeMap<String, DisplayRecord>,
}

impl Reconciler<SystemClock> {
    pub fn new(grace_period: Duration) -> Self {
        Self::with_clock(SystemClock, grace_period)
    }
}

impl Default for Reconciler<SystemClock> {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl<C: Clock> Reconciler<C> {
    pub fn with_clock(clock: C, grace_period: Duration) -> Self {
        Self {
            clock,
            grace_period,
            members: BTreeMap::new(),
            transitions: HashMap::new(),
            rendered: BTreeMap::new(),
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Builds the command to send and, for state-changing commands, enters
    /// the transition right away so the row reacts before any round trip.
    pub fn issue(&mut self, kind: CommandKind, name: &str) -> (ClientCommand, Vec<RowPatch>) {
        let command = ClientCommand::new(kind, name);
        let patches = match TransitionTarget::for_command(kind) {
            Some(target) => self.begin_transition(name, target),
            None => Vec::new(),
        };
        (command, patches)
    }

    /// Records (or replaces) the transition for `name`, synthesizing a
    /// placeholder row when the member has never been seen.
    pub fn begin_transition(&mut self, name: &str, target: TransitionTarget) -> Vec<RowPatch> {
        self.transitions.insert(
            name.to_string(),
            Transition {
                name: name.to_string(),
                target,
                created_at: self.clock.now(),
            },
        );
        self.members
            .entry(name.to_string())
            .or_insert_with(|| FleetMember::new(name, target.as_state()));
        self.commit()
    }

    pub fn apply_event(&mut self, event: &ServerEvent) -> Vec<RowPatch> {
        match event {
            ServerEvent::List(members) => self.apply_snapshot(members),
            ServerEvent::Stats(stats) => self.apply_stats(stats),
            ServerEvent::PsLog(_) => Vec::new(),
        }
    }

    pub fn apply_snapshot(&mut self, snapshot: &[FleetMember]) -> Vec<RowPatch> {
        let now = self.clock.now();
        let incoming: BTreeMap<&str, &FleetMember> = snapshot
            .iter()
            .map(|member| (member.name.as_str(), member))
            .collect();

        // arrival
        for (name, member) in &incoming {
            let arrived = self
                .transitions
                .get(*name)
                .is_some_and(|transition| transition.target.arrived(member.state));
            if arrived {
                self.transitions.remove(*name);
            }
        }

        // absence
        let missing = self
            .members
            .keys()
            .filter(|name| !incoming.contains_key(name.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        for name in missing {
            let keep = match self.transitions.get(&name) {
                Some(transition) if transition.target == TransitionTarget::Deleting => false,
                Some(transition) => {
                    now.saturating_duration_since(transition.created_at) <= self.grace_period
                }
                None => false,
            };
            if !keep {
                self.members.remove(&name);
                self.transitions.remove(&name);
            }
        }

        // add / refresh; rows still in transition are left alone
        for (name, member) in incoming {
            if self.transitions.contains_key(name) {
                continue;
            }
            match self.members.get_mut(name) {
                Some(existing) => {
                    existing.state = member.state;
                    if member.memory.is_some() {
                        existing.memory = member.memory.clone();
                    }
                    if member.disk.is_some() {
                        existing.disk = member.disk.clone();
                    }
                }
                None => {
                    self.members.insert(name.to_string(), member.clone());
                }
            }
        }

        self.commit()
    }

    /// Fields absent from `stats` keep their current value. Unknown names
    /// are ignored.
    pub fn apply_stats(&mut self, stats: &MemberStats) -> Vec<RowPatch> {
        let Some(member) = self.members.get_mut(&stats.name) else {
            return Vec::new();
        };
        if let Some(memory) = &stats.memory {
            member.memory = Some(memory.clone());
        }
        if let Some(disk) = &stats.disk {
            member.disk = Some(disk.clone());
        }
        self.commit()
    }

    pub fn displayed_state(&self, name: &str) -> Option<MemberState> {
        self.rendered.get(name).map(|record| record.state)
    }

    pub fn transition(&self, name: &str) -> Option<&Transition> {
        self.transitions.get(name)
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    pub fn record(&self, name: &str) -> Option<&DisplayRecord> {
        self.rendered.get(name)
    }

    pub fn rows(&self) -> impl Iterator<Item = &DisplayRecord> {
        self.rendered.values()
    }

    fn commit(&mut self) -> Vec<RowPatch> {
        let desired = self
            .members
            .iter()
            .map(|(name, member)| (name.clone(), render(member, self.transitions.get(name))))
            .collect::<BTreeMap<_, _>>();
        let patches = diff_records(&self.rendered, &desired);
        self.rendered = desired;
        patches
    }
}
