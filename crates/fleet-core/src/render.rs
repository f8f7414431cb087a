use crate::reconcile::Transition;
use crate::{FleetMember, MemberState, UNKNOWN_USAGE};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Controls {
    pub start: bool,
    pub stop: bool,
    pub delete: bool,
}

impl Controls {
    pub fn any(&self) -> bool {
        self.start || self.stop || self.delete
    }
}

/// Everything a view needs to draw one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayRecord {
    pub name: String,
    pub state: MemberState,
    /// Pulsing badge: an optimistic transition is pending or the control
    /// plane itself reports an in-between state.
    pub busy: bool,
    pub memory: String,
    pub disk: String,
    pub controls: Controls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowPatch {
    Insert(DisplayRecord),
    Update(DisplayRecord),
    Remove(String),
}

impl RowPatch {
    pub fn name(&self) -> &str {
        match self {
            RowPatch::Insert(record) | RowPatch::Update(record) => &record.name,
            RowPatch::Remove(name) => name,
        }
    }
}

pub fn render(member: &FleetMember, transition: Option<&Transition>) -> DisplayRecord {
    let state = transition
        .map(|transition| transition.target.as_state())
        .unwrap_or(member.state);
    let stable = transition.is_none() && state.is_stable();
    DisplayRecord {
        name: member.name.clone(),
        state,
        busy: !stable,
        memory: usage_label(member.memory.as_deref()),
        disk: usage_label(member.disk.as_deref()),
        controls: Controls {
            start: stable && state == MemberState::Stopped,
            stop: stable && state == MemberState::Running,
            delete: stable,
        },
    }
}

/// Patches that turn `previous` into `desired`, ordered by name.
pub fn diff_records(
    previous: &BTreeMap<String, DisplayRecord>,
    desired: &BTreeMap<String, DisplayRecord>,
) -> Vec<RowPatch> {
    let mut patches = Vec::new();
    for (name, record) in desired {
        match previous.get(name) {
            None => patches.push(RowPatch::Insert(record.clone())),
            Some(old) if old != record => patches.push(RowPatch::Update(record.clone())),
            Some(_) => {}
        }
    }
    for name in previous.keys() {
        if !desired.contains_key(name) {
            patches.push(RowPatch::Remove(name.clone()));
        }
    }
    patches.sort_by(|a, b| a.name().cmp(b.name()));
    patches
}

/// Applies patches to a rendered view in place.
pub fn apply_patches(view: &mut BTreeMap<String, DisplayRecord>, patches: &[RowPatch]) {
    for patch in patches {
        match patch {
            RowPatch::Insert(record) | RowPatch::Update(record) => {
                view.insert(record.name.clone(), record.clone());
            }
            RowPatch::Remove(name) => {
                view.remove(name);
            }
        }
    }
}

fn usage_label(value: Option<&str>) -> String {
    value.unwrap_or(UNKNOWN_USAGE).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::TransitionTarget;
    use std::time::Instant;

    fn transition(name: &str, target: TransitionTarget) -> Transition {
        Transition {
            name: name.to_string(),
            target,
            created_at: Instant::now(),
        }
    }

    #[test]
    fn settled_rows_expose_matching_controls() {
        let stopped = render(&FleetMember::new("a", MemberState::Stopped), None);
        assert!(!stopped.busy);
        assert_eq!(
            stopped.controls,
            Controls {
                start: true,
                stop: false,
                delete: true
            }
        );
        assert_eq!(stopped.memory, "--");

        let running = render(&FleetMember::new("a", MemberState::Running), None);
        assert_eq!(
            running.controls,
            Controls {
                start: false,
                stop: true,
                delete: true
            }
        );
    }

    #[test]
    fn transition_overrides_state_and_locks_controls() {
        let member = FleetMember::new("a", MemberState::Stopped);
        let record = render(&member, Some(&transition("a", TransitionTarget::Starting)));
        assert_eq!(record.state, MemberState::Starting);
        assert!(record.busy);
        assert!(!record.controls.any());
    }

    #[test]
    fn reported_in_between_state_is_busy() {
        let record = render(&FleetMember::new("a", MemberState::Stopping), None);
        assert!(record.busy);
        assert!(!record.controls.any());
    }

    #[test]
    fn diff_emits_only_changes() {
        let a = render(&FleetMember::new("a", MemberState::Stopped), None);
        let b = render(&FleetMember::new("b", MemberState::Running), None);
        let b_stopped = render(&FleetMember::new("b", MemberState::Stopped), None);
        let c = render(&FleetMember::new("c", MemberState::Running), None);

        let previous = BTreeMap::from([
            ("a".to_string(), a.clone()),
            ("b".to_string(), b),
            ("c".to_string(), c),
        ]);
        let desired = BTreeMap::from([
            ("a".to_string(), a),
            ("b".to_string(), b_stopped.clone()),
            ("d".to_string(), render(&FleetMember::new("d", MemberState::Stopped), None)),
        ]);

        let patches = diff_records(&previous, &desired);
        assert_eq!(patches.len(), 3);
        assert_eq!(patches[0], RowPatch::Update(b_stopped));
        assert_eq!(patches[1], RowPatch::Remove("c".to_string()));
        assert!(matches!(&patches[2], RowPatch::Insert(record) if record.name == "d"));

        let mut view = previous.clone();
        apply_patches(&mut view, &patches);
        assert_eq!(view, desired);
    }
}
