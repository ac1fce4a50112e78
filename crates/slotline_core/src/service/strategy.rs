//! Per-kind association strategies.
//!
//! # Responsibility
//! - Turn association data into slot data for uncovered parts of a range.
//! - Combine association data with an overlapped slot's data.
//!
//! # Invariants
//! - Strategies are selected by `AssociationKind`, one table entry per kind.
//! - `convert` returning `None` means the association has no representable fact.

use crate::model::association::{AssociationData, AssociationKind};
use crate::model::range::UtcRange;
use crate::model::slot::{
    CncVariableData, ObservationStateData, ShiftData, Slot, SlotData, ToolPositionData,
};

/// Data for a part of the range no slot covered yet.
pub type ConvertFn = fn(&AssociationData) -> Option<SlotData>;
/// Data for the part of `old` overlapped by the association (`overlap`).
pub type MergeWithOldFn = fn(&AssociationData, &Slot, &UtcRange) -> Option<SlotData>;

#[derive(Clone, Copy)]
pub struct AssociationStrategy {
    pub convert: ConvertFn,
    pub merge_with_old: MergeWithOldFn,
}

const STRATEGIES: &[(AssociationKind, AssociationStrategy)] = &[
    (
        AssociationKind::MachineStateTemplate,
        AssociationStrategy {
            convert: convert_machine_state_template,
            merge_with_old: merge_machine_state_template,
        },
    ),
    (
        AssociationKind::MachineObservationState,
        AssociationStrategy {
            convert: convert_machine_observation_state,
            merge_with_old: override_old,
        },
    ),
    (
        AssociationKind::ShiftChange,
        AssociationStrategy {
            convert: convert_shift_change,
            merge_with_old: override_old,
        },
    ),
    (
        AssociationKind::ToolPosition,
        AssociationStrategy {
            convert: convert_tool_position,
            merge_with_old: override_old,
        },
    ),
    (
        AssociationKind::CncVariable,
        AssociationStrategy {
            convert: convert_cnc_variable,
            merge_with_old: override_old,
        },
    ),
];

/// Strategy registered for `kind`.
pub fn strategy_for(kind: AssociationKind) -> Option<AssociationStrategy> {
    STRATEGIES
        .iter()
        .find(|(registered, _)| *registered == kind)
        .map(|(_, strategy)| *strategy)
}

fn override_old(data: &AssociationData, _old: &Slot, _overlap: &UtcRange) -> Option<SlotData> {
    strategy_for(data.kind()).and_then(|strategy| (strategy.convert)(data))
}

fn convert_machine_state_template(data: &AssociationData) -> Option<SlotData> {
    match data {
        AssociationData::MachineStateTemplate {
            machine_state_template,
            user,
            shift,
            ..
        } => Some(SlotData::ObservationState(ObservationStateData {
            machine_state_template: Some(*machine_state_template),
            machine_observation_state: None,
            user: *user,
            shift: *shift,
            production: None,
        })),
        _ => None,
    }
}

fn merge_machine_state_template(
    data: &AssociationData,
    old: &Slot,
    _overlap: &UtcRange,
) -> Option<SlotData> {
    let AssociationData::MachineStateTemplate {
        machine_state_template,
        user,
        shift,
        force,
        ..
    } = data
    else {
        return None;
    };
    let SlotData::ObservationState(previous) = &old.data else {
        return convert_machine_state_template(data);
    };

    let unchanged = previous.machine_state_template == Some(*machine_state_template) && !force;
    let (machine_observation_state, production) = if unchanged {
        (previous.machine_observation_state, previous.production)
    } else {
        (None, None)
    };
    Some(SlotData::ObservationState(ObservationStateData {
        machine_state_template: Some(*machine_state_template),
        machine_observation_state,
        user: user.or(previous.user),
        shift: *shift,
        production,
    }))
}

fn convert_machine_observation_state(data: &AssociationData) -> Option<SlotData> {
    match data {
        AssociationData::MachineObservationState {
            machine_observation_state,
            production,
            machine_state_template,
            user,
            shift,
        } => Some(SlotData::ObservationState(ObservationStateData {
            machine_state_template: *machine_state_template,
            machine_observation_state: Some(*machine_observation_state),
            user: *user,
            shift: *shift,
            production: Some(*production),
        })),
        _ => None,
    }
}

fn convert_shift_change(data: &AssociationData) -> Option<SlotData> {
    match data {
        AssociationData::ShiftChange {
            shift_template,
            shift,
        } => Some(SlotData::Shift(ShiftData {
            shift_template: *shift_template,
            shift: *shift,
        })),
        _ => None,
    }
}

fn convert_tool_position(data: &AssociationData) -> Option<SlotData> {
    match data {
        AssociationData::ToolPosition {
            tool_number,
            magazine,
            pot,
        } => Some(SlotData::ToolPosition(ToolPositionData {
            tool_number: tool_number.clone(),
            magazine: *magazine,
            pot: *pot,
        })),
        _ => None,
    }
}

fn convert_cnc_variable(data: &AssociationData) -> Option<SlotData> {
    match data {
        AssociationData::CncVariable {
            key,
            value: Some(value),
        } => Some(SlotData::CncVariable(CncVariableData {
            key: key.clone(),
            value: value.clone(),
        })),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::strategy_for;
    use crate::model::association::{AssociationData, AssociationKind};
    use crate::model::partition::PartitionKey;
    use crate::model::range::UtcRange;
    use crate::model::slot::{ObservationStateData, Slot, SlotData};

    fn observed(template: i64, state: i64, user: Option<i64>) -> Slot {
        Slot::new(
            PartitionKey::Machine(1),
            UtcRange::between(0, 100),
            SlotData::ObservationState(ObservationStateData {
                machine_state_template: Some(template),
                machine_observation_state: Some(state),
                user,
                shift: None,
                production: Some(false),
            }),
        )
    }

    fn template_association(template: i64, force: bool) -> AssociationData {
        AssociationData::MachineStateTemplate {
            machine_state_template: template,
            user: None,
            shift: Some(9),
            force,
            user_required: false,
        }
    }

    #[test]
    fn every_kind_has_a_strategy() {
        for kind in [
            AssociationKind::MachineStateTemplate,
            AssociationKind::MachineObservationState,
            AssociationKind::ShiftChange,
            AssociationKind::ToolPosition,
            AssociationKind::CncVariable,
        ] {
            assert!(strategy_for(kind).is_some(), "missing strategy for {kind}");
        }
    }

    #[test]
    fn same_template_keeps_observation_state_and_user() {
        let data = template_association(2, false);
        let strategy = strategy_for(data.kind()).unwrap();
        let merged = (strategy.merge_with_old)(&data, &observed(2, 7, Some(5)), &UtcRange::all());
        assert_eq!(
            merged,
            Some(SlotData::ObservationState(ObservationStateData {
                machine_state_template: Some(2),
                machine_observation_state: Some(7),
                user: Some(5),
                shift: Some(9),
                production: Some(false),
            }))
        );
    }

    #[test]
    fn changed_or_forced_template_resets_observation_state() {
        for (data, old) in [
            (template_association(3, false), observed(2, 7, None)),
            (template_association(2, true), observed(2, 7, None)),
        ] {
            let strategy = strategy_for(data.kind()).unwrap();
            let Some(SlotData::ObservationState(merged)) =
                (strategy.merge_with_old)(&data, &old, &UtcRange::all())
            else {
                panic!("expected observation state data");
            };
            assert_eq!(merged.machine_observation_state, None);
            assert_eq!(merged.production, None);
        }
    }

    #[test]
    fn cnc_variable_without_value_has_no_fact() {
        let data = AssociationData::CncVariable {
            key: "spindle".to_string(),
            value: None,
        };
        let strategy = strategy_for(data.kind()).unwrap();
        assert_eq!((strategy.convert)(&data), None);
    }
}
