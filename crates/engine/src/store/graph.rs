//! Step instance generation.
//!
//! Links between steps are instance ids, so instances are created first
//! and wired in a second pass over an explicit id graph.

use std::collections::HashMap;

use uuid::Uuid;

use crate::definition::StepDefinition;
use crate::engine::state::{RunOrderLabel, RunStatus};

use super::model::{DataMap, StepInstance};

/// Edges of one step instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepLinks {
    pub next: Option<Uuid>,
    pub previous: Option<Uuid>,
}

/// Directed step graph keyed by step instance id.
#[derive(Debug, Default)]
pub struct StepGraph {
    order: Vec<Uuid>,
    links: HashMap<Uuid, StepLinks>,
}

impl StepGraph {
    /// Chain the given ids in order.
    pub fn linear(order: Vec<Uuid>) -> Self {
        let mut links: HashMap<Uuid, StepLinks> =
            order.iter().map(|id| (*id, StepLinks::default())).collect();

        for pair in order.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            if let Some(edge) = links.get_mut(&from) {
                edge.next = Some(to);
            }
            if let Some(edge) = links.get_mut(&to) {
                edge.previous = Some(from);
            }
        }

        Self { order, links }
    }

    pub fn links(&self, id: &Uuid) -> StepLinks {
        self.links.get(id).copied().unwrap_or_default()
    }

    pub fn order(&self) -> &[Uuid] {
        &self.order
    }
}

/// Build the step instances of a new run, sorted by execution order.
///
/// The FIRST step starts from the workflow input overlaid with its own
/// template; every other step starts from its template.
pub fn build_step_instances(
    run_uid: Uuid,
    definitions: &[StepDefinition],
    workflow_input: &DataMap,
) -> Vec<StepInstance> {
    let mut sorted: Vec<&StepDefinition> = definitions.iter().collect();
    sorted.sort_by_key(|d| d.execution_order);

    let len = sorted.len();
    let mut instances: Vec<StepInstance> = sorted
        .into_iter()
        .enumerate()
        .map(|(index, definition)| {
            let label = RunOrderLabel::for_position(index, len);
            let input_data = if label == RunOrderLabel::First {
                let mut merged = workflow_input.clone();
                for (key, value) in &definition.input_data {
                    merged.insert(key.clone(), value.clone());
                }
                merged
            } else {
                definition.input_data.clone()
            };

            StepInstance {
                uid: Uuid::new_v4(),
                workflow_instance_uid: run_uid,
                step_definition_uid: definition.uid,
                name: definition.name.clone(),
                structure: definition.structure.clone(),
                selected_case_name: None,
                run_status: RunStatus::New,
                run_order_label: label,
                execution_order: definition.execution_order,
                next_step_id: None,
                previous_step_id: None,
                retry_count: definition.retry_count.max(0),
                run_count: 0,
                input_data,
                output_data: DataMap::new(),
                failure_reason: None,
                start_time: None,
                end_time: None,
            }
        })
        .collect();

    let graph = StepGraph::linear(instances.iter().map(|s| s.uid).collect());
    for instance in &mut instances {
        let links = graph.links(&instance.uid);
        instance.next_step_id = links.next;
        instance.previous_step_id = links.previous;
    }

    instances
}
