//! Expression evaluation against a run's step instances.
//!
//! Bracketed references name a step of the same run (or `self`, the step
//! being evaluated) and a path into its input or output mapping. Values
//! are looked up in the instance repository before the expression runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::expression::{self, ExpressionEngine, ParsedExpression, Section};
use crate::store::{DataMap, InstanceRepository, StepInstance};

const FORMULA_PREFIX: &str = "@formula#";
const FORMULA_SUFFIX: &str = "#";

/// Name that refers to the step currently being evaluated.
pub const SELF_STEP: &str = "self";

/// Variable bound to the looping step's run count in stop conditions.
pub const RUN_COUNT_VARIABLE: &str = "runCount";

/// Evaluates step expressions for one engine.
pub struct ExpressionEvaluator {
    repository: Arc<dyn InstanceRepository>,
    engine: ExpressionEngine,
}

impl ExpressionEvaluator {
    pub fn new(repository: Arc<dyn InstanceRepository>) -> Self {
        Self {
            repository,
            engine: ExpressionEngine::new(),
        }
    }

    /// Evaluate an expression to its JSON value.
    pub async fn evaluate(
        &self,
        workflow_instance_uid: Uuid,
        expr: &str,
        current: Option<&StepInstance>,
    ) -> AppResult<serde_json::Value> {
        let parsed = expression::parse(expr)?;
        let steps = self
            .load_referenced_steps(workflow_instance_uid, std::slice::from_ref(&parsed), current)
            .await?;
        let bindings = bind_references(&parsed, &steps)?;
        self.engine.eval(&parsed, &bindings)
    }

    pub async fn evaluate_boolean_expression(
        &self,
        workflow_instance_uid: Uuid,
        expr: &str,
    ) -> AppResult<bool> {
        let value = self.evaluate(workflow_instance_uid, expr, None).await?;
        expression::as_bool(expr, &value)
    }

    pub async fn evaluate_string_expression(
        &self,
        workflow_instance_uid: Uuid,
        expr: &str,
    ) -> AppResult<String> {
        let value = self.evaluate(workflow_instance_uid, expr, None).await?;
        Ok(expression::as_string(&value))
    }

    pub async fn evaluate_double_expression(
        &self,
        workflow_instance_uid: Uuid,
        expr: &str,
    ) -> AppResult<f64> {
        let value = self.evaluate(workflow_instance_uid, expr, None).await?;
        expression::as_f64(expr, &value)
    }

    /// Evaluate a SWITCH expression with `self` bound to the switch step.
    pub async fn evaluate_switch_expression(
        &self,
        step: &StepInstance,
        expr: &str,
    ) -> AppResult<String> {
        let value = self
            .evaluate(step.workflow_instance_uid, expr, Some(step))
            .await?;
        Ok(expression::as_string(&value))
    }

    /// Evaluate a DO_WHILE stop condition. `self` is the looping step and
    /// `runCount` its number of completed iterations.
    pub async fn evaluate_do_while_condition(
        &self,
        workflow_instance_uid: Uuid,
        stop_expr: &str,
        step: &StepInstance,
    ) -> AppResult<bool> {
        let parsed = expression::parse(stop_expr)?;
        let steps = self
            .load_referenced_steps(workflow_instance_uid, std::slice::from_ref(&parsed), Some(step))
            .await?;
        let mut bindings = bind_references(&parsed, &steps)?;
        bindings.insert(
            RUN_COUNT_VARIABLE.to_string(),
            serde_json::Value::from(step.run_count),
        );

        let value = self.engine.eval(&parsed, &bindings)?;
        expression::as_bool(stop_expr, &value)
    }

    /// Replace every `@formula#<expr>#` string in `input`, at any depth,
    /// with the value of `<expr>`.
    pub async fn normalize_input_data(
        &self,
        input: &DataMap,
        workflow_instance_uid: Uuid,
        current: Option<&StepInstance>,
    ) -> AppResult<DataMap> {
        let mut formulas = Vec::new();
        for value in input.values() {
            collect_formulas(value, &mut formulas)?;
        }
        if formulas.is_empty() {
            return Ok(input.clone());
        }

        let steps = self
            .load_referenced_steps(workflow_instance_uid, &formulas, current)
            .await?;

        let mut evaluated: HashMap<String, serde_json::Value> = HashMap::new();
        for parsed in &formulas {
            let bindings = bind_references(parsed, &steps)?;
            let value = self.engine.eval(parsed, &bindings)?;
            evaluated.insert(parsed.source.clone(), value);
        }

        Ok(input
            .iter()
            .map(|(key, value)| (key.clone(), substitute_formulas(value, &evaluated)))
            .collect())
    }

    /// Fetch every step named by the references, keyed by name.
    async fn load_referenced_steps(
        &self,
        workflow_instance_uid: Uuid,
        expressions: &[ParsedExpression],
        current: Option<&StepInstance>,
    ) -> AppResult<HashMap<String, StepInstance>> {
        let mut steps: HashMap<String, StepInstance> = HashMap::new();

        for reference in expressions.iter().flat_map(|e| e.references.iter()) {
            if steps.contains_key(&reference.step) {
                continue;
            }

            let step = if reference.step == SELF_STEP {
                current.cloned().ok_or_else(|| {
                    AppError::DataPath("'self' is only available inside a step".to_string())
                })?
            } else {
                self.repository
                    .find_step_by_name(workflow_instance_uid, &reference.step)
                    .await?
                    .ok_or_else(|| {
                        AppError::DataPath(format!(
                            "Step '{}' not found in workflow instance {}",
                            reference.step, workflow_instance_uid
                        ))
                    })?
            };
            steps.insert(reference.step.clone(), step);
        }

        Ok(steps)
    }
}

fn bind_references(
    parsed: &ParsedExpression,
    steps: &HashMap<String, StepInstance>,
) -> AppResult<BTreeMap<String, serde_json::Value>> {
    parsed
        .references
        .iter()
        .map(|reference| {
            let step = steps.get(&reference.step).ok_or_else(|| {
                AppError::DataPath(format!("Step '{}' not found", reference.step))
            })?;
            let data = match reference.section {
                Section::Input => &step.input_data,
                Section::Output => &step.output_data,
            };
            Ok((reference.variable.clone(), reference.resolve(data)?))
        })
        .collect()
}

/// Formula body of a marked string, if it is one.
fn formula_body(s: &str) -> Option<&str> {
    s.strip_prefix(FORMULA_PREFIX)
        .and_then(|rest| rest.strip_suffix(FORMULA_SUFFIX))
}

fn collect_formulas(value: &serde_json::Value, out: &mut Vec<ParsedExpression>) -> AppResult<()> {
    match value {
        serde_json::Value::String(s) => {
            if let Some(body) = formula_body(s) {
                out.push(expression::parse(body)?);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_formulas(item, out)?;
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_formulas(item, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn substitute_formulas(
    value: &serde_json::Value,
    evaluated: &HashMap<String, serde_json::Value>,
) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => formula_body(s)
            .and_then(|body| evaluated.get(body))
            .cloned()
            .unwrap_or_else(|| value.clone()),
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|item| substitute_formulas(item, evaluated))
                .collect(),
        ),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_formulas(v, evaluated)))
                .collect(),
        ),
        other => other.clone(),
    }
}
