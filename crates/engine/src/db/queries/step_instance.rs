//! Step instance queries.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::db::models::StepInstanceRow;
use crate::db::DbPool;
use crate::engine::state::RunStatus;
use crate::error::AppResult;
use crate::store::model::{DataMap, StepInstance, StepResultUpdate};

const SELECT_COLUMNS: &str = r#"
    SELECT uid, workflow_instance_uid, step_definition_uid, name, control_structure, structure,
           selected_case_name, run_status, run_order_label, execution_order, next_step_id,
           previous_step_id, retry_count, run_count, input_data, output_data, failure_reason,
           start_time, end_time
    FROM flowmesh.step_instance
"#;

/// Insert a step instance.
pub async fn insert_step_instance(conn: &mut PgConnection, step: &StepInstance) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO flowmesh.step_instance (
            uid, workflow_instance_uid, step_definition_uid, name, control_structure, structure,
            selected_case_name, run_status, run_order_label, execution_order, next_step_id,
            previous_step_id, retry_count, run_count, input_data, output_data, failure_reason,
            start_time, end_time
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        "#,
    )
    .bind(step.uid)
    .bind(step.workflow_instance_uid)
    .bind(step.step_definition_uid)
    .bind(&step.name)
    .bind(step.structure.control_structure().as_str())
    .bind(serde_json::to_value(&step.structure)?)
    .bind(&step.selected_case_name)
    .bind(step.run_status.as_str())
    .bind(step.run_order_label.as_str())
    .bind(step.execution_order)
    .bind(step.next_step_id)
    .bind(step.previous_step_id)
    .bind(step.retry_count)
    .bind(step.run_count)
    .bind(serde_json::Value::Object(step.input_data.clone()))
    .bind(serde_json::Value::Object(step.output_data.clone()))
    .bind(&step.failure_reason)
    .bind(step.start_time)
    .bind(step.end_time)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn get_step_instance(pool: &DbPool, uid: Uuid) -> AppResult<Option<StepInstanceRow>> {
    let row = sqlx::query_as::<_, StepInstanceRow>(&format!("{} WHERE uid = $1", SELECT_COLUMNS))
        .bind(uid)
        .fetch_optional(pool)
        .await?;

    Ok(row)
}

/// Steps of a run in execution order.
pub async fn list_for_workflow(pool: &DbPool, run_uid: Uuid) -> AppResult<Vec<StepInstanceRow>> {
    let rows = sqlx::query_as::<_, StepInstanceRow>(&format!(
        "{} WHERE workflow_instance_uid = $1 ORDER BY execution_order ASC",
        SELECT_COLUMNS
    ))
    .bind(run_uid)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn find_by_name(pool: &DbPool, run_uid: Uuid, name: &str) -> AppResult<Option<StepInstanceRow>> {
    let row = sqlx::query_as::<_, StepInstanceRow>(&format!(
        "{} WHERE workflow_instance_uid = $1 AND name = $2 LIMIT 1",
        SELECT_COLUMNS
    ))
    .bind(run_uid)
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

pub async fn update_status(pool: &DbPool, uid: Uuid, status: RunStatus) -> AppResult<()> {
    sqlx::query("UPDATE flowmesh.step_instance SET run_status = $2 WHERE uid = $1")
        .bind(uid)
        .bind(status.as_str())
        .execute(pool)
        .await?;

    Ok(())
}

/// Mark a step RUNNING with fresh input.
pub async fn launch(pool: &DbPool, uid: Uuid, input: &DataMap, at: DateTime<Utc>) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE flowmesh.step_instance
        SET run_status = $2, input_data = $3, start_time = $4, end_time = NULL, failure_reason = NULL
        WHERE uid = $1
        "#,
    )
    .bind(uid)
    .bind(RunStatus::Running.as_str())
    .bind(serde_json::Value::Object(input.clone()))
    .bind(at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn set_start_time(pool: &DbPool, uid: Uuid, at: DateTime<Utc>) -> AppResult<()> {
    sqlx::query("UPDATE flowmesh.step_instance SET start_time = $2 WHERE uid = $1")
        .bind(uid)
        .bind(at)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn set_end_time(pool: &DbPool, uid: Uuid, at: DateTime<Utc>) -> AppResult<()> {
    sqlx::query("UPDATE flowmesh.step_instance SET end_time = $2 WHERE uid = $1")
        .bind(uid)
        .bind(at)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn set_selected_case(pool: &DbPool, uid: Uuid, case_name: &str) -> AppResult<()> {
    sqlx::query("UPDATE flowmesh.step_instance SET selected_case_name = $2 WHERE uid = $1")
        .bind(uid)
        .bind(case_name)
        .execute(pool)
        .await?;

    Ok(())
}

/// Consume one retry if any remain.
pub async fn decrement_retry(pool: &DbPool, uid: Uuid) -> AppResult<bool> {
    let result = sqlx::query(
        "UPDATE flowmesh.step_instance SET retry_count = retry_count - 1 WHERE uid = $1 AND retry_count > 0",
    )
    .bind(uid)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Apply a result only to a RUNNING step with the expected run count.
pub async fn apply_result(pool: &DbPool, uid: Uuid, update: &StepResultUpdate) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE flowmesh.step_instance
        SET run_status = $2,
            output_data = $3,
            failure_reason = $4,
            end_time = $5,
            run_count = run_count + 1
        WHERE uid = $1
          AND run_status = $6
          AND run_count = $7
        "#,
    )
    .bind(uid)
    .bind(update.run_status.as_str())
    .bind(serde_json::Value::Object(update.output_data.clone()))
    .bind(&update.failure_reason)
    .bind(update.end_time)
    .bind(RunStatus::Running.as_str())
    .bind(update.expected_run_count)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
