//! Workflow instance queries.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::db::models::WorkflowInstanceRow;
use crate::db::DbPool;
use crate::engine::state::RunStatus;
use crate::error::AppResult;
use crate::store::model::{DataMap, WorkflowInstance};

const SELECT_COLUMNS: &str = r#"
    SELECT uid, workflow_uid, name, description, run_status, input_data, output_data,
           error_messages, start_time, end_time, parent_instance_uid,
           parent_step_instance_uid, step_instance_ids, held_step_instance_uid, created_at
    FROM flowmesh.workflow_instance
"#;

fn terminal_status_names() -> Vec<String> {
    RunStatus::terminal_states()
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

/// Insert a workflow instance.
pub async fn insert_workflow_instance(
    conn: &mut PgConnection,
    run: &WorkflowInstance,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO flowmesh.workflow_instance (
            uid, workflow_uid, name, description, run_status, input_data, output_data,
            error_messages, start_time, end_time, parent_instance_uid,
            parent_step_instance_uid, step_instance_ids, held_step_instance_uid, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(run.uid)
    .bind(run.workflow_uid)
    .bind(&run.name)
    .bind(&run.description)
    .bind(run.run_status.as_str())
    .bind(serde_json::Value::Object(run.input_data.clone()))
    .bind(serde_json::Value::Object(run.output_data.clone()))
    .bind(serde_json::to_value(&run.error_messages)?)
    .bind(run.start_time)
    .bind(run.end_time)
    .bind(run.parent_instance_uid)
    .bind(run.parent_step_instance_uid)
    .bind(&run.step_instance_ids)
    .bind(run.held_step_instance_uid)
    .bind(run.created_at)
    .execute(conn)
    .await?;

    Ok(())
}

/// Get a workflow instance by uid.
pub async fn get_workflow_instance(pool: &DbPool, uid: Uuid) -> AppResult<Option<WorkflowInstanceRow>> {
    let row = sqlx::query_as::<_, WorkflowInstanceRow>(&format!("{} WHERE uid = $1", SELECT_COLUMNS))
        .bind(uid)
        .fetch_optional(pool)
        .await?;

    Ok(row)
}

/// Conditionally update the run status. Terminal rows never match.
pub async fn update_run_status(
    pool: &DbPool,
    uid: Uuid,
    status: RunStatus,
    expected: Option<RunStatus>,
) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE flowmesh.workflow_instance
        SET run_status = $2
        WHERE uid = $1
          AND run_status <> ALL($3)
          AND ($4::text IS NULL OR run_status = $4)
        "#,
    )
    .bind(uid)
    .bind(status.as_str())
    .bind(terminal_status_names())
    .bind(expected.map(|s| s.as_str()))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn set_start_time(pool: &DbPool, uid: Uuid, at: DateTime<Utc>) -> AppResult<()> {
    sqlx::query("UPDATE flowmesh.workflow_instance SET start_time = $2 WHERE uid = $1")
        .bind(uid)
        .bind(at)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn set_end_time(pool: &DbPool, uid: Uuid, at: DateTime<Utc>) -> AppResult<()> {
    sqlx::query("UPDATE flowmesh.workflow_instance SET end_time = $2 WHERE uid = $1")
        .bind(uid)
        .bind(at)
        .execute(pool)
        .await?;

    Ok(())
}

/// Record a step's failure reason under its name.
pub async fn record_error(pool: &DbPool, uid: Uuid, step_name: &str, reason: &str) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE flowmesh.workflow_instance
        SET error_messages = error_messages || jsonb_build_object($2::text, $3::text)
        WHERE uid = $1
        "#,
    )
    .bind(uid)
    .bind(step_name)
    .bind(reason)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn set_output(pool: &DbPool, uid: Uuid, output: &DataMap) -> AppResult<()> {
    sqlx::query("UPDATE flowmesh.workflow_instance SET output_data = $2 WHERE uid = $1")
        .bind(uid)
        .bind(serde_json::Value::Object(output.clone()))
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn set_held_step(pool: &DbPool, uid: Uuid, step_uid: Option<Uuid>) -> AppResult<()> {
    sqlx::query("UPDATE flowmesh.workflow_instance SET held_step_instance_uid = $2 WHERE uid = $1")
        .bind(uid)
        .bind(step_uid)
        .execute(pool)
        .await?;

    Ok(())
}

/// Clear the held step, returning the previous value.
pub async fn take_held_step(pool: &DbPool, uid: Uuid) -> AppResult<Option<Uuid>> {
    let result: Option<(Option<Uuid>,)> = sqlx::query_as(
        r#"
        UPDATE flowmesh.workflow_instance AS w
        SET held_step_instance_uid = NULL
        FROM (
            SELECT uid, held_step_instance_uid
            FROM flowmesh.workflow_instance
            WHERE uid = $1
            FOR UPDATE
        ) AS previous
        WHERE w.uid = previous.uid
        RETURNING previous.held_step_instance_uid
        "#,
    )
    .bind(uid)
    .fetch_optional(pool)
    .await?;

    Ok(result.and_then(|(held,)| held))
}

/// Top-level runs, oldest first.
pub async fn list_top_level(pool: &DbPool) -> AppResult<Vec<(Uuid, DateTime<Utc>)>> {
    let rows: Vec<(Uuid, DateTime<Utc>)> = sqlx::query_as(
        r#"
        SELECT uid, created_at
        FROM flowmesh.workflow_instance
        WHERE parent_instance_uid IS NULL
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Delete the given runs and all of their descendants. Step instances
/// follow through the foreign key cascade.
pub async fn delete_with_descendants(pool: &DbPool, uids: &[Uuid]) -> AppResult<u64> {
    let result = sqlx::query(
        r#"
        WITH RECURSIVE doomed AS (
            SELECT uid FROM flowmesh.workflow_instance WHERE uid = ANY($1)
            UNION
            SELECT child.uid
            FROM flowmesh.workflow_instance AS child
            JOIN doomed ON child.parent_instance_uid = doomed.uid
        )
        DELETE FROM flowmesh.workflow_instance
        WHERE uid IN (SELECT uid FROM doomed)
        "#,
    )
    .bind(uids)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
