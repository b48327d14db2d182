//! Instance tables, created at startup if absent.

use crate::db::DbPool;
use crate::error::AppResult;

const STATEMENTS: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS flowmesh",
    r#"
    CREATE TABLE IF NOT EXISTS flowmesh.workflow_instance (
        uid UUID PRIMARY KEY,
        workflow_uid UUID NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        run_status TEXT NOT NULL,
        input_data JSONB NOT NULL DEFAULT '{}'::jsonb,
        output_data JSONB NOT NULL DEFAULT '{}'::jsonb,
        error_messages JSONB NOT NULL DEFAULT '{}'::jsonb,
        start_time TIMESTAMPTZ,
        end_time TIMESTAMPTZ,
        parent_instance_uid UUID,
        parent_step_instance_uid UUID,
        step_instance_ids UUID[] NOT NULL DEFAULT '{}',
        held_step_instance_uid UUID,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS flowmesh.step_instance (
        uid UUID PRIMARY KEY,
        workflow_instance_uid UUID NOT NULL
            REFERENCES flowmesh.workflow_instance (uid) ON DELETE CASCADE,
        step_definition_uid UUID NOT NULL,
        name TEXT NOT NULL,
        control_structure TEXT NOT NULL,
        structure JSONB NOT NULL,
        selected_case_name TEXT,
        run_status TEXT NOT NULL,
        run_order_label TEXT NOT NULL,
        execution_order INTEGER NOT NULL,
        next_step_id UUID,
        previous_step_id UUID,
        retry_count INTEGER NOT NULL DEFAULT 0,
        run_count INTEGER NOT NULL DEFAULT 0,
        input_data JSONB NOT NULL DEFAULT '{}'::jsonb,
        output_data JSONB NOT NULL DEFAULT '{}'::jsonb,
        failure_reason TEXT,
        start_time TIMESTAMPTZ,
        end_time TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_step_instance_workflow ON flowmesh.step_instance (workflow_instance_uid)",
    "CREATE INDEX IF NOT EXISTS idx_workflow_instance_parent ON flowmesh.workflow_instance (parent_instance_uid)",
    "CREATE INDEX IF NOT EXISTS idx_workflow_instance_created ON flowmesh.workflow_instance (created_at) WHERE parent_instance_uid IS NULL",
];

/// Apply the instance DDL in one transaction.
pub async fn init_schema(pool: &DbPool) -> AppResult<()> {
    let mut tx = pool.begin().await?;
    for statement in STATEMENTS {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    tracing::info!("Instance schema ready");
    Ok(())
}
