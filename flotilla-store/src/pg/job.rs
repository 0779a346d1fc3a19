//! Job table access

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flotilla_core::domain::job::{Job, JobState};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{PgStore, state_names};
use crate::JobRepository;
use crate::error::{Result, StoreError};

const JOB_COLUMNS: &str = r#"
    job_id, job_uuid, status, workflow, workflow_version, workflow_path, job_hash,
    arguments, extra_files, provision_uuid, stdout, stderr, end_user, flavour,
    create_timestamp, update_timestamp
"#;

#[async_trait]
impl JobRepository for PgStore {
    async fn create_job(&self, job: &Job) -> Result<Uuid> {
        sqlx::query(
            r#"
            INSERT INTO job (status, job_uuid, workflow, workflow_version, workflow_path,
                             job_hash, arguments, extra_files, provision_uuid, end_user, flavour)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (job_uuid) DO NOTHING
            "#,
        )
        .bind(job.state.as_str())
        .bind(job.job_uuid)
        .bind(&job.workflow_name)
        .bind(&job.workflow_version)
        .bind(&job.workflow_path)
        .bind(&job.job_hash)
        .bind(serde_json::to_value(&job.arguments)?)
        .bind(serde_json::to_value(&job.extra_files)?)
        .bind(job.vm_uuid)
        .bind(&job.end_user)
        .bind(&job.flavour)
        .execute(&self.pool)
        .await?;

        Ok(job.job_uuid)
    }

    async fn find_job(&self, job_uuid: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM job WHERE job_uuid = $1",
            JOB_COLUMNS
        ))
        .bind(job_uuid)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn update_job(
        &self,
        job_uuid: Uuid,
        vm_uuid: Option<Uuid>,
        state: JobState,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job
            SET status = $1, provision_uuid = COALESCE($2, provision_uuid), update_timestamp = NOW()
            WHERE job_uuid = $3 AND status = ANY($4)
            "#,
        )
        .bind(state.as_str())
        .bind(vm_uuid)
        .bind(job_uuid)
        .bind(state_names(state.predecessors()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_job_output(
        &self,
        job_uuid: Uuid,
        stdout: Option<&str>,
        stderr: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job
            SET stdout = COALESCE($1, stdout), stderr = COALESCE($2, stderr), update_timestamp = NOW()
            WHERE job_uuid = $3
            "#,
        )
        .bind(stdout)
        .bind(stderr)
        .bind(job_uuid)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_lost(&self, job_uuid: Uuid, cutoff: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job
            SET status = $1, update_timestamp = NOW()
            WHERE job_uuid = $2 AND status = $3 AND update_timestamp < $4
            "#,
        )
        .bind(JobState::Lost.as_str())
        .bind(job_uuid)
        .bind(JobState::Running.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_job(&self, job_uuid: Uuid) -> Result<bool> {
        self.update_job(job_uuid, None, JobState::Success).await
    }

    async fn get_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM job WHERE ($1::TEXT IS NULL OR status = $1) ORDER BY job_id",
            JOB_COLUMNS
        ))
        .bind(state.map(JobState::as_str))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn previously_run(&self, job_hash: &str) -> Result<bool> {
        let found: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM job
                WHERE job_hash = $1 AND status <> ALL($2)
            )
            "#,
        )
        .bind(job_hash)
        .bind(state_names([JobState::Failed, JobState::Lost]))
        .fetch_one(&self.pool)
        .await?;

        Ok(found)
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: i64,
    job_uuid: Uuid,
    status: String,
    workflow: String,
    workflow_version: String,
    workflow_path: String,
    job_hash: String,
    arguments: serde_json::Value,
    extra_files: serde_json::Value,
    provision_uuid: Option<Uuid>,
    stdout: Option<String>,
    stderr: Option<String>,
    end_user: Option<String>,
    flavour: Option<String>,
    create_timestamp: chrono::DateTime<chrono::Utc>,
    update_timestamp: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self> {
        let arguments: BTreeMap<String, String> = serde_json::from_value(row.arguments)?;
        let extra_files: BTreeMap<String, String> = serde_json::from_value(row.extra_files)?;

        Ok(Job {
            job_id: Some(row.job_id),
            job_uuid: row.job_uuid,
            state: row.status.parse()?,
            workflow_name: row.workflow,
            workflow_version: row.workflow_version,
            workflow_path: row.workflow_path,
            job_hash: row.job_hash,
            arguments,
            extra_files,
            vm_uuid: row.provision_uuid,
            stdout: row.stdout,
            stderr: row.stderr,
            end_user: row.end_user,
            flavour: row.flavour,
            create_ts: Some(row.create_timestamp),
            update_ts: Some(row.update_timestamp),
        })
    }
}
