//! Provision table access

use async_trait::async_trait;
use flotilla_core::domain::provision::{Provision, ProvisionState};
use uuid::Uuid;

use super::{PgStore, state_names};
use crate::ProvisionRepository;
use crate::error::{Result, StoreError};

#[async_trait]
impl ProvisionRepository for PgStore {
    async fn create_provision(&self, provision: &Provision) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO provision (status, provision_uuid, cores, mem_gb, storage_gb, job_uuid, ip_address)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING provision_id
            "#,
        )
        .bind(provision.state.as_str())
        .bind(provision.provision_uuid)
        .bind(provision.cores)
        .bind(provision.mem_gb)
        .bind(provision.storage_gb)
        .bind(provision.job_uuid)
        .bind(&provision.ip_address)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn update_provision_by_provision_uuid(
        &self,
        provision_uuid: Uuid,
        job_uuid: Option<Uuid>,
        state: ProvisionState,
        ip_address: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE provision
            SET status = $1, job_uuid = COALESCE($2, job_uuid),
                ip_address = COALESCE($3, ip_address), update_timestamp = NOW()
            WHERE provision_uuid = $4 AND status = ANY($5)
            "#,
        )
        .bind(state.as_str())
        .bind(job_uuid)
        .bind(ip_address)
        .bind(provision_uuid)
        .bind(state_names(state.predecessors()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_provision_by_job_uuid(
        &self,
        job_uuid: Uuid,
        provision_uuid: Option<Uuid>,
        state: ProvisionState,
        ip_address: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE provision
            SET status = $1, provision_uuid = COALESCE($2, provision_uuid),
                ip_address = COALESCE($3, ip_address), update_timestamp = NOW()
            WHERE job_uuid = $4 AND status = ANY($5)
            "#,
        )
        .bind(state.as_str())
        .bind(provision_uuid)
        .bind(ip_address)
        .bind(job_uuid)
        .bind(state_names(state.predecessors()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_provisions(&self, state: Option<ProvisionState>) -> Result<Vec<Provision>> {
        // History is kept; the newest row per address is the current one
        let rows = sqlx::query_as::<_, ProvisionRow>(
            r#"
            SELECT provision_id, provision_uuid, status, cores, mem_gb, storage_gb,
                   job_uuid, ip_address, create_timestamp, update_timestamp
            FROM provision
            WHERE provision_id IN (SELECT MAX(provision_id) FROM provision GROUP BY ip_address)
              AND ($1::TEXT IS NULL OR status = $1)
            ORDER BY provision_id
            "#,
        )
        .bind(state.map(ProvisionState::as_str))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Provision::try_from).collect()
    }

    async fn get_provision_count(&self, state: ProvisionState) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM provision WHERE status = $1")
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    async fn get_desired_vm_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM provision WHERE status = ANY($1)")
            .bind(state_names([ProvisionState::Pending, ProvisionState::Running]))
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ProvisionRow {
    provision_id: i64,
    provision_uuid: Uuid,
    status: String,
    cores: i32,
    mem_gb: i32,
    storage_gb: i32,
    job_uuid: Option<Uuid>,
    ip_address: Option<String>,
    create_timestamp: chrono::DateTime<chrono::Utc>,
    update_timestamp: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<ProvisionRow> for Provision {
    type Error = StoreError;

    fn try_from(row: ProvisionRow) -> Result<Self> {
        Ok(Provision {
            provision_id: Some(row.provision_id),
            provision_uuid: row.provision_uuid,
            state: row.status.parse()?,
            cores: row.cores,
            mem_gb: row.mem_gb,
            storage_gb: row.storage_gb,
            job_uuid: row.job_uuid,
            ip_address: row.ip_address,
            create_ts: Some(row.create_timestamp),
            update_ts: Some(row.update_timestamp),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_row_conversion_keeps_unset_fields_empty() {
        let row = ProvisionRow {
            provision_id: 3,
            provision_uuid: Uuid::new_v4(),
            status: "RUNNING".to_string(),
            cores: 2,
            mem_gb: 4,
            storage_gb: 20,
            job_uuid: None,
            ip_address: None,
            create_timestamp: Utc::now(),
            update_timestamp: Utc::now(),
        };

        let provision = Provision::try_from(row).unwrap();
        assert_eq!(provision.provision_id, Some(3));
        assert_eq!(provision.state, ProvisionState::Running);
        assert!(provision.job_uuid.is_none());
        assert!(provision.ip_address.is_none());
    }

    #[test]
    fn test_row_with_job_only_state_is_rejected() {
        let row = ProvisionRow {
            provision_id: 1,
            provision_uuid: Uuid::new_v4(),
            status: "LOST".to_string(),
            cores: 1,
            mem_gb: 1,
            storage_gb: 1,
            job_uuid: None,
            ip_address: None,
            create_timestamp: Utc::now(),
            update_timestamp: Utc::now(),
        };

        assert!(matches!(
            Provision::try_from(row),
            Err(StoreError::Codec(_))
        ));
    }
}
