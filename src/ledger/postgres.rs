//! PostgreSQL ledger.
//!
//! Schema lives in `migrations/`; [`PgLedger::migrate`] applies it. Every
//! uniqueness rule of the ledger is a table constraint, and inserts use
//! `ON CONFLICT DO NOTHING` so a conflict surfaces as `Ok(false)` instead of
//! aborting the surrounding transaction.

use super::{Ledger, LedgerTx};
use crate::error::{BatchErrorEntry, LedgerError};
use crate::model::{
    AccountId, AlertStatus, BatchItem, BatchJob, BatchLink, BatchPurpose, BatchStatus,
    CounterDelta, Invoice, InvoiceItem, InvoiceStatus, Material, MaterialCategory,
    MaterialProvider, PendingInvoice, PriceAlert, Provider, ProviderType, UnassignedInvoice,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{ConnectOptions, PgPool, Postgres, Row, Transaction};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                LedgerError::Unavailable(e.to_string())
            }
            // serialization_failure, deadlock_detected
            sqlx::Error::Database(db)
                if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) =>
            {
                LedgerError::Unavailable(e.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                LedgerError::Corrupt(e.to_string())
            }
            _ => LedgerError::Backend(e.to_string()),
        }
    }
}

fn int(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

fn uint(v: i32) -> u32 {
    u32::try_from(v).unwrap_or(0)
}

/// Ledger backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool for `database_url`. Statements slower than five seconds
    /// are logged at WARN.
    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        let options = PgConnectOptions::from_str(database_url)?
            .log_slow_statements(tracing::log::LevelFilter::Warn, Duration::from_secs(5));
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::Backend(e.to_string()))
    }

    /// Register an account under a tax id.
    pub async fn register_account(&self, cif: &str, account: AccountId) -> Result<(), LedgerError> {
        sqlx::query("INSERT INTO accounts (id, cif) VALUES ($1, $2) ON CONFLICT (cif) DO NOTHING")
            .bind(account)
            .bind(crate::resolver::normalize::canonical_cif(cif))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ── Row mapping ──────────────────────────────────────────────────────────

const PROVIDER_COLS: &str =
    "id, account_id, cif, name, email, phone, address, provider_type";
const MATERIAL_COLS: &str = "id, account_id, code, reference_code, name, category";
const BATCH_COLS: &str = "id, user_id, account_id, status, purpose, total_files, \
     processed_files, successful_files, failed_files, blocked_files, errors, \
     created_at, started_at, completed_at";

fn provider_from_row(row: &PgRow) -> Result<Provider, LedgerError> {
    Ok(Provider {
        id: row.try_get("id")?,
        account: row.try_get("account_id")?,
        cif: row.try_get("cif")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        address: row.try_get("address")?,
        provider_type: ProviderType::parse(row.try_get::<&str, _>("provider_type")?),
    })
}

fn material_from_row(row: &PgRow) -> Result<Material, LedgerError> {
    Ok(Material {
        id: row.try_get("id")?,
        account: row.try_get("account_id")?,
        code: row.try_get("code")?,
        reference_code: row.try_get("reference_code")?,
        name: row.try_get("name")?,
        category: MaterialCategory::parse(row.try_get::<&str, _>("category")?),
    })
}

fn invoice_from_row(row: &PgRow) -> Result<Invoice, LedgerError> {
    let status = match row.try_get::<&str, _>("status")? {
        "REVIEWED" => InvoiceStatus::Reviewed,
        _ => InvoiceStatus::Processed,
    };
    Ok(Invoice {
        id: row.try_get("id")?,
        account: row.try_get("account_id")?,
        invoice_code: row.try_get("invoice_code")?,
        provider_id: row.try_get("provider_id")?,
        issue_date: row.try_get("issue_date")?,
        total_amount: row.try_get("total_amount")?,
        status,
        document_key: row.try_get("document_key")?,
    })
}

fn batch_from_row(row: &PgRow) -> Result<BatchJob, LedgerError> {
    let status: &str = row.try_get("status")?;
    let purpose: &str = row.try_get("purpose")?;
    let Json(errors): Json<Vec<BatchErrorEntry>> = row.try_get("errors")?;
    Ok(BatchJob {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        account: row.try_get("account_id")?,
        status: BatchStatus::parse(status)
            .ok_or_else(|| LedgerError::Corrupt(format!("batch status '{status}'")))?,
        purpose: BatchPurpose::parse(purpose)
            .ok_or_else(|| LedgerError::Corrupt(format!("batch purpose '{purpose}'")))?,
        total_files: uint(row.try_get("total_files")?),
        processed_files: uint(row.try_get("processed_files")?),
        successful_files: uint(row.try_get("successful_files")?),
        failed_files: uint(row.try_get("failed_files")?),
        blocked_files: uint(row.try_get("blocked_files")?),
        errors,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<BatchItem, LedgerError> {
    Ok(BatchItem {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        document_key: row.try_get("document_key")?,
        file_name: row.try_get("file_name")?,
        processed: row.try_get("processed")?,
        extracted_payload: row.try_get("extracted_payload")?,
        error_message: row.try_get("error_message")?,
    })
}

// ── Transactions ─────────────────────────────────────────────────────────

/// One PostgreSQL transaction. Dropping it rolls back.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgTx {
    async fn find_provider_by_cif(
        &mut self,
        account: AccountId,
        variants: &[String],
    ) -> Result<Option<Provider>, LedgerError> {
        let sql = format!(
            "SELECT {PROVIDER_COLS} FROM providers WHERE account_id = $1 AND cif = ANY($2) LIMIT 1"
        );
        sqlx::query(&sql)
            .bind(account)
            .bind(variants)
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(provider_from_row)
            .transpose()
    }

    async fn find_provider_by_name(
        &mut self,
        account: AccountId,
        name: &str,
    ) -> Result<Option<Provider>, LedgerError> {
        let sql = format!(
            "SELECT {PROVIDER_COLS} FROM providers \
             WHERE account_id = $1 AND lower(trim(name)) = lower(trim($2)) LIMIT 1"
        );
        sqlx::query(&sql)
            .bind(account)
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(provider_from_row)
            .transpose()
    }

    async fn find_provider_by_phone(
        &mut self,
        account: AccountId,
        digits: &str,
    ) -> Result<Option<Provider>, LedgerError> {
        let sql = format!(
            "SELECT {PROVIDER_COLS} FROM providers \
             WHERE account_id = $1 AND regexp_replace(phone, '\\D', '', 'g') LIKE '%' || $2 \
             LIMIT 1"
        );
        sqlx::query(&sql)
            .bind(account)
            .bind(digits)
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(provider_from_row)
            .transpose()
    }

    async fn list_providers(&mut self, account: AccountId) -> Result<Vec<Provider>, LedgerError> {
        let sql = format!("SELECT {PROVIDER_COLS} FROM providers WHERE account_id = $1 ORDER BY name");
        sqlx::query(&sql)
            .bind(account)
            .fetch_all(&mut *self.tx)
            .await?
            .iter()
            .map(provider_from_row)
            .collect()
    }

    async fn insert_provider(&mut self, p: &Provider) -> Result<bool, LedgerError> {
        let done = sqlx::query(
            r#"
            INSERT INTO providers (id, account_id, cif, name, email, phone, address, provider_type)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (account_id, cif) DO NOTHING
            "#,
        )
        .bind(p.id)
        .bind(p.account)
        .bind(&p.cif)
        .bind(&p.name)
        .bind(&p.email)
        .bind(&p.phone)
        .bind(&p.address)
        .bind(p.provider_type.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn update_provider(&mut self, p: &Provider) -> Result<(), LedgerError> {
        let done = sqlx::query(
            r#"
            UPDATE providers
            SET name = $2, email = $3, phone = $4, address = $5, provider_type = $6
            WHERE id = $1
            "#,
        )
        .bind(p.id)
        .bind(&p.name)
        .bind(&p.email)
        .bind(&p.phone)
        .bind(&p.address)
        .bind(p.provider_type.as_str())
        .execute(&mut *self.tx)
        .await?;
        if done.rows_affected() == 0 {
            return Err(LedgerError::NotFound {
                entity: "provider",
                id: p.id.to_string(),
            });
        }
        Ok(())
    }

    async fn find_material_by_code(
        &mut self,
        account: AccountId,
        code: &str,
    ) -> Result<Option<Material>, LedgerError> {
        let sql = format!("SELECT {MATERIAL_COLS} FROM materials WHERE account_id = $1 AND code = $2");
        sqlx::query(&sql)
            .bind(account)
            .bind(code)
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(material_from_row)
            .transpose()
    }

    async fn find_material_by_reference(
        &mut self,
        account: AccountId,
        reference: &str,
    ) -> Result<Option<Material>, LedgerError> {
        let sql = format!(
            "SELECT {MATERIAL_COLS} FROM materials \
             WHERE account_id = $1 AND reference_code = $2 LIMIT 1"
        );
        sqlx::query(&sql)
            .bind(account)
            .bind(reference)
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(material_from_row)
            .transpose()
    }

    async fn find_material_by_name(
        &mut self,
        account: AccountId,
        name: &str,
    ) -> Result<Option<Material>, LedgerError> {
        let sql = format!(
            "SELECT {MATERIAL_COLS} FROM materials \
             WHERE account_id = $1 AND lower(trim(name)) = lower(trim($2)) LIMIT 1"
        );
        sqlx::query(&sql)
            .bind(account)
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await?
            .as_ref()
            .map(material_from_row)
            .transpose()
    }

    async fn list_materials_with_long_codes(
        &mut self,
        account: AccountId,
        min_len: usize,
    ) -> Result<Vec<Material>, LedgerError> {
        let sql = format!(
            "SELECT {MATERIAL_COLS} FROM materials WHERE account_id = $1 AND char_length(code) >= $2"
        );
        sqlx::query(&sql)
            .bind(account)
            .bind(i32::try_from(min_len).unwrap_or(i32::MAX))
            .fetch_all(&mut *self.tx)
            .await?
            .iter()
            .map(material_from_row)
            .collect()
    }

    async fn insert_material(&mut self, m: &Material) -> Result<bool, LedgerError> {
        let done = sqlx::query(
            r#"
            INSERT INTO materials (id, account_id, code, reference_code, name, category)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (account_id, code) DO NOTHING
            "#,
        )
        .bind(m.id)
        .bind(m.account)
        .bind(&m.code)
        .bind(&m.reference_code)
        .bind(&m.name)
        .bind(m.category.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn update_material(&mut self, m: &Material) -> Result<(), LedgerError> {
        let done = sqlx::query(
            "UPDATE materials SET code = $2, reference_code = $3, name = $4, category = $5 WHERE id = $1",
        )
        .bind(m.id)
        .bind(&m.code)
        .bind(&m.reference_code)
        .bind(&m.name)
        .bind(m.category.as_str())
        .execute(&mut *self.tx)
        .await?;
        if done.rows_affected() == 0 {
            return Err(LedgerError::NotFound {
                entity: "material",
                id: m.id.to_string(),
            });
        }
        Ok(())
    }

    async fn find_invoice(
        &mut self,
        provider_id: Uuid,
        invoice_code: &str,
    ) -> Result<Option<Invoice>, LedgerError> {
        sqlx::query(
            r#"
            SELECT id, account_id, invoice_code, provider_id, issue_date, total_amount,
                   status, document_key
            FROM invoices
            WHERE provider_id = $1 AND invoice_code = $2
            "#,
        )
        .bind(provider_id)
        .bind(invoice_code)
        .fetch_optional(&mut *self.tx)
        .await?
        .as_ref()
        .map(invoice_from_row)
        .transpose()
    }

    async fn insert_invoice(&mut self, inv: &Invoice) -> Result<bool, LedgerError> {
        let status = match inv.status {
            InvoiceStatus::Processed => "PROCESSED",
            InvoiceStatus::Reviewed => "REVIEWED",
        };
        let done = sqlx::query(
            r#"
            INSERT INTO invoices
                (id, account_id, invoice_code, provider_id, issue_date, total_amount, status, document_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (invoice_code, provider_id) DO NOTHING
            "#,
        )
        .bind(inv.id)
        .bind(inv.account)
        .bind(&inv.invoice_code)
        .bind(inv.provider_id)
        .bind(inv.issue_date)
        .bind(inv.total_amount)
        .bind(status)
        .bind(&inv.document_key)
        .execute(&mut *self.tx)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn insert_item(&mut self, it: &InvoiceItem) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO invoice_items
                (id, invoice_id, material_id, quantity, unit_price, total_price, item_date,
                 work_order, description, line_number, is_material)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(it.id)
        .bind(it.invoice_id)
        .bind(it.material_id)
        .bind(it.quantity)
        .bind(it.unit_price)
        .bind(it.total_price)
        .bind(it.item_date)
        .bind(&it.work_order)
        .bind(&it.description)
        .bind(it.line_number.map(int))
        .bind(it.is_material)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn previous_price(
        &mut self,
        material_id: Uuid,
        provider_id: Uuid,
        before: NaiveDate,
    ) -> Result<Option<Decimal>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT ii.unit_price
            FROM invoice_items ii
            INNER JOIN invoices i ON i.id = ii.invoice_id
            WHERE ii.material_id = $1
              AND i.provider_id = $2
              AND ii.is_material
              AND ii.item_date < $3
            ORDER BY ii.item_date DESC, ii.seq DESC
            LIMIT 1
            "#,
        )
        .bind(material_id)
        .bind(provider_id)
        .bind(before)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(|r| r.try_get("unit_price")).transpose().map_err(Into::into)
    }

    async fn insert_price_alert(&mut self, a: &PriceAlert) -> Result<bool, LedgerError> {
        let status = match a.status {
            AlertStatus::Pending => "PENDING",
            AlertStatus::Approved => "APPROVED",
            AlertStatus::Rejected => "REJECTED",
        };
        let done = sqlx::query(
            r#"
            INSERT INTO price_alerts
                (id, material_id, provider_id, invoice_id, old_price, new_price, percentage,
                 effective_date, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (material_id, provider_id, effective_date) DO NOTHING
            "#,
        )
        .bind(a.id)
        .bind(a.material_id)
        .bind(a.provider_id)
        .bind(a.invoice_id)
        .bind(a.old_price)
        .bind(a.new_price)
        .bind(a.percentage)
        .bind(a.effective_date)
        .bind(status)
        .execute(&mut *self.tx)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn material_provider(
        &mut self,
        material_id: Uuid,
        provider_id: Uuid,
    ) -> Result<Option<MaterialProvider>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT material_id, provider_id, last_price, last_price_date
            FROM material_providers
            WHERE material_id = $1 AND provider_id = $2
            "#,
        )
        .bind(material_id)
        .bind(provider_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(MaterialProvider {
            material_id: row.try_get("material_id")?,
            provider_id: row.try_get("provider_id")?,
            last_price: row.try_get("last_price")?,
            last_price_date: row.try_get("last_price_date")?,
        }))
    }

    async fn upsert_material_provider(
        &mut self,
        mp: &MaterialProvider,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO material_providers (material_id, provider_id, last_price, last_price_date)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (material_id, provider_id)
            DO UPDATE SET last_price = EXCLUDED.last_price,
                          last_price_date = EXCLUDED.last_price_date
            "#,
        )
        .bind(mp.material_id)
        .bind(mp.provider_id)
        .bind(mp.last_price)
        .bind(mp.last_price_date)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn find_account_by_cif(
        &mut self,
        variants: &[String],
    ) -> Result<Option<AccountId>, LedgerError> {
        let row = sqlx::query("SELECT id FROM accounts WHERE cif = ANY($1) LIMIT 1")
            .bind(variants)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(|r| r.try_get("id")).transpose().map_err(Into::into)
    }

    async fn insert_unassigned(&mut self, u: &UnassignedInvoice) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO unassigned_invoices
                (id, document_key, invoice_code, provider_cif, client_cif, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(u.id)
        .bind(&u.document_key)
        .bind(&u.invoice_code)
        .bind(&u.provider_cif)
        .bind(&u.client_cif)
        .bind(&u.payload)
        .bind(u.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx.commit().await.map_err(Into::into)
    }

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx.rollback().await.map_err(Into::into)
    }
}

// ── Store-level operations ───────────────────────────────────────────────

#[async_trait]
impl Ledger for PgLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn insert_batch(&self, job: &BatchJob) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO batch_jobs
                (id, user_id, account_id, status, purpose, total_files, processed_files,
                 successful_files, failed_files, blocked_files, errors, created_at,
                 started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&job.id)
        .bind(&job.user_id)
        .bind(job.account)
        .bind(job.status.as_str())
        .bind(job.purpose.as_str())
        .bind(int(job.total_files))
        .bind(int(job.processed_files))
        .bind(int(job.successful_files))
        .bind(int(job.failed_files))
        .bind(int(job.blocked_files))
        .bind(Json(&job.errors))
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<Option<BatchJob>, LedgerError> {
        let sql = format!("SELECT {BATCH_COLS} FROM batch_jobs WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(batch_from_row)
            .transpose()
    }

    async fn set_batch_status(&self, id: &str, status: BatchStatus) -> Result<bool, LedgerError> {
        let done = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET status = $2,
                started_at = CASE WHEN $2 = 'PROCESSING' AND started_at IS NULL
                                  THEN now() ELSE started_at END
            WHERE id = $1
              AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED', 'EXPIRED')
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn mark_completed_at_if_unset(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let done = sqlx::query(
            "UPDATE batch_jobs SET completed_at = $2 WHERE id = $1 AND completed_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn force_batch_status(&self, id: &str, status: BatchStatus) -> Result<(), LedgerError> {
        let done = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET status = $2,
                completed_at = CASE WHEN $3 AND completed_at IS NULL
                                    THEN now() ELSE completed_at END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(status.is_terminal())
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(LedgerError::NotFound {
                entity: "batch",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn apply_counters(
        &self,
        id: &str,
        delta: CounterDelta,
        errors: &[BatchErrorEntry],
    ) -> Result<(), LedgerError> {
        let done = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET processed_files  = processed_files + $2,
                successful_files = successful_files + $3,
                failed_files     = failed_files + $4,
                blocked_files    = blocked_files + $5,
                errors           = errors || $6
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(int(delta.processed))
        .bind(int(delta.successful))
        .bind(int(delta.failed))
        .bind(int(delta.blocked))
        .bind(Json(errors))
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(LedgerError::NotFound {
                entity: "batch",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_active_batches(&self) -> Result<Vec<BatchJob>, LedgerError> {
        let sql = format!(
            "SELECT {BATCH_COLS} FROM batch_jobs \
             WHERE status IN ('PENDING', 'PROCESSING') ORDER BY created_at"
        );
        sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(batch_from_row)
            .collect()
    }

    async fn list_batches_for_user(&self, user_id: &str) -> Result<Vec<BatchJob>, LedgerError> {
        let sql = format!(
            "SELECT {BATCH_COLS} FROM batch_jobs WHERE user_id = $1 ORDER BY created_at DESC"
        );
        sqlx::query(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(batch_from_row)
            .collect()
    }

    async fn insert_items(&self, items: &[BatchItem]) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                r#"
                INSERT INTO batch_items
                    (id, batch_id, document_key, file_name, processed, extracted_payload, error_message)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (batch_id, document_key) DO NOTHING
                "#,
            )
            .bind(item.id)
            .bind(&item.batch_id)
            .bind(&item.document_key)
            .bind(&item.file_name)
            .bind(item.processed)
            .bind(&item.extracted_payload)
            .bind(&item.error_message)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_items(&self, batch_id: &str) -> Result<Vec<BatchItem>, LedgerError> {
        sqlx::query(
            r#"
            SELECT id, batch_id, document_key, file_name, processed, extracted_payload, error_message
            FROM batch_items
            WHERE batch_id = $1
            ORDER BY seq
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(item_from_row)
        .collect()
    }

    async fn set_item_payload(
        &self,
        batch_id: &str,
        document_key: &str,
        payload: Option<&str>,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "UPDATE batch_items SET extracted_payload = $3 WHERE batch_id = $1 AND document_key = $2",
        )
        .bind(batch_id)
        .bind(document_key)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_item_outcome(
        &self,
        batch_id: &str,
        document_key: &str,
        delta: CounterDelta,
        error: Option<&BatchErrorEntry>,
    ) -> Result<bool, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let message = error
            .filter(|e| e.is_actual_error())
            .map(|e| e.message.clone());
        let done = sqlx::query(
            r#"
            UPDATE batch_items
            SET processed = TRUE, extracted_payload = NULL, error_message = $3
            WHERE batch_id = $1 AND document_key = $2 AND NOT processed
            "#,
        )
        .bind(batch_id)
        .bind(document_key)
        .bind(message)
        .execute(&mut *tx)
        .await?;
        if done.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        let errors: Vec<&BatchErrorEntry> = error.into_iter().collect();
        sqlx::query(
            r#"
            UPDATE batch_jobs
            SET processed_files  = processed_files + $2,
                successful_files = successful_files + $3,
                failed_files     = failed_files + $4,
                blocked_files    = blocked_files + $5,
                errors           = errors || $6
            WHERE id = $1
            "#,
        )
        .bind(batch_id)
        .bind(int(delta.processed))
        .bind(int(delta.successful))
        .bind(int(delta.failed))
        .bind(int(delta.blocked))
        .bind(Json(errors))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn insert_links(&self, links: &[BatchLink]) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        for link in links {
            sqlx::query(
                r#"
                INSERT INTO batch_links (parent_batch_id, child_batch_id, document_key)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&link.parent_batch_id)
            .bind(&link.child_batch_id)
            .bind(&link.document_key)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn links_for_parent(&self, parent_id: &str) -> Result<Vec<BatchLink>, LedgerError> {
        let rows = sqlx::query(
            "SELECT parent_batch_id, child_batch_id, document_key FROM batch_links WHERE parent_batch_id = $1",
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(BatchLink {
                    parent_batch_id: r.try_get("parent_batch_id")?,
                    child_batch_id: r.try_get("child_batch_id")?,
                    document_key: r.try_get("document_key")?,
                })
            })
            .collect()
    }

    async fn parent_of(&self, child_id: &str) -> Result<Option<String>, LedgerError> {
        let row = sqlx::query(
            "SELECT parent_batch_id FROM batch_links WHERE child_batch_id = $1 LIMIT 1",
        )
        .bind(child_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get("parent_batch_id"))
            .transpose()
            .map_err(Into::into)
    }

    async fn insert_pending(&self, pending: &[PendingInvoice]) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        for p in pending {
            sqlx::query(
                r#"
                INSERT INTO pending_invoices (document_key, batch_id, user_id, file_name, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (document_key) DO UPDATE SET batch_id = EXCLUDED.batch_id
                "#,
            )
            .bind(&p.document_key)
            .bind(&p.batch_id)
            .bind(&p.user_id)
            .bind(&p.file_name)
            .bind(p.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn clear_pending(&self, document_key: &str) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM pending_invoices WHERE document_key = $1")
            .bind(document_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_pending_for_batch(&self, batch_id: &str) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM pending_invoices WHERE batch_id = $1")
            .bind(batch_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_pending(&self, user_id: &str) -> Result<Vec<PendingInvoice>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT document_key, batch_id, user_id, file_name, created_at
            FROM pending_invoices
            WHERE user_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(PendingInvoice {
                    document_key: r.try_get("document_key")?,
                    batch_id: r.try_get("batch_id")?,
                    user_id: r.try_get("user_id")?,
                    file_name: r.try_get("file_name")?,
                    created_at: r.try_get("created_at")?,
                })
            })
            .collect()
    }
}
