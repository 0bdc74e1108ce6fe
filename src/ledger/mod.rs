//! Persistence seam.
//!
//! [`Ledger`] covers store-level bookkeeping (batches, batch items,
//! parent/child links, pending placeholders). [`LedgerTx`] is one atomic
//! transaction over the entity tables, opened per document by the ingestion
//! engine.
//!
//! Uniqueness conflicts are never errors: every `insert_*` returning `bool`
//! yields `Ok(false)` when the row already exists, leaving the transaction
//! usable.
//!
//! | Backend | Availability |
//! |---------|--------------|
//! | [`MemoryLedger`] | always |
//! | `PgLedger` | `postgres` feature |

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryLedger;
#[cfg(feature = "postgres")]
pub use postgres::PgLedger;

use crate::error::{BatchErrorEntry, LedgerError};
use crate::model::{
    AccountId, BatchItem, BatchJob, BatchLink, BatchStatus, CounterDelta, Invoice, InvoiceItem,
    Material, MaterialProvider, PendingInvoice, PriceAlert, Provider, UnassignedInvoice,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// One atomic unit of entity writes.
///
/// Dropping a transaction without calling [`LedgerTx::commit`] discards it.
#[async_trait]
pub trait LedgerTx: Send {
    // ── Providers ────────────────────────────────────────────────────────
    /// Provider whose stored CIF equals any of `variants`.
    async fn find_provider_by_cif(
        &mut self,
        account: AccountId,
        variants: &[String],
    ) -> Result<Option<Provider>, LedgerError>;

    /// Case-insensitive exact name match.
    async fn find_provider_by_name(
        &mut self,
        account: AccountId,
        name: &str,
    ) -> Result<Option<Provider>, LedgerError>;

    /// Provider whose phone ends with the given nine digits.
    async fn find_provider_by_phone(
        &mut self,
        account: AccountId,
        digits: &str,
    ) -> Result<Option<Provider>, LedgerError>;

    /// Every provider of the account, ordered by name.
    async fn list_providers(&mut self, account: AccountId) -> Result<Vec<Provider>, LedgerError>;

    /// `Ok(false)` when a provider with the same CIF already exists.
    async fn insert_provider(&mut self, provider: &Provider) -> Result<bool, LedgerError>;

    async fn update_provider(&mut self, provider: &Provider) -> Result<(), LedgerError>;

    // ── Materials ────────────────────────────────────────────────────────
    async fn find_material_by_code(
        &mut self,
        account: AccountId,
        code: &str,
    ) -> Result<Option<Material>, LedgerError>;

    async fn find_material_by_reference(
        &mut self,
        account: AccountId,
        reference: &str,
    ) -> Result<Option<Material>, LedgerError>;

    /// Case-insensitive exact name match.
    async fn find_material_by_name(
        &mut self,
        account: AccountId,
        name: &str,
    ) -> Result<Option<Material>, LedgerError>;

    /// Materials whose code is at least `min_len` characters long.
    async fn list_materials_with_long_codes(
        &mut self,
        account: AccountId,
        min_len: usize,
    ) -> Result<Vec<Material>, LedgerError>;

    /// `Ok(false)` when a material with the same code already exists.
    async fn insert_material(&mut self, material: &Material) -> Result<bool, LedgerError>;

    async fn update_material(&mut self, material: &Material) -> Result<(), LedgerError>;

    // ── Invoices ─────────────────────────────────────────────────────────
    async fn find_invoice(
        &mut self,
        provider_id: Uuid,
        invoice_code: &str,
    ) -> Result<Option<Invoice>, LedgerError>;

    /// `Ok(false)` when `(invoice_code, provider_id)` already exists.
    async fn insert_invoice(&mut self, invoice: &Invoice) -> Result<bool, LedgerError>;

    async fn insert_item(&mut self, item: &InvoiceItem) -> Result<(), LedgerError>;

    /// Unit price of the latest material line for the pair dated strictly
    /// before `before`.
    async fn previous_price(
        &mut self,
        material_id: Uuid,
        provider_id: Uuid,
        before: NaiveDate,
    ) -> Result<Option<Decimal>, LedgerError>;

    /// `Ok(false)` when an alert for `(material, provider, effective_date)`
    /// already exists.
    async fn insert_price_alert(&mut self, alert: &PriceAlert) -> Result<bool, LedgerError>;

    async fn material_provider(
        &mut self,
        material_id: Uuid,
        provider_id: Uuid,
    ) -> Result<Option<MaterialProvider>, LedgerError>;

    async fn upsert_material_provider(&mut self, mp: &MaterialProvider)
        -> Result<(), LedgerError>;

    // ── Accounts ─────────────────────────────────────────────────────────
    /// Account registered under any of the CIF `variants`.
    async fn find_account_by_cif(
        &mut self,
        variants: &[String],
    ) -> Result<Option<AccountId>, LedgerError>;

    async fn insert_unassigned(&mut self, invoice: &UnassignedInvoice) -> Result<(), LedgerError>;

    // ── Completion ───────────────────────────────────────────────────────
    async fn commit(self: Box<Self>) -> Result<(), LedgerError>;

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError>;
}

/// Store-level operations and the transaction factory.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError>;

    // ── Batches ──────────────────────────────────────────────────────────
    async fn insert_batch(&self, job: &BatchJob) -> Result<(), LedgerError>;

    async fn get_batch(&self, id: &str) -> Result<Option<BatchJob>, LedgerError>;

    /// Move a non-terminal batch to `status`. Terminal batches are left alone
    /// and `Ok(false)` is returned.
    async fn set_batch_status(&self, id: &str, status: BatchStatus) -> Result<bool, LedgerError>;

    /// Set `completed_at` only if it is still unset. Returns whether this
    /// call set it; exactly one concurrent caller wins.
    async fn mark_completed_at_if_unset(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    /// Overwrite the status of any batch, terminal or not. Used by the
    /// parent rollup and by chunk submission failures.
    async fn force_batch_status(&self, id: &str, status: BatchStatus) -> Result<(), LedgerError>;

    /// Add counters and append error entries to a batch.
    async fn apply_counters(
        &self,
        id: &str,
        delta: CounterDelta,
        errors: &[BatchErrorEntry],
    ) -> Result<(), LedgerError>;

    /// Every non-terminal batch, oldest first.
    async fn list_active_batches(&self) -> Result<Vec<BatchJob>, LedgerError>;

    /// Every batch of a user, newest first.
    async fn list_batches_for_user(&self, user_id: &str) -> Result<Vec<BatchJob>, LedgerError>;

    // ── Items ────────────────────────────────────────────────────────────
    async fn insert_items(&self, items: &[BatchItem]) -> Result<(), LedgerError>;

    async fn list_items(&self, batch_id: &str) -> Result<Vec<BatchItem>, LedgerError>;

    async fn set_item_payload(
        &self,
        batch_id: &str,
        document_key: &str,
        payload: Option<&str>,
    ) -> Result<(), LedgerError>;

    /// Mark an item processed, clear its payload, and apply `delta` plus the
    /// optional error entry to the batch, all at once. `Ok(false)` (and no
    /// counter change) when the item was already processed or is unknown.
    async fn record_item_outcome(
        &self,
        batch_id: &str,
        document_key: &str,
        delta: CounterDelta,
        error: Option<&BatchErrorEntry>,
    ) -> Result<bool, LedgerError>;

    // ── Parent/child links ───────────────────────────────────────────────
    async fn insert_links(&self, links: &[BatchLink]) -> Result<(), LedgerError>;

    async fn links_for_parent(&self, parent_id: &str) -> Result<Vec<BatchLink>, LedgerError>;

    async fn parent_of(&self, child_id: &str) -> Result<Option<String>, LedgerError>;

    // ── Pending placeholders ─────────────────────────────────────────────
    async fn insert_pending(&self, pending: &[PendingInvoice]) -> Result<(), LedgerError>;

    async fn clear_pending(&self, document_key: &str) -> Result<(), LedgerError>;

    async fn clear_pending_for_batch(&self, batch_id: &str) -> Result<(), LedgerError>;

    async fn list_pending(&self, user_id: &str) -> Result<Vec<PendingInvoice>, LedgerError>;

    /// Fail every unprocessed item of a batch with the same error.
    /// Returns the number of items failed.
    async fn fail_unprocessed_items(
        &self,
        batch_id: &str,
        error: &BatchErrorEntry,
    ) -> Result<u32, LedgerError> {
        let mut failed = 0;
        for item in self.list_items(batch_id).await? {
            if item.processed {
                continue;
            }
            let entry = error.clone().with_file_name(item.file_name.clone());
            if self
                .record_item_outcome(batch_id, &item.document_key, CounterDelta::failure(), Some(&entry))
                .await?
            {
                failed += 1;
            }
        }
        Ok(failed)
    }
}
