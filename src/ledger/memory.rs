//! In-process ledger.
//!
//! Entity tables sit behind one async mutex. A transaction takes the lock
//! for its whole lifetime and works on a copy of the tables; commit swaps
//! the copy in, drop or rollback throws it away. Transactions are therefore
//! serialised, which matches the one-writer ingestion model.
//!
//! Batch bookkeeping uses a separate synchronous mutex that is never held
//! across an await point.

use super::{Ledger, LedgerTx};
use crate::error::{BatchErrorEntry, LedgerError};
use crate::model::{
    AccountId, BatchItem, BatchJob, BatchLink, BatchStatus, CounterDelta, Invoice, InvoiceItem,
    Material, MaterialProvider, PendingInvoice, PriceAlert, Provider, UnassignedInvoice,
};
use crate::resolver::normalize::canonical_cif;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct Entities {
    accounts: HashMap<String, AccountId>,
    providers: Vec<Provider>,
    materials: Vec<Material>,
    invoices: Vec<Invoice>,
    items: Vec<InvoiceItem>,
    material_providers: HashMap<(Uuid, Uuid), MaterialProvider>,
    alerts: Vec<PriceAlert>,
    unassigned: Vec<UnassignedInvoice>,
}

#[derive(Debug, Default)]
struct BatchState {
    batches: Vec<BatchJob>,
    items: Vec<BatchItem>,
    links: Vec<BatchLink>,
    pending: Vec<PendingInvoice>,
}

/// Ledger kept entirely in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryLedger {
    entities: Arc<AsyncMutex<Entities>>,
    batches: Arc<Mutex<BatchState>>,
    fail_commits: Arc<AtomicU32>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account under a tax id, for account-scope resolution.
    pub async fn register_account(&self, cif: &str, account: AccountId) {
        self.entities
            .lock()
            .await
            .accounts
            .insert(canonical_cif(cif), account);
    }

    /// Make the next `n` commits fail with [`LedgerError::Unavailable`].
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    pub async fn providers(&self) -> Vec<Provider> {
        self.entities.lock().await.providers.clone()
    }

    pub async fn materials(&self) -> Vec<Material> {
        self.entities.lock().await.materials.clone()
    }

    pub async fn invoices(&self) -> Vec<Invoice> {
        self.entities.lock().await.invoices.clone()
    }

    pub async fn invoice_items(&self) -> Vec<InvoiceItem> {
        self.entities.lock().await.items.clone()
    }

    pub async fn price_alerts(&self) -> Vec<PriceAlert> {
        self.entities.lock().await.alerts.clone()
    }

    pub async fn material_provider_cache(&self) -> Vec<MaterialProvider> {
        self.entities
            .lock()
            .await
            .material_providers
            .values()
            .cloned()
            .collect()
    }

    pub async fn unassigned_invoices(&self) -> Vec<UnassignedInvoice> {
        self.entities.lock().await.unassigned.clone()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, BatchState>, LedgerError> {
        self.batches
            .lock()
            .map_err(|_| LedgerError::Backend("batch state lock poisoned".into()))
    }
}

/// A transaction over a private copy of the entity tables.
pub struct MemoryTx {
    guard: OwnedMutexGuard<Entities>,
    work: Entities,
    fail_commits: Arc<AtomicU32>,
}

fn eq_ci(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn find_provider_by_cif(
        &mut self,
        account: AccountId,
        variants: &[String],
    ) -> Result<Option<Provider>, LedgerError> {
        Ok(self
            .work
            .providers
            .iter()
            .find(|p| p.account == account && variants.iter().any(|v| v == &p.cif))
            .cloned())
    }

    async fn find_provider_by_name(
        &mut self,
        account: AccountId,
        name: &str,
    ) -> Result<Option<Provider>, LedgerError> {
        Ok(self
            .work
            .providers
            .iter()
            .find(|p| p.account == account && eq_ci(&p.name, name))
            .cloned())
    }

    async fn find_provider_by_phone(
        &mut self,
        account: AccountId,
        digits: &str,
    ) -> Result<Option<Provider>, LedgerError> {
        Ok(self
            .work
            .providers
            .iter()
            .find(|p| {
                p.account == account
                    && p.phone.as_deref().is_some_and(|ph| {
                        let d: String = ph.chars().filter(char::is_ascii_digit).collect();
                        d.ends_with(digits)
                    })
            })
            .cloned())
    }

    async fn list_providers(&mut self, account: AccountId) -> Result<Vec<Provider>, LedgerError> {
        let mut out: Vec<Provider> = self
            .work
            .providers
            .iter()
            .filter(|p| p.account == account)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn insert_provider(&mut self, provider: &Provider) -> Result<bool, LedgerError> {
        if self
            .work
            .providers
            .iter()
            .any(|p| p.account == provider.account && p.cif == provider.cif)
        {
            return Ok(false);
        }
        self.work.providers.push(provider.clone());
        Ok(true)
    }

    async fn update_provider(&mut self, provider: &Provider) -> Result<(), LedgerError> {
        let slot = self
            .work
            .providers
            .iter_mut()
            .find(|p| p.id == provider.id)
            .ok_or_else(|| LedgerError::NotFound {
                entity: "provider",
                id: provider.id.to_string(),
            })?;
        *slot = provider.clone();
        Ok(())
    }

    async fn find_material_by_code(
        &mut self,
        account: AccountId,
        code: &str,
    ) -> Result<Option<Material>, LedgerError> {
        Ok(self
            .work
            .materials
            .iter()
            .find(|m| m.account == account && m.code == code)
            .cloned())
    }

    async fn find_material_by_reference(
        &mut self,
        account: AccountId,
        reference: &str,
    ) -> Result<Option<Material>, LedgerError> {
        Ok(self
            .work
            .materials
            .iter()
            .find(|m| m.account == account && m.reference_code.as_deref() == Some(reference))
            .cloned())
    }

    async fn find_material_by_name(
        &mut self,
        account: AccountId,
        name: &str,
    ) -> Result<Option<Material>, LedgerError> {
        Ok(self
            .work
            .materials
            .iter()
            .find(|m| m.account == account && eq_ci(&m.name, name))
            .cloned())
    }

    async fn list_materials_with_long_codes(
        &mut self,
        account: AccountId,
        min_len: usize,
    ) -> Result<Vec<Material>, LedgerError> {
        Ok(self
            .work
            .materials
            .iter()
            .filter(|m| m.account == account && m.code.chars().count() >= min_len)
            .cloned()
            .collect())
    }

    async fn insert_material(&mut self, material: &Material) -> Result<bool, LedgerError> {
        if self
            .work
            .materials
            .iter()
            .any(|m| m.account == material.account && m.code == material.code)
        {
            return Ok(false);
        }
        self.work.materials.push(material.clone());
        Ok(true)
    }

    async fn update_material(&mut self, material: &Material) -> Result<(), LedgerError> {
        let slot = self
            .work
            .materials
            .iter_mut()
            .find(|m| m.id == material.id)
            .ok_or_else(|| LedgerError::NotFound {
                entity: "material",
                id: material.id.to_string(),
            })?;
        *slot = material.clone();
        Ok(())
    }

    async fn find_invoice(
        &mut self,
        provider_id: Uuid,
        invoice_code: &str,
    ) -> Result<Option<Invoice>, LedgerError> {
        Ok(self
            .work
            .invoices
            .iter()
            .find(|i| i.provider_id == provider_id && i.invoice_code == invoice_code)
            .cloned())
    }

    async fn insert_invoice(&mut self, invoice: &Invoice) -> Result<bool, LedgerError> {
        if self.work.invoices.iter().any(|i| {
            i.provider_id == invoice.provider_id && i.invoice_code == invoice.invoice_code
        }) {
            return Ok(false);
        }
        self.work.invoices.push(invoice.clone());
        Ok(true)
    }

    async fn insert_item(&mut self, item: &InvoiceItem) -> Result<(), LedgerError> {
        self.work.items.push(item.clone());
        Ok(())
    }

    async fn previous_price(
        &mut self,
        material_id: Uuid,
        provider_id: Uuid,
        before: NaiveDate,
    ) -> Result<Option<Decimal>, LedgerError> {
        let invoices = &self.work.invoices;
        // Later insertion wins among lines sharing the latest date.
        Ok(self
            .work
            .items
            .iter()
            .enumerate()
            .filter(|(_, it)| {
                it.is_material
                    && it.material_id == material_id
                    && it.item_date < before
                    && invoices
                        .iter()
                        .any(|inv| inv.id == it.invoice_id && inv.provider_id == provider_id)
            })
            .max_by_key(|(idx, it)| (it.item_date, *idx))
            .map(|(_, it)| it.unit_price))
    }

    async fn insert_price_alert(&mut self, alert: &PriceAlert) -> Result<bool, LedgerError> {
        if self.work.alerts.iter().any(|a| {
            a.material_id == alert.material_id
                && a.provider_id == alert.provider_id
                && a.effective_date == alert.effective_date
        }) {
            return Ok(false);
        }
        self.work.alerts.push(alert.clone());
        Ok(true)
    }

    async fn material_provider(
        &mut self,
        material_id: Uuid,
        provider_id: Uuid,
    ) -> Result<Option<MaterialProvider>, LedgerError> {
        Ok(self
            .work
            .material_providers
            .get(&(material_id, provider_id))
            .cloned())
    }

    async fn upsert_material_provider(
        &mut self,
        mp: &MaterialProvider,
    ) -> Result<(), LedgerError> {
        self.work
            .material_providers
            .insert((mp.material_id, mp.provider_id), mp.clone());
        Ok(())
    }

    async fn find_account_by_cif(
        &mut self,
        variants: &[String],
    ) -> Result<Option<AccountId>, LedgerError> {
        Ok(variants
            .iter()
            .find_map(|v| self.work.accounts.get(v).copied()))
    }

    async fn insert_unassigned(&mut self, invoice: &UnassignedInvoice) -> Result<(), LedgerError> {
        self.work.unassigned.push(invoice.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        let this = *self;
        let remaining = this.fail_commits.load(Ordering::SeqCst);
        if remaining > 0 {
            this.fail_commits.store(remaining - 1, Ordering::SeqCst);
            return Err(LedgerError::Unavailable("simulated commit failure".into()));
        }
        let mut guard = this.guard;
        *guard = this.work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
        Ok(())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError> {
        let guard = Arc::clone(&self.entities).lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            work,
            fail_commits: Arc::clone(&self.fail_commits),
        }))
    }

    async fn insert_batch(&self, job: &BatchJob) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        if state.batches.iter().any(|b| b.id == job.id) {
            return Err(LedgerError::Backend(format!("batch '{}' already exists", job.id)));
        }
        state.batches.push(job.clone());
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<Option<BatchJob>, LedgerError> {
        Ok(self.state()?.batches.iter().find(|b| b.id == id).cloned())
    }

    async fn set_batch_status(&self, id: &str, status: BatchStatus) -> Result<bool, LedgerError> {
        let mut state = self.state()?;
        let job = find_batch(&mut state, id)?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        if status == BatchStatus::Processing && job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        job.status = status;
        Ok(true)
    }

    async fn mark_completed_at_if_unset(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let mut state = self.state()?;
        let job = find_batch(&mut state, id)?;
        if job.completed_at.is_some() {
            return Ok(false);
        }
        job.completed_at = Some(at);
        Ok(true)
    }

    async fn force_batch_status(&self, id: &str, status: BatchStatus) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        let job = find_batch(&mut state, id)?;
        job.status = status;
        if status.is_terminal() && job.completed_at.is_none() {
            job.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn apply_counters(
        &self,
        id: &str,
        delta: CounterDelta,
        errors: &[BatchErrorEntry],
    ) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        let job = find_batch(&mut state, id)?;
        add_counters(job, delta);
        job.errors.extend_from_slice(errors);
        Ok(())
    }

    async fn list_active_batches(&self) -> Result<Vec<BatchJob>, LedgerError> {
        let mut out: Vec<BatchJob> = self
            .state()?
            .batches
            .iter()
            .filter(|b| !b.status.is_terminal())
            .cloned()
            .collect();
        out.sort_by_key(|b| b.created_at);
        Ok(out)
    }

    async fn list_batches_for_user(&self, user_id: &str) -> Result<Vec<BatchJob>, LedgerError> {
        let mut out: Vec<BatchJob> = self
            .state()?
            .batches
            .iter()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn insert_items(&self, items: &[BatchItem]) -> Result<(), LedgerError> {
        self.state()?.items.extend_from_slice(items);
        Ok(())
    }

    async fn list_items(&self, batch_id: &str) -> Result<Vec<BatchItem>, LedgerError> {
        Ok(self
            .state()?
            .items
            .iter()
            .filter(|i| i.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn set_item_payload(
        &self,
        batch_id: &str,
        document_key: &str,
        payload: Option<&str>,
    ) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        if let Some(item) = state
            .items
            .iter_mut()
            .find(|i| i.batch_id == batch_id && i.document_key == document_key)
        {
            item.extracted_payload = payload.map(str::to_string);
        }
        Ok(())
    }

    async fn record_item_outcome(
        &self,
        batch_id: &str,
        document_key: &str,
        delta: CounterDelta,
        error: Option<&BatchErrorEntry>,
    ) -> Result<bool, LedgerError> {
        let mut state = self.state()?;
        let Some(item) = state
            .items
            .iter_mut()
            .find(|i| i.batch_id == batch_id && i.document_key == document_key)
        else {
            return Ok(false);
        };
        if item.processed {
            return Ok(false);
        }
        item.processed = true;
        item.extracted_payload = None;
        item.error_message = error
            .filter(|e| e.is_actual_error())
            .map(|e| e.message.clone());
        let job = find_batch(&mut state, batch_id)?;
        add_counters(job, delta);
        if let Some(e) = error {
            job.errors.push(e.clone());
        }
        Ok(true)
    }

    async fn insert_links(&self, links: &[BatchLink]) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        for link in links {
            if !state.links.contains(link) {
                state.links.push(link.clone());
            }
        }
        Ok(())
    }

    async fn links_for_parent(&self, parent_id: &str) -> Result<Vec<BatchLink>, LedgerError> {
        Ok(self
            .state()?
            .links
            .iter()
            .filter(|l| l.parent_batch_id == parent_id)
            .cloned()
            .collect())
    }

    async fn parent_of(&self, child_id: &str) -> Result<Option<String>, LedgerError> {
        Ok(self
            .state()?
            .links
            .iter()
            .find(|l| l.child_batch_id == child_id)
            .map(|l| l.parent_batch_id.clone()))
    }

    async fn insert_pending(&self, pending: &[PendingInvoice]) -> Result<(), LedgerError> {
        self.state()?.pending.extend_from_slice(pending);
        Ok(())
    }

    async fn clear_pending(&self, document_key: &str) -> Result<(), LedgerError> {
        self.state()?
            .pending
            .retain(|p| p.document_key != document_key);
        Ok(())
    }

    async fn clear_pending_for_batch(&self, batch_id: &str) -> Result<(), LedgerError> {
        self.state()?.pending.retain(|p| p.batch_id != batch_id);
        Ok(())
    }

    async fn list_pending(&self, user_id: &str) -> Result<Vec<PendingInvoice>, LedgerError> {
        Ok(self
            .state()?
            .pending
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }
}

fn find_batch<'a>(state: &'a mut BatchState, id: &str) -> Result<&'a mut BatchJob, LedgerError> {
    state
        .batches
        .iter_mut()
        .find(|b| b.id == id)
        .ok_or_else(|| LedgerError::NotFound {
            entity: "batch",
            id: id.to_string(),
        })
}

fn add_counters(job: &mut BatchJob, delta: CounterDelta) {
    job.processed_files += delta.processed;
    job.successful_files += delta.successful;
    job.failed_files += delta.failed;
    job.blocked_files += delta.blocked;
}
