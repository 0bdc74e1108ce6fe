//! Invoice ingestion: one extraction in, one atomic ledger transaction out.
//!
//! ```text
//! account scope ─▶ provider ─▶ duplicate check ─▶ invoice ─▶ per item:
//!                                                   validate → material → item row
//!                                                   → inter-invoice alert
//!                                                   → intra-invoice alert
//!                                                   → material/provider price cache
//! ```
//!
//! Store failures classified transient re-run the whole transaction under
//! the shared [`RetryPolicy`]; a blocked provider is returned at once with
//! nothing written.

use crate::codec::{encode_invoice, ExtractedInvoice};
use crate::config::PipelineConfig;
use crate::error::{DocumentError, LedgerError};
use crate::ledger::{Ledger, LedgerTx};
use crate::model::{
    AccountId, AlertStatus, Invoice, InvoiceItem, InvoiceStatus, MaterialProvider, PriceAlert,
    ProviderType, UnassignedInvoice,
};
use crate::resolver::normalize::cif_variants;
use crate::resolver::{EntityResolver, ResolutionCache, ResolveError};
use crate::retry::RetryPolicy;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Percentage recorded when the previous price was zero.
pub const ZERO_BASE_SENTINEL: i64 = 9999;

/// Result of ingesting one extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    /// A new invoice row was written.
    pub created: bool,
    /// `(invoice_code, provider)` already existed; nothing was written.
    pub duplicate: bool,
    /// No account could be determined; stored for manual reconciliation.
    pub unassigned: bool,
    pub invoice_id: Option<Uuid>,
    pub provider_id: Option<Uuid>,
    pub items_created: u32,
    pub items_skipped: u32,
    pub alerts_created: u32,
}

/// `(new - old) / old * 100`, rounded to two places, or the signed sentinel
/// when `old` is zero or the change does not fit a decimal.
pub fn percentage_change(old: Decimal, new: Decimal) -> Decimal {
    let sentinel = Decimal::from(ZERO_BASE_SENTINEL);
    let saturated = if new < old { -sentinel } else { sentinel };
    if old.is_zero() {
        return if new < Decimal::ZERO { -sentinel } else { sentinel };
    }
    new.checked_sub(old)
        .and_then(|delta| delta.checked_div(old))
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .map(crate::codec::round2)
        .unwrap_or(saturated)
}

enum AttemptError {
    Blocked(String),
    Ledger(LedgerError),
}

impl From<ResolveError> for AttemptError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::Blocked { provider } => AttemptError::Blocked(provider),
            ResolveError::Ledger(e) => AttemptError::Ledger(e),
        }
    }
}

impl From<LedgerError> for AttemptError {
    fn from(e: LedgerError) -> Self {
        AttemptError::Ledger(e)
    }
}

/// Writes extractions into the ledger.
#[derive(Debug, Clone)]
pub struct IngestionEngine {
    resolver: EntityResolver,
    retry: RetryPolicy,
}

impl IngestionEngine {
    pub fn new(resolver: EntityResolver, retry: RetryPolicy) -> Self {
        Self { resolver, retry }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            EntityResolver::from_config(config),
            RetryPolicy::from_config(config),
        )
    }

    pub fn resolver(&self) -> &EntityResolver {
        &self.resolver
    }

    /// Ingest one extraction atomically.
    ///
    /// `account` is the owning account when the caller knows it; otherwise
    /// it is looked up from the client CIF, then the provider CIF.
    pub async fn ingest(
        &self,
        ledger: &dyn Ledger,
        extracted: &ExtractedInvoice,
        document_key: &str,
        account: Option<AccountId>,
        cache: &mut ResolutionCache,
    ) -> Result<IngestOutcome, DocumentError> {
        if extracted.is_empty() {
            return Err(DocumentError::EmptyExtraction);
        }
        if self.resolver.is_blocked(&extracted.provider.name) {
            return Err(DocumentError::BlockedProvider {
                provider: extracted.provider.name.clone(),
            });
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            match self
                .ingest_once(ledger, extracted, document_key, account, cache)
                .await
            {
                Ok(outcome) => {
                    cache.commit();
                    return Ok(outcome);
                }
                Err(AttemptError::Blocked(provider)) => {
                    cache.discard();
                    return Err(DocumentError::BlockedProvider { provider });
                }
                Err(AttemptError::Ledger(err)) => {
                    cache.discard();
                    let delay = if attempt + 1 < max_attempts {
                        self.retry.delay_for(err.class(), attempt)
                    } else {
                        None
                    };
                    let Some(delay) = delay else {
                        warn!(
                            document = document_key,
                            attempts = attempt + 1,
                            error = %err,
                            "Ingestion failed"
                        );
                        return Err(DocumentError::Database {
                            attempts: attempt + 1,
                            detail: err.to_string(),
                        });
                    };
                    warn!(
                        document = document_key,
                        attempt = attempt + 1,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Ingestion transaction failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn ingest_once(
        &self,
        ledger: &dyn Ledger,
        extracted: &ExtractedInvoice,
        document_key: &str,
        account: Option<AccountId>,
        cache: &mut ResolutionCache,
    ) -> Result<IngestOutcome, AttemptError> {
        let mut tx = ledger.begin().await?;
        match self
            .write(tx.as_mut(), extracted, document_key, account, cache)
            .await
        {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    debug!(error = %rb, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn write(
        &self,
        tx: &mut dyn LedgerTx,
        extracted: &ExtractedInvoice,
        document_key: &str,
        account: Option<AccountId>,
        cache: &mut ResolutionCache,
    ) -> Result<IngestOutcome, AttemptError> {
        let account = match account {
            Some(a) => a,
            None => match resolve_account(tx, extracted).await? {
                Some(a) => a,
                None => return store_unassigned(tx, extracted, document_key).await,
            },
        };

        let provider = self
            .resolver
            .resolve_provider(tx, account, &extracted.provider, cache)
            .await?;

        let mut outcome = IngestOutcome {
            provider_id: Some(provider.id),
            ..IngestOutcome::default()
        };

        if let Some(existing) = tx.find_invoice(provider.id, &extracted.invoice_code).await? {
            info!(
                document = document_key,
                invoice = %extracted.invoice_code,
                provider = %provider.name,
                "Duplicate invoice, skipping"
            );
            outcome.duplicate = true;
            outcome.invoice_id = Some(existing.id);
            return Ok(outcome);
        }

        let invoice = Invoice {
            id: Uuid::new_v4(),
            account,
            invoice_code: extracted.invoice_code.clone(),
            provider_id: provider.id,
            issue_date: extracted.issue_date,
            total_amount: extracted.total_amount,
            status: InvoiceStatus::Processed,
            document_key: Some(document_key.to_string()),
        };
        if !tx.insert_invoice(&invoice).await? {
            // Created concurrently between the check and the insert.
            let existing = tx.find_invoice(provider.id, &extracted.invoice_code).await?;
            outcome.duplicate = true;
            outcome.invoice_id = existing.map(|i| i.id);
            return Ok(outcome);
        }
        outcome.created = true;
        outcome.invoice_id = Some(invoice.id);

        // Last price seen per material within this invoice.
        let mut seen_in_invoice: HashMap<Uuid, (NaiveDate, Decimal)> = HashMap::new();

        for (idx, item) in extracted.items.iter().enumerate() {
            let line = item.line_number.unwrap_or(idx as u32 + 1);
            let Some(name) = item
                .material_name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
            else {
                warn!(document = document_key, line, "Skipping item without a name");
                outcome.items_skipped += 1;
                continue;
            };
            let Some(quantity) = item.quantity else {
                warn!(document = document_key, line, "Skipping item without a quantity");
                outcome.items_skipped += 1;
                continue;
            };
            let price_known = item.unit_price.is_some();
            let unit_price = item.unit_price.unwrap_or_else(|| {
                warn!(document = document_key, line, "Missing unit price, defaulting to 0");
                Decimal::ZERO
            });
            let total_price = item.total_price.unwrap_or_else(|| {
                warn!(document = document_key, line, "Missing total price, defaulting to 0");
                Decimal::ZERO
            });
            let effective = item.item_date.unwrap_or(extracted.issue_date);

            let kind = if item.is_material {
                provider.provider_type
            } else {
                ProviderType::Services
            };
            let material = self
                .resolver
                .resolve_material(
                    tx,
                    account,
                    name,
                    item.material_code.as_deref(),
                    kind,
                    cache,
                )
                .await?;

            tx.insert_item(&InvoiceItem {
                id: Uuid::new_v4(),
                invoice_id: invoice.id,
                material_id: material.id,
                quantity,
                unit_price,
                total_price,
                item_date: effective,
                work_order: item.work_order.clone(),
                description: item.description.clone(),
                line_number: Some(line),
                is_material: item.is_material,
            })
            .await?;
            outcome.items_created += 1;

            if !item.is_material || !price_known {
                continue;
            }

            let mut candidates = Vec::with_capacity(2);
            if let Some(old) = tx.previous_price(material.id, provider.id, effective).await? {
                candidates.push(old);
            }
            match seen_in_invoice.get(&material.id) {
                Some((prev_date, prev_price)) if effective >= *prev_date => {
                    candidates.push(*prev_price);
                    seen_in_invoice.insert(material.id, (effective, unit_price));
                }
                Some(_) => {}
                None => {
                    seen_in_invoice.insert(material.id, (effective, unit_price));
                }
            }
            for old in candidates.into_iter().filter(|old| *old != unit_price) {
                let alert = PriceAlert {
                    id: Uuid::new_v4(),
                    material_id: material.id,
                    provider_id: provider.id,
                    invoice_id: invoice.id,
                    old_price: old,
                    new_price: unit_price,
                    percentage: percentage_change(old, unit_price),
                    effective_date: effective,
                    status: AlertStatus::Pending,
                };
                if tx.insert_price_alert(&alert).await? {
                    info!(
                        material = %material.code,
                        provider = %provider.name,
                        old = %old,
                        new = %unit_price,
                        percentage = %alert.percentage,
                        "Price alert"
                    );
                    outcome.alerts_created += 1;
                } else {
                    debug!(
                        material = %material.code,
                        date = %effective,
                        "Price alert already recorded"
                    );
                }
            }

            let newer = match tx.material_provider(material.id, provider.id).await? {
                Some(mp) => effective > mp.last_price_date,
                None => true,
            };
            if newer {
                tx.upsert_material_provider(&MaterialProvider {
                    material_id: material.id,
                    provider_id: provider.id,
                    last_price: unit_price,
                    last_price_date: effective,
                })
                .await?;
            }
        }

        info!(
            document = document_key,
            invoice = %invoice.invoice_code,
            items = outcome.items_created,
            skipped = outcome.items_skipped,
            alerts = outcome.alerts_created,
            "Invoice ingested"
        );
        Ok(outcome)
    }
}

async fn resolve_account(
    tx: &mut dyn LedgerTx,
    extracted: &ExtractedInvoice,
) -> Result<Option<AccountId>, LedgerError> {
    let client_cif = extracted.client.as_ref().and_then(|c| c.cif.as_deref());
    for cif in [client_cif, extracted.provider.cif.as_deref()]
        .into_iter()
        .flatten()
    {
        let variants = cif_variants(cif);
        if variants.is_empty() {
            continue;
        }
        if let Some(account) = tx.find_account_by_cif(&variants).await? {
            return Ok(Some(account));
        }
    }
    Ok(None)
}

async fn store_unassigned(
    tx: &mut dyn LedgerTx,
    extracted: &ExtractedInvoice,
    document_key: &str,
) -> Result<IngestOutcome, AttemptError> {
    let record = UnassignedInvoice {
        id: Uuid::new_v4(),
        document_key: document_key.to_string(),
        invoice_code: extracted.invoice_code.clone(),
        provider_cif: extracted.provider.cif.clone(),
        client_cif: extracted.client.as_ref().and_then(|c| c.cif.clone()),
        payload: encode_invoice(extracted),
        created_at: Utc::now(),
    };
    tx.insert_unassigned(&record).await?;
    warn!(
        document = document_key,
        invoice = %extracted.invoice_code,
        "No account matches either tax id, stored as unassigned"
    );
    Ok(IngestOutcome {
        unassigned: true,
        ..IngestOutcome::default()
    })
}
