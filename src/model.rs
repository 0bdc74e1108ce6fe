//! Ledger records and batch bookkeeping types.
//!
//! Monetary values are [`Decimal`]s rounded to two places before they are
//! stored. Identity keys (canonical CIF, material code, invoice code plus
//! provider) are the uniqueness keys the ledger enforces.

use crate::error::BatchErrorEntry;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Owning account of every provider, material and invoice.
pub type AccountId = Uuid;

// ── Providers & materials ────────────────────────────────────────────────

/// Broad classification of a supplier; drives the material category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderType {
    #[default]
    Materials,
    Services,
    Transport,
    Rental,
    Other,
}

impl ProviderType {
    /// Guess the provider type from its trading name.
    pub fn infer(name: &str) -> Self {
        let upper = name.to_uppercase();
        const RULES: &[(&[&str], ProviderType)] = &[
            (&["TRANSPORT", "LOGISTIC", "PORTES"], ProviderType::Transport),
            (&["ALQUILER", "RENTAL", "RENT "], ProviderType::Rental),
            (
                &["SERVICIO", "SERVICES", "ASESOR", "CONSULT", "MANTENIMIENTO"],
                ProviderType::Services,
            ),
            (
                &["MATERIAL", "SUMINISTRO", "FERRET", "HORMIG", "ARIDOS", "CONSTRUC"],
                ProviderType::Materials,
            ),
        ];
        RULES
            .iter()
            .find(|(needles, _)| needles.iter().any(|n| upper.contains(n)))
            .map(|(_, t)| *t)
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Materials => "MATERIALS",
            ProviderType::Services => "SERVICES",
            ProviderType::Transport => "TRANSPORT",
            ProviderType::Rental => "RENTAL",
            ProviderType::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "MATERIALS" => ProviderType::Materials,
            "SERVICES" => ProviderType::Services,
            "TRANSPORT" => ProviderType::Transport,
            "RENTAL" => ProviderType::Rental,
            _ => ProviderType::Other,
        }
    }
}

/// A supplier, unique per account by canonical CIF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: Uuid,
    pub account: AccountId,
    /// Canonical tax id; see [`crate::resolver::normalize::canonical_cif`].
    pub cif: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub provider_type: ProviderType,
}

/// Category of a material, derived from the supplying provider's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaterialCategory {
    Material,
    Service,
    Transport,
    Rental,
    Other,
}

impl From<ProviderType> for MaterialCategory {
    fn from(t: ProviderType) -> Self {
        match t {
            ProviderType::Materials => MaterialCategory::Material,
            ProviderType::Services => MaterialCategory::Service,
            ProviderType::Transport => MaterialCategory::Transport,
            ProviderType::Rental => MaterialCategory::Rental,
            ProviderType::Other => MaterialCategory::Other,
        }
    }
}

impl MaterialCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaterialCategory::Material => "MATERIAL",
            MaterialCategory::Service => "SERVICE",
            MaterialCategory::Transport => "TRANSPORT",
            MaterialCategory::Rental => "RENTAL",
            MaterialCategory::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "MATERIAL" => MaterialCategory::Material,
            "SERVICE" => MaterialCategory::Service,
            "TRANSPORT" => MaterialCategory::Transport,
            "RENTAL" => MaterialCategory::Rental,
            _ => MaterialCategory::Other,
        }
    }
}

/// A purchasable item, unique per account by generated code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Material {
    pub id: Uuid,
    pub account: AccountId,
    pub code: String,
    /// The supplier's own code, as extracted.
    pub reference_code: Option<String>,
    pub name: String,
    pub category: MaterialCategory,
}

// ── Invoices ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    #[default]
    Processed,
    Reviewed,
}

/// A stored invoice, unique by `(invoice_code, provider_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub account: AccountId,
    pub invoice_code: String,
    pub provider_id: Uuid,
    pub issue_date: NaiveDate,
    pub total_amount: Decimal,
    pub status: InvoiceStatus,
    /// Key of the submitted document this invoice came from.
    pub document_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub material_id: Uuid,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub total_price: Decimal,
    /// Effective date of the line: its own date, else the invoice issue date.
    pub item_date: NaiveDate,
    pub work_order: Option<String>,
    pub description: Option<String>,
    pub line_number: Option<u32>,
    pub is_material: bool,
}

/// Most recent observed price for a `(material, provider)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialProvider {
    pub material_id: Uuid,
    pub provider_id: Uuid,
    pub last_price: Decimal,
    pub last_price_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

/// A unit-price change for a `(material, provider)` pair.
///
/// At most one alert exists per `(material_id, provider_id, effective_date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceAlert {
    pub id: Uuid,
    pub material_id: Uuid,
    pub provider_id: Uuid,
    pub invoice_id: Uuid,
    pub old_price: Decimal,
    pub new_price: Decimal,
    pub percentage: Decimal,
    pub effective_date: NaiveDate,
    pub status: AlertStatus,
}

/// An invoice whose account could not be determined from either tax id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnassignedInvoice {
    pub id: Uuid,
    pub document_key: String,
    pub invoice_code: String,
    pub provider_cif: Option<String>,
    pub client_cif: Option<String>,
    /// The extraction, re-encoded in the compact line protocol.
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// Placeholder shown while a submitted document is still in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInvoice {
    pub document_key: String,
    pub batch_id: String,
    pub user_id: String,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
}

// ── Batches ──────────────────────────────────────────────────────────────

/// Local state of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl BatchStatus {
    /// Terminal states accept no further mutation except the parent rollup.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed
                | BatchStatus::Failed
                | BatchStatus::Cancelled
                | BatchStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::Processing => "PROCESSING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Cancelled => "CANCELLED",
            BatchStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "PENDING" => BatchStatus::Pending,
            "PROCESSING" => BatchStatus::Processing,
            "COMPLETED" => BatchStatus::Completed,
            "FAILED" => BatchStatus::Failed,
            "CANCELLED" => BatchStatus::Cancelled,
            "EXPIRED" => BatchStatus::Expired,
            _ => return None,
        })
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchPurpose {
    #[default]
    Extraction,
    Validation,
}

impl BatchPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchPurpose::Extraction => "EXTRACTION",
            BatchPurpose::Validation => "VALIDATION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EXTRACTION" => Some(BatchPurpose::Extraction),
            "VALIDATION" => Some(BatchPurpose::Validation),
            _ => None,
        }
    }
}

/// Local record of one remote job.
///
/// `id` is the remote job's identifier when the job was accepted, or a local
/// UUID for a chunk whose submission failed outright.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub user_id: String,
    pub account: Option<AccountId>,
    pub status: BatchStatus,
    pub purpose: BatchPurpose,
    pub total_files: u32,
    pub processed_files: u32,
    pub successful_files: u32,
    pub failed_files: u32,
    pub blocked_files: u32,
    pub errors: Vec<BatchErrorEntry>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchJob {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        account: Option<AccountId>,
        purpose: BatchPurpose,
        total_files: u32,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            account,
            status: BatchStatus::Pending,
            purpose,
            total_files,
            processed_files: 0,
            successful_files: 0,
            failed_files: 0,
            blocked_files: 0,
            errors: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Documents with no recorded outcome yet.
    pub fn remaining(&self) -> u32 {
        self.total_files.saturating_sub(self.processed_files)
    }
}

/// Counter deltas applied atomically to a [`BatchJob`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub processed: u32,
    pub successful: u32,
    pub failed: u32,
    pub blocked: u32,
}

impl CounterDelta {
    pub fn success() -> Self {
        Self {
            processed: 1,
            successful: 1,
            ..Self::default()
        }
    }

    pub fn failure() -> Self {
        Self {
            processed: 1,
            failed: 1,
            ..Self::default()
        }
    }

    /// Blocked documents count as failed and as blocked.
    pub fn blocked() -> Self {
        Self {
            processed: 1,
            failed: 1,
            blocked: 1,
            ..Self::default()
        }
    }

    pub fn add(&mut self, other: CounterDelta) {
        self.processed += other.processed;
        self.successful += other.successful;
        self.failed += other.failed;
        self.blocked += other.blocked;
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One submitted document inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: Uuid,
    pub batch_id: String,
    pub document_key: String,
    pub file_name: String,
    pub processed: bool,
    /// Extraction held between the EXTRACTION and VALIDATION stages.
    pub extracted_payload: Option<String>,
    pub error_message: Option<String>,
}

impl BatchItem {
    pub fn new(
        batch_id: impl Into<String>,
        document_key: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id: batch_id.into(),
            document_key: document_key.into(),
            file_name: file_name.into(),
            processed: false,
            extracted_payload: None,
            error_message: None,
        }
    }
}

/// Parent EXTRACTION batch to child VALIDATION batch, per document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchLink {
    pub parent_batch_id: String,
    pub child_batch_id: String,
    pub document_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!BatchStatus::Pending.is_terminal());
        assert!(!BatchStatus::Processing.is_terminal());
        for s in [
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Cancelled,
            BatchStatus::Expired,
        ] {
            assert!(s.is_terminal(), "{s}");
            assert_eq!(BatchStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn provider_type_inference() {
        assert_eq!(
            ProviderType::infer("Transportes Garcia SL"),
            ProviderType::Transport
        );
        assert_eq!(
            ProviderType::infer("Alquiler de Maquinaria Norte"),
            ProviderType::Rental
        );
        assert_eq!(ProviderType::infer("ACME"), ProviderType::Materials);
        assert_eq!(
            MaterialCategory::from(ProviderType::Services),
            MaterialCategory::Service
        );
    }

    #[test]
    fn blocked_delta_counts_as_failed() {
        let mut d = CounterDelta::default();
        d.add(CounterDelta::success());
        d.add(CounterDelta::blocked());
        assert_eq!(d.processed, 2);
        assert_eq!(d.failed, 1);
        assert_eq!(d.blocked, 1);
    }
}
