//! Extraction protocol codec.
//!
//! Two encodings reach the same [`ExtractedInvoice`] contract:
//!
//! - [`compact`]: the pipe-delimited line protocol (`HEADER|…`, `PROVIDER|…`,
//!   `ITEM|…`), with `~` as the null sentinel and truncation recovery.
//! - [`json`]: the legacy schema-checked JSON encoding, single-document only.
//!
//! [`batch_line`] wraps requests and responses in the JSONL framing of the
//! remote batch service. Nothing outside this module sees the `~` sentinel:
//! every absent value is an `Option::None` once decoded.

pub mod batch_line;
pub mod compact;
pub mod json;

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use compact::{decode_response, encode_invoice, PartialInvoice};

/// Supplier block of an extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedProvider {
    pub name: String,
    pub cif: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

/// Recipient block of an extraction; used to pick the owning account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedClient {
    pub cif: Option<String>,
    pub name: Option<String>,
}

/// One invoice line as extracted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedItem {
    pub material_name: Option<String>,
    pub material_code: Option<String>,
    /// `false` for service or fee lines that never produce price alerts.
    pub is_material: bool,
    /// `None` only when the value was present but unreadable.
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub total_price: Option<Decimal>,
    pub item_date: Option<NaiveDate>,
    pub work_order: Option<String>,
    pub description: Option<String>,
    /// 1-based ordinal on the invoice. Assigned by position when absent.
    pub line_number: Option<u32>,
}

impl ExtractedItem {
    /// Fill a missing unit or total price from the other one and the quantity.
    pub fn complete_prices(&mut self) {
        let qty = match self.quantity {
            Some(q) if !q.is_zero() => q,
            _ => return,
        };
        match (self.unit_price, self.total_price) {
            (None, Some(total)) => {
                self.unit_price = total.checked_div(qty).map(round2);
                if self.unit_price.is_none() {
                    warn!(%total, quantity = %qty, "Unit price out of range, left empty");
                }
            }
            (Some(unit), None) => {
                self.total_price = unit.checked_mul(qty).map(round2);
                if self.total_price.is_none() {
                    warn!(%unit, quantity = %qty, "Total price out of range, left empty");
                }
            }
            _ => {}
        }
    }
}

/// A decoded invoice carrying every load-bearing field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedInvoice {
    pub invoice_code: String,
    pub issue_date: NaiveDate,
    pub total_amount: Decimal,
    pub provider: ExtractedProvider,
    pub client: Option<ExtractedClient>,
    pub items: Vec<ExtractedItem>,
}

impl ExtractedInvoice {
    /// No invoice number and no items: not worth an invoice row.
    pub fn is_empty(&self) -> bool {
        self.invoice_code.trim().is_empty() && self.items.is_empty()
    }

    /// Date used to order documents before serial ingestion.
    pub fn sort_key(&self) -> NaiveDate {
        self.issue_date
    }
}

/// Round to the ledger's two-decimal scale.
pub fn round2(d: Decimal) -> Decimal {
    d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Parse an amount as printed on an invoice.
///
/// Accepts `1234.56`, `1.234,56`, `1,234.56`, `12,5`, currency symbols and
/// surrounding whitespace. The right-most separator is taken as the decimal
/// point when both kinds appear.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');
    let normalized = match (last_dot, last_comma) {
        (Some(d), Some(c)) if c > d => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (None, Some(_)) => {
            // "1,234" with exactly three trailing digits reads as thousands.
            let tail = cleaned.rsplit(',').next().unwrap_or("");
            if cleaned.matches(',').count() > 1 || (tail.len() == 3 && !cleaned.starts_with("0,"))
            {
                cleaned.replace(',', "")
            } else {
                cleaned.replace(',', ".")
            }
        }
        _ => cleaned,
    };
    normalized.parse::<Decimal>().ok().map(round2)
}

/// Parse an ISO date, tolerating `DD/MM/YYYY` and `DD-MM-YYYY`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%d/%m/%Y"))
        .or_else(|_| NaiveDate::parse_from_str(s, "%d-%m-%Y"))
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y/%m/%d"))
        .ok()
}

/// Parse a yes/no flag. Unknown values yield `None`.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "si" | "sí" | "s" => Some(true),
        "0" | "false" | "no" | "n" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn amounts_in_local_formats() {
        assert_eq!(parse_amount("1234.56"), Some(dec("1234.56")));
        assert_eq!(parse_amount("1.234,56"), Some(dec("1234.56")));
        assert_eq!(parse_amount("1,234.56"), Some(dec("1234.56")));
        assert_eq!(parse_amount("12,5"), Some(dec("12.50")));
        assert_eq!(parse_amount("1,234"), Some(dec("1234")));
        assert_eq!(parse_amount("0,125"), Some(dec("0.13")));
        assert_eq!(parse_amount("€ 99,90"), Some(dec("99.90")));
        assert_eq!(parse_amount("-3.10"), Some(dec("-3.10")));
        assert_eq!(parse_amount("n/a"), None);
    }

    #[test]
    fn dates_in_common_formats() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(parse_date("2024-03-07"), Some(d));
        assert_eq!(parse_date("07/03/2024"), Some(d));
        assert_eq!(parse_date("2024-13-07"), None);
    }

    #[test]
    fn prices_are_back_computed() {
        let mut item = ExtractedItem {
            quantity: Some(dec("4")),
            total_price: Some(dec("10.00")),
            ..Default::default()
        };
        item.complete_prices();
        assert_eq!(item.unit_price, Some(dec("2.50")));

        let mut item = ExtractedItem {
            quantity: Some(dec("3")),
            unit_price: Some(dec("1.10")),
            ..Default::default()
        };
        item.complete_prices();
        assert_eq!(item.total_price, Some(dec("3.30")));
    }

    #[test]
    fn out_of_range_prices_stay_empty() {
        let mut item = ExtractedItem {
            quantity: Some(dec("99999999999999999999")),
            unit_price: Some(dec("99999999999999999999")),
            ..Default::default()
        };
        item.complete_prices();
        assert_eq!(item.total_price, None);

        let mut item = ExtractedItem {
            quantity: Some(dec("0.0000000000000000000000001")),
            total_price: Some(dec("99999999999999999999")),
            ..Default::default()
        };
        item.complete_prices();
        assert_eq!(item.unit_price, None);
    }
}
