//! The pipe-delimited extraction protocol.
//!
//! ```text
//! HEADER|invoiceCode|issueDate|totalAmount
//! PROVIDER|name|cif|email|phone|address
//! CLIENT|cif|name
//! ITEM|materialName|materialCode|isMaterial|quantity|unitPrice|totalPrice|itemDate|workOrder|description|lineNumber
//! ```
//!
//! `~` marks an absent value and is distinct from an empty field. A line with
//! the wrong number of fields is dropped and logged; the rest of the response
//! still decodes. A response cut off at the token limit usually ends in such a
//! partial line, so the broken tail never reaches
//! [`PartialInvoice::merge_continuation`].

use super::{
    parse_amount, parse_date, parse_flag, ExtractedClient, ExtractedInvoice, ExtractedItem,
    ExtractedProvider,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Null sentinel on the wire.
pub const NULL: &str = "~";

const HEADER_FIELDS: usize = 4;
const PROVIDER_FIELDS: usize = 6;
const CLIENT_FIELDS: usize = 3;
const ITEM_FIELDS: usize = 11;

/// Header fields, each possibly absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    pub invoice_code: Option<String>,
    pub issue_date: Option<NaiveDate>,
    pub total_amount: Option<Decimal>,
}

/// Everything a response yielded, before the load-bearing fields are checked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialInvoice {
    pub header: Option<Header>,
    pub provider: Option<ExtractedProvider>,
    pub client: Option<ExtractedClient>,
    pub items: Vec<ExtractedItem>,
    /// Lines discarded for a wrong field count.
    pub dropped_lines: usize,
}

impl PartialInvoice {
    /// Parse every recognisable line of a response.
    pub fn parse(raw: &str) -> Self {
        let mut out = PartialInvoice::default();
        for (idx, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("```") {
                continue;
            }
            let fields: Vec<&str> = line.split('|').collect();
            let tag = fields[0].trim().to_ascii_uppercase();
            let expected = match tag.as_str() {
                "HEADER" => HEADER_FIELDS,
                "PROVIDER" => PROVIDER_FIELDS,
                "CLIENT" => CLIENT_FIELDS,
                "ITEM" => ITEM_FIELDS,
                _ => {
                    debug!(line = idx + 1, "Ignoring unrecognised line");
                    continue;
                }
            };
            if fields.len() != expected {
                warn!(
                    line = idx + 1,
                    tag = %tag,
                    expected,
                    got = fields.len(),
                    "Dropping line with wrong field count"
                );
                out.dropped_lines += 1;
                continue;
            }
            match tag.as_str() {
                "HEADER" => out.header = Some(decode_header(&fields)),
                "PROVIDER" => out.provider = Some(decode_provider(&fields)),
                "CLIENT" => out.client = Some(decode_client(&fields)),
                _ => out.items.push(decode_item(&fields)),
            }
        }
        out
    }

    /// Highest line ordinal parsed so far, 0 when there are no items.
    /// Items without an explicit ordinal count by position.
    pub fn last_line_number(&self) -> u32 {
        self.items
            .iter()
            .enumerate()
            .map(|(idx, i)| {
                i.line_number
                    .unwrap_or_else(|| u32::try_from(idx).unwrap_or(u32::MAX).saturating_add(1))
            })
            .max()
            .unwrap_or(0)
    }

    fn number_items(&mut self) {
        for (idx, item) in self.items.iter_mut().enumerate() {
            if item.line_number.is_none() {
                item.line_number = Some(u32::try_from(idx).unwrap_or(u32::MAX).saturating_add(1));
            }
        }
    }

    /// Append the items of a continuation response, skipping ordinals already
    /// present. Returns the number of items added.
    pub fn merge_continuation(&mut self, continuation: PartialInvoice) -> usize {
        if self.header.is_none() {
            self.header = continuation.header;
        }
        if self.provider.is_none() {
            self.provider = continuation.provider;
        }
        if self.client.is_none() {
            self.client = continuation.client;
        }

        self.number_items();
        let mut seen: BTreeSet<u32> = self.items.iter().filter_map(|i| i.line_number).collect();
        let mut next = self.last_line_number().saturating_add(1);
        let mut added = 0;
        for mut item in continuation.items {
            let ordinal = match item.line_number {
                Some(n) if !seen.contains(&n) => n,
                Some(_) => continue,
                None => next,
            };
            item.line_number = Some(ordinal);
            seen.insert(ordinal);
            next = next.max(ordinal.saturating_add(1));
            self.items.push(item);
            added += 1;
        }
        self.items.sort_by_key(|i| i.line_number);
        self.dropped_lines += continuation.dropped_lines;
        added
    }

    /// No invoice number and no items.
    pub fn is_empty(&self) -> bool {
        let has_code = self
            .header
            .as_ref()
            .and_then(|h| h.invoice_code.as_deref())
            .is_some_and(|c| !c.trim().is_empty());
        !has_code && self.items.is_empty()
    }

    /// Names of the load-bearing fields that are absent.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        let header = self.header.as_ref();
        if header
            .and_then(|h| h.invoice_code.as_deref())
            .is_none_or(|c| c.trim().is_empty())
        {
            missing.push("invoiceCode");
        }
        if header.and_then(|h| h.issue_date).is_none() {
            missing.push("issueDate");
        }
        if header.and_then(|h| h.total_amount).is_none() {
            missing.push("totalAmount");
        }
        let provider_present = self.provider.as_ref().is_some_and(|p| {
            !p.name.trim().is_empty() || p.cif.as_deref().is_some_and(|c| !c.trim().is_empty())
        });
        if !provider_present {
            missing.push("provider");
        }
        if self.items.is_empty() {
            missing.push("items");
        }
        missing
    }

    /// Promote to an [`ExtractedInvoice`] if every load-bearing field is present.
    pub fn finish(mut self) -> Option<ExtractedInvoice> {
        if !self.missing_fields().is_empty() {
            return None;
        }
        self.number_items();
        let header = self.header?;
        Some(ExtractedInvoice {
            invoice_code: header.invoice_code?.trim().to_string(),
            issue_date: header.issue_date?,
            total_amount: header.total_amount?,
            provider: self.provider?,
            client: self.client,
            items: self.items,
        })
    }
}

/// Decode a compact response; `None` when a load-bearing field is missing.
pub fn decode_response(raw: &str) -> Option<ExtractedInvoice> {
    PartialInvoice::parse(raw).finish()
}

/// Encode an invoice back into the line protocol.
pub fn encode_invoice(invoice: &ExtractedInvoice) -> String {
    let mut out = String::new();
    push_line(
        &mut out,
        "HEADER",
        &[
            Some(invoice.invoice_code.clone()),
            Some(invoice.issue_date.to_string()),
            Some(fmt_amount(invoice.total_amount)),
        ],
    );
    let p = &invoice.provider;
    push_line(
        &mut out,
        "PROVIDER",
        &[
            Some(p.name.clone()),
            p.cif.clone(),
            p.email.clone(),
            p.phone.clone(),
            p.address.clone(),
        ],
    );
    if let Some(c) = &invoice.client {
        push_line(&mut out, "CLIENT", &[c.cif.clone(), c.name.clone()]);
    }
    for item in &invoice.items {
        push_line(
            &mut out,
            "ITEM",
            &[
                item.material_name.clone(),
                item.material_code.clone(),
                Some(if item.is_material { "1" } else { "0" }.to_string()),
                item.quantity.map(fmt_amount),
                item.unit_price.map(fmt_amount),
                item.total_price.map(fmt_amount),
                item.item_date.map(|d| d.to_string()),
                item.work_order.clone(),
                item.description.clone(),
                item.line_number.map(|n| n.to_string()),
            ],
        );
    }
    out
}

fn push_line(out: &mut String, tag: &str, fields: &[Option<String>]) {
    out.push_str(tag);
    for f in fields {
        out.push('|');
        match f {
            Some(v) => out.push_str(&sanitize(v)),
            None => out.push_str(NULL),
        }
    }
    out.push('\n');
}

fn sanitize(v: &str) -> String {
    let s: String = v
        .chars()
        .map(|c| match c {
            '|' => '/',
            '\n' | '\r' => ' ',
            c => c,
        })
        .collect();
    // A literal "~" value would read back as null.
    if s.trim() == NULL {
        String::from("-")
    } else {
        s
    }
}

fn fmt_amount(d: Decimal) -> String {
    format!("{:.2}", d)
}

/// `None` for the sentinel, the trimmed text otherwise (possibly empty).
fn field<'a>(fields: &[&'a str], idx: usize) -> Option<&'a str> {
    let v = fields.get(idx)?.trim();
    (v != NULL).then_some(v)
}

/// Text field where an empty value carries no information either.
fn text(fields: &[&str], idx: usize) -> Option<String> {
    field(fields, idx)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn decode_header(fields: &[&str]) -> Header {
    Header {
        invoice_code: text(fields, 1),
        issue_date: field(fields, 2).and_then(parse_date),
        total_amount: field(fields, 3).and_then(parse_amount),
    }
}

fn decode_provider(fields: &[&str]) -> ExtractedProvider {
    ExtractedProvider {
        name: text(fields, 1).unwrap_or_default(),
        cif: text(fields, 2),
        email: text(fields, 3),
        phone: text(fields, 4),
        address: text(fields, 5),
    }
}

fn decode_client(fields: &[&str]) -> ExtractedClient {
    ExtractedClient {
        cif: text(fields, 1),
        name: text(fields, 2),
    }
}

fn decode_item(fields: &[&str]) -> ExtractedItem {
    let quantity = match field(fields, 4) {
        None => Some(Decimal::ONE),
        Some("") => Some(Decimal::ONE),
        Some(raw) => {
            let q = parse_amount(raw);
            if q.is_none() {
                warn!(value = raw, "Unreadable item quantity");
            }
            q
        }
    };
    let mut item = ExtractedItem {
        material_name: text(fields, 1),
        material_code: text(fields, 2),
        is_material: field(fields, 3).and_then(parse_flag).unwrap_or(true),
        quantity,
        unit_price: field(fields, 5).and_then(parse_amount),
        total_price: field(fields, 6).and_then(parse_amount),
        item_date: field(fields, 7).and_then(parse_date),
        work_order: text(fields, 8),
        description: text(fields, 9),
        line_number: field(fields, 10).and_then(|v| v.parse().ok()),
    };
    item.complete_prices();
    item
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    const SAMPLE: &str = "\
HEADER|F-2024-001|2024-03-01|121.00
PROVIDER|Suministros Norte SL|B-12345678|ventas@norte.es|944 000 000|Calle Mayor 1
CLIENT|A87654321|Obras Sur SA
ITEM|Cemento gris 25kg|CEM25|1|10|5.50|55.00|~|OT-17|~|1
ITEM|Arena fina|~|1|~|~|11.00|2024-02-28|~|~|2
ITEM|Transporte|~|0|1|45.00|~|~|~|Portes|3
";

    #[test]
    fn decodes_all_blocks() {
        let inv = decode_response(SAMPLE).expect("decodes");
        assert_eq!(inv.invoice_code, "F-2024-001");
        assert_eq!(inv.total_amount, dec("121.00"));
        assert_eq!(inv.provider.cif.as_deref(), Some("B-12345678"));
        assert_eq!(
            inv.client.as_ref().and_then(|c| c.cif.as_deref()),
            Some("A87654321")
        );
        assert_eq!(inv.items.len(), 3);

        let cement = &inv.items[0];
        assert_eq!(cement.quantity, Some(dec("10")));
        assert_eq!(cement.work_order.as_deref(), Some("OT-17"));
        assert_eq!(cement.item_date, None);

        // Missing quantity defaults to 1 and the unit price is back-computed.
        let sand = &inv.items[1];
        assert_eq!(sand.quantity, Some(Decimal::ONE));
        assert_eq!(sand.unit_price, Some(dec("11.00")));

        // Total back-computed from unit price.
        let transport = &inv.items[2];
        assert!(!transport.is_material);
        assert_eq!(transport.total_price, Some(dec("45.00")));
    }

    #[test]
    fn wrong_field_count_drops_only_that_line() {
        let raw = "\
HEADER|F-1|2024-01-10|20.00
PROVIDER|Acme|B11111111|~|~|~
ITEM|Tornillo|T1|1|2|5.00|10.00|~|~|~|1
ITEM|Broken|line|with|too|few
ITEM|Tuerca|T2|1|2|5.00|10.00|~|~|~|3
";
        let partial = PartialInvoice::parse(raw);
        assert_eq!(partial.dropped_lines, 1);
        let inv = partial.finish().expect("still decodes");
        assert_eq!(inv.items.len(), 2);
        assert_eq!(inv.items[1].material_name.as_deref(), Some("Tuerca"));
    }

    #[test]
    fn header_with_wrong_count_is_dropped() {
        let raw = "HEADER|F-1|2024-01-10\nPROVIDER|Acme|B1|~|~|~\nITEM|A|~|1|1|1|1|~|~|~|1\n";
        let partial = PartialInvoice::parse(raw);
        assert!(partial.header.is_none());
        assert!(partial.missing_fields().contains(&"invoiceCode"));
        assert!(partial.finish().is_none());
    }

    #[test]
    fn missing_items_fails_decode() {
        let raw = "HEADER|F-1|2024-01-10|20.00\nPROVIDER|Acme|B1|~|~|~\n";
        assert!(decode_response(raw).is_none());
        assert!(!PartialInvoice::parse(raw).is_empty());
        assert!(PartialInvoice::parse("garbage\n").is_empty());
    }

    #[test]
    fn absent_and_unreadable_quantities() {
        let raw = "ITEM|Cable||1|~|2.00|~|~|~|~|1\n";
        let item = &PartialInvoice::parse(raw).items[0];
        assert_eq!(item.material_code, None);
        assert_eq!(item.quantity, Some(Decimal::ONE));
        let raw = "ITEM|Cable|~|1|abc|2.00|~|~|~|~|1\n";
        let item = &PartialInvoice::parse(raw).items[0];
        assert_eq!(item.quantity, None);
    }

    #[test]
    fn unresolvable_prices_stay_absent() {
        let raw = "ITEM|Cable|~|1|3|~|~|~|~|~|1\n";
        let item = &PartialInvoice::parse(raw).items[0];
        assert_eq!(item.unit_price, None);
        assert_eq!(item.total_price, None);
    }

    #[test]
    fn reencode_preserves_amounts() {
        let inv = decode_response(SAMPLE).unwrap();
        let again = decode_response(&encode_invoice(&inv)).unwrap();
        assert_eq!(again.invoice_code, inv.invoice_code);
        assert_eq!(again.total_amount, inv.total_amount);
        for (a, b) in again.items.iter().zip(&inv.items) {
            assert_eq!(a.unit_price, b.unit_price);
            assert_eq!(a.total_price, b.total_price);
            assert_eq!(a.line_number, b.line_number);
        }
    }

    #[test]
    fn encode_escapes_pipes_and_sentinel() {
        let mut inv = decode_response(SAMPLE).unwrap();
        inv.items[0].description = Some("a|b".into());
        inv.items[1].description = Some("~".into());
        let text = encode_invoice(&inv);
        let again = PartialInvoice::parse(&text);
        assert_eq!(again.dropped_lines, 0);
        assert_eq!(again.items[0].description.as_deref(), Some("a/b"));
        assert_eq!(again.items[1].description.as_deref(), Some("-"));
    }

    #[test]
    fn continuation_merges_by_ordinal() {
        let first = "\
HEADER|F-9|2024-05-01|300.00
PROVIDER|Acme|B1|~|~|~
ITEM|A|~|1|1|100|100|~|~|~|1
ITEM|B|~|1|1|100|100|~|~|~|2
ITEM|C|~|1|1|10";
        let mut base = PartialInvoice::parse(first);
        assert_eq!(base.last_line_number(), 2);
        assert_eq!(base.dropped_lines, 1);

        // The continuation repeats line 2 and then carries on.
        let cont = "ITEM|B|~|1|1|100|100|~|~|~|2\nITEM|C|~|1|1|100|100|~|~|~|3\n";
        let added = base.merge_continuation(PartialInvoice::parse(cont));
        assert_eq!(added, 1);

        // Unnumbered continuation lines follow on from the last ordinal.
        let added = base.merge_continuation(PartialInvoice::parse("ITEM|D|~|1|1|1|1|~|~|~|~\n"));
        assert_eq!(added, 1);
        assert_eq!(base.last_line_number(), 4);

        let inv = base.finish().unwrap();
        let ordinals: Vec<u32> = inv.items.iter().filter_map(|i| i.line_number).collect();
        assert_eq!(ordinals, vec![1, 2, 3, 4]);
    }

    #[test]
    fn highest_ordinal_does_not_overflow() {
        let mut base = PartialInvoice::parse(
            "HEADER|F-9|2024-05-01|1.00\nPROVIDER|Acme|B1|~|~|~\nITEM|A|~|1|1|1|1|~|~|~|4294967295\n",
        );
        assert_eq!(base.last_line_number(), u32::MAX);
        let added = base.merge_continuation(PartialInvoice::parse("ITEM|B|~|1|1|1|1|~|~|~|~\n"));
        assert_eq!(added, 1);
        assert_eq!(base.finish().unwrap().items.len(), 2);
    }

    #[test]
    fn oversized_numbers_do_not_abort_the_line() {
        let inv = decode_response(
            "HEADER|F-1|2024-01-01|10.00\nPROVIDER|Acme|B1|~|~|~\n\
             ITEM|X|~|1|99999999999999999999|99999999999999999999|~|~|~|~|1\n",
        )
        .expect("decodes");
        assert_eq!(inv.items.len(), 1);
        assert_eq!(inv.items[0].unit_price, Some(dec("99999999999999999999")));
        assert_eq!(inv.items[0].total_price, None);
    }
}
