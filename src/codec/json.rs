//! Legacy structured-JSON encoding.
//!
//! Used for single-document calls when token budget is not a concern. The
//! model is asked for one JSON object; numbers may arrive as JSON numbers or
//! as strings in local notation, so numeric fields go through
//! [`super::parse_amount`] either way. Decoding lands in the same
//! [`PartialInvoice`] as the compact path, so both share the load-bearing
//! field checks.

use super::compact::{Header, PartialInvoice};
use super::{
    parse_amount, parse_date, ExtractedClient, ExtractedInvoice, ExtractedItem, ExtractedProvider,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JsonInvoice {
    invoice_code: Option<String>,
    issue_date: Option<String>,
    total_amount: Option<Value>,
    provider: Option<JsonProvider>,
    client: Option<JsonClient>,
    items: Vec<JsonItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JsonProvider {
    name: Option<String>,
    cif: Option<String>,
    email: Option<String>,
    phone: Option<Value>,
    address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JsonClient {
    cif: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JsonItem {
    material_name: Option<String>,
    material_code: Option<String>,
    is_material: Option<bool>,
    quantity: Option<Value>,
    unit_price: Option<Value>,
    total_price: Option<Value>,
    item_date: Option<String>,
    work_order: Option<String>,
    description: Option<String>,
    line_number: Option<u32>,
}

/// Parse a JSON response body, tolerating a surrounding code fence.
pub fn parse(raw: &str) -> Result<PartialInvoice, serde_json::Error> {
    let parsed: JsonInvoice = serde_json::from_str(strip_fence(raw))?;

    let header = Header {
        invoice_code: non_empty(parsed.invoice_code),
        issue_date: parsed.issue_date.as_deref().and_then(parse_date),
        total_amount: parsed.total_amount.as_ref().and_then(amount),
    };
    let provider = parsed.provider.map(|p| ExtractedProvider {
        name: p.name.unwrap_or_default().trim().to_string(),
        cif: non_empty(p.cif),
        email: non_empty(p.email),
        phone: p.phone.as_ref().and_then(value_text),
        address: non_empty(p.address),
    });
    let client = parsed.client.map(|c| ExtractedClient {
        cif: non_empty(c.cif),
        name: non_empty(c.name),
    });
    let items = parsed
        .items
        .into_iter()
        .map(|i| {
            let mut item = ExtractedItem {
                material_name: non_empty(i.material_name),
                material_code: non_empty(i.material_code),
                is_material: i.is_material.unwrap_or(true),
                quantity: match &i.quantity {
                    None | Some(Value::Null) => Some(Decimal::ONE),
                    Some(v) => amount(v),
                },
                unit_price: i.unit_price.as_ref().and_then(amount),
                total_price: i.total_price.as_ref().and_then(amount),
                item_date: i.item_date.as_deref().and_then(parse_date),
                work_order: non_empty(i.work_order),
                description: non_empty(i.description),
                line_number: i.line_number,
            };
            item.complete_prices();
            item
        })
        .collect();

    Ok(PartialInvoice {
        header: Some(header),
        provider,
        client,
        items,
        dropped_lines: 0,
    })
}

/// Decode a JSON response; `None` when it is not JSON or a load-bearing
/// field is missing.
pub fn decode_response(raw: &str) -> Option<ExtractedInvoice> {
    parse(raw).ok()?.finish()
}

fn strip_fence(raw: &str) -> &str {
    let t = raw.trim();
    let t = t
        .strip_prefix("```json")
        .or_else(|| t.strip_prefix("```"))
        .unwrap_or(t);
    t.strip_suffix("```").unwrap_or(t).trim()
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn value_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => non_empty(Some(s.clone())),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn amount(v: &Value) -> Option<Decimal> {
    value_text(v).as_deref().and_then(parse_amount)
}
