//! Prompts for invoice extraction and validation.
//!
//! Every prompt lives here so wording changes touch one file and unit tests
//! can inspect prompts without calling a model. Callers can override the
//! extraction prompt via [`crate::config::PipelineConfig::system_prompt`].

/// Default extraction prompt for the compact line protocol.
pub const COMPACT_EXTRACTION_PROMPT: &str = r#"You extract structured data from a supplier invoice (PDF).

Reply ONLY with lines in this exact pipe-delimited format, one record per line:

HEADER|invoiceCode|issueDate|totalAmount
PROVIDER|name|cif|email|phone|address
CLIENT|cif|name
ITEM|materialName|materialCode|isMaterial|quantity|unitPrice|totalPrice|itemDate|workOrder|description|lineNumber

Rules:
1. Exactly one HEADER, one PROVIDER and at most one CLIENT line, then one ITEM line per invoice line.
2. Use ~ for any value that is not printed on the invoice. Never leave a field out.
3. Never use the | character inside a value.
4. Dates as YYYY-MM-DD. Amounts with a dot as decimal separator and no thousands separator.
5. isMaterial is 1 for physical goods and 0 for services, transport, fees or discounts.
6. PROVIDER is the issuer of the invoice; CLIENT is the recipient. cif is the tax id as printed.
7. lineNumber counts ITEM lines from 1 in the order they appear.
8. itemDate only when the line carries its own date (e.g. delivery notes); otherwise ~.
9. No headings, no commentary, no code fences."#;

/// Continuation instruction after a truncated compact response.
///
/// `{next}` is replaced with the first line ordinal still missing.
pub const CONTINUATION_SUFFIX: &str = r#"Your previous answer was cut off. Continue the SAME invoice.
Output ONLY ITEM lines, starting at lineNumber {next}, in the same format.
Do not repeat HEADER, PROVIDER, CLIENT or any ITEM line already given."#;

/// Build the continuation instruction, including the partial output received.
pub fn continuation_prompt(partial_output: &str, next_line: u32) -> String {
    format!(
        "{}\n\nPrevious partial output:\n{}",
        CONTINUATION_SUFFIX.replace("{next}", &next_line.to_string()),
        partial_output.trim_end()
    )
}

/// Legacy JSON extraction prompt (single-document, temperature 0).
pub const JSON_EXTRACTION_PROMPT: &str = r#"You extract structured data from a supplier invoice (PDF).

Reply ONLY with one JSON object, no code fences, matching:
{
  "invoiceCode": string,
  "issueDate": "YYYY-MM-DD",
  "totalAmount": number,
  "provider": {"name": string, "cif": string|null, "email": string|null, "phone": string|null, "address": string|null},
  "client": {"cif": string|null, "name": string|null},
  "items": [{
    "materialName": string, "materialCode": string|null, "isMaterial": boolean,
    "quantity": number|null, "unitPrice": number|null, "totalPrice": number|null,
    "itemDate": "YYYY-MM-DD"|null, "workOrder": string|null, "description": string|null,
    "lineNumber": number
  }]
}
Use null for anything not printed on the invoice."#;

/// Prompt for the validation round-trip. The extraction follows as a
/// separate text part.
pub const VALIDATION_PROMPT: &str = r#"Below is data previously extracted from a supplier invoice in a pipe-delimited format
(HEADER, PROVIDER, CLIENT and ITEM lines; ~ means not printed).

Check it for internal consistency: quantity x unitPrice = totalPrice per ITEM, item totals
against the HEADER total (taxes may explain a difference), plausible dates, and a plausible cif.
Correct only values that are clearly wrong. Reply ONLY with the corrected data in exactly the
same format, every line, no commentary."#;
