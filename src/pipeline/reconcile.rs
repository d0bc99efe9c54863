//! Reconciliation: turn a structured payload into record fields and a status.
//!
//! Two steps:
//!
//! 1. [`ExtractedFields::from_response`] maps the untyped JSON object onto a
//!    typed struct, one key at a time, against the [`ExtractionSchema`]
//!    catalogue. Keys the schema does not declare are dropped. Values of the
//!    wrong shape are dropped. Both are reported in
//!    [`MappedResponse::rejected`] so nothing disappears silently.
//! 2. [`apply`] classifies the document by its title and writes the fields
//!    onto an [`InvoiceRecord`].
//!
//! Coercion rules:
//!
//! | Field kind | Accepted | Absent |
//! |---|---|---|
//! | text | strings, numbers (rendered) | `null`, `""`, `"N/A"` |
//! | amount | integers (minor units), floats and numeric strings via [`crate::money`] | `null`, `"N/A"` |
//! | date | `YYYY-MM-DD` strings | `null`, `"N/A"`, anything unparseable |
//! | confidence | numbers or numeric strings in 0–100 | `null`, out of range |
//!
//! `discount` is stored as an absolute value.

use crate::money::json_amount;
use crate::pipeline::postprocess::clean_transcription;
use crate::prompts::NOT_INVOICE_TITLE;
use crate::record::{InvoiceRecord, InvoiceStatus};
use crate::schema::ExtractionSchema;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

/// Description stored on a non-invoice record when the model gave none.
pub const DEFAULT_NO_INVOICE_DESCRIPTION: &str = "No description provided.";

/// Typed view of one structured payload. `None` means absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub invoice_number: Option<String>,
    pub invoice_title: Option<String>,
    pub invoice_description: Option<String>,
    pub invoice_date: Option<NaiveDate>,

    pub sender_company_name: Option<String>,
    pub sender_address: Option<String>,
    pub sender_email: Option<String>,
    pub sender_tax_number: Option<String>,

    pub recipient_company_name: Option<String>,
    pub recipient_address: Option<String>,
    pub recipient_tax_number: Option<String>,

    pub subtotal: Option<i64>,
    pub tax_rate: Option<i64>,
    pub tax_amount: Option<i64>,
    pub discount: Option<i64>,
    pub total: Option<i64>,
    pub currency: Option<String>,

    pub notes: Option<String>,
    pub payment_terms: Option<String>,
    pub extracted_text: Option<String>,
    pub confidence: Option<u8>,
}

/// Why a key was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Not declared by the schema.
    UnknownField,
    /// The JSON type cannot be coerced to the field's type.
    WrongType,
    /// A date that is not `YYYY-MM-DD`.
    InvalidDate,
    /// Confidence outside 0–100.
    OutOfRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedField {
    pub key: String,
    pub reason: RejectReason,
}

/// Result of mapping a payload: the typed fields plus what was dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappedResponse {
    pub fields: ExtractedFields,
    pub rejected: Vec<RejectedField>,
}

impl MappedResponse {
    /// `true` if a confidence value was present but outside 0–100.
    pub fn confidence_flagged(&self) -> bool {
        self.rejected
            .iter()
            .any(|r| r.key == "confidence" && r.reason == RejectReason::OutOfRange)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// Required keys missing, or `null` on a non-nullable field.
    #[error("structured payload is missing required fields: {}", .fields.join(", "))]
    MissingRequired { fields: Vec<String> },

    /// An invoice-branch payload without the data a processed record needs.
    #[error("invoice payload lacks {}", .missing.join(" and "))]
    IncompleteInvoice { missing: Vec<&'static str> },
}

/// Invoice vs. not-an-invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Invoice,
    NotInvoice,
}

impl ExtractedFields {
    /// Map a raw payload against `schema`.
    ///
    /// Fails only when a required key is missing (or `null` where the schema
    /// forbids it). Every other problem drops the offending key and records
    /// it in [`MappedResponse::rejected`].
    pub fn from_response(
        map: &Map<String, Value>,
        schema: &ExtractionSchema,
    ) -> Result<MappedResponse, ReconcileError> {
        let missing: Vec<String> = schema
            .required
            .iter()
            .copied()
            .filter(|name| match map.get(*name) {
                None => true,
                Some(Value::Null) => schema.field(name).is_some_and(|f| !f.nullable),
                Some(_) => false,
            })
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(ReconcileError::MissingRequired { fields: missing });
        }

        let mut out = MappedResponse::default();
        for (key, value) in map {
            if !schema.contains(key) {
                out.reject(key, RejectReason::UnknownField);
                continue;
            }
            if value.is_null() {
                continue;
            }
            if let Err(reason) = out.fields.assign(key, value) {
                out.reject(key, reason);
            }
        }
        Ok(out)
    }

    fn assign(&mut self, key: &str, value: &Value) -> Result<(), RejectReason> {
        let f = self;
        match key {
            "invoice_number" => f.invoice_number = text(value)?,
            "invoice_title" => f.invoice_title = text(value)?,
            "invoice_description" => f.invoice_description = text(value)?,
            "invoice_date" => f.invoice_date = date(value)?,
            "sender_company_name" => f.sender_company_name = text(value)?,
            "sender_address" => f.sender_address = text(value)?,
            "sender_email" => f.sender_email = text(value)?,
            "sender_tax_number" => f.sender_tax_number = text(value)?,
            "recipient_company_name" => f.recipient_company_name = text(value)?,
            "recipient_address" => f.recipient_address = text(value)?,
            "recipient_tax_number" => f.recipient_tax_number = text(value)?,
            "subtotal" => f.subtotal = amount(value)?,
            "tax_rate" => f.tax_rate = amount(value)?,
            "tax_amount" => f.tax_amount = amount(value)?,
            "discount" => f.discount = amount(value)?.map(i64::abs),
            "total" => f.total = amount(value)?,
            "currency" => f.currency = text(value)?.map(|c| c.trim().to_ascii_uppercase()),
            "notes" => f.notes = text(value)?,
            "payment_terms" => f.payment_terms = text(value)?,
            "extracted_text" => {
                f.extracted_text = text(value)?
                    .map(|t| clean_transcription(&t))
                    .filter(|t| !t.is_empty())
            }
            "confidence" => f.confidence = Some(confidence(value)?),
            _ => return Err(RejectReason::UnknownField),
        }
        Ok(())
    }
}

impl MappedResponse {
    fn reject(&mut self, key: &str, reason: RejectReason) {
        warn!(key, ?reason, "Dropping field from structured payload");
        self.rejected.push(RejectedField {
            key: key.to_string(),
            reason,
        });
    }
}

// ── Coercions ────────────────────────────────────────────────────────────

fn is_not_applicable(s: &str) -> bool {
    let t = s.trim();
    t.is_empty() || t.eq_ignore_ascii_case("n/a")
}

fn text(value: &Value) -> Result<Option<String>, RejectReason> {
    match value {
        Value::String(s) if is_not_applicable(s) => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Err(RejectReason::WrongType),
    }
}

fn amount(value: &Value) -> Result<Option<i64>, RejectReason> {
    match value {
        Value::String(s) if is_not_applicable(s) => Ok(None),
        Value::Number(_) | Value::String(_) => {
            json_amount(value).map(Some).ok_or(RejectReason::WrongType)
        }
        _ => Err(RejectReason::WrongType),
    }
}

fn date(value: &Value) -> Result<Option<NaiveDate>, RejectReason> {
    match value {
        Value::String(s) if is_not_applicable(s) => Ok(None),
        Value::String(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(Some)
            .map_err(|_| RejectReason::InvalidDate),
        _ => Err(RejectReason::WrongType),
    }
}

fn confidence(value: &Value) -> Result<u8, RejectReason> {
    let raw = match value {
        Value::Number(n) => n.as_f64().ok_or(RejectReason::WrongType)?,
        Value::String(s) => s
            .trim()
            .trim_end_matches('%')
            .parse::<f64>()
            .map_err(|_| RejectReason::WrongType)?,
        _ => return Err(RejectReason::WrongType),
    };
    if !(0.0..=100.0).contains(&raw) {
        return Err(RejectReason::OutOfRange);
    }
    Ok(raw.round() as u8)
}

// ── Classification and application ───────────────────────────────────────

/// Exact comparison of the title with [`NOT_INVOICE_TITLE`].
pub fn classify(fields: &ExtractedFields) -> Classification {
    if fields.invoice_title.as_deref() == Some(NOT_INVOICE_TITLE) {
        Classification::NotInvoice
    } else {
        Classification::Invoice
    }
}

/// Write `fields` onto `record` and set its status.
///
/// * Not an invoice: title, description, transcription and confidence are
///   taken; every invoice-specific field is nulled. Status `no_invoice`.
/// * Invoice: every present field overwrites, absent fields are kept.
///   Status `processed`. Fails with [`ReconcileError::IncompleteInvoice`]
///   when the result would lack `total` or `currency`; `record` is then
///   left untouched.
///
/// Telemetry and timestamps are the caller's concern.
pub fn apply(
    record: &mut InvoiceRecord,
    fields: &ExtractedFields,
) -> Result<InvoiceStatus, ReconcileError> {
    match classify(fields) {
        Classification::NotInvoice => {
            record.invoice_title = fields.invoice_title.clone();
            record.invoice_description = Some(
                fields
                    .invoice_description
                    .clone()
                    .unwrap_or_else(|| DEFAULT_NO_INVOICE_DESCRIPTION.to_string()),
            );
            record.extracted_text = fields.extracted_text.clone();
            record.confidence = Some(fields.confidence.unwrap_or(0));
            record.clear_invoice_fields();
            record.status = InvoiceStatus::NoInvoice;
            Ok(InvoiceStatus::NoInvoice)
        }
        Classification::Invoice => {
            let mut next = record.clone();
            assign_invoice_fields(&mut next, fields);

            let mut missing = Vec::new();
            if next.total.is_none() {
                missing.push("total");
            }
            if next.currency.is_none() {
                missing.push("currency");
            }
            if !missing.is_empty() {
                return Err(ReconcileError::IncompleteInvoice { missing });
            }

            next.status = InvoiceStatus::Processed;
            *record = next;
            Ok(InvoiceStatus::Processed)
        }
    }
}

fn assign_invoice_fields(record: &mut InvoiceRecord, f: &ExtractedFields) {
    fn set<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
        if let Some(v) = value {
            *slot = Some(v.clone());
        }
    }

    set(&mut record.invoice_number, &f.invoice_number);
    set(&mut record.invoice_title, &f.invoice_title);
    set(&mut record.invoice_description, &f.invoice_description);
    set(&mut record.invoice_date, &f.invoice_date);

    set(&mut record.sender.company_name, &f.sender_company_name);
    set(&mut record.sender.address, &f.sender_address);
    set(&mut record.sender.email, &f.sender_email);
    set(&mut record.sender.tax_number, &f.sender_tax_number);

    set(&mut record.recipient.company_name, &f.recipient_company_name);
    set(&mut record.recipient.address, &f.recipient_address);
    set(&mut record.recipient.tax_number, &f.recipient_tax_number);

    set(&mut record.subtotal, &f.subtotal);
    set(&mut record.tax_rate, &f.tax_rate);
    set(&mut record.tax_amount, &f.tax_amount);
    set(&mut record.discount, &f.discount);
    set(&mut record.total, &f.total);
    set(&mut record.currency, &f.currency);

    set(&mut record.notes, &f.notes);
    set(&mut record.payment_terms, &f.payment_terms);
    set(&mut record.extracted_text, &f.extracted_text);
    set(&mut record.confidence, &f.confidence);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("test payload must be an object"),
        }
    }

    fn base() -> Value {
        json!({
            "invoice_title": "Restaurant Bill",
            "invoice_description": "Dinner at XYZ",
            "extracted_text": "# XYZ\n\n| Item | Price |\n| --- | --- |\n| Pasta | 27,90 |",
            "confidence": 92,
        })
    }

    fn with(extra: Value) -> Map<String, Value> {
        let mut map = payload(base());
        map.extend(payload(extra));
        map
    }

    fn map_lenient(map: &Map<String, Value>) -> MappedResponse {
        ExtractedFields::from_response(map, &ExtractionSchema::invoice()).unwrap()
    }

    #[test]
    fn maps_declared_fields_with_types() {
        let mapped = map_lenient(&with(json!({
            "invoice_number": "INV-0042",
            "invoice_date": "2026-03-15",
            "sender_company_name": "XYZ GmbH",
            "subtotal": 2345,
            "tax_rate": 1900,
            "total": "27,90",
            "currency": "eur",
        })));
        let f = &mapped.fields;
        assert!(mapped.rejected.is_empty());
        assert_eq!(f.invoice_number.as_deref(), Some("INV-0042"));
        assert_eq!(f.invoice_date, NaiveDate::from_ymd_opt(2026, 3, 15));
        assert_eq!(f.subtotal, Some(2345));
        assert_eq!(f.total, Some(2790));
        assert_eq!(f.currency.as_deref(), Some("EUR"));
        assert_eq!(f.confidence, Some(92));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mapped = map_lenient(&with(json!({ "is_paid": true, "total": 100 })));
        assert_eq!(
            mapped.rejected,
            vec![RejectedField {
                key: "is_paid".into(),
                reason: RejectReason::UnknownField
            }]
        );
        assert_eq!(mapped.fields.total, Some(100));
    }

    #[test]
    fn null_and_not_applicable_mean_absent() {
        let mapped = map_lenient(&with(json!({
            "invoice_number": "N/A",
            "invoice_date": null,
            "total": "n/a",
            "notes": "",
        })));
        assert!(mapped.rejected.is_empty());
        assert!(mapped.fields.invoice_number.is_none());
        assert!(mapped.fields.invoice_date.is_none());
        assert!(mapped.fields.total.is_none());
        assert!(mapped.fields.notes.is_none());
    }

    #[test]
    fn float_amounts_are_converted_not_multiplied() {
        let mapped = map_lenient(&with(json!({ "total": 27.9, "tax_amount": 5.3 })));
        assert_eq!(mapped.fields.total, Some(2790));
        assert_eq!(mapped.fields.tax_amount, Some(530));
    }

    #[test]
    fn whole_float_and_quoted_amounts_agree() {
        let reply: Value =
            serde_json::from_str(r#"{"total": 27.00, "subtotal": "27.00", "tax_amount": "$1,234"}"#)
                .unwrap();
        let mapped = map_lenient(&with(reply));
        assert_eq!(mapped.fields.total, Some(2700));
        assert_eq!(mapped.fields.subtotal, Some(2700));
        assert_eq!(mapped.fields.tax_amount, Some(123400));
    }

    #[test]
    fn out_of_range_amount_is_wrong_type() {
        let reply: Value = serde_json::from_str(r#"{"total": 1e300}"#).unwrap();
        let mapped = map_lenient(&with(reply));
        assert_eq!(mapped.fields.total, None);
        assert_eq!(
            mapped.rejected,
            vec![RejectedField {
                key: "total".into(),
                reason: RejectReason::WrongType
            }]
        );
    }

    #[test]
    fn discount_is_made_absolute() {
        let mapped = map_lenient(&with(json!({ "discount": -500 })));
        assert_eq!(mapped.fields.discount, Some(500));
    }

    #[test]
    fn bad_dates_are_dropped() {
        let mapped = map_lenient(&with(json!({ "invoice_date": "15/03/2026" })));
        assert!(mapped.fields.invoice_date.is_none());
        assert_eq!(mapped.rejected[0].reason, RejectReason::InvalidDate);
    }

    #[test]
    fn wrong_types_are_dropped() {
        let mapped = map_lenient(&with(json!({ "total": true, "notes": ["a"] })));
        assert!(mapped.fields.total.is_none());
        assert!(mapped.fields.notes.is_none());
        assert_eq!(mapped.rejected.len(), 2);
        assert!(mapped
            .rejected
            .iter()
            .all(|r| r.reason == RejectReason::WrongType));
    }

    #[test]
    fn confidence_outside_range_is_flagged() {
        let mapped = map_lenient(&with(json!({ "confidence": 140 })));
        assert!(mapped.fields.confidence.is_none());
        assert!(mapped.confidence_flagged());

        let mapped = map_lenient(&with(json!({ "confidence": -1 })));
        assert!(mapped.confidence_flagged());

        let mapped = map_lenient(&with(json!({ "confidence": 87.6 })));
        assert_eq!(mapped.fields.confidence, Some(88));
    }

    #[test]
    fn missing_required_fields_fail() {
        let mut map = payload(base());
        map.remove("extracted_text");
        let err = ExtractedFields::from_response(&map, &ExtractionSchema::invoice()).unwrap_err();
        assert_eq!(
            err,
            ReconcileError::MissingRequired {
                fields: vec!["extracted_text".into()]
            }
        );
    }

    #[test]
    fn null_on_non_nullable_required_field_fails() {
        let map = with(json!({ "confidence": null }));
        assert!(ExtractedFields::from_response(&map, &ExtractionSchema::invoice()).is_err());
    }

    #[test]
    fn strict_variant_requires_keys_but_allows_null() {
        let schema = ExtractionSchema::strict();
        assert!(ExtractedFields::from_response(&payload(base()), &schema).is_err());

        let map = with(json!({
            "invoice_number": null,
            "invoice_date": null,
            "sender_company_name": null,
            "sender_address": null,
            "total": 2790,
            "currency": "EUR",
        }));
        assert!(ExtractedFields::from_response(&map, &schema).is_ok());
    }

    #[test]
    fn transcription_is_cleaned() {
        let mapped = map_lenient(&with(json!({
            "extracted_text": "```markdown\n| A | B |\n| 1 | 2 |\n```"
        })));
        assert_eq!(
            mapped.fields.extracted_text.as_deref(),
            Some("| A | B |\n| --- | --- |\n| 1 | 2 |")
        );
    }

    #[test]
    fn classification_is_exact() {
        let mut f = ExtractedFields {
            invoice_title: Some(NOT_INVOICE_TITLE.to_string()),
            ..Default::default()
        };
        assert_eq!(classify(&f), Classification::NotInvoice);

        f.invoice_title = Some("The image is not an invoice or receipt".to_string());
        assert_eq!(classify(&f), Classification::Invoice);

        f.invoice_title = None;
        assert_eq!(classify(&f), Classification::Invoice);
    }

    #[test]
    fn invoice_branch_overwrites_present_and_keeps_absent() {
        let mut record = InvoiceRecord::new_upload(1, None, "bill.jpg");
        record.notes = Some("keep me".into());

        let mapped = map_lenient(&with(json!({ "total": 2790, "currency": "EUR" })));
        let status = apply(&mut record, &mapped.fields).unwrap();

        assert_eq!(status, InvoiceStatus::Processed);
        assert_eq!(record.status, InvoiceStatus::Processed);
        assert_eq!(record.total, Some(2790));
        assert_eq!(record.notes.as_deref(), Some("keep me"));
        assert_eq!(record.invoice_title.as_deref(), Some("Restaurant Bill"));
        assert!(record.check_invariants().is_empty());
    }

    #[test]
    fn incomplete_invoice_leaves_record_untouched() {
        let mut record = InvoiceRecord::new_upload(1, None, "bill.jpg");
        let before = record.clone();

        let mapped = map_lenient(&with(json!({ "total": 2790 })));
        let err = apply(&mut record, &mapped.fields).unwrap_err();

        assert_eq!(
            err,
            ReconcileError::IncompleteInvoice {
                missing: vec!["currency"]
            }
        );
        assert_eq!(record, before);
    }

    #[test]
    fn not_invoice_branch_nulls_financial_fields() {
        let mut record = InvoiceRecord::new_upload(1, None, "cat.jpg");
        record.total = Some(999);
        record.currency = Some("USD".into());
        record.sender.company_name = Some("Stale Co".into());

        let mapped = map_lenient(&payload(json!({
            "invoice_title": NOT_INVOICE_TITLE,
            "invoice_description": "A photograph of a cat",
            "extracted_text": "image: a cat on a sofa",
            "confidence": 95,
            "invoice_number": "N/A",
            "total": 0,
            "subtotal": 0,
            "currency": "N/A",
        })));
        let status = apply(&mut record, &mapped.fields).unwrap();

        assert_eq!(status, InvoiceStatus::NoInvoice);
        assert_eq!(record.invoice_description.as_deref(), Some("A photograph of a cat"));
        assert_eq!(record.extracted_text.as_deref(), Some("image: a cat on a sofa"));
        assert_eq!(record.confidence, Some(95));
        for (name, value) in record.amounts() {
            assert!(value.is_none(), "{name} should be null");
        }
        assert!(record.currency.is_none());
        assert!(record.sender.is_empty());
        assert!(record.check_invariants().is_empty());
    }

    #[test]
    fn not_invoice_branch_defaults() {
        let mut record = InvoiceRecord::new_upload(1, None, "x.png");
        let fields = ExtractedFields {
            invoice_title: Some(NOT_INVOICE_TITLE.to_string()),
            ..Default::default()
        };
        apply(&mut record, &fields).unwrap();
        assert_eq!(
            record.invoice_description.as_deref(),
            Some(DEFAULT_NO_INVOICE_DESCRIPTION)
        );
        assert_eq!(record.confidence, Some(0));
    }
}
