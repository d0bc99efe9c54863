//! The persisted record for one uploaded document.
//!
//! A record is created at upload time with status [`InvoiceStatus::Uploaded`]
//! and every extracted field empty. An extraction job mutates it exactly once,
//! moving it to [`InvoiceStatus::Processed`] or [`InvoiceStatus::NoInvoice`].
//! The remaining statuses belong to the downstream invoice lifecycle (sent,
//! paid, …) and are never set by this crate.
//!
//! All amounts are integers in minor units (cents). See [`crate::money`].

use crate::store::AssetRef;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Stored, waiting for (or stuck in) extraction.
    #[default]
    Uploaded,
    /// The model recognised an invoice/receipt and its data was stored.
    Processed,
    /// Not an invoice, or the model call failed.
    NoInvoice,
    Sent,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub const ALL: [InvoiceStatus; 7] = [
        InvoiceStatus::Uploaded,
        InvoiceStatus::Processed,
        InvoiceStatus::NoInvoice,
        InvoiceStatus::Sent,
        InvoiceStatus::Paid,
        InvoiceStatus::Overdue,
        InvoiceStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Uploaded => "uploaded",
            InvoiceStatus::Processed => "processed",
            InvoiceStatus::NoInvoice => "no_invoice",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    /// Human-readable label for list views.
    pub fn label(&self) -> &'static str {
        match self {
            InvoiceStatus::Uploaded => "Uploaded",
            InvoiceStatus::Processed => "Processed",
            InvoiceStatus::NoInvoice => "No invoice",
            InvoiceStatus::Sent => "Sent",
            InvoiceStatus::Paid => "Paid",
            InvoiceStatus::Overdue => "Overdue",
            InvoiceStatus::Cancelled => "Cancelled",
        }
    }

    /// Badge colour hint for the UI layer.
    pub fn color(&self) -> &'static str {
        match self {
            InvoiceStatus::Uploaded => "blue",
            InvoiceStatus::Processed => "green",
            InvoiceStatus::NoInvoice => "gray",
            InvoiceStatus::Sent => "blue",
            InvoiceStatus::Paid => "green",
            InvoiceStatus::Overdue => "red",
            InvoiceStatus::Cancelled => "yellow",
        }
    }

    /// `true` for the two terminal outcomes of extraction.
    pub fn is_extraction_outcome(&self) -> bool {
        matches!(self, InvoiceStatus::Processed | InvoiceStatus::NoInvoice)
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InvoiceStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown invoice status '{s}'"))
    }
}

/// Which binary asset an extraction read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rendition {
    Original,
    VisionOptimized,
}

impl Rendition {
    /// Conversion name in the asset store; `None` for the original.
    pub fn conversion_name(&self) -> Option<&'static str> {
        match self {
            Rendition::Original => None,
            Rendition::VisionOptimized => Some(crate::VISION_OPTIMIZED),
        }
    }
}

impl fmt::Display for Rendition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rendition::Original => f.write_str("original"),
            Rendition::VisionOptimized => f.write_str(crate::VISION_OPTIMIZED),
        }
    }
}

/// Sender or recipient of an invoice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub company_name: Option<String>,
    pub address: Option<String>,
    pub email: Option<String>,
    pub tax_number: Option<String>,
}

impl Party {
    pub fn is_empty(&self) -> bool {
        self.company_name.is_none()
            && self.address.is_none()
            && self.email.is_none()
            && self.tax_number.is_none()
    }
}

/// Usage reported by the model call that produced the record's data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTelemetry {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub model: Option<String>,
}

/// One uploaded document and, once extracted, its invoice data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: Uuid,
    pub user_id: i64,
    /// Personal uploads carry no team.
    pub team_id: Option<i64>,
    pub filename: String,
    pub asset: Option<AssetRef>,
    pub status: InvoiceStatus,

    pub invoice_number: Option<String>,
    pub invoice_title: Option<String>,
    pub invoice_description: Option<String>,
    pub invoice_date: Option<NaiveDate>,

    pub sender: Party,
    pub recipient: Party,

    // Minor units; tax_rate in hundredths of a percent (1900 = 19 %).
    pub subtotal: Option<i64>,
    pub tax_rate: Option<i64>,
    pub tax_amount: Option<i64>,
    pub discount: Option<i64>,
    pub total: Option<i64>,
    pub currency: Option<String>,

    pub notes: Option<String>,
    pub payment_terms: Option<String>,
    /// Full-page transcription in Markdown.
    pub extracted_text: Option<String>,
    /// 0–100.
    pub confidence: Option<u8>,

    pub telemetry: ModelTelemetry,
    pub extraction_source: Option<Rendition>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl InvoiceRecord {
    /// A freshly uploaded record: status `uploaded`, nothing extracted.
    pub fn new_upload(user_id: i64, team_id: Option<i64>, filename: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            team_id,
            filename: filename.into(),
            asset: None,
            status: InvoiceStatus::Uploaded,
            invoice_number: None,
            invoice_title: None,
            invoice_description: None,
            invoice_date: None,
            sender: Party::default(),
            recipient: Party::default(),
            subtotal: None,
            tax_rate: None,
            tax_amount: None,
            discount: None,
            total: None,
            currency: None,
            notes: None,
            payment_terms: None,
            extracted_text: None,
            confidence: None,
            telemetry: ModelTelemetry::default(),
            extraction_source: None,
            created_at: now,
            updated_at: now,
            paid_at: None,
        }
    }

    /// Null every invoice-specific field: identity, parties, money, terms.
    ///
    /// Title, description, transcription and confidence are left alone.
    pub fn clear_invoice_fields(&mut self) {
        self.invoice_number = None;
        self.invoice_date = None;
        self.sender = Party::default();
        self.recipient = Party::default();
        self.subtotal = None;
        self.tax_rate = None;
        self.tax_amount = None;
        self.discount = None;
        self.total = None;
        self.currency = None;
        self.notes = None;
        self.payment_terms = None;
    }

    /// Monetary fields in display order.
    pub fn amounts(&self) -> [(&'static str, Option<i64>); 5] {
        [
            ("subtotal", self.subtotal),
            ("tax_rate", self.tax_rate),
            ("tax_amount", self.tax_amount),
            ("discount", self.discount),
            ("total", self.total),
        ]
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Violated data-model invariants, empty when the record is consistent.
    pub fn check_invariants(&self) -> Vec<String> {
        let mut issues = Vec::new();

        match self.status {
            InvoiceStatus::Processed => {
                if self.total.is_none() {
                    issues.push("processed record must carry a total".to_string());
                }
                if self.currency.is_none() {
                    issues.push("processed record must carry a currency".to_string());
                }
            }
            InvoiceStatus::NoInvoice => {
                for (name, value) in self.amounts() {
                    if value.is_some_and(|v| v != 0) {
                        issues.push(format!("no_invoice record must not carry {name}"));
                    }
                }
                if self.currency.is_some() {
                    issues.push("no_invoice record must not carry a currency".to_string());
                }
            }
            _ => {}
        }

        if let Some(c) = self.confidence {
            if c > 100 {
                issues.push(format!("confidence {c} is outside 0..=100"));
            }
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in InvoiceStatus::ALL {
            assert_eq!(status.as_str().parse::<InvoiceStatus>(), Ok(status));
        }
        assert!("draft".parse::<InvoiceStatus>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&InvoiceStatus::NoInvoice).unwrap();
        assert_eq!(json, "\"no_invoice\"");
    }

    #[test]
    fn extraction_outcomes_have_distinct_badges() {
        assert_eq!(InvoiceStatus::Processed.color(), "green");
        assert_eq!(InvoiceStatus::NoInvoice.color(), "gray");
        assert_eq!(InvoiceStatus::Uploaded.color(), "blue");
    }

    #[test]
    fn only_processed_and_no_invoice_are_extraction_outcomes() {
        let outcomes: Vec<_> = InvoiceStatus::ALL
            .into_iter()
            .filter(InvoiceStatus::is_extraction_outcome)
            .collect();
        assert_eq!(
            outcomes,
            vec![InvoiceStatus::Processed, InvoiceStatus::NoInvoice]
        );
    }

    #[test]
    fn new_upload_is_empty() {
        let r = InvoiceRecord::new_upload(7, None, "receipt.jpg");
        assert_eq!(r.status, InvoiceStatus::Uploaded);
        assert!(r.total.is_none());
        assert!(r.extracted_text.is_none());
        assert!(r.sender.is_empty());
        assert_eq!(r.telemetry, ModelTelemetry::default());
        assert!(r.check_invariants().is_empty());
    }

    #[test]
    fn clear_invoice_fields_keeps_descriptive_fields() {
        let mut r = InvoiceRecord::new_upload(1, Some(2), "x.png");
        r.invoice_title = Some("Dinner".into());
        r.extracted_text = Some("# Bill".into());
        r.total = Some(2790);
        r.currency = Some("EUR".into());
        r.sender.company_name = Some("ACME".into());

        r.clear_invoice_fields();

        assert_eq!(r.invoice_title.as_deref(), Some("Dinner"));
        assert_eq!(r.extracted_text.as_deref(), Some("# Bill"));
        assert!(r.total.is_none());
        assert!(r.currency.is_none());
        assert!(r.sender.is_empty());
    }

    #[test]
    fn invariants_flag_processed_without_total() {
        let mut r = InvoiceRecord::new_upload(1, None, "x.png");
        r.status = InvoiceStatus::Processed;
        r.currency = Some("EUR".into());
        let issues = r.check_invariants();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("total"));
    }

    #[test]
    fn invariants_flag_no_invoice_with_amounts() {
        let mut r = InvoiceRecord::new_upload(1, None, "x.png");
        r.status = InvoiceStatus::NoInvoice;
        r.total = Some(100);
        r.currency = Some("USD".into());
        assert_eq!(r.check_invariants().len(), 2);
    }

    #[test]
    fn rendition_conversion_names() {
        assert_eq!(Rendition::Original.conversion_name(), None);
        assert_eq!(
            Rendition::VisionOptimized.conversion_name(),
            Some("vision-optimized")
        );
    }
}
