//! The structured-output contract sent to the extraction model.
//!
//! [`ExtractionSchema`] lists every field the model may return, with its
//! type, nullability and a description that doubles as formatting
//! instructions (dates as `YYYY-MM-DD`, amounts as minor units, …). The
//! reconciler reads responses through the same catalogue, so a key that is
//! not declared here is never written to a record.
//!
//! Only four fields are guaranteed in the lenient variant: `invoice_title`,
//! `invoice_description`, `extracted_text` and `confidence`. Everything else
//! may be missing or null, even when the strict variant asks for it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// JSON type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
}

impl FieldKind {
    fn json_type(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
        }
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: FieldKind,
    pub nullable: bool,
}

impl FieldSpec {
    const fn string(name: &'static str, description: &'static str, nullable: bool) -> Self {
        Self {
            name,
            description,
            kind: FieldKind::String,
            nullable,
        }
    }

    const fn number(name: &'static str, description: &'static str, nullable: bool) -> Self {
        Self {
            name,
            description,
            kind: FieldKind::Number,
            nullable,
        }
    }
}

/// Which required-field set to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVariant {
    /// Title, description, transcription and confidence only. (default)
    #[default]
    Lenient,
    /// Lenient plus invoice number, date, sender identity, total and currency.
    Strict,
}

/// Fields every variant requires.
pub const ALWAYS_REQUIRED: [&str; 4] = [
    "invoice_title",
    "invoice_description",
    "extracted_text",
    "confidence",
];

/// Additional fields the strict variant requires.
pub const STRICT_REQUIRED: [&str; 6] = [
    "invoice_number",
    "invoice_date",
    "sender_company_name",
    "sender_address",
    "total",
    "currency",
];

const FIELDS: &[FieldSpec] = &[
    // Invoice details
    FieldSpec::string(
        "invoice_number",
        "The invoice number from the document. If you cannot find it, use \"N/A\"",
        true,
    ),
    FieldSpec::string(
        "invoice_title",
        "The main subject of the invoice/receipt in 1-3 words. Format should be a noun or noun phrase like \"Office Supplies\", \"Restaurant Bill\", \"Software License\", etc",
        false,
    ),
    FieldSpec::string(
        "invoice_description",
        "A short description of the invoice/receipt. Format should be a sentence or two describing the purpose of the invoice/receipt. For example, \"Paper for printer\", \"Dinner at XYZ\", \"Adobe Photoshop subscription\", etc",
        false,
    ),
    FieldSpec::string(
        "invoice_date",
        "The date of the invoice/receipt. Format should be YYYY-MM-DD. For example, \"2023-03-15\"",
        true,
    ),
    // Sender details
    FieldSpec::string(
        "sender_company_name",
        "The name of the company or individual sending the invoice/receipt.",
        true,
    ),
    FieldSpec::string(
        "sender_address",
        "The address of the sender. Format should be a full address including street, city, state, and zip code. For example, \"123 Main St, Springfield, IL 62701\"",
        true,
    ),
    FieldSpec::string(
        "sender_email",
        "The email address of the sender.",
        true,
    ),
    FieldSpec::string(
        "sender_tax_number",
        "The tax/VAT identification number of the sender. Format should be a string of numbers and letters. For example, \"AB123456789\"",
        true,
    ),
    // Recipient details
    FieldSpec::string(
        "recipient_company_name",
        "The name of the company or individual receiving the invoice/receipt.",
        true,
    ),
    FieldSpec::string(
        "recipient_address",
        "The address of the recipient. Format should be a full address including street, city, state, and zip code. For example, \"456 Elm St, Springfield, IL 62701\"",
        true,
    ),
    FieldSpec::string(
        "recipient_tax_number",
        "The tax/VAT identification number of the recipient. Format should be a string of numbers and letters. For example, \"CD987654321\"",
        true,
    ),
    // Financial details
    FieldSpec::number(
        "subtotal",
        "The subtotal amount before tax and discounts. Format should be a number without decimal places. e.g., \"1000\" for $10.00, \"2790\" for $27.90",
        true,
    ),
    FieldSpec::number(
        "tax_rate",
        "The tax rate applied to the subtotal. Format should be a number without decimal places. e.g., \"1900\" for 19%, \"500\" for 5%",
        true,
    ),
    FieldSpec::number(
        "tax_amount",
        "The total tax amount applied to the subtotal. Format should be a number without decimal places. e.g., \"190\" for $1.90, \"500\" for $5.00",
        true,
    ),
    FieldSpec::number(
        "discount",
        "The total discount amount applied to the subtotal. The value must be a positive integer (no decimal places). If the extracted value is negative, it should be converted to its absolute positive equivalent. For example, \"100\" for $1.00, and if \"-$5.00\" is extracted, it should be represented as \"500\".",
        true,
    ),
    FieldSpec::number(
        "total",
        "The total amount after tax and discounts. Format should be a number without decimal places. e.g., \"1000\" for $10.00, \"2790\" for $27.90",
        true,
    ),
    FieldSpec::string(
        "currency",
        "The currency of the amounts. Format should be a 3-letter ISO 4217 currency code. For example, \"USD\" for US dollars, \"EUR\" for euros",
        true,
    ),
    // Additional information
    FieldSpec::string(
        "notes",
        "Any additional notes or comments on the invoice/receipt.",
        true,
    ),
    FieldSpec::string(
        "payment_terms",
        "The payment terms and conditions. Format should be a string describing the payment terms. For example, \"Net 30 days\", \"Due on receipt\", etc",
        true,
    ),
    // Full text extraction
    FieldSpec::string(
        "extracted_text",
        "The full text extracted from the invoice/receipt in markdown format. This is the raw text extracted from the image. Format should be a string containing the full text, tables and formatting.",
        false,
    ),
    // Confidence score
    FieldSpec::number(
        "confidence",
        "The confidence score of the OCR process. How confident is the AI that the extracted data is correct? 0 means not confident at all, 100 means very confident. Format should be a number between 0 and 100.",
        false,
    ),
];

/// The field catalogue plus the required-field set of one variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub variant: SchemaVariant,
    pub fields: &'static [FieldSpec],
    pub required: Vec<&'static str>,
}

impl ExtractionSchema {
    /// Lenient invoice schema: only the four universal fields are required.
    pub fn invoice() -> Self {
        Self::for_variant(SchemaVariant::Lenient)
    }

    /// Strict invoice schema: identity, date, sender, total and currency required too.
    pub fn strict() -> Self {
        Self::for_variant(SchemaVariant::Strict)
    }

    pub fn for_variant(variant: SchemaVariant) -> Self {
        let mut required: Vec<&'static str> = ALWAYS_REQUIRED.to_vec();
        if variant == SchemaVariant::Strict {
            required.extend(STRICT_REQUIRED);
        }
        Self {
            name: "Invoice",
            description: "Schema for invoice processing",
            variant,
            fields: FIELDS,
            required,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.required.contains(&name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.name)
    }

    /// Render as a JSON Schema object.
    ///
    /// Nullable fields get a `[type, "null"]` union. Unknown keys are
    /// disallowed with `additionalProperties: false`.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for field in self.fields {
            let ty = if field.nullable {
                json!([field.kind.json_type(), "null"])
            } else {
                json!(field.kind.json_type())
            };
            properties.insert(
                field.name.to_string(),
                json!({ "type": ty, "description": field.description }),
            );
        }

        json!({
            "title": self.name,
            "description": self.description,
            "type": "object",
            "properties": properties,
            "required": self.required,
            "additionalProperties": false,
        })
    }
}

impl Default for ExtractionSchema {
    fn default() -> Self {
        Self::invoice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_requires_exactly_the_universal_fields() {
        let schema = ExtractionSchema::invoice();
        assert_eq!(schema.required, ALWAYS_REQUIRED.to_vec());
        assert!(!schema.is_required("total"));
        assert!(schema.is_required("confidence"));
    }

    #[test]
    fn strict_adds_identity_and_totals() {
        let schema = ExtractionSchema::strict();
        for name in ALWAYS_REQUIRED.iter().chain(STRICT_REQUIRED.iter()) {
            assert!(schema.is_required(name), "{name} should be required");
        }
        assert!(!schema.is_required("notes"));
    }

    #[test]
    fn every_required_field_is_declared() {
        let schema = ExtractionSchema::strict();
        for name in &schema.required {
            assert!(schema.contains(name), "{name} missing from catalogue");
        }
    }

    #[test]
    fn field_names_are_unique() {
        let schema = ExtractionSchema::invoice();
        let mut names: Vec<_> = schema.field_names().collect();
        let before = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), before);
        assert_eq!(before, 21);
    }

    #[test]
    fn universal_fields_are_not_nullable() {
        let schema = ExtractionSchema::invoice();
        for name in ALWAYS_REQUIRED {
            assert!(!schema.field(name).unwrap().nullable, "{name}");
        }
    }

    #[test]
    fn amount_descriptions_carry_minor_unit_examples() {
        let schema = ExtractionSchema::invoice();
        assert!(schema.field("total").unwrap().description.contains("\"2790\" for $27.90"));
        assert!(schema.field("tax_rate").unwrap().description.contains("\"1900\" for 19%"));
        assert!(schema.field("discount").unwrap().description.contains("absolute"));
    }

    #[test]
    fn json_schema_shape() {
        let value = ExtractionSchema::invoice().to_json_schema();
        assert_eq!(value["type"], "object");
        assert_eq!(value["additionalProperties"], false);
        assert_eq!(value["properties"]["total"]["type"], json!(["number", "null"]));
        assert_eq!(value["properties"]["invoice_title"]["type"], json!("string"));
        assert_eq!(value["required"].as_array().unwrap().len(), 4);
    }
}
