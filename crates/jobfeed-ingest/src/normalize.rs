//! Raw record -> normalized record, restricted to what the sink can store.

use std::collections::BTreeMap;

use jobfeed_core::{
    is_identity_field, FieldValue, NormalizedRecord, RawRecord, RejectedRecord, SchemaDescriptor,
    StagedRecord, COMPANY_SLUG, INTERNAL_JOB_ID,
};
use serde_json::Value as JsonValue;

use crate::coerce::{coerce, passthrough};

pub const MISSING_IDENTITY_FIELDS: &str = "missing identity fields";

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    payload_column: Option<String>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps fields the schema does not model under `column` as one JSON object,
    /// provided the schema declares that column.
    pub fn preserving_payload(column: impl Into<String>) -> Self {
        Self {
            payload_column: Some(column.into()),
        }
    }

    pub fn payload_column(&self) -> Option<&str> {
        self.payload_column.as_deref()
    }

    /// Without a schema every field passes through unfiltered as text or JSON.
    pub fn normalize(
        &self,
        position: u64,
        mut raw: RawRecord,
        schema: Option<&SchemaDescriptor>,
    ) -> Result<StagedRecord, RejectedRecord> {
        let company_slug = raw.remove(COMPANY_SLUG).and_then(identity_value);
        let internal_job_id = raw.remove(INTERNAL_JOB_ID).and_then(identity_value);

        let (Some(company_slug), Some(internal_job_id)) = (company_slug.clone(), internal_job_id.clone())
        else {
            return Err(RejectedRecord {
                company_slug,
                internal_job_id,
                ..RejectedRecord::new(position, MISSING_IDENTITY_FIELDS)
            });
        };

        let fields = match schema {
            Some(schema) => self.restrict(raw, schema),
            None => raw
                .into_iter()
                .map(|(name, value)| {
                    let value = passthrough(&value);
                    (name, value)
                })
                .collect(),
        };

        Ok(StagedRecord {
            position,
            record: NormalizedRecord {
                company_slug,
                internal_job_id,
                fields,
            },
        })
    }

    fn restrict(&self, raw: RawRecord, schema: &SchemaDescriptor) -> BTreeMap<String, FieldValue> {
        let payload_column = self
            .payload_column
            .as_deref()
            .filter(|column| schema.contains(column) && !is_identity_field(column));

        let mut fields = BTreeMap::new();
        let mut unmodeled = serde_json::Map::new();

        for (name, value) in raw {
            match schema.kind_of(&name) {
                Some(kind) => {
                    let coerced = coerce(kind, &value);
                    fields.insert(name, coerced);
                }
                None if payload_column.is_some() => {
                    unmodeled.insert(name, value);
                }
                None => {}
            }
        }

        if let Some(column) = payload_column {
            if !unmodeled.is_empty() {
                match fields.get_mut(column) {
                    Some(FieldValue::Json(JsonValue::Object(existing))) => existing.extend(unmodeled),
                    Some(FieldValue::Null) | None => {
                        fields.insert(column.to_string(), FieldValue::Json(JsonValue::Object(unmodeled)));
                    }
                    // The record set the column to a non-object itself; keep its value.
                    Some(_) => {}
                }
            }
        }
        fields
    }
}

/// Identity values must be non-blank scalars; numbers are accepted as their text form.
fn identity_value(raw: JsonValue) -> Option<String> {
    match raw {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobfeed_core::FieldKind;
    use serde_json::json;

    fn raw(value: JsonValue) -> RawRecord {
        match value {
            JsonValue::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn schema() -> SchemaDescriptor {
        [
            (COMPANY_SLUG, FieldKind::Text),
            (INTERNAL_JOB_ID, FieldKind::Text),
            ("title", FieldKind::Text),
            ("salary_min", FieldKind::Number),
            ("remote", FieldKind::Boolean),
            ("departments", FieldKind::Json),
            ("raw_payload", FieldKind::Json),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn restricts_to_schema_and_coerces() {
        let schema = schema();
        let staged = Normalizer::new()
            .normalize(
                7,
                raw(json!({
                    "company_slug": " acme ",
                    "internal_job_id": 1234,
                    "title": "Engineer",
                    "salary_min": "90000",
                    "remote": "yes",
                    "departments": "Eng|Data",
                    "recruiter_email": "someone@example.com"
                })),
                Some(&schema),
            )
            .expect("valid record");

        assert_eq!(staged.position, 7);
        assert_eq!(staged.record.identity(), ("acme", "1234"));
        let fields = &staged.record.fields;
        assert_eq!(fields["salary_min"], FieldValue::Number(90000.0));
        assert_eq!(fields["remote"], FieldValue::Boolean(true));
        assert_eq!(fields["departments"], FieldValue::Json(json!(["Eng", "Data"])));
        assert!(!fields.contains_key("recruiter_email"));
        assert!(fields.keys().all(|k| schema.contains(k)));
    }

    #[test]
    fn missing_or_blank_identity_is_rejected_with_safe_summary() {
        let schema = schema();
        let rejected = Normalizer::new()
            .normalize(
                3,
                raw(json!({"company_slug": "acme", "internal_job_id": "   ", "title": "secret"})),
                Some(&schema),
            )
            .unwrap_err();

        assert_eq!(rejected.position, 3);
        assert_eq!(rejected.reason, MISSING_IDENTITY_FIELDS);
        assert_eq!(rejected.company_slug.as_deref(), Some("acme"));
        assert_eq!(rejected.internal_job_id, None);
        assert_eq!(rejected.excerpt, None);

        let rejected = Normalizer::new()
            .normalize(4, raw(json!({"title": "no identity"})), None)
            .unwrap_err();
        assert_eq!(rejected.reason, MISSING_IDENTITY_FIELDS);
    }

    #[test]
    fn payload_mode_keeps_unmodeled_fields() {
        let schema = schema();
        let staged = Normalizer::preserving_payload("raw_payload")
            .normalize(
                1,
                raw(json!({
                    "company_slug": "acme",
                    "internal_job_id": "1",
                    "title": "Engineer",
                    "recruiter": {"name": "Sam"},
                    "tags": ["a"]
                })),
                Some(&schema),
            )
            .unwrap();

        assert_eq!(
            staged.record.fields["raw_payload"],
            FieldValue::Json(json!({"recruiter": {"name": "Sam"}, "tags": ["a"]}))
        );
        assert!(!staged.record.fields.contains_key("recruiter"));
    }

    #[test]
    fn payload_column_unknown_to_schema_drops_extras() {
        let schema: SchemaDescriptor = [(COMPANY_SLUG, FieldKind::Text), (INTERNAL_JOB_ID, FieldKind::Text)]
            .into_iter()
            .collect();
        let staged = Normalizer::preserving_payload("raw_payload")
            .normalize(1, raw(json!({"company_slug": "a", "internal_job_id": "1", "x": 1})), Some(&schema))
            .unwrap();
        assert!(staged.record.fields.is_empty());
    }

    #[test]
    fn without_schema_everything_passes_through() {
        let staged = Normalizer::new()
            .normalize(
                1,
                raw(json!({
                    "company_slug": "acme",
                    "internal_job_id": "1",
                    "anything": 5,
                    "nested": {"k": "v"},
                    "blank": ""
                })),
                None,
            )
            .unwrap();

        let fields = &staged.record.fields;
        assert_eq!(fields["anything"], FieldValue::Text("5".into()));
        assert_eq!(fields["nested"], FieldValue::Json(json!({"k": "v"})));
        assert_eq!(fields["blank"], FieldValue::Null);
    }
}
