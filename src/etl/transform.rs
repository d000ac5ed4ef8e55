//! Transform Engine
//!
//! Pure function from (raw payload, mapping spec) to either a canonical row
//! or a classified error. No I/O, no side effects: unit-testable against
//! literal input/mapping/expected-output triples.
//!
//! Steps run in a fixed order so results are deterministic:
//! rename -> defaults -> coercion -> required check -> domain validation.

use super::mapping::{FieldType, MappingSpec};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A validated, type-coerced sales observation ready for load.
/// Product identity is the SKU; the loader resolves it per organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub sku: String,
    pub date: NaiveDate,
    pub units_sold: i64,
    pub price: f64,
    pub revenue: f64,
}

/// Row-level transform failure. Isolated per record: recorded against the
/// originating raw record, never aborts the batch.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformError {
    /// Payload was not a JSON object.
    MalformedPayload,
    /// A field failed coercion to its declared type.
    Coercion { field: String, detail: String },
    /// A required field was absent after renames and defaults.
    MissingField { field: String },
    /// A numeric field violated the non-negativity domain rule.
    Domain { field: String, reason: String },
}

impl TransformError {
    /// Stable reason code, recorded on the raw record.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedPayload => "malformed_payload",
            Self::Coercion { .. } => "coercion_error",
            Self::MissingField { .. } => "missing_field",
            Self::Domain { .. } => "domain_validation",
        }
    }
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedPayload => write!(f, "malformed_payload: payload is not an object"),
            Self::Coercion { field, detail } => {
                write!(f, "coercion_error: field '{}': {}", field, detail)
            }
            Self::MissingField { field } => {
                write!(f, "missing_field: required field '{}' is absent", field)
            }
            Self::Domain { field, reason } => {
                write!(f, "domain_validation: field '{}': {}", field, reason)
            }
        }
    }
}

impl std::error::Error for TransformError {}

/// A field value after coercion to its declared type.
#[derive(Debug, Clone, PartialEq)]
enum Coerced {
    Date(NaiveDate),
    Integer(i64),
    Decimal(f64),
    Text(String),
}

fn coerce(field: &str, value: &serde_json::Value, ty: FieldType) -> Result<Coerced, TransformError> {
    let fail = |detail: String| TransformError::Coercion {
        field: field.to_string(),
        detail,
    };
    match ty {
        FieldType::Date => {
            let s = value
                .as_str()
                .ok_or_else(|| fail(format!("expected date string, got {}", value)))?;
            // Accept plain dates and ISO datetimes; the calendar day is what matters.
            let day = s.get(..10).unwrap_or(s);
            NaiveDate::parse_from_str(day, "%Y-%m-%d")
                .map(Coerced::Date)
                .map_err(|e| fail(format!("'{}' is not an ISO date: {}", s, e)))
        }
        FieldType::Integer => match value {
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Coerced::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    if f.fract() == 0.0 {
                        Ok(Coerced::Integer(f as i64))
                    } else {
                        Err(fail(format!("{} is not an integer", f)))
                    }
                } else {
                    Err(fail(format!("{} out of integer range", n)))
                }
            }
            serde_json::Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Coerced::Integer)
                .map_err(|e| fail(format!("'{}' is not an integer: {}", s, e))),
            other => Err(fail(format!("expected integer, got {}", other))),
        },
        FieldType::Decimal => {
            let parsed = match value {
                serde_json::Value::Number(n) => n.as_f64(),
                serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            match parsed {
                Some(f) if f.is_finite() => Ok(Coerced::Decimal(f)),
                _ => Err(fail(format!("expected decimal, got {}", value))),
            }
        }
        FieldType::Text => match value {
            serde_json::Value::String(s) => Ok(Coerced::Text(s.clone())),
            serde_json::Value::Number(n) => Ok(Coerced::Text(n.to_string())),
            other => Err(fail(format!("expected text, got {}", other))),
        },
    }
}

/// Apply a mapping to one raw payload.
pub fn transform(
    payload: &serde_json::Value,
    spec: &MappingSpec,
) -> Result<CanonicalRow, TransformError> {
    let obj = payload.as_object().ok_or(TransformError::MalformedPayload)?;

    // 1) Rename keys. Source keys are visited in sorted order and the first
    //    writer of a target key wins, so alias collisions resolve
    //    deterministically.
    let mut fields: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    let sorted: BTreeMap<&String, &serde_json::Value> = obj.iter().collect();
    for (key, value) in sorted {
        let target = spec.renames.get(key.as_str()).unwrap_or(key);
        fields.entry(target.clone()).or_insert_with(|| value.clone());
    }

    // 2) Fill absent target fields from defaults. JSON null counts as absent.
    fields.retain(|_, v| !v.is_null());
    for (key, value) in &spec.defaults {
        fields.entry(key.clone()).or_insert_with(|| value.clone());
    }

    // 3) Coerce each declared field.
    let mut coerced: BTreeMap<String, Coerced> = BTreeMap::new();
    for (field, ty) in &spec.coercions {
        if let Some(value) = fields.get(field) {
            coerced.insert(field.clone(), coerce(field, value, *ty)?);
        }
    }

    // 4) All required fields must have survived.
    for field in &spec.required {
        if !coerced.contains_key(field) {
            return Err(TransformError::MissingField {
                field: field.clone(),
            });
        }
    }

    let sku = match coerced.get("sku") {
        Some(Coerced::Text(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Coerced::Text(_)) => {
            return Err(TransformError::Domain {
                field: "sku".to_string(),
                reason: "sku must be non-empty".to_string(),
            })
        }
        _ => {
            return Err(TransformError::MissingField {
                field: "sku".to_string(),
            })
        }
    };
    let date = match coerced.get("date") {
        Some(Coerced::Date(d)) => *d,
        _ => {
            return Err(TransformError::MissingField {
                field: "date".to_string(),
            })
        }
    };
    let units_sold = match coerced.get("units_sold") {
        Some(Coerced::Integer(i)) => *i,
        _ => {
            return Err(TransformError::MissingField {
                field: "units_sold".to_string(),
            })
        }
    };
    let price = match coerced.get("price") {
        Some(Coerced::Decimal(p)) => *p,
        _ => {
            return Err(TransformError::MissingField {
                field: "price".to_string(),
            })
        }
    };

    // 5) Domain rules: negatives are rejected, never clamped.
    if units_sold < 0 {
        return Err(TransformError::Domain {
            field: "units_sold".to_string(),
            reason: format!("{} is negative", units_sold),
        });
    }
    if price < 0.0 {
        return Err(TransformError::Domain {
            field: "price".to_string(),
            reason: format!("{} is negative", price),
        });
    }

    // Revenue: trust a provided non-negative value, derive otherwise.
    let revenue = match coerced.get("revenue") {
        Some(Coerced::Decimal(r)) => {
            if *r < 0.0 {
                return Err(TransformError::Domain {
                    field: "revenue".to_string(),
                    reason: format!("{} is negative", r),
                });
            }
            *r
        }
        _ => units_sold as f64 * price,
    };

    Ok(CanonicalRow {
        sku,
        date,
        units_sold,
        price,
        revenue,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::mapping::MappingSpec;
    use serde_json::json;

    #[test]
    fn canonical_payload_passes_through() {
        let spec = MappingSpec::api_default();
        let row = transform(
            &json!({"sku": "SKU-1", "date": "2024-03-01", "units_sold": 5, "price": 10.0}),
            &spec,
        )
        .unwrap();
        assert_eq!(row.sku, "SKU-1");
        assert_eq!(row.units_sold, 5);
        assert_eq!(row.price, 10.0);
        assert_eq!(row.revenue, 50.0);
    }

    #[test]
    fn renames_and_string_coercions_apply() {
        let spec = MappingSpec::api_default();
        let row = transform(
            &json!({
                "productID": "SKU-9",
                "date": "2024-03-01T12:30:00Z",
                "quantity": "7",
                "unit_price": "12.5",
                "revenue": 87.5
            }),
            &spec,
        )
        .unwrap();
        assert_eq!(row.sku, "SKU-9");
        assert_eq!(row.date, "2024-03-01".parse().unwrap());
        assert_eq!(row.units_sold, 7);
        assert_eq!(row.price, 12.5);
        assert_eq!(row.revenue, 87.5);
    }

    #[test]
    fn defaults_fill_absent_fields() {
        let spec = MappingSpec::legacy_pos();
        let row = transform(
            &json!({"item_code": "SKU-2", "day": "2024-03-02", "sale_price": 4.0}),
            &spec,
        )
        .unwrap();
        // legacy_pos defaults units_sold to 0 for missing sales lines.
        assert_eq!(row.units_sold, 0);
        assert_eq!(row.revenue, 0.0);
    }

    #[test]
    fn defaults_do_not_override_explicit_zero() {
        let spec = MappingSpec::legacy_pos();
        let row = transform(
            &json!({"item_code": "SKU-2", "day": "2024-03-02", "qty": 3, "sale_price": 4.0}),
            &spec,
        )
        .unwrap();
        assert_eq!(row.units_sold, 3);
    }

    #[test]
    fn coercion_failure_names_the_field() {
        let spec = MappingSpec::api_default();
        let err = transform(
            &json!({"sku": "S", "date": "not-a-date", "units_sold": 1, "price": 1.0}),
            &spec,
        )
        .unwrap_err();
        assert_eq!(err.code(), "coercion_error");
        assert!(matches!(err, TransformError::Coercion { ref field, .. } if field == "date"));
    }

    #[test]
    fn missing_required_field_is_typed() {
        let spec = MappingSpec::api_default();
        let err = transform(&json!({"sku": "S", "date": "2024-01-01", "price": 1.0}), &spec)
            .unwrap_err();
        assert_eq!(err.code(), "missing_field");
        assert!(matches!(err, TransformError::MissingField { ref field } if field == "units_sold"));
    }

    #[test]
    fn negatives_are_rejected_not_clamped() {
        let spec = MappingSpec::api_default();
        let err = transform(
            &json!({"sku": "S", "date": "2024-01-01", "units_sold": -3, "price": 1.0}),
            &spec,
        )
        .unwrap_err();
        assert_eq!(err.code(), "domain_validation");

        let err = transform(
            &json!({"sku": "S", "date": "2024-01-01", "units_sold": 3, "price": -1.0}),
            &spec,
        )
        .unwrap_err();
        assert!(matches!(err, TransformError::Domain { ref field, .. } if field == "price"));
    }

    #[test]
    fn non_object_payload_is_malformed() {
        let spec = MappingSpec::api_default();
        let err = transform(&json!([1, 2, 3]), &spec).unwrap_err();
        assert_eq!(err, TransformError::MalformedPayload);
    }

    #[test]
    fn null_fields_count_as_absent() {
        let spec = MappingSpec::api_default();
        let err = transform(
            &json!({"sku": "S", "date": null, "units_sold": 1, "price": 1.0}),
            &spec,
        )
        .unwrap_err();
        assert!(matches!(err, TransformError::MissingField { ref field } if field == "date"));
    }
}
