//! Mapping Resolver
//!
//! A mapping specification describes how one source's payload shape becomes
//! a canonical row: key renames, defaults for absent target fields, per-field
//! type coercions, and the required-field set. Mappings are versioned
//! external configuration, loaded once at startup and read-only afterwards —
//! never shared mutable state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

/// Declared type a coerced field must end up as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Date,
    Integer,
    Decimal,
    Text,
}

/// How one source's records map onto canonical rows.
///
/// BTreeMaps keep iteration order stable so transform behaviour is
/// deterministic for a given spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingSpec {
    /// Source tag this spec applies to.
    pub source: String,
    /// Config version, carried into run parameter snapshots.
    pub version: String,
    /// Source key -> canonical key renames, applied first.
    pub renames: BTreeMap<String, String>,
    /// Values filled in for absent target fields, applied after renames.
    pub defaults: BTreeMap<String, serde_json::Value>,
    /// Declared type per target field, applied after defaults.
    pub coercions: BTreeMap<String, FieldType>,
    /// Target fields that must be present after defaults.
    pub required: BTreeSet<String>,
}

impl MappingSpec {
    /// The canonical coercion set every sales mapping shares.
    fn canonical_coercions() -> BTreeMap<String, FieldType> {
        BTreeMap::from([
            ("sku".to_string(), FieldType::Text),
            ("date".to_string(), FieldType::Date),
            ("units_sold".to_string(), FieldType::Integer),
            ("price".to_string(), FieldType::Decimal),
            ("revenue".to_string(), FieldType::Decimal),
        ])
    }

    fn canonical_required() -> BTreeSet<String> {
        BTreeSet::from([
            "sku".to_string(),
            "date".to_string(),
            "units_sold".to_string(),
            "price".to_string(),
        ])
    }

    /// Spec for API uploads: near-canonical keys plus the common aliases
    /// seen in upstream exports (productID, quantity, unit_price).
    pub fn api_default() -> Self {
        Self {
            source: "api".to_string(),
            version: "1.0".to_string(),
            renames: BTreeMap::from([
                ("product_id".to_string(), "sku".to_string()),
                ("productID".to_string(), "sku".to_string()),
                ("quantity".to_string(), "units_sold".to_string()),
                ("unit_price".to_string(), "price".to_string()),
            ]),
            defaults: BTreeMap::new(),
            coercions: Self::canonical_coercions(),
            required: Self::canonical_required(),
        }
    }

    /// Spec for legacy point-of-sale exports with short field names and a
    /// zero-units default for days the terminal reported no sales line.
    pub fn legacy_pos() -> Self {
        Self {
            source: "legacy_pos".to_string(),
            version: "1.0".to_string(),
            renames: BTreeMap::from([
                ("item_code".to_string(), "sku".to_string()),
                ("day".to_string(), "date".to_string()),
                ("qty".to_string(), "units_sold".to_string()),
                ("sale_price".to_string(), "price".to_string()),
            ]),
            defaults: BTreeMap::from([(
                "units_sold".to_string(),
                serde_json::Value::from(0),
            )]),
            coercions: Self::canonical_coercions(),
            required: Self::canonical_required(),
        }
    }

    /// Spec used by the synthetic generator; payloads are already canonical.
    pub fn synthetic() -> Self {
        Self {
            source: "synthetic".to_string(),
            version: "1.0".to_string(),
            renames: BTreeMap::new(),
            defaults: BTreeMap::new(),
            coercions: Self::canonical_coercions(),
            required: Self::canonical_required(),
        }
    }
}

/// No mapping registered for a source tag. Structural: fails the batch for
/// that source, leaves every other source untouched.
#[derive(Debug, Clone)]
pub enum MappingError {
    UnknownSource(String),
}

impl std::fmt::Display for MappingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownSource(source) => {
                write!(f, "unknown_source: no mapping registered for '{}'", source)
            }
        }
    }
}

impl std::error::Error for MappingError {}

/// Read-only registry of mapping specs keyed by source tag.
#[derive(Debug, Clone)]
pub struct MappingRegistry {
    specs: HashMap<String, MappingSpec>,
}

impl MappingRegistry {
    /// The built-in specs every deployment carries.
    pub fn builtin() -> Self {
        let mut specs = HashMap::new();
        for spec in [
            MappingSpec::api_default(),
            MappingSpec::legacy_pos(),
            MappingSpec::synthetic(),
        ] {
            specs.insert(spec.source.clone(), spec);
        }
        Self { specs }
    }

    /// Built-ins plus externally supplied specs from a JSON file
    /// (an array of MappingSpec objects). File entries override built-ins
    /// with the same source tag.
    pub fn with_config_file(path: &Path) -> anyhow::Result<Self> {
        let mut registry = Self::builtin();
        let text = std::fs::read_to_string(path)?;
        let extra: Vec<MappingSpec> = serde_json::from_str(&text)?;
        for spec in extra {
            registry.specs.insert(spec.source.clone(), spec);
        }
        Ok(registry)
    }

    pub fn resolve(&self, source: &str) -> Result<&MappingSpec, MappingError> {
        self.specs
            .get(source)
            .ok_or_else(|| MappingError::UnknownSource(source.to_string()))
    }

    pub fn sources(&self) -> Vec<&str> {
        self.specs.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_builtin_sources() {
        let registry = MappingRegistry::builtin();
        assert!(registry.resolve("api").is_ok());
        assert!(registry.resolve("legacy_pos").is_ok());
        assert!(registry.resolve("synthetic").is_ok());
    }

    #[test]
    fn unknown_source_is_typed() {
        let registry = MappingRegistry::builtin();
        let err = registry.resolve("ancient_erp").unwrap_err();
        assert!(matches!(err, MappingError::UnknownSource(ref s) if s == "ancient_erp"));
        assert!(err.to_string().starts_with("unknown_source"));
    }

    #[test]
    fn config_file_overrides_builtin() {
        let mut spec = MappingSpec::api_default();
        spec.version = "2.0".to_string();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), serde_json::to_string(&vec![spec]).unwrap()).unwrap();

        let registry = MappingRegistry::with_config_file(file.path()).unwrap();
        assert_eq!(registry.resolve("api").unwrap().version, "2.0");
        // Built-ins not named in the file survive.
        assert!(registry.resolve("legacy_pos").is_ok());
    }
}
