//! Substitution engine.
//!
//! Extraction turns a payload into a [`ProcessingCache`]; reconciliation
//! turns the cache into one [`DeviceRow`] per identifier value; a row is then
//! written into a copy of the target template.
//!
//! The identifier path's entry count is the fan-out width `N`. A path with
//! fewer than `N` entries is repaired per device:
//!
//! | entries | repair strategy | device `i` gets |
//! |---------|-----------------|-----------------|
//! | `i < len` | any | entry `i` |
//! | 1 | any | the single entry |
//! | `1 < len < N` | `USE_FIRST_VALUE_OF_ARRAY` | first entry |
//! | `1 < len < N` | `USE_LAST_VALUE_OF_ARRAY` | last entry |
//! | `1 < len < N` | other | arity error for device `i` only |

use serde_json::{json, Value};

use dynmapper_core::model::{CONTEXT_DATA_KEY_NAME, TIME, TOKEN_CONTEXT_DATA, TOKEN_TOPIC_LEVEL};
use dynmapper_core::{path, topic, Mapping, RepairStrategy, SubstituteValue, ValueKind};

use crate::context::ProcessingCache;
use crate::error::ProcessingError;

/// Values picked for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRow {
    pub index: usize,
    pub identifier: SubstituteValue,
    /// `(target path, value)` in target path order, identifier included.
    pub values: Vec<(String, SubstituteValue)>,
}

impl DeviceRow {
    /// Copy of the row with the identifier value replaced.
    pub fn with_identifier(&self, identifier_path: &str, value: SubstituteValue) -> DeviceRow {
        DeviceRow {
            index: self.index,
            identifier: value.clone(),
            values: self
                .values
                .iter()
                .map(|(path, v)| {
                    if path == identifier_path {
                        (path.clone(), value.clone())
                    } else {
                        (path.clone(), v.clone())
                    }
                })
                .collect(),
        }
    }
}

/// Outcome of extracting every substitution of a mapping.
#[derive(Debug, Default)]
pub struct Extraction {
    pub cache: ProcessingCache,
    pub errors: Vec<ProcessingError>,
}

/// Inject `_TOPIC_LEVEL_` and, when the transport carries a message key,
/// `_CONTEXT_DATA_` into an object payload.
pub fn enrich_inbound(payload: &mut Value, topic_name: &str, key: Option<&str>) {
    let Value::Object(map) = payload else {
        return;
    };
    map.insert(TOKEN_TOPIC_LEVEL.to_string(), json!(topic::topic_levels(topic_name)));
    if let Some(key) = key {
        map.insert(TOKEN_CONTEXT_DATA.to_string(), json!({ CONTEXT_DATA_KEY_NAME: key }));
    }
}

/// Evaluate every substitution of `mapping` against `payload`.
///
/// A failing expression yields an extraction error and no entry; a path that
/// selects nothing yields an ignore entry.
pub fn extract(mapping: &Mapping, payload: &Value) -> Extraction {
    let mut extraction = Extraction::default();

    let identifier_first = mapping
        .substitutions
        .iter()
        .filter(|s| s.defines_identifier)
        .chain(mapping.substitutions.iter().filter(|s| !s.defines_identifier));

    for substitution in identifier_first {
        let target = mapping.resolve_target_path(&substitution.path_target);
        let strategy = substitution.repair_strategy;
        let entries = match path::evaluate(payload, &substitution.path_source) {
            Err(e) => {
                extraction.errors.push(ProcessingError::Extraction {
                    path: substitution.path_source.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
            Ok(None) => vec![SubstituteValue::ignore(strategy)],
            Ok(Some(Value::Array(items))) if substitution.expand_array => items
                .into_iter()
                .map(|item| SubstituteValue::new(item, strategy))
                .collect(),
            Ok(Some(value)) => vec![SubstituteValue::new(value, strategy)],
        };
        extraction.cache.entry(target).or_default().extend(entries);
    }
    extraction
}

/// Add the current time when objects of the API carry one and no
/// substitution targets `time`.
pub fn inject_time(mapping: &Mapping, cache: &mut ProcessingCache) {
    if mapping.target_api.has_time() && !cache.contains_key(TIME) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        cache.insert(
            TIME.to_string(),
            vec![SubstituteValue::new(Value::String(now), RepairStrategy::Default)],
        );
    }
}

/// Target path of the identifier substitution, falling back to the API's
/// identifier path.
pub fn identifier_path(mapping: &Mapping) -> String {
    mapping
        .identifier_substitution()
        .map(|s| mapping.resolve_target_path(&s.path_target))
        .unwrap_or_else(|| mapping.target_api.identifier().to_string())
}

/// Pick the entry for device `index` out of `entries` for a fan-out of `width`.
pub fn pick(
    path: &str,
    entries: &[SubstituteValue],
    index: usize,
    width: usize,
) -> Result<Option<SubstituteValue>, ProcessingError> {
    if entries.is_empty() {
        return Ok(None);
    }
    if let Some(entry) = entries.get(index) {
        return Ok(Some(entry.clone()));
    }
    if entries.len() == 1 {
        return Ok(Some(entries[0].clone()));
    }
    match entries[0].repair_strategy {
        RepairStrategy::UseFirstValueOfArray => Ok(Some(entries[0].clone())),
        RepairStrategy::UseLastValueOfArray => Ok(entries.last().cloned()),
        _ => Err(ProcessingError::Arity {
            path: path.to_string(),
            available: entries.len(),
            required: width,
            device_index: index,
        }),
    }
}

/// Build one row per identifier value.
///
/// Fails as a whole only when the identifier path has no entries; arity
/// problems are reported per row.
pub fn reconcile(
    cache: &ProcessingCache,
    identifier_path: &str,
) -> Result<Vec<Result<DeviceRow, ProcessingError>>, ProcessingError> {
    let identifiers = cache
        .get(identifier_path)
        .filter(|entries| !entries.is_empty())
        .ok_or_else(|| ProcessingError::MissingIdentifier(identifier_path.to_string()))?;
    let width = identifiers.len();

    let rows = identifiers
        .iter()
        .enumerate()
        .map(|(index, identifier)| -> Result<DeviceRow, ProcessingError> {
            let mut values = Vec::with_capacity(cache.len());
            for (path, entries) in cache {
                if let Some(value) = pick(path, entries, index, width)? {
                    values.push((path.clone(), value));
                }
            }
            Ok(DeviceRow {
                index,
                identifier: identifier.clone(),
                values,
            })
        })
        .collect();
    Ok(rows)
}

/// Write a row into a copy of `template`.
///
/// Ignore entries leave the template untouched, or remove the field under
/// `REMOVE_IF_MISSING`. The identifier path is created when missing.
pub fn build_target(
    template: &Value,
    row: &DeviceRow,
    identifier_path: &str,
) -> Result<Value, ProcessingError> {
    let mut target = template.clone();
    for (target_path, value) in &row.values {
        let strategy = value.repair_strategy;
        if strategy == RepairStrategy::RemoveIfMissing && value.is_empty() {
            path::remove_path(&mut target, target_path).map_err(|e| substitution_error(target_path, e))?;
            continue;
        }
        if value.is_ignore() {
            continue;
        }
        let written = match (&value.value, value.kind, strategy) {
            (Value::Array(items), ValueKind::Array, RepairStrategy::UseFirstValueOfArray) => {
                items.first().cloned().unwrap_or(Value::Null)
            }
            (Value::Array(items), ValueKind::Array, RepairStrategy::UseLastValueOfArray) => {
                items.last().cloned().unwrap_or(Value::Null)
            }
            (other, _, _) => other.clone(),
        };
        let create_missing = strategy == RepairStrategy::CreateIfMissing || target_path == identifier_path;
        path::set_path(&mut target, target_path, written, create_missing)
            .map_err(|e| substitution_error(target_path, e))?;
    }
    Ok(target)
}

fn substitution_error(target_path: &str, e: path::PathError) -> ProcessingError {
    ProcessingError::Substitution {
        path: target_path.to_string(),
        reason: e.to_string(),
    }
}

/// Truthiness of a filter result: `true`, `"true"`, `"1"` or `"yes"`.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynmapper_core::{Api, Substitution};

    fn values(raw: &[Value], strategy: RepairStrategy) -> Vec<SubstituteValue> {
        raw.iter()
            .map(|v| SubstituteValue::new(v.clone(), strategy))
            .collect()
    }

    #[test]
    fn test_enrich_inbound() {
        let mut payload = json!({"value": 1});
        enrich_inbound(&mut payload, "/plant1/line1/machine1", Some("k1"));
        assert_eq!(payload["_TOPIC_LEVEL_"], json!(["plant1", "line1", "machine1"]));
        assert_eq!(payload["_CONTEXT_DATA_"]["key"], json!("k1"));

        let mut array = json!([1, 2]);
        enrich_inbound(&mut array, "/a", None);
        assert_eq!(array, json!([1, 2]));
    }

    #[test]
    fn test_extract_expands_arrays() {
        let mapping = Mapping::inbound("m1", "/a/+", Api::Measurement)
            .with_substitution(Substitution::new("devices.t", "c8y_T.value").expanding_array())
            .with_substitution(Substitution::identifier("devices.id", "source.id").expanding_array())
            .with_substitution(Substitution::new("unit", "c8y_T.unit"))
            .with_substitution(Substitution::new("missing", "c8y_T.extra"))
            .with_substitution(Substitution::new("a..b", "broken"));
        let payload = json!({
            "devices": [{"id": "d1", "t": 1}, {"id": "d2", "t": 2}],
            "unit": "C"
        });

        let extraction = extract(&mapping, &payload);
        assert_eq!(extraction.cache["source.id"].len(), 2);
        assert_eq!(extraction.cache["c8y_T.value"].len(), 2);
        assert_eq!(extraction.cache["c8y_T.unit"].len(), 1);
        assert!(extraction.cache["c8y_T.extra"][0].is_ignore());
        assert!(!extraction.cache.contains_key("broken"));
        assert_eq!(extraction.errors.len(), 1);
    }

    #[test]
    fn test_extract_rewrites_identity_paths() {
        let mapping = Mapping::inbound("m1", "/a/+", Api::Operation)
            .with_substitution(Substitution::identifier("id", "_IDENTITY_.externalId"));
        let extraction = extract(&mapping, &json!({"id": "x"}));
        assert!(extraction.cache.contains_key("deviceId"));
    }

    #[test]
    fn test_unexpanded_array_is_one_entry() {
        let mapping = Mapping::inbound("m1", "/a/+", Api::Event)
            .with_substitution(Substitution::identifier("ids", "source.id"));
        let extraction = extract(&mapping, &json!({"ids": ["a", "b"]}));
        assert_eq!(extraction.cache["source.id"].len(), 1);
        assert_eq!(extraction.cache["source.id"][0].kind, ValueKind::Array);
    }

    #[test]
    fn test_inject_time_only_when_missing() {
        let mapping = Mapping::inbound("m1", "/a/+", Api::Measurement);
        let mut cache = ProcessingCache::new();
        inject_time(&mapping, &mut cache);
        assert_eq!(cache[TIME].len(), 1);

        let inventory = Mapping::inbound("m2", "/b/+", Api::Inventory);
        let mut cache = ProcessingCache::new();
        inject_time(&inventory, &mut cache);
        assert!(cache.is_empty());

        let mut cache = ProcessingCache::new();
        cache.insert(TIME.to_string(), values(&[json!("2024-01-01T00:00:00Z")], RepairStrategy::Default));
        inject_time(&mapping, &mut cache);
        assert_eq!(cache[TIME][0].value, json!("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn test_pick_repairs() {
        let single = values(&[json!(7)], RepairStrategy::Default);
        assert_eq!(pick("p", &single, 2, 3).unwrap().unwrap().value, json!(7));

        let first = values(&[json!(1), json!(2)], RepairStrategy::UseFirstValueOfArray);
        assert_eq!(pick("p", &first, 2, 3).unwrap().unwrap().value, json!(1));

        let last = values(&[json!(1), json!(2)], RepairStrategy::UseLastValueOfArray);
        assert_eq!(pick("p", &last, 2, 3).unwrap().unwrap().value, json!(2));

        let plain = values(&[json!(1), json!(2)], RepairStrategy::Default);
        assert_eq!(pick("p", &plain, 1, 3).unwrap().unwrap().value, json!(2));
        assert!(matches!(
            pick("p", &plain, 2, 3),
            Err(ProcessingError::Arity { available: 2, required: 3, device_index: 2, .. })
        ));
        assert_eq!(pick("p", &[], 0, 3).unwrap(), None);
    }

    #[test]
    fn test_reconcile_replicates_single_values() {
        let mut cache = ProcessingCache::new();
        cache.insert("source.id".into(), values(&[json!("d1"), json!("d2"), json!("d3")], RepairStrategy::Default));
        cache.insert("a".into(), values(&[json!(1), json!(2), json!(3)], RepairStrategy::Default));
        cache.insert("b".into(), values(&[json!("B")], RepairStrategy::UseFirstValueOfArray));

        let rows = reconcile(&cache, "source.id").unwrap();
        assert_eq!(rows.len(), 3);
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref().unwrap();
            assert_eq!(row.index, i);
            let b = row.values.iter().find(|(p, _)| p == "b").unwrap();
            assert_eq!(b.1.value, json!("B"));
            let a = row.values.iter().find(|(p, _)| p == "a").unwrap();
            assert_eq!(a.1.value, json!(i + 1));
        }
    }

    #[test]
    fn test_reconcile_reports_arity_per_device() {
        let mut cache = ProcessingCache::new();
        cache.insert("source.id".into(), values(&[json!("d1"), json!("d2"), json!("d3")], RepairStrategy::Default));
        cache.insert("b".into(), values(&[json!(1), json!(2)], RepairStrategy::Default));

        let rows = reconcile(&cache, "source.id").unwrap();
        assert!(rows[0].is_ok());
        assert!(rows[1].is_ok());
        assert!(matches!(
            rows[2],
            Err(ProcessingError::Arity { device_index: 2, .. })
        ));
    }

    #[test]
    fn test_reconcile_without_identifier() {
        let cache = ProcessingCache::new();
        assert!(matches!(
            reconcile(&cache, "source.id"),
            Err(ProcessingError::MissingIdentifier(_))
        ));
    }

    #[test]
    fn test_build_target() {
        let template = json!({
            "type": "c8y_Temperature",
            "c8y_Temperature": {"T": {"value": 0, "unit": "C"}},
            "text": "default"
        });
        let row = DeviceRow {
            index: 0,
            identifier: SubstituteValue::new(json!("4711"), RepairStrategy::Default),
            values: vec![
                ("c8y_Temperature.T.value".into(), SubstituteValue::new(json!(21.5), RepairStrategy::Default)),
                ("c8y_Temperature.T.unit".into(), SubstituteValue::ignore(RepairStrategy::RemoveIfMissing)),
                ("source.id".into(), SubstituteValue::new(json!("4711"), RepairStrategy::Default)),
                ("text".into(), SubstituteValue::ignore(RepairStrategy::Default)),
                ("c8y_Extra.tags".into(), SubstituteValue::new(json!(["x", "y"]), RepairStrategy::CreateIfMissing)),
                ("last".into(), SubstituteValue::new(json!([1, 2, 3]), RepairStrategy::UseLastValueOfArray)),
            ],
        };
        let target = build_target(&template, &row, "source.id").unwrap();
        assert_eq!(target["c8y_Temperature"]["T"]["value"], json!(21.5));
        assert!(target["c8y_Temperature"]["T"].get("unit").is_none());
        assert_eq!(target["source"]["id"], json!("4711"));
        assert_eq!(target["text"], json!("default"));
        assert_eq!(target["c8y_Extra"]["tags"], json!(["x", "y"]));
        assert_eq!(target["last"], json!(3));
        // the template itself is never modified
        assert_eq!(template["c8y_Temperature"]["T"]["unit"], json!("C"));
    }

    #[test]
    fn test_build_target_missing_parent() {
        let row = DeviceRow {
            index: 0,
            identifier: SubstituteValue::new(json!("1"), RepairStrategy::Default),
            values: vec![("a.b".into(), SubstituteValue::new(json!(1), RepairStrategy::Default))],
        };
        assert!(matches!(
            build_target(&json!({}), &row, "source.id"),
            Err(ProcessingError::Substitution { .. })
        ));
    }

    #[test]
    fn test_truthy() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!("yes")));
        assert!(is_truthy(&json!("1")));
        assert!(is_truthy(&json!(1)));
        assert!(!is_truthy(&json!("no")));
        assert!(!is_truthy(&Value::Null));
    }
}
