//! Mapping resolver
//!
//! Pure functions turning a raw source row into a sparse target row. For every
//! active rule the first non-blank candidate (primary -> secondary -> tertiary)
//! wins; the rule's transform runs only on the winning value. A value the
//! transform cannot parse is logged and the field is left out; the record
//! itself is kept.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use tracing::debug;

use crate::types::{FieldValue, MappedRecord, MappingRule, MappingSet, RawRecord, Transform};

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
];

/// Apply every active rule of `set` to `raw`
pub fn resolve_record(raw: &RawRecord, set: &MappingSet) -> MappedRecord {
    let mut mapped = MappedRecord::new();
    for rule in set.active_rules() {
        if let Some(value) = resolve_rule(raw, rule) {
            mapped.insert(rule.target_field.clone(), value);
        }
    }
    mapped
}

/// Value for a single rule, `None` when no candidate qualifies or the
/// transform rejects the winning value
pub fn resolve_rule(raw: &RawRecord, rule: &MappingRule) -> Option<FieldValue> {
    let (field, value) = rule
        .ordered_candidates()
        .into_iter()
        .find_map(|c| raw.non_blank(&c.field).map(|v| (c.field.as_str(), v)))?;

    let transformed = apply_transform(value, rule.transform);
    if transformed.is_none() {
        debug!(
            "Mapping '{}' <- '{}': cannot apply {} to {:?}, field omitted",
            rule.target_field,
            field,
            rule.transform.as_str(),
            value
        );
    }
    transformed
}

/// Coerce a non-blank value according to `transform`
pub fn apply_transform(value: &FieldValue, transform: Transform) -> Option<FieldValue> {
    match transform {
        Transform::Identity => Some(value.clone()),
        Transform::Number => match value {
            FieldValue::Integer(_) | FieldValue::Float(_) => Some(value.clone()),
            FieldValue::Text(s) => parse_number(s),
            _ => None,
        },
        Transform::Boolean => match value {
            FieldValue::Bool(_) => Some(value.clone()),
            FieldValue::Integer(0) => Some(FieldValue::Bool(false)),
            FieldValue::Integer(1) => Some(FieldValue::Bool(true)),
            FieldValue::Text(s) => parse_bool(s).map(FieldValue::Bool),
            _ => None,
        },
        Transform::Date => match value {
            FieldValue::Date(_) => Some(value.clone()),
            FieldValue::Timestamp(t) => Some(FieldValue::Date(t.date_naive())),
            FieldValue::Text(s) => parse_date(s).map(FieldValue::Date),
            _ => None,
        },
        Transform::Timestamp => as_timestamp(value).map(FieldValue::Timestamp),
    }
}

/// Numeric coercion. Accepts composite currency values (`"1500.50|BRL"`) by
/// reading the part before the first `|`, and decimal commas.
pub fn parse_number(input: &str) -> Option<FieldValue> {
    let leading = input.split('|').next().unwrap_or_default().trim();
    if leading.is_empty() {
        return None;
    }
    if let Some(value) = parse_plain_number(leading) {
        return Some(value);
    }

    let normalized = match (leading.rfind(','), leading.rfind('.')) {
        // 1.234,56
        (Some(comma), Some(dot)) if comma > dot => leading.replace('.', "").replace(',', "."),
        // 1,234.56
        (Some(_), Some(_)) => leading.replace(',', ""),
        // 1234,56
        (Some(_), None) => leading.replace(',', "."),
        _ => return None,
    };
    parse_plain_number(&normalized)
}

fn parse_plain_number(s: &str) -> Option<FieldValue> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(FieldValue::Integer(i));
    }
    s.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(FieldValue::Float)
}

pub fn parse_bool(input: &str) -> Option<bool> {
    match input.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "sim" | "s" | "x" => Some(true),
        "false" | "0" | "no" | "n" | "nao" | "não" => Some(false),
        _ => None,
    }
}

pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let s = input.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .or_else(|| parse_timestamp(s).map(|t| t.date_naive()))
}

pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let s = input.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    if let Some(t) = DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
    {
        return Some(t.and_utc());
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

/// Best-effort timestamp view of any value, used for skip-by-timestamp
pub fn as_timestamp(value: &FieldValue) -> Option<DateTime<Utc>> {
    match value {
        FieldValue::Timestamp(t) => Some(*t),
        FieldValue::Date(d) => Some(d.and_time(NaiveTime::MIN).and_utc()),
        FieldValue::Text(s) => parse_timestamp(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(pairs: &[(&str, &str)]) -> RawRecord {
        let mut record = RawRecord::new();
        for (k, v) in pairs {
            record.insert(*k, *v);
        }
        record
    }

    fn scouter_set() -> MappingSet {
        MappingSet::new(
            "scouting",
            vec![MappingRule::new("scouter", &["CAPTADOR", "SCOUTER_NAME", "UF_CRM_SCOUTER"])],
        )
    }

    #[test]
    fn test_primary_wins_when_present() {
        let record = raw(&[("CAPTADOR", "Bruno"), ("SCOUTER_NAME", "Carla")]);
        let mapped = resolve_record(&record, &scouter_set());
        assert_eq!(mapped.get("scouter"), Some(&FieldValue::Text("Bruno".into())));
    }

    #[test]
    fn test_falls_back_to_secondary_when_primary_empty() {
        let record = raw(&[("CAPTADOR", ""), ("SCOUTER_NAME", "Carla")]);
        let mapped = resolve_record(&record, &scouter_set());
        assert_eq!(mapped.get("scouter"), Some(&FieldValue::Text("Carla".into())));
    }

    #[test]
    fn test_null_primary_falls_back() {
        let mut record = raw(&[("UF_CRM_SCOUTER", "Davi")]);
        record.insert("CAPTADOR", FieldValue::Null);
        let mapped = resolve_record(&record, &scouter_set());
        assert_eq!(mapped.get("scouter"), Some(&FieldValue::Text("Davi".into())));
    }

    #[test]
    fn test_all_candidates_empty_leaves_field_absent() {
        let record = raw(&[("CAPTADOR", ""), ("SCOUTER_NAME", "  "), ("OTHER", "x")]);
        let mapped = resolve_record(&record, &scouter_set());
        assert!(!mapped.contains_key("scouter"));
        assert!(mapped.is_empty());
    }

    #[test]
    fn test_inactive_rules_are_ignored() {
        let set = MappingSet::new(
            "leads",
            vec![
                MappingRule::new("name", &["NAME"]),
                MappingRule::new("phone", &["PHONE"]).inactive(),
            ],
        );
        let mapped = resolve_record(&raw(&[("NAME", "Ana"), ("PHONE", "123")]), &set);
        assert_eq!(mapped.len(), 1);
        assert!(!mapped.contains_key("phone"));
    }

    #[test]
    fn test_transform_does_not_influence_candidate_choice() {
        // Primary is non-empty but not numeric: it still wins, and the field is omitted
        let rule = MappingRule::new("amount", &["OPPORTUNITY", "UF_AMOUNT"])
            .with_transform(Transform::Number);
        let record = raw(&[("OPPORTUNITY", "n/a"), ("UF_AMOUNT", "99")]);
        assert_eq!(resolve_rule(&record, &rule), None);
    }

    #[test]
    fn test_unparseable_value_keeps_rest_of_record() {
        let set = MappingSet::new(
            "leads",
            vec![
                MappingRule::new("name", &["NAME"]),
                MappingRule::new("born", &["BIRTHDATE"]).with_transform(Transform::Date),
            ],
        );
        let mapped = resolve_record(&raw(&[("NAME", "Ana"), ("BIRTHDATE", "yesterday")]), &set);
        assert_eq!(mapped.len(), 1);
        assert!(mapped.contains_key("name"));
    }

    #[test]
    fn test_number_from_currency_composite() {
        assert_eq!(parse_number("1500.50|BRL"), Some(FieldValue::Float(1500.5)));
        assert_eq!(parse_number("2000|USD"), Some(FieldValue::Integer(2000)));
        assert_eq!(parse_number(" 12 "), Some(FieldValue::Integer(12)));
        assert_eq!(parse_number("|BRL"), None);
    }

    #[test]
    fn test_number_with_decimal_comma() {
        assert_eq!(parse_number("1234,56"), Some(FieldValue::Float(1234.56)));
        assert_eq!(parse_number("1.234,56|BRL"), Some(FieldValue::Float(1234.56)));
        assert_eq!(parse_number("1,234.56"), Some(FieldValue::Float(1234.56)));
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number("NaN"), None);
    }

    #[test]
    fn test_boolean_coercion() {
        assert_eq!(parse_bool("Sim"), Some(true));
        assert_eq!(parse_bool("Y"), Some(true));
        assert_eq!(parse_bool("não"), Some(false));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(
            apply_transform(&FieldValue::Integer(1), Transform::Boolean),
            Some(FieldValue::Bool(true))
        );
    }

    #[test]
    fn test_date_accepts_iso_and_localized() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        assert_eq!(parse_date("2024-03-15"), Some(expected));
        assert_eq!(parse_date("15/03/2024"), Some(expected));
        assert_eq!(parse_date("15.03.2024"), Some(expected));
        assert_eq!(parse_date("2024-03-15T10:30:00-03:00"), Some(expected));
        assert_eq!(parse_date("31/02/2024"), None);
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 15, 13, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-15T10:30:00-03:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-15 13:30:00"), Some(expected));
        assert_eq!(parse_timestamp("15/03/2024 13:30"), Some(expected));
        assert_eq!(
            parse_timestamp("15/03/2024"),
            Some(Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp("not a date"), None);
    }

    #[test]
    fn test_typed_values_pass_through_matching_transforms() {
        assert_eq!(
            apply_transform(&FieldValue::Float(2.5), Transform::Number),
            Some(FieldValue::Float(2.5))
        );
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        assert_eq!(
            apply_transform(&FieldValue::Timestamp(ts), Transform::Date),
            Some(FieldValue::Date(ts.date_naive()))
        );
        assert_eq!(apply_transform(&FieldValue::Bool(true), Transform::Number), None);
    }
}
