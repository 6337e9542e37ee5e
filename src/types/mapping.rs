//! Field mapping model
//!
//! A mapping set is a named, versioned list of rules. Stored sets are never
//! edited in place; an edit stores the next version under the same name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Position of a candidate source field in a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePriority {
    Primary,
    Secondary,
    Tertiary,
}

impl SourcePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourcePriority::Primary => "primary",
            SourcePriority::Secondary => "secondary",
            SourcePriority::Tertiary => "tertiary",
        }
    }
}

/// Transformation applied after a candidate has been selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    #[default]
    Identity,
    Number,
    Boolean,
    Date,
    Timestamp,
}

impl Transform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transform::Identity => "identity",
            Transform::Number => "number",
            Transform::Boolean => "boolean",
            Transform::Date => "date",
            Transform::Timestamp => "timestamp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceCandidate {
    pub priority: SourcePriority,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRule {
    pub target_field: String,
    pub candidates: Vec<SourceCandidate>,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl MappingRule {
    /// Build a rule from candidate field names given in priority order
    pub fn new(target_field: impl Into<String>, fields: &[&str]) -> Self {
        const ORDER: [SourcePriority; 3] = [
            SourcePriority::Primary,
            SourcePriority::Secondary,
            SourcePriority::Tertiary,
        ];
        Self {
            target_field: target_field.into(),
            candidates: fields
                .iter()
                .zip(ORDER)
                .map(|(field, priority)| SourceCandidate {
                    priority,
                    field: field.to_string(),
                })
                .collect(),
            transform: Transform::Identity,
            active: true,
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Candidates sorted primary -> tertiary
    pub fn ordered_candidates(&self) -> Vec<&SourceCandidate> {
        let mut candidates: Vec<&SourceCandidate> = self.candidates.iter().collect();
        candidates.sort_by_key(|c| c.priority);
        candidates
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.target_field.trim().is_empty() {
            return Err("rule has an empty target field".to_string());
        }
        if self.candidates.is_empty() || self.candidates.len() > 3 {
            return Err(format!(
                "rule '{}' needs 1-3 source candidates, has {}",
                self.target_field,
                self.candidates.len()
            ));
        }
        let mut seen = HashSet::new();
        for candidate in &self.candidates {
            if !seen.insert(candidate.priority) {
                return Err(format!(
                    "rule '{}' has two {} candidates",
                    self.target_field,
                    candidate.priority.as_str()
                ));
            }
            if candidate.field.trim().is_empty() {
                return Err(format!(
                    "rule '{}' has an empty {} source field",
                    self.target_field,
                    candidate.priority.as_str()
                ));
            }
        }
        Ok(())
    }
}

/// One stored version of a mapping set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingSet {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    pub rules: Vec<MappingRule>,
    pub created_at: DateTime<Utc>,
}

impl MappingSet {
    pub fn new(name: impl Into<String>, rules: Vec<MappingRule>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: 1,
            rules,
            created_at: Utc::now(),
        }
    }

    /// Copy with new rules and the next version number
    pub fn next_version(&self, rules: Vec<MappingRule>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: self.name.clone(),
            version: self.version + 1,
            rules,
            created_at: Utc::now(),
        }
    }

    pub fn active_rules(&self) -> impl Iterator<Item = &MappingRule> {
        self.rules.iter().filter(|r| r.active)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("mapping set name is empty".to_string());
        }
        let mut targets = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if rule.active && !targets.insert(rule.target_field.as_str()) {
                return Err(format!(
                    "target field '{}' is mapped by more than one active rule",
                    rule.target_field
                ));
            }
        }
        if targets.is_empty() {
            return Err(format!("mapping set '{}' has no active rules", self.name));
        }
        Ok(())
    }
}

/// How a create request points at a mapping set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MappingSetRef {
    /// A specific stored version
    Id(Uuid),
    /// Latest version of the named set, pinned at job creation
    Name(String),
}
