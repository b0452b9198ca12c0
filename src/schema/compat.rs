//! Compatibility checks between schema versions
//!
//! Advisory only: registration never blocks on the outcome.

use crate::schema::field::{Field, FieldType, Nullability};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Compatibility {
    Safe,
    Breaking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    FieldAdded,
    FieldRemoved,
    TypeChanged,
    NullabilityRelaxed,
    NullabilityTightened,
}

impl ChangeKind {
    pub fn compatibility(&self) -> Compatibility {
        match self {
            ChangeKind::FieldAdded | ChangeKind::NullabilityRelaxed => Compatibility::Safe,
            ChangeKind::FieldRemoved
            | ChangeKind::TypeChanged
            | ChangeKind::NullabilityTightened => Compatibility::Breaking,
        }
    }
}

/// One difference between two versions, by dotted field path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub path: String,
    pub kind: ChangeKind,
    pub compatibility: Compatibility,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    pub old_schema_id: String,
    pub new_schema_id: String,
    pub compatibility: Compatibility,
    pub changes: Vec<SchemaChange>,
}

impl CompatibilityReport {
    pub fn is_breaking(&self) -> bool {
        self.compatibility == Compatibility::Breaking
    }
}

/// Compare two field trees
pub fn check_compatibility(
    old_schema_id: &str,
    old: &[Field],
    new_schema_id: &str,
    new: &[Field],
) -> CompatibilityReport {
    let mut changes = Vec::new();
    diff_level(old, new, "", &mut changes);

    let compatibility = if changes.iter().any(|c| c.compatibility == Compatibility::Breaking) {
        Compatibility::Breaking
    } else {
        Compatibility::Safe
    };

    CompatibilityReport {
        old_schema_id: old_schema_id.to_string(),
        new_schema_id: new_schema_id.to_string(),
        compatibility,
        changes,
    }
}

fn push(changes: &mut Vec<SchemaChange>, path: String, kind: ChangeKind, detail: String) {
    changes.push(SchemaChange {
        path,
        kind,
        compatibility: kind.compatibility(),
        detail,
    });
}

fn diff_level(old: &[Field], new: &[Field], parent: &str, changes: &mut Vec<SchemaChange>) {
    let path_of = |name: &str| {
        if parent.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", parent, name)
        }
    };

    for old_field in old {
        let path = path_of(&old_field.name);
        match new.iter().find(|f| f.name == old_field.name) {
            None => push(changes, path, ChangeKind::FieldRemoved, "field removed".to_string()),
            Some(new_field) => {
                diff_type(&old_field.field_type, &new_field.field_type, &path, changes);
                match (old_field.nullability, new_field.nullability) {
                    (Nullability::Required, Nullability::Nullable) => push(
                        changes,
                        path,
                        ChangeKind::NullabilityRelaxed,
                        "REQUIRED to NULLABLE".to_string(),
                    ),
                    (Nullability::Nullable, Nullability::Required) => push(
                        changes,
                        path,
                        ChangeKind::NullabilityTightened,
                        "NULLABLE to REQUIRED".to_string(),
                    ),
                    _ => {}
                }
            }
        }
    }

    for new_field in new {
        if !old.iter().any(|f| f.name == new_field.name) {
            push(
                changes,
                path_of(&new_field.name),
                ChangeKind::FieldAdded,
                format!("added {} {}", new_field.mode(), new_field.field_type),
            );
        }
    }
}

fn diff_type(old: &FieldType, new: &FieldType, path: &str, changes: &mut Vec<SchemaChange>) {
    match (old, new) {
        (FieldType::Record(old_fields), FieldType::Record(new_fields)) => {
            diff_level(old_fields, new_fields, path, changes)
        }
        (FieldType::Repeated(old_inner), FieldType::Repeated(new_inner)) => {
            diff_type(old_inner, new_inner, path, changes)
        }
        (a, b)
            if a.is_record() || b.is_record() || a.is_repeated() || b.is_repeated() || a != b =>
        {
            push(
                changes,
                path.to_string(),
                ChangeKind::TypeChanged,
                format!("{} to {}", a, b),
            )
        }
        _ => {}
    }
}
