//! Configuration validation.

use std::collections::BTreeSet;

use super::{Config, MigrationConfig, RepairConfig};
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.source.path.as_os_str().is_empty() {
        return Err(MigrateError::Config("source.path is required".into()));
    }
    if config.target.path.as_os_str().is_empty() {
        return Err(MigrateError::Config("target.path is required".into()));
    }
    if config.source.path == config.target.path {
        return Err(MigrateError::Config(
            "source and target cannot be the same path".into(),
        ));
    }

    validate_migration(&config.migration)?;
    validate_repair(&config.repair)
}

/// Pre-flight checks for a run. Nothing is read or written when this fails.
pub fn validate_migration(migration: &MigrationConfig) -> Result<()> {
    if migration.batch_size <= 0 {
        return Err(MigrateError::Config(format!(
            "migration.batch_size must be at least 1, got {}",
            migration.batch_size
        )));
    }
    if migration.entity_kinds.is_empty() {
        return Err(MigrateError::Config(
            "migration.entity_kinds must list at least one kind".into(),
        ));
    }
    let mut seen = BTreeSet::new();
    for kind in &migration.entity_kinds {
        if !seen.insert(kind) {
            return Err(MigrateError::Config(format!(
                "migration.entity_kinds lists '{}' more than once",
                kind
            )));
        }
    }
    if migration.retry.max_delay_ms < migration.retry.base_delay_ms {
        return Err(MigrateError::Config(
            "migration.retry.max_delay_ms must not be below base_delay_ms".into(),
        ));
    }
    if migration.volatile_fields.iter().any(|f| f.trim().is_empty()) {
        return Err(MigrateError::Config(
            "migration.volatile_fields must not contain empty names".into(),
        ));
    }
    Ok(())
}

fn validate_repair(repair: &RepairConfig) -> Result<()> {
    for (kind, mappings) in &repair.field_mappings {
        let mut targets = BTreeSet::new();
        for m in mappings {
            if m.from.is_empty() || m.to.is_empty() {
                return Err(MigrateError::Config(format!(
                    "repair.field_mappings.{}: field names must not be empty",
                    kind
                )));
            }
            if m.from == m.to {
                return Err(MigrateError::Config(format!(
                    "repair.field_mappings.{}: '{}' maps onto itself",
                    kind, m.from
                )));
            }
            if !targets.insert(&m.to) {
                return Err(MigrateError::Config(format!(
                    "repair.field_mappings.{}: '{}' is the target of more than one mapping",
                    kind, m.to
                )));
            }
        }
    }
    for (kind, fields) in repair.merge_rules.iter() {
        if fields.keys().any(|f| f.trim().is_empty()) {
            return Err(MigrateError::Config(format!(
                "repair.merge_rules.{}: field names must not be empty",
                kind
            )));
        }
    }
    Ok(())
}
