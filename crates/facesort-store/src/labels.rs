//! The label store: cluster id to user-facing name.

use crate::clusters::resolve;
use crate::db::Database;
use crate::error::StoreError;
use facesort_core::ClusterId;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Label {
    pub name: String,
    /// `true` when set by the user, `false` for a suggestion.
    pub confirmed: bool,
    pub updated_at: String,
}

impl Database {
    /// Name a cluster. Alias ids resolve to their canonical cluster, whose
    /// id is returned.
    pub fn set_label(&mut self, id: ClusterId, name: &str) -> Result<ClusterId, StoreError> {
        let name = clean_name(name)?;
        let canonical = self.write_txn(|tx| {
            let canonical = resolve(tx, id)?.ok_or(StoreError::ClusterNotFound(id))?;
            upsert_label(tx, canonical, name, true)?;
            Ok(canonical)
        })?;
        tracing::info!(cluster = %canonical, name, "label set");
        Ok(canonical)
    }

    /// Propose a name without overriding a confirmed one.
    ///
    /// Returns whether the suggestion was stored.
    pub fn suggest_label(&mut self, id: ClusterId, name: &str) -> Result<bool, StoreError> {
        let name = clean_name(name)?;
        let stored = self.write_txn(|tx| {
            let canonical = resolve(tx, id)?.ok_or(StoreError::ClusterNotFound(id))?;
            if matches!(label_of(tx, canonical)?, Some(existing) if existing.confirmed) {
                return Ok(false);
            }
            upsert_label(tx, canonical, name, false)?;
            Ok(true)
        })?;
        tracing::debug!(cluster = %id, name, stored, "label suggested");
        Ok(stored)
    }

    /// Label of a cluster or of the cluster it was merged into. Unknown ids
    /// have no label.
    pub fn get_label(&self, id: ClusterId) -> Result<Option<Label>, StoreError> {
        match resolve(&self.conn, id)? {
            Some(canonical) => label_of(&self.conn, canonical),
            None => Ok(None),
        }
    }

    /// Every label, keyed by canonical cluster id.
    pub fn labels(&self) -> Result<HashMap<ClusterId, Label>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT cluster_id, name, confirmed, updated_at FROM labels")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                ClusterId(row.get(0)?),
                Label { name: row.get(1)?, confirmed: row.get(2)?, updated_at: row.get(3)? },
            ))
        })?;
        let labels = rows.collect::<Result<HashMap<_, _>, _>>()?;
        Ok(labels)
    }
}

fn clean_name(name: &str) -> Result<&str, StoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidLabel);
    }
    Ok(trimmed)
}

fn upsert_label(conn: &Connection, id: ClusterId, name: &str, confirmed: bool) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO labels (cluster_id, name, confirmed, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(cluster_id) DO UPDATE SET
           name = excluded.name, confirmed = excluded.confirmed, updated_at = excluded.updated_at",
        params![id.0, name, confirmed, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub(crate) fn label_of(conn: &Connection, id: ClusterId) -> Result<Option<Label>, StoreError> {
    let label = conn
        .query_row(
            "SELECT name, confirmed, updated_at FROM labels WHERE cluster_id = ?1",
            [id.0],
            |row| Ok(Label { name: row.get(0)?, confirmed: row.get(1)?, updated_at: row.get(2)? }),
        )
        .optional()?;
    Ok(label)
}
