//! Per-image fingerprints and face observations.

use crate::clusters::save_cluster;
use crate::db::{bump_generation, write_meta, Database};
use crate::error::StoreError;
use crate::schema;
use facesort_core::{BoundingBox, Cluster, ClusterId, Embedding, FaceObservation};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

/// Cheap change detector for an image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub size: u64,
    pub mtime_ns: i64,
}

/// Everything that changes when one image is (re-)analysed.
///
/// Committed atomically by [`Database::commit_image`].
#[derive(Debug, Clone)]
pub struct ImageUpdate<'a> {
    pub path: &'a str,
    pub fingerprint: Fingerprint,
    pub observations: &'a [FaceObservation],
    /// Final state of every cluster touched by this image, including clusters
    /// that lost members because the image's previous faces were retracted.
    pub clusters: Vec<&'a Cluster>,
    /// Cluster id counter after this image.
    pub next_cluster_id: i64,
    /// Cluster generation the caller's index reflects.
    pub generation: u64,
}

impl Database {
    /// Stored fingerprint of every image, keyed by relative path.
    pub fn fingerprints(&self) -> Result<HashMap<String, Fingerprint>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT path, size, mtime_ns FROM images")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                Fingerprint { size: row.get::<_, i64>(1)? as u64, mtime_ns: row.get(2)? },
            ))
        })?;
        let map = rows.collect::<Result<HashMap<_, _>, _>>()?;
        Ok(map)
    }

    pub fn fingerprint(&self, path: &str) -> Result<Option<Fingerprint>, StoreError> {
        let fp = self
            .conn
            .query_row("SELECT size, mtime_ns FROM images WHERE path = ?1", [path], |row| {
                Ok(Fingerprint { size: row.get::<_, i64>(0)? as u64, mtime_ns: row.get(1)? })
            })
            .optional()?;
        Ok(fp)
    }

    /// Observations of one image in detection order.
    pub fn observations_for(&self, path: &str) -> Result<Vec<FaceObservation>, StoreError> {
        observations_for(&self.conn, path)
    }

    /// Record the analysis of one image in a single transaction: fingerprint,
    /// observations (replacing any previous ones) and touched clusters.
    ///
    /// Fails with [`StoreError::Conflict`] when another writer changed the
    /// clusters since `update.generation`; nothing is written in that case.
    /// Returns the new generation.
    pub fn commit_image(&mut self, update: &ImageUpdate<'_>) -> Result<u64, StoreError> {
        let now = chrono::Utc::now().to_rfc3339();
        self.write_txn(|tx| {
            let generation = bump_generation(tx, Some(update.generation))?;
            tx.execute(
                "INSERT INTO images (path, size, mtime_ns, face_count, scanned_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(path) DO UPDATE SET
                   size = excluded.size, mtime_ns = excluded.mtime_ns,
                   face_count = excluded.face_count, scanned_at = excluded.scanned_at",
                params![
                    update.path,
                    update.fingerprint.size as i64,
                    update.fingerprint.mtime_ns,
                    update.observations.len() as i64,
                    now,
                ],
            )?;

            // Clusters first so the observation foreign keys resolve.
            for cluster in &update.clusters {
                save_cluster(tx, cluster, &now)?;
            }

            tx.execute("DELETE FROM observations WHERE path = ?1", [update.path])?;
            let mut insert = tx.prepare(
                "INSERT INTO observations
                   (path, face_index, x1, y1, x2, y2, confidence, embedding, cluster_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for obs in update.observations {
                let [x1, y1, x2, y2] = obs.bounding_box.corners();
                insert.execute(params![
                    update.path,
                    obs.face_index,
                    x1,
                    y1,
                    x2,
                    y2,
                    obs.bounding_box.confidence,
                    obs.embedding.to_bytes(),
                    obs.cluster_id.0,
                ])?;
            }

            write_meta(tx, schema::META_NEXT_CLUSTER_ID, &update.next_cluster_id.to_string())?;
            if let Some(obs) = update.observations.first() {
                write_meta(tx, schema::META_EMBEDDING_DIM, &obs.embedding.dim().to_string())?;
            }
            Ok(generation)
        })
    }
}

pub(crate) fn observations_for(conn: &Connection, path: &str) -> Result<Vec<FaceObservation>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT path, face_index, x1, y1, x2, y2, confidence, embedding, cluster_id
         FROM observations WHERE path = ?1 ORDER BY face_index",
    )?;
    let rows = stmt.query_map([path], observation_from_row)?;
    let observations = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(observations)
}

fn observation_from_row(row: &Row<'_>) -> rusqlite::Result<FaceObservation> {
    let blob: Vec<u8> = row.get(7)?;
    let embedding = Embedding::from_bytes(&blob).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Blob,
            format!("embedding blob of {} bytes", blob.len()).into(),
        )
    })?;
    Ok(FaceObservation {
        path: row.get(0)?,
        face_index: row.get(1)?,
        bounding_box: BoundingBox::from_corners(
            [row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?],
            row.get(6)?,
        ),
        embedding,
        cluster_id: ClusterId(row.get(8)?),
    })
}
