//! Cluster persistence, alias resolution and administrative merges.

use crate::db::{bump_generation, Database};
use crate::error::StoreError;
use crate::labels::{label_of, Label};
use facesort_core::{Cluster, ClusterId, ClusterIndex, Embedding, Metric};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

/// Result of [`Database::merge_clusters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub canonical: ClusterId,
    /// The id that now redirects to `canonical`; `None` if both arguments
    /// already resolved to the same cluster.
    pub alias: Option<ClusterId>,
}

/// Read-only view of a cluster for listings.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSummary {
    pub id: ClusterId,
    pub member_count: u64,
    pub cohesion: Option<f32>,
    pub label: Option<Label>,
    pub aliases: Vec<ClusterId>,
    pub created_at: String,
}

impl Database {
    /// Load every live cluster into an index bound to this database's
    /// id counter.
    pub fn load_index(&self, metric: Metric, threshold: f32) -> Result<ClusterIndex, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, centroid, member_count, exemplars FROM clusters ORDER BY id")?;
        let clusters = stmt
            .query_map([], cluster_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let next_id = self.next_cluster_id()?;
        tracing::debug!(clusters = clusters.len(), next_id, "loaded cluster index");
        Ok(ClusterIndex::from_clusters(metric, threshold, clusters, next_id)?)
    }

    /// Canonical id for `id`: itself if live, its merge target if aliased,
    /// `None` if it never existed.
    pub fn resolve(&self, id: ClusterId) -> Result<Option<ClusterId>, StoreError> {
        resolve(&self.conn, id)
    }

    /// Merge two clusters. The lower canonical id survives.
    ///
    /// All observations of the discarded cluster move to the survivor, and
    /// the discarded id becomes a permanent alias. Label precedence: the
    /// survivor's label wins; if it has none, the discarded cluster's label
    /// (with its confirmed flag) is inherited.
    pub fn merge_clusters(&mut self, a: ClusterId, b: ClusterId) -> Result<MergeOutcome, StoreError> {
        let now = chrono::Utc::now().to_rfc3339();
        let outcome = self.write_txn(|tx| {
            let ra = resolve(tx, a)?.ok_or(StoreError::ClusterNotFound(a))?;
            let rb = resolve(tx, b)?.ok_or(StoreError::ClusterNotFound(b))?;
            if ra == rb {
                return Ok(MergeOutcome { canonical: ra, alias: None });
            }
            let (keep, gone) = if ra < rb { (ra, rb) } else { (rb, ra) };

            let mut survivor = load_cluster(tx, keep)?.ok_or(StoreError::ClusterNotFound(keep))?;
            let discarded = load_cluster(tx, gone)?.ok_or(StoreError::ClusterNotFound(gone))?;
            survivor.absorb(discarded);
            save_cluster(tx, &survivor, &now)?;

            tx.execute(
                "UPDATE observations SET cluster_id = ?1 WHERE cluster_id = ?2",
                params![keep.0, gone.0],
            )?;

            if label_of(tx, keep)?.is_some() {
                tx.execute("DELETE FROM labels WHERE cluster_id = ?1", [gone.0])?;
            } else {
                tx.execute(
                    "UPDATE labels SET cluster_id = ?1, updated_at = ?3 WHERE cluster_id = ?2",
                    params![keep.0, gone.0, now],
                )?;
            }

            // Keep alias chains one hop deep.
            tx.execute(
                "UPDATE cluster_aliases SET canonical_id = ?1 WHERE canonical_id = ?2",
                params![keep.0, gone.0],
            )?;
            tx.execute("DELETE FROM clusters WHERE id = ?1", [gone.0])?;
            tx.execute(
                "INSERT INTO cluster_aliases (alias_id, canonical_id, merged_at) VALUES (?1, ?2, ?3)",
                params![gone.0, keep.0, now],
            )?;
            bump_generation(tx, None)?;

            Ok(MergeOutcome { canonical: keep, alias: Some(gone) })
        })?;

        tracing::info!(canonical = %outcome.canonical, alias = ?outcome.alias, "clusters merged");
        Ok(outcome)
    }

    /// Every live cluster with its label, aliases and cohesion.
    pub fn cluster_summaries(&self) -> Result<Vec<ClusterSummary>, StoreError> {
        let metric = self.metric()?.unwrap_or_default();
        let mut stmt = self.conn.prepare(
            "SELECT id, centroid, member_count, exemplars, created_at FROM clusters ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((cluster_from_row(row)?, row.get::<_, String>(4)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut alias_stmt = self
            .conn
            .prepare("SELECT alias_id FROM cluster_aliases WHERE canonical_id = ?1 ORDER BY alias_id")?;

        let mut summaries = Vec::with_capacity(rows.len());
        for (cluster, created_at) in rows {
            let aliases = alias_stmt
                .query_map([cluster.id.0], |r| Ok(ClusterId(r.get(0)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            summaries.push(ClusterSummary {
                id: cluster.id,
                member_count: cluster.member_count,
                cohesion: cluster.cohesion(metric),
                label: label_of(&self.conn, cluster.id)?,
                aliases,
                created_at,
            });
        }
        Ok(summaries)
    }
}

pub(crate) fn resolve(conn: &Connection, id: ClusterId) -> Result<Option<ClusterId>, StoreError> {
    let live: Option<i64> = conn
        .query_row("SELECT id FROM clusters WHERE id = ?1", [id.0], |r| r.get(0))
        .optional()?;
    if live.is_some() {
        return Ok(Some(id));
    }
    let target: Option<i64> = conn
        .query_row(
            "SELECT canonical_id FROM cluster_aliases WHERE alias_id = ?1",
            [id.0],
            |r| r.get(0),
        )
        .optional()?;
    Ok(target.map(ClusterId))
}

pub(crate) fn save_cluster(conn: &Connection, cluster: &Cluster, now: &str) -> Result<(), StoreError> {
    let exemplars: Vec<u8> = cluster.exemplars.iter().flat_map(|e| e.to_bytes()).collect();
    conn.execute(
        "INSERT INTO clusters (id, centroid, member_count, exemplars, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(id) DO UPDATE SET
           centroid = excluded.centroid, member_count = excluded.member_count,
           exemplars = excluded.exemplars, updated_at = excluded.updated_at",
        params![
            cluster.id.0,
            cluster.centroid.to_bytes(),
            cluster.member_count as i64,
            exemplars,
            now,
        ],
    )?;
    Ok(())
}

fn load_cluster(conn: &Connection, id: ClusterId) -> Result<Option<Cluster>, StoreError> {
    let cluster = conn
        .query_row(
            "SELECT id, centroid, member_count, exemplars FROM clusters WHERE id = ?1",
            [id.0],
            cluster_from_row,
        )
        .optional()?;
    Ok(cluster)
}

fn cluster_from_row(row: &Row<'_>) -> rusqlite::Result<Cluster> {
    let bad_blob = |col: usize, len: usize| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Blob,
            format!("embedding blob of {len} bytes").into(),
        )
    };

    let centroid_blob: Vec<u8> = row.get(1)?;
    let centroid = Embedding::from_bytes(&centroid_blob).ok_or_else(|| bad_blob(1, centroid_blob.len()))?;

    let exemplar_blob: Vec<u8> = row.get(3)?;
    let stride = centroid.dim() * 4;
    if stride == 0 || exemplar_blob.len() % stride != 0 {
        return Err(bad_blob(3, exemplar_blob.len()));
    }
    let exemplars = exemplar_blob
        .chunks_exact(stride)
        .filter_map(Embedding::from_bytes)
        .collect();

    Ok(Cluster {
        id: ClusterId(row.get(0)?),
        centroid,
        member_count: row.get::<_, i64>(2)? as u64,
        exemplars,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::{Fingerprint, ImageUpdate};
    use facesort_core::{BoundingBox, FaceObservation};

    /// Scan-like helper: assign each (path, embedding) through the index and
    /// commit it.
    fn ingest(db: &mut Database, index: &mut ClusterIndex, items: &[(&str, [f32; 2])]) {
        for (path, values) in items {
            let e = Embedding::new(values.to_vec());
            let a = index.assign(&e).unwrap();
            let obs = vec![FaceObservation {
                path: path.to_string(),
                face_index: 0,
                bounding_box: BoundingBox::from_corners([0.0, 0.0, 10.0, 10.0], 0.9),
                embedding: e,
                cluster_id: a.cluster_id,
            }];
            let generation = db.cluster_generation().unwrap();
            db.commit_image(&ImageUpdate {
                path,
                fingerprint: Fingerprint { size: 1, mtime_ns: 1 },
                observations: &obs,
                clusters: vec![index.get(a.cluster_id).unwrap()],
                next_cluster_id: index.next_id(),
                generation,
            })
            .unwrap();
        }
    }

    fn three_clusters() -> (tempfile::TempDir, Database) {
        let tmp = tempfile::tempdir().unwrap();
        let mut db = Database::open(&tmp.path().join("faces.db")).unwrap();
        let mut index = ClusterIndex::new(Metric::Euclidean, 0.5);
        ingest(
            &mut db,
            &mut index,
            &[("a.jpg", [0.0, 0.0]), ("b.jpg", [10.0, 0.0]), ("c.jpg", [0.0, 10.0]), ("d.jpg", [10.0, 0.2])],
        );
        (tmp, db)
    }

    #[test]
    fn test_load_index_roundtrip() {
        let (_tmp, db) = three_clusters();
        let index = db.load_index(Metric::Euclidean, 0.5).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.next_id(), 4);
        let b = index.get(ClusterId(2)).unwrap();
        assert_eq!(b.member_count, 2);
        assert!((b.centroid.values[1] - 0.1).abs() < 1e-6);
        assert_eq!(b.exemplars.len(), 2);
    }

    #[test]
    fn test_merge_keeps_lower_id_and_aliases() {
        let (_tmp, mut db) = three_clusters();
        let outcome = db.merge_clusters(ClusterId(3), ClusterId(2)).unwrap();
        assert_eq!(outcome, MergeOutcome { canonical: ClusterId(2), alias: Some(ClusterId(3)) });

        assert_eq!(db.resolve(ClusterId(3)).unwrap(), Some(ClusterId(2)));
        assert_eq!(db.resolve(ClusterId(9)).unwrap(), None);
        assert_eq!(db.observations_for("c.jpg").unwrap()[0].cluster_id, ClusterId(2));

        let index = db.load_index(Metric::Euclidean, 0.5).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(ClusterId(2)).unwrap().member_count, 3);
        // Merged-away ids are never reissued.
        assert_eq!(index.next_id(), 4);
    }

    #[test]
    fn test_merge_same_cluster_is_noop() {
        let (_tmp, mut db) = three_clusters();
        db.merge_clusters(ClusterId(1), ClusterId(3)).unwrap();
        let before = db.cluster_generation().unwrap();
        let outcome = db.merge_clusters(ClusterId(3), ClusterId(1)).unwrap();
        assert_eq!(outcome, MergeOutcome { canonical: ClusterId(1), alias: None });
        assert_eq!(db.cluster_generation().unwrap(), before);
    }

    #[test]
    fn test_merge_advances_generation() {
        let (_tmp, mut db) = three_clusters();
        let before = db.cluster_generation().unwrap();
        assert_eq!(before, 4);
        db.merge_clusters(ClusterId(2), ClusterId(3)).unwrap();
        assert_eq!(db.cluster_generation().unwrap(), before + 1);
    }

    #[test]
    fn test_merge_unknown_cluster() {
        let (_tmp, mut db) = three_clusters();
        assert!(matches!(
            db.merge_clusters(ClusterId(1), ClusterId(42)),
            Err(StoreError::ClusterNotFound(ClusterId(42)))
        ));
    }

    #[test]
    fn test_alias_chains_stay_flat() {
        let (_tmp, mut db) = three_clusters();
        db.merge_clusters(ClusterId(2), ClusterId(3)).unwrap();
        db.merge_clusters(ClusterId(1), ClusterId(2)).unwrap();
        assert_eq!(db.resolve(ClusterId(3)).unwrap(), Some(ClusterId(1)));
        assert_eq!(db.resolve(ClusterId(2)).unwrap(), Some(ClusterId(1)));

        let summaries = db.cluster_summaries().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].aliases, vec![ClusterId(2), ClusterId(3)]);
        assert_eq!(summaries[0].member_count, 4);

        // Database still passes its own integrity check.
        let path = db.path().to_path_buf();
        drop(db);
        Database::open(&path).unwrap();
    }
}
