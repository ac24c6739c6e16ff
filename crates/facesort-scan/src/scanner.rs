//! The scan orchestrator: enumerate, detect in parallel, cluster in order,
//! commit per image, report.

use crate::config::Config;
use crate::error::{ScanError, ScanWarning, WarningKind};
use crate::source::{self, ImageEntry};
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender};
use facesort_core::{ClusterId, ClusterIndex, DetectedFace, FaceAnalyzer, FaceObservation, Metric};
use facesort_store::{Database, ImageUpdate, ScanRun, StoreError};
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Cooperative cancellation flag, checked between images.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Clustering and filtering knobs for one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    pub threshold: f32,
    pub metric: Metric,
    pub min_confidence: f32,
    pub extensions: Vec<String>,
}

impl From<&Config> for ScanOptions {
    fn from(config: &Config) -> Self {
        Self {
            threshold: config.threshold,
            metric: config.metric,
            min_confidence: config.min_confidence,
            extensions: config.extensions.clone(),
        }
    }
}

/// One output row: a face, or a faceless image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanRecord {
    pub path: String,
    pub cluster_id: Option<ClusterId>,
    /// `[x1, y1, x2, y2]` in image pixels.
    pub bounding_box: Option<[f32; 4]>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub images_seen: u64,
    /// Unchanged since the last scan; served from the database.
    pub images_cached: u64,
    pub images_analyzed: u64,
    pub images_failed: u64,
    /// Faces clustered by this scan (cached faces not included).
    pub faces_found: u64,
    pub clusters_created: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub run_id: String,
    pub records: Vec<ScanRecord>,
    pub warnings: Vec<ScanWarning>,
    pub stats: ScanStats,
}

/// What a detection worker produced for one image.
enum Outcome {
    Faces(Vec<DetectedFace>),
    Failed(WarningKind, String),
}

/// Owns the analyzers, one per detection worker.
pub struct Scanner {
    analyzers: Vec<Box<dyn FaceAnalyzer>>,
    options: ScanOptions,
    model_version: String,
}

impl Scanner {
    /// All analyzers must report the same model version.
    pub fn new(analyzers: Vec<Box<dyn FaceAnalyzer>>, options: ScanOptions) -> Result<Self, ScanError> {
        let first = analyzers.first().ok_or(ScanError::NoWorkers)?.model_version().to_string();
        if let Some(other) = analyzers.iter().find(|a| a.model_version() != first) {
            return Err(ScanError::AnalyzerMismatch {
                first,
                other: other.model_version().to_string(),
            });
        }
        Ok(Self { analyzers, options, model_version: first })
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Scan `folder` into `db`.
    ///
    /// Every image analysed is committed before the next one is clustered,
    /// so a cancelled or failed scan keeps all completed work. Records are
    /// returned in relative-path order.
    pub fn scan(&mut self, folder: &Path, db: &mut Database, cancel: &CancelToken) -> Result<ScanReport, ScanError> {
        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("scan", %run_id, folder = %folder.display());
        let _enter = span.enter();

        let started_at = Utc::now();
        let clock = Instant::now();

        db.bind_model(&self.model_version, self.options.metric)?;
        // Read before the index so a concurrent merge can only make it older.
        let generation = db.cluster_generation()?;
        let mut index = db.load_index(self.options.metric, self.options.threshold)?;
        let (entries, mut warnings) = source::list_images(folder, &self.options.extensions)?;
        let stored = db.fingerprints()?;

        let pending: Vec<&ImageEntry> = entries
            .iter()
            .filter(|e| stored.get(&e.rel_path) != Some(&e.fingerprint))
            .collect();
        tracing::info!(
            images = entries.len(),
            pending = pending.len(),
            workers = self.analyzers.len(),
            clusters = index.len(),
            "scan started"
        );

        let mut writer = Writer {
            db: &mut *db,
            index: &mut index,
            generation,
            min_confidence: self.options.min_confidence,
            stats: ScanStats { images_seen: entries.len() as u64, ..Default::default() },
            warnings: &mut warnings,
            fresh: HashMap::new(),
            failed: BTreeSet::new(),
        };
        let outcome = run_pool(&mut self.analyzers, &pending, cancel, &mut writer);
        let Writer { mut stats, fresh, failed, .. } = writer;
        stats.images_cached = (entries.len() - pending.len()) as u64;
        let cancelled = match outcome {
            Ok(()) => false,
            Err(ScanError::Cancelled) => true,
            Err(err) => return Err(err),
        };

        db.record_scan(&ScanRun {
            id: run_id.clone(),
            started_at,
            finished_at: Utc::now(),
            images_seen: stats.images_seen,
            images_analyzed: stats.images_analyzed,
            faces_found: stats.faces_found,
            warnings: warnings.len() as u64,
            cancelled,
        })?;

        if cancelled {
            tracing::info!(analyzed = stats.images_analyzed, "scan cancelled");
            return Err(ScanError::Cancelled);
        }

        let records = build_records(folder, &entries, db, fresh, &failed)?;
        tracing::info!(
            records = records.len(),
            analyzed = stats.images_analyzed,
            cached = stats.images_cached,
            failed = stats.images_failed,
            clusters_created = stats.clusters_created,
            elapsed_ms = clock.elapsed().as_millis() as u64,
            "scan finished"
        );
        Ok(ScanReport { run_id, records, warnings, stats })
    }
}

/// Fan `pending` out to one thread per analyzer and feed the results to
/// `writer` strictly in job order.
fn run_pool(
    analyzers: &mut [Box<dyn FaceAnalyzer>],
    pending: &[&ImageEntry],
    cancel: &CancelToken,
    writer: &mut Writer<'_>,
) -> Result<(), ScanError> {
    if pending.is_empty() {
        return Ok(());
    }

    std::thread::scope(|scope| {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<(usize, PathBuf)>();
        let (out_tx, out_rx) = crossbeam_channel::bounded::<(usize, Outcome)>(analyzers.len() * 2);

        for (i, analyzer) in analyzers.iter_mut().enumerate() {
            let jobs = job_rx.clone();
            let out = out_tx.clone();
            let cancel = cancel.clone();
            std::thread::Builder::new()
                .name(format!("facesort-detect-{i}"))
                .spawn_scoped(scope, move || detect_worker(analyzer.as_mut(), jobs, out, cancel))
                .map_err(ScanError::Worker)?;
        }
        drop(out_tx);
        drop(job_rx);

        for (i, entry) in pending.iter().enumerate() {
            // Unbounded and the receivers are alive, so this cannot fail.
            let _ = job_tx.send((i, entry.abs_path.clone()));
        }
        drop(job_tx);

        let mut reorder: BTreeMap<usize, Outcome> = BTreeMap::new();
        let mut next = 0;
        while next < pending.len() {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            if let Some(outcome) = reorder.remove(&next) {
                writer.apply(pending[next], outcome)?;
                next += 1;
                continue;
            }
            match out_rx.recv() {
                Ok((i, outcome)) => {
                    reorder.insert(i, outcome);
                }
                Err(_) if cancel.is_cancelled() => return Err(ScanError::Cancelled),
                Err(_) => return Err(ScanError::WorkersLost),
            }
        }
        Ok(())
    })
}

fn detect_worker(
    analyzer: &mut dyn FaceAnalyzer,
    jobs: Receiver<(usize, PathBuf)>,
    out: Sender<(usize, Outcome)>,
    cancel: CancelToken,
) {
    for (i, path) in jobs.iter() {
        if cancel.is_cancelled() {
            break;
        }
        let outcome = match std::fs::read(&path) {
            Ok(bytes) => match panic::catch_unwind(AssertUnwindSafe(|| analyzer.analyze(&bytes))) {
                Ok(Ok(faces)) => Outcome::Faces(faces),
                Ok(Err(err)) => Outcome::Failed(WarningKind::Detection, err.to_string()),
                Err(payload) => {
                    let message = format!("analyzer panicked: {}", panic_message(&*payload));
                    tracing::error!(path = %path.display(), %message, "analyzer panicked");
                    Outcome::Failed(WarningKind::Detection, message)
                }
            },
            Err(err) => Outcome::Failed(WarningKind::Io, err.to_string()),
        };
        if out.send((i, outcome)).is_err() {
            break;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// The single clustering writer: owns the index and the database for the
/// duration of the pool.
struct Writer<'a> {
    db: &'a mut Database,
    index: &'a mut ClusterIndex,
    /// Cluster generation `index` was loaded at, advanced by each commit.
    generation: u64,
    min_confidence: f32,
    stats: ScanStats,
    warnings: &'a mut Vec<ScanWarning>,
    fresh: HashMap<String, Vec<FaceObservation>>,
    failed: BTreeSet<String>,
}

impl Writer<'_> {
    fn apply(&mut self, entry: &ImageEntry, outcome: Outcome) -> Result<(), ScanError> {
        let faces = match outcome {
            Outcome::Faces(faces) => faces,
            Outcome::Failed(kind, message) => {
                self.skip(entry, kind, message);
                return Ok(());
            }
        };

        let detected = faces.len();
        let faces: Vec<DetectedFace> = faces
            .into_iter()
            .filter(|f| f.bounding_box.confidence >= self.min_confidence)
            .collect();

        let expected_dim = self.index.dim().or_else(|| faces.first().map(|f| f.embedding.dim()));
        if let Some(bad) = faces
            .iter()
            .find(|f| f.embedding.values.is_empty() || Some(f.embedding.dim()) != expected_dim)
        {
            let message = format!(
                "embedding has {} dimensions, database uses {}",
                bad.embedding.dim(),
                expected_dim.unwrap_or(0)
            );
            self.skip(entry, WarningKind::Dimension, message);
            return Ok(());
        }

        let mut touched = BTreeSet::new();
        for old in self.db.observations_for(&entry.rel_path)? {
            self.index
                .retract(old.cluster_id, &old.embedding)
                .map_err(StoreError::from)?;
            touched.insert(old.cluster_id);
        }

        let mut observations = Vec::with_capacity(faces.len());
        for (face_index, face) in faces.into_iter().enumerate() {
            let assignment = self.index.assign(&face.embedding).map_err(StoreError::from)?;
            if assignment.created {
                self.stats.clusters_created += 1;
            }
            touched.insert(assignment.cluster_id);
            observations.push(FaceObservation {
                path: entry.rel_path.clone(),
                face_index: face_index as u32,
                bounding_box: face.bounding_box,
                embedding: face.embedding,
                cluster_id: assignment.cluster_id,
            });
        }

        self.generation = self.db.commit_image(&ImageUpdate {
            path: &entry.rel_path,
            fingerprint: entry.fingerprint,
            observations: &observations,
            clusters: touched.iter().filter_map(|id| self.index.get(*id)).collect(),
            next_cluster_id: self.index.next_id(),
            generation: self.generation,
        })?;

        tracing::debug!(
            path = %entry.rel_path,
            detected,
            kept = observations.len(),
            "image committed"
        );
        self.stats.images_analyzed += 1;
        self.stats.faces_found += observations.len() as u64;
        self.fresh.insert(entry.rel_path.clone(), observations);
        Ok(())
    }

    fn skip(&mut self, entry: &ImageEntry, kind: WarningKind, message: String) {
        self.warnings.push(ScanWarning::new(entry.rel_path.clone(), kind, message));
        self.stats.images_failed += 1;
        self.failed.insert(entry.rel_path.clone());
    }
}

/// Join observations with labels, in path order.
fn build_records(
    folder: &Path,
    entries: &[ImageEntry],
    db: &Database,
    mut fresh: HashMap<String, Vec<FaceObservation>>,
    failed: &BTreeSet<String>,
) -> Result<Vec<ScanRecord>, ScanError> {
    let labels = db.labels()?;
    let mut records = Vec::new();
    for entry in entries {
        if failed.contains(&entry.rel_path) {
            continue;
        }
        let observations = match fresh.remove(&entry.rel_path) {
            Some(observations) => observations,
            None => db.observations_for(&entry.rel_path)?,
        };
        let path = folder.join(&entry.rel_path).display().to_string();
        if observations.is_empty() {
            records.push(ScanRecord { path, cluster_id: None, bounding_box: None, label: None });
            continue;
        }
        for obs in observations {
            records.push(ScanRecord {
                path: path.clone(),
                cluster_id: Some(obs.cluster_id),
                bounding_box: Some(obs.bounding_box.corners()),
                label: labels.get(&obs.cluster_id).map(|l| l.name.clone()),
            });
        }
    }
    Ok(records)
}
