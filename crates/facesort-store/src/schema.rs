//! Table layout of a facesort database.

pub const SCHEMA_VERSION: i64 = 1;

/// Tables every initialised database must contain.
pub const REQUIRED_TABLES: [&str; 7] = [
    "meta",
    "images",
    "clusters",
    "cluster_aliases",
    "observations",
    "labels",
    "scan_runs",
];

pub const SCHEMA: &str = r#"
CREATE TABLE meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE images (
    path       TEXT PRIMARY KEY,
    size       INTEGER NOT NULL,
    mtime_ns   INTEGER NOT NULL,
    face_count INTEGER NOT NULL,
    scanned_at TEXT NOT NULL
);

CREATE TABLE clusters (
    id           INTEGER PRIMARY KEY,
    centroid     BLOB NOT NULL,
    member_count INTEGER NOT NULL,
    exemplars    BLOB NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE TABLE cluster_aliases (
    alias_id     INTEGER PRIMARY KEY,
    canonical_id INTEGER NOT NULL REFERENCES clusters(id),
    merged_at    TEXT NOT NULL
);

CREATE TABLE observations (
    path       TEXT NOT NULL REFERENCES images(path) ON DELETE CASCADE,
    face_index INTEGER NOT NULL,
    x1         REAL NOT NULL,
    y1         REAL NOT NULL,
    x2         REAL NOT NULL,
    y2         REAL NOT NULL,
    confidence REAL NOT NULL,
    embedding  BLOB NOT NULL,
    cluster_id INTEGER NOT NULL REFERENCES clusters(id),
    PRIMARY KEY (path, face_index)
);

CREATE INDEX idx_observations_cluster ON observations(cluster_id);

CREATE TABLE labels (
    cluster_id INTEGER PRIMARY KEY REFERENCES clusters(id),
    name       TEXT NOT NULL,
    confirmed  INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE scan_runs (
    id              TEXT PRIMARY KEY,
    started_at      TEXT NOT NULL,
    finished_at     TEXT NOT NULL,
    images_seen     INTEGER NOT NULL,
    images_analyzed INTEGER NOT NULL,
    faces_found     INTEGER NOT NULL,
    warnings        INTEGER NOT NULL,
    cancelled       INTEGER NOT NULL
);
"#;

// meta keys
pub const META_SCHEMA_VERSION: &str = "schema_version";
pub const META_NEXT_CLUSTER_ID: &str = "next_cluster_id";
pub const META_MODEL_VERSION: &str = "model_version";
pub const META_METRIC: &str = "metric";
pub const META_EMBEDDING_DIM: &str = "embedding_dim";
/// Bumped by every image commit and every merge.
pub const META_CLUSTER_GENERATION: &str = "cluster_generation";
