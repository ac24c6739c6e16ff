//! Online nearest-centroid clustering of face embeddings.
//!
//! Embeddings are assigned one at a time: each joins the closest existing
//! cluster when its distance to that cluster's centroid is strictly below the
//! threshold, otherwise it founds a new cluster with a fresh id. Assignment is
//! deterministic for a fixed processing order, threshold and metric.

use crate::types::{ClusterId, Embedding, Metric};
use std::collections::BTreeMap;
use thiserror::Error;

/// Number of member embeddings retained per cluster for cohesion checks.
pub const MAX_EXEMPLARS: usize = 8;

/// Two candidate distances closer than this are treated as a tie.
pub const TIE_EPSILON: f32 = 1e-6;

#[derive(Error, Debug, PartialEq)]
pub enum ClusterError {
    #[error("embedding has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding is empty")]
    EmptyEmbedding,
    #[error("cluster {0} not found")]
    UnknownCluster(ClusterId),
    #[error("next cluster id {next_id} does not exceed existing id {max_id}")]
    IdCounterBehind { next_id: i64, max_id: i64 },
}

/// A group of embeddings believed to share one identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub id: ClusterId,
    /// Running mean of all member embeddings.
    pub centroid: Embedding,
    pub member_count: u64,
    /// The first [`MAX_EXEMPLARS`] members, in assignment order.
    pub exemplars: Vec<Embedding>,
}

impl Cluster {
    /// A single-member cluster seeded from `embedding`.
    pub fn new(id: ClusterId, embedding: &Embedding) -> Self {
        Self {
            id,
            centroid: embedding.clone(),
            member_count: 1,
            exemplars: vec![embedding.clone()],
        }
    }

    fn add_member(&mut self, embedding: &Embedding) {
        self.member_count += 1;
        let n = self.member_count as f32;
        for (c, v) in self.centroid.values.iter_mut().zip(&embedding.values) {
            *c += (v - *c) / n;
        }
        if self.exemplars.len() < MAX_EXEMPLARS {
            self.exemplars.push(embedding.clone());
        }
    }

    /// Undo one [`add_member`](Self::add_member) for `embedding`.
    ///
    /// A cluster emptied to zero members keeps its last centroid so that its
    /// id (and any label on it) can still attract the same identity later.
    pub fn remove_member(&mut self, embedding: &Embedding) {
        if self.member_count > 1 {
            let n = self.member_count as f32;
            for (c, v) in self.centroid.values.iter_mut().zip(&embedding.values) {
                *c = (*c * n - v) / (n - 1.0);
            }
        }
        self.member_count = self.member_count.saturating_sub(1);
        if let Some(pos) = self.exemplars.iter().position(|e| e == embedding) {
            self.exemplars.remove(pos);
        }
    }

    /// Fold `other` into this cluster: member-count weighted centroid, summed
    /// counts, exemplars appended up to the bound.
    pub fn absorb(&mut self, other: Cluster) {
        let total = self.member_count + other.member_count;
        if total > 0 {
            let wa = self.member_count as f32 / total as f32;
            let wb = other.member_count as f32 / total as f32;
            for (c, o) in self.centroid.values.iter_mut().zip(&other.centroid.values) {
                *c = *c * wa + o * wb;
            }
        }
        self.member_count = total;
        let room = MAX_EXEMPLARS.saturating_sub(self.exemplars.len());
        self.exemplars.extend(other.exemplars.into_iter().take(room));
    }

    /// Mean distance from the retained exemplars to the centroid.
    ///
    /// Small values mean a tight cluster; a value approaching the clustering
    /// threshold suggests the centroid has drifted. `None` with no exemplars.
    pub fn cohesion(&self, metric: Metric) -> Option<f32> {
        if self.exemplars.is_empty() {
            return None;
        }
        let total: f32 = self
            .exemplars
            .iter()
            .map(|e| metric.distance(e, &self.centroid))
            .sum();
        Some(total / self.exemplars.len() as f32)
    }
}

/// Outcome of assigning one embedding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assignment {
    pub cluster_id: ClusterId,
    /// Distance to the chosen centroid before the update; `None` for a new cluster.
    pub distance: Option<f32>,
    pub created: bool,
}

/// In-memory cluster state. Single writer: every mutation takes `&mut self`.
#[derive(Debug, Clone)]
pub struct ClusterIndex {
    metric: Metric,
    threshold: f32,
    clusters: BTreeMap<ClusterId, Cluster>,
    next_id: i64,
    dim: Option<usize>,
}

impl ClusterIndex {
    /// An empty index. The first cluster gets id 1.
    pub fn new(metric: Metric, threshold: f32) -> Self {
        Self {
            metric,
            threshold,
            clusters: BTreeMap::new(),
            next_id: 1,
            dim: None,
        }
    }

    /// Rebuild an index from persisted clusters.
    ///
    /// `next_id` must be greater than every existing id, including ids that
    /// survive only as merge aliases, so the caller passes the persisted
    /// counter rather than `max + 1`.
    pub fn from_clusters(
        metric: Metric,
        threshold: f32,
        clusters: Vec<Cluster>,
        next_id: i64,
    ) -> Result<Self, ClusterError> {
        let mut index = Self::new(metric, threshold);
        index.next_id = next_id.max(1);
        for cluster in clusters {
            let dim = cluster.centroid.dim();
            match index.dim {
                Some(expected) if expected != dim => {
                    return Err(ClusterError::DimensionMismatch { expected, actual: dim });
                }
                _ => index.dim = Some(dim),
            }
            if cluster.id.0 >= index.next_id {
                return Err(ClusterError::IdCounterBehind {
                    next_id: index.next_id,
                    max_id: cluster.id.0,
                });
            }
            index.clusters.insert(cluster.id, cluster);
        }
        Ok(index)
    }

    /// Assign an embedding to its nearest cluster or found a new one.
    pub fn assign(&mut self, embedding: &Embedding) -> Result<Assignment, ClusterError> {
        self.check_dim(embedding)?;

        if let Some((id, distance)) = self.nearest(embedding) {
            if distance < self.threshold {
                if let Some(cluster) = self.clusters.get_mut(&id) {
                    cluster.add_member(embedding);
                }
                tracing::trace!(cluster = %id, distance, "joined cluster");
                return Ok(Assignment { cluster_id: id, distance: Some(distance), created: false });
            }
        }

        let id = ClusterId(self.next_id);
        self.next_id += 1;
        self.dim = Some(embedding.dim());
        self.clusters.insert(id, Cluster::new(id, embedding));
        tracing::trace!(cluster = %id, "created cluster");
        Ok(Assignment { cluster_id: id, distance: None, created: true })
    }

    /// Closest cluster and its distance.
    ///
    /// Every centroid within [`TIE_EPSILON`] of the minimum is a candidate;
    /// among those the largest member count wins, then the lowest id.
    pub fn nearest(&self, embedding: &Embedding) -> Option<(ClusterId, f32)> {
        let distances: Vec<(ClusterId, f32, u64)> = self
            .clusters
            .values()
            .map(|c| (c.id, self.metric.distance(embedding, &c.centroid), c.member_count))
            .collect();

        let min = distances
            .iter()
            .map(|&(_, d, _)| d)
            .fold(f32::INFINITY, f32::min);
        if !min.is_finite() {
            return None;
        }

        // BTreeMap order means the first maximum is also the lowest id.
        let mut best: Option<(ClusterId, f32, u64)> = None;
        for &(id, d, count) in &distances {
            if d - min > TIE_EPSILON {
                continue;
            }
            match best {
                Some((_, _, best_count)) if count <= best_count => {}
                _ => best = Some((id, d, count)),
            }
        }
        best.map(|(id, d, _)| (id, d))
    }

    /// Remove one previously assigned embedding from a cluster.
    pub fn retract(&mut self, id: ClusterId, embedding: &Embedding) -> Result<(), ClusterError> {
        self.check_dim(embedding)?;
        let cluster = self
            .clusters
            .get_mut(&id)
            .ok_or(ClusterError::UnknownCluster(id))?;
        cluster.remove_member(embedding);
        Ok(())
    }

    fn check_dim(&self, embedding: &Embedding) -> Result<(), ClusterError> {
        if embedding.values.is_empty() {
            return Err(ClusterError::EmptyEmbedding);
        }
        match self.dim {
            Some(expected) if expected != embedding.dim() => Err(ClusterError::DimensionMismatch {
                expected,
                actual: embedding.dim(),
            }),
            _ => Ok(()),
        }
    }

    pub fn get(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.get(&id)
    }

    /// Clusters in ascending id order.
    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values()
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// The id the next new cluster will receive.
    pub fn next_id(&self) -> i64 {
        self.next_id
    }

    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn cohesion(&self, id: ClusterId) -> Option<f32> {
        self.clusters.get(&id).and_then(|c| c.cohesion(self.metric))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    /// Unit vector at the given cosine distance from [1, 0].
    fn at_cosine_distance(d: f32) -> Embedding {
        let cos = 1.0 - d;
        emb(&[cos, (1.0 - cos * cos).sqrt()])
    }

    #[test]
    fn test_first_embedding_creates_cluster_one() {
        let mut index = ClusterIndex::new(Metric::Cosine, 0.3);
        let a = index.assign(&emb(&[1.0, 0.0])).unwrap();
        assert_eq!(a.cluster_id, ClusterId(1));
        assert!(a.created);
        assert_eq!(a.distance, None);
        assert_eq!(index.next_id(), 2);
    }

    #[test]
    fn test_three_faces_two_identities() {
        let mut index = ClusterIndex::new(Metric::Cosine, 0.3);
        let e1 = emb(&[1.0, 0.0]);
        let e2 = at_cosine_distance(0.1);
        let e3 = at_cosine_distance(0.9);

        assert_eq!(index.assign(&e1).unwrap().cluster_id, ClusterId(1));
        let second = index.assign(&e2).unwrap();
        assert_eq!(second.cluster_id, ClusterId(1));
        assert!(!second.created);
        assert!((second.distance.unwrap() - 0.1).abs() < 1e-5);
        assert_eq!(index.assign(&e3).unwrap().cluster_id, ClusterId(2));

        assert_eq!(index.get(ClusterId(1)).unwrap().member_count, 2);
        assert_eq!(index.get(ClusterId(2)).unwrap().member_count, 1);
    }

    #[test]
    fn test_centroid_is_running_mean() {
        let mut index = ClusterIndex::new(Metric::Euclidean, 10.0);
        index.assign(&emb(&[0.0, 0.0])).unwrap();
        index.assign(&emb(&[2.0, 4.0])).unwrap();
        index.assign(&emb(&[4.0, 2.0])).unwrap();
        let c = index.get(ClusterId(1)).unwrap();
        assert_eq!(c.member_count, 3);
        assert!((c.centroid.values[0] - 2.0).abs() < 1e-6);
        assert!((c.centroid.values[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_boundary() {
        // Strict comparator: below joins, exactly-at and above split.
        for (x, expected) in [(0.49f32, 1), (0.5, 2), (0.51, 2)] {
            let mut index = ClusterIndex::new(Metric::Euclidean, 0.5);
            index.assign(&emb(&[0.0, 0.0])).unwrap();
            let a = index.assign(&emb(&[x, 0.0])).unwrap();
            assert_eq!(a.cluster_id, ClusterId(expected), "distance {x}");
        }
    }

    #[test]
    fn test_tie_prefers_larger_cluster() {
        let small = Cluster::new(ClusterId(1), &emb(&[1.0, 0.0]));
        let mut large = Cluster::new(ClusterId(2), &emb(&[-1.0, 0.0]));
        large.member_count = 5;
        let index =
            ClusterIndex::from_clusters(Metric::Euclidean, 2.0, vec![small, large], 3).unwrap();
        let (id, d) = index.nearest(&emb(&[0.0, 0.0])).unwrap();
        assert_eq!(id, ClusterId(2));
        assert!((d - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_tie_equal_counts_prefers_lower_id() {
        let a = Cluster::new(ClusterId(4), &emb(&[1.0, 0.0]));
        let b = Cluster::new(ClusterId(7), &emb(&[-1.0, 0.0]));
        let index = ClusterIndex::from_clusters(Metric::Euclidean, 2.0, vec![b, a], 8).unwrap();
        assert_eq!(index.nearest(&emb(&[0.0, 0.0])).unwrap().0, ClusterId(4));
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let inputs: Vec<Embedding> = (0..40)
            .map(|i| {
                let t = i as f32 * 0.37;
                emb(&[t.cos(), t.sin(), (t * 0.5).cos()])
            })
            .collect();
        let run = || {
            let mut index = ClusterIndex::new(Metric::Cosine, 0.25);
            inputs
                .iter()
                .map(|e| index.assign(e).unwrap().cluster_id)
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_retract_restores_centroid() {
        let mut index = ClusterIndex::new(Metric::Euclidean, 10.0);
        index.assign(&emb(&[1.0, 1.0])).unwrap();
        index.assign(&emb(&[3.0, 5.0])).unwrap();
        index.retract(ClusterId(1), &emb(&[3.0, 5.0])).unwrap();
        let c = index.get(ClusterId(1)).unwrap();
        assert_eq!(c.member_count, 1);
        assert!((c.centroid.values[0] - 1.0).abs() < 1e-5);
        assert!((c.centroid.values[1] - 1.0).abs() < 1e-5);
        assert_eq!(c.exemplars, vec![emb(&[1.0, 1.0])]);
    }

    #[test]
    fn test_retract_last_member_keeps_cluster() {
        let mut index = ClusterIndex::new(Metric::Euclidean, 1.0);
        index.assign(&emb(&[1.0, 1.0])).unwrap();
        index.retract(ClusterId(1), &emb(&[1.0, 1.0])).unwrap();
        let c = index.get(ClusterId(1)).unwrap();
        assert_eq!(c.member_count, 0);
        assert_eq!(c.centroid, emb(&[1.0, 1.0]));
        // Same face comes back to the same id.
        assert_eq!(index.assign(&emb(&[1.0, 1.0])).unwrap().cluster_id, ClusterId(1));
    }

    #[test]
    fn test_retract_unknown_cluster() {
        let mut index = ClusterIndex::new(Metric::Cosine, 0.3);
        index.assign(&emb(&[1.0, 0.0])).unwrap();
        assert_eq!(
            index.retract(ClusterId(9), &emb(&[1.0, 0.0])),
            Err(ClusterError::UnknownCluster(ClusterId(9)))
        );
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = ClusterIndex::new(Metric::Cosine, 0.3);
        index.assign(&emb(&[1.0, 0.0])).unwrap();
        assert_eq!(
            index.assign(&emb(&[1.0, 0.0, 0.0])),
            Err(ClusterError::DimensionMismatch { expected: 2, actual: 3 })
        );
        assert_eq!(index.assign(&emb(&[])), Err(ClusterError::EmptyEmbedding));
    }

    #[test]
    fn test_from_clusters_rejects_stale_counter() {
        let c = Cluster::new(ClusterId(5), &emb(&[1.0]));
        let err = ClusterIndex::from_clusters(Metric::Cosine, 0.3, vec![c], 5).unwrap_err();
        assert_eq!(err, ClusterError::IdCounterBehind { next_id: 5, max_id: 5 });
    }

    #[test]
    fn test_new_ids_skip_counter_gap() {
        // Ids that live on only as merge aliases are never handed out again.
        let c = Cluster::new(ClusterId(1), &emb(&[1.0, 0.0]));
        let mut index = ClusterIndex::from_clusters(Metric::Cosine, 0.3, vec![c], 4).unwrap();
        let a = index.assign(&emb(&[0.0, 1.0])).unwrap();
        assert_eq!(a.cluster_id, ClusterId(4));
    }

    #[test]
    fn test_absorb_weighted_mean() {
        let mut a = Cluster::new(ClusterId(1), &emb(&[0.0, 0.0]));
        a.member_count = 3;
        let mut b = Cluster::new(ClusterId(2), &emb(&[4.0, 8.0]));
        b.member_count = 1;
        a.absorb(b);
        assert_eq!(a.member_count, 4);
        assert_eq!(a.centroid, emb(&[1.0, 2.0]));
        assert_eq!(a.exemplars.len(), 2);
    }

    #[test]
    fn test_exemplars_are_bounded() {
        let mut index = ClusterIndex::new(Metric::Euclidean, 100.0);
        for i in 0..(MAX_EXEMPLARS + 5) {
            index.assign(&emb(&[i as f32, 0.0])).unwrap();
        }
        let c = index.get(ClusterId(1)).unwrap();
        assert_eq!(c.exemplars.len(), MAX_EXEMPLARS);
        assert_eq!(c.member_count as usize, MAX_EXEMPLARS + 5);
        assert!(index.cohesion(ClusterId(1)).unwrap() > 0.0);
    }
}
