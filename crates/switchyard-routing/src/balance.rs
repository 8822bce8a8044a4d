//! Load-balancing primitives over candidate lists

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use switchyard_core::{Exclusion, GatewayError, Key, ModelAgent, Status};

/// An entity the selection engine can pick from a list
pub trait Candidate {
    fn candidate_id(&self) -> &str;

    fn status(&self) -> Status;

    /// Relative share under weighted balancing
    fn weight(&self) -> i64;

    fn is_excluded(&self, exclusion: &Exclusion) -> bool;

    /// Nothing is configured for the scope
    fn none_configured(scope: String) -> GatewayError;

    /// Candidates exist but none is enabled
    fn none_enabled(scope: String) -> GatewayError;
}

impl Candidate for ModelAgent {
    fn candidate_id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> Status {
        self.status
    }

    fn weight(&self) -> i64 {
        self.weight
    }

    fn is_excluded(&self, exclusion: &Exclusion) -> bool {
        exclusion.has_agent(&self.id)
    }

    fn none_configured(scope: String) -> GatewayError {
        GatewayError::NoAvailableAgent { scope }
    }

    fn none_enabled(scope: String) -> GatewayError {
        GatewayError::AllAgentsExcluded { scope }
    }
}

impl Candidate for Key {
    fn candidate_id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> Status {
        self.status
    }

    fn weight(&self) -> i64 {
        self.weight
    }

    fn is_excluded(&self, exclusion: &Exclusion) -> bool {
        exclusion.has_key(&self.id)
    }

    fn none_configured(scope: String) -> GatewayError {
        GatewayError::NoAvailableKey { scope }
    }

    fn none_enabled(scope: String) -> GatewayError {
        GatewayError::AllKeysExcluded { scope }
    }
}

/// Rotating cursors, one per owner scope, each behind its own lock
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursors: DashMap<String, Arc<Mutex<usize>>>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next index in `0..len` for the scope
    ///
    /// `len` must be non-zero.
    pub fn next(&self, scope: &str, len: usize) -> usize {
        let cursor = Arc::clone(self.cursors.entry(scope.to_owned()).or_default().value());
        let mut position = cursor.lock().unwrap_or_else(|e| e.into_inner());
        let index = *position % len;
        *position = position.wrapping_add(1);
        index
    }
}

/// Smooth weighted round-robin state, one table per owner scope
///
/// Each pick adds every candidate's weight to its running score, takes
/// the highest score and subtracts the total weight from the winner.
/// Over a full cycle every candidate is picked exactly in proportion to
/// its weight, and low-weight candidates are spread out rather than
/// picked back to back.
#[derive(Debug, Default)]
pub struct SmoothWeighted {
    scores: DashMap<String, Arc<Mutex<HashMap<String, i64>>>>,
}

impl SmoothWeighted {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the next candidate for the scope
    ///
    /// Non-positive weights count as 1. `candidates` must be non-empty.
    pub fn next<T: Candidate>(&self, scope: &str, candidates: &[Arc<T>]) -> usize {
        let table = Arc::clone(self.scores.entry(scope.to_owned()).or_default().value());
        let mut scores = table.lock().unwrap_or_else(|e| e.into_inner());

        // A changed candidate set starts a fresh cycle
        if scores.len() != candidates.len() || candidates.iter().any(|c| !scores.contains_key(c.candidate_id())) {
            scores.clear();
        }

        let mut total = 0;
        let mut best = 0;
        let mut best_score = i64::MIN;
        for (index, candidate) in candidates.iter().enumerate() {
            let weight = candidate.weight().max(1);
            total += weight;

            let score = scores.entry(candidate.candidate_id().to_owned()).or_insert(0);
            *score += weight;
            if *score > best_score {
                best = index;
                best_score = *score;
            }
        }

        if let Some(score) = scores.get_mut(candidates[best].candidate_id()) {
            *score -= total;
        }

        best
    }
}
