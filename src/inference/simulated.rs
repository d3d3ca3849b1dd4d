use super::{AlertCandidate, Classifier, DetectedPerson, InferenceResult};
use crate::db::models::{AlertType, Severity};
use crate::device_manager::media::VideoFrame;
use crate::error::Result;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};

const MAX_PERSONS: u32 = 15;
const FALL_PROBABILITY: f64 = 0.05;
const FIGHT_PROBABILITY: f64 = 0.03;
const LOITER_PROBABILITY: f64 = 0.02;

/// Random detections standing in for a model
pub struct SimulatedClassifier {
    rng: Mutex<StdRng>,
    crowd_threshold: u32,
}

impl SimulatedClassifier {
    /// A fixed seed makes the sequence reproducible
    pub fn new(seed: Option<u64>, crowd_threshold: u32) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
            crowd_threshold: crowd_threshold.max(1),
        }
    }

    fn generate(&self, frame: &VideoFrame) -> InferenceResult {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let count = rng.gen_range(0..=MAX_PERSONS);
        let (w, h) = (frame.width.max(1) as f32, frame.height.max(1) as f32);

        let persons: Vec<DetectedPerson> = (0..count)
            .map(|_| {
                let bw = rng.gen_range(0.05..0.2) * w;
                let bh = rng.gen_range(0.2..0.5) * h;
                DetectedPerson {
                    bbox: [rng.gen_range(0.0..w - bw), rng.gen_range(0.0..h - bh), bw, bh],
                    confidence: rng.gen_range(0.5..0.99),
                }
            })
            .collect();

        let mut candidates = Vec::new();

        if count >= self.crowd_threshold {
            let severity = if count as f32 > self.crowd_threshold as f32 * 1.5 {
                Severity::High
            } else {
                Severity::Medium
            };
            candidates.push(AlertCandidate {
                person_count: count,
                description: format!("Overcrowding detected: {} people", count),
                severity: Some(severity),
                ..AlertCandidate::new(AlertType::Overcrowding, rng.gen_range(0.6..0.95))
            });
        }
        if count >= 1 && rng.gen_bool(FALL_PROBABILITY) {
            candidates.push(AlertCandidate {
                person_count: 1,
                description: "Person fall detected".to_string(),
                ..AlertCandidate::new(AlertType::Fall, rng.gen_range(0.5..0.95))
            });
        }
        if count >= 2 && rng.gen_bool(FIGHT_PROBABILITY) {
            candidates.push(AlertCandidate {
                person_count: 2,
                description: "Potential fight detected".to_string(),
                ..AlertCandidate::new(AlertType::Fight, rng.gen_range(0.5..0.95))
            });
        }
        if count >= 1 && rng.gen_bool(LOITER_PROBABILITY) {
            candidates.push(AlertCandidate {
                person_count: 1,
                description: "Suspicious loitering behavior detected".to_string(),
                ..AlertCandidate::new(AlertType::Loitering, rng.gen_range(0.5..0.8))
            });
        }

        InferenceResult { persons, candidates }
    }
}

#[async_trait]
impl Classifier for SimulatedClassifier {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn classify(&self, frame: &VideoFrame, _camera_id: &str) -> Result<InferenceResult> {
        Ok(self.generate(frame))
    }
}
