use crate::all::*;

// Identities are unique for the lifetime of a sequence and never
// reused while the corresponding track is alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrackId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackStatus {
  // Followed from the previous frame.
  Tracked,
  // Created by detection or an external feed on this frame.
  New,
  // Diverged or left the valid image area, slot freed.
  Lost,
}

// Host-facing record of one feature slot after a sequence operation.
// `source` links a tracked output back to the input slot that fed it,
// since tracking is batched by slot position, not by identity.
#[derive(Clone, Copy, Debug)]
pub struct TrackedFeature {
  pub id: Option<TrackId>,
  pub status: TrackStatus,
  pub point: Vector2d,
  pub gain: f64,
  pub source: Option<usize>,
}

impl TrackedFeature {
  pub fn empty() -> TrackedFeature {
    TrackedFeature {
      id: None,
      status: TrackStatus::Lost,
      point: Vector2d::zeros(),
      gain: 1.,
      source: None,
    }
  }
}
