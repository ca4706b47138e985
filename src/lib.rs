// Sparse feature point tracking over a live video sequence: corner
// detection with non-maximum suppression, coarse-to-fine KLT optical
// flow, and a sequence controller that keeps track identities stable
// as points appear, get lost and are replenished.

#[macro_use] extern crate lazy_static;

pub mod all;
pub mod compute;
pub mod detector;
pub mod image;
pub mod optical_flow;
pub mod parameters;
pub mod pyramid;
pub mod track;
pub mod tracker;
pub mod types;
pub mod util;
pub mod video;
