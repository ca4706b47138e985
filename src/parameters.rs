use crate::all::*;

lazy_static! {
  pub static ref PARAMETER_SET: Mutex<ParameterSet> = Mutex::new(ParameterSet::default());
}

// All values are copied into the components at construction time and
// cannot change for the lifetime of a tracking sequence.
#[derive(Clone, Debug)]
#[derive(clap::Parser, serde::Deserialize)]
#[serde(default)]
pub struct ParameterSet {
  #[clap(long, default_value = "1")]
  pub frame_sub: usize,

  // Tracker module.
  #[clap(long, default_value = "400")]
  pub max_tracks: usize,
  #[clap(long, default_value = "20")]
  pub redetect_interval: usize,

  // Pyramidal KLT feature tracker.
  #[clap(long, default_value = "3")]
  pub klt_levels: usize,
  #[clap(long, default_value = "10")]
  pub klt_iterations: usize,
  // 0 means skip straight from the coarsest level to the finest.
  #[clap(long, default_value = "1")]
  pub klt_level_skip: usize,
  // Half-width, the tracked window has side `2 * klt_window + 1`.
  #[clap(long, default_value = "5")]
  pub klt_window: usize,
  #[clap(long, default_value = "0.1")]
  pub klt_convergence_threshold: f64,
  #[clap(long, default_value = "5000.0")]
  pub klt_ssd_threshold: f64,
  #[clap(long, default_value = "4.0")]
  pub klt_track_border: f64,
  #[clap(long)]
  pub klt_track_gain: bool,

  // Corner detection.
  #[clap(long, default_value = "8")]
  pub klt_min_distance: usize,
  #[clap(long, default_value = "1000.0")]
  pub klt_min_cornerness: f64,
  #[clap(long, default_value = "4.0")]
  pub klt_detect_border: f64,

  // Video input.
  #[clap(long, default_value = "752")]
  pub video_width: usize,
  #[clap(long, default_value = "480")]
  pub video_height: usize,
}

impl Default for ParameterSet {
  fn default() -> ParameterSet {
    ParameterSet {
      frame_sub: 1,
      max_tracks: 400,
      redetect_interval: 20,
      klt_levels: 3,
      klt_iterations: 10,
      klt_level_skip: 1,
      klt_window: 5,
      klt_convergence_threshold: 0.1,
      klt_ssd_threshold: 5000.0,
      klt_track_border: 4.0,
      klt_track_gain: false,
      klt_min_distance: 8,
      klt_min_cornerness: 1000.0,
      klt_detect_border: 4.0,
      video_width: 752,
      video_height: 480,
    }
  }
}
