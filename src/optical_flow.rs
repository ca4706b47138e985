// Coarse-to-fine KLT point tracker loosely following:
// <http://robots.stanford.edu/cs223b04/algo_tracking.pdf>
// “Pyramidal Implementation of the Lucas Kanade Feature Tracker
//   Description of the algorithm” by Jean-Yves Bouguet
// extended with an optional per-point photometric gain estimate.

use crate::all::*;

// Structure matrices with a smaller determinant count as singular.
const DET_EPSILON: f64 = 1e-6;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GainMode {
  // Gain keeps whatever value the slot was provided with.
  Fixed,
  // Gain is estimated jointly with the displacement.
  Estimated,
}

// One slot of the feature position buffers.
#[derive(Clone, Copy, Debug)]
pub struct TrackedPoint {
  pub pos: Vector2d,
  pub gain: f64,
  pub valid: bool,
}

impl TrackedPoint {
  pub fn invalid() -> TrackedPoint {
    TrackedPoint {
      pos: Vector2d::zeros(),
      gain: 1.,
      valid: false,
    }
  }

  pub fn at(pos: Vector2d) -> TrackedPoint {
    TrackedPoint { pos, gain: 1., valid: true }
  }
}

pub struct OpticalFlow<C: Compute> {
  iterations: usize,
  levels: usize,
  level_skip: usize,
  window: usize,
  margin: f64,
  convergence_threshold: f64,
  ssd_threshold: f64,
  gain_mode: GainMode,
  compute: C,
  width: usize,
  height: usize,
  capacity: usize,
  // Ping-pong feature buffers bound to the read and write roles.
  // The swap reassigns roles, the data is never copied.
  buffers: [Vec<TrackedPoint>; 2],
  read_ind: usize,
}

impl<C: Compute> OpticalFlow<C> {
  pub fn new(p: &ParameterSet, compute: C) -> Result<OpticalFlow<C>> {
    if p.klt_levels < 1 {
      bail!("KLT tracker needs at least one pyramid level.");
    }
    if p.klt_window < 1 {
      bail!("KLT tracking window half-width must be at least 1.");
    }
    // Skip 0 means going straight from the coarsest level to the
    // finest, which is always visited.
    let level_skip = if p.klt_level_skip == 0 {
      usize::max(p.klt_levels - 1, 1)
    }
    else {
      p.klt_level_skip
    };
    Ok(OpticalFlow {
      iterations: p.klt_iterations,
      levels: p.klt_levels,
      level_skip,
      window: p.klt_window,
      margin: p.klt_track_border,
      convergence_threshold: p.klt_convergence_threshold,
      ssd_threshold: p.klt_ssd_threshold,
      gain_mode: if p.klt_track_gain { GainMode::Estimated } else { GainMode::Fixed },
      compute,
      width: 0,
      height: 0,
      capacity: 0,
      buffers: [vec![], vec![]],
      read_ind: 0,
    })
  }

  pub fn allocate(
    &mut self,
    width: usize,
    height: usize,
    capacity: usize,
  ) -> Result<()> {
    if self.width != 0 {
      bail!("Optical flow is already allocated, call deallocate() first.");
    }
    self.width = width;
    self.height = height;
    self.capacity = capacity;
    for buffer in self.buffers.iter_mut() {
      buffer.clear();
      buffer.resize(capacity, TrackedPoint::invalid());
    }
    Ok(())
  }

  pub fn deallocate(&mut self) {
    self.width = 0;
    self.height = 0;
    self.capacity = 0;
    self.buffers = [vec![], vec![]];
    self.read_ind = 0;
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn swap_feature_buffers(&mut self) {
    self.read_ind = 1 - self.read_ind;
  }

  // Fills the write buffer. Excess points past the capacity are
  // dropped, missing slots are marked invalid.
  pub fn provide_features(&mut self, features: &[TrackedPoint]) -> Result<()> {
    if self.width == 0 {
      bail!("Optical flow used before allocate().");
    }
    let write = &mut self.buffers[1 - self.read_ind];
    for (slot, value) in write.iter_mut().enumerate() {
      *value = if slot < features.len() { features[slot] } else { TrackedPoint::invalid() };
    }
    Ok(())
  }

  // Copies the write buffer, one entry per slot.
  pub fn read_features(&self, dest: &mut Vec<TrackedPoint>) -> Result<()> {
    if self.width == 0 {
      bail!("Optical flow used before allocate().");
    }
    dest.clear();
    dest.extend_from_slice(&self.buffers[1 - self.read_ind]);
    Ok(())
  }

  // Tracks every valid slot of the read buffer from `prev` to `curr`
  // and stores the results in the write buffer. Slots are independent
  // of each other; per-point divergence is reported by marking the
  // slot invalid, never as an error.
  pub fn track_features(&mut self, prev: &Pyramid, curr: &Pyramid) -> Result<()> {
    if self.width == 0 {
      bail!("Optical flow used before allocate().");
    }
    for (name, pyramid) in [("previous", prev), ("current", curr)] {
      if pyramid.width() != self.width || pyramid.height() != self.height {
        bail!("Optical flow allocated for {}x{} but the {} pyramid is {}x{}.",
          self.width, self.height, name, pyramid.width(), pyramid.height());
      }
      if pyramid.level_count() < self.levels {
        bail!("Optical flow needs {} pyramid levels, the {} pyramid has {}.",
          self.levels, name, pyramid.level_count());
      }
    }

    let read = &self.buffers[self.read_ind];
    let results = self.compute.map_list(self.capacity, |slot| {
      let point = read[slot];
      if !point.valid {
        return TrackedPoint::invalid();
      }
      self.solve_point(point, prev, curr).unwrap_or(TrackedPoint::invalid())
    });
    self.buffers[1 - self.read_ind].copy_from_slice(&results);
    Ok(())
  }

  // Coarse-to-fine solve for a single point. `None` means the point
  // diverged and should be dropped by the caller.
  fn solve_point(
    &self,
    point: TrackedPoint,
    prev: &Pyramid,
    curr: &Pyramid,
  ) -> Option<TrackedPoint> {
    let mut d = Vector2d::zeros();
    let mut gain = point.gain;
    let mut level = self.levels - 1;
    loop {
      self.solve_level(&prev.levels[level], &curr.levels[level],
        point.pos / f64::powi(2., level as i32), &mut d, &mut gain)?;
      if level == 0 { break }
      let next = level.saturating_sub(self.level_skip);
      // Displacements double per level of added resolution.
      d *= f64::powi(2., (level - next) as i32);
      level = next;
    }

    let pos = point.pos + d;
    if pos[0] < self.margin || pos[0] >= self.width as f64 - self.margin
      || pos[1] < self.margin || pos[1] >= self.height as f64 - self.margin {
      return None;
    }
    if self.residual_ssd(&prev.levels[0], &curr.levels[0], point.pos, d, gain)
      > self.ssd_threshold {
      return None;
    }
    Some(TrackedPoint { pos, gain, valid: true })
  }

  // Newton-style iteration at one pyramid level, accumulating into the
  // displacement (and gain) estimate.
  fn solve_level(
    &self,
    prev_level: &PyramidLevel,
    curr_level: &PyramidLevel,
    u: Vector2d,
    d: &mut Vector2d,
    gain: &mut f64,
  ) -> Option<()> {
    if !prev_level.intensity.contains(u) {
      return None;
    }
    let w = self.window as i64;
    let side = (2 * self.window + 1) as i64;
    let n = (side * side) as usize;

    // The template intensities and gradients come from the previous
    // frame and stay fixed over the iteration, so the structure matrix
    // is accumulated once per level.
    let mut t = Vec::with_capacity(n);
    let mut gx = Vec::with_capacity(n);
    let mut gy = Vec::with_capacity(n);
    for j in -w..=w {
      for i in -w..=w {
        let p = u + Vector2d::new(i as f64, j as f64);
        t.push(prev_level.intensity.bilinear(p));
        gx.push(prev_level.grad_x.bilinear(p));
        gy.push(prev_level.grad_y.bilinear(p));
      }
    }

    match self.gain_mode {
      GainMode::Fixed => {
        let mut gxx = 0.;
        let mut gxy = 0.;
        let mut gyy = 0.;
        for ind in 0..n {
          gxx += gx[ind] * gx[ind];
          gxy += gx[ind] * gy[ind];
          gyy += gy[ind] * gy[ind];
        }
        let g_mat = Matrix2d::new(gxx, gxy, gxy, gyy);
        if g_mat.determinant().abs() < DET_EPSILON {
          return None;
        }
        let g_inv = g_mat.try_inverse()?;
        for _ in 0..self.iterations {
          let center = u + *d;
          if !curr_level.intensity.contains(center) {
            return None;
          }
          let mut b = Vector2d::zeros();
          let mut ind = 0;
          for j in -w..=w {
            for i in -w..=w {
              let r = curr_level.intensity.bilinear(center + Vector2d::new(i as f64, j as f64))
                - *gain * t[ind];
              b[0] += gx[ind] * r;
              b[1] += gy[ind] * r;
              ind += 1;
            }
          }
          let delta = -(g_inv * b);
          *d += delta;
          if delta.norm() < self.convergence_threshold {
            break;
          }
        }
      },
      GainMode::Estimated => {
        // Per-pixel residual jacobian is (gx, gy, -t), giving a 3x3
        // system that updates the gain together with the position.
        let mut a_mat = Matrix3d::zeros();
        for ind in 0..n {
          a_mat[(0, 0)] += gx[ind] * gx[ind];
          a_mat[(0, 1)] += gx[ind] * gy[ind];
          a_mat[(0, 2)] -= gx[ind] * t[ind];
          a_mat[(1, 1)] += gy[ind] * gy[ind];
          a_mat[(1, 2)] -= gy[ind] * t[ind];
          a_mat[(2, 2)] += t[ind] * t[ind];
        }
        a_mat[(1, 0)] = a_mat[(0, 1)];
        a_mat[(2, 0)] = a_mat[(0, 2)];
        a_mat[(2, 1)] = a_mat[(1, 2)];
        if a_mat.determinant().abs() < DET_EPSILON {
          return None;
        }
        let a_inv = a_mat.try_inverse()?;
        for _ in 0..self.iterations {
          let center = u + *d;
          if !curr_level.intensity.contains(center) {
            return None;
          }
          let mut b = Vector3d::zeros();
          let mut ind = 0;
          for j in -w..=w {
            for i in -w..=w {
              let r = curr_level.intensity.bilinear(center + Vector2d::new(i as f64, j as f64))
                - *gain * t[ind];
              b[0] += gx[ind] * r;
              b[1] += gy[ind] * r;
              b[2] -= t[ind] * r;
              ind += 1;
            }
          }
          let delta = -(a_inv * b);
          *d += Vector2d::new(delta[0], delta[1]);
          *gain += delta[2];
          if Vector2d::new(delta[0], delta[1]).norm() < self.convergence_threshold {
            break;
          }
        }
      },
    }
    Some(())
  }

  // Sum of squared differences over the window at the finest level,
  // used as the divergence measure.
  fn residual_ssd(
    &self,
    prev_level: &PyramidLevel,
    curr_level: &PyramidLevel,
    pos0: Vector2d,
    d: Vector2d,
    gain: f64,
  ) -> f64 {
    let w = self.window as i64;
    let mut ssd = 0.;
    for j in -w..=w {
      for i in -w..=w {
        let offset = Vector2d::new(i as f64, j as f64);
        let r = curr_level.intensity.bilinear(pos0 + d + offset)
          - gain * prev_level.intensity.bilinear(pos0 + offset);
        ssd += r * r;
      }
    }
    ssd
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // Gaussian blob centered at (cx, cy), zero background.
  fn blob(width: usize, height: usize, cx: f64, cy: f64, falloff: f64) -> Image {
    let mut image = Image::new(width, height);
    for y in 0..height {
      for x in 0..width {
        let dx = x as f64 - cx;
        let dy = y as f64 - cy;
        let value = 150. * (-falloff * (dx * dx + dy * dy)).exp();
        image.set_value(x, y, value as u8);
      }
    }
    image
  }

  fn scaled(image: &Image, factor: f64) -> Image {
    let mut out = image.clone();
    for value in out.data.iter_mut() {
      *value = (*value as f64 * factor) as u8;
    }
    out
  }

  fn track_one(
    p: &ParameterSet,
    image0: &Image,
    image1: &Image,
    start: Vector2d,
  ) -> TrackedPoint {
    let prev = Pyramid::new(image0, None, p.klt_levels).unwrap();
    let curr = Pyramid::new(image1, None, p.klt_levels).unwrap();
    let mut flow = OpticalFlow::new(p, Serial).unwrap();
    flow.allocate(image0.width, image0.height, 4).unwrap();
    flow.provide_features(&[TrackedPoint::at(start)]).unwrap();
    flow.swap_feature_buffers();
    flow.track_features(&prev, &curr).unwrap();
    let mut result = vec![];
    flow.read_features(&mut result).unwrap();
    result[0]
  }

  #[test]
  fn test_integer_translation() {
    let p = ParameterSet::default();
    let image0 = blob(120, 120, 40., 40., 0.005);
    let image1 = blob(120, 120, 42., 41., 0.005);
    let point = track_one(&p, &image0, &image1, Vector2d::new(40., 40.));
    assert!(point.valid);
    assert!((point.pos - Vector2d::new(42., 41.)).norm() < 0.2,
      "tracked to {:?}", point.pos);
  }

  #[test]
  fn test_subpixel_translation() {
    let p = ParameterSet::default();
    let image0 = blob(120, 120, 40., 40., 0.005);
    let image1 = blob(120, 120, 41.5, 40.5, 0.005);
    let point = track_one(&p, &image0, &image1, Vector2d::new(40., 40.));
    assert!(point.valid);
    assert!((point.pos - Vector2d::new(41.5, 40.5)).norm() < 0.3,
      "tracked to {:?}", point.pos);
  }

  #[test]
  fn test_zero_motion() {
    let p = ParameterSet::default();
    let image = blob(120, 120, 40., 40., 0.005);
    let point = track_one(&p, &image, &image, Vector2d::new(40., 40.));
    assert!(point.valid);
    assert!((point.pos - Vector2d::new(40., 40.)).norm() < 0.1);
  }

  #[test]
  fn test_flat_region_diverges() {
    let p = ParameterSet::default();
    let image = Image::new(120, 120);
    let point = track_one(&p, &image, &image, Vector2d::new(60., 60.));
    assert!(!point.valid);
  }

  #[test]
  fn test_displacement_beyond_range_diverges() {
    let p = ParameterSet::default();
    // A narrow blob moving much further than the coarse-to-fine
    // search range can represent.
    let image0 = blob(160, 160, 50., 50., 0.02);
    let image1 = blob(160, 160, 110., 50., 0.02);
    let point = track_one(&p, &image0, &image1, Vector2d::new(50., 50.));
    assert!(!point.valid);
  }

  #[test]
  fn test_gain_estimation() {
    let mut p = ParameterSet::default();
    p.klt_track_gain = true;
    let image0 = blob(120, 120, 40., 40., 0.005);
    let image1 = scaled(&blob(120, 120, 42., 40., 0.005), 1.3);
    let point = track_one(&p, &image0, &image1, Vector2d::new(40., 40.));
    assert!(point.valid);
    assert!((point.pos - Vector2d::new(42., 40.)).norm() < 0.3,
      "tracked to {:?}", point.pos);
    assert!((point.gain - 1.3).abs() < 0.1, "gain {}", point.gain);
  }

  #[test]
  fn test_ping_pong_roles() {
    let p = ParameterSet::default();
    let mut flow = OpticalFlow::new(&p, Serial).unwrap();
    flow.allocate(64, 64, 2).unwrap();
    let a = TrackedPoint::at(Vector2d::new(10., 10.));
    let b = TrackedPoint::at(Vector2d::new(20., 20.));
    flow.provide_features(&[a]).unwrap();
    flow.swap_feature_buffers();
    flow.provide_features(&[b]).unwrap();

    // The write role moved back to the first buffer, whose contents
    // must be exactly what was provided before the swap.
    flow.swap_feature_buffers();
    let mut dest = vec![];
    flow.read_features(&mut dest).unwrap();
    assert_eq!(dest.len(), 2);
    assert!(dest[0].valid);
    assert_eq!(dest[0].pos, a.pos);
    assert!(!dest[1].valid);
  }

  #[test]
  fn test_provide_truncates_at_capacity() {
    let p = ParameterSet::default();
    let mut flow = OpticalFlow::new(&p, Serial).unwrap();
    flow.allocate(64, 64, 2).unwrap();
    let points = vec![TrackedPoint::at(Vector2d::new(5., 5.)); 5];
    flow.provide_features(&points).unwrap();
    let mut dest = vec![];
    flow.read_features(&mut dest).unwrap();
    assert_eq!(dest.len(), 2);
  }

  #[test]
  fn test_use_before_allocate() {
    let p = ParameterSet::default();
    let image = blob(64, 64, 32., 32., 0.005);
    let pyramid = Pyramid::new(&image, None, p.klt_levels).unwrap();
    let mut flow = OpticalFlow::new(&p, Serial).unwrap();
    assert!(flow.track_features(&pyramid, &pyramid).is_err());
    assert!(flow.provide_features(&[]).is_err());
  }

  #[test]
  fn test_resolution_mismatch() {
    let p = ParameterSet::default();
    let image = blob(64, 64, 32., 32., 0.005);
    let pyramid = Pyramid::new(&image, None, p.klt_levels).unwrap();
    let mut flow = OpticalFlow::new(&p, Serial).unwrap();
    flow.allocate(128, 128, 4).unwrap();
    assert!(flow.track_features(&pyramid, &pyramid).is_err());
  }

  #[test]
  fn test_level_skip_extremes() {
    // Visiting only the coarsest and finest levels must still recover
    // a small translation.
    let mut p = ParameterSet::default();
    p.klt_level_skip = 0;
    let image0 = blob(120, 120, 40., 40., 0.005);
    let image1 = blob(120, 120, 42., 41., 0.005);
    let point = track_one(&p, &image0, &image1, Vector2d::new(40., 40.));
    assert!(point.valid);
    assert!((point.pos - Vector2d::new(42., 41.)).norm() < 0.2);
  }
}
