use crate::all::*;

// Sequence-level controller. Owns the persistent track table, runs the
// per-frame detect/track/merge operations, assigns and retires track
// identities and advances the double-buffered frame state. This is the
// only place the track table is mutated.

#[derive(Clone, Copy)]
struct Slot {
  id: Option<TrackId>,
  status: TrackStatus,
  source: Option<usize>,
}

impl Slot {
  fn empty() -> Slot {
    Slot {
      id: None,
      status: TrackStatus::Lost,
      source: None,
    }
  }
}

pub struct Tracker<C: Compute> {
  detector: Detector<C>,
  flow: OpticalFlow<C>,
  levels: usize,
  min_cornerness: f64,
  margin: f64,
  max_tracks: usize,
  width: usize,
  height: usize,
  // Pyramids bound to the previous/current frame roles; advancing the
  // frame swaps the roles, never the data.
  pyramids: [Option<Pyramid>; 2],
  curr_ind: usize,
  slots: Vec<Slot>,
  // Host-side copy of the feature slot states fed to the optical flow.
  points: Vec<TrackedPoint>,
  next_id: u64,
  // Scratch reused between calls.
  corners: Vec<Corner>,
  results: Vec<TrackedPoint>,
  has_previous: bool,
  frame_open: bool,
}

impl<C: Compute + Clone> Tracker<C> {
  pub fn new(p: &ParameterSet, compute: C) -> Result<Tracker<C>> {
    Ok(Tracker {
      detector: Detector::new(p, compute.clone()),
      flow: OpticalFlow::new(p, compute)?,
      levels: p.klt_levels,
      min_cornerness: p.klt_min_cornerness,
      margin: p.klt_track_border,
      max_tracks: p.max_tracks,
      width: 0,
      height: 0,
      pyramids: [None, None],
      curr_ind: 0,
      slots: vec![],
      points: vec![],
      next_id: 0,
      corners: vec![],
      results: vec![],
      has_previous: false,
      frame_open: false,
    })
  }

  pub fn allocate(&mut self, width: usize, height: usize) -> Result<()> {
    if self.width != 0 {
      bail!("Tracker is already allocated, call deallocate() first.");
    }
    self.width = width;
    self.height = height;
    // The corner list holds more candidates than there are feature
    // slots so that replenishment can pick the strongest ones.
    self.detector.allocate(width, height, 2 * self.max_tracks)?;
    self.flow.allocate(width, height, self.max_tracks)?;
    self.slots.resize(self.max_tracks, Slot::empty());
    self.points.resize(self.max_tracks, TrackedPoint::invalid());
    Ok(())
  }

  pub fn deallocate(&mut self) {
    self.detector.deallocate();
    self.flow.deallocate();
    self.width = 0;
    self.height = 0;
    self.pyramids = [None, None];
    self.curr_ind = 0;
    self.slots.clear();
    self.points.clear();
    self.has_previous = false;
    self.frame_open = false;
  }

  pub fn capacity(&self) -> usize {
    self.max_tracks
  }

  pub fn live_count(&self) -> usize {
    (0..self.slots.len()).filter(|ind| self.is_live(*ind)).count()
  }

  // Detects corners on `image` away from the already live tracks and
  // assigns fresh identities to them. Returns the number of created
  // tracks; `dest` receives one entry per feature slot.
  pub fn detect(
    &mut self,
    image: &Image,
    dest: &mut Vec<TrackedFeature>,
  ) -> Result<usize> {
    self.build_current_pyramid(image)?;
    let created = self.detect_new_features()?;
    self.flow.provide_features(&self.points)?;
    self.frame_open = true;
    self.report(dest);
    debug!("Detected {} new features, {} live.", created, self.live_count());
    Ok(created)
  }

  // Tracks the live features from the previous frame into `image`.
  // Divergent tracks are demoted to Lost and their slots freed.
  // Returns the number of surviving tracks.
  pub fn track(
    &mut self,
    image: &Image,
    dest: &mut Vec<TrackedFeature>,
  ) -> Result<usize> {
    let surviving = self.track_internal(image)?;
    self.flow.provide_features(&self.points)?;
    self.frame_open = true;
    self.report(dest);
    Ok(surviving)
  }

  // Track, then refill the freed capacity with corners detected on the
  // same frame. Returns the number of created tracks.
  pub fn redetect(
    &mut self,
    image: &Image,
    dest: &mut Vec<TrackedFeature>,
  ) -> Result<usize> {
    let surviving = self.track_internal(image)?;
    let created = self.detect_new_features()?;
    self.flow.provide_features(&self.points)?;
    self.frame_open = true;
    self.report(dest);
    debug!("Redetect kept {} and created {} features.", surviving, created);
    Ok(created)
  }

  // Injects externally supplied points into free tracking slots,
  // bypassing corner detection. Points outside the tracking margins
  // are ignored. Returns the identities actually fed; feeding stops
  // once the capacity is used up.
  pub fn feed_extern_feature_points(
    &mut self,
    points: &[Vector2d],
  ) -> Result<Vec<TrackId>> {
    if self.width == 0 {
      bail!("Tracker used before allocate().");
    }
    let free: Vec<usize> = (0..self.max_tracks)
      .filter(|ind| !self.is_live(*ind))
      .collect();
    let mut free_iter = free.into_iter();
    let mut fed = vec![];
    for p in points {
      if p[0] < self.margin || p[0] >= self.width as f64 - self.margin
        || p[1] < self.margin || p[1] >= self.height as f64 - self.margin {
        warn!("Ignoring fed feature point {:?} outside the tracking margins.", p);
        continue;
      }
      let ind = match free_iter.next() {
        Some(ind) => ind,
        None => break,
      };
      let id = self.assign_id();
      self.slots[ind] = Slot {
        id: Some(id),
        status: TrackStatus::New,
        source: None,
      };
      self.points[ind] = TrackedPoint::at(*p);
      fed.push(id);
    }
    self.flow.provide_features(&self.points)?;
    self.frame_open = true;
    Ok(fed)
  }

  // Swaps the feature buffer and pyramid roles. Must be called exactly
  // once per processed frame, after all reads of the current state.
  pub fn advance_frame(&mut self) -> Result<()> {
    if self.width == 0 {
      bail!("Tracker used before allocate().");
    }
    if !self.frame_open {
      bail!("advance_frame() called without processing a frame first.");
    }
    self.flow.swap_feature_buffers();
    self.curr_ind = 1 - self.curr_ind;
    self.has_previous = true;
    self.frame_open = false;
    // Lost records only live until the frame boundary.
    for slot in self.slots.iter_mut() {
      if slot.status == TrackStatus::Lost {
        *slot = Slot::empty();
      }
    }
    Ok(())
  }

  fn is_live(&self, ind: usize) -> bool {
    self.slots[ind].id.is_some() && self.slots[ind].status != TrackStatus::Lost
  }

  fn assign_id(&mut self) -> TrackId {
    let id = TrackId(self.next_id);
    self.next_id += 1;
    id
  }

  fn build_current_pyramid(&mut self, image: &Image) -> Result<()> {
    if self.width == 0 {
      bail!("Tracker used before allocate().");
    }
    if image.width != self.width || image.height != self.height {
      bail!("Tracker allocated for {}x{} but got a {}x{} image.",
        self.width, self.height, image.width, image.height);
    }
    let unused = self.pyramids[self.curr_ind].take();
    self.pyramids[self.curr_ind] = Some(Pyramid::new(image, unused, self.levels)?);
    Ok(())
  }

  fn track_internal(&mut self, image: &Image) -> Result<usize> {
    if !self.has_previous {
      bail!("track() called before any frame was processed and advanced.");
    }
    self.build_current_pyramid(image)?;
    let prev = self.pyramids[1 - self.curr_ind].as_ref()
      .ok_or_else(|| anyhow!("Previous frame pyramid is missing."))?;
    let curr = self.pyramids[self.curr_ind].as_ref()
      .ok_or_else(|| anyhow!("Current frame pyramid is missing."))?;
    self.flow.track_features(prev, curr)?;

    let mut results = std::mem::take(&mut self.results);
    self.flow.read_features(&mut results)?;
    let live_before = self.live_count();
    let mut surviving = 0;
    for ind in 0..self.max_tracks {
      if !self.is_live(ind) {
        continue;
      }
      if results[ind].valid {
        self.slots[ind].status = TrackStatus::Tracked;
        self.slots[ind].source = Some(ind);
        self.points[ind] = results[ind];
        surviving += 1;
      }
      else {
        self.slots[ind].status = TrackStatus::Lost;
        self.points[ind].valid = false;
      }
    }
    self.results = results;
    debug!("Tracked {}/{} features.", surviving, live_before);
    Ok(surviving)
  }

  // Fills free slots with detected corners, strongest first. Corners
  // cannot appear within the minimum distance of a live track, which
  // gives survivors precedence over new candidates.
  fn detect_new_features(&mut self) -> Result<usize> {
    let curr = self.pyramids[self.curr_ind].as_ref()
      .ok_or_else(|| anyhow!("Current frame pyramid is missing."))?;
    let existing: Vec<Vector2d> = (0..self.max_tracks)
      .filter(|ind| self.is_live(*ind))
      .map(|ind| self.points[ind].pos)
      .collect();
    let n = self.detector.detect_corners(self.min_cornerness, &curr.levels[0], &existing)?;
    let mut corners = std::mem::take(&mut self.corners);
    self.detector.extract_corners(n, &mut corners);

    let mut created = 0;
    let mut supply = corners.iter();
    for ind in 0..self.max_tracks {
      if self.is_live(ind) {
        continue;
      }
      let corner = match supply.next() {
        Some(corner) => *corner,
        None => break,
      };
      let id = self.assign_id();
      self.slots[ind] = Slot {
        id: Some(id),
        status: TrackStatus::New,
        source: None,
      };
      self.points[ind] = TrackedPoint::at(corner.point);
      created += 1;
    }
    self.corners = corners;
    Ok(created)
  }

  fn report(&self, dest: &mut Vec<TrackedFeature>) {
    dest.clear();
    for ind in 0..self.max_tracks {
      let slot = self.slots[ind];
      dest.push(match slot.id {
        Some(id) => TrackedFeature {
          id: Some(id),
          status: slot.status,
          point: self.points[ind].pos,
          gain: self.points[ind].gain,
          source: slot.source,
        },
        None => TrackedFeature::empty(),
      });
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // Checkerboard whose pattern is translated by (dx, dy).
  fn checkerboard(width: usize, height: usize, cell: usize, dx: i64, dy: i64) -> Image {
    let mut image = Image::new(width, height);
    let far = 1000 * cell as i64;
    for y in 0..height {
      for x in 0..width {
        let cx = (x as i64 - dx + far) / cell as i64;
        let cy = (y as i64 - dy + far) / cell as i64;
        let value = if (cx + cy) % 2 == 0 { 0 } else { 255 };
        image.set_value(x, y, value);
      }
    }
    image
  }

  fn live_features(dest: &[TrackedFeature]) -> Vec<(usize, TrackedFeature)> {
    dest.iter().enumerate()
      .filter(|(_, f)| f.id.is_some() && f.status != TrackStatus::Lost)
      .map(|(ind, f)| (ind, *f))
      .collect()
  }

  #[test]
  fn test_sequence_scenario() {
    let p = ParameterSet::default();
    let mut tracker = Tracker::new(&p, Serial).unwrap();
    tracker.allocate(96, 96).unwrap();
    let mut dest = vec![];

    // Frame 1: fresh detection on a static checkerboard.
    let frame1 = checkerboard(96, 96, 12, 0, 0);
    let created = tracker.detect(&frame1, &mut dest).unwrap();
    assert!(created >= 25, "only {} corners detected", created);
    assert_eq!(dest.len(), tracker.capacity());
    let initial = live_features(&dest);
    assert_eq!(initial.len(), created);
    let mut ids: Vec<TrackId> = initial.iter().map(|(_, f)| f.id.unwrap()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), created, "identities must be unique");
    for (_, f) in &initial {
      assert_eq!(f.status, TrackStatus::New);
    }
    tracker.advance_frame().unwrap();

    // Frame 2: the same pattern shifted by (2, 1) pixels.
    let frame2 = checkerboard(96, 96, 12, 2, 1);
    let surviving = tracker.track(&frame2, &mut dest).unwrap();
    assert_eq!(surviving, created);
    for (ind, f0) in &initial {
      let f1 = dest[*ind];
      assert_eq!(f1.id, f0.id);
      assert_eq!(f1.status, TrackStatus::Tracked);
      assert_eq!(f1.source, Some(*ind));
      let expected = f0.point + Vector2d::new(2., 1.);
      assert!((f1.point - expected).norm() < 0.2,
        "track {:?} at {:?}, expected {:?}", f1.id, f1.point, expected);
    }
    tracker.advance_frame().unwrap();

    // Frame 3: a blank image loses every track.
    let frame3 = Image::new(96, 96);
    let surviving = tracker.track(&frame3, &mut dest).unwrap();
    assert_eq!(surviving, 0);
    assert_eq!(tracker.live_count(), 0);
    for (ind, f0) in &initial {
      assert_eq!(dest[*ind].id, f0.id);
      assert_eq!(dest[*ind].status, TrackStatus::Lost);
    }
    tracker.advance_frame().unwrap();

    // Replenishing afterwards hands out only fresh identities.
    let frame4 = checkerboard(96, 96, 12, 0, 0);
    let recreated = tracker.redetect(&frame4, &mut dest).unwrap();
    assert!(recreated >= 25);
    let max_old = ids.iter().max().unwrap();
    for (_, f) in live_features(&dest) {
      assert_eq!(f.status, TrackStatus::New);
      assert!(f.id.unwrap() > *max_old);
    }
  }

  #[test]
  fn test_redetect_excludes_survivors() {
    let mut p = ParameterSet::default();
    p.max_tracks = 100;
    let mut tracker = Tracker::new(&p, Serial).unwrap();
    tracker.allocate(96, 96).unwrap();
    let mut dest = vec![];

    let frame1 = checkerboard(96, 96, 24, 0, 0);
    tracker.detect(&frame1, &mut dest).unwrap();
    tracker.advance_frame().unwrap();

    // Finer pattern offers more corners; survivors from the coarse
    // pattern cannot be crowded by them.
    let frame2 = checkerboard(96, 96, 24, 1, 0);
    tracker.redetect(&frame2, &mut dest).unwrap();
    let live = live_features(&dest);
    for (i, (_, a)) in live.iter().enumerate() {
      for (_, b) in live.iter().skip(i + 1) {
        let d = f64::max((a.point[0] - b.point[0]).abs(), (a.point[1] - b.point[1]).abs());
        assert!(d >= p.klt_min_distance as f64,
          "tracks at {:?} and {:?} too close", a.point, b.point);
      }
    }
  }

  #[test]
  fn test_feed_extern_feature_points() {
    let mut p = ParameterSet::default();
    p.max_tracks = 4;
    let mut tracker = Tracker::new(&p, Serial).unwrap();
    tracker.allocate(64, 64).unwrap();

    let points = vec![
      Vector2d::new(10., 10.),
      Vector2d::new(20., 20.),
      // Outside the tracking margin, must be ignored.
      Vector2d::new(1., 1.),
      Vector2d::new(30., 30.),
      Vector2d::new(40., 40.),
      Vector2d::new(50., 50.),
    ];
    let fed = tracker.feed_extern_feature_points(&points).unwrap();
    // Capacity is 4 and one candidate was out of bounds.
    assert_eq!(fed.len(), 4);
    assert_eq!(tracker.live_count(), 4);
    let mut unique = fed.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), fed.len());
  }

  #[test]
  fn test_contract_violations() {
    let p = ParameterSet::default();
    let mut dest = vec![];
    let image = checkerboard(64, 64, 8, 0, 0);

    let mut tracker = Tracker::new(&p, Serial).unwrap();
    assert!(tracker.detect(&image, &mut dest).is_err());
    assert!(tracker.advance_frame().is_err());

    tracker.allocate(64, 64).unwrap();
    // No previous frame yet.
    assert!(tracker.track(&image, &mut dest).is_err());
    // Nothing processed yet either.
    assert!(tracker.advance_frame().is_err());

    tracker.detect(&image, &mut dest).unwrap();
    tracker.advance_frame().unwrap();
    assert!(tracker.advance_frame().is_err());

    // Resolution changes require an explicit reallocation.
    let small = checkerboard(32, 32, 8, 0, 0);
    assert!(tracker.track(&small, &mut dest).is_err());
    assert!(tracker.allocate(32, 32).is_err());
    tracker.deallocate();
    tracker.allocate(32, 32).unwrap();
    tracker.detect(&small, &mut dest).unwrap();
  }

  #[test]
  fn test_capacity_bounds_live_tracks() {
    let mut p = ParameterSet::default();
    p.max_tracks = 10;
    let mut tracker = Tracker::new(&p, Serial).unwrap();
    tracker.allocate(96, 96).unwrap();
    let mut dest = vec![];
    let frame = checkerboard(96, 96, 12, 0, 0);
    let created = tracker.detect(&frame, &mut dest).unwrap();
    assert_eq!(created, 10);
    assert_eq!(tracker.live_count(), 10);
    assert_eq!(dest.len(), 10);
  }
}
