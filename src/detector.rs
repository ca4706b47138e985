use crate::all::*;

// Corner detection on the finest pyramid level: structure tensor
// cornerness, non-maximum suppression under a minimum distance
// constraint, and hierarchical compaction of the sparse survivor mask
// into a dense point list.

// Half-width of the window the gradient products are summed over.
const STRUCTURE_WINDOW: i64 = 1;

#[derive(Clone, Copy, Debug)]
pub struct Corner {
  pub point: Vector2d,
  pub score: f64,
}

pub struct Detector<C: Compute> {
  min_distance: usize,
  border: f64,
  compute: C,
  width: usize,
  height: usize,
  list_capacity: usize,
  // Working state. The contents are rebuilt on every detection call,
  // only the allocations persist.
  rows_xx: Vec<f32>,
  rows_xy: Vec<f32>,
  rows_yy: Vec<f32>,
  cornerness: Vec<f32>,
  nonmax: Vec<f32>,
  existing_mask: Vec<bool>,
  corners: Vec<Corner>,
}

impl<C: Compute> Detector<C> {
  pub fn new(p: &ParameterSet, compute: C) -> Detector<C> {
    Detector {
      min_distance: p.klt_min_distance,
      border: p.klt_detect_border,
      compute,
      width: 0,
      height: 0,
      list_capacity: 0,
      rows_xx: vec![],
      rows_xy: vec![],
      rows_yy: vec![],
      cornerness: vec![],
      nonmax: vec![],
      existing_mask: vec![],
      corners: vec![],
    }
  }

  pub fn allocate(
    &mut self,
    width: usize,
    height: usize,
    list_capacity: usize,
  ) -> Result<()> {
    if self.width != 0 {
      bail!("Detector is already allocated, call deallocate() first.");
    }
    self.width = width;
    self.height = height;
    self.list_capacity = list_capacity;
    let n = width * height;
    self.rows_xx.resize(n, 0.);
    self.rows_xy.resize(n, 0.);
    self.rows_yy.resize(n, 0.);
    self.cornerness.resize(n, 0.);
    self.nonmax.resize(n, 0.);
    self.existing_mask.resize(n, false);
    self.corners.reserve(list_capacity);
    Ok(())
  }

  pub fn deallocate(&mut self) {
    self.width = 0;
    self.height = 0;
    self.list_capacity = 0;
    self.rows_xx.clear();
    self.rows_xy.clear();
    self.rows_yy.clear();
    self.cornerness.clear();
    self.nonmax.clear();
    self.existing_mask.clear();
    self.corners.clear();
  }

  // Returns the number of corners available for `extract_corners()`,
  // at most the allocated list capacity. Cells within the minimum
  // distance of an `existing` position are excluded so that new
  // corners never collide with points that are already tracked.
  pub fn detect_corners(
    &mut self,
    min_cornerness: f64,
    level: &PyramidLevel,
    existing: &[Vector2d],
  ) -> Result<usize> {
    if self.width == 0 {
      bail!("Detector used before allocate().");
    }
    if level.width() != self.width || level.height() != self.height {
      bail!("Detector allocated for {}x{} but got a {}x{} pyramid level.",
        self.width, self.height, level.width(), level.height());
    }
    let width = self.width;
    let height = self.height;
    let compute = &self.compute;

    // Row-wise sums of the gradient products. The column sums complete
    // the structure tensor in the next pass.
    let grad_x = &level.grad_x;
    let grad_y = &level.grad_y;
    let row_sum = |f: &dyn Fn(i64, i64) -> f32, x: usize, y: usize| -> f32 {
      let mut s = 0.;
      for c in -STRUCTURE_WINDOW..=STRUCTURE_WINDOW {
        s += f(x as i64 + c, y as i64);
      }
      s
    };
    compute.fill_grid(width, height, &mut self.rows_xx, |x, y| {
      row_sum(&|x, y| { let g = grad_x.value_clamped(x, y); g * g }, x, y)
    });
    compute.fill_grid(width, height, &mut self.rows_xy, |x, y| {
      row_sum(&|x, y| grad_x.value_clamped(x, y) * grad_y.value_clamped(x, y), x, y)
    });
    compute.fill_grid(width, height, &mut self.rows_yy, |x, y| {
      row_sum(&|x, y| { let g = grad_y.value_clamped(x, y); g * g }, x, y)
    });

    // Cornerness is the smaller structure tensor eigenvalue, zeroed
    // below the threshold and inside the border margins.
    let rows_xx = &self.rows_xx;
    let rows_xy = &self.rows_xy;
    let rows_yy = &self.rows_yy;
    let border = self.border;
    let threshold = min_cornerness as f32;
    compute.fill_grid(width, height, &mut self.cornerness, |x, y| {
      if (x as f64) < border || (x as f64) >= width as f64 - border
        || (y as f64) < border || (y as f64) >= height as f64 - border {
        return 0.;
      }
      let mut sxx = 0.;
      let mut sxy = 0.;
      let mut syy = 0.;
      for r in -STRUCTURE_WINDOW..=STRUCTURE_WINDOW {
        let yc = i64::min(i64::max(y as i64 + r, 0), height as i64 - 1) as usize;
        sxx += rows_xx[yc * width + x];
        sxy += rows_xy[yc * width + x];
        syy += rows_yy[yc * width + x];
      }
      let lambda_min = 0.5 * (sxx + syy
        - ((sxx - syy) * (sxx - syy) + 4. * sxy * sxy).sqrt());
      if lambda_min >= threshold { lambda_min } else { 0. }
    });

    // Cells covered by existing tracks suppress the whole surrounding
    // minimum distance neighborhood below.
    for m in self.existing_mask.iter_mut() {
      *m = false;
    }
    for p in existing {
      let x = i64::min(i64::max(p[0].round() as i64, 0), width as i64 - 1) as usize;
      let y = i64::min(i64::max(p[1].round() as i64, 0), height as i64 - 1) as usize;
      self.existing_mask[y * width + x] = true;
    }

    // Non-maximum suppression over a square window of side
    // `2 * min_distance + 1`. Score ties go to the earlier pixel in
    // scan order so repeated runs stay deterministic.
    let cornerness = &self.cornerness;
    let existing_mask = &self.existing_mask;
    let radius = self.min_distance as i64;
    compute.fill_grid(width, height, &mut self.nonmax, |x, y| {
      let s = cornerness[y * width + x];
      if s <= 0. {
        return 0.;
      }
      let xi = x as i64;
      let yi = y as i64;
      for ny in i64::max(yi - radius, 0)..=i64::min(yi + radius, height as i64 - 1) {
        for nx in i64::max(xi - radius, 0)..=i64::min(xi + radius, width as i64 - 1) {
          let n = ny as usize * width + nx as usize;
          if existing_mask[n] {
            return 0.;
          }
          if nx == xi && ny == yi {
            continue;
          }
          let sn = cornerness[n];
          if sn > s || (sn == s && (ny < yi || (ny == yi && nx < xi))) {
            return 0.;
          }
        }
      }
      s
    });

    // Compact the survivor mask into a dense list through the count
    // hierarchy, then order by descending cornerness with scan order
    // breaking ties, dropping the weakest corners past the capacity.
    let nonmax = &self.nonmax;
    let hist = HistogramPyramid::build(width, height, |ind| nonmax[ind] > 0.);
    let total = hist.total() as usize;
    let located = compute.map_list(total, |rank| hist.locate(rank as u32));
    self.corners.clear();
    for (x, y) in located {
      self.corners.push(Corner {
        point: Vector2d::new(x as f64, y as f64),
        score: self.nonmax[y * width + x] as f64,
      });
    }
    let scan = |c: &Corner| c.point[1] as usize * width + c.point[0] as usize;
    self.corners.sort_by(|a, b| {
      b.score.partial_cmp(&a.score).unwrap().then_with(|| scan(a).cmp(&scan(b)))
    });
    self.corners.truncate(self.list_capacity);
    Ok(self.corners.len())
  }

  // Copies the first `count` detected corners, in descending
  // cornerness order.
  pub fn extract_corners(&self, count: usize, dest: &mut Vec<Corner>) {
    dest.clear();
    dest.extend_from_slice(&self.corners[..usize::min(count, self.corners.len())]);
  }
}

// Power-of-two hierarchy of partial counts over the corner mask. Each
// level halves the resolution by summing 2x2 child counts until a
// single cell holds the total. Rank lookups then traverse top-down,
// choosing the child whose cumulative count contains the target, so
// extracting a corner costs O(log n) instead of a sequential scan and
// every lookup is independent of the others.
pub(crate) struct HistogramPyramid {
  levels: Vec<Vec<u32>>,
  dims: Vec<(usize, usize)>,
}

impl HistogramPyramid {
  pub fn build(
    width: usize,
    height: usize,
    is_set: impl Fn(usize) -> bool,
  ) -> HistogramPyramid {
    let mut base = vec![0u32; width * height];
    for (ind, count) in base.iter_mut().enumerate() {
      if is_set(ind) {
        *count = 1;
      }
    }
    let mut levels = vec![base];
    let mut dims = vec![(width, height)];
    let (mut w, mut h) = (width, height);
    while w > 1 || h > 1 {
      let pw = (w + 1) / 2;
      let ph = (h + 1) / 2;
      let child = levels.last().unwrap();
      let mut parent = vec![0u32; pw * ph];
      for y in 0..ph {
        for x in 0..pw {
          let mut s = 0;
          for (cx, cy) in child_cells(x, y) {
            if cx < w && cy < h {
              s += child[cy * w + cx];
            }
          }
          parent[y * pw + x] = s;
        }
      }
      levels.push(parent);
      dims.push((pw, ph));
      w = pw;
      h = ph;
    }
    HistogramPyramid { levels, dims }
  }

  pub fn total(&self) -> u32 {
    self.levels.last().unwrap()[0]
  }

  // Resolves the pixel holding the set bit of the given rank. The
  // child traversal order is fixed, making extraction deterministic.
  pub fn locate(&self, rank: u32) -> (usize, usize) {
    assert!(rank < self.total());
    let mut k = rank;
    let mut cell = (0, 0);
    'levels: for ind in (0..self.levels.len() - 1).rev() {
      let (w, h) = self.dims[ind];
      let level = &self.levels[ind];
      for (cx, cy) in child_cells(cell.0, cell.1) {
        if cx >= w || cy >= h {
          continue;
        }
        let count = level[cy * w + cx];
        if k < count {
          cell = (cx, cy);
          continue 'levels;
        }
        k -= count;
      }
      unreachable!("Count hierarchy is inconsistent with its base level.");
    }
    cell
  }
}

fn child_cells(x: usize, y: usize) -> [(usize, usize); 4] {
  [(2 * x, 2 * y), (2 * x + 1, 2 * y), (2 * x, 2 * y + 1), (2 * x + 1, 2 * y + 1)]
}
