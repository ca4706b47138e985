use rayon::prelude::*;

// Data-parallel capability the detector and tracker passes are built
// on. Each invocation of `f` is one independent computation per pixel
// or per list item; implementations may run them in any order or
// concurrently, so `f` must not depend on other invocations.
pub trait Compute: Sync {
  fn fill_grid(
    &self,
    width: usize,
    height: usize,
    out: &mut [f32],
    f: impl Fn(usize, usize) -> f32 + Sync,
  );

  fn map_list<T: Send>(
    &self,
    count: usize,
    f: impl Fn(usize) -> T + Sync,
  ) -> Vec<T>;
}

// Plain loops, the reference semantics.
#[derive(Clone, Copy)]
pub struct Serial;

impl Compute for Serial {
  fn fill_grid(
    &self,
    width: usize,
    height: usize,
    out: &mut [f32],
    f: impl Fn(usize, usize) -> f32 + Sync,
  ) {
    assert_eq!(out.len(), width * height);
    for y in 0..height {
      for x in 0..width {
        out[y * width + x] = f(x, y);
      }
    }
  }

  fn map_list<T: Send>(
    &self,
    count: usize,
    f: impl Fn(usize) -> T + Sync,
  ) -> Vec<T> {
    (0..count).map(f).collect()
  }
}

// Rayon backend, one grid row per work item. Must produce output
// identical to `Serial` for any deterministic `f`.
#[derive(Clone, Copy)]
pub struct Parallel;

impl Compute for Parallel {
  fn fill_grid(
    &self,
    width: usize,
    height: usize,
    out: &mut [f32],
    f: impl Fn(usize, usize) -> f32 + Sync,
  ) {
    assert_eq!(out.len(), width * height);
    out.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
      for (x, value) in row.iter_mut().enumerate() {
        *value = f(x, y);
      }
    });
  }

  fn map_list<T: Send>(
    &self,
    count: usize,
    f: impl Fn(usize) -> T + Sync,
  ) -> Vec<T> {
    (0..count).into_par_iter().map(|ind| f(ind)).collect()
  }
}
