use crate::all::*;

// Multi-resolution pyramid with per-level intensity and spatial
// gradient planes. Built once per input frame and immutable after
// that; the tracking core only ever consumes it through `&Pyramid`.
pub struct Pyramid {
  pub levels: Vec<PyramidLevel>,
}

pub struct PyramidLevel {
  pub intensity: Plane,
  pub grad_x: Plane,
  pub grad_y: Plane,
}

impl PyramidLevel {
  fn empty() -> PyramidLevel {
    PyramidLevel {
      intensity: Plane::empty(),
      grad_x: Plane::empty(),
      grad_y: Plane::empty(),
    }
  }

  pub fn width(&self) -> usize { self.intensity.width }
  pub fn height(&self) -> usize { self.intensity.height }
}

impl Pyramid {
  // Passing a retired pyramid in `unused_pyramid` reuses its
  // allocations instead of making new ones.
  pub fn new(
    image: &Image,
    unused_pyramid: Option<Pyramid>,
    level_count: usize,
  ) -> Result<Pyramid> {
    if level_count < 1 || level_count > 16 {
      bail!("Unreasonable pyramid level count {}.", level_count);
    }
    if (image.width >> (level_count - 1)) < 2 || (image.height >> (level_count - 1)) < 2 {
      bail!("Too many pyramid levels ({}) for a {}x{} image.",
        level_count, image.width, image.height);
    }

    let mut levels = unused_pyramid.map(|p| p.levels).unwrap_or(vec![]);
    levels.resize_with(level_count, PyramidLevel::empty);

    let mut width = image.width;
    let mut height = image.height;
    for ind in 0..level_count {
      if ind == 0 {
        let intensity = &mut levels[0].intensity;
        intensity.reset(width, height);
        for (out, value) in intensity.data.iter_mut().zip(image.data.iter()) {
          *out = *value as f32;
        }
      }
      else {
        width /= 2;
        height /= 2;
        // Cannot borrow two levels at once through the Vec, so split.
        let (parents, children) = levels.split_at_mut(ind);
        downscale(&parents[ind - 1].intensity, &mut children[0].intensity, width, height);
      }
      let level = &mut levels[ind];
      scharr_gradients(&level.intensity, &mut level.grad_x, &mut level.grad_y);
    }
    Ok(Pyramid { levels })
  }

  pub fn level_count(&self) -> usize {
    self.levels.len()
  }

  pub fn width(&self) -> usize {
    self.levels[0].width()
  }

  pub fn height(&self) -> usize {
    self.levels[0].height()
  }
}

// Half resolution by 2x2 box averaging. Odd-sized parents drop the
// trailing row and column.
fn downscale(parent: &Plane, child: &mut Plane, width: usize, height: usize) {
  child.reset(width, height);
  for y in 0..height {
    for x in 0..width {
      let s = parent.value(2 * x, 2 * y)
        + parent.value(2 * x + 1, 2 * y)
        + parent.value(2 * x, 2 * y + 1)
        + parent.value(2 * x + 1, 2 * y + 1);
      child.set_value(x, y, s / 4.);
    }
  }
}

// 3x3 Scharr kernel, border pixels replicated.
fn scharr_gradients(intensity: &Plane, grad_x: &mut Plane, grad_y: &mut Plane) {
  grad_x.reset(intensity.width, intensity.height);
  grad_y.reset(intensity.width, intensity.height);
  for y in 0..intensity.height as i64 {
    for x in 0..intensity.width as i64 {
      let gx = (10. * intensity.value_clamped(x + 1, y)
        + 3. * intensity.value_clamped(x + 1, y + 1)
        + 3. * intensity.value_clamped(x + 1, y - 1)
        - 10. * intensity.value_clamped(x - 1, y)
        - 3. * intensity.value_clamped(x - 1, y + 1)
        - 3. * intensity.value_clamped(x - 1, y - 1)
      ) / 32.;
      let gy = (10. * intensity.value_clamped(x, y + 1)
        + 3. * intensity.value_clamped(x + 1, y + 1)
        + 3. * intensity.value_clamped(x - 1, y + 1)
        - 10. * intensity.value_clamped(x, y - 1)
        - 3. * intensity.value_clamped(x + 1, y - 1)
        - 3. * intensity.value_clamped(x - 1, y - 1)
      ) / 32.;
      grad_x.set_value(x as usize, y as usize, gx);
      grad_y.set_value(x as usize, y as usize, gy);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ramp_image(width: usize, height: usize) -> Image {
    let mut image = Image::new(width, height);
    for y in 0..height {
      for x in 0..width {
        image.set_value(x, y, (x + 2 * y) as u8);
      }
    }
    image
  }

  #[test]
  fn test_level_sizes() {
    let image = ramp_image(40, 24);
    let pyramid = Pyramid::new(&image, None, 3).unwrap();
    assert_eq!(pyramid.level_count(), 3);
    assert_eq!((pyramid.levels[0].width(), pyramid.levels[0].height()), (40, 24));
    assert_eq!((pyramid.levels[1].width(), pyramid.levels[1].height()), (20, 12));
    assert_eq!((pyramid.levels[2].width(), pyramid.levels[2].height()), (10, 6));
  }

  #[test]
  fn test_too_many_levels() {
    let image = ramp_image(8, 8);
    assert!(Pyramid::new(&image, None, 4).is_err());
  }

  #[test]
  fn test_ramp_gradients() {
    // On a linear ramp the Scharr response equals the slope away from
    // the replicated borders.
    let image = ramp_image(16, 16);
    let pyramid = Pyramid::new(&image, None, 1).unwrap();
    let level = &pyramid.levels[0];
    for y in 1..15 {
      for x in 1..15 {
        assert!((level.grad_x.value(x, y) - 1.).abs() < 1e-5);
        assert!((level.grad_y.value(x, y) - 2.).abs() < 1e-5);
      }
    }
  }

  #[test]
  fn test_downscale_average() {
    let mut image = Image::new(4, 4);
    for y in 0..2 {
      for x in 0..2 {
        image.set_value(x, y, 100);
      }
    }
    let pyramid = Pyramid::new(&image, None, 2).unwrap();
    let coarse = &pyramid.levels[1].intensity;
    assert_eq!(coarse.value(0, 0), 100.);
    assert_eq!(coarse.value(1, 0), 0.);
    assert_eq!(coarse.value(1, 1), 0.);
  }

  #[test]
  fn test_buffer_reuse() {
    let image = ramp_image(32, 32);
    let first = Pyramid::new(&image, None, 3).unwrap();
    let second = Pyramid::new(&image, Some(first), 3).unwrap();
    assert_eq!(second.level_count(), 3);
    assert_eq!(second.levels[2].width(), 8);
  }
}
