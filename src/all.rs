// NOTE This kind of import-all file isn't a common Rust idiom.

pub use crate::{
  compute::*,
  detector::*,
  image::*,
  optical_flow::*,
  parameters::*,
  pyramid::*,
  track::*,
  tracker::*,
  types::*,
  util::*,
  video::*,
};

pub use {
  std::{
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
    sync::Mutex,
  },
  log::{debug, error, info, warn, LevelFilter},
  anyhow::{anyhow, bail, Context as AnyhowContext, Result},
};
