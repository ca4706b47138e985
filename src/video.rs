use crate::all::*;

use std::process::{ChildStdout, Command, Stdio};

// Reads 8-bit grayscale frames of a fixed size from a video file
// through an external ffmpeg process.
pub struct VideoInput {
  child_stdout: ChildStdout,
  frame: Image,
}

impl VideoInput {
  pub fn new(path: &Path, width: usize, height: usize) -> Result<VideoInput> {
    let path = path.to_str().ok_or(anyhow!("Failed to parse video path."))?;
    let cmd_str = format!("ffmpeg -i {} -f rawvideo -vcodec rawvideo -vsync vfr -pix_fmt gray -", path);
    // `bash -c` splits the command into tokens.
    let child = Command::new("bash").args(["-c", &cmd_str])
      .stdout(Stdio::piped())
      .stderr(Stdio::null())
      .spawn()?;
    Ok(VideoInput {
      child_stdout: child.stdout.ok_or(anyhow!("Failed to open ffmpeg stdout."))?,
      frame: Image::new(width, height),
    })
  }

  // Fails at the end of the video data.
  pub fn read(&mut self) -> Result<&Image> {
    self.child_stdout.read_exact(&mut self.frame.data)
      .context("Reading bytes from video input failed.")?;
    Ok(&self.frame)
  }
}
