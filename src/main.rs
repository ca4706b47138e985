use saffron::all::*;
use saffron::util;

use clap::Parser;

#[derive(Parser)]
struct Args {
  // Path to a video file readable by ffmpeg.
  #[clap(short)]
  input: String,
  // JSON file whose values replace the command line parameters.
  #[clap(long)]
  parameters: Option<String>,
  // Use the serial compute backend instead of the parallel one.
  #[clap(long)]
  serial: bool,
  #[clap(flatten)]
  parameter_set: ParameterSet,
}

fn handle_error(err: &anyhow::Error) {
  for (i, e) in err.chain().enumerate() {
    println!("  {}: {}", i + 1, e);
  }
}

fn main() {
  if let Err(err) = run() {
    handle_error(&err);
  }
}

fn run() -> Result<()> {
  let args = Args::parse();
  env_logger::Builder::new()
    .filter_level(LevelFilter::Info)
    .format(util::format_log)
    .init();

  let parameter_set = match &args.parameters {
    Some(path) => {
      let file = File::open(path)
        .context(format!("Failed to open parameters file {}.", path))?;
      serde_json::from_reader(BufReader::new(file))
        .context("Failed to parse parameters file.")?
    },
    None => args.parameter_set,
  };
  *PARAMETER_SET.lock().unwrap() = parameter_set;
  let p = PARAMETER_SET.lock().unwrap().clone();

  let mut video = VideoInput::new(Path::new(&args.input), p.video_width, p.video_height)?;
  if args.serial {
    track_sequence(Tracker::new(&p, Serial)?, &mut video, &p)
  }
  else {
    track_sequence(Tracker::new(&p, Parallel)?, &mut video, &p)
  }
}

fn track_sequence<C: Compute + Clone>(
  mut tracker: Tracker<C>,
  video: &mut VideoInput,
  p: &ParameterSet,
) -> Result<()> {
  tracker.allocate(p.video_width, p.video_height)?;
  let frame_sub = usize::max(p.frame_sub, 1);
  let mut dest = vec![];
  let mut frame_number = 0;
  let mut processed = 0;
  loop {
    let image = match video.read() {
      Ok(image) => image,
      Err(_) => {
        info!("End of video input after {} frames.", frame_number);
        break;
      },
    };
    frame_number += 1;
    if (frame_number - 1) % frame_sub != 0 {
      continue;
    }

    if processed == 0 {
      tracker.detect(image, &mut dest)?;
    }
    else if p.redetect_interval > 0 && processed % p.redetect_interval == 0 {
      tracker.redetect(image, &mut dest)?;
    }
    else {
      tracker.track(image, &mut dest)?;
    }
    processed += 1;

    let mut tracked = 0;
    let mut new = 0;
    let mut lost = 0;
    for f in dest.iter().filter(|f| f.id.is_some()) {
      match f.status {
        TrackStatus::Tracked => tracked += 1,
        TrackStatus::New => new += 1,
        TrackStatus::Lost => lost += 1,
      }
    }
    info!("Frame {}: {} tracked, {} new, {} lost.", frame_number, tracked, new, lost);
    tracker.advance_frame()?;
  }
  Ok(())
}
