use std::{path::PathBuf, time::Instant};

use clap::Parser;
use color_eyre::eyre::{self, Context};
use framesplit::splitter::{split_video, SplitCli};
use framesplit_common::bin_common::init::{init_eyre, init_logger};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command()]
/// Splits the frames of a video into two sets of images.
///
/// Frames with an even index end up in the database directory and the odd ones in the
/// query directory, named by how many came before them in the same directory.
struct Cli {
    #[command(flatten)]
    split_args: SplitCli,

    /// A file to additionally write the logs to
    #[arg(long)]
    logfile: Option<PathBuf>,

    /// Also log every written file
    #[arg(long, short = 'v')]
    verbose: bool,

    /// The video file to split
    #[arg(default_value = "input_video.mp4")]
    video: PathBuf,
}

fn main() -> eyre::Result<()> {
    init_eyre()?;
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    init_logger(cli.logfile.as_deref(), level)?;

    log::debug!("CLI arguments: {cli:#?}");

    let start = Instant::now();
    let summary = split_video(&cli.video, &cli.split_args.to_args())
        .wrap_err_with(|| format!("failed to split {}", cli.video.display()))?;

    let elapsed = std::time::Duration::from_millis(start.elapsed().as_millis() as u64);
    log::info!(
        "Done with {} of {} frames in {} ({:?})",
        summary.visited,
        summary
            .total_frames
            .map_or_else(|| "?".to_string(), |total| total.to_string()),
        humantime::format_duration(elapsed),
        summary.end,
    );

    Ok(())
}
