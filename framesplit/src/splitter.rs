use std::{
    io,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use color_eyre::eyre;
use framesplit_common::utils::{fsutils, time::Every};
use image::{ImageFormat, RgbImage};

use crate::{
    frame_extractor::{ContextLogger, FrameExtractor},
    naming::{is_sampled, Counters, Destination},
    source::FrameSource,
};

const PROGRESS_EVERY: Duration = Duration::from_secs(5);

#[derive(clap::Args, Debug)]
pub struct SplitCli {
    /// Where to place the frames with an even index
    #[arg(long, default_value = "database")]
    database_dir: PathBuf,

    /// Where to place the frames with an odd index
    #[arg(long, default_value = "query")]
    query_dir: PathBuf,

    /// Only consider every nth frame, the index still decides where it ends up
    #[arg(long, short = 'n', default_value = "1")]
    interval: NonZeroUsize,

    /// Remove everything inside the output directories first
    #[arg(long)]
    clean: bool,
}

/// Where and how often to save frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitArgs {
    database_dir: PathBuf,
    query_dir: PathBuf,
    interval: NonZeroUsize,
    clean: bool,
}

impl Default for SplitArgs {
    fn default() -> Self {
        Self {
            database_dir: PathBuf::from("database"),
            query_dir: PathBuf::from("query"),
            interval: NonZeroUsize::MIN,
            clean: false,
        }
    }
}

impl SplitArgs {
    pub fn database_dir(mut self, database_dir: impl Into<PathBuf>) -> Self {
        self.database_dir = database_dir.into();
        self
    }

    pub fn query_dir(mut self, query_dir: impl Into<PathBuf>) -> Self {
        self.query_dir = query_dir.into();
        self
    }

    pub fn interval(mut self, interval: NonZeroUsize) -> Self {
        self.interval = interval;
        self
    }

    pub fn clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    pub fn dir_of(&self, dest: Destination) -> &Path {
        match dest {
            Destination::Database => &self.database_dir,
            Destination::Query => &self.query_dir,
        }
    }
}

impl SplitCli {
    pub fn to_args(&self) -> SplitArgs {
        SplitArgs {
            database_dir: self.database_dir.clone(),
            query_dir: self.query_dir.clone(),
            interval: self.interval,
            clean: self.clean,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    #[error("failed to create the output directory {path:?}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to clear the output directory {path:?}")]
    ClearDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open the video {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[error("failed to write the frame to {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Why the frames stopped coming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// As many frames as the source said it had have been read
    FrameCount,
    /// The source ran out before that
    EndOfStream,
    /// A frame could not be decoded, everything before it was still saved
    DecodeError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitSummary {
    pub total_frames: Option<u64>,
    /// Number of frames read from the source, saved or not
    pub visited: usize,
    pub written: Counters,
    pub end: EndReason,
}

impl SplitSummary {
    pub fn database(&self) -> usize {
        self.written.database
    }

    pub fn query(&self) -> usize {
        self.written.query
    }
}

/// Splits the video at `video` using ffmpeg.
pub fn split_video(video: &Path, args: &SplitArgs) -> Result<SplitSummary, SplitError> {
    split_frames(video, args, |path| {
        FrameExtractor::new_with_logger(path, ContextLogger::new(path))
    })
}

/// Saves every `interval`th frame of the source that `open` creates from `video`. Frames
/// with an even index go to the database directory, odd ones to the query directory.
///
/// The output directories are created before the video is opened. If it can't be
/// opened nothing is written. The source is dropped before this returns.
pub fn split_frames<'p, S, F>(
    video: &'p Path,
    args: &SplitArgs,
    open: F,
) -> Result<SplitSummary, SplitError>
where
    S: FrameSource,
    F: FnOnce(&'p Path) -> eyre::Result<S>,
{
    for dest in [Destination::Database, Destination::Query] {
        prepare_dir(args.dir_of(dest), args.clean)?;
    }

    let mut source = match open(video) {
        Ok(source) => source,
        Err(e) => {
            log::error!("Could not open the video {}: {e:#}", video.display());
            return Err(SplitError::Open {
                path: video.to_path_buf(),
                source: e.into(),
            });
        }
    };

    let total_frames = source.frame_count();
    log::info!("Processing video: {}", video.display());
    match total_frames {
        Some(total) => log::info!("Total frames: {total}"),
        None => log::info!("Total frames: unknown, reading until the end"),
    }

    let ceiling = total_frames.map_or(usize::MAX, |total| {
        usize::try_from(total).unwrap_or(usize::MAX)
    });
    let mut written = Counters::default();
    let mut visited = 0;
    let mut end = EndReason::FrameCount;
    let mut progress = Every::new(PROGRESS_EVERY);

    for index in 0..ceiling {
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                end = EndReason::EndOfStream;
                break;
            }
            Err(e) => {
                log::warn!("Stopping at frame {index}, it could not be decoded: {e:#}");
                end = EndReason::DecodeError;
                break;
            }
        };
        visited += 1;

        if is_sampled(index, args.interval) {
            let dest = Destination::of_frame(index);
            let path = args.dir_of(dest).join(written.next_name(dest));
            save_frame(&frame, &path)?;
            log::debug!("Frame {index} -> {}", path.display());
            written.increment(dest);
        }

        progress.perform(|| match total_frames {
            Some(total) => log::info!("Processed {visited} of {total} frames"),
            None => log::info!("Processed {visited} frames"),
        });
    }
    drop(source);

    if end == EndReason::EndOfStream && total_frames.is_some() {
        log::debug!("The video ended after {visited} frames, earlier than it claimed");
    }
    log::info!(
        "Saved to {}: {} frames",
        args.database_dir.display(),
        written.database
    );
    log::info!(
        "Saved to {}: {} frames",
        args.query_dir.display(),
        written.query
    );

    Ok(SplitSummary {
        total_frames,
        visited,
        written,
        end,
    })
}

fn prepare_dir(dir: &Path, clean: bool) -> Result<(), SplitError> {
    if clean {
        fsutils::clear_dir(dir).map_err(|source| SplitError::ClearDir {
            path: dir.to_path_buf(),
            source,
        })
    } else {
        fsutils::ensure_dir(dir).map_err(|source| SplitError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })
    }
}

fn save_frame(frame: &RgbImage, path: &Path) -> Result<(), SplitError> {
    frame
        .save_with_format(path, ImageFormat::Jpeg)
        .map_err(|source| SplitError::Write {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::source::MemorySource;
    use image::Rgb;
    use std::{cell::Cell, collections::BTreeSet, fs, rc::Rc};

    /// Solid frames where the red channel tells the frame index apart
    fn frames(n: usize) -> Vec<RgbImage> {
        (0..n)
            .map(|i| RgbImage::from_pixel(16, 16, Rgb([(i * 20) as u8, 100, 50])))
            .collect()
    }

    fn args_in(tmp: &Path) -> SplitArgs {
        SplitArgs::default()
            .database_dir(tmp.join("database"))
            .query_dir(tmp.join("query"))
    }

    fn names_in(dir: &Path) -> BTreeSet<String> {
        let files: Vec<PathBuf> = fsutils::all_files([dir]).unwrap();
        files
            .into_iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    fn expected_names(dest: Destination, n: usize) -> BTreeSet<String> {
        (0..n).map(|i| dest.file_name(i)).collect()
    }

    fn red_of(path: &Path) -> u8 {
        let img = image::open(path).unwrap().to_rgb8();
        img.get_pixel(8, 8).0[0]
    }

    fn run(args: &SplitArgs, source: MemorySource) -> Result<SplitSummary, SplitError> {
        split_frames(Path::new("memory.mp4"), args, |_| Ok(source))
    }

    fn interval(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn four_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let args = args_in(tmp.path());

        let summary = run(&args, MemorySource::new(frames(4))).unwrap();
        assert_eq!(2, summary.database());
        assert_eq!(2, summary.query());
        assert_eq!(4, summary.visited);
        assert_eq!(EndReason::FrameCount, summary.end);

        let db = tmp.path().join("database");
        let query = tmp.path().join("query");
        assert_eq!(expected_names(Destination::Database, 2), names_in(&db));
        assert_eq!(expected_names(Destination::Query, 2), names_in(&query));

        // JPEG is lossy, so only roughly
        let close = |path: PathBuf, frame: u8| red_of(&path).abs_diff(frame * 20) <= 6;
        assert!(close(db.join("db_000000.jpg"), 0));
        assert!(close(query.join("query_000000.jpg"), 1));
        assert!(close(db.join("db_000001.jpg"), 2));
        assert!(close(query.join("query_000001.jpg"), 3));
    }

    #[test]
    fn odd_number_of_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let args = args_in(tmp.path());

        let summary = run(&args, MemorySource::new(frames(7))).unwrap();
        assert_eq!(4, summary.database());
        assert_eq!(3, summary.query());
        assert_eq!(
            expected_names(Destination::Database, 4),
            names_in(&tmp.path().join("database"))
        );
        assert_eq!(
            expected_names(Destination::Query, 3),
            names_in(&tmp.path().join("query"))
        );
    }

    #[test]
    fn even_interval_only_fills_the_database() {
        let tmp = tempfile::tempdir().unwrap();
        let args = args_in(tmp.path()).interval(interval(2));

        let summary = run(&args, MemorySource::new(frames(10))).unwrap();
        assert_eq!(5, summary.database());
        assert_eq!(0, summary.query());
        assert_eq!(10, summary.visited);
        assert!(fsutils::is_dir_empty(tmp.path().join("query")).unwrap());
    }

    #[test]
    fn odd_interval_alternates() {
        let tmp = tempfile::tempdir().unwrap();
        let args = args_in(tmp.path()).interval(interval(3));

        // candidates are 0, 3, 6 and 9
        let summary = run(&args, MemorySource::new(frames(10))).unwrap();
        assert_eq!(2, summary.database());
        assert_eq!(2, summary.query());

        let db = tmp.path().join("database");
        assert!(red_of(&db.join("db_000001.jpg")).abs_diff(6 * 20) <= 6);
        let query = tmp.path().join("query");
        assert!(red_of(&query.join("query_000001.jpg")).abs_diff(9 * 20) <= 6);
    }

    #[test]
    fn frame_count_is_a_ceiling() {
        let tmp = tempfile::tempdir().unwrap();
        let args = args_in(tmp.path());

        let source = MemorySource::new(frames(6)).reporting(Some(3));
        let summary = run(&args, source).unwrap();
        assert_eq!(3, summary.visited);
        assert_eq!(2, summary.database());
        assert_eq!(1, summary.query());
        assert_eq!(EndReason::FrameCount, summary.end);
    }

    #[test]
    fn stream_ending_early_is_fine() {
        let tmp = tempfile::tempdir().unwrap();
        let args = args_in(tmp.path());

        let source = MemorySource::new(frames(3)).reporting(Some(100));
        let summary = run(&args, source).unwrap();
        assert_eq!(3, summary.visited);
        assert_eq!(2, summary.database());
        assert_eq!(1, summary.query());
        assert_eq!(EndReason::EndOfStream, summary.end);
    }

    #[test]
    fn unknown_frame_count_reads_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let args = args_in(tmp.path());

        let source = MemorySource::new(frames(5)).reporting(None);
        let summary = run(&args, source).unwrap();
        assert_eq!(None, summary.total_frames);
        assert_eq!(5, summary.visited);
        assert_eq!(EndReason::EndOfStream, summary.end);
    }

    #[test]
    fn zero_reported_frames_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let args = args_in(tmp.path());

        let source = MemorySource::new(frames(5)).reporting(Some(0));
        let summary = run(&args, source).unwrap();
        assert_eq!(0, summary.visited);
        assert_eq!(Counters::default(), summary.written);
    }

    #[test]
    fn open_failure_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let args = args_in(tmp.path());

        let res = split_frames(Path::new("broken.mp4"), &args, |_| {
            Err::<MemorySource, _>(eyre::eyre!("not a video"))
        });
        assert!(matches!(res, Err(SplitError::Open { .. })));

        // the directories are made before trying to open
        assert!(fsutils::is_dir_empty(tmp.path().join("database")).unwrap());
        assert!(fsutils::is_dir_empty(tmp.path().join("query")).unwrap());
    }

    struct FailingSource {
        good: usize,
    }

    impl FrameSource for FailingSource {
        fn frame_count(&self) -> Option<u64> {
            Some(10)
        }

        fn next_frame(&mut self) -> eyre::Result<Option<RgbImage>> {
            if self.good == 0 {
                eyre::bail!("corrupt packet");
            }
            self.good -= 1;
            Ok(Some(RgbImage::new(4, 4)))
        }
    }

    #[test]
    fn decode_error_stops_quietly() {
        let tmp = tempfile::tempdir().unwrap();
        let args = args_in(tmp.path());

        let summary = split_frames(Path::new("x.mp4"), &args, |_| {
            Ok(FailingSource { good: 3 })
        })
        .unwrap();
        assert_eq!(3, summary.visited);
        assert_eq!(2, summary.database());
        assert_eq!(1, summary.query());
        assert_eq!(EndReason::DecodeError, summary.end);
    }

    struct DropFlag {
        inner: MemorySource,
        dropped: Rc<Cell<bool>>,
    }

    impl FrameSource for DropFlag {
        fn frame_count(&self) -> Option<u64> {
            self.inner.frame_count()
        }

        fn next_frame(&mut self) -> eyre::Result<Option<RgbImage>> {
            self.inner.next_frame()
        }
    }

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.dropped.set(true);
        }
    }

    #[test]
    fn source_is_released() {
        let tmp = tempfile::tempdir().unwrap();
        let args = args_in(tmp.path());
        let dropped = Rc::new(Cell::new(false));

        let source = DropFlag {
            inner: MemorySource::new(frames(2)),
            dropped: Rc::clone(&dropped),
        };
        split_frames(Path::new("x.mp4"), &args, |_| Ok(source)).unwrap();
        assert!(dropped.get());
    }

    #[test]
    fn running_twice_gives_the_same_files() {
        let tmp = tempfile::tempdir().unwrap();
        let args = args_in(tmp.path());
        let db_file = tmp.path().join("database").join("db_000001.jpg");

        run(&args, MemorySource::new(frames(5))).unwrap();
        let first = fs::read(&db_file).unwrap();

        let summary = run(&args, MemorySource::new(frames(5))).unwrap();
        assert_eq!(3, summary.database());
        assert_eq!(first, fs::read(&db_file).unwrap());
        assert_eq!(
            expected_names(Destination::Database, 3),
            names_in(&tmp.path().join("database"))
        );
    }

    #[test]
    fn clean_removes_stale_files() {
        let tmp = tempfile::tempdir().unwrap();
        let stale = tmp.path().join("database").join("db_000099.jpg");

        fsutils::ensure_dir(tmp.path().join("database")).unwrap();
        fs::write(&stale, b"old").unwrap();
        run(&args_in(tmp.path()), MemorySource::new(frames(2))).unwrap();
        assert!(stale.exists());

        run(&args_in(tmp.path()).clean(true), MemorySource::new(frames(2))).unwrap();
        assert!(!stale.exists());
        assert_eq!(
            expected_names(Destination::Database, 1),
            names_in(&tmp.path().join("database"))
        );
    }

    #[test]
    fn write_failure_aborts() {
        let tmp = tempfile::tempdir().unwrap();
        let args = args_in(tmp.path());
        fsutils::ensure_dir(tmp.path().join("database").join("db_000000.jpg")).unwrap();

        let res = run(&args, MemorySource::new(frames(2)));
        assert!(matches!(res, Err(SplitError::Write { .. })));
    }

    #[test]
    fn output_dir_is_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("query"), b"").unwrap();

        let res = run(&args_in(tmp.path()), MemorySource::new(frames(2)));
        assert!(matches!(res, Err(SplitError::CreateDir { .. })));
    }
}
