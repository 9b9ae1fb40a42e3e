extern crate ffmpeg_next as ffmpeg;

use std::cell::RefCell;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use super::logger::{self, information, verbose, warning, Item};
use super::timestamp::Timestamp;
use crate::source::FrameSource;

use color_eyre::eyre::{self, Context};
use ffmpeg::codec::Context as CodecContext;
use ffmpeg::decoder::Video as DecoderVideo;
use ffmpeg::format::context::Input as FormatContext;
use ffmpeg::format::{input_with_dictionary, Pixel};
use ffmpeg::frame::Video as FrameVideo;
use ffmpeg::media::Type;
use ffmpeg::software::scaling::context::Context as ScalingContext;
use ffmpeg::util::log as ffmpeglog;
use ffmpeg::{Dictionary, Packet as CodecPacket, Rational, Rescale};
use ffmpeg_sys_next::{AV_NOPTS_VALUE, AV_TIME_BASE_Q};
use image::RgbImage;

pub type Result<T> = eyre::Result<T>;

static FFMPEG_INITIALIZED: OnceLock<std::result::Result<(), ffmpeg::Error>> =
    OnceLock::new();

thread_local! {
    static LOGS: RefCell<Vec<Item>> = const {RefCell::new(Vec::new())};
}

/// Decodes the best video stream of a file into RGB frames, in presentation order.
pub struct FrameExtractor<L: logger::Logger = logger::LogLogger> {
    logger: L,

    ictx: FormatContext,
    decoder: DecoderVideo,
    converter: ScalingContext,
    video_stream_index: usize,
    eof_sent: bool,

    cur_timestamp: i64,
    first_timestamp: i64,
    end_timestamp: Option<i64>,
    timebase: Rational,
    frame_rate: Rational,
    reported_frames: Option<u64>,
    orientation: Orientation,
}

enum Received {
    Frame(FrameVideo),
    NeedsInput,
    Finished,
}

impl FrameExtractor<logger::LogLogger> {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new_with_logger(path, logger::LogLogger)
    }
}

impl<L> FrameExtractor<L>
where
    L: logger::Logger,
{
    pub fn new_with_logger(path: impl AsRef<Path>, logger: L) -> Result<Self> {
        init_ffmpeg()?;

        let options = {
            let mut options = Dictionary::new();
            options.set("analyzeduration", "10M");
            options.set("probesize", "5M");
            options
        };
        let path = path.as_ref();
        let opened = input_with_dictionary(&path, options);
        flush_logs(&logger);
        let mut ictx = opened.wrap_err("Failed to open the file")?;

        let video = ictx
            .streams()
            .best(Type::Video)
            .ok_or(eyre::eyre!("No video stream"))?;

        let video_stream_index = video.index();
        let timebase = video.time_base();
        let frame_rate = video.avg_frame_rate();
        let first_timestamp = match video.start_time() {
            AV_NOPTS_VALUE => 0,
            start => start,
        };
        // NOTE: AV_NOPTS_VALUE is negative
        let end_timestamp = match video.duration() {
            ..=0 => match ictx.duration() {
                ..=0 => None,
                dur => Some(first_timestamp + dur.rescale(AV_TIME_BASE_Q, timebase)),
            },
            dur => Some(first_timestamp + dur),
        };
        let reported_frames = u64::try_from(video.frames()).ok().filter(|n| *n > 0);

        let orientation = get_orientation(&video).unwrap_or_else(|| {
            warning!(logger, "Got a weird orientation angle, ignoring");
            Orientation::Normal
        });

        let decoder = CodecContext::from_parameters(video.parameters())
            .wrap_err("No codec found")?
            .decoder()
            .video()
            .wrap_err("No codec found, of type video (?)")?;

        let converter = rgb_converter(&decoder)?;

        ictx.streams_mut()
            .filter(|stream| stream.index() != video_stream_index)
            .for_each(|mut stream| stream_set_discard_all(&mut stream));

        let myself = Self {
            logger,
            ictx,
            decoder,
            converter,
            video_stream_index,
            eof_sent: false,
            cur_timestamp: first_timestamp,
            first_timestamp,
            end_timestamp,
            timebase,
            frame_rate,
            reported_frames,
            orientation,
        };
        myself.log_ffmpeg_logs();

        if myself.reported_frames.is_none() {
            match myself.estimated_frame_count() {
                Some(estimate) => information!(
                    myself.logger,
                    "The container does not say how many frames there are, \
                     roughly {estimate} judging by its length"
                ),
                None => information!(
                    myself.logger,
                    "The container does not say how many frames there are"
                ),
            }
        }

        Ok(myself)
    }

    fn log_ffmpeg_logs(&self) {
        flush_logs(&self.logger);
    }

    /// The number of frames the container header claims the stream has.
    pub fn reported_frames(&self) -> Option<u64> {
        self.reported_frames
    }

    /// A guess from the duration and the average frame rate of the stream.
    pub fn estimated_frame_count(&self) -> Option<u64> {
        let fps = f64::from(self.frame_rate);
        let length = self.approx_length()?;
        if !fps.is_finite() || fps <= 0.0 {
            return None;
        }
        Some((length.as_secs_f64() * fps).round() as u64)
    }

    pub fn approx_length(&self) -> Option<Duration> {
        self.end_timestamp
            .map(|end| Timestamp::new(end, self.timebase, self.first_timestamp))
            .map(|ts| ts.to_duration())
    }

    /// Decodes the next frame together with when it is shown.
    pub fn next(&mut self) -> Result<Option<(Timestamp, RgbImage)>> {
        loop {
            match self.receive()? {
                Received::Frame(frame) => return self.finish_frame(frame).map(Some),
                Received::Finished => return Ok(None),
                Received::NeedsInput => self.feed()?,
            }
        }
    }

    fn receive(&mut self) -> Result<Received> {
        let mut frame = FrameVideo::empty();
        // avcodec_receive_frame
        // https://ffmpeg.org/doxygen/trunk/group__lavc__decoding.html#ga11e6542c4e66d3028668788a1a74217c
        let ret = self.decoder.receive_frame(&mut frame);
        self.log_ffmpeg_logs();
        match ret {
            Ok(()) => Ok(Received::Frame(frame)),
            Err(ffmpeg::Error::Other {
                errno: libc::EAGAIN,
            }) if self.eof_sent => Ok(Received::Finished),
            Err(ffmpeg::Error::Other {
                errno: libc::EAGAIN,
            }) => Ok(Received::NeedsInput),
            Err(ffmpeg::Error::Eof) => Ok(Received::Finished),
            Err(e) => Err(e).wrap_err("Decoder error when receiving a frame from it"),
        }
    }

    /// Sends packets of the video stream to the decoder until it accepts one, or
    /// signals the end of the stream to it.
    fn feed(&mut self) -> Result<()> {
        loop {
            // http://ffmpeg.org/doxygen/trunk/group__lavf__decoding.html#ga4fdb3084415a82e3810de6ee60e46a61
            let mut packet = CodecPacket::empty();
            let ret = packet.read(&mut self.ictx);
            self.log_ffmpeg_logs();
            match ret {
                Ok(()) if packet.stream() == self.video_stream_index => {
                    let sent = self.decoder.send_packet(&packet);
                    self.log_ffmpeg_logs();
                    match sent {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            warning!(self.logger, "Failed to decode a packet: {}", e);
                        }
                    }
                }
                Ok(()) => (),
                Err(ffmpeg::Error::Eof) => {
                    self.decoder
                        .send_eof()
                        .wrap_err("Failed to send EOF to the decoder")?;
                    self.eof_sent = true;
                    return Ok(());
                }
                Err(e) => {
                    return Err(e).wrap_err("Failed to read a packet from the stream");
                }
            }
        }
    }

    fn finish_frame(&mut self, frame: FrameVideo) -> Result<(Timestamp, RgbImage)> {
        match frame.timestamp() {
            Some(ts) => self.cur_timestamp = ts,
            None => warning!(
                self.logger,
                "Frame doesn't have a timestamp, somewhere after: {}",
                self.timestamp_of(self.cur_timestamp)
            ),
        }

        let mut converted = FrameVideo::empty();
        self.converter
            .run(&frame, &mut converted)
            .wrap_err("Failed to convert the decoded frame")?;
        let img = undo_rotation(to_rgb_image(&converted)?, self.orientation);

        Ok((self.timestamp_of(self.cur_timestamp), img))
    }

    fn timestamp_of(&self, ts: i64) -> Timestamp {
        Timestamp::new(ts, self.timebase, self.first_timestamp)
    }
}

impl<L: logger::Logger> FrameSource for FrameExtractor<L> {
    fn frame_count(&self) -> Option<u64> {
        self.reported_frames
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        Ok(self.next()?.map(|(ts, img)| {
            verbose!(self.logger, "Decoded a frame at {}", ts);
            img
        }))
    }
}

impl<L: logger::Logger> Drop for FrameExtractor<L> {
    fn drop(&mut self) {
        self.log_ffmpeg_logs();
    }
}

impl<L: logger::Logger> fmt::Debug for FrameExtractor<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameExtractor")
            .field("stream", &self.video_stream_index)
            .field("first_ts", &self.first_timestamp)
            .field("end_ts", &self.end_timestamp)
            .field("cur_ts", &self.cur_timestamp)
            .field(
                "tb",
                &format_args!(
                    "{}/{}",
                    self.timebase.numerator(),
                    self.timebase.denominator()
                ),
            )
            .field("frames", &self.reported_frames)
            .field("eof_sent", &self.eof_sent)
            .finish()
    }
}

fn init_ffmpeg() -> Result<()> {
    let init = FFMPEG_INITIALIZED.get_or_init(|| {
        ffmpeg::init()?;
        ffmpeglog::set_level(ffmpeglog::Level::Warning);
        // SAFETY: the callback only touches thread local storage and its arguments
        unsafe {
            ffmpeg_sys_next::av_log_set_callback(Some(ffmpeg_log_adaptor));
        }
        Ok(())
    });

    match init {
        Ok(()) => Ok(()),
        Err(e) => Err(*e).wrap_err("Failed to initialize ffmpeg"),
    }
}

fn flush_logs(logger: &impl logger::Logger) {
    LOGS.with_borrow_mut(|vec| {
        for item in vec.drain(..) {
            logger.log_item(item);
        }
    })
}

fn rgb_converter(decoder: &DecoderVideo) -> Result<ScalingContext> {
    eyre::ensure!(decoder.format() != Pixel::None, "No pixel format");
    ScalingContext::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        Pixel::RGB24,
        decoder.width(),
        decoder.height(),
        ffmpeg::software::scaling::Flags::FAST_BILINEAR,
    )
    .wrap_err("Failed to create a pixel format converter")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Orientation {
    Normal,
    Left,
    Right,
    Upside,
}

fn get_orientation(video: &ffmpeg::Stream) -> Option<Orientation> {
    let matrix = video
        .side_data()
        .find(|data| data.kind() == ffmpeg::packet::side_data::Type::DisplayMatrix);

    let Some(matrix) = matrix else {
        return Some(Orientation::Normal);
    };

    // SAFETY: display matrix side data is always nine i32s
    let rot = unsafe {
        ffmpeg_sys_next::av_display_rotation_get(matrix.data().as_ptr() as *const i32)
    };

    if !rot.is_finite() {
        return Some(Orientation::Normal);
    }

    match rot.round() as i32 {
        -90 => Some(Orientation::Right),
        90 => Some(Orientation::Left),
        0 => Some(Orientation::Normal),
        180 | -180 => Some(Orientation::Upside),
        _ => None,
    }
}

fn undo_rotation(img: RgbImage, ori: Orientation) -> RgbImage {
    match ori {
        Orientation::Normal => img,
        Orientation::Right => image::imageops::rotate90(&img),
        Orientation::Left => image::imageops::rotate270(&img),
        Orientation::Upside => image::imageops::rotate180(&img),
    }
}

/// Copies an RGB24 frame into an image, dropping the padding at the end of every row.
fn to_rgb_image(converted: &FrameVideo) -> Result<RgbImage> {
    eyre::ensure!(
        converted.format() == Pixel::RGB24 && converted.planes() == 1,
        "The converted frame is not packed RGB"
    );

    let width = converted.width();
    let height = converted.height();
    let row_len = 3 * width as usize;
    let stride = converted.stride(0);
    eyre::ensure!(stride >= row_len, "The frame rows are too short");

    let data = converted.data(0);
    let pixels: Vec<u8> = if stride == row_len {
        data[..row_len * height as usize].to_vec()
    } else {
        data.chunks(stride)
            .take(height as usize)
            .flat_map(|row| &row[..row_len])
            .copied()
            .collect()
    };

    RgbImage::from_vec(width, height, pixels)
        .ok_or_else(|| eyre::eyre!("The frame buffer is too small"))
}

fn stream_set_discard_all(stream: &mut ffmpeg::StreamMut<'_>) {
    // SAFETY: the pointer is owned by the format context which outlives `stream`
    unsafe {
        let ptr = stream.as_mut_ptr();
        if !ptr.is_null() {
            (*ptr).discard = ffmpeg_sys_next::AVDiscard::AVDISCARD_ALL;
        }
    }
}

extern "C" {
    pub fn vsnprintf(
        strbuf: *mut libc::c_char,
        size: libc::size_t,
        format: *const libc::c_char,
        va_list: *mut libc::c_void,
    ) -> libc::c_int;
}

/// Name of whatever ffmpeg component logged, e.g. "h264" or "matroska,webm".
unsafe fn ffmpeg_class_name(avcl: *mut libc::c_void) -> String {
    if avcl.is_null() {
        return "NULL_avcl".into();
    }
    let avc = *(avcl as *const *const ffmpeg_sys_next::AVClass);
    if avc.is_null() {
        return "NULL_avc".into();
    }
    let Some(item_name) = (*avc).item_name else {
        return "NULL_item".into();
    };
    let item = std::ffi::CStr::from_ptr(item_name(avcl)).to_string_lossy();
    if item == "NULL" {
        std::ffi::CStr::from_ptr((*avc).class_name)
            .to_string_lossy()
            .into_owned()
    } else {
        item.into_owned()
    }
}

fn ffmpeg_level(level: libc::c_int) -> logger::Level {
    match ffmpeglog::Level::try_from(level) {
        Ok(ffmpeglog::Level::Error | ffmpeglog::Level::Fatal | ffmpeglog::Level::Panic) => {
            logger::Level::Error
        }
        Ok(ffmpeglog::Level::Warning) => logger::Level::Warn,
        Ok(ffmpeglog::Level::Info) | Err(_) => logger::Level::Info,
        Ok(
            ffmpeglog::Level::Verbose
            | ffmpeglog::Level::Debug
            | ffmpeglog::Level::Trace
            | ffmpeglog::Level::Quiet,
        ) => logger::Level::Verbose,
    }
}

unsafe extern "C" fn ffmpeg_log_adaptor(
    avcl: *mut libc::c_void,
    level: libc::c_int,
    fmt: *const libc::c_char,
    va_list: *mut ffmpeg_sys_next::__va_list_tag,
) {
    if level > ffmpeg_sys_next::av_log_get_level() {
        return;
    }

    const BUF_SIZE: usize = 2048;
    let mut buffer: Vec<u8> = vec![0; BUF_SIZE];
    let written = vsnprintf(
        buffer.as_mut_ptr() as *mut libc::c_char,
        BUF_SIZE,
        fmt,
        va_list as *mut libc::c_void,
    );

    let Ok(written) = usize::try_from(written) else {
        let errno = std::io::Error::last_os_error();
        eprintln!("failed to create log message from ffmpeg, vsnprintf returned: {errno}");
        return;
    };
    // vsnprintf returns how much it wanted to write, not counting the nul
    buffer.truncate(written.min(BUF_SIZE - 1));

    let body = String::from_utf8_lossy(&buffer).trim_end().to_owned();
    let target = format!("ffmpeg::{}", ffmpeg_class_name(avcl));

    LOGS.with_borrow_mut(|vec| {
        vec.push(Item {
            level: ffmpeg_level(level),
            target,
            body,
        })
    });
}
