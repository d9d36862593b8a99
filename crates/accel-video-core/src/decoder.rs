//! Front door of the pipeline: the decoder the player calls into.
//!
//! Single-threaded from the caller's point of view. `decode` submits
//! access units to the hardware and `get_picture` collects finished
//! render pictures; everything in between runs on the output and mixer
//! actor threads. Display loss is handled with a small state machine:
//! preemption parks the session in `Lost`, a display reset schedules a
//! full reconfigure on the next `decode` call.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::mailbox::{ControlReply, OutputData, OutputEvent};
use crate::output::Output;
use crate::picture::{
    CodecParams, DecodedPicture, PictureFlags, PostProcSettings, RenderPicture, SessionConfig,
};
use crate::surfaces::{BufferStats, SurfacePool};
use crate::vendor::{CodecProfile, DecoderHandle, VendorDevice};

/// Pictures queued toward the mixer before `decode` pushes back.
const MAX_DECODED_PICS: u64 = 3;

/// Surfaces kept beyond the reference frames, covering the mixer history
/// and the handout window.
const EXTRA_SURFACES: u32 = 4;

/// Render pictures the consumer may hold at once.
const NUM_RENDER_BUFFERS: usize = 5;

/// Consecutive decode failures tolerated before giving up.
const MAX_DECODE_ERRORS: u32 = 2;

/// Player hint flags, pushed whenever the playback situation changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecControl {
    /// End of stream reached; flush everything buffered.
    pub drain: bool,
    /// Playback is behind; skip post-processing until it catches up.
    pub no_postproc: bool,
    /// Queue latency downstream of the pipeline, in microseconds.
    pub latency_us: i64,
}

/// One encoded access unit with its presentation metadata.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Vec<u8>,
    pub pts: Option<Duration>,
    pub flags: PictureFlags,
}

/// Outcome of a `decode` call.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeResult {
    Accepted,
    /// Pipeline is full or temporarily unavailable; feed the same unit
    /// again after collecting pictures.
    Retry,
    /// Session is broken and must be reopened.
    Fatal,
}

/// Outcome of a `get_picture` call.
#[derive(Debug)]
pub enum PictureResult {
    Picture(RenderPicture),
    /// Nothing ready yet.
    TryAgain,
    /// Stream fully drained.
    Eof,
    Fatal,
}

/// Failure to open a decode session.
#[derive(Debug)]
pub enum OpenError {
    Unsupported(&'static str),
    Vendor(crate::vendor::VendorError),
    OutputInit,
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenError::Unsupported(what) => write!(f, "unsupported stream: {what}"),
            OpenError::Vendor(err) => write!(f, "vendor error: {err}"),
            OpenError::OutputInit => write!(f, "output pipeline failed to initialize"),
        }
    }
}

impl std::error::Error for OpenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OpenError::Vendor(err) => Some(err),
            _ => None,
        }
    }
}

impl From<crate::vendor::VendorError> for OpenError {
    fn from(err: crate::vendor::VendorError) -> Self {
        OpenError::Vendor(err)
    }
}

/// Display availability, driven by preemption and reset notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisplayState {
    Open,
    /// Display gone; decode calls are refused until it comes back.
    Lost,
    /// Display back; the next decode call rebuilds the session.
    Reset,
    Error,
}

struct Session {
    decoder: DecoderHandle,
    config: SessionConfig,
    output: Output,
    data_tx: Sender<OutputData>,
}

/// Hardware decode session front door.
pub struct Decoder {
    vendor: Arc<dyn VendorDevice>,
    state: DisplayState,
    codec: Option<CodecParams>,
    session: Option<Session>,
    /// Outlives individual sessions, so the player's handle stays valid
    /// across a display loss and the reconfigure that follows.
    settings: Arc<PostProcSettings>,
    epoch: u64,
    error_count: u32,
}

impl Decoder {
    pub fn new(vendor: Arc<dyn VendorDevice>) -> Self {
        Self {
            vendor,
            state: DisplayState::Open,
            codec: None,
            session: None,
            settings: Arc::new(PostProcSettings::new()),
            epoch: 0,
            error_count: 0,
        }
    }

    /// Opens a decode session for the given stream. Tears everything
    /// down again on failure; no vendor objects leak.
    pub fn open(&mut self, params: CodecParams) -> Result<(), OpenError> {
        self.close();
        self.open_session(params)?;
        self.codec = Some(params);
        self.state = DisplayState::Open;
        Ok(())
    }

    fn open_session(&mut self, params: CodecParams) -> Result<(), OpenError> {
        let caps = self.vendor.query_caps(params.profile)?;
        if !caps.supported {
            return Err(OpenError::Unsupported("profile not supported"));
        }
        if params.coded_width > caps.max_width || params.coded_height > caps.max_height {
            return Err(OpenError::Unsupported("dimensions exceed device limits"));
        }
        let max_references = allowed_references(params.profile, params.ref_frames)
            .min(caps.max_references);

        let decoder = self.vendor.create_decoder(
            params.profile,
            params.coded_width,
            params.coded_height,
            max_references,
        )?;

        self.epoch += 1;
        let config = SessionConfig {
            surface_width: params.coded_width,
            surface_height: params.coded_height,
            vid_width: params.display_width,
            vid_height: params.display_height,
            out_width: params.display_width,
            out_height: params.display_height,
            chroma: params.chroma,
            max_references,
            num_render_buffers: NUM_RENDER_BUFFERS,
            session_epoch: self.epoch,
            pool: Arc::new(SurfacePool::new((max_references + EXTRA_SURFACES) as usize)),
            stats: Arc::new(BufferStats::new()),
            settings: self.settings.clone(),
        };

        let output = Output::start(self.vendor.clone());
        if output.init(config.clone(), Duration::from_secs(2)) != ControlReply::Accepted {
            drop(output);
            self.vendor.destroy_decoder(decoder);
            return Err(OpenError::OutputInit);
        }
        let data_tx = output.data_sender();

        info!(
            profile = ?params.profile,
            width = params.coded_width,
            height = params.coded_height,
            max_references,
            "decode session opened"
        );
        self.error_count = 0;
        self.session = Some(Session {
            decoder,
            config,
            output,
            data_tx,
        });
        Ok(())
    }

    /// Submits one access unit.
    pub fn decode(&mut self, unit: &AccessUnit) -> DecodeResult {
        match self.state {
            DisplayState::Error => return DecodeResult::Fatal,
            DisplayState::Lost => return DecodeResult::Retry,
            DisplayState::Reset => {
                if !self.reconfigure() {
                    self.state = DisplayState::Error;
                    return DecodeResult::Fatal;
                }
                self.state = DisplayState::Open;
            }
            DisplayState::Open => {}
        }
        if self.poll_events() {
            return DecodeResult::Fatal;
        }
        let Some(session) = &self.session else {
            return DecodeResult::Fatal;
        };

        if session.config.stats.decoded() >= MAX_DECODED_PICS {
            return DecodeResult::Retry;
        }

        let pool = &session.config.pool;
        let surface = match pool.get_free() {
            Some(surface) => surface,
            None => {
                if pool.len() >= pool.capacity() {
                    return DecodeResult::Retry;
                }
                match self.vendor.create_video_surface(
                    session.config.chroma,
                    session.config.surface_width,
                    session.config.surface_height,
                ) {
                    Ok(surface) => {
                        pool.add(surface);
                        surface
                    }
                    Err(err) => {
                        warn!(%err, "video surface creation failed");
                        return DecodeResult::Retry;
                    }
                }
            }
        };

        if let Err(err) = self
            .vendor
            .decoder_render(session.decoder, surface, &unit.data)
        {
            pool.clear_reference(surface);
            if err.is_preempted() {
                warn!("display preempted during decode");
                self.state = DisplayState::Lost;
                return DecodeResult::Retry;
            }
            self.error_count += 1;
            warn!(%err, errors = self.error_count, "decode failed");
            if self.error_count > MAX_DECODE_ERRORS {
                self.state = DisplayState::Error;
                return DecodeResult::Fatal;
            }
            return DecodeResult::Retry;
        }
        self.error_count = 0;

        pool.mark_render(surface);
        session.config.stats.inc_decoded();
        let _ = session.data_tx.send(OutputData::NewFrame(DecodedPicture {
            surface,
            pts: unit.pts,
            flags: unit.flags,
            eof: false,
        }));
        DecodeResult::Accepted
    }

    /// Waits up to `timeout` for the next presentable picture.
    pub fn get_picture(&mut self, timeout: Duration) -> PictureResult {
        match self.state {
            DisplayState::Error => return PictureResult::Fatal,
            DisplayState::Lost | DisplayState::Reset => return PictureResult::TryAgain,
            DisplayState::Open => {}
        }
        if self.poll_events() {
            return PictureResult::Fatal;
        }
        let Some(session) = &self.session else {
            return PictureResult::Fatal;
        };
        match session.output.pictures().recv_timeout(timeout) {
            Ok(pic) => PictureResult::Picture(pic),
            Err(_) => {
                let stats = &session.config.stats;
                if stats.is_draining() && stats.is_empty() {
                    PictureResult::Eof
                } else {
                    PictureResult::TryAgain
                }
            }
        }
    }

    /// Signals end of stream; buffered pictures keep coming out of
    /// `get_picture` until it reports `Eof`.
    pub fn drain(&mut self) {
        if let Some(session) = &self.session {
            session.config.stats.set_draining(true);
        }
    }

    /// Flushes the whole pipeline for a seek. Returns false when the
    /// session is no longer usable.
    pub fn reset(&mut self) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        // Undelivered pictures return their surfaces when dropped.
        while session.output.pictures().try_recv().is_ok() {}
        if session.output.flush(Duration::from_secs(2)) != ControlReply::Accepted {
            warn!("output flush failed");
            self.state = DisplayState::Error;
            return false;
        }
        // Returns from the first sweep may have opened slots in the
        // handout window, letting the actor push queued pictures into the
        // channel before it saw the flush. It is quiescent now, so one
        // more sweep catches them.
        while session.output.pictures().try_recv().is_ok() {}
        session.config.stats.reset();
        true
    }

    /// Releases GPU memory not pinned by pictures still on screen.
    pub fn precleanup(&mut self) {
        if let Some(session) = &self.session {
            let _ = session.output.precleanup(Duration::from_secs(2));
        }
    }

    /// Tears the session down completely.
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            drop(session.output);
            while let Some(surface) = session.config.pool.remove_next(false) {
                self.vendor.destroy_video_surface(surface);
            }
            self.vendor.destroy_decoder(session.decoder);
            debug!("decode session closed");
        }
        self.codec = None;
    }

    /// The display device went away; all vendor objects are invalid and
    /// are released eagerly.
    pub fn on_lost_display(&mut self) {
        if self.state != DisplayState::Error {
            info!("display lost");
            self.close_session_after_loss();
            self.state = DisplayState::Lost;
        }
    }

    /// The display device is back; the next decode call reconfigures.
    pub fn on_reset_display(&mut self) {
        if self.state == DisplayState::Lost {
            info!("display restored");
            self.state = DisplayState::Reset;
        }
    }

    /// Whether the mixer currently deinterlaces at full rate, meaning the
    /// player may ask for fields to be skipped under load.
    pub fn can_skip_deinterlace(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.config.stats.can_skip_deint())
            .unwrap_or(false)
    }

    /// Player hints for the current playback situation. `drain` announces
    /// end of stream; `no_postproc` bypasses the mixer to catch up.
    pub fn set_codec_control(&self, control: CodecControl) {
        if let Some(session) = &self.session {
            let stats = &session.config.stats;
            stats.set_no_postproc(control.no_postproc);
            stats.set_latency_us(control.latency_us);
            if control.drain {
                stats.set_draining(true);
            }
        }
    }

    /// Queue latency last reported through `set_codec_control`, for
    /// pipeline stages pacing against the presentation clock.
    pub fn latency_us(&self) -> i64 {
        self.session
            .as_ref()
            .map(|s| s.config.stats.latency_us())
            .unwrap_or(0)
    }

    /// How many surfaces the engine may keep referenced on top of what
    /// the pipeline itself needs.
    pub fn get_allowed_references(&self) -> u32 {
        self.session
            .as_ref()
            .map(|s| s.config.max_references)
            .unwrap_or(0)
    }

    /// Shared post-processing settings. The handle stays valid across
    /// session rebuilds.
    pub fn settings(&self) -> Arc<PostProcSettings> {
        self.settings.clone()
    }

    /// (decoded, processed, rendered) pictures currently in flight.
    pub fn buffer_counts(&self) -> (u64, u64, u64) {
        self.session
            .as_ref()
            .map(|s| s.config.stats.counts())
            .unwrap_or((0, 0, 0))
    }

    fn reconfigure(&mut self) -> bool {
        let Some(params) = self.codec else {
            return false;
        };
        info!("reconfiguring decode session after display reset");
        self.close_session_after_loss();
        self.open_session(params).is_ok()
    }

    /// Forgets the session without destroying per-surface vendor objects;
    /// the display loss already invalidated them.
    fn close_session_after_loss(&mut self) {
        if let Some(session) = self.session.take() {
            session.config.pool.reset();
            drop(session.output);
            self.vendor.destroy_decoder(session.decoder);
        }
    }

    /// True when the output actor reported an unrecoverable error.
    fn poll_events(&mut self) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        let mut fatal = false;
        while let Ok(event) = session.output.events().try_recv() {
            match event {
                OutputEvent::Error => fatal = true,
            }
        }
        if fatal {
            warn!("output pipeline reported an error");
            self.state = DisplayState::Error;
        }
        fatal
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reference frames the session must be able to hold, by codec.
fn allowed_references(profile: CodecProfile, ref_frames: u32) -> u32 {
    match profile {
        CodecProfile::H264High => {
            if ref_frames == 0 {
                16
            } else {
                ref_frames.clamp(5, 16)
            }
        }
        CodecProfile::HevcMain => 16,
        _ => 2,
    }
}
