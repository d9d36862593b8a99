//! Mixer actor: turns decoded pictures into presentable ones.
//!
//! Runs a cycle per decoded picture: choose the path (direct YUV
//! passthrough or a vendor mixer render), apply any changed
//! post-processing features, render one or two fields, then retire the
//! oldest history entries. Temporal deinterlacing needs a one-picture
//! lookahead, so the newest picture is buffered and the previous one is
//! emitted; a drain marker flushes that last buffered picture at end of
//! stream.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::mailbox::{request, ControlReply, MixerControl, MixerData};
use crate::picture::{
    DecodedPicture, InterlaceMethod, PostProcValues, ProcessedPicture, SessionConfig,
};
use crate::vendor::{
    ColorStandard, FieldStructure, MixerAttribute, MixerFeature, MixerHandle, MixerParams,
    MixerRenderRequest, OutputSurfaceHandle, Procamp, Rect, VendorDevice,
};

/// Pixels cropped from top and bottom when deinterlacing, hiding the edge
/// artifacts temporal filters produce there.
const DEINT_CROP_PIX: u32 = 3;

/// Past/future references kept for temporal filtering, plus the picture
/// waiting to become current.
const HISTORY_WINDOW: usize = 4;

/// Wakeup period for work not driven by a message, such as starting the
/// drain cycle.
const TICK: Duration = Duration::from_millis(100);

/// Front handle to the mixer actor.
pub struct Mixer {
    control_tx: Sender<MixerControl>,
    data_tx: Sender<MixerData>,
    picture_rx: Receiver<ProcessedPicture>,
    join: Option<JoinHandle<()>>,
}

impl Mixer {
    pub fn start(vendor: Arc<dyn VendorDevice>) -> Self {
        let (control_tx, control_rx) = unbounded();
        let (data_tx, data_rx) = unbounded();
        let (picture_tx, picture_rx) = unbounded();
        let join = thread::Builder::new()
            .name("video-mixer".into())
            .spawn(move || {
                MixerThread::new(vendor, control_rx, data_rx, picture_tx).run();
            })
            .ok();
        Self {
            control_tx,
            data_tx,
            picture_rx,
            join,
        }
    }

    pub fn init(&self, config: SessionConfig, timeout: Duration) -> ControlReply {
        request(
            &self.control_tx,
            |reply| MixerControl::Init { config, reply },
            timeout,
        )
    }

    pub fn flush(&self, timeout: Duration) -> ControlReply {
        request(&self.control_tx, |reply| MixerControl::Flush { reply }, timeout)
    }

    /// Pulls back every output surface queued inside the actor.
    pub fn reclaim_buffers(&self, timeout: Duration) -> Vec<OutputSurfaceHandle> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        if self
            .control_tx
            .send(MixerControl::ReclaimBuffers { reply: reply_tx })
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.recv_timeout(timeout).unwrap_or_default()
    }

    pub fn data_sender(&self) -> Sender<MixerData> {
        self.data_tx.clone()
    }

    pub fn pictures(&self) -> &Receiver<ProcessedPicture> {
        &self.picture_rx
    }
}

impl Drop for Mixer {
    fn drop(&mut self) {
        let _ = self.control_tx.send(MixerControl::Stop);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// What one mixer cycle will do for the picture about to become current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CyclePlan {
    /// Passthrough: hand the YUV surface downstream untouched.
    yuv: bool,
    steps: u8,
    field: FieldStructure,
}

fn plan_cycle(values: &PostProcValues, pic: &DecodedPicture, no_postproc: bool) -> CyclePlan {
    let deint = pic.flags.interlaced
        && !pic.flags.skip_deinterlace
        && matches!(
            values.interlace,
            InterlaceMethod::Temporal
                | InterlaceMethod::TemporalHalf
                | InterlaceMethod::TemporalSpatial
                | InterlaceMethod::TemporalSpatialHalf
        );
    let postproc = values.noise_reduction != 0.0
        || values.sharpness != 0.0
        || values.upscale_level > 0
        || values.brightness != 0.0
        || values.contrast != 1.0;

    if no_postproc || values.interlace == InterlaceMethod::Weave || (!deint && !postproc) {
        return CyclePlan {
            yuv: true,
            steps: 1,
            field: FieldStructure::Frame,
        };
    }
    if deint {
        CyclePlan {
            yuv: false,
            steps: if values.interlace.is_half_rate() { 1 } else { 2 },
            field: if pic.flags.top_field_first {
                FieldStructure::TopField
            } else {
                FieldStructure::BottomField
            },
        }
    } else {
        CyclePlan {
            yuv: false,
            steps: 1,
            field: FieldStructure::Frame,
        }
    }
}

struct HistoryPic {
    pic: DecodedPicture,
    /// Emitted on the passthrough path; its surface is owned downstream
    /// and must not be released when this entry retires.
    yuv: bool,
}

/// The second render of a full-rate deinterlace cycle, waiting for an
/// output surface.
struct SecondField {
    field: FieldStructure,
    pts: Option<Duration>,
}

struct MixerThread {
    vendor: Arc<dyn VendorDevice>,
    control_rx: Receiver<MixerControl>,
    data_rx: Receiver<MixerData>,
    picture_tx: Sender<ProcessedPicture>,
    config: Option<SessionConfig>,
    mixer: Option<MixerHandle>,
    applied: Option<PostProcValues>,
    pending: VecDeque<DecodedPicture>,
    /// Newest first: `[0]` is the lookahead, `[1]` the current picture.
    input: VecDeque<HistoryPic>,
    output_surfaces: VecDeque<OutputSurfaceHandle>,
    pending_second: Option<SecondField>,
    drained: bool,
}

impl MixerThread {
    fn new(
        vendor: Arc<dyn VendorDevice>,
        control_rx: Receiver<MixerControl>,
        data_rx: Receiver<MixerData>,
        picture_tx: Sender<ProcessedPicture>,
    ) -> Self {
        Self {
            vendor,
            control_rx,
            data_rx,
            picture_tx,
            config: None,
            mixer: None,
            applied: None,
            pending: VecDeque::new(),
            input: VecDeque::new(),
            output_surfaces: VecDeque::new(),
            pending_second: None,
            drained: false,
        }
    }

    fn run(mut self) {
        debug!("mixer thread started");
        loop {
            select! {
                recv(self.control_rx) -> msg => match msg {
                    Ok(MixerControl::Init { config, reply }) => {
                        let ok = self.init(config);
                        let _ = reply.send(if ok { ControlReply::Accepted } else { ControlReply::Error });
                    }
                    Ok(MixerControl::Flush { reply }) => {
                        self.flush();
                        let _ = reply.send(ControlReply::Accepted);
                    }
                    Ok(MixerControl::ReclaimBuffers { reply }) => {
                        while let Ok(msg) = self.data_rx.try_recv() {
                            match msg {
                                MixerData::Buffer(surface) => {
                                    self.output_surfaces.push_back(surface)
                                }
                                MixerData::Frame(pic) => self.pending.push_back(pic),
                            }
                        }
                        let _ = reply.send(self.output_surfaces.drain(..).collect());
                    }
                    Ok(MixerControl::Stop) | Err(_) => break,
                },
                recv(self.data_rx) -> msg => match msg {
                    Ok(MixerData::Frame(pic)) => self.pending.push_back(pic),
                    Ok(MixerData::Buffer(surface)) => self.output_surfaces.push_back(surface),
                    Err(_) => break,
                },
                default(TICK) => {}
            }
            while self.step() {}
        }
        self.uninit();
        debug!("mixer thread stopped");
    }

    fn init(&mut self, config: SessionConfig) -> bool {
        self.uninit();
        let mut features = Vec::new();
        for feature in [
            MixerFeature::DeinterlaceTemporal,
            MixerFeature::DeinterlaceTemporalSpatial,
            MixerFeature::InverseTelecine,
            MixerFeature::NoiseReduction,
            MixerFeature::Sharpness,
        ] {
            if self.vendor.supports(feature) {
                features.push(feature);
            }
        }
        for level in 1..=9 {
            if self.vendor.supports(MixerFeature::HighQualityScaling(level)) {
                features.push(MixerFeature::HighQualityScaling(level));
            }
        }
        let params = MixerParams {
            surface_width: config.surface_width,
            surface_height: config.surface_height,
            chroma: config.chroma,
        };
        match self.vendor.create_mixer(&params, &features) {
            Ok(handle) => {
                debug!(?handle, "created video mixer");
                self.mixer = Some(handle);
                self.applied = None;
                self.config = Some(config);
                true
            }
            Err(err) => {
                warn!(%err, "mixer creation failed");
                false
            }
        }
    }

    fn uninit(&mut self) {
        self.flush();
        if let Some(mixer) = self.mixer.take() {
            self.vendor.destroy_mixer(mixer);
        }
        self.output_surfaces.clear();
        self.config = None;
        self.applied = None;
    }

    /// Runs at most one render step. Returns whether progress was made.
    fn step(&mut self) -> bool {
        let Some(config) = self.config.clone() else {
            return false;
        };

        // A deferred second field takes priority over new cycles.
        if let Some(second) = self.pending_second.take() {
            let Some(out) = self.output_surfaces.pop_front() else {
                self.pending_second = Some(second);
                return false;
            };
            self.render_field(&config, second.field, second.pts, out);
            self.fini_cycle(&config);
            return true;
        }

        if self.pending.is_empty() {
            // End of stream: replay the newest picture once so the real
            // last picture gains a future reference and can be emitted.
            if config.stats.is_draining() && !self.drained && !self.input.is_empty() {
                let mut copy = self.input[0].pic.clone();
                copy.eof = true;
                copy.pts = None;
                self.pending.push_back(copy);
                self.drained = true;
            } else {
                return false;
            }
        }

        let will_emit = !self.input.is_empty();
        if !will_emit {
            // First picture of the stream only primes the lookahead.
            if let Some(pic) = self.pending.pop_front() {
                self.input.push_front(HistoryPic { pic, yuv: false });
            }
            return true;
        }

        let settings = config.settings.get();
        let plan = plan_cycle(&settings, &self.input[0].pic, config.stats.no_postproc());
        let out = if plan.yuv {
            None
        } else {
            match self.output_surfaces.pop_front() {
                Some(out) => Some(out),
                None => return false,
            }
        };

        let Some(pic) = self.pending.pop_front() else {
            if let Some(out) = out {
                self.output_surfaces.push_front(out);
            }
            return false;
        };
        self.input.push_front(HistoryPic { pic, yuv: false });

        config.stats.set_can_skip_deint(plan.steps == 2);
        self.apply_features(&config, &settings);

        if plan.yuv {
            self.input[1].yuv = true;
            self.emit_yuv(&config);
            self.fini_cycle(&config);
            return true;
        }

        let cur_pts = self.input[1].pic.pts;
        if let Some(out) = out {
            self.render_field(&config, plan.field, cur_pts, out);
        }
        if plan.steps == 2 {
            // Second field is presented halfway to the next picture.
            let next_pts = self.input[0].pic.pts;
            let pts = match (cur_pts, next_pts) {
                (Some(a), Some(b)) if b > a => Some(a + (b - a) / 2),
                (a, _) => a,
            };
            self.pending_second = Some(SecondField {
                field: plan.field.flipped(),
                pts,
            });
        } else {
            self.fini_cycle(&config);
        }
        true
    }

    fn emit_yuv(&mut self, config: &SessionConfig) {
        let cur = &self.input[1].pic;
        let picture = ProcessedPicture {
            id: 0,
            video_surface: cur.surface,
            output_surface: None,
            crop: Rect::new(0, 0, config.vid_width, config.vid_height),
            pts: cur.pts,
            flags: cur.flags,
        };
        trace!(pts = ?picture.pts, "emit passthrough picture");
        config.stats.inc_processed();
        let _ = self.picture_tx.send(picture);
    }

    fn render_field(
        &mut self,
        config: &SessionConfig,
        field: FieldStructure,
        pts: Option<Duration>,
        out: OutputSurfaceHandle,
    ) {
        let Some(mixer) = self.mixer else {
            self.output_surfaces.push_back(out);
            return;
        };
        let cur = self.input[1].pic.surface;
        let futu = [self.input[0].pic.surface];
        let mut past = Vec::with_capacity(2);
        for entry in self.input.iter().skip(2).take(2) {
            past.push(entry.pic.surface);
        }
        let crop = if field == FieldStructure::Frame {
            0
        } else {
            DEINT_CROP_PIX
        };
        let request = MixerRenderRequest {
            field,
            past: &past,
            current: cur,
            future: &futu,
            source: Rect::new(0, crop, config.vid_width, config.vid_height - crop),
            dest: Rect::new(0, 0, config.out_width, config.out_height),
            output: out,
        };
        match self.vendor.mixer_render(mixer, &request) {
            Ok(()) => {
                let picture = ProcessedPicture {
                    id: 0,
                    video_surface: cur,
                    output_surface: Some(out),
                    crop: Rect::new(0, 0, config.out_width, config.out_height),
                    pts,
                    flags: self.input[1].pic.flags,
                };
                trace!(?field, pts = ?picture.pts, "emit mixed picture");
                config.stats.inc_processed();
                let _ = self.picture_tx.send(picture);
            }
            Err(err) => {
                warn!(%err, "mixer render failed, dropping picture");
                self.output_surfaces.push_back(out);
            }
        }
    }

    /// Retires the current picture and trims history.
    fn fini_cycle(&mut self, config: &SessionConfig) {
        config.stats.dec_decoded();
        if self.input[0].pic.eof {
            // Drain cycle done; release everything still held here. The
            // replayed entry shares its surface with the real picture, so
            // it is skipped.
            for entry in self.input.drain(..) {
                if !entry.yuv && !entry.pic.eof {
                    config.pool.clear_render(entry.pic.surface);
                }
            }
            return;
        }
        while self.input.len() > HISTORY_WINDOW {
            if let Some(entry) = self.input.pop_back() {
                if !entry.yuv {
                    config.pool.clear_render(entry.pic.surface);
                }
            }
        }
    }

    /// Pushes changed post-processing settings to the vendor mixer. With
    /// nothing changed since the last cycle this is a single comparison.
    fn apply_features(&mut self, config: &SessionConfig, values: &PostProcValues) {
        let Some(mixer) = self.mixer else { return };
        if self.applied.map_or(false, |prev| {
            prev.interlace == values.interlace
                && prev.inverse_telecine == values.inverse_telecine
                && prev.skip_chroma_deint == values.skip_chroma_deint
                && prev.noise_reduction == values.noise_reduction
                && prev.sharpness == values.sharpness
                && prev.brightness == values.brightness
                && prev.contrast == values.contrast
                && prev.upscale_level == values.upscale_level
        }) {
            return;
        }
        let prev = self.applied;
        let mut enables: Vec<(MixerFeature, bool)> = Vec::new();
        let mut attrs: Vec<MixerAttribute> = Vec::new();

        if prev.map(|p| p.noise_reduction) != Some(values.noise_reduction) {
            enables.push((MixerFeature::NoiseReduction, values.noise_reduction > 0.0));
            if values.noise_reduction > 0.0 {
                attrs.push(MixerAttribute::NoiseReduction(values.noise_reduction));
            }
        }
        if prev.map(|p| p.sharpness) != Some(values.sharpness) {
            enables.push((MixerFeature::Sharpness, values.sharpness != 0.0));
            if values.sharpness != 0.0 {
                attrs.push(MixerAttribute::Sharpness(values.sharpness));
            }
        }
        if prev.map(|p| p.upscale_level) != Some(values.upscale_level) {
            if let Some(p) = prev {
                if p.upscale_level > 0 {
                    enables.push((MixerFeature::HighQualityScaling(p.upscale_level), false));
                }
            }
            if values.upscale_level > 0
                && self
                    .vendor
                    .supports(MixerFeature::HighQualityScaling(values.upscale_level))
            {
                enables.push((MixerFeature::HighQualityScaling(values.upscale_level), true));
            }
        }
        if prev.map(|p| p.interlace) != Some(values.interlace) {
            let temporal = matches!(
                values.interlace,
                InterlaceMethod::Temporal | InterlaceMethod::TemporalHalf
            );
            let spatial = matches!(
                values.interlace,
                InterlaceMethod::TemporalSpatial | InterlaceMethod::TemporalSpatialHalf
            );
            enables.push((MixerFeature::DeinterlaceTemporal, temporal || spatial));
            enables.push((MixerFeature::DeinterlaceTemporalSpatial, spatial));
        }
        if prev.map(|p| p.inverse_telecine) != Some(values.inverse_telecine) {
            // Only meaningful on top of a temporal deinterlacer.
            enables.push((
                MixerFeature::InverseTelecine,
                values.inverse_telecine && values.interlace != InterlaceMethod::None,
            ));
        }
        if prev.map(|p| p.skip_chroma_deint) != Some(values.skip_chroma_deint) {
            attrs.push(MixerAttribute::SkipChromaDeinterlace(values.skip_chroma_deint));
        }
        if prev.map(|p| (p.brightness, p.contrast)) != Some((values.brightness, values.contrast)) {
            let procamp = Procamp {
                brightness: values.brightness,
                contrast: values.contrast,
                ..Procamp::default()
            };
            let standard = if config.vid_height >= 600 {
                ColorStandard::Bt709
            } else {
                ColorStandard::Bt601
            };
            match self.vendor.generate_csc_matrix(&procamp, standard) {
                Ok(matrix) => attrs.push(MixerAttribute::CscMatrix(matrix)),
                Err(err) => warn!(%err, "csc matrix generation failed"),
            }
        }

        if !enables.is_empty() {
            if let Err(err) = self.vendor.set_feature_enables(mixer, &enables) {
                warn!(%err, "setting mixer features failed");
            }
        }
        if !attrs.is_empty() {
            if let Err(err) = self.vendor.set_attributes(mixer, &attrs) {
                warn!(%err, "setting mixer attributes failed");
            }
        }
        self.applied = Some(*values);
    }

    /// Discards all buffered work and releases surfaces held here.
    fn flush(&mut self) {
        let Some(config) = self.config.clone() else {
            self.pending.clear();
            self.input.clear();
            self.pending_second = None;
            self.drained = false;
            return;
        };
        while let Ok(msg) = self.data_rx.try_recv() {
            match msg {
                MixerData::Frame(pic) => {
                    if !pic.eof {
                        config.pool.clear_render(pic.surface);
                    }
                }
                MixerData::Buffer(surface) => self.output_surfaces.push_back(surface),
            }
        }
        for pic in self.pending.drain(..) {
            if !pic.eof {
                config.pool.clear_render(pic.surface);
            }
        }
        self.pending_second = None;
        for entry in self.input.drain(..) {
            if !entry.yuv && !entry.pic.eof {
                config.pool.clear_render(entry.pic.surface);
            }
        }
        self.drained = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picture::{PictureFlags, PostProcSettings};
    use crate::surfaces::{BufferStats, SurfacePool};
    use crate::vendor::mock::MockVendor;
    use crate::vendor::{ChromaFormat, VideoSurfaceHandle};
    use std::time::Duration;

    fn config(pool: Arc<SurfacePool>, stats: Arc<BufferStats>) -> SessionConfig {
        SessionConfig {
            surface_width: 1920,
            surface_height: 1088,
            vid_width: 1920,
            vid_height: 1080,
            out_width: 1920,
            out_height: 1080,
            chroma: ChromaFormat::Yuv420,
            max_references: 4,
            num_render_buffers: 5,
            session_epoch: 1,
            pool,
            stats,
            settings: Arc::new(PostProcSettings::new()),
        }
    }

    fn decoded(pool: &SurfacePool, n: u32, pts_ms: u64, flags: PictureFlags) -> DecodedPicture {
        let surface = VideoSurfaceHandle(n);
        pool.add(surface);
        pool.mark_render(surface);
        DecodedPicture {
            surface,
            pts: Some(Duration::from_millis(pts_ms)),
            flags,
            eof: false,
        }
    }

    fn progressive() -> PictureFlags {
        PictureFlags::default()
    }

    fn interlaced_tff() -> PictureFlags {
        PictureFlags {
            interlaced: true,
            top_field_first: true,
            skip_deinterlace: false,
        }
    }

    #[test]
    fn test_plan_passthrough_for_progressive_defaults() {
        let values = PostProcValues::default();
        let pic = DecodedPicture {
            surface: VideoSurfaceHandle(1),
            pts: None,
            flags: progressive(),
            eof: false,
        };
        let plan = plan_cycle(&values, &pic, false);
        assert!(plan.yuv);
        assert_eq!(plan.steps, 1);
    }

    #[test]
    fn test_plan_full_rate_temporal_is_two_steps() {
        let mut values = PostProcValues::default();
        values.interlace = InterlaceMethod::Temporal;
        let pic = DecodedPicture {
            surface: VideoSurfaceHandle(1),
            pts: None,
            flags: interlaced_tff(),
            eof: false,
        };
        let plan = plan_cycle(&values, &pic, false);
        assert!(!plan.yuv);
        assert_eq!(plan.steps, 2);
        assert_eq!(plan.field, FieldStructure::TopField);
    }

    #[test]
    fn test_plan_half_rate_is_one_step() {
        let mut values = PostProcValues::default();
        values.interlace = InterlaceMethod::TemporalHalf;
        let pic = DecodedPicture {
            surface: VideoSurfaceHandle(1),
            pts: None,
            flags: interlaced_tff(),
            eof: false,
        };
        let plan = plan_cycle(&values, &pic, false);
        assert!(!plan.yuv);
        assert_eq!(plan.steps, 1);
    }

    #[test]
    fn test_plan_skip_flag_drops_deinterlacing() {
        let mut values = PostProcValues::default();
        values.interlace = InterlaceMethod::Temporal;
        let mut flags = interlaced_tff();
        flags.skip_deinterlace = true;
        let pic = DecodedPicture {
            surface: VideoSurfaceHandle(1),
            pts: None,
            flags,
            eof: false,
        };
        let plan = plan_cycle(&values, &pic, false);
        assert!(plan.yuv);
    }

    #[test]
    fn test_plan_no_postproc_forces_passthrough() {
        let mut values = PostProcValues::default();
        values.interlace = InterlaceMethod::Temporal;
        let pic = DecodedPicture {
            surface: VideoSurfaceHandle(1),
            pts: None,
            flags: interlaced_tff(),
            eof: false,
        };
        let plan = plan_cycle(&values, &pic, true);
        assert!(plan.yuv);
    }

    #[test]
    fn test_passthrough_emits_with_one_picture_latency() {
        let vendor = MockVendor::new();
        let pool = Arc::new(SurfacePool::new(8));
        let stats = Arc::new(BufferStats::new());
        let mixer = Mixer::start(Arc::new(vendor));
        assert_eq!(
            mixer.init(config(pool.clone(), stats.clone()), Duration::from_secs(1)),
            ControlReply::Accepted
        );

        let data = mixer.data_sender();
        stats.inc_decoded();
        data.send(MixerData::Frame(decoded(&pool, 1, 0, progressive())))
            .unwrap();
        assert!(mixer
            .pictures()
            .recv_timeout(Duration::from_millis(100))
            .is_err());

        stats.inc_decoded();
        data.send(MixerData::Frame(decoded(&pool, 2, 40, progressive())))
            .unwrap();
        let pic = mixer.pictures().recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(pic.is_passthrough());
        assert_eq!(pic.video_surface, VideoSurfaceHandle(1));
        assert_eq!(pic.pts, Some(Duration::from_millis(0)));
    }

    #[test]
    fn test_full_rate_deinterlace_emits_two_fields_with_midpoint_pts() {
        let vendor = MockVendor::new();
        let pool = Arc::new(SurfacePool::new(8));
        let stats = Arc::new(BufferStats::new());
        let cfg = config(pool.clone(), stats.clone());
        cfg.settings
            .update(|v| v.interlace = InterlaceMethod::Temporal);
        let mixer = Mixer::start(Arc::new(vendor));
        assert_eq!(mixer.init(cfg, Duration::from_secs(1)), ControlReply::Accepted);

        let data = mixer.data_sender();
        data.send(MixerData::Buffer(OutputSurfaceHandle(100))).unwrap();
        data.send(MixerData::Buffer(OutputSurfaceHandle(101))).unwrap();
        stats.inc_decoded();
        data.send(MixerData::Frame(decoded(&pool, 1, 0, interlaced_tff())))
            .unwrap();
        stats.inc_decoded();
        data.send(MixerData::Frame(decoded(&pool, 2, 40, interlaced_tff())))
            .unwrap();

        let first = mixer.pictures().recv_timeout(Duration::from_secs(1)).unwrap();
        let second = mixer.pictures().recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(!first.is_passthrough());
        assert_eq!(first.pts, Some(Duration::from_millis(0)));
        assert_eq!(second.pts, Some(Duration::from_millis(20)));
        assert!(stats.can_skip_deint());
    }

    #[test]
    fn test_second_field_waits_for_output_surface() {
        let vendor = MockVendor::new();
        let pool = Arc::new(SurfacePool::new(8));
        let stats = Arc::new(BufferStats::new());
        let cfg = config(pool.clone(), stats.clone());
        cfg.settings
            .update(|v| v.interlace = InterlaceMethod::Temporal);
        let mixer = Mixer::start(Arc::new(vendor));
        assert_eq!(mixer.init(cfg, Duration::from_secs(1)), ControlReply::Accepted);

        let data = mixer.data_sender();
        data.send(MixerData::Buffer(OutputSurfaceHandle(100))).unwrap();
        stats.inc_decoded();
        data.send(MixerData::Frame(decoded(&pool, 1, 0, interlaced_tff())))
            .unwrap();
        stats.inc_decoded();
        data.send(MixerData::Frame(decoded(&pool, 2, 40, interlaced_tff())))
            .unwrap();

        let _first = mixer.pictures().recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(mixer
            .pictures()
            .recv_timeout(Duration::from_millis(100))
            .is_err());

        data.send(MixerData::Buffer(OutputSurfaceHandle(101))).unwrap();
        let second = mixer.pictures().recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(second.pts, Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_drain_flushes_the_buffered_last_picture() {
        let vendor = MockVendor::new();
        let pool = Arc::new(SurfacePool::new(8));
        let stats = Arc::new(BufferStats::new());
        let mixer = Mixer::start(Arc::new(vendor));
        assert_eq!(
            mixer.init(config(pool.clone(), stats.clone()), Duration::from_secs(1)),
            ControlReply::Accepted
        );

        let data = mixer.data_sender();
        stats.inc_decoded();
        data.send(MixerData::Frame(decoded(&pool, 1, 0, progressive())))
            .unwrap();
        assert!(mixer
            .pictures()
            .recv_timeout(Duration::from_millis(100))
            .is_err());

        stats.set_draining(true);
        // Any message wakes the actor; a buffer donation is harmless.
        data.send(MixerData::Buffer(OutputSurfaceHandle(100))).unwrap();
        let pic = mixer.pictures().recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(pic.video_surface, VideoSurfaceHandle(1));
        assert_eq!(stats.counts().0, 0);
    }

    #[test]
    fn test_render_failure_drops_picture_and_recycles_surface() {
        let vendor = MockVendor::new();
        vendor.fail_mixer_renders(1);
        let pool = Arc::new(SurfacePool::new(8));
        let stats = Arc::new(BufferStats::new());
        let cfg = config(pool.clone(), stats.clone());
        cfg.settings
            .update(|v| v.interlace = InterlaceMethod::TemporalHalf);
        let mixer = Mixer::start(Arc::new(vendor.clone()));
        assert_eq!(mixer.init(cfg, Duration::from_secs(1)), ControlReply::Accepted);

        let data = mixer.data_sender();
        data.send(MixerData::Buffer(OutputSurfaceHandle(100))).unwrap();
        for n in 1..=3 {
            stats.inc_decoded();
            data.send(MixerData::Frame(decoded(
                &pool,
                n,
                u64::from(n) * 40,
                interlaced_tff(),
            )))
            .unwrap();
        }
        // First render fails and its picture is dropped; the surface is
        // reused so the next cycle still emits.
        let pic = mixer.pictures().recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(pic.pts, Some(Duration::from_millis(80)));
        // One failed render plus the successful one, no silent retries.
        assert_eq!(vendor.mixer_render_calls(), 2);
    }

    #[test]
    fn test_inverse_telecine_and_skip_chroma_reach_the_vendor() {
        let vendor = MockVendor::new();
        let pool = Arc::new(SurfacePool::new(8));
        let stats = Arc::new(BufferStats::new());
        let cfg = config(pool.clone(), stats.clone());
        cfg.settings.update(|v| {
            v.interlace = InterlaceMethod::Temporal;
            v.inverse_telecine = true;
            v.skip_chroma_deint = true;
        });
        let mixer = Mixer::start(Arc::new(vendor.clone()));
        assert_eq!(mixer.init(cfg, Duration::from_secs(1)), ControlReply::Accepted);

        let data = mixer.data_sender();
        data.send(MixerData::Buffer(OutputSurfaceHandle(100))).unwrap();
        data.send(MixerData::Buffer(OutputSurfaceHandle(101))).unwrap();
        stats.inc_decoded();
        data.send(MixerData::Frame(decoded(&pool, 1, 0, interlaced_tff())))
            .unwrap();
        stats.inc_decoded();
        data.send(MixerData::Frame(decoded(&pool, 2, 40, interlaced_tff())))
            .unwrap();
        let _pic = mixer.pictures().recv_timeout(Duration::from_secs(1)).unwrap();

        assert_eq!(
            vendor.last_feature_enable(MixerFeature::InverseTelecine),
            Some(true)
        );
        assert_eq!(vendor.skip_chroma_attr(), Some(true));
    }

    #[test]
    fn test_flush_releases_held_surfaces() {
        let vendor = MockVendor::new();
        let pool = Arc::new(SurfacePool::new(8));
        let stats = Arc::new(BufferStats::new());
        let mixer = Mixer::start(Arc::new(vendor));
        assert_eq!(
            mixer.init(config(pool.clone(), stats.clone()), Duration::from_secs(1)),
            ControlReply::Accepted
        );

        let data = mixer.data_sender();
        stats.inc_decoded();
        data.send(MixerData::Frame(decoded(&pool, 1, 0, progressive())))
            .unwrap();
        assert_eq!(mixer.flush(Duration::from_secs(1)), ControlReply::Accepted);
        assert!(pool.has_free());
    }
}
