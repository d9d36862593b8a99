//! Picture types flowing through the pipeline, per-session configuration,
//! and the owning render-picture handle handed to the consumer.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::mailbox::OutputData;
use crate::surfaces::{BufferStats, SurfacePool};
use crate::vendor::{
    ChromaFormat, CodecProfile, OutputSurfaceHandle, Rect, VideoSurfaceHandle,
};

/// Codec parameters established at session open.
#[derive(Debug, Clone, Copy)]
pub struct CodecParams {
    pub profile: CodecProfile,
    pub coded_width: u32,
    pub coded_height: u32,
    pub display_width: u32,
    pub display_height: u32,
    pub chroma: ChromaFormat,
    pub fps: f64,
    /// Reference frame count from the bitstream, 0 when unknown.
    pub ref_frames: u32,
}

/// Per-picture flags carried from the bitstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct PictureFlags {
    pub interlaced: bool,
    pub top_field_first: bool,
    /// Player hint that deinterlacing may be dropped to catch up.
    pub skip_deinterlace: bool,
}

/// A decoded picture on its way from the decoder to the mixer.
#[derive(Debug, Clone)]
pub struct DecodedPicture {
    pub surface: VideoSurfaceHandle,
    pub pts: Option<Duration>,
    pub flags: PictureFlags,
    /// Drain marker synthesized at end of stream; carries no real surface.
    pub eof: bool,
}

/// Crop applied when sampling the video surface.
pub type CropRect = Rect;

/// A mixer-processed picture owned by the output actor.
#[derive(Debug, Clone)]
pub struct ProcessedPicture {
    pub id: u64,
    pub video_surface: VideoSurfaceHandle,
    /// `None` on the progressive passthrough path, where the consumer
    /// samples the video surface directly.
    pub output_surface: Option<OutputSurfaceHandle>,
    pub crop: CropRect,
    pub pts: Option<Duration>,
    pub flags: PictureFlags,
}

impl ProcessedPicture {
    pub fn is_passthrough(&self) -> bool {
        self.output_surface.is_none()
    }
}

/// Deinterlacing method requested by the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterlaceMethod {
    /// No deinterlacing; interlaced content is passed through as frames.
    None,
    /// Bob/weave via the passthrough path.
    Weave,
    Temporal,
    TemporalHalf,
    TemporalSpatial,
    TemporalSpatialHalf,
}

impl InterlaceMethod {
    pub fn is_half_rate(self) -> bool {
        matches!(self, InterlaceMethod::TemporalHalf | InterlaceMethod::TemporalSpatialHalf)
    }
}

/// Post-processing values the player may change at any time.
#[derive(Debug, Clone, Copy)]
pub struct PostProcValues {
    pub interlace: InterlaceMethod,
    /// Reconstruct film frames from telecined content while
    /// deinterlacing.
    pub inverse_telecine: bool,
    /// Deinterlace luma only; halves mixer bandwidth on weak GPUs.
    pub skip_chroma_deint: bool,
    /// 0.0 disables the feature.
    pub noise_reduction: f32,
    pub sharpness: f32,
    pub brightness: f32,
    pub contrast: f32,
    /// High quality scaling level, 0 disables.
    pub upscale_level: u8,
}

impl Default for PostProcValues {
    fn default() -> Self {
        Self {
            interlace: InterlaceMethod::None,
            inverse_telecine: false,
            skip_chroma_deint: false,
            noise_reduction: 0.0,
            sharpness: 0.0,
            brightness: 0.0,
            contrast: 1.0,
            upscale_level: 0,
        }
    }
}

/// Shared, mutex-guarded post-processing settings. The player writes,
/// the mixer reads a snapshot at each cycle start.
pub struct PostProcSettings {
    values: Mutex<PostProcValues>,
}

impl PostProcSettings {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(PostProcValues::default()),
        }
    }

    pub fn get(&self) -> PostProcValues {
        *self.values.lock()
    }

    pub fn set(&self, values: PostProcValues) {
        *self.values.lock() = values;
    }

    pub fn update(&self, f: impl FnOnce(&mut PostProcValues)) {
        f(&mut self.values.lock());
    }
}

impl Default for PostProcSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the actors need to know about one decode session.
#[derive(Clone)]
pub struct SessionConfig {
    pub surface_width: u32,
    pub surface_height: u32,
    pub vid_width: u32,
    pub vid_height: u32,
    pub out_width: u32,
    pub out_height: u32,
    pub chroma: ChromaFormat,
    pub max_references: u32,
    /// Render pictures kept in flight toward the consumer.
    pub num_render_buffers: usize,
    /// Bumped on every (re)open; stale pictures from an older epoch are
    /// dropped rather than returned to a pool that no longer owns them.
    pub session_epoch: u64,
    pub pool: Arc<SurfacePool>,
    pub stats: Arc<BufferStats>,
    pub settings: Arc<PostProcSettings>,
}

struct RenderPictureInner {
    id: u64,
    epoch: u64,
    return_tx: Sender<OutputData>,
}

impl Drop for RenderPictureInner {
    fn drop(&mut self) {
        // Output actor may already be gone during teardown; nothing to
        // return to in that case.
        let _ = self.return_tx.send(OutputData::ReturnPic {
            id: self.id,
            epoch: self.epoch,
        });
    }
}

/// A processed picture handed to the consumer.
///
/// Cloneable; when the last clone drops, the underlying surfaces go back
/// to the output actor for reuse.
#[derive(Clone)]
pub struct RenderPicture {
    inner: Arc<RenderPictureInner>,
    picture: ProcessedPicture,
    device_id: u64,
}

impl RenderPicture {
    pub(crate) fn new(
        picture: ProcessedPicture,
        epoch: u64,
        device_id: u64,
        return_tx: Sender<OutputData>,
    ) -> Self {
        Self {
            inner: Arc::new(RenderPictureInner {
                id: picture.id,
                epoch,
                return_tx,
            }),
            picture,
            device_id,
        }
    }

    pub fn picture(&self) -> &ProcessedPicture {
        &self.picture
    }

    pub fn pts(&self) -> Option<Duration> {
        self.picture.pts
    }

    pub fn crop(&self) -> CropRect {
        self.picture.crop
    }

    /// Identity of the GPU device the surfaces live on.
    pub fn device_id(&self) -> u64 {
        self.device_id
    }
}

impl std::fmt::Debug for RenderPicture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPicture")
            .field("id", &self.inner.id)
            .field("pts", &self.picture.pts)
            .field("passthrough", &self.picture.is_passthrough())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn processed(id: u64) -> ProcessedPicture {
        ProcessedPicture {
            id,
            video_surface: VideoSurfaceHandle(1),
            output_surface: None,
            crop: CropRect::default(),
            pts: Some(Duration::from_millis(40)),
            flags: PictureFlags::default(),
        }
    }

    #[test]
    fn test_render_picture_returns_on_last_drop() {
        let (tx, rx) = unbounded();
        let pic = RenderPicture::new(processed(9), 3, 1, tx);
        let clone = pic.clone();
        drop(pic);
        assert!(rx.try_recv().is_err());
        drop(clone);
        match rx.try_recv() {
            Ok(OutputData::ReturnPic { id, epoch }) => {
                assert_eq!(id, 9);
                assert_eq!(epoch, 3);
            }
            other => panic!("expected return message, got {other:?}"),
        }
    }

    #[test]
    fn test_render_picture_drop_survives_closed_channel() {
        let (tx, rx) = unbounded();
        let pic = RenderPicture::new(processed(1), 1, 1, tx);
        drop(rx);
        drop(pic);
    }

    #[test]
    fn test_postproc_settings_update() {
        let settings = PostProcSettings::new();
        settings.update(|v| v.interlace = InterlaceMethod::Temporal);
        assert_eq!(settings.get().interlace, InterlaceMethod::Temporal);
        assert!(InterlaceMethod::TemporalHalf.is_half_rate());
        assert!(!InterlaceMethod::Temporal.is_half_rate());
    }
}
