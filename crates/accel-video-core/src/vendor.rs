//! Boundary to the vendor hardware video API.
//!
//! The pipeline never links a driver directly. Everything it needs from the
//! hardware — decoder objects, video/output surfaces, the post-processing
//! mixer, CSC matrix generation — goes through [`VendorDevice`]. Handles are
//! opaque integers owned by the driver; the pipeline only tracks their
//! lifecycle.

use std::fmt;

/// Opaque handle to a decoded-picture (YUV) surface in GPU memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VideoSurfaceHandle(pub u32);

/// Opaque handle to an RGBA output surface the mixer renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputSurfaceHandle(pub u32);

/// Opaque handle to a vendor decoder object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecoderHandle(pub u32);

/// Opaque handle to a vendor video mixer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MixerHandle(pub u32);

/// Classification of a failed vendor call.
///
/// `Preempted` means the display device was taken away (mode change, VT
/// switch); the pipeline reacts with the LOST/RESET cycle rather than
/// treating it as an error. `NoResources` is transient exhaustion and maps
/// to backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorErrorKind {
    /// Display preempted; resources must be released and re-acquired.
    Preempted,
    /// Transient resource exhaustion; retry later.
    NoResources,
    /// Any other driver failure.
    Failed,
}

/// Error returned by a vendor call.
#[derive(Debug, Clone)]
pub struct VendorError {
    pub kind: VendorErrorKind,
    pub context: &'static str,
}

impl VendorError {
    pub fn new(kind: VendorErrorKind, context: &'static str) -> Self {
        Self { kind, context }
    }

    pub fn is_preempted(&self) -> bool {
        self.kind == VendorErrorKind::Preempted
    }
}

impl fmt::Display for VendorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            VendorErrorKind::Preempted => write!(f, "display preempted during {}", self.context),
            VendorErrorKind::NoResources => write!(f, "out of resources during {}", self.context),
            VendorErrorKind::Failed => write!(f, "vendor call failed: {}", self.context),
        }
    }
}

impl std::error::Error for VendorError {}

/// Chroma subsampling of decoded surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaFormat {
    Yuv420,
    Yuv422,
    Yuv444,
}

/// Codec profiles the hardware decoder may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecProfile {
    Mpeg1,
    Mpeg2Main,
    H264High,
    HevcMain,
    Vc1Advanced,
    Mpeg4Asp,
}

/// Result of a decoder capability query.
#[derive(Debug, Clone, Copy)]
pub struct DecoderCaps {
    pub supported: bool,
    pub max_width: u32,
    pub max_height: u32,
    pub max_references: u32,
}

/// Post-processing features of the vendor mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MixerFeature {
    DeinterlaceTemporal,
    DeinterlaceTemporalSpatial,
    InverseTelecine,
    NoiseReduction,
    Sharpness,
    /// High quality scaling, levels 1..=9.
    HighQualityScaling(u8),
}

/// Picture structure passed to a mixer render call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldStructure {
    Frame,
    TopField,
    BottomField,
}

impl FieldStructure {
    /// The opposite field, used for the second deinterlace step.
    pub fn flipped(self) -> Self {
        match self {
            FieldStructure::TopField => FieldStructure::BottomField,
            FieldStructure::BottomField => FieldStructure::TopField,
            FieldStructure::Frame => FieldStructure::Frame,
        }
    }
}

/// Axis-aligned pixel rectangle, top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Rect {
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self { x0, y0, x1, y1 }
    }
}

/// Procamp values feeding CSC matrix generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Procamp {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub hue: f32,
}

impl Default for Procamp {
    fn default() -> Self {
        Self {
            brightness: 0.0,
            contrast: 1.0,
            saturation: 1.0,
            hue: 0.0,
        }
    }
}

/// Color standard for CSC matrix generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorStandard {
    Bt601,
    Bt709,
}

/// Color-space conversion matrix (3 rows of [r g b bias]).
pub type CscMatrix = [[f32; 4]; 3];

/// Immutable parameters of a mixer object.
#[derive(Debug, Clone, Copy)]
pub struct MixerParams {
    pub surface_width: u32,
    pub surface_height: u32,
    pub chroma: ChromaFormat,
}

/// Runtime-settable mixer attribute.
#[derive(Debug, Clone, Copy)]
pub enum MixerAttribute {
    CscMatrix(CscMatrix),
    NoiseReduction(f32),
    Sharpness(f32),
    SkipChromaDeinterlace(bool),
}

/// One mixer render call: current surface plus temporal references.
#[derive(Debug)]
pub struct MixerRenderRequest<'a> {
    pub field: FieldStructure,
    pub past: &'a [VideoSurfaceHandle],
    pub current: VideoSurfaceHandle,
    pub future: &'a [VideoSurfaceHandle],
    pub source: Rect,
    pub dest: Rect,
    pub output: OutputSurfaceHandle,
}

/// The vendor hardware video API.
///
/// One instance represents one GPU device. All calls are issued by the actor
/// owning the corresponding GPU context: the decode path creates video
/// surfaces and runs the decoder, the output actor owns output surfaces,
/// the mixer actor owns the mixer object.
pub trait VendorDevice: Send + Sync {
    fn query_caps(&self, profile: CodecProfile) -> Result<DecoderCaps, VendorError>;

    /// Whether the mixer supports a post-processing feature on this device.
    fn supports(&self, feature: MixerFeature) -> bool;

    fn create_decoder(
        &self,
        profile: CodecProfile,
        width: u32,
        height: u32,
        max_references: u32,
    ) -> Result<DecoderHandle, VendorError>;

    fn destroy_decoder(&self, decoder: DecoderHandle);

    /// Submits one encoded access unit, decoding into `target`.
    fn decoder_render(
        &self,
        decoder: DecoderHandle,
        target: VideoSurfaceHandle,
        unit: &[u8],
    ) -> Result<(), VendorError>;

    fn create_video_surface(
        &self,
        chroma: ChromaFormat,
        width: u32,
        height: u32,
    ) -> Result<VideoSurfaceHandle, VendorError>;

    fn destroy_video_surface(&self, surface: VideoSurfaceHandle);

    fn create_output_surface(
        &self,
        width: u32,
        height: u32,
    ) -> Result<OutputSurfaceHandle, VendorError>;

    fn destroy_output_surface(&self, surface: OutputSurfaceHandle);

    fn create_mixer(
        &self,
        params: &MixerParams,
        features: &[MixerFeature],
    ) -> Result<MixerHandle, VendorError>;

    fn destroy_mixer(&self, mixer: MixerHandle);

    fn set_feature_enables(
        &self,
        mixer: MixerHandle,
        features: &[(MixerFeature, bool)],
    ) -> Result<(), VendorError>;

    fn set_attributes(
        &self,
        mixer: MixerHandle,
        attributes: &[MixerAttribute],
    ) -> Result<(), VendorError>;

    fn mixer_render(
        &self,
        mixer: MixerHandle,
        request: &MixerRenderRequest<'_>,
    ) -> Result<(), VendorError>;

    fn generate_csc_matrix(
        &self,
        procamp: &Procamp,
        standard: ColorStandard,
    ) -> Result<CscMatrix, VendorError>;

    /// Stable identity of the underlying device, carried by render pictures
    /// so the render thread can bind GL interop against the right device.
    fn device_id(&self) -> u64;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable in-memory vendor device for pipeline tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[derive(Default)]
    struct MockState {
        next_handle: u32,
        decoders: HashSet<u32>,
        video_surfaces: HashSet<u32>,
        output_surfaces: HashSet<u32>,
        mixers: HashSet<u32>,
        fail_mixer_create: bool,
        decode_errors: Vec<VendorErrorKind>,
        mixer_render_errors: u32,
        decode_calls: u32,
        mixer_render_calls: u32,
        feature_enables: Vec<(MixerFeature, bool)>,
        skip_chroma: Option<bool>,
    }

    /// Mock vendor device tracking every object it hands out.
    #[derive(Clone, Default)]
    pub struct MockVendor {
        state: Arc<Mutex<MockState>>,
    }

    impl MockVendor {
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next `create_mixer` call fail.
        pub fn fail_mixer_create(&self) {
            self.state.lock().fail_mixer_create = true;
        }

        /// Queues an error for upcoming `decoder_render` calls (FIFO).
        pub fn inject_decode_error(&self, kind: VendorErrorKind) {
            self.state.lock().decode_errors.push(kind);
        }

        /// Makes the next `n` mixer render calls fail.
        pub fn fail_mixer_renders(&self, n: u32) {
            self.state.lock().mixer_render_errors = n;
        }

        /// Number of vendor objects currently alive (leak check).
        pub fn alive_objects(&self) -> usize {
            let s = self.state.lock();
            s.decoders.len() + s.video_surfaces.len() + s.output_surfaces.len() + s.mixers.len()
        }

        pub fn decode_calls(&self) -> u32 {
            self.state.lock().decode_calls
        }

        pub fn mixer_render_calls(&self) -> u32 {
            self.state.lock().mixer_render_calls
        }

        /// Last enable state pushed for a mixer feature, if any.
        pub fn last_feature_enable(&self, feature: MixerFeature) -> Option<bool> {
            self.state
                .lock()
                .feature_enables
                .iter()
                .rev()
                .find(|(f, _)| *f == feature)
                .map(|(_, enabled)| *enabled)
        }

        /// Last skip-chroma-deinterlace attribute value, if any was set.
        pub fn skip_chroma_attr(&self) -> Option<bool> {
            self.state.lock().skip_chroma
        }

        fn alloc(state: &mut MockState) -> u32 {
            state.next_handle += 1;
            state.next_handle
        }
    }

    impl VendorDevice for MockVendor {
        fn query_caps(&self, _profile: CodecProfile) -> Result<DecoderCaps, VendorError> {
            Ok(DecoderCaps {
                supported: true,
                max_width: 4096,
                max_height: 4096,
                max_references: 16,
            })
        }

        fn supports(&self, _feature: MixerFeature) -> bool {
            true
        }

        fn create_decoder(
            &self,
            _profile: CodecProfile,
            _width: u32,
            _height: u32,
            _max_references: u32,
        ) -> Result<DecoderHandle, VendorError> {
            let mut s = self.state.lock();
            let h = Self::alloc(&mut s);
            s.decoders.insert(h);
            Ok(DecoderHandle(h))
        }

        fn destroy_decoder(&self, decoder: DecoderHandle) {
            self.state.lock().decoders.remove(&decoder.0);
        }

        fn decoder_render(
            &self,
            _decoder: DecoderHandle,
            _target: VideoSurfaceHandle,
            _unit: &[u8],
        ) -> Result<(), VendorError> {
            let mut s = self.state.lock();
            s.decode_calls += 1;
            if !s.decode_errors.is_empty() {
                let kind = s.decode_errors.remove(0);
                return Err(VendorError::new(kind, "decoder_render"));
            }
            Ok(())
        }

        fn create_video_surface(
            &self,
            _chroma: ChromaFormat,
            _width: u32,
            _height: u32,
        ) -> Result<VideoSurfaceHandle, VendorError> {
            let mut s = self.state.lock();
            let h = Self::alloc(&mut s);
            s.video_surfaces.insert(h);
            Ok(VideoSurfaceHandle(h))
        }

        fn destroy_video_surface(&self, surface: VideoSurfaceHandle) {
            self.state.lock().video_surfaces.remove(&surface.0);
        }

        fn create_output_surface(
            &self,
            _width: u32,
            _height: u32,
        ) -> Result<OutputSurfaceHandle, VendorError> {
            let mut s = self.state.lock();
            let h = Self::alloc(&mut s);
            s.output_surfaces.insert(h);
            Ok(OutputSurfaceHandle(h))
        }

        fn destroy_output_surface(&self, surface: OutputSurfaceHandle) {
            self.state.lock().output_surfaces.remove(&surface.0);
        }

        fn create_mixer(
            &self,
            _params: &MixerParams,
            _features: &[MixerFeature],
        ) -> Result<MixerHandle, VendorError> {
            let mut s = self.state.lock();
            if s.fail_mixer_create {
                s.fail_mixer_create = false;
                return Err(VendorError::new(VendorErrorKind::Failed, "create_mixer"));
            }
            let h = Self::alloc(&mut s);
            s.mixers.insert(h);
            Ok(MixerHandle(h))
        }

        fn destroy_mixer(&self, mixer: MixerHandle) {
            self.state.lock().mixers.remove(&mixer.0);
        }

        fn set_feature_enables(
            &self,
            _mixer: MixerHandle,
            features: &[(MixerFeature, bool)],
        ) -> Result<(), VendorError> {
            self.state.lock().feature_enables.extend_from_slice(features);
            Ok(())
        }

        fn set_attributes(
            &self,
            _mixer: MixerHandle,
            attributes: &[MixerAttribute],
        ) -> Result<(), VendorError> {
            let mut s = self.state.lock();
            for attr in attributes {
                if let MixerAttribute::SkipChromaDeinterlace(skip) = attr {
                    s.skip_chroma = Some(*skip);
                }
            }
            Ok(())
        }

        fn mixer_render(
            &self,
            _mixer: MixerHandle,
            _request: &MixerRenderRequest<'_>,
        ) -> Result<(), VendorError> {
            let mut s = self.state.lock();
            s.mixer_render_calls += 1;
            if s.mixer_render_errors > 0 {
                s.mixer_render_errors -= 1;
                return Err(VendorError::new(VendorErrorKind::Failed, "mixer_render"));
            }
            Ok(())
        }

        fn generate_csc_matrix(
            &self,
            _procamp: &Procamp,
            _standard: ColorStandard,
        ) -> Result<CscMatrix, VendorError> {
            Ok([[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]])
        }

        fn device_id(&self) -> u64 {
            1
        }
    }
}
