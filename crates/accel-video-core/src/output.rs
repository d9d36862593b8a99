//! Output actor: owns output surfaces and the render-picture window.
//!
//! Decoded pictures arriving from the front door are forwarded to the
//! mixer actor; processed pictures coming back are wrapped in
//! [`RenderPicture`] handles and pushed to the consumer, at most
//! `num_render_buffers` in flight. Returned pictures recycle their
//! surfaces: passthrough pictures free the video surface, mixed pictures
//! donate their output surface back to the mixer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{never, select, unbounded, Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::mailbox::{
    request, ControlReply, MixerData, OutputControl, OutputData, OutputEvent,
};
use crate::mixer::Mixer;
use crate::picture::{ProcessedPicture, RenderPicture, SessionConfig};
use crate::vendor::{OutputSurfaceHandle, VendorDevice};

/// Output surfaces created up front; the pool grows on demand up to
/// `num_render_buffers` once mixing is active.
const INITIAL_OUTPUT_SURFACES: usize = 4;

/// Consecutive vendor failures tolerated before the session is declared
/// broken.
const MAX_VENDOR_ERRORS: u32 = 3;

const TICK: Duration = Duration::from_millis(100);

/// Front handle to the output actor.
pub struct Output {
    control_tx: Sender<OutputControl>,
    data_tx: Sender<OutputData>,
    picture_rx: Receiver<RenderPicture>,
    event_rx: Receiver<OutputEvent>,
    join: Option<JoinHandle<()>>,
}

impl Output {
    pub fn start(vendor: Arc<dyn VendorDevice>) -> Self {
        let (control_tx, control_rx) = unbounded();
        let (data_tx, data_rx) = unbounded();
        let (picture_tx, picture_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let thread_data_tx = data_tx.clone();
        let join = thread::Builder::new()
            .name("video-output".into())
            .spawn(move || {
                OutputThread::new(vendor, control_rx, data_rx, thread_data_tx, picture_tx, event_tx)
                    .run();
            })
            .ok();
        Self {
            control_tx,
            data_tx,
            picture_rx,
            event_rx,
            join,
        }
    }

    pub fn init(&self, config: SessionConfig, timeout: Duration) -> ControlReply {
        request(
            &self.control_tx,
            |reply| OutputControl::Init { config, reply },
            timeout,
        )
    }

    pub fn flush(&self, timeout: Duration) -> ControlReply {
        request(&self.control_tx, |reply| OutputControl::Flush { reply }, timeout)
    }

    pub fn precleanup(&self, timeout: Duration) -> ControlReply {
        request(
            &self.control_tx,
            |reply| OutputControl::Precleanup { reply },
            timeout,
        )
    }

    pub fn data_sender(&self) -> Sender<OutputData> {
        self.data_tx.clone()
    }

    pub fn pictures(&self) -> &Receiver<RenderPicture> {
        &self.picture_rx
    }

    pub fn events(&self) -> &Receiver<OutputEvent> {
        &self.event_rx
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        let _ = self.control_tx.send(OutputControl::Stop);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

struct OutputThread {
    vendor: Arc<dyn VendorDevice>,
    control_rx: Receiver<OutputControl>,
    data_rx: Receiver<OutputData>,
    /// Clone of our own data channel, embedded in render pictures so
    /// their drop can message us.
    data_tx: Sender<OutputData>,
    picture_tx: Sender<RenderPicture>,
    event_tx: Sender<OutputEvent>,
    config: Option<SessionConfig>,
    mixer: Option<Mixer>,
    /// Every output surface this actor created and still owns.
    surfaces: Vec<OutputSurfaceHandle>,
    /// Processed pictures waiting for a free slot in the render window.
    ready: VecDeque<ProcessedPicture>,
    /// Pictures currently held by the consumer, keyed by id.
    away: Vec<ProcessedPicture>,
    next_id: u64,
    vendor_errors: u32,
}

impl OutputThread {
    fn new(
        vendor: Arc<dyn VendorDevice>,
        control_rx: Receiver<OutputControl>,
        data_rx: Receiver<OutputData>,
        data_tx: Sender<OutputData>,
        picture_tx: Sender<RenderPicture>,
        event_tx: Sender<OutputEvent>,
    ) -> Self {
        Self {
            vendor,
            control_rx,
            data_rx,
            data_tx,
            picture_tx,
            event_tx,
            config: None,
            mixer: None,
            surfaces: Vec::new(),
            ready: VecDeque::new(),
            away: Vec::new(),
            next_id: 1,
            vendor_errors: 0,
        }
    }

    fn run(mut self) {
        debug!("output thread started");
        let never_rx = never();
        loop {
            let mixer_rx = self
                .mixer
                .as_ref()
                .map(|m| m.pictures().clone())
                .unwrap_or_else(|| never_rx.clone());
            select! {
                recv(self.control_rx) -> msg => match msg {
                    Ok(OutputControl::Init { config, reply }) => {
                        let ok = self.init_session(config);
                        let _ = reply.send(if ok { ControlReply::Accepted } else { ControlReply::Error });
                    }
                    Ok(OutputControl::Flush { reply }) => {
                        self.flush();
                        let _ = reply.send(ControlReply::Accepted);
                    }
                    Ok(OutputControl::Precleanup { reply }) => {
                        self.precleanup();
                        let _ = reply.send(ControlReply::Accepted);
                    }
                    Ok(OutputControl::Stop) | Err(_) => break,
                },
                recv(self.data_rx) -> msg => match msg {
                    Ok(OutputData::NewFrame(pic)) => {
                        self.ensure_buffer_pool(INITIAL_OUTPUT_SURFACES);
                        if let Some(mixer) = &self.mixer {
                            let _ = mixer.data_sender().send(MixerData::Frame(pic));
                        }
                    }
                    Ok(OutputData::ReturnPic { id, epoch }) => self.return_picture(id, epoch),
                    Err(_) => break,
                },
                recv(mixer_rx) -> msg => {
                    if let Ok(pic) = msg {
                        self.ready.push_back(pic);
                    }
                },
                default(TICK) => {}
            }
            self.pump();
        }
        self.uninit_session();
        debug!("output thread stopped");
    }

    fn init_session(&mut self, config: SessionConfig) -> bool {
        self.uninit_session();
        let mixer = Mixer::start(self.vendor.clone());
        if mixer.init(config.clone(), Duration::from_secs(2)) != ControlReply::Accepted {
            warn!("mixer init failed");
            return false;
        }
        self.mixer = Some(mixer);
        self.config = Some(config);
        self.vendor_errors = 0;
        if !self.ensure_buffer_pool(INITIAL_OUTPUT_SURFACES) {
            self.uninit_session();
            return false;
        }
        true
    }

    fn uninit_session(&mut self) {
        // Joining the mixer first guarantees nobody renders into the
        // surfaces we are about to destroy.
        self.mixer = None;
        for surface in self.surfaces.drain(..) {
            self.vendor.destroy_output_surface(surface);
        }
        self.ready.clear();
        self.away.clear();
        self.config = None;
    }

    /// Grows the output surface pool to `target`, donating new surfaces
    /// to the mixer. Returns false once vendor failures exceed the limit.
    fn ensure_buffer_pool(&mut self, target: usize) -> bool {
        let Some(config) = &self.config else {
            return false;
        };
        let target = target.min(config.num_render_buffers);
        while self.surfaces.len() < target {
            match self
                .vendor
                .create_output_surface(config.out_width, config.out_height)
            {
                Ok(surface) => {
                    self.vendor_errors = 0;
                    self.surfaces.push(surface);
                    if let Some(mixer) = &self.mixer {
                        let _ = mixer.data_sender().send(MixerData::Buffer(surface));
                    }
                }
                Err(err) => {
                    warn!(%err, "output surface creation failed");
                    self.vendor_errors += 1;
                    if self.vendor_errors >= MAX_VENDOR_ERRORS {
                        let _ = self.event_tx.send(OutputEvent::Error);
                    }
                    return false;
                }
            }
        }
        true
    }

    /// Hands ready pictures to the consumer while the window has room.
    fn pump(&mut self) {
        let Some(config) = self.config.clone() else {
            return;
        };
        while self.away.len() < config.num_render_buffers {
            let Some(mut pic) = self.ready.pop_front() else {
                break;
            };
            if !pic.is_passthrough() {
                self.ensure_buffer_pool(config.num_render_buffers);
            }
            pic.id = self.next_id;
            self.next_id += 1;
            config.stats.inc_rendered();
            config.stats.dec_processed();
            let handle = RenderPicture::new(
                pic.clone(),
                config.session_epoch,
                self.vendor.device_id(),
                self.data_tx.clone(),
            );
            trace!(id = pic.id, "picture handed to consumer");
            self.away.push(pic);
            if self.picture_tx.send(handle).is_err() {
                return;
            }
        }
    }

    fn return_picture(&mut self, id: u64, epoch: u64) {
        let Some(config) = &self.config else {
            return;
        };
        let Some(idx) = self.away.iter().position(|p| p.id == id) else {
            trace!(id, "return for unknown picture ignored");
            return;
        };
        let pic = self.away.swap_remove(idx);
        config.stats.dec_rendered();
        if epoch != config.session_epoch {
            return;
        }
        if let Some(out) = pic.output_surface {
            if let Some(mixer) = &self.mixer {
                let _ = mixer.data_sender().send(MixerData::Buffer(out));
            }
        } else if config.pool.is_valid(pic.video_surface) {
            config.pool.clear_render(pic.video_surface);
        } else {
            // Surface belonged to a pool that has since been torn down.
            trace!(id, "returned surface no longer pooled");
        }
    }

    /// Discards all queued pictures; pictures held by the consumer stay
    /// out and come back through the normal return path.
    fn flush(&mut self) {
        let Some(config) = self.config.clone() else {
            return;
        };
        if let Some(mixer) = &self.mixer {
            if mixer.flush(Duration::from_secs(1)) != ControlReply::Accepted {
                warn!("mixer flush timed out");
            }
        }
        let mixer_pics: Vec<ProcessedPicture> = self
            .mixer
            .as_ref()
            .map(|m| m.pictures().try_iter().collect())
            .unwrap_or_default();
        for pic in mixer_pics.into_iter().chain(self.ready.drain(..)) {
            config.stats.dec_processed();
            if let Some(out) = pic.output_surface {
                if let Some(mixer) = &self.mixer {
                    let _ = mixer.data_sender().send(MixerData::Buffer(out));
                }
            } else {
                config.pool.clear_render(pic.video_surface);
            }
        }
        while let Ok(msg) = self.data_rx.try_recv() {
            match msg {
                OutputData::NewFrame(pic) => {
                    if !pic.eof {
                        config.pool.clear_render(pic.surface);
                    }
                    config.stats.dec_decoded();
                }
                OutputData::ReturnPic { id, epoch } => self.return_picture(id, epoch),
            }
        }
    }

    /// Releases GPU memory while playback is stopped: everything except
    /// the surfaces still pinned by pictures the consumer holds.
    fn precleanup(&mut self) {
        self.flush();
        let reclaimed = self
            .mixer
            .as_ref()
            .map(|m| m.reclaim_buffers(Duration::from_secs(1)))
            .unwrap_or_default();
        let in_use: Vec<OutputSurfaceHandle> =
            self.away.iter().filter_map(|p| p.output_surface).collect();
        self.surfaces.retain(|surface| {
            if in_use.contains(surface) {
                return true;
            }
            // Only destroy what the mixer actually gave back; anything
            // else may still be referenced by an in-flight render.
            if reclaimed.contains(surface) {
                self.vendor.destroy_output_surface(*surface);
                false
            } else {
                true
            }
        });
        debug!(kept = self.surfaces.len(), "output precleanup done");
    }
}
