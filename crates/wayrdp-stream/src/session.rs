//! Session facade and submission worker
//!
//! [`VideoStream`] is the lifecycle owner: it wires the capture callbacks
//! into the pairer, runs the background submission worker, feeds RTT
//! updates through the rate controller and owns the shared graphics
//! channel server.
//!
//! One worker thread per session. The capture and transport threads only
//! enqueue work or update counters inside short critical sections; all
//! frame emission happens on the worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ironrdp_dvc::DvcMessage;
use thiserror::Error;
use tracing::{debug, warn};
use wayrdp_egfx::server::{AvcFrame, FrameFlow, GraphicsPipelineHandler, GraphicsPipelineServer};
use wayrdp_egfx::{CodecPreferences, PixelSize, SelectedCodec};

use crate::damage::shape_damage;
use crate::frame::{CaptureCapabilities, FrameMetadata, Packet, VideoFrame, VideoMonitor};
use crate::pairer::MetadataPairer;
use crate::policy::FramePolicy;
use crate::rate::{CongestionSample, RateController, DEFAULT_FRAME_RATE};

/// Hard cap on queued frames; the oldest are dropped on overflow.
const MAX_QUEUED_FRAMES: usize = 8;
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// Shared handle to the channel server, also registered with the DVC layer.
pub type GfxServerHandle = Arc<Mutex<GraphicsPipelineServer>>;

/// Receives drained channel messages for transmission.
pub trait GfxSink: Send {
    fn send_messages(&mut self, messages: Vec<DvcMessage>);
}

/// Transport-level bandwidth measurement, bracketing each frame emission.
pub trait NetworkDetection: Send {
    fn start_bandwidth_measure(&mut self);
    fn stop_bandwidth_measure(&mut self);
}

/// Control surface of the upstream capture source.
pub trait CaptureSourceControl: Send {
    /// Hints the source to use its software encoder on the next start.
    fn enable_software_fallback(&mut self);
    /// Restarts the capture stream.
    fn restart(&mut self);
}

/// Why the session gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// No advertised capability set supports H.264 streaming.
    VideoInitFailed,
    /// The capture encoder failed and no fallback remains.
    EncoderFailed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to spawn the frame submission thread")]
    SpawnWorker(#[from] std::io::Error),
}

/// Session construction parameters, fixed for the session's lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct VideoStreamConfig {
    pub codec_preferences: CodecPreferences,
    pub capture_capabilities: CaptureCapabilities,
}

/// Explicitly registered event callbacks, one per event.
///
/// Callbacks run on whichever thread raised the event (transport or
/// worker); keep them short and defer heavy work.
#[derive(Default)]
struct Callbacks {
    frame_rate_changed: Mutex<Option<Box<dyn Fn(u32) + Send>>>,
    closed: Mutex<Option<Box<dyn Fn() + Send>>>,
    error: Mutex<Option<Box<dyn Fn(CloseReason) + Send>>>,
}

impl Callbacks {
    fn emit_frame_rate_changed(&self, rate: u32) {
        if let Some(callback) = &*self.frame_rate_changed.lock().expect("callback registry poisoned") {
            callback(rate);
        }
    }

    fn emit_closed(&self) {
        if let Some(callback) = &*self.closed.lock().expect("callback registry poisoned") {
            callback();
        }
    }

    fn emit_error(&self, reason: CloseReason) {
        if let Some(callback) = &*self.error.lock().expect("callback registry poisoned") {
            callback(reason);
        }
    }
}

/// Maps channel events onto session state.
struct ChannelEvents {
    streaming: Arc<AtomicBool>,
    callbacks: Arc<Callbacks>,
}

impl GraphicsPipelineHandler for ChannelEvents {
    fn ready(&mut self, codec: SelectedCodec) {
        debug!(?codec, "Graphics channel ready, streaming enabled");
        self.streaming.store(true, Ordering::Relaxed);
    }

    fn initialization_failed(&mut self) {
        self.callbacks.emit_error(CloseReason::VideoInitFailed);
    }
}

#[derive(Debug, Default)]
struct FrameQueue {
    frames: VecDeque<VideoFrame>,
    stop: bool,
    last_drop_log: Option<Instant>,
}

struct SharedState {
    gfx: GfxServerHandle,
    flow: Arc<FrameFlow>,

    queue: Mutex<FrameQueue>,
    queue_condition: Condvar,

    enabled: AtomicBool,
    streaming: Arc<AtomicBool>,
    requested_frame_rate: AtomicU32,
    congestion_qp_bias: AtomicU8,
    dropped_frames: AtomicU64,

    sink: Mutex<Box<dyn GfxSink>>,
    network: Mutex<Box<dyn NetworkDetection>>,
    controller: Mutex<RateController>,
    callbacks: Arc<Callbacks>,
}

#[derive(Debug, Default)]
struct FallbackState {
    attempted: bool,
    retry_pending: bool,
}

/// The video streaming session.
pub struct VideoStream {
    shared: Arc<SharedState>,
    pairer: MetadataPairer,
    capabilities: CaptureCapabilities,
    source_control: Mutex<Box<dyn CaptureSourceControl>>,
    fallback: Mutex<FallbackState>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl VideoStream {
    pub fn new(
        config: VideoStreamConfig,
        sink: Box<dyn GfxSink>,
        network: Box<dyn NetworkDetection>,
        source_control: Box<dyn CaptureSourceControl>,
    ) -> Self {
        let callbacks = Arc::new(Callbacks::default());
        let streaming = Arc::new(AtomicBool::new(false));

        let handler = ChannelEvents {
            streaming: Arc::clone(&streaming),
            callbacks: Arc::clone(&callbacks),
        };
        let gfx = Arc::new(Mutex::new(GraphicsPipelineServer::new(
            Box::new(handler),
            config.codec_preferences,
        )));
        let flow = gfx.lock().expect("graphics server poisoned").frame_flow();

        Self {
            shared: Arc::new(SharedState {
                gfx,
                flow,
                queue: Mutex::new(FrameQueue::default()),
                queue_condition: Condvar::new(),
                enabled: AtomicBool::new(false),
                streaming,
                requested_frame_rate: AtomicU32::new(DEFAULT_FRAME_RATE),
                congestion_qp_bias: AtomicU8::new(0),
                dropped_frames: AtomicU64::new(0),
                sink: Mutex::new(sink),
                network: Mutex::new(network),
                controller: Mutex::new(RateController::new()),
                callbacks,
            }),
            pairer: MetadataPairer::new(config.capture_capabilities.frame_metadata),
            capabilities: config.capture_capabilities,
            source_control: Mutex::new(source_control),
            fallback: Mutex::new(FallbackState::default()),
            worker: Mutex::new(None),
        }
    }

    /// Starts the submission worker. Idempotent after success.
    pub fn initialize(&self) -> Result<(), SessionError> {
        let mut worker = self.worker.lock().expect("worker handle poisoned");
        if worker.is_some() {
            return Ok(());
        }

        self.capabilities.log_missing();

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("video-stream-submit".into())
            .spawn(move || submission_loop(&shared))?;
        *worker = Some(handle);

        debug!("Video stream initialized");
        Ok(())
    }

    /// Stops the worker and discards queued frames. In-flight emits finish.
    pub fn close(&self) {
        {
            let mut queue = self.shared.queue.lock().expect("frame queue poisoned");
            if queue.stop {
                return;
            }
            queue.stop = true;
            queue.frames.clear();
        }
        self.shared.queue_condition.notify_all();

        if let Some(worker) = self.worker.lock().expect("worker handle poisoned").take() {
            if worker.join().is_err() {
                warn!("Frame submission thread panicked");
            }
        }

        self.shared.streaming.store(false, Ordering::Relaxed);
        debug!("Video stream closed");
        self.shared.callbacks.emit_closed();
    }

    /// The shared channel server, for registration with the DVC layer.
    pub fn server_handle(&self) -> GfxServerHandle {
        Arc::clone(&self.shared.gfx)
    }

    /// Queues a frame for submission.
    ///
    /// Frames are accepted only while the channel is streaming and the
    /// session is enabled; the queue keeps at most the newest
    /// [`MAX_QUEUED_FRAMES`] frames.
    pub fn queue_frame(&self, frame: VideoFrame) {
        if !self.shared.streaming.load(Ordering::Relaxed) || !self.shared.enabled.load(Ordering::Relaxed) {
            return;
        }

        {
            let mut queue = self.shared.queue.lock().expect("frame queue poisoned");
            queue.frames.push_back(frame);

            let mut dropped = 0u64;
            while queue.frames.len() > MAX_QUEUED_FRAMES {
                queue.frames.pop_front();
                dropped += 1;
            }
            if dropped > 0 {
                self.shared.dropped_frames.fetch_add(dropped, Ordering::Relaxed);
                let now = Instant::now();
                if queue
                    .last_drop_log
                    .map_or(true, |last| now.duration_since(last) >= DROP_LOG_INTERVAL)
                {
                    debug!(dropped, "Frame queue over capacity, dropped oldest frames");
                    queue.last_drop_log = Some(now);
                }
            }
        }
        self.shared.queue_condition.notify_one();
    }

    pub fn enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Relaxed)
    }

    /// Toggles streaming; disabling purges the queue.
    pub fn set_enabled(&self, enabled: bool) {
        if self.shared.enabled.swap(enabled, Ordering::Relaxed) == enabled {
            return;
        }
        if !enabled {
            let mut queue = self.shared.queue.lock().expect("frame queue poisoned");
            queue.frames.clear();
        }
    }

    /// Schedules the graphics reset sequence before the next frame.
    pub fn reset(&self) {
        self.shared.gfx.lock().expect("graphics server poisoned").reset();
    }

    /// The frame rate the capture source should pace itself to.
    pub fn requested_frame_rate(&self) -> u32 {
        self.shared.requested_frame_rate.load(Ordering::Relaxed)
    }

    /// Frames dropped at the session boundary, for diagnostics.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn queued_frame_count(&self) -> usize {
        self.shared.queue.lock().expect("frame queue poisoned").frames.len()
    }

    // ------------------------------------------------------------------
    // Capture-source callbacks
    // ------------------------------------------------------------------

    /// New encoded packet from the capture source.
    pub fn handle_packet(&self, packet: Packet) {
        for frame in self.pairer.handle_packet(packet, Instant::now()) {
            self.queue_frame(frame);
        }
    }

    /// Per-frame metadata from the capture source.
    pub fn handle_frame_metadata(&self, metadata: FrameMetadata) {
        for frame in self.pairer.handle_metadata(metadata, Instant::now()) {
            self.queue_frame(frame);
        }
    }

    /// Frame size change from the capture source.
    pub fn handle_size_changed(&self, size: PixelSize) {
        self.pairer.set_frame_size(size);
    }

    pub fn set_monitor_layout(&self, monitors: Vec<VideoMonitor>) {
        self.pairer.set_monitor_layout(monitors);
    }

    /// Capture encoder failure. The first failure forces the software
    /// fallback and retries once the source reports idle; a repeat failure
    /// raises the session error event.
    pub fn handle_source_error(&self) {
        let mut fallback = self.fallback.lock().expect("fallback state poisoned");
        if fallback.attempted {
            warn!("Capture encoder failed and no additional fallback is available");
            self.shared.callbacks.emit_error(CloseReason::EncoderFailed);
            return;
        }

        fallback.attempted = true;
        fallback.retry_pending = true;
        warn!("Capture encoder failed, forcing software fallback");
        self.source_control
            .lock()
            .expect("source control poisoned")
            .enable_software_fallback();
    }

    /// The capture source became idle; completes a pending fallback retry.
    pub fn handle_source_idle(&self) {
        let mut fallback = self.fallback.lock().expect("fallback state poisoned");
        if !fallback.retry_pending || !self.shared.enabled.load(Ordering::Relaxed) {
            return;
        }
        fallback.retry_pending = false;

        debug!("Retrying capture stream with forced software encoder");
        self.pairer.clear();
        self.source_control.lock().expect("source control poisoned").restart();
    }

    // ------------------------------------------------------------------
    // Transport callbacks
    // ------------------------------------------------------------------

    /// RTT estimate change from the transport's network detection.
    pub fn handle_rtt_update(&self, rtt: Duration) {
        let sample = CongestionSample {
            delayed_frames: self.shared.flow.frame_delay(),
            queue_depth: self.shared.flow.decoder_queue_depth(),
        };

        let update = self
            .shared
            .controller
            .lock()
            .expect("rate controller poisoned")
            .handle_rtt_update(rtt, sample, Instant::now());

        self.shared
            .congestion_qp_bias
            .store(update.congestion_qp_bias, Ordering::Relaxed);

        if let Some(rate) = update.requested_frame_rate {
            self.shared.requested_frame_rate.store(rate, Ordering::Relaxed);
            self.shared.callbacks.emit_frame_rate_changed(rate);
        }
    }

    // ------------------------------------------------------------------
    // Event registration
    // ------------------------------------------------------------------

    pub fn set_on_requested_frame_rate_changed(&self, callback: impl Fn(u32) + Send + 'static) {
        *self
            .shared
            .callbacks
            .frame_rate_changed
            .lock()
            .expect("callback registry poisoned") = Some(Box::new(callback));
    }

    pub fn set_on_closed(&self, callback: impl Fn() + Send + 'static) {
        *self.shared.callbacks.closed.lock().expect("callback registry poisoned") = Some(Box::new(callback));
    }

    pub fn set_on_error(&self, callback: impl Fn(CloseReason) + Send + 'static) {
        *self.shared.callbacks.error.lock().expect("callback registry poisoned") = Some(Box::new(callback));
    }
}

impl Drop for VideoStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Takes the newest queued frame, discarding anything older.
fn take_newest(frames: &mut VecDeque<VideoFrame>) -> Option<(VideoFrame, usize)> {
    let frame = frames.pop_back()?;
    let stale = frames.len();
    frames.clear();
    Some((frame, stale))
}

fn submission_loop(shared: &SharedState) {
    let mut policy = FramePolicy::new();

    loop {
        let frame = {
            let queue = shared.queue.lock().expect("frame queue poisoned");
            let rate = shared.requested_frame_rate.load(Ordering::Relaxed).max(1);
            let frame_interval = Duration::from_millis(1_000 / u64::from(rate));

            let (mut queue, _) = shared
                .queue_condition
                .wait_timeout_while(queue, frame_interval, |queue| !queue.stop && queue.frames.is_empty())
                .expect("frame queue poisoned");

            if queue.stop {
                break;
            }
            let Some((frame, stale)) = take_newest(&mut queue.frames) else {
                continue;
            };
            if stale > 0 {
                shared.dropped_frames.fetch_add(stale as u64, Ordering::Relaxed);
                let now = Instant::now();
                if queue
                    .last_drop_log
                    .map_or(true, |last| now.duration_since(last) >= DROP_LOG_INTERVAL)
                {
                    debug!(stale, "Dropped stale frames before submission");
                    queue.last_drop_log = Some(now);
                }
            }
            frame
        };

        send_frame(shared, &mut policy, &frame);
    }
}

fn send_frame(shared: &SharedState, policy: &mut FramePolicy, frame: &VideoFrame) {
    if frame.data.is_empty() {
        return;
    }

    let shaped = shape_damage(&frame.damage, frame.size, frame.is_key_frame);
    if shaped.is_empty() {
        return;
    }

    let plan = policy.plan(
        frame,
        &shaped,
        shared.flow.frame_delay(),
        shared.congestion_qp_bias.load(Ordering::Relaxed),
        Instant::now(),
    );

    let mut network = shared.network.lock().expect("network detection poisoned");
    network.start_bandwidth_measure();

    let messages = {
        let mut gfx = shared.gfx.lock().expect("graphics server poisoned");
        match gfx.submit_frame(AvcFrame {
            data: &frame.data,
            size: frame.size,
            rectangles: &plan.rectangles,
            quant_quality: &plan.quant_quality,
        }) {
            Some(_) => gfx.drain_output(),
            None => Vec::new(),
        }
    };

    if !messages.is_empty() {
        shared.sink.lock().expect("message sink poisoned").send_messages(messages);
    }

    network.stop_bandwidth_measure();
}

#[cfg(test)]
mod tests {
    use ironrdp_core::{Encode, WriteCursor};
    use ironrdp_dvc::DvcProcessor as _;
    use wayrdp_egfx::pdu::{CapabilitiesAdvertisePdu, CapabilitySet, GfxCapsFlags, GfxPdu, CAPVERSION_81};

    use super::*;
    use crate::frame::Rect;

    #[derive(Default)]
    struct SinkState {
        batches: Mutex<Vec<usize>>,
    }

    struct TestSink(Arc<SinkState>);

    impl GfxSink for TestSink {
        fn send_messages(&mut self, messages: Vec<DvcMessage>) {
            self.0.batches.lock().unwrap().push(messages.len());
        }
    }

    #[derive(Default)]
    struct NetworkState {
        starts: AtomicU32,
        stops: AtomicU32,
    }

    struct TestNetwork(Arc<NetworkState>);

    impl NetworkDetection for TestNetwork {
        fn start_bandwidth_measure(&mut self) {
            self.0.starts.fetch_add(1, Ordering::Relaxed);
        }

        fn stop_bandwidth_measure(&mut self) {
            self.0.stops.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[derive(Default)]
    struct SourceState {
        fallbacks: AtomicU32,
        restarts: AtomicU32,
    }

    struct TestSource(Arc<SourceState>);

    impl CaptureSourceControl for TestSource {
        fn enable_software_fallback(&mut self) {
            self.0.fallbacks.fetch_add(1, Ordering::Relaxed);
        }

        fn restart(&mut self) {
            self.0.restarts.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct Harness {
        stream: VideoStream,
        sink: Arc<SinkState>,
        network: Arc<NetworkState>,
        source: Arc<SourceState>,
    }

    fn harness() -> Harness {
        let sink = Arc::new(SinkState::default());
        let network = Arc::new(NetworkState::default());
        let source = Arc::new(SourceState::default());

        let stream = VideoStream::new(
            VideoStreamConfig::default(),
            Box::new(TestSink(Arc::clone(&sink))),
            Box::new(TestNetwork(Arc::clone(&network))),
            Box::new(TestSource(Arc::clone(&source))),
        );

        Harness {
            stream,
            sink,
            network,
            source,
        }
    }

    fn advertise_avc420(stream: &VideoStream) {
        let pdu = GfxPdu::CapabilitiesAdvertise(CapabilitiesAdvertisePdu(vec![CapabilitySet::new(
            CAPVERSION_81,
            GfxCapsFlags::AVC420_ENABLED,
        )]));
        let mut payload = vec![0u8; pdu.size()];
        let mut cursor = WriteCursor::new(&mut payload);
        pdu.encode(&mut cursor).unwrap();

        let handle = stream.server_handle();
        let mut gfx = handle.lock().unwrap();
        gfx.process(0, &payload).unwrap();
    }

    fn test_frame() -> VideoFrame {
        VideoFrame {
            data: vec![0x42; 32],
            size: PixelSize::new(1280, 720),
            is_key_frame: true,
            damage: Vec::new(),
            presentation_timestamp: None,
            monitors: Vec::new(),
        }
    }

    #[test]
    fn worker_emits_queued_frame_to_sink() {
        let harness = harness();
        advertise_avc420(&harness.stream);
        harness.stream.initialize().unwrap();
        harness.stream.set_enabled(true);

        harness.stream.queue_frame(test_frame());

        let deadline = Instant::now() + Duration::from_secs(2);
        while harness.sink.batches.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        harness.stream.close();

        let batches = harness.sink.batches.lock().unwrap();
        // Reset sequence plus StartFrame / WireToSurface1 / EndFrame.
        assert_eq!(batches.as_slice(), &[6]);

        let starts = harness.network.starts.load(Ordering::Relaxed);
        assert_eq!(starts, 1);
        assert_eq!(harness.network.stops.load(Ordering::Relaxed), starts);
    }

    #[test]
    fn frames_rejected_until_streaming_and_enabled() {
        let harness = harness();

        // Channel not negotiated yet.
        harness.stream.queue_frame(test_frame());
        assert_eq!(harness.stream.queued_frame_count(), 0);

        // Negotiated but disabled.
        advertise_avc420(&harness.stream);
        harness.stream.queue_frame(test_frame());
        assert_eq!(harness.stream.queued_frame_count(), 0);

        harness.stream.set_enabled(true);
        harness.stream.queue_frame(test_frame());
        assert_eq!(harness.stream.queued_frame_count(), 1);
    }

    #[test]
    fn queue_is_capped_with_drop_oldest() {
        let harness = harness();
        advertise_avc420(&harness.stream);
        harness.stream.set_enabled(true);

        for _ in 0..12 {
            harness.stream.queue_frame(test_frame());
        }

        assert_eq!(harness.stream.queued_frame_count(), MAX_QUEUED_FRAMES);
        assert_eq!(harness.stream.dropped_frames(), 4);
    }

    #[test]
    fn disabling_purges_the_queue() {
        let harness = harness();
        advertise_avc420(&harness.stream);
        harness.stream.set_enabled(true);

        for _ in 0..3 {
            harness.stream.queue_frame(test_frame());
        }
        assert_eq!(harness.stream.queued_frame_count(), 3);

        harness.stream.set_enabled(false);
        assert_eq!(harness.stream.queued_frame_count(), 0);
    }

    #[test]
    fn take_newest_discards_stale_frames() {
        let mut frames: VecDeque<VideoFrame> = VecDeque::new();
        for i in 0..4u8 {
            let mut frame = test_frame();
            frame.data = vec![i];
            frames.push_back(frame);
        }

        let (frame, stale) = take_newest(&mut frames).unwrap();
        assert_eq!(frame.data, vec![3]);
        assert_eq!(stale, 3);
        assert!(frames.is_empty());

        assert!(take_newest(&mut frames).is_none());
    }

    #[test]
    fn rtt_updates_adjust_requested_rate_and_notify() {
        let harness = harness();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let observed_clone = Arc::clone(&observed);
        harness
            .stream
            .set_on_requested_frame_rate_changed(move |rate| observed_clone.lock().unwrap().push(rate));

        assert_eq!(harness.stream.requested_frame_rate(), 60);
        harness.stream.handle_rtt_update(Duration::from_millis(10));

        assert_eq!(harness.stream.requested_frame_rate(), 62);
        assert_eq!(observed.lock().unwrap().as_slice(), &[62]);
    }

    #[test]
    fn capture_callbacks_feed_the_queue() {
        let harness = harness();
        advertise_avc420(&harness.stream);
        harness.stream.set_enabled(true);
        harness.stream.handle_size_changed(PixelSize::new(1280, 720));

        harness.stream.handle_packet(Packet {
            data: vec![1, 2, 3],
            is_key_frame: true,
        });

        assert_eq!(harness.stream.queued_frame_count(), 1);
    }

    #[test]
    fn metadata_pairs_with_packets_through_the_facade() {
        let harness = harness();
        advertise_avc420(&harness.stream);
        harness.stream.set_enabled(true);
        harness.stream.handle_size_changed(PixelSize::new(1280, 720));

        harness.stream.handle_frame_metadata(FrameMetadata {
            size: Some(PixelSize::new(1280, 720)),
            damage: Some(vec![Rect::new(0, 0, 16, 16)]),
            presentation_timestamp: None,
        });
        assert_eq!(harness.stream.queued_frame_count(), 0);

        harness.stream.handle_packet(Packet {
            data: vec![9],
            is_key_frame: false,
        });
        assert_eq!(harness.stream.queued_frame_count(), 1);
    }

    #[test]
    fn software_fallback_fires_once_then_errors() {
        let harness = harness();
        harness.stream.set_enabled(true);

        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors_clone = Arc::clone(&errors);
        harness.stream.set_on_error(move |reason| errors_clone.lock().unwrap().push(reason));

        harness.stream.handle_source_error();
        assert_eq!(harness.source.fallbacks.load(Ordering::Relaxed), 1);
        assert!(errors.lock().unwrap().is_empty());

        harness.stream.handle_source_idle();
        assert_eq!(harness.source.restarts.load(Ordering::Relaxed), 1);

        // Idle again without a pending retry: no second restart.
        harness.stream.handle_source_idle();
        assert_eq!(harness.source.restarts.load(Ordering::Relaxed), 1);

        harness.stream.handle_source_error();
        assert_eq!(errors.lock().unwrap().as_slice(), &[CloseReason::EncoderFailed]);
    }

    #[test]
    fn failed_negotiation_raises_video_init_error() {
        let harness = harness();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors_clone = Arc::clone(&errors);
        harness.stream.set_on_error(move |reason| errors_clone.lock().unwrap().push(reason));

        let pdu = GfxPdu::CapabilitiesAdvertise(CapabilitiesAdvertisePdu(vec![CapabilitySet::new(
            wayrdp_egfx::pdu::CAPVERSION_8,
            GfxCapsFlags::empty(),
        )]));
        let mut payload = vec![0u8; pdu.size()];
        let mut cursor = WriteCursor::new(&mut payload);
        pdu.encode(&mut cursor).unwrap();

        let handle = harness.stream.server_handle();
        assert!(handle.lock().unwrap().process(0, &payload).is_err());

        assert_eq!(errors.lock().unwrap().as_slice(), &[CloseReason::VideoInitFailed]);
        harness.stream.queue_frame(test_frame());
        assert_eq!(harness.stream.queued_frame_count(), 0);
    }

    #[test]
    fn close_is_idempotent_and_emits_once() {
        let harness = harness();
        let closed = Arc::new(AtomicU32::new(0));
        let closed_clone = Arc::clone(&closed);
        harness.stream.set_on_closed(move || {
            closed_clone.fetch_add(1, Ordering::Relaxed);
        });

        harness.stream.initialize().unwrap();
        harness.stream.close();
        harness.stream.close();

        assert_eq!(closed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn initialize_is_idempotent() {
        let harness = harness();
        harness.stream.initialize().unwrap();
        harness.stream.initialize().unwrap();
        harness.stream.close();
    }
}
