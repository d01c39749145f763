use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbaImage;

use crate::editor::{InteractionMode, PointEditor};
use crate::error::{WarpError, WarpResult};
use crate::geometry::{Point, Quad};
use crate::processing::gpu_pipeline::{self, GpuWarpPipeline};
use crate::processing::pool::{DEFAULT_POOL_SIZE, PendingWarp, WarpDispatcher};
use crate::state::{RequestId, ResultSizePolicy, ResultSpec, SourceImage, WarpRequest};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(120);
const NOTICE_TTL: Duration = Duration::from_secs(4);

type PipelineFactory = fn(&SourceImage, ResultSpec) -> WarpResult<GpuWarpPipeline>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PreviewBackend {
    Cpu,
    Gpu,
    /// GPU when an adapter exists, CPU workers otherwise.
    #[default]
    Auto,
}

impl PreviewBackend {
    pub const ALL: [PreviewBackend; 3] =
        [PreviewBackend::Auto, PreviewBackend::Gpu, PreviewBackend::Cpu];

    pub fn label(self) -> &'static str {
        match self {
            PreviewBackend::Cpu => "CPU workers",
            PreviewBackend::Gpu => "GPU",
            PreviewBackend::Auto => "Auto",
        }
    }

    fn wants_gpu(self) -> bool {
        matches!(self, PreviewBackend::Gpu | PreviewBackend::Auto)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SessionSettings {
    pub backend: PreviewBackend,
    pub mode: InteractionMode,
    pub size_policy: ResultSizePolicy,
    pub worker_count: usize,
    pub debounce: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            backend: PreviewBackend::default(),
            mode: InteractionMode::default(),
            size_policy: ResultSizePolicy::default(),
            worker_count: DEFAULT_POOL_SIZE,
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// Quiet-period gate for GPU redraws.
#[derive(Clone, Copy, Debug)]
pub struct Debounce {
    quiet: Duration,
    last_change: Option<Instant>,
}

impl Debounce {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            last_change: None,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_change = Some(now);
    }

    pub fn clear(&mut self) {
        self.last_change = None;
    }

    pub fn settled(&self, now: Instant) -> bool {
        self.remaining(now).is_none()
    }

    /// Time left until the quiet period is over, `None` once it is.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let since = now.saturating_duration_since(self.last_change?);
        (since < self.quiet).then(|| self.quiet - since)
    }
}

struct Notice {
    message: String,
    at: Instant,
}

/// Cooperative coordinator between the editor, the render backends and the UI.
///
/// The UI calls [`tick`](Self::tick) once per frame. On the CPU path a quad
/// change becomes one dispatcher request and only the response carrying the
/// latest request id is applied. On the GPU path the draw happens inline once
/// the debounce quiet period has passed. Failures keep the previous result and
/// raise a transient notice.
pub struct RenderSession {
    settings: SessionSettings,
    source: Option<Arc<SourceImage>>,
    editor: PointEditor,
    result: ResultSpec,
    notifier: Option<Arc<dyn Fn() + Send + Sync>>,
    dispatcher: Option<WarpDispatcher>,
    gpu: Option<GpuWarpPipeline>,
    gpu_factory: PipelineFactory,
    gpu_blocked: bool,
    /// Set once the user has been told a requested GPU is missing.
    gpu_missing_reported: bool,
    next_id: u64,
    latest: Option<RequestId>,
    in_flight: Vec<PendingWarp>,
    dirty: bool,
    debounce: Debounce,
    last_result: Option<RgbaImage>,
    revision: u64,
    notice: Option<Notice>,
}

impl RenderSession {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            source: None,
            editor: PointEditor::new(Quad::default(), settings.mode),
            result: ResultSpec::default(),
            notifier: None,
            dispatcher: None,
            gpu: None,
            gpu_factory: GpuWarpPipeline::new,
            gpu_blocked: false,
            gpu_missing_reported: false,
            next_id: 1,
            latest: None,
            in_flight: Vec::new(),
            dirty: false,
            debounce: Debounce::new(settings.debounce),
            last_result: None,
            revision: 0,
            notice: None,
        }
    }

    #[cfg(test)]
    fn with_gpu_factory(mut self, factory: PipelineFactory) -> Self {
        self.gpu_factory = factory;
        self
    }

    /// Called from worker threads whenever a CPU response is routed; the UI
    /// uses it to schedule a repaint.
    pub fn set_notifier(&mut self, notify: impl Fn() + Send + Sync + 'static) {
        self.notifier = Some(Arc::new(notify));
    }

    pub fn source(&self) -> Option<&Arc<SourceImage>> {
        self.source.as_ref()
    }

    /// Publishes a new source. The quad resets to the centred default and the
    /// result size follows the size policy.
    pub fn set_source(&mut self, source: SourceImage) {
        let (w, h) = (source.width(), source.height());
        self.editor.reset(Quad::centered(w, h));
        self.result = self.settings.size_policy.resolve(w, h);
        self.source = Some(Arc::new(source));
        self.gpu = None;
        self.gpu_blocked = false;
        self.latest = None;
        // Old jobs finish on the workers and still count against the cap.
        self.in_flight.clear();
        self.last_result = None;
        self.revision += 1;
        self.debounce.clear();
        self.dirty = true;
        tracing::info!(
            width = w,
            height = h,
            out_w = self.result.width,
            out_h = self.result.height,
            "source published"
        );
    }

    pub fn quad(&self) -> Quad {
        self.editor.quad()
    }

    pub fn editor(&self) -> &PointEditor {
        &self.editor
    }

    pub fn result_spec(&self) -> ResultSpec {
        self.result
    }

    pub fn set_result_spec(&mut self, result: ResultSpec) {
        if self.result != result {
            self.result = result;
            self.mark_dirty(Instant::now());
        }
    }

    pub fn backend(&self) -> PreviewBackend {
        self.settings.backend
    }

    pub fn set_backend(&mut self, backend: PreviewBackend) {
        if self.settings.backend != backend {
            self.settings.backend = backend;
            self.gpu = None;
            self.gpu_blocked = false;
            self.gpu_missing_reported = false;
            self.debounce.clear();
            self.dirty = self.source.is_some();
        }
    }

    /// Whether draws currently go through the GPU pipeline.
    pub fn gpu_active(&self) -> bool {
        self.settings.backend.wants_gpu() && !self.gpu_blocked && gpu_pipeline::is_available()
    }

    pub fn set_mode(&mut self, mode: InteractionMode) {
        self.settings.mode = mode;
        self.editor.set_mode(mode);
    }

    pub fn pointer_down(&mut self, at: Point) {
        if self.source.is_none() {
            return;
        }
        if self.editor.pointer_down(at).is_some() {
            self.mark_dirty(Instant::now());
        }
    }

    pub fn pointer_move(&mut self, at: Point) {
        if self.editor.pointer_move(at).is_some() {
            self.mark_dirty(Instant::now());
        }
    }

    pub fn pointer_up(&mut self) {
        self.editor.pointer_up();
    }

    fn mark_dirty(&mut self, now: Instant) {
        self.dirty = self.source.is_some();
        self.debounce.touch(now);
    }

    /// Latest successfully rendered result.
    pub fn last_result(&self) -> Option<&RgbaImage> {
        self.last_result.as_ref()
    }

    /// Bumped whenever `last_result` changes.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn busy(&self) -> bool {
        !self.in_flight.is_empty() || self.dirty
    }

    pub fn notice(&self, now: Instant) -> Option<&str> {
        self.notice
            .as_ref()
            .filter(|n| now.saturating_duration_since(n.at) < NOTICE_TTL)
            .map(|n| n.message.as_str())
    }

    /// How long the caller may sleep before the next tick has work to do.
    pub fn next_wake(&self, now: Instant) -> Option<Duration> {
        if self.dirty && self.gpu_active() {
            return self.debounce.remaining(now);
        }
        None
    }

    /// Everything needed to render the current selection off-thread.
    pub fn snapshot(&self) -> Option<(Arc<SourceImage>, Quad, ResultSpec)> {
        self.source
            .as_ref()
            .map(|source| (Arc::clone(source), self.editor.quad(), self.result))
    }

    /// Applies finished work and starts new work. Returns `true` when
    /// `last_result` changed.
    pub fn tick(&mut self, now: Instant) -> bool {
        let mut applied = self.collect(now);
        if self.dirty {
            applied |= self.dispatch(now);
        }
        applied
    }

    fn collect(&mut self, now: Instant) -> bool {
        let mut applied = false;
        let mut still_running = Vec::with_capacity(self.in_flight.len());
        for pending in self.in_flight.drain(..) {
            let Some(outcome) = pending.try_take() else {
                still_running.push(pending);
                continue;
            };
            if Some(pending.id()) != self.latest {
                tracing::debug!(id = %pending.id(), "discarding stale warp response");
                continue;
            }
            match outcome {
                Ok(response) => {
                    self.last_result = Some(response.image);
                    self.revision += 1;
                    applied = true;
                }
                Err(err) => {
                    tracing::warn!("cpu warp failed: {err}");
                    self.notice = Some(Notice {
                        message: format!("Render failed: {err}"),
                        at: now,
                    });
                }
            }
        }
        self.in_flight = still_running;
        applied
    }

    fn dispatch(&mut self, now: Instant) -> bool {
        if self.gpu_active() {
            if !self.debounce.settled(now) {
                return false;
            }
            match self.render_gpu() {
                Ok(image) => {
                    self.dirty = false;
                    // Anything still queued on the CPU side is now stale.
                    self.latest = None;
                    self.last_result = Some(image);
                    self.revision += 1;
                    return true;
                }
                Err(err) => {
                    tracing::warn!("gpu warp failed, switching to cpu workers: {err}");
                    self.gpu = None;
                    self.gpu_blocked = true;
                    if self.settings.backend == PreviewBackend::Gpu {
                        self.notice = Some(Notice {
                            message: format!("GPU render failed, using CPU workers: {err}"),
                            at: now,
                        });
                    }
                }
            }
        } else if self.settings.backend == PreviewBackend::Gpu
            && !self.gpu_blocked
            && !self.gpu_missing_reported
        {
            self.gpu_missing_reported = true;
            self.notice = Some(Notice {
                message: "No GPU adapter found, using CPU workers".to_string(),
                at: now,
            });
        }
        self.submit_cpu(now);
        false
    }

    fn render_gpu(&mut self) -> WarpResult<RgbaImage> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| WarpError::image("no source published"))?;
        let quad = self.editor.quad();
        let stale = self
            .gpu
            .as_ref()
            .is_none_or(|gpu| !gpu.matches(source, self.result));
        if stale {
            // Old resources go before the new ones are allocated.
            self.gpu = None;
            self.gpu = Some((self.gpu_factory)(source, self.result)?);
        }
        match self.gpu.as_mut() {
            Some(gpu) => gpu.render(&quad),
            None => Err(WarpError::GpuUnavailable),
        }
    }

    fn submit_cpu(&mut self, now: Instant) {
        let Some(source) = self.source.clone() else {
            self.dirty = false;
            return;
        };
        if self.dispatcher.is_none() {
            let built = match self.notifier.clone() {
                Some(notify) => {
                    WarpDispatcher::with_notifier(self.settings.worker_count, move || notify())
                }
                None => WarpDispatcher::new(self.settings.worker_count),
            };
            match built {
                Ok(dispatcher) => self.dispatcher = Some(dispatcher),
                Err(err) => {
                    tracing::error!("failed to start warp workers: {err}");
                    self.notice = Some(Notice {
                        message: format!("Render failed: {err}"),
                        at: now,
                    });
                    self.dirty = false;
                    return;
                }
            }
        }
        let Some(dispatcher) = self.dispatcher.as_ref() else {
            return;
        };
        // Leave the change pending while every worker already has a job,
        // including jobs for a source that has since been replaced.
        if dispatcher.in_flight() >= dispatcher.size() {
            return;
        }

        let id = RequestId(self.next_id);
        self.next_id += 1;
        let request = WarpRequest {
            id,
            quad: self.editor.quad(),
            result: self.result,
            source,
        };
        match dispatcher.submit(request) {
            Ok(pending) => {
                self.latest = Some(id);
                self.in_flight.push(pending);
            }
            Err(err) => {
                tracing::warn!(%id, "warp submit failed: {err}");
                self.notice = Some(Notice {
                    message: format!("Render failed: {err}"),
                    at: now,
                });
            }
        }
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use image::{ImageBuffer, Rgba};

    use super::*;
    use crate::processing::warp;

    fn source(w: u32, h: u32) -> SourceImage {
        SourceImage::new(ImageBuffer::from_fn(w, h, |x, y| {
            Rgba([x as u8, y as u8, 7, 255])
        }))
        .unwrap()
    }

    fn cpu_session() -> RenderSession {
        RenderSession::new(SessionSettings {
            backend: PreviewBackend::Cpu,
            size_policy: ResultSizePolicy::HalfSource,
            worker_count: 2,
            ..SessionSettings::default()
        })
    }

    fn settle(session: &mut RenderSession) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while session.busy() && Instant::now() < deadline {
            session.tick(Instant::now());
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(!session.busy(), "session did not settle");
    }

    #[test]
    fn debounce_waits_for_quiet_period() {
        let t0 = Instant::now();
        let mut debounce = Debounce::new(Duration::from_millis(120));
        assert!(debounce.settled(t0));
        debounce.touch(t0);
        assert!(!debounce.settled(t0 + Duration::from_millis(50)));
        assert_eq!(
            debounce.remaining(t0 + Duration::from_millis(50)),
            Some(Duration::from_millis(70))
        );
        assert!(debounce.settled(t0 + Duration::from_millis(120)));
        debounce.touch(t0 + Duration::from_millis(100));
        assert!(!debounce.settled(t0 + Duration::from_millis(150)));
        debounce.clear();
        assert!(debounce.settled(t0));
    }

    #[test]
    fn cpu_tick_renders_the_current_quad() {
        let mut session = cpu_session();
        session.set_source(source(64, 48));
        assert_eq!(session.result_spec(), ResultSpec::new(32, 24).unwrap());
        settle(&mut session);

        let expected = warp::warp(
            session.source().unwrap(),
            &Quad::centered(64, 48),
            ResultSpec::new(32, 24).unwrap(),
        )
        .unwrap();
        assert_eq!(session.last_result().unwrap().as_raw(), expected.as_raw());
    }

    #[test]
    fn superseded_responses_are_discarded() {
        let mut session = cpu_session();
        session.set_source(source(64, 48));
        let revision = session.revision();
        let now = Instant::now();

        session.dispatch(now);
        session.pointer_down(Point::new(16.0, 12.0));
        session.pointer_move(Point::new(2.0, 3.0));
        session.pointer_up();
        session.dispatch(now);
        assert_eq!(session.in_flight.len(), 2);

        settle(&mut session);
        assert_eq!(session.revision(), revision + 1);
        let expected = warp::warp(
            session.source().unwrap(),
            &session.quad(),
            session.result_spec(),
        )
        .unwrap();
        assert_eq!(session.last_result().unwrap().as_raw(), expected.as_raw());
    }

    #[test]
    fn failed_render_keeps_previous_result_and_raises_notice() {
        let mut session = cpu_session();
        session.set_source(source(32, 32));
        settle(&mut session);
        let good = session.last_result().unwrap().clone();

        session
            .editor
            .reset(Quad::centered(32, 32).with_corner(
                crate::geometry::Corner::B,
                Point::new(f64::INFINITY, 0.0),
            ));
        session.mark_dirty(Instant::now());
        settle(&mut session);

        assert_eq!(session.last_result().unwrap().as_raw(), good.as_raw());
        let notice = session.notice(Instant::now()).unwrap();
        assert!(notice.contains("invalid geometry"), "{notice}");
        assert!(session.notice(Instant::now() + NOTICE_TTL).is_none());
    }

    #[test]
    fn new_source_resets_quad_and_result() {
        let mut session = cpu_session();
        session.set_source(source(64, 48));
        session.pointer_down(Point::new(16.0, 12.0));
        session.pointer_move(Point::new(0.0, 0.0));
        session.pointer_up();
        settle(&mut session);
        assert!(session.last_result().is_some());

        session.set_source(source(100, 40));
        assert_eq!(session.quad(), Quad::centered(100, 40));
        assert!(session.last_result().is_none());
        assert_eq!(session.result_spec(), ResultSpec::new(50, 20).unwrap());
    }

    #[test]
    fn pointer_without_source_is_ignored() {
        let mut session = cpu_session();
        session.pointer_down(Point::new(1.0, 1.0));
        session.pointer_move(Point::new(2.0, 2.0));
        assert!(!session.busy());
        assert!(!session.tick(Instant::now()));
    }

    #[test]
    fn gpu_request_without_adapter_falls_back_to_cpu() {
        if gpu_pipeline::is_available() {
            return;
        }
        let mut session = RenderSession::new(SessionSettings {
            backend: PreviewBackend::Gpu,
            worker_count: 1,
            ..SessionSettings::default()
        });
        session.set_source(source(16, 16));
        assert!(!session.gpu_active());
        let t0 = Instant::now();
        session.tick(t0);
        let notice = session.notice(t0).unwrap().to_string();
        assert!(notice.contains("GPU"), "{notice}");
        settle(&mut session);
        assert_eq!(session.last_result().unwrap().dimensions(), (512, 512));

        // Reported once per backend choice, not on every render.
        let raised_at = session.notice.as_ref().unwrap().at;
        session.mark_dirty(Instant::now());
        settle(&mut session);
        assert_eq!(session.notice.as_ref().unwrap().at, raised_at);
    }

    #[test]
    fn gpu_setup_failure_keeps_result_and_switches_to_cpu() {
        if !gpu_pipeline::is_available() {
            return;
        }
        let mut session = RenderSession::new(SessionSettings {
            backend: PreviewBackend::Gpu,
            size_policy: ResultSizePolicy::Fixed(32),
            worker_count: 1,
            debounce: Duration::ZERO,
            ..SessionSettings::default()
        });
        session.set_source(source(64, 64));
        assert!(session.tick(Instant::now()));
        let good = session.last_result().unwrap().clone();
        let revision = session.revision();

        // The next pipeline build fails, as an out-of-memory device would.
        session = session
            .with_gpu_factory(|_, _| Err(WarpError::gpu_setup("out of device memory")));
        let smaller = ResultSpec::new(16, 16).unwrap();
        session.set_result_spec(smaller);
        assert!(!session.tick(Instant::now()));

        assert!(!session.gpu_active());
        assert_eq!(session.revision(), revision);
        assert_eq!(session.last_result().unwrap().as_raw(), good.as_raw());
        let notice = session.notice(Instant::now()).unwrap();
        assert!(notice.contains("out of device memory"), "{notice}");
        assert_eq!(session.in_flight.len(), 1);

        settle(&mut session);
        let expected = warp::warp(session.source().unwrap(), &session.quad(), smaller).unwrap();
        assert_eq!(session.last_result().unwrap().as_raw(), expected.as_raw());
    }

    #[test]
    fn replacing_the_source_does_not_overfill_the_workers() {
        let mut session = RenderSession::new(SessionSettings {
            backend: PreviewBackend::Cpu,
            size_policy: ResultSizePolicy::Fixed(1024),
            worker_count: 1,
            ..SessionSettings::default()
        });
        for _ in 0..4 {
            session.set_source(source(256, 256));
            session.tick(Instant::now());
            let dispatcher = session.dispatcher.as_ref().unwrap();
            assert!(dispatcher.in_flight() <= dispatcher.size());
        }
        settle(&mut session);
        let expected = warp::warp(
            session.source().unwrap(),
            &Quad::centered(256, 256),
            session.result_spec(),
        )
        .unwrap();
        assert_eq!(session.last_result().unwrap().as_raw(), expected.as_raw());
    }

    #[test]
    fn gpu_session_debounces_draws() {
        if !gpu_pipeline::is_available() {
            return;
        }
        let mut session = RenderSession::new(SessionSettings {
            backend: PreviewBackend::Gpu,
            size_policy: ResultSizePolicy::Fixed(32),
            ..SessionSettings::default()
        });
        session.set_source(source(64, 64));
        let t0 = Instant::now();
        assert!(session.tick(t0));

        session.pointer_down(Point::new(16.0, 16.0));
        session.pointer_move(Point::new(0.0, 0.0));
        let moved = Instant::now();
        assert!(!session.tick(moved));
        assert!(session.next_wake(moved).is_some());
        assert!(session.tick(moved + DEFAULT_DEBOUNCE));
    }
}
