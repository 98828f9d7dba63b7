//! Test doubles shared by unit and service tests

use crate::{
    CaptureOptions, Engine, Launcher, RenderError, RenderRequest, RenderedImage, Renderer,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Smallest byte string `image::guess_format` recognises as JPEG.
pub fn jpeg_bytes() -> Bytes {
    Bytes::from_static(b"\xff\xd8\xff\xe0\x00\x10JFIF\x00\x01fake-jpeg-body\xff\xd9")
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 3s");
}

#[derive(Default)]
struct LauncherState {
    launched: AtomicUsize,
    closed: AtomicUsize,
    pages_opened: AtomicUsize,
    pages_closed: AtomicUsize,
    fail_launch: AtomicBool,
    fail_navigation: AtomicBool,
    capture_delay: Mutex<Option<Duration>>,
    engines: Mutex<Vec<Arc<AtomicBool>>>,
}

/// Launcher whose engines record every open and close.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    state: Arc<LauncherState>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launched(&self) -> usize {
        self.state.launched.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn pages_opened(&self) -> usize {
        self.state.pages_opened.load(Ordering::SeqCst)
    }

    pub fn pages_closed(&self) -> usize {
        self.state.pages_closed.load(Ordering::SeqCst)
    }

    pub fn fail_launch(&self, fail: bool) {
        self.state.fail_launch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_navigation(&self, fail: bool) {
        self.state.fail_navigation.store(fail, Ordering::SeqCst);
    }

    pub fn set_capture_delay(&self, delay: Duration) {
        *self.state.capture_delay.lock().unwrap() = Some(delay);
    }

    /// Marks every engine launched so far as crashed.
    pub fn kill_all(&self) {
        for alive in self.state.engines.lock().unwrap().iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    type Engine = FakeEngine;

    async fn launch(&self) -> Result<FakeEngine, RenderError> {
        if self.state.fail_launch.load(Ordering::SeqCst) {
            return Err(RenderError::Launch("browser binary not found".into()));
        }
        self.state.launched.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        self.state.engines.lock().unwrap().push(alive.clone());
        Ok(FakeEngine {
            state: self.state.clone(),
            alive,
        })
    }
}

pub struct FakeEngine {
    state: Arc<LauncherState>,
    alive: Arc<AtomicBool>,
}

struct PageGuard(Arc<LauncherState>);

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.0.pages_closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn capture(
        &mut self,
        _request: &RenderRequest,
        _options: &CaptureOptions,
    ) -> Result<RenderedImage, RenderError> {
        self.state.pages_opened.fetch_add(1, Ordering::SeqCst);
        let _page = PageGuard(self.state.clone());

        let delay = *self.state.capture_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_navigation.load(Ordering::SeqCst) {
            return Err(RenderError::Navigation("net::ERR_NAME_NOT_RESOLVED".into()));
        }
        RenderedImage::from_jpeg(jpeg_bytes())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(self) {
        self.alive.store(false, Ordering::SeqCst);
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Renderer that counts calls and returns a fixed JPEG after an optional delay.
#[derive(Default)]
pub struct CountingRenderer {
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl CountingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Some(delay),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for CountingRenderer {
    async fn render(&self, _request: &RenderRequest) -> Result<RenderedImage, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        RenderedImage::from_jpeg(jpeg_bytes())
    }
}
