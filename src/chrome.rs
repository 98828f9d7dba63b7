//! Headless Chrome engine driven over the DevTools protocol

use crate::request::{DEFAULT_HEIGHT, DEFAULT_WIDTH};
use crate::{CaptureOptions, Engine, Launcher, RenderError, RenderRequest, RenderedImage, RendererConfig};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::stream::{self, Stream, StreamExt};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Injected after load so scrollbars never show in the capture.
const HIDE_SCROLLBARS: &str = r#"(() => {
    const style = document.createElement('style');
    style.textContent = '::-webkit-scrollbar { display: none !important; } html, body { overflow: hidden !important; }';
    (document.head || document.documentElement).appendChild(style);
    return true;
})()"#;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn chrome_args(config: &RendererConfig) -> Vec<String> {
    let mut args: Vec<String> = [
        "--disable-dev-shm-usage",
        "--disable-extensions",
        "--disable-background-networking",
        "--disable-default-apps",
        "--disable-sync",
        "--no-first-run",
        "--hide-scrollbars",
        "--mute-audio",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if config.disable_sandbox {
        args.push("--no-sandbox".to_string());
        args.push("--disable-setuid-sandbox".to_string());
    }
    if config.disable_gpu {
        args.push("--disable-gpu".to_string());
    }
    if config.single_process {
        args.push("--single-process".to_string());
        args.push("--no-zygote".to_string());
    }

    args
}

pub struct ChromeLauncher {
    config: RendererConfig,
}

impl ChromeLauncher {
    pub fn new(config: RendererConfig) -> Self {
        Self { config }
    }

    fn browser_config(&self, profile_dir: &Path) -> Result<BrowserConfig, RenderError> {
        let mut builder = BrowserConfig::builder()
            .window_size(DEFAULT_WIDTH, DEFAULT_HEIGHT)
            .launch_timeout(self.config.launch_timeout)
            .request_timeout(self.config.navigation_timeout)
            .user_data_dir(profile_dir)
            .args(chrome_args(&self.config));

        if !self.config.headless {
            builder = builder.with_head();
        }
        if let Some(chrome_path) = &self.config.chrome_path {
            builder = builder.chrome_executable(chrome_path);
        }

        builder.build().map_err(RenderError::Launch)
    }
}

#[async_trait]
impl Launcher for ChromeLauncher {
    type Engine = ChromeEngine;

    async fn launch(&self) -> Result<ChromeEngine, RenderError> {
        // Each engine gets its own profile so concurrent browsers never share a singleton lock.
        let profile_dir = std::env::temp_dir().join(format!(
            "screenshot-server-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        tokio::fs::create_dir_all(&profile_dir)
            .await
            .map_err(|e| RenderError::Launch(format!("Failed to create profile dir: {e}")))?;

        let launched = match self.browser_config(&profile_dir) {
            Ok(browser_config) => Browser::launch(browser_config)
                .await
                .map_err(|e| RenderError::Launch(e.to_string())),
            Err(e) => Err(e),
        };

        let (browser, mut handler) = match launched {
            Ok(pair) => pair,
            Err(e) => {
                remove_profile(&profile_dir).await;
                return Err(e);
            }
        };

        // The handler drives all CDP traffic and must be polled for the browser's lifetime.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {}", e);
                }
            }
            debug!("Browser handler stream ended");
        });

        Ok(ChromeEngine {
            browser,
            handler: handler_task,
            profile_dir,
        })
    }
}

pub struct ChromeEngine {
    browser: Browser,
    handler: JoinHandle<()>,
    profile_dir: PathBuf,
}

#[async_trait]
impl Engine for ChromeEngine {
    async fn capture(
        &mut self,
        request: &RenderRequest,
        options: &CaptureOptions,
    ) -> Result<RenderedImage, RenderError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| RenderError::Launch(format!("Failed to open page: {e}")))?;

        let result = capture_page(&page, request, options).await;

        if let Err(e) = page.close().await {
            debug!("Failed to close page: {}", e);
        }
        result
    }

    fn is_alive(&self) -> bool {
        !self.handler.is_finished()
    }

    async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            debug!("Browser close command failed: {}", e);
        }
        if timeout(CLOSE_TIMEOUT, self.browser.wait()).await.is_err() {
            warn!("Browser did not exit within {:?}", CLOSE_TIMEOUT);
        }
        self.handler.abort();
        remove_profile(&self.profile_dir).await;
    }
}

async fn remove_profile(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        debug!("Failed to remove profile dir {}: {}", dir.display(), e);
    }
}

async fn capture_page(
    page: &Page,
    request: &RenderRequest,
    options: &CaptureOptions,
) -> Result<RenderedImage, RenderError> {
    let metrics = SetDeviceMetricsOverrideParams::builder()
        .width(request.width())
        .height(request.height())
        .device_scale_factor(1.0)
        .mobile(false)
        .build()
        .map_err(RenderError::Capture)?;

    page.execute(metrics)
        .await
        .map_err(|e| RenderError::Capture(e.to_string()))?;

    timeout(options.navigation_timeout, navigate(page, request, options))
        .await
        .map_err(|_| RenderError::Timeout {
            stage: "navigation",
            after: options.navigation_timeout,
        })??;

    page.evaluate(HIDE_SCROLLBARS)
        .await
        .map_err(|e| RenderError::Capture(format!("Failed to inject style: {e}")))?;

    let params = ScreenshotParams::builder()
        .format(CaptureScreenshotFormat::Jpeg)
        .quality(i64::from(request.quality()))
        .build();

    let data = page
        .screenshot(params)
        .await
        .map_err(|e| RenderError::Capture(e.to_string()))?;

    RenderedImage::from_jpeg(data)
}

async fn navigate(page: &Page, request: &RenderRequest, options: &CaptureOptions) -> Result<(), RenderError> {
    let nav_err = |e: chromiumoxide::error::CdpError| RenderError::Navigation(e.to_string());

    page.execute(EnableParams::default()).await.map_err(nav_err)?;

    let started = page
        .event_listener::<EventRequestWillBeSent>()
        .await
        .map_err(nav_err)?
        .map(|e| NetworkEvent::Started(e.request_id.inner().clone()));
    let finished = page
        .event_listener::<EventLoadingFinished>()
        .await
        .map_err(nav_err)?
        .map(|e| NetworkEvent::Finished(e.request_id.inner().clone()));
    let failed = page
        .event_listener::<EventLoadingFailed>()
        .await
        .map_err(nav_err)?
        .map(|e| NetworkEvent::Finished(e.request_id.inner().clone()));

    let mut events = stream::select_all(vec![started.boxed(), finished.boxed(), failed.boxed()]);

    page.goto(request.url().as_str()).await.map_err(nav_err)?;

    wait_for_network_idle(
        &mut events,
        options.network_idle_connections,
        options.network_idle_time,
    )
    .await;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Started(String),
    Finished(String),
}

/// Requests the page has issued that have not yet finished or failed
#[derive(Debug, Default)]
pub struct InflightRequests {
    pending: HashSet<String>,
}

impl InflightRequests {
    pub fn apply(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Started(id) => {
                self.pending.insert(id);
            }
            NetworkEvent::Finished(id) => {
                self.pending.remove(&id);
            }
        }
    }

    pub fn count(&self) -> usize {
        self.pending.len()
    }
}

/// Returns once at most `max_inflight` requests have been outstanding for
/// `quiet_for` without interruption, or when the event stream ends.
pub async fn wait_for_network_idle<S>(events: &mut S, max_inflight: usize, quiet_for: Duration)
where
    S: Stream<Item = NetworkEvent> + Unpin,
{
    let mut inflight = InflightRequests::default();
    loop {
        let next = if inflight.count() <= max_inflight {
            match timeout(quiet_for, events.next()).await {
                Ok(next) => next,
                Err(_) => return,
            }
        } else {
            events.next().await
        };

        match next {
            Some(event) => inflight.apply(event),
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;

    fn started(id: &str) -> NetworkEvent {
        NetworkEvent::Started(id.to_string())
    }

    fn finished(id: &str) -> NetworkEvent {
        NetworkEvent::Finished(id.to_string())
    }

    #[test]
    fn test_chrome_args_follow_config() {
        let config = RendererConfig::default();
        let args = chrome_args(&config);
        for flag in ["--no-sandbox", "--disable-setuid-sandbox", "--disable-gpu", "--single-process", "--no-zygote", "--disable-dev-shm-usage"] {
            assert!(args.iter().any(|a| a == flag), "missing {flag}");
        }

        let config = RendererConfig {
            disable_sandbox: false,
            single_process: false,
            ..RendererConfig::default()
        };
        let args = chrome_args(&config);
        assert!(!args.iter().any(|a| a == "--no-sandbox"));
        assert!(!args.iter().any(|a| a == "--single-process"));
    }

    #[test]
    fn test_inflight_tracking() {
        let mut inflight = InflightRequests::default();
        inflight.apply(started("1"));
        inflight.apply(started("2"));
        inflight.apply(started("2"));
        assert_eq!(inflight.count(), 2);

        inflight.apply(finished("1"));
        inflight.apply(finished("unknown"));
        assert_eq!(inflight.count(), 1);
    }

    #[tokio::test]
    async fn test_idle_reached_when_quiet() {
        let (tx, mut rx) = mpsc::unbounded();
        tx.unbounded_send(started("1")).unwrap();
        tx.unbounded_send(started("2")).unwrap();

        // Two in flight is within the allowance, so silence is enough.
        let idle = timeout(
            Duration::from_secs(2),
            wait_for_network_idle(&mut rx, 2, Duration::from_millis(20)),
        )
        .await;
        assert!(idle.is_ok());
        drop(tx);
    }

    #[tokio::test]
    async fn test_busy_network_blocks_until_requests_finish() {
        let (tx, mut rx) = mpsc::unbounded();
        for id in ["1", "2", "3"] {
            tx.unbounded_send(started(id)).unwrap();
        }

        let blocked = timeout(
            Duration::from_millis(100),
            wait_for_network_idle(&mut rx, 2, Duration::from_millis(20)),
        )
        .await;
        assert!(blocked.is_err());

        let (tx, mut rx) = mpsc::unbounded();
        for id in ["1", "2", "3"] {
            tx.unbounded_send(started(id)).unwrap();
        }
        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.unbounded_send(finished("3")).unwrap();
            tx
        });

        let begin = std::time::Instant::now();
        let idle = timeout(
            Duration::from_secs(2),
            wait_for_network_idle(&mut rx, 2, Duration::from_millis(20)),
        )
        .await;
        assert!(idle.is_ok());
        assert!(begin.elapsed() >= Duration::from_millis(50));
        drop(sender.await.unwrap());
    }

    #[tokio::test]
    async fn test_stream_end_stops_waiting() {
        let (tx, mut rx) = mpsc::unbounded::<NetworkEvent>();
        for id in ["1", "2", "3"] {
            tx.unbounded_send(started(id)).unwrap();
        }
        drop(tx);

        let done = timeout(
            Duration::from_secs(2),
            wait_for_network_idle(&mut rx, 0, Duration::from_secs(60)),
        )
        .await;
        assert!(done.is_ok());
    }
}
