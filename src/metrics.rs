use metrics::{register_counter, register_histogram, Counter, Histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

pub struct Metrics {
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub store_read_errors: Counter,
    pub store_write_errors: Counter,
    pub renders_succeeded: Counter,
    pub render_duration: Histogram,
    pub invalid_requests: Counter,
    pub rate_limited: Counter,
    pub rate_limit_store_errors: Counter,
    pub engines_launched: Counter,
    pub engines_closed: Counter,
}

impl Metrics {
    /// Registers every series against the installed recorder.
    ///
    /// Without a recorder installed the handles are inert.
    pub fn new() -> Self {
        Self {
            cache_hits: register_counter!("screenshot_cache_hits_total"),
            cache_misses: register_counter!("screenshot_cache_misses_total"),
            store_read_errors: register_counter!("screenshot_store_errors_total", "op" => "get"),
            store_write_errors: register_counter!("screenshot_store_errors_total", "op" => "put"),
            renders_succeeded: register_counter!("screenshot_renders_total", "outcome" => "ok"),
            render_duration: register_histogram!("screenshot_render_duration_seconds"),
            invalid_requests: register_counter!("screenshot_invalid_requests_total"),
            rate_limited: register_counter!("screenshot_rate_limited_total"),
            rate_limit_store_errors: register_counter!("screenshot_rate_limit_store_errors_total"),
            engines_launched: register_counter!("screenshot_engines_launched_total"),
            engines_closed: register_counter!("screenshot_engines_closed_total"),
        }
    }

    pub fn noop() -> Self {
        Self {
            cache_hits: Counter::noop(),
            cache_misses: Counter::noop(),
            store_read_errors: Counter::noop(),
            store_write_errors: Counter::noop(),
            renders_succeeded: Counter::noop(),
            render_duration: Histogram::noop(),
            invalid_requests: Counter::noop(),
            rate_limited: Counter::noop(),
            rate_limit_store_errors: Counter::noop(),
            engines_launched: Counter::noop(),
            engines_closed: Counter::noop(),
        }
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.increment(1);
        } else {
            self.cache_misses.increment(1);
        }
    }

    pub fn record_render(&self, duration: Duration, failure_kind: Option<&'static str>) {
        self.render_duration.record(duration.as_secs_f64());
        match failure_kind {
            None => self.renders_succeeded.increment(1),
            Some(kind) => {
                metrics::increment_counter!("screenshot_renders_total", "outcome" => "error", "kind" => kind)
            }
        }
    }

    pub fn record_store_error(&self, write: bool) {
        if write {
            self.store_write_errors.increment(1);
        } else {
            self.store_read_errors.increment(1);
        }
    }

    pub fn record_invalid_request(&self) {
        self.invalid_requests.increment(1);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.increment(1);
    }

    pub fn record_rate_limit_store_error(&self) {
        self.rate_limit_store_errors.increment(1);
    }

    pub fn record_engine_launched(&self) {
        self.engines_launched.increment(1);
    }

    pub fn record_engine_closed(&self) {
        self.engines_closed.increment(1);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the global Prometheus recorder; call before [`Metrics::new`].
pub fn install_prometheus() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full("screenshot_render_duration_seconds".to_string()),
            &[0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0],
        )?
        .install_recorder()
}
