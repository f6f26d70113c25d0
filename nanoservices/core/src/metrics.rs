use prometheus::{Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use once_cell::sync::Lazy;
use std::net::TcpListener;
use tokio::task::JoinHandle;
use std::convert::Infallible;
use hyper::{Body, Request, Response, Method, StatusCode};
use hyper::service::service_fn;

// Global registry and metrics are initialized lazily. Construction only fails
// on invalid metric names, which are fixed here.
static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("parrot".to_string()), None).unwrap_or_default()
});

static PROCESSOR_TRANSITIONS: Lazy<CounterVec> = Lazy::new(|| {
    let opts = Opts::new("processor_transitions_total", "Lifecycle transitions by target state");
    register(CounterVec::new(opts, &["processor", "state"]))
});

static EVENTS_APPLIED: Lazy<CounterVec> = Lazy::new(|| {
    let opts = Opts::new("events_applied_total", "Change events applied to a sink");
    register(CounterVec::new(opts, &["processor"]))
});

static BATCH_APPLY_DURATION_MS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new("batch_apply_duration_ms", "Time to apply one batch to a sink in milliseconds");
    register(HistogramVec::new(opts, &["processor"]))
});

static SINK_ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    let opts = Opts::new("sink_errors_total", "Failed sink operations");
    register(CounterVec::new(opts, &["processor"]))
});

static ASSIGNMENT_PASSES: Lazy<Counter> = Lazy::new(|| {
    register(Counter::new("assignment_passes_total", "Assignment passes run by the leader"))
});

static NODES_DEPARTED: Lazy<Counter> = Lazy::new(|| {
    register(Counter::new("nodes_departed_total", "Nodes declared departed after missed heartbeats"))
});

fn register<M>(metric: prometheus::Result<M>) -> M
where
    M: prometheus::core::Collector + Clone + 'static,
{
    match metric {
        Ok(metric) => {
            REGISTRY.register(Box::new(metric.clone())).ok();
            metric
        }
        Err(e) => panic!("invalid metric definition: {e}"),
    }
}

pub fn inc_transition(processor: &str, state: &str) {
    PROCESSOR_TRANSITIONS.with_label_values(&[processor, state]).inc();
}

pub fn add_events_applied(processor: &str, count: usize) {
    EVENTS_APPLIED.with_label_values(&[processor]).inc_by(count as f64);
}

/// Observe a batch apply duration in milliseconds.
pub fn observe_batch_duration(processor: &str, duration_ms: f64) {
    BATCH_APPLY_DURATION_MS.with_label_values(&[processor]).observe(duration_ms);
}

pub fn inc_sink_error(processor: &str) {
    SINK_ERRORS.with_label_values(&[processor]).inc();
}

pub fn inc_assignment_pass() {
    ASSIGNMENT_PASSES.inc();
}

pub fn inc_node_departed() {
    NODES_DEPARTED.inc();
}

/// Gather metrics as text in Prometheus exposition format.
///
/// # Example
///
/// ```no_run
/// use parrot_core::metrics;
/// metrics::inc_transition("orders", "RUNNING");
/// let body = metrics::gather_text();
/// println!("metrics:\n{}", body);
/// ```
pub fn gather_text() -> String {
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Serve `GET /metrics` on `listener` until `shutdown` resolves.
///
/// Must be called from within a Tokio runtime. The returned handle completes
/// once the accept loop has stopped.
///
/// # Example (uses Ctrl-C for shutdown)
///
/// ```no_run
/// use std::net::TcpListener;
/// use parrot_core::metrics;
///
/// # async fn run() {
/// let listener = TcpListener::bind("127.0.0.1:0").unwrap();
/// let shutdown = async { let _ = tokio::signal::ctrl_c().await; };
/// let _handle = metrics::start_exporter_with_shutdown(listener, shutdown);
/// # }
/// ```
pub fn start_exporter_with_shutdown<F>(listener: TcpListener, shutdown: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = listener.set_nonblocking(true) {
            tracing::error!(error = ?e, "failed to set listener to non-blocking");
            return;
        }
        let tcp_listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = ?e, "failed to convert listener to tokio listener");
                return;
            }
        };
        let mut shutdown_fut = Box::pin(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown_fut => {
                    tracing::info!("metrics exporter shutdown requested");
                    break;
                }
                accept = tcp_listener.accept() => {
                    match accept {
                        Ok((stream, _peer)) => {
                            let svc = service_fn(|req: Request<Body>| async move {
                                Ok::<_, Infallible>(route(&req))
                            });
                            tokio::spawn(async move {
                                if let Err(err) = hyper::server::conn::Http::new().serve_connection(stream, svc).await {
                                    tracing::error!(error = ?err, "connection serve error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = ?e, "failed to accept connection on metrics listener");
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("metrics exporter stopped");
    })
}

fn route(req: &Request<Body>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let mut response = Response::new(Body::from(gather_text()));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        _ => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}

/// Start the exporter and return a oneshot sender that stops it.
pub fn start_exporter(listener: TcpListener) -> (JoinHandle<()>, tokio::sync::oneshot::Sender<()>) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let handle = start_exporter_with_shutdown(listener, async move { let _ = rx.await; });
    (handle, tx)
}
