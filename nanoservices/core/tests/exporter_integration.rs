use std::net::TcpListener;
use std::time::Duration;

use parrot_core::metrics;

#[tokio::test]
async fn exporter_serves_metrics() {
    // Bind to port 0 so the OS assigns an available port.
    let std_listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    let addr = std_listener.local_addr().unwrap();

    let (handle, shutdown_tx) = metrics::start_exporter(std_listener);

    metrics::inc_transition("exporter_test", "RUNNING");
    metrics::add_events_applied("exporter_test", 4);

    let client = reqwest::Client::builder().timeout(Duration::from_secs(2)).build().unwrap();
    let resp = client
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .expect("failed to query metrics");
    assert!(resp.status().is_success());
    let body_text = resp.text().await.expect("failed to read body");

    assert!(body_text.contains("parrot_processor_transitions_total"), "missing transitions metric: {body_text}");
    assert!(body_text.contains("parrot_events_applied_total"), "missing events metric: {body_text}");
    assert!(body_text.contains("exporter_test"), "missing our label: {body_text}");

    let missing = client.get(format!("http://{addr}/nope")).send().await.unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    shutdown_tx.send(()).expect("failed to send shutdown");
    tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
}
