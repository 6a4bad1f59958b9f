//! Prometheus exposition of the relay's counters. Lives in its own test
//! binary because the recorder is process-global.

use std::{net::SocketAddr, sync::Arc};

use beach_beacon::{
    push::DisabledNotifier,
    registry::ConnectionRegistry,
    router::{RoutingPolicy, SignalingRouter},
    server::{app, AppState},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::mpsc;

#[tokio::test]
async fn routed_messages_show_up_on_metrics_endpoint() {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("install recorder");

    let router = SignalingRouter::new(
        ConnectionRegistry::new(),
        RoutingPolicy::Paired,
        Arc::new(DisabledNotifier),
    );
    let (tx, _rx) = mpsc::unbounded_channel();
    let id = router.connect(None, tx).unwrap();
    router.handle_text(&id, r#"{"type":"register","role":"client"}"#);
    router.handle_text(&id, "garbage");
    router.handle_text(&id, r#"{"type":"ice","candidate":"c"}"#);

    let rendered = handle.render();
    assert!(
        rendered.contains("beach_beacon_messages_received_total"),
        "missing received counter:\n{rendered}"
    );
    assert!(rendered.contains("beach_beacon_messages_dropped_total"));
    assert!(rendered.contains(r#"reason="malformed""#));
    assert!(rendered.contains(r#"reason="unpaired""#));
    assert!(rendered.contains("beach_beacon_connections_total"));

    let app = app(AppState::new(router, Some(handle)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    let response = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = response.text().await.unwrap();
    assert!(body.contains(r#"beach_beacon_messages_received_total{type="register"} 1"#));
}
