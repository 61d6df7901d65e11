//! Checks against a real Tor control port.
//!
//! Run with `cargo test --features integration` while a Tor with
//! `ControlPort 9051` and `HashedControlPassword` is listening. Override the
//! endpoint with `TORCTL_TEST_CONTROL_PORT` and `TORCTL_TEST_CONTROL_PASS`.

#![cfg(feature = "integration")]

use std::time::Duration;

use torctl_rs::client::{Client, ClientOptions, ClientRemoteParams};
use torctl_rs::{commands, ControlEndpoint, EventKind, MINIMUM_SUPPORTED_VERSION};

fn endpoint() -> ControlEndpoint {
    let port = std::env::var("TORCTL_TEST_CONTROL_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(9051);
    let password = std::env::var("TORCTL_TEST_CONTROL_PASS").unwrap_or_default();
    ControlEndpoint::local(port, password)
}

#[tokio::test]
async fn version_is_supported() {
    let version = commands::get_version(&endpoint()).await.unwrap();
    assert!(version >= MINIMUM_SUPPORTED_VERSION);
}

#[tokio::test]
async fn socks_port_is_readable() {
    let values = commands::get_conf(&endpoint(), &["SocksPort"]).await.unwrap();
    assert_eq!(values.len(), 1);
    assert!(values[0].0.eq_ignore_ascii_case("SocksPort"));
}

#[tokio::test]
async fn client_attaches_and_receives_bandwidth() {
    let endpoint = endpoint();
    let params = ClientRemoteParams::new(
        endpoint.host.clone(),
        endpoint.port,
        endpoint.password.as_str(),
    );
    let options = ClientOptions {
        proxy_port: 0,
        ..ClientOptions::default()
    };
    let mut client = Client::connect(params, options).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _subscription = client.events().subscribe(EventKind::Bandwidth, move |event| {
        let _ = tx.send(event.clone());
    });
    // Tor emits BW once per second.
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind(), EventKind::Bandwidth);

    assert!(client.web_proxy().is_some());
    client.shutdown().await;
}
