//! End-to-end pairing over an in-process relay

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tether::config::PairingUrl;
use tether::crypto::{envelope, KeyPair};
use tether::session::SessionState;
use tether::transport::{select_target, TargetKind};
use tether::{relay, ClientConfig, Envelope, MemoryIdentityStore, SessionClient};
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(10);

async fn wait_for<F>(rx: &mut watch::Receiver<SessionState>, mut predicate: F)
where
    F: FnMut(&SessionState) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            if predicate(&rx.borrow()) {
                return;
            }
            rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .expect("timed out waiting for session state");
}

fn new_client(relay_url: &str) -> SessionClient {
    SessionClient::new(
        ClientConfig::with_relay(relay_url),
        Arc::new(MemoryIdentityStore::new()),
    )
}

#[tokio::test]
async fn desktop_and_mobile_pair_and_sync_registries() {
    let relay = relay::spawn("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let desktop = new_client(&relay.base_url());
    let mut desktop_state = desktop.subscribe_state();
    let token = desktop.create_room().await.unwrap();
    wait_for(&mut desktop_state, |s| s.connected).await;
    let desktop_id = desktop.state().device_id.unwrap();

    let mobile = new_client(&relay.base_url());
    let mut mobile_state = mobile.subscribe_state();
    mobile.join_with_token(&token).await.unwrap();
    wait_for(&mut mobile_state, |s| s.connected).await;
    let mobile_id = mobile.state().device_id.unwrap();

    // After registry sync each side sees the other
    let expected_mobile = mobile_id.clone();
    wait_for(&mut desktop_state, move |s| {
        s.connected_devices
            .iter()
            .any(|d| d.device_id == expected_mobile)
    })
    .await;
    let expected_desktop = desktop_id.clone();
    wait_for(&mut mobile_state, move |s| {
        s.connected_devices
            .iter()
            .any(|d| d.device_id == expected_desktop)
    })
    .await;

    desktop.disconnect().await;
    mobile.disconnect().await;
}

#[tokio::test]
async fn enveloped_payload_crosses_the_relay_intact() {
    let relay = relay::spawn("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let desktop = new_client(&relay.base_url());
    let mut desktop_state = desktop.subscribe_state();
    let token = desktop.create_room().await.unwrap();
    wait_for(&mut desktop_state, |s| s.connected).await;

    let mobile = new_client(&relay.base_url());
    let mut mobile_state = mobile.subscribe_state();
    mobile.join_with_token(&token).await.unwrap();
    wait_for(&mut mobile_state, |s| s.connected).await;

    let mobile_id = mobile.state().device_id.unwrap();
    let mut mobile_messages = mobile.subscribe_messages();

    // Devices agree on a secret out of band (public keys would travel in
    // registration metadata in a full deployment)
    let desktop_keys = KeyPair::generate();
    let mobile_keys = KeyPair::generate();
    let desktop_secret = desktop_keys.derive_shared_secret(mobile_keys.public_key());
    let mobile_secret = mobile_keys.derive_shared_secret(desktop_keys.public_key());

    let payload = json!({"clipboard": "42 rue des Trois Frères", "seq": 7});
    let sealed = envelope::seal(&payload, desktop_secret.key()).unwrap();
    assert!(desktop.send(&mobile_id, "secure-sync", serde_json::to_value(&sealed).unwrap()));

    let received = tokio::time::timeout(WAIT, async {
        loop {
            let msg = mobile_messages.recv().await.expect("message channel closed");
            if msg.kind == "secure-sync" {
                return msg;
            }
        }
    })
    .await
    .expect("secure-sync message never arrived");

    let received_envelope: Envelope = serde_json::from_value(received.payload).unwrap();
    let opened: serde_json::Value = envelope::open(&received_envelope, mobile_secret.key()).unwrap();
    assert_eq!(opened, payload);

    desktop.disconnect().await;
    mobile.disconnect().await;
}

#[tokio::test]
async fn send_returns_false_until_registered() {
    let relay = relay::spawn("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let client = new_client(&relay.base_url());

    assert!(!client.send("anyone", "status", json!({})));

    let mut state = client.subscribe_state();
    let _token = client.create_room().await.unwrap();
    wait_for(&mut state, |s| s.connected).await;

    assert!(client.send("anyone", "status", json!({})));

    client.disconnect().await;
    assert!(!client.send("anyone", "status", json!({})));
}

#[tokio::test]
async fn join_with_unknown_token_surfaces_an_error() {
    let relay = relay::spawn("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let mobile = new_client(&relay.base_url());
    let mut state = mobile.subscribe_state();

    mobile.join_with_token("no-such-token").await.unwrap();
    wait_for(&mut state, |s| s.error.is_some()).await;
    assert!(!state.borrow().connected);
}

#[tokio::test]
async fn live_local_candidate_wins_selection() {
    let relay = relay::spawn("127.0.0.1:0".parse().unwrap()).await.unwrap();

    // The embedded relay doubles as a local desktop endpoint, serving
    // the same handshake path the probe checks
    let target = select_target(Some(&relay.base_url()), "http://127.0.0.1:1", 2_000).await;
    assert_eq!(target.kind, TargetKind::Local);
    assert!(target.ws_url().ends_with("/device"));
}

#[tokio::test]
async fn pairing_url_join_prefers_live_local_candidate() {
    let relay = relay::spawn("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let desktop = new_client(&relay.base_url());
    let mut desktop_state = desktop.subscribe_state();
    let token = desktop.create_room().await.unwrap();
    wait_for(&mut desktop_state, |s| s.connected).await;

    // The relay field points nowhere; only the local candidate is live
    let url = PairingUrl::build("http://127.0.0.1:1", &token, Some(&relay.base_url()));

    let mobile = new_client("http://127.0.0.1:1");
    let mut mobile_state = mobile.subscribe_state();
    mobile.join_with_pairing_url(&url).await.unwrap();
    wait_for(&mut mobile_state, |s| s.connected).await;

    desktop.disconnect().await;
    mobile.disconnect().await;
}
