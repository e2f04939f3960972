use super::control::{MALFORMED_REQUEST, RpcResponse, handle_request};
use super::presence::{DEFAULT_KEEPALIVE_US, PresenceTracker};
use crate::transport::codec::Message;
use crate::transport::forwarder::Injector;
use serde_json::{Value, json};
use tokio::sync::mpsc::{self, UnboundedReceiver};

fn tracker() -> (PresenceTracker, UnboundedReceiver<Vec<u8>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PresenceTracker::new(Injector::new(tx)), rx)
}

fn announcements(rx: &mut UnboundedReceiver<Vec<u8>>) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        out.push(Message::decode(&frame).unwrap());
    }
    out
}

fn heartbeat(module: &str, endpoint: &str) -> Value {
    json!({ "module": module, "host": "rover", "pub": endpoint, "timestamp": "1" })
}

#[test]
fn test_first_heartbeat_announces_connect() {
    let (mut presence, mut rx) = tracker();
    presence
        .handle_heartbeat("central.heartbeat.gps", heartbeat("gps", "tcp://127.0.0.1:9000"), 1_000)
        .unwrap();

    let sent = announcements(&mut rx);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].topic, "central.connect.gps");
    let body: Value = serde_json::from_slice(&sent[0].body).unwrap();
    assert_eq!(body["pub"], "tcp://127.0.0.1:9000");
    assert_eq!(body["host"], "rover");

    let record = presence.get("gps").unwrap();
    assert_eq!(record.deadline, Some(1_000 + DEFAULT_KEEPALIVE_US));
    assert_eq!(record.host.as_deref(), Some("rover"));
}

#[test]
fn test_repeat_heartbeat_only_refreshes_deadline() {
    let (mut presence, mut rx) = tracker();
    let hb = heartbeat("gps", "tcp://127.0.0.1:9000");
    presence.handle_heartbeat("central.heartbeat.gps", hb.clone(), 0).unwrap();
    presence.handle_heartbeat("central.heartbeat.gps", hb, 5_000_000).unwrap();

    assert_eq!(announcements(&mut rx).len(), 1);
    assert_eq!(
        presence.get("gps").unwrap().deadline,
        Some(5_000_000 + DEFAULT_KEEPALIVE_US)
    );
}

#[test]
fn test_endpoint_change_announces_disconnect_then_connect() {
    let (mut presence, mut rx) = tracker();
    presence
        .handle_heartbeat("central.heartbeat.gps", heartbeat("gps", "tcp://127.0.0.1:9000"), 0)
        .unwrap();
    announcements(&mut rx);

    presence
        .handle_heartbeat("central.heartbeat.gps", heartbeat("gps", "tcp://127.0.0.1:9001"), 10)
        .unwrap();
    let topics: Vec<String> = announcements(&mut rx).into_iter().map(|m| m.topic).collect();
    assert_eq!(topics, vec!["central.disconnect.gps", "central.connect.gps"]);
    assert_eq!(
        presence.get("gps").unwrap().publish_endpoint.as_deref(),
        Some("tcp://127.0.0.1:9001")
    );
}

#[test]
fn test_keepalive_from_heartbeat_and_sweep() {
    let (mut presence, mut rx) = tracker();
    let mut hb = heartbeat("cam", "tcp://127.0.0.1:9100");
    hb["keepalive"] = json!(3_000_000);
    presence.handle_heartbeat("central.heartbeat.cam", hb, 0).unwrap();
    announcements(&mut rx);

    // exactly at the deadline the module is still alive
    assert!(presence.sweep(3_000_000).is_empty());
    assert!(announcements(&mut rx).is_empty());

    assert_eq!(presence.sweep(3_000_001), vec!["cam".to_string()]);
    let sent = announcements(&mut rx);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].topic, "central.disconnect.cam");
    let body: Value = serde_json::from_slice(&sent[0].body).unwrap();
    assert_eq!(body["timestamp"], "3000001");
    assert!(presence.get("cam").is_none());

    // a second sweep has nothing left to announce
    assert!(presence.sweep(10_000_000).is_empty());
    assert!(announcements(&mut rx).is_empty());
}

#[test]
fn test_huge_keepalive_saturates_deadline() {
    let (mut presence, mut rx) = tracker();
    let mut hb = heartbeat("m", "tcp://h:1");
    hb["keepalive"] = json!(i64::MAX);
    presence.handle_heartbeat("central.heartbeat.m", hb.clone(), 1_000_000).unwrap();
    assert_eq!(presence.get("m").unwrap().deadline, Some(i64::MAX));

    // refreshing keeps the same instance instead of wrapping into the past
    presence.handle_heartbeat("central.heartbeat.m", hb, 2_000_000).unwrap();
    assert!(presence.sweep(3_000_000).is_empty());
    assert_eq!(announcements(&mut rx).len(), 1);

    hb = heartbeat("big", "tcp://h:2");
    hb["keepalive"] = json!(u64::MAX);
    presence.handle_heartbeat("central.heartbeat.big", hb, 5).unwrap();
    assert_eq!(presence.get("big").unwrap().deadline, Some(i64::MAX));
}

#[test]
fn test_negative_keepalive_clamps_to_zero() {
    let (mut presence, _rx) = tracker();
    let mut hb = heartbeat("neg", "tcp://h:1");
    hb["keepalive"] = json!(-5_000_000);
    presence.handle_heartbeat("central.heartbeat.neg", hb, 1_000).unwrap();
    assert_eq!(presence.get("neg").unwrap().deadline, Some(1_000));
    assert!(presence.sweep(1_000).is_empty());
    assert_eq!(presence.sweep(1_001), vec!["neg".to_string()]);
}

#[test]
fn test_keepalive_accepts_any_json_number() {
    let (mut presence, mut rx) = tracker();
    let mut hb = heartbeat("f", "tcp://h:1");
    hb["keepalive"] = json!(3_000_000.0);
    presence.handle_heartbeat("central.heartbeat.f", hb, 0).unwrap();
    let record = presence.get("f").unwrap();
    assert_eq!(record.keepalive, Some(3_000_000));
    assert_eq!(record.deadline, Some(3_000_000));
    assert_eq!(announcements(&mut rx)[0].topic, "central.connect.f");

    // a keepalive that is not a number falls back to the default
    let mut hb = heartbeat("s", "tcp://h:2");
    hb["keepalive"] = json!("soon");
    presence.handle_heartbeat("central.heartbeat.s", hb, 0).unwrap();
    assert_eq!(presence.get("s").unwrap().deadline, Some(DEFAULT_KEEPALIVE_US));
}

#[test]
fn test_module_name_falls_back_to_topic() {
    let (mut presence, _rx) = tracker();
    presence
        .handle_heartbeat("central.heartbeat.anon", json!({ "pub": "tcp://h:1" }), 0)
        .unwrap();
    let record = presence.get("anon").unwrap();
    assert!(record.extra.contains_key("timestamp"));
}

#[test]
fn test_non_object_heartbeat_is_rejected() {
    let (mut presence, mut rx) = tracker();
    assert!(presence.handle_heartbeat("central.heartbeat.x", json!([1, 2]), 0).is_err());
    assert!(presence.modules().is_empty());
    assert!(announcements(&mut rx).is_empty());
}

#[test]
fn test_seeded_modules_are_never_swept() {
    let (mut presence, mut rx) = tracker();
    presence.seed("legacy", "tcp://10.0.0.5:9000");
    assert!(presence.sweep(i64::MAX).is_empty());
    assert!(presence.get("legacy").is_some());
    assert!(announcements(&mut rx).is_empty());
}

#[test]
fn test_info_returns_presence_table() {
    let (mut presence, _rx) = tracker();
    let mut hb = heartbeat("gps", "tcp://127.0.0.1:9000");
    hb["battery"] = json!(87);
    presence.handle_heartbeat("central.heartbeat.gps", hb, 0).unwrap();

    let response = handle_request(br#"{"method":"info","id":1}"#, &presence);
    assert_eq!(response.error, None);
    assert_eq!(response.id, Some(json!(1)));
    let result = response.result.unwrap();
    assert_eq!(result["gps"]["module"], "gps");
    assert_eq!(result["gps"]["pub"], "tcp://127.0.0.1:9000");
    assert_eq!(result["gps"]["battery"], 87);
    assert_eq!(result["gps"]["timeout"], DEFAULT_KEEPALIVE_US);
}

#[test]
fn test_unknown_method() {
    let (presence, _rx) = tracker();
    let response = handle_request(br#"{"method":"bogus","id":2}"#, &presence);
    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        json!({ "result": null, "error": "unknown method bogus", "id": 2 })
    );
}

#[test]
fn test_malformed_requests() {
    let (presence, _rx) = tracker();
    let requests: [&[u8]; 6] = [
        b"not json",
        br#"{"method":"info"}"#,
        br#"{"id":4}"#,
        b"\xff\xfe",
        br#"[1,"info"]"#,
        br#"[1,"info",{}]"#,
    ];
    for raw in requests {
        let response = handle_request(raw, &presence);
        assert_eq!(response, RpcResponse::malformed());
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({ "result": null, "error": MALFORMED_REQUEST })
        );
    }
}
