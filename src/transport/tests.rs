use super::codec::{self, Attachment, Message};
use super::endpoint::{self, BIND_INTERFACE_TOKEN, Endpoint, Port};
use super::forwarder::{Injector, spawn_forwarder};
use super::message::ClientMessage;
use super::outlet::Outlet;
use super::websocket::{pull_frames, push_frames, serve_inlet, serve_outlet};
use crate::utils::{DecodeError, lock};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[test]
fn test_split_at_first_delimiter() {
    let frame = codec::encode("gps.fix", br#"{"t":"12:30"}"#);
    assert_eq!(frame, br#"gps.fix:{"t":"12:30"}"#.to_vec());

    let (topic, body) = codec::split(&frame).unwrap();
    assert_eq!(topic, "gps.fix");
    assert_eq!(body, br#"{"t":"12:30"}"#);

    // a delimiter inside the topic is indistinguishable from the boundary
    let ambiguous = Message::decode(&codec::encode("a:b", b"body")).unwrap();
    assert_eq!(ambiguous.topic, "a");
    assert_eq!(ambiguous.body, b"b:body".to_vec());
}

#[test]
fn test_empty_body_and_missing_delimiter() {
    let message = Message::decode(b"ping:").unwrap();
    assert_eq!(message, Message::new("ping", Vec::new()));
    assert!(matches!(
        codec::split(b"no delimiter"),
        Err(DecodeError::MissingDelimiter)
    ));
    assert!(matches!(codec::split(b"\xff\xfe:x"), Err(DecodeError::InvalidTopic)));
    assert_eq!(codec::topic_of(b"no delimiter"), None);
}

#[test]
fn test_plain_json_has_no_attachments() {
    assert!(!codec::has_attachments(br#"gps:{"lat":1.5}"#));
    assert!(!codec::has_attachments(b"note:Subject: hi\n\nbody"));
    assert!(codec::parse_message(br#"gps:{"lat":1.5}"#).is_err());
}

#[test]
fn test_multipart_round_trip() {
    let image = vec![0u8, 1, 2, b'\n', b'\r', b'\n', 255];
    let attachments = vec![
        Attachment::new("image.jpg", image.clone()),
        Attachment::new("notes.txt", b"line one\nline two\n".to_vec()),
    ];
    let body = codec::encode_multipart(br#"{"exposure":0.01}"#, &attachments);
    let frame = codec::encode("camera.image", &body);

    assert!(codec::has_attachments(&frame));
    let parsed = codec::parse_message(&frame).unwrap();
    assert_eq!(parsed.topic, "camera.image");
    assert_eq!(parsed.json, br#"{"exposure":0.01}"#.to_vec());
    assert_eq!(parsed.attachments, attachments);
}

#[test]
fn test_multipart_with_lf_line_endings_and_name_param() {
    let body = b"Content-Type: multipart/related; boundary=XYZ\n\n\
--XYZ\n\
Content-Type: application/json\n\
\n\
{\"a\":1}\n\
--XYZ\n\
Content-Type: image/png; name=\"dot.png\"\n\
\n\
PNG\n\
--XYZ--\n";
    let parsed = codec::parse_message(&codec::encode("t", body)).unwrap();
    assert_eq!(parsed.json, b"{\"a\":1}".to_vec());
    assert_eq!(parsed.attachments, vec![Attachment::new("dot.png", b"PNG".to_vec())]);
}

#[test]
fn test_malformed_multipart_is_a_decode_error() {
    let unterminated = b"Content-Type: multipart/mixed; boundary=B\r\n\r\n--B\r\nContent-Type: application/json\r\n\r\n{}";
    assert!(matches!(
        codec::parse_message(&codec::encode("t", unterminated)),
        Err(DecodeError::Multipart(_))
    ));

    let no_primary = b"Content-Type: multipart/mixed; boundary=\"B\"\r\n\r\n--B\r\n\
Content-Disposition: attachment; filename=\"a.bin\"\r\n\r\nxx\r\n--B--\r\n";
    assert!(codec::parse_message(&codec::encode("t", no_primary)).is_err());
}

#[test]
fn test_unsafe_attachment_names_are_rejected() {
    for name in ["../evil", "a/b", "..", ""] {
        let body = codec::encode_multipart(b"{}", &[Attachment::new(name, b"x".to_vec())]);
        assert!(
            codec::parse_message(&codec::encode("t", &body)).is_err(),
            "{name:?} should be rejected"
        );
    }
}

#[test]
fn test_endpoint_parsing() {
    let endpoint: Endpoint = "tcp://127.0.0.1:7500".parse().unwrap();
    assert_eq!(endpoint.scheme(), "tcp");
    assert_eq!(endpoint.host(), "127.0.0.1");
    assert_eq!(endpoint.port(), Port::Fixed(7500));

    let defaulted = Endpoint::parse_with_default("10.0.0.2", Some(Port::Fixed(7501))).unwrap();
    assert_eq!(defaulted.to_string(), "tcp://10.0.0.2:7501");

    let random = Endpoint::parse_with_default("ws://*:random", None).unwrap();
    assert!(random.is_random());
    assert_eq!(random.to_string(), "ws://*:random");
    assert!(random.ws_url().is_err());

    assert!("udp://host:1".parse::<Endpoint>().is_err());
    assert!("tcp://host:port".parse::<Endpoint>().is_err());
    assert!("tcp://host".parse::<Endpoint>().is_err());
    assert!("tcp://:1".parse::<Endpoint>().is_err());
}

#[test]
fn test_endpoint_templates() {
    let template = "tcp://{bindInterface}:7502";
    assert!(template.parse::<Endpoint>().is_err());

    let expanded = endpoint::expand(template, BIND_INTERFACE_TOKEN, "*");
    let endpoint: Endpoint = expanded.parse().unwrap();
    assert_eq!(endpoint.ws_url().unwrap(), "ws://127.0.0.1:7502/");
}

#[tokio::test]
async fn test_bind_resolves_random_port() {
    let (listener, resolved) = Endpoint::new("127.0.0.1", Port::Random).bind().await.unwrap();
    let Port::Fixed(port) = resolved.port() else {
        panic!("random port was not resolved");
    };
    assert_ne!(port, 0);
    assert_eq!(listener.local_addr().unwrap().port(), port);
    assert_eq!(resolved.ws_url().unwrap(), format!("ws://127.0.0.1:{port}/"));
}

#[test]
fn test_outlet_prefix_filtering() {
    let mut outlet = Outlet::new();
    let (_, mut everything) = outlet.attach("");
    let (gps, mut gps_rx) = outlet.attach("gps.");

    assert_eq!(outlet.publish(b"gps.fix:{}"), 2);
    assert_eq!(outlet.publish(b"camera:{}"), 1);
    assert_eq!(everything.try_recv().unwrap(), b"gps.fix:{}".to_vec());
    assert_eq!(everything.try_recv().unwrap(), b"camera:{}".to_vec());
    assert_eq!(gps_rx.try_recv().unwrap(), b"gps.fix:{}".to_vec());
    assert!(gps_rx.try_recv().is_err());

    outlet.unsubscribe(&gps, "gps.");
    assert_eq!(outlet.publish(b"gps.fix:{}"), 1);
    assert!(gps_rx.try_recv().is_err());
}

#[test]
fn test_outlet_drops_closed_peers() {
    let mut outlet = Outlet::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let peer = outlet.register(tx);
    outlet.subscribe(&peer, "");
    drop(rx);

    assert_eq!(outlet.publish(b"a:b"), 0);
    assert!(outlet.peers.is_empty());
}

#[test]
fn test_outlet_drops_frames_for_full_peers() {
    let mut outlet = Outlet::new();
    let (tx, mut slow) = mpsc::channel(2);
    let peer = outlet.register(tx);
    outlet.subscribe(&peer, "");
    let (_, mut tap) = outlet.attach("");

    for n in 0..5u8 {
        outlet.publish(&[b'a', b':', n]);
    }
    assert_eq!(outlet.peers[&peer].dropped, 3);
    assert_eq!(slow.try_recv().unwrap(), vec![b'a', b':', 0]);
    assert_eq!(slow.try_recv().unwrap(), vec![b'a', b':', 1]);
    assert!(slow.try_recv().is_err());
    // the slow peer does not hold back anyone else
    for n in 0..5u8 {
        assert_eq!(tap.try_recv().unwrap(), vec![b'a', b':', n]);
    }

    // once drained the peer receives again
    assert_eq!(outlet.publish(b"a:again"), 2);
    assert_eq!(slow.try_recv().unwrap(), b"a:again".to_vec());
}

#[tokio::test]
async fn test_forwarder_and_injector() {
    let outlet = Outlet::shared();
    let (_, mut tap) = lock(&outlet).attach("central.");
    let (queue, handle) = spawn_forwarder(outlet.clone());

    let injector = Injector::new(queue.clone());
    injector.inject_json("central.connect.gps", &json!({ "pub": "tcp://h:1" }));
    queue.send(b"other:x".to_vec()).unwrap();
    injector.inject("central.disconnect.gps", b"{}");

    let first = timeout(Duration::from_secs(1), tap.recv()).await.unwrap().unwrap();
    let first = Message::decode(&first).unwrap();
    assert_eq!(first.topic, "central.connect.gps");
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&first.body).unwrap(),
        json!({ "pub": "tcp://h:1" })
    );
    let second = timeout(Duration::from_secs(1), tap.recv()).await.unwrap().unwrap();
    assert_eq!(second, b"central.disconnect.gps:{}".to_vec());

    drop(injector);
    drop(queue);
    timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}

#[test]
fn test_control_frame_format() {
    let frame = serde_json::to_value(ClientMessage::Subscribe {
        prefix: "gps.".to_string(),
    })
    .unwrap();
    assert_eq!(frame, json!({ "type": "subscribe", "prefix": "gps." }));

    let parsed: ClientMessage =
        serde_json::from_str(r#"{"type":"unsubscribe","prefix":""}"#).unwrap();
    assert_eq!(
        parsed,
        ClientMessage::Unsubscribe {
            prefix: String::new()
        }
    );
}

#[tokio::test]
async fn test_push_frames_reaches_inlet() {
    let (listener, endpoint) = Endpoint::new("127.0.0.1", Port::Random).bind().await.unwrap();
    let (queue, mut inlet) = mpsc::unbounded_channel();
    let server = tokio::spawn(serve_inlet(listener, queue));

    let (frames, frames_rx) = mpsc::unbounded_channel();
    frames.send(b"a:1".to_vec()).unwrap();
    frames.send(b"b:2".to_vec()).unwrap();
    let client = tokio::spawn(push_frames(endpoint, frames_rx));

    let first = timeout(Duration::from_secs(5), inlet.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(5), inlet.recv()).await.unwrap().unwrap();
    assert_eq!(first, b"a:1".to_vec());
    assert_eq!(second, b"b:2".to_vec());

    drop(frames);
    timeout(Duration::from_secs(5), client).await.unwrap().unwrap();
    server.abort();
}

#[tokio::test]
async fn test_pull_frames_honors_prefixes() {
    let (listener, endpoint) = Endpoint::new("127.0.0.1", Port::Random).bind().await.unwrap();
    let outlet = Outlet::shared();
    let server = tokio::spawn(serve_outlet(listener, outlet.clone()));

    let (control, control_rx) = mpsc::unbounded_channel();
    let (received, mut received_rx) = mpsc::unbounded_channel();
    let client = tokio::spawn(pull_frames(
        endpoint,
        control_rx,
        || vec!["gps.".to_string()],
        move |frame| {
            let _ = received.send(frame);
        },
    ));

    // wait for the subscription to reach the outlet
    timeout(Duration::from_secs(5), async {
        while !lock(&outlet)
            .peers
            .values()
            .any(|peer| peer.prefixes.contains("gps."))
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    lock(&outlet).publish(b"camera:skip");
    lock(&outlet).publish(b"gps.fix:keep");
    let frame = timeout(Duration::from_secs(5), received_rx.recv()).await.unwrap().unwrap();
    assert_eq!(frame, b"gps.fix:keep".to_vec());

    control
        .send(ClientMessage::Unsubscribe {
            prefix: "gps.".to_string(),
        })
        .unwrap();
    timeout(Duration::from_secs(5), async {
        while lock(&outlet)
            .peers
            .values()
            .any(|peer| peer.prefixes.contains("gps."))
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(lock(&outlet).publish(b"gps.fix:late"), 0);

    drop(control);
    timeout(Duration::from_secs(5), client).await.unwrap().unwrap();
    server.abort();
}
