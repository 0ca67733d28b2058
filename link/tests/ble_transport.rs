//! Bluetooth transport tests against a fake GATT peripheral

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use bootlink::ble::{BluetoothOptions, BluetoothTransport, WriteMode};
use bootlink::errors::LinkError;
use bootlink::models::{DeviceCommand, DeviceResponse, LogPayload};
use bootlink::transport::{ConnectionState, DeviceTransport};

use common::{camera, eventually, FakeGatt, Recorder, Responder};

fn transport(gatt: &Arc<FakeGatt>) -> BluetoothTransport {
    BluetoothTransport::new(gatt.clone(), BluetoothOptions::default())
}

fn camera_firmware() -> Responder {
    Arc::new(|command: &Value| {
        let frames: Vec<&str> = match command["command"].as_str() {
            Some("ping") => vec![r#"{"type":"pong"}"#],
            Some("get_status") => vec![r#"{"type":"status","firmware_version":"2.1.0","uptime":42}"#],
            Some("take_photo") => vec![r#"{"type":"error","message":"camera busy"}"#],
            Some("get_image") => vec![
                r#"{"type":"image_start","filename":"boots.jpg","size":9,"total":3}"#,
                r#"{"type":"image_chunk","chunk":1,"total":3,"data":"RUZH"}"#,
                r#"{"type":"image_chunk","chunk":0,"total":3,"data":"QUJD"}"#,
                r#"{"type":"image_chunk","chunk":2,"total":3,"data":"SElK"}"#,
                r#"{"type":"image_complete","filename":"boots.jpg"}"#,
            ],
            Some("get_image_metadata") => vec![
                r#"{"type":"metadata_result","filename":"boots.jpg","metadata":{"cat":"Boots","confidence":0.93}}"#,
            ],
            Some("request_logs") => vec![
                r#"{"type":"log_chunk","chunk":0,"total":2,"data":"[\"boot ok\","}"#,
                r#"{"type":"log_chunk","chunk":1,"total":2,"data":"\"wifi up\"]"}"#,
                r#"{"type":"logs_complete","format":"json"}"#,
            ],
            _ => vec![],
        };
        frames.into_iter().map(str::to_string).collect()
    })
}

#[tokio::test]
async fn test_ping_round_trip() {
    let gatt = FakeGatt::new(camera_firmware());
    let transport = transport(&gatt);
    let recorder = Recorder::attach(&transport);

    transport.connect(&camera("BootBoots-CatCam")).await.unwrap();
    assert_eq!(transport.connection_state(), ConnectionState::Connected);
    assert_eq!(recorder.states(), vec![ConnectionState::Connecting, ConnectionState::Connected]);
    assert_eq!(transport.connected_device().unwrap().id, "BootBoots-CatCam");

    transport.send_command(&DeviceCommand::ping()).await.unwrap();
    eventually(|| recorder.count() == 1).await;
    assert_eq!(recorder.responses(), vec![DeviceResponse::Pong]);

    let writes = gatt.link().writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].mode, WriteMode::WithoutResponse);
    assert_eq!(writes[0].json(), serde_json::json!({"command": "ping"}));
}

#[tokio::test]
async fn test_acknowledged_write_fallback() {
    let gatt = FakeGatt::new(camera_firmware());
    gatt.without_response.store(false, Ordering::SeqCst);
    let transport = transport(&gatt);

    transport.connect(&camera("BootBoots-CatCam")).await.unwrap();
    transport.send_command(&DeviceCommand::ping()).await.unwrap();
    assert_eq!(gatt.link().writes()[0].mode, WriteMode::WithResponse);
}

#[tokio::test]
async fn test_chunked_image_requests_metadata() {
    let gatt = FakeGatt::new(camera_firmware());
    let transport = transport(&gatt);
    let recorder = Recorder::attach(&transport);

    transport.connect(&camera("BootBoots-CatCam")).await.unwrap();
    transport.send_command(&DeviceCommand::get_image("boots.jpg")).await.unwrap();
    eventually(|| recorder.count() == 2).await;

    let responses = recorder.responses();
    match &responses[0] {
        DeviceResponse::Image(image) => {
            assert_eq!(image.filename, "boots.jpg");
            assert_eq!(image.data_url, "data:image/jpeg;base64,QUJDRUZHSElK");
            assert_eq!(image.decode().unwrap(), b"ABCEFGHIJ".to_vec());
        }
        other => panic!("expected image, got {:?}", other),
    }
    match &responses[1] {
        DeviceResponse::ImageMetadata { filename, metadata } => {
            assert_eq!(filename, "boots.jpg");
            assert_eq!(metadata["cat"], "Boots");
        }
        other => panic!("expected metadata, got {:?}", other),
    }

    assert_eq!(gatt.link().commands(), vec!["get_image", "get_image_metadata"]);
    assert!(transport.is_idle());
}

#[tokio::test]
async fn test_large_image_out_of_order() {
    use base64::Engine as _;

    let source: Vec<u8> = (0..9000u32).map(|i| (i * 31 % 251) as u8).collect();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&source);
    assert_eq!(encoded.len(), 12000);

    // Fragment boundaries deliberately off the 4-character base64 grid
    let fragments = [
        encoded[..3999].to_string(),
        encoded[3999..8001].to_string(),
        encoded[8001..].to_string(),
    ];
    let firmware: Responder = Arc::new(move |command: &Value| match command["command"].as_str() {
        Some("get_image") => {
            let chunk = |i: usize| {
                serde_json::json!({"type": "image_chunk", "chunk": i, "total": 3, "data": fragments[i]}).to_string()
            };
            vec![
                r#"{"type":"image_start","filename":"x.jpg","size":9000,"total":3}"#.to_string(),
                chunk(2),
                chunk(0),
                chunk(1),
                r#"{"type":"image_complete","filename":"x.jpg"}"#.to_string(),
            ]
        }
        _ => vec![],
    });

    let gatt = FakeGatt::new(firmware);
    let transport = transport(&gatt);
    let recorder = Recorder::attach(&transport);

    transport.connect(&camera("BootBoots-CatCam")).await.unwrap();
    transport.send_command(&DeviceCommand::get_image("x.jpg")).await.unwrap();
    eventually(|| recorder.count() == 1).await;

    match &recorder.responses()[0] {
        DeviceResponse::Image(image) => {
            assert_eq!(image.filename, "x.jpg");
            assert_eq!(image.size, Some(9000));
            assert_eq!(image.decode().unwrap(), source);
        }
        other => panic!("expected image, got {:?}", other),
    }

    eventually(|| gatt.link().commands().len() == 2).await;
    let writes = gatt.link().writes();
    assert_eq!(
        writes[1].json(),
        serde_json::json!({"command": "get_image_metadata", "filename": "x.jpg"})
    );
}

#[tokio::test]
async fn test_json_logs_joined() {
    let gatt = FakeGatt::new(camera_firmware());
    let transport = transport(&gatt);
    let recorder = Recorder::attach(&transport);

    transport.connect(&camera("BootBoots-CatCam")).await.unwrap();
    transport.send_command(&DeviceCommand::request_logs()).await.unwrap();
    eventually(|| recorder.count() == 1).await;

    assert_eq!(
        recorder.responses()[0],
        DeviceResponse::Logs {
            logs: LogPayload::Lines(vec!["boot ok".to_string(), "wifi up".to_string()])
        }
    );
}

#[tokio::test]
async fn test_device_error_delivered_to_handlers() {
    let gatt = FakeGatt::new(camera_firmware());
    let transport = transport(&gatt);
    let recorder = Recorder::attach(&transport);

    transport.connect(&camera("BootBoots-CatCam")).await.unwrap();
    transport.send_command(&DeviceCommand::take_photo()).await.unwrap();
    eventually(|| recorder.count() == 1).await;
    assert!(recorder.responses()[0].is_error());
}

#[tokio::test]
async fn test_malformed_notification_does_not_break_stream() {
    let gatt = FakeGatt::silent();
    let transport = transport(&gatt);
    let recorder = Recorder::attach(&transport);

    transport.connect(&camera("BootBoots-CatCam")).await.unwrap();
    let link = gatt.link();
    link.notify("{garbage");
    link.notify(r#"{"type":"image_chunk","chunk":"zero"}"#);
    link.notify(r#"{"type":"pong"}"#);

    eventually(|| recorder.count() == 1).await;
    assert_eq!(recorder.responses(), vec![DeviceResponse::Pong]);
    assert_eq!(transport.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_connect_same_device_is_noop() {
    let gatt = FakeGatt::silent();
    let transport = transport(&gatt);
    let recorder = Recorder::attach(&transport);

    transport.connect(&camera("BootBoots-CatCam")).await.unwrap();
    transport.connect(&camera("BootBoots-CatCam")).await.unwrap();
    assert_eq!(gatt.opens(), 1);
    assert_eq!(recorder.states(), vec![ConnectionState::Connecting, ConnectionState::Connected]);
}

#[tokio::test]
async fn test_concurrent_connects_are_queued() {
    let gatt = FakeGatt::silent();
    let transport = Arc::new(transport(&gatt));

    let device = camera("BootBoots-CatCam");
    let (a, b) = tokio::join!(transport.connect(&device), transport.connect(&device));
    a.unwrap();
    b.unwrap();
    assert_eq!(gatt.opens(), 1);
}

#[tokio::test]
async fn test_switching_devices_disconnects_first() {
    let gatt = FakeGatt::silent();
    let transport = transport(&gatt);
    let recorder = Recorder::attach(&transport);

    transport.connect(&camera("BootBoots-CatCam")).await.unwrap();
    let first = gatt.link();
    transport.connect(&camera("BootBoots-Garage")).await.unwrap();

    assert_eq!(gatt.opens(), 2);
    eventually(|| first.closed.load(Ordering::SeqCst)).await;
    assert_eq!(transport.connected_device().unwrap().id, "BootBoots-Garage");
    assert_eq!(
        recorder.states(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
}

#[tokio::test]
async fn test_failed_connect_reverts_to_disconnected() {
    let gatt = FakeGatt::silent();
    gatt.fail.store(true, Ordering::SeqCst);
    let transport = transport(&gatt);
    let recorder = Recorder::attach(&transport);

    let err = transport.connect(&camera("BootBoots-CatCam")).await.unwrap_err();
    assert!(matches!(err, LinkError::NotFound(_)));
    assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
    assert!(transport.connected_device().is_none());
    assert!(transport.last_error().is_some());
    assert_eq!(recorder.states(), vec![ConnectionState::Connecting, ConnectionState::Disconnected]);
}

#[tokio::test]
async fn test_send_without_connection() {
    let transport = transport(&FakeGatt::silent());
    let err = transport.send_command(&DeviceCommand::ping()).await.unwrap_err();
    assert!(matches!(err, LinkError::NotConnected));
}

#[tokio::test]
async fn test_link_drop_clears_state() {
    let gatt = FakeGatt::silent();
    let transport = transport(&gatt);
    let recorder = Recorder::attach(&transport);

    transport.connect(&camera("BootBoots-CatCam")).await.unwrap();
    let link = gatt.link();
    link.notify(r#"{"type":"log_chunk","chunk":0,"total":3,"data":"partial"}"#);
    eventually(|| !transport.is_idle()).await;

    link.drop_connection();
    eventually(|| transport.connection_state() == ConnectionState::Disconnected).await;
    assert!(transport.connected_device().is_none());
    assert!(transport.is_idle());

    // Frames from the old session are ignored
    link.notify(r#"{"type":"pong"}"#);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(), 0);

    let err = transport.send_command(&DeviceCommand::ping()).await.unwrap_err();
    assert!(matches!(err, LinkError::NotConnected));
}

#[tokio::test]
async fn test_explicit_disconnect() {
    let gatt = FakeGatt::silent();
    let transport = transport(&gatt);
    let recorder = Recorder::attach(&transport);

    transport.connect(&camera("BootBoots-CatCam")).await.unwrap();
    transport.disconnect();
    assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
    assert!(transport.connected_device().is_none());
    eventually(|| gatt.link().closed.load(Ordering::SeqCst)).await;

    // A second disconnect emits nothing new
    transport.disconnect();
    assert_eq!(
        recorder.states(),
        vec![ConnectionState::Connecting, ConnectionState::Connected, ConnectionState::Disconnected]
    );
}

#[tokio::test(start_paused = true)]
async fn test_oversized_ota_is_chunked() {
    let gatt = FakeGatt::silent();
    let transport = transport(&gatt);
    transport.connect(&camera("BootBoots-CatCam")).await.unwrap();

    let url = format!("https://firmware.example.com/{}", "a".repeat(1500 - 29));
    assert_eq!(url.len(), 1500);
    transport
        .send_command(&DeviceCommand::ota_update(&url, "2.2.0"))
        .await
        .unwrap();

    let writes = gatt.link().writes();
    assert_eq!(writes.len(), 4);

    let mut joined = String::new();
    for (i, write) in writes.iter().enumerate() {
        let frame = write.json();
        assert_eq!(frame["action"], "url_chunk");
        assert_eq!(frame["chunk_index"], i as u64);
        assert_eq!(frame["total_chunks"], 4);
        assert_eq!(frame["version"], "2.2.0");
        joined.push_str(frame["chunk_data"].as_str().unwrap());
    }
    assert_eq!(joined, url);

    for pair in writes.windows(2) {
        assert!(pair[1].at - pair[0].at >= Duration::from_millis(50));
    }
}

#[tokio::test]
async fn test_query_status() {
    let gatt = FakeGatt::new(camera_firmware());
    let transport = transport(&gatt);
    let recorder = Recorder::attach(&transport);
    transport.connect(&camera("BootBoots-CatCam")).await.unwrap();

    let status = transport.query_status().await.unwrap();
    assert_eq!(status.firmware_version(), Some("2.1.0"));
    assert_eq!(status.get("uptime"), Some(&Value::from(42)));
    // Consumed by the query, not broadcast
    assert_eq!(recorder.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_query_status_timeout() {
    let gatt = FakeGatt::silent();
    let transport = transport(&gatt);
    transport.connect(&camera("BootBoots-CatCam")).await.unwrap();

    let err = transport.query_status().await.unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_query_status_device_error() {
    let gatt = FakeGatt::new(Arc::new(|command: &Value| match command["command"].as_str() {
        Some("get_status") => vec![r#"{"type":"error","message":"sensor offline"}"#.to_string()],
        _ => vec![],
    }));
    let transport = transport(&gatt);
    transport.connect(&camera("BootBoots-CatCam")).await.unwrap();

    let err = transport.query_status().await.unwrap_err();
    assert!(matches!(err, LinkError::DeviceError(ref m) if m == "sensor offline"));
}

#[tokio::test]
async fn test_initial_status_read() {
    let gatt = FakeGatt::silent();
    *gatt.status.lock().unwrap() = Some(br#"{"firmware_version":"2.0.4"}"#.to_vec());
    let transport = transport(&gatt);
    let recorder = Recorder::attach(&transport);

    transport.connect(&camera("BootBoots-CatCam")).await.unwrap();
    match recorder.responses().first() {
        Some(DeviceResponse::Status(status)) => assert_eq!(status.firmware_version(), Some("2.0.4")),
        other => panic!("expected status, got {:?}", other),
    }
}

#[tokio::test]
async fn test_handler_unregistration() {
    let gatt = FakeGatt::new(camera_firmware());
    let transport = transport(&gatt);
    let recorder = Recorder::attach(&transport);
    let extra = Recorder::default();
    let sink = extra.responses.clone();
    let id = transport.on_response(bootlink::transport::response_handler(move |r| {
        sink.lock().unwrap().push(r.clone())
    }));

    transport.connect(&camera("BootBoots-CatCam")).await.unwrap();
    transport.send_command(&DeviceCommand::ping()).await.unwrap();
    eventually(|| recorder.count() == 1).await;

    assert!(transport.off_response(id));
    transport.send_command(&DeviceCommand::ping()).await.unwrap();
    eventually(|| recorder.count() == 2).await;
    assert_eq!(extra.count(), 1);
}
