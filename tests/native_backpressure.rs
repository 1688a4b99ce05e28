use iohub::backends::keyboard::{self, KeyboardBackend};
use iohub::config::{parse_defaults, DeviceConfig, HubConfig};
use iohub::Hub;
use serde_json::{json, Value};

fn press(code: u64) -> Value {
    json!({ "event": "press", "key": "a", "scan_code": code })
}

#[tokio::test]
async fn fed_events_are_bounded_and_gated_by_reporting() {
    let hub = Hub::with_store(HubConfig::default(), None).unwrap();
    let user = json!({ "name": "kb", "event_buffer_length": 4 });
    let defaults = parse_defaults(keyboard::CLASS_NAME, keyboard::DEFAULTS).unwrap();
    let cfg = DeviceConfig::resolve(keyboard::CLASS_NAME, &defaults, &user).unwrap();
    let backend = KeyboardBackend::new(&cfg).unwrap();
    let feed = backend.feed();
    let device = hub.attach_device(keyboard::CLASS_NAME, &user, Box::new(backend)).unwrap();
    assert_eq!(hub.device("kb").unwrap().name(), "kb");

    for code in 0..10 {
        assert!(feed.send(press(code)));
    }
    let mut pump = device.message_pump().unwrap();
    pump.tick().unwrap();
    assert_eq!(device.native_len(), 4);
    assert_eq!(hub.dispatch_once(), 4);
    let codes: Vec<u64> = device
        .get_events(None, true)
        .iter()
        .filter_map(|e| e.get("scan_code").and_then(|v| v.as_u64()))
        .collect();
    assert_eq!(codes, vec![6, 7, 8, 9]);

    device.enable_reporting(false);
    assert!(!feed.send(press(10)));
    device.enable_reporting(true);
    assert!(feed.send(press(11)));

    hub.shutdown().await;
    for code in 0..1000 {
        assert!(!feed.send(press(code)));
    }
    pump.tick().unwrap();
    assert_eq!(device.native_len(), 0);
}
