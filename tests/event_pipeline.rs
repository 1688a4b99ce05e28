use iohub::config::HubConfig;
use iohub::constants::event_type;
use iohub::device::{NativeEvent, NativeEventQueue};
use iohub::dispatcher::GlobalEventBuffer;
use iohub::eventbus::EventListener;
use iohub::registry::Registry;
use iohub::{EventRecord, Hub};
use serde_json::json;
use std::sync::Arc;

fn hub() -> Arc<Hub> {
    Hub::with_store(HubConfig::default(), None).unwrap()
}

fn message(hub_time: f64, event_id: u64) -> EventRecord {
    let registry = Registry::builtin().unwrap();
    let schema = registry.event_class(event_type::MESSAGE).unwrap().schema.clone();
    let values = schema.kind_fields().iter().map(|f| f.ty.default_value()).collect();
    let mut ev = EventRecord::new(schema, values).unwrap();
    ev.hub_time = hub_time;
    ev.event_id = event_id;
    ev
}

#[test]
fn native_queue_keeps_the_most_recent_events() {
    let queue = NativeEventQueue::new(4);
    for i in 0..6 {
        queue.push(NativeEvent {
            logged_time: i as f64,
            data: json!(i),
        });
    }
    let kept: Vec<_> = queue.drain().into_iter().map(|e| e.data).collect();
    assert_eq!(kept, vec![json!(2), json!(3), json!(4), json!(5)]);
    assert_eq!(queue.dropped(), 2);
    assert!(queue.is_empty());
}

#[test]
fn global_retrieval_sorts_by_hub_time() {
    let buffer = GlobalEventBuffer::new(16);
    for (t, id) in [(5.0, 1), (1.0, 2), (3.0, 3)] {
        buffer.handle(&message(t, id)).unwrap();
    }
    let times: Vec<f64> = buffer.take_sorted().iter().map(|e| e.hub_time).collect();
    assert_eq!(times, vec![1.0, 3.0, 5.0]);
    assert!(buffer.is_empty());
}

#[test]
fn global_buffer_drops_oldest_on_overflow() {
    let buffer = GlobalEventBuffer::new(2);
    for id in 1..=3 {
        buffer.handle(&message(id as f64, id)).unwrap();
    }
    let ids: Vec<u64> = buffer.take_sorted().iter().map(|e| e.event_id).collect();
    assert_eq!(ids, vec![2, 3]);
}

#[test]
fn event_ids_are_strictly_increasing_without_gaps() {
    let hub = hub();
    let exp = hub.experiment_device().unwrap();
    for round in 0..3 {
        for i in 0..5 {
            exp.rpc("sendMessage", &[json!(format!("{}-{}", round, i))]).unwrap();
        }
        hub.dispatch_once();
    }
    // A malformed native event is dropped without consuming an id.
    exp.push_native(json!("not an event"));
    hub.dispatch_once();
    exp.rpc("sendMessage", &[json!("last")]).unwrap();
    hub.dispatch_once();

    let ids: Vec<u64> = exp.get_events(None, true).iter().map(|e| e.event_id).collect();
    assert_eq!(ids, (1..=16).collect::<Vec<u64>>());
}

#[test]
fn per_device_order_is_preserved() {
    let hub = hub();
    let exp = hub.experiment_device().unwrap();
    for i in 0..10 {
        exp.rpc("sendMessage", &[json!(format!("m{}", i))]).unwrap();
    }
    hub.dispatch_once();
    let texts: Vec<String> = exp
        .get_events(Some(event_type::MESSAGE), true)
        .iter()
        .filter_map(|e| e.get("text").and_then(|v| v.as_str().map(String::from)))
        .collect();
    let expected: Vec<String> = (0..10).map(|i| format!("m{}", i)).collect();
    assert_eq!(texts, expected);
}

#[test]
fn polled_device_end_to_end() {
    let hub = hub();
    let device = hub
        .create_monitored_device(
            "AnalogInput",
            &json!({ "name": "daq", "event_buffer_length": 4, "device_timer": { "interval": 0.01 } }),
        )
        .unwrap()
        .unwrap();
    assert!(device.poll_interval().is_some());

    for i in 0..6 {
        device.rpc("pushNativeEvent", &[json!([i as f64])]).unwrap();
    }
    device.poll().unwrap();
    hub.dispatch_once();

    let events = device.get_events(None, true);
    assert_eq!(events.len(), 4);
    let readings: Vec<f64> = events
        .iter()
        .map(|e| e.get("AI_0").and_then(|v| v.as_f64()).unwrap())
        .collect();
    assert_eq!(readings, vec![2.0, 3.0, 4.0, 5.0]);
    assert!(events.windows(2).all(|w| w[0].event_id < w[1].event_id));
    assert!(device.get_events(None, true).is_empty());
}

#[test]
fn reporting_off_drops_native_events() {
    let hub = hub();
    let exp = hub.experiment_device().unwrap();
    assert_eq!(exp.rpc("enableEventReporting", &[json!(false)]).unwrap(), json!(true));
    exp.rpc("sendMessage", &[json!("ignored")]).unwrap();
    hub.dispatch_once();
    assert!(exp.get_events(None, true).is_empty());
    assert_eq!(exp.rpc("isReportingEvents", &[]).unwrap(), json!(false));
}
