use iohub::config::HubConfig;
use iohub::constants::event_type;
use iohub::error::ListenerError;
use iohub::filtered_listener::FilteredListener;
use iohub::{EventListener, EventRecord, Hub};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Failing;

impl EventListener for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn handle(&self, _event: &EventRecord) -> Result<(), ListenerError> {
        Err(ListenerError::new("failing", "always fails"))
    }
}

#[derive(Default)]
struct Counter(AtomicUsize);

impl EventListener for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    fn handle(&self, _event: &EventRecord) -> Result<(), ListenerError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn failing_listener_does_not_block_later_listeners() {
    let hub = Hub::with_store(HubConfig::default(), None).unwrap();
    let exp = hub.experiment_device().unwrap();
    let counter = Arc::new(Counter::default());
    exp.add_listener_all(Arc::new(Failing));
    exp.add_listener_all(counter.clone());

    exp.rpc("sendMessage", &[json!("one")]).unwrap();
    exp.rpc("sendMessage", &[json!("two")]).unwrap();
    hub.dispatch_once();

    assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    // The device buffer and the global buffer still got both events.
    assert_eq!(exp.get_events(Some(event_type::MESSAGE), true).len(), 2);
    assert_eq!(hub.global_buffer().take_sorted().len(), 2);
}

#[test]
fn failing_listener_stays_isolated_across_ticks() {
    let hub = Hub::with_store(HubConfig::default(), None).unwrap();
    let exp = hub.experiment_device().unwrap();
    let before = Arc::new(Counter::default());
    let after = Arc::new(Counter::default());
    exp.add_listener_all(before.clone());
    exp.add_listener_all(Arc::new(Failing));
    exp.add_listener_all(after.clone());

    for tick in 1..=3 {
        exp.rpc("sendMessage", &[json!(format!("tick {}", tick))]).unwrap();
        exp.rpc("sendMessage", &[json!("again")]).unwrap();
        assert_eq!(hub.dispatch_once(), 2);
        assert_eq!(before.0.load(Ordering::SeqCst), 2 * tick);
        assert_eq!(after.0.load(Ordering::SeqCst), 2 * tick);
    }
    assert_eq!(hub.global_buffer().take_sorted().len(), 6);
}

#[test]
fn listeners_only_see_their_event_type() {
    let hub = Hub::with_store(HubConfig::default(), None).unwrap();
    let exp = hub.experiment_device().unwrap();
    let logs = Arc::new(Counter::default());
    exp.add_listener(event_type::LOG, logs.clone()).unwrap();

    exp.rpc("sendMessage", &[json!("not a log line")]).unwrap();
    hub.dispatch_once();

    assert_eq!(logs.0.load(Ordering::SeqCst), 0);
}

#[test]
fn filtered_listener_sees_only_matching_events() {
    let hub = Hub::with_store(HubConfig::default(), None).unwrap();
    let exp = hub.experiment_device().unwrap();
    let trials = Arc::new(Counter::default());
    let filter = FilteredListener::new(
        |e: &EventRecord| {
            e.get("text")
                .and_then(|v| v.as_str().map(|t| t.starts_with("trial")))
                .unwrap_or(false)
        },
        trials.clone(),
    );
    exp.add_listener(event_type::MESSAGE, Arc::new(filter)).unwrap();

    for text in ["trial 1", "break", "trial 2"] {
        exp.rpc("sendMessage", &[json!(text)]).unwrap();
    }
    hub.dispatch_once();

    assert_eq!(trials.0.load(Ordering::SeqCst), 2);
}
