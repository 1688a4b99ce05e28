use iohub::config::HubConfig;
use iohub::constants::event_type;
use iohub::datastore::MemoryStore;
use iohub::logger::{LogLine, BACKLOG};
use iohub::Hub;
use serde_json::json;
use std::sync::Arc;

#[test]
fn log_lines_wait_for_a_session_then_arrive_in_order() {
    let hub = Hub::with_store(HubConfig::default(), Some(Arc::new(MemoryStore::new()))).unwrap();
    let lines = ["hub starting", "keyboard attached", "ready"];
    for (i, text) in lines.iter().enumerate() {
        BACKLOG.push(LogLine {
            time: 10.0 + i as f64,
            level: log::Level::Info,
            text: text.to_string(),
        });
    }

    // No session yet: the lines stay held.
    assert_eq!(hub.forward_log_backlog(), 0);
    assert_eq!(BACKLOG.len(), 3);

    hub.call_rpc("setExperimentInfo", &[json!({ "code": "E1" })]).unwrap();
    hub.call_rpc("createExperimentSessionEntry", &[json!({ "code": "S1" })]).unwrap();
    assert_eq!(hub.forward_log_backlog(), 3);
    assert!(BACKLOG.is_empty());
    assert_eq!(hub.forward_log_backlog(), 0);

    hub.dispatch_once();
    let logs = hub.experiment_device().unwrap().get_events(Some(event_type::LOG), true);
    let texts: Vec<String> = logs
        .iter()
        .filter_map(|e| e.get("text").and_then(|v| v.as_str().map(String::from)))
        .collect();
    assert_eq!(texts, lines);
    assert!(logs.iter().all(|e| e.session_id == 1 && e.experiment_id == 1));
    let times: Vec<f64> = logs.iter().map(|e| e.logged_time).collect();
    assert_eq!(times, vec![10.0, 11.0, 12.0]);
    assert!(logs.windows(2).all(|w| w[0].event_id < w[1].event_id));
}
