use iohub::config::HubConfig;
use iohub::constants::event_type;
use iohub::datastore::TableStore;
use iohub::Hub;
use serde_json::json;

#[test]
fn saved_events_carry_session_ids() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = HubConfig::default();
    config.data_store.enable = true;
    config.data_store.directory = dir.path().to_path_buf();
    let hub = Hub::start(config).unwrap();

    let experiment_id = hub
        .call_rpc("setExperimentInfo", &[json!({ "code": "stroop", "title": "Stroop" })])
        .unwrap();
    assert_eq!(experiment_id, json!(1));
    let session_id = hub
        .call_rpc("createExperimentSessionEntry", &[json!({ "code": "s01", "name": "first" })])
        .unwrap();
    assert_eq!(session_id, json!(1));
    assert_eq!(hub.call_rpc("checkIfSessionCodeExists", &[json!("s01")]).unwrap(), json!(true));
    assert_eq!(hub.call_rpc("checkIfSessionCodeExists", &[json!("s02")]).unwrap(), json!(false));

    let exp = hub.experiment_device().unwrap();
    for text in ["fixation", "stimulus", "response"] {
        exp.rpc("sendMessage", &[json!(text)]).unwrap();
    }
    hub.dispatch_once();
    assert_eq!(hub.call_rpc("flushIODataStoreFile", &[]).unwrap(), json!(true));

    let schema = hub.registry().event_class(event_type::MESSAGE).unwrap().schema.clone();
    let saved = TableStore::read_table(dir.path(), schema).unwrap();
    assert_eq!(saved.len(), 3);
    assert!(saved.iter().all(|e| e.experiment_id == 1 && e.session_id == 1));
    let texts: Vec<String> = saved
        .iter()
        .filter_map(|e| e.get("text").and_then(|v| v.as_str().map(String::from)))
        .collect();
    assert_eq!(texts, vec!["fixation", "stimulus", "response"]);
}

#[test]
fn session_entries_need_a_data_store() {
    let hub = Hub::with_store(HubConfig::default(), None).unwrap();
    assert_eq!(
        hub.call_rpc("setExperimentInfo", &[json!({ "code": "x" })]).unwrap(),
        json!(false)
    );
    assert_eq!(
        hub.call_rpc("createExperimentSessionEntry", &[json!({ "code": "s" })]).unwrap(),
        json!(false)
    );
    assert_eq!(hub.call_rpc("flushIODataStoreFile", &[]).unwrap(), json!(false));
}
