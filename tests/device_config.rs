use iohub::config::HubConfig;
use iohub::error::{ConfigurationError, HubError};
use iohub::{ErrorKind, Hub};
use serde_json::json;
use std::sync::Arc;

fn hub() -> Arc<Hub> {
    Hub::with_store(HubConfig::default(), None).unwrap()
}

fn config_error(result: Result<Option<Arc<iohub::Device>>, HubError>) -> ConfigurationError {
    match result {
        Err(HubError::Configuration(e)) => e,
        Err(other) => panic!("expected a configuration error, got {}", other),
        Ok(_) => panic!("expected a configuration error"),
    }
}

#[test]
fn user_settings_merge_over_class_defaults() {
    let hub = hub();
    let pad = hub
        .create_monitored_device(
            "GamePad",
            &json!({ "name": "pad", "device_timer": { "interval": 0.02 }, "extra": { "rumble": true } }),
        )
        .unwrap()
        .unwrap();
    let cfg = pad.rpc("getConfiguration", &[]).unwrap();
    assert_eq!(cfg["name"], "pad");
    assert_eq!(cfg["device_timer"]["interval"], json!(0.02));
    assert_eq!(cfg["extra"]["rumble"], json!(true));
    // Untouched defaults survive.
    assert_eq!(cfg["enable"], json!(true));
    assert_eq!(cfg["device_number"], json!(0));
}

#[test]
fn null_keeps_the_default() {
    let hub = hub();
    let daq = hub
        .create_monitored_device("AnalogInput", &json!({ "name": "daq", "event_buffer_length": null }))
        .unwrap()
        .unwrap();
    let cfg = daq.rpc("getConfiguration", &[]).unwrap();
    assert!(cfg["event_buffer_length"].as_u64().is_some());
}

#[test]
fn integer_is_accepted_where_a_float_is_expected() {
    let hub = hub();
    let daq = hub
        .create_monitored_device("AnalogInput", &json!({ "name": "daq", "device_timer": { "interval": 1 } }))
        .unwrap()
        .unwrap();
    assert_eq!(daq.poll_interval(), Some(std::time::Duration::from_secs(1)));
}

#[test]
fn bad_settings_are_rejected() {
    let hub = hub();
    assert!(matches!(
        config_error(hub.create_monitored_device("GamePad", &json!({ "name": "p", "colour": "red" }))),
        ConfigurationError::UnknownKey { .. }
    ));
    assert!(matches!(
        config_error(hub.create_monitored_device("GamePad", &json!({ "name": "p", "enable": "yes" }))),
        ConfigurationError::TypeMismatch { .. }
    ));
    assert!(matches!(
        config_error(hub.create_monitored_device("GamePad", &json!({ "name": "p", "device_number": 7 }))),
        ConfigurationError::OutOfRange { .. }
    ));
    assert!(matches!(
        config_error(hub.create_monitored_device(
            "AnalogInput",
            &json!({ "name": "a", "runtime_settings": { "channel_count": 12 } })
        )),
        ConfigurationError::OutOfRange { .. }
    ));
    // Nothing half-built was left behind.
    assert_eq!(hub.device_names(), vec!["experiment".to_string()]);
}

#[test]
fn disabled_devices_are_not_created() {
    let hub = hub();
    let created = hub
        .create_monitored_device("Mouse", &json!({ "name": "m", "enable": false }))
        .unwrap();
    assert!(created.is_none());
    assert!(hub.device("m").is_none());
}

#[test]
fn unknown_class_is_a_registration_error() {
    let hub = hub();
    let err = hub.create_monitored_device("Theremin", &json!({})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Registration);
}
