//! Command router behavior against fake drivers.

use std::sync::Arc;

use serde_json::json;

use camnode_lib::camera::{Camera, FrameSize};
use camnode_lib::config_store::{keys, NAMESPACE};
use camnode_lib::router::Directive;
use camnode_lib::store::{KvStore, MemoryKvStore, StoredValue};
use camnode_lib::voice::VoiceCommand;
use camnode_test::{FailingStore, TestNode, Write};

#[tokio::test]
async fn led_on_keeps_brightness() {
    let node = TestNode::new();
    let mut router = node.router();
    node.actuators.clear();

    let directive = router.handle_payload(br#"{"id":7,"op":"led","val":1}"#).await;

    assert_eq!(directive, Directive::Continue);
    assert_eq!(node.single_result(), json!({"id": 7, "ok": true, "info": "LED on"}));
    assert!(router.state().led_on);
    assert_eq!(router.state().led_brightness, 128);
    assert_eq!(node.actuators.writes(), vec![Write::LedDuty(128)]);

    let messages = node.bus.messages();
    assert_eq!(messages[0].topic, "cam/esp32cam/result");
}

#[tokio::test]
async fn boot_drives_outputs_to_rest() {
    let node = TestNode::new();
    let router = node.router();

    assert_eq!(
        node.actuators.writes(),
        vec![
            Write::LedDuty(0),
            Write::RedLed(false),
            Write::ServoDuty(102),
            Write::Relay(false)
        ]
    );
    assert_eq!(router.state().servo_angle, 0);
    assert!(node.results().is_empty());
}

#[tokio::test]
async fn invalid_envelopes_are_dropped_silently() {
    let node = TestNode::new();
    let mut router = node.router();
    let before = router.state().clone();
    node.actuators.clear();

    let payloads: [&[u8]; 5] = [
        br#"{"op":"led","val":1}"#,
        br#"{"id":3,"val":1}"#,
        br#"{"id":"3","op":"led","val":1}"#,
        b"{not json",
        br#"[1,2,3]"#,
    ];
    for payload in payloads {
        assert_eq!(router.handle_payload(payload).await, Directive::Continue);
    }

    assert!(node.bus.messages().is_empty());
    assert!(node.actuators.writes().is_empty());
    assert_eq!(router.state(), &before);
}

#[tokio::test]
async fn brightness_is_clamped_and_applied_only_while_on() {
    let node = TestNode::new();
    let mut router = node.router();
    node.actuators.clear();

    router
        .handle_payload(br#"{"id":1,"op":"led_brightness","val":400}"#)
        .await;
    assert_eq!(router.state().led_brightness, 255);
    assert!(node.actuators.writes().is_empty());

    router.handle_payload(br#"{"id":2,"op":"led","val":1}"#).await;
    router
        .handle_payload(br#"{"id":3,"op":"led_brightness","val":-5}"#)
        .await;
    assert_eq!(node.actuators.last(), Some(Write::LedDuty(0)));

    let infos: Vec<_> = node.results().iter().map(|r| r["info"].clone()).collect();
    assert_eq!(
        infos,
        vec![json!("brightness set to 255"), json!("LED on"), json!("brightness set to 0")]
    );
}

#[tokio::test]
async fn intervals_report_clamped_values() {
    let node = TestNode::new();
    let mut router = node.router();

    router
        .handle_payload(br#"{"id":1,"op":"set_dht_interval","val":10}"#)
        .await;
    router
        .handle_payload(br#"{"id":2,"op":"set_status_interval","val":999999}"#)
        .await;
    router
        .handle_payload(br#"{"id":3,"op":"set_dht_interval","val":2500}"#)
        .await;

    let results = node.results();
    assert_eq!(results[0]["info"], "DHT interval set to 1000 ms");
    assert_eq!(results[1]["info"], "status interval set to 300000 ms");
    assert_eq!(results[2]["info"], "DHT interval set to 2500 ms");
    assert_eq!(router.state().intervals.dht_ms(), 2500);
    assert_eq!(router.state().intervals.status_ms(), 300_000);
}

#[tokio::test]
async fn servo_close_twice_stays_closed() {
    let node = TestNode::new();
    let mut router = node.router();

    router.handle_payload(br#"{"id":1,"op":"servo_close"}"#).await;
    assert_eq!(router.state().servo_angle, 0);
    router.handle_payload(br#"{"id":2,"op":"servo_close"}"#).await;
    assert_eq!(router.state().servo_angle, 0);

    let results = node.results();
    assert_eq!(results.len(), 2);
    for result in results {
        assert_eq!(result["ok"], true);
        assert_eq!(result["info"], "window closed (0)");
    }
}

#[tokio::test]
async fn servo_results_name_the_window_state() {
    let node = TestNode::new();
    let mut router = node.router();

    router.handle_payload(br#"{"id":1,"op":"servo","val":200}"#).await;
    router.handle_payload(br#"{"id":2,"op":"servo","val":120}"#).await;
    router.handle_payload(br#"{"id":3,"op":"servo_half"}"#).await;
    router.handle_payload(br#"{"id":4,"op":"servo_small"}"#).await;
    router.handle_payload(br#"{"id":5,"op":"servo_full"}"#).await;

    let infos: Vec<_> = node.results().iter().map(|r| r["info"].clone()).collect();
    assert_eq!(
        infos,
        vec![
            json!("window fully open (angle: 180)"),
            json!("window custom (angle: 120)"),
            json!("window half open (90)"),
            json!("window slightly open (45)"),
            json!("window fully open (180)"),
        ]
    );
    assert_eq!(node.actuators.last(), Some(Write::ServoDuty(512)));
}

#[tokio::test]
async fn fan_and_indicator_ops() {
    let node = TestNode::new();
    let mut router = node.router();

    router.handle_payload(br#"{"id":1,"op":"fan_on"}"#).await;
    assert!(router.state().relay_on);
    router.handle_payload(br#"{"id":2,"op":"relay","val":0}"#).await;
    assert!(!router.state().relay_on);
    router.handle_payload(br#"{"id":3,"op":"red_led","val":1}"#).await;
    assert!(router.state().red_led_on);

    let infos: Vec<_> = node.results().iter().map(|r| r["info"].clone()).collect();
    assert_eq!(
        infos,
        vec![json!("fan on"), json!("fan off"), json!("indicator LED on")]
    );
}

#[tokio::test]
async fn unknown_op_is_a_sensor_param_and_always_succeeds() {
    let node = TestNode::new();
    let mut router = node.router();

    router.handle_payload(br#"{"id":9,"op":"vflip","val":1}"#).await;
    router.handle_payload(br#"{"id":10,"op":"warp","val":2}"#).await;

    let results = node.results();
    assert_eq!(results[0], json!({"id": 9, "ok": true, "info": "param vflip set to 1"}));
    assert_eq!(results[1], json!({"id": 10, "ok": true, "info": "param warp set to 2"}));
    assert_eq!(
        node.camera.params(),
        vec![("vflip".to_string(), 1), ("warp".to_string(), 2)]
    );
}

#[tokio::test]
async fn framesize_is_validated() {
    let node = TestNode::new();
    let mut router = node.router();

    router.handle_payload(br#"{"id":1,"op":"framesize","val":10}"#).await;
    router.handle_payload(br#"{"id":2,"op":"framesize","val":42}"#).await;

    let results = node.results();
    assert_eq!(results[0]["info"], "frame size updated");
    assert_eq!(results[1], json!({"id": 2, "ok": false, "info": "invalid frame size"}));
    assert_eq!(node.camera.frame_size(), FrameSize::XGA);
}

#[tokio::test]
async fn set_upload_url_applies_without_restart() {
    let node = TestNode::new();
    let mut router = node.router();

    let directive = router
        .handle_payload(br#"{"id":4,"op":"set_upload_url","url":"http://backend:9000/up"}"#)
        .await;
    assert_eq!(directive, Directive::Continue);

    router.handle_payload(br#"{"id":5,"op":"get_config"}"#).await;

    let config = node.bus.on("config");
    assert_eq!(config.len(), 1);
    assert_eq!(config[0]["uploadUrl"], "http://backend:9000/up");
    assert_eq!(config[0]["mqttBroker"], "broker.emqx.io");
    assert_eq!(config[0]["vflip"], 0);

    let results = node.results();
    assert_eq!(results[0]["info"], "upload URL updated");
    assert_eq!(results[1], json!({"id": 5, "ok": true, "info": "config sent"}));
    assert_eq!(
        node.store.get(NAMESPACE, keys::UPLOAD_URL).unwrap(),
        Some(StoredValue::from("http://backend:9000/up"))
    );
}

#[tokio::test]
async fn get_config_with_id_zero_sends_no_result() {
    let node = TestNode::new();
    let mut router = node.router();

    router.handle_payload(br#"{"id":0,"op":"get_config"}"#).await;

    assert_eq!(node.bus.on("config").len(), 1);
    assert!(node.results().is_empty());
}

#[tokio::test]
async fn set_wifi_persists_then_restarts() {
    let node = TestNode::new();
    let mut router = node.router();

    let directive = router
        .handle_payload(br#"{"id":11,"op":"set_wifi","ssid":"lab","password":"hunter2"}"#)
        .await;

    assert_eq!(directive, Directive::Restart);
    assert_eq!(
        node.single_result(),
        json!({"id": 11, "ok": true, "info": "WiFi config saved, restarting"})
    );
    assert_eq!(
        node.store.get(NAMESPACE, keys::WIFI_SSID).unwrap(),
        Some(StoredValue::from("lab"))
    );
    // The running config changes only after the restart.
    assert_eq!(router.config().wifi_ssid, "camnode");
}

#[tokio::test]
async fn set_wifi_without_password_changes_nothing() {
    let store = Arc::new(MemoryKvStore::new());
    let node = TestNode::with_store(Arc::clone(&store) as Arc<dyn KvStore>);
    let mut router = node.router();

    let directive = router
        .handle_payload(br#"{"id":12,"op":"set_wifi","ssid":"lab"}"#)
        .await;

    assert_eq!(directive, Directive::Continue);
    assert_eq!(
        node.single_result(),
        json!({"id": 12, "ok": false, "info": "missing ssid or password"})
    );
    assert_eq!(store.len(NAMESPACE), 0);
}

#[tokio::test]
async fn set_mqtt_defaults_port_and_client_to_current() {
    let node = TestNode::new();
    let mut router = node.router();

    let directive = router
        .handle_payload(br#"{"id":13,"op":"set_mqtt","server":"10.0.0.2"}"#)
        .await;

    assert_eq!(directive, Directive::Restart);
    assert_eq!(
        node.store.get(NAMESPACE, keys::MQTT_SERVER).unwrap(),
        Some(StoredValue::from("10.0.0.2"))
    );
    assert_eq!(
        node.store.get(NAMESPACE, keys::MQTT_PORT).unwrap(),
        Some(StoredValue::Int(1883))
    );
    assert_eq!(
        node.store.get(NAMESPACE, keys::MQTT_CLIENT_ID).unwrap(),
        Some(StoredValue::from("esp32cam"))
    );
}

#[tokio::test]
async fn set_mqtt_rejects_bad_port_and_missing_server() {
    let node = TestNode::new();
    let mut router = node.router();

    router
        .handle_payload(br#"{"id":1,"op":"set_mqtt","server":"h","port":0}"#)
        .await;
    router.handle_payload(br#"{"id":2,"op":"set_mqtt","port":1884}"#).await;

    let results = node.results();
    assert_eq!(results[0], json!({"id": 1, "ok": false, "info": "invalid MQTT port"}));
    assert_eq!(results[1], json!({"id": 2, "ok": false, "info": "missing server"}));
    assert_eq!(node.store.get(NAMESPACE, keys::MQTT_SERVER).unwrap(), None);
}

#[tokio::test]
async fn reset_config_clears_and_restarts() {
    let store = Arc::new(MemoryKvStore::new());
    let node = TestNode::with_store(Arc::clone(&store) as Arc<dyn KvStore>)
        .with_upload_url("http://elsewhere/up");
    let mut router = node.router();
    assert_eq!(store.len(NAMESPACE), 1);

    let directive = router.handle_payload(br#"{"id":14,"op":"reset_config"}"#).await;

    assert_eq!(directive, Directive::Restart);
    assert_eq!(node.single_result()["info"], "config reset, restarting");
    assert_eq!(store.len(NAMESPACE), 0);
}

#[tokio::test]
async fn store_failure_reports_and_stays_up() {
    let node = TestNode::with_store(Arc::new(FailingStore));
    let mut router = node.router();

    let directive = router
        .handle_payload(br#"{"id":15,"op":"set_wifi","ssid":"a","password":"b"}"#)
        .await;
    assert_eq!(directive, Directive::Continue);

    let directive = router
        .handle_payload(br#"{"id":16,"op":"set_upload_url","url":"http://x/"}"#)
        .await;
    assert_eq!(directive, Directive::Continue);

    let results = node.results();
    assert_eq!(results[0], json!({"id": 15, "ok": false, "info": "failed to save config"}));
    assert_eq!(results[1], json!({"id": 16, "ok": false, "info": "failed to save config"}));
    assert_ne!(router.config().upload_url, "http://x/");
}

#[tokio::test]
async fn status_and_climate_messages() {
    let node = TestNode::new();
    let mut router = node.router();
    router.handle_payload(br#"{"id":1,"op":"fan","val":1}"#).await;

    router.publish_status();
    router.publish_climate();
    assert!(node.bus.on("dht").is_empty(), "no climate before the first sample");

    node.sensors.set_dark(true);
    router.sample_climate();
    router.publish_climate();

    let status = node.bus.on("status");
    assert_eq!(status.len(), 1);
    assert_eq!(status[0]["clientId"], "esp32cam");
    assert_eq!(status[0]["relayStatus"], true);
    assert_eq!(status[0]["uptime"], 42);
    assert_eq!(status[0]["framesize"], 8);
    assert!(status[0].get("wifiPassword").is_none());

    let climate = node.bus.on("dht");
    assert_eq!(
        climate,
        vec![json!({"clientId": "esp32cam", "temperature": 21.0, "humidity": 40.0, "lightDark": true})]
    );
}

#[tokio::test]
async fn failed_climate_read_keeps_last_value() {
    let node = TestNode::new();
    let mut router = node.router();

    router.sample_climate();
    node.sensors.set_climate(None);
    router.sample_climate();

    let climate = router.state().climate.expect("climate kept");
    assert_eq!(climate.temperature, 21.0);
}

#[tokio::test]
async fn bus_failure_does_not_stop_the_router() {
    let node = TestNode::new();
    let mut router = node.router();
    node.bus.reject_all();

    let directive = router.handle_payload(br#"{"id":1,"op":"led","val":1}"#).await;

    assert_eq!(directive, Directive::Continue);
    assert!(router.state().led_on);
    assert!(node.bus.messages().is_empty());
}

#[tokio::test]
async fn voice_commands_report_with_id_zero() {
    let node = TestNode::new();
    let mut router = node.router();

    router.handle_voice(VoiceCommand::LedMax).await;
    assert!(router.state().led_on);
    assert_eq!(router.state().led_brightness, 255);

    router.handle_voice(VoiceCommand::LedMid).await;
    assert_eq!(router.state().led_brightness, 128);

    router.handle_voice(VoiceCommand::WindowOpen).await;
    assert_eq!(router.state().servo_angle, 180);

    router.handle_voice(VoiceCommand::FanOn).await;
    router.handle_voice(VoiceCommand::RedLedOff).await;

    let results = node.results();
    let infos: Vec<_> = results.iter().map(|r| r["info"].clone()).collect();
    assert_eq!(
        infos,
        vec![
            json!("voice: LED max brightness"),
            json!("voice: LED medium brightness"),
            json!("voice: window open"),
            json!("voice: fan on"),
            json!("voice: indicator off"),
        ]
    );
    assert!(results.iter().all(|r| r["id"] == 0 && r["ok"] == true));
}

#[tokio::test]
async fn voice_capture_reports_twice() {
    let node = TestNode::new().with_upload_url("http://127.0.0.1:1/upload");
    let mut router = node.router();

    router.handle_voice(VoiceCommand::Capture).await;

    let results = node.results();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0], json!({"id": 0, "ok": true, "info": "voice: capturing"}));
    assert_eq!(results[1], json!({"id": 0, "ok": false, "info": "connection failed"}));
    assert_eq!(node.camera.outstanding(), 0);
}

#[tokio::test]
async fn op_with_escaped_control_chars_is_dropped() {
    let node = TestNode::new();
    let mut router = node.router();
    let payload = format!(r#"{{"id":9,"op":"{}","val":1}}"#, "\\u0001".repeat(64));

    let directive = router.handle_payload(payload.as_bytes()).await;

    assert_eq!(directive, Directive::Continue);
    assert!(node.bus.messages().is_empty());
    assert!(node.camera.params().is_empty());
}

#[tokio::test]
async fn every_accepted_envelope_gets_one_result() {
    let node = TestNode::new();
    let mut router = node.router();
    let longest_param = "p".repeat(64);
    let payloads = [
        format!(r#"{{"id":{},"op":"{longest_param}","val":{}}}"#, i64::MIN, i64::MIN),
        format!(r#"{{"id":{},"op":"{longest_param}","val":{}}}"#, i64::MAX, i64::MAX),
        r#"{"id":-1,"op":"servo","val":-99999999999}"#.to_string(),
        r#"{"id":2,"op":"led_brightness","val":"bright"}"#.to_string(),
        r#"{"id":3,"op":"set_status_interval","val":9223372036854775807}"#.to_string(),
        r#"{"id":4,"op":"framesize","val":255}"#.to_string(),
        r#"{"id":5,"op":"set_mqtt","server":"b","clientId":"cam#1"}"#.to_string(),
        r#"{"id":6,"op":"get_config"}"#.to_string(),
    ];

    for (n, payload) in payloads.iter().enumerate() {
        router.handle_payload(payload.as_bytes()).await;
        assert_eq!(node.results().len(), n + 1, "no single result for {payload}");
    }
    assert_eq!(
        node.results()[0]["info"],
        format!("param {longest_param} set to {}", i32::MIN)
    );
}

#[tokio::test]
async fn set_mqtt_rejects_unusable_client_id() {
    let node = TestNode::new();
    let mut router = node.router();
    let long = format!(
        r#"{{"id":1,"op":"set_mqtt","server":"b.local","clientId":"{}"}}"#,
        "c".repeat(200)
    );

    let directive = router.handle_payload(long.as_bytes()).await;
    router
        .handle_payload(br#"{"id":2,"op":"set_mqtt","server":"b.local","clientId":"cam/+"}"#)
        .await;
    router
        .handle_payload(br#"{"id":3,"op":"set_mqtt","server":"tcp://b.local"}"#)
        .await;

    assert_eq!(directive, Directive::Continue);
    let results = node.results();
    assert_eq!(results[0], json!({"id": 1, "ok": false, "info": "invalid client id"}));
    assert_eq!(results[1], json!({"id": 2, "ok": false, "info": "invalid client id"}));
    assert_eq!(results[2], json!({"id": 3, "ok": false, "info": "invalid server"}));
    assert_eq!(node.store.get(NAMESPACE, keys::MQTT_CLIENT_ID).unwrap(), None);
    assert_eq!(node.store.get(NAMESPACE, keys::MQTT_SERVER).unwrap(), None);
}

#[tokio::test]
async fn longest_client_id_still_reports_after_restart() {
    let node = TestNode::new();
    let client_id = "n".repeat(32);
    let payload = format!(
        r#"{{"id":1,"op":"set_mqtt","server":"b.local","clientId":"{client_id}"}}"#
    );
    let directive = node.router().handle_payload(payload.as_bytes()).await;
    assert_eq!(directive, Directive::Restart);
    node.bus.clear();

    let mut rebooted = node.router();
    rebooted.publish_status();
    rebooted.sample_climate();
    rebooted.publish_climate();

    assert_eq!(node.bus.on("status").len(), 1);
    assert_eq!(node.bus.on("dht").len(), 1);
    assert_eq!(
        node.bus.messages()[0].topic,
        format!("cam/{client_id}/status")
    );
}
