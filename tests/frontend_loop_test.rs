//! Frontend loop tests: scheduling, status lights, connect failures and
//! cross-equipment feedback, all against scripted transports.

use daq_frontends::config::{EquipmentDefinition, EquipmentKind, FrontendConfig};
use daq_frontends::equipment::{ArduinoEquipment, Equipment, LaudaEquipment};
use daq_frontends::frontend::Frontend;
use daq_frontends::host::{HostBus, LocalHost, OdbValue, StatusColor};
use daq_frontends::transport::MockTransport;
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

const ARDUINO: &str = "ArduinoEquipment";
const LAUDA: &str = "LaudaEquipment";

fn sensor_board(period_ms: u64) -> (Box<dyn Equipment>, MockTransport) {
    let mock = MockTransport::new("arduino");
    mock.respond("T", "21.50 *C, 1013.25 hPa, 45.20 %\r\n")
        .respond("R", "21.40 *C, 44.80 %\r\n");
    let mut board = ArduinoEquipment::new()
        .unwrap()
        .with_transport(Box::new(mock.clone()));
    board.common_mut().period_ms = period_ms;
    (Box::new(board), mock)
}

fn chiller() -> (Box<dyn Equipment>, MockTransport) {
    let mock = MockTransport::new("lauda");
    mock.respond("IN_PV_00\r\n", "21.30\r\n")
        .respond("STATUS\r\n", "0\r\n")
        .respond("IN_SP_00\r\n", "18.00\r\n")
        .respond("IN_MODE_02\r\n", "0\r\n");
    let lauda = LaudaEquipment::new().with_transport(Box::new(mock.clone()));
    (Box::new(lauda), mock)
}

#[tokio::test(start_paused = true)]
async fn polls_follow_the_period() {
    let (host, mut changes) = LocalHost::in_memory();
    let host = Arc::new(host);
    let mut frontend = Frontend::new("test_fe", host.clone());
    let (board, _mock) = sensor_board(1_000);
    frontend.add_equipment(board);
    assert_eq!(frontend.connect_all().await, 1);

    frontend
        .run(&mut changes, tokio::time::sleep(Duration::from_millis(2_500)))
        .await
        .unwrap();

    let published = host.published();
    let serials: Vec<u32> = published
        .iter()
        .map(|p| p.event.header.serial_number)
        .collect();
    assert_eq!(serials, [0, 1, 2]);
    assert!(published.iter().all(|p| p.equipment == ARDUINO && p.buffer == "SYSTEM"));
    assert_eq!(
        host.odb_get_f64("/Equipment/ArduinoEquipment/Variables/ARD0[2]"),
        Some(1013.25)
    );
}

#[tokio::test]
async fn transport_failure_turns_status_red_until_recovery() {
    let (host, _changes) = LocalHost::in_memory();
    let host = Arc::new(host);
    let mut frontend = Frontend::new("test_fe", host.clone());
    let (board, mock) = sensor_board(60_000);
    frontend.add_equipment(board);
    frontend.connect_all().await;
    assert_eq!(host.status(ARDUINO), Some(("Ok".into(), StatusColor::GreenLight)));

    mock.fail_next_write();
    frontend.poll_all().await;
    assert_eq!(
        host.status(ARDUINO),
        Some(("HW Error".into(), StatusColor::RedLight))
    );
    assert!(host.published().is_empty());
    assert_eq!(host.errors().len(), 1);

    frontend.poll_all().await;
    assert_eq!(host.status(ARDUINO), Some(("Ok".into(), StatusColor::GreenLight)));
    assert_eq!(host.published().len(), 1);
}

#[tokio::test]
async fn parse_failure_is_reported_without_status_change() {
    let (host, _changes) = LocalHost::in_memory();
    let host = Arc::new(host);
    let mut frontend = Frontend::new("test_fe", host.clone());
    let (board, mock) = sensor_board(60_000);
    frontend.add_equipment(board);
    frontend.connect_all().await;

    mock.respond_once("T", "sensor not ready\r\n");
    frontend.poll_all().await;

    assert!(host.published().is_empty());
    assert_eq!(host.errors().len(), 1);
    assert_eq!(host.status(ARDUINO), Some(("Ok".into(), StatusColor::GreenLight)));
}

#[tokio::test]
#[traced_test]
async fn failed_connect_drops_only_that_equipment() {
    let (host, _changes) = LocalHost::in_memory();
    let host = Arc::new(host);
    let mut frontend = Frontend::new("test_fe", host.clone());

    // No transport and an unusable port setting.
    host.odb_set("/Equipment/ArduinoEquipment/Settings/Serial Port", "".into())
        .unwrap();
    frontend.add_equipment(Box::new(ArduinoEquipment::new().unwrap()));
    let (lauda, _mock) = chiller();
    frontend.add_equipment(lauda);

    assert_eq!(frontend.connect_all().await, 1);
    assert_eq!(frontend.equipment_names(), [LAUDA]);
    assert_eq!(
        host.status(ARDUINO),
        Some(("HW Error".into(), StatusColor::RedLight))
    );
    // Defaults were still seeded, without replacing the explicit value.
    assert_eq!(
        host.odb_get("/Equipment/ArduinoEquipment/Settings/Serial Port"),
        Some(OdbValue::String(String::new()))
    );
    assert_eq!(
        host.odb_get_f64("/Equipment/ArduinoEquipment/Settings/Serial Speed"),
        Some(115_200.0)
    );
    assert!(host.is_watched("/Equipment/LaudaEquipment/Settings/SetPoint"));
    assert!(!host.is_watched("/Equipment/ArduinoEquipment/Settings/Serial Port"));
    assert!(logs_contain("connection failed"));
}

#[tokio::test]
async fn chiller_follows_the_sensor_board() {
    let (host, mut changes) = LocalHost::in_memory();
    let host = Arc::new(host);
    let mut frontend = Frontend::new("test_fe", host.clone());
    let (board, _board_mock) = sensor_board(60_000);
    let (lauda, lauda_mock) = chiller();
    lauda_mock.respond("OUT_SP_00_017.70\r\n", "OK\r\n");
    frontend.add_equipment(board);
    frontend.add_equipment(lauda);
    frontend.connect_all().await;

    host.odb_set("/Equipment/LaudaEquipment/Settings/Feedback", true.into())
        .unwrap();
    while let Ok(change) = changes.try_recv() {
        frontend.dispatch(&change).await;
    }
    lauda_mock.clear_written();

    // 21.5 C measured against a 20 C target: P term 0.2 * -1.5.
    frontend.poll_all().await;
    let lau0 = host
        .published()
        .into_iter()
        .find(|p| p.equipment == LAUDA)
        .unwrap();
    let recorded = lau0.event.bank("LAU0").unwrap().data()[3];
    assert!((recorded - 17.7).abs() < 1e-9);

    let change = changes.try_recv().unwrap();
    assert_eq!(change.path, "/Equipment/LaudaEquipment/Settings/SetPoint");
    frontend.dispatch(&change).await;
    assert!(lauda_mock
        .written()
        .contains(&"OUT_SP_00_017.70\r\n".to_string()));
    assert!(host.errors().is_empty());
}

#[tokio::test]
async fn configured_settings_win_over_defaults() {
    let mut settings = std::collections::BTreeMap::new();
    settings.insert(
        "Serial Port".to_string(),
        OdbValue::String("/dev/does-not-exist".into()),
    );
    settings.insert("Feedback Kp".to_string(), OdbValue::Float(1.5));
    let config = FrontendConfig {
        equipment: vec![EquipmentDefinition {
            r#type: EquipmentKind::Lauda,
            enabled: true,
            index: None,
            common: Default::default(),
            settings,
        }],
        ..FrontendConfig::default()
    };

    let (host, _changes) = LocalHost::in_memory();
    let host = Arc::new(host);
    let mut frontend = Frontend::from_config(&config, host.clone()).unwrap();
    assert_eq!(frontend.equipment_names(), [LAUDA]);

    // The port does not exist, so the chiller is dropped after seeding.
    assert_eq!(frontend.connect_all().await, 0);
    assert_eq!(
        host.odb_get_f64("/Equipment/LaudaEquipment/Settings/Feedback Kp"),
        Some(1.5)
    );
    assert_eq!(
        host.odb_get_f64("/Equipment/LaudaEquipment/Settings/Feedback Kd"),
        Some(50.0)
    );
}
