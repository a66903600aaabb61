//! Operator console and I-V table tests.

use daq_frontends::frontend::run_console;
use daq_frontends::host::{HostBus, LocalHost};
use daq_frontends::ivcurve::{read_iv_table, run_sweep, write_iv_table, IvSweepConfig};
use tokio::io::BufReader;
use tokio_test::io::Builder;

#[tokio::test]
async fn console_session_edits_the_tree() {
    let (host, mut changes) = LocalHost::in_memory();
    host.watch("/Equipment/LaudaEquipment/Settings");

    let input = Builder::new()
        .read(b"set /Equipment/LaudaEquipment/Settings/SetPoint 19.5\n")
        .read(b"get /Equipment/LaudaEquipment/Settings/SetPoint\n")
        .read(b"get /Nowhere\n")
        .read(b"\n")
        .read(b"quit\n")
        .build();
    let output = Builder::new()
        .write(b"/Equipment/LaudaEquipment/Settings/SetPoint = 19.5\n")
        .write(b"19.5\n")
        .write(b"/Nowhere: not found\n")
        .build();

    run_console(&host, BufReader::new(input), output).await.unwrap();

    // Console writes are ordinary writes: watchers are notified.
    let change = changes.try_recv().unwrap();
    assert_eq!(change.path, "/Equipment/LaudaEquipment/Settings/SetPoint");
    assert_eq!(change.value.as_f64(), Some(19.5));
}

#[tokio::test(start_paused = true)]
async fn sweep_results_survive_a_table_round_trip() {
    let (host, _changes) = LocalHost::in_memory();
    host.odb_set("/Equipment/caen_hv/Variables/VM00", vec![30.1].into())
        .unwrap();
    host.odb_set("/Equipment/caen_hv/Variables/IM00", vec![0.002].into())
        .unwrap();

    let config = IvSweepConfig {
        start: 30.0,
        end: 30.5,
        step: 0.25,
        settle_ms: 1_000,
        ..IvSweepConfig::default()
    };
    let points = run_sweep(&host, &config).await.unwrap();
    assert_eq!(points.len(), 2);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("iv.txt");
    write_iv_table(&path, &points).unwrap();
    assert_eq!(read_iv_table(&path).unwrap(), points);
}
