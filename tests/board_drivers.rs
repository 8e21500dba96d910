//! End-to-end board workflows against scripted boards.

use instrument_link::acquisition::{AcquisitionConfig, AcquisitionEvent};
use instrument_link::config::{CoincidenceBoardConfig, ScanParameters};
use instrument_link::drivers::coincidence::{LegacyCounterReader, COUNTER_MAX};
use instrument_link::drivers::photodiode::{OpenLoopChannel, OpenLoopLimits};
use instrument_link::drivers::{
    CoincidenceBoard, CoincidenceCounterDriver, Counts, PhotodiodeDriver, PiezoDriver,
};
use instrument_link::exchange::ExchangeTimeouts;
use instrument_link::transport::MockTransport;
use instrument_link::LinkError;
use std::time::Duration;

fn timeouts() -> ExchangeTimeouts {
    ExchangeTimeouts::default()
}

fn coincidence_section(port: &str, sampling_period_ms: u32, legacy_binary: bool) -> CoincidenceBoardConfig {
    CoincidenceBoardConfig {
        port: port.to_string(),
        baud_rate: 115_200,
        sampling_period_ms,
        legacy_binary,
    }
}

#[tokio::test]
async fn test_piezo_handshake_and_z_scan() {
    let board = MockTransport::new("mock-piezo")
        .respond("_C!", "_C1!")
        .respond("_V!", "_V1.2!")
        .respond_prefix("_M", "_M1!")
        .respond_once("_G!", "_G 1.  0!")
        .respond_once("_G!", "_G 1.100!")
        .respond_once("_G!", "_G 1.200!");
    let piezo = PiezoDriver::new(Box::new(board.clone()), timeouts());

    assert_eq!(piezo.handshake().await.unwrap(), "1.2");
    board.clear_writes();

    let scan = ScanParameters::new(1.0, 1.4, 100.0);
    let mut readbacks = Vec::new();
    for point in scan.z_positions().unwrap() {
        readbacks.push(piezo.move_to(point.um(), point.nm()).await.unwrap());
    }

    assert_eq!(readbacks.len(), 3);
    assert_eq!(
        board.written_text(),
        vec!["_M 1.  0!", "_G!", "_M 1.100!", "_G!", "_M 1.200!", "_G!"]
    );
    assert_eq!(piezo.state().last_position, readbacks.last().copied());
    assert_eq!(piezo.state().version.as_deref(), Some("1.2"));
}

#[tokio::test]
async fn test_piezo_refused_move_and_range() {
    let board = MockTransport::new("mock-piezo").respond("_M 9.999!", "_M0!");
    let piezo = PiezoDriver::new(Box::new(board.clone()), timeouts());

    assert!(matches!(
        piezo.move_to(9, 999).await,
        Err(LinkError::BoardRejected { .. })
    ));
    assert!(matches!(piezo.move_to(11, 0).await, Err(LinkError::Range(_))));
    assert!(matches!(piezo.move_to(1, 1000).await, Err(LinkError::Range(_))));
    // Only the refused move reached the wire.
    assert_eq!(board.writes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_coincidence_period_counts_and_stop() {
    let board = MockTransport::new("mock-coinc")
        .respond("!V?", "!V:HOM-2;")
        .respond("!T:400?", "!T:400;")
        .respond_after("!D?", "!D:1000:900:800:50:40:2;", Duration::from_millis(400))
        .respond("!S?", "!E;");
    let counter = CoincidenceCounterDriver::new(Box::new(board.clone()), timeouts());

    assert_eq!(counter.get_version().await.unwrap(), "HOM-2");
    assert_eq!(counter.set_sampling_period_ms(400).await.unwrap(), 400);
    assert_eq!(counter.state().sampling_period_ms, Some(400));

    // The reply lands after the 400 ms period, past the plain readout deadline.
    let counts = counter.get_counts().await.unwrap();
    assert_eq!(
        counts,
        Counts {
            a: 1000,
            b: 900,
            c: 800,
            ab: 50,
            ac: 40,
            abc: 2,
        }
    );
    assert!((counts.g2() - 1.0).abs() < 1e-12);
    assert_eq!(counter.state().last_counts, Some(counts));

    counter.stop_acquisition().await.unwrap();
}

#[tokio::test]
async fn test_coincidence_period_out_of_range_writes_nothing() {
    let board = MockTransport::new("mock-coinc");
    let counter = CoincidenceCounterDriver::new(Box::new(board.clone()), timeouts());

    assert!(matches!(
        counter.set_sampling_period_ms(0).await,
        Err(LinkError::Range(_))
    ));
    assert!(matches!(
        counter.set_sampling_period_ms(60_001).await,
        Err(LinkError::Range(_))
    ));
    assert!(board.writes().is_empty());
}

#[tokio::test]
async fn test_large_counts_survive_ascii_but_not_legacy_records() {
    let big = COUNTER_MAX + 1;
    let reply = format!("!D:{big}:1:1:1:1:1;");
    let board = MockTransport::new("mock-coinc").respond("!D?", reply);
    let counter = CoincidenceCounterDriver::new(Box::new(board.clone()), timeouts());

    let counts = counter.get_counts().await.unwrap();
    assert_eq!(counts.a, big);
    assert!(counts.exceeds_legacy_ceiling());
    assert!(matches!(
        counts.encode_legacy_record(),
        Err(LinkError::Range(_))
    ));
}

#[tokio::test]
async fn test_legacy_reader_reassembles_split_records() {
    let counts = Counts {
        a: 70_000,
        b: 2,
        c: 3,
        ab: 4,
        ac: 5,
        abc: 6,
    };
    let record = counts.encode_legacy_record().unwrap();
    let board = MockTransport::new("mock-legacy");
    let reader = LegacyCounterReader::new(Box::new(board.clone()), timeouts());

    board.push_rx(&record[..7]);
    board.push_rx(&record[7..]);
    assert_eq!(reader.read_counts().await.unwrap(), counts);
    assert_eq!(reader.session().state(), Some(counts));
}

#[tokio::test]
async fn test_photodiode_open_loop_run() {
    let board = MockTransport::new("mock-pid")
        .respond("C", "C\r\n")
        .respond("M_0_0_!\r\n", "M_0_0_0.01_0.02_!")
        .respond("S_-20_20_-10_10_5000_1_!\r\n", "S_OK!\r\n")
        .respond("F_!\r\n", "F_1_!")
        .respond("T_X_0_!\r\n", "T_X_0_0.5_!")
        .respond("T_Y_0_!\r\n", "T_Y_0_-0.5_!")
        .respond("T_S_0_!\r\n", "T_S_0_2.25_!")
        .respond("A_!\r\n", "A_0.01_0.02_!");
    let pid = PhotodiodeDriver::new(Box::new(board.clone()), timeouts());

    assert!(pid.check_connection().await.unwrap());
    assert_eq!(pid.set_scan_xy(0, 0).await.unwrap(), (0.01, 0.02));

    pid.set_open_loop_limits(
        OpenLoopLimits {
            x_min: -20,
            x_max: 20,
            y_min: -10,
            y_max: 10,
        },
        5000,
        1,
    )
    .unwrap();
    pid.start_open_loop_step().await.unwrap();
    assert!(pid.is_step_over().await.unwrap());

    let data = pid.open_loop_data().await.unwrap();
    assert_eq!((data.x[0], data.y[0], data.s[0]), (0.5, -0.5, 2.25));
    assert_eq!(
        pid.open_loop_sample(OpenLoopChannel::S, 0).await.unwrap(),
        2.25
    );

    pid.reset_open_loop_step().await.unwrap();
    pid.send_stop().await.unwrap();
    assert_eq!(pid.read_xy().await.unwrap(), (0.01, 0.02));

    let tail: Vec<_> = board.written_text().into_iter().rev().take(3).collect();
    assert_eq!(tail, vec!["A_!\r\n", "O_!\r\n", "R_!\r\n"]);
}

#[tokio::test]
async fn test_coincidence_section_sets_the_period() {
    let board = MockTransport::new("mock-coinc")
        .respond("!V?", "!V:HOM-2;")
        .respond("!T:250?", "!T:250;")
        .respond("!D?", "!D:10:9:8:3:2:1;");
    let section = coincidence_section("mock-coinc", 250, false);

    let counter = CoincidenceBoard::from_transport(Box::new(board.clone()), &section, timeouts())
        .await
        .unwrap();
    let CoincidenceBoard::Firmware(driver) = &counter else {
        panic!("expected the ASCII firmware driver");
    };
    assert_eq!(driver.state().sampling_period_ms, Some(250));
    assert_eq!(driver.state().version.as_deref(), Some("HOM-2"));
    assert_eq!(board.written_text(), vec!["!V?", "!T:250?"]);

    assert_eq!(counter.read_counts().await.unwrap().abc, 1);
}

#[tokio::test(start_paused = true)]
async fn test_legacy_section_streams_binary_records() {
    let counts = Counts {
        a: 500,
        b: 400,
        c: 300,
        ab: 20,
        ac: 10,
        abc: 1,
    };
    let board = MockTransport::new("mock-legacy");
    let section = coincidence_section("mock-legacy", 250, true);

    let counter = CoincidenceBoard::from_transport(Box::new(board.clone()), &section, timeouts())
        .await
        .unwrap();
    assert!(matches!(counter, CoincidenceBoard::Legacy(_)));

    board.push_rx(counts.encode_legacy_record().unwrap());
    let config = AcquisitionConfig {
        owner: "counter-display".to_string(),
        ..AcquisitionConfig::default()
    };
    let (handle, mut stream) = counter.start_acquisition(config).unwrap();
    match stream.next().await {
        Some(AcquisitionEvent::Sample(sample)) => assert_eq!(sample.value, counts),
        other => panic!("expected a sample, got {other:?}"),
    }
    assert_eq!(counter.status().holder().as_deref(), Some("counter-display"));
    handle.stop().await.unwrap();

    // Legacy boards are never written to.
    assert!(board.writes().is_empty());
}

#[cfg(feature = "instrument_serial")]
#[tokio::test]
async fn test_configured_port_is_the_one_opened() {
    use instrument_link::config::SerialBoardConfig;
    use instrument_link::transport::PortClaim;

    let _held = PortClaim::acquire("/dev/ttyBENCH-piezo").unwrap();
    let section = SerialBoardConfig {
        port: "/dev/ttyBENCH-piezo".to_string(),
        baud_rate: 57_600,
    };
    match PiezoDriver::connect_with(&section, timeouts()).await {
        Err(LinkError::Connect { port, .. }) => assert_eq!(port, "/dev/ttyBENCH-piezo"),
        other => panic!("expected the claimed port to be refused, got {other:?}"),
    }

    let _held = PortClaim::acquire("/dev/ttyBENCH-coinc").unwrap();
    let section = coincidence_section("/dev/ttyBENCH-coinc", 250, false);
    match CoincidenceBoard::connect_with(&section, timeouts()).await {
        Err(LinkError::Connect { port, .. }) => assert_eq!(port, "/dev/ttyBENCH-coinc"),
        other => panic!("expected the claimed port to be refused, got {other:?}"),
    }
}
