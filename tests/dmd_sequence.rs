//! DMD sequencing against the recording USB backend.

use instrument_link::drivers::dmd::{DmdCommand, FIRST_REPORT_PAYLOAD, IMAGE_CHUNK_LEN, REPORT_LEN};
use instrument_link::drivers::{Bitmap, DisplayMode, Dmd, MockDmdUsb, PanelSize, PatternSequence};
use instrument_link::runtime::HardwareRuntime;
use instrument_link::LinkError;

const PANEL: PanelSize = PanelSize {
    width: 64,
    height: 8,
};

fn stripes(phase: usize) -> Bitmap {
    let pixels: Vec<bool> = (0..512).map(|i| (i + phase) % 4 == 0).collect();
    Bitmap::from_pixels(PANEL, &pixels).unwrap()
}

fn two_patterns() -> PatternSequence {
    PatternSequence::new(
        vec![stripes(0), stripes(1)],
        vec![200_000, 200_000],
        vec![0, 0],
        vec![false, false],
        vec![1, 1],
        0,
    )
    .unwrap()
}

/// Payloads of every `command` written, continuation reports stitched back on.
fn payloads(reports: &[[u8; REPORT_LEN]], command: DmdCommand) -> Vec<(u8, Vec<u8>)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < reports.len() {
        let first = &reports[i];
        let code = u16::from_le_bytes([first[4], first[5]]);
        let len = usize::from(u16::from_le_bytes([first[2], first[3]])) - 2;
        let mut payload = first[6..].to_vec();
        let extra = len.saturating_sub(FIRST_REPORT_PAYLOAD).div_ceil(REPORT_LEN);
        for report in &reports[i + 1..i + 1 + extra] {
            payload.extend_from_slice(report);
        }
        payload.truncate(len);
        if code == command.code() {
            out.push((first[1], payload));
        }
        i += 1 + extra;
    }
    out
}

#[test]
fn test_mismatched_sequence_never_reaches_the_controller() {
    let usb = MockDmdUsb::new();
    let mut dmd = Dmd::connect(usb.clone()).unwrap();
    dmd.set_mode(DisplayMode::PatternOnTheFly).unwrap();
    let written = usb.reports().len();

    let result = PatternSequence::new(
        vec![stripes(0), stripes(1), stripes(2)],
        vec![100; 3],
        vec![0; 3],
        vec![false; 2],
        vec![0; 3],
        1,
    );
    assert!(matches!(result, Err(LinkError::Range(_))));

    let too_long = PatternSequence::new(
        vec![stripes(0)],
        vec![1 << 24],
        vec![0],
        vec![false],
        vec![0],
        1,
    );
    assert!(matches!(too_long, Err(LinkError::Range(_))));

    let other_panel = Bitmap::from_pixels(PanelSize { width: 8, height: 8 }, &[true; 64]).unwrap();
    assert!(PatternSequence::new(
        vec![stripes(0), other_panel],
        vec![100; 2],
        vec![0; 2],
        vec![false; 2],
        vec![0; 2],
        1,
    )
    .is_err());

    assert_eq!(usb.reports().len(), written);
}

#[test]
fn test_image_upload_reassembles_to_the_encoded_plane() {
    let usb = MockDmdUsb::new();
    let sequence = two_patterns();
    let mut dmd = Dmd::connect(usb.clone()).unwrap();
    dmd.set_mode(DisplayMode::PatternOnTheFly).unwrap();
    let loaded = dmd.load_sequence(&sequence).unwrap();
    assert_eq!(loaded.patterns(), 2);

    let reports = usb.reports();
    let plane = sequence.encode_plane(0);
    let setup = payloads(&reports, DmdCommand::ImageUploadSetup);
    assert_eq!(setup.len(), 1);
    assert_eq!(&setup[0].1[..2], &[0, 0]);
    assert_eq!(
        u32::from_le_bytes([setup[0].1[2], setup[0].1[3], setup[0].1[4], setup[0].1[5]]) as usize,
        plane.len()
    );

    let chunks = payloads(&reports, DmdCommand::ImageData);
    assert_eq!(chunks.len(), plane.len().div_ceil(IMAGE_CHUNK_LEN));
    let mut uploaded = Vec::new();
    for (sequence_byte, payload) in &chunks {
        assert_eq!(*sequence_byte, 0x11);
        let announced = usize::from(u16::from_le_bytes([payload[0], payload[1]]));
        assert_eq!(announced, payload.len() - 2);
        assert!(announced <= IMAGE_CHUNK_LEN);
        uploaded.extend_from_slice(&payload[2..]);
    }
    assert_eq!(uploaded, plane);
}

#[test]
fn test_lut_entries_precede_the_upload() {
    let usb = MockDmdUsb::new();
    let mut dmd = Dmd::connect(usb.clone()).unwrap();
    dmd.set_mode(DisplayMode::PatternOnTheFly).unwrap();
    let _loaded = dmd.load_sequence(&two_patterns()).unwrap();

    let commands = usb.commands();
    let lut = commands
        .iter()
        .position(|&c| c == DmdCommand::LutConfig.code())
        .unwrap();
    let setup = commands
        .iter()
        .position(|&c| c == DmdCommand::ImageUploadSetup.code())
        .unwrap();
    let last_definition = commands
        .iter()
        .rposition(|&c| c == DmdCommand::PatternDefinition.code())
        .unwrap();
    assert!(last_definition < lut && lut < setup);

    let definitions = payloads(&usb.reports(), DmdCommand::PatternDefinition);
    assert_eq!(definitions.len(), 2);
    assert_eq!(&definitions[1].1[..2], &[1, 0]);
    // 200 ms exposure, little endian on 24 bits.
    assert_eq!(&definitions[1].1[2..5], &[0x40, 0x0D, 0x03]);
}

#[test]
fn test_controller_error_after_load() {
    let usb = MockDmdUsb::new();
    let mut dmd = Dmd::connect(usb.clone()).unwrap();
    dmd.set_mode(DisplayMode::PatternOnTheFly).unwrap();
    let mut loaded = dmd.load_sequence(&two_patterns()).unwrap();
    loaded.check_errors().unwrap();

    usb.set_error_code(8);
    match loaded.check_errors() {
        Err(LinkError::BoardRejected { reply, .. }) => assert!(reply.contains("out of resource")),
        other => panic!("expected a controller error, got {other:?}"),
    }
}

#[test]
fn test_sequence_driven_on_the_hardware_runtime() {
    let runtime = HardwareRuntime::new("dmd-test", 1).unwrap();
    let usb = MockDmdUsb::new();
    let backend = usb.clone();

    let running = runtime
        .call_blocking(move || {
            let mut dmd = Dmd::connect(backend)?;
            dmd.set_mode(DisplayMode::PatternOnTheFly)?;
            let running = dmd.load_sequence(&two_patterns())?.start_sequence()?;
            Ok(running)
        })
        .unwrap();
    assert!(!running.is_paused());
    assert_eq!(running.patterns(), 2);

    let idle = runtime
        .call_blocking(move || Ok(running.stop_sequence()?))
        .unwrap();
    assert_eq!(idle.mode(), Some(DisplayMode::PatternOnTheFly));

    let starts: Vec<u8> = payloads(&usb.reports(), DmdCommand::PatternStartStop)
        .into_iter()
        .map(|(_, payload)| payload[0])
        .collect();
    // connect, load, start, stop
    assert_eq!(starts, vec![0, 0, 2, 0]);
}
