//! End-to-end scenarios driving a full [`DiagnosticCore`] over simulated
//! link frames, one per the six worked examples.

use std::collections::VecDeque;

use uds_ecu_server::channel::{ChannelError, IsoTpSettings, LinkFrame, SendOutcome};
use uds_ecu_server::config::{DataIdentifier, DiagnosticConfig, DtcBroadcastConfig, SessionConfig};
use uds_ecu_server::dtc::DtcStoreConfig;
use uds_ecu_server::security::{SecurityLevel, SecurityLevelConfig};
use uds_ecu_server::session::{Session, SessionTiming};
use uds_ecu_server::{channel::FrameSink, channel::FrameSource, DiagnosticCore};

struct LoopbackSink(VecDeque<LinkFrame>);
impl FrameSink for LoopbackSink {
    fn send_frame(&mut self, frame: &LinkFrame) -> Result<SendOutcome, ChannelError> {
        self.0.push_back(frame.clone());
        Ok(SendOutcome::Ok)
    }
}

struct QueueSource(VecDeque<LinkFrame>);
impl FrameSource for QueueSource {
    fn poll_frame(&mut self) -> Option<LinkFrame> {
        self.0.pop_front()
    }
}

const VIN: &[u8; 17] = b"SAMPLE12345678901";

fn config() -> DiagnosticConfig {
    DiagnosticConfig {
        session_timing: vec![
            SessionConfig { session: Session::Default, timing: SessionTiming::default() },
            SessionConfig {
                session: Session::Extended,
                timing: SessionTiming { p2_ms: 50, p2_star_ms: 5000, s3_ms: 5000, requires_security: false },
            },
        ],
        security_levels: vec![SecurityLevelConfig {
            level: SecurityLevel::Level(1),
            max_attempts: 3,
            lockout_delay_ms: 10_000,
            seed_fn: Box::new(|_| vec![0xAA, 0xBB, 0xCC, 0xDD]),
            key_fn: Box::new(|_, seed: &[u8]| seed.to_vec()),
        }],
        data_identifiers: vec![DataIdentifier {
            did: 0xF190,
            length: VIN.len(),
            read_level: SecurityLevel::Locked,
            write_level: None,
            read_fn: Box::new(|| VIN.to_vec()),
            write_fn: None,
        }],
        routines: vec![],
        memory_regions: vec![],
        isotp: IsoTpSettings {
            rx_id: 0x7E0,
            tx_id: 0x7E8,
            block_size: 0,
            stmin: 0,
            rx_timeout_ms: 1000,
            tx_timeout_ms: 1000,
            link_mtu: 8,
            pad_frames: false,
        },
        dtc: DtcBroadcastConfig {
            store: DtcStoreConfig::default(),
            broadcast_interval_ms: 1000,
        },
        poll_interval_ms: 10,
    }
}

fn request(data: &[u8]) -> QueueSource {
    QueueSource(VecDeque::from([LinkFrame::new(0x7E0, data)]))
}

/// §8 scenario 1: session change to extended.
#[test]
fn session_change_to_extended() {
    let mut core = DiagnosticCore::new(config(), 0).unwrap();
    let mut sink = LoopbackSink(VecDeque::new());
    core.process(0, &mut request(&[0x02, 0x10, 0x03]), &mut sink);

    let resp = sink.0.pop_front().unwrap();
    assert_eq!(resp.id, 0x7E8);
    assert_eq!(resp.data, vec![0x06, 0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]);
    assert_eq!(core.active_session(), Session::Extended);
}

/// §8 scenario 2: TesterPresent with the suppress-positive-response bit set.
#[test]
fn tester_present_suppressed() {
    let mut core = DiagnosticCore::new(config(), 0).unwrap();
    let mut sink = LoopbackSink(VecDeque::new());
    core.process(0, &mut request(&[0x02, 0x3E, 0x80]), &mut sink);
    assert!(sink.0.is_empty());
}

/// §8 scenario 3: SecurityAccess seed/key, two wrong keys then the correct one.
///
/// The injected key function treats the seed itself as the expected key, so
/// "correct" here means echoing back the seed this manager always draws.
#[test]
fn security_access_wrong_twice_then_correct() {
    let mut core = DiagnosticCore::new(config(), 0).unwrap();
    let mut sink = LoopbackSink(VecDeque::new());

    core.process(0, &mut request(&[0x02, 0x27, 0x01]), &mut sink);
    let resp = sink.0.pop_front().unwrap();
    assert_eq!(resp.data, vec![0x06, 0x67, 0x01, 0xAA, 0xBB, 0xCC, 0xDD]);

    for _ in 0..2 {
        core.process(0, &mut request(&[0x06, 0x27, 0x02, 0x00, 0x00, 0x00, 0x00]), &mut sink);
        let resp = sink.0.pop_front().unwrap();
        assert_eq!(resp.data, vec![0x03, 0x7F, 0x27, 0x35]); // InvalidKey
    }
    assert_eq!(core.security_level(), SecurityLevel::Locked);

    // A wrong key does not burn the pending seed, so the tester can retry
    // against it directly rather than requesting a fresh one.
    core.process(0, &mut request(&[0x06, 0x27, 0x02, 0xAA, 0xBB, 0xCC, 0xDD]), &mut sink);
    let resp = sink.0.pop_front().unwrap();
    assert_eq!(resp.data, vec![0x02, 0x67, 0x02]);
    assert_eq!(core.security_level(), SecurityLevel::Level(1));
}

/// A level that locks out after `max_attempts` wrong keys must actually
/// recover once real elapsed time clears `lockout_delay_ms` — exercising
/// the real process-loop clock rather than a stand-in value.
#[test]
fn security_lockout_then_recovery_after_real_time_elapses() {
    let mut core = DiagnosticCore::new(config(), 0).unwrap();
    let mut sink = LoopbackSink(VecDeque::new());

    core.process(0, &mut request(&[0x02, 0x27, 0x01]), &mut sink);
    sink.0.pop_front().unwrap();

    for _ in 0..3 {
        core.process(0, &mut request(&[0x06, 0x27, 0x02, 0x00, 0x00, 0x00, 0x00]), &mut sink);
        sink.0.pop_front().unwrap();
    }
    assert_eq!(core.security_level(), SecurityLevel::Locked);

    // Still within the lockout window.
    core.process(10, &mut request(&[0x02, 0x27, 0x01]), &mut sink);
    let resp = sink.0.pop_front().unwrap();
    assert_eq!(resp.data, vec![0x03, 0x7F, 0x27, 0x37]);

    // Real time has advanced past lockout_delay_ms (10_000 ms): recovers.
    core.process(10_000, &mut request(&[0x02, 0x27, 0x01]), &mut sink);
    let resp = sink.0.pop_front().unwrap();
    assert_eq!(resp.data, vec![0x06, 0x67, 0x01, 0xAA, 0xBB, 0xCC, 0xDD]);

    core.process(10_001, &mut request(&[0x06, 0x27, 0x02, 0xAA, 0xBB, 0xCC, 0xDD]), &mut sink);
    let resp = sink.0.pop_front().unwrap();
    assert_eq!(resp.data, vec![0x02, 0x67, 0x02]);
    assert_eq!(core.security_level(), SecurityLevel::Level(1));
}

/// §8 scenario 4: multi-frame ReadDataByIdentifier of a 17-byte VIN.
///
/// The worked example in the specification's hex listing carries one extra
/// byte per frame line versus standard ISO-TP classic-frame chunking (FF: 6
/// payload bytes, CF: 7); every other scenario in the same table uses
/// unpadded classic frames consistently with that chunking, so this test
/// follows the standard split the engine actually implements rather than
/// the inconsistent byte count in that one example.
#[test]
fn multi_frame_read_vin() {
    let mut core = DiagnosticCore::new(config(), 0).unwrap();
    let mut sink = LoopbackSink(VecDeque::new());

    core.process(0, &mut request(&[0x03, 0x22, 0xF1, 0x90]), &mut sink);
    let ff = sink.0.pop_front().unwrap();
    assert_eq!(ff.id, 0x7E8);
    assert_eq!(ff.data[0] & 0xF0, 0x10);
    assert_eq!(((ff.data[0] & 0x0F) as usize) << 8 | ff.data[1] as usize, 20);
    assert_eq!(&ff.data[2..8], &[0x62, 0xF1, 0x90, b'S', b'A', b'M']);

    // The flow-control frame both arms the sender and is itself processed in
    // the same `process()` call that pumps the first consecutive frame.
    let mut fc = QueueSource(VecDeque::from([LinkFrame::new(0x7E8, &[0x30, 0x00, 0x00])]));
    core.process(1, &mut fc, &mut sink);
    let cf1 = sink.0.pop_front().unwrap();
    assert_eq!(cf1.data[0], 0x21);
    assert_eq!(&cf1.data[1..8], &VIN[3..10]);

    core.process(2, &mut QueueSource(VecDeque::new()), &mut sink);
    let cf2 = sink.0.pop_front().unwrap();
    assert_eq!(cf2.data[0], 0x22);
    assert_eq!(&cf2.data[1..8], &VIN[10..17]);

    assert!(sink.0.is_empty());
}

/// §8 scenario 5: unknown service.
#[test]
fn unknown_service() {
    let mut core = DiagnosticCore::new(config(), 0).unwrap();
    let mut sink = LoopbackSink(VecDeque::new());
    core.process(0, &mut request(&[0x02, 0x55, 0x00]), &mut sink);
    let resp = sink.0.pop_front().unwrap();
    assert_eq!(resp.data, vec![0x03, 0x7F, 0x55, 0x11]);
}

/// §8 scenario 6: clear DTCs, then read by status mask and see nothing.
#[test]
fn clear_dtcs_then_read_is_empty() {
    let mut core = DiagnosticCore::new(config(), 0).unwrap();
    let mut sink = LoopbackSink(VecDeque::new());

    core.process(0, &mut request(&[0x04, 0x14, 0xFF, 0xFF, 0xFF]), &mut sink);
    let resp = sink.0.pop_front().unwrap();
    assert_eq!(resp.data, vec![0x01, 0x54]);

    core.process(0, &mut request(&[0x03, 0x19, 0x02, 0xFF]), &mut sink);
    let resp = sink.0.pop_front().unwrap();
    assert_eq!(resp.data, vec![0x03, 0x59, 0x02, 0xFF]);
}
