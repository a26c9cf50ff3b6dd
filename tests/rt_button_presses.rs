//! End-to-end: short and long button presses produce the expected
//! `RT_BUTTON_STATUS` wire sequence, each carrying its own strictly
//! increasing RT sequence number from the shared [`App`] counter.

mod common;

use std::sync::Arc;
use std::time::Duration;

use combo_ctl::app::{App, ButtonCode, RtCommand, ServiceId};
use combo_ctl::rt;

fn decode_button_status(payload: &[u8]) -> (u16, u8, bool) {
    assert_eq!(payload[2], u8::from(ServiceId::RtMode));
    assert_eq!(payload[3], u8::from(RtCommand::ButtonStatus));
    let seq = u16::from_le_bytes([payload[4], payload[5]]);
    (seq, payload[6], payload[7] != 0)
}

#[tokio::test]
async fn short_press_sends_code_then_no_button_with_increasing_sequence() {
    let (transport, sent) = common::paired_transport();
    let app = App::new(transport);

    rt::press_short(&app, ButtonCode::UP).await.unwrap();

    let frames = sent.lock().clone();
    assert_eq!(frames.len(), 2);

    let (seq0, code0, flag0) = decode_button_status(&common::decode_outbound(&frames[0]).3);
    let (seq1, code1, flag1) = decode_button_status(&common::decode_outbound(&frames[1]).3);

    assert_eq!((seq0, code0, flag0), (0, ButtonCode::UP.bits(), true));
    assert_eq!((seq1, code1, flag1), (1, ButtonCode::NO_BUTTON.bits(), true));
}

#[tokio::test]
async fn long_press_repeats_until_stopped_then_releases() {
    let (transport, sent) = common::paired_transport();
    let app = App::new(transport);

    let long = rt::start_long(app.clone(), ButtonCode::DOWN).await.unwrap();
    // Let the repeater fire a couple of times before releasing.
    tokio::time::sleep(Duration::from_millis(450)).await;
    long.stop(&app).await.unwrap();

    let frames = sent.lock().clone();
    // Initial press + at least one repeat + final release.
    assert!(frames.len() >= 3, "expected initial + repeat(s) + release, got {}", frames.len());

    let decoded: Vec<_> = frames
        .iter()
        .map(|f| decode_button_status(&common::decode_outbound(f).3))
        .collect();

    assert_eq!(decoded[0], (0, ButtonCode::DOWN.bits(), true));
    for mid in &decoded[1..decoded.len() - 1] {
        assert_eq!(mid.1, ButtonCode::DOWN.bits());
        assert!(!mid.2, "repeat packets carry flag=false");
    }
    let last = decoded.last().unwrap();
    assert_eq!((last.1, last.2), (ButtonCode::NO_BUTTON.bits(), true));

    // Sequence numbers strictly increase across the whole press.
    for pair in decoded.windows(2) {
        assert!(pair[1].0 > pair[0].0);
    }
}
