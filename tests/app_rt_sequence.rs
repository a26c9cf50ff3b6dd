//! End-to-end: three consecutive `RT_KEEP_ALIVE` sends carry strictly
//! increasing little-endian RT sequence prefixes, and are sent
//! unreliably (no ACK wait).

mod common;

use combo_ctl::app::{App, RtCommand, ServiceId};
use combo_ctl::transport::TransportCommand;

#[tokio::test]
async fn keep_alive_sends_carry_increasing_rt_sequence() {
    let (transport, sent) = common::paired_transport();
    let app = App::new(transport);

    for _ in 0..3 {
        app.send(ServiceId::RtMode, u8::from(RtCommand::KeepAlive), vec![])
            .await
            .unwrap();
    }

    let frames = sent.lock().clone();
    assert_eq!(frames.len(), 3);

    let mut seqs = Vec::new();
    for frame in &frames {
        let (command, _seq_bit, reliable, payload) = common::decode_outbound(frame);
        assert_eq!(command, TransportCommand::Data);
        assert!(!reliable, "keep-alives are not ack-retried");
        // 4-byte app header + 2-byte little-endian RT sequence prefix.
        assert_eq!(payload.len(), 6);
        assert_eq!(payload[2], u8::from(ServiceId::RtMode));
        assert_eq!(payload[3], u8::from(RtCommand::KeepAlive));
        seqs.push(u16::from_le_bytes([payload[4], payload[5]]));
    }

    assert_eq!(seqs, vec![0, 1, 2]);
}

#[tokio::test]
async fn non_rt_sends_carry_no_sequence_prefix() {
    let (transport, sent) = common::paired_transport();
    let app = App::new(transport);

    app.send(ServiceId::CommandMode, 0x01, vec![0xAB])
        .await
        .unwrap();

    let frames = sent.lock().clone();
    assert_eq!(frames.len(), 1);
    let (_, _, _, payload) = common::decode_outbound(&frames[0]);
    assert_eq!(payload, vec![1, 0, u8::from(ServiceId::CommandMode), 0x01, 0xAB]);
}
