// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use hex_literal::hex;
use obex_opp_rs::{
    models::{
        header::{HeaderSet, ObexHeader},
        packet::frame,
    },
    session::events::OppEvent,
};

use crate::unit_tests::Rig;

const CONNECT: [u8; 7] = hex!("80 0007 10 00 0400");
const CONNECT_OK: [u8; 7] = hex!("A0 0007 10 00 FFFE");

fn put_packet(
    is_final: bool,
    name: Option<&str>,
    length: Option<u32>,
    body: Option<&[u8]>,
) -> Bytes {
    let mut headers = HeaderSet::new();
    if let Some(name) = name {
        headers.push(ObexHeader::Name(name.to_owned()));
    }
    if let Some(length) = length {
        headers.push(ObexHeader::Length(length));
    }
    if let Some(body) = body {
        if is_final {
            headers.push(ObexHeader::EndOfBody(Bytes::copy_from_slice(body)));
        } else {
            headers.push(ObexHeader::Body(Bytes::copy_from_slice(body)));
        }
    }
    let mut payload = BytesMut::new();
    headers.encode_into(&mut payload).expect("failed encode");
    frame(if is_final { 0x82 } else { 0x02 }, &payload).expect("failed frame")
}

fn completions(events: &[OppEvent]) -> Vec<(bool, bool, String, u64)> {
    events
        .iter()
        .filter_map(|e| match e {
            OppEvent::TransferComplete { success, received, file_name, file_length, .. } => {
                Some((*success, *received, file_name.clone(), *file_length))
            },
            _ => None,
        })
        .collect()
}

/// Single inbound file, user accepts.
#[test]
fn inbound_file_accepted() -> Result<()> {
    let mut rig = rig_connected()?;

    let put = put_packet(true, Some("f.txt"), Some(2), Some(b"Hi"));
    rig.session.on_message(&put)?;

    // The reply is deferred until the host decides.
    assert_eq!(rig.sent_count(), 1);
    let events = rig.events.snapshot();
    assert!(matches!(
        events.last(),
        Some(OppEvent::ReceivingFileConfirmation { file_name, file_length: 2, .. })
            if file_name == "f.txt"
    ));

    assert!(rig.session.confirm_receiving(true));
    assert_eq!(rig.sent_at(1), hex!("A0 0003"));

    let files = rig.files.lock().expect("poisoned");
    assert_eq!(files.get("f.txt").map(Vec::as_slice), Some(&b"Hi"[..]));
    drop(files);

    let events = rig.events.snapshot();
    let starts: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, OppEvent::TransferStart { received: true, .. }))
        .collect();
    assert_eq!(starts.len(), 1);
    assert_eq!(completions(&events), vec![(true, true, "f.txt".to_owned(), 2)]);
    assert!(events.iter().any(|e| matches!(e, OppEvent::FileWatcherNotify { .. })));
    Ok(())
}

/// Single inbound file, user declines.
#[test]
fn inbound_file_declined() -> Result<()> {
    let mut rig = rig_connected()?;

    rig.session
        .on_message(&put_packet(true, Some("f.txt"), Some(2), Some(b"Hi")))?;
    assert!(rig.session.confirm_receiving(false));

    // Unauthorized with the Final bit set.
    assert_eq!(rig.sent_at(1), hex!("C1 0003"));
    assert!(rig.files.lock().expect("poisoned").is_empty());
    assert!(completions(&rig.events.snapshot()).is_empty());

    // The refused peer gives up; the failed completion rides the teardown.
    rig.session.on_message(&hex!("81 0003"))?;
    assert_eq!(
        completions(&rig.events.snapshot()),
        vec![(false, true, "f.txt".to_owned(), 2)]
    );
    Ok(())
}

/// Malformed framing gets a BadRequest and the session stays open.
#[test]
fn malformed_packet_keeps_session_open() -> Result<()> {
    let mut rig = crate::unit_tests::rig();

    rig.session.on_message(&hex!("80 0002"))?;
    assert_eq!(rig.sent_at(0), hex!("C0 0003"));
    assert!(completions(&rig.events.snapshot()).is_empty());

    // The same transport still completes a valid handshake.
    rig.session.on_message(&CONNECT)?;
    assert_eq!(rig.sent_at(1), CONNECT_OK);
    Ok(())
}

/// Unsupported and unknown requests get typed error replies.
#[test]
fn unsupported_requests_are_rejected() -> Result<()> {
    let mut rig = rig_connected()?;

    rig.session.on_message(&hex!("03 0003"))?; // GET
    assert_eq!(rig.sent_at(1), hex!("C0 0003"));
    rig.session.on_message(&hex!("85 0003"))?; // SetPath
    assert_eq!(rig.sent_at(2), hex!("C0 0003"));
    rig.session.on_message(&hex!("07 0003"))?; // unknown op
    assert_eq!(rig.sent_at(3), hex!("D1 0003"));
    Ok(())
}

/// A PUT split across deliveries behaves exactly like one delivery.
#[test]
fn split_put_reassembles() -> Result<()> {
    let mut rig = rig_connected()?;

    let put = put_packet(true, Some("s.txt"), Some(5), Some(b"split"));
    let cut = 9;
    rig.session.on_message(&put[..cut])?;
    assert_eq!(rig.sent_count(), 1);
    rig.session.on_message(&put[cut..])?;

    assert!(rig.session.confirm_receiving(true));
    let files = rig.files.lock().expect("poisoned");
    assert_eq!(files.get("s.txt").map(Vec::as_slice), Some(&b"split"[..]));
    Ok(())
}

/// Confirmation is refused mid-reassembly and outside a pending ask.
#[test]
fn confirmation_legality() -> Result<()> {
    let mut rig = crate::unit_tests::rig();
    assert!(!rig.session.confirm_receiving(true));

    rig.session.on_message(&CONNECT)?;
    let put = put_packet(true, Some("f.txt"), Some(2), Some(b"Hi"));
    rig.session.on_message(&put[..6])?;
    // Mid-packet: the callback must wait.
    assert!(!rig.session.confirm_receiving(true));

    rig.session.on_message(&put[6..])?;
    assert!(rig.session.confirm_receiving(true));
    // Only one decision per ask.
    assert!(!rig.session.confirm_receiving(true));
    Ok(())
}

/// Second file on the same session: PUT after PutFinal starts a new object
/// without another confirmation, and name collisions get suffixed.
#[test]
fn multi_file_inbound() -> Result<()> {
    let mut rig = rig_connected()?;

    rig.session
        .on_message(&put_packet(true, Some("f.txt"), Some(2), Some(b"Hi")))?;
    assert!(rig.session.confirm_receiving(true));

    rig.session
        .on_message(&put_packet(false, Some("f.txt"), Some(4), Some(b"Yo")))?;
    // Continue, no confirmation round this time.
    assert_eq!(rig.sent_at(2), hex!("90 0003"));
    rig.session.on_message(&put_packet(true, None, None, Some(b"u2")))?;
    assert_eq!(rig.sent_at(3), hex!("A0 0003"));

    let files = rig.files.lock().expect("poisoned");
    assert_eq!(files.get("f.txt").map(Vec::as_slice), Some(&b"Hi"[..]));
    assert_eq!(files.get("f-1.txt").map(Vec::as_slice), Some(&b"You2"[..]));
    drop(files);

    let events = rig.events.snapshot();
    assert_eq!(
        completions(&events),
        vec![
            (true, true, "f.txt".to_owned(), 2),
            (true, true, "f-1.txt".to_owned(), 4),
        ]
    );
    Ok(())
}

/// Abort flag: the next PUT is refused, the partial file removed, and the
/// completion reports failure.
#[test]
fn abort_discards_partial_file() -> Result<()> {
    let mut rig = rig_connected()?;

    rig.session
        .on_message(&put_packet(false, Some("big.bin"), Some(10), Some(b"12345")))?;
    assert!(rig.session.confirm_receiving(true));
    assert_eq!(rig.sent_at(1), hex!("90 0003"));

    rig.session.stop_sending();
    rig.session.on_message(&put_packet(false, None, None, Some(b"67890")))?;

    // Unauthorized with the Final bit cleared for a non-final PUT.
    assert_eq!(rig.sent_at(2), hex!("41 0003"));
    assert!(rig.files.lock().expect("poisoned").is_empty());
    assert_eq!(
        completions(&rig.events.snapshot()),
        vec![(false, true, "big.bin".to_owned(), 10)]
    );
    Ok(())
}

/// A failing store yields Unauthorized but keeps the session alive.
#[test]
fn create_failure_replies_unauthorized() -> Result<()> {
    let mut rig = crate::unit_tests::rig_with(true);
    rig.session.on_message(&CONNECT)?;
    rig.session
        .on_message(&put_packet(false, Some("f.txt"), Some(2), Some(b"Hi")))?;
    assert!(rig.session.confirm_receiving(true));
    assert_eq!(rig.sent_at(1), hex!("41 0003"));
    Ok(())
}

/// Progress events fire when crossing 50 KiB boundaries, strictly
/// increasing, one per bucket.
#[test]
fn progress_fires_on_boundaries() -> Result<()> {
    let mut rig = rig_connected()?;
    let chunk = vec![0xABu8; 10 * 1024];
    let total = 12 * chunk.len() as u32;

    rig.session
        .on_message(&put_packet(false, Some("big.bin"), Some(total), Some(&chunk)))?;
    assert!(rig.session.confirm_receiving(true));
    for _ in 0..10 {
        rig.session.on_message(&put_packet(false, None, None, Some(&chunk)))?;
    }
    rig.session.on_message(&put_packet(true, None, None, Some(&chunk)))?;

    let progress: Vec<u64> = rig
        .events
        .snapshot()
        .iter()
        .filter_map(|e| match e {
            OppEvent::UpdateProgress { processed_length, received: true, .. } => {
                Some(*processed_length)
            },
            _ => None,
        })
        .collect();

    assert!(!progress.is_empty());
    for pair in progress.windows(2) {
        assert!(pair[0] < pair[1], "progress must increase: {progress:?}");
        assert_ne!(
            pair[0] / (50 * 1024),
            pair[1] / (50 * 1024),
            "one event per bucket: {progress:?}"
        );
    }
    Ok(())
}

/// Transport loss mid-transfer: partial file deleted, exactly one failed
/// completion, even if more teardown follows.
#[test]
fn transport_loss_completes_once() -> Result<()> {
    let mut rig = rig_connected()?;

    rig.session
        .on_message(&put_packet(false, Some("half.bin"), Some(100), Some(b"abc")))?;
    assert!(rig.session.confirm_receiving(true));

    rig.session.on_transport_gone();
    rig.session.on_transport_gone();

    assert!(rig.files.lock().expect("poisoned").is_empty());
    assert_eq!(
        completions(&rig.events.snapshot()),
        vec![(false, true, "half.bin".to_owned(), 3)]
    );
    Ok(())
}

/// OBEX Disconnect: Success reply, completion emitted once.
#[test]
fn disconnect_reports_completion() -> Result<()> {
    let mut rig = rig_connected()?;

    rig.session
        .on_message(&put_packet(false, Some("f.txt"), Some(9), Some(b"Hi")))?;
    assert!(rig.session.confirm_receiving(true));

    rig.session.on_message(&hex!("81 0003"))?;
    assert_eq!(rig.sent_at(2), hex!("A0 0003"));
    assert_eq!(
        completions(&rig.events.snapshot()),
        vec![(false, true, "f.txt".to_owned(), 2)]
    );
    Ok(())
}

fn rig_connected() -> Result<Rig> {
    let mut rig = crate::unit_tests::rig();
    rig.session.on_message(&CONNECT)?;
    assert_eq!(rig.sent_at(0), CONNECT_OK);
    assert!(rig.session.is_connected());
    Ok(rig)
}
