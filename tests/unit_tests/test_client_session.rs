// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use hex_literal::hex;
use obex_opp_rs::session::events::OppEvent;

use crate::unit_tests::{MemObject, Rig};

const CONNECT_REQ: [u8; 7] = hex!("80 0007 10 00 FFFE");
const CONNECT_OK_256: [u8; 7] = hex!("A0 0007 10 00 0100");
const CONTINUE: [u8; 3] = hex!("90 0003");
const SUCCESS: [u8; 3] = hex!("A0 0003");
const PUT_FINAL: [u8; 6] = hex!("82 0006 49 0003");
const DISCONNECT: [u8; 3] = hex!("81 0003");

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

/// Single outbound file end to end.
#[test]
fn outbound_single_file() -> Result<()> {
    let mut rig = crate::unit_tests::rig();
    rig.session.append_outbound(Box::new(MemObject::new(
        "a.bin",
        "application/octet-stream",
        &[1, 2, 3],
    )));
    rig.session.start_sending_next()?;

    let events = rig.events.snapshot();
    assert!(matches!(
        events.last(),
        Some(OppEvent::TransferStart { received: false, file_length: 3, file_name, .. })
            if file_name == "a.bin"
    ));
    assert_eq!(rig.sent_at(0), CONNECT_REQ);

    rig.session.on_message(&CONNECT_OK_256)?;
    assert_eq!(
        rig.sent_at(1),
        hex!(
            "02 0017"
            "01 000F 0061 002E 0062 0069 006E 0000"
            "C3 00000003"
        )
    );

    rig.session.on_message(&CONTINUE)?;
    rig.pump_chunk()?;
    assert_eq!(rig.sent_at(2), hex!("02 0009 48 0006 010203"));

    rig.session.on_message(&CONTINUE)?;
    assert_eq!(rig.sent_at(3), PUT_FINAL);

    rig.session.on_message(&SUCCESS)?;
    assert_eq!(
        completions(&rig.events.snapshot()),
        vec![(true, false, "a.bin".to_owned(), 3)]
    );
    assert_eq!(rig.sent_at(4), DISCONNECT);

    rig.session.on_message(&SUCCESS)?;
    assert!(!rig.session.is_connected());
    assert!(rig.session.grace_deadline().is_some());
    Ok(())
}

/// Second file appended mid-transfer goes out without a fresh CONNECT, and
/// objects finalize in append order.
#[test]
fn two_file_queue_shares_the_connection() -> Result<()> {
    let mut rig = crate::unit_tests::rig();
    rig.session
        .append_outbound(Box::new(MemObject::new("a.txt", "text/plain", b"alpha")));
    rig.session.start_sending_next()?;
    rig.session.on_message(&CONNECT_OK_256)?;

    rig.session.on_message(&CONTINUE)?;
    rig.pump_chunk()?;

    // Arrives while the first object is still streaming.
    rig.session
        .append_outbound(Box::new(MemObject::new("b.txt", "text/plain", b"beta")));

    rig.session.on_message(&CONTINUE)?;
    let final_idx = rig.sent_count() - 1;
    assert_eq!(rig.sent_at(final_idx), PUT_FINAL);

    rig.session.on_message(&SUCCESS)?;

    // PUT header for b.txt directly, no second CONNECT anywhere.
    let connects = (0..rig.sent_count())
        .filter(|&i| rig.sent_at(i)[0] == 0x80)
        .count();
    assert_eq!(connects, 1);
    assert_eq!(
        rig.sent_at(rig.sent_count() - 1),
        hex!(
            "02 0017"
            "01 000F 0062 002E 0074 0078 0074 0000"
            "C3 00000004"
        )
    );

    rig.session.on_message(&CONTINUE)?;
    rig.pump_chunk()?;
    rig.session.on_message(&CONTINUE)?;
    rig.session.on_message(&SUCCESS)?;
    assert_eq!(rig.sent_at(rig.sent_count() - 1), DISCONNECT);

    assert_eq!(
        completions(&rig.events.snapshot()),
        vec![
            (true, false, "a.txt".to_owned(), 5),
            (true, false, "b.txt".to_owned(), 4),
        ]
    );
    Ok(())
}

/// Abort mid-transfer: the next reply boundary emits Abort, then the Abort
/// reply triggers a DISCONNECT and a failed completion.
#[test]
fn abort_mid_transfer() -> Result<()> {
    let mut rig = crate::unit_tests::rig();
    let big = vec![0x5Au8; 100 * 1024];
    rig.session.append_outbound(Box::new(MemObject::new(
        "big.bin",
        "application/octet-stream",
        &big,
    )));
    rig.session.start_sending_next()?;
    rig.session.on_message(&hex!("A0 0007 10 00 FFFE"))?;

    rig.session.on_message(&CONTINUE)?;
    rig.pump_chunk()?;

    rig.session.stop_sending();
    rig.session.on_message(&CONTINUE)?;
    assert_eq!(rig.sent_at(rig.sent_count() - 1), hex!("FF 0003"));

    rig.session.on_message(&SUCCESS)?;
    assert_eq!(rig.sent_at(rig.sent_count() - 1), DISCONNECT);
    let events = completions(&rig.events.snapshot());
    assert_eq!(events.len(), 1);
    assert!(!events[0].0, "abort must complete with failure");
    Ok(())
}

/// An unexpected reply code tears the transfer down exactly once.
#[test]
fn unexpected_reply_fails_the_transfer() -> Result<()> {
    let mut rig = crate::unit_tests::rig();
    rig.session
        .append_outbound(Box::new(MemObject::new("a.txt", "text/plain", b"alpha")));
    rig.session.start_sending_next()?;
    rig.session.on_message(&CONNECT_OK_256)?;

    // Success where Continue was expected after a PUT.
    rig.session.on_message(&SUCCESS)?;
    assert_eq!(rig.sent_at(rig.sent_count() - 1), DISCONNECT);
    let events = completions(&rig.events.snapshot());
    assert_eq!(events.len(), 1);
    assert!(!events[0].0);
    Ok(())
}

/// A nameless object gets a MIME-derived name on the wire.
#[test]
fn nameless_object_gets_extension() -> Result<()> {
    let mut rig = crate::unit_tests::rig();
    let mut object = MemObject::new("", "text/plain", b"hi");
    object.name = None;
    rig.session.append_outbound(Box::new(object));
    rig.session.start_sending_next()?;

    assert!(matches!(
        rig.events.snapshot().last(),
        Some(OppEvent::TransferStart { file_name, .. }) if file_name == "Unknown.txt"
    ));
    Ok(())
}

/// Objects the 4-byte Length header cannot describe are refused up front.
#[test]
fn oversized_object_is_refused() {
    let mut rig = crate::unit_tests::rig();
    let mut object = MemObject::new("huge.bin", "application/octet-stream", &[]);
    object.declared = Some(u32::MAX as u64 + 1);
    rig.session.append_outbound(Box::new(object));
    assert!(rig.session.start_sending_next().is_err());
    assert_eq!(rig.sent_count(), 0);
}

/// A read failure on the worker collapses the session with a DISCONNECT.
#[test]
fn read_failure_disconnects() -> Result<()> {
    let mut rig = crate::unit_tests::rig();
    rig.session
        .append_outbound(Box::new(MemObject::new("a.txt", "text/plain", b"alpha")));
    rig.session.start_sending_next()?;
    rig.session.on_message(&CONNECT_OK_256)?;

    rig.session.on_chunk(Err(std::io::Error::other("disk on fire")))?;
    assert_eq!(rig.sent_at(rig.sent_count() - 1), DISCONNECT);
    Ok(())
}

/// Client-side progress: one event per 50-KiB bucket, strictly increasing,
/// carrying actual processed counts.
#[test]
fn progress_fires_between_chunks() -> Result<()> {
    let mut rig = crate::unit_tests::rig();
    let big = vec![0xC3u8; 120 * 1024];
    rig.session.append_outbound(Box::new(MemObject::new(
        "big.bin",
        "application/octet-stream",
        &big,
    )));
    rig.session.start_sending_next()?;
    rig.session.on_message(&hex!("A0 0007 10 00 FFFE"))?;

    // Drive replies until the PutFinal goes out.
    for _ in 0..8 {
        rig.session.on_message(&CONTINUE)?;
        let last = rig.sent_at(rig.sent_count() - 1);
        if last[0] == 0x82 {
            break;
        }
        rig.pump_chunk()?;
    }
    assert_eq!(rig.sent_at(rig.sent_count() - 1), PUT_FINAL);

    rig.session.on_message(&SUCCESS)?;
    let progress: Vec<u64> = rig
        .events
        .snapshot()
        .iter()
        .filter_map(|e| match e {
            OppEvent::UpdateProgress { processed_length, received: false, .. } => {
                Some(*processed_length)
            },
            _ => None,
        })
        .collect();

    assert!(!progress.is_empty());
    for pair in progress.windows(2) {
        assert!(pair[0] < pair[1]);
        assert_ne!(pair[0] / (50 * 1024), pair[1] / (50 * 1024));
    }
    Ok(())
}
