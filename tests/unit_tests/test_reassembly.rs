// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use obex_opp_rs::{
    models::{
        header::{HeaderSet, ObexHeader},
        packet::frame,
    },
    session::reassembly::Reassembler,
};
use rand::RngExt;

fn sample_put(body_len: usize) -> Bytes {
    let body: Vec<u8> = (0..body_len).map(|i| i as u8).collect();
    let mut payload = BytesMut::new();
    let mut headers = HeaderSet::new();
    headers.push(ObexHeader::Name("sample.bin".to_owned()));
    headers.push(ObexHeader::Length(body_len as u32));
    headers.push(ObexHeader::Body(Bytes::from(body)));
    headers.encode_into(&mut payload).expect("failed encode");
    frame(0x02, &payload).expect("failed frame")
}

/// Any split of a well-formed packet across deliveries produces the same
/// completion as a single delivery.
#[test]
fn random_splits_match_single_delivery() -> Result<()> {
    let packet = sample_put(700);
    let mut rng = rand::rng();

    for _ in 0..100 {
        let mut r = Reassembler::new();
        let mut done = Vec::new();
        let mut offset = 0usize;
        while offset < packet.len() {
            let take = rng.random_range(1..=packet.len() - offset);
            done.extend(r.push(&packet[offset..offset + take])?);
            offset += take;
        }

        assert_eq!(done.len(), 1);
        assert_eq!(done[0].opcode, 0x02);
        assert_eq!(done[0].packet, packet);
        assert!(r.is_idle());
    }
    Ok(())
}

/// A PUT directly behind a PutFinal in one delivery starts a fresh buffer.
#[test]
fn back_to_back_packets_split_correctly() -> Result<()> {
    let first = sample_put(40);
    let second = frame(0x82, &{
        let mut payload = BytesMut::new();
        let mut headers = HeaderSet::new();
        headers.push(ObexHeader::EndOfBody(Bytes::new()));
        headers.encode_into(&mut payload)?;
        payload
    })?;

    let mut joined = first.to_vec();
    joined.extend_from_slice(&second);

    // Cut inside the second packet so it spans two deliveries.
    let cut = first.len() + 2;
    let mut r = Reassembler::new();
    let mut done = r.push(&joined[..cut])?;
    done.extend(r.push(&joined[cut..])?);

    assert_eq!(done.len(), 2);
    assert_eq!(done[0].packet, first);
    assert_eq!(done[1].packet, second);
    assert_eq!(done[1].opcode, 0x82);
    Ok(())
}

#[test]
fn reset_drops_partial_state() -> Result<()> {
    let packet = sample_put(100);
    let mut r = Reassembler::new();
    assert!(r.push(&packet[..10])?.is_empty());
    assert!(!r.is_idle());

    r.reset();
    assert!(r.is_idle());

    let done = r.push(&packet)?;
    assert_eq!(done.len(), 1);
    Ok(())
}
