// Copyright 2021 Parity Technologies (UK) Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Two nodes talking to each other through in-memory sinks: bootstrap,
//! announce, then a recursive search that finds the announced peer.

use mainline_dht::{
    parse, request, Config, Dht, Event, InfoHash, MessageBody, NodeId, Transaction,
};
use mainline_bencode::Encoder;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

const BUF: usize = 2048;

fn v4(d: u8, port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, d), port))
}

fn node(seed: u64, id_byte: u8) -> Dht {
    Dht::with_id(
        Config::default(),
        NodeId([id_byte; 20]),
        SmallRng::seed_from_u64(seed),
        Instant::now(),
    )
}

/// Deliver every datagram in `sink` to `to` (pretending it listens at
/// `to_addr`, with the traffic originating at `from_addr`), feeding
/// any replies straight back into `from`.
fn deliver(
    sink: &mut Vec<(SocketAddr, Vec<u8>)>,
    from: &mut Dht,
    from_addr: SocketAddr,
    to: &mut Dht,
    to_addr: SocketAddr,
) {
    let mut reply = [0u8; BUF];
    let mut back = [0u8; BUF];
    for (dest, datagram) in sink.drain(..) {
        assert_eq!(dest, to_addr, "unexpected destination");
        if let Some(len) = to.handle_packet(from_addr, &datagram, &mut reply) {
            // a reply from `to` never needs another reply
            assert!(from.handle_packet(to_addr, &reply[..len], &mut back).is_none());
        }
    }
}

#[test]
fn bootstrap_announce_and_search() {
    let a_addr = v4(1, 7001);
    let b_addr = v4(2, 7002);
    let mut a = node(1, 0xaa);
    let mut b = node(2, 0xbb);

    // A only knows B as a bootstrap address
    a.add_bootstrap(b_addr);
    let mut sink: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
    a.on_awake(&mut sink);
    assert!(!sink.is_empty(), "bootstrap find_node went out");
    deliver(&mut sink, &mut a, a_addr, &mut b, b_addr);

    // both sides now know each other
    assert_eq!(a.total_nodes(), 1);
    assert_eq!(a.contacts()[0].1, b_addr);
    assert_eq!(b.total_nodes(), 1);
    assert_eq!(b.contacts()[0].1, a_addr);

    // a downloader announces an infohash to B: get_peers for the
    // token, then announce_peer
    let hash = InfoHash([0x33u8; 20]);
    let peer_addr = v4(9, 51413);
    let peer_id = NodeId([0x99u8; 20]);
    let mut wire = [0u8; BUF];
    let mut out = [0u8; BUF];

    let mut enc = Encoder::new(&mut wire);
    request::get_peers(
        &mut enc,
        &Transaction::from_bytes(b"p1").unwrap(),
        &peer_id,
        &hash,
    )
    .unwrap();
    let qlen = enc.position();
    let rlen = b.handle_packet(peer_addr, &wire[..qlen], &mut out).unwrap();
    let token = match parse(&out[..rlen]).unwrap().body {
        MessageBody::Response(r) => r.token.expect("token minted").to_vec(),
        other => panic!("unexpected reply: {:?}", other),
    };

    let mut enc = Encoder::new(&mut wire);
    request::announce_peer(
        &mut enc,
        &Transaction::from_bytes(b"p2").unwrap(),
        &peer_id,
        &hash,
        peer_addr.port(),
        false,
        &token,
    )
    .unwrap();
    let qlen = enc.position();
    let rlen = b.handle_packet(peer_addr, &wire[..qlen], &mut out).unwrap();
    assert!(matches!(
        parse(&out[..rlen]).unwrap().body,
        MessageBody::Response(_)
    ));
    assert_eq!(b.stored_peers(), 1);

    // A searches for the infohash; B serves the announced peer
    let search = a.start_search(hash);
    a.on_awake(&mut sink);
    assert!(
        sink.iter().any(|(to, _)| *to == b_addr),
        "search queried B"
    );
    deliver(&mut sink, &mut a, a_addr, &mut b, b_addr);

    match a.poll_event() {
        Some(Event::SearchProgress { search: s, peers, .. }) => {
            assert_eq!(s, search);
            assert_eq!(peers, vec![peer_addr]);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // past the deadline the search retires with everything it found
    let deadline = a.now() + a.config().search_timeout + Duration::from_secs(1);
    a.tick(deadline);
    a.on_awake(&mut sink);
    sink.clear();
    match a.poll_event() {
        Some(Event::SearchFinished { search: s, peers, .. }) => {
            assert_eq!(s, search);
            assert_eq!(peers, vec![peer_addr]);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}
