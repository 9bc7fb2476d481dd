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

//! The local control plane.
//!
//! The Unix-domain control socket speaks the public wire format plus
//! three private-scope queries: `statistics`, `dump` and `search`.
//! Anything else is handed to the ordinary packet handler. A `search`
//! is acknowledged immediately; progress and the final result are
//! streamed back to the client as further messages echoing the
//! original transaction id.

use crate::dump::encode_image;
use mainline_bencode::{Decoder, Encoder};
use mainline_dht::{Dht, InfoHash, SearchId, VERSION};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Placeholder source for public-scope queries arriving over the
/// control socket; the zero port keeps it out of the routing table.
const LOCAL_SRC: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);

/// A `search` accepted over the control socket; the server remembers
/// which client to stream updates to, keyed by the search id.
#[derive(Debug, Clone)]
pub struct Started {
    pub search: SearchId,
    pub tx: Vec<u8>,
}

enum Private<'a> {
    Statistics { tx: &'a [u8] },
    Dump { tx: &'a [u8] },
    Search { tx: &'a [u8], info_hash: InfoHash },
}

fn parse_private(bytes: &[u8]) -> Option<Private<'_>> {
    let mut dec = Decoder::new(bytes);
    let mut tx: Option<&[u8]> = None;
    let mut is_query = false;
    let mut name: Option<&[u8]> = None;
    let mut info_hash: Option<InfoHash> = None;
    dec.dict_entries(|d, key| {
        match key {
            b"t" => tx = Some(d.bytes()?),
            b"y" => is_query = d.bytes()? == b"q",
            b"q" => name = Some(d.bytes()?),
            b"a" => d.dict_entries(|d, key| {
                match key {
                    b"info_hash" => info_hash = InfoHash::from_bytes(d.bytes()?),
                    _ => d.skip_value()?,
                }
                Ok(())
            })?,
            _ => d.skip_value()?,
        }
        Ok(())
    })
    .ok()?;
    let tx = tx?;
    if !is_query {
        return None;
    }
    match name? {
        b"statistics" => Some(Private::Statistics { tx }),
        b"dump" => Some(Private::Dump { tx }),
        b"search" => info_hash.map(|info_hash| Private::Search { tx, info_hash }),
        _ => None,
    }
}

fn tail(e: &mut Encoder<'_>, tx: &[u8]) -> mainline_bencode::Result<()> {
    e.text("t")?;
    e.bytes(tx)?;
    e.text("v")?;
    e.bytes(&VERSION)?;
    e.text("y")?;
    e.text("r")
}

fn compose_statistics(dht: &Dht, tx: &[u8], out: &mut [u8]) -> Option<usize> {
    let stats = dht.stats().clone();
    let mut enc = Encoder::new(out);
    enc.dict(|e| {
        e.text("r")?;
        e.dict(|e| {
            e.pair_integer("active_searches", dht.active_searches() as i64)?;
            e.pair_integer("bad_nodes", dht.bad_nodes() as i64)?;
            e.pair_integer("bootstrap", dht.bootstrap_len() as i64)?;
            e.pair_integer("good_nodes", dht.good_nodes() as i64)?;
            e.pair_integer("infohashes", dht.stored_infohashes() as i64)?;
            e.pair_integer("parse_errors", stats.parse_errors as i64)?;
            e.pair_integer("peers", dht.stored_peers() as i64)?;
            e.pair_integer("rx", stats.rx as i64)?;
            e.pair_integer("total_nodes", dht.total_nodes() as i64)?;
            e.pair_integer("tx", (stats.tx_query + stats.tx_response) as i64)?;
            e.pair_integer("unknown_tx", stats.unknown_tx as i64)
        })?;
        tail(e, tx)
    })
    .ok()?;
    Some(enc.position())
}

fn compose_dump(dht: &Dht, tx: &[u8], out: &mut [u8]) -> Option<usize> {
    let contacts = dht.contacts();
    let mut enc = Encoder::new(out);
    enc.dict(|e| {
        e.text("r")?;
        encode_image(e, dht.id(), &contacts)?;
        tail(e, tx)
    })
    .ok()?;
    Some(enc.position())
}

fn compose_search_ack(dht: &Dht, tx: &[u8], search: SearchId, out: &mut [u8]) -> Option<usize> {
    let mut enc = Encoder::new(out);
    enc.dict(|e| {
        e.text("r")?;
        e.dict(|e| {
            e.pair_bytes("id", dht.id().as_bytes())?;
            e.pair_integer("search", i64::from(search.0))
        })?;
        tail(e, tx)
    })
    .ok()?;
    Some(enc.position())
}

/// A progress or final-result message for a running search, addressed
/// with the transaction of the original `search` query.
pub fn compose_search_update(
    dht: &Dht,
    tx: &[u8],
    peers: &[SocketAddr],
    complete: bool,
    out: &mut [u8],
) -> Option<usize> {
    let mut enc = Encoder::new(out);
    enc.dict(|e| {
        e.text("r")?;
        e.dict(|e| {
            e.pair_integer("complete", i64::from(complete))?;
            e.pair_bytes("id", dht.id().as_bytes())?;
            e.text("values")?;
            e.list(|e| {
                for peer in peers {
                    if let Some(compact) = mainline_dht::peer_to_compact(peer) {
                        e.bytes(&compact)?;
                    }
                }
                Ok(())
            })
        })?;
        tail(e, tx)
    })
    .ok()?;
    Some(enc.position())
}

/// Handle one control datagram. Returns the reply length (if any) and
/// a [`Started`] record when a search was kicked off.
pub fn handle(dht: &mut Dht, bytes: &[u8], out: &mut [u8]) -> (Option<usize>, Option<Started>) {
    match parse_private(bytes) {
        Some(Private::Statistics { tx }) => (compose_statistics(dht, tx, out), None),
        Some(Private::Dump { tx }) => (compose_dump(dht, tx, out), None),
        Some(Private::Search { tx, info_hash }) => {
            let search = dht.start_search(info_hash);
            let started = Started {
                search,
                tx: tx.to_vec(),
            };
            (compose_search_ack(dht, tx, search, out), Some(started))
        }
        None => (dht.handle_packet(LOCAL_SRC, bytes, out), None),
    }
}
