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

//! KRPC message model.
//!
//! Every datagram is one bencoded dictionary: `t` transaction, `y`
//! message type (`q`/`r`/`e`), and per-type payload. Parsing is
//! tolerant of unknown keys and of key order; composing emits keys in
//! ASCII order as the encoder contract requires. Compact forms:
//! a peer is `ip(4) || port(2)` network order, a node is
//! `id(20) || peer(6)`.

use crate::error::Error;
use crate::id::{InfoHash, NodeId};
use crate::transaction::Transaction;
use mainline_bencode::{Decoder, Encoder, RawEncoder};
use smallvec::SmallVec;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Implementation tag sent in the `v` key.
pub const VERSION: [u8; 4] = *b"ml01";

pub const COMPACT_PEER_LEN: usize = 6;
pub const COMPACT_NODE_LEN: usize = 26;

type BResult<T> = mainline_bencode::Result<T>;

/// KRPC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Generic,
    Server,
    Protocol,
    MethodUnknown,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::Generic => 201,
            ErrorCode::Server => 202,
            ErrorCode::Protocol => 203,
            ErrorCode::MethodUnknown => 204,
        }
    }
}

/// A decoded `id(20) || ip(4) || port(2)` entry of a `nodes` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// An inbound query, dispatched by name.
#[derive(Debug)]
pub enum Query<'a> {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: InfoHash,
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: InfoHash,
        port: Option<u16>,
        implied_port: bool,
        token: &'a [u8],
    },
    /// Well-formed envelope, unknown query name; answered 204.
    Unknown {
        id: NodeId,
        name: &'a [u8],
    },
    /// Known name with arguments violating its schema; answered 203.
    Malformed {
        name: &'a [u8],
    },
}

/// Return values of an inbound response, interpreted by the matching
/// transaction's continuation.
#[derive(Debug, Default)]
pub struct Response<'a> {
    pub id: NodeId,
    pub token: Option<&'a [u8]>,
    pub nodes: SmallVec<[NodeInfo; 8]>,
    pub values: SmallVec<[SocketAddr; 8]>,
}

#[derive(Debug)]
pub enum MessageBody<'a> {
    Query(Query<'a>),
    Response(Response<'a>),
    Error { code: i64, message: &'a [u8] },
}

#[derive(Debug)]
pub struct Message<'a> {
    pub tx: Transaction,
    pub version: Option<&'a [u8]>,
    /// BEP-42 hint: the address the remote saw this message's
    /// recipient at. Fed to the IP election.
    pub ip: Option<SocketAddr>,
    pub body: MessageBody<'a>,
}

/// Decode a compact 6-byte peer.
pub fn peer_from_compact(bytes: &[u8]) -> Option<SocketAddr> {
    if bytes.len() != COMPACT_PEER_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Encode a peer in compact form. The wire encoder is IPv4-only; a V6
/// contact cannot be represented.
pub fn peer_to_compact(addr: &SocketAddr) -> Option<[u8; COMPACT_PEER_LEN]> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut out = [0u8; COMPACT_PEER_LEN];
            out[..4].copy_from_slice(&v4.ip().octets());
            out[4..].copy_from_slice(&v4.port().to_be_bytes());
            Some(out)
        }
        SocketAddr::V6(_) => None,
    }
}

fn put_peer(raw: &mut RawEncoder<'_, '_>, compact: &[u8; COMPACT_PEER_LEN]) -> BResult<()> {
    raw.put(compact)
}

/// Parse one datagram. Envelope violations are an [`Error::Message`];
/// schema violations of a known query become [`Query::Malformed`] so
/// the handler can answer with a protocol error.
pub fn parse(bytes: &[u8]) -> Result<Message<'_>, Error> {
    let mut dec = Decoder::new(bytes);

    let mut tx: Option<Transaction> = None;
    let mut y: Option<&[u8]> = None;
    let mut version: Option<&[u8]> = None;
    let mut ip: Option<SocketAddr> = None;
    let mut qname: Option<&[u8]> = None;
    let mut a_span: Option<&[u8]> = None;
    let mut r_span: Option<&[u8]> = None;
    let mut e_span: Option<&[u8]> = None;

    dec.dict_entries(|d, key| {
        match key {
            b"t" => {
                tx = Transaction::from_bytes(d.bytes()?);
                if tx.is_none() {
                    return Err(mainline_bencode::Error::Malformed);
                }
            }
            b"y" => y = Some(d.bytes()?),
            b"v" => version = Some(d.bytes()?),
            b"ip" => ip = peer_from_compact(d.bytes()?),
            b"q" => qname = Some(d.bytes()?),
            b"a" => a_span = Some(span(bytes, d)?),
            b"r" => r_span = Some(span(bytes, d)?),
            b"e" => e_span = Some(span(bytes, d)?),
            _ => d.skip_value()?,
        }
        Ok(())
    })?;

    let tx = tx.ok_or(Error::Message)?;
    let body = match y.ok_or(Error::Message)? {
        b"q" => {
            let name = qname.ok_or(Error::Message)?;
            let args = a_span.ok_or(Error::Message)?;
            MessageBody::Query(parse_query(name, args))
        }
        b"r" => MessageBody::Response(parse_response(r_span.ok_or(Error::Message)?)?),
        b"e" => {
            let (code, message) = parse_error(e_span.ok_or(Error::Message)?)?;
            MessageBody::Error { code, message }
        }
        _ => return Err(Error::Message),
    };

    Ok(Message {
        tx,
        version,
        ip,
        body,
    })
}

/// Consume the next value and return the raw bytes it covered.
fn span<'a>(bytes: &'a [u8], d: &mut Decoder<'a>) -> BResult<&'a [u8]> {
    let start = d.position();
    d.skip_value()?;
    Ok(&bytes[start..d.position()])
}

fn parse_query<'a>(name: &'a [u8], args: &'a [u8]) -> Query<'a> {
    let mut id: Option<NodeId> = None;
    let mut target: Option<NodeId> = None;
    let mut info_hash: Option<InfoHash> = None;
    let mut port: Option<i64> = None;
    let mut token: Option<&[u8]> = None;
    let mut implied_port = false;

    let mut dec = Decoder::new(args);
    let walked = dec.dict_entries(|d, key| {
        match key {
            b"id" => id = NodeId::from_bytes(d.bytes()?),
            b"target" => target = NodeId::from_bytes(d.bytes()?),
            b"info_hash" => info_hash = InfoHash::from_bytes(d.bytes()?),
            b"port" => port = Some(d.integer()?),
            b"token" => token = Some(d.bytes()?),
            b"implied_port" => implied_port = d.integer()? != 0,
            _ => d.skip_value()?,
        }
        Ok(())
    });
    if walked.is_err() {
        return Query::Malformed { name };
    }
    let id = match id {
        Some(id) => id,
        None => return Query::Malformed { name },
    };

    match name {
        b"ping" => Query::Ping { id },
        b"find_node" => match target {
            Some(target) => Query::FindNode { id, target },
            None => Query::Malformed { name },
        },
        b"get_peers" => match info_hash {
            Some(info_hash) => Query::GetPeers { id, info_hash },
            None => Query::Malformed { name },
        },
        b"announce_peer" => {
            let port = match port {
                Some(p) if (0..=i64::from(u16::MAX)).contains(&p) => Some(p as u16),
                Some(_) => return Query::Malformed { name },
                None => None,
            };
            match (info_hash, token) {
                (Some(info_hash), Some(token)) if port.is_some() || implied_port => {
                    Query::AnnouncePeer {
                        id,
                        info_hash,
                        port,
                        implied_port,
                        token,
                    }
                }
                _ => Query::Malformed { name },
            }
        }
        _ => Query::Unknown { id, name },
    }
}

fn parse_response(span: &[u8]) -> Result<Response<'_>, Error> {
    let mut out = Response::default();
    let mut id = None;

    let mut dec = Decoder::new(span);
    dec.dict_entries(|d, key| {
        match key {
            b"id" => id = NodeId::from_bytes(d.bytes()?),
            b"token" => out.token = Some(d.bytes()?),
            b"nodes" => {
                let raw = d.bytes()?;
                if raw.len() % COMPACT_NODE_LEN != 0 {
                    return Err(mainline_bencode::Error::Malformed);
                }
                for chunk in raw.chunks(COMPACT_NODE_LEN) {
                    let id = NodeId::from_bytes(&chunk[..20]).expect("20-byte chunk");
                    let addr = peer_from_compact(&chunk[20..]).expect("6-byte chunk");
                    out.nodes.push(NodeInfo { id, addr });
                }
            }
            b"values" => {
                d.list_entries(|d| {
                    let raw = d.bytes()?;
                    // tolerate entries of other sizes; IPv6 peers land here
                    if let Some(addr) = peer_from_compact(raw) {
                        out.values.push(addr);
                    }
                    Ok(())
                })?;
            }
            _ => d.skip_value()?,
        }
        Ok(())
    })?;

    out.id = id.ok_or(Error::Message)?;
    Ok(out)
}

fn parse_error(span: &[u8]) -> Result<(i64, &[u8]), Error> {
    let mut dec = Decoder::new(span);
    let out = dec.list(|d| {
        let code = d.integer()?;
        let message = if d.at_container_end() { &b""[..] } else { d.bytes()? };
        while !d.at_container_end() {
            d.skip_value()?;
        }
        Ok((code, message))
    })?;
    Ok(out)
}

fn envelope_tail(e: &mut Encoder<'_>, tx: &Transaction, y: &str) -> BResult<()> {
    e.text("t")?;
    e.bytes(tx.as_bytes())?;
    e.text("v")?;
    e.bytes(&VERSION)?;
    e.text("y")?;
    e.text(y)
}

/// `ip` entry echoing the requester's observed address; emitted on
/// every reply to a V4 contact.
fn reply_ip(e: &mut Encoder<'_>, remote: &SocketAddr) -> BResult<()> {
    if let Some(compact) = peer_to_compact(remote) {
        e.text("ip")?;
        e.bytes(&compact)?;
    }
    Ok(())
}

fn nodes_entry(e: &mut Encoder<'_>, nodes: &[(NodeId, SocketAddr)]) -> BResult<()> {
    let compact: SmallVec<[(NodeId, [u8; COMPACT_PEER_LEN]); 8]> = nodes
        .iter()
        .filter_map(|(id, addr)| peer_to_compact(addr).map(|c| (*id, c)))
        .collect();
    e.text("nodes")?;
    e.bytes_with(compact.len() * COMPACT_NODE_LEN, |raw| {
        for (id, peer) in &compact {
            raw.put(id.as_bytes())?;
            put_peer(raw, peer)?;
        }
        Ok(())
    })
}

/// Composers for outgoing queries.
pub mod request {
    use super::*;

    pub fn ping(e: &mut Encoder<'_>, tx: &Transaction, id: &NodeId) -> BResult<()> {
        e.dict(|e| {
            e.text("a")?;
            e.dict(|e| e.pair_bytes("id", id.as_bytes()))?;
            e.text("q")?;
            e.text("ping")?;
            envelope_tail(e, tx, "q")
        })
    }

    pub fn find_node(
        e: &mut Encoder<'_>,
        tx: &Transaction,
        id: &NodeId,
        target: &NodeId,
    ) -> BResult<()> {
        e.dict(|e| {
            e.text("a")?;
            e.dict(|e| {
                e.pair_bytes("id", id.as_bytes())?;
                e.pair_bytes("target", target.as_bytes())
            })?;
            e.text("q")?;
            e.text("find_node")?;
            envelope_tail(e, tx, "q")
        })
    }

    pub fn get_peers(
        e: &mut Encoder<'_>,
        tx: &Transaction,
        id: &NodeId,
        info_hash: &InfoHash,
    ) -> BResult<()> {
        e.dict(|e| {
            e.text("a")?;
            e.dict(|e| {
                e.pair_bytes("id", id.as_bytes())?;
                e.pair_bytes("info_hash", info_hash.as_bytes())
            })?;
            e.text("q")?;
            e.text("get_peers")?;
            envelope_tail(e, tx, "q")
        })
    }

    pub fn announce_peer(
        e: &mut Encoder<'_>,
        tx: &Transaction,
        id: &NodeId,
        info_hash: &InfoHash,
        port: u16,
        implied_port: bool,
        token: &[u8],
    ) -> BResult<()> {
        e.dict(|e| {
            e.text("a")?;
            e.dict(|e| {
                e.pair_bytes("id", id.as_bytes())?;
                if implied_port {
                    e.pair_integer("implied_port", 1)?;
                }
                e.pair_bytes("info_hash", info_hash.as_bytes())?;
                e.pair_integer("port", i64::from(port))?;
                e.pair_bytes("token", token)
            })?;
            e.text("q")?;
            e.text("announce_peer")?;
            envelope_tail(e, tx, "q")
        })
    }
}

/// Composers for replies to inbound queries.
pub mod response {
    use super::*;

    pub fn ping(
        e: &mut Encoder<'_>,
        tx: &Transaction,
        id: &NodeId,
        remote: &SocketAddr,
    ) -> BResult<()> {
        e.dict(|e| {
            reply_ip(e, remote)?;
            e.text("r")?;
            e.dict(|e| e.pair_bytes("id", id.as_bytes()))?;
            envelope_tail(e, tx, "r")
        })
    }

    pub fn find_node(
        e: &mut Encoder<'_>,
        tx: &Transaction,
        id: &NodeId,
        nodes: &[(NodeId, SocketAddr)],
        remote: &SocketAddr,
    ) -> BResult<()> {
        e.dict(|e| {
            reply_ip(e, remote)?;
            e.text("r")?;
            e.dict(|e| {
                e.pair_bytes("id", id.as_bytes())?;
                nodes_entry(e, nodes)
            })?;
            envelope_tail(e, tx, "r")
        })
    }

    pub fn get_peers_nodes(
        e: &mut Encoder<'_>,
        tx: &Transaction,
        id: &NodeId,
        token: &[u8],
        nodes: &[(NodeId, SocketAddr)],
        remote: &SocketAddr,
    ) -> BResult<()> {
        e.dict(|e| {
            reply_ip(e, remote)?;
            e.text("r")?;
            e.dict(|e| {
                e.pair_bytes("id", id.as_bytes())?;
                nodes_entry(e, nodes)?;
                e.pair_bytes("token", token)
            })?;
            envelope_tail(e, tx, "r")
        })
    }

    pub fn get_peers_values(
        e: &mut Encoder<'_>,
        tx: &Transaction,
        id: &NodeId,
        token: &[u8],
        values: &[SocketAddr],
        remote: &SocketAddr,
    ) -> BResult<()> {
        e.dict(|e| {
            reply_ip(e, remote)?;
            e.text("r")?;
            e.dict(|e| {
                e.pair_bytes("id", id.as_bytes())?;
                e.pair_bytes("token", token)?;
                e.text("values")?;
                e.list(|e| {
                    for addr in values {
                        if let Some(compact) = peer_to_compact(addr) {
                            e.bytes(&compact)?;
                        }
                    }
                    Ok(())
                })
            })?;
            envelope_tail(e, tx, "r")
        })
    }

    pub fn announce_peer(
        e: &mut Encoder<'_>,
        tx: &Transaction,
        id: &NodeId,
        remote: &SocketAddr,
    ) -> BResult<()> {
        // same wire shape as a ping reply
        ping(e, tx, id, remote)
    }
}

/// Compose an `e` message.
pub fn error(
    e: &mut Encoder<'_>,
    tx: &Transaction,
    code: ErrorCode,
    message: &str,
) -> BResult<()> {
    e.dict(|e| {
        e.text("e")?;
        e.list(|e| {
            e.integer(code.code())?;
            e.text(message)
        })?;
        envelope_tail(e, tx, "e")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ID_LEN;

    fn tx(bytes: &[u8]) -> Transaction {
        Transaction::from_bytes(bytes).unwrap()
    }

    fn v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), port))
    }

    #[test]
    fn parses_bep5_ping_query() {
        let wire = b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe";
        let msg = parse(wire).unwrap();
        assert_eq!(msg.tx.as_bytes(), b"aa");
        match msg.body {
            MessageBody::Query(Query::Ping { id }) => {
                assert_eq!(id.as_bytes(), b"abcdefghij0123456789");
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn parses_bep5_find_node_response() {
        // "nodes" of one compact entry
        let mut wire = Vec::new();
        wire.extend_from_slice(b"d1:rd2:id20:0123456789abcdefghij5:nodes26:");
        wire.extend_from_slice(b"mnopqrstuvwxyz123456");
        wire.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1]);
        wire.extend_from_slice(b"e1:t2:aa1:y1:re");
        let msg = parse(&wire).unwrap();
        match msg.body {
            MessageBody::Response(r) => {
                assert_eq!(r.nodes.len(), 1);
                assert_eq!(r.nodes[0].id.as_bytes(), b"mnopqrstuvwxyz123456");
                assert_eq!(r.nodes[0].addr, v4(10, 0, 0, 1, 6881));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn parses_error_message() {
        let wire = b"d1:eli201e23:A Generic Error Ocurrede1:t2:aa1:y1:ee";
        let msg = parse(wire).unwrap();
        match msg.body {
            MessageBody::Error { code, message } => {
                assert_eq!(code, 201);
                assert_eq!(message, b"A Generic Error Ocurred");
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let wire = b"d1:ad2:id20:abcdefghij01234567893:xyzi7ee1:q4:ping1:t2:aa1:y1:q2:zzi0ee";
        let msg = parse(wire).unwrap();
        assert!(matches!(msg.body, MessageBody::Query(Query::Ping { .. })));
    }

    #[test]
    fn missing_transaction_is_rejected() {
        let wire = b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:y1:qe";
        assert!(parse(wire).is_err());
    }

    #[test]
    fn known_query_with_broken_args_is_malformed_not_error() {
        // find_node without target
        let wire = b"d1:ad2:id20:abcdefghij0123456789e1:q9:find_node1:t2:aa1:y1:qe";
        let msg = parse(wire).unwrap();
        assert!(matches!(
            msg.body,
            MessageBody::Query(Query::Malformed { name }) if name == b"find_node"
        ));
    }

    #[test]
    fn unknown_query_name_is_surfaced() {
        let wire = b"d1:ad2:id20:abcdefghij0123456789e1:q4:vote1:t2:aa1:y1:qe";
        let msg = parse(wire).unwrap();
        assert!(matches!(
            msg.body,
            MessageBody::Query(Query::Unknown { name, .. }) if name == b"vote"
        ));
    }

    #[test]
    fn ip_hint_is_decoded() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"d2:ip6:");
        wire.extend_from_slice(&[1, 2, 3, 4, 0x1f, 0x90]);
        wire.extend_from_slice(b"1:rd2:id20:abcdefghij0123456789e1:t2:aa1:y1:re");
        let msg = parse(&wire).unwrap();
        assert_eq!(msg.ip, Some(v4(1, 2, 3, 4, 8080)));
    }

    #[test]
    fn ping_request_roundtrip() {
        let mut buf = [0u8; 256];
        let mut enc = Encoder::new(&mut buf);
        let id = NodeId([7u8; ID_LEN]);
        request::ping(&mut enc, &tx(b"ab12"), &id).unwrap();
        let len = enc.position();
        let msg = parse(&buf[..len]).unwrap();
        assert_eq!(msg.tx.as_bytes(), b"ab12");
        assert_eq!(msg.version, Some(&VERSION[..]));
        match msg.body {
            MessageBody::Query(Query::Ping { id: got }) => assert_eq!(got, id),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn announce_request_roundtrip() {
        let mut buf = [0u8; 256];
        let mut enc = Encoder::new(&mut buf);
        let id = NodeId([1u8; ID_LEN]);
        let hash = InfoHash([2u8; ID_LEN]);
        request::announce_peer(&mut enc, &tx(b"aa"), &id, &hash, 6881, false, b"tokn5").unwrap();
        let len = enc.position();
        let msg = parse(&buf[..len]).unwrap();
        match msg.body {
            MessageBody::Query(Query::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
                ..
            }) => {
                assert_eq!(info_hash, hash);
                assert_eq!(port, Some(6881));
                assert!(!implied_port);
                assert_eq!(token, b"tokn5");
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn get_peers_values_reply_roundtrip() {
        let mut buf = [0u8; 512];
        let mut enc = Encoder::new(&mut buf);
        let id = NodeId([3u8; ID_LEN]);
        let peers = [v4(10, 1, 1, 1, 1000), v4(10, 1, 1, 2, 2000)];
        let remote = v4(5, 6, 7, 8, 4000);
        response::get_peers_values(&mut enc, &tx(b"aa"), &id, b"tokn5", &peers, &remote).unwrap();
        let len = enc.position();
        let msg = parse(&buf[..len]).unwrap();
        assert_eq!(msg.ip, Some(remote));
        match msg.body {
            MessageBody::Response(r) => {
                assert_eq!(r.token, Some(&b"tokn5"[..]));
                assert_eq!(r.values.as_slice(), &peers[..]);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn find_node_reply_nodes_are_multiple_of_26() {
        let mut buf = [0u8; 512];
        let mut enc = Encoder::new(&mut buf);
        let id = NodeId([4u8; ID_LEN]);
        let nodes = [
            (NodeId([9u8; ID_LEN]), v4(10, 0, 0, 1, 1)),
            (NodeId([8u8; ID_LEN]), v4(10, 0, 0, 2, 2)),
        ];
        let remote = v4(5, 6, 7, 8, 4000);
        response::find_node(&mut enc, &tx(b"aa"), &id, &nodes, &remote).unwrap();
        let len = enc.position();
        let msg = parse(&buf[..len]).unwrap();
        match msg.body {
            MessageBody::Response(r) => {
                assert_eq!(r.nodes.len(), 2);
                assert_eq!(r.nodes[0].id, nodes[0].0);
                assert_eq!(r.nodes[1].addr, nodes[1].1);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn composing_is_deterministic() {
        let mut a = [0u8; 256];
        let mut b = [0u8; 256];
        let id = NodeId([1u8; ID_LEN]);
        let hash = InfoHash([2u8; ID_LEN]);
        let mut ea = Encoder::new(&mut a);
        let mut eb = Encoder::new(&mut b);
        request::get_peers(&mut ea, &tx(b"aa"), &id, &hash).unwrap();
        request::get_peers(&mut eb, &tx(b"aa"), &id, &hash).unwrap();
        let (la, lb) = (ea.position(), eb.position());
        assert_eq!(&a[..la], &b[..lb]);
    }

    #[test]
    fn error_message_shape() {
        let mut buf = [0u8; 256];
        let mut enc = Encoder::new(&mut buf);
        error(&mut enc, &tx(b"aa"), ErrorCode::Protocol, "Protocol Error").unwrap();
        let len = enc.position();
        let msg = parse(&buf[..len]).unwrap();
        match msg.body {
            MessageBody::Error { code, message } => {
                assert_eq!(code, 203);
                assert_eq!(message, b"Protocol Error");
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }
}
