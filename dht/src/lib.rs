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

//! Mainline DHT core.
//!
//! Terminology, as in the BitTorrent ecosystem: a *peer* implements
//! the BitTorrent transfer protocol, a *node* implements the Mainline
//! DHT protocol. This crate is the node: the routing table, the KRPC
//! request/response state machine, the peer announcement database,
//! the token mint, the maintenance scheduler, the external-IP
//! election and the recursive search. It does no I/O of its own: the
//! embedder feeds datagrams into [`Dht::handle_packet`], sends
//! whatever [`Dht::on_awake`] pushes into its [`Sink`], and sleeps
//! until the returned deadline.

mod arena;
mod behaviour;
mod bloom;
mod config;
mod election;
mod error;
mod id;
mod krpc;
mod query;
mod routing;
mod store;
mod timeout;
mod transaction;

pub use behaviour::{Dht, Event, Sink, Stats};
pub use config::{Config, K};
pub use error::Error;
pub use id::{bep42, distance, mint_self_id, rank, Distance, InfoHash, Key, NodeId, ID_LEN};
pub use krpc::{
    error as compose_error, parse, peer_from_compact, peer_to_compact, request, response,
    ErrorCode, Message, MessageBody, NodeInfo, Query, Response, COMPACT_NODE_LEN,
    COMPACT_PEER_LEN, VERSION,
};
pub use query::SearchId;
pub use routing::{Insert, Node, RoutingTable};
pub use store::{PeerStore, Token, TOKEN_LEN};
pub use transaction::{Transaction, Transactions, TxContext, TX_MAX_LEN};
