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

//! The DHT node state machine.
//!
//! One long-lived [`Dht`] value, passed by mutable reference through
//! the handlers; no state lives anywhere else. Inbound datagrams go
//! through [`Dht::handle_packet`], which runs to completion and
//! optionally leaves a reply in the caller's buffer. Between I/O
//! batches the event loop calls [`Dht::on_awake`], which drives the
//! periodic sweeps and returns the next wake deadline.

use crate::config::{Config, K};
use crate::election::IpElection;
use crate::id::{self, InfoHash, NodeId};
use crate::krpc::{self, ErrorCode, MessageBody, NodeInfo, Query, Response};
use crate::query::{SearchId, SearchPool};
use crate::routing::{Insert, RoutingTable};
use crate::store::{PeerStore, Token};
use crate::transaction::{Expired, Transaction, Transactions, TxContext};
use fnv::{FnvHashMap, FnvHashSet};
use log::{debug, info, trace, warn};
use mainline_bencode::Encoder;
use rand::rngs::SmallRng;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

/// Scratch size for composed datagrams.
const OUT_BUF: usize = 1432;
const BLACKLIST_MAX: usize = 1024;
const STRIKES_MAX: u8 = 8;

/// Where outbound datagrams go. The daemon hands them to the UDP
/// socket; tests collect them in a `Vec`.
pub trait Sink {
    /// Best effort; a false return is treated as transient loss and
    /// counted, reliability comes from transaction timeouts.
    fn send(&mut self, to: SocketAddr, datagram: &[u8]) -> bool;
}

impl Sink for Vec<(SocketAddr, Vec<u8>)> {
    fn send(&mut self, to: SocketAddr, datagram: &[u8]) -> bool {
        self.push((to, datagram.to_vec()));
        true
    }
}

/// Things the embedding layer wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A search received peers; more may follow.
    SearchProgress {
        search: SearchId,
        target: InfoHash,
        peers: Vec<SocketAddr>,
    },
    /// A search retired; `peers` is everything it found.
    SearchFinished {
        search: SearchId,
        target: InfoHash,
        peers: Vec<SocketAddr>,
    },
    /// The election adopted an external address and the node reminted
    /// its id against it.
    ExternalAddress { addr: SocketAddr, id: NodeId },
}

/// Plain counters; surfaced over the control socket.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub rx: u64,
    pub rx_query: u64,
    pub rx_response: u64,
    pub rx_error: u64,
    pub parse_errors: u64,
    pub unknown_tx: u64,
    pub blacklisted: u64,
    pub protocol_errors: u64,
    pub tx_query: u64,
    pub tx_response: u64,
    pub send_failures: u64,
}

pub struct Dht {
    config: Config,
    table: RoutingTable,
    store: PeerStore,
    txs: Transactions,
    searches: SearchPool,
    election: IpElection,
    bootstrap: VecDeque<SocketAddr>,
    blacklist: FnvHashSet<IpAddr>,
    strikes: FnvHashMap<IpAddr, u8>,
    stats: Stats,
    rng: SmallRng,
    now: Instant,
    /// Last inbound datagram; the peer database consults it so an
    /// offline gap does not mass-expire announcements.
    last_activity: Option<Instant>,
    external: Option<SocketAddr>,
    events: VecDeque<Event>,
}

impl Dht {
    /// A node with a random id; it hardens the id once the election
    /// settles on an external address.
    pub fn new(config: Config, mut rng: SmallRng, now: Instant) -> Dht {
        let id = id::mint_self_id(None, &mut rng);
        Dht::with_id(config, id, rng, now)
    }

    pub fn with_id(config: Config, id: NodeId, rng: SmallRng, now: Instant) -> Dht {
        let table = RoutingTable::new(id, config.root_limit);
        let store = PeerStore::new(&config);
        let txs = Transactions::new(config.transaction_capacity, config.transaction_timeout);
        Dht {
            config,
            table,
            store,
            txs,
            searches: SearchPool::new(),
            election: IpElection::new(),
            bootstrap: VecDeque::new(),
            blacklist: FnvHashSet::default(),
            strikes: FnvHashMap::default(),
            stats: Stats::default(),
            rng,
            now,
            last_activity: None,
            external: None,
            events: VecDeque::new(),
        }
    }

    pub fn id(&self) -> &NodeId {
        self.table.own_id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn external(&self) -> Option<SocketAddr> {
        self.external
    }

    pub fn total_nodes(&self) -> usize {
        self.table.total_nodes()
    }

    pub fn good_nodes(&self) -> usize {
        self.table.good_nodes()
    }

    pub fn bad_nodes(&self) -> usize {
        self.table.bad_nodes()
    }

    pub fn stored_infohashes(&self) -> usize {
        self.store.records()
    }

    pub fn stored_peers(&self) -> usize {
        self.store.peers()
    }

    pub fn active_searches(&self) -> usize {
        self.searches.len()
    }

    /// Every known contact; the shutdown dump.
    pub fn contacts(&self) -> Vec<(NodeId, SocketAddr)> {
        self.table.iter().map(|n| (n.id, n.addr)).collect()
    }

    /// Replace the own id (restored from a dump). The routing table
    /// restarts empty; any contacts it held become bootstrap material.
    pub fn set_id(&mut self, id: NodeId) {
        for contact in self.table.reset(id) {
            self.add_bootstrap(contact);
        }
    }

    /// Refresh the clock, monotonically non-decreasing.
    pub fn tick(&mut self, wall: Instant) -> Instant {
        if wall > self.now {
            self.now = wall;
        }
        self.now
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn add_bootstrap(&mut self, addr: SocketAddr) {
        if addr.port() == 0
            || self.bootstrap.len() >= self.config.bootstrap_limit
            || self.bootstrap.contains(&addr)
        {
            return;
        }
        self.bootstrap.push_back(addr);
    }

    pub fn bootstrap_len(&self) -> usize {
        self.bootstrap.len()
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Kick off a recursive lookup for `target`, seeded from the
    /// routing table. Queries go out on the next awake.
    pub fn start_search(&mut self, target: InfoHash) -> SearchId {
        let seeds: Vec<NodeInfo> = self
            .table
            .closest(target.as_bytes(), K)
            .into_iter()
            .map(|(id, addr)| NodeInfo { id, addr })
            .collect();
        let deadline = self.now + self.config.search_timeout;
        let search = self.searches.start(target, &seeds, deadline);
        debug!("search {:?} for {} seeded with {}", search, target, seeds.len());
        search
    }

    fn strike(&mut self, ip: IpAddr) {
        if self.strikes.len() > BLACKLIST_MAX {
            self.strikes.clear();
        }
        let count = self.strikes.entry(ip).or_insert(0);
        *count = count.saturating_add(1);
        if *count >= STRIKES_MAX && self.blacklist.len() < BLACKLIST_MAX {
            warn!("blacklisting {} after repeated garbage", ip);
            self.blacklist.insert(ip);
        }
    }

    /// Decode and dispatch one datagram. A reply, when due, is left
    /// in `out` and its length returned.
    pub fn handle_packet(&mut self, src: SocketAddr, bytes: &[u8], out: &mut [u8]) -> Option<usize> {
        self.stats.rx += 1;
        if self.blacklist.contains(&src.ip()) {
            self.stats.blacklisted += 1;
            return None;
        }
        let msg = match krpc::parse(bytes) {
            Ok(msg) => msg,
            Err(err) => {
                self.stats.parse_errors += 1;
                debug!(
                    "dropping unparseable datagram from {}: {} ({})",
                    src,
                    err,
                    mainline_bencode::Pretty(bytes)
                );
                self.strike(src.ip());
                return None;
            }
        };
        self.last_activity = Some(self.now);

        match msg.body {
            MessageBody::Query(query) => self.handle_query(src, msg.tx, msg.ip, query, out),
            MessageBody::Response(response) => {
                self.handle_response(src, msg.tx, msg.ip, response);
                None
            }
            MessageBody::Error { code, message } => {
                self.handle_error_msg(src, msg.tx, code, message);
                None
            }
        }
    }

    /// Common preamble: refuse our own or the zero id, refresh or
    /// insert the sender, feed the election.
    fn preamble(&mut self, src: &SocketAddr, sender: &NodeId, response: bool) -> bool {
        if *sender == *self.table.own_id() || sender.is_zero() {
            trace!("dropping message with self/zero sender id from {}", src);
            return false;
        }
        if !self.table.touch(sender, self.now, response) {
            match self.table.insert(*sender, *src, self.now) {
                Insert::Inserted => trace!("learned {} at {}", sender, src),
                Insert::Full => {}
                Insert::Existing | Insert::Invalid => {}
            }
        }
        true
    }

    fn handle_query(
        &mut self,
        src: SocketAddr,
        tx: Transaction,
        ip_hint: Option<SocketAddr>,
        query: Query<'_>,
        out: &mut [u8],
    ) -> Option<usize> {
        self.stats.rx_query += 1;

        let sender = match &query {
            Query::Ping { id }
            | Query::FindNode { id, .. }
            | Query::GetPeers { id, .. }
            | Query::AnnouncePeer { id, .. }
            | Query::Unknown { id, .. } => Some(*id),
            Query::Malformed { .. } => None,
        };
        if let Some(sender) = sender {
            if !self.preamble(&src, &sender, false) {
                return None;
            }
        }
        if let Some(candidate) = ip_hint {
            self.election.vote(&src, candidate);
        }

        let own = *self.table.own_id();
        let mut enc = Encoder::new(out);
        let composed = match query {
            Query::Ping { .. } => krpc::response::ping(&mut enc, &tx, &own, &src),
            Query::FindNode { target, .. } => {
                let closest = self.table.closest(target.as_bytes(), K);
                krpc::response::find_node(&mut enc, &tx, &own, &closest, &src)
            }
            Query::GetPeers { info_hash, .. } => {
                let token = self.store.mint_token(&src, &mut self.rng, self.now);
                let mut peers = self.store.lookup(&info_hash, self.now, self.last_activity);
                if peers.is_empty() {
                    let closest = self.table.closest(info_hash.as_bytes(), K);
                    krpc::response::get_peers_nodes(
                        &mut enc,
                        &tx,
                        &own,
                        token.as_bytes(),
                        &closest,
                        &src,
                    )
                } else {
                    peers.truncate(self.config.max_peer_values);
                    krpc::response::get_peers_values(
                        &mut enc,
                        &tx,
                        &own,
                        token.as_bytes(),
                        &peers,
                        &src,
                    )
                }
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
                ..
            } => {
                let chosen = if implied_port { src.port() } else { port.unwrap_or(0) };
                if chosen == 0 {
                    self.stats.protocol_errors += 1;
                    krpc::error(&mut enc, &tx, ErrorCode::Protocol, "Protocol Error")
                } else if !self.store.valid_token(&src, token, self.now) {
                    self.stats.protocol_errors += 1;
                    debug!("announce from {} with invalid token", src);
                    krpc::error(&mut enc, &tx, ErrorCode::Protocol, "Protocol Error")
                } else {
                    let peer = SocketAddr::new(src.ip(), chosen);
                    self.store.insert(info_hash, peer, self.now);
                    krpc::response::announce_peer(&mut enc, &tx, &own, &src)
                }
            }
            Query::Unknown { name, .. } => {
                debug!("unknown query {:?} from {}", String::from_utf8_lossy(name), src);
                krpc::error(&mut enc, &tx, ErrorCode::MethodUnknown, "Method Unknown")
            }
            Query::Malformed { name } => {
                self.stats.protocol_errors += 1;
                debug!(
                    "malformed {:?} query from {}",
                    String::from_utf8_lossy(name),
                    src
                );
                krpc::error(&mut enc, &tx, ErrorCode::Protocol, "Protocol Error")
            }
        };

        match composed {
            Ok(()) => {
                self.stats.tx_response += 1;
                Some(enc.position())
            }
            Err(err) => {
                warn!("failed to compose reply to {}: {}", src, err);
                None
            }
        }
    }

    fn handle_response(
        &mut self,
        src: SocketAddr,
        tx: Transaction,
        ip_hint: Option<SocketAddr>,
        response: Response<'_>,
    ) {
        self.stats.rx_response += 1;

        let ctx = match self.txs.consume(&tx) {
            Some(ctx) => ctx,
            None => {
                self.stats.unknown_tx += 1;
                debug!("response with unknown {:?} from {}", tx, src);
                return;
            }
        };
        if !self.preamble(&src, &response.id, true) {
            // a consumed continuation still needs its bookkeeping
            if let TxContext::GetPeers { search, .. } = &ctx {
                if let Some(s) = self.searches.get_mut(*search) {
                    s.on_failure();
                }
            }
            return;
        }
        if let Some(candidate) = ip_hint {
            self.election.vote(&src, candidate);
        }
        if let Some(raw) = response.token {
            if let Some(token) = Token::from_bytes(raw) {
                self.table.set_announce_token(&response.id, token);
            }
        }

        match ctx {
            TxContext::Ping { id } => {
                trace!("pong from {} ({})", src, id);
            }
            TxContext::FindNode { .. } => {
                for node in &response.nodes {
                    self.learn_contact(node);
                }
            }
            TxContext::GetPeers { search, .. } => {
                for node in &response.nodes {
                    self.learn_contact(node);
                }
                if let Some(s) = self.searches.get_mut(search) {
                    s.on_response(&response.nodes, &response.values);
                    if !response.values.is_empty() {
                        let target = *s.target();
                        self.events.push_back(Event::SearchProgress {
                            search,
                            target,
                            peers: response.values.to_vec(),
                        });
                    }
                }
            }
            TxContext::AnnouncePeer { infohash } => {
                trace!("announce to {} for {} confirmed", src, infohash);
            }
        }
    }

    fn handle_error_msg(&mut self, src: SocketAddr, tx: Transaction, code: i64, message: &[u8]) {
        self.stats.rx_error += 1;
        match self.txs.consume(&tx) {
            Some(TxContext::GetPeers { search, .. }) => {
                if let Some(s) = self.searches.get_mut(search) {
                    s.on_failure();
                }
            }
            Some(_) => {}
            None => {
                self.stats.unknown_tx += 1;
            }
        }
        debug!(
            "error {} {:?} from {}",
            code,
            String::from_utf8_lossy(message),
            src
        );
    }

    /// A contact reported inside a response: into the routing table,
    /// or onto the bootstrap list when the table has no room.
    fn learn_contact(&mut self, node: &NodeInfo) {
        match self.table.insert(node.id, node.addr, self.now) {
            Insert::Full => self.add_bootstrap(node.addr),
            _ => {}
        }
    }

    fn on_tx_timeout(&mut self, expired: Expired) {
        trace!("transaction {:?} timed out", expired.tx);
        match expired.ctx {
            TxContext::Ping { id } => {
                trace!("ping to {} went unanswered", id);
            }
            TxContext::FindNode {
                remote, bootstrap, ..
            } => {
                if bootstrap {
                    // failed bootstrap contacts go to the back of the
                    // line rather than being forgotten
                    self.add_bootstrap(remote);
                }
            }
            TxContext::GetPeers { search, .. } => {
                if let Some(s) = self.searches.get_mut(search) {
                    s.on_failure();
                }
            }
            TxContext::AnnouncePeer { .. } => {}
        }
    }

    /// The scheduler. Runs the periodic sweeps and returns the
    /// deadline for the next invocation.
    pub fn on_awake<S: Sink>(&mut self, sink: &mut S) -> Instant {
        let now = self.now;
        for expired in self.txs.expire(now) {
            self.on_tx_timeout(expired);
        }
        for contact in self.table.take_retired() {
            self.add_bootstrap(contact);
        }

        let mut next = now + self.config.refresh_interval;
        next = next.min(self.awake_discover(sink));
        next = next.min(self.awake_ping(sink));
        next = next.min(self.awake_peer_db());
        next = next.min(self.awake_searches(sink));
        self.adopt_external();

        next.max(now + self.config.min_timeout_interval)
    }

    fn should_mark_bad(&self, slot_outstanding: u8, last_response: Instant) -> bool {
        slot_outstanding > self.config.max_outstanding_pings
            && last_response + self.config.refresh_interval < self.now
    }

    /// Ping/refresh sweep: walk the timeout wheel and ping every
    /// contact whose last send is older than the refresh interval.
    fn awake_ping<S: Sink>(&mut self, sink: &mut S) -> Instant {
        let refresh = self.config.refresh_interval;
        loop {
            let slot = match self.table.take_expired(self.now, refresh, 1).first() {
                Some(slot) => *slot,
                None => break,
            };
            let (node_id, addr, mark) = {
                let node = self.table.node(slot).expect("expired slot is live");
                (
                    node.id,
                    node.addr,
                    node.good && self.should_mark_bad(node.outstanding_pings, node.last_response),
                )
            };
            if mark {
                debug!("{} stopped answering, marking bad", node_id);
                self.table.mark_bad(slot);
            }

            let tx = match self
                .txs
                .mint(&mut self.rng, self.now, TxContext::Ping { id: node_id })
            {
                Some(tx) => tx,
                None => {
                    // out of transactions: put the contact back at the
                    // head and retry when the earliest one expires
                    self.table.requeue_front(slot);
                    return self
                        .txs
                        .next_available_at()
                        .unwrap_or(self.now + refresh);
                }
            };
            let own = *self.table.own_id();
            let mut buf = [0u8; OUT_BUF];
            let mut enc = Encoder::new(&mut buf);
            if krpc::request::ping(&mut enc, &tx, &own).is_ok() {
                let len = enc.position();
                if sink.send(addr, &buf[..len]) {
                    self.stats.tx_query += 1;
                } else {
                    self.stats.send_failures += 1;
                }
            }
            {
                let node = self.table.node_mut(slot).expect("expired slot is live");
                node.outstanding_pings = node.outstanding_pings.saturating_add(1);
                // stamp even when the send was dropped, otherwise a
                // crowded wheel spins the loop on the same contacts
                node.last_request_sent = self.now;
            }
            self.table.requeue(slot);
        }
        self.table
            .next_deadline(refresh)
            .unwrap_or(self.now + refresh)
    }

    /// Discovery sweep: while the table is below its fill target, ask
    /// stale good contacts (and then the bootstrap list) for nodes
    /// near our own id.
    fn awake_discover<S: Sink>(&mut self, sink: &mut S) -> Instant {
        let refresh = self.config.refresh_interval;
        let all = self.config.max_routing_nodes();
        let good = self.table.good_nodes();
        let current = good * 100 / all;
        if current >= self.config.percentage_seek {
            return self.now + refresh;
        }
        let mut missing = all - good;
        trace!(
            "discovery: good {} total {} bad {} seeking {}",
            good,
            self.table.total_nodes(),
            self.table.bad_nodes(),
            missing
        );

        let own = *self.table.own_id();
        let mut sent = 0usize;
        let mut minted_out = false;
        let mut skipped: Vec<u32> = Vec::new();

        while missing > 0 {
            let slot = match self.table.take_expired(self.now, refresh, 1).first() {
                Some(slot) => *slot,
                None => break,
            };
            let (good_node, addr) = {
                let node = self.table.node(slot).expect("expired slot is live");
                (node.good, node.addr)
            };
            if !good_node {
                // leave them for the ping sweep
                skipped.push(slot);
                continue;
            }
            let tx = match self.txs.mint(
                &mut self.rng,
                self.now,
                TxContext::FindNode {
                    target: own,
                    remote: addr,
                    bootstrap: false,
                },
            ) {
                Some(tx) => tx,
                None => {
                    skipped.push(slot);
                    minted_out = true;
                    break;
                }
            };
            let mut buf = [0u8; OUT_BUF];
            let mut enc = Encoder::new(&mut buf);
            if krpc::request::find_node(&mut enc, &tx, &own, &own).is_ok() {
                let len = enc.position();
                if sink.send(addr, &buf[..len]) {
                    self.stats.tx_query += 1;
                } else {
                    self.stats.send_failures += 1;
                }
            }
            self.table
                .node_mut(slot)
                .expect("expired slot is live")
                .last_request_sent = self.now;
            self.table.requeue(slot);
            sent += 1;
            // every answered find_node can teach us up to K contacts
            missing -= missing.min(K);
        }
        // unpinged contacts go back to the stale end, preserving order
        for slot in skipped.into_iter().rev() {
            self.table.requeue_front(slot);
        }

        // drain the bootstrap list, at most once per sweep
        if missing > 0 && !minted_out {
            while missing > 0 {
                let addr = match self.bootstrap.pop_front() {
                    Some(addr) => addr,
                    None => break,
                };
                let tx = match self.txs.mint(
                    &mut self.rng,
                    self.now,
                    TxContext::FindNode {
                        target: own,
                        remote: addr,
                        bootstrap: true,
                    },
                ) {
                    Some(tx) => tx,
                    None => {
                        self.bootstrap.push_front(addr);
                        minted_out = true;
                        break;
                    }
                };
                debug!("bootstrapping via {}", addr);
                let mut buf = [0u8; OUT_BUF];
                let mut enc = Encoder::new(&mut buf);
                if krpc::request::find_node(&mut enc, &tx, &own, &own).is_ok() {
                    let len = enc.position();
                    if sink.send(addr, &buf[..len]) {
                        self.stats.tx_query += 1;
                    } else {
                        self.stats.send_failures += 1;
                    }
                }
                sent += 1;
                missing -= missing.min(K);
            }
        }

        if missing > 0 {
            if minted_out {
                return self
                    .txs
                    .next_available_at()
                    .unwrap_or(self.now + self.config.transaction_timeout);
            }
            if sent == 0 {
                // nothing to ask; try again after a transaction
                // timeout's worth of waiting
                return self.now + self.config.transaction_timeout;
            }
        }
        self.now + refresh
    }

    /// Peer-database sweep: age out stale announcements.
    fn awake_peer_db(&mut self) -> Instant {
        self.store.sweep(self.now, self.last_activity);
        self.store
            .next_deadline()
            .unwrap_or(self.now + self.config.refresh_interval)
    }

    /// Drive active searches and retire the finished ones.
    fn awake_searches<S: Sink>(&mut self, sink: &mut S) -> Instant {
        let alpha = self.config.alpha;
        let now = self.now;
        let own = *self.table.own_id();
        {
            let Dht {
                searches,
                txs,
                rng,
                stats,
                ..
            } = self;
            for search in searches.iter_mut() {
                loop {
                    if !txs.has_free() {
                        break;
                    }
                    let (_, addr) = match search.next_contact(alpha) {
                        Some(next) => next,
                        None => break,
                    };
                    let target = *search.target();
                    let tx = txs
                        .mint(
                            rng,
                            now,
                            TxContext::GetPeers {
                                infohash: target,
                                search: search.id(),
                                remote: addr,
                            },
                        )
                        .expect("has_free checked above");
                    let mut buf = [0u8; OUT_BUF];
                    let mut enc = Encoder::new(&mut buf);
                    if krpc::request::get_peers(&mut enc, &tx, &own, &target).is_ok() {
                        let len = enc.position();
                        if sink.send(addr, &buf[..len]) {
                            stats.tx_query += 1;
                        } else {
                            stats.send_failures += 1;
                        }
                    }
                }
            }
        }

        for done in self.searches.retire(now) {
            let search = done.id();
            let target = *done.target();
            let peers = done.into_found();
            info!("search {:?} for {} finished with {} peers", search, target, peers.len());
            self.events.push_back(Event::SearchFinished {
                search,
                target,
                peers,
            });
        }

        self.searches
            .next_deadline()
            .unwrap_or(now + self.config.refresh_interval)
    }

    /// Adopt the election winner: remember the address and remint the
    /// own id against it per BEP-42.
    fn adopt_external(&mut self) {
        let winner = match self.election.winner(self.config.min_ip_votes) {
            Some(winner) => winner,
            None => return,
        };
        if let Some(current) = self.external {
            if current.ip() == winner.ip() {
                self.external = Some(winner);
                return;
            }
        }
        info!("external address elected: {}", winner);
        self.external = Some(winner);
        if let IpAddr::V4(ip) = winner.ip() {
            let new_id = id::mint_self_id(Some(ip), &mut self.rng);
            info!("reminting id for {}: {}", ip, new_id);
            for contact in self.table.reset(new_id) {
                self.add_bootstrap(contact);
            }
            self.election.reset();
            self.events.push_back(Event::ExternalAddress {
                addr: winner,
                id: new_id,
            });
        }
    }
}
