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

//! The event loop.
//!
//! Single-threaded readiness polling over the DHT UDP socket and the
//! local control socket, with the poll timeout supplied by the DHT
//! scheduler and shutdown driven by a signal flag. Every readiness
//! tick drains all pending datagrams of a socket before yielding.

use crate::control;
use crate::dump;
use log::{debug, info, warn};
use mainline_dht::{Dht, Event, SearchId, Sink};
use mio::net::{UdpSocket, UnixDatagram};
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

const UDP: Token = Token(0);
const CONTROL: Token = Token(1);
/// Datagram scratch; matches the protocol handler's own limits.
const BUF: usize = 16 * 1024;

struct UdpSink<'a> {
    socket: &'a UdpSocket,
}

impl<'a> Sink for UdpSink<'a> {
    fn send(&mut self, to: std::net::SocketAddr, datagram: &[u8]) -> bool {
        match self.socket.send_to(datagram, to) {
            Ok(_) => true,
            Err(err) => {
                // transient loss; the transaction timeout recovers
                debug!("send to {} failed: {}", to, err);
                false
            }
        }
    }
}

pub struct Server {
    poll: Poll,
    udp: UdpSocket,
    control: UnixDatagram,
    control_path: PathBuf,
    dht: Dht,
    term: Arc<AtomicBool>,
    db: Option<PathBuf>,
    /// Control clients waiting on a search, keyed by search id.
    watchers: HashMap<SearchId, (PathBuf, Vec<u8>)>,
}

impl Server {
    pub fn new(
        mut udp: UdpSocket,
        mut control: UnixDatagram,
        control_path: PathBuf,
        dht: Dht,
        term: Arc<AtomicBool>,
        db: Option<PathBuf>,
    ) -> io::Result<Server> {
        let poll = Poll::new()?;
        poll.registry().register(&mut udp, UDP, Interest::READABLE)?;
        poll.registry()
            .register(&mut control, CONTROL, Interest::READABLE)?;
        Ok(Server {
            poll,
            udp,
            control,
            control_path,
            dht,
            term,
            db,
            watchers: HashMap::new(),
        })
    }

    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(64);
        let mut inbuf = vec![0u8; BUF];
        let mut outbuf = vec![0u8; BUF];

        // first awake contacts the bootstrap list right away
        self.dht.tick(Instant::now());
        let mut deadline = {
            let mut sink = UdpSink { socket: &self.udp };
            self.dht.on_awake(&mut sink)
        };

        loop {
            if self.term.load(Ordering::Relaxed) {
                break;
            }
            let now = self.dht.tick(Instant::now());
            let timeout = deadline.saturating_duration_since(now);
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
            self.dht.tick(Instant::now());

            for event in events.iter() {
                match event.token() {
                    UDP => self.drain_udp(&mut inbuf, &mut outbuf),
                    CONTROL => self.drain_control(&mut inbuf, &mut outbuf),
                    _ => {}
                }
            }

            self.dht.tick(Instant::now());
            deadline = {
                let mut sink = UdpSink { socket: &self.udp };
                self.dht.on_awake(&mut sink)
            };
            self.forward_events(&mut outbuf);
        }

        self.shutdown();
        Ok(())
    }

    fn drain_udp(&mut self, inbuf: &mut [u8], outbuf: &mut [u8]) {
        loop {
            match self.udp.recv_from(inbuf) {
                Ok((len, src)) => {
                    if let Some(rlen) = self.dht.handle_packet(src, &inbuf[..len], outbuf) {
                        if let Err(err) = self.udp.send_to(&outbuf[..rlen], src) {
                            debug!("reply to {} failed: {}", src, err);
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("udp recv failed: {}", err);
                    break;
                }
            }
        }
    }

    fn drain_control(&mut self, inbuf: &mut [u8], outbuf: &mut [u8]) {
        loop {
            match self.control.recv_from(inbuf) {
                Ok((len, src)) => {
                    let (reply, started) = control::handle(&mut self.dht, &inbuf[..len], outbuf);
                    let client = src.as_pathname().map(Path::to_path_buf);
                    if let (Some(rlen), Some(path)) = (reply, client.as_ref()) {
                        if let Err(err) = self.control.send_to(&outbuf[..rlen], path) {
                            debug!("control reply failed: {}", err);
                        }
                    }
                    if let (Some(started), Some(path)) = (started, client) {
                        self.watchers.insert(started.search, (path, started.tx));
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("control recv failed: {}", err);
                    break;
                }
            }
        }
    }

    /// Stream search progress to the waiting control clients.
    fn forward_events(&mut self, outbuf: &mut [u8]) {
        while let Some(event) = self.dht.poll_event() {
            match event {
                Event::SearchProgress { search, peers, .. } => {
                    if let Some((path, tx)) = self.watchers.get(&search) {
                        if let Some(len) =
                            control::compose_search_update(&self.dht, tx, &peers, false, outbuf)
                        {
                            let _ = self.control.send_to(&outbuf[..len], path);
                        }
                    }
                }
                Event::SearchFinished { search, peers, .. } => {
                    if let Some((path, tx)) = self.watchers.remove(&search) {
                        if let Some(len) =
                            control::compose_search_update(&self.dht, &tx, &peers, true, outbuf)
                        {
                            let _ = self.control.send_to(&outbuf[..len], &path);
                        }
                    }
                }
                Event::ExternalAddress { addr, id } => {
                    info!("external address {}, node id now {}", addr, id);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        info!("shutting down");
        if let Some(db) = &self.db {
            let contacts = self.dht.contacts();
            match dump::dump(db, self.dht.id(), &contacts) {
                Ok(()) => info!("dumped {} contacts to {}", contacts.len(), db.display()),
                Err(err) => warn!("dump to {} failed: {}", db.display(), err),
            }
        }
        let _ = std::fs::remove_file(&self.control_path);
    }
}
