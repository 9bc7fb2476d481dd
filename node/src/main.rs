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

//! The Mainline DHT daemon.
//!
//! Exit codes: 0 success, 1 argument error, 2 signal setup failure,
//! 3 bind/file error, 4 dht init failure, 5 cache init failure.

mod control;
mod dump;
mod options;
mod server;

use log::info;
use mainline_dht::{Config, Dht};
use mio::net::{UdpSocket, UnixDatagram};
use options::Options;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use structopt::StructOpt;

fn main() {
    env_logger::init();
    let options = Options::from_args();

    let bootstrap = match options.resolve_bootstrap() {
        Ok(bootstrap) => bootstrap,
        Err(err) => {
            eprintln!("bad --bootstrap argument: {}", err);
            process::exit(1);
        }
    };

    let term = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGTERM, SIGQUIT] {
        if let Err(err) = signal_hook::flag::register(sig, Arc::clone(&term)) {
            eprintln!("failed to register signal {}: {}", sig, err);
            process::exit(2);
        }
    }

    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), options.bind);
    let udp = match UdpSocket::bind(bind) {
        Ok(socket) => socket,
        Err(err) => {
            eprintln!("failed to bind {}: {}", bind, err);
            process::exit(3);
        }
    };

    let control_path = match options.control_socket_path() {
        Ok(path) => path,
        Err(err) => {
            eprintln!("control socket path: {}", err);
            process::exit(3);
        }
    };
    let _ = std::fs::remove_file(&control_path);
    let control = match UnixDatagram::bind(&control_path) {
        Ok(socket) => socket,
        Err(err) => {
            eprintln!("failed to bind {}: {}", control_path.display(), err);
            process::exit(3);
        }
    };

    let mut dht = Dht::new(Config::default(), SmallRng::from_entropy(), Instant::now());

    if let Some(db) = &options.db {
        match dump::restore(db) {
            Ok(Some(image)) => {
                info!(
                    "restored id and {} contacts from {}",
                    image.contacts.len(),
                    db.display()
                );
                dht.set_id(image.id);
                for contact in image.contacts {
                    dht.add_bootstrap(contact);
                }
            }
            Ok(None) => {}
            Err(err) => {
                eprintln!("failed to restore {}: {}", db.display(), err);
                process::exit(5);
            }
        }
    }
    for contact in bootstrap {
        dht.add_bootstrap(contact);
    }

    info!("node id {}", dht.id());
    info!(
        "listening on {}, control socket {}",
        bind,
        control_path.display()
    );

    let mut server = match server::Server::new(
        udp,
        control,
        control_path,
        dht,
        term,
        options.db.clone(),
    ) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("dht init failed: {}", err);
            process::exit(4);
        }
    };

    #[cfg(target_os = "linux")]
    {
        if options.systemd {
            use libsystemd::daemon::{self, NotifyState};
            if let Err(err) = daemon::notify(false, &[NotifyState::Ready]) {
                log::warn!("sd_notify failed: {}", err);
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        if options.systemd {
            log::warn!("--systemd has no effect on this platform");
        }
    }

    if let Err(err) = server.run() {
        eprintln!("event loop failed: {}", err);
        process::exit(3);
    }
}
