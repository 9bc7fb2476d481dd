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

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "mainline-node", about = "BitTorrent Mainline DHT node")]
pub struct Options {
    /// UDP port to listen on.
    #[structopt(long = "bind", default_value = "6881")]
    pub bind: u16,

    /// Bootstrap contact as host:port; may be given multiple times.
    #[structopt(long = "bootstrap", number_of_values = 1)]
    pub bootstrap: Vec<String>,

    /// Routing-table dump file, written on shutdown and restored on
    /// startup.
    #[structopt(long = "db", parse(from_os_str))]
    pub db: Option<PathBuf>,

    /// Path of the Unix-domain control socket. Defaults to
    /// $XDG_RUNTIME_DIR/mainline/mainline.socket.
    #[structopt(long = "local", parse(from_os_str))]
    pub local: Option<PathBuf>,

    /// Notify systemd once the sockets are up.
    #[structopt(long = "systemd")]
    pub systemd: bool,
}

impl Options {
    /// Resolve every `--bootstrap` argument; a name that does not
    /// resolve is an argument error.
    pub fn resolve_bootstrap(&self) -> io::Result<Vec<SocketAddr>> {
        let mut out = Vec::new();
        for entry in &self.bootstrap {
            let mut addrs = entry.to_socket_addrs()?.peekable();
            if addrs.peek().is_none() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} resolved to nothing", entry),
                ));
            }
            // IPv4 wire format only; keep the v4 addresses
            out.extend(addrs.filter(|a| a.is_ipv4()));
        }
        Ok(out)
    }

    pub fn control_socket_path(&self) -> io::Result<PathBuf> {
        if let Some(path) = &self.local {
            return Ok(path.clone());
        }
        let runtime = std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        let dir = runtime.join("mainline");
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join("mainline.socket"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_is_repeatable() {
        let opts = Options::from_iter(&[
            "mainline-node",
            "--bind",
            "7000",
            "--bootstrap",
            "127.0.0.1:6881",
            "--bootstrap",
            "127.0.0.2:6882",
        ]);
        assert_eq!(opts.bind, 7000);
        let resolved = opts.resolve_bootstrap().unwrap();
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn unresolvable_bootstrap_is_an_error() {
        let opts = Options::from_iter(&[
            "mainline-node",
            "--bootstrap",
            "definitely-not-a-host.invalid.:1",
        ]);
        assert!(opts.resolve_bootstrap().is_err());
    }
}
