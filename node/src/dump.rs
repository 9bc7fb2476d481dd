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

//! Dump and restore of the node image.
//!
//! On shutdown the node writes `{id, nodes}` — the self id plus every
//! known contact in compact 26-byte form. On startup the image, if
//! present, restores the id and seeds the bootstrap list.

use mainline_bencode::{Decoder, Encoder};
use mainline_dht::{peer_from_compact, peer_to_compact, NodeId, COMPACT_NODE_LEN};
use std::io;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug)]
pub struct Image {
    pub id: NodeId,
    pub contacts: Vec<SocketAddr>,
}

fn codec_err(err: mainline_bencode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Encode the image into `enc`; shared with the control plane's
/// `dump` query.
pub fn encode_image(
    enc: &mut Encoder<'_>,
    id: &NodeId,
    contacts: &[(NodeId, SocketAddr)],
) -> mainline_bencode::Result<()> {
    let compact: Vec<(&NodeId, [u8; 6])> = contacts
        .iter()
        .filter_map(|(id, addr)| peer_to_compact(addr).map(|c| (id, c)))
        .collect();
    enc.dict(|e| {
        e.pair_bytes("id", id.as_bytes())?;
        e.text("nodes")?;
        e.bytes_with(compact.len() * COMPACT_NODE_LEN, |raw| {
            for (id, peer) in &compact {
                raw.put(id.as_bytes())?;
                raw.put(peer)?;
            }
            Ok(())
        })
    })
}

pub fn dump(path: &Path, id: &NodeId, contacts: &[(NodeId, SocketAddr)]) -> io::Result<()> {
    let mut buf = vec![0u8; 4096 + contacts.len() * COMPACT_NODE_LEN];
    let mut enc = Encoder::new(&mut buf);
    encode_image(&mut enc, id, contacts).map_err(codec_err)?;
    let len = enc.position();
    std::fs::write(path, &buf[..len])
}

/// `Ok(None)` when there is no image at `path`.
pub fn restore(path: &Path) -> io::Result<Option<Image>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let mut dec = Decoder::new(&bytes);
    let mut id = None;
    let mut contacts = Vec::new();
    dec.dict_entries(|d, key| {
        match key {
            b"id" => id = NodeId::from_bytes(d.bytes()?),
            b"nodes" => {
                let raw = d.bytes()?;
                if raw.len() % COMPACT_NODE_LEN != 0 {
                    return Err(mainline_bencode::Error::Malformed);
                }
                for chunk in raw.chunks(COMPACT_NODE_LEN) {
                    if let Some(addr) = peer_from_compact(&chunk[20..]) {
                        contacts.push(addr);
                    }
                }
            }
            _ => d.skip_value()?,
        }
        Ok(())
    })
    .map_err(codec_err)?;
    let id = id.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "image without id"))?;
    Ok(Some(Image { id, contacts }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("mainline-dump-{}-{}", tag, std::process::id()))
    }

    #[test]
    fn roundtrip_preserves_id_and_contact_set() {
        let path = temp_path("roundtrip");
        let id = NodeId([0x5au8; 20]);
        let contacts: Vec<(NodeId, SocketAddr)> = (1..=10u8)
            .map(|i| {
                (
                    NodeId([i; 20]),
                    SocketAddr::V4(SocketAddrV4::new(
                        Ipv4Addr::new(10, 0, 0, i),
                        6880 + u16::from(i),
                    )),
                )
            })
            .collect();
        dump(&path, &id, &contacts).unwrap();
        let image = restore(&path).unwrap().unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(image.id, id);
        let want: HashSet<SocketAddr> = contacts.iter().map(|(_, a)| *a).collect();
        let got: HashSet<SocketAddr> = image.contacts.into_iter().collect();
        assert_eq!(want, got);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        assert!(restore(&temp_path("missing")).unwrap().is_none());
    }

    #[test]
    fn truncated_image_is_invalid_data() {
        let path = temp_path("truncated");
        std::fs::write(&path, b"d2:id20:aaaaaaaaaaaaaaaaaaaa5:nodes10:xx").unwrap();
        let err = restore(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
