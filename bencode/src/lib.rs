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

//! Bencode encoder and decoder over contiguous byte buffers.
//!
//! Both halves operate on a caller-supplied buffer with an explicit
//! position. Every operation is atomic with respect to that position:
//! on failure the position is restored to its value before the call,
//! at every nesting level. This allows a composer to attempt a message
//! and fall back without leaving a half-written prefix in the buffer,
//! and a parser to probe for alternatives without consuming input.

use thiserror::Error;

/// Errors produced by [`Encoder`] and [`Decoder`] operations.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// The output buffer cannot hold the value being encoded.
    #[error("output buffer overflow")]
    Overflow,
    /// The input does not conform to the bencode grammar.
    #[error("malformed bencode")]
    Malformed,
    /// The next value in the input is not of the requested type.
    #[error("unexpected value type")]
    UnexpectedType,
    /// The input ended before the value did.
    #[error("unexpected end of input")]
    UnexpectedEof,
}

pub type Result<T> = std::result::Result<T, Error>;

/// The four bencode value shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Integer,
    Bytes,
    List,
    Dict,
}

/// Streaming bencode encoder over a fixed byte buffer.
///
/// Dictionary keys are the caller's responsibility: bencode requires
/// them in ascending byte order and the encoder does not reorder.
pub struct Encoder<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Encoder { buf, pos: 0 }
    }

    /// Number of bytes written so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buf.len() - self.pos < bytes.len() {
            return Err(Error::Overflow);
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    /// Encode `i<value>e`.
    pub fn integer(&mut self, value: i64) -> Result<()> {
        let mark = self.pos;
        let digits = value.to_string();
        self.put(b"i")
            .and_then(|()| self.put(digits.as_bytes()))
            .and_then(|()| self.put(b"e"))
            .map_err(|e| {
                self.pos = mark;
                e
            })
    }

    /// Encode `<len>:<raw>`.
    pub fn bytes(&mut self, value: &[u8]) -> Result<()> {
        let mark = self.pos;
        let len = value.len().to_string();
        self.put(len.as_bytes())
            .and_then(|()| self.put(b":"))
            .and_then(|()| self.put(value))
            .map_err(|e| {
                self.pos = mark;
                e
            })
    }

    pub fn text(&mut self, value: &str) -> Result<()> {
        self.bytes(value.as_bytes())
    }

    /// Encode a byte string of known length whose payload is produced
    /// by `fill` writing raw bytes. Used for the compact node/peer
    /// forms where the payload is a concatenation, not a nested value.
    pub fn bytes_with<F>(&mut self, len: usize, fill: F) -> Result<()>
    where
        F: FnOnce(&mut RawEncoder<'_, 'a>) -> Result<()>,
    {
        let mark = self.pos;
        let prefix = len.to_string();
        let attempt = (|| {
            self.put(prefix.as_bytes())?;
            self.put(b":")?;
            let start = self.pos;
            let mut raw = RawEncoder { inner: &mut *self };
            fill(&mut raw)?;
            if self.pos - start != len {
                return Err(Error::Malformed);
            }
            Ok(())
        })();
        attempt.map_err(|e| {
            self.pos = mark;
            e
        })
    }

    /// Encode `l ... e`, the body supplied by `f`.
    pub fn list<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Encoder<'a>) -> Result<()>,
    {
        self.container(b"l", f)
    }

    /// Encode `d ... e`, the body supplied by `f`. The body must be an
    /// even sequence of key (byte string) and value, keys ascending.
    pub fn dict<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Encoder<'a>) -> Result<()>,
    {
        self.container(b"d", f)
    }

    fn container<F>(&mut self, open: &[u8], f: F) -> Result<()>
    where
        F: FnOnce(&mut Encoder<'a>) -> Result<()>,
    {
        let mark = self.pos;
        let attempt = self
            .put(open)
            .and_then(|()| f(self))
            .and_then(|()| self.put(b"e"));
        attempt.map_err(|e| {
            self.pos = mark;
            e
        })
    }

    pub fn pair_integer(&mut self, key: &str, value: i64) -> Result<()> {
        let mark = self.pos;
        self.text(key).and_then(|()| self.integer(value)).map_err(|e| {
            self.pos = mark;
            e
        })
    }

    pub fn pair_bytes(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let mark = self.pos;
        self.text(key).and_then(|()| self.bytes(value)).map_err(|e| {
            self.pos = mark;
            e
        })
    }
}

/// Raw byte access inside [`Encoder::bytes_with`].
pub struct RawEncoder<'e, 'a> {
    inner: &'e mut Encoder<'a>,
}

impl<'e, 'a> RawEncoder<'e, 'a> {
    pub fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.put(bytes)
    }
}

/// Streaming bencode decoder over a byte slice.
///
/// Values borrow from the input; byte strings are returned as
/// subslices without copying.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Decoder { buf, pos: 0 }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// True when the whole input has been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn byte(&self) -> Result<u8> {
        self.buf.get(self.pos).copied().ok_or(Error::UnexpectedEof)
    }

    /// Classify the next value without consuming it.
    pub fn peek(&self) -> Result<Kind> {
        match self.byte()? {
            b'i' => Ok(Kind::Integer),
            b'l' => Ok(Kind::List),
            b'd' => Ok(Kind::Dict),
            b'0'..=b'9' => Ok(Kind::Bytes),
            _ => Err(Error::Malformed),
        }
    }

    /// True when the next byte terminates the enclosing container.
    pub fn at_container_end(&self) -> bool {
        self.buf.get(self.pos) == Some(&b'e')
    }

    /// Decode `i<value>e`.
    pub fn integer(&mut self) -> Result<i64> {
        let mark = self.pos;
        self.integer_inner().map_err(|e| {
            self.pos = mark;
            e
        })
    }

    fn integer_inner(&mut self) -> Result<i64> {
        if self.byte()? != b'i' {
            return Err(Error::UnexpectedType);
        }
        self.pos += 1;
        let negative = if self.byte()? == b'-' {
            self.pos += 1;
            true
        } else {
            false
        };
        let mut value: i64 = 0;
        let mut digits = 0usize;
        loop {
            match self.byte()? {
                d @ b'0'..=b'9' => {
                    value = value
                        .checked_mul(10)
                        .and_then(|v| v.checked_add(i64::from(d - b'0')))
                        .ok_or(Error::Malformed)?;
                    digits += 1;
                    self.pos += 1;
                }
                b'e' => break,
                _ => return Err(Error::Malformed),
            }
        }
        if digits == 0 {
            return Err(Error::Malformed);
        }
        self.pos += 1;
        Ok(if negative { -value } else { value })
    }

    /// Decode `<len>:<raw>`, returning the payload subslice.
    ///
    /// A length prefix that claims more bytes than remain in the input
    /// fails without consuming anything.
    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let mark = self.pos;
        self.bytes_inner().map_err(|e| {
            self.pos = mark;
            e
        })
    }

    fn bytes_inner(&mut self) -> Result<&'a [u8]> {
        let mut len: usize = 0;
        let mut digits = 0usize;
        loop {
            match self.byte()? {
                d @ b'0'..=b'9' => {
                    len = len
                        .checked_mul(10)
                        .and_then(|l| l.checked_add(usize::from(d - b'0')))
                        .ok_or(Error::Malformed)?;
                    digits += 1;
                    self.pos += 1;
                }
                b':' if digits > 0 => break,
                _ if digits == 0 => return Err(Error::UnexpectedType),
                _ => return Err(Error::Malformed),
            }
        }
        self.pos += 1;
        if self.buf.len() - self.pos < len {
            return Err(Error::UnexpectedEof);
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Decode `l ... e`, the body walked by `f`. `f` observes the end
    /// of the list via [`Decoder::at_container_end`].
    pub fn list<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Decoder<'a>) -> Result<T>,
    {
        self.container(b'l', f)
    }

    /// Decode `d ... e`, the body walked by `f`.
    pub fn dict<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Decoder<'a>) -> Result<T>,
    {
        self.container(b'd', f)
    }

    fn container<F, T>(&mut self, open: u8, f: F) -> Result<T>
    where
        F: FnOnce(&mut Decoder<'a>) -> Result<T>,
    {
        let mark = self.pos;
        let attempt = (|| {
            match self.byte()? {
                b if b == open => self.pos += 1,
                b'i' | b'l' | b'd' | b'0'..=b'9' => return Err(Error::UnexpectedType),
                _ => return Err(Error::Malformed),
            }
            let out = f(self)?;
            if self.byte()? != b'e' {
                return Err(Error::Malformed);
            }
            self.pos += 1;
            Ok(out)
        })();
        attempt.map_err(|e| {
            self.pos = mark;
            e
        })
    }

    /// Walk every entry of a dictionary. `f` is handed the key and
    /// must consume exactly the entry's value (or [`skip_value`] it).
    /// Keys are not required to be ordered on input.
    ///
    /// [`skip_value`]: Decoder::skip_value
    pub fn dict_entries<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Decoder<'a>, &'a [u8]) -> Result<()>,
    {
        self.dict(|d| {
            while !d.at_container_end() {
                let key = d.bytes()?;
                let before = d.pos;
                f(d, key)?;
                if d.pos == before {
                    // entry value must always be consumed
                    d.skip_value()?;
                }
            }
            Ok(())
        })
    }

    /// Walk every element of a list.
    pub fn list_entries<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Decoder<'a>) -> Result<()>,
    {
        self.list(|d| {
            while !d.at_container_end() {
                f(d)?;
            }
            Ok(())
        })
    }

    /// Skip one value of arbitrary shape. The wildcard walk used to
    /// ignore unknown dictionary keys.
    pub fn skip_value(&mut self) -> Result<()> {
        let mark = self.pos;
        self.skip_inner().map_err(|e| {
            self.pos = mark;
            e
        })
    }

    fn skip_inner(&mut self) -> Result<()> {
        match self.peek()? {
            Kind::Integer => self.integer_inner().map(|_| ()),
            Kind::Bytes => self.bytes_inner().map(|_| ()),
            Kind::List => self.container(b'l', |d| {
                while !d.at_container_end() {
                    d.skip_inner()?;
                }
                Ok(())
            }),
            Kind::Dict => self.container(b'd', |d| {
                while !d.at_container_end() {
                    d.bytes_inner()?;
                    d.skip_inner()?;
                }
                Ok(())
            }),
        }
    }
}

/// Best-effort human rendering of a bencoded buffer, for debug logs.
/// Renders as far as the input parses and marks the rest with `…`.
pub struct Pretty<'a>(pub &'a [u8]);

impl std::fmt::Display for Pretty<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dec = Decoder::new(self.0);
        if render(f, &mut dec, 0).is_err() {
            write!(f, "…")?;
        }
        Ok(())
    }
}

fn render(f: &mut std::fmt::Formatter<'_>, dec: &mut Decoder<'_>, depth: usize) -> Result<()> {
    if depth > 8 {
        return Err(Error::Malformed);
    }
    let fail = |_| Error::Malformed;
    match dec.peek()? {
        Kind::Integer => write!(f, "{}", dec.integer()?).map_err(fail),
        Kind::Bytes => {
            let raw = dec.bytes()?;
            if !raw.is_empty() && raw.len() <= 32 && raw.iter().all(|b| b.is_ascii_graphic()) {
                write!(f, "\"{}\"", String::from_utf8_lossy(raw)).map_err(fail)
            } else {
                write!(f, "0x").map_err(fail)?;
                for b in raw.iter().take(20) {
                    write!(f, "{:02x}", b).map_err(fail)?;
                }
                if raw.len() > 20 {
                    write!(f, "+{}", raw.len() - 20).map_err(fail)?;
                }
                Ok(())
            }
        }
        Kind::List => dec.list(|d| {
            write!(f, "[").map_err(fail)?;
            let mut first = true;
            while !d.at_container_end() {
                if !first {
                    write!(f, ", ").map_err(fail)?;
                }
                first = false;
                render(f, d, depth + 1)?;
            }
            write!(f, "]").map_err(fail)
        }),
        Kind::Dict => dec.dict(|d| {
            write!(f, "{{").map_err(fail)?;
            let mut first = true;
            while !d.at_container_end() {
                if !first {
                    write!(f, ", ").map_err(fail)?;
                }
                first = false;
                let key = d.bytes()?;
                write!(f, "{}: ", String::from_utf8_lossy(key)).map_err(fail)?;
                render(f, d, depth + 1)?;
            }
            write!(f, "}}").map_err(fail)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{quickcheck, Arbitrary, Gen};
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Value {
        Integer(i64),
        Bytes(Vec<u8>),
        List(Vec<Value>),
        Dict(BTreeMap<Vec<u8>, Value>),
    }

    fn arbitrary_value(g: &mut Gen, depth: usize) -> Value {
        let variants = if depth == 0 { 2 } else { 4 };
        match u8::arbitrary(g) % variants {
            0 => Value::Integer(i64::arbitrary(g)),
            1 => Value::Bytes(Vec::arbitrary(g)),
            2 => {
                let len = usize::arbitrary(g) % 4;
                Value::List((0..len).map(|_| arbitrary_value(g, depth - 1)).collect())
            }
            _ => {
                let len = usize::arbitrary(g) % 4;
                Value::Dict(
                    (0..len)
                        .map(|_| (Vec::arbitrary(g), arbitrary_value(g, depth - 1)))
                        .collect(),
                )
            }
        }
    }

    impl Arbitrary for Value {
        fn arbitrary(g: &mut Gen) -> Self {
            arbitrary_value(g, 3)
        }
    }

    fn encode_value(enc: &mut Encoder<'_>, v: &Value) -> Result<()> {
        match v {
            Value::Integer(i) => enc.integer(*i),
            Value::Bytes(b) => enc.bytes(b),
            Value::List(l) => enc.list(|e| {
                for item in l {
                    encode_value(e, item)?;
                }
                Ok(())
            }),
            Value::Dict(d) => enc.dict(|e| {
                for (k, item) in d {
                    e.bytes(k)?;
                    encode_value(e, item)?;
                }
                Ok(())
            }),
        }
    }

    fn decode_value(dec: &mut Decoder<'_>) -> Result<Value> {
        match dec.peek()? {
            Kind::Integer => dec.integer().map(Value::Integer),
            Kind::Bytes => dec.bytes().map(|b| Value::Bytes(b.to_vec())),
            Kind::List => dec.list(|d| {
                let mut out = Vec::new();
                while !d.at_container_end() {
                    out.push(decode_value(d)?);
                }
                Ok(Value::List(out))
            }),
            Kind::Dict => dec.dict(|d| {
                let mut out = BTreeMap::new();
                while !d.at_container_end() {
                    let key = d.bytes()?.to_vec();
                    out.insert(key, decode_value(d)?);
                }
                Ok(Value::Dict(out))
            }),
        }
    }

    fn encode_to_vec(v: &Value) -> Vec<u8> {
        let mut buf = vec![0u8; 64 * 1024];
        let mut enc = Encoder::new(&mut buf);
        encode_value(&mut enc, v).unwrap();
        let len = enc.position();
        buf.truncate(len);
        buf
    }

    quickcheck! {
        fn roundtrip(v: Value) -> bool {
            let wire = encode_to_vec(&v);
            let mut dec = Decoder::new(&wire);
            let back = decode_value(&mut dec).unwrap();
            dec.is_empty() && back == v
        }

        fn encoding_is_deterministic(v: Value) -> bool {
            encode_to_vec(&v) == encode_to_vec(&v)
        }
    }

    #[test]
    fn integer_sweep() {
        let mut buf = [0u8; 32];
        for i in 0..=65536i64 {
            let mut enc = Encoder::new(&mut buf);
            enc.integer(i).unwrap();
            let len = enc.position();
            let mut dec = Decoder::new(&buf[..len]);
            assert_eq!(dec.integer().unwrap(), i);
            assert!(dec.is_empty());
        }
    }

    #[test]
    fn negative_integers_roundtrip() {
        let mut buf = [0u8; 32];
        for &i in &[-1i64, -42, -65536, i64::MIN + 1, i64::MAX] {
            let mut enc = Encoder::new(&mut buf);
            enc.integer(i).unwrap();
            let len = enc.position();
            assert_eq!(Decoder::new(&buf[..len]).integer().unwrap(), i);
        }
    }

    #[test]
    fn short_length_prefix_fails_without_consuming() {
        // claims 10 bytes, supplies 3
        let mut dec = Decoder::new(b"10:abc");
        assert_eq!(dec.bytes(), Err(Error::UnexpectedEof));
        assert_eq!(dec.position(), 0);
    }

    #[test]
    fn type_mismatch_restores_position() {
        let mut dec = Decoder::new(b"4:spam");
        assert_eq!(dec.integer(), Err(Error::UnexpectedType));
        assert_eq!(dec.position(), 0);
        assert_eq!(dec.bytes().unwrap(), b"spam");
    }

    #[test]
    fn truncated_container_restores_position() {
        let mut dec = Decoder::new(b"l4:spam");
        let r = dec.list(|d| {
            while !d.at_container_end() {
                d.skip_value()?;
            }
            Ok(())
        });
        assert!(r.is_err());
        assert_eq!(dec.position(), 0);
    }

    #[test]
    fn encoder_overflow_restores_position() {
        let mut buf = [0u8; 8];
        let mut enc = Encoder::new(&mut buf);
        enc.text("ab").unwrap();
        let pos = enc.position();
        assert_eq!(enc.bytes(b"overlong payload"), Err(Error::Overflow));
        assert_eq!(enc.position(), pos);
    }

    #[test]
    fn nested_overflow_restores_outer_position() {
        let mut buf = [0u8; 10];
        let mut enc = Encoder::new(&mut buf);
        let r = enc.dict(|e| {
            e.pair_bytes("k", b"0123456789abcdef")
        });
        assert_eq!(r, Err(Error::Overflow));
        assert_eq!(enc.position(), 0);
    }

    #[test]
    fn wildcard_skips_unknown_shapes() {
        let wire = b"d1:ai1e1:bl3:fooi-2ee1:cd1:xi0eee";
        let mut dec = Decoder::new(wire);
        let mut keys = Vec::new();
        dec.dict_entries(|d, key| {
            keys.push(key.to_vec());
            d.skip_value()
        })
        .unwrap();
        assert!(dec.is_empty());
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn compact_payload_via_bytes_with() {
        let mut buf = [0u8; 32];
        let mut enc = Encoder::new(&mut buf);
        enc.bytes_with(6, |raw| {
            raw.put(&[1, 2, 3, 4])?;
            raw.put(&[0x1a, 0xe1])
        })
        .unwrap();
        let len = enc.position();
        assert_eq!(&buf[..len], b"6:\x01\x02\x03\x04\x1a\xe1");
    }

    #[test]
    fn pretty_renders_message_shapes() {
        let wire = b"d1:q4:ping1:t2:aa1:y1:qe";
        let text = format!("{}", Pretty(wire));
        assert_eq!(text, "{q: \"ping\", t: \"aa\", y: \"q\"}");
    }

    #[test]
    fn pretty_marks_truncated_input() {
        let text = format!("{}", Pretty(b"d1:q4:pi"));
        assert!(text.ends_with('…'));
    }

    #[test]
    fn integer_grammar_rejected() {
        for bad in [&b"ie"[..], b"i-e", b"i12", b"i1x2e"] {
            let mut dec = Decoder::new(bad);
            assert!(dec.integer().is_err());
            assert_eq!(dec.position(), 0);
        }
    }
}
