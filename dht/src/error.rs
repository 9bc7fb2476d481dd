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

use thiserror::Error;

/// Errors surfaced by the DHT core.
///
/// Handlers never unwind across the scheduler: every failure is
/// recovered at its point of origin and shows up as a counter or a
/// log line. These variants exist for the seams where a caller can
/// meaningfully react (codec failures, exhausted pools).
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    #[error("wire codec: {0}")]
    Codec(#[from] mainline_bencode::Error),
    /// The datagram is bencode but not a KRPC message.
    #[error("malformed KRPC message")]
    Message,
    /// No free transaction prefix; retry after the next expiry.
    #[error("transaction pool exhausted")]
    TransactionPool,
}

pub type Result<T> = std::result::Result<T, Error>;
