//! Single-pass multi-digest hashing of a byte stream.
//!
//! `MultiHashStream` wraps a body stream and forwards every chunk unchanged
//! while feeding it to each configured digest. Memory use is the digest
//! state only; the payload is never buffered. The digests are delivered on a
//! oneshot channel when the inner stream ends cleanly. On a read error the
//! error is forwarded and the channel is dropped without a value.

use bytes::Bytes;
use crc::{CRC_64_XZ, Crc};
use futures::Stream;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, BTreeSet},
    io, mem,
    pin::Pin,
    task::{Context, Poll, ready},
};
use tokio::sync::oneshot;

/// CRC-64/XZ is the polynomial COS reports as `crc64ecma`.
static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashAlgorithm {
    Crc64,
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 4] = [
        HashAlgorithm::Crc64,
        HashAlgorithm::Md5,
        HashAlgorithm::Sha1,
        HashAlgorithm::Sha256,
    ];

    /// Template token resolved from this digest.
    pub fn placeholder(self) -> &'static str {
        match self {
            HashAlgorithm::Crc64 => "${CRC64}",
            HashAlgorithm::Md5 => "${MD5}",
            HashAlgorithm::Sha1 => "${SHA1}",
            HashAlgorithm::Sha256 => "${SHA256}",
        }
    }

    /// Head header that already carries this digest, when the store has it.
    pub fn metadata_header(self) -> &'static str {
        match self {
            HashAlgorithm::Crc64 => "x-cos-hash-crc64ecma",
            HashAlgorithm::Md5 => "x-cos-meta-md5",
            HashAlgorithm::Sha1 => "x-cos-meta-sha1",
            HashAlgorithm::Sha256 => "x-cos-meta-sha256",
        }
    }
}

enum Accumulator {
    Crc64(crc::Digest<'static, u64>),
    Md5(md5::Context),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Accumulator {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Crc64 => Accumulator::Crc64(CRC64.digest()),
            HashAlgorithm::Md5 => Accumulator::Md5(md5::Context::new()),
            HashAlgorithm::Sha1 => Accumulator::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Accumulator::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Accumulator::Crc64(digest) => digest.update(data),
            Accumulator::Md5(context) => context.consume(data),
            Accumulator::Sha1(hasher) => hasher.update(data),
            Accumulator::Sha256(hasher) => hasher.update(data),
        }
    }

    /// Lowercase hex of the final digest.
    fn finish(self) -> String {
        match self {
            Accumulator::Crc64(digest) => format!("{:016x}", digest.finalize()),
            Accumulator::Md5(context) => format!("{:x}", context.compute()),
            Accumulator::Sha1(hasher) => hex::encode(hasher.finalize()),
            Accumulator::Sha256(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

/// Final digests of one stream, lowercase hex per algorithm.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HashDigests(BTreeMap<HashAlgorithm, String>);

impl HashDigests {
    pub fn get(&self, algorithm: HashAlgorithm) -> Option<&str> {
        self.0.get(&algorithm).map(String::as_str)
    }

    /// The digest as a template value. CRC-64 is rendered in decimal to match
    /// the form the store reports in `x-cos-hash-crc64ecma`.
    pub fn placeholder_value(&self, algorithm: HashAlgorithm) -> Option<String> {
        let hex = self.get(algorithm)?;
        match algorithm {
            HashAlgorithm::Crc64 => u64::from_str_radix(hex, 16).ok().map(|v| v.to_string()),
            _ => Some(hex.to_string()),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Pass-through stream that hashes what flows through it.
pub struct MultiHashStream<S> {
    inner: S,
    accumulators: Vec<(HashAlgorithm, Accumulator)>,
    done: Option<oneshot::Sender<HashDigests>>,
}

impl<S> MultiHashStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    /// Wrap `inner`, hashing with each distinct algorithm in `algorithms`.
    pub fn new(inner: S, algorithms: &[HashAlgorithm]) -> (Self, oneshot::Receiver<HashDigests>) {
        let (tx, rx) = oneshot::channel();
        let accumulators = algorithms
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|algorithm| (algorithm, Accumulator::new(algorithm)))
            .collect();
        (
            Self {
                inner,
                accumulators,
                done: Some(tx),
            },
            rx,
        )
    }
}

impl<S> Stream for MultiHashStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
            Some(Ok(chunk)) => {
                for (_, accumulator) in this.accumulators.iter_mut() {
                    accumulator.update(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(err)) => {
                // A failed read never completes.
                this.done = None;
                this.accumulators.clear();
                Poll::Ready(Some(Err(err)))
            }
            None => {
                if let Some(tx) = this.done.take() {
                    let digests = mem::take(&mut this.accumulators)
                        .into_iter()
                        .map(|(algorithm, accumulator)| (algorithm, accumulator.finish()))
                        .collect();
                    let _ = tx.send(HashDigests(digests));
                }
                Poll::Ready(None)
            }
        }
    }
}
