//! Packet handles.
//!
//! A [`Packet`] owns one frame plus the producer's completion hook. Ownership
//! moves between lists; the packet is disposed of exactly once, either through
//! [`Packet::complete`], [`Packet::release`], or implicitly (as a release) when
//! it is dropped.

use std::fmt;
use std::sync::Arc;

use crate::eth::EthAddress;

/// How a packet left the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// The packet was delivered (or consumed) and the producer is notified.
    Completed,
    /// The packet was dropped and its resources returned.
    Released,
}

/// Producer-side hook invoked once when a packet is disposed of.
pub trait PacketCompletion: Send + Sync {
    /// Called exactly once per packet that carries this hook.
    fn dispose(&self, tag: u64, disposition: Disposition);
}

/// One network frame plus metadata.
pub struct Packet {
    frame: Arc<[u8]>,
    tag: u64,
    completion: Option<Arc<dyn PacketCompletion>>,
}

impl Packet {
    /// Creates a packet with no completion hook.
    pub fn new(frame: impl Into<Arc<[u8]>>) -> Self {
        Self {
            frame: frame.into(),
            tag: 0,
            completion: None,
        }
    }

    /// Sets the producer tag reported back on disposal.
    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    /// Attaches a completion hook.
    pub fn with_completion(mut self, completion: Arc<dyn PacketCompletion>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    /// Destination MAC, if the frame is long enough to carry one.
    pub fn dst_mac(&self) -> Option<EthAddress> {
        EthAddress::from_slice(self.frame.get(0..6)?)
    }

    /// Source MAC, if the frame is long enough to carry one.
    pub fn src_mac(&self) -> Option<EthAddress> {
        EthAddress::from_slice(self.frame.get(6..12)?)
    }

    /// Returns a second handle sharing the same frame. The clone carries no
    /// completion hook, so only the original reports back to the producer.
    pub fn clone_handle(&self) -> Packet {
        Packet {
            frame: Arc::clone(&self.frame),
            tag: self.tag,
            completion: None,
        }
    }

    /// Returns a packet with a private copy of the frame.
    pub fn deep_copy(&self) -> Packet {
        Packet {
            frame: Arc::from(&self.frame[..]),
            tag: self.tag,
            completion: None,
        }
    }

    /// Disposes of the packet as delivered.
    pub fn complete(mut self) {
        self.dispose(Disposition::Completed);
    }

    /// Disposes of the packet as dropped.
    pub fn release(mut self) {
        self.dispose(Disposition::Released);
    }

    fn dispose(&mut self, disposition: Disposition) {
        if let Some(completion) = self.completion.take() {
            completion.dispose(self.tag, disposition);
        }
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        self.dispose(Disposition::Released);
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("tag", &self.tag)
            .field("len", &self.frame.len())
            .field("has_completion", &self.completion.is_some())
            .finish()
    }
}
