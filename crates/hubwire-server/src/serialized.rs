//! Per-protocol memoization of an encoded message.
//!
//! A broadcast builds one [`SerializedHubMessage`] and hands the same `Arc`
//! to every recipient's queue. Each drain task asks it for bytes in its own
//! protocol; the first request per protocol encodes, every later one reuses
//! the bytes.
//!
//! The first two protocols live in `OnceLock` slots read without locking.
//! Populating a slot, and anything past two protocols, goes through the
//! overflow mutex with a second lookup after the lock is taken, so the
//! codec runs at most once per protocol.

use std::sync::OnceLock;

use bytes::Bytes;
use hubwire_core::errors::{HubError, Result};
use hubwire_core::protocol::{HubMessage, HubProtocol};
use metrics::counter;
use parking_lot::Mutex;

use crate::metrics::SERIALIZATIONS_TOTAL;

/// Encoded bytes for one protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedMessage {
    /// Protocol name the bytes were produced by.
    pub protocol: String,
    /// Framed payload.
    pub payload: Bytes,
}

impl SerializedMessage {
    /// Create an entry.
    pub fn new(protocol: impl Into<String>, payload: Bytes) -> Self {
        Self {
            protocol: protocol.into(),
            payload,
        }
    }
}

/// A message plus its lazily computed per-protocol encodings.
#[derive(Debug)]
pub struct SerializedHubMessage {
    message: Option<HubMessage>,
    slots: [OnceLock<SerializedMessage>; 2],
    overflow: Mutex<Vec<SerializedMessage>>,
}

impl SerializedHubMessage {
    /// Wrap a message; nothing is encoded yet.
    pub fn new(message: HubMessage) -> Self {
        Self {
            message: Some(message),
            slots: [OnceLock::new(), OnceLock::new()],
            overflow: Mutex::new(Vec::new()),
        }
    }

    /// Wrap payloads that were encoded elsewhere (e.g. relayed from another
    /// node). Protocols not present here cannot be produced later.
    pub fn from_serialized(messages: Vec<SerializedMessage>) -> Self {
        let this = Self {
            message: None,
            slots: [OnceLock::new(), OnceLock::new()],
            overflow: Mutex::new(Vec::new()),
        };
        {
            let mut overflow = this.overflow.lock();
            for entry in messages {
                if this.find_in_slots(&entry.protocol).is_some() {
                    continue;
                }
                this.store(entry, &mut overflow);
            }
        }
        this
    }

    /// The logical message, when it was built from one.
    pub fn message(&self) -> Option<&HubMessage> {
        self.message.as_ref()
    }

    /// Bytes for `protocol`, encoding on first request.
    pub fn get_serialized(&self, protocol: &dyn HubProtocol) -> Result<Bytes> {
        let name = protocol.name();
        if let Some(bytes) = self.find_in_slots(name) {
            return Ok(bytes);
        }

        let mut overflow = self.overflow.lock();
        if let Some(bytes) = self.find_in_slots(name) {
            return Ok(bytes);
        }
        if let Some(entry) = overflow.iter().find(|e| e.protocol == name) {
            return Ok(entry.payload.clone());
        }

        let message = self.message.as_ref().ok_or_else(|| {
            HubError::InvalidOperation(format!(
                "this message was not serialized for protocol '{name}'"
            ))
        })?;
        let payload = protocol.write_message(message)?;
        counter!(SERIALIZATIONS_TOTAL, "protocol" => name.to_owned()).increment(1);
        self.store(SerializedMessage::new(name, payload.clone()), &mut overflow);
        Ok(payload)
    }

    fn find_in_slots(&self, name: &str) -> Option<Bytes> {
        self.slots
            .iter()
            .filter_map(OnceLock::get)
            .find(|e| e.protocol == name)
            .map(|e| e.payload.clone())
    }

    /// Caller holds the overflow lock, so no two writers race on a slot.
    fn store(&self, entry: SerializedMessage, overflow: &mut Vec<SerializedMessage>) {
        let mut pending = Some(entry);
        for slot in &self.slots {
            if slot.get().is_none() {
                if let Some(entry) = pending.take() {
                    let _ = slot.set(entry);
                }
                break;
            }
        }
        if let Some(entry) = pending {
            overflow.push(entry);
        }
    }
}
