//! Messages not yet acknowledged, kept across restarts.
//!
//! Two kinds of records are kept: our own outbound copies still waiting for
//! an "Ok", and requests we relayed for someone else. Records are keyed by
//! (call identifier, recipient) and the whole list is rewritten on every
//! change.

use crate::crypto::PeerId;
use crate::storage::{self, Store, UNDELIVERED_PATH};
use crate::transport::protocol::{Message, Request};
use crate::utils::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const RECORDS_VERSION: u8 = 1;

/// One undelivered message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredRecord {
    /// Our own message awaiting acknowledgement from `recipient`
    Outbound {
        /// The composed message
        message: Message,
        /// Recipient whose copy is pending
        recipient: PeerId,
    },
    /// A request taken over as a relay
    Relayed {
        /// The request as forwarded, our via entry included
        request: Request,
    },
}

impl StoredRecord {
    /// (call identifier, recipient) identifying the record
    pub fn key(&self) -> (&str, PeerId) {
        match self {
            Self::Outbound { message, recipient } => (&message.id, *recipient),
            Self::Relayed { request } => (&request.call_id, request.destination),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RecordFile {
    version: u8,
    records: Vec<StoredRecord>,
}

/// Persistent list of undelivered messages
pub struct UndeliveredStore {
    store: Arc<dyn Store>,
    records: Mutex<Vec<StoredRecord>>,
}

impl UndeliveredStore {
    /// Load the records left by the previous run
    pub fn load(store: Arc<dyn Store>) -> Result<Self> {
        let records = match storage::read_all(store.as_ref(), UNDELIVERED_PATH)? {
            Some(bytes) => match bincode::deserialize::<RecordFile>(&bytes) {
                Ok(file) if file.version == RECORDS_VERSION => file.records,
                Ok(file) => {
                    log::warn!("Ignoring undelivered records of version {}", file.version);
                    Vec::new()
                }
                Err(e) => {
                    log::warn!("Ignoring unreadable undelivered records: {}", e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        if !records.is_empty() {
            log::info!("Loaded {} undelivered messages", records.len());
        }
        Ok(Self {
            store,
            records: Mutex::new(records),
        })
    }

    /// Add `record`; false if one with the same key is already kept
    pub fn add(&self, record: StoredRecord) -> Result<bool> {
        let mut records = self.records.lock();
        let (call_id, peer) = record.key();
        if records.iter().any(|r| r.key() == (call_id, peer)) {
            return Ok(false);
        }
        records.push(record);
        self.persist(&records)?;
        Ok(true)
    }

    /// Remove the record for (`call_id`, `peer`)
    pub fn remove(&self, call_id: &str, peer: &PeerId) -> Result<Option<StoredRecord>> {
        let mut records = self.records.lock();
        let Some(index) = records.iter().position(|r| r.key() == (call_id, *peer)) else {
            return Ok(None);
        };
        let removed = records.remove(index);
        self.persist(&records)?;
        Ok(Some(removed))
    }

    /// Every kept record
    pub fn records(&self) -> Vec<StoredRecord> {
        self.records.lock().clone()
    }

    /// Number of kept records
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing is kept
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn persist(&self, records: &[StoredRecord]) -> Result<()> {
        let bytes = bincode::serialize(&RecordFile {
            version: RECORDS_VERSION,
            records: records.to_vec(),
        })?;
        storage::write_all(self.store.as_ref(), UNDELIVERED_PATH, &bytes)
    }
}
