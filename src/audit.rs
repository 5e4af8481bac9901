use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::cipher::{rotate, unrotate};
use crate::io::{read_json, write_json, Storage, StorageError};
use crate::models::{AuditAction, AuditEntry, AuditView};
use crate::util::now_seconds;

pub const LOG_DOCUMENT: &str = "logs.json";
pub const UNREADABLE_MESSAGE: &str = "<message unavailable>";
pub const DEFAULT_LIMIT: usize = 100;

/// Append-only event trail. Appends are serialised through `gate`; reads take no lock.
pub struct AuditLog {
    storage: Arc<dyn Storage>,
    shift: i32,
    gate: Mutex<()>,
}

impl AuditLog {
    pub fn new(storage: Arc<dyn Storage>, shift: i32) -> Self {
        Self {
            storage,
            shift,
            gate: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<Vec<AuditEntry>, StorageError> {
        Ok(read_json(self.storage.as_ref(), LOG_DOCUMENT)?.unwrap_or_default())
    }

    pub fn record(
        &self,
        action: AuditAction,
        actor: &str,
        student_id: Option<Uuid>,
        details: Map<String, Value>,
    ) -> Result<AuditEntry, StorageError> {
        let _guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.load()?;

        let summary = match student_id {
            Some(id) => format!("{} - student={}", action, id),
            None => action.to_string(),
        };

        // keep the trail non-decreasing even if the wall clock steps back
        let mut timestamp = now_seconds();
        if let Some(last) = entries.last() {
            timestamp = timestamp.max(last.timestamp);
        }

        let entry = AuditEntry {
            id: Uuid::new_v4(),
            timestamp,
            actor: actor.to_string(),
            action,
            student_id,
            details,
            message: Some(rotate(&summary, self.shift)),
        };
        entries.push(entry.clone());
        write_json(self.storage.as_ref(), LOG_DOCUMENT, &entries)?;

        log::debug!("Audit {} by {}", action, actor);
        Ok(entry)
    }

    /// Newest first. Entries sharing a timestamp come out in reverse insertion order.
    pub fn list(&self, student_id: Option<Uuid>, limit: usize) -> Result<Vec<AuditView>, StorageError> {
        let mut entries: Vec<AuditEntry> = self
            .load()?
            .into_iter()
            .filter(|entry| student_id.is_none() || entry.student_id == student_id)
            .collect();

        entries.reverse();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit);

        Ok(entries.into_iter().map(|entry| self.decode(entry)).collect())
    }

    fn decode(&self, entry: AuditEntry) -> AuditView {
        let message = match entry.message.as_deref() {
            Some(hidden) => unrotate(hidden, self.shift),
            None => {
                log::warn!("Audit entry {} carries no message", entry.id);
                UNREADABLE_MESSAGE.to_string()
            }
        };
        AuditView {
            id: entry.id,
            timestamp: entry.timestamp,
            actor: entry.actor,
            action: entry.action,
            student_id: entry.student_id,
            details: entry.details,
            message,
        }
    }
}
