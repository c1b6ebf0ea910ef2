use std::sync::Arc;
use std::sync::Mutex;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use redis::Commands;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::store::FrameStore;
use crate::types::entities::{FrameEntry, RawFrame};

/// Frame store backed by an external Redis list, keyed `frames-<source_id>`.
///
/// The list is an eventually-consistent append-trim log: push is a pipelined
/// `LPUSH` + `LTRIM`, reads are a pipelined `LLEN` + `LRANGE`. Store errors
/// never propagate to the capture loop; a failed push is logged and the frame
/// is dropped.
pub struct RedisFrameStore {
    key: String,
    capacity: usize,
    conn: Mutex<redis::Connection>,
}

/// On-wire form of a frame entry. The payload travels base64-encoded inside
/// a JSON object; the store itself treats entries as opaque bytes.
#[derive(Serialize, Deserialize)]
struct WireEntry {
    frame_id: String,
    captured_at: u64,
    width: u32,
    height: u32,
    data: String,
}

impl From<&FrameEntry> for WireEntry {
    fn from(entry: &FrameEntry) -> Self {
        WireEntry {
            frame_id: entry.frame_id.clone(),
            captured_at: entry.captured_at,
            width: entry.payload.width,
            height: entry.payload.height,
            data: BASE64.encode(entry.payload.data.as_slice()),
        }
    }
}

impl WireEntry {
    fn into_entry(self) -> Option<FrameEntry> {
        let data = BASE64.decode(&self.data).ok()?;
        Some(FrameEntry {
            frame_id: self.frame_id,
            captured_at: self.captured_at,
            payload: RawFrame {
                width: self.width,
                height: self.height,
                data: Arc::new(data),
            },
        })
    }
}

pub fn frames_key(source_id: &str) -> String {
    format!("frames-{source_id}")
}

fn encode(entry: &FrameEntry) -> Option<Vec<u8>> {
    match serde_json::to_vec(&WireEntry::from(entry)) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(frame_id = %entry.frame_id, error = %e, "Failed encoding frame entry");
            None
        }
    }
}

fn decode(bytes: &[u8]) -> Option<FrameEntry> {
    serde_json::from_slice::<WireEntry>(bytes)
        .ok()
        .and_then(WireEntry::into_entry)
}

impl RedisFrameStore {
    pub fn connect(
        client: &redis::Client,
        source_id: &str,
        capacity: usize,
    ) -> Result<Self, EngineError> {
        let conn = client.get_connection()?;
        Ok(RedisFrameStore {
            key: frames_key(source_id),
            capacity: capacity.max(1),
            conn: Mutex::new(conn),
        })
    }

    fn read(&self, n: usize) -> Option<(usize, Vec<FrameEntry>)> {
        let mut conn = self.conn.lock().unwrap();
        let result: redis::RedisResult<(usize, Vec<Vec<u8>>)> = redis::pipe()
            .atomic()
            .llen(&self.key)
            .lrange(&self.key, 0, n as isize - 1)
            .query(&mut *conn);
        match result {
            Ok((size, items)) => {
                let entries = items.iter().filter_map(|item| decode(item)).collect();
                Some((size, entries))
            }
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Frame range read failed");
                None
            }
        }
    }
}

impl FrameStore for RedisFrameStore {
    fn push(&self, entry: FrameEntry) {
        let Some(bytes) = encode(&entry) else {
            return;
        };
        let mut conn = self.conn.lock().unwrap();
        let result: redis::RedisResult<()> = redis::pipe()
            .atomic()
            .lpush(&self.key, bytes)
            .ignore()
            .ltrim(&self.key, 0, self.capacity as isize - 1)
            .ignore()
            .query(&mut *conn);
        if let Err(e) = result {
            tracing::warn!(key = %self.key, error = %e, "Frame push failed, dropping frame");
        }
    }

    fn peek(&self) -> Option<FrameEntry> {
        let mut conn = self.conn.lock().unwrap();
        let item: Option<Vec<u8>> = match conn.lindex(&self.key, 0) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Frame peek failed");
                None
            }
        };
        item.as_deref().and_then(decode)
    }

    fn get(&self, n: usize) -> Option<Vec<FrameEntry>> {
        if n == 0 {
            return None;
        }
        let (size, entries) = self.read(n)?;
        if size < n || entries.len() < n {
            return None;
        }
        Some(entries)
    }

    fn range(&self, n: usize) -> (usize, Vec<FrameEntry>) {
        if n == 0 {
            // LRANGE 0 -1 would return the whole list.
            return (self.len(), Vec::new());
        }
        self.read(n).unwrap_or((0, Vec::new()))
    }

    fn len(&self) -> usize {
        let mut conn = self.conn.lock().unwrap();
        conn.llen(&self.key).unwrap_or(0)
    }

    fn destroy(&self) {
        let mut conn = self.conn.lock().unwrap();
        if let Err(e) = conn.del::<_, ()>(&self.key) {
            tracing::warn!(key = %self.key, error = %e, "Failed deleting frame list");
        }
    }
}
