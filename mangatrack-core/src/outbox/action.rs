//! Offline action log entries and the enqueue-time dedup rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{EntryId, LibraryStatus, SeriesId};

/// One queued intent, persisted in device storage until the server confirms
/// it. Serialization is round-trip stable; the wire `type` tags match the
/// client protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxAction {
    pub id: Uuid,
    #[serde(flatten)]
    pub payload: ActionPayload,
    /// Client wall clock, milliseconds since epoch. Server-side ordering and
    /// LWW both key off this.
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,
    pub device_id: String,
    #[serde(default)]
    pub retry_count: u32,
}

impl OutboxAction {
    pub fn new(payload: ActionPayload, timestamp_ms: i64, device_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            timestamp_ms,
            device_id: device_id.into(),
            retry_count: 0,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.timestamp_ms).unwrap_or_else(Utc::now)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ActionPayload {
    #[serde(rename = "LIBRARY_ADD")]
    LibraryAdd(LibraryAddPayload),
    #[serde(rename = "LIBRARY_UPDATE")]
    LibraryUpdate(LibraryUpdatePayload),
    #[serde(rename = "LIBRARY_DELETE")]
    LibraryDelete(LibraryDeletePayload),
    #[serde(rename = "CHAPTER_READ")]
    ChapterRead(ChapterReadPayload),
    #[serde(rename = "SETTING_UPDATE")]
    SettingUpdate(SettingUpdatePayload),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LibraryAddPayload {
    pub series_id: SeriesId,
    pub source_url: String,
    pub source_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<LibraryStatus>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LibraryUpdatePayload {
    pub entry_id: EntryId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<LibraryStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LibraryDeletePayload {
    pub entry_id: EntryId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChapterReadPayload {
    pub entry_id: EntryId,
    pub chapter_number: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_time_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SettingUpdatePayload {
    pub settings: serde_json::Value,
}

/// Enqueue-time coalescing. Returns the queue with the incoming action
/// folded in:
///
/// - `CHAPTER_READ` per entry keeps the highest chapter number;
/// - `LIBRARY_UPDATE` per entry keeps the newest;
/// - `LIBRARY_ADD` per series keeps the newest;
/// - everything else appends unchanged.
pub fn push_deduped(queue: &mut Vec<OutboxAction>, incoming: OutboxAction) {
    match &incoming.payload {
        ActionPayload::ChapterRead(read) => {
            let entry_id = read.entry_id;
            let chapter = read.chapter_number;
            if let Some(existing) = queue.iter_mut().find(|action| {
                matches!(&action.payload, ActionPayload::ChapterRead(r) if r.entry_id == entry_id)
            }) {
                let ActionPayload::ChapterRead(stored) = &existing.payload else {
                    unreachable!("matched above");
                };
                if chapter > stored.chapter_number {
                    *existing = incoming;
                }
                return;
            }
        }
        ActionPayload::LibraryUpdate(update) => {
            let entry_id = update.entry_id;
            if let Some(existing) = queue.iter_mut().find(|action| {
                matches!(&action.payload, ActionPayload::LibraryUpdate(u) if u.entry_id == entry_id)
            }) {
                if incoming.timestamp_ms >= existing.timestamp_ms {
                    *existing = incoming;
                }
                return;
            }
        }
        ActionPayload::LibraryAdd(add) => {
            let series_id = add.series_id;
            if let Some(existing) = queue.iter_mut().find(|action| {
                matches!(&action.payload, ActionPayload::LibraryAdd(a) if a.series_id == series_id)
            }) {
                if incoming.timestamp_ms >= existing.timestamp_ms {
                    *existing = incoming;
                }
                return;
            }
        }
        ActionPayload::LibraryDelete(_) | ActionPayload::SettingUpdate(_) => {}
    }
    queue.push(incoming);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_action(entry_id: EntryId, chapter: f64, ts: i64) -> OutboxAction {
        OutboxAction::new(
            ActionPayload::ChapterRead(ChapterReadPayload {
                entry_id,
                chapter_number: chapter,
                read_time_seconds: None,
                pages: None,
            }),
            ts,
            "device-a",
        )
    }

    #[test]
    fn serde_round_trip_is_identity() {
        let action = read_action(EntryId::new(), 42.5, 1_700_000_000_000);
        let json = serde_json::to_string(&action).unwrap();
        let back: OutboxAction = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, action.id);
        assert_eq!(back.timestamp_ms, action.timestamp_ms);
        assert_eq!(back.device_id, action.device_id);
        let ActionPayload::ChapterRead(payload) = back.payload else {
            panic!("payload type changed in round trip");
        };
        assert_eq!(payload.chapter_number, 42.5);
    }

    #[test]
    fn wire_type_tags_match_the_protocol() {
        let action = read_action(EntryId::new(), 1.0, 0);
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "CHAPTER_READ");
        assert!(json["payload"]["chapter_number"].is_number());
        assert!(json["timestamp"].is_number());
    }

    #[test]
    fn chapter_read_keeps_highest_chapter() {
        let entry_id = EntryId::new();
        let mut queue = Vec::new();
        push_deduped(&mut queue, read_action(entry_id, 10.0, 1));
        push_deduped(&mut queue, read_action(entry_id, 4.0, 2));
        assert_eq!(queue.len(), 1);
        let ActionPayload::ChapterRead(kept) = &queue[0].payload else {
            panic!("wrong payload");
        };
        assert_eq!(kept.chapter_number, 10.0);

        push_deduped(&mut queue, read_action(entry_id, 12.0, 3));
        assert_eq!(queue.len(), 1);
        let ActionPayload::ChapterRead(kept) = &queue[0].payload else {
            panic!("wrong payload");
        };
        assert_eq!(kept.chapter_number, 12.0);
    }

    #[test]
    fn library_update_keeps_newest_per_entry() {
        let entry_id = EntryId::new();
        let update = |status: LibraryStatus, ts: i64| {
            OutboxAction::new(
                ActionPayload::LibraryUpdate(LibraryUpdatePayload {
                    entry_id,
                    status: Some(status),
                    progress: None,
                }),
                ts,
                "device-a",
            )
        };
        let mut queue = Vec::new();
        push_deduped(&mut queue, update(LibraryStatus::Reading, 5));
        push_deduped(&mut queue, update(LibraryStatus::Paused, 9));
        push_deduped(&mut queue, update(LibraryStatus::Dropped, 7));
        assert_eq!(queue.len(), 1);
        let ActionPayload::LibraryUpdate(kept) = &queue[0].payload else {
            panic!("wrong payload");
        };
        assert_eq!(kept.status, Some(LibraryStatus::Paused));
    }

    #[test]
    fn unrelated_entries_do_not_coalesce() {
        let mut queue = Vec::new();
        push_deduped(&mut queue, read_action(EntryId::new(), 1.0, 1));
        push_deduped(&mut queue, read_action(EntryId::new(), 2.0, 2));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn deletes_and_settings_append_unchanged() {
        let entry_id = EntryId::new();
        let mut queue = Vec::new();
        for _ in 0..2 {
            push_deduped(
                &mut queue,
                OutboxAction::new(
                    ActionPayload::LibraryDelete(LibraryDeletePayload { entry_id }),
                    1,
                    "device-a",
                ),
            );
        }
        assert_eq!(queue.len(), 2);
    }
}
