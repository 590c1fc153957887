//! Row-to-record decoding and column value codecs.
//!
//! Read paths fully decode rows into the typed records in [`crate::domain`]
//! before returning, so consumers never see raw rows. Lists and free-form
//! mappings are stored as textual JSON; element order inside a JSON list is
//! preserved. Timestamps are naive-UTC ISO-8601 strings with a fixed
//! microsecond width, so their string order equals their time order.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Row;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::{
    Agent, AgentKind, AgentStatus, Event, FileLock, Leader, Message, Task, TaskStatus,
};
use crate::errors::{AquaError, Result};

const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Encode a UTC timestamp for storage.
pub fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.naive_utc().format(TS_FORMAT).to_string()
}

/// Decode a stored timestamp.
pub fn decode_ts(raw: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TS_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| AquaError::Schema(format!("bad timestamp '{raw}': {e}")))
}

fn decode_ts_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(decode_ts).transpose()
}

/// Encode a string list as a JSON array.
pub fn encode_list(items: &[String]) -> String {
    serde_json::to_string(items).expect("string list always serializes")
}

/// Decode a JSON array column; NULL decodes to an empty list.
pub fn decode_list(raw: Option<String>) -> Result<Vec<String>> {
    match raw {
        None => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| AquaError::Schema(format!("bad list column '{raw}': {e}"))),
    }
}

/// Encode a string map as a JSON object.
pub fn encode_map(map: &BTreeMap<String, String>) -> String {
    serde_json::to_string(map).expect("string map always serializes")
}

/// Decode a JSON object column; NULL decodes to an empty map.
pub fn decode_map(raw: Option<String>) -> Result<BTreeMap<String, String>> {
    match raw {
        None => Ok(BTreeMap::new()),
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| AquaError::Schema(format!("bad map column '{raw}': {e}"))),
    }
}

fn decode_details(raw: Option<String>) -> Result<Option<Value>> {
    match raw {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| AquaError::Schema(format!("bad event details '{raw}': {e}"))),
    }
}

pub fn decode_agent(row: &Row<'_>) -> Result<Agent> {
    let status: String = row.get("status")?;
    let kind: String = row.get("agent_type")?;
    let heartbeat: String = row.get("last_heartbeat_at")?;
    let registered: String = row.get("registered_at")?;
    Ok(Agent {
        id: row.get("id")?,
        name: row.get("name")?,
        kind: AgentKind::parse(&kind)?,
        pid: row.get::<_, Option<i64>>("pid")?.map(|p| p as u32),
        status: AgentStatus::parse(&status)?,
        last_heartbeat_at: decode_ts(&heartbeat)?,
        registered_at: decode_ts(&registered)?,
        current_task_id: row.get("current_task_id")?,
        capabilities: decode_list(row.get("capabilities")?)?,
        metadata: decode_map(row.get("metadata")?)?,
        last_progress: row.get("last_progress")?,
        role: row.get("role")?,
    })
}

pub fn decode_task(row: &Row<'_>) -> Result<Task> {
    let status: String = row.get("status")?;
    let created: String = row.get("created_at")?;
    let updated: String = row.get("updated_at")?;
    Ok(Task {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status: TaskStatus::parse(&status)?,
        priority: row.get("priority")?,
        created_by: row.get("created_by")?,
        claimed_by: row.get("claimed_by")?,
        claim_term: row.get("claim_term")?,
        created_at: decode_ts(&created)?,
        updated_at: decode_ts(&updated)?,
        claimed_at: decode_ts_opt(row.get("claimed_at")?)?,
        completed_at: decode_ts_opt(row.get("completed_at")?)?,
        result: row.get("result")?,
        error: row.get("error")?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        tags: decode_list(row.get("tags")?)?,
        context: row.get("context")?,
        version: row.get("version")?,
        depends_on: decode_list(row.get("depends_on")?)?,
    })
}

pub fn decode_leader(row: &Row<'_>) -> Result<Leader> {
    let expires: String = row.get("lease_expires_at")?;
    let elected: String = row.get("elected_at")?;
    Ok(Leader {
        agent_id: row.get("agent_id")?,
        term: row.get("term")?,
        lease_expires_at: decode_ts(&expires)?,
        elected_at: decode_ts(&elected)?,
    })
}

pub fn decode_message(row: &Row<'_>) -> Result<Message> {
    let created: String = row.get("created_at")?;
    Ok(Message {
        id: row.get("id")?,
        from_agent: row.get("from_agent")?,
        to_agent: row.get("to_agent")?,
        content: row.get("content")?,
        message_type: row.get("message_type")?,
        created_at: decode_ts(&created)?,
        read_at: decode_ts_opt(row.get("read_at")?)?,
    })
}

pub fn decode_event(row: &Row<'_>) -> Result<Event> {
    let ts: String = row.get("timestamp")?;
    Ok(Event {
        id: row.get("id")?,
        timestamp: decode_ts(&ts)?,
        event_type: row.get("event_type")?,
        agent_id: row.get("agent_id")?,
        task_id: row.get("task_id")?,
        details: decode_details(row.get("details")?)?,
    })
}

pub fn decode_file_lock(row: &Row<'_>) -> Result<FileLock> {
    let locked: String = row.get("locked_at")?;
    Ok(FileLock {
        file_path: row.get("file_path")?,
        agent_id: row.get("agent_id")?,
        locked_at: decode_ts(&locked)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_round_trip() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        let encoded = encode_ts(ts);
        assert_eq!(encoded, "2026-03-14T15:09:26.000000");
        assert_eq!(decode_ts(&encoded).unwrap(), ts);
    }

    #[test]
    fn test_timestamp_string_order_matches_time_order() {
        let earlier = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let later = earlier + chrono::Duration::microseconds(1);
        assert!(encode_ts(earlier) < encode_ts(later));
    }

    #[test]
    fn test_bad_timestamp_is_schema_error() {
        let err = decode_ts("yesterday").unwrap_err();
        assert_eq!(err.kind(), "schema_error");
    }

    #[test]
    fn test_list_round_trip_preserves_order() {
        let tags = vec!["zeta".to_string(), "alpha".to_string(), "mid".to_string()];
        let decoded = decode_list(Some(encode_list(&tags))).unwrap();
        assert_eq!(decoded, tags);
    }

    #[test]
    fn test_null_collections_decode_empty() {
        assert!(decode_list(None).unwrap().is_empty());
        assert!(decode_map(None).unwrap().is_empty());
    }

    #[test]
    fn test_map_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("model".to_string(), "opus".to_string());
        map.insert("lang".to_string(), "rust".to_string());
        assert_eq!(decode_map(Some(encode_map(&map))).unwrap(), map);
    }

    #[test]
    fn test_corrupt_json_is_schema_error() {
        assert_eq!(
            decode_list(Some("{not json".to_string())).unwrap_err().kind(),
            "schema_error"
        );
        assert_eq!(
            decode_map(Some("[1,2]".to_string())).unwrap_err().kind(),
            "schema_error"
        );
    }
}
