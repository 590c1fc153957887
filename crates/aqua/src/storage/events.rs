//! Append-only audit log.
//!
//! Every meaningful transition is recorded here with a UTC timestamp and an
//! optional JSON detail map. Recovery and observability both read this log;
//! nothing ever updates or deletes a row.

use chrono::Utc;
use rusqlite::params;
use serde_json::Value;

use super::codec;
use super::Store;
use crate::domain::Event;
use crate::errors::Result;

/// Filters for reading the event log.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub agent_id: Option<String>,
    pub task_id: Option<String>,
    pub limit: usize,
}

impl Store {
    /// Append an event. `details`, when present, must be a JSON object.
    pub fn append_event(
        &self,
        event_type: &str,
        agent_id: Option<&str>,
        task_id: Option<&str>,
        details: Option<Value>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO events (timestamp, event_type, agent_id, task_id, details)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                codec::encode_ts(Utc::now()),
                event_type,
                agent_id,
                task_id,
                details.map(|d| d.to_string()),
            ],
        )?;
        Ok(())
    }

    /// Read events newest-first with optional filters.
    pub fn list_events(
        &self,
        event_type: Option<&str>,
        agent_id: Option<&str>,
        task_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let mut sql = String::from("SELECT * FROM events WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(event_type) = event_type {
            sql.push_str(" AND event_type = ?");
            args.push(Box::new(event_type.to_string()));
        }
        if let Some(agent_id) = agent_id {
            sql.push_str(" AND agent_id = ?");
            args.push(Box::new(agent_id.to_string()));
        }
        if let Some(task_id) = task_id {
            sql.push_str(" AND task_id = ?");
            args.push(Box::new(task_id.to_string()));
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ?");
        args.push(Box::new(limit as i64));

        let mut stmt = self.conn().prepare(&sql)?;
        let params = rusqlite::params_from_iter(args.iter().map(|p| p.as_ref()));
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(codec::decode_event(row)?);
        }
        Ok(out)
    }
}
