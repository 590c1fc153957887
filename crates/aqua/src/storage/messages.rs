//! Inter-agent messages with per-recipient read markers.
//!
//! A message with `to_agent = NULL` is a broadcast. Direct messages carry
//! their read marker on the row itself; broadcasts track one marker per
//! recipient in `message_reads`, so a broadcast stays unread for every agent
//! that has not fetched it yet. Delivery is at-least-once: a marker is only
//! written when the recipient actually fetches. Once set, a marker is never
//! cleared.

use chrono::Utc;
use rusqlite::params;

use super::codec;
use super::Store;
use crate::domain::Message;
use crate::errors::Result;

impl Store {
    /// Send a message. `to_agent = None` broadcasts to everyone.
    pub fn send_message(
        &self,
        from_agent: &str,
        to_agent: Option<&str>,
        content: &str,
        message_type: &str,
    ) -> Result<Message> {
        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO messages (from_agent, to_agent, content, message_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![from_agent, to_agent, content, message_type, codec::encode_ts(now)],
        )?;
        Ok(Message {
            id: self.conn().last_insert_rowid(),
            from_agent: from_agent.to_string(),
            to_agent: to_agent.map(str::to_string),
            content: content.to_string(),
            message_type: message_type.to_string(),
            created_at: now,
            read_at: None,
        })
    }

    /// Messages addressed to an agent (direct or broadcast), newest first.
    ///
    /// The `read_at` on each returned message reflects this recipient's own
    /// marker: the row marker for direct messages, the `message_reads` entry
    /// for broadcasts.
    pub fn list_messages(
        &self,
        agent_id: &str,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let mut sql = String::from(
            "SELECT m.id, m.from_agent, m.to_agent, m.content, m.message_type, m.created_at,
                    CASE WHEN m.to_agent IS NULL THEN r.read_at ELSE m.read_at END AS read_at
               FROM messages m
               LEFT JOIN message_reads r
                 ON r.message_id = m.id AND r.agent_id = ?1
              WHERE (m.to_agent = ?1 OR m.to_agent IS NULL)",
        );
        if unread_only {
            sql.push_str(
                " AND (CASE WHEN m.to_agent IS NULL THEN r.read_at ELSE m.read_at END) IS NULL",
            );
        }
        sql.push_str(" ORDER BY m.created_at DESC, m.id DESC LIMIT ?2");

        let mut stmt = self.conn().prepare(&sql)?;
        let mut rows = stmt.query(params![agent_id, limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(codec::decode_message(row)?);
        }
        Ok(out)
    }

    /// Mark messages read for a recipient. Returns how many markers were
    /// newly set; already-read messages are left untouched.
    pub fn mark_messages_read(&self, agent_id: &str, message_ids: &[i64]) -> Result<usize> {
        let now = codec::encode_ts(Utc::now());
        let mut marked = 0;

        for &message_id in message_ids {
            // Direct message to this agent: stamp the row marker.
            marked += self.conn().execute(
                "UPDATE messages SET read_at = ?1
                  WHERE id = ?2 AND to_agent = ?3 AND read_at IS NULL",
                params![now, message_id, agent_id],
            )?;
            // Broadcast: one marker per recipient.
            marked += self.conn().execute(
                "INSERT OR IGNORE INTO message_reads (message_id, agent_id, read_at)
                 SELECT id, ?1, ?2 FROM messages WHERE id = ?3 AND to_agent IS NULL",
                params![agent_id, now, message_id],
            )?;
        }
        Ok(marked)
    }

    /// Fetch an agent's inbox and mark everything fetched as read for them.
    pub fn fetch_inbox(
        &self,
        agent_id: &str,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let messages = self.list_messages(agent_id, unread_only, limit)?;
        let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
        self.mark_messages_read(agent_id, &ids)?;
        Ok(messages)
    }
}
