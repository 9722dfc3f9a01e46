/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Call Ledger: calls, participants and the append-only signal log, in SQLite.
//!
//! Every multi-row mutation runs in a single `IMMEDIATE` transaction and checks the
//! caller's participant row and the call status inside that transaction, so a call row
//! without its participant rows, or a status moving backwards, is never observable.

use anyhow::{Context, Result};
use ringlink_protocol::{
    CallKind, CallRecord, CallStatus, ParticipantRecord, ParticipantStatus, SignalRecord, SignalType,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone)]
pub struct Ledger {
    db_path: PathBuf,
    synchronous: String,
    busy_timeout_ms: u64,
}

/// Outcome of a guarded mutation.
#[derive(Debug)]
pub enum Mutation<T> {
    Applied(T),
    /// No participant row for `(call, user)`; also returned for unknown calls.
    NotParticipant,
    InvalidState(&'static str),
}

#[derive(Debug, Clone)]
pub struct CallTransition {
    pub call: CallRecord,
    pub participant: ParticipantRecord,
    /// True when this mutation moved `calls.status`.
    pub status_changed: bool,
    pub participant_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedCall {
    pub call: CallRecord,
    pub participants: Vec<ParticipantRecord>,
}

impl Ledger {
    pub fn open(db_path: impl AsRef<Path>, synchronous: &str, busy_timeout_ms: u64) -> Result<Self> {
        let ledger = Self {
            db_path: db_path.as_ref().to_path_buf(),
            synchronous: synchronous.to_string(),
            busy_timeout_ms,
        };
        let conn = ledger.open_conn()?;
        init_schema(&conn)?;
        Ok(ledger)
    }

    fn open_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("open db: {}", self.db_path.display()))?;
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        let _ = conn.pragma_update(None, "synchronous", self.synchronous.as_str());
        let _ = conn.pragma_update(None, "foreign_keys", "ON");
        conn.busy_timeout(Duration::from_millis(self.busy_timeout_ms))?;
        Ok(conn)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut conn = this.open_conn()?;
            f(&mut conn)
        })
        .await
        .context("ledger task")?
    }

    #[cfg(test)]
    pub(crate) async fn with_test_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        self.with_conn(f).await
    }

    pub async fn health_check(&self) -> Result<()> {
        self.with_conn(|conn| {
            let _: i64 = conn.query_row("SELECT 1", [], |r| r.get(0))?;
            Ok(())
        })
        .await
    }

    pub async fn insert_identity(&self, user_id: &str, token: &str) -> Result<()> {
        let user_id = user_id.to_string();
        let token_hash = token_hash_hex(token);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO identities(token_sha256, user_id, created_at_ms, disabled) VALUES (?1, ?2, ?3, 0)",
                params![token_hash, user_id, now_ms()],
            )?;
            Ok(())
        })
        .await
    }

    /// Resolves a bearer credential to the user id it was issued for.
    pub async fn resolve_token(&self, token: &str) -> Result<Option<String>> {
        let token_hash = token_hash_hex(token);
        self.with_conn(move |conn| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT user_id, disabled FROM identities WHERE token_sha256 = ?1",
                    params![token_hash],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            Ok(row.and_then(|(user, disabled)| (disabled == 0).then_some(user)))
        })
        .await
    }

    pub async fn create_call(
        &self,
        caller_id: &str,
        kind: CallKind,
        target_user_id: Option<&str>,
        conversation_id: Option<&str>,
    ) -> Result<CreatedCall> {
        let caller_id = caller_id.to_string();
        let target_user_id = target_user_id.map(str::to_string);
        let conversation_id = conversation_id.map(str::to_string);
        self.with_conn(move |conn| {
            let now = now_ms();
            let call = CallRecord {
                id: uuid::Uuid::new_v4().to_string(),
                caller_id: caller_id.clone(),
                call_type: kind,
                conversation_id,
                status: CallStatus::Ringing,
                created_at_ms: now,
                started_at_ms: None,
                ended_at_ms: None,
            };
            let mut participants = vec![ParticipantRecord {
                call_id: call.id.clone(),
                user_id: caller_id,
                status: ParticipantStatus::Joined,
                joined_at_ms: Some(now),
                left_at_ms: None,
            }];
            if let Some(target) = target_user_id {
                participants.push(ParticipantRecord {
                    call_id: call.id.clone(),
                    user_id: target,
                    status: ParticipantStatus::Ringing,
                    joined_at_ms: None,
                    left_at_ms: None,
                });
            }

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                r#"
                INSERT INTO calls(id, caller_id, call_type, conversation_id, status, created_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    call.id,
                    call.caller_id,
                    call.call_type.as_str(),
                    call.conversation_id,
                    call.status.as_str(),
                    call.created_at_ms
                ],
            )?;
            for p in &participants {
                tx.execute(
                    r#"
                    INSERT INTO call_participants(call_id, user_id, status, joined_at_ms, left_at_ms)
                    VALUES (?1, ?2, ?3, ?4, NULL)
                    "#,
                    params![p.call_id, p.user_id, p.status.as_str(), p.joined_at_ms],
                )?;
            }
            tx.commit()?;
            Ok(CreatedCall { call, participants })
        })
        .await
    }

    pub async fn get_call(&self, call_id: &str) -> Result<Option<CallRecord>> {
        let call_id = call_id.to_string();
        self.with_conn(move |conn| load_call(conn, &call_id)).await
    }

    pub async fn list_participants(&self, call_id: &str) -> Result<Vec<ParticipantRecord>> {
        let call_id = call_id.to_string();
        self.with_conn(move |conn| load_participants(conn, &call_id)).await
    }

    pub async fn participant_status(&self, call_id: &str, user_id: &str) -> Result<Option<ParticipantStatus>> {
        let call_id = call_id.to_string();
        let user_id = user_id.to_string();
        self.with_conn(move |conn| load_participant_status(conn, &call_id, &user_id))
            .await
    }

    pub async fn join_call(&self, call_id: &str, user_id: &str) -> Result<Mutation<CallTransition>> {
        let call_id = call_id.to_string();
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(own) = load_participant_status(&tx, &call_id, &user_id)? else {
                return Ok(Mutation::NotParticipant);
            };
            let Some(call) = load_call(&tx, &call_id)? else {
                return Ok(Mutation::NotParticipant);
            };
            if call.status.is_terminal() {
                return Ok(Mutation::InvalidState("call already finished"));
            }
            if own == ParticipantStatus::Rejected {
                return Ok(Mutation::InvalidState("call already rejected"));
            }
            let now = now_ms();
            tx.execute(
                r#"
                UPDATE call_participants
                SET status = 'joined', joined_at_ms = COALESCE(joined_at_ms, ?3), left_at_ms = NULL
                WHERE call_id = ?1 AND user_id = ?2
                "#,
                params![call_id, user_id, now],
            )?;
            let changed = tx.execute(
                "UPDATE calls SET status = 'ongoing', started_at_ms = ?2 WHERE id = ?1 AND status = 'ringing'",
                params![call_id, now],
            )?;
            let transition = load_transition(&tx, &call_id, &user_id, changed > 0)?;
            tx.commit()?;
            Ok(Mutation::Applied(transition))
        })
        .await
    }

    /// Ends the call for everyone. Ending an already finished call only updates the
    /// caller's own row, which keeps the operation idempotent.
    pub async fn end_call(&self, call_id: &str, user_id: &str) -> Result<Mutation<CallTransition>> {
        let call_id = call_id.to_string();
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if load_participant_status(&tx, &call_id, &user_id)?.is_none() {
                return Ok(Mutation::NotParticipant);
            }
            let now = now_ms();
            tx.execute(
                r#"
                UPDATE call_participants
                SET status = 'left', left_at_ms = ?3
                WHERE call_id = ?1 AND user_id = ?2 AND status IN ('invited', 'ringing', 'joined')
                "#,
                params![call_id, user_id, now],
            )?;
            let changed = tx.execute(
                r#"
                UPDATE calls SET status = 'ended', ended_at_ms = ?2
                WHERE id = ?1 AND status IN ('ringing', 'ongoing')
                "#,
                params![call_id, now],
            )?;
            let transition = load_transition(&tx, &call_id, &user_id, changed > 0)?;
            tx.commit()?;
            Ok(Mutation::Applied(transition))
        })
        .await
    }

    /// Marks the caller's row rejected; the call itself becomes `rejected` once no
    /// invitee row is left in any other status.
    pub async fn reject_call(&self, call_id: &str, user_id: &str) -> Result<Mutation<CallTransition>> {
        let call_id = call_id.to_string();
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(own) = load_participant_status(&tx, &call_id, &user_id)? else {
                return Ok(Mutation::NotParticipant);
            };
            let Some(call) = load_call(&tx, &call_id)? else {
                return Ok(Mutation::NotParticipant);
            };
            if call.status.is_terminal() {
                return Ok(Mutation::InvalidState("call already finished"));
            }
            if matches!(own, ParticipantStatus::Joined | ParticipantStatus::Left) {
                return Ok(Mutation::InvalidState("participant already joined"));
            }
            let now = now_ms();
            tx.execute(
                "UPDATE call_participants SET status = 'rejected' WHERE call_id = ?1 AND user_id = ?2",
                params![call_id, user_id],
            )?;
            let outstanding: i64 = tx.query_row(
                r#"
                SELECT COUNT(*) FROM call_participants
                WHERE call_id = ?1 AND user_id != ?2 AND status != 'rejected'
                "#,
                params![call_id, call.caller_id],
                |r| r.get(0),
            )?;
            let mut changed = 0;
            if outstanding == 0 {
                changed = tx.execute(
                    "UPDATE calls SET status = 'rejected', ended_at_ms = ?2 WHERE id = ?1 AND status = 'ringing'",
                    params![call_id, now],
                )?;
            }
            let transition = load_transition(&tx, &call_id, &user_id, changed > 0)?;
            tx.commit()?;
            Ok(Mutation::Applied(transition))
        })
        .await
    }

    pub async fn insert_signal(
        &self,
        call_id: &str,
        from_user_id: &str,
        to_user_id: &str,
        signal_type: SignalType,
        signal_data: serde_json::Value,
    ) -> Result<Mutation<SignalRecord>> {
        let call_id = call_id.to_string();
        let from_user_id = from_user_id.to_string();
        let to_user_id = to_user_id.to_string();
        let data_json = serde_json::to_string(&signal_data).context("serialize signal data")?;
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if load_participant_status(&tx, &call_id, &from_user_id)?.is_none()
                || load_participant_status(&tx, &call_id, &to_user_id)?.is_none()
            {
                return Ok(Mutation::NotParticipant);
            }
            let Some(call) = load_call(&tx, &call_id)? else {
                return Ok(Mutation::NotParticipant);
            };
            if call.status.is_terminal() {
                return Ok(Mutation::InvalidState("call already finished"));
            }
            let id = uuid::Uuid::new_v4().to_string();
            let now = now_ms();
            tx.execute(
                r#"
                INSERT INTO call_signals(id, call_id, from_user_id, to_user_id, signal_type, signal_data, created_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![id, call_id, from_user_id, to_user_id, signal_type.as_str(), data_json, now],
            )?;
            let seq = tx.last_insert_rowid();
            tx.commit()?;
            Ok(Mutation::Applied(SignalRecord {
                seq,
                id,
                call_id,
                from_user_id,
                to_user_id,
                signal_type,
                signal_data,
                created_at_ms: now,
            }))
        })
        .await
    }

    /// Signals addressed to `to_user_id` with `seq > after_seq`, oldest first.
    pub async fn list_signals_after(&self, to_user_id: &str, after_seq: i64, limit: u32) -> Result<Vec<SignalRecord>> {
        let to_user_id = to_user_id.to_string();
        let limit = limit.max(1) as i64;
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT seq, id, call_id, from_user_id, to_user_id, signal_type, signal_data, created_at_ms
                FROM call_signals
                WHERE to_user_id = ?1 AND seq > ?2
                ORDER BY seq ASC
                LIMIT ?3
                "#,
            )?;
            let rows = stmt
                .query_map(params![to_user_id, after_seq, limit], signal_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Moves calls still `ringing` and created before `cutoff_ms` to `missed`.
    /// Calls `user_id` takes part in that are still live or ended at or after `since_ms`,
    /// oldest first, each with the user's own participant status.
    pub async fn calls_to_resync(
        &self,
        user_id: &str,
        since_ms: i64,
    ) -> Result<Vec<(CallRecord, ParticipantStatus)>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT c.id, c.caller_id, c.call_type, c.conversation_id, c.status,
                       c.created_at_ms, c.started_at_ms, c.ended_at_ms, p.status
                FROM call_participants p
                JOIN calls c ON c.id = p.call_id
                WHERE p.user_id = ?1
                  AND (c.status IN ('ringing', 'ongoing') OR COALESCE(c.ended_at_ms, c.created_at_ms) >= ?2)
                ORDER BY c.created_at_ms ASC, c.rowid ASC
                LIMIT 500
                "#,
            )?;
            let rows = stmt
                .query_map(params![user_id, since_ms], |r| {
                    let call = call_from_row(r)?;
                    let mine: String = r.get(8)?;
                    let mine = ParticipantStatus::parse(&mine).ok_or_else(|| bad_value(8, &mine))?;
                    Ok((call, mine))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn sweep_unanswered(&self, cutoff_ms: i64) -> Result<Vec<(CallRecord, Vec<String>)>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let ids = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM calls WHERE status = 'ringing' AND created_at_ms < ?1 ORDER BY created_at_ms ASC LIMIT 500",
                )?;
                let ids = stmt
                    .query_map(params![cutoff_ms], |r| r.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };
            let now = now_ms();
            let mut out = Vec::new();
            for id in ids {
                let n = tx.execute(
                    "UPDATE calls SET status = 'missed', ended_at_ms = ?2 WHERE id = ?1 AND status = 'ringing'",
                    params![id, now],
                )?;
                if n == 0 {
                    continue;
                }
                if let Some(call) = load_call(&tx, &id)? {
                    let members = load_participants(&tx, &id)?
                        .into_iter()
                        .map(|p| p.user_id)
                        .collect();
                    out.push((call, members));
                }
            }
            tx.commit()?;
            Ok(out)
        })
        .await
    }

    pub async fn cleanup_signals(&self, ttl_secs: u64) -> Result<u64> {
        let cutoff = now_ms().saturating_sub((ttl_secs as i64).saturating_mul(1000));
        self.with_conn(move |conn| {
            Ok(conn.execute("DELETE FROM call_signals WHERE created_at_ms < ?1", params![cutoff])? as u64)
        })
        .await
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS calls (
          id TEXT PRIMARY KEY,
          caller_id TEXT NOT NULL,
          call_type TEXT NOT NULL,
          conversation_id TEXT NULL,
          status TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          started_at_ms INTEGER NULL,
          ended_at_ms INTEGER NULL
        );
        CREATE INDEX IF NOT EXISTS idx_calls_status_created ON calls(status, created_at_ms);
        CREATE TABLE IF NOT EXISTS call_participants (
          call_id TEXT NOT NULL REFERENCES calls(id),
          user_id TEXT NOT NULL,
          status TEXT NOT NULL,
          joined_at_ms INTEGER NULL,
          left_at_ms INTEGER NULL,
          PRIMARY KEY(call_id, user_id)
        );
        CREATE INDEX IF NOT EXISTS idx_call_participants_user ON call_participants(user_id);
        CREATE TABLE IF NOT EXISTS call_signals (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          id TEXT NOT NULL UNIQUE,
          call_id TEXT NOT NULL REFERENCES calls(id),
          from_user_id TEXT NOT NULL,
          to_user_id TEXT NOT NULL,
          signal_type TEXT NOT NULL,
          signal_data TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_call_signals_to ON call_signals(to_user_id, seq);
        CREATE INDEX IF NOT EXISTS idx_call_signals_created ON call_signals(created_at_ms);
        CREATE TABLE IF NOT EXISTS identities (
          token_sha256 TEXT PRIMARY KEY,
          user_id TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          disabled INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_identities_user ON identities(user_id);
        "#,
    )?;
    Ok(())
}

fn load_call(conn: &Connection, call_id: &str) -> Result<Option<CallRecord>> {
    let call = conn
        .query_row(
            r#"
            SELECT id, caller_id, call_type, conversation_id, status, created_at_ms, started_at_ms, ended_at_ms
            FROM calls WHERE id = ?1
            "#,
            params![call_id],
            call_from_row,
        )
        .optional()?;
    Ok(call)
}

fn load_participants(conn: &Connection, call_id: &str) -> Result<Vec<ParticipantRecord>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT call_id, user_id, status, joined_at_ms, left_at_ms
        FROM call_participants WHERE call_id = ?1
        ORDER BY rowid ASC
        "#,
    )?;
    let rows = stmt
        .query_map(params![call_id], participant_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn load_participant_status(conn: &Connection, call_id: &str, user_id: &str) -> Result<Option<ParticipantStatus>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM call_participants WHERE call_id = ?1 AND user_id = ?2",
            params![call_id, user_id],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(
            ParticipantStatus::parse(&s).with_context(|| format!("unknown participant status {s}"))?,
        )),
        None => Ok(None),
    }
}

fn load_transition(conn: &Connection, call_id: &str, user_id: &str, status_changed: bool) -> Result<CallTransition> {
    let call = load_call(conn, call_id)?.context("call vanished inside transaction")?;
    let participants = load_participants(conn, call_id)?;
    let participant = participants
        .iter()
        .find(|p| p.user_id == user_id)
        .cloned()
        .context("participant vanished inside transaction")?;
    Ok(CallTransition {
        call,
        participant,
        status_changed,
        participant_ids: participants.into_iter().map(|p| p.user_id).collect(),
    })
}

fn bad_value(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("unknown value {value:?}").into())
}

fn call_from_row(r: &Row<'_>) -> rusqlite::Result<CallRecord> {
    let call_type: String = r.get(2)?;
    let status: String = r.get(4)?;
    Ok(CallRecord {
        id: r.get(0)?,
        caller_id: r.get(1)?,
        call_type: CallKind::parse(&call_type).ok_or_else(|| bad_value(2, &call_type))?,
        conversation_id: r.get(3)?,
        status: CallStatus::parse(&status).ok_or_else(|| bad_value(4, &status))?,
        created_at_ms: r.get(5)?,
        started_at_ms: r.get(6)?,
        ended_at_ms: r.get(7)?,
    })
}

fn participant_from_row(r: &Row<'_>) -> rusqlite::Result<ParticipantRecord> {
    let status: String = r.get(2)?;
    Ok(ParticipantRecord {
        call_id: r.get(0)?,
        user_id: r.get(1)?,
        status: ParticipantStatus::parse(&status).ok_or_else(|| bad_value(2, &status))?,
        joined_at_ms: r.get(3)?,
        left_at_ms: r.get(4)?,
    })
}

fn signal_from_row(r: &Row<'_>) -> rusqlite::Result<SignalRecord> {
    let signal_type: String = r.get(5)?;
    let data: String = r.get(6)?;
    Ok(SignalRecord {
        seq: r.get(0)?,
        id: r.get(1)?,
        call_id: r.get(2)?,
        from_user_id: r.get(3)?,
        to_user_id: r.get(4)?,
        signal_type: SignalType::parse(&signal_type).ok_or_else(|| bad_value(5, &signal_type))?,
        signal_data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        created_at_ms: r.get(7)?,
    })
}

pub fn token_hash_hex(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let bytes = hasher.finalize();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}


#[cfg(test)]
mod tests {
    use super::test_support::{temp_ledger, user};
    use super::*;

    fn applied<T: std::fmt::Debug>(m: Mutation<T>) -> T {
        match m {
            Mutation::Applied(v) => v,
            other => panic!("expected applied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_call_writes_call_and_participants_together() {
        let ledger = temp_ledger();
        let (a, b) = (user(), user());
        let created = ledger.create_call(&a, CallKind::Voice, Some(&b), None).await.unwrap();
        assert_eq!(created.call.status, CallStatus::Ringing);

        let rows = ledger.list_participants(&created.call.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].user_id, a);
        assert_eq!(rows[0].status, ParticipantStatus::Joined);
        assert_eq!(rows[1].user_id, b);
        assert_eq!(rows[1].status, ParticipantStatus::Ringing);
    }

    #[tokio::test]
    async fn status_never_leaves_a_terminal_value() {
        let ledger = temp_ledger();
        let (a, b) = (user(), user());
        let call = ledger.create_call(&a, CallKind::Video, Some(&b), None).await.unwrap().call;

        let joined = applied(ledger.join_call(&call.id, &b).await.unwrap());
        assert!(joined.status_changed);
        assert_eq!(joined.call.status, CallStatus::Ongoing);
        assert!(joined.call.started_at_ms.is_some());

        let ended = applied(ledger.end_call(&call.id, &a).await.unwrap());
        assert!(ended.status_changed);
        assert_eq!(ended.call.status, CallStatus::Ended);

        assert!(matches!(
            ledger.join_call(&call.id, &b).await.unwrap(),
            Mutation::InvalidState(_)
        ));
        assert!(matches!(
            ledger.reject_call(&call.id, &b).await.unwrap(),
            Mutation::InvalidState(_)
        ));
        let again = applied(ledger.end_call(&call.id, &b).await.unwrap());
        assert!(!again.status_changed);
        assert_eq!(again.call.status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn signals_are_ordered_and_scoped_to_recipient() {
        let ledger = temp_ledger();
        let (a, b) = (user(), user());
        let call = ledger.create_call(&a, CallKind::Voice, Some(&b), None).await.unwrap().call;

        for (i, ty) in [SignalType::Offer, SignalType::IceCandidate, SignalType::IceCandidate]
            .into_iter()
            .enumerate()
        {
            applied(
                ledger
                    .insert_signal(&call.id, &a, &b, ty, serde_json::json!({ "n": i }))
                    .await
                    .unwrap(),
            );
        }
        applied(
            ledger
                .insert_signal(&call.id, &b, &a, SignalType::Answer, serde_json::json!({ "n": 9 }))
                .await
                .unwrap(),
        );

        let for_b = ledger.list_signals_after(&b, 0, 50).await.unwrap();
        assert_eq!(for_b.len(), 3);
        assert_eq!(for_b[0].signal_type, SignalType::Offer);
        assert!(for_b.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(for_b[2].signal_data["n"], 2);

        let after_first = ledger.list_signals_after(&b, for_b[0].seq, 50).await.unwrap();
        assert_eq!(after_first.len(), 2);

        let for_a = ledger.list_signals_after(&a, 0, 50).await.unwrap();
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].signal_type, SignalType::Answer);
    }

    #[tokio::test]
    async fn signal_to_outsider_is_refused() {
        let ledger = temp_ledger();
        let (a, b, c) = (user(), user(), user());
        let call = ledger.create_call(&a, CallKind::Voice, Some(&b), None).await.unwrap().call;
        assert!(matches!(
            ledger
                .insert_signal(&call.id, &a, &c, SignalType::Offer, serde_json::json!({}))
                .await
                .unwrap(),
            Mutation::NotParticipant
        ));
    }

    #[tokio::test]
    async fn sweep_marks_only_old_ringing_calls_missed() {
        let ledger = temp_ledger();
        let (a, b) = (user(), user());
        let stale = ledger.create_call(&a, CallKind::Voice, Some(&b), None).await.unwrap().call;
        let answered = ledger.create_call(&a, CallKind::Voice, Some(&b), None).await.unwrap().call;
        applied(ledger.join_call(&answered.id, &b).await.unwrap());

        let swept = ledger.sweep_unanswered(now_ms() + 1_000).await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].0.id, stale.id);
        assert_eq!(swept[0].0.status, CallStatus::Missed);
        assert_eq!(swept[0].1.len(), 2);

        let answered = ledger.get_call(&answered.id).await.unwrap().unwrap();
        assert_eq!(answered.status, CallStatus::Ongoing);
    }

    #[tokio::test]
    async fn resync_lists_live_and_recently_finished_calls() {
        let ledger = temp_ledger();
        let (a, b, c) = (user(), user(), user());
        let ringing = ledger.create_call(&a, CallKind::Video, Some(&b), None).await.unwrap().call;
        let rejected = ledger.create_call(&a, CallKind::Voice, Some(&b), None).await.unwrap().call;
        applied(ledger.reject_call(&rejected.id, &b).await.unwrap());
        ledger.create_call(&a, CallKind::Voice, Some(&c), None).await.unwrap();

        let rows = ledger.calls_to_resync(&b, 0).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0.id, ringing.id);
        assert_eq!(rows[0].1, ParticipantStatus::Ringing);
        assert_eq!(rows[1].0.id, rejected.id);
        assert_eq!(rows[1].0.status, CallStatus::Rejected);

        let rows = ledger.calls_to_resync(&b, now_ms() + 60_000).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.id, ringing.id);
    }

    #[tokio::test]
    async fn tokens_resolve_to_their_user() {
        let ledger = temp_ledger();
        let a = user();
        ledger.insert_identity(&a, "tok-abcdef0123456789").await.unwrap();
        assert_eq!(ledger.resolve_token("tok-abcdef0123456789").await.unwrap(), Some(a));
        assert_eq!(ledger.resolve_token("other").await.unwrap(), None);
    }
}
