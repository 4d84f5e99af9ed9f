//! Session, transition, risk snapshot and signal audit persistence

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::core::risk::RiskState;
use crate::core::session::{GridSession, SessionState};
use crate::core::types::{Direction, MarketSnapshot, Signal};
use crate::db::{lock, Database};
use crate::error::TradingResult;

/// One row of `grid_sessions` without the payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub symbol: String,
    pub state: String,
    pub opened_at: String,
    pub closed_at: Option<String>,
    pub realized_pnl: f64,
    pub exit_reason: Option<String>,
}

impl SessionRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(SessionRecord {
            id: row.get(0)?,
            symbol: row.get(1)?,
            state: row.get(2)?,
            opened_at: row.get(3)?,
            closed_at: row.get(4)?,
            realized_pnl: row.get(5)?,
            exit_reason: row.get(6)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub symbol: String,
    pub timestamp: String,
    pub direction: String,
    pub confidence: f64,
}

#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    /// Wrap an already migrated database
    pub fn new(db: &Database) -> Self {
        Self {
            conn: db.get_connection(),
        }
    }

    /// Upsert the full session
    pub fn save_session(&self, session: &GridSession) -> TradingResult<()> {
        let payload = serde_json::to_string(session)?;
        let conn = lock(&self.conn);
        conn.execute(
            "INSERT INTO grid_sessions (
                id, symbol, state, opened_at, closed_at, realized_pnl, exit_reason, payload
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                closed_at = excluded.closed_at,
                realized_pnl = excluded.realized_pnl,
                exit_reason = excluded.exit_reason,
                payload = excluded.payload,
                updated_at = CURRENT_TIMESTAMP",
            params![
                session.id,
                session.symbol,
                session.state.as_str(),
                session.opened_at.to_rfc3339(),
                session.closed_at.map(|t| t.to_rfc3339()),
                session.realized_pnl,
                session.exit_reason.as_ref().map(ToString::to_string),
                payload,
            ],
        )?;
        Ok(())
    }

    pub fn record_transition(
        &self,
        session_id: &str,
        from: SessionState,
        to: SessionState,
        at: DateTime<Utc>,
        note: Option<&str>,
    ) -> TradingResult<()> {
        let conn = lock(&self.conn);
        conn.execute(
            "INSERT INTO session_transitions (session_id, from_state, to_state, at, note)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, from.as_str(), to.as_str(), at.to_rfc3339(), note],
        )?;
        Ok(())
    }

    /// `(from, to)` pairs for a session, oldest first
    pub fn transitions(&self, session_id: &str) -> TradingResult<Vec<(String, String)>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT from_state, to_state FROM session_transitions
             WHERE session_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![session_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Sessions that were not terminal when last written
    pub fn load_active_sessions(&self) -> TradingResult<Vec<GridSession>> {
        let payloads: Vec<String> = {
            let conn = lock(&self.conn);
            let mut stmt = conn.prepare(
                "SELECT payload FROM grid_sessions
                 WHERE state NOT IN ('closed', 'aborted')
                 ORDER BY opened_at",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut sessions = Vec::with_capacity(payloads.len());
        for payload in payloads {
            sessions.push(serde_json::from_str(&payload)?);
        }
        Ok(sessions)
    }

    pub fn load_session(&self, id: &str) -> TradingResult<Option<GridSession>> {
        let payload: Option<String> = {
            let conn = lock(&self.conn);
            conn.query_row(
                "SELECT payload FROM grid_sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
        };
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Most recently opened sessions first
    pub fn list_sessions(&self, limit: usize) -> TradingResult<Vec<SessionRecord>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT id, symbol, state, opened_at, closed_at, realized_pnl, exit_reason
             FROM grid_sessions ORDER BY opened_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], SessionRecord::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn save_risk_snapshot(&self, state: &RiskState, taken_at: DateTime<Utc>) -> TradingResult<()> {
        let payload = serde_json::to_string(state)?;
        let conn = lock(&self.conn);
        conn.execute(
            "INSERT INTO risk_snapshots (taken_at, current_balance, peak_balance, halted, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                taken_at.to_rfc3339(),
                state.current_balance,
                state.peak_balance,
                if state.halted { 1 } else { 0 },
                payload,
            ],
        )?;
        Ok(())
    }

    pub fn load_latest_risk_state(&self) -> TradingResult<Option<RiskState>> {
        let payload: Option<String> = {
            let conn = lock(&self.conn);
            conn.query_row(
                "SELECT payload FROM risk_snapshots ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
        };
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    pub fn record_signal(&self, signal: &Signal, snapshot: &MarketSnapshot) -> TradingResult<()> {
        let direction = match signal.direction {
            Direction::Long => "long",
            Direction::Short => "short",
            Direction::Flat => "flat",
        };
        let conn = lock(&self.conn);
        conn.execute(
            "INSERT INTO signal_audit (
                symbol, timestamp, direction, confidence, volatility_ok, volume_ok,
                price_range_ok, regime_ok, close, atr, trend_strength
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                signal.symbol,
                signal.timestamp.to_rfc3339(),
                direction,
                signal.confidence,
                signal.factors.volatility_ok,
                signal.factors.volume_ok,
                signal.factors.price_range_ok,
                signal.factors.regime_ok,
                snapshot.close,
                snapshot.atr,
                snapshot.trend_strength,
            ],
        )?;
        Ok(())
    }

    pub fn recent_signals(&self, symbol: &str, limit: usize) -> TradingResult<Vec<SignalRecord>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT symbol, timestamp, direction, confidence FROM signal_audit
             WHERE symbol = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![symbol, limit as i64], |row| {
            Ok(SignalRecord {
                symbol: row.get(0)?,
                timestamp: row.get(1)?,
                direction: row.get(2)?,
                confidence: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
