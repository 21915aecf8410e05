#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use hyve_xp_core::{
    award_for_attendance, award_for_connection, award_for_hosting, format_rfc3339, now_utc,
    xp_overflow, Award, ConnectionAward, EventId, LevelCurve, LevelInfo, Session, StoreError,
    UserId, XpPolicy, XpStore,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

const XP_MIGRATION_VERSION: i64 = 1;

const SCHEMA_XP_V1: &str = r"
CREATE TABLE IF NOT EXISTS profiles (
  user_id TEXT PRIMARY KEY,
  xp INTEGER NOT NULL CHECK (typeof(xp) = 'integer' AND xp >= 0),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_profiles_xp_no_decrease
BEFORE UPDATE OF xp ON profiles
WHEN NEW.xp < OLD.xp
BEGIN
  SELECT RAISE(FAIL, 'profiles.xp never decreases');
END;

CREATE TABLE IF NOT EXISTS hosted_events (
  event_id TEXT PRIMARY KEY,
  host_id TEXT NOT NULL,
  title TEXT NOT NULL,
  attend_token TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (host_id) REFERENCES profiles(user_id)
);

CREATE TABLE IF NOT EXISTS event_attendance (
  event_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  checked_in_at TEXT NOT NULL,
  PRIMARY KEY (event_id, user_id),
  FOREIGN KEY (event_id) REFERENCES hosted_events(event_id),
  FOREIGN KEY (user_id) REFERENCES profiles(user_id)
);

CREATE TABLE IF NOT EXISTS connection_requests (
  request_id TEXT PRIMARY KEY,
  requester_id TEXT NOT NULL,
  recipient_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending', 'accepted', 'declined')),
  created_at TEXT NOT NULL,
  resolved_at TEXT,
  CHECK (requester_id <> recipient_id),
  FOREIGN KEY (requester_id) REFERENCES profiles(user_id),
  FOREIGN KEY (recipient_id) REFERENCES profiles(user_id)
);

CREATE INDEX IF NOT EXISTS idx_connection_requests_recipient_status
  ON connection_requests(recipient_id, status);

CREATE TABLE IF NOT EXISTS user_connections (
  user_id TEXT NOT NULL,
  peer_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  PRIMARY KEY (user_id, peer_id),
  CHECK (user_id <> peer_id),
  FOREIGN KEY (user_id) REFERENCES profiles(user_id),
  FOREIGN KEY (peer_id) REFERENCES profiles(user_id)
);
";

pub struct SqliteXpStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileProvision {
    pub user_id: UserId,
    pub created: bool,
    pub xp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileSnapshot {
    pub user_id: UserId,
    pub xp: u64,
    pub level: LevelInfo,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HostOutcome {
    Hosted { event_id: EventId, award: Award },
    AlreadyHosted { event_id: EventId, host_id: UserId },
}

/// Check-in secret for an event, carried by the event's QR link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttendanceToken {
    pub event_id: EventId,
    pub attend_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckInOutcome {
    CheckedIn {
        event_id: EventId,
        award: Award,
    },
    AlreadyCheckedIn {
        event_id: EventId,
        checked_in_at: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Declined,
}

impl RequestStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "declined" => Some(Self::Declined),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub request_id: Ulid,
    pub requester_id: UserId,
    pub recipient_id: UserId,
    pub status: RequestStatus,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionAcceptance {
    pub request: ConnectionRequest,
    pub award: ConnectionAward,
}

impl SqliteXpStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_XP_V1)
            .context("failed to apply xp schema")?;

        let now = timestamp_now()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![XP_MIGRATION_VERSION, now],
            )
            .context("failed to register xp schema migration")?;

        tracing::debug!(version = XP_MIGRATION_VERSION, "xp schema migrated");
        Ok(())
    }

    /// Creates a profile holding the signup bonus. Existing profiles are left
    /// untouched and reported with `created = false`.
    pub fn provision_profile(&self, user_id: &UserId, signup_bonus: u64) -> Result<ProfileProvision> {
        let bonus = i64::try_from(signup_bonus)
            .with_context(|| format!("signup bonus {signup_bonus} exceeds storage range"))?;
        let now = timestamp_now()?;

        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO profiles(user_id, xp, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![user_id.as_str(), bonus, now],
            )
            .context("failed to provision profile")?;

        let xp = self.read_xp(user_id)?;
        if inserted == 1 {
            tracing::info!(user_id = %user_id, xp, "profile provisioned");
        }

        Ok(ProfileProvision {
            user_id: user_id.clone(),
            created: inserted == 1,
            xp,
        })
    }

    pub fn profile(&self, user_id: &UserId, curve: LevelCurve) -> Result<Option<ProfileSnapshot>> {
        let row = self
            .conn
            .query_row(
                "SELECT xp, created_at, updated_at FROM profiles WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .context("failed to load profile")?;

        let Some((xp_raw, created_at, updated_at)) = row else {
            return Ok(None);
        };
        let xp = u64::try_from(xp_raw)
            .with_context(|| format!("invalid stored xp for {user_id}: {xp_raw}"))?;

        Ok(Some(ProfileSnapshot {
            user_id: user_id.clone(),
            xp,
            level: curve.level_for(xp),
            created_at,
            updated_at,
        }))
    }

    /// Records a hosted event and credits its host in one transaction.
    pub fn host_event(
        &mut self,
        session: &Session,
        policy: &XpPolicy,
        event_id: &EventId,
        title: &str,
    ) -> Result<HostOutcome> {
        if title.trim().is_empty() {
            return Err(anyhow!("event title MUST be provided"));
        }

        let host_id = session.user_id();
        let tx = self
            .conn
            .transaction()
            .context("failed to start host transaction")?;

        let existing_host: Option<String> = tx
            .query_row(
                "SELECT host_id FROM hosted_events WHERE event_id = ?1",
                params![event_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up hosted event")?;

        if let Some(existing) = existing_host {
            return Ok(HostOutcome::AlreadyHosted {
                event_id: event_id.clone(),
                host_id: parse_user_id(&existing)?,
            });
        }

        let now = timestamp_now()?;
        tx.execute(
            "INSERT INTO hosted_events(event_id, host_id, title, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![event_id.as_str(), host_id.as_str(), title.trim(), now],
        )
        .with_context(|| format!("failed to record hosted event {event_id}"))?;

        let award = award_for_hosting(&mut ConnectionXpStore { conn: &tx }, policy, host_id)?;
        tx.commit().context("failed to commit host transaction")?;

        Ok(HostOutcome::Hosted {
            event_id: event_id.clone(),
            award,
        })
    }

    /// Issues a fresh check-in token for an event hosted by the session user.
    /// Any earlier token stops working.
    pub fn enable_attendance(
        &mut self,
        session: &Session,
        event_id: &EventId,
    ) -> Result<AttendanceToken> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start attendance transaction")?;

        let host_id: Option<String> = tx
            .query_row(
                "SELECT host_id FROM hosted_events WHERE event_id = ?1",
                params![event_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up hosted event")?;
        let Some(host_id) = host_id else {
            return Err(anyhow!("event not found: {event_id}"));
        };
        if host_id != session.user_id().as_str() {
            return Err(anyhow!("only {host_id} can enable attendance for {event_id}"));
        }

        let attend_token = Ulid::new().to_string();
        tx.execute(
            "UPDATE hosted_events SET attend_token = ?1 WHERE event_id = ?2",
            params![attend_token, event_id.as_str()],
        )
        .context("failed to store attendance token")?;
        tx.commit().context("failed to commit attendance transaction")?;

        tracing::info!(event_id = %event_id, "attendance enabled");
        Ok(AttendanceToken {
            event_id: event_id.clone(),
            attend_token,
        })
    }

    /// Marks the session user as attending and credits the first check-in.
    /// The event must have attendance enabled and `token` must match it.
    /// Repeated check-ins award nothing.
    pub fn check_in(
        &mut self,
        session: &Session,
        policy: &XpPolicy,
        event_id: &EventId,
        token: &str,
    ) -> Result<CheckInOutcome> {
        let user_id = session.user_id();
        let tx = self
            .conn
            .transaction()
            .context("failed to start check-in transaction")?;

        let stored_token: Option<Option<String>> = tx
            .query_row(
                "SELECT attend_token FROM hosted_events WHERE event_id = ?1",
                params![event_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up event")?;
        match stored_token {
            None => return Err(anyhow!("event not found: {event_id}")),
            Some(None) => return Err(anyhow!("attendance not enabled for event {event_id}")),
            Some(Some(expected)) if expected != token.trim() => {
                return Err(anyhow!("invalid or expired check-in token for {event_id}"));
            }
            Some(Some(_)) => {}
        }

        let existing: Option<String> = tx
            .query_row(
                "SELECT checked_in_at FROM event_attendance WHERE event_id = ?1 AND user_id = ?2",
                params![event_id.as_str(), user_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up attendance")?;

        if let Some(checked_in_at) = existing {
            tracing::debug!(user_id = %user_id, event_id = %event_id, "already checked in");
            return Ok(CheckInOutcome::AlreadyCheckedIn {
                event_id: event_id.clone(),
                checked_in_at,
            });
        }

        let now = timestamp_now()?;
        tx.execute(
            "INSERT INTO event_attendance(event_id, user_id, checked_in_at) VALUES (?1, ?2, ?3)",
            params![event_id.as_str(), user_id.as_str(), now],
        )
        .with_context(|| format!("failed to record attendance for {user_id} at {event_id}"))?;

        let award = award_for_attendance(&mut ConnectionXpStore { conn: &tx }, policy, user_id)?;
        tx.commit().context("failed to commit check-in transaction")?;

        Ok(CheckInOutcome::CheckedIn {
            event_id: event_id.clone(),
            award,
        })
    }

    /// Creates a pending request from the session user to `recipient`.
    /// Checks and insert share one write-locked transaction, so two requests
    /// in opposite directions cannot both stay pending.
    pub fn request_connection(
        &mut self,
        session: &Session,
        recipient: &UserId,
    ) -> Result<ConnectionRequest> {
        let requester = session.user_id();
        if requester == recipient {
            return Err(anyhow!("cannot request a connection with yourself"));
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start connection request transaction")?;

        for user_id in [requester, recipient] {
            if !profile_exists(&tx, user_id)? {
                return Err(anyhow!("profile not found: {user_id}"));
            }
        }

        if are_connected(&tx, requester, recipient)? {
            return Err(anyhow!("{requester} and {recipient} are already connected"));
        }

        let pending = tx
            .query_row(
                "SELECT request_id FROM connection_requests
                 WHERE status = 'pending'
                   AND ((requester_id = ?1 AND recipient_id = ?2)
                     OR (requester_id = ?2 AND recipient_id = ?1))
                 LIMIT 1",
                params![requester.as_str(), recipient.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to look up pending connection requests")?;
        if let Some(request_id) = pending {
            return Err(anyhow!(
                "a pending connection request already exists: {request_id}"
            ));
        }

        let request = ConnectionRequest {
            request_id: Ulid::new(),
            requester_id: requester.clone(),
            recipient_id: recipient.clone(),
            status: RequestStatus::Pending,
            created_at: timestamp_now()?,
            resolved_at: None,
        };

        tx.execute(
            "INSERT INTO connection_requests(
                request_id, requester_id, recipient_id, status, created_at, resolved_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
            params![
                request.request_id.to_string(),
                request.requester_id.as_str(),
                request.recipient_id.as_str(),
                request.status.as_str(),
                request.created_at,
            ],
        )
        .context("failed to insert connection request")?;
        tx.commit()
            .context("failed to commit connection request transaction")?;

        Ok(request)
    }

    pub fn get_connection_request(&self, request_id: Ulid) -> Result<Option<ConnectionRequest>> {
        load_connection_request(&self.conn, request_id)
    }

    /// Accepts a pending request addressed to the session user, connects both
    /// users, and credits each of them. Either all of it commits or none does.
    pub fn accept_connection(
        &mut self,
        session: &Session,
        policy: &XpPolicy,
        request_id: Ulid,
    ) -> Result<ConnectionAcceptance> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start accept transaction")?;

        let request = pending_request_for(&tx, session, request_id)?;
        let resolved_at = timestamp_now()?;

        tx.execute(
            "UPDATE connection_requests SET status = 'accepted', resolved_at = ?1 WHERE request_id = ?2",
            params![resolved_at, request_id.to_string()],
        )
        .context("failed to mark connection request accepted")?;

        for (user_id, peer_id) in [
            (&request.requester_id, &request.recipient_id),
            (&request.recipient_id, &request.requester_id),
        ] {
            tx.execute(
                "INSERT OR IGNORE INTO user_connections(user_id, peer_id, created_at) VALUES (?1, ?2, ?3)",
                params![user_id.as_str(), peer_id.as_str(), resolved_at],
            )
            .context("failed to insert connection edge")?;
        }

        let award = award_for_connection(
            &mut ConnectionXpStore { conn: &tx },
            policy,
            &request.recipient_id,
            &request.requester_id,
        )?;
        tx.commit().context("failed to commit accept transaction")?;

        Ok(ConnectionAcceptance {
            request: ConnectionRequest {
                status: RequestStatus::Accepted,
                resolved_at: Some(resolved_at),
                ..request
            },
            award,
        })
    }

    pub fn decline_connection(
        &mut self,
        session: &Session,
        request_id: Ulid,
    ) -> Result<ConnectionRequest> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start decline transaction")?;

        let request = pending_request_for(&tx, session, request_id)?;
        let resolved_at = timestamp_now()?;
        tx.execute(
            "UPDATE connection_requests SET status = 'declined', resolved_at = ?1 WHERE request_id = ?2",
            params![resolved_at, request_id.to_string()],
        )
        .context("failed to mark connection request declined")?;
        tx.commit().context("failed to commit decline transaction")?;

        Ok(ConnectionRequest {
            status: RequestStatus::Declined,
            resolved_at: Some(resolved_at),
            ..request
        })
    }

    /// Removes both directed edges between the session user and `peer`.
    /// XP earned from the connection is kept.
    pub fn disconnect(&mut self, session: &Session, peer: &UserId) -> Result<bool> {
        let user_id = session.user_id();
        let tx = self
            .conn
            .transaction()
            .context("failed to start disconnect transaction")?;

        let mut removed = 0;
        for (from, to) in [(user_id, peer), (peer, user_id)] {
            removed += tx
                .execute(
                    "DELETE FROM user_connections WHERE user_id = ?1 AND peer_id = ?2",
                    params![from.as_str(), to.as_str()],
                )
                .context("failed to delete connection edge")?;
        }
        tx.commit().context("failed to commit disconnect transaction")?;

        Ok(removed > 0)
    }

    pub fn list_connections(&self, user_id: &UserId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn.prepare(
            "SELECT peer_id FROM user_connections
             WHERE user_id = ?1
             ORDER BY created_at DESC, peer_id ASC",
        )?;
        let mut rows = stmt.query(params![user_id.as_str()])?;

        let mut peers = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            peers.push(parse_user_id(&raw)?);
        }
        Ok(peers)
    }

    pub fn pending_requests_for(&self, recipient: &UserId) -> Result<Vec<ConnectionRequest>> {
        let mut stmt = self.conn.prepare(
            "SELECT request_id, requester_id, recipient_id, status, created_at, resolved_at
             FROM connection_requests
             WHERE recipient_id = ?1 AND status = 'pending'
             ORDER BY created_at ASC, request_id ASC",
        )?;
        let rows = stmt.query_map(params![recipient.as_str()], parse_request_row)?;

        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }
        Ok(requests)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl XpStore for SqliteXpStore {
    fn read_xp(&self, user_id: &UserId) -> Result<u64, StoreError> {
        read_xp_on(&self.conn, user_id)
    }

    fn write_xp(&mut self, user_id: &UserId, new_xp: u64) -> Result<(), StoreError> {
        write_xp_on(&self.conn, user_id, new_xp)
    }

    fn increment_xp(&mut self, user_id: &UserId, amount: u64) -> Result<u64, StoreError> {
        increment_xp_on(&self.conn, user_id, amount)
    }
}

/// Routes the award policy through an open transaction.
struct ConnectionXpStore<'c> {
    conn: &'c Connection,
}

impl XpStore for ConnectionXpStore<'_> {
    fn read_xp(&self, user_id: &UserId) -> Result<u64, StoreError> {
        read_xp_on(self.conn, user_id)
    }

    fn write_xp(&mut self, user_id: &UserId, new_xp: u64) -> Result<(), StoreError> {
        write_xp_on(self.conn, user_id, new_xp)
    }

    fn increment_xp(&mut self, user_id: &UserId, amount: u64) -> Result<u64, StoreError> {
        increment_xp_on(self.conn, user_id, amount)
    }
}

fn read_xp_on(conn: &Connection, user_id: &UserId) -> Result<u64, StoreError> {
    let stored: Option<i64> = conn
        .query_row(
            "SELECT xp FROM profiles WHERE user_id = ?1",
            params![user_id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(backend_error)?;

    match stored {
        Some(value) => u64::try_from(value)
            .map_err(|_| StoreError::Backend(format!("invalid stored xp for {user_id}: {value}"))),
        None => Err(StoreError::NotFound {
            user_id: user_id.clone(),
        }),
    }
}

fn write_xp_on(conn: &Connection, user_id: &UserId, new_xp: u64) -> Result<(), StoreError> {
    let value = to_sql_xp(new_xp)?;
    let now = store_timestamp()?;
    let changed = conn
        .execute(
            "UPDATE profiles SET xp = ?1, updated_at = ?2 WHERE user_id = ?3",
            params![value, now, user_id.as_str()],
        )
        .map_err(backend_error)?;

    if changed == 0 {
        return Err(StoreError::NotFound {
            user_id: user_id.clone(),
        });
    }
    Ok(())
}

fn increment_xp_on(conn: &Connection, user_id: &UserId, amount: u64) -> Result<u64, StoreError> {
    let delta = to_sql_xp(amount)?;
    let ceiling = i64::MAX - delta;
    let now = store_timestamp()?;
    let updated: Option<i64> = conn
        .query_row(
            "UPDATE profiles SET xp = xp + ?1, updated_at = ?2
             WHERE user_id = ?3 AND xp <= ?4
             RETURNING xp",
            params![delta, now, user_id.as_str(), ceiling],
            |row| row.get(0),
        )
        .optional()
        .map_err(backend_error)?;

    match updated {
        Some(value) => u64::try_from(value)
            .map_err(|_| StoreError::Backend(format!("invalid stored xp for {user_id}: {value}"))),
        // No row: either the profile is missing or the sum would leave INTEGER range.
        None => {
            let current = read_xp_on(conn, user_id)?;
            Err(xp_overflow(user_id, current, amount))
        }
    }
}

fn profile_exists(conn: &Connection, user_id: &UserId) -> Result<bool> {
    match read_xp_on(conn, user_id) {
        Ok(_) => Ok(true),
        Err(StoreError::NotFound { .. }) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn are_connected(conn: &Connection, user_id: &UserId, peer_id: &UserId) -> Result<bool> {
    let connected = conn
        .query_row(
            "SELECT 1 FROM user_connections WHERE user_id = ?1 AND peer_id = ?2",
            params![user_id.as_str(), peer_id.as_str()],
            |_| Ok(()),
        )
        .optional()
        .context("failed to look up connection")?
        .is_some();
    Ok(connected)
}

fn pending_request_for(
    conn: &Connection,
    session: &Session,
    request_id: Ulid,
) -> Result<ConnectionRequest> {
    let Some(request) = load_connection_request(conn, request_id)? else {
        return Err(anyhow!("connection request not found: {request_id}"));
    };

    if request.recipient_id != *session.user_id() {
        return Err(anyhow!(
            "only {} can resolve connection request {request_id}",
            request.recipient_id
        ));
    }

    if request.status != RequestStatus::Pending {
        return Err(anyhow!(
            "connection request {request_id} is already {}",
            request.status.as_str()
        ));
    }

    Ok(request)
}

fn load_connection_request(conn: &Connection, request_id: Ulid) -> Result<Option<ConnectionRequest>> {
    conn.query_row(
        "SELECT request_id, requester_id, recipient_id, status, created_at, resolved_at
         FROM connection_requests
         WHERE request_id = ?1",
        params![request_id.to_string()],
        parse_request_row,
    )
    .optional()
    .context("failed to load connection request")
}

fn parse_request_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectionRequest> {
    let request_id_raw: String = row.get(0)?;
    let requester_raw: String = row.get(1)?;
    let recipient_raw: String = row.get(2)?;
    let status_raw: String = row.get(3)?;

    let request_id = Ulid::from_string(&request_id_raw)
        .map_err(|_| conversion_error(0, format!("invalid ULID: {request_id_raw}")))?;
    let status = RequestStatus::parse(&status_raw)
        .ok_or_else(|| conversion_error(3, format!("invalid request status: {status_raw}")))?;

    Ok(ConnectionRequest {
        request_id,
        requester_id: UserId::parse(&requester_raw)
            .map_err(|err| conversion_error(1, err.to_string()))?,
        recipient_id: UserId::parse(&recipient_raw)
            .map_err(|err| conversion_error(2, err.to_string()))?,
        status,
        created_at: row.get(4)?,
        resolved_at: row.get(5)?,
    })
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_user_id(raw: &str) -> Result<UserId> {
    UserId::parse(raw).map_err(|err| anyhow!("invalid stored user id: {err}"))
}

fn to_sql_xp(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::Backend(format!("xp value {value} exceeds storage range")))
}

#[allow(clippy::needless_pass_by_value)]
fn backend_error(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn store_timestamp() -> Result<String, StoreError> {
    format_rfc3339(now_utc()).map_err(|err| StoreError::Backend(err.to_string()))
}

fn timestamp_now() -> Result<String> {
    format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))
}

#[cfg(test)]
fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}
