//! Buzz Points progression: the level curve, the award policy and the store
//! abstraction the policy writes through.
//!
//! Everything in this crate is free of I/O. Persistence lives behind [`XpStore`];
//! the `SQLite` adapter in `hyve-xp-store-sqlite` is the reference implementation.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

pub const DEFAULT_LEVEL_BASE: u64 = 100;
pub const DEFAULT_LEVEL_INCREMENT: u64 = 25;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum XpError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("profile not found for user {user_id}")]
    NotFound { user_id: UserId },
    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AwardError {
    #[error("award amount MUST be >= 1")]
    InvalidAmount,
    #[error("user {0} cannot connect with themselves")]
    SelfConnection(UserId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("connection award left {failed_user} uncredited: {source}")]
    PartialConnection {
        credited: Box<Award>,
        failed_user: UserId,
        source: StoreError,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Parses a user identifier, trimming surrounding whitespace.
    ///
    /// # Errors
    /// Returns [`XpError::Validation`] when the identifier is empty.
    pub fn parse(raw: &str) -> Result<Self, XpError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(XpError::Validation(
                "user_id MUST be a non-empty string".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Parses an event identifier, trimming surrounding whitespace.
    ///
    /// # Errors
    /// Returns [`XpError::Validation`] when the identifier is empty.
    pub fn parse(raw: &str) -> Result<Self, XpError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(XpError::Validation(
                "event_id MUST be a non-empty string".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Level progression derived from an XP total. Never stored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LevelInfo {
    pub level: u64,
    pub total_xp: u64,
    pub current_level_floor: u64,
    pub next_level_floor: u64,
    pub xp_into_level: u64,
    pub xp_to_next: u64,
    pub progress: f64,
}

/// Arithmetic-progression level curve: going from level `n` to `n + 1`
/// costs `base + increment * n`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct LevelCurve {
    pub base: u64,
    pub increment: u64,
}

impl Default for LevelCurve {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL_BASE, DEFAULT_LEVEL_INCREMENT)
    }
}

impl LevelCurve {
    #[must_use]
    pub const fn new(base: u64, increment: u64) -> Self {
        Self { base, increment }
    }

    /// XP needed to go from `level` to `level + 1`.
    #[must_use]
    pub fn band_for_level(&self, level: u64) -> u64 {
        self.base
            .saturating_add(self.increment.saturating_mul(level))
    }

    /// Cumulative XP at which `level` begins.
    #[must_use]
    pub fn floor_for_level(&self, level: u64) -> u64 {
        u64::try_from(self.floor_wide(u128::from(level))).unwrap_or(u64::MAX)
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn level_for(&self, total_xp: u64) -> LevelInfo {
        let level = self.highest_level_within(total_xp);
        let current_level_floor = self.floor_for_level(level);
        let xp_to_next = self.band_for_level(level);
        let xp_into_level = total_xp.saturating_sub(current_level_floor);

        let progress = if xp_to_next == 0 {
            1.0
        } else {
            (xp_into_level as f64 / xp_to_next as f64).clamp(0.0, 1.0)
        };

        LevelInfo {
            level,
            total_xp,
            current_level_floor,
            next_level_floor: current_level_floor.saturating_add(xp_to_next),
            xp_into_level,
            xp_to_next,
            progress,
        }
    }

    // n * base + increment * n(n-1)/2, saturating.
    fn floor_wide(&self, level: u128) -> u128 {
        let triangular = level.saturating_mul(level.saturating_sub(1)) / 2;
        level
            .saturating_mul(u128::from(self.base))
            .saturating_add(triangular.saturating_mul(u128::from(self.increment)))
    }

    /// Largest level whose floor is covered by `total_xp`.
    fn highest_level_within(&self, total_xp: u64) -> u64 {
        if self.base == 0 && self.increment == 0 {
            return 0;
        }

        let target = u128::from(total_xp);
        let mut covered: u128 = 0;
        // floor(uncovered) > total_xp holds for both bounds below.
        let mut uncovered: u128 = if self.base > 0 {
            target / u128::from(self.base) + 1
        } else {
            1 << 33
        };

        while uncovered - covered > 1 {
            let mid = covered + (uncovered - covered) / 2;
            if self.floor_wide(mid) <= target {
                covered = mid;
            } else {
                uncovered = mid;
            }
        }

        u64::try_from(covered).unwrap_or(u64::MAX)
    }
}

/// Normalizes an untrusted XP value: non-finite and negative values become
/// zero, fractions are floored and oversized values saturate.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn sanitize_xp(raw: f64) -> u64 {
    if !raw.is_finite() || raw <= 0.0 {
        return 0;
    }
    if raw >= u64::MAX as f64 {
        return u64::MAX;
    }
    raw.floor() as u64
}

/// Level info for an arbitrary numeric XP value on the default curve.
#[must_use]
pub fn compute_level(raw_total_xp: f64) -> LevelInfo {
    LevelCurve::default().level_for(sanitize_xp(raw_total_xp))
}

#[must_use]
pub fn compute_level_with(raw_total_xp: f64, base: u64, increment: u64) -> LevelInfo {
    LevelCurve::new(base, increment).level_for(sanitize_xp(raw_total_xp))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AwardKind {
    HostedEvent,
    EventCheckIn,
    ConnectionAccepted,
}

impl AwardKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HostedEvent => "hosted_event",
            Self::EventCheckIn => "event_check_in",
            Self::ConnectionAccepted => "connection_accepted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hosted_event" => Some(Self::HostedEvent),
            "event_check_in" => Some(Self::EventCheckIn),
            "connection_accepted" => Some(Self::ConnectionAccepted),
            _ => None,
        }
    }
}

impl Display for AwardKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct XpPolicy {
    pub policy_version: u32,
    pub signup_bonus: u64,
    pub hosted_event_award: u64,
    pub event_check_in_award: u64,
    pub connection_award: u64,
    pub level_base: u64,
    pub level_increment: u64,
    pub connection_retry_attempts: u8,
}

impl Default for XpPolicy {
    fn default() -> Self {
        Self::v1()
    }
}

impl XpPolicy {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            policy_version: 1,
            signup_bonus: 50,
            hosted_event_award: 50,
            event_check_in_award: 25,
            connection_award: 10,
            level_base: DEFAULT_LEVEL_BASE,
            level_increment: DEFAULT_LEVEL_INCREMENT,
            connection_retry_attempts: 1,
        }
    }

    /// Validates award amounts and curve parameters.
    ///
    /// # Errors
    /// Returns [`XpError::Configuration`] when the version is zero, an award
    /// amount is zero, or the curve has no growth at all.
    pub fn validate(&self) -> Result<(), XpError> {
        if self.policy_version == 0 {
            return Err(XpError::Configuration(
                "policy_version MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("hosted_event_award", self.hosted_event_award),
            ("event_check_in_award", self.event_check_in_award),
            ("connection_award", self.connection_award),
        ] {
            if value == 0 {
                return Err(XpError::Configuration(format!("{name} MUST be >= 1")));
            }
        }

        if self.level_base == 0 && self.level_increment == 0 {
            return Err(XpError::Configuration(
                "level_base and level_increment cannot both be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a policy from JSON.
    ///
    /// # Errors
    /// Returns [`XpError::Configuration`] when decoding fails or the decoded
    /// policy is invalid.
    pub fn from_json(value: &Value) -> Result<Self, XpError> {
        let policy: Self = serde_json::from_value(value.clone()).map_err(|err| {
            XpError::Configuration(format!("invalid policy JSON payload: {err}"))
        })?;
        policy.validate()?;
        Ok(policy)
    }

    #[must_use]
    pub fn amount_for(&self, kind: AwardKind) -> u64 {
        match kind {
            AwardKind::HostedEvent => self.hosted_event_award,
            AwardKind::EventCheckIn => self.event_check_in_award,
            AwardKind::ConnectionAccepted => self.connection_award,
        }
    }

    #[must_use]
    pub fn curve(&self) -> LevelCurve {
        LevelCurve::new(self.level_base, self.level_increment)
    }
}

/// Read/write access to per-user XP totals.
///
/// `increment_xp` defaults to a read-then-write, which can lose an update when
/// two writers interleave. Stores with an atomic increment should override it.
pub trait XpStore {
    /// # Errors
    /// Returns [`StoreError::NotFound`] when the user has no profile.
    fn read_xp(&self, user_id: &UserId) -> Result<u64, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the total cannot be persisted.
    fn write_xp(&mut self, user_id: &UserId, new_xp: u64) -> Result<(), StoreError>;

    /// Adds `amount` and returns the new total.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the read or the write fails, and
    /// [`StoreError::Backend`] when the new total would overflow.
    fn increment_xp(&mut self, user_id: &UserId, amount: u64) -> Result<u64, StoreError> {
        let current = self.read_xp(user_id)?;
        let new_xp = current
            .checked_add(amount)
            .ok_or_else(|| xp_overflow(user_id, current, amount))?;
        tracing::debug!(user_id = %user_id, current, new_xp, "read-then-write xp increment");
        self.write_xp(user_id, new_xp)?;
        Ok(new_xp)
    }
}

/// Error for an increment that would push a total past what the store holds.
#[must_use]
pub fn xp_overflow(user_id: &UserId, current: u64, amount: u64) -> StoreError {
    StoreError::Backend(format!(
        "xp overflow for {user_id}: {current} + {amount} exceeds storage range"
    ))
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryXpStore {
    totals: BTreeMap<UserId, u64>,
}

impl InMemoryXpStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a profile at `signup_bonus`. Returns `false` if it already existed.
    pub fn provision(&mut self, user_id: &UserId, signup_bonus: u64) -> bool {
        if self.totals.contains_key(user_id) {
            return false;
        }
        self.totals.insert(user_id.clone(), signup_bonus);
        true
    }
}

impl XpStore for InMemoryXpStore {
    fn read_xp(&self, user_id: &UserId) -> Result<u64, StoreError> {
        self.totals
            .get(user_id)
            .copied()
            .ok_or_else(|| StoreError::NotFound {
                user_id: user_id.clone(),
            })
    }

    fn write_xp(&mut self, user_id: &UserId, new_xp: u64) -> Result<(), StoreError> {
        match self.totals.get_mut(user_id) {
            Some(total) if new_xp < *total => Err(StoreError::Backend(format!(
                "xp for {user_id} never decreases ({total} -> {new_xp})"
            ))),
            Some(total) => {
                *total = new_xp;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                user_id: user_id.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Award {
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<AwardKind>,
    pub amount: u64,
    pub previous_xp: u64,
    pub new_xp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConnectionAward {
    pub accepter: Award,
    pub requester: Award,
}

/// Adds `amount` to a user's total with no trigger attached.
///
/// # Errors
/// Returns [`AwardError::InvalidAmount`] for a zero amount and
/// [`AwardError::Store`] when the store rejects the update.
pub fn award_xp<S: XpStore + ?Sized>(
    store: &mut S,
    user_id: &UserId,
    amount: u64,
) -> Result<Award, AwardError> {
    apply_award(store, user_id, None, amount)
}

/// Credits the host of a newly created event.
///
/// # Errors
/// Returns [`AwardError::Store`] when the store rejects the update.
pub fn award_for_hosting<S: XpStore + ?Sized>(
    store: &mut S,
    policy: &XpPolicy,
    host: &UserId,
) -> Result<Award, AwardError> {
    let kind = AwardKind::HostedEvent;
    apply_award(store, host, Some(kind), policy.amount_for(kind))
}

/// Credits a first check-in. The caller guarantees this runs at most once per
/// user per event.
///
/// # Errors
/// Returns [`AwardError::Store`] when the store rejects the update.
pub fn award_for_attendance<S: XpStore + ?Sized>(
    store: &mut S,
    policy: &XpPolicy,
    attendee: &UserId,
) -> Result<Award, AwardError> {
    let kind = AwardKind::EventCheckIn;
    apply_award(store, attendee, Some(kind), policy.amount_for(kind))
}

/// Credits both sides of an accepted connection request.
///
/// The two increments are separate store operations. When the requester's
/// half fails after the accepter was credited, it is retried up to
/// `policy.connection_retry_attempts` times on backend errors.
///
/// # Errors
/// Returns [`AwardError::SelfConnection`] when both ids match,
/// [`AwardError::Store`] when nobody was credited, and
/// [`AwardError::PartialConnection`] when only the accepter was credited.
pub fn award_for_connection<S: XpStore + ?Sized>(
    store: &mut S,
    policy: &XpPolicy,
    accepter: &UserId,
    requester: &UserId,
) -> Result<ConnectionAward, AwardError> {
    if accepter == requester {
        return Err(AwardError::SelfConnection(accepter.clone()));
    }

    let kind = AwardKind::ConnectionAccepted;
    let amount = policy.amount_for(kind);
    let accepter_award = apply_award(store, accepter, Some(kind), amount)?;

    let mut retries_left = policy.connection_retry_attempts;
    loop {
        match apply_award(store, requester, Some(kind), amount) {
            Ok(requester_award) => {
                return Ok(ConnectionAward {
                    accepter: accepter_award,
                    requester: requester_award,
                });
            }
            Err(AwardError::Store(StoreError::Backend(reason))) if retries_left > 0 => {
                retries_left -= 1;
                tracing::debug!(
                    requester = %requester,
                    retries_left,
                    reason = %reason,
                    "retrying requester half of connection award"
                );
            }
            Err(AwardError::Store(source)) => {
                tracing::warn!(
                    accepter = %accepter,
                    requester = %requester,
                    error = %source,
                    "connection award left asymmetric"
                );
                return Err(AwardError::PartialConnection {
                    credited: Box::new(accepter_award),
                    failed_user: requester.clone(),
                    source,
                });
            }
            Err(other) => return Err(other),
        }
    }
}

fn apply_award<S: XpStore + ?Sized>(
    store: &mut S,
    user_id: &UserId,
    kind: Option<AwardKind>,
    amount: u64,
) -> Result<Award, AwardError> {
    if amount == 0 {
        return Err(AwardError::InvalidAmount);
    }

    match store.increment_xp(user_id, amount) {
        Ok(new_xp) => {
            tracing::info!(
                user_id = %user_id,
                kind = kind.map_or("manual", AwardKind::as_str),
                amount,
                new_xp,
                "xp awarded"
            );
            Ok(Award {
                user_id: user_id.clone(),
                kind,
                amount,
                previous_xp: new_xp.saturating_sub(amount),
                new_xp,
            })
        }
        Err(err) => {
            tracing::warn!(user_id = %user_id, amount, error = %err, "xp award failed");
            Err(err.into())
        }
    }
}

/// The acting user for a run of operations, with an explicit begin/end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    user_id: UserId,
    started_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub user_id: UserId,
    pub started_at: OffsetDateTime,
    pub ended_at: OffsetDateTime,
}

impl Session {
    #[must_use]
    pub fn begin(user_id: UserId) -> Self {
        Self::begin_at(user_id, now_utc())
    }

    #[must_use]
    pub fn begin_at(user_id: UserId, started_at: OffsetDateTime) -> Self {
        tracing::debug!(user_id = %user_id, "session started");
        Self {
            user_id,
            started_at: started_at.to_offset(UtcOffset::UTC),
        }
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    #[must_use]
    pub fn end(self) -> SessionSummary {
        let ended_at = now_utc().max(self.started_at);
        tracing::debug!(user_id = %self.user_id, "session ended");
        SessionSummary {
            user_id: self.user_id,
            started_at: self.started_at,
            ended_at,
        }
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`XpError::Validation`] when parsing fails or the timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, XpError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| XpError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(XpError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`XpError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, XpError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| XpError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn user(raw: &str) -> UserId {
        must_ok(UserId::parse(raw))
    }

    fn provisioned_store(users: &[&str]) -> InMemoryXpStore {
        let mut store = InMemoryXpStore::new();
        for raw in users {
            store.provision(&user(raw), XpPolicy::v1().signup_bonus);
        }
        store
    }

    // Walks the curve one band at a time.
    fn naive_level(total_xp: u64, base: u64, increment: u64) -> (u64, u64) {
        let mut level = 0;
        let mut cumulative = 0;
        let mut band = base;
        while band > 0 && total_xp >= cumulative + band {
            cumulative += band;
            level += 1;
            band = base + increment * level;
        }
        (level, cumulative)
    }

    /// Store whose increments fail a fixed number of times for one user.
    struct FlakyStore {
        inner: InMemoryXpStore,
        flaky_user: UserId,
        failures_left: u32,
    }

    impl XpStore for FlakyStore {
        fn read_xp(&self, user_id: &UserId) -> Result<u64, StoreError> {
            self.inner.read_xp(user_id)
        }

        fn write_xp(&mut self, user_id: &UserId, new_xp: u64) -> Result<(), StoreError> {
            if *user_id == self.flaky_user && self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(StoreError::Backend("connection reset".to_string()));
            }
            self.inner.write_xp(user_id, new_xp)
        }
    }

    #[test]
    fn zero_xp_is_level_zero() {
        let info = compute_level(0.0);
        assert_eq!(info.level, 0);
        assert_eq!(info.xp_into_level, 0);
        assert_eq!(info.xp_to_next, 100);
        assert_eq!(info.current_level_floor, 0);
        assert_eq!(info.next_level_floor, 100);
        assert_eq!(info.progress, 0.0);
    }

    #[test]
    fn just_below_first_threshold() {
        let info = compute_level(99.0);
        assert_eq!(info.level, 0);
        assert_eq!(info.xp_into_level, 99);
        assert_eq!(info.xp_to_next, 100);
        assert!((info.progress - 0.99).abs() < 1e-9);
    }

    #[test]
    fn exact_threshold_starts_next_level() {
        let info = compute_level(100.0);
        assert_eq!(info.level, 1);
        assert_eq!(info.xp_into_level, 0);
        assert_eq!(info.xp_to_next, 125);
        assert_eq!(info.current_level_floor, 100);
        assert_eq!(info.next_level_floor, 225);
        assert_eq!(info.progress, 0.0);
    }

    #[test]
    fn second_band_is_base_plus_increment() {
        let info = compute_level(224.0);
        assert_eq!(info.level, 1);
        assert_eq!(info.xp_into_level, 124);
        assert_eq!(info.xp_to_next, 125);
        assert!((info.progress - 0.992).abs() < 1e-9);

        let info = compute_level(225.0);
        assert_eq!(info.level, 2);
        assert_eq!(info.xp_into_level, 0);
        assert_eq!(info.xp_to_next, 150);
    }

    #[test]
    fn invalid_inputs_are_normalized_to_zero() {
        for raw in [-5.0, f64::NAN, f64::NEG_INFINITY, f64::INFINITY, -0.0] {
            let info = compute_level(raw);
            assert_eq!(info.level, 0);
            assert_eq!(info.total_xp, 0);
        }
        assert_eq!(compute_level(150.9).total_xp, 150);
        assert_eq!(sanitize_xp(1e30), u64::MAX);
    }

    #[test]
    fn custom_curve_parameters_are_honoured() {
        let info = compute_level_with(30.0, 10, 0);
        assert_eq!(info.level, 3);
        assert_eq!(info.xp_to_next, 10);

        let info = compute_level_with(0.0, 0, 10);
        assert_eq!(info.level, 1);
        assert_eq!(info.xp_to_next, 10);
    }

    #[test]
    fn flat_curve_reports_full_progress() {
        let info = compute_level_with(500.0, 0, 0);
        assert_eq!(info.level, 0);
        assert_eq!(info.xp_to_next, 0);
        assert_eq!(info.progress, 1.0);
    }

    #[test]
    fn huge_totals_do_not_overflow() {
        let info = LevelCurve::default().level_for(u64::MAX);
        assert!(info.level > 0);
        assert!((0.0..=1.0).contains(&info.progress));
        assert_eq!(LevelCurve::default().floor_for_level(u64::MAX), u64::MAX);
    }

    #[test]
    fn floors_match_cumulative_bands() {
        let curve = LevelCurve::default();
        assert_eq!(curve.floor_for_level(0), 0);
        assert_eq!(curve.floor_for_level(1), 100);
        assert_eq!(curve.floor_for_level(2), 225);
        assert_eq!(curve.floor_for_level(3), 375);
        assert_eq!(curve.band_for_level(3), 175);
    }

    #[test]
    fn policy_v1_is_valid_and_round_trips_json() {
        let policy = XpPolicy::v1();
        must_ok(policy.validate());
        let decoded = must_ok(XpPolicy::from_json(&must_ok(serde_json::to_value(&policy))));
        assert_eq!(decoded, policy);
        assert_eq!(policy.curve(), LevelCurve::default());
    }

    #[test]
    fn policy_rejects_zero_awards_and_flat_curve() {
        let mut policy = XpPolicy::v1();
        policy.connection_award = 0;
        assert!(matches!(policy.validate(), Err(XpError::Configuration(_))));

        let mut policy = XpPolicy::v1();
        policy.level_base = 0;
        policy.level_increment = 0;
        assert!(policy.validate().is_err());

        let bad = serde_json::json!({ "policy_version": 1 });
        assert!(XpPolicy::from_json(&bad).is_err());
    }

    #[test]
    fn award_kind_strings_are_stable() {
        for kind in [
            AwardKind::HostedEvent,
            AwardKind::EventCheckIn,
            AwardKind::ConnectionAccepted,
        ] {
            assert_eq!(AwardKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(AwardKind::parse("signup"), None);
    }

    #[test]
    fn ids_reject_blank_values() {
        assert!(UserId::parse("   ").is_err());
        assert!(EventId::parse("").is_err());
        assert_eq!(user("  u-1 ").as_str(), "u-1");
    }

    #[test]
    fn hosting_award_levels_up_signup_profile() {
        let mut store = provisioned_store(&["host"]);
        let award = must_ok(award_for_hosting(&mut store, &XpPolicy::v1(), &user("host")));
        assert_eq!(award.previous_xp, 50);
        assert_eq!(award.new_xp, 100);
        assert_eq!(award.kind, Some(AwardKind::HostedEvent));
        assert_eq!(compute_level(100.0).level, 1);
    }

    #[test]
    fn attendance_award_adds_twenty_five() {
        let mut store = provisioned_store(&["guest"]);
        let award = must_ok(award_for_attendance(
            &mut store,
            &XpPolicy::v1(),
            &user("guest"),
        ));
        assert_eq!(award.new_xp, 75);
        assert_eq!(must_ok(store.read_xp(&user("guest"))), 75);
    }

    #[test]
    fn award_to_missing_profile_fails_without_creating_it() {
        let mut store = InMemoryXpStore::new();
        let result = award_xp(&mut store, &user("ghost"), 10);
        assert!(matches!(
            result,
            Err(AwardError::Store(StoreError::NotFound { .. }))
        ));
        assert!(store.read_xp(&user("ghost")).is_err());
    }

    #[test]
    fn zero_amount_is_rejected() {
        let mut store = provisioned_store(&["a"]);
        assert_eq!(
            award_xp(&mut store, &user("a"), 0),
            Err(AwardError::InvalidAmount)
        );
    }

    #[test]
    fn overflowing_award_fails_and_keeps_total() {
        let mut store = provisioned_store(&["a"]);
        let near_max = u64::MAX - 10;
        must_ok(store.write_xp(&user("a"), near_max));

        let result = award_xp(&mut store, &user("a"), 50);
        match result {
            Err(AwardError::Store(StoreError::Backend(reason))) => {
                assert!(reason.contains("overflow"), "reason={reason}");
            }
            other => panic!("expected overflow error, got {other:?}"),
        }
        assert_eq!(must_ok(store.read_xp(&user("a"))), near_max);

        let award = must_ok(award_xp(&mut store, &user("a"), 10));
        assert_eq!(award.previous_xp, near_max);
        assert_eq!(award.new_xp, u64::MAX);
    }

    #[test]
    fn in_memory_totals_never_decrease() {
        let mut store = provisioned_store(&["a"]);
        assert!(matches!(
            store.write_xp(&user("a"), 10),
            Err(StoreError::Backend(_))
        ));
        assert_eq!(must_ok(store.read_xp(&user("a"))), 50);
        must_ok(store.write_xp(&user("a"), 50));
        must_ok(store.write_xp(&user("a"), 60));
        assert_eq!(must_ok(store.read_xp(&user("a"))), 60);
    }

    #[test]
    fn connection_award_credits_both_parties_once() {
        let mut store = provisioned_store(&["alice", "bob"]);
        let policy = XpPolicy::v1();

        for round in 1..=2_u64 {
            let award = must_ok(award_for_connection(
                &mut store,
                &policy,
                &user("alice"),
                &user("bob"),
            ));
            assert_eq!(award.accepter.new_xp, 50 + 10 * round);
            assert_eq!(award.requester.new_xp, 50 + 10 * round);
        }
    }

    #[test]
    fn self_connection_is_rejected() {
        let mut store = provisioned_store(&["alice"]);
        let result = award_for_connection(&mut store, &XpPolicy::v1(), &user("alice"), &user("alice"));
        assert!(matches!(result, Err(AwardError::SelfConnection(_))));
        assert_eq!(must_ok(store.read_xp(&user("alice"))), 50);
    }

    #[test]
    fn connection_award_retries_failed_half() {
        let mut store = FlakyStore {
            inner: provisioned_store(&["alice", "bob"]),
            flaky_user: user("bob"),
            failures_left: 1,
        };
        let award = must_ok(award_for_connection(
            &mut store,
            &XpPolicy::v1(),
            &user("alice"),
            &user("bob"),
        ));
        assert_eq!(award.requester.new_xp, 60);
        assert_eq!(must_ok(store.read_xp(&user("alice"))), 60);
    }

    #[test]
    fn connection_award_surfaces_partial_success() {
        let mut store = FlakyStore {
            inner: provisioned_store(&["alice", "bob"]),
            flaky_user: user("bob"),
            failures_left: 5,
        };
        let result = award_for_connection(&mut store, &XpPolicy::v1(), &user("alice"), &user("bob"));
        match result {
            Err(AwardError::PartialConnection {
                credited,
                failed_user,
                ..
            }) => {
                assert_eq!(credited.user_id, user("alice"));
                assert_eq!(failed_user, user("bob"));
            }
            other => panic!("expected partial connection award, got {other:?}"),
        }
        assert_eq!(must_ok(store.read_xp(&user("alice"))), 60);
        assert_eq!(must_ok(store.read_xp(&user("bob"))), 50);
    }

    #[test]
    fn connection_award_fails_cleanly_when_accepter_missing() {
        let mut store = provisioned_store(&["bob"]);
        let result = award_for_connection(&mut store, &XpPolicy::v1(), &user("alice"), &user("bob"));
        assert!(matches!(result, Err(AwardError::Store(_))));
        assert_eq!(must_ok(store.read_xp(&user("bob"))), 50);
    }

    #[test]
    fn provisioning_is_idempotent() {
        let mut store = InMemoryXpStore::new();
        assert!(store.provision(&user("a"), 50));
        must_ok(award_xp(&mut store, &user("a"), 5));
        assert!(!store.provision(&user("a"), 50));
        assert_eq!(must_ok(store.read_xp(&user("a"))), 55);
    }

    #[test]
    fn session_lifecycle_is_explicit() {
        let started = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        let session = Session::begin_at(user("host"), started);
        assert_eq!(session.user_id().as_str(), "host");
        assert_eq!(session.started_at(), started);

        let summary = session.end();
        assert_eq!(summary.user_id, user("host"));
        assert!(summary.ended_at >= summary.started_at);
    }

    #[test]
    fn non_utc_timestamps_are_rejected() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        let parsed = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        assert_eq!(must_ok(format_rfc3339(parsed)), "2026-02-07T12:00:00Z");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_total_xp_is_preserved(xp in 0u64..10_000_000) {
            prop_assert_eq!(LevelCurve::default().level_for(xp).total_xp, xp);
        }

        #[test]
        fn prop_floors_bracket_total(xp in 0u64..10_000_000) {
            let info = LevelCurve::default().level_for(xp);
            prop_assert!(info.current_level_floor <= xp);
            prop_assert!(xp < info.next_level_floor);
            prop_assert_eq!(info.xp_into_level, xp - info.current_level_floor);
            prop_assert!((0.0..1.0).contains(&info.progress));
        }

        #[test]
        fn prop_level_is_monotonic(a in 0u64..5_000_000, b in 0u64..5_000_000) {
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            let curve = LevelCurve::default();
            prop_assert!(curve.level_for(low).level <= curve.level_for(high).level);
        }

        #[test]
        fn prop_matches_band_walk(xp in 0u64..200_000, base in 1u64..500, increment in 0u64..100) {
            let info = LevelCurve::new(base, increment).level_for(xp);
            let (level, floor) = naive_level(xp, base, increment);
            prop_assert_eq!(info.level, level);
            prop_assert_eq!(info.current_level_floor, floor);
        }

        #[test]
        fn prop_negative_inputs_are_level_zero(raw in -1.0e12f64..0.0) {
            prop_assert_eq!(compute_level(raw).level, 0);
            prop_assert_eq!(compute_level(raw).total_xp, 0);
        }
    }
}
