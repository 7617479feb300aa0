//! The shared call record and the identifiers it is keyed by.
//!
//! A [`CallRecord`] is the rendezvous document every participant reads and
//! mutates through the signaling store. Its [`CallStatus`] only moves forward;
//! `ended` is absorbing and wins over anything else.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, globally unique call identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new id of the form `call_<millis>_<caller>_<random>`.
    pub fn generate(caller: &UserId) -> Self {
        let mut suffix = [0u8; 4];
        rand::rng().fill_bytes(&mut suffix);
        Self(format!(
            "call_{}_{}_{}",
            Utc::now().timestamp_millis(),
            caller.as_str(),
            hex::encode(suffix)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A user as seen by the call layer: id plus display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
    pub name: String,
}

impl UserRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Voice,
    Video,
}

impl CallType {
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the call this participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Initiator,
    Joiner,
}

/// Shared status of a call record.
///
/// Ordered `ringing < connecting < connected < ended`. Any status may jump to
/// `ended`; nothing leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Connecting,
    Connected,
    Ended,
}

impl CallStatus {
    pub fn rank(self) -> u8 {
        match self {
            Self::Ringing => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Ended => 3,
        }
    }

    pub fn is_ended(self) -> bool {
        matches!(self, Self::Ended)
    }

    /// Whether a record currently in `self` may move to `next`.
    ///
    /// Repeating the current status is not an advance.
    pub fn can_advance_to(self, next: CallStatus) -> bool {
        match (self, next) {
            (Self::Ended, _) => false,
            (_, Self::Ended) => true,
            (current, next) => next.rank() > current.rank(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ended => "ended",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Local user hung up.
    Hangup,
    /// Callee declined the ringing call.
    Declined,
    /// Nobody answered before the ring timer expired.
    RingTimeout,
    /// The other side ended the call or the record disappeared.
    RemoteEnded,
    /// Hard session length reached.
    DurationCap,
    /// Initiator could not obtain capture devices.
    MediaUnavailable,
    /// Session setup failed and was discarded without touching the record.
    SetupFailed,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hangup => "hangup",
            Self::Declined => "declined",
            Self::RingTimeout => "ring_timeout",
            Self::RemoteEnded => "remote_ended",
            Self::DurationCap => "duration_cap",
            Self::MediaUnavailable => "media_unavailable",
            Self::SetupFailed => "setup_failed",
        }
    }

    /// Whether ending locally for this reason must be written to the shared record.
    pub fn propagates(self) -> bool {
        !matches!(self, Self::RemoteEnded | Self::SetupFailed)
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Ringing,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    pub user_name: String,
    pub status: ParticipantStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_at: Option<DateTime<Utc>>,
}

/// Everything the initiator supplies when creating a call.
#[derive(Debug, Clone)]
pub struct CallInit {
    pub room_id: String,
    pub call_type: CallType,
    pub caller: UserRef,
    /// Invitees. The caller is added automatically if missing.
    pub invitees: Vec<UserRef>,
}

/// The shared call document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: CallId,
    pub room_id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub caller_id: UserId,
    pub caller_name: String,
    pub participants: Vec<Participant>,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    pub updated_at: DateTime<Utc>,
}

impl CallRecord {
    /// Build a fresh `ringing` record. The caller starts connected, invitees ringing.
    pub fn new(id: CallId, init: CallInit, now: DateTime<Utc>) -> Self {
        let mut participants = vec![Participant {
            user_id: init.caller.id.clone(),
            user_name: init.caller.name.clone(),
            status: ParticipantStatus::Connected,
            joined_at: Some(now),
            left_at: None,
        }];
        for invitee in init.invitees {
            if participants.iter().any(|p| p.user_id == invitee.id) {
                continue;
            }
            participants.push(Participant {
                user_id: invitee.id,
                user_name: invitee.name,
                status: ParticipantStatus::Ringing,
                joined_at: None,
                left_at: None,
            });
        }

        Self {
            id,
            room_id: init.room_id,
            call_type: init.call_type,
            caller_id: init.caller.id,
            caller_name: init.caller.name,
            participants,
            status: CallStatus::Ringing,
            created_at: now,
            connected_at: None,
            ended_at: None,
            end_reason: None,
            updated_at: now,
        }
    }

    pub fn participant(&self, user: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.user_id == user)
    }

    /// True when `user` is invited to this call and is not the one calling.
    pub fn is_addressed_to(&self, user: &UserId) -> bool {
        &self.caller_id != user && self.participant(user).is_some()
    }

    /// Participants other than `user` who are currently connected.
    pub fn connected_others(&self, user: &UserId) -> usize {
        self.participants
            .iter()
            .filter(|p| &p.user_id != user && p.status == ParticipantStatus::Connected)
            .count()
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }

    /// Merge a partial update into the record.
    ///
    /// Status regressions are ignored, `ended` always wins and freezes the
    /// record. Returns whether anything changed.
    pub fn apply(&mut self, patch: &RecordPatch, now: DateTime<Utc>) -> bool {
        if self.status.is_ended() {
            return false;
        }

        let mut changed = false;

        if let Some(status) = patch.status
            && self.status.can_advance_to(status)
        {
            self.status = status;
            changed = true;
            match status {
                CallStatus::Connected if self.connected_at.is_none() => {
                    self.connected_at = Some(patch.connected_at.unwrap_or(now));
                }
                CallStatus::Ended => {
                    self.ended_at = Some(patch.ended_at.unwrap_or(now));
                    self.end_reason = patch.end_reason;
                }
                _ => {}
            }
        }

        if let Some(update) = &patch.participant {
            changed |= self.upsert_participant(update, now);
        }

        if changed {
            self.updated_at = now;
        }
        changed
    }

    fn upsert_participant(&mut self, update: &ParticipantUpdate, now: DateTime<Utc>) -> bool {
        match self
            .participants
            .iter_mut()
            .find(|p| p.user_id == update.user_id)
        {
            Some(existing) => {
                if existing.status == update.status {
                    return false;
                }
                existing.status = update.status;
                match update.status {
                    ParticipantStatus::Connected => {
                        existing.joined_at.get_or_insert(now);
                        existing.left_at = None;
                    }
                    ParticipantStatus::Disconnected => existing.left_at = Some(now),
                    ParticipantStatus::Ringing => {}
                }
                true
            }
            None => {
                self.participants.push(Participant {
                    user_id: update.user_id.clone(),
                    user_name: update.user_name.clone(),
                    status: update.status,
                    joined_at: (update.status == ParticipantStatus::Connected).then_some(now),
                    left_at: (update.status == ParticipantStatus::Disconnected).then_some(now),
                });
                true
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantUpdate {
    pub user_id: UserId,
    pub user_name: String,
    pub status: ParticipantStatus,
}

/// Partial fields written to an existing record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<ParticipantUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}

impl RecordPatch {
    pub fn status(status: CallStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn ended(reason: EndReason, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(CallStatus::Ended),
            ended_at: Some(at),
            end_reason: Some(reason),
            ..Default::default()
        }
    }

    /// Mark `user` as connected and move the record to `connecting`.
    pub fn joined(user: &UserRef) -> Self {
        Self {
            status: Some(CallStatus::Connecting),
            participant: Some(ParticipantUpdate {
                user_id: user.id.clone(),
                user_name: user.name.clone(),
                status: ParticipantStatus::Connected,
            }),
            ..Default::default()
        }
    }

    /// Mark `user` as gone without touching the call status.
    pub fn left(user: &UserRef) -> Self {
        Self {
            participant: Some(ParticipantUpdate {
                user_id: user.id.clone(),
                user_name: user.name.clone(),
                status: ParticipantStatus::Disconnected,
            }),
            ..Default::default()
        }
    }
}
