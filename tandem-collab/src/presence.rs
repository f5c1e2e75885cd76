//! Presence table: who is in a document, where their cursor is, and which
//! color they were given.
//!
//! Owned by exactly one document session; nothing else reads or writes it.
//!
//! ## Architecture
//!
//! ```text
//! Join ──► first free palette color ──► UserSession
//!                                          │
//! UpdateCursor(rev) ──► map forward to head, clamp
//!                                          │
//! commit ──► map_cursors(edit) ────────────┤
//!                                          │
//! sweep(now) ──► evict_idle ──► PresenceDelta::Evicted
//! ```
//!
//! Colors come from a fixed palette and are recycled on leave. When more
//! users are present than the palette has entries, colors repeat; that is a
//! cosmetic degradation and [`PresenceTable::is_palette_exhausted`] reports it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tandem_core::{transform_position, Edit, Revision, UserId};
use thiserror::Error;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Display color for a user's cursor and selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl CursorColor {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// `#rrggbb`
    pub fn hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Eight hues chosen to stay distinguishable on light and dark themes.
pub const DEFAULT_PALETTE: [CursorColor; 8] = [
    CursorColor::rgb(0x42, 0x85, 0xf4),
    CursorColor::rgb(0xea, 0x43, 0x35),
    CursorColor::rgb(0x34, 0xa8, 0x53),
    CursorColor::rgb(0xfb, 0xbc, 0x05),
    CursorColor::rgb(0xab, 0x47, 0xbc),
    CursorColor::rgb(0x00, 0xac, 0xc1),
    CursorColor::rgb(0xff, 0x70, 0x43),
    CursorColor::rgb(0x9e, 0x9d, 0x24),
];

/// Selected range; `anchor` stays put while `head` follows the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

/// Cursor position as a char offset, plus an optional selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub position: usize,
    pub selection: Option<Selection>,
}

impl Cursor {
    pub fn at(position: usize) -> Self {
        Self {
            position,
            selection: None,
        }
    }

    pub fn with_selection(mut self, anchor: usize, head: usize) -> Self {
        self.selection = Some(Selection { anchor, head });
        self
    }

    /// Map every offset through a committed edit.
    pub fn transformed(&self, edit: &Edit, sticky: bool) -> Self {
        Self {
            position: transform_position(self.position, edit, sticky),
            selection: self.selection.map(|s| Selection {
                anchor: transform_position(s.anchor, edit, sticky),
                head: transform_position(s.head, edit, sticky),
            }),
        }
    }

    /// Clamp every offset to a text of `len` chars.
    pub fn clamped(&self, len: usize) -> Self {
        Self {
            position: self.position.min(len),
            selection: self.selection.map(|s| Selection {
                anchor: s.anchor.min(len),
                head: s.head.min(len),
            }),
        }
    }
}

/// One user's presence in one document.
#[derive(Debug, Clone)]
pub struct UserSession {
    pub user: UserId,
    pub color: CursorColor,
    pub cursor: Cursor,
    /// Revision the cursor is expressed against.
    pub revision: Revision,
    pub joined_at: Instant,
    pub last_active: Instant,
}

impl UserSession {
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_active) > timeout
    }

    pub fn presence(&self) -> UserPresence {
        UserPresence {
            user: self.user.clone(),
            color: self.color,
            cursor: self.cursor,
            revision: self.revision,
        }
    }
}

/// Serializable view of a [`UserSession`], handed to other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user: UserId,
    pub color: CursorColor,
    pub cursor: Cursor,
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceKind {
    Joined,
    Moved,
    Left,
    /// Removed by the inactivity sweep.
    Evicted,
}

/// Presence change broadcast to the other participants of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceDelta {
    pub kind: PresenceKind,
    pub user: UserPresence,
}

/// Result of [`PresenceTable::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub color: CursorColor,
    /// The color is shared with another present user.
    pub color_shared: bool,
    /// The user was already present; their session was refreshed.
    pub rejoined: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    #[error("user {0} is not present in this document")]
    UnknownUser(UserId),
}

// ───────────────────────────────────────────────────────────────────
// Presence table
// ───────────────────────────────────────────────────────────────────

/// Per-document map of user → session.
pub struct PresenceTable {
    sessions: HashMap<UserId, UserSession>,
    palette: Vec<CursorColor>,
    idle_timeout: Duration,
}

impl PresenceTable {
    /// An empty `palette` falls back to [`DEFAULT_PALETTE`].
    pub fn new(palette: Vec<CursorColor>, idle_timeout: Duration) -> Self {
        let palette = if palette.is_empty() {
            DEFAULT_PALETTE.to_vec()
        } else {
            palette
        };
        Self {
            sessions: HashMap::new(),
            palette,
            idle_timeout,
        }
    }

    /// Add `user` (or refresh them if already present) and assign a color.
    pub fn join(&mut self, user: UserId, revision: Revision, now: Instant) -> JoinOutcome {
        if let Some(session) = self.sessions.get_mut(&user) {
            session.last_active = now;
            let color = session.color;
            return JoinOutcome {
                color,
                color_shared: self.holders(color) > 1,
                rejoined: true,
            };
        }

        let color = self.pick_color();
        let color_shared = self.holders(color) > 0;
        self.sessions.insert(
            user.clone(),
            UserSession {
                user,
                color,
                cursor: Cursor::default(),
                revision,
                joined_at: now,
                last_active: now,
            },
        );
        JoinOutcome {
            color,
            color_shared,
            rejoined: false,
        }
    }

    /// Remove `user`, freeing their color.
    pub fn leave(&mut self, user: &UserId) -> Option<UserSession> {
        self.sessions.remove(user)
    }

    /// Record a cursor already expressed against `revision` and clamped by
    /// the caller.
    pub fn update_cursor(
        &mut self,
        user: &UserId,
        cursor: Cursor,
        revision: Revision,
        now: Instant,
    ) -> Result<&UserSession, PresenceError> {
        let session = self
            .sessions
            .get_mut(user)
            .ok_or_else(|| PresenceError::UnknownUser(user.clone()))?;
        session.cursor = cursor;
        session.revision = revision;
        session.last_active = now;
        Ok(session)
    }

    /// Mark `user` active. Returns false if they are not present.
    pub fn touch(&mut self, user: &UserId, now: Instant) -> bool {
        match self.sessions.get_mut(user) {
            Some(session) => {
                session.last_active = now;
                true
            }
            None => false,
        }
    }

    /// Shift every cursor through an edit committed at `revision`.
    pub fn map_cursors(&mut self, edit: &Edit, author: &UserId, revision: Revision) {
        for session in self.sessions.values_mut() {
            let sticky = &session.user == author;
            session.cursor = session.cursor.transformed(edit, sticky);
            session.revision = revision;
        }
    }

    /// Remove every user idle for longer than the timeout.
    pub fn evict_idle(&mut self, now: Instant) -> Vec<UserSession> {
        let timeout = self.idle_timeout;
        let stale: Vec<UserId> = self
            .sessions
            .values()
            .filter(|s| s.is_idle(now, timeout))
            .map(|s| s.user.clone())
            .collect();

        let mut evicted: Vec<UserSession> = stale
            .iter()
            .filter_map(|user| self.sessions.remove(user))
            .collect();
        evicted.sort_by(|a, b| a.user.cmp(&b.user));
        evicted
    }

    /// Snapshot of everyone present, ordered by user id.
    pub fn active_users(&self) -> Vec<UserPresence> {
        let mut users: Vec<UserPresence> = self.sessions.values().map(|s| s.presence()).collect();
        users.sort_by(|a, b| a.user.cmp(&b.user));
        users
    }

    pub fn get(&self, user: &UserId) -> Option<&UserSession> {
        self.sessions.get(user)
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.sessions.contains_key(user)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// True when the next join cannot get a color of its own.
    pub fn is_palette_exhausted(&self) -> bool {
        self.palette.iter().all(|c| self.holders(*c) > 0)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// First free palette entry, else the least used one.
    fn pick_color(&self) -> CursorColor {
        self.palette
            .iter()
            .enumerate()
            .min_by_key(|(index, color)| (self.holders(**color), *index))
            .map(|(_, color)| *color)
            .unwrap_or(DEFAULT_PALETTE[0])
    }

    fn holders(&self, color: CursorColor) -> usize {
        self.sessions.values().filter(|s| s.color == color).count()
    }
}
