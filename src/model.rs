//! Domain records mirrored from the remote store.
//!
//! These types match the store's row shapes. Status enums serialize as
//! `snake_case` strings, timestamps as ISO 8601 via `chrono`. The merge rules
//! that keep these records consistent live in [`crate::reconcile`]; this
//! module only defines the records themselves and the derived-result math.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Type aliases ────────────────────────────────────────────────────

/// Unique identifier for rooms.
pub type RoomId = Uuid;

/// Unique identifier for player membership records.
pub type PlayerId = Uuid;

/// Unique identifier for users.
pub type UserId = Uuid;

/// Unique identifier for game sessions.
pub type SessionId = Uuid;

/// Unique identifier for result rows.
pub type ResultId = Uuid;

/// Balance every player starts a level with. Profit percentages are always
/// computed against this fixed value.
pub const STARTING_BALANCE: f64 = 10_000.0;

// ── Status enums ────────────────────────────────────────────────────

/// Lifecycle status of a room.
///
/// Transitions are monotone along declaration order:
/// `Open → Preparing → InProgress → Completed`. The derived `Ord` is the
/// lattice order used by the anti-regression merge.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    #[default]
    Open,
    Preparing,
    InProgress,
    Completed,
}

/// Status of a player's membership within one room.
///
/// `Completed` and `Left` are absorbing: once a player reaches either, no
/// merge may move the record back to `Joined` or `InGame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    #[default]
    Joined,
    InGame,
    Completed,
    Left,
}

impl PlayerStatus {
    /// Whether this status is absorbing in the merge lattice.
    pub fn is_terminal(self) -> bool {
        matches!(self, PlayerStatus::Completed | PlayerStatus::Left)
    }
}

// ── Records ─────────────────────────────────────────────────────────

/// A player's membership record within one room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub room_id: RoomId,
    pub user_id: UserId,
    #[serde(default)]
    pub status: PlayerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Player {
    /// The status this record is evidence for. A non-null completion
    /// timestamp counts as `Completed` even when the status field has not
    /// caught up to a partial write on the remote side.
    pub fn effective_status(&self) -> PlayerStatus {
        if self.completed_at.is_some() && !self.status.is_terminal() {
            PlayerStatus::Completed
        } else {
            self.status
        }
    }
}

/// A multiplayer room grouping players through a shared game lifecycle.
///
/// Owns its players in insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    #[serde(default)]
    pub status: RoomStatus,
    pub min_players: u8,
    pub max_players: u8,
    #[serde(default)]
    pub all_players_completed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub players: Vec<Player>,
}

impl Room {
    /// Look up a player by id.
    pub fn player(&self, id: PlayerId) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id)
    }

    /// Whether this room counts as terminal for collection membership.
    pub fn is_completed(&self) -> bool {
        self.status == RoomStatus::Completed || self.all_players_completed
    }
}

/// A final trading result for one player session within a room.
///
/// `rank` and `profit_pct` are derived fields: they are recomputed wholesale
/// by [`rank_results`] every time results are reloaded, never merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomResult {
    pub id: ResultId,
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub final_balance: f64,
    #[serde(default)]
    pub rank: u32,
    #[serde(default)]
    pub profit_pct: f64,
}

/// Assign ranks and profit percentages to a freshly fetched result set.
///
/// Rank is by descending final balance; ties keep input order (stable sort).
/// Profit percentage is relative to [`STARTING_BALANCE`].
pub fn rank_results(results: &mut [RoomResult]) {
    let mut order: Vec<(usize, f64)> = results
        .iter()
        .enumerate()
        .map(|(i, r)| (i, r.final_balance))
        .collect();
    order.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    for (position, (index, _)) in order.into_iter().enumerate() {
        if let Some(result) = results.get_mut(index) {
            result.rank = position as u32 + 1;
            result.profit_pct =
                (result.final_balance - STARTING_BALANCE) / STARTING_BALANCE * 100.0;
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn result(balance: f64) -> RoomResult {
        RoomResult {
            id: Uuid::new_v4(),
            room_id: Uuid::nil(),
            session_id: None,
            final_balance: balance,
            rank: 0,
            profit_pct: 0.0,
        }
    }

    #[test]
    fn rank_by_descending_balance() {
        let mut results = vec![result(12_000.0), result(9_000.0), result(15_000.0)];
        rank_results(&mut results);

        assert_eq!(results[0].rank, 2);
        assert_eq!(results[1].rank, 3);
        assert_eq!(results[2].rank, 1);

        assert!((results[0].profit_pct - 20.0).abs() < f64::EPSILON);
        assert!((results[1].profit_pct - (-10.0)).abs() < f64::EPSILON);
        assert!((results[2].profit_pct - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rank_ties_keep_input_order() {
        let mut results = vec![result(11_000.0), result(11_000.0), result(8_000.0)];
        let first_id = results[0].id;
        let second_id = results[1].id;
        rank_results(&mut results);

        let first = results.iter().find(|r| r.id == first_id).unwrap();
        let second = results.iter().find(|r| r.id == second_id).unwrap();
        assert_eq!(first.rank, 1);
        assert_eq!(second.rank, 2);
    }

    #[test]
    fn rank_empty_results_is_noop() {
        let mut results: Vec<RoomResult> = Vec::new();
        rank_results(&mut results);
        assert!(results.is_empty());
    }

    #[test]
    fn completion_timestamp_implies_completed() {
        let player = Player {
            id: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            status: PlayerStatus::Joined,
            session_id: None,
            completed_at: Some(Utc::now()),
        };
        assert_eq!(player.effective_status(), PlayerStatus::Completed);
    }

    #[test]
    fn left_status_is_not_coerced_by_timestamp() {
        let player = Player {
            id: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            status: PlayerStatus::Left,
            session_id: None,
            completed_at: Some(Utc::now()),
        };
        assert_eq!(player.effective_status(), PlayerStatus::Left);
    }

    #[test]
    fn room_status_lattice_order() {
        assert!(RoomStatus::Open < RoomStatus::Preparing);
        assert!(RoomStatus::Preparing < RoomStatus::InProgress);
        assert!(RoomStatus::InProgress < RoomStatus::Completed);
    }

    #[test]
    fn terminal_player_statuses() {
        assert!(PlayerStatus::Completed.is_terminal());
        assert!(PlayerStatus::Left.is_terminal());
        assert!(!PlayerStatus::Joined.is_terminal());
        assert!(!PlayerStatus::InGame.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&PlayerStatus::InGame).unwrap();
        assert_eq!(json, "\"in_game\"");
        let json = serde_json::to_string(&RoomStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
