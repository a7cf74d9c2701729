use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A participant in a game session. Position in the session's participant
/// sequence defines the turn order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub admin: bool,
}

/// One normalized line segment in the unit square. Relayed verbatim to
/// non-active participants, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

/// The phase a session is in. Wire values are fixed; the client renders
/// differently per phase and must never see an unrecognized one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Waiting,
    Draw,
    Write,
}

impl Phase {
    /// The alternation policy: every accepted submit flips draw and write.
    pub fn toggled(self) -> Phase {
        match self {
            Phase::Draw => Phase::Write,
            Phase::Write => Phase::Draw,
            Phase::Waiting => Phase::Waiting,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Phase::Draw | Phase::Write)
    }
}

/// Messages sent from clients to the server via WebSocket.
///
/// Every session-scoped message carries the game identifier explicitly; the
/// server checks it against the session the connection actually joined.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    Join { game_id: String, name: String },
    StartGame { game_id: String },
    Answer { game_id: String, content: String },
    Draw { game_id: String, points: Stroke },
}

/// Messages sent from the server to clients via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Admission ack carrying the participant id the client will later see
    /// echoed in `next_player`.
    Welcome {
        participant_id: String,
        game_id: String,
    },
    /// Tells the recipient it holds the admin role.
    Admin,
    /// Full membership snapshot, participant id -> display name.
    PlayersUpdate {
        players: HashMap<String, String>,
    },
    GameStart,
    GameEnd,
    /// Identifies the current active participant.
    NextPlayer {
        participant_id: String,
    },
    /// Round payload. `content` is present only on the copy routed to the
    /// active participant; everyone else gets the phase alone.
    NextStep {
        state: Phase,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    /// Stroke relay, forwarded verbatim to non-active participants.
    Draw {
        points: Stroke,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_use_contract_names() {
        let msg: ClientMsg =
            serde_json::from_str(r#"{"type":"join","game_id":"xk3f9","name":"ada"}"#).unwrap();
        assert!(matches!(msg, ClientMsg::Join { .. }));

        let msg: ClientMsg = serde_json::from_str(
            r#"{"type":"draw","game_id":"xk3f9","points":{"x0":0.1,"y0":0.2,"x1":0.3,"y1":0.4}}"#,
        )
        .unwrap();
        let ClientMsg::Draw { points, .. } = msg else {
            panic!("expected draw");
        };
        assert_eq!(points.x0, 0.1);
        assert_eq!(points.y1, 0.4);
    }

    #[test]
    fn phase_wire_values_are_fixed() {
        assert_eq!(serde_json::to_string(&Phase::Waiting).unwrap(), "\"WAITING\"");
        assert_eq!(serde_json::to_string(&Phase::Draw).unwrap(), "\"DRAW\"");
        assert_eq!(serde_json::to_string(&Phase::Write).unwrap(), "\"WRITE\"");
    }

    #[test]
    fn phase_toggles_between_draw_and_write() {
        assert_eq!(Phase::Draw.toggled(), Phase::Write);
        assert_eq!(Phase::Write.toggled(), Phase::Draw);
        assert!(!Phase::Waiting.toggled().is_active());
    }

    #[test]
    fn stroke_relay_payload_is_unchanged() {
        let original = r#"{"x0":0.1,"y0":0.2,"x1":0.3,"y1":0.4}"#;
        let stroke: Stroke = serde_json::from_str(original).unwrap();
        assert_eq!(serde_json::to_string(&stroke).unwrap(), original);
    }

    #[test]
    fn next_step_omits_absent_content() {
        let msg = ServerMsg::NextStep {
            state: Phase::Write,
            content: None,
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"next_step","state":"WRITE"}"#
        );
    }
}
