use tokio::sync::broadcast;

use crate::types::ServerMsg;

/// The subset of a session's connections a message is routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    All,
    AllExcept(String),
    ActiveOnly,
    NonActiveOnly,
}

/// A routing decision, resolved against the session's active participant at
/// the moment `Router::send` was called. Each connection's forwarder task
/// filters these against its own participant id.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    SendTo { participant_id: String, msg: ServerMsg },
    Broadcast { msg: ServerMsg },
    BroadcastExcept { exclude: String, msg: ServerMsg },
}

impl SessionEvent {
    /// The message this event carries for the given recipient, if any.
    pub fn for_recipient(&self, participant_id: &str) -> Option<&ServerMsg> {
        match self {
            SessionEvent::SendTo { participant_id: target, msg } => {
                (target == participant_id).then_some(msg)
            }
            SessionEvent::Broadcast { msg } => Some(msg),
            SessionEvent::BroadcastExcept { exclude, msg } => {
                (exclude != participant_id).then_some(msg)
            }
        }
    }
}

/// Fan-out for one session. Delivery rides a broadcast channel: each
/// subscriber sees events in send order (per-recipient FIFO), and a
/// subscriber that falls behind loses the oldest events rather than
/// blocking the session.
#[derive(Clone)]
pub struct Router {
    tx: broadcast::Sender<SessionEvent>,
}

impl Router {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Delivery to a single named recipient.
    pub fn send_to(&self, participant_id: &str, msg: ServerMsg) {
        let _ = self.tx.send(SessionEvent::SendTo {
            participant_id: participant_id.to_string(),
            msg,
        });
    }

    /// Resolves `audience` against the current active participant and emits
    /// the event. Never touches game state; a send with no subscribers is
    /// silently dropped, matching disconnect semantics.
    pub fn send(&self, audience: Audience, active: Option<&str>, msg: ServerMsg) {
        let event = match audience {
            Audience::All => SessionEvent::Broadcast { msg },
            Audience::AllExcept(exclude) => SessionEvent::BroadcastExcept { exclude, msg },
            Audience::ActiveOnly => match active {
                Some(id) => SessionEvent::SendTo {
                    participant_id: id.to_string(),
                    msg,
                },
                None => return,
            },
            Audience::NonActiveOnly => match active {
                Some(id) => SessionEvent::BroadcastExcept {
                    exclude: id.to_string(),
                    msg,
                },
                // No active participant means nobody is excluded.
                None => SessionEvent::Broadcast { msg },
            },
        };
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Phase;

    fn msg() -> ServerMsg {
        ServerMsg::NextStep {
            state: Phase::Draw,
            content: None,
        }
    }

    #[tokio::test]
    async fn active_only_reaches_exactly_the_active_participant() {
        let router = Router::new(16);
        let mut rx = router.subscribe();

        router.send(Audience::ActiveOnly, Some("a"), msg());

        let event = rx.recv().await.unwrap();
        assert!(event.for_recipient("a").is_some());
        assert!(event.for_recipient("b").is_none());
    }

    #[tokio::test]
    async fn non_active_only_excludes_the_active_participant() {
        let router = Router::new(16);
        let mut rx = router.subscribe();

        router.send(Audience::NonActiveOnly, Some("a"), msg());

        let event = rx.recv().await.unwrap();
        assert!(event.for_recipient("a").is_none());
        assert!(event.for_recipient("b").is_some());
        assert!(event.for_recipient("c").is_some());
    }

    #[tokio::test]
    async fn active_only_without_an_active_participant_is_dropped() {
        let router = Router::new(16);
        let mut rx = router.subscribe();

        router.send(Audience::ActiveOnly, None, msg());
        router.send(Audience::All, None, msg());

        // Only the broadcast arrives.
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::Broadcast { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_recipient_order_matches_send_order() {
        let router = Router::new(64);
        let mut rx = router.subscribe();

        for i in 0..10 {
            router.send(
                Audience::AllExcept("artist".to_string()),
                None,
                ServerMsg::Draw {
                    points: crate::types::Stroke {
                        x0: i as f64,
                        y0: 0.0,
                        x1: 0.0,
                        y1: 0.0,
                    },
                },
            );
        }

        for i in 0..10 {
            let event = rx.recv().await.unwrap();
            let Some(ServerMsg::Draw { points }) = event.for_recipient("viewer") else {
                panic!("expected a draw relay");
            };
            assert_eq!(points.x0, i as f64);
        }
    }
}
