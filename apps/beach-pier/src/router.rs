use axum::extract::ws::Message;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::{
    envelope::{Envelope, ErrorCode, RelayKind, RelayRoute},
    peer::{ConnectionState, Delivery, PeerConnection},
    registry::{PeerRegistry, RegistryError},
};

/// What the lifecycle loop should do after a frame has been routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Terminate,
}

/// Decodes inbound frames and dispatches them against the registry.
#[derive(Clone)]
pub struct MessageRouter {
    registry: PeerRegistry,
}

impl MessageRouter {
    pub fn new(registry: PeerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn dispatch(&self, peer: &mut PeerConnection, frame: &str) -> Disposition {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(
                    connection_id = %peer.connection_id(),
                    error = %err,
                    "dropping malformed frame"
                );
                counter!("beach_pier_frames_malformed_total", 1, "reason" => err.metric_label());
                return Disposition::Continue;
            }
        };

        match envelope {
            Envelope::Register { from } => self.register(peer, from),
            Envelope::Offer(route) => self.relay(peer, RelayKind::Offer, &route, frame),
            Envelope::Answer(route) => self.relay(peer, RelayKind::Answer, &route, frame),
            Envelope::Candidate(route) => self.relay(peer, RelayKind::Candidate, &route, frame),
            Envelope::UserList { .. } | Envelope::Error { .. } | Envelope::Unrecognized => {
                debug!(
                    connection_id = %peer.connection_id(),
                    "ignoring envelope type peers may not send"
                );
                Disposition::Continue
            }
        }
    }

    fn register(&self, peer: &mut PeerConnection, identity: String) -> Disposition {
        if peer.state() != ConnectionState::Connecting {
            debug!(
                connection_id = %peer.connection_id(),
                identity = ?peer.identity(),
                requested = %identity,
                "ignoring register on an already registered session"
            );
            return Disposition::Continue;
        }

        match self.registry.register(&identity, peer.handle().clone()) {
            Ok(()) => {
                info!(
                    connection_id = %peer.connection_id(),
                    remote_addr = ?peer.remote_addr(),
                    identity = %identity,
                    "peer registered"
                );
                peer.mark_registered(identity);
                self.registry.broadcast_roster();
                Disposition::Continue
            }
            Err(RegistryError::DuplicateIdentity(identity)) => {
                warn!(
                    connection_id = %peer.connection_id(),
                    identity = %identity,
                    "rejecting duplicate registration"
                );
                counter!("beach_pier_registrations_rejected_total", 1);
                peer.handle().deliver_envelope(&Envelope::Error {
                    data: ErrorCode::IdentityInUse,
                });
                Disposition::Terminate
            }
            Err(err) => {
                warn!(connection_id = %peer.connection_id(), error = %err, "registration failed");
                Disposition::Terminate
            }
        }
    }

    fn relay(
        &self,
        peer: &PeerConnection,
        kind: RelayKind,
        route: &RelayRoute,
        frame: &str,
    ) -> Disposition {
        let target = match self.registry.lookup(&route.to) {
            Ok(target) => target,
            Err(_) => {
                debug!(
                    connection_id = %peer.connection_id(),
                    kind = kind.as_str(),
                    target = %route.to,
                    "relay target not registered; dropping"
                );
                counter!("beach_pier_relays_dropped_total", 1, "reason" => "target_not_found");
                return Disposition::Continue;
            }
        };

        match target.deliver(Message::Text(frame.to_owned())) {
            Delivery::Queued => {
                counter!("beach_pier_relays_total", 1, "kind" => kind.as_str());
            }
            Delivery::Full => {
                counter!("beach_pier_relays_dropped_total", 1, "reason" => "queue_full");
            }
            Delivery::Closed => {
                counter!("beach_pier_relays_dropped_total", 1, "reason" => "target_closed");
            }
        }
        Disposition::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use crate::peer::PeerHandle;

    struct TestPeer {
        conn: PeerConnection,
        rx: mpsc::Receiver<Message>,
    }

    impl TestPeer {
        fn new() -> Self {
            let (tx, rx) = mpsc::channel(16);
            let conn = PeerConnection::new(PeerHandle::new(Uuid::new_v4(), tx), None);
            Self { conn, rx }
        }

        fn frames(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(message) = self.rx.try_recv() {
                if let Message::Text(text) = message {
                    out.push(text);
                }
            }
            out
        }
    }

    fn register(router: &MessageRouter, peer: &mut TestPeer, name: &str) -> Disposition {
        let frame = format!(r#"{{"type":"register","from":"{name}"}}"#);
        router.dispatch(&mut peer.conn, &frame)
    }

    #[test]
    fn register_broadcasts_roster() {
        let router = MessageRouter::new(PeerRegistry::new());
        let mut alice = TestPeer::new();
        let mut bob = TestPeer::new();

        assert_eq!(register(&router, &mut alice, "alice"), Disposition::Continue);
        assert_eq!(alice.conn.state(), ConnectionState::Registered);
        assert_eq!(
            alice.frames(),
            vec![r#"{"type":"user-list","data":["alice"]}"#]
        );

        register(&router, &mut bob, "bob");
        let expected = r#"{"type":"user-list","data":["alice","bob"]}"#;
        assert_eq!(alice.frames(), vec![expected]);
        assert_eq!(bob.frames(), vec![expected]);
    }

    #[test]
    fn duplicate_registration_rejects_only_the_newcomer() {
        let router = MessageRouter::new(PeerRegistry::new());
        let mut original = TestPeer::new();
        let mut impostor = TestPeer::new();

        register(&router, &mut original, "alice");
        original.frames();

        assert_eq!(
            register(&router, &mut impostor, "alice"),
            Disposition::Terminate
        );
        assert_eq!(impostor.frames(), vec![r#"{"type":"error","data":"UAE"}"#]);
        assert_eq!(impostor.conn.state(), ConnectionState::Connecting);
        assert!(original.frames().is_empty());
        assert_eq!(
            router.registry().lookup("alice").unwrap().connection_id(),
            original.conn.connection_id()
        );
    }

    #[test]
    fn second_register_on_same_session_is_ignored() {
        let router = MessageRouter::new(PeerRegistry::new());
        let mut alice = TestPeer::new();
        register(&router, &mut alice, "alice");
        alice.frames();

        assert_eq!(register(&router, &mut alice, "alias"), Disposition::Continue);
        assert_eq!(alice.conn.identity(), Some("alice"));
        assert_eq!(router.registry().snapshot(), vec!["alice"]);
        assert!(alice.frames().is_empty());
    }

    #[test]
    fn relay_forwards_original_frame_to_target_only() {
        let router = MessageRouter::new(PeerRegistry::new());
        let mut alice = TestPeer::new();
        let mut bob = TestPeer::new();
        let mut carol = TestPeer::new();
        register(&router, &mut alice, "alice");
        register(&router, &mut bob, "bob");
        register(&router, &mut carol, "carol");
        alice.frames();
        bob.frames();
        carol.frames();

        let frame = r#"{"type":"offer","from":"alice","to":"bob","data":{"sdp":"v=0\r\n o=- 1.50 2","type":"offer"}}"#;
        assert_eq!(router.dispatch(&mut alice.conn, frame), Disposition::Continue);

        assert_eq!(bob.frames(), vec![frame]);
        assert!(alice.frames().is_empty());
        assert!(carol.frames().is_empty());
    }

    #[test]
    fn relay_forwards_payloads_outside_json_value_limits() {
        let router = MessageRouter::new(PeerRegistry::new());
        let mut alice = TestPeer::new();
        let mut bob = TestPeer::new();
        register(&router, &mut alice, "alice");
        register(&router, &mut bob, "bob");
        alice.frames();
        bob.frames();

        let huge_number = r#"{"type":"offer","from":"alice","to":"bob","data":1e400}"#;
        let nested = format!("{}{}", "[".repeat(200), "]".repeat(200));
        let deep = format!(r#"{{"type":"candidate","from":"alice","to":"bob","data":{nested}}}"#);

        assert_eq!(router.dispatch(&mut alice.conn, huge_number), Disposition::Continue);
        assert_eq!(router.dispatch(&mut alice.conn, &deep), Disposition::Continue);
        assert_eq!(bob.frames(), vec![huge_number.to_string(), deep]);
    }

    #[test]
    fn relay_to_unknown_target_is_silently_dropped() {
        let router = MessageRouter::new(PeerRegistry::new());
        let mut alice = TestPeer::new();
        register(&router, &mut alice, "alice");
        alice.frames();

        let frame = r#"{"type":"candidate","from":"alice","to":"nobody","data":null}"#;
        assert_eq!(router.dispatch(&mut alice.conn, frame), Disposition::Continue);
        assert!(alice.frames().is_empty());
    }

    #[test]
    fn malformed_frames_do_not_end_the_session() {
        let router = MessageRouter::new(PeerRegistry::new());
        let mut peer = TestPeer::new();

        for frame in ["{", "[]", r#"{"type":"register"}"#, r#"{"type":"register","from":""}"#] {
            assert_eq!(router.dispatch(&mut peer.conn, frame), Disposition::Continue);
        }
        assert!(peer.frames().is_empty());

        assert_eq!(register(&router, &mut peer, "alice"), Disposition::Continue);
        assert_eq!(peer.conn.state(), ConnectionState::Registered);
    }

    #[test]
    fn server_only_types_are_ignored_inbound() {
        let router = MessageRouter::new(PeerRegistry::new());
        let mut alice = TestPeer::new();
        let mut mallory = TestPeer::new();
        register(&router, &mut alice, "alice");
        alice.frames();

        for frame in [
            r#"{"type":"user-list","to":"alice","data":["x"]}"#,
            r#"{"type":"error","to":"alice","data":"UAE"}"#,
            r#"{"type":"bye","to":"alice"}"#,
        ] {
            assert_eq!(router.dispatch(&mut mallory.conn, frame), Disposition::Continue);
        }
        assert!(alice.frames().is_empty());
        assert!(mallory.frames().is_empty());
        assert_eq!(mallory.conn.state(), ConnectionState::Connecting);
    }
}
