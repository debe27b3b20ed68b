//! Membership Module Tests
//!
//! Validates the fundamental components of the cluster membership system.
//!
//! ## Test Scopes
//! - **Data Structures**: Ensures uniqueness of IDs and correct serialization of wire protocol messages.
//! - **Service Logic**: Verifies initialization, member management and event publication.
//! - **Conflict Resolution**: Tests the incarnation rules that let a node refute suspicion.

#[cfg(test)]
mod tests {
    use crate::membership::service::MembershipService;
    use crate::membership::types::{GossipMessage, MembershipEvent, Node, NodeId, NodeState};
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn remote_node(id: &str, incarnation: u64) -> Node {
        Node {
            id: NodeId(id.to_string()),
            gossip_addr: "127.0.0.1:7100".parse().unwrap(),
            dsm_addr: "127.0.0.1:9100".parse().unwrap(),
            http_addr: "127.0.0.1:8100".parse().unwrap(),
            state: NodeState::Alive,
            incarnation,
            last_seen: None,
        }
    }

    async fn local_service() -> Arc<MembershipService> {
        let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        MembershipService::new(
            bind_addr,
            "127.0.0.1:9000".parse().unwrap(),
            "127.0.0.1:8000".parse().unwrap(),
            vec![],
        )
        .await
        .expect("Failed to create service")
    }

    // ============================================================
    // NODE ID TESTS
    // ============================================================

    #[test]
    fn test_node_id_is_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();

        assert_ne!(id1, id2, "Each NodeId should be unique");
    }

    #[test]
    fn test_node_id_display_is_raw_string() {
        let id = NodeId::from("node-7");
        assert_eq!(id.to_string(), "node-7");
    }

    // ============================================================
    // WIRE FORMAT TESTS
    // ============================================================

    #[test]
    fn test_node_bincode_skips_last_seen() {
        let mut node = remote_node("bincode-test", 100);
        node.state = NodeState::Suspect;
        node.last_seen = Some(std::time::Instant::now());

        let encoded = bincode::serialize(&node).expect("Bincode serialization failed");
        let restored: Node = bincode::deserialize(&encoded).expect("Bincode deserialization failed");

        assert_eq!(restored.id, node.id);
        assert_eq!(restored.dsm_addr, node.dsm_addr);
        assert_eq!(restored.state, NodeState::Suspect);
        assert!(restored.last_seen.is_none());
    }

    #[test]
    fn test_gossip_ping_carries_advertised_addresses() {
        let msg = GossipMessage::Ping {
            from: remote_node("sender-node", 5),
        };

        let encoded = bincode::serialize(&msg).expect("Failed to serialize Ping");
        let decoded: GossipMessage =
            bincode::deserialize(&encoded).expect("Failed to deserialize Ping");

        if let GossipMessage::Ping { from } = decoded {
            assert_eq!(from.id.0, "sender-node");
            assert_eq!(from.incarnation, 5);
            assert_eq!(from.dsm_addr.port(), 9100);
        } else {
            panic!("Wrong message type");
        }
    }

    // ============================================================
    // MEMBERSHIP SERVICE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_membership_service_creation() {
        let service = local_service().await;

        // Should have itself as a member
        assert_eq!(service.members.len(), 1);

        let alive = service.get_alive_members();
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].id, service.local_node.id);
        assert_eq!(alive[0].state, NodeState::Alive);
        // Port 0 is resolved to the bound port
        assert_ne!(service.local_node.gossip_addr.port(), 0);
    }

    #[tokio::test]
    async fn test_membership_get_member() {
        let service = local_service().await;

        let member = service.get_member(&service.local_node.id);
        assert!(member.is_some());
        assert_eq!(member.unwrap().dsm_addr.port(), 9000);

        let fake_id = NodeId("non-existent".to_string());
        assert!(service.get_member(&fake_id).is_none());
    }

    #[tokio::test]
    async fn test_join_publishes_joined_event() {
        // ARRANGE
        let service = local_service().await;
        let mut events = service.subscribe();
        let joiner = remote_node("joiner", 1);

        // ACT
        service
            .handle_message(GossipMessage::Join { node: joiner.clone() }, joiner.gossip_addr)
            .await
            .unwrap();

        // ASSERT
        assert_eq!(service.members.len(), 2);
        match events.try_recv().expect("expected an event") {
            MembershipEvent::Joined(node) => assert_eq!(node.id, joiner.id),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_suspect_then_alive_refutation_publishes_transitions() {
        // ARRANGE
        let service = local_service().await;
        let joiner = remote_node("flaky", 3);
        service
            .handle_message(GossipMessage::Join { node: joiner.clone() }, joiner.gossip_addr)
            .await
            .unwrap();
        let mut events = service.subscribe();

        // ACT: suspected at the current incarnation
        service
            .handle_message(
                GossipMessage::Suspect {
                    node_id: joiner.id.clone(),
                    incarnation: 3,
                },
                joiner.gossip_addr,
            )
            .await
            .unwrap();

        // ASSERT
        assert_eq!(
            service.get_member(&joiner.id).unwrap().state,
            NodeState::Suspect
        );
        match events.try_recv().unwrap() {
            MembershipEvent::StateChanged { from, to, .. } => {
                assert_eq!(from, NodeState::Alive);
                assert_eq!(to, NodeState::Suspect);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // ACT: the node refutes with a higher incarnation
        service
            .handle_message(
                GossipMessage::Alive {
                    node_id: joiner.id.clone(),
                    incarnation: 4,
                },
                joiner.gossip_addr,
            )
            .await
            .unwrap();

        // ASSERT
        let member = service.get_member(&joiner.id).unwrap();
        assert_eq!(member.state, NodeState::Alive);
        assert_eq!(member.incarnation, 4);
        assert!(matches!(
            events.try_recv().unwrap(),
            MembershipEvent::StateChanged {
                to: NodeState::Alive,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stale_alive_does_not_override_suspect() {
        let service = local_service().await;
        let joiner = remote_node("stale", 5);
        service
            .handle_message(GossipMessage::Join { node: joiner.clone() }, joiner.gossip_addr)
            .await
            .unwrap();
        service
            .handle_message(
                GossipMessage::Suspect {
                    node_id: joiner.id.clone(),
                    incarnation: 6,
                },
                joiner.gossip_addr,
            )
            .await
            .unwrap();

        // An Alive claim older than the suspicion is ignored
        service
            .handle_message(
                GossipMessage::Alive {
                    node_id: joiner.id.clone(),
                    incarnation: 5,
                },
                joiner.gossip_addr,
            )
            .await
            .unwrap();

        assert_eq!(
            service.get_member(&joiner.id).unwrap().state,
            NodeState::Suspect
        );
    }

    #[tokio::test]
    async fn test_forget_member_publishes_departure() {
        let service = local_service().await;
        let joiner = remote_node("leaver", 1);
        service
            .handle_message(GossipMessage::Join { node: joiner.clone() }, joiner.gossip_addr)
            .await
            .unwrap();
        let mut events = service.subscribe();

        assert!(service.forget_member(&joiner.id));
        assert!(!service.forget_member(&service.local_node.id.clone()));

        let event = events.try_recv().unwrap();
        assert!(event.is_departure());
        assert_eq!(event.node_id(), &joiner.id);
        assert_eq!(service.members.len(), 1);
    }

    #[tokio::test]
    async fn test_ping_from_unknown_member_registers_it() {
        let service = local_service().await;
        let pinger = remote_node("pinger", 2);
        let src: SocketAddr = "127.0.0.1:7200".parse().unwrap();

        service
            .handle_message(GossipMessage::Ping { from: pinger.clone() }, src)
            .await
            .unwrap();

        let member = service.get_member(&pinger.id).unwrap();
        // The observed source wins over the advertised gossip address
        assert_eq!(member.gossip_addr, src);
        assert_eq!(member.dsm_addr, pinger.dsm_addr);
        assert_eq!(member.state, NodeState::Alive);
    }

    #[test]
    fn test_dead_transition_is_departure() {
        let node = remote_node("gone", 1);
        let dead = MembershipEvent::StateChanged {
            node: node.clone(),
            from: NodeState::Suspect,
            to: NodeState::Dead,
        };
        let suspect = MembershipEvent::StateChanged {
            node,
            from: NodeState::Alive,
            to: NodeState::Suspect,
        };

        assert!(dead.is_departure());
        assert!(!suspect.is_departure());
    }
}
