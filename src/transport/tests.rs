//! Transport Module Tests
//!
//! ## Test Scopes
//! - **Memory transport**: request/response exchange, peer listing, disconnect behaviour.
//! - **TCP transport**: the same exchange over loopback sockets, address book maintenance.

#[cfg(test)]
mod tests {
    use crate::membership::types::{MembershipEvent, Node, NodeId, NodeState};
    use crate::transport::memory::MemoryNetwork;
    use crate::transport::tcp::TcpTransport;
    use crate::transport::{MessageHandler, StreamKind, Transport, TransportError};
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Replies with the stream kind byte followed by the request reversed.
    struct ReverseHandler;

    #[async_trait]
    impl MessageHandler for ReverseHandler {
        async fn handle_message(&self, kind: StreamKind, mut data: Vec<u8>) -> Vec<u8> {
            data.reverse();
            let mut out = vec![kind.as_byte()];
            out.extend(data);
            out
        }
    }

    async fn exchange(
        transport: &dyn Transport,
        node: &NodeId,
        kind: StreamKind,
        payload: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let connection = transport.connect(node).await?;
        let mut stream = connection.open_stream(kind).await?;
        stream.write_message(payload).await?;
        let response = stream.read_message().await?;
        stream.close().await?;
        Ok(response)
    }

    // ============================================================
    // MEMORY TRANSPORT
    // ============================================================

    #[tokio::test]
    async fn test_memory_exchange_reaches_peer_handler() {
        // ARRANGE
        let network = MemoryNetwork::new();
        let a = NodeId::from("a");
        let b = NodeId::from("b");
        let (transport_a, _listener_a) = network.attach(a.clone());
        let (_transport_b, listener_b) = network.attach(b.clone());
        listener_b.serve(Arc::new(ReverseHandler));

        // ACT
        let response = exchange(transport_a.as_ref(), &b, StreamKind::Data, b"abc")
            .await
            .unwrap();

        // ASSERT
        assert_eq!(response, vec![1, b'c', b'b', b'a']);
        assert_eq!(transport_a.peers(), vec![b]);
    }

    #[tokio::test]
    async fn test_memory_disconnect_makes_peer_unreachable() {
        let network = MemoryNetwork::new();
        let a = NodeId::from("a");
        let b = NodeId::from("b");
        let (transport_a, _listener_a) = network.attach(a.clone());
        let (transport_b, listener_b) = network.attach(b.clone());
        listener_b.serve(Arc::new(ReverseHandler));

        network.disconnect(&b);

        let err = exchange(transport_a.as_ref(), &b, StreamKind::Control, b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer(_)));

        // The disconnected side cannot dial out either
        let err = exchange(transport_b.as_ref(), &a, StreamKind::Control, b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailed { .. }));
        assert!(transport_a.peers().is_empty());
    }

    // ============================================================
    // TCP TRANSPORT
    // ============================================================

    #[tokio::test]
    async fn test_tcp_exchange_over_loopback() {
        // ARRANGE
        let server_id = NodeId::from("server");
        let server = TcpTransport::new(server_id.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve(listener, Arc::new(ReverseHandler)));

        let client = TcpTransport::new(NodeId::from("client"));
        client.add_peer(server_id.clone(), addr);

        // ACT
        let response = exchange(client.as_ref(), &server_id, StreamKind::Control, b"dsm")
            .await
            .unwrap();

        // ASSERT
        assert_eq!(response, vec![0, b'm', b's', b'd']);
    }

    #[tokio::test]
    async fn test_tcp_unknown_peer_is_reported() {
        let client = TcpTransport::new(NodeId::from("client"));
        let err = client.connect(&NodeId::from("nobody")).await.err().unwrap();
        assert!(matches!(err, TransportError::UnknownPeer(_)));
    }

    #[test]
    fn test_tcp_address_book_follows_membership() {
        let transport = TcpTransport::new(NodeId::from("local"));
        let node = Node {
            id: NodeId::from("peer"),
            gossip_addr: "127.0.0.1:5001".parse().unwrap(),
            dsm_addr: "127.0.0.1:7001".parse().unwrap(),
            http_addr: "127.0.0.1:6001".parse().unwrap(),
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: None,
        };

        transport.apply_event(&MembershipEvent::Joined(node.clone()));
        assert_eq!(transport.peers(), vec![node.id.clone()]);

        transport.apply_event(&MembershipEvent::StateChanged {
            node: node.clone(),
            from: NodeState::Suspect,
            to: NodeState::Dead,
        });
        assert!(transport.peers().is_empty());

        // The local node never routes to itself
        transport.add_peer(NodeId::from("local"), "127.0.0.1:7000".parse().unwrap());
        assert!(transport.peers().is_empty());
    }
}
