//! Acceptor start/stop lifecycle tests

mod common;

use common::{expect_event, start_acceptor, wait_until, TestClient};
use macropad_server::connection::{
    Acceptor, AcceptorState, ConnectionRegistry, DisconnectReason, SessionSettings,
};
use macropad_server::events::{ChannelListener, ServerEvent};
use macropad_server::protocol::Message;
use macropad_server::ServerError;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::sleep;

fn acceptor(listener: Arc<ChannelListener>) -> Acceptor {
    Acceptor::new(Arc::new(ConnectionRegistry::new()), listener)
}

fn slow_action_listener(delay: Duration) -> Arc<ChannelListener> {
    Arc::new(ChannelListener::default().with_normal_action_handler(move |_| {
        std::thread::sleep(delay);
        true
    }))
}

fn count_disconnects(events: &mut broadcast::Receiver<ServerEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ServerEvent::ClientDisconnected { .. }) {
            count += 1;
        }
    }
    count
}

#[tokio::test]
async fn test_start_reports_listening_and_stop_is_idempotent() {
    let listener = Arc::new(ChannelListener::default());
    let mut events = listener.subscribe();
    let acceptor = acceptor(Arc::clone(&listener));
    assert_eq!(acceptor.state(), AcceptorState::Stopped);

    acceptor.configure("127.0.0.1", 0).unwrap();
    let addr = acceptor.start().await.unwrap();
    assert_ne!(addr.port(), 0);
    assert_eq!(acceptor.state(), AcceptorState::Listening);
    assert_eq!(acceptor.local_addr(), Some(addr));

    match expect_event(&mut events, |e| matches!(e, ServerEvent::Listening { .. })).await {
        ServerEvent::Listening {
            description,
            local_addr,
        } => {
            assert_eq!(local_addr, addr);
            assert!(description.contains(&addr.to_string()));
        }
        other => panic!("unexpected event {:?}", other),
    }

    acceptor.stop().await;
    assert_eq!(acceptor.state(), AcceptorState::Stopped);
    assert_eq!(acceptor.local_addr(), None);
    assert!(TcpStream::connect(addr).await.is_err());

    // Second stop has nothing to do
    acceptor.stop().await;
    assert_eq!(acceptor.state(), AcceptorState::Stopped);
}

#[tokio::test]
async fn test_start_while_listening_is_rejected() {
    let acceptor = acceptor(Arc::new(ChannelListener::default()));
    acceptor.configure("127.0.0.1", 0).unwrap();
    acceptor.start().await.unwrap();

    assert!(matches!(
        acceptor.start().await,
        Err(ServerError::AlreadyRunning)
    ));
    assert!(matches!(
        acceptor.configure("127.0.0.1", 9000),
        Err(ServerError::AlreadyRunning)
    ));

    acceptor.stop().await;
}

#[tokio::test]
async fn test_configure_rejects_out_of_range_port() {
    let acceptor = acceptor(Arc::new(ChannelListener::default()));
    assert!(matches!(
        acceptor.configure("127.0.0.1", 70000),
        Err(ServerError::InvalidEndpoint { port: 70000 })
    ));
    assert!(acceptor.configure("127.0.0.1", 65535).is_ok());
    assert_eq!(acceptor.endpoint().port, 65535);
}

#[tokio::test]
async fn test_bind_failure_is_reported_and_leaves_acceptor_stopped() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let listener = Arc::new(ChannelListener::default());
    let mut events = listener.subscribe();
    let acceptor = acceptor(Arc::clone(&listener));
    acceptor.configure("127.0.0.1", u32::from(port)).unwrap();

    let err = acceptor.start().await.unwrap_err();
    assert!(matches!(err, ServerError::BindFailure { port: p, .. } if p == port));
    assert_eq!(acceptor.state(), AcceptorState::Stopped);

    match expect_event(&mut events, |e| matches!(e, ServerEvent::BindFailure { .. })).await {
        ServerEvent::BindFailure { address, port: p, .. } => {
            assert_eq!(address, "127.0.0.1");
            assert_eq!(p, port);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // The endpoint can be fixed and the acceptor started again
    acceptor.configure("127.0.0.1", 0).unwrap();
    assert!(acceptor.start().await.is_ok());
    acceptor.stop().await;
}

#[tokio::test]
async fn test_blank_address_listens_on_all_interfaces() {
    let acceptor = acceptor(Arc::new(ChannelListener::default()));
    acceptor.configure("   ", 0).unwrap();
    let addr = acceptor.start().await.unwrap();
    assert_eq!(addr.ip(), Ipv4Addr::UNSPECIFIED);

    let (_client, _) = TestClient::handshake((Ipv4Addr::LOCALHOST, addr.port()).into(), "pad").await;
    wait_until(|| acceptor.registry().len() == 1).await;

    acceptor.stop().await;
}

#[tokio::test]
async fn test_restart_after_stop() {
    let acceptor = acceptor(Arc::new(ChannelListener::default()));
    acceptor.configure("127.0.0.1", 0).unwrap();

    acceptor.start().await.unwrap();
    acceptor.stop().await;
    let second = acceptor.start().await.unwrap();
    assert_eq!(acceptor.state(), AcceptorState::Listening);

    let (_client, hello) = TestClient::handshake(second, "pad").await;
    assert!(hello.connection_id.starts_with("conn-"));

    acceptor.stop().await;
}

#[tokio::test]
async fn test_stop_closes_every_session() {
    let listener = Arc::new(ChannelListener::default());
    let mut events = listener.subscribe();
    let (acceptor, addr) = start_acceptor(Arc::clone(&listener), SessionSettings::default()).await;

    let (mut first, _) = TestClient::handshake(addr, "left").await;
    let (mut second, _) = TestClient::handshake(addr, "right").await;
    // A socket that never handshakes is closed as well
    let mut idle = TestClient::connect(addr).await;
    wait_until(|| acceptor.registry().len() == 3).await;

    acceptor.stop().await;
    assert!(acceptor.registry().is_empty());
    assert_eq!(acceptor.state(), AcceptorState::Stopped);

    for client in [&mut first, &mut second] {
        match client.recv().await {
            Some(Message::Disconnect(notice)) => assert!(notice.reason.contains("shutting down")),
            other => panic!("expected disconnect notice, got {:?}", other),
        }
        client.expect_closed().await;
    }
    idle.expect_closed().await;

    let mut shutdown_disconnects = 0;
    while shutdown_disconnects < 3 {
        expect_event(&mut events, |e| {
            matches!(
                e,
                ServerEvent::ClientDisconnected {
                    reason: DisconnectReason::ServerShutdown,
                    ..
                }
            )
        })
        .await;
        shutdown_disconnects += 1;
    }
}

#[tokio::test]
async fn test_connection_ids_are_unique_across_reconnects() {
    let (acceptor, addr) = start_acceptor(
        Arc::new(ChannelListener::default()),
        SessionSettings::default(),
    )
    .await;

    let mut seen = Vec::new();
    for _ in 0..3 {
        let (client, hello) = TestClient::handshake(addr, "pad").await;
        seen.push(hello.connection_id);
        drop(client);
    }
    seen.dedup();
    assert_eq!(seen.len(), 3);

    acceptor.stop().await;
}

#[tokio::test]
async fn test_unassigned_address_is_a_bind_failure() {
    let listener = Arc::new(ChannelListener::default());
    let mut events = listener.subscribe();
    let acceptor = acceptor(Arc::clone(&listener));
    // TEST-NET-3, never assigned to a local interface
    acceptor.configure("203.0.113.1", 8080).unwrap();

    assert!(matches!(
        acceptor.start().await,
        Err(ServerError::BindFailure { .. })
    ));
    assert_eq!(acceptor.state(), AcceptorState::Stopped);

    match expect_event(&mut events, |e| matches!(e, ServerEvent::BindFailure { .. })).await {
        ServerEvent::BindFailure { address, port, .. } => {
            assert_eq!(address, "203.0.113.1");
            assert_eq!(port, 8080);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_stop_without_connections_reports_no_errors() {
    let listener = Arc::new(ChannelListener::default());
    let mut events = listener.subscribe();
    let acceptor = acceptor(Arc::clone(&listener));
    acceptor.configure("127.0.0.1", 0).unwrap();

    acceptor.start().await.unwrap();
    acceptor.stop().await;

    while let Ok(event) = events.try_recv() {
        assert!(
            matches!(event, ServerEvent::Listening { .. }),
            "unexpected event {:?}",
            event
        );
    }
}

#[tokio::test]
async fn test_start_stop_with_racing_connections_leaves_registry_empty() {
    let acceptor = acceptor(Arc::new(ChannelListener::default()));
    acceptor.configure("127.0.0.1", 0).unwrap();

    for _ in 0..10 {
        let addr = acceptor.start().await.unwrap();
        let racers: Vec<_> = (0..4)
            .map(|_| tokio::spawn(async move { TcpStream::connect(addr).await }))
            .collect();
        acceptor.stop().await;

        assert_eq!(acceptor.state(), AcceptorState::Stopped);
        assert!(acceptor.registry().is_empty());
        for racer in racers {
            let _ = racer.await;
        }
        assert!(acceptor.registry().is_empty());
    }
}

#[tokio::test]
async fn test_overlapping_stops_report_each_disconnect_once() {
    let listener = slow_action_listener(Duration::from_millis(800));
    let mut events = listener.subscribe();
    let (acceptor, addr) = start_acceptor(Arc::clone(&listener), SessionSettings::default()).await;

    let (mut client, _) = TestClient::handshake(addr, "busy").await;
    client
        .send(Message::NormalAction(macropad_server::protocol::ActionRequest {
            profile_id: "main".to_string(),
            action_id: "slow".to_string(),
        }))
        .await;
    // Let the session pick the action up before stopping
    sleep(Duration::from_millis(100)).await;

    let first = tokio::spawn({
        let acceptor = Arc::clone(&acceptor);
        async move { acceptor.stop().await }
    });
    sleep(Duration::from_millis(50)).await;
    acceptor.stop().await;

    // The second stop waits for the first, so the session is gone already
    assert!(acceptor.registry().is_empty());
    first.await.unwrap();
    assert_eq!(acceptor.state(), AcceptorState::Stopped);

    // Leave room for a late teardown to publish a duplicate
    sleep(Duration::from_millis(300)).await;
    assert_eq!(count_disconnects(&mut events), 1);
    client.expect_closed().await;
}

#[tokio::test]
async fn test_concurrent_stops_without_sessions_are_harmless() {
    let acceptor = Arc::new(acceptor(Arc::new(ChannelListener::default())));
    acceptor.configure("127.0.0.1", 0).unwrap();
    let addr = acceptor.start().await.unwrap();

    let stops: Vec<_> = (0..4)
        .map(|_| {
            let acceptor = Arc::clone(&acceptor);
            tokio::spawn(async move { acceptor.stop().await })
        })
        .collect();
    for stop in stops {
        stop.await.unwrap();
    }

    assert_eq!(acceptor.state(), AcceptorState::Stopped);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_stuck_session_is_aborted_at_shutdown_timeout() {
    let listener = slow_action_listener(Duration::from_secs(2));
    let mut events = listener.subscribe();
    let acceptor = Acceptor::new(Arc::new(ConnectionRegistry::new()), listener.clone())
        .with_shutdown_timeout(Duration::from_millis(300));
    acceptor.configure("127.0.0.1", 0).unwrap();
    let addr = acceptor.start().await.unwrap();

    let (mut client, _) = TestClient::handshake(addr, "stuck").await;
    client
        .send(Message::NormalAction(macropad_server::protocol::ActionRequest {
            profile_id: "main".to_string(),
            action_id: "hang".to_string(),
        }))
        .await;
    sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    acceptor.stop().await;
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert!(acceptor.registry().is_empty());

    match expect_event(&mut events, |e| matches!(e, ServerEvent::ClientDisconnected { .. })).await {
        ServerEvent::ClientDisconnected { session, reason } => {
            assert_eq!(reason, DisconnectReason::ServerShutdown);
            assert_eq!(session.client_name(), Some("stuck"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    client.expect_closed().await;

    // The handler finishing later must not report the session again
    sleep(Duration::from_secs(2)).await;
    assert_eq!(count_disconnects(&mut events), 0);
}
