mod common;

use common::{init_logging, MockGateway};
use speech_client::speech_protocol::{Message, MessageType};
use speech_client::{
    Connection, ConnectionConfig, ConnectionError, Inbound, SynthesisClient, SynthesisConfig,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;

fn config_for(url: String) -> ConnectionConfig {
    ConnectionConfig {
        url,
        connect_timeout: Duration::from_secs(2),
        reconnect_backoff: Duration::from_millis(20),
        max_reconnects: 2,
        ..Default::default()
    }
}

/// Gateway that answers every upgrade with `401 Unauthorized`
async fn rejecting_gateway() -> (String, tokio::task::JoinHandle<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let task = tokio::spawn(async move {
        let mut handshakes = 0;
        while let Ok(Ok((stream, _))) =
            tokio::time::timeout(Duration::from_millis(500), listener.accept()).await
        {
            handshakes += 1;
            let reject = |_: &Request, _: Response| {
                Err::<Response, ErrorResponse>(
                    http::Response::builder()
                        .status(401)
                        .body(Some("invalid api key".to_string()))
                        .unwrap(),
                )
            };
            let _ = tokio_tungstenite::accept_hdr_async(stream, reject).await;
        }
        handshakes
    });
    (url, task)
}

#[test_log::test(tokio::test)]
async fn test_retry_waits_with_exponential_backoff() {
    let gateway = MockGateway::start_dropping(2, |mut peer| async move {
        peer.handshake("tts-retry").await;
        peer.serve_until_end().await;
    })
    .await;

    let client = SynthesisClient::new(
        SynthesisConfig::new(gateway.url(), "tengen")
            .with_connect_timeout(Duration::from_secs(2))
            .with_reconnect(Duration::from_secs(1), 3),
    )
    .unwrap();

    let started = Instant::now();
    let session = client
        .create_session(&Default::default(), &CancellationToken::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // Two failures: waits of 1s then 2s before the third attempt succeeds
    assert!(elapsed >= Duration::from_secs(3), "took {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(6), "took {:?}", elapsed);
    assert_eq!(gateway.accepted(), 3);
    assert_eq!(session.id(), "tts-retry");

    session.close().await;
}

#[tokio::test]
async fn test_rejected_handshake_is_not_retried() {
    init_logging();
    let (url, gateway) = rejecting_gateway().await;

    let conn = Connection::new(config_for(format!("{}/ws/tts?api_key=bad", url)));
    let err = conn
        .connect_with_retry(&CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        ConnectionError::Handshake {
            url,
            status,
            message,
        } => {
            assert_eq!(*status, 401);
            assert!(!message.is_empty());
            assert!(!url.contains("api_key"), "credentials leaked into {}", url);
        }
        other => panic!("expected handshake error, got {:?}", other),
    }
    assert!(!err.is_retryable());
    assert_eq!(gateway.await.unwrap(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_report_attempts() {
    init_logging();
    let gateway = MockGateway::start_dropping(usize::MAX, |_peer| async {}).await;

    let conn = Connection::new(config_for(format!("{}/ws/stt", gateway.url())));
    let err = conn
        .connect_with_retry(&CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        ConnectionError::RetriesExhausted { attempts, last, .. } => {
            assert_eq!(attempts, 3);
            assert!(last.is_retryable());
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }
    assert_eq!(gateway.accepted(), 3);
}

#[tokio::test]
async fn test_frames_flow_both_ways() {
    init_logging();
    let gateway = MockGateway::start(|mut peer| async move {
        let first = peer.recv().await.unwrap();
        peer.send(Message::transcript_partial(format!("got {}", first.message_type())))
            .await;
        peer.serve_until_end().await;
    })
    .await;

    let conn = Connection::new(config_for(format!("{}/ws/stt", gateway.url())));
    conn.connect().await.unwrap();
    assert!(conn.is_connected());
    assert!(conn.connect_duration() > Duration::ZERO);
    assert!(conn.endpoint().ends_with("/ws/stt"));

    conn.send_json(&Message::input_commit()).await.unwrap();
    let reply: Message = conn
        .receive_json(Duration::from_secs(2), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reply, Message::transcript_partial("got input.commit"));

    conn.send_json(&Message::session_end()).await.unwrap();
    assert!(conn.wait_closed(Duration::from_secs(2)).await);
    assert!(!conn.is_connected());
    assert_eq!(conn.next_inbound().await, Inbound::Closed);

    conn.close().await;
    assert_eq!(gateway.count(MessageType::SessionEnd), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_senders_never_interleave_frames() {
    init_logging();
    let gateway = MockGateway::start(|mut peer| async move {
        peer.serve_until_end().await;
    })
    .await;

    let conn = Arc::new(Connection::new(config_for(format!(
        "{}/ws/tts",
        gateway.url()
    ))));
    conn.connect().await.unwrap();

    let senders: Vec<_> = (0..32)
        .map(|task| {
            let conn = conn.clone();
            tokio::spawn(async move {
                for frame in 0..20 {
                    let text = format!("{}-{}:", task, frame).repeat(1000);
                    conn.send_json(&Message::text_append(text)).await.unwrap();
                }
            })
        })
        .collect();
    for sender in senders {
        sender.await.unwrap();
    }

    conn.send_json(&Message::session_end()).await.unwrap();
    assert!(conn.wait_closed(Duration::from_secs(5)).await);
    conn.close().await;

    // Every frame decoded intact on the gateway side
    assert_eq!(gateway.count(MessageType::TextAppend), 32 * 20);
    assert_eq!(gateway.count(MessageType::SessionEnd), 1);
    for message in gateway.received() {
        if let Message::TextAppend { text } = message {
            let unit = text.split_inclusive(':').next().unwrap().to_string();
            assert_eq!(text, unit.repeat(1000));
        }
    }
}

#[tokio::test]
async fn test_abnormal_close_is_reported() {
    init_logging();
    let gateway = MockGateway::start(|mut peer| async move {
        peer.close_with(CloseCode::Policy, "quota exceeded").await;
        peer.drain().await;
    })
    .await;

    let conn = Connection::new(config_for(format!("{}/ws/tts", gateway.url())));
    conn.connect().await.unwrap();

    let inbound = tokio::time::timeout(Duration::from_secs(2), conn.next_inbound())
        .await
        .unwrap();
    assert_eq!(
        inbound,
        Inbound::Error(ConnectionError::ClosedAbnormally {
            code: 1008,
            reason: "quota exceeded".to_string(),
        })
    );
    conn.close().await;
}

#[tokio::test]
async fn test_silent_gateway_hits_read_timeout() {
    init_logging();
    let gateway = MockGateway::start(|mut peer| async move {
        peer.drain().await;
    })
    .await;

    let conn = Connection::new(ConnectionConfig {
        read_timeout: Duration::from_millis(200),
        ping_interval: Duration::ZERO,
        ..config_for(format!("{}/ws/stt", gateway.url()))
    });
    conn.connect().await.unwrap();

    let inbound = tokio::time::timeout(Duration::from_secs(2), conn.next_inbound())
        .await
        .unwrap();
    assert_eq!(
        inbound,
        Inbound::Error(ConnectionError::ReadTimeout(Duration::from_millis(200)))
    );
    conn.close().await;
}
