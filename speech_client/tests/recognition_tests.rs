mod common;

use common::{init_logging, pcm, MockGateway};
use speech_client::speech_protocol::{decode_audio, error_codes, Message, MessageType};
use speech_client::{
    RecognitionClient, RecognitionConfig, RecognitionEvent, RecognitionState, SpeechError,
    StreamOptions,
};
use std::io::Write;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn client_for(gateway: &MockGateway) -> RecognitionClient {
    RecognitionClient::new(
        RecognitionConfig::new(gateway.url(), "tengen")
            .with_api_key("secret-key")
            .with_connect_timeout(Duration::from_secs(2))
            .with_reconnect(Duration::from_millis(50), 0),
    )
    .unwrap()
}

/// All audio the gateway received, decoded and concatenated
fn uploaded_audio(gateway: &MockGateway) -> Vec<u8> {
    gateway
        .received()
        .into_iter()
        .filter_map(|m| match m {
            Message::AudioAppend { audio } => Some(decode_audio(&audio).unwrap()),
            _ => None,
        })
        .flatten()
        .collect()
}

#[test_log::test(tokio::test)]
async fn test_recognize_bytes_collects_final_segments() {
    let gateway = MockGateway::start(|mut peer| async move {
        peer.handshake("stt-1").await;
        peer.recv_until(MessageType::InputCommit).await;
        peer.send(Message::transcript_partial("你")).await;
        peer.send(Message::transcript_final("你好", 0, 800)).await;
        peer.send(Message::processing()).await;
        peer.send(Message::transcript_final("世界", 800, 1500)).await;
        peer.send(Message::input_done()).await;
        peer.serve_until_end().await;
    })
    .await;

    let audio = pcm(4000);
    let result = client_for(&gateway)
        .recognize_bytes(&audio, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.text, "你好世界");
    assert_eq!(result.segments.len(), 2);
    assert_eq!(result.segments[0].end, Duration::from_millis(800));
    assert_eq!(result.segments[1].start, Duration::from_millis(800));
    assert_eq!(result.segments[1].end, Duration::from_millis(1500));

    // 16kHz mono s16: 100ms is 3200 bytes, so 8000 bytes go up in three chunks
    assert_eq!(gateway.count(MessageType::AudioAppend), 3);
    assert_eq!(gateway.count(MessageType::InputCommit), 1);
    assert_eq!(gateway.count(MessageType::SessionEnd), 1);
    assert_eq!(uploaded_audio(&gateway), audio);

    let paths = gateway.paths();
    assert_eq!(paths.len(), 1);
    assert!(paths[0].starts_with("/ws/stt?"));
    assert!(paths[0].contains("provider=tengen"));
    assert!(paths[0].contains("api_key=secret-key"));
}

#[tokio::test]
async fn test_session_config_carries_stream_options() {
    init_logging();
    let gateway = MockGateway::start(|mut peer| async move {
        peer.handshake("stt-2").await;
        peer.serve_until_end().await;
    })
    .await;

    let options = StreamOptions {
        language: Some("en-US".to_string()),
        vad: Some(true),
        ..Default::default()
    };
    let session = client_for(&gateway)
        .recognize_stream(&options, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(session.id(), "stt-2");
    assert_eq!(session.state(), RecognitionState::Active);
    session.close().await;

    let config = gateway
        .received()
        .into_iter()
        .find_map(|m| match m {
            Message::SessionConfig { session } => Some(session),
            _ => None,
        })
        .unwrap();
    assert_eq!(config.provider.as_deref(), Some("tengen"));
    assert_eq!(config.language.as_deref(), Some("en-US"));
    assert_eq!(config.sample_rate, Some(16000));
    assert_eq!(config.audio_format.as_deref(), Some("pcm"));
    assert_eq!(config.vad, Some(true));
}

#[tokio::test]
async fn test_audio_is_forwarded_unchanged_regardless_of_chunking() {
    init_logging();
    let audio = pcm(3000);

    for chunk_size in [1usize, 333, 6000] {
        let gateway = MockGateway::start(|mut peer| async move {
            peer.handshake("stt-chunks").await;
            peer.recv_until(MessageType::InputCommit).await;
            peer.send(Message::input_done()).await;
            peer.serve_until_end().await;
        })
        .await;

        let session = client_for(&gateway)
            .recognize_stream(&StreamOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        let mut events = session.events().unwrap();

        for chunk in audio.chunks(chunk_size) {
            session.send_pcm(chunk).await.unwrap();
        }
        session.commit().await.unwrap();

        while let Some(event) = events.recv().await {
            if event == RecognitionEvent::InputDone {
                break;
            }
        }
        session.close().await;

        assert_eq!(uploaded_audio(&gateway), audio, "chunk size {}", chunk_size);
    }
}

#[tokio::test]
async fn test_events_arrive_in_order_and_end_with_closed() {
    init_logging();
    let gateway = MockGateway::start(|mut peer| async move {
        peer.handshake("stt-order").await;
        peer.send(Message::transcript_partial("he")).await;
        peer.send(Message::transcript_partial("hello")).await;
        peer.send(Message::transcript_final("hello", 0, 500)).await;
        peer.send(Message::input_done()).await;
        peer.close().await;
    })
    .await;

    let session = client_for(&gateway)
        .recognize_stream(&StreamOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    let mut events = session.events().unwrap();
    assert!(session.events().is_none());

    let mut kinds = Vec::new();
    while let Some(event) = events.recv().await {
        kinds.push(event.kind());
    }
    assert_eq!(
        kinds,
        vec!["ready", "partial", "partial", "final", "input_done", "closed"]
    );
    assert!(session.is_closed());
    session.close().await;
}

#[tokio::test]
async fn test_full_event_queue_drops_newest_and_still_ends() {
    init_logging();
    let gateway = MockGateway::start(|mut peer| async move {
        peer.handshake("stt-flood").await;
        for i in 0..250 {
            peer.send(Message::transcript_partial(i.to_string())).await;
        }
        peer.send(Message::input_done()).await;
        peer.close().await;
    })
    .await;

    let session = client_for(&gateway)
        .recognize_stream(&StreamOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    let mut events = session.events().unwrap();

    // Let the gateway overrun the queue before reading anything
    tokio::time::sleep(Duration::from_millis(800)).await;

    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
    })
    .await
    .expect("event stream did not end");

    assert_eq!(seen.len(), 100);
    assert!(matches!(seen[0], RecognitionEvent::Ready { .. }));
    let texts: Vec<&str> = seen[1..].iter().filter_map(|e| e.text()).collect();
    let expected: Vec<String> = (0..99).map(|i| i.to_string()).collect();
    assert_eq!(texts, expected);
    assert!(seen[1..].iter().all(|e| e.kind() == "partial"));
    assert!(session.is_closed());

    session.close().await;
}

#[tokio::test]
async fn test_server_error_ends_session() {
    init_logging();
    let gateway = MockGateway::start(|mut peer| async move {
        peer.handshake("stt-auth").await;
        peer.send(Message::error(error_codes::AUTH_ERROR, "invalid api key"))
            .await;
        peer.serve_until_end().await;
    })
    .await;

    let session = client_for(&gateway)
        .recognize_stream(&StreamOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    let mut events = session.events().unwrap();

    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        seen.push(event);
    }

    assert_eq!(seen.len(), 3);
    assert!(matches!(seen[0], RecognitionEvent::Ready { .. }));
    match &seen[1] {
        RecognitionEvent::Error(e) => {
            assert_eq!(e.server_code(), Some("AUTH_ERROR"));
            assert!(e.to_string().ends_with("[AUTH_ERROR] invalid api key"));
        }
        other => panic!("expected error event, got {:?}", other),
    }
    assert_eq!(seen[2], RecognitionEvent::Closed);
    assert_eq!(session.state(), RecognitionState::Closed);

    session.close().await;
}

#[tokio::test]
async fn test_recognize_bytes_surfaces_server_error() {
    init_logging();
    let gateway = MockGateway::start(|mut peer| async move {
        peer.handshake("stt-err").await;
        peer.recv_until(MessageType::InputCommit).await;
        peer.send(Message::error(error_codes::PROVIDER_ERROR, "asr backend down"))
            .await;
        peer.serve_until_end().await;
    })
    .await;

    let err = client_for(&gateway)
        .recognize_bytes(&pcm(1600), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.server_code(), Some("PROVIDER_ERROR"));
}

#[tokio::test]
async fn test_unexpected_first_frame_fails_start() {
    init_logging();
    let gateway = MockGateway::start(|mut peer| async move {
        peer.send(Message::transcript_partial("too early")).await;
        peer.drain().await;
    })
    .await;

    let err = client_for(&gateway)
        .recognize_stream(&StreamOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SpeechError::Protocol(_)), "got {:?}", err);
    assert_eq!(gateway.count(MessageType::SessionConfig), 0);
}

#[tokio::test]
async fn test_error_instead_of_ready_is_server_error() {
    init_logging();
    let gateway = MockGateway::start(|mut peer| async move {
        peer.send(Message::error(error_codes::RATE_LIMIT_ERROR, "too many sessions"))
            .await;
        peer.drain().await;
    })
    .await;

    let err = client_for(&gateway)
        .recognize_stream(&StreamOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.server_code(), Some("RATE_LIMIT_ERROR"));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_idle_timeout_completes_recognition() {
    init_logging();
    let gateway = MockGateway::start(|mut peer| async move {
        peer.handshake("stt-idle").await;
        peer.recv_until(MessageType::InputCommit).await;
        peer.send(Message::transcript_final("quiet gateway", 0, 300))
            .await;
        // Never sends input.done
        peer.serve_until_end().await;
    })
    .await;

    let client = RecognitionClient::new(
        RecognitionConfig::new(gateway.url(), "tengen")
            .with_idle_timeout(Duration::from_millis(300))
            .with_reconnect(Duration::from_millis(50), 0),
    )
    .unwrap();

    let started = Instant::now();
    let result = client
        .recognize_bytes(&pcm(800), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.text, "quiet gateway");
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_default_idle_timeout_is_ten_seconds() {
    init_logging();
    let gateway = MockGateway::start(|mut peer| async move {
        peer.handshake("stt-idle-default").await;
        peer.recv_until(MessageType::InputCommit).await;
        peer.serve_until_end().await;
    })
    .await;

    let started = Instant::now();
    let result = client_for(&gateway)
        .recognize_bytes(&pcm(800), &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.text.is_empty());
    assert!(started.elapsed() >= Duration::from_secs(10));
}

#[tokio::test]
async fn test_cancel_aborts_recognition() {
    init_logging();
    let gateway = MockGateway::start(|mut peer| async move {
        peer.handshake("stt-cancel").await;
        peer.serve_until_end().await;
    })
    .await;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        }
    });

    let err = client_for(&gateway)
        .recognize_bytes(&pcm(800), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, SpeechError::Cancelled);
}

#[tokio::test]
async fn test_recognize_file_skips_wav_header() {
    init_logging();
    let gateway = MockGateway::start(|mut peer| async move {
        peer.handshake("stt-file").await;
        peer.recv_until(MessageType::InputCommit).await;
        peer.send(Message::transcript_final("from file", 0, 250)).await;
        peer.send(Message::input_done()).await;
        peer.serve_until_end().await;
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("utterance.WAV");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let samples: Vec<i16> = (0..4000).map(|i| ((i % 200) * 100) as i16).collect();
    {
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for sample in &samples {
            writer.write_sample(*sample).unwrap();
        }
        writer.finalize().unwrap();
    }

    let result = client_for(&gateway)
        .recognize_file(&path, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.text, "from file");

    let expected: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    assert_eq!(uploaded_audio(&gateway), expected);
}

#[tokio::test]
async fn test_recognize_file_sends_raw_pcm_untouched() {
    init_logging();
    let gateway = MockGateway::start(|mut peer| async move {
        peer.handshake("stt-raw").await;
        peer.recv_until(MessageType::InputCommit).await;
        peer.send(Message::input_done()).await;
        peer.serve_until_end().await;
    })
    .await;

    let audio = pcm(500);
    let mut file = tempfile::Builder::new().suffix(".pcm").tempfile().unwrap();
    file.write_all(&audio).unwrap();
    file.flush().unwrap();

    client_for(&gateway)
        .recognize_file(file.path(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(uploaded_audio(&gateway), audio);
}

#[tokio::test]
async fn test_send_after_close_is_rejected() {
    init_logging();
    let gateway = MockGateway::start(|mut peer| async move {
        peer.handshake("stt-closed").await;
        peer.serve_until_end().await;
    })
    .await;

    let session = client_for(&gateway)
        .recognize_stream(&StreamOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    session.close().await;
    session.close().await;

    assert!(matches!(
        session.send(&[0, 0]).await,
        Err(SpeechError::Session(_))
    ));
    assert_eq!(gateway.count(MessageType::SessionEnd), 1);
    assert_eq!(gateway.count(MessageType::AudioAppend), 0);
}
