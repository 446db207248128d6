use crate::error::SpeechError;
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use strum::IntoStaticStr;
use tokio::sync::mpsc;

/// Something that happened during a recognition session
#[derive(Debug, Clone, PartialEq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RecognitionEvent {
    /// Handshake finished; always the first event
    Ready { session_id: String },
    Partial { text: String },
    Final {
        text: String,
        start: Duration,
        end: Duration,
    },
    Error(SpeechError),
    /// The gateway finished processing the committed input
    InputDone,
    Processing,
    /// Last event, unless dropped because the queue was full; the stream
    /// always ends after the session closes
    Closed,
}

impl RecognitionEvent {
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            RecognitionEvent::Partial { text } | RecognitionEvent::Final { text, .. } => {
                Some(text)
            }
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, RecognitionEvent::Final { .. })
    }
}

/// The event stream of one recognition session.
///
/// The queue is bounded. When the consumer falls behind and the queue is
/// full, the newest event is dropped so the session's message loop never
/// stalls on a slow reader. Synthesis audio takes the opposite policy, see
/// [`crate::tts::AudioStream`].
///
/// Ends (yields `None`) once the session has closed, whether or not the
/// `Closed` event itself fit in the queue.
#[derive(Debug)]
pub struct RecognitionEvents {
    rx: mpsc::Receiver<RecognitionEvent>,
}

impl RecognitionEvents {
    pub(crate) fn new(rx: mpsc::Receiver<RecognitionEvent>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<RecognitionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RecognitionEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for RecognitionEvents {
    type Item = RecognitionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
