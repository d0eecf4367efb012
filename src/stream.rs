use crate::context::CallContext;
use crate::error::{Result, VoiceError};
use crate::protocol::{self, Frame, Inbound};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const READ_CHUNK: usize = 16 * 1024;

/// One-shot, forward-only audio bytes. Consumed exactly once by the cache writer.
#[derive(Debug)]
pub struct AudioStream {
    rx: mpsc::Receiver<Result<Bytes>>,
    finished: bool,
}

/// Producer half of an [`AudioStream`]. Dropping it ends the stream cleanly.
#[derive(Debug, Clone)]
pub struct AudioSink {
    tx: mpsc::Sender<Result<Bytes>>,
}

pub fn audio_channel(capacity: usize) -> (AudioSink, AudioStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        AudioSink { tx },
        AudioStream {
            rx,
            finished: false,
        },
    )
}

impl AudioSink {
    /// Returns false once the consumer has gone away.
    pub async fn send(&self, chunk: Bytes) -> bool {
        self.tx.send(Ok(chunk)).await.is_ok()
    }

    /// Terminates the stream with `err`; the consumer sees it on its next read.
    pub async fn fail(self, err: VoiceError) {
        let _ = self.tx.send(Err(err)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl AudioStream {
    /// A stream that yields `chunks` in order and then ends.
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
    {
        let chunks: Vec<Bytes> = chunks.into_iter().collect();
        let (sink, stream) = audio_channel(chunks.len() + 1);
        for chunk in chunks {
            // capacity covers every chunk, so this never waits
            let _ = sink.tx.try_send(Ok(chunk));
        }
        stream
    }

    pub fn empty() -> Self {
        Self::from_chunks(Vec::new())
    }

    /// Pumps `reader` into a new stream from a background task.
    /// `keep_alive` is held until the reader is exhausted (temp files, child handles).
    pub fn from_reader<R, K>(ctx: &CallContext, reader: R, keep_alive: K, capacity: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        K: Send + 'static,
    {
        let (sink, stream) = audio_channel(capacity);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _keep_alive = keep_alive;
            pump_reader(&ctx, reader, sink).await;
        });
        stream
    }

    /// Next chunk in arrival order, `Ok(None)` once the producer is done.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(err)) => {
                self.finished = true;
                Err(err)
            }
            None => {
                self.finished = true;
                Ok(None)
            }
        }
    }

    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

pub(crate) async fn pump_reader<R>(ctx: &CallContext, mut reader: R, sink: AudioSink)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = ctx
            .run(async { reader.read(&mut buf).await.map_err(VoiceError::from) })
            .await;
        match read {
            Ok(0) => break,
            Ok(n) => {
                if !sink.send(Bytes::copy_from_slice(&buf[..n])).await {
                    break;
                }
            }
            Err(err) => {
                sink.fail(err).await;
                break;
            }
        }
    }
}

/// Where a synthesis turn currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Init,
    ConfigSent,
    RequestSent,
    Streaming,
    Done,
    Failed,
}

/// Turns a message-oriented synthesis connection into one ordered byte stream.
///
/// `begin` sends the configuration and markup messages, then hands the inbound
/// half to a background task that appends audio payloads to the returned
/// [`AudioStream`] until `turn.end`, an error, or cancellation.
#[derive(Debug, Clone)]
pub struct ProtocolDecoder {
    output_format: String,
    frame_timeout: Option<Duration>,
    capacity: usize,
}

impl ProtocolDecoder {
    pub fn new(output_format: impl Into<String>) -> Self {
        Self {
            output_format: output_format.into(),
            frame_timeout: None,
            capacity: 16,
        }
    }

    pub fn with_frame_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.frame_timeout = timeout;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub async fn begin<Si, St>(
        &self,
        ctx: &CallContext,
        mut outbound: Si,
        inbound: St,
        voice_name: &str,
        text: &str,
    ) -> Result<AudioStream>
    where
        Si: Sink<String> + Send + Unpin + 'static,
        Si::Error: Display,
        St: Stream<Item = Result<Frame>> + Send + Unpin + 'static,
    {
        let mut state = DecoderState::Init;

        let timestamp = protocol::timestamp();
        let config = protocol::speech_config_message(&self.output_format, &timestamp);
        send(ctx, &mut outbound, config, &mut state).await?;
        state = transition(state, DecoderState::ConfigSent);

        let request_id = protocol::request_id();
        let request = protocol::ssml_message(&request_id, &timestamp, voice_name, text);
        send(ctx, &mut outbound, request, &mut state).await?;
        state = transition(state, DecoderState::RequestSent);
        debug!(request_id = %request_id, voice = voice_name, "synthesis request sent");

        let (sink, stream) = audio_channel(self.capacity);
        let ctx = ctx.clone();
        let frame_timeout = self.frame_timeout;
        tokio::spawn(async move {
            let state = read_turn(&ctx, inbound, &sink, frame_timeout, state).await;
            drop(sink);
            debug!(request_id = %request_id, ?state, "synthesis turn finished");
            let _ = outbound.close().await;
        });
        Ok(stream)
    }
}

fn transition(from: DecoderState, to: DecoderState) -> DecoderState {
    debug!(?from, ?to, "decoder state");
    to
}

async fn send<Si>(
    ctx: &CallContext,
    outbound: &mut Si,
    message: String,
    state: &mut DecoderState,
) -> Result<()>
where
    Si: Sink<String> + Unpin,
    Si::Error: Display,
{
    let sent = ctx
        .run(async {
            outbound
                .send(message)
                .await
                .map_err(|e| VoiceError::StreamFailed(format!("send failed: {e}")))
        })
        .await;
    if sent.is_err() {
        *state = transition(*state, DecoderState::Failed);
    }
    sent
}

/// The inbound read loop. Runs until the turn ends, the connection fails,
/// the consumer disappears, or the context is cancelled.
async fn read_turn<St>(
    ctx: &CallContext,
    mut inbound: St,
    sink: &AudioSink,
    frame_timeout: Option<Duration>,
    state: DecoderState,
) -> DecoderState
where
    St: Stream<Item = Result<Frame>> + Unpin,
{
    let mut state = transition(state, DecoderState::Streaming);
    let mut audio_bytes = 0usize;

    loop {
        let next = ctx
            .run(async {
                match frame_timeout {
                    Some(limit) => tokio::time::timeout(limit, inbound.next())
                        .await
                        .map_err(|_| VoiceError::TimedOut),
                    None => Ok(inbound.next().await),
                }
            })
            .await;

        let frame = match next {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(err))) | Err(err) => {
                warn!(error = %err, "synthesis stream failed");
                state = transition(state, DecoderState::Failed);
                sink.clone().fail(err).await;
                return state;
            }
            Ok(None) => {
                state = transition(state, DecoderState::Failed);
                sink.clone()
                    .fail(VoiceError::StreamFailed(
                        "connection closed before end of turn".to_string(),
                    ))
                    .await;
                return state;
            }
        };

        match protocol::classify(&frame) {
            Inbound::Audio(payload) => {
                if payload.is_empty() {
                    continue;
                }
                audio_bytes += payload.len();
                if !sink.send(Bytes::copy_from_slice(payload)).await {
                    debug!("audio consumer dropped, abandoning turn");
                    return transition(state, DecoderState::Failed);
                }
            }
            Inbound::Skip => continue,
            Inbound::TurnEnd => {
                debug!(audio_bytes, "end of turn");
                return transition(state, DecoderState::Done);
            }
            Inbound::Closed => {
                state = transition(state, DecoderState::Failed);
                sink.clone()
                    .fail(VoiceError::StreamFailed(
                        "server closed the connection mid-turn".to_string(),
                    ))
                    .await;
                return state;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn audio(payload: &[u8]) -> Frame {
        let mut data = b"X-RequestId:1\r\nContent-Type:audio/mpeg\r\nPath:audio\r\n".to_vec();
        data.extend_from_slice(payload);
        Frame::Binary(data)
    }

    fn turn_end() -> Frame {
        Frame::Text("X-RequestId:1\r\nPath:turn.end\r\n\r\n{}".to_string())
    }

    fn frames(list: Vec<Frame>) -> impl Stream<Item = Result<Frame>> + Send + Unpin + 'static {
        stream::iter(list.into_iter().map(Ok))
    }

    fn outbound() -> futures_util::sink::Drain<String> {
        futures_util::sink::drain()
    }

    #[tokio::test]
    async fn test_emits_payload_after_marker() {
        let decoder = ProtocolDecoder::new("fmt");
        let ctx = CallContext::new();
        let inbound = frames(vec![audio(b"abc"), audio(b"def"), turn_end()]);
        let audio = decoder
            .begin(&ctx, outbound(), inbound, "voice", "hi")
            .await
            .unwrap();
        assert_eq!(audio.read_to_end().await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_frames_without_marker_are_skipped() {
        let decoder = ProtocolDecoder::new("fmt");
        let ctx = CallContext::new();
        let mut list = Vec::new();
        for _ in 0..10_000 {
            list.push(Frame::Binary(b"Path:audio.metadata\r\n{}".to_vec()));
            list.push(Frame::Text("Path:turn.start\r\n\r\n{}".to_string()));
        }
        list.push(audio(b"xyz"));
        list.push(turn_end());
        let audio = decoder
            .begin(&ctx, outbound(), frames(list), "voice", "hi")
            .await
            .unwrap();
        assert_eq!(audio.read_to_end().await.unwrap(), b"xyz");
    }

    #[tokio::test]
    async fn test_turn_end_stops_reading() {
        let decoder = ProtocolDecoder::new("fmt");
        let ctx = CallContext::new();
        let inbound = frames(vec![audio(b"one"), turn_end(), audio(b"late")]);
        let audio = decoder
            .begin(&ctx, outbound(), inbound, "voice", "hi")
            .await
            .unwrap();
        assert_eq!(audio.read_to_end().await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_sends_config_then_ssml() {
        let decoder = ProtocolDecoder::new("audio-24khz-48kbitrate-mono-mp3");
        let ctx = CallContext::new();
        let (tx, rx) = std::sync::mpsc::channel::<String>();
        let outbound = futures_util::sink::unfold(tx, |tx, msg: String| async move {
            tx.send(msg).map_err(|_| "receiver gone")?;
            Ok::<_, &'static str>(tx)
        });
        let audio = decoder
            .begin(
                &ctx,
                Box::pin(outbound),
                frames(vec![turn_end()]),
                "zh-CN-XiaoxiaoNeural",
                "a < b",
            )
            .await
            .unwrap();
        assert!(audio.read_to_end().await.unwrap().is_empty());

        let sent: Vec<String> = rx.try_iter().collect();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("Path:speech.config"));
        assert!(sent[0].contains("audio-24khz-48kbitrate-mono-mp3"));
        assert!(sent[1].contains("Path:ssml"));
        assert!(sent[1].contains("zh-CN-XiaoxiaoNeural"));
        assert!(sent[1].contains("a &lt; b"));
    }

    #[tokio::test]
    async fn test_read_error_reaches_consumer() {
        let decoder = ProtocolDecoder::new("fmt");
        let ctx = CallContext::new();
        let inbound = stream::iter(vec![
            Ok(audio(b"partial")),
            Err(VoiceError::StreamFailed("reset by peer".to_string())),
        ]);
        let mut audio = decoder
            .begin(&ctx, outbound(), inbound, "voice", "hi")
            .await
            .unwrap();
        assert_eq!(audio.next_chunk().await.unwrap().unwrap(), &b"partial"[..]);
        assert!(matches!(
            audio.next_chunk().await,
            Err(VoiceError::StreamFailed(_))
        ));
        assert!(audio.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_before_turn_end_fails() {
        let decoder = ProtocolDecoder::new("fmt");
        let ctx = CallContext::new();
        let audio = decoder
            .begin(&ctx, outbound(), frames(vec![audio(b"a")]), "voice", "hi")
            .await
            .unwrap();
        assert!(matches!(
            audio.read_to_end().await,
            Err(VoiceError::StreamFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_begin() {
        let decoder = ProtocolDecoder::new("fmt");
        let ctx = CallContext::new();
        ctx.cancel();
        let result = decoder
            .begin(&ctx, outbound(), frames(vec![turn_end()]), "voice", "hi")
            .await;
        assert!(matches!(result, Err(VoiceError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancelled_read_never_polls_connection() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let inbound = stream::poll_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::task::Poll::Ready(Some(Ok(turn_end())))
        });

        let ctx = CallContext::new();
        let (sink, stream) = audio_channel(4);
        ctx.cancel();
        let state = read_turn(&ctx, inbound, &sink, None, DecoderState::RequestSent).await;
        drop(sink);

        assert_eq!(state, DecoderState::Failed);
        assert_eq!(polls.load(Ordering::SeqCst), 0);
        assert!(matches!(stream.read_to_end().await, Err(VoiceError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_frame() {
        let decoder = ProtocolDecoder::new("fmt");
        let ctx = CallContext::new();
        let inbound = stream::pending::<Result<Frame>>();
        let audio = decoder
            .begin(&ctx, outbound(), inbound, "voice", "hi")
            .await
            .unwrap();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        assert!(matches!(
            audio.read_to_end().await,
            Err(VoiceError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_frame_timeout() {
        let decoder =
            ProtocolDecoder::new("fmt").with_frame_timeout(Some(Duration::from_millis(20)));
        let ctx = CallContext::new();
        let audio = decoder
            .begin(&ctx, outbound(), stream::pending::<Result<Frame>>(), "voice", "hi")
            .await
            .unwrap();
        assert!(matches!(audio.read_to_end().await, Err(VoiceError::TimedOut)));
    }

    #[tokio::test]
    async fn test_from_chunks_and_empty() {
        let stream =
            AudioStream::from_chunks(vec![Bytes::from_static(b"ab"), Bytes::from_static(b"c")]);
        assert_eq!(stream.read_to_end().await.unwrap(), b"abc");
        assert!(AudioStream::empty().read_to_end().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_from_reader_preserves_order() {
        let reader = tokio_test::io::Builder::new()
            .read(b"RIFF")
            .read(b"....")
            .read(b"WAVE")
            .build();
        let ctx = CallContext::new();
        let stream = AudioStream::from_reader(&ctx, reader, (), 2);
        assert_eq!(stream.read_to_end().await.unwrap(), b"RIFF....WAVE");
    }
}
