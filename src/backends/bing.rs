//! Cloud voices from the Edge "read aloud" endpoint.

use super::{AudioSource, SpeechBackend, VoiceCatalog, VoiceDescriptor, VoiceFilter};
use crate::context::CallContext;
use crate::error::{Result, VoiceError};
use crate::protocol::Frame;
use crate::stream::{AudioStream, ProtocolDecoder};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, ORIGIN, USER_AGENT};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info};

pub const VOICE_LIST_URL: &str = "https://speech.platform.bing.com/consumer/speech/synthesize/readaloud/voices/list?trustedclienttoken=6A5AA1D4EAFF4E9FB37E23D68491D6F4";
pub const SYNTHESIS_URL: &str = "wss://speech.platform.bing.com/consumer/speech/synthesize/readaloud/edge/v1?TrustedClientToken=6A5AA1D4EAFF4E9FB37E23D68491D6F4";
pub const DEFAULT_OUTPUT_FORMAT: &str = "audio-24khz-48kbitrate-mono-mp3";

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36 Edg/130.0.0.0";
const EXTENSION_ORIGIN: &str = "chrome-extension://jdiccldimpdaibmpdkjnbmckianbfold";

/// One entry of the voice-list endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BingVoiceItem {
    pub name: String,
    pub short_name: String,
    #[serde(default)]
    pub gender: String,
    pub locale: String,
    #[serde(default)]
    pub suggested_codec: String,
    #[serde(default)]
    pub friendly_name: String,
    #[serde(default)]
    pub status: String,
}

impl From<BingVoiceItem> for VoiceDescriptor {
    fn from(item: BingVoiceItem) -> Self {
        let last = item.short_name.rsplit('-').next().unwrap_or(&item.short_name);
        let display_name = last.strip_suffix("Neural").unwrap_or(last).to_string();

        let mut metadata = BTreeMap::new();
        metadata.insert("ShortName".to_string(), item.short_name.clone());
        metadata.insert("Gender".to_string(), item.gender);
        metadata.insert("SuggestedCodec".to_string(), item.suggested_codec);
        metadata.insert("Status".to_string(), item.status);

        VoiceDescriptor {
            internal_name: item.name,
            display_name,
            language: item.locale.replace('_', "-"),
            detail: item.friendly_name,
            metadata,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BingConfig {
    pub voice_list_url: String,
    pub synthesis_url: String,
    pub output_format: String,
    pub connect_timeout: Duration,
    pub frame_timeout: Option<Duration>,
    pub stream_buffer_chunks: usize,
}

impl Default for BingConfig {
    fn default() -> Self {
        Self {
            voice_list_url: VOICE_LIST_URL.to_string(),
            synthesis_url: SYNTHESIS_URL.to_string(),
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            connect_timeout: Duration::from_secs(10),
            frame_timeout: Some(Duration::from_secs(30)),
            stream_buffer_chunks: 16,
        }
    }
}

pub struct BingBackend {
    client: reqwest::Client,
    config: BingConfig,
    decoder: ProtocolDecoder,
    catalog: VoiceCatalog,
}

impl BingBackend {
    pub fn new(config: BingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(BROWSER_UA)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| VoiceError::ConnectionFailed {
                status: None,
                reason: format!("http client: {e}"),
            })?;
        let decoder = ProtocolDecoder::new(config.output_format.clone())
            .with_frame_timeout(config.frame_timeout)
            .with_capacity(config.stream_buffer_chunks);
        Ok(Self {
            client,
            config,
            decoder,
            catalog: VoiceCatalog::new("bing"),
        })
    }

    async fn fetch_voices(&self, ctx: &CallContext) -> Result<Vec<VoiceDescriptor>> {
        let failed = |reason: String| VoiceError::EnumerationFailed {
            backend: "bing",
            reason,
        };

        let request = self.client.get(&self.config.voice_list_url).send();
        let response = ctx
            .run(async {
                request
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| failed(e.to_string()))
            })
            .await?;
        let items: Vec<BingVoiceItem> = ctx
            .run(async {
                response
                    .json()
                    .await
                    .map_err(|e| failed(format!("invalid voice list: {e}")))
            })
            .await?;

        Ok(items.into_iter().map(VoiceDescriptor::from).collect())
    }

    fn synthesis_request(&self) -> Result<tungstenite::handshake::client::Request> {
        let url = format!(
            "{}&ConnectionId={}",
            self.config.synthesis_url,
            crate::protocol::request_id()
        );
        let mut request = url
            .into_client_request()
            .map_err(|e| VoiceError::ConnectionFailed {
                status: None,
                reason: format!("invalid synthesis url: {e}"),
            })?;
        let headers = request.headers_mut();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_UA));
        headers.insert(ORIGIN, HeaderValue::from_static(EXTENSION_ORIGIN));
        headers.insert("Pragma", HeaderValue::from_static("no-cache"));
        headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
        Ok(request)
    }
}

fn connection_failed(err: tungstenite::Error) -> VoiceError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            VoiceError::ConnectionFailed {
                status: Some(status.as_u16()),
                reason: format!("handshake rejected with {status}"),
            }
        }
        other => VoiceError::ConnectionFailed {
            status: None,
            reason: other.to_string(),
        },
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Binary(data) => Frame::Binary(data.to_vec()),
            Message::Text(text) => Frame::Text(text.as_str().to_owned()),
            Message::Close(_) => Frame::Close,
            _ => Frame::Control,
        }
    }
}

#[async_trait]
impl AudioSource for BingBackend {
    async fn open_stream(
        &self,
        ctx: &CallContext,
        voice: &VoiceDescriptor,
        text: &str,
    ) -> Result<AudioStream> {
        let request = self.synthesis_request()?;
        let connect_timeout = self.config.connect_timeout;
        debug!(voice = %voice.internal_name, "dialing synthesis endpoint");

        let (socket, _response) = ctx
            .run(async {
                let handshake = tokio_tungstenite::connect_async(request);
                tokio::time::timeout(connect_timeout, handshake)
                    .await
                    .map_err(|_| VoiceError::TimedOut)?
                    .map_err(connection_failed)
            })
            .await?;

        let (outbound, inbound) = socket.split();
        let outbound = outbound.with(|text: String| async move {
            Ok::<_, tungstenite::Error>(Message::text(text))
        });
        let inbound = inbound.map(|message| {
            message
                .map(Frame::from)
                .map_err(|e| VoiceError::StreamFailed(e.to_string()))
        });

        self.decoder
            .begin(
                ctx,
                Box::pin(outbound),
                inbound,
                &voice.internal_name,
                text,
            )
            .await
    }
}

#[async_trait]
impl SpeechBackend for BingBackend {
    fn id(&self) -> &'static str {
        "bing"
    }

    async fn list_voices(
        &self,
        ctx: &CallContext,
        filter: &VoiceFilter,
    ) -> Result<Vec<VoiceDescriptor>> {
        self.catalog
            .list(ctx, filter, || async {
                let voices = self.fetch_voices(ctx).await?;
                info!(count = voices.len(), "fetched cloud voice list");
                Ok::<_, VoiceError>(voices)
            })
            .await
    }
}
