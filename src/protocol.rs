//! Framing for the cloud synthesis connection.
//!
//! Every outbound message is a text frame laid out as `Header-lines\r\n\r\nBody`.
//! Inbound audio arrives in binary frames whose textual header block ends with
//! `Path:audio\r\n`; everything after that marker is raw audio. The turn is over
//! once a text frame carrying `Path:turn.end` shows up.

use chrono::Utc;

pub const AUDIO_MARKER: &[u8] = b"Path:audio\r\n";
pub const TURN_END_MARKER: &str = "Path:turn.end";

/// One inbound message, detached from the websocket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
    Close,
    /// Ping, pong and other transport-level frames.
    Control,
}

/// What a single inbound frame means for the audio stream.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    Audio(&'a [u8]),
    Skip,
    TurnEnd,
    Closed,
}

pub fn classify(frame: &Frame) -> Inbound<'_> {
    match frame {
        Frame::Binary(data) => match find(data, AUDIO_MARKER) {
            Some(at) => Inbound::Audio(&data[at + AUDIO_MARKER.len()..]),
            None => Inbound::Skip,
        },
        Frame::Text(text) if text.contains(TURN_END_MARKER) => Inbound::TurnEnd,
        Frame::Text(_) | Frame::Control => Inbound::Skip,
        Frame::Close => Inbound::Closed,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Timestamp in the JavaScript `Date.toString()` shape the endpoint expects.
pub fn timestamp() -> String {
    Utc::now()
        .format("%a %b %d %Y %H:%M:%S GMT+0000 (Coordinated Universal Time)")
        .to_string()
}

pub fn request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn speech_config_message(output_format: &str, timestamp: &str) -> String {
    let body = serde_json::json!({
        "context": {
            "synthesis": {
                "audio": {
                    "metadataoptions": {
                        "sentenceBoundaryEnabled": "false",
                        "wordBoundaryEnabled": "true"
                    },
                    "outputFormat": output_format
                }
            }
        }
    });
    format!(
        "X-Timestamp:{timestamp}\r\nContent-Type:application/json; charset=utf-8\r\nPath:speech.config\r\n\r\n{body}\r\n"
    )
}

pub fn ssml_message(request_id: &str, timestamp: &str, voice_name: &str, text: &str) -> String {
    let ssml = build_ssml(voice_name, text);
    format!(
        "X-RequestId:{request_id}\r\nContent-Type:application/ssml+xml\r\nX-Timestamp:{timestamp}Z\r\nPath:ssml\r\n\r\n{ssml}"
    )
}

pub fn build_ssml(voice_name: &str, text: &str) -> String {
    let voice_name = escape_xml(voice_name);
    let text = escape_xml(text);
    format!(
        "<speak version='1.0' xmlns='http://www.w3.org/2001/10/synthesis' xml:lang='en-US'>\
<voice name='{voice_name}'><prosody pitch='+0Hz' rate='+0%' volume='+0%'>{text}</prosody></voice></speak>"
    )
}

pub fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_frame(payload: &[u8]) -> Frame {
        let mut data =
            b"\x00\x80X-RequestId:abc\r\nContent-Type:audio/mpeg\r\nPath:audio\r\n".to_vec();
        data.extend_from_slice(payload);
        Frame::Binary(data)
    }

    #[test]
    fn test_audio_payload_follows_marker() {
        let frame = audio_frame(b"\xff\xf3mp3-bytes");
        assert_eq!(classify(&frame), Inbound::Audio(b"\xff\xf3mp3-bytes"));
    }

    #[test]
    fn test_marker_only_frame_is_empty_audio() {
        let frame = audio_frame(b"");
        assert_eq!(classify(&frame), Inbound::Audio(b""));
    }

    #[test]
    fn test_binary_without_marker_is_skipped() {
        let frame = Frame::Binary(b"X-RequestId:abc\r\nPath:audio.metadata\r\n{}".to_vec());
        assert_eq!(classify(&frame), Inbound::Skip);
    }

    #[test]
    fn test_turn_end_text_frame() {
        let frame = Frame::Text("X-RequestId:abc\r\nPath:turn.end\r\n\r\n{}".to_string());
        assert_eq!(classify(&frame), Inbound::TurnEnd);

        let start = Frame::Text("X-RequestId:abc\r\nPath:turn.start\r\n\r\n{}".to_string());
        assert_eq!(classify(&start), Inbound::Skip);
    }

    #[test]
    fn test_close_and_control() {
        assert_eq!(classify(&Frame::Close), Inbound::Closed);
        assert_eq!(classify(&Frame::Control), Inbound::Skip);
    }

    #[test]
    fn test_config_message_layout() {
        let msg = speech_config_message("audio-24khz-48kbitrate-mono-mp3", "now");
        let (headers, body) = msg.split_once("\r\n\r\n").unwrap();
        assert!(headers.contains("Path:speech.config"));
        assert!(headers.contains("Content-Type:application/json"));
        let json: serde_json::Value = serde_json::from_str(body.trim_end()).unwrap();
        assert_eq!(
            json["context"]["synthesis"]["audio"]["outputFormat"],
            "audio-24khz-48kbitrate-mono-mp3"
        );
    }

    #[test]
    fn test_ssml_message_escapes_text() {
        let msg = ssml_message("req1", "now", "zh-CN-XiaoxiaoNeural", "Tom & <Jerry>");
        let (headers, body) = msg.split_once("\r\n\r\n").unwrap();
        assert!(headers.starts_with("X-RequestId:req1\r\n"));
        assert!(headers.contains("Content-Type:application/ssml+xml"));
        assert!(headers.ends_with("Path:ssml"));
        assert!(body.contains("<voice name='zh-CN-XiaoxiaoNeural'>"));
        assert!(body.contains("Tom &amp; &lt;Jerry&gt;"));
    }

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml("plain"), "plain");
        assert_eq!(escape_xml("it's \"quoted\""), "it&apos;s &quot;quoted&quot;");
        assert_eq!(escape_xml(""), "");
    }

    #[test]
    fn test_request_ids_are_unique_hex() {
        let a = request_id();
        let b = request_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
