//! MessageCodec - TaskEnvelope と broker メッセージ本体の相互変換
//!
//! Wire format is JSON only. Anything else (pickle, msgpack, ...) is refused
//! before it can reach the queue.

use crate::domain::{ContentType, MessageBody, TaskEnvelope};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("content type '{0}' is not accepted")]
    UnsupportedContentType(ContentType),

    #[error("malformed message body: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct MessageCodec {
    accept: Vec<ContentType>,
}

impl MessageCodec {
    /// Codec accepting only `application/json`.
    pub fn json() -> Self {
        Self {
            accept: vec![ContentType::Json],
        }
    }

    /// Codec restricted to the given content types. Only JSON can actually be
    /// decoded, so listing anything else just means it will fail as malformed.
    pub fn with_accept(accept: Vec<ContentType>) -> Self {
        Self { accept }
    }

    pub fn accepts(&self, content_type: &ContentType) -> bool {
        self.accept.contains(content_type)
    }

    pub fn encode(&self, envelope: &TaskEnvelope) -> Result<MessageBody, CodecError> {
        let bytes = serde_json::to_vec(envelope)?;
        Ok(MessageBody::new(ContentType::Json, bytes))
    }

    pub fn decode(&self, body: &MessageBody) -> Result<TaskEnvelope, CodecError> {
        if !self.accepts(&body.content_type) || body.content_type != ContentType::Json {
            return Err(CodecError::UnsupportedContentType(body.content_type.clone()));
        }
        Ok(serde_json::from_slice(&body.bytes)?)
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::json()
    }
}
