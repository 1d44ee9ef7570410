//! Message bus event types.
//!
//! Defines the messages that flow between chat transports and the bridge.

/// An inbound message from a chat transport.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Source channel identifier (e.g., "telegram").
    pub channel: String,
    /// Chat/conversation identifier within the channel.
    pub chat_id: String,
    /// User identifier.
    pub user_id: String,
    /// Message text content.
    pub content: String,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            user_id: user_id.into(),
            content: content.into(),
        }
    }

    /// Key under which the bridge remembers this chat's thread.
    pub fn chat_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// An outbound message from the bridge to a chat transport.
///
/// - `Reply` : text to deliver, always rendered.
/// - `Typing`: show a "typing…" indicator (best-effort, ignore if unsupported).
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Reply {
        channel: String,
        chat_id: String,
        content: String,
    },
    Typing {
        channel: String,
        chat_id: String,
    },
}

impl OutboundMessage {
    pub fn reply(channel: impl Into<String>, chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Reply {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
        }
    }

    pub fn typing(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self::Typing {
            channel: channel.into(),
            chat_id: chat_id.into(),
        }
    }

    /// Extract the channel name regardless of variant.
    pub fn channel(&self) -> &str {
        match self {
            Self::Reply { channel, .. } | Self::Typing { channel, .. } => channel,
        }
    }

    /// Extract the chat_id regardless of variant.
    pub fn chat_id(&self) -> &str {
        match self {
            Self::Reply { chat_id, .. } | Self::Typing { chat_id, .. } => chat_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_variant() {
        let msg = OutboundMessage::reply("telegram", "chat123", "Hello!");
        assert_eq!(msg.channel(), "telegram");
        assert_eq!(msg.chat_id(), "chat123");
        assert!(matches!(msg, OutboundMessage::Reply { content, .. } if content == "Hello!"));
    }

    #[test]
    fn test_typing_variant() {
        let msg = OutboundMessage::typing("telegram", "chat123");
        assert_eq!(msg.channel(), "telegram");
        assert!(matches!(msg, OutboundMessage::Typing { .. }));
    }

    #[test]
    fn test_chat_key() {
        let msg = InboundMessage::new("telegram", "-100", "42", "hi");
        assert_eq!(msg.chat_key(), "telegram:-100");
    }
}
