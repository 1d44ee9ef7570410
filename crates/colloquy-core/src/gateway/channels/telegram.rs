use anyhow::Result;
use std::sync::Arc;
use teloxide::payloads::SendMessageSetters;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ParseMode};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::events::{InboundMessage, OutboundMessage};
use crate::bus::MessageBus;
use crate::gateway::utils::reply_parts;

/// Maximum Telegram message length.
const TELEGRAM_MAX_LEN: usize = 4096;

pub struct TelegramTransport {
    token: String,
    bus: Arc<MessageBus>,
    allow_from: Vec<String>,
}

impl TelegramTransport {
    pub fn new(token: String, bus: Arc<MessageBus>, allow_from: Vec<String>) -> Self {
        Self {
            token,
            bus,
            allow_from,
        }
    }

    /// Poll Telegram until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let bot = Bot::new(&self.token);

        info!("Telegram transport started");

        // Subscribe to outbound messages FIRST (before dispatcher starts)
        {
            let bot_out = bot.clone();
            self.bus
                .subscribe_outbound("telegram", move |msg| {
                    let bot_out = bot_out.clone();
                    async move { deliver(&bot_out, msg).await }
                })
                .await;
        }

        // Set up inbound update handler
        let bus = Arc::clone(&self.bus);
        let allow_from = self.allow_from.clone();
        let handler = Update::filter_message().endpoint(
            move |msg: Message, bus: Arc<MessageBus>, allow_from: Vec<String>| async move {
                let user_id = msg
                    .from
                    .as_ref()
                    .map(|u| u.id.to_string())
                    .unwrap_or_else(|| "unknown".to_owned());

                // Enforce allowFrom ACL
                if !allow_from.is_empty() && !allow_from.contains(&user_id) {
                    warn!(
                        user_id = %user_id,
                        chat_id = %msg.chat.id,
                        "Rejected message from user not in allowFrom list"
                    );
                    return respond(());
                }

                if let Some(text) = msg.text() {
                    let inbound =
                        InboundMessage::new("telegram", msg.chat.id.to_string(), user_id, text);
                    if let Err(e) = bus.inbound_sender().send(inbound).await {
                        error!("Failed to send inbound message to bus: {}", e);
                    }
                }
                respond(())
            },
        );

        let mut dispatcher = Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![bus, allow_from])
            .build();
        let stopper = dispatcher.shutdown_token();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            if let Ok(done) = stopper.shutdown() {
                done.await;
            }
        });
        dispatcher.dispatch().await;

        info!("Telegram transport stopped");
        Ok(())
    }
}

async fn deliver(bot: &Bot, msg: OutboundMessage) {
    let Ok(chat_id) = msg.chat_id().parse::<i64>() else {
        warn!(chat_id = msg.chat_id(), "Outbound message for a non-numeric chat id");
        return;
    };
    let chat = ChatId(chat_id);

    match msg {
        OutboundMessage::Typing { .. } => {
            // Best-effort indicator.
            let _ = bot.send_chat_action(chat, ChatAction::Typing).await;
        }
        OutboundMessage::Reply { content, .. } => {
            for part in reply_parts(&content, TELEGRAM_MAX_LEN) {
                let request = bot.send_message(chat, part.render());
                let sent = if part.is_code() {
                    request.parse_mode(ParseMode::MarkdownV2).await
                } else {
                    request.await
                };
                if let Err(e) = sent {
                    error!("Failed to send Telegram message: {}", e);
                }
            }
        }
    }
}
