use crate::broadcast::types::{EngineStatus, WSEvent};
use crate::config::broadcast::TelegramConfig;
use crate::constants::{
    MAX_MESSAGE_LENGTH, NOTIFICATION_QUEUE_CAPACITY, NOTIFICATION_RETRY_ATTEMPTS,
    NOTIFICATION_RETRY_DELAY,
};
use crate::model::NotificationLevel;
use crate::reporter::{Admission, NotificationGate, Notifier};
use crate::risk::EmergencyStop;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Instant;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Telegram backend. Messages are queued to a worker task so a slow or
/// unreachable Telegram API never stalls the caller.
pub struct TelegramNotifier {
    queue: mpsc::Sender<String>,
    gate: NotificationGate,
}

impl TelegramNotifier {
    /// Starts the delivery worker, the status cache and the command handler.
    pub fn spawn(
        config: TelegramConfig,
        gate: NotificationGate,
        status_rx: broadcast::Receiver<WSEvent>,
        emergency: EmergencyStop,
    ) -> Result<(Self, JoinHandle<()>)> {
        let bot = Bot::new(config.bot_token);
        let chat_id = ChatId(config.chat_id.trim().parse::<i64>()?);
        let (queue, rx) = mpsc::channel(NOTIFICATION_QUEUE_CAPACITY);

        let last_status: Arc<Mutex<Option<EngineStatus>>> = Arc::new(Mutex::new(None));
        tokio::spawn(cache_status(status_rx, last_status.clone()));
        tokio::spawn(run_commands(bot.clone(), chat_id, last_status, emergency));

        info!("Telegram notifier initialized. Spawning delivery worker...");
        let worker = tokio::spawn(deliver(bot, chat_id, rx));

        Ok((Self { queue, gate }, worker))
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_message(&self, level: NotificationLevel, text: &str) -> Result<()> {
        match self.gate.admit(level, Instant::now()) {
            Admission::Deliver => {}
            Admission::LevelDisabled => return Ok(()),
            Admission::RateLimited => {
                warn!("[NOTIFY] Rate limit reached, dropping {} notification", level);
                return Ok(());
            }
        }
        self.queue
            .try_send(truncate(text, MAX_MESSAGE_LENGTH))
            .map_err(|e| anyhow!("Telegram queue rejected message: {}", e))
    }
}

/// Cuts `text` to at most `max_chars` characters without leaving a broken
/// HTML tag or entity behind. Tags left open by the cut are closed again.
fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut budget = max_chars.saturating_sub(3);
    loop {
        let mut out: String = text.chars().take(budget).collect();
        drop_partial_markup(&mut out);
        out.push_str("...");
        for tag in open_tags(&out).iter().rev() {
            out.push_str("</");
            out.push_str(tag);
            out.push('>');
        }
        let len = out.chars().count();
        if len <= max_chars || budget == 0 {
            return out;
        }
        budget = budget.saturating_sub(len - max_chars);
    }
}

/// Removes a trailing `<tag` or `&entity` the cut ran into.
fn drop_partial_markup(out: &mut String) {
    if let Some(open) = out.rfind('<') {
        if !out[open..].contains('>') {
            out.truncate(open);
        }
    }
    if let Some(amp) = out.rfind('&') {
        if !out[amp..].contains(';') {
            out.truncate(amp);
        }
    }
}

/// Names of the tags still open at the end of `html`, outermost first.
fn open_tags(html: &str) -> Vec<String> {
    let mut stack: Vec<String> = Vec::new();
    let mut rest = html;
    while let Some(start) = rest.find('<') {
        let Some(end) = rest[start..].find('>') else {
            break;
        };
        let inner = &rest[start + 1..start + end];
        if let Some(closing) = inner.strip_prefix('/') {
            let name = closing.trim();
            if let Some(pos) = stack.iter().rposition(|t| t == name) {
                stack.truncate(pos);
            }
        } else if let Some(name) = inner.split_whitespace().next() {
            stack.push(name.to_string());
        }
        rest = &rest[start + end + 1..];
    }
    stack
}

#[derive(Debug, PartialEq)]
enum Command<'a> {
    Status,
    Reset(&'a str),
}

/// Matches the first word exactly, so `/resetfoo` is not a reset. A
/// `@botname` suffix, as Telegram adds in groups, is ignored.
fn parse_command(text: &str) -> Option<Command<'_>> {
    let mut words = text.split_whitespace();
    let head = words.next()?;
    let name = head.split('@').next().unwrap_or(head);
    match name {
        "/status" => Some(Command::Status),
        "/reset" => Some(Command::Reset(words.next().unwrap_or(""))),
        _ => None,
    }
}

async fn deliver(bot: Bot, chat_id: ChatId, mut rx: mpsc::Receiver<String>) {
    info!("Telegram delivery worker started.");
    while let Some(text) = rx.recv().await {
        for attempt in 1..=NOTIFICATION_RETRY_ATTEMPTS {
            match bot
                .send_message(chat_id, text.clone())
                .parse_mode(ParseMode::Html)
                .await
            {
                Ok(_) => break,
                Err(e) if attempt < NOTIFICATION_RETRY_ATTEMPTS => {
                    warn!(
                        "Telegram delivery attempt {}/{} failed: {}",
                        attempt, NOTIFICATION_RETRY_ATTEMPTS, e
                    );
                    tokio::time::sleep(NOTIFICATION_RETRY_DELAY).await;
                }
                Err(e) => error!("Failed to send Telegram notification: {}", e),
            }
        }
    }
    info!("Telegram delivery worker stopped.");
}

async fn cache_status(
    receiver: broadcast::Receiver<WSEvent>,
    last_status: Arc<Mutex<Option<EngineStatus>>>,
) {
    let mut stream = BroadcastStream::new(receiver);
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(WSEvent::Status(status)) => {
                *last_status.lock().await = Some(status);
            }
            Ok(_) => {}
            Err(e) => warn!("Telegram status stream lagged: {}", e),
        }
    }
}

fn render_status(s: &EngineStatus) -> String {
    let state = if s.emergency_stop {
        "🛑 EMERGENCY STOP"
    } else if s.is_running {
        "🟢 Running"
    } else {
        "⚪ Stopped"
    };
    format!(
        "{} <b>{}</b>\n📉 Price: <code>{:.4}</code> (base <code>{:.4}</code>)\n📏 Grid: <code>{:.2}%</code> [{:.4} - {:.4}]\n🌊 Volatility: <code>{:.4}</code>\n💰 Profit: <code>{:.4}</code> over {} trades\n📋 Orders: {} | Levels occupied: {}\n⏱ Uptime: {}",
        state,
        s.symbol,
        s.current_price,
        s.base_price,
        s.grid_size,
        s.lower_band,
        s.upper_band,
        s.volatility,
        s.total_profit,
        s.trade_count,
        s.active_orders.len(),
        s.grid_levels_occupied,
        s.uptime
    )
}

/// `/status` and `/reset <token>`, accepted only from the configured chat.
async fn run_commands(
    bot: Bot,
    owner: ChatId,
    last_status: Arc<Mutex<Option<EngineStatus>>>,
    emergency: EmergencyStop,
) {
    let handler = Update::filter_message().endpoint(move |bot: Bot, msg: Message| {
        let status_lock = last_status.clone();
        let emergency = emergency.clone();
        async move {
            if msg.chat.id != owner {
                return respond(());
            }
            let Some(text) = msg.text() else {
                return respond(());
            };

            match parse_command(text) {
                Some(Command::Status) => {
                    let reply = match &*status_lock.lock().await {
                        Some(s) => render_status(s),
                        None => "⚠️ No status available yet.".to_string(),
                    };
                    bot.send_message(msg.chat.id, reply)
                        .parse_mode(ParseMode::Html)
                        .await?;
                }
                Some(Command::Reset(token)) => {
                    let reply = match emergency.reset(token) {
                        Ok(()) => "✅ Emergency stop cleared. Trading resumes.".to_string(),
                        Err(e) => format!("❌ Reset refused: {}", e),
                    };
                    bot.send_message(msg.chat.id, reply).await?;
                }
                None => {}
            }
            respond(())
        }
    });

    Dispatcher::builder(bot, handler)
        .build()
        .dispatch()
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_limit() {
        let long = "x".repeat(5000);
        let out = truncate(&long, MAX_MESSAGE_LENGTH);
        assert_eq!(out.chars().count(), MAX_MESSAGE_LENGTH);
        assert!(out.ends_with("..."));
        assert_eq!(truncate("short", MAX_MESSAGE_LENGTH), "short");
    }

    #[test]
    fn test_truncate_never_splits_markup() {
        let filler = "a".repeat(MAX_MESSAGE_LENGTH - 5);

        let tag = format!("{}<code>{}</code>", filler, "z".repeat(100));
        let out = truncate(&tag, MAX_MESSAGE_LENGTH);
        assert!(out.chars().count() <= MAX_MESSAGE_LENGTH);
        assert!(!out.contains('<'));
        assert!(out.ends_with("a..."));

        let entity = format!("{}&amp;{}", filler, "z".repeat(100));
        let out = truncate(&entity, MAX_MESSAGE_LENGTH);
        assert!(!out.contains('&'));
        assert!(out.ends_with("a..."));
    }

    #[test]
    fn test_truncate_closes_open_tags() {
        let text = format!("<b>Alert</b>\n<pre>{}</pre>", "x".repeat(5000));
        let out = truncate(&text, MAX_MESSAGE_LENGTH);
        assert!(out.chars().count() <= MAX_MESSAGE_LENGTH);
        assert!(out.ends_with("...</pre>"));
        assert!(open_tags(&out).is_empty());
        assert_eq!(open_tags("<b>x</b><a href=\"u\">y"), vec!["a".to_string()]);
    }

    #[test]
    fn test_parse_command_matches_whole_word() {
        assert_eq!(parse_command("/status"), Some(Command::Status));
        assert_eq!(parse_command("/status@grid_bot"), Some(Command::Status));
        assert_eq!(parse_command("/reset secret"), Some(Command::Reset("secret")));
        assert_eq!(parse_command("  /reset   secret  "), Some(Command::Reset("secret")));
        assert_eq!(parse_command("/reset"), Some(Command::Reset("")));
        assert_eq!(parse_command("/resetsecret"), None);
        assert_eq!(parse_command("/resetting now"), None);
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn test_render_status_flags_emergency() {
        let status = EngineStatus {
            symbol: "BNB/USDT".to_string(),
            emergency_stop: true,
            ..EngineStatus::default()
        };
        assert!(render_status(&status).contains("EMERGENCY STOP"));
    }
}
