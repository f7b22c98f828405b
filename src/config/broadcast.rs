use crate::config::read_env_or_file;
use crate::model::NotificationLevel;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;

/// Which notifications are delivered and how fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Notifier backend: "log" or "telegram". "auto" picks telegram when credentials exist.
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default = "default_levels")]
    pub levels: Vec<NotificationLevel>,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: usize,
}

fn default_channel() -> String {
    "auto".to_string()
}

fn default_levels() -> Vec<NotificationLevel> {
    vec![
        NotificationLevel::Trade,
        NotificationLevel::Risk,
        NotificationLevel::System,
        NotificationLevel::Error,
    ]
}

fn default_rate_limit_per_minute() -> usize {
    10
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            levels: default_levels(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
        }
    }
}

impl NotificationConfig {
    pub fn validate(&self) -> Result<()> {
        match self.channel.as_str() {
            "auto" | "log" | "telegram" => {}
            other => {
                return Err(anyhow::anyhow!(
                    "Unknown notification channel '{}'. Expected auto, log or telegram.",
                    other
                ))
            }
        }
        if self.rate_limit_per_minute == 0 {
            return Err(anyhow::anyhow!("rate_limit_per_minute must be positive."));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsocketConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    pub websocket: Option<WebsocketConfig>,
    pub telegram: Option<TelegramConfig>,
}

/// WebSocket status server and Telegram credentials from the environment.
///
/// The status server is enabled when `--ws-port` or `WS_PORT` is given.
pub fn load_broadcast_config(cli_ws_port: Option<u16>) -> Result<BroadcastConfig> {
    let port = match cli_ws_port {
        Some(p) => Some(p),
        None => match env::var("WS_PORT") {
            Ok(raw) => Some(
                raw.parse::<u16>()
                    .with_context(|| format!("WS_PORT '{}' is not a valid port", raw))?,
            ),
            Err(_) => None,
        },
    };

    let websocket = port.map(|port| WebsocketConfig {
        port,
        host: env::var("WS_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
    });

    let telegram = if let Ok(raw_path) = env::var("TELEGRAM_CONFIG_FILE") {
        let path = match (raw_path.strip_prefix("~/"), env::var("HOME")) {
            (Some(rest), Ok(home)) => format!("{}/{}", home, rest),
            _ => raw_path,
        };
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read TELEGRAM_CONFIG_FILE at {}", path))?;
        Some(
            serde_json::from_str(&content)
                .context("Failed to parse TELEGRAM_CONFIG_FILE as JSON")?,
        )
    } else {
        match (
            read_env_or_file("TELEGRAM_BOT_TOKEN").ok(),
            read_env_or_file("TELEGRAM_CHAT_ID").ok(),
        ) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramConfig { bot_token, chat_id }),
            _ => None,
        }
    };

    Ok(BroadcastConfig {
        websocket,
        telegram,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_defaults() {
        let config: NotificationConfig = toml::from_str("").unwrap();
        assert_eq!(config.levels.len(), 4);
        assert_eq!(config.rate_limit_per_minute, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_levels_parse_lowercase() {
        let config: NotificationConfig =
            toml::from_str("levels = [\"risk\", \"error\"]\nchannel = \"log\"").unwrap();
        assert_eq!(
            config.levels,
            vec![NotificationLevel::Risk, NotificationLevel::Error]
        );
    }

    #[test]
    fn test_unknown_channel_rejected() {
        let config = NotificationConfig {
            channel: "email".to_string(),
            ..NotificationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_port_enables_websocket() {
        let config = load_broadcast_config(Some(9100)).unwrap();
        let ws = config.websocket.unwrap();
        assert_eq!(ws.port, 9100);
    }
}
