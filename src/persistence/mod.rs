//! State persistence.
//!
//! The controller only needs the load/save contract in [`StateStore`]. The
//! JSON store writes the state file atomically and keeps numbered backups;
//! trades go to an append-only CSV.

pub mod trade_log;

use crate::config::DataConfig;
use crate::constants::LEVEL_REBUILD_THRESHOLD;
use crate::model::TradeRecord;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use trade_log::TradeLog;

/// Controller state that survives restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub base_price: f64,
    #[serde(default)]
    pub current_price: f64,
    pub grid_size: f64,
    #[serde(default)]
    pub last_adjustment_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub volatility: f64,
    #[serde(default)]
    pub total_profit: f64,
    #[serde(default)]
    pub trade_count: u64,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

pub trait StateStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet.
    fn load_state(&self) -> Result<Option<PersistedState>>;

    fn save_state(&self, state: &PersistedState) -> Result<()>;

    fn save_trade(&self, trade: &TradeRecord) -> Result<()>;

    /// Newest `limit` trades, oldest first.
    fn trade_history(&self, limit: usize) -> Result<Vec<TradeRecord>>;
}

pub struct JsonStateStore {
    state_path: PathBuf,
    backup_count: usize,
    history_limit: usize,
    trades: TradeLog,
}

impl JsonStateStore {
    pub fn new(config: &DataConfig) -> Result<Self> {
        let state_path = PathBuf::from(&config.state_file);
        if let Some(dir) = state_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).context("Failed to create state directory")?;
        }
        Ok(Self {
            state_path,
            backup_count: config.backup_count,
            history_limit: config.history_limit,
            trades: TradeLog::open(&config.trades_file)?,
        })
    }

    fn backup_path(&self, n: usize) -> PathBuf {
        let mut name = self.state_path.as_os_str().to_owned();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    /// Shifts `state.json.1..N` up by one and copies the current file to `.1`.
    fn rotate_backups(&self) -> Result<()> {
        if self.backup_count == 0 || !self.state_path.exists() {
            return Ok(());
        }
        let oldest = self.backup_path(self.backup_count);
        if oldest.exists() {
            fs::remove_file(&oldest).context("Failed to drop oldest state backup")?;
        }
        for n in (1..self.backup_count).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                fs::rename(&from, self.backup_path(n + 1))
                    .context("Failed to rotate state backup")?;
            }
        }
        fs::copy(&self.state_path, self.backup_path(1)).context("Failed to back up state")?;
        Ok(())
    }
}

fn write_atomically(path: &Path, contents: &str) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

impl StateStore for JsonStateStore {
    fn load_state(&self) -> Result<Option<PersistedState>> {
        if !self.state_path.exists() {
            debug!("[PERSIST] No state file at {}", self.state_path.display());
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.state_path)
            .with_context(|| format!("Failed to read {}", self.state_path.display()))?;
        let state: PersistedState =
            serde_json::from_str(&raw).context("State file is not valid JSON")?;
        info!(
            "[PERSIST] Loaded state: base={:.4} grid={:.2}% profit={:.4} trades={}",
            state.base_price, state.grid_size, state.total_profit, state.trade_count
        );
        Ok(Some(state))
    }

    fn save_state(&self, state: &PersistedState) -> Result<()> {
        if let Err(e) = self.rotate_backups() {
            warn!("[PERSIST] Backup rotation failed: {:#}", e);
        }
        let json = serde_json::to_string_pretty(state)?;
        write_atomically(&self.state_path, &json)?;
        debug!("[PERSIST] State saved to {}", self.state_path.display());
        Ok(())
    }

    fn save_trade(&self, trade: &TradeRecord) -> Result<()> {
        self.trades.append(trade)
    }

    fn trade_history(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        self.trades.read_recent(limit.min(self.history_limit))
    }
}

/// Reads through to another store but keeps every write in memory. Used by
/// dry runs so a preview never touches the live state or trade log.
pub struct DryRunStore<S> {
    inner: S,
    state: Mutex<Option<PersistedState>>,
    trades: Mutex<Vec<TradeRecord>>,
}

impl<S: StateStore> DryRunStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            state: Mutex::new(None),
            trades: Mutex::new(Vec::new()),
        }
    }
}

impl<S: StateStore> StateStore for DryRunStore<S> {
    fn load_state(&self) -> Result<Option<PersistedState>> {
        let local = self
            .state
            .lock()
            .map_err(|_| anyhow!("dry-run state lock poisoned"))?
            .clone();
        match local {
            Some(state) => Ok(Some(state)),
            None => self.inner.load_state(),
        }
    }

    fn save_state(&self, state: &PersistedState) -> Result<()> {
        *self
            .state
            .lock()
            .map_err(|_| anyhow!("dry-run state lock poisoned"))? = Some(state.clone());
        Ok(())
    }

    fn save_trade(&self, trade: &TradeRecord) -> Result<()> {
        self.trades
            .lock()
            .map_err(|_| anyhow!("dry-run trade lock poisoned"))?
            .push(trade.clone());
        Ok(())
    }

    fn trade_history(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let mut history = self.inner.trade_history(limit)?;
        let local = self
            .trades
            .lock()
            .map_err(|_| anyhow!("dry-run trade lock poisoned"))?;
        history.extend(local.iter().cloned());
        let skip = history.len().saturating_sub(limit);
        Ok(history.split_off(skip))
    }
}

/// A configured base price replaces the persisted one only when it differs by
/// more than the rebuild threshold; smaller differences are noise.
pub fn resolve_base_price(configured: f64, persisted: f64) -> f64 {
    if configured > 0.0 && (persisted <= 0.0 || (configured - persisted).abs() > LEVEL_REBUILD_THRESHOLD)
    {
        configured
    } else {
        persisted
    }
}
