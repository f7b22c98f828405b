use serde::{Deserialize, Serialize};

/// Risk limits. Drawdown and daily loss are negative fractions (-0.15 = -15%).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RiskConfig {
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: f64,
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: f64,
    #[serde(default = "default_max_position_ratio")]
    pub max_position_ratio: f64,
    #[serde(default = "default_min_position_ratio")]
    pub min_position_ratio: f64,
    /// Seconds between risk evaluations.
    #[serde(default = "default_risk_check_interval")]
    pub risk_check_interval: u64,
    /// Token required to clear an emergency stop. Usually supplied via `RISK_RESET_TOKEN`.
    #[serde(default, skip_serializing)]
    pub reset_token: Option<String>,
}

fn default_max_drawdown() -> f64 {
    -0.15
}

fn default_daily_loss_limit() -> f64 {
    -0.05
}

fn default_max_position_ratio() -> f64 {
    0.9
}

fn default_min_position_ratio() -> f64 {
    0.1
}

fn default_risk_check_interval() -> u64 {
    300
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown: default_max_drawdown(),
            daily_loss_limit: default_daily_loss_limit(),
            max_position_ratio: default_max_position_ratio(),
            min_position_ratio: default_min_position_ratio(),
            risk_check_interval: default_risk_check_interval(),
            reset_token: None,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_drawdown > 0.0 {
            return Err(anyhow::anyhow!(
                "max_drawdown {} must be zero or negative.",
                self.max_drawdown
            ));
        }
        if self.daily_loss_limit > 0.0 {
            return Err(anyhow::anyhow!(
                "daily_loss_limit {} must be zero or negative.",
                self.daily_loss_limit
            ));
        }
        for (name, ratio) in [
            ("max_position_ratio", self.max_position_ratio),
            ("min_position_ratio", self.min_position_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(anyhow::anyhow!("{} {} must be within [0, 1].", name, ratio));
            }
        }
        if self.min_position_ratio >= self.max_position_ratio {
            return Err(anyhow::anyhow!(
                "min_position_ratio {} must be less than max_position_ratio {}.",
                self.min_position_ratio,
                self.max_position_ratio
            ));
        }
        if self.risk_check_interval == 0 {
            return Err(anyhow::anyhow!("risk_check_interval must be positive."));
        }
        Ok(())
    }
}
