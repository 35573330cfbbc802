use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::Backoff;

/// Multiplexer tunables (lives under `[multiplexer]` in config.toml).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MuxConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Proportional reconnect jitter; 0 disables it.
    #[serde(default)]
    pub jitter: f64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter: 0.0,
        }
    }
}

impl MuxConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(Duration::from_millis(self.base_delay_ms), self.max_attempts)
            .with_jitter(self.jitter)
    }
}

/// Log stream tunables (lives under `[logs]` in config.toml).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Lines retained in the display buffer.
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,
    /// Lines handed to the view on each render. Never above `max_log_lines`.
    #[serde(default = "default_max_display_lines")]
    pub max_display_lines: usize,
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_scroll_throttle_ms")]
    pub scroll_throttle_ms: u64,
    /// Distance from the bottom edge still counted as "at the bottom".
    #[serde(default = "default_near_bottom_px")]
    pub near_bottom_px: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_log_lines: default_max_log_lines(),
            max_display_lines: default_max_display_lines(),
            batch_interval_ms: default_batch_interval_ms(),
            scroll_throttle_ms: default_scroll_throttle_ms(),
            near_bottom_px: default_near_bottom_px(),
        }
    }
}

impl LogConfig {
    /// Clamp the limits so that `1 <= max_display_lines <= max_log_lines`.
    pub fn normalized(mut self) -> Self {
        self.max_log_lines = self.max_log_lines.max(1);
        self.max_display_lines = self.max_display_lines.clamp(1, self.max_log_lines);
        self
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn scroll_throttle(&self) -> Duration {
        Duration::from_millis(self.scroll_throttle_ms)
    }
}

/// Exec session tunables (lives under `[exec]` in config.toml).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Wait after the channel opens before sending the first resize.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl ExecConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_max_log_lines() -> usize {
    2000
}
fn default_max_display_lines() -> usize {
    500
}
fn default_batch_interval_ms() -> u64 {
    50
}
fn default_scroll_throttle_ms() -> u64 {
    100
}
fn default_near_bottom_px() -> u32 {
    50
}
fn default_settle_delay_ms() -> u64 {
    100
}
