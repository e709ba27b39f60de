use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StageError;

/// Directional bias shared by bars, levels and zones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Bullish,
    Bearish,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Bullish => write!(f, "UP"),
            Direction::Bearish => write!(f, "DOWN"),
        }
    }
}

/// Pipeline run mode published by the ingestion stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionMode {
    Running,
    Paused,
    Stopped,
}

impl IngestionMode {
    /// Paused and stopped both mean an operator halted the pipeline
    pub fn is_halted(self) -> bool {
        matches!(self, IngestionMode::Paused | IngestionMode::Stopped)
    }
}

impl fmt::Display for IngestionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestionMode::Running => write!(f, "running"),
            IngestionMode::Paused => write!(f, "paused"),
            IngestionMode::Stopped => write!(f, "stopped"),
        }
    }
}

/// One (symbol, timeframe) stream; the unit of single-writer ownership
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    pub symbol: String,
    pub timeframe: String,
}

impl Partition {
    pub fn new(symbol: impl Into<String>, timeframe: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.timeframe)
    }
}

/// Parsed form of `{symbol}:{timeframe}:bar:{epoch_ms}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BarId {
    pub symbol: String,
    pub timeframe: String,
    pub time: i64,
}

impl BarId {
    pub fn partition(&self) -> Partition {
        Partition::new(self.symbol.clone(), self.timeframe.clone())
    }
}

impl fmt::Display for BarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:bar:{}", self.symbol, self.timeframe, self.time)
    }
}

impl FromStr for BarId {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 4 || parts[0].is_empty() || parts[1].is_empty() || parts[2] != "bar" {
            return Err(StageError::InvalidBarId(s.to_string()));
        }
        let time = parts[3]
            .parse::<i64>()
            .map_err(|_| StageError::InvalidBarId(s.to_string()))?;
        Ok(Self {
            symbol: parts[0].to_string(),
            timeframe: parts[1].to_string(),
            time,
        })
    }
}

/// Finished OHLCV bar as delivered by the cleaning stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub id: String,
    pub symbol: String,
    pub timeframe: String,
    /// Open time, epoch milliseconds
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub direction: Direction,
    /// Zone ids touched by this bar, written once by this stage
    #[serde(default)]
    pub achievements: String,
}

impl Bar {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: &str,
        timeframe: &str,
        time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        let id = BarId {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            time,
        };
        Self {
            id: id.to_string(),
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            time,
            open,
            high,
            low,
            close,
            volume,
            direction: Self::direction_of(open, close),
            achievements: String::new(),
        }
    }

    /// Equal close counts as bearish
    pub fn direction_of(open: f64, close: f64) -> Direction {
        if close > open {
            Direction::Bullish
        } else {
            Direction::Bearish
        }
    }

    pub fn partition(&self) -> Partition {
        Partition::new(self.symbol.clone(), self.timeframe.clone())
    }

    pub fn set_achievements(&mut self, zone_ids: &[String]) {
        self.achievements = zone_ids.join(", ");
    }

    /// Bar open time rendered in the local timezone, for log lines
    pub fn local_time(&self) -> String {
        format_epoch_ms(self.time)
    }
}

pub fn format_epoch_ms(epoch_ms: i64) -> String {
    match Local.timestamp_millis_opt(epoch_ms).single() {
        Some(ts) => {
            let ts: DateTime<Local> = ts;
            ts.format("%Y-%m-%d %H:%M").to_string()
        }
        None => epoch_ms.to_string(),
    }
}

/// Input record of the cleaning stage; direction and id are derived
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarRecord {
    pub symbol: String,
    pub timeframe: String,
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl From<BarRecord> for Bar {
    fn from(r: BarRecord) -> Self {
        Bar::new(
            &r.symbol,
            &r.timeframe,
            r.time,
            r.open,
            r.high,
            r.low,
            r.close,
            r.volume,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_id_roundtrip() {
        let bar = Bar::new("BTCUSDT", "1h", 1700000000000, 50000.0, 50500.0, 49500.0, 50200.0, 1000.0);
        assert_eq!(bar.id, "BTCUSDT:1h:bar:1700000000000");

        let parsed: BarId = bar.id.parse().unwrap();
        assert_eq!(parsed.symbol, "BTCUSDT");
        assert_eq!(parsed.timeframe, "1h");
        assert_eq!(parsed.time, 1700000000000);
        assert_eq!(parsed.partition(), bar.partition());
    }

    #[test]
    fn test_bar_id_rejects_garbage() {
        assert!("PIPELINE_RESET".parse::<BarId>().is_err());
        assert!("BTCUSDT:1h:bar:not-a-number".parse::<BarId>().is_err());
        assert!("BTCUSDT:1h:bar".parse::<BarId>().is_err());
        assert!("::bar:1".parse::<BarId>().is_err());
        assert!("BTCUSDT:1h:mth:1700000000000".parse::<BarId>().is_err());
        assert!("BTCUSDT:1h:bar:1700000000000:extra".parse::<BarId>().is_err());
    }

    #[test]
    fn test_direction_equal_close_is_bearish() {
        assert_eq!(Bar::direction_of(50000.0, 50200.0), Direction::Bullish);
        assert_eq!(Bar::direction_of(50200.0, 50000.0), Direction::Bearish);
        assert_eq!(Bar::direction_of(50000.0, 50000.0), Direction::Bearish);
    }

    #[test]
    fn test_achievements_joined() {
        let mut bar = Bar::new("BTCUSDT", "1h", 1, 1.0, 1.0, 1.0, 1.0, 0.0);
        bar.set_achievements(&["a".to_string(), "b".to_string()]);
        assert_eq!(bar.achievements, "a, b");
        bar.set_achievements(&[]);
        assert_eq!(bar.achievements, "");
    }

    #[test]
    fn test_ingestion_mode_halted() {
        assert!(!IngestionMode::Running.is_halted());
        assert!(IngestionMode::Paused.is_halted());
        assert!(IngestionMode::Stopped.is_halted());
    }
}
