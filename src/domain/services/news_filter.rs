use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

/// "Trading blocked now" predicate fed by news or calendar data.
pub trait TradingBlock: Send + Sync {
    fn is_blocked(&self, instrument: &str, at: DateTime<Utc>) -> bool;
}

/// Never blocks.
pub struct NoBlock;

impl TradingBlock for NoBlock {
    fn is_blocked(&self, _instrument: &str, _at: DateTime<Utc>) -> bool {
        false
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarEvent {
    pub time: DateTime<Utc>,
    #[serde(default = "default_impact")]
    pub impact: String,
    /// Empty means the event applies to every instrument.
    #[serde(default)]
    pub instruments: Vec<String>,
}

fn default_impact() -> String {
    "medium".to_string()
}

/// Blocks trading within a window around scheduled economic events.
#[derive(Debug, Clone)]
pub struct CalendarBlackout {
    events: Vec<CalendarEvent>,
    window: Duration,
}

impl CalendarBlackout {
    pub fn new(events: Vec<CalendarEvent>, window_minutes: i64) -> Self {
        CalendarBlackout {
            events,
            window: Duration::minutes(window_minutes.max(0)),
        }
    }

    /// Loads a JSON array of events. A missing or unreadable file yields an
    /// empty calendar so the session can still run.
    pub fn from_file(path: &Path, window_minutes: i64) -> Self {
        let events = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Vec<CalendarEvent>>(&raw) {
                Ok(events) => {
                    info!("Loaded {} calendar events from {}", events.len(), path.display());
                    events
                }
                Err(e) => {
                    warn!("Failed to parse calendar {}: {}", path.display(), e);
                    Vec::new()
                }
            },
            Err(e) => {
                warn!("Calendar file {} unavailable: {}", path.display(), e);
                Vec::new()
            }
        };
        CalendarBlackout::new(events, window_minutes)
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}

impl TradingBlock for CalendarBlackout {
    fn is_blocked(&self, instrument: &str, at: DateTime<Utc>) -> bool {
        if self.window <= Duration::zero() {
            return false;
        }
        self.events.iter().any(|event| {
            let applies = event.instruments.is_empty()
                || event.instruments.iter().any(|i| i == instrument);
            applies && (event.time - at).abs() <= self.window
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn nfp() -> CalendarEvent {
        CalendarEvent {
            time: Utc.with_ymd_and_hms(2024, 6, 7, 12, 30, 0).unwrap(),
            impact: "high".to_string(),
            instruments: vec!["EUR_USD".to_string()],
        }
    }

    #[test]
    fn test_blackout_window() {
        let filter = CalendarBlackout::new(vec![nfp()], 30);
        let at = Utc.with_ymd_and_hms(2024, 6, 7, 12, 0, 0).unwrap();
        assert!(filter.is_blocked("EUR_USD", at));
        assert!(!filter.is_blocked("USD_JPY", at));
        assert!(!filter.is_blocked("EUR_USD", at - Duration::minutes(1)));
        assert!(filter.is_blocked("EUR_USD", at + Duration::minutes(60)));
    }

    #[test]
    fn test_zero_window_never_blocks() {
        let filter = CalendarBlackout::new(vec![nfp()], 0);
        assert!(!filter.is_blocked("EUR_USD", nfp().time));
    }

    #[test]
    fn test_parses_calendar_json() {
        let raw = r#"[{"time":"2024-06-07T12:30:00Z","impact":"high","instruments":[]},
                      {"time":"2024-06-12T18:00:00Z"}]"#;
        let events: Vec<CalendarEvent> = serde_json::from_str(raw).unwrap();
        let filter = CalendarBlackout::new(events, 15);
        assert_eq!(filter.event_count(), 2);
        let at = Utc.with_ymd_and_hms(2024, 6, 12, 18, 10, 0).unwrap();
        assert!(filter.is_blocked("GBP_JPY", at));
    }

    #[test]
    fn test_missing_file_is_empty_calendar() {
        let filter = CalendarBlackout::from_file(Path::new("/nonexistent/calendar.json"), 30);
        assert_eq!(filter.event_count(), 0);
        assert!(!NoBlock.is_blocked("EUR_USD", Utc::now()));
    }
}
