//! Event calendar - no-trade windows loaded from the Events tab

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

use crate::persistence::{cell, Row, Tab, TabStore};
use crate::session::{local_time, trading_date, TimeWindow};
use crate::types::Symbol;

const ACTIVE_VALUES: [&str; 6] = ["1", "true", "yes", "on", "y", "active"];

#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEvent {
    pub date: NaiveDate,
    pub kind: String,
    /// `None` = all day
    pub window: Option<TimeWindow>,
    pub note: String,
    /// `None` = every symbol
    pub symbol: Option<Symbol>,
}

impl CalendarEvent {
    /// Parse an Events row; inactive or undated rows yield `None`
    pub fn from_row(row: &Row) -> Option<Self> {
        let active = cell(row, "active")
            .map(|v| ACTIVE_VALUES.contains(&v.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if !active {
            return None;
        }
        let date = NaiveDate::parse_from_str(cell(row, "date")?, "%Y-%m-%d").ok()?;

        let symbol = match cell(row, "symbol") {
            None => None,
            Some(s) if s.eq_ignore_ascii_case("ALL") => None,
            Some(s) => match Symbol::from_str(s) {
                Some(sym) => Some(sym),
                None => {
                    warn!(symbol = s, "📅 [EVENTS] Unknown symbol in Events row, skipped");
                    return None;
                }
            },
        };

        Some(Self {
            date,
            kind: cell(row, "type").unwrap_or("EVENT").to_string(),
            window: cell(row, "window").and_then(TimeWindow::parse),
            note: cell(row, "note").unwrap_or_default().to_string(),
            symbol,
        })
    }

    pub fn applies(&self, symbol: Symbol, now: DateTime<Utc>) -> bool {
        if self.date != trading_date(now) {
            return false;
        }
        if self.symbol.map_or(false, |s| s != symbol) {
            return false;
        }
        self.window.map_or(true, |w| w.contains(local_time(now)))
    }

    pub fn describe(&self) -> String {
        let when = self
            .window
            .map(|w| w.to_string())
            .unwrap_or_else(|| "all day".to_string());
        if self.note.is_empty() {
            format!("event {} {}", self.kind, when)
        } else {
            format!("event {} {} ({})", self.kind, when, self.note)
        }
    }
}

#[derive(Default)]
pub struct EventCalendar {
    events: RwLock<Vec<CalendarEvent>>,
}

impl EventCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_events(&self, events: Vec<CalendarEvent>) {
        *self.events.write().unwrap_or_else(PoisonError::into_inner) = events;
    }

    /// Reload active events from the Events tab
    pub async fn refresh(&self, store: &dyn TabStore) -> Result<usize> {
        let rows = store.read_all(Tab::Events).await?;
        let events: Vec<CalendarEvent> = rows.iter().filter_map(CalendarEvent::from_row).collect();
        let n = events.len();
        debug!(active = n, "📅 [EVENTS] Calendar refreshed");
        self.set_events(events);
        Ok(n)
    }

    /// C5 reason when an event disables entries for `symbol` now
    pub fn block_reason(&self, symbol: Symbol, now: DateTime<Utc>) -> Option<String> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|e| e.applies(symbol, now))
            .map(CalendarEvent::describe)
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
