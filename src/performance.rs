//! Daily performance aggregates

use chrono::NaiveDate;
use std::fmt;

use crate::paper_trading::{Position, PositionStatus};
use crate::persistence::{row, Row};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailyPerformance {
    pub date: Option<NaiveDate>,
    /// `None` = all symbols
    pub symbol: Option<String>,
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub gross_pnl: f64,
    /// Largest peak-to-trough drop of cumulative PnL (positive number)
    pub max_drawdown: f64,
}

impl DailyPerformance {
    /// Aggregate CLOSED positions in exit-time order. Cancelled entries are ignored.
    pub fn from_positions<'a>(
        date: NaiveDate,
        symbol: Option<String>,
        positions: impl IntoIterator<Item = &'a Position>,
    ) -> Self {
        let mut closed: Vec<&Position> = positions
            .into_iter()
            .filter(|p| p.status == PositionStatus::Closed)
            .collect();
        closed.sort_by_key(|p| p.exit_time);

        let mut perf = Self {
            date: Some(date),
            symbol,
            ..Default::default()
        };
        let mut cum = 0.0_f64;
        let mut peak = 0.0_f64;
        for p in closed {
            perf.trades += 1;
            if p.pnl > 0.0 {
                perf.wins += 1;
            } else if p.pnl < 0.0 {
                perf.losses += 1;
            }
            cum += p.pnl;
            peak = peak.max(cum);
            perf.max_drawdown = perf.max_drawdown.max(peak - cum);
        }
        perf.gross_pnl = cum;
        perf
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64 * 100.0
        }
    }

    pub fn avg_pnl(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.gross_pnl / self.trades as f64
        }
    }

    /// Performance tab row
    pub fn to_row(&self) -> Row {
        row([
            (
                "date",
                self.date
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_default(),
            ),
            ("symbol", self.symbol.clone().unwrap_or_else(|| "ALL".to_string())),
            ("trades", self.trades.to_string()),
            ("wins", self.wins.to_string()),
            ("losses", self.losses.to_string()),
            ("win_rate", format!("{:.1}", self.win_rate())),
            ("avg_pnl", format!("{:.2}", self.avg_pnl())),
            ("gross_pnl", format!("{:.2}", self.gross_pnl)),
            ("max_dd", format!("{:.2}", self.max_drawdown)),
        ])
    }
}

impl fmt::Display for DailyPerformance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let date = self
            .date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            f,
            "Performance {} {}",
            date,
            self.symbol.as_deref().unwrap_or("ALL")
        )?;
        writeln!(
            f,
            "Trades: {} | W/L: {}/{} | Win rate: {:.1}%",
            self.trades,
            self.wins,
            self.losses,
            self.win_rate()
        )?;
        write!(
            f,
            "Gross: {:.2} | Avg: {:.2} | Max DD: {:.2}",
            self.gross_pnl,
            self.avg_pnl(),
            self.max_drawdown
        )
    }
}
