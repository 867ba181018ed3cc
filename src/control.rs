//! Command/control surface
//!
//! Text commands from a chat bridge or the console. Queries always answer
//! best-effort; privileged commands check the admin allowlist and every
//! attempt is audited to the log and the Status tab.

use chrono::{DateTime, Utc};
use std::fmt::Write;
use std::sync::Arc;
use tracing::{info, warn};

use crate::eligibility::render;
use crate::engine::Engine;
use crate::paper_trading::PositionStatus;
use crate::risk::format_remaining;
use crate::session::trading_date;
use crate::types::Symbol;

const HELP: &str = "\
Commands:
/oc_now [SYM] [buffer]  eligibility snapshot
/positions              open and pending positions
/perf_today             today's performance
/circuit                circuit breaker and daily counters
/circuit_reset          reset the circuit breaker (admin)
/hold on|off            pause or resume new entries (admin)
/flat [SYM]             close positions at last spot (admin)";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    OcNow {
        symbol: Option<Symbol>,
        buffer: Option<f64>,
    },
    Positions,
    PerfToday,
    Circuit,
    CircuitReset,
    Hold(bool),
    Flat(Option<Symbol>),
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, String> {
        let mut parts = line.split_whitespace();
        let Some(head) = parts.next() else {
            return Err("empty command".to_string());
        };
        // chat bridges append @botname
        let name = head
            .split('@')
            .next()
            .unwrap_or(head)
            .trim_start_matches('/')
            .to_ascii_lowercase();
        let args: Vec<&str> = parts.collect();

        let symbol_arg = |arg: Option<&&str>| -> Result<Option<Symbol>, String> {
            match arg {
                None => Ok(None),
                Some(s) => Symbol::from_str(s)
                    .map(Some)
                    .ok_or_else(|| format!("unknown symbol '{}'", s)),
            }
        };

        match name.as_str() {
            "help" | "start" => Ok(Command::Help),
            "oc_now" => {
                let symbol = symbol_arg(args.first())?;
                let buffer = match args.get(1) {
                    None => None,
                    Some(b) => match b.parse::<f64>() {
                        Ok(v) if v.is_finite() && v >= 0.0 => Some(v),
                        _ => return Err(format!("invalid buffer '{}'", b)),
                    },
                };
                Ok(Command::OcNow { symbol, buffer })
            }
            "positions" => Ok(Command::Positions),
            "perf_today" => Ok(Command::PerfToday),
            "circuit" => Ok(Command::Circuit),
            "circuit_reset" => Ok(Command::CircuitReset),
            "hold" => match args.first().map(|a| a.to_ascii_lowercase()) {
                Some(a) if a == "on" => Ok(Command::Hold(true)),
                Some(a) if a == "off" => Ok(Command::Hold(false)),
                _ => Err("usage: /hold on|off".to_string()),
            },
            "flat" => Ok(Command::Flat(symbol_arg(args.first())?)),
            other => Err(format!("unknown command /{}", other)),
        }
    }

    pub fn is_privileged(&self) -> bool {
        matches!(
            self,
            Command::CircuitReset | Command::Hold(_) | Command::Flat(_)
        )
    }
}

pub struct Controller {
    engine: Arc<Engine>,
    admins: Vec<String>,
}

impl Controller {
    pub fn new(engine: Arc<Engine>, admins: Vec<String>) -> Self {
        Self { engine, admins }
    }

    pub fn is_admin(&self, sender: &str) -> bool {
        self.admins.iter().any(|a| a == sender)
    }

    /// Handle one command line and return the reply text
    pub async fn handle(&self, sender: &str, line: &str, now: DateTime<Utc>) -> String {
        let cmd = match Command::parse(line) {
            Ok(cmd) => cmd,
            Err(e) => return format!("{}\n\n{}", e, HELP),
        };

        if cmd.is_privileged() {
            let allowed = self.is_admin(sender);
            let reply = if allowed {
                self.run_privileged(&cmd, now).await
            } else {
                "⛔ not authorized".to_string()
            };
            self.audit(sender, line, allowed, &reply, now).await;
            return reply;
        }

        match cmd {
            Command::Help => HELP.to_string(),
            Command::OcNow { symbol, buffer } => self.oc_now(symbol, buffer, now).await,
            Command::Positions => self.positions().await,
            Command::PerfToday => self.perf_today(now).await,
            Command::Circuit => self.circuit(now),
            _ => HELP.to_string(),
        }
    }

    async fn audit(&self, sender: &str, line: &str, allowed: bool, reply: &str, now: DateTime<Utc>) {
        let first_line = reply.lines().next().unwrap_or_default();
        if allowed {
            info!(sender, command = line, result = first_line, "🛂 [CONTROL] Privileged command");
        } else {
            warn!(sender, command = line, "🛂 [CONTROL] Privileged command denied");
        }
        let message = format!(
            "sender={} cmd={} allowed={} result={}",
            sender,
            line.trim(),
            allowed,
            first_line
        );
        self.engine.heartbeat("AUDIT", &message, now).await;
    }

    async fn run_privileged(&self, cmd: &Command, now: DateTime<Utc>) -> String {
        let risk = self.engine.risk();
        let reply = match cmd {
            Command::CircuitReset => {
                risk.reset_circuit();
                "🔄 Circuit breaker reset".to_string()
            }
            Command::Hold(on) => {
                risk.set_hold(*on);
                if *on {
                    "✋ HOLD on: new entries paused".to_string()
                } else {
                    "▶️ HOLD off: entries resumed".to_string()
                }
            }
            Command::Flat(symbol) => {
                let closed = self.engine.flatten(*symbol, now).await;
                if closed.is_empty() {
                    "Nothing to flatten".to_string()
                } else {
                    let mut out = format!("Flattened {} position(s)", closed.len());
                    for p in &closed {
                        let _ = write!(
                            out,
                            "\n{} {} {} {} pnl {:+.2}",
                            p.symbol, p.side, p.level_tag, p.status, p.pnl
                        );
                    }
                    out
                }
            }
            _ => return HELP.to_string(),
        };
        if let Err(e) = risk.save_state() {
            warn!(error = %e, "💾 [RISK] Failed to save state");
        }
        reply
    }

    async fn oc_now(&self, symbol: Option<Symbol>, buffer: Option<f64>, now: DateTime<Utc>) -> String {
        let enabled = self.engine.symbols();
        let Some(symbol) = symbol.or_else(|| enabled.first().copied()) else {
            return "no symbols enabled".to_string();
        };
        if !enabled.contains(&symbol) {
            return format!("{} is not enabled", symbol);
        }
        let result = match self.engine.evaluate_now(symbol, buffer, now).await {
            Some(result) => Some(result),
            None => self.engine.last_evaluation(symbol).await,
        };
        match result {
            Some(result) => render(&result),
            None => format!("no levels yet for {}", symbol),
        }
    }

    async fn positions(&self) -> String {
        let positions = self.engine.positions().await;
        if positions.is_empty() {
            return "No open positions".to_string();
        }
        let mut out = String::from("Positions");
        for p in positions {
            match p.status {
                PositionStatus::Pending => {
                    let _ = write!(
                        out,
                        "\n{} {} {} PENDING trigger {:.2}",
                        p.symbol, p.side, p.level_tag, p.trigger
                    );
                }
                _ => {
                    let trail = p
                        .trail_stop
                        .map(|t| format!("{:.2}", t))
                        .unwrap_or_else(|| "—".to_string());
                    let _ = write!(
                        out,
                        "\n{} {} {} {} entry {:.2} SL {:.2} TP {:.2} trail {} qty {} uPnL {:+.2}",
                        p.symbol,
                        p.side,
                        p.level_tag,
                        p.status,
                        p.entry_price.unwrap_or(p.trigger),
                        p.stop_loss,
                        p.take_profit,
                        trail,
                        p.quantity,
                        p.unrealized_points().unwrap_or(0.0)
                    );
                }
            }
        }
        out
    }

    async fn perf_today(&self, now: DateTime<Utc>) -> String {
        let (per_symbol, total) = self.engine.performance(trading_date(now)).await;
        let mut out = total.to_string();
        for perf in per_symbol.iter().filter(|p| p.trades > 0) {
            let _ = write!(
                out,
                "\n{}: {} trades, {:.1}% win, gross {:.2}",
                perf.symbol.as_deref().unwrap_or("-"),
                perf.trades,
                perf.win_rate(),
                perf.gross_pnl
            );
        }
        out
    }

    fn circuit(&self, now: DateTime<Utc>) -> String {
        let risk = self.engine.risk();
        let status = risk.circuit_status(now);
        let counters = risk.counters();
        let limits = risk.limits();
        let state = match status.remaining {
            Some(left) => format!("PAUSED {} left", format_remaining(left)),
            None => "OK".to_string(),
        };
        format!(
            "Circuit: {} | SL hits {}/{} in {}m\nToday: trades {}/{} | PnL {:.2} (limit -{:.2}) | HOLD {}",
            state,
            status.recent_hits,
            status.threshold,
            status.window.num_minutes(),
            counters.trade_count,
            limits.max_trades_per_day,
            counters.pnl,
            limits.daily_loss_limit,
            if risk.is_held() { "on" } else { "off" }
        )
    }
}
