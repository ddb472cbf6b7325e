//! Backtest node
//!
//! Replays signals over prices in timestamp order with a long-only position
//! model: enter on `1`, exit on `-1`. Commission and slippage apply to every
//! fill. Produces the metrics, trade log, and equity curve artifact.
//!
//! Inputs: either one frame carrying both OHLC and a `signal` column, or two
//! frames where one provides signals and the other prices (order
//! insensitive, aligned on timestamp).

use std::sync::Arc;

use serde_json::{Map, Value};

use super::{float_column, input_frame, NodeOutput};
use crate::artifact::{
    Artifact, BacktestMetrics, BacktestResults, EquityPoint, Trade, TradeSide,
};
use crate::catalog::param_f64;
use crate::dataframe::{ColumnData, DataFrame, SIGNAL_COLUMN};
use crate::error::{ErrorCode, NodeError};
use crate::run::LogCollector;

const MS_PER_DAY: f64 = 86_400_000.0;
const MS_PER_YEAR: f64 = 365.0 * MS_PER_DAY;

/// Execute the backtest node.
pub fn run(
    params: &Map<String, Value>,
    inputs: &[Arc<Artifact>],
    logs: &mut LogCollector,
) -> NodeOutput {
    let initial_capital = param_f64(params, "initial_capital").ok_or_else(|| {
        NodeError::new(
            ErrorCode::NodeRuntimeError,
            "initial_capital parameter is missing",
        )
    })?;
    let commission = param_f64(params, "commission").unwrap_or(0.001);
    let slippage = param_f64(params, "slippage").unwrap_or(0.0);
    let position_size = param_f64(params, "position_size").unwrap_or(1.0);

    let (timestamps, closes, signals) = combined_series(inputs)?;
    logs.info(format!(
        "backtesting {} rows with capital {initial_capital}",
        timestamps.len()
    ));

    let mut sim = Simulation::new(initial_capital, commission, slippage, position_size);
    for i in 0..timestamps.len() {
        let Some(close) = closes[i] else { continue };
        sim.step(timestamps[i], close, signals[i]);
    }
    let results = sim.finish(&timestamps);
    logs.info(format!(
        "{} trade(s), final capital {:.2}",
        results.metrics.num_trades, results.metrics.final_capital
    ));
    Ok(Artifact::BacktestResults(results))
}

/// Resolve the two input modes into aligned `(timestamp, close, signal)`
/// series.
fn combined_series(
    inputs: &[Arc<Artifact>],
) -> Result<(Vec<i64>, Vec<Option<f64>>, Vec<i64>), NodeError> {
    let (signal_frame, price_frame) = match inputs.len() {
        1 => {
            let frame = input_frame(inputs, 0)?;
            if !frame.has_column(SIGNAL_COLUMN) {
                return Err(NodeError::new(
                    ErrorCode::NodeRuntimeError,
                    "single-input backtest requires a frame with a signal column",
                ));
            }
            (frame.clone(), frame.clone())
        }
        2 => {
            let first = input_frame(inputs, 0)?;
            let second = input_frame(inputs, 1)?;
            let (signals, prices) = if first.has_column(SIGNAL_COLUMN) {
                (first, second)
            } else if second.has_column(SIGNAL_COLUMN) {
                (second, first)
            } else {
                return Err(NodeError::new(
                    ErrorCode::NodeRuntimeError,
                    "neither backtest input carries a signal column",
                ));
            };
            let (signals, prices) = signals.align_on_timestamp(prices).map_err(|message| {
                NodeError::new(ErrorCode::NodeRuntimeError, message)
            })?;
            (signals, prices)
        }
        other => {
            return Err(NodeError::new(
                ErrorCode::NodeRuntimeError,
                format!("backtest takes 1 or 2 inputs, got {other}"),
            ))
        }
    };

    let timestamps = price_frame
        .timestamps()
        .map_err(|message| NodeError::new(ErrorCode::NodeRuntimeError, message))?;
    let closes = float_column(&price_frame, "close")?;
    let signals = signal_column(&signal_frame)?;
    Ok((timestamps, closes, signals))
}

fn signal_column(frame: &DataFrame) -> Result<Vec<i64>, NodeError> {
    let column = frame.column(SIGNAL_COLUMN).ok_or_else(|| {
        NodeError::new(ErrorCode::NodeRuntimeError, "signal column is missing")
    })?;
    match &column.data {
        ColumnData::Int(values) => Ok(values.iter().map(|v| v.unwrap_or(0)).collect()),
        ColumnData::Float(values) => Ok(values
            .iter()
            .map(|v| v.map(|f| f as i64).unwrap_or(0))
            .collect()),
        ColumnData::Str(_) => Err(NodeError::new(
            ErrorCode::NodeRuntimeError,
            "signal column must be numeric",
        )),
    }
}

/// Long-only cash/position simulation.
struct Simulation {
    commission: f64,
    slippage: f64,
    position_size: f64,
    initial_capital: f64,
    cash: f64,
    units: f64,
    entry: Option<OpenPosition>,
    trades: Vec<Trade>,
    equity_curve: Vec<EquityPoint>,
}

struct OpenPosition {
    time: i64,
    fill_price: f64,
    cost_with_fees: f64,
}

impl Simulation {
    fn new(initial_capital: f64, commission: f64, slippage: f64, position_size: f64) -> Self {
        Self {
            commission,
            slippage,
            position_size,
            initial_capital,
            cash: initial_capital,
            units: 0.0,
            entry: None,
            trades: Vec::new(),
            equity_curve: Vec::new(),
        }
    }

    fn step(&mut self, timestamp: i64, close: f64, signal: i64) {
        if signal == 1 && self.entry.is_none() && close > 0.0 {
            // Scale the notional so cost plus commission never exceeds cash.
            let notional = self.cash * self.position_size / (1.0 + self.commission);
            let fill_price = close * (1.0 + self.slippage);
            if notional > 0.0 && fill_price > 0.0 {
                let units = notional / fill_price;
                let fees = notional * self.commission;
                self.cash -= notional + fees;
                self.units = units;
                self.entry = Some(OpenPosition {
                    time: timestamp,
                    fill_price,
                    cost_with_fees: notional + fees,
                });
            }
        } else if signal == -1 {
            if let Some(entry) = self.entry.take() {
                let fill_price = close * (1.0 - self.slippage);
                let proceeds = self.units * fill_price;
                let fees = proceeds * self.commission;
                self.cash += proceeds - fees;
                let pnl = (proceeds - fees) - entry.cost_with_fees;
                self.trades.push(Trade {
                    entry_time: entry.time,
                    exit_time: timestamp,
                    side: TradeSide::Long,
                    size: self.units,
                    entry_price: entry.fill_price,
                    exit_price: fill_price,
                    pnl,
                    return_pct: pnl / entry.cost_with_fees,
                });
                self.units = 0.0;
            }
        }
        self.equity_curve.push(EquityPoint {
            timestamp,
            equity: self.cash + self.units * close,
        });
    }

    fn finish(self, timestamps: &[i64]) -> BacktestResults {
        let final_capital = self
            .equity_curve
            .last()
            .map(|p| p.equity)
            .unwrap_or(self.initial_capital);
        let total_return = final_capital / self.initial_capital - 1.0;

        let span_ms = match (timestamps.first(), timestamps.last()) {
            (Some(&first), Some(&last)) if last > first => (last - first) as f64,
            _ => 0.0,
        };
        let annual_return = if span_ms > 0.0 {
            (1.0 + total_return).powf(MS_PER_YEAR / span_ms) - 1.0
        } else {
            total_return
        };

        let sharpe_ratio = sharpe(&self.equity_curve);
        let (max_drawdown, max_drawdown_duration_days) = drawdown(&self.equity_curve);

        let wins = self.trades.iter().filter(|t| t.pnl > 0.0).count();
        let gross_profit: f64 = self
            .trades
            .iter()
            .filter(|t| t.pnl > 0.0)
            .map(|t| t.pnl)
            .sum();
        let gross_loss: f64 = self
            .trades
            .iter()
            .filter(|t| t.pnl < 0.0)
            .map(|t| -t.pnl)
            .sum();
        let num_trades = self.trades.len();
        let metrics = BacktestMetrics {
            total_return,
            annual_return,
            sharpe_ratio,
            max_drawdown,
            max_drawdown_duration_days,
            num_trades,
            win_rate: if num_trades > 0 {
                wins as f64 / num_trades as f64
            } else {
                0.0
            },
            profit_factor: if gross_loss > 0.0 {
                gross_profit / gross_loss
            } else if gross_profit > 0.0 {
                gross_profit
            } else {
                0.0
            },
            avg_trade_return: if num_trades > 0 {
                self.trades.iter().map(|t| t.return_pct).sum::<f64>() / num_trades as f64
            } else {
                0.0
            },
            final_capital,
        };

        BacktestResults {
            metrics,
            trades: self.trades,
            equity_curve: self.equity_curve,
        }
    }
}

/// Annualized Sharpe ratio over per-row equity returns; the annualization
/// factor comes from the mean row interval.
fn sharpe(equity_curve: &[EquityPoint]) -> f64 {
    if equity_curve.len() < 3 {
        return 0.0;
    }
    let returns: Vec<f64> = equity_curve
        .windows(2)
        .filter(|w| w[0].equity > 0.0)
        .map(|w| w[1].equity / w[0].equity - 1.0)
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / returns.len() as f64;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return 0.0;
    }
    let span_ms = (equity_curve.last().unwrap().timestamp
        - equity_curve.first().unwrap().timestamp) as f64;
    let mean_interval = span_ms / (equity_curve.len() - 1) as f64;
    let periods_per_year = if mean_interval > 0.0 {
        MS_PER_YEAR / mean_interval
    } else {
        252.0
    };
    mean / std_dev * periods_per_year.sqrt()
}

/// Deepest drawdown fraction and its duration in days.
fn drawdown(equity_curve: &[EquityPoint]) -> (f64, f64) {
    let mut peak = f64::MIN;
    let mut peak_time = 0i64;
    let mut max_dd = 0.0f64;
    let mut max_duration_ms = 0i64;
    for point in equity_curve {
        if point.equity >= peak {
            peak = point.equity;
            peak_time = point.timestamp;
        } else if peak > 0.0 {
            let dd = (peak - point.equity) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
            max_duration_ms = max_duration_ms.max(point.timestamp - peak_time);
        }
    }
    (max_dd, max_duration_ms as f64 / MS_PER_DAY)
}
