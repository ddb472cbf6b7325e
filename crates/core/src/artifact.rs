//! Artifacts: the typed values nodes produce and consume
//!
//! Cross-boundary payloads are tagged variants over the four artifact kinds.
//! Conversions to and from the sandbox wire form live here so that data is
//! validated at every boundary crossing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dataframe::DataFrame;
use crate::schema::{ArtifactKind, DataSchema};

/// Direction of a filled trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    /// Bought first, sold later
    Long,
    /// Sold first, bought later
    Short,
}

/// One round-trip trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Entry fill timestamp (epoch ms)
    pub entry_time: i64,
    /// Exit fill timestamp (epoch ms)
    pub exit_time: i64,
    /// Trade direction
    pub side: TradeSide,
    /// Units held
    pub size: f64,
    /// Fill price at entry, slippage applied
    pub entry_price: f64,
    /// Fill price at exit, slippage applied
    pub exit_price: f64,
    /// Net profit after commissions
    pub pnl: f64,
    /// Net return relative to entry notional
    pub return_pct: f64,
}

/// One point on the equity curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    /// Row timestamp (epoch ms)
    pub timestamp: i64,
    /// Account equity at that row
    pub equity: f64,
}

/// Aggregate backtest metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    /// Final equity over initial capital, minus one
    pub total_return: f64,
    /// Total return annualized over the backtest span
    pub annual_return: f64,
    /// Annualized Sharpe ratio of per-row returns
    pub sharpe_ratio: f64,
    /// Deepest peak-to-trough equity drawdown (fraction)
    pub max_drawdown: f64,
    /// Length of that drawdown in days
    pub max_drawdown_duration_days: f64,
    /// Number of closed trades
    pub num_trades: usize,
    /// Fraction of closed trades with positive pnl
    pub win_rate: f64,
    /// Gross profit over gross loss
    pub profit_factor: f64,
    /// Mean per-trade return
    pub avg_trade_return: f64,
    /// Equity at the end of the run
    pub final_capital: f64,
}

/// The full backtest artifact payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestResults {
    /// Aggregate metrics
    pub metrics: BacktestMetrics,
    /// Closed trades in entry order
    pub trades: Vec<Trade>,
    /// Equity per processed row
    pub equity_curve: Vec<EquityPoint>,
}

/// A typed value produced by a node and consumed by its dependents.
///
/// Immutable once produced; the executor shares artifacts by `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Artifact {
    /// Plain dataframe
    Dataframe(DataFrame),
    /// Dataframe with an explicit signal column
    Signals(DataFrame),
    /// Metrics, trades, equity curve
    BacktestResults(BacktestResults),
    /// Arbitrary payload from a custom node
    Opaque(Value),
}

impl Artifact {
    /// Kind tag of this artifact.
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Artifact::Dataframe(_) => ArtifactKind::Dataframe,
            Artifact::Signals(_) => ArtifactKind::Signals,
            Artifact::BacktestResults(_) => ArtifactKind::BacktestResults,
            Artifact::Opaque(_) => ArtifactKind::Opaque,
        }
    }

    /// Schema of this artifact.
    pub fn schema(&self) -> DataSchema {
        match self {
            Artifact::Dataframe(frame) => frame.schema(ArtifactKind::Dataframe),
            Artifact::Signals(frame) => frame.schema(ArtifactKind::Signals),
            Artifact::BacktestResults(_) => DataSchema::backtest_results(),
            Artifact::Opaque(_) => DataSchema::opaque(),
        }
    }

    /// The underlying frame for the two tabular kinds.
    pub fn as_dataframe(&self) -> Option<&DataFrame> {
        match self {
            Artifact::Dataframe(frame) | Artifact::Signals(frame) => Some(frame),
            _ => None,
        }
    }

    /// Wire form: kind tag plus data payload, for the sandbox protocol.
    pub fn to_wire(&self) -> Result<(String, Value), serde_json::Error> {
        let data = match self {
            Artifact::Dataframe(frame) | Artifact::Signals(frame) => serde_json::to_value(frame)?,
            Artifact::BacktestResults(results) => serde_json::to_value(results)?,
            Artifact::Opaque(value) => value.clone(),
        };
        Ok((self.kind().as_str().to_string(), data))
    }

    /// Parse a wire payload back into a typed artifact.
    ///
    /// `metadata` from the output descriptor is folded into tabular frames.
    pub fn from_wire(
        kind: &str,
        data: Value,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Artifact, String> {
        let kind: ArtifactKind = kind.parse()?;
        let artifact = match kind {
            ArtifactKind::Dataframe | ArtifactKind::Signals => {
                let mut frame: DataFrame = serde_json::from_value(data)
                    .map_err(|err| format!("invalid {kind} payload: {err}"))?;
                if let Some(metadata) = metadata {
                    for (key, value) in metadata {
                        frame.insert_metadata(key, value);
                    }
                }
                if kind == ArtifactKind::Signals {
                    Artifact::Signals(frame)
                } else {
                    Artifact::Dataframe(frame)
                }
            }
            ArtifactKind::BacktestResults => {
                let results: BacktestResults = serde_json::from_value(data)
                    .map_err(|err| format!("invalid backtest_results payload: {err}"))?;
                Artifact::BacktestResults(results)
            }
            ArtifactKind::Opaque => Artifact::Opaque(data),
        };
        Ok(artifact)
    }

    /// Check this artifact against a declared output schema.
    ///
    /// Kinds must match exactly; for tabular kinds every declared column must
    /// be present (custom nodes may emit extra columns).
    pub fn conforms_to(&self, declared: &DataSchema) -> Result<(), String> {
        let actual = self.schema();
        if actual.kind != declared.kind {
            return Err(format!(
                "artifact kind {} does not match declared {}",
                actual.kind, declared.kind
            ));
        }
        if declared.kind.is_tabular() {
            let missing = actual.missing_columns(&declared.columns);
            if !missing.is_empty() {
                return Err(format!(
                    "artifact is missing declared columns [{}]",
                    missing.join(", ")
                ));
            }
        }
        Ok(())
    }
}
