//! Trade Commands
//!
//! Typed trade commands accepted by the execution layer. Each command can be
//! sent over the trading WebSocket or, on failure, over REST.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    /// Buy.
    Buy,
    /// Sell.
    Sell,
}

impl OrderSide {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// Limit order.
    Limit,
    /// Market order.
    Market,
    /// Stop-limit order.
    Stop,
    /// Stop-market order.
    StopMarket,
    /// Take-profit limit order.
    TakeProfit,
    /// Take-profit market order.
    TakeProfitMarket,
}

impl OrderType {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Limit => "LIMIT",
            Self::Market => "MARKET",
            Self::Stop => "STOP",
            Self::StopMarket => "STOP_MARKET",
            Self::TakeProfit => "TAKE_PROFIT",
            Self::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }

    /// Whether the type needs a limit price.
    #[must_use]
    pub const fn requires_price(&self) -> bool {
        matches!(self, Self::Limit | Self::Stop | Self::TakeProfit)
    }
}

/// Time in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good till cancelled.
    Gtc,
    /// Immediate or cancel.
    Ioc,
    /// Fill or kill.
    Fok,
    /// Post only.
    Gtx,
}

impl TimeInForce {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gtc => "GTC",
            Self::Ioc => "IOC",
            Self::Fok => "FOK",
            Self::Gtx => "GTX",
        }
    }
}

/// Identifies an existing order by exchange id or client id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderRef {
    /// Exchange-assigned id.
    OrderId(u64),
    /// Caller-assigned id.
    ClientOrderId(String),
}

/// New order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Symbol.
    pub symbol: String,
    /// Side.
    pub side: OrderSide,
    /// Order type.
    pub order_type: OrderType,
    /// Quantity.
    pub quantity: Decimal,
    /// Limit price.
    pub price: Option<Decimal>,
    /// Trigger price for stop and take-profit orders.
    pub stop_price: Option<Decimal>,
    /// Time in force, limit orders only.
    pub time_in_force: Option<TimeInForce>,
    /// Only reduce an existing position.
    pub reduce_only: bool,
    /// Hedge-mode position side (`LONG`/`SHORT`).
    pub position_side: Option<String>,
    /// Caller-assigned id.
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// Market order.
    #[must_use]
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            time_in_force: None,
            reduce_only: false,
            position_side: None,
            client_order_id: None,
        }
    }

    /// Good-till-cancelled limit order.
    #[must_use]
    pub fn limit(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            time_in_force: Some(TimeInForce::Gtc),
            ..Self::market(symbol, side, quantity)
        }
    }
}

/// Change price or quantity of a resting limit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyOrderRequest {
    /// Symbol.
    pub symbol: String,
    /// Order to modify.
    pub order: OrderRef,
    /// Side, required by the exchange.
    pub side: OrderSide,
    /// New quantity.
    pub quantity: Decimal,
    /// New price.
    pub price: Decimal,
}

/// Time-weighted algorithmic order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgoOrderRequest {
    /// Symbol.
    pub symbol: String,
    /// Side.
    pub side: OrderSide,
    /// Total quantity.
    pub quantity: Decimal,
    /// Execution window in seconds.
    pub duration_secs: u64,
    /// Optional price limit.
    pub limit_price: Option<Decimal>,
    /// Only reduce an existing position.
    pub reduce_only: bool,
    /// Hedge-mode position side.
    pub position_side: Option<String>,
    /// Caller-assigned id.
    pub client_algo_id: Option<String>,
}

/// A trade command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeCommand {
    /// Place an order.
    PlaceOrder(OrderRequest),
    /// Modify a resting order.
    ModifyOrder(ModifyOrderRequest),
    /// Cancel an order.
    CancelOrder {
        /// Symbol.
        symbol: String,
        /// Order to cancel.
        order: OrderRef,
    },
    /// Query an order.
    OrderStatus {
        /// Symbol.
        symbol: String,
        /// Order to query.
        order: OrderRef,
    },
    /// Place an algorithmic order.
    PlaceAlgoOrder(AlgoOrderRequest),
    /// Cancel an algorithmic order.
    CancelAlgoOrder {
        /// Exchange-assigned algo id.
        algo_id: u64,
    },
    /// Query positions, optionally for one symbol.
    QueryPosition {
        /// Symbol filter.
        symbol: Option<String>,
    },
    /// Set initial leverage for a symbol.
    SetLeverage {
        /// Symbol.
        symbol: String,
        /// Leverage multiple.
        leverage: u32,
    },
}

impl TradeCommand {
    /// Short name used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PlaceOrder(_) => "place_order",
            Self::ModifyOrder(_) => "modify_order",
            Self::CancelOrder { .. } => "cancel_order",
            Self::OrderStatus { .. } => "order_status",
            Self::PlaceAlgoOrder(_) => "place_algo_order",
            Self::CancelAlgoOrder { .. } => "cancel_algo_order",
            Self::QueryPosition { .. } => "query_position",
            Self::SetLeverage { .. } => "set_leverage",
        }
    }

    /// Whether repeating the command after an unknown outcome is harmless.
    #[must_use]
    pub const fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Self::OrderStatus { .. }
                | Self::QueryPosition { .. }
                | Self::SetLeverage { .. }
                | Self::CancelOrder { .. }
                | Self::CancelAlgoOrder { .. }
        )
    }
}
