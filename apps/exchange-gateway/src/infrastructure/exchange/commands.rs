//! Trade Command Parameters
//!
//! Renders [`TradeCommand`]s into exchange parameter sets. The trading
//! WebSocket API and REST share parameter names, so both transports build
//! their requests from here.

use rust_decimal::Decimal;

use super::auth::Params;
use crate::domain::trading::{AlgoOrderRequest, ModifyOrderRequest, OrderRef, OrderRequest, TradeCommand};

/// Unsigned parameters of a command.
#[must_use]
pub fn command_params(command: &TradeCommand) -> Params {
    match command {
        TradeCommand::PlaceOrder(order) => order_params(order),
        TradeCommand::ModifyOrder(modify) => modify_params(modify),
        TradeCommand::CancelOrder { symbol, order } | TradeCommand::OrderStatus { symbol, order } => {
            with_order_ref(Params::new().with("symbol", symbol.as_str()), order)
        }
        TradeCommand::PlaceAlgoOrder(algo) => algo_params(algo),
        TradeCommand::CancelAlgoOrder { algo_id } => Params::new().with("algoId", *algo_id),
        TradeCommand::QueryPosition { symbol } => Params::new().with("symbol", symbol.clone()),
        TradeCommand::SetLeverage { symbol, leverage } => Params::new()
            .with("symbol", symbol.as_str())
            .with("leverage", *leverage),
    }
}

fn order_params(order: &OrderRequest) -> Params {
    Params::new()
        .with("symbol", order.symbol.as_str())
        .with("side", order.side.as_str())
        .with("type", order.order_type.as_str())
        .with("quantity", order.quantity)
        .with("price", order.price)
        .with("stopPrice", order.stop_price)
        .with("timeInForce", order.time_in_force.map(|tif| tif.as_str()))
        .with("reduceOnly", order.reduce_only)
        .with("positionSide", order.position_side.clone())
        .with("newClientOrderId", order.client_order_id.clone())
}

fn modify_params(modify: &ModifyOrderRequest) -> Params {
    with_order_ref(Params::new().with("symbol", modify.symbol.as_str()), &modify.order)
        .with("side", modify.side.as_str())
        .with("quantity", modify.quantity)
        .with("price", modify.price)
}

fn algo_params(algo: &AlgoOrderRequest) -> Params {
    Params::new()
        .with("symbol", algo.symbol.as_str())
        .with("side", algo.side.as_str())
        .with("quantity", algo.quantity)
        .with("duration", algo.duration_secs)
        .with("limitPrice", algo.limit_price.unwrap_or(Decimal::ZERO))
        .with("reduceOnly", algo.reduce_only)
        .with("positionSide", algo.position_side.clone())
        .with("clientAlgoId", algo.client_algo_id.clone())
}

fn with_order_ref(params: Params, order: &OrderRef) -> Params {
    match order {
        OrderRef::OrderId(id) => params.with("orderId", *id),
        OrderRef::ClientOrderId(id) => params.with("origClientOrderId", id.as_str()),
    }
}
