//! Converge open orders onto the desired ladder.
//!
//! Existing orders are paired positionally with desired rungs, side by
//! side in the same outward-first order, so the diff touches as few
//! orders as possible: matched rungs are amended only when they drift,
//! surplus orders are cancelled, missing rungs are created.

use tracing::{debug, info, warn};

use crate::error::RestError;
use crate::exchange::interface::ExchangeInterface;
use crate::exchange::types::{Order, OrderAmend, Side};
use crate::quoting::ladder::DesiredOrder;

#[derive(Debug, Clone)]
pub struct PlannedAmend {
    pub order_id: String,
    pub side: Side,
    pub from_qty: i64,
    pub from_price: f64,
    pub qty: i64,
    pub price: f64,
}

impl PlannedAmend {
    fn to_wire(&self) -> OrderAmend {
        OrderAmend {
            order_id: self.order_id.clone(),
            leaves_qty: self.qty,
            price: self.price,
        }
    }
}

#[derive(Debug, Default)]
pub struct Plan {
    pub to_amend: Vec<PlannedAmend>,
    pub to_create: Vec<DesiredOrder>,
    pub to_cancel: Vec<Order>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.to_amend.is_empty() && self.to_create.is_empty() && self.to_cancel.is_empty()
    }
}

/// What happened to a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// An amend hit an order whose status changed mid-flight (it filled
    /// or was cancelled while we were computing). The batch was aborted;
    /// recompute from live state rather than patching a stale plan.
    Stale,
}

/// Diff the desired ladder against existing open orders. Pure.
pub fn plan(
    buys: &[DesiredOrder],
    sells: &[DesiredOrder],
    existing: &[Order],
    relist_interval: f64,
) -> Plan {
    let mut buys_matched = 0usize;
    let mut sells_matched = 0usize;
    let mut out = Plan::default();

    for order in existing {
        let desired = match order.side {
            Side::Buy => {
                let d = buys.get(buys_matched);
                if d.is_some() {
                    buys_matched += 1;
                }
                d
            }
            Side::Sell => {
                let d = sells.get(sells_matched);
                if d.is_some() {
                    sells_matched += 1;
                }
                d
            }
        };

        match desired {
            // More open orders than desired rungs: cancel the surplus.
            None => out.to_cancel.push(order.clone()),
            Some(desired) => {
                let price = order.price();
                let drifted = desired.price != price
                    && price > 0.0
                    && (desired.price / price - 1.0).abs() > relist_interval;
                if desired.qty != order.leaves_qty || drifted {
                    out.to_amend.push(PlannedAmend {
                        order_id: order.order_id.clone(),
                        side: order.side,
                        from_qty: order.leaves_qty,
                        from_price: price,
                        qty: desired.qty,
                        price: desired.price,
                    });
                }
            }
        }
    }

    out.to_create.extend(buys[buys_matched..].iter().cloned());
    out.to_create.extend(sells[sells_matched..].iter().cloned());
    out
}

/// Issue a plan as bulk calls: cancels, one bulk amend, one bulk create.
pub async fn execute(
    exchange: &ExchangeInterface,
    plan: Plan,
    tick_log: u32,
) -> Result<Outcome, RestError> {
    if !plan.to_amend.is_empty() {
        for a in &plan.to_amend {
            info!(
                side = %a.side,
                from = %format!("{} @ {:.*}", a.from_qty, tick_log as usize, a.from_price),
                to = %format!("{} @ {:.*}", a.qty, tick_log as usize, a.price),
                "amending"
            );
        }
        let wire: Vec<_> = plan.to_amend.iter().map(PlannedAmend::to_wire).collect();
        match exchange.amend_bulk(wire).await {
            Ok(_) => {}
            Err(RestError::Rejected { message, .. }) if message.contains("Invalid ordStatus") => {
                warn!("amend batch hit a closed order, waiting for the mirror to converge");
                return Ok(Outcome::Stale);
            }
            Err(e) => return Err(e),
        }
    }

    if !plan.to_create.is_empty() {
        info!(count = plan.to_create.len(), "creating orders");
        let orders: Vec<_> = plan
            .to_create
            .iter()
            .map(|d| {
                info!(side = %d.side, qty = d.qty, price = %format!("{:.*}", tick_log as usize, d.price), "create");
                exchange.new_order(d.side, d.qty, d.price)
            })
            .collect();
        let created = exchange.create_bulk(orders).await?;
        for order in created.iter().filter(|o| o.ord_status == "Rejected") {
            // not retried here: the next tick's diff recreates the rung
            warn!(
                side = %order.side,
                qty = order.order_qty,
                price = order.price(),
                reason = order.text.as_deref().unwrap_or("unspecified"),
                "order rejected"
            );
        }
    }

    if !plan.to_cancel.is_empty() {
        info!(count = plan.to_cancel.len(), "cancelling surplus orders");
        for order in &plan.to_cancel {
            debug!(side = %order.side, qty = order.leaves_qty, price = order.price(), "cancel");
        }
        let ids: Vec<String> = plan.to_cancel.iter().map(|o| o.order_id.clone()).collect();
        exchange.cancel_bulk(&ids).await?;
    }

    Ok(Outcome::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired(side: Side, price: f64, qty: i64) -> DesiredOrder {
        DesiredOrder { side, price, qty }
    }

    fn open(id: &str, side: Side, price: f64, leaves: i64) -> Order {
        Order {
            order_id: id.to_string(),
            cl_ord_id: format!("laddr_{id}"),
            side,
            price: Some(price),
            order_qty: leaves,
            leaves_qty: leaves,
            ord_status: "New".to_string(),
            symbol: "XBTUSD".to_string(),
            text: None,
        }
    }

    /// Prices for a 1% ladder around 1000/1001, outward first.
    fn ladder_fixture() -> (Vec<DesiredOrder>, Vec<DesiredOrder>) {
        let buys = vec![
            desired(Side::Buy, 970.3, 300),
            desired(Side::Buy, 980.1, 200),
            desired(Side::Buy, 990.1, 100),
        ];
        let sells = vec![
            desired(Side::Sell, 1031.3, 300),
            desired(Side::Sell, 1021.1, 200),
            desired(Side::Sell, 1011.0, 100),
        ];
        (buys, sells)
    }

    fn matching_open_orders() -> Vec<Order> {
        vec![
            open("b3", Side::Buy, 970.3, 300),
            open("b2", Side::Buy, 980.1, 200),
            open("b1", Side::Buy, 990.1, 100),
            open("s3", Side::Sell, 1031.3, 300),
            open("s2", Side::Sell, 1021.1, 200),
            open("s1", Side::Sell, 1011.0, 100),
        ]
    }

    #[test]
    fn converged_book_produces_no_calls() {
        let (buys, sells) = ladder_fixture();
        let plan = plan(&buys, &sells, &matching_open_orders(), 0.01);
        assert!(plan.is_empty());
    }

    #[test]
    fn inner_fill_creates_one_order_and_amends_none() {
        let (buys, sells) = ladder_fixture();
        // the innermost buy filled and left the book
        let existing: Vec<Order> = matching_open_orders()
            .into_iter()
            .filter(|o| o.order_id != "b1")
            .collect();
        let plan = plan(&buys, &sells, &existing, 0.01);
        assert!(plan.to_amend.is_empty());
        assert!(plan.to_cancel.is_empty());
        assert_eq!(plan.to_create.len(), 1);
        assert_eq!(plan.to_create[0].price, 990.1);
        assert_eq!(plan.to_create[0].side, Side::Buy);
    }

    #[test]
    fn surplus_orders_are_cancelled() {
        let (buys, sells) = ladder_fixture();
        let mut existing = matching_open_orders();
        existing.push(open("b0", Side::Buy, 960.0, 400));
        let plan = plan(&buys, &sells, &existing, 0.01);
        assert_eq!(plan.to_cancel.len(), 1);
        assert_eq!(plan.to_cancel[0].order_id, "b0");
        assert!(plan.to_amend.is_empty());
        assert!(plan.to_create.is_empty());
    }

    #[test]
    fn quantity_difference_forces_an_amend() {
        let (buys, sells) = ladder_fixture();
        let mut existing = matching_open_orders();
        existing[1].leaves_qty = 150; // partially filled rung
        let plan = plan(&buys, &sells, &existing, 0.01);
        assert_eq!(plan.to_amend.len(), 1);
        assert_eq!(plan.to_amend[0].order_id, "b2");
        assert_eq!(plan.to_amend[0].qty, 200);
    }

    #[test]
    fn price_drift_within_tolerance_is_left_alone() {
        let (buys, sells) = ladder_fixture();
        let mut existing = matching_open_orders();
        existing[0].price = Some(971.0); // ~0.07% off, tolerance is 1%
        let plan = plan(&buys, &sells, &existing, 0.01);
        assert!(plan.is_empty());
    }

    #[test]
    fn price_drift_beyond_tolerance_is_relisted() {
        let (buys, sells) = ladder_fixture();
        let mut existing = matching_open_orders();
        existing[0].price = Some(940.0); // >3% off
        let plan = plan(&buys, &sells, &existing, 0.01);
        assert_eq!(plan.to_amend.len(), 1);
        assert_eq!(plan.to_amend[0].price, 970.3);
    }

    #[test]
    fn missing_side_is_created_wholesale() {
        let (buys, sells) = ladder_fixture();
        let existing: Vec<Order> = matching_open_orders()
            .into_iter()
            .filter(|o| o.side == Side::Buy)
            .collect();
        let plan = plan(&buys, &sells, &existing, 0.01);
        assert_eq!(plan.to_create.len(), 3);
        assert!(plan.to_create.iter().all(|d| d.side == Side::Sell));
    }
}
