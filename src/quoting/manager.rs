//! Driver loop.
//!
//! Initialises against the exchange (cancel stale orders, seed the
//! ladder), then re-converges on a fixed interval. SIGTERM and ctrl-c
//! route through the same unwind path, which cancels every order
//! carrying our prefix before the process ends.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{BotError, MarketError, RestError};
use crate::exchange::interface::ExchangeInterface;
use crate::exchange::types::{Instrument, Ticker};
use crate::quoting::converge::{self, Outcome};
use crate::quoting::ladder::{self, Ladder};

const CONVERGE_ATTEMPTS: usize = 5;
const STALE_PAUSE: Duration = Duration::from_millis(500);
const UNWIND_ATTEMPTS: usize = 5;

pub struct OrderManager {
    exchange: ExchangeInterface,
    cfg: Arc<Config>,
    starting_qty: i64,
    running_qty: i64,
}

impl OrderManager {
    /// Verify the instrument, record the opening position and clear any
    /// stale orders left over from a previous run.
    pub async fn init(exchange: ExchangeInterface, cfg: Arc<Config>) -> Result<Self, BotError> {
        if cfg.dry_run {
            info!("initializing dry run; orders logged below are what would be posted");
        } else {
            info!("initializing live run: executing real trades");
        }

        let instrument = exchange.instrument_http().await?;
        info!(
            symbol = %instrument.symbol,
            state = %instrument.state,
            tick_size = instrument.tick_size,
            "instrument"
        );
        let starting_qty = exchange.position_http().await?.current_qty;
        if !cfg.dry_run {
            let margin = exchange.margin_http().await?;
            info!(balance = margin.base_balance(), "opening margin balance");
        }

        info!("resetting: cancelling stale orders from previous runs");
        exchange.cancel_all().await?;

        Ok(Self {
            exchange,
            cfg,
            starting_qty,
            running_qty: starting_qty,
        })
    }

    pub async fn run(mut self) -> Result<(), BotError> {
        // Seed the ladder before entering the interval loop.
        match self.tick().await {
            Ok(()) => {}
            Err(e) if e.pauses_quoting() => warn!(error = %e, "quoting paused at startup"),
            Err(e) => return self.shutdown(Err(e)).await,
        }
        if self.cfg.dry_run {
            info!("dry run complete");
            self.exchange.shutdown_stream();
            return Ok(());
        }

        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + self.cfg.loop_interval,
            self.cfg.loop_interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sigterm = signal(SignalKind::terminate())?;

        let result = loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.exchange.is_stream_open() {
                        error!("realtime data connection unexpectedly closed, restarting");
                        break Err(BotError::Market(MarketError::StreamClosed));
                    }
                    metrics::counter!("laddr_ticks").increment(1);
                    match self.tick().await {
                        Ok(()) => {}
                        Err(e) if e.pauses_quoting() => warn!(error = %e, "quoting paused"),
                        Err(e) => break Err(e),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received");
                    break Ok(());
                }
                _ = sigterm.recv() => {
                    info!("termination signal received");
                    break Ok(());
                }
            }
        };
        self.shutdown(result).await
    }

    async fn tick(&mut self) -> Result<(), BotError> {
        self.sanity_check()?;
        self.log_status();
        self.place_orders().await
    }

    /// Health checks that run before any order math: market open, book
    /// non-empty, reference prices not crossed.
    fn sanity_check(&self) -> Result<(), BotError> {
        let instrument = self.exchange.instrument()?;
        if !instrument.is_open() {
            return Err(MarketError::MarketClosed {
                symbol: instrument.symbol,
                state: instrument.state,
            }
            .into());
        }
        if instrument.mid_price.is_none() && !instrument.is_index() {
            return Err(MarketError::OrderBookEmpty {
                symbol: instrument.symbol,
            }
            .into());
        }

        let ticker = self.exchange.ticker()?;
        let ladder = self.build_ladder(&ticker, &instrument);
        ladder.check_not_crossed(&ticker)?;
        info!(
            buy = ticker.buy,
            sell = ticker.sell,
            start_buy = ladder.start_buy(),
            start_sell = ladder.start_sell(),
            mid = ticker.mid,
            "ticker"
        );

        let position = self.exchange.position().current_qty;
        if ladder::long_limit_reached(&self.cfg, position) {
            info!(position, max = self.cfg.max_position, "long position limit reached, buy side paused");
        }
        if ladder::short_limit_reached(&self.cfg, position) {
            info!(position, min = self.cfg.min_position, "short position limit reached, sell side paused");
        }
        Ok(())
    }

    fn build_ladder(&self, ticker: &Ticker, instrument: &Instrument) -> Ladder {
        Ladder::from_market(
            ticker,
            instrument,
            self.exchange.highest_buy(),
            self.exchange.lowest_sell(),
            &self.cfg,
        )
    }

    fn log_status(&mut self) {
        let position = self.exchange.position();
        self.running_qty = position.current_qty;
        metrics::gauge!("laddr_position").set(self.running_qty as f64);

        if let Some(margin) = self.exchange.funds() {
            info!(balance = margin.base_balance(), "margin balance");
        }
        info!(
            position = self.running_qty,
            traded_this_run = self.running_qty - self.starting_qty,
            "position"
        );
        if self.cfg.check_position_limits {
            info!(
                min = self.cfg.min_position,
                max = self.cfg.max_position,
                "position limits"
            );
        }
        if position.current_qty != 0 {
            if let (Some(avg_cost), Ok(instrument)) =
                (position.avg_cost_price, self.exchange.instrument())
            {
                info!(
                    avg_cost,
                    avg_entry = position.avg_entry_price.unwrap_or(avg_cost),
                    notional = instrument.cost(position.current_qty, avg_cost),
                    margin = instrument.margin(position.current_qty, avg_cost),
                    "entry"
                );
            }
        }
    }

    /// Recompute the desired ladder and converge the book onto it. If a
    /// bulk amend races a fill, the whole computation restarts from live
    /// mirror state; nothing from the failed batch is assumed applied.
    async fn place_orders(&mut self) -> Result<(), BotError> {
        for attempt in 1..=CONVERGE_ATTEMPTS {
            let instrument = self.exchange.instrument()?;
            let ticker = self.exchange.ticker()?;
            let ladder = self.build_ladder(&ticker, &instrument);
            let position = self.exchange.position().current_qty;
            let (buys, sells) = ladder::desired_ladder(&ladder, &self.cfg, position);
            let existing = self.exchange.open_orders();

            let plan = converge::plan(&buys, &sells, &existing, self.cfg.relist_interval);
            if plan.is_empty() {
                debug!("ladder already converged");
                return Ok(());
            }
            match converge::execute(&self.exchange, plan, instrument.tick_log()).await? {
                Outcome::Applied => return Ok(()),
                Outcome::Stale => {
                    warn!(attempt, "recomputing after concurrent order change");
                    tokio::time::sleep(STALE_PAUSE).await;
                }
            }
        }
        warn!("book still churning after repeated recomputes, deferring to next tick");
        Ok(())
    }

    /// Cancel everything we own before the process ends. Bounded retry:
    /// the exchange may be flaky at exactly the wrong moment. An auth
    /// failure means there is no session to unwind from.
    async fn shutdown(self, result: Result<(), BotError>) -> Result<(), BotError> {
        if let Err(e) = &result {
            if e.is_fatal_auth() {
                warn!("not authenticated; could not cancel orders");
                self.exchange.shutdown_stream();
                return result;
            }
        }
        self.unwind().await;
        self.exchange.shutdown_stream();
        result
    }

    async fn unwind(&self) {
        info!("shutting down, all open orders will be cancelled");
        for attempt in 1..=UNWIND_ATTEMPTS {
            match self.exchange.cancel_all().await {
                Ok(count) => {
                    info!(count, "open orders cancelled");
                    return;
                }
                Err(RestError::Auth(e)) => {
                    warn!(error = %e, "was not authenticated; could not cancel orders");
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "cancel-all failed, retrying");
                    tokio::time::sleep(self.cfg.api_error_interval).await;
                }
            }
        }
        error!("open orders may remain on the exchange");
    }
}
