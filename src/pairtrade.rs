use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};

use crate::analysis::prices::extract_complete;
use crate::analysis::zscore::{classify_signal, latest_zscore, SignalSide, ZScoreReading};
use crate::config::StatbotConfig;
use crate::ports::paper_gateway::PaperGateway;
use crate::trade::execution::gateway_box::GatewayBox;
use crate::trade::execution::order_check::{inspect_order, OrderCheck};
use crate::trade::gateway::{
    ExchangeGateway, Order, OrderRequest, OrderType, PositionInfo, Side, TimeInForce,
};
use crate::trade::sizing::{
    average_trade_size, build_order, mid_price, Direction, SymbolPrecision, TradeDetails,
};

const PUBLIC_TRADES_LIMIT: usize = 50;

/// Where the pair trade stands. Passed into and returned from every tick.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionState {
    Seeking,
    Monitoring(OpenTrade),
    Closing,
}

impl ExecutionState {
    pub fn code(&self) -> u8 {
        match self {
            ExecutionState::Seeking => 0,
            ExecutionState::Monitoring(_) => 1,
            ExecutionState::Closing => 2,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExecutionState::Seeking => "SEEKING",
            ExecutionState::Monitoring(_) => "MONITORING",
            ExecutionState::Closing => "CLOSING",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenTrade {
    /// Sign of the z-score at entry; reversion is judged against it.
    pub side: SignalSide,
    pub legs: Vec<LegOrder>,
}

/// One tracked leg. Only identity and targets are kept; order status is
/// always re-read from the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct LegOrder {
    pub symbol: String,
    pub direction: Direction,
    pub order_id: Option<String>,
    pub capital_target: Decimal,
    /// Value already filled by orders this leg has replaced.
    pub filled_capital: Decimal,
    pub placed_at: Instant,
    pub retries: u32,
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TickOutcome {
    Traded,
    Idle,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub state: ExecutionState,
    pub outcome: TickOutcome,
}

impl TickReport {
    fn new(state: ExecutionState, outcome: TickOutcome) -> Self {
        Self { state, outcome }
    }

    fn skipped(state: ExecutionState, reason: impl Into<String>) -> Self {
        Self::new(state, TickOutcome::Skipped(reason.into()))
    }

    fn failed(state: ExecutionState, reason: impl Into<String>) -> Self {
        Self::new(state, TickOutcome::Failed(reason.into()))
    }
}

/// Positions and resting orders of one leg as the exchange reports them.
#[derive(Debug, Clone)]
struct LegExposure {
    symbol: String,
    positions: Vec<PositionInfo>,
    active_orders: Vec<Order>,
}

impl LegExposure {
    fn open_position(&self) -> Option<&PositionInfo> {
        self.positions.iter().find(|p| p.size > Decimal::ZERO)
    }

    fn is_flat(&self) -> bool {
        self.open_position().is_none() && self.active_orders.is_empty()
    }

    fn exposure_side(&self) -> Option<Side> {
        self.open_position()
            .map(|p| p.side)
            .or_else(|| self.active_orders.first().map(|o| o.side))
    }
}

/// Entry side implied by live legs: a short first leg (or long second leg)
/// means the trade was opened on a positive z-score.
fn infer_entry_side(first: &LegExposure, second: &LegExposure) -> Option<SignalSide> {
    if let Some(side) = first.exposure_side() {
        return Some(match side {
            Side::Sell => SignalSide::Positive,
            Side::Buy => SignalSide::Negative,
        });
    }
    second.exposure_side().map(|side| match side {
        Side::Buy => SignalSide::Positive,
        Side::Sell => SignalSide::Negative,
    })
}

/// First leg is shorted on a positive z-score, the second is bought.
pub fn leg_directions(side: SignalSide) -> (Direction, Direction) {
    match side {
        SignalSide::Positive => (Direction::Short, Direction::Long),
        SignalSide::Negative => (Direction::Long, Direction::Short),
    }
}

/// Builds the gateway named by `cfg.gateway`. Only the paper gateway ships
/// with the crate.
pub fn open_paper_gateway(cfg: &StatbotConfig) -> Result<Arc<PaperGateway>> {
    match cfg.gateway.as_str() {
        "paper" => {
            let path = cfg
                .paper_history_file
                .clone()
                .ok_or_else(|| anyhow!("paper gateway needs PAPER_HISTORY_FILE"))?;
            let paper = PaperGateway::from_file(&path, cfg.history_depth, cfg.paper_half_spread)
                .with_context(|| format!("failed to load price history {}", path))?;
            Ok(Arc::new(paper))
        }
        other => bail!("Unsupported gateway: {}", other),
    }
}

pub struct PairTradeEngine {
    cfg: StatbotConfig,
    gateway: GatewayBox,
    paper: Option<Arc<PaperGateway>>,
    lookback_secs: u64,
}

impl PairTradeEngine {
    pub async fn new(cfg: StatbotConfig) -> Result<Self> {
        let paper = open_paper_gateway(&cfg)?;
        let mut engine = Self::with_gateway(cfg, paper.clone())?;
        engine.paper = Some(paper);
        Ok(engine)
    }

    pub fn with_gateway(cfg: StatbotConfig, gateway: Arc<dyn ExchangeGateway>) -> Result<Self> {
        let lookback_secs = cfg.lookback_secs();
        if lookback_secs == 0 {
            bail!("lookback window is empty; check INTERVAL and HISTORY_DEPTH");
        }
        Ok(Self {
            cfg,
            gateway: GatewayBox::new(gateway),
            paper: None,
            lookback_secs,
        })
    }

    pub async fn prepare(&self) {
        for symbol in [&self.cfg.symbol_1, &self.cfg.symbol_2] {
            if self.gateway.apply_leverage(symbol, self.cfg.leverage).await {
                log::info!("[CONFIG] leverage for {} set to {}", symbol, self.cfg.leverage);
            } else {
                log::warn!("[CONFIG] could not set leverage for {}", symbol);
            }
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        log::info!(
            "[CONFIG] pair={}/{} interval={} depth={} window={} threshold={} p_threshold={} require_cointegration={}",
            self.cfg.symbol_1,
            self.cfg.symbol_2,
            self.cfg.interval,
            self.cfg.history_depth,
            self.cfg.zscore_window,
            self.cfg.signal_threshold,
            self.cfg.p_value_threshold,
            self.cfg.require_cointegration
        );
        self.prepare().await;

        let mut state = ExecutionState::Seeking;
        let mut ticker = tokio::time::interval(Duration::from_secs(self.cfg.tick_interval_secs));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("[TICK] Ctrl-C received, stopping in state {}", state.label());
                    break;
                }
                _ = ticker.tick() => {
                    let before = state.code();
                    let report = self.step(state).await;
                    log_report(before, &report);
                    state = report.state;

                    if let Some(paper) = &self.paper {
                        if !paper.tick() {
                            log::info!(
                                "[PAPER] End of price history reached. Unrealised PnL: {}",
                                paper.unrealised_pnl()
                            );
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Runs one transition of the state machine.
    pub async fn step(&self, state: ExecutionState) -> TickReport {
        match state {
            ExecutionState::Seeking => self.seek().await,
            ExecutionState::Monitoring(trade) => self.monitor(trade).await,
            ExecutionState::Closing => self.close().await,
        }
    }

    async fn seek(&self) -> TickReport {
        let Some((first, second)) = self.exposure().await else {
            return TickReport::skipped(
                ExecutionState::Seeking,
                "positions or active orders unavailable",
            );
        };

        if !(first.is_flat() && second.is_flat()) {
            return match infer_entry_side(&first, &second) {
                Some(side) => {
                    log::warn!(
                        "[ENTRY] legs already open on {}/{}; adopting {:?} trade",
                        first.symbol,
                        second.symbol,
                        side
                    );
                    let (dir_1, dir_2) = leg_directions(side);
                    let trade = OpenTrade {
                        side,
                        legs: vec![adopted_leg(&first, dir_1), adopted_leg(&second, dir_2)],
                    };
                    TickReport::new(ExecutionState::Monitoring(trade), TickOutcome::Idle)
                }
                None => TickReport::skipped(
                    ExecutionState::Seeking,
                    "legs not flat and entry side cannot be inferred",
                ),
            };
        }

        let reading = match self.latest_reading().await {
            Ok(reading) => reading,
            Err(reason) => return TickReport::skipped(ExecutionState::Seeking, reason),
        };
        let signal = classify_signal(reading.zscore, self.cfg.signal_threshold);
        log::debug!(
            "[TICK] z={:.4} hot={} p_value={:.4} t={:.4} crit={:.4} hedge={} crossings={}",
            signal.zscore,
            signal.hot,
            reading.coint.p_value,
            reading.coint.t_statistic,
            reading.coint.critical_value,
            reading.coint.hedge_ratio,
            reading.coint.zero_crossings
        );
        if !signal.hot {
            return TickReport::new(ExecutionState::Seeking, TickOutcome::Idle);
        }
        if self.cfg.require_cointegration && !reading.coint.cointegrated {
            log::info!(
                "[ENTRY] z={:.4} is hot but pair is not co-integrated (p_value={:.4})",
                signal.zscore,
                reading.coint.p_value
            );
            return TickReport::new(ExecutionState::Seeking, TickOutcome::Idle);
        }

        self.open_trade(signal.side, signal.zscore).await
    }

    async fn open_trade(&self, side: SignalSide, zscore: f64) -> TickReport {
        let (dir_1, dir_2) = leg_directions(side);
        let capital_1 = self.cfg.tradeable_capital * self.cfg.capital_split;
        let capital_2 = self.cfg.tradeable_capital - capital_1;
        log::info!(
            "[ENTRY] z={:.4} side={:?}: {} {:?} {} / {} {:?} {}",
            zscore,
            side,
            self.cfg.symbol_1,
            dir_1,
            capital_1,
            self.cfg.symbol_2,
            dir_2,
            capital_2
        );

        let plan = [
            (&self.cfg.symbol_1, dir_1, capital_1, self.cfg.precision_1),
            (&self.cfg.symbol_2, dir_2, capital_2, self.cfg.precision_2),
        ];
        let mut legs: Vec<LegOrder> = Vec::with_capacity(plan.len());
        for (symbol, direction, capital, precision) in plan {
            match self.submit_entry(symbol, direction, capital, precision).await {
                Some(order_id) => legs.push(LegOrder {
                    symbol: symbol.clone(),
                    direction,
                    order_id: Some(order_id),
                    capital_target: capital,
                    filled_capital: Decimal::ZERO,
                    placed_at: Instant::now(),
                    retries: 0,
                    complete: false,
                }),
                None => {
                    // Never leave a single leg working.
                    for leg in &legs {
                        let cancelled = self.gateway.cancel_all(&leg.symbol).await;
                        log::warn!(
                            "[ENTRY] {} not accepted; cancelled {} order(s) on {}",
                            symbol,
                            cancelled.len(),
                            leg.symbol
                        );
                    }
                    return TickReport::failed(
                        ExecutionState::Seeking,
                        format!("entry order for {} was not accepted", symbol),
                    );
                }
            }
        }

        self.settle().await;
        TickReport::new(
            ExecutionState::Monitoring(OpenTrade { side, legs }),
            TickOutcome::Traded,
        )
    }

    async fn submit_entry(
        &self,
        symbol: &str,
        direction: Direction,
        capital: Decimal,
        precision: SymbolPrecision,
    ) -> Option<String> {
        let book = self.gateway.book(symbol).await?;
        let details = build_order(
            &book,
            direction,
            capital,
            precision,
            self.cfg.stop_loss_fraction,
        )?;
        if details.quantity <= Decimal::ZERO {
            log::warn!("[ORDER] {} sized to zero for capital {}", symbol, capital);
            return None;
        }
        let trades = self.gateway.recent_trades(symbol, PUBLIC_TRADES_LIMIT).await;
        if let Some(avg) = average_trade_size(&trades) {
            log::debug!(
                "[ORDER] {} average trade size {} vs order {}",
                symbol,
                avg,
                details.quantity
            );
        }
        let request = self.entry_request(&details, direction);
        let order_id = self.gateway.place(&request).await?;
        log::info!(
            "[ORDER] {} {:?} qty={} price={} stop={} id={}",
            symbol,
            direction,
            details.quantity,
            details.order_price,
            details.stop_loss,
            order_id
        );
        Some(order_id)
    }

    fn entry_request(&self, details: &TradeDetails, direction: Direction) -> OrderRequest {
        let (order_type, price, time_in_force) = if self.cfg.use_limit_orders {
            (
                OrderType::Limit,
                Some(details.order_price),
                TimeInForce::PostOnly,
            )
        } else {
            (OrderType::Market, None, TimeInForce::ImmediateOrCancel)
        };
        OrderRequest {
            symbol: details.symbol.clone(),
            side: direction.order_side(),
            order_type,
            qty: details.quantity,
            price,
            stop_loss: Some(details.stop_loss),
            time_in_force,
            reduce_only: false,
            position_index: self.cfg.position_index,
        }
    }

    async fn monitor(&self, mut trade: OpenTrade) -> TickReport {
        let mut replaced = false;
        for leg in trade.legs.iter_mut().filter(|leg| !leg.complete) {
            replaced |= self.reconcile_leg(leg).await;
        }

        let reading = self.latest_reading().await;
        match &reading {
            Ok(reading) if trade.side.has_reverted(reading.zscore) => {
                log::info!(
                    "[EXIT] z={:.4} crossed zero against {:?} entry; closing",
                    reading.zscore,
                    trade.side
                );
                return TickReport::new(ExecutionState::Closing, TickOutcome::Idle);
            }
            Ok(reading) => log::debug!("[TICK] holding {:?}, z={:.4}", trade.side, reading.zscore),
            Err(reason) => log::debug!("[TICK] no z-score this tick: {}", reason),
        }

        if !replaced {
            if let Some((first, second)) = self.exposure().await {
                if first.is_flat() && second.is_flat() {
                    log::info!(
                        "[EXIT] {}/{} flat without a close signal; seeking again",
                        first.symbol,
                        second.symbol
                    );
                    return TickReport::new(ExecutionState::Seeking, TickOutcome::Idle);
                }
            }
        }

        let outcome = if replaced {
            TickOutcome::Traded
        } else {
            match reading {
                Ok(_) => TickOutcome::Idle,
                Err(reason) => TickOutcome::Skipped(reason),
            }
        };
        TickReport::new(ExecutionState::Monitoring(trade), outcome)
    }

    /// Brings one leg up to date. Returns true when a replacement order was
    /// placed.
    async fn reconcile_leg(&self, leg: &mut LegOrder) -> bool {
        let Some(order_id) = leg.order_id.clone() else {
            return self.replace_remainder(leg).await;
        };
        let (check, order) = inspect_order(&self.gateway, &leg.symbol, &order_id).await;
        log::debug!("[ORDER] {} {}: {}", leg.symbol, order_id, check);
        match check {
            OrderCheck::PositionFilled => {
                leg.complete = true;
                false
            }
            OrderCheck::TryAgain => {
                if let Some(order) = &order {
                    leg.filled_capital += self.filled_value(order).await;
                }
                leg.order_id = None;
                self.replace_remainder(leg).await
            }
            OrderCheck::OrderActive | OrderCheck::PartialFill => {
                let timeout = Duration::from_secs(self.cfg.order_timeout_secs);
                if leg.placed_at.elapsed() < timeout {
                    return false;
                }
                log::info!(
                    "[ORDER] {} {} resting for {:?} ({}); cancelling",
                    leg.symbol,
                    order_id,
                    leg.placed_at.elapsed(),
                    check
                );
                self.gateway.cancel_all(&leg.symbol).await;
                // fills can land between the status read and the cancel
                let Some(final_order) = self.gateway.order(&leg.symbol, &order_id).await else {
                    log::warn!(
                        "[ORDER] {} {} unreadable after cancel; waiting",
                        leg.symbol,
                        order_id
                    );
                    return false;
                };
                if OrderCheck::from_status(final_order.status) == OrderCheck::PositionFilled {
                    leg.complete = true;
                    return false;
                }
                leg.filled_capital += self.filled_value(&final_order).await;
                leg.order_id = None;
                self.replace_remainder(leg).await
            }
            OrderCheck::Unknown => false,
        }
    }

    async fn replace_remainder(&self, leg: &mut LegOrder) -> bool {
        let remaining = leg.capital_target - leg.filled_capital;
        if remaining <= Decimal::ZERO {
            leg.complete = true;
            return false;
        }
        if leg.retries >= self.cfg.partial_fill_max_retries {
            log::warn!(
                "[ORDER] {} retries exhausted; accepting {} of {} filled",
                leg.symbol,
                leg.filled_capital,
                leg.capital_target
            );
            leg.complete = true;
            return false;
        }
        leg.retries += 1;
        let precision = self.precision_for(&leg.symbol);
        match self
            .submit_entry(&leg.symbol, leg.direction, remaining, precision)
            .await
        {
            Some(order_id) => {
                log::info!(
                    "[ORDER] {} re-placed remainder {} (retry {})",
                    leg.symbol,
                    remaining,
                    leg.retries
                );
                leg.order_id = Some(order_id);
                leg.placed_at = Instant::now();
                self.settle().await;
                true
            }
            None => false,
        }
    }

    async fn filled_value(&self, order: &Order) -> Decimal {
        if order.filled_qty <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let price = match order.price {
            Some(price) => Some(price),
            None => match self.gateway.book(&order.symbol).await {
                Some(book) => mid_price(&book),
                None => None,
            },
        };
        match price {
            Some(price) => order.filled_qty * price,
            None => {
                log::warn!(
                    "[ORDER] no price to value {} filled on {}",
                    order.filled_qty,
                    order.symbol
                );
                Decimal::ZERO
            }
        }
    }

    async fn close(&self) -> TickReport {
        let mut placed = 0;
        for symbol in [&self.cfg.symbol_1, &self.cfg.symbol_2] {
            let cancelled = self.gateway.cancel_all(symbol).await;
            if !cancelled.is_empty() {
                log::info!("[EXIT] cancelled {} order(s) on {}", cancelled.len(), symbol);
            }
        }
        for symbol in [&self.cfg.symbol_1, &self.cfg.symbol_2] {
            let Some(positions) = self.gateway.positions(symbol).await else {
                log::warn!("[EXIT] positions for {} unavailable; skipping leg", symbol);
                continue;
            };
            for position in positions.iter().filter(|p| p.size > Decimal::ZERO) {
                let request = OrderRequest {
                    symbol: symbol.clone(),
                    side: position.side.opposite(),
                    order_type: OrderType::Market,
                    qty: position.size,
                    price: None,
                    stop_loss: None,
                    time_in_force: TimeInForce::ImmediateOrCancel,
                    reduce_only: true,
                    position_index: position.position_index,
                };
                match self.gateway.place(&request).await {
                    Some(order_id) => {
                        placed += 1;
                        log::info!(
                            "[EXIT] {} {:?} {} reduce-only id={}",
                            symbol,
                            request.side,
                            request.qty,
                            order_id
                        );
                    }
                    None => log::warn!("[EXIT] close order for {} not accepted", symbol),
                }
            }
        }
        let outcome = if placed > 0 {
            TickOutcome::Traded
        } else {
            TickOutcome::Idle
        };
        TickReport::new(ExecutionState::Seeking, outcome)
    }

    async fn exposure(&self) -> Option<(LegExposure, LegExposure)> {
        let first = self.leg_exposure(&self.cfg.symbol_1).await?;
        let second = self.leg_exposure(&self.cfg.symbol_2).await?;
        Some((first, second))
    }

    async fn leg_exposure(&self, symbol: &str) -> Option<LegExposure> {
        let positions = self.gateway.positions(symbol).await?;
        let active_orders = self.gateway.active_orders(symbol).await?;
        Some(LegExposure {
            symbol: symbol.to_string(),
            positions,
            active_orders,
        })
    }

    async fn latest_reading(&self) -> Result<ZScoreReading, String> {
        let start_time = Utc::now().timestamp() - self.lookback_secs as i64;
        let depth = self.cfg.history_depth;
        let mut series = Vec::with_capacity(2);
        for symbol in [&self.cfg.symbol_1, &self.cfg.symbol_2] {
            let candles = self
                .gateway
                .candles(symbol, self.cfg.interval, depth, start_time)
                .await
                .ok_or_else(|| format!("candles for {} unavailable", symbol))?;
            let closes = extract_complete(&candles, depth)
                .map_err(|e| format!("{}: {}", symbol, e))?;
            series.push(closes);
        }
        latest_zscore(
            &series[0],
            &series[1],
            self.cfg.zscore_window,
            self.cfg.p_value_threshold,
        )
        .ok_or_else(|| "z-score undefined for current window".to_string())
    }

    fn precision_for(&self, symbol: &str) -> SymbolPrecision {
        if symbol == self.cfg.symbol_2 {
            self.cfg.precision_2
        } else {
            self.cfg.precision_1
        }
    }

    async fn settle(&self) {
        if self.cfg.settle_delay_ms > 0 {
            sleep(Duration::from_millis(self.cfg.settle_delay_ms)).await;
        }
    }
}

fn adopted_leg(exposure: &LegExposure, direction: Direction) -> LegOrder {
    let order_id = exposure.active_orders.first().map(|o| o.order_id.clone());
    LegOrder {
        symbol: exposure.symbol.clone(),
        direction,
        complete: order_id.is_none(),
        order_id,
        capital_target: Decimal::ZERO,
        filled_capital: Decimal::ZERO,
        placed_at: Instant::now(),
        retries: 0,
    }
}

fn log_report(before: u8, report: &TickReport) {
    let after = report.state.code();
    match &report.outcome {
        TickOutcome::Failed(reason) => {
            log::error!("[TICK] {} failed: {}", report.state.label(), reason)
        }
        TickOutcome::Skipped(reason) => {
            log::warn!("[TICK] {} skipped: {}", report.state.label(), reason)
        }
        TickOutcome::Traded | TickOutcome::Idle if before != after => {
            log::info!(
                "[TICK] state {} -> {} ({:?})",
                before,
                after,
                report.outcome
            )
        }
        TickOutcome::Traded => log::info!("[TICK] {} traded", report.state.label()),
        TickOutcome::Idle => log::debug!("[TICK] {} idle", report.state.label()),
    }
}
