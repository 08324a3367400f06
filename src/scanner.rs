//! Offline pair discovery.
//!
//! Price histories for every tradeable symbol are collected into a
//! `{symbol: [candles]}` dump. Every unordered symbol pair with complete,
//! equal-length close series is then run through the co-integration
//! analyzer; co-integrated pairs are ranked by how often their spread
//! crosses zero.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use crate::analysis::cointegration::analyze_with;
use crate::analysis::prices::{extract_close_prices, extract_complete};
use crate::trade::execution::gateway_box::GatewayBox;
use crate::trade::gateway::{Candle, Interval, SymbolFilter};

const PROGRESS_EVERY: usize = 20;

#[derive(Debug, Default)]
pub struct PriceCollection {
    pub histories: HashMap<String, Vec<Candle>>,
    pub successes: usize,
    pub failures: usize,
}

/// Fetches `depth` candles for every symbol the filter admits. Symbols whose
/// history is unavailable, short or gapped count as failures and are left
/// out of the dump.
pub async fn collect_price_histories(
    gateway: &GatewayBox,
    filter: &SymbolFilter,
    interval: Interval,
    depth: usize,
) -> PriceCollection {
    let symbols = gateway.symbols(filter).await;
    log::info!("[SCAN] fetched {} symbols", symbols.len());

    let start_time =
        Utc::now().timestamp() - interval.as_secs().saturating_mul(depth as u64) as i64;
    let mut collection = PriceCollection::default();
    for symbol in symbols {
        let complete = match gateway
            .candles(&symbol.name, interval, depth, start_time)
            .await
        {
            Some(candles) => match extract_complete(&candles, depth) {
                Ok(_) => Some(candles),
                Err(err) => {
                    log::debug!("[SCAN] {} discarded: {}", symbol.name, err);
                    None
                }
            },
            None => None,
        };
        match complete {
            Some(candles) => {
                collection.histories.insert(symbol.name, candles);
                collection.successes += 1;
            }
            None => collection.failures += 1,
        }

        if (collection.successes + collection.failures) % PROGRESS_EVERY == 0 {
            log::info!(
                "[SCAN] successes: {}. failures: {}",
                collection.successes,
                collection.failures
            );
        }
    }
    collection
}

pub fn write_price_history<P: AsRef<Path>>(
    path: P,
    histories: &HashMap<String, Vec<Candle>>,
) -> Result<()> {
    let path = path.as_ref();
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, histories)
        .with_context(|| format!("failed to write {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairRecord {
    pub symbol_1: String,
    pub symbol_2: String,
    pub p_value: f64,
    pub t_statistic: f64,
    pub critical_value: f64,
    pub hedge_ratio: f64,
    pub zero_crossings: usize,
}

/// Reads a `{symbol: [candles]}` JSON dump.
pub fn load_price_history<P: AsRef<Path>>(path: P) -> Result<HashMap<String, Vec<Candle>>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("failed to open price history {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse price history {}", path.display()))
}

pub fn find_cointegrated_pairs(
    history: &HashMap<String, Vec<Candle>>,
    p_threshold: f64,
) -> Vec<PairRecord> {
    let mut series: Vec<(&str, Vec<f64>)> = history
        .iter()
        .filter_map(|(symbol, candles)| {
            let closes = extract_close_prices(candles);
            if closes.is_empty() {
                log::debug!("[SCAN] {} has no usable closes", symbol);
                None
            } else {
                Some((symbol.as_str(), closes))
            }
        })
        .collect();
    series.sort_by(|a, b| a.0.cmp(b.0));

    let mut pairs = Vec::new();
    for (i, (symbol_1, closes_1)) in series.iter().enumerate() {
        for (symbol_2, closes_2) in &series[i + 1..] {
            if closes_1.len() != closes_2.len() {
                log::debug!(
                    "[SCAN] {}/{} skipped: lengths {} vs {}",
                    symbol_1,
                    symbol_2,
                    closes_1.len(),
                    closes_2.len()
                );
                continue;
            }
            let Some(result) = analyze_with(closes_1, closes_2, p_threshold) else {
                continue;
            };
            if !result.cointegrated {
                continue;
            }
            pairs.push(PairRecord {
                symbol_1: symbol_1.to_string(),
                symbol_2: symbol_2.to_string(),
                p_value: result.p_value,
                t_statistic: result.t_statistic,
                critical_value: result.critical_value,
                hedge_ratio: result.hedge_ratio,
                zero_crossings: result.zero_crossings,
            });
        }
    }

    pairs.sort_by(|a, b| b.zero_crossings.cmp(&a.zero_crossings));
    log::info!(
        "[SCAN] {} co-integrated pairs out of {} symbols",
        pairs.len(),
        series.len()
    );
    pairs
}

pub fn write_pairs_csv<P: AsRef<Path>>(path: P, pairs: &[PairRecord]) -> Result<()> {
    let path = path.as_ref();
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for pair in pairs {
        wtr.serialize(pair)?;
    }
    wtr.flush()
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::cointegration::test_series::cointegrated_pair;
    use crate::analysis::prices::candles_from_closes;
    use crate::ports::paper_gateway::PaperGateway;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn sample_history() -> HashMap<String, Vec<Candle>> {
        let (a, b) = cointegrated_pair(120, 11);
        let mut gapped = b.clone();
        gapped[40] = f64::NAN;
        let mut history = HashMap::new();
        history.insert("AAA".to_string(), candles_from_closes(&a));
        history.insert("BBB".to_string(), candles_from_closes(&b));
        history.insert("GAP".to_string(), candles_from_closes(&gapped));
        history.insert("SHORT".to_string(), candles_from_closes(&b[..80]));
        history
    }

    #[test]
    fn only_complete_equal_length_pairs_are_analyzed() {
        let pairs = find_cointegrated_pairs(&sample_history(), 0.5);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].symbol_1, "AAA");
        assert_eq!(pairs[0].symbol_2, "BBB");
        assert!((pairs[0].hedge_ratio - 2.0).abs() < 0.05);
        assert!(pairs[0].zero_crossings > 0);
    }

    #[test]
    fn zero_threshold_rejects_everything() {
        assert!(find_cointegrated_pairs(&sample_history(), 0.0).is_empty());
    }

    #[test]
    fn pairs_are_ranked_by_zero_crossings() {
        let (a, b) = cointegrated_pair(120, 11);
        let (c, d) = cointegrated_pair(120, 29);
        let mut history = HashMap::new();
        history.insert("AAA".to_string(), candles_from_closes(&a));
        history.insert("BBB".to_string(), candles_from_closes(&b));
        history.insert("CCC".to_string(), candles_from_closes(&c));
        history.insert("DDD".to_string(), candles_from_closes(&d));

        let pairs = find_cointegrated_pairs(&history, 0.5);
        assert!(pairs.iter().any(|p| p.symbol_1 == "AAA" && p.symbol_2 == "BBB"));
        assert!(pairs.iter().any(|p| p.symbol_1 == "CCC" && p.symbol_2 == "DDD"));
        assert!(pairs
            .windows(2)
            .all(|w| w[0].zero_crossings >= w[1].zero_crossings));
    }

    #[test]
    fn history_round_trips_through_json_and_csv() {
        let mut input = tempfile::NamedTempFile::new().unwrap();
        write!(
            input,
            "{}",
            serde_json::to_string(&sample_history()).unwrap()
        )
        .unwrap();
        let history = load_price_history(input.path()).unwrap();
        assert_eq!(history.len(), 4);
        assert!(history["GAP"][40].close.is_nan());

        let pairs = find_cointegrated_pairs(&history, 0.5);
        let output = tempfile::NamedTempFile::new().unwrap();
        write_pairs_csv(output.path(), &pairs).unwrap();

        let mut rdr = csv::Reader::from_path(output.path()).unwrap();
        let headers = rdr.headers().unwrap().clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec![
                "symbol_1",
                "symbol_2",
                "p_value",
                "t_statistic",
                "critical_value",
                "hedge_ratio",
                "zero_crossings"
            ]
        );
        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][0], "AAA");
    }

    fn paper_box(history: HashMap<String, Vec<Candle>>, warmup: usize) -> GatewayBox {
        let paper = PaperGateway::new(history, warmup, Decimal::ZERO).unwrap();
        GatewayBox::new(Arc::new(paper))
    }

    fn usdt_filter() -> SymbolFilter {
        SymbolFilter {
            trading_only: true,
            quote_currency: Some("USDT".to_string()),
        }
    }

    #[tokio::test]
    async fn collection_keeps_only_complete_histories() {
        let (a, b) = cointegrated_pair(30, 11);
        let mut gapped = b.clone();
        gapped[5] = f64::NAN;
        let mut history = HashMap::new();
        history.insert("AAAUSDT".to_string(), candles_from_closes(&a));
        history.insert("BBBUSDT".to_string(), candles_from_closes(&b));
        history.insert("GAPUSDT".to_string(), candles_from_closes(&gapped));
        history.insert("AAABTC".to_string(), candles_from_closes(&a));
        let gateway = paper_box(history, 30);

        let collection =
            collect_price_histories(&gateway, &usdt_filter(), Interval::Minutes(60), 30).await;
        assert_eq!(collection.successes, 2);
        assert_eq!(collection.failures, 1);
        let mut names: Vec<&String> = collection.histories.keys().collect();
        names.sort();
        assert_eq!(names, vec!["AAAUSDT", "BBBUSDT"]);
        assert_eq!(collection.histories["AAAUSDT"].len(), 30);
    }

    #[tokio::test]
    async fn short_histories_are_failures() {
        let (a, b) = cointegrated_pair(30, 11);
        let mut history = HashMap::new();
        history.insert("AAAUSDT".to_string(), candles_from_closes(&a));
        history.insert("BBBUSDT".to_string(), candles_from_closes(&b));
        let gateway = paper_box(history, 30);

        let collection =
            collect_price_histories(&gateway, &usdt_filter(), Interval::Minutes(60), 40).await;
        assert!(collection.histories.is_empty());
        assert_eq!(collection.failures, 2);
    }

    #[tokio::test]
    async fn collected_dump_feeds_the_pair_scan() {
        let (a, b) = cointegrated_pair(120, 11);
        let mut history = HashMap::new();
        history.insert("AAAUSDT".to_string(), candles_from_closes(&a));
        history.insert("BBBUSDT".to_string(), candles_from_closes(&b));
        let gateway = paper_box(history, 120);

        let collection =
            collect_price_histories(&gateway, &usdt_filter(), Interval::Minutes(60), 120).await;
        let dump = tempfile::NamedTempFile::new().unwrap();
        write_price_history(dump.path(), &collection.histories).unwrap();

        let loaded = load_price_history(dump.path()).unwrap();
        let pairs = find_cointegrated_pairs(&loaded, 0.5);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].symbol_1, "AAAUSDT");
        assert_eq!(pairs[0].symbol_2, "BBBUSDT");
    }

    #[test]
    fn missing_history_file_is_an_error() {
        assert!(load_price_history("/nonexistent/history.json").is_err());
    }
}
