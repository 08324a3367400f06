use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal::Error as DecimalParseError;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs::File;
use std::num::{ParseFloatError, ParseIntError};
use std::path::Path;
use std::str::FromStr;

use crate::analysis::cointegration::DEFAULT_P_VALUE_THRESHOLD;
use crate::trade::gateway::Interval;
use crate::trade::sizing::SymbolPrecision;

const DEFAULT_INTERVAL: Interval = Interval::Minutes(60);
const DEFAULT_HISTORY_DEPTH: usize = 200;
const DEFAULT_ZSCORE_WINDOW: usize = 21;
const DEFAULT_SIGNAL_THRESHOLD: f64 = 1.1;
const DEFAULT_CAPITAL: i64 = 2000;
const DEFAULT_CAPITAL_SPLIT: Decimal = Decimal::from_parts(5, 0, 0, false, 1);
const DEFAULT_STOP_LOSS_FRACTION: Decimal = Decimal::from_parts(15, 0, 0, false, 2);
const DEFAULT_TICK_INTERVAL_SECS: u64 = 5;
const DEFAULT_SETTLE_DELAY_MS: u64 = 1000;
const DEFAULT_ORDER_TIMEOUT_SECS: u64 = 120;
const DEFAULT_PARTIAL_FILL_MAX_RETRIES: u32 = 3;
const DEFAULT_PAPER_HALF_SPREAD: Decimal = Decimal::from_parts(5, 0, 0, false, 4);

#[derive(Debug)]
pub enum ConfigError {
    ParseIntError(ParseIntError),
    ParseFloatError(ParseFloatError),
    DecimalParseError(DecimalParseError),
    Missing(&'static str),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::ParseIntError(e) => write!(f, "Parse int error: {}", e),
            ConfigError::ParseFloatError(e) => write!(f, "Parse float error: {}", e),
            ConfigError::DecimalParseError(e) => write!(f, "Decimal parse error: {}", e),
            ConfigError::Missing(key) => write!(f, "Missing setting: {}", key),
            ConfigError::Invalid(e) => write!(f, "Invalid setting: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ParseIntError> for ConfigError {
    fn from(err: ParseIntError) -> ConfigError {
        ConfigError::ParseIntError(err)
    }
}

impl From<ParseFloatError> for ConfigError {
    fn from(err: ParseFloatError) -> ConfigError {
        ConfigError::ParseFloatError(err)
    }
}

impl From<DecimalParseError> for ConfigError {
    fn from(err: DecimalParseError) -> ConfigError {
        ConfigError::DecimalParseError(err)
    }
}

impl From<String> for ConfigError {
    fn from(err: String) -> ConfigError {
        ConfigError::Invalid(err)
    }
}

#[derive(Debug, Default, Deserialize)]
struct StatbotYaml {
    gateway: Option<String>,
    symbol_1: Option<String>,
    symbol_2: Option<String>,
    interval: Option<String>,
    history_depth: Option<usize>,
    zscore_window: Option<usize>,
    signal_threshold: Option<f64>,
    p_value_threshold: Option<f64>,
    require_cointegration: Option<bool>,
    tradeable_capital: Option<Decimal>,
    capital_split: Option<Decimal>,
    stop_loss_fraction: Option<Decimal>,
    price_decimals_1: Option<u32>,
    quantity_decimals_1: Option<u32>,
    price_decimals_2: Option<u32>,
    quantity_decimals_2: Option<u32>,
    use_limit_orders: Option<bool>,
    leverage: Option<Decimal>,
    tick_interval_secs: Option<u64>,
    settle_delay_ms: Option<u64>,
    order_timeout_secs: Option<u64>,
    partial_fill_max_retries: Option<u32>,
    position_index: Option<u8>,
    paper_history_file: Option<String>,
    paper_half_spread: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct StatbotConfig {
    pub gateway: String,
    pub symbol_1: String,
    pub symbol_2: String,
    pub interval: Interval,
    pub history_depth: usize,
    pub zscore_window: usize,
    pub signal_threshold: f64,
    pub p_value_threshold: f64,
    /// Entries additionally require a co-integrated verdict.
    pub require_cointegration: bool,
    pub tradeable_capital: Decimal,
    /// Share of capital put on the first leg; the rest goes to the second.
    pub capital_split: Decimal,
    pub stop_loss_fraction: Decimal,
    pub precision_1: SymbolPrecision,
    pub precision_2: SymbolPrecision,
    pub use_limit_orders: bool,
    pub leverage: Decimal,
    pub tick_interval_secs: u64,
    pub settle_delay_ms: u64,
    pub order_timeout_secs: u64,
    pub partial_fill_max_retries: u32,
    pub position_index: u8,
    pub paper_history_file: Option<String>,
    pub paper_half_spread: Decimal,
}

impl StatbotConfig {
    /// Defaults for everything except the pair and its precision.
    pub fn with_pair(
        symbol_1: &str,
        symbol_2: &str,
        precision_1: SymbolPrecision,
        precision_2: SymbolPrecision,
    ) -> Self {
        StatbotConfig {
            gateway: "paper".to_string(),
            symbol_1: symbol_1.to_string(),
            symbol_2: symbol_2.to_string(),
            interval: DEFAULT_INTERVAL,
            history_depth: DEFAULT_HISTORY_DEPTH,
            zscore_window: DEFAULT_ZSCORE_WINDOW,
            signal_threshold: DEFAULT_SIGNAL_THRESHOLD,
            p_value_threshold: DEFAULT_P_VALUE_THRESHOLD,
            require_cointegration: true,
            tradeable_capital: Decimal::from(DEFAULT_CAPITAL),
            capital_split: DEFAULT_CAPITAL_SPLIT,
            stop_loss_fraction: DEFAULT_STOP_LOSS_FRACTION,
            precision_1,
            precision_2,
            use_limit_orders: true,
            leverage: Decimal::ONE,
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            order_timeout_secs: DEFAULT_ORDER_TIMEOUT_SECS,
            partial_fill_max_retries: DEFAULT_PARTIAL_FILL_MAX_RETRIES,
            position_index: 0,
            paper_history_file: None,
            paper_half_spread: DEFAULT_PAPER_HALF_SPREAD,
        }
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("STATBOT_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty());
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        Self::from_env()
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open statbot config {}", path_ref.display()))?;
        let yaml: StatbotYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse statbot config {}", path_ref.display()))?;
        let mut cfg = Self::from_yaml(yaml)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        // the remaining settings come from apply_env_overrides
        let yaml = StatbotYaml {
            symbol_1: env_value("SYMBOL_1"),
            symbol_2: env_value("SYMBOL_2"),
            price_decimals_1: env_parsed("PRICE_DECIMALS_1")?,
            quantity_decimals_1: env_parsed("QUANTITY_DECIMALS_1")?,
            price_decimals_2: env_parsed("PRICE_DECIMALS_2")?,
            quantity_decimals_2: env_parsed("QUANTITY_DECIMALS_2")?,
            ..Default::default()
        };
        let mut cfg = Self::from_yaml(yaml)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_yaml(yaml: StatbotYaml) -> Result<Self, ConfigError> {
        let symbol_1 = yaml.symbol_1.ok_or(ConfigError::Missing("SYMBOL_1"))?;
        let symbol_2 = yaml.symbol_2.ok_or(ConfigError::Missing("SYMBOL_2"))?;
        let precision_1 = SymbolPrecision {
            price_decimals: yaml
                .price_decimals_1
                .ok_or(ConfigError::Missing("PRICE_DECIMALS_1"))?,
            quantity_decimals: yaml
                .quantity_decimals_1
                .ok_or(ConfigError::Missing("QUANTITY_DECIMALS_1"))?,
        };
        let precision_2 = SymbolPrecision {
            price_decimals: yaml
                .price_decimals_2
                .ok_or(ConfigError::Missing("PRICE_DECIMALS_2"))?,
            quantity_decimals: yaml
                .quantity_decimals_2
                .ok_or(ConfigError::Missing("QUANTITY_DECIMALS_2"))?,
        };

        let mut cfg = Self::with_pair(&symbol_1, &symbol_2, precision_1, precision_2);
        if let Some(gateway) = yaml.gateway {
            cfg.gateway = gateway;
        }
        if let Some(interval) = yaml.interval {
            cfg.interval = interval.parse()?;
        }
        cfg.history_depth = yaml.history_depth.unwrap_or(cfg.history_depth);
        cfg.zscore_window = yaml.zscore_window.unwrap_or(cfg.zscore_window);
        cfg.signal_threshold = yaml.signal_threshold.unwrap_or(cfg.signal_threshold);
        cfg.p_value_threshold = yaml.p_value_threshold.unwrap_or(cfg.p_value_threshold);
        cfg.require_cointegration = yaml
            .require_cointegration
            .unwrap_or(cfg.require_cointegration);
        cfg.tradeable_capital = yaml.tradeable_capital.unwrap_or(cfg.tradeable_capital);
        cfg.capital_split = yaml.capital_split.unwrap_or(cfg.capital_split);
        cfg.stop_loss_fraction = yaml.stop_loss_fraction.unwrap_or(cfg.stop_loss_fraction);
        cfg.use_limit_orders = yaml.use_limit_orders.unwrap_or(cfg.use_limit_orders);
        cfg.leverage = yaml.leverage.unwrap_or(cfg.leverage);
        cfg.tick_interval_secs = yaml.tick_interval_secs.unwrap_or(cfg.tick_interval_secs);
        cfg.settle_delay_ms = yaml.settle_delay_ms.unwrap_or(cfg.settle_delay_ms);
        cfg.order_timeout_secs = yaml.order_timeout_secs.unwrap_or(cfg.order_timeout_secs);
        cfg.partial_fill_max_retries = yaml
            .partial_fill_max_retries
            .unwrap_or(cfg.partial_fill_max_retries);
        cfg.position_index = yaml.position_index.unwrap_or(cfg.position_index);
        cfg.paper_history_file = yaml.paper_history_file;
        cfg.paper_half_spread = yaml.paper_half_spread.unwrap_or(cfg.paper_half_spread);
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = env_value("GATEWAY") {
            self.gateway = value;
        }
        if let Some(value) = env_value("SYMBOL_1") {
            self.symbol_1 = value;
        }
        if let Some(value) = env_value("SYMBOL_2") {
            self.symbol_2 = value;
        }
        if let Some(value) = env_parsed::<Interval>("INTERVAL")? {
            self.interval = value;
        }
        if let Some(value) = env_parsed("HISTORY_DEPTH")? {
            self.history_depth = value;
        }
        if let Some(value) = env_parsed("Z_SCORE_WINDOW")? {
            self.zscore_window = value;
        }
        if let Some(value) = env_parsed("SIGNAL_THRESHOLD")? {
            self.signal_threshold = value;
        }
        if let Some(value) = env_parsed("P_VALUE_THRESHOLD")? {
            self.p_value_threshold = value;
        }
        if let Some(value) = env_value("REQUIRE_COINTEGRATION") {
            self.require_cointegration = parse_flag(&value);
        }
        if let Some(value) = env_parsed("TRADEABLE_CAPITAL")? {
            self.tradeable_capital = value;
        }
        if let Some(value) = env_parsed("CAPITAL_SPLIT")? {
            self.capital_split = value;
        }
        if let Some(value) = env_parsed("STOP_LOSS_FRACTION")? {
            self.stop_loss_fraction = value;
        }
        if let Some(value) = env_parsed("PRICE_DECIMALS_1")? {
            self.precision_1.price_decimals = value;
        }
        if let Some(value) = env_parsed("QUANTITY_DECIMALS_1")? {
            self.precision_1.quantity_decimals = value;
        }
        if let Some(value) = env_parsed("PRICE_DECIMALS_2")? {
            self.precision_2.price_decimals = value;
        }
        if let Some(value) = env_parsed("QUANTITY_DECIMALS_2")? {
            self.precision_2.quantity_decimals = value;
        }
        if let Some(value) = env_value("USE_LIMIT_ORDERS") {
            self.use_limit_orders = parse_flag(&value);
        }
        if let Some(value) = env_parsed("LEVERAGE")? {
            self.leverage = value;
        }
        if let Some(value) = env_parsed("TICK_INTERVAL_SECS")? {
            self.tick_interval_secs = value;
        }
        if let Some(value) = env_parsed("SETTLE_DELAY_MS")? {
            self.settle_delay_ms = value;
        }
        if let Some(value) = env_parsed("ORDER_TIMEOUT_SECS")? {
            self.order_timeout_secs = value;
        }
        if let Some(value) = env_parsed("PARTIAL_FILL_MAX_RETRIES")? {
            self.partial_fill_max_retries = value;
        }
        if let Some(value) = env_parsed("POSITION_INDEX")? {
            self.position_index = value;
        }
        if let Some(value) = env_value("PAPER_HISTORY_FILE") {
            self.paper_history_file = Some(value);
        }
        if let Some(value) = env_parsed("PAPER_HALF_SPREAD")? {
            self.paper_half_spread = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol_1 == self.symbol_2 {
            return Err(ConfigError::Invalid(format!(
                "SYMBOL_1 and SYMBOL_2 are both {}",
                self.symbol_1
            )));
        }
        if self.lookback_secs() == 0 {
            return Err(ConfigError::Invalid(
                "HISTORY_DEPTH x INTERVAL gives an empty lookback window".to_string(),
            ));
        }
        if self.zscore_window < 2 || self.zscore_window > self.history_depth {
            return Err(ConfigError::Invalid(format!(
                "Z_SCORE_WINDOW must be within 2..={}, got {}",
                self.history_depth, self.zscore_window
            )));
        }
        if !(self.signal_threshold.is_finite() && self.signal_threshold > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "SIGNAL_THRESHOLD must be positive, got {}",
                self.signal_threshold
            )));
        }
        if !(self.p_value_threshold > 0.0 && self.p_value_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "P_VALUE_THRESHOLD must be within (0, 1], got {}",
                self.p_value_threshold
            )));
        }
        let unit = |name: &str, value: Decimal| {
            if value <= Decimal::ZERO || value >= Decimal::ONE {
                Err(ConfigError::Invalid(format!(
                    "{} must be within (0, 1), got {}",
                    name, value
                )))
            } else {
                Ok(())
            }
        };
        unit("CAPITAL_SPLIT", self.capital_split)?;
        unit("STOP_LOSS_FRACTION", self.stop_loss_fraction)?;
        if self.tradeable_capital <= Decimal::ZERO {
            return Err(ConfigError::Invalid(format!(
                "TRADEABLE_CAPITAL must be positive, got {}",
                self.tradeable_capital
            )));
        }
        if self.leverage <= Decimal::ZERO {
            return Err(ConfigError::Invalid(format!(
                "LEVERAGE must be positive, got {}",
                self.leverage
            )));
        }
        if self.tick_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "TICK_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        if self.gateway == "paper" && self.paper_history_file.is_none() {
            return Err(ConfigError::Missing("PAPER_HISTORY_FILE"));
        }
        Ok(())
    }

    /// Seconds of history the engine requests per evaluation.
    pub fn lookback_secs(&self) -> u64 {
        self.interval
            .as_secs()
            .saturating_mul(self.history_depth as u64)
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_parsed<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    ConfigError: From<T::Err>,
{
    match env_value(key) {
        Some(value) => Ok(Some(value.trim().parse::<T>()?)),
        None => Ok(None),
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    const PRECISION: SymbolPrecision = SymbolPrecision {
        price_decimals: 2,
        quantity_decimals: 3,
    };

    fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_follow_the_strategy() {
        let cfg = StatbotConfig::with_pair("AAA", "BBB", PRECISION, PRECISION);
        assert_eq!(cfg.zscore_window, 21);
        assert_eq!(cfg.p_value_threshold, 0.5);
        assert_eq!(cfg.capital_split, dec!(0.5));
        assert_eq!(cfg.stop_loss_fraction, dec!(0.15));
        assert_eq!(cfg.paper_half_spread, dec!(0.0005));
        assert_eq!(cfg.lookback_secs(), 60 * 60 * 200);
    }

    #[test]
    fn yaml_values_override_defaults() {
        let file = write_yaml(
            "symbol_1: AAAUSDT\n\
             symbol_2: BBBUSDT\n\
             interval: \"15\"\n\
             history_depth: 100\n\
             price_decimals_1: 2\n\
             quantity_decimals_1: 1\n\
             price_decimals_2: 4\n\
             quantity_decimals_2: 0\n\
             tradeable_capital: 500\n\
             use_limit_orders: false\n\
             paper_history_file: prices.json\n",
        );
        let cfg = StatbotConfig::from_yaml_path(file.path()).unwrap();
        assert_eq!(cfg.interval, Interval::Minutes(15));
        assert_eq!(cfg.history_depth, 100);
        assert_eq!(cfg.precision_2.price_decimals, 4);
        assert_eq!(cfg.tradeable_capital, dec!(500));
        assert!(!cfg.use_limit_orders);
        assert_eq!(cfg.paper_history_file.as_deref(), Some("prices.json"));
    }

    #[test]
    fn invalid_interval_is_rejected() {
        let file = write_yaml(
            "symbol_1: AAA\nsymbol_2: BBB\ninterval: \"7\"\n\
             price_decimals_1: 2\nquantity_decimals_1: 1\n\
             price_decimals_2: 2\nquantity_decimals_2: 1\n",
        );
        assert!(StatbotConfig::from_yaml_path(file.path()).is_err());
    }

    #[test]
    fn missing_precision_is_rejected() {
        let file = write_yaml("symbol_1: AAA\nsymbol_2: BBB\n");
        let err = StatbotConfig::from_yaml_path(file.path()).unwrap_err();
        assert!(err.to_string().contains("PRICE_DECIMALS_1"));
    }

    #[test]
    fn validation_catches_zero_lookback_and_bad_fractions() {
        let mut cfg = StatbotConfig::with_pair("AAA", "BBB", PRECISION, PRECISION);
        cfg.paper_history_file = Some("prices.json".to_string());
        assert!(cfg.validate().is_ok());

        let mut zero = cfg.clone();
        zero.history_depth = 0;
        assert!(matches!(zero.validate(), Err(ConfigError::Invalid(_))));

        let mut split = cfg.clone();
        split.capital_split = dec!(1);
        assert!(split.validate().is_err());

        let mut same = cfg.clone();
        same.symbol_2 = "AAA".to_string();
        assert!(same.validate().is_err());

        let mut paper = cfg;
        paper.paper_history_file = None;
        assert!(matches!(
            paper.validate(),
            Err(ConfigError::Missing("PAPER_HISTORY_FILE"))
        ));
    }
}
