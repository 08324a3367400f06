use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const RATE_LIMIT_WARN_INTERVAL: Duration = Duration::from_secs(60);

lazy_static! {
    static ref RATE_LIMIT_NOTIFIER: RateLimitNotifier = RateLimitNotifier::new();
}

/// Warns about an exchange rate limit, at most once a minute per operation.
/// Returns whether a warning was emitted.
pub fn notify_rate_limit(context: &str, detail: &str) -> bool {
    RATE_LIMIT_NOTIFIER.notify(context, detail)
}

struct RateLimitNotifier {
    pair_name: String,
    last_warned: Mutex<HashMap<String, Instant>>,
}

impl RateLimitNotifier {
    fn new() -> Self {
        let pair_name = match (std::env::var("SYMBOL_1"), std::env::var("SYMBOL_2")) {
            (Ok(a), Ok(b)) => format!("{}/{}", a, b),
            _ => String::new(),
        };
        Self {
            pair_name,
            last_warned: Mutex::new(HashMap::new()),
        }
    }

    fn notify(&self, context: &str, detail: &str) -> bool {
        let now = Instant::now();
        {
            let mut last = match self.last_warned.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(prev) = last.get(context) {
                if now.duration_since(*prev) < RATE_LIMIT_WARN_INTERVAL {
                    return false;
                }
            }
            last.insert(context.to_string(), now);
        }

        if self.pair_name.is_empty() {
            log::warn!("[RateLimit] {} hit the exchange rate limit: {}", context, detail);
        } else {
            log::warn!(
                "[{}] Rate limit - {} (detail: {})",
                self.pair_name,
                context,
                detail
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_warnings_are_throttled_per_context() {
        let notifier = RateLimitNotifier {
            pair_name: "AAA/BBB".to_string(),
            last_warned: Mutex::new(HashMap::new()),
        };
        assert!(notifier.notify("place_order", "429"));
        assert!(!notifier.notify("place_order", "429"));
        assert!(notifier.notify("fetch_candles", "429"));
    }
}
