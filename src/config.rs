use rust_decimal::Decimal;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::order::{CurrencyPolicy, PricingPolicy};
use crate::payments::{BitpayConfig, StripeConfig};

// ============================================================================
// Configuration - environment driven
// ============================================================================
//
// `from_env` reads the process environment (after `.env` is loaded);
// `from_lookup` takes any key lookup so parsing can be tested in isolation.
//
// Secrets must be set and non-empty outside development. In development a
// placeholder is used so the service can start against sandbox providers.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} must be set and non-empty in {environment} environment")]
    MissingSecret {
        key: &'static str,
        environment: String,
    },

    #[error("Invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    Postgres {
        url: String,
        max_connections: u32,
    },
    Memory,
}

#[derive(Debug, Clone)]
pub struct ExpiryPolicy {
    /// How long an unpaid order holds its stock
    pub order_ttl: chrono::Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// development | staging | production
    pub environment: String,
    pub http_bind: String,
    pub storage: StorageConfig,
    /// JSON product list loaded into the catalog at start-up
    pub catalog_seed_path: Option<String>,
    pub jwt_secret: String,
    /// Externally reachable base URL, used for provider callbacks and redirects
    pub public_base_url: String,
    pub stripe: StripeConfig,
    pub bitpay: BitpayConfig,
    pub pricing: PricingPolicy,
    pub currencies: CurrencyPolicy,
    pub expiry: ExpiryPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let environment = env.get("ENVIRONMENT").unwrap_or_else(|| "development".into());

        let storage = match env.get("STORAGE_BACKEND").as_deref() {
            None | Some("postgres") => StorageConfig::Postgres {
                url: env.get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
                max_connections: env.parse("DATABASE_MAX_CONNECTIONS", 5)?,
            },
            Some("memory") => StorageConfig::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "STORAGE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let provider_timeout = Duration::from_secs(env.parse("PROVIDER_TIMEOUT_SECONDS", 15)?);

        let bitpay_api_base = match env.get("BITPAY_API_BASE") {
            Some(base) => base,
            None => match env.get("BITPAY_ENV").as_deref() {
                None | Some("test") => "https://test.bitpay.com".to_string(),
                Some("production") => "https://bitpay.com".to_string(),
                Some(other) => {
                    return Err(ConfigError::Invalid {
                        key: "BITPAY_ENV",
                        value: other.to_string(),
                    })
                }
            },
        };

        let invoice_currencies: Vec<String> = env
            .get("INVOICE_CURRENCIES")
            .unwrap_or_else(|| "BTC".into())
            .split(',')
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .collect();

        Ok(Self {
            http_bind: env.get("HTTP_BIND").unwrap_or_else(|| "0.0.0.0:4321".into()),
            storage,
            catalog_seed_path: env.get("CATALOG_SEED_PATH"),
            jwt_secret: env.require_secret("JWT_SECRET", &environment)?,
            public_base_url: env
                .get("PUBLIC_BASE_URL")
                .unwrap_or_else(|| "http://localhost:4321".into())
                .trim_end_matches('/')
                .to_string(),
            stripe: StripeConfig {
                secret_key: env.require_secret("STRIPE_SECRET_KEY", &environment)?,
                api_base: env
                    .get("STRIPE_API_BASE")
                    .unwrap_or_else(|| "https://api.stripe.com".into()),
                timeout: provider_timeout,
            },
            bitpay: BitpayConfig {
                token: env.require_secret("BITPAY_TOKEN", &environment)?,
                api_base: bitpay_api_base,
                webhook_secret: env.require_secret("BITPAY_WEBHOOK_SECRET", &environment)?,
                timeout: provider_timeout,
            },
            pricing: PricingPolicy {
                free_shipping_threshold: env
                    .parse("FREE_SHIPPING_THRESHOLD", Decimal::new(100, 0))?,
                flat_shipping_rate: env.parse("SHIPPING_FLAT_RATE", Decimal::new(10, 0))?,
                tax_rate: env.parse("TAX_RATE", Decimal::new(15, 2))?,
            },
            currencies: CurrencyPolicy {
                base_currency: env
                    .get("BASE_CURRENCY")
                    .unwrap_or_else(|| "USD".into())
                    .to_ascii_uppercase(),
                invoice_currencies,
            },
            expiry: ExpiryPolicy {
                order_ttl: chrono::Duration::minutes(env.parse_bounded(
                    "ORDER_TTL_MINUTES",
                    1440,
                    1..=MAX_ORDER_TTL_MINUTES,
                )?),
                sweep_interval: Duration::from_secs(env.parse_bounded(
                    "EXPIRY_SWEEP_SECONDS",
                    300,
                    1..=MAX_SWEEP_SECONDS,
                )?),
            },
            environment,
        })
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }
}

// Upper bounds for the expiry settings: one year, one day.
const MAX_ORDER_TTL_MINUTES: i64 = 60 * 24 * 365;
const MAX_SWEEP_SECONDS: u64 = 60 * 60 * 24;

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid { key, value }),
        }
    }

    fn parse_bounded<T>(
        &self,
        key: &'static str,
        default: T,
        range: RangeInclusive<T>,
    ) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + ToString,
    {
        let value = self.parse(key, default)?;
        if range.contains(&value) {
            Ok(value)
        } else {
            Err(ConfigError::Invalid {
                key,
                value: value.to_string(),
            })
        }
    }

    fn require_secret(&self, key: &'static str, environment: &str) -> Result<String, ConfigError> {
        match self.get(key) {
            Some(value) => Ok(value),
            None if environment == "development" => Ok(format!("dev-{key}-not-for-production")),
            None => Err(ConfigError::MissingSecret {
                key,
                environment: environment.to_string(),
            }),
        }
    }
}
