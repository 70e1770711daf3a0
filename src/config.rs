//! Configuration for the gateway server.
//!
//! Everything is environment-driven: `.env` values are loaded at startup and
//! [`Config::from_env`] resolves the full tree. Providers with missing
//! credentials are simply absent from the resulting config; requests that
//! target them fail with `PROVIDER_UNAVAILABLE` instead of preventing boot.

use clap::Parser;
use std::env;
use std::net::IpAddr;
use url::Url;

/// CLI arguments for the gateway server.
#[derive(Parser, Debug)]
#[command(name = "dhecash-gateway")]
#[command(about = "Multi-provider payment gateway HTTP server")]
pub struct CliArgs {
    /// Address to bind.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,
    /// Port to bind.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("env {0} not set")]
    MissingVar(&'static str),
    #[error("env {name} is invalid: {reason}")]
    InvalidVar { name: &'static str, reason: String },
}

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Allowed CORS origins; empty means any.
    pub cors_origins: Vec<String>,
    /// Fallback HMAC secret for webhook configs created without their own.
    pub webhook_signing_secret: Option<String>,
    pub moncash: Option<MoncashConfig>,
    pub natcash: Option<NatcashConfig>,
    pub stripe: Option<StripeConfig>,
}

/// MonCash (Digicel) credentials and endpoints.
#[derive(Debug, Clone)]
pub struct MoncashConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Host the `/Api/...` endpoints live under.
    pub api_base: Url,
    /// Host the hosted-checkout redirect URL is built from.
    pub gateway_base: Url,
}

/// NatCash credentials and endpoints.
#[derive(Debug, Clone)]
pub struct NatcashConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_base: Url,
    /// Where the processor should post status callbacks.
    pub callback_url: Url,
}

/// Stripe credentials.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub api_base: Url,
}

mod config_defaults {
    pub const MONCASH_API_BASE: &str = "https://sandbox.moncashbutton.digicelgroup.com";
    pub const MONCASH_GATEWAY_BASE: &str = "https://sandbox.moncashbutton.digicelgroup.com";
    pub const STRIPE_API_BASE: &str = "https://api.stripe.com";
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn parse_url(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::InvalidVar {
        name,
        reason: e.to_string(),
    })
}

impl Config {
    /// Resolve the configuration from the process environment.
    ///
    /// `DATABASE_URL` is the only hard requirement. Each provider section is
    /// built only when its credential pair is present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = require("DATABASE_URL")?;

        let cors_origins = optional("CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let moncash = match (optional("MONCASH_CLIENT_ID"), optional("MONCASH_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => {
                let api_base = optional("MONCASH_API_BASE_URL")
                    .unwrap_or_else(|| config_defaults::MONCASH_API_BASE.to_string());
                let gateway_base = optional("MONCASH_GATEWAY_BASE_URL")
                    .unwrap_or_else(|| config_defaults::MONCASH_GATEWAY_BASE.to_string());
                Some(MoncashConfig {
                    client_id,
                    client_secret,
                    api_base: parse_url("MONCASH_API_BASE_URL", &api_base)?,
                    gateway_base: parse_url("MONCASH_GATEWAY_BASE_URL", &gateway_base)?,
                })
            }
            _ => None,
        };

        let natcash = match (
            optional("NATCASH_CLIENT_ID"),
            optional("NATCASH_CLIENT_SECRET"),
            optional("NATCASH_API_BASE_URL"),
            optional("NATCASH_CALLBACK_URL"),
        ) {
            (Some(client_id), Some(client_secret), Some(api_base), Some(callback_url)) => {
                Some(NatcashConfig {
                    client_id,
                    client_secret,
                    api_base: parse_url("NATCASH_API_BASE_URL", &api_base)?,
                    callback_url: parse_url("NATCASH_CALLBACK_URL", &callback_url)?,
                })
            }
            _ => None,
        };

        let stripe = match (optional("STRIPE_SECRET_KEY"), optional("STRIPE_WEBHOOK_SECRET")) {
            (Some(secret_key), Some(webhook_secret)) => {
                let api_base = optional("STRIPE_API_BASE_URL")
                    .unwrap_or_else(|| config_defaults::STRIPE_API_BASE.to_string());
                Some(StripeConfig {
                    secret_key,
                    webhook_secret,
                    api_base: parse_url("STRIPE_API_BASE_URL", &api_base)?,
                })
            }
            _ => None,
        };

        Ok(Config {
            database_url,
            cors_origins,
            webhook_signing_secret: optional("WEBHOOK_SIGNING_SECRET"),
            moncash,
            natcash,
            stripe,
        })
    }
}
