//! Configuration validation

use super::schema::{Config, LimitsConfig, ProxyConfig};
use crate::error::{Result, ValidationError};
use std::collections::HashSet;

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate entire configuration
    pub fn validate(config: &Config) -> Result<()> {
        Self::validate_proxies(&config.proxies)?;
        Self::validate_limits(&config.limits)?;
        Ok(())
    }

    /// Each proxy needs a target, and fixed listen ports must be unique
    pub fn validate_proxies(proxies: &[ProxyConfig]) -> Result<()> {
        let mut seen = HashSet::new();

        for proxy in proxies {
            if proxy.target_host.trim().is_empty() {
                return Err(ValidationError::EmptyTargetHost {
                    listen_port: proxy.listen_port,
                }
                .into());
            }

            if proxy.target_port == 0 {
                return Err(ValidationError::InvalidTargetPort {
                    listen_port: proxy.listen_port,
                }
                .into());
            }

            // port 0 asks the OS for an ephemeral port, so repeats are fine
            if proxy.listen_port != 0 && !seen.insert(proxy.listen_port) {
                return Err(ValidationError::DuplicateListenPort {
                    port: proxy.listen_port,
                }
                .into());
            }
        }

        Ok(())
    }

    fn validate_limits(limits: &LimitsConfig) -> Result<()> {
        if limits.max_connections == Some(0) {
            return Err(ValidationError::ZeroLimit {
                name: "max_connections",
            }
            .into());
        }
        if limits.connect_timeout_ms == Some(0) {
            return Err(ValidationError::ZeroLimit {
                name: "connect_timeout_ms",
            }
            .into());
        }
        if limits.idle_timeout_ms == Some(0) {
            return Err(ValidationError::ZeroLimit {
                name: "idle_timeout_ms",
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FirewallError;

    #[test]
    fn test_valid_proxies() {
        let proxies = vec![
            ProxyConfig::new(8080, "example.com", 80),
            ProxyConfig::new(0, "127.0.0.1", 9100),
            ProxyConfig::new(0, "127.0.0.1", 9101),
        ];
        assert!(ConfigValidator::validate_proxies(&proxies).is_ok());
    }

    #[test]
    fn test_duplicate_listen_port() {
        let proxies = vec![
            ProxyConfig::new(8080, "a.example", 80),
            ProxyConfig::new(8080, "b.example", 80),
        ];
        let err = ConfigValidator::validate_proxies(&proxies).unwrap_err();
        assert!(matches!(
            err,
            FirewallError::Validation(ValidationError::DuplicateListenPort { port: 8080 })
        ));
    }

    #[test]
    fn test_bad_target() {
        let empty_host = vec![ProxyConfig::new(8080, "  ", 80)];
        assert!(ConfigValidator::validate_proxies(&empty_host).is_err());

        let zero_port = vec![ProxyConfig::new(8080, "example.com", 0)];
        assert!(ConfigValidator::validate_proxies(&zero_port).is_err());
    }

    #[test]
    fn test_zero_limits() {
        let mut config = Config::default();
        config.limits.max_connections = Some(0);
        assert!(ConfigValidator::validate(&config).is_err());

        config.limits.max_connections = Some(1);
        config.limits.idle_timeout_ms = Some(0);
        assert!(ConfigValidator::validate(&config).is_err());

        config.limits.idle_timeout_ms = None;
        assert!(ConfigValidator::validate(&config).is_ok());
    }
}
