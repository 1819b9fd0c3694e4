pub mod types;


pub use types::*;

use crate::upstream::{breaker_key, Strategy};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults are
    /// used, which start a gateway with no services.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config: file not found, using defaults, path={}", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            "config: loaded, path={}, services={}, instances={}, strategy={}",
            path.display(),
            config.services.len(),
            config.total_instance_count(),
            config.load_balancer.strategy
        );
        Ok(config)
    }

    /// Apply environment variable overrides for process-level tunables.
    /// The service topology itself only comes from the config file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("INSIGHTBRIDGE_LISTEN") {
            self.listen = v;
        }
        if let Ok(v) = std::env::var("INSIGHTBRIDGE_ADMIN_LISTEN") {
            self.admin_listen = v;
        }
        if let Ok(v) = std::env::var("INSIGHTBRIDGE_LB_STRATEGY") {
            self.load_balancer.strategy = v;
        }
        if let Ok(v) = std::env::var("INSIGHTBRIDGE_CB_FAILURE_THRESHOLD") {
            if let Ok(n) = v.parse::<f64>() {
                self.circuit_breaker.failure_threshold_percent = n;
            }
        }
        if let Ok(v) = std::env::var("INSIGHTBRIDGE_CB_OPEN_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.circuit_breaker.open_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("INSIGHTBRIDGE_HC_INTERVAL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.health_check.interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("INSIGHTBRIDGE_HC_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.health_check.timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("INSIGHTBRIDGE_FORWARD_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.proxy.forward_timeout_ms = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if Strategy::from_name(&self.load_balancer.strategy).is_none() {
            anyhow::bail!(
                "unknown load balancer strategy '{}', use round_robin, least_connections or weighted",
                self.load_balancer.strategy
            );
        }

        let threshold = self.circuit_breaker.failure_threshold_percent;
        if !(threshold > 0.0 && threshold <= 100.0) {
            anyhow::bail!(
                "circuit_breaker.failure_threshold_percent must be in (0, 100], got {}",
                threshold
            );
        }
        if self.health_check.enabled {
            if self.health_check.interval_secs == 0 {
                anyhow::bail!("health_check.interval_secs must be greater than 0");
            }
            if self.health_check.timeout_ms == 0 {
                anyhow::bail!("health_check.timeout_ms must be greater than 0");
            }
            if !self.health_check.path.starts_with('/') {
                anyhow::bail!("health_check.path must start with '/'");
            }
        }
        if self.proxy.forward_timeout_ms == 0 {
            anyhow::bail!("proxy.forward_timeout_ms must be greater than 0");
        }

        let mut names = HashSet::new();
        let mut prefixes = HashSet::new();
        // Breaker keys join service and instance id with '-', so distinct
        // pairs can still collide ("a-b"/"c" and "a"/"b-c").
        let mut breaker_owners: HashMap<String, (&str, &str)> = HashMap::new();
        for svc in &self.services {
            if svc.name.is_empty() {
                anyhow::bail!("service has an empty name");
            }
            if !names.insert(svc.name.as_str()) {
                anyhow::bail!("duplicate service name '{}'", svc.name);
            }
            if !svc.prefix.starts_with('/') {
                anyhow::bail!(
                    "service '{}' prefix '{}' must start with '/'",
                    svc.name, svc.prefix
                );
            }
            if !prefixes.insert(svc.prefix.trim_end_matches('/')) {
                anyhow::bail!(
                    "service '{}' reuses prefix '{}' of another service",
                    svc.name, svc.prefix
                );
            }
            if svc.instances.is_empty() {
                anyhow::bail!("service '{}' has no instances defined", svc.name);
            }

            let mut ids = HashSet::new();
            for inst in &svc.instances {
                if inst.id.is_empty() {
                    anyhow::bail!("service '{}' has an instance with empty id", svc.name);
                }
                if !ids.insert(inst.id.as_str()) {
                    anyhow::bail!(
                        "service '{}' has duplicate instance id '{}'",
                        svc.name, inst.id
                    );
                }
                let key = breaker_key(&svc.name, &inst.id);
                if let Some((other_svc, other_id)) =
                    breaker_owners.insert(key.clone(), (svc.name.as_str(), inst.id.as_str()))
                {
                    if other_svc != svc.name {
                        anyhow::bail!(
                            "instance '{}' in service '{}' and instance '{}' in service '{}' share circuit breaker key '{}'",
                            inst.id, svc.name, other_id, other_svc, key
                        );
                    }
                }
                if inst.weight == 0 {
                    anyhow::bail!(
                        "instance '{}' in service '{}' has weight 0",
                        inst.id, svc.name
                    );
                }
                validate_instance_url(&inst.url).map_err(|e| {
                    anyhow::anyhow!(
                        "instance '{}' in service '{}': {}",
                        inst.id,
                        svc.name,
                        e
                    )
                })?;
            }
        }
        Ok(())
    }

    /// Total instance count across all services.
    pub fn total_instance_count(&self) -> usize {
        self.services.iter().map(|s| s.instances.len()).sum()
    }
}

fn validate_instance_url(url: &str) -> Result<()> {
    let uri: http::Uri = url
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid url '{}': {}", url, e))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => anyhow::bail!("url '{}' must use http or https", url),
    }
    if uri.authority().is_none() {
        anyhow::bail!("url '{}' has no host", url);
    }
    Ok(())
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            admin_listen: "0.0.0.0:9091".to_string(),
            load_balancer: LoadBalancerConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            health_check: HealthCheckConfig::default(),
            proxy: ProxyConfig::default(),
            services: Vec::new(),
        }
    }
}
