use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::time::{Duration, interval};
use tracing::{info, warn};

use crate::error::ConfigError;

// Single completion backend

pub struct Backend {
    pub url: String,
    healthy: AtomicBool,
}

impl Backend {
    pub fn new(url: String) -> Self {
        Self {
            url,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }
}

// Round-robin over completion backends

pub struct LoadBalancer {
    backends: Vec<Arc<Backend>>,
    current: AtomicUsize,
}

impl LoadBalancer {
    // Create from comma-separated urls "api.one:443, api.two:443"
    pub fn new(backends_str: &str) -> Result<Self, ConfigError> {
        let backends: Vec<Arc<Backend>> = backends_str
            .split(',')
            .map(|s| s.trim().trim_end_matches('/'))
            .filter(|s| !s.is_empty())
            .map(|url| {
                let full_url = if url.starts_with("http") {
                    url.to_string()
                } else {
                    format!("http://{}", url)
                };
                Arc::new(Backend::new(full_url))
            })
            .collect();
        if backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }

        info!("Load balancer initialized with {} backends", backends.len());
        for (i, b) in backends.iter().enumerate() {
            info!("  [{}] {}", i + 1, b.url);
        }

        Ok(Self {
            backends,
            current: AtomicUsize::new(0),
        })
    }

    // Next healthy backend (round-robin), None when all are down
    pub fn get_backend(&self) -> Option<Arc<Backend>> {
        let len = self.backends.len();
        let start = self.current.fetch_add(1, Ordering::Relaxed) % len;

        (0..len)
            .map(|i| &self.backends[(start + i) % len])
            .find(|backend| backend.is_healthy())
            .map(Arc::clone)
    }

    pub fn all_backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }
}

// Periodically probe every backend and flip its health flag

pub async fn health_checker(
    load_balancer: Arc<LoadBalancer>,
    client: reqwest::Client,
    check_interval: Duration,
    health_path: String,
) {
    let mut interval = interval(check_interval);

    info!("Health checker started (interval: {:?})", check_interval);

    loop {
        interval.tick().await;

        for backend in load_balancer.all_backends() {
            let url = format!("{}{}", backend.url, health_path);

            let was_healthy = backend.is_healthy();

            let is_healthy = match client.get(&url).timeout(Duration::from_secs(5)).send().await {
                Ok(res) => res.status().is_success(),
                Err(_) => false,
            };
            backend.set_healthy(is_healthy);

            if was_healthy != is_healthy {
                if is_healthy {
                    info!("Backend {} is now healthy", backend.url);
                } else {
                    warn!("Backend {} is now unhealthy", backend.url);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_urls() {
        let lb = LoadBalancer::new(" api.one:8000/ , https://api.two ,").unwrap();
        let urls: Vec<&str> = lb.all_backends().iter().map(|b| b.url.as_str()).collect();
        assert_eq!(urls, vec!["http://api.one:8000", "https://api.two"]);
    }

    #[test]
    fn empty_list_is_an_error() {
        assert!(matches!(LoadBalancer::new(" , "), Err(ConfigError::NoBackends)));
    }

    #[test]
    fn rotates_and_skips_unhealthy() {
        let lb = LoadBalancer::new("a,b,c").unwrap();
        let first = lb.get_backend().unwrap().url.clone();
        let second = lb.get_backend().unwrap().url.clone();
        assert_ne!(first, second);

        lb.all_backends()[1].set_healthy(false);
        for _ in 0..6 {
            assert_ne!(lb.get_backend().unwrap().url, "http://b");
        }

        for b in lb.all_backends() {
            b.set_healthy(false);
        }
        assert!(lb.get_backend().is_none());
    }
}
