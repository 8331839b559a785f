// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::TcpListener;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardPortConfig {
    /// First port of the pool; `None` binds an ephemeral port instead.
    pub start_port: Option<u16>,
    /// Pool size when `start_port` is set.
    pub port_range: u16,
    pub bind_addr: String,
}

impl Default for DashboardPortConfig {
    fn default() -> Self {
        Self {
            start_port: None,
            port_range: 64,
            bind_addr: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("no free dashboard port in [{start}, {end}]")]
pub struct PortPoolExhausted {
    pub start: u16,
    pub end: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatedPort {
    /// Allocated from the configured pool; must be released.
    Pooled(u16),
    /// No pool configured; the dashboard binds port 0 and the OS picks.
    Ephemeral,
}

impl AllocatedPort {
    pub fn port_number(&self) -> u16 {
        match self {
            AllocatedPort::Pooled(port) => *port,
            AllocatedPort::Ephemeral => 0,
        }
    }
}

struct PoolState {
    cursor: u16,
    reserved: HashSet<u16>,
}

/// Round-robin dashboard-port pool. Candidates are probed by actually
/// binding a TCP listener under the lock; a port is reserved until the run
/// releases it, whatever its exit path.
pub struct DashboardPortPool {
    config: DashboardPortConfig,
    state: Mutex<PoolState>,
}

impl DashboardPortPool {
    pub fn new(config: DashboardPortConfig) -> Self {
        Self {
            state: Mutex::new(PoolState {
                cursor: 0,
                reserved: HashSet::new(),
            }),
            config,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn allocate(&self) -> Result<AllocatedPort, PortPoolExhausted> {
        let Some(start) = self.config.start_port else {
            return Ok(AllocatedPort::Ephemeral);
        };
        let range = self.config.port_range.max(1);

        let mut state = self.state.lock().await;
        for offset in 0..range {
            let slot = (state.cursor + offset) % range;
            let candidate = start + slot;
            if state.reserved.contains(&candidate) {
                continue;
            }
            if self.probe(candidate) {
                state.reserved.insert(candidate);
                state.cursor = (slot + 1) % range;
                debug!(port = candidate, "Dashboard port allocated");
                return Ok(AllocatedPort::Pooled(candidate));
            }
        }

        Err(PortPoolExhausted {
            start,
            end: start + range - 1,
        })
    }

    pub async fn release(&self, port: AllocatedPort) {
        if let AllocatedPort::Pooled(port) = port {
            let mut state = self.state.lock().await;
            state.reserved.remove(&port);
            debug!(port, "Dashboard port released");
        }
    }

    fn probe(&self, port: u16) -> bool {
        TcpListener::bind((self.config.bind_addr.as_str(), port)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    fn pool(start: u16, range: u16) -> DashboardPortPool {
        DashboardPortPool::new(DashboardPortConfig {
            start_port: Some(start),
            port_range: range,
            bind_addr: "127.0.0.1".to_string(),
        })
    }

    #[test]
    async fn no_range_means_ephemeral() {
        let pool = DashboardPortPool::new(DashboardPortConfig::default());
        let port = pool.allocate().await.unwrap();
        assert_eq!(port, AllocatedPort::Ephemeral);
        assert_eq!(port.port_number(), 0);
    }

    #[test]
    async fn allocation_reserves_and_release_frees() {
        let pool = pool(42400, 2);
        let first = pool.allocate().await.unwrap();
        let second = pool.allocate().await.unwrap();
        assert_ne!(first.port_number(), second.port_number());

        // Pool of two, both reserved.
        assert!(pool.allocate().await.is_err());

        pool.release(first).await;
        let third = pool.allocate().await.unwrap();
        assert_eq!(third.port_number(), first.port_number());
    }

    #[test]
    async fn bound_ports_are_skipped() {
        let listener = TcpListener::bind(("127.0.0.1", 42500)).unwrap();
        let pool = pool(42500, 2);
        let allocated = pool.allocate().await.unwrap();
        assert_eq!(allocated.port_number(), 42501);
        drop(listener);
    }
}
