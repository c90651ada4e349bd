use std::time::Duration;

use tokio::time::interval;

use crate::database::{DatabasePools, DatabaseTarget, PoolStats};
use crate::metrics::consts::{
    DB_CONNECTION_POOL_ACTIVE_COUNTER, DB_CONNECTION_POOL_IDLE_COUNTER,
    DB_CONNECTION_POOL_MAX_COUNTER,
};
use crate::metrics::utils::gauge;

const HIGH_UTILIZATION: f64 = 0.8;

/// Publishes connection pool gauges for both targets on a fixed interval.
pub struct DatabasePoolMonitor {
    pools: DatabasePools,
    period: Duration,
}

impl DatabasePoolMonitor {
    pub fn new(pools: DatabasePools, period: Duration) -> Self {
        Self { pools, period }
    }

    pub async fn start_monitoring(&self) {
        let mut ticker = interval(self.period);
        tracing::debug!("Starting database connection pool monitoring");

        loop {
            ticker.tick().await;
            self.collect_pool_metrics();
        }
    }

    fn collect_pool_metrics(&self) {
        for target in [DatabaseTarget::Primary, DatabaseTarget::Replica] {
            if let Some(stats) = self.pools.client(target).get_pool_stats() {
                report_pool(target, &stats);
            }
        }
    }
}

fn report_pool(target: DatabaseTarget, stats: &PoolStats) {
    let labels = [("pool".to_string(), target.as_str().to_string())];
    let active = stats.size.saturating_sub(stats.num_idle as u32);

    gauge(DB_CONNECTION_POOL_ACTIVE_COUNTER, &labels, active as f64);
    gauge(DB_CONNECTION_POOL_IDLE_COUNTER, &labels, stats.num_idle as f64);
    gauge(
        DB_CONNECTION_POOL_MAX_COUNTER,
        &labels,
        stats.max_connections as f64,
    );

    tracing::debug!(
        "{} pool metrics - active: {}, idle: {}, max: {}",
        target,
        active,
        stats.num_idle,
        stats.max_connections
    );

    if utilization(stats) > HIGH_UTILIZATION {
        tracing::warn!(
            "High {} pool utilization: {:.1}% ({}/{})",
            target,
            utilization(stats) * 100.0,
            active,
            stats.max_connections
        );
    }
}

fn utilization(stats: &PoolStats) -> f64 {
    if stats.max_connections == 0 {
        return 0.0;
    }
    stats.size.saturating_sub(stats.num_idle as u32) as f64 / stats.max_connections as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utilization() {
        let busy = PoolStats {
            size: 10,
            num_idle: 1,
            max_connections: 10,
        };
        assert!(utilization(&busy) > HIGH_UTILIZATION);

        let quiet = PoolStats {
            size: 4,
            num_idle: 4,
            max_connections: 10,
        };
        assert_eq!(utilization(&quiet), 0.0);

        let unbounded = PoolStats {
            size: 0,
            num_idle: 0,
            max_connections: 0,
        };
        assert_eq!(utilization(&unbounded), 0.0);
    }
}
