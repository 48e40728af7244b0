//! Connector configuration.
//!
//! All tuning values (timeouts, intervals, grace periods) live here rather
//! than as constants, since they are exchange/deployment-specific.

use std::time::Duration;

/// Configuration for the connector's timers, deadlines, and queues.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Deadline for an order submission to be acknowledged by the exchange
    pub submit_timeout: Duration,
    /// Deadline for a cancel request to be acknowledged by the exchange
    pub cancel_timeout: Duration,
    /// Interval between status polls (balances + open orders)
    pub poll_interval: Duration,
    /// Interval between trading-rule refreshes
    pub rules_refresh_interval: Duration,
    /// How long terminal orders are retained before eviction, so that
    /// late-arriving poll/stream duplicates can still be matched
    pub terminal_retention: Duration,
    /// How long an acknowledged order may be absent from the open-order
    /// snapshot before a direct status query is forced
    pub missing_order_grace: Duration,
    /// Depth of the outbound request queue (senders block when full)
    pub request_queue_depth: usize,
    /// Maximum number of outbound requests in flight at once
    pub max_in_flight_requests: usize,
    /// Cap on the exponential backoff between stream resubscribe attempts
    pub stream_reconnect_max_backoff: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(30),
            cancel_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_secs(10),
            rules_refresh_interval: Duration::from_secs(30 * 60),
            terminal_retention: Duration::from_secs(10 * 60),
            missing_order_grace: Duration::from_secs(30),
            request_queue_depth: 64,
            max_in_flight_requests: 4,
            stream_reconnect_max_backoff: Duration::from_secs(60),
        }
    }
}

impl ConnectorConfig {
    /// Config for latency-sensitive trading (tighter deadlines, faster polls)
    pub fn responsive() -> Self {
        Self {
            submit_timeout: Duration::from_secs(10),
            cancel_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            missing_order_grace: Duration::from_secs(10),
            ..Default::default()
        }
    }

    /// Config for rate-limit-constrained exchanges (slower polls, serial requests)
    pub fn conservative() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            missing_order_grace: Duration::from_secs(90),
            max_in_flight_requests: 1,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_differ_from_default() {
        let default = ConnectorConfig::default();
        assert!(ConnectorConfig::responsive().poll_interval < default.poll_interval);
        assert!(ConnectorConfig::conservative().poll_interval > default.poll_interval);
        assert_eq!(ConnectorConfig::conservative().max_in_flight_requests, 1);
    }
}
