use std::{
    collections::HashMap,
    fmt::Write as _,
    sync::{Mutex, PoisonError},
};

pub(crate) const METRICS_TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

type Counters<K> = Mutex<HashMap<K, u64>>;

/// Pipeline counters, rendered in Prometheus text format.
#[derive(Default)]
pub struct ProxyMetrics {
    proxied: Counters<&'static str>,
    skipped: Counters<&'static str>,
    failed: Counters<&'static str>,
    rate_limit_denials: Counters<()>,
    stale_retries: Counters<()>,
    lane_drops: Counters<&'static str>,
    cache_lookups: Counters<(&'static str, &'static str)>,
    origin_deletes: Counters<&'static str>,
    warnings: Counters<&'static str>,
}

fn bump<K: std::hash::Hash + Eq>(counters: &Counters<K>, key: K) {
    *counters
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(key)
        .or_insert(0) += 1;
}

fn snapshot<K: Clone + Ord>(counters: &Counters<K>) -> Vec<(K, u64)> {
    let mut entries: Vec<_> = counters
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(key, value)| (key.clone(), *value))
        .collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    entries
}

impl ProxyMetrics {
    pub(crate) fn record_proxied(&self, matched_by: &'static str) {
        bump(&self.proxied, matched_by);
    }

    pub(crate) fn record_skipped(&self, reason: &'static str) {
        bump(&self.skipped, reason);
    }

    pub(crate) fn record_failed(&self, kind: &'static str) {
        bump(&self.failed, kind);
    }

    pub(crate) fn record_rate_limit_denial(&self) {
        bump(&self.rate_limit_denials, ());
    }

    pub(crate) fn record_stale_retry(&self) {
        bump(&self.stale_retries, ());
    }

    pub(crate) fn record_lane_drop(&self, reason: &'static str) {
        bump(&self.lane_drops, reason);
    }

    pub(crate) fn record_cache_lookup(&self, cache: &'static str, hit: bool) {
        bump(&self.cache_lookups, (cache, if hit { "hit" } else { "miss" }));
    }

    pub(crate) fn record_origin_delete(&self, outcome: &'static str) {
        bump(&self.origin_deletes, outcome);
    }

    pub(crate) fn record_warning(&self, outcome: &'static str) {
        bump(&self.warnings, outcome);
    }

    /// Count recorded for `matched_by`, mostly for assertions.
    #[must_use]
    pub fn proxied_count(&self, matched_by: &str) -> u64 {
        self.proxied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(matched_by)
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut output = String::new();

        push_header(
            &mut output,
            "plume_proxied_messages_total",
            "Count of relayed messages by match kind",
        );
        for (matched_by, value) in snapshot(&self.proxied) {
            let _ = writeln!(
                output,
                "plume_proxied_messages_total{{matched_by=\"{matched_by}\"}} {value}"
            );
        }

        push_header(
            &mut output,
            "plume_skipped_messages_total",
            "Count of messages left alone by reason",
        );
        for (reason, value) in snapshot(&self.skipped) {
            let _ = writeln!(
                output,
                "plume_skipped_messages_total{{reason=\"{reason}\"}} {value}"
            );
        }

        push_header(
            &mut output,
            "plume_proxy_failures_total",
            "Count of failed proxy attempts by error kind",
        );
        for (kind, value) in snapshot(&self.failed) {
            let _ = writeln!(
                output,
                "plume_proxy_failures_total{{kind=\"{kind}\"}} {value}"
            );
        }

        push_header(
            &mut output,
            "plume_rate_limit_denials_total",
            "Count of sends refused by the relay rate limiter",
        );
        let denials: u64 = snapshot(&self.rate_limit_denials)
            .into_iter()
            .map(|(_, value)| value)
            .sum();
        let _ = writeln!(output, "plume_rate_limit_denials_total {denials}");

        push_header(
            &mut output,
            "plume_stale_relay_retries_total",
            "Count of sends retried after the relay endpoint went stale",
        );
        let stale: u64 = snapshot(&self.stale_retries)
            .into_iter()
            .map(|(_, value)| value)
            .sum();
        let _ = writeln!(output, "plume_stale_relay_retries_total {stale}");

        push_header(
            &mut output,
            "plume_lane_drops_total",
            "Count of inbound messages dropped before reaching a channel lane",
        );
        for (reason, value) in snapshot(&self.lane_drops) {
            let _ = writeln!(
                output,
                "plume_lane_drops_total{{reason=\"{reason}\"}} {value}"
            );
        }

        push_header(
            &mut output,
            "plume_cache_lookups_total",
            "Count of cache lookups by cache and result",
        );
        for ((cache, result), value) in snapshot(&self.cache_lookups) {
            let _ = writeln!(
                output,
                "plume_cache_lookups_total{{cache=\"{cache}\",result=\"{result}\"}} {value}"
            );
        }

        push_header(
            &mut output,
            "plume_origin_deletes_total",
            "Count of original-message deletions by outcome",
        );
        for (outcome, value) in snapshot(&self.origin_deletes) {
            let _ = writeln!(
                output,
                "plume_origin_deletes_total{{outcome=\"{outcome}\"}} {value}"
            );
        }

        push_header(
            &mut output,
            "plume_channel_warnings_total",
            "Count of user-facing warnings by outcome",
        );
        for (outcome, value) in snapshot(&self.warnings) {
            let _ = writeln!(
                output,
                "plume_channel_warnings_total{{outcome=\"{outcome}\"}} {value}"
            );
        }

        output
    }
}

fn push_header(output: &mut String, name: &str, help: &str) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
}
