//! Usage accounting from agent bandwidth reports
//!
//! Counters are advisory telemetry. Every peer is updated with an in-place
//! `bytes = bytes + delta` so concurrent reports never lose an increment, and
//! peers are touched in public-key order so concurrent batches lock rows in
//! the same sequence.

use std::sync::Arc;

use burrow_db::entities::{client, site};
use burrow_proto::PeerBandwidth;
use sea_orm::{
    sea_query::Expr, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
};
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::config::{chrono_duration, ControlConfig};
use crate::retry::{is_transient, with_transient_retry, RetryPolicy};

/// Outcome of one report batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageReportSummary {
    /// Peers whose counters were incremented
    pub applied: usize,
    /// Unknown peers, malformed entries and idle peers left untouched
    pub skipped: usize,
    /// Peers whose update failed, retries included
    pub failed: usize,
    /// Sites marked offline because their reports went stale
    pub marked_offline: usize,
}

pub struct BandwidthAggregator {
    db: DatabaseConnection,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    stale_after: chrono::Duration,
}

impl BandwidthAggregator {
    pub fn new(db: DatabaseConnection, clock: Arc<dyn Clock>, config: &ControlConfig) -> Self {
        Self {
            db,
            clock,
            retry: config.retry,
            stale_after: chrono_duration(config.site_bandwidth_stale_after),
        }
    }

    /// Accumulate client usage reported by a Newt
    pub async fn apply_usage_report(&self, mut entries: Vec<PeerBandwidth>) -> UsageReportSummary {
        entries.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        let mut summary = UsageReportSummary::default();

        for entry in &entries {
            if entry.bytes_in < 0 || entry.bytes_out < 0 {
                debug!(peer = %entry.public_key, "Ignoring negative bandwidth entry");
                summary.skipped += 1;
                continue;
            }

            let now = self.clock.now();
            let result = with_transient_retry(&self.retry, &entry.public_key, || {
                client::Entity::update_many()
                    .col_expr(
                        client::Column::BytesIn,
                        Expr::col(client::Column::BytesIn).add(entry.bytes_in),
                    )
                    .col_expr(
                        client::Column::BytesOut,
                        Expr::col(client::Column::BytesOut).add(entry.bytes_out),
                    )
                    .col_expr(client::Column::LastBandwidthUpdate, Expr::value(now))
                    .filter(client::Column::PubKey.eq(entry.public_key.as_str()))
                    .exec(&self.db)
            })
            .await;

            self.tally(&mut summary, &entry.public_key, result.map(|r| r.rows_affected));
        }

        summary
    }

    /// Accumulate site usage reported by an exit node
    ///
    /// Peers with traffic are incremented and marked online. Idle peers go
    /// offline only once their last report is older than the staleness window
    /// or they never reported at all.
    pub async fn apply_site_usage(&self, mut entries: Vec<PeerBandwidth>) -> UsageReportSummary {
        entries.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        let mut summary = UsageReportSummary::default();

        for entry in &entries {
            if entry.bytes_in < 0 || entry.bytes_out < 0 {
                debug!(peer = %entry.public_key, "Ignoring negative bandwidth entry");
                summary.skipped += 1;
                continue;
            }

            let now = self.clock.now();

            if entry.bytes_in > 0 || entry.bytes_out > 0 {
                let result = with_transient_retry(&self.retry, &entry.public_key, || {
                    site::Entity::update_many()
                        .col_expr(
                            site::Column::BytesIn,
                            Expr::col(site::Column::BytesIn).add(entry.bytes_in),
                        )
                        .col_expr(
                            site::Column::BytesOut,
                            Expr::col(site::Column::BytesOut).add(entry.bytes_out),
                        )
                        .col_expr(site::Column::LastBandwidthUpdate, Expr::value(now))
                        .col_expr(site::Column::Online, Expr::value(true))
                        .filter(site::Column::PubKey.eq(entry.public_key.as_str()))
                        .exec(&self.db)
                })
                .await;

                self.tally(&mut summary, &entry.public_key, result.map(|r| r.rows_affected));
                continue;
            }

            let cutoff = now - self.stale_after;
            let result = with_transient_retry(&self.retry, &entry.public_key, || {
                site::Entity::update_many()
                    .col_expr(site::Column::Online, Expr::value(false))
                    .filter(site::Column::PubKey.eq(entry.public_key.as_str()))
                    .filter(site::Column::Online.eq(true))
                    .filter(
                        Condition::any()
                            .add(site::Column::LastBandwidthUpdate.lt(cutoff))
                            .add(site::Column::LastBandwidthUpdate.is_null()),
                    )
                    .exec(&self.db)
            })
            .await;

            match result {
                Ok(r) if r.rows_affected > 0 => {
                    debug!(peer = %entry.public_key, "Idle site marked offline");
                    summary.marked_offline += 1;
                }
                Ok(_) => summary.skipped += 1,
                Err(e) => self.log_failure(&entry.public_key, &e, &mut summary),
            }
        }

        summary
    }

    fn tally(&self, summary: &mut UsageReportSummary, peer: &str, result: Result<u64, DbErr>) {
        match result {
            Ok(0) => {
                debug!(peer, "Bandwidth report for unknown peer");
                summary.skipped += 1;
            }
            Ok(_) => summary.applied += 1,
            Err(e) => self.log_failure(peer, &e, summary),
        }
    }

    fn log_failure(&self, peer: &str, err: &DbErr, summary: &mut UsageReportSummary) {
        if is_transient(err) {
            error!(
                peer,
                attempts = self.retry.max_attempts,
                "Bandwidth update abandoned after retries: {}",
                err
            );
        } else {
            warn!(peer, "Bandwidth update failed: {}", err);
        }
        summary.failed += 1;
    }
}
