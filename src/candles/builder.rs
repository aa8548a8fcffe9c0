use std::collections::BTreeMap;

use crate::types::{minute_floor_ms, rfc3339_utc, Bar, MINUTE_MS};

/// What a single trade did to the series.
#[derive(Debug, Clone, PartialEq)]
pub enum TradeOutcome {
    /// First trade of a fresh builder opened the first bucket.
    Opened,
    /// Folded into the current bucket.
    Updated,
    /// A new bucket opened and the previous one finalized. The caller is
    /// expected to persist `closed`.
    Transitioned { closed_bucket_ms: i64, closed: Bar },
    /// Out-of-order tick older than the current bucket. Series untouched.
    RejectedLate,
    /// Timestamp more than one minute ahead of wall clock. Series untouched.
    RejectedFuture,
    /// Non-finite or negative price. Series untouched.
    RejectedInvalid,
}

/// Per-symbol in-memory candle series.
///
/// Only the current bucket is mutable. Buckets finalize on transition and are
/// thereafter immutable; backfill merges never overwrite an existing entry.
pub struct CandleBuilder {
    ohlcv: BTreeMap<i64, Bar>,
    current: Option<i64>,
    late_drops: u64,
    future_drops: u64,
    invalid_drops: u64,
}

impl CandleBuilder {
    pub fn new() -> Self {
        Self {
            ohlcv: BTreeMap::new(),
            current: None,
            late_drops: 0,
            future_drops: 0,
            invalid_drops: 0,
        }
    }

    /// Fold one trade into the series. `now_ms` is wall clock, used only for
    /// the clock-skew guard.
    pub fn process_trade(&mut self, price: f64, size: u64, event_ms: i64, now_ms: i64) -> TradeOutcome {
        if !price.is_finite() || price < 0.0 {
            self.invalid_drops += 1;
            return TradeOutcome::RejectedInvalid;
        }
        if event_ms > now_ms + MINUTE_MS {
            self.future_drops += 1;
            return TradeOutcome::RejectedFuture;
        }

        let bucket = minute_floor_ms(event_ms);

        match self.current {
            None => {
                self.ohlcv.insert(bucket, Bar::from_trade(price, size));
                self.current = Some(bucket);
                TradeOutcome::Opened
            }
            Some(current) if bucket > current => {
                // Previous bucket is now final.
                let closed = self
                    .ohlcv
                    .get(&current)
                    .cloned()
                    .expect("current bucket always has a bar");
                self.ohlcv.insert(bucket, Bar::from_trade(price, size));
                self.current = Some(bucket);
                TradeOutcome::Transitioned {
                    closed_bucket_ms: current,
                    closed,
                }
            }
            Some(current) if bucket == current => {
                let bar = self
                    .ohlcv
                    .get_mut(&current)
                    .expect("current bucket always has a bar");
                bar.high = bar.high.max(price);
                bar.low = bar.low.min(price);
                bar.close = price;
                // Zero-size ticks move high/low/close but carry no volume.
                if size > 0 {
                    let prev_vol = bar.volume;
                    bar.vwap = Some(match bar.vwap {
                        Some(vw) if prev_vol > 0 => {
                            (vw * prev_vol as f64 + price * size as f64)
                                / (prev_vol + size) as f64
                        }
                        _ => price,
                    });
                    bar.volume = prev_vol + size;
                }
                bar.trade_count = Some(bar.trade_count.unwrap_or(0) + 1);
                TradeOutcome::Updated
            }
            Some(_) => {
                self.late_drops += 1;
                TradeOutcome::RejectedLate
            }
        }
    }

    /// Merge backfilled bars. Existing buckets always win (including the
    /// current one); returns the bars that were actually inserted.
    pub fn load_historical(&mut self, bars: &[(i64, Bar)]) -> Vec<(i64, Bar)> {
        let mut inserted = Vec::new();
        for (bucket_ms, bar) in bars {
            let aligned = minute_floor_ms(*bucket_ms);
            if self.ohlcv.contains_key(&aligned) {
                continue;
            }
            self.ohlcv.insert(aligned, bar.clone());
            inserted.push((aligned, bar.clone()));
        }
        inserted
    }

    pub fn current_bucket_ms(&self) -> Option<i64> {
        self.current
    }

    /// The open (not yet finalized) bar, if any.
    pub fn open_bar(&self) -> Option<(i64, Bar)> {
        self.current
            .and_then(|b| self.ohlcv.get(&b).map(|bar| (b, bar.clone())))
    }

    pub fn series(&self) -> &BTreeMap<i64, Bar> {
        &self.ohlcv
    }

    /// Full series keyed by RFC 3339 bucket start, for initial snapshots.
    pub fn snapshot_all(&self) -> BTreeMap<String, Bar> {
        self.ohlcv
            .iter()
            .map(|(ms, bar)| (rfc3339_utc(*ms), bar.clone()))
            .collect()
    }

    /// Current bucket plus its immediate predecessor, for delta frames.
    pub fn last_two(&self) -> BTreeMap<String, Bar> {
        self.ohlcv
            .iter()
            .rev()
            .take(2)
            .map(|(ms, bar)| (rfc3339_utc(*ms), bar.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ohlcv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ohlcv.is_empty()
    }

    pub fn late_drops(&self) -> u64 {
        self.late_drops
    }

    pub fn future_drops(&self) -> u64 {
        self.future_drops
    }

    pub fn invalid_drops(&self) -> u64 {
        self.invalid_drops
    }
}

impl Default for CandleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2023-10-11T14:30:00Z, minute-aligned.
    const T0: i64 = 1_697_034_600_000;
    const NOW: i64 = T0 + 10 * MINUTE_MS;

    #[test]
    fn folds_trades_within_one_minute() {
        let mut b = CandleBuilder::new();
        assert_eq!(b.process_trade(150.00, 10, T0 + 15_000, NOW), TradeOutcome::Opened);
        assert_eq!(b.process_trade(150.50, 5, T0 + 45_000, NOW), TradeOutcome::Updated);

        let bar = &b.series()[&T0];
        assert_eq!(bar.open, 150.00);
        assert_eq!(bar.high, 150.50);
        assert_eq!(bar.low, 150.00);
        assert_eq!(bar.close, 150.50);
        assert_eq!(bar.volume, 15);
        assert_eq!(bar.trade_count, Some(2));
    }

    #[test]
    fn transition_finalizes_the_previous_bucket() {
        let mut b = CandleBuilder::new();
        b.process_trade(150.00, 10, T0 + 15_000, NOW);
        b.process_trade(150.50, 5, T0 + 45_000, NOW);

        match b.process_trade(149.90, 8, T0 + MINUTE_MS + 2_000, NOW) {
            TradeOutcome::Transitioned { closed_bucket_ms, closed } => {
                assert_eq!(closed_bucket_ms, T0);
                assert_eq!(closed.close, 150.50);
                assert_eq!(closed.volume, 15);
            }
            other => panic!("expected transition, got {other:?}"),
        }

        assert_eq!(b.current_bucket_ms(), Some(T0 + MINUTE_MS));
        let new_bar = &b.series()[&(T0 + MINUTE_MS)];
        assert_eq!(new_bar.open, 149.90);
        assert_eq!(new_bar.volume, 8);
    }

    #[test]
    fn exact_boundary_belongs_to_the_new_bucket() {
        let mut b = CandleBuilder::new();
        b.process_trade(100.0, 1, T0, NOW);
        assert_eq!(b.current_bucket_ms(), Some(T0));

        // One millisecond before the next boundary stays in the same bucket.
        assert_eq!(
            b.process_trade(101.0, 1, T0 + MINUTE_MS - 1, NOW),
            TradeOutcome::Updated
        );
        // The boundary itself opens a new one.
        assert!(matches!(
            b.process_trade(102.0, 1, T0 + MINUTE_MS, NOW),
            TradeOutcome::Transitioned { .. }
        ));
    }

    #[test]
    fn late_ticks_are_rejected_and_counted() {
        let mut b = CandleBuilder::new();
        b.process_trade(100.0, 1, T0 + MINUTE_MS, NOW);
        let before = b.series().clone();

        assert_eq!(b.process_trade(99.0, 1, T0 + 30_000, NOW), TradeOutcome::RejectedLate);
        assert_eq!(b.late_drops(), 1);
        assert_eq!(b.series(), &before);
    }

    #[test]
    fn future_ticks_are_rejected() {
        let mut b = CandleBuilder::new();
        assert_eq!(
            b.process_trade(100.0, 1, NOW + 2 * MINUTE_MS, NOW),
            TradeOutcome::RejectedFuture
        );
        assert!(b.is_empty());
        // Exactly one minute ahead is still allowed.
        assert_eq!(b.process_trade(100.0, 1, NOW + MINUTE_MS, NOW), TradeOutcome::Opened);
    }

    #[test]
    fn zero_size_ticks_move_prices_but_not_volume() {
        let mut b = CandleBuilder::new();
        b.process_trade(100.0, 10, T0, NOW);
        b.process_trade(105.0, 0, T0 + 1_000, NOW);

        let bar = &b.series()[&T0];
        assert_eq!(bar.high, 105.0);
        assert_eq!(bar.close, 105.0);
        assert_eq!(bar.volume, 10);
    }

    #[test]
    fn monotonic_input_equals_group_by_minute_fold() {
        // Invariant: feeding monotonic trades equals a group-by-minute fold.
        let trades = [
            (10.0_f64, 5_u64, T0 + 1_000),
            (11.0, 2, T0 + 30_000),
            (9.5, 3, T0 + 59_000),
            (12.0, 1, T0 + MINUTE_MS + 5_000),
            (12.5, 4, T0 + MINUTE_MS + 40_000),
            (13.0, 6, T0 + 3 * MINUTE_MS),
        ];

        let mut b = CandleBuilder::new();
        for (p, s, t) in trades {
            b.process_trade(p, s, t, NOW);
        }

        assert_eq!(b.len(), 3);
        let first = &b.series()[&T0];
        assert_eq!((first.open, first.high, first.low, first.close), (10.0, 11.0, 9.5, 9.5));
        assert_eq!(first.volume, 10);
        let second = &b.series()[&(T0 + MINUTE_MS)];
        assert_eq!((second.open, second.close), (12.0, 12.5));
        let third = &b.series()[&(T0 + 3 * MINUTE_MS)];
        assert_eq!(third.volume, 6);

        for bar in b.series().values() {
            assert!(bar.low <= bar.open.min(bar.close));
            assert!(bar.open.max(bar.close) <= bar.high);
        }
    }

    #[test]
    fn backfill_merge_never_overwrites_local_buckets() {
        let mut b = CandleBuilder::new();
        b.process_trade(150.0, 50, T0 + 1_000, NOW);
        b.process_trade(151.0, 50, T0 + 2_000, NOW);

        let refetched = Bar {
            open: 149.9,
            high: 151.1,
            low: 149.0,
            close: 150.4,
            volume: 130,
            trade_count: None,
            vwap: None,
        };
        let prior = Bar {
            open: 148.0,
            high: 149.5,
            low: 147.9,
            close: 149.2,
            volume: 80,
            trade_count: None,
            vwap: None,
        };
        let inserted = b.load_historical(&[(T0, refetched), (T0 - MINUTE_MS, prior.clone())]);

        // Local bucket wins; only the prior minute was inserted.
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].0, T0 - MINUTE_MS);
        assert_eq!(b.series()[&T0].volume, 100);
        assert_eq!(b.series()[&(T0 - MINUTE_MS)], prior);

        // Idempotence: a second merge is a no-op.
        let again = b.load_historical(&[(T0 - MINUTE_MS, prior)]);
        assert!(again.is_empty());
    }

    #[test]
    fn last_two_returns_newest_buckets() {
        let mut b = CandleBuilder::new();
        b.process_trade(1.0, 1, T0, NOW);
        b.process_trade(2.0, 1, T0 + MINUTE_MS, NOW);
        b.process_trade(3.0, 1, T0 + 2 * MINUTE_MS, NOW);

        let two = b.last_two();
        assert_eq!(two.len(), 2);
        assert!(two.contains_key(&rfc3339_utc(T0 + MINUTE_MS)));
        assert!(two.contains_key(&rfc3339_utc(T0 + 2 * MINUTE_MS)));
    }
}
