use tokio::time::Instant;

const WATT_MILLIS_PER_WH: i64 = 3_600_000;

/// Integrates production power into whole watt-hours.
///
/// Each update credits the previous power reading for the time elapsed since
/// it was taken. Negative power counts as zero; a missing reading breaks the
/// chain so the gap is not credited.
#[derive(Debug, Clone, Default)]
pub struct EnergyCounter {
    last: Option<(Instant, i64)>,
    total_wh: i64,
    remainder_w_ms: i64,
}

impl EnergyCounter {
    pub fn update(&mut self, power_w: Option<i64>, now: Instant) -> i64 {
        if let Some((at, previous)) = self.last {
            let elapsed_ms = i64::try_from(now.saturating_duration_since(at).as_millis())
                .unwrap_or(i64::MAX);
            let accumulated = self
                .remainder_w_ms
                .saturating_add(previous.saturating_mul(elapsed_ms));
            self.total_wh = self
                .total_wh
                .saturating_add(accumulated / WATT_MILLIS_PER_WH);
            self.remainder_w_ms = accumulated % WATT_MILLIS_PER_WH;
        }

        self.last = power_w.map(|power| (now, power.max(0)));
        self.total_wh
    }

    pub fn total_wh(&self) -> i64 {
        self.total_wh
    }
}
