//! Proportional shortfall allocation.
//!
//! The aggregate target is compared against what the inverters currently
//! produce. When the target is at or above the combined ceiling, or nothing
//! is producing yet, every inverter is opened up to its own ceiling.
//! Otherwise the difference between target and production is spread in
//! proportion to each inverter's share of current production, so existing
//! production ratios survive the adjustment. Results are clamped to
//! `[floor, ceiling]`. A negative difference curtails production in the
//! same proportions; it never opens inverters to their ceiling.
//!
//! Inverters with a zero ceiling carry no weight and get no limit.

/// Allocation input for one inverter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub power_w: Option<i32>,
    pub ceiling_w: i32,
    pub floor_w: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Limit(i32),
    /// Unknown or misconfigured ceiling; excluded from the distribution.
    ZeroCeiling,
    /// No telemetry yet, so no share of production to scale.
    NoTelemetry,
}

/// Returns one allocation per candidate, in input order.
pub fn distribute(target_w: i32, candidates: &[Candidate]) -> Vec<Allocation> {
    let eligible = |candidate: &Candidate| candidate.ceiling_w > 0;

    let total_ceiling: i64 = candidates
        .iter()
        .filter(|candidate| eligible(candidate))
        .map(|candidate| i64::from(candidate.ceiling_w))
        .sum();
    let total_power: i64 = candidates
        .iter()
        .filter(|candidate| eligible(candidate))
        .filter_map(|candidate| candidate.power_w)
        .map(|power| i64::from(power.max(0)))
        .sum();

    let target = i64::from(target_w);
    let saturate = target >= total_ceiling || total_power <= 0;
    let shortfall = target - total_power;

    candidates
        .iter()
        .map(|candidate| {
            if !eligible(candidate) {
                return Allocation::ZeroCeiling;
            }
            if saturate {
                return Allocation::Limit(candidate.ceiling_w);
            }
            let Some(power) = candidate.power_w else {
                return Allocation::NoTelemetry;
            };

            let power = i64::from(power.max(0));
            let share = div_round(shortfall * power, total_power);
            let floor = i64::from(candidate.floor_w.clamp(0, candidate.ceiling_w));
            let limit = (power + share).clamp(floor, i64::from(candidate.ceiling_w));
            // Bounded by ceiling_w, which is an i32.
            Allocation::Limit(limit as i32)
        })
        .collect()
}

/// Integer division rounding half away from zero. `denominator` must be > 0.
fn div_round(numerator: i64, denominator: i64) -> i64 {
    let half = denominator / 2;
    if numerator >= 0 {
        (numerator + half) / denominator
    } else {
        -((-numerator + half) / denominator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(power_w: Option<i32>, ceiling_w: i32) -> Candidate {
        Candidate {
            power_w,
            ceiling_w,
            floor_w: ceiling_w * 3 / 100,
        }
    }

    #[test]
    fn shortfall_split_follows_production_share() {
        let devices = [candidate(Some(400), 1000), candidate(Some(800), 2000)];
        assert_eq!(
            distribute(1800, &devices),
            vec![Allocation::Limit(600), Allocation::Limit(1200)]
        );
    }

    #[test]
    fn target_at_or_above_total_ceiling_saturates() {
        let devices = [candidate(Some(400), 1000), candidate(None, 2000)];
        assert_eq!(
            distribute(3000, &devices),
            vec![Allocation::Limit(1000), Allocation::Limit(2000)]
        );
        assert_eq!(
            distribute(10_000, &devices),
            vec![Allocation::Limit(1000), Allocation::Limit(2000)]
        );
    }

    #[test]
    fn nothing_producing_saturates() {
        let devices = [candidate(Some(0), 1000), candidate(None, 2000)];
        assert_eq!(
            distribute(500, &devices),
            vec![Allocation::Limit(1000), Allocation::Limit(2000)]
        );
    }

    #[test]
    fn negative_shortfall_scales_down_and_respects_floor() {
        let devices = [candidate(Some(400), 1000), candidate(Some(800), 2000)];
        // Target 600 halves both.
        assert_eq!(
            distribute(600, &devices),
            vec![Allocation::Limit(200), Allocation::Limit(400)]
        );
        // Target 0 drives both to their floors.
        assert_eq!(
            distribute(0, &devices),
            vec![Allocation::Limit(30), Allocation::Limit(60)]
        );
    }

    #[test]
    fn result_is_capped_at_ceiling() {
        let devices = [candidate(Some(900), 1000), candidate(Some(100), 2000)];
        // Shortfall 1000: 900 + 900 would exceed 1000.
        assert_eq!(
            distribute(2000, &devices),
            vec![Allocation::Limit(1000), Allocation::Limit(200)]
        );
    }

    #[test]
    fn zero_ceiling_is_excluded_from_weights() {
        let devices = [
            candidate(Some(400), 1000),
            candidate(Some(500), 0),
            candidate(Some(800), 2000),
        ];
        assert_eq!(
            distribute(1800, &devices),
            vec![
                Allocation::Limit(600),
                Allocation::ZeroCeiling,
                Allocation::Limit(1200)
            ]
        );
    }

    #[test]
    fn missing_telemetry_gets_no_share() {
        let devices = [candidate(Some(400), 1000), candidate(None, 2000)];
        assert_eq!(
            distribute(500, &devices),
            vec![Allocation::Limit(500), Allocation::NoTelemetry]
        );
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        assert_eq!(div_round(5, 2), 3);
        assert_eq!(div_round(-5, 2), -3);
        assert_eq!(div_round(4, 3), 1);
    }
}
