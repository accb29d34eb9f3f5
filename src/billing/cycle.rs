use chrono::{DateTime, Datelike, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use super::models::CycleWindow;

/// key: billing-cycle -> fixed period stepped from the subscription anchor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Daily,
    Weekly,
    #[default]
    Monthly,
    Quarterly,
    Annual,
}

impl BillingPeriod {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "daily" => Some(BillingPeriod::Daily),
            "weekly" => Some(BillingPeriod::Weekly),
            "monthly" => Some(BillingPeriod::Monthly),
            "quarterly" => Some(BillingPeriod::Quarterly),
            "annual" | "yearly" => Some(BillingPeriod::Annual),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::Daily => "daily",
            BillingPeriod::Weekly => "weekly",
            BillingPeriod::Monthly => "monthly",
            BillingPeriod::Quarterly => "quarterly",
            BillingPeriod::Annual => "annual",
        }
    }

    fn calendar_months(&self) -> Option<u32> {
        match self {
            BillingPeriod::Monthly => Some(1),
            BillingPeriod::Quarterly => Some(3),
            BillingPeriod::Annual => Some(12),
            BillingPeriod::Daily | BillingPeriod::Weekly => None,
        }
    }

    fn fixed_length(&self) -> Duration {
        match self {
            BillingPeriod::Weekly => Duration::days(7),
            _ => Duration::days(1),
        }
    }

    /// The `n`-th cycle boundary after `anchor`. Calendar periods are always
    /// measured from the anchor itself so a day-31 anchor lands on the last day
    /// of short months without drifting afterwards.
    pub fn boundary(&self, anchor: DateTime<Utc>, n: u32) -> DateTime<Utc> {
        let stepped = match self.calendar_months() {
            Some(months) => n
                .checked_mul(months)
                .and_then(|total| anchor.checked_add_months(Months::new(total))),
            None => i32::try_from(n)
                .ok()
                .and_then(|n| self.fixed_length().checked_mul(n))
                .and_then(|offset| anchor.checked_add_signed(offset)),
        };
        stepped.unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Window `[start, end)` that contains `now`. Instants before the anchor
    /// fall into the first cycle.
    pub fn window_containing(&self, anchor: DateTime<Utc>, now: DateTime<Utc>) -> CycleWindow {
        let n = if now <= anchor {
            0
        } else {
            self.cycles_elapsed(anchor, now)
        };
        CycleWindow {
            start: self.boundary(anchor, n),
            end: self.boundary(anchor, n.saturating_add(1)),
        }
    }

    fn cycles_elapsed(&self, anchor: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
        let mut n = match self.calendar_months() {
            Some(months) => {
                let elapsed = (now.year() - anchor.year()) * 12 + now.month() as i32
                    - anchor.month() as i32;
                (elapsed.max(0) as u32) / months
            }
            None => {
                let step = self.fixed_length().num_seconds();
                let elapsed = (now - anchor).num_seconds().max(0);
                u32::try_from(elapsed / step).unwrap_or(u32::MAX - 1)
            }
        };
        while n > 0 && self.boundary(anchor, n) > now {
            n -= 1;
        }
        while self.boundary(anchor, n.saturating_add(1)) <= now && n < u32::MAX - 1 {
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn monthly_window_follows_mid_month_anchor() {
        let anchor = at(2026, 3, 17, 9);
        let window = BillingPeriod::Monthly.window_containing(anchor, at(2026, 5, 2, 0));
        assert_eq!(window.start, at(2026, 4, 17, 9));
        assert_eq!(window.end, at(2026, 5, 17, 9));
    }

    #[test]
    fn boundary_instant_belongs_to_next_window() {
        let anchor = at(2026, 1, 10, 0);
        let window = BillingPeriod::Monthly.window_containing(anchor, at(2026, 2, 10, 0));
        assert_eq!(window.start, at(2026, 2, 10, 0));
        assert!(window.contains(at(2026, 2, 10, 0)));
        assert!(!window.contains(at(2026, 3, 10, 0)));
    }

    #[test]
    fn month_end_anchor_clamps_without_drift() {
        let anchor = at(2026, 1, 31, 0);
        let feb = BillingPeriod::Monthly.window_containing(anchor, at(2026, 3, 1, 0));
        assert_eq!(feb.start, at(2026, 2, 28, 0));
        assert_eq!(feb.end, at(2026, 3, 31, 0));

        let april = BillingPeriod::Monthly.window_containing(anchor, at(2026, 4, 29, 12));
        assert_eq!(april.start, at(2026, 3, 31, 0));
        assert_eq!(april.end, at(2026, 4, 30, 0));

        let may = BillingPeriod::Monthly.window_containing(anchor, at(2026, 4, 30, 12));
        assert_eq!(may.start, at(2026, 4, 30, 0));
        assert_eq!(may.end, at(2026, 5, 31, 0));
    }

    #[test]
    fn consecutive_windows_are_contiguous() {
        let anchor = at(2025, 11, 30, 6);
        let mut cursor = anchor;
        for _ in 0..24 {
            let window = BillingPeriod::Monthly.window_containing(anchor, cursor);
            assert!(window.contains(cursor));
            let next = BillingPeriod::Monthly.window_containing(anchor, window.end);
            assert_eq!(next.start, window.end);
            cursor = window.end;
        }
    }

    #[test]
    fn idle_cycles_are_skipped() {
        let anchor = at(2026, 1, 5, 0);
        let window = BillingPeriod::Weekly.window_containing(anchor, at(2026, 3, 3, 0));
        assert_eq!(window.start, at(2026, 3, 2, 0));
        assert_eq!(window.end, at(2026, 3, 9, 0));
    }

    #[test]
    fn instant_before_anchor_uses_first_cycle() {
        let anchor = at(2026, 6, 1, 0);
        let window = BillingPeriod::Quarterly.window_containing(anchor, at(2026, 5, 1, 0));
        assert_eq!(window.start, anchor);
        assert_eq!(window.end, at(2026, 9, 1, 0));
    }

    #[test]
    fn parses_configured_periods() {
        assert_eq!(BillingPeriod::parse("Yearly"), Some(BillingPeriod::Annual));
        assert_eq!(BillingPeriod::parse(" daily "), Some(BillingPeriod::Daily));
        assert_eq!(BillingPeriod::parse("fortnightly"), None);
    }
}
