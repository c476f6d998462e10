use chrono::{DateTime, Local, NaiveDate};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Minute,
    Hour,
    Day,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Throttled { window: Window, wait: Duration },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

/// Sliding minute/hour windows plus a calendar-day counter over attempted sends.
#[derive(Debug)]
pub struct RateLimiter {
    limits: RateLimits,
    attempts: VecDeque<DateTime<Local>>,
    daily_count: u32,
    last_reset: NaiveDate,
}

impl RateLimiter {
    pub fn new(limits: RateLimits, daily_count: u32, last_reset: NaiveDate) -> Self {
        Self {
            limits,
            attempts: VecDeque::new(),
            daily_count,
            last_reset,
        }
    }

    fn roll_day(&mut self, today: NaiveDate) {
        if today != self.last_reset {
            info!(previous = self.daily_count, "daily message counter reset");
            self.daily_count = 0;
            self.last_reset = today;
        }
    }

    fn prune(&mut self, now: DateTime<Local>) {
        let horizon = now - chrono::Duration::hours(1);
        while self.attempts.front().is_some_and(|t| *t <= horizon) {
            self.attempts.pop_front();
        }
    }

    pub fn check(&mut self, now: DateTime<Local>) -> Verdict {
        self.roll_day(now.date_naive());
        self.prune(now);

        if self.daily_count >= self.limits.per_day {
            let wait = now
                .date_naive()
                .succ_opt()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
                .and_then(|midnight| (midnight - now).to_std().ok())
                .unwrap_or(Duration::from_secs(24 * 3600));
            return Verdict::Throttled {
                window: Window::Day,
                wait,
            };
        }

        if self.attempts.len() >= self.limits.per_hour as usize {
            if let Some(oldest) = self.attempts.front() {
                return Verdict::Throttled {
                    window: Window::Hour,
                    wait: until(*oldest + chrono::Duration::hours(1), now),
                };
            }
        }

        let minute_ago = now - chrono::Duration::minutes(1);
        let recent: Vec<&DateTime<Local>> =
            self.attempts.iter().filter(|t| **t > minute_ago).collect();
        if recent.len() >= self.limits.per_minute as usize {
            if let Some(oldest) = recent.first() {
                return Verdict::Throttled {
                    window: Window::Minute,
                    wait: until(**oldest + chrono::Duration::minutes(1), now),
                };
            }
        }
        Verdict::Allowed
    }

    pub fn allow(&mut self, now: DateTime<Local>) -> bool {
        self.check(now).is_allowed()
    }

    pub fn record_attempt(&mut self, now: DateTime<Local>) {
        self.roll_day(now.date_naive());
        self.attempts.push_back(now);
        self.daily_count += 1;
    }

    pub fn daily_count(&self) -> u32 {
        self.daily_count
    }

    pub fn last_reset(&self) -> NaiveDate {
        self.last_reset
    }
}

fn until(at: DateTime<Local>, now: DateTime<Local>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 1, h, m, s).single().unwrap()
    }

    fn limiter(per_minute: u32, per_hour: u32, per_day: u32) -> RateLimiter {
        RateLimiter::new(
            RateLimits {
                per_minute,
                per_hour,
                per_day,
            },
            0,
            at(10, 0, 0).date_naive(),
        )
    }

    #[test]
    fn minute_window_blocks_then_slides() {
        let mut rl = limiter(2, 100, 1000);
        rl.record_attempt(at(10, 0, 0));
        rl.record_attempt(at(10, 0, 20));

        match rl.check(at(10, 0, 30)) {
            Verdict::Throttled { window, wait } => {
                assert_eq!(window, Window::Minute);
                assert_eq!(wait, Duration::from_secs(30));
            }
            other => panic!("expected throttle, got {other:?}"),
        }
        assert!(rl.allow(at(10, 1, 1)));
    }

    #[test]
    fn hour_window_counts_all_attempts() {
        let mut rl = limiter(100, 3, 1000);
        for m in [0, 10, 20] {
            rl.record_attempt(at(10, m, 0));
        }
        assert_eq!(
            rl.check(at(10, 30, 0)),
            Verdict::Throttled {
                window: Window::Hour,
                wait: Duration::from_secs(30 * 60)
            }
        );
        assert!(rl.allow(at(11, 0, 1)));
    }

    #[test]
    fn daily_cap_and_reset_on_new_date() {
        let mut rl = limiter(100, 100, 2);
        rl.record_attempt(at(10, 0, 0));
        rl.record_attempt(at(12, 0, 0));
        assert!(matches!(
            rl.check(at(14, 0, 0)),
            Verdict::Throttled {
                window: Window::Day,
                ..
            }
        ));
        assert_eq!(rl.daily_count(), 2);

        let tomorrow = Local.with_ymd_and_hms(2024, 6, 2, 0, 5, 0).single().unwrap();
        assert!(rl.allow(tomorrow));
        assert_eq!(rl.daily_count(), 0);
        assert_eq!(rl.last_reset(), tomorrow.date_naive());
    }

    #[test]
    fn counter_restored_from_snapshot_applies() {
        let mut rl = RateLimiter::new(
            RateLimits {
                per_minute: 10,
                per_hour: 10,
                per_day: 5,
            },
            5,
            at(9, 0, 0).date_naive(),
        );
        assert!(!rl.allow(at(9, 30, 0)));
    }
}
