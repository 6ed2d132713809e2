use chrono::{DateTime, Utc};

// Remaining maintenance time, whole hours + leftover minutes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Downtime {
    pub hours: i64,
    pub minutes: i64,
}

impl Downtime {
    pub const ZERO: Downtime = Downtime { hours: 0, minutes: 0 };

    pub fn is_over(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn describe(&self) -> String {
        format!("{} hours and {} minutes", self.hours, self.minutes)
    }
}

// Time left until `target`. Clamped to zero once `now` has reached it.
pub fn remaining(now: DateTime<Utc>, target: DateTime<Utc>) -> Downtime {
    let total_seconds = (target - now).num_seconds();
    if total_seconds <= 0 {
        return Downtime::ZERO;
    }

    Downtime {
        hours: total_seconds / 3600,
        minutes: (total_seconds % 3600) / 60,
    }
}
