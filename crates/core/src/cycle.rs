//! ISO-8601 durations and `R{n}/...` repeat cycles.
//!
//! A failed-job retry time cycle looks like `R3/PT10M` (three attempts, ten
//! minutes apart) or `R3/2024-05-01T08:00:00Z/PT10M` (same, anchored at a
//! start instant). Only the subset the scheduler needs is supported: repeat
//! count, optional start, and a `PnYnMnWnDTnHnMnS` duration.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};

use crate::error::{EngineError, EngineResult};

/// A parsed `PnYnMnWnDTnHnMnS` duration.
///
/// Calendar parts (years, months) are applied with calendar arithmetic; the
/// rest is an exact span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoDuration {
    pub years: u32,
    pub months: u32,
    /// Days, weeks already folded in.
    pub days: u32,
    /// Hours, minutes and (fractional) seconds in milliseconds.
    pub millis: i64,
}

impl IsoDuration {
    pub fn parse(text: &str) -> EngineResult<Self> {
        let invalid = |reason: &str| EngineError::invalid_cycle(text, reason);

        let body = text
            .strip_prefix('P')
            .ok_or_else(|| invalid("duration must start with 'P'"))?;
        if body.is_empty() {
            return Err(invalid("empty duration"));
        }

        let (date_part, time_part) = match body.split_once('T') {
            Some((date, time)) => {
                if time.is_empty() {
                    return Err(invalid("'T' must be followed by a time component"));
                }
                (date, Some(time))
            }
            None => (body, None),
        };

        let mut duration = IsoDuration {
            years: 0,
            months: 0,
            days: 0,
            millis: 0,
        };

        for (value, unit) in components(date_part).map_err(|r| invalid(r))? {
            let whole = whole_number(&value).map_err(|r| invalid(r))?;
            match unit {
                'Y' => duration.years = whole,
                'M' => duration.months = whole,
                'W' => {
                    let days = whole.checked_mul(7).ok_or_else(|| invalid("week count too large"))?;
                    duration.days = duration.days.checked_add(days).ok_or_else(|| invalid("day count too large"))?;
                }
                'D' => {
                    duration.days = duration.days.checked_add(whole).ok_or_else(|| invalid("day count too large"))?;
                }
                other => return Err(invalid(&format!("unexpected date designator '{other}'"))),
            }
        }

        if let Some(time_part) = time_part {
            for (value, unit) in components(time_part).map_err(|r| invalid(r))? {
                let millis = match unit {
                    'H' => i64::from(whole_number(&value).map_err(|r| invalid(r))?) * 3_600_000,
                    'M' => i64::from(whole_number(&value).map_err(|r| invalid(r))?) * 60_000,
                    'S' => {
                        let seconds: f64 = value.parse().map_err(|_| invalid("malformed seconds"))?;
                        if !seconds.is_finite() || !(0.0..1e12).contains(&seconds) {
                            return Err(invalid("seconds out of range"));
                        }
                        (seconds * 1000.0).round() as i64
                    }
                    other => return Err(invalid(&format!("unexpected time designator '{other}'"))),
                };
                duration.millis += millis;
            }
        }

        Ok(duration)
    }

    /// `instant + self`, or `None` on calendar overflow.
    pub fn add_to(&self, instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let months = self.years.checked_mul(12)?.checked_add(self.months)?;
        instant
            .checked_add_months(Months::new(months))?
            .checked_add_signed(Duration::try_days(i64::from(self.days))?)?
            .checked_add_signed(Duration::try_milliseconds(self.millis)?)
    }

    pub fn is_zero(&self) -> bool {
        self.years == 0 && self.months == 0 && self.days == 0 && self.millis == 0
    }
}

impl FromStr for IsoDuration {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for IsoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("PT0S");
        }
        f.write_str("P")?;
        if self.years > 0 {
            write!(f, "{}Y", self.years)?;
        }
        if self.months > 0 {
            write!(f, "{}M", self.months)?;
        }
        if self.days > 0 {
            write!(f, "{}D", self.days)?;
        }
        if self.millis > 0 {
            f.write_str("T")?;
            let hours = self.millis / 3_600_000;
            let minutes = (self.millis % 3_600_000) / 60_000;
            let millis = self.millis % 60_000;
            if hours > 0 {
                write!(f, "{hours}H")?;
            }
            if minutes > 0 {
                write!(f, "{minutes}M")?;
            }
            if millis > 0 {
                if millis % 1000 == 0 {
                    write!(f, "{}S", millis / 1000)?;
                } else {
                    write!(f, "{}.{:03}S", millis / 1000, millis % 1000)?;
                }
            }
        }
        Ok(())
    }
}

/// A repeat cycle: `R{n}/{duration}` or `R{n}/{start}/{duration}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurationCycle {
    /// Number of attempts the cycle allows.
    pub repeat: u32,
    pub start: Option<DateTime<Utc>>,
    pub duration: IsoDuration,
    source: String,
}

impl DurationCycle {
    pub fn parse(text: &str) -> EngineResult<Self> {
        let source = text.trim();
        let invalid = |reason: &str| EngineError::invalid_cycle(source, reason);

        let parts: Vec<&str> = source.split('/').collect();
        let (repeat, start, duration) = match parts.as_slice() {
            [repeat, duration] => (*repeat, None, *duration),
            [repeat, start, duration] => (*repeat, Some(*start), *duration),
            _ => return Err(invalid("expected R{n}/{duration} or R{n}/{start}/{duration}")),
        };

        let count = repeat
            .strip_prefix('R')
            .ok_or_else(|| invalid("cycle must start with 'R'"))?;
        if count.is_empty() {
            return Err(invalid("missing repeat count"));
        }
        let repeat: u32 = count
            .parse()
            .map_err(|_| invalid("repeat count is not a number"))?;
        if repeat == 0 {
            return Err(invalid("repeat count must be at least 1"));
        }

        let start = start
            .map(|start| {
                DateTime::parse_from_rfc3339(start)
                    .map(|instant| instant.with_timezone(&Utc))
                    .map_err(|e| invalid(&format!("bad start instant: {e}")))
            })
            .transpose()?;

        if duration.is_empty() {
            return Err(invalid("empty duration"));
        }
        let duration = IsoDuration::parse(duration)
            .map_err(|e| match e {
                EngineError::InvalidRetryCycle { reason, .. } => invalid(&reason),
                other => other,
            })?;

        Ok(Self {
            repeat,
            start,
            duration,
            source: source.to_string(),
        })
    }

    /// Next due date: the cycle start if it still lies ahead of `now`,
    /// otherwise `now`, plus one duration.
    pub fn next_due(&self, now: DateTime<Utc>) -> EngineResult<DateTime<Utc>> {
        let base = match self.start {
            Some(start) if start > now => start,
            _ => now,
        };
        self.duration
            .add_to(base)
            .ok_or_else(|| EngineError::invalid_cycle(&self.source, "due date out of range"))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl FromStr for DurationCycle {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DurationCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Split `3Y2M10D` into `[("3", 'Y'), ("2", 'M'), ("10", 'D')]`.
fn components(part: &str) -> Result<Vec<(String, char)>, &'static str> {
    let mut out = Vec::new();
    let mut value = String::new();
    for ch in part.chars() {
        if ch.is_ascii_digit() || ch == '.' || ch == ',' {
            value.push(if ch == ',' { '.' } else { ch });
        } else if ch.is_ascii_uppercase() {
            if value.is_empty() {
                return Err("designator without a value");
            }
            out.push((std::mem::take(&mut value), ch));
        } else {
            return Err("unexpected character");
        }
    }
    if !value.is_empty() {
        return Err("value without a designator");
    }
    Ok(out)
}

fn whole_number(value: &str) -> Result<u32, &'static str> {
    if value.contains('.') {
        return Err("fractions are only allowed on seconds");
    }
    value.parse().map_err(|_| "number out of range")
}
