//! Retrieve timetables.
//!
//! A directory polled with `time_option` carries a five-field
//! timetable (minute, hour, day of month, month, day of week) in the
//! familiar crontab shape: `*`, lists, ranges and `/step`. The poller
//! only ever needs "the next fire strictly after now".

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timetable {
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
}

impl Timetable {
    /// Parse a five-field expression.
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(corrupt(expr, "expected 5 fields"));
        }
        Ok(Timetable {
            minutes: parse_field(fields[0], 0, 59).ok_or_else(|| {
                corrupt(expr, "bad minute field")
            })?,
            hours: parse_field(fields[1], 0, 23)
                .ok_or_else(|| corrupt(expr, "bad hour field"))?
                as u32,
            days_of_month: parse_field(fields[2], 1, 31)
                .ok_or_else(|| corrupt(expr, "bad day-of-month field"))?
                as u32,
            months: parse_field(fields[3], 1, 12)
                .ok_or_else(|| corrupt(expr, "bad month field"))?
                as u16,
            days_of_week: parse_field(fields[4], 0, 6)
                .ok_or_else(|| corrupt(expr, "bad day-of-week field"))?
                as u8,
        })
    }

    /// Epoch seconds of the next fire strictly after `now`.
    pub fn next_after(&self, now: i64) -> i64 {
        let start = Utc
            .timestamp_opt(now - now.rem_euclid(60) + 60, 0)
            .single()
            .expect("valid timestamp");
        let mut day = start.date_naive();
        // A full leap-year sweep is the worst case for a timetable
        // that can fire at all.
        for _ in 0..=366 {
            if self.day_matches(day) {
                let first_minute = if day == start.date_naive() {
                    start.hour() * 60 + start.minute()
                } else {
                    0
                };
                for slot in first_minute..(24 * 60) {
                    let (hour, minute) = (slot / 60, slot % 60);
                    if self.hours & (1 << hour) != 0
                        && self.minutes & (1 << minute) != 0
                    {
                        let fire: DateTime<Utc> = Utc
                            .from_utc_datetime(
                                &day.and_hms_opt(hour, minute, 0).unwrap(),
                            );
                        return fire.timestamp();
                    }
                }
            }
            day += Duration::days(1);
        }
        // Unsatisfiable expression (e.g. Feb 30): push it a day out so
        // the poller does not spin.
        now + 86_400
    }

    fn day_matches(&self, day: chrono::NaiveDate) -> bool {
        self.months & (1 << day.month()) != 0
            && self.days_of_month & (1 << day.day()) != 0
            && self.days_of_week
                & (1 << day.weekday().num_days_from_sunday())
                != 0
    }
}

fn corrupt(expr: &str, reason: &str) -> CoreError {
    CoreError::Corrupt {
        path: std::path::PathBuf::from("<timetable>"),
        reason: format!("{reason} in {expr:?}"),
    }
}

/// Parse one field into a bit set over `min..=max`.
fn parse_field(field: &str, min: u32, max: u32) -> Option<u64> {
    let mut bits = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, step.parse::<u32>().ok()?),
            None => (part, 1),
        };
        if step == 0 {
            return None;
        }
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (lo.parse().ok()?, hi.parse().ok()?)
        } else {
            let value: u32 = range.parse().ok()?;
            (value, value)
        };
        if lo < min || hi > max || lo > hi {
            return None;
        }
        let mut value = lo;
        while value <= hi {
            bits |= 1 << value;
            value += step;
        }
    }
    if bits == 0 {
        None
    } else {
        Some(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
        Utc.from_utc_datetime(
            &NaiveDate::from_ymd_opt(y, mo, d)
                .unwrap()
                .and_hms_opt(h, mi, 0)
                .unwrap(),
        )
        .timestamp()
    }

    #[test]
    fn every_ten_minutes() {
        let tt = Timetable::parse("*/10 * * * *").unwrap();
        let now = at(2006, 3, 14, 9, 3);
        assert_eq!(tt.next_after(now), at(2006, 3, 14, 9, 10));
        // Exactly on a fire: next fire is the following one.
        assert_eq!(tt.next_after(at(2006, 3, 14, 9, 10)), at(2006, 3, 14, 9, 20));
    }

    #[test]
    fn fixed_daily_time_rolls_to_next_day() {
        let tt = Timetable::parse("30 5 * * *").unwrap();
        assert_eq!(
            tt.next_after(at(2006, 3, 14, 6, 0)),
            at(2006, 3, 15, 5, 30)
        );
    }

    #[test]
    fn weekday_restriction() {
        // 2006-03-14 is a Tuesday; next Monday is 03-20.
        let tt = Timetable::parse("0 12 * * 1").unwrap();
        assert_eq!(
            tt.next_after(at(2006, 3, 14, 13, 0)),
            at(2006, 3, 20, 12, 0)
        );
    }

    #[test]
    fn lists_and_ranges() {
        let tt = Timetable::parse("0,30 8-17 * * *").unwrap();
        assert_eq!(
            tt.next_after(at(2006, 3, 14, 17, 31)),
            at(2006, 3, 15, 8, 0)
        );
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert!(Timetable::parse("* * * *").is_err());
        assert!(Timetable::parse("61 * * * *").is_err());
        assert!(Timetable::parse("*/0 * * * *").is_err());
        assert!(Timetable::parse("a * * * *").is_err());
    }
}
