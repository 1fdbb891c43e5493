//! `weekdayRange`, `dateRange` and `timeRange`
//!
//! Bounds are built by overriding fields of "now", then ordered so the
//! earlier one is the lower bound. Field overrides normalize the way
//! calendar arithmetic does: February 30th becomes March 2nd, hour 25
//! becomes 1am the next day.

use super::Clock;
use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeDelta, Timelike};

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// Bare numbers up to this value are days of the month, larger ones years.
const MAX_DAY_OF_MONTH: i64 = 31;

fn weekday_index(name: &str) -> Option<u32> {
    WEEKDAYS.iter().position(|d| *d == name).map(|i| i as u32)
}

fn month_number(name: &str) -> Option<u32> {
    MONTHS.iter().position(|m| *m == name).map(|i| i as u32 + 1)
}

fn now_in(clock: &dyn Clock, gmt: bool) -> NaiveDateTime {
    let now = clock.now();
    if gmt {
        now.naive_utc()
    } else {
        now.naive_local()
    }
}

/// Uppercase the arguments and strip a trailing `GMT` flag.
fn split_gmt<S: AsRef<str>>(args: &[S]) -> (Vec<String>, bool) {
    let mut args: Vec<String> = args
        .iter()
        .map(|a| a.as_ref().trim().to_ascii_uppercase())
        .collect();
    let gmt = args.last().is_some_and(|a| a == "GMT");
    if gmt {
        args.pop();
    }
    (args, gmt)
}

fn ordered<T: PartialOrd>(a: T, b: T) -> (T, T) {
    if b < a {
        (b, a)
    } else {
        (a, b)
    }
}

/// `weekdayRange(wd1 [, wd2] [, "GMT"])`, inclusive on both ends.
pub fn weekday_range(clock: &dyn Clock, wd1: &str, wd2: &str, gmt: &str) -> bool {
    let wd1 = wd1.trim().to_ascii_uppercase();
    let mut wd2 = wd2.trim().to_ascii_uppercase();
    let mut gmt = gmt.trim().eq_ignore_ascii_case("GMT");

    if wd2 == "GMT" {
        wd2.clear();
        gmt = true;
    }
    if wd2.is_empty() {
        wd2.clone_from(&wd1);
    }

    let (Some(first), Some(second)) = (weekday_index(&wd1), weekday_index(&wd2)) else {
        return false;
    };

    let today = now_in(clock, gmt).weekday().num_days_from_sunday();
    let (lower, upper) = ordered(first, second);
    lower <= today && today <= upper
}

/// `dateRange(...)` with one to six fields and an optional trailing `GMT`.
pub fn date_range<S: AsRef<str>>(clock: &dyn Clock, args: &[S]) -> bool {
    let (args, gmt) = split_gmt(args);
    if args.is_empty() || args.len() > 6 {
        return false;
    }
    let now = now_in(clock, gmt);

    if let [only] = args.as_slice() {
        return match only.parse::<i64>() {
            Ok(day) if day <= MAX_DAY_OF_MONTH => i64::from(now.day()) == day,
            Ok(year) => i64::from(now.year()) == year,
            Err(_) => month_number(only) == Some(now.month()),
        };
    }

    let middle = args.len() / 2;
    let (Some(first), Some(second)) = (
        date_bound(now, &args[..middle]),
        date_bound(now, &args[middle..]),
    ) else {
        return false;
    };

    let (lower, upper) = ordered(first, second);
    lower <= now && now <= upper
}

fn date_bound(now: NaiveDateTime, fields: &[String]) -> Option<NaiveDateTime> {
    let mut date = now.date();
    for field in fields {
        date = match field.parse::<i64>() {
            Ok(day) if day <= MAX_DAY_OF_MONTH => {
                normalized_date(date.year().into(), date.month(), day)?
            }
            Ok(year) => normalized_date(year, date.month(), date.day().into())?,
            Err(_) => normalized_date(date.year().into(), month_number(field)?, date.day().into())?,
        };
    }
    Some(date.and_time(now.time()))
}

fn normalized_date(year: i64, month: u32, day: i64) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(i32::try_from(year).ok()?, month, 1)?;
    first.checked_add_signed(TimeDelta::try_days(day - 1)?)
}

/// `timeRange(...)` with 1, 2, 4 or 6 numeric fields and an optional
/// trailing `GMT`. The upper bound is exclusive.
pub fn time_range<S: AsRef<str>>(clock: &dyn Clock, args: &[S]) -> bool {
    let (args, gmt) = split_gmt(args);
    let Some(fields) = args
        .iter()
        .map(|a| a.parse::<i64>().ok())
        .collect::<Option<Vec<i64>>>()
    else {
        return false;
    };
    let now = now_in(clock, gmt);
    let hour = i64::from(now.hour());

    let bounds = match fields.as_slice() {
        [h] => return hour == *h,
        [h1, h2] => {
            let (lower, upper) = ordered(*h1, *h2);
            return lower <= hour && hour < upper;
        }
        [h1, m1, h2, m2] => time_bound(now, *h1, *m1, None).zip(time_bound(now, *h2, *m2, None)),
        [h1, m1, s1, h2, m2, s2] => {
            time_bound(now, *h1, *m1, Some(*s1)).zip(time_bound(now, *h2, *m2, Some(*s2)))
        }
        _ => return false,
    };

    let Some((first, second)) = bounds else {
        return false;
    };
    let (lower, upper) = ordered(first, second);
    lower <= now && now < upper
}

fn time_bound(
    now: NaiveDateTime,
    hour: i64,
    minute: i64,
    second: Option<i64>,
) -> Option<NaiveDateTime> {
    let second = second.unwrap_or_else(|| now.second().into());
    let offset = hour
        .checked_mul(3600)?
        .checked_add(minute.checked_mul(60)?)?
        .checked_add(second)?;

    now.date()
        .and_hms_opt(0, 0, 0)?
        .checked_add_signed(TimeDelta::try_seconds(offset)?)?
        .checked_add_signed(TimeDelta::nanoseconds(now.nanosecond().into()))
}
