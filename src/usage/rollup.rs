use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use chrono_tz::Tz;

use crate::models::usage::{CalendarUsage, DailyPoint, DailyUsageRecord};

/// Calendar date of `now` in the reporting time zone.
pub fn local_today(tz: Tz, now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// Weeks start on Sunday.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    let offset = date.weekday().num_days_from_sunday() as u64;
    date.checked_sub_days(Days::new(offset)).unwrap_or(date)
}

pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// First day of the trend series that ends on `today`.
pub fn series_start(today: NaiveDate, days: u32) -> NaiveDate {
    let span = u64::from(days.max(1) - 1);
    today.checked_sub_days(Days::new(span)).unwrap_or(today)
}

/// Earliest date any bucket needs, so one range query covers them all.
pub fn query_start(today: NaiveDate, days: u32) -> NaiveDate {
    series_start(today, days)
        .min(week_start(today))
        .min(month_start(today))
}

/// Buckets are keyed on each record's stored calendar date. Dates after
/// `today` are ignored; days without a record appear as zero in the series.
pub fn rollup(records: &[DailyUsageRecord], today: NaiveDate, days: u32) -> CalendarUsage {
    let week_from = week_start(today);
    let month_from = month_start(today);
    let series_from = series_start(today, days);

    let mut usage = CalendarUsage::default();
    for date in series_from.iter_days().take_while(|d| *d <= today) {
        usage.daily_data.push(DailyPoint {
            date,
            tokens: 0,
            requests: 0,
        });
    }

    for record in records.iter().filter(|r| r.date <= today) {
        if record.date == today {
            usage.today.add(record);
        }
        if record.date >= week_from {
            usage.week.add(record);
        }
        if record.date >= month_from {
            usage.month.add(record);
        }
        if record.date >= series_from {
            let idx = (record.date - series_from).num_days() as usize;
            if let Some(point) = usage.daily_data.get_mut(idx) {
                point.tokens = point.tokens.saturating_add(record.tokens_used);
                point.requests = point.requests.saturating_add(record.requests_count);
            }
        }
    }
    usage
}
