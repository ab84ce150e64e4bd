use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, Offset, TimeZone, Utc,
};
use chrono_tz::Tz;
use croner::Cron;
use tracing::warn;

use crate::error::ScheduleConfigError;
use crate::types::{RecurringType, ScheduleSpec, ScheduleType};

/// Longest forward scan when looking for the first weekly occurrence.
const WEEKLY_SCAN_DAYS: i64 = 8;

/// A wall-clock time of day pinned to an IANA zone.
///
/// This is the only place local calendar values become UTC instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTime {
    time: NaiveTime,
    tz: Tz,
}

impl LocalTime {
    pub fn new(time: NaiveTime, tz: Tz) -> Self {
        Self { time, tz }
    }

    /// Parse `HH:MM` (seconds are tolerated) in zone `tz`.
    pub fn parse(time: &str, tz: Tz) -> Result<Self, ScheduleConfigError> {
        let trimmed = time.trim();
        let parsed = NaiveTime::parse_from_str(trimmed, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
            .map_err(|_| ScheduleConfigError::InvalidTime(time.to_string()))?;
        Ok(Self::new(parsed, tz))
    }

    /// Calendar date of `instant` as seen in this zone.
    pub fn date_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }

    /// The UTC instant of this time of day on local `date`.
    ///
    /// A time skipped by a DST jump is read with the offset in force before
    /// the jump, which lands it the length of the gap later (02:30 → 03:30).
    /// A repeated time resolves to its first occurrence.
    pub fn on(&self, date: NaiveDate) -> DateTime<Utc> {
        let naive = date.and_time(self.time);
        match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => dt.with_timezone(&Utc),
            LocalResult::Ambiguous(first, _) => first.with_timezone(&Utc),
            LocalResult::None => {
                let before = self
                    .tz
                    .offset_from_utc_datetime(&(naive - Duration::days(1)))
                    .fix();
                Utc.from_utc_datetime(
                    &(naive - Duration::seconds(i64::from(before.local_minus_utc()))),
                )
            }
        }
    }
}

/// A validated schedule, ready to be evaluated.
enum Plan {
    Once(DateTime<Utc>),
    /// Fixed step in seconds from the previous run.
    Every(i64),
    Daily {
        at: LocalTime,
        every: i64,
    },
    Weekly {
        at: LocalTime,
        days: [bool; 7],
        every: i64,
    },
    Monthly {
        at: LocalTime,
        day: u32,
        every: i64,
    },
    Cron {
        cron: Cron,
        expression: String,
        tz: Tz,
    },
}

impl Plan {
    fn from_spec(spec: &ScheduleSpec) -> Result<Self, ScheduleConfigError> {
        let tz = parse_timezone(&spec.timezone)?;
        match spec.schedule_type {
            ScheduleType::Once => spec
                .execute_at
                .map(Plan::Once)
                .ok_or_else(|| missing("execute_at", "once")),

            ScheduleType::Cron => {
                let expression = spec
                    .cron_expression
                    .as_deref()
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .ok_or_else(|| missing("cron_expression", "cron"))?;
                Ok(Plan::Cron {
                    cron: parse_cron(expression)?,
                    expression: expression.to_string(),
                    tz,
                })
            }

            ScheduleType::Recurring => {
                let kind = spec
                    .recurring_type
                    .ok_or_else(|| missing("recurring_type", "recurring"))?;
                let every = spec.interval.unwrap_or(1);
                if every < 1 {
                    return Err(ScheduleConfigError::InvalidInterval(every));
                }

                match kind {
                    RecurringType::Minutes => every
                        .checked_mul(60)
                        .map(Plan::Every)
                        .ok_or(ScheduleConfigError::InvalidInterval(every)),
                    RecurringType::Hours => every
                        .checked_mul(3_600)
                        .map(Plan::Every)
                        .ok_or(ScheduleConfigError::InvalidInterval(every)),
                    RecurringType::Daily => Ok(Plan::Daily {
                        at: local_time(spec, kind, tz)?,
                        every,
                    }),
                    RecurringType::Weekly => {
                        let at = local_time(spec, kind, tz)?;
                        if spec.days_of_week.is_empty() {
                            return Err(missing("days_of_week", kind.as_str()));
                        }
                        let mut days = [false; 7];
                        for &day in &spec.days_of_week {
                            let slot = days
                                .get_mut(usize::from(day))
                                .ok_or(ScheduleConfigError::InvalidDayOfWeek(day))?;
                            *slot = true;
                        }
                        Ok(Plan::Weekly { at, days, every })
                    }
                    RecurringType::Monthly => {
                        let at = local_time(spec, kind, tz)?;
                        let day = spec
                            .day_of_month
                            .ok_or_else(|| missing("day_of_month", kind.as_str()))?;
                        if !(1..=31).contains(&day) {
                            return Err(ScheduleConfigError::InvalidDayOfMonth(day));
                        }
                        Ok(Plan::Monthly { at, day, every })
                    }
                }
            }
        }
    }
}

fn missing(field: &'static str, kind: &str) -> ScheduleConfigError {
    ScheduleConfigError::MissingField {
        field,
        kind: kind.to_string(),
    }
}

fn local_time(
    spec: &ScheduleSpec,
    kind: RecurringType,
    tz: Tz,
) -> Result<LocalTime, ScheduleConfigError> {
    let time = spec
        .time
        .as_deref()
        .ok_or_else(|| missing("time", kind.as_str()))?;
    LocalTime::parse(time, tz)
}

/// Empty means UTC; the repository fills in the configured default on insert.
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleConfigError> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(Tz::UTC);
    }
    name.parse::<Tz>()
        .map_err(|_| ScheduleConfigError::UnknownTimezone(name.to_string()))
}

fn parse_cron(expression: &str) -> Result<Cron, ScheduleConfigError> {
    let fields = expression.split_whitespace().count();
    // Nicknames such as @daily are a single token.
    if !expression.starts_with('@') && fields != 5 {
        return Err(ScheduleConfigError::InvalidCron {
            expression: expression.to_string(),
            reason: format!("expected 5 fields, found {fields}"),
        });
    }
    Cron::new(expression)
        .parse()
        .map_err(|e| ScheduleConfigError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}

/// Check that `spec` can produce run times, without evaluating it.
pub fn validate(spec: &ScheduleSpec) -> Result<(), ScheduleConfigError> {
    Plan::from_spec(spec).map(|_| ())
}

/// Compute the next UTC execution time for `spec` strictly after `now`.
///
/// Returns `None` when the schedule is disabled, exhausted (`Once` already
/// fired, `max_executions` reached, past `end_date`) or misconfigured. Use
/// [`evaluate`] to tell a misconfiguration apart from exhaustion.
pub fn compute_next_run(spec: &ScheduleSpec, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match evaluate(spec, now) {
        Ok(next) => next,
        Err(e) => {
            warn!(schedule_id = spec.id, error = %e, "schedule cannot produce run times");
            None
        }
    }
}

/// Like [`compute_next_run`], but reports configuration problems.
///
/// Pure: the same `(spec, now)` always yields the same answer.
pub fn evaluate(
    spec: &ScheduleSpec,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleConfigError> {
    if !spec.is_live() {
        return Ok(None);
    }
    if spec
        .max_executions
        .is_some_and(|max| spec.execution_count >= max)
    {
        return Ok(None);
    }

    let plan = Plan::from_spec(spec)?;

    // Nothing is ever scheduled before creation or before the previous run.
    let base = now.max(spec.created_at);
    let floor = spec.last_run.map_or(base, |last| base.max(last));

    let candidate = match plan {
        Plan::Once(at) => (spec.execution_count == 0 && at > now).then_some(at),
        Plan::Every(step) => {
            next_fixed_interval(spec.last_run.unwrap_or(spec.created_at), step, floor)
        }
        Plan::Daily { at, every } => next_daily(&at, every, spec.last_run, floor),
        Plan::Weekly { at, days, every } => next_weekly(&at, &days, every, spec.last_run, floor),
        Plan::Monthly { at, day, every } => next_monthly(&at, day, every, spec.last_run, floor),
        Plan::Cron {
            cron,
            expression,
            tz,
        } => Some(next_cron(&cron, &expression, tz, floor)?),
    };

    Ok(candidate.filter(|next| spec.end_date.map_or(true, |end| *next < end)))
}

/// `anchor + n * step` for the smallest `n >= 1` landing after `floor`.
///
/// Missed ticks are skipped rather than replayed.
fn next_fixed_interval(
    anchor: DateTime<Utc>,
    step_secs: i64,
    floor: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let first = anchor.checked_add_signed(Duration::try_seconds(step_secs)?)?;
    if first > floor {
        return Some(first);
    }
    let behind = (floor - anchor).num_seconds();
    let steps = behind / step_secs + 1;
    anchor.checked_add_signed(Duration::try_seconds(steps.checked_mul(step_secs)?)?)
}

fn add_days(date: NaiveDate, days: i64) -> Option<NaiveDate> {
    date.checked_add_signed(Duration::try_days(days)?)
}

fn next_daily(
    at: &LocalTime,
    every: i64,
    last_run: Option<DateTime<Utc>>,
    floor: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match last_run {
        // First run: today if the time is still ahead, otherwise tomorrow.
        None => {
            let today = at.date_of(floor);
            (0..=2)
                .filter_map(|offset| add_days(today, offset))
                .map(|date| at.on(date))
                .find(|candidate| *candidate > floor)
        }
        Some(last) => {
            let anchor = last_slot_date(at, last);
            let behind = (at.date_of(floor) - anchor).num_days();
            let start = (behind / every).max(1);
            (start..start + 3)
                .filter_map(|cycle| add_days(anchor, cycle.checked_mul(every)?))
                .map(|date| at.on(date))
                .find(|candidate| *candidate > floor)
        }
    }
}

/// Local date of the latest slot at or before `last`.
///
/// `last_run` is when the dispatch happened, which can fall after local
/// midnight for a late slot; the cycle still counts from the slot's day.
fn last_slot_date(at: &LocalTime, last: DateTime<Utc>) -> NaiveDate {
    let date = at.date_of(last);
    if at.on(date) > last {
        add_days(date, -1).unwrap_or(date)
    } else {
        date
    }
}

fn week_start(date: NaiveDate) -> NaiveDate {
    add_days(date, -i64::from(date.weekday().num_days_from_monday())).unwrap_or(date)
}

fn next_weekly(
    at: &LocalTime,
    days: &[bool; 7],
    every: i64,
    last_run: Option<DateTime<Utc>>,
    floor: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let selected = |date: &NaiveDate| days[date.weekday().num_days_from_monday() as usize];

    let Some(last) = last_run else {
        let today = at.date_of(floor);
        return (0..WEEKLY_SCAN_DAYS)
            .filter_map(|offset| add_days(today, offset))
            .filter(selected)
            .map(|date| at.on(date))
            .find(|candidate| *candidate > floor);
    };

    // The selected day whose slot the last run served.
    let last_date = (0..=7)
        .filter_map(|offset| add_days(at.date_of(last), -offset))
        .filter(selected)
        .find(|date| at.on(*date) <= last)
        .unwrap_or_else(|| at.date_of(last));

    // Remaining selected days in that week come first.
    let anchor_week = week_start(last_date);
    let rest_of_week = (1..7)
        .filter_map(|offset| add_days(last_date, offset))
        .take_while(|date| week_start(*date) == anchor_week)
        .filter(selected)
        .map(|date| at.on(date))
        .find(|candidate| *candidate > floor);
    if rest_of_week.is_some() {
        return rest_of_week;
    }

    let behind_weeks = (week_start(at.date_of(floor)) - anchor_week).num_days() / 7;
    let start = (behind_weeks / every).max(1);
    (start..start + 3).find_map(|cycle| {
        let week = add_days(anchor_week, cycle.checked_mul(every)?.checked_mul(7)?)?;
        (0..7)
            .filter_map(|offset| add_days(week, offset))
            .filter(selected)
            .map(|date| at.on(date))
            .find(|candidate| *candidate > floor)
    })
}

fn month_index(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 12 + i64::from(date.month0())
}

/// `day` of the month at `index`, clamped to that month's last day.
fn clamped_day(index: i64, day: u32) -> Option<NaiveDate> {
    let year = i32::try_from(index.div_euclid(12)).ok()?;
    let month = u32::try_from(index.rem_euclid(12)).ok()? + 1;
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year.checked_add(1)?, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let last_day = first_of_next.pred_opt()?.day();
    NaiveDate::from_ymd_opt(year, month, day.min(last_day))
}

fn next_monthly(
    at: &LocalTime,
    day: u32,
    every: i64,
    last_run: Option<DateTime<Utc>>,
    floor: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match last_run {
        None => {
            let current = month_index(at.date_of(floor));
            (0..3)
                .filter_map(|offset| clamped_day(current + offset, day))
                .map(|date| at.on(date))
                .find(|candidate| *candidate > floor)
        }
        Some(last) => {
            let mut anchor = month_index(at.date_of(last));
            if clamped_day(anchor, day).is_some_and(|date| at.on(date) > last) {
                anchor -= 1;
            }
            let behind = month_index(at.date_of(floor)) - anchor;
            let start = (behind / every).max(1);
            (start..start + 3)
                .filter_map(|cycle| clamped_day(anchor + cycle.checked_mul(every)?, day))
                .map(|date| at.on(date))
                .find(|candidate| *candidate > floor)
        }
    }
}

fn next_cron(
    cron: &Cron,
    expression: &str,
    tz: Tz,
    floor: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleConfigError> {
    cron.find_next_occurrence(&floor.with_timezone(&tz), false)
        .map(|next| next.with_timezone(&Utc))
        .map_err(|e| ScheduleConfigError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
