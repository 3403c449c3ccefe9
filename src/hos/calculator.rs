//! Incremental HOS accumulator for one driver.

use super::{HosProfile, HosSignal, HosWindow, LimitKind, Remaining};
use crate::types::{DutyStatus, DutyStatusEvent};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use std::collections::BTreeMap;

/// Index into the per-limit warning/violation bookkeeping arrays.
fn limit_index(limit: LimitKind) -> usize {
    match limit {
        LimitKind::DailyDrive => 0,
        LimitKind::DailyDuty => 1,
        LimitKind::BreakRequired => 2,
        LimitKind::RollingWindow => 3,
    }
}

const LIMITS: [LimitKind; 4] = [
    LimitKind::DailyDrive,
    LimitKind::DailyDuty,
    LimitKind::BreakRequired,
    LimitKind::RollingWindow,
];

/// Per-driver HOS accumulator.
///
/// All state is derived from the observed event stream plus elapsed time;
/// replaying the same events through [`HosCalculator::replay`] reproduces
/// an identical [`HosWindow`]. Accumulators are integer seconds.
#[derive(Debug)]
pub struct HosCalculator {
    profile: HosProfile,
    home_offset: FixedOffset,

    status: DutyStatus,
    /// Last instant accounted for; time before this is already accumulated
    clock: Option<DateTime<Utc>>,
    /// Current home-terminal day the daily counters belong to
    current_day: Option<NaiveDate>,

    drive_secs_today: u64,
    duty_secs_today: u64,
    drive_secs_since_break: u64,

    /// On-duty seconds per closed home-terminal day, pruned to the window
    day_duty: BTreeMap<NaiveDate, u64>,

    /// Start of the current contiguous OffDuty/SleeperBerth span
    rest_started: Option<DateTime<Utc>>,
    break_credited_this_span: bool,
    restart_credited_this_span: bool,

    last_break_end: Option<DateTime<Utc>>,
    last_restart: Option<DateTime<Utc>>,

    /// Tightest warning offset already emitted per limit
    warned: [Option<u64>; 4],
    /// Whether a violation has been emitted per limit (reset when slack returns)
    violated: [bool; 4],
}

impl HosCalculator {
    /// Create a fresh accumulator for one driver.
    ///
    /// `home_offset_minutes` is the home-terminal UTC offset; day boundaries
    /// are computed in that zone. Offsets are validated at config load.
    pub fn new(profile: HosProfile, home_offset_minutes: i32) -> Self {
        let home_offset = FixedOffset::east_opt(home_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        Self {
            profile,
            home_offset,
            status: DutyStatus::OffDuty,
            clock: None,
            current_day: None,
            drive_secs_today: 0,
            duty_secs_today: 0,
            drive_secs_since_break: 0,
            day_duty: BTreeMap::new(),
            rest_started: None,
            break_credited_this_span: false,
            restart_credited_this_span: false,
            last_break_end: None,
            last_restart: None,
            warned: [None; 4],
            violated: [false; 4],
        }
    }

    /// Rebuild the accumulator by folding a driver's ordered event stream.
    pub fn replay<'a>(
        profile: HosProfile,
        home_offset_minutes: i32,
        events: impl IntoIterator<Item = &'a DutyStatusEvent>,
    ) -> Self {
        let mut calc = Self::new(profile, home_offset_minutes);
        for event in events {
            let _ = calc.observe(event);
        }
        calc
    }

    /// Current duty status as the calculator understands it.
    pub fn status(&self) -> DutyStatus {
        self.status
    }

    // ------------------------------------------------------------------------
    // Event and time observation
    // ------------------------------------------------------------------------

    /// Observe one committed duty-status event.
    pub fn observe(&mut self, event: &DutyStatusEvent) -> Vec<HosSignal> {
        let mut signals = self.advance_to(event.occurred_at);

        let entering_rest = event.status.is_rest() && !self.status.is_rest();
        let leaving_rest = !event.status.is_rest() && self.status.is_rest();

        if entering_rest {
            self.rest_started = Some(event.occurred_at);
            self.break_credited_this_span = false;
            self.restart_credited_this_span = false;
        } else if leaving_rest {
            signals.extend(self.close_rest_span(event.occurred_at));
        }
        // OffDuty <-> SleeperBerth keeps the rest span contiguous

        self.status = event.status;
        signals
    }

    /// Account elapsed time up to `now` without a status change.
    ///
    /// Splits spans at home-terminal midnights, apportioning seconds to each
    /// day, and credits rest milestones (qualifying break, 34 h restart) as
    /// they are reached.
    pub fn advance_to(&mut self, now: DateTime<Utc>) -> Vec<HosSignal> {
        let mut signals = Vec::new();
        let Some(start) = self.clock else {
            self.clock = Some(now);
            self.current_day = Some(self.local_date(now));
            return signals;
        };
        if now <= start {
            return signals;
        }

        let mut cursor = start;
        while cursor < now {
            let midnight = self.next_local_midnight(cursor);
            let seg_end = midnight.min(now);
            let secs = (seg_end - cursor).num_seconds().max(0) as u64;
            self.account_segment(secs);
            if seg_end == midnight {
                self.roll_day(self.local_date(seg_end));
            }
            cursor = seg_end;
        }
        self.clock = Some(now);

        signals.extend(self.rest_milestones(now));
        signals
    }

    /// Check limits as of `now`, emitting warnings and violations.
    ///
    /// A `Violation` instructs the caller (the state machine) to force
    /// `Driving → OffDuty`; the calculator itself never writes events.
    pub fn check(&mut self, now: DateTime<Utc>) -> Vec<HosSignal> {
        let mut signals = self.advance_to(now);
        signals.extend(self.limit_signals());
        signals
    }

    fn account_segment(&mut self, secs: u64) {
        match self.status {
            DutyStatus::Driving => {
                self.drive_secs_today += secs;
                self.duty_secs_today += secs;
                self.drive_secs_since_break += secs;
            }
            DutyStatus::OnDutyNotDriving => {
                self.duty_secs_today += secs;
            }
            DutyStatus::OffDuty | DutyStatus::SleeperBerth => {}
        }
    }

    /// Close the current day and start `new_day`.
    fn roll_day(&mut self, new_day: NaiveDate) {
        if let Some(day) = self.current_day {
            if day != new_day {
                self.day_duty.insert(day, self.duty_secs_today);
                self.drive_secs_today = 0;
                self.duty_secs_today = 0;
                // New day: daily warnings may fire again
                self.warned[limit_index(LimitKind::DailyDrive)] = None;
                self.warned[limit_index(LimitKind::DailyDuty)] = None;
            }
        }
        self.current_day = Some(new_day);
        // Keep only the days an 8-day window can reference
        let cutoff = new_day - Duration::days(7);
        self.day_duty.retain(|date, _| *date >= cutoff);
    }

    /// Credit break/restart milestones inside an ongoing rest span.
    fn rest_milestones(&mut self, now: DateTime<Utc>) -> Vec<HosSignal> {
        let mut signals = Vec::new();
        if !self.status.is_rest() {
            return signals;
        }
        let Some(rest_start) = self.rest_started else {
            return signals;
        };
        let span_secs = (now - rest_start).num_seconds().max(0) as u64;

        if !self.break_credited_this_span
            && span_secs >= self.profile.qualifying_break_secs
            && self.drive_secs_since_break > 0
        {
            self.break_credited_this_span = true;
            self.drive_secs_since_break = 0;
            self.last_break_end =
                Some(rest_start + Duration::seconds(self.profile.qualifying_break_secs as i64));
            self.warned[limit_index(LimitKind::BreakRequired)] = None;
            signals.push(HosSignal::BreakCompleted);
        }

        if !self.restart_credited_this_span && span_secs >= self.profile.restart_secs {
            self.restart_credited_this_span = true;
            self.apply_restart(rest_start + Duration::seconds(self.profile.restart_secs as i64));
            signals.push(HosSignal::RestartCompleted);
        }

        signals
    }

    /// Close a rest span when the driver goes back on duty.
    fn close_rest_span(&mut self, at: DateTime<Utc>) -> Vec<HosSignal> {
        // Milestones reached exactly at the close instant are still credited
        let signals = self.rest_milestones(at);
        if self.break_credited_this_span {
            self.last_break_end = Some(at);
        }
        self.rest_started = None;
        self.break_credited_this_span = false;
        self.restart_credited_this_span = false;
        signals
    }

    /// Zero both rolling windows and the daily counters, effective from the
    /// end of the 34 h span.
    fn apply_restart(&mut self, effective: DateTime<Utc>) {
        self.day_duty.clear();
        self.drive_secs_today = 0;
        self.duty_secs_today = 0;
        self.drive_secs_since_break = 0;
        self.last_restart = Some(effective);
        self.warned = [None; 4];
        self.violated = [false; 4];
    }

    // ------------------------------------------------------------------------
    // Limits
    // ------------------------------------------------------------------------

    /// Remaining allowance before each hard limit.
    pub fn remaining(&self) -> Remaining {
        Remaining {
            drive_secs: self
                .profile
                .max_daily_drive_secs
                .saturating_sub(self.drive_secs_today),
            duty_secs: self
                .profile
                .max_daily_duty_secs
                .saturating_sub(self.duty_secs_today),
            until_break_due_secs: self
                .profile
                .break_required_after_drive_secs
                .saturating_sub(self.drive_secs_since_break),
            rolling_secs: self
                .profile
                .rolling_cap_secs
                .saturating_sub(self.rolling_secs(self.profile.rolling_window_days)),
        }
    }

    /// True when any limit leaves zero driving allowance.
    pub fn drive_exhausted(&self) -> bool {
        self.remaining().effective_drive_secs() == 0
    }

    /// True once a qualifying break has completed in the current rest span.
    ///
    /// Used to release the post-violation driving lock. Dispatcher-forced
    /// rest counts identically to driver-initiated rest here.
    pub fn break_satisfied(&self) -> bool {
        self.drive_secs_since_break == 0
    }

    fn limit_signals(&mut self) -> Vec<HosSignal> {
        let remaining = self.remaining();
        let mut signals = Vec::new();

        for limit in LIMITS {
            let left = match limit {
                LimitKind::DailyDrive => remaining.drive_secs,
                LimitKind::DailyDuty => remaining.duty_secs,
                LimitKind::BreakRequired => remaining.until_break_due_secs,
                LimitKind::RollingWindow => remaining.rolling_secs,
            };
            let idx = limit_index(limit);

            if left == 0 {
                if !self.violated[idx] {
                    self.violated[idx] = true;
                    signals.push(HosSignal::Violation { limit });
                }
                continue;
            }
            self.violated[idx] = false;

            // Warnings only matter while the limit is being consumed
            if !self.status.is_on_duty() {
                continue;
            }
            let offsets = crate::config::defaults::WARNING_OFFSETS_SECS;
            if left > offsets[0] {
                self.warned[idx] = None;
                continue;
            }
            // Tightest mark crossed, warned once per mark
            let Some(&mark) = offsets.iter().filter(|&&o| left <= o).min() else {
                continue;
            };
            if self.warned[idx].map_or(true, |prev| mark < prev) {
                self.warned[idx] = Some(mark);
                signals.push(HosSignal::Warning {
                    limit,
                    remaining_secs: left,
                });
            }
        }
        signals
    }

    // ------------------------------------------------------------------------
    // Derived views
    // ------------------------------------------------------------------------

    /// Snapshot of the accumulators as of the last accounted instant.
    pub fn snapshot(&self) -> HosWindow {
        HosWindow {
            drive_secs_today: self.drive_secs_today,
            on_duty_secs_today: self.duty_secs_today,
            rolling_7day_secs: self.rolling_secs(7),
            rolling_8day_secs: self.rolling_secs(8),
            drive_secs_since_break: self.drive_secs_since_break,
            last_break_end: self.last_break_end,
            last_34h_restart: self.last_restart,
            as_of: self.clock.unwrap_or(DateTime::UNIX_EPOCH),
        }
    }

    /// Rolling on-duty seconds over the trailing `days` window (today included).
    fn rolling_secs(&self, days: u32) -> u64 {
        let Some(today) = self.current_day else {
            return 0;
        };
        let cutoff = today - Duration::days(i64::from(days) - 1);
        let closed: u64 = self
            .day_duty
            .iter()
            .filter(|(date, _)| **date >= cutoff && **date < today)
            .map(|(_, secs)| secs)
            .sum();
        closed + self.duty_secs_today
    }

    // ------------------------------------------------------------------------
    // Home-terminal time helpers
    // ------------------------------------------------------------------------

    fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.home_offset).date_naive()
    }

    fn next_local_midnight(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let next_day = self.local_date(at) + Duration::days(1);
        let naive = next_day.and_hms_opt(0, 0, 0).unwrap_or_default();
        self.home_offset
            .from_local_datetime(&naive)
            .single()
            .map_or(at + Duration::days(1), |dt| dt.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransitionCause;
    use uuid::Uuid;

    fn profile() -> HosProfile {
        HosProfile::us_70h_8d()
    }

    fn event(at: DateTime<Utc>, status: DutyStatus) -> DutyStatusEvent {
        DutyStatusEvent {
            event_id: Uuid::new_v4(),
            driver_id: "D1".to_string(),
            vehicle_id: "V1".to_string(),
            status,
            cause: TransitionCause::Manual,
            occurred_at: at,
            gps: None,
            source_confidence: 1.0,
            yard_move: false,
            reason: Some("test".to_string()),
            corrects: None,
        }
    }

    fn t0() -> DateTime<Utc> {
        // 06:00 home-terminal time with zero offset
        Utc.with_ymd_and_hms(2024, 3, 4, 6, 0, 0).unwrap()
    }

    #[test]
    fn test_drive_time_accumulates_in_integer_seconds() {
        let mut calc = HosCalculator::new(profile(), 0);
        calc.observe(&event(t0(), DutyStatus::Driving));
        calc.advance_to(t0() + Duration::seconds(5400));

        let window = calc.snapshot();
        assert_eq!(window.drive_secs_today, 5400);
        assert_eq!(window.on_duty_secs_today, 5400);
    }

    #[test]
    fn test_on_duty_not_driving_excluded_from_drive_time() {
        let mut calc = HosCalculator::new(profile(), 0);
        calc.observe(&event(t0(), DutyStatus::OnDutyNotDriving));
        calc.advance_to(t0() + Duration::hours(2));

        let window = calc.snapshot();
        assert_eq!(window.drive_secs_today, 0);
        assert_eq!(window.on_duty_secs_today, 7200);
    }

    #[test]
    fn test_break_resets_subwindow_not_daily_total() {
        // Scenario: 5h30m driving, then a 30-minute break
        let mut calc = HosCalculator::new(profile(), 0);
        calc.observe(&event(t0(), DutyStatus::Driving));

        let break_start = t0() + Duration::minutes(330);
        calc.observe(&event(break_start, DutyStatus::OffDuty));
        let signals = calc.advance_to(break_start + Duration::minutes(30));
        assert!(signals.contains(&HosSignal::BreakCompleted));

        let window = calc.snapshot();
        assert_eq!(window.drive_secs_since_break, 0);
        assert_eq!(window.drive_secs_today, 330 * 60);
    }

    #[test]
    fn test_short_rest_does_not_qualify() {
        let mut calc = HosCalculator::new(profile(), 0);
        calc.observe(&event(t0(), DutyStatus::Driving));

        let break_start = t0() + Duration::hours(4);
        calc.observe(&event(break_start, DutyStatus::OffDuty));
        let signals = calc.observe(&event(
            break_start + Duration::minutes(20),
            DutyStatus::Driving,
        ));
        assert!(!signals.contains(&HosSignal::BreakCompleted));
        assert_eq!(calc.snapshot().drive_secs_since_break, 4 * 3600);
    }

    #[test]
    fn test_daily_drive_violation_at_eleven_hours() {
        let mut calc = HosCalculator::new(profile(), 0);
        calc.observe(&event(t0(), DutyStatus::Driving));
        // Take a qualifying break at 5h so the 8h sub-window stays clear
        calc.observe(&event(t0() + Duration::hours(5), DutyStatus::OffDuty));
        calc.observe(&event(
            t0() + Duration::hours(5) + Duration::minutes(30),
            DutyStatus::Driving,
        ));

        // 10h55m total driving: no violation yet
        let check_at = t0() + Duration::minutes(11 * 60 + 30 - 5);
        let signals = calc.check(check_at);
        assert!(!signals
            .iter()
            .any(|s| matches!(s, HosSignal::Violation { .. })));

        // At exactly 11h driving (11h30m wall clock incl. the break)
        let at_limit = t0() + Duration::minutes(11 * 60 + 30);
        let signals = calc.check(at_limit);
        assert!(signals.contains(&HosSignal::Violation {
            limit: LimitKind::DailyDrive
        }));
        assert!(calc.drive_exhausted());

        // Violation is emitted once, not on every subsequent check
        let signals = calc.check(at_limit + Duration::seconds(1));
        assert!(!signals
            .iter()
            .any(|s| matches!(s, HosSignal::Violation { .. })));
    }

    #[test]
    fn test_break_required_after_eight_hours() {
        let mut calc = HosCalculator::new(profile(), 0);
        calc.observe(&event(t0(), DutyStatus::Driving));

        let signals = calc.check(t0() + Duration::hours(8));
        assert!(signals.contains(&HosSignal::Violation {
            limit: LimitKind::BreakRequired
        }));
        assert!(calc.drive_exhausted());
    }

    #[test]
    fn test_warning_sequence_before_limit() {
        let mut calc = HosCalculator::new(profile(), 0);
        calc.observe(&event(t0(), DutyStatus::Driving));

        // 60-minute mark for the 8h break limit arrives at 7h driving
        let signals = calc.check(t0() + Duration::hours(7));
        assert!(signals.iter().any(|s| matches!(
            s,
            HosSignal::Warning {
                limit: LimitKind::BreakRequired,
                remaining_secs: 3600
            }
        )));

        // Same mark never fires twice
        let signals = calc.check(t0() + Duration::hours(7) + Duration::minutes(1));
        assert!(!signals.iter().any(|s| matches!(
            s,
            HosSignal::Warning {
                limit: LimitKind::BreakRequired,
                ..
            }
        )));

        // 30-minute mark fires at 7h30m
        let signals = calc.check(t0() + Duration::minutes(450));
        assert!(signals.iter().any(|s| matches!(
            s,
            HosSignal::Warning {
                limit: LimitKind::BreakRequired,
                remaining_secs: 1800
            }
        )));
    }

    #[test]
    fn test_midnight_split_apportions_seconds() {
        // Home terminal at UTC-5: driving 22:00–02:00 local splits 2h/2h
        let offset_minutes = -300;
        let start = Utc.with_ymd_and_hms(2024, 3, 5, 3, 0, 0).unwrap(); // 22:00 local
        let mut calc = HosCalculator::new(profile(), offset_minutes);
        calc.observe(&event(start, DutyStatus::Driving));
        calc.advance_to(start + Duration::hours(4));

        let window = calc.snapshot();
        // Only the post-midnight 2h belong to "today"
        assert_eq!(window.drive_secs_today, 2 * 3600);
        // Rolling totals still see all 4h
        assert_eq!(window.rolling_8day_secs, 4 * 3600);
    }

    #[test]
    fn test_rolling_windows_accumulate_across_days() {
        let mut calc = HosCalculator::new(profile(), 0);
        // 6h on duty per day for 3 days
        for day in 0..3 {
            let day_start = t0() + Duration::days(day);
            calc.observe(&event(day_start, DutyStatus::OnDutyNotDriving));
            calc.observe(&event(day_start + Duration::hours(6), DutyStatus::OffDuty));
        }
        calc.advance_to(t0() + Duration::days(3));

        let window = calc.snapshot();
        assert_eq!(window.rolling_7day_secs, 18 * 3600);
        assert_eq!(window.rolling_8day_secs, 18 * 3600);
    }

    #[test]
    fn test_34h_restart_resets_rolling_windows() {
        // Scenario: heavy duty days, then 34h off — both windows zero after
        let mut calc = HosCalculator::new(profile(), 0);
        for day in 0..4 {
            let day_start = t0() + Duration::days(day);
            calc.observe(&event(day_start, DutyStatus::Driving));
            calc.observe(&event(day_start + Duration::hours(10), DutyStatus::OffDuty));
        }
        assert!(calc.snapshot().rolling_8day_secs > 0);

        let rest_start = t0() + Duration::days(3) + Duration::hours(10);
        let signals = calc.advance_to(rest_start + Duration::hours(34));
        assert!(signals.contains(&HosSignal::RestartCompleted));

        let window = calc.snapshot();
        assert_eq!(window.rolling_7day_secs, 0);
        assert_eq!(window.rolling_8day_secs, 0);
        assert_eq!(
            window.last_34h_restart,
            Some(rest_start + Duration::hours(34))
        );
    }

    #[test]
    fn test_rest_shorter_than_34h_does_not_restart() {
        let mut calc = HosCalculator::new(profile(), 0);
        calc.observe(&event(t0(), DutyStatus::Driving));
        calc.observe(&event(t0() + Duration::hours(8), DutyStatus::OffDuty));
        let signals = calc.observe(&event(
            t0() + Duration::hours(8 + 33),
            DutyStatus::Driving,
        ));
        assert!(!signals.contains(&HosSignal::RestartCompleted));
        assert!(calc.snapshot().last_34h_restart.is_none());
    }

    #[test]
    fn test_sleeper_and_off_duty_form_contiguous_rest() {
        let mut calc = HosCalculator::new(profile(), 0);
        calc.observe(&event(t0(), DutyStatus::Driving));
        // 15 min off duty then 20 min sleeper: one 35-minute span
        let rest_start = t0() + Duration::hours(3);
        calc.observe(&event(rest_start, DutyStatus::OffDuty));
        calc.observe(&event(
            rest_start + Duration::minutes(15),
            DutyStatus::SleeperBerth,
        ));
        let signals = calc.advance_to(rest_start + Duration::minutes(35));
        assert!(signals.contains(&HosSignal::BreakCompleted));
    }

    #[test]
    fn test_replay_reproduces_identical_window() {
        let events = vec![
            event(t0(), DutyStatus::OnDutyNotDriving),
            event(t0() + Duration::minutes(20), DutyStatus::Driving),
            event(t0() + Duration::hours(5), DutyStatus::OffDuty),
            event(t0() + Duration::hours(6), DutyStatus::Driving),
            event(t0() + Duration::hours(10), DutyStatus::OffDuty),
            event(t0() + Duration::days(1), DutyStatus::Driving),
            event(t0() + Duration::days(1) + Duration::hours(4), DutyStatus::OffDuty),
        ];

        let first = HosCalculator::replay(profile(), -300, events.iter());
        let second = HosCalculator::replay(profile(), -300, events.iter());
        assert_eq!(first.snapshot(), second.snapshot());
    }

    #[test]
    fn test_rolling_cap_exhausts_drive_allowance() {
        let mut tight = profile();
        tight.rolling_cap_secs = 20 * 3600;

        let mut calc = HosCalculator::new(tight, 0);
        for day in 0..2 {
            let day_start = t0() + Duration::days(day);
            calc.observe(&event(day_start, DutyStatus::Driving));
            calc.observe(&event(day_start + Duration::hours(10), DutyStatus::OffDuty));
        }
        calc.advance_to(t0() + Duration::days(2));
        // 20h on duty in the window: rolling allowance is gone
        assert_eq!(calc.remaining().rolling_secs, 0);
        assert!(calc.drive_exhausted());
    }
}
