use crate::errors::TallyError;
use chrono::{
    DateTime, Local, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc,
};
use chrono_tz::Tz;
use std::time::Duration;

/// Slack in seconds added to the dedup-set TTL past the next midnight, so
/// the TTL backstop never fires before the scheduler's own delete.
const DEDUP_TTL_SLACK_SECS: i64 = 3_600;

/// The wall clock that defines "today" and "midnight" for daily counters.
///
/// Either the process-local zone or a named IANA zone from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Local,
    Named(Tz),
}

impl Zone {
    /// Parse a configured zone name. Empty or `"local"` selects the
    /// process-local zone; anything else must be a valid IANA name.
    pub fn parse(name: &str) -> Result<Self, TallyError> {
        if name.is_empty() || name.eq_ignore_ascii_case("local") {
            return Ok(Zone::Local);
        }
        name.parse::<Tz>()
            .map(Zone::Named)
            .map_err(|e| TallyError::Config(format!("unrecognized timezone {name:?}: {e}")))
    }

    /// The current date in this zone.
    pub fn today(&self) -> NaiveDate {
        match self {
            Zone::Local => Local::now().date_naive(),
            Zone::Named(tz) => Utc::now().with_timezone(tz).date_naive(),
        }
    }

    /// The instant of the next midnight in this zone.
    pub fn next_midnight(&self) -> DateTime<Utc> {
        let today = self.today();
        let tomorrow = today.succ_opt().unwrap_or(today).and_time(NaiveTime::MIN);
        match self {
            Zone::Local => resolve_in_zone(&Local, tomorrow),
            Zone::Named(tz) => resolve_in_zone(tz, tomorrow),
        }
    }

    /// How long until the next midnight in this zone.
    ///
    /// Recomputed against the wall clock before every scheduler sleep, so
    /// drift never accumulates across cycles.
    pub fn until_next_midnight(&self) -> Duration {
        (self.next_midnight() - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Absolute expiry for a dedup set indexing today: just after the next
    /// midnight, so the set self-collects even if the scheduler misfires.
    pub fn dedup_expiry(&self) -> DateTime<Utc> {
        self.next_midnight() + TimeDelta::seconds(DEDUP_TTL_SLACK_SECS)
    }
}

/// Interpret a zone-local naive datetime as a UTC instant.
///
/// DST makes local midnights occasionally ambiguous or nonexistent; an
/// ambiguous midnight resolves to its earlier instant, a skipped one to the
/// following hour.
fn resolve_in_zone<T: TimeZone>(tz: &T, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earlier, _) => earlier.with_timezone(&Utc),
        LocalResult::None => match tz.from_local_datetime(&(naive + TimeDelta::hours(1))) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
            LocalResult::None => Utc.from_utc_datetime(&naive),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_accepts_local_aliases() {
        assert_eq!(Zone::parse("").unwrap(), Zone::Local);
        assert_eq!(Zone::parse("local").unwrap(), Zone::Local);
        assert_eq!(Zone::parse("Local").unwrap(), Zone::Local);
    }

    #[test]
    fn parse_accepts_iana_names() {
        assert_eq!(Zone::parse("UTC").unwrap(), Zone::Named(chrono_tz::UTC));
        assert!(matches!(
            Zone::parse("America/New_York").unwrap(),
            Zone::Named(_)
        ));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Zone::parse("Not/AZone").is_err());
    }

    #[test]
    fn next_midnight_is_midnight_in_zone_and_in_the_future() {
        for name in ["UTC", "America/New_York", "Asia/Tokyo"] {
            let zone = Zone::parse(name).unwrap();
            let midnight = zone.next_midnight();

            let Zone::Named(tz) = zone else { unreachable!() };
            let in_zone = midnight.with_timezone(&tz);
            assert_eq!(in_zone.time().hour(), 0, "{name}");
            assert_eq!(in_zone.time().minute(), 0, "{name}");

            let until = midnight - Utc::now();
            assert!(until > TimeDelta::zero(), "{name}");
            // 25h upper bound: the day a zone falls back has 25 hours.
            assert!(until <= TimeDelta::hours(25), "{name}");
        }
    }

    #[test]
    fn dedup_expiry_is_past_midnight() {
        let zone = Zone::parse("UTC").unwrap();
        assert_eq!(
            zone.dedup_expiry() - zone.next_midnight(),
            TimeDelta::seconds(DEDUP_TTL_SLACK_SECS)
        );
    }
}
