//! Sunrise and sunset computation
//!
//! Uses the NOAA solar position approximation (mean anomaly, equation of
//! center, ecliptic longitude, declination, hour angle). Accuracy is within
//! a couple of minutes outside the polar regions.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SchedulerError, SchedulerResult};

/// Julian date of the Unix epoch
const JULIAN_UNIX_EPOCH: f64 = 2_440_587.5;
/// Julian date of J2000.0
const J2000: f64 = 2_451_545.0;
/// Apparent solar radius plus standard refraction, degrees
const HORIZON_DEPRESSION: f64 = 0.833;
/// Earth's axial tilt, degrees
const OBLIQUITY: f64 = 23.4397;
/// 1970-01-01 counted from 0001-01-01 as day 1
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;
/// Days searched ahead for the next event (covers a polar night)
const SEARCH_DAYS: i64 = 370;

/// Observer location used for astronomical events
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Metres above sea level
    #[serde(default)]
    pub elevation: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64, elevation: f64) -> SchedulerResult<Self> {
        let location = Self {
            latitude,
            longitude,
            elevation,
        };
        location.validate()?;
        Ok(location)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(SchedulerError::InvalidLocation(format!(
                "latitude {} out of range",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(SchedulerError::InvalidLocation(format!(
                "longitude {} out of range",
                self.longitude
            )));
        }
        if !self.elevation.is_finite() {
            return Err(SchedulerError::InvalidLocation(format!(
                "elevation {} is not a number",
                self.elevation
            )));
        }
        Ok(())
    }
}

/// Astronomical events the scheduler can track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SunEvent {
    Sunrise,
    Sunset,
}

impl std::fmt::Display for SunEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SunEvent::Sunrise => write!(f, "sunrise"),
            SunEvent::Sunset => write!(f, "sunset"),
        }
    }
}

/// The sunrise or sunset belonging to `date`'s solar day at `location`
///
/// Returns None when the sun does not cross the horizon that day (polar day
/// or polar night).
pub fn sun_event(date: NaiveDate, location: &Location, event: SunEvent) -> Option<DateTime<Utc>> {
    let days = f64::from(date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE);
    let julian_noon = JULIAN_UNIX_EPOCH + days + 0.5;
    let n = julian_noon - J2000;

    let mean_solar_time = n - location.longitude / 360.0;
    let mean_anomaly = (357.5291 + 0.985_600_28 * mean_solar_time).rem_euclid(360.0);
    let m = mean_anomaly.to_radians();
    let center = 1.9148 * m.sin() + 0.0200 * (2.0 * m).sin() + 0.0003 * (3.0 * m).sin();
    let ecliptic_longitude = (mean_anomaly + center + 180.0 + 102.9372).rem_euclid(360.0);
    let lambda = ecliptic_longitude.to_radians();

    let transit = J2000 + mean_solar_time + 0.0053 * m.sin() - 0.0069 * (2.0 * lambda).sin();

    let declination = (lambda.sin() * OBLIQUITY.to_radians().sin()).asin();
    let depression = HORIZON_DEPRESSION + 2.076 * location.elevation.max(0.0).sqrt() / 60.0;
    let phi = location.latitude.to_radians();

    let cos_hour_angle = ((-depression).to_radians().sin() - phi.sin() * declination.sin())
        / (phi.cos() * declination.cos());
    if !(-1.0..=1.0).contains(&cos_hour_angle) {
        return None;
    }
    let hour_angle = cos_hour_angle.acos().to_degrees();

    let julian = match event {
        SunEvent::Sunrise => transit - hour_angle / 360.0,
        SunEvent::Sunset => transit + hour_angle / 360.0,
    };
    let millis = ((julian - JULIAN_UNIX_EPOCH) * 86_400_000.0).round() as i64;
    DateTime::<Utc>::from_timestamp_millis(millis)
}

/// The first event strictly after `after`, shifted by `offset`
pub fn next_sun_event(
    location: &Location,
    event: SunEvent,
    offset: Duration,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let today = after.date_naive();
    (-1..SEARCH_DAYS)
        .filter_map(|delta| today.checked_add_signed(Duration::days(delta)))
        .filter_map(|day| sun_event(day, location, event))
        .map(|instant| instant + offset)
        .find(|instant| *instant > after)
}
