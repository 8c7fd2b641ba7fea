//! Location pings
//!
//! Values of one configured stream are turned into GET requests by
//! substituting placeholders in a URL template, at most once per
//! `min_interval`.

use crate::recording::clock::Timestamp;
use crate::recording::config::PingConfig;
use crate::recording::row::{FieldValue, StreamId};
use crate::recording::session::SessionId;
use parking_lot::Mutex;
use std::time::Duration;

/// A position sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingFix {
    pub lat: f64,
    pub lon: f64,
    pub alt: Option<f64>,
    /// Milliseconds since the session started
    pub time_ms: u64,
}

impl PingFix {
    /// Read `lat, lon[, alt]` from the leading numeric values of a row
    pub fn from_values(values: &[FieldValue], time_ms: u64) -> Option<Self> {
        let mut numbers = values.iter().map(FieldValue::as_f64);
        let lat = numbers.next()??;
        let lon = numbers.next()??;
        let alt = numbers.next().flatten();
        Some(PingFix {
            lat,
            lon,
            alt,
            time_ms,
        })
    }
}

/// URL template with `{lat}`, `{lon}`, `{alt}`, `{time}` and `{session}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingTemplate {
    template: String,
}

impl PingTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        PingTemplate {
            template: template.into(),
        }
    }

    /// Substitute every placeholder. A missing altitude renders empty.
    pub fn render(&self, fix: &PingFix, session: &SessionId) -> String {
        let alt = fix.alt.map(|a| format!("{:.2}", a)).unwrap_or_default();
        self.template
            .replace("{lat}", &format!("{:.7}", fix.lat))
            .replace("{lon}", &format!("{:.7}", fix.lon))
            .replace("{alt}", &alt)
            .replace("{time}", &fix.time_ms.to_string())
            .replace("{session}", session.as_str())
    }
}

/// Rate-limited ping source for one stream
#[derive(Debug)]
pub struct Pinger {
    template: PingTemplate,
    stream: StreamId,
    min_interval: Duration,
    last: Mutex<Option<Timestamp>>,
}

impl Pinger {
    pub fn from_config(config: &PingConfig) -> Self {
        Pinger {
            template: PingTemplate::new(config.url_template.clone()),
            stream: StreamId::new(config.stream.clone()),
            min_interval: config.min_interval,
            last: Mutex::new(None),
        }
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    /// URL to request for this value, if the stream matches, the values
    /// carry a position and the rate limit allows one now.
    pub fn url_for(
        &self,
        stream: &StreamId,
        values: &[FieldValue],
        elapsed: Duration,
        now: Timestamp,
        session: &SessionId,
    ) -> Option<String> {
        if stream != &self.stream {
            return None;
        }
        let fix = PingFix::from_values(values, elapsed.as_millis() as u64)?;

        let mut last = self.last.lock();
        if let Some(prev) = *last {
            if now.saturating_sub(prev) < self.min_interval {
                return None;
            }
        }
        *last = Some(now);
        Some(self.template.render(&fix, session))
    }

    /// Forget the last ping time, e.g. when a new session starts
    pub fn reset(&self) {
        *self.last.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pinger(min_interval_ms: u64) -> Pinger {
        Pinger::from_config(&PingConfig {
            url_template: "https://track.example/p?s={session}&lat={lat}&lon={lon}&alt={alt}&t={time}"
                .to_string(),
            stream: "location".to_string(),
            min_interval: Duration::from_millis(min_interval_ms),
        })
    }

    #[test]
    fn test_render_all_placeholders() {
        let template = PingTemplate::new("{session}/{lat},{lon},{alt}@{time}");
        let fix = PingFix {
            lat: 45.1,
            lon: 5.7,
            alt: Some(212.0),
            time_ms: 1500,
        };
        assert_eq!(
            template.render(&fix, &SessionId::from_string("abc")),
            "abc/45.1000000,5.7000000,212.00@1500"
        );
    }

    #[test]
    fn test_fix_needs_two_numbers() {
        let values = vec![FieldValue::Float(1.0)];
        assert_eq!(PingFix::from_values(&values, 0), None);

        let values = vec![FieldValue::Text("x".into()), FieldValue::Float(1.0)];
        assert_eq!(PingFix::from_values(&values, 0), None);

        let values = vec![FieldValue::Float(1.0), FieldValue::Float(2.0)];
        let fix = PingFix::from_values(&values, 9).unwrap();
        assert_eq!(fix.alt, None);
        assert_eq!(fix.time_ms, 9);
    }

    #[test]
    fn test_rate_limit() {
        let pinger = pinger(1000);
        let session = SessionId::from_string("s");
        let loc = StreamId::new("location");
        let values = vec![FieldValue::Float(1.0), FieldValue::Float(2.0)];

        let at = |ms| Timestamp::from_millis(ms);
        assert!(pinger
            .url_for(&loc, &values, Duration::ZERO, at(0), &session)
            .is_some());
        assert!(pinger
            .url_for(&loc, &values, Duration::ZERO, at(500), &session)
            .is_none());
        assert!(pinger
            .url_for(&loc, &values, Duration::ZERO, at(1000), &session)
            .is_some());

        let other = StreamId::new("accelerometer");
        pinger.reset();
        assert!(pinger
            .url_for(&other, &values, Duration::ZERO, at(5000), &session)
            .is_none());
    }
}
