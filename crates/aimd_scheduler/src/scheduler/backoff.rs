//! Pause computation after failed tasks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use http::{HeaderMap, header::RETRY_AFTER};
use rand::Rng;
use serde::Deserialize;

use super::{
    SchedulerSettings,
    classify::{Failure, FailureClass},
};

/// Highest value the retry streak can reach.
pub const MAX_RETRY_STREAK: u32 = 10;

/// Longest server-hinted pause honoured. Larger `Retry-After` values are clamped to it.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

/// Fixed pause after a plain client error.
const CLIENT_ERROR_PAUSE: Duration = Duration::from_millis(50);

/// The jitter mode to use for backoff behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterMode {
    /// No jitter. Every random draw takes the upper end of its range.
    None,

    /// Full jitter.
    ///
    /// The random delay is anywhere from 0 up to the maximum current delay calculated by the backoff
    /// strategy.
    ///
    /// Incorporating full jitter into your backoff strategy can greatly reduce the likelihood
    /// of creating accidental denial of service (DoS) conditions against your own systems when
    /// many clients are recovering from a failure state.
    #[default]
    Full,
}

/// What the backoff policy decided for one failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffDecision {
    /// How long the whole queue should stay paused, starting now.
    pub pause: Duration,
    /// The retry streak to carry into the next failure.
    pub retry_streak: u32,
}

/// Computes global pauses from a failure, the current retry streak, and any server hint.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    jitter_max: Duration,
    jitter_mode: JitterMode,
}

impl BackoffPolicy {
    pub fn new(settings: &SchedulerSettings) -> Self {
        Self {
            base: settings.backoff_base(),
            cap: settings.backoff_cap(),
            jitter_max: settings.jitter_max(),
            jitter_mode: settings.jitter_mode(),
        }
    }

    /// Decides the pause for `failure`.
    ///
    /// * Throttled: the `Retry-After` hint plus jitter, else exponential backoff. Streak +1.
    /// * Transient: exponential backoff, hints ignored. Streak +1.
    /// * Client error: a short fixed pause plus half-range jitter. Streak reset.
    ///
    /// The streak advances exactly once per throttled or transient failure.
    pub fn on_failure<R: Rng>(
        &self,
        failure: &Failure,
        retry_streak: u32,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> BackoffDecision {
        match failure.class() {
            FailureClass::Throttled => match parse_retry_after(failure.headers(), now) {
                Some(hint) => BackoffDecision {
                    pause: hint + self.uniform(self.jitter_max, rng),
                    retry_streak: advance_streak(retry_streak),
                },
                None => self.exponential(retry_streak, rng),
            },
            FailureClass::Transient => self.exponential(retry_streak, rng),
            FailureClass::ClientError => BackoffDecision {
                pause: CLIENT_ERROR_PAUSE + self.uniform(self.jitter_max / 2, rng),
                retry_streak: 0,
            },
        }
    }

    /// Exponential backoff with full jitter: a uniform draw from
    /// `[0, min(cap, base * 2^streak))`. Also advances the streak.
    pub fn exponential<R: Rng>(&self, retry_streak: u32, rng: &mut R) -> BackoffDecision {
        let raw = self.raw_backoff(retry_streak);
        BackoffDecision {
            pause: self.uniform(raw, rng),
            retry_streak: advance_streak(retry_streak),
        }
    }

    /// The un-jittered backoff bound for a streak.
    pub fn raw_backoff(&self, retry_streak: u32) -> Duration {
        let exponent = retry_streak.min(MAX_RETRY_STREAK);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |raw| raw.min(self.cap))
    }

    fn uniform<R: Rng>(&self, upper: Duration, rng: &mut R) -> Duration {
        match self.jitter_mode {
            JitterMode::None => upper,
            JitterMode::Full => {
                if upper.is_zero() {
                    return Duration::ZERO;
                }
                upper.mul_f64(rng.random::<f64>())
            }
        }
    }
}

fn advance_streak(retry_streak: u32) -> u32 {
    (retry_streak + 1).min(MAX_RETRY_STREAK)
}

/// Reads a `Retry-After` header as either delay-seconds or an HTTP date.
///
/// Header lookup is case-insensitive. Fractional seconds are accepted. A date in the past
/// yields zero. Negative or unparsable values yield `None`. The result never exceeds
/// [`MAX_RETRY_AFTER`].
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<f64>() {
        if seconds.is_finite() && seconds >= 0.0 {
            return Some(Duration::from_secs_f64(
                seconds.min(MAX_RETRY_AFTER.as_secs_f64()),
            ));
        }
        return None;
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let remaining = date.with_timezone(&Utc) - now;
    Some(
        remaining
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(MAX_RETRY_AFTER),
    )
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use http::{HeaderName, HeaderValue, StatusCode};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(&SchedulerSettings::default())
    }

    fn deterministic() -> BackoffPolicy {
        BackoffPolicy::new(
            &SchedulerSettings::builder()
                .jitter_mode(JitterMode::None)
                .build(),
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn retry_after(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn raw_backoff_doubles_to_cap() {
        let policy = policy();
        let expected = [200, 400, 800, 1600, 3200, 5000, 5000, 5000, 5000, 5000, 5000];
        for (streak, millis) in expected.into_iter().enumerate() {
            assert_eq!(
                policy.raw_backoff(streak as u32),
                Duration::from_millis(millis),
                "streak {streak}"
            );
        }
        assert_eq!(policy.raw_backoff(u32::MAX), Duration::from_millis(5000));
    }

    #[test]
    fn first_server_error_pause_is_below_base() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(7);
        let failure = Failure::from_status(StatusCode::INTERNAL_SERVER_ERROR);
        for _ in 0..500 {
            let decision = policy.on_failure(&failure, 0, now(), &mut rng);
            assert!(decision.pause < Duration::from_millis(200), "{decision:?}");
            assert_eq!(decision.retry_streak, 1);
        }
    }

    #[test]
    fn transient_failures_ignore_retry_after() {
        let failure = Failure::from_status(StatusCode::SERVICE_UNAVAILABLE)
            .with_headers(retry_after("30"));
        let decision = deterministic().on_failure(&failure, 2, now(), &mut rand::rng());
        assert_eq!(decision.pause, Duration::from_millis(800));
        assert_eq!(decision.retry_streak, 3);
    }

    #[test]
    fn throttled_honours_retry_after_plus_jitter() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(42);
        let failure =
            Failure::from_status(StatusCode::TOO_MANY_REQUESTS).with_headers(retry_after("2"));
        for _ in 0..500 {
            let decision = policy.on_failure(&failure, 4, now(), &mut rng);
            assert!(decision.pause >= Duration::from_secs(2));
            assert!(decision.pause < Duration::from_millis(2250));
            assert_eq!(decision.retry_streak, 5);
        }
    }

    #[test]
    fn throttled_without_hint_advances_streak_once() {
        let failure = Failure::from_status(StatusCode::TOO_MANY_REQUESTS);
        let decision = deterministic().on_failure(&failure, 1, now(), &mut rand::rng());
        assert_eq!(decision.pause, Duration::from_millis(400));
        assert_eq!(decision.retry_streak, 2);
    }

    #[test]
    fn client_errors_reset_streak() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(3);
        let failure = Failure::from_status(StatusCode::BAD_REQUEST);
        for _ in 0..200 {
            let decision = policy.on_failure(&failure, 7, now(), &mut rng);
            assert!(decision.pause >= Duration::from_millis(50));
            assert!(decision.pause < Duration::from_millis(175));
            assert_eq!(decision.retry_streak, 0);
        }
    }

    #[test]
    fn streak_is_capped() {
        let failure = Failure::timed_out();
        let decision = deterministic().on_failure(&failure, MAX_RETRY_STREAK, now(), &mut rand::rng());
        assert_eq!(decision.retry_streak, MAX_RETRY_STREAK);
        assert_eq!(decision.pause, Duration::from_millis(5000));
    }

    #[test]
    fn retry_after_seconds() {
        assert_eq!(
            parse_retry_after(&retry_after("2"), now()),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            parse_retry_after(&retry_after(" 1.5 "), now()),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            parse_retry_after(&retry_after("0"), now()),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after(&retry_after("-3"), now()), None);
        assert_eq!(parse_retry_after(&retry_after("soon"), now()), None);
        assert_eq!(parse_retry_after(&HeaderMap::new(), now()), None);
    }

    #[test]
    fn huge_retry_after_is_clamped() {
        assert_eq!(
            parse_retry_after(&retry_after("10000000000000000000"), now()),
            Some(MAX_RETRY_AFTER)
        );
        assert_eq!(
            parse_retry_after(&retry_after("1e300"), now()),
            Some(MAX_RETRY_AFTER)
        );
        assert_eq!(
            parse_retry_after(&retry_after("Fri, 01 Jan 9999 00:00:00 GMT"), now()),
            Some(MAX_RETRY_AFTER)
        );

        let failure = Failure::from_status(StatusCode::TOO_MANY_REQUESTS)
            .with_headers(retry_after("10000000000000000000"));
        let decision = deterministic().on_failure(&failure, 0, now(), &mut rand::rng());
        assert_eq!(decision.pause, MAX_RETRY_AFTER + Duration::from_millis(250));
    }

    #[test]
    fn retry_after_above_backoff_cap_is_honoured() {
        // The cap bounds computed backoff only. Server hints up to the ceiling win.
        let failure =
            Failure::from_status(StatusCode::TOO_MANY_REQUESTS).with_headers(retry_after("7"));
        let decision = deterministic().on_failure(&failure, 0, now(), &mut rand::rng());
        assert_eq!(decision.pause, Duration::from_millis(7250));
        assert_eq!(decision.retry_streak, 1);
    }

    #[test]
    fn retry_after_http_date() {
        // 90 seconds after `now()`.
        let future = retry_after("Wed, 01 May 2024 12:01:30 GMT");
        assert_eq!(
            parse_retry_after(&future, now()),
            Some(Duration::from_secs(90))
        );

        let past = retry_after("Wed, 01 May 2024 11:00:00 GMT");
        assert_eq!(parse_retry_after(&past, now()), Some(Duration::ZERO));
    }

    #[test]
    fn retry_after_lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_bytes(b"RETRY-AFTER").unwrap(),
            HeaderValue::from_static("4"),
        );
        assert_eq!(
            parse_retry_after(&headers, now()),
            Some(Duration::from_secs(4))
        );
    }
}
