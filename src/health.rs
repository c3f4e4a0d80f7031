//! Post-restart health verification.
//!
//! A probe is a single request returning the response body as text. The retry loop lives in
//! [wait_until_healthy] so that both the request and the sleeping between requests can be
//! replaced in tests.
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::config::DeployConfig;
use crate::error::DeployError;

/// Body reported for a probe that never got a response.
pub const CONNECTION_FAILED: &str = "FAILED";

pub trait Probe {
    fn probe(&self) -> String;
}

pub trait Pause {
    fn pause(&self, duration: Duration);
}

pub struct ThreadPause;

impl Pause for ThreadPause {
    fn pause(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug)]
pub struct HttpProbe {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DeployError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeployError::Config(format!("building health client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

impl Probe for HttpProbe {
    /// Status codes are ignored, only the body is inspected.
    fn probe(&self) -> String {
        match self.client.get(&self.url).send().and_then(|resp| resp.text()) {
            Ok(body) => body,
            Err(e) => {
                warn!("HEALTH: {} unreachable: {}", self.url, e);
                CONNECTION_FAILED.to_string()
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct HealthPolicy {
    pub retries: u32,
    pub delay: Duration,
    pub token: String,
}

impl HealthPolicy {
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            retries: config.health_retries,
            delay: config.health_delay,
            token: config.health_token.clone(),
        }
    }

    pub fn is_healthy(&self, body: &str) -> bool {
        body.contains(self.token.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy { attempts: u32 },
    Exhausted { attempts: u32, last_body: String },
}

/// Probes up to `policy.retries` times, pausing `policy.delay` between attempts but not after
/// the last one. Stops at the first healthy body.
pub fn wait_until_healthy(probe: &dyn Probe, pause: &dyn Pause, policy: &HealthPolicy) -> HealthOutcome {
    let mut last_body = String::new();
    for attempt in 1..=policy.retries {
        let body = probe.probe();
        if policy.is_healthy(&body) {
            info!("HEALTH: Healthy on attempt {}/{}", attempt, policy.retries);
            return HealthOutcome::Healthy { attempts: attempt };
        }
        warn!(
            "HEALTH: Attempt {}/{} unhealthy: {}",
            attempt,
            policy.retries,
            body.trim()
        );
        last_body = body;
        if attempt < policy.retries {
            pause.pause(policy.delay);
        }
    }
    HealthOutcome::Exhausted {
        attempts: policy.retries,
        last_body,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::time::Duration;

    use super::{wait_until_healthy, HealthOutcome, HealthPolicy, Pause, Probe, CONNECTION_FAILED};

    struct ScriptedProbe {
        bodies: RefCell<Vec<&'static str>>,
        calls: RefCell<u32>,
    }

    impl ScriptedProbe {
        fn new(mut bodies: Vec<&'static str>) -> Self {
            bodies.reverse();
            Self {
                bodies: RefCell::new(bodies),
                calls: RefCell::new(0),
            }
        }
    }

    impl Probe for ScriptedProbe {
        fn probe(&self) -> String {
            *self.calls.borrow_mut() += 1;
            self.bodies
                .borrow_mut()
                .pop()
                .unwrap_or(CONNECTION_FAILED)
                .to_string()
        }
    }

    #[derive(Default)]
    struct CountingPause {
        pauses: RefCell<Vec<Duration>>,
    }

    impl Pause for CountingPause {
        fn pause(&self, duration: Duration) {
            self.pauses.borrow_mut().push(duration);
        }
    }

    fn policy() -> HealthPolicy {
        HealthPolicy {
            retries: 5,
            delay: Duration::from_secs(3),
            token: "ok".to_string(),
        }
    }

    #[test]
    fn test_that_first_ok_body_wins() {
        let probe = ScriptedProbe::new(vec![CONNECTION_FAILED, "starting", r#"{"status":"ok"}"#]);
        let pause = CountingPause::default();

        let outcome = wait_until_healthy(&probe, &pause, &policy());
        assert_eq!(outcome, HealthOutcome::Healthy { attempts: 3 });
        assert_eq!(*probe.calls.borrow(), 3);
        assert_eq!(*pause.pauses.borrow(), vec![Duration::from_secs(3); 2]);
    }

    #[test]
    fn test_that_retries_are_bounded() {
        let probe = ScriptedProbe::new(vec![]);
        let pause = CountingPause::default();

        let outcome = wait_until_healthy(&probe, &pause, &policy());
        assert_eq!(
            outcome,
            HealthOutcome::Exhausted {
                attempts: 5,
                last_body: CONNECTION_FAILED.to_string()
            }
        );
        assert_eq!(*probe.calls.borrow(), 5);
        assert_eq!(pause.pauses.borrow().len(), 4);
        assert!(pause
            .pauses
            .borrow()
            .iter()
            .all(|d| *d >= Duration::from_secs(3)));
    }

    #[test]
    fn test_that_sentinel_is_never_healthy() {
        assert!(!policy().is_healthy(CONNECTION_FAILED));
        assert!(policy().is_healthy("ok"));
    }
}
