//! Waking timers for the profile connection stack, built on Tokio's time
//! driver.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, Instant, Sleep};

/// A single shot alarm that can be re-armed and cancelled.
///
/// Unlike a bare `tokio::time::Sleep`, an `Alarm` starts out disarmed and a
/// disarmed alarm never completes, so it can sit in a worker's `select!`
/// loop without spurious wakeups.
pub struct Alarm {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl Alarm {
    /// Construct a new, disarmed alarm.
    pub fn new() -> Self {
        Self { sleep: Box::pin(sleep(Duration::from_secs(0))), armed: false }
    }

    /// Arm the alarm to fire `duration` from now, replacing any earlier
    /// deadline.
    pub fn reset(&mut self, duration: Duration) {
        self.sleep.as_mut().reset(Instant::now() + duration);
        self.armed = true;
    }

    /// Disarm the alarm if it is currently armed.
    pub fn cancel(&mut self) {
        self.armed = false;
    }

    /// Completes when the armed deadline passes. Never completes while
    /// disarmed.
    pub async fn expired(&mut self) {
        if !self.armed {
            pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }
}

impl Default for Alarm {
    fn default() -> Self {
        Alarm::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Alarm;
    use crate::assert_near;
    use std::time::{Duration, Instant};

    #[test]
    fn alarm_expires_on_schedule() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let timer = Instant::now();
            let mut alarm = Alarm::new();
            alarm.reset(Duration::from_millis(10));
            alarm.expired().await;
            assert_near!(timer.elapsed().as_millis(), 10, 5);
        });
    }

    #[test]
    fn disarmed_alarm_never_fires() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let mut alarm = Alarm::new();
            tokio::select! {
                _ = alarm.expired() => panic!("disarmed alarm fired"),
                _ = tokio::time::sleep(Duration::from_millis(10)) => (),
            }
        });
    }

    #[test]
    fn cancelled_alarm_does_not_fire() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let mut alarm = Alarm::new();
            alarm.reset(Duration::from_millis(10));
            alarm.cancel();
            tokio::select! {
                _ = alarm.expired() => panic!("cancelled alarm fired"),
                _ = tokio::time::sleep(Duration::from_millis(30)) => (),
            }
        });
    }

    #[test]
    fn rearming_replaces_the_deadline() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let timer = Instant::now();
            let mut alarm = Alarm::new();
            alarm.reset(Duration::from_millis(50));
            alarm.reset(Duration::from_millis(10));
            alarm.expired().await;
            assert_near!(timer.elapsed().as_millis(), 10, 5);
        });
    }

    #[test]
    fn alarm_can_be_reused_after_expiry() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let mut alarm = Alarm::new();
            alarm.reset(Duration::from_millis(5));
            alarm.expired().await;

            let timer = Instant::now();
            alarm.reset(Duration::from_millis(10));
            alarm.expired().await;
            assert_near!(timer.elapsed().as_millis(), 10, 5);
        });
    }
}
