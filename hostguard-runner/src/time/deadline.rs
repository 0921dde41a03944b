// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use pin_project_lite::pin_project;
use std::{future::Future, pin::Pin, task::Poll, time::Duration};
use tokio::time::{Instant, Sleep};

pub(crate) fn deadline(timeout: Duration) -> Deadline {
    Deadline::new(timeout)
}

pin_project! {
    /// A wrapper around `tokio::time::Sleep` that is pushed back every time a heartbeat arrives.
    #[derive(Debug)]
    pub(crate) struct Deadline {
        #[pin]
        sleep: Sleep,
        timeout: Duration,
    }
}

impl Deadline {
    fn new(timeout: Duration) -> Self {
        Self {
            sleep: tokio::time::sleep(timeout),
            timeout,
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resets the deadline to now + the timeout.
    pub(crate) fn heartbeat(self: Pin<&mut Self>) {
        let this = self.project();
        this.sleep.reset(Instant::now() + *this.timeout);
    }
}

impl Future for Deadline {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        self.project().sleep.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pushes_deadline_back() {
        let start = Instant::now();
        let mut deadline = std::pin::pin!(deadline(Duration::from_secs(10)));

        tokio::time::sleep(Duration::from_secs(8)).await;
        deadline.as_mut().heartbeat();
        deadline.as_mut().await;

        // 8 seconds before the heartbeat, 10 after it.
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_secs(18) && elapsed < Duration::from_millis(18_100),
            "deadline fired 10s after the last heartbeat (elapsed: {elapsed:?})"
        );
    }
}
