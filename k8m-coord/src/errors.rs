//! Utilities for handling errors

use futures_core::{Future, Stream, TryStream};
use futures_util::ready;
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tokio::time;
use tracing::warn;

pin_project_lite::pin_project! {
    /// Wraps a [`Stream`], handling errors by logging them and backing off
    ///
    /// The first error after a success is retried immediately. Each further
    /// consecutive error waits before polling the stream again, starting at
    /// the initial delay and doubling up to the maximum delay. A successful
    /// item resets the delay.
    #[derive(Debug)]
    pub struct LogAndSleep<S> {
        initial: time::Duration,
        max: time::Duration,
        delay: Option<time::Duration>,

        #[pin]
        sleep: time::Sleep,
        sleeping: bool,

        #[pin]
        stream: S,
    }
}

impl<S> LogAndSleep<S> {
    /// Creates an error handling stream that uses a fixed delay on consecutive
    /// errors
    pub fn fixed_delay(delay: time::Duration, stream: S) -> Self {
        Self::exponential(delay, delay, stream)
    }

    /// Creates an error handling stream whose delay doubles on consecutive
    /// errors, from `initial` up to `max`
    pub fn exponential(initial: time::Duration, max: time::Duration, stream: S) -> Self {
        Self {
            initial,
            max: max.max(initial),
            delay: None,
            sleep: time::sleep(time::Duration::ZERO),
            sleeping: false,
            stream,
        }
    }
}

impl<S> Stream for LogAndSleep<S>
where
    S: TryStream,
    S::Error: std::fmt::Display,
{
    type Item = S::Ok;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if *this.sleeping {
                ready!(this.sleep.as_mut().poll(cx));
                *this.sleeping = false;
            }

            match ready!(this.stream.as_mut().try_poll_next(cx)) {
                None => {
                    *this.delay = None;
                    return Poll::Ready(None);
                }

                Some(Ok(item)) => {
                    *this.delay = None;
                    return Poll::Ready(Some(item));
                }

                Some(Err(error)) => {
                    match *this.delay {
                        None => {
                            warn!(%error, "Stream failed");
                            *this.delay = Some(time::Duration::ZERO);
                        }
                        Some(prior) => {
                            let delay = if prior.is_zero() {
                                *this.initial
                            } else {
                                prior.saturating_mul(2).min(*this.max)
                            };
                            warn!(%error, ?delay, "Stream failed again; backing off");
                            *this.delay = Some(delay);
                            *this.sleeping = true;
                            this.sleep.as_mut().reset(time::Instant::now() + delay);
                        }
                    }
                }
            };
        }
    }
}
