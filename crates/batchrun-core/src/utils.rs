//! Timer stream used to pace polling and reaping.
use futures::Stream;
use pin_project_lite::pin_project;

pin_project! {
    /// Fixed-period stream of `()`.
    ///
    /// Resets on every yield, so a consumer that stalls sees one late tick
    /// rather than a burst.
    pub struct Ticker {
        #[pin]
        inner: futures_timer::Delay,
        period: std::time::Duration,
    }
}

impl Ticker {
    /// First tick fires after one full `period`.
    pub fn new(period: std::time::Duration) -> Self {
        Self {
            inner: futures_timer::Delay::new(period),
            period,
        }
    }

    pub fn period(&self) -> std::time::Duration {
        self.period
    }
}

impl Stream for Ticker {
    type Item = ();

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let mut this = self.project();
        let poll = this.inner.as_mut().poll(cx);
        if poll.is_ready() {
            this.inner.reset(*this.period);
        }
        poll.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt as _;

    #[test]
    fn ticker_keeps_ticking() {
        let ticks = futures::executor::block_on(
            Ticker::new(std::time::Duration::from_millis(1))
                .take(3)
                .collect::<Vec<_>>(),
        );
        assert_eq!(ticks.len(), 3);
    }
}
