//! Per-job live transport.
//!
//! Each job has at most one subscriber. Subscribing again replaces the
//! previous subscriber, whose stream then ends. Events published while no
//! one is subscribed are not buffered; the journal file keeps them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_protocol::{Event, JobId, RelayError, RelayResult};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(Event),
    /// Liveness tick, carries nothing.
    KeepAlive,
}

#[derive(Debug, Default)]
struct Channel {
    sender: Option<mpsc::UnboundedSender<Frame>>,
    finished: bool,
}

#[derive(Clone, Debug, Default)]
pub struct JobEventHub {
    channels: Arc<Mutex<HashMap<JobId, Channel>>>,
}

impl JobEventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver to the current subscriber. A terminal event also finishes the
    /// job, closing the subscriber's stream right after it.
    pub fn publish(&self, job_id: &JobId, event: Event) {
        let terminal = event.is_terminal();
        let mut channels = self.channels.lock();
        let channel = channels.entry(job_id.clone()).or_default();
        if channel.finished {
            debug!(job_id = %job_id, kind = %event.kind(), "job finished, event not delivered");
            return;
        }
        Self::send(channel, Frame::Event(event));
        if terminal {
            channel.finished = true;
            channel.sender = None;
        }
    }

    pub fn keep_alive(&self, job_id: &JobId) {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get_mut(job_id) {
            Self::send(channel, Frame::KeepAlive);
        }
    }

    /// Attach a fresh subscriber, detaching any earlier one. Subscribing to
    /// a finished job yields a stream that is already over.
    pub fn subscribe(&self, job_id: &JobId) -> JobSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut channels = self.channels.lock();
        let channel = channels.entry(job_id.clone()).or_default();
        if channel.sender.is_some() {
            debug!(job_id = %job_id, "replacing previous subscriber");
        }
        channel.sender = (!channel.finished).then_some(sender);
        JobSubscription {
            job_id: job_id.clone(),
            receiver,
            settled: channel.finished,
        }
    }

    /// Close the job's stream without a terminal event.
    pub fn finish(&self, job_id: &JobId) {
        let mut channels = self.channels.lock();
        let channel = channels.entry(job_id.clone()).or_default();
        channel.finished = true;
        channel.sender = None;
    }

    /// Drop everything kept for the job. A later subscriber starts from
    /// scratch, so callers serve finished jobs from their stored record.
    pub fn forget(&self, job_id: &JobId) {
        self.channels.lock().remove(job_id);
    }

    /// Jobs with a live channel or a finished flag.
    pub fn tracked_jobs(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_finished(&self, job_id: &JobId) -> bool {
        self.channels
            .lock()
            .get(job_id)
            .is_some_and(|channel| channel.finished)
    }

    pub fn has_subscriber(&self, job_id: &JobId) -> bool {
        self.channels
            .lock()
            .get(job_id)
            .and_then(|channel| channel.sender.as_ref())
            .is_some_and(|sender| !sender.is_closed())
    }

    fn send(channel: &mut Channel, frame: Frame) {
        if let Some(sender) = &channel.sender
            && sender.send(frame).is_err()
        {
            channel.sender = None;
        }
    }
}

/// Receiving end held by one consumer.
#[derive(Debug)]
pub struct JobSubscription {
    job_id: JobId,
    receiver: mpsc::UnboundedReceiver<Frame>,
    /// A terminal event was received, or the job was already over when
    /// subscribing.
    settled: bool,
}

impl JobSubscription {
    /// A subscription whose stream is already over, for jobs that ended
    /// before anyone attached.
    pub fn closed(job_id: JobId) -> Self {
        let (_, receiver) = mpsc::unbounded_channel();
        Self {
            job_id,
            receiver,
            settled: true,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Next frame, keep-alives included. `None` once the stream is over.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    /// Next event, skipping keep-alives. `None` once the stream is over.
    ///
    /// Silence longer than `idle` is an interruption, and so is the stream
    /// closing before a terminal event arrived.
    pub async fn next_event(&mut self, idle: Duration) -> RelayResult<Option<Event>> {
        loop {
            match tokio::time::timeout(idle, self.receiver.recv()).await {
                Err(_) => {
                    return Err(RelayError::StreamInterrupted(format!(
                        "no activity on job {} for {}s",
                        self.job_id,
                        idle.as_secs_f64()
                    )));
                }
                Ok(None) if self.settled => return Ok(None),
                Ok(None) => {
                    return Err(RelayError::StreamInterrupted(format!(
                        "stream for job {} closed before a terminal event",
                        self.job_id
                    )));
                }
                Ok(Some(Frame::KeepAlive)) => continue,
                Ok(Some(Frame::Event(event))) => {
                    self.settled |= event.is_terminal();
                    return Ok(Some(event));
                }
            }
        }
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<Frame> {
        UnboundedReceiverStream::new(self.receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_stream::StreamExt;

    const IDLE: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn delivers_in_publish_order_and_ends_after_terminal() {
        let hub = JobEventHub::new();
        let job = JobId::from_string("j1");
        let mut subscription = hub.subscribe(&job);

        hub.publish(&job, Event::status("a"));
        hub.keep_alive(&job);
        hub.publish(&job, Event::status("b"));
        hub.publish(&job, Event::error("boom"));
        hub.publish(&job, Event::status("after terminal"));

        let mut seen = Vec::new();
        while let Some(event) = subscription.next_event(IDLE).await.unwrap() {
            seen.push(event.kind().to_string());
        }
        assert_eq!(seen, vec!["status", "status", "error"]);
        assert!(hub.is_finished(&job));
    }

    #[tokio::test]
    async fn second_subscriber_replaces_first() {
        let hub = JobEventHub::new();
        let job = JobId::from_string("j2");
        let mut first = hub.subscribe(&job);
        let mut second = hub.subscribe(&job);

        hub.publish(&job, Event::status("only for second"));

        let error = first.next_event(IDLE).await.unwrap_err();
        assert!(matches!(error, RelayError::StreamInterrupted(_)));
        let event = second.next_event(IDLE).await.unwrap().unwrap();
        assert_eq!(event.message(), Some("only for second"));
    }

    #[tokio::test]
    async fn events_without_subscriber_are_not_replayed() {
        let hub = JobEventHub::new();
        let job = JobId::from_string("j3");
        hub.publish(&job, Event::status("missed"));
        let mut subscription = hub.subscribe(&job);
        hub.publish(&job, Event::complete(json!({"response": "ok"})));

        let event = subscription.next_event(IDLE).await.unwrap().unwrap();
        assert_eq!(event.kind(), &relay_protocol::EventKind::Complete);
    }

    #[tokio::test]
    async fn subscribing_to_finished_job_ends_immediately() {
        let hub = JobEventHub::new();
        let job = JobId::from_string("j4");
        hub.publish(&job, Event::complete(json!({})));
        let mut subscription = hub.subscribe(&job);
        assert!(subscription.next_event(IDLE).await.unwrap().is_none());
        assert!(!hub.has_subscriber(&job));
    }

    #[tokio::test]
    async fn forgotten_job_leaves_nothing_behind() {
        let hub = JobEventHub::new();
        let job = JobId::from_string("j7");
        let _subscription = hub.subscribe(&job);
        hub.publish(&job, Event::complete(json!({})));
        assert_eq!(hub.tracked_jobs(), 1);

        hub.forget(&job);
        assert_eq!(hub.tracked_jobs(), 0);
        assert!(!hub.is_finished(&job));

        let mut closed = JobSubscription::closed(job);
        assert!(closed.next_event(IDLE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn silence_is_reported_as_interruption() {
        let hub = JobEventHub::new();
        let job = JobId::from_string("j5");
        let mut subscription = hub.subscribe(&job);
        let error = subscription
            .next_event(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(error, RelayError::StreamInterrupted(_)));
    }

    #[tokio::test]
    async fn stream_yields_keep_alive_frames() {
        let hub = JobEventHub::new();
        let job = JobId::from_string("j6");
        let subscription = hub.subscribe(&job);
        hub.keep_alive(&job);
        hub.finish(&job);

        let frames: Vec<Frame> = subscription.into_stream().collect().await;
        assert_eq!(frames, vec![Frame::KeepAlive]);
    }
}
