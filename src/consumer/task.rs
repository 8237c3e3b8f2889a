//! The poll, process, commit loop run by every consumer task

use crate::consumer::pack::{PackOutcome, PackProcessor};
use crate::notifications::api::{
    publish_logged, ConsumerEvent, ConsumerEventType, Event, SharedNotificationManager,
};
use crate::queue::{QueueConsumer, QueueError, QueueKey, TopicPartitionInfo};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub(crate) enum Subscription {
    Partitions(BTreeSet<TopicPartitionInfo>),
    /// The consumer's own unpartitioned topic
    Own,
}

#[derive(Clone)]
pub(crate) struct LoopContext {
    pub queue_key: QueueKey,
    pub processor: PackProcessor,
    pub notifications: SharedNotificationManager,
    pub poll_interval: Duration,
}

impl LoopContext {
    async fn publish(&self, event_type: ConsumerEventType, label: &str, message: Option<String>) {
        let mut event = ConsumerEvent::new(event_type, self.queue_key.clone(), Some(label.to_string()));
        if let Some(message) = message {
            event = event.with_message(message);
        }
        publish_logged(&self.notifications, Event::Consumer(event)).await;
    }

    async fn report(&self, label: &str, outcome: &PackOutcome) {
        if !outcome.timed_out.is_empty() {
            self.publish(
                ConsumerEventType::PackTimedOut,
                label,
                Some(format!(
                    "{} of {} messages timed out",
                    outcome.timed_out.len(),
                    outcome.total
                )),
            )
            .await;
        }
        if !outcome.failed.is_empty() {
            self.publish(
                ConsumerEventType::PackFailed,
                label,
                Some(format!(
                    "{} of {} messages failed after retries",
                    outcome.failed.len(),
                    outcome.total
                )),
            )
            .await;
        }
    }
}

/// Handle on a spawned consumer loop
pub(crate) struct ConsumerTask {
    label: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ConsumerTask {
    pub fn spawn(
        context: Arc<LoopContext>,
        consumer: Box<dyn QueueConsumer>,
        subscription: Subscription,
        label: String,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task_label = label.clone();
        let handle = tokio::spawn(async move {
            run_consumer_loop(context, consumer, subscription, task_label, stop_rx).await;
        });
        Self {
            label,
            stop_tx,
            handle,
        }
    }

    /// Ask the loop to exit after its current pack
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to exit, aborting it at `deadline`
    ///
    /// Returns `false` when the task had to be aborted.
    pub async fn join(self, deadline: Instant) -> bool {
        let mut handle = self.handle;
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::error!("Consumer task {} failed: {}", self.label, e);
                true
            }
            Err(_) => {
                log::warn!("Consumer task {} did not stop in time, aborting", self.label);
                handle.abort();
                // The consumer (and its partition claims) is dropped with the task
                let _ = handle.await;
                false
            }
        }
    }
}

/// Signal every task, then join them against one shared deadline
pub(crate) async fn stop_tasks(tasks: Vec<ConsumerTask>, timeout: Duration) -> bool {
    for task in &tasks {
        task.signal_stop();
    }
    let deadline = Instant::now() + timeout;
    let mut graceful = true;
    for task in tasks {
        graceful &= task.join(deadline).await;
    }
    graceful
}

async fn run_consumer_loop(
    context: Arc<LoopContext>,
    mut consumer: Box<dyn QueueConsumer>,
    subscription: Subscription,
    label: String,
    mut stop_rx: watch::Receiver<bool>,
) {
    if !subscribe(&context, consumer.as_mut(), &subscription, &label, &mut stop_rx).await {
        consumer.unsubscribe().await;
        return;
    }
    log::info!("[{}] Consumer {} started", context.queue_key, label);
    context
        .publish(ConsumerEventType::Started, &label, None)
        .await;

    loop {
        if *stop_rx.borrow() {
            break;
        }
        // Stopping interrupts a poll, never a pack
        let polled = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            polled = consumer.poll(context.poll_interval) => polled,
        };

        match polled {
            Ok(batch) if batch.is_empty() => {}
            Ok(batch) => {
                log::trace!("[{}] {} polled {} messages", context.queue_key, label, batch.len());
                let outcome = context.processor.process(batch).await;
                context.report(&label, &outcome).await;
                if let Err(e) = consumer.commit().await {
                    log::warn!(
                        "[{}] {} failed to commit, pack will be redelivered: {}",
                        context.queue_key,
                        label,
                        e
                    );
                }
            }
            Err(QueueError::Stopped { .. }) => break,
            Err(e) => {
                log::warn!("[{}] {} poll failed: {}", context.queue_key, label, e);
                tokio::select! {
                    _ = tokio::time::sleep(context.poll_interval) => {}
                    _ = stop_rx.changed() => {}
                }
            }
        }
    }

    consumer.unsubscribe().await;
    log::info!("[{}] Consumer {} stopped", context.queue_key, label);
    context
        .publish(ConsumerEventType::Stopped, &label, None)
        .await;
}

/// Subscribe, waiting out partitions still claimed by their previous owner
async fn subscribe(
    context: &LoopContext,
    consumer: &mut dyn QueueConsumer,
    subscription: &Subscription,
    label: &str,
    stop_rx: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        if *stop_rx.borrow() {
            return false;
        }
        let result = match subscription {
            Subscription::Partitions(partitions) => {
                consumer.subscribe_partitions(partitions.clone()).await
            }
            Subscription::Own => consumer.subscribe().await,
        };
        match result {
            Ok(()) => return true,
            Err(e) if e.is_transient() => {
                log::debug!("[{}] {} waiting to subscribe: {}", context.queue_key, label, e);
                tokio::select! {
                    _ = tokio::time::sleep(context.poll_interval) => {}
                    _ = stop_rx.changed() => return false,
                }
            }
            Err(e) => {
                log::error!("[{}] {} failed to subscribe: {}", context.queue_key, label, e);
                return false;
            }
        }
    }
}
