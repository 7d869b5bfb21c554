//! The event delivery pipeline.
//!
//! Pre-serialized events arrive through a bounded channel and are batched by
//! a single loop that flushes by count, byte size, or interval. Full batches
//! are handed to short-lived senders fanned out under a semaphore. Closing
//! the pipeline drains the channel, flushes the residual batch and waits for
//! every outstanding sender before returning.
use std::sync::{Arc, Mutex, RwLock};

use reqwest::Method;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{
    Config, HEADER_SOURCE_TOKEN, MAX_BATCH_SIZE, MAX_EVENT_CHAN_SIZE, MAX_HTTP_BODY_SIZE,
};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::http::{HttpClient, RequestOpts};

/// Accumulates serialized events until a batch is full.
#[derive(Default)]
pub(crate) struct MessageQueue {
    pending: Vec<Vec<u8>>,
    body_size: usize,
}

impl MessageQueue {
    pub fn new() -> MessageQueue {
        MessageQueue::default()
    }

    /// Append a message; returns the frozen JSON array when the batch
    /// reached the count or byte-size threshold.
    pub fn push(&mut self, msg: Vec<u8>) -> Option<Vec<u8>> {
        self.body_size += msg.len();
        self.pending.push(msg);
        if self.pending.len() >= MAX_BATCH_SIZE || self.body_size >= MAX_HTTP_BODY_SIZE {
            return self.flush();
        }
        None
    }

    /// Freeze whatever is buffered into a JSON array, or `None` when empty.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            return None;
        }
        let mut body = Vec::with_capacity(self.body_size + self.pending.len() + 2);
        body.push(b'[');
        for (i, msg) in self.pending.iter().enumerate() {
            if i > 0 {
                body.push(b',');
            }
            body.extend_from_slice(msg);
        }
        body.push(b']');
        self.pending.clear();
        self.body_size = 0;
        Some(body)
    }
}

pub(crate) struct PipelineConfig {
    pub endpoint: String,
    pub source_token: String,
    pub track_uri_path: String,
    pub flush_interval: std::time::Duration,
    pub http_concurrency: usize,
    pub http_timeout: std::time::Duration,
    pub http_retry: u32,
    pub on_track_fail: Option<crate::config::OnTrackFail>,
    pub channel_capacity: usize,
}

impl PipelineConfig {
    pub fn from_config(endpoint: &str, source_token: &str, config: &Config) -> PipelineConfig {
        PipelineConfig {
            endpoint: endpoint.to_owned(),
            source_token: source_token.to_owned(),
            track_uri_path: config.track_uri_path.clone(),
            flush_interval: config.flush_interval,
            http_concurrency: config.http_concurrency,
            http_timeout: config.http_timeout,
            http_retry: config.http_retry,
            on_track_fail: config.on_track_fail.clone(),
            channel_capacity: MAX_EVENT_CHAN_SIZE,
        }
    }
}

/// Handle to the batching loop. Submission is nonblocking; closing drains
/// and joins.
pub(crate) struct EventPipeline {
    sender: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl EventPipeline {
    /// Spawn the batching loop on a dedicated thread with its own
    /// current-thread runtime.
    pub fn start(config: PipelineConfig, http: HttpClient) -> std::io::Result<EventPipeline> {
        let (sender, receiver) = mpsc::channel(config.channel_capacity);
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();

        let handle = std::thread::Builder::new()
            .name("abflow-events".to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        log::error!(target: "abflow", "event loop runtime failed to start: {err}");
                        return;
                    }
                };
                runtime.block_on(run_loop(config, http, receiver, loop_cancel));
            })?;

        Ok(EventPipeline {
            sender: RwLock::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
            cancel,
        })
    }

    /// Enqueue a serialized event. Never blocks: a full channel reports
    /// backpressure and a closed pipeline reports closure.
    pub fn submit(&self, msg: Vec<u8>) -> Result<()> {
        let guard = self
            .sender
            .read()
            .expect("thread holding pipeline sender lock should not panic");
        let Some(sender) = guard.as_ref() else {
            return Err(Error::Closed);
        };
        sender.try_send(msg).map_err(|err| match err {
            TrySendError::Full(_) => Error::TooManyRequests,
            TrySendError::Closed(_) => Error::Closed,
        })
    }

    /// Close the input, wait for the loop to drain, flush and join all
    /// senders, then join the loop thread. Idempotent.
    pub fn close(&self) {
        // dropping the sender lets the loop drain the channel and exit
        self.sender
            .write()
            .expect("thread holding pipeline sender lock should not panic")
            .take();

        let handle = self
            .handle
            .lock()
            .expect("thread holding pipeline handle lock should not panic")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        // the residual flush has completed; abort anything still retrying
        self.cancel.cancel();
    }
}

async fn run_loop(
    config: PipelineConfig,
    http: HttpClient,
    mut receiver: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    let config = Arc::new(config);
    let http = Arc::new(http);
    let semaphore = Arc::new(Semaphore::new(config.http_concurrency));
    let mut senders = JoinSet::new();
    let mut queue = MessageQueue::new();

    // the first tick of a plain interval fires immediately; start one period out
    let start = tokio::time::Instant::now() + config.flush_interval;
    let mut tick = tokio::time::interval_at(start, config.flush_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = receiver.recv() => match msg {
                Some(msg) => {
                    if let Some(body) = queue.push(msg) {
                        dispatch(&mut senders, &semaphore, &config, &http, &cancel, body).await;
                    }
                }
                None => {
                    log::debug!(target: "abflow", "event loop closing: draining messages");
                    break;
                }
            },
            _ = tick.tick() => {
                if let Some(body) = queue.flush() {
                    dispatch(&mut senders, &semaphore, &config, &http, &cancel, body).await;
                }
            }
        }
        // reap finished senders as we go
        while senders.try_join_next().is_some() {}
    }

    if let Some(body) = queue.flush() {
        dispatch(&mut senders, &semaphore, &config, &http, &cancel, body).await;
    }
    while senders.join_next().await.is_some() {}
}

/// Acquire a concurrency permit and spawn a sender for the batch.
async fn dispatch(
    senders: &mut JoinSet<()>,
    semaphore: &Arc<Semaphore>,
    config: &Arc<PipelineConfig>,
    http: &Arc<HttpClient>,
    cancel: &CancellationToken,
    body: Vec<u8>,
) {
    let Ok(permit) = semaphore.clone().acquire_owned().await else {
        // the semaphore is never closed
        return;
    };
    let config = Arc::clone(config);
    let http = Arc::clone(http);
    let cancel = cancel.clone();
    senders.spawn(async move {
        let _permit = permit;
        send_batch(&config, &http, &cancel, body).await;
    });
}

async fn send_batch(
    config: &PipelineConfig,
    http: &HttpClient,
    cancel: &CancellationToken,
    body: Vec<u8>,
) {
    let url = format!(
        "{}{}",
        config.endpoint.trim_end_matches('/'),
        config.track_uri_path
    );
    let body_len = body.len();
    let opts = RequestOpts::new(Method::POST, url)
        .with_headers(std::collections::HashMap::from([
            ("Content-Type".to_owned(), "application/json".to_owned()),
            (HEADER_SOURCE_TOKEN.to_owned(), config.source_token.clone()),
        ]))
        .with_body(body.clone())
        .with_timeout(config.http_timeout)
        .with_retry(config.http_retry);

    let failure = match http.request(cancel, &opts).await {
        Ok(response) if response.status.is_success() => {
            log::debug!(target: "abflow", "event batch sent: {body_len} bytes");
            return;
        }
        Ok(response) => Error::HttpStatus(response.status.as_u16()),
        Err(err) => err,
    };

    log::error!(target: "abflow", "event batch send failed: {failure}");
    if let Some(on_track_fail) = &config.on_track_fail {
        let events: Vec<Event> = serde_json::from_slice(&body).unwrap_or_default();
        on_track_fail(events, &failure);
    }
}
