//! # Controller module
//!
//! This module provide the event loop of the operator. A watcher per custom
//! resource kind feeds a local cache and a deduplicating work queue keyed by
//! `namespace/name`, a fixed pool of workers drains the queue and calls the
//! handler of the kind with the current state of the object.

use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Display, Formatter},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    runtime::{
        reflector::{self, ObjectRef, Store},
        watcher,
    },
    Api, ResourceExt,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
#[cfg(feature = "trace")]
use tracing::Instrument;

use crate::svc::{
    controller::queue::WorkQueue,
    k8s::{cluster::Object, resource},
};

pub mod queue;

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static RECONCILIATION_SUCCESS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_success",
            "number of successful reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_success' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_FAILED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_failed",
            "number of failed reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_failed' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_EVENT: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_event",
            "number of handled event"
        ),
        &["kind", "namespace", "event"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_event' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_DURATION: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_duration",
            "duration of reconciliation"
        ),
        &["kind", "unit"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_duration' to not be already registered")
});

#[cfg(feature = "metrics")]
static QUEUE_ADDED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_queue_added",
            "number of key added to the work queue"
        ),
        &["kind"]
    )
    .expect("metrics 'kubernetes_operator_queue_added' to not be already registered")
});

#[cfg(feature = "metrics")]
static QUEUE_REQUEUED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_queue_requeued",
            "number of key requeued after a failure"
        ),
        &["kind"]
    )
    .expect("metrics 'kubernetes_operator_queue_requeued' to not be already registered")
});

// -----------------------------------------------------------------------------
// EventKind enumeration

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum EventKind {
    Added,
    Updated,
    Deleted,
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Updated => write!(f, "updated"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

impl EventKind {
    /// combine a pending event with a newer one for the same key, a deletion
    /// wins over anything, a re-creation after a deletion is an addition
    pub fn merge(self, next: Self) -> Self {
        match (self, next) {
            (_, Self::Deleted) => Self::Deleted,
            (Self::Updated, Self::Updated) => Self::Updated,
            _ => Self::Added,
        }
    }
}

// -----------------------------------------------------------------------------
// Event enumeration

/// notification about an object of the kind watched by a [`Dispatcher`]
#[derive(Clone, Debug)]
pub enum Event<K> {
    Added(Arc<K>),
    Updated(Arc<K>),
    Deleted(Arc<K>),
}

impl<K> Event<K>
where
    K: Object,
{
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Added(_) => EventKind::Added,
            Self::Updated(_) => EventKind::Updated,
            Self::Deleted(_) => EventKind::Deleted,
        }
    }

    pub fn object(&self) -> &Arc<K> {
        match self {
            Self::Added(obj) | Self::Updated(obj) | Self::Deleted(obj) => obj,
        }
    }

    /// returns the `namespace/name` key of the object
    pub fn key(&self) -> String {
        resource::key(&**self.object())
    }
}

fn object_ref<K: Object>(key: &str) -> ObjectRef<K> {
    match key.split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() => ObjectRef::new(name).within(namespace),
        Some((_, name)) => ObjectRef::new(name),
        None => ObjectRef::new(key),
    }
}

// -----------------------------------------------------------------------------
// Handler trait

/// callbacks of a custom resource kind, they receive the current state of
/// the object read from the local cache
#[async_trait]
pub trait Handler<K>: Send + Sync + 'static
where
    K: Object,
{
    type Error: std::error::Error + Send + Sync;

    async fn created(&self, obj: Arc<K>) -> Result<(), Self::Error>;

    async fn updated(&self, obj: Arc<K>) -> Result<(), Self::Error>;

    /// receives the last known state of the deleted object
    async fn deleted(&self, obj: Arc<K>) -> Result<(), Self::Error>;

    /// called with the error returned by one of the other callbacks
    async fn failed(&self, obj: Arc<K>, err: &Self::Error);
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to join worker, {0}")]
    Join(tokio::task::JoinError),
}

// -----------------------------------------------------------------------------
// Dispatcher structure

/// pending event of a key with the last known object, which is the only
/// state left of it once deleted
type Pending<K> = (EventKind, Arc<K>);

pub struct Dispatcher<K, H>
where
    K: Object,
{
    handler: Arc<H>,
    queue: Arc<WorkQueue<String>>,
    store: Store<K>,
    writer: Mutex<reflector::store::Writer<K>>,
    pending: Mutex<BTreeMap<String, Pending<K>>>,
    threadiness: usize,
    max_retries: u32,
}

impl<K, H> Dispatcher<K, H>
where
    K: Object,
    H: Handler<K>,
{
    pub fn new(handler: Arc<H>, threadiness: usize, max_retries: u32) -> Self {
        let (store, writer) = reflector::store();

        Self {
            handler,
            queue: Arc::new(WorkQueue::default()),
            store,
            writer: Mutex::new(writer),
            pending: Mutex::new(BTreeMap::new()),
            threadiness: threadiness.max(1),
            max_retries,
        }
    }

    fn pending(&self) -> MutexGuard<'_, BTreeMap<String, Pending<K>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn queue(&self) -> &Arc<WorkQueue<String>> {
        &self.queue
    }

    /// returns the cached object of the key
    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        self.store.get(&object_ref(key))
    }

    /// update the cache with a watch event and queue the resulting events
    pub fn observe(&self, event: watcher::Event<K>) {
        let events = match &event {
            watcher::Event::Applied(obj) => {
                let key = resource::key(obj);
                let obj = Arc::new(obj.to_owned());
                if self.get(&key).is_some() {
                    vec![Event::Updated(obj)]
                } else {
                    vec![Event::Added(obj)]
                }
            }
            watcher::Event::Deleted(obj) => vec![Event::Deleted(Arc::new(obj.to_owned()))],
            watcher::Event::Restarted(objs) => {
                let mut events: Vec<Event<K>> = objs
                    .iter()
                    .map(|obj| match self.get(&resource::key(obj)) {
                        Some(_) => Event::Updated(Arc::new(obj.to_owned())),
                        None => Event::Added(Arc::new(obj.to_owned())),
                    })
                    .collect();

                // objects deleted while the watch was down
                let live: Vec<String> = objs.iter().map(resource::key).collect();
                events.extend(
                    self.store
                        .state()
                        .into_iter()
                        .filter(|obj| !live.contains(&resource::key(&**obj)))
                        .map(Event::Deleted),
                );

                events
            }
        };

        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply_watcher_event(&event);

        for event in events {
            self.enqueue(event);
        }
    }

    /// queue an event, events of a key which is already waiting collapse
    /// into a single slot
    pub fn enqueue(&self, event: Event<K>) {
        let key = event.key();
        let kind = event.kind();

        trace!(
            kind = K::kind(&()).as_ref(),
            key = &key,
            event = kind.to_string(),
            "Receive event"
        );

        {
            let mut pending = self.pending();
            let merged = match pending.get(&key) {
                Some((previous, _)) => previous.merge(kind),
                None => kind,
            };

            pending.insert(key.to_owned(), (merged, event.object().to_owned()));
        }

        if self.queue.add(key) {
            #[cfg(feature = "metrics")]
            QUEUE_ADDED.with_label_values(&[K::kind(&()).as_ref()]).inc();
        }
    }

    /// take the next key from the queue and handle it, returns false once
    /// the queue is shut down
    pub async fn process_next(&self) -> bool {
        let key = match self.queue.get().await {
            Some(key) => key,
            None => return false,
        };

        self.process(&key).await;
        self.queue.done(&key);
        true
    }

    async fn process(&self, key: &str) {
        let kind = K::kind(&()).to_string();
        let begin = Instant::now();

        // ---------------------------------------------------------------------
        // Step 1: resolve the event against the current state of the object
        let pending = self.pending().remove(key);
        let current = self.get(key);
        let event = match (pending, current) {
            (Some((EventKind::Deleted, _)), Some(obj)) => Event::Added(obj),
            (Some((EventKind::Deleted, tombstone)), None) => Event::Deleted(tombstone),
            (Some((EventKind::Added, _)), Some(obj)) => Event::Added(obj),
            (Some((EventKind::Updated, _)), Some(obj)) | (None, Some(obj)) => Event::Updated(obj),
            (_, None) => {
                debug!(kind = &kind, key = key, "Object is gone from the cache, skip event");
                return;
            }
        };

        let (namespace, name) = (
            event.object().namespace().unwrap_or_default(),
            event.object().name_any(),
        );

        info!(
            kind = &kind,
            namespace = &namespace,
            name = &name,
            event = event.kind().to_string(),
            "Handle event for custom resource"
        );

        #[cfg(feature = "metrics")]
        RECONCILIATION_EVENT
            .with_label_values(&[&kind, &namespace, &event.kind().to_string()])
            .inc();

        // ---------------------------------------------------------------------
        // Step 2: call the handler
        let result = match &event {
            Event::Added(obj) => self.handler.created(obj.to_owned()).await,
            Event::Updated(obj) => self.handler.updated(obj.to_owned()).await,
            Event::Deleted(obj) => self.handler.deleted(obj.to_owned()).await,
        };

        #[cfg(feature = "metrics")]
        RECONCILIATION_DURATION
            .with_label_values(&[&kind, "us"])
            .inc_by(Instant::now().duration_since(begin).as_micros() as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = begin;

        // ---------------------------------------------------------------------
        // Step 3: report the failure and maybe retry
        match result {
            Ok(()) => {
                info!(kind = &kind, namespace = &namespace, name = &name, "Successfully reconcile resource");
                #[cfg(feature = "metrics")]
                RECONCILIATION_SUCCESS.with_label_values(&[&kind]).inc();

                self.queue.forget(&key.to_string());
            }
            Err(err) => {
                error!(
                    kind = &kind,
                    namespace = &namespace,
                    name = &name,
                    error = err.to_string(),
                    "Failed to reconcile resource"
                );
                #[cfg(feature = "metrics")]
                RECONCILIATION_FAILED.with_label_values(&[&kind]).inc();

                self.handler.failed(event.object().to_owned(), &err).await;
                self.retry(key, event);
            }
        }
    }

    fn retry(&self, key: &str, event: Event<K>) {
        let key = key.to_string();
        if self.max_retries == 0 || self.queue.num_requeues(&key) >= self.max_retries {
            self.queue.forget(&key);
            return;
        }

        warn!(
            kind = K::kind(&()).as_ref(),
            key = &key,
            attempt = self.queue.num_requeues(&key) + 1,
            "Requeue failed reconciliation"
        );

        #[cfg(feature = "metrics")]
        QUEUE_REQUEUED.with_label_values(&[K::kind(&()).as_ref()]).inc();

        self.pending()
            .entry(key.to_owned())
            .or_insert_with(|| (event.kind(), event.object().to_owned()));

        self.queue.add_rate_limited(key);
    }

    /// spawn the workers, watch the kind through the api and dispatch events
    /// until the token is cancelled
    pub async fn run(self: Arc<Self>, api: Api<K>, token: CancellationToken) -> Result<(), Error> {
        let kind = K::kind(&()).to_string();

        // ---------------------------------------------------------------------
        // Step 1: start workers
        let mut workers = vec![];
        for id in 0..self.threadiness {
            let dispatcher = self.to_owned();
            let worker = async move {
                debug!(worker = id, "Start worker");
                while dispatcher.process_next().await {}
                debug!(worker = id, "Stop worker");
            };

            #[cfg(feature = "trace")]
            let worker = worker.instrument(tracing::info_span!("Dispatcher::worker", id));

            workers.push(tokio::spawn(worker));
        }

        // ---------------------------------------------------------------------
        // Step 2: watch events
        info!(kind = &kind, threadiness = self.threadiness, "Start to listen for events of custom resource");
        let mut stream = watcher(api, watcher::Config::default()).boxed();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => self.observe(event),
                    Some(Err(err)) => {
                        warn!(kind = &kind, error = err.to_string(), "Failed to watch custom resource, retrying");
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = sleep(Duration::from_secs(1)) => {}
                        }
                    }
                    None => {
                        debug!(kind = &kind, "We have reached the end of the infinite watch stream");
                        break;
                    }
                },
            }
        }

        // ---------------------------------------------------------------------
        // Step 3: stop workers
        info!(kind = &kind, "Stop to listen for events of custom resource");
        self.queue.shutdown();
        for worker in workers {
            worker.await.map_err(Error::Join)?;
        }

        Ok(())
    }
}
