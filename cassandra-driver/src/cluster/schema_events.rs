//! Coalescing of schema change events into schema refreshes.
//!
//! DDL statements tend to come in bursts, and every one of them makes the
//! cluster push a SCHEMA_CHANGE event. Refreshing the schema for each event
//! would read the same system tables over and over, so events are buffered
//! and processed as a batch once they stop arriving (the debounce timer) or
//! once the oldest of them has waited long enough (the window timer).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cassandra_cql::frame::response::event::{SchemaChangeEvent, SchemaChangeType};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// A part of the schema to read again from the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SchemaRefresh {
    /// All keyspaces.
    Full,
    Keyspace {
        keyspace: String,
    },
    Table {
        keyspace: String,
        table: String,
    },
    Type {
        keyspace: String,
        type_name: String,
    },
    Function {
        keyspace: String,
        function_name: String,
        arguments: Vec<String>,
    },
    Aggregate {
        keyspace: String,
        aggregate_name: String,
        arguments: Vec<String>,
    },
}

impl SchemaRefresh {
    /// The refresh that brings the schema up to date after `event`.
    ///
    /// Creating or dropping a keyspace changes the list of keyspaces, and
    /// creating or dropping a table changes the list of tables of its keyspace.
    pub fn for_event(event: &SchemaChangeEvent) -> SchemaRefresh {
        match event {
            SchemaChangeEvent::KeyspaceChange {
                change_type: SchemaChangeType::Updated,
                keyspace_name,
            } => SchemaRefresh::Keyspace {
                keyspace: keyspace_name.clone(),
            },
            SchemaChangeEvent::KeyspaceChange { .. } => SchemaRefresh::Full,
            SchemaChangeEvent::TableChange {
                change_type: SchemaChangeType::Updated,
                keyspace_name,
                object_name,
            } => SchemaRefresh::Table {
                keyspace: keyspace_name.clone(),
                table: object_name.clone(),
            },
            SchemaChangeEvent::TableChange { keyspace_name, .. } => SchemaRefresh::Keyspace {
                keyspace: keyspace_name.clone(),
            },
            SchemaChangeEvent::TypeChange {
                keyspace_name,
                type_name,
                ..
            } => SchemaRefresh::Type {
                keyspace: keyspace_name.clone(),
                type_name: type_name.clone(),
            },
            SchemaChangeEvent::FunctionChange {
                keyspace_name,
                function_name,
                arguments,
                ..
            } => SchemaRefresh::Function {
                keyspace: keyspace_name.clone(),
                function_name: function_name.clone(),
                arguments: arguments.clone(),
            },
            SchemaChangeEvent::AggregateChange {
                keyspace_name,
                aggregate_name,
                arguments,
                ..
            } => SchemaRefresh::Aggregate {
                keyspace: keyspace_name.clone(),
                aggregate_name: aggregate_name.clone(),
                arguments: arguments.clone(),
            },
        }
    }

    /// Keyspace the refresh is limited to. `None` for a full refresh.
    pub fn keyspace(&self) -> Option<&str> {
        match self {
            SchemaRefresh::Full => None,
            SchemaRefresh::Keyspace { keyspace }
            | SchemaRefresh::Table { keyspace, .. }
            | SchemaRefresh::Type { keyspace, .. }
            | SchemaRefresh::Function { keyspace, .. }
            | SchemaRefresh::Aggregate { keyspace, .. } => Some(keyspace),
        }
    }

    // A keyspace refresh in the same batch reads everything inside the keyspace.
    fn is_covered_by(&self, batch: &HashSet<SchemaRefresh>) -> bool {
        match self {
            SchemaRefresh::Full | SchemaRefresh::Keyspace { .. } => false,
            other => other.keyspace().is_some_and(|keyspace| {
                batch.contains(&SchemaRefresh::Keyspace {
                    keyspace: keyspace.to_owned(),
                })
            }),
        }
    }
}

/// Performs schema refreshes. Failures are handled by the implementation.
#[async_trait]
pub(crate) trait SchemaRefresher: Send + Sync {
    async fn refresh_schema(&self, refresh: &SchemaRefresh);
}

/// Buffers incremental refresh requests and runs them in batches.
///
/// A full refresh runs right away and makes every buffered request
/// redundant. Requests that arrive while it runs wait for it to finish:
/// a full refresh among them runs once more, anything else is buffered
/// and the timers start again.
pub(crate) struct SchemaEventCoalescer {
    debounce: Duration,
    window: Duration,
    requests: mpsc::UnboundedReceiver<SchemaRefresh>,
    refresher: Arc<dyn SchemaRefresher>,

    // Deduplicated, in arrival order.
    pending: Vec<SchemaRefresh>,
    debounce_deadline: Option<Instant>,
    window_deadline: Option<Instant>,
}

impl SchemaEventCoalescer {
    pub(crate) fn new(
        debounce: Duration,
        window: Duration,
        refresher: Arc<dyn SchemaRefresher>,
    ) -> (mpsc::UnboundedSender<SchemaRefresh>, Self) {
        let (sender, requests) = mpsc::unbounded_channel();
        let coalescer = SchemaEventCoalescer {
            debounce,
            window,
            requests,
            refresher,
            pending: Vec::new(),
            debounce_deadline: None,
            window_deadline: None,
        };
        (sender, coalescer)
    }

    /// Processes requests until every sender is dropped.
    pub(crate) async fn run(mut self) {
        loop {
            let deadline = match (self.debounce_deadline, self.window_deadline) {
                (Some(debounce), Some(window)) => Some(debounce.min(window)),
                (debounce, window) => debounce.or(window),
            };

            let request = match deadline {
                Some(deadline) => tokio::select! {
                    request = self.requests.recv() => match request {
                        Some(request) => Some(request),
                        None => return,
                    },
                    _ = tokio::time::sleep_until(deadline) => None,
                },
                None => match self.requests.recv().await {
                    Some(request) => Some(request),
                    None => return,
                },
            };

            match request {
                Some(SchemaRefresh::Full) => self.refresh_full().await,
                Some(refresh) => self.buffer(refresh),
                None => self.flush().await,
            }
        }
    }

    fn buffer(&mut self, refresh: SchemaRefresh) {
        trace!("Buffering schema refresh: {:?}", refresh);
        if !self.pending.contains(&refresh) {
            self.pending.push(refresh);
        }
        let now = Instant::now();
        self.debounce_deadline = Some(now + self.debounce);
        self.window_deadline.get_or_insert(now + self.window);
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.debounce_deadline = None;
        self.window_deadline = None;
    }

    async fn refresh_full(&mut self) {
        self.clear();
        loop {
            debug!("Refreshing the whole schema");
            self.refresher.refresh_schema(&SchemaRefresh::Full).await;

            let mut full_again = false;
            while let Ok(request) = self.requests.try_recv() {
                match request {
                    SchemaRefresh::Full => full_again = true,
                    refresh => self.buffer(refresh),
                }
            }
            if !full_again {
                return;
            }
            self.clear();
        }
    }

    async fn flush(&mut self) {
        let batch = std::mem::take(&mut self.pending);
        self.clear();

        let targets: HashSet<SchemaRefresh> = batch.iter().cloned().collect();
        debug!("Processing {} buffered schema refreshes", batch.len());
        for refresh in batch.iter().filter(|r| !r.is_covered_by(&targets)) {
            self.refresher.refresh_schema(refresh).await;
        }
    }
}
