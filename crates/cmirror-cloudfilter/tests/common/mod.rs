//! Shared fixtures: a scripted content source and a host that records
//! everything the engine reports.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use cmirror_cloudfilter::{
    CompletionStatus, EngineConfig, HostError, HydrationEngine, PlaceholderEntry,
    PlaceholderTable, TransferHost,
};
use cmirror_core::{HydrationState, ItemId, PlaceholderId, Revision, TransferKey};
use cmirror_storage::{ContentSource, FetchError, ItemStat, RetryPolicy};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::Semaphore;

pub const MIB: u64 = 1024 * 1024;

/// Deterministic pseudo-random content.
pub fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64).wrapping_mul(31) ^ (i as u64 >> 7)) as u8 ^ seed)
        .collect()
}

#[derive(Default)]
pub struct ScriptedSource {
    items: Mutex<HashMap<String, (Bytes, Option<Revision>)>>,
    /// Consumed, one per call, before any read is served
    read_failures: Mutex<VecDeque<FetchError>>,
    /// When set, every read waits for one permit
    gate: Mutex<Option<Arc<Semaphore>>>,
    pub reads: AtomicU32,
    pub writes: Mutex<Vec<(String, Bytes)>>,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, key: &str, data: Vec<u8>, revision: Option<&str>) {
        self.items.lock().unwrap().insert(
            key.to_string(),
            (Bytes::from(data), revision.map(Revision::new)),
        );
    }

    pub fn fail_next_reads(&self, errors: impl IntoIterator<Item = FetchError>) {
        self.read_failures.lock().unwrap().extend(errors);
    }

    /// Make reads block until permits are added to the returned semaphore.
    pub fn gate_reads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn read_count(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn item(&self, key: &str) -> Option<Bytes> {
        self.items.lock().unwrap().get(key).map(|(b, _)| b.clone())
    }
}

#[async_trait]
impl ContentSource for ScriptedSource {
    async fn read(&self, item: &ItemId, offset: u64, length: u64) -> Result<Bytes, FetchError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        if let Some(err) = self.read_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let items = self.items.lock().unwrap();
        let (data, _) = items
            .get(item.as_str())
            .ok_or_else(|| FetchError::NotFound(item.to_string()))?;
        let start = (offset as usize).min(data.len());
        let end = (offset.saturating_add(length) as usize).min(data.len());
        Ok(data.slice(start..end))
    }

    async fn write(&self, item: &ItemId, data: Bytes) -> Result<Revision, FetchError> {
        let revision = Revision::new(format!("b3:{}", blake3::hash(&data).to_hex()));
        self.writes
            .lock()
            .unwrap()
            .push((item.to_string(), data.clone()));
        self.items
            .lock()
            .unwrap()
            .insert(item.to_string(), (data, Some(revision.clone())));
        Ok(revision)
    }

    async fn stat(&self, item: &ItemId) -> Result<ItemStat, FetchError> {
        let items = self.items.lock().unwrap();
        let (data, revision) = items
            .get(item.as_str())
            .ok_or_else(|| FetchError::NotFound(item.to_string()))?;
        Ok(ItemStat {
            size: data.len() as u64,
            revision: revision.clone(),
        })
    }

    async fn delete(&self, item: &ItemId) -> Result<(), FetchError> {
        self.items.lock().unwrap().remove(item.as_str());
        Ok(())
    }

    async fn rename(&self, from: &ItemId, to: &ItemId) -> Result<Revision, FetchError> {
        let mut items = self.items.lock().unwrap();
        let (data, _) = items
            .remove(from.as_str())
            .ok_or_else(|| FetchError::NotFound(from.to_string()))?;
        let revision = Revision::new(format!("b3:{}", blake3::hash(&data).to_hex()));
        items.insert(to.to_string(), (data, Some(revision.clone())));
        Ok(revision)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Progress {
        key: TransferKey,
        total: u64,
        completed: u64,
        /// Placeholder state observed when progress was reported
        state: Option<HydrationState>,
    },
    Complete {
        key: TransferKey,
        status: CompletionStatus,
    },
}

type ProgressHook = Box<dyn Fn(TransferKey, u64) + Send + Sync>;
type CompleteHook = Box<dyn Fn(TransferKey, CompletionStatus) + Send + Sync>;

#[derive(Default)]
pub struct RecordingHost {
    files: Mutex<HashMap<PlaceholderId, Vec<u8>>>,
    keys: Mutex<HashMap<TransferKey, PlaceholderId>>,
    events: Mutex<Vec<HostEvent>>,
    table: OnceLock<Arc<PlaceholderTable>>,
    on_progress: OnceLock<ProgressHook>,
    on_complete: OnceLock<CompleteHook>,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record placeholder state alongside each progress report.
    pub fn observe(&self, table: Arc<PlaceholderTable>) {
        let _ = self.table.set(table);
    }

    pub fn on_progress(&self, hook: impl Fn(TransferKey, u64) + Send + Sync + 'static) {
        let _ = self.on_progress.set(Box::new(hook));
    }

    pub fn on_complete(
        &self,
        hook: impl Fn(TransferKey, CompletionStatus) + Send + Sync + 'static,
    ) {
        let _ = self.on_complete.set(Box::new(hook));
    }

    pub fn file(&self, id: &PlaceholderId) -> Vec<u8> {
        self.files
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, key: TransferKey) -> Vec<HostEvent> {
        self.events()
            .into_iter()
            .filter(|e| match e {
                HostEvent::Progress { key: k, .. } | HostEvent::Complete { key: k, .. } => *k == key,
            })
            .collect()
    }

    pub fn completions_for(&self, key: TransferKey) -> Vec<CompletionStatus> {
        self.events_for(key)
            .into_iter()
            .filter_map(|e| match e {
                HostEvent::Complete { status, .. } => Some(status),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl TransferHost for RecordingHost {
    async fn transfer_data(
        &self,
        key: TransferKey,
        placeholder: &PlaceholderId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), HostError> {
        self.keys
            .lock()
            .unwrap()
            .insert(key, placeholder.clone());
        let mut files = self.files.lock().unwrap();
        let file = files.entry(placeholder.clone()).or_default();
        let end = offset as usize + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn report_progress(&self, key: TransferKey, total: u64, completed: u64) {
        let state = self.table.get().and_then(|table| {
            let id = self.keys.lock().unwrap().get(&key).cloned()?;
            table.snapshot(&id).map(|e| e.state)
        });
        self.events.lock().unwrap().push(HostEvent::Progress {
            key,
            total,
            completed,
            state,
        });
        if let Some(hook) = self.on_progress.get() {
            hook(key, completed);
        }
    }

    fn complete(&self, key: TransferKey, status: CompletionStatus) {
        self.events
            .lock()
            .unwrap()
            .push(HostEvent::Complete { key, status });
        if let Some(hook) = self.on_complete.get() {
            hook(key, status);
        }
    }
}

pub fn fast_config(chunk_size: u64, attempts: u32) -> EngineConfig {
    EngineConfig {
        chunk_size,
        retry: RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
            timeout: Some(Duration::from_secs(5)),
        },
        max_concurrent: 16,
    }
}

pub fn ghost(key: &str, size: u64, revision: Option<&str>) -> PlaceholderEntry {
    PlaceholderEntry::ghost(
        PlaceholderId::new(key),
        ItemId::new(key),
        size,
        revision.map(Revision::new),
    )
}

pub struct Fixture {
    pub source: Arc<ScriptedSource>,
    pub host: Arc<RecordingHost>,
    pub table: Arc<PlaceholderTable>,
    pub engine: HydrationEngine,
}

impl Fixture {
    pub fn new(config: EngineConfig) -> Self {
        let source = ScriptedSource::new();
        let host = RecordingHost::new();
        let table = Arc::new(PlaceholderTable::new());
        host.observe(table.clone());
        let engine = HydrationEngine::new(source.clone(), host.clone(), table.clone(), config);
        Fixture {
            source,
            host,
            table,
            engine,
        }
    }

    /// Put an item in the remote store and a matching ghost in the table.
    pub fn remote_item(&self, key: &str, data: Vec<u8>, revision: &str) {
        let size = data.len() as u64;
        self.source.put(key, data, Some(revision));
        self.table.insert(ghost(key, size, Some(revision)));
    }
}
