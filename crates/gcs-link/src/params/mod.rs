//! Onboard parameter table: full download, echo-driven updates and deltas.

pub mod category;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use gcs_proto::telemetry::{ParamProgress, ParamSyncState};
use mavlink::common::PARAM_VALUE_DATA;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ParamSyncError, ParamUpdateError, SendError};
use crate::outbound::LinkSender;
use crate::wire;

/// Parameter name to value. Names are unique and ordered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterTable(BTreeMap<String, f32>);

impl ParameterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.0.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f32) -> Option<f32> {
        self.0.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<f32> {
        self.0.remove(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Changes that turn `previous` into `self`.
    pub fn diff(&self, previous: &ParameterTable) -> ParameterDelta {
        ParameterDelta::between(previous, self)
    }
}

impl<S: Into<String>> FromIterator<(S, f32)> for ParameterTable {
    fn from_iter<I: IntoIterator<Item = (S, f32)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParamChange {
    pub old: Option<f32>,
    pub new: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Changed,
}

impl ParamChange {
    pub fn kind(&self) -> ChangeKind {
        match (self.old, self.new) {
            (None, _) => ChangeKind::Added,
            (_, None) => ChangeKind::Removed,
            _ => ChangeKind::Changed,
        }
    }
}

/// Added, changed and removed names between two tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ParameterDelta(BTreeMap<String, ParamChange>);

impl ParameterDelta {
    pub fn between(old: &ParameterTable, new: &ParameterTable) -> Self {
        let mut changes = BTreeMap::new();
        for (name, &before) in &old.0 {
            match new.0.get(name) {
                // Bitwise so that a NaN that stays NaN is not reported as a change.
                Some(&after) if after.to_bits() == before.to_bits() => {}
                Some(&after) => {
                    changes.insert(name.clone(), ParamChange { old: Some(before), new: Some(after) });
                }
                None => {
                    changes.insert(name.clone(), ParamChange { old: Some(before), new: None });
                }
            }
        }
        for (name, &after) in &new.0 {
            if !old.0.contains_key(name) {
                changes.insert(name.clone(), ParamChange { old: None, new: Some(after) });
            }
        }
        Self(changes)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, name: &str) -> Option<&ParamChange> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamChange)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn inverse(&self) -> Self {
        Self(
            self.0
                .iter()
                .map(|(k, c)| (k.clone(), ParamChange { old: c.new, new: c.old }))
                .collect(),
        )
    }

    /// Apply every change to a copy of `table`.
    pub fn apply(&self, table: &ParameterTable) -> ParameterTable {
        let mut out = table.clone();
        for (name, change) in &self.0 {
            match change.new {
                Some(v) => {
                    out.insert(name.clone(), v);
                }
                None => {
                    out.remove(name);
                }
            }
        }
        out
    }
}

/// When a download counts as stalled and how hard to push it.
#[derive(Debug, Clone, Copy)]
pub struct StallPolicy {
    pub timeout: Duration,
    pub retries: u32,
    /// Upper bound on PARAM_REQUEST_READ frames per retry.
    pub batch: usize,
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self { timeout: Duration::from_millis(3000), retries: 3, batch: 32 }
    }
}

pub type CompletionHook = Box<dyn Fn(&ParameterTable) + Send + Sync>;

struct SyncState {
    table: ParameterTable,
    state: ParamSyncState,
    expected: u32,
    seen_indices: BTreeSet<u16>,
    completion_fired: bool,
    last_activity: Instant,
    retries_used: u32,
}

/// Drives PARAM_REQUEST_LIST downloads and applies PARAM_VALUE echoes.
///
/// The local table is written only from `ingest`; `update` just asks the
/// vehicle and waits for its echo like any other PARAM_VALUE.
pub struct ParameterSyncEngine {
    sender: Arc<LinkSender>,
    inner: Mutex<SyncState>,
    policy: StallPolicy,
    on_complete: CompletionHook,
}

impl ParameterSyncEngine {
    pub fn new(sender: Arc<LinkSender>, policy: StallPolicy, on_complete: CompletionHook) -> Self {
        Self {
            sender,
            inner: Mutex::new(SyncState {
                table: ParameterTable::new(),
                state: ParamSyncState::Idle,
                expected: 0,
                seen_indices: BTreeSet::new(),
                completion_fired: false,
                last_activity: Instant::now(),
                retries_used: 0,
            }),
            policy,
            on_complete,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn request_all(&self) -> Result<(), SendError> {
        {
            let mut s = self.lock();
            if s.state != ParamSyncState::Complete || s.table.len() < s.expected as usize {
                s.state = ParamSyncState::Downloading;
            }
            s.seen_indices.clear();
            s.last_activity = Instant::now();
            s.retries_used = 0;
        }
        self.sender.send(&wire::param_request_list(self.sender.target()))?;
        info!("params: requested full list");
        Ok(())
    }

    pub fn ingest(&self, pv: &PARAM_VALUE_DATA) {
        let name = wire::decode_text(&pv.param_id);
        let declared = u32::from(pv.param_count);

        let completed = {
            let mut s = self.lock();
            s.last_activity = Instant::now();

            if declared == 0 {
                s.expected = 0;
                if s.completion_fired {
                    None
                } else {
                    info!("params: vehicle reports no parameters");
                    s.state = ParamSyncState::Complete;
                    s.completion_fired = true;
                    Some(s.table.clone())
                }
            } else {
                if name.is_empty() {
                    debug!("params: PARAM_VALUE without a name, index {}", pv.param_index);
                    return;
                }
                s.expected = declared;
                if u32::from(pv.param_index) < declared {
                    s.seen_indices.insert(pv.param_index);
                }
                s.table.insert(name, pv.param_value);
                if s.state == ParamSyncState::Stalled {
                    s.state = ParamSyncState::Downloading;
                }

                let received = s.table.len() as u32;
                if pv.param_index % 50 == 0 || u32::from(pv.param_index) + 1 == declared {
                    debug!("params: {}/{} ({:.1}%)", received.min(declared), declared, percent(received, declared));
                }

                if received >= declared && s.state != ParamSyncState::Complete {
                    if s.state == ParamSyncState::Downloading {
                        info!("params: all {} received", declared);
                    }
                    s.state = ParamSyncState::Complete;
                }
                if s.state == ParamSyncState::Complete && !s.completion_fired {
                    s.completion_fired = true;
                    Some(s.table.clone())
                } else {
                    None
                }
            }
        };

        if let Some(table) = completed {
            (self.on_complete)(&table);
        }
    }

    /// Ask the vehicle to set `name`. The local table follows its echo.
    pub fn update(&self, name: &str, value: f32) -> Result<(), ParamUpdateError> {
        let id = wire::encode_param_id(name)?;
        self.sender.send(&wire::param_set(self.sender.target(), id, value))?;
        info!("params: set {} = {}", name, value);
        Ok(())
    }

    pub fn table(&self) -> ParameterTable {
        self.lock().table.clone()
    }

    pub fn diff(&self, previous: &ParameterTable) -> ParameterDelta {
        let current = self.table();
        ParameterDelta::between(previous, &current)
    }

    pub fn progress(&self) -> ParamProgress {
        let s = self.lock();
        let received = s.table.len() as u32;
        let pct = if s.state == ParamSyncState::Complete { 100.0 } else { percent(received, s.expected) };
        ParamProgress { state: s.state, received, expected: s.expected, percent: pct }
    }

    pub fn status(&self) -> Result<ParamSyncState, ParamSyncError> {
        let s = self.lock();
        match s.state {
            ParamSyncState::Stalled => Err(ParamSyncError::Stalled { received: s.table.len() as u32, expected: s.expected }),
            other => Ok(other),
        }
    }

    /// Re-request missing indices of a quiet download; after the configured
    /// number of fruitless retries the download is declared stalled.
    pub fn check_stall(&self, now: Instant) -> Result<(), ParamSyncError> {
        let missing: Vec<u16> = {
            let mut s = self.lock();
            if s.state != ParamSyncState::Downloading {
                return Ok(());
            }
            if now.saturating_duration_since(s.last_activity) < self.policy.timeout {
                return Ok(());
            }
            if s.retries_used >= self.policy.retries {
                s.state = ParamSyncState::Stalled;
                let err = ParamSyncError::Stalled { received: s.table.len() as u32, expected: s.expected };
                warn!("params: {}", err);
                return Err(err);
            }
            s.retries_used += 1;
            s.last_activity = now;

            if s.expected == 0 {
                // Not even the first PARAM_VALUE arrived; ask for the whole list again.
                Vec::new()
            } else {
                let upper = s.expected.min(u32::from(u16::MAX)) as u16;
                (0..upper).filter(|i| !s.seen_indices.contains(i)).take(self.policy.batch).collect()
            }
        };

        let target = self.sender.target();
        if missing.is_empty() {
            warn!("params: no PARAM_VALUE yet, re-sending list request");
            if let Err(e) = self.sender.send(&wire::param_request_list(target)) {
                warn!("params: re-request failed: {}", e);
            }
            return Ok(());
        }

        warn!("params: download quiet, re-requesting {} missing indices", missing.len());
        for idx in missing {
            if let Err(e) = self.sender.send(&wire::param_request_read(target, idx)) {
                warn!("params: re-request of index {} failed: {}", idx, e);
                break;
            }
        }
        Ok(())
    }
}

fn percent(received: u32, expected: u32) -> f32 {
    if expected == 0 {
        0.0
    } else {
        (received.min(expected) as f32 / expected as f32) * 100.0
    }
}
