use crate::error::FetchError;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const CANCEL_CHECK_SLICE: Duration = Duration::from_millis(50);
const KNOWN_PLATFORMS: [&str; 3] = ["windows", "macos", "linux"];

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepotFacts {
    pub manifest: String,
    pub size: u64,
}

/// Facts ready to merge. Only built once a build id is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFactSet {
    pub build_id: String,
    pub depots: BTreeMap<String, DepotFacts>,
}

/// One depot line as seen on the source, before filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepotRow {
    pub depot_id: String,
    pub platform: Option<String>,
    pub manifest: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    pub build_id: Option<String>,
    pub depots: Vec<DepotRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PartialDepot {
    manifest: Option<String>,
    size: Option<u64>,
}

/// Facts accumulated across polls of one fetch. Fields are first-seen-wins.
#[derive(Debug, Clone, Default)]
pub struct PartialFacts {
    build_id: Option<String>,
    depots: BTreeMap<String, PartialDepot>,
}

impl PartialFacts {
    pub fn absorb(&mut self, observation: Observation, filter: &PlatformFilter) {
        if self.build_id.is_none() {
            self.build_id = observation
                .build_id
                .filter(|value| !value.trim().is_empty());
        }

        for row in observation.depots {
            if !filter.accepts(row.platform.as_deref()) {
                continue;
            }
            let entry = self.depots.entry(row.depot_id).or_default();
            if entry.manifest.is_none() {
                entry.manifest = row.manifest.filter(|value| !value.is_empty());
            }
            if entry.size.is_none() {
                entry.size = row.size;
            }
        }
    }

    /// `None` until the build id is known. Depots lacking a manifest or a
    /// size are left out of the result.
    pub fn complete(&self) -> Option<UpdateFactSet> {
        let build_id = self.build_id.clone()?;
        let depots = self
            .depots
            .iter()
            .filter_map(|(id, depot)| {
                Some((
                    id.clone(),
                    DepotFacts {
                        manifest: depot.manifest.clone()?,
                        size: depot.size?,
                    },
                ))
            })
            .collect();
        Some(UpdateFactSet { build_id, depots })
    }
}

#[derive(Debug, Clone)]
pub struct PlatformFilter {
    platform: String,
}

impl PlatformFilter {
    pub fn new(platform: &str) -> Self {
        Self {
            platform: platform.trim().to_lowercase(),
        }
    }

    /// Rows without an annotation always pass. Annotated rows pass when the
    /// first element is our platform and nothing after it names another
    /// platform, so `[Windows, English]` passes and `[Windows, macOS]` does not.
    pub fn accepts(&self, annotation: Option<&str>) -> bool {
        let Some(annotation) = annotation else {
            return true;
        };
        let annotation = annotation.trim().trim_start_matches('[').trim_end_matches(']');
        if annotation.trim().is_empty() {
            return true;
        }
        let mut parts = annotation.split(',').map(|part| part.trim().to_lowercase());
        let Some(first) = parts.next() else {
            return true;
        };
        if first != self.platform {
            return false;
        }
        parts.all(|part| !KNOWN_PLATFORMS.contains(&part.as_str()))
    }
}

impl Default for PlatformFilter {
    fn default() -> Self {
        Self::new("Windows")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Complete(UpdateFactSet),
    Cancelled,
}

pub trait UpdateFactFetcher {
    fn fetch(&self, app_id: &str, cancel: &CancelToken) -> Result<FetchOutcome, FetchError>;
}

/// Where observations come from. A session is opened per fetch and dropped
/// when the fetch ends, whatever the outcome.
pub trait FactSource {
    type Session: FactSession;

    fn open(&self, app_id: &str) -> Result<Self::Session, FetchError>;
}

pub trait FactSession {
    /// Missing markup is an empty observation; only load failures are errors.
    fn poll(&mut self) -> Result<Observation, FetchError>;
}

pub struct PollingFetcher<S> {
    source: S,
    filter: PlatformFilter,
    interval: Duration,
}

impl<S: FactSource> PollingFetcher<S> {
    pub fn new(source: S, filter: PlatformFilter) -> Self {
        Self {
            source,
            filter,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl<S: FactSource> UpdateFactFetcher for PollingFetcher<S> {
    fn fetch(&self, app_id: &str, cancel: &CancelToken) -> Result<FetchOutcome, FetchError> {
        if cancel.is_cancelled() {
            return Ok(FetchOutcome::Cancelled);
        }
        let mut session = self.source.open(app_id)?;
        let mut facts = PartialFacts::default();

        loop {
            if cancel.is_cancelled() {
                return Ok(FetchOutcome::Cancelled);
            }
            let observation = session.poll()?;
            facts.absorb(observation, &self.filter);
            if let Some(complete) = facts.complete() {
                return Ok(FetchOutcome::Complete(complete));
            }
            if !sleep_unless_cancelled(self.interval, cancel) {
                return Ok(FetchOutcome::Cancelled);
            }
        }
    }
}

/// Returns false if cancelled before the interval elapsed.
fn sleep_unless_cancelled(interval: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + interval;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_CHECK_SLICE));
    }
}
