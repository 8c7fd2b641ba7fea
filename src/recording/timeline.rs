//! Iteration Timeline
//!
//! Arena of iterations keyed by a monotonically issued id, with explicit
//! state transitions. The timeline owns no I/O; the iteration manager
//! performs directory and writer work and records the outcome here.
//!
//! ## Lifecycle
//!
//! ```text
//! Open ──► Sealing ──► Sealed ──► Archived ──► Queued ──► Delivered
//!   │                    │  │         │           └─────► Failed
//!   └──────► Sealed      │  └──► ArchiveFailed
//!        (forced)        └──► Discarded ◄── Archived (cancel)
//! ```
//!
//! ## Invariants (checked in debug builds)
//!
//! - At most one iteration is `Open`, and it is the most recent one
//! - Ids are dense from 1 to the current index
//! - Only `Open`/`Sealing` iterations hold stream handles

use crate::recording::bundle::PackedBundle;
use crate::recording::clock::Timestamp;
use crate::recording::writer::StreamHandle;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Opaque iteration id; its value is the iteration index (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IterationId(u64);

impl IterationId {
    pub fn index(&self) -> u64 {
        self.0
    }

    /// Id of the iteration with the given index
    pub fn from_index(index: u64) -> Self {
        IterationId(index)
    }
}

impl fmt::Display for IterationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Iteration lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IterationState {
    /// Receiving rows
    Open,
    /// Replaced as write target, straggling rows still draining
    Sealing,
    /// No further writes; awaiting archive
    Sealed,
    /// Bundle produced, working directory removed
    Archived,
    /// Bundling failed, working directory retained
    ArchiveFailed,
    /// Bundle handed to the upload queue
    Queued,
    /// Sink confirmed the bundle
    Delivered,
    /// Bundle abandoned before delivery
    Failed,
    /// Thrown away by a cancel
    Discarded,
}

impl IterationState {
    pub fn can_transition_to(self, next: IterationState) -> bool {
        use IterationState::*;
        matches!(
            (self, next),
            (Open, Sealing)
                | (Open, Sealed)
                | (Sealing, Sealed)
                | (Sealed, Archived)
                | (Sealed, ArchiveFailed)
                | (Sealed, Discarded)
                | (Archived, Queued)
                | (Archived, Discarded)
                | (Queued, Delivered)
                | (Queued, Failed)
        )
    }

    /// Still accepting or draining rows
    pub fn is_unsealed(self) -> bool {
        matches!(self, IterationState::Open | IterationState::Sealing)
    }
}

impl fmt::Display for IterationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Illegal transition request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub id: IterationId,
    /// None when the id is unknown
    pub from: Option<IterationState>,
    pub to: IterationState,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.from {
            Some(from) => write!(
                f,
                "Illegal transition of iteration {}: {} -> {}",
                self.id, from, self.to
            ),
            None => write!(f, "Unknown iteration {} (wanted {})", self.id, self.to),
        }
    }
}

impl std::error::Error for TransitionError {}

/// One rotation window
#[derive(Debug)]
pub struct Iteration {
    id: IterationId,
    dir: PathBuf,
    state: IterationState,
    created_at: Timestamp,
    handles: Vec<StreamHandle>,
    bundle: Option<PackedBundle>,
}

impl Iteration {
    pub fn id(&self) -> IterationId {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state(&self) -> IterationState {
        self.state
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn handles(&self) -> &[StreamHandle] {
        &self.handles
    }

    pub fn bundle(&self) -> Option<&PackedBundle> {
        self.bundle.as_ref()
    }
}

/// Arena of all iterations of one session
#[derive(Debug, Default)]
pub struct Timeline {
    current: u64,
    iterations: BTreeMap<IterationId, Iteration>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the most recently opened iteration, 0 before the first
    pub fn current_index(&self) -> u64 {
        self.current
    }

    pub fn current(&self) -> Option<IterationId> {
        (self.current > 0).then_some(IterationId(self.current))
    }

    /// Id the next `open` must use
    pub fn next_id(&self) -> IterationId {
        IterationId(self.current + 1)
    }

    /// Id of the iteration `back` steps behind `id`, if it exists
    pub fn behind(&self, id: IterationId, back: u64) -> Option<IterationId> {
        let index = id.0.checked_sub(back)?;
        (index > 0).then_some(IterationId(index))
    }

    /// Register the next iteration as `Open`; the previous open one moves
    /// to `Sealing`.
    pub fn open(
        &mut self,
        dir: PathBuf,
        handles: Vec<StreamHandle>,
        created_at: Timestamp,
    ) -> IterationId {
        let id = self.next_id();

        if let Some(prev) = self.current() {
            if self.state(prev) == Some(IterationState::Open) {
                // Open -> Sealing is always legal.
                let _ = self.transition(prev, IterationState::Sealing);
            }
        }

        self.iterations.insert(
            id,
            Iteration {
                id,
                dir,
                state: IterationState::Open,
                created_at,
                handles,
                bundle: None,
            },
        );
        self.current = id.0;

        #[cfg(debug_assertions)]
        self.verify_invariants();

        id
    }

    pub fn transition(
        &mut self,
        id: IterationId,
        to: IterationState,
    ) -> Result<IterationState, TransitionError> {
        let Some(iteration) = self.iterations.get_mut(&id) else {
            return Err(TransitionError { id, from: None, to });
        };
        let from = iteration.state;
        if !from.can_transition_to(to) {
            return Err(TransitionError {
                id,
                from: Some(from),
                to,
            });
        }
        iteration.state = to;
        Ok(from)
    }

    /// Remove and return the stream handles of an iteration
    pub fn take_handles(&mut self, id: IterationId) -> Vec<StreamHandle> {
        self.iterations
            .get_mut(&id)
            .map(|it| std::mem::take(&mut it.handles))
            .unwrap_or_default()
    }

    pub fn set_bundle(&mut self, id: IterationId, bundle: PackedBundle) {
        if let Some(it) = self.iterations.get_mut(&id) {
            it.bundle = Some(bundle);
        }
    }

    pub fn get(&self, id: IterationId) -> Option<&Iteration> {
        self.iterations.get(&id)
    }

    pub fn state(&self, id: IterationId) -> Option<IterationState> {
        self.iterations.get(&id).map(|it| it.state)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Iteration> {
        self.iterations.values()
    }

    pub fn len(&self) -> usize {
        self.iterations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iterations.is_empty()
    }

    /// Ids currently in `state`, ascending
    pub fn ids_in(&self, state: IterationState) -> Vec<IterationId> {
        self.iterations
            .values()
            .filter(|it| it.state == state)
            .map(|it| it.id)
            .collect()
    }

    /// `Open` and `Sealing` ids, ascending
    pub fn unsealed(&self) -> Vec<IterationId> {
        self.iterations
            .values()
            .filter(|it| it.state.is_unsealed())
            .map(|it| it.id)
            .collect()
    }

    #[cfg(debug_assertions)]
    pub fn verify_invariants(&self) {
        let open: Vec<_> = self.ids_in(IterationState::Open);
        assert!(open.len() <= 1, "more than one open iteration: {:?}", open);
        if let Some(id) = open.first() {
            assert_eq!(id.0, self.current, "open iteration is not the current one");
        }

        for (expected, id) in (1..).zip(self.iterations.keys()) {
            assert_eq!(id.0, expected, "iteration ids are not dense");
        }

        for it in self.iterations.values() {
            if !it.state.is_unsealed() {
                assert!(
                    it.handles.is_empty(),
                    "iteration {} in state {} still holds handles",
                    it.id,
                    it.state
                );
            }
        }
    }
}
