use crate::application::adapter::Verb;
use crate::application::effects::EffectDescriptor;
use crate::domain::entities::Record;
use crate::domain::types::{Identifier, Resource};

/// Pipeline-assigned mutation id, increasing in request order.
pub type MutationId = u64;

/// How a write reaches the cache relative to the network call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationMode {
    /// Cache changes only after the backend confirms.
    Pessimistic,
    /// Cache changes immediately; rolled back if the backend fails.
    Optimistic,
    /// Optimistic, and the backend call waits out the undo delay.
    #[default]
    Undoable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationRequest {
    Create {
        resource: Resource,
        data: Record,
    },
    Update {
        resource: Resource,
        id: Identifier,
        data: Record,
        previous_data: Option<Record>,
    },
    UpdateMany {
        resource: Resource,
        ids: Vec<Identifier>,
        data: Record,
    },
    Delete {
        resource: Resource,
        id: Identifier,
        previous_data: Option<Record>,
    },
    DeleteMany {
        resource: Resource,
        ids: Vec<Identifier>,
    },
}

impl MutationRequest {
    pub fn resource(&self) -> &Resource {
        match self {
            MutationRequest::Create { resource, .. }
            | MutationRequest::Update { resource, .. }
            | MutationRequest::UpdateMany { resource, .. }
            | MutationRequest::Delete { resource, .. }
            | MutationRequest::DeleteMany { resource, .. } => resource,
        }
    }

    pub fn verb(&self) -> Verb {
        match self {
            MutationRequest::Create { .. } => Verb::Create,
            MutationRequest::Update { .. } => Verb::Update,
            MutationRequest::UpdateMany { .. } => Verb::UpdateMany,
            MutationRequest::Delete { .. } => Verb::Delete,
            MutationRequest::DeleteMany { .. } => Verb::DeleteMany,
        }
    }

    /// Whether list entries of the resource must be reloaded after success.
    pub(crate) fn reshapes_collections(&self) -> bool {
        !matches!(self, MutationRequest::Update { .. })
    }
}

/// What the backend returned for a settled mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Record(Record),
    Ids(Vec<Identifier>),
}

impl MutationOutcome {
    pub fn record(&self) -> Option<&Record> {
        match self {
            MutationOutcome::Record(record) => Some(record),
            MutationOutcome::Ids(_) => None,
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            MutationOutcome::Record(record) => Some(record),
            MutationOutcome::Ids(_) => None,
        }
    }

    pub fn into_ids(self) -> Vec<Identifier> {
        match self {
            MutationOutcome::Record(record) => record.id().into_iter().collect(),
            MutationOutcome::Ids(ids) => ids,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationOptions {
    pub mode: MutationMode,
    /// `None` uses [`EffectDescriptor::for_verb`].
    pub effects: Option<EffectDescriptor>,
}

impl MutationOptions {
    pub fn pessimistic() -> Self {
        Self::with_mode(MutationMode::Pessimistic)
    }

    pub fn optimistic() -> Self {
        Self::with_mode(MutationMode::Optimistic)
    }

    pub fn undoable() -> Self {
        Self::with_mode(MutationMode::Undoable)
    }

    pub fn with_mode(mode: MutationMode) -> Self {
        Self {
            mode,
            effects: None,
        }
    }

    pub fn with_effects(mut self, effects: EffectDescriptor) -> Self {
        self.effects = Some(effects);
        self
    }
}
