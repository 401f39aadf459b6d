//! Messages carried by the service's event bus.

use std::sync::Arc;

use crate::{event_bus::Message, task::SearchTask};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEvent {
    PrepareSearch { query: String },
    StartSearch { query: String },
    StopSearch,
    /// A file appeared on a monitored volume.
    AddPath(String),
    /// A file disappeared, or a search found it missing.
    RemovePath(String),
    AddToCache(String),
    RemoveFromCache(String),
    UpdateIndex { drop_previous: bool },
    Optimize,
    AddSuffix { suffix: String, priority: i32 },
    DeleteSuffix { suffix: String },
    UpdateSuffix {
        old_suffix: String,
        suffix: String,
        priority: i32,
    },
    ClearSuffixes,
    /// Shuts the bus down.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PrepareSearch,
    StartSearch,
    StopSearch,
    AddPath,
    RemovePath,
    AddToCache,
    RemoveFromCache,
    UpdateIndex,
    Optimize,
    AddSuffix,
    DeleteSuffix,
    UpdateSuffix,
    ClearSuffixes,
    Close,
}

/// Search events reply with their task.
pub type Reply = Arc<SearchTask>;

impl Message for IndexEvent {
    type Kind = EventKind;
    type Reply = Reply;

    fn kind(&self) -> EventKind {
        match self {
            Self::PrepareSearch { .. } => EventKind::PrepareSearch,
            Self::StartSearch { .. } => EventKind::StartSearch,
            Self::StopSearch => EventKind::StopSearch,
            Self::AddPath(_) => EventKind::AddPath,
            Self::RemovePath(_) => EventKind::RemovePath,
            Self::AddToCache(_) => EventKind::AddToCache,
            Self::RemoveFromCache(_) => EventKind::RemoveFromCache,
            Self::UpdateIndex { .. } => EventKind::UpdateIndex,
            Self::Optimize => EventKind::Optimize,
            Self::AddSuffix { .. } => EventKind::AddSuffix,
            Self::DeleteSuffix { .. } => EventKind::DeleteSuffix,
            Self::UpdateSuffix { .. } => EventKind::UpdateSuffix,
            Self::ClearSuffixes => EventKind::ClearSuffixes,
            Self::Close => EventKind::Close,
        }
    }

    /// Lifecycle and suffix-table changes must not interleave.
    fn is_blocking(&self) -> bool {
        matches!(
            self,
            Self::UpdateIndex { .. }
                | Self::Optimize
                | Self::AddSuffix { .. }
                | Self::DeleteSuffix { .. }
                | Self::UpdateSuffix { .. }
                | Self::ClearSuffixes
        )
    }

    fn terminal_kind() -> EventKind {
        EventKind::Close
    }
}
