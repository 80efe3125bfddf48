//! Event-bus protocol shared by the search worker and its consumers.
//!
//! Consumers send [`SearchCommand`]s; the worker and orchestrator answer
//! with [`SearchEvent`]s on the same broadcast channel.

use crate::config::ServiceToggle;
use crate::models::{ImageResult, PotentialImage};

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Command(SearchCommand),
    Event(SearchEvent),
}

/// Consumer → worker requests.
#[derive(Debug, Clone)]
pub enum SearchCommand {
    Search {
        artist: String,
        album: String,
        front_only: bool,
        services: Vec<ServiceToggle>,
        /// Falls back to the configured batch size when absent.
        batch_size: Option<usize>,
    },
    /// Fill one more batch for a service that reported `has_more`.
    RequestMore {
        service_name: String,
        services: Vec<ServiceToggle>,
        batch_size: Option<usize>,
    },
    CancelSearch,
    Shutdown,
}

/// Worker → consumer notifications.
#[derive(Debug, Clone)]
pub enum SearchEvent {
    WorkerReady,
    ServiceAlbumSearchSucceeded {
        service_name: String,
        num_candidates: usize,
    },
    PotentialImageFound {
        service_name: String,
        potential_image: PotentialImage,
    },
    ImageResolved {
        service_name: String,
        image_result: ImageResult,
    },
    ServiceBatchSucceeded {
        service_name: String,
        has_more: bool,
    },
    ServiceBatchCancelled {
        service_name: String,
    },
    ServiceBatchErrored {
        service_name: String,
        error_message: String,
    },
    ServiceError {
        service_name: String,
        message: String,
    },
    AllSearchesConcluded,
    WorkerShutdownComplete,
}

impl SearchEvent {
    /// Service the event concerns, if it is service-scoped.
    pub fn service_name(&self) -> Option<&str> {
        match self {
            SearchEvent::ServiceAlbumSearchSucceeded { service_name, .. }
            | SearchEvent::PotentialImageFound { service_name, .. }
            | SearchEvent::ImageResolved { service_name, .. }
            | SearchEvent::ServiceBatchSucceeded { service_name, .. }
            | SearchEvent::ServiceBatchCancelled { service_name }
            | SearchEvent::ServiceBatchErrored { service_name, .. }
            | SearchEvent::ServiceError { service_name, .. } => Some(service_name),
            SearchEvent::WorkerReady
            | SearchEvent::AllSearchesConcluded
            | SearchEvent::WorkerShutdownComplete => None,
        }
    }

    /// True for the three events that end a batch fill.
    pub fn is_batch_outcome(&self) -> bool {
        matches!(
            self,
            SearchEvent::ServiceBatchSucceeded { .. }
                | SearchEvent::ServiceBatchCancelled { .. }
                | SearchEvent::ServiceBatchErrored { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::SearchEvent;

    #[test]
    fn test_service_scope_and_batch_outcomes() {
        let cancelled = SearchEvent::ServiceBatchCancelled {
            service_name: "iTunes".to_string(),
        };
        assert_eq!(cancelled.service_name(), Some("iTunes"));
        assert!(cancelled.is_batch_outcome());

        let error = SearchEvent::ServiceError {
            service_name: "Discogs".to_string(),
            message: "boom".to_string(),
        };
        assert!(!error.is_batch_outcome());
        assert_eq!(SearchEvent::AllSearchesConcluded.service_name(), None);
    }
}
