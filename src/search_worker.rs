//! Bus-driven command loop that owns the [`ServiceManager`].

use log::{debug, error, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::{Receiver, Sender};

use crate::config::Config;
use crate::protocol::{Message, SearchCommand, SearchEvent};
use crate::service_manager::ServiceManager;

pub const INITIALIZATION_SERVICE_NAME: &str = "WorkerInitialization";

pub type ManagerBuilder =
    Box<dyn FnOnce(Sender<Message>) -> std::io::Result<ServiceManager> + Send>;

pub struct SearchWorker {
    bus_consumer: Receiver<Message>,
    bus_producer: Sender<Message>,
    build_manager: Option<ManagerBuilder>,
    initial_search: Option<SearchCommand>,
    manager: Option<ServiceManager>,
}

impl SearchWorker {
    pub fn new(config: Config, bus_consumer: Receiver<Message>, bus_producer: Sender<Message>) -> Self {
        Self::with_manager_builder(
            Box::new(move |bus_producer| ServiceManager::from_config(&config, bus_producer)),
            bus_consumer,
            bus_producer,
        )
    }

    pub fn with_manager_builder(
        build_manager: ManagerBuilder,
        bus_consumer: Receiver<Message>,
        bus_producer: Sender<Message>,
    ) -> Self {
        Self {
            bus_consumer,
            bus_producer,
            build_manager: Some(build_manager),
            initial_search: None,
            manager: None,
        }
    }

    /// Search to start right after the worker reports ready.
    pub fn with_initial_search(mut self, command: SearchCommand) -> Self {
        self.initial_search = Some(command);
        self
    }

    fn emit(&self, event: SearchEvent) {
        let _ = self.bus_producer.send(Message::Event(event));
    }

    fn initialize(&mut self) -> bool {
        let Some(build_manager) = self.build_manager.take() else {
            return self.manager.is_some();
        };
        info!("[SearchWorker] Initializing ServiceManager");
        match build_manager(self.bus_producer.clone()) {
            Ok(manager) => {
                info!(
                    "[SearchWorker] Ready with services: {}",
                    manager.service_names().join(", ")
                );
                self.manager = Some(manager);
                self.emit(SearchEvent::WorkerReady);
                true
            }
            Err(err) => {
                error!("[SearchWorker] Failed to initialize ServiceManager: {}", err);
                self.emit(SearchEvent::ServiceError {
                    service_name: INITIALIZATION_SERVICE_NAME.to_string(),
                    message: format!("Failed to init ServiceManager: {err}"),
                });
                false
            }
        }
    }

    /// Returns false once the worker should stop.
    fn handle_command(&mut self, command: SearchCommand) -> bool {
        let Some(manager) = self.manager.as_ref() else {
            return false;
        };
        match command {
            SearchCommand::Search {
                artist,
                album,
                front_only,
                services,
                batch_size,
            } => {
                manager.start_search(&artist, &album, front_only, &services, batch_size);
            }
            SearchCommand::RequestMore {
                service_name,
                services,
                batch_size,
            } => manager.request_more(&service_name, &services, batch_size),
            SearchCommand::CancelSearch => manager.cancel_search(),
            SearchCommand::Shutdown => {
                info!("[SearchWorker] Shutdown requested");
                return false;
            }
        }
        true
    }

    fn shutdown_manager(&mut self) {
        if let Some(manager) = self.manager.take() {
            manager.shutdown();
        }
        self.emit(SearchEvent::WorkerShutdownComplete);
        info!("[SearchWorker] Shutdown complete");
    }

    pub fn run(&mut self) {
        if !self.initialize() {
            return;
        }
        if let Some(command) = self.initial_search.take() {
            info!("[SearchWorker] Starting initial search");
            self.handle_command(command);
        }

        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(Message::Command(command)) => {
                    debug!("[SearchWorker] Received command: {:?}", command);
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Ok(Message::Event(_)) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("[SearchWorker] bus lagged by {} messages", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        self.shutdown_manager();
    }
}

#[cfg(test)]
mod tests {
    use super::{SearchWorker, INITIALIZATION_SERVICE_NAME};
    use crate::config::ServiceToggle;
    use crate::protocol::{Message, SearchCommand, SearchEvent};
    use crate::service_manager::ServiceManager;
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast::{self, error::TryRecvError, Receiver};

    fn next_event(receiver: &mut Receiver<Message>) -> Option<SearchEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match receiver.try_recv() {
                Ok(Message::Event(event)) => return Some(event),
                Ok(Message::Command(_)) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty) => std::thread::sleep(Duration::from_millis(10)),
                Err(TryRecvError::Closed) => return None,
            }
        }
        None
    }

    #[test]
    fn test_worker_lifecycle() {
        let (bus_producer, _keepalive) = broadcast::channel(64);
        let mut observer = bus_producer.subscribe();
        let worker_consumer = bus_producer.subscribe();
        let worker_producer = bus_producer.clone();
        let handle = std::thread::spawn(move || {
            let mut worker = SearchWorker::with_manager_builder(
                Box::new(|bus| ServiceManager::new(Vec::new(), 3, 5, bus)),
                worker_consumer,
                worker_producer,
            )
            .with_initial_search(SearchCommand::Search {
                artist: String::new(),
                album: "Nevermind".to_string(),
                front_only: true,
                services: vec![ServiceToggle::new("iTunes", true)],
                batch_size: None,
            });
            worker.run();
        });

        assert!(matches!(next_event(&mut observer), Some(SearchEvent::WorkerReady)));
        assert!(matches!(
            next_event(&mut observer),
            Some(SearchEvent::AllSearchesConcluded)
        ));

        bus_producer
            .send(Message::Command(SearchCommand::CancelSearch))
            .expect("send cancel");
        assert!(matches!(
            next_event(&mut observer),
            Some(SearchEvent::AllSearchesConcluded)
        ));

        bus_producer
            .send(Message::Command(SearchCommand::Shutdown))
            .expect("send shutdown");
        assert!(matches!(
            next_event(&mut observer),
            Some(SearchEvent::WorkerShutdownComplete)
        ));
        handle.join().expect("worker thread");
    }

    #[test]
    fn test_initialization_failure_reports_service_error() {
        let (bus_producer, mut observer) = broadcast::channel(16);
        let mut worker = SearchWorker::with_manager_builder(
            Box::new(|_| Err(std::io::Error::other("no threads"))),
            bus_producer.subscribe(),
            bus_producer.clone(),
        );
        worker.run();
        match next_event(&mut observer) {
            Some(SearchEvent::ServiceError {
                service_name,
                message,
            }) => {
                assert_eq!(service_name, INITIALIZATION_SERVICE_NAME);
                assert!(message.contains("no threads"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
