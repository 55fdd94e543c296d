use crate::{config::Config, coordinator::SyncCoordinator, error::AppResult};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: SyncCoordinator,
    pub config: Config,
}

impl AppState {
    pub async fn new(config: Config) -> AppResult<Self> {
        // Assemble the coordinator (metadata store, chunk store, clocks,
        // version store, registry, event log, orchestrator)
        let coordinator = SyncCoordinator::new(config.clone()).await?;
        coordinator.start_offline_sweeper();

        Ok(Self {
            coordinator,
            config,
        })
    }
}
