//! Duty supervisor
//!
//! Runs the three duties as one task group. The first duty to fail cancels
//! the others and its error is returned once they have all stopped.

use anyhow::{Context, anyhow};
use flotilla_broker::Broker;
use flotilla_store::Store;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::CoordinatorConfig;
use crate::duty::{LostJobFlagger, OrderIntake, ResultReaper};

pub struct Coordinator {
    config: CoordinatorConfig,
    broker: Arc<dyn Broker>,
    store: Arc<dyn Store>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, broker: Arc<dyn Broker>, store: Arc<dyn Store>) -> Self {
        Self {
            config,
            broker,
            store,
        }
    }

    /// Runs all duties until they finish or `token` is cancelled
    pub async fn run(&self, token: CancellationToken) -> anyhow::Result<()> {
        let mut tasks = JoinSet::new();

        let intake = OrderIntake::new(&self.config, self.broker.clone(), self.store.clone());
        let reaper = ResultReaper::new(&self.config, self.broker.clone(), self.store.clone());
        let flagger = LostJobFlagger::new(&self.config, self.store.clone());

        tasks.spawn({
            let token = token.clone();
            async move { intake.run(token).await.context("order intake failed") }
        });
        tasks.spawn({
            let token = token.clone();
            async move { reaper.run(token).await.context("result reaper failed") }
        });
        tasks.spawn({
            let token = token.clone();
            async move { flagger.run(token).await.context("lost-job flagger failed") }
        });

        info!(
            "Coordinator started on queue base '{}' ({})",
            self.config.queue_name,
            if self.config.endless { "endless" } else { "once" }
        );

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| anyhow!("duty task aborted: {}", e))
                .and_then(|result| result);

            if let Err(e) = outcome {
                error!("{:#}", e);
                token.cancel();
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("All duties stopped");
                Ok(())
            }
        }
    }
}
