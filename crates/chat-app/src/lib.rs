use std::sync::Arc;

use arbor_core::{ConversationService, StreamingController};
use arbor_llm::create_provider;
use arbor_storage::SqliteStorage;
use snafu::ResultExt;
use tokio::io::BufReader;

pub mod driver;
pub mod error;
pub mod logging;
pub mod settings;

pub use driver::{Command, Console, Driver};
pub use error::{AppError, AppResult};
pub use settings::{Settings, SettingsService};

use crate::error::{EngineSnafu, ProviderSnafu, StorageSnafu};

/// Loads settings, opens storage, and drives the terminal session until `/quit` or EOF.
pub async fn run() -> AppResult<()> {
    let settings = Arc::new(SettingsService::load());
    let current = settings.settings();
    logging::init(&current.log_level);
    tracing::info!(
        config_path = %settings.config_path().display(),
        provider_id = %current.provider.provider_id,
        model = %current.provider.model,
        "starting arbor"
    );

    let database_path = current.storage.database_path.to_string_lossy().into_owned();
    let storage = SqliteStorage::open(&database_path)
        .await
        .context(StorageSnafu {
            stage: "open-storage",
        })?;
    tracing::info!(database_url = %storage.database_url(), "storage opened");
    let service = Arc::new(ConversationService::new(
        Arc::new(storage),
        current.service_config(),
    ));
    service.initialize().await.context(EngineSnafu {
        stage: "initialize-service",
    })?;

    let provider = create_provider(current.provider_config()).context(ProviderSnafu {
        stage: "create-provider",
    })?;
    let controller = StreamingController::new(
        Arc::clone(&service),
        provider,
        current.completion_options(),
    );

    let mut driver = Driver::new(
        Arc::clone(&service),
        controller,
        Arc::clone(&settings),
        Console::stdout(),
    );
    let result = driver.run(BufReader::new(tokio::io::stdin())).await;
    service.dispose();
    result
}
