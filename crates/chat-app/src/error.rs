use arbor_core::EngineError;
use arbor_llm::ProviderError;
use arbor_storage::StorageError;
use snafu::Snafu;

use crate::settings::SettingsError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("{details}"))]
    InvalidCommand {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("no conversation is open, use /new or /open <n>"))]
    NoConversation { stage: &'static str },
    #[snafu(display("there is no entry {index} (1..={len})"))]
    IndexOutOfRange {
        stage: &'static str,
        index: usize,
        len: usize,
    },
    #[snafu(display("{source}"))]
    Engine {
        stage: &'static str,
        source: EngineError,
    },
    #[snafu(display("failed to open storage on `{stage}`, {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to create provider on `{stage}`, {source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("{source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to read input on `{stage}`, {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}
