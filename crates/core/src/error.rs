use std::path::PathBuf;

use snafu::Snafu;

use crate::ids::ConversationId;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("conversation {conversation_id} not found on `{stage}`"))]
    NotFound {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("invalid {id_type} '{raw}' on `{stage}`: {source}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExchangeError {
    #[snafu(display("cannot send an empty message on `{stage}`"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("an exchange is already in flight on `{stage}`"))]
    Busy { stage: &'static str },
    #[snafu(display("exchange store update failed on `{stage}`: {source}"))]
    Store {
        stage: &'static str,
        source: StoreError,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum PersistenceError {
    #[snafu(display("failed to read `{key}` on `{stage}`: {source}"))]
    ReadKey {
        stage: &'static str,
        key: &'static str,
        source: parley_storage::StorageError,
    },
    #[snafu(display("failed to write `{key}` on `{stage}`: {source}"))]
    WriteKey {
        stage: &'static str,
        key: &'static str,
        source: parley_storage::StorageError,
    },
    #[snafu(display("failed to decode conversations on `{stage}`: {source}"))]
    DecodeConversations {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to encode conversations on `{stage}`: {source}"))]
    EncodeConversations {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("stored active conversation id is invalid on `{stage}`: {source}"))]
    DecodeActiveId {
        stage: &'static str,
        source: StoreError,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}
