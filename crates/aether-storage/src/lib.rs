pub mod db;
pub mod entities;
pub mod seaorm;
mod storage;

pub use seaorm::SeaOrmStorage;
pub use storage::{
    CollectorInput, ProviderBundle, Storage, StorageError, StorageResult,
};
