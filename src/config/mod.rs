pub mod schema;

pub use schema::{
    Config, EmbeddingConfig, GatewayConfig, LifecycleConfig, MatchingConfig, ModerationConfig,
    RegistrationConfig, StorageConfig,
};
