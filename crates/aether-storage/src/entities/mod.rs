pub mod api_keys;
pub mod dimension_collectors;
pub mod global_models;
pub mod models;
pub mod provider_api_keys;
pub mod provider_endpoints;
pub mod providers;
pub mod usage;
pub mod users;
pub mod video_tasks;

pub use api_keys::Entity as ApiKeys;
pub use dimension_collectors::Entity as DimensionCollectors;
pub use global_models::Entity as GlobalModels;
pub use models::Entity as Models;
pub use provider_api_keys::Entity as ProviderApiKeys;
pub use provider_endpoints::Entity as ProviderEndpoints;
pub use providers::Entity as Providers;
pub use usage::Entity as Usage;
pub use users::Entity as Users;
pub use video_tasks::Entity as VideoTasks;
